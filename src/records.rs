use std::time::{SystemTime, UNIX_EPOCH};

/// First bytes of every capture file.
pub const MAGIC: &[u8] = b"heaptrail";

/// Bumped on any incompatible change to the stream layout.
pub const CURRENT_HEADER_VERSION: u32 = 1;

/// Dense identifier assigned the first time a `RawFrame` value is observed.
pub type FrameId = u64;

/// Opaque identity of an interpreter frame, used only for pop matching.
pub type FrameRef = usize;

/// Identity of an OS thread as it appears on the wire.
pub type ThreadHandle = u64;

/// Record type carried in the high nibble of each one-byte token.
///
/// The values are part of the on-disk format and must never be renumbered.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum RecordType {
  Allocation = 2,
  AllocationWithNative = 3,
  FrameIndex = 4,
  FramePush = 5,
  FramePop = 6,
  NativeTraceIndex = 7,
  MemoryMapStart = 8,
  SegmentHeader = 9,
  Segment = 10,
  ThreadRecord = 11,
  MemoryRecord = 12,
  ContextSwitch = 13,
  Trailer = 14,
}

impl RecordType {
  #[must_use]
  pub fn from_u8(value: u8) -> Option<Self> {
    Some(match value {
      2 => Self::Allocation,
      3 => Self::AllocationWithNative,
      4 => Self::FrameIndex,
      5 => Self::FramePush,
      6 => Self::FramePop,
      7 => Self::NativeTraceIndex,
      8 => Self::MemoryMapStart,
      9 => Self::SegmentHeader,
      10 => Self::Segment,
      11 => Self::ThreadRecord,
      12 => Self::MemoryRecord,
      13 => Self::ContextSwitch,
      14 => Self::Trailer,
      _ => return None,
    })
  }
}

/// Pack a record type and its per-type flags into a token byte.
///
/// The low nibble is either an `AllocatorKind` discriminant, a pop count, or
/// an entry-frame bit depending on the record type; the assertion keeps any
/// of those interpretations inside four bits.
#[must_use]
pub fn token(record_type: RecordType, flags: u8) -> u8 {
  debug_assert!(flags <= 0xF, "token flags must fit the low nibble");
  ((record_type as u8) << 4) | flags
}

/// Split a token byte back into its record type and flags.
#[must_use]
pub fn split_token(byte: u8) -> Option<(RecordType, u8)> {
  RecordType::from_u8(byte >> 4).map(|record_type| (record_type, byte & 0xF))
}

/// Which intercepted entry point produced an allocation event.
///
/// Discriminants occupy 1..=15 so the kind always fits a token's low nibble.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum AllocatorKind {
  Malloc = 1,
  Free = 2,
  Calloc = 3,
  Realloc = 4,
  PosixMemalign = 5,
  AlignedAlloc = 6,
  Memalign = 7,
  Valloc = 8,
  Pvalloc = 9,
  Mmap = 10,
  Munmap = 11,
  PymallocMalloc = 12,
  PymallocCalloc = 13,
  PymallocRealloc = 14,
  PymallocFree = 15,
}

impl AllocatorKind {
  #[must_use]
  pub fn from_u8(value: u8) -> Option<Self> {
    Some(match value {
      1 => Self::Malloc,
      2 => Self::Free,
      3 => Self::Calloc,
      4 => Self::Realloc,
      5 => Self::PosixMemalign,
      6 => Self::AlignedAlloc,
      7 => Self::Memalign,
      8 => Self::Valloc,
      9 => Self::Pvalloc,
      10 => Self::Mmap,
      11 => Self::Munmap,
      12 => Self::PymallocMalloc,
      13 => Self::PymallocCalloc,
      14 => Self::PymallocRealloc,
      15 => Self::PymallocFree,
      _ => return None,
    })
  }

  /// Deallocators that carry no size on the wire.
  #[must_use]
  pub fn is_simple_deallocator(self) -> bool {
    matches!(self, Self::Free | Self::Munmap | Self::PymallocFree)
  }
}

/// Allocator the interpreter itself was configured with, recorded in the
/// header so readers can interpret pymalloc events.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum PythonAllocatorKind {
  Pymalloc = 1,
  PymallocDebug = 2,
  Malloc = 3,
  Other = 4,
}

impl PythonAllocatorKind {
  #[must_use]
  pub fn from_u8(value: u8) -> Option<Self> {
    Some(match value {
      1 => Self::Pymalloc,
      2 => Self::PymallocDebug,
      3 => Self::Malloc,
      4 => Self::Other,
      _ => return None,
    })
  }
}

/// A managed-language frame position.
///
/// Interned by value: two frames with the same function, file and line share
/// one `FrameId`, and a line-number change produces a fresh id.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RawFrame {
  pub function_name: String,
  pub filename: String,
  pub lineno: u32,
  pub is_entry_frame: bool,
}

/// An allocation or deallocation observed on the hot path.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRecord {
  pub address: usize,
  pub size: usize,
  pub allocator: AllocatorKind,
}

/// An allocation annotated with the leaf of a native trace-tree chain.
#[derive(Debug, Clone, Copy)]
pub struct NativeAllocationRecord {
  pub address: usize,
  pub size: usize,
  pub allocator: AllocatorKind,
  pub native_frame_id: u64,
}

/// Resident-set-size sample taken by the background sampler.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRecord {
  pub rss: u64,
  pub ms_since_epoch: u64,
}

/// A novel node in the native trace tree: `index` is the parent node.
#[derive(Debug, Clone, Copy)]
pub struct UnresolvedNativeFrame {
  pub ip: u64,
  pub index: u32,
}

/// One loadable segment of a mapped image.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Segment {
  pub vaddr: u64,
  pub memsz: u64,
}

/// A mapped image and its loadable segments, as emitted by `write_mappings`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ImageSegments {
  pub filename: String,
  pub addr: u64,
  pub segments: Vec<Segment>,
}

/// Live counters kept by the writer and embedded in the header.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerStats {
  pub n_allocations: u64,
  pub n_frames: u64,
  pub start_time_ms: u64,
  pub end_time_ms: u64,
}

/// Header written at stream start and rewritten at teardown when the sink
/// is seekable.
#[derive(Debug, Clone)]
pub struct HeaderRecord {
  pub version: u32,
  pub native_traces: bool,
  pub stats: TrackerStats,
  pub command_line: String,
  pub pid: u32,
  pub python_allocator: PythonAllocatorKind,
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn timestamp_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|duration| duration.as_millis() as u64)
    .unwrap_or_default()
}
