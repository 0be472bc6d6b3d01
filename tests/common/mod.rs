//! Shared helpers for the stream tests: a reader for the capture format
//! (maintaining the same delta state machine as the writer) and a scripted
//! interpreter shim.

use std::{
  cell::Cell,
  collections::HashMap,
  path::Path,
  sync::Mutex,
};

use heaptrail::codec::{read_delta, read_varint, DeltaState};
use heaptrail::{
  split_token, AllocatorKind, FrameCode, FrameError, FrameRef, InterpreterShim,
  PythonAllocatorKind, RecordType, ThreadHandle, TrackerStats, MAGIC,
};

#[derive(Debug, Clone)]
pub struct Header {
  pub version: u32,
  pub native_traces: bool,
  pub stats: TrackerStats,
  pub command_line: String,
  pub pid: u32,
  pub python_allocator: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
  ContextSwitch { thread: u64 },
  FrameIndex { id: u64, function_name: String, filename: String, lineno: u64, is_entry: bool },
  FramePush { frame_id: u64 },
  FramePop { count: u32 },
  Allocation { address: u64, size: Option<u64>, allocator: AllocatorKind },
  NativeAllocation { address: u64, size: u64, allocator: AllocatorKind, native_frame_id: u64 },
  NativeFrame { ip: u64, parent: u64 },
  MemoryMapStart,
  SegmentHeader { filename: String, segment_count: u64, addr: u64 },
  Segment { vaddr: u64, memsz: u64 },
  ThreadName { name: String },
  MemoryRecord { rss: u64, elapsed_ms: u64 },
  Trailer,
}

pub struct DecodedStream {
  pub header: Header,
  pub records: Vec<Record>,
}

impl DecodedStream {
  /// Records that matter for stack/allocation assertions; the sampler's
  /// memory records can interleave anywhere and are dropped here.
  pub fn events(&self) -> Vec<Record> {
    self
      .records
      .iter()
      .filter(|record| !matches!(record, Record::MemoryRecord { .. }))
      .cloned()
      .collect()
  }

  pub fn memory_records(&self) -> Vec<(u64, u64)> {
    self
      .records
      .iter()
      .filter_map(|record| match record {
        Record::MemoryRecord { rss, elapsed_ms } => Some((*rss, *elapsed_ms)),
        _ => None,
      })
      .collect()
  }
}

pub fn decode_file(path: &Path) -> DecodedStream {
  decode_stream(&std::fs::read(path).expect("read capture file"))
}

pub fn decode_stream(bytes: &[u8]) -> DecodedStream {
  let mut position = 0;
  let header = decode_header(bytes, &mut position);

  let mut delta = DeltaState::new();
  let mut records = Vec::new();

  while position < bytes.len() {
    let byte = bytes[position];
    position += 1;

    let (record_type, flags) = split_token(byte).expect("valid record token");

    let record = match record_type {
      RecordType::ContextSwitch => Record::ContextSwitch {
        thread: read_delta(bytes, &mut position, &mut delta.thread_id).unwrap(),
      },
      RecordType::FrameIndex => Record::FrameIndex {
        id: read_delta(bytes, &mut position, &mut delta.frame_index_id).unwrap(),
        function_name: read_cstring(bytes, &mut position),
        filename: read_cstring(bytes, &mut position),
        lineno: read_delta(bytes, &mut position, &mut delta.python_line_number).unwrap(),
        is_entry: flags == 0,
      },
      RecordType::FramePush => Record::FramePush {
        frame_id: read_delta(bytes, &mut position, &mut delta.python_frame_id).unwrap(),
      },
      RecordType::FramePop => Record::FramePop {
        count: u32::from(flags) + 1,
      },
      RecordType::Allocation => {
        let allocator = AllocatorKind::from_u8(flags).expect("valid allocator kind");
        let address = read_delta(bytes, &mut position, &mut delta.data_pointer).unwrap();
        let size = if allocator.is_simple_deallocator() {
          None
        } else {
          Some(read_varint(bytes, &mut position).unwrap())
        };
        Record::Allocation { address, size, allocator }
      }
      RecordType::AllocationWithNative => {
        let allocator = AllocatorKind::from_u8(flags).expect("valid allocator kind");
        let address = read_delta(bytes, &mut position, &mut delta.data_pointer).unwrap();
        let size = read_varint(bytes, &mut position).unwrap();
        let native_frame_id =
          read_delta(bytes, &mut position, &mut delta.native_frame_id).unwrap();
        Record::NativeAllocation { address, size, allocator, native_frame_id }
      }
      RecordType::NativeTraceIndex => Record::NativeFrame {
        ip: read_delta(bytes, &mut position, &mut delta.instruction_pointer).unwrap(),
        parent: read_delta(bytes, &mut position, &mut delta.native_frame_id).unwrap(),
      },
      RecordType::MemoryMapStart => Record::MemoryMapStart,
      RecordType::SegmentHeader => {
        let filename = read_cstring(bytes, &mut position);
        let segment_count = read_varint(bytes, &mut position).unwrap();
        let addr = read_ne_u64(bytes, &mut position);
        Record::SegmentHeader { filename, segment_count, addr }
      }
      RecordType::Segment => {
        let vaddr = read_ne_u64(bytes, &mut position);
        let memsz = read_varint(bytes, &mut position).unwrap();
        Record::Segment { vaddr, memsz }
      }
      RecordType::ThreadRecord => Record::ThreadName {
        name: read_cstring(bytes, &mut position),
      },
      RecordType::MemoryRecord => {
        let rss = read_varint(bytes, &mut position).unwrap();
        let elapsed_ms = read_varint(bytes, &mut position).unwrap();
        Record::MemoryRecord { rss, elapsed_ms }
      }
      RecordType::Trailer => {
        records.push(Record::Trailer);
        break;
      }
    };

    records.push(record);
  }

  DecodedStream { header, records }
}

fn decode_header(bytes: &[u8], position: &mut usize) -> Header {
  assert_eq!(&bytes[..MAGIC.len()], MAGIC, "capture must start with the magic");
  *position = MAGIC.len();

  let version = u32::from_ne_bytes(bytes[*position..*position + 4].try_into().unwrap());
  *position += 4;

  let native_traces = bytes[*position] != 0;
  *position += 1;

  let stats = TrackerStats {
    n_allocations: read_ne_u64(bytes, position),
    n_frames: read_ne_u64(bytes, position),
    start_time_ms: read_ne_u64(bytes, position),
    end_time_ms: read_ne_u64(bytes, position),
  };

  let command_line = read_cstring(bytes, position);

  let pid = u32::from_ne_bytes(bytes[*position..*position + 4].try_into().unwrap());
  *position += 4;

  let python_allocator = bytes[*position];
  *position += 1;

  Header {
    version,
    native_traces,
    stats,
    command_line,
    pid,
    python_allocator,
  }
}

fn read_cstring(bytes: &[u8], position: &mut usize) -> String {
  let nul = bytes[*position..]
    .iter()
    .position(|byte| *byte == 0)
    .expect("NUL-terminated string");
  let value = String::from_utf8(bytes[*position..*position + nul].to_vec())
    .expect("utf-8 string");
  *position += nul + 1;
  value
}

fn read_ne_u64(bytes: &[u8], position: &mut usize) -> u64 {
  let value = u64::from_ne_bytes(bytes[*position..*position + 8].try_into().unwrap());
  *position += 8;
  value
}

/// Replay push/pop records and snapshot each thread's stack of frame ids at
/// every allocation record, in stream order.
pub fn stacks_at_allocations(records: &[Record]) -> Vec<(u64, Vec<u64>)> {
  let mut current_thread = 0u64;
  let mut stacks: HashMap<u64, Vec<u64>> = HashMap::new();
  let mut snapshots = Vec::new();

  for record in records {
    match record {
      Record::ContextSwitch { thread } => current_thread = *thread,
      Record::FramePush { frame_id } => {
        stacks.entry(current_thread).or_default().push(*frame_id);
      }
      Record::FramePop { count } => {
        let stack = stacks.entry(current_thread).or_default();
        for _ in 0..*count {
          stack.pop();
        }
      }
      Record::Allocation { .. } | Record::NativeAllocation { .. } => {
        snapshots.push((
          current_thread,
          stacks.get(&current_thread).cloned().unwrap_or_default(),
        ));
      }
      _ => {}
    }
  }

  snapshots
}

thread_local! {
  static CURRENT_THREAD: Cell<ThreadHandle> = const { Cell::new(1) };
}

/// Scriptable stand-in interpreter: frames, line numbers and per-thread
/// stacks are whatever the test says they are.
#[derive(Default)]
pub struct ScriptedShim {
  frames: Mutex<HashMap<FrameRef, (String, String)>>,
  linenos: Mutex<HashMap<FrameRef, u32>>,
  initial_stacks: Mutex<Vec<(ThreadHandle, Vec<FrameRef>)>>,
}

impl ScriptedShim {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn define_frame(&self, frame: FrameRef, function: &str, filename: &str, lineno: u32) {
    self
      .frames
      .lock()
      .unwrap()
      .insert(frame, (function.to_string(), filename.to_string()));
    self.linenos.lock().unwrap().insert(frame, lineno);
  }

  pub fn set_lineno(&self, frame: FrameRef, lineno: u32) {
    self.linenos.lock().unwrap().insert(frame, lineno);
  }

  /// Stacks handed out at tracking start, innermost frame first.
  pub fn set_initial_stacks(&self, stacks: Vec<(ThreadHandle, Vec<FrameRef>)>) {
    *self.initial_stacks.lock().unwrap() = stacks;
  }

  /// Thread handle the shim reports for the calling OS thread.
  pub fn adopt_thread_handle(handle: ThreadHandle) {
    CURRENT_THREAD.with(|cell| cell.set(handle));
  }
}

impl InterpreterShim for ScriptedShim {
  fn frame_code(&self, frame: FrameRef) -> Result<FrameCode, FrameError> {
    let frames = self.frames.lock().unwrap();
    let (function_name, filename) = frames.get(&frame).ok_or(FrameError::FunctionName)?;

    Ok(FrameCode {
      function_name: function_name.clone(),
      filename: filename.clone(),
    })
  }

  fn frame_lineno(&self, frame: FrameRef) -> u32 {
    self
      .linenos
      .lock()
      .unwrap()
      .get(&frame)
      .copied()
      .unwrap_or(0)
  }

  fn is_entry_frame(&self, _frame: FrameRef) -> bool {
    true
  }

  fn current_thread(&self) -> ThreadHandle {
    CURRENT_THREAD.with(Cell::get)
  }

  fn thread_stacks(&self) -> Result<Vec<(ThreadHandle, Vec<FrameRef>)>, FrameError> {
    Ok(self.initial_stacks.lock().unwrap().clone())
  }

  fn install_profile_hooks(&self) {}

  fn clear_profile_hooks(&self) {}

  fn register_pymalloc_hooks(&self) {}

  fn unregister_pymalloc_hooks(&self) {}

  fn python_allocator_kind(&self) -> PythonAllocatorKind {
    PythonAllocatorKind::Pymalloc
  }
}
