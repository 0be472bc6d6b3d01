//! Core of an in-process memory-allocation tracer.
//!
//! Allocation events intercepted on the hot path are attributed to the
//! embedding interpreter's call stack (mirrored lazily per thread) and,
//! optionally, to a native call stack, then streamed as compact
//! delta-encoded binary records to a sink for offline timeline
//! reconstruction. Binding glue, symbol interception and readers live
//! outside this crate, behind the [`InterpreterShim`], [`SymbolPatcher`]
//! and [`Sink`] contracts.

pub mod codec;

mod frames;
mod maps;
mod native;
mod records;
mod sampler;
mod shadow;
mod shim;
mod sink;
mod tracker;
mod writer;

pub use {
  frames::FrameRegistry,
  native::{NativeTrace, TraceTree},
  records::{
    split_token, timestamp_ms, token, AllocationRecord, AllocatorKind, FrameId,
    FrameRef, HeaderRecord, ImageSegments, MemoryRecord, NativeAllocationRecord,
    PythonAllocatorKind, RawFrame, RecordType, Segment, ThreadHandle,
    TrackerStats, UnresolvedNativeFrame, CURRENT_HEADER_VERSION, MAGIC,
  },
  shadow::{pop_frame, push_frame},
  shim::{FrameCode, FrameError, InterpreterShim, NullPatcher, SymbolPatcher},
  sink::{FileSink, MmapSink, Sink},
  tracker::{
    register_thread_name, track_allocation, track_deallocation,
    update_module_cache, Tracker, TrackerConfig, TrackerError,
  },
  writer::{LockedWriter, RecordWriter},
};
