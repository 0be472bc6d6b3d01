use std::{env, sync::Arc};

use heaptrail::{
  track_allocation, track_deallocation, AllocatorKind, FileSink, FrameCode,
  FrameError, FrameRef, InterpreterShim, PythonAllocatorKind, RecordWriter,
  ThreadHandle, Tracker, TrackerConfig,
};

/// Stand-in interpreter with no managed threads, enough to drive the
/// tracer end to end from the command line.
struct HeadlessShim;

impl InterpreterShim for HeadlessShim {
  fn frame_code(&self, _frame: FrameRef) -> Result<FrameCode, FrameError> {
    Err(FrameError::FunctionName)
  }

  fn frame_lineno(&self, _frame: FrameRef) -> u32 {
    0
  }

  fn is_entry_frame(&self, _frame: FrameRef) -> bool {
    true
  }

  fn current_thread(&self) -> ThreadHandle {
    0
  }

  fn thread_stacks(&self) -> Result<Vec<(ThreadHandle, Vec<FrameRef>)>, FrameError> {
    Ok(Vec::new())
  }

  fn install_profile_hooks(&self) {}

  fn clear_profile_hooks(&self) {}

  fn register_pymalloc_hooks(&self) {}

  fn unregister_pymalloc_hooks(&self) {}
}

fn main() {
  let path = env::temp_dir().join(format!("heaptrail-demo-{}.bin", std::process::id()));

  let sink = FileSink::create(&path).expect("failed to create capture file");
  let command_line = env::args().collect::<Vec<_>>().join(" ");
  let writer = RecordWriter::new(
    Box::new(sink),
    command_line,
    false,
    PythonAllocatorKind::Other,
  );

  Tracker::create(writer, Arc::new(HeadlessShim), TrackerConfig::default())
    .expect("failed to start tracking");

  track_allocation(0x1000, 128, AllocatorKind::Malloc);
  track_allocation(0x2000, 64, AllocatorKind::Malloc);
  track_deallocation(0x2000, 64, AllocatorKind::Free);

  let stats = Tracker::stats().expect("tracker is installed");

  Tracker::destroy();

  let size = std::fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
  println!("=== demo capture ===");
  println!("events recorded: {}", stats.n_allocations);
  println!("capture file:    {} ({size} bytes)", path.display());
}
