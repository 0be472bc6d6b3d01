use std::{
  io::{self, SeekFrom},
  process,
  sync::{Mutex, MutexGuard},
};

use crate::codec::{put_delta, put_varint, DeltaState};
use crate::records::{
  timestamp_ms, token, AllocationRecord, FrameId, HeaderRecord, ImageSegments,
  MemoryRecord, NativeAllocationRecord, PythonAllocatorKind, RawFrame,
  RecordType, ThreadHandle, TrackerStats, UnresolvedNativeFrame,
  CURRENT_HEADER_VERSION, MAGIC,
};
use crate::sink::Sink;

/// Single-writer encoder for the capture stream.
///
/// Owns the sink, the per-stream delta state and the live stats behind one
/// mutex; every record is composed into a scratch buffer and handed to the
/// sink as a single write. A failed write is permanent: callers react by
/// deactivating the tracker, never by retrying.
pub struct RecordWriter {
  inner: Mutex<LockedWriter>,
}

impl RecordWriter {
  #[must_use]
  pub fn new(
    sink: Box<dyn Sink>,
    command_line: String,
    native_traces: bool,
    python_allocator: PythonAllocatorKind,
  ) -> Self {
    let header = HeaderRecord {
      version: CURRENT_HEADER_VERSION,
      native_traces,
      stats: TrackerStats {
        start_time_ms: timestamp_ms(),
        ..TrackerStats::default()
      },
      command_line,
      pid: process::id(),
      python_allocator,
    };

    Self {
      inner: Mutex::new(LockedWriter {
        sink,
        delta: DeltaState::new(),
        header,
        scratch: Vec::with_capacity(4096),
      }),
    }
  }

  /// Ask the sink for a child clone and wrap it in a new writer with the
  /// same command line and native-traces flag but fresh stats and delta
  /// state. `None` if the sink refuses (e.g. a shared mapping).
  ///
  /// Uses `try_lock`: after a fork the mutex may be held by a parent
  /// thread that does not exist in the child, and an unlucky child runs
  /// untraced rather than deadlocking.
  #[must_use]
  pub fn clone_in_child(&self) -> Option<RecordWriter> {
    let inner = self.inner.try_lock().ok()?;

    inner.sink.clone_in_child().map(|sink| {
      RecordWriter::new(
        sink,
        inner.header.command_line.clone(),
        inner.header.native_traces,
        inner.header.python_allocator,
      )
    })
  }

  /// Hold the writer mutex across a multi-record sequence.
  ///
  /// Single-record callers use the typed methods below instead.
  pub fn lock(&self) -> MutexGuard<'_, LockedWriter> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  #[must_use]
  pub fn stats(&self) -> TrackerStats {
    self.lock().header.stats
  }

  /// # Errors
  ///
  /// Fails if `seek_to_start` is requested on a non-seekable sink, or if
  /// the sink write fails.
  pub fn write_header(&self, seek_to_start: bool) -> io::Result<()> {
    self.lock().write_header(seek_to_start)
  }

  /// # Errors
  ///
  /// Fails if the sink write fails.
  pub fn write_trailer(&self) -> io::Result<()> {
    self.lock().write_trailer()
  }

  /// # Errors
  ///
  /// Fails if the sink write or the trailing flush fails.
  pub fn write_memory_record(&self, record: MemoryRecord) -> io::Result<()> {
    self.lock().write_memory_record(record)
  }

  /// # Errors
  ///
  /// Fails if the sink write fails.
  pub fn write_frame_index(&self, frame_id: FrameId, frame: &RawFrame) -> io::Result<()> {
    self.lock().write_frame_index(frame_id, frame)
  }

  /// # Errors
  ///
  /// Fails if the sink write fails.
  pub fn write_unresolved_native_frame(
    &self,
    record: UnresolvedNativeFrame,
  ) -> io::Result<()> {
    self.lock().write_unresolved_native_frame(record)
  }

  /// Emit the current memory map as one atomic sequence.
  ///
  /// # Errors
  ///
  /// Fails if the sink write fails.
  pub fn write_mappings(&self, images: &[ImageSegments]) -> io::Result<()> {
    self.lock().write_mappings(images)
  }

  /// # Errors
  ///
  /// Fails if the sink write fails.
  pub fn write_frame_push(&self, thread: ThreadHandle, frame_id: FrameId) -> io::Result<()> {
    self.lock().write_frame_push(thread, frame_id)
  }

  /// # Errors
  ///
  /// Fails if the sink write fails.
  pub fn write_frame_pop(&self, thread: ThreadHandle, count: u32) -> io::Result<()> {
    self.lock().write_frame_pop(thread, count)
  }

  /// # Errors
  ///
  /// Fails if the sink write fails.
  pub fn write_allocation(
    &self,
    thread: ThreadHandle,
    record: AllocationRecord,
  ) -> io::Result<()> {
    self.lock().write_allocation(thread, record)
  }

  /// # Errors
  ///
  /// Fails if the sink write fails.
  pub fn write_native_allocation(
    &self,
    thread: ThreadHandle,
    record: NativeAllocationRecord,
  ) -> io::Result<()> {
    self.lock().write_native_allocation(thread, record)
  }

  /// # Errors
  ///
  /// Fails if the sink write fails.
  pub fn write_thread_name(&self, thread: ThreadHandle, name: &str) -> io::Result<()> {
    self.lock().write_thread_name(thread, name)
  }
}

/// The writer's state while its mutex is held.
///
/// All record methods live here so that multi-record sequences (memory
/// maps, future batched writes) can run under a single acquisition via
/// [`RecordWriter::lock`].
pub struct LockedWriter {
  sink: Box<dyn Sink>,
  delta: DeltaState,
  header: HeaderRecord,
  scratch: Vec<u8>,
}

impl LockedWriter {
  fn commit(&mut self) -> io::Result<()> {
    self.sink.write_all(&self.scratch)
  }

  /// Prefix the scratch buffer with a context switch when `thread` differs
  /// from the last thread written to the stream.
  fn switch_context(&mut self, thread: ThreadHandle) {
    if self.delta.thread_id == thread {
      return;
    }

    self.scratch.push(token(RecordType::ContextSwitch, 0));
    put_delta(&mut self.scratch, &mut self.delta.thread_id, thread);
  }

  pub fn write_header(&mut self, seek_to_start: bool) -> io::Result<()> {
    if seek_to_start {
      self.sink.seek(SeekFrom::Start(0))?;
      self.header.stats.end_time_ms = timestamp_ms();
    }

    // The reader starts from zeroed delta state right after the header.
    self.delta = DeltaState::new();

    self.scratch.clear();
    self.scratch.extend_from_slice(MAGIC);
    self
      .scratch
      .extend_from_slice(&self.header.version.to_ne_bytes());
    self.scratch.push(u8::from(self.header.native_traces));

    let stats = self.header.stats;
    for field in [
      stats.n_allocations,
      stats.n_frames,
      stats.start_time_ms,
      stats.end_time_ms,
    ] {
      self.scratch.extend_from_slice(&field.to_ne_bytes());
    }

    put_cstring(&mut self.scratch, &self.header.command_line);

    self.scratch.extend_from_slice(&self.header.pid.to_ne_bytes());
    self.scratch.push(self.header.python_allocator as u8);

    self.commit()
  }

  pub fn write_trailer(&mut self) -> io::Result<()> {
    self.header.stats.end_time_ms = timestamp_ms();

    self.scratch.clear();
    self.scratch.push(token(RecordType::Trailer, 0));
    self.commit()
  }

  pub fn write_memory_record(&mut self, record: MemoryRecord) -> io::Result<()> {
    self.scratch.clear();
    self.scratch.push(token(RecordType::MemoryRecord, 0));
    put_varint(&mut self.scratch, record.rss);
    put_varint(
      &mut self.scratch,
      record
        .ms_since_epoch
        .saturating_sub(self.header.stats.start_time_ms),
    );

    self.commit()?;
    self.sink.flush()
  }

  pub fn write_frame_index(&mut self, frame_id: FrameId, frame: &RawFrame) -> io::Result<()> {
    self.header.stats.n_frames += 1;

    self.scratch.clear();
    self.scratch.push(token(
      RecordType::FrameIndex,
      u8::from(!frame.is_entry_frame),
    ));
    put_delta(&mut self.scratch, &mut self.delta.frame_index_id, frame_id);
    put_cstring(&mut self.scratch, &frame.function_name);
    put_cstring(&mut self.scratch, &frame.filename);
    put_delta(
      &mut self.scratch,
      &mut self.delta.python_line_number,
      u64::from(frame.lineno),
    );

    self.commit()
  }

  pub fn write_unresolved_native_frame(
    &mut self,
    record: UnresolvedNativeFrame,
  ) -> io::Result<()> {
    self.scratch.clear();
    self.scratch.push(token(RecordType::NativeTraceIndex, 0));
    put_delta(
      &mut self.scratch,
      &mut self.delta.instruction_pointer,
      record.ip,
    );
    put_delta(
      &mut self.scratch,
      &mut self.delta.native_frame_id,
      u64::from(record.index),
    );

    self.commit()
  }

  pub fn write_mappings(&mut self, images: &[ImageSegments]) -> io::Result<()> {
    self.scratch.clear();
    self.scratch.push(token(RecordType::MemoryMapStart, 0));

    for image in images {
      self.scratch.push(token(RecordType::SegmentHeader, 0));
      put_cstring(&mut self.scratch, &image.filename);
      put_varint(&mut self.scratch, image.segments.len() as u64);
      self.scratch.extend_from_slice(&image.addr.to_ne_bytes());

      for segment in &image.segments {
        self.scratch.push(token(RecordType::Segment, 0));
        self.scratch.extend_from_slice(&segment.vaddr.to_ne_bytes());
        put_varint(&mut self.scratch, segment.memsz);
      }
    }

    self.commit()
  }

  pub fn write_frame_push(&mut self, thread: ThreadHandle, frame_id: FrameId) -> io::Result<()> {
    self.scratch.clear();
    self.switch_context(thread);

    self.scratch.push(token(RecordType::FramePush, 0));
    put_delta(&mut self.scratch, &mut self.delta.python_frame_id, frame_id);

    self.commit()
  }

  pub fn write_frame_pop(&mut self, thread: ThreadHandle, mut count: u32) -> io::Result<()> {
    if count == 0 {
      return Ok(());
    }

    self.scratch.clear();
    self.switch_context(thread);

    // One token pops 1..=16 frames; its flags carry the count minus one.
    while count > 0 {
      let batch = count.min(16);
      self
        .scratch
        .push(token(RecordType::FramePop, (batch - 1) as u8));
      count -= batch;
    }

    self.commit()
  }

  pub fn write_allocation(
    &mut self,
    thread: ThreadHandle,
    record: AllocationRecord,
  ) -> io::Result<()> {
    self.header.stats.n_allocations += 1;

    self.scratch.clear();
    self.switch_context(thread);

    self
      .scratch
      .push(token(RecordType::Allocation, record.allocator as u8));
    put_delta(
      &mut self.scratch,
      &mut self.delta.data_pointer,
      record.address as u64,
    );

    if !record.allocator.is_simple_deallocator() {
      put_varint(&mut self.scratch, record.size as u64);
    }

    self.commit()
  }

  pub fn write_native_allocation(
    &mut self,
    thread: ThreadHandle,
    record: NativeAllocationRecord,
  ) -> io::Result<()> {
    self.header.stats.n_allocations += 1;

    self.scratch.clear();
    self.switch_context(thread);

    self.scratch.push(token(
      RecordType::AllocationWithNative,
      record.allocator as u8,
    ));
    put_delta(
      &mut self.scratch,
      &mut self.delta.data_pointer,
      record.address as u64,
    );
    put_varint(&mut self.scratch, record.size as u64);
    put_delta(
      &mut self.scratch,
      &mut self.delta.native_frame_id,
      record.native_frame_id,
    );

    self.commit()
  }

  pub fn write_thread_name(&mut self, thread: ThreadHandle, name: &str) -> io::Result<()> {
    self.scratch.clear();
    self.switch_context(thread);

    self.scratch.push(token(RecordType::ThreadRecord, 0));
    put_cstring(&mut self.scratch, name);

    self.commit()
  }
}

fn put_cstring(buffer: &mut Vec<u8>, value: &str) {
  buffer.extend_from_slice(value.as_bytes());
  buffer.push(0);
}
