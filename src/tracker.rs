use std::{
  cell::Cell,
  fmt::{self, Display, Formatter},
  io, ptr,
  sync::{
    atomic::{AtomicBool, AtomicPtr, Ordering},
    Arc, Mutex, Once,
  },
  time::Duration,
};

use log::{debug, error};

use crate::frames::FrameRegistry;
use crate::maps;
use crate::native::{NativeTrace, TraceTree};
use crate::records::{
  AllocationRecord, AllocatorKind, FrameId, NativeAllocationRecord, RawFrame,
  ThreadHandle, TrackerStats, UnresolvedNativeFrame,
};
use crate::sampler::BackgroundSampler;
use crate::shadow::{self, FrameFlush};
use crate::shim::{FrameError, InterpreterShim, NullPatcher, SymbolPatcher};
use crate::writer::RecordWriter;

/// Native frames between the interception hook and the caller that every
/// captured trace skips.
const NATIVE_TRACE_SKIP: usize = 2;

static INSTANCE: AtomicPtr<Tracker> = AtomicPtr::new(ptr::null_mut());
static ACTIVE: AtomicBool = AtomicBool::new(false);
static GLOBAL_INIT: Once = Once::new();

thread_local! {
  // Const-initialized and destructor-free: the guard stays readable during
  // thread teardown, when libc may still call intercepted entry points.
  static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// Scoped flag suppressing tracing of allocations made by tracing code.
pub(crate) struct RecursionGuard;

impl RecursionGuard {
  /// `None` when the calling thread is already inside the tracker.
  pub(crate) fn enter() -> Option<Self> {
    IN_TRACKER.with(|flag| {
      if flag.get() {
        None
      } else {
        flag.set(true);
        Some(Self)
      }
    })
  }

  /// Force the flag for this thread, outside any scope. Used around fork
  /// and for the background worker's whole lifetime.
  pub(crate) fn set_for_current_thread(active: bool) {
    IN_TRACKER.with(|flag| flag.set(active));
  }
}

impl Drop for RecursionGuard {
  fn drop(&mut self) {
    IN_TRACKER.with(|flag| flag.set(false));
  }
}

/// Why a tracker could not be created.
#[derive(Debug)]
pub enum TrackerError {
  /// A tracker already owns the process; destroy it first.
  AlreadyActive,
  /// Sink, header or sampler setup failed.
  Io(io::Error),
  /// A thread's stack could not be reflected during startup.
  Frame(FrameError),
}

impl Display for TrackerError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::AlreadyActive => write!(f, "a tracker is already installed"),
      Self::Io(err) => write!(f, "i/o error during tracker startup: {err}"),
      Self::Frame(err) => write!(f, "failed to capture thread stacks: {err}"),
    }
  }
}

impl std::error::Error for TrackerError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::AlreadyActive => None,
      Self::Io(err) => Some(err),
      Self::Frame(err) => Some(err),
    }
  }
}

impl From<io::Error> for TrackerError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<FrameError> for TrackerError {
  fn from(value: FrameError) -> Self {
    Self::Frame(value)
  }
}

/// Controls what a tracker traces and how it behaves across forks.
#[derive(Clone)]
pub struct TrackerConfig {
  /// Attach a native call stack to every allocation.
  pub native_traces: bool,
  /// Cadence of the background RSS sampler.
  pub memory_interval: Duration,
  /// Re-arm tracing in forked children with a cloned sink.
  pub follow_fork: bool,
  /// Route the interpreter's own allocator domains through the tracer.
  pub trace_python_allocators: bool,
  /// Native symbol interception; defaults to a no-op.
  pub patcher: Arc<dyn SymbolPatcher>,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      native_traces: false,
      memory_interval: Duration::from_millis(10),
      follow_fork: false,
      trace_python_allocators: false,
      patcher: Arc::new(NullPatcher),
    }
  }
}

impl TrackerConfig {
  #[must_use]
  pub fn with_native_traces(mut self, enabled: bool) -> Self {
    self.native_traces = enabled;
    self
  }

  #[must_use]
  pub fn with_memory_interval(mut self, interval: Duration) -> Self {
    self.memory_interval = interval;
    self
  }

  #[must_use]
  pub fn with_follow_fork(mut self, enabled: bool) -> Self {
    self.follow_fork = enabled;
    self
  }

  #[must_use]
  pub fn with_trace_python_allocators(mut self, enabled: bool) -> Self {
    self.trace_python_allocators = enabled;
    self
  }

  #[must_use]
  pub fn with_patcher(mut self, patcher: Arc<dyn SymbolPatcher>) -> Self {
    self.patcher = patcher;
    self
  }
}

impl fmt::Debug for TrackerConfig {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("TrackerConfig")
      .field("native_traces", &self.native_traces)
      .field("memory_interval", &self.memory_interval)
      .field("follow_fork", &self.follow_fork)
      .field("trace_python_allocators", &self.trace_python_allocators)
      .finish_non_exhaustive()
  }
}

/// Process-wide tracing singleton.
///
/// Creation and destruction must be serialized by the embedder (in
/// practice: under the interpreter's global lock). Hot paths reach the
/// instance through an atomic pointer and are gated on the independent
/// `ACTIVE` flag, so the common not-tracing case is a single acquire load.
pub struct Tracker {
  writer: Arc<RecordWriter>,
  shim: Arc<dyn InterpreterShim>,
  config: TrackerConfig,
  frames: FrameRegistry,
  native_trace_tree: Mutex<TraceTree>,
  sampler: Mutex<Option<BackgroundSampler>>,
  started: AtomicBool,
}

impl Tracker {
  /// Install the tracker and start tracing.
  ///
  /// # Errors
  ///
  /// Fails when a tracker already exists, when the header cannot be
  /// written, when thread stacks cannot be captured, or when the
  /// background sampler cannot start. On failure nothing is left
  /// installed.
  pub fn create(
    writer: RecordWriter,
    shim: Arc<dyn InterpreterShim>,
    config: TrackerConfig,
  ) -> Result<(), TrackerError> {
    if !INSTANCE.load(Ordering::Acquire).is_null() {
      return Err(TrackerError::AlreadyActive);
    }

    let tracker = Box::new(Tracker {
      writer: Arc::new(writer),
      shim,
      config,
      frames: FrameRegistry::new(),
      native_trace_tree: Mutex::new(TraceTree::new()),
      sampler: Mutex::new(None),
      started: AtomicBool::new(false),
    });

    // Publish before the hooks go in: interception callbacks are gated on
    // the `ACTIVE` flag and tolerate a half-constructed singleton.
    let pointer = Box::into_raw(tracker);
    INSTANCE.store(pointer, Ordering::Release);

    // SAFETY: the pointer was just created from a live box and is only
    // freed by `destroy`, which the embedder serializes against `create`.
    let tracker = unsafe { &*pointer };

    if let Err(err) = tracker.activate() {
      INSTANCE.store(ptr::null_mut(), Ordering::Release);
      // SAFETY: same provenance as above; `started` is still false so the
      // drop skips teardown of hooks that never went in.
      drop(unsafe { Box::from_raw(pointer) });
      return Err(err);
    }

    Ok(())
  }

  /// Stop tracing and tear the tracker down, finalizing the stream.
  pub fn destroy() {
    let pointer = INSTANCE.swap(ptr::null_mut(), Ordering::AcqRel);
    if pointer.is_null() {
      return;
    }

    // SAFETY: the pointer came from `Box::into_raw` in `create` and was
    // atomically unpublished above, so it is dropped exactly once.
    drop(unsafe { Box::from_raw(pointer) });
  }

  /// Cheap gate checked at the top of every hot path.
  #[must_use]
  pub fn is_active() -> bool {
    ACTIVE.load(Ordering::Acquire)
  }

  /// Stats of the live writer, if a tracker is installed.
  #[must_use]
  pub fn stats() -> Option<TrackerStats> {
    Self::instance().map(|tracker| tracker.writer.stats())
  }

  /// One-way for this tracker: once tracing fails it never resumes, and a
  /// fresh tracker (and generation) is required to trace again.
  pub(crate) fn deactivate() {
    ACTIVE.store(false, Ordering::Release);
  }

  pub(crate) fn instance() -> Option<&'static Tracker> {
    let pointer = INSTANCE.load(Ordering::Acquire);
    if pointer.is_null() {
      None
    } else {
      // SAFETY: non-null means `create` published it and `destroy` has not
      // reclaimed it; embedders serialize lifecycle against hot paths the
      // same way the original design does.
      Some(unsafe { &*pointer })
    }
  }

  pub(crate) fn shim(&self) -> &dyn InterpreterShim {
    self.shim.as_ref()
  }

  fn activate(&self) -> Result<(), TrackerError> {
    GLOBAL_INIT.call_once(|| {
      // SAFETY: the handlers are async-signal-safe by construction (atomic
      // stores and a thread-local flag); registration happens once.
      unsafe {
        libc::pthread_atfork(
          Some(prepare_fork as unsafe extern "C" fn()),
          Some(parent_fork as unsafe extern "C" fn()),
          Some(child_fork as unsafe extern "C" fn()),
        );
      }
    });

    self.writer.write_header(false)?;
    self.emit_module_cache()?;

    {
      let _guard = RecursionGuard::enter();
      shadow::set_native_tracking(self.config.native_traces);
      shadow::start_tracking(self.shim.as_ref())?;

      if self.config.trace_python_allocators {
        self.shim.register_pymalloc_hooks();
      }
      self.config.patcher.overwrite_symbols();
    }

    let sampler =
      BackgroundSampler::start(Arc::clone(&self.writer), self.config.memory_interval)?;
    *lock_sampler(&self.sampler) = Some(sampler);

    self.started.store(true, Ordering::Release);
    ACTIVE.store(true, Ordering::Release);
    debug!("tracking activated");

    Ok(())
  }

  fn emit_module_cache(&self) -> Result<(), TrackerError> {
    if !self.config.native_traces {
      return Ok(());
    }

    let images = maps::collect_image_segments()?;
    self.writer.write_mappings(&images)?;
    Ok(())
  }

  fn track_allocation_impl(&self, address: usize, size: usize, allocator: AllocatorKind) {
    shadow::prepare_for_allocation(self);

    let thread = thread_id();

    if self.config.native_traces {
      let mut trace = NativeTrace::new();
      let mut native_frame_id = 0u64;

      if trace.fill(NATIVE_TRACE_SKIP) {
        let mut tree = lock_tree(&self.native_trace_tree);
        native_frame_id = u64::from(tree.trace_index(trace.ips(), |ip, index| {
          self
            .writer
            .write_unresolved_native_frame(UnresolvedNativeFrame { ip, index })
            .is_ok()
        }));
      }

      let record = NativeAllocationRecord {
        address,
        size,
        allocator,
        native_frame_id,
      };
      if self.writer.write_native_allocation(thread, record).is_err() {
        deactivate_after_write_failure();
      }
    } else {
      let record = AllocationRecord {
        address,
        size,
        allocator,
      };
      if self.writer.write_allocation(thread, record).is_err() {
        deactivate_after_write_failure();
      }
    }
  }

  fn track_deallocation_impl(&self, address: usize, size: usize, allocator: AllocatorKind) {
    let record = AllocationRecord {
      address,
      size,
      allocator,
    };
    if self.writer.write_allocation(thread_id(), record).is_err() {
      deactivate_after_write_failure();
    }
  }

  /// Intern `frame` and stream its index record the first time it is seen.
  pub(crate) fn register_frame(&self, frame: &RawFrame) -> FrameId {
    let (frame_id, inserted) = self.frames.get_or_insert(frame);

    if inserted && self.writer.write_frame_index(frame_id, frame).is_err() {
      deactivate_after_write_failure();
    }

    frame_id
  }
}

impl FrameFlush for Tracker {
  fn flush_pops(&self, count: u32) -> bool {
    if self.writer.write_frame_pop(thread_id(), count).is_err() {
      deactivate_after_write_failure();
      return false;
    }
    true
  }

  fn flush_push(&self, frame: &RawFrame) -> bool {
    let frame_id = self.register_frame(frame);

    if self.writer.write_frame_push(thread_id(), frame_id).is_err() {
      deactivate_after_write_failure();
      return false;
    }
    true
  }
}

impl Drop for Tracker {
  fn drop(&mut self) {
    if !self.started.load(Ordering::Acquire) {
      return;
    }

    let _guard = RecursionGuard::enter();

    Self::deactivate();
    shadow::set_native_tracking(false);

    if let Some(sampler) = lock_sampler(&self.sampler).take() {
      sampler.stop();
    }

    self.config.patcher.restore_symbols();
    if self.config.trace_python_allocators {
      self.shim.unregister_pymalloc_hooks();
    }
    shadow::stop_tracking(self.shim.as_ref());

    // Finalize the stream: trailer, then the header rewrite that lands the
    // final stats in seekable sinks. Non-seekable sinks refuse the seek.
    let _ = self.writer.write_trailer();
    let _ = self.writer.write_header(true);

    debug!("tracking torn down");
  }
}

fn lock_sampler(sampler: &Mutex<Option<BackgroundSampler>>) -> std::sync::MutexGuard<'_, Option<BackgroundSampler>> {
  match sampler.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

fn lock_tree(tree: &Mutex<TraceTree>) -> std::sync::MutexGuard<'_, TraceTree> {
  match tree.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

fn deactivate_after_write_failure() {
  error!("failed to write output, deactivating tracking");
  Tracker::deactivate();
}

fn thread_id() -> ThreadHandle {
  // SAFETY: pthread_self has no preconditions.
  unsafe { libc::pthread_self() as ThreadHandle }
}

/// Record an allocation performed through an intercepted entry point.
pub fn track_allocation(address: usize, size: usize, allocator: AllocatorKind) {
  let Some(_guard) = RecursionGuard::enter() else {
    return;
  };

  if !Tracker::is_active() {
    return;
  }

  if let Some(tracker) = Tracker::instance() {
    tracker.track_allocation_impl(address, size, allocator);
  }
}

/// Record a deallocation performed through an intercepted entry point.
///
/// Kinds that are simple deallocators carry no size on the wire.
pub fn track_deallocation(address: usize, size: usize, allocator: AllocatorKind) {
  let Some(_guard) = RecursionGuard::enter() else {
    return;
  };

  if !Tracker::is_active() {
    return;
  }

  if let Some(tracker) = Tracker::instance() {
    tracker.track_deallocation_impl(address, size, allocator);
  }
}

/// Attach a human-readable name to the calling thread's records.
pub fn register_thread_name(name: &str) {
  let Some(_guard) = RecursionGuard::enter() else {
    return;
  };

  if !Tracker::is_active() {
    return;
  }

  if let Some(tracker) = Tracker::instance() {
    if tracker.writer.write_thread_name(thread_id(), name).is_err() {
      deactivate_after_write_failure();
    }
  }
}

/// Re-emit the memory map after images were loaded or unloaded, and
/// re-apply symbol interception to the new images.
pub fn update_module_cache() {
  let Some(_guard) = RecursionGuard::enter() else {
    return;
  };

  if !Tracker::is_active() {
    return;
  }

  if let Some(tracker) = Tracker::instance() {
    tracker.config.patcher.overwrite_symbols();
    if tracker.emit_module_cache().is_err() {
      deactivate_after_write_failure();
    }
  }
}

extern "C" fn prepare_fork() {
  // Nothing allocated while the process is mid-fork gets traced.
  RecursionGuard::set_for_current_thread(true);
}

extern "C" fn parent_fork() {
  RecursionGuard::set_for_current_thread(false);
}

extern "C" fn child_fork() {
  // Intentionally leak the outgoing tracker. Its destructor must not run
  // here: its mutexes may be held by threads that do not exist in the
  // child, its background worker cannot be joined, and its sink may not
  // survive the fork. The box from `create` is simply never reclaimed.
  let old_pointer = INSTANCE.load(Ordering::Acquire);

  // SAFETY: either null or a tracker leaked for the rest of this process's
  // lifetime, so the reference cannot dangle.
  let old_tracker = unsafe { old_pointer.as_ref() };

  let follows = old_tracker.is_some_and(|tracker| tracker.config.follow_fork);
  if old_tracker.is_none() || !Tracker::is_active() || !follows {
    INSTANCE.store(ptr::null_mut(), Ordering::Release);
    Tracker::deactivate();
    RecursionGuard::set_for_current_thread(false);
    return;
  }

  let old_tracker = old_tracker.expect("checked above");
  let Some(writer) = old_tracker.writer.clone_in_child() else {
    // Unclonable sink: the child runs untraced. The old hooks may still be
    // installed, which is fine as long as they check the active flag.
    INSTANCE.store(ptr::null_mut(), Ordering::Release);
    Tracker::deactivate();
    RecursionGuard::set_for_current_thread(false);
    return;
  };

  INSTANCE.store(ptr::null_mut(), Ordering::Release);
  Tracker::deactivate();

  let shim = Arc::clone(&old_tracker.shim);
  let config = old_tracker.config.clone();
  if let Err(err) = Tracker::create(writer, shim, config) {
    error!("failed to re-arm tracking in forked child: {err}");
  }

  RecursionGuard::set_for_current_thread(false);
}
