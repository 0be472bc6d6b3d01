//! Per-thread mirror of the interpreter call stack.
//!
//! Frame pushes are buffered and only streamed when an allocation observes
//! them; pops are batched into a counter. A process-wide generation counter
//! forces every thread to resynchronize from a centrally captured snapshot
//! whenever tracking is (re)started beneath already-running threads.
//!
//! Thread teardown: the stack lives in a thread local with a destructor.
//! Once that destructor has run, `LocalKey::try_with` fails and every
//! operation here turns into a no-op, so a dying thread can never
//! rematerialize its stack (and never re-registers a destructor on a slot
//! that may already have been reused).

use std::{
  cell::RefCell,
  collections::HashMap,
  sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Mutex, OnceLock,
  },
};

use nohash_hasher::BuildNoHashHasher;

use crate::records::{FrameRef, RawFrame, ThreadHandle};
use crate::shim::{FrameError, InterpreterShim};
use crate::tracker::{RecursionGuard, Tracker};

/// Destination for flushed frame transitions; implemented by the tracker,
/// which interns frames and writes through the record writer.
pub(crate) trait FrameFlush {
  /// Returns false on write failure.
  fn flush_pops(&self, count: u32) -> bool;

  /// Returns false on write failure; the caller stops flushing.
  fn flush_push(&self, frame: &RawFrame) -> bool;
}

#[derive(Debug, Clone)]
struct LazyFrame {
  frame: FrameRef,
  raw: RawFrame,
  emitted: bool,
}

type InitialStackMap = HashMap<ThreadHandle, Vec<LazyFrame>, BuildNoHashHasher<ThreadHandle>>;

static NATIVE_TRACKING: AtomicBool = AtomicBool::new(false);
static GENERATION: AtomicU32 = AtomicU32::new(0);
static INITIAL_STACKS: OnceLock<Mutex<InitialStackMap>> = OnceLock::new();

thread_local! {
  static SHADOW: RefCell<ShadowStack> = RefCell::new(ShadowStack::new());
}

fn initial_stacks() -> &'static Mutex<InitialStackMap> {
  INITIAL_STACKS.get_or_init(|| Mutex::new(HashMap::default()))
}

fn lock_initial_stacks() -> std::sync::MutexGuard<'static, InitialStackMap> {
  match initial_stacks().lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

pub(crate) fn set_native_tracking(enabled: bool) {
  NATIVE_TRACKING.store(enabled, Ordering::Release);
}

fn native_tracking() -> bool {
  NATIVE_TRACKING.load(Ordering::Acquire)
}

#[derive(Debug)]
struct ShadowStack {
  frames: Vec<LazyFrame>,
  pending_pops: u32,
  generation: u32,
}

impl ShadowStack {
  fn new() -> Self {
    Self {
      frames: Vec::new(),
      pending_pops: 0,
      generation: 0,
    }
  }

  /// Line number of the interpreter frame on top of the stack; 0 if empty.
  fn current_lineno(&self, shim: &dyn InterpreterShim) -> u32 {
    self
      .frames
      .last()
      .map_or(0, |top| shim.frame_lineno(top.frame))
  }

  fn push_lazy(&mut self, frame: LazyFrame) {
    self.frames.push(frame);
  }

  fn pop(&mut self, frame: FrameRef, flush: &dyn FrameFlush) {
    // A mismatched top tolerates stale callbacks from transpiled frames
    // that were discarded when a new tracker captured this thread's stack.
    match self.frames.last() {
      Some(top) if top.frame == frame => {}
      _ => return,
    }

    if let Some(top) = self.frames.pop() {
      if top.emitted {
        self.pending_pops += 1;
        debug_assert!(self.pending_pops != 0);
      }
    }

    if self.frames.is_empty() {
      // Every pushed frame is popped; the thread may be exiting, so this
      // is the last reliable chance to drain the counter.
      self.flush_pending_pops(flush);
    }
  }

  /// Record that the top frame now executes at `lineno`. An already
  /// emitted frame must first be popped on the wire so its re-push can
  /// carry the new line.
  fn set_lineno(&mut self, lineno: u32) {
    let Some(top) = self.frames.last_mut() else {
      return;
    };

    if top.raw.lineno == lineno {
      return;
    }

    top.raw.lineno = lineno;

    if top.emitted {
      top.emitted = false;
      self.pending_pops += 1;
      debug_assert!(self.pending_pops != 0);
    }
  }

  fn flush_pending_pops(&mut self, flush: &dyn FrameFlush) {
    if self.pending_pops == 0 {
      return;
    }

    flush.flush_pops(self.pending_pops);
    self.pending_pops = 0;
  }

  fn flush_pending_pushes(&mut self, flush: &dyn FrameFlush) {
    let first_unemitted = self
      .frames
      .iter()
      .rposition(|frame| frame.emitted)
      .map_or(0, |index| index + 1);

    for frame in &mut self.frames[first_unemitted..] {
      if !flush.flush_push(&frame.raw) {
        break;
      }
      frame.emitted = true;
    }
  }

  /// Adopt the centrally captured stack if a new tracker was started since
  /// this thread last synced. Does not require the interpreter lock.
  fn reload_if_generation_changed(&mut self, shim: &dyn InterpreterShim) {
    if self.generation == GENERATION.load(Ordering::Acquire) {
      return;
    }

    // A new tracker captured this thread's stack for us; trust it over
    // anything we hold, which may predate a stop/start cycle.
    self.frames.clear();
    self.pending_pops = 0;

    let captured = {
      let mut map = lock_initial_stacks();
      // Re-read the generation under the lock so a thread that is two
      // starts behind cannot pair the new stacks with an old counter.
      self.generation = GENERATION.load(Ordering::Acquire);
      map.remove(&shim.current_thread())
    };

    if let Some(frames) = captured {
      // Captured innermost-first; push bottom-first so the most recent
      // call ends up on top.
      for frame in frames.into_iter().rev() {
        self.push_lazy(frame);
      }
    }
  }
}

/// Profile-hook entry for a frame call event.
///
/// # Errors
///
/// Returns a [`FrameError`] when the frame's code object cannot be
/// reflected; the push is skipped and no partial frame is recorded.
pub fn push_frame(frame: FrameRef) -> Result<(), FrameError> {
  let Some(_guard) = RecursionGuard::enter() else {
    return Ok(());
  };

  if !Tracker::is_active() {
    return Ok(());
  }

  let Some(tracker) = Tracker::instance() else {
    return Ok(());
  };
  let shim = tracker.shim();

  let code = shim.frame_code(frame)?;

  // With native tracing off every frame counts as an entry frame; readers
  // do not care and it skips a reflection call.
  let is_entry_frame = !native_tracking() || shim.is_entry_frame(frame);

  let _ = SHADOW.try_with(|cell| {
    let mut shadow = cell.borrow_mut();
    shadow.reload_if_generation_changed(shim);

    let parent_lineno = shadow.current_lineno(shim);
    shadow.set_lineno(parent_lineno);

    shadow.push_lazy(LazyFrame {
      frame,
      raw: RawFrame {
        function_name: code.function_name,
        filename: code.filename,
        lineno: 0,
        is_entry_frame,
      },
      emitted: false,
    });
  });

  Ok(())
}

/// Profile-hook entry for a frame return event. Unmatched frames are
/// ignored.
pub fn pop_frame(frame: FrameRef) {
  let Some(_guard) = RecursionGuard::enter() else {
    return;
  };

  if !Tracker::is_active() {
    return;
  }

  let Some(tracker) = Tracker::instance() else {
    return;
  };

  let _ = SHADOW.try_with(|cell| {
    let mut shadow = cell.borrow_mut();
    shadow.reload_if_generation_changed(tracker.shim());
    shadow.pop(frame, tracker);
  });
}

/// Bring this thread's wire stack up to date before an allocation record:
/// refresh the top frame's line, drain batched pops, emit buffered pushes.
pub(crate) fn prepare_for_allocation(tracker: &Tracker) {
  let _ = SHADOW.try_with(|cell| {
    let mut shadow = cell.borrow_mut();
    shadow.reload_if_generation_changed(tracker.shim());

    let lineno = shadow.current_lineno(tracker.shim());
    shadow.set_lineno(lineno);

    shadow.flush_pending_pops(tracker);
    shadow.flush_pending_pushes(tracker);
  });
}

/// Capture every thread's stack and direct all shadows to resync.
///
/// Must run while the caller holds the interpreter's global lock, so no
/// stack can change between the capture and the hook installation and no
/// thread can observe tracking-enabled with an empty shadow.
///
/// # Errors
///
/// Returns a [`FrameError`] if any thread's stack cannot be reflected; no
/// hooks are installed in that case.
pub(crate) fn start_tracking(shim: &dyn InterpreterShim) -> Result<(), FrameError> {
  // Clear any leftover hooks first: a previous profile callback could
  // otherwise fire between the capture and our installation.
  shim.clear_profile_hooks();

  let mut captured: InitialStackMap = HashMap::default();

  for (thread, frames) in shim.thread_stacks()? {
    let mut stack = Vec::with_capacity(frames.len());

    for frame in frames {
      let code = shim.frame_code(frame)?;
      let is_entry_frame = !native_tracking() || shim.is_entry_frame(frame);

      stack.push(LazyFrame {
        frame,
        raw: RawFrame {
          function_name: code.function_name,
          filename: code.filename,
          lineno: shim.frame_lineno(frame),
          is_entry_frame,
        },
        emitted: false,
      });
    }

    captured.insert(thread, stack);
  }

  // The current thread is inside the tracker-start call; everything above
  // its innermost frame is tracker machinery the capture must not keep.
  if let Some(stack) = captured.get_mut(&shim.current_thread()) {
    stack.truncate(1);
  }

  {
    let mut map = lock_initial_stacks();
    *map = captured;
    // Published together with the map so shadows never pair new stacks
    // with a stale counter.
    GENERATION.fetch_add(1, Ordering::Release);
  }

  shim.install_profile_hooks();

  Ok(())
}

/// Remove profile hooks and drop any unconsumed captured stacks. Must run
/// while the caller holds the interpreter's global lock.
pub(crate) fn stop_tracking(shim: &dyn InterpreterShim) {
  shim.clear_profile_hooks();
  lock_initial_stacks().clear();
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::shim::FrameCode;
  use std::sync::Mutex;

  struct StubShim {
    linenos: Mutex<HashMap<FrameRef, u32>>,
  }

  impl StubShim {
    fn new() -> Self {
      Self {
        linenos: Mutex::new(HashMap::new()),
      }
    }

    fn set_frame_lineno(&self, frame: FrameRef, lineno: u32) {
      self.linenos.lock().unwrap().insert(frame, lineno);
    }
  }

  impl InterpreterShim for StubShim {
    fn frame_code(&self, frame: FrameRef) -> Result<FrameCode, FrameError> {
      Ok(FrameCode {
        function_name: format!("fn_{frame}"),
        filename: "mod.py".to_string(),
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
      1
    }

    fn thread_stacks(&self) -> Result<Vec<(ThreadHandle, Vec<FrameRef>)>, FrameError> {
      Ok(Vec::new())
    }

    fn install_profile_hooks(&self) {}

    fn clear_profile_hooks(&self) {}

    fn register_pymalloc_hooks(&self) {}

    fn unregister_pymalloc_hooks(&self) {}
  }

  #[derive(Debug, PartialEq, Eq)]
  enum FlushEvent {
    Pops(u32),
    Push(String, u32),
  }

  #[derive(Default)]
  struct RecordingFlush {
    events: Mutex<Vec<FlushEvent>>,
    fail_pushes_after: Mutex<Option<usize>>,
  }

  impl RecordingFlush {
    fn events(&self) -> Vec<FlushEvent> {
      std::mem::take(&mut self.events.lock().unwrap())
    }
  }

  impl FrameFlush for RecordingFlush {
    fn flush_pops(&self, count: u32) -> bool {
      self.events.lock().unwrap().push(FlushEvent::Pops(count));
      true
    }

    fn flush_push(&self, frame: &RawFrame) -> bool {
      let mut budget = self.fail_pushes_after.lock().unwrap();
      if let Some(remaining) = budget.as_mut() {
        if *remaining == 0 {
          return false;
        }
        *remaining -= 1;
      }

      self
        .events
        .lock()
        .unwrap()
        .push(FlushEvent::Push(frame.function_name.clone(), frame.lineno));
      true
    }
  }

  fn lazy(frame: FrameRef, function: &str, lineno: u32) -> LazyFrame {
    LazyFrame {
      frame,
      raw: RawFrame {
        function_name: function.to_string(),
        filename: "mod.py".to_string(),
        lineno,
        is_entry_frame: true,
      },
      emitted: false,
    }
  }

  #[test]
  fn pushes_stay_buffered_until_flushed() {
    let flush = RecordingFlush::default();
    let mut shadow = ShadowStack::new();

    shadow.push_lazy(lazy(0x1, "f", 10));
    shadow.push_lazy(lazy(0x2, "g", 20));
    assert!(flush.events().is_empty());

    shadow.flush_pending_pushes(&flush);
    assert_eq!(
      flush.events(),
      vec![
        FlushEvent::Push("f".to_string(), 10),
        FlushEvent::Push("g".to_string(), 20),
      ]
    );

    // Everything is emitted; a second flush has nothing to say.
    shadow.flush_pending_pushes(&flush);
    assert!(flush.events().is_empty());
  }

  #[test]
  fn lineno_change_on_an_emitted_frame_pops_and_repushes() {
    let flush = RecordingFlush::default();
    let mut shadow = ShadowStack::new();

    shadow.push_lazy(lazy(0x1, "g", 0));
    shadow.set_lineno(20);
    shadow.flush_pending_pushes(&flush);
    assert_eq!(flush.events(), vec![FlushEvent::Push("g".to_string(), 20)]);

    shadow.set_lineno(21);
    assert_eq!(shadow.pending_pops, 1);

    shadow.flush_pending_pops(&flush);
    shadow.flush_pending_pushes(&flush);
    assert_eq!(
      flush.events(),
      vec![FlushEvent::Pops(1), FlushEvent::Push("g".to_string(), 21)]
    );
  }

  #[test]
  fn unchanged_lineno_leaves_the_frame_emitted() {
    let flush = RecordingFlush::default();
    let mut shadow = ShadowStack::new();

    shadow.push_lazy(lazy(0x1, "g", 20));
    shadow.flush_pending_pushes(&flush);
    flush.events();

    shadow.set_lineno(20);
    assert_eq!(shadow.pending_pops, 0);

    shadow.flush_pending_pops(&flush);
    shadow.flush_pending_pushes(&flush);
    assert!(flush.events().is_empty());
  }

  #[test]
  fn mismatched_pop_is_ignored() {
    let flush = RecordingFlush::default();
    let mut shadow = ShadowStack::new();

    shadow.push_lazy(lazy(0x1, "f", 10));
    shadow.pop(0x999, &flush);

    assert_eq!(shadow.frames.len(), 1);
    assert!(flush.events().is_empty());

    // Empty stacks ignore pops entirely.
    let mut empty = ShadowStack::new();
    empty.pop(0x1, &flush);
    assert!(flush.events().is_empty());
  }

  #[test]
  fn popping_an_unemitted_frame_needs_no_wire_pop() {
    let flush = RecordingFlush::default();
    let mut shadow = ShadowStack::new();

    shadow.push_lazy(lazy(0x1, "f", 10));
    shadow.push_lazy(lazy(0x2, "g", 20));
    shadow.pop(0x2, &flush);

    assert_eq!(shadow.pending_pops, 0);

    shadow.flush_pending_pushes(&flush);
    assert_eq!(flush.events(), vec![FlushEvent::Push("f".to_string(), 10)]);
  }

  #[test]
  fn emptying_the_stack_drains_pops_immediately() {
    let flush = RecordingFlush::default();
    let mut shadow = ShadowStack::new();

    shadow.push_lazy(lazy(0x1, "f", 10));
    shadow.flush_pending_pushes(&flush);
    flush.events();

    shadow.pop(0x1, &flush);
    assert_eq!(flush.events(), vec![FlushEvent::Pops(1)]);
    assert_eq!(shadow.pending_pops, 0);
  }

  #[test]
  fn a_failed_push_leaves_the_suffix_unemitted() {
    let flush = RecordingFlush::default();
    *flush.fail_pushes_after.lock().unwrap() = Some(1);

    let mut shadow = ShadowStack::new();
    shadow.push_lazy(lazy(0x1, "f", 10));
    shadow.push_lazy(lazy(0x2, "g", 20));

    shadow.flush_pending_pushes(&flush);
    assert_eq!(flush.events(), vec![FlushEvent::Push("f".to_string(), 10)]);

    // The second frame is retried once writing works again.
    *flush.fail_pushes_after.lock().unwrap() = None;
    shadow.flush_pending_pushes(&flush);
    assert_eq!(flush.events(), vec![FlushEvent::Push("g".to_string(), 20)]);
  }

  #[test]
  fn current_lineno_queries_the_top_frame() {
    let shim = StubShim::new();
    shim.set_frame_lineno(0x2, 42);

    let mut shadow = ShadowStack::new();
    assert_eq!(shadow.current_lineno(&shim), 0);

    shadow.push_lazy(lazy(0x1, "f", 10));
    shadow.push_lazy(lazy(0x2, "g", 20));
    assert_eq!(shadow.current_lineno(&shim), 42);
  }
}
