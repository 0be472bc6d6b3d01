use std::fmt::{self, Display, Formatter};

use crate::records::{FrameRef, PythonAllocatorKind, ThreadHandle};

/// Reflection failures surfaced by the interpreter shim.
///
/// A failed lookup skips the offending frame push; no partial frame is ever
/// recorded.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FrameError {
  /// The code object's function name could not be fetched.
  FunctionName,
  /// The code object's filename could not be fetched.
  Filename,
  /// A thread's stack could not be walked during tracking start.
  ThreadStacks,
}

impl Display for FrameError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::FunctionName => write!(f, "failed to read the frame's function name"),
      Self::Filename => write!(f, "failed to read the frame's filename"),
      Self::ThreadStacks => write!(f, "failed to capture a thread's stack"),
    }
  }
}

impl std::error::Error for FrameError {}

/// Function name and filename read from a frame's code object.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FrameCode {
  pub function_name: String,
  pub filename: String,
}

/// The embedded interpreter, as seen by the tracer core.
///
/// Binding glue implements this; the core never touches the interpreter
/// directly. Unless noted otherwise, methods are only called while the
/// caller holds the interpreter's global lock.
pub trait InterpreterShim: Send + Sync {
  /// Read the function name and filename of `frame`'s code object.
  ///
  /// # Errors
  ///
  /// Returns a [`FrameError`] when either lookup fails; the caller skips
  /// the push.
  fn frame_code(&self, frame: FrameRef) -> Result<FrameCode, FrameError>;

  /// Current line number of `frame`. Callable without the interpreter lock.
  fn frame_lineno(&self, frame: FrameRef) -> u32;

  /// Whether `frame` entered interpreted code from native code. Only
  /// consulted while native tracing is enabled.
  fn is_entry_frame(&self, frame: FrameRef) -> bool;

  /// Handle of the calling thread. Callable without the interpreter lock.
  fn current_thread(&self) -> ThreadHandle;

  /// Walk every interpreter thread's current stack, innermost frame first.
  ///
  /// # Errors
  ///
  /// Returns a [`FrameError`] if any thread's stack cannot be walked; the
  /// tracking start is aborted.
  fn thread_stacks(&self) -> Result<Vec<(ThreadHandle, Vec<FrameRef>)>, FrameError>;

  /// Install the call/return profile callbacks on every thread.
  fn install_profile_hooks(&self);

  /// Remove any profile callbacks from every thread, including callbacks a
  /// previous tracer left behind.
  fn clear_profile_hooks(&self);

  /// Route the interpreter's own allocator domains through the tracer.
  fn register_pymalloc_hooks(&self);

  fn unregister_pymalloc_hooks(&self);

  /// Which allocator the interpreter was configured with, for the header.
  fn python_allocator_kind(&self) -> PythonAllocatorKind {
    PythonAllocatorKind::Other
  }
}

/// Intercepted native allocator entry points.
///
/// Implementations rewrite the process's allocator symbols so that malloc
/// and friends report into [`crate::tracker`]'s hot paths; restoring puts
/// the original symbols back.
pub trait SymbolPatcher: Send + Sync {
  fn overwrite_symbols(&self);
  fn restore_symbols(&self);
}

/// Patcher for embedders that intercept by other means (or not at all).
#[derive(Debug, Default)]
pub struct NullPatcher;

impl SymbolPatcher for NullPatcher {
  fn overwrite_symbols(&self) {}

  fn restore_symbols(&self) {}
}
