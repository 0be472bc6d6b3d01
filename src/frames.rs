use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::records::{FrameId, RawFrame};

/// Interns frames by value, assigning dense identifiers in order of first
/// use.
///
/// Safe for concurrent interning from every tracing thread; the id counter
/// only advances inside the map shard lock, so ids are dense and two equal
/// frames can never race into different ids.
#[derive(Debug, Default)]
pub struct FrameRegistry {
  by_frame: DashMap<RawFrame, FrameId>,
  next_id: AtomicU64,
}

impl FrameRegistry {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Look up or assign the id for `frame`. The boolean is true when this
  /// call inserted the frame, in which case the caller must stream a frame
  /// index record exactly once.
  #[must_use]
  pub fn get_or_insert(&self, frame: &RawFrame) -> (FrameId, bool) {
    if let Some(existing) = self.by_frame.get(frame) {
      return (*existing, false);
    }

    let mut inserted = false;
    let id = *self
      .by_frame
      .entry(frame.clone())
      .or_insert_with(|| {
        inserted = true;
        self.next_id.fetch_add(1, Ordering::Relaxed)
      })
      .value();

    (id, inserted)
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.by_frame.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.by_frame.is_empty()
  }
}
