use std::collections::HashMap;

use nohash_hasher::BuildNoHashHasher;
use smallvec::SmallVec;

/// Upper bound on captured native frames per allocation.
const MAX_NATIVE_FRAMES: usize = 128;

/// A captured native call stack: raw instruction pointers, innermost first.
#[derive(Debug, Default)]
pub struct NativeTrace {
  ips: SmallVec<[u64; 32]>,
}

impl NativeTrace {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Capture the current thread's native stack, skipping the `skip`
  /// innermost frames. Returns false when nothing was captured.
  pub fn fill(&mut self, skip: usize) -> bool {
    self.ips.clear();

    let mut remaining_skip = skip;

    backtrace::trace(|frame| {
      if remaining_skip > 0 {
        remaining_skip -= 1;
        return true;
      }

      if self.ips.len() >= MAX_NATIVE_FRAMES {
        return false;
      }

      self.ips.push(frame.ip() as usize as u64);
      true
    });

    !self.ips.is_empty()
  }

  /// Instruction pointers, innermost first.
  #[must_use]
  pub fn ips(&self) -> &[u64] {
    &self.ips
  }
}

#[derive(Debug)]
struct TraceNode {
  children: HashMap<u64, u32, BuildNoHashHasher<u64>>,
}

impl TraceNode {
  fn new() -> Self {
    Self {
      children: HashMap::default(),
    }
  }
}

/// Folds native traces into a tree keyed by instruction pointer.
///
/// Node 0 is the empty root. Every other node is implicitly numbered by
/// insertion order, matching the order in which novel nodes are reported to
/// the stream; an allocation references its whole native stack through the
/// single index of the leaf node.
#[derive(Debug)]
pub struct TraceTree {
  nodes: Vec<TraceNode>,
}

impl TraceTree {
  #[must_use]
  pub fn new() -> Self {
    Self {
      nodes: vec![TraceNode::new()],
    }
  }

  /// Fold `ips` (innermost first) into the tree and return the leaf index.
  ///
  /// `on_new_node` runs once per novel node with the node's instruction
  /// pointer and its parent index; when it reports failure the fold stops
  /// and the index reached so far is returned.
  pub fn trace_index<F>(&mut self, ips: &[u64], mut on_new_node: F) -> u32
  where
    F: FnMut(u64, u32) -> bool,
  {
    let mut current = 0u32;

    for ip in ips.iter().rev() {
      if let Some(child) = self.nodes[current as usize].children.get(ip) {
        current = *child;
        continue;
      }

      let index = self.nodes.len() as u32;

      if !on_new_node(*ip, current) {
        return current;
      }

      self.nodes[current as usize].children.insert(*ip, index);
      self.nodes.push(TraceNode::new());
      current = index;
    }

    current
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.nodes.len() == 1
  }
}

impl Default for TraceTree {
  fn default() -> Self {
    Self::new()
  }
}
