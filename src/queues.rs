use crate::entry::KeyRef;

use generational_arena::{Arena, Index};

#[derive(Debug)]
struct Node<K> {
  hash: u64,
  key: KeyRef<K>,
  next: Option<Index>,
  prev: Option<Index>,
}

/// A doubly linked list over arena-allocated nodes.
///
/// One instance backs the recency queue (head = most recently used) and one
/// backs each expiration queue (head = most recently written or accessed, so
/// the tail is always the next candidate to expire). Entries store their node
/// index, giving O(1) unlink and move-to-front. All mutation happens under
/// the owning segment's write lock.
pub(crate) struct KeyQueue<K> {
  nodes: Arena<Node<K>>,
  // Head is the most recently used/written end.
  head: Option<Index>,
  // Tail is the oldest end, the eviction/expiration candidate.
  tail: Option<Index>,
}

impl<K> KeyQueue<K> {
  pub(crate) fn new() -> Self {
    Self {
      nodes: Arena::new(),
      head: None,
      tail: None,
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.nodes.len()
  }

  // Detach a node from the list without touching the arena.
  fn unlink(&mut self, index: Index) {
    let (prev, next) = {
      let node = &self.nodes[index];
      (node.prev, node.next)
    };

    match prev {
      Some(prev_idx) => self.nodes[prev_idx].next = next,
      None => self.head = next,
    }
    match next {
      Some(next_idx) => self.nodes[next_idx].prev = prev,
      None => self.tail = prev,
    }
  }

  // Link an existing node in as the new head.
  fn push_front_node(&mut self, index: Index) {
    let old_head = self.head;
    {
      let node = &mut self.nodes[index];
      node.next = old_head;
      node.prev = None;
    }
    self.head = Some(index);

    if let Some(old_head_idx) = old_head {
      self.nodes[old_head_idx].prev = Some(index);
    }
    if self.tail.is_none() {
      self.tail = Some(index);
    }
  }

  /// Inserts a new node at the head and returns its index.
  pub(crate) fn push_front(&mut self, hash: u64, key: KeyRef<K>) -> Index {
    let index = self.nodes.insert(Node {
      hash,
      key,
      next: None,
      prev: None,
    });
    self.push_front_node(index);
    index
  }

  /// Moves an existing node back to the head.
  pub(crate) fn move_to_front(&mut self, index: Index) {
    if !self.nodes.contains(index) || self.head == Some(index) {
      return;
    }
    self.unlink(index);
    self.push_front_node(index);
  }

  /// Removes a node, returning its payload.
  pub(crate) fn remove(&mut self, index: Index) -> Option<(u64, KeyRef<K>)> {
    if !self.nodes.contains(index) {
      return None;
    }
    self.unlink(index);
    self.nodes.remove(index).map(|node| (node.hash, node.key))
  }

  /// The oldest node's payload, if any.
  pub(crate) fn tail(&self) -> Option<(Index, u64, KeyRef<K>)> {
    self.tail.map(|index| {
      let node = &self.nodes[index];
      (index, node.hash, node.key.clone())
    })
  }

  pub(crate) fn clear(&mut self) {
    self.nodes.clear();
    self.head = None;
    self.tail = None;
  }

  // A helper for tests, to get the hashes from head to tail.
  #[cfg(test)]
  fn hashes_as_vec(&self) -> Vec<u64> {
    let mut hashes = Vec::new();
    let mut current = self.head;
    while let Some(index) = current {
      hashes.push(self.nodes[index].hash);
      current = self.nodes[index].next;
    }
    hashes
  }
}
