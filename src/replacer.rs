//! LRU frame replacement for the buffer pool.

use std::collections::{HashSet, VecDeque};

/// Tracks unpinned frames and picks eviction victims.
///
/// The queue is ordered by unpin recency: the front is the least recently
/// unpinned frame and the first eviction candidate. A frame that is pinned
/// leaves the candidate set; unpinning re-inserts it at the back.
pub struct LruReplacer {
    queue: VecDeque<usize>,
    present: HashSet<usize>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            present: HashSet::with_capacity(capacity),
        }
    }

    /// Removes and returns the least recently unpinned frame, if any.
    pub fn victim(&mut self) -> Option<usize> {
        let frame = self.queue.pop_front()?;
        self.present.remove(&frame);
        Some(frame)
    }

    /// Removes `frame` from the candidate set.
    pub fn pin(&mut self, frame: usize) {
        if self.present.remove(&frame) {
            self.queue.retain(|&f| f != frame);
        }
    }

    /// Inserts `frame` at the most recently used end. Re-unpinning a frame
    /// already in the set keeps its position.
    pub fn unpin(&mut self, frame: usize) {
        if self.present.insert(frame) {
            self.queue.push_back(frame);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
