//! Priority admission queue shared by the download and transcode schedulers

use crate::types::Priority;
use std::collections::BinaryHeap;

/// Entry in an [`AdmissionQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueEntry<K> {
    pub(crate) id: K,
    pub(crate) priority: Priority,
    pub(crate) seq: i64,
}

// Max-heap: higher priority first, then lower sequence (FIFO)
impl<K: Eq> Ord for QueueEntry<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<K: Eq> PartialOrd for QueueEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Items waiting for a slot, ordered by `(priority DESC, seq ASC)`
#[derive(Debug)]
pub(crate) struct AdmissionQueue<K> {
    heap: BinaryHeap<QueueEntry<K>>,
}

impl<K> Default for AdmissionQueue<K>
where
    K: Copy + Eq,
{
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }
}

impl<K> AdmissionQueue<K>
where
    K: Copy + Eq,
{
    /// Add an item; an item already present is replaced
    pub(crate) fn push(&mut self, id: K, priority: Priority, seq: i64) {
        self.remove(id);
        self.heap.push(QueueEntry { id, priority, seq });
    }

    /// Take the next item to admit
    pub(crate) fn pop(&mut self) -> Option<K> {
        self.heap.pop().map(|entry| entry.id)
    }

    /// Remove an item without admitting it
    pub(crate) fn remove(&mut self, id: K) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.id != id);
        self.heap.len() < before
    }

    /// Change the priority of a waiting item, keeping its sequence
    pub(crate) fn reprioritize(&mut self, id: K, priority: Priority) -> bool {
        let Some(seq) = self.heap.iter().find(|e| e.id == id).map(|e| e.seq) else {
            return false;
        };
        self.push(id, priority, seq);
        true
    }

    pub(crate) fn contains(&self, id: K) -> bool {
        self.heap.iter().any(|entry| entry.id == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
