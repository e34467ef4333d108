//! In-flight deadline tracking.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeadlineEntry {
    deadline_ms: u64,
    id: u64,
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap yields the earliest deadline first.
        other
            .deadline_ms
            .cmp(&self.deadline_ms)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Message ids keyed by redelivery deadline.
///
/// Removal is lazy: the heap may hold stale entries, which are skipped when
/// they no longer match the id's current deadline. The heap is rebuilt once
/// stale entries dominate.
#[derive(Debug, Default)]
pub struct DeadlineQueue {
    heap: BinaryHeap<DeadlineEntry>,
    deadlines: HashMap<u64, u64>,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `id` until `deadline_ms`, replacing any earlier deadline.
    pub fn insert(&mut self, id: u64, deadline_ms: u64) {
        self.deadlines.insert(id, deadline_ms);
        self.heap.push(DeadlineEntry { deadline_ms, id });
        self.maybe_rebuild();
    }

    /// Stop tracking `id`, returning its deadline.
    pub fn remove(&mut self, id: u64) -> Option<u64> {
        let removed = self.deadlines.remove(&id);
        if removed.is_some() {
            self.maybe_rebuild();
        }
        removed
    }

    pub fn contains(&self, id: u64) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Remove and return every id whose deadline is at or before `now_ms`,
    /// earliest first.
    pub fn collect_expired(&mut self, now_ms: u64) -> Vec<u64> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek().copied() {
            if self.deadlines.get(&entry.id) != Some(&entry.deadline_ms) {
                self.heap.pop();
                continue;
            }
            if entry.deadline_ms > now_ms {
                break;
            }
            self.heap.pop();
            self.deadlines.remove(&entry.id);
            expired.push(entry.id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Tracked ids in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.deadlines.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn maybe_rebuild(&mut self) {
        if self.heap.len() > 64 && self.heap.len() > 2 * self.deadlines.len() {
            self.heap = self
                .deadlines
                .iter()
                .map(|(&id, &deadline_ms)| DeadlineEntry { deadline_ms, id })
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_in_deadline_order() {
        let mut queue = DeadlineQueue::new();
        queue.insert(3, 300);
        queue.insert(1, 100);
        queue.insert(2, 200);

        assert_eq!(queue.collect_expired(99), Vec::<u64>::new());
        assert_eq!(queue.collect_expired(200), vec![1, 2]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.ids(), vec![3]);
    }

    #[test]
    fn removed_and_replaced_entries_are_skipped() {
        let mut queue = DeadlineQueue::new();
        queue.insert(1, 100);
        queue.insert(2, 100);
        queue.insert(2, 500);
        assert_eq!(queue.remove(1), Some(100));
        assert_eq!(queue.remove(1), None);

        assert!(queue.collect_expired(400).is_empty());
        assert!(queue.contains(2));
        assert_eq!(queue.collect_expired(500), vec![2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn heap_is_rebuilt_when_mostly_stale() {
        let mut queue = DeadlineQueue::new();
        for id in 0..200 {
            queue.insert(id, 1_000);
        }
        for id in 0..190 {
            queue.remove(id);
        }
        assert!(queue.heap.len() <= 2 * queue.len().max(64));
        assert_eq!(queue.ids(), (190..200).collect::<Vec<_>>());
    }
}
