//! Array-backed binary min-heap of deadlines with positional removal
//!
//! Every write of an entry into the array tells its node the new 1-based
//! position (`TimerNode::set_timer_id`). A node can therefore be removed in
//! O(log n) from anywhere in the heap, not just the root: the last entry is
//! moved into the hole and sifted up or down.
//!
//! # Complexity
//!
//! - Add: O(log n)
//! - Remove by id: O(log n)
//! - Pop earliest: O(log n)
//! - Next timeout: O(1)

use std::rc::Rc;
use uthread_core::constants::NO_TIMEOUT;

/// A value that can sit in a `TimerHeap` and remembers where
pub trait TimerNode {
    /// Record the node's 1-based heap position, or 0 once removed
    fn set_timer_id(&self, timer_id: usize);
}

impl<T: TimerNode + ?Sized> TimerNode for Rc<T> {
    #[inline]
    fn set_timer_id(&self, timer_id: usize) {
        (**self).set_timer_id(timer_id)
    }
}

struct TimerEntry<T> {
    deadline_ms: u64,
    node: T,
}

pub struct TimerHeap<T: TimerNode> {
    entries: Vec<TimerEntry<T>>,
}

impl<T: TimerNode> TimerHeap<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert `node` due at `deadline_ms`; use `u64::MAX` for "never"
    pub fn add(&mut self, deadline_ms: u64, node: T) {
        self.entries.push(TimerEntry { deadline_ms, node });
        let last = self.entries.len() - 1;
        self.sift_up(last);
    }

    /// Remove the node at 1-based position `timer_id`
    ///
    /// 0 and out-of-range ids are ignored.
    pub fn remove(&mut self, timer_id: usize) -> Option<T> {
        if timer_id == 0 || timer_id > self.entries.len() {
            return None;
        }
        let index = timer_id - 1;
        let removed = self.entries.swap_remove(index);
        removed.node.set_timer_id(0);

        if index < self.entries.len() {
            // The former last entry now fills the hole
            self.entries[index].node.set_timer_id(index + 1);
            if self.entries[index].deadline_ms < removed.deadline_ms {
                self.sift_up(index);
            } else {
                self.sift_down(index);
            }
        }
        Some(removed.node)
    }

    /// Remove and return the node with the smallest deadline
    pub fn pop_earliest(&mut self) -> Option<T> {
        self.remove(1)
    }

    /// Remove and return the earliest node if its deadline is `<= now_ms`
    pub fn pop_expired(&mut self, now_ms: u64) -> Option<T> {
        match self.entries.first() {
            Some(entry) if entry.deadline_ms <= now_ms => self.remove(1),
            _ => None,
        }
    }

    pub fn peek_deadline(&self) -> Option<u64> {
        self.entries.first().map(|e| e.deadline_ms)
    }

    /// Milliseconds until the earliest deadline: -1 when empty, 0 when
    /// something is already due
    pub fn next_timeout_ms(&self, now_ms: u64) -> i32 {
        match self.peek_deadline() {
            None => NO_TIMEOUT,
            Some(deadline) if deadline <= now_ms => 0,
            Some(deadline) => (deadline - now_ms).min(i32::MAX as u64) as i32,
        }
    }

    /// Empty the heap, returning every node in array order
    pub fn take_all(&mut self) -> Vec<T> {
        self.entries
            .drain(..)
            .map(|entry| {
                entry.node.set_timer_id(0);
                entry.node
            })
            .collect()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.entries[parent].deadline_ms <= self.entries[index].deadline_ms {
                break;
            }
            self.entries.swap(parent, index);
            self.entries[index].node.set_timer_id(index + 1);
            index = parent;
        }
        self.entries[index].node.set_timer_id(index + 1);
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.entries[right].deadline_ms < self.entries[left].deadline_ms {
                right
            } else {
                left
            };
            if self.entries[index].deadline_ms <= self.entries[child].deadline_ms {
                break;
            }
            self.entries.swap(index, child);
            self.entries[index].node.set_timer_id(index + 1);
            index = child;
        }
        self.entries[index].node.set_timer_id(index + 1);
    }
}

impl<T: TimerNode> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Node {
        name: u32,
        timer_id: Cell<usize>,
    }

    impl TimerNode for Node {
        fn set_timer_id(&self, timer_id: usize) {
            self.timer_id.set(timer_id);
        }
    }

    fn node(name: u32) -> Rc<Node> {
        Rc::new(Node { name, timer_id: Cell::new(0) })
    }

    /// Every node's timer_id must point at its own position
    fn assert_positions(heap: &TimerHeap<Rc<Node>>) {
        for (i, entry) in heap.entries.iter().enumerate() {
            assert_eq!(entry.node.timer_id.get(), i + 1);
            if i > 0 {
                assert!(heap.entries[(i - 1) / 2].deadline_ms <= entry.deadline_ms);
            }
        }
    }

    #[test]
    fn test_pop_in_deadline_order() {
        let mut heap = TimerHeap::new();
        for (name, deadline) in [(1, 50), (2, 10), (3, 40), (4, 20), (5, 30)] {
            heap.add(deadline, node(name));
            assert_positions(&heap);
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop_earliest()).map(|n| n.name).collect();
        assert_eq!(order, vec![2, 4, 5, 3, 1]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_remove_arbitrary_position() {
        let mut heap = TimerHeap::new();
        let nodes: Vec<_> = (0..10).map(node).collect();
        for (i, n) in nodes.iter().enumerate() {
            heap.add(((i * 7) % 10) as u64 * 100, n.clone());
        }

        let victim = nodes[3].clone();
        let removed = heap.remove(victim.timer_id.get()).unwrap();
        assert_eq!(removed.name, 3);
        assert_eq!(victim.timer_id.get(), 0);
        assert_eq!(heap.len(), 9);
        assert_positions(&heap);

        let mut last = 0;
        while let Some(n) = heap.pop_earliest() {
            assert_ne!(n.name, 3);
            assert_eq!(n.timer_id.get(), 0);
            let deadline = ((n.name as usize * 7) % 10) as u64 * 100;
            assert!(deadline >= last);
            last = deadline;
        }
    }

    #[test]
    fn test_remove_invalid_id_is_noop() {
        let mut heap = TimerHeap::new();
        heap.add(5, node(1));
        assert!(heap.remove(0).is_none());
        assert!(heap.remove(2).is_none());
        assert!(heap.remove(usize::MAX).is_none());
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_remove_last_entry() {
        let mut heap = TimerHeap::new();
        let a = node(1);
        let b = node(2);
        heap.add(1, a.clone());
        heap.add(2, b.clone());
        assert_eq!(b.timer_id.get(), 2);
        heap.remove(2);
        assert_eq!(b.timer_id.get(), 0);
        assert_eq!(a.timer_id.get(), 1);
    }

    #[test]
    fn test_next_timeout() {
        let mut heap: TimerHeap<Rc<Node>> = TimerHeap::new();
        assert_eq!(heap.next_timeout_ms(1000), NO_TIMEOUT);
        heap.add(1500, node(1));
        assert_eq!(heap.next_timeout_ms(1000), 500);
        assert_eq!(heap.next_timeout_ms(1500), 0);
        assert_eq!(heap.next_timeout_ms(9999), 0);

        heap.pop_earliest();
        heap.add(u64::MAX, node(2));
        assert_eq!(heap.next_timeout_ms(0), i32::MAX);
    }

    #[test]
    fn test_pop_expired_respects_now() {
        let mut heap = TimerHeap::new();
        heap.add(10, node(1));
        heap.add(20, node(2));
        assert_eq!(heap.pop_expired(15).map(|n| n.name), Some(1));
        assert!(heap.pop_expired(15).is_none());
        assert_eq!(heap.pop_expired(20).map(|n| n.name), Some(2));
    }

    #[test]
    fn test_take_all_clears_ids() {
        let mut heap = TimerHeap::new();
        let nodes: Vec<_> = (0..4).map(node).collect();
        for n in &nodes {
            heap.add(u64::MAX, n.clone());
        }
        let all = heap.take_all();
        assert_eq!(all.len(), 4);
        assert!(heap.is_empty());
        assert!(nodes.iter().all(|n| n.timer_id.get() == 0));
    }

    #[test]
    fn test_mixed_operations_keep_heap_order() {
        // Deterministic pseudo-random add/remove/pop sequence
        let mut heap = TimerHeap::new();
        let mut live: Vec<Rc<Node>> = Vec::new();
        let mut seed: u64 = 0x2545_F491;
        for step in 0..500u32 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            match seed % 3 {
                0 | 1 => {
                    let n = node(step);
                    heap.add(seed % 1000, n.clone());
                    live.push(n);
                }
                _ if !live.is_empty() => {
                    let victim = live.swap_remove((seed as usize / 3) % live.len());
                    assert!(heap.remove(victim.timer_id.get()).is_some());
                }
                _ => {}
            }
            assert_positions(&heap);
        }
        let mut last = 0;
        while let Some(deadline) = heap.peek_deadline() {
            assert!(deadline >= last);
            last = deadline;
            heap.pop_earliest();
        }
    }
}
