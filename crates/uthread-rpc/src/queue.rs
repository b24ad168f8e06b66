//! Blocking FIFO shared between threads
//!
//! `Mutex<VecDeque>` + `Condvar`, with the length mirrored in an atomic so
//! admission checks never take the lock. `break_out` is one-shot and
//! irreversible: every blocked `pluck` returns `None`, and so does every
//! later one, even if items remain.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

struct QueueState<T> {
    items: VecDeque<T>,
    broken: bool,
}

pub struct ThreadQueue<T> {
    state: Mutex<QueueState<T>>,
    cond: Condvar,
    len: AtomicUsize,
}

impl<T> ThreadQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                broken: false,
            }),
            cond: Condvar::new(),
            len: AtomicUsize::new(0),
        }
    }

    /// Append and wake one blocked `pluck`
    pub fn push(&self, value: T) {
        {
            let mut state = self.state.lock();
            state.items.push_back(value);
            self.len.store(state.items.len(), Ordering::Release);
        }
        self.cond.notify_one();
    }

    /// Pop the front item, blocking while empty
    ///
    /// `None` once the queue has been broken out.
    pub fn pluck(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.broken {
                return None;
            }
            if let Some(value) = state.items.pop_front() {
                self.len.store(state.items.len(), Ordering::Release);
                return Some(value);
            }
            self.cond.wait(&mut state);
        }
    }

    /// Pop the front item without blocking
    pub fn pick(&self) -> Option<T> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut state = self.state.lock();
        let value = state.items.pop_front();
        self.len.store(state.items.len(), Ordering::Release);
        value
    }

    /// Fail every current and future `pluck`
    pub fn break_out(&self) {
        self.state.lock().broken = true;
        self.cond.notify_all();
    }

    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ThreadQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_and_pick() {
        let q = ThreadQueue::new();
        assert_eq!(q.pick(), None);
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.len(), 5);
        assert_eq!(q.pluck(), Some(0));
        assert_eq!(q.pick(), Some(1));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_pluck_blocks_until_push() {
        let q = Arc::new(ThreadQueue::new());
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.push("late");
            })
        };
        assert_eq!(q.pluck(), Some("late"));
        producer.join().unwrap();
    }

    #[test]
    fn test_break_out_releases_waiters() {
        let q: Arc<ThreadQueue<u32>> = Arc::new(ThreadQueue::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || q.pluck())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        q.break_out();
        for w in waiters {
            assert_eq!(w.join().unwrap(), None);
        }

        // Future plucks fail without blocking, even with items present
        q.push(7);
        assert!(q.is_broken());
        assert_eq!(q.pluck(), None);
        assert_eq!(q.pick(), Some(7));
    }

    #[test]
    fn test_concurrent_push_pluck_delivers_each_once_in_order() {
        const PER_PRODUCER: u32 = 2000;
        let q = Arc::new(ThreadQueue::new());
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.push((p, i));
                    }
                })
            })
            .collect();

        let mut next = [0u32; 4];
        for _ in 0..4 * PER_PRODUCER {
            let (p, i) = q.pluck().unwrap();
            // Per-producer order survives the shared queue
            assert_eq!(next[p as usize], i);
            next[p as usize] += 1;
        }
        for p in producers {
            p.join().unwrap();
        }
        assert!(q.is_empty());
        assert_eq!(next, [PER_PRODUCER; 4]);
    }
}
