//! Request and response hand-off between an I/O thread and its workers
//!
//! Every entry is stamped with its enqueue time; dequeuing reports how long
//! it waited, which is what request shedding is based on. The `ConnToken`
//! travels with the payload so the response can find its connection again.

use crate::queue::ThreadQueue;
use std::fmt;
use uthread_runtime::now_ms;

/// Identifies a connection inside its unit
///
/// The generation guards against a late response reaching a newer
/// connection that reused the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnToken {
    pub(crate) key: usize,
    pub(crate) generation: u64,
}

impl ConnToken {
    pub fn new(key: usize, generation: u64) -> Self {
        Self { key, generation }
    }

    pub fn key(&self) -> usize {
        self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct QueueEntry<T> {
    enqueue_ms: u64,
    token: ConnToken,
    payload: T,
}

impl<T> QueueEntry<T> {
    fn new(token: ConnToken, payload: T) -> Self {
        Self {
            enqueue_ms: now_ms(),
            token,
            payload,
        }
    }

    fn dequeued(self) -> Dequeued<T> {
        Dequeued {
            token: self.token,
            payload: self.payload,
            queue_wait_ms: now_ms().saturating_sub(self.enqueue_ms),
        }
    }
}

/// An item taken off a queue, with its time spent waiting
#[derive(Debug)]
pub struct Dequeued<T> {
    pub token: ConnToken,
    pub payload: T,
    pub queue_wait_ms: u64,
}

/// Request rejected at admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// The request queue already holds `max_queue_length` entries
    QueueFull,
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::QueueFull => write!(f, "request queue full"),
        }
    }
}

impl std::error::Error for AdmissionError {}

pub struct DataFlow<Req, Resp> {
    in_queue: ThreadQueue<QueueEntry<Req>>,
    out_queue: ThreadQueue<QueueEntry<Resp>>,
}

impl<Req, Resp> DataFlow<Req, Resp> {
    pub fn new() -> Self {
        Self {
            in_queue: ThreadQueue::new(),
            out_queue: ThreadQueue::new(),
        }
    }

    pub fn push_request(&self, token: ConnToken, req: Req) {
        self.in_queue.push(QueueEntry::new(token, req));
    }

    /// Push `req` unless the request queue is at `max_queue_length`
    ///
    /// A rejected request is dropped.
    pub fn admit_request(&self, token: ConnToken, req: Req, max_queue_length: usize) -> Result<(), AdmissionError> {
        if !self.can_push_request(max_queue_length) {
            return Err(AdmissionError::QueueFull);
        }
        self.push_request(token, req);
        Ok(())
    }

    /// Blocking; `None` after `break_out`
    pub fn pluck_request(&self) -> Option<Dequeued<Req>> {
        self.in_queue.pluck().map(QueueEntry::dequeued)
    }

    pub fn pick_request(&self) -> Option<Dequeued<Req>> {
        self.in_queue.pick().map(QueueEntry::dequeued)
    }

    pub fn push_response(&self, token: ConnToken, resp: Resp) {
        self.out_queue.push(QueueEntry::new(token, resp));
    }

    /// Blocking; `None` after `break_out`
    pub fn pluck_response(&self) -> Option<Dequeued<Resp>> {
        self.out_queue.pluck().map(QueueEntry::dequeued)
    }

    pub fn pick_response(&self) -> Option<Dequeued<Resp>> {
        self.out_queue.pick().map(QueueEntry::dequeued)
    }

    pub fn can_push_request(&self, max_queue_length: usize) -> bool {
        self.in_queue.len() < max_queue_length
    }

    pub fn can_push_response(&self, max_queue_length: usize) -> bool {
        self.out_queue.len() < max_queue_length
    }

    pub fn can_pluck_request(&self) -> bool {
        !self.in_queue.is_empty()
    }

    pub fn can_pluck_response(&self) -> bool {
        !self.out_queue.is_empty()
    }

    pub fn request_len(&self) -> usize {
        self.in_queue.len()
    }

    pub fn response_len(&self) -> usize {
        self.out_queue.len()
    }

    /// Wake and fail every blocked pluck on both queues
    pub fn break_out(&self) {
        self.in_queue.break_out();
        self.out_queue.break_out();
    }
}

impl<Req, Resp> Default for DataFlow<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}
