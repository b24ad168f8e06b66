//! Error types for the uthread runtime

use core::fmt;
use std::io;

/// Result type for runtime operations
pub type UThreadResult<T> = Result<T, UThreadError>;

/// Errors surfaced by tasks and the blocking-shim primitives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UThreadError {
    /// The timer fired before the handle became ready
    Timeout,

    /// Readiness was reported, but none of it matches the requested interest
    /// (raw readiness bits attached)
    MismatchedEvents(u32),

    /// The owning scheduler was closed while the task was suspended
    SchedulerClosed,

    /// Woken without readiness, timeout or close: the peer went away
    PeerClosed,

    /// Connection attempt was refused
    Refused,

    /// Syscall failed with the given errno
    Io(i32),

    /// Stack allocation for a new task failed
    TaskCreation(MemoryError),
}

impl UThreadError {
    /// Build from the calling thread's current errno
    pub fn last_os_error() -> Self {
        UThreadError::Io(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// True for errors after which the handle must not be used again
    pub fn is_fatal(&self) -> bool {
        matches!(self, UThreadError::SchedulerClosed | UThreadError::TaskCreation(_))
    }
}

impl fmt::Display for UThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UThreadError::Timeout => write!(f, "operation timed out"),
            UThreadError::MismatchedEvents(bits) => {
                write!(f, "mismatched readiness events: {:#x}", bits)
            }
            UThreadError::SchedulerClosed => write!(f, "scheduler closed"),
            UThreadError::PeerClosed => write!(f, "connection closed by peer"),
            UThreadError::Refused => write!(f, "connection refused"),
            UThreadError::Io(errno) => write!(f, "os error {}", errno),
            UThreadError::TaskCreation(e) => write!(f, "task creation failed: {}", e),
        }
    }
}

impl std::error::Error for UThreadError {}

impl From<MemoryError> for UThreadError {
    fn from(e: MemoryError) -> Self {
        UThreadError::TaskCreation(e)
    }
}

impl From<UThreadError> for io::Error {
    fn from(e: UThreadError) -> Self {
        let kind = match &e {
            UThreadError::Timeout => io::ErrorKind::TimedOut,
            UThreadError::Refused => io::ErrorKind::ConnectionRefused,
            UThreadError::PeerClosed => io::ErrorKind::ConnectionReset,
            UThreadError::SchedulerClosed => io::ErrorKind::ConnectionAborted,
            UThreadError::Io(errno) => io::Error::from_raw_os_error(*errno).kind(),
            UThreadError::MismatchedEvents(_) | UThreadError::TaskCreation(_) => {
                io::ErrorKind::Other
            }
        };
        io::Error::new(kind, e)
    }
}

/// Memory-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect on a guard region failed
    ProtectionFailed,

    /// Requested stack size is zero or overflows once rounded to pages
    InvalidSize,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "stack allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "guard page protection failed"),
            MemoryError::InvalidSize => write!(f, "invalid stack size"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// Transport-level failure classification
///
/// Every error on a byte stream collapses into one of these three; codecs
/// and the pipeline only ever branch on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    Timeout,
    Refused,
    NormalClosed,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Timeout => write!(f, "stream timed out"),
            StreamError::Refused => write!(f, "stream refused"),
            StreamError::NormalClosed => write!(f, "stream closed"),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<&UThreadError> for StreamError {
    fn from(e: &UThreadError) -> Self {
        match e {
            UThreadError::Timeout => StreamError::Timeout,
            UThreadError::Refused => StreamError::Refused,
            UThreadError::Io(errno) => classify_kind(io::Error::from_raw_os_error(*errno).kind()),
            _ => StreamError::NormalClosed,
        }
    }
}

impl From<UThreadError> for StreamError {
    fn from(e: UThreadError) -> Self {
        StreamError::from(&e)
    }
}

impl From<&io::Error> for StreamError {
    fn from(e: &io::Error) -> Self {
        if let Some(inner) = e.get_ref().and_then(|i| i.downcast_ref::<UThreadError>()) {
            return StreamError::from(inner);
        }
        classify_kind(e.kind())
    }
}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        StreamError::from(&e)
    }
}

fn classify_kind(kind: io::ErrorKind) -> StreamError {
    match kind {
        // Blocking std sockets report an expired read timeout as WouldBlock
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => StreamError::Timeout,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::InvalidInput => StreamError::Refused,
        _ => StreamError::NormalClosed,
    }
}
