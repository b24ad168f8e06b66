//! Task slot status

use core::fmt;

/// Status of a slot in a `TaskRuntime`
///
/// A freshly created task starts `Suspended`: it has a prepared context but
/// has not run yet. Only `Suspended` tasks may be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Created or yielded, waiting to be resumed
    Suspended = 0,

    /// Currently executing (at most one per runtime)
    Running = 1,

    /// Finished; the slot sits on the free list
    Done = 2,
}

impl TaskStatus {
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, TaskStatus::Suspended)
    }

    /// Suspended or running
    #[inline]
    pub const fn is_live(&self) -> bool {
        !matches!(self, TaskStatus::Done)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Suspended => write!(f, "SUSPENDED"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Done => write!(f, "DONE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(TaskStatus::Suspended.is_resumable());
        assert!(!TaskStatus::Running.is_resumable());
        assert!(!TaskStatus::Done.is_resumable());

        assert!(TaskStatus::Suspended.is_live());
        assert!(TaskStatus::Running.is_live());
        assert!(!TaskStatus::Done.is_live());
    }
}
