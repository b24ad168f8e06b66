//! Task identifier type

use core::fmt;

/// Identifier of a cooperative task inside one `TaskRuntime`
///
/// The value is the index of the task's slot. Slots are recycled, so an id
/// is only meaningful while the task it was returned for is unfinished.
/// `u32::MAX` is reserved as the "no task" sentinel, which lets handles keep
/// the owning task in a plain `Cell<TaskId>`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TaskId(u32);

impl TaskId {
    /// Sentinel value indicating no task
    pub const NONE: TaskId = TaskId(u32::MAX);

    #[inline]
    pub const fn new(id: u32) -> Self {
        TaskId(id)
    }

    /// Slot index for this id
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    pub const fn to_option(self) -> Option<TaskId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<usize> for TaskId {
    #[inline]
    fn from(index: usize) -> Self {
        debug_assert!(index < u32::MAX as usize);
        TaskId(index as u32)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "TaskId(NONE)")
        } else {
            write!(f, "TaskId({})", self.0)
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for TaskId {
    fn default() -> Self {
        TaskId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_index() {
        let id = TaskId::from(7usize);
        assert_eq!(id.index(), 7);
        assert_eq!(id.as_u32(), 7);
        assert_eq!(id.to_option(), Some(id));
    }

    #[test]
    fn test_task_id_none() {
        assert!(TaskId::NONE.is_none());
        assert!(TaskId::default().is_none());
        assert_eq!(TaskId::NONE.to_option(), None);
        assert_eq!(format!("{}", TaskId::NONE), "none");
        assert_eq!(format!("{:?}", TaskId::new(3)), "TaskId(3)");
    }
}
