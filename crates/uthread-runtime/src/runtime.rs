//! Task slot pool
//!
//! `TaskRuntime` owns every `TaskContext` it creates. Finished slots are
//! chained into a free list (`first_done`) and handed out again by
//! `create`, so stacks are only ever mapped up to the high-water mark of
//! concurrently live tasks.
//!
//! All methods take `&self`: a running task calls back into the runtime
//! (`yield_now`, `current`) while the resumer is still inside `resume`.
//! No `RefCell` borrow is ever held across a context switch.

use crate::context::{ResumeOutcome, TaskContext};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use uthread_core::{TaskId, TaskStatus, UThreadResult};

struct TaskSlot {
    /// Owned; allocated with Box::into_raw, freed in TaskRuntime::drop
    context: NonNull<TaskContext>,
    status: TaskStatus,
    next_done: Option<usize>,
}

pub struct TaskRuntime {
    stack_size: usize,
    stack_protect: bool,
    slots: RefCell<Vec<TaskSlot>>,
    first_done: Cell<Option<usize>>,
    current: Cell<TaskId>,
    unfinished: Cell<usize>,
}

impl TaskRuntime {
    pub fn new(stack_size: usize, stack_protect: bool) -> Self {
        Self {
            stack_size,
            stack_protect,
            slots: RefCell::new(Vec::new()),
            first_done: Cell::new(None),
            current: Cell::new(TaskId::NONE),
            unfinished: Cell::new(0),
        }
    }

    /// Create a suspended task that will run `func` on its first resume
    ///
    /// Reuses a finished slot when one is free; otherwise maps a new stack,
    /// which is the only way this can fail.
    pub fn create<F>(&self, func: F) -> UThreadResult<TaskId>
    where
        F: FnOnce() + 'static,
    {
        let func: Box<dyn FnOnce()> = Box::new(func);

        let index = match self.first_done.get() {
            Some(index) => {
                let mut slots = self.slots.borrow_mut();
                let slot = &mut slots[index];
                self.first_done.set(slot.next_done.take());
                slot.status = TaskStatus::Suspended;
                // SAFETY: the slot is Done, so its context is idle
                unsafe { TaskContext::make(slot.context.as_ptr(), func) };
                index
            }
            None => {
                let context = TaskContext::new(self.stack_size, self.stack_protect)?;
                let context = NonNull::from(Box::leak(context));
                // SAFETY: fresh, heap-pinned context
                unsafe { TaskContext::make(context.as_ptr(), func) };
                let mut slots = self.slots.borrow_mut();
                slots.push(TaskSlot {
                    context,
                    status: TaskStatus::Suspended,
                    next_done: None,
                });
                slots.len() - 1
            }
        };

        self.unfinished.set(self.unfinished.get() + 1);
        Ok(TaskId::from(index))
    }

    /// Run task `id` until it yields or finishes
    ///
    /// Returns false, doing nothing, unless the task is `Suspended`.
    pub fn resume(&self, id: TaskId) -> bool {
        let context = {
            let mut slots = self.slots.borrow_mut();
            match slots.get_mut(id.index()) {
                Some(slot) if slot.status.is_resumable() => {
                    slot.status = TaskStatus::Running;
                    slot.context
                }
                _ => return false,
            }
        };

        let previous = self.current.replace(id);
        // SAFETY: the context is owned by this runtime and was Suspended
        let outcome = unsafe { TaskContext::resume(context.as_ptr()) };
        if outcome == ResumeOutcome::Finished {
            self.on_task_done(id);
        }
        self.current.set(previous);
        true
    }

    /// Suspend the running task and return to its resumer
    ///
    /// Returns false when called outside of any task.
    pub fn yield_now(&self) -> bool {
        let id = self.current.get();
        if id.is_none() {
            return false;
        }
        let context = {
            let mut slots = self.slots.borrow_mut();
            let slot = &mut slots[id.index()];
            slot.status = TaskStatus::Suspended;
            slot.context
        };
        // SAFETY: we are on this context's stack
        unsafe { TaskContext::yield_now(context.as_ptr()) };
        true
    }

    /// Completion callback: push the finished slot onto the free list
    fn on_task_done(&self, id: TaskId) {
        let mut slots = self.slots.borrow_mut();
        let slot = &mut slots[id.index()];
        slot.status = TaskStatus::Done;
        slot.next_done = self.first_done.replace(Some(id.index()));
        self.unfinished.set(self.unfinished.get().saturating_sub(1));
        self.current.set(TaskId::NONE);
    }

    /// Task currently executing, if called from inside one
    #[inline]
    pub fn current(&self) -> Option<TaskId> {
        self.current.get().to_option()
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.slots.borrow().get(id.index()).map(|slot| slot.status)
    }

    #[inline]
    pub fn is_all_done(&self) -> bool {
        self.unfinished.get() == 0
    }

    #[inline]
    pub fn unfinished_count(&self) -> usize {
        self.unfinished.get()
    }

    /// Number of slots ever allocated (live plus free)
    pub fn slot_count(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }
}

impl Drop for TaskRuntime {
    fn drop(&mut self) {
        // Suspended tasks never run again; whatever lives on their stacks
        // is unmapped with them
        for slot in self.slots.get_mut().drain(..) {
            unsafe { drop(Box::from_raw(slot.context.as_ptr())) };
        }
    }
}
