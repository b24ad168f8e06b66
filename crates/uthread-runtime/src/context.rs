//! One suspendable execution context
//!
//! A `TaskContext` pairs a private stack with two register files: the
//! task's own, and the one of whoever resumed it last. `resume` saves the
//! resumer into the second and loads the first; `yield_now` does the
//! reverse. When the task function returns the context marks itself
//! finished and switches back one final time.
//!
//! Contexts are switched through raw pointers: the task's code runs while
//! the resumer's `resume` call is still on the other stack, so neither side
//! may hold a Rust reference to the context across a switch.

use crate::arch::{self, SavedRegs};
use crate::memory::StackMemory;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use uthread_core::{kerror, MemoryError};

/// What happened when control came back from a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The task called `yield_now` and can be resumed again
    Yielded,
    /// The task function returned
    Finished,
}

pub struct TaskContext {
    regs: SavedRegs,
    caller: SavedRegs,
    stack: StackMemory,
    func: Option<Box<dyn FnOnce()>>,
    finished: bool,
}

impl TaskContext {
    /// Allocate a context with its own stack; call `make` before resuming
    pub fn new(stack_size: usize, stack_protect: bool) -> Result<Box<Self>, MemoryError> {
        Ok(Box::new(TaskContext {
            regs: SavedRegs::default(),
            caller: SavedRegs::default(),
            stack: StackMemory::new(stack_size, stack_protect)?,
            func: None,
            finished: true,
        }))
    }

    /// (Re)initialize to run `func` from the top of the stack
    ///
    /// # Safety
    ///
    /// The context must not be running or suspended mid-function, and it
    /// must not move until `func` has finished.
    pub unsafe fn make(this: *mut TaskContext, func: Box<dyn FnOnce()>) {
        let ctx = &mut *this;
        ctx.func = Some(func);
        ctx.finished = false;
        let top = ctx.stack.top();
        arch::init_context(&mut ctx.regs, top, task_main, this as usize);
    }

    /// Run the task until it yields or finishes
    ///
    /// # Safety
    ///
    /// `this` must point to a live context prepared by `make` that is not
    /// finished and not currently running.
    pub unsafe fn resume(this: *mut TaskContext) -> ResumeOutcome {
        arch::context_switch(&mut (*this).caller, &(*this).regs);
        if (*this).finished {
            ResumeOutcome::Finished
        } else {
            ResumeOutcome::Yielded
        }
    }

    /// Switch back to the most recent resumer
    ///
    /// # Safety
    ///
    /// Must be called from the task's own stack while it is running.
    pub unsafe fn yield_now(this: *mut TaskContext) {
        arch::context_switch(&mut (*this).regs, &(*this).caller);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stack(&self) -> &StackMemory {
        &self.stack
    }
}

/// First Rust frame on every task stack
extern "C" fn task_main(arg: usize) -> ! {
    let this = arg as *mut TaskContext;

    // SAFETY: `arg` is the context pointer handed to init_context by make()
    let func = unsafe { (*this).func.take() };
    if let Some(func) = func {
        // Unwinding must not cross the hand-written entry frame
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(func)) {
            kerror!("task panicked: {}", panic_message(payload.as_ref()));
        }
    }

    unsafe {
        (*this).finished = true;
        arch::context_switch(&mut (*this).regs, &(*this).caller);
    }

    // A finished context is only ever re-entered after make()
    std::process::abort()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_resume_yield_finish() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let ctx = Box::into_raw(TaskContext::new(64 * 1024, false).unwrap());

        let l = log.clone();
        unsafe {
            TaskContext::make(
                ctx,
                Box::new(move || {
                    l.borrow_mut().push(1);
                    TaskContext::yield_now(ctx);
                    l.borrow_mut().push(3);
                }),
            );

            assert_eq!(TaskContext::resume(ctx), ResumeOutcome::Yielded);
            log.borrow_mut().push(2);
            assert_eq!(TaskContext::resume(ctx), ResumeOutcome::Finished);
            assert!((*ctx).is_finished());
            drop(Box::from_raw(ctx));
        }
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_make_reuses_stack() {
        let counter = Rc::new(RefCell::new(0));
        let ctx = Box::into_raw(TaskContext::new(64 * 1024, true).unwrap());
        for _ in 0..3 {
            let c = counter.clone();
            unsafe {
                TaskContext::make(ctx, Box::new(move || *c.borrow_mut() += 1));
                assert_eq!(TaskContext::resume(ctx), ResumeOutcome::Finished);
            }
        }
        unsafe { drop(Box::from_raw(ctx)) };
        assert_eq!(*counter.borrow(), 3);
    }

    #[test]
    fn test_panic_is_contained() {
        let ctx = Box::into_raw(TaskContext::new(64 * 1024, false).unwrap());
        unsafe {
            TaskContext::make(ctx, Box::new(|| panic!("boom")));
            assert_eq!(TaskContext::resume(ctx), ResumeOutcome::Finished);
            drop(Box::from_raw(ctx));
        }
    }

    #[test]
    fn test_deep_stack_usage() {
        fn depth(n: u32) -> u32 {
            let pad = [n as u8; 64];
            if n == 0 { pad[0] as u32 } else { depth(n - 1) + pad[1] as u32 % 2 }
        }
        let out = Rc::new(RefCell::new(0));
        let o = out.clone();
        let ctx = Box::into_raw(TaskContext::new(256 * 1024, true).unwrap());
        unsafe {
            TaskContext::make(ctx, Box::new(move || *o.borrow_mut() = depth(200)));
            TaskContext::resume(ctx);
            drop(Box::from_raw(ctx));
        }
        assert_eq!(*out.borrow(), 100);
    }
}
