//! Task stack memory
//!
//! Each task owns one `StackMemory`: a private mapping, optionally fenced
//! by inaccessible guard pages on both sides so an overflow faults instead
//! of corrupting a neighbour.
//!
//! ```text
//! base                                                   base + total
//! | guard (PROT_NONE) |        stack (RW)        | guard (PROT_NONE) |
//!                      ^ bottom                  ^ top (stack grows down)
//! ```

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::page_size;
    } else {
        compile_error!("Unsupported platform");
    }
}

use std::ptr::NonNull;

/// Exclusively owned, fixed-size task stack
pub struct StackMemory {
    /// Start of the whole mapping (including the lower guard)
    base: NonNull<u8>,

    /// Mapping length, guards included
    total_size: usize,

    /// Usable stack bytes (page rounded)
    stack_size: usize,

    /// Guard bytes on each side, 0 when unprotected
    guard_size: usize,
}

impl StackMemory {
    /// Lowest usable address
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        // SAFETY: guard_size < total_size, stays inside the mapping
        unsafe { self.base.as_ptr().add(self.guard_size) }
    }

    /// One past the highest usable address; initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        // SAFETY: guard + stack <= total_size
        unsafe { self.bottom().add(self.stack_size) }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.stack_size
    }

    #[inline]
    pub fn is_protected(&self) -> bool {
        self.guard_size != 0
    }

    #[inline]
    pub fn guard_size(&self) -> usize {
        self.guard_size
    }
}

impl std::fmt::Debug for StackMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackMemory")
            .field("bottom", &self.bottom())
            .field("size", &self.stack_size)
            .field("guard", &self.guard_size)
            .finish()
    }
}
