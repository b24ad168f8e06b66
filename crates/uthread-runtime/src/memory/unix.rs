//! Unix stack allocation using mmap

use super::StackMemory;
use std::ptr::NonNull;
use std::sync::OnceLock;
use uthread_core::constants::GUARD_SIZE;
use uthread_core::MemoryError;

/// System page size, cached
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            GUARD_SIZE
        }
    })
}

impl StackMemory {
    /// Map a stack of at least `stack_size` bytes
    ///
    /// With `protect`, one page on each side of the usable range is set to
    /// PROT_NONE.
    pub fn new(stack_size: usize, protect: bool) -> Result<Self, MemoryError> {
        let page = page_size();
        if stack_size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let stack_size = stack_size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or(MemoryError::InvalidSize)?;
        let guard_size = if protect { page } else { 0 };
        let total_size = stack_size
            .checked_add(2 * guard_size)
            .ok_or(MemoryError::InvalidSize)?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        let base = NonNull::new(base as *mut u8).ok_or(MemoryError::AllocationFailed)?;

        let stack = StackMemory {
            base,
            total_size,
            stack_size,
            guard_size,
        };

        if protect {
            // Dropping `stack` on failure unmaps the whole region
            let low = stack.base.as_ptr();
            let high = stack.top();
            for guard in [low, high] {
                let ret = unsafe {
                    libc::mprotect(guard as *mut libc::c_void, guard_size, libc::PROT_NONE)
                };
                if ret != 0 {
                    return Err(MemoryError::ProtectionFailed);
                }
            }
        }

        Ok(stack)
    }
}

impl Drop for StackMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.total_size);
        }
    }
}
