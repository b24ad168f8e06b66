//! Deadlines and the monotonic millisecond clock
//!
//! All deadlines in the runtime are absolute milliseconds on a process-wide
//! monotonic clock (`now_ms`). A negative timeout maps to `u64::MAX`, which
//! keeps "wait forever" on the same code path as every other timer.

pub mod heap;

pub use heap::{TimerHeap, TimerNode};

use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic milliseconds since the first call in this process
#[inline]
pub fn now_ms() -> u64 {
    epoch().elapsed().as_millis() as u64
}

/// Absolute deadline `timeout_ms` from now; negative means never
#[inline]
pub fn deadline_after(timeout_ms: i32) -> u64 {
    if timeout_ms < 0 {
        u64::MAX
    } else {
        now_ms().saturating_add(timeout_ms as u64)
    }
}

/// Milliseconds elapsed since `since_ms`, saturating at zero
#[inline]
pub fn elapsed_since(since_ms: u64) -> u64 {
    now_ms().saturating_sub(since_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a + 4);
        assert!(elapsed_since(a) >= 4);
        assert_eq!(elapsed_since(u64::MAX), 0);
    }

    #[test]
    fn test_deadline_after() {
        assert_eq!(deadline_after(uthread_core::constants::NO_TIMEOUT), u64::MAX);
        let d = deadline_after(100);
        let now = now_ms();
        assert!(d >= now && d <= now + 100);
    }
}
