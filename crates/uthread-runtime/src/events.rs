//! Readiness interest / result masks

use bitflags::bitflags;

bitflags! {
    /// epoll readiness bits, as requested by `poll` and reported back
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Events: u32 {
        const READABLE = libc::EPOLLIN as u32;
        const WRITABLE = libc::EPOLLOUT as u32;
        const PRIORITY = libc::EPOLLPRI as u32;
        const ERROR = libc::EPOLLERR as u32;
        const HANGUP = libc::EPOLLHUP as u32;
        const READ_HANGUP = libc::EPOLLRDHUP as u32;
    }
}

/// Why a suspended handle's task was resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wakeup {
    /// Nothing recorded yet (or resumed by an external callback)
    Pending,
    /// The multiplexer reported these bits
    Ready(Events),
    /// The handle's timer expired
    Timeout,
    /// The scheduler is shutting down
    Closed,
}
