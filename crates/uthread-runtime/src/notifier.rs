//! Cross-thread wake channels
//!
//! `EpollNotifier` is the scheduler's own self-wake pipe. Its read side is
//! drained by a perpetual task inside the scheduler it wakes, so a byte
//! written from any thread makes the pending `epoll_wait` return. Writes are
//! coalesced: at most one byte is outstanding until the drain task runs.
//!
//! `UThreadNotifier<T>` is the same idea with a one-value mailbox attached,
//! for handing a result from an OS thread to a waiting task.

use crate::events::Events;
use crate::scheduler::Scheduler;
use crate::socket::UThreadSocket;
use nix::fcntl::OFlag;
use nix::unistd::{pipe2, write};
use parking_lot::Mutex;
use std::os::fd::{IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uthread_core::{kwarn, UThreadError, UThreadResult};

fn wake_pipe() -> UThreadResult<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(|e| UThreadError::Io(e as i32))
}

/// Write one wake byte; a full pipe already guarantees a wakeup
fn poke(fd: &OwnedFd) {
    match write(fd, &[1u8]) {
        Ok(_) | Err(nix::errno::Errno::EAGAIN) => {}
        Err(e) => kwarn!("wake write failed: {}", e),
    }
}

pub(crate) struct EpollNotifier {
    write_fd: OwnedFd,
    pending: AtomicBool,
}

impl EpollNotifier {
    /// The notifier plus the read end for the drain task
    pub(crate) fn new() -> UThreadResult<(Self, OwnedFd)> {
        let (read_fd, write_fd) = wake_pipe()?;
        Ok((
            Self {
                write_fd,
                pending: AtomicBool::new(false),
            },
            read_fd,
        ))
    }

    pub(crate) fn notify(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        poke(&self.write_fd);
    }

    /// Body of the drain task; returns when the scheduler closes
    pub(crate) fn drain(&self, socket: &UThreadSocket) {
        let mut buf = [0u8; 64];
        loop {
            self.pending.store(false, Ordering::Release);
            match socket.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(UThreadError::SchedulerClosed) => break,
                Err(e) => {
                    kwarn!("wake channel read failed: {}", e);
                    break;
                }
            }
        }
    }
}

struct Mailbox<T> {
    value: Mutex<Option<T>>,
    write_fd: OwnedFd,
}

/// Sending half of a `UThreadNotifier`, usable from any thread
pub struct NotifySender<T> {
    mailbox: Arc<Mailbox<T>>,
}

impl<T> Clone for NotifySender<T> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<T: Send> NotifySender<T> {
    /// Deliver `value`, replacing one that was never taken
    ///
    /// Returns false if an untaken value was overwritten.
    pub fn send(&self, value: T) -> bool {
        let replaced = self.mailbox.value.lock().replace(value).is_some();
        poke(&self.mailbox.write_fd);
        !replaced
    }
}

/// Single-value mailbox a task can block on
pub struct UThreadNotifier<T> {
    mailbox: Arc<Mailbox<T>>,
    socket: UThreadSocket,
}

impl<T: Send> UThreadNotifier<T> {
    /// Mailbox bound to `scheduler`; `wait` gives up after `timeout_ms`
    pub fn new(scheduler: &Scheduler, timeout_ms: i32) -> UThreadResult<Self> {
        let (read_fd, write_fd) = wake_pipe()?;
        let socket = scheduler.create_socket(read_fd.into_raw_fd(), timeout_ms, timeout_ms, false)?;
        Ok(Self {
            mailbox: Arc::new(Mailbox {
                value: Mutex::new(None),
                write_fd,
            }),
            socket,
        })
    }

    pub fn sender(&self) -> NotifySender<T> {
        NotifySender {
            mailbox: self.mailbox.clone(),
        }
    }

    pub fn has_value(&self) -> bool {
        self.mailbox.value.lock().is_some()
    }

    pub fn try_take(&self) -> Option<T> {
        self.mailbox.value.lock().take()
    }

    /// Park the calling task until a value arrives
    pub fn wait(&self) -> UThreadResult<T> {
        let mut buf = [0u8; 16];
        loop {
            if let Some(value) = self.try_take() {
                return Ok(value);
            }
            if self.socket.read(&mut buf)? == 0 {
                return Err(UThreadError::PeerClosed);
            }
        }
    }

    /// Park until any notifier holds a value; returns its index
    pub fn wait_any(notifiers: &[&UThreadNotifier<T>], timeout_ms: i32) -> UThreadResult<usize> {
        let first = notifiers.first().ok_or(UThreadError::Io(libc::EINVAL))?;
        let scheduler = first.socket.scheduler()?;
        let sockets: Vec<UThreadSocket> = notifiers.iter().map(|n| n.socket.clone()).collect();
        loop {
            if let Some(index) = notifiers.iter().position(|n| n.has_value()) {
                return Ok(index);
            }
            scheduler.poll_many(&sockets, Events::READABLE, timeout_ms)?;
        }
    }
}
