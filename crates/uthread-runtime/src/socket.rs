//! Connection handles and the blocking-shim I/O primitives
//!
//! A `UThreadSocket` wraps a non-blocking descriptor owned by one
//! scheduler. Its operations look blocking to the calling task: each tries
//! the syscall first and, only when it would block, parks the task in
//! `Scheduler::poll` until the descriptor is ready or the timeout fires.
//!
//! The descriptor is closed exactly once: by `close()`, or when the last
//! handle clone is dropped.

use crate::events::{Events, Wakeup};
use crate::scheduler::{Scheduler, Shared};
use crate::timer::TimerNode;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use uthread_core::constants::NO_TIMEOUT;
use uthread_core::{TaskId, UThreadError, UThreadResult};

pub(crate) struct SocketState {
    scheduler: Weak<Shared>,
    fd: Cell<RawFd>,
    socket_timeout_ms: Cell<i32>,
    connect_timeout_ms: Cell<i32>,
    pub(crate) waited: Cell<Wakeup>,
    pub(crate) task_id: Cell<TaskId>,
    pub(crate) timer_id: Cell<usize>,
    pub(crate) poll_key: Cell<Option<usize>>,
    lazy_destroy: Cell<bool>,
    arg: RefCell<Option<Box<dyn Any>>>,
}

impl Drop for SocketState {
    fn drop(&mut self) {
        let fd = self.fd.replace(-1);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }
}

/// Handle to one multiplexed descriptor; clones share the same state
#[derive(Clone)]
pub struct UThreadSocket {
    pub(crate) state: Rc<SocketState>,
}

impl TimerNode for UThreadSocket {
    #[inline]
    fn set_timer_id(&self, timer_id: usize) {
        self.state.timer_id.set(timer_id);
    }
}

impl UThreadSocket {
    pub(crate) fn new(
        scheduler: Weak<Shared>,
        fd: RawFd,
        socket_timeout_ms: i32,
        connect_timeout_ms: i32,
    ) -> Self {
        Self {
            state: Rc::new(SocketState {
                scheduler,
                fd: Cell::new(fd),
                socket_timeout_ms: Cell::new(socket_timeout_ms),
                connect_timeout_ms: Cell::new(connect_timeout_ms),
                waited: Cell::new(Wakeup::Pending),
                task_id: Cell::new(TaskId::NONE),
                timer_id: Cell::new(0),
                poll_key: Cell::new(None),
                lazy_destroy: Cell::new(false),
                arg: RefCell::new(None),
            }),
        }
    }

    /// Owning scheduler, or `SchedulerClosed` once it is gone
    pub fn scheduler(&self) -> UThreadResult<Scheduler> {
        self.state
            .scheduler
            .upgrade()
            .map(Scheduler::from_shared)
            .ok_or(UThreadError::SchedulerClosed)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.state.fd.get()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.fd() >= 0
    }

    /// Task last parked on this handle
    #[inline]
    pub fn task_id(&self) -> TaskId {
        self.state.task_id.get()
    }

    /// Readiness recorded by the last wakeup, empty unless it was readiness
    pub fn readiness(&self) -> Events {
        match self.state.waited.get() {
            Wakeup::Ready(ev) => ev,
            _ => Events::empty(),
        }
    }

    pub fn socket_timeout_ms(&self) -> i32 {
        self.state.socket_timeout_ms.get()
    }

    pub fn set_socket_timeout(&self, timeout_ms: i32) {
        self.state.socket_timeout_ms.set(timeout_ms);
    }

    pub fn connect_timeout_ms(&self) -> i32 {
        self.state.connect_timeout_ms.get()
    }

    pub fn set_connect_timeout(&self, timeout_ms: i32) {
        self.state.connect_timeout_ms.set(timeout_ms);
    }

    /// Store the per-connection argument, replacing any previous one
    pub fn set_arg<T: 'static>(&self, value: T) {
        *self.state.arg.borrow_mut() = Some(Box::new(value));
    }

    /// Take the argument if it holds a `T`; leaves other types in place
    pub fn take_arg<T: 'static>(&self) -> Option<T> {
        let mut slot = self.state.arg.borrow_mut();
        match slot.take() {
            Some(boxed) => match boxed.downcast::<T>() {
                Ok(value) => Some(*value),
                Err(other) => {
                    *slot = Some(other);
                    None
                }
            },
            None => None,
        }
    }

    pub fn has_arg(&self) -> bool {
        self.state.arg.borrow().is_some()
    }

    /// Mark for deferred close: the owning task has given up on it, but a
    /// late wakeup may still target it
    pub fn set_lazy_destroy(&self) {
        self.state.lazy_destroy.set(true);
    }

    pub fn is_lazy_destroy(&self) -> bool {
        self.state.lazy_destroy.get()
    }

    /// Close the descriptor now; later calls are no-ops
    pub fn close(&self) {
        let fd = self.state.fd.replace(-1);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
    }

    /// Park the calling task until `interest` is ready; see `Scheduler::poll`
    pub fn poll(&self, interest: Events, timeout_ms: i32) -> UThreadResult<Events> {
        self.scheduler()?.poll(self, interest, timeout_ms)
    }

    /// Park until ready, treating mismatched readiness as "try again"
    fn wait_ready(&self, interest: Events, timeout_ms: i32) -> UThreadResult<()> {
        match self.poll(interest, timeout_ms) {
            Ok(_) | Err(UThreadError::MismatchedEvents(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Accept one connection from a listening descriptor
    ///
    /// The returned descriptor is non-blocking and close-on-exec.
    pub fn accept(&self) -> UThreadResult<RawFd> {
        loop {
            let fd = unsafe {
                libc::accept4(
                    self.fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd >= 0 {
                return Ok(fd);
            }
            match errno() {
                libc::EAGAIN | libc::ECONNABORTED => self.wait_ready(Events::READABLE, NO_TIMEOUT)?,
                libc::EINTR => {}
                err => return Err(UThreadError::Io(err)),
            }
        }
    }

    /// Connect to `addr`, bounded by the connect timeout
    pub fn connect(&self, addr: &SocketAddr) -> UThreadResult<()> {
        let (storage, len) = socket_addr_to_raw(addr);
        let ret = unsafe {
            libc::connect(self.fd(), &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret == 0 {
            return Ok(());
        }
        match errno() {
            libc::EINPROGRESS => {}
            libc::ECONNREFUSED => return Err(UThreadError::Refused),
            err => return Err(UThreadError::Io(err)),
        }

        self.wait_ready(Events::WRITABLE, self.connect_timeout_ms())?;

        let mut so_error: libc::c_int = 0;
        let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_error as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        };
        if ret != 0 {
            return Err(UThreadError::last_os_error());
        }
        match so_error {
            0 => Ok(()),
            libc::ECONNREFUSED => Err(UThreadError::Refused),
            err => Err(UThreadError::Io(err)),
        }
    }

    /// Receive into `buf`; `Ok(0)` means orderly shutdown by the peer
    pub fn recv(&self, buf: &mut [u8]) -> UThreadResult<usize> {
        loop {
            let n = unsafe {
                libc::recv(self.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            self.retry_or_fail(Events::READABLE)?;
        }
    }

    /// Send all of `buf`
    pub fn send(&self, buf: &[u8]) -> UThreadResult<usize> {
        let mut sent = 0;
        while sent < buf.len() {
            let rest = &buf[sent..];
            let n = unsafe {
                libc::send(
                    self.fd(),
                    rest.as_ptr() as *const libc::c_void,
                    rest.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n >= 0 {
                sent += n as usize;
                continue;
            }
            self.retry_or_fail(Events::WRITABLE)?;
        }
        Ok(sent)
    }

    /// `read(2)` for non-socket descriptors such as pipes
    pub fn read(&self, buf: &mut [u8]) -> UThreadResult<usize> {
        loop {
            let n = unsafe { libc::read(self.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            self.retry_or_fail(Events::READABLE)?;
        }
    }

    /// `write(2)` of the whole buffer for non-socket descriptors
    pub fn write(&self, buf: &[u8]) -> UThreadResult<usize> {
        let mut written = 0;
        while written < buf.len() {
            let rest = &buf[written..];
            let n = unsafe { libc::write(self.fd(), rest.as_ptr() as *const libc::c_void, rest.len()) };
            if n >= 0 {
                written += n as usize;
                continue;
            }
            self.retry_or_fail(Events::WRITABLE)?;
        }
        Ok(written)
    }

    /// After a failed syscall: park on EAGAIN, retry on EINTR, else fail
    fn retry_or_fail(&self, interest: Events) -> UThreadResult<()> {
        match errno() {
            libc::EAGAIN => self.wait_ready(interest, self.socket_timeout_ms()),
            libc::EINTR => Ok(()),
            libc::ECONNREFUSED => Err(UThreadError::Refused),
            err => Err(UThreadError::Io(err)),
        }
    }

    /// Address of the connected peer
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getpeername(self.fd(), &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return None;
        }
        socket_addr_from_raw(&storage)
    }
}

impl std::fmt::Debug for UThreadSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UThreadSocket")
            .field("fd", &self.fd())
            .field("task", &self.task_id())
            .field("timer_id", &self.state.timer_id.get())
            .field("lazy_destroy", &self.is_lazy_destroy())
            .finish()
    }
}

#[inline]
pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Put `fd` into non-blocking mode
pub(crate) fn set_nonblocking(fd: RawFd) -> UThreadResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(UThreadError::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0 {
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(UThreadError::last_os_error());
        }
    }
    Ok(())
}

/// Best effort TCP_NODELAY; silently ignored for non-TCP descriptors
pub(crate) fn set_nodelay(fd: RawFd) {
    let opt: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// New non-blocking TCP socket for `addr`'s family
pub(crate) fn tcp_socket_for(addr: &SocketAddr) -> UThreadResult<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(family, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0)
    };
    if fd < 0 {
        return Err(UThreadError::last_os_error());
    }
    Ok(fd)
}

pub(crate) fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

pub(crate) fn socket_addr_from_raw(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_roundtrip() {
        for addr in ["127.0.0.1:8080", "[::1]:443", "10.1.2.3:1"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let (raw, len) = socket_addr_to_raw(&addr);
            assert!(len as usize <= mem::size_of::<libc::sockaddr_storage>());
            assert_eq!(socket_addr_from_raw(&raw), Some(addr));
        }
    }

    #[test]
    fn test_arg_slot_is_typed() {
        let socket = UThreadSocket::new(Weak::new(), -1, 100, 100);
        assert!(!socket.has_arg());
        socket.set_arg(String::from("resp"));
        assert!(socket.has_arg());
        assert_eq!(socket.take_arg::<u32>(), None);
        assert!(socket.has_arg());
        assert_eq!(socket.take_arg::<String>().as_deref(), Some("resp"));
        assert!(!socket.has_arg());
    }

    #[test]
    fn test_orphan_socket_reports_closed_scheduler() {
        let socket = UThreadSocket::new(Weak::new(), -1, 100, 100);
        assert_eq!(socket.poll(Events::READABLE, 10), Err(UThreadError::SchedulerClosed));
        assert!(!socket.is_open());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let socket = UThreadSocket::new(Weak::new(), fds[0], NO_TIMEOUT, NO_TIMEOUT);
        socket.close();
        assert!(!socket.is_open());
        socket.close();
        drop(socket);
        unsafe { libc::close(fds[1]) };
    }
}
