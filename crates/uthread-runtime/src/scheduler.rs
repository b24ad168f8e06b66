//! Event-loop scheduler
//!
//! One `Scheduler` per OS thread. It owns a `TaskRuntime`, a `TimerHeap`,
//! an epoll instance and a cross-thread task queue, and drives them from a
//! single dispatch loop:
//!
//! 1. turn queued functions (local and remote) into tasks, resume each once
//! 2. `epoll_wait` for at most a few milliseconds
//! 3. resume the task parked on every ready descriptor
//! 4. drain the active-socket hook
//! 5. run the new-request and accepted-fd hooks
//! 6. on close, resume every parked task with `SchedulerClosed` and stop
//! 7. resume tasks whose timers expired
//!
//! The handle is `Rc`-based and `!Send`. Other threads reach a scheduler
//! only through `RemoteScheduler`.

use crate::config::RuntimeConfig;
use crate::events::{Events, Wakeup};
use crate::notifier::EpollNotifier;
use crate::runtime::TaskRuntime;
use crate::socket::{errno, set_nodelay, set_nonblocking, UThreadSocket};
use crate::timer::{deadline_after, now_ms, TimerHeap};
use crossbeam_queue::SegQueue;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uthread_core::constants::{EPOLL_WAIT_TIMEOUT_MS, NO_TIMEOUT};
use uthread_core::{kdebug, kerror, TaskId, UThreadError, UThreadResult};

type LocalTask = Box<dyn FnOnce(Scheduler)>;
type RemoteTask = Box<dyn FnOnce(Scheduler) + Send>;
type ActiveSocketFn = Rc<dyn Fn(&Scheduler) -> Option<UThreadSocket>>;
type HookFn = Rc<dyn Fn(&Scheduler)>;

const EVENT_BATCH: usize = 256;
const PREALLOC_LIMIT: usize = 1024;

/// The thread-safe part of a scheduler
pub(crate) struct RemoteShared {
    queue: SegQueue<RemoteTask>,
    closed: AtomicBool,
    pub(crate) notifier: EpollNotifier,
}

pub(crate) struct Shared {
    runtime: TaskRuntime,
    timers: RefCell<TimerHeap<UThreadSocket>>,
    epoll: OwnedFd,
    registered: RefCell<Slab<UThreadSocket>>,
    todo: RefCell<VecDeque<LocalTask>>,
    remote: Arc<RemoteShared>,
    max_task: usize,
    /// Internal tasks not counted against `max_task`
    reserved: Cell<usize>,
    run_forever: Cell<bool>,
    active_socket_func: RefCell<Option<ActiveSocketFn>>,
    new_request_func: RefCell<Option<HookFn>>,
    accepted_fd_func: RefCell<Option<HookFn>>,
    events: Cell<Vec<libc::epoll_event>>,
    wake_read: RefCell<Option<OwnedFd>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.remote.closed.store(true, Ordering::Release);
    }
}

/// Handle to a thread-local event loop; clones share the same loop
#[derive(Clone)]
pub struct Scheduler {
    shared: Rc<Shared>,
}

impl Scheduler {
    /// Build a scheduler whose tasks get `stack_size` byte stacks and at
    /// most `max_task` of which may be live or queued at once
    pub fn new(stack_size: usize, max_task: usize, stack_protect: bool) -> UThreadResult<Self> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(UThreadError::last_os_error());
        }
        // SAFETY: freshly created and owned by nobody else
        let epoll = unsafe { OwnedFd::from_raw_fd(raw) };
        let (notifier, wake_read) = EpollNotifier::new()?;

        Ok(Self {
            shared: Rc::new(Shared {
                runtime: TaskRuntime::new(stack_size, stack_protect),
                timers: RefCell::new(TimerHeap::with_capacity(max_task.min(PREALLOC_LIMIT))),
                epoll,
                registered: RefCell::new(Slab::with_capacity(max_task.min(PREALLOC_LIMIT))),
                todo: RefCell::new(VecDeque::new()),
                remote: Arc::new(RemoteShared {
                    queue: SegQueue::new(),
                    closed: AtomicBool::new(false),
                    notifier,
                }),
                max_task,
                reserved: Cell::new(0),
                run_forever: Cell::new(false),
                active_socket_func: RefCell::new(None),
                new_request_func: RefCell::new(None),
                accepted_fd_func: RefCell::new(None),
                events: Cell::new(Vec::with_capacity(EVENT_BATCH)),
                wake_read: RefCell::new(Some(wake_read)),
            }),
        })
    }

    pub fn with_config(config: &RuntimeConfig) -> UThreadResult<Self> {
        Self::new(config.stack_size, config.max_task, config.stack_protect)
    }

    pub(crate) fn from_shared(shared: Rc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Rc::downgrade(&self.shared)
    }

    /// Thread-safe handle for waking, feeding and closing this loop
    pub fn remote(&self) -> RemoteScheduler {
        RemoteScheduler {
            shared: self.shared.remote.clone(),
        }
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Queue `func` to run as a new task on the next loop iteration
    pub fn add_task<F>(&self, func: F)
    where
        F: FnOnce(Scheduler) + 'static,
    {
        self.shared.todo.borrow_mut().push_back(Box::new(func));
    }

    /// True when live plus queued tasks have reached `max_task`
    pub fn is_task_full(&self) -> bool {
        let queued = self.shared.todo.borrow().len();
        let live = self.shared.runtime.unfinished_count().saturating_sub(self.shared.reserved.get());
        live + queued >= self.shared.max_task
    }

    pub fn unfinished_tasks(&self) -> usize {
        self.shared.runtime.unfinished_count()
    }

    /// Task running right now, if called from inside one
    pub fn current_task(&self) -> Option<TaskId> {
        self.shared.runtime.current()
    }

    /// Suspend the calling task; false outside a task
    pub fn yield_task(&self) -> bool {
        self.shared.runtime.yield_now()
    }

    /// Resume a suspended task; false if it is not suspended
    pub fn resume_task(&self, id: TaskId) -> bool {
        self.shared.runtime.resume(id)
    }

    fn consume_todo(&self) {
        loop {
            let local = self.shared.todo.borrow_mut().pop_front();
            let func = match local {
                Some(func) => func,
                None => match self.shared.remote.queue.pop() {
                    Some(func) => func as LocalTask,
                    None => break,
                },
            };
            let scheduler = self.clone();
            match self.shared.runtime.create(move || func(scheduler)) {
                Ok(id) => {
                    self.shared.runtime.resume(id);
                }
                Err(e) => {
                    kerror!("task creation failed: {}", e);
                    std::process::abort();
                }
            }
        }
    }

    // ========================================================================
    // Sockets
    // ========================================================================

    /// Adopt `fd`, switching it to non-blocking mode
    ///
    /// The returned handle owns the descriptor.
    pub fn create_socket(
        &self,
        fd: RawFd,
        socket_timeout_ms: i32,
        connect_timeout_ms: i32,
        no_delay: bool,
    ) -> UThreadResult<UThreadSocket> {
        set_nonblocking(fd)?;
        if no_delay {
            set_nodelay(fd);
        }
        Ok(UThreadSocket::new(self.downgrade(), fd, socket_timeout_ms, connect_timeout_ms))
    }

    /// Open a TCP connection from inside a task
    pub fn connect_tcp(
        &self,
        addr: &std::net::SocketAddr,
        socket_timeout_ms: i32,
        connect_timeout_ms: i32,
    ) -> UThreadResult<UThreadSocket> {
        let fd = crate::socket::tcp_socket_for(addr)?;
        let socket = self.create_socket(fd, socket_timeout_ms, connect_timeout_ms, true)?;
        socket.connect(addr)?;
        Ok(socket)
    }

    /// Park the calling task until `socket` reports any of `interest`
    ///
    /// A negative `timeout_ms` waits forever. Readiness that shares no bit
    /// with `interest` is returned as `MismatchedEvents`.
    pub fn poll(&self, socket: &UThreadSocket, interest: Events, timeout_ms: i32) -> UThreadResult<Events> {
        if self.is_closed() {
            return Err(UThreadError::SchedulerClosed);
        }
        let task = self.current_task().ok_or(UThreadError::Io(libc::EPERM))?;
        let state = &socket.state;
        state.task_id.set(task);
        state.waited.set(Wakeup::Pending);

        let key = self.shared.registered.borrow_mut().insert(socket.clone());
        let mut ev = libc::epoll_event {
            events: interest.bits(),
            u64: key as u64,
        };
        let ret = unsafe {
            libc::epoll_ctl(self.shared.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, socket.fd(), &mut ev)
        };
        if ret < 0 {
            let err = UThreadError::last_os_error();
            self.shared.registered.borrow_mut().remove(key);
            return Err(err);
        }
        state.poll_key.set(Some(key));

        self.park(socket, timeout_ms);

        if socket.fd() >= 0 {
            unsafe {
                libc::epoll_ctl(
                    self.shared.epoll.as_raw_fd(),
                    libc::EPOLL_CTL_DEL,
                    socket.fd(),
                    std::ptr::null_mut(),
                )
            };
        }
        self.shared.registered.borrow_mut().try_remove(key);
        state.poll_key.set(None);

        match state.waited.get() {
            Wakeup::Ready(ev) if ev.intersects(interest) => Ok(ev),
            Wakeup::Ready(ev) if !ev.is_empty() => Err(UThreadError::MismatchedEvents(ev.bits())),
            Wakeup::Timeout => Err(UThreadError::Timeout),
            Wakeup::Closed => Err(UThreadError::SchedulerClosed),
            _ => Err(UThreadError::PeerClosed),
        }
    }

    /// Park the calling task on `socket` without descriptor interest
    ///
    /// Woken by the active-socket hook, the timer or close.
    pub fn wait(&self, socket: &UThreadSocket, timeout_ms: i32) -> UThreadResult<()> {
        if self.is_closed() {
            return Err(UThreadError::SchedulerClosed);
        }
        let task = self.current_task().ok_or(UThreadError::Io(libc::EPERM))?;
        socket.state.task_id.set(task);
        socket.state.waited.set(Wakeup::Pending);

        self.park(socket, timeout_ms);

        match socket.state.waited.get() {
            Wakeup::Timeout => Err(UThreadError::Timeout),
            Wakeup::Closed => Err(UThreadError::SchedulerClosed),
            _ => Ok(()),
        }
    }

    /// Park until any socket in the group reports `interest`
    ///
    /// Returns how many became ready; each socket's `readiness()` tells
    /// which.
    pub fn poll_many(&self, sockets: &[UThreadSocket], interest: Events, timeout_ms: i32) -> UThreadResult<usize> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(UThreadError::last_os_error());
        }
        let group = UThreadSocket::new(self.downgrade(), raw, timeout_ms, timeout_ms);

        for (index, socket) in sockets.iter().enumerate() {
            socket.state.waited.set(Wakeup::Pending);
            let mut ev = libc::epoll_event {
                events: interest.bits(),
                u64: index as u64,
            };
            let ret = unsafe { libc::epoll_ctl(group.fd(), libc::EPOLL_CTL_ADD, socket.fd(), &mut ev) };
            if ret < 0 {
                return Err(UThreadError::last_os_error());
            }
        }

        self.poll(&group, Events::READABLE, timeout_ms)?;

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; sockets.len().max(1)];
        let n = unsafe { libc::epoll_wait(group.fd(), events.as_mut_ptr(), events.len() as i32, 0) };
        if n < 0 {
            return Err(UThreadError::last_os_error());
        }
        for ev in &events[..n as usize] {
            let bits = ev.events;
            if let Some(socket) = sockets.get(ev.u64 as usize) {
                socket.state.waited.set(Wakeup::Ready(Events::from_bits_retain(bits)));
            }
        }
        Ok(n as usize)
    }

    /// Arm the timer, yield, cancel the timer
    fn park(&self, socket: &UThreadSocket, timeout_ms: i32) {
        self.shared.timers.borrow_mut().add(deadline_after(timeout_ms), socket.clone());
        self.shared.runtime.yield_now();
        let timer_id = socket.state.timer_id.get();
        if timer_id != 0 {
            self.shared.timers.borrow_mut().remove(timer_id);
        }
    }

    /// Resume the task parked on `socket`, if it is still parked
    fn wake(&self, socket: &UThreadSocket) {
        if socket.state.timer_id.get() == 0 {
            kdebug!("stale wakeup for fd {}", socket.fd());
            return;
        }
        self.shared.runtime.resume(socket.task_id());
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    /// Called every iteration until it returns `None`; each returned
    /// socket's parked task is resumed
    pub fn set_active_socket_func<F>(&self, func: F)
    where
        F: Fn(&Scheduler) -> Option<UThreadSocket> + 'static,
    {
        *self.shared.active_socket_func.borrow_mut() = Some(Rc::new(func));
    }

    /// Called once per iteration, typically to pick new work into tasks
    pub fn set_handler_new_request_func<F>(&self, func: F)
    where
        F: Fn(&Scheduler) + 'static,
    {
        *self.shared.new_request_func.borrow_mut() = Some(Rc::new(func));
    }

    /// Called once per iteration, typically to adopt accepted descriptors
    pub fn set_handler_accepted_fd_func<F>(&self, func: F)
    where
        F: Fn(&Scheduler) + 'static,
    {
        *self.shared.accepted_fd_func.borrow_mut() = Some(Rc::new(func));
    }

    // ========================================================================
    // Loop
    // ========================================================================

    pub fn is_closed(&self) -> bool {
        self.shared.remote.closed.load(Ordering::Acquire)
    }

    /// Request shutdown; the loop resumes every parked task and returns
    pub fn close(&self) {
        self.remote().close();
    }

    /// Run until closed, starting the self-wake task first
    pub fn run_forever(&self) {
        self.shared.run_forever.set(true);
        let wake_read = self.shared.wake_read.borrow_mut().take();
        if let Some(fd) = wake_read {
            let socket = UThreadSocket::new(self.downgrade(), fd.into_raw_fd(), NO_TIMEOUT, NO_TIMEOUT);
            let remote = self.shared.remote.clone();
            self.shared.reserved.set(1);
            self.add_task(move |s| {
                remote.notifier.drain(&socket);
                s.shared.reserved.set(0);
            });
        }
        self.run();
    }

    /// Run until every task is done and nothing is queued (or until closed)
    pub fn run(&self) {
        let shared = &self.shared;
        loop {
            self.consume_todo();

            let timeout = match shared.timers.borrow().next_timeout_ms(now_ms()) {
                NO_TIMEOUT => EPOLL_WAIT_TIMEOUT_MS,
                t => t.min(EPOLL_WAIT_TIMEOUT_MS),
            };
            self.dispatch_ready(timeout);

            let active = shared.active_socket_func.borrow().clone();
            if let Some(active) = active {
                while let Some(socket) = active(self) {
                    self.wake(&socket);
                }
            }

            let new_request = shared.new_request_func.borrow().clone();
            if let Some(hook) = new_request {
                hook(self);
            }
            let accepted_fd = shared.accepted_fd_func.borrow().clone();
            if let Some(hook) = accepted_fd {
                hook(self);
            }

            if self.is_closed() {
                self.resume_all_closed();
                break;
            }

            self.deal_with_timeout();

            if !shared.run_forever.get()
                && shared.runtime.is_all_done()
                && shared.todo.borrow().is_empty()
                && shared.remote.queue.is_empty()
            {
                break;
            }
        }
    }

    fn dispatch_ready(&self, timeout_ms: i32) {
        let mut events = self.shared.events.take();
        events.clear();
        events.resize(EVENT_BATCH, libc::epoll_event { events: 0, u64: 0 });

        let n = unsafe {
            libc::epoll_wait(
                self.shared.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = errno();
            if err != libc::EINTR {
                kerror!("epoll_wait failed: errno {}", err);
            }
            self.shared.events.set(events);
            return;
        }

        for ev in &events[..n as usize] {
            let (bits, key) = (ev.events, ev.u64 as usize);
            let socket = self.shared.registered.borrow().get(key).cloned();
            if let Some(socket) = socket {
                socket.state.waited.set(Wakeup::Ready(Events::from_bits_retain(bits)));
                self.wake(&socket);
            }
        }
        self.shared.events.set(events);
    }

    fn deal_with_timeout(&self) {
        let now = now_ms();
        loop {
            let expired = self.shared.timers.borrow_mut().pop_expired(now);
            match expired {
                Some(socket) => {
                    socket.state.waited.set(Wakeup::Timeout);
                    self.shared.runtime.resume(socket.task_id());
                }
                None => break,
            }
        }
    }

    fn resume_all_closed(&self) {
        let parked = self.shared.timers.borrow_mut().take_all();
        for socket in parked {
            socket.state.waited.set(Wakeup::Closed);
            self.shared.runtime.resume(socket.task_id());
        }
        let dropped = mem::take(&mut *self.shared.todo.borrow_mut());
        let mut remote_dropped = 0;
        while self.shared.remote.queue.pop().is_some() {
            remote_dropped += 1;
        }
        if !dropped.is_empty() || remote_dropped > 0 {
            kdebug!("scheduler closed with {} queued tasks", dropped.len() + remote_dropped);
        }
    }
}

/// `Send + Sync` handle to a scheduler living on another thread
#[derive(Clone)]
pub struct RemoteScheduler {
    shared: Arc<RemoteShared>,
}

impl RemoteScheduler {
    /// Make the scheduler's current or next `epoll_wait` return promptly
    pub fn notify(&self) {
        self.shared.notifier.notify();
    }

    /// Queue `func` to run as a task on the scheduler's thread
    ///
    /// Returns false (dropping `func`) once the scheduler is closed.
    pub fn spawn<F>(&self, func: F) -> bool
    where
        F: FnOnce(Scheduler) + Send + 'static,
    {
        if self.is_closed() {
            return false;
        }
        self.shared.queue.push(Box::new(func));
        self.notify();
        true
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.notify();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RemoteScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteScheduler")
            .field("closed", &self.is_closed())
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn scheduler() -> Scheduler {
        Scheduler::new(64 * 1024, 64, false).unwrap()
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_run_drains_tasks() {
        let sched = scheduler();
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            sched.add_task(move |s| {
                log.borrow_mut().push(i);
                assert!(s.current_task().is_some());
            });
        }
        sched.run();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert_eq!(sched.unfinished_tasks(), 0);
    }

    #[test]
    fn test_wait_times_out() {
        let sched = scheduler();
        let (r, w) = pipe();
        let socket = sched.create_socket(r, 1000, 1000, false).unwrap();
        let result = Rc::new(Cell::new(None));
        let out = result.clone();
        sched.add_task(move |s| {
            let start = Instant::now();
            let res = s.wait(&socket, 20);
            out.set(Some((res, start.elapsed())));
        });
        sched.run();
        let (res, elapsed) = result.take().unwrap();
        assert_eq!(res, Err(UThreadError::Timeout));
        assert!(elapsed >= Duration::from_millis(19));
        unsafe { libc::close(w) };
    }

    #[test]
    fn test_poll_wakes_on_readiness() {
        let sched = scheduler();
        let (r, w) = pipe();
        let reader = sched.create_socket(r, 1000, 1000, false).unwrap();
        let writer = sched.create_socket(w, 1000, 1000, false).unwrap();
        let got = Rc::new(RefCell::new(Vec::new()));

        let out = got.clone();
        sched.add_task(move |_| {
            let mut buf = [0u8; 16];
            let n = reader.read(&mut buf).unwrap();
            out.borrow_mut().extend_from_slice(&buf[..n]);
        });
        let (r2, w2) = pipe();
        let timer = sched.create_socket(r2, 1000, 1000, false).unwrap();
        sched.add_task(move |s| {
            assert_eq!(s.wait(&timer, 10), Err(UThreadError::Timeout));
            writer.write(b"ping").unwrap();
        });
        sched.run();
        assert_eq!(&*got.borrow(), b"ping");
        unsafe { libc::close(w2) };
    }

    #[test]
    fn test_poll_outside_task_is_rejected() {
        let sched = scheduler();
        let (r, w) = pipe();
        let socket = sched.create_socket(r, 10, 10, false).unwrap();
        assert_eq!(socket.poll(Events::READABLE, 10), Err(UThreadError::Io(libc::EPERM)));
        assert_eq!(sched.wait(&socket, 10), Err(UThreadError::Io(libc::EPERM)));
        unsafe { libc::close(w) };
    }

    #[test]
    fn test_poll_many_reports_ready_member() {
        let sched = scheduler();
        let (r1, w1) = pipe();
        let (r2, w2) = pipe();
        let sockets = vec![
            sched.create_socket(r1, 1000, 1000, false).unwrap(),
            sched.create_socket(r2, 1000, 1000, false).unwrap(),
        ];
        assert_eq!(unsafe { libc::write(w2, b"x".as_ptr() as *const libc::c_void, 1) }, 1);

        let ready = Rc::new(Cell::new(0));
        let out = ready.clone();
        let group = sockets.clone();
        sched.add_task(move |s| {
            out.set(s.poll_many(&group, Events::READABLE, 1000).unwrap());
        });
        sched.run();
        assert_eq!(ready.get(), 1);
        assert!(sockets[0].readiness().is_empty());
        assert!(sockets[1].readiness().contains(Events::READABLE));
        unsafe {
            libc::close(w1);
            libc::close(w2);
        }
    }

    #[test]
    fn test_task_full_counts_queued() {
        let sched = Scheduler::new(64 * 1024, 2, false).unwrap();
        assert!(!sched.is_task_full());
        sched.add_task(|_| {});
        sched.add_task(|_| {});
        assert!(sched.is_task_full());
        sched.run();
        assert!(!sched.is_task_full());
    }

    #[test]
    fn test_active_socket_hook_resumes_waiter() {
        let sched = scheduler();
        let (r, w) = pipe();
        let socket = sched.create_socket(r, NO_TIMEOUT, NO_TIMEOUT, false).unwrap();
        let handed = Rc::new(RefCell::new(None::<UThreadSocket>));
        let done = Rc::new(Cell::new(false));

        let slot = handed.clone();
        let flag = done.clone();
        let waiter = socket.clone();
        sched.add_task(move |s| {
            *slot.borrow_mut() = Some(waiter.clone());
            assert_eq!(s.wait(&waiter, NO_TIMEOUT), Ok(()));
            assert_eq!(waiter.take_arg::<&str>(), Some("response"));
            flag.set(true);
        });
        let source = handed.clone();
        sched.set_active_socket_func(move |_| {
            let socket = source.borrow_mut().take()?;
            socket.set_arg("response");
            Some(socket)
        });
        sched.run();
        assert!(done.get());
        unsafe { libc::close(w) };
    }

    #[test]
    fn test_remote_spawn_and_close() {
        let sched = scheduler();
        let remote = sched.remote();
        let (r, w) = pipe();
        let parked = sched.create_socket(r, NO_TIMEOUT, NO_TIMEOUT, false).unwrap();
        let outcome = Rc::new(Cell::new(None));
        let out = outcome.clone();
        sched.add_task(move |s| out.set(Some(s.wait(&parked, NO_TIMEOUT))));

        let handle = std::thread::spawn(move || {
            let (tx, rx) = std::sync::mpsc::channel();
            assert!(remote.spawn(move |s| {
                tx.send(s.current_task().is_some()).unwrap();
            }));
            assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
            remote.close();
            assert!(!remote.spawn(|_| {}));
        });

        sched.run_forever();
        handle.join().unwrap();
        assert_eq!(outcome.take(), Some(Err(UThreadError::SchedulerClosed)));
        assert!(sched.is_closed());
        unsafe { libc::close(w) };
    }
}
