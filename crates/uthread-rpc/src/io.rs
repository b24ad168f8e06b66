//! The I/O half of a unit
//!
//! One OS thread runs a `Scheduler` forever with one task per connection.
//! A connection task decodes a request, admits it into the unit's
//! `DataFlow`, and parks in `Scheduler::wait` until the active-socket hook
//! hands it the response through the socket's argument slot.
//!
//! If the wait times out the task leaves without closing: the socket is
//! marked lazy-destroy and stays in the connection table, because a worker
//! may still answer it. Whichever response arrives later finds the mark
//! and performs the close instead of waking anyone.

use crate::config::ServerConfig;
use crate::data_flow::{ConnToken, DataFlow};
use crate::msg::{HandlerFactory, Message, MessageHandler, RequestOf, ResponseOf};
use crate::server::{ServerError, ServerStats};
use crate::stream::UThreadStream;
use crate::worker::WorkerPool;
use crossbeam_queue::ArrayQueue;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use uthread_core::{kdebug, kerror, kinfo, kwarn, UThreadError};
use uthread_runtime::{RemoteScheduler, Scheduler, UThreadSocket};

struct Conn {
    generation: u64,
    socket: UThreadSocket,
}

/// Releases a connection when its task leaves `serve`, unwinding included
struct ConnGuard<'a, F: HandlerFactory> {
    unit: &'a UnitState<F>,
    token: ConnToken,
    armed: bool,
}

impl<F: HandlerFactory> ConnGuard<'_, F> {
    /// Leave the connection for the response hook to close
    fn defer(mut self) {
        self.armed = false;
    }
}

impl<F: HandlerFactory> Drop for ConnGuard<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.unit.release(self.token);
        }
    }
}

/// State owned by the unit's I/O thread
struct UnitState<F: HandlerFactory> {
    index: usize,
    factory: Arc<F>,
    data_flow: Arc<DataFlow<RequestOf<F>, ResponseOf<F>>>,
    accept_queue: Arc<ArrayQueue<RawFd>>,
    pool: Arc<WorkerPool>,
    stats: Arc<ServerStats>,
    socket_timeout_ms: i32,
    max_queue_length: usize,
    conns: RefCell<Slab<Conn>>,
    next_generation: Cell<u64>,
}

impl<F: HandlerFactory> UnitState<F> {
    fn lookup(&self, token: ConnToken) -> Option<UThreadSocket> {
        self.conns
            .borrow()
            .get(token.key)
            .filter(|conn| conn.generation == token.generation)
            .map(|conn| conn.socket.clone())
    }

    /// Close the connection and forget it; a stale token is a no-op
    fn release(&self, token: ConnToken) {
        let removed = {
            let mut conns = self.conns.borrow_mut();
            match conns.get(token.key) {
                Some(conn) if conn.generation == token.generation => Some(conns.remove(token.key)),
                _ => None,
            }
        };
        if let Some(conn) = removed {
            conn.socket.close();
            self.stats.active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn adopt(self: &Rc<Self>, sched: &Scheduler, fd: RawFd) {
        let socket = match sched.create_socket(fd, self.socket_timeout_ms, self.socket_timeout_ms, true) {
            Ok(socket) => socket,
            Err(e) => {
                kwarn!("unit {}: cannot adopt fd {}: {}", self.index, fd, e);
                drop(unsafe { OwnedFd::from_raw_fd(fd) });
                self.stats.active.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        };

        let generation = self.next_generation.get() + 1;
        self.next_generation.set(generation);
        let key = self.conns.borrow_mut().insert(Conn {
            generation,
            socket: socket.clone(),
        });
        let token = ConnToken::new(key, generation);

        let unit = self.clone();
        sched.add_task(move |s| unit.serve(&s, token, socket));
    }

    /// Request/response loop of one connection
    fn serve(&self, sched: &Scheduler, token: ConnToken, socket: UThreadSocket) {
        let guard = ConnGuard {
            unit: self,
            token,
            armed: true,
        };
        let mut handler = self.factory.create();
        let mut stream = UThreadStream::new(socket.clone());

        loop {
            let req = match handler.recv_request(&mut stream) {
                Ok(req) => req,
                Err(e) => {
                    if e.is_violation() {
                        kdebug!("unit {}: conn {}: {}", self.index, token.key, e);
                    }
                    break;
                }
            };
            let keep_alive = handler.keep_alive();

            if let Err(e) = self.data_flow.admit_request(token, req, self.max_queue_length) {
                self.stats.queue_full.fetch_add(1, Ordering::Relaxed);
                kwarn!("unit {}: {}, closing conn {}", self.index, e, token.key);
                break;
            }
            self.stats.requests.fetch_add(1, Ordering::Relaxed);
            self.pool.notify_epoll();

            match sched.wait(&socket, self.socket_timeout_ms) {
                Ok(()) => {}
                Err(UThreadError::Timeout) => {
                    kdebug!("unit {}: conn {} timed out awaiting response", self.index, token.key);
                    socket.set_lazy_destroy();
                    stream.detach();
                    guard.defer();
                    return;
                }
                Err(_) => break,
            }

            let Some(resp) = socket.take_arg::<ResponseOf<F>>() else {
                break;
            };
            if resp.is_fake() {
                break;
            }
            if resp.send(&mut stream).is_err() || stream.flush().is_err() {
                break;
            }
            if !keep_alive {
                break;
            }
        }

        stream.detach();
        drop(guard);
    }

    /// Active-socket hook: route one response to its parked connection
    fn next_ready(&self) -> Option<UThreadSocket> {
        loop {
            let out = self.data_flow.pick_response()?;
            let Some(socket) = self.lookup(out.token) else {
                kdebug!("unit {}: response for closed conn {} dropped", self.index, out.token.key);
                continue;
            };
            if socket.is_lazy_destroy() {
                self.release(out.token);
                continue;
            }
            socket.set_arg(out.payload);
            return Some(socket);
        }
    }

    /// Accepted-fd hook: one task per queued descriptor, while there is room
    fn adopt_queued(self: &Rc<Self>, sched: &Scheduler) {
        while !sched.is_task_full() {
            let Some(fd) = self.accept_queue.pop() else {
                break;
            };
            self.adopt(sched, fd);
        }
    }
}

/// Cross-thread side of a running I/O thread
pub(crate) struct IoThread {
    pub(crate) remote: RemoteScheduler,
    pub(crate) accept_queue: Arc<ArrayQueue<RawFd>>,
    pub(crate) handle: JoinHandle<()>,
    /// Delivers the unit's worker pool; dropping it stops the thread
    pub(crate) pool_tx: mpsc::Sender<Arc<WorkerPool>>,
}

/// Start unit `index`'s I/O thread
///
/// The thread builds its scheduler, reports the remote handle, and then
/// waits for its worker pool before serving connections.
pub(crate) fn spawn_io_thread<F: HandlerFactory>(
    index: usize,
    config: &ServerConfig,
    factory: Arc<F>,
    data_flow: Arc<DataFlow<RequestOf<F>, ResponseOf<F>>>,
    stats: Arc<ServerStats>,
) -> Result<IoThread, ServerError> {
    let accept_queue = Arc::new(ArrayQueue::new(config.accept_queue_capacity));
    let (ready_tx, ready_rx) = mpsc::channel();
    let (pool_tx, pool_rx) = mpsc::channel::<Arc<WorkerPool>>();

    let runtime = config.io_runtime();
    let socket_timeout_ms = config.socket_timeout_ms;
    let max_queue_length = config.max_queue_length;
    let queue = accept_queue.clone();

    let handle = thread::Builder::new()
        .name(format!("{}-io-{}", config.package_name, index))
        .spawn(move || {
            let scheduler = match Scheduler::with_config(&runtime) {
                Ok(scheduler) => scheduler,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(scheduler.remote()));
            let Ok(pool) = pool_rx.recv() else {
                return;
            };

            let unit = Rc::new(UnitState {
                index,
                factory,
                data_flow,
                accept_queue: queue,
                pool,
                stats,
                socket_timeout_ms,
                max_queue_length,
                conns: RefCell::new(Slab::new()),
                next_generation: Cell::new(0),
            });

            let active = unit.clone();
            scheduler.set_active_socket_func(move |_| active.next_ready());
            let accepted = unit.clone();
            scheduler.set_handler_accepted_fd_func(move |s| accepted.adopt_queued(s));

            kinfo!("unit {}: io thread running", index);
            scheduler.run_forever();

            while let Some(fd) = unit.accept_queue.pop() {
                drop(unsafe { OwnedFd::from_raw_fd(fd) });
                unit.stats.active.fetch_sub(1, Ordering::Relaxed);
            }
            // Lazy-destroy sockets whose response never came back
            let leftover = unit.conns.borrow().len();
            if leftover > 0 {
                kdebug!("unit {}: closing {} connections", index, leftover);
                unit.conns.borrow_mut().clear();
                unit.stats.active.fetch_sub(leftover as u64, Ordering::Relaxed);
            }
            kinfo!("unit {}: io thread stopped", index);
        })
        .map_err(ServerError::Spawn)?;

    match ready_rx.recv() {
        Ok(Ok(remote)) => Ok(IoThread {
            remote,
            accept_queue,
            handle,
            pool_tx,
        }),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(ServerError::Runtime(e))
        }
        Err(_) => {
            kerror!("unit {}: io thread died during startup", index);
            let _ = handle.join();
            Err(ServerError::Runtime(UThreadError::SchedulerClosed))
        }
    }
}
