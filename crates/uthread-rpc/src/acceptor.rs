//! Blocking accept loop feeding the units round-robin

use crate::server::ServerStats;
use crossbeam_queue::ArrayQueue;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uthread_core::{kdebug, kerror, kinfo, kwarn};
use uthread_runtime::RemoteScheduler;

/// Where the acceptor drops descriptors for one unit
pub(crate) struct UnitInlet {
    pub(crate) queue: Arc<ArrayQueue<RawFd>>,
    pub(crate) remote: RemoteScheduler,
}

pub(crate) struct Acceptor {
    listener: Arc<TcpListener>,
    inlets: Vec<UnitInlet>,
    stats: Arc<ServerStats>,
    stop: Arc<AtomicBool>,
    max_connections: u64,
    next: usize,
}

/// Stops an `Acceptor` blocked in `accept` from another thread
#[derive(Clone)]
pub(crate) struct AcceptorStopper {
    listener: Arc<TcpListener>,
    stop: Arc<AtomicBool>,
}

impl AcceptorStopper {
    pub(crate) fn stop(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wakes a blocked accept(2) with EINVAL
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RD);
        }
    }
}

impl Acceptor {
    pub(crate) fn new(
        listener: TcpListener,
        inlets: Vec<UnitInlet>,
        stats: Arc<ServerStats>,
        max_connections: usize,
    ) -> (Self, AcceptorStopper) {
        let listener = Arc::new(listener);
        let stop = Arc::new(AtomicBool::new(false));
        let stopper = AcceptorStopper {
            listener: listener.clone(),
            stop: stop.clone(),
        };
        let acceptor = Self {
            listener,
            inlets,
            stats,
            stop,
            max_connections: max_connections as u64,
            next: 0,
        };
        (acceptor, stopper)
    }

    /// Accept until stopped
    pub(crate) fn run(mut self) {
        match self.listener.local_addr() {
            Ok(addr) => kinfo!("acceptor listening on {}", addr),
            Err(e) => kwarn!("acceptor: local_addr failed: {}", e),
        }

        while !self.stop.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                    self.dispatch(stream);
                }
                Err(e) => {
                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                    match e.kind() {
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted => {}
                        _ => {
                            kerror!("accept failed: {}", e);
                            // Out of descriptors and similar: back off
                            std::thread::sleep(Duration::from_millis(10));
                        }
                    }
                }
            }
        }
        kinfo!("acceptor stopped");
    }

    fn dispatch(&mut self, stream: TcpStream) {
        let active = self.stats.active.fetch_add(1, Ordering::Relaxed);
        if active >= self.max_connections {
            self.stats.active.fetch_sub(1, Ordering::Relaxed);
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            kdebug!("connection limit {} reached, refusing", self.max_connections);
            return;
        }

        let _ = stream.set_nodelay(true);
        let fd = stream.into_raw_fd();
        let index = self.next;
        self.next = (self.next + 1) % self.inlets.len();
        let inlet = &self.inlets[index];

        if let Err(fd) = inlet.queue.push(fd) {
            drop(unsafe { OwnedFd::from_raw_fd(fd) });
            self.stats.active.fetch_sub(1, Ordering::Relaxed);
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            kwarn!("unit {}: accept queue full, refusing", index);
            return;
        }
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        inlet.remote.notify();
    }
}
