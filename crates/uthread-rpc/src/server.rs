//! Server assembly: units, workers and the acceptor
//!
//! ```text
//!                  ┌──────────── unit 0 ────────────┐
//!  Acceptor ──fd──▶│ io thread ⇄ DataFlow ⇄ workers │
//!     │            └────────────────────────────────┘
//!     └──────fd──▶ unit 1 ... unit N-1
//! ```
//!
//! Units share nothing but the statistics counters. A connection stays on
//! the unit the acceptor gave it to.

use crate::acceptor::{Acceptor, AcceptorStopper, UnitInlet};
use crate::config::{ConfigError, ServerConfig};
use crate::data_flow::DataFlow;
use crate::io::{spawn_io_thread, IoThread};
use crate::msg::{HandlerFactory, RequestOf, ResponseOf};
use crate::worker::{DispatchContext, DispatchFn, ServerArgs, WorkerPool, WorkerShared};
use std::any::Any;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use uthread_core::{kerror, kinfo, UThreadError};
use uthread_runtime::RemoteScheduler;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    Bind(io::Error),
    Spawn(io::Error),
    Runtime(UThreadError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "{}", e),
            ServerError::Bind(e) => write!(f, "bind failed: {}", e),
            ServerError::Spawn(e) => write!(f, "thread spawn failed: {}", e),
            ServerError::Runtime(e) => write!(f, "runtime error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Config(e) => Some(e),
            ServerError::Bind(e) | ServerError::Spawn(e) => Some(e),
            ServerError::Runtime(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}

impl From<UThreadError> for ServerError {
    fn from(e: UThreadError) -> Self {
        ServerError::Runtime(e)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Live counters, updated by every unit
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Connections handed to a unit
    pub accepted: AtomicU64,
    /// Connections closed at accept time (limit or full accept queue)
    pub rejected: AtomicU64,
    /// Connections currently open
    pub active: AtomicU64,
    /// Requests admitted into a request queue
    pub requests: AtomicU64,
    pub dispatched: AtomicU64,
    pub shed: AtomicU64,
    /// Requests refused at admission
    pub queue_full: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub active: u64,
    pub requests: u64,
    pub dispatched: u64,
    pub shed: u64,
    pub queue_full: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "active={} accepted={} rejected={} requests={} dispatched={} shed={} queue_full={}",
            self.active, self.accepted, self.rejected, self.requests, self.dispatched, self.shed, self.queue_full
        )
    }
}

// ============================================================================
// Units
// ============================================================================

struct UnitHandle {
    index: usize,
    io_remote: RemoteScheduler,
    io_thread: Option<JoinHandle<()>>,
    pool: Option<Arc<WorkerPool>>,
    /// `DataFlow::break_out` with the message types erased
    break_out: Box<dyn Fn() + Send + Sync>,
}

impl UnitHandle {
    fn shutdown(&mut self) {
        (self.break_out)();
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        self.io_remote.close();
        if let Some(thread) = self.io_thread.take() {
            if thread.join().is_err() {
                kerror!("unit {}: io thread panicked", self.index);
            }
        }
    }
}

impl Drop for UnitHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct Server<F: HandlerFactory> {
    config: ServerConfig,
    factory: Arc<F>,
    dispatch: DispatchFn<RequestOf<F>, ResponseOf<F>>,
    args: Option<ServerArgs>,
}

impl<F: HandlerFactory> Server<F> {
    pub fn new<D>(config: ServerConfig, factory: F, dispatch: D) -> Self
    where
        D: Fn(&RequestOf<F>, &mut ResponseOf<F>, &DispatchContext<'_>) + Send + Sync + 'static,
    {
        Self {
            config,
            factory: Arc::new(factory),
            dispatch: Arc::new(dispatch),
            args: None,
        }
    }

    /// Value every dispatch can read through `DispatchContext::args`
    pub fn with_args<T: Any + Send + Sync>(mut self, args: T) -> Self {
        self.args = Some(Arc::new(args));
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Start every thread, the acceptor included, and return
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let name = format!("{}-acceptor", self.config.package_name);
        let (acceptor, mut handle) = self.launch()?;
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || acceptor.run())
            .map_err(ServerError::Spawn)?;
        handle.acceptor = Some(thread);
        Ok(handle)
    }

    /// Start the units and run the acceptor on the calling thread
    pub fn run_forever(self) -> Result<(), ServerError> {
        let (acceptor, mut handle) = self.launch()?;
        acceptor.run();
        handle.shutdown();
        Ok(())
    }

    fn launch(self) -> Result<(Acceptor, ServerHandle), ServerError> {
        let config = self.config;
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr()).map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;
        let stats = Arc::new(ServerStats::default());

        let mut handle = ServerHandle {
            local_addr,
            stats: stats.clone(),
            stopper: None,
            acceptor: None,
            units: Vec::with_capacity(config.io_thread_count),
        };
        let mut inlets = Vec::with_capacity(config.io_thread_count);
        let workers = config.workers_per_unit();

        for index in 0..config.io_thread_count {
            let data_flow = Arc::new(DataFlow::new());
            let IoThread {
                remote,
                accept_queue,
                handle: io_thread,
                pool_tx,
            } = spawn_io_thread(index, &config, self.factory.clone(), data_flow.clone(), stats.clone())?;

            let flow = data_flow.clone();
            handle.units.push(UnitHandle {
                index,
                io_remote: remote.clone(),
                io_thread: Some(io_thread),
                pool: None,
                break_out: Box::new(move || flow.break_out()),
            });

            let shared = Arc::new(WorkerShared {
                data_flow,
                dispatch: self.dispatch.clone(),
                args: self.args.clone(),
                io_remote: Some(remote.clone()),
                shed_threshold_ms: config.shed_threshold_ms,
                stats: stats.clone(),
            });
            let pool = Arc::new(WorkerPool::start(
                &format!("{}-{}", config.package_name, index),
                workers,
                config.worker_runtime(),
                shared,
            )?);
            if let Some(unit) = handle.units.last_mut() {
                unit.pool = Some(pool.clone());
            }
            if pool_tx.send(pool).is_err() {
                return Err(ServerError::Runtime(UThreadError::SchedulerClosed));
            }

            inlets.push(UnitInlet {
                queue: accept_queue,
                remote,
            });
        }

        let (acceptor, stopper) = Acceptor::new(listener, inlets, stats, config.max_connections);
        handle.stopper = Some(stopper);
        kinfo!(
            "server on {}: {} units x {} workers ({})",
            local_addr,
            config.io_thread_count,
            workers,
            if config.worker_uthread_count == 0 { "thread mode" } else { "task mode" }
        );
        Ok((acceptor, handle))
    }
}

/// A started server; dropping it shuts everything down
pub struct ServerHandle {
    local_addr: SocketAddr,
    stats: Arc<ServerStats>,
    stopper: Option<AcceptorStopper>,
    acceptor: Option<JoinHandle<()>>,
    units: Vec<UnitHandle>,
}

impl ServerHandle {
    /// The bound address, with the real port when bound to port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Stop accepting, drain nothing, close every unit and join all threads
    ///
    /// Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(stopper) = self.stopper.take() {
            stopper.stop();
        }
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                kerror!("acceptor thread panicked");
            }
        }
        if self.units.is_empty() {
            return;
        }
        for unit in &mut self.units {
            unit.shutdown();
        }
        self.units.clear();
        kinfo!("server on {} stopped: {}", self.local_addr, self.stats.snapshot());
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpClient, HttpHandlerFactory, HttpMessageHandler, HttpRequest, HttpResponse, HEADER_RESULT};
    use crate::msg::{MessageHandler, ProtocolError, Request, Response, RESULT_SHED};
    use crate::stream::Transport;
    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn test_config() -> ServerConfig {
        ServerConfig::new()
            .bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .port(0)
            .io_thread_count(2)
            .worker_thread_count(2)
            .max_connections(64)
            .max_queue_length(64)
            .socket_timeout_ms(2000)
            .package_name("test")
    }

    fn ok_handler(_: &HttpRequest, resp: &mut HttpResponse, _: &DispatchContext<'_>) {
        resp.set_status_code(200);
        resp.set_body("OK");
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Send raw bytes and collect everything until the server closes
    fn raw_exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut conn = TcpStream::connect(addr).unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let mut reply = Vec::new();
        // A connection refused at accept may already be reset
        if conn.write_all(request).is_err() {
            return reply;
        }
        match conn.read_to_end(&mut reply) {
            Ok(_) => {}
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset, "{}", e),
        }
        reply
    }

    #[test]
    fn test_keep_alive_then_close() {
        let mut server = Server::new(test_config(), HttpHandlerFactory, ok_handler).start().unwrap();
        let addr = server.local_addr();

        let mut client = HttpClient::connect(&addr, 3000).unwrap();
        for _ in 0..3 {
            let resp = client.get("/").unwrap();
            assert_eq!(resp.status_code(), 200);
            assert_eq!(resp.body(), b"OK");
            assert!(resp.keep_alive());
        }

        let mut bye = HttpRequest::new("GET", "/bye");
        bye.set_keep_alive(false);
        let resp = client.send(&bye).unwrap();
        assert_eq!(resp.body(), b"OK");
        assert!(!resp.keep_alive());
        let mut rest = Vec::new();
        client.transport_mut().read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        let stats = server.stats();
        wait_until("connection release", || stats.active.load(Ordering::Relaxed) == 0);
        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.requests, 4);
        assert_eq!(snap.dispatched, 4);
        server.shutdown();
    }

    #[test]
    fn test_http_1_0_closes_by_default() {
        let server = Server::new(test_config(), HttpHandlerFactory, ok_handler).start().unwrap();
        let reply = raw_exchange(server.local_addr(), b"GET / HTTP/1.0\r\n\r\n");
        let text = String::from_utf8(reply).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "{}", text);
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nOK"));
    }

    #[test]
    fn test_malformed_request_closes_connection() {
        let server = Server::new(test_config(), HttpHandlerFactory, ok_handler).start().unwrap();
        assert!(raw_exchange(server.local_addr(), b"GARBAGE\r\n\r\n").is_empty());
        assert_eq!(server.stats().snapshot().requests, 0);
    }

    #[test]
    fn test_non_ascii_version_closes_connection() {
        let server = Server::new(test_config(), HttpHandlerFactory, ok_handler).start().unwrap();
        assert!(raw_exchange(server.local_addr(), "GET / HTTPé\r\n\r\n".as_bytes()).is_empty());
        wait_until("connection release", || server.stats().snapshot().active == 0);
        assert_eq!(server.stats().snapshot().requests, 0);
    }

    /// HTTP codec that panics on the `BOOM` method
    struct BoomHandler(HttpMessageHandler);

    impl MessageHandler for BoomHandler {
        type Request = HttpRequest;

        fn recv_request(&mut self, transport: &mut dyn Transport) -> Result<HttpRequest, ProtocolError> {
            let req = self.0.recv_request(transport)?;
            if req.is_method("BOOM") {
                panic!("decoder blew up");
            }
            Ok(req)
        }

        fn recv_response(&mut self, transport: &mut dyn Transport) -> Result<HttpResponse, ProtocolError> {
            self.0.recv_response(transport)
        }

        fn gen_request(&self) -> HttpRequest {
            self.0.gen_request()
        }

        fn gen_response(&self, request: &HttpRequest) -> HttpResponse {
            self.0.gen_response(request)
        }

        fn keep_alive(&self) -> bool {
            self.0.keep_alive()
        }
    }

    struct BoomFactory;

    impl HandlerFactory for BoomFactory {
        type Handler = BoomHandler;

        fn create(&self) -> BoomHandler {
            BoomHandler(HttpMessageHandler::new())
        }
    }

    #[test]
    fn test_panicking_connection_task_releases_connection() {
        let config = test_config().io_thread_count(1).worker_thread_count(1);
        let server = Server::new(config, BoomFactory, ok_handler).start().unwrap();
        let addr = server.local_addr();

        for _ in 0..3 {
            assert!(raw_exchange(addr, b"BOOM / HTTP/1.1\r\n\r\n").is_empty());
        }
        wait_until("connection release", || server.stats().snapshot().active == 0);

        let mut client = HttpClient::connect(&addr, 3000).unwrap();
        assert_eq!(client.get("/").unwrap().body(), b"OK");
    }

    #[test]
    fn test_task_mode_concurrent_clients() {
        let config = test_config().worker_uthread_count(8);
        let server = Server::new(config, HttpHandlerFactory, |req: &HttpRequest, resp: &mut HttpResponse, ctx| {
            let mode = if ctx.scheduler().is_some() { "task" } else { "thread" };
            resp.set_body(format!("{} {}", mode, req.uri()));
        })
        .start()
        .unwrap();
        let addr = server.local_addr();

        let clients: Vec<_> = (0..8)
            .map(|c| {
                thread::spawn(move || {
                    let mut client = HttpClient::connect(&addr, 3000).unwrap();
                    for i in 0..5 {
                        let uri = format!("/{}/{}", c, i);
                        let resp = client.get(&uri).unwrap();
                        assert_eq!(resp.body(), format!("task {}", uri).as_bytes());
                    }
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }
        assert_eq!(server.stats().snapshot().dispatched, 40);
    }

    #[test]
    fn test_guarded_stacks_serve_requests() {
        let config = test_config().worker_uthread_count(4).stack_protect(true);
        let server = Server::new(config, HttpHandlerFactory, ok_handler).start().unwrap();

        let mut client = HttpClient::connect(&server.local_addr(), 3000).unwrap();
        for _ in 0..3 {
            assert_eq!(client.get("/").unwrap().body(), b"OK");
        }
        assert_eq!(server.stats().snapshot().dispatched, 3);
    }

    #[test]
    fn test_server_args_reach_dispatch() {
        let server = Server::new(test_config(), HttpHandlerFactory, |_: &HttpRequest, resp: &mut HttpResponse, ctx| {
            let greeting = ctx.args::<String>().cloned().unwrap_or_default();
            resp.set_body(greeting);
        })
        .with_args(String::from("hello"))
        .start()
        .unwrap();
        let mut client = HttpClient::connect(&server.local_addr(), 3000).unwrap();
        assert_eq!(client.get("/").unwrap().body(), b"hello");
    }

    #[test]
    fn test_full_queue_closes_connection() {
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let config = test_config()
            .io_thread_count(1)
            .worker_thread_count(1)
            .max_queue_length(1)
            .shed_threshold_ms(60_000);
        let (e, r) = (entered.clone(), release.clone());
        let server = Server::new(config, HttpHandlerFactory, move |req: &HttpRequest, resp: &mut HttpResponse, _| {
            if req.uri() == "/block" {
                e.store(true, Ordering::SeqCst);
                while !r.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
            }
            resp.set_body(req.uri());
        })
        .start()
        .unwrap();
        let addr = server.local_addr();
        let stats = server.stats();

        // Occupy the only worker, then fill the one queue slot
        let blocked = thread::spawn(move || HttpClient::connect(&addr, 5000).unwrap().get("/block").unwrap());
        wait_until("worker busy", || entered.load(Ordering::SeqCst));
        let queued = thread::spawn(move || HttpClient::connect(&addr, 5000).unwrap().get("/queued").unwrap());
        wait_until("second admission", || stats.requests.load(Ordering::Relaxed) == 2);

        assert!(raw_exchange(addr, b"GET /rejected HTTP/1.1\r\n\r\n").is_empty());
        assert_eq!(stats.queue_full.load(Ordering::Relaxed), 1);

        release.store(true, Ordering::SeqCst);
        assert_eq!(blocked.join().unwrap().body(), b"/block");
        assert_eq!(queued.join().unwrap().body(), b"/queued");
    }

    #[test]
    fn test_stale_request_is_answered_without_dispatch() {
        let entered = Arc::new(AtomicBool::new(false));
        let config = test_config()
            .io_thread_count(1)
            .worker_thread_count(1)
            .shed_threshold_ms(50);
        let e = entered.clone();
        let server = Server::new(config, HttpHandlerFactory, move |req: &HttpRequest, resp: &mut HttpResponse, _| {
            if req.uri() == "/slow" {
                e.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(200));
            }
            resp.set_body("done");
        })
        .start()
        .unwrap();
        let addr = server.local_addr();

        let slow = thread::spawn(move || HttpClient::connect(&addr, 5000).unwrap().get("/slow").unwrap());
        wait_until("worker busy", || entered.load(Ordering::SeqCst));
        let stale = HttpClient::connect(&addr, 5000).unwrap().get("/late").unwrap();

        assert_eq!(stale.status_code(), 503);
        assert_eq!(stale.result(), RESULT_SHED);
        assert_eq!(stale.header(HEADER_RESULT), Some("-501"));
        assert!(stale.body().is_empty());
        assert_eq!(slow.join().unwrap().body(), b"done");

        let snap = server.stats().snapshot();
        assert_eq!(snap.shed, 1);
        assert_eq!(snap.dispatched, 1);
    }

    #[test]
    fn test_late_response_after_timeout_is_dropped() {
        let config = test_config().io_thread_count(1).worker_thread_count(1).socket_timeout_ms(100);
        let server = Server::new(config, HttpHandlerFactory, |_: &HttpRequest, resp: &mut HttpResponse, _| {
            thread::sleep(Duration::from_millis(400));
            resp.set_body("too late");
        })
        .start()
        .unwrap();
        let stats = server.stats();

        let started = Instant::now();
        let reply = raw_exchange(server.local_addr(), b"GET /slow HTTP/1.1\r\n\r\n");
        assert!(reply.is_empty());
        // Closed by the late response, not by the timeout
        assert!(started.elapsed() >= Duration::from_millis(300), "{:?}", started.elapsed());

        wait_until("connection release", || stats.active.load(Ordering::Relaxed) == 0);
        assert_eq!(stats.dispatched.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_connection_limit() {
        let config = test_config().io_thread_count(1).max_connections(1);
        let server = Server::new(config, HttpHandlerFactory, ok_handler).start().unwrap();
        let addr = server.local_addr();

        let mut first = HttpClient::connect(&addr, 3000).unwrap();
        assert_eq!(first.get("/").unwrap().status_code(), 200);

        assert!(raw_exchange(addr, b"GET / HTTP/1.1\r\n\r\n").is_empty());
        assert_eq!(server.stats().snapshot().rejected, 1);

        assert_eq!(first.get("/again").unwrap().body(), b"OK");
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let config = test_config().io_thread_count(0);
        match Server::new(config, HttpHandlerFactory, ok_handler).start() {
            Err(ServerError::Config(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("server started with zero units"),
        }
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut server = Server::new(test_config(), HttpHandlerFactory, ok_handler).start().unwrap();
        let addr = server.local_addr();
        let mut idle = HttpClient::connect(&addr, 3000).unwrap();
        assert_eq!(idle.get("/").unwrap().status_code(), 200);

        server.shutdown();
        server.shutdown();
        assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
        assert!(idle.get("/").is_err());
    }
}
