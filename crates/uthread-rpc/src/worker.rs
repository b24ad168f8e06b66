//! Worker threads running the dispatch callback
//!
//! A worker runs in one of two modes, fixed when the pool starts:
//!
//! - thread mode (no `RuntimeConfig`): the thread loops on the blocking
//!   `pluck_request`, one request in flight per thread
//! - task mode: the thread owns a private `Scheduler` running forever; its
//!   new-request hook picks requests without blocking and spawns one task
//!   per request, up to the config's `max_task` at once
//!
//! Either way every dispatched request produces exactly one response,
//! which is pushed back and announced to the unit's I/O scheduler.

use crate::data_flow::{ConnToken, DataFlow, Dequeued};
use crate::msg::{FakeReason, Request, Response, RESULT_DISPATCH_PANIC, RESULT_SHED};
use crate::server::{ServerError, ServerStats};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use uthread_core::{kdebug, kerror, kinfo, UThreadError, UThreadResult};
use uthread_runtime::{RemoteScheduler, RuntimeConfig, Scheduler};

/// Application-wide value handed to every dispatch
pub type ServerArgs = Arc<dyn Any + Send + Sync>;

/// Business logic: fill in `resp` for `req`
pub type DispatchFn<Req, Resp> = Arc<dyn Fn(&Req, &mut Resp, &DispatchContext<'_>) + Send + Sync>;

/// What a dispatch callback can see besides the request
pub struct DispatchContext<'a> {
    scheduler: Option<&'a Scheduler>,
    args: Option<&'a ServerArgs>,
    token: ConnToken,
    queue_wait_ms: u64,
}

impl<'a> DispatchContext<'a> {
    /// The worker's scheduler in task mode, for blocking-shim I/O
    pub fn scheduler(&self) -> Option<&'a Scheduler> {
        self.scheduler
    }

    /// The server argument, if one was set and is a `T`
    pub fn args<T: Any>(&self) -> Option<&'a T> {
        self.args.and_then(|args| (**args).downcast_ref::<T>())
    }

    /// Connection the request arrived on
    pub fn token(&self) -> ConnToken {
        self.token
    }

    pub fn queue_wait_ms(&self) -> u64 {
        self.queue_wait_ms
    }
}

/// Everything a unit's workers share
pub(crate) struct WorkerShared<Req: Request> {
    pub(crate) data_flow: Arc<DataFlow<Req, Req::Response>>,
    pub(crate) dispatch: DispatchFn<Req, Req::Response>,
    pub(crate) args: Option<ServerArgs>,
    pub(crate) io_remote: Option<RemoteScheduler>,
    pub(crate) shed_threshold_ms: u64,
    pub(crate) stats: Arc<ServerStats>,
}

/// Turn one request into one response and hand it back
pub(crate) fn work_logic<Req: Request>(shared: &WorkerShared<Req>, scheduler: Option<&Scheduler>, item: Dequeued<Req>) {
    let Dequeued {
        token,
        payload: req,
        queue_wait_ms,
    } = item;
    let mut resp = req.gen_response();

    if queue_wait_ms < shared.shed_threshold_ms {
        let ctx = DispatchContext {
            scheduler,
            args: shared.args.as_ref(),
            token,
            queue_wait_ms,
        };
        let dispatch = &shared.dispatch;
        match panic::catch_unwind(AssertUnwindSafe(|| dispatch(&req, &mut resp, &ctx))) {
            Ok(()) => {
                shared.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                kerror!("dispatch panicked (conn {})", token.key());
                resp.set_result(RESULT_DISPATCH_PANIC);
                resp.set_fake(FakeReason::DispatchError);
            }
        }
    } else {
        kdebug!("shedding request after {} ms in queue", queue_wait_ms);
        shared.stats.shed.fetch_add(1, Ordering::Relaxed);
        resp.set_result(RESULT_SHED);
    }
    drop(req);

    shared.data_flow.push_response(token, resp);
    if let Some(remote) = &shared.io_remote {
        remote.notify();
    }
}

fn run_thread_mode<Req: Request>(shared: Arc<WorkerShared<Req>>) {
    while let Some(item) = shared.data_flow.pluck_request() {
        work_logic(&shared, None, item);
    }
}

fn run_task_mode<Req: Request>(
    shared: Arc<WorkerShared<Req>>,
    runtime: RuntimeConfig,
    ready: mpsc::Sender<UThreadResult<RemoteScheduler>>,
) {
    let scheduler = match Scheduler::with_config(&runtime) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(scheduler.remote()));

    scheduler.set_handler_new_request_func(move |sched| {
        while !sched.is_task_full() {
            let Some(item) = shared.data_flow.pick_request() else {
                break;
            };
            let shared = shared.clone();
            sched.add_task(move |s| work_logic(&shared, Some(&s), item));
        }
    });
    scheduler.run_forever();
}

/// The worker threads of one unit
pub struct WorkerPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Task-mode schedulers, in rotation order; empty in thread mode
    remotes: Vec<RemoteScheduler>,
    next: Mutex<usize>,
}

impl WorkerPool {
    /// `runtime` selects task mode; `None` runs plain worker threads
    pub(crate) fn start<Req: Request>(
        name: &str,
        count: usize,
        runtime: Option<RuntimeConfig>,
        shared: Arc<WorkerShared<Req>>,
    ) -> Result<Self, ServerError> {
        let mut pool = WorkerPool {
            handles: Mutex::new(Vec::with_capacity(count)),
            remotes: Vec::new(),
            next: Mutex::new(0),
        };

        for i in 0..count {
            if let Err(e) = pool.spawn_one(name, i, runtime.clone(), shared.clone()) {
                // Thread-mode workers only leave pluck once the flow is broken
                shared.data_flow.break_out();
                pool.shutdown();
                return Err(e);
            }
        }

        kinfo!(
            "{}: {} workers started ({} mode)",
            name,
            count,
            if pool.is_task_mode() { "task" } else { "thread" }
        );
        Ok(pool)
    }

    fn spawn_one<Req: Request>(
        &mut self,
        name: &str,
        index: usize,
        runtime: Option<RuntimeConfig>,
        shared: Arc<WorkerShared<Req>>,
    ) -> Result<(), ServerError> {
        let builder = thread::Builder::new().name(format!("{}-worker-{}", name, index));

        let Some(runtime) = runtime else {
            let handle = builder
                .spawn(move || run_thread_mode(shared))
                .map_err(ServerError::Spawn)?;
            self.handles.lock().push(handle);
            return Ok(());
        };

        let (tx, rx) = mpsc::channel();
        let handle = builder
            .spawn(move || run_task_mode(shared, runtime, tx))
            .map_err(ServerError::Spawn)?;
        self.handles.lock().push(handle);
        let remote = rx
            .recv()
            .unwrap_or(Err(UThreadError::SchedulerClosed))
            .map_err(ServerError::Runtime)?;
        self.remotes.push(remote);
        Ok(())
    }

    /// Wake exactly one task-mode worker, round-robin
    pub fn notify_epoll(&self) {
        if self.remotes.is_empty() {
            return;
        }
        let index = {
            let mut next = self.next.lock();
            let index = *next;
            *next = (index + 1) % self.remotes.len();
            index
        };
        self.remotes[index].notify();
    }

    pub fn is_task_mode(&self) -> bool {
        !self.remotes.is_empty()
    }

    /// Close task-mode schedulers and join every thread
    ///
    /// Thread-mode workers only exit once their `DataFlow` is broken out.
    pub fn shutdown(&self) {
        for remote in &self.remotes {
            remote.close();
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                kerror!("worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpRequest, HttpResponse};
    use crate::msg::{Message, RESULT_OK};
    use std::sync::atomic::AtomicUsize;

    fn shared_with(
        shed_threshold_ms: u64,
        dispatch: DispatchFn<HttpRequest, HttpResponse>,
    ) -> Arc<WorkerShared<HttpRequest>> {
        Arc::new(WorkerShared {
            data_flow: Arc::new(DataFlow::new()),
            dispatch,
            args: Some(Arc::new(String::from("app-arg")) as ServerArgs),
            io_remote: None,
            shed_threshold_ms,
            stats: Arc::new(ServerStats::default()),
        })
    }

    fn item(key: usize, uri: &str, queue_wait_ms: u64) -> Dequeued<HttpRequest> {
        Dequeued {
            token: ConnToken::new(key, 1),
            payload: HttpRequest::new("GET", uri),
            queue_wait_ms,
        }
    }

    #[test]
    fn test_fresh_request_dispatched_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let shared = shared_with(
            500,
            Arc::new(move |req: &HttpRequest, resp: &mut HttpResponse, ctx: &DispatchContext<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
                assert!(ctx.scheduler().is_none());
                assert_eq!(ctx.args::<String>().map(String::as_str), Some("app-arg"));
                assert!(ctx.args::<u32>().is_none());
                resp.set_body(req.uri());
            }),
        );

        work_logic(&shared, None, item(7, "/fresh", 499));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let out = shared.data_flow.pick_response().unwrap();
        assert_eq!(out.token, ConnToken::new(7, 1));
        assert_eq!(out.payload.body(), b"/fresh");
        assert_eq!(out.payload.result(), RESULT_OK);
        assert_eq!(shared.stats.dispatched.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stale_request_is_shed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let shared = shared_with(
            500,
            Arc::new(move |_: &HttpRequest, _: &mut HttpResponse, _: &DispatchContext<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        work_logic(&shared, None, item(1, "/stale", 500));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let out = shared.data_flow.pick_response().unwrap();
        assert_eq!(out.payload.result(), RESULT_SHED);
        assert_eq!(out.payload.status_code(), 503);
        assert!(!out.payload.is_fake());
        assert_eq!(shared.stats.shed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dispatch_panic_yields_fake_response() {
        let shared = shared_with(
            500,
            Arc::new(|_: &HttpRequest, _: &mut HttpResponse, _: &DispatchContext<'_>| {
                panic!("handler bug");
            }),
        );

        work_logic(&shared, None, item(2, "/boom", 0));
        let out = shared.data_flow.pick_response().unwrap();
        assert!(out.payload.is_fake());
        assert_eq!(out.payload.result(), RESULT_DISPATCH_PANIC);
        assert_eq!(shared.stats.dispatched.load(Ordering::Relaxed), 0);
    }

    fn echo_uri() -> DispatchFn<HttpRequest, HttpResponse> {
        Arc::new(|req: &HttpRequest, resp: &mut HttpResponse, ctx: &DispatchContext<'_>| {
            let mode = if ctx.scheduler().is_some() { "task" } else { "thread" };
            resp.set_body(format!("{}:{}", mode, req.uri()));
        })
    }

    fn collect(shared: &WorkerShared<HttpRequest>, n: usize) -> Vec<(usize, String)> {
        let mut got: Vec<(usize, String)> = (0..n)
            .map(|_| {
                let out = shared.data_flow.pluck_response().unwrap();
                (out.token.key(), String::from_utf8(out.payload.body().to_vec()).unwrap())
            })
            .collect();
        got.sort();
        got
    }

    #[test]
    fn test_thread_mode_pool() {
        let shared = shared_with(10_000, echo_uri());
        let pool = WorkerPool::start("test", 3, None, shared.clone()).unwrap();
        assert!(!pool.is_task_mode());
        pool.notify_epoll();

        for key in 0..10 {
            shared.data_flow.push_request(ConnToken::new(key, 1), HttpRequest::new("GET", &format!("/{}", key)));
        }
        let got = collect(&shared, 10);
        assert_eq!(got[3], (3, "thread:/3".to_string()));
        assert_eq!(got.len(), 10);

        shared.data_flow.break_out();
        pool.shutdown();
    }

    #[test]
    fn test_task_mode_pool() {
        let shared = shared_with(10_000, echo_uri());
        let runtime = RuntimeConfig::new().stack_size(64 * 1024).max_task(4);
        let pool = WorkerPool::start("test", 2, Some(runtime), shared.clone()).unwrap();
        assert!(pool.is_task_mode());

        for key in 0..20 {
            shared.data_flow.push_request(ConnToken::new(key, 1), HttpRequest::new("GET", &format!("/{}", key)));
            pool.notify_epoll();
        }
        let got = collect(&shared, 20);
        assert!(got.iter().all(|(_, body)| body.starts_with("task:/")));
        assert_eq!(got[19], (19, "task:/19".to_string()));

        pool.shutdown();
    }

    #[test]
    fn test_task_mode_in_flight_bounded_by_task_limit() {
        use std::os::fd::{FromRawFd, OwnedFd};

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (now, max) = (in_flight.clone(), peak.clone());
        let shared = shared_with(
            10_000,
            Arc::new(move |req: &HttpRequest, resp: &mut HttpResponse, ctx: &DispatchContext<'_>| {
                let current = now.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(current, Ordering::SeqCst);

                // Park the task on a silent pipe until its timer fires
                let sched = ctx.scheduler().unwrap();
                let mut fds = [0; 2];
                assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
                let _writer = unsafe { OwnedFd::from_raw_fd(fds[1]) };
                let parked = sched.create_socket(fds[0], 30, 30, false).unwrap();
                assert_eq!(sched.wait(&parked, 30), Err(UThreadError::Timeout));

                now.fetch_sub(1, Ordering::SeqCst);
                resp.set_body(req.uri());
            }),
        );
        for key in 0..8 {
            shared.data_flow.push_request(ConnToken::new(key, 1), HttpRequest::new("GET", &format!("/{}", key)));
        }

        let runtime = RuntimeConfig::new().stack_size(64 * 1024).max_task(3);
        let pool = WorkerPool::start("test", 1, Some(runtime), shared.clone()).unwrap();
        pool.notify_epoll();

        let got = collect(&shared, 8);
        assert_eq!(got.len(), 8);
        assert_eq!(peak.load(Ordering::SeqCst), 3);

        pool.shutdown();
    }
}
