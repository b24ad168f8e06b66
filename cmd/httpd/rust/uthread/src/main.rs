//! # uthread HTTP/1.1 Server
//!
//! N units, each an epoll event loop with one task per connection, plus a
//! worker pool running the handler. The acceptor hands connections to the
//! units round-robin.
//!
//! ## Usage
//!
//!     cargo run -p uthread-httpd --release -- [--port 8080] [--io-threads 3] [--workers 12] [--uthreads 0]
//!
//! `--uthreads N` (N > 0) runs each worker thread as a scheduler with up to
//! N handler tasks in flight; 0 keeps one request per worker thread.
//!
//! ## Routes
//!
//! - `GET /`: fixed greeting
//! - `POST /echo`: request body back
//! - `GET /sleep?ms=N`: answer after N milliseconds
//!
//! ## Benchmark
//!
//!     wrk -t4 -c100 -d10s http://127.0.0.1:8080/

use uthread_rpc::http::{HttpHandlerFactory, HttpRequest, HttpResponse, HEADER_CONTENT_TYPE};
use uthread_rpc::{DispatchContext, Server, ServerConfig, ServerStats};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static RUNNING: AtomicBool = AtomicBool::new(true);

const HELLO_BODY: &[u8] = b"Hello from uthread!\n";

// ── Handler ──

fn handle(req: &HttpRequest, resp: &mut HttpResponse, _ctx: &DispatchContext<'_>) {
    resp.set_header("Server", "uthread-httpd");
    resp.set_header(HEADER_CONTENT_TYPE, "text/plain");

    match (req.method(), req.path()) {
        ("GET", "/") => resp.set_body(HELLO_BODY),
        ("HEAD", "/") => {}
        ("POST", "/echo") => {
            if let Some(kind) = req.header(HEADER_CONTENT_TYPE) {
                resp.set_header(HEADER_CONTENT_TYPE, kind);
            }
            resp.set_body(req.body());
        }
        ("GET", "/sleep") => {
            let ms: u64 = req.param("ms").and_then(|v| v.parse().ok()).unwrap_or(10);
            std::thread::sleep(Duration::from_millis(ms.min(10_000)));
            resp.set_body(format!("slept {} ms\n", ms));
        }
        _ => {
            resp.set_status_code(404);
            resp.set_body("not found\n");
        }
    }
}

// ── Stats printer ──

fn stats_loop(stats: Arc<ServerStats>) {
    let start = Instant::now();
    let mut last_reqs: u64 = 0;

    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_secs(5));
        if !RUNNING.load(Ordering::Relaxed) {
            break;
        }
        let snap = stats.snapshot();
        let rps = (snap.requests - last_reqs) as f64 / 5.0;
        eprintln!("[{:.1}s] {} rps={:.0}", start.elapsed().as_secs_f64(), snap, rps);
        last_reqs = snap.requests;
    }
}

// ── Main ──

fn main() {
    // Phase 1: UTHREAD_* env vars
    let mut config = ServerConfig::from_env().package_name("httpd");

    // Phase 2: CLI flags override env vars
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                if let Some(p) = args.get(i).and_then(|s| s.parse().ok()) { config.port = p; }
            }
            "--io-threads" | "-i" => {
                i += 1;
                if let Some(n) = args.get(i).and_then(|s| s.parse().ok()) { config.io_thread_count = n; }
            }
            "--workers" | "-w" => {
                i += 1;
                if let Some(n) = args.get(i).and_then(|s| s.parse().ok()) { config.worker_thread_count = n; }
            }
            "--uthreads" | "-u" => {
                i += 1;
                if let Some(n) = args.get(i).and_then(|s| s.parse().ok()) { config.worker_uthread_count = n; }
            }
            "--timeout" => {
                i += 1;
                if let Some(ms) = args.get(i).and_then(|s| s.parse().ok()) { config.socket_timeout_ms = ms; }
            }
            "--max-queue" => {
                i += 1;
                if let Some(n) = args.get(i).and_then(|s| s.parse().ok()) { config.max_queue_length = n; }
            }
            s => {
                if let Ok(port) = s.parse() { config.port = port; }
            }
        }
        i += 1;
    }

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    config.print();

    let mut server = match Server::new(config, HttpHandlerFactory, handle).start() {
        Ok(server) => server,
        Err(e) => {
            eprintln!("uthread-httpd: {}", e);
            std::process::exit(1);
        }
    };
    eprintln!("uthread-httpd: listening on http://{}/", server.local_addr());

    let stats = server.stats();
    let _stats = std::thread::Builder::new()
        .name("stats".into())
        .spawn(move || stats_loop(stats));

    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    server.shutdown();
    let snap = server.stats().snapshot();
    eprintln!(
        "\nuthread-httpd: shutdown - {} requests, {} connections",
        snap.requests, snap.accepted
    );
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}
