//! # uthread-rpc
//!
//! Request/response server pipeline built on `uthread-runtime`.
//!
//! A `Server` owns N independent units. Each unit is one I/O thread running
//! an event-loop `Scheduler` (one task per connection), a `WorkerPool`
//! running the dispatch callback, and the `DataFlow` queues between them.
//! An `Acceptor` thread hands accepted connections to units round-robin.
//!
//! ```rust,ignore
//! use uthread_rpc::http::{HttpHandlerFactory, HttpRequest, HttpResponse};
//! use uthread_rpc::{Server, ServerConfig};
//!
//! let config = ServerConfig::from_env().port(8080);
//! let server = Server::new(config, HttpHandlerFactory, |_req: &HttpRequest, resp: &mut HttpResponse, _ctx| {
//!     resp.set_status_code(200);
//!     resp.set_body(b"OK".to_vec());
//! });
//! server.run_forever()?;
//! ```

pub mod queue;
pub mod data_flow;
pub mod msg;
pub mod stream;
pub mod config;
pub mod worker;
mod io;
mod acceptor;
pub mod server;
pub mod http;

// Re-exports
pub use config::{ConfigError, ServerConfig};
pub use data_flow::{AdmissionError, ConnToken, DataFlow, Dequeued};
pub use msg::{
    FakeReason, HandlerFactory, Message, MessageHandler, ProtocolError, Request, RequestOf, Response,
    ResponseOf, RESULT_DISPATCH_PANIC, RESULT_OK, RESULT_SHED,
};
pub use queue::ThreadQueue;
pub use server::{Server, ServerError, ServerHandle, ServerStats, StatsSnapshot};
pub use stream::{BlockStream, Transport, UThreadStream};
pub use worker::{DispatchContext, DispatchFn, ServerArgs, WorkerPool};
