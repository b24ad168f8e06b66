//! Message and codec capabilities the pipeline is generic over
//!
//! The pipeline never looks inside a message. It needs a handler that can
//! decode a request off a transport, a way to derive the response shell
//! from a request, and a way to write a response back.

use crate::stream::Transport;
use std::fmt;
use uthread_core::StreamError;

/// Result code of a normally dispatched request
pub const RESULT_OK: i32 = 0;
/// The request waited past the shed threshold and skipped dispatch
pub const RESULT_SHED: i32 = -501;
/// The dispatch callback panicked
pub const RESULT_DISPATCH_PANIC: i32 = -502;

/// Why a response is synthetic and must not be written back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FakeReason {
    #[default]
    None,
    DispatchError,
}

pub trait Message {
    /// Encode onto `transport`; the caller flushes
    fn send(&self, transport: &mut dyn Transport) -> Result<(), StreamError>;

    fn is_fake(&self) -> bool {
        false
    }
}

pub trait Request: Message + Send + 'static {
    type Response: Response;

    /// Response shell pre-filled for this request (version, keep-alive)
    fn gen_response(&self) -> Self::Response;

    fn keep_alive(&self) -> bool;

    fn set_keep_alive(&mut self, keep_alive: bool);
}

pub trait Response: Message + Send + 'static {
    fn set_fake(&mut self, reason: FakeReason);

    fn result(&self) -> i32;

    fn set_result(&mut self, result: i32);

    /// Align protocol framing with the request it answers
    fn modify(&mut self, keep_alive: bool, version: &str);
}

/// Per-connection codec state
pub trait MessageHandler {
    type Request: Request;

    fn recv_request(&mut self, transport: &mut dyn Transport) -> Result<Self::Request, ProtocolError>;

    fn recv_response(
        &mut self,
        transport: &mut dyn Transport,
    ) -> Result<<Self::Request as Request>::Response, ProtocolError>;

    fn gen_request(&self) -> Self::Request;

    fn gen_response(&self, request: &Self::Request) -> <Self::Request as Request>::Response;

    /// Keep-alive negotiated by the last received request
    fn keep_alive(&self) -> bool;
}

/// Builds one `MessageHandler` per connection
pub trait HandlerFactory: Send + Sync + 'static {
    type Handler: MessageHandler;

    fn create(&self) -> Self::Handler;
}

pub type RequestOf<F> = <<F as HandlerFactory>::Handler as MessageHandler>::Request;
pub type ResponseOf<F> = <RequestOf<F> as Request>::Response;

/// Decode failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The transport failed underneath the codec
    Stream(StreamError),
    BadStartLine,
    BadHeader,
    BadContentLength,
    BodyTooLarge,
}

impl ProtocolError {
    /// Malformed input, as opposed to a transport failure
    pub fn is_violation(&self) -> bool {
        !matches!(self, ProtocolError::Stream(_))
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Stream(e) => write!(f, "stream error: {}", e),
            ProtocolError::BadStartLine => write!(f, "malformed start line"),
            ProtocolError::BadHeader => write!(f, "malformed header"),
            ProtocolError::BadContentLength => write!(f, "invalid Content-Length"),
            ProtocolError::BodyTooLarge => write!(f, "body too large"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<StreamError> for ProtocolError {
    fn from(e: StreamError) -> Self {
        ProtocolError::Stream(e)
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Stream(StreamError::from(&e))
    }
}
