//! Reference HTTP/1.1 codec
//!
//! `HttpHandlerFactory` plugs into `Server`; `HttpClient` speaks the same
//! wire format from the other end.

mod client;
mod handler;
mod msg;
pub mod protocol;

pub use client::HttpClient;
pub use handler::{HttpHandlerFactory, HttpMessageHandler};
pub use msg::{
    reason_phrase, HttpRequest, HttpResponse, HEADER_CONNECTION, HEADER_CONTENT_LENGTH, HEADER_CONTENT_TYPE,
    HEADER_HOST, HEADER_RESULT, HEADER_TRANSFER_ENCODING, HTTP_1_0, HTTP_1_1,
};
