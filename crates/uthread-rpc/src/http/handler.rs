//! HTTP codec for the server pipeline

use super::msg::{HttpRequest, HttpResponse, HTTP_1_1};
use super::protocol;
use crate::msg::{HandlerFactory, MessageHandler, ProtocolError, Request, Response};
use crate::stream::Transport;

/// Per-connection HTTP state: version and keep-alive of the last request
#[derive(Debug, Clone)]
pub struct HttpMessageHandler {
    version: String,
    keep_alive: bool,
}

impl Default for HttpMessageHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpMessageHandler {
    pub fn new() -> Self {
        Self {
            version: HTTP_1_1.to_string(),
            keep_alive: false,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl MessageHandler for HttpMessageHandler {
    type Request = HttpRequest;

    fn recv_request(&mut self, transport: &mut dyn Transport) -> Result<HttpRequest, ProtocolError> {
        let req = protocol::recv_request(transport)?;
        self.version = req.version().to_string();
        self.keep_alive = req.keep_alive();
        Ok(req)
    }

    fn recv_response(&mut self, transport: &mut dyn Transport) -> Result<HttpResponse, ProtocolError> {
        protocol::recv_response(transport, false)
    }

    fn gen_request(&self) -> HttpRequest {
        HttpRequest::new("GET", "/")
    }

    fn gen_response(&self, request: &HttpRequest) -> HttpResponse {
        let mut resp = request.gen_response();
        resp.modify(self.keep_alive, &self.version);
        resp
    }

    fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

/// Builds an `HttpMessageHandler` per connection
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpHandlerFactory;

impl HandlerFactory for HttpHandlerFactory {
    type Handler = HttpMessageHandler;

    fn create(&self) -> HttpMessageHandler {
        HttpMessageHandler::new()
    }
}
