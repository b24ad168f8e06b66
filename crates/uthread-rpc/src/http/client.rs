//! Minimal HTTP/1.1 client over any `Transport`

use super::msg::{HttpRequest, HttpResponse, HEADER_CONTENT_TYPE, HEADER_HOST};
use super::protocol;
use crate::msg::{Message, ProtocolError};
use crate::stream::{BlockStream, Transport};
use std::io::{self, Write};
use std::net::SocketAddr;

pub struct HttpClient<T: Transport = BlockStream> {
    transport: T,
}

impl HttpClient<BlockStream> {
    /// Blocking client; `timeout_ms` bounds connect, reads and writes
    pub fn connect(addr: &SocketAddr, timeout_ms: i32) -> io::Result<Self> {
        BlockStream::connect(addr, timeout_ms).map(Self::new)
    }
}

impl<T: Transport> HttpClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Write `req`, flush, and read the reply
    pub fn send(&mut self, req: &HttpRequest) -> Result<HttpResponse, ProtocolError> {
        if req.header(HEADER_HOST).is_none() {
            if let Some(addr) = self.transport.remote_addr() {
                let mut req = req.clone();
                req.set_header(HEADER_HOST, addr);
                return self.exchange(&req);
            }
        }
        self.exchange(req)
    }

    fn exchange(&mut self, req: &HttpRequest) -> Result<HttpResponse, ProtocolError> {
        req.send(&mut self.transport)?;
        self.transport.flush()?;
        protocol::recv_response(&mut self.transport, req.is_method("HEAD"))
    }

    pub fn get(&mut self, uri: &str) -> Result<HttpResponse, ProtocolError> {
        self.send(&HttpRequest::new("GET", uri))
    }

    pub fn post(&mut self, uri: &str, content_type: &str, body: &[u8]) -> Result<HttpResponse, ProtocolError> {
        let mut req = HttpRequest::new("POST", uri);
        req.set_header(HEADER_CONTENT_TYPE, content_type);
        req.set_body(body);
        self.send(&req)
    }

    pub fn head(&mut self, uri: &str) -> Result<HttpResponse, ProtocolError> {
        self.send(&HttpRequest::new("HEAD", uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::Request;
    use std::net::TcpListener;
    use std::thread;

    /// Answers each request with its method, URI and body length
    fn serve(listener: TcpListener, requests: usize) -> thread::JoinHandle<Vec<HttpRequest>> {
        thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let mut stream = BlockStream::new(conn, 2000).unwrap();
            let mut seen = Vec::new();
            for _ in 0..requests {
                let req = protocol::recv_request(&mut stream).unwrap();
                let mut resp = req.gen_response();
                resp.set_body(format!("{} {} {}", req.method(), req.uri(), req.body().len()));
                resp.send(&mut stream).unwrap();
                stream.flush().unwrap();
                seen.push(req);
            }
            seen
        })
    }

    #[test]
    fn test_get_post_head_on_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = serve(listener, 3);

        let mut client = HttpClient::connect(&addr, 2000).unwrap();
        let resp = client.get("/index").unwrap();
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.body(), b"GET /index 0");

        let resp = client.post("/submit", "text/plain", b"abcd").unwrap();
        assert_eq!(resp.body(), b"POST /submit 4");

        let resp = client.head("/index").unwrap();
        assert_eq!(resp.status_code(), 200);
        assert!(resp.body().is_empty());
        assert!(resp.keep_alive());

        let seen = server.join().unwrap();
        assert_eq!(seen[0].header("Host"), Some(addr.to_string().as_str()));
        assert_eq!(seen[1].header("content-type"), Some("text/plain"));
    }
}
