//! HTTP/1.1 request and response values

use crate::msg::{FakeReason, Message, Request, Response, RESULT_DISPATCH_PANIC, RESULT_OK, RESULT_SHED};
use crate::stream::Transport;
use std::io::Write;
use uthread_core::StreamError;

pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONNECTION: &str = "Connection";
pub const HEADER_TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const HEADER_HOST: &str = "Host";
/// Carries `Response::result` when it is not `RESULT_OK`
pub const HEADER_RESULT: &str = "X-Uthread-Result";

pub const HTTP_1_0: &str = "HTTP/1.0";
pub const HTTP_1_1: &str = "HTTP/1.1";

/// Canonical reason phrase for a status code
pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Headers the codec writes itself; user copies are skipped on send
fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case(HEADER_CONTENT_LENGTH)
        || name.eq_ignore_ascii_case(HEADER_CONNECTION)
        || name.eq_ignore_ascii_case(HEADER_TRANSFER_ENCODING)
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
    match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
        Some(entry) => entry.1 = value,
        None => headers.push((name.to_string(), value)),
    }
}

fn remove_header(headers: &mut Vec<(String, String)>, name: &str) -> bool {
    let before = headers.len();
    headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    headers.len() != before
}

fn connection_value(keep_alive: bool) -> &'static str {
    if keep_alive {
        "keep-alive"
    } else {
        "close"
    }
}

/// Shared tail of both messages: headers, framing, body
fn write_headers_and_body(
    transport: &mut dyn Transport,
    headers: &[(String, String)],
    keep_alive: bool,
    body: &[u8],
    with_length: bool,
) -> std::io::Result<()> {
    for (name, value) in headers.iter().filter(|(n, _)| !is_framing_header(n)) {
        write!(transport, "{}: {}\r\n", name, value)?;
    }
    if with_length {
        write!(transport, "{}: {}\r\n", HEADER_CONTENT_LENGTH, body.len())?;
    }
    write!(transport, "{}: {}\r\n\r\n", HEADER_CONNECTION, connection_value(keep_alive))?;
    transport.write_all(body)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    method: String,
    uri: String,
    version: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new("GET", "/")
    }
}

impl HttpRequest {
    pub fn new(method: &str, uri: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            uri: uri.to_string(),
            version: HTTP_1_1.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
            keep_alive: true,
        }
    }

    pub(crate) fn from_parts(
        method: String,
        uri: String,
        version: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        keep_alive: bool,
    ) -> Self {
        Self {
            method,
            uri,
            version,
            headers,
            body,
            keep_alive,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_method(&self, method: &str) -> bool {
        self.method.eq_ignore_ascii_case(method)
    }

    pub fn set_method(&mut self, method: &str) {
        self.method = method.to_ascii_uppercase();
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn set_uri(&mut self, uri: &str) {
        self.uri = uri.to_string();
    }

    /// The URI without its query string
    pub fn path(&self) -> &str {
        self.uri.split_once('?').map_or(self.uri.as_str(), |(path, _)| path)
    }

    /// First query parameter called `name`, undecoded
    pub fn param(&self, name: &str) -> Option<&str> {
        let (_, query) = self.uri.split_once('?')?;
        query
            .split('&')
            .filter_map(|pair| match pair.split_once('=') {
                Some((k, v)) => Some((k, v)),
                None => (!pair.is_empty()).then_some((pair, "")),
            })
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn set_version(&mut self, version: &str) {
        self.version = version.to_string();
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Append, keeping any earlier header of the same name
    pub fn add_header(&mut self, name: &str, value: impl ToString) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Replace the first header of the same name, or append
    pub fn set_header(&mut self, name: &str, value: impl ToString) {
        set_header(&mut self.headers, name, value.to_string());
    }

    pub fn remove_header(&mut self, name: &str) -> bool {
        remove_header(&mut self.headers, name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn append_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }
}

impl Message for HttpRequest {
    fn send(&self, transport: &mut dyn Transport) -> Result<(), StreamError> {
        let result = write!(transport, "{} {} {}\r\n", self.method, self.uri, self.version).and_then(|_| {
            let with_length = !self.body.is_empty() || self.is_method("POST") || self.is_method("PUT");
            write_headers_and_body(transport, &self.headers, self.keep_alive, &self.body, with_length)
        });
        result.map_err(|e| transport.last_error().unwrap_or(StreamError::from(&e)))
    }
}

impl Request for HttpRequest {
    type Response = HttpResponse;

    fn gen_response(&self) -> HttpResponse {
        let mut resp = HttpResponse::new();
        resp.modify(self.keep_alive, &self.version);
        resp
    }

    fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    version: String,
    status_code: u16,
    reason_phrase: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    keep_alive: bool,
    fake: FakeReason,
    result: i32,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            version: HTTP_1_1.to_string(),
            status_code: 200,
            reason_phrase: reason_phrase(200).to_string(),
            headers: Vec::new(),
            body: Vec::new(),
            keep_alive: true,
            fake: FakeReason::None,
            result: RESULT_OK,
        }
    }

    pub(crate) fn from_parts(
        version: String,
        status_code: u16,
        reason_phrase: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        keep_alive: bool,
    ) -> Self {
        let result = find_header(&headers, HEADER_RESULT)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(RESULT_OK);
        Self {
            version,
            status_code,
            reason_phrase,
            headers,
            body,
            keep_alive,
            fake: FakeReason::None,
            result,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Also resets the reason phrase to the canonical one
    pub fn set_status_code(&mut self, status_code: u16) {
        self.status_code = status_code;
        self.reason_phrase = reason_phrase(status_code).to_string();
    }

    pub fn reason_phrase(&self) -> &str {
        &self.reason_phrase
    }

    pub fn set_reason_phrase(&mut self, reason: &str) {
        self.reason_phrase = reason.to_string();
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn add_header(&mut self, name: &str, value: impl ToString) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn set_header(&mut self, name: &str, value: impl ToString) {
        set_header(&mut self.headers, name, value.to_string());
    }

    pub fn remove_header(&mut self, name: &str) -> bool {
        remove_header(&mut self.headers, name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn append_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn fake_reason(&self) -> FakeReason {
        self.fake
    }
}

impl Message for HttpResponse {
    fn send(&self, transport: &mut dyn Transport) -> Result<(), StreamError> {
        let result = write!(
            transport,
            "{} {} {}\r\n",
            self.version, self.status_code, self.reason_phrase
        )
        .and_then(|_| {
            if self.result != RESULT_OK {
                write!(transport, "{}: {}\r\n", HEADER_RESULT, self.result)?;
            }
            write_headers_and_body(transport, &self.headers, self.keep_alive, &self.body, true)
        });
        result.map_err(|e| transport.last_error().unwrap_or(StreamError::from(&e)))
    }

    fn is_fake(&self) -> bool {
        self.fake != FakeReason::None
    }
}

impl Response for HttpResponse {
    fn set_fake(&mut self, reason: FakeReason) {
        self.fake = reason;
    }

    fn result(&self) -> i32 {
        self.result
    }

    fn set_result(&mut self, result: i32) {
        self.result = result;
        if self.status_code == 200 {
            match result {
                RESULT_SHED => self.set_status_code(503),
                RESULT_DISPATCH_PANIC => self.set_status_code(500),
                _ => {}
            }
        }
    }

    fn modify(&mut self, keep_alive: bool, version: &str) {
        self.keep_alive = keep_alive;
        if !version.is_empty() {
            self.version = version.to_string();
        }
    }
}
