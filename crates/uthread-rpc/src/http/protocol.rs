//! HTTP/1.1 wire parsing
//!
//! Only `Content-Length` framing is understood. A response without a
//! length on a closing connection is read to end of stream.

use super::msg::{
    HttpRequest, HttpResponse, HEADER_CONNECTION, HEADER_CONTENT_LENGTH, HEADER_TRANSFER_ENCODING, HTTP_1_0,
};
use crate::msg::ProtocolError;
use crate::stream::Transport;
use std::io::{BufRead, Read};
use uthread_core::StreamError;

/// Longest start line or header line accepted
pub const MAX_LINE: usize = 8192;
pub const MAX_HEADERS: usize = 100;
pub const MAX_BODY: usize = 8 * 1024 * 1024;

type Headers = Vec<(String, String)>;

/// Read one CRLF (or LF) terminated line, without the terminator
///
/// `Ok(None)` is a clean end of stream before any byte of the line.
fn read_line(transport: &mut dyn Transport, violation: ProtocolError) -> Result<Option<String>, ProtocolError> {
    let mut line = Vec::new();
    loop {
        let available = transport.fill_buf()?;
        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(ProtocolError::Stream(StreamError::NormalClosed));
        }
        let (taken, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        line.extend_from_slice(&available[..taken]);
        transport.consume(taken);
        if line.len() > MAX_LINE {
            return Err(violation);
        }
        if done {
            break;
        }
    }

    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    String::from_utf8(line).map(Some).map_err(|_| violation)
}

fn read_headers(transport: &mut dyn Transport) -> Result<Headers, ProtocolError> {
    let mut headers = Vec::new();
    loop {
        let line = read_line(transport, ProtocolError::BadHeader)?
            .ok_or(ProtocolError::Stream(StreamError::NormalClosed))?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(ProtocolError::BadHeader);
        }
        let (name, value) = line.split_once(':').ok_or(ProtocolError::BadHeader)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ProtocolError::BadHeader);
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
}

fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn content_length(headers: &Headers) -> Result<Option<usize>, ProtocolError> {
    if header(headers, HEADER_TRANSFER_ENCODING).is_some_and(|v| v.to_ascii_lowercase().contains("chunked")) {
        return Err(ProtocolError::BadHeader);
    }
    match header(headers, HEADER_CONTENT_LENGTH) {
        None => Ok(None),
        Some(v) => {
            let len: usize = v.parse().map_err(|_| ProtocolError::BadContentLength)?;
            if len > MAX_BODY {
                return Err(ProtocolError::BodyTooLarge);
            }
            Ok(Some(len))
        }
    }
}

fn read_body(transport: &mut dyn Transport, len: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut body = vec![0u8; len];
    transport.read_exact(&mut body)?;
    Ok(body)
}

fn read_to_close(transport: &mut dyn Transport) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Vec::new();
    loop {
        let available = transport.fill_buf()?;
        if available.is_empty() {
            return Ok(body);
        }
        let n = available.len();
        if body.len() + n > MAX_BODY {
            return Err(ProtocolError::BodyTooLarge);
        }
        body.extend_from_slice(available);
        transport.consume(n);
    }
}

/// Persistent-connection rule: HTTP/1.1 stays open unless told to close,
/// HTTP/1.0 closes unless told to keep alive
pub fn negotiate_keep_alive(version: &str, connection: Option<&str>) -> bool {
    let token = |t: &str| {
        connection.is_some_and(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case(t)))
    };
    if version.eq_ignore_ascii_case(HTTP_1_0) {
        token("keep-alive")
    } else {
        !token("close")
    }
}

fn check_version(version: &str) -> Result<(), ProtocolError> {
    let bytes = version.as_bytes();
    if bytes.len() > 5 && bytes[..5].eq_ignore_ascii_case(b"HTTP/") {
        Ok(())
    } else {
        Err(ProtocolError::BadStartLine)
    }
}

pub fn recv_request(transport: &mut dyn Transport) -> Result<HttpRequest, ProtocolError> {
    let line = read_line(transport, ProtocolError::BadStartLine)?
        .ok_or(ProtocolError::Stream(StreamError::NormalClosed))?;
    let mut parts = line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v), None) => (m, u, v),
        _ => return Err(ProtocolError::BadStartLine),
    };
    check_version(version)?;

    let headers = read_headers(transport)?;
    let body = match content_length(&headers)? {
        Some(len) => read_body(transport, len)?,
        None => Vec::new(),
    };
    let keep_alive = negotiate_keep_alive(version, header(&headers, HEADER_CONNECTION));

    Ok(HttpRequest::from_parts(
        method.to_ascii_uppercase(),
        uri.to_string(),
        version.to_string(),
        headers,
        body,
        keep_alive,
    ))
}

/// `head_request` skips the body, as for a reply to `HEAD`
pub fn recv_response(transport: &mut dyn Transport, head_request: bool) -> Result<HttpResponse, ProtocolError> {
    let line = read_line(transport, ProtocolError::BadStartLine)?
        .ok_or(ProtocolError::Stream(StreamError::NormalClosed))?;
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    check_version(version)?;
    let status_code: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or(ProtocolError::BadStartLine)?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    let headers = read_headers(transport)?;
    let mut keep_alive = negotiate_keep_alive(version, header(&headers, HEADER_CONNECTION));
    let bodyless = head_request || status_code / 100 == 1 || status_code == 204 || status_code == 304;
    let body = if bodyless {
        Vec::new()
    } else {
        match content_length(&headers)? {
            Some(len) => read_body(transport, len)?,
            None => {
                keep_alive = false;
                read_to_close(transport)?
            }
        }
    };

    Ok(HttpResponse::from_parts(
        version.to_string(),
        status_code,
        reason,
        headers,
        body,
        keep_alive,
    ))
}
