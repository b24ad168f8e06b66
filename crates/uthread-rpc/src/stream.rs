//! Buffered byte-stream transports
//!
//! `UThreadStream` runs on a `UThreadSocket`, so reads and writes park the
//! calling task instead of the thread. `BlockStream` is the same surface
//! over a plain blocking `TcpStream`, for clients outside any scheduler.
//!
//! Both buffer writes until `flush` and remember the classified error of
//! the last failed operation.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use uthread_core::{StreamError, UThreadResult};
use uthread_runtime::{Scheduler, UThreadSocket};

const BUF_SIZE: usize = 8192;

/// What a codec needs from the connection underneath it
pub trait Transport: BufRead + Write {
    /// Classification of the most recent failure, if any
    fn last_error(&self) -> Option<StreamError>;

    fn remote_addr(&self) -> Option<SocketAddr>;
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream detached")
}

pub struct UThreadStream {
    socket: Option<UThreadSocket>,
    rbuf: Box<[u8]>,
    pos: usize,
    filled: usize,
    wbuf: Vec<u8>,
    last_error: Option<StreamError>,
}

impl UThreadStream {
    pub fn new(socket: UThreadSocket) -> Self {
        Self {
            socket: Some(socket),
            rbuf: vec![0u8; BUF_SIZE].into_boxed_slice(),
            pos: 0,
            filled: 0,
            wbuf: Vec::with_capacity(BUF_SIZE),
            last_error: None,
        }
    }

    /// Connect from inside a task
    pub fn connect(scheduler: &Scheduler, addr: &SocketAddr, timeout_ms: i32) -> UThreadResult<Self> {
        scheduler.connect_tcp(addr, timeout_ms, timeout_ms).map(Self::new)
    }

    pub fn socket(&self) -> Option<&UThreadSocket> {
        self.socket.as_ref()
    }

    /// Give up the socket; the stream fails every later call
    pub fn detach(&mut self) -> Option<UThreadSocket> {
        self.wbuf.clear();
        self.pos = 0;
        self.filled = 0;
        self.socket.take()
    }

    fn record(&mut self, e: io::Error) -> io::Error {
        self.last_error = Some(StreamError::from(&e));
        e
    }
}

impl Read for UThreadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for UThreadStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos >= self.filled {
            let socket = self.socket.as_ref().ok_or_else(not_connected)?;
            match socket.recv(&mut self.rbuf) {
                Ok(n) => {
                    if n == 0 {
                        self.last_error = Some(StreamError::NormalClosed);
                    }
                    self.pos = 0;
                    self.filled = n;
                }
                Err(e) => return Err(self.record(e.into())),
            }
        }
        Ok(&self.rbuf[self.pos..self.filled])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.filled);
    }
}

impl Write for UThreadStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.socket.is_none() {
            return Err(not_connected());
        }
        self.wbuf.extend_from_slice(buf);
        if self.wbuf.len() >= BUF_SIZE {
            self.flush()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let socket = self.socket.as_ref().ok_or_else(not_connected)?;
        let result = socket.send(&self.wbuf);
        self.wbuf.clear();
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(self.record(e.into())),
        }
    }
}

impl Transport for UThreadStream {
    fn last_error(&self) -> Option<StreamError> {
        self.last_error
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.peer_addr())
    }
}

pub struct BlockStream {
    reader: BufReader<TcpStream>,
    wbuf: Vec<u8>,
    last_error: Option<StreamError>,
}

impl BlockStream {
    /// Wrap a connected stream; `timeout_ms <= 0` means no timeout
    pub fn new(stream: TcpStream, timeout_ms: i32) -> io::Result<Self> {
        let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms as u64));
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::with_capacity(BUF_SIZE, stream),
            wbuf: Vec::with_capacity(BUF_SIZE),
            last_error: None,
        })
    }

    pub fn connect(addr: &SocketAddr, timeout_ms: i32) -> io::Result<Self> {
        let stream = if timeout_ms > 0 {
            TcpStream::connect_timeout(addr, Duration::from_millis(timeout_ms as u64))?
        } else {
            TcpStream::connect(addr)?
        };
        Self::new(stream, timeout_ms)
    }

    pub fn get_ref(&self) -> &TcpStream {
        self.reader.get_ref()
    }

    fn record(&mut self, e: io::Error) -> io::Error {
        self.last_error = Some(StreamError::from(&e));
        e
    }
}

impl Read for BlockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).map_err(|e| self.record(e))
    }
}

impl BufRead for BlockStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self.reader.fill_buf() {
            Ok(available) => {
                if available.is_empty() {
                    self.last_error = Some(StreamError::NormalClosed);
                }
                Ok(available)
            }
            Err(e) => {
                self.last_error = Some(StreamError::from(&e));
                Err(e)
            }
        }
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt);
    }
}

impl Write for BlockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.wbuf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let result = self.reader.get_mut().write_all(&self.wbuf);
        self.wbuf.clear();
        result.map_err(|e| self.record(e))
    }
}

impl Transport for BlockStream {
    fn last_error(&self) -> Option<StreamError> {
        self.last_error
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.reader.get_ref().peer_addr().ok()
    }
}
