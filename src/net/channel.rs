//! Timed byte channel over a plaintext or TLS socket
//!
//! A [`Channel`] is the engine's only view of a socket: buffered reads,
//! line reads, buffered writes and an explicit flush, with one timeout
//! applied to every transport operation in either direction. A timeout is
//! sticky. Once a channel misses its deadline it is poisoned and every
//! later operation fails without touching the socket, so a stalled peer
//! can never be half-read.
//!
//! The same object exposes both the buffered and the raw view of the
//! stream: [`Channel::read`] drains buffered input before it touches the
//! transport, which is what the until-EOF legacy response path needs.

use std::io;
use std::time::Duration;

use memchr::memchr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;

use crate::config::MAXBUF;
use crate::errors::ChannelError;

/// The socket under a channel.
pub(crate) enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf).await,
            Transport::Unix(s) => s.read(buf).await,
            Transport::Tls(s) => s.read(buf).await,
        }
    }

    async fn write_flush(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => {
                if !buf.is_empty() {
                    s.write_all(buf).await?;
                }
                s.flush().await
            }
            Transport::Unix(s) => {
                if !buf.is_empty() {
                    s.write_all(buf).await?;
                }
                s.flush().await
            }
            Transport::Tls(s) => {
                if !buf.is_empty() {
                    s.write_all(buf).await?;
                }
                s.flush().await
            }
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.shutdown().await,
            Transport::Unix(s) => s.shutdown().await,
            Transport::Tls(s) => s.shutdown().await,
        }
    }

    async fn readable(&self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.readable().await,
            Transport::Unix(s) => s.readable().await,
            Transport::Tls(s) => s.get_ref().0.readable().await,
        }
    }
}

/// A bidirectional byte stream with per-operation timeouts and sticky
/// timeout poisoning.
pub(crate) struct Channel {
    transport: Transport,
    timeout: Option<Duration>,
    timed_out: bool,
    rd: Vec<u8>,
    rd_pos: usize,
    wr: Vec<u8>,
}

impl Channel {
    fn new(transport: Transport, to: Duration) -> Self {
        Channel {
            transport,
            timeout: if to.is_zero() { None } else { Some(to) },
            timed_out: false,
            rd: Vec::with_capacity(MAXBUF),
            rd_pos: 0,
            wr: Vec::with_capacity(MAXBUF),
        }
    }

    pub(crate) fn tcp(stream: TcpStream, to: Duration) -> Self {
        Self::new(Transport::Tcp(stream), to)
    }

    pub(crate) fn unix(stream: UnixStream, to: Duration) -> Self {
        Self::new(Transport::Unix(stream), to)
    }

    pub(crate) fn tls(stream: TlsStream<TcpStream>, to: Duration) -> Self {
        Self::new(Transport::Tls(Box::new(stream)), to)
    }

    /// One timed transport read into `buf`.
    async fn io_read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if self.timed_out {
            return Err(ChannelError::TimedOut);
        }
        match self.timeout {
            Some(to) => {
                let res = timeout(to, self.transport.read(buf)).await;
                match res {
                    Ok(r) => Ok(r?),
                    Err(_) => {
                        self.timed_out = true;
                        Err(ChannelError::TimedOut)
                    }
                }
            }
            None => Ok(self.transport.read(buf).await?),
        }
    }

    /// Reads buffered input first, then the transport. `Ok(0)` is EOF.
    pub(crate) async fn read(&mut self, out: &mut [u8]) -> Result<usize, ChannelError> {
        if self.rd_pos < self.rd.len() {
            let n = out.len().min(self.rd.len() - self.rd_pos);
            out[..n].copy_from_slice(&self.rd[self.rd_pos..self.rd_pos + n]);
            self.rd_pos += n;
            return Ok(n);
        }
        self.io_read(out).await
    }

    /// Next line terminated by `\n` or `\r\n`, terminator stripped.
    ///
    /// `Ok(None)` is a clean EOF before any byte of a line; EOF in the
    /// middle of a line is [`ChannelError::UnexpectedEof`]. A stripped
    /// line of `max` bytes or more is [`ChannelError::LineTooLong`].
    pub(crate) async fn read_line(&mut self, max: usize) -> Result<Option<Vec<u8>>, ChannelError> {
        loop {
            if let Some(nl) = memchr(b'\n', &self.rd[self.rd_pos..]) {
                let end = self.rd_pos + nl;
                let mut stop = end;
                if stop > self.rd_pos && self.rd[stop - 1] == b'\r' {
                    stop -= 1;
                }
                if stop - self.rd_pos >= max {
                    return Err(ChannelError::LineTooLong);
                }
                let line = self.rd[self.rd_pos..stop].to_vec();
                self.rd_pos = end + 1;
                return Ok(Some(line));
            }
            // No terminator buffered yet. The stripped line cannot get
            // shorter than pending - 1, so bail before buffering more.
            if self.rd.len() - self.rd_pos > max {
                return Err(ChannelError::LineTooLong);
            }
            self.rd.drain(..self.rd_pos);
            self.rd_pos = 0;
            let mut buf = [0u8; MAXBUF];
            let n = self.io_read(&mut buf).await?;
            if n == 0 {
                if self.rd.is_empty() {
                    return Ok(None);
                }
                return Err(ChannelError::UnexpectedEof);
            }
            self.rd.extend_from_slice(&buf[..n]);
        }
    }

    /// Queues bytes for the next flush.
    pub(crate) fn write(&mut self, bytes: &[u8]) {
        self.wr.extend_from_slice(bytes);
    }

    /// Queues one line; CRLF is appended.
    pub(crate) fn write_line(&mut self, line: &[u8]) {
        self.wr.extend_from_slice(line);
        self.wr.extend_from_slice(b"\r\n");
    }

    /// Writes everything queued through the transport and flushes it.
    pub(crate) async fn flush(&mut self) -> Result<(), ChannelError> {
        if self.timed_out {
            return Err(ChannelError::TimedOut);
        }
        let buf = std::mem::take(&mut self.wr);
        let res = match self.timeout {
            Some(to) => {
                let r = timeout(to, self.transport.write_flush(&buf)).await;
                match r {
                    Ok(r) => r.map_err(ChannelError::Io),
                    Err(_) => {
                        self.timed_out = true;
                        Err(ChannelError::TimedOut)
                    }
                }
            }
            None => self.transport.write_flush(&buf).await.map_err(ChannelError::Io),
        };
        let mut buf = buf;
        buf.clear();
        self.wr = buf;
        res
    }

    /// True when buffered input is waiting.
    pub(crate) fn peek_pending(&self) -> bool {
        self.rd_pos < self.rd.len()
    }

    /// True when buffered input exists or the socket polls readable
    /// within `wait`. A zero `wait` is an immediate probe.
    pub(crate) async fn wait_readable(&self, wait: Duration) -> bool {
        if self.peek_pending() {
            return true;
        }
        if self.timed_out {
            return false;
        }
        let res = timeout(wait, self.transport.readable()).await;
        matches!(res, Ok(Ok(())))
    }

    /// Best-effort flush and shutdown. TLS close_notify misbehavior on
    /// the peer side is tolerated by retrying, each attempt capped at one
    /// second.
    pub(crate) async fn shutdown(&mut self) {
        let _ = self.flush().await;
        for _ in 0..3 {
            let res = timeout(Duration::from_secs(1), self.transport.shutdown()).await;
            if matches!(res, Ok(Ok(()))) {
                break;
            }
        }
    }
}
