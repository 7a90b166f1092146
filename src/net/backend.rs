//! Backend connections
//!
//! A [`BackendSession`] owns one connection to a chosen origin server,
//! possibly kept across requests on the same client connection. Connects
//! are bounded by the backend's own timeout, and TCP sockets get
//! keep-alive plus a short linger so a dying worker never strands a
//! half-closed backend socket.

use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;

use crate::errors::ConnectError;
use crate::net::channel::Channel;
use crate::proxy::selector::{Backend, BackendAddr, BackendKind};

const BACKEND_LINGER: Duration = Duration::from_secs(10);

/// One live origin connection and the backend it belongs to.
pub(crate) struct BackendSession {
    pub(crate) channel: Channel,
    pub(crate) backend: Arc<Backend>,
}

impl BackendSession {
    /// Connects to an origin backend within its configured timeout.
    pub(crate) async fn connect(backend: &Arc<Backend>) -> Result<Self, ConnectError> {
        let BackendKind::Origin { addr, timeout: to } = &backend.kind else {
            return Err(ConnectError::NotOrigin);
        };
        let channel = match addr {
            BackendAddr::Inet(sockaddr) => {
                let stream = connect_timed(*to, TcpStream::connect(*sockaddr)).await?;
                let sock = SockRef::from(&stream);
                sock.set_keepalive(true)?;
                sock.set_linger(Some(BACKEND_LINGER))?;
                drop(sock);
                Channel::tcp(stream, *to)
            }
            BackendAddr::Unix(path) => {
                let stream = connect_timed(*to, UnixStream::connect(path)).await?;
                Channel::unix(stream, *to)
            }
        };
        Ok(BackendSession {
            channel,
            backend: Arc::clone(backend),
        })
    }
}

async fn connect_timed<T>(
    to: Duration,
    connect: impl std::future::Future<Output = std::io::Result<T>>,
) -> Result<T, ConnectError> {
    if to.is_zero() {
        return Ok(connect.await?);
    }
    match timeout(to, connect).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(ConnectError::TimedOut),
    }
}
