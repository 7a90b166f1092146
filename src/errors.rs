use std::io;

use thiserror::Error;

/// Failures of a timed byte channel.
///
/// A channel that hits its direction timeout is poisoned: every later
/// operation returns [`ChannelError::TimedOut`] without touching the
/// socket.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel timed out")]
    TimedOut,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("line too long")]
    LineTooLong,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures while reading one header block (start line + headers +
/// terminating empty line).
#[derive(Debug, Error)]
pub enum HeadError {
    /// A line reached the buffer limit (reported as 414 to the client).
    #[error("request line too long")]
    TooLong,

    /// More lines than the block limit allows (reported as 500).
    #[error("too many headers")]
    TooMany,

    /// The peer went away in the middle of the block (reported as 500).
    #[error("header block truncated")]
    Truncated,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Failures while relaying a message body, one variant per logged reason.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("body truncated before the declared length")]
    Truncated,

    #[error("bad chunk header <{0}>")]
    BadChunkHeader(String),

    #[error("chunk content too large ({0} bytes)")]
    ChunkTooLarge(u64),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Failures while opening a backend connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("backend connect timed out")]
    TimedOut,

    #[error("backend is not an origin server")]
    NotOrigin,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The four synthetic replies the engine can send on its own behalf.
///
/// All of them go out as `HTTP/1.0` with a `text/html` body taken from
/// the listener configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    UriTooLong,
    ServerError,
    NotImplemented,
    Unavailable,
}

impl ErrorClass {
    pub fn status_line(self) -> &'static str {
        match self {
            ErrorClass::UriTooLong => "414 Request URI too long",
            ErrorClass::ServerError => "500 Internal Server Error",
            ErrorClass::NotImplemented => "501 Not Implemented",
            ErrorClass::Unavailable => "503 Service Unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines() {
        assert_eq!(ErrorClass::UriTooLong.status_line(), "414 Request URI too long");
        assert_eq!(ErrorClass::ServerError.status_line(), "500 Internal Server Error");
        assert_eq!(ErrorClass::NotImplemented.status_line(), "501 Not Implemented");
        assert_eq!(ErrorClass::Unavailable.status_line(), "503 Service Unavailable");
    }

    #[test]
    fn channel_error_wraps_io() {
        let e: ChannelError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(e, ChannelError::Io(_)));
    }
}
