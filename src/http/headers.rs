//! Header block reading and classification
//!
//! A head block is the start line plus raw header lines, kept as bytes so
//! that forwarded headers go out exactly as they came in. Classification
//! assigns each line to the small set of header kinds the engine acts on;
//! everything else is passed through untouched.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use memchr::memchr;
use regex::Regex;
use tracing::warn;

use crate::config::{MAXBUF, MAX_HEADERS};
use crate::errors::{ChannelError, HeadError};
use crate::net::channel::Channel;

/// One head block; line 0 is the start line.
pub(crate) struct HeadBlock {
    pub(crate) lines: Vec<Vec<u8>>,
}

impl HeadBlock {
    pub(crate) fn start_line(&self) -> &[u8] {
        &self.lines[0]
    }

    pub(crate) fn headers(&self) -> &[Vec<u8>] {
        &self.lines[1..]
    }
}

/// Reads one head block from `ch`.
///
/// Leading empty lines are skipped. `Ok(None)` means the peer closed
/// cleanly before sending anything, which is the normal end of a
/// keep-alive connection.
pub(crate) async fn read_head(ch: &mut Channel) -> Result<Option<HeadBlock>, HeadError> {
    let first = loop {
        match ch.read_line(MAXBUF - 1).await {
            Ok(None) => return Ok(None),
            Ok(Some(line)) if line.is_empty() => continue,
            Ok(Some(line)) => break line,
            Err(ChannelError::LineTooLong) => return Err(HeadError::TooLong),
            Err(ChannelError::UnexpectedEof) => return Err(HeadError::Truncated),
            Err(e) => return Err(HeadError::Channel(e)),
        }
    };

    let mut lines = vec![first];
    loop {
        match ch.read_line(MAXBUF - 1).await {
            Ok(Some(line)) if line.is_empty() => return Ok(Some(HeadBlock { lines })),
            Ok(Some(line)) => {
                if lines.len() == MAX_HEADERS {
                    return Err(HeadError::TooMany);
                }
                lines.push(line);
            }
            Ok(None) => return Err(HeadError::Truncated),
            Err(ChannelError::LineTooLong) => return Err(HeadError::TooLong),
            Err(ChannelError::UnexpectedEof) => return Err(HeadError::Truncated),
            Err(e) => return Err(HeadError::Channel(e)),
        }
    }
}

/// The header kinds the engine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderKind {
    Host,
    Referer,
    UserAgent,
    Connection,
    TransferEncoding,
    ContentLength,
    Destination,
    Location,
    ContentLocation,
    Authorization,
    Illegal,
    Other,
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn trim_blanks(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| *b != b' ' && *b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| *b != b' ' && *b != b'\t')
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}

/// Classifies one raw header line into `(kind, value)`.
///
/// The value is the field content with the name, the colon and
/// surrounding blanks removed. Lines without a colon, with a non-token
/// name or with a non-UTF-8 value come back as `Illegal` and are dropped
/// by the caller rather than forwarded.
pub(crate) fn classify(line: &[u8]) -> (HeaderKind, String) {
    let Some(colon) = memchr(b':', line) else {
        return (HeaderKind::Illegal, String::new());
    };
    let name = &line[..colon];
    if name.is_empty() || !name.iter().copied().all(is_token_byte) {
        return (HeaderKind::Illegal, String::new());
    }
    let value = match simdutf8::basic::from_utf8(trim_blanks(&line[colon + 1..])) {
        Ok(v) => v.to_string(),
        Err(_) => return (HeaderKind::Illegal, String::new()),
    };
    let kind = if name.eq_ignore_ascii_case(b"Host") {
        HeaderKind::Host
    } else if name.eq_ignore_ascii_case(b"Referer") {
        HeaderKind::Referer
    } else if name.eq_ignore_ascii_case(b"User-agent") {
        HeaderKind::UserAgent
    } else if name.eq_ignore_ascii_case(b"Connection") {
        HeaderKind::Connection
    } else if name.eq_ignore_ascii_case(b"Transfer-encoding") {
        HeaderKind::TransferEncoding
    } else if name.eq_ignore_ascii_case(b"Content-length") {
        HeaderKind::ContentLength
    } else if name.eq_ignore_ascii_case(b"Destination") {
        HeaderKind::Destination
    } else if name.eq_ignore_ascii_case(b"Location") {
        HeaderKind::Location
    } else if name.eq_ignore_ascii_case(b"Content-location") {
        HeaderKind::ContentLocation
    } else if name.eq_ignore_ascii_case(b"Authorization") {
        HeaderKind::Authorization
    } else {
        HeaderKind::Other
    };
    (kind, value)
}

/// Pulls the user name out of a `Basic` credentials line for logging.
/// Only the part before the first colon is kept.
pub(crate) fn basic_auth_user(line: &str, pattern: &Regex) -> Option<String> {
    let caps = pattern.captures(line)?;
    let payload = caps.get(1)?.as_str();
    let decoded = match STANDARD.decode(payload) {
        Ok(d) => d,
        Err(_) => {
            warn!("can't decode Basic credentials");
            return None;
        }
    };
    let text = String::from_utf8_lossy(&decoded);
    match text.split_once(':') {
        Some((user, _)) => Some(user.to_string()),
        None => {
            warn!("unknown authentication");
            None
        }
    }
}
