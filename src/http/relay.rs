//! Message body relay
//!
//! Copies a length-framed or chunk-framed body between two channels
//! without ever holding more than one buffer of it. The sink is flushed
//! after every buffer so a slow reader on either side cannot stall the
//! other past its timeout. A sink of `None` consumes the source without
//! writing, which serves both the discard mode of absorbed responses and
//! request bodies addressed to a redirect rule.

use tracing::warn;

use crate::config::{Patterns, MAXBUF};
use crate::errors::RelayError;
use crate::net::channel::Channel;

/// Copies exactly `length` bytes from `src` to `dst`.
///
/// A source EOF before the byte count is satisfied is a truncation
/// error. `count`, when given, accumulates the bytes moved.
pub(crate) async fn copy_sized(
    src: &mut Channel,
    mut dst: Option<&mut Channel>,
    length: u64,
    mut count: Option<&mut u64>,
) -> Result<(), RelayError> {
    let mut buf = [0u8; MAXBUF];
    let mut remaining = length;
    while remaining > 0 {
        let want = remaining.min(MAXBUF as u64) as usize;
        let n = src.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(RelayError::Truncated);
        }
        if let Some(dst) = dst.as_deref_mut() {
            dst.write(&buf[..n]);
            dst.flush().await?;
        }
        remaining -= n as u64;
        if let Some(c) = count.as_deref_mut() {
            *c += n as u64;
        }
    }
    Ok(())
}

/// Copies a chunk-framed body from `src` to `dst`, preserving the chunk
/// framing on the wire: size line, body, terminating CRLF, and finally
/// any trailer headers through the empty line.
///
/// `max` caps the cumulative declared size; zero means uncapped.
pub(crate) async fn copy_chunked(
    src: &mut Channel,
    mut dst: Option<&mut Channel>,
    mut count: Option<&mut u64>,
    max: u64,
    patterns: &Patterns,
) -> Result<(), RelayError> {
    let mut total: u64 = 0;
    loop {
        let line = match src.read_line(MAXBUF - 1).await? {
            Some(line) => line,
            None => return Err(RelayError::Truncated),
        };
        let size = chunk_size(&line, patterns)?;

        if let Some(dst) = dst.as_deref_mut() {
            dst.write_line(&line);
        }

        total += size;
        if max > 0 && total > max {
            return Err(RelayError::ChunkTooLarge(total));
        }

        if size == 0 {
            break;
        }
        copy_sized(src, dst.as_deref_mut(), size, count.as_deref_mut()).await?;

        // The CRLF closing the chunk body travels as an empty line.
        let tail = match src.read_line(MAXBUF - 1).await? {
            Some(tail) => tail,
            None => return Err(RelayError::Truncated),
        };
        if !tail.is_empty() {
            warn!(
                line = %String::from_utf8_lossy(&tail),
                "unexpected data after chunk"
            );
        }
        if let Some(dst) = dst.as_deref_mut() {
            dst.write_line(&tail);
        }
    }

    // Trailer headers, forwarded through the terminating empty line.
    loop {
        let line = match src.read_line(MAXBUF - 1).await? {
            Some(line) => line,
            None => return Err(RelayError::Truncated),
        };
        let done = line.is_empty();
        if let Some(dst) = dst.as_deref_mut() {
            dst.write_line(&line);
            dst.flush().await?;
        }
        if done {
            break;
        }
    }
    Ok(())
}

fn chunk_size(line: &[u8], patterns: &Patterns) -> Result<u64, RelayError> {
    let bad = || RelayError::BadChunkHeader(String::from_utf8_lossy(line).into_owned());
    let text = simdutf8::basic::from_utf8(line).map_err(|_| bad())?;
    let caps = patterns.chunk_head.captures(text).ok_or_else(bad)?;
    let digits = caps.get(1).ok_or_else(bad)?.as_str();
    u64::from_str_radix(digits, 16).map_err(|_| bad())
}
