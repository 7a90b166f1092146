//! Access-log formatting
//!
//! One line per completed transaction, at one of five verbosity levels
//! picked in the listener configuration. Lines are emitted through the
//! `tracing` sink under the `access` target; the formatting itself is
//! kept separate so it can be tested without capturing a subscriber.

use std::net::IpAddr;

use chrono::Local;
use tracing::info;

/// Access-log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Nothing.
    Silent,
    /// Client, request line and response line.
    Brief,
    /// [`Brief`](LogFormat::Brief) plus backend address and elapsed time.
    Timed,
    /// Apache combined format prefixed with the virtual host.
    CombinedVhost,
    /// Apache combined format.
    Combined,
}

/// Everything one log line can need.
pub(crate) struct AccessEntry<'a> {
    pub(crate) client: IpAddr,
    pub(crate) request: &'a str,
    pub(crate) response: &'a str,
    pub(crate) backend: Option<&'a str>,
    pub(crate) elapsed_secs: f64,
    pub(crate) vhost: &'a str,
    pub(crate) user: &'a str,
    pub(crate) timestamp: &'a str,
    pub(crate) referer: &'a str,
    pub(crate) agent: &'a str,
    pub(crate) bytes: u64,
}

/// Timestamp in Apache log-file style, local time.
pub(crate) fn apache_time() -> String {
    Local::now().format("%d/%b/%Y:%H:%M:%S %z").to_string()
}

fn fmt_bytes(count: u64) -> String {
    if count > 0 {
        count.to_string()
    } else {
        "-".to_string()
    }
}

fn dash_if_empty(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

/// Status code as it appears in the response line.
fn status_of(response: &str) -> &str {
    response.get(9..12).unwrap_or("-")
}

fn combined(e: &AccessEntry<'_>, status: &str, bytes: &str) -> String {
    format!(
        "{} - {} [{}] \"{}\" {} {} \"{}\" \"{}\"",
        e.client,
        dash_if_empty(e.user),
        e.timestamp,
        e.request,
        status,
        bytes,
        e.referer,
        e.agent
    )
}

pub(crate) fn format_access(format: LogFormat, e: &AccessEntry<'_>) -> Option<String> {
    match format {
        LogFormat::Silent => None,
        LogFormat::Brief => Some(format!("{} {} - {}", e.client, e.request, e.response)),
        LogFormat::Timed => Some(format!(
            "{} {} - {} ({}) {:.3} sec",
            e.client,
            e.request,
            e.response,
            e.backend.unwrap_or("-"),
            e.elapsed_secs
        )),
        LogFormat::CombinedVhost if !e.vhost.is_empty() => Some(format!(
            "{} {}",
            e.vhost,
            combined(e, status_of(e.response), &fmt_bytes(e.bytes))
        )),
        LogFormat::CombinedVhost | LogFormat::Combined => {
            Some(combined(e, status_of(e.response), &fmt_bytes(e.bytes)))
        }
    }
}

pub(crate) fn format_redirect(format: LogFormat, e: &AccessEntry<'_>, target: &str) -> Option<String> {
    match format {
        LogFormat::Silent => None,
        LogFormat::Brief | LogFormat::Timed => {
            Some(format!("{} {} - REDIRECT {}", e.client, e.request, target))
        }
        LogFormat::CombinedVhost if !e.vhost.is_empty() => {
            Some(format!("{} {}", e.vhost, combined(e, "302", "0")))
        }
        LogFormat::CombinedVhost | LogFormat::Combined => Some(combined(e, "302", "0")),
    }
}

pub(crate) fn log_access(format: LogFormat, e: &AccessEntry<'_>) {
    if let Some(line) = format_access(format, e) {
        info!(target: "access", "{line}");
    }
}

pub(crate) fn log_redirect(format: LogFormat, e: &AccessEntry<'_>, target: &str) {
    if let Some(line) = format_redirect(format, e, target) {
        info!(target: "access", "{line}");
    }
}
