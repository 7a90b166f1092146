//! relay_http - HTTP/1.x reverse-proxy connection engine
//!
//! The per-connection core of a reverse-proxy load balancer: each accepted
//! client connection is owned by one worker that parses requests, picks a
//! backend through a pluggable [`Selector`], relays request and response
//! bodies without buffering them whole, and keeps the keep-alive cycle
//! going for as long as both sides allow.
//!
//! # What it does
//!
//! - **Dual protocol bridging** - the client and backend hops are framed
//!   independently; `Content-Length` and chunked bodies are relayed with
//!   their framing intact, and HTTP/1.0 until-EOF responses are handled in
//!   a legacy mode.
//! - **Smuggling defense** - ambiguous framing headers (both
//!   `Content-Length` and `Transfer-Encoding: chunked`, or duplicates of
//!   either) are dropped so exactly one framing survives on the wire.
//! - **Timed channels** - every read and write on either hop is bounded by
//!   a per-side timeout, and a channel that misses a deadline is poisoned
//!   for good.
//! - **TLS termination** - optional `rustls` termination with client
//!   certificate identity forwarded to the backend as `X-SSL-*` headers.
//! - **Backend resilience** - connect failures retry on another backend
//!   from the selector; stale idle backend connections are detected and
//!   replaced.
//! - **Access logging** - one line per transaction at five verbosity
//!   levels, from silent to Apache combined format.
//!
//! # Quick start
//!
//! ```no_run
//! use relay_http::{
//!     handle_connection, Backend, BackendAddr, ListenerConfig, StaticSelector,
//! };
//! use regex::Regex;
//! use std::{sync::Arc, time::Duration};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cfg = Arc::new(ListenerConfig::builder().name("www").build());
//!     let mut selector = StaticSelector::new();
//!     selector.add_service(
//!         "app",
//!         Regex::new(".*").unwrap(),
//!         vec![Backend::origin(
//!             BackendAddr::Inet("127.0.0.1:8080".parse().unwrap()),
//!             Duration::from_secs(15),
//!         )],
//!     );
//!     let selector = Arc::new(selector);
//!
//!     let listener = TcpListener::bind("0.0.0.0:8000").await.unwrap();
//!     loop {
//!         let (stream, peer) = listener.accept().await.unwrap();
//!         tokio::spawn(handle_connection(
//!             Arc::clone(&cfg),
//!             Arc::clone(&selector),
//!             stream,
//!             peer,
//!         ));
//!     }
//! }
//! ```
//!
//! The listener accept loop, the TLS context construction and the real
//! backend inventory are the embedding program's business; this crate
//! takes over at the moment a connection exists and gives it back closed.
pub(crate) mod http {
    pub(crate) mod headers;
    pub(crate) mod relay;
}
pub(crate) mod net {
    pub(crate) mod backend;
    pub(crate) mod channel;
}
pub(crate) mod proxy {
    pub(crate) mod pipeline;
    pub(crate) mod selector;
}
pub mod config;
pub mod errors;
pub(crate) mod logfmt;
pub mod tls;

pub use crate::{
    config::{
        verb_pattern, ForceHttp10, ListenerBuilder, ListenerConfig, Patterns, VerbGroup,
        MAXBUF, MAX_HEADERS,
    },
    errors::{ChannelError, ConnectError, ErrorClass, HeadError, RelayError},
    logfmt::LogFormat,
    proxy::{
        pipeline::handle_connection,
        selector::{Backend, BackendAddr, BackendKind, Selector, Service, StaticSelector},
    },
    tls::{ClientCertMode, TlsSettings},
};
