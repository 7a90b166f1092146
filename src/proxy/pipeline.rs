//! Per-connection request pipeline
//!
//! One worker owns one accepted client connection for its whole lifetime:
//! it reads requests, classifies them, picks a backend through the
//! selector, relays the request and response with their framing intact,
//! and loops while both sides agree on keep-alive. Any fatal error sends
//! a best-effort synthetic reply, logs one line, and tears the connection
//! down; only two failures are survivable, a backend that refuses the
//! connect (another backend is asked for) and an idle backend channel
//! that went stale (it is discarded and reopened).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::{ForceHttp10, ListenerConfig, MAXBUF};
use crate::errors::ErrorClass;
use crate::http::headers::{self, classify, HeadBlock, HeaderKind};
use crate::http::relay::{copy_chunked, copy_sized};
use crate::logfmt::{self, AccessEntry, LogFormat};
use crate::net::backend::BackendSession;
use crate::net::channel::Channel;
use crate::proxy::selector::{BackendKind, Selector};
use crate::tls::{self, ClientCertMode, TlsInfo};

/// Entry point: own `stream` until the connection is done.
///
/// Sets the client socket options, performs the TLS handshake when the
/// listener carries one (a failed handshake closes silently), then runs
/// the keep-alive loop. Both channels are shut down on every exit path.
pub async fn handle_connection<S: Selector>(
    cfg: Arc<ListenerConfig>,
    selector: Arc<S>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    {
        let sock = SockRef::from(&stream);
        let _ = sock.set_keepalive(true);
        let _ = sock.set_linger(Some(Duration::from_secs(10)));
    }

    let to = cfg.client_timeout;
    let (client, tls_info) = match cfg.tls.as_ref() {
        Some(tls_cfg) => {
            let accept = tls_cfg.acceptor.accept(stream);
            let accepted = if to.is_zero() {
                accept.await
            } else {
                match timeout(to, accept).await {
                    Ok(res) => res,
                    Err(_) => return,
                }
            };
            let tls_stream = match accepted {
                Ok(s) => s,
                // No certificate, bad certificate, garbage: close without
                // a reply, there is no usable channel to write one to.
                Err(_) => return,
            };
            let info = {
                let (_, tls_conn) = tls_stream.get_ref();
                TlsInfo {
                    peer_cert: if tls_cfg.client_cert == ClientCertMode::Off {
                        None
                    } else {
                        tls_conn
                            .peer_certificates()
                            .and_then(|certs| certs.first().cloned())
                    },
                    cipher: tls_conn
                        .negotiated_cipher_suite()
                        .map(|s| format!("{:?}", s.suite())),
                }
            };
            (Channel::tls(tls_stream, to), Some(info))
        }
        None => (Channel::tcp(stream, to), None),
    };

    let mut conn = Conn {
        cfg,
        selector,
        client,
        peer: peer.ip(),
        tls: tls_info,
        session: None,
        client_11: false,
        backend_11: false,
    };
    conn.run().await;
    conn.client.shutdown().await;
    if let Some(mut sess) = conn.session.take() {
        sess.channel.shutdown().await;
    }
}

/// Fatal: the worker is done, channels get torn down by the caller.
struct Halt;

struct Conn<S: Selector> {
    cfg: Arc<ListenerConfig>,
    selector: Arc<S>,
    client: Channel,
    peer: IpAddr,
    tls: Option<TlsInfo>,
    session: Option<BackendSession>,
    client_11: bool,
    backend_11: bool,
}

/// What one pass over the request headers decided.
pub(crate) struct RequestScan {
    /// Per line: forward it or drop it. Index 0 is the start line.
    pub(crate) ok: Vec<bool>,
    pub(crate) kinds: Vec<HeaderKind>,
    pub(crate) chunked: bool,
    pub(crate) content_len: Option<u64>,
    pub(crate) conn_closed: bool,
    pub(crate) v_host: String,
    pub(crate) referer: String,
    pub(crate) u_agent: String,
    pub(crate) u_name: String,
}

/// Classifies the request headers and applies the framing rules.
///
/// Ambiguous framing is defused line by line rather than by refusing the
/// request: a `Transfer-Encoding` arriving after `Content-Length` (or the
/// other way round), a second `chunked`, or a second `Content-Length` is
/// marked not-forwarded and the surviving framing wins. Headers matching
/// a removal pattern and syntactically bad lines are dropped the same
/// way.
pub(crate) fn scan_request(block: &HeadBlock, cfg: &ListenerConfig, client: IpAddr) -> RequestScan {
    let n = block.lines.len();
    let mut scan = RequestScan {
        ok: vec![true; n],
        kinds: vec![HeaderKind::Other; n],
        chunked: false,
        content_len: None,
        conn_closed: false,
        v_host: String::new(),
        referer: String::new(),
        u_agent: String::new(),
        u_name: String::new(),
    };
    for i in 1..n {
        let (kind, value) = classify(&block.lines[i]);
        scan.kinds[i] = kind;
        match kind {
            HeaderKind::Host => scan.v_host = value,
            HeaderKind::Referer => scan.referer = value,
            HeaderKind::UserAgent => scan.u_agent = value,
            HeaderKind::Connection => {
                if value.eq_ignore_ascii_case("close") {
                    scan.conn_closed = true;
                }
            }
            HeaderKind::TransferEncoding => {
                if scan.content_len.is_some() {
                    scan.ok[i] = false;
                } else if value.eq_ignore_ascii_case("chunked") {
                    if scan.chunked {
                        scan.ok[i] = false;
                    } else {
                        scan.chunked = true;
                    }
                }
            }
            HeaderKind::ContentLength => {
                if scan.chunked || scan.content_len.is_some() {
                    scan.ok[i] = false;
                } else {
                    match value.trim().parse::<u64>() {
                        Ok(len) => scan.content_len = Some(len),
                        Err(_) => {
                            warn!(client = %client, value = %value, "bad Content-Length");
                            scan.ok[i] = false;
                        }
                    }
                }
            }
            HeaderKind::Illegal => {
                if cfg.log_format != LogFormat::Silent {
                    info!(
                        client = %client,
                        line = %String::from_utf8_lossy(&block.lines[i]),
                        "bad header"
                    );
                }
                scan.ok[i] = false;
            }
            _ => {}
        }
        let text = String::from_utf8_lossy(&block.lines[i]);
        if scan.ok[i] && cfg.head_off.iter().any(|pat| pat.is_match(&text)) {
            scan.ok[i] = false;
        }
        if let Some(user) = headers::basic_auth_user(&text, &cfg.patterns.authorization) {
            scan.u_name = user;
        }
    }
    scan
}

fn host_matches(host: &str, addr: &str) -> bool {
    host == addr || Some(host) == addr.split(':').next()
}

impl<S: Selector> Conn<S> {
    async fn run(&mut self) {
        loop {
            match self.transaction().await {
                Ok(true) => continue,
                Ok(false) | Err(Halt) => break,
            }
        }
    }

    /// Writes one synthetic reply, best effort.
    async fn reply(&mut self, class: ErrorClass) {
        let body = match class {
            ErrorClass::UriTooLong => &self.cfg.err414,
            ErrorClass::ServerError => &self.cfg.err500,
            ErrorClass::NotImplemented => &self.cfg.err501,
            ErrorClass::Unavailable => &self.cfg.err503,
        };
        let head = format!(
            "HTTP/1.0 {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n",
            class.status_line(),
            body.len()
        );
        self.client.write(head.as_bytes());
        self.client.write(body.as_bytes());
        let _ = self.client.flush().await;
    }

    async fn redirect_reply(&mut self, location: &str) {
        let body = format!(
            "<html><head><title>Redirect</title></head><body><h1>Redirect</h1>\
             <p>You should go to <a href=\"{location}\">{location}</a></p></body></html>"
        );
        let head = format!(
            "HTTP/1.0 302 Found\r\nLocation: {location}\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        self.client.write(head.as_bytes());
        self.client.write(body.as_bytes());
        let _ = self.client.flush().await;
    }

    /// Handles one request. `Ok(true)` keeps the connection alive.
    async fn transaction(&mut self) -> Result<bool, Halt> {
        let mut block = match headers::read_head(&mut self.client).await {
            Ok(Some(block)) => block,
            Ok(None) => return Ok(false),
            Err(crate::errors::HeadError::TooLong) => {
                warn!(client = %self.peer, "request URI too long");
                self.reply(ErrorClass::UriTooLong).await;
                return Err(Halt);
            }
            Err(crate::errors::HeadError::TooMany) => {
                warn!(client = %self.peer, "too many headers");
                self.reply(ErrorClass::ServerError).await;
                return Err(Halt);
            }
            Err(crate::errors::HeadError::Truncated) => {
                warn!(client = %self.peer, "can't read header");
                self.reply(ErrorClass::ServerError).await;
                return Err(Halt);
            }
            Err(crate::errors::HeadError::Channel(e)) => {
                if !self.client_11 {
                    info!(client = %self.peer, error = %e, "error read from client");
                }
                return Err(Halt);
            }
        };

        let started = Instant::now();
        let stamp = logfmt::apache_time();

        let request_line = String::from_utf8_lossy(block.start_line()).into_owned();
        let (mut no_content, url) = {
            let Some(caps) = self.cfg.verb.captures(&request_line) else {
                warn!(client = %self.peer, request = %request_line, "bad request");
                self.reply(ErrorClass::NotImplemented).await;
                return Err(Halt);
            };
            let head_like = caps
                .get(1)
                .is_some_and(|m| m.as_str().eq_ignore_ascii_case("HEAD"));
            self.client_11 = caps.get(3).is_some_and(|m| m.as_str() == "1");
            (head_like, caps.get(2).map_or(String::new(), |m| m.as_str().to_string()))
        };
        if !self.cfg.url_pat.is_match(&url) {
            warn!(client = %self.peer, url = %url, "bad URL");
            self.reply(ErrorClass::NotImplemented).await;
            return Err(Halt);
        }

        let scan = scan_request(&block, &self.cfg, self.peer);
        let mut conn_closed = scan.conn_closed;

        if self.cfg.max_req > 0 && scan.content_len.is_some_and(|len| len > self.cfg.max_req) {
            warn!(client = %self.peer, length = scan.content_len, "request too large");
            self.reply(ErrorClass::NotImplemented).await;
            return Err(Halt);
        }

        // An idle backend channel that polls readable is at EOF (or is
        // talking out of turn): throw it away before writing to it.
        let stale = match self.session.as_ref() {
            Some(sess) => sess.channel.wait_readable(Duration::ZERO).await,
            None => false,
        };
        if stale {
            self.session = None;
        }

        let Some(svc) = self.selector.get_service(&self.cfg, &url, block.headers()) else {
            warn!(client = %self.peer, request = %request_line, "no service");
            self.reply(ErrorClass::Unavailable).await;
            return Err(Halt);
        };
        let mut backend = match self.selector.get_backend(&svc, self.peer, &url, block.headers()) {
            Some(be) => be,
            None => {
                warn!(client = %self.peer, request = %request_line, "no back-end");
                self.reply(ErrorClass::Unavailable).await;
                return Err(Halt);
            }
        };

        let switched = self
            .session
            .as_ref()
            .is_some_and(|sess| !Arc::ptr_eq(&sess.backend, &backend));
        if switched {
            self.session = None;
        }
        while self.session.is_none() && backend.is_origin() {
            match BackendSession::connect(&backend).await {
                Ok(sess) => self.session = Some(sess),
                Err(e) => {
                    warn!(backend = %backend.address(), error = %e, "backend connect");
                    self.selector.kill_backend(&svc, &backend);
                    match self.selector.get_backend(&svc, self.peer, &url, block.headers()) {
                        Some(next) => backend = next,
                        None => {
                            warn!(client = %self.peer, request = %request_line, "no back-end");
                            self.reply(ErrorClass::Unavailable).await;
                            return Err(Halt);
                        }
                    }
                }
            }
        }
        if !backend.is_origin() {
            self.session = None;
        }
        let be_addr = backend.address();

        // Request head towards the backend, with the Destination host
        // swapped for the chosen backend when configured.
        if backend.is_origin() && self.cfg.rewr_dest {
            for i in 1..block.lines.len() {
                if scan.ok[i] && scan.kinds[i] == HeaderKind::Destination {
                    let (_, value) = classify(&block.lines[i]);
                    match self.cfg.patterns.location.captures(&value) {
                        Some(caps) => {
                            let path =
                                caps.get(3).map_or("", |m| m.as_str()).trim_start_matches('/');
                            block.lines[i] =
                                format!("Destination: http://{be_addr}/{path}").into_bytes();
                        }
                        None => info!(value = %value, "can't parse Destination"),
                    }
                }
            }
        }
        if let Some(sess) = self.session.as_mut() {
            for (i, line) in block.lines.iter().enumerate() {
                if scan.ok[i] {
                    sess.channel.write_line(line);
                }
            }
            if let (Some(tls_cfg), Some(tls_info)) = (self.cfg.tls.as_ref(), self.tls.as_ref()) {
                if let Some(extra) = &tls_cfg.https_header {
                    sess.channel.write_line(extra.as_bytes());
                }
                if tls_cfg.client_cert != ClientCertMode::Off {
                    if let Some(cert) = &tls_info.peer_cert {
                        if let Some(fields) = tls::cert_fields(cert.as_ref()) {
                            sess.channel
                                .write_line(format!("X-SSL-Subject: {}", fields.subject).as_bytes());
                            sess.channel
                                .write_line(format!("X-SSL-Issuer: {}", fields.issuer).as_bytes());
                            sess.channel.write_line(
                                format!("X-SSL-notBefore: {}", fields.not_before).as_bytes(),
                            );
                            sess.channel.write_line(
                                format!("X-SSL-notAfter: {}", fields.not_after).as_bytes(),
                            );
                            sess.channel
                                .write_line(format!("X-SSL-serial: {}", fields.serial).as_bytes());
                            let mut pem = fields.pem.iter();
                            if let Some(first) = pem.next() {
                                sess.channel
                                    .write_line(format!("X-SSL-certificate: {first}").as_bytes());
                            }
                            for continuation in pem {
                                sess.channel.write_line(format!("\t{continuation}").as_bytes());
                            }
                        }
                        if let Some(cipher) = &tls_info.cipher {
                            sess.channel
                                .write_line(format!("X-SSL-cipher: {cipher}").as_bytes());
                        }
                    }
                }
            }
            sess.channel
                .write_line(format!("X-Forwarded-For: {}", self.peer).as_bytes());
            sess.channel.write_line(b"");
        }

        // Request body. Chunked only counts for an HTTP/1.1 client.
        let relay_res = if self.client_11 && scan.chunked {
            let dst = self.session.as_mut().map(|s| &mut s.channel);
            copy_chunked(&mut self.client, dst, None, self.cfg.max_req, &self.cfg.patterns).await
        } else if let Some(len) = scan.content_len.filter(|len| *len > 0) {
            let dst = self.session.as_mut().map(|s| &mut s.channel);
            copy_sized(&mut self.client, dst, len, None).await
        } else {
            Ok(())
        };
        if let Err(e) = relay_res {
            warn!(client = %self.peer, error = %e, "error copy client body");
            self.reply(ErrorClass::ServerError).await;
            return Err(Halt);
        }

        let flushed = match self.session.as_mut() {
            Some(sess) => sess.channel.flush().await,
            None => Ok(()),
        };
        if let Err(e) = flushed {
            warn!(backend = %be_addr, error = %e, "error flush to backend");
            self.reply(ErrorClass::ServerError).await;
            return Err(Halt);
        }

        let force_10 = match self.cfg.force_http10 {
            ForceHttp10::Off => false,
            ForceHttp10::Tls => self.tls.is_some(),
            ForceHttp10::TlsMsie => self.tls.is_some() && scan.u_agent.contains("MSIE"),
        };

        if let BackendKind::Redirect { url: target, append_path } = &backend.kind {
            let location = if *append_path {
                format!("{target}{url}")
            } else {
                target.clone()
            };
            self.redirect_reply(&location).await;
            let entry = AccessEntry {
                client: self.peer,
                request: &request_line,
                response: "",
                backend: None,
                elapsed_secs: 0.0,
                vhost: &scan.v_host,
                user: &scan.u_name,
                timestamp: &stamp,
                referer: &scan.referer,
                agent: &scan.u_agent,
                bytes: 0,
            };
            logfmt::log_redirect(self.cfg.log_format, &entry, &location);
            return Ok(self.client_11 && !conn_closed && !force_10);
        }

        // Response side. 100-class heads are absorbed and the next head
        // read from the same backend.
        let mut response_line = String::new();
        let mut res_bytes: u64 = 0;
        let mut skip = true;
        while skip {
            let head = {
                let Some(sess) = self.session.as_mut() else {
                    return Err(Halt);
                };
                headers::read_head(&mut sess.channel).await
            };
            let mut resp = match head {
                Ok(Some(resp)) => resp,
                Ok(None) | Err(_) => {
                    warn!(backend = %be_addr, "response error read");
                    self.reply(ErrorClass::ServerError).await;
                    return Err(Halt);
                }
            };

            response_line = String::from_utf8_lossy(resp.start_line()).into_owned();
            self.backend_11 = response_line.starts_with("HTTP/1.1");
            skip = self.cfg.patterns.resp_skip.is_match(&response_line);
            if !no_content && self.cfg.patterns.resp_ign.is_match(&response_line) {
                no_content = true;
            }

            let mut resp_chunked = false;
            let mut resp_len: Option<u64> = None;
            for i in 1..resp.lines.len() {
                let (kind, value) = classify(&resp.lines[i]);
                match kind {
                    HeaderKind::Connection => {
                        if value.eq_ignore_ascii_case("close") {
                            conn_closed = true;
                        }
                    }
                    HeaderKind::TransferEncoding => {
                        if value.eq_ignore_ascii_case("chunked") {
                            resp_chunked = true;
                            no_content = false;
                        }
                    }
                    HeaderKind::ContentLength => {
                        resp_len = value.trim().parse().ok();
                    }
                    HeaderKind::Location | HeaderKind::ContentLocation => {
                        if !scan.v_host.is_empty() && self.cfg.rewr_loc {
                            if let Some(caps) = self.cfg.patterns.location.captures(&value) {
                                let host = caps.get(2).map_or("", |m| m.as_str());
                                let path = caps
                                    .get(3)
                                    .map_or("", |m| m.as_str())
                                    .trim_start_matches('/')
                                    .to_string();
                                if host_matches(host, &be_addr)
                                    || host_matches(host, &self.cfg.addr.to_string())
                                {
                                    let scheme = if self.tls.is_some() { "https" } else { "http" };
                                    let name = if kind == HeaderKind::Location {
                                        "Location"
                                    } else {
                                        "Content-location"
                                    };
                                    resp.lines[i] =
                                        format!("{name}: {scheme}://{}/{path}", scan.v_host)
                                            .into_bytes();
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }

            self.selector.update_session(&svc, resp.headers(), &backend);

            if !skip {
                for line in &resp.lines {
                    self.client.write_line(line);
                }
                self.client.write_line(b"");
            }
            if let Err(e) = self.client.flush().await {
                info!(client = %self.peer, error = %e, "error flush headers to client");
                return Err(Halt);
            }

            if !no_content {
                if self.backend_11 && resp_chunked {
                    let Some(sess) = self.session.as_mut() else {
                        return Err(Halt);
                    };
                    let dst = if skip { None } else { Some(&mut self.client) };
                    let res = copy_chunked(
                        &mut sess.channel,
                        dst,
                        Some(&mut res_bytes),
                        0,
                        &self.cfg.patterns,
                    )
                    .await;
                    if let Err(e) = res {
                        warn!(backend = %be_addr, error = %e, "error copy response chunks");
                        return Err(Halt);
                    }
                } else if let Some(len) = resp_len {
                    let Some(sess) = self.session.as_mut() else {
                        return Err(Halt);
                    };
                    let dst = if skip { None } else { Some(&mut self.client) };
                    let res =
                        copy_sized(&mut sess.channel, dst, len, Some(&mut res_bytes)).await;
                    if let Err(e) = res {
                        warn!(backend = %be_addr, error = %e, "error copy response body");
                        return Err(Halt);
                    }
                } else if !skip {
                    // No framing at all: read to EOF the HTTP/1.0 way,
                    // which also takes keep-alive off the table for both
                    // sides.
                    let be_to = match &backend.kind {
                        BackendKind::Origin { timeout, .. } => *timeout,
                        BackendKind::Redirect { .. } => Duration::ZERO,
                    };
                    let Some(sess) = self.session.as_mut() else {
                        return Err(Halt);
                    };
                    if sess.channel.wait_readable(be_to).await {
                        self.client_11 = false;
                        self.backend_11 = false;
                        let mut buf = [0u8; MAXBUF];
                        loop {
                            let n = match sess.channel.read(&mut buf).await {
                                Ok(n) => n,
                                Err(e) => {
                                    warn!(backend = %be_addr, error = %e, "error read response body");
                                    return Err(Halt);
                                }
                            };
                            if n == 0 {
                                break;
                            }
                            self.client.write(&buf[..n]);
                            if let Err(e) = self.client.flush().await {
                                info!(client = %self.peer, error = %e, "error copy response body");
                                return Err(Halt);
                            }
                            res_bytes += n as u64;
                        }
                    }
                }
                if let Err(e) = self.client.flush().await {
                    info!(client = %self.peer, error = %e, "error final flush to client");
                    return Err(Halt);
                }
            }
        }

        let elapsed = started.elapsed();
        self.selector.update_backend(&backend, elapsed);

        let entry = AccessEntry {
            client: self.peer,
            request: &request_line,
            response: &response_line,
            backend: Some(&be_addr),
            elapsed_secs: elapsed.as_secs_f64(),
            vhost: &scan.v_host,
            user: &scan.u_name,
            timestamp: &stamp,
            referer: &scan.referer,
            agent: &scan.u_agent,
            bytes: res_bytes,
        };
        logfmt::log_access(self.cfg.log_format, &entry);

        if !self.backend_11 {
            self.session = None;
        }
        Ok(self.client_11 && !conn_closed && !force_10)
    }
}
