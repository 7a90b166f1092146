//! Service and backend inventory interface
//!
//! The connection engine never owns routing policy. It asks a [`Selector`]
//! for a service matching the request, then for a backend within that
//! service, reports dead backends back, and feeds response headers and
//! timings to the inventory after each transaction. The real inventory
//! with health checks and session affinity lives outside this crate;
//! [`StaticSelector`] is a minimal round-robin implementation good enough
//! for tests and static deployments.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::config::ListenerConfig;

/// Where an origin server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendAddr::Inet(addr) => write!(f, "{addr}"),
            BackendAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// What a backend is: a real origin server or a redirect rule answered
/// locally.
#[derive(Debug, Clone)]
pub enum BackendKind {
    Origin {
        addr: BackendAddr,
        /// Connect and read timeout for this origin.
        timeout: Duration,
    },
    Redirect {
        url: String,
        /// Append the request path to `url` when replying.
        append_path: bool,
    },
}

/// One destination a service can route to.
#[derive(Debug)]
pub struct Backend {
    pub kind: BackendKind,
}

impl Backend {
    pub fn origin(addr: BackendAddr, timeout: Duration) -> Self {
        Backend {
            kind: BackendKind::Origin { addr, timeout },
        }
    }

    pub fn redirect(url: &str, append_path: bool) -> Self {
        Backend {
            kind: BackendKind::Redirect {
                url: url.to_string(),
                append_path,
            },
        }
    }

    pub fn is_origin(&self) -> bool {
        matches!(self.kind, BackendKind::Origin { .. })
    }

    /// Address string for logs and header rewrites.
    pub fn address(&self) -> String {
        match &self.kind {
            BackendKind::Origin { addr, .. } => addr.to_string(),
            BackendKind::Redirect { url, .. } => url.clone(),
        }
    }
}

/// A routing group of backends. Opaque to the engine; the selector owns
/// whatever state it needs behind the handle.
#[derive(Debug)]
pub struct Service {
    pub name: String,
}

/// The inventory interface the engine consumes.
///
/// Handles are compared by pointer identity, so a selector must hand out
/// the same `Arc` for the same service or backend across calls.
/// Implementations are called concurrently from many workers.
pub trait Selector: Send + Sync + 'static {
    /// Picks the service for a request, or `None` for 503.
    fn get_service(
        &self,
        listener: &ListenerConfig,
        url: &str,
        headers: &[Vec<u8>],
    ) -> Option<Arc<Service>>;

    /// Picks a backend within `service`, or `None` for 503.
    fn get_backend(
        &self,
        service: &Arc<Service>,
        client: IpAddr,
        url: &str,
        headers: &[Vec<u8>],
    ) -> Option<Arc<Backend>>;

    /// Reports a backend that failed to connect.
    fn kill_backend(&self, service: &Arc<Service>, backend: &Arc<Backend>);

    /// Feeds response headers back for session tracking.
    fn update_session(&self, service: &Arc<Service>, response_headers: &[Vec<u8>], backend: &Arc<Backend>);

    /// Reports how long `backend` took to answer.
    fn update_backend(&self, backend: &Arc<Backend>, elapsed: Duration);
}

struct BackendSlot {
    backend: Arc<Backend>,
    healthy: bool,
}

struct ServiceEntry {
    service: Arc<Service>,
    url_pat: Regex,
    backends: RwLock<Vec<BackendSlot>>,
    counter: AtomicUsize,
}

/// URL-routed services over round-robin backends.
///
/// `kill_backend` marks a backend unhealthy and it stays out of rotation
/// until [`StaticSelector::revive`] is called. Sessions are not tracked.
pub struct StaticSelector {
    services: Vec<ServiceEntry>,
}

impl StaticSelector {
    pub fn new() -> Self {
        StaticSelector {
            services: Vec::new(),
        }
    }

    /// Adds a service matching `url_pat` with the given backends, tried
    /// in registration order of the services.
    pub fn add_service(&mut self, name: &str, url_pat: Regex, backends: Vec<Backend>) {
        self.services.push(ServiceEntry {
            service: Arc::new(Service {
                name: name.to_string(),
            }),
            url_pat,
            backends: RwLock::new(
                backends
                    .into_iter()
                    .map(|b| BackendSlot {
                        backend: Arc::new(b),
                        healthy: true,
                    })
                    .collect(),
            ),
            counter: AtomicUsize::new(0),
        });
    }

    /// Puts every backend of `service` back into rotation.
    pub fn revive(&self, service: &Arc<Service>) {
        for entry in &self.services {
            if Arc::ptr_eq(&entry.service, service) {
                let mut slots = entry.backends.write().expect("backend lock");
                for slot in slots.iter_mut() {
                    slot.healthy = true;
                }
            }
        }
    }

    fn entry_for(&self, service: &Arc<Service>) -> Option<&ServiceEntry> {
        self.services
            .iter()
            .find(|e| Arc::ptr_eq(&e.service, service))
    }
}

impl Default for StaticSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for StaticSelector {
    fn get_service(
        &self,
        _listener: &ListenerConfig,
        url: &str,
        _headers: &[Vec<u8>],
    ) -> Option<Arc<Service>> {
        self.services
            .iter()
            .find(|e| e.url_pat.is_match(url))
            .map(|e| Arc::clone(&e.service))
    }

    fn get_backend(
        &self,
        service: &Arc<Service>,
        _client: IpAddr,
        _url: &str,
        _headers: &[Vec<u8>],
    ) -> Option<Arc<Backend>> {
        let entry = self.entry_for(service)?;
        let slots = entry.backends.read().expect("backend lock");
        let healthy: Vec<&BackendSlot> = slots.iter().filter(|s| s.healthy).collect();
        if healthy.is_empty() {
            return None;
        }
        let idx = entry.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(Arc::clone(&healthy[idx].backend))
    }

    fn kill_backend(&self, service: &Arc<Service>, backend: &Arc<Backend>) {
        let Some(entry) = self.entry_for(service) else {
            return;
        };
        let mut slots = entry.backends.write().expect("backend lock");
        for slot in slots.iter_mut() {
            if Arc::ptr_eq(&slot.backend, backend) {
                slot.healthy = false;
                debug!(
                    service = %service.name,
                    backend = %backend.address(),
                    "marked backend dead"
                );
            }
        }
    }

    fn update_session(
        &self,
        _service: &Arc<Service>,
        _response_headers: &[Vec<u8>],
        _backend: &Arc<Backend>,
    ) {
    }

    fn update_backend(&self, backend: &Arc<Backend>, elapsed: Duration) {
        debug!(backend = %backend.address(), elapsed_us = elapsed.as_micros() as u64, "backend timing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;

    fn inet(port: u16) -> Backend {
        Backend::origin(
            BackendAddr::Inet(SocketAddr::from(([10, 0, 0, 1], port))),
            Duration::from_secs(15),
        )
    }

    fn cfg() -> ListenerConfig {
        ListenerConfig::builder().build()
    }

    fn client() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    #[test]
    fn round_robin_cycles() {
        let mut sel = StaticSelector::new();
        sel.add_service(
            "api",
            Regex::new(".*").unwrap(),
            vec![inet(8001), inet(8002), inet(8003)],
        );
        let cfg = cfg();
        let svc = sel.get_service(&cfg, "/x", &[]).unwrap();

        let picks: Vec<String> = (0..4)
            .map(|_| sel.get_backend(&svc, client(), "/x", &[]).unwrap().address())
            .collect();
        assert_eq!(picks[0], "10.0.0.1:8001");
        assert_eq!(picks[1], "10.0.0.1:8002");
        assert_eq!(picks[2], "10.0.0.1:8003");
        assert_eq!(picks[3], "10.0.0.1:8001");
    }

    #[test]
    fn killed_backend_leaves_rotation() {
        let mut sel = StaticSelector::new();
        sel.add_service("api", Regex::new(".*").unwrap(), vec![inet(8001), inet(8002)]);
        let cfg = cfg();
        let svc = sel.get_service(&cfg, "/", &[]).unwrap();

        let first = sel.get_backend(&svc, client(), "/", &[]).unwrap();
        sel.kill_backend(&svc, &first);
        for _ in 0..4 {
            let pick = sel.get_backend(&svc, client(), "/", &[]).unwrap();
            assert!(!Arc::ptr_eq(&pick, &first));
        }
    }

    #[test]
    fn exhausted_service_returns_none() {
        let mut sel = StaticSelector::new();
        sel.add_service("api", Regex::new(".*").unwrap(), vec![inet(8001)]);
        let cfg = cfg();
        let svc = sel.get_service(&cfg, "/", &[]).unwrap();
        let be = sel.get_backend(&svc, client(), "/", &[]).unwrap();
        sel.kill_backend(&svc, &be);
        assert!(sel.get_backend(&svc, client(), "/", &[]).is_none());

        sel.revive(&svc);
        assert!(sel.get_backend(&svc, client(), "/", &[]).is_some());
    }

    #[test]
    fn services_match_by_url() {
        let mut sel = StaticSelector::new();
        sel.add_service("img", Regex::new("^/images/").unwrap(), vec![inet(9001)]);
        sel.add_service("rest", Regex::new(".*").unwrap(), vec![inet(9002)]);
        let cfg = cfg();

        assert_eq!(sel.get_service(&cfg, "/images/a.png", &[]).unwrap().name, "img");
        assert_eq!(sel.get_service(&cfg, "/index.html", &[]).unwrap().name, "rest");
    }

    #[test]
    fn no_matching_service() {
        let mut sel = StaticSelector::new();
        sel.add_service("img", Regex::new("^/images/").unwrap(), vec![inet(9001)]);
        let cfg = cfg();
        assert!(sel.get_service(&cfg, "/other", &[]).is_none());
    }

    #[test]
    fn redirect_backend_shape() {
        let be = Backend::redirect("http://elsewhere.example", true);
        assert!(!be.is_origin());
        assert_eq!(be.address(), "http://elsewhere.example");
    }
}
