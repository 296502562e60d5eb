//! Backend selection and the upstream proxy leg
//!
mod connect;
mod proxy;

pub use self::connect::{Connect, TcpConnector};
pub use self::proxy::{ProxyConnection, Error};

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use netbuf::Buf;

use enums::Status;


/// Health of an upstream as currently known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Online,
    Offline,
    Unknown,
}

/// Where a backend accepts connections
#[derive(Debug, Clone)]
pub enum BackendAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// A logical upstream server
///
/// Counters are atomic because a director may be shared between workers;
/// comparisons against them are best-effort, not strictly fair.
pub struct Backend {
    name: String,
    addr: BackendAddr,
    capacity: usize,
    active: AtomicUsize,
    hits: AtomicUsize,
    health: AtomicUsize,
}

impl Backend {
    pub fn new<S: Into<String>>(name: S, addr: BackendAddr, capacity: usize)
        -> Backend
    {
        Backend {
            name: name.into(),
            addr: addr,
            capacity: capacity,
            active: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
            health: AtomicUsize::new(Health::Online as usize),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &BackendAddr {
        &self.addr
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests currently in flight against this backend
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Total requests ever scheduled to this backend
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> Health {
        match self.health.load(Ordering::SeqCst) {
            x if x == Health::Online as usize => Health::Online,
            x if x == Health::Offline as usize => Health::Offline,
            _ => Health::Unknown,
        }
    }

    pub fn set_health(&self, health: Health) {
        self.health.store(health as usize, Ordering::SeqCst);
    }

    /// Append a JSON object describing this backend
    pub fn stats_json(&self, out: &mut Buf) {
        write!(out,
            "{{\"name\": \"{}\", \"capacity\": {}, \"active\": {}, \
              \"hits\": {}, \"health\": \"{}\"}}",
            self.name, self.capacity, self.active(), self.hits(),
            match self.health() {
                Health::Online => "online",
                Health::Offline => "offline",
                Health::Unknown => "unknown",
            }).unwrap();
    }
}

/// Per-request record of which backends were already attempted
pub struct Ledger {
    tried: Vec<usize>,
    started: Instant,
}

impl Ledger {
    pub fn new() -> Ledger {
        Ledger {
            tried: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn attempts(&self) -> usize {
        self.tried.len()
    }
}

/// Result of a scheduling decision
pub enum Schedule {
    Backend(Arc<Backend>),
    /// No backend can serve this request; answer the client with the status
    GiveUp(Status),
}

/// Selects a backend per request and enforces retry and capacity policies
pub struct Director {
    backends: Vec<Arc<Backend>>,
    inflight: AtomicUsize,
    retry_timeout: Duration,
    connect_timeout: Duration,
    cloak_origin: bool,
}

impl Director {
    pub fn new() -> Director {
        Director {
            backends: Vec::new(),
            inflight: AtomicUsize::new(0),
            retry_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(4),
            cloak_origin: true,
        }
    }

    /// Backends are attempted in the order they were added
    pub fn add_backend(&mut self, backend: Backend) -> &mut Self {
        self.backends.push(Arc::new(backend));
        self
    }

    /// Total time a request may spend being (re)scheduled
    pub fn retry_timeout(&mut self, value: Duration) -> &mut Self {
        self.retry_timeout = value;
        self
    }

    pub fn connect_timeout(&mut self, value: Duration) -> &mut Self {
        self.connect_timeout = value;
        self
    }

    /// Whether to strip the origin's `Server` header from responses
    pub fn cloak_origin(&mut self, value: bool) -> &mut Self {
        self.cloak_origin = value;
        self
    }

    /// Create an Arc'd director to share with connections
    pub fn done(&mut self) -> Arc<Director> {
        Arc::new(Director {
            backends: self.backends.clone(),
            inflight: AtomicUsize::new(0),
            retry_timeout: self.retry_timeout,
            connect_timeout: self.connect_timeout,
            cloak_origin: self.cloak_origin,
        })
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn is_cloaking(&self) -> bool {
        self.cloak_origin
    }

    pub fn connect_deadline(&self) -> Duration {
        self.connect_timeout
    }

    /// Requests currently in flight through this director
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Pick a backend for a request, accounting for a failed attempt
    ///
    /// `failed` is the backend of the attempt that just failed before
    /// producing a valid upstream status, if any; its in-flight slot is
    /// given back here, so every attempt decrements exactly once (the
    /// success path decrements through `release`).
    pub fn reschedule(&self, ledger: &mut Ledger,
        failed: Option<&Arc<Backend>>)
        -> Schedule
    {
        if let Some(backend) = failed {
            if let Some(idx) = self.index_of(backend) {
                if !ledger.tried.contains(&idx) {
                    ledger.tried.push(idx);
                }
            }
            backend.active.fetch_sub(1, Ordering::SeqCst);
            self.inflight.fetch_sub(1, Ordering::SeqCst);
        }
        if ledger.started.elapsed() >= self.retry_timeout {
            return Schedule::GiveUp(Status::GatewayTimeout);
        }
        let mut online_left = false;
        for (idx, backend) in self.backends.iter().enumerate() {
            if backend.health() != Health::Online {
                continue;
            }
            if ledger.tried.contains(&idx) {
                continue;
            }
            online_left = true;
            if backend.active() >= backend.capacity {
                continue;
            }
            ledger.tried.push(idx);
            backend.active.fetch_add(1, Ordering::SeqCst);
            backend.hits.fetch_add(1, Ordering::SeqCst);
            self.inflight.fetch_add(1, Ordering::SeqCst);
            return Schedule::Backend(backend.clone());
        }
        if online_left {
            // untried backends exist but all are at capacity
            Schedule::GiveUp(Status::ServiceUnavailable)
        } else {
            Schedule::GiveUp(Status::BadGateway)
        }
    }

    /// Give back an in-flight slot after a fully proxied response
    pub fn release(&self, backend: &Arc<Backend>) {
        backend.active.fetch_sub(1, Ordering::SeqCst);
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Append a JSON array describing all backends
    pub fn stats_json(&self, out: &mut Buf) {
        out.write_all(b"[").unwrap();
        for (idx, backend) in self.backends.iter().enumerate() {
            if idx > 0 {
                out.write_all(b", ").unwrap();
            }
            backend.stats_json(out);
        }
        out.write_all(b"]").unwrap();
    }

    fn index_of(&self, backend: &Arc<Backend>) -> Option<usize> {
        self.backends.iter()
            .position(|b| &**b as *const Backend
                          == &**backend as *const Backend)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use enums::Status;
    use super::{Backend, BackendAddr, Director, Health, Ledger, Schedule};

    fn addr(port: u16) -> BackendAddr {
        BackendAddr::Tcp(format!("127.0.0.1:{}", port).parse().unwrap())
    }

    #[test]
    fn round_of_attempts() {
        let director = Director::new()
            .add_backend(Backend::new("b1", addr(8001), 1))
            .add_backend(Backend::new("b2", addr(8002), 1))
            .done();
        let mut ledger = Ledger::new();
        let first = match director.reschedule(&mut ledger, None) {
            Schedule::Backend(b) => b,
            Schedule::GiveUp(..) => panic!("expected backend"),
        };
        assert_eq!(first.name(), "b1");
        assert_eq!(first.active(), 1);
        assert_eq!(director.inflight(), 1);

        // first attempt failed, the slot is given back
        let second = match director.reschedule(&mut ledger, Some(&first)) {
            Schedule::Backend(b) => b,
            Schedule::GiveUp(..) => panic!("expected backend"),
        };
        assert_eq!(second.name(), "b2");
        assert_eq!(first.active(), 0);
        assert_eq!(director.inflight(), 1);

        // everything tried now
        match director.reschedule(&mut ledger, Some(&second)) {
            Schedule::GiveUp(status) => {
                assert_eq!(status, Status::BadGateway);
            }
            Schedule::Backend(..) => panic!("expected give-up"),
        }
        assert_eq!(director.inflight(), 0);
    }

    #[test]
    fn offline_backends_are_skipped() {
        let director = Director::new()
            .add_backend(Backend::new("b1", addr(8001), 1))
            .add_backend(Backend::new("b2", addr(8002), 1))
            .done();
        director.backends()[0].set_health(Health::Offline);
        let mut ledger = Ledger::new();
        match director.reschedule(&mut ledger, None) {
            Schedule::Backend(b) => assert_eq!(b.name(), "b2"),
            Schedule::GiveUp(..) => panic!("expected backend"),
        }
    }

    #[test]
    fn capacity_limit() {
        let director = Director::new()
            .add_backend(Backend::new("b1", addr(8001), 1))
            .done();
        let mut one = Ledger::new();
        let backend = match director.reschedule(&mut one, None) {
            Schedule::Backend(b) => b,
            Schedule::GiveUp(..) => panic!("expected backend"),
        };
        let mut two = Ledger::new();
        match director.reschedule(&mut two, None) {
            Schedule::GiveUp(status) => {
                assert_eq!(status, Status::ServiceUnavailable);
            }
            Schedule::Backend(..) => panic!("capacity ignored"),
        }
        director.release(&backend);
        assert_eq!(backend.active(), 0);
        match director.reschedule(&mut two, None) {
            Schedule::Backend(b) => assert_eq!(b.name(), "b1"),
            Schedule::GiveUp(..) => panic!("expected backend"),
        }
    }

    #[test]
    fn stats_are_reported_as_json() {
        use netbuf::Buf;
        let director = Director::new()
            .add_backend(Backend::new("b1", addr(8001), 2))
            .done();
        director.backends()[0].set_health(Health::Offline);
        let mut out = Buf::new();
        director.stats_json(&mut out);
        assert_eq!(String::from_utf8_lossy(&out[..]),
            "[{\"name\": \"b1\", \"capacity\": 2, \"active\": 0, \
              \"hits\": 0, \"health\": \"offline\"}]");
    }

    #[test]
    fn deadline_elapsed() {
        let director = Director::new()
            .add_backend(Backend::new("b1", addr(8001), 1))
            .retry_timeout(Duration::from_secs(0))
            .done();
        let mut ledger = Ledger::new();
        match director.reschedule(&mut ledger, None) {
            Schedule::GiveUp(status) => {
                assert_eq!(status, Status::GatewayTimeout);
            }
            Schedule::Backend(..) => panic!("expected give-up"),
        }
    }
}
