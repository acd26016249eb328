//! Engine configuration

use fleetio_core::env::{env_get, env_get_bool, env_get_millis, env_get_opt};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

pub use fleetio_module::Backend as QueueBackend;

/// Worker threads started per available processor.
pub const WORKER_THREADS_PER_PROCESSOR: usize = 2;

/// Accepts kept posted on the listener at all times.
pub const DEFAULT_ACCEPT_DEPTH: usize = 10;

/// Bytes per receive slot.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Hard ceiling on the worker pool.
pub const MAX_WORKERS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid engine config: {0}")]
pub struct ConfigError(pub &'static str);

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address the listener binds to (default: 0.0.0.0)
    pub bind_ip: IpAddr,

    /// listen(2) backlog
    pub backlog: i32,

    /// Number of worker threads (default: 2 × CPU count)
    pub workers: usize,

    /// Pre-posted accepts kept outstanding
    pub accept_depth: usize,

    /// Receive buffer per connection
    pub buffer_size: usize,

    /// Queue wait timeout that drives the liveness sweep.
    /// `None` waits forever and disables the sweep.
    pub liveness_interval: Option<Duration>,

    /// TCP keepalive idle time on accepted sockets (`None` = off)
    pub keepalive: Option<Duration>,

    /// Set TCP_NODELAY on accepted sockets
    pub nodelay: bool,

    /// Completion mechanism
    pub backend: QueueBackend,

    /// How long the poll backend waits for a socket to drain on send
    pub send_timeout: Duration,

    /// io_uring submission queue size (power of two)
    pub uring_entries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            backlog: 1024,
            workers: (num_cpus * WORKER_THREADS_PER_PROCESSOR).min(MAX_WORKERS),
            accept_depth: DEFAULT_ACCEPT_DEPTH,
            buffer_size: DEFAULT_BUFFER_SIZE,
            liveness_interval: Some(Duration::from_secs(5)),
            keepalive: Some(Duration::from_secs(60)),
            nodelay: true,
            backend: QueueBackend::Poll,
            send_timeout: Duration::from_secs(1),
            uring_entries: 256,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `FLEETIO_*` environment variables.
    ///
    /// | Variable                  | Field               |
    /// |---------------------------|---------------------|
    /// | `FLEETIO_BIND_IP`         | `bind_ip`           |
    /// | `FLEETIO_BACKLOG`         | `backlog`           |
    /// | `FLEETIO_WORKERS`         | `workers`           |
    /// | `FLEETIO_ACCEPT_DEPTH`    | `accept_depth`      |
    /// | `FLEETIO_BUFFER_SIZE`     | `buffer_size`       |
    /// | `FLEETIO_LIVENESS_MS`     | `liveness_interval` (0 = off) |
    /// | `FLEETIO_KEEPALIVE_MS`    | `keepalive` (0 = off) |
    /// | `FLEETIO_NODELAY`         | `nodelay`           |
    /// | `FLEETIO_BACKEND`         | `backend` (`poll`/`uring`) |
    /// | `FLEETIO_SEND_TIMEOUT_MS` | `send_timeout`      |
    /// | `FLEETIO_URING_ENTRIES`   | `uring_entries`     |
    pub fn from_env() -> Self {
        Self::default().overlay_env()
    }

    /// Apply `FLEETIO_*` overrides on top of `self`.
    pub fn overlay_env(self) -> Self {
        let send_timeout = env_get_opt::<u64>("FLEETIO_SEND_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(self.send_timeout);

        Self {
            bind_ip: env_get("FLEETIO_BIND_IP", self.bind_ip),
            backlog: env_get("FLEETIO_BACKLOG", self.backlog),
            workers: env_get("FLEETIO_WORKERS", self.workers),
            accept_depth: env_get("FLEETIO_ACCEPT_DEPTH", self.accept_depth),
            buffer_size: env_get("FLEETIO_BUFFER_SIZE", self.buffer_size),
            liveness_interval: env_get_millis("FLEETIO_LIVENESS_MS", self.liveness_interval),
            keepalive: env_get_millis("FLEETIO_KEEPALIVE_MS", self.keepalive),
            nodelay: env_get_bool("FLEETIO_NODELAY", self.nodelay),
            backend: env_get("FLEETIO_BACKEND", self.backend),
            send_timeout,
            uring_entries: env_get("FLEETIO_URING_ENTRIES", self.uring_entries),
        }
    }

    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn accept_depth(mut self, n: usize) -> Self {
        self.accept_depth = n;
        self
    }

    pub fn buffer_size(mut self, n: usize) -> Self {
        self.buffer_size = n;
        self
    }

    pub fn liveness_interval(mut self, d: Option<Duration>) -> Self {
        self.liveness_interval = d;
        self
    }

    pub fn keepalive(mut self, d: Option<Duration>) -> Self {
        self.keepalive = d;
        self
    }

    pub fn nodelay(mut self, enable: bool) -> Self {
        self.nodelay = enable;
        self
    }

    pub fn backend(mut self, backend: QueueBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn send_timeout(mut self, d: Duration) -> Self {
        self.send_timeout = d;
        self
    }

    pub fn uring_entries(mut self, n: u32) -> Self {
        self.uring_entries = n;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError("workers must be at least 1"));
        }
        if self.workers > MAX_WORKERS {
            return Err(ConfigError("workers exceeds maximum"));
        }
        if self.accept_depth == 0 {
            return Err(ConfigError("accept_depth must be at least 1"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError("buffer_size must be at least 1"));
        }
        if self.buffer_size > u32::MAX as usize {
            return Err(ConfigError("buffer_size must fit in 32 bits"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError("backlog must be positive"));
        }
        if self.liveness_interval.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError("liveness_interval must be non-zero (use None to disable)"));
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError("send_timeout must be non-zero"));
        }
        if self.backend == QueueBackend::Uring && !self.uring_entries.is_power_of_two() {
            return Err(ConfigError("uring_entries must be a power of two"));
        }
        Ok(())
    }
}
