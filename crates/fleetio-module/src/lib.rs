//! # fleetio-module — Default `CompletionQueue` implementations
//!
//! | Backend | Impl         | Mechanism                                   |
//! |---------|--------------|---------------------------------------------|
//! | Poll    | `PollQueue`  | epoll readiness + worker-side accept/recv   |
//! | Uring   | `UringQueue` | io_uring completions (feature `io-uring`)   |
//!
//! `PollQueue` is the default: it runs on any Linux kernel and inside
//! sandboxes that block io_uring. `open_queue` picks one at runtime.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use fleetio_core::error::Result;
use fleetio_core::queue::CompletionQueue;

pub mod eventfd_notifier;
pub mod poll_queue;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", feature = "io-uring"))] {
        pub mod uring_queue;
    }
}

/// Which completion mechanism drives the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Poll,
    Uring,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Poll => write!(f, "poll"),
            Backend::Uring => write!(f, "uring"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" | "epoll" => Ok(Backend::Poll),
            "uring" | "io_uring" | "io-uring" => Ok(Backend::Uring),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Backend-independent queue parameters.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Poll backend: bound on a single synchronous send.
    pub send_timeout: Duration,
    /// Uring backend: SQ size.
    pub uring_entries: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(1),
            uring_entries: 256,
        }
    }
}

/// Build the queue for `backend`.
pub fn open_queue(backend: Backend, opts: &QueueOptions) -> Result<Box<dyn CompletionQueue>> {
    match backend {
        Backend::Poll => {
            let q = poll_queue::PollQueue::new(poll_queue::PollQueueConfig {
                send_timeout: opts.send_timeout,
            })?;
            Ok(Box::new(q))
        }
        Backend::Uring => open_uring(opts),
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", feature = "io-uring"))] {
        fn open_uring(opts: &QueueOptions) -> Result<Box<dyn CompletionQueue>> {
            let q = uring_queue::UringQueue::new(uring_queue::UringQueueConfig {
                sq_entries: opts.uring_entries,
            })?;
            Ok(Box::new(q))
        }
    } else {
        fn open_uring(_opts: &QueueOptions) -> Result<Box<dyn CompletionQueue>> {
            Err(fleetio_core::QueueError::Setup(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "built without the io-uring feature",
            )))
        }
    }
}
