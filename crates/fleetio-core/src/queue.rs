//! The completion queue abstraction.
//!
//! A `CompletionQueue` accepts posted operations and hands each one back,
//! exactly once, as a `Completion` to whichever worker calls `wait()`.
//!
//! # Implementors
//!
//! - `PollQueue` (default): epoll readiness plus an eventfd for synthetic
//!   completions. The worker that dequeues a readiness event performs the
//!   accept/recv itself, so callers still observe completion semantics.
//!
//! - `UringQueue` (feature `io-uring`): real kernel completions via
//!   io_uring. Operations complete without a readiness step.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use thiserror::Error;

use crate::context::ConnectionContext;
use crate::entry::{Event, IoOp};
use crate::error::Result;

/// Why `wait()` returned without an event.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The timeout elapsed with nothing to deliver.
    #[error("wait timed out")]
    TimedOut,
    /// The wait itself failed. Workers treat this as fatal.
    #[error("wait failed: {0}")]
    Os(#[from] io::Error),
}

/// Multi-producer, multi-consumer completion queue.
///
/// **Contract:**
/// - Each posted `IoOp` comes back exactly once, either as a `Completion`
///   from `wait()` or dropped by `shutdown()`.
/// - A failed `post_*` drops the op; the caller treats it as a failed
///   operation on that connection.
/// - `post_exit()` makes exactly one `wait()` return `Event::Exit`.
/// - Safe to call from any thread.
pub trait CompletionQueue: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Bind the listening socket. Must precede `post_accept`.
    fn associate_listener(&self, fd: RawFd) -> Result<()>;

    /// Bind an accepted connection's socket.
    fn associate(&self, ctx: &ConnectionContext) -> Result<()>;

    /// Forget a connection. Ops already in flight for it still complete.
    fn dissociate(&self, ctx: &ConnectionContext);

    /// Pre-post one accept on the listener.
    fn post_accept(&self, op: IoOp) -> Result<()>;

    /// Post a receive into `op.slot`.
    fn post_recv(&self, op: IoOp) -> Result<()>;

    /// Post a send of `op.slot.unsent()`.
    fn post_send(&self, op: IoOp) -> Result<()>;

    /// Post one exit sentinel.
    fn post_exit(&self) -> Result<()>;

    /// Block until an event is available or `timeout` elapses.
    /// `None` waits forever.
    fn wait(&self, timeout: Option<Duration>) -> std::result::Result<Event, WaitError>;

    /// Release kernel resources and drop every op still in flight.
    /// Called once all workers have exited.
    fn shutdown(&self);
}
