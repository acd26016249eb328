//! fleetio error types.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Creating the queue (epoll instance, eventfd or ring) failed.
    #[error("queue setup failed: {0}")]
    Setup(#[source] io::Error),
    /// Associating a socket with the queue failed.
    #[error("associate failed: {0}")]
    Associate(#[source] io::Error),
    /// Posting an operation failed synchronously.
    #[error("post {kind} failed: {source}")]
    Post {
        kind: &'static str,
        source: io::Error,
    },
    /// Submission queue has no free entries.
    #[error("submission queue full")]
    RingFull,
    /// The target connection is already closed.
    #[error("connection closed")]
    Closed,
    /// No listening socket has been associated.
    #[error("no listener associated")]
    NoListener,
    /// `shutdown()` already ran.
    #[error("queue shut down")]
    ShutDown,
}

impl QueueError {
    pub fn post(kind: crate::OpKind, source: io::Error) -> Self {
        Self::Post { kind: kind.as_str(), source }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
