//! Engine setup errors.
//!
//! Only `start()` returns these. Steady-state failures are handled per
//! connection and surface through `on_disconnect` and the logs.

use crate::config::ConfigError;
use fleetio_core::QueueError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("completion queue: {0}")]
    Queue(#[from] QueueError),

    #[error("no accept could be posted on the listener")]
    AcceptPipeline,

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    /// An engine runs once; build a new one to start again.
    #[error("engine already started")]
    AlreadyStarted,
}
