//! # fleetio-engine — multi-threaded TCP engine
//!
//! Accepts many simultaneous clients, multiplexes all of their I/O through
//! one completion queue, and hands received bytes to an upper layer that
//! can push bytes back to one or all connections.
//!
//! ```text
//!   ┌──────────────┐  accept ×N   ┌─────────────────┐   wait()   ┌──────────┐
//!   │ListenEndpoint├─────────────►│ CompletionQueue │◄───────────┤ worker 0 │
//!   └──────────────┘              │ (poll / uring)  │◄───────────┤ worker 1 │
//!          recv / send ──────────►│                 │◄───────────┤   ...    │
//!                                 └─────────────────┘            └────┬─────┘
//!   ┌────────────────────┐                                            │
//!   │ ConnectionRegistry │◄─── insert / retire / snapshot ────────────┘
//!   └────────────────────┘         on_receive / on_disconnect ──► upper layer
//! ```
//!
//! ```ignore
//! use fleetio_engine::{Callbacks, Engine, EngineConfig};
//!
//! let mut engine = Engine::new(EngineConfig::from_env());
//! engine.start(6000, Callbacks::new()
//!     .on_receive(|h, msg| { h.send_to(msg.conn, msg.data); })
//!     .on_disconnect(|_, conn, peer| tracing::info!(%conn, %peer, "gone")))?;
//! // ...
//! engine.stop();
//! ```

pub mod callbacks;
pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod registry;
pub mod stats;
mod worker;

pub use callbacks::{Callbacks, Inbound};
pub use config::{ConfigError, EngineConfig, QueueBackend};
pub use engine::{Engine, EngineHandle};
pub use error::EngineError;
pub use stats::StatsSnapshot;

pub use fleetio_core::ConnId;
