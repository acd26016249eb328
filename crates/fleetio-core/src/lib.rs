//! # fleetio-core — Trait definitions for fleetio
//!
//! This crate defines the boundary between the TCP engine and the
//! completion mechanism that drives it. The engine only ever talks to a
//! `CompletionQueue`; whether completions come from the kernel (io_uring)
//! or from a readiness multiplexer that performs the I/O itself (epoll)
//! is an implementation detail of `fleetio-module`.
//!
//! ## Ownership model
//!
//! ```text
//!   registry ──owns──► ConnectionContext ──owns──► idle IoSlots
//!                              ▲
//!                              │ Arc
//!   CompletionQueue ──owns──► IoOp { slot, conn }   (while in flight)
//! ```
//!
//! Posting an operation moves its `IoOp` into the queue; the matching
//! `Completion` hands it back to whichever worker dequeues it. No slot
//! outlives the context it was created for.

pub mod entry;
pub mod context;
pub mod queue;
pub mod env;
pub mod error;

pub use context::ConnectionContext;
pub use entry::{Completion, ConnId, Event, IoOp, IoSlot, OpKind};
pub use error::{QueueError, Result};
pub use queue::{CompletionQueue, WaitError};
