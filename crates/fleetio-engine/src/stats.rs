//! Engine counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct EngineStats {
    pub(crate) accepts: AtomicU64,
    pub(crate) receives: AtomicU64,
    pub(crate) sends: AtomicU64,
    pub(crate) disconnects: AtomicU64,
    pub(crate) bytes_in: AtomicU64,
    pub(crate) bytes_out: AtomicU64,
    pub(crate) errors: AtomicU64,
    pub(crate) pending_accepts: AtomicUsize,
    pub(crate) workers_alive: AtomicUsize,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl EngineStats {
    pub fn snapshot(&self, connections: usize) -> StatsSnapshot {
        StatsSnapshot {
            connections,
            accepts: self.accepts.load(Ordering::Relaxed),
            receives: self.receives.load(Ordering::Relaxed),
            sends: self.sends.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            pending_accepts: self.pending_accepts.load(Ordering::Relaxed),
            workers_alive: self.workers_alive.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `EngineStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections: usize,
    pub accepts: u64,
    pub receives: u64,
    pub sends: u64,
    pub disconnects: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors: u64,
    pub pending_accepts: usize,
    pub workers_alive: usize,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conns={} accepts={} recv={} send={} disc={} bytes_in={} bytes_out={} err={} pending_accepts={} workers={}",
            self.connections,
            self.accepts, self.receives, self.sends, self.disconnects,
            self.bytes_in, self.bytes_out, self.errors,
            self.pending_accepts, self.workers_alive,
        )
    }
}
