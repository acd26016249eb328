//! Per-connection state.
//!
//! A `ConnectionContext` owns the accepted socket and the pool of idle
//! I/O slots for that connection. In-flight ops hold an `Arc` to it, so
//! the context (and the memory their slots point at) lives until the last
//! completion has been consumed.
//!
//! The socket sits behind a `RwLock`. Anything that issues I/O against
//! the raw descriptor does so under the read lock; releasing the socket
//! takes the write lock. A descriptor is therefore never reused by the
//! kernel for another connection while a worker is still using this one's
//! number.
//!
//! Closing is two steps. `begin_close` is an atomic claim: it flips the
//! context to closed for everyone and tells exactly one caller it won.
//! `release` then waits out any I/O still holding the read lock and drops
//! the socket. Callers holding a shared lock claim under it and release
//! after dropping it.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use nix::errno::Errno;
use parking_lot::{Mutex, RwLock};

use crate::entry::{ConnId, IoSlot, OpKind};

/// Idle slots kept per connection; extras are freed on recycle.
const MAX_IDLE_SLOTS: usize = 8;

pub struct ConnectionContext {
    id: ConnId,
    fd: RawFd,
    peer: SocketAddr,
    local: SocketAddr,
    socket: RwLock<Option<TcpStream>>,
    closing: AtomicBool,
    idle: Mutex<Vec<Box<IoSlot>>>,
    slots_created: AtomicUsize,
}

impl ConnectionContext {
    pub fn new(id: ConnId, socket: TcpStream, peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            id,
            fd: socket.as_raw_fd(),
            peer,
            local,
            socket: RwLock::new(Some(socket)),
            closing: AtomicBool::new(false),
            idle: Mutex::new(Vec::new()),
            slots_created: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// `false` from the moment a close is claimed, even while the socket
    /// is still waiting to be released.
    pub fn is_open(&self) -> bool {
        !self.closing.load(Ordering::Acquire)
    }

    /// Run `f` against the socket while holding the read lock.
    /// `None` once the context is closed.
    pub fn with_socket<R>(&self, f: impl FnOnce(&TcpStream) -> R) -> Option<R> {
        // Checked before locking so new I/O never queues behind a release.
        if !self.is_open() {
            return None;
        }
        let guard = self.socket.read();
        if !self.is_open() {
            return None;
        }
        guard.as_ref().map(f)
    }

    /// Take an idle slot of `kind`, or allocate a fresh one.
    pub fn acquire_slot(&self, kind: OpKind, capacity: usize) -> Box<IoSlot> {
        let mut idle = self.idle.lock();
        if let Some(pos) = idle.iter().rposition(|s| s.kind() == kind) {
            let mut slot = idle.swap_remove(pos);
            slot.reset();
            return slot;
        }
        drop(idle);
        self.slots_created.fetch_add(1, Ordering::Relaxed);
        IoSlot::new(kind, capacity)
    }

    /// Return a finished slot for reuse. Dropped if the context is closed.
    pub fn recycle(&self, mut slot: Box<IoSlot>) {
        if !self.is_open() {
            return;
        }
        slot.reset();
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_SLOTS {
            idle.push(slot);
        }
    }

    #[cfg(test)]
    fn slots_created(&self) -> usize {
        self.slots_created.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn idle_slots(&self) -> usize {
        self.idle.lock().len()
    }

    /// Zero-length send. Succeeds on a live socket; reports the error a
    /// dead peer left behind (reset, pipe) otherwise.
    pub fn probe(&self) -> io::Result<()> {
        self.with_socket(|s| {
            // Safety: null buffer with length 0 is valid for send(2).
            let rc = unsafe { libc::send(s.as_raw_fd(), std::ptr::null(), 0, libc::MSG_NOSIGNAL) };
            Errno::result(rc)
                .map(drop)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))
        })
        .unwrap_or_else(|| Err(io::ErrorKind::NotConnected.into()))
    }

    /// Mark the context closed. Returns `true` only for the first caller.
    /// Does not block and does not touch the socket.
    pub fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    /// Shut the socket down and release it along with the idle slots.
    ///
    /// Waits for I/O still running under the read lock. Pending operations
    /// on the socket complete with an error or zero bytes. Idempotent.
    pub fn release(&self) {
        self.closing.store(true, Ordering::Release);
        let socket = self.socket.write().take();
        let Some(socket) = socket else {
            return;
        };
        let _ = socket.shutdown(Shutdown::Both);
        drop(socket);
        self.idle.lock().clear();
        tracing::trace!(
            conn = %self.id,
            peer = %self.peer,
            slots = self.slots_created.load(Ordering::Relaxed),
            "context closed"
        );
    }

    /// `begin_close` then `release`. Returns `true` only for the call that
    /// claimed the close.
    pub fn close(&self) -> bool {
        let claimed = self.begin_close();
        self.release();
        claimed
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}
