//! Operation slots, in-flight operations and completion entries.
//!
//! These are the *lingua franca* between the engine and every
//! `CompletionQueue` implementation.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use crate::context::ConnectionContext;

/// Stable connection identity handed to the upper layer.
///
/// Assigned from a monotonic counter when an accept completes, so an id
/// is never reused for a different peer even when the kernel recycles the
/// socket descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ConnId(pub u64);

impl ConnId {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// The three kinds of asynchronous operation the engine posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    Accept = 1,
    Receive = 2,
    Send = 3,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Accept => "accept",
            OpKind::Receive => "recv",
            OpKind::Send => "send",
        }
    }
}

/// A reusable descriptor plus buffer for one in-flight operation.
///
/// Always heap allocated (`Box<IoSlot>`) so the buffer and address
/// storage keep a stable address while the kernel owns them.
pub struct IoSlot {
    kind: OpKind,
    buf: Box<[u8]>,
    /// Valid bytes in `buf` (send slots).
    filled: usize,
    /// Bytes of `buf[..filled]` already written (send slots).
    cursor: usize,
    /// Peer address written by accept.
    addr: libc::sockaddr_storage,
    addr_len: libc::socklen_t,
    /// Socket adopted by a completed accept.
    pending_socket: Option<TcpStream>,
}

impl IoSlot {
    pub fn new(kind: OpKind, capacity: usize) -> Box<Self> {
        Box::new(Self {
            kind,
            buf: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
            cursor: 0,
            // Safety: sockaddr_storage is plain old data; all-zero is valid.
            addr: unsafe { std::mem::zeroed() },
            addr_len: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            pending_socket: None,
        })
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Prepare the slot for the next operation of the same kind.
    pub fn reset(&mut self) {
        self.filled = 0;
        self.cursor = 0;
        self.addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        self.pending_socket = None;
    }

    // ── Receive ──

    /// Whole buffer, for the kernel (or the emulated queue) to fill.
    #[inline]
    pub fn recv_buf(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// The first `n` bytes of a completed receive.
    #[inline]
    pub fn received(&self, n: usize) -> &[u8] {
        &self.buf[..n.min(self.buf.len())]
    }

    // ── Send ──

    /// Copy `data` in as the payload of a send. Grows the buffer if needed.
    pub fn fill(&mut self, data: &[u8]) {
        if data.len() > self.buf.len() {
            self.buf = vec![0u8; data.len()].into_boxed_slice();
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.filled = data.len();
        self.cursor = 0;
    }

    /// Bytes still waiting to be written.
    #[inline]
    pub fn unsent(&self) -> &[u8] {
        &self.buf[self.cursor..self.filled]
    }

    /// Record `n` more bytes as written. Returns true once nothing is left.
    pub fn advance(&mut self, n: usize) -> bool {
        self.cursor = (self.cursor + n).min(self.filled);
        self.cursor == self.filled
    }

    #[inline]
    pub fn filled(&self) -> usize {
        self.filled
    }

    // ── Accept ──

    /// Raw address storage for `accept4` / io_uring `Accept`.
    pub fn addr_parts(&mut self) -> (*mut libc::sockaddr, *mut libc::socklen_t) {
        (
            &mut self.addr as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut self.addr_len as *mut libc::socklen_t,
        )
    }

    /// Peer address captured by the accept that filled this slot.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        // Safety: addr/addr_len were written together by the kernel,
        // or are still the zeroed defaults (family AF_UNSPEC → None).
        let addr = unsafe { socket2::SockAddr::new(self.addr, self.addr_len) };
        addr.as_socket()
    }

    pub fn set_pending_socket(&mut self, socket: TcpStream) {
        self.pending_socket = Some(socket);
    }

    pub fn take_pending_socket(&mut self) -> Option<TcpStream> {
        self.pending_socket.take()
    }
}

impl fmt::Debug for IoSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoSlot")
            .field("kind", &self.kind)
            .field("capacity", &self.buf.len())
            .field("filled", &self.filled)
            .field("cursor", &self.cursor)
            .finish()
    }
}

/// One posted operation: the slot plus the connection it belongs to.
///
/// Accept operations belong to the listen endpoint and carry no context.
#[derive(Debug)]
pub struct IoOp {
    pub slot: Box<IoSlot>,
    pub conn: Option<Arc<ConnectionContext>>,
}

impl IoOp {
    pub fn accept(slot: Box<IoSlot>) -> Self {
        debug_assert_eq!(slot.kind(), OpKind::Accept);
        Self { slot, conn: None }
    }

    pub fn recv(slot: Box<IoSlot>, conn: Arc<ConnectionContext>) -> Self {
        debug_assert_eq!(slot.kind(), OpKind::Receive);
        Self { slot, conn: Some(conn) }
    }

    pub fn send(slot: Box<IoSlot>, conn: Arc<ConnectionContext>) -> Self {
        debug_assert_eq!(slot.kind(), OpKind::Send);
        Self { slot, conn: Some(conn) }
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.slot.kind()
    }
}

/// A finished operation handed back by the queue.
///
/// `result` is `Ok(bytes)` for receive/send, `Ok(0)` for an accept (the
/// adopted socket sits in the slot), or the OS error.
#[derive(Debug)]
pub struct Completion {
    pub op: IoOp,
    pub result: io::Result<usize>,
}

/// What a worker gets back from `CompletionQueue::wait`.
#[derive(Debug)]
pub enum Event {
    Completion(Completion),
    /// Exit sentinel posted by `stop()`.
    Exit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_slot_tracks_partial_writes() {
        let mut slot = IoSlot::new(OpKind::Send, 4);
        slot.fill(b"PONG!!");
        assert_eq!(slot.capacity(), 6);
        assert_eq!(slot.unsent(), b"PONG!!");
        assert!(!slot.advance(4));
        assert_eq!(slot.unsent(), b"!!");
        assert!(slot.advance(2));
        assert!(slot.unsent().is_empty());
    }

    #[test]
    fn reset_clears_lengths_and_socket() {
        let mut slot = IoSlot::new(OpKind::Send, 16);
        slot.fill(b"abc");
        slot.reset();
        assert_eq!(slot.filled(), 0);
        assert!(slot.unsent().is_empty());
        assert!(slot.take_pending_socket().is_none());
    }

    #[test]
    fn zeroed_accept_slot_has_no_peer() {
        let slot = IoSlot::new(OpKind::Accept, 0);
        assert!(slot.peer_addr().is_none());
    }

    #[test]
    fn received_is_clamped_to_capacity() {
        let mut slot = IoSlot::new(OpKind::Receive, 8);
        slot.recv_buf()[..4].copy_from_slice(b"PING");
        assert_eq!(slot.received(4), b"PING");
        assert_eq!(slot.received(100).len(), 8);
    }

    #[test]
    fn conn_id_display() {
        assert_eq!(ConnId(7).to_string(), "conn#7");
    }
}
