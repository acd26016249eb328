//! Worker thread main loop and completion dispatch.
//!
//! ```text
//!   wait ─┬─ Exit ──────────────────────────────► leave
//!         ├─ Accept ok ─► establish ─► re-post accept
//!         ├─ Recv n>0 ──► on_receive ─► re-post recv
//!         ├─ Send n>0 ──► continue partial / recycle slot
//!         ├─ Recv/Send 0 ───────────► disconnect
//!         ├─ Recv/Send err ─ reset ─► disconnect
//!         │                └ other ─► retire, leave
//!         ├─ TimedOut ──► liveness sweep
//!         └─ Os error ────────────────────────────► leave
//! ```

use crate::callbacks::Inbound;
use crate::engine::Shared;
use crate::stats::bump;

use fleetio_core::{Completion, ConnectionContext, Event, IoOp, OpKind, WaitError};
use socket2::{SockRef, TcpKeepalive};

use std::io;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Whether the worker keeps running after a dispatch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Decrements the live-worker gauge however the thread ends.
struct AliveGuard<'a>(&'a Shared);

impl Drop for AliveGuard<'_> {
    fn drop(&mut self) {
        self.0.stats.workers_alive.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) fn run(shared: Arc<Shared>, index: usize) {
    let _alive = AliveGuard(&shared);
    tracing::debug!(worker = index, "worker started");

    let reason = loop {
        if shared.is_shutting_down() {
            break "shutdown";
        }
        match shared.queue.wait(shared.config.liveness_interval) {
            Ok(Event::Exit) => break "exit sentinel",
            Ok(Event::Completion(c)) => {
                // Nothing is processed once shutdown is asserted.
                if shared.is_shutting_down() {
                    break "shutdown";
                }
                if dispatch(&shared, c) == Flow::Exit {
                    break "fatal completion error";
                }
            }
            Err(WaitError::TimedOut) => sweep(&shared),
            Err(WaitError::Os(e)) => {
                tracing::error!(worker = index, error = %e, "completion wait failed");
                break "wait failed";
            }
        }
    };

    if shared.is_shutting_down() {
        tracing::debug!(worker = index, reason, "worker exiting");
    } else {
        // Not respawned: the pool stays one thread smaller.
        tracing::warn!(worker = index, reason, "worker exiting while engine runs");
    }
}

fn dispatch(shared: &Arc<Shared>, c: Completion) -> Flow {
    let Completion { op, result } = c;
    let kind = op.kind();
    if kind == OpKind::Accept {
        on_accept(shared, op, result);
        return Flow::Continue;
    }

    let Some(conn) = op.conn.clone() else {
        return Flow::Continue;
    };
    match result {
        Ok(0) => {
            disconnect(shared, &conn, "peer closed");
            Flow::Continue
        }
        Ok(n) if kind == OpKind::Receive => {
            on_receive(shared, op, &conn, n);
            Flow::Continue
        }
        Ok(n) => {
            on_send(shared, op, &conn, n);
            Flow::Continue
        }
        Err(e) => on_error(shared, &conn, kind, e),
    }
}

// ── Accept ──

fn on_accept(shared: &Arc<Shared>, mut op: IoOp, result: io::Result<usize>) {
    shared.stats.pending_accepts.fetch_sub(1, Ordering::AcqRel);

    match result {
        Ok(_) => {
            let peer = op.slot.peer_addr();
            match op.slot.take_pending_socket() {
                Some(stream) => {
                    bump(&shared.stats.accepts, 1);
                    establish(shared, stream, peer);
                }
                None => tracing::warn!("accept completed without a socket"),
            }
        }
        Err(e) => {
            bump(&shared.stats.errors, 1);
            tracing::warn!(error = %e, "accept failed");
        }
    }

    // Keep the pipeline full whatever happened above.
    if shared.is_shutting_down() {
        return;
    }
    if let Err(e) = shared.listener.repost(&*shared.queue, op.slot, &shared.stats) {
        bump(&shared.stats.errors, 1);
        tracing::error!(error = %e, "failed to re-post accept");
    }
}

/// Turn an accepted socket into a registered connection with a receive
/// outstanding. Any failure releases just this connection.
fn establish(shared: &Arc<Shared>, stream: TcpStream, peer: Option<std::net::SocketAddr>) {
    let peer = match peer.map(Ok).unwrap_or_else(|| stream.peer_addr()) {
        Ok(addr) => addr,
        Err(e) => {
            tracing::debug!(error = %e, "accepted socket has no peer address");
            return;
        }
    };
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "accepted socket has no local address");
            return;
        }
    };
    apply_socket_options(shared, &stream);

    let ctx = Arc::new(ConnectionContext::new(shared.next_conn_id(), stream, peer, local));

    if let Err(e) = shared.queue.associate(&ctx) {
        tracing::warn!(conn = %ctx.id(), %peer, error = %e, "associate failed, dropping connection");
        ctx.close();
        return;
    }

    // Posted under the registry lock: a callback for this receive must be
    // able to reply with send_to.
    let slot = ctx.acquire_slot(OpKind::Receive, shared.config.buffer_size);
    let established = shared
        .registry
        .establish(&ctx, |c| shared.queue.post_recv(IoOp::recv(slot, c.clone())));
    match established {
        Ok(true) => {
            tracing::debug!(conn = %ctx.id(), %peer, local = %ctx.local(), "connection accepted");
        }
        Ok(false) => {
            tracing::debug!(conn = %ctx.id(), %peer, "connection gone before registration");
        }
        Err(e) => {
            tracing::warn!(conn = %ctx.id(), %peer, error = %e, "first receive not posted, dropping connection");
            shared.queue.dissociate(&ctx);
            ctx.close();
        }
    }
}

fn apply_socket_options(shared: &Shared, stream: &TcpStream) {
    if shared.config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "TCP_NODELAY not set");
        }
    }
    if let Some(idle) = shared.config.keepalive {
        let ka = TcpKeepalive::new().with_time(idle).with_interval(idle);
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&ka) {
            tracing::debug!(error = %e, "keepalive not set");
        }
    }
}

// ── Receive / Send ──

fn on_receive(shared: &Arc<Shared>, op: IoOp, conn: &Arc<ConnectionContext>, n: usize) {
    bump(&shared.stats.receives, 1);
    bump(&shared.stats.bytes_in, n as u64);
    tracing::trace!(conn = %conn.id(), bytes = n, "recv");

    shared.callbacks.received(
        &shared.handle(),
        Inbound {
            conn: conn.id(),
            peer: conn.peer(),
            data: op.slot.received(n),
        },
    );

    let mut slot = op.slot;
    slot.reset();
    if let Err(e) = shared.queue.post_recv(IoOp::recv(slot, conn.clone())) {
        if conn.is_open() {
            tracing::debug!(conn = %conn.id(), error = %e, "receive re-post failed");
            disconnect(shared, conn, "receive re-post failed");
        }
    }
}

fn on_send(shared: &Arc<Shared>, mut op: IoOp, conn: &Arc<ConnectionContext>, n: usize) {
    bump(&shared.stats.bytes_out, n as u64);
    tracing::trace!(conn = %conn.id(), bytes = n, "send");

    if op.slot.advance(n) {
        bump(&shared.stats.sends, 1);
        conn.recycle(op.slot);
        return;
    }

    // Partial write: post the remainder with the same slot.
    if let Err(e) = shared.queue.post_send(op) {
        if conn.is_open() {
            tracing::debug!(conn = %conn.id(), error = %e, "send continuation failed");
            disconnect(shared, conn, "send continuation failed");
        }
    }
}

// ── Errors ──

/// Errors that mean the peer is gone rather than the engine is broken.
pub(crate) fn is_reset_class(e: &io::Error) -> bool {
    if let Some(code) = e.raw_os_error() {
        return matches!(
            code,
            libc::ECONNRESET
                | libc::ECONNABORTED
                | libc::EPIPE
                | libc::ENOTCONN
                | libc::ETIMEDOUT
                | libc::ESHUTDOWN
                | libc::EHOSTUNREACH
                | libc::ENETUNREACH
                | libc::ENETRESET
        );
    }
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
    )
}

fn on_error(shared: &Arc<Shared>, conn: &Arc<ConnectionContext>, kind: OpKind, e: io::Error) -> Flow {
    if !conn.is_open() {
        // Completion for a connection already torn down (cancelled recv,
        // send after close). Nothing left to do.
        tracing::trace!(conn = %conn.id(), op = kind.as_str(), error = %e, "stale completion");
        return Flow::Continue;
    }

    bump(&shared.stats.errors, 1);
    if is_reset_class(&e) {
        disconnect(shared, conn, "connection reset");
        return Flow::Continue;
    }

    tracing::error!(conn = %conn.id(), op = kind.as_str(), error = %e, "unexpected I/O error");
    disconnect(shared, conn, "unexpected I/O error");
    Flow::Exit
}

/// Retire `conn` and tell the upper layer, once.
fn disconnect(shared: &Arc<Shared>, conn: &ConnectionContext, reason: &'static str) {
    if !shared.registry.retire(conn, &*shared.queue) {
        return;
    }
    bump(&shared.stats.disconnects, 1);
    tracing::debug!(conn = %conn.id(), peer = %conn.peer(), reason, "connection closed");
    shared.callbacks.disconnected(&shared.handle(), conn.id(), conn.peer());
}

// ── Liveness ──

/// Probe every registered connection with a zero-length send. Only one
/// worker sweeps at a time; others go straight back to waiting.
fn sweep(shared: &Arc<Shared>) {
    if shared.probing.swap(true, Ordering::AcqRel) {
        return;
    }
    let conns = shared.registry.snapshot();
    let mut dead = 0usize;
    for ctx in &conns {
        if shared.is_shutting_down() {
            break;
        }
        if let Err(e) = ctx.probe() {
            if ctx.is_open() {
                dead += 1;
                tracing::debug!(conn = %ctx.id(), error = %e, "liveness probe failed");
                disconnect(shared, ctx, "liveness probe failed");
            }
        }
    }
    shared.probing.store(false, Ordering::Release);
    tracing::trace!(checked = conns.len(), dead, "liveness sweep");
}
