//! `UringQueue` — io_uring-backed `CompletionQueue`.
//!
//! Real completion semantics: accept, recv and send are submitted as
//! SQEs and the kernel reports them through the CQ. Every worker blocks
//! in `io_uring_enter(GETEVENTS)` and pops one CQE at a time.
//!
//! In-flight ops are parked in a slab keyed by `user_data`, which keeps
//! each `Box<IoSlot>` (and the buffer the kernel writes into) alive until
//! its CQE has been reaped.
//!
//! Requires Linux 5.5+ (`IORING_OP_ACCEPT`). Wait timeouts need
//! `IORING_FEAT_EXT_ARG` (5.11+); without it `wait()` never times out.

use fleetio_core::context::ConnectionContext;
use fleetio_core::entry::{Completion, Event, IoOp, OpKind};
use fleetio_core::error::{QueueError, Result};
use fleetio_core::queue::{CompletionQueue, WaitError};

use io_uring::{opcode, squeue, types, IoUring};
use parking_lot::Mutex;
use slab::Slab;

use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

/// user_data of the exit sentinel (a NOP).
const EXIT_TOKEN: u64 = u64::MAX;
/// user_data of cancel requests issued by `shutdown()`.
const CANCEL_TOKEN: u64 = u64::MAX - 1;

/// How long `shutdown()` waits for cancelled ops to come back.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for UringQueue.
#[derive(Debug, Clone)]
pub struct UringQueueConfig {
    /// Number of SQ entries. Must be power of 2.
    pub sq_entries: u32,
}

impl Default for UringQueueConfig {
    fn default() -> Self {
        Self { sq_entries: 256 }
    }
}

pub struct UringQueue {
    ring: IoUring,
    /// Serializes SQ producers.
    sq_lock: Mutex<()>,
    /// Serializes CQ consumers.
    cq_lock: Mutex<()>,
    inflight: Mutex<Slab<IoOp>>,
    listener: AtomicI32,
    ext_arg: bool,
    closed: AtomicBool,
}

// Safety: the SQ and CQ rings are only touched under `sq_lock` and
// `cq_lock` respectively; every other IoUring method used here takes
// `&self` and goes straight to io_uring_enter(2).
unsafe impl Send for UringQueue {}
unsafe impl Sync for UringQueue {}

impl UringQueue {
    pub fn new(config: UringQueueConfig) -> Result<Self> {
        let ring = IoUring::builder()
            .build(config.sq_entries)
            .map_err(QueueError::Setup)?;
        let ext_arg = ring.params().is_feature_ext_arg();
        if !ext_arg {
            tracing::warn!("io_uring lacks EXT_ARG; wait timeouts (liveness sweep) disabled");
        }
        Ok(Self {
            ring,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
            inflight: Mutex::new(Slab::with_capacity(config.sq_entries as usize)),
            listener: AtomicI32::new(-1),
            ext_arg,
            closed: AtomicBool::new(false),
        })
    }

    /// Push one SQE and submit it.
    fn push(&self, sqe: &squeue::Entry) -> io::Result<()> {
        let _sq = self.sq_lock.lock();
        // Safety: SQ access is serialized by sq_lock, and every pointer in
        // `sqe` refers to a boxed slot parked in `inflight`.
        let pushed = unsafe { self.ring.submission_shared().push(sqe).is_ok() };
        if !pushed {
            // Full: flush to the kernel and retry once.
            self.ring.submit()?;
            // Safety: as above.
            let retry = unsafe { self.ring.submission_shared().push(sqe).is_ok() };
            if !retry {
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }
        }
        self.ring.submit()?;
        Ok(())
    }

    /// Park `op` in the in-flight table, build its SQE and submit it.
    fn submit_op(&self, op: IoOp, build: impl FnOnce(&mut IoOp) -> squeue::Entry) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::ShutDown);
        }
        let kind = op.kind();
        let mut inflight = self.inflight.lock();
        let entry = inflight.vacant_entry();
        let token = entry.key();
        let sqe = build(entry.insert(op)).user_data(token as u64);

        if let Err(e) = self.push(&sqe) {
            inflight.remove(token);
            if e.raw_os_error() == Some(libc::EBUSY) {
                return Err(QueueError::RingFull);
            }
            return Err(QueueError::post(kind, e));
        }
        Ok(())
    }

    /// Pop one CQE and turn it into an event.
    fn reap(&self) -> Option<Event> {
        loop {
            let cqe = {
                let _cq = self.cq_lock.lock();
                // Safety: CQ access is serialized by cq_lock.
                let mut cq = unsafe { self.ring.completion_shared() };
                let cqe = cq.next();
                // Publish the new head before releasing the lock.
                drop(cq);
                cqe?
            };

            let token = cqe.user_data();
            if token == EXIT_TOKEN {
                return Some(Event::Exit);
            }
            if token == CANCEL_TOKEN {
                continue;
            }

            let mut op = {
                let mut inflight = self.inflight.lock();
                let idx = token as usize;
                if !inflight.contains(idx) {
                    tracing::warn!(token, "completion for unknown token");
                    continue;
                }
                inflight.remove(idx)
            };

            let res = cqe.result();
            let result = if res < 0 {
                Err(io::Error::from_raw_os_error(-res))
            } else if op.kind() == OpKind::Accept {
                // Safety: a non-negative accept result is a new descriptor we own.
                op.slot.set_pending_socket(unsafe { TcpStream::from_raw_fd(res) });
                Ok(0)
            } else {
                Ok(res as usize)
            };
            return Some(Event::Completion(Completion { op, result }));
        }
    }

    /// Block in the kernel until at least one CQE is available.
    fn enter(&self, left: Option<Duration>) -> io::Result<()> {
        match left {
            Some(d) if self.ext_arg => {
                let ts = types::Timespec::new()
                    .sec(d.as_secs())
                    .nsec(d.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args).map(drop)
            }
            _ => self.ring.submit_and_wait(1).map(drop),
        }
    }

    /// Ops currently owned by the kernel.
    pub fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }
}

/// SQE lengths are 32-bit. A longer send completes short and the
/// remainder is posted again.
fn sqe_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl CompletionQueue for UringQueue {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn associate_listener(&self, fd: RawFd) -> Result<()> {
        self.listener
            .compare_exchange(-1, fd, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(|_| QueueError::Associate(io::Error::from_raw_os_error(libc::EEXIST)))
    }

    fn associate(&self, ctx: &ConnectionContext) -> Result<()> {
        // Sockets need no registration; just make sure this one is alive.
        if ctx.is_open() {
            Ok(())
        } else {
            Err(QueueError::Closed)
        }
    }

    fn dissociate(&self, _ctx: &ConnectionContext) {
        // Pending ops complete once the context shuts its socket down.
    }

    fn post_accept(&self, op: IoOp) -> Result<()> {
        let fd = self.listener.load(Ordering::Acquire);
        if fd < 0 {
            return Err(QueueError::NoListener);
        }
        self.submit_op(op, |op| {
            op.slot.reset();
            let (addr, len) = op.slot.addr_parts();
            opcode::Accept::new(types::Fd(fd), addr, len)
                .flags(libc::SOCK_CLOEXEC)
                .build()
        })
    }

    fn post_recv(&self, op: IoOp) -> Result<()> {
        let conn = op.conn.clone().ok_or(QueueError::Closed)?;
        // Submit under the socket's read lock so the descriptor cannot be
        // closed and reused before the kernel has picked it up.
        conn.with_socket(|s| {
            let fd = types::Fd(s.as_raw_fd());
            self.submit_op(op, |op| {
                let buf = op.slot.recv_buf();
                opcode::Recv::new(fd, buf.as_mut_ptr(), sqe_len(buf.len())).build()
            })
        })
        .unwrap_or(Err(QueueError::Closed))
    }

    fn post_send(&self, op: IoOp) -> Result<()> {
        let conn = op.conn.clone().ok_or(QueueError::Closed)?;
        conn.with_socket(|s| {
            let fd = types::Fd(s.as_raw_fd());
            self.submit_op(op, |op| {
                let data = op.slot.unsent();
                opcode::Send::new(fd, data.as_ptr(), sqe_len(data.len()))
                    .flags(libc::MSG_NOSIGNAL)
                    .build()
            })
        })
        .unwrap_or(Err(QueueError::Closed))
    }

    fn post_exit(&self) -> Result<()> {
        let sqe = opcode::Nop::new().build().user_data(EXIT_TOKEN);
        self.push(&sqe)
            .map_err(|e| QueueError::Post { kind: "exit", source: e })
    }

    fn wait(&self, timeout: Option<Duration>) -> std::result::Result<Event, WaitError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(ev) = self.reap() {
                return Ok(ev);
            }
            let left = match deadline {
                None => None,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(WaitError::TimedOut);
                    }
                    Some(left)
                }
            };
            match self.enter(left) {
                Ok(()) => {}
                Err(e) => match e.raw_os_error() {
                    Some(libc::ETIME) => {
                        return self.reap().ok_or(WaitError::TimedOut);
                    }
                    Some(libc::EINTR) | Some(libc::EBUSY) | Some(libc::EAGAIN) => {}
                    _ => return Err(WaitError::Os(e)),
                },
            }
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let tokens: Vec<u64> = self.inflight.lock().iter().map(|(k, _)| k as u64).collect();
        for token in tokens {
            let sqe = opcode::AsyncCancel::new(token).build().user_data(CANCEL_TOKEN);
            if let Err(e) = self.push(&sqe) {
                tracing::debug!(token, error = %e, "cancel submit failed");
            }
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.inflight() > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            if self.reap().is_none() {
                let _ = self.enter(Some(left.min(Duration::from_millis(10))));
            }
        }

        let mut inflight = self.inflight.lock();
        let stuck = inflight.len();
        if stuck > 0 {
            // The kernel may still write into these buffers; never free them.
            tracing::warn!(stuck, "io_uring ops still in flight at shutdown, leaking them");
            for op in inflight.drain() {
                std::mem::forget(op);
            }
        }
        tracing::debug!("io_uring queue shut down");
    }
}

impl Drop for UringQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
