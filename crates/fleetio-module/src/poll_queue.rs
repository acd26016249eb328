//! `PollQueue` — default `CompletionQueue` implementation.
//!
//! Emulates a completion port on top of epoll:
//!
//! - Accept and receive are armed as `EPOLLONESHOT` readiness
//!   registrations. The worker whose `epoll_wait` returns the event
//!   performs the `accept4`/`recv` itself and returns the result as a
//!   completion. One-shot arming guarantees a single worker owns the
//!   operation.
//! - Sends are performed synchronously inside `post_send` (bounded by
//!   `send_timeout`) and their completion is queued on a lock-free list.
//!   Exit sentinels use the same list. Each queued entry adds one token
//!   to a semaphore eventfd that sits in the epoll set, so a blocked
//!   worker wakes up for it.
//!
//! Works on any Linux kernel. No io_uring required.

use fleetio_core::context::ConnectionContext;
use fleetio_core::entry::{Completion, Event, IoOp};
use fleetio_core::error::{QueueError, Result};
use fleetio_core::queue::{CompletionQueue, WaitError};

use crate::eventfd_notifier::EventFdNotifier;

use crossbeam_queue::SegQueue;
use nix::errno::Errno;
use parking_lot::Mutex;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const WAKE_KEY: u64 = u64::MAX;
const LISTENER_KEY: u64 = u64::MAX - 1;

const ARM_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLONESHOT) as u32;

/// Configuration for PollQueue.
#[derive(Debug, Clone)]
pub struct PollQueueConfig {
    /// Upper bound on how long a single send may wait for buffer space.
    pub send_timeout: Duration,
}

impl Default for PollQueueConfig {
    fn default() -> Self {
        Self { send_timeout: Duration::from_secs(1) }
    }
}

/// One socket in the epoll set and the op waiting on it.
struct Source {
    fd: RawFd,
    recv: Option<IoOp>,
    accepts: VecDeque<IoOp>,
    armed: bool,
}

impl Source {
    fn new(fd: RawFd) -> Self {
        Self { fd, recv: None, accepts: VecDeque::new(), armed: false }
    }
}

pub struct PollQueue {
    epfd: OwnedFd,
    wake: EventFdNotifier,
    /// Synthetic completions (sends) and exit sentinels.
    ready: SegQueue<Event>,
    sources: Mutex<HashMap<u64, Source>>,
    send_timeout: Duration,
    closed: AtomicBool,
}

impl PollQueue {
    pub fn new(config: PollQueueConfig) -> Result<Self> {
        // Safety: plain syscall, result checked below.
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(QueueError::Setup(io::Error::last_os_error()));
        }
        // Safety: freshly created descriptor, owned here only.
        let epfd = unsafe { OwnedFd::from_raw_fd(raw) };
        let wake = EventFdNotifier::create()?;

        let q = Self {
            epfd,
            wake,
            ready: SegQueue::new(),
            sources: Mutex::new(HashMap::new()),
            send_timeout: config.send_timeout,
            closed: AtomicBool::new(false),
        };
        // Level-triggered, never one-shot: stays readable while tokens remain.
        q.ctl(libc::EPOLL_CTL_ADD, q.wake.fd(), WAKE_KEY, libc::EPOLLIN as u32)
            .map_err(QueueError::Setup)?;
        Ok(q)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, key: u64, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: key };
        // Safety: ev is a valid epoll_event for the duration of the call.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        Errno::result(rc)
            .map(drop)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))
    }

    fn arm(&self, src: &mut Source, key: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, src.fd, key, ARM_EVENTS)?;
        src.armed = true;
        Ok(())
    }

    fn push_ready(&self, ev: Event) -> Result<()> {
        self.ready.push(ev);
        self.wake.notify()
    }

    /// Turn one readiness event into a completion, if there is an op for it.
    fn complete(&self, key: u64) -> Option<Event> {
        if key == LISTENER_KEY {
            return self.complete_accept();
        }

        let mut op = {
            let mut sources = self.sources.lock();
            let src = sources.get_mut(&key)?;
            src.armed = false;
            src.recv.take()?
        };

        let conn = op.conn.clone()?;
        let result = conn
            .with_socket(|s| {
                let buf = op.slot.recv_buf();
                // Safety: buf is a live, exclusively borrowed byte slice.
                let rc = unsafe {
                    libc::recv(s.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
                };
                Errno::result(rc).map(|n| n as usize)
            })
            .unwrap_or(Err(Errno::ENOTCONN));

        match result {
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                // Spurious wakeup. Put the op back and wait again.
                let mut sources = self.sources.lock();
                match sources.get_mut(&key) {
                    Some(src) => {
                        src.recv = Some(op);
                        if let Err(e) = self.arm(src, key) {
                            let op = src.recv.take()?;
                            return Some(Event::Completion(Completion { op, result: Err(e) }));
                        }
                        None
                    }
                    None => Some(Event::Completion(Completion {
                        op,
                        result: Err(io::Error::from_raw_os_error(libc::ENOTCONN)),
                    })),
                }
            }
            Ok(n) => Some(Event::Completion(Completion { op, result: Ok(n) })),
            Err(e) => Some(Event::Completion(Completion {
                op,
                result: Err(io::Error::from_raw_os_error(e as i32)),
            })),
        }
    }

    fn complete_accept(&self) -> Option<Event> {
        let mut sources = self.sources.lock();
        let src = sources.get_mut(&LISTENER_KEY)?;
        src.armed = false;
        let mut op = src.accepts.pop_front()?;

        op.slot.reset();
        let (addr, len) = op.slot.addr_parts();
        // Safety: addr/len point into the boxed slot, which outlives the call.
        let rc = unsafe {
            libc::accept4(src.fd, addr, len, libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK)
        };

        let result = match Errno::result(rc) {
            Ok(fd) => {
                // Safety: accept4 returned a new descriptor we now own.
                op.slot.set_pending_socket(unsafe { TcpStream::from_raw_fd(fd) });
                Ok(0)
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                src.accepts.push_front(op);
                if let Err(e) = self.arm(src, LISTENER_KEY) {
                    tracing::warn!(error = %e, "failed to re-arm listener");
                }
                return None;
            }
            Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
        };

        if !src.accepts.is_empty() {
            if let Err(e) = self.arm(src, LISTENER_KEY) {
                tracing::warn!(error = %e, "failed to re-arm listener");
            }
        }
        Some(Event::Completion(Completion { op, result }))
    }

    /// Pending accept ops (for tests and diagnostics).
    pub fn pending_accepts(&self) -> usize {
        self.sources
            .lock()
            .get(&LISTENER_KEY)
            .map_or(0, |s| s.accepts.len())
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Safety: fcntl on a caller-owned descriptor.
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) })
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    // Safety: as above.
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })
        .map(drop)
        .map_err(|e| io::Error::from_raw_os_error(e as i32))
}

/// Write all of `data`, waiting for buffer space at most `timeout` in total.
fn send_all(fd: RawFd, data: &[u8], timeout: Duration) -> io::Result<usize> {
    let deadline = Instant::now() + timeout;
    let mut sent = 0;
    while sent < data.len() {
        let rest = &data[sent..];
        // Safety: rest is a live byte slice.
        let rc = unsafe {
            libc::send(
                fd,
                rest.as_ptr() as *const libc::c_void,
                rest.len(),
                libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
            )
        };
        match Errno::result(rc) {
            Ok(n) => sent += n as usize,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
                }
                let mut pfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
                let ms = left.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;
                // Safety: single valid pollfd.
                let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
                if let Err(e) = Errno::result(rc) {
                    if e != Errno::EINTR {
                        return Err(io::Error::from_raw_os_error(e as i32));
                    }
                }
            }
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
    Ok(sent)
}

impl CompletionQueue for PollQueue {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn associate_listener(&self, fd: RawFd) -> Result<()> {
        let mut sources = self.sources.lock();
        if sources.contains_key(&LISTENER_KEY) {
            return Err(QueueError::Associate(io::Error::from_raw_os_error(libc::EEXIST)));
        }
        set_nonblocking(fd).map_err(QueueError::Associate)?;
        // Registered disarmed; the first post_accept arms it.
        self.ctl(libc::EPOLL_CTL_ADD, fd, LISTENER_KEY, libc::EPOLLONESHOT as u32)
            .map_err(QueueError::Associate)?;
        sources.insert(LISTENER_KEY, Source::new(fd));
        Ok(())
    }

    fn associate(&self, ctx: &ConnectionContext) -> Result<()> {
        let key = ctx.id().as_u64();
        let fd = ctx
            .with_socket(|s| s.set_nonblocking(true).map(|_| s.as_raw_fd()))
            .ok_or(QueueError::Closed)?
            .map_err(QueueError::Associate)?;
        let mut sources = self.sources.lock();
        self.ctl(libc::EPOLL_CTL_ADD, fd, key, libc::EPOLLONESHOT as u32)
            .map_err(QueueError::Associate)?;
        sources.insert(key, Source::new(fd));
        Ok(())
    }

    fn dissociate(&self, ctx: &ConnectionContext) {
        let key = ctx.id().as_u64();
        let removed = self.sources.lock().remove(&key);
        if let Some(src) = removed {
            // The socket may already be gone; nothing to undo then.
            let _ = self.ctl(libc::EPOLL_CTL_DEL, src.fd, key, 0);
        }
    }

    fn post_accept(&self, op: IoOp) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::ShutDown);
        }
        let mut sources = self.sources.lock();
        let src = sources.get_mut(&LISTENER_KEY).ok_or(QueueError::NoListener)?;
        src.accepts.push_back(op);
        if !src.armed {
            if let Err(e) = self.arm(src, LISTENER_KEY) {
                src.accepts.pop_back();
                return Err(QueueError::post(fleetio_core::OpKind::Accept, e));
            }
        }
        Ok(())
    }

    fn post_recv(&self, op: IoOp) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::ShutDown);
        }
        let key = op.conn.as_ref().ok_or(QueueError::Closed)?.id().as_u64();
        let mut sources = self.sources.lock();
        let src = sources.get_mut(&key).ok_or(QueueError::Closed)?;
        if src.recv.is_some() {
            return Err(QueueError::post(
                op.kind(),
                io::Error::new(io::ErrorKind::AlreadyExists, "receive already pending"),
            ));
        }
        src.recv = Some(op);
        if let Err(e) = self.arm(src, key) {
            src.recv = None;
            return Err(QueueError::post(fleetio_core::OpKind::Receive, e));
        }
        Ok(())
    }

    fn post_send(&self, op: IoOp) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::ShutDown);
        }
        let conn = op.conn.clone().ok_or(QueueError::Closed)?;
        let timeout = self.send_timeout;
        let result = conn
            .with_socket(|s| send_all(s.as_raw_fd(), op.slot.unsent(), timeout))
            .unwrap_or_else(|| Err(io::Error::from_raw_os_error(libc::ENOTCONN)));
        self.push_ready(Event::Completion(Completion { op, result }))
    }

    fn post_exit(&self) -> Result<()> {
        self.push_ready(Event::Exit)
    }

    fn wait(&self, timeout: Option<Duration>) -> std::result::Result<Event, WaitError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(ev) = self.ready.pop() {
                return Ok(ev);
            }

            let ms: libc::c_int = match deadline {
                None => -1,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(WaitError::TimedOut);
                    }
                    left.as_millis().clamp(1, i32::MAX as u128) as libc::c_int
                }
            };

            let mut ev = libc::epoll_event { events: 0, u64: 0 };
            // Safety: room for exactly one event.
            let n = unsafe { libc::epoll_wait(self.epfd.as_raw_fd(), &mut ev, 1, ms) };
            match Errno::result(n) {
                Ok(0) => {
                    if let Some(ev) = self.ready.pop() {
                        return Ok(ev);
                    }
                    return Err(WaitError::TimedOut);
                }
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(WaitError::Os(io::Error::from_raw_os_error(e as i32))),
            }

            let key = ev.u64;
            if key == WAKE_KEY {
                self.wake.consume();
                continue;
            }
            if let Some(ev) = self.complete(key) {
                return Ok(ev);
            }
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped: usize = {
            let mut sources = self.sources.lock();
            let n = sources
                .values()
                .map(|s| s.accepts.len() + usize::from(s.recv.is_some()))
                .sum();
            sources.clear();
            n
        };
        while self.ready.pop().is_some() {}
        tracing::debug!(dropped, "poll queue shut down");
    }
}

impl Drop for PollQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
