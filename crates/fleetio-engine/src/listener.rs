//! Listen endpoint: the bound socket plus its pipeline of pre-posted
//! accepts.

use crate::config::EngineConfig;
use crate::stats::EngineStats;

use fleetio_core::{CompletionQueue, IoOp, IoSlot, OpKind, QueueError};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::Ordering;

pub struct ListenEndpoint {
    socket: Mutex<Option<TcpListener>>,
    fd: RawFd,
    local: SocketAddr,
    depth: usize,
}

impl ListenEndpoint {
    /// Bind and listen on `config.bind_ip:port`. Port 0 picks a free port.
    pub fn bind(config: &EngineConfig, port: u16) -> io::Result<Self> {
        let addr = SocketAddr::new(config.bind_ip, port);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(config.backlog)?;

        let listener: TcpListener = socket.into();
        let local = listener.local_addr()?;
        Ok(Self {
            fd: listener.as_raw_fd(),
            socket: Mutex::new(Some(listener)),
            local,
            depth: config.accept_depth,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Configured pipeline depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_open(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// Pre-post `depth` accepts. Returns how many were posted; each
    /// failure is logged and the rest are still attempted.
    pub fn fill(&self, queue: &dyn CompletionQueue, stats: &EngineStats) -> usize {
        let mut posted = 0;
        for _ in 0..self.depth {
            match self.post(queue, IoSlot::new(OpKind::Accept, 0), stats) {
                Ok(()) => posted += 1,
                Err(e) => tracing::error!(error = %e, "failed to pre-post accept"),
            }
        }
        posted
    }

    /// Reset `slot` and post it as the next accept.
    pub fn repost(
        &self,
        queue: &dyn CompletionQueue,
        mut slot: Box<IoSlot>,
        stats: &EngineStats,
    ) -> Result<(), QueueError> {
        slot.reset();
        self.post(queue, slot, stats)
    }

    fn post(
        &self,
        queue: &dyn CompletionQueue,
        slot: Box<IoSlot>,
        stats: &EngineStats,
    ) -> Result<(), QueueError> {
        // Counted first: the completion may be consumed before post returns.
        stats.pending_accepts.fetch_add(1, Ordering::AcqRel);
        queue.post_accept(IoOp::accept(slot)).inspect_err(|_| {
            stats.pending_accepts.fetch_sub(1, Ordering::AcqRel);
        })
    }

    /// Shut the listening socket down and release it. Idempotent.
    pub fn close(&self) -> bool {
        let Some(listener) = self.socket.lock().take() else {
            return false;
        };
        // Wakes any accept still parked in the kernel.
        let _ = SockRef::from(&listener).shutdown(Shutdown::Both);
        tracing::debug!(addr = %self.local, "listener closed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback() -> EngineConfig {
        EngineConfig::new().bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn binds_ephemeral_port() {
        let ep = ListenEndpoint::bind(&loopback(), 0).unwrap();
        assert_ne!(ep.local_addr().port(), 0);
        assert!(ep.is_open());
        assert!(ep.close());
        assert!(!ep.close());
    }

    #[test]
    fn port_in_use_fails() {
        let ep = ListenEndpoint::bind(&loopback(), 0).unwrap();
        let port = ep.local_addr().port();
        assert!(ListenEndpoint::bind(&loopback(), port).is_err());
    }

    #[test]
    fn fill_counts_pending() {
        let q = fleetio_module::open_queue(
            fleetio_module::Backend::Poll,
            &fleetio_module::QueueOptions::default(),
        )
        .unwrap();
        let ep = ListenEndpoint::bind(&loopback().accept_depth(4), 0).unwrap();
        let stats = EngineStats::default();

        // Without a registered listener every post fails and nothing leaks.
        assert_eq!(ep.fill(&*q, &stats), 0);
        assert_eq!(stats.pending_accepts.load(Ordering::Relaxed), 0);

        q.associate_listener(ep.raw_fd()).unwrap();
        assert_eq!(ep.fill(&*q, &stats), 4);
        assert_eq!(stats.pending_accepts.load(Ordering::Relaxed), 4);
    }
}
