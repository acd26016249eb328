//! `Engine` — owns the queue, the worker pool, the listener and the
//! registry for one run.
//!
//! ```text
//!   start(port)                             stop()
//!   ───────────                             ──────
//!   validate config                         set shutdown flag
//!   open completion queue                   post one exit per worker
//!   bind + listen                           join workers
//!   associate listener                      drain registry (close all)
//!   pre-post accept_depth accepts           close listener
//!   spawn workers                           shut the queue down
//! ```

use crate::callbacks::Callbacks;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::listener::ListenEndpoint;
use crate::registry::ConnectionRegistry;
use crate::stats::{bump, EngineStats, StatsSnapshot};
use crate::worker;

use fleetio_core::{CompletionQueue, ConnId, ConnectionContext, IoOp, OpKind};
use fleetio_module::{open_queue, QueueOptions};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// State shared by the engine, its workers and every `EngineHandle`.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) queue: Box<dyn CompletionQueue>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) listener: ListenEndpoint,
    pub(crate) callbacks: Callbacks,
    pub(crate) stats: EngineStats,
    pub(crate) shutdown: AtomicBool,
    /// Held by the one worker currently running a liveness sweep.
    pub(crate) probing: AtomicBool,
    next_conn_id: AtomicU64,
}

impl Shared {
    pub(crate) fn new(
        config: EngineConfig,
        queue: Box<dyn CompletionQueue>,
        listener: ListenEndpoint,
        callbacks: Callbacks,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            registry: ConnectionRegistry::new(),
            listener,
            callbacks,
            stats: EngineStats::default(),
            shutdown: AtomicBool::new(false),
            probing: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn handle(self: &Arc<Self>) -> EngineHandle {
        EngineHandle { shared: Arc::downgrade(self) }
    }

    pub(crate) fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn send_to(&self, id: ConnId, data: &[u8]) -> bool {
        match self.registry.get(id) {
            Some(ctx) => {
                self.post_send(&ctx, data);
                true
            }
            None => false,
        }
    }

    fn send_to_all(&self, data: &[u8]) -> usize {
        let targets = self.registry.snapshot();
        for ctx in &targets {
            self.post_send(ctx, data);
        }
        targets.len()
    }

    /// Best effort: a failed post is counted and logged, never returned.
    fn post_send(&self, ctx: &Arc<ConnectionContext>, data: &[u8]) {
        if data.is_empty() || self.is_shutting_down() {
            return;
        }
        let mut slot = ctx.acquire_slot(OpKind::Send, self.config.buffer_size);
        slot.fill(data);
        if let Err(e) = self.queue.post_send(IoOp::send(slot, ctx.clone())) {
            bump(&self.stats.errors, 1);
            tracing::debug!(conn = %ctx.id(), error = %e, "send not posted");
        }
    }
}

/// Cheap, cloneable access to a running engine.
///
/// Passed to every callback. Holds no strong reference: once the engine
/// is dropped, sends become no-ops and counts read zero.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Weak<Shared>,
}

impl EngineHandle {
    /// Queue `data` for one connection. `false` if it is not registered.
    pub fn send_to(&self, conn: ConnId, data: &[u8]) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|s| s.send_to(conn, data))
    }

    /// Queue `data` for every connection registered right now.
    /// Returns how many connections were targeted.
    pub fn send_to_all(&self, data: &[u8]) -> usize {
        self.shared.upgrade().map_or(0, |s| s.send_to_all(data))
    }

    pub fn connection_count(&self) -> usize {
        self.shared.upgrade().map_or(0, |s| s.registry.len())
    }

    pub fn peer_of(&self, conn: ConnId) -> Option<SocketAddr> {
        self.shared.upgrade()?.registry.get(conn).map(|c| c.peer())
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("live", &(self.shared.strong_count() > 0))
            .finish()
    }
}

pub struct Engine {
    config: EngineConfig,
    shared: Option<Arc<Shared>>,
    workers: Vec<JoinHandle<()>>,
    started: bool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            shared: None,
            workers: Vec::new(),
            started: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bind `port` (0 = ephemeral) and start serving.
    ///
    /// On error every resource acquired so far is released again and the
    /// call may be retried. After a successful start the engine cannot be
    /// started a second time, even once stopped.
    pub fn start(&mut self, port: u16, callbacks: Callbacks) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }
        self.config.validate()?;

        let cfg = self.config.clone();
        let queue = open_queue(
            cfg.backend,
            &QueueOptions {
                send_timeout: cfg.send_timeout,
                uring_entries: cfg.uring_entries,
            },
        )?;

        let listener = ListenEndpoint::bind(&cfg, port).map_err(|source| EngineError::Bind {
            addr: SocketAddr::new(cfg.bind_ip, port),
            source,
        })?;
        if let Err(e) = queue.associate_listener(listener.raw_fd()) {
            listener.close();
            queue.shutdown();
            return Err(e.into());
        }

        let shared = Shared::new(cfg, queue, listener, callbacks);

        let posted = shared.listener.fill(&*shared.queue, &shared.stats);
        if posted == 0 {
            teardown(&shared, Vec::new());
            return Err(EngineError::AcceptPipeline);
        }
        if posted < shared.listener.depth() {
            tracing::warn!(posted, depth = shared.listener.depth(), "accept pipeline short");
        }

        let mut workers = Vec::with_capacity(shared.config.workers);
        for index in 0..shared.config.workers {
            let worker_shared = Arc::clone(&shared);
            shared.stats.workers_alive.fetch_add(1, Ordering::AcqRel);
            let spawned = thread::Builder::new()
                .name(format!("fleetio-worker-{index}"))
                .spawn(move || worker::run(worker_shared, index));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.stats.workers_alive.fetch_sub(1, Ordering::AcqRel);
                    teardown(&shared, workers);
                    return Err(EngineError::Spawn(e));
                }
            }
        }

        tracing::info!(
            addr = %shared.listener.local_addr(),
            backend = shared.queue.name(),
            workers = workers.len(),
            accept_depth = posted,
            "engine started"
        );
        self.shared = Some(shared);
        self.workers = workers;
        self.started = true;
        Ok(())
    }

    /// Graceful shutdown. Safe to call more than once.
    pub fn stop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let workers = std::mem::take(&mut self.workers);
        teardown(&shared, workers);
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_some()
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.as_ref().map(|s| s.listener.local_addr())
    }

    pub fn handle(&self) -> EngineHandle {
        match &self.shared {
            Some(s) => s.handle(),
            None => EngineHandle { shared: Weak::new() },
        }
    }

    pub fn send_to(&self, conn: ConnId, data: &[u8]) -> bool {
        self.shared.as_ref().is_some_and(|s| s.send_to(conn, data))
    }

    pub fn send_to_all(&self, data: &[u8]) -> usize {
        self.shared.as_ref().map_or(0, |s| s.send_to_all(data))
    }

    pub fn connection_count(&self) -> usize {
        self.shared.as_ref().map_or(0, |s| s.registry.len())
    }

    pub fn peer_of(&self, conn: ConnId) -> Option<SocketAddr> {
        self.shared.as_ref()?.registry.get(conn).map(|c| c.peer())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared
            .as_ref()
            .map(|s| s.stats.snapshot(s.registry.len()))
            .unwrap_or_default()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Shutdown sequence. Workers are joined before the registry is drained
/// so nothing is closed under a worker's feet.
fn teardown(shared: &Shared, workers: Vec<JoinHandle<()>>) {
    shared.shutdown.store(true, Ordering::SeqCst);

    for _ in 0..workers.len() {
        if let Err(e) = shared.queue.post_exit() {
            tracing::warn!(error = %e, "failed to post exit sentinel");
        }
    }
    for handle in workers {
        if handle.join().is_err() {
            tracing::error!("worker panicked");
        }
    }

    let drained = shared.registry.drain(&*shared.queue);
    shared.listener.close();
    shared.queue.shutdown();
    shared.stats.pending_accepts.store(0, Ordering::Release);

    tracing::info!(drained, "engine stopped");
}
