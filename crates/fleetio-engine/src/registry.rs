//! The set of live connections.
//!
//! Every mutation happens under one lock. Retiring a context removes it,
//! detaches it from the queue and claims its close in a single critical
//! section, so lookups never observe a half-destroyed connection. The
//! socket itself is released after the lock is dropped: releasing waits
//! for I/O in flight on that socket, which must not stall the registry.
//!
//! Lock order: registry, then queue-internal locks, then the context's
//! socket lock. Nothing here calls back into user code.

use fleetio_core::{CompletionQueue, ConnId, ConnectionContext, QueueError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ConnectionRegistry {
    conns: Mutex<HashMap<ConnId, Arc<ConnectionContext>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection without posting anything. Refused (returns
    /// `false`) if the context was already closed.
    #[cfg(test)]
    pub(crate) fn insert(&self, ctx: Arc<ConnectionContext>) -> bool {
        let mut conns = self.conns.lock();
        if !ctx.is_open() {
            return false;
        }
        conns.insert(ctx.id(), ctx);
        true
    }

    /// Run `post` (the first receive) and insert `ctx` if it succeeds,
    /// both under the registry lock.
    ///
    /// A completion for that receive can be dispatched by another worker
    /// as soon as it is posted; its `get` or `retire` waits here until the
    /// connection is visible. Returns `Ok(false)` for a context closed
    /// before it got here.
    pub fn establish(
        &self,
        ctx: &Arc<ConnectionContext>,
        post: impl FnOnce(&Arc<ConnectionContext>) -> Result<(), QueueError>,
    ) -> Result<bool, QueueError> {
        let mut conns = self.conns.lock();
        if !ctx.is_open() {
            return Ok(false);
        }
        post(ctx)?;
        conns.insert(ctx.id(), ctx.clone());
        Ok(true)
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<ConnectionContext>> {
        self.conns.lock().get(&id).cloned()
    }

    /// Connections present right now.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionContext>> {
        self.conns.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove `ctx`, detach it from `queue` and close it.
    ///
    /// Returns `true` only for the call that claimed the close, so a
    /// connection is reported gone exactly once however many workers
    /// observe its failure.
    pub fn retire(&self, ctx: &ConnectionContext, queue: &dyn CompletionQueue) -> bool {
        let claimed = {
            let mut conns = self.conns.lock();
            conns.remove(&ctx.id());
            queue.dissociate(ctx);
            ctx.begin_close()
        };
        ctx.release();
        claimed
    }

    /// Close every connection. Used by `stop()` once workers are gone.
    pub fn drain(&self, queue: &dyn CompletionQueue) -> usize {
        let drained: Vec<_> = {
            let mut conns = self.conns.lock();
            conns
                .drain()
                .map(|(_, ctx)| {
                    queue.dissociate(&ctx);
                    let claimed = ctx.begin_close();
                    (ctx, claimed)
                })
                .collect()
        };
        let mut closed = 0;
        for (ctx, claimed) in drained {
            ctx.release();
            closed += usize::from(claimed);
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetio_module::{open_queue, Backend, QueueOptions};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn ctx(id: u64) -> (Arc<ConnectionContext>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        let local = server.local_addr().unwrap();
        (Arc::new(ConnectionContext::new(ConnId(id), server, peer, local)), client)
    }

    #[test]
    fn retire_reports_once() {
        let q = open_queue(Backend::Poll, &QueueOptions::default()).unwrap();
        let reg = ConnectionRegistry::new();
        let (c, _client) = ctx(1);
        q.associate(&c).unwrap();
        assert!(reg.insert(c.clone()));
        assert_eq!(reg.len(), 1);

        assert!(reg.retire(&c, &*q));
        assert!(!reg.retire(&c, &*q));
        assert!(reg.is_empty());
        assert!(reg.get(ConnId(1)).is_none());
    }

    #[test]
    fn closed_context_is_refused() {
        let reg = ConnectionRegistry::new();
        let (c, _client) = ctx(2);
        c.close();
        assert!(!reg.insert(c.clone()));
        assert!(reg.get(ConnId(2)).is_none());
        assert!(!reg.establish(&c, |_| panic!("posted for a closed context")).unwrap());
    }

    #[test]
    fn establish_inserts_only_after_post() {
        let reg = ConnectionRegistry::new();
        let (ok, _c1) = ctx(3);
        assert!(reg.establish(&ok, |_| Ok(())).unwrap());
        assert!(reg.get(ConnId(3)).is_some());

        let (refused, _c2) = ctx(4);
        let err = reg.establish(&refused, |_| Err(QueueError::Closed));
        assert!(matches!(err, Err(QueueError::Closed)));
        assert!(reg.get(ConnId(4)).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn lookups_wait_for_establish() {
        let reg = Arc::new(ConnectionRegistry::new());
        let (c, _client) = ctx(5);
        let (tx, rx) = mpsc::channel();
        let looker = {
            let reg = reg.clone();
            thread::spawn(move || {
                rx.recv().unwrap();
                reg.get(ConnId(5)).is_some()
            })
        };
        reg.establish(&c, |_| {
            // The receive is "in flight" now; a concurrent lookup blocks.
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
            Ok(())
        })
        .unwrap();
        assert!(looker.join().unwrap());
    }

    #[test]
    fn retire_does_not_hold_registry_during_release() {
        let q = open_queue(Backend::Poll, &QueueOptions::default()).unwrap();
        let reg = Arc::new(ConnectionRegistry::new());
        let (c, _client) = ctx(6);
        let (other, _client2) = ctx(7);
        q.associate(&c).unwrap();
        assert!(reg.insert(c.clone()));

        // A send stuck on a full socket holds the read lock like this.
        let (tx, rx) = mpsc::channel();
        let busy = {
            let c = c.clone();
            thread::spawn(move || {
                c.with_socket(|_| {
                    tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(800));
                })
            })
        };
        rx.recv().unwrap();

        let retiring = {
            let (reg, c) = (reg.clone(), c.clone());
            thread::spawn(move || reg.retire(&c, &*q))
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while c.is_open() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!c.is_open());

        let start = Instant::now();
        assert_eq!(reg.len(), 0);
        assert!(reg.insert(other));
        assert_eq!(reg.snapshot().len(), 1);
        assert!(start.elapsed() < Duration::from_millis(300));

        assert!(retiring.join().unwrap());
        assert!(busy.join().unwrap().is_some());
    }

    #[test]
    fn drain_closes_everything() {
        let q = open_queue(Backend::Poll, &QueueOptions::default()).unwrap();
        let reg = ConnectionRegistry::new();
        let mut keep = Vec::new();
        for id in 1..=3 {
            let (c, client) = ctx(id);
            reg.insert(c.clone());
            keep.push((c, client));
        }
        assert_eq!(reg.snapshot().len(), 3);
        assert_eq!(reg.drain(&*q), 3);
        assert!(reg.is_empty());
        assert!(keep.iter().all(|(c, _)| !c.is_open()));
    }
}
