//! Upper-layer callbacks.
//!
//! Both callbacks run synchronously on whichever worker thread processed
//! the completion, possibly on several workers at once. They must not
//! block for long: a blocked callback is a blocked worker.

use crate::engine::EngineHandle;
use fleetio_core::ConnId;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// One completed receive.
#[derive(Debug, Clone, Copy)]
pub struct Inbound<'a> {
    pub conn: ConnId,
    pub peer: SocketAddr,
    /// Exactly the bytes read by this completion. No framing.
    pub data: &'a [u8],
}

impl Inbound<'_> {
    pub fn peer_ip(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn peer_port(&self) -> u16 {
        self.peer.port()
    }
}

type ReceiveFn = dyn Fn(&EngineHandle, Inbound<'_>) + Send + Sync;
type DisconnectFn = dyn Fn(&EngineHandle, ConnId, SocketAddr) + Send + Sync;

#[derive(Clone, Default)]
pub struct Callbacks {
    on_receive: Option<Arc<ReceiveFn>>,
    on_disconnect: Option<Arc<DisconnectFn>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_receive<F>(mut self, f: F) -> Self
    where
        F: Fn(&EngineHandle, Inbound<'_>) + Send + Sync + 'static,
    {
        self.on_receive = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(&EngineHandle, ConnId, SocketAddr) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    pub(crate) fn received(&self, handle: &EngineHandle, inbound: Inbound<'_>) {
        if let Some(f) = &self.on_receive {
            f(handle, inbound);
        }
    }

    pub(crate) fn disconnected(&self, handle: &EngineHandle, conn: ConnId, peer: SocketAddr) {
        if let Some(f) = &self.on_disconnect {
            f(handle, conn, peer);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_receive", &self.on_receive.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}
