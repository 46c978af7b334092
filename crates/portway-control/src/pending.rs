//! Connect-ack rendezvous
//!
//! The accept task registers a tunnel id before sending `Connect` and parks
//! on the receiver; the session dispatcher completes it when the agent's
//! `ConnectAck` arrives. Both completion and cancellation evict the entry.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Outcome of a connect handshake as reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub success: bool,
    pub error: String,
}

impl ConnectReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: String::new(),
        }
    }

    pub fn refused(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// Tracks tunnels awaiting their `ConnectAck`.
#[derive(Clone, Default)]
pub struct PendingAcks {
    inner: Arc<DashMap<u32, oneshot::Sender<ConnectReply>>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending handshake and return the receiver the opener
    /// parks on.
    pub fn register(&self, tunnel_id: u32) -> oneshot::Receiver<ConnectReply> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(tunnel_id, tx);
        debug!(tunnel_id, "registered pending connect ack");
        rx
    }

    /// Deliver the peer's reply. Returns false when nothing was waiting
    /// (already timed out or cancelled).
    pub fn complete(&self, tunnel_id: u32, reply: ConnectReply) -> bool {
        if let Some((_, tx)) = self.inner.remove(&tunnel_id) {
            if tx.send(reply).is_err() {
                warn!(tunnel_id, "connect ack receiver dropped before delivery");
                return false;
            }
            return true;
        }
        debug!(tunnel_id, "connect ack with no pending entry");
        false
    }

    /// Drop a pending entry, e.g. on timeout or session teardown.
    pub fn cancel(&self, tunnel_id: u32) {
        if self.inner.remove(&tunnel_id).is_some() {
            debug!(tunnel_id, "cancelled pending connect ack");
        }
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}
