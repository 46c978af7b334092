//! Registry of connected agent sessions
//!
//! One [`AgentSession`] exists per authenticated control channel. All
//! outbound frames for a session go through its bounded queue, drained by a
//! single writer task in the server, so frames from unrelated tunnels never
//! interleave at the byte level.

use crate::error::ControlError;
use chrono::{DateTime, Utc};
use portway_proto::Frame;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How long a `Data` frame may wait for queue space before the sending
/// tunnel is considered stalled and torn down.
pub const DATA_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the per-session outbound queue.
pub const OUTBOUND_QUEUE: usize = 256;

/// A connected agent's control-channel state.
pub struct AgentSession {
    pub agent_id: String,
    pub name: String,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    last_seen: Mutex<Instant>,
    outbound: mpsc::Sender<Frame>,
    closer: watch::Sender<bool>,
    tunnels: Mutex<HashSet<u32>>,
}

impl AgentSession {
    /// Build a session around its outbound queue. The caller owns the
    /// receiving half (the writer task) and a `watch` receiver that flips
    /// to `true` when the session is force-closed.
    pub fn new(
        agent_id: String,
        name: String,
        remote_addr: SocketAddr,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>, watch::Receiver<bool>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (closer, close_rx) = watch::channel(false);
        let session = Arc::new(Self {
            agent_id,
            name,
            remote_addr,
            connected_at: Utc::now(),
            last_seen: Mutex::new(Instant::now()),
            outbound,
            closer,
            tunnels: Mutex::new(HashSet::new()),
        });
        (session, outbound_rx, close_rx)
    }

    /// Queue a control frame, waiting for space if the queue is full.
    pub async fn send(&self, frame: Frame) -> Result<(), ControlError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ControlError::ChannelClosed(self.agent_id.clone()))
    }

    /// Queue a data frame with a bounded wait. A stalled queue is the
    /// backpressure signal: the caller tears down the offending tunnel.
    pub async fn send_data(&self, frame: Frame) -> Result<(), ControlError> {
        match self.outbound.send_timeout(frame, DATA_SEND_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                Err(ControlError::ChannelStalled(self.agent_id.clone()))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                Err(ControlError::ChannelClosed(self.agent_id.clone()))
            }
        }
    }

    /// Mark inbound activity for the liveness reaper.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }

    /// Ask the writer task to close the channel. Idempotent.
    pub fn close(&self) {
        let _ = self.closer.send(true);
    }

    /// Signal that flips to `true` when the session is force-closed.
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.closer.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closer.borrow()
    }

    pub fn track_tunnel(&self, tunnel_id: u32) {
        self.tunnels.lock().unwrap().insert(tunnel_id);
    }

    pub fn untrack_tunnel(&self, tunnel_id: u32) {
        self.tunnels.lock().unwrap().remove(&tunnel_id);
    }

    pub fn tunnel_ids(&self) -> Vec<u32> {
        self.tunnels.lock().unwrap().iter().copied().collect()
    }

    pub fn active_tunnels(&self) -> usize {
        self.tunnels.lock().unwrap().len()
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("agent_id", &self.agent_id)
            .field("name", &self.name)
            .field("remote_addr", &self.remote_addr)
            .field("active_tunnels", &self.active_tunnels())
            .finish()
    }
}

/// Registry of connected agents, keyed by agent id.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<AgentSession>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing (and force-closing) a stale one for
    /// the same agent id. Returns the replaced session, if any.
    pub fn register(&self, session: Arc<AgentSession>) -> Option<Arc<AgentSession>> {
        let mut sessions = self.sessions.write().unwrap();
        let old = sessions.insert(session.agent_id.clone(), session.clone());

        if let Some(ref replaced) = old {
            warn!(
                agent_id = %session.agent_id,
                old_remote = %replaced.remote_addr,
                new_remote = %session.remote_addr,
                "replacing stale agent session"
            );
            replaced.close();
        } else {
            info!(
                agent_id = %session.agent_id,
                name = %session.name,
                remote = %session.remote_addr,
                "agent connected"
            );
        }

        old
    }

    /// Remove a session, but only if the registered entry is this exact
    /// session: a replaced session tearing itself down must not evict its
    /// replacement.
    pub fn unregister(&self, session: &Arc<AgentSession>) -> bool {
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get(&session.agent_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.agent_id);
                info!(agent_id = %session.agent_id, "agent disconnected");
                true
            }
            _ => {
                debug!(agent_id = %session.agent_id, "stale session already replaced");
                false
            }
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.read().unwrap().get(agent_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<AgentSession>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}
