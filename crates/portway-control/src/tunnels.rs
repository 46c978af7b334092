//! Tunnel table and cloud-side socket writers
//!
//! The table maps cloud-allocated tunnel ids to the socket endpoint the
//! cloud holds for them. Socket writes go through a bounded per-tunnel
//! queue drained by a dedicated writer task, so the channel dispatcher is
//! never blocked on user-socket I/O: a queue that stays full past the
//! deadline tears the tunnel down instead.

use crate::error::ControlError;
use bytes::Bytes;
use dashmap::DashMap;
use portway_proto::Proto;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Deadline for enqueueing bytes to a tunnel's socket writer.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the per-tunnel writer queue.
const WRITER_QUEUE: usize = 64;

/// A cloud-held tunnel endpoint: the public-side socket for cloud-bound
/// rules, or the target socket for agent-opened tunnels terminating at
/// cloud.
pub struct TunnelEntry {
    pub id: u32,
    /// Agent session this tunnel belongs to.
    pub agent_id: String,
    pub rule_id: String,
    pub proto: Proto,
    pub target: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// For agent-opened tunnels, the id the owning session knows this
    /// tunnel by; frames to that session carry it instead of `id`.
    pub peer_local_id: Option<u32>,
    writer: mpsc::Sender<Bytes>,
    shutdown: watch::Sender<bool>,
}

impl TunnelEntry {
    /// Build an entry plus the receiving halves for its writer task and
    /// shutdown signal.
    pub fn new(
        id: u32,
        agent_id: String,
        rule_id: String,
        proto: Proto,
        target: String,
        peer_local_id: Option<u32>,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>, watch::Receiver<bool>) {
        let (writer, writer_rx) = mpsc::channel(WRITER_QUEUE);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let entry = Arc::new(Self {
            id,
            agent_id,
            rule_id,
            proto,
            target,
            created_at: chrono::Utc::now(),
            peer_local_id,
            writer,
            shutdown,
        });
        (entry, writer_rx, shutdown_rx)
    }

    /// Tunnel id as the owning session's wire knows it.
    pub fn wire_id(&self) -> u32 {
        self.peer_local_id.unwrap_or(self.id)
    }

    /// Queue bytes for the socket writer. Empty payloads are reserved as
    /// the in-band finish marker, so callers never pass them.
    pub async fn write(&self, data: Bytes) -> Result<(), ControlError> {
        match self.writer.send_timeout(data, WRITE_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                Err(ControlError::TunnelStalled(self.id))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(ControlError::TunnelGone(self.id)),
        }
    }

    /// Queue the finish marker: the writer drains everything already
    /// queued, then shuts the socket down. Used for an orderly peer close
    /// so `Close` never overtakes earlier `Data`.
    pub async fn finish(&self) {
        let _ = self.writer.send_timeout(Bytes::new(), WRITE_TIMEOUT).await;
    }

    /// Fire the shutdown signal, cancelling the pump and writer tasks.
    /// Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

impl std::fmt::Debug for TunnelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEntry")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .field("rule_id", &self.rule_id)
            .field("proto", &self.proto)
            .field("target", &self.target)
            .finish()
    }
}

/// Drain a tunnel writer queue into its socket half.
///
/// Draining is biased towards queued data so a shutdown fired right after
/// an orderly finish marker cannot drop bytes that were already accepted.
pub fn spawn_socket_writer<W>(
    tunnel_id: u32,
    mut sink: W,
    mut rx: mpsc::Receiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                data = rx.recv() => match data {
                    Some(data) if data.is_empty() => break,
                    Some(data) => {
                        trace!(tunnel_id, len = data.len(), "tunnel socket write");
                        if sink.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        let _ = sink.shutdown().await;
        debug!(tunnel_id, "tunnel socket writer ended");
    })
}

/// Process-wide table of cloud-held tunnel endpoints.
pub struct TunnelTable {
    next_id: AtomicU32,
    entries: DashMap<u32, Arc<TunnelEntry>>,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(0),
            entries: DashMap::new(),
        }
    }

    /// Allocate the next tunnel id. Ids start at 1; 0 is reserved for
    /// channel-scoped frames.
    pub fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert(&self, entry: Arc<TunnelEntry>) {
        self.entries.insert(entry.id, entry);
    }

    pub fn get(&self, id: u32) -> Option<Arc<TunnelEntry>> {
        self.entries.get(&id).map(|e| e.clone())
    }

    pub fn remove(&self, id: u32) -> Option<Arc<TunnelEntry>> {
        self.entries.remove(&id).map(|(_, e)| e)
    }

    pub fn ids_for_rule(&self, rule_id: &str) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|e| e.rule_id == rule_id)
            .map(|e| e.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TunnelTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn entry(id: u32, rule: &str) -> (Arc<TunnelEntry>, mpsc::Receiver<Bytes>) {
        let (entry, rx, _shutdown) = TunnelEntry::new(
            id,
            "agent-a".to_string(),
            rule.to_string(),
            Proto::Tcp,
            "127.0.0.1:7000".to_string(),
            None,
        );
        (entry, rx)
    }

    #[test]
    fn test_id_allocation_is_monotonic() {
        let table = TunnelTable::new();
        let a = table.allocate_id();
        let b = table.allocate_id();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let table = TunnelTable::new();
        let (e, _rx) = entry(1, "r1");
        table.insert(e);
        assert!(table.get(1).is_some());
        assert_eq!(table.len(), 1);
        assert!(table.remove(1).is_some());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_ids_for_rule() {
        let table = TunnelTable::new();
        let (a, _ra) = entry(1, "r1");
        let (b, _rb) = entry(2, "r2");
        let (c, _rc) = entry(3, "r1");
        table.insert(a);
        table.insert(b);
        table.insert(c);

        let mut ids = table.ids_for_rule("r1");
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_writer_drains_queue_before_finish() {
        let (client, server) = tokio::io::duplex(1024);
        let (entry, rx, shutdown_rx) = TunnelEntry::new(
            1,
            "agent-a".into(),
            "r1".into(),
            Proto::Tcp,
            "t:1".into(),
            None,
        );
        let handle = spawn_socket_writer(1, server, rx, shutdown_rx);

        entry.write(Bytes::from_static(b"hello ")).await.unwrap();
        entry.write(Bytes::from_static(b"world")).await.unwrap();
        entry.finish().await;
        entry.shutdown();

        handle.await.unwrap();

        let mut out = Vec::new();
        let mut client = client;
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_write_after_writer_dropped() {
        let (entry, rx, _shutdown) = TunnelEntry::new(
            1,
            "agent-a".into(),
            "r1".into(),
            Proto::Tcp,
            "t:1".into(),
            None,
        );
        drop(rx);
        assert!(matches!(
            entry.write(Bytes::from_static(b"x")).await,
            Err(ControlError::TunnelGone(1))
        ));
    }

    #[tokio::test]
    async fn test_wire_id_prefers_peer_local_id() {
        let (entry, _rx, _s) = TunnelEntry::new(
            9,
            "agent-a".into(),
            "r1".into(),
            Proto::Tcp,
            "t:1".into(),
            Some(0x8000_0001),
        );
        assert_eq!(entry.wire_id(), 0x8000_0001);
    }
}
