//! Agent-side tunnel sockets
//!
//! Each tunnel the agent holds (a dialed target for cloud-opened tunnels,
//! or an accepted client for locally-bound listeners) gets a reader task
//! that turns socket bytes into `Data` frames and a writer task fed by a
//! bounded queue. Cloud-allocated ids start at 1; agent-opened ids live in
//! the upper half of the id space so the two never collide in this map.

use bytes::Bytes;
use dashmap::DashMap;
use portway_proto::Frame;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

const PUMP_BUF: usize = 32 * 1024;
const WRITER_QUEUE: usize = 64;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

struct TunnelHandle {
    tx: mpsc::Sender<Bytes>,
    shutdown: watch::Sender<bool>,
}

/// Map of live tunnels on one agent session.
#[derive(Clone, Default)]
pub(crate) struct TunnelMap {
    inner: Arc<DashMap<u32, TunnelHandle>>,
}

impl TunnelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a socket as tunnel `tunnel_id`: spawn its writer and a reader
    /// that frames socket bytes onto the channel and emits `Close` on EOF.
    pub fn register(&self, tunnel_id: u32, stream: TcpStream, outbound: mpsc::Sender<Frame>) {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(WRITER_QUEUE);
        let (shutdown, writer_shutdown) = watch::channel(false);
        let reader_shutdown = shutdown.subscribe();

        self.inner.insert(tunnel_id, TunnelHandle { tx, shutdown });

        // Writer: channel → socket. Biased towards draining so an orderly
        // close cannot drop bytes already accepted.
        let mut writer_shutdown = writer_shutdown;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    data = rx.recv() => match data {
                        Some(data) if data.is_empty() => break,
                        Some(data) => {
                            trace!(tunnel_id, len = data.len(), "tunnel write");
                            if write_half.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_shutdown.changed() => break,
                }
            }
            let _ = write_half.shutdown().await;
        });

        // Reader: socket → channel.
        let tunnels = self.clone();
        let mut reader_shutdown = reader_shutdown;
        tokio::spawn(async move {
            let mut source = read_half;
            let mut buf = vec![0u8; PUMP_BUF];
            let notify = loop {
                tokio::select! {
                    _ = reader_shutdown.changed() => break false,
                    res = source.read(&mut buf) => match res {
                        Ok(0) | Err(_) => break true,
                        Ok(n) => {
                            let frame = Frame::data(tunnel_id, Bytes::copy_from_slice(&buf[..n]));
                            if outbound.send(frame).await.is_err() {
                                break false;
                            }
                        }
                    }
                }
            };
            if tunnels.close(tunnel_id) && notify {
                let _ = outbound.send(Frame::close(tunnel_id)).await;
            }
            debug!(tunnel_id, "tunnel reader ended");
        });
    }

    /// Queue bytes towards the tunnel's socket. Err means the tunnel is
    /// gone or its writer stalled past the deadline.
    pub async fn write(&self, tunnel_id: u32, data: Bytes) -> Result<(), ()> {
        let tx = match self.inner.get(&tunnel_id) {
            Some(handle) => handle.tx.clone(),
            None => return Err(()),
        };
        tx.send_timeout(data, WRITE_TIMEOUT).await.map_err(|_| ())
    }

    /// Queue the finish marker: drain accepted bytes, then shut the socket
    /// down.
    pub async fn finish(&self, tunnel_id: u32) {
        if let Some(handle) = self.inner.get(&tunnel_id) {
            let _ = handle
                .tx
                .send_timeout(Bytes::new(), WRITE_TIMEOUT)
                .await;
        }
    }

    /// Evict a tunnel, cancelling its tasks. Returns true if it was still
    /// present (the caller may then emit `Close`).
    pub fn close(&self, tunnel_id: u32) -> bool {
        if let Some((_, handle)) = self.inner.remove(&tunnel_id) {
            let _ = handle.shutdown.send(true);
            true
        } else {
            false
        }
    }

    pub fn close_all(&self) {
        let ids: Vec<u32> = self.inner.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.close(id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portway_proto::Message;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_register_write_and_peer_receives() {
        let tunnels = TunnelMap::new();
        let (outbound, _outbound_rx) = mpsc::channel(16);
        let (mut peer, ours) = socket_pair().await;

        tunnels.register(1, ours, outbound);
        tunnels
            .write(1, Bytes::from_static(b"forwarded"))
            .await
            .unwrap();
        tunnels.finish(1).await;

        let mut out = Vec::new();
        peer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"forwarded");
    }

    #[tokio::test]
    async fn test_socket_bytes_become_data_frames() {
        let tunnels = TunnelMap::new();
        let (outbound, mut outbound_rx) = mpsc::channel(16);
        let (mut peer, ours) = socket_pair().await;

        tunnels.register(7, ours, outbound);
        peer.write_all(b"hello").await.unwrap();

        let frame = outbound_rx.recv().await.unwrap();
        assert_eq!(frame.tunnel_id, 7);
        assert_eq!(frame.message, Message::Data(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn test_peer_eof_emits_close_and_evicts() {
        let tunnels = TunnelMap::new();
        let (outbound, mut outbound_rx) = mpsc::channel(16);
        let (peer, ours) = socket_pair().await;

        tunnels.register(3, ours, outbound);
        drop(peer);

        let frame = outbound_rx.recv().await.unwrap();
        assert_eq!(frame, Frame::close(3));
        assert_eq!(tunnels.len(), 0);
    }

    #[tokio::test]
    async fn test_write_to_unknown_tunnel_fails() {
        let tunnels = TunnelMap::new();
        assert!(tunnels.write(99, Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_close_all_discards_state() {
        let tunnels = TunnelMap::new();
        let (outbound, _rx) = mpsc::channel(16);
        let (_peer_a, a) = socket_pair().await;
        let (_peer_b, b) = socket_pair().await;
        tunnels.register(1, a, outbound.clone());
        tunnels.register(2, b, outbound);

        tunnels.close_all();
        assert_eq!(tunnels.len(), 0);
    }
}
