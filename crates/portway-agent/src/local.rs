//! Locally-bound listeners for assigned rules
//!
//! When the cloud assigns a rule whose source is this agent, the agent
//! binds the listen port itself. Accepted TCP connections run the
//! `TunnelOpen` handshake through the cloud; UDP datagrams are wrapped
//! with their addressing and relayed per-datagram.

use crate::tunnels::TunnelMap;
use bytes::Bytes;
use dashmap::DashMap;
use portway_proto::{Frame, Proto, RuleSpec};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// First id for agent-opened tunnels. The upper half of the id space stays
/// clear of cloud-allocated ids.
const LOCAL_ID_BASE: u32 = 0x8000_0000;

const OPEN_TIMEOUT: Duration = Duration::from_secs(30);
const UDP_BUF: usize = 64 * 1024;
const UDP_FLOW_IDLE: Duration = Duration::from_secs(60);

/// Rendezvous for `TunnelOpen` handshakes. The accepted socket parks here
/// until the cloud's `ConnectAck` lands; the dispatcher then adopts it
/// synchronously, so no data frame can slip in between ack and
/// registration.
#[derive(Clone, Default)]
pub(crate) struct PendingOpens {
    inner: Arc<DashMap<u32, PendingOpen>>,
}

struct PendingOpen {
    stream: tokio::net::TcpStream,
    rule_id: String,
}

impl PendingOpens {
    pub fn insert(&self, local_id: u32, stream: tokio::net::TcpStream, rule_id: String) {
        self.inner.insert(local_id, PendingOpen { stream, rule_id });
    }

    /// Claim the parked socket for a completed handshake.
    pub fn take(&self, local_id: u32) -> Option<(tokio::net::TcpStream, String)> {
        self.inner
            .remove(&local_id)
            .map(|(_, open)| (open.stream, open.rule_id))
    }

    /// Drop a handshake that never completed. Returns true if it was
    /// still parked (the socket closes with it).
    pub fn expire(&self, local_id: u32) -> bool {
        self.inner.remove(&local_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

struct LocalUdpFlow {
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    last_seen: Instant,
}

/// UDP state on one agent session: reply sockets for cloud-forwarded
/// datagrams and client flows of locally-bound UDP listeners.
#[derive(Clone, Default)]
pub(crate) struct UdpFlows {
    /// `(client addr, target addr)` → ephemeral socket used to reach the
    /// target on that client's behalf.
    forward: Arc<DashMap<(String, String), Arc<UdpSocket>>>,
    /// Client addr → the local listener socket that owns the flow.
    local: Arc<DashMap<String, LocalUdpFlow>>,
}

impl UdpFlows {
    /// Deliver a datagram the cloud forwarded to us: `send_to` the target
    /// from a per-source socket whose replies flow back as `UdpData`.
    pub async fn forward_to_target(
        &self,
        src: (String, u16),
        dst: (String, u16),
        data: Bytes,
        outbound: mpsc::Sender<Frame>,
    ) {
        let src_addr = format!("{}:{}", src.0, src.1);
        let dst_addr = format!("{}:{}", dst.0, dst.1);
        let key = (src_addr, dst_addr.clone());

        let sock = match self.forward.get(&key) {
            Some(sock) => sock.clone(),
            None => {
                let sock = match UdpSocket::bind("0.0.0.0:0").await {
                    Ok(s) => Arc::new(s),
                    Err(e) => {
                        warn!(error = %e, "udp reply socket bind failed");
                        return;
                    }
                };
                self.forward.insert(key.clone(), sock.clone());

                // Reply reader: wrap target responses with the addressing
                // reversed so the cloud's flow index routes them back.
                let reply_sock = sock.clone();
                let forward = self.forward.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; UDP_BUF];
                    loop {
                        match tokio::time::timeout(UDP_FLOW_IDLE, reply_sock.recv_from(&mut buf))
                            .await
                        {
                            Ok(Ok((n, _from))) => {
                                let frame = Frame::udp_data(
                                    dst.clone(),
                                    src.clone(),
                                    Bytes::copy_from_slice(&buf[..n]),
                                );
                                if outbound.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Err(_)) | Err(_) => break,
                        }
                    }
                    forward.remove(&key);
                });
                sock
            }
        };

        if let Err(e) = sock.send_to(&data, &dst_addr).await {
            debug!(target = %dst_addr, error = %e, "udp send failed");
        }
    }

    /// Deliver a reply addressed to a client of one of our local UDP
    /// listeners. Returns false when no such flow exists.
    pub async fn deliver_local_reply(&self, dst_addr: &str, data: &Bytes) -> bool {
        let flow = match self.local.get_mut(dst_addr) {
            Some(mut flow) => {
                flow.last_seen = Instant::now();
                (flow.socket.clone(), flow.client)
            }
            None => return false,
        };
        let _ = flow.0.send_to(data, flow.1).await;
        true
    }

    fn record_local(&self, socket: Arc<UdpSocket>, client: SocketAddr) {
        self.local.insert(
            client.to_string(),
            LocalUdpFlow {
                socket,
                client,
                last_seen: Instant::now(),
            },
        );
    }

    /// Drop idle flows. Called opportunistically from the heartbeat path.
    pub fn sweep(&self) {
        self.local
            .retain(|_, flow| flow.last_seen.elapsed() < UDP_FLOW_IDLE);
    }
}

/// Everything a local listener needs to open tunnels through the cloud.
#[derive(Clone)]
pub(crate) struct LocalCtx {
    pub outbound: mpsc::Sender<Frame>,
    pub tunnels: TunnelMap,
    pub pending: PendingOpens,
    pub flows: UdpFlows,
    pub next_local_id: Arc<AtomicU32>,
}

impl LocalCtx {
    pub fn new(
        outbound: mpsc::Sender<Frame>,
        tunnels: TunnelMap,
        pending: PendingOpens,
        flows: UdpFlows,
    ) -> Self {
        Self {
            outbound,
            tunnels,
            pending,
            flows,
            next_local_id: Arc::new(AtomicU32::new(LOCAL_ID_BASE)),
        }
    }

    fn alloc_local_id(&self) -> u32 {
        self.next_local_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Listeners for the rules currently assigned to this agent.
#[derive(Clone, Default)]
pub(crate) struct LocalRules {
    listeners: Arc<DashMap<String, tokio::task::JoinHandle<()>>>,
}

impl LocalRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the listener for an assigned rule.
    pub async fn assign(&self, spec: RuleSpec, ctx: LocalCtx) {
        if let Some((_, old)) = self.listeners.remove(&spec.rule_id) {
            old.abort();
        }

        let rule_id = spec.rule_id.clone();
        let task = match spec.proto {
            Proto::Tcp => {
                let listener = match TcpListener::bind(("0.0.0.0", spec.listen_port)).await {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(rule = %spec.rule_id, port = spec.listen_port, error = %e, "local bind failed");
                        return;
                    }
                };
                info!(rule = %spec.rule_id, port = spec.listen_port, "local tcp listener started");
                tokio::spawn(run_tcp_listener(listener, spec, ctx))
            }
            Proto::Udp => {
                let socket = match UdpSocket::bind(("0.0.0.0", spec.listen_port)).await {
                    Ok(s) => Arc::new(s),
                    Err(e) => {
                        warn!(rule = %spec.rule_id, port = spec.listen_port, error = %e, "local bind failed");
                        return;
                    }
                };
                info!(rule = %spec.rule_id, port = spec.listen_port, "local udp listener started");
                tokio::spawn(run_udp_listener(socket, spec, ctx))
            }
        };
        self.listeners.insert(rule_id, task);
    }

    pub fn revoke(&self, rule_id: &str) {
        if let Some((_, task)) = self.listeners.remove(rule_id) {
            task.abort();
            info!(rule = %rule_id, "local listener stopped");
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.revoke(&id);
        }
    }
}

async fn run_tcp_listener(listener: TcpListener, spec: RuleSpec, ctx: LocalCtx) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(rule = %spec.rule_id, error = %e, "local accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let spec = spec.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            open_local_tunnel(stream, peer, spec, ctx).await;
        });
    }
}

/// Start the handshake for one accepted connection: park the socket and
/// send `TunnelOpen`. The dispatcher adopts the socket when the ack
/// arrives; the expiry guard drops it if the ack never comes.
async fn open_local_tunnel(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    spec: RuleSpec,
    ctx: LocalCtx,
) {
    let local_id = ctx.alloc_local_id();
    debug!(rule = %spec.rule_id, local_id, client = %peer, "opening tunnel");
    ctx.pending.insert(local_id, stream, spec.rule_id.clone());

    if ctx
        .outbound
        .send(Frame::tunnel_open(local_id, spec.rule_id.clone()))
        .await
        .is_err()
    {
        ctx.pending.expire(local_id);
        return;
    }

    let pending = ctx.pending.clone();
    tokio::spawn(async move {
        tokio::time::sleep(OPEN_TIMEOUT).await;
        if pending.expire(local_id) {
            debug!(rule = %spec.rule_id, local_id, "tunnel open timed out");
        }
    });
}

async fn run_udp_listener(socket: Arc<UdpSocket>, spec: RuleSpec, ctx: LocalCtx) {
    let mut buf = vec![0u8; UDP_BUF];
    loop {
        let (n, client) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(rule = %spec.rule_id, error = %e, "local udp recv error");
                continue;
            }
        };

        ctx.flows.record_local(socket.clone(), client);

        let frame = Frame::udp_data(
            (client.ip().to_string(), client.port()),
            (spec.target_host.clone(), spec.target_port),
            Bytes::copy_from_slice(&buf[..n]),
        );
        if ctx.outbound.send(frame).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_opens_park_and_take() {
        let pending = PendingOpens::default();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        pending.insert(LOCAL_ID_BASE, accepted, "r1".to_string());
        assert_eq!(pending.len(), 1);

        let (_stream, rule_id) = pending.take(LOCAL_ID_BASE).expect("socket parked");
        assert_eq!(rule_id, "r1");
        assert!(pending.take(LOCAL_ID_BASE).is_none());
        assert!(!pending.expire(LOCAL_ID_BASE));
    }

    #[tokio::test]
    async fn test_local_ids_start_in_upper_half() {
        let (tx, _rx) = mpsc::channel(1);
        let ctx = LocalCtx::new(
            tx,
            TunnelMap::new(),
            PendingOpens::default(),
            UdpFlows::default(),
        );
        let first = ctx.alloc_local_id();
        let second = ctx.alloc_local_id();
        assert_eq!(first, LOCAL_ID_BASE);
        assert_eq!(second, LOCAL_ID_BASE + 1);
    }

    #[tokio::test]
    async fn test_local_udp_flow_reply_delivery() {
        let flows = UdpFlows::default();

        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        flows.record_local(listener.clone(), client_addr);

        let delivered = flows
            .deliver_local_reply(&client_addr.to_string(), &Bytes::from_static(b"pong"))
            .await;
        assert!(delivered);

        let mut buf = [0u8; 16];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, listener.local_addr().unwrap());

        assert!(
            !flows
                .deliver_local_reply("10.9.9.9:1", &Bytes::from_static(b"x"))
                .await
        );
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_flows() {
        let flows = UdpFlows::default();
        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        flows.record_local(listener, "127.0.0.1:9999".parse().unwrap());

        flows.sweep();
        assert!(flows.local.contains_key("127.0.0.1:9999"));

        flows
            .local
            .get_mut("127.0.0.1:9999")
            .unwrap()
            .last_seen = Instant::now() - Duration::from_secs(120);
        flows.sweep();
        assert!(!flows.local.contains_key("127.0.0.1:9999"));
    }
}
