//! Control-channel server and session lifecycle

use crate::config::CloudConfig;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use portway_control::{
    AgentRegistry, AgentSession, ControlError, Forwarder, PendingAcks, SessionHandler,
    StatsSnapshot, Store, TrafficStats, TunnelTable,
};
use portway_proto::{Frame, FrameCodec, Message};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Deadline for the first (auth) frame on a fresh channel.
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Cloud→agent heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Sessions with no inbound frames for this long are reaped.
const SESSION_TIMEOUT: Duration = Duration::from_secs(90);

/// Cadence of the traffic flush and UDP flow sweep.
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Cadence of the liveness reaper.
const REAP_INTERVAL: Duration = Duration::from_secs(15);

/// The cloud server: accepts agent control channels and executes rules.
pub struct CloudServer {
    config: CloudConfig,
    store: Arc<dyn Store>,
    registry: AgentRegistry,
    tunnels: Arc<TunnelTable>,
    stats: Arc<TrafficStats>,
    forwarder: Forwarder,
    handler: SessionHandler,
    listener: TcpListener,
}

impl CloudServer {
    /// Bind the control-channel listener and assemble the control plane.
    pub async fn bind(config: CloudConfig, store: Arc<dyn Store>) -> Result<Self, ControlError> {
        let listener = TcpListener::bind(&config.listen_addr).await?;

        let registry = AgentRegistry::new();
        let tunnels = Arc::new(TunnelTable::new());
        let pending = PendingAcks::new();
        let stats = Arc::new(TrafficStats::new());
        let forwarder = Forwarder::new(
            store.clone(),
            registry.clone(),
            tunnels.clone(),
            pending,
            stats.clone(),
        );
        let handler = SessionHandler::new(forwarder.clone());

        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            path = %config.channel_path,
            "control channel listening"
        );

        Ok(Self {
            config,
            store,
            registry,
            tunnels,
            stats,
            forwarder,
            handler,
            listener,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("listener has local addr")
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn tunnels(&self) -> &Arc<TunnelTable> {
        &self.tunnels
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Restore enabled rules from the store, start the background loops,
    /// and serve control channels until the task is cancelled.
    pub async fn run(self: Arc<Self>) -> Result<(), ControlError> {
        self.forwarder.restore().await?;

        let maintenance = {
            let server = self.clone();
            tokio::spawn(async move {
                let mut flush = tokio::time::interval(FLUSH_INTERVAL);
                let mut reap = tokio::time::interval(REAP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = flush.tick() => {
                            server.forwarder.flush().await;
                            let snap = server.stats.snapshot();
                            debug!(
                                tx_total = snap.tx_total,
                                rx_total = snap.rx_total,
                                tx_per_sec = snap.tx_per_sec,
                                rx_per_sec = snap.rx_per_sec,
                                agents = server.registry.count(),
                                tunnels = server.tunnels.len(),
                                "traffic snapshot"
                            );
                        }
                        _ = reap.tick() => server.reap_sessions().await,
                    }
                }
            })
        };

        let _maintenance = maintenance;
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_socket(stream, peer).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "control accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Stop every rule and flush counters. Called on shutdown.
    pub async fn shutdown(&self) {
        for state in self.forwarder.rule_states() {
            let _ = self.forwarder.stop_rule(&state.rule.id).await;
        }
        for session in self.registry.list() {
            self.handler.teardown_session(&session).await;
        }
    }

    /// Enable a rule: persist the flag, start execution, and push the
    /// assignment to the source agent if one is connected.
    pub async fn enable_rule(&self, rule_id: &str) -> Result<(), ControlError> {
        let mut rule = self.store.get_rule(rule_id).await?;
        rule.enabled = true;
        self.store.update_rule(rule.clone()).await?;
        self.forwarder.start_rule(rule.clone()).await?;

        if rule.kind.is_agent_sourced() {
            if let Some(source) = rule.source_agent_id.as_deref() {
                if let Some(session) = self.registry.get(source) {
                    for frame in self.forwarder.assignments_for(source) {
                        let _ = session.send(frame).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Disable a rule: stop execution, persist the flag, and revoke the
    /// assignment from the source agent.
    pub async fn disable_rule(&self, rule_id: &str) -> Result<(), ControlError> {
        let mut rule = self.store.get_rule(rule_id).await?;
        rule.enabled = false;
        self.store.update_rule(rule.clone()).await?;
        self.forwarder.stop_rule(rule_id).await?;

        if rule.kind.is_agent_sourced() {
            if let Some(source) = rule.source_agent_id.as_deref() {
                if let Some(session) = self.registry.get(source) {
                    let _ = session
                        .send(Frame::new(
                            0,
                            Message::RuleRevoke {
                                rule_id: rule_id.to_string(),
                            },
                        ))
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn reap_sessions(&self) {
        for session in self.registry.list() {
            if session.idle_for() > SESSION_TIMEOUT {
                warn!(
                    agent_id = %session.agent_id,
                    idle = ?session.idle_for(),
                    "session missed heartbeats, reaping"
                );
                self.handler.teardown_session(&session).await;
            }
        }
    }

    /// One inbound control-channel socket: WebSocket upgrade, auth
    /// handshake, then the session's reader loop.
    async fn handle_socket(&self, stream: TcpStream, peer: SocketAddr) {
        let conn_id = format!("ch-{}", uuid::Uuid::new_v4());
        debug!(conn_id = %conn_id, peer = %peer, "incoming control connection");

        let expected_path = self.config.channel_path.clone();
        let callback = |req: &Request, response: Response| {
            let path = req.uri().path();
            if path == expected_path || path == format!("{}/", expected_path) {
                Ok(response)
            } else {
                let response = Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(None)
                    .unwrap();
                Err(response)
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(conn_id = %conn_id, peer = %peer, error = %e, "websocket handshake failed");
                return;
            }
        };

        if let Some((session, mut stream)) = self.authenticate(ws, peer).await {
            let result = self.read_loop(&session, &mut stream).await;
            if let Err(e) = result {
                warn!(agent_id = %session.agent_id, error = %e, "session failed");
            }
            self.handler.teardown_session(&session).await;
        }
    }

    /// Expect `Auth` as the first frame; on success register the session,
    /// start its writer task, ack, and push rule assignments.
    async fn authenticate(
        &self,
        ws: WebSocketStream<TcpStream>,
        peer: SocketAddr,
    ) -> Option<(
        Arc<AgentSession>,
        futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    )> {
        let (mut sink, mut stream) = ws.split();

        let (token, name) = loop {
            let msg = match tokio::time::timeout(AUTH_TIMEOUT, stream.next()).await {
                Err(_) | Ok(None) => {
                    debug!(peer = %peer, "channel closed before auth");
                    return None;
                }
                Ok(Some(Err(e))) => {
                    debug!(peer = %peer, error = %e, "channel error before auth");
                    return None;
                }
                Ok(Some(Ok(msg))) => msg,
            };
            let data = match msg {
                WsMessage::Binary(data) => data,
                WsMessage::Close(_) => return None,
                _ => continue,
            };
            match FrameCodec::decode_message(&data) {
                Ok(Frame {
                    message: Message::Auth { token, name },
                    ..
                }) => break (token, name),
                Ok(frame) => {
                    warn!(peer = %peer, kind = frame.message.kind_name(), "expected auth frame");
                    let _ = send_frame(&mut sink, &Frame::auth_err("auth required")).await;
                    return None;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "malformed auth frame");
                    return None;
                }
            }
        };

        let token = match self.store.validate(&token).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                info!(peer = %peer, "auth failed: unknown token");
                let _ = send_frame(&mut sink, &Frame::auth_err("invalid token")).await;
                let _ = sink.close().await;
                return None;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "token lookup failed");
                let _ = send_frame(&mut sink, &Frame::auth_err("token store unavailable")).await;
                let _ = sink.close().await;
                return None;
            }
        };

        // Agent identity is the token's: one agent per token, and a
        // reconnect under the same token replaces the stale session.
        let agent_id = token.id.clone();
        let name = if name.is_empty() {
            token.name.clone()
        } else {
            name
        };

        let (session, outbound_rx, close_rx) =
            AgentSession::new(agent_id.clone(), name, peer);
        self.registry.register(session.clone());
        spawn_session_writer(agent_id.clone(), sink, outbound_rx, close_rx);

        if session.send(Frame::auth_ok(&agent_id)).await.is_err() {
            self.handler.teardown_session(&session).await;
            return None;
        }
        for frame in self.forwarder.assignments_for(&agent_id) {
            let _ = session.send(frame).await;
        }
        if let Err(e) = self.store.increment_usage(&token.id).await {
            debug!(token = %token.id, error = %e, "usage increment failed");
        }

        Some((session, stream))
    }

    /// Per-session reader: decode frames and hand them to the dispatcher
    /// until the channel dies, the session is force-closed, or the peer
    /// violates the protocol.
    async fn read_loop(
        &self,
        session: &Arc<AgentSession>,
        stream: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    ) -> Result<(), ControlError> {
        let mut closed = session.close_signal();
        loop {
            let msg = tokio::select! {
                _ = closed.changed() => return Ok(()),
                msg = stream.next() => msg,
            };
            let msg = match msg {
                None => return Ok(()),
                Some(Err(e)) => {
                    debug!(agent_id = %session.agent_id, error = %e, "channel read error");
                    return Ok(());
                }
                Some(Ok(msg)) => msg,
            };
            let data = match msg {
                WsMessage::Binary(data) => data,
                WsMessage::Close(_) => return Ok(()),
                WsMessage::Ping(_) | WsMessage::Pong(_) => {
                    session.touch();
                    continue;
                }
                _ => continue,
            };

            let mut buf = BytesMut::from(&data[..]);
            loop {
                match FrameCodec::decode(&mut buf) {
                    Ok(Some(frame)) => self.handler.dispatch(session, frame).await?,
                    Ok(None) if buf.is_empty() => break,
                    Ok(None) => {
                        return Err(ControlError::ProtocolViolation("truncated frame"));
                    }
                    Err(e) => {
                        warn!(agent_id = %session.agent_id, error = %e, "malformed frame");
                        return Err(ControlError::ProtocolViolation("malformed frame"));
                    }
                }
            }
        }
    }
}

/// The session's single writer: drains the outbound queue into the sink
/// and keeps the heartbeat flowing. Ends when the queue closes, the
/// session is force-closed, or the sink errors.
fn spawn_session_writer(
    agent_id: String,
    mut sink: futures_util::stream::SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    mut close_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        loop {
            let frame = tokio::select! {
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = heartbeat.tick() => Frame::heartbeat(),
                _ = close_rx.changed() => break,
            };
            let data = match FrameCodec::encode(&frame) {
                Ok(data) => data,
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "dropping unencodable frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Binary(data.to_vec())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
        debug!(agent_id = %agent_id, "session writer ended");
    });
}

async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    frame: &Frame,
) -> Result<(), ()> {
    let data = FrameCodec::encode(frame).map_err(|_| ())?;
    sink.send(WsMessage::Binary(data.to_vec()))
        .await
        .map_err(|_| ())
}
