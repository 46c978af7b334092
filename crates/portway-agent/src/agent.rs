//! Control-channel client and dispatch loop

use crate::local::{LocalCtx, LocalRules, PendingOpens, UdpFlows};
use crate::tunnels::TunnelMap;
use futures_util::{SinkExt, StreamExt};
use portway_proto::{CodecError, Frame, FrameCodec, Message, Proto};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A channel with no inbound frames for this long is considered dead.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(90);
const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid server url {0:?} (expected ws:// or wss://)")]
    InvalidUrl(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("timed out connecting to cloud")]
    ConnectTimeout,

    #[error("authentication rejected: {0}")]
    AuthFailed(String),

    #[error("no auth ack from cloud")]
    AuthTimeout,

    #[error("control channel closed")]
    ChannelClosed,

    #[error("no frames from cloud for {0:?}")]
    ChannelIdle(Duration),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Cloud control-channel URL, e.g. `ws://cloud.example.com:8080/channel`.
    pub server_url: String,
    pub token: String,
    /// Display name shown to operators; defaults to the hostname.
    pub name: String,
}

/// The agent runtime. [`Agent::run`] maintains the control channel forever,
/// reconnecting with exponential backoff; [`Agent::run_session`] performs a
/// single connect-auth-serve cycle.
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let url = Url::parse(&config.server_url)
            .map_err(|_| AgentError::InvalidUrl(config.server_url.clone()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(AgentError::InvalidUrl(config.server_url.clone()));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Serve forever. Only an authentication rejection is terminal; every
    /// other failure reconnects with backoff (1 s doubling to 30 s, reset
    /// after a session that lasted).
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut backoff = RECONNECT_MIN;
        loop {
            let started = Instant::now();
            match self.run_session().await {
                Ok(()) => {
                    info!("control channel closed by cloud");
                    backoff = RECONNECT_MIN;
                }
                Err(AgentError::AuthFailed(reason)) => {
                    error!(%reason, "authentication rejected, giving up");
                    return Err(AgentError::AuthFailed(reason));
                }
                Err(e) => {
                    warn!(error = %e, "control channel lost");
                    if started.elapsed() > Duration::from_secs(60) {
                        backoff = RECONNECT_MIN;
                    }
                }
            }
            debug!(delay = ?backoff, "reconnecting");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    /// One connect-auth-serve cycle. All tunnel state is discarded when it
    /// returns; tunnels never resume across reconnects.
    pub async fn run_session(&self) -> Result<(), AgentError> {
        info!(server = %self.config.server_url, "connecting to cloud");
        let (ws, _response) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(self.config.server_url.as_str()),
        )
        .await
        .map_err(|_| AgentError::ConnectTimeout)?
        .map_err(|e| AgentError::Connect(e.to_string()))?;

        let (mut sink, mut stream) = ws.split();

        // Auth is the first frame on the wire in both directions.
        let auth = FrameCodec::encode(&Frame::auth(&self.config.token, &self.config.name))?;
        sink.send(WsMessage::Binary(auth.to_vec()))
            .await
            .map_err(|e| AgentError::Connect(e.to_string()))?;

        let agent_id = loop {
            let msg = match tokio::time::timeout(AUTH_TIMEOUT, stream.next()).await {
                Err(_) => return Err(AgentError::AuthTimeout),
                Ok(None) => return Err(AgentError::ChannelClosed),
                Ok(Some(Err(e))) => return Err(AgentError::Connect(e.to_string())),
                Ok(Some(Ok(msg))) => msg,
            };
            let data = match msg {
                WsMessage::Binary(data) => data,
                WsMessage::Close(_) => return Err(AgentError::ChannelClosed),
                _ => continue,
            };
            match FrameCodec::decode_message(&data)?.message {
                Message::AuthAck {
                    success: true,
                    agent_id,
                    ..
                } => break agent_id,
                Message::AuthAck { error, .. } => return Err(AgentError::AuthFailed(error)),
                other => {
                    return Err(AgentError::Protocol(format!(
                        "expected auth ack, got {}",
                        other.kind_name()
                    )))
                }
            }
        };
        info!(agent_id = %agent_id, name = %self.config.name, "authenticated");

        // Single writer task: queued frames plus our heartbeat.
        let (outbound, mut outbound_rx) = mpsc::channel::<Frame>(256);
        let writer = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            loop {
                let frame = tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = heartbeat.tick() => Frame::heartbeat(),
                };
                let data = match FrameCodec::encode(&frame) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if sink.send(WsMessage::Binary(data.to_vec())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let tunnels = TunnelMap::new();
        let pending = PendingOpens::default();
        let flows = UdpFlows::default();
        let locals = LocalRules::new();
        let ctx = LocalCtx::new(
            outbound.clone(),
            tunnels.clone(),
            pending.clone(),
            flows.clone(),
        );

        let result = self
            .dispatch_loop(&mut stream, &outbound, &tunnels, &pending, &flows, &locals, &ctx)
            .await;

        // Channel gone: discard all local state.
        locals.stop_all();
        tunnels.close_all();
        writer.abort();

        result
    }

    async fn dispatch_loop<S>(
        &self,
        stream: &mut S,
        outbound: &mpsc::Sender<Frame>,
        tunnels: &TunnelMap,
        pending: &PendingOpens,
        flows: &UdpFlows,
        locals: &LocalRules,
        ctx: &LocalCtx,
    ) -> Result<(), AgentError>
    where
        S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = match tokio::time::timeout(LIVENESS_TIMEOUT, stream.next()).await {
                Err(_) => return Err(AgentError::ChannelIdle(LIVENESS_TIMEOUT)),
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(AgentError::Connect(e.to_string())),
                Ok(Some(Ok(msg))) => msg,
            };

            let data = match msg {
                WsMessage::Binary(data) => data,
                WsMessage::Close(_) => return Ok(()),
                _ => continue,
            };

            let frame = FrameCodec::decode_message(&data)?;
            self.handle_frame(frame, outbound, tunnels, pending, flows, locals, ctx)
                .await?;
        }
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        outbound: &mpsc::Sender<Frame>,
        tunnels: &TunnelMap,
        pending: &PendingOpens,
        flows: &UdpFlows,
        locals: &LocalRules,
        ctx: &LocalCtx,
    ) -> Result<(), AgentError> {
        match frame.message {
            Message::Heartbeat => {
                flows.sweep();
                Ok(())
            }

            Message::Connect { proto, host, port } => {
                let tunnel_id = frame.tunnel_id;
                let outbound = outbound.clone();
                let tunnels = tunnels.clone();
                tokio::spawn(async move {
                    handle_connect(tunnel_id, proto, host, port, outbound, tunnels).await;
                });
                Ok(())
            }

            Message::ConnectAck { success, error } => {
                let local_id = frame.tunnel_id;
                match pending.take(local_id) {
                    Some((stream, rule_id)) if success => {
                        info!(local_id, rule = %rule_id, "local tunnel established");
                        tunnels.register(local_id, stream, outbound.clone());
                    }
                    Some((_, rule_id)) => {
                        debug!(local_id, rule = %rule_id, error = %error, "tunnel open refused");
                    }
                    None => {
                        debug!(local_id, "late connect ack ignored");
                    }
                }
                Ok(())
            }

            Message::Data(data) => {
                if data.is_empty() {
                    return Ok(());
                }
                let tunnel_id = frame.tunnel_id;
                if tunnels.write(tunnel_id, data).await.is_err() {
                    if tunnels.close(tunnel_id) {
                        let _ = outbound.send(Frame::close(tunnel_id)).await;
                    }
                }
                Ok(())
            }

            Message::Close => {
                if pending.take(frame.tunnel_id).is_some() {
                    return Ok(());
                }
                tunnels.finish(frame.tunnel_id).await;
                tunnels.close(frame.tunnel_id);
                Ok(())
            }

            Message::UdpData {
                src_ip,
                src_port,
                dst_ip,
                dst_port,
                data,
            } => {
                let dst_addr = format!("{dst_ip}:{dst_port}");
                if flows.deliver_local_reply(&dst_addr, &data).await {
                    return Ok(());
                }
                flows
                    .forward_to_target(
                        (src_ip, src_port),
                        (dst_ip, dst_port),
                        data,
                        outbound.clone(),
                    )
                    .await;
                Ok(())
            }

            Message::RuleAssign(spec) => {
                locals.assign(spec, ctx.clone()).await;
                Ok(())
            }

            Message::RuleRevoke { rule_id } => {
                locals.revoke(&rule_id);
                Ok(())
            }

            Message::IcmpData(_) => {
                debug!("icmp forwarding not implemented, frame dropped");
                Ok(())
            }

            other @ (Message::Auth { .. }
            | Message::AuthAck { .. }
            | Message::TunnelOpen { .. }) => Err(AgentError::Protocol(format!(
                "unexpected {} frame",
                other.kind_name()
            ))),
        }
    }
}

/// Dial the target for a cloud-opened tunnel and acknowledge. The ack is
/// queued before the socket reader starts, so it cannot be overtaken by
/// `Data` frames on the single writer.
async fn handle_connect(
    tunnel_id: u32,
    proto: Proto,
    host: String,
    port: u16,
    outbound: mpsc::Sender<Frame>,
    tunnels: TunnelMap,
) {
    if proto != Proto::Tcp {
        let _ = outbound
            .send(Frame::connect_err(tunnel_id, "udp flows use datagram frames"))
            .await;
        return;
    }

    let addr = format!("{host}:{port}");
    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            if outbound.send(Frame::connect_ok(tunnel_id)).await.is_ok() {
                info!(tunnel_id, target = %addr, "tunnel target connected");
                tunnels.register(tunnel_id, stream, outbound);
            }
        }
        Ok(Err(e)) => {
            debug!(tunnel_id, target = %addr, error = %e, "target dial failed");
            let _ = outbound
                .send(Frame::connect_err(tunnel_id, e.to_string()))
                .await;
        }
        Err(_) => {
            debug!(tunnel_id, target = %addr, "target dial timed out");
            let _ = outbound
                .send(Frame::connect_err(tunnel_id, "dial timed out"))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let ok = AgentConfig {
            server_url: "ws://127.0.0.1:8080/channel".to_string(),
            token: "t".to_string(),
            name: "n".to_string(),
        };
        assert!(Agent::new(ok).is_ok());

        let wss = AgentConfig {
            server_url: "wss://cloud.example.com/channel".to_string(),
            token: "t".to_string(),
            name: "n".to_string(),
        };
        assert!(Agent::new(wss).is_ok());

        for bad in ["http://x.test/ws", "not a url", "tcp://1.2.3.4:1"] {
            let cfg = AgentConfig {
                server_url: bad.to_string(),
                token: "t".to_string(),
                name: "n".to_string(),
            };
            assert!(matches!(
                Agent::new(cfg),
                Err(AgentError::InvalidUrl(_))
            ));
        }
    }
}
