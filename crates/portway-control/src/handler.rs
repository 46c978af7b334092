//! Per-session frame dispatcher
//!
//! One reader task per session feeds decoded frames through
//! [`SessionHandler::dispatch`]. The dispatcher never performs unbounded
//! waits: socket writes go through bounded tunnel queues, relays through
//! bounded relay queues, and anything that can take longer (dialing a
//! target) is spawned. A dispatch error is a protocol violation and closes
//! the whole session.

use crate::error::ControlError;
use crate::forwarder::Forwarder;
use crate::registry::AgentSession;
use bytes::Bytes;
use portway_proto::{Frame, Message};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Routes inbound frames from authenticated sessions.
#[derive(Clone)]
pub struct SessionHandler {
    forwarder: Forwarder,
}

impl SessionHandler {
    pub fn new(forwarder: Forwarder) -> Self {
        Self { forwarder }
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// Handle one frame from `session`. `Err` means the session violated
    /// the protocol and must be closed; per-tunnel failures are handled
    /// internally and never propagate.
    pub async fn dispatch(
        &self,
        session: &Arc<AgentSession>,
        frame: Frame,
    ) -> Result<(), ControlError> {
        session.touch();

        match frame.message {
            Message::Heartbeat => Ok(()),

            Message::ConnectAck { success, error } => {
                let reply = if success {
                    crate::pending::ConnectReply::ok()
                } else {
                    crate::pending::ConnectReply::refused(error)
                };
                if !self.forwarder.pending.complete(frame.tunnel_id, reply) {
                    debug!(tunnel_id = frame.tunnel_id, "late connect ack ignored");
                }
                Ok(())
            }

            Message::Data(data) => {
                self.handle_data(session, frame.tunnel_id, data).await;
                Ok(())
            }

            Message::Close => {
                self.handle_close(session, frame.tunnel_id).await;
                Ok(())
            }

            Message::UdpData {
                src_ip,
                src_port,
                dst_ip,
                dst_port,
                data,
            } => {
                self.forwarder
                    .handle_udp_from_agent(session, (src_ip, src_port), (dst_ip, dst_port), data)
                    .await;
                Ok(())
            }

            Message::TunnelOpen { rule_id } => {
                // Dialing the target can take up to the full handshake
                // deadline; never on the reader task.
                let forwarder = self.forwarder.clone();
                let session = session.clone();
                let local_id = frame.tunnel_id;
                tokio::spawn(async move {
                    forwarder
                        .handle_tunnel_open(session, local_id, rule_id)
                        .await;
                });
                Ok(())
            }

            Message::IcmpData(_) => {
                debug!(agent_id = %session.agent_id, "icmp forwarding not implemented, frame dropped");
                Ok(())
            }

            // Channel-setup and cloud-originated messages are one-way;
            // seeing them here means the peer is broken or hostile.
            other @ (Message::Auth { .. }
            | Message::AuthAck { .. }
            | Message::Connect { .. }
            | Message::RuleAssign(_)
            | Message::RuleRevoke { .. }) => {
                warn!(
                    agent_id = %session.agent_id,
                    kind = other.kind_name(),
                    "unexpected frame, closing session"
                );
                Err(ControlError::ProtocolViolation(other.kind_name()))
            }
        }
    }

    /// `Data` from an agent: relayed tunnels first (id is scoped to the
    /// sending session), then cloud-held sockets in the tunnel table.
    async fn handle_data(&self, session: &Arc<AgentSession>, tunnel_id: u32, data: Bytes) {
        self.forwarder.stats.add_rx(data.len() as u64);

        if data.is_empty() {
            return;
        }
        if self.forwarder.relay_data(session, tunnel_id, data.clone()).await {
            return;
        }

        let Some(entry) = self.forwarder.tunnels.get(tunnel_id) else {
            debug!(tunnel_id, agent_id = %session.agent_id, "data for unknown tunnel");
            return;
        };
        if entry.agent_id != session.agent_id {
            debug!(
                tunnel_id,
                agent_id = %session.agent_id,
                owner = %entry.agent_id,
                "data for tunnel owned by another session"
            );
            return;
        }

        if entry.write(data).await.is_err() {
            self.forwarder.release_tunnel(tunnel_id, true).await;
        }
    }

    /// `Close` from an agent: drain what the tunnel already accepted, then
    /// shut it down without echoing a close back.
    async fn handle_close(&self, session: &Arc<AgentSession>, tunnel_id: u32) {
        if self.forwarder.relay_close(session, tunnel_id).await {
            return;
        }

        let Some(entry) = self.forwarder.tunnels.get(tunnel_id) else {
            return;
        };
        if entry.agent_id != session.agent_id {
            return;
        }
        entry.finish().await;
        self.forwarder.release_tunnel(tunnel_id, false).await;
    }

    /// Undo everything a dead session owned: its tunnels, its relay halves,
    /// and its UDP flows. Client-side sockets observe EOF immediately.
    pub async fn teardown_session(&self, session: &Arc<AgentSession>) {
        session.close();

        let tunnel_ids = session.tunnel_ids();
        info!(
            agent_id = %session.agent_id,
            tunnels = tunnel_ids.len(),
            "tearing down session"
        );

        for wire_id in tunnel_ids {
            if self.forwarder.has_relay(&session.agent_id, wire_id) {
                self.forwarder
                    .finish_relay(&session.agent_id, wire_id, false, false)
                    .await;
            } else {
                self.forwarder.release_tunnel(wire_id, false).await;
            }
        }

        self.forwarder.registry.unregister(session);
    }
}
