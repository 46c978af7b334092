use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by the control plane.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("agent {0} is not connected")]
    AgentNotConnected(String),

    #[error("control channel to agent {0} is closed")]
    ChannelClosed(String),

    #[error("outbound queue for agent {0} stalled")]
    ChannelStalled(String),

    #[error("tunnel {0} is gone")]
    TunnelGone(u32),

    #[error("tunnel {0} writer stalled")]
    TunnelStalled(u32),

    #[error("timed out waiting for connect ack on tunnel {0}")]
    ConnectTimeout(u32),

    #[error("peer refused tunnel {tunnel_id}: {reason}")]
    ConnectRefused { tunnel_id: u32, reason: String },

    #[error("rule {0} not found")]
    RuleNotFound(String),

    #[error("rule {0} is already running")]
    RuleAlreadyRunning(String),

    #[error("rule {0} is not active")]
    RuleInactive(String),

    #[error("traffic limit exceeded for rule {0}")]
    TrafficLimitExceeded(String),

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol violation: unexpected {0} frame")]
    ProtocolViolation(&'static str),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
