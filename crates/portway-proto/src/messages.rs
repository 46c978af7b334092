//! Protocol message types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum accepted payload length. Frames announcing more are rejected
/// and the channel is closed.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Transport protocol of a tunnel or rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(Proto::Tcp),
            "udp" => Some(Proto::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule fields an agent needs to run a locally-bound listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub rule_id: String,
    pub name: String,
    pub proto: Proto,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

/// A control-channel message. The discriminant codes are part of the wire
/// contract and never reorder.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Auth {
        token: String,
        name: String,
    },
    AuthAck {
        success: bool,
        agent_id: String,
        error: String,
    },
    Heartbeat,
    Connect {
        proto: Proto,
        host: String,
        port: u16,
    },
    ConnectAck {
        success: bool,
        error: String,
    },
    Data(Bytes),
    Close,
    UdpData {
        src_ip: String,
        src_port: u16,
        dst_ip: String,
        dst_port: u16,
        data: Bytes,
    },
    /// Reserved type; decoded as opaque bytes, never forwarded end-to-end.
    IcmpData(Bytes),
    RuleAssign(RuleSpec),
    RuleRevoke {
        rule_id: String,
    },
    /// Agent-initiated tunnel open for an assigned rule. The frame header
    /// carries the opener's session-local tunnel id.
    TunnelOpen {
        rule_id: String,
    },
}

impl Message {
    pub const AUTH: u8 = 1;
    pub const AUTH_ACK: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const CONNECT: u8 = 4;
    pub const CONNECT_ACK: u8 = 5;
    pub const DATA: u8 = 6;
    pub const CLOSE: u8 = 7;
    pub const UDP_DATA: u8 = 8;
    pub const ICMP_DATA: u8 = 9;
    pub const RULE_ASSIGN: u8 = 10;
    pub const RULE_REVOKE: u8 = 11;
    pub const TUNNEL_OPEN: u8 = 12;

    /// Wire type code of this message.
    pub fn kind(&self) -> u8 {
        match self {
            Message::Auth { .. } => Self::AUTH,
            Message::AuthAck { .. } => Self::AUTH_ACK,
            Message::Heartbeat => Self::HEARTBEAT,
            Message::Connect { .. } => Self::CONNECT,
            Message::ConnectAck { .. } => Self::CONNECT_ACK,
            Message::Data(_) => Self::DATA,
            Message::Close => Self::CLOSE,
            Message::UdpData { .. } => Self::UDP_DATA,
            Message::IcmpData(_) => Self::ICMP_DATA,
            Message::RuleAssign(_) => Self::RULE_ASSIGN,
            Message::RuleRevoke { .. } => Self::RULE_REVOKE,
            Message::TunnelOpen { .. } => Self::TUNNEL_OPEN,
        }
    }

    /// Short name for log lines.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "auth",
            Message::AuthAck { .. } => "auth-ack",
            Message::Heartbeat => "heartbeat",
            Message::Connect { .. } => "connect",
            Message::ConnectAck { .. } => "connect-ack",
            Message::Data(_) => "data",
            Message::Close => "close",
            Message::UdpData { .. } => "udp-data",
            Message::IcmpData(_) => "icmp-data",
            Message::RuleAssign(_) => "rule-assign",
            Message::RuleRevoke { .. } => "rule-revoke",
            Message::TunnelOpen { .. } => "tunnel-open",
        }
    }
}

/// One framed message: header tunnel id plus typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Tunnel this frame belongs to; 0 for channel-scoped messages.
    pub tunnel_id: u32,
    pub message: Message,
}

impl Frame {
    pub fn new(tunnel_id: u32, message: Message) -> Self {
        Self { tunnel_id, message }
    }

    pub fn auth(token: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(
            0,
            Message::Auth {
                token: token.into(),
                name: name.into(),
            },
        )
    }

    pub fn auth_ok(agent_id: impl Into<String>) -> Self {
        Self::new(
            0,
            Message::AuthAck {
                success: true,
                agent_id: agent_id.into(),
                error: String::new(),
            },
        )
    }

    pub fn auth_err(reason: impl Into<String>) -> Self {
        Self::new(
            0,
            Message::AuthAck {
                success: false,
                agent_id: String::new(),
                error: reason.into(),
            },
        )
    }

    pub fn heartbeat() -> Self {
        Self::new(0, Message::Heartbeat)
    }

    pub fn connect(tunnel_id: u32, proto: Proto, host: impl Into<String>, port: u16) -> Self {
        Self::new(
            tunnel_id,
            Message::Connect {
                proto,
                host: host.into(),
                port,
            },
        )
    }

    pub fn connect_ok(tunnel_id: u32) -> Self {
        Self::new(
            tunnel_id,
            Message::ConnectAck {
                success: true,
                error: String::new(),
            },
        )
    }

    pub fn connect_err(tunnel_id: u32, error: impl Into<String>) -> Self {
        Self::new(
            tunnel_id,
            Message::ConnectAck {
                success: false,
                error: error.into(),
            },
        )
    }

    pub fn data(tunnel_id: u32, data: Bytes) -> Self {
        Self::new(tunnel_id, Message::Data(data))
    }

    pub fn close(tunnel_id: u32) -> Self {
        Self::new(tunnel_id, Message::Close)
    }

    pub fn udp_data(
        src: (impl Into<String>, u16),
        dst: (impl Into<String>, u16),
        data: Bytes,
    ) -> Self {
        Self::new(
            0,
            Message::UdpData {
                src_ip: src.0.into(),
                src_port: src.1,
                dst_ip: dst.0.into(),
                dst_port: dst.1,
                data,
            },
        )
    }

    pub fn tunnel_open(local_id: u32, rule_id: impl Into<String>) -> Self {
        Self::new(
            local_id,
            Message::TunnelOpen {
                rule_id: rule_id.into(),
            },
        )
    }
}
