//! Cloud-side control plane for portway.
//!
//! This crate holds everything the cloud process needs to turn rules into
//! listeners and listeners into tunnels: the persistence boundary, the agent
//! session registry, the tunnel table, the connect-ack rendezvous, rate
//! limiting, traffic accounting, the forwarder, and the per-session frame
//! dispatcher. Transport concerns (the WebSocket itself) live in the server
//! crate; this crate only ever sees decoded frames and outbound queues.

pub mod error;
pub mod forwarder;
pub mod handler;
pub mod limiter;
pub mod pending;
pub mod registry;
pub mod stats;
pub mod store;
pub mod tunnels;

pub use error::ControlError;
pub use forwarder::{Forwarder, RuleState};
pub use handler::SessionHandler;
pub use limiter::RateLimiter;
pub use pending::{ConnectReply, PendingAcks};
pub use registry::{AgentRegistry, AgentSession};
pub use stats::{StatsSnapshot, TrafficStats};
pub use store::{MemStore, Rule, RuleKind, Store, StoreError, Token};
pub use tunnels::{TunnelEntry, TunnelTable};
