//! Portway cloud server.
//!
//! Wires the control plane together: the WebSocket control-channel
//! listener, the auth handshake, per-session reader/writer tasks, rule
//! lifecycle (restore on boot, enable/disable at runtime), session
//! liveness, and the periodic traffic flush.

pub mod config;
pub mod server;

pub use config::{CloudConfig, SeedFile};
pub use server::CloudServer;
