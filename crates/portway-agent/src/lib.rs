//! Portway agent runtime.
//!
//! An agent dials the cloud's control channel, authenticates with a token,
//! and then executes whatever the cloud asks of it: dialing targets for
//! cloud-opened tunnels, relaying datagrams, and running locally-bound
//! listeners for rules where this agent is the source. On channel loss all
//! local tunnel state is discarded and the agent reconnects with
//! exponential backoff.

mod agent;
mod local;
mod tunnels;

pub use agent::{Agent, AgentConfig, AgentError};
