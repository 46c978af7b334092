//! Portway agent CLI
//!
//! Connects to a portway cloud server and executes forwarding on its
//! behalf. The agent needs no inbound connectivity: everything flows over
//! the outbound control channel.

use anyhow::{Context, Result};
use clap::Parser;
use portway_agent::{Agent, AgentConfig};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portway agent - forwards traffic between the cloud and this network
#[derive(Parser, Debug)]
#[command(name = "portway-agent")]
#[command(about = "Portway agent - forwards traffic between the cloud and this network")]
#[command(version)]
#[command(long_about = r#"
The portway agent opens an outbound control channel to the cloud server
and then forwards TCP/UDP traffic in either direction: the cloud can ask
it to reach targets in this network, and rules sourced at this agent bind
local listen ports whose traffic rides back through the cloud.

EXAMPLES:
  # Connect with a token
  portway-agent --server ws://cloud.example.com:8080/channel --token $TOKEN

  # Use a config file
  portway-agent --config agent.yaml

ENVIRONMENT VARIABLES:
  PORTWAY_SERVER   Cloud control-channel URL
  PORTWAY_TOKEN    Authentication token
  PORTWAY_NAME     Agent display name
"#)]
struct Args {
    /// Cloud control-channel URL (e.g. ws://cloud.example.com:8080/channel)
    #[arg(long, env = "PORTWAY_SERVER")]
    server: Option<String>,

    /// Authentication token
    #[arg(long, env = "PORTWAY_TOKEN")]
    token: Option<String>,

    /// Agent display name (defaults to the hostname)
    #[arg(long, env = "PORTWAY_NAME")]
    name: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Merge CLI args over the config file; CLI wins.
fn build_agent_config(args: Args) -> Result<AgentConfig> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let server_url = args
        .server
        .or(file.server)
        .context("Server URL is required (use --server or config file)")?;
    let token = args
        .token
        .or(file.token)
        .context("Token is required (use --token or config file)")?;
    let name = args.name.or(file.name).unwrap_or_else(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
    });

    Ok(AgentConfig {
        server_url,
        token,
        name,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let config = build_agent_config(args).context("Failed to build agent configuration")?;
    info!("Agent name: {}", config.name);
    info!("Cloud server: {}", config.server_url);

    let agent = Agent::new(config).context("Failed to create agent")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = agent.run() => {
            if let Err(e) = result {
                error!("Agent error: {:#}", e);
                return Err(e.into());
            }
        }
    }

    Ok(())
}
