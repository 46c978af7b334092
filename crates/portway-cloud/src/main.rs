//! Portway cloud CLI
//!
//! Runs the central server: the agent control channel plus one public
//! listener per enabled rule. Rules and tokens come from a YAML seed file
//! or the --token shortcut; the management plane owns real persistence.

use anyhow::{Context, Result};
use clap::Parser;
use portway_cloud::{CloudConfig, CloudServer, SeedFile};
use portway_control::{MemStore, Store, Token};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portway cloud - reverse-tunneling port forwarder server
#[derive(Parser, Debug)]
#[command(name = "portway-cloud")]
#[command(about = "Portway cloud - reverse-tunneling port forwarder server")]
#[command(version)]
#[command(long_about = r#"
The cloud server terminates public listeners for forwarding rules and
mediates between agents holding outbound control channels.

EXAMPLES:
  # Quick start with a single agent token
  portway-cloud --addr 0.0.0.0:8080 --token $TOKEN

  # Load rules and tokens from a seed file
  portway-cloud --config cloud.yaml

ENVIRONMENT VARIABLES:
  PORTWAY_ADDR    Control-channel listen address
  PORTWAY_TOKEN   Agent token secret (quick-start mode)
"#)]
struct Args {
    /// Control-channel listen address
    #[arg(long, env = "PORTWAY_ADDR", default_value = "0.0.0.0:8080")]
    addr: String,

    /// Agent token secret; creates a single token named "default"
    #[arg(long, env = "PORTWAY_TOKEN")]
    token: Option<String>,

    /// Seed file (YAML) with tokens and rules
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
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

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let mut config = CloudConfig {
        listen_addr: args.addr,
        ..CloudConfig::default()
    };

    let seed = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            SeedFile::load(path).context("Failed to load seed file")?
        }
        None => SeedFile::default(),
    };
    if let Some(addr) = &seed.addr {
        config.listen_addr = addr.clone();
    }
    if let Some(path) = &seed.channel_path {
        config.channel_path = path.clone();
    }

    let mut tokens = seed.tokens;
    if let Some(secret) = args.token {
        tokens.push(Token {
            id: "default".to_string(),
            name: "default".to_string(),
            secret,
            usage_count: 0,
            created_at: chrono::Utc::now(),
        });
    }
    if tokens.is_empty() {
        anyhow::bail!("No agent tokens configured. Use --token or a seed file.");
    }

    let store: Arc<dyn Store> = Arc::new(MemStore::seeded(seed.rules, tokens));
    let server = Arc::new(
        CloudServer::bind(config, store)
            .await
            .context("Failed to bind control channel")?,
    );

    info!("Portway cloud listening on {}", server.local_addr());

    let run = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            server.shutdown().await;
        }
        result = run => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Server error: {:#}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Server task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}
