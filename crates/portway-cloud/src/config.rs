//! Cloud server configuration

use portway_control::{Rule, Token};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Runtime configuration of the cloud server.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Address the control channel (and nothing else) listens on.
    pub listen_addr: String,
    /// URL path agents dial for the control channel.
    pub channel_path: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            channel_path: "/channel".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// YAML seed file: listen address plus the tokens and rules to load into
/// the store at boot.
#[derive(Debug, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default)]
    pub channel_path: Option<String>,
    #[serde(default)]
    pub tokens: Vec<Token>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl SeedFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portway_control::RuleKind;
    use portway_proto::Proto;

    #[test]
    fn test_seed_file_parses() {
        let yaml = r#"
addr: "127.0.0.1:9090"
tokens:
  - id: edge
    name: edge site
    secret: s3cret
rules:
  - id: ssh
    name: ssh to db host
    kind: cloud-to-agent
    proto: tcp
    listen_port: 2222
    target_agent_id: edge
    target_host: db.internal
    target_port: 22
    rate_limit: 1048576
"#;
        let seed: SeedFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(seed.addr.as_deref(), Some("127.0.0.1:9090"));
        assert_eq!(seed.tokens.len(), 1);
        assert_eq!(seed.tokens[0].secret, "s3cret");

        let rule = &seed.rules[0];
        assert_eq!(rule.kind, RuleKind::CloudToAgent);
        assert_eq!(rule.proto, Proto::Tcp);
        assert!(rule.enabled);
        assert_eq!(rule.rate_limit, 1048576);
        assert_eq!(rule.traffic_limit, 0);
    }

    #[test]
    fn test_default_config() {
        let config = CloudConfig::default();
        assert_eq!(config.channel_path, "/channel");
    }
}
