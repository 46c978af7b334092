//! Persistence boundary for rules and tokens
//!
//! The core consumes this trait; the real database lives behind it in the
//! management plane. [`MemStore`] is the in-process implementation used by
//! the default server mode and by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portway_proto::Proto;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Which endpoint binds the listener and which peer reaches the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleKind {
    /// Cloud binds a public port; the target agent dials the target.
    CloudToAgent,
    /// Cloud binds a public port and dials the target itself.
    CloudDirect,
    /// The source agent binds locally; the target is reachable from cloud.
    AgentToCloud,
    /// The source agent binds locally; the target agent dials the target.
    AgentToAgent,
}

impl RuleKind {
    /// Whether the listener for this rule lives on an agent.
    pub fn is_agent_sourced(&self) -> bool {
        matches!(self, RuleKind::AgentToCloud | RuleKind::AgentToAgent)
    }
}

/// An operator-declared forwarding policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub kind: RuleKind,
    pub proto: Proto,
    #[serde(default)]
    pub source_agent_id: Option<String>,
    pub listen_port: u16,
    #[serde(default)]
    pub target_agent_id: Option<String>,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Bytes per second; 0 = unlimited.
    #[serde(default)]
    pub rate_limit: u64,
    /// Total byte budget; 0 = unlimited.
    #[serde(default)]
    pub traffic_limit: u64,
    #[serde(default)]
    pub traffic_used: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

/// An authentication token an agent presents on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub name: String,
    pub secret: String,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rule {0} not found")]
    RuleNotFound(String),

    #[error("token {0} not found")]
    TokenNotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Operations the core needs from the rule/token store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_rules(&self) -> Result<Vec<Rule>, StoreError>;
    async fn get_rule(&self, id: &str) -> Result<Rule, StoreError>;
    async fn create_rule(&self, rule: Rule) -> Result<(), StoreError>;
    async fn update_rule(&self, rule: Rule) -> Result<(), StoreError>;
    async fn delete_rule(&self, id: &str) -> Result<(), StoreError>;
    /// Persist only the traffic counter; called on rule stop and from the
    /// periodic flush.
    async fn update_traffic_used(&self, id: &str, bytes: u64) -> Result<(), StoreError>;

    async fn list_tokens(&self) -> Result<Vec<Token>, StoreError>;
    async fn create_token(&self, token: Token) -> Result<(), StoreError>;
    async fn delete_token(&self, id: &str) -> Result<(), StoreError>;
    async fn increment_usage(&self, id: &str) -> Result<(), StoreError>;
    /// Resolve a presented secret to its token, or `None` when unknown.
    async fn validate(&self, secret: &str) -> Result<Option<Token>, StoreError>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemStore {
    rules: RwLock<HashMap<String, Rule>>,
    tokens: RwLock<HashMap<String, Token>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with rules and tokens, e.g. from a config file.
    pub fn seeded(rules: Vec<Rule>, tokens: Vec<Token>) -> Self {
        let store = Self::new();
        {
            let mut map = store.rules.write().unwrap();
            for rule in rules {
                map.insert(rule.id.clone(), rule);
            }
        }
        {
            let mut map = store.tokens.write().unwrap();
            for token in tokens {
                map.insert(token.id.clone(), token);
            }
        }
        store
    }
}

#[async_trait]
impl Store for MemStore {
    async fn list_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let mut rules: Vec<Rule> = self.rules.read().unwrap().values().cloned().collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rules)
    }

    async fn get_rule(&self, id: &str) -> Result<Rule, StoreError> {
        self.rules
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::RuleNotFound(id.to_string()))
    }

    async fn create_rule(&self, rule: Rule) -> Result<(), StoreError> {
        let mut rules = self.rules.write().unwrap();
        if rules.contains_key(&rule.id) {
            return Err(StoreError::AlreadyExists(rule.id));
        }
        rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    async fn update_rule(&self, rule: Rule) -> Result<(), StoreError> {
        let mut rules = self.rules.write().unwrap();
        if !rules.contains_key(&rule.id) {
            return Err(StoreError::RuleNotFound(rule.id));
        }
        rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    async fn delete_rule(&self, id: &str) -> Result<(), StoreError> {
        self.rules
            .write()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::RuleNotFound(id.to_string()))
    }

    async fn update_traffic_used(&self, id: &str, bytes: u64) -> Result<(), StoreError> {
        let mut rules = self.rules.write().unwrap();
        let rule = rules
            .get_mut(id)
            .ok_or_else(|| StoreError::RuleNotFound(id.to_string()))?;
        rule.traffic_used = bytes;
        Ok(())
    }

    async fn list_tokens(&self) -> Result<Vec<Token>, StoreError> {
        Ok(self.tokens.read().unwrap().values().cloned().collect())
    }

    async fn create_token(&self, token: Token) -> Result<(), StoreError> {
        let mut tokens = self.tokens.write().unwrap();
        if tokens.contains_key(&token.id) {
            return Err(StoreError::AlreadyExists(token.id));
        }
        tokens.insert(token.id.clone(), token);
        Ok(())
    }

    async fn delete_token(&self, id: &str) -> Result<(), StoreError> {
        self.tokens
            .write()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::TokenNotFound(id.to_string()))
    }

    async fn increment_usage(&self, id: &str) -> Result<(), StoreError> {
        let mut tokens = self.tokens.write().unwrap();
        let token = tokens
            .get_mut(id)
            .ok_or_else(|| StoreError::TokenNotFound(id.to_string()))?;
        token.usage_count += 1;
        Ok(())
    }

    async fn validate(&self, secret: &str) -> Result<Option<Token>, StoreError> {
        Ok(self
            .tokens
            .read()
            .unwrap()
            .values()
            .find(|t| t.secret == secret)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rule(id: &str) -> Rule {
        Rule {
            id: id.to_string(),
            name: format!("rule {id}"),
            kind: RuleKind::CloudToAgent,
            proto: Proto::Tcp,
            source_agent_id: None,
            listen_port: 19000,
            target_agent_id: Some("agent-a".to_string()),
            target_host: "127.0.0.1".to_string(),
            target_port: 17000,
            enabled: true,
            rate_limit: 0,
            traffic_limit: 0,
            traffic_used: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_rule_crud() {
        let store = MemStore::new();
        store.create_rule(sample_rule("r1")).await.unwrap();

        assert!(matches!(
            store.create_rule(sample_rule("r1")).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let mut rule = store.get_rule("r1").await.unwrap();
        rule.enabled = false;
        store.update_rule(rule).await.unwrap();
        assert!(!store.get_rule("r1").await.unwrap().enabled);

        store.delete_rule("r1").await.unwrap();
        assert!(store.get_rule("r1").await.is_err());
    }

    #[tokio::test]
    async fn test_traffic_used_update() {
        let store = MemStore::new();
        store.create_rule(sample_rule("r1")).await.unwrap();
        store.update_traffic_used("r1", 123456).await.unwrap();
        assert_eq!(store.get_rule("r1").await.unwrap().traffic_used, 123456);
    }

    #[tokio::test]
    async fn test_token_validate_and_usage() {
        let store = MemStore::new();
        store
            .create_token(Token {
                id: "t1".to_string(),
                name: "edge".to_string(),
                secret: "s3cret".to_string(),
                usage_count: 0,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let token = store.validate("s3cret").await.unwrap().unwrap();
        assert_eq!(token.id, "t1");
        assert!(store.validate("wrong").await.unwrap().is_none());

        store.increment_usage("t1").await.unwrap();
        let tokens = store.list_tokens().await.unwrap();
        assert_eq!(tokens[0].usage_count, 1);
    }
}
