//! Rule set retrieval.
//!
//! A [`RuleStore`] hands back the raw rule set document stored for a port.
//! Documents are fetched and decoded on every request, so edits in the
//! store take effect without restarting the responder.

use crate::config::{RuleSet, StoreConfig};
use crate::error::LookupError;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Source of raw rule set documents, keyed by listening port.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Human readable description used in logs.
    fn describe(&self) -> String;

    /// Fetch the document stored for `port`.
    async fn fetch(&self, port: u16) -> Result<Vec<u8>, LookupError>;
}

/// Fetch and decode the rule set for `port`, giving up after `timeout`.
pub async fn load_rule_set(
    store: &dyn RuleStore,
    port: u16,
    timeout: Duration,
) -> Result<RuleSet, LookupError> {
    let bytes = tokio::time::timeout(timeout, store.fetch(port))
        .await
        .map_err(|_| LookupError::Timeout(timeout))??;

    debug!(
        port,
        document = %String::from_utf8_lossy(&bytes),
        "Fetched rule set"
    );

    RuleSet::from_slice(port, &bytes)
}

/// Build the store selected in the configuration.
pub fn from_config(config: &StoreConfig) -> Result<Arc<dyn RuleStore>, LookupError> {
    match config {
        StoreConfig::Redis {
            url, key_prefix, ..
        } => Ok(Arc::new(RedisRuleStore::new(url, key_prefix.clone())?)),
        StoreConfig::Directory { path, .. } => Ok(Arc::new(DirectoryRuleStore::new(path.clone()))),
    }
}

/// Rule sets kept in redis as JSON strings under `<prefix><port>`.
pub struct RedisRuleStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisRuleStore {
    /// Create a store for the given connection URL.
    ///
    /// Only the URL is checked here; connections are opened per lookup.
    pub fn new(url: &str, key_prefix: String) -> Result<Self, LookupError> {
        let client = redis::Client::open(url)?;
        Ok(Self { client, key_prefix })
    }

    /// Redis key holding the rule set for `port`.
    pub fn key(&self, port: u16) -> String {
        format!("{}{}", self.key_prefix, port)
    }
}

#[async_trait]
impl RuleStore for RedisRuleStore {
    fn describe(&self) -> String {
        format!("redis {} (prefix {:?})", self.client.get_connection_info().addr, self.key_prefix)
    }

    async fn fetch(&self, port: u16) -> Result<Vec<u8>, LookupError> {
        let key = self.key(port);
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        debug!(key = %key, "Executing redis GET");
        let value: Option<Vec<u8>> = conn.get(&key).await?;
        value.ok_or(LookupError::NotFound { port })
    }
}

/// Rule sets kept on disk as `<dir>/<port>.json`.
pub struct DirectoryRuleStore {
    dir: PathBuf,
}

impl DirectoryRuleStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// File holding the rule set for `port`.
    pub fn file(&self, port: u16) -> PathBuf {
        self.dir.join(format!("{}.json", port))
    }
}

#[async_trait]
impl RuleStore for DirectoryRuleStore {
    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }

    async fn fetch(&self, port: u16) -> Result<Vec<u8>, LookupError> {
        let path = self.file(port);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LookupError::NotFound { port })
            }
            Err(e) => Err(LookupError::Unavailable(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// In-process store, mainly for embedding and tests.
#[derive(Default)]
pub struct MemoryRuleStore {
    documents: RwLock<HashMap<u16, Vec<u8>>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw document for `port`, replacing any previous one.
    pub async fn insert(&self, port: u16, document: impl Into<Vec<u8>>) {
        self.documents.write().await.insert(port, document.into());
    }

    /// Store a rule set for `port`.
    pub async fn insert_rules(&self, port: u16, rules: &RuleSet) -> Result<(), serde_json::Error> {
        let document = serde_json::to_vec(rules)?;
        self.insert(port, document).await;
        Ok(())
    }

    /// Remove the document for `port`.
    pub async fn remove(&self, port: u16) -> bool {
        self.documents.write().await.remove(&port).is_some()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn fetch(&self, port: u16) -> Result<Vec<u8>, LookupError> {
        self.documents
            .read()
            .await
            .get(&port)
            .cloned()
            .ok_or(LookupError::NotFound { port })
    }
}
