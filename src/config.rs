//! Configuration for the mock responder.
//!
//! Two kinds of configuration live here: the process configuration loaded
//! once from YAML (which rule store to use, logging switches), and the rule
//! documents fetched from that store on every request.

use crate::error::LookupError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Delimiter between segments of a body constraint path (`user->id`).
pub const PATH_DELIMITER: &str = "->";

/// URL pattern that matches any request path.
pub const WILDCARD: &str = "*";

/// Redis key prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "mock_server:";

/// Largest request body read for matching, in bytes.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Main configuration for the mock responder process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ResponderConfig {
    /// Where rule sets are fetched from
    #[serde(default)]
    pub store: StoreConfig,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl ResponderConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.store
            .validate()
            .map_err(|e| anyhow::anyhow!("store: {}", e))?;
        if self.settings.max_body_bytes == 0 {
            anyhow::bail!("settings: max_body_bytes must be greater than zero");
        }
        Ok(())
    }
}

/// Rule store selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Rule sets stored as JSON strings in redis, one key per port
    Redis {
        /// Connection URL
        #[serde(default = "default_redis_url")]
        url: String,
        /// Key prefix, the port number is appended
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
        /// Lookup timeout in milliseconds
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// Rule sets stored as `<path>/<port>.json`
    Directory {
        path: PathBuf,
        /// Lookup timeout in milliseconds
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Redis {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Validate the store selection.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            StoreConfig::Redis {
                url,
                key_prefix,
                timeout_ms,
            } => {
                if url.is_empty() {
                    anyhow::bail!("redis url cannot be empty");
                }
                if key_prefix.is_empty() {
                    anyhow::bail!("redis key_prefix cannot be empty");
                }
                check_timeout(*timeout_ms)
            }
            StoreConfig::Directory { path, timeout_ms } => {
                if path.as_os_str().is_empty() {
                    anyhow::bail!("directory path cannot be empty");
                }
                check_timeout(*timeout_ms)
            }
        }
    }

    /// Switch to a redis store at `url`, keeping the key prefix and timeout.
    pub fn with_redis_url(&self, url: String) -> Self {
        let key_prefix = match self {
            StoreConfig::Redis { key_prefix, .. } => key_prefix.clone(),
            StoreConfig::Directory { .. } => default_key_prefix(),
        };
        StoreConfig::Redis {
            url,
            key_prefix,
            timeout_ms: self.timeout_ms(),
        }
    }

    /// Switch to a directory store at `path`, keeping the timeout.
    pub fn with_directory(&self, path: PathBuf) -> Self {
        StoreConfig::Directory {
            path,
            timeout_ms: self.timeout_ms(),
        }
    }

    fn timeout_ms(&self) -> u64 {
        match self {
            StoreConfig::Redis { timeout_ms, .. } | StoreConfig::Directory { timeout_ms, .. } => {
                *timeout_ms
            }
        }
    }

    /// Bound on a single rule set lookup.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms())
    }
}

fn check_timeout(timeout_ms: u64) -> anyhow::Result<()> {
    if timeout_ms == 0 {
        anyhow::bail!("timeout_ms must be greater than zero");
    }
    Ok(())
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log all matched rules
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Request bodies larger than this are rejected
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// The ordered mock rules served on one listening port.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuleSet {
    /// Port the rules belong to
    #[serde(default, deserialize_with = "null_as_default")]
    pub port: u16,

    /// Rules in match order
    #[serde(default, deserialize_with = "null_as_default")]
    pub mocks: Vec<Rule>,
}

impl RuleSet {
    /// Decode a rule set document fetched for `port`.
    pub fn from_slice(port: u16, bytes: &[u8]) -> Result<Self, LookupError> {
        serde_json::from_slice(bytes).map_err(|source| LookupError::Malformed { port, source })
    }
}

/// A single mock rule.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Rule {
    /// Request path to match, surrounding slashes ignored (empty or `*` = any)
    #[serde(rename = "url", default, deserialize_with = "null_as_default")]
    pub url_pattern: String,

    /// HTTP method to match (empty = any)
    #[serde(default, deserialize_with = "null_as_default")]
    pub method: String,

    /// Expected values keyed by body path expression
    #[serde(rename = "reqBody", default, skip_serializing_if = "Option::is_none")]
    pub body_constraints: Option<BTreeMap<String, serde_json::Value>>,

    /// Canned response, returned as JSON
    #[serde(rename = "resp", default)]
    pub response: serde_json::Value,
}

impl Rule {
    /// Iterate the body constraints as `(path, expected)` pairs.
    pub fn constraints(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.body_constraints.iter().flatten()
    }
}
