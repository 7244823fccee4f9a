//! Relay configuration.
//!
//! Loaded from a TOML file; every key has a default, so an empty file is a
//! valid single-process configuration backed by the in-memory store.
//! A few deployment-specific values can be overridden from the environment
//! (see [`RelayConfig::apply_env`]).
//!
//! # Example Configuration File
//!
//! ```toml
//! [store]
//! redis_url = "redis://127.0.0.1:6379"
//! key_prefix = "taskrelay"
//!
//! [ttl]
//! task_secs = 1209600
//!
//! [forwarder]
//! heartbeat_threshold_ms = 30000
//! max_submit_attempts = 5
//!
//! [rpc]
//! frontend = "0.0.0.0:50001"
//! backend = "0.0.0.0:50002"
//! retries = 3
//! execution_timeout_ms = 300000
//!
//! [geo]
//! enabled = false
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::forwarder::ForwarderConfig;
use crate::keys::{Keyspace, DEFAULT_PREFIX};
use crate::rpc::TcpConnector;
use crate::store::{MemoryStore, SharedStore};

/// Overrides the Redis URL.
pub const ENV_REDIS_URL: &str = "TASKRELAY_REDIS_URL";
/// Overrides the key prefix.
pub const ENV_KEY_PREFIX: &str = "TASKRELAY_KEY_PREFIX";
/// Overrides the broker frontend address.
pub const ENV_FRONTEND: &str = "TASKRELAY_FRONTEND";
/// Overrides the broker backend address.
pub const ENV_BACKEND: &str = "TASKRELAY_BACKEND";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Shared store connection.
    #[serde(default)]
    pub store: StoreConfig,
    /// Record lifetimes.
    #[serde(default)]
    pub ttl: TtlConfig,
    /// Forwarder timing.
    #[serde(default)]
    pub forwarder: ForwarderSection,
    /// RPC transport.
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Status log.
    #[serde(default)]
    pub status: StatusConfig,
    /// Geo-IP lookup.
    #[serde(default)]
    pub geo: GeoConfig,
}

/// `[store]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; the in-memory store is used when absent.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Prefix for every key.
    #[serde(default = "default_prefix")]
    pub key_prefix: String,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_prefix(),
        }
    }
}

impl StoreConfig {
    /// Opens the configured store.
    ///
    /// # Errors
    ///
    /// Connection failures, or a Redis URL when built without the `redis`
    /// feature.
    pub async fn open(&self) -> Result<SharedStore> {
        match &self.redis_url {
            None => Ok(Arc::new(MemoryStore::new())),
            #[cfg(feature = "redis")]
            Some(url) => Ok(Arc::new(crate::store::RedisStore::new(url).await?)),
            #[cfg(not(feature = "redis"))]
            Some(_) => Err(Error::Config(
                "redis_url is set but taskrelay was built without the `redis` feature".into(),
            )),
        }
    }
}

/// `[ttl]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlConfig {
    /// Task record lifetime in seconds.
    #[serde(default = "default_task_ttl")]
    pub task_secs: u64,
    /// Task group lifetime in seconds.
    #[serde(default = "default_group_ttl")]
    pub group_secs: u64,
}

fn default_task_ttl() -> u64 {
    crate::task::DEFAULT_TASK_TTL.as_secs()
}

fn default_group_ttl() -> u64 {
    crate::task::DEFAULT_GROUP_TTL.as_secs()
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            task_secs: default_task_ttl(),
            group_secs: default_group_ttl(),
        }
    }
}

impl TtlConfig {
    /// Task lifetime.
    pub fn task(&self) -> Duration {
        Duration::from_secs(self.task_secs)
    }

    /// Group lifetime.
    pub fn group(&self) -> Duration {
        Duration::from_secs(self.group_secs)
    }
}

/// `[forwarder]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderSection {
    /// Idle pull time before probing the backend.
    #[serde(default = "default_heartbeat_threshold")]
    pub heartbeat_threshold_ms: u64,
    /// Pause after a failed submission.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Time allowed for outstanding completions at shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    /// Rejected submissions tolerated before a task is failed.
    #[serde(default = "default_max_submit_attempts")]
    pub max_submit_attempts: u32,
}

fn default_heartbeat_threshold() -> u64 {
    30_000
}

fn default_retry_delay() -> u64 {
    500
}

fn default_shutdown_grace() -> u64 {
    10_000
}

fn default_max_submit_attempts() -> u32 {
    crate::forwarder::DEFAULT_MAX_SUBMIT_ATTEMPTS
}

impl Default for ForwarderSection {
    fn default() -> Self {
        Self {
            heartbeat_threshold_ms: default_heartbeat_threshold(),
            retry_delay_ms: default_retry_delay(),
            shutdown_grace_ms: default_shutdown_grace(),
            max_submit_attempts: default_max_submit_attempts(),
        }
    }
}

impl From<&ForwarderSection> for ForwarderConfig {
    fn from(section: &ForwarderSection) -> Self {
        Self {
            heartbeat_threshold: Duration::from_millis(section.heartbeat_threshold_ms),
            retry_delay: Duration::from_millis(section.retry_delay_ms),
            shutdown_grace: Duration::from_millis(section.shutdown_grace_ms),
            max_submit_attempts: section.max_submit_attempts,
        }
    }
}

/// `[rpc]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Client-facing broker address.
    #[serde(default = "default_frontend")]
    pub frontend: String,
    /// Worker-facing broker address.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Per-attempt reply timeout.
    #[serde(default = "default_rpc_timeout")]
    pub timeout_ms: u64,
    /// Attempts per request.
    #[serde(default = "default_rpc_retries")]
    pub retries: u32,
    /// Outstanding submissions per forwarder.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// How long a task may run on an endpoint before its reply is given up.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_ms: u64,
}

fn default_frontend() -> String {
    "127.0.0.1:50001".to_string()
}

fn default_backend() -> String {
    "127.0.0.1:50002".to_string()
}

fn default_rpc_timeout() -> u64 {
    crate::rpc::client::DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_rpc_retries() -> u32 {
    crate::rpc::client::DEFAULT_RETRIES
}

fn default_max_in_flight() -> usize {
    crate::forwarder::rpc_backend::DEFAULT_MAX_IN_FLIGHT
}

fn default_execution_timeout() -> u64 {
    crate::forwarder::rpc_backend::DEFAULT_EXECUTION_TIMEOUT.as_millis() as u64
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            frontend: default_frontend(),
            backend: default_backend(),
            timeout_ms: default_rpc_timeout(),
            retries: default_rpc_retries(),
            max_in_flight: default_max_in_flight(),
            execution_timeout_ms: default_execution_timeout(),
        }
    }
}

impl RpcConfig {
    /// Connector for the broker frontend.
    pub fn connector(&self) -> TcpConnector {
        TcpConnector::new(self.frontend.clone())
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_retries(self.retries)
    }

    /// Execution timeout for submitted tasks.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

/// `[status]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Heartbeats kept per endpoint.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// An endpoint is online if it heartbeated within this many seconds.
    #[serde(default = "default_liveness_threshold")]
    pub liveness_threshold_secs: u64,
}

fn default_capacity() -> usize {
    crate::status_log::DEFAULT_CAPACITY
}

fn default_liveness_threshold() -> u64 {
    120
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            liveness_threshold_secs: default_liveness_threshold(),
        }
    }
}

/// `[geo]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoConfig {
    /// Whether forwarders look up their endpoint's location.
    #[serde(default)]
    pub enabled: bool,
    /// Lookup service base URL.
    #[serde(default = "default_geo_url")]
    pub base_url: String,
}

fn default_geo_url() -> String {
    "https://ipinfo.io".to_string()
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_geo_url(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `TASKRELAY_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Applies overrides from `lookup`; empty values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());
        if let Some(url) = lookup(ENV_REDIS_URL) {
            self.store.redis_url = Some(url);
        }
        if let Some(prefix) = lookup(ENV_KEY_PREFIX) {
            self.store.key_prefix = prefix;
        }
        if let Some(frontend) = lookup(ENV_FRONTEND) {
            self.rpc.frontend = frontend;
        }
        if let Some(backend) = lookup(ENV_BACKEND) {
            self.rpc.backend = backend;
        }
    }

    /// Rejects values no component can work with.
    pub fn validate(&self) -> Result<()> {
        if self.store.key_prefix.is_empty() {
            return Err(Error::Config("store.key_prefix must not be empty".into()));
        }
        if self.rpc.retries == 0 {
            return Err(Error::Config("rpc.retries must be at least 1".into()));
        }
        if self.status.capacity == 0 {
            return Err(Error::Config("status.capacity must be at least 1".into()));
        }
        if self.forwarder.heartbeat_threshold_ms == 0 {
            return Err(Error::Config(
                "forwarder.heartbeat_threshold_ms must be positive".into(),
            ));
        }
        if self.forwarder.max_submit_attempts == 0 {
            return Err(Error::Config(
                "forwarder.max_submit_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Keyspace for the configured prefix.
    pub fn keyspace(&self) -> Keyspace {
        Keyspace::new(self.store.key_prefix.clone())
    }

    /// Forwarder timing.
    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig::from(&self.forwarder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    use crate::store::Store;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RelayConfig::from_toml("").unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.store.redis_url, None);
        assert_eq!(config.keyspace().prefix(), "taskrelay");
        assert_eq!(config.ttl.task(), crate::task::DEFAULT_TASK_TTL);
        assert_eq!(config.forwarder_config(), ForwarderConfig::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = RelayConfig::from_toml(
            r#"
            [rpc]
            frontend = "10.0.0.1:6000"
            retries = 5

            [forwarder]
            heartbeat_threshold_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.rpc.frontend, "10.0.0.1:6000");
        assert_eq!(config.rpc.retries, 5);
        assert_eq!(config.rpc.backend, "127.0.0.1:50002");
        assert_eq!(
            config.forwarder_config().heartbeat_threshold,
            Duration::from_secs(1)
        );
        assert_eq!(config.forwarder.retry_delay_ms, 500);
        assert_eq!(config.forwarder_config().max_submit_attempts, 5);
        assert_eq!(config.rpc.execution_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = RelayConfig::from_toml("[rpc]\nretries = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("retries")));

        let err = RelayConfig::from_toml("[store]\nkey_prefix = 7\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = RelayConfig::default();
        let env: HashMap<&str, &str> = [
            (ENV_REDIS_URL, "redis://cache:6379"),
            (ENV_KEY_PREFIX, "staging"),
            (ENV_FRONTEND, ""),
        ]
        .into_iter()
        .collect();
        config.apply_env_from(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.store.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.store.key_prefix, "staging");
        assert_eq!(config.rpc.frontend, "127.0.0.1:50001");
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[status]\ncapacity = 10\n[geo]\nenabled = true").unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.status.capacity, 10);
        assert!(config.geo.enabled);
        assert_eq!(config.geo.base_url, "https://ipinfo.io");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RelayConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("absent.toml")));
    }

    #[tokio::test]
    async fn default_store_is_in_memory() {
        let store = RelayConfig::default().store.open().await.unwrap();
        assert!(!store.exists("anything").await.unwrap());
    }
}
