use async_trait::async_trait;
use dashmap::DashMap;
use ds_client::{ClientOptions, Credentials};
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf, time::Duration};
use tracing::{info, warn};

/// Key/value source used to fill in settings a flow file leaves out (credentials mostly).
#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("loaded settings from {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {}", env_file.display(), e),
            }
        } else {
            info!("no env file at {}, using the process environment", env_file.display());
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory settings, handy for tests and embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

pub const USER_KEY: &str = "DS_USER";
pub const PASSWORD_KEY: &str = "DS_PASSWORD";

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    6020
}
fn default_subscription_timeout() -> u64 {
    500
}
fn default_rpc_ack_timeout() -> u64 {
    6000
}
fn default_rpc_response_timeout() -> u64 {
    10000
}
fn default_reconnect_delay() -> u64 {
    5000
}

/// One backend server. Timeouts are in milliseconds.
///
/// Immutable once loaded: the flow wraps each config in an `Arc` and every step naming the
/// same `id` shares it, together with the connection the manager opens for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Filled from the key of the `servers` map when loaded from a flow.
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default = "default_subscription_timeout")]
    pub subscription_timeout: u64,
    #[serde(default = "default_rpc_ack_timeout")]
    pub rpc_ack_timeout: u64,
    #[serde(default = "default_rpc_response_timeout")]
    pub rpc_response_timeout: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
}

impl ServerConfig {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            credentials: None,
            subscription_timeout: default_subscription_timeout(),
            rpc_ack_timeout: default_rpc_ack_timeout(),
            rpc_response_timeout: default_rpc_response_timeout(),
            reconnect_delay: default_reconnect_delay(),
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay.as_millis() as u64;
        self
    }

    pub fn url(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            subscription_timeout: Duration::from_millis(self.subscription_timeout),
            rpc_ack_timeout: Duration::from_millis(self.rpc_ack_timeout),
            rpc_response_timeout: Duration::from_millis(self.rpc_response_timeout),
        }
    }

    /// Credentials used for login; empty ones when none were configured or resolved.
    pub fn login_credentials(&self) -> Credentials {
        self.credentials.clone().unwrap_or_default()
    }

    /// Fills in missing credentials from `DS_USER` / `DS_PASSWORD`.
    pub async fn resolve_credentials(&mut self, config: &ConfigManager) {
        if self.credentials.is_some() {
            return;
        }
        if let Some(username) = config.get(USER_KEY).await {
            let password = config.get(PASSWORD_KEY).await.unwrap_or_default();
            info!(server = %self.id, user = %username, "using credentials from configuration");
            self.credentials = Some(Credentials::new(username, password));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();
        assert_eq!(mgr.get("foo").await, None);

        mgr.insert("foo", "bar");
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));
        mgr.insert("foo", "baz");
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));
    }

    #[tokio::test]
    async fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "DSFLOW_TEST_API_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);
        assert_eq!(mgr.get("DSFLOW_TEST_API_KEY").await, Some("abc123".to_string()));
    }

    #[test]
    fn server_config_defaults() {
        let cfg: ServerConfig = serde_yaml_bw::from_str("host: ds.local").unwrap();
        assert_eq!(cfg.url(), "ds.local:6020");
        assert_eq!(cfg.client_options(), ClientOptions::default());
        assert_eq!(cfg.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(cfg.login_credentials(), Credentials::default());
    }

    #[tokio::test]
    async fn credentials_resolved_only_when_missing() {
        let map = MapConfigManager::new();
        map.insert(USER_KEY, "svc");
        map.insert(PASSWORD_KEY, "pw");
        let config = ConfigManager(map);

        let mut bare = ServerConfig::new("main", "localhost", 6020);
        bare.resolve_credentials(&config).await;
        assert_eq!(bare.credentials, Some(Credentials::new("svc", "pw")));

        let mut explicit = ServerConfig::new("main", "localhost", 6020).with_credentials("me", "mine");
        explicit.resolve_credentials(&config).await;
        assert_eq!(explicit.credentials, Some(Credentials::new("me", "mine")));
    }
}
