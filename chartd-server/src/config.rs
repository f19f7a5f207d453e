//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CHARTD_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Event routing configuration.
    pub routing: RoutingConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self::default();

        // Load from file if specified
        if let Ok(path) = std::env::var("CHARTD_CONFIG") {
            config = Self::from_file(&path)?;
        }

        // Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, msg) => ConfigError::ParseError(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(PathBuf::from("<inline>"), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.storage.apply_env_overrides();
        self.routing.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        self.routing.validate()?;
        Ok(())
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Time allowed to read request headers, in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8002)),
            idle_timeout_secs: 30,
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("CHARTD_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("CHARTD_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("CHARTD_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Where relative resource names are fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Only absolute URLs and uploaded documents/archives.
    #[default]
    None,
    /// A local directory.
    Local,
    /// A bucket on an HTTP object store.
    ObjectStore,
}

/// Object store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    /// Base URL of the store.
    pub endpoint: Option<String>,
    /// Bucket holding one prefix per definition.
    pub bucket: Option<String>,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend for relative resource names.
    pub backend: BackendKind,
    /// Root directory for the local backend.
    pub local_root: PathBuf,
    /// Object store settings.
    pub object_store: ObjectStoreConfig,
    /// Archive extraction root, wiped on start.
    pub workspace_dir: PathBuf,
    /// Entry document name inside an archive or store prefix.
    pub entry_document: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::None,
            local_root: PathBuf::from("./charts"),
            object_store: ObjectStoreConfig::default(),
            workspace_dir: PathBuf::from("./tmp"),
            entry_document: "index.json".to_string(),
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(backend) = std::env::var("CHARTD_STORAGE_BACKEND") {
            self.backend = match backend.to_lowercase().as_str() {
                "local" => BackendKind::Local,
                "object_store" | "objectstore" | "s3" => BackendKind::ObjectStore,
                _ => BackendKind::None,
            };
        }

        if let Ok(dir) = std::env::var("CHARTD_STORAGE_ROOT") {
            self.local_root = PathBuf::from(dir);
        }

        if let Ok(endpoint) = std::env::var("CHARTD_OBJECT_STORE_ENDPOINT") {
            self.object_store.endpoint = Some(endpoint);
        }

        if let Ok(bucket) = std::env::var("CHARTD_OBJECT_STORE_BUCKET") {
            self.object_store.bucket = Some(bucket);
        }

        if let Ok(dir) = std::env::var("CHARTD_WORKSPACE") {
            self.workspace_dir = PathBuf::from(dir);
        }

        if let Ok(name) = std::env::var("CHARTD_ENTRY_DOCUMENT") {
            if !name.is_empty() {
                self.entry_document = name;
            }
        }
    }

    /// Validates storage configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entry_document.is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.entry_document must not be empty".to_string(),
            ));
        }

        if self.backend == BackendKind::ObjectStore {
            match &self.object_store.endpoint {
                None => {
                    return Err(ConfigError::ValidationError(
                        "object_store backend selected but endpoint not set".to_string(),
                    ))
                }
                Some(endpoint) if url::Url::parse(endpoint).is_err() => {
                    return Err(ConfigError::ValidationError(format!(
                        "invalid object store endpoint '{}'",
                        endpoint
                    )))
                }
                Some(_) => {}
            }
            if self.object_store.bucket.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::ValidationError(
                    "object_store backend selected but bucket not set".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Event routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Deliver loopback and remote sends. Publish works regardless.
    pub enabled: bool,
    /// Base URL loopback sends are posted to as `<self_endpoint>/<origin>`.
    /// When unset, loopback sends are delivered in-process.
    pub self_endpoint: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            self_endpoint: None,
        }
    }
}

impl RoutingConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("CHARTD_ROUTING_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
        if let Ok(endpoint) = std::env::var("CHARTD_SELF_ENDPOINT") {
            self.self_endpoint = if endpoint.is_empty() {
                None
            } else {
                Some(endpoint)
            };
        }
    }

    /// Validates routing configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref endpoint) = self.self_endpoint {
            if !chartd_storage::is_absolute_url(endpoint) {
                return Err(ConfigError::ValidationError(format!(
                    "routing.self_endpoint must be an http(s) URL, got '{}'",
                    endpoint
                )));
            }
        }
        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Expose `/metrics` on the API listener.
    pub enabled: bool,
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("CHARTD_METRICS_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
