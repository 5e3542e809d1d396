//! Configuration system for bundle transmission.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BUNDLE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/bundle/config.toml
//!   3. ~/.config/bundle/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
///
/// One file serves all three roles. A server reads `server`, a client
/// reads `client`, a transport reads `transport`; every role reads
/// `identity` and `exchange`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    pub identity: IdentityConfig,
    pub exchange: ExchangeConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the identity key file. Auto-generated on first run.
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Bytes per streamed chunk on upload and download.
    pub chunk_size: usize,
    /// Deadline for single round-trip calls (inventory, recency).
    pub short_deadline_secs: u64,
    /// Deadline for a full bundle transfer.
    pub long_deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP address the exchange listener binds.
    pub listen_addr: String,
    /// Local HTTP API port.
    pub api_port: u16,
    pub data_dir: PathBuf,
    pub window_length: u64,
    /// Upper bound on ADU bytes carried by one bundle.
    pub payload_budget_bytes: u64,
    /// Registered application ids, in inclusion order.
    pub app_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub data_dir: PathBuf,
    /// Hex public identity of the server this client talks to.
    pub server_identity: String,
    pub window_length: u64,
    pub payload_budget_bytes: u64,
    pub app_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Identity string reported to the server in sender-role messages.
    pub id: String,
    pub data_dir: PathBuf,
    /// Address clients connect to.
    pub listen_addr: String,
    /// Address of the server exchange listener.
    pub server_addr: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Default number of bundles a side may have in flight per peer.
pub const DEFAULT_WINDOW_LENGTH: u64 = 10;

/// Default outbound payload budget.
pub const DEFAULT_PAYLOAD_BUDGET: u64 = 1_000_000;

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_path: config_dir().join("identity.key"),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            short_deadline_secs: 10,
            long_deadline_secs: 120,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7778".to_string(),
            api_port: 9101,
            data_dir: data_dir().join("server"),
            window_length: DEFAULT_WINDOW_LENGTH,
            payload_budget_bytes: DEFAULT_PAYLOAD_BUDGET,
            app_ids: default_apps(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: data_dir().join("client"),
            server_identity: String::new(),
            window_length: DEFAULT_WINDOW_LENGTH,
            payload_budget_bytes: DEFAULT_PAYLOAD_BUDGET,
            app_ids: default_apps(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            data_dir: data_dir().join("transport"),
            listen_addr: "0.0.0.0:7779".to_string(),
            server_addr: "127.0.0.1:7778".to_string(),
        }
    }
}

fn default_apps() -> Vec<String> {
    vec!["mail".to_string(), "echo".to_string()]
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("bundle")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("bundle")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BundleConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, still applying env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            BundleConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BUNDLE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BundleConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Overwrite the config file with `self`. Returns the path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        let text = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        Ok(path)
    }

    /// Apply BUNDLE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("BUNDLE_IDENTITY__KEY_PATH") {
            self.identity.key_path = PathBuf::from(v);
        }
        if let Some(v) = var("BUNDLE_EXCHANGE__CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.exchange.chunk_size = v;
        }
        if let Some(v) = var("BUNDLE_EXCHANGE__SHORT_DEADLINE_SECS").and_then(|v| v.parse().ok()) {
            self.exchange.short_deadline_secs = v;
        }
        if let Some(v) = var("BUNDLE_EXCHANGE__LONG_DEADLINE_SECS").and_then(|v| v.parse().ok()) {
            self.exchange.long_deadline_secs = v;
        }
        if let Some(v) = var("BUNDLE_SERVER__LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Some(v) = var("BUNDLE_SERVER__API_PORT").and_then(|v| v.parse().ok()) {
            self.server.api_port = v;
        }
        if let Some(v) = var("BUNDLE_SERVER__DATA_DIR") {
            self.server.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("BUNDLE_SERVER__APP_IDS") {
            self.server.app_ids = split_list(&v);
        }
        if let Some(v) = var("BUNDLE_CLIENT__DATA_DIR") {
            self.client.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("BUNDLE_CLIENT__SERVER_IDENTITY") {
            self.client.server_identity = v;
        }
        if let Some(v) = var("BUNDLE_CLIENT__APP_IDS") {
            self.client.app_ids = split_list(&v);
        }
        if let Some(v) = var("BUNDLE_TRANSPORT__ID") {
            self.transport.id = v;
        }
        if let Some(v) = var("BUNDLE_TRANSPORT__DATA_DIR") {
            self.transport.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("BUNDLE_TRANSPORT__LISTEN_ADDR") {
            self.transport.listen_addr = v;
        }
        if let Some(v) = var("BUNDLE_TRANSPORT__SERVER_ADDR") {
            self.transport.server_addr = v;
        }
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_window() {
        let config = BundleConfig::default();
        assert_eq!(config.server.window_length, 10);
        assert_eq!(config.client.window_length, 10);
        assert_eq!(config.exchange.chunk_size, 1024 * 1024);
        assert!(config.exchange.short_deadline_secs < config.exchange.long_deadline_secs);
    }

    #[test]
    fn overrides_replace_fields() {
        let vars: HashMap<&str, &str> = [
            ("BUNDLE_SERVER__APP_IDS", "mail, chat ,"),
            ("BUNDLE_EXCHANGE__CHUNK_SIZE", "4096"),
            ("BUNDLE_TRANSPORT__ID", "kiosk-7"),
            ("BUNDLE_SERVER__API_PORT", "not-a-port"),
        ]
        .into_iter()
        .collect();

        let mut config = BundleConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.app_ids, vec!["mail", "chat"]);
        assert_eq!(config.exchange.chunk_size, 4096);
        assert_eq!(config.transport.id, "kiosk-7");
        // unparseable values leave the default in place
        assert_eq!(config.server.api_port, 9101);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[client]\nwindow_length = 4\n").unwrap();

        let config = BundleConfig::load_from(&path).expect("load should succeed");
        assert_eq!(config.client.window_length, 4);
        assert_eq!(config.client.payload_budget_bytes, DEFAULT_PAYLOAD_BUDGET);
        assert_eq!(config.server.window_length, DEFAULT_WINDOW_LENGTH);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[client\nwindow_length = ").unwrap();

        let err = BundleConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
    }
}
