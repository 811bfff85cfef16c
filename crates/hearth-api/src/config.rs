//! Host configuration.
//!
//! Loaded from a TOML file named by `--config` or `HEARTH_CONFIG`. Every
//! field has a default, so an absent file yields a working development
//! host. A handful of environment variables override the file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use hearth_core::extension::ManagerConfig;
use hearth_storage::HostStorageConfig;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "HEARTH_CONFIG";

/// Environment overrides applied after the file is read.
pub mod env_vars {
    pub const HOST: &str = "HEARTH_HOST";
    pub const PORT: &str = "HEARTH_PORT";
    pub const DATA_DIR: &str = "HEARTH_DATA_DIR";
    pub const SIGNING_SECRET: &str = "HEARTH_SIGNING_SECRET";
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub extensions: ExtensionsConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix of generated links, e.g. `https://admin.example.com`.
    pub public_url: String,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            public_url: String::new(),
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `None` keeps all data in memory.
    pub data_dir: Option<PathBuf>,
    pub max_connections: u32,
    /// HMAC key for signed download links.
    pub signing_secret: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: Some(PathBuf::from("data")),
            max_connections: 5,
            signing_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    /// Defaults to `<data_dir>/extensions.json`.
    pub settings_path: Option<PathBuf>,
    pub lifecycle_timeout_secs: u64,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            settings_path: None,
            lifecycle_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenConfig>,
    /// Treat unauthenticated admin requests as an admin. Development only.
    pub anonymous_admin: bool,
}

/// An API token, stored as the hex SHA-256 of the secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub user: String,
    pub token_sha256: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl HostConfig {
    /// Read `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No configuration file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Resolve the file from an explicit path, then `HEARTH_CONFIG`, then
    /// `hearth.toml`, and apply environment overrides.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => std::env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("hearth.toml")),
        };
        let mut config = Self::load(&path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var(env_vars::HOST) {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var(env_vars::PORT) {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{} is not a port: {}", env_vars::PORT, port)))?;
        }
        if let Ok(dir) = std::env::var(env_vars::DATA_DIR) {
            self.storage.data_dir = if dir.is_empty() { None } else { Some(PathBuf::from(dir)) };
        }
        if let Ok(secret) = std::env::var(env_vars::SIGNING_SECRET) {
            self.storage.signing_secret = secret;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extensions.lifecycle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "extensions.lifecycle_timeout_secs must be positive".to_string(),
            ));
        }
        if self.storage.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_connections must be positive".to_string(),
            ));
        }
        for token in &self.auth.tokens {
            let valid = token.token_sha256.len() == 64
                && token.token_sha256.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                return Err(ConfigError::Invalid(format!(
                    "token for {} is not a hex SHA-256 digest",
                    token.user
                )));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(format!(
                    "cannot bind {}:{}",
                    self.server.host, self.server.port
                ))
            })
    }

    pub fn settings_path(&self) -> Option<PathBuf> {
        self.extensions.settings_path.clone().or_else(|| {
            self.storage
                .data_dir
                .as_ref()
                .map(|dir| dir.join("extensions.json"))
        })
    }

    pub fn storage_config(&self, signing_secret: &str) -> HostStorageConfig {
        let config = match &self.storage.data_dir {
            Some(dir) => {
                let mut config = HostStorageConfig::on_disk(dir, signing_secret);
                config.max_connections = self.storage.max_connections;
                config
            }
            None => HostStorageConfig::in_memory(signing_secret),
        };
        config.with_public_url(self.server.public_url.trim_end_matches('/'))
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::default()
            .with_lifecycle_timeout(Duration::from_secs(self.extensions.lifecycle_timeout_secs));
        if let Some(path) = self.settings_path() {
            config = config.with_settings_path(path);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.settings_path(), Some(PathBuf::from("data/extensions.json")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = HostConfig::from_toml(
            r#"
            [server]
            port = 9000

            [storage]
            signing_secret = "s3cret"

            [[auth.tokens]]
            user = "admin"
            token_sha256 = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
            roles = ["admin"]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.storage.max_connections, 5);
        assert_eq!(config.auth.tokens[0].roles, vec!["admin"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_digest() {
        let mut config = HostConfig::default();
        config.auth.tokens.push(TokenConfig {
            user: "ops".into(),
            token_sha256: "not-a-digest".into(),
            roles: vec![],
            permissions: vec![],
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(matches!(HostConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_in_memory_storage() {
        let mut config = HostConfig::default();
        config.storage.data_dir = None;
        config.server.public_url = "https://admin.example.com/".into();
        let storage = config.storage_config("k");
        assert!(storage.data_dir.is_none());
        assert_eq!(storage.public_url, "https://admin.example.com");
        assert_eq!(config.settings_path(), None);
    }
}
