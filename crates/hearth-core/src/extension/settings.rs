//! Persisted per-extension settings.
//!
//! ```json
//! { "extensions": { "analytics": { "enabled": true, "config": { ... } } } }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{ExtensionError, Result};

/// Settings of one extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "empty_object")]
    pub config: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl Default for ExtensionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            config: empty_object(),
        }
    }
}

/// Settings of all extensions, as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    #[serde(default)]
    pub extensions: BTreeMap<String, ExtensionSettings>,
}

impl ExtensionConfig {
    /// Load from `path`. A missing file yields the empty default.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No extension settings file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&raw).map_err(|e| {
            ExtensionError::Settings(format!("malformed settings file {}: {}", path.display(), e))
        })
    }

    /// Write atomically: uniquely named temp file in the same directory,
    /// then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), self)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| ExtensionError::Io(e.error))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ExtensionSettings> {
        self.extensions.get(name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.extensions.get(name).map(|s| s.enabled).unwrap_or(false)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        self.extensions.entry(name.to_string()).or_default().enabled = enabled;
    }

    pub fn set_config(&mut self, name: &str, config: Value) {
        self.extensions.entry(name.to_string()).or_default().config = config;
    }
}

/// Result of a best-effort persistence attempt.
///
/// In-memory state has already changed when this is returned; only the
/// durable copy may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SaveOutcome {
    Persisted,
    InMemoryOnly { error: String },
}

impl SaveOutcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, SaveOutcome::Persisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExtensionConfig::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.extensions.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("extensions.json");

        let mut config = ExtensionConfig::default();
        config.set_enabled("analytics", true);
        config.set_config("analytics", json!({ "retention_days": 30 }));
        config.save(&path).unwrap();

        let loaded = ExtensionConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.is_enabled("analytics"));
        assert!(!loaded.is_enabled("products"));
    }

    #[test]
    fn test_wire_format() {
        let raw = r#"{ "extensions": { "x": { "enabled": true } } }"#;
        let config: ExtensionConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.extensions["x"].config, json!({}));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extensions.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ExtensionConfig::load(&path),
            Err(ExtensionError::Settings(_))
        ));
    }
}
