//! Extension manager.
//!
//! Binds the registry to persisted per-extension settings: on startup every
//! catalog extension is registered and the ones marked enabled are switched
//! on with their stored configuration. Later state changes are written back
//! on a best-effort basis.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::error::{ExtensionError, Result};
use super::migration::MigrationStore;
use super::registry::{ExtensionRegistry, ShutdownReport};
use super::services::ServiceProvider;
use super::settings::{ExtensionConfig, SaveOutcome};
use super::system::{Extension, ExtensionContext, DEFAULT_LIFECYCLE_TIMEOUT};

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Settings file. `None` keeps settings in memory only.
    pub settings_path: Option<PathBuf>,
    /// Upper bound for each lifecycle call.
    pub lifecycle_timeout: Duration,
    /// Overrides the compiled-in host version.
    pub host_version: Option<semver::Version>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            settings_path: None,
            lifecycle_timeout: DEFAULT_LIFECYCLE_TIMEOUT,
            host_version: None,
        }
    }
}

impl ManagerConfig {
    pub fn with_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    pub fn with_lifecycle_timeout(mut self, timeout: Duration) -> Self {
        self.lifecycle_timeout = timeout;
        self
    }

    pub fn with_host_version(mut self, version: semver::Version) -> Self {
        self.host_version = Some(version);
        self
    }
}

/// Outcome of the startup pass.
#[derive(Debug, Default)]
pub struct InitializeReport {
    pub registered: Vec<String>,
    pub enabled: Vec<String>,
    pub failed: Vec<(String, ExtensionError)>,
}

impl InitializeReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ExtensionManager {
    registry: Arc<ExtensionRegistry>,
    settings: RwLock<ExtensionConfig>,
    /// Held from mutation until the file is written, so saves land in order.
    persist_lock: Mutex<()>,
    config: ManagerConfig,
}

impl ExtensionManager {
    /// Load settings and build the registry.
    ///
    /// A missing settings file is not an error; a malformed one is.
    pub fn new(
        config: ManagerConfig,
        services: ServiceProvider,
        migrations: Arc<dyn MigrationStore>,
    ) -> Result<Self> {
        let settings = match &config.settings_path {
            Some(path) => ExtensionConfig::load(path)?,
            None => ExtensionConfig::default(),
        };

        let mut registry = ExtensionRegistry::new(services, migrations);
        if let Some(version) = &config.host_version {
            registry = registry.with_host_version(version.clone());
        }

        tracing::debug!(
            known = settings.extensions.len(),
            path = ?config.settings_path,
            "Extension settings loaded"
        );

        Ok(Self {
            registry: Arc::new(registry),
            settings: RwLock::new(settings),
            persist_lock: Mutex::new(()),
            config,
        })
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    /// Copy of the current settings.
    pub fn settings(&self) -> ExtensionConfig {
        self.settings.read().clone()
    }

    /// Root lifecycle context with the configured timeout.
    pub fn context(&self) -> ExtensionContext {
        ExtensionContext::new().with_timeout(self.config.lifecycle_timeout)
    }

    /// Register every catalog extension and enable the ones marked enabled.
    ///
    /// Individual failures are recorded and never stop the pass.
    pub async fn initialize(&self, ctx: &ExtensionContext, catalog: Vec<Box<dyn Extension>>) -> InitializeReport {
        let mut report = InitializeReport::default();

        for extension in catalog {
            let name = extension.metadata().name.clone();
            match self.registry.register(ctx, extension).await {
                Ok(()) => report.registered.push(name),
                Err(e) => {
                    tracing::error!(extension = %name, error = %e, "Failed to register extension");
                    report.failed.push((name, e));
                }
            }
        }

        for name in report.registered.clone() {
            let stored = self.settings.read().get(&name).cloned();
            let Some(stored) = stored.filter(|s| s.enabled) else {
                continue;
            };
            match self
                .registry
                .enable_with_config(ctx, &name, Some(&stored.config))
                .await
            {
                Ok(()) => report.enabled.push(name),
                Err(e) => {
                    tracing::error!(extension = %name, error = %e, "Failed to enable extension");
                    report.failed.push((name, e));
                }
            }
        }

        tracing::info!(
            registered = report.registered.len(),
            enabled = report.enabled.len(),
            failed = report.failed.len(),
            "Extensions initialized"
        );
        report
    }

    /// Enable an extension with its stored configuration and persist the flag.
    pub async fn enable(&self, ctx: &ExtensionContext, name: &str) -> Result<SaveOutcome> {
        let stored = self
            .settings
            .read()
            .get(name)
            .map(|s| s.config.clone())
            .unwrap_or_else(|| Value::Object(Default::default()));
        self.registry
            .enable_with_config(ctx, name, Some(&stored))
            .await?;
        Ok(self.save_extension_state(name, true))
    }

    pub async fn disable(&self, ctx: &ExtensionContext, name: &str) -> Result<SaveOutcome> {
        self.registry.disable(ctx, name).await?;
        Ok(self.save_extension_state(name, false))
    }

    /// Apply a new configuration and persist it.
    pub async fn configure(&self, ctx: &ExtensionContext, name: &str, config: Value) -> Result<SaveOutcome> {
        self.registry.configure(ctx, name, &config).await?;
        Ok(self.update_and_persist(|settings| settings.set_config(name, config)))
    }

    /// Record the enabled flag of an extension.
    ///
    /// The in-memory copy always changes; the outcome tells whether the file
    /// was written too.
    pub fn save_extension_state(&self, name: &str, enabled: bool) -> SaveOutcome {
        self.update_and_persist(|settings| settings.set_enabled(name, enabled))
    }

    /// Stop every enabled extension.
    pub async fn shutdown(&self, ctx: &ExtensionContext) -> ShutdownReport {
        self.registry.shutdown(ctx).await
    }

    fn update_and_persist(&self, update: impl FnOnce(&mut ExtensionConfig)) -> SaveOutcome {
        let _guard = self.persist_lock.lock();
        let snapshot = {
            let mut settings = self.settings.write();
            update(&mut settings);
            settings.clone()
        };
        let Some(path) = &self.config.settings_path else {
            return SaveOutcome::InMemoryOnly {
                error: "no settings file configured".to_string(),
            };
        };
        match snapshot.save(path) {
            Ok(()) => SaveOutcome::Persisted,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to persist extension settings");
                SaveOutcome::InMemoryOnly { error: e.to_string() }
            }
        }
    }
}
