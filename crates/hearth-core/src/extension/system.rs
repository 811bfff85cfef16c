//! The extension contract.
//!
//! Every extension linked into the host implements [`Extension`]. The registry
//! owns the canonical instance and drives it through its lifecycle:
//!
//! ```text
//! register ─► initialize ─► (configure) ─► migrate ─► register_* ─► start ─► … ─► stop
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::error::Result;
use super::hooks::HookRegistration;
use super::middleware::MiddlewareRegistration;
use super::migration::Migration;
use super::routes::ExtensionRouter;
use super::services::ExtensionServices;

/// Version of the host, compared against extension compatibility ranges.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default bound applied to every lifecycle call.
pub const DEFAULT_LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared handle to a registered extension.
pub type DynExtension = Arc<RwLock<Box<dyn Extension>>>;

// ============================================================================
// Metadata
// ============================================================================

/// Descriptive information about an extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionMetadata {
    /// Unique name, also used as the route namespace.
    pub name: String,
    pub version: semver::Version,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Lowest host version this extension runs on (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_host_version: Option<semver::Version>,
    /// Highest host version this extension runs on (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_host_version: Option<semver::Version>,
}

impl ExtensionMetadata {
    pub fn new(name: impl Into<String>, version: semver::Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            author: String::new(),
            license: String::new(),
            tags: Vec::new(),
            min_host_version: None,
            max_host_version: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = license.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_host_range(
        mut self,
        min: Option<semver::Version>,
        max: Option<semver::Version>,
    ) -> Self {
        self.min_host_version = min;
        self.max_host_version = max;
        self
    }

    /// Check the compatibility range against a host version.
    ///
    /// Returns the violated bound rendered as a requirement string.
    pub fn check_host_version(&self, host: &semver::Version) -> std::result::Result<(), String> {
        if let Some(min) = &self.min_host_version {
            if host < min {
                return Err(format!(">={}", min));
            }
        }
        if let Some(max) = &self.max_host_version {
            if host > max {
                return Err(format!("<={}", max));
            }
        }
        Ok(())
    }
}

/// Check that a name can be used as a route segment and schema name.
pub fn is_valid_extension_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }
    name.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Default database schema for an extension name.
pub fn schema_name_for(name: &str) -> String {
    name.replace('-', "_")
}

// ============================================================================
// State
// ============================================================================

/// Lifecycle state of a registered extension, owned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionState {
    Registered,
    Initialized,
    Enabled,
    Disabled,
    Stopped,
    Failed,
}

impl std::fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registered => write!(f, "Registered"),
            Self::Initialized => write!(f, "Initialized"),
            Self::Enabled => write!(f, "Enabled"),
            Self::Disabled => write!(f, "Disabled"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Stopped,
    Unknown,
}

/// A single named sub-check inside a health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Health reported by an extension (or synthesized by the registry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub checks: BTreeMap<String, HealthCheck>,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    pub fn new(status: HealthState) -> Self {
        Self {
            status,
            message: None,
            checks: BTreeMap::new(),
            checked_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(HealthState::Healthy)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthState::Unhealthy).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Add a sub-check. An unhealthy sub-check makes the whole status unhealthy.
    pub fn with_check(mut self, name: impl Into<String>, status: HealthState, message: Option<String>) -> Self {
        if status == HealthState::Unhealthy {
            self.status = HealthState::Unhealthy;
        }
        self.checks.insert(name.into(), HealthCheck { status, message });
        self
    }
}

// ============================================================================
// Permissions
// ============================================================================

/// A permission an extension expects the host authorization layer to grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Permission {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

// ============================================================================
// Lifecycle context
// ============================================================================

/// Cancellation and deadline handed to every lifecycle call.
#[derive(Debug, Clone)]
pub struct ExtensionContext {
    cancel: CancellationToken,
    timeout: Duration,
}

impl ExtensionContext {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            timeout: DEFAULT_LIFECYCLE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A context that is cancelled together with this one.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            timeout: self.timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves when the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl Default for ExtensionContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Extension trait
// ============================================================================

/// The capability set every extension implements.
///
/// Builder methods (`register_*`) must be deterministic: the same extension
/// state yields the same registrations.
#[async_trait::async_trait]
pub trait Extension: Send + Sync {
    /// Get extension metadata.
    fn metadata(&self) -> &ExtensionMetadata;

    /// Called exactly once, before any other lifecycle method.
    async fn initialize(&mut self, ctx: &ExtensionContext, services: ExtensionServices) -> Result<()>;

    /// Begin active processing. Called after initialization and migrations.
    async fn start(&mut self, _ctx: &ExtensionContext) -> Result<()> {
        Ok(())
    }

    /// Release whatever `start` acquired.
    async fn stop(&mut self, _ctx: &ExtensionContext) -> Result<()> {
        Ok(())
    }

    /// Report health. Must not mutate state.
    async fn health(&self, _ctx: &ExtensionContext) -> Result<HealthStatus> {
        Ok(HealthStatus::healthy())
    }

    /// Declare HTTP routes, relative to the extension namespace.
    fn register_routes(&self, _router: &mut ExtensionRouter) -> Result<()> {
        Ok(())
    }

    fn register_middleware(&self) -> Vec<MiddlewareRegistration> {
        Vec::new()
    }

    fn register_hooks(&self) -> Vec<HookRegistration> {
        Vec::new()
    }

    /// JSON Schema describing accepted configuration.
    fn config_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    fn validate_config(&self, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Apply a configuration that already passed `validate_config`.
    async fn apply_config(&mut self, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Name of the isolated database schema.
    fn database_schema(&self) -> String {
        schema_name_for(&self.metadata().name)
    }

    fn migrations(&self) -> Vec<Migration> {
        Vec::new()
    }

    fn required_permissions(&self) -> Vec<Permission> {
        Vec::new()
    }
}
