//! Extension registry.
//!
//! The registry is the single authority over registered extensions:
//! - Holds the canonical extension instances and their lifecycle state
//! - Drives register → initialize → migrate → start → stop
//! - Composes routes, middleware and hooks of enabled extensions
//! - Isolates failures so one extension never takes the host down
//!
//! Lifecycle operations are serialized by an async mutex. The composed tables
//! sit behind a reader/writer lock and are handed to in-flight requests as
//! `Arc` snapshots, so an enable or disable never blocks request dispatch for
//! longer than a table swap.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use axum::extract::{Request, State};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tower::ServiceExt;

use super::error::{ExtensionError, LifecyclePhase, Result};
use super::hooks::{run_chain, HookContext, HookOutcome, HookRegistration, HookTable, HookType};
use super::middleware::{ChainNext, MiddlewareRegistration, MiddlewareTable};
use super::migration::{self, MigrationStore};
use super::routes::{
    compile_routes, extension_from_path, ExtensionRouter, RouteRegistration, RouteTable,
    EXTENSION_ROUTE_PREFIX,
};
use super::services::{
    ConfigService, ExtensionDatabase, ExtensionServices, Row, ServiceProvider, Statement,
};
use super::system::{
    is_valid_extension_name, DynExtension, Extension, ExtensionContext, ExtensionMetadata,
    ExtensionState, HealthState, HealthStatus, Permission, HOST_VERSION,
};

/// Information about a registered extension.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionInfo {
    pub metadata: ExtensionMetadata,
    pub state: ExtensionState,
    /// Diagnostic message of the last failure
    pub last_error: Option<String>,
    pub database_schema: String,
    pub permissions: Vec<Permission>,
    pub route_count: usize,
    pub middleware_count: usize,
    pub hook_count: usize,
    pub registered_at: DateTime<Utc>,
    pub enabled_at: Option<DateTime<Utc>>,
}

/// Health of every registered extension.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub extensions: BTreeMap<String, HealthStatus>,
}

/// Outcome of a best-effort shutdown.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub errors: Vec<(String, ExtensionError)>,
}

struct ExtensionEntry {
    extension: DynExtension,
    metadata: ExtensionMetadata,
    state: ExtensionState,
    schema: String,
    permissions: Vec<Permission>,
    services: Option<ExtensionServices>,
    last_error: Option<String>,
    registered_at: DateTime<Utc>,
    enabled_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Entries {
    by_name: HashMap<String, ExtensionEntry>,
    /// Registration order
    order: Vec<String>,
}

#[derive(Default)]
struct ComposedTables {
    routes: RouteTable,
    middleware: MiddlewareTable,
    hooks: HookTable,
    next_seq: u64,
}

impl ComposedTables {
    fn remove_extension(&mut self, name: &str) -> usize {
        self.routes.remove_extension(name)
            + self.middleware.remove_extension(name)
            + self.hooks.remove_extension(name)
    }
}

/// Registrations collected from an extension during enable.
struct Contributions {
    routes: Vec<RouteRegistration>,
    middleware: Vec<MiddlewareRegistration>,
    hooks: Vec<HookRegistration>,
}

/// Snapshot of an entry taken under the read lock.
struct EntrySnapshot {
    extension: DynExtension,
    state: ExtensionState,
    schema: String,
    services: Option<ExtensionServices>,
    last_error: Option<String>,
}

/// Registry for managing extensions.
pub struct ExtensionRegistry {
    entries: RwLock<Entries>,
    tables: Arc<RwLock<ComposedTables>>,
    lifecycle: tokio::sync::Mutex<()>,
    services: ServiceProvider,
    migrations: Arc<dyn MigrationStore>,
    host_version: semver::Version,
}

/// Run a lifecycle future under the context's deadline and cancellation.
///
/// A panic inside the future becomes [`ExtensionError::Panicked`].
async fn guarded<T, F>(ctx: &ExtensionContext, extension: &str, phase: LifecyclePhase, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let fut = async {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(ExtensionError::panicked(extension, phase, payload.as_ref())),
        }
    };
    if ctx.is_cancelled() {
        return Err(ExtensionError::Cancelled {
            extension: extension.to_string(),
            phase,
        });
    }
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(ExtensionError::Cancelled {
            extension: extension.to_string(),
            phase,
        }),
        result = tokio::time::timeout(ctx.timeout(), fut) => match result {
            Ok(result) => result,
            Err(_) => Err(ExtensionError::Timeout {
                extension: extension.to_string(),
                phase,
                timeout: ctx.timeout(),
            }),
        },
    }
}

fn is_valid_schema_name(schema: &str) -> bool {
    let mut chars = schema.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl ExtensionRegistry {
    /// Create a registry on top of host services and a migration store.
    pub fn new(services: ServiceProvider, migrations: Arc<dyn MigrationStore>) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            tables: Arc::new(RwLock::new(ComposedTables::default())),
            lifecycle: tokio::sync::Mutex::new(()),
            services,
            migrations,
            host_version: semver::Version::parse(HOST_VERSION).unwrap_or_else(|_| semver::Version::new(0, 0, 0)),
        }
    }

    /// Override the host version extensions are checked against.
    pub fn with_host_version(mut self, version: semver::Version) -> Self {
        self.host_version = version;
        self
    }

    pub fn host_version(&self) -> &semver::Version {
        &self.host_version
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Register and initialize an extension.
    ///
    /// A failed initialization keeps the extension visible in the `Failed`
    /// state and returns the error.
    pub async fn register(&self, ctx: &ExtensionContext, extension: Box<dyn Extension>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let metadata = extension.metadata().clone();
        let name = metadata.name.clone();
        if !is_valid_extension_name(&name) {
            return Err(ExtensionError::InvalidName(name));
        }
        if self.entries.read().by_name.contains_key(&name) {
            return Err(ExtensionError::DuplicateExtension(name));
        }

        let schema = extension.database_schema();
        let permissions = extension.required_permissions();
        let handle: DynExtension = Arc::new(tokio::sync::RwLock::new(extension));

        {
            let mut entries = self.entries.write();
            entries.by_name.insert(
                name.clone(),
                ExtensionEntry {
                    extension: handle.clone(),
                    metadata: metadata.clone(),
                    state: ExtensionState::Registered,
                    schema: schema.clone(),
                    permissions,
                    services: None,
                    last_error: None,
                    registered_at: Utc::now(),
                    enabled_at: None,
                },
            );
            entries.order.push(name.clone());
        }

        if let Err(required) = metadata.check_host_version(&self.host_version) {
            let err = ExtensionError::IncompatibleHostVersion {
                extension: name.clone(),
                required,
                host: self.host_version.to_string(),
            };
            self.mark_failed(&name, &err);
            return Err(err);
        }
        if !is_valid_schema_name(&schema) {
            let err = ExtensionError::Registration {
                extension: name.clone(),
                message: format!("invalid database schema name {:?}", schema),
            };
            self.mark_failed(&name, &err);
            return Err(err);
        }

        let services = self.services.scoped(&name, &schema);
        let hooked = HookedDatabase::new(&name, services.db(), self.dispatcher());
        let services = services.with_database(Arc::new(hooked));
        let init_services = services.clone();
        let result = guarded(ctx, &name, LifecyclePhase::Initialize, async {
            handle.write().await.initialize(ctx, init_services).await
        })
        .await;

        match result {
            Ok(()) => {
                if let Some(entry) = self.entries.write().by_name.get_mut(&name) {
                    entry.state = ExtensionState::Initialized;
                    entry.services = Some(services);
                }
                tracing::info!(
                    extension = %name,
                    version = %metadata.version,
                    "Extension registered"
                );
                Ok(())
            }
            Err(e) => {
                let err = ExtensionError::Initialization {
                    extension: name.clone(),
                    source: Box::new(e),
                };
                self.mark_failed(&name, &err);
                Err(err)
            }
        }
    }

    /// Enable an extension without changing its configuration.
    pub async fn enable(&self, ctx: &ExtensionContext, name: &str) -> Result<()> {
        self.enable_with_config(ctx, name, None).await
    }

    /// Apply `config` (if any), run pending migrations, compose the
    /// extension's contributions and start it.
    ///
    /// Enabling an enabled extension is a no-op.
    pub async fn enable_with_config(
        &self,
        ctx: &ExtensionContext,
        name: &str,
        config: Option<&serde_json::Value>,
    ) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let snapshot = self.snapshot(name)?;

        match snapshot.state {
            ExtensionState::Failed => return Err(ExtensionError::AlreadyFailed(name.to_string())),
            ExtensionState::Enabled => return Ok(()),
            ExtensionState::Registered => {
                return Err(ExtensionError::InvalidState {
                    extension: name.to_string(),
                    operation: "enable",
                    state: snapshot.state.to_string(),
                })
            }
            ExtensionState::Initialized | ExtensionState::Disabled | ExtensionState::Stopped => {}
        }
        let services = snapshot.services.ok_or_else(|| ExtensionError::InvalidState {
            extension: name.to_string(),
            operation: "enable",
            state: "uninitialized".to_string(),
        })?;
        let extension = snapshot.extension;

        if let Some(config) = config {
            self.apply_config_locked(ctx, name, &extension, &services, config)
                .await?;
        }

        // Migrations
        let applied = match guarded(ctx, name, LifecyclePhase::Migrate, async {
            let migrations = extension.read().await.migrations();
            migration::run_pending(self.migrations.as_ref(), name, &snapshot.schema, migrations).await
        })
        .await
        {
            Ok(applied) => applied,
            Err(e) => {
                let err = match e {
                    e @ ExtensionError::Migration { .. } => e,
                    other => ExtensionError::Migration {
                        extension: name.to_string(),
                        version: String::new(),
                        source: Box::new(other),
                    },
                };
                self.mark_failed(name, &err);
                return Err(err);
            }
        };

        // Contributions
        let contributions = {
            let guard = extension.read().await;
            collect_contributions(name, &**guard)
        };
        let contributions = match contributions {
            Ok(c) => c,
            Err(err) => {
                self.mark_failed(name, &err);
                return Err(err);
            }
        };
        let compiled = match compile_routes(
            name,
            contributions.routes,
            self.services.auth(),
            self.dispatcher(),
        ) {
            Ok(compiled) => compiled,
            Err(err) => {
                self.mark_failed(name, &err);
                return Err(err);
            }
        };

        // Start
        if let Err(e) = guarded(ctx, name, LifecyclePhase::Start, async {
            extension.write().await.start(ctx).await
        })
        .await
        {
            let err = ExtensionError::Start {
                extension: name.to_string(),
                source: Box::new(e),
            };
            self.mark_failed(name, &err);
            return Err(err);
        }

        let (route_count, middleware_count, hook_count) = {
            let mut tables = self.tables.write();
            let route_count = compiled.paths.len();
            tables.routes.insert(name, compiled);

            let middleware_count = contributions.middleware.len();
            for mut registration in contributions.middleware {
                registration.extension = name.to_string();
                let seq = tables.next_seq;
                tables.next_seq += 1;
                tables.middleware.insert(seq, registration);
            }

            let hook_count = contributions.hooks.len();
            for mut registration in contributions.hooks {
                registration.extension = name.to_string();
                let seq = tables.next_seq;
                tables.next_seq += 1;
                tables.hooks.insert(seq, registration);
            }
            (route_count, middleware_count, hook_count)
        };

        if let Some(entry) = self.entries.write().by_name.get_mut(name) {
            entry.state = ExtensionState::Enabled;
            entry.enabled_at = Some(Utc::now());
            entry.last_error = None;
        }

        tracing::info!(
            extension = %name,
            routes = route_count,
            middleware = middleware_count,
            hooks = hook_count,
            migrations_applied = applied.len(),
            "Extension enabled"
        );
        Ok(())
    }

    /// Stop an enabled extension and tear down exactly its contributions.
    ///
    /// Stop errors are logged, never returned.
    pub async fn disable(&self, ctx: &ExtensionContext, name: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let snapshot = self.snapshot(name)?;

        match snapshot.state {
            ExtensionState::Failed => Err(ExtensionError::AlreadyFailed(name.to_string())),
            ExtensionState::Disabled => Ok(()),
            ExtensionState::Registered => Err(ExtensionError::InvalidState {
                extension: name.to_string(),
                operation: "disable",
                state: snapshot.state.to_string(),
            }),
            ExtensionState::Initialized | ExtensionState::Stopped => {
                self.set_state(name, ExtensionState::Disabled);
                Ok(())
            }
            ExtensionState::Enabled => {
                let stop_error = self.stop_enabled(ctx, name, &snapshot.extension).await;
                if let Some(entry) = self.entries.write().by_name.get_mut(name) {
                    entry.state = ExtensionState::Disabled;
                    entry.enabled_at = None;
                    entry.last_error = stop_error.map(|e| e.to_string());
                }
                tracing::info!(extension = %name, "Extension disabled");
                Ok(())
            }
        }
    }

    /// Validate and apply a configuration to a registered extension.
    pub async fn configure(&self, ctx: &ExtensionContext, name: &str, config: &serde_json::Value) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let snapshot = self.snapshot(name)?;
        match snapshot.state {
            ExtensionState::Failed => return Err(ExtensionError::AlreadyFailed(name.to_string())),
            ExtensionState::Registered => {
                return Err(ExtensionError::InvalidState {
                    extension: name.to_string(),
                    operation: "configure",
                    state: snapshot.state.to_string(),
                })
            }
            _ => {}
        }
        let services = snapshot.services.ok_or_else(|| ExtensionError::InvalidState {
            extension: name.to_string(),
            operation: "configure",
            state: "uninitialized".to_string(),
        })?;
        self.apply_config_locked(ctx, name, &snapshot.extension, &services, config)
            .await
    }

    /// Revert migrations newer than `target` (all when `None`).
    ///
    /// The extension must not be enabled.
    pub async fn rollback_migrations(
        &self,
        ctx: &ExtensionContext,
        name: &str,
        target: Option<&str>,
    ) -> Result<Vec<String>> {
        let _lifecycle = self.lifecycle.lock().await;
        let snapshot = self.snapshot(name)?;
        if snapshot.state == ExtensionState::Enabled {
            return Err(ExtensionError::InvalidState {
                extension: name.to_string(),
                operation: "roll back migrations",
                state: snapshot.state.to_string(),
            });
        }
        guarded(ctx, name, LifecyclePhase::Migrate, async {
            let migrations = snapshot.extension.read().await.migrations();
            migration::revert_to(self.migrations.as_ref(), name, &snapshot.schema, migrations, target).await
        })
        .await
    }

    /// Stop (if enabled) and forget an extension.
    pub async fn unregister(&self, ctx: &ExtensionContext, name: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let snapshot = self.snapshot(name)?;
        if snapshot.state == ExtensionState::Enabled {
            self.stop_enabled(ctx, name, &snapshot.extension).await;
        }
        let mut entries = self.entries.write();
        entries.by_name.remove(name);
        entries.order.retain(|n| n != name);
        tracing::info!(extension = %name, "Extension unregistered");
        Ok(())
    }

    /// Stop every enabled extension, newest first. Runs to completion
    /// regardless of individual failures.
    pub async fn shutdown(&self, ctx: &ExtensionContext) -> ShutdownReport {
        let _lifecycle = self.lifecycle.lock().await;
        let enabled: Vec<(String, DynExtension)> = {
            let entries = self.entries.read();
            entries
                .order
                .iter()
                .rev()
                .filter_map(|name| {
                    entries
                        .by_name
                        .get(name)
                        .filter(|e| e.state == ExtensionState::Enabled)
                        .map(|e| (name.clone(), e.extension.clone()))
                })
                .collect()
        };

        let mut report = ShutdownReport::default();
        for (name, extension) in enabled {
            let stop_error = self.stop_enabled(ctx, &name, &extension).await;
            if let Some(entry) = self.entries.write().by_name.get_mut(&name) {
                entry.state = ExtensionState::Stopped;
                entry.enabled_at = None;
                entry.last_error = stop_error.as_ref().map(|e| e.to_string());
            }
            match stop_error {
                Some(err) => report.errors.push((name, err)),
                None => report.stopped.push(name),
            }
        }
        tracing::info!(
            stopped = report.stopped.len(),
            failed = report.errors.len(),
            "Extensions shut down"
        );
        report
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Get an extension by name.
    pub fn get(&self, name: &str) -> Option<DynExtension> {
        self.entries.read().by_name.get(name).map(|e| e.extension.clone())
    }

    /// All extensions in registration order.
    pub fn get_all(&self) -> Vec<DynExtension> {
        let entries = self.entries.read();
        entries
            .order
            .iter()
            .filter_map(|name| entries.by_name.get(name).map(|e| e.extension.clone()))
            .collect()
    }

    pub fn state(&self, name: &str) -> Option<ExtensionState> {
        self.entries.read().by_name.get(name).map(|e| e.state)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().by_name.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.entries.read().by_name.len()
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().order.clone()
    }

    pub fn info(&self, name: &str) -> Option<ExtensionInfo> {
        let entries = self.entries.read();
        let tables = self.tables.read();
        entries.by_name.get(name).map(|entry| build_info(name, entry, &tables))
    }

    /// Info for every extension, in registration order.
    pub fn list(&self) -> Vec<ExtensionInfo> {
        let entries = self.entries.read();
        let tables = self.tables.read();
        entries
            .order
            .iter()
            .filter_map(|name| entries.by_name.get(name).map(|entry| build_info(name, entry, &tables)))
            .collect()
    }

    pub async fn config_schema(&self, name: &str) -> Result<serde_json::Value> {
        let extension = self
            .get(name)
            .ok_or_else(|| ExtensionError::NotFound(name.to_string()))?;
        let guard = extension.read().await;
        Ok(guard.config_schema())
    }

    /// Currently applied configuration.
    pub fn applied_config(&self, name: &str) -> Option<serde_json::Value> {
        self.entries
            .read()
            .by_name
            .get(name)
            .and_then(|e| e.services.as_ref().map(|s| s.config_view().all()))
    }

    /// Fully-qualified paths of every mounted extension route.
    pub fn mounted_routes(&self) -> Vec<String> {
        self.tables.read().routes.mounted_paths()
    }

    /// `(extension, middleware)` pairs in execution order.
    pub fn middleware_order(&self) -> Vec<(String, String)> {
        self.tables.read().middleware.names()
    }

    /// `(extension, hook)` pairs of one hook type in execution order.
    pub fn hook_order(&self, hook_type: HookType) -> Vec<(String, String)> {
        self.tables
            .read()
            .hooks
            .chain(hook_type)
            .iter()
            .map(|e| (e.registration.extension.clone(), e.registration.name.clone()))
            .collect()
    }

    /// Health of one extension. Failed extensions report unhealthy with
    /// their diagnostic; disabled ones report stopped.
    pub async fn health(&self, ctx: &ExtensionContext, name: &str) -> Result<HealthStatus> {
        let snapshot = self.snapshot(name)?;
        let status = match snapshot.state {
            ExtensionState::Failed => HealthStatus::unhealthy(
                snapshot
                    .last_error
                    .unwrap_or_else(|| "extension failed".to_string()),
            ),
            ExtensionState::Disabled | ExtensionState::Stopped => HealthStatus::new(HealthState::Stopped),
            ExtensionState::Registered => HealthStatus::new(HealthState::Unknown),
            ExtensionState::Initialized | ExtensionState::Enabled => {
                let extension = snapshot.extension;
                match guarded(ctx, name, LifecyclePhase::Health, async {
                    extension.read().await.health(ctx).await
                })
                .await
                {
                    Ok(status) => status,
                    Err(e) => HealthStatus::unhealthy(e.to_string()),
                }
            }
        };
        Ok(status)
    }

    /// Health of all extensions. Unhealthy if any extension is unhealthy.
    pub async fn health_report(&self, ctx: &ExtensionContext) -> HealthReport {
        let mut extensions = BTreeMap::new();
        for name in self.names() {
            if let Ok(status) = self.health(ctx, &name).await {
                extensions.insert(name, status);
            }
        }
        let status = if extensions
            .values()
            .any(|s| s.status == HealthState::Unhealthy)
        {
            HealthState::Unhealthy
        } else {
            HealthState::Healthy
        };
        HealthReport { status, extensions }
    }

    // ========================================================================
    // Composition
    // ========================================================================

    /// Fire every hook of `hook_type` across enabled extensions.
    pub async fn execute_hooks(&self, hook_type: HookType, ctx: &mut HookContext) -> Result<HookOutcome> {
        self.dispatcher().fire(hook_type, ctx).await
    }

    /// Mount extension routes on the host router under `/ext/<name>`.
    ///
    /// Requests are resolved against the live route table, so enabling or
    /// disabling an extension later takes effect without rebuilding the host.
    pub fn register_routes(self: &Arc<Self>, host: Router) -> Router {
        host.nest_service(
            EXTENSION_ROUTE_PREFIX,
            any(dispatch_extension).with_state(self.clone()),
        )
    }

    /// Wrap `router` with the composed middleware chain and request hooks.
    ///
    /// Each call adds another layer on top of the previous ones.
    pub fn apply_middleware(self: &Arc<Self>, router: Router) -> Router {
        router.layer(from_fn_with_state(self.clone(), composed_middleware))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn dispatcher(&self) -> HookDispatcher {
        HookDispatcher {
            tables: Arc::downgrade(&self.tables),
        }
    }

    fn snapshot(&self, name: &str) -> Result<EntrySnapshot> {
        let entries = self.entries.read();
        let entry = entries
            .by_name
            .get(name)
            .ok_or_else(|| ExtensionError::NotFound(name.to_string()))?;
        Ok(EntrySnapshot {
            extension: entry.extension.clone(),
            state: entry.state,
            schema: entry.schema.clone(),
            services: entry.services.clone(),
            last_error: entry.last_error.clone(),
        })
    }

    fn set_state(&self, name: &str, state: ExtensionState) {
        if let Some(entry) = self.entries.write().by_name.get_mut(name) {
            entry.state = state;
        }
    }

    fn mark_failed(&self, name: &str, err: &ExtensionError) {
        let removed = self.tables.write().remove_extension(name);
        if let Some(entry) = self.entries.write().by_name.get_mut(name) {
            entry.state = ExtensionState::Failed;
            entry.enabled_at = None;
            entry.last_error = Some(err.to_string());
        }
        tracing::warn!(
            extension = %name,
            error = %err,
            removed_registrations = removed,
            "Extension failed"
        );
    }

    /// Remove contributions, then stop. Returns the stop error, if any.
    async fn stop_enabled(
        &self,
        ctx: &ExtensionContext,
        name: &str,
        extension: &DynExtension,
    ) -> Option<ExtensionError> {
        let removed = self.tables.write().remove_extension(name);
        tracing::debug!(extension = %name, removed_registrations = removed, "Removed extension contributions");

        match guarded(ctx, name, LifecyclePhase::Stop, async {
            extension.write().await.stop(ctx).await
        })
        .await
        {
            Ok(()) => None,
            Err(e) => {
                let err = ExtensionError::Stop {
                    extension: name.to_string(),
                    source: Box::new(e),
                };
                tracing::warn!(extension = %name, error = %err, "Extension stop failed, continuing");
                Some(err)
            }
        }
    }

    async fn apply_config_locked(
        &self,
        ctx: &ExtensionContext,
        name: &str,
        extension: &DynExtension,
        services: &ExtensionServices,
        config: &serde_json::Value,
    ) -> Result<()> {
        let validation = guarded(ctx, name, LifecyclePhase::Configure, async {
            extension.read().await.validate_config(config)
        })
        .await;
        validation.map_err(|e| config_error(name, e))?;

        let applied = guarded(ctx, name, LifecyclePhase::Configure, async {
            extension.write().await.apply_config(config).await
        })
        .await;
        match applied {
            Ok(()) => {}
            // The instance may be half-updated
            Err(err @ ExtensionError::Panicked { .. }) => {
                self.mark_failed(name, &err);
                return Err(err);
            }
            Err(e) => return Err(config_error(name, e)),
        }

        services.config_view().replace(config.clone());
        tracing::debug!(extension = %name, "Configuration applied");
        Ok(())
    }
}

fn config_error(name: &str, err: ExtensionError) -> ExtensionError {
    match err {
        e @ ExtensionError::ConfigValidation { .. } => e,
        other => ExtensionError::ConfigValidation {
            extension: name.to_string(),
            message: other.to_string(),
        },
    }
}

/// Fires hook chains on behalf of components that outlive a registry call:
/// the auth layer of protected routes and hooked database handles.
///
/// Holds the tables weakly since compiled routes live inside them.
#[derive(Clone, Default)]
pub(crate) struct HookDispatcher {
    tables: Weak<RwLock<ComposedTables>>,
}

impl HookDispatcher {
    pub(crate) async fn fire(&self, hook_type: HookType, ctx: &mut HookContext) -> Result<HookOutcome> {
        ctx.hook_type = hook_type;
        let Some(tables) = self.tables.upgrade() else {
            return Ok(HookOutcome::default());
        };
        let chain = tables.read().hooks.chain(hook_type);
        run_chain(&chain, ctx).await
    }
}

/// Database handle that runs the `pre_database` chain before every call and
/// the `post_database` chain after it.
struct HookedDatabase {
    extension: String,
    inner: Arc<dyn ExtensionDatabase>,
    hooks: HookDispatcher,
}

impl HookedDatabase {
    fn new(extension: &str, inner: Arc<dyn ExtensionDatabase>, hooks: HookDispatcher) -> Self {
        Self {
            extension: extension.to_string(),
            inner,
            hooks,
        }
    }

    fn context(&self, operation: &str) -> HookContext {
        let mut ctx = HookContext::new(HookType::PreDatabase);
        ctx.data.insert("extension".into(), self.extension.clone().into());
        ctx.data.insert("schema".into(), self.inner.schema().into());
        ctx.data.insert("operation".into(), operation.into());
        ctx
    }

    /// A failing `pre_database` hook cancels the call.
    async fn around<T>(&self, mut ctx: HookContext, call: impl Future<Output = Result<T>>) -> Result<T> {
        self.hooks.fire(HookType::PreDatabase, &mut ctx).await?;
        let result = call.await;
        let mut post = ctx.with_type(HookType::PostDatabase);
        if let Err(e) = &result {
            post.error = Some(e.to_string());
        }
        let _ = self.hooks.fire(HookType::PostDatabase, &mut post).await;
        result
    }
}

#[async_trait::async_trait]
impl ExtensionDatabase for HookedDatabase {
    fn schema(&self) -> &str {
        self.inner.schema()
    }

    async fn query(&self, sql: &str, params: &[serde_json::Value]) -> Result<Vec<Row>> {
        let mut ctx = self.context("query");
        ctx.data.insert("sql".into(), sql.into());
        self.around(ctx, self.inner.query(sql, params)).await
    }

    async fn exec(&self, sql: &str, params: &[serde_json::Value]) -> Result<u64> {
        let mut ctx = self.context("exec");
        ctx.data.insert("sql".into(), sql.into());
        self.around(ctx, self.inner.exec(sql, params)).await
    }

    async fn transaction(&self, statements: Vec<Statement>) -> Result<u64> {
        let mut ctx = self.context("transaction");
        ctx.data.insert("statements".into(), statements.len().into());
        self.around(ctx, self.inner.transaction(statements)).await
    }
}

/// Call the builder methods of an extension, isolating panics.
fn collect_contributions(name: &str, extension: &dyn Extension) -> Result<Contributions> {
    let collected = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let mut router = ExtensionRouter::new();
        extension.register_routes(&mut router)?;
        Ok::<_, ExtensionError>(Contributions {
            routes: router.into_routes(),
            middleware: extension.register_middleware(),
            hooks: extension.register_hooks(),
        })
    }));

    match collected {
        Ok(Ok(contributions)) => Ok(contributions),
        Ok(Err(e)) => Err(ExtensionError::Registration {
            extension: name.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Err(ExtensionError::Registration {
            extension: name.to_string(),
            message: "registration panicked".to_string(),
        }),
    }
}

fn build_info(name: &str, entry: &ExtensionEntry, tables: &ComposedTables) -> ExtensionInfo {
    ExtensionInfo {
        metadata: entry.metadata.clone(),
        state: entry.state,
        last_error: entry.last_error.clone(),
        database_schema: entry.schema.clone(),
        permissions: entry.permissions.clone(),
        route_count: tables.routes.count_for(name),
        middleware_count: tables.middleware.count_for(name),
        hook_count: tables.hooks.count_for(name),
        registered_at: entry.registered_at,
        enabled_at: entry.enabled_at,
    }
}

/// Route a `/ext/<name>/...` request into the owning extension's router.
///
/// Mounted with `nest_service`, so the path arrives without the prefix and
/// carries no host path parameters into extension extractors.
async fn dispatch_extension(State(registry): State<Arc<ExtensionRegistry>>, request: Request) -> Response {
    let name = match extension_from_path(request.uri().path()) {
        Some(name) => name.to_string(),
        None => return ExtensionError::NotFound(request.uri().path().to_string()).into_response(),
    };
    let router = registry.tables.read().routes.router(&name);
    match router {
        Some(router) => match router.oneshot(request).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        },
        None => ExtensionError::NotFound(name).into_response(),
    }
}

/// Layer added by [`ExtensionRegistry::apply_middleware`].
async fn composed_middleware(
    State(registry): State<Arc<ExtensionRegistry>>,
    request: Request,
    next: Next,
) -> Response {
    let mut hook_ctx = HookContext::for_request(
        HookType::PreRequest,
        request.method().as_str(),
        request.uri().path(),
    );

    if let Err(err) = registry.execute_hooks(HookType::PreRequest, &mut hook_ctx).await {
        return fail_request(&registry, hook_ctx, err).await;
    }

    let chain = registry.tables.read().middleware.snapshot();
    let response = ChainNext::new(chain, next).run(request).await;
    let status = response.status();

    let mut pre_response = hook_ctx.clone().with_type(HookType::PreResponse);
    pre_response.status = Some(status.as_u16());
    if let Err(err) = registry.execute_hooks(HookType::PreResponse, &mut pre_response).await {
        return fail_request(&registry, pre_response, err).await;
    }

    for hook_type in [HookType::PostRequest, HookType::PostResponse] {
        let mut post = pre_response.clone().with_type(hook_type);
        let _ = registry.execute_hooks(hook_type, &mut post).await;
    }
    if status.is_server_error() {
        let mut error_ctx = pre_response.with_type(HookType::Error);
        error_ctx.error = Some(format!("handler returned {}", status));
        let _ = registry.execute_hooks(HookType::Error, &mut error_ctx).await;
    }

    response
}

async fn fail_request(registry: &ExtensionRegistry, ctx: HookContext, err: ExtensionError) -> Response {
    let mut error_ctx = ctx.with_type(HookType::Error);
    error_ctx.error = Some(err.to_string());
    let _ = registry.execute_hooks(HookType::Error, &mut error_ctx).await;
    err.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::migration::MemoryMigrationStore;

    struct Minimal {
        metadata: ExtensionMetadata,
    }

    #[async_trait::async_trait]
    impl Extension for Minimal {
        fn metadata(&self) -> &ExtensionMetadata {
            &self.metadata
        }

        async fn initialize(&mut self, _ctx: &ExtensionContext, _services: ExtensionServices) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> ExtensionRegistry {
        ExtensionRegistry::new(ServiceProvider::new(), Arc::new(MemoryMigrationStore::new()))
    }

    fn minimal(name: &str) -> Box<dyn Extension> {
        Box::new(Minimal {
            metadata: ExtensionMetadata::new(name, semver::Version::new(1, 0, 0)),
        })
    }

    #[tokio::test]
    async fn test_registry_creation() {
        let registry = registry();
        assert_eq!(registry.count(), 0);
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_name_not_stored() {
        let registry = registry();
        let err = registry
            .register(&ExtensionContext::new(), minimal("Bad Name"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::InvalidName(_)));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_incompatible_host_version_fails() {
        let registry = registry().with_host_version(semver::Version::new(0, 1, 0));
        let ext = Box::new(Minimal {
            metadata: ExtensionMetadata::new("future", semver::Version::new(1, 0, 0))
                .with_host_range(Some(semver::Version::new(2, 0, 0)), None),
        });
        let err = registry.register(&ExtensionContext::new(), ext).await.unwrap_err();
        assert!(matches!(err, ExtensionError::IncompatibleHostVersion { .. }));
        assert_eq!(registry.state("future"), Some(ExtensionState::Failed));
    }

    #[tokio::test]
    async fn test_disable_initialized_then_enable() {
        let registry = registry();
        let ctx = ExtensionContext::new();
        registry.register(&ctx, minimal("plain")).await.unwrap();
        assert_eq!(registry.state("plain"), Some(ExtensionState::Initialized));

        registry.disable(&ctx, "plain").await.unwrap();
        assert_eq!(registry.state("plain"), Some(ExtensionState::Disabled));

        registry.enable(&ctx, "plain").await.unwrap();
        assert_eq!(registry.state("plain"), Some(ExtensionState::Enabled));
    }

    #[test]
    fn test_schema_names() {
        assert!(is_valid_schema_name("cloud_storage"));
        assert!(is_valid_schema_name("_internal"));
        assert!(!is_valid_schema_name("cloud-storage"));
        assert!(!is_valid_schema_name(""));
    }
}
