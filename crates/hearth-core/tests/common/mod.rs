//! Shared fixtures for registry tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use hearth_core::extension::*;
use parking_lot::Mutex;
use serde_json::Value;

/// Shared call log, so tests can observe lifecycle calls after the extension
/// has moved into the registry.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Configurable extension used across the integration tests.
pub struct TestExtension {
    metadata: ExtensionMetadata,
    pub calls: CallLog,
    pub fail_initialize: bool,
    pub fail_start: bool,
    pub fail_stop: bool,
    pub panic_start: bool,
    pub panic_stop: bool,
    pub panic_apply: bool,
    pub initialize_delay: Option<Duration>,
    pub routes: Vec<(&'static str, &'static str)>,
    pub hooks: Vec<(String, HookType, i32)>,
    pub hook_log: Option<CallLog>,
    pub middleware: Vec<(String, i32)>,
    pub migrations: Vec<Migration>,
    pub required_key: Option<&'static str>,
    pub applied: Option<Value>,
}

impl TestExtension {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ExtensionMetadata::new(name, semver::Version::new(1, 0, 0)),
            calls: call_log(),
            fail_initialize: false,
            fail_start: false,
            fail_stop: false,
            panic_start: false,
            panic_stop: false,
            panic_apply: false,
            initialize_delay: None,
            routes: Vec::new(),
            hooks: Vec::new(),
            hook_log: None,
            middleware: Vec::new(),
            migrations: Vec::new(),
            required_key: None,
            applied: None,
        }
    }

    pub fn with_calls(mut self, calls: CallLog) -> Self {
        self.calls = calls;
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn panicking_start(mut self) -> Self {
        self.panic_start = true;
        self
    }

    pub fn panicking_stop(mut self) -> Self {
        self.panic_stop = true;
        self
    }

    pub fn panicking_apply(mut self) -> Self {
        self.panic_apply = true;
        self
    }

    pub fn slow_initialize(mut self, delay: Duration) -> Self {
        self.initialize_delay = Some(delay);
        self
    }

    /// Route whose handler answers with `body`.
    pub fn with_route(mut self, path: &'static str, body: &'static str) -> Self {
        self.routes.push((path, body));
        self
    }

    pub fn with_hook(mut self, name: &str, hook_type: HookType, priority: i32, log: CallLog) -> Self {
        self.hooks.push((name.to_string(), hook_type, priority));
        self.hook_log = Some(log);
        self
    }

    /// Middleware that appends its name to the `x-chain` response header.
    pub fn with_middleware(mut self, name: &str, priority: i32) -> Self {
        self.middleware.push((name.to_string(), priority));
        self
    }

    pub fn with_migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    pub fn requiring_config_key(mut self, key: &'static str) -> Self {
        self.required_key = Some(key);
        self
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(format!("{}:{}", self.metadata.name, call));
    }
}

#[async_trait::async_trait]
impl Extension for TestExtension {
    fn metadata(&self) -> &ExtensionMetadata {
        &self.metadata
    }

    async fn initialize(&mut self, _ctx: &ExtensionContext, _services: ExtensionServices) -> Result<()> {
        if let Some(delay) = self.initialize_delay {
            tokio::time::sleep(delay).await;
        }
        self.record("initialize");
        if self.fail_initialize {
            return Err(ExtensionError::other("boom"));
        }
        Ok(())
    }

    async fn start(&mut self, _ctx: &ExtensionContext) -> Result<()> {
        self.record("start");
        if self.panic_start {
            panic!("start exploded");
        }
        if self.fail_start {
            return Err(ExtensionError::other("cannot start"));
        }
        Ok(())
    }

    async fn stop(&mut self, _ctx: &ExtensionContext) -> Result<()> {
        self.record("stop");
        if self.panic_stop {
            panic!("stop exploded");
        }
        if self.fail_stop {
            return Err(ExtensionError::other("cannot stop"));
        }
        Ok(())
    }

    fn register_routes(&self, router: &mut ExtensionRouter) -> Result<()> {
        for (path, body) in &self.routes {
            let body: &'static str = body;
            router.route(*path, get(move || async move { body }));
        }
        Ok(())
    }

    fn register_middleware(&self) -> Vec<MiddlewareRegistration> {
        self.middleware
            .iter()
            .map(|(name, priority)| {
                let tag = name.clone();
                MiddlewareRegistration::new(name.clone(), *priority, move |req, next: ChainNext| {
                    let tag = tag.clone();
                    async move {
                        let mut response = next.run(req).await;
                        let chain = response
                            .headers()
                            .get("x-chain")
                            .and_then(|v| v.to_str().ok())
                            .map(|v| format!("{},{}", tag, v))
                            .unwrap_or_else(|| tag.clone());
                        if let Ok(value) = axum::http::HeaderValue::from_str(&chain) {
                            response.headers_mut().insert("x-chain", value);
                        }
                        response
                    }
                })
            })
            .collect()
    }

    fn register_hooks(&self) -> Vec<HookRegistration> {
        let log = self.hook_log.clone().unwrap_or_else(call_log);
        self.hooks
            .iter()
            .map(|(name, hook_type, priority)| {
                let log = log.clone();
                let tag = name.clone();
                HookRegistration::from_fn(name.clone(), *hook_type, *priority, move |_ctx| {
                    log.lock().push(tag.clone());
                    Ok(())
                })
            })
            .collect()
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        if let Some(key) = self.required_key {
            if config.get(key).is_none() {
                return Err(ExtensionError::ConfigValidation {
                    extension: self.metadata.name.clone(),
                    message: format!("missing {}", key),
                });
            }
        }
        Ok(())
    }

    async fn apply_config(&mut self, config: &Value) -> Result<()> {
        self.record("apply_config");
        if self.panic_apply {
            panic!("apply exploded");
        }
        self.applied = Some(config.clone());
        Ok(())
    }

    fn migrations(&self) -> Vec<Migration> {
        self.migrations.clone()
    }
}

/// Ledger that refuses one (extension, version) pair.
pub struct RejectingMigrationStore {
    inner: MemoryMigrationStore,
    extension: &'static str,
    version: &'static str,
}

impl RejectingMigrationStore {
    pub fn new(extension: &'static str, version: &'static str) -> Self {
        Self {
            inner: MemoryMigrationStore::new(),
            extension,
            version,
        }
    }
}

#[async_trait::async_trait]
impl MigrationStore for RejectingMigrationStore {
    async fn applied_versions(&self, extension: &str) -> Result<Vec<String>> {
        self.inner.applied_versions(extension).await
    }

    async fn apply(&self, schema: &str, migration: &Migration) -> Result<()> {
        if migration.extension == self.extension && migration.version == self.version {
            return Err(ExtensionError::Database("syntax error near CREAT".into()));
        }
        self.inner.apply(schema, migration).await
    }

    async fn revert(&self, schema: &str, migration: &Migration) -> Result<()> {
        self.inner.revert(schema, migration).await
    }
}

pub fn registry() -> ExtensionRegistry {
    ExtensionRegistry::new(ServiceProvider::new(), Arc::new(MemoryMigrationStore::new()))
}

pub fn shared_registry() -> Arc<ExtensionRegistry> {
    Arc::new(registry())
}
