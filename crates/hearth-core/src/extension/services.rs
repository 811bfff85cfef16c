//! Services facade injected into extensions at initialization.
//!
//! Every accessor on [`ExtensionServices`] returns a usable object. When the
//! host runs without a backend for a capability, an inert implementation is
//! handed out instead: calls that must return data fail with
//! [`ExtensionError::ServiceUnavailable`], fire-and-forget calls (logging,
//! stats) are silently accepted.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{ExtensionError, Result};

/// A row returned by a query, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

// ============================================================================
// Database
// ============================================================================

/// A statement inside a transaction batch.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Database access confined to one extension schema.
#[async_trait::async_trait]
pub trait ExtensionDatabase: Send + Sync {
    /// Schema every statement runs in.
    fn schema(&self) -> &str;

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement, returning the number of affected rows.
    async fn exec(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute all statements atomically.
    async fn transaction(&self, statements: Vec<Statement>) -> Result<u64>;
}

/// Hands out schema-scoped database handles.
pub trait DatabaseProvider: Send + Sync {
    fn for_schema(&self, schema: &str) -> Arc<dyn ExtensionDatabase>;
}

pub struct NoopDatabase {
    schema: String,
}

impl NoopDatabase {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
        }
    }
}

#[async_trait::async_trait]
impl ExtensionDatabase for NoopDatabase {
    fn schema(&self) -> &str {
        &self.schema
    }

    async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Err(ExtensionError::ServiceUnavailable("database"))
    }

    async fn exec(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
        Err(ExtensionError::ServiceUnavailable("database"))
    }

    async fn transaction(&self, _statements: Vec<Statement>) -> Result<u64> {
        Err(ExtensionError::ServiceUnavailable("database"))
    }
}

// ============================================================================
// Auth
// ============================================================================

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[async_trait::async_trait]
pub trait AuthService: Send + Sync {
    /// Resolve the user behind a request, if any.
    async fn current_user(&self, headers: &HeaderMap) -> Result<Option<AuthUser>>;

    async fn permissions(&self, user_id: &str) -> Result<Vec<String>>;
}

/// Treats every request as anonymous.
pub struct NoopAuth;

#[async_trait::async_trait]
impl AuthService for NoopAuth {
    async fn current_user(&self, _headers: &HeaderMap) -> Result<Option<AuthUser>> {
        Ok(None)
    }

    async fn permissions(&self, _user_id: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub updated_at: i64,
}

/// Object storage confined to one extension's key space.
#[async_trait::async_trait]
pub trait StorageService: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: Option<&str>) -> Result<ObjectInfo>;

    async fn get(&self, key: &str) -> Result<Option<(ObjectInfo, Vec<u8>)>>;

    /// Returns whether an object was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Time-limited download URL.
    async fn signed_url(&self, key: &str, ttl: std::time::Duration) -> Result<String>;
}

pub trait StorageProvider: Send + Sync {
    fn for_extension(&self, extension: &str) -> Arc<dyn StorageService>;
}

pub struct NoopStorage;

#[async_trait::async_trait]
impl StorageService for NoopStorage {
    async fn put(&self, _key: &str, _data: Vec<u8>, _content_type: Option<&str>) -> Result<ObjectInfo> {
        Err(ExtensionError::ServiceUnavailable("storage"))
    }

    async fn get(&self, _key: &str) -> Result<Option<(ObjectInfo, Vec<u8>)>> {
        Err(ExtensionError::ServiceUnavailable("storage"))
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Err(ExtensionError::ServiceUnavailable("storage"))
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<ObjectInfo>> {
        Err(ExtensionError::ServiceUnavailable("storage"))
    }

    async fn signed_url(&self, _key: &str, _ttl: std::time::Duration) -> Result<String> {
        Err(ExtensionError::ServiceUnavailable("storage"))
    }
}

// ============================================================================
// Config
// ============================================================================

/// Read access to the configuration applied to an extension.
pub trait ConfigService: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn all(&self) -> Value;
}

/// Live view of an extension's applied configuration.
///
/// The registry replaces the value every time a configuration is applied.
#[derive(Clone, Default)]
pub struct ConfigView {
    value: Arc<RwLock<Value>>,
}

impl ConfigView {
    pub fn new(value: Value) -> Self {
        Self {
            value: Arc::new(RwLock::new(value)),
        }
    }

    pub(crate) fn replace(&self, value: Value) {
        *self.value.write() = value;
    }
}

impl ConfigService for ConfigView {
    fn get(&self, key: &str) -> Option<Value> {
        self.value.read().get(key).cloned()
    }

    fn all(&self) -> Value {
        self.value.read().clone()
    }
}

// ============================================================================
// Collections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub schema: String,
}

/// Enumerates the data collections owned by an extension.
#[async_trait::async_trait]
pub trait CollectionsService: Send + Sync {
    async fn list(&self) -> Result<Vec<CollectionInfo>>;
}

pub trait CollectionsProvider: Send + Sync {
    fn for_schema(&self, schema: &str) -> Arc<dyn CollectionsService>;
}

pub struct NoopCollections;

#[async_trait::async_trait]
impl CollectionsService for NoopCollections {
    async fn list(&self) -> Result<Vec<CollectionInfo>> {
        Err(ExtensionError::ServiceUnavailable("collections"))
    }
}

// ============================================================================
// Stats
// ============================================================================

pub trait StatsService: Send + Sync {
    fn increment(&self, name: &str, by: u64);

    fn gauge(&self, name: &str, value: f64);

    fn snapshot(&self) -> BTreeMap<String, f64>;
}

pub trait StatsProvider: Send + Sync {
    fn for_extension(&self, extension: &str) -> Arc<dyn StatsService>;
}

pub struct NoopStats;

impl StatsService for NoopStats {
    fn increment(&self, _name: &str, _by: u64) {}

    fn gauge(&self, _name: &str, _value: f64) {}

    fn snapshot(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }
}

/// In-process counters and gauges, keyed by `<extension>.<name>`.
#[derive(Default)]
pub struct InMemoryStats {
    values: Arc<DashMap<String, f64>>,
}

impl InMemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// All values across extensions.
    pub fn all(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

struct ScopedStats {
    prefix: String,
    values: Arc<DashMap<String, f64>>,
}

impl StatsService for ScopedStats {
    fn increment(&self, name: &str, by: u64) {
        *self
            .values
            .entry(format!("{}{}", self.prefix, name))
            .or_insert(0.0) += by as f64;
    }

    fn gauge(&self, name: &str, value: f64) {
        self.values.insert(format!("{}{}", self.prefix, name), value);
    }

    fn snapshot(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .filter_map(|e| {
                e.key()
                    .strip_prefix(&self.prefix)
                    .map(|name| (name.to_string(), *e.value()))
            })
            .collect()
    }
}

impl StatsProvider for InMemoryStats {
    fn for_extension(&self, extension: &str) -> Arc<dyn StatsService> {
        Arc::new(ScopedStats {
            prefix: format!("{}.", extension),
            values: self.values.clone(),
        })
    }
}

// ============================================================================
// Logger
// ============================================================================

/// Structured logger tagged with the owning extension.
///
/// Events are emitted inside an `extension` span. Each [`with_field`] adds a
/// child `field` span carrying `key` and `value`, so subscribers see every
/// field as its own structured record.
///
/// [`with_field`]: ExtensionLogger::with_field
#[derive(Debug, Clone)]
pub struct ExtensionLogger {
    extension: Arc<str>,
    span: tracing::Span,
    fields: Arc<Vec<(String, String)>>,
}

impl ExtensionLogger {
    pub fn new(extension: &str) -> Self {
        Self {
            extension: Arc::from(extension),
            span: tracing::info_span!("extension", extension = %extension),
            fields: Arc::new(Vec::new()),
        }
    }

    /// Logger whose events also carry `key=value`.
    pub fn with_field(&self, key: &str, value: impl std::fmt::Display) -> Self {
        let value = value.to_string();
        let span = tracing::info_span!(parent: &self.span, "field", key = %key, value = %value);
        let mut fields = (*self.fields).clone();
        fields.push((key.to_string(), value));
        Self {
            extension: self.extension.clone(),
            span,
            fields: Arc::new(fields),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Fields added with [`with_field`](Self::with_field), oldest first.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn debug(&self, message: &str) {
        let _enter = self.span.enter();
        tracing::debug!("{}", message);
    }

    pub fn info(&self, message: &str) {
        let _enter = self.span.enter();
        tracing::info!("{}", message);
    }

    pub fn warn(&self, message: &str) {
        let _enter = self.span.enter();
        tracing::warn!("{}", message);
    }

    pub fn error(&self, message: &str) {
        let _enter = self.span.enter();
        tracing::error!("{}", message);
    }

    /// Logged at error level. Never terminates the host.
    pub fn fatal(&self, message: &str) {
        let _enter = self.span.enter();
        tracing::error!(fatal = true, "{}", message);
    }
}

// ============================================================================
// Facade
// ============================================================================

/// Capabilities handed to one extension.
#[derive(Clone)]
pub struct ExtensionServices {
    extension: String,
    db: Arc<dyn ExtensionDatabase>,
    auth: Arc<dyn AuthService>,
    logger: ExtensionLogger,
    storage: Arc<dyn StorageService>,
    config: ConfigView,
    collections: Arc<dyn CollectionsService>,
    stats: Arc<dyn StatsService>,
}

impl ExtensionServices {
    /// Services with every capability inert.
    pub fn inert(extension: &str, schema: &str) -> Self {
        ServiceProvider::new().scoped(extension, schema)
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn db(&self) -> Arc<dyn ExtensionDatabase> {
        self.db.clone()
    }

    pub fn auth(&self) -> Arc<dyn AuthService> {
        self.auth.clone()
    }

    pub fn logger(&self) -> ExtensionLogger {
        self.logger.clone()
    }

    pub fn storage(&self) -> Arc<dyn StorageService> {
        self.storage.clone()
    }

    pub fn config(&self) -> Arc<dyn ConfigService> {
        Arc::new(self.config.clone())
    }

    pub fn collections(&self) -> Arc<dyn CollectionsService> {
        self.collections.clone()
    }

    pub fn stats(&self) -> Arc<dyn StatsService> {
        self.stats.clone()
    }

    pub(crate) fn config_view(&self) -> &ConfigView {
        &self.config
    }

    pub(crate) fn with_database(mut self, db: Arc<dyn ExtensionDatabase>) -> Self {
        self.db = db;
        self
    }
}

/// Host-wide backends from which per-extension facades are built.
///
/// Every backend is optional.
#[derive(Clone, Default)]
pub struct ServiceProvider {
    database: Option<Arc<dyn DatabaseProvider>>,
    auth: Option<Arc<dyn AuthService>>,
    storage: Option<Arc<dyn StorageProvider>>,
    collections: Option<Arc<dyn CollectionsProvider>>,
    stats: Option<Arc<dyn StatsProvider>>,
}

impl ServiceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(mut self, database: Arc<dyn DatabaseProvider>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthService>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageProvider>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_collections(mut self, collections: Arc<dyn CollectionsProvider>) -> Self {
        self.collections = Some(collections);
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsProvider>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Host auth service, or the anonymous one.
    pub fn auth(&self) -> Arc<dyn AuthService> {
        self.auth.clone().unwrap_or_else(|| Arc::new(NoopAuth))
    }

    /// Build the facade for one extension.
    pub fn scoped(&self, extension: &str, schema: &str) -> ExtensionServices {
        let db = match &self.database {
            Some(provider) => provider.for_schema(schema),
            None => Arc::new(NoopDatabase::new(schema)) as Arc<dyn ExtensionDatabase>,
        };
        let storage = match &self.storage {
            Some(provider) => provider.for_extension(extension),
            None => Arc::new(NoopStorage) as Arc<dyn StorageService>,
        };
        let collections = match &self.collections {
            Some(provider) => provider.for_schema(schema),
            None => Arc::new(NoopCollections) as Arc<dyn CollectionsService>,
        };
        let stats = match &self.stats {
            Some(provider) => provider.for_extension(extension),
            None => Arc::new(NoopStats) as Arc<dyn StatsService>,
        };

        ExtensionServices {
            extension: extension.to_string(),
            db,
            auth: self.auth(),
            logger: ExtensionLogger::new(extension),
            storage,
            config: ConfigView::new(Value::Object(Default::default())),
            collections,
            stats,
        }
    }
}
