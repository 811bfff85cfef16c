//! Storage layer for Hearth.
//!
//! This crate implements the extension-facing persistence services:
//! - Schema-scoped SQLite databases (one database per extension schema)
//! - The migration ledger and SQL migration runner
//! - Collection listing over a schema
//! - redb object storage with signed download URLs
//!
//! ## Example
//!
//! ```rust,ignore
//! use hearth_storage::{HostStorage, HostStorageConfig};
//!
//! let storage = HostStorage::open(HostStorageConfig::in_memory("secret")).await?;
//! let services = storage.service_provider();
//! ```

pub mod collections;
pub mod database;
pub mod error;
pub mod migrations;
pub mod objects;

use std::path::PathBuf;
use std::sync::Arc;

use hearth_core::extension::ServiceProvider;

pub use collections::SqliteCollections;
pub use database::{DatabaseConfig, SchemaDatabase, SqliteDatabaseProvider};
pub use error::{Error, Result};
pub use migrations::SqliteMigrationStore;
pub use objects::{validate_key, ObjectStore, ObjectStoreConfig};

/// Where host storage lives.
#[derive(Debug, Clone)]
pub struct HostStorageConfig {
    /// Data directory. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub max_connections: u32,
    pub signing_secret: String,
    pub public_url: String,
}

impl HostStorageConfig {
    pub fn in_memory(signing_secret: impl Into<String>) -> Self {
        Self {
            data_dir: None,
            max_connections: 1,
            signing_secret: signing_secret.into(),
            public_url: String::new(),
        }
    }

    pub fn on_disk(data_dir: impl Into<PathBuf>, signing_secret: impl Into<String>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            max_connections: 5,
            signing_secret: signing_secret.into(),
            public_url: String::new(),
        }
    }

    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into();
        self
    }
}

/// Every storage backend the host hands to extensions.
#[derive(Clone)]
pub struct HostStorage {
    pub databases: SqliteDatabaseProvider,
    pub migrations: Arc<SqliteMigrationStore>,
    pub collections: SqliteCollections,
    pub objects: ObjectStore,
}

impl HostStorage {
    pub async fn open(config: HostStorageConfig) -> Result<Self> {
        let db_config = match &config.data_dir {
            Some(dir) => DatabaseConfig::with_data_dir(dir).max_connections(config.max_connections),
            None => DatabaseConfig::in_memory(),
        };
        let databases = SqliteDatabaseProvider::new(db_config);

        let ledger_path = config.data_dir.as_ref().map(|dir| dir.join("hearth.db"));
        let migrations = SqliteMigrationStore::open(ledger_path, databases.clone()).await?;

        let mut object_config =
            ObjectStoreConfig::new(config.signing_secret).with_public_url(config.public_url);
        if let Some(dir) = &config.data_dir {
            object_config = object_config.with_path(dir.join("objects.redb"));
        }
        let objects = ObjectStore::open(object_config)?;

        tracing::info!(data_dir = ?config.data_dir, "Host storage opened");

        Ok(Self {
            collections: SqliteCollections::new(databases.clone()),
            databases,
            migrations: Arc::new(migrations),
            objects,
        })
    }

    /// Service provider wired to these backends.
    pub fn service_provider(&self) -> ServiceProvider {
        ServiceProvider::new()
            .with_database(Arc::new(self.databases.clone()))
            .with_collections(Arc::new(self.collections.clone()))
            .with_storage(Arc::new(self.objects.clone()))
    }

    pub async fn close(&self) {
        self.databases.close().await;
    }
}
