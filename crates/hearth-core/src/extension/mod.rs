//! Extension system for Hearth.
//!
//! Extensions are compiled into the host and handed to the
//! [`ExtensionManager`] as an explicit catalog. Each one contributes HTTP
//! routes, request middleware, hooks and its own database schema.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  ExtensionManager                    │
//! │  - Loads persisted settings                          │
//! │  - Registers the catalog, enables stored extensions  │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                  ExtensionRegistry                   │
//! │  - Owns extensions and their lifecycle state         │
//! │  - Composes routes, middleware and hooks             │
//! │  - Runs per-extension migrations                     │
//! └─────────────────────────────────────────────────────┘
//!          │               │               │
//!          ▼               ▼               ▼
//!   ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//!   │ /ext/<name> │ │ Middleware  │ │   Hooks     │
//!   │   routes    │ │   chain     │ │  by type    │
//!   └─────────────┘ └─────────────┘ └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use hearth_core::extension::{ExtensionManager, ManagerConfig, ServiceProvider};
//!
//! let manager = ExtensionManager::new(config, ServiceProvider::new(), migrations)?;
//! let report = manager.initialize(&manager.context(), catalog).await;
//!
//! let registry = manager.registry().clone();
//! let app = registry.apply_middleware(registry.register_routes(Router::new()));
//! ```

pub mod error;
pub mod hooks;
pub mod manager;
pub mod middleware;
pub mod migration;
pub mod registry;
pub mod routes;
pub mod services;
pub mod settings;
pub mod system;

pub use error::{ExtensionError, LifecyclePhase, Result};
pub use hooks::{FnHook, HookContext, HookHandler, HookOutcome, HookRegistration, HookType};
pub use manager::{ExtensionManager, InitializeReport, ManagerConfig};
pub use middleware::{ChainNext, MiddlewareFn, MiddlewareRegistration};
pub use migration::{MemoryMigrationStore, Migration, MigrationStore, VersionScheme};
pub use registry::{ExtensionInfo, ExtensionRegistry, HealthReport, ShutdownReport};
pub use routes::{extension_mount_path, ExtensionRouter, RouteRegistration, EXTENSION_ROUTE_PREFIX};
pub use services::{
    AuthService, AuthUser, CollectionInfo, CollectionsProvider, CollectionsService, ConfigService,
    DatabaseProvider, ExtensionDatabase, ExtensionLogger, ExtensionServices, InMemoryStats,
    ObjectInfo, Row, ServiceProvider, Statement, StatsProvider, StatsService, StorageProvider,
    StorageService,
};
pub use settings::{ExtensionConfig, ExtensionSettings, SaveOutcome};
pub use system::{
    is_valid_extension_name, schema_name_for, DynExtension, Extension, ExtensionContext,
    ExtensionMetadata, ExtensionState, HealthCheck, HealthState, HealthStatus, Permission,
    DEFAULT_LIFECYCLE_TIMEOUT, HOST_VERSION,
};
