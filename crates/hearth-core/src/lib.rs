//! Core traits and types for Hearth.
//!
//! This crate defines the extension contract and the runtime that hosts it.

pub mod extension;

pub use extension::{
    Extension, ExtensionContext, ExtensionError, ExtensionManager, ExtensionMetadata,
    ExtensionRegistry, ExtensionServices, ExtensionState, Result,
};

/// Re-exports commonly used types.
pub mod prelude {
    // Error handling
    pub use crate::extension::error::{ExtensionError, Result};

    // Contract
    pub use crate::extension::system::{
        Extension, ExtensionContext, ExtensionMetadata, ExtensionState, HealthState, HealthStatus,
        Permission,
    };

    // Contributions
    pub use crate::extension::hooks::{HookContext, HookRegistration, HookType};
    pub use crate::extension::middleware::{ChainNext, MiddlewareRegistration};
    pub use crate::extension::migration::Migration;
    pub use crate::extension::routes::ExtensionRouter;

    // Services
    pub use crate::extension::services::{
        AuthUser, ConfigService, ExtensionDatabase, ExtensionServices, StatsService,
        StorageService,
    };
}
