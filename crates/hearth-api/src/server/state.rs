//! Shared handler state.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use hearth_core::extension::{ExtensionManager, ExtensionRegistry};
use hearth_storage::ObjectStore;

use crate::auth::TokenAuthService;

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<ExtensionManager>,
    /// Host object store, used to serve signed downloads.
    pub objects: ObjectStore,
    pub auth: Arc<TokenAuthService>,
    pub started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(manager: Arc<ExtensionManager>, objects: ObjectStore, auth: Arc<TokenAuthService>) -> Self {
        Self {
            manager,
            objects,
            auth,
            started_at: Utc::now(),
        }
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        self.manager.registry()
    }
}
