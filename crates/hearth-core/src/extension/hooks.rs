//! Hook extension points.
//!
//! The host fires a [`HookType`] at a well-defined moment; every enabled
//! extension that registered for it runs in ascending priority order, ties
//! broken by registration order.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{ExtensionError, Result};

/// Extension points fired by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    PreRequest,
    PostRequest,
    PreResponse,
    PostResponse,
    Error,
    Authentication,
    Authorization,
    PostAuth,
    PreDatabase,
    PostDatabase,
}

impl HookType {
    pub const ALL: [HookType; 10] = [
        HookType::PreRequest,
        HookType::PostRequest,
        HookType::PreResponse,
        HookType::PostResponse,
        HookType::Error,
        HookType::Authentication,
        HookType::Authorization,
        HookType::PostAuth,
        HookType::PreDatabase,
        HookType::PostDatabase,
    ];

    /// A blocking chain stops at the first failing handler and reports it.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            HookType::PreRequest
                | HookType::PreResponse
                | HookType::Authentication
                | HookType::Authorization
                | HookType::PreDatabase
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::PreRequest => "pre_request",
            HookType::PostRequest => "post_request",
            HookType::PreResponse => "pre_response",
            HookType::PostResponse => "post_response",
            HookType::Error => "error",
            HookType::Authentication => "authentication",
            HookType::Authorization => "authorization",
            HookType::PostAuth => "post_auth",
            HookType::PreDatabase => "pre_database",
            HookType::PostDatabase => "post_database",
        }
    }
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data passed along a hook chain. Handlers may read and annotate it.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub hook_type: HookType,
    pub request_id: Uuid,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status: Option<u16>,
    pub user_id: Option<String>,
    pub error: Option<String>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl HookContext {
    pub fn new(hook_type: HookType) -> Self {
        Self {
            hook_type,
            request_id: Uuid::new_v4(),
            method: None,
            path: None,
            status: None,
            user_id: None,
            error: None,
            data: serde_json::Map::new(),
        }
    }

    pub fn for_request(hook_type: HookType, method: impl Into<String>, path: impl Into<String>) -> Self {
        let mut ctx = Self::new(hook_type);
        ctx.method = Some(method.into());
        ctx.path = Some(path.into());
        ctx
    }

    /// Reuse request details for a follow-up hook type.
    pub fn with_type(mut self, hook_type: HookType) -> Self {
        self.hook_type = hook_type;
        self
    }
}

/// Handler attached to a hook.
#[async_trait::async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, ctx: &mut HookContext) -> Result<()>;
}

/// Adapter for synchronous closures.
pub struct FnHook<F>(pub F);

#[async_trait::async_trait]
impl<F> HookHandler for FnHook<F>
where
    F: Fn(&mut HookContext) -> Result<()> + Send + Sync,
{
    async fn handle(&self, ctx: &mut HookContext) -> Result<()> {
        (self.0)(ctx)
    }
}

/// A hook contributed by an extension.
#[derive(Clone)]
pub struct HookRegistration {
    /// Owning extension. Overwritten by the registry when composed.
    pub extension: String,
    pub name: String,
    pub hook_type: HookType,
    pub priority: i32,
    pub handler: Arc<dyn HookHandler>,
}

impl HookRegistration {
    pub fn new(
        name: impl Into<String>,
        hook_type: HookType,
        priority: i32,
        handler: Arc<dyn HookHandler>,
    ) -> Self {
        Self {
            extension: String::new(),
            name: name.into(),
            hook_type,
            priority,
            handler,
        }
    }

    /// Register a synchronous closure.
    pub fn from_fn<F>(name: impl Into<String>, hook_type: HookType, priority: i32, f: F) -> Self
    where
        F: Fn(&mut HookContext) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, hook_type, priority, Arc::new(FnHook(f)))
    }
}

impl std::fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistration")
            .field("extension", &self.extension)
            .field("name", &self.name)
            .field("hook_type", &self.hook_type)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Errors collected from a non-blocking chain.
#[derive(Debug, Default)]
pub struct HookOutcome {
    pub executed: usize,
    pub errors: Vec<ExtensionError>,
}

// ============================================================================
// Composed hook table
// ============================================================================

#[derive(Clone)]
pub(crate) struct HookEntry {
    pub seq: u64,
    pub registration: HookRegistration,
}

/// Hooks of all enabled extensions, grouped by type and kept sorted.
#[derive(Default)]
pub(crate) struct HookTable {
    chains: HashMap<HookType, Arc<Vec<HookEntry>>>,
}

impl HookTable {
    pub fn insert(&mut self, seq: u64, registration: HookRegistration) {
        let chain = self.chains.entry(registration.hook_type).or_default();
        let mut entries: Vec<HookEntry> = chain.as_ref().clone();
        entries.push(HookEntry { seq, registration });
        entries.sort_by_key(|e| (e.registration.priority, e.seq));
        *chain = Arc::new(entries);
    }

    /// Drop every hook tagged with `extension`. Returns how many were removed.
    pub fn remove_extension(&mut self, extension: &str) -> usize {
        let mut removed = 0;
        for chain in self.chains.values_mut() {
            let before = chain.len();
            let kept: Vec<HookEntry> = chain
                .iter()
                .filter(|e| e.registration.extension != extension)
                .cloned()
                .collect();
            removed += before - kept.len();
            if kept.len() != before {
                *chain = Arc::new(kept);
            }
        }
        self.chains.retain(|_, chain| !chain.is_empty());
        removed
    }

    pub fn chain(&self, hook_type: HookType) -> Arc<Vec<HookEntry>> {
        self.chains.get(&hook_type).cloned().unwrap_or_default()
    }

    pub fn count_for(&self, extension: &str) -> usize {
        self.chains
            .values()
            .flat_map(|chain| chain.iter())
            .filter(|e| e.registration.extension == extension)
            .count()
    }
}

/// Run a chain snapshot against a context.
pub(crate) async fn run_chain(chain: &[HookEntry], ctx: &mut HookContext) -> Result<HookOutcome> {
    let blocking = ctx.hook_type.is_blocking();
    let mut outcome = HookOutcome::default();

    for entry in chain {
        let reg = &entry.registration;
        let result = AssertUnwindSafe(reg.handler.handle(ctx)).catch_unwind().await;
        outcome.executed += 1;

        let error = match result {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(_) => ExtensionError::other("hook handler panicked"),
        };
        let error = ExtensionError::HookFailed {
            extension: reg.extension.clone(),
            hook: reg.name.clone(),
            source: Box::new(error),
        };

        if blocking {
            tracing::debug!(
                extension = %reg.extension,
                hook = %reg.name,
                hook_type = %ctx.hook_type,
                error = %error,
                "Blocking hook aborted chain"
            );
            return Err(error);
        }
        tracing::warn!(
            extension = %reg.extension,
            hook = %reg.name,
            hook_type = %ctx.hook_type,
            error = %error,
            "Hook handler failed"
        );
        outcome.errors.push(error);
    }

    Ok(outcome)
}
