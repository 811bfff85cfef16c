//! Composed middleware chain.
//!
//! Extensions contribute [`MiddlewareRegistration`]s. The registry keeps them
//! sorted by ascending priority (lower runs first, closest to the raw
//! request), ties broken by registration order, and runs the chain in front
//! of the host handler through a single axum layer.

use std::future::Future;
use std::sync::Arc;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use futures::future::BoxFuture;

/// Type-erased middleware function.
pub type MiddlewareFn = Arc<dyn Fn(Request, ChainNext) -> BoxFuture<'static, Response> + Send + Sync>;

/// A middleware contributed by an extension.
#[derive(Clone)]
pub struct MiddlewareRegistration {
    /// Owning extension. Overwritten by the registry when composed.
    pub extension: String,
    pub name: String,
    pub priority: i32,
    pub handler: MiddlewareFn,
}

impl MiddlewareRegistration {
    pub fn new<F, Fut>(name: impl Into<String>, priority: i32, handler: F) -> Self
    where
        F: Fn(Request, ChainNext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let handler: MiddlewareFn = Arc::new(move |req, next| Box::pin(handler(req, next)));
        Self {
            extension: String::new(),
            name: name.into(),
            priority,
            handler,
        }
    }
}

impl std::fmt::Debug for MiddlewareRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareRegistration")
            .field("extension", &self.extension)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

#[derive(Clone)]
pub(crate) struct MiddlewareEntry {
    pub seq: u64,
    pub registration: MiddlewareRegistration,
}

/// Sorted middleware of all enabled extensions.
#[derive(Default)]
pub(crate) struct MiddlewareTable {
    chain: Arc<Vec<MiddlewareEntry>>,
}

impl MiddlewareTable {
    pub fn insert(&mut self, seq: u64, registration: MiddlewareRegistration) {
        let mut entries: Vec<MiddlewareEntry> = self.chain.as_ref().clone();
        entries.push(MiddlewareEntry { seq, registration });
        entries.sort_by_key(|e| (e.registration.priority, e.seq));
        self.chain = Arc::new(entries);
    }

    pub fn remove_extension(&mut self, extension: &str) -> usize {
        let before = self.chain.len();
        let kept: Vec<MiddlewareEntry> = self
            .chain
            .iter()
            .filter(|e| e.registration.extension != extension)
            .cloned()
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.chain = Arc::new(kept);
        }
        removed
    }

    /// Snapshot handed to an in-flight request.
    pub fn snapshot(&self) -> Arc<Vec<MiddlewareEntry>> {
        self.chain.clone()
    }

    pub fn count_for(&self, extension: &str) -> usize {
        self.chain
            .iter()
            .filter(|e| e.registration.extension == extension)
            .count()
    }

    pub fn names(&self) -> Vec<(String, String)> {
        self.chain
            .iter()
            .map(|e| (e.registration.extension.clone(), e.registration.name.clone()))
            .collect()
    }
}

/// Continuation handed to each middleware.
///
/// Calling [`ChainNext::run`] invokes the next middleware in the chain, or the
/// wrapped handler once the chain is exhausted.
pub struct ChainNext {
    chain: Arc<Vec<MiddlewareEntry>>,
    position: usize,
    inner: Next,
}

impl ChainNext {
    pub(crate) fn new(chain: Arc<Vec<MiddlewareEntry>>, inner: Next) -> Self {
        Self {
            chain,
            position: 0,
            inner,
        }
    }

    pub async fn run(mut self, request: Request) -> Response {
        let handler = self
            .chain
            .get(self.position)
            .map(|entry| entry.registration.handler.clone());
        match handler {
            Some(handler) => {
                self.position += 1;
                handler(request, self).await
            }
            None => self.inner.run(request).await,
        }
    }
}
