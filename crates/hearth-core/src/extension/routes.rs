//! Extension routes.
//!
//! Routes are declared relative to the extension and mounted under
//! `/ext/<name>`, so two extensions may both define `/dashboard`.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::{OriginalUri, Request, State};
use axum::http::StatusCode;
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::MethodRouter;
use axum::Router;

use super::error::{ExtensionError, Result};
use super::hooks::{HookContext, HookType};
use super::registry::HookDispatcher;
use super::services::AuthService;

/// Path prefix every extension namespace lives under.
pub const EXTENSION_ROUTE_PREFIX: &str = "/ext";

/// Mount point of an extension.
pub fn extension_mount_path(name: &str) -> String {
    format!("{}/{}", EXTENSION_ROUTE_PREFIX, name)
}

/// A route declared by an extension.
pub struct RouteRegistration {
    /// Path relative to the extension namespace, starting with `/`.
    pub path: String,
    pub method_router: MethodRouter,
    /// Reject unauthenticated requests before they reach the handler.
    pub require_auth: bool,
}

impl std::fmt::Debug for RouteRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRegistration")
            .field("path", &self.path)
            .field("require_auth", &self.require_auth)
            .finish()
    }
}

/// Collects the routes of one extension during enable.
#[derive(Debug, Default)]
pub struct ExtensionRouter {
    routes: Vec<RouteRegistration>,
}

impl ExtensionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&mut self, path: impl Into<String>, method_router: MethodRouter) -> &mut Self {
        self.register(RouteRegistration {
            path: path.into(),
            method_router,
            require_auth: false,
        })
    }

    /// Add a route that requires an authenticated user.
    pub fn route_with_auth(&mut self, path: impl Into<String>, method_router: MethodRouter) -> &mut Self {
        self.register(RouteRegistration {
            path: path.into(),
            method_router,
            require_auth: true,
        })
    }

    pub fn register(&mut self, registration: RouteRegistration) -> &mut Self {
        self.routes.push(registration);
        self
    }

    pub fn routes(&self) -> &[RouteRegistration] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub(crate) fn into_routes(self) -> Vec<RouteRegistration> {
        self.routes
    }
}

/// State of the auth layer on protected routes.
struct AuthGate {
    extension: String,
    auth: Arc<dyn AuthService>,
    hooks: HookDispatcher,
}

/// Resolve the user and run the `authentication`, `authorization` and
/// `post_auth` chains. On success the user is inserted into request
/// extensions.
async fn require_auth(State(gate): State<Arc<AuthGate>>, mut request: Request, next: Next) -> Response {
    let user = match gate.auth.current_user(request.headers()).await {
        Ok(Some(user)) => user,
        Ok(None) => return ExtensionError::Unauthorized("authentication required".into()).into_response(),
        Err(e) => return e.into_response(),
    };

    let path = match request.extensions().get::<OriginalUri>() {
        Some(uri) => uri.0.path().to_string(),
        None => request.uri().path().to_string(),
    };
    let mut ctx = HookContext::for_request(HookType::Authentication, request.method().as_str(), path);
    ctx.user_id = Some(user.id.clone());
    ctx.data.insert("extension".into(), gate.extension.clone().into());
    ctx.data.insert("roles".into(), user.roles.clone().into());

    if let Err(e) = gate.hooks.fire(HookType::Authentication, &mut ctx).await {
        return rejection(e, ExtensionError::Unauthorized);
    }
    if let Err(e) = gate.hooks.fire(HookType::Authorization, &mut ctx).await {
        return rejection(e, ExtensionError::PermissionDenied);
    }
    let _ = gate.hooks.fire(HookType::PostAuth, &mut ctx).await;

    request.extensions_mut().insert(user);
    next.run(request).await
}

/// Keep a hook's own 401 or 403, otherwise answer with `fallback`.
fn rejection(err: ExtensionError, fallback: fn(String) -> ExtensionError) -> Response {
    match err.status_code() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => err.into_response(),
        _ => fallback(err.to_string()).into_response(),
    }
}

/// A composed, mountable router for one extension.
pub(crate) struct CompiledRoutes {
    pub router: Router,
    pub paths: Vec<String>,
}

/// Validate and compile the routes of an extension.
pub(crate) fn compile_routes(
    extension: &str,
    routes: Vec<RouteRegistration>,
    auth: Arc<dyn AuthService>,
    hooks: HookDispatcher,
) -> Result<CompiledRoutes> {
    let mut seen = HashSet::new();
    for route in &routes {
        if !route.path.starts_with('/') {
            return Err(ExtensionError::Registration {
                extension: extension.to_string(),
                message: format!("route path {:?} must start with '/'", route.path),
            });
        }
        if !seen.insert(route.path.clone()) {
            return Err(ExtensionError::Registration {
                extension: extension.to_string(),
                message: format!("route path {:?} declared twice", route.path),
            });
        }
    }

    let paths: Vec<String> = routes.iter().map(|r| r.path.clone()).collect();
    // The host strips EXTENSION_ROUTE_PREFIX before dispatching.
    let mount = format!("/{}", extension);

    if routes.is_empty() {
        return Ok(CompiledRoutes {
            router: Router::new(),
            paths: Vec::new(),
        });
    }

    let gate = Arc::new(AuthGate {
        extension: extension.to_string(),
        auth,
        hooks,
    });

    // axum panics on malformed or conflicting paths
    let built = std::panic::catch_unwind(AssertUnwindSafe(move || {
        let mut inner = Router::new();
        for route in routes {
            let method_router = if route.require_auth {
                route
                    .method_router
                    .route_layer(from_fn_with_state(gate.clone(), require_auth))
            } else {
                route.method_router
            };
            inner = inner.route(&route.path, method_router);
        }
        Router::new().nest(&mount, inner)
    }));

    match built {
        Ok(router) => Ok(CompiledRoutes { router, paths }),
        Err(_) => Err(ExtensionError::Registration {
            extension: extension.to_string(),
            message: "router rejected the declared routes".to_string(),
        }),
    }
}

/// Routers of all enabled extensions, keyed by extension name.
#[derive(Default)]
pub(crate) struct RouteTable {
    routers: HashMap<String, Router>,
    paths: HashMap<String, Vec<String>>,
}

impl RouteTable {
    pub fn insert(&mut self, extension: &str, compiled: CompiledRoutes) {
        self.routers.insert(extension.to_string(), compiled.router);
        self.paths.insert(extension.to_string(), compiled.paths);
    }

    pub fn remove_extension(&mut self, extension: &str) -> usize {
        self.routers.remove(extension);
        self.paths.remove(extension).map(|p| p.len()).unwrap_or(0)
    }

    pub fn router(&self, extension: &str) -> Option<Router> {
        self.routers.get(extension).cloned()
    }

    pub fn count_for(&self, extension: &str) -> usize {
        self.paths.get(extension).map(Vec::len).unwrap_or(0)
    }

    /// Fully-qualified mounted paths, sorted.
    pub fn mounted_paths(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .paths
            .iter()
            .flat_map(|(ext, paths)| {
                let mount = extension_mount_path(ext);
                paths.iter().map(move |p| {
                    if p == "/" {
                        mount.clone()
                    } else {
                        format!("{}{}", mount, p)
                    }
                })
            })
            .collect();
        all.sort();
        all
    }
}

/// Extract the extension name from a `/<name>/...` path, relative to
/// [`EXTENSION_ROUTE_PREFIX`].
pub(crate) fn extension_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix('/')?;
    let name = rest.split('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
