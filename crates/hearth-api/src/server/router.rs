//! Application router configuration.

use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use super::state::ApiState;
use crate::handlers::{basic, extensions, storage};

/// Admin API, signed downloads and every extension route, wrapped in the
/// composed extension middleware.
pub fn create_router(state: ApiState, max_body_bytes: usize) -> Router {
    let registry = state.registry().clone();

    let api = Router::new()
        .route("/api/health", get(basic::health_handler))
        .route("/api/extensions", get(extensions::list_extensions_handler))
        .route("/api/extensions/health", get(extensions::health_report_handler))
        .route("/api/extensions/:name", get(extensions::get_extension_handler))
        .route(
            "/api/extensions/:name/enable",
            post(extensions::enable_extension_handler),
        )
        .route(
            "/api/extensions/:name/disable",
            post(extensions::disable_extension_handler),
        )
        .route(
            "/api/extensions/:name/config",
            get(extensions::get_config_handler).put(extensions::update_config_handler),
        )
        .route(
            "/api/extensions/:name/health",
            get(extensions::extension_health_handler),
        )
        .route(
            "/storage/:extension/*key",
            get(storage::signed_download_handler),
        )
        .with_state(state);

    let router = registry.register_routes(api);
    registry
        .apply_middleware(router)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}
