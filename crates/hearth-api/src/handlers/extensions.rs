//! Extension admin handlers.
//!
//! Reads are public. Enable, disable and configuration changes require an
//! admin token and are persisted to the extension settings file.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use hearth_core::extension::{ExtensionInfo, HealthReport, HealthStatus, SaveOutcome};

use crate::auth::AdminUser;
use crate::models::{ok, ApiError, HandlerResult};
use crate::server::ApiState;

/// Result of a state-changing admin call.
#[derive(Debug, Serialize)]
pub struct ChangeResult {
    pub extension: ExtensionInfo,
    /// Whether the change reached the settings file.
    pub settings: SaveOutcome,
}

#[derive(Debug, Serialize)]
pub struct ConfigView {
    pub schema: Value,
    /// Configuration currently applied, or the stored one if not enabled.
    pub config: Value,
}

fn info(state: &ApiState, name: &str) -> Result<ExtensionInfo, ApiError> {
    state
        .registry()
        .info(name)
        .ok_or_else(|| ApiError::not_found(format!("Extension not found: {}", name)))
}

pub async fn list_extensions_handler(State(state): State<ApiState>) -> HandlerResult<Vec<ExtensionInfo>> {
    ok(state.registry().list())
}

pub async fn get_extension_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> HandlerResult<ExtensionInfo> {
    ok(info(&state, &name)?)
}

pub async fn enable_extension_handler(
    State(state): State<ApiState>,
    AdminUser(admin): AdminUser,
    Path(name): Path<String>,
) -> HandlerResult<ChangeResult> {
    let ctx = state.manager.context();
    let settings = state.manager.enable(&ctx, &name).await?;
    tracing::info!(extension = %name, user = %admin.id, "Extension enabled via API");
    ok(ChangeResult {
        extension: info(&state, &name)?,
        settings,
    })
}

pub async fn disable_extension_handler(
    State(state): State<ApiState>,
    AdminUser(admin): AdminUser,
    Path(name): Path<String>,
) -> HandlerResult<ChangeResult> {
    let ctx = state.manager.context();
    let settings = state.manager.disable(&ctx, &name).await?;
    tracing::info!(extension = %name, user = %admin.id, "Extension disabled via API");
    ok(ChangeResult {
        extension: info(&state, &name)?,
        settings,
    })
}

pub async fn get_config_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> HandlerResult<ConfigView> {
    let schema = state.registry().config_schema(&name).await?;
    let config = state
        .registry()
        .applied_config(&name)
        .or_else(|| {
            state
                .manager
                .settings()
                .get(&name)
                .map(|s| s.config.clone())
        })
        .unwrap_or(Value::Null);
    ok(ConfigView { schema, config })
}

pub async fn update_config_handler(
    State(state): State<ApiState>,
    AdminUser(admin): AdminUser,
    Path(name): Path<String>,
    Json(config): Json<Value>,
) -> HandlerResult<ChangeResult> {
    let ctx = state.manager.context();
    let settings = state.manager.configure(&ctx, &name, config).await?;
    tracing::info!(extension = %name, user = %admin.id, "Extension configured via API");
    ok(ChangeResult {
        extension: info(&state, &name)?,
        settings,
    })
}

pub async fn extension_health_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> HandlerResult<HealthStatus> {
    let ctx = state.manager.context();
    ok(state.registry().health(&ctx, &name).await?)
}

pub async fn health_report_handler(State(state): State<ApiState>) -> HandlerResult<HealthReport> {
    let ctx = state.manager.context();
    ok(state.registry().health_report(&ctx).await)
}
