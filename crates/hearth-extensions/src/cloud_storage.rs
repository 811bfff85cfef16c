//! File storage for authenticated users.
//!
//! Objects live in the extension's key space of the host object store.
//! Download links are signed by the host and served from `/storage`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};

use hearth_core::extension::{
    Extension, ExtensionContext, ExtensionError, ExtensionMetadata, ExtensionRouter,
    ExtensionServices, HealthState, HealthStatus, Permission, Result,
};

use crate::common::{invalid_config, ok, parse_config, require_services};

pub const NAME: &str = "cloud-storage";

const MAX_LINK_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CloudStorageSettings {
    pub max_object_bytes: u64,
    /// Lifetime of a download link when the caller does not ask for one.
    pub link_ttl_secs: u64,
}

impl Default for CloudStorageSettings {
    fn default() -> Self {
        Self {
            max_object_bytes: 10 * 1024 * 1024,
            link_ttl_secs: 15 * 60,
        }
    }
}

#[derive(Clone)]
struct StorageState {
    services: ExtensionServices,
    settings: Arc<RwLock<CloudStorageSettings>>,
}

pub struct CloudStorageExtension {
    metadata: ExtensionMetadata,
    settings: Arc<RwLock<CloudStorageSettings>>,
    services: Option<ExtensionServices>,
}

impl CloudStorageExtension {
    pub fn new() -> Self {
        Self {
            metadata: ExtensionMetadata::new(NAME, semver::Version::new(0, 4, 1))
                .with_description("Upload, download and share files")
                .with_author("Hearth")
                .with_license("Apache-2.0")
                .with_tags(["storage", "files"]),
            settings: Arc::new(RwLock::new(CloudStorageSettings::default())),
            services: None,
        }
    }
}

impl Default for CloudStorageExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for CloudStorageExtension {
    fn metadata(&self) -> &ExtensionMetadata {
        &self.metadata
    }

    async fn initialize(&mut self, _ctx: &ExtensionContext, services: ExtensionServices) -> Result<()> {
        self.services = Some(services);
        Ok(())
    }

    async fn health(&self, _ctx: &ExtensionContext) -> Result<HealthStatus> {
        let Some(services) = &self.services else {
            return Ok(HealthStatus::new(HealthState::Unknown).with_message("not initialized"));
        };
        let status = match services.storage().list("").await {
            Ok(objects) => HealthStatus::healthy()
                .with_message(format!("{} objects", objects.len()))
                .with_check("storage", HealthState::Healthy, None),
            Err(e) => HealthStatus::healthy().with_check(
                "storage",
                HealthState::Unhealthy,
                Some(e.to_string()),
            ),
        };
        Ok(status)
    }

    fn register_routes(&self, router: &mut ExtensionRouter) -> Result<()> {
        let state = StorageState {
            services: require_services(NAME, &self.services)?.clone(),
            settings: self.settings.clone(),
        };
        router
            .route_with_auth("/files", get(list_files).with_state(state.clone()))
            .route_with_auth(
                "/files/*key",
                get(download)
                    .put(upload)
                    .delete(remove)
                    .with_state(state.clone()),
            )
            .route_with_auth("/links/*key", post(create_link).with_state(state));
        Ok(())
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "max_object_bytes": { "type": "integer", "minimum": 1, "default": 10485760 },
                "link_ttl_secs": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_LINK_TTL_SECS,
                    "default": 900
                }
            },
            "additionalProperties": false
        })
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let settings: CloudStorageSettings = parse_config(NAME, config)?;
        if settings.max_object_bytes == 0 {
            return Err(invalid_config(NAME, "max_object_bytes must be positive"));
        }
        if settings.link_ttl_secs == 0 || settings.link_ttl_secs > MAX_LINK_TTL_SECS {
            return Err(invalid_config(
                NAME,
                format!("link_ttl_secs must be between 1 and {}", MAX_LINK_TTL_SECS),
            ));
        }
        Ok(())
    }

    async fn apply_config(&mut self, config: &Value) -> Result<()> {
        *self.settings.write() = parse_config(NAME, config)?;
        Ok(())
    }

    fn required_permissions(&self) -> Vec<Permission> {
        vec![
            Permission::new("storage.read", "List and download files"),
            Permission::new("storage.write", "Upload and delete files"),
        ]
    }
}

// ============================================================================
// Handlers
// ============================================================================

type HandlerResult<T> = std::result::Result<T, ExtensionError>;

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    prefix: String,
}

async fn list_files(
    State(state): State<StorageState>,
    Query(query): Query<ListQuery>,
) -> HandlerResult<Json<Value>> {
    Ok(ok(state.services.storage().list(&query.prefix).await?))
}

async fn upload(
    State(state): State<StorageState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> HandlerResult<(StatusCode, Json<Value>)> {
    let limit = state.settings.read().max_object_bytes;
    if body.len() as u64 > limit {
        return Err(ExtensionError::InvalidInput(format!(
            "object of {} bytes exceeds the {} byte limit",
            body.len(),
            limit
        )));
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let info = state
        .services
        .storage()
        .put(&key, body.to_vec(), content_type)
        .await?;
    state.services.stats().increment("uploads", 1);
    Ok((StatusCode::CREATED, ok(info)))
}

async fn download(
    State(state): State<StorageState>,
    Path(key): Path<String>,
) -> HandlerResult<Response> {
    let (info, data) = state
        .services
        .storage()
        .get(&key)
        .await?
        .ok_or_else(|| ExtensionError::NotFound(format!("object {}", key)))?;
    let content_type = info
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}

async fn remove(
    State(state): State<StorageState>,
    Path(key): Path<String>,
) -> HandlerResult<StatusCode> {
    if state.services.storage().delete(&key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ExtensionError::NotFound(format!("object {}", key)))
    }
}

#[derive(Debug, Deserialize)]
struct LinkQuery {
    ttl_secs: Option<u64>,
}

async fn create_link(
    State(state): State<StorageState>,
    Path(key): Path<String>,
    Query(query): Query<LinkQuery>,
) -> HandlerResult<Json<Value>> {
    let ttl = query
        .ttl_secs
        .unwrap_or_else(|| state.settings.read().link_ttl_secs)
        .clamp(1, MAX_LINK_TTL_SECS);
    let storage = state.services.storage();
    if storage.get(&key).await?.is_none() {
        return Err(ExtensionError::NotFound(format!("object {}", key)));
    }
    let url = storage.signed_url(&key, Duration::from_secs(ttl)).await?;
    Ok(ok(json!({ "key": key, "url": url, "expires_in": ttl })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_bounds() {
        let ext = CloudStorageExtension::new();
        assert!(ext.validate_config(&json!({})).is_ok());
        assert!(ext.validate_config(&json!({ "link_ttl_secs": 60 })).is_ok());
        assert!(ext.validate_config(&json!({ "link_ttl_secs": 0 })).is_err());
        assert!(ext
            .validate_config(&json!({ "link_ttl_secs": MAX_LINK_TTL_SECS + 1 }))
            .is_err());
        assert!(ext.validate_config(&json!({ "max_object_bytes": 0 })).is_err());
    }

    #[tokio::test]
    async fn test_health_reports_missing_storage() {
        let mut ext = CloudStorageExtension::new();
        let ctx = ExtensionContext::new();
        ext.initialize(&ctx, ExtensionServices::inert(NAME, "cloud_storage"))
            .await
            .unwrap();
        let health = ext.health(&ctx).await.unwrap();
        assert_eq!(health.status, HealthState::Unhealthy);
        assert!(health.checks.contains_key("storage"));
    }
}
