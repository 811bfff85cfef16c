//! Page-view analytics.
//!
//! Records every request that passes the host as a page view, times requests
//! through a middleware, and serves a small dashboard under
//! `/ext/analytics`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::Json;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};

use hearth_core::extension::{
    Extension, ExtensionContext, ExtensionError, ExtensionMetadata, ExtensionRouter,
    ExtensionServices, HealthState, HealthStatus, HookContext, HookHandler, HookRegistration,
    HookType, MiddlewareRegistration, Migration, Result,
};

use crate::common::{invalid_config, ok, parse_config, require_services, timestamp};

pub const NAME: &str = "analytics";

const DEFAULT_EVENT_LIMIT: u32 = 50;
const MAX_EVENT_LIMIT: u32 = 500;
const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyticsSettings {
    /// Path prefixes that are never recorded.
    pub exclude_paths: Vec<String>,
    /// Page views older than this are pruned on start.
    pub retention_days: u32,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            exclude_paths: vec!["/api/health".to_string()],
            retention_days: 30,
        }
    }
}

impl AnalyticsSettings {
    fn is_excluded(&self, path: &str) -> bool {
        self.exclude_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Oldest `recorded_at` kept for a retention window.
fn retention_cutoff(retention_days: u32) -> Result<String> {
    ChronoDuration::try_days(i64::from(retention_days))
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .map(|cutoff| cutoff.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| {
            invalid_config(
                NAME,
                format!("retention_days {} is out of range", retention_days),
            )
        })
}

#[derive(Clone)]
struct AnalyticsState {
    services: ExtensionServices,
    settings: Arc<RwLock<AnalyticsSettings>>,
}

pub struct AnalyticsExtension {
    metadata: ExtensionMetadata,
    settings: Arc<RwLock<AnalyticsSettings>>,
    services: Option<ExtensionServices>,
}

impl AnalyticsExtension {
    pub fn new() -> Self {
        Self {
            metadata: ExtensionMetadata::new(NAME, semver::Version::new(1, 2, 0))
                .with_description("Page views and request timings")
                .with_author("Hearth")
                .with_license("Apache-2.0")
                .with_tags(["stats", "dashboard"]),
            settings: Arc::new(RwLock::new(AnalyticsSettings::default())),
            services: None,
        }
    }

    fn state(&self) -> Result<AnalyticsState> {
        Ok(AnalyticsState {
            services: require_services(NAME, &self.services)?.clone(),
            settings: self.settings.clone(),
        })
    }

    pub fn settings(&self) -> AnalyticsSettings {
        self.settings.read().clone()
    }
}

impl Default for AnalyticsExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for AnalyticsExtension {
    fn metadata(&self) -> &ExtensionMetadata {
        &self.metadata
    }

    async fn initialize(&mut self, _ctx: &ExtensionContext, services: ExtensionServices) -> Result<()> {
        services.logger().info("analytics initialized");
        self.services = Some(services);
        Ok(())
    }

    async fn start(&mut self, _ctx: &ExtensionContext) -> Result<()> {
        let services = require_services(NAME, &self.services)?;
        let retention_days = self.settings.read().retention_days;
        let cutoff = retention_cutoff(retention_days)?;
        let pruned = services
            .db()
            .exec("DELETE FROM page_views WHERE recorded_at < ?", &[json!(cutoff)])
            .await?;
        if pruned > 0 {
            services
                .logger()
                .with_field("pruned", pruned)
                .info("expired page views removed");
        }
        Ok(())
    }

    async fn health(&self, _ctx: &ExtensionContext) -> Result<HealthStatus> {
        let Some(services) = &self.services else {
            return Ok(HealthStatus::new(HealthState::Unknown).with_message("not initialized"));
        };
        let status = match services
            .db()
            .query("SELECT COUNT(*) AS total FROM page_views", &[])
            .await
        {
            Ok(_) => HealthStatus::healthy().with_check("database", HealthState::Healthy, None),
            Err(e) => HealthStatus::healthy().with_check(
                "database",
                HealthState::Unhealthy,
                Some(e.to_string()),
            ),
        };
        Ok(status)
    }

    fn register_routes(&self, router: &mut ExtensionRouter) -> Result<()> {
        let state = self.state()?;
        router
            .route("/dashboard", get(dashboard).with_state(state.clone()))
            .route("/events", get(recent_events).with_state(state));
        Ok(())
    }

    fn register_middleware(&self) -> Vec<MiddlewareRegistration> {
        let Some(services) = &self.services else {
            return Vec::new();
        };
        let stats = services.stats();
        vec![MiddlewareRegistration::new("request-timer", -100, move |request, next| {
            let stats = stats.clone();
            async move {
                let started = Instant::now();
                let response = next.run(request).await;
                stats.increment("requests", 1);
                stats.gauge("last_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
                response
            }
        })]
    }

    fn register_hooks(&self) -> Vec<HookRegistration> {
        match self.state() {
            Ok(state) => vec![HookRegistration::new(
                "record-page-view",
                HookType::PostResponse,
                100,
                Arc::new(PageViewRecorder { state }),
            )],
            Err(_) => Vec::new(),
        }
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "exclude_paths": {
                    "type": "array",
                    "items": { "type": "string" },
                    "default": ["/api/health"]
                },
                "retention_days": { "type": "integer", "minimum": 1, "default": 30 }
            },
            "additionalProperties": false
        })
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let settings: AnalyticsSettings = parse_config(NAME, config)?;
        if settings.retention_days == 0 || settings.retention_days > MAX_RETENTION_DAYS {
            return Err(invalid_config(
                NAME,
                format!("retention_days must be between 1 and {}", MAX_RETENTION_DAYS),
            ));
        }
        if settings.exclude_paths.iter().any(|p| !p.starts_with('/')) {
            return Err(invalid_config(NAME, "exclude_paths entries must start with '/'"));
        }
        Ok(())
    }

    async fn apply_config(&mut self, config: &Value) -> Result<()> {
        let settings: AnalyticsSettings = parse_config(NAME, config)?;
        *self.settings.write() = settings;
        Ok(())
    }

    fn migrations(&self) -> Vec<Migration> {
        vec![
            Migration::new(
                "1",
                "create page_views",
                r#"
                CREATE TABLE page_views (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    path TEXT NOT NULL,
                    method TEXT NOT NULL,
                    status INTEGER,
                    recorded_at TEXT NOT NULL
                );
                "#,
            )
            .with_down("DROP TABLE page_views;"),
            Migration::new(
                "2",
                "index page views by path",
                "CREATE INDEX idx_page_views_path ON page_views (path);",
            )
            .with_down("DROP INDEX idx_page_views_path;"),
        ]
    }
}

// ============================================================================
// Hooks
// ============================================================================

struct PageViewRecorder {
    state: AnalyticsState,
}

#[async_trait]
impl HookHandler for PageViewRecorder {
    async fn handle(&self, ctx: &mut HookContext) -> Result<()> {
        let Some(path) = ctx.path.clone() else {
            return Ok(());
        };
        let excluded = self.state.settings.read().is_excluded(&path);
        if excluded {
            return Ok(());
        }

        self.state.services.stats().increment("page_views", 1);
        self.state
            .services
            .db()
            .exec(
                "INSERT INTO page_views (path, method, status, recorded_at) VALUES (?, ?, ?, ?)",
                &[
                    json!(path),
                    json!(ctx.method.clone().unwrap_or_default()),
                    json!(ctx.status),
                    json!(timestamp()),
                ],
            )
            .await?;
        Ok(())
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn dashboard(State(state): State<AnalyticsState>) -> std::result::Result<Json<Value>, ExtensionError> {
    let db = state.services.db();
    let total = db
        .query("SELECT COUNT(*) AS total FROM page_views", &[])
        .await?
        .first()
        .and_then(|row| row.get("total").and_then(Value::as_i64))
        .unwrap_or(0);
    let top_paths = db
        .query(
            "SELECT path, COUNT(*) AS views FROM page_views GROUP BY path ORDER BY views DESC, path LIMIT 10",
            &[],
        )
        .await?;

    Ok(ok(json!({
        "total_views": total,
        "top_paths": top_paths,
        "stats": state.services.stats().snapshot(),
    })))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<u32>,
}

async fn recent_events(
    State(state): State<AnalyticsState>,
    Query(query): Query<EventsQuery>,
) -> std::result::Result<Json<Value>, ExtensionError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);
    let events = state
        .services
        .db()
        .query(
            "SELECT id, path, method, status, recorded_at FROM page_views ORDER BY id DESC LIMIT ?",
            &[json!(limit)],
        )
        .await?;
    Ok(ok(events))
}
