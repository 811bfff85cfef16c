//! Registry lifecycle tests.
//!
//! Covers registration, enable/disable transitions, failure isolation,
//! hook ordering, composed-table teardown and migrations.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use hearth_core::extension::*;
use serde_json::json;

// ========================================================================
// Registration
// ========================================================================

#[tokio::test]
async fn test_register_then_get_returns_same_instance() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    registry
        .register(&ctx, Box::new(TestExtension::new("analytics")))
        .await
        .unwrap();

    let first = registry.get("analytics").unwrap();
    let second = registry.get("analytics").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.read().await.metadata().name, "analytics");
    assert_eq!(registry.state("analytics"), Some(ExtensionState::Initialized));
}

#[tokio::test]
async fn test_duplicate_registration_keeps_first() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    let calls = call_log();

    registry
        .register(&ctx, Box::new(TestExtension::new("products").with_calls(calls.clone())))
        .await
        .unwrap();
    let first = registry.get("products").unwrap();

    let err = registry
        .register(&ctx, Box::new(TestExtension::new("products")))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::DuplicateExtension(ref name) if name == "products"));

    assert_eq!(registry.count(), 1);
    assert!(Arc::ptr_eq(&first, &registry.get("products").unwrap()));
    // The rejected duplicate was never initialized.
    assert_eq!(calls.lock().as_slice(), ["products:initialize"]);
}

#[tokio::test]
async fn test_get_all_in_registration_order() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    for name in ["c", "a", "b"] {
        registry
            .register(&ctx, Box::new(TestExtension::new(name)))
            .await
            .unwrap();
    }
    assert_eq!(registry.names(), vec!["c", "a", "b"]);
    assert_eq!(registry.get_all().len(), 3);
}

#[tokio::test]
async fn test_failed_initialize_is_isolated() {
    let registry = registry();
    let ctx = ExtensionContext::new();

    let err = registry
        .register(
            &ctx,
            Box::new(
                TestExtension::new("broken")
                    .failing_initialize()
                    .with_route("/dashboard", "never"),
            ),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::Initialization { .. }));

    // Still visible, but failed and without contributions.
    assert_eq!(registry.state("broken"), Some(ExtensionState::Failed));
    let info = registry.info("broken").unwrap();
    assert!(info.last_error.unwrap().contains("boom"));
    assert_eq!(info.route_count, 0);

    let err = registry.enable(&ctx, "broken").await.unwrap_err();
    assert!(matches!(err, ExtensionError::AlreadyFailed(_)));
    assert!(registry.mounted_routes().is_empty());
}

#[tokio::test]
async fn test_unknown_extension() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    assert!(registry.get("ghost").is_none());
    assert!(matches!(
        registry.enable(&ctx, "ghost").await,
        Err(ExtensionError::NotFound(_))
    ));
    assert!(matches!(
        registry.disable(&ctx, "ghost").await,
        Err(ExtensionError::NotFound(_))
    ));
}

// ========================================================================
// Enable / disable
// ========================================================================

#[tokio::test]
async fn test_enable_is_idempotent() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    let calls = call_log();
    registry
        .register(&ctx, Box::new(TestExtension::new("analytics").with_calls(calls.clone())))
        .await
        .unwrap();

    registry.enable(&ctx, "analytics").await.unwrap();
    registry.enable(&ctx, "analytics").await.unwrap();

    assert_eq!(registry.state("analytics"), Some(ExtensionState::Enabled));
    assert_eq!(
        calls.lock().as_slice(),
        ["analytics:initialize", "analytics:start"]
    );
}

#[tokio::test]
async fn test_disable_removes_only_own_contributions() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    let log = call_log();

    registry
        .register(
            &ctx,
            Box::new(
                TestExtension::new("a")
                    .with_route("/r1", "a")
                    .with_route("/r2", "a")
                    .with_hook("hA", HookType::PreRequest, 0, log.clone()),
            ),
        )
        .await
        .unwrap();
    registry
        .register(
            &ctx,
            Box::new(
                TestExtension::new("b")
                    .with_route("/r3", "b")
                    .with_hook("hB", HookType::PreRequest, 0, log.clone()),
            ),
        )
        .await
        .unwrap();
    registry.enable(&ctx, "a").await.unwrap();
    registry.enable(&ctx, "b").await.unwrap();
    assert_eq!(registry.mounted_routes().len(), 3);

    registry.disable(&ctx, "a").await.unwrap();

    assert_eq!(registry.state("a"), Some(ExtensionState::Disabled));
    assert_eq!(registry.mounted_routes(), vec!["/ext/b/r3"]);
    assert_eq!(
        registry.hook_order(HookType::PreRequest),
        vec![("b".to_string(), "hB".to_string())]
    );

    let mut hook_ctx = HookContext::new(HookType::PreRequest);
    let outcome = registry
        .execute_hooks(HookType::PreRequest, &mut hook_ctx)
        .await
        .unwrap();
    assert_eq!(outcome.executed, 1);
    assert_eq!(log.lock().as_slice(), ["hB"]);
}

#[tokio::test]
async fn test_disable_then_enable_recomposes() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    registry
        .register(&ctx, Box::new(TestExtension::new("a").with_route("/r", "a")))
        .await
        .unwrap();
    registry.enable(&ctx, "a").await.unwrap();
    registry.disable(&ctx, "a").await.unwrap();
    assert!(registry.mounted_routes().is_empty());

    registry.enable(&ctx, "a").await.unwrap();
    assert_eq!(registry.mounted_routes(), vec!["/ext/a/r"]);
    assert_eq!(registry.info("a").unwrap().route_count, 1);
}

#[tokio::test]
async fn test_stop_error_still_disables() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    registry
        .register(
            &ctx,
            Box::new(TestExtension::new("stubborn").failing_stop().with_route("/r", "x")),
        )
        .await
        .unwrap();
    registry.enable(&ctx, "stubborn").await.unwrap();

    registry.disable(&ctx, "stubborn").await.unwrap();
    assert_eq!(registry.state("stubborn"), Some(ExtensionState::Disabled));
    assert!(registry.mounted_routes().is_empty());
}

#[tokio::test]
async fn test_failed_start_composes_nothing() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    registry
        .register(
            &ctx,
            Box::new(
                TestExtension::new("flaky")
                    .failing_start()
                    .with_route("/r", "x")
                    .with_middleware("mw", 0),
            ),
        )
        .await
        .unwrap();

    let err = registry.enable(&ctx, "flaky").await.unwrap_err();
    assert!(matches!(err, ExtensionError::Start { .. }));
    assert_eq!(registry.state("flaky"), Some(ExtensionState::Failed));
    assert!(registry.mounted_routes().is_empty());
    assert!(registry.middleware_order().is_empty());
}

#[tokio::test]
async fn test_partial_failure_across_three_extensions() {
    let registry = registry();
    let ctx = ExtensionContext::new();

    registry
        .register(&ctx, Box::new(TestExtension::new("a").with_route("/a", "a")))
        .await
        .unwrap();
    assert!(registry
        .register(&ctx, Box::new(TestExtension::new("b").failing_initialize()))
        .await
        .is_err());
    registry
        .register(&ctx, Box::new(TestExtension::new("c").with_route("/c", "c")))
        .await
        .unwrap();

    for name in ["a", "b", "c"] {
        let _ = registry.enable(&ctx, name).await;
    }

    assert_eq!(registry.state("a"), Some(ExtensionState::Enabled));
    assert_eq!(registry.state("b"), Some(ExtensionState::Failed));
    assert_eq!(registry.state("c"), Some(ExtensionState::Enabled));
    assert_eq!(registry.mounted_routes(), vec!["/ext/a/a", "/ext/c/c"]);
}

// ========================================================================
// Configuration
// ========================================================================

#[tokio::test]
async fn test_invalid_config_leaves_state_unchanged() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    registry
        .register(
            &ctx,
            Box::new(TestExtension::new("products").requiring_config_key("currency")),
        )
        .await
        .unwrap();

    let err = registry
        .enable_with_config(&ctx, "products", Some(&json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::ConfigValidation { .. }));
    assert_eq!(registry.state("products"), Some(ExtensionState::Initialized));

    registry
        .enable_with_config(&ctx, "products", Some(&json!({ "currency": "EUR" })))
        .await
        .unwrap();
    assert_eq!(registry.state("products"), Some(ExtensionState::Enabled));
    assert_eq!(
        registry.applied_config("products"),
        Some(json!({ "currency": "EUR" }))
    );
}

#[tokio::test]
async fn test_configure_live_extension() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    let calls = call_log();
    registry
        .register(&ctx, Box::new(TestExtension::new("analytics").with_calls(calls.clone())))
        .await
        .unwrap();
    registry.enable(&ctx, "analytics").await.unwrap();

    registry
        .configure(&ctx, "analytics", &json!({ "retention_days": 7 }))
        .await
        .unwrap();
    assert_eq!(registry.state("analytics"), Some(ExtensionState::Enabled));
    assert!(calls.lock().contains(&"analytics:apply_config".to_string()));
}

// ========================================================================
// Hooks
// ========================================================================

#[tokio::test]
async fn test_hook_priority_order() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    let log = call_log();

    for (ext, hook, priority) in [("one", "H1", 10), ("two", "H2", 5), ("three", "H3", 5)] {
        registry
            .register(
                &ctx,
                Box::new(TestExtension::new(ext).with_hook(hook, HookType::PreRequest, priority, log.clone())),
            )
            .await
            .unwrap();
        registry.enable(&ctx, ext).await.unwrap();
    }

    let mut hook_ctx = HookContext::for_request(HookType::PreRequest, "GET", "/");
    registry
        .execute_hooks(HookType::PreRequest, &mut hook_ctx)
        .await
        .unwrap();
    assert_eq!(log.lock().as_slice(), ["H2", "H3", "H1"]);
}

#[tokio::test]
async fn test_hooks_only_fire_for_their_type() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    let log = call_log();
    registry
        .register(
            &ctx,
            Box::new(TestExtension::new("audit").with_hook("on-error", HookType::Error, 0, log.clone())),
        )
        .await
        .unwrap();
    registry.enable(&ctx, "audit").await.unwrap();

    let mut hook_ctx = HookContext::new(HookType::PostRequest);
    let outcome = registry
        .execute_hooks(HookType::PostRequest, &mut hook_ctx)
        .await
        .unwrap();
    assert_eq!(outcome.executed, 0);
    assert!(log.lock().is_empty());
}

// ========================================================================
// Migrations
// ========================================================================

#[tokio::test]
async fn test_migrations_apply_once_across_reenable() {
    let store = Arc::new(MemoryMigrationStore::new());
    let registry = ExtensionRegistry::new(ServiceProvider::new(), store.clone());
    let ctx = ExtensionContext::new();

    registry
        .register(
            &ctx,
            Box::new(
                TestExtension::new("products")
                    .with_migration(Migration::new("2", "add price", "--"))
                    .with_migration(Migration::new("1", "create", "--")),
            ),
        )
        .await
        .unwrap();

    registry.enable(&ctx, "products").await.unwrap();
    registry.disable(&ctx, "products").await.unwrap();
    registry.enable(&ctx, "products").await.unwrap();

    assert_eq!(store.applied_versions("products").await.unwrap(), vec!["1", "2"]);
}

#[tokio::test]
async fn test_rollback_requires_disabled() {
    let store = Arc::new(MemoryMigrationStore::new());
    let registry = ExtensionRegistry::new(ServiceProvider::new(), store.clone());
    let ctx = ExtensionContext::new();
    registry
        .register(
            &ctx,
            Box::new(
                TestExtension::new("products")
                    .with_migration(Migration::new("1", "create", "--"))
                    .with_migration(Migration::new("2", "index", "--")),
            ),
        )
        .await
        .unwrap();
    registry.enable(&ctx, "products").await.unwrap();

    assert!(matches!(
        registry.rollback_migrations(&ctx, "products", None).await,
        Err(ExtensionError::InvalidState { .. })
    ));

    registry.disable(&ctx, "products").await.unwrap();
    let reverted = registry
        .rollback_migrations(&ctx, "products", Some("1"))
        .await
        .unwrap();
    assert_eq!(reverted, vec!["2"]);
    assert_eq!(store.applied_versions("products").await.unwrap(), vec!["1"]);
}

// ========================================================================
// Timeouts, cancellation, shutdown
// ========================================================================

#[tokio::test(start_paused = true)]
async fn test_initialize_timeout_marks_failed() {
    let registry = registry();
    let ctx = ExtensionContext::new().with_timeout(Duration::from_millis(50));

    let err = registry
        .register(
            &ctx,
            Box::new(TestExtension::new("slow").slow_initialize(Duration::from_secs(5))),
        )
        .await
        .unwrap_err();

    match err {
        ExtensionError::Initialization { source, .. } => {
            assert!(matches!(*source, ExtensionError::Timeout { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(registry.state("slow"), Some(ExtensionState::Failed));
}

#[tokio::test]
async fn test_cancelled_context_marks_failed() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    ctx.cancel();

    let err = registry
        .register(&ctx, Box::new(TestExtension::new("late")))
        .await
        .unwrap_err();
    match err {
        ExtensionError::Initialization { source, .. } => {
            assert!(matches!(*source, ExtensionError::Cancelled { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(registry.state("late"), Some(ExtensionState::Failed));
}

#[tokio::test]
async fn test_shutdown_stops_enabled_in_reverse_order() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    let calls = call_log();

    for name in ["first", "second"] {
        registry
            .register(&ctx, Box::new(TestExtension::new(name).with_calls(calls.clone())))
            .await
            .unwrap();
        registry.enable(&ctx, name).await.unwrap();
    }
    registry
        .register(
            &ctx,
            Box::new(TestExtension::new("idle").with_calls(calls.clone())),
        )
        .await
        .unwrap();
    calls.lock().clear();

    let report = registry.shutdown(&ctx).await;
    assert_eq!(report.stopped, vec!["second", "first"]);
    assert!(report.errors.is_empty());
    assert_eq!(calls.lock().as_slice(), ["second:stop", "first:stop"]);
    assert_eq!(registry.state("first"), Some(ExtensionState::Stopped));
    assert_eq!(registry.state("idle"), Some(ExtensionState::Initialized));
}

#[tokio::test]
async fn test_shutdown_continues_past_stop_errors() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    for ext in [TestExtension::new("ok"), TestExtension::new("bad").failing_stop()] {
        let name = ext.metadata().name.clone();
        registry.register(&ctx, Box::new(ext)).await.unwrap();
        registry.enable(&ctx, &name).await.unwrap();
    }

    let report = registry.shutdown(&ctx).await;
    assert_eq!(report.stopped, vec!["ok"]);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].0, "bad");
}

#[tokio::test]
async fn test_health_report() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    registry
        .register(&ctx, Box::new(TestExtension::new("good")))
        .await
        .unwrap();
    registry.enable(&ctx, "good").await.unwrap();
    let _ = registry
        .register(&ctx, Box::new(TestExtension::new("bad").failing_initialize()))
        .await;

    let report = registry.health_report(&ctx).await;
    assert_eq!(report.status, HealthState::Unhealthy);
    assert_eq!(report.extensions["good"].status, HealthState::Healthy);
    assert_eq!(report.extensions["bad"].status, HealthState::Unhealthy);
}

#[tokio::test]
async fn test_unregister_removes_everything() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    registry
        .register(&ctx, Box::new(TestExtension::new("temp").with_route("/r", "x")))
        .await
        .unwrap();
    registry.enable(&ctx, "temp").await.unwrap();

    registry.unregister(&ctx, "temp").await.unwrap();
    assert!(!registry.contains("temp"));
    assert!(registry.mounted_routes().is_empty());

    // The name is free again.
    registry
        .register(&ctx, Box::new(TestExtension::new("temp")))
        .await
        .unwrap();
}

// ========================================================================
// Panic isolation
// ========================================================================

#[tokio::test]
async fn test_panicking_start_marks_failed() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    registry
        .register(
            &ctx,
            Box::new(
                TestExtension::new("volatile")
                    .panicking_start()
                    .with_route("/r", "x")
                    .with_middleware("mw", 0),
            ),
        )
        .await
        .unwrap();
    registry
        .register(&ctx, Box::new(TestExtension::new("steady").with_route("/s", "s")))
        .await
        .unwrap();

    let err = registry.enable(&ctx, "volatile").await.unwrap_err();
    match err {
        ExtensionError::Start { source, .. } => {
            assert!(matches!(
                *source,
                ExtensionError::Panicked { phase: LifecyclePhase::Start, .. }
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(registry.state("volatile"), Some(ExtensionState::Failed));
    assert!(registry
        .info("volatile")
        .unwrap()
        .last_error
        .unwrap()
        .contains("start exploded"));
    assert!(registry.middleware_order().is_empty());

    registry.enable(&ctx, "steady").await.unwrap();
    assert_eq!(registry.mounted_routes(), vec!["/ext/steady/s"]);
}

#[tokio::test]
async fn test_shutdown_continues_past_stop_panic() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    let calls = call_log();
    for ext in [
        TestExtension::new("first").with_calls(calls.clone()),
        TestExtension::new("second").with_calls(calls.clone()).panicking_stop(),
    ] {
        let name = ext.metadata().name.clone();
        registry.register(&ctx, Box::new(ext)).await.unwrap();
        registry.enable(&ctx, &name).await.unwrap();
    }

    let report = registry.shutdown(&ctx).await;
    assert_eq!(report.stopped, vec!["first"]);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].0, "second");
    match &report.errors[0].1 {
        ExtensionError::Stop { source, .. } => {
            assert!(matches!(**source, ExtensionError::Panicked { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        calls.lock().iter().filter(|c| c.ends_with(":stop")).count(),
        2
    );
    assert_eq!(registry.state("first"), Some(ExtensionState::Stopped));
    assert_eq!(registry.state("second"), Some(ExtensionState::Stopped));
}

#[tokio::test]
async fn test_panicking_apply_config_marks_failed() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    registry
        .register(
            &ctx,
            Box::new(TestExtension::new("brittle").panicking_apply().with_route("/r", "x")),
        )
        .await
        .unwrap();

    let err = registry
        .enable_with_config(&ctx, "brittle", Some(&json!({ "level": 3 })))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExtensionError::Panicked { phase: LifecyclePhase::Configure, .. }
    ));
    assert_eq!(registry.state("brittle"), Some(ExtensionState::Failed));
    assert!(registry.mounted_routes().is_empty());
}

// ========================================================================
// Migration failures
// ========================================================================

#[tokio::test]
async fn test_failed_migration_is_isolated() {
    let store = Arc::new(RejectingMigrationStore::new("broken", "2"));
    let registry = ExtensionRegistry::new(ServiceProvider::new(), store.clone());
    let ctx = ExtensionContext::new();

    registry
        .register(
            &ctx,
            Box::new(
                TestExtension::new("broken")
                    .with_route("/r", "x")
                    .with_migration(Migration::new("1", "create", "--"))
                    .with_migration(Migration::new("2", "bad", "--"))
                    .with_migration(Migration::new("3", "never", "--")),
            ),
        )
        .await
        .unwrap();
    registry
        .register(
            &ctx,
            Box::new(
                TestExtension::new("healthy")
                    .with_route("/h", "h")
                    .with_migration(Migration::new("1", "create", "--"))
                    .with_migration(Migration::new("2", "index", "--")),
            ),
        )
        .await
        .unwrap();

    let err = registry.enable(&ctx, "broken").await.unwrap_err();
    match err {
        ExtensionError::Migration { extension, version, .. } => {
            assert_eq!(extension, "broken");
            assert_eq!(version, "2");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(registry.state("broken"), Some(ExtensionState::Failed));
    assert_eq!(store.applied_versions("broken").await.unwrap(), vec!["1"]);

    registry.enable(&ctx, "healthy").await.unwrap();
    assert_eq!(registry.state("healthy"), Some(ExtensionState::Enabled));
    assert_eq!(store.applied_versions("healthy").await.unwrap(), vec!["1", "2"]);
    assert_eq!(registry.mounted_routes(), vec!["/ext/healthy/h"]);
}

#[tokio::test]
async fn test_mixed_version_schemes_fail_enable() {
    let registry = registry();
    let ctx = ExtensionContext::new();
    registry
        .register(
            &ctx,
            Box::new(
                TestExtension::new("mixed")
                    .with_migration(Migration::new("1.9.0", "a", "--"))
                    .with_migration(Migration::new("7", "b", "--")),
            ),
        )
        .await
        .unwrap();

    let err = registry.enable(&ctx, "mixed").await.unwrap_err();
    assert!(matches!(err, ExtensionError::Migration { .. }));
    assert_eq!(registry.state("mixed"), Some(ExtensionState::Failed));
}

// ========================================================================
// Database hooks
// ========================================================================

/// Database that accepts every statement and reports one affected row.
struct AcceptingDatabase {
    schema: String,
}

#[async_trait::async_trait]
impl ExtensionDatabase for AcceptingDatabase {
    fn schema(&self) -> &str {
        &self.schema
    }

    async fn query(&self, _sql: &str, _params: &[serde_json::Value]) -> Result<Vec<Row>> {
        Ok(Vec::new())
    }

    async fn exec(&self, _sql: &str, _params: &[serde_json::Value]) -> Result<u64> {
        Ok(1)
    }

    async fn transaction(&self, statements: Vec<Statement>) -> Result<u64> {
        Ok(statements.len() as u64)
    }
}

struct AcceptingProvider;

impl DatabaseProvider for AcceptingProvider {
    fn for_schema(&self, schema: &str) -> Arc<dyn ExtensionDatabase> {
        Arc::new(AcceptingDatabase {
            schema: schema.to_string(),
        })
    }
}

/// Keeps its services and vetoes statements that drop tables.
struct Auditor {
    metadata: ExtensionMetadata,
    services: Arc<parking_lot::Mutex<Option<ExtensionServices>>>,
    log: CallLog,
}

#[async_trait::async_trait]
impl Extension for Auditor {
    fn metadata(&self) -> &ExtensionMetadata {
        &self.metadata
    }

    async fn initialize(&mut self, _ctx: &ExtensionContext, services: ExtensionServices) -> Result<()> {
        *self.services.lock() = Some(services);
        Ok(())
    }

    fn register_hooks(&self) -> Vec<HookRegistration> {
        let pre_log = self.log.clone();
        let post_log = self.log.clone();
        vec![
            HookRegistration::from_fn("veto-drop", HookType::PreDatabase, 0, move |ctx| {
                let sql = ctx.data.get("sql").and_then(|v| v.as_str()).unwrap_or_default();
                pre_log.lock().push(format!("pre:{}", sql));
                if sql.starts_with("DROP") {
                    return Err(ExtensionError::PermissionDenied("drop is not allowed".into()));
                }
                Ok(())
            }),
            HookRegistration::from_fn("audit", HookType::PostDatabase, 0, move |ctx| {
                let operation = ctx.data.get("operation").and_then(|v| v.as_str()).unwrap_or_default();
                post_log.lock().push(format!("post:{}", operation));
                Ok(())
            }),
        ]
    }
}

#[tokio::test]
async fn test_database_hooks_wrap_calls() {
    let registry = ExtensionRegistry::new(
        ServiceProvider::new().with_database(Arc::new(AcceptingProvider)),
        Arc::new(MemoryMigrationStore::new()),
    );
    let ctx = ExtensionContext::new();
    let services = Arc::new(parking_lot::Mutex::new(None));
    let log = call_log();
    registry
        .register(
            &ctx,
            Box::new(Auditor {
                metadata: ExtensionMetadata::new("auditor", semver::Version::new(1, 0, 0)),
                services: services.clone(),
                log: log.clone(),
            }),
        )
        .await
        .unwrap();
    let db = services.lock().as_ref().unwrap().db();

    // Hooks only fire once the extension is enabled.
    assert_eq!(db.exec("INSERT INTO t VALUES (1)", &[]).await.unwrap(), 1);
    assert!(log.lock().is_empty());

    registry.enable(&ctx, "auditor").await.unwrap();
    assert_eq!(db.exec("INSERT INTO t VALUES (2)", &[]).await.unwrap(), 1);
    let err = db.exec("DROP TABLE t", &[]).await.unwrap_err();
    assert_eq!(err.code(), "HOOK_FAILED");
    assert_eq!(
        log.lock().as_slice(),
        ["pre:INSERT INTO t VALUES (2)", "post:exec", "pre:DROP TABLE t"]
    );

    registry.disable(&ctx, "auditor").await.unwrap();
    log.lock().clear();
    assert_eq!(db.exec("DROP TABLE t", &[]).await.unwrap(), 1);
    assert!(log.lock().is_empty());
}
