//! Host server.
//!
//! [`Host::build`] opens storage, loads extension settings and runs the
//! startup pass over the catalog; [`run`] serves it until shutdown.

pub mod router;
pub mod state;

pub use router::create_router;
pub use state::ApiState;

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;

use hearth_core::extension::{
    Extension, ExtensionManager, InMemoryStats, InitializeReport, ShutdownReport,
};
use hearth_storage::HostStorage;

use crate::auth::TokenAuthService;
use crate::config::HostConfig;

/// Every long-lived component of a running host.
pub struct Host {
    pub config: HostConfig,
    pub storage: HostStorage,
    pub stats: Arc<InMemoryStats>,
    pub state: ApiState,
}

impl Host {
    /// Open storage, build the manager and register `catalog`.
    ///
    /// Extensions that fail to enable are reported, not fatal.
    pub async fn build(
        config: HostConfig,
        catalog: Vec<Box<dyn Extension>>,
    ) -> anyhow::Result<(Self, InitializeReport)> {
        let secret = if config.storage.signing_secret.is_empty() {
            tracing::warn!("No signing secret configured, using a random one (signed links will not survive restart)");
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            config.storage.signing_secret.clone()
        };

        let storage = HostStorage::open(config.storage_config(&secret))
            .await
            .context("Failed to open host storage")?;

        let auth = Arc::new(TokenAuthService::from_config(&config.auth));
        if auth.token_count() == 0 && !config.auth.anonymous_admin {
            tracing::warn!("No API tokens configured, admin changes are disabled");
        }
        let stats = Arc::new(InMemoryStats::new());
        let services = storage
            .service_provider()
            .with_auth(auth.clone())
            .with_stats(stats.clone());

        let manager = ExtensionManager::new(config.manager_config(), services, storage.migrations.clone())
            .context("Failed to load extension settings")?;
        let manager = Arc::new(manager);

        let ctx = manager.context();
        let report = manager.initialize(&ctx, catalog).await;

        let state = ApiState::new(manager, storage.objects.clone(), auth);
        Ok((
            Self {
                config,
                storage,
                stats,
                state,
            },
            report,
        ))
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone(), self.config.server.max_body_bytes)
    }

    /// Stop every extension, then close storage.
    pub async fn shutdown(&self) -> ShutdownReport {
        let ctx = self.state.manager.context();
        let report = self.state.manager.shutdown(&ctx).await;
        for (name, error) in &report.errors {
            tracing::warn!(extension = %name, error = %error, "Extension stop failed");
        }
        self.storage.close().await;
        report
    }
}

/// Serve `host` until `shutdown` resolves, then stop extensions.
pub async fn run<F>(host: Host, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bind = host.config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    tracing::info!(addr = %bind, "Hearth listening");

    axum::serve(listener, host.router())
        .with_graceful_shutdown(shutdown)
        .await?;

    let report = host.shutdown().await;
    tracing::info!(stopped = report.stopped.len(), "Server shutdown complete");
    Ok(())
}
