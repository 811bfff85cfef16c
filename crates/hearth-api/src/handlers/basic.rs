//! Basic handlers - host health.

use axum::extract::State;
use serde::Serialize;

use hearth_core::extension::ExtensionState;

use crate::models::{ok, HandlerResult};
use crate::server::ApiState;

#[derive(Debug, Clone, Serialize)]
pub struct HostHealth {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime: u64,
    pub extensions: ExtensionCounts,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtensionCounts {
    pub total: usize,
    pub enabled: usize,
    pub failed: usize,
}

/// Liveness plus a summary of extension states. Public.
pub async fn health_handler(State(state): State<ApiState>) -> HandlerResult<HostHealth> {
    let uptime = chrono::Utc::now().timestamp() - state.started_at.timestamp();

    let mut counts = ExtensionCounts::default();
    for info in state.registry().list() {
        counts.total += 1;
        match info.state {
            ExtensionState::Enabled => counts.enabled += 1,
            ExtensionState::Failed => counts.failed += 1,
            _ => {}
        }
    }

    ok(HostHealth {
        status: if counts.failed == 0 { "ok" } else { "degraded" },
        service: "hearth",
        version: env!("CARGO_PKG_VERSION"),
        uptime: uptime.max(0) as u64,
        extensions: counts,
    })
}
