//! `/metrics` and `/health` handlers

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::state::ApiState;
use crate::actors::messages::ProbeSnapshot;
use crate::resources::ResourceStatus;

/// GET /metrics
pub async fn metrics(
    State(state): State<ApiState>,
) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// GET /health
pub async fn health(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshots = state.supervisor.snapshot();
    let response = compute_health(&snapshots, &state.resources);

    let code = if response.status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(response))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub probes: ProbeCounts,
    pub resources: ResourceReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeCounts {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceReport {
    pub memory_mb: u64,
    pub threads: u64,
    pub warnings: Vec<String>,
}

/// Composite health: healthy iff strictly more than half of the probes
/// have non-open breakers and no resource warning is active. A
/// single-probe deployment is therefore healthy exactly when that probe
/// is.
pub fn compute_health(snapshots: &[ProbeSnapshot], resources: &ResourceStatus) -> HealthResponse {
    let total = snapshots.len();
    let healthy = snapshots.iter().filter(|s| s.is_healthy()).count();
    let warnings = resources.warnings();

    let status = if healthy * 2 > total && warnings.is_empty() {
        "healthy"
    } else {
        "unhealthy"
    };

    HealthResponse {
        status: status.to_string(),
        probes: ProbeCounts {
            total,
            healthy,
            unhealthy: total - healthy,
        },
        resources: ResourceReport {
            memory_mb: resources.memory_mb(),
            threads: resources.task_count(),
            warnings,
        },
    }
}
