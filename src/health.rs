use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::mirror::MirrorState;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
    pub mirrors: MirrorCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub storage: CheckResult,
    pub mirrors: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Number of records in each state.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct MirrorCounts {
    pub total: usize,
    pub cloning: usize,
    pub ready: usize,
    pub updating: usize,
    pub failed: usize,
}

impl MirrorCounts {
    fn tally(states: impl IntoIterator<Item = MirrorState>) -> Self {
        states.into_iter().fold(Self::default(), |mut c, state| {
            c.total += 1;
            match state {
                MirrorState::Cloning => c.cloning += 1,
                MirrorState::Ready => c.ready += 1,
                MirrorState::Updating => c.updating += 1,
                MirrorState::Failed => c.failed += 1,
                MirrorState::Absent => {}
            }
            c
        })
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// The storage root must accept new files, or no clone can succeed.
async fn check_storage(root: PathBuf) -> CheckResult {
    let result = tokio::task::spawn_blocking(move || write_test_file(&root)).await;
    match result {
        Ok(Ok(())) => CheckResult::healthy(),
        Ok(Err(e)) => CheckResult::unhealthy(format!("storage root not writable: {e}")),
        Err(e) => CheckResult::unhealthy(format!("storage check task failed: {e}")),
    }
}

fn write_test_file(root: &Path) -> std::io::Result<()> {
    let file = tempfile::Builder::new()
        .prefix(".healthz-")
        .tempfile_in(root)?;
    file.close()
}

fn check_mirrors(counts: &MirrorCounts) -> CheckResult {
    if counts.failed == 0 {
        CheckResult::healthy()
    } else {
        CheckResult::unhealthy(format!("{} mirror(s) failed their last clone", counts.failed))
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.storage.ok {
        // Storage is required for operation.
        HealthStatus::Unhealthy
    } else if !checks.mirrors.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let counts = MirrorCounts::tally(state.store.snapshot().into_iter().map(|m| m.status.state));
    let storage = check_storage(state.store.engine().root().to_path_buf()).await;
    let mirrors = check_mirrors(&counts);

    let checks = HealthChecks { storage, mirrors };
    let status = aggregate_status(&checks);
    let body = HealthResponse {
        status,
        checks,
        mirrors: counts,
    };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
