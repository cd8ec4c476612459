use axum::extract::{Path, State};
use axum::Json;
use tenant_core::orchestrator::{RunSummary, SagaEntry};

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/runs: saga log run summaries, oldest first. Empty without a log.
pub async fn list_runs(State(app): State<AppState>) -> Result<Json<Vec<RunSummary>>, AppError> {
    let orch = app.orchestrator.clone();
    let runs = tokio::task::spawn_blocking(move || match orch.saga_log() {
        Some(log) => log.runs(),
        None => Ok(Vec::new()),
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(runs))
}

/// GET /api/tenants/{id}/log: every saga log entry for one tenant.
pub async fn get_tenant_log(
    State(app): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Vec<SagaEntry>>, AppError> {
    let orch = app.orchestrator.clone();
    let entries = tokio::task::spawn_blocking(move || match orch.saga_log() {
        Some(log) => log.entries_for_tenant(&tenant_id),
        None => Ok(Vec::new()),
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(entries))
}
