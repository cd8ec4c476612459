use axum::extract::{Path, State};
use axum::Json;

use crate::state::AppState;

/// GET /api/tenants/{id}/status: latest status record; UNKNOWN when never seen.
pub async fn get_tenant_status(
    State(app): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Json<serde_json::Value> {
    let record = app.orchestrator.status(&tenant_id);
    Json(serde_json::json!({
        "tenant_id": tenant_id,
        "status": record.status,
        "message": record.message,
        "updated_at": record.updated_at,
        "running": app.orchestrator.is_running(&tenant_id),
    }))
}

/// GET /api/status: every tracked tenant, sorted by id.
pub async fn list_status(State(app): State<AppState>) -> Json<serde_json::Value> {
    let list: Vec<serde_json::Value> = app
        .orchestrator
        .status_tracker()
        .snapshot()
        .into_iter()
        .map(|(tenant_id, record)| {
            serde_json::json!({
                "tenant_id": tenant_id,
                "status": record.status,
                "message": record.message,
                "updated_at": record.updated_at,
            })
        })
        .collect();
    Json(serde_json::json!(list))
}
