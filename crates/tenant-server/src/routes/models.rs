use axum::extract::{Path, State};
use axum::Json;
use tenant_core::model::TenantInitializationModel;
use tenant_core::step::Lifecycle;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/models/{lifecycle}: default model a client fills in and submits.
pub async fn get_model(
    State(app): State<AppState>,
    Path(lifecycle): Path<String>,
) -> Result<Json<TenantInitializationModel>, AppError> {
    let lifecycle: Lifecycle = lifecycle.parse()?;
    Ok(Json(app.orchestrator.provide_model(lifecycle)))
}
