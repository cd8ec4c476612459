//! Lifecycle endpoints. Each run is validated and its tenant leased before the
//! request is accepted, then started on the blocking pool; the client polls
//! the status endpoint for the outcome.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tenant_core::model::TenantInitializationModel;
use tenant_core::status::Status;
use tenant_core::step::Lifecycle;
use tenant_core::TenantError;
use tracing::warn;

use crate::error::AppError;
use crate::state::AppState;

type Accepted = (StatusCode, Json<serde_json::Value>);

fn parse_model(body: serde_json::Value) -> Result<TenantInitializationModel, AppError> {
    serde_json::from_value(body).map_err(|e| AppError::bad_request(format!("invalid model: {e}")))
}

fn accepted(tenant_id: &str) -> Accepted {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "tenant_id": tenant_id,
            "status": Status::InProgress,
        })),
    )
}

/// Directory lookup on the blocking pool: 404 unless the tenant is active.
async fn ensure_exists(app: &AppState, tenant_id: &str) -> Result<(), AppError> {
    let orch = app.orchestrator.clone();
    let id = tenant_id.to_string();
    tokio::task::spawn_blocking(move || orch.active_tenant(&id).map(|_| ()))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(())
}

/// POST /api/tenants: start provisioning a new tenant from a model.
pub async fn create_tenant(
    State(app): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Accepted, AppError> {
    let model = parse_model(body)?;
    let tenant_id = model
        .tenant_id()
        .ok_or(TenantError::MissingTenantId)?
        .to_string();
    app.orchestrator.validate_model(Lifecycle::Create, &model)?;
    let lease = app.orchestrator.reserve(&tenant_id)?;

    let orch = app.orchestrator.clone();
    let id = tenant_id.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = orch.create_reserved(model, lease) {
            warn!(tenant_id = %id, error = %e, "tenant creation did not complete");
        }
    });

    Ok(accepted(&tenant_id))
}

/// PUT /api/tenants/{id}: apply an update model to an existing tenant.
pub async fn update_tenant(
    State(app): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Accepted, AppError> {
    let model = parse_model(body)?;
    ensure_exists(&app, &tenant_id).await?;
    app.orchestrator.validate_model(Lifecycle::Update, &model)?;
    let lease = app.orchestrator.reserve(&tenant_id)?;

    let orch = app.orchestrator.clone();
    let id = tenant_id.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = orch.update_reserved(model, &id, lease) {
            warn!(tenant_id = %id, error = %e, "tenant update did not complete");
        }
    });

    Ok(accepted(&tenant_id))
}

/// DELETE /api/tenants/{id}: remove a tenant.
pub async fn delete_tenant(
    State(app): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Accepted, AppError> {
    ensure_exists(&app, &tenant_id).await?;
    let lease = app.orchestrator.reserve(&tenant_id)?;

    let orch = app.orchestrator.clone();
    let id = tenant_id.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = orch.delete_reserved(&id, lease) {
            warn!(tenant_id = %id, error = %e, "tenant deletion did not complete");
        }
    });

    Ok(accepted(&tenant_id))
}
