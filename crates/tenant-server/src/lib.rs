pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Models
        .route(
            "/api/models/{lifecycle}",
            get(routes::models::get_model),
        )
        // Tenants
        .route("/api/tenants", post(routes::tenants::create_tenant))
        .route(
            "/api/tenants/{id}",
            put(routes::tenants::update_tenant).delete(routes::tenants::delete_tenant),
        )
        .route(
            "/api/tenants/{id}/status",
            get(routes::status::get_tenant_status),
        )
        .route("/api/tenants/{id}/log", get(routes::runs::get_tenant_log))
        // Status and saga log
        .route("/api/status", get(routes::status::list_status))
        .route("/api/runs", get(routes::runs::list_runs))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run startup housekeeping, then serve on `0.0.0.0:{port}`.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(state, listener).await
}

/// Like `serve`, on a pre-bound listener so the caller can read the actual
/// port first (useful when `port = 0`).
pub async fn serve_on(state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let orch = state.orchestrator.clone();
    let report = tokio::task::spawn_blocking(move || orch.startup()).await??;
    tracing::info!(
        purged = report.purged_tenants,
        recovered = report.recovered_runs.len(),
        "startup housekeeping finished"
    );

    let actual_port = listener.local_addr()?.port();
    tracing::info!("tenant orchestrator listening on http://localhost:{actual_port}");

    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
