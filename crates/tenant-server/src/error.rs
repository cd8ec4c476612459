use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tenant_core::TenantError;

// ---------------------------------------------------------------------------
// Internal sentinel for explicit 400 Bad Request errors
// ---------------------------------------------------------------------------

/// Carries a request-shape problem (unparseable body and the like) through
/// the `anyhow::Error` chain without a `TenantError` variant of its own.
#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }
}

fn status_for(e: &TenantError) -> StatusCode {
    match e {
        TenantError::MissingTenantId
        | TenantError::MissingStepData(_)
        | TenantError::InvalidLifecycle(_) => StatusCode::BAD_REQUEST,
        TenantError::TenantNotFound(_) => StatusCode::NOT_FOUND,
        TenantError::TenantBusy(_) => StatusCode::CONFLICT,
        TenantError::Creation { .. } | TenantError::Update { .. } | TenantError::Deletion { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        TenantError::DuplicateStep { .. }
        | TenantError::ForeignLease { .. }
        | TenantError::Directory(_)
        | TenantError::SagaLog(_)
        | TenantError::Io(_)
        | TenantError::Yaml(_)
        | TenantError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(b) = self.0.downcast_ref::<BadRequestError>() {
            let body = serde_json::json!({ "error": b.0.clone() });
            return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
        }

        let status = self
            .0
            .downcast_ref::<TenantError>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenant_core::step::StepError;

    #[test]
    fn tenant_not_found_maps_to_404() {
        let err = AppError(TenantError::TenantNotFound("acme.com".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn busy_tenant_maps_to_409() {
        let err = AppError(TenantError::TenantBusy("acme.com".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn malformed_model_maps_to_400() {
        let err = AppError(TenantError::MissingTenantId.into());
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = AppError(TenantError::MissingStepData("db".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = AppError::bad_request("expected an object");
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn failed_run_maps_to_422() {
        let err = AppError(
            TenantError::Deletion {
                tenant_id: "acme.com".into(),
                step: "db".into(),
                source: StepError::failed("locked"),
            }
            .into(),
        );
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn saga_log_error_maps_to_500() {
        let err = AppError(TenantError::SagaLog("disk full".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn foreign_error_maps_to_500() {
        let err = AppError(anyhow::anyhow!("something unexpected"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn response_body_is_json() {
        let response = AppError(TenantError::TenantNotFound("x".into()).into()).into_response();
        let ct = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .expect("should have content-type");
        assert!(ct.to_str().unwrap().contains("application/json"));
    }
}
