use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::step::{Lifecycle, StepError};

/// A compensation that failed while rolling back a run.
///
/// These never change the outcome reported to the caller; they are carried
/// alongside the root cause so operators can see what was left behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("model does not carry a tenant id")]
    MissingTenantId,

    #[error("model has no data for step '{0}'")]
    MissingStepData(String),

    #[error("step '{step}' is registered twice for {lifecycle}")]
    DuplicateStep { lifecycle: Lifecycle, step: String },

    #[error("invalid lifecycle '{0}': expected create, update or delete")]
    InvalidLifecycle(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("tenant '{0}' already has a run in progress")]
    TenantBusy(String),

    #[error("lease for '{lease}' does not cover a run for tenant '{tenant_id}'")]
    ForeignLease { lease: String, tenant_id: String },

    #[error("tenant creation failed for '{tenant_id}' at step '{step}': {source}")]
    Creation {
        tenant_id: String,
        step: String,
        source: StepError,
        compensation_failures: Vec<CompensationFailure>,
    },

    #[error("tenant update failed for '{tenant_id}' at step '{step}': {source}")]
    Update {
        tenant_id: String,
        step: String,
        source: StepError,
        compensation_failures: Vec<CompensationFailure>,
    },

    #[error("tenant deletion failed for '{tenant_id}' at step '{step}': {source}")]
    Deletion {
        tenant_id: String,
        step: String,
        source: StepError,
    },

    #[error("tenant directory error: {0}")]
    Directory(String),

    #[error("saga log error: {0}")]
    SagaLog(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TenantError {
    /// Root-cause message of a failed run, as written to the status record.
    pub fn root_message(&self) -> Option<String> {
        match self {
            Self::Creation { source, .. }
            | Self::Update { source, .. }
            | Self::Deletion { source, .. } => Some(source.root_message()),
            _ => None,
        }
    }

    /// Compensations that failed during the rollback of this run, if any.
    pub fn compensation_failures(&self) -> &[CompensationFailure] {
        match self {
            Self::Creation {
                compensation_failures,
                ..
            }
            | Self::Update {
                compensation_failures,
                ..
            } => compensation_failures,
            _ => &[],
        }
    }

    /// True for failures raised before any step ran.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::MissingTenantId
                | Self::MissingStepData(_)
                | Self::TenantNotFound(_)
                | Self::TenantBusy(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TenantError>;
