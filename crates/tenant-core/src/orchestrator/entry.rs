//! Saga log records.
//!
//! Every run appends one [`SagaEntry`] per observable transition: run start,
//! each step start and outcome, each compensation, and exactly one terminal
//! entry. A run whose entries stop before a terminal entry was interrupted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::model::{TenantInfo, TenantStepData};
use crate::step::Lifecycle;

use super::saga_log::SagaLog;

// ---------------------------------------------------------------------------
// SagaEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SagaEvent {
    RunStarted {
        #[serde(default)]
        tenant: Option<TenantInfo>,
    },
    /// A create run's step bound the run to this tenant.
    TenantBound { tenant: TenantInfo },
    /// Written before the step runs; `data` is what the step is handed, with
    /// its sensitive properties masked.
    StepStarted { step: String, data: TenantStepData },
    /// `data` is the step's data after it returned.
    StepSucceeded { step: String, data: TenantStepData },
    StepFailed {
        step: String,
        message: String,
        #[serde(default)]
        data: Option<TenantStepData>,
    },
    Compensated { step: String },
    CompensationFailed { step: String, message: String },
    RunCompleted { message: String },
    RunFailed { message: String },
}

impl SagaEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted { .. } | Self::RunFailed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::TenantBound { .. } => "tenant_bound",
            Self::StepStarted { .. } => "step_started",
            Self::StepSucceeded { .. } => "step_succeeded",
            Self::StepFailed { .. } => "step_failed",
            Self::Compensated { .. } => "compensated",
            Self::CompensationFailed { .. } => "compensation_failed",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
        }
    }

    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step, .. }
            | Self::StepSucceeded { step, .. }
            | Self::StepFailed { step, .. }
            | Self::Compensated { step }
            | Self::CompensationFailed { step, .. } => Some(step),
            _ => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::StepFailed { message, .. }
            | Self::CompensationFailed { message, .. }
            | Self::RunCompleted { message }
            | Self::RunFailed { message } => Some(message),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SagaEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaEntry {
    pub run_id: Uuid,
    pub tenant_id: String,
    pub lifecycle: Lifecycle,
    /// Position within the run, starting at 0.
    pub seq: u32,
    pub run_started_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub event: SagaEvent,
}

// ---------------------------------------------------------------------------
// RunJournal
// ---------------------------------------------------------------------------

/// Appends the entries of a single run.
///
/// Without a backing log every call is a no-op. Append failures are logged
/// and otherwise ignored: the journal never changes a run's outcome.
pub(crate) struct RunJournal {
    log: Option<Arc<SagaLog>>,
    run_id: Uuid,
    tenant_id: String,
    lifecycle: Lifecycle,
    started_at: DateTime<Utc>,
    next_seq: u32,
}

impl RunJournal {
    pub(crate) fn begin(
        log: Option<Arc<SagaLog>>,
        tenant_id: &str,
        lifecycle: Lifecycle,
        tenant: Option<&TenantInfo>,
    ) -> Self {
        let mut journal = Self {
            log,
            run_id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            lifecycle,
            started_at: Utc::now(),
            next_seq: 0,
        };
        journal.record(SagaEvent::RunStarted {
            tenant: tenant.cloned(),
        });
        journal
    }

    /// Continue a run found in the log (startup recovery).
    pub(crate) fn resume(log: Arc<SagaLog>, last: &SagaEntry) -> Self {
        Self {
            log: Some(log),
            run_id: last.run_id,
            tenant_id: last.tenant_id.clone(),
            lifecycle: last.lifecycle,
            started_at: last.run_started_at,
            next_seq: last.seq + 1,
        }
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub(crate) fn record(&mut self, event: SagaEvent) {
        let Some(log) = &self.log else {
            return;
        };
        let entry = SagaEntry {
            run_id: self.run_id,
            tenant_id: self.tenant_id.clone(),
            lifecycle: self.lifecycle,
            seq: self.next_seq,
            run_started_at: self.started_at,
            recorded_at: Utc::now(),
            event,
        };
        self.next_seq += 1;
        if let Err(e) = log.append(&entry) {
            warn!(
                run_id = %self.run_id,
                tenant_id = %self.tenant_id,
                event = entry.event.label(),
                error = %e,
                "failed to append saga log entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_tag() {
        let event = SagaEvent::StepFailed {
            step: "db".into(),
            message: "boom".into(),
            data: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_failed");
        assert_eq!(json["step"], "db");
        let back: SagaEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn only_run_outcomes_are_terminal() {
        assert!(SagaEvent::RunFailed { message: "x".into() }.is_terminal());
        assert!(SagaEvent::RunCompleted { message: "x".into() }.is_terminal());
        assert!(!SagaEvent::Compensated { step: "db".into() }.is_terminal());
        assert_eq!(SagaEvent::RunStarted { tenant: None }.step(), None);
        let bound = SagaEvent::TenantBound {
            tenant: TenantInfo::new("acme.com"),
        };
        assert_eq!(bound.label(), "tenant_bound");
        assert!(!bound.is_terminal());
        assert_eq!(
            SagaEvent::CompensationFailed {
                step: "db".into(),
                message: "gone".into()
            }
            .message(),
            Some("gone")
        );
    }

    #[test]
    fn journal_without_log_is_inert() {
        let mut journal = RunJournal::begin(None, "acme.com", Lifecycle::Create, None);
        journal.record(SagaEvent::RunCompleted {
            message: "done".into(),
        });
        assert_eq!(journal.next_seq, 0);
    }
}
