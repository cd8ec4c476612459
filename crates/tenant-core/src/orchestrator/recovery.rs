//! Startup housekeeping: purge soft-deleted tenants and roll back runs that
//! a previous process left unfinished.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CompensationFailure, Result};
use crate::model::{TenantInfo, TenantStepData};
use crate::status::Status;
use crate::step::Lifecycle;

use super::entry::{RunJournal, SagaEntry, SagaEvent};
use super::invoke::Invoker;
use super::saga_log::{RunSummary, SagaLog};
use super::{Compensation, TenantOrchestrator};

/// Status message of a create or update run rolled back at startup.
pub const INTERRUPTED_MESSAGE: &str = "interrupted run compensated at startup";

const INTERRUPTED_DELETE_MESSAGE: &str = "interrupted delete run marked failed at startup";

#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub purged_tenants: usize,
    pub recovered_runs: Vec<RecoveredRun>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveredRun {
    pub run_id: Uuid,
    pub tenant_id: String,
    pub lifecycle: Lifecycle,
    /// Steps compensated during recovery, in the order they were undone.
    pub compensated: Vec<String>,
    pub compensation_failures: Vec<CompensationFailure>,
}

/// What the log says a run had done before it stopped.
struct Replay {
    tenant: Option<TenantInfo>,
    started: Vec<String>,
    snapshots: HashMap<String, TenantStepData>,
    compensated: HashSet<String>,
}

impl Replay {
    fn from_entries(entries: &[SagaEntry]) -> Self {
        let mut replay = Self {
            tenant: None,
            started: Vec::new(),
            snapshots: HashMap::new(),
            compensated: HashSet::new(),
        };
        for entry in entries {
            match &entry.event {
                SagaEvent::RunStarted { tenant } => replay.tenant = tenant.clone(),
                SagaEvent::TenantBound { tenant } => replay.tenant = Some(tenant.clone()),
                SagaEvent::StepStarted { step, data } => {
                    if !replay.snapshots.contains_key(step) {
                        replay.started.push(step.clone());
                    }
                    replay.snapshots.insert(step.clone(), data.clone());
                }
                SagaEvent::StepSucceeded { step, data }
                | SagaEvent::StepFailed {
                    step,
                    data: Some(data),
                    ..
                } => {
                    replay.snapshots.insert(step.clone(), data.clone());
                }
                SagaEvent::Compensated { step } => {
                    replay.compensated.insert(step.clone());
                }
                _ => {}
            }
        }
        replay
    }

    /// Started steps still owing a compensation, in start order.
    fn pending(&self) -> impl Iterator<Item = (&str, &TenantStepData)> {
        self.started
            .iter()
            .filter(|step| !self.compensated.contains(*step))
            .filter_map(|step| self.snapshots.get(step).map(|data| (step.as_str(), data)))
    }
}

impl TenantOrchestrator {
    /// Run once when the process starts, before serving requests.
    pub fn startup(&self) -> Result<StartupReport> {
        let purged_tenants = self.directory.delete_marked_tenants()?;
        if purged_tenants > 0 {
            info!(purged = purged_tenants, "purged tenants marked for deletion");
        }

        let recovered_runs = match &self.saga_log {
            Some(log) => self.recover_interrupted(log)?,
            None => Vec::new(),
        };
        Ok(StartupReport {
            purged_tenants,
            recovered_runs,
        })
    }

    fn recover_interrupted(&self, log: &Arc<SagaLog>) -> Result<Vec<RecoveredRun>> {
        let mut recovered = Vec::new();
        for run in log.interrupted_runs(self.config.recovery_max_age())? {
            let entries = log.entries_for_run(run.run_id)?;
            let Some(last) = entries.last() else {
                continue;
            };
            let Some(lease) = self.leases.try_acquire(&run.tenant_id) else {
                warn!(tenant_id = %run.tenant_id, run_id = %run.run_id, "tenant busy, leaving interrupted run for the next startup");
                continue;
            };
            let invoker = self.invoker(lease);

            let mut journal = RunJournal::resume(Arc::clone(log), last);
            let outcome = match run.lifecycle {
                Lifecycle::Create | Lifecycle::Update => {
                    self.replay_compensation(&invoker, &run, &entries, &mut journal)
                }
                Lifecycle::Delete => RecoveredRun::untouched(&run),
            };

            let message = match run.lifecycle {
                Lifecycle::Delete => INTERRUPTED_DELETE_MESSAGE,
                _ => INTERRUPTED_MESSAGE,
            };
            journal.record(SagaEvent::RunFailed {
                message: message.to_string(),
            });
            self.status
                .set_status(&run.tenant_id, Status::Failed, message);
            warn!(
                tenant_id = %run.tenant_id,
                run_id = %run.run_id,
                lifecycle = %run.lifecycle,
                compensated = outcome.compensated.len(),
                failures = outcome.compensation_failures.len(),
                "{message}"
            );
            recovered.push(outcome);
        }
        Ok(recovered)
    }

    fn replay_compensation(
        &self,
        invoker: &Invoker,
        run: &RunSummary,
        entries: &[SagaEntry],
        journal: &mut RunJournal,
    ) -> RecoveredRun {
        let replay = Replay::from_entries(entries);
        let steps = self.registry.steps(run.lifecycle);

        let mut stack: Vec<Compensation<'_>> = Vec::new();
        let mut missing = Vec::new();
        for (id, data) in replay.pending() {
            match steps.iter().find(|s| s.identifier() == id) {
                Some(step) => stack.push((step, data.clone())),
                None => missing.push(CompensationFailure {
                    step: id.to_string(),
                    message: "step is no longer registered".to_string(),
                }),
            }
        }
        for failure in &missing {
            warn!(tenant_id = %run.tenant_id, step = %failure.step, "cannot compensate unregistered step");
            journal.record(SagaEvent::CompensationFailed {
                step: failure.step.clone(),
                message: failure.message.clone(),
            });
        }

        let mut compensation_failures = self.compensate(
            invoker,
            &run.tenant_id,
            &stack,
            replay.tenant.as_ref(),
            journal,
        );
        let compensated = stack
            .iter()
            .rev()
            .map(|(step, _)| step.identifier().to_string())
            .filter(|id| !compensation_failures.iter().any(|f| &f.step == id))
            .collect();
        compensation_failures.extend(missing);

        RecoveredRun {
            run_id: run.run_id,
            tenant_id: run.tenant_id.clone(),
            lifecycle: run.lifecycle,
            compensated,
            compensation_failures,
        }
    }
}

impl RecoveredRun {
    fn untouched(run: &RunSummary) -> Self {
        Self {
            run_id: run.run_id,
            tenant_id: run.tenant_id.clone(),
            lifecycle: run.lifecycle,
            compensated: Vec::new(),
            compensation_failures: Vec::new(),
        }
    }
}
