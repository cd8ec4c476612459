//! Saga orchestration of tenant lifecycles.
//!
//! A run walks the registered steps of one lifecycle in order. Create and
//! update runs keep a stack of the steps they invoked; when a step fails the
//! stack is unwound in reverse and every entry is compensated, the failing
//! step included. Delete runs stop at the first failure.
//!
//! Every run holds its tenant's lease from start to finish. Callers that hand
//! runs to another thread take the lease up front with
//! [`TenantOrchestrator::reserve`] and pass it to the `*_reserved` variants.

pub mod entry;
mod invoke;
pub mod lease;
mod recovery;
pub mod saga_log;

pub use entry::{SagaEntry, SagaEvent};
pub use lease::{TenantLease, TenantLeases};
pub use recovery::{RecoveredRun, StartupReport, INTERRUPTED_MESSAGE};
pub use saga_log::{RunSummary, SagaLog};

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::directory::{Tenant, TenantDirectory};
use crate::error::{CompensationFailure, Result, TenantError};
use crate::model::{
    TenantInfo, TenantInitializationContext, TenantInitializationModel, TenantStepData,
};
use crate::status::{Status, StatusRecord, StatusTracker};
use crate::step::{Lifecycle, Step, StepError, StepRegistry};
use crate::tx::{NoTransaction, TransactionSupport};

use entry::RunJournal;
use invoke::Invoker;

/// How a create or update run ended.
#[derive(Debug)]
pub(crate) enum RunOutcome {
    Success,
    StepFailure {
        step: String,
        cause: StepError,
        compensation_failures: Vec<CompensationFailure>,
    },
}

/// A step to compensate together with the data it last saw.
type Compensation<'a> = (&'a Arc<dyn Step>, TenantStepData);

pub struct TenantOrchestrator {
    registry: StepRegistry,
    directory: Arc<dyn TenantDirectory>,
    tx: Arc<dyn TransactionSupport>,
    status: Arc<StatusTracker>,
    config: OrchestratorConfig,
    saga_log: Option<Arc<SagaLog>>,
    leases: TenantLeases,
}

impl std::fmt::Debug for TenantOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantOrchestrator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("saga_log", &self.saga_log.is_some())
            .finish_non_exhaustive()
    }
}

impl TenantOrchestrator {
    /// Orchestrator without transactions, with a private status tracker, the
    /// default configuration and no saga log.
    pub fn new(registry: StepRegistry, directory: Arc<dyn TenantDirectory>) -> Self {
        Self {
            registry,
            directory,
            tx: Arc::new(NoTransaction),
            status: Arc::new(StatusTracker::new()),
            config: OrchestratorConfig::default(),
            saga_log: None,
            leases: TenantLeases::new(),
        }
    }

    /// Build from a loaded configuration, opening the saga log it names.
    pub fn from_config(
        registry: StepRegistry,
        directory: Arc<dyn TenantDirectory>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let saga_log = match &config.saga_log {
            Some(path) => Some(Arc::new(SagaLog::open(path)?)),
            None => None,
        };
        Ok(Self {
            saga_log,
            config,
            ..Self::new(registry, directory)
        })
    }

    pub fn with_transactions(mut self, tx: Arc<dyn TransactionSupport>) -> Self {
        self.tx = tx;
        self
    }

    pub fn with_status_tracker(mut self, status: Arc<StatusTracker>) -> Self {
        self.status = status;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_saga_log(mut self, log: Arc<SagaLog>) -> Self {
        self.saga_log = Some(log);
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<dyn TenantDirectory> {
        &self.directory
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn saga_log(&self) -> Option<&Arc<SagaLog>> {
        self.saga_log.as_ref()
    }

    pub fn status_tracker(&self) -> &Arc<StatusTracker> {
        &self.status
    }

    pub fn provide_model(&self, lifecycle: Lifecycle) -> TenantInitializationModel {
        self.registry.provide_model(lifecycle)
    }

    pub fn status(&self, tenant_id: &str) -> StatusRecord {
        self.status.get_status(tenant_id)
    }

    /// True while a run for `tenant_id` holds its lease.
    pub fn is_running(&self, tenant_id: &str) -> bool {
        self.leases.is_held(tenant_id)
    }

    // -----------------------------------------------------------------------
    // Lifecycles
    // -----------------------------------------------------------------------

    /// Take the lease of `tenant_id` ahead of a run; fails with `TenantBusy`
    /// while another run holds it.
    pub fn reserve(&self, tenant_id: &str) -> Result<TenantLease> {
        self.leases
            .try_acquire(tenant_id)
            .ok_or_else(|| TenantError::TenantBusy(tenant_id.to_string()))
    }

    /// Provision a new tenant from `model`.
    ///
    /// On failure every step already invoked is compensated in reverse order
    /// and the original step error is returned.
    pub fn create(&self, model: TenantInitializationModel) -> Result<TenantInfo> {
        let tenant_id = required_tenant_id(&model)?;
        self.validate_model(Lifecycle::Create, &model)?;
        let lease = self.reserve(&tenant_id)?;
        self.create_reserved(model, lease)
    }

    /// [`create`](Self::create) under a lease taken with [`reserve`](Self::reserve).
    pub fn create_reserved(
        &self,
        mut model: TenantInitializationModel,
        lease: TenantLease,
    ) -> Result<TenantInfo> {
        let tenant_id = required_tenant_id(&model)?;
        self.check_lease(&lease, &tenant_id)?;
        self.validate_model(Lifecycle::Create, &model)?;
        let invoker = self.invoker(lease);

        let mut journal =
            RunJournal::begin(self.saga_log.clone(), &tenant_id, Lifecycle::Create, None);
        info!(tenant_id = %tenant_id, run_id = %journal.run_id(), "tenant creation started");
        self.status
            .set_status(&tenant_id, Status::InProgress, "create started");

        let mut ctx = TenantInitializationContext::new();
        let outcome = self.run_steps(
            &invoker,
            Lifecycle::Create,
            &tenant_id,
            &mut model,
            &mut ctx,
            &mut journal,
        );
        match outcome {
            RunOutcome::Success => {
                self.finish_completed(&tenant_id, &mut journal, format!("tenant '{tenant_id}' created"));
                Ok(ctx
                    .into_tenant_info()
                    .unwrap_or_else(|| TenantInfo::new(tenant_id)))
            }
            RunOutcome::StepFailure {
                step,
                cause,
                compensation_failures,
            } => {
                self.finish_failed(&tenant_id, &mut journal, cause.root_message());
                Err(TenantError::Creation {
                    tenant_id,
                    step,
                    source: cause,
                    compensation_failures,
                })
            }
        }
    }

    /// Apply `model` to an existing tenant.
    pub fn update(&self, model: TenantInitializationModel, tenant_id: &str) -> Result<TenantInfo> {
        self.active_tenant(tenant_id)?;
        self.validate_model(Lifecycle::Update, &model)?;
        let lease = self.reserve(tenant_id)?;
        self.update_reserved(model, tenant_id, lease)
    }

    /// [`update`](Self::update) under a lease taken with [`reserve`](Self::reserve).
    pub fn update_reserved(
        &self,
        mut model: TenantInitializationModel,
        tenant_id: &str,
        lease: TenantLease,
    ) -> Result<TenantInfo> {
        self.check_lease(&lease, tenant_id)?;
        let tenant = self.active_tenant(tenant_id)?;
        self.validate_model(Lifecycle::Update, &model)?;
        let invoker = self.invoker(lease);

        let mut journal = RunJournal::begin(
            self.saga_log.clone(),
            tenant_id,
            Lifecycle::Update,
            Some(&tenant.info),
        );
        info!(tenant_id = %tenant_id, run_id = %journal.run_id(), "tenant update started");
        self.status
            .set_status(tenant_id, Status::InProgress, "update started");

        let mut ctx = TenantInitializationContext::for_tenant(tenant.info.clone());
        let outcome = self.run_steps(
            &invoker,
            Lifecycle::Update,
            tenant_id,
            &mut model,
            &mut ctx,
            &mut journal,
        );
        match outcome {
            RunOutcome::Success => {
                if let Err(e) = self.directory.finish_tenant_activation(tenant_id) {
                    warn!(tenant_id = %tenant_id, error = %e, "tenant activation notification failed");
                }
                self.finish_completed(tenant_id, &mut journal, format!("tenant '{tenant_id}' updated"));
                Ok(ctx.into_tenant_info().unwrap_or(tenant.info))
            }
            RunOutcome::StepFailure {
                step,
                cause,
                compensation_failures,
            } => {
                self.finish_failed(tenant_id, &mut journal, cause.root_message());
                Err(TenantError::Update {
                    tenant_id: tenant_id.to_string(),
                    step,
                    source: cause,
                    compensation_failures,
                })
            }
        }
    }

    /// Remove a tenant. Steps run forward only; the first failure aborts.
    pub fn delete(&self, tenant_id: &str) -> Result<()> {
        self.active_tenant(tenant_id)?;
        let lease = self.reserve(tenant_id)?;
        self.delete_reserved(tenant_id, lease)
    }

    /// [`delete`](Self::delete) under a lease taken with [`reserve`](Self::reserve).
    pub fn delete_reserved(&self, tenant_id: &str, lease: TenantLease) -> Result<()> {
        self.check_lease(&lease, tenant_id)?;
        let tenant = self.active_tenant(tenant_id)?;
        let invoker = self.invoker(lease);

        let mut journal = RunJournal::begin(
            self.saga_log.clone(),
            tenant_id,
            Lifecycle::Delete,
            Some(&tenant.info),
        );
        info!(tenant_id = %tenant_id, run_id = %journal.run_id(), "tenant deletion started");
        self.status
            .set_status(tenant_id, Status::InProgress, "delete started");

        if let Err(e) = self.directory.call_tenant_removed_listeners(tenant_id) {
            error!(tenant_id = %tenant_id, error = %e, "tenant removed listeners failed");
            self.finish_failed(tenant_id, &mut journal, e.to_string());
            return Err(e);
        }

        for step in self.registry.steps(Lifecycle::Delete) {
            let id = step.identifier();
            self.status.set_status(tenant_id, Status::InProgress, id);
            let data = TenantStepData::completed(id);
            journal.record(SagaEvent::StepStarted {
                step: id.to_string(),
                data: data.clone(),
            });

            match invoker.delete(step, &data, Some(&tenant.info), false) {
                Ok(()) => {
                    info!(tenant_id = %tenant_id, step = %id, "delete step finished");
                    journal.record(SagaEvent::StepSucceeded {
                        step: id.to_string(),
                        data,
                    });
                }
                Err(cause) => {
                    error!(tenant_id = %tenant_id, step = %id, error = %cause, "delete step failed");
                    journal.record(SagaEvent::StepFailed {
                        step: id.to_string(),
                        message: cause.to_string(),
                        data: Some(data),
                    });
                    self.finish_failed(tenant_id, &mut journal, cause.root_message());
                    return Err(TenantError::Deletion {
                        tenant_id: tenant_id.to_string(),
                        step: id.to_string(),
                        source: cause,
                    });
                }
            }
        }

        if let Err(e) = self.directory.mark_tenant_for_deletion(tenant_id) {
            error!(tenant_id = %tenant_id, error = %e, "marking tenant for deletion failed");
            self.finish_failed(tenant_id, &mut journal, e.to_string());
            return Err(e);
        }
        self.finish_completed(tenant_id, &mut journal, format!("tenant '{tenant_id}' deleted"));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run internals
    // -----------------------------------------------------------------------

    pub(crate) fn invoker(&self, lease: TenantLease) -> Invoker {
        Invoker::new(
            Arc::clone(&self.tx),
            self.config.step_timeout(),
            self.config.step_grace(),
            lease,
        )
    }

    fn run_steps(
        &self,
        invoker: &Invoker,
        lifecycle: Lifecycle,
        tenant_id: &str,
        model: &mut TenantInitializationModel,
        ctx: &mut TenantInitializationContext,
        journal: &mut RunJournal,
    ) -> RunOutcome {
        let mut executed: Vec<&Arc<dyn Step>> = Vec::new();
        let mut tenant_logged = ctx.tenant_info().is_some();

        for step in self.registry.steps(lifecycle) {
            let id = step.identifier();
            self.status.set_status(tenant_id, Status::InProgress, id);

            let data = match model.require(id) {
                Ok(data) => data,
                Err(e) => {
                    let cause = StepError::failed(e.to_string());
                    let compensation_failures = self.unwind(
                        invoker,
                        tenant_id,
                        &executed,
                        model,
                        ctx.tenant_info(),
                        journal,
                    );
                    return RunOutcome::StepFailure {
                        step: id.to_string(),
                        cause,
                        compensation_failures,
                    };
                }
            };

            // Pushed first so a step that fails halfway is compensated too.
            executed.push(step);
            let sensitive = step.sensitive_properties();
            journal.record(SagaEvent::StepStarted {
                step: id.to_string(),
                data: data.masked(sensitive),
            });

            let result = invoker.execute(step, data, ctx);
            if !tenant_logged {
                if let Some(tenant) = ctx.tenant_info() {
                    journal.record(SagaEvent::TenantBound {
                        tenant: tenant.clone(),
                    });
                    tenant_logged = true;
                }
            }

            match result {
                Ok(()) => {
                    data.mark_completed();
                    info!(tenant_id = %tenant_id, lifecycle = %lifecycle, step = %id, "step finished");
                    journal.record(SagaEvent::StepSucceeded {
                        step: id.to_string(),
                        data: data.masked(sensitive),
                    });
                }
                Err(cause) => {
                    error!(tenant_id = %tenant_id, lifecycle = %lifecycle, step = %id, error = %cause, "step failed, compensating");
                    journal.record(SagaEvent::StepFailed {
                        step: id.to_string(),
                        message: cause.to_string(),
                        data: Some(data.masked(sensitive)),
                    });
                    let mut compensation_failures = Vec::new();
                    if cause.is_still_running() {
                        // Compensating now would race the operation it undoes.
                        executed.pop();
                        compensation_failures.push(self.skip_compensation(tenant_id, id, journal));
                    }
                    compensation_failures.extend(self.unwind(
                        invoker,
                        tenant_id,
                        &executed,
                        model,
                        ctx.tenant_info(),
                        journal,
                    ));
                    return RunOutcome::StepFailure {
                        step: id.to_string(),
                        cause,
                        compensation_failures,
                    };
                }
            }
        }
        RunOutcome::Success
    }

    fn unwind(
        &self,
        invoker: &Invoker,
        tenant_id: &str,
        executed: &[&Arc<dyn Step>],
        model: &TenantInitializationModel,
        tenant: Option<&TenantInfo>,
        journal: &mut RunJournal,
    ) -> Vec<CompensationFailure> {
        let stack: Vec<Compensation<'_>> = executed
            .iter()
            .map(|step| {
                let data = model
                    .get(step.identifier())
                    .cloned()
                    .unwrap_or_else(|| TenantStepData::new(step.identifier()));
                (*step, data)
            })
            .collect();
        self.compensate(invoker, tenant_id, &stack, tenant, journal)
    }

    fn skip_compensation(
        &self,
        tenant_id: &str,
        step: &str,
        journal: &mut RunJournal,
    ) -> CompensationFailure {
        let message = "still running after its timeout, not compensated".to_string();
        warn!(tenant_id = %tenant_id, step = %step, "{message}");
        journal.record(SagaEvent::CompensationFailed {
            step: step.to_string(),
            message: message.clone(),
        });
        CompensationFailure {
            step: step.to_string(),
            message,
        }
    }

    /// Compensate `stack` from top to bottom. Every entry is attempted; the
    /// ones that fail are returned.
    pub(crate) fn compensate(
        &self,
        invoker: &Invoker,
        tenant_id: &str,
        stack: &[Compensation<'_>],
        tenant: Option<&TenantInfo>,
        journal: &mut RunJournal,
    ) -> Vec<CompensationFailure> {
        let mut failures = Vec::new();

        for (step, data) in stack.iter().rev() {
            let id = step.identifier();
            match invoker.delete(step, data, tenant, true) {
                Ok(()) => {
                    info!(tenant_id = %tenant_id, step = %id, "step compensated");
                    journal.record(SagaEvent::Compensated {
                        step: id.to_string(),
                    });
                }
                Err(e) => {
                    warn!(tenant_id = %tenant_id, step = %id, error = %e, "compensation failed");
                    journal.record(SagaEvent::CompensationFailed {
                        step: id.to_string(),
                        message: e.to_string(),
                    });
                    failures.push(CompensationFailure {
                        step: id.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        failures
    }

    fn finish_completed(&self, tenant_id: &str, journal: &mut RunJournal, message: String) {
        info!(tenant_id = %tenant_id, run_id = %journal.run_id(), "{message}");
        self.status
            .set_status(tenant_id, Status::Completed, message.as_str());
        journal.record(SagaEvent::RunCompleted { message });
    }

    fn finish_failed(&self, tenant_id: &str, journal: &mut RunJournal, message: String) {
        self.status
            .set_status(tenant_id, Status::Failed, message.as_str());
        journal.record(SagaEvent::RunFailed { message });
    }

    /// Check that `model` carries data for every step of `lifecycle`.
    pub fn validate_model(
        &self,
        lifecycle: Lifecycle,
        model: &TenantInitializationModel,
    ) -> Result<()> {
        for id in self.registry.identifiers(lifecycle) {
            if !model.contains(id) {
                return Err(TenantError::MissingStepData(id.to_string()));
            }
        }
        Ok(())
    }

    /// Active directory record for `tenant_id`; a tenant marked for deletion
    /// counts as gone.
    pub fn active_tenant(&self, tenant_id: &str) -> Result<Tenant> {
        self.directory
            .get_tenant(tenant_id)?
            .filter(Tenant::is_active)
            .ok_or_else(|| TenantError::TenantNotFound(tenant_id.to_string()))
    }

    fn check_lease(&self, lease: &TenantLease, tenant_id: &str) -> Result<()> {
        if lease.tenant_id() != tenant_id || !self.leases.owns(lease) {
            return Err(TenantError::ForeignLease {
                lease: lease.tenant_id().to_string(),
                tenant_id: tenant_id.to_string(),
            });
        }
        Ok(())
    }
}

fn required_tenant_id(model: &TenantInitializationModel) -> Result<String> {
    model
        .tenant_id()
        .map(str::to_string)
        .ok_or(TenantError::MissingTenantId)
}
