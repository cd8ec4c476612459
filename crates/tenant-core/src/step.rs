//! The step contract and the ordered per-lifecycle step registry.
//!
//! A [`Step`] is one unit of provisioning work against a single subsystem
//! (a schema, a semantic repository, a search index, a mailbox). Steps are
//! wired explicitly into a [`StepRegistry`]; registration order is the
//! execution order.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::{Result, TenantError};
use crate::model::{
    TenantInfo, TenantInitializationContext, TenantInitializationModel, TenantStepData,
};

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Create,
    Update,
    Delete,
}

impl Lifecycle {
    pub fn all() -> &'static [Lifecycle] {
        &[Lifecycle::Create, Lifecycle::Update, Lifecycle::Delete]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Create => "create",
            Lifecycle::Update => "update",
            Lifecycle::Delete => "delete",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lifecycle {
    type Err = TenantError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Lifecycle::Create),
            "update" => Ok(Lifecycle::Update),
            "delete" => Ok(Lifecycle::Delete),
            other => Err(TenantError::InvalidLifecycle(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Failure of a single step operation.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("step '{step}' timed out after {timeout:?}")]
    TimedOut { step: String, timeout: Duration },

    /// Overran its timeout and the grace period after it; the operation may
    /// still be changing external state.
    #[error("step '{step}' timed out after {timeout:?} and is still running")]
    StillRunning { step: String, timeout: Duration },

    #[error("step '{step}' panicked: {message}")]
    Panicked { step: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// True when the operation had not finished by the time the run moved on.
    pub fn is_still_running(&self) -> bool {
        matches!(self, Self::StillRunning { .. })
    }

    /// Message of the innermost cause.
    pub fn root_message(&self) -> String {
        match self {
            Self::Other(e) => e.root_cause().to_string(),
            other => other.to_string(),
        }
    }
}

pub type StepResult = std::result::Result<(), StepError>;

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A unit of provisioning work.
///
/// `execute` must return `Err` on anything it cannot recover from: failure
/// detection is based on the returned result, never on inspecting external
/// state afterwards.
///
/// `delete` either compensates (`is_rollback = true`) or permanently removes
/// (`is_rollback = false`) what `execute` created. During rollback `execute`
/// may have failed halfway or never finished, so "nothing to clean up" must
/// return `Ok`.
///
/// `tenant` is the tenant the run was bound to when `delete` is called: the
/// existing tenant for update and delete runs, the tenant a step bound during
/// a create run, and `None` when no step had bound one yet. Compensations
/// replayed at startup receive the same value, read back from the saga log.
pub trait Step: Send + Sync {
    fn identifier(&self) -> &str;

    /// Default data for building a model. Must not perform I/O.
    fn provide(&self) -> TenantStepData {
        TenantStepData::new(self.identifier())
    }

    /// Property keys whose values must never reach the saga log, such as
    /// credentials. The step itself always sees the real values, except in
    /// compensations replayed at startup, which see the mask.
    fn sensitive_properties(&self) -> &[&str] {
        &[]
    }

    fn execute(
        &self,
        data: &mut TenantStepData,
        ctx: &mut TenantInitializationContext,
    ) -> StepResult;

    fn delete(
        &self,
        data: &TenantStepData,
        tenant: Option<&TenantInfo>,
        is_rollback: bool,
    ) -> StepResult;
}

// ---------------------------------------------------------------------------
// StepRegistry
// ---------------------------------------------------------------------------

/// Ordered steps for each lifecycle.
#[derive(Clone, Default)]
pub struct StepRegistry {
    create: Vec<Arc<dyn Step>>,
    update: Vec<Arc<dyn Step>>,
    delete: Vec<Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::default()
    }

    pub fn steps(&self, lifecycle: Lifecycle) -> &[Arc<dyn Step>] {
        match lifecycle {
            Lifecycle::Create => &self.create,
            Lifecycle::Update => &self.update,
            Lifecycle::Delete => &self.delete,
        }
    }

    pub fn identifiers(&self, lifecycle: Lifecycle) -> Vec<&str> {
        self.steps(lifecycle).iter().map(|s| s.identifier()).collect()
    }

    /// Default model for `lifecycle`: every step's `provide()` in order.
    pub fn provide_model(&self, lifecycle: Lifecycle) -> TenantInitializationModel {
        self.steps(lifecycle).iter().map(|s| s.provide()).collect()
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("create", &self.identifiers(Lifecycle::Create))
            .field("update", &self.identifiers(Lifecycle::Update))
            .field("delete", &self.identifiers(Lifecycle::Delete))
            .finish()
    }
}

#[derive(Default)]
pub struct StepRegistryBuilder {
    registry: StepRegistry,
}

impl StepRegistryBuilder {
    pub fn create(mut self, step: Arc<dyn Step>) -> Self {
        self.registry.create.push(step);
        self
    }

    pub fn update(mut self, step: Arc<dyn Step>) -> Self {
        self.registry.update.push(step);
        self
    }

    pub fn delete(mut self, step: Arc<dyn Step>) -> Self {
        self.registry.delete.push(step);
        self
    }

    /// Finish the registry, rejecting duplicate identifiers within a lifecycle.
    pub fn build(self) -> Result<StepRegistry> {
        for &lifecycle in Lifecycle::all() {
            let mut seen = HashSet::new();
            for id in self.registry.identifiers(lifecycle) {
                if !seen.insert(id) {
                    return Err(TenantError::DuplicateStep {
                        lifecycle,
                        step: id.to_string(),
                    });
                }
            }
        }
        Ok(self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Step for Named {
        fn identifier(&self) -> &str {
            self.0
        }

        fn provide(&self) -> TenantStepData {
            TenantStepData::new(self.0).with_property("default", "yes")
        }

        fn execute(&self, _: &mut TenantStepData, _: &mut TenantInitializationContext) -> StepResult {
            Ok(())
        }

        fn delete(&self, _: &TenantStepData, _: Option<&TenantInfo>, _: bool) -> StepResult {
            Ok(())
        }
    }

    #[test]
    fn registry_keeps_registration_order() {
        let registry = StepRegistry::builder()
            .create(Arc::new(Named("tenant")))
            .create(Arc::new(Named("db")))
            .create(Arc::new(Named("mail")))
            .delete(Arc::new(Named("mail")))
            .build()
            .unwrap();

        assert_eq!(registry.identifiers(Lifecycle::Create), ["tenant", "db", "mail"]);
        assert_eq!(registry.identifiers(Lifecycle::Delete), ["mail"]);
        assert!(registry.steps(Lifecycle::Update).is_empty());
    }

    #[test]
    fn duplicate_identifier_in_one_lifecycle_is_rejected() {
        let err = StepRegistry::builder()
            .update(Arc::new(Named("db")))
            .update(Arc::new(Named("db")))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            TenantError::DuplicateStep { lifecycle: Lifecycle::Update, ref step } if step == "db"
        ));
    }

    #[test]
    fn provide_model_unions_step_defaults() {
        let registry = StepRegistry::builder()
            .create(Arc::new(Named("tenant")))
            .create(Arc::new(Named("db")))
            .build()
            .unwrap();
        let model = registry.provide_model(Lifecycle::Create);
        let ids: Vec<&str> = model.iter().map(|d| d.step_identifier()).collect();
        assert_eq!(ids, ["tenant", "db"]);
        assert_eq!(model.get("db").unwrap().property("default"), Some("yes"));
    }

    #[test]
    fn lifecycle_parses_and_displays() {
        assert_eq!("delete".parse::<Lifecycle>().unwrap(), Lifecycle::Delete);
        assert_eq!(Lifecycle::Update.to_string(), "update");
        assert!("purge".parse::<Lifecycle>().is_err());
    }

    #[test]
    fn step_error_root_message() {
        assert_eq!(StepError::failed("boom").root_message(), "boom");
        let timed_out = StepError::TimedOut {
            step: "db".into(),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(timed_out.root_message(), "step 'db' timed out after 2s");
        assert!(!timed_out.is_still_running());

        let running = StepError::StillRunning {
            step: "db".into(),
            timeout: Duration::from_secs(2),
        };
        assert!(running.is_still_running());
        assert_eq!(
            running.to_string(),
            "step 'db' timed out after 2s and is still running"
        );
    }
}
