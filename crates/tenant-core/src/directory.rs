//! Tenant directory: the persistent record of which tenants exist.
//!
//! The orchestrator consumes [`TenantDirectory`]; the production
//! implementation belongs to the embedding service. [`InMemoryTenantDirectory`]
//! serves single-process deployments and tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::error::{Result, TenantError};
use crate::model::TenantInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantState {
    Active,
    /// Soft-deleted; purged by [`TenantDirectory::delete_marked_tenants`].
    MarkedForDeletion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub info: TenantInfo,
    pub state: TenantState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(info: TenantInfo) -> Self {
        let now = Utc::now();
        Self {
            info,
            state: TenantState::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TenantState::Active
    }
}

pub trait TenantDirectory: Send + Sync {
    fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>>;

    /// Tell dependent subsystems (authentication and the like) that the
    /// tenant's latest update is fully applied.
    fn finish_tenant_activation(&self, tenant_id: &str) -> Result<()>;

    /// Soft delete; the id stays reserved until the next purge.
    fn mark_tenant_for_deletion(&self, tenant_id: &str) -> Result<()>;

    /// Notify removal listeners so they stop issuing work against the tenant.
    fn call_tenant_removed_listeners(&self, tenant_id: &str) -> Result<()>;

    /// Purge soft-deleted records. Returns how many were removed.
    fn delete_marked_tenants(&self) -> Result<usize>;
}

type RemovedListener = Box<dyn Fn(&str) + Send + Sync>;

/// Directory held entirely in memory.
#[derive(Default)]
pub struct InMemoryTenantDirectory {
    tenants: RwLock<HashMap<String, Tenant>>,
    listeners: RwLock<Vec<RemovedListener>>,
    activations: Mutex<HashMap<String, u32>>,
}

impl InMemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or re-activate) a tenant record.
    pub fn register(&self, info: TenantInfo) -> Tenant {
        let tenant = Tenant::new(info);
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        tenants.insert(tenant.info.tenant_id().to_string(), tenant.clone());
        tenant
    }

    pub fn on_tenant_removed(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(Box::new(listener));
    }

    /// Number of activation notifications received for `tenant_id`.
    pub fn activations(&self, tenant_id: &str) -> u32 {
        let activations = self.activations.lock().unwrap_or_else(|e| e.into_inner());
        activations.get(tenant_id).copied().unwrap_or(0)
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = tenants.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn update_state(&self, tenant_id: &str, state: TenantState) -> Result<()> {
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        let tenant = tenants
            .get_mut(tenant_id)
            .ok_or_else(|| TenantError::TenantNotFound(tenant_id.to_string()))?;
        tenant.state = state;
        tenant.updated_at = Utc::now();
        Ok(())
    }
}

impl TenantDirectory for InMemoryTenantDirectory {
    fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let tenants = self.tenants.read().unwrap_or_else(|e| e.into_inner());
        Ok(tenants.get(tenant_id).cloned())
    }

    fn finish_tenant_activation(&self, tenant_id: &str) -> Result<()> {
        self.update_state(tenant_id, TenantState::Active)?;
        let mut activations = self.activations.lock().unwrap_or_else(|e| e.into_inner());
        *activations.entry(tenant_id.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn mark_tenant_for_deletion(&self, tenant_id: &str) -> Result<()> {
        self.update_state(tenant_id, TenantState::MarkedForDeletion)
    }

    fn call_tenant_removed_listeners(&self, tenant_id: &str) -> Result<()> {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener(tenant_id);
        }
        Ok(())
    }

    fn delete_marked_tenants(&self) -> Result<usize> {
        let mut tenants = self.tenants.write().unwrap_or_else(|e| e.into_inner());
        let before = tenants.len();
        tenants.retain(|_, t| t.is_active());
        Ok(before - tenants.len())
    }
}
