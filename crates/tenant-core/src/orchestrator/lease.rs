//! Per-tenant mutual exclusion for a single process.
//!
//! Two runs for the same tenant id must not interleave. Multi-instance
//! deployments need a distributed lock in place of this.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default, Clone)]
pub struct TenantLeases {
    held: Arc<Mutex<HashSet<String>>>,
}

impl TenantLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `tenant_id`, or `None` while another run holds it.
    pub fn try_acquire(&self, tenant_id: &str) -> Option<TenantLease> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(tenant_id.to_string()) {
            return None;
        }
        Some(TenantLease {
            tenant_id: tenant_id.to_string(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, tenant_id: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.contains(tenant_id)
    }

    /// True when `lease` was handed out by this set.
    pub fn owns(&self, lease: &TenantLease) -> bool {
        Arc::ptr_eq(&self.held, &lease.held)
    }
}

/// Released on drop, including while unwinding.
#[derive(Debug)]
pub struct TenantLease {
    tenant_id: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl TenantLease {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

impl Drop for TenantLease {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.tenant_id);
    }
}
