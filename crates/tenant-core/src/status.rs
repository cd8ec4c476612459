//! Latest run status per tenant, polled by callers of long-running runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    InProgress,
    Completed,
    Failed,
    /// No run has been recorded for the tenant.
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::InProgress => "IN_PROGRESS",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
            Status::Unknown => "UNKNOWN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusRecord {
    pub fn unknown() -> Self {
        Self {
            status: Status::Unknown,
            message: String::new(),
            updated_at: None,
        }
    }
}

/// Process-wide map from tenant id to its latest [`StatusRecord`].
///
/// Records are overwritten, never versioned. Safe to share across threads.
#[derive(Debug, Default)]
pub struct StatusTracker {
    records: RwLock<HashMap<String, StatusRecord>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, tenant_id: &str, status: Status, message: impl Into<String>) {
        let record = StatusRecord {
            status,
            message: message.into(),
            updated_at: Some(Utc::now()),
        };
        // A poisoned lock only means a writer panicked mid-insert; the map is still usable.
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(tenant_id.to_string(), record);
    }

    /// Latest record, or [`StatusRecord::unknown`] for tenants never seen.
    pub fn get_status(&self, tenant_id: &str) -> StatusRecord {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .get(tenant_id)
            .cloned()
            .unwrap_or_else(StatusRecord::unknown)
    }

    pub fn is_completed(&self, tenant_id: &str) -> bool {
        self.get_status(tenant_id).status == Status::Completed
    }

    pub fn is_in_progress(&self, tenant_id: &str) -> bool {
        self.get_status(tenant_id).status == Status::InProgress
    }

    pub fn has_failed(&self, tenant_id: &str) -> bool {
        self.get_status(tenant_id).status == Status::Failed
    }

    pub fn clear(&self, tenant_id: &str) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.remove(tenant_id);
    }

    /// Every tracked record, sorted by tenant id.
    pub fn snapshot(&self) -> Vec<(String, StatusRecord)> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<(String, StatusRecord)> = records
            .iter()
            .map(|(id, rec)| (id.clone(), rec.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unknown_tenant_yields_sentinel() {
        let tracker = StatusTracker::new();
        let rec = tracker.get_status("nobody");
        assert_eq!(rec.status, Status::Unknown);
        assert!(rec.message.is_empty());
        assert!(!tracker.is_completed("nobody"));
        assert!(!tracker.is_in_progress("nobody"));
        assert!(!tracker.has_failed("nobody"));
    }

    #[test]
    fn latest_status_overwrites_previous() {
        let tracker = StatusTracker::new();
        tracker.set_status("acme.com", Status::InProgress, "db");
        assert!(tracker.is_in_progress("acme.com"));
        tracker.set_status("acme.com", Status::Failed, "boom");
        let rec = tracker.get_status("acme.com");
        assert_eq!(rec.status, Status::Failed);
        assert_eq!(rec.message, "boom");
        assert_eq!(tracker.snapshot().len(), 1);
    }

    #[test]
    fn clear_forgets_tenant() {
        let tracker = StatusTracker::new();
        tracker.set_status("acme.com", Status::Completed, "done");
        tracker.clear("acme.com");
        assert_eq!(tracker.get_status("acme.com").status, Status::Unknown);
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&Status::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        assert_eq!(Status::Failed.to_string(), "FAILED");
        assert!(Status::Completed.is_terminal());
        assert!(!Status::InProgress.is_terminal());
    }

    #[test]
    fn concurrent_writers_for_distinct_tenants() {
        let tracker = Arc::new(StatusTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    let id = format!("tenant-{i}");
                    for step in 0..50 {
                        tracker.set_status(&id, Status::InProgress, format!("step-{step}"));
                    }
                    tracker.set_status(&id, Status::Completed, "done");
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 8);
        assert!(snapshot.iter().all(|(_, r)| r.status == Status::Completed));
        assert_eq!(snapshot[0].0, "tenant-0");
    }
}
