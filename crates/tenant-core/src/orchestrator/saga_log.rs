//! Durable, append-only saga log using redb.
//!
//! # Table design
//!
//! A single `SAGA_LOG` table uses a 28-byte composite key:
//! ```text
//! [ run_started_ms: u64 big-endian (8 bytes) | run uuid: 16 bytes | seq: u32 big-endian (4 bytes) ]
//! ```
//!
//! Byte order equals (run start, run, sequence) order, so the entries of one
//! run are contiguous and in append order, and runs appear oldest first.
//! Entries are never rewritten; recovery appends new entries instead.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, TenantError};
use crate::step::Lifecycle;

use super::entry::SagaEntry;

// ---------------------------------------------------------------------------
// Table definition
// ---------------------------------------------------------------------------

/// Key: 28-byte composite (run_started_ms ++ run uuid ++ seq)
/// Value: JSON-encoded SagaEntry
const SAGA_LOG: TableDefinition<&[u8], &[u8]> = TableDefinition::new("saga_log");

fn entry_key(entry: &SagaEntry) -> [u8; 28] {
    let mut key = [0u8; 28];
    let ms = entry.run_started_at.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..24].copy_from_slice(entry.run_id.as_bytes());
    key[24..].copy_from_slice(&entry.seq.to_be_bytes());
    key
}

fn db_err(e: impl std::fmt::Display) -> TenantError {
    TenantError::SagaLog(e.to_string())
}

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

/// One run as seen from the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub tenant_id: String,
    pub lifecycle: Lifecycle,
    pub started_at: DateTime<Utc>,
    pub last_event: String,
    pub last_recorded_at: DateTime<Utc>,
    pub terminal: bool,
    pub entries: usize,
}

impl RunSummary {
    fn start(entry: &SagaEntry) -> Self {
        Self {
            run_id: entry.run_id,
            tenant_id: entry.tenant_id.clone(),
            lifecycle: entry.lifecycle,
            started_at: entry.run_started_at,
            last_event: entry.event.label().to_string(),
            last_recorded_at: entry.recorded_at,
            terminal: entry.event.is_terminal(),
            entries: 1,
        }
    }

    fn absorb(&mut self, entry: &SagaEntry) {
        self.last_event = entry.event.label().to_string();
        self.last_recorded_at = entry.recorded_at;
        self.terminal |= entry.event.is_terminal();
        self.entries += 1;
    }
}

// ---------------------------------------------------------------------------
// SagaLog
// ---------------------------------------------------------------------------

/// Persistent store of [`SagaEntry`] records.
pub struct SagaLog {
    db: Database,
}

impl std::fmt::Debug for SagaLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaLog").finish_non_exhaustive()
    }
}

impl SagaLog {
    /// Open or create the redb database at `path`.
    ///
    /// Creates the `SAGA_LOG` table if it doesn't already exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(SAGA_LOG).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Append one entry in its own write transaction.
    pub fn append(&self, entry: &SagaEntry) -> Result<()> {
        let key = entry_key(entry);
        let value = serde_json::to_vec(entry)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(SAGA_LOG).map_err(db_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    /// Every entry in key order.
    pub fn list_all(&self) -> Result<Vec<SagaEntry>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(SAGA_LOG).map_err(db_err)?;

        let mut result = Vec::new();
        for item in table.iter().map_err(db_err)? {
            let (_, v) = item.map_err(db_err)?;
            let entry: SagaEntry = serde_json::from_slice(v.value())?;
            result.push(entry);
        }
        Ok(result)
    }

    pub fn entries_for_run(&self, run_id: Uuid) -> Result<Vec<SagaEntry>> {
        let mut entries = self.list_all()?;
        entries.retain(|e| e.run_id == run_id);
        Ok(entries)
    }

    /// All entries for `tenant_id`, runs oldest first.
    pub fn entries_for_tenant(&self, tenant_id: &str) -> Result<Vec<SagaEntry>> {
        let mut entries = self.list_all()?;
        entries.retain(|e| e.tenant_id == tenant_id);
        Ok(entries)
    }

    /// One summary per run, oldest run first.
    pub fn runs(&self) -> Result<Vec<RunSummary>> {
        let mut order: Vec<Uuid> = Vec::new();
        let mut by_run: HashMap<Uuid, RunSummary> = HashMap::new();
        for entry in self.list_all()? {
            match by_run.get_mut(&entry.run_id) {
                Some(summary) => summary.absorb(&entry),
                None => {
                    order.push(entry.run_id);
                    by_run.insert(entry.run_id, RunSummary::start(&entry));
                }
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|id| by_run.remove(&id))
            .collect())
    }

    /// Runs with no terminal entry whose last entry is older than `max_age`.
    ///
    /// The age filter keeps a run that is still executing in this or another
    /// process from being treated as abandoned.
    pub fn interrupted_runs(&self, max_age: Duration) -> Result<Vec<RunSummary>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).map_err(db_err)?;
        Ok(self
            .runs()?
            .into_iter()
            .filter(|r| !r.terminal && r.last_recorded_at <= cutoff)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TenantStepData;
    use crate::orchestrator::entry::SagaEvent;
    use chrono::Duration as CDur;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, SagaLog) {
        let dir = TempDir::new().unwrap();
        let log = SagaLog::open(&dir.path().join("saga.redb")).unwrap();
        (dir, log)
    }

    fn entry(
        run_id: Uuid,
        tenant: &str,
        started: DateTime<Utc>,
        seq: u32,
        event: SagaEvent,
    ) -> SagaEntry {
        SagaEntry {
            run_id,
            tenant_id: tenant.into(),
            lifecycle: Lifecycle::Create,
            seq,
            run_started_at: started,
            recorded_at: started + CDur::milliseconds(seq as i64),
            event,
        }
    }

    fn step_started(step: &str) -> SagaEvent {
        SagaEvent::StepStarted {
            step: step.into(),
            data: TenantStepData::new(step),
        }
    }

    #[test]
    fn entries_of_a_run_come_back_in_sequence_order() {
        let (_dir, log) = open_tmp();
        let run = Uuid::new_v4();
        let t0 = Utc::now();
        // Appended out of order on purpose
        log.append(&entry(run, "a.com", t0, 2, step_started("db"))).unwrap();
        log.append(&entry(run, "a.com", t0, 0, SagaEvent::RunStarted { tenant: None }))
            .unwrap();
        log.append(&entry(run, "a.com", t0, 1, step_started("tenant"))).unwrap();

        let seqs: Vec<u32> = log.entries_for_run(run).unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, [0, 1, 2]);
    }

    #[test]
    fn runs_are_summarised_oldest_first() {
        let (_dir, log) = open_tmp();
        let now = Utc::now();
        let older = Uuid::new_v4();
        let newer = Uuid::new_v4();

        log.append(&entry(newer, "b.com", now, 0, SagaEvent::RunStarted { tenant: None }))
            .unwrap();
        log.append(&entry(older, "a.com", now - CDur::seconds(10), 0, SagaEvent::RunStarted { tenant: None }))
            .unwrap();
        log.append(&entry(
            older,
            "a.com",
            now - CDur::seconds(10),
            1,
            SagaEvent::RunCompleted {
                message: "done".into(),
            },
        ))
        .unwrap();

        let runs = log.runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].tenant_id, "a.com");
        assert!(runs[0].terminal);
        assert_eq!(runs[0].entries, 2);
        assert_eq!(runs[0].last_event, "run_completed");
        assert_eq!(runs[1].tenant_id, "b.com");
        assert!(!runs[1].terminal);
    }

    #[test]
    fn interrupted_runs_respect_max_age() {
        let (_dir, log) = open_tmp();
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let long_ago = Utc::now() - CDur::minutes(10);

        log.append(&entry(stale, "stale.com", long_ago, 0, SagaEvent::RunStarted { tenant: None }))
            .unwrap();
        log.append(&entry(stale, "stale.com", long_ago, 1, step_started("db"))).unwrap();
        log.append(&entry(fresh, "fresh.com", Utc::now(), 0, SagaEvent::RunStarted { tenant: None }))
            .unwrap();

        let interrupted = log.interrupted_runs(Duration::from_secs(120)).unwrap();
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].run_id, stale);
        assert_eq!(interrupted[0].last_event, "step_started");
    }

    #[test]
    fn entries_for_tenant_filters_other_tenants() {
        let (_dir, log) = open_tmp();
        let t0 = Utc::now();
        log.append(&entry(Uuid::new_v4(), "a.com", t0, 0, SagaEvent::RunStarted { tenant: None }))
            .unwrap();
        log.append(&entry(Uuid::new_v4(), "b.com", t0, 0, SagaEvent::RunStarted { tenant: None }))
            .unwrap();
        assert_eq!(log.entries_for_tenant("a.com").unwrap().len(), 1);
        assert!(log.entries_for_tenant("c.com").unwrap().is_empty());
    }

    #[test]
    fn reopen_keeps_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/saga.redb");
        let run = Uuid::new_v4();
        {
            let log = SagaLog::open(&path).unwrap();
            log.append(&entry(run, "a.com", Utc::now(), 0, SagaEvent::RunStarted { tenant: None }))
                .unwrap();
        }
        let log = SagaLog::open(&path).unwrap();
        assert_eq!(log.entries_for_run(run).unwrap().len(), 1);
    }

    #[test]
    fn empty_log_has_no_runs() {
        let (_dir, log) = open_tmp();
        assert!(log.runs().unwrap().is_empty());
        assert!(log.interrupted_runs(Duration::from_secs(0)).unwrap().is_empty());
    }
}
