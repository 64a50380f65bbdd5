//! The mirror store: one record per upstream, and the cold/warm sync
//! decisions made on each request.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

use super::layout;
use super::record::{MirrorKey, MirrorRecord, MirrorState, RecordStatus, SyncGuard};
use super::staleness::StalenessPolicy;
use super::sync::{CloneOutcome, SyncEngine};
use crate::config::VcsKind;
use crate::metrics::{GaugeGuard, MetricsRegistry};
use crate::routing;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A servable mirror, as handed to the protocol server.
#[derive(Debug, Clone)]
pub struct MirrorHandle {
    pub key: MirrorKey,
    pub local_path: PathBuf,
    pub state: MirrorState,
}

/// A cold clone failed; nothing can be served.
///
/// Cloneable because one failure is delivered to every request that waited
/// on the same clone.
#[derive(Debug, Clone)]
pub struct SyncFailed {
    pub upstream: String,
    pub reason: String,
}

impl fmt::Display for SyncFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync of {} failed: {}", self.upstream, self.reason)
    }
}

impl std::error::Error for SyncFailed {}

/// Point-in-time copy of one record.
#[derive(Debug, Clone)]
pub struct MirrorSnapshot {
    pub key: MirrorKey,
    pub local_path: PathBuf,
    pub status: RecordStatus,
}

/// Row of the public `/_mirrors` listing.
///
/// Carries no local paths, error text or upstream credentials; those stay in
/// the logs.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorListing {
    pub kind: VcsKind,
    pub upstream: String,
    pub state: MirrorState,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_sync_failed: bool,
}

impl From<&MirrorSnapshot> for MirrorListing {
    fn from(row: &MirrorSnapshot) -> Self {
        Self {
            kind: row.key.kind,
            upstream: routing::redact_credentials(&row.key.upstream),
            state: row.status.state,
            last_synced_at: row.status.last_synced_at,
            last_attempt_at: row.status.last_attempt_at,
            last_sync_failed: row.status.last_error.is_some(),
        }
    }
}

// ---------------------------------------------------------------------------
// MirrorStore
// ---------------------------------------------------------------------------

pub struct MirrorStore {
    records: Mutex<HashMap<MirrorKey, Arc<MirrorRecord>>>,
    engine: Arc<SyncEngine>,
    policy: Arc<dyn StalenessPolicy>,
    metrics: MetricsRegistry,
}

impl MirrorStore {
    pub fn new(
        engine: Arc<SyncEngine>,
        policy: Arc<dyn StalenessPolicy>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            engine,
            policy,
            metrics,
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// The record for `key`, created on first reference.
    fn record(&self, key: MirrorKey) -> Arc<MirrorRecord> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let len_before = records.len();
        let record = records
            .entry(key)
            .or_insert_with_key(|key| {
                let path = layout::mirror_path(self.engine.root(), key);
                Arc::new(MirrorRecord::new(key.clone(), path))
            })
            .clone();
        if records.len() != len_before {
            self.metrics.metrics.mirrors_total.set(records.len() as i64);
        }
        record
    }

    /// Return a servable mirror of `key`, cloning it first if necessary.
    ///
    /// Waits only when no servable copy exists.  A ready mirror that is due
    /// for refresh is returned immediately while the refresh runs in the
    /// background.
    pub async fn ensure(&self, key: MirrorKey) -> Result<MirrorHandle, SyncFailed> {
        let record = self.record(key);

        loop {
            let status = record.status();
            match status.state {
                MirrorState::Ready => {
                    let due = self.policy.needs_refresh(
                        record.key(),
                        status.last_synced_at,
                        Utc::now(),
                    );
                    let mut state = MirrorState::Ready;
                    if due && record.try_begin(&[MirrorState::Ready], MirrorState::Updating) {
                        self.spawn_update(record.clone());
                        state = MirrorState::Updating;
                    }
                    return Ok(handle(&record, state));
                }
                MirrorState::Updating => return Ok(handle(&record, MirrorState::Updating)),
                MirrorState::Absent | MirrorState::Failed => {
                    if record.try_begin(
                        &[MirrorState::Absent, MirrorState::Failed],
                        MirrorState::Cloning,
                    ) {
                        self.spawn_clone(record.clone());
                    }
                }
                MirrorState::Cloning => {}
            }

            let settled = {
                let _waiting = GaugeGuard::new(&self.metrics.metrics.cold_waiters);
                record.wait_settled().await
            };

            if settled.state == MirrorState::Failed {
                return Err(SyncFailed {
                    upstream: record.key().upstream.clone(),
                    reason: settled
                        .last_error
                        .unwrap_or_else(|| "unknown error".to_string()),
                });
            }
        }
    }

    /// Status of every record, ordered by upstream.
    pub fn snapshot(&self) -> Vec<MirrorSnapshot> {
        let records: Vec<Arc<MirrorRecord>> = {
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.values().cloned().collect()
        };
        let mut rows: Vec<MirrorSnapshot> = records
            .iter()
            .map(|r| MirrorSnapshot {
                key: r.key().clone(),
                local_path: r.local_path().to_path_buf(),
                status: r.status(),
            })
            .collect();
        rows.sort_by(|a, b| {
            (a.key.upstream.as_str(), a.key.kind.as_str())
                .cmp(&(b.key.upstream.as_str(), b.key.kind.as_str()))
        });
        rows
    }

    /// Run the initial clone detached from the requesting task, so a client
    /// disconnect does not abandon it.
    fn spawn_clone(&self, record: Arc<MirrorRecord>) {
        let engine = self.engine.clone();
        let guard = SyncGuard::for_clone(record);
        tokio::spawn(async move {
            let record = guard.record().clone();
            let result = engine.clone_mirror(record.key(), record.local_path()).await;
            guard.disarm();
            match result {
                Ok(CloneOutcome::Cloned) => record.finish_clone(Ok(())),
                Ok(CloneOutcome::Adopted) => record.adopt(),
                Err(e) => {
                    error!(upstream = %record.key().upstream, error = %format!("{e:#}"), "mirror clone failed");
                    record.finish_clone(Err(format!("{e:#}")));
                }
            }
        });
    }

    fn spawn_update(&self, record: Arc<MirrorRecord>) {
        let engine = self.engine.clone();
        let guard = SyncGuard::for_update(record);
        tokio::spawn(async move {
            let record = guard.record().clone();
            let result = engine.update_mirror(record.key(), record.local_path()).await;
            guard.disarm();
            match result {
                Ok(_) => record.finish_update(Ok(())),
                Err(e) => {
                    // The previous contents stay servable.
                    warn!(upstream = %record.key().upstream, error = %format!("{e:#}"), "mirror update failed; serving stale copy");
                    record.finish_update(Err(format!("{e:#}")));
                }
            }
        });
    }
}

fn handle(record: &MirrorRecord, state: MirrorState) -> MirrorHandle {
    MirrorHandle {
        key: record.key().clone(),
        local_path: record.local_path().to_path_buf(),
        state,
    }
}

impl fmt::Debug for MirrorStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorStore").finish_non_exhaustive()
    }
}
