//! Per-upstream mirror records and their state machine.
//!
//! ```text
//! Absent ──► Cloning ──► Ready ◄──► Updating
//!              │  ▲
//!              ▼  │
//!             Failed
//! ```
//!
//! A record's status lives in a [`tokio::sync::watch`] channel.  Entering
//! `Cloning` or `Updating` is a compare-and-set on that channel, which makes
//! it the per-record exclusion gate; the same channel wakes every task
//! waiting for a clone to settle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::VcsKind;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Identity of a mirror: one record per `(kind, upstream)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorKey {
    pub kind: VcsKind,
    pub upstream: String,
}

impl MirrorKey {
    pub fn new(kind: VcsKind, upstream: impl Into<String>) -> Self {
        Self {
            kind,
            upstream: upstream.into(),
        }
    }
}

impl fmt::Display for MirrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.upstream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorState {
    /// Never cloned by this process.
    Absent,
    /// Initial clone in progress; the local path is not servable yet.
    Cloning,
    /// Servable.
    Ready,
    /// Servable while a background refresh runs.
    Updating,
    /// The last clone attempt failed; a later request retries.
    Failed,
}

impl MirrorState {
    pub fn is_servable(self) -> bool {
        matches!(self, Self::Ready | Self::Updating)
    }
}

/// Point-in-time view of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStatus {
    pub state: MirrorState,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for RecordStatus {
    fn default() -> Self {
        Self {
            state: MirrorState::Absent,
            last_synced_at: None,
            last_attempt_at: None,
            last_error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// MirrorRecord
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MirrorRecord {
    key: MirrorKey,
    local_path: PathBuf,
    status: watch::Sender<RecordStatus>,
}

impl MirrorRecord {
    pub fn new(key: MirrorKey, local_path: PathBuf) -> Self {
        let (status, _) = watch::channel(RecordStatus::default());
        Self {
            key,
            local_path,
            status,
        }
    }

    pub fn key(&self) -> &MirrorKey {
        &self.key
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn status(&self) -> RecordStatus {
        self.status.borrow().clone()
    }

    /// Move to `to` if the current state is one of `from`.  Returns whether
    /// this caller won the transition.
    pub fn try_begin(&self, from: &[MirrorState], to: MirrorState) -> bool {
        self.status.send_if_modified(|status| {
            if !from.contains(&status.state) {
                return false;
            }
            status.state = to;
            status.last_attempt_at = Some(Utc::now());
            true
        })
    }

    /// Record the outcome of a clone started with `try_begin(.., Cloning)`.
    pub fn finish_clone(&self, result: Result<(), String>) {
        self.status.send_modify(|status| match result {
            Ok(()) => {
                status.state = MirrorState::Ready;
                status.last_synced_at = Some(Utc::now());
                status.last_error = None;
            }
            Err(e) => {
                status.state = MirrorState::Failed;
                status.last_error = Some(e);
            }
        });
    }

    /// Mark a mirror found on disk as servable without claiming it is fresh.
    pub fn adopt(&self) {
        self.status.send_modify(|status| {
            status.state = MirrorState::Ready;
            status.last_synced_at = None;
            status.last_error = None;
        });
    }

    /// Record the outcome of an update.  The mirror stays servable either
    /// way.
    pub fn finish_update(&self, result: Result<(), String>) {
        self.status.send_modify(|status| {
            status.state = MirrorState::Ready;
            match result {
                Ok(()) => {
                    status.last_synced_at = Some(Utc::now());
                    status.last_error = None;
                }
                Err(e) => status.last_error = Some(e),
            }
        });
    }

    /// Wait until the record is no longer `Cloning` and return that status.
    pub async fn wait_settled(&self) -> RecordStatus {
        let mut rx = self.status.subscribe();
        let settled = rx
            .wait_for(|status| status.state != MirrorState::Cloning)
            .await
            .map(|status| status.clone());
        // The sender lives in `self`, so the channel cannot close under us.
        settled.unwrap_or_else(|_| self.status())
    }
}

// ---------------------------------------------------------------------------
// Sync guard
// ---------------------------------------------------------------------------

/// Releases a record's gate if a sync task ends without reporting a result
/// (panic or abort).
pub struct SyncGuard {
    record: Arc<MirrorRecord>,
    updating: bool,
    armed: bool,
}

impl SyncGuard {
    pub fn for_clone(record: Arc<MirrorRecord>) -> Self {
        Self {
            record,
            updating: false,
            armed: true,
        }
    }

    pub fn for_update(record: Arc<MirrorRecord>) -> Self {
        Self {
            record,
            updating: true,
            armed: true,
        }
    }

    pub fn record(&self) -> &Arc<MirrorRecord> {
        &self.record
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let msg = "sync task ended without completing".to_string();
        if self.updating {
            self.record.finish_update(Err(msg));
        } else {
            self.record.finish_clone(Err(msg));
        }
    }
}
