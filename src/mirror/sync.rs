//! Clone and update execution against the VCS backends.
//!
//! Clones land in a scratch directory under `<root>/.staging` and are renamed
//! into place only once the backend reports success and the result looks
//! like a mirror, so an interrupted clone never appears at a mirror path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::sync::Semaphore;
use tracing::{info, instrument};

use super::layout;
use super::record::MirrorKey;
use crate::config::SyncConfig;
use crate::metrics::{MetricsRegistry, SyncDurationLabels, SyncLabels, SyncOperation, SyncOutcome};
use crate::vcs::{Backends, FetchResult};

/// What a cold sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneOutcome {
    Cloned,
    /// A valid mirror was already on disk and was taken over as-is.
    Adopted,
}

pub struct SyncEngine {
    root: PathBuf,
    backends: Backends,
    clone_permits: Arc<Semaphore>,
    fetch_permits: Arc<Semaphore>,
    clone_timeout: Duration,
    fetch_timeout: Duration,
    metrics: MetricsRegistry,
}

impl SyncEngine {
    pub fn new(root: PathBuf, backends: Backends, config: &SyncConfig, metrics: MetricsRegistry) -> Self {
        Self {
            root,
            backends,
            clone_permits: Arc::new(Semaphore::new(config.max_concurrent_clones)),
            fetch_permits: Arc::new(Semaphore::new(config.max_concurrent_fetches)),
            clone_timeout: config.clone_timeout(),
            fetch_timeout: config.fetch_timeout(),
            metrics,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Create the storage root and clear out staging leftovers from a
    /// previous run.
    pub async fn prepare_storage(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create storage root {}", self.root.display()))?;

        let staging = layout::staging_dir(&self.root);
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => info!(path = %staging.display(), "purged stale staging directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to purge {}", staging.display()))
            }
        }
        tokio::fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("failed to create {}", staging.display()))?;
        Ok(())
    }

    /// Produce a mirror of `key` at `dest`, adopting one already on disk.
    #[instrument(skip(self), fields(upstream = %key.upstream, vcs = %key.kind))]
    pub async fn clone_mirror(&self, key: &MirrorKey, dest: &Path) -> Result<CloneOutcome> {
        let backend = self.backends.get(key.kind);
        if backend.is_mirror(dest).await {
            info!(path = %dest.display(), "adopting existing mirror");
            return Ok(CloneOutcome::Adopted);
        }

        let _permit = self
            .clone_permits
            .acquire()
            .await
            .context("clone semaphore closed")?;

        let staging = layout::staging_dir(&self.root);
        tokio::fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("failed to create {}", staging.display()))?;
        let scratch = tempfile::Builder::new()
            .prefix("clone-")
            .tempdir_in(&staging)
            .context("failed to create staging directory")?;
        let target = scratch.path().join("mirror");

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.clone_timeout,
            backend.clone_mirror(&key.upstream, &target),
        )
        .await;
        self.observe(key, SyncOperation::Clone, started, &result);

        match result {
            Err(_) => bail!("clone timed out after {}s", self.clone_timeout.as_secs()),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }
        if !backend.is_mirror(&target).await {
            bail!("clone of {} did not produce a valid mirror", key.upstream);
        }

        if tokio::fs::try_exists(dest).await.unwrap_or(false) {
            // Not a valid mirror (checked above); replace it.
            tokio::fs::remove_dir_all(dest)
                .await
                .with_context(|| format!("failed to remove invalid mirror at {}", dest.display()))?;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::rename(&target, dest)
            .await
            .with_context(|| format!("failed to move clone into {}", dest.display()))?;

        info!(
            path = %dest.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "mirror cloned"
        );
        Ok(CloneOutcome::Cloned)
    }

    /// Refresh the existing mirror at `repo` from upstream.
    #[instrument(skip(self), fields(upstream = %key.upstream, vcs = %key.kind))]
    pub async fn update_mirror(&self, key: &MirrorKey, repo: &Path) -> Result<FetchResult> {
        let backend = self.backends.get(key.kind);
        let _permit = self
            .fetch_permits
            .acquire()
            .await
            .context("fetch semaphore closed")?;

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.fetch_timeout,
            backend.fetch_mirror(&key.upstream, repo),
        )
        .await;
        self.observe(key, SyncOperation::Update, started, &result);

        let fetched = match result {
            Err(_) => bail!("update timed out after {}s", self.fetch_timeout.as_secs()),
            Ok(r) => r?,
        };
        info!(
            updates = fetched.updates,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "mirror updated"
        );
        Ok(fetched)
    }

    fn observe<T, E>(
        &self,
        key: &MirrorKey,
        operation: SyncOperation,
        started: Instant,
        result: &Result<Result<T, anyhow::Error>, E>,
    ) {
        let outcome = match result {
            Ok(Ok(_)) => SyncOutcome::Success,
            Ok(Err(_)) => SyncOutcome::Failure,
            Err(_) => SyncOutcome::Timeout,
        };
        let metrics = &self.metrics.metrics;
        metrics
            .sync_total
            .get_or_create(&SyncLabels {
                vcs: key.kind.into(),
                operation: operation.clone(),
                outcome,
            })
            .inc();
        metrics
            .sync_duration_seconds
            .get_or_create(&SyncDurationLabels {
                vcs: key.kind.into(),
                operation,
            })
            .observe(started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::testing::FakeBackend;

    fn engine(root: &Path, fake: Arc<FakeBackend>, config: SyncConfig) -> SyncEngine {
        SyncEngine::new(
            root.to_path_buf(),
            Backends::new(fake.clone(), fake),
            &config,
            MetricsRegistry::new(),
        )
    }

    fn key() -> MirrorKey {
        MirrorKey::new(crate::config::VcsKind::Git, "git://github.com/acme/widget")
    }

    #[tokio::test]
    async fn clone_moves_result_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeBackend::default());
        let engine = engine(dir.path(), fake.clone(), SyncConfig::default());
        engine.prepare_storage().await.unwrap();

        let dest = layout::mirror_path(dir.path(), &key());
        let outcome = engine.clone_mirror(&key(), &dest).await.unwrap();
        assert_eq!(outcome, CloneOutcome::Cloned);
        assert!(dest.join("MIRROR").is_file());
        assert_eq!(fake.clones(), 1);

        // Nothing left behind in staging.
        let leftovers = std::fs::read_dir(layout::staging_dir(dir.path()))
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn existing_mirror_is_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeBackend::default());
        let engine = engine(dir.path(), fake.clone(), SyncConfig::default());

        let dest = layout::mirror_path(dir.path(), &key());
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("MIRROR"), "").unwrap();

        let outcome = engine.clone_mirror(&key(), &dest).await.unwrap();
        assert_eq!(outcome, CloneOutcome::Adopted);
        assert_eq!(fake.clones(), 0);
    }

    #[tokio::test]
    async fn failed_clone_leaves_nothing_at_dest() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeBackend::default());
        fake.fail_clones(true);
        let engine = engine(dir.path(), fake.clone(), SyncConfig::default());

        let dest = layout::mirror_path(dir.path(), &key());
        assert!(engine.clone_mirror(&key(), &dest).await.is_err());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn clone_timeout_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeBackend::default());
        fake.set_delay(Duration::from_secs(5));
        let config = SyncConfig {
            clone_timeout: 1,
            ..SyncConfig::default()
        };
        let engine = engine(dir.path(), fake, config);

        let dest = layout::mirror_path(dir.path(), &key());
        let err = engine.clone_mirror(&key(), &dest).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn prepare_storage_purges_staging() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeBackend::default());
        let engine = engine(dir.path(), fake, SyncConfig::default());

        let stale = layout::staging_dir(dir.path()).join("clone-old");
        std::fs::create_dir_all(&stale).unwrap();
        engine.prepare_storage().await.unwrap();
        assert!(!stale.exists());
        assert!(layout::staging_dir(dir.path()).is_dir());
    }
}
