//! In-process [`VcsBackend`] for tests: counts operations, can be told to
//! fail or stall, and never touches the network.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::vcs::{FetchResult, ProtocolRequest, ServeError, VcsBackend};

#[derive(Default)]
pub struct FakeBackend {
    clones: AtomicUsize,
    fetches: AtomicUsize,
    fail_clones: AtomicBool,
    fail_fetches: AtomicBool,
    delay_ms: AtomicU64,
}

impl FakeBackend {
    pub fn clones(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fail_clones(&self, fail: bool) {
        self.fail_clones.store(fail, Ordering::SeqCst);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Make every clone and fetch take `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn stall(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait::async_trait]
impl VcsBackend for FakeBackend {
    async fn is_mirror(&self, path: &Path) -> bool {
        path.join("MIRROR").is_file()
    }

    async fn clone_mirror(&self, upstream: &str, dest: &Path) -> Result<()> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        if self.fail_clones.load(Ordering::SeqCst) {
            bail!("fake clone of {upstream} failed");
        }
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("MIRROR"), upstream)?;
        Ok(())
    }

    async fn fetch_mirror(&self, upstream: &str, _repo: &Path) -> Result<FetchResult> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        if self.fail_fetches.load(Ordering::SeqCst) {
            bail!("fake fetch of {upstream} failed");
        }
        Ok(FetchResult { updates: 1 })
    }

    async fn serve(&self, repo: &Path, request: ProtocolRequest) -> Result<Response, ServeError> {
        match request.subpath.as_str() {
            "/git-receive-pack" => Err(ServeError::ReadOnly("push".into())),
            "/broken" => Err(ServeError::Backend(anyhow::anyhow!("fake backend failure"))),
            "/bad" => Err(ServeError::BadRequest("bad".into())),
            subpath => {
                let upstream = std::fs::read_to_string(repo.join("MIRROR"))
                    .map_err(|e| ServeError::Backend(e.into()))?;
                Ok((StatusCode::OK, format!("{upstream} {subpath}")).into_response())
            }
        }
    }
}
