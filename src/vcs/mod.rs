//! VCS backends: clone, fetch and wire-protocol serving per [`VcsKind`].
//!
//! The set of kinds is closed.  Each kind has one [`VcsBackend`]
//! implementation, and the backends are handed to the store and the HTTP
//! dispatcher explicitly through [`Backends`] rather than looked up from a
//! global registry.

pub mod cgi;
pub mod git;
pub mod hg;
pub mod pktline;
pub mod process;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::http::{HeaderMap, Method};
use axum::response::Response;

pub use crate::config::VcsKind;
use crate::config::VcsConfig;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Summary of a refresh of an existing mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResult {
    /// Refs (git) or changesets (hg) that were added or moved.
    pub updates: usize,
}

/// An inbound VCS request, already routed to a mirror.
#[derive(Debug)]
pub struct ProtocolRequest {
    pub method: Method,
    /// Request path up to and including the repository, e.g.
    /// `/github.com/acme/widget.git`.
    pub repo_path: String,
    /// Path after the repository, e.g. `/info/refs`.
    pub subpath: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Body,
}

impl ProtocolRequest {
    /// First value of query parameter `name`, if present.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }
}

/// Why a mirror could not be served.
#[derive(Debug)]
pub enum ServeError {
    /// The client sent something the wire protocol does not allow.
    BadRequest(String),
    /// The client tried to write to a read-only mirror.
    ReadOnly(String),
    /// The VCS tooling failed.
    Backend(anyhow::Error),
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::ReadOnly(msg) => write!(f, "read-only: {msg}"),
            Self::Backend(err) => write!(f, "backend failure: {err:#}"),
        }
    }
}

impl From<anyhow::Error> for ServeError {
    fn from(err: anyhow::Error) -> Self {
        Self::Backend(err)
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Clone, fetch and serve capability for one VCS kind.
#[async_trait::async_trait]
pub trait VcsBackend: Send + Sync {
    /// Whether `path` holds a complete mirror of this kind.
    async fn is_mirror(&self, path: &Path) -> bool;

    /// Create a new mirror of `upstream` at `dest`, which must not exist.
    async fn clone_mirror(&self, upstream: &str, dest: &Path) -> Result<()>;

    /// Bring the mirror at `repo` up to date with `upstream`.
    async fn fetch_mirror(&self, upstream: &str, repo: &Path) -> Result<FetchResult>;

    /// Answer a wire-protocol request from the mirror at `repo`, streaming
    /// the response body.
    async fn serve(&self, repo: &Path, request: ProtocolRequest) -> Result<Response, ServeError>;
}

// ---------------------------------------------------------------------------
// Backend set
// ---------------------------------------------------------------------------

/// One backend per [`VcsKind`].
#[derive(Clone)]
pub struct Backends {
    git: Arc<dyn VcsBackend>,
    hg: Arc<dyn VcsBackend>,
}

impl Backends {
    pub fn new(git: Arc<dyn VcsBackend>, hg: Arc<dyn VcsBackend>) -> Self {
        Self { git, hg }
    }

    /// Backends that shell out to the system `git` / `hg` tooling.
    pub fn from_config(config: &VcsConfig) -> Self {
        Self {
            git: Arc::new(git::GitBackend::new(&config.git_binary)),
            hg: Arc::new(hg::HgBackend::new(&config.hg_binary, &config.hg_python)),
        }
    }

    pub fn get(&self, kind: VcsKind) -> &Arc<dyn VcsBackend> {
        match kind {
            VcsKind::Git => &self.git,
            VcsKind::Hg => &self.hg,
        }
    }
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_decodes() {
        let req = ProtocolRequest {
            method: Method::GET,
            repo_path: "/r".into(),
            subpath: "/info/refs".into(),
            query: Some("a=1&service=git-upload-pack&x=%2F".into()),
            headers: HeaderMap::new(),
            body: Body::empty(),
        };
        assert_eq!(req.query_param("service").as_deref(), Some("git-upload-pack"));
        assert_eq!(req.query_param("x").as_deref(), Some("/"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn serve_error_display_keeps_detail() {
        let err = ServeError::Backend(anyhow::anyhow!("boom"));
        assert!(err.to_string().contains("boom"));
    }
}
