//! Mercurial mirrors: `hg clone --noupdate`, `hg pull`, and the HTTP wire
//! protocol served by Mercurial's own hgweb application run as a CGI script.

use std::path::Path;

use anyhow::Result;
use axum::response::Response;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::cgi::CgiScript;
use super::process::run_checked;
use super::{FetchResult, ProtocolRequest, ServeError, VcsBackend};

/// Environment variable through which the hgweb wrapper receives the mirror
/// path.
const REPO_ENV: &str = "VCSMIRROR_HG_REPO";

/// hgweb bootstrap, run with `python -c`.  Pushes are refused before this
/// runs, and hgweb's default `allow-push` is empty as well.
const HGWEB_SCRIPT: &str = "\
import os
from mercurial import demandimport
demandimport.enable()
from mercurial.hgweb import hgweb, wsgicgi
wsgicgi.launch(hgweb(os.environb[b'VCSMIRROR_HG_REPO']))
";

/// Wire commands that write to the repository.
const WRITE_COMMANDS: &[&str] = &["unbundle", "pushkey"];

#[derive(Debug, Clone)]
pub struct HgBackend {
    binary: String,
    hgweb: CgiScript,
}

impl HgBackend {
    pub fn new(binary: &str, python: &str) -> Self {
        Self {
            binary: binary.to_string(),
            hgweb: CgiScript::new(python, &["-c", HGWEB_SCRIPT], &[("HGPLAIN", "1")]),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.env("HGPLAIN", "1");
        cmd
    }
}

#[async_trait::async_trait]
impl VcsBackend for HgBackend {
    async fn is_mirror(&self, path: &Path) -> bool {
        tokio::fs::metadata(path.join(".hg").join("requires"))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    #[instrument(skip(self), fields(%upstream, dest = %dest.display()))]
    async fn clone_mirror(&self, upstream: &str, dest: &Path) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("clone")
            .arg("--noupdate")
            .arg("--noninteractive")
            .arg("--")
            .arg(upstream)
            .arg(dest);

        run_checked(cmd, "hg clone").await?;
        debug!("hg clone succeeded");
        Ok(())
    }

    #[instrument(skip(self), fields(%upstream, repo = %repo.display()))]
    async fn fetch_mirror(&self, upstream: &str, repo: &Path) -> Result<FetchResult> {
        let mut cmd = self.command();
        cmd.arg("--repository")
            .arg(repo)
            .arg("pull")
            .arg("--noninteractive")
            .arg("--")
            .arg(upstream);

        let output = run_checked(cmd, "hg pull").await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let updates = count_added_changesets(&stdout);

        debug!(changesets_added = updates, "hg pull complete");
        Ok(FetchResult { updates })
    }

    async fn serve(&self, repo: &Path, request: ProtocolRequest) -> Result<Response, ServeError> {
        let command = request.query_param("cmd").ok_or_else(|| {
            ServeError::BadRequest("missing Mercurial wire command (?cmd=)".into())
        })?;
        if WRITE_COMMANDS.contains(&command.as_str()) {
            return Err(ServeError::ReadOnly(format!(
                "wire command {command:?} is not allowed on a mirror"
            )));
        }

        let repo = repo
            .to_str()
            .ok_or_else(|| ServeError::Backend(anyhow::anyhow!("mirror path is not UTF-8")))?;
        debug!(%command, "serving hg wire command");
        self.hgweb.clone().with_env(REPO_ENV, repo).run(request).await
    }
}

/// Sum the `added N changesets` counts in `hg pull` output.
fn count_added_changesets(stdout: &str) -> usize {
    stdout
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("added ")?;
            let (n, rest) = rest.split_once(' ')?;
            rest.starts_with("changeset").then(|| n.parse::<usize>().ok()).flatten()
        })
        .sum()
}
