//! Git mirrors: `git clone --mirror`, `git fetch`, and the smart-HTTP
//! upload-pack service.
//!
//! Only the fetch side of the protocol is served.  Push attempts
//! (`git-receive-pack`) are refused, and the "dumb" HTTP protocol is not
//! offered.

use std::io::Read;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use flate2::read::GzDecoder;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::pktline;
use super::process::{run_checked, stream_output, write_stdin};
use super::{FetchResult, ProtocolRequest, ServeError, VcsBackend};

/// Upper bound on an (uncompressed) upload-pack request body.
const MAX_REQUEST_BYTES: usize = 64 * 1024 * 1024;

const UPLOAD_PACK: &str = "git-upload-pack";
const RECEIVE_PACK: &str = "git-receive-pack";

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GitBackend {
    binary: String,
}

impl GitBackend {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }

    async fn advertise_refs(&self, repo: &Path, headers: &HeaderMap) -> Result<Response, ServeError> {
        let protocol = git_protocol(headers);
        let v2 = protocol.as_deref().is_some_and(|p| p.contains("version=2"));

        let mut cmd = self.command();
        cmd.arg("upload-pack")
            .arg("--stateless-rpc")
            .arg("--advertise-refs")
            .arg(repo);
        if let Some(protocol) = &protocol {
            cmd.env("GIT_PROTOCOL", protocol);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().context("failed to spawn git upload-pack")?;
        let stdout = child
            .stdout
            .take()
            .context("failed to capture git upload-pack stdout")?;

        // Protocol v2 clients expect the capability advertisement directly.
        let head = if v2 {
            Bytes::new()
        } else {
            Bytes::from(pktline::service_announcement(UPLOAD_PACK))
        };
        let body = stream_output(child, head, stdout, "git upload-pack --advertise-refs");

        let mut response = (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/x-git-upload-pack-advertisement",
            )],
            body,
        )
            .into_response();
        no_cache(response.headers_mut());
        Ok(response)
    }

    async fn upload_pack(&self, repo: &Path, request: ProtocolRequest) -> Result<Response, ServeError> {
        let content_type = request
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if content_type != "application/x-git-upload-pack-request" {
            return Err(ServeError::BadRequest(format!(
                "unexpected content type {content_type:?}"
            )));
        }
        let gzipped = request
            .headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip"));
        let protocol = git_protocol(&request.headers);

        let raw = axum::body::to_bytes(request.body, MAX_REQUEST_BYTES)
            .await
            .map_err(|e| ServeError::BadRequest(format!("failed to read request body: {e}")))?;
        let input = if gzipped {
            Bytes::from(gunzip(&raw).map_err(ServeError::BadRequest)?)
        } else {
            raw
        };
        pktline::validate_request(&input)
            .map_err(|e| ServeError::BadRequest(format!("malformed upload-pack request: {e}")))?;

        let mut cmd = self.command();
        cmd.arg("upload-pack").arg("--stateless-rpc").arg(repo);
        if let Some(protocol) = &protocol {
            cmd.env("GIT_PROTOCOL", protocol);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().context("failed to spawn git upload-pack")?;
        let stdin = child
            .stdin
            .take()
            .context("failed to capture git upload-pack stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("failed to capture git upload-pack stdout")?;

        write_stdin(stdin, input, "git upload-pack");
        let body = stream_output(child, Bytes::new(), stdout, "git upload-pack");

        let mut response = (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/x-git-upload-pack-result")],
            body,
        )
            .into_response();
        no_cache(response.headers_mut());
        Ok(response)
    }
}

#[async_trait::async_trait]
impl VcsBackend for GitBackend {
    async fn is_mirror(&self, path: &Path) -> bool {
        is_bare_repo(path).await
    }

    #[instrument(skip(self), fields(%upstream, dest = %dest.display()))]
    async fn clone_mirror(&self, upstream: &str, dest: &Path) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("clone")
            .arg("--mirror")
            .arg("--quiet")
            .arg("--")
            .arg(upstream)
            .arg(dest);

        run_checked(cmd, "git clone --mirror").await?;
        debug!("git clone --mirror succeeded");
        Ok(())
    }

    #[instrument(skip(self), fields(%upstream, repo = %repo.display()))]
    async fn fetch_mirror(&self, upstream: &str, repo: &Path) -> Result<FetchResult> {
        let mut cmd = self.command();
        cmd.arg("-C")
            .arg(repo)
            .arg("fetch")
            .arg("--prune")
            .arg("--force")
            .arg("--")
            .arg(upstream)
            .arg("+refs/*:refs/*");

        let output = run_checked(cmd, "git fetch").await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        let updates = count_updated_refs(&stderr);

        debug!(refs_updated = updates, "git fetch complete");
        Ok(FetchResult { updates })
    }

    async fn serve(&self, repo: &Path, request: ProtocolRequest) -> Result<Response, ServeError> {
        match request.subpath.as_str() {
            "/info/refs" => {
                if request.method != Method::GET && request.method != Method::HEAD {
                    return Err(ServeError::BadRequest(format!(
                        "method {} not allowed on info/refs",
                        request.method
                    )));
                }
                match request.query_param("service").as_deref() {
                    Some(UPLOAD_PACK) => self.advertise_refs(repo, &request.headers).await,
                    Some(RECEIVE_PACK) => Err(ServeError::ReadOnly(
                        "pushing to a mirror is not allowed".into(),
                    )),
                    Some(other) => Err(ServeError::BadRequest(format!(
                        "unsupported service {other:?}"
                    ))),
                    None => Err(ServeError::BadRequest(
                        "dumb HTTP protocol is not supported".into(),
                    )),
                }
            }
            "/git-upload-pack" => {
                if request.method != Method::POST {
                    return Err(ServeError::BadRequest(format!(
                        "method {} not allowed on git-upload-pack",
                        request.method
                    )));
                }
                self.upload_pack(repo, request).await
            }
            "/git-receive-pack" => Err(ServeError::ReadOnly(
                "pushing to a mirror is not allowed".into(),
            )),
            other => Err(ServeError::BadRequest(format!(
                "unsupported git request path {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Whether `path` looks like a bare repository: a directory with a `HEAD`
/// file plus `objects` and `refs` directories.
pub async fn is_bare_repo(path: &Path) -> bool {
    let is_dir = |p: std::path::PathBuf| async move {
        tokio::fs::metadata(p).await.map(|m| m.is_dir()).unwrap_or(false)
    };

    let head_exists = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !head_exists {
        debug!(path = %path.display(), "HEAD file not found; not a bare repo");
        return false;
    }

    is_dir(path.join("objects")).await && is_dir(path.join("refs")).await
}

/// The `Git-Protocol` request header, if it is safe to forward to git.
fn git_protocol(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("git-protocol")?.to_str().ok()?;
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '=' | ':' | '.' | '-' | '_'));
    safe.then(|| value.to_string())
}

fn no_cache(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::EXPIRES,
        HeaderValue::from_static("Fri, 01 Jan 1980 00:00:00 GMT"),
    );
}

/// Decompress a gzip request body, refusing to inflate past
/// [`MAX_REQUEST_BYTES`].
fn gunzip(data: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(MAX_REQUEST_BYTES as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| format!("invalid gzip request body: {e}"))?;
    if out.len() > MAX_REQUEST_BYTES {
        return Err("decompressed request body too large".into());
    }
    Ok(out)
}

/// Count the number of ref-update lines in `git fetch` stderr.
///
/// Lines matching patterns like ` -> ` or `[new branch]` are counted.
fn count_updated_refs(stderr: &str) -> usize {
    stderr
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed.contains("->") && !trimmed.starts_with("From")
        })
        .count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use axum::body::Body;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;

    fn request(method: Method, subpath: &str, query: Option<&str>) -> ProtocolRequest {
        ProtocolRequest {
            method,
            repo_path: "/github.com/acme/widget.git".into(),
            subpath: subpath.into(),
            query: query.map(str::to_string),
            headers: HeaderMap::new(),
            body: Body::empty(),
        }
    }

    async fn serve_err(req: ProtocolRequest) -> ServeError {
        let backend = GitBackend::new("git");
        backend
            .serve(Path::new("/nonexistent/mirror"), req)
            .await
            .unwrap_err()
    }

    #[test]
    fn count_updated_refs_basic() {
        let stderr = "\
From https://github.com/acme/widget
   abc1234..def5678  main       -> main
 * [new branch]      feature-x  -> feature-x
";
        assert_eq!(count_updated_refs(stderr), 2);
        assert_eq!(count_updated_refs(""), 0);
    }

    #[tokio::test]
    async fn receive_pack_is_read_only() {
        let err = serve_err(request(Method::GET, "/info/refs", Some("service=git-receive-pack"))).await;
        assert!(matches!(err, ServeError::ReadOnly(_)));

        let err = serve_err(request(Method::POST, "/git-receive-pack", None)).await;
        assert!(matches!(err, ServeError::ReadOnly(_)));
    }

    #[tokio::test]
    async fn dumb_protocol_and_unknown_paths_are_bad_requests() {
        let err = serve_err(request(Method::GET, "/info/refs", None)).await;
        assert!(matches!(err, ServeError::BadRequest(_)));

        let err = serve_err(request(Method::GET, "/objects/info/packs", None)).await;
        assert!(matches!(err, ServeError::BadRequest(_)));

        let err = serve_err(request(Method::GET, "/git-upload-pack", None)).await;
        assert!(matches!(err, ServeError::BadRequest(_)));
    }

    #[tokio::test]
    async fn upload_pack_rejects_wrong_content_type() {
        let mut req = request(Method::POST, "/git-upload-pack", None);
        req.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        req.body = Body::from("0000");
        assert!(matches!(serve_err(req).await, ServeError::BadRequest(_)));
    }

    #[tokio::test]
    async fn upload_pack_rejects_malformed_pkt_lines() {
        let mut req = request(Method::POST, "/git-upload-pack", None);
        req.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-git-upload-pack-request"),
        );
        req.body = Body::from("this is not a packet stream");
        match serve_err(req).await {
            ServeError::BadRequest(msg) => assert!(msg.contains("malformed"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn gunzip_round_trips_and_rejects_garbage() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"0009done\n0000").unwrap();
        let compressed = enc.finish().unwrap();
        assert_eq!(gunzip(&compressed).unwrap(), b"0009done\n0000");
        assert!(gunzip(b"not gzip").is_err());
    }

    #[test]
    fn git_protocol_header_is_sanitised() {
        let mut headers = HeaderMap::new();
        assert_eq!(git_protocol(&headers), None);
        headers.insert("git-protocol", HeaderValue::from_static("version=2"));
        assert_eq!(git_protocol(&headers).as_deref(), Some("version=2"));
        headers.insert("git-protocol", HeaderValue::from_static("version=2; rm -rf"));
        assert_eq!(git_protocol(&headers), None);
    }

    #[tokio::test]
    async fn is_bare_repo_requires_layout() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_bare_repo(dir.path()).await);
        std::fs::write(dir.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::create_dir(dir.path().join("objects")).unwrap();
        std::fs::create_dir(dir.path().join("refs")).unwrap();
        assert!(is_bare_repo(dir.path()).await);
    }

    // -- against a real git binary --

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .current_dir(dir)
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(args)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    /// A bare `upstream.git` with one commit on `main`, plus the work tree
    /// used to push further commits.
    fn upstream_repo(root: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let upstream = root.join("upstream.git");
        let work = root.join("work");
        git(root, &["init", "--quiet", "--bare", "--initial-branch=main", "upstream.git"]);
        git(root, &["init", "--quiet", "--initial-branch=main", "work"]);
        std::fs::write(work.join("a.txt"), "one\n").unwrap();
        git(&work, &["add", "a.txt"]);
        git(&work, &["commit", "--quiet", "-m", "first"]);
        git(&work, &["push", "--quiet", upstream.to_str().unwrap(), "main"]);
        (upstream, work)
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn mirror_of_real_repo_advertises_refs() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, _work) = upstream_repo(dir.path());
        let mirror = dir.path().join("mirror.git");
        let backend = GitBackend::new("git");

        backend
            .clone_mirror(&format!("file://{}", upstream.display()), &mirror)
            .await
            .unwrap();
        assert!(backend.is_mirror(&mirror).await);

        let req = request(Method::GET, "/info/refs", Some("service=git-upload-pack"));
        let response = backend.serve(&mirror, req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-git-upload-pack-advertisement"
        );
        let body = body_bytes(response).await;
        assert!(
            body.starts_with(b"001e# service=git-upload-pack\n0000"),
            "{body:?}"
        );
        assert!(body.windows(15).any(|w| w == b"refs/heads/main"), "{body:?}");
        assert!(body.ends_with(b"0000"), "{body:?}");
    }

    #[tokio::test]
    async fn protocol_v2_advertisement_has_no_announcement() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, _work) = upstream_repo(dir.path());
        let mirror = dir.path().join("mirror.git");
        let backend = GitBackend::new("git");
        backend
            .clone_mirror(&format!("file://{}", upstream.display()), &mirror)
            .await
            .unwrap();

        let mut req = request(Method::GET, "/info/refs", Some("service=git-upload-pack"));
        req.headers
            .insert("git-protocol", HeaderValue::from_static("version=2"));
        let response = backend.serve(&mirror, req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_bytes(response).await;
        assert!(!body.starts_with(b"001e# service="), "{body:?}");
        assert!(body.starts_with(b"000eversion 2\n"), "{body:?}");

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"0014command=ls-refs\n00010000").unwrap();
        let mut req = request(Method::POST, "/git-upload-pack", None);
        req.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-git-upload-pack-request"),
        );
        req.headers
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        req.headers
            .insert("git-protocol", HeaderValue::from_static("version=2"));
        req.body = Body::from(enc.finish().unwrap());
        let response = backend.serve(&mirror, req).await.unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-git-upload-pack-result"
        );
        let body = body_bytes(response).await;
        assert!(body.windows(15).any(|w| w == b"refs/heads/main"), "{body:?}");
    }

    #[tokio::test]
    async fn fetch_picks_up_new_commits() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, work) = upstream_repo(dir.path());
        let url = format!("file://{}", upstream.display());
        let mirror = dir.path().join("mirror.git");
        let backend = GitBackend::new("git");
        backend.clone_mirror(&url, &mirror).await.unwrap();

        assert_eq!(backend.fetch_mirror(&url, &mirror).await.unwrap().updates, 0);

        std::fs::write(work.join("a.txt"), "two\n").unwrap();
        git(&work, &["commit", "--quiet", "-am", "second"]);
        git(&work, &["push", "--quiet", upstream.to_str().unwrap(), "main"]);

        let result = backend.fetch_mirror(&url, &mirror).await.unwrap();
        assert!(result.updates >= 1, "{result:?}");

        let upstream_head = std::process::Command::new("git")
            .arg("-C")
            .arg(&upstream)
            .args(["rev-parse", "refs/heads/main"])
            .output()
            .unwrap();
        let mirror_head = std::process::Command::new("git")
            .arg("-C")
            .arg(&mirror)
            .args(["rev-parse", "refs/heads/main"])
            .output()
            .unwrap();
        assert_eq!(upstream_head.stdout, mirror_head.stdout);
    }
}
