//! Child-process plumbing shared by the VCS backends.
//!
//! Two shapes of subprocess are used: one-shot commands whose output is
//! collected (clone, fetch), and serving commands whose stdout is streamed
//! straight into an HTTP response body.  For the latter the child is reaped
//! in a background task, and killed if the response body is dropped before
//! the child finished writing (client went away).

use std::io;
use std::pin::Pin;
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{bail, Context, Result};
use axum::body::Body;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// One-shot commands
// ---------------------------------------------------------------------------

/// Run `cmd` to completion, failing with its trimmed stderr on a non-zero
/// exit.  `what` names the operation in error messages.
///
/// The child is killed if the returned future is dropped, so callers can
/// bound the run with [`tokio::time::timeout`].
pub async fn run_checked(mut cmd: Command, what: &str) -> Result<Output> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    debug!("spawning {what}");

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn {what}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{what} failed (status {}): {}", output.status, stderr.trim());
    }

    Ok(output)
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Feed `input` to the child's stdin from a separate task, so that a child
/// which starts writing before it has read all of its input cannot deadlock
/// against us.
pub fn write_stdin(mut stdin: ChildStdin, input: Bytes, what: &'static str) {
    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(&input).await {
            // The child may legitimately exit before consuming everything.
            debug!(error = %e, "{what}: failed to write stdin");
        }
        let _ = stdin.shutdown().await;
    });
}

/// Stdout reader that records whether it was read to EOF and signals when it
/// is dropped.
struct ChildOutput<R> {
    inner: ReaderStream<R>,
    eof: Arc<AtomicBool>,
    _dropped: oneshot::Sender<()>,
}

impl<R: AsyncRead + Unpin> Stream for ChildOutput<R> {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let poll = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(None) = poll {
            self.eof.store(true, Ordering::Release);
        }
        poll
    }
}

/// Build a response body from `head` followed by everything the child writes
/// to `stdout`.
///
/// The child's stderr (if piped) is collected and logged once it exits.
pub fn stream_output<R>(mut child: Child, head: Bytes, stdout: R, what: &'static str) -> Body
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let eof = Arc::new(AtomicBool::new(false));
    let (dropped_tx, dropped_rx) = oneshot::channel::<()>();

    let output = ChildOutput {
        inner: ReaderStream::new(stdout),
        eof: eof.clone(),
        _dropped: dropped_tx,
    };

    let mut stderr = child.stderr.take();
    tokio::spawn(async move {
        let collect_stderr = async {
            let mut buf = Vec::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            buf
        };

        let wait = async {
            tokio::select! {
                status = child.wait() => status,
                _ = dropped_rx => {
                    if !eof.load(Ordering::Acquire) {
                        debug!("{what}: response body dropped early; killing child");
                        let _ = child.start_kill();
                    }
                    child.wait().await
                }
            }
        };

        let (status, stderr) = tokio::join!(wait, collect_stderr);
        match status {
            Ok(status) if status.success() => debug!("{what} completed"),
            Ok(status) if !eof.load(Ordering::Acquire) => {
                debug!(%status, "{what} terminated before completing");
            }
            Ok(status) => warn!(
                %status,
                stderr = %String::from_utf8_lossy(&stderr).trim(),
                "{what} exited with non-zero status"
            ),
            Err(e) => warn!(error = %e, "failed to wait for {what}"),
        }
    });

    let head = (!head.is_empty()).then_some(Ok::<_, io::Error>(head));
    Body::from_stream(futures::stream::iter(head).chain(output))
}
