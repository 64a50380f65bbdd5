//! Minimal CGI/1.1 runner.
//!
//! Spawns a CGI program per request, feeds it the request body, parses the
//! header block it prints and streams the remainder of its stdout back as
//! the response body.

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::process::{stream_output, write_stdin};
use super::{ProtocolRequest, ServeError};

/// Upper bound on a buffered CGI request body.
const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound on the CGI response header block.
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// A CGI program and the fixed environment it runs with.
#[derive(Debug, Clone)]
pub struct CgiScript {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CgiScript {
    pub fn new(program: &str, args: &[&str], env: &[(&str, &str)]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Add one more fixed environment variable.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Run the script for one request.
    pub async fn run(&self, request: ProtocolRequest) -> Result<Response, ServeError> {
        let body = axum::body::to_bytes(request.body, MAX_REQUEST_BYTES)
            .await
            .map_err(|e| ServeError::BadRequest(format!("failed to read request body: {e}")))?;

        let env = request_env(
            request.method.as_str(),
            &request.repo_path,
            &request.subpath,
            request.query.as_deref().unwrap_or(""),
            &request.headers,
            body.len(),
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        let fixed = self.env.iter().map(|(k, v)| (k, v));
        for (k, v) in fixed.chain(&env) {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn CGI program {}", self.program))?;
        let stdin = child
            .stdin
            .take()
            .context("failed to capture CGI stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("failed to capture CGI stdout")?;

        write_stdin(stdin, body, "CGI program");

        let mut reader = BufReader::new(stdout);
        let (status, headers) = read_headers(&mut reader).await?;
        debug!(%status, program = %self.program, "CGI headers parsed");

        let mut response = Response::new(stream_output(child, Bytes::new(), reader, "CGI program"));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// The per-request CGI meta-variables.
fn request_env(
    method: &str,
    script_name: &str,
    path_info: &str,
    query: &str,
    headers: &HeaderMap,
    content_length: usize,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
    env.insert("SERVER_PROTOCOL".into(), "HTTP/1.1".into());
    env.insert("SERVER_SOFTWARE".into(), concat!("vcsmirror/", env!("CARGO_PKG_VERSION")).into());
    env.insert("REQUEST_METHOD".into(), method.into());
    env.insert("SCRIPT_NAME".into(), script_name.into());
    env.insert("PATH_INFO".into(), path_info.into());
    env.insert("QUERY_STRING".into(), query.into());
    env.insert("CONTENT_LENGTH".into(), content_length.to_string());

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let (name, port) = match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            (name, port)
        }
        _ => (host, "80"),
    };
    env.insert("SERVER_NAME".into(), name.into());
    env.insert("SERVER_PORT".into(), port.into());

    for (key, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        if key == header::CONTENT_TYPE {
            env.insert("CONTENT_TYPE".into(), value.into());
            continue;
        }
        // httpoxy: never let a request header become HTTP_PROXY.
        if key == header::CONTENT_LENGTH || key.as_str() == "proxy" {
            continue;
        }
        let name = format!("HTTP_{}", key.as_str().to_ascii_uppercase().replace('-', "_"));
        env.entry(name)
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    env
}

/// Parse the CGI response header block, leaving `reader` positioned at the
/// start of the body.
async fn read_headers<R>(reader: &mut R) -> Result<(StatusCode, HeaderMap)>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();
    let mut status = None;
    let mut consumed = 0;

    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .context("failed to read CGI response headers")?;
        if n == 0 {
            bail!("CGI program exited before completing its response headers");
        }
        consumed += n;
        if consumed > MAX_HEADER_BYTES {
            bail!("CGI response headers exceed {MAX_HEADER_BYTES} bytes");
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        let (name, value) = line
            .split_once(':')
            .with_context(|| format!("malformed CGI header line {line:?}"))?;
        let value = value.trim();

        if name.eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next().unwrap_or("");
            let code: u16 = code
                .parse()
                .with_context(|| format!("malformed CGI status {value:?}"))?;
            status = Some(StatusCode::from_u16(code).context("invalid CGI status code")?);
            continue;
        }

        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .with_context(|| format!("invalid CGI header name {name:?}"))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid CGI header value for {name}"))?;
        headers.append(name, value);
    }

    let status = match status {
        Some(s) => s,
        None if headers.contains_key(header::LOCATION) => StatusCode::FOUND,
        None => StatusCode::OK,
    };
    Ok((status, headers))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Method;

    use super::*;

    #[tokio::test]
    async fn parses_status_and_headers() {
        let mut input: &[u8] =
            b"Status: 404 Not Found\r\nContent-Type: text/plain\r\nX-A: 1\r\nX-A: 2\r\n\r\nbody";
        let (status, headers) = read_headers(&mut input).await.unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers.get_all("x-a").iter().count(), 2);
        assert_eq!(input, b"body");
    }

    #[tokio::test]
    async fn defaults_status() {
        let mut input: &[u8] = b"Content-Type: application/mercurial-0.1\n\n";
        let (status, _) = read_headers(&mut input).await.unwrap();
        assert_eq!(status, StatusCode::OK);

        let mut input: &[u8] = b"Location: /elsewhere\n\n";
        let (status, _) = read_headers(&mut input).await.unwrap();
        assert_eq!(status, StatusCode::FOUND);
    }

    #[tokio::test]
    async fn rejects_truncated_or_malformed_headers() {
        let mut input: &[u8] = b"Content-Type: text/plain\r\n";
        assert!(read_headers(&mut input).await.is_err());

        let mut input: &[u8] = b"no colon here\r\n\r\n";
        assert!(read_headers(&mut input).await.is_err());
    }

    #[test]
    fn request_env_maps_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("mirror.local:8080"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/x-www-form-urlencoded"));
        headers.insert("x-hgarg-1", HeaderValue::from_static("cmds=heads"));
        headers.insert("proxy", HeaderValue::from_static("http://evil"));

        let env = request_env("GET", "/hg/repo", "/", "cmd=batch", &headers, 0);
        assert_eq!(env["REQUEST_METHOD"], "GET");
        assert_eq!(env["SCRIPT_NAME"], "/hg/repo");
        assert_eq!(env["QUERY_STRING"], "cmd=batch");
        assert_eq!(env["SERVER_NAME"], "mirror.local");
        assert_eq!(env["SERVER_PORT"], "8080");
        assert_eq!(env["CONTENT_TYPE"], "application/x-www-form-urlencoded");
        assert_eq!(env["HTTP_X_HGARG_1"], "cmds=heads");
        assert!(!env.contains_key("HTTP_PROXY"));
    }

    #[tokio::test]
    async fn runs_script_and_streams_body() {
        let script = CgiScript::new(
            "sh",
            &["-c", "printf 'Status: 201 Created\\r\\nX-Method: %s\\r\\n\\r\\n' \"$REQUEST_METHOD\"; cat"],
            &[],
        );
        let request = ProtocolRequest {
            method: Method::POST,
            repo_path: "/hg/repo".into(),
            subpath: "/".into(),
            query: None,
            headers: HeaderMap::new(),
            body: Body::from("payload"),
        };
        let response = script.run(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-method"], "POST");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"payload");
    }

    #[tokio::test]
    async fn fixed_env_reaches_script_alongside_request_env() {
        let script = CgiScript::new(
            "sh",
            &["-c", "printf '\\r\\n%s %s %s' \"$FIXED\" \"$EXTRA\" \"$QUERY_STRING\""],
            &[("FIXED", "one")],
        )
        .with_env("EXTRA", "two");
        let request = ProtocolRequest {
            method: Method::GET,
            repo_path: "/hg/repo".into(),
            subpath: "".into(),
            query: Some("cmd=capabilities".into()),
            headers: HeaderMap::new(),
            body: Body::empty(),
        };
        let response = script.run(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"one two cmd=capabilities");
    }
}
