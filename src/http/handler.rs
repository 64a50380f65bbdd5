//! Main axum router and the VCS request dispatcher.
//!
//! Routes:
//! - `GET /healthz`  - Health check
//! - `GET /metrics`  - Prometheus metrics
//! - `GET /_mirrors` - JSON listing of every known mirror
//! - anything else   - matched against the configured mappings and served
//!   from the corresponding mirror
//!
//! The fixed routes take precedence over mappings.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::{GaugeGuard, MetricsRegistry, RequestLabels};
use crate::mirror::{MirrorKey, MirrorListing, SyncFailed};
use crate::routing;
use crate::vcs::{ProtocolRequest, ServeError};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .route("/_mirrors", get(handle_mirrors))
        .fallback(handle_vcs)
        .layer(middleware::from_fn_with_state(state.clone(), access_log))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Route a VCS request to its mirror, syncing the mirror first if there is
/// no servable copy yet.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn handle_vcs(State(state): State<Arc<AppState>>, request: Request) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let route = state
        .routes
        .match_request(host.as_deref(), &path)
        .ok_or(AppError::NotFound)?;
    route.check_captures().map_err(AppError::BadRequest)?;

    let kind = route.mapping.kind();
    let upstream = routing::resolve(route.mapping, &route.captures).map_err(AppError::InvalidRoute)?;
    let repo_path = path[..path.len() - route.subpath.len()].to_string();
    debug!(%upstream, %repo_path, subpath = %route.subpath, "route matched");

    let mirror = state
        .store
        .ensure(MirrorKey::new(kind, upstream))
        .await
        .map_err(AppError::SyncFailed)?;

    let request = ProtocolRequest {
        method: parts.method,
        repo_path,
        subpath: route.subpath,
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    };
    let response = state
        .backends
        .get(kind)
        .serve(&mirror.local_path, request)
        .await?;

    Ok(track_stream(response, &state.metrics))
}

/// `GET /_mirrors`
async fn handle_mirrors(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rows: Vec<MirrorListing> = state.store.snapshot().iter().map(MirrorListing::from).collect();
    Json(rows)
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the gateway.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Count the response as an active stream until its body is dropped.
fn track_stream(response: Response, metrics: &MetricsRegistry) -> Response {
    let guard = GaugeGuard::new(&metrics.metrics.active_streams);
    response.map(|body| {
        Body::from_stream(body.into_data_stream().map(move |chunk| {
            let _ = &guard;
            chunk
        }))
    })
}

/// One log line and one counter increment per request.
async fn access_log(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    state
        .metrics
        .metrics
        .requests_total
        .get_or_create(&RequestLabels {
            status: status.as_u16().to_string(),
        })
        .inc();
    info!(
        %method,
        %path,
        status = status.as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
///
/// Clients get a generic message; the detail is logged.
#[derive(Debug)]
pub enum AppError {
    /// No mapping matches the request.
    NotFound,
    /// The request is malformed for its VCS protocol.
    BadRequest(String),
    /// A write (push) against a read-only mirror.
    ReadOnly(String),
    /// A mapping produced an unusable upstream URL.
    InvalidRoute(anyhow::Error),
    /// No servable mirror could be produced.
    SyncFailed(SyncFailed),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found\n").into_response(),
            AppError::BadRequest(msg) => {
                debug!(reason = %msg, "bad request");
                (StatusCode::BAD_REQUEST, "Bad request\n").into_response()
            }
            AppError::ReadOnly(msg) => {
                debug!(reason = %msg, "write rejected");
                (StatusCode::FORBIDDEN, "Mirror is read-only\n").into_response()
            }
            AppError::InvalidRoute(err) => {
                error!(error = %format!("{err:#}"), "mapping produced an invalid upstream");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error\n").into_response()
            }
            AppError::SyncFailed(err) => {
                warn!(upstream = %err.upstream, reason = %err.reason, "no servable mirror");
                (StatusCode::BAD_GATEWAY, "Upstream sync failed\n").into_response()
            }
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error\n").into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<ServeError> for AppError {
    fn from(err: ServeError) -> Self {
        match err {
            ServeError::BadRequest(msg) => AppError::BadRequest(msg),
            ServeError::ReadOnly(msg) => AppError::ReadOnly(msg),
            ServeError::Backend(err) => AppError::Internal(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
