// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API server
//!
//! HTTP surface over the job manager and the search provider.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with job counts
//! - `GET /api/v1/search?query=...&limit=...` - Search for tracks
//! - `POST /api/v1/download` - Queue a download (202)
//! - `GET /api/v1/download/status/:id` - Poll a download
//! - `GET /api/v1/download/file/:id` - Stream the finished file
//! - `DELETE /api/v1/download/:id` - Cancel a queued or running download
//!
//! # Example
//!
//! ```no_run
//! use music_downloader::config::Config;
//! use music_downloader::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::new(Config::default());
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_governor::{
    governor::GovernorConfigBuilder,
    key_extractor::SmartIpKeyExtractor,
    GovernorLayer,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, TranscoderKind};
use crate::errors::{ApiResult, UserError};
use crate::jobs::{
    DownloadRequest, DownloadStatusView, FetchWorker, Fetcher, FfmpegTranscoder, HttpFetcher, JobId,
    JobManager, JobStore, ManagerStats, PassthroughTranscoder, StatusFacade, Transcoder,
};
use crate::search::{CatalogSearchProvider, SearchProvider, SearchQuery, SearchResponse};

/// Maximum request body size (64KB); download requests are tiny.
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Deadline for producing response headers. File bodies stream past it.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Server state shared across handlers.
pub struct AppState {
    pub manager: JobManager,
    pub facade: StatusFacade,
    pub search: Arc<dyn SearchProvider>,
}

impl AppState {
    /// Wire the job system from configuration. Must run inside a tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.connect_timeout()).context("Failed to build HTTP client")?;

        let transcoder: Arc<dyn Transcoder> = match config.transcoder {
            TranscoderKind::Passthrough => Arc::new(PassthroughTranscoder),
            TranscoderKind::Ffmpeg => Arc::new(FfmpegTranscoder::new(config.ffmpeg_path.clone())),
        };

        let search: Arc<dyn SearchProvider> = match &config.catalog_path {
            Some(path) => Arc::new(CatalogSearchProvider::from_file(path)?),
            None => Arc::new(CatalogSearchProvider::empty()),
        };

        tracing::info!(
            transcoder = transcoder.name(),
            search = search.name(),
            download_dir = %config.download_dir.display(),
            "Job system configured"
        );

        Ok(Self::with_components(config, Arc::new(fetcher), transcoder, search))
    }

    /// Wire the job system around the given collaborators.
    pub fn with_components(
        config: &Config,
        fetcher: Arc<dyn Fetcher>,
        transcoder: Arc<dyn Transcoder>,
        search: Arc<dyn SearchProvider>,
    ) -> Self {
        let store = Arc::new(JobStore::new(config.retention()));
        let worker = Arc::new(FetchWorker::new(
            store.clone(),
            fetcher,
            transcoder,
            config.worker_settings(),
        ));
        let manager = JobManager::start(store.clone(), worker, config.manager_config());
        let facade = StatusFacade::new(store, &config.public_base_url);

        Self {
            manager,
            facade,
            search,
        }
    }
}

/// API server.
#[derive(Debug, Clone)]
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Get the port.
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Start the server with graceful shutdown.
    pub async fn start(&self) -> Result<()> {
        let state = Arc::new(AppState::from_config(&self.config)?);
        let router = build_router(state.clone(), &self.config)?;
        let addr = self.config.socket_addr()?;

        tracing::info!("Starting server on {}", addr);

        if addr.ip().is_unspecified() {
            tracing::warn!(
                "Server is binding to {} which exposes the API to the network. \
                Use 127.0.0.1 (default) for local-only access.",
                addr.ip()
            );
        }

        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. \
                    Stop the other instance or pick another port with: music-downloader serve --port <PORT>",
                    addr.port()
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        // Peer addresses feed the per-IP rate limiter
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        state.manager.shutdown().await;
        tracing::info!("Cleanup complete, server stopped");
        Ok(())
    }
}

/// Build the router with all routes and middleware.
pub fn build_router(state: Arc<AppState>, config: &Config) -> Result<Router> {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/search", get(search_handler))
        .route("/api/v1/download", post(download_handler))
        .route("/api/v1/download/status/:id", get(status_handler))
        .route("/api/v1/download/file/:id", get(file_handler))
        .route("/api/v1/download/:id", delete(cancel_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    if config.rate_limit.enabled {
        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .per_second(config.rate_limit.per_second)
                .burst_size(config.rate_limit.burst_size)
                .key_extractor(SmartIpKeyExtractor)
                .finish()
                .context("Invalid rate limit configuration")?,
        );
        router = router.layer(GovernorLayer {
            config: governor_conf,
        });
    }

    Ok(router
        .layer(cors_layer(&config.cors_allowed_origins)?)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.is_empty() {
        return Ok(layer.allow_origin(Any));
    }

    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("Invalid CORS origin: {}", origin))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(origins)))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    jobs: ManagerStats,
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    query: String,
    limit: Option<usize>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let jobs = state.manager.stats();
    let status = if jobs.waiting >= jobs.max_queue_depth {
        "saturated"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        jobs,
    })
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> ApiResult<Json<SearchResponse>> {
    let Query(params) = params.map_err(|e| {
        UserError::invalid_request("Invalid search parameters.", Some("limit"), Some(&e.body_text()))
    })?;

    let query = SearchQuery::new(&params.query, params.limit)?;
    let results = state.search.search(&query).await?;

    Ok(Json(SearchResponse {
        query: query.text,
        results,
    }))
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<DownloadStatusView>)> {
    let Json(request) = payload.map_err(|e| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            UserError::payload_too_large(MAX_BODY_SIZE as u64)
        } else {
            UserError::invalid_request(
                "Request body must be JSON like {\"url\": \"...\"}.",
                None,
                Some(&e.body_text()),
            )
        }
    })?;

    let id = state.manager.submit(&request)?;
    let view = state.facade.get_status(&id)?;
    Ok((StatusCode::ACCEPTED, Json(view)))
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DownloadStatusView>> {
    Ok(Json(state.facade.get_status(&JobId::from(id))?))
}

async fn file_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = JobId::from(id);
    let resolved = state.facade.get_file(&id).await?;

    let disposition = HeaderValue::from_str(&content_disposition(&resolved.filename))
        .map_err(|e| UserError::internal_error(&format!("bad filename header for {}: {}", id, e)))?;

    tracing::debug!(job_id = %id, bytes = resolved.file_size, "Serving file");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, resolved.content_type)
        .header(header::CONTENT_LENGTH, resolved.file_size)
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from_stream(ReaderStream::new(resolved.file)))
        .map_err(|e| UserError::internal_error(&format!("failed to build file response: {}", e)))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<DownloadStatusView>)> {
    let id = JobId::from(id);
    state.manager.cancel(&id).map_err(|e| match e {
        crate::jobs::JobError::InvalidTransition { status, .. } => UserError::invalid_request(
            &format!("The download is already {} and cannot be cancelled.", status),
            None,
            None,
        ),
        other => other.into(),
    })?;
    Ok((StatusCode::ACCEPTED, Json(state.facade.get_status(&id)?)))
}

/// `attachment` disposition with an ASCII fallback name and, for non-ASCII
/// names, an RFC 5987 `filename*` parameter.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .map(|c| if c == '"' || c == '\\' { '_' } else { c })
        .collect();

    if filename.is_ascii() {
        return format!("attachment; filename=\"{}\"", fallback);
    }

    let encoded: String = filename
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => (b as char).to_string(),
            _ => format!("%{:02X}", b),
        })
        .collect();
    format!("attachment; filename=\"{}\"; filename*=UTF-8''{}", fallback, encoded)
}

/// Graceful shutdown signal handler.
///
/// Listens for SIGINT (Ctrl+C) and SIGTERM; in-flight requests finish, then
/// the job manager cancels running downloads.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                    }
                }
            }
            _ => {
                tracing::error!("Failed to install signal handlers, falling back to Ctrl+C");
                wait_for_ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C, shutdown only via process kill");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
}
