// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! music-downloader - Music search and download service library
//!
//! Queue a download, poll its progress, fetch the file when it is ready.
//!
//! Requests flow through a bounded background job system:
//!
//! **HTTP API** -> **JobManager** -> **FetchWorker** -> **JobStore** -> **StatusFacade**
//!
//! # Core Modules
//!
//! - [`jobs`] - Job store, workers, manager and the read-only status facade
//! - [`search`] - Search provider seam and the catalog provider
//! - [`server`] - HTTP server (axum)
//! - [`errors`] - User-facing error responses with reference codes
//! - [`config`] - Configuration file and defaults
//! - [`logging`] - Tracing subscriber setup

pub mod config;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod search;
pub mod server;

// Re-export the job system
pub use jobs::{
    AudioFormat, DownloadRequest, DownloadStatusView, FetchError, Fetcher, HttpFetcher, JobError,
    JobId, JobManager, JobStatus, JobStore, ManagerConfig, Quality, StatusFacade,
};

// Re-export search types
pub use search::{CatalogSearchProvider, SearchProvider, SearchQuery, SearchResult, SearchSource};

// Re-export server and error handling
pub use config::Config;
pub use errors::{generate_reference_code, sanitize_error_details, ApiResult, ErrorResponse, UserError};
pub use server::{build_router, AppState, Server};
