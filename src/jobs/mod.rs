// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Asynchronous download jobs
//!
//! Accepts download requests, runs the fetch and conversion out-of-band and
//! tracks per-job progress until the file can be served:
//! - Bounded worker pool with a FIFO wait queue and queue-depth limit
//! - Per-job deadlines, cooperative cancellation and retries with backoff
//! - Retention-based eviction of finished jobs and their files
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ JobManager      │────▶│ FetchWorker     │
//! │ (submit/cancel) │     │ (tokio task)    │
//! └────────┬────────┘     └────────┬────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ JobStore        │◀────│ Fetcher +       │
//! │ (sharded)       │     │ Transcoder      │
//! └────────┬────────┘     └─────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ StatusFacade    │
//! │ (read-only)     │
//! └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use music_downloader::jobs::*;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(JobStore::new(Duration::from_secs(24 * 3600)));
//! let worker = Arc::new(FetchWorker::new(
//!     store.clone(),
//!     Arc::new(HttpFetcher::new(Duration::from_secs(15))?),
//!     Arc::new(PassthroughTranscoder),
//!     WorkerSettings {
//!         download_dir: "downloads".into(),
//!         retry: RetryPolicy::default(),
//!         progress_interval: Duration::from_millis(250),
//!     },
//! ));
//! let manager = JobManager::start(store.clone(), worker, ManagerConfig::default());
//!
//! let id = manager.submit(&DownloadRequest::new("http://example.com/a.mp3"))?;
//! let status = StatusFacade::new(store, "").get_status(&id)?;
//! println!("{}: {}", status.status, status.message);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod facade;
pub mod fetcher;
pub mod manager;
pub mod progress;
pub mod retry;
pub mod store;
pub mod transcode;
pub mod types;
pub mod worker;

pub use error::{JobError, JobResult};
pub use facade::{DownloadStatusView, ResolvedFile, StatusFacade};
pub use fetcher::{FetchError, Fetcher, HttpFetcher, ProgressFn};
pub use manager::{JobManager, ManagerConfig, ManagerStats};
pub use retry::{ErrorKind, RetryDecision, RetryPolicy};
pub use store::{JobStore, StatusCounts};
pub use transcode::{FfmpegTranscoder, PassthroughTranscoder, TranscodeRequest, Transcoder};
pub use types::{AudioFormat, DownloadRequest, Job, JobId, JobOutput, JobSpec, JobStatus, Quality};
pub use worker::{FetchWorker, WorkerSettings};
