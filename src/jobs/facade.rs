// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Read-only projection of jobs for the HTTP layer.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use super::error::{JobError, JobResult};
use super::store::JobStore;
use super::types::{Job, JobId, JobStatus};

/// Path under which finished files are served.
pub const FILE_ROUTE: &str = "/api/v1/download/file";

/// Client-facing view of a job.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DownloadStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// A finished file, opened and checked against the recorded size.
#[derive(Debug)]
pub struct ResolvedFile {
    pub file: tokio::fs::File,
    pub path: PathBuf,
    pub file_size: u64,
    pub filename: String,
    pub content_type: &'static str,
}

/// Answers status and file queries without ever writing to the store.
#[derive(Clone)]
pub struct StatusFacade {
    store: Arc<JobStore>,
    file_base: String,
}

impl StatusFacade {
    /// `public_base_url` prefixes file URLs; empty means relative URLs.
    pub fn new(store: Arc<JobStore>, public_base_url: &str) -> Self {
        Self {
            store,
            file_base: format!("{}{}", public_base_url.trim_end_matches('/'), FILE_ROUTE),
        }
    }

    pub fn get_status(&self, id: &JobId) -> JobResult<DownloadStatusView> {
        let job = self.store.get(id)?;
        Ok(self.view(job))
    }

    /// Project a job snapshot into its client view.
    pub fn view(&self, job: Job) -> DownloadStatusView {
        let (file_url, file_size, filename) = match job.output {
            Some(output) if job.status == JobStatus::Completed => (
                Some(format!("{}/{}", self.file_base, job.id)),
                Some(output.file_size),
                Some(output.filename),
            ),
            _ => (None, None, None),
        };

        DownloadStatusView {
            id: job.id,
            status: job.status,
            progress: job.progress,
            message: job.message,
            file_url,
            file_size,
            filename,
        }
    }

    /// Open the finished file of a completed job.
    pub async fn get_file(&self, id: &JobId) -> JobResult<ResolvedFile> {
        let job = self.store.get(id)?;

        let output = match (job.status, job.output) {
            (JobStatus::Completed, Some(output)) => output,
            (JobStatus::Failed, _) => {
                return Err(JobError::Gone {
                    id: job.id,
                    reason: job.message,
                })
            }
            (status, _) => return Err(JobError::NotReady { id: job.id, status }),
        };

        let gone = |reason: &str| JobError::Gone {
            id: id.clone(),
            reason: reason.to_string(),
        };

        let file = match tokio::fs::File::open(&output.path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Completed job's file is unavailable");
                return Err(gone("file no longer available"));
            }
        };
        let on_disk = file
            .metadata()
            .await
            .map_err(|_| gone("file no longer available"))?
            .len();
        if on_disk != output.file_size {
            tracing::warn!(job_id = %id, expected = output.file_size, on_disk, "File size changed on disk");
            return Err(gone("file was modified"));
        }

        Ok(ResolvedFile {
            file,
            path: output.path,
            file_size: output.file_size,
            filename: output.filename,
            content_type: job.format.content_type(),
        })
    }
}
