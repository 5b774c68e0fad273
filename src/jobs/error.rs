// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Errors returned synchronously by the job store, manager and facade.
//!
//! Failures that happen after a job was accepted (network errors, timeouts,
//! cancellation) are never returned here; they are recorded on the job.

use thiserror::Error;

use super::types::{JobId, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Bad input from the caller
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown or evicted job id
    #[error("job {0} not found")]
    NotFound(JobId),

    /// File requested before the job completed
    #[error("job {id} is not ready yet (status: {status})")]
    NotReady { id: JobId, status: JobStatus },

    /// Job failed or its file is no longer on disk
    #[error("job {id} is gone: {reason}")]
    Gone { id: JobId, reason: String },

    /// Admission control rejected the submission
    #[error("download queue is full ({depth} jobs waiting)")]
    Overloaded { depth: usize },

    /// Attempted a state change the lifecycle does not allow
    #[error("job {id} cannot {action} while {status}")]
    InvalidTransition {
        id: JobId,
        status: JobStatus,
        action: &'static str,
    },
}

pub type JobResult<T> = Result<T, JobError>;
