// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory job table.
//!
//! Jobs live in a `DashMap`, so progress writes for one job never block
//! reads or writes of jobs that land in a different shard.
//!
//! The store enforces the job lifecycle:
//!
//! ```text
//! queued ──start──▶ downloading ──complete──▶ completed
//!    │                   │
//!    └──────fail─────────┴──────fail────────▶ failed
//! ```
//!
//! Terminal jobs are evicted once they have been finished for longer than
//! the retention window, either lazily by `get` or by `evict_expired`.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use super::error::{JobError, JobResult};
use super::types::{DownloadRequest, Job, JobId, JobOutput, JobSpec, JobStatus};

/// Highest progress a job may report before it completes.
const MAX_RUNNING_PROGRESS: u8 = 99;

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub downloading: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Concurrent in-memory table of download jobs.
pub struct JobStore {
    jobs: DashMap<JobId, Job>,
    retention: chrono::Duration,
    /// Jobs evicted lazily by `get`, handed out by the next sweep
    evicted: Mutex<Vec<Job>>,
}

impl JobStore {
    /// Create a store that keeps finished jobs for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(365 * 100)),
            evicted: Mutex::new(Vec::new()),
        }
    }

    /// Validate a request and insert a new queued job.
    pub fn create(&self, request: &DownloadRequest) -> JobResult<Job> {
        let spec = request.validate()?;
        Ok(self.create_from_spec(spec))
    }

    /// Insert a new queued job for already-validated parameters.
    pub fn create_from_spec(&self, spec: JobSpec) -> Job {
        let mut job = Job::new(spec);
        // 128 random bits; regenerate on the astronomically unlikely clash
        loop {
            match self.jobs.entry(job.id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(job.clone());
                    break;
                }
                Entry::Occupied(_) => job.id = JobId::generate(),
            }
        }

        tracing::debug!(job_id = %job.id, url = %job.source_url, "Job created");
        job
    }

    /// Get a snapshot of a job.
    pub fn get(&self, id: &JobId) -> JobResult<Job> {
        match self.jobs.get(id) {
            None => return Err(JobError::NotFound(id.clone())),
            Some(job) if !job.is_expired(self.retention, Utc::now()) => return Ok(job.clone()),
            Some(_) => {}
        }

        // Re-checked under the shard write lock
        if let Some((_, job)) = self
            .jobs
            .remove_if(id, |_, job| job.is_expired(self.retention, Utc::now()))
        {
            tracing::debug!(job_id = %id, "Evicted expired job on access");
            lock_evicted(&self.evicted).push(job);
        }
        Err(JobError::NotFound(id.clone()))
    }

    /// Mark a queued job as picked up by a worker.
    pub fn start(&self, id: &JobId) -> JobResult<Job> {
        self.mutate(id, |job| {
            if job.status != JobStatus::Queued {
                return Err(transition(job, "start"));
            }
            job.update_status(JobStatus::Downloading, "Starting download...");
            Ok(job.clone())
        })
    }

    /// Record progress for a downloading job.
    ///
    /// Progress is capped at 99 and never goes backwards; the effective value
    /// is returned.
    pub fn update_progress(&self, id: &JobId, progress: u8, message: impl Into<String>) -> JobResult<u8> {
        self.mutate(id, |job| {
            if job.status != JobStatus::Downloading {
                return Err(transition(job, "update progress"));
            }
            job.progress = job.progress.max(progress.min(MAX_RUNNING_PROGRESS));
            job.message = message.into();
            job.updated_at = Utc::now();
            Ok(job.progress)
        })
    }

    /// Count a fetch attempt for a downloading job.
    pub fn record_attempt(&self, id: &JobId) -> JobResult<u32> {
        self.mutate(id, |job| {
            if job.status != JobStatus::Downloading {
                return Err(transition(job, "record an attempt"));
            }
            job.attempts += 1;
            job.updated_at = Utc::now();
            Ok(job.attempts)
        })
    }

    /// Transition a downloading job to `completed`.
    pub fn complete(&self, id: &JobId, output: JobOutput) -> JobResult<Job> {
        self.mutate(id, |job| {
            if job.status != JobStatus::Downloading {
                return Err(transition(job, "complete"));
            }
            job.progress = 100;
            job.output = Some(output);
            job.update_status(JobStatus::Completed, "Download complete");
            Ok(job.clone())
        })
    }

    /// Transition a queued or downloading job to `failed`.
    pub fn fail(&self, id: &JobId, message: impl Into<String>) -> JobResult<Job> {
        self.mutate(id, |job| {
            if job.status.is_terminal() {
                return Err(transition(job, "fail"));
            }
            job.output = None;
            job.update_status(JobStatus::Failed, message);
            Ok(job.clone())
        })
    }

    /// Fail a job only if no worker has picked it up yet.
    ///
    /// Returns `None` when the job already left `queued`.
    pub fn fail_if_queued(&self, id: &JobId, message: impl Into<String>) -> JobResult<Option<Job>> {
        self.mutate(id, |job| {
            if job.status != JobStatus::Queued {
                return Ok(None);
            }
            job.update_status(JobStatus::Failed, message);
            Ok(Some(job.clone()))
        })
    }

    /// Remove every expired job, including those already evicted lazily.
    ///
    /// The caller owns the returned jobs and is responsible for deleting
    /// their files.
    pub fn evict_expired(&self) -> Vec<Job> {
        let now = Utc::now();
        let mut evicted = std::mem::take(&mut *lock_evicted(&self.evicted));

        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|job| job.is_expired(self.retention, now))
            .map(|job| job.key().clone())
            .collect();
        evicted.extend(expired.iter().filter_map(|id| {
            self.jobs
                .remove_if(id, |_, job| job.is_expired(self.retention, now))
                .map(|(_, job)| job)
        }));

        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "Evicted expired jobs");
        }
        evicted
    }

    /// Count jobs by status.
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for job in self.jobs.iter() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Downloading => counts.downloading += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Number of jobs currently held (expired jobs included until evicted).
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn mutate<R>(&self, id: &JobId, f: impl FnOnce(&mut Job) -> JobResult<R>) -> JobResult<R> {
        match self.jobs.get_mut(id) {
            Some(mut job) if !job.is_expired(self.retention, Utc::now()) => f(job.value_mut()),
            _ => Err(JobError::NotFound(id.clone())),
        }
    }
}

fn transition(job: &Job, action: &'static str) -> JobError {
    tracing::warn!(
        job_id = %job.id,
        status = %job.status,
        action,
        "Rejected job state transition"
    );
    JobError::InvalidTransition {
        id: job.id.clone(),
        status: job.status,
        action,
    }
}

// A panic while draining leaves at worst a few files for the next sweep
fn lock_evicted(lock: &Mutex<Vec<Job>>) -> std::sync::MutexGuard<'_, Vec<Job>> {
    lock.lock().unwrap_or_else(|poisoned| {
        tracing::error!(event = "LOCK_POISONED", "Eviction list lock poisoned, recovering");
        poisoned.into_inner()
    })
}
