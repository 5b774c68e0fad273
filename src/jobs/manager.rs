// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job manager: admission control, FIFO dispatch and job deadlines.
//!
//! Every accepted job gets its own task, which owns the job until it reaches
//! a terminal state. The task waits for a worker permit handed out by a
//! single dispatcher, which serves tickets strictly in submission order:
//!
//! ```text
//! submit ──ticket──▶ dispatcher ──permit──▶ job task ──▶ FetchWorker
//!    │                (FIFO, N permits)        │
//!    └──spawn job task─────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::error::{JobError, JobResult};
use super::store::JobStore;
use super::types::{DownloadRequest, JobId};
use super::worker::{FetchWorker, CANCELLED_MESSAGE};

/// Message recorded when a job exceeds its deadline.
pub const TIMEOUT_MESSAGE: &str = "timeout";

/// Limits enforced by the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Workers allowed to run at once.
    pub max_concurrent: usize,
    /// Jobs allowed to wait for a worker before `submit` is refused.
    pub max_queue_depth: usize,
    /// Deadline for one worker run.
    pub job_timeout: Duration,
    /// How often expired jobs are swept.
    pub sweep_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_queue_depth: 100,
            job_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Snapshot of manager load.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ManagerStats {
    pub queued: usize,
    pub downloading: usize,
    pub completed: usize,
    pub failed: usize,
    /// Jobs waiting for a worker permit
    pub waiting: usize,
    /// Workers currently running
    pub running: usize,
    pub max_concurrent: usize,
    pub max_queue_depth: usize,
}

/// Request for a worker permit, queued in submission order.
struct Ticket {
    id: JobId,
    start_tx: oneshot::Sender<OwnedSemaphorePermit>,
}

struct Inner {
    store: Arc<JobStore>,
    worker: Arc<FetchWorker>,
    config: ManagerConfig,
    dispatch_tx: mpsc::UnboundedSender<Ticket>,
    /// Cancellation handle of every job that still has a task
    handles: Mutex<HashMap<JobId, CancellationToken>>,
    waiting: AtomicUsize,
    running: AtomicUsize,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone: stop the dispatcher and sweeper
        self.shutdown.cancel();
    }
}

/// Accepts download requests and runs them on a bounded worker pool.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    /// Create the manager and start its dispatcher and sweeper tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(store: Arc<JobStore>, worker: Arc<FetchWorker>, config: ManagerConfig) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        tokio::spawn(dispatch_loop(dispatch_rx, permits, shutdown.clone()));
        tokio::spawn(sweep_loop(
            store.clone(),
            worker.clone(),
            config.sweep_interval,
            shutdown.clone(),
        ));

        tracing::info!(
            max_concurrent = config.max_concurrent,
            max_queue_depth = config.max_queue_depth,
            job_timeout_secs = config.job_timeout.as_secs(),
            "Job manager started"
        );

        Self {
            inner: Arc::new(Inner {
                store,
                worker,
                config,
                dispatch_tx,
                handles: Mutex::new(HashMap::new()),
                waiting: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                shutdown,
            }),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    /// Validate and accept a download request.
    ///
    /// Returns as soon as the job exists in `queued` state; the download
    /// runs in the background.
    pub fn submit(&self, request: &DownloadRequest) -> JobResult<JobId> {
        let spec = request.validate()?;

        if self.inner.shutdown.is_cancelled() {
            return Err(JobError::Overloaded {
                depth: self.inner.waiting.load(Ordering::SeqCst),
            });
        }
        self.reserve_slot()?;

        let job = self.inner.store.create_from_spec(spec);
        if !self.dispatch(job.id.clone()) {
            self.inner.waiting.fetch_sub(1, Ordering::SeqCst);
        }

        tracing::info!(job_id = %job.id, url = %job.source_url, "Download queued");
        Ok(job.id)
    }

    /// Request cooperative cancellation of a queued or running job.
    pub fn cancel(&self, id: &JobId) -> JobResult<()> {
        let job = self.inner.store.get(id)?;
        if job.status.is_terminal() {
            return Err(JobError::InvalidTransition {
                id: id.clone(),
                status: job.status,
                action: "cancel",
            });
        }

        let token = lock(&self.inner.handles).get(id).cloned();
        match token {
            Some(token) => {
                token.cancel();
                // A job still waiting for a worker fails right away
                if self.inner.store.fail_if_queued(id, CANCELLED_MESSAGE)?.is_some() {
                    tracing::info!(job_id = %id, "Job cancelled before it started");
                    return Ok(());
                }
                tracing::info!(job_id = %id, status = %job.status, "Cancellation requested");
                Ok(())
            }
            None => {
                // The owning task just finished; report whatever it settled on
                let job = self.inner.store.get(id)?;
                Err(JobError::InvalidTransition {
                    id: id.clone(),
                    status: job.status,
                    action: "cancel",
                })
            }
        }
    }

    pub fn stats(&self) -> ManagerStats {
        let counts = self.inner.store.counts();
        ManagerStats {
            queued: counts.queued,
            downloading: counts.downloading,
            completed: counts.completed,
            failed: counts.failed,
            waiting: self.inner.waiting.load(Ordering::SeqCst),
            running: self.inner.running.load(Ordering::SeqCst),
            max_concurrent: self.inner.config.max_concurrent,
            max_queue_depth: self.inner.config.max_queue_depth,
        }
    }

    /// Stop accepting work, cancel every job and wait briefly for tasks to
    /// record their outcome.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("Shutting down job manager");
        self.inner.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !lock(&self.inner.handles).is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn reserve_slot(&self) -> JobResult<()> {
        let max = self.inner.config.max_queue_depth;
        self.inner
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |waiting| {
                (waiting < max).then_some(waiting + 1)
            })
            .map(|_| ())
            .map_err(|depth| {
                tracing::warn!(depth, "Download queue full, rejecting submission");
                JobError::Overloaded { depth }
            })
    }

    /// Hand a job to the dispatcher and spawn its owning task.
    ///
    /// Returns false if the job already has a task.
    fn dispatch(&self, id: JobId) -> bool {
        let cancel = self.inner.shutdown.child_token();
        {
            let mut handles = lock(&self.inner.handles);
            if handles.contains_key(&id) {
                tracing::debug!(job_id = %id, "Job already dispatched");
                return false;
            }
            handles.insert(id.clone(), cancel.clone());
        }

        let (start_tx, start_rx) = oneshot::channel();
        if self
            .inner
            .dispatch_tx
            .send(Ticket {
                id: id.clone(),
                start_tx,
            })
            .is_err()
        {
            // Dispatcher is gone; the task sees a closed channel and fails the job
            tracing::warn!(job_id = %id, "Dispatcher stopped, job will not run");
        }

        tokio::spawn(run_job(self.inner.clone(), id, start_rx, cancel));
        true
    }
}

/// Owns one job from submission to its terminal state.
async fn run_job(
    inner: Arc<Inner>,
    id: JobId,
    start_rx: oneshot::Receiver<OwnedSemaphorePermit>,
    cancel: CancellationToken,
) {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = start_rx => permit.ok(),
    };
    inner.waiting.fetch_sub(1, Ordering::SeqCst);

    match permit {
        None => match inner.store.fail_if_queued(&id, CANCELLED_MESSAGE) {
            Ok(Some(_)) => tracing::info!(job_id = %id, "Job cancelled before it started"),
            Ok(None) => {}
            Err(e) => tracing::debug!(job_id = %id, error = %e, "Could not cancel waiting job"),
        },
        Some(permit) => {
            inner.running.fetch_add(1, Ordering::SeqCst);
            run_with_deadline(&inner, &id, &cancel).await;
            inner.running.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        }
    }

    lock(&inner.handles).remove(&id);
}

async fn run_with_deadline(inner: &Inner, id: &JobId, cancel: &CancellationToken) {
    let job = match inner.store.get(id) {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!(job_id = %id, error = %e, "Job vanished before it started");
            return;
        }
    };
    let format = job.format;

    let result = tokio::time::timeout(
        inner.config.job_timeout,
        inner.worker.execute(job, cancel.clone()),
    )
    .await;

    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::warn!(job_id = %id, error = %e, "Worker could not record outcome"),
        Err(_) => {
            tracing::warn!(
                job_id = %id,
                timeout_secs = inner.config.job_timeout.as_secs(),
                "Job exceeded its deadline"
            );
            inner.worker.discard_files(id, format).await;
            if let Err(e) = inner.store.fail(id, TIMEOUT_MESSAGE) {
                tracing::warn!(job_id = %id, error = %e, "Could not record timeout");
            }
        }
    }
}

/// Hands out worker permits to tickets in arrival order.
async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Ticket>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    loop {
        let ticket = tokio::select! {
            _ = shutdown.cancelled() => break,
            ticket = rx.recv() => match ticket {
                Some(ticket) => ticket,
                None => break,
            },
        };

        // Cancelled while waiting in line
        if ticket.start_tx.is_closed() {
            continue;
        }

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        if ticket.start_tx.send(permit).is_err() {
            tracing::debug!(job_id = %ticket.id, "Job left the queue before dispatch");
        }
    }
    tracing::debug!("Dispatcher stopped");
}

/// Periodically evicts expired jobs and deletes their files.
async fn sweep_loop(
    store: Arc<JobStore>,
    worker: Arc<FetchWorker>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for job in store.evict_expired() {
            match &job.output {
                Some(output) => {
                    if let Err(e) = tokio::fs::remove_file(&output.path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!(job_id = %job.id, error = %e, "Failed to delete evicted file");
                        }
                    }
                }
                None => worker.discard_files(&job.id, job.format).await,
            }
            tracing::info!(job_id = %job.id, status = %job.status, "Evicted expired job");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!(event = "LOCK_POISONED", "Manager lock poisoned, recovering");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::fetcher::{FetchError, Fetcher, ProgressFn};
    use crate::jobs::retry::RetryPolicy;
    use crate::jobs::transcode::PassthroughTranscoder;
    use crate::jobs::types::{Job, JobStatus};
    use crate::jobs::worker::WorkerSettings;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use url::Url;

    /// Writes a fixed body after an optional delay, failing first with any
    /// queued errors.
    #[derive(Default)]
    struct ScriptedFetcher {
        body: Vec<u8>,
        delay: Duration,
        ignore_cancel: bool,
        failures: Mutex<VecDeque<FetchError>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn new(body: &[u8]) -> Self {
            Self {
                body: body.to_vec(),
                ..Self::default()
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing_with(self, errors: Vec<FetchError>) -> Self {
            *lock(&self.failures) = errors.into();
            self
        }

        fn calls(&self) -> Vec<String> {
            lock(&self.calls).clone()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            url: &Url,
            dest: &Path,
            cancel: &CancellationToken,
            on_progress: ProgressFn<'_>,
        ) -> Result<u64, FetchError> {
            lock(&self.calls).push(url.to_string());
            if let Some(error) = lock(&self.failures).pop_front() {
                return Err(error);
            }
            if self.ignore_cancel {
                tokio::time::sleep(self.delay).await;
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
            tokio::fs::write(dest, &self.body).await?;
            let len = self.body.len() as u64;
            on_progress(len / 2, Some(len));
            on_progress(len, Some(len));
            Ok(len)
        }
    }

    fn config(max_concurrent: usize, max_queue_depth: usize) -> ManagerConfig {
        ManagerConfig {
            max_concurrent,
            max_queue_depth,
            job_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
        }
    }

    fn manager(fetcher: Arc<ScriptedFetcher>, dir: &Path, config: ManagerConfig, retention: Duration) -> JobManager {
        let store = Arc::new(JobStore::new(retention));
        let worker = Arc::new(FetchWorker::new(
            store.clone(),
            fetcher,
            Arc::new(PassthroughTranscoder),
            WorkerSettings {
                download_dir: dir.to_path_buf(),
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(50),
                },
                progress_interval: Duration::ZERO,
            },
        ));
        JobManager::start(store, worker, config)
    }

    async fn wait_for_terminal(manager: &JobManager, id: &JobId) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = manager.store().get(id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            assert!(tokio::time::Instant::now() < deadline, "job {} never finished", id);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn mp3(n: usize) -> DownloadRequest {
        DownloadRequest::new(format!("http://example.com/{}.mp3", n)).with_format("mp3")
    }

    #[tokio::test]
    async fn test_submit_is_queued_then_completes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            Arc::new(ScriptedFetcher::new(b"0123456789")),
            dir.path(),
            config(2, 10),
            Duration::from_secs(3600),
        );

        let id = manager.submit(&mp3(1)).unwrap();
        let job = manager.store().get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);

        let job = wait_for_terminal(&manager, &id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.attempts, 1);
        let output = job.output.unwrap();
        assert_eq!(output.file_size, 10);
        assert_eq!(output.filename, "1.mp3");
        assert_eq!(tokio::fs::read(&output.path).await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_invalid_request_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(Arc::new(ScriptedFetcher::new(b"x")), dir.path(), config(1, 1), Duration::from_secs(60));

        let err = manager.submit(&DownloadRequest::new("")).unwrap_err();
        assert!(matches!(err, JobError::InvalidRequest(_)));
        assert!(manager.store().is_empty());
        assert_eq!(manager.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_overloaded_when_queue_full() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            Arc::new(ScriptedFetcher::new(b"x").with_delay(Duration::from_secs(30))),
            dir.path(),
            config(1, 2),
            Duration::from_secs(60),
        );

        // Nothing has run yet on this single-threaded runtime, so both wait
        manager.submit(&mp3(1)).unwrap();
        manager.submit(&mp3(2)).unwrap();
        let err = manager.submit(&mp3(3)).unwrap_err();
        assert_eq!(err, JobError::Overloaded { depth: 2 });
        assert_eq!(manager.store().len(), 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_fifo_order_with_single_worker() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(b"abc").with_delay(Duration::from_millis(5)));
        let manager = manager(fetcher.clone(), dir.path(), config(1, 50), Duration::from_secs(60));

        let ids: Vec<JobId> = (0..6).map(|n| manager.submit(&mp3(n)).unwrap()).collect();
        for id in &ids {
            assert_eq!(manager.store().get(id).unwrap().status, JobStatus::Queued);
        }
        for id in &ids {
            assert_eq!(wait_for_terminal(&manager, id).await.status, JobStatus::Completed);
        }

        let expected: Vec<String> = (0..6).map(|n| format!("http://example.com/{}.mp3", n)).collect();
        assert_eq!(fetcher.calls(), expected);
    }

    #[tokio::test]
    async fn test_cancel_waiting_and_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            Arc::new(ScriptedFetcher::new(b"x").with_delay(Duration::from_secs(30))),
            dir.path(),
            config(1, 10),
            Duration::from_secs(60),
        );

        let running = manager.submit(&mp3(1)).unwrap();
        let waiting = manager.submit(&mp3(2)).unwrap();

        // Let the first job start
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.store().get(&running).unwrap().status != JobStatus::Downloading {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        manager.cancel(&waiting).unwrap();
        // Recorded before cancel returns, without yielding to the job task
        let job = manager.store().get(&waiting).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message, "cancelled");
        assert_eq!(job.attempts, 0);
        assert!(matches!(
            manager.cancel(&waiting),
            Err(JobError::InvalidTransition { status: JobStatus::Failed, .. })
        ));

        manager.cancel(&running).unwrap();
        let job = wait_for_terminal(&manager, &running).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message, "cancelled");
        assert!(job.output.is_none());

        let err = manager.cancel(&running).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { status: JobStatus::Failed, .. }));
        assert!(matches!(manager.cancel(&JobId::from("missing")), Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_deadline_fails_hung_worker() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher {
            ignore_cancel: true,
            ..ScriptedFetcher::new(b"x").with_delay(Duration::from_secs(30))
        };
        let mut cfg = config(1, 10);
        cfg.job_timeout = Duration::from_millis(50);
        let manager = manager(Arc::new(fetcher), dir.path(), cfg, Duration::from_secs(60));

        let id = manager.submit(&mp3(1)).unwrap();
        let job = wait_for_terminal(&manager, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message, "timeout");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let job = manager.store().get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message, "timeout");
        assert_eq!(manager.stats().running, 0);
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(b"data").failing_with(vec![
            FetchError::Connection("reset".into()),
            FetchError::Status(503),
        ]));
        let manager = manager(fetcher.clone(), dir.path(), config(1, 10), Duration::from_secs(60));

        let id = manager.submit(&mp3(1)).unwrap();
        let job = wait_for_terminal(&manager, &id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
        assert_eq!(fetcher.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget_and_on_client_errors() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(b"data").failing_with(vec![
            FetchError::Timeout,
            FetchError::Timeout,
            FetchError::Timeout,
            FetchError::Status(404),
        ]));
        let manager = manager(fetcher.clone(), dir.path(), config(1, 10), Duration::from_secs(60));

        let first = manager.submit(&mp3(1)).unwrap();
        let job = wait_for_terminal(&manager, &first).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.message.contains("timed out"), "{}", job.message);

        let second = manager.submit(&mp3(2)).unwrap();
        let job = wait_for_terminal(&manager, &second).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.message.contains("404"), "{}", job.message);
        assert!(!dir.path().join(format!("{}.part", second)).exists());
    }

    #[tokio::test]
    async fn test_sweeper_evicts_and_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(1, 10);
        cfg.sweep_interval = Duration::from_millis(20);
        let manager = manager(Arc::new(ScriptedFetcher::new(b"song")), dir.path(), cfg, Duration::ZERO);

        let id = manager.submit(&mp3(1)).unwrap();
        let path = dir.path().join(format!("{}.mp3", id));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while path.exists() || manager.store().get(&id).is_ok() {
            assert!(tokio::time::Instant::now() < deadline, "file was never swept");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(manager.store().get(&id), Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_dispatch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            Arc::new(ScriptedFetcher::new(b"x").with_delay(Duration::from_secs(30))),
            dir.path(),
            config(1, 10),
            Duration::from_secs(60),
        );

        let id = manager.submit(&mp3(1)).unwrap();
        assert!(!manager.dispatch(id.clone()));
        assert_eq!(manager.stats().waiting, 1);

        manager.shutdown().await;
        let job = manager.store().get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message, "cancelled");
    }
}
