// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fetch worker: runs one job from `downloading` to a terminal state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use super::error::JobResult;
use super::fetcher::{FetchError, Fetcher};
use super::progress::{ProgressReporter, DOWNLOAD_SHARE};
use super::retry::{RetryDecision, RetryPolicy};
use super::store::JobStore;
use super::transcode::{TranscodeRequest, Transcoder};
use super::types::{AudioFormat, Job, JobId, JobOutput};

/// Message recorded when a job is cancelled.
pub const CANCELLED_MESSAGE: &str = "cancelled";

/// Settings shared by every worker run.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub download_dir: PathBuf,
    pub retry: RetryPolicy,
    pub progress_interval: Duration,
}

/// Executes download + conversion for jobs handed to it by the manager.
///
/// The worker is the only writer of a job while it runs it.
pub struct FetchWorker {
    store: Arc<JobStore>,
    fetcher: Arc<dyn Fetcher>,
    transcoder: Arc<dyn Transcoder>,
    settings: WorkerSettings,
}

impl FetchWorker {
    pub fn new(
        store: Arc<JobStore>,
        fetcher: Arc<dyn Fetcher>,
        transcoder: Arc<dyn Transcoder>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            transcoder,
            settings,
        }
    }

    /// Path of the in-flight download for a job.
    pub fn partial_path(&self, id: &JobId) -> PathBuf {
        self.settings.download_dir.join(format!("{}.part", id))
    }

    /// Final, job-id addressed path of a job's file.
    pub fn output_path(&self, id: &JobId, format: AudioFormat) -> PathBuf {
        self.settings
            .download_dir
            .join(format!("{}.{}", id, format.extension()))
    }

    /// Remove any files a run of this job may have left behind.
    pub async fn discard_files(&self, id: &JobId, format: AudioFormat) {
        for path in [self.partial_path(id), self.output_path(id, format)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(job_id = %id, path = %path.display(), "Removed file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(job_id = %id, error = %e, "Failed to remove file"),
            }
        }
    }

    /// Run a queued job to completion or failure.
    ///
    /// Records the outcome on the job and returns the final snapshot.
    pub async fn execute(&self, job: Job, cancel: CancellationToken) -> JobResult<Job> {
        let job = self.store.start(&job.id)?;
        tracing::info!(job_id = %job.id, url = %job.source_url, format = %job.format, "Download started");

        let reporter = ProgressReporter::new(
            self.store.clone(),
            job.id.clone(),
            self.settings.progress_interval,
        );

        match self.run(&job, &reporter, &cancel).await {
            Ok(output) => {
                let size = output.file_size;
                let done = self.store.complete(&job.id, output)?;
                tracing::info!(job_id = %job.id, bytes = size, "Download complete");
                Ok(done)
            }
            Err(e) => {
                self.discard_files(&job.id, job.format).await;
                let message = match &e {
                    FetchError::Cancelled => CANCELLED_MESSAGE.to_string(),
                    other => format!("Download failed: {}", other),
                };
                tracing::warn!(job_id = %job.id, error = %e, "Download failed");
                self.store.fail(&job.id, message)
            }
        }
    }

    async fn run(
        &self,
        job: &Job,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<JobOutput, FetchError> {
        tokio::fs::create_dir_all(&self.settings.download_dir).await?;

        let partial = self.partial_path(&job.id);
        self.fetch_with_retry(job, &partial, reporter, cancel).await?;

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        reporter.force(DOWNLOAD_SHARE, &format!("Converting to {}", job.format));
        let output = self.output_path(&job.id, job.format);
        let request = TranscodeRequest {
            input: &partial,
            output: &output,
            source_format: source_format(&job.source_url),
            format: job.format,
            quality: job.quality,
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = self.transcoder.transcode(&request) => result?,
        }

        let file_size = tokio::fs::metadata(&output).await?.len();
        reporter.force(99, "Finalizing");

        Ok(JobOutput {
            path: output,
            file_size,
            filename: derive_filename(&job.source_url, job.format, &job.id),
        })
    }

    async fn fetch_with_retry(
        &self,
        job: &Job,
        dest: &Path,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError> {
        let policy = self.settings.retry;
        let on_progress = |downloaded: u64, total: Option<u64>| {
            reporter.report_bytes(downloaded, total);
        };

        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            if let Err(e) = self.store.record_attempt(&job.id) {
                tracing::debug!(job_id = %job.id, error = %e, "Could not record attempt");
            }

            let error = match self
                .fetcher
                .fetch(&job.source_url, dest, cancel, &on_progress)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) => e,
            };

            match policy.decide(attempt, error.kind()) {
                RetryDecision::NoRetry => {
                    tracing::debug!(job_id = %job.id, attempt, error = %error, "Giving up");
                    return Err(error);
                }
                RetryDecision::RetryAfter(delay) => {
                    tracing::info!(
                        job_id = %job.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Fetch failed, retrying"
                    );
                    reporter.force(
                        reporter.last_percent(),
                        &format!(
                            "Retrying after error: {} (attempt {} of {})",
                            error,
                            attempt + 1,
                            policy.max_attempts
                        ),
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Format implied by the source URL's extension, if recognisable.
fn source_format(url: &Url) -> Option<AudioFormat> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let (_, ext) = segment.rsplit_once('.')?;
    AudioFormat::from_extension(ext)
}

/// Client-facing filename: the URL's last path segment with the requested
/// extension, falling back to the job id.
pub fn derive_filename(url: &Url, format: AudioFormat, id: &JobId) -> String {
    let stem = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|segment| match segment.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => segment,
        })
        .map(sanitize_filename)
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| id.to_string());

    format!("{}.{}", stem, format.extension())
}

/// Keep filenames safe on disk and inside a `Content-Disposition` header.
fn sanitize_filename(name: &str) -> String {
    const MAX_LEN: usize = 200;

    let decoded = percent_decode(name);
    let mut out = String::with_capacity(decoded.len());
    let mut prev_underscore = false;

    for c in decoded.chars() {
        let c = if c.is_control() || matches!(c, '/' | '\\' | '"' | ':' | '*' | '?' | '<' | '>' | '|') {
            '_'
        } else {
            c
        };
        if c == '_' {
            if !prev_underscore {
                out.push(c);
            }
            prev_underscore = true;
        } else {
            out.push(c);
            prev_underscore = false;
        }
    }

    let trimmed = out.trim_matches(|c: char| c == ' ' || c == '.' || c == '_');
    let mut end = trimmed.len().min(MAX_LEN);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_derive_filename() {
        let id = JobId::from("abc");
        assert_eq!(derive_filename(&url("http://example.com/a.mp3"), AudioFormat::Mp3, &id), "a.mp3");
        assert_eq!(
            derive_filename(&url("http://example.com/music/My%20Song.flac?x=1"), AudioFormat::Mp3, &id),
            "My Song.mp3"
        );
        assert_eq!(derive_filename(&url("http://example.com/"), AudioFormat::Wav, &id), "abc.wav");
        assert_eq!(derive_filename(&url("http://example.com/watch"), AudioFormat::M4a, &id), "watch.m4a");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a\"b\\c"), "a_b_c");
        assert_eq!(sanitize_filename("..hidden.."), "hidden");
        assert_eq!(sanitize_filename("x%2Fy"), "x_y");
    }

    #[test]
    fn test_source_format() {
        assert_eq!(source_format(&url("http://e.com/a.FLAC")), Some(AudioFormat::Flac));
        assert_eq!(source_format(&url("http://e.com/watch?v=1")), None);
        assert_eq!(source_format(&url("http://e.com/")), None);
    }
}
