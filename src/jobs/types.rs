// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job types for background music downloads.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::error::JobError;

/// Opaque job identifier (32 lowercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random id (UUID v4 layout, no hyphens).
    pub fn generate() -> Self {
        use rand::Rng;

        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);

        // Version (4) and variant (RFC 4122) bits
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;

        Self(bytes.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle status of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker slot
    Queued,
    /// A worker is fetching or converting the file
    Downloading,
    /// File is ready to be served
    Completed,
    /// Gave up; `message` says why
    Failed,
}

impl JobStatus {
    /// Returns true once the job can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested output quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Highest,
    Medium,
    Low,
}

impl Quality {
    /// Target audio bitrate for lossy encoders.
    pub fn bitrate_kbps(&self) -> u32 {
        match self {
            Quality::Highest => 320,
            Quality::Medium => 192,
            Quality::Low => 128,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Highest => "highest",
            Quality::Medium => "medium",
            Quality::Low => "low",
        }
    }
}

impl FromStr for Quality {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "highest" | "high" | "best" => Ok(Quality::Highest),
            "medium" => Ok(Quality::Medium),
            "low" => Ok(Quality::Low),
            other => Err(JobError::InvalidRequest(format!(
                "unknown quality '{}' (expected highest, medium or low)",
                other
            ))),
        }
    }
}

/// Requested output container/codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Wav,
    M4a,
    Flac,
    Ogg,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::M4a => "m4a",
            AudioFormat::Flac => "flac",
            AudioFormat::Ogg => "ogg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::M4a => "audio/mp4",
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Ogg => "audio/ogg",
        }
    }

    /// Lossless formats ignore the requested bitrate.
    pub fn is_lossless(&self) -> bool {
        matches!(self, AudioFormat::Wav | AudioFormat::Flac)
    }

    /// Guess the format from a file extension, if it is one we know.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "wav" | "wave" => Some(AudioFormat::Wav),
            "m4a" | "mp4" | "aac" => Some(AudioFormat::M4a),
            "flac" => Some(AudioFormat::Flac),
            "ogg" | "oga" => Some(AudioFormat::Ogg),
            _ => None,
        }
    }
}

impl FromStr for AudioFormat {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AudioFormat::from_extension(s.trim()).ok_or_else(|| {
            JobError::InvalidRequest(format!(
                "unsupported format '{}' (expected mp3, wav, m4a, flac or ogg)",
                s.trim()
            ))
        })
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Body of `POST /api/v1/download`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            quality: None,
            format: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = Some(quality.into());
        self
    }

    /// Parse and check the request, producing the immutable job parameters.
    pub fn validate(&self) -> Result<JobSpec, JobError> {
        let raw = self.url.trim();
        if raw.is_empty() {
            return Err(JobError::InvalidRequest("url is required".to_string()));
        }

        let source_url = Url::parse(raw)
            .map_err(|e| JobError::InvalidRequest(format!("url is malformed: {}", e)))?;

        if !matches!(source_url.scheme(), "http" | "https") {
            return Err(JobError::InvalidRequest(format!(
                "url scheme '{}' is not supported (use http or https)",
                source_url.scheme()
            )));
        }
        if source_url.host_str().map_or(true, str::is_empty) {
            return Err(JobError::InvalidRequest("url has no host".to_string()));
        }

        let quality = match self.quality.as_deref().map(str::trim) {
            None | Some("") => Quality::default(),
            Some(q) => q.parse()?,
        };
        let format = match self.format.as_deref().map(str::trim) {
            None | Some("") => AudioFormat::default(),
            Some(f) => f.parse()?,
        };

        Ok(JobSpec {
            source_url,
            quality,
            format,
        })
    }
}

/// Validated, immutable parameters of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub source_url: Url,
    pub quality: Quality,
    pub format: AudioFormat,
}

/// Where a finished job's file lives.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub path: PathBuf,
    pub file_size: u64,
    pub filename: String,
}

/// A download job and its lifecycle state.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub source_url: Url,
    pub quality: Quality,
    pub format: AudioFormat,
    pub status: JobStatus,
    /// 0-100, never decreases
    pub progress: u8,
    pub message: String,
    /// Set iff `status == Completed`
    pub output: Option<JobOutput>,
    /// Fetch attempts made by the worker
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a queued job for validated parameters.
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            source_url: spec.source_url,
            quality: spec.quality,
            format: spec.format,
            status: JobStatus::Queued,
            progress: 0,
            message: "Queued for download".to_string(),
            output: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Update the status and timestamps.
    pub(crate) fn update_status(&mut self, status: JobStatus, message: impl Into<String>) {
        let now = Utc::now();
        self.status = status;
        self.message = message.into();
        self.updated_at = now;
        if status.is_terminal() {
            self.finished_at = Some(now);
        }
    }

    /// True when the job finished longer than `retention` ago.
    ///
    /// A retention reaching past the representable date range never expires.
    pub fn is_expired(&self, retention: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.finished_at
            .and_then(|finished_at| finished_at.checked_add_signed(retention))
            .is_some_and(|expires_at| expires_at <= now)
    }
}
