// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Service configuration
//!
//! Read from `~/.music-downloader/config.json` (or an explicit path). A
//! missing file means defaults; every field may be omitted.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::jobs::{ManagerConfig, RetryPolicy, WorkerSettings};

/// Directory under the home directory holding config and downloads.
pub const CONFIG_DIR_NAME: &str = ".music-downloader";

/// Upper bound for `retention_hours` (ten years).
pub const MAX_RETENTION_HOURS: u64 = 24 * 365 * 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where finished files are kept
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Prefix for `file_url`; empty gives relative URLs
    #[serde(default)]
    pub public_base_url: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// How long finished jobs and their files are kept
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub transcoder: TranscoderKind,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Allowed CORS origins; empty allows any
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Optional JSON catalog for search
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between replenished requests, per client IP
    #[serde(default = "default_per_second")]
    pub per_second: u64,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TranscoderKind {
    /// Keep fetched bytes as-is
    #[default]
    Passthrough,
    /// Convert with an external ffmpeg binary
    Ffmpeg,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_download_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR_NAME).join("downloads"))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_queue_depth() -> usize {
    100
}

fn default_job_timeout_secs() -> u64 {
    600
}

fn default_retention_hours() -> u64 {
    24
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_per_second() -> u64 {
    2
}

fn default_burst_size() -> u32 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            download_dir: default_download_dir(),
            public_base_url: String::new(),
            max_concurrent_downloads: default_max_concurrent(),
            max_queue_depth: default_max_queue_depth(),
            job_timeout_secs: default_job_timeout_secs(),
            retention_hours: default_retention_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
            retry: RetryConfig::default(),
            progress_interval_ms: default_progress_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            transcoder: TranscoderKind::default(),
            ffmpeg_path: default_ffmpeg_path(),
            cors_allowed_origins: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            catalog_path: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_second: default_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

/// `~/.music-downloader`, created if missing.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let dir = home.join(CONFIG_DIR_NAME);
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(dir)
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

impl Config {
    /// Load from `path`, or the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };
        Self::load_from(&path)
    }

    /// Load and validate a config file; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid config {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            bail!("max_concurrent_downloads must be at least 1");
        }
        if self.job_timeout_secs == 0 {
            bail!("job_timeout_secs must be at least 1");
        }
        if self.retention_hours > MAX_RETENTION_HOURS {
            bail!(
                "retention_hours ({}) must not exceed {}",
                self.retention_hours,
                MAX_RETENTION_HOURS
            );
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!(
                "retry.base_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }
        if self.rate_limit.enabled && (self.rate_limit.per_second == 0 || self.rate_limit.burst_size == 0) {
            bail!("rate_limit.per_second and rate_limit.burst_size must be non-zero");
        }
        if !self.public_base_url.is_empty() {
            url::Url::parse(&self.public_base_url)
                .with_context(|| format!("public_base_url is not a valid URL: {}", self.public_base_url))?;
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.bind_address, self.port))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_concurrent: self.max_concurrent_downloads,
            max_queue_depth: self.max_queue_depth,
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            download_dir: self.download_dir.clone(),
            retry: self.retry_policy(),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(config.max_queue_depth, 100);
        assert_eq!(config.retention(), Duration::from_secs(24 * 3600));
        assert_eq!(config.transcoder, TranscoderKind::Passthrough);
        assert!(config.rate_limit.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"port": 9000, "retry": {"max_attempts": 5}, "transcoder": "ffmpeg"}"#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.transcoder, TranscoderKind::Ffmpeg);
        assert_eq!(config.job_timeout_secs, 600);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.max_concurrent_downloads = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.base_delay_ms = 20_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.public_base_url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rate_limit = RateLimitConfig { enabled: false, per_second: 0, burst_size: 0 };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retention_is_bounded() {
        let mut config = Config::default();
        config.retention_hours = MAX_RETENTION_HOURS;
        assert!(config.validate().is_ok());

        config.retention_hours = 3_000_000_000;
        assert!(config.validate().is_err());

        config.retention_hours = u64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(config.retention(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let missing = Config::load_from(&path).unwrap();
        assert_eq!(missing, Config::default());

        let mut config = Config::default();
        config.port = 9191;
        config.catalog_path = Some(dir.path().join("catalog.json"));
        config.save(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);

        fs::write(&path, "{ broken").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_derived_settings() {
        let config = Config::default();
        assert_eq!(config.socket_addr().unwrap().port(), 8080);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.manager_config().job_timeout, Duration::from_secs(600));
        assert_eq!(config.worker_settings().progress_interval, Duration::from_millis(250));
    }
}
