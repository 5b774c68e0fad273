// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Media fetching.
//!
//! A [`Fetcher`] downloads a source URL to a local file, reporting bytes as
//! they arrive. [`HttpFetcher`] streams the response body to disk with
//! `reqwest`; other sources plug in by implementing the trait.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::retry::ErrorKind;

/// Why a fetch or conversion attempt failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server responded with HTTP {0}")]
    Status(u16),

    #[error("unsupported media: {0}")]
    Unsupported(String),

    #[error("failed to write file: {0}")]
    Io(#[from] std::io::Error),

    #[error("conversion failed: {0}")]
    Transcode(String),

    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Classify for the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Timeout => ErrorKind::Timeout,
            FetchError::Connection(_) => ErrorKind::Connection,
            FetchError::Status(429) | FetchError::Status(503) => ErrorKind::Throttled,
            FetchError::Status(code) if (500..600).contains(code) => ErrorKind::Http5xx(*code),
            _ => ErrorKind::Other,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Connection(e.to_string())
        }
    }
}

/// Callback receiving `(bytes_downloaded, bytes_total)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Downloads a source to a local file.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url` into `dest`, returning the number of bytes written.
    ///
    /// Implementations must return [`FetchError::Cancelled`] promptly once
    /// `cancel` fires.
    async fn fetch(
        &self,
        url: &Url,
        dest: &Path,
        cancel: &CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64, FetchError>;
}

/// Streams HTTP(S) responses to disk.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("music-downloader/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &Url,
        dest: &Path,
        cancel: &CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64, FetchError> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = self.client.get(url.as_str()).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if let Some(content_type) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if content_type.starts_with("text/html") {
                return Err(FetchError::Unsupported(format!(
                    "source returned a web page ({}), not an audio file",
                    content_type
                )));
            }
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total);
        }

        file.flush().await?;
        file.sync_all().await?;

        if downloaded == 0 {
            return Err(FetchError::Unsupported("source returned an empty body".to_string()));
        }
        if let Some(total) = total {
            if downloaded < total {
                return Err(FetchError::Connection(format!(
                    "body ended early ({} of {} bytes)",
                    downloaded, total
                )));
            }
        }

        tracing::debug!(url = %url, bytes = downloaded, "Fetch finished");
        Ok(downloaded)
    }
}
