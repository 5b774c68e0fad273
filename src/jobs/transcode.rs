// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Conversion of a fetched file into the requested output format.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::fetcher::FetchError;
use super::types::{AudioFormat, Quality};

/// Input and output of one conversion.
#[derive(Debug, Clone, Copy)]
pub struct TranscodeRequest<'a> {
    /// Fetched file; the transcoder may consume it
    pub input: &'a Path,
    pub output: &'a Path,
    /// Format guessed from the source URL, if any
    pub source_format: Option<AudioFormat>,
    pub format: AudioFormat,
    pub quality: Quality,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Produce `request.output` from `request.input`.
    async fn transcode(&self, request: &TranscodeRequest<'_>) -> Result<(), FetchError>;

    fn name(&self) -> &'static str;
}

/// Stores the fetched bytes as-is.
///
/// Refuses requests whose source is recognisably a different format, since
/// it cannot convert between them.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTranscoder;

#[async_trait]
impl Transcoder for PassthroughTranscoder {
    async fn transcode(&self, request: &TranscodeRequest<'_>) -> Result<(), FetchError> {
        if let Some(source) = request.source_format {
            if source != request.format {
                return Err(FetchError::Unsupported(format!(
                    "cannot convert {} to {} without a transcoder (set \"transcoder\": \"ffmpeg\")",
                    source, request.format
                )));
            }
        }
        tokio::fs::rename(request.input, request.output).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

/// Converts with an external `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn codec_args(format: AudioFormat, quality: Quality) -> Vec<String> {
        let codec = match format {
            AudioFormat::Mp3 => "libmp3lame",
            AudioFormat::Wav => "pcm_s16le",
            AudioFormat::M4a => "aac",
            AudioFormat::Flac => "flac",
            AudioFormat::Ogg => "libvorbis",
        };
        let mut args = vec!["-c:a".to_string(), codec.to_string()];
        if !format.is_lossless() {
            args.push("-b:a".to_string());
            args.push(format!("{}k", quality.bitrate_kbps()));
        }
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, request: &TranscodeRequest<'_>) -> Result<(), FetchError> {
        let output = tokio::process::Command::new(&self.binary)
            .args(["-y", "-hide_banner", "-loglevel", "error", "-i"])
            .arg(request.input)
            .arg("-vn")
            .args(Self::codec_args(request.format, request.quality))
            .arg(request.output)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    FetchError::Transcode(format!("{} not found", self.binary.display()))
                } else {
                    FetchError::Io(e)
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().last().unwrap_or("no output").trim().to_string();
            return Err(FetchError::Transcode(format!("ffmpeg exited with {}: {}", output.status, detail)));
        }

        if let Err(e) = tokio::fs::remove_file(request.input).await {
            tracing::debug!(error = %e, "Could not remove transcoder input");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passthrough_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("job.part");
        let output = dir.path().join("job.mp3");
        tokio::fs::write(&input, b"ID3 data").await.unwrap();

        PassthroughTranscoder
            .transcode(&TranscodeRequest {
                input: &input,
                output: &output,
                source_format: Some(AudioFormat::Mp3),
                format: AudioFormat::Mp3,
                quality: Quality::Highest,
            })
            .await
            .unwrap();

        assert!(!input.exists());
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"ID3 data");
    }

    #[tokio::test]
    async fn test_passthrough_refuses_format_change() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("job.part");
        tokio::fs::write(&input, b"fLaC").await.unwrap();

        let err = PassthroughTranscoder
            .transcode(&TranscodeRequest {
                input: &input,
                output: &dir.path().join("job.mp3"),
                source_format: Some(AudioFormat::Flac),
                format: AudioFormat::Mp3,
                quality: Quality::Highest,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unsupported(_)));
    }

    #[test]
    fn test_ffmpeg_codec_args() {
        assert_eq!(
            FfmpegTranscoder::codec_args(AudioFormat::Mp3, Quality::Medium),
            vec!["-c:a", "libmp3lame", "-b:a", "192k"]
        );
        assert_eq!(
            FfmpegTranscoder::codec_args(AudioFormat::Flac, Quality::Low),
            vec!["-c:a", "flac"]
        );
    }

    #[tokio::test]
    async fn test_ffmpeg_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("job.part");
        tokio::fs::write(&input, b"x").await.unwrap();

        let err = FfmpegTranscoder::new("/nonexistent/ffmpeg-binary")
            .transcode(&TranscodeRequest {
                input: &input,
                output: &dir.path().join("job.ogg"),
                source_format: None,
                format: AudioFormat::Ogg,
                quality: Quality::Low,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transcode(_)));
    }
}
