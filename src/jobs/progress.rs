// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Throttled progress reporting from a worker into the job store.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::store::JobStore;
use super::types::JobId;

/// Share of the progress bar spent downloading; the rest covers conversion.
pub const DOWNLOAD_SHARE: u8 = 90;

#[derive(Debug, Default)]
struct ReporterState {
    last_percent: u8,
    last_write: Option<Instant>,
}

/// Writes progress for one job, at most once per `min_interval`.
///
/// A regular update is written only when the percentage increased; forced
/// updates always go through.
pub struct ProgressReporter {
    store: Arc<JobStore>,
    id: JobId,
    min_interval: Duration,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(store: Arc<JobStore>, id: JobId, min_interval: Duration) -> Self {
        Self {
            store,
            id,
            min_interval,
            state: Mutex::new(ReporterState::default()),
        }
    }

    /// Report progress, dropping the update if the last write was too recent.
    ///
    /// Returns true if the store was updated.
    pub fn report(&self, percent: u8, message: &str) -> bool {
        self.write(percent, message, false)
    }

    /// Report progress immediately (phase changes, retries).
    pub fn force(&self, percent: u8, message: &str) -> bool {
        self.write(percent, message, true)
    }

    /// Last percentage written to the store.
    pub fn last_percent(&self) -> u8 {
        self.lock().last_percent
    }

    /// Report download progress in bytes.
    pub fn report_bytes(&self, downloaded: u64, total: Option<u64>) -> bool {
        let percent = download_percent(downloaded, total).max(self.last_percent());
        let message = match total {
            Some(total) => format!("Downloading: {} of {}", format_bytes(downloaded), format_bytes(total)),
            None => format!("Downloading: {}", format_bytes(downloaded)),
        };
        self.report(percent, &message)
    }

    fn write(&self, percent: u8, message: &str, force: bool) -> bool {
        let mut state = self.lock();

        if !force {
            if percent <= state.last_percent {
                return false;
            }
            if let Some(last) = state.last_write {
                if last.elapsed() < self.min_interval {
                    return false;
                }
            }
        }

        match self.store.update_progress(&self.id, percent, message) {
            Ok(effective) => {
                state.last_percent = effective;
                state.last_write = Some(Instant::now());
                true
            }
            Err(e) => {
                tracing::debug!(job_id = %self.id, error = %e, "Progress update rejected");
                false
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReporterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Map downloaded bytes onto the download share of the progress bar.
pub fn download_percent(downloaded: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => {
            let scaled = downloaded.min(total) as u128 * DOWNLOAD_SHARE as u128 / total as u128;
            scaled as u8
        }
        _ => 0,
    }
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
