//! Per-session transfer statistics.
//!
//! Collected while a session runs and logged when it closes.

use std::time::{Duration, Instant};

/// Counters for one session
#[derive(Debug, Clone)]
pub struct TransferStats {
    started: Instant,

    /// Files that reached Complete
    pub files_completed: usize,

    /// Files that ended in Error
    pub files_failed: usize,

    /// Payload bytes written or sent
    pub bytes_transferred: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            files_completed: 0,
            files_failed: 0,
            bytes_transferred: 0,
        }
    }

    pub fn record_file(&mut self, bytes: u64) {
        self.files_completed += 1;
        self.bytes_transferred += bytes;
    }

    pub fn record_failure(&mut self) {
        self.files_failed += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Get average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.bytes_transferred as f64 / elapsed) as u64
        } else {
            0
        }
    }

    /// One-line summary for the close log
    pub fn summary(&self) -> String {
        format!(
            "{} files ({} failed), {} in {} at {}",
            self.files_completed,
            self.files_failed,
            format_bytes(self.bytes_transferred),
            format_duration(self.elapsed().as_secs()),
            format_speed(self.average_speed())
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
