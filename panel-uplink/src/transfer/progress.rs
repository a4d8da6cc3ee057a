//! Byte-level progress tracking for archive uploads.

use std::time::{Duration, Instant};

/// Progress of a single streamed upload.
#[derive(Debug, Clone)]
pub struct UploadProgress {
    /// Archive size, when the source reported one
    pub total_bytes: Option<u64>,

    /// Bytes read from the archive so far
    pub transferred_bytes: u64,

    /// Speed over the last measurement window, in bytes/second
    pub bytes_per_second: u64,

    started_at: Instant,
    last_update: Instant,
    last_bytes: u64,
}

impl UploadProgress {
    pub fn new(total_bytes: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            total_bytes,
            transferred_bytes: 0,
            bytes_per_second: 0,
            started_at: now,
            last_update: now,
            last_bytes: 0,
        }
    }

    /// Record the running byte count and refresh the speed estimate.
    pub fn update(&mut self, transferred_bytes: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        if elapsed > 0.0 {
            let bytes_diff = transferred_bytes.saturating_sub(self.last_bytes);
            self.bytes_per_second = (bytes_diff as f64 / elapsed) as u64;
        }
        self.transferred_bytes = transferred_bytes;
        self.last_update = now;
        self.last_bytes = transferred_bytes;
    }

    /// Percentage complete, if the total is known.
    pub fn percent_complete(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) | None => None,
            Some(total) => Some((self.transferred_bytes as f64 / total as f64) * 100.0),
        }
    }

    /// Estimated seconds remaining, if both total and speed are known.
    pub fn eta_seconds(&self) -> Option<u64> {
        let total = self.total_bytes?;
        if self.bytes_per_second == 0 {
            return None;
        }
        Some(total.saturating_sub(self.transferred_bytes) / self.bytes_per_second)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// One-line human readable summary.
    pub fn describe(&self) -> String {
        let mut line = format!(
            "{} at {}",
            format_bytes(self.transferred_bytes),
            format_speed(self.bytes_per_second)
        );
        if let Some(percent) = self.percent_complete() {
            line.push_str(&format!(" ({:.1}%)", percent));
        }
        if let Some(eta) = self.eta_seconds() {
            line.push_str(&format!(", {} left", format_duration(eta)));
        }
        line
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
