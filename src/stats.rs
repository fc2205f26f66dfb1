//! Stats & Admin (C9): live counters and the rolling throughput window
//! behind `GET /api/stats` (spec §4.8, §6.3).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::active::ActiveRequests;
use crate::cache::Caches;

const WINDOW: Duration = Duration::from_secs(10);

pub struct Stats {
    start_at: Instant,
    total_requests: AtomicU64,
    total_bytes: AtomicU64,
    range_requests: AtomicU64,
    window: Mutex<VecDeque<(Instant, u64)>>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            start_at: Instant::now(),
            total_requests: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            range_requests: AtomicU64::new(0),
            window: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_request(&self, is_range: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if is_range {
            self.range_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Called for every chunk written to a client (spec §4.6.2 "every
    /// chunk updates the throughput meter").
    pub fn record_bytes(&self, n: u64) {
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
        let now = Instant::now();
        let mut window = self.window.lock();
        window.push_back((now, n));
        while let Some((ts, _)) = window.front() {
            if now.duration_since(*ts) > WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes/sec averaged over whatever portion of the 10s window has
    /// elapsed so far.
    fn current_speed(&self) -> f64 {
        let window = self.window.lock();
        if window.is_empty() {
            return 0.0;
        }
        let span = window
            .back()
            .unwrap()
            .0
            .duration_since(window.front().unwrap().0)
            .as_secs_f64()
            .max(1.0 / 1000.0);
        let total: u64 = window.iter().map(|(_, b)| b).sum();
        (total as f64) / span
    }

    pub fn snapshot(&self, active: &ActiveRequests, caches: &Caches) -> StatsSnapshot {
        let speed = self.current_speed();
        let total_bytes = self.total_bytes.load(Ordering::Relaxed);
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            active_requests: active.len() as u64,
            total_bytes_transferred: total_bytes,
            current_speed: speed,
            range_requests: self.range_requests.load(Ordering::Relaxed),
            uptime: self.start_at.elapsed().as_millis() as u64,
            formatted_speed: format_bytes_per_sec(speed),
            formatted_total: format_bytes(total_bytes),
            cache: CacheSnapshot {
                metadata_entries: caches.metadata.len() as u64,
                redirect_entries: caches.redirect.len() as u64,
                segment_entries: caches.segments.entry_count() as u64,
                segment_bytes: caches.segments.size_bytes(),
                hit_rate: caches.segments.hit_rate(),
            },
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
pub struct CacheSnapshot {
    #[serde(rename = "metadataEntries")]
    pub metadata_entries: u64,
    #[serde(rename = "redirectEntries")]
    pub redirect_entries: u64,
    #[serde(rename = "segmentEntries")]
    pub segment_entries: u64,
    #[serde(rename = "segmentBytes")]
    pub segment_bytes: u64,
    #[serde(rename = "hitRate")]
    pub hit_rate: f64,
}

#[derive(Serialize)]
pub struct StatsSnapshot {
    #[serde(rename = "totalRequests")]
    pub total_requests: u64,
    #[serde(rename = "activeRequests")]
    pub active_requests: u64,
    #[serde(rename = "totalBytesTransferred")]
    pub total_bytes_transferred: u64,
    #[serde(rename = "currentSpeed")]
    pub current_speed: f64,
    #[serde(rename = "rangeRequests")]
    pub range_requests: u64,
    pub uptime: u64,
    #[serde(rename = "formattedSpeed")]
    pub formatted_speed: String,
    #[serde(rename = "formattedTotal")]
    pub formatted_total: String,
    pub cache: CacheSnapshot,
}

fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

fn format_bytes_per_sec(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active::ActiveRequests;
    use crate::cache::Caches;
    use std::time::Duration;

    #[test]
    fn snapshot_reflects_recorded_bytes_and_requests() {
        let stats = Stats::new();
        stats.record_request(true);
        stats.record_bytes(1024);
        let active = ActiveRequests::new();
        let caches = Caches::new(
            Duration::from_secs(300),
            Duration::from_secs(600),
            Duration::from_secs(120),
            2 * 1024 * 1024,
            500 * 1024 * 1024,
        );
        let snap = stats.snapshot(&active, &caches);
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.range_requests, 1);
        assert_eq!(snap.total_bytes_transferred, 1024);
    }

    #[test]
    fn format_bytes_uses_binary_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
    }
}
