//! Request metrics for the model server
//!
//! Lightweight, thread-safe counters shared by every connection. Tracks:
//! - Request latencies with percentiles (p50, p95, p99)
//! - Slow request detection
//! - Per-format request counts
//! - Document cache hit/miss and source load timings
//!
//! All counters are `AtomicU64`; the latency window and slow request ring
//! are bounded `VecDeque`s behind a mutex.
//!
//! ```no_run
//! use modelserver::metrics::Metrics;
//!
//! let metrics = Metrics::new();
//! metrics.record_request("binary", 15);
//!
//! let stats = metrics.snapshot();
//! println!("p50: {}ms", stats.request_p50_ms);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Rolling window of recent request latencies used for percentiles.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Only the most recent slow requests are kept.
const MAX_SLOW_REQUESTS: usize = 10;

/// Requests taking at least this long are recorded as slow.
pub const SLOW_REQUEST_THRESHOLD_MS: u64 = 100;

/// Server-wide metrics collector. Create one per server and share it in
/// an `Arc`.
pub struct Metrics {
    // ========================================================================
    // Request Metrics
    // ========================================================================
    request_count: AtomicU64,
    slow_request_count: AtomicU64,
    latencies_ms: Mutex<VecDeque<u64>>,
    /// Sum of the latencies currently in the window
    latency_sum_ms: AtomicU64,

    // ========================================================================
    // Per-format Counters
    // ========================================================================
    text_requests: AtomicU64,
    binary_requests: AtomicU64,
    failed_requests: AtomicU64,

    // ========================================================================
    // Cache and Load Metrics
    // ========================================================================
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    loads: AtomicU64,
    load_io_total_ms: AtomicU64,
    load_parse_total_ms: AtomicU64,

    // ========================================================================
    // Slow Request Tracking
    // ========================================================================
    slow_requests: Mutex<VecDeque<SlowRequest>>,

    started_at: Instant,
}

/// A request that exceeded [`SLOW_REQUEST_THRESHOLD_MS`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowRequest {
    /// "text", "binary" or "error"
    pub kind: String,
    pub duration_ms: u64,
    /// Milliseconds since metrics started
    pub timestamp_ms: u64,
}

/// Point-in-time copy of all metrics, sent over the wire for `Stats`.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub slow_request_count: u64,
    pub request_p50_ms: u64,
    pub request_p95_ms: u64,
    pub request_p99_ms: u64,
    pub request_avg_ms: u64,

    pub text_requests: u64,
    pub binary_requests: u64,
    pub failed_requests: u64,

    pub cache_hits: u64,
    pub cache_misses: u64,
    pub loads: u64,
    pub load_io_avg_ms: u64,
    pub load_parse_avg_ms: u64,

    pub recent_slow_requests: Vec<SlowRequest>,

    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Fraction of resolutions served from the cache, 0.0 when nothing
    /// has been resolved yet.
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            slow_request_count: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            latency_sum_ms: AtomicU64::new(0),
            text_requests: AtomicU64::new(0),
            binary_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            load_io_total_ms: AtomicU64::new(0),
            load_parse_total_ms: AtomicU64::new(0),
            slow_requests: Mutex::new(VecDeque::with_capacity(MAX_SLOW_REQUESTS)),
            started_at: Instant::now(),
        }
    }

    /// Record a completed request.
    ///
    /// `kind` is the output format name ("text", "binary") or "error" for
    /// requests that produced no document.
    pub fn record_request(&self, kind: &str, duration_ms: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let counter = match kind {
            "text" => &self.text_requests,
            "binary" => &self.binary_requests,
            _ => &self.failed_requests,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        {
            let mut latencies = self.latencies_ms.lock().unwrap();
            if latencies.len() >= LATENCY_WINDOW_SIZE {
                if let Some(old) = latencies.pop_front() {
                    self.latency_sum_ms.fetch_sub(old, Ordering::Relaxed);
                }
            }
            latencies.push_back(duration_ms);
            self.latency_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        }

        if duration_ms >= SLOW_REQUEST_THRESHOLD_MS {
            self.slow_request_count.fetch_add(1, Ordering::Relaxed);

            let slow = SlowRequest {
                kind: kind.to_string(),
                duration_ms,
                timestamp_ms: self.started_at.elapsed().as_millis() as u64,
            };

            let mut slow_requests = self.slow_requests.lock().unwrap();
            if slow_requests.len() >= MAX_SLOW_REQUESTS {
                slow_requests.pop_front();
            }
            slow_requests.push_back(slow);
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fresh source load (not a coalesced or cached one).
    pub fn record_load(&self, io_time: Duration, parse_time: Duration) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.load_io_total_ms
            .fetch_add(io_time.as_millis() as u64, Ordering::Relaxed);
        self.load_parse_total_ms
            .fetch_add(parse_time.as_millis() as u64, Ordering::Relaxed);
    }

    /// O(LATENCY_WINDOW_SIZE) for the percentile sort; only done on
    /// `Stats` requests.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99, avg) = {
            let latencies = self.latencies_ms.lock().unwrap();
            if latencies.is_empty() {
                (0, 0, 0, 0)
            } else {
                let mut sorted: Vec<u64> = latencies.iter().copied().collect();
                sorted.sort_unstable();

                let len = sorted.len();
                let p50 = sorted[len * 50 / 100];
                let p95 = sorted[len * 95 / 100];
                let p99 = sorted.get(len * 99 / 100).copied().unwrap_or(sorted[len - 1]);
                let avg = self.latency_sum_ms.load(Ordering::Relaxed) / len as u64;

                (p50, p95, p99, avg)
            }
        };

        let loads = self.loads.load(Ordering::Relaxed);
        let per_load = |total: &AtomicU64| {
            if loads > 0 {
                total.load(Ordering::Relaxed) / loads
            } else {
                0
            }
        };

        let recent_slow = {
            let slow = self.slow_requests.lock().unwrap();
            slow.iter().cloned().collect()
        };

        MetricsSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            slow_request_count: self.slow_request_count.load(Ordering::Relaxed),
            request_p50_ms: p50,
            request_p95_ms: p95,
            request_p99_ms: p99,
            request_avg_ms: avg,
            text_requests: self.text_requests.load(Ordering::Relaxed),
            binary_requests: self.binary_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            loads,
            load_io_avg_ms: per_load(&self.load_io_total_ms),
            load_parse_avg_ms: per_load(&self.load_parse_total_ms),
            recent_slow_requests: recent_slow,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
