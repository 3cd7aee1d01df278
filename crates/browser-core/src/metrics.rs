//! Per-request metrics, flushed as InfluxDB line-protocol text.
//!
//! Grounded on `original_source/backend-server/app/util/influx.py`
//! (`ResponseMetrics`, `send_to_telegraf`): the counter set and the line
//! formats are kept verbatim; the raw TCP socket write is replaced by a
//! `MetricsSink` trait so tests can assert on formatted lines without a
//! network round-trip, matching the `CacheDriver` seam in
//! [`crate::cache`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

/// Where formatted line-protocol text goes. The production impl opens a
/// short-lived TCP connection to Telegraf per flush, exactly as the
/// original does; a discarded send is logged, never propagated.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn send(&self, lines: &str);
}

/// Sink that drops everything; the zero-configuration default.
pub struct NullMetricsSink;

#[async_trait]
impl MetricsSink for NullMetricsSink {
    async fn send(&self, _lines: &str) {}
}

/// Per-request counters for one `(channel, priority)` request, accumulated
/// across its sub-requests and flushed once at the end of
/// [`crate::engine::PacketEngine::process`].
#[derive(Default)]
pub struct ResponseMetrics {
    pub priority: String,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_hits_bytes: AtomicU64,
    cache_misses_bytes: AtomicU64,
    count_packets: AtomicU64,
    // (endpoint, scale) -> (total_seconds, count)
    runtime: Mutex<BTreeMap<(String, u8), (f64, u64)>>,
}

impl ResponseMetrics {
    pub fn new(priority: impl Into<String>) -> Self {
        Self {
            priority: priority.into(),
            ..Default::default()
        }
    }

    pub fn record_cache_hit(&self, bytes: u64) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.cache_hits_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self, bytes: u64) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.cache_misses_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_packet(&self) {
        self.count_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_runtime(&self, endpoint: &str, scale: u8, seconds: f64) {
        let mut runtime = self.runtime.lock().unwrap();
        let entry = runtime.entry((endpoint.to_string(), scale)).or_insert((0.0, 0));
        entry.0 += seconds;
        entry.1 += 1;
    }

    /// Render the accumulated counters as line-protocol text. Ratios are
    /// `0` when their denominator is `0`, matching the original's guard.
    pub fn to_line_protocol(&self) -> String {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let hits_bytes = self.cache_hits_bytes.load(Ordering::Relaxed);
        let misses_bytes = self.cache_misses_bytes.load(Ordering::Relaxed);
        let total = hits + misses;
        let total_bytes = hits_bytes + misses_bytes;
        let ratio = if total > 0 { hits as f64 / total as f64 } else { 0.0 };
        let ratio_bytes = if total_bytes > 0 {
            hits_bytes as f64 / total_bytes as f64
        } else {
            0.0
        };

        let mut lines = String::new();
        lines.push_str(&format!(
            "memcache,priority={} hits={},misses={},ratio_memcached={},hits_bytes={},misses_bytes={},ratio_memcached_bytes={}\n",
            self.priority, hits, misses, ratio, hits_bytes, misses_bytes, ratio_bytes,
        ));
        lines.push_str(&format!(
            "packets-per-request,priority={} count={}\n",
            self.priority,
            self.count_packets.load(Ordering::Relaxed),
        ));
        for ((name, scale), (total_seconds, count)) in self.runtime.lock().unwrap().iter() {
            let avg = total_seconds / *count as f64;
            lines.push_str(&format!("be-runtime,name={name},scale={scale} runtime={avg}\n"));
        }
        lines
    }

    pub async fn flush(&self, sink: &dyn MetricsSink) {
        sink.send(&self.to_line_protocol()).await;
    }
}
