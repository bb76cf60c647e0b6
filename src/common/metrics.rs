//! Coordinator metrics
//!
//! Counters, gauges and a latency histogram rendered in the Prometheus text
//! format. The registry is owned by the coordinator and handed to whatever
//! needs to record into it; there is no process-wide instance.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 30000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored as thousandths for precision
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64() * 1000.0);
    }

    /// Cumulative bucket counts, ending with the +Inf bucket
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Coordinator metrics registry
#[derive(Debug)]
pub struct Metrics {
    pub uploads_total: Counter,
    pub uploads_failed: Counter,
    pub downloads_total: Counter,
    pub downloads_failed: Counter,
    pub bytes_uploaded: Counter,
    pub bytes_downloaded: Counter,
    pub chunks_written: Counter,
    pub replica_write_failures: Counter,
    pub replica_read_failures: Counter,
    pub read_fallbacks: Counter,
    pub read_repairs: Counter,
    pub chunks_collected: Counter,

    pub live_nodes: Gauge,
    pub ring_nodes: Gauge,

    pub upload_latency: Histogram,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            uploads_total: Counter::new(),
            uploads_failed: Counter::new(),
            downloads_total: Counter::new(),
            downloads_failed: Counter::new(),
            bytes_uploaded: Counter::new(),
            bytes_downloaded: Counter::new(),
            chunks_written: Counter::new(),
            replica_write_failures: Counter::new(),
            replica_read_failures: Counter::new(),
            read_fallbacks: Counter::new(),
            read_repairs: Counter::new(),
            chunks_collected: Counter::new(),
            live_nodes: Gauge::new(),
            ring_nodes: Gauge::new(),
            upload_latency: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 12] = [
            ("uploads_total", "Uploads started", &self.uploads_total),
            ("uploads_failed_total", "Uploads that failed", &self.uploads_failed),
            ("downloads_total", "Downloads started", &self.downloads_total),
            ("downloads_failed_total", "Downloads that failed", &self.downloads_failed),
            ("bytes_uploaded_total", "File bytes accepted", &self.bytes_uploaded),
            ("bytes_downloaded_total", "File bytes served", &self.bytes_downloaded),
            ("chunk_replicas_written_total", "Chunk replica writes acknowledged", &self.chunks_written),
            ("replica_write_failures_total", "Failed replica write attempts", &self.replica_write_failures),
            ("replica_read_failures_total", "Failed replica read attempts", &self.replica_read_failures),
            ("read_fallbacks_total", "Reads that fell back to fresh ring candidates", &self.read_fallbacks),
            ("read_repairs_total", "Replicas rewritten by read repair", &self.read_repairs),
            ("chunks_collected_total", "Superseded chunk objects deleted", &self.chunks_collected),
        ];

        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP distsync_{} {}", name, help);
            let _ = writeln!(out, "# TYPE distsync_{} counter", name);
            let _ = writeln!(out, "distsync_{} {}", name, counter.get());
        }

        let gauges: [(&str, &str, u64); 3] = [
            ("live_nodes", "Storage nodes currently live", self.live_nodes.get()),
            ("ring_nodes", "Storage nodes on the ring", self.ring_nodes.get()),
            ("uptime_seconds", "Coordinator uptime in seconds", self.uptime_seconds()),
        ];

        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP distsync_{} {}", name, help);
            let _ = writeln!(out, "# TYPE distsync_{} gauge", name);
            let _ = writeln!(out, "distsync_{} {}", name, value);
        }

        out.push_str("# HELP distsync_upload_duration_ms Upload duration in milliseconds\n");
        out.push_str("# TYPE distsync_upload_duration_ms histogram\n");
        for (le, count) in self.upload_latency.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "distsync_upload_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "distsync_upload_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "distsync_upload_duration_ms_sum {}", self.upload_latency.sum());
        let _ = writeln!(out, "distsync_upload_duration_ms_count {}", self.upload_latency.count());

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
