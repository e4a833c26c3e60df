//! Prometheus metrics for nodeprobe
//!
//! Collected once per run and optionally written in the text exposition
//! format for the node-exporter textfile collector.

use std::path::Path;

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_gauge_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Encoder, GaugeVec, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};

/// Duration of each probe section
static PROBE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "nodeprobe_probe_duration_seconds",
        "Duration of each probe section",
        &["section"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("Failed to create probe_duration metric")
});

/// Failed command counter
static COMMAND_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("nodeprobe_command_failures_total", "Total number of failed commands"),
        &["executable"]
    )
    .expect("Failed to create command_failures metric")
});

/// Measured benchmark bandwidth
static BENCHMARK_BANDWIDTH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("nodeprobe_benchmark_bandwidth_gbps", "Measured benchmark bandwidth in GB/s"),
        &["direction"]
    )
    .expect("Failed to create benchmark_bandwidth metric")
});

/// Recommended cache budget
static RECOMMENDED_CACHE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("nodeprobe_recommended_cache_gb", "Recommended LMCache budget in GB"),
        &["tier"]
    )
    .expect("Failed to create recommended_cache metric")
});

/// Number of GPUs detected
static GPU_COUNT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("nodeprobe_gpu_count", "Number of GPUs detected"))
        .expect("Failed to create gpu_count metric")
});

/// Metrics registry wrapper
#[derive(Debug, Clone, Copy)]
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*PROBE_DURATION;
        let _ = &*COMMAND_FAILURES;
        let _ = &*BENCHMARK_BANDWIDTH;
        let _ = &*RECOMMENDED_CACHE;
        let _ = &*GPU_COUNT;
        Self
    }

    /// Record how long a probe section took
    pub fn observe_probe_duration(&self, section: &str, duration_secs: f64) {
        PROBE_DURATION
            .with_label_values(&[section])
            .observe(duration_secs);
    }

    /// Increment the failure counter for an executable
    pub fn inc_command_failure(&self, executable: &str) {
        COMMAND_FAILURES.with_label_values(&[executable]).inc();
    }

    /// Set a measured benchmark bandwidth
    pub fn set_benchmark_bandwidth(&self, direction: &str, gbps: f64) {
        BENCHMARK_BANDWIDTH
            .with_label_values(&[direction])
            .set(gbps);
    }

    /// Set a recommended cache budget
    pub fn set_recommended_cache(&self, tier: &str, gb: f64) {
        RECOMMENDED_CACHE.with_label_values(&[tier]).set(gb);
    }

    /// Set GPU count
    pub fn set_gpu_count(&self, count: i64) {
        GPU_COUNT.set(count);
    }

    /// Render all registered metrics in the text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Write the text exposition to a file
    pub fn write_textfile(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.render())
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
