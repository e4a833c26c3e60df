//! Storage benchmarks
//!
//! fio measures the CPU <-> disk paths; the GPU Direct Storage benchmark
//! measures GPU <-> disk through the [`DirectStorage`] capability. Scratch
//! resources are RAII guards so they are removed on every exit path.

mod fio;
mod gds;
mod mock;
mod scratch;

pub use fio::{fio_command, parse_fio_output, run_fio, FioMode, FioProfile};
pub use gds::{
    run_gds_benchmark, Capability, DirectStorage, GdsConfig, GdsError, GdsOutcome, GdsSession,
    DISABLED, LIBRARY_UNAVAILABLE, NO_DEVICE,
};
pub use mock::MockDirectStorage;
pub use scratch::{is_single_component, ScratchDir, ScratchFile};

use std::fmt;

use crate::metrics::MetricsRegistry;
use crate::report::Measured;

/// Transfer direction of a benchmark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// fio sequential read
    DiskToCpu,
    /// fio sequential write
    CpuToDisk,
    /// cuFile write from device memory
    GpuToDisk,
    /// cuFile read into device memory
    DiskToGpu,
}

impl Direction {
    /// Report label, e.g. `Disk -> CPU`
    pub fn label(&self) -> &'static str {
        match self {
            Direction::DiskToCpu => "Disk -> CPU",
            Direction::CpuToDisk => "CPU -> Disk",
            Direction::GpuToDisk => "GPU -> Disk",
            Direction::DiskToGpu => "Disk -> GPU",
        }
    }

    /// Report key of the bandwidth metric
    pub fn bandwidth_key(&self) -> String {
        format!("{} BW (GB/s)", self.label())
    }

    /// Report key of the IOPS metric
    pub fn iops_key(&self) -> String {
        format!("{} IOPS", self.label())
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Bandwidth and IOPS of one benchmark direction
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkResult {
    pub direction: Direction,
    pub bandwidth_gbps: Measured<f64>,
    pub iops: Measured<u64>,
}

impl BenchmarkResult {
    /// Create a result
    pub fn new(direction: Direction, bandwidth_gbps: Measured<f64>, iops: Measured<u64>) -> Self {
        Self {
            direction,
            bandwidth_gbps,
            iops,
        }
    }

    /// Both metrics failed, optionally naming the failure kind
    pub fn failed(direction: Direction, kind: Option<&str>) -> Self {
        let kind = kind.map(String::from);
        Self::new(
            direction,
            Measured::Failed(kind.clone()),
            Measured::Failed(kind),
        )
    }

    /// Both metrics unavailable for the same reason
    pub fn unavailable(direction: Direction, reason: &str) -> Self {
        Self::new(
            direction,
            Measured::unavailable(reason),
            Measured::unavailable(reason),
        )
    }

    /// Export the bandwidth gauge when it was measured
    pub fn record_metrics(&self, metrics: &MetricsRegistry) {
        if let Some(gbps) = self.bandwidth_gbps.known() {
            metrics.set_benchmark_bandwidth(self.direction.label(), *gbps);
        }
    }
}
