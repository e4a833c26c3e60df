//! GPU Direct Storage benchmark
//!
//! The benchmark only sees the [`DirectStorage`] capability probe. A backend
//! that cannot load its libraries or find a device reports `Unavailable`
//! with a reason that is applied to all four GDS metrics.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::scratch::ScratchFile;
use super::{BenchmarkResult, Direction};
use crate::bandwidth::round2;
use crate::report::Measured;

/// The cuFile or CUDA runtime library could not be loaded
pub const LIBRARY_UNAVAILABLE: &str = "cufile or CUDA runtime unavailable";
/// No usable CUDA device
pub const NO_DEVICE: &str = "No CUDA GPU detected";
/// Disabled in configuration
pub const DISABLED: &str = "GDS benchmark disabled";

/// Errors raised by a GDS backend
#[derive(Debug, Error)]
pub enum GdsError {
    #[error("failed to load library: {0}")]
    Library(String),

    #[error("{call} returned CUDA error {code}")]
    Cuda { call: &'static str, code: i32 },

    #[error("{call} returned cuFile error {code}")]
    Cufile { call: &'static str, code: i64 },

    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: i64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no device buffer allocated")]
    NoBuffer,
}

impl GdsError {
    /// Short failure kind used in `Failed (<kind>)`
    pub fn kind(&self) -> &'static str {
        match self {
            GdsError::Library(_) => "LibraryError",
            GdsError::Cuda { .. } => "CudaError",
            GdsError::Cufile { .. } => "CufileError",
            GdsError::ShortTransfer { .. } => "ShortTransfer",
            GdsError::Io(_) => "IoError",
            GdsError::NoBuffer => "NoBuffer",
        }
    }
}

/// An open GDS context with one device-resident buffer
///
/// Transfer timings cover only the transfer, bracketed by device
/// synchronisation.
pub trait GdsSession: Send {
    /// Allocate and register a device buffer of `size` bytes
    fn allocate(&mut self, size: usize) -> Result<(), GdsError>;

    /// Clear the device buffer
    fn zero(&mut self) -> Result<(), GdsError>;

    /// Write the buffer to `path` with direct I/O
    fn write(&mut self, path: &Path, size: usize) -> Result<Duration, GdsError>;

    /// Read `path` into the buffer with direct I/O
    fn read(&mut self, path: &Path, size: usize) -> Result<Duration, GdsError>;
}

/// Result of a capability probe
pub enum Capability {
    Available(Box<dyn GdsSession>),
    Unavailable(String),
}

/// Optional GPU Direct Storage capability
pub trait DirectStorage: Send + Sync {
    /// Check library and device availability, opening a session on success
    fn probe(&self) -> Capability;
}

/// GDS benchmark configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GdsConfig {
    pub enabled: bool,
    /// Device buffer and backing file size in bytes
    pub file_size: usize,
    /// Block size used to derive IOPS from bandwidth
    pub block_size: usize,
    /// Backing file name, created under the benchmark mountpoint
    pub file_name: String,
}

impl Default for GdsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file_size: 256 * 1024 * 1024,
            block_size: 4 * 1024 * 1024,
            file_name: "gds_testfile.bin".to_string(),
        }
    }
}

/// Both GDS directions and whether the capability was available
#[derive(Debug, Clone, PartialEq)]
pub struct GdsOutcome {
    pub enabled: bool,
    pub write: BenchmarkResult,
    pub read: BenchmarkResult,
}

impl GdsOutcome {
    /// All four metrics carry the same reason
    pub fn unavailable(reason: &str) -> Self {
        Self {
            enabled: false,
            write: BenchmarkResult::unavailable(Direction::GpuToDisk, reason),
            read: BenchmarkResult::unavailable(Direction::DiskToGpu, reason),
        }
    }

    /// Both directions failed with the same kind
    pub fn failed(enabled: bool, kind: &str) -> Self {
        Self {
            enabled,
            write: BenchmarkResult::failed(Direction::GpuToDisk, Some(kind)),
            read: BenchmarkResult::failed(Direction::DiskToGpu, Some(kind)),
        }
    }
}

/// Bandwidth (decimal GB/s) and block-normalised IOPS of a timed transfer
///
/// IOPS is bandwidth divided by the block size, not a counted operation rate.
pub fn throughput(bytes: usize, block_size: usize, elapsed: Duration) -> (Measured<f64>, Measured<u64>) {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || block_size == 0 {
        return (Measured::Unknown, Measured::Unknown);
    }
    let bytes_per_sec = bytes as f64 / secs;
    (
        Measured::Known(round2(bytes_per_sec / 1e9)),
        Measured::Known((bytes_per_sec / block_size as f64) as u64),
    )
}

fn measure(
    direction: Direction,
    transfer: Result<Duration, GdsError>,
    config: &GdsConfig,
) -> BenchmarkResult {
    match transfer {
        Ok(elapsed) => {
            let (bandwidth, iops) = throughput(config.file_size, config.block_size, elapsed);
            info!(
                direction = %direction,
                elapsed = ?elapsed,
                bandwidth_gbps = %bandwidth,
                "GDS transfer complete"
            );
            BenchmarkResult::new(direction, bandwidth, iops)
        }
        Err(e) => {
            warn!(direction = %direction, error = %e, "GDS transfer failed");
            BenchmarkResult::failed(direction, Some(e.kind()))
        }
    }
}

/// Run the GPU -> Disk write and Disk -> GPU read benchmark in `directory`
///
/// Blocking; callers on the async runtime use `spawn_blocking`. A failure in
/// one direction does not prevent the other from running. The backing file
/// is removed on every exit path.
pub fn run_gds_benchmark(
    storage: &dyn DirectStorage,
    directory: &Path,
    config: &GdsConfig,
) -> GdsOutcome {
    if !config.enabled {
        return GdsOutcome::unavailable(DISABLED);
    }

    let mut session = match storage.probe() {
        Capability::Available(session) => session,
        Capability::Unavailable(reason) => {
            info!(reason = %reason, "GPU Direct Storage unavailable");
            return GdsOutcome::unavailable(&reason);
        }
    };

    if let Err(e) = session.allocate(config.file_size) {
        warn!(size = config.file_size, error = %e, "GDS buffer allocation failed");
        return GdsOutcome::failed(true, e.kind());
    }

    let path = directory.join(&config.file_name);
    let _backing = match ScratchFile::create(&path, config.file_size as u64) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not create GDS backing file");
            return GdsOutcome::failed(true, GdsError::Io(e).kind());
        }
    };

    let write = measure(
        Direction::GpuToDisk,
        session.write(&path, config.file_size),
        config,
    );

    if let Err(e) = session.zero() {
        warn!(error = %e, "Could not clear GDS buffer before read");
    }

    let read = measure(
        Direction::DiskToGpu,
        session.read(&path, config.file_size),
        config,
    );

    GdsOutcome {
        enabled: true,
        write,
        read,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::MockDirectStorage;

    #[test]
    fn test_error_kinds() {
        assert_eq!(GdsError::Cuda { call: "cudaMalloc", code: 2 }.kind(), "CudaError");
        assert_eq!(
            GdsError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied)).kind(),
            "IoError"
        );
        assert_eq!(GdsError::NoBuffer.kind(), "NoBuffer");
    }

    #[test]
    fn test_throughput() {
        let (bandwidth, iops) = throughput(
            256 * 1024 * 1024,
            4 * 1024 * 1024,
            Duration::from_millis(125),
        );
        assert_eq!(bandwidth, Measured::Known(2.15));
        assert_eq!(iops, Measured::Known(512));

        let (bandwidth, iops) = throughput(1024, 4096, Duration::ZERO);
        assert_eq!(bandwidth, Measured::Unknown);
        assert_eq!(iops, Measured::Unknown);
    }

    #[test]
    fn test_library_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MockDirectStorage::unavailable(LIBRARY_UNAVAILABLE);

        let outcome = run_gds_benchmark(&storage, dir.path(), &GdsConfig::default());

        assert!(!outcome.enabled);
        for value in [
            outcome.write.bandwidth_gbps.to_string(),
            outcome.write.iops.to_string(),
            outcome.read.bandwidth_gbps.to_string(),
            outcome.read.iops.to_string(),
        ] {
            assert_eq!(value, "cufile or CUDA runtime unavailable");
        }
    }

    #[test]
    fn test_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = GdsConfig {
            enabled: false,
            ..GdsConfig::default()
        };

        let outcome = run_gds_benchmark(&MockDirectStorage::new(), dir.path(), &config);

        assert_eq!(outcome, GdsOutcome::unavailable(DISABLED));
    }

    #[test]
    fn test_benchmark_measures_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MockDirectStorage::new().with_elapsed(Duration::from_millis(125));

        let outcome = run_gds_benchmark(&storage, dir.path(), &GdsConfig::default());

        assert!(outcome.enabled);
        assert_eq!(outcome.write.bandwidth_gbps, Measured::Known(2.15));
        assert_eq!(outcome.read.iops, Measured::Known(512));

        let backing = dir.path().join("gds_testfile.bin");
        assert_eq!(storage.touched_paths(), vec![backing.clone(), backing.clone()]);
        assert!(!backing.exists());
    }

    #[test]
    fn test_write_failure_does_not_stop_read() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MockDirectStorage::new().with_write_failure();

        let outcome = run_gds_benchmark(&storage, dir.path(), &GdsConfig::default());

        assert_eq!(outcome.write.bandwidth_gbps.to_string(), "Failed (CufileError)");
        assert_eq!(outcome.write.iops.to_string(), "Failed (CufileError)");
        assert!(outcome.read.bandwidth_gbps.is_known());
        assert!(!dir.path().join("gds_testfile.bin").exists());
    }

    #[test]
    fn test_missing_directory_fails_both() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-mounted");

        let outcome = run_gds_benchmark(&MockDirectStorage::new(), &missing, &GdsConfig::default());

        assert!(outcome.enabled);
        assert_eq!(outcome.write.iops.to_string(), "Failed (IoError)");
        assert_eq!(outcome.read.bandwidth_gbps.to_string(), "Failed (IoError)");
    }
}
