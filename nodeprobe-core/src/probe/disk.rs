//! Storage benchmark orchestrator
//!
//! Picks the benchmark mountpoint from the first NVMe device, runs the fio
//! read and write benchmarks in a scratch directory, runs the GPU Direct
//! Storage benchmark beside it and reports free space at the mountpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{info, warn};

use crate::benchmark::{
    run_fio, run_gds_benchmark, BenchmarkResult, DirectStorage, Direction, FioMode, FioProfile,
    is_single_component, GdsConfig, GdsOutcome, ScratchDir,
};
use crate::command::ProbeSession;
use crate::metrics::MetricsRegistry;
use crate::report::Measured;

/// Disk probe configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Used when no matching device has a mountpoint
    pub fallback_dir: PathBuf,
    /// Scratch directory created under the mountpoint
    pub bench_subdir: String,
    /// Device name filter passed to grep
    pub device_pattern: String,
    /// fio job profile
    pub profile: FioProfile,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            fallback_dir: PathBuf::from("/tmp"),
            bench_subdir: "fio-multifile".to_string(),
            device_pattern: "nvme".to_string(),
            profile: FioProfile::default(),
        }
    }
}

impl DiskConfig {
    /// `bench_subdir` names one directory directly under the mountpoint
    pub fn bench_subdir_is_valid(&self) -> bool {
        is_single_component(&self.bench_subdir)
    }

    fn lsblk_command(&self) -> String {
        format!(
            "lsblk -o NAME,HCTL,SIZE,MOUNTPOINT,MODEL | grep {}",
            self.device_pattern
        )
    }
}

/// Where the benchmarks run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkTarget {
    pub mountpoint: PathBuf,
    /// A matching device with a mountpoint was found
    pub nvme_detected: bool,
}

impl BenchmarkTarget {
    /// Select the target from optional lsblk output
    pub fn select(lsblk: Option<&str>, config: &DiskConfig) -> Self {
        match lsblk.and_then(|output| parse_lsblk_mountpoint(output, &config.device_pattern)) {
            Some(mountpoint) => Self {
                mountpoint,
                nvme_detected: true,
            },
            None => Self {
                mountpoint: config.fallback_dir.clone(),
                nvme_detected: false,
            },
        }
    }
}

/// Mountpoint of the first device whose name contains `pattern`
///
/// NVMe devices leave the HCTL column empty, so the mountpoint is the first
/// field after the name that starts with `/`.
pub fn parse_lsblk_mountpoint(output: &str, pattern: &str) -> Option<PathBuf> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let name = fields.next()?;
        if !name.contains(pattern) {
            return None;
        }
        fields.find(|field| field.starts_with('/')).map(PathBuf::from)
    })
}

/// Parse `df -BG --output=avail` output such as `812G`
pub fn parse_df_avail(output: &str) -> Option<u64> {
    let value = output.lines().last()?.trim();
    value.strip_suffix('G').unwrap_or(value).parse().ok()
}

/// Disk section of the report
#[derive(Debug, Clone, PartialEq)]
pub struct DiskReport {
    pub nvme_detected: bool,
    pub mountpoint: PathBuf,
    pub disk_to_cpu: BenchmarkResult,
    pub cpu_to_disk: BenchmarkResult,
    pub gds_enabled: bool,
    pub gpu_to_disk: BenchmarkResult,
    pub disk_to_gpu: BenchmarkResult,
    /// Free space at the mountpoint in GB
    pub available_space_gb: Measured<u64>,
}

impl DiskReport {
    /// Benchmark result for a direction
    pub fn benchmark(&self, direction: Direction) -> &BenchmarkResult {
        match direction {
            Direction::DiskToCpu => &self.disk_to_cpu,
            Direction::CpuToDisk => &self.cpu_to_disk,
            Direction::GpuToDisk => &self.gpu_to_disk,
            Direction::DiskToGpu => &self.disk_to_gpu,
        }
    }
}

impl Serialize for DiskReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(12))?;
        map.serialize_entry("NVMe Detected", &self.nvme_detected)?;
        map.serialize_entry("Benchmark Mountpoint", &self.mountpoint)?;
        for result in [&self.disk_to_cpu, &self.cpu_to_disk] {
            map.serialize_entry(&result.direction.bandwidth_key(), &result.bandwidth_gbps)?;
            map.serialize_entry(&result.direction.iops_key(), &result.iops)?;
        }
        map.serialize_entry("GDS Enabled", &self.gds_enabled)?;
        for result in [&self.gpu_to_disk, &self.disk_to_gpu] {
            map.serialize_entry(&result.direction.bandwidth_key(), &result.bandwidth_gbps)?;
            map.serialize_entry(&result.direction.iops_key(), &result.iops)?;
        }
        map.serialize_entry("Available Space (GB)", &self.available_space_gb)?;
        map.end()
    }
}

/// Storage probe
pub struct DiskProbe {
    config: DiskConfig,
    gds: GdsConfig,
    storage: Arc<dyn DirectStorage>,
}

impl DiskProbe {
    /// Create a new disk probe over a GDS capability
    pub fn new(config: DiskConfig, gds: GdsConfig, storage: Arc<dyn DirectStorage>) -> Self {
        Self {
            config,
            gds,
            storage,
        }
    }

    /// Collect the Disk section
    ///
    /// Benchmarks run strictly one after another: fio read, fio write, then
    /// the GDS write/read pair.
    pub async fn collect(&self, session: &mut ProbeSession) -> DiskReport {
        let lsblk = session.run(&self.config.lsblk_command()).await;
        let target = BenchmarkTarget::select(lsblk.as_deref(), &self.config);
        info!(
            mountpoint = %target.mountpoint.display(),
            nvme_detected = target.nvme_detected,
            "Selected benchmark mountpoint"
        );

        let (disk_to_cpu, cpu_to_disk) = self.run_fio_pair(session, &target.mountpoint).await;
        let gds = self.run_gds(&target.mountpoint).await;

        let df = format!("df -BG --output=avail {} | tail -1", target.mountpoint.display());
        let available_space_gb = Measured::from_option(
            session
                .run(&df)
                .await
                .and_then(|output| parse_df_avail(&output)),
        );

        let report = DiskReport {
            nvme_detected: target.nvme_detected,
            mountpoint: target.mountpoint,
            disk_to_cpu,
            cpu_to_disk,
            gds_enabled: gds.enabled,
            gpu_to_disk: gds.write,
            disk_to_gpu: gds.read,
            available_space_gb,
        };

        let metrics = MetricsRegistry::new();
        for result in [
            &report.disk_to_cpu,
            &report.cpu_to_disk,
            &report.gpu_to_disk,
            &report.disk_to_gpu,
        ] {
            result.record_metrics(&metrics);
        }

        report
    }

    async fn run_fio_pair(
        &self,
        session: &mut ProbeSession,
        mountpoint: &Path,
    ) -> (BenchmarkResult, BenchmarkResult) {
        let bench_dir = mountpoint.join(&self.config.bench_subdir);
        let scratch = match ScratchDir::create_in(mountpoint, &self.config.bench_subdir) {
            Ok(scratch) => scratch,
            Err(e) => {
                warn!(path = %bench_dir.display(), error = %e, "Could not create benchmark directory");
                return (
                    BenchmarkResult::failed(Direction::DiskToCpu, Some("IoError")),
                    BenchmarkResult::failed(Direction::CpuToDisk, Some("IoError")),
                );
            }
        };

        let profile = &self.config.profile;
        let read = run_fio(session, scratch.path(), FioMode::Read, profile).await;
        let write = run_fio(session, scratch.path(), FioMode::Write, profile).await;
        (read, write)
    }

    async fn run_gds(&self, mountpoint: &Path) -> GdsOutcome {
        let storage = Arc::clone(&self.storage);
        let directory = mountpoint.to_path_buf();
        let config = self.gds.clone();

        match tokio::task::spawn_blocking(move || {
            run_gds_benchmark(storage.as_ref(), &directory, &config)
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "GDS benchmark aborted");
                GdsOutcome::failed(true, "Panic")
            }
        }
    }
}
