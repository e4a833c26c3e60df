//! Diagnostic run driver
//!
//! Runs the GPU, CPU, disk and NIC probes strictly one after another and
//! assembles the report. Benchmarks must not overlap, so nothing here is
//! spawned concurrently.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::benchmark::{DirectStorage, GdsConfig};
use crate::command::{CommandRunner, ProbeSession};
use crate::metrics::MetricsRegistry;
use crate::probe::{CpuConfig, CpuProbe, DiskConfig, DiskProbe, GpuProbe, NicConfig, NicProbe};
use crate::report::DiagnosticReport;

/// Configuration of all probes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub cpu: CpuConfig,
    pub disk: DiskConfig,
    pub gds: GdsConfig,
    pub nic: NicConfig,
}

/// Full probe sequence over a command runner and a GDS capability
pub struct Diagnostics {
    runner: Arc<dyn CommandRunner>,
    gpu: GpuProbe,
    cpu: CpuProbe,
    disk: DiskProbe,
    nic: NicProbe,
    metrics: MetricsRegistry,
}

impl Diagnostics {
    /// Create a new driver
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        storage: Arc<dyn DirectStorage>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            runner,
            gpu: GpuProbe::new(),
            cpu: CpuProbe::new(config.cpu),
            disk: DiskProbe::new(config.disk, config.gds, storage),
            nic: NicProbe::new(config.nic),
            metrics: MetricsRegistry::new(),
        }
    }

    /// Run every probe and collect the report
    ///
    /// Never fails: probe problems end up as sentinel values and in the
    /// report's `Errors` section.
    pub async fn run(&self) -> DiagnosticReport {
        info!("Starting system diagnostics");
        let mut session = ProbeSession::new(Arc::clone(&self.runner));

        info!("Collecting GPU info");
        let start = Instant::now();
        let gpu = self.gpu.collect(&mut session).await;
        self.observe("gpu", start);
        self.metrics.set_gpu_count(gpu.count as i64);

        info!("Collecting CPU info");
        let start = Instant::now();
        let cpu = self.cpu.collect(&mut session).await;
        self.observe("cpu", start);

        info!("Running disk benchmarks (this may take a minute)");
        let start = Instant::now();
        let disk = self.disk.collect(&mut session).await;
        self.observe("disk", start);

        info!("Collecting NIC / RDMA info");
        let start = Instant::now();
        let nic = self.nic.collect(&mut session).await;
        self.observe("nic", start);

        let errors: Vec<String> = session
            .take_failures()
            .iter()
            .map(|failure| failure.to_string())
            .collect();

        info!(errors = errors.len(), "Diagnostics complete");

        DiagnosticReport {
            generated_at: chrono::Utc::now(),
            gpu,
            cpu,
            disk,
            nic,
            errors,
        }
    }

    fn observe(&self, section: &str, start: Instant) {
        let elapsed = start.elapsed();
        debug!(section = section, elapsed = ?elapsed, "Probe section finished");
        self.metrics
            .observe_probe_duration(section, elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::MockDirectStorage;
    use crate::command::MockRunner;
    use serde_json::Value;
    use std::path::Path;

    const TOPOLOGY: &str = "\tGPU0\tGPU1\tCPU Affinity\tNUMA Affinity
GPU0\t X \tNV12\t0-31\t0
GPU1\tNV12\t X \t0-31\t0";

    fn key_paths(value: &Value, prefix: &str, out: &mut Vec<String>) {
        if let Value::Object(map) = value {
            for (key, child) in map {
                let path = format!("{}/{}", prefix, key);
                out.push(path.clone());
                key_paths(child, &path, out);
            }
        }
    }

    fn scripted_runner(root: &Path) -> MockRunner {
        MockRunner::new()
            .with_output(
                "nvidia-smi --query-gpu=name --format=csv,noheader",
                "NVIDIA H100 80GB HBM3\nNVIDIA H100 80GB HBM3",
            )
            .with_output(
                "nvidia-smi --query-gpu=memory.total --format=csv,noheader",
                "81559 MiB\n81559 MiB",
            )
            .with_output("nvidia-smi topo -m", TOPOLOGY)
            .with_output("lscpu", "Architecture: x86_64\nSocket(s): 2")
            .with_output("free -h", "Mem: 2.0Ti 100Gi")
            .with_output(
                format!("df -BG --output=avail {} | tail -1", root.display()),
                "500G",
            )
    }

    fn config(root: &Path) -> ProbeConfig {
        ProbeConfig {
            disk: DiskConfig {
                fallback_dir: root.to_path_buf(),
                ..DiskConfig::default()
            },
            ..ProbeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_run_collects_all_sections() {
        let root = tempfile::tempdir().unwrap();
        let diagnostics = Diagnostics::new(
            Arc::new(scripted_runner(root.path())),
            Arc::new(MockDirectStorage::new()),
            config(root.path()),
        );

        let report = diagnostics.run().await;

        assert_eq!(report.gpu.count, 2);
        assert!(report.gpu.has_nvlink);
        assert!(report.disk.gds_enabled);
        assert!(report.errors.iter().any(|e| e.contains("'fio --name=readtest")));
        assert!(report
            .errors
            .iter()
            .all(|e| e.starts_with("Command failed: '")));

        let json = report.to_json(true).unwrap();
        let order: Vec<usize> = ["\"Generated At\"", "\"GPU\"", "\"CPU\"", "\"Disk\"", "\"NIC\"", "\"Errors\""]
            .iter()
            .map(|key| json.find(key).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_repeated_runs_have_identical_shape() {
        let root = tempfile::tempdir().unwrap();
        let diagnostics = Diagnostics::new(
            Arc::new(scripted_runner(root.path())),
            Arc::new(MockDirectStorage::new().with_write_failure()),
            config(root.path()),
        );

        let first = serde_json::to_value(diagnostics.run().await).unwrap();
        let second = serde_json::to_value(diagnostics.run().await).unwrap();

        let (mut first_keys, mut second_keys) = (Vec::new(), Vec::new());
        key_paths(&first, "", &mut first_keys);
        key_paths(&second, "", &mut second_keys);
        assert_eq!(first_keys, second_keys);
        assert_eq!(first["Errors"], second["Errors"]);
    }

    #[tokio::test]
    async fn test_scratch_resources_removed() {
        let root = tempfile::tempdir().unwrap();
        let diagnostics = Diagnostics::new(
            Arc::new(scripted_runner(root.path())),
            Arc::new(MockDirectStorage::new()),
            config(root.path()),
        );

        diagnostics.run().await;

        let leftovers: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_run_on_bare_host() {
        let root = tempfile::tempdir().unwrap();
        let diagnostics = Diagnostics::new(
            Arc::new(MockRunner::new()),
            Arc::new(MockDirectStorage::unavailable(crate::benchmark::NO_DEVICE)),
            config(root.path()),
        );

        let report = diagnostics.run().await;
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["GPU"]["GPU Type"], "Unknown");
        assert_eq!(json["GPU"]["NVLink Bonds"], Value::Null);
        assert_eq!(json["Disk"]["Disk -> GPU IOPS"], "No CUDA GPU detected");
        assert_eq!(json["NIC"]["NIC PCIe BW (GB/s)"], "Unavailable");
        assert!(!report.errors.is_empty());
    }
}
