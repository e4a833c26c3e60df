//! Configuration module for nodeprobe
//!
//! Handles loading and validating configuration from YAML files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nodeprobe_core::{ProbeConfig, RecommendConfig};
use serde::{Deserialize, Serialize};

/// Metrics export configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Textfile-collector output written once at the end of the run
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upper bound on each external command; unset waits indefinitely
    #[serde(with = "humantime_serde", default)]
    pub command_timeout: Option<Duration>,

    /// Probe configuration
    #[serde(default)]
    pub probes: ProbeConfig,

    /// Recommendation tuning
    #[serde(default)]
    pub recommend: RecommendConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let rec = &self.recommend;
        if !(rec.cpu_fraction > 0.0 && rec.cpu_fraction <= 1.0) {
            anyhow::bail!("recommend.cpu_fraction must be in (0, 1]");
        }
        if !(rec.disk_fraction > 0.0 && rec.disk_fraction <= 1.0) {
            anyhow::bail!("recommend.disk_fraction must be in (0, 1]");
        }
        if rec.medium_threshold_gbps > rec.high_threshold_gbps {
            anyhow::bail!("recommend.medium_threshold_gbps must not exceed high_threshold_gbps");
        }

        if !self.probes.disk.bench_subdir_is_valid() {
            anyhow::bail!("probes.disk.bench_subdir must be a single directory name");
        }

        let profile = &self.probes.disk.profile;
        if is_zero_size(&profile.size) || is_zero_size(&profile.block_size) {
            anyhow::bail!("probes.disk.profile size and block_size must be non-zero");
        }
        if profile.numjobs == 0 || profile.iodepth == 0 {
            anyhow::bail!("probes.disk.profile numjobs and iodepth must be > 0");
        }

        let gds = &self.probes.gds;
        if gds.file_size == 0 || gds.block_size == 0 {
            anyhow::bail!("probes.gds file_size and block_size must be > 0");
        }
        if gds.block_size > gds.file_size {
            anyhow::bail!("probes.gds.block_size must not exceed file_size");
        }

        if self.probes.nic.vendor_pattern.trim().is_empty() {
            anyhow::bail!("probes.nic.vendor_pattern must not be empty");
        }
        if matches!(self.command_timeout, Some(t) if t.is_zero()) {
            anyhow::bail!("command_timeout must be > 0 when set");
        }
        Ok(())
    }
}

fn is_zero_size(size: &str) -> bool {
    let digits = size.trim().trim_end_matches(|c: char| c.is_ascii_alphabetic());
    digits.parse::<f64>().map(|n| n <= 0.0).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.command_timeout.is_none());
        assert_eq!(config.probes.cpu.pcie_gpu_index, 0);
        assert_eq!(config.probes.disk.fallback_dir, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
command_timeout: 90s

probes:
  cpu:
    pcie_gpu_index: 1
  disk:
    fallback_dir: /scratch
    profile:
      size: 4G
      numjobs: 8
  gds:
    file_size: 67108864
  nic:
    vendor_pattern: "mellanox|broadcom"
    sudo_pci_detail: false

recommend:
  cpu_fraction: 0.5
  high_threshold_gbps: 100

metrics:
  textfile: /var/lib/node_exporter/nodeprobe.prom
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.command_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.probes.cpu.pcie_gpu_index, 1);
        assert_eq!(config.probes.disk.fallback_dir, PathBuf::from("/scratch"));
        assert_eq!(config.probes.disk.profile.size, "4G");
        assert_eq!(config.probes.disk.profile.block_size, "32M");
        assert_eq!(config.probes.disk.profile.numjobs, 8);
        assert_eq!(config.probes.gds.file_size, 64 * 1024 * 1024);
        assert!(!config.probes.nic.sudo_pci_detail);
        assert_eq!(config.recommend.cpu_fraction, 0.5);
        assert_eq!(config.recommend.disk_fraction, 0.8);
        assert_eq!(
            config.metrics.textfile,
            Some(PathBuf::from("/var/lib/node_exporter/nodeprobe.prom"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.probes, ProbeConfig::default());
        assert_eq!(config.recommend, RecommendConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_fraction() {
        let mut config = Config::default();
        config.recommend.disk_fraction = 1.5;
        assert!(config.validate().is_err());

        config.recommend.disk_fraction = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = Config::default();
        config.recommend.medium_threshold_gbps = 60.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_benchmark_sizes() {
        let mut config = Config::default();
        config.probes.disk.profile.size = "0G".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.probes.gds.block_size = config.probes.gds.file_size * 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.probes.disk.profile.iodepth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bench_subdir_outside_mountpoint() {
        for subdir in ["", ".", "..", "/", "/var/lib", "a/b", "../data"] {
            let mut config = Config::default();
            config.probes.disk.bench_subdir = subdir.to_string();
            assert!(config.validate().is_err(), "accepted {:?}", subdir);
        }

        let config = Config::from_yaml("probes:\n  disk:\n    bench_subdir: nodeprobe-fio\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_size_detection() {
        assert!(is_zero_size("0"));
        assert!(is_zero_size("0M"));
        assert!(is_zero_size(""));
        assert!(!is_zero_size("1G"));
        assert!(!is_zero_size("32M"));
        assert!(!is_zero_size("4096"));
    }
}
