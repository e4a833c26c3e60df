//! LMCache recommendation engine
//!
//! Reduces a [`DiagnosticReport`] to cache sizing and disaggregation advice.
//! Pure: no commands are run here. Unresolved inputs surface as `Unknown`
//! and never suppress the rest of the recommendation.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::bandwidth::round2;
use crate::metrics::MetricsRegistry;
use crate::report::{DiagnosticReport, Measured};

static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^([0-9.]+)\s*([KMGTP])").expect("Invalid size regex"));

/// Recommendation tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendConfig {
    /// Share of total RAM offered to the CPU cache
    pub cpu_fraction: f64,
    /// Share of free disk space offered to the disk cache
    pub disk_fraction: f64,
    /// Peak NIC bandwidth (GB/s) at or above which the network is High
    pub high_threshold_gbps: f64,
    /// Peak NIC bandwidth (GB/s) at or above which the network is Medium
    pub medium_threshold_gbps: f64,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            cpu_fraction: 0.8,
            disk_fraction: 0.8,
            high_threshold_gbps: 50.0,
            medium_threshold_gbps: 32.0,
        }
    }
}

/// Network capability class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkClass {
    High,
    Medium,
    /// KV cache transfer needs compression (CacheGen)
    Low,
    Unknown,
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkClass::High => "High",
            NetworkClass::Medium => "Medium",
            NetworkClass::Low => "Low (CacheGen recommended)",
            NetworkClass::Unknown => "Unknown",
        })
    }
}

/// Convert a size such as `128G`, `62Gi` or `512M` to GB (binary multiples)
pub fn size_to_gb(size: &str) -> Option<f64> {
    let caps = SIZE_RE.captures(size.trim())?;
    let value: f64 = caps[1].parse().ok()?;
    let factor = match caps[2].to_ascii_uppercase().as_str() {
        "K" => 1.0 / 1024.0 / 1024.0,
        "M" => 1.0 / 1024.0,
        "G" => 1.0,
        "T" => 1024.0,
        "P" => 1024.0 * 1024.0,
        _ => return None,
    };
    Some(round2(value * factor))
}

/// Classify the peak NIC PCIe bandwidth
pub fn classify_network(peak_gbps: Option<f64>, config: &RecommendConfig) -> NetworkClass {
    match peak_gbps {
        Some(bw) if bw >= config.high_threshold_gbps => NetworkClass::High,
        Some(bw) if bw >= config.medium_threshold_gbps => NetworkClass::Medium,
        Some(_) => NetworkClass::Low,
        None => NetworkClass::Unknown,
    }
}

/// LMCache configuration advice
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    /// LMCACHE_MAX_LOCAL_CPU_SIZE total in GB
    pub cpu_cache_gb: Measured<f64>,
    pub cpu_fraction: f64,
    /// LMCACHE_MAX_LOCAL_DISK_SIZE total in GB
    pub disk_cache_gb: Measured<f64>,
    pub disk_fraction: f64,
    pub disk_read_gbps: Measured<f64>,
    pub disk_write_gbps: Measured<f64>,
    pub gds_enabled: bool,
    pub gds_read_gbps: Measured<f64>,
    pub gds_write_gbps: Measured<f64>,
    pub peak_nic_gbps: Option<f64>,
    pub network_class: NetworkClass,
    /// NVLink bonds exist between GPUs
    pub intra_node: bool,
    /// Distinct GPUs in at least one NVLink bond
    pub nvlink_gpus: usize,
    /// At least one RDMA device exists
    pub cross_node: bool,
}

impl Recommendation {
    /// Export the cache budgets as gauges
    pub fn record_metrics(&self, metrics: &MetricsRegistry) {
        if let Some(gb) = self.cpu_cache_gb.known() {
            metrics.set_recommended_cache("cpu", *gb);
        }
        if let Some(gb) = self.disk_cache_gb.known() {
            metrics.set_recommended_cache("disk", *gb);
        }
    }
}

/// Derive the recommendation from a finished report
pub fn recommend(report: &DiagnosticReport, config: &RecommendConfig) -> Recommendation {
    let cpu_cache_gb = match &report.cpu.ram_size {
        Measured::Known(size) => Measured::from_option(size_to_gb(size))
            .map(|total| round2(total * config.cpu_fraction)),
        _ => Measured::Unknown,
    };

    let disk_cache_gb = match &report.disk.available_space_gb {
        Measured::Known(avail) => Measured::Known(round2(*avail as f64 * config.disk_fraction)),
        _ => Measured::Unknown,
    };

    let peak_nic_gbps = report.nic.peak_bandwidth();

    Recommendation {
        cpu_cache_gb,
        cpu_fraction: config.cpu_fraction,
        disk_cache_gb,
        disk_fraction: config.disk_fraction,
        disk_read_gbps: report.disk.disk_to_cpu.bandwidth_gbps.clone(),
        disk_write_gbps: report.disk.cpu_to_disk.bandwidth_gbps.clone(),
        gds_enabled: report.disk.gds_enabled,
        gds_read_gbps: report.disk.disk_to_gpu.bandwidth_gbps.clone(),
        gds_write_gbps: report.disk.gpu_to_disk.bandwidth_gbps.clone(),
        peak_nic_gbps,
        network_class: classify_network(peak_nic_gbps, config),
        intra_node: report.gpu.nvlink_bonds.is_some(),
        nvlink_gpus: report.gpu.nvlink_gpus().len(),
        cross_node: report.nic.has_rdma(),
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peak = self
            .peak_nic_gbps
            .map_or_else(|| "Unknown".to_string(), |bw| bw.to_string());

        writeln!(f, "LMCache Configuration Report")?;
        writeln!(f, "------------------------------")?;
        writeln!(
            f,
            "Recommended LMCACHE_MAX_LOCAL_CPU_SIZE total (split across workers): {} GB (~{:.0}% of CPU RAM)",
            self.cpu_cache_gb,
            self.cpu_fraction * 100.0
        )?;
        writeln!(
            f,
            "Recommended LMCACHE_MAX_LOCAL_DISK_SIZE total (split across workers): {} GB (~{:.0}% of available disk)",
            self.disk_cache_gb,
            self.disk_fraction * 100.0
        )?;
        writeln!(f, "Disk Configuration:")?;
        writeln!(f, "  • Disk → CPU BW: {} GB/s", self.disk_read_gbps)?;
        writeln!(f, "  • CPU → Disk BW: {} GB/s", self.disk_write_gbps)?;
        writeln!(f, "GDS (GPU Direct Storage):")?;
        writeln!(f, "  • GDS enabled: {}", self.gds_enabled)?;
        writeln!(f, "  • Disk → GPU BW: {} GB/s", self.gds_read_gbps)?;
        writeln!(f, "  • GPU → Disk BW: {} GB/s", self.gds_write_gbps)?;
        writeln!(
            f,
            "Network: Peak NIC PCIe BW: {} GB/s ({})",
            peak, self.network_class
        )?;
        writeln!(
            f,
            "Intra-node Prefill Disaggregation (NVLink): {} (connected GPUs: {})",
            self.intra_node, self.nvlink_gpus
        )?;
        writeln!(
            f,
            "Cross-node Prefill Disaggregation (RDMA/Infiniband): {}",
            self.cross_node
        )?;
        write!(f, "--------------------------------")
    }
}
