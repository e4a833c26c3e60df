//! NIC and RDMA inventory

use std::collections::BTreeMap;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::bandwidth::estimate_from_rate;
use crate::command::ProbeSession;
use crate::report::Measured;

/// PCI listing filtered to network controller classes
const NIC_LISTING: &str =
    "lspci | grep -E 'Ethernet controller|Infiniband controller|Network controller'";

static TRANSPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"transport:\s*([A-Za-z]+)").expect("Invalid transport regex"));

static SPEED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Speed\s+([0-9.]+)GT/s").expect("Invalid link speed regex"));

static WIDTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Width\s+x([0-9]+)").expect("Invalid link width regex"));

/// NIC probe configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NicConfig {
    /// RDMA device class directory
    pub rdma_class_dir: PathBuf,
    /// Case-insensitive vendor filter applied to the PCI listing
    pub vendor_pattern: String,
    /// Kernel modules reported when loaded
    pub rdma_modules: Vec<String>,
    /// Module whose version is reported as the OFED version
    pub driver_module: String,
    /// Run the per-device PCI query through `sudo -n`
    pub sudo_pci_detail: bool,
}

impl Default for NicConfig {
    fn default() -> Self {
        Self {
            rdma_class_dir: PathBuf::from("/sys/class/infiniband"),
            vendor_pattern: "mell".to_string(),
            rdma_modules: ["ib_core", "mlx5_core", "mlx5_ib", "ib_uverbs", "rdma_ucm", "rdma_cm"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            driver_module: "mlx5_core".to_string(),
            sudo_pci_detail: true,
        }
    }
}

impl NicConfig {
    /// Compiled vendor filter
    ///
    /// A pattern that is not a valid regex is matched literally.
    pub fn vendor_regex(&self) -> Option<Regex> {
        RegexBuilder::new(&self.vendor_pattern)
            .case_insensitive(true)
            .build()
            .or_else(|_| {
                RegexBuilder::new(&regex::escape(&self.vendor_pattern))
                    .case_insensitive(true)
                    .build()
            })
            .ok()
    }

    fn pci_detail_command(&self, address: &str) -> String {
        if self.sudo_pci_detail {
            format!("sudo -n lspci -s {} -vv", address)
        } else {
            format!("lspci -s {} -vv", address)
        }
    }
}

/// A vendor network device and its link bandwidth
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VendorDevice {
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "BW (GB/s)")]
    pub bandwidth: Measured<f64>,
}

/// NIC section of the report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NicReport {
    #[serde(rename = "RDMA NICs")]
    pub rdma_nics: usize,
    #[serde(rename = "IB Device Count")]
    pub ib_device_count: usize,
    #[serde(rename = "Device Transport Types")]
    pub transport_types: BTreeMap<String, String>,
    #[serde(rename = "Total NICs")]
    pub total_nics: usize,
    #[serde(rename = "Mellanox Device Count")]
    pub vendor_device_count: usize,
    #[serde(rename = "Mellanox PCI Entries")]
    pub vendor_entries: Vec<String>,
    /// Keyed by PCI address
    #[serde(rename = "Mellanox PCI Details")]
    pub vendor_details: BTreeMap<String, VendorDevice>,
    #[serde(rename = "RDMA Drivers Loaded", serialize_with = "none_when_empty")]
    pub drivers_loaded: Vec<String>,
    #[serde(rename = "rdma-core Installed")]
    pub rdma_core_installed: bool,
    #[serde(rename = "MLNX_OFED Version")]
    pub ofed_version: Measured<String>,
    /// PCI address -> GB/s for every network controller with a readable link
    #[serde(rename = "NIC PCIe BW (GB/s)")]
    pub pcie_bandwidth: Measured<BTreeMap<String, f64>>,
}

impl NicReport {
    /// Highest measured NIC PCIe bandwidth
    pub fn peak_bandwidth(&self) -> Option<f64> {
        self.pcie_bandwidth
            .known()?
            .values()
            .copied()
            .fold(None, |peak, bw| Some(peak.map_or(bw, |p: f64| p.max(bw))))
    }

    /// At least one RDMA device is present
    pub fn has_rdma(&self) -> bool {
        self.rdma_nics > 0
    }
}

fn none_when_empty<S: Serializer>(drivers: &[String], serializer: S) -> Result<S::Ok, S::Error> {
    if drivers.is_empty() {
        serializer.serialize_str("None")
    } else {
        drivers.serialize(serializer)
    }
}

/// Transport name from `ibv_devinfo | grep transport`
pub fn parse_transport(output: &str) -> Option<String> {
    TRANSPORT_RE
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// Whether a transport name denotes InfiniBand
pub fn is_infiniband(transport: &str) -> bool {
    let lower = transport.to_ascii_lowercase();
    lower.starts_with("ib") || lower == "infiniband"
}

/// Canonical transport label
pub fn classify_transport(transport: &str) -> String {
    if is_infiniband(transport) {
        "InfiniBand".to_string()
    } else if transport.eq_ignore_ascii_case("iwarp") {
        "iWARP".to_string()
    } else {
        transport.to_string()
    }
}

/// Signalling rate (GT/s) and width from `lspci -vv` output
///
/// The negotiated `LnkSta:` line is preferred over the `LnkCap:` capability.
pub fn parse_link_status(detail: &str) -> Option<(f64, u32)> {
    let line = detail
        .lines()
        .find(|l| l.contains("LnkSta:"))
        .or_else(|| detail.lines().find(|l| l.contains("LnkCap:")))?;

    let speed = SPEED_RE.captures(line)?[1].parse().ok()?;
    let width = WIDTH_RE.captures(line)?[1].parse().ok()?;
    Some((speed, width))
}

/// Module names from `lsmod` output
pub fn parse_modules(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect()
}

/// Version from a `modinfo ... | grep ^version` line
pub fn parse_module_version(output: &str) -> Option<String> {
    output.split_whitespace().last().map(String::from)
}

fn pci_address(line: &str) -> Option<&str> {
    line.split_whitespace().next()
}

/// NIC and RDMA probe
#[derive(Debug, Clone, Default)]
pub struct NicProbe {
    config: NicConfig,
}

impl NicProbe {
    /// Create a new NIC probe
    pub fn new(config: NicConfig) -> Self {
        Self { config }
    }

    /// Collect the NIC section
    pub async fn collect(&self, session: &mut ProbeSession) -> NicReport {
        let listing = format!("ls {}", self.config.rdma_class_dir.display());
        let rdma_devices: Vec<String> = session
            .run(&listing)
            .await
            .map(|output| {
                output
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut transport_types = BTreeMap::new();
        let mut ib_device_count = 0;
        for device in &rdma_devices {
            let query = format!("ibv_devinfo -d {} | grep transport", device);
            match session.run(&query).await {
                Some(output) => {
                    if let Some(transport) = parse_transport(&output) {
                        if is_infiniband(&transport) {
                            ib_device_count += 1;
                        }
                        transport_types.insert(device.clone(), classify_transport(&transport));
                    }
                }
                None => {
                    transport_types.insert(device.clone(), "Unknown".to_string());
                }
            }
        }

        let nic_lines: Vec<String> = session
            .run(NIC_LISTING)
            .await
            .map(|output| output.lines().map(String::from).collect())
            .unwrap_or_default();

        let vendor_entries: Vec<String> = match self.config.vendor_regex() {
            Some(re) => nic_lines
                .iter()
                .filter(|line| re.is_match(line))
                .cloned()
                .collect(),
            None => {
                warn!(pattern = %self.config.vendor_pattern, "Unusable vendor pattern");
                Vec::new()
            }
        };

        let pcie_bandwidth = self.measure_links(session, &nic_lines).await;

        let vendor_details = vendor_entries
            .iter()
            .filter_map(|line| {
                let address = pci_address(line)?;
                let bandwidth = pcie_bandwidth
                    .known()
                    .and_then(|map| map.get(address).copied());
                Some((
                    address.to_string(),
                    VendorDevice {
                        description: line.clone(),
                        bandwidth: Measured::from_option(bandwidth),
                    },
                ))
            })
            .collect();

        let modules = format!("lsmod | grep -E '{}'", self.config.rdma_modules.join("|"));
        let drivers_loaded = session
            .run(&modules)
            .await
            .map(|output| parse_modules(&output))
            .unwrap_or_default();

        let rdma_core_installed = session.run("dpkg -l | grep rdma-core").await.is_some()
            || session.run("rpm -qa | grep rdma-core").await.is_some();

        let version = format!("modinfo {} | grep ^version", self.config.driver_module);
        let ofed_version = Measured::from_option(
            session
                .run(&version)
                .await
                .and_then(|output| parse_module_version(&output)),
        );

        let report = NicReport {
            rdma_nics: rdma_devices.len(),
            ib_device_count,
            transport_types,
            total_nics: nic_lines.len(),
            vendor_device_count: vendor_entries.len(),
            vendor_entries,
            vendor_details,
            drivers_loaded,
            rdma_core_installed,
            ofed_version,
            pcie_bandwidth,
        };

        info!(
            rdma_nics = report.rdma_nics,
            total_nics = report.total_nics,
            peak_bw = ?report.peak_bandwidth(),
            "Collected NIC info"
        );
        report
    }

    /// PCIe bandwidth of every listed network controller
    async fn measure_links(
        &self,
        session: &mut ProbeSession,
        nic_lines: &[String],
    ) -> Measured<BTreeMap<String, f64>> {
        let mut bandwidths = BTreeMap::new();
        for address in nic_lines.iter().filter_map(|line| pci_address(line)) {
            let Some(detail) = session.run(&self.config.pci_detail_command(address)).await else {
                continue;
            };
            if let Some((rate, width)) = parse_link_status(&detail) {
                let bw = estimate_from_rate(rate, width);
                debug!(address = %address, rate, width, bw, "NIC PCIe link");
                bandwidths.insert(address.to_string(), bw);
            }
        }

        if bandwidths.is_empty() {
            Measured::Unavailable(None)
        } else {
            Measured::Known(bandwidths)
        }
    }
}
