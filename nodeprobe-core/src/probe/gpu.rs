//! GPU topology analyzer
//!
//! Parses the nvidia-smi device inventory and the `topo -m` connectivity
//! matrix into a deduplicated NVLink bond map.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};
use tracing::{debug, info};

use crate::command::ProbeSession;
use crate::report::Measured;

const NAME_QUERY: &str = "nvidia-smi --query-gpu=name --format=csv,noheader";
const MEMORY_QUERY: &str = "nvidia-smi --query-gpu=memory.total --format=csv,noheader";
const TOPOLOGY_QUERY: &str = "nvidia-smi topo -m";

static GPU_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(A\d{3}|H\d{3}|B\d{3}|V\d{3}|RTX\s?\d{4}|L\d{2})").expect("Invalid GPU type regex")
});

static VRAM_TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(HBM\d+|GDDR\d+)").expect("Invalid VRAM type regex"));

/// NVLink connection from one GPU to a peer
///
/// Serializes as a `[peer, lanes]` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvlinkBond {
    /// Peer GPU label (e.g. `GPU1`)
    pub peer: String,
    /// Number of NVLink lanes bonded between the pair
    pub lanes: u32,
}

impl Serialize for NvlinkBond {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.peer, self.lanes).serialize(serializer)
    }
}

/// GPU label to its NVLink peers
///
/// Each unordered pair appears once, under the lexicographically smaller
/// label. GPUs without bonds are absent.
pub type NvlinkBondMap = BTreeMap<String, Vec<NvlinkBond>>;

/// GPU section of the report
#[derive(Debug, Clone, Serialize)]
pub struct GpuReport {
    /// Model family extracted from the first GPU name (A100, H100, ...)
    #[serde(rename = "GPU Type")]
    pub gpu_type: Measured<String>,
    /// Total memory of the first GPU as reported by nvidia-smi
    #[serde(rename = "GPU VRAM")]
    pub vram: Measured<String>,
    /// Memory technology (HBM3, GDDR6, ...)
    #[serde(rename = "VRAM Type")]
    pub vram_type: Measured<String>,
    /// Number of GPUs listed
    #[serde(rename = "GPU Count")]
    pub count: usize,
    /// Whether any GPU row shows an NVLink connection
    #[serde(rename = "Has NVLink")]
    pub has_nvlink: bool,
    /// Deduplicated NVLink bonds
    #[serde(rename = "NVLink Bonds")]
    pub nvlink_bonds: Option<NvlinkBondMap>,
}

impl GpuReport {
    /// Distinct GPUs taking part in at least one NVLink bond
    pub fn nvlink_gpus(&self) -> BTreeSet<&str> {
        let mut gpus = BTreeSet::new();
        if let Some(bonds) = &self.nvlink_bonds {
            for (gpu, peers) in bonds {
                gpus.insert(gpu.as_str());
                gpus.extend(peers.iter().map(|bond| bond.peer.as_str()));
            }
        }
        gpus
    }
}

/// Lane count of an `NV<n>` matrix entry
fn nvlink_lanes(entry: &str) -> Option<u32> {
    let digits = entry.strip_prefix("NV")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Rows of the topology matrix that describe a GPU
fn gpu_rows(topology: &str) -> Vec<Vec<&str>> {
    topology
        .lines()
        .filter(|line| line.starts_with("GPU"))
        .map(|line| line.split_whitespace().collect())
        .collect()
}

/// Build the NVLink bond map from `nvidia-smi topo -m` output
///
/// Returns `None` when no GPU reports an NVLink bond.
pub fn parse_nvlink_bonds(topology: &str) -> Option<NvlinkBondMap> {
    let rows = gpu_rows(topology);
    let labels: Vec<&str> = rows.iter().filter_map(|row| row.first().copied()).collect();

    let mut bonds = NvlinkBondMap::new();
    for row in &rows {
        let Some((gpu, entries)) = row.split_first() else {
            continue;
        };
        // Columns beyond the GPU labels are affinity fields
        for (peer, entry) in labels.iter().zip(entries) {
            if gpu >= peer {
                continue;
            }
            if let Some(lanes) = nvlink_lanes(entry) {
                bonds.entry(gpu.to_string()).or_default().push(NvlinkBond {
                    peer: peer.to_string(),
                    lanes,
                });
            }
        }
    }

    if bonds.is_empty() {
        None
    } else {
        Some(bonds)
    }
}

/// Whether any GPU row of the matrix carries an `NV<n>` entry
pub fn has_nvlink(topology: &str) -> bool {
    gpu_rows(topology)
        .iter()
        .any(|row| row.iter().skip(1).any(|entry| nvlink_lanes(entry).is_some()))
}

/// Extract the model family from a GPU name
pub fn parse_gpu_type(name: &str) -> Measured<String> {
    Measured::from_option(
        GPU_TYPE_RE
            .captures(&name.to_uppercase())
            .map(|cap| cap[1].to_string()),
    )
}

/// Extract the memory technology from a GPU name
pub fn parse_vram_type(name: &str) -> Measured<String> {
    Measured::from_option(
        VRAM_TYPE_RE
            .captures(&name.to_uppercase())
            .map(|cap| cap[1].to_string()),
    )
}

/// GPU inventory probe
#[derive(Debug, Clone, Default)]
pub struct GpuProbe;

impl GpuProbe {
    /// Create a new GPU probe
    pub fn new() -> Self {
        Self
    }

    /// Collect the GPU section
    pub async fn collect(&self, session: &mut ProbeSession) -> GpuReport {
        let names: Vec<String> = session
            .run(NAME_QUERY)
            .await
            .map(|output| {
                output
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let (gpu_type, vram_type) = match names.first() {
            Some(name) => (parse_gpu_type(name), parse_vram_type(name)),
            None => (Measured::Unknown, Measured::Unknown),
        };

        let vram = Measured::from_option(session.run(MEMORY_QUERY).await.and_then(|output| {
            output.lines().next().map(|line| line.trim().to_string())
        }));

        let (has_nvlink, nvlink_bonds) = match session.run(TOPOLOGY_QUERY).await {
            Some(topology) => (has_nvlink(&topology), parse_nvlink_bonds(&topology)),
            None => (false, None),
        };

        debug!(
            count = names.len(),
            has_nvlink = has_nvlink,
            bonded = nvlink_bonds.as_ref().map_or(0, |b| b.len()),
            "GPU inventory parsed"
        );

        let report = GpuReport {
            gpu_type,
            vram,
            vram_type,
            count: names.len(),
            has_nvlink,
            nvlink_bonds,
        };

        info!(count = report.count, gpu_type = %report.gpu_type, "Collected GPU info");
        report
    }
}
