//! CPU and platform profiler
//!
//! Reads CPU topology (lscpu), OS identity (os-release), RAM size (free) and
//! the PCIe link of the primary GPU (nvidia-smi -q).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::leading_number;
use crate::bandwidth::PcieLink;
use crate::command::ProbeSession;
use crate::report::Measured;

/// CPU probe configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// OS identity file
    pub os_release_path: PathBuf,
    /// GPU whose PCIe link is reported
    pub pcie_gpu_index: u32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            os_release_path: PathBuf::from("/etc/os-release"),
            pcie_gpu_index: 0,
        }
    }
}

/// CPU topology parsed from lscpu
#[derive(Debug, Clone, PartialEq)]
pub struct CpuTopology {
    /// Chip architecture (x86_64, aarch64)
    pub architecture: Measured<String>,
    /// CPU model name
    pub model: Measured<String>,
    /// cores per socket × sockets
    pub cores: Measured<u32>,
    /// cores × threads per core
    pub threads: Measured<u32>,
}

impl CpuTopology {
    /// Topology when lscpu could not be run
    pub fn unknown() -> Self {
        Self {
            architecture: Measured::Unknown,
            model: Measured::Unknown,
            cores: Measured::Unknown,
            threads: Measured::Unknown,
        }
    }
}

/// CPU section of the report
#[derive(Debug, Clone, Serialize)]
pub struct CpuReport {
    #[serde(rename = "Chip Architecture")]
    pub architecture: Measured<String>,
    #[serde(rename = "CPU Model")]
    pub model: Measured<String>,
    #[serde(rename = "CPU Core Count")]
    pub cores: Measured<u32>,
    #[serde(rename = "CPU Thread Count")]
    pub threads: Measured<u32>,
    #[serde(rename = "Operating System")]
    pub os: Measured<String>,
    /// Human-readable total RAM as printed by `free -h` (e.g. `125G`)
    #[serde(rename = "RAM Size")]
    pub ram_size: Measured<String>,
    #[serde(rename = "PCIe Gen")]
    pub pcie_gen: Measured<u8>,
    #[serde(rename = "Link Width")]
    pub link_width: Measured<u32>,
    #[serde(rename = "Estimated BW (GB/s)")]
    pub estimated_bw: Measured<f64>,
}

/// Parse `lscpu` key:value output
///
/// Socket, core and thread counts default to 1 when absent or unparsable.
pub fn parse_lscpu(output: &str) -> CpuTopology {
    let mut architecture = None;
    let mut model = None;
    let mut sockets = 1u32;
    let mut cores_per_socket = 1u32;
    let mut threads_per_core = 1u32;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Architecture" => architecture = Some(value.to_string()),
            "Model name" => model = Some(value.to_string()),
            "Socket(s)" => sockets = value.parse().unwrap_or(1),
            "Core(s) per socket" => cores_per_socket = value.parse().unwrap_or(1),
            "Thread(s) per core" => threads_per_core = value.parse().unwrap_or(1),
            _ => {}
        }
    }

    // Implausible counts that overflow are reported as unknown
    let cores = cores_per_socket.checked_mul(sockets);
    let threads = cores.and_then(|cores| cores.checked_mul(threads_per_core));
    CpuTopology {
        architecture: Measured::from_option(architecture),
        model: Measured::from_option(model),
        cores: Measured::from_option(cores),
        threads: Measured::from_option(threads),
    }
}

/// Parse the `PRETTY_NAME=` entry of an os-release file
pub fn parse_os_release(content: &str) -> Measured<String> {
    Measured::from_option(content.lines().find_map(|line| {
        line.strip_prefix("PRETTY_NAME=")
            .map(|value| value.trim().trim_matches('"').to_string())
    }))
}

/// Parse total RAM from `free -h`; the value is kept verbatim
pub fn parse_ram_size(output: &str) -> Measured<String> {
    Measured::from_option(
        output
            .lines()
            .find(|line| line.to_lowercase().starts_with("mem:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .map(String::from),
    )
}

#[derive(Clone, Copy)]
enum LinkBlock {
    Generation,
    Width,
}

#[derive(Default)]
struct LinkReadings {
    current: Option<u32>,
    max: Option<u32>,
}

impl LinkReadings {
    fn record(&mut self, label: &str, value: &str) {
        let Some(number) = leading_number(value) else {
            return;
        };
        if label.contains("Current") {
            self.current.get_or_insert(number);
        } else if label.contains("Max") {
            self.max.get_or_insert(number);
        }
    }

    fn preferred(&self) -> Option<u32> {
        self.current.or(self.max)
    }
}

/// Parse the PCIe link of a GPU from `nvidia-smi -q -i <n>`
///
/// nvidia-smi prints `PCIe Generation` and `Link Width` as headers followed
/// by `Max`/`Current` readings; the current reading wins. Returns `None`
/// unless both generation and width are present.
pub fn parse_gpu_pcie(output: &str) -> Option<PcieLink> {
    let mut block = None;
    let mut generation = LinkReadings::default();
    let mut width = LinkReadings::default();

    for line in output.lines() {
        let trimmed = line.trim();
        match trimmed.split_once(':') {
            None => {
                block = match trimmed {
                    "PCIe Generation" => Some(LinkBlock::Generation),
                    "Link Width" => Some(LinkBlock::Width),
                    _ => None,
                };
            }
            Some((label, value)) => match block {
                Some(LinkBlock::Generation) => generation.record(label.trim(), value),
                Some(LinkBlock::Width) => width.record(label.trim(), value),
                None => {}
            },
        }
    }

    let generation = u8::try_from(generation.preferred()?).ok()?;
    Some(PcieLink::new(generation, width.preferred()?))
}

/// CPU and platform probe
#[derive(Debug, Clone, Default)]
pub struct CpuProbe {
    config: CpuConfig,
}

impl CpuProbe {
    /// Create a new CPU probe
    pub fn new(config: CpuConfig) -> Self {
        Self { config }
    }

    /// Collect the CPU section
    pub async fn collect(&self, session: &mut ProbeSession) -> CpuReport {
        let topology = session
            .run("lscpu")
            .await
            .map(|output| parse_lscpu(&output))
            .unwrap_or_else(CpuTopology::unknown);

        let os = match tokio::fs::read_to_string(&self.config.os_release_path).await {
            Ok(content) => parse_os_release(&content),
            Err(e) => {
                warn!(
                    path = %self.config.os_release_path.display(),
                    error = %e,
                    "Could not read OS identity"
                );
                Measured::Unknown
            }
        };

        let ram_size = session
            .run("free -h")
            .await
            .map(|output| parse_ram_size(&output))
            .unwrap_or(Measured::Unknown);

        let query = format!("nvidia-smi -q -i {}", self.config.pcie_gpu_index);
        let link = session
            .run(&query)
            .await
            .and_then(|output| parse_gpu_pcie(&output));

        // The estimator only ever sees a complete link
        let (pcie_gen, link_width, estimated_bw) = match link {
            Some(link) => {
                debug!(generation = link.generation, width = link.width, "GPU PCIe link");
                (
                    Measured::Known(link.generation),
                    Measured::Known(link.width),
                    link.bandwidth(),
                )
            }
            None => (Measured::Unknown, Measured::Unknown, Measured::Unknown),
        };

        let report = CpuReport {
            architecture: topology.architecture,
            model: topology.model,
            cores: topology.cores,
            threads: topology.threads,
            os,
            ram_size,
            pcie_gen,
            link_width,
            estimated_bw,
        };

        info!(
            cores = %report.cores,
            threads = %report.threads,
            ram = %report.ram_size,
            "Collected CPU info"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockRunner;
    use std::sync::Arc;

    const LSCPU: &str = "Architecture:                    x86_64
CPU op-mode(s):                  32-bit, 64-bit
Byte Order:                      Little Endian
CPU(s):                          64
Vendor ID:                       AuthenticAMD
Model name:                      AMD EPYC 7302 16-Core Processor
BIOS Model name:                 AMD EPYC 7302 16-Core Processor Unknown CPU @ 3.0GHz
Thread(s) per core:              2
Core(s) per socket:              16
Socket(s):                       2
NUMA node(s):                    2";

    const FREE: &str = "               total        used        free      shared  buff/cache   available
Mem:           125Gi        12Gi       100Gi       1.0Gi        13Gi       112Gi
Swap:          8.0Gi          0B       8.0Gi";

    const NVIDIA_SMI_Q: &str = "==============NVSMI LOG==============

Attached GPUs                             : 8
GPU 00000000:07:00.0
    Product Name                          : NVIDIA A100-SXM4-80GB
    PCI
        Bus                               : 0x07
        GPU Link Info
            PCIe Generation
                Max                       : 4
                Current                   : 3
            Link Width
                Max                       : 16x
                Current                   : 16x
        Bridge Chip
            Type                          : N/A
            Firmware                      : N/A";

    #[test]
    fn test_parse_lscpu_topology() {
        let topology = parse_lscpu(LSCPU);
        assert_eq!(topology.architecture, Measured::Known("x86_64".to_string()));
        assert_eq!(
            topology.model,
            Measured::Known("AMD EPYC 7302 16-Core Processor".to_string())
        );
        assert_eq!(topology.cores, Measured::Known(32));
        assert_eq!(topology.threads, Measured::Known(64));
    }

    #[test]
    fn test_parse_lscpu_missing_fields() {
        let topology = parse_lscpu("CPU(s): 4\nSocket(s): -");
        assert_eq!(topology.architecture, Measured::Unknown);
        assert_eq!(topology.cores, Measured::Known(1));
        assert_eq!(topology.threads, Measured::Known(1));
    }

    #[test]
    fn test_parse_lscpu_overflowing_counts() {
        let topology = parse_lscpu(
            "Architecture: x86_64\nSocket(s): 4294967295\nCore(s) per socket: 2\nThread(s) per core: 2",
        );
        assert_eq!(topology.architecture, Measured::Known("x86_64".to_string()));
        assert_eq!(topology.cores, Measured::Unknown);
        assert_eq!(topology.threads, Measured::Unknown);

        // Cores fit, threads do not
        let topology = parse_lscpu(
            "Socket(s): 65536\nCore(s) per socket: 65535\nThread(s) per core: 2",
        );
        assert_eq!(topology.cores, Measured::Known(65536 * 65535));
        assert_eq!(topology.threads, Measured::Unknown);
    }

    #[test]
    fn test_parse_os_release() {
        let content = "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nPRETTY_NAME=\"Ubuntu 22.04.4 LTS\"\n";
        assert_eq!(
            parse_os_release(content),
            Measured::Known("Ubuntu 22.04.4 LTS".to_string())
        );
        assert_eq!(parse_os_release("NAME=Arch"), Measured::Unknown);
    }

    #[test]
    fn test_parse_ram_size() {
        assert_eq!(parse_ram_size(FREE), Measured::Known("125Gi".to_string()));
        assert_eq!(parse_ram_size("garbage"), Measured::Unknown);
    }

    #[test]
    fn test_parse_gpu_pcie_prefers_current() {
        let link = parse_gpu_pcie(NVIDIA_SMI_Q).unwrap();
        assert_eq!(link, PcieLink::new(3, 16));
        assert_eq!(link.bandwidth(), Measured::Known(16.0));
    }

    #[test]
    fn test_parse_gpu_pcie_falls_back_to_max() {
        let output = "        GPU Link Info
            PCIe Generation
                Max                       : 5
            Link Width
                Max                       : 16x";
        assert_eq!(parse_gpu_pcie(output), Some(PcieLink::new(5, 16)));
    }

    #[test]
    fn test_parse_gpu_pcie_partial() {
        let output = "            PCIe Generation
                Current                   : 4";
        assert_eq!(parse_gpu_pcie(output), None);
    }

    #[tokio::test]
    async fn test_collect_cpu_info() {
        let dir = tempfile::tempdir().unwrap();
        let os_release = dir.path().join("os-release");
        std::fs::write(&os_release, "PRETTY_NAME=\"Rocky Linux 9.3\"\n").unwrap();

        let runner = MockRunner::new()
            .with_output("lscpu", LSCPU)
            .with_output("free -h", FREE)
            .with_output("nvidia-smi -q -i 0", NVIDIA_SMI_Q);
        let mut session = ProbeSession::new(Arc::new(runner));
        let probe = CpuProbe::new(CpuConfig {
            os_release_path: os_release,
            pcie_gpu_index: 0,
        });

        let report = probe.collect(&mut session).await;

        assert_eq!(report.cores, Measured::Known(32));
        assert_eq!(report.threads, Measured::Known(64));
        assert_eq!(report.os, Measured::Known("Rocky Linux 9.3".to_string()));
        assert_eq!(report.ram_size, Measured::Known("125Gi".to_string()));
        assert_eq!(report.pcie_gen, Measured::Known(3));
        assert_eq!(report.link_width, Measured::Known(16));
        assert_eq!(report.estimated_bw, Measured::Known(16.0));
    }

    #[tokio::test]
    async fn test_collect_cpu_info_without_tools() {
        let mut session = ProbeSession::new(Arc::new(MockRunner::new()));
        let probe = CpuProbe::new(CpuConfig {
            os_release_path: PathBuf::from("/nonexistent/os-release"),
            pcie_gpu_index: 0,
        });

        let report = probe.collect(&mut session).await;

        assert_eq!(report.architecture, Measured::Unknown);
        assert_eq!(report.cores, Measured::Unknown);
        assert_eq!(report.threads, Measured::Unknown);
        assert_eq!(report.os, Measured::Unknown);
        assert_eq!(report.ram_size, Measured::Unknown);
        assert_eq!(report.pcie_gen, Measured::Unknown);
        assert_eq!(report.estimated_bw, Measured::Unknown);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json.as_object().unwrap().len(), 9);
    }
}
