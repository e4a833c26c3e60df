//! Hardware probes
//!
//! Each probe runs its host utilities through the [`ProbeSession`], parses
//! the output with one narrow parser per tool, and returns a report section
//! in which every key is present:
//! - GPU: inventory and NVLink topology (nvidia-smi)
//! - CPU: lscpu, os-release, free, GPU PCIe link
//! - Disk: mountpoint selection, fio and GPU Direct Storage benchmarks
//! - NIC: RDMA devices, network controllers, PCIe links, drivers
//!
//! [`ProbeSession`]: crate::command::ProbeSession

mod cpu;
mod disk;
mod gpu;
mod nic;

pub use cpu::{
    parse_gpu_pcie, parse_lscpu, parse_os_release, parse_ram_size, CpuConfig, CpuProbe, CpuReport,
    CpuTopology,
};
pub use disk::{
    parse_df_avail, parse_lsblk_mountpoint, BenchmarkTarget, DiskConfig, DiskProbe, DiskReport,
};
pub use gpu::{
    has_nvlink, parse_gpu_type, parse_nvlink_bonds, parse_vram_type, GpuProbe, GpuReport,
    NvlinkBond, NvlinkBondMap,
};
pub use nic::{
    classify_transport, is_infiniband, parse_link_status, parse_module_version, parse_modules,
    parse_transport, NicConfig, NicProbe, NicReport, VendorDevice,
};

/// Parse the leading decimal digits of a value such as `16x` or `4`
pub(crate) fn leading_number(value: &str) -> Option<u32> {
    let digits: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
