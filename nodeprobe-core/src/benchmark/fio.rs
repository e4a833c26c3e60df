//! fio disk benchmark

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{BenchmarkResult, Direction};
use crate::bandwidth::round2;
use crate::command::ProbeSession;
use crate::report::Measured;

static BW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)BW=([0-9]+(?:\.[0-9]+)?)(KiB|MiB|GiB)/s").expect("Invalid fio bandwidth regex")
});

static IOPS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)IOPS=([0-9]+(?:\.[0-9]+)?)([kM])?").expect("Invalid fio IOPS regex")
});

/// fio job profile shared by the read and write runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FioProfile {
    /// File size per job
    pub size: String,
    /// Block size
    pub block_size: String,
    pub ioengine: String,
    /// Bypass the page cache
    pub direct: bool,
    pub numjobs: u32,
    pub iodepth: u32,
}

impl Default for FioProfile {
    fn default() -> Self {
        Self {
            size: "1G".to_string(),
            block_size: "32M".to_string(),
            ioengine: "libaio".to_string(),
            direct: true,
            numjobs: 4,
            iodepth: 32,
        }
    }
}

/// fio `--rw` mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FioMode {
    Read,
    Write,
}

impl FioMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FioMode::Read => "read",
            FioMode::Write => "write",
        }
    }

    /// Read measures Disk -> CPU, write measures CPU -> Disk
    pub fn direction(&self) -> Direction {
        match self {
            FioMode::Read => Direction::DiskToCpu,
            FioMode::Write => Direction::CpuToDisk,
        }
    }
}

/// Build the fio command line for a run
pub fn fio_command(directory: &Path, mode: FioMode, profile: &FioProfile) -> String {
    let mode = mode.as_str();
    format!(
        "fio --name={mode}test --directory={} --size={} --bs={} --rw={mode} --ioengine={} \
         --direct={} --numjobs={} --iodepth={} --group_reporting",
        directory.display(),
        profile.size,
        profile.block_size,
        profile.ioengine,
        u8::from(profile.direct),
        profile.numjobs,
        profile.iodepth,
    )
}

/// Parse the aggregate `BW=`/`IOPS=` fields of fio output
///
/// Bandwidth is normalised to MiB/s and divided by 1024 for GB/s.
pub fn parse_fio_output(output: &str) -> (Measured<f64>, Measured<u64>) {
    let bandwidth = BW_RE.captures(output).and_then(|caps| {
        let value: f64 = caps[1].parse().ok()?;
        let mib = match caps[2].to_ascii_lowercase().as_str() {
            "kib" => value / 1024.0,
            "gib" => value * 1024.0,
            _ => value,
        };
        Some(round2(mib / 1024.0))
    });

    let iops = IOPS_RE.captures(output).and_then(|caps| {
        let value: f64 = caps[1].parse().ok()?;
        let scale = match caps.get(2).map(|m| m.as_str()) {
            Some("k") | Some("K") => 1e3,
            Some("m") | Some("M") => 1e6,
            _ => 1.0,
        };
        Some((value * scale).round() as u64)
    });

    (Measured::from_option(bandwidth), Measured::from_option(iops))
}

/// Run one fio benchmark against `directory`
///
/// A fio run that produces no output reports both metrics as `Failed`.
pub async fn run_fio(
    session: &mut ProbeSession,
    directory: &Path,
    mode: FioMode,
    profile: &FioProfile,
) -> BenchmarkResult {
    let command = fio_command(directory, mode, profile);
    debug!(command = %command, "Starting fio");

    let Some(output) = session.run(&command).await else {
        return BenchmarkResult::failed(mode.direction(), None);
    };

    let (bandwidth, iops) = parse_fio_output(&output);
    info!(
        direction = %mode.direction(),
        bandwidth_gbps = %bandwidth,
        iops = %iops,
        "fio run complete"
    );
    BenchmarkResult::new(mode.direction(), bandwidth, iops)
}
