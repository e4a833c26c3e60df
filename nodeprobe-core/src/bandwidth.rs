//! PCIe bandwidth estimation
//!
//! Maps a PCIe generation and lane width to an estimated link bandwidth.
//! Shared by the GPU link probe and the NIC inventory.

use serde::{Deserialize, Serialize};

use crate::report::Measured;

/// Per-lane bandwidth in GB/s, indexed by PCIe generation
const PER_LANE_GBPS: [(u8, f64); 4] = [(3, 1.0), (4, 2.0), (5, 4.0), (6, 8.0)];

/// Signaling rate (GT/s, rounded) to PCIe generation
const RATE_TO_GENERATION: [(u32, u8); 6] = [(2, 1), (5, 2), (8, 3), (16, 4), (32, 5), (64, 6)];

/// A negotiated PCIe link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcieLink {
    /// PCIe generation (1-6)
    pub generation: u8,
    /// Lane count (x1, x4, x16, ...)
    pub width: u32,
}

impl PcieLink {
    /// Create a new link description
    pub fn new(generation: u8, width: u32) -> Self {
        Self { generation, width }
    }

    /// Estimated link bandwidth in GB/s
    pub fn bandwidth(&self) -> Measured<f64> {
        estimate(self.generation, self.width)
    }
}

/// Per-lane GB/s for a generation, if the generation is in the table
pub fn per_lane_gbps(generation: u8) -> Option<f64> {
    PER_LANE_GBPS
        .iter()
        .find(|(gen, _)| *gen == generation)
        .map(|(_, gbps)| *gbps)
}

/// Estimate link bandwidth in GB/s
///
/// Unknown generations (and zero-width links) yield `Unknown`; the table is
/// never extrapolated.
pub fn estimate(generation: u8, width: u32) -> Measured<f64> {
    match per_lane_gbps(generation) {
        Some(per_lane) if width > 0 => Measured::Known(round2(per_lane * width as f64)),
        _ => Measured::Unknown,
    }
}

/// Map an observed signaling rate in GT/s to a PCIe generation
pub fn generation_from_rate(gt_per_sec: f64) -> Option<u8> {
    let rate = gt_per_sec.round();
    if rate < 0.0 {
        return None;
    }
    RATE_TO_GENERATION
        .iter()
        .find(|(r, _)| *r as f64 == rate)
        .map(|(_, gen)| *gen)
}

/// Best-effort bandwidth for a link described by its signaling rate
///
/// Uses the generation table when the rate is recognised, otherwise a rough
/// proportional estimate (128b/130b encoding, 8 bits per byte).
pub fn estimate_from_rate(gt_per_sec: f64, width: u32) -> f64 {
    let table = generation_from_rate(gt_per_sec).and_then(per_lane_gbps);
    let gbps = match table {
        Some(per_lane) => per_lane * width as f64,
        None => gt_per_sec * 0.985 * width as f64 * 0.125,
    };
    round2(gbps)
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
