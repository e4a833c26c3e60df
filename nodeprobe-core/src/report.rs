//! Diagnostic report model
//!
//! Every metric is a [`Measured`] value so that a section always carries all
//! of its keys, even when a probe could not resolve them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::probe::{CpuReport, DiskReport, GpuReport, NicReport};

/// A measurement that may be unresolved
#[derive(Debug, Clone, PartialEq)]
pub enum Measured<T> {
    /// Resolved value
    Known(T),
    /// Source output missing or unparsable
    Unknown,
    /// Capability or data source not present; optional reason replaces the
    /// literal "Unavailable"
    Unavailable(Option<String>),
    /// Benchmark could not complete; optional failure kind
    Failed(Option<String>),
}

impl<T> Measured<T> {
    /// Wrap an optional value, mapping `None` to `Unknown`
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Measured::Known(v),
            None => Measured::Unknown,
        }
    }

    /// Unavailable with an explicit reason
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Measured::Unavailable(Some(reason.into()))
    }

    /// Failed with the given failure kind
    pub fn failed(kind: impl Into<String>) -> Self {
        Measured::Failed(Some(kind.into()))
    }

    /// Borrow the resolved value, if any
    pub fn known(&self) -> Option<&T> {
        match self {
            Measured::Known(v) => Some(v),
            _ => None,
        }
    }

    /// Whether the value was resolved
    pub fn is_known(&self) -> bool {
        matches!(self, Measured::Known(_))
    }

    /// Map the resolved value, keeping the sentinel otherwise
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Measured<U> {
        match self {
            Measured::Known(v) => Measured::Known(f(v)),
            Measured::Unknown => Measured::Unknown,
            Measured::Unavailable(r) => Measured::Unavailable(r),
            Measured::Failed(k) => Measured::Failed(k),
        }
    }

    fn sentinel(&self) -> Option<String> {
        match self {
            Measured::Known(_) => None,
            Measured::Unknown => Some("Unknown".to_string()),
            Measured::Unavailable(None) => Some("Unavailable".to_string()),
            Measured::Unavailable(Some(reason)) => Some(reason.clone()),
            Measured::Failed(None) => Some("Failed".to_string()),
            Measured::Failed(Some(kind)) => Some(format!("Failed ({})", kind)),
        }
    }
}

impl<T: fmt::Display> fmt::Display for Measured<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measured::Known(v) => write!(f, "{}", v),
            other => f.write_str(&other.sentinel().unwrap_or_default()),
        }
    }
}

impl<T: Serialize> Serialize for Measured<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Measured::Known(v) => v.serialize(serializer),
            other => serializer.serialize_str(&other.sentinel().unwrap_or_default()),
        }
    }
}

/// Aggregated result of one diagnostic run
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    /// When the run finished
    #[serde(rename = "Generated At")]
    pub generated_at: DateTime<Utc>,
    /// GPU inventory and NVLink topology
    #[serde(rename = "GPU")]
    pub gpu: GpuReport,
    /// CPU, memory, OS and GPU PCIe link
    #[serde(rename = "CPU")]
    pub cpu: CpuReport,
    /// Storage and GPU Direct Storage benchmarks
    #[serde(rename = "Disk")]
    pub disk: DiskReport,
    /// NIC and RDMA inventory
    #[serde(rename = "NIC")]
    pub nic: NicReport,
    /// Command failures with remediation hints
    #[serde(rename = "Errors")]
    pub errors: Vec<String>,
}

impl DiagnosticReport {
    /// Render the report as JSON
    pub fn to_json(&self, pretty: bool) -> serde_json::Result<String> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measured_serialization() {
        let known: Measured<f64> = Measured::Known(4.0);
        assert_eq!(serde_json::to_string(&known).unwrap(), "4.0");

        let unknown: Measured<f64> = Measured::Unknown;
        assert_eq!(serde_json::to_string(&unknown).unwrap(), "\"Unknown\"");

        let unavailable: Measured<u64> = Measured::Unavailable(None);
        assert_eq!(serde_json::to_string(&unavailable).unwrap(), "\"Unavailable\"");

        let reason: Measured<u64> = Measured::unavailable("No CUDA GPU detected");
        assert_eq!(
            serde_json::to_string(&reason).unwrap(),
            "\"No CUDA GPU detected\""
        );

        let failed: Measured<u64> = Measured::failed("IoError");
        assert_eq!(serde_json::to_string(&failed).unwrap(), "\"Failed (IoError)\"");
        assert_eq!(
            serde_json::to_string(&Measured::<u64>::Failed(None)).unwrap(),
            "\"Failed\""
        );
    }

    #[test]
    fn test_measured_display() {
        assert_eq!(Measured::Known(128u64).to_string(), "128");
        assert_eq!(Measured::<u64>::Unknown.to_string(), "Unknown");
        assert_eq!(Measured::<u64>::failed("CudaError").to_string(), "Failed (CudaError)");
    }

    #[test]
    fn test_measured_helpers() {
        let value = Measured::from_option(Some(3u32));
        assert!(value.is_known());
        assert_eq!(value.clone().map(|v| v * 2), Measured::Known(6));
        assert_eq!(Measured::<u32>::from_option(None), Measured::Unknown);
        assert_eq!(
            Measured::<u32>::failed("x").map(|v| v + 1),
            Measured::failed("x")
        );
        assert_eq!(value.known(), Some(&3));
    }
}
