//! nodeprobe Core Library
//!
//! Hardware probing for LMCache capacity planning.
//! This crate provides the command probe adapter, tool output parsers,
//! storage and GPU Direct Storage benchmarks, and the recommendation engine.

pub mod bandwidth;
pub mod benchmark;
pub mod command;
pub mod diagnostics;
pub mod metrics;
pub mod probe;
pub mod recommend;
pub mod report;

// Re-export common types
pub use bandwidth::PcieLink;
pub use benchmark::{BenchmarkResult, Capability, DirectStorage, Direction, GdsError, GdsSession};
pub use command::{CommandFailure, CommandOutcome, CommandRunner, ProbeSession, ShellRunner};
pub use diagnostics::{Diagnostics, ProbeConfig};
pub use recommend::{NetworkClass, Recommendation, RecommendConfig};
pub use report::{DiagnosticReport, Measured};
