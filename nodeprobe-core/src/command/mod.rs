//! Command probe adapter
//!
//! Runs host utilities and hands their stdout to the parsers. A failed
//! command never raises past this boundary: the caller gets `None` and the
//! failure is recorded on the [`ProbeSession`] with a remediation hint.

mod mock;
mod shell;

pub use mock::MockRunner;
pub use shell::ShellRunner;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::metrics::MetricsRegistry;

/// Remediation hints keyed by executable name
const SUGGESTIONS: &[(&str, &str)] = &[
    ("nvidia-smi", "Install NVIDIA drivers / CUDA toolkit to get nvidia-smi."),
    ("lspci", "Install pciutils (e.g. `sudo apt install pciutils`)."),
    ("lsblk", "Install util-linux (e.g. `sudo apt install util-linux`)."),
    ("lscpu", "Install util-linux (e.g. `sudo apt install util-linux`)."),
    ("fio", "Install fio benchmark tool (e.g. `sudo apt install fio`)."),
    ("ibv_devinfo", "Install rdma-core (e.g. `sudo apt install rdma-core`)."),
    ("modinfo", "Install kmod (e.g. `sudo apt install kmod`)."),
    ("lsmod", "Install kmod (e.g. `sudo apt install kmod`)."),
    ("ibstat", "Install rdma-core for InfiniBand diagnostics."),
    ("free", "Install procps (e.g. `sudo apt install procps`)."),
    ("df", "Install coreutils (e.g. `sudo apt install coreutils`)."),
    ("dpkg", "rdma-core not found via dpkg; rpm is tried next."),
    ("rpm", "rdma-core not found via rpm; install it with your package manager."),
    (
        "cufile",
        "Install NVIDIA GDS libraries (`nvidia-fs-dkms` and `nvidia-fs-tools`).",
    ),
];

/// Errors raised while executing a command
#[derive(Debug, Error)]
pub enum CommandError {
    /// The shell could not be spawned
    #[error("failed to spawn shell: {0}")]
    Spawn(#[from] std::io::Error),

    /// The command exited unsuccessfully
    #[error("returned non-zero exit status {0}")]
    ExitStatus(i32),

    /// The command was killed by a signal
    #[error("terminated by signal")]
    Signal,

    /// The command exceeded the configured timeout
    #[error("timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
}

/// A failed command with its remediation hint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    /// Full command line
    pub command: String,
    /// Human-readable failure reason
    pub reason: String,
    /// Suggested fix, looked up by executable name
    pub hint: Option<&'static str>,
}

impl CommandFailure {
    /// Create a failure, looking up the hint for the command's executable
    pub fn new(command: impl Into<String>, reason: impl Into<String>) -> Self {
        let command = command.into();
        let hint = suggestion_for(&command);
        Self {
            command,
            reason: reason.into(),
            hint,
        }
    }

    /// Executable that failed
    pub fn executable(&self) -> &str {
        executable_name(&self.command)
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command failed: '{}'. Error: {}", self.command, self.reason)?;
        if let Some(hint) = self.hint {
            write!(f, ". Suggestion: {}", hint)?;
        }
        Ok(())
    }
}

/// Result of running a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Captured, trimmed stdout
    Success(String),
    /// The command could not produce output
    Failure(CommandFailure),
}

impl CommandOutcome {
    /// Successful outcome
    pub fn success(output: impl Into<String>) -> Self {
        CommandOutcome::Success(output.into())
    }

    /// Failed outcome for `command`
    pub fn failure(command: impl Into<String>, reason: impl Into<String>) -> Self {
        CommandOutcome::Failure(CommandFailure::new(command, reason))
    }
}

/// Executes shell commands on the host
///
/// Implementations capture stdout and suppress stderr. They must never
/// panic on a missing executable; that is a `Failure` outcome.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a shell command line
    async fn run(&self, command: &str) -> CommandOutcome;
}

/// Executable name of a command line, skipping a leading `sudo` and its flags
pub fn executable_name(command: &str) -> &str {
    let mut tokens = command.split_whitespace().peekable();
    if tokens.peek() == Some(&"sudo") {
        tokens.next();
        while tokens.peek().is_some_and(|t| t.starts_with('-')) {
            tokens.next();
        }
    }
    tokens.next().unwrap_or("")
}

/// Remediation hint for the executable of a command line
pub fn suggestion_for(command: &str) -> Option<&'static str> {
    let exe = executable_name(command);
    SUGGESTIONS
        .iter()
        .find(|(name, _)| *name == exe)
        .map(|(_, hint)| *hint)
}

/// Command execution context for one diagnostic run
///
/// Owns the list of command failures; the driver drains it into the
/// report's `Errors` section at the end of the run.
pub struct ProbeSession {
    runner: Arc<dyn CommandRunner>,
    failures: Vec<CommandFailure>,
    metrics: MetricsRegistry,
}

impl ProbeSession {
    /// Create a new session over a runner
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            failures: Vec::new(),
            metrics: MetricsRegistry::new(),
        }
    }

    /// Run a command, returning its non-empty output
    ///
    /// Failures are recorded and yield `None`. Empty output also yields
    /// `None` but is not a failure.
    pub async fn run(&mut self, command: &str) -> Option<String> {
        trace!(command = %command, "Running command");

        match self.runner.run(command).await {
            CommandOutcome::Success(output) => {
                if output.is_empty() {
                    debug!(command = %command, "Command produced no output");
                    None
                } else {
                    Some(output)
                }
            }
            CommandOutcome::Failure(failure) => {
                warn!(
                    command = %failure.command,
                    reason = %failure.reason,
                    "Command failed"
                );
                self.record(failure);
                None
            }
        }
    }

    /// Record a failure that happened outside the runner
    pub fn record(&mut self, failure: CommandFailure) {
        self.metrics.inc_command_failure(failure.executable());
        self.failures.push(failure);
    }

    /// Failures recorded so far
    pub fn failures(&self) -> &[CommandFailure] {
        &self.failures
    }

    /// Drain the recorded failures
    pub fn take_failures(&mut self) -> Vec<CommandFailure> {
        std::mem::take(&mut self.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_name() {
        assert_eq!(executable_name("nvidia-smi topo -m"), "nvidia-smi");
        assert_eq!(executable_name("sudo -n lspci -s 00:1f.6 -vv"), "lspci");
        assert_eq!(executable_name("sudo lspci -vv"), "lspci");
        assert_eq!(executable_name("  lsmod | grep ib"), "lsmod");
        assert_eq!(executable_name(""), "");
    }

    #[test]
    fn test_failure_display_with_hint() {
        let failure = CommandFailure::new("fio --name=readtest", "returned non-zero exit status 127");
        assert_eq!(
            failure.to_string(),
            "Command failed: 'fio --name=readtest'. Error: returned non-zero exit status 127. \
             Suggestion: Install fio benchmark tool (e.g. `sudo apt install fio`)."
        );
    }

    #[test]
    fn test_package_query_hints() {
        // A dpkg miss also happens on Debian hosts without rdma-core
        let dpkg = suggestion_for("dpkg -l | grep rdma-core").unwrap();
        assert!(dpkg.contains("rdma-core not found"));
        assert!(!dpkg.contains("Debian"));

        let rpm = suggestion_for("rpm -q rdma-core").unwrap();
        assert!(rpm.contains("rdma-core not found"));
        assert!(!rpm.contains("RPM-based"));
    }

    #[test]
    fn test_failure_display_without_hint() {
        let failure = CommandFailure::new("ls /sys/class/infiniband", "returned non-zero exit status 2");
        assert!(failure.hint.is_none());
        assert!(!failure.to_string().contains("Suggestion"));
    }

    #[tokio::test]
    async fn test_session_records_failures() {
        let runner = MockRunner::new()
            .with_output("echo hi", "hi")
            .with_output("true", "")
            .with_failure("nvidia-smi topo -m", "returned non-zero exit status 127");
        let mut session = ProbeSession::new(Arc::new(runner));

        assert_eq!(session.run("echo hi").await.as_deref(), Some("hi"));
        assert_eq!(session.run("true").await, None);
        assert_eq!(session.run("nvidia-smi topo -m").await, None);

        assert_eq!(session.failures().len(), 1);
        let failure = &session.failures()[0];
        assert_eq!(failure.executable(), "nvidia-smi");
        assert!(failure.hint.unwrap().contains("NVIDIA drivers"));

        let drained = session.take_failures();
        assert_eq!(drained.len(), 1);
        assert!(session.failures().is_empty());
    }
}
