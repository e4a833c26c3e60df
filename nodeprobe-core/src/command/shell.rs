//! Shell-backed command runner

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{CommandError, CommandOutcome, CommandRunner};

/// Runs command lines through `sh -c`
///
/// Pipes in the command line (`lspci | grep ...`) are interpreted by the
/// shell, so a `grep` that matches nothing is a failed command.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    timeout: Option<Duration>,
}

impl ShellRunner {
    /// Create a runner without a timeout; a hung utility blocks the run
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a runner that abandons commands after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    async fn execute(&self, command: &str) -> Result<String, CommandError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        // Own group so a timeout also reaches pipeline and background children
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child.id();
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut wait).await {
                Ok(output) => output?,
                Err(_) => {
                    // The shell is not reaped until `wait` drops, so its pid still names the group
                    kill_process_group(pid);
                    return Err(CommandError::Timeout(timeout));
                }
            },
            None => wait.await?,
        };

        if !output.status.success() {
            return Err(match output.status.code() {
                Some(code) => CommandError::ExitStatus(code),
                None => CommandError::Signal,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    // SAFETY: killpg only sends a signal; the group leader is still unreaped
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(
            pid,
            error = %std::io::Error::last_os_error(),
            "Failed to kill timed out process group"
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> CommandOutcome {
        match self.execute(command).await {
            Ok(output) => CommandOutcome::Success(output),
            Err(e) => CommandOutcome::failure(command, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_success_trims_output() {
        let runner = ShellRunner::new();
        let outcome = runner.run("printf '  hello\\n\\n'").await;
        assert_eq!(outcome, CommandOutcome::success("hello"));
    }

    #[tokio::test]
    async fn test_shell_pipeline() {
        let runner = ShellRunner::new();
        let outcome = runner.run("printf 'a\\nb\\nc\\n' | grep b").await;
        assert_eq!(outcome, CommandOutcome::success("b"));
    }

    #[tokio::test]
    async fn test_shell_non_zero_exit() {
        let runner = ShellRunner::new();
        match runner.run("exit 3").await {
            CommandOutcome::Failure(failure) => {
                assert_eq!(failure.command, "exit 3");
                assert!(failure.reason.contains("exit status 3"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shell_grep_without_match_fails() {
        let runner = ShellRunner::new();
        let outcome = runner.run("echo nothing | grep nvme").await;
        assert!(matches!(outcome, CommandOutcome::Failure(_)));
    }

    #[tokio::test]
    async fn test_shell_stderr_is_suppressed() {
        let runner = ShellRunner::new();
        let outcome = runner.run("echo out; echo err 1>&2").await;
        assert_eq!(outcome, CommandOutcome::success("out"));
    }

    #[tokio::test]
    async fn test_shell_timeout() {
        let runner = ShellRunner::with_timeout(Duration::from_millis(50));
        match runner.run("sleep 5").await {
            CommandOutcome::Failure(failure) => assert!(failure.reason.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shell_timeout_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let runner = ShellRunner::with_timeout(Duration::from_millis(100));

        let command = format!("(sleep 1; touch {}) & wait", marker.display());
        match runner.run(&command).await {
            CommandOutcome::Failure(failure) => assert!(failure.reason.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
