//! Scripted command runner for testing

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CommandOutcome, CommandRunner};

/// Mock runner answering from a table of scripted outcomes
///
/// Commands that were not scripted fail as if the executable were missing.
#[derive(Default)]
pub struct MockRunner {
    outcomes: HashMap<String, CommandOutcome>,
    /// Every command line received, in order
    invocations: Mutex<Vec<String>>,
}

impl MockRunner {
    /// Create an empty mock; every command fails
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a successful command
    pub fn with_output(mut self, command: impl Into<String>, output: impl Into<String>) -> Self {
        self.outcomes
            .insert(command.into(), CommandOutcome::success(output));
        self
    }

    /// Script a failing command
    pub fn with_failure(mut self, command: impl Into<String>, reason: impl Into<String>) -> Self {
        let command = command.into();
        let outcome = CommandOutcome::failure(command.clone(), reason);
        self.outcomes.insert(command, outcome);
        self
    }

    /// Command lines received so far
    pub fn invocations(&self) -> Vec<String> {
        self.invocations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, command: &str) -> CommandOutcome {
        if let Ok(mut calls) = self.invocations.lock() {
            calls.push(command.to_string());
        }

        self.outcomes.get(command).cloned().unwrap_or_else(|| {
            CommandOutcome::failure(command, "returned non-zero exit status 127")
        })
    }
}
