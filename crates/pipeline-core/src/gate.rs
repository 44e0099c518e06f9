use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::config::GateConfig;
use crate::exec::Exec;

// ---------------------------------------------------------------------------
// GateOutcome
// ---------------------------------------------------------------------------

/// Result of the test-and-push gate. The carried string is the captured
/// (tail-capped) output of the failing step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "output", rename_all = "snake_case")]
pub enum GateOutcome {
    Passed,
    TestsFailed(String),
    PushFailed(String),
}

impl GateOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, GateOutcome::Passed)
    }
}

impl std::fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateOutcome::Passed => write!(f, "passed"),
            GateOutcome::TestsFailed(_) => write!(f, "tests failed"),
            GateOutcome::PushFailed(_) => write!(f, "push failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Runs the test suite and, only if it passes, publishes the branch.
/// Never raises; every failure is folded into the outcome.
pub trait Gate {
    fn run_tests_and_push(&self) -> GateOutcome;
}

/// Gate backed by a shell test command and `git push`.
#[derive(Debug, Clone)]
pub struct ShellGate {
    test_command: String,
    test_timeout: Duration,
    remote: String,
    branch: String,
    push_timeout: Duration,
    cwd: PathBuf,
}

impl ShellGate {
    pub fn new(config: &GateConfig, cwd: &Path) -> Self {
        Self {
            test_command: config.test_command.clone(),
            test_timeout: Duration::from_secs(config.timeout_seconds),
            remote: config.remote.clone(),
            branch: config.branch.clone(),
            push_timeout: Duration::from_secs(config.push_timeout_seconds),
            cwd: cwd.to_path_buf(),
        }
    }

    fn run_tests(&self) -> Option<String> {
        let result = Exec::shell(&self.test_command, &self.cwd)
            .timeout(Some(self.test_timeout))
            .output();
        match result {
            Ok(out) if out.success => None,
            Ok(out) => Some(out.combined()),
            Err(e) => Some(e.to_string()),
        }
    }

    fn push(&self) -> Option<String> {
        let result = Exec::new("git", &self.cwd)
            .args(["push", self.remote.as_str(), self.branch.as_str()])
            .timeout(Some(self.push_timeout))
            .output();
        match result {
            Ok(out) if out.success => None,
            Ok(out) => Some(out.combined()),
            Err(e) => Some(e.to_string()),
        }
    }
}

impl Gate for ShellGate {
    fn run_tests_and_push(&self) -> GateOutcome {
        tracing::info!(command = %self.test_command, "running test suite");
        if let Some(output) = self.run_tests() {
            tracing::warn!(command = %self.test_command, "tests failed; skipping push");
            return GateOutcome::TestsFailed(output);
        }

        tracing::info!(remote = %self.remote, branch = %self.branch, "tests passed; pushing");
        if let Some(output) = self.push() {
            tracing::warn!(remote = %self.remote, branch = %self.branch, "push failed");
            return GateOutcome::PushFailed(output);
        }
        GateOutcome::Passed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
