//! One bounded iteration of the autonomous coding agent.
//!
//! The agent reads the task descriptor from disk, implements one or more
//! stories, commits, and marks them complete in the same file. Completion is
//! judged by re-reading the descriptor, never from the agent's output.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::RunnerConfig;
use crate::error::Result;
use crate::exec::Exec;

/// Environment variable carrying the absolute task descriptor path.
pub const PRD_PATH_ENV: &str = "PIPELINE_PRD_PATH";

pub trait ImplementationRunner {
    /// Run one iteration. Spawn failure, non-zero exit and timeout are errors.
    fn run_once(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CliRunner {
    command: String,
    args: Vec<String>,
    cwd: PathBuf,
    task_path: PathBuf,
    timeout: Duration,
}

impl CliRunner {
    pub fn new(config: &RunnerConfig, cwd: &Path, task_path: &Path) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            cwd: cwd.to_path_buf(),
            task_path: task_path.to_path_buf(),
            timeout: Duration::from_secs(config.timeout_minutes.saturating_mul(60)),
        }
    }
}

impl ImplementationRunner for CliRunner {
    fn run_once(&self) -> Result<()> {
        tracing::info!(command = %self.command, "starting implementation iteration");
        let out = Exec::new(&self.command, &self.cwd)
            .args(self.args.iter().cloned())
            .env(PRD_PATH_ENV, self.task_path.display().to_string())
            .timeout(Some(self.timeout))
            .checked()?;
        tracing::info!(
            command = %self.command,
            output_bytes = out.stdout.len(),
            "implementation iteration finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use tempfile::TempDir;

    fn config(command: &str, args: &[&str]) -> RunnerConfig {
        RunnerConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout_minutes: 1,
        }
    }

    #[test]
    fn runner_sees_task_path_env() {
        let dir = TempDir::new().unwrap();
        let task = dir.path().join(".pipeline/prd.json");
        let cfg = config("sh", &["-c", "echo \"$PIPELINE_PRD_PATH\" > seen.txt"]);
        CliRunner::new(&cfg, dir.path(), &task).run_once().unwrap();
        let seen = std::fs::read_to_string(dir.path().join("seen.txt")).unwrap();
        assert_eq!(seen.trim(), task.display().to_string());
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let dir = TempDir::new().unwrap();
        let cfg = config("sh", &["-c", "echo 'agent crashed' >&2; exit 3"]);
        let err = CliRunner::new(&cfg, dir.path(), &dir.path().join("prd.json"))
            .run_once()
            .unwrap_err();
        match err {
            PipelineError::CommandFailed { status, output, .. } => {
                assert_eq!(status, "exit code 3");
                assert!(output.contains("agent crashed"));
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn timed_out_agent_leaves_no_writer_behind() {
        let dir = TempDir::new().unwrap();
        let cfg = config("sh", &["-c", "(sleep 1; echo late > edited.txt); true"]);
        let mut runner = CliRunner::new(&cfg, dir.path(), &dir.path().join("prd.json"));
        runner.timeout = Duration::from_millis(300);

        let err = runner.run_once().unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { .. }));

        std::thread::sleep(Duration::from_millis(1500));
        assert!(!dir.path().join("edited.txt").exists());
    }

    #[test]
    fn huge_timeout_saturates() {
        let mut cfg = config("true", &[]);
        cfg.timeout_minutes = u64::MAX;
        let runner = CliRunner::new(&cfg, Path::new("."), Path::new("prd.json"));
        assert_eq!(runner.timeout, Duration::from_secs(u64::MAX));
    }

    #[test]
    fn missing_binary_is_an_error() {
        let dir = TempDir::new().unwrap();
        let cfg = config("definitely-not-a-real-agent-xyz", &[]);
        let err = CliRunner::new(&cfg, dir.path(), &dir.path().join("prd.json"))
            .run_once()
            .unwrap_err();
        assert!(matches!(err, PipelineError::Spawn { .. }));
    }
}
