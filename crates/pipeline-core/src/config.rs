use crate::error::{PipelineError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// TrackerConfig
// ---------------------------------------------------------------------------

/// Label names on the issue tracker that encode queue state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelConfig {
    #[serde(default = "default_queued_label")]
    pub queued: String,
    #[serde(default = "default_in_progress_label")]
    pub in_progress: String,
    #[serde(default = "default_completed_label")]
    pub completed: String,
}

fn default_queued_label() -> String {
    "queued".to_string()
}

fn default_in_progress_label() -> String {
    "in-progress".to_string()
}

fn default_completed_label() -> String {
    "completed".to_string()
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            queued: default_queued_label(),
            in_progress: default_in_progress_label(),
            completed: default_completed_label(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Tracker CLI binary (GitHub CLI by default).
    #[serde(default = "default_tracker_command")]
    pub command: String,
    /// `owner/name`; omitted means the repository of the working tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default)]
    pub labels: LabelConfig,
    #[serde(default = "default_list_limit")]
    pub list_limit: u32,
    /// Search qualifier that orders listings by popularity.
    #[serde(default = "default_sort")]
    pub sort: String,
    #[serde(default = "default_tracker_timeout")]
    pub timeout_seconds: u64,
}

fn default_tracker_command() -> String {
    "gh".to_string()
}

fn default_list_limit() -> u32 {
    10
}

fn default_sort() -> String {
    "sort:reactions-+1-desc".to_string()
}

fn default_tracker_timeout() -> u64 {
    60
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            command: default_tracker_command(),
            repo: None,
            labels: LabelConfig::default(),
            list_limit: default_list_limit(),
            sort: default_sort(),
            timeout_seconds: default_tracker_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// External CLI configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_generator_command")]
    pub command: String,
    #[serde(default = "default_generator_args")]
    pub args: Vec<String>,
    #[serde(default = "default_generator_timeout")]
    pub timeout_minutes: u64,
}

fn default_generator_command() -> String {
    "claude".to_string()
}

fn default_generator_args() -> Vec<String> {
    vec!["-p".to_string(), "--output-format".to_string(), "text".to_string()]
}

fn default_generator_timeout() -> u64 {
    10
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: default_generator_command(),
            args: default_generator_args(),
            timeout_minutes: default_generator_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_runner_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_runner_timeout")]
    pub timeout_minutes: u64,
}

fn default_runner_command() -> String {
    "./scripts/ralph.sh".to_string()
}

fn default_runner_timeout() -> u64 {
    90
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: default_runner_command(),
            args: Vec::new(),
            timeout_minutes: default_runner_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_test_command")]
    pub test_command: String,
    #[serde(default = "default_test_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_push_timeout")]
    pub push_timeout_seconds: u64,
}

fn default_test_command() -> String {
    "npm test".to_string()
}

fn default_test_timeout() -> u64 {
    300
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_push_timeout() -> u64 {
    120
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            test_command: default_test_command(),
            timeout_seconds: default_test_timeout(),
            remote: default_remote(),
            branch: default_branch(),
            push_timeout_seconds: default_push_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// LockConfig / PathsConfig / BacklogConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_stale_after")]
    pub stale_after_minutes: u64,
}

fn default_stale_after() -> u64 {
    120
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_minutes: default_stale_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_lock_file")]
    pub lock_file: String,
    #[serde(default = "default_task_file")]
    pub task_file: String,
}

fn default_lock_file() -> String {
    paths::LOCK_FILE.to_string()
}

fn default_task_file() -> String {
    paths::TASK_FILE.to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            lock_file: default_lock_file(),
            task_file: default_task_file(),
        }
    }
}

/// The web application's backlog endpoint. Absent means the judging and
/// generating stages are skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogConfig {
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_judge_limit")]
    pub judge_limit: usize,
    #[serde(default = "default_generate_limit")]
    pub generate_limit: usize,
    #[serde(default = "default_backlog_timeout")]
    pub timeout_seconds: u64,
}

fn default_api_key_env() -> String {
    "PIPELINE_API_KEY".to_string()
}

fn default_judge_limit() -> usize {
    5
}

fn default_generate_limit() -> usize {
    3
}

fn default_backlog_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog: Option<BacklogConfig>,
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(PipelineError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        // An empty file is a valid all-defaults config.
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn lock_path(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.paths.lock_file)
    }

    pub fn task_path(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.paths.task_file)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.lock.stale_after_minutes.saturating_mul(60))
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        for (name, command) in [
            ("tracker.command", &self.tracker.command),
            ("generator.command", &self.generator.command),
            ("runner.command", &self.runner.command),
            ("gate.test_command", &self.gate.test_command),
        ] {
            if command.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("{name} is empty"),
                });
            }
        }

        let labels = &self.tracker.labels;
        if labels.queued == labels.in_progress
            || labels.in_progress == labels.completed
            || labels.queued == labels.completed
        {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "tracker labels must be distinct".to_string(),
            });
        }

        // Zero makes every held lock stale, so concurrent runs never exclude
        // each other.
        if self.lock.stale_after_minutes == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "lock.stale_after_minutes must be greater than 0".to_string(),
            });
        } else if self.runner.timeout_minutes >= self.lock.stale_after_minutes {
            // A runner that can outlive the staleness window lets a second run
            // reclaim the lock while the first child is still writing the tree.
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "runner.timeout_minutes ({}) is not below lock.stale_after_minutes ({})",
                    self.runner.timeout_minutes, self.lock.stale_after_minutes
                ),
            });
        }

        if self.tracker.list_limit == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "tracker.list_limit is 0; selection will never find work".to_string(),
            });
        }

        if let Some(backlog) = &self.backlog {
            if !backlog.base_url.starts_with("http://") && !backlog.base_url.starts_with("https://")
            {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("backlog.base_url '{}' is not an http(s) URL", backlog.base_url),
                });
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
