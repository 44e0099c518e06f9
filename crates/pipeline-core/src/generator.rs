//! Content generation through an external LLM CLI.
//!
//! The CLI receives one prompt on stdin and prints either bare JSON or JSON
//! wrapped in a markdown fence. Every failure mode (spawn, non-zero exit,
//! timeout, fence-stripped text that does not decode into the expected
//! shape) collapses to `None` at this boundary; callers decide whether to
//! skip the item for this run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backlog::FeatureRequest;
use crate::config::GeneratorConfig;
use crate::error::{PipelineError, Result};
use crate::exec::Exec;
use crate::prd::TaskDescriptor;
use crate::prompts;

/// Raw text-in/text-out contract of the generation CLI.
pub trait ContentGenerator {
    fn complete(&self, prompt: &str) -> Result<String>;
}

/// The configured CLI, prompt on stdin, response on stdout.
#[derive(Debug, Clone)]
pub struct CliGenerator {
    command: String,
    args: Vec<String>,
    cwd: PathBuf,
    timeout: Duration,
}

impl CliGenerator {
    pub fn new(config: &GeneratorConfig, cwd: &Path) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            cwd: cwd.to_path_buf(),
            timeout: Duration::from_secs(config.timeout_minutes.saturating_mul(60)),
        }
    }
}

impl ContentGenerator for CliGenerator {
    fn complete(&self, prompt: &str) -> Result<String> {
        let out = Exec::new(&self.command, &self.cwd)
            .args(self.args.iter().cloned())
            .stdin(prompt)
            .timeout(Some(self.timeout))
            .checked()?;
        Ok(out.stdout)
    }
}

/// Verdict from the triage prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageVerdict {
    pub approved: bool,
    pub reason: String,
}

/// Remove an optional ```/```json fence around a response.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening line.
    let rest = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(strip_code_fence(text)).map_err(|e| PipelineError::UnexpectedOutput {
        source_name: "generator".to_string(),
        reason: e.to_string(),
    })
}

/// Descriptor generation and triage over a [`ContentGenerator`].
pub struct Generator<'a> {
    backend: &'a dyn ContentGenerator,
}

impl<'a> Generator<'a> {
    pub fn new(backend: &'a dyn ContentGenerator) -> Self {
        Self { backend }
    }

    /// Turn a feature title plus free-form context into a task descriptor.
    pub fn generate(&self, title: &str, context: &str) -> Option<TaskDescriptor> {
        let prompt = prompts::descriptor_prompt(title, context);
        let response = match self.backend.complete(&prompt) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(title, error = %e, "descriptor generation failed");
                return None;
            }
        };
        let desc = TaskDescriptor::from_json_strict(strip_code_fence(&response));
        if desc.is_none() {
            tracing::warn!(title, "generator returned an unusable descriptor");
        }
        desc
    }

    pub fn triage(&self, request: &FeatureRequest) -> Option<TriageVerdict> {
        let prompt = prompts::triage_prompt(request);
        let result = self
            .backend
            .complete(&prompt)
            .and_then(|response| decode::<TriageVerdict>(&response));
        match result {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                tracing::warn!(request = %request.id, title = %request.title, error = %e, "triage failed");
                None
            }
        }
    }
}
