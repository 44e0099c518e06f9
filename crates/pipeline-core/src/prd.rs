//! The task descriptor ("PRD") and its on-disk store.
//!
//! A descriptor lives in three places over its lifetime: embedded in a
//! tracker issue body under [`EMBED_HEADING`], materialized to the task file
//! while its issue is in progress, and mutated in place by the coding agent
//! as stories complete. Keys the agent adds that this crate doesn't know
//! about are carried through load/save untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Heading that introduces the embedded descriptor in an issue body.
pub const EMBED_HEADING: &str = "## Task Descriptor";

// ---------------------------------------------------------------------------
// Story
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryStatus {
    Incomplete,
    Complete,
    Skipped,
}

impl StoryStatus {
    /// `complete` and `skipped` both count as done.
    pub fn is_done(self) -> bool {
        matches!(self, StoryStatus::Complete | StoryStatus::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub priority: i64,
    pub status: StoryStatus,
    #[serde(default = "default_phase")]
    pub phase: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_phase() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// TaskDescriptor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub total_stories: usize,
    pub completed_stories: usize,
    pub current_iteration: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub project: String,
    pub description: String,
    pub user_stories: Vec<Story>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<BTreeMap<String, PhaseInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskDescriptor {
    /// Decode untrusted JSON (generator output, issue bodies). Any shape
    /// mismatch, and a descriptor with no stories, is rejected.
    pub fn from_json_strict(text: &str) -> Option<Self> {
        match serde_json::from_str::<TaskDescriptor>(text) {
            Ok(desc) if desc.user_stories.is_empty() => {
                tracing::warn!(project = %desc.project, "task descriptor has no stories");
                None
            }
            Ok(desc) => Some(desc),
            Err(e) => {
                tracing::warn!(error = %e, "task descriptor failed to decode");
                None
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.user_stories.iter().all(|s| s.status.is_done())
    }

    /// `(done, total)` where done counts complete and skipped stories.
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .user_stories
            .iter()
            .filter(|s| s.status.is_done())
            .count();
        (done, self.user_stories.len())
    }

    /// Fill `metadata`, `phases` and `branchName` when missing. Fields that
    /// are already present are never touched, so this is idempotent.
    /// Returns true if anything was filled.
    pub fn normalize(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        if self.metadata.is_none() {
            let completed = self
                .user_stories
                .iter()
                .filter(|s| s.status.is_done())
                .count();
            self.metadata = Some(Metadata {
                created_at: now,
                last_updated_at: now,
                total_stories: self.user_stories.len(),
                completed_stories: completed,
                current_iteration: 1,
            });
            changed = true;
        }

        if self.phases.is_none() {
            self.phases = Some(default_phases(&self.user_stories));
            changed = true;
        }

        if self.branch_name.is_none() {
            self.branch_name = Some(format!("feature/{}", slugify(&self.project)));
            changed = true;
        }

        changed
    }

    /// Prepare a freshly selected descriptor for its first implementation
    /// run: metadata is recomputed from scratch, everything else defaulted.
    pub fn materialize(&mut self, now: DateTime<Utc>) {
        self.metadata = Some(Metadata {
            created_at: now,
            last_updated_at: now,
            total_stories: self.user_stories.len(),
            completed_stories: 0,
            current_iteration: 1,
        });
        self.normalize(now);
    }

    /// Render the issue-body section that embeds this descriptor.
    pub fn to_embedded_section(&self) -> Result<String> {
        let json = serde_json::to_string_pretty(self)?;
        Ok(format!("{EMBED_HEADING}\n\n```json\n{json}\n```\n"))
    }
}

fn default_phases(stories: &[Story]) -> BTreeMap<String, PhaseInfo> {
    let mut ids: Vec<u32> = stories.iter().map(|s| s.phase).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        ids.push(default_phase());
    }
    ids.into_iter()
        .map(|n| {
            (
                n.to_string(),
                PhaseInfo {
                    name: format!("Phase {n}"),
                    description: format!("Stories assigned to phase {n}"),
                },
            )
        })
        .collect()
}

/// Lowercase alphanumerics joined by single hyphens, at most 40 chars.
pub fn slugify(s: &str) -> String {
    let mut out = String::new();
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.truncate(40);
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}

// ---------------------------------------------------------------------------
// Embedded descriptor extraction
// ---------------------------------------------------------------------------

static JSON_FENCE_RE: OnceLock<Regex> = OnceLock::new();

fn json_fence_re() -> &'static Regex {
    JSON_FENCE_RE.get_or_init(|| {
        Regex::new(r"(?s)```json[ \t]*\r?\n(.*?)\r?\n[ \t]*```").expect("static regex")
    })
}

/// Locate the fenced ```json block in an issue body and decode it. The block
/// under [`EMBED_HEADING`] wins; without the heading the first json block is
/// used. Missing block or bad JSON yields `None`.
pub fn extract_embedded(body: &str) -> Option<TaskDescriptor> {
    let search_from = body.find(EMBED_HEADING).unwrap_or(0);
    let caps = json_fence_re().captures(&body[search_from..])?;
    TaskDescriptor::from_json_strict(caps.get(1)?.as_str())
}

// ---------------------------------------------------------------------------
// PrdStore
// ---------------------------------------------------------------------------

/// The task file on disk.
#[derive(Debug, Clone)]
pub struct PrdStore {
    path: PathBuf,
}

impl PrdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing and unparsable files both come back as `None`.
    pub fn load(&self) -> Option<TaskDescriptor> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "task file unreadable");
                }
                return None;
            }
        };
        match serde_json::from_str(&data) {
            Ok(desc) => Some(desc),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "task file failed to parse");
                None
            }
        }
    }

    pub fn save(&self, desc: &TaskDescriptor) -> Result<()> {
        let mut data = serde_json::to_string_pretty(desc)?;
        data.push('\n');
        crate::io::atomic_write(&self.path, data.as_bytes())
    }

    /// Default missing fields and persist only if something changed.
    pub fn normalize(&self, desc: &mut TaskDescriptor) -> Result<bool> {
        let changed = desc.normalize(Utc::now());
        if changed {
            self.save(desc)?;
        }
        Ok(changed)
    }

    /// True when every story is done, and also when the task file cannot be
    /// loaded: an unreadable file must not wedge the pipeline.
    pub fn is_complete(&self) -> bool {
        match self.load() {
            Some(desc) => desc.is_complete(),
            None => true,
        }
    }

    pub fn materialize(&self, mut desc: TaskDescriptor) -> Result<TaskDescriptor> {
        desc.materialize(Utc::now());
        self.save(&desc)?;
        Ok(desc)
    }

    /// Remove the task file. Idempotent.
    pub fn clear(&self) -> Result<bool> {
        crate::io::remove_if_exists(&self.path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
