//! Label-tagged work queue hosted in an external issue tracker.
//!
//! [`Tracker`] is the raw call contract (fallible, one method per tracker
//! primitive). [`Queue`] layers the pipeline's policy on top: listings never
//! fail, edits are best-effort, and every failure is logged with the issue
//! it concerned. The tracker stays the source of truth; a missed relabel is
//! corrected by the next run's selection, which re-reads labels.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{LabelConfig, TrackerConfig};
use crate::error::{PipelineError, Result};
use crate::exec::Exec;

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    /// Popularity signal used for ordering (thumbs-up reactions on GitHub).
    #[serde(default)]
    pub votes: u64,
}

impl WorkItem {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

// ---------------------------------------------------------------------------
// Tracker trait
// ---------------------------------------------------------------------------

pub trait Tracker {
    /// Open items carrying `label` in the tracker's configured sort order
    /// (most popular first by default), at most `limit`.
    fn list_by_label(&self, label: &str, limit: u32) -> Result<Vec<WorkItem>>;
    fn edit_labels(&self, id: u64, add: &str, remove: &str) -> Result<()>;
    fn close(&self, id: u64) -> Result<()>;
    /// Open a new item and return its id.
    fn create(&self, title: &str, body: &str, label: &str) -> Result<u64>;
    fn set_body(&self, id: u64, body: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// GhTracker
// ---------------------------------------------------------------------------

/// GitHub issues through the `gh` CLI.
#[derive(Debug, Clone)]
pub struct GhTracker {
    command: String,
    repo: Option<String>,
    sort: String,
    cwd: PathBuf,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    reaction_groups: Vec<GhReactionGroup>,
}

#[derive(Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Deserialize)]
struct GhReactionGroup {
    content: String,
    users: GhReactionUsers,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhReactionUsers {
    total_count: u64,
}

impl From<GhIssue> for WorkItem {
    fn from(issue: GhIssue) -> Self {
        let votes = issue
            .reaction_groups
            .iter()
            .find(|g| g.content == "THUMBS_UP")
            .map(|g| g.users.total_count)
            .unwrap_or(0);
        WorkItem {
            id: issue.number,
            title: issue.title,
            body: issue.body,
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            votes,
        }
    }
}

impl GhTracker {
    pub fn new(config: &TrackerConfig, cwd: &Path) -> Self {
        Self {
            command: config.command.clone(),
            repo: config.repo.clone(),
            sort: config.sort.clone(),
            cwd: cwd.to_path_buf(),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    fn gh<I, S>(&self, args: I) -> Exec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut exec = Exec::new(&self.command, &self.cwd)
            .args(args)
            .timeout(Some(self.timeout));
        if let Some(repo) = &self.repo {
            exec = exec.arg("--repo").arg(repo);
        }
        exec
    }
}

/// Parse `gh issue list --json ...` output.
fn parse_issue_list(stdout: &str) -> Result<Vec<WorkItem>> {
    let issues: Vec<GhIssue> =
        serde_json::from_str(stdout.trim()).map_err(|e| PipelineError::UnexpectedOutput {
            source_name: "gh issue list".to_string(),
            reason: e.to_string(),
        })?;
    Ok(issues.into_iter().map(WorkItem::from).collect())
}

/// `gh issue create` prints the new issue's URL; the id is its last segment.
fn parse_created_id(stdout: &str) -> Result<u64> {
    stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|url| url.trim().rsplit('/').next())
        .and_then(|seg| seg.parse().ok())
        .ok_or_else(|| PipelineError::UnexpectedOutput {
            source_name: "gh issue create".to_string(),
            reason: format!("no issue URL in {:?}", stdout.trim()),
        })
}

impl Tracker for GhTracker {
    fn list_by_label(&self, label: &str, limit: u32) -> Result<Vec<WorkItem>> {
        let limit = limit.to_string();
        let out = self
            .gh([
                "issue",
                "list",
                "--label",
                label,
                "--state",
                "open",
                "--limit",
                limit.as_str(),
                "--search",
                self.sort.as_str(),
                "--json",
                "number,title,body,labels,reactionGroups",
            ])
            .checked()?;
        parse_issue_list(&out.stdout)
    }

    fn edit_labels(&self, id: u64, add: &str, remove: &str) -> Result<()> {
        let id = id.to_string();
        self.gh([
            "issue",
            "edit",
            id.as_str(),
            "--add-label",
            add,
            "--remove-label",
            remove,
        ])
        .checked()?;
        Ok(())
    }

    fn close(&self, id: u64) -> Result<()> {
        let id = id.to_string();
        self.gh(["issue", "close", id.as_str()]).checked()?;
        Ok(())
    }

    fn create(&self, title: &str, body: &str, label: &str) -> Result<u64> {
        let out = self
            .gh([
                "issue",
                "create",
                "--title",
                title,
                "--body-file",
                "-",
                "--label",
                label,
            ])
            .stdin(body)
            .checked()?;
        parse_created_id(&out.stdout)
    }

    fn set_body(&self, id: u64, body: &str) -> Result<()> {
        let id = id.to_string();
        self.gh(["issue", "edit", id.as_str(), "--body-file", "-"])
            .stdin(body)
            .checked()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Best-effort queue operations over a [`Tracker`].
pub struct Queue<'a> {
    tracker: &'a dyn Tracker,
    labels: LabelConfig,
    limit: u32,
}

impl<'a> Queue<'a> {
    pub fn new(tracker: &'a dyn Tracker, labels: LabelConfig, limit: u32) -> Self {
        Self {
            tracker,
            labels,
            limit,
        }
    }

    pub fn labels(&self) -> &LabelConfig {
        &self.labels
    }

    /// Items carrying `label`, in tracker order. Tracker failures and
    /// malformed output both come back as an empty list.
    pub fn list_by_label(&self, label: &str) -> Vec<WorkItem> {
        match self.tracker.list_by_label(label, self.limit) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(label, error = %e, "listing work items failed; treating as empty");
                Vec::new()
            }
        }
    }

    /// The active item, if any. More than one is an invariant breach that
    /// is logged; the first listed wins.
    pub fn in_progress(&self) -> Option<WorkItem> {
        let mut items = self.list_by_label(&self.labels.in_progress);
        if items.len() > 1 {
            let ids: Vec<u64> = items.iter().map(|i| i.id).collect();
            tracing::warn!(?ids, "multiple in-progress work items; continuing the first");
        }
        if items.is_empty() {
            None
        } else {
            Some(items.swap_remove(0))
        }
    }

    pub fn next_queued(&self) -> Option<WorkItem> {
        self.list_by_label(&self.labels.queued).into_iter().next()
    }

    pub fn relabel(&self, id: u64, add: &str, remove: &str) -> bool {
        match self.tracker.edit_labels(id, add, remove) {
            Ok(()) => {
                tracing::info!(item = id, add, remove, "relabeled work item");
                true
            }
            Err(e) => {
                tracing::warn!(item = id, add, remove, error = %e, "relabel failed");
                false
            }
        }
    }

    pub fn close(&self, id: u64) -> bool {
        match self.tracker.close(id) {
            Ok(()) => {
                tracing::info!(item = id, "closed work item");
                true
            }
            Err(e) => {
                tracing::warn!(item = id, error = %e, "close failed");
                false
            }
        }
    }

    pub fn create_queued(&self, title: &str, body: &str) -> Option<u64> {
        match self.tracker.create(title, body, &self.labels.queued) {
            Ok(id) => {
                tracing::info!(item = id, title, "created queued work item");
                Some(id)
            }
            Err(e) => {
                tracing::warn!(title, error = %e, "creating work item failed");
                None
            }
        }
    }

    /// Append `text` to the item's body as read this run.
    pub fn append_body(&self, item: &WorkItem, text: &str) -> bool {
        let body = if item.body.trim().is_empty() {
            text.to_string()
        } else {
            format!("{}\n\n{}", item.body.trim_end(), text)
        };
        match self.tracker.set_body(item.id, &body) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(item = item.id, error = %e, "appending to work item body failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
