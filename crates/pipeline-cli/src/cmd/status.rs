use crate::output::{print_fields, print_json};
use anyhow::Context;
use chrono::Utc;
use pipeline_core::config::Config;
use pipeline_core::exec::program_available;
use pipeline_core::lock::{LockState, PipelineLock};
use pipeline_core::prd::PrdStore;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct TaskSummary {
    project: String,
    branch: Option<String>,
    done: usize,
    total: usize,
}

#[derive(Serialize)]
struct ToolStatus {
    name: &'static str,
    command: String,
    available: bool,
}

#[derive(Serialize)]
struct StatusReport {
    root: String,
    lock: LockState,
    task: Option<TaskSummary>,
    tools: Vec<ToolStatus>,
    backlog: Option<String>,
}

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let lock = PipelineLock::new(config.lock_path(root), config.stale_after());
    let lock_state = lock
        .inspect(Utc::now())
        .with_context(|| format!("failed to read {}", lock.path().display()))?;

    let task = PrdStore::new(config.task_path(root)).load().map(|desc| {
        let (done, total) = desc.progress();
        TaskSummary {
            project: desc.project,
            branch: desc.branch_name,
            done,
            total,
        }
    });

    let tools = [
        ("tracker", config.tracker.command.as_str()),
        ("generator", config.generator.command.as_str()),
        ("runner", config.runner.command.as_str()),
        ("git", "git"),
    ]
    .into_iter()
    .map(|(name, command)| ToolStatus {
        name,
        command: command.to_string(),
        available: is_runnable(root, command),
    })
    .collect();

    let report = StatusReport {
        root: root.display().to_string(),
        lock: lock_state,
        task,
        tools,
        backlog: config.backlog.as_ref().map(|b| b.base_url.clone()),
    };

    if json {
        return print_json(&report);
    }

    let mut fields = vec![
        ("root", report.root.clone()),
        ("lock", describe_lock(&report.lock)),
    ];
    fields.push((
        "task",
        match &report.task {
            Some(t) => format!(
                "{} ({}/{} stories done, branch {})",
                t.project,
                t.done,
                t.total,
                t.branch.as_deref().unwrap_or("-")
            ),
            None => "none".to_string(),
        },
    ));
    for tool in &report.tools {
        let mark = if tool.available { "ok" } else { "missing" };
        fields.push((tool.name, format!("{} [{mark}]", tool.command)));
    }
    fields.push((
        "backlog",
        report
            .backlog
            .clone()
            .unwrap_or_else(|| "not configured".to_string()),
    ));
    print_fields(&fields);
    Ok(())
}

fn describe_lock(state: &LockState) -> String {
    match state {
        LockState::Free => "free".to_string(),
        LockState::Held { since, age_seconds } => {
            format!("held since {since} ({}m ago)", age_seconds / 60)
        }
        LockState::Stale {
            since: Some(since), ..
        } => format!("stale (since {since}); next run will reclaim it"),
        LockState::Stale { since: None, .. } => {
            "stale (unreadable record); next run will reclaim it".to_string()
        }
    }
}

/// Relative paths like `./scripts/ralph.sh` are checked against the root.
fn is_runnable(root: &Path, command: &str) -> bool {
    if command.contains('/') && !Path::new(command).is_absolute() {
        return root.join(command).is_file();
    }
    program_available(command)
}
