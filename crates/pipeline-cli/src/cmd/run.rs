use crate::output::print_json;
use anyhow::Context;
use pipeline_core::backlog::HttpBacklog;
use pipeline_core::config::{Config, WarnLevel};
use pipeline_core::gate::ShellGate;
use pipeline_core::generator::{CliGenerator, Generator};
use pipeline_core::lock::PipelineLock;
use pipeline_core::prd::PrdStore;
use pipeline_core::queue::{GhTracker, Queue};
use pipeline_core::runner::CliRunner;
use pipeline_core::sequencer::{BacklogStage, Pipeline, RunOutcome, RunReport};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    check_config(&config)?;

    let lock = PipelineLock::new(config.lock_path(root), config.stale_after());
    let store = PrdStore::new(config.task_path(root));
    let tracker = GhTracker::new(&config.tracker, root);
    let generator = CliGenerator::new(&config.generator, root);
    let runner = CliRunner::new(&config.runner, root, store.path());
    let gate = ShellGate::new(&config.gate, root);

    // A missing key disables the backlog stages; it never blocks the queue.
    let backlog = config.backlog.as_ref().and_then(|cfg| {
        match HttpBacklog::from_config(cfg) {
            Ok(client) => Some((client, cfg)),
            Err(e) => {
                tracing::warn!(error = %e, "backlog unavailable; skipping judge and generate stages");
                None
            }
        }
    });

    let mut pipeline = Pipeline::new(
        &lock,
        Queue::new(
            &tracker,
            config.tracker.labels.clone(),
            config.tracker.list_limit,
        ),
        &store,
        Generator::new(&generator),
        &runner,
        &gate,
    );
    if let Some((client, cfg)) = &backlog {
        pipeline = pipeline.with_backlog(BacklogStage {
            backlog: client,
            judge_limit: cfg.judge_limit,
            generate_limit: cfg.generate_limit,
        });
    }

    let report = pipeline.run().context("pipeline run failed")?;
    tracing::info!(
        judged = report.judged,
        promoted = report.promoted,
        outcome = ?report.outcome,
        "pipeline run finished"
    );

    if json {
        print_json(&report)?;
    } else {
        println!("{}", summarize(&report));
    }
    Ok(())
}

fn check_config(config: &Config) -> anyhow::Result<()> {
    let mut errors = 0;
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => tracing::warn!("config: {}", w.message),
            WarnLevel::Error => {
                tracing::error!("config: {}", w.message);
                errors += 1;
            }
        }
    }
    if errors > 0 {
        anyhow::bail!("config has {errors} error(s); see `pipeline config validate`");
    }
    Ok(())
}

fn summarize(report: &RunReport) -> String {
    let outcome = match &report.outcome {
        RunOutcome::LockHeld => "another run holds the lock; nothing done".to_string(),
        RunOutcome::Idle => "nothing to do".to_string(),
        RunOutcome::Skipped { item, reason } => format!("skipped #{item}: {reason}"),
        RunOutcome::Completed { item, gate } => format!("completed #{item} (gate: {gate})"),
        RunOutcome::Progressed { item, gate } => format!("progressed #{item} (gate: {gate})"),
        RunOutcome::Aborted { item, error } => format!("aborted #{item}: {error}"),
    };
    format!(
        "judged {}, promoted {}; {outcome}",
        report.judged, report.promoted
    )
}
