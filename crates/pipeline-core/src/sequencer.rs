//! One pipeline invocation, from lock acquisition to lock release.
//!
//! Stages run strictly in order: judge pending backlog requests, promote
//! approved ones into queued tracker items, select one item, then either
//! continue it (already in progress) or start it (next in the queue), and
//! finally run the test-and-push gate. Everything external is best-effort
//! and recovered at the stage boundary; only local-resource failures (lock
//! file, task file) propagate out of [`Pipeline::run`].

use serde::Serialize;

use crate::backlog::{Backlog, FeatureRequest};
use crate::error::Result;
use crate::gate::{Gate, GateOutcome};
use crate::generator::Generator;
use crate::lock::PipelineLock;
use crate::prd::{self, PrdStore, TaskDescriptor};
use crate::prompts;
use crate::queue::{Queue, WorkItem};
use crate::runner::ImplementationRunner;

// ---------------------------------------------------------------------------
// RunOutcome / RunReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Another invocation holds the lock; nothing was touched.
    LockHeld,
    /// Nothing in progress and nothing queued.
    Idle,
    /// The selected item could not be started; its labels are unchanged.
    Skipped { item: u64, reason: String },
    /// The in-progress item was finished and closed.
    Completed { item: u64, gate: GateOutcome },
    /// One implementation iteration ran on the item.
    Progressed { item: u64, gate: GateOutcome },
    /// The implementation runner failed; the gate did not run.
    Aborted { item: u64, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub judged: usize,
    pub promoted: usize,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

impl RunReport {
    fn lock_held() -> Self {
        Self {
            judged: 0,
            promoted: 0,
            outcome: RunOutcome::LockHeld,
        }
    }
}

/// Backlog collaborator plus its per-run limits.
pub struct BacklogStage<'a> {
    pub backlog: &'a dyn Backlog,
    pub judge_limit: usize,
    pub generate_limit: usize,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline<'a> {
    lock: &'a PipelineLock,
    queue: Queue<'a>,
    store: &'a PrdStore,
    generator: Generator<'a>,
    runner: &'a dyn ImplementationRunner,
    gate: &'a dyn Gate,
    backlog: Option<BacklogStage<'a>>,
}

/// Log a failed best-effort step and continue without its value.
fn recover<T>(stage: &'static str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(stage, error = %e, "step failed; continuing");
            None
        }
    }
}

impl<'a> Pipeline<'a> {
    pub fn new(
        lock: &'a PipelineLock,
        queue: Queue<'a>,
        store: &'a PrdStore,
        generator: Generator<'a>,
        runner: &'a dyn ImplementationRunner,
        gate: &'a dyn Gate,
    ) -> Self {
        Self {
            lock,
            queue,
            store,
            generator,
            runner,
            gate,
            backlog: None,
        }
    }

    pub fn with_backlog(mut self, stage: BacklogStage<'a>) -> Self {
        self.backlog = Some(stage);
        self
    }

    /// Run every stage once under the pipeline lock. The lock is released on
    /// every exit path, including unwinding.
    pub fn run(&self) -> Result<RunReport> {
        let Some(_guard) = self.lock.acquire()? else {
            tracing::info!("another pipeline run is active; exiting");
            return Ok(RunReport::lock_held());
        };

        let judged = self.judge();
        let promoted = self.promote();
        let outcome = self.select_and_advance()?;

        Ok(RunReport {
            judged,
            promoted,
            outcome,
        })
    }

    // -----------------------------------------------------------------------
    // Backlog stages
    // -----------------------------------------------------------------------

    fn judge(&self) -> usize {
        let Some(stage) = &self.backlog else {
            return 0;
        };
        let Some(pending) = recover("judge", stage.backlog.list_pending()) else {
            return 0;
        };

        let mut judged = 0;
        for request in by_votes(pending).iter().take(stage.judge_limit) {
            let Some(verdict) = self.generator.triage(request) else {
                continue;
            };
            tracing::info!(
                request = %request.id,
                title = %request.title,
                approved = verdict.approved,
                reason = %verdict.reason,
                "triaged request"
            );
            if recover("judge", stage.backlog.record_verdict(&request.id, &verdict)).is_some() {
                judged += 1;
            }
        }
        judged
    }

    fn promote(&self) -> usize {
        let Some(stage) = &self.backlog else {
            return 0;
        };
        let Some(approved) = recover("generate", stage.backlog.list_approved_untracked()) else {
            return 0;
        };

        let mut promoted = 0;
        for request in by_votes(approved).iter().take(stage.generate_limit) {
            let context = prompts::request_context(request);
            let Some(desc) = self.generator.generate(&request.title, &context) else {
                continue;
            };
            let Some(body) = recover("generate", issue_body(request, &desc)) else {
                continue;
            };
            let Some(id) = self.queue.create_queued(&request.title, &body) else {
                continue;
            };
            if recover("generate", stage.backlog.mark_tracked(&request.id, id)).is_none() {
                tracing::warn!(
                    request = %request.id,
                    item = id,
                    "issue created but backlog not updated; request may be promoted again"
                );
            }
            promoted += 1;
        }
        promoted
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    fn select_and_advance(&self) -> Result<RunOutcome> {
        if let Some(item) = self.queue.in_progress() {
            return self.continue_item(&item);
        }
        if let Some(item) = self.queue.next_queued() {
            return self.start_item(&item);
        }
        tracing::info!("no in-progress or queued work");
        Ok(RunOutcome::Idle)
    }

    fn continue_item(&self, item: &WorkItem) -> Result<RunOutcome> {
        tracing::info!(item = item.id, title = %item.title, "continuing in-progress item");

        let Some(mut desc) = self.store.load().filter(|d| !d.is_complete()) else {
            return Ok(self.finish_item(item));
        };

        let (done, total) = desc.progress();
        tracing::info!(item = item.id, done, total, "stories remaining");
        self.store.normalize(&mut desc)?;
        self.implement(item)
    }

    /// All stories are done (or the task file is gone): gate, then retire
    /// the item regardless of the gate result.
    fn finish_item(&self, item: &WorkItem) -> RunOutcome {
        if !self.store.path().exists() {
            tracing::warn!(item = item.id, path = %self.store.path().display(), "task file missing; treating item as complete");
        }
        let gate = self.gate.run_tests_and_push();
        let labels = self.queue.labels();
        self.queue.relabel(item.id, &labels.completed, &labels.in_progress);
        self.queue.close(item.id);
        recover("complete", self.store.clear());
        tracing::info!(item = item.id, title = %item.title, gate = %gate, "work item completed");
        RunOutcome::Completed {
            item: item.id,
            gate,
        }
    }

    fn start_item(&self, item: &WorkItem) -> Result<RunOutcome> {
        tracing::info!(item = item.id, title = %item.title, votes = item.votes, "starting queued item");

        let Some(desc) = self.resolve_descriptor(item) else {
            tracing::warn!(item = item.id, title = %item.title, "no usable task descriptor; skipping");
            return Ok(RunOutcome::Skipped {
                item: item.id,
                reason: "task descriptor generation failed".to_string(),
            });
        };

        let desc = self.store.materialize(desc)?;
        tracing::info!(
            item = item.id,
            path = %self.store.path().display(),
            stories = desc.user_stories.len(),
            "task descriptor materialized"
        );
        let labels = self.queue.labels();
        self.queue.relabel(item.id, &labels.in_progress, &labels.queued);
        self.implement(item)
    }

    /// Embedded descriptor if present, else generated inline and appended
    /// to the item body so the next attempt does not regenerate it.
    fn resolve_descriptor(&self, item: &WorkItem) -> Option<TaskDescriptor> {
        if let Some(desc) = prd::extract_embedded(&item.body) {
            return Some(desc);
        }
        tracing::info!(item = item.id, "no embedded task descriptor; generating");
        let desc = self.generator.generate(&item.title, &item.body)?;
        if let Some(section) = recover("start", desc.to_embedded_section()) {
            self.queue.append_body(item, &section);
        }
        Some(desc)
    }

    fn implement(&self, item: &WorkItem) -> Result<RunOutcome> {
        if let Err(e) = self.runner.run_once() {
            tracing::error!(item = item.id, title = %item.title, error = %e, "implementation runner failed; aborting run");
            return Ok(RunOutcome::Aborted {
                item: item.id,
                error: e.to_string(),
            });
        }
        if let Some(desc) = self.store.load() {
            let (done, total) = desc.progress();
            tracing::info!(item = item.id, done, total, "implementation iteration recorded");
        }
        let gate = self.gate.run_tests_and_push();
        Ok(RunOutcome::Progressed {
            item: item.id,
            gate,
        })
    }
}

fn by_votes(mut requests: Vec<FeatureRequest>) -> Vec<FeatureRequest> {
    requests.sort_by(|a, b| b.votes.cmp(&a.votes));
    requests
}

fn issue_body(request: &FeatureRequest, desc: &TaskDescriptor) -> Result<String> {
    Ok(format!(
        "{}\n\n_Backlog request {} ({}, {} votes)_\n\n{}",
        request.description.trim(),
        request.id,
        request.kind.as_str(),
        request.votes,
        desc.to_embedded_section()?
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::tests::request;
    use crate::backlog::RequestStatus;
    use crate::config::LabelConfig;
    use crate::error::PipelineError;
    use crate::generator::tests::ScriptedGenerator;
    use crate::generator::TriageVerdict;
    use crate::prd::tests::descriptor;
    use crate::prd::StoryStatus::{Complete, Incomplete, Skipped};
    use crate::queue::Tracker;
    use std::cell::{Cell, RefCell};
    use std::time::Duration;
    use tempfile::TempDir;

    // -- fakes --------------------------------------------------------------

    #[derive(Default)]
    struct MemoryTracker {
        items: RefCell<Vec<WorkItem>>,
        closed: RefCell<Vec<u64>>,
        list_calls: Cell<usize>,
    }

    impl MemoryTracker {
        fn with(items: Vec<WorkItem>) -> Self {
            Self {
                items: RefCell::new(items),
                ..Default::default()
            }
        }

        fn get(&self, id: u64) -> WorkItem {
            self.items
                .borrow()
                .iter()
                .find(|i| i.id == id)
                .cloned()
                .unwrap()
        }
    }

    impl Tracker for MemoryTracker {
        fn list_by_label(&self, label: &str, limit: u32) -> Result<Vec<WorkItem>> {
            self.list_calls.set(self.list_calls.get() + 1);
            let closed = self.closed.borrow();
            // Mirrors the default reactions sort query.
            let mut items: Vec<WorkItem> = self
                .items
                .borrow()
                .iter()
                .filter(|i| i.has_label(label) && !closed.contains(&i.id))
                .cloned()
                .collect();
            items.sort_by(|a, b| b.votes.cmp(&a.votes));
            items.truncate(limit as usize);
            Ok(items)
        }

        fn edit_labels(&self, id: u64, add: &str, remove: &str) -> Result<()> {
            let mut items = self.items.borrow_mut();
            let item = items.iter_mut().find(|i| i.id == id).unwrap();
            item.labels.retain(|l| l != remove);
            if !item.has_label(add) {
                item.labels.push(add.to_string());
            }
            Ok(())
        }

        fn close(&self, id: u64) -> Result<()> {
            self.closed.borrow_mut().push(id);
            Ok(())
        }

        fn create(&self, title: &str, body: &str, label: &str) -> Result<u64> {
            let mut items = self.items.borrow_mut();
            let id = 100 + items.len() as u64;
            items.push(WorkItem {
                id,
                title: title.to_string(),
                body: body.to_string(),
                labels: vec![label.to_string()],
                votes: 0,
            });
            Ok(id)
        }

        fn set_body(&self, id: u64, body: &str) -> Result<()> {
            let mut items = self.items.borrow_mut();
            items.iter_mut().find(|i| i.id == id).unwrap().body = body.to_string();
            Ok(())
        }
    }

    /// Counts calls; optionally marks every story complete or fails.
    struct FakeRunner<'s> {
        calls: Cell<usize>,
        store: &'s PrdStore,
        finish_stories: bool,
        fail: bool,
    }

    impl ImplementationRunner for FakeRunner<'_> {
        fn run_once(&self) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(PipelineError::Timeout {
                    program: "ralph.sh".into(),
                    secs: 5400,
                });
            }
            if self.finish_stories {
                let mut desc = self.store.load().unwrap();
                for s in &mut desc.user_stories {
                    s.status = Complete;
                }
                self.store.save(&desc).unwrap();
            }
            Ok(())
        }
    }

    struct FakeGate {
        calls: Cell<usize>,
        outcome: GateOutcome,
    }

    impl FakeGate {
        fn returning(outcome: GateOutcome) -> Self {
            Self {
                calls: Cell::new(0),
                outcome,
            }
        }
    }

    impl Gate for FakeGate {
        fn run_tests_and_push(&self) -> GateOutcome {
            self.calls.set(self.calls.get() + 1);
            self.outcome.clone()
        }
    }

    #[derive(Default)]
    struct MemoryBacklog {
        pending: Vec<FeatureRequest>,
        approved: Vec<FeatureRequest>,
        offline: bool,
        verdicts: RefCell<Vec<(String, TriageVerdict)>>,
        tracked: RefCell<Vec<(String, u64)>>,
    }

    impl Backlog for MemoryBacklog {
        fn list_pending(&self) -> Result<Vec<FeatureRequest>> {
            if self.offline {
                return Err(PipelineError::Backlog("connection refused".into()));
            }
            Ok(self.pending.clone())
        }
        fn list_approved_untracked(&self) -> Result<Vec<FeatureRequest>> {
            if self.offline {
                return Err(PipelineError::Backlog("connection refused".into()));
            }
            Ok(self.approved.clone())
        }
        fn record_verdict(&self, id: &str, verdict: &TriageVerdict) -> Result<()> {
            self.verdicts
                .borrow_mut()
                .push((id.to_string(), verdict.clone()));
            Ok(())
        }
        fn mark_tracked(&self, id: &str, issue_number: u64) -> Result<()> {
            self.tracked
                .borrow_mut()
                .push((id.to_string(), issue_number));
            Ok(())
        }
    }

    // -- harness ------------------------------------------------------------

    struct Env {
        _dir: TempDir,
        lock: PipelineLock,
        store: PrdStore,
    }

    fn env() -> Env {
        let dir = TempDir::new().unwrap();
        let lock = PipelineLock::new(
            dir.path().join(".pipeline/run.lock"),
            Duration::from_secs(2 * 60 * 60),
        );
        let store = PrdStore::new(dir.path().join(".pipeline/prd.json"));
        Env {
            _dir: dir,
            lock,
            store,
        }
    }

    fn runner(store: &PrdStore) -> FakeRunner<'_> {
        FakeRunner {
            calls: Cell::new(0),
            store,
            finish_stories: false,
            fail: false,
        }
    }

    fn item(id: u64, label: &str, votes: u64, body: &str) -> WorkItem {
        WorkItem {
            id,
            title: format!("Feature {id}"),
            body: body.to_string(),
            labels: vec![label.to_string()],
            votes,
        }
    }

    fn embedded_body(stories: &[crate::prd::StoryStatus]) -> String {
        format!(
            "Guests keep missing events.\n\n{}",
            descriptor(stories).to_embedded_section().unwrap()
        )
    }

    fn pipeline<'a>(
        env: &'a Env,
        tracker: &'a MemoryTracker,
        generator: &'a ScriptedGenerator,
        runner: &'a FakeRunner<'a>,
        gate: &'a FakeGate,
    ) -> Pipeline<'a> {
        Pipeline::new(
            &env.lock,
            Queue::new(tracker, LabelConfig::default(), 10),
            &env.store,
            Generator::new(generator),
            runner,
            gate,
        )
    }

    const VALID_DESCRIPTOR: &str = r#"{"project":"Waitlist","description":"Queue guests","userStories":[{"id":"US-001","title":"Table","priority":1,"status":"incomplete"}]}"#;

    // -- scenarios ----------------------------------------------------------

    #[test]
    fn queued_item_with_embedded_descriptor_starts_and_gate_failure_keeps_it_in_progress() {
        let env = env();
        let tracker = MemoryTracker::with(vec![item(42, "queued", 5, &embedded_body(&[Incomplete, Incomplete]))]);
        let generator = ScriptedGenerator::new(vec![]);
        let runner = runner(&env.store);
        let gate = FakeGate::returning(GateOutcome::TestsFailed("1 failing".into()));

        let report = pipeline(&env, &tracker, &generator, &runner, &gate).run().unwrap();

        assert_eq!(
            report.outcome,
            RunOutcome::Progressed {
                item: 42,
                gate: GateOutcome::TestsFailed("1 failing".into())
            }
        );
        let issue = tracker.get(42);
        assert!(issue.has_label("in-progress"));
        assert!(!issue.has_label("queued"));
        assert!(tracker.closed.borrow().is_empty());

        let desc = env.store.load().unwrap();
        let meta = desc.metadata.unwrap();
        assert_eq!(meta.completed_stories, 0);
        assert_eq!(meta.total_stories, 2);
        assert_eq!(desc.branch_name.as_deref(), Some("feature/rsvp-reminders"));

        assert_eq!(runner.calls.get(), 1);
        assert_eq!(gate.calls.get(), 1);
        assert!(generator.prompts.borrow().is_empty());
        assert!(!env.lock.path().exists());
    }

    #[test]
    fn complete_descriptor_retires_item() {
        let env = env();
        env.store.save(&descriptor(&[Complete, Skipped])).unwrap();
        let tracker = MemoryTracker::with(vec![item(7, "in-progress", 0, "")]);
        let generator = ScriptedGenerator::new(vec![]);
        let runner = runner(&env.store);
        let gate = FakeGate::returning(GateOutcome::Passed);

        let report = pipeline(&env, &tracker, &generator, &runner, &gate).run().unwrap();

        assert_eq!(
            report.outcome,
            RunOutcome::Completed {
                item: 7,
                gate: GateOutcome::Passed
            }
        );
        let issue = tracker.get(7);
        assert!(issue.has_label("completed"));
        assert!(!issue.has_label("in-progress"));
        assert_eq!(*tracker.closed.borrow(), vec![7]);
        assert!(!env.store.path().exists());
        assert_eq!(runner.calls.get(), 0);
        assert_eq!(gate.calls.get(), 1);
    }

    #[test]
    fn complete_descriptor_is_retired_even_when_push_fails() {
        let env = env();
        env.store.save(&descriptor(&[Complete])).unwrap();
        let tracker = MemoryTracker::with(vec![item(8, "in-progress", 0, "")]);
        let generator = ScriptedGenerator::new(vec![]);
        let runner = runner(&env.store);
        let gate = FakeGate::returning(GateOutcome::PushFailed("rejected".into()));

        let report = pipeline(&env, &tracker, &generator, &runner, &gate).run().unwrap();

        assert!(matches!(report.outcome, RunOutcome::Completed { item: 8, .. }));
        assert!(tracker.get(8).has_label("completed"));
        assert_eq!(*tracker.closed.borrow(), vec![8]);
    }

    fn assert_retired_without_runner(env: &Env, task_file: Option<&str>) {
        if let Some(content) = task_file {
            std::fs::create_dir_all(env.store.path().parent().unwrap()).unwrap();
            std::fs::write(env.store.path(), content).unwrap();
        }
        let tracker = MemoryTracker::with(vec![item(21, "in-progress", 0, "")]);
        let generator = ScriptedGenerator::new(vec![]);
        let runner = runner(&env.store);
        let gate = FakeGate::returning(GateOutcome::Passed);

        let report = pipeline(env, &tracker, &generator, &runner, &gate).run().unwrap();

        assert_eq!(
            report.outcome,
            RunOutcome::Completed {
                item: 21,
                gate: GateOutcome::Passed
            }
        );
        let issue = tracker.get(21);
        assert!(issue.has_label("completed"));
        assert!(!issue.has_label("in-progress"));
        assert_eq!(*tracker.closed.borrow(), vec![21]);
        assert_eq!(gate.calls.get(), 1);
        assert_eq!(runner.calls.get(), 0);
        assert!(!env.store.path().exists());
        assert!(!env.lock.path().exists());
    }

    #[test]
    fn missing_task_file_retires_in_progress_item() {
        let env = env();
        assert_retired_without_runner(&env, None);
    }

    #[test]
    fn unparsable_task_file_retires_in_progress_item() {
        let env = env();
        assert_retired_without_runner(&env, Some("{ this is not json"));
    }

    #[test]
    fn generation_failure_skips_item_without_side_effects() {
        let env = env();
        let tracker = MemoryTracker::with(vec![item(9, "queued", 1, "Just an idea")]);
        let generator = ScriptedGenerator::new(vec![Ok("not json at all".into())]);
        let runner = runner(&env.store);
        let gate = FakeGate::returning(GateOutcome::Passed);

        let report = pipeline(&env, &tracker, &generator, &runner, &gate).run().unwrap();

        assert!(matches!(report.outcome, RunOutcome::Skipped { item: 9, .. }));
        let issue = tracker.get(9);
        assert_eq!(issue.labels, vec!["queued".to_string()]);
        assert_eq!(issue.body, "Just an idea");
        assert_eq!(runner.calls.get(), 0);
        assert_eq!(gate.calls.get(), 0);
        assert!(!env.store.path().exists());
        assert!(!env.lock.path().exists());
    }

    #[test]
    fn inline_generation_appends_descriptor_to_body() {
        let env = env();
        let tracker = MemoryTracker::with(vec![item(11, "queued", 1, "Let guests join a waitlist")]);
        let generator = ScriptedGenerator::new(vec![Ok(format!("```json\n{VALID_DESCRIPTOR}\n```"))]);
        let runner = runner(&env.store);
        let gate = FakeGate::returning(GateOutcome::Passed);

        let report = pipeline(&env, &tracker, &generator, &runner, &gate).run().unwrap();

        assert!(matches!(report.outcome, RunOutcome::Progressed { item: 11, .. }));
        let issue = tracker.get(11);
        assert!(issue.body.starts_with("Let guests join a waitlist"));
        assert!(issue.body.contains(crate::prd::EMBED_HEADING));
        assert_eq!(prd::extract_embedded(&issue.body).unwrap().project, "Waitlist");
        assert_eq!(env.store.load().unwrap().project, "Waitlist");
        assert!(generator.prompts.borrow()[0].contains("Let guests join a waitlist"));
    }

    #[test]
    fn in_progress_item_wins_over_queued() {
        let env = env();
        env.store.save(&descriptor(&[Complete, Incomplete])).unwrap();
        let tracker = MemoryTracker::with(vec![
            item(4, "queued", 50, &embedded_body(&[Incomplete])),
            item(3, "in-progress", 0, ""),
        ]);
        let generator = ScriptedGenerator::new(vec![]);
        let runner = runner(&env.store);
        let gate = FakeGate::returning(GateOutcome::Passed);

        let report = pipeline(&env, &tracker, &generator, &runner, &gate).run().unwrap();

        assert_eq!(
            report.outcome,
            RunOutcome::Progressed {
                item: 3,
                gate: GateOutcome::Passed
            }
        );
        assert_eq!(tracker.get(4).labels, vec!["queued".to_string()]);
        assert_eq!(runner.calls.get(), 1);
        // Continuing normalizes the on-disk descriptor.
        let desc = env.store.load().unwrap();
        assert!(desc.metadata.is_some());
        assert!(desc.branch_name.is_some());
    }

    #[test]
    fn higher_voted_queued_item_is_selected() {
        let env = env();
        let tracker = MemoryTracker::with(vec![
            item(10, "queued", 1, &embedded_body(&[Incomplete])),
            item(12, "queued", 8, &embedded_body(&[Incomplete])),
        ]);
        let generator = ScriptedGenerator::new(vec![]);
        let runner = runner(&env.store);
        let gate = FakeGate::returning(GateOutcome::Passed);

        let report = pipeline(&env, &tracker, &generator, &runner, &gate).run().unwrap();

        assert!(matches!(report.outcome, RunOutcome::Progressed { item: 12, .. }));
        assert!(tracker.get(12).has_label("in-progress"));
        assert_eq!(tracker.get(10).labels, vec!["queued".to_string()]);
    }

    #[test]
    fn held_lock_exits_without_touching_anything() {
        let env = env();
        let other = PipelineLock::new(env.lock.path(), Duration::from_secs(2 * 60 * 60));
        assert!(other.try_acquire().unwrap());

        let tracker = MemoryTracker::with(vec![item(42, "queued", 5, &embedded_body(&[Incomplete]))]);
        let generator = ScriptedGenerator::new(vec![]);
        let runner = runner(&env.store);
        let gate = FakeGate::returning(GateOutcome::Passed);

        let report = pipeline(&env, &tracker, &generator, &runner, &gate).run().unwrap();

        assert_eq!(report, RunReport::lock_held());
        assert_eq!(tracker.list_calls.get(), 0);
        assert_eq!(runner.calls.get(), 0);
        assert!(env.lock.path().exists());
    }

    #[test]
    fn runner_failure_aborts_and_releases_lock() {
        let env = env();
        let tracker = MemoryTracker::with(vec![item(42, "queued", 5, &embedded_body(&[Incomplete]))]);
        let generator = ScriptedGenerator::new(vec![]);
        let mut runner = runner(&env.store);
        runner.fail = true;
        let gate = FakeGate::returning(GateOutcome::Passed);

        let report = pipeline(&env, &tracker, &generator, &runner, &gate).run().unwrap();

        match report.outcome {
            RunOutcome::Aborted { item, error } => {
                assert_eq!(item, 42);
                assert!(error.contains("timed out"));
            }
            other => panic!("expected Aborted, got {other:?}"),
        }
        assert_eq!(gate.calls.get(), 0);
        // Relabel already happened; nothing is rolled back.
        assert!(tracker.get(42).has_label("in-progress"));
        assert!(!env.lock.path().exists());
    }

    #[test]
    fn finished_stories_complete_on_next_run() {
        let env = env();
        let tracker = MemoryTracker::with(vec![item(5, "queued", 2, &embedded_body(&[Incomplete, Incomplete]))]);
        let generator = ScriptedGenerator::new(vec![]);
        let mut runner = runner(&env.store);
        runner.finish_stories = true;
        let gate = FakeGate::returning(GateOutcome::Passed);
        let pipeline = pipeline(&env, &tracker, &generator, &runner, &gate);

        let first = pipeline.run().unwrap();
        assert!(matches!(first.outcome, RunOutcome::Progressed { item: 5, .. }));
        let second = pipeline.run().unwrap();
        assert!(matches!(second.outcome, RunOutcome::Completed { item: 5, .. }));
        let third = pipeline.run().unwrap();
        assert_eq!(third.outcome, RunOutcome::Idle);
        assert_eq!(runner.calls.get(), 1);
    }

    #[test]
    fn empty_queue_is_idle() {
        let env = env();
        let tracker = MemoryTracker::default();
        let generator = ScriptedGenerator::new(vec![]);
        let runner = runner(&env.store);
        let gate = FakeGate::returning(GateOutcome::Passed);

        let report = pipeline(&env, &tracker, &generator, &runner, &gate).run().unwrap();

        assert_eq!(report.outcome, RunOutcome::Idle);
        assert_eq!(gate.calls.get(), 0);
    }

    #[test]
    fn backlog_requests_are_judged_and_promoted() {
        let env = env();
        let mut popular = request("r2", "Waitlist");
        popular.votes = 40;
        let mut approved = request("r9", "Waitlist");
        approved.status = RequestStatus::Approved;
        let backlog = MemoryBacklog {
            pending: vec![request("r1", "Dark mode"), popular],
            approved: vec![approved],
            ..Default::default()
        };
        let tracker = MemoryTracker::default();
        let generator = ScriptedGenerator::new(vec![
            Ok(r#"{"approved": true, "reason": "clear and small"}"#.into()),
            Ok(VALID_DESCRIPTOR.into()),
        ]);
        let runner = runner(&env.store);
        let gate = FakeGate::returning(GateOutcome::Passed);

        let report = pipeline(&env, &tracker, &generator, &runner, &gate)
            .with_backlog(BacklogStage {
                backlog: &backlog,
                judge_limit: 1,
                generate_limit: 3,
            })
            .run()
            .unwrap();

        assert_eq!(report.judged, 1);
        assert_eq!(report.promoted, 1);
        // Most-voted pending request is triaged first.
        let verdicts = backlog.verdicts.borrow();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].0, "r2");
        assert!(verdicts[0].1.approved);

        assert_eq!(*backlog.tracked.borrow(), vec![("r9".to_string(), 100)]);
        // The promoted issue is picked up in the same run.
        assert!(matches!(report.outcome, RunOutcome::Progressed { item: 100, .. }));
        let issue = tracker.get(100);
        assert!(issue.has_label("in-progress"));
        assert!(issue.body.contains("Backlog request r9"));
        assert_eq!(generator.prompts.borrow().len(), 2);
    }

    #[test]
    fn backlog_outage_does_not_abort_run() {
        let env = env();
        let backlog = MemoryBacklog {
            offline: true,
            ..Default::default()
        };
        let tracker = MemoryTracker::with(vec![item(42, "queued", 5, &embedded_body(&[Incomplete]))]);
        let generator = ScriptedGenerator::new(vec![]);
        let runner = runner(&env.store);
        let gate = FakeGate::returning(GateOutcome::Passed);

        let report = pipeline(&env, &tracker, &generator, &runner, &gate)
            .with_backlog(BacklogStage {
                backlog: &backlog,
                judge_limit: 5,
                generate_limit: 3,
            })
            .run()
            .unwrap();

        assert_eq!((report.judged, report.promoted), (0, 0));
        assert!(matches!(report.outcome, RunOutcome::Progressed { item: 42, .. }));
    }

    #[test]
    fn report_serializes_flat() {
        let report = RunReport {
            judged: 2,
            promoted: 1,
            outcome: RunOutcome::Progressed {
                item: 42,
                gate: GateOutcome::Passed,
            },
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "progressed");
        assert_eq!(json["item"], 42);
        assert_eq!(json["gate"]["result"], "passed");
        assert_eq!(json["judged"], 2);
    }
}
