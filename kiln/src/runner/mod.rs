//! Concurrent execution of prepared build jobs.
//!
//! Jobs run as tokio tasks bounded by a semaphore. Each task writes its
//! outcome into mutex-guarded maps keyed by job name; one job's failure never
//! stops another. Once the run is cancelled no new job is dispatched, while
//! jobs already running finish on their own.

mod report;

pub use report::{JobFailure, JobState, RunReport};

use crate::cancellation::CancellationToken;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::errors::RegistryError;
use crate::options::SchedulerOptions;
use crate::plan::BuildJob;
use crate::plugin::Artifact;
use crate::registry::{BuildRegistry, NullRegistry};
use crate::ui::{ColoredUi, TargetedUi, TimestampedUi, Ui, UiColor};
use crate::utils::format_duration;
use parking_lot::Mutex;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Outcome maps shared by the job tasks.
#[derive(Default)]
struct RunResults {
    states: Mutex<BTreeMap<String, JobState>>,
    failures: Mutex<BTreeMap<String, JobFailure>>,
    artifacts: Mutex<BTreeMap<String, Vec<Arc<dyn Artifact>>>>,
    diagnostics: Mutex<Diagnostics>,
}

impl RunResults {
    fn set_state(&self, job: &str, state: JobState) {
        debug!(job, state = %state, "Job state changed");
        self.states.lock().insert(job.to_string(), state);
    }

    fn state(&self, job: &str) -> Option<JobState> {
        self.states.lock().get(job).copied()
    }

    fn fail(&self, failure: JobFailure) {
        let job = failure.job.clone();
        match self.failures.lock().entry(job.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(failure);
            }
            Entry::Occupied(_) => {
                warn!(job = %job, error = %failure.error, "Ignoring second failure for job");
            }
        }
        self.set_state(&job, JobState::Failed);
    }

    fn succeed(&self, job: &str, artifacts: Vec<Arc<dyn Artifact>>) {
        if !artifacts.is_empty() {
            match self.artifacts.lock().entry(job.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(artifacts);
                }
                Entry::Occupied(_) => warn!(job, "Ignoring second artifact set for job"),
            }
        }
        self.set_state(job, JobState::Succeeded);
    }

    fn diagnose(&self, diagnostic: Diagnostic) {
        self.diagnostics.lock().push(diagnostic);
    }
}

/// Runs build jobs with bounded parallelism.
pub struct ConcurrentRunner {
    options: SchedulerOptions,
    ui: Arc<dyn Ui>,
    registry: Arc<dyn BuildRegistry>,
    cancel: Arc<CancellationToken>,
}

impl ConcurrentRunner {
    /// Creates a runner writing to `ui`, with no registry.
    #[must_use]
    pub fn new(options: SchedulerOptions, ui: Arc<dyn Ui>) -> Self {
        Self {
            options,
            ui,
            registry: Arc::new(NullRegistry),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Reports job lifecycle to `registry`.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn BuildRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Observes `cancel` instead of a private token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// The run's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Per-job UIs: timestamped if asked, coloured from the palette unless
    /// output is machine-readable, and prefixed with the job name.
    fn job_uis(&self, jobs: &[BuildJob]) -> Vec<Arc<dyn Ui>> {
        let mut base = self.ui.clone();
        if self.options.timestamp_ui {
            base = Arc::new(TimestampedUi::new(base));
        }
        let colored = self.options.color && !self.options.machine_readable;

        let uis: Vec<Arc<dyn Ui>> = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| {
                let mut ui = base.clone();
                if colored {
                    ui = Arc::new(ColoredUi::new(UiColor::for_index(i), ui));
                    ui.say(&format!("{}: output will be in this color.", job.name()));
                }
                Arc::new(TargetedUi::new(job.name(), ui)) as Arc<dyn Ui>
            })
            .collect();
        if colored {
            self.ui.say("");
        }
        uis
    }

    /// Runs every job and summarises the outcome.
    pub async fn run(&self, jobs: Vec<BuildJob>) -> RunReport {
        let started = Instant::now();
        if jobs.is_empty() {
            return RunReport::from_diagnostics(Diagnostics::from(
                Diagnostic::error("No builds to run").with_detail(
                    "A build command cannot run without at least one build to process. \
                     If the only or except flags have been specified at run time check \
                     that they match at least one build.",
                ),
            ));
        }

        let results = Arc::new(RunResults::default());
        for job in &jobs {
            results.set_state(job.name(), JobState::Pending);
        }

        let uis = self.job_uis(&jobs);
        let limit = self.options.effective_parallelism();
        let semaphore = Arc::new(Semaphore::new(limit));
        let serial = self.options.is_serial();
        info!(jobs = jobs.len(), parallelism = limit, serial, "Starting builds");

        let mut tasks = JoinSet::new();
        for (job, ui) in jobs.into_iter().zip(uis) {
            let name = job.name().to_string();
            if self.cancel.is_cancelled() {
                self.ui.say("Interrupted, not going to start any more builds.");
                break;
            }

            debug!(job = %name, available = semaphore.available_permits(), "Waiting for a build slot");
            let acquired = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err("run was cancelled".to_string()),
                permit = semaphore.clone().acquire_owned() => permit.map_err(|e| e.to_string()),
            };
            let permit = match acquired {
                Ok(permit) => permit,
                Err(e) => {
                    let message = format!("Build '{name}' failed to acquire semaphore: {e}");
                    self.ui.error(&message);
                    results.fail(JobFailure::new(&name, message, "semaphore"));
                    break;
                }
            };

            results.set_state(&name, JobState::Dispatched);
            tasks.spawn(run_job(
                job,
                ui,
                self.registry.clone(),
                self.cancel.clone(),
                results.clone(),
                permit,
            ));

            if serial {
                join_next(&mut tasks).await;
            }
        }

        while !tasks.is_empty() {
            join_next(&mut tasks).await;
        }
        self.ui.say(&format!(
            "\n==> Wait completed after {}",
            format_duration(started.elapsed())
        ));

        // A task that panicked left its job mid-flight.
        let unfinished: Vec<String> = results
            .states
            .lock()
            .iter()
            .filter(|(_, s)| matches!(s, JobState::Dispatched | JobState::Running))
            .map(|(name, _)| name.clone())
            .collect();
        for name in unfinished {
            results.fail(JobFailure::new(&name, "build task did not complete", "incomplete"));
        }

        let mut report = take_report(&results);
        report.duration = started.elapsed();

        if self.cancel.is_cancelled() {
            info!(reason = ?self.cancel.reason(), "Run was cancelled");
            report.cancelled = true;
            report.diagnostics = Diagnostics::from(
                Diagnostic::error("Build cancelled")
                    .with_detail("Cleanly cancelled builds after being interrupted."),
            );
            return report;
        }

        self.summarize_failures(&mut report);
        self.summarize_artifacts(&report);
        report
    }

    fn summarize_failures(&self, report: &mut RunReport) {
        if report.failures.is_empty() {
            return;
        }
        let count = report.failures.len().to_string();
        self.ui.machine("error-count", &[count.as_str()]);
        self.ui
            .error("\n==> Some builds didn't complete successfully and had errors:");
        for (name, failure) in &report.failures {
            TargetedUi::new(name.clone(), self.ui.clone()).machine("error", &[failure.error.as_str()]);
            self.ui.error(&format!("--> {name}: {}", failure.error));
            report.diagnostics.push(
                Diagnostic::error(format!("Build '{name}' failed")).with_detail(failure.error.clone()),
            );
        }
    }

    fn summarize_artifacts(&self, report: &RunReport) {
        if report.artifacts.is_empty() {
            self.ui.say("\n==> Builds finished but no artifacts were created.");
            return;
        }
        self.ui
            .say("\n==> Builds finished. The artifacts of successful builds are:");
        for (name, artifacts) in &report.artifacts {
            let ui = TargetedUi::new(name.clone(), self.ui.clone());
            let count = artifacts.len().to_string();
            ui.machine("artifact-count", &[count.as_str()]);
            for (i, artifact) in artifacts.iter().enumerate() {
                let index = i.to_string();
                let index = index.as_str();
                let id = artifact.id();
                let description = artifact.to_string();
                let files = artifact.files();
                let files_count = files.len().to_string();
                ui.machine("artifact", &[index, "builder-id", artifact.builder_id()]);
                ui.machine("artifact", &[index, "id", id.as_str()]);
                ui.machine("artifact", &[index, "string", description.as_str()]);
                ui.machine("artifact", &[index, "files-count", files_count.as_str()]);
                for (fi, file) in files.iter().enumerate() {
                    let file_index = fi.to_string();
                    ui.machine("artifact", &[index, "file", file_index.as_str(), file.as_str()]);
                }
                ui.machine("artifact", &[index, "end"]);
                self.ui.say(&format!("--> {name}: {description}"));
            }
        }
    }
}

fn take_report(results: &RunResults) -> RunReport {
    RunReport {
        diagnostics: std::mem::take(&mut *results.diagnostics.lock()),
        artifacts: std::mem::take(&mut *results.artifacts.lock()),
        failures: std::mem::take(&mut *results.failures.lock()),
        states: std::mem::take(&mut *results.states.lock()),
        ..RunReport::default()
    }
}

async fn join_next(tasks: &mut JoinSet<()>) {
    if let Some(Err(e)) = tasks.join_next().await {
        warn!(error = %e, "Build task did not complete");
    }
}

async fn run_job(
    job: BuildJob,
    ui: Arc<dyn Ui>,
    registry: Arc<dyn BuildRegistry>,
    cancel: Arc<CancellationToken>,
    results: Arc<RunResults>,
    permit: OwnedSemaphorePermit,
) {
    let name = job.name().to_string();

    match registry.start_build(&cancel, &name).await {
        Ok(()) => {}
        Err(RegistryError::AlreadyDone { .. }) => {
            ui.say(&format!("skipping already done build {name:?}"));
            results.set_state(&name, JobState::Skipped);
            return;
        }
        Err(e) => {
            results.diagnose(
                Diagnostic::error(format!("registry: failed to start build {name:?}"))
                    .with_detail(e.to_string()),
            );
            results.set_state(&name, JobState::Failed);
            return;
        }
    }

    results.set_state(&name, JobState::Running);
    info!(job = %name, "Starting build");
    let started = Instant::now();
    let outcome = job.run(&cancel, ui.as_ref()).await;
    let elapsed = format_duration(started.elapsed());

    let (artifacts, error) = match outcome {
        Ok(artifacts) => (artifacts, None),
        Err(e) => (Vec::new(), Some(e)),
    };
    let artifacts = match registry
        .complete_build(&cancel, &name, artifacts, error.as_ref())
        .await
    {
        Ok(artifacts) => artifacts,
        Err(e) => {
            results.diagnose(
                Diagnostic::error(format!("registry: failed to complete build {name:?}"))
                    .with_detail(e.to_string()),
            );
            Vec::new()
        }
    };

    match error {
        Some(e) => {
            warn!(job = %name, duration = %elapsed, error = %e, "Build errored");
            ui.error(&format!("Build '{name}' errored after {elapsed}: {e}"));
            results.fail(JobFailure::from_build_error(&name, &e));
        }
        None => {
            info!(job = %name, duration = %elapsed, artifacts = artifacts.len(), "Build finished");
            ui.say(&format!("Build '{name}' finished after {elapsed}."));
            results.succeed(&name, artifacts);
        }
    }
    debug_assert!(results.state(&name).is_some_and(JobState::is_terminal));
    drop(permit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::testing::{CollectingUi, ConcurrencyProbe, MockBuilder};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn job(name: &str, builder: MockBuilder) -> BuildJob {
        BuildJob::new(name, name, "mock", Box::new(builder)).prepared()
    }

    fn runner(options: SchedulerOptions) -> (ConcurrentRunner, Arc<CollectingUi>) {
        let ui = Arc::new(CollectingUi::new());
        (ConcurrentRunner::new(options.with_color(false), ui.clone()), ui)
    }

    #[tokio::test]
    async fn test_no_builds() {
        let (runner, _) = runner(SchedulerOptions::default());
        let report = runner.run(Vec::new()).await;
        assert_eq!(report.diagnostics.iter().next().unwrap().summary, "No builds to run");
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let probe = Arc::new(ConcurrencyProbe::new());
        let jobs: Vec<BuildJob> = (0..6)
            .map(|i| {
                job(
                    &format!("mock.{i}"),
                    MockBuilder::new(format!("img-{i}"))
                        .with_delay(Duration::from_millis(20))
                        .with_probe(probe.clone()),
                )
            })
            .collect();
        let (runner, _) = runner(SchedulerOptions::default().with_parallel_builds(2));

        let report = runner.run(jobs).await;
        assert!(!report.has_failures());
        assert_eq!(report.artifacts.len(), 6);
        assert!(probe.peak() <= 2, "peak was {}", probe.peak());
        assert!(probe.peak() >= 1);
    }

    #[tokio::test]
    async fn test_debug_runs_serially() {
        let probe = Arc::new(ConcurrencyProbe::new());
        let jobs: Vec<BuildJob> = (0..3)
            .map(|i| {
                job(
                    &format!("mock.{i}"),
                    MockBuilder::new("img")
                        .with_delay(Duration::from_millis(5))
                        .with_probe(probe.clone()),
                )
            })
            .collect();
        let (runner, _) = runner(SchedulerOptions::default().with_debug(true));

        runner.run(jobs).await;
        assert_eq!(probe.peak(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let jobs = vec![
            job("mock.ok", MockBuilder::new("img-ok")),
            job("mock.bad", MockBuilder::new("img-bad").failing_run("kaboom")),
        ];
        let (runner, ui) = runner(SchedulerOptions::default());

        let report = runner.run(jobs).await;
        assert_eq!(report.states["mock.ok"], JobState::Succeeded);
        assert_eq!(report.states["mock.bad"], JobState::Failed);
        assert_eq!(report.failures["mock.bad"].error, "kaboom");
        assert_eq!(report.artifacts["mock.ok"][0].id(), "img-ok");
        assert_eq!(report.exit_code(), 1);

        assert!(ui.contains("==> mock.bad: Build 'mock.bad' errored after"));
        assert!(ui.contains("--> mock.bad: kaboom"));
        assert!(ui.contains("--> mock.ok: mock artifact img-ok"));
        assert_eq!(ui.machine("error-count"), vec![vec!["1".to_string()]]);
        assert_eq!(
            ui.machine("mock.bad,error"),
            vec![vec!["kaboom".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch_and_reports_once() {
        let cancel = Arc::new(CancellationToken::new());
        let trigger = cancel.clone();
        let first = MockBuilder::new("img-1")
            .with_delay(Duration::from_millis(30))
            .on_run(move || trigger.cancel("interrupt"));
        let second = MockBuilder::new("img-2");
        let jobs = vec![job("mock.1", first.clone()), job("mock.2", second.clone())];
        let (runner, ui) = runner(SchedulerOptions::default().with_parallel_builds(1));
        let runner = runner.with_cancellation(cancel);

        let report = runner.run(jobs).await;
        assert!(report.cancelled);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics.iter().next().unwrap().summary, "Build cancelled");
        assert_eq!(first.runs(), 1);
        assert_eq!(second.runs(), 0);
        assert_eq!(report.states["mock.1"], JobState::Succeeded);
        assert_eq!(report.states["mock.2"], JobState::Pending);
        assert!(ui.contains("Interrupted, not going to start any more builds."));
    }

    #[tokio::test]
    async fn test_already_done_builds_are_skipped() {
        let builder = MockBuilder::new("img");
        let registry = Arc::new(MemoryRegistry::new().with_completed(["mock.done"]));
        let jobs = vec![job("mock.done", builder.clone()), job("mock.new", MockBuilder::new("x"))];
        let (runner, ui) = runner(SchedulerOptions::default());
        let runner = runner.with_registry(registry.clone());

        let report = runner.run(jobs).await;
        assert_eq!(builder.runs(), 0);
        assert_eq!(report.states["mock.done"], JobState::Skipped);
        assert_eq!(report.states["mock.new"], JobState::Succeeded);
        assert!(!report.has_failures());
        assert!(ui.contains("skipping already done build \"mock.done\""));
        assert_eq!(registry.artifacts("mock.new"), vec!["x".to_string()]);
    }

    struct RejectingRegistry;

    #[async_trait::async_trait]
    impl BuildRegistry for RejectingRegistry {
        async fn populate_iteration(
            &self,
            _cancel: &CancellationToken,
            _builds: &[String],
        ) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn start_build(&self, _cancel: &CancellationToken, _build: &str) -> Result<(), RegistryError> {
            Err(RegistryError::Request("service unavailable".into()))
        }

        async fn complete_build(
            &self,
            _cancel: &CancellationToken,
            _build: &str,
            artifacts: Vec<Arc<dyn Artifact>>,
            _error: Option<&crate::errors::BuildError>,
        ) -> Result<Vec<Arc<dyn Artifact>>, RegistryError> {
            Ok(artifacts)
        }

        fn iteration_status_summary(&self, _ui: &dyn Ui) {}
    }

    #[tokio::test]
    async fn test_registry_start_failure_reported_once() {
        let builder = MockBuilder::new("img");
        let (runner, ui) = runner(SchedulerOptions::default());
        let runner = runner.with_registry(Arc::new(RejectingRegistry));

        let report = runner.run(vec![job("mock.a", builder.clone())]).await;
        assert_eq!(builder.runs(), 0);
        assert_eq!(report.states["mock.a"], JobState::Failed);
        assert!(report.failures.is_empty());
        assert_eq!(report.exit_code(), 1);
        let summaries: Vec<&str> = report.diagnostics.iter().map(|d| d.summary.as_str()).collect();
        assert_eq!(summaries, vec!["registry: failed to start build \"mock.a\""]);
        assert!(!ui.contains("Build 'mock.a' failed"));
    }

    #[tokio::test]
    async fn test_no_artifacts_message() {
        let (runner, ui) = runner(SchedulerOptions::default());
        let report = runner
            .run(vec![job("mock.a", MockBuilder::new("img").without_artifact())])
            .await;
        assert!(!report.has_failures());
        assert!(ui.contains("Builds finished but no artifacts were created."));
    }

    #[tokio::test]
    async fn test_color_announcement() {
        let ui = Arc::new(CollectingUi::new());
        let runner = ConcurrentRunner::new(SchedulerOptions::default(), ui.clone());
        runner.run(vec![job("mock.a", MockBuilder::new("img"))]).await;
        assert!(ui.contains("mock.a: output will be in this color."));
    }
}
