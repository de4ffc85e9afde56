//! The top-level driver: evaluate a configuration, then run its jobs.

use super::{ConfigScheduler, HclScheduler, LegacyScheduler, LegacyTemplate};
use crate::cancellation::CancellationToken;
use crate::config::ConfigGraph;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::options::SchedulerOptions;
use crate::plan::BuildJob;
use crate::plugin::PluginSet;
use crate::redact::RedactionRegistry;
use crate::registry::{BuildRegistry, NullRegistry};
use crate::runner::{ConcurrentRunner, RunReport};
use crate::ui::{BasicUi, MachineReadableUi, Ui};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// A configuration in one of the supported formats.
#[derive(Debug, Clone)]
pub enum Configuration {
    /// A parsed block graph.
    Graph(ConfigGraph),
    /// A legacy JSON template.
    Template(LegacyTemplate),
}

/// Runs the evaluation phases in order, then the jobs.
///
/// Each phase returns early when it reports errors or when the run has been
/// cancelled; later phases never see a half-evaluated configuration.
pub struct SequentialScheduler {
    scheduler: Box<dyn ConfigScheduler>,
    ui: Arc<dyn Ui>,
    registry: Arc<dyn BuildRegistry>,
    cancel: Arc<CancellationToken>,
}

fn cancelled() -> Diagnostics {
    Diagnostics::from(
        Diagnostic::error("Build cancelled")
            .with_detail("Cleanly cancelled builds after being interrupted."),
    )
}

impl SequentialScheduler {
    /// Creates a driver for `configuration`.
    ///
    /// Output goes to stdout/stderr through `redactor`, machine-readable if
    /// the options ask for it.
    #[must_use]
    pub fn new(
        configuration: Configuration,
        plugins: Arc<PluginSet>,
        options: SchedulerOptions,
        redactor: Arc<RedactionRegistry>,
    ) -> Self {
        let ui: Arc<dyn Ui> = if options.machine_readable {
            Arc::new(MachineReadableUi::new(Box::new(io::stdout()), redactor.clone()))
        } else {
            Arc::new(BasicUi::stdio(redactor.clone()))
        };
        let scheduler: Box<dyn ConfigScheduler> = match configuration {
            Configuration::Graph(graph) => {
                Box::new(HclScheduler::new(graph, plugins, options, redactor))
            }
            Configuration::Template(template) => {
                Box::new(LegacyScheduler::new(template, plugins, options, redactor))
            }
        };
        Self {
            scheduler,
            ui,
            registry: Arc::new(NullRegistry),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Writes to `ui` instead of stdio.
    #[must_use]
    pub fn with_ui(mut self, ui: Arc<dyn Ui>) -> Self {
        self.ui = ui;
        self
    }

    /// Reports the iteration and every job to `registry`.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn BuildRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Observes `cancel`, which may be fired from another task.
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

    /// Options in effect.
    #[must_use]
    pub fn options(&self) -> &SchedulerOptions {
        self.scheduler.options()
    }

    /// Evaluates the configuration and prepares its jobs without running them.
    pub async fn validate(&mut self) -> Diagnostics {
        self.evaluate().await.1
    }

    /// Evaluates the configuration and runs the selected jobs.
    pub async fn run(mut self) -> RunReport {
        let started = Instant::now();
        let (jobs, diags) = self.evaluate().await;
        if diags.has_errors() {
            let mut report = RunReport::from_diagnostics(diags);
            report.cancelled = self.cancel.is_cancelled();
            report.duration = started.elapsed();
            return report;
        }

        let names: Vec<String> = jobs.iter().map(|job| job.name().to_string()).collect();
        if let Err(e) = self.registry.populate_iteration(&self.cancel, &names).await {
            warn!(error = %e, "Populating iteration failed");
            let mut report = RunReport::from_diagnostics(Diagnostics::from(
                Diagnostic::error("registry: populating iteration failed").with_detail(e.to_string()),
            ));
            report.duration = started.elapsed();
            return report;
        }

        let runner = ConcurrentRunner::new(self.scheduler.options().clone(), self.ui.clone())
            .with_registry(self.registry.clone())
            .with_cancellation(self.cancel.clone());
        let mut report = runner.run(jobs).await;
        self.registry.iteration_status_summary(self.ui.as_ref());

        let mut all = diags;
        all.extend(report.diagnostics);
        report.diagnostics = all;
        report.duration = started.elapsed();
        info!(
            jobs = report.states.len(),
            failures = report.failures.len(),
            cancelled = report.cancelled,
            "Run finished"
        );
        report
    }

    async fn evaluate(&mut self) -> (Vec<BuildJob>, Diagnostics) {
        let mut diags = Diagnostics::new();
        if let Err(e) = self.scheduler.options().validate() {
            diags.push(Diagnostic::error(e.to_string()));
            return (Vec::new(), diags);
        }

        diags.extend(self.scheduler.evaluate_datasources(&self.cancel).await);
        if let Some(stop) = self.stop(&diags) {
            return (Vec::new(), stop);
        }
        diags.extend(self.scheduler.evaluate_variables());
        if let Some(stop) = self.stop(&diags) {
            return (Vec::new(), stop);
        }
        diags.extend(self.scheduler.evaluate_builds());
        if let Some(stop) = self.stop(&diags) {
            return (Vec::new(), stop);
        }

        let (jobs, build_diags) = self.scheduler.get_builds();
        diags.extend(build_diags);
        if diags.has_errors() {
            return (Vec::new(), diags);
        }
        (jobs, diags)
    }

    /// Diagnostics to return if evaluation must stop here.
    fn stop(&self, diags: &Diagnostics) -> Option<Diagnostics> {
        if self.cancel.is_cancelled() {
            info!(reason = ?self.cancel.reason(), "Cancelled during evaluation");
            return Some(cancelled());
        }
        diags.has_errors().then(|| diags.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Body, BuildBlock, DatasourceBlock, Expr, LocalBlock, SourceBlock, SourceRef, SourceUsage,
    };
    use crate::registry::MemoryRegistry;
    use crate::runner::JobState;
    use crate::testing::{mock_plugins, CollectingUi, MockDatasource};
    use crate::plugin::Datasource;
    use pretty_assertions::assert_eq;

    fn graph(sources: &[&str]) -> ConfigGraph {
        let mut graph = ConfigGraph::new();
        let mut build = BuildBlock::new();
        for name in sources {
            graph
                .add_source(SourceBlock::new("mock", *name, Body::new()))
                .unwrap();
            build = build.with_source(SourceUsage::new(SourceRef::new("mock", *name)));
        }
        graph.add_build(build);
        graph
    }

    fn scheduler(configuration: Configuration, options: SchedulerOptions) -> (SequentialScheduler, Arc<CollectingUi>) {
        let ui = Arc::new(CollectingUi::new());
        let scheduler = SequentialScheduler::new(
            configuration,
            Arc::new(mock_plugins()),
            options.with_color(false),
            Arc::new(RedactionRegistry::new()),
        )
        .with_ui(ui.clone());
        (scheduler, ui)
    }

    #[tokio::test]
    async fn test_run_graph() {
        let (scheduler, ui) = scheduler(
            Configuration::Graph(graph(&["a", "b"])),
            SchedulerOptions::new(),
        );
        let report = scheduler.run().await;

        assert_eq!(report.exit_code(), 0, "{}", report.diagnostics);
        assert_eq!(report.jobs_in(JobState::Succeeded), vec!["mock.a", "mock.b"]);
        assert!(ui.contains("Build 'mock.a' finished after"));
    }

    #[tokio::test]
    async fn test_evaluation_errors_stop_before_running() {
        let mut graph = graph(&["a"]);
        graph.add_local(LocalBlock::new("x", Expr::reference("var.missing")));
        let (scheduler, ui) = scheduler(Configuration::Graph(graph), SchedulerOptions::new());
        let report = scheduler.run().await;

        assert_eq!(report.exit_code(), 1);
        assert!(report.states.is_empty());
        assert!(!ui.contains("Wait completed"));
    }

    #[tokio::test]
    async fn test_every_unresolved_local_is_reported() {
        let mut graph = graph(&["a"]);
        graph.add_local(LocalBlock::new("x", Expr::reference("var.missing_one")));
        graph.add_local(LocalBlock::new("y", Expr::reference("var.missing_two")));
        let (mut scheduler, _) = scheduler(Configuration::Graph(graph), SchedulerOptions::new());
        let diags = scheduler.validate().await;

        let details: Vec<String> = diags
            .iter()
            .map(|d| format!("{}: {}", d.summary, d.detail.as_deref().unwrap_or_default()))
            .collect();
        assert_eq!(details.len(), 2, "{details:#?}");
        assert!(details[0].contains("var.missing_one"), "{details:#?}");
        assert!(details[1].contains("var.missing_two"), "{details:#?}");
    }

    #[tokio::test]
    async fn test_invalid_options() {
        let options = SchedulerOptions::new()
            .with_machine_readable(true)
            .with_timestamp_ui(true);
        let (mut scheduler, _) = scheduler(Configuration::Graph(graph(&["a"])), options);
        let diags = scheduler.validate().await;
        assert!(diags.iter().next().unwrap().summary.starts_with("Invalid options"));
    }

    #[tokio::test]
    async fn test_cancelled_before_builds() {
        let mut plugins = mock_plugins();
        let cancel = Arc::new(CancellationToken::new());
        let token = cancel.clone();
        let datasource = MockDatasource::new();
        plugins.datasources.register("cancel", move || {
            token.cancel("interrupt");
            Ok(Box::new(datasource.clone()) as Box<dyn Datasource>)
        });
        let mut graph = graph(&["a"]);
        graph
            .add_datasource(DatasourceBlock::new("cancel", "x", Body::new()))
            .unwrap();

        let report = SequentialScheduler::new(
            Configuration::Graph(graph),
            Arc::new(plugins),
            SchedulerOptions::new(),
            Arc::new(RedactionRegistry::new()),
        )
        .with_ui(Arc::new(CollectingUi::new()))
        .with_cancellation(cancel)
        .run()
        .await;

        assert!(report.cancelled);
        assert_eq!(report.diagnostics.iter().next().unwrap().summary, "Build cancelled");
        assert!(report.states.is_empty());
    }

    #[tokio::test]
    async fn test_registry_sees_iteration() {
        let registry = Arc::new(MemoryRegistry::new().with_completed(["mock.a"]));
        let (scheduler, ui) = scheduler(
            Configuration::Graph(graph(&["a", "b"])),
            SchedulerOptions::new(),
        );
        let report = scheduler.with_registry(registry.clone()).run().await;

        assert_eq!(report.jobs_in(JobState::Skipped), vec!["mock.a"]);
        assert_eq!(report.jobs_in(JobState::Succeeded), vec!["mock.b"]);
        let fingerprint = registry.fingerprint().unwrap();
        assert!(ui.contains(&format!("Iteration {fingerprint}: 2 done, 0 failed, 0 pending")));
    }

    #[tokio::test]
    async fn test_run_legacy_template() {
        let template = LegacyTemplate::from_json_str(
            r#"{"builders": [{"type": "mock", "name": "web"}, {"type": "mock", "name": "db"}]}"#,
        )
        .unwrap();
        let (scheduler, _) = scheduler(
            Configuration::Template(template),
            SchedulerOptions::new().with_only(["w*"]),
        );
        let report = scheduler.run().await;
        assert_eq!(report.exit_code(), 0, "{}", report.diagnostics);
        assert_eq!(report.states.keys().collect::<Vec<_>>(), vec!["web"]);
    }
}
