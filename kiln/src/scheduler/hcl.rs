use super::ConfigScheduler;
use crate::cancellation::CancellationToken;
use crate::config::ConfigGraph;
use crate::datasource::DatasourceResolver;
use crate::diagnostics::Diagnostics;
use crate::locals::LocalEvaluator;
use crate::options::SchedulerOptions;
use crate::plan::{BuildJob, BuildPlanBuilder, JobNaming};
use crate::plugin::PluginSet;
use crate::redact::RedactionRegistry;
use crate::utils::generate_run_id;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Schedules a block graph.
pub struct HclScheduler {
    graph: ConfigGraph,
    plugins: Arc<PluginSet>,
    options: SchedulerOptions,
    redactor: Arc<RedactionRegistry>,
    naming: JobNaming,
    run_id: Uuid,
}

impl HclScheduler {
    /// Creates a scheduler for `graph`.
    #[must_use]
    pub fn new(
        graph: ConfigGraph,
        plugins: Arc<PluginSet>,
        options: SchedulerOptions,
        redactor: Arc<RedactionRegistry>,
    ) -> Self {
        Self {
            graph,
            plugins,
            options,
            redactor,
            naming: JobNaming::Qualified,
            run_id: generate_run_id(),
        }
    }

    pub(super) fn with_naming(mut self, naming: JobNaming) -> Self {
        self.naming = naming;
        self
    }

    /// The graph as evaluated so far.
    #[must_use]
    pub fn graph(&self) -> &ConfigGraph {
        &self.graph
    }

    /// Identifier handed to every builder of this run.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn plan(&self) -> BuildPlanBuilder<'_> {
        BuildPlanBuilder::new(&self.graph, &self.plugins, &self.options)
            .with_naming(self.naming)
            .with_run_id(self.run_id)
    }
}

#[async_trait]
impl ConfigScheduler for HclScheduler {
    async fn evaluate_datasources(&mut self, cancel: &CancellationToken) -> Diagnostics {
        info!(
            datasources = self.graph.datasources().len(),
            skip = self.options.skip_datasources_execution,
            "Evaluating data sources"
        );
        DatasourceResolver::new(&mut self.graph, &self.plugins.datasources, cancel)
            .skip_execution(self.options.skip_datasources_execution)
            .resolve()
            .await
    }

    fn evaluate_variables(&mut self) -> Diagnostics {
        LocalEvaluator::new(&mut self.graph, &self.redactor).evaluate()
    }

    fn evaluate_builds(&mut self) -> Diagnostics {
        self.plan().validate()
    }

    fn get_builds(&mut self) -> (Vec<BuildJob>, Diagnostics) {
        let (jobs, diags) = self.plan().build();
        info!(jobs = jobs.len(), run_id = %self.run_id, "Prepared build jobs");
        (jobs, diags)
    }

    fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    fn options_mut(&mut self) -> &mut SchedulerOptions {
        &mut self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Body, BuildBlock, DatasourceBlock, Expr, LocalBlock, SourceBlock, SourceRef, SourceUsage,
        Variable,
    };
    use crate::testing::mock_plugins;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn graph() -> ConfigGraph {
        let mut graph = ConfigGraph::new();
        graph
            .add_variable(Variable::new("token", json!("hunter2")).with_sensitive(true))
            .unwrap();
        graph
            .add_datasource(DatasourceBlock::new(
                "echo",
                "base",
                Body::new().with("image", Expr::lit("ubuntu")),
            ))
            .unwrap();
        graph.add_local(LocalBlock::new(
            "image",
            Expr::reference("data.echo.base.image"),
        ));
        graph
            .add_source(SourceBlock::new(
                "mock",
                "vm",
                Body::new().with("image", Expr::reference("local.image")),
            ))
            .unwrap();
        graph.add_build(
            BuildBlock::new()
                .with_name("app")
                .with_source(SourceUsage::new(SourceRef::new("mock", "vm"))),
        );
        graph
    }

    #[tokio::test]
    async fn test_phases_in_order() {
        let redactor = Arc::new(RedactionRegistry::new());
        let mut scheduler = HclScheduler::new(
            graph(),
            Arc::new(mock_plugins()),
            SchedulerOptions::new(),
            redactor.clone(),
        );
        let cancel = CancellationToken::new();

        assert!(scheduler.evaluate_datasources(&cancel).await.is_empty());
        assert!(scheduler.evaluate_variables().is_empty());
        assert!(redactor.contains("hunter2"));
        assert_eq!(scheduler.graph().locals()["image"].value, json!("ubuntu"));
        assert!(scheduler.evaluate_builds().is_empty());

        let (jobs, diags) = scheduler.get_builds();
        assert!(diags.is_empty(), "{diags}");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name(), "app.mock.vm");
        assert_eq!(jobs[0].builder_config()["image"], "ubuntu");
    }

    #[tokio::test]
    async fn test_options_mut() {
        let mut scheduler = HclScheduler::new(
            ConfigGraph::new(),
            Arc::new(mock_plugins()),
            SchedulerOptions::new(),
            Arc::new(RedactionRegistry::new()),
        );
        scheduler.options_mut().debug = true;
        assert!(scheduler.options().debug);
    }
}
