//! Resolves every `data` block of a [`ConfigGraph`], following references
//! between data sources.
//!
//! Data sources without dependencies run first. The rest are resolved
//! depth-first: before one executes, each still-pending data source it
//! references is resolved. Recursion deeper than [`MAX_DATASOURCE_DEPTH`]
//! is reported instead of followed, which also stops dependency cycles.

use crate::cancellation::CancellationToken;
use crate::config::{BlockContext, ConfigGraph, DatasourceRef};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::plugin::{Datasource, PluginRegistry};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Deepest chain of pending data sources followed before giving up.
pub const MAX_DATASOURCE_DEPTH: usize = 10;

/// Placeholder for values that are not known because execution was skipped.
pub const UNKNOWN_VALUE: &str = "<unknown>";

type Pending = BTreeMap<DatasourceRef, Vec<DatasourceRef>>;

/// Resolves the data sources of one graph.
pub struct DatasourceResolver<'a> {
    graph: &'a mut ConfigGraph,
    plugins: &'a PluginRegistry<dyn Datasource>,
    cancel: &'a CancellationToken,
    skip_execution: bool,
}

impl<'a> DatasourceResolver<'a> {
    /// Creates a resolver that executes data sources.
    #[must_use]
    pub fn new(
        graph: &'a mut ConfigGraph,
        plugins: &'a PluginRegistry<dyn Datasource>,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            graph,
            plugins,
            cancel,
            skip_execution: false,
        }
    }

    /// Attaches placeholder values instead of executing data sources.
    #[must_use]
    pub fn skip_execution(mut self, skip: bool) -> Self {
        self.skip_execution = skip;
        self
    }

    /// Resolves every unresolved data source.
    ///
    /// Each data source executes at most once, even when it fails. Repeated
    /// recursive visits of one dependency chain report each summary once.
    pub async fn resolve(mut self) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let mut pending = Pending::new();

        let unresolved: Vec<(DatasourceRef, Vec<DatasourceRef>)> = self
            .graph
            .datasources()
            .values()
            .filter(|block| !block.is_resolved())
            .map(|block| (block.reference.clone(), block.dependencies()))
            .collect();

        for (reference, deps) in unresolved {
            if deps.is_empty() {
                diags.extend(self.execute(&reference).await);
            } else {
                pending.insert(reference, deps);
            }
        }

        let deferred: Vec<DatasourceRef> = pending.keys().cloned().collect();
        for reference in deferred {
            if !pending.contains_key(&reference) {
                continue;
            }
            let found = self.resolve_recursive(reference, &mut pending, 0).await;
            diags.extend(found.dedup_by_summary());
        }

        diags
    }

    fn resolve_recursive<'s>(
        &'s mut self,
        reference: DatasourceRef,
        pending: &'s mut Pending,
        depth: usize,
    ) -> BoxFuture<'s, Diagnostics> {
        async move {
            let mut diags = Diagnostics::new();
            if depth > MAX_DATASOURCE_DEPTH {
                let subject = self
                    .graph
                    .datasources()
                    .get(&reference)
                    .and_then(|b| b.range.clone());
                diags.push(
                    Diagnostic::error("Max datasource recursion depth exceeded.")
                        .with_detail(
                            "An error occurred while recursively evaluating data sources. \
                             Either your data source depends on more than ten other data \
                             sources, or your data sources have a cyclic dependency. Please \
                             simplify your config to continue.",
                        )
                        .with_subject(subject),
                );
                return diags;
            }

            let deps = pending.get(&reference).cloned().unwrap_or_default();
            for dep in deps {
                if !pending.contains_key(&dep) {
                    continue;
                }
                debug!(datasource = %reference, dependency = %dep, depth, "Resolving dependency");
                let found = self.resolve_recursive(dep, pending, depth + 1).await;
                let failed = found.has_errors();
                diags.extend(found);
                if failed {
                    return diags;
                }
            }

            diags.extend(self.execute(&reference).await);
            pending.remove(&reference);
            diags
        }
        .boxed()
    }

    async fn execute(&mut self, reference: &DatasourceRef) -> Diagnostics {
        let Some(block) = self.graph.datasources().get(reference) else {
            return Diagnostics::new();
        };
        let body = block.body.clone();
        let subject = block.range.clone();

        if self.cancel.is_cancelled() {
            return Diagnostic::error("Data source evaluation cancelled")
                .with_detail(format!("{reference} was not executed because the run was cancelled."))
                .with_subject(subject)
                .into();
        }

        let mut datasource = match self.plugins.start(&reference.ty) {
            Ok(ds) => ds,
            Err(e) => {
                return Diagnostic::error(format!("Failed to load {reference}"))
                    .with_detail(e.to_string())
                    .with_subject(subject)
                    .into();
            }
        };

        if self.skip_execution {
            let placeholder: Map<String, Value> = datasource
                .output_attributes()
                .into_iter()
                .map(|attr| (attr, Value::String(UNKNOWN_VALUE.to_string())))
                .collect();
            debug!(datasource = %reference, "Skipping execution, using placeholder value");
            self.graph
                .set_datasource_value(reference, Value::Object(placeholder));
            return Diagnostics::new();
        }

        let ctx = self.graph.eval_context(BlockContext::Datasource);
        let config = match body.evaluate(&ctx) {
            Ok(config) => config,
            Err(errors) => {
                return errors
                    .iter()
                    .map(|e| e.to_diagnostic(subject.clone()))
                    .collect();
            }
        };

        if let Err(e) = datasource.configure(&config) {
            return Diagnostic::error(format!("Invalid configuration for {reference}"))
                .with_detail(e.to_string())
                .with_subject(subject)
                .into();
        }

        info!(datasource = %reference, "Executing data source");
        match datasource.execute().await {
            Ok(value) => {
                self.graph.set_datasource_value(reference, value);
                Diagnostics::new()
            }
            Err(e) => Diagnostic::error(e.to_string())
                .with_subject(subject)
                .into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Body, DatasourceBlock, Expr};
    use crate::testing::MockDatasource;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry(mock: &MockDatasource) -> PluginRegistry<dyn Datasource> {
        let template = mock.clone();
        PluginRegistry::new("data source")
            .with("echo", move || Ok(Box::new(template.clone()) as Box<dyn Datasource>))
    }

    fn echo(name: &str, value: Expr) -> DatasourceBlock {
        DatasourceBlock::new(
            "echo",
            name,
            Body::new().with("name", Expr::lit(name)).with("value", value),
        )
    }

    #[tokio::test]
    async fn test_resolves_dependencies_once_each() {
        let mock = MockDatasource::new();
        let mut graph = ConfigGraph::new();
        // a <- b <- c, plus d also reading a
        graph.add_datasource(echo("a", Expr::lit("root"))).unwrap();
        graph
            .add_datasource(echo("b", Expr::reference("data.echo.a.value")))
            .unwrap();
        graph
            .add_datasource(echo("c", Expr::reference("data.echo.b.value")))
            .unwrap();
        graph
            .add_datasource(echo("d", Expr::reference("data.echo.a.value")))
            .unwrap();
        let plugins = registry(&mock);
        let token = CancellationToken::new();

        let diags = DatasourceResolver::new(&mut graph, &plugins, &token).resolve().await;

        assert!(diags.is_empty(), "{diags}");
        for name in ["a", "b", "c", "d"] {
            assert_eq!(mock.executions_named(name), 1, "{name}");
        }
        let c = &graph.datasources()[&DatasourceRef::new("echo", "c")];
        assert_eq!(c.value().unwrap()["value"], json!("root"));
    }

    #[tokio::test]
    async fn test_cycle_reports_depth_error() {
        let mock = MockDatasource::new();
        let mut graph = ConfigGraph::new();
        graph
            .add_datasource(echo("a", Expr::reference("data.echo.b.value")))
            .unwrap();
        graph
            .add_datasource(echo("b", Expr::reference("data.echo.a.value")))
            .unwrap();
        let plugins = registry(&mock);
        let token = CancellationToken::new();

        let diags = DatasourceResolver::new(&mut graph, &plugins, &token).resolve().await;

        // one per data source left in the cycle
        let summaries: Vec<&str> = diags.iter().map(|d| d.summary.as_str()).collect();
        assert_eq!(
            summaries,
            vec![
                "Max datasource recursion depth exceeded.",
                "Max datasource recursion depth exceeded."
            ]
        );
        assert!(mock.executions().is_empty());
    }

    #[tokio::test]
    async fn test_chain_of_ten_resolves() {
        let mock = MockDatasource::new();
        let mut graph = ConfigGraph::new();
        graph.add_datasource(echo("d0", Expr::lit("x"))).unwrap();
        for i in 1..=10 {
            graph
                .add_datasource(echo(
                    &format!("d{i}"),
                    Expr::reference(&format!("data.echo.d{}.value", i - 1)),
                ))
                .unwrap();
        }
        let plugins = registry(&mock);
        let token = CancellationToken::new();

        let diags = DatasourceResolver::new(&mut graph, &plugins, &token).resolve().await;

        assert!(!diags.has_errors(), "{diags}");
        assert_eq!(mock.executions().len(), 11);
    }

    #[tokio::test]
    async fn test_failure_executes_once() {
        let mock = MockDatasource::new().failing("endpoint unreachable");
        let mut graph = ConfigGraph::new();
        graph.add_datasource(echo("a", Expr::lit(1))).unwrap();
        graph
            .add_datasource(echo("b", Expr::reference("data.echo.a.value")))
            .unwrap();
        graph
            .add_datasource(echo("c", Expr::reference("data.echo.a.value")))
            .unwrap();
        let plugins = registry(&mock);
        let token = CancellationToken::new();

        let diags = DatasourceResolver::new(&mut graph, &plugins, &token).resolve().await;

        assert_eq!(mock.executions_named("a"), 1);
        let summaries: Vec<&str> = diags.iter().map(|d| d.summary.as_str()).collect();
        assert_eq!(
            summaries,
            vec!["endpoint unreachable", "Unknown reference", "Unknown reference"]
        );
    }

    #[tokio::test]
    async fn test_independent_failures_are_all_reported() {
        let mock = MockDatasource::new();
        let mut graph = ConfigGraph::new();
        graph
            .add_datasource(echo("p", Expr::reference("var.nope1")))
            .unwrap();
        graph
            .add_datasource(echo("q", Expr::reference("var.nope2")))
            .unwrap();
        let plugins = registry(&mock);
        let token = CancellationToken::new();

        let diags = DatasourceResolver::new(&mut graph, &plugins, &token).resolve().await;

        assert_eq!(diags.len(), 2, "{diags}");
        assert!(diags.iter().all(|d| d.summary == "Unknown reference"));
        assert!(mock.executions().is_empty());
    }

    #[tokio::test]
    async fn test_skip_execution_attaches_placeholder() {
        let mock = MockDatasource::new();
        let mut graph = ConfigGraph::new();
        graph.add_datasource(echo("a", Expr::lit(1))).unwrap();
        graph
            .add_datasource(echo("b", Expr::reference("data.echo.a.value")))
            .unwrap();
        let plugins = registry(&mock);
        let token = CancellationToken::new();

        let diags = DatasourceResolver::new(&mut graph, &plugins, &token)
            .skip_execution(true)
            .resolve()
            .await;

        assert!(diags.is_empty());
        assert!(mock.executions().is_empty());
        let a = &graph.datasources()[&DatasourceRef::new("echo", "a")];
        assert_eq!(a.value(), Some(&json!({"value": UNKNOWN_VALUE})));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mock = MockDatasource::new();
        let mut graph = ConfigGraph::new();
        graph.add_datasource(echo("a", Expr::lit(1))).unwrap();
        let plugins = registry(&mock);
        let token = CancellationToken::new();
        token.cancel("interrupt");

        let diags = DatasourceResolver::new(&mut graph, &plugins, &token).resolve().await;

        assert!(diags.has_errors());
        assert!(mock.executions().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let mock = MockDatasource::new();
        let mut graph = ConfigGraph::new();
        graph
            .add_datasource(DatasourceBlock::new("http", "x", Body::new()))
            .unwrap();
        let plugins = registry(&mock);
        let token = CancellationToken::new();

        let diags = DatasourceResolver::new(&mut graph, &plugins, &token).resolve().await;
        assert_eq!(diags.iter().next().unwrap().summary, "Failed to load data.http.x");
    }
}
