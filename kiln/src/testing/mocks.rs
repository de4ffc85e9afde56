//! Mock plugins for testing.

use crate::cancellation::CancellationToken;
use crate::plugin::{
    Artifact, Builder, Datasource, Hook, PluginSet, PostProcessed, PostProcessor, Prepared,
    Provisioner, Variables, HOOK_PROVISION,
};
use crate::ui::Ui;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Builder id reported by mock artifacts.
pub const MOCK_BUILDER_ID: &str = "kiln.mock";

/// An artifact that records whether it was destroyed.
#[derive(Debug)]
pub struct MockArtifact {
    id: String,
    files: Vec<String>,
    destroyed: Arc<AtomicBool>,
}

impl MockArtifact {
    /// Creates an artifact with its own destroyed flag.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_flag(id, Arc::new(AtomicBool::new(false)))
    }

    /// Creates an artifact sharing `destroyed` with the caller.
    #[must_use]
    pub fn with_flag(id: impl Into<String>, destroyed: Arc<AtomicBool>) -> Self {
        Self {
            id: id.into(),
            files: Vec::new(),
            destroyed,
        }
    }

    /// Sets the artifact files.
    #[must_use]
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    /// Returns true once `destroy` was called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl fmt::Display for MockArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock artifact {}", self.id)
    }
}

impl Artifact for MockArtifact {
    fn builder_id(&self) -> &str {
        MOCK_BUILDER_ID
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn files(&self) -> Vec<String> {
        self.files.clone()
    }

    fn destroy(&self) -> anyhow::Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Tracks how many holders are active at once.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    /// Creates a probe at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one more holder active.
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    /// Marks one holder finished.
    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneous holders seen.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

type RunCallback = Arc<dyn Fn() + Send + Sync>;

/// A configurable builder.
///
/// Clones share their counters, so a clone can be registered as a factory
/// template while the test keeps the original for assertions.
#[derive(Clone)]
pub struct MockBuilder {
    artifact_id: Option<String>,
    prepare_error: Option<String>,
    run_error: Option<String>,
    warnings: Vec<String>,
    generated_vars: Vec<String>,
    delay: Option<Duration>,
    probe: Option<Arc<ConcurrencyProbe>>,
    on_run: Option<RunCallback>,
    runs: Arc<AtomicUsize>,
    prepared_with: Arc<Mutex<Vec<(Variables, Value)>>>,
    destroyed: Arc<AtomicBool>,
}

impl MockBuilder {
    /// A builder producing an artifact with `artifact_id`.
    #[must_use]
    pub fn new(artifact_id: impl Into<String>) -> Self {
        Self {
            artifact_id: Some(artifact_id.into()),
            prepare_error: None,
            run_error: None,
            warnings: Vec::new(),
            generated_vars: Vec::new(),
            delay: None,
            probe: None,
            on_run: None,
            runs: Arc::new(AtomicUsize::new(0)),
            prepared_with: Arc::new(Mutex::new(Vec::new())),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Produces no artifact.
    #[must_use]
    pub fn without_artifact(mut self) -> Self {
        self.artifact_id = None;
        self
    }

    /// Fails `prepare` with `message`.
    #[must_use]
    pub fn failing_prepare(mut self, message: impl Into<String>) -> Self {
        self.prepare_error = Some(message.into());
        self
    }

    /// Fails `run` with `message` after provisioning.
    #[must_use]
    pub fn failing_run(mut self, message: impl Into<String>) -> Self {
        self.run_error = Some(message.into());
        self
    }

    /// Reports `warning` from `prepare`.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Declares a generated variable.
    #[must_use]
    pub fn with_generated_var(mut self, name: impl Into<String>) -> Self {
        self.generated_vars.push(name.into());
        self
    }

    /// Sleeps for `delay` during `run`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Reports activity to `probe` during `run`.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<ConcurrencyProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Calls `f` at the start of every `run`.
    #[must_use]
    pub fn on_run<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_run = Some(Arc::new(f));
        self
    }

    /// Number of completed and in-flight runs.
    #[must_use]
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Variables and config of every `prepare` call.
    #[must_use]
    pub fn prepared_with(&self) -> Vec<(Variables, Value)> {
        self.prepared_with.lock().clone()
    }

    /// Flag set when an artifact of this builder is destroyed.
    #[must_use]
    pub fn artifact_destroyed(&self) -> Arc<AtomicBool> {
        self.destroyed.clone()
    }
}

#[async_trait]
impl Builder for MockBuilder {
    fn prepare(&mut self, vars: &Variables, config: &Value) -> anyhow::Result<Prepared> {
        self.prepared_with.lock().push((vars.clone(), config.clone()));
        if let Some(message) = &self.prepare_error {
            anyhow::bail!("{message}");
        }
        Ok(Prepared {
            generated_vars: self.generated_vars.clone(),
            warnings: self.warnings.clone(),
        })
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        ui: &dyn Ui,
        hook: &dyn Hook,
    ) -> anyhow::Result<Option<Arc<dyn Artifact>>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(probe) = &self.probe {
            probe.enter();
        }
        if let Some(f) = &self.on_run {
            f();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let data = Variables::from([("ID".to_string(), json!(self.artifact_id))]);
        let provisioned = hook.run(HOOK_PROVISION, cancel, ui, &data).await;
        if let Some(probe) = &self.probe {
            probe.exit();
        }
        provisioned?;

        if let Some(message) = &self.run_error {
            anyhow::bail!("{message}");
        }
        Ok(self.artifact_id.as_ref().map(|id| {
            Arc::new(MockArtifact::with_flag(id.clone(), self.destroyed.clone())) as Arc<dyn Artifact>
        }))
    }
}

/// A provisioner that can fail a number of times or run slowly.
#[derive(Clone)]
pub struct MockProvisioner {
    calls: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
    prepare_error: Option<String>,
    delay: Option<Duration>,
    prepared_with: Arc<Mutex<Vec<Value>>>,
}

impl Default for MockProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvisioner {
    /// A provisioner that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            failures_left: Arc::new(AtomicUsize::new(0)),
            prepare_error: None,
            delay: None,
            prepared_with: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fails the first `times` runs.
    #[must_use]
    pub fn failing_times(self, times: usize) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    /// Fails `prepare` with `message`.
    #[must_use]
    pub fn failing_prepare(mut self, message: impl Into<String>) -> Self {
        self.prepare_error = Some(message.into());
        self
    }

    /// Sleeps for `delay` on each run.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared run counter.
    #[must_use]
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Configs passed to `prepare`.
    #[must_use]
    pub fn prepared_with(&self) -> Vec<Value> {
        self.prepared_with.lock().clone()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    fn prepare(&mut self, _vars: &Variables, config: &Value) -> anyhow::Result<()> {
        self.prepared_with.lock().push(config.clone());
        match &self.prepare_error {
            Some(message) => anyhow::bail!("{message}"),
            None => Ok(()),
        }
    }

    async fn provision(
        &self,
        _cancel: &CancellationToken,
        _ui: &dyn Ui,
        _data: &Variables,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("mock provisioner failure");
        }
        Ok(())
    }
}

/// A post-processor deriving a new artifact id from its input.
#[derive(Clone)]
pub struct MockPostProcessor {
    suffix: String,
    keep: bool,
    force_override: bool,
    halt: bool,
    error: Option<String>,
    configure_error: Option<String>,
    calls: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<String>>>,
    destroyed: Arc<AtomicBool>,
}

impl MockPostProcessor {
    /// Produces `<input id>-<suffix>` and lets the input be discarded.
    #[must_use]
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            keep: false,
            force_override: false,
            halt: false,
            error: None,
            configure_error: None,
            calls: Arc::new(AtomicUsize::new(0)),
            inputs: Arc::new(Mutex::new(Vec::new())),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Asks for the input to be kept by default.
    #[must_use]
    pub fn keeping_input(mut self) -> Self {
        self.keep = true;
        self
    }

    /// Forces the input to be kept regardless of user settings.
    #[must_use]
    pub fn forcing_keep(mut self) -> Self {
        self.keep = true;
        self.force_override = true;
        self
    }

    /// Returns no artifact, halting the pipeline.
    #[must_use]
    pub fn halting(mut self) -> Self {
        self.halt = true;
        self
    }

    /// Fails with `message`.
    #[must_use]
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Fails `configure` with `message`.
    #[must_use]
    pub fn failing_configure(mut self, message: impl Into<String>) -> Self {
        self.configure_error = Some(message.into());
        self
    }

    /// Shared call counter.
    #[must_use]
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Ids of the artifacts received, in order.
    #[must_use]
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }

    /// Flag set when an artifact of this post-processor is destroyed.
    #[must_use]
    pub fn artifact_destroyed(&self) -> Arc<AtomicBool> {
        self.destroyed.clone()
    }
}

#[async_trait]
impl PostProcessor for MockPostProcessor {
    fn configure(&mut self, _vars: &Variables, _config: &Value) -> anyhow::Result<()> {
        match &self.configure_error {
            Some(message) => anyhow::bail!("{message}"),
            None => Ok(()),
        }
    }

    async fn post_process(
        &self,
        _cancel: &CancellationToken,
        _ui: &dyn Ui,
        artifact: Arc<dyn Artifact>,
    ) -> anyhow::Result<PostProcessed> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(artifact.id());
        if let Some(message) = &self.error {
            anyhow::bail!("{message}");
        }
        if self.halt {
            return Ok(PostProcessed {
                artifact: None,
                keep: self.keep,
                force_override: self.force_override,
            });
        }
        let produced = MockArtifact::with_flag(
            format!("{}-{}", artifact.id(), self.suffix),
            self.destroyed.clone(),
        );
        Ok(PostProcessed {
            artifact: Some(Arc::new(produced)),
            keep: self.keep,
            force_override: self.force_override,
        })
    }
}

/// A data source that returns its own configuration.
#[derive(Clone)]
pub struct MockDatasource {
    outputs: Vec<String>,
    error: Option<String>,
    config: Value,
    executions: Arc<Mutex<Vec<Value>>>,
}

impl Default for MockDatasource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDatasource {
    /// An echoing data source with a single `value` output attribute.
    #[must_use]
    pub fn new() -> Self {
        Self {
            outputs: vec!["value".to_string()],
            error: None,
            config: Value::Null,
            executions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fails `execute` with `message`.
    #[must_use]
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Configs of every execution, in order.
    #[must_use]
    pub fn executions(&self) -> Vec<Value> {
        self.executions.lock().clone()
    }

    /// Number of executions whose config has `name` as its `name` attribute.
    #[must_use]
    pub fn executions_named(&self, name: &str) -> usize {
        self.executions
            .lock()
            .iter()
            .filter(|c| c.get("name").and_then(Value::as_str) == Some(name))
            .count()
    }
}

#[async_trait]
impl Datasource for MockDatasource {
    fn output_attributes(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn configure(&mut self, config: &Value) -> anyhow::Result<()> {
        self.config = config.clone();
        Ok(())
    }

    async fn execute(&self) -> anyhow::Result<Value> {
        self.executions.lock().push(self.config.clone());
        if let Some(message) = &self.error {
            anyhow::bail!("{message}");
        }
        Ok(self.config.clone())
    }
}

/// A plugin set with one mock of each kind: builder `mock`, provisioner
/// `shell`, post-processor `compress` and data source `echo`.
#[must_use]
pub fn mock_plugins() -> PluginSet {
    let mut plugins = PluginSet::new();
    plugins.builders.register("mock", || {
        Ok(Box::new(MockBuilder::new("mock-artifact")) as Box<dyn Builder>)
    });
    plugins.provisioners.register("shell", || {
        Ok(Box::new(MockProvisioner::new()) as Box<dyn Provisioner>)
    });
    plugins.post_processors.register("compress", || {
        Ok(Box::new(MockPostProcessor::new("compressed")) as Box<dyn PostProcessor>)
    });
    plugins.datasources.register("echo", || {
        Ok(Box::new(MockDatasource::new()) as Box<dyn Datasource>)
    });
    plugins
}
