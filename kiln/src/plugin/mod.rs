//! Plugin interfaces.
//!
//! Builders, provisioners, post-processors and data sources are opaque
//! capabilities started by type name from a [`PluginRegistry`]. Their
//! methods report failures as [`anyhow::Error`]; the core wraps those into
//! its own error and diagnostic types.

mod registry;

pub use registry::{PluginRegistry, PluginSet};

use crate::cancellation::CancellationToken;
use crate::ui::Ui;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Named values passed to plugins at prepare time and to provisioners at
/// run time.
pub type Variables = BTreeMap<String, Value>;

/// Hook name a builder fires to run the job's provisioners.
pub const HOOK_PROVISION: &str = "provision";

/// Output of a builder or post-processor.
pub trait Artifact: fmt::Display + fmt::Debug + Send + Sync {
    /// Identifier of the builder that produced the artifact.
    fn builder_id(&self) -> &str;

    /// Artifact identifier (image id, path, ...).
    fn id(&self) -> String;

    /// Files making up the artifact, if any.
    fn files(&self) -> Vec<String>;

    /// Plugin-specific state lookup.
    fn state(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Deletes the artifact.
    fn destroy(&self) -> anyhow::Result<()>;
}

/// Result of a successful builder `prepare`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prepared {
    /// Names of variables the builder will generate while running.
    pub generated_vars: Vec<String>,
    /// Non-fatal configuration warnings.
    pub warnings: Vec<String>,
}

/// Invoked by a builder at named points of its run.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Runs the hook identified by `name`.
    async fn run(
        &self,
        name: &str,
        cancel: &CancellationToken,
        ui: &dyn Ui,
        data: &Variables,
    ) -> anyhow::Result<()>;
}

/// Produces the base artifact of a build job.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Validates configuration.
    fn prepare(&mut self, vars: &Variables, config: &Value) -> anyhow::Result<Prepared>;

    /// Builds the artifact, firing [`HOOK_PROVISION`] on `hook` once the
    /// machine is reachable.
    async fn run(
        &self,
        cancel: &CancellationToken,
        ui: &dyn Ui,
        hook: &dyn Hook,
    ) -> anyhow::Result<Option<Arc<dyn Artifact>>>;
}

/// Configures the machine a builder is running.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Validates configuration.
    fn prepare(&mut self, vars: &Variables, config: &Value) -> anyhow::Result<()>;

    /// Runs against the machine described by `data`.
    async fn provision(
        &self,
        cancel: &CancellationToken,
        ui: &dyn Ui,
        data: &Variables,
    ) -> anyhow::Result<()>;
}

/// Result of one post-processing step.
#[derive(Debug, Clone)]
pub struct PostProcessed {
    /// New artifact; `None` halts the pipeline.
    pub artifact: Option<Arc<dyn Artifact>>,
    /// Whether the input artifact should be kept by default.
    pub keep: bool,
    /// Keep the input even if the user asked otherwise.
    pub force_override: bool,
}

impl PostProcessed {
    /// A step that produced `artifact` and lets the input be discarded.
    #[must_use]
    pub fn new(artifact: Arc<dyn Artifact>) -> Self {
        Self {
            artifact: Some(artifact),
            keep: false,
            force_override: false,
        }
    }

    /// Sets the default keep decision.
    #[must_use]
    pub fn keep_input(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Forces the input to be kept.
    #[must_use]
    pub fn force_keep(mut self) -> Self {
        self.keep = true;
        self.force_override = true;
        self
    }
}

/// Transforms artifacts after a build.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Validates configuration.
    fn configure(&mut self, vars: &Variables, config: &Value) -> anyhow::Result<()>;

    /// Processes `artifact`.
    async fn post_process(
        &self,
        cancel: &CancellationToken,
        ui: &dyn Ui,
        artifact: Arc<dyn Artifact>,
    ) -> anyhow::Result<PostProcessed>;
}

/// Fetches external values during configuration evaluation.
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Attribute names of the value `execute` returns.
    fn output_attributes(&self) -> Vec<String>;

    /// Validates configuration.
    fn configure(&mut self, config: &Value) -> anyhow::Result<()>;

    /// Fetches the value.
    async fn execute(&self) -> anyhow::Result<Value>;
}
