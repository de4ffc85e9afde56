//! A fully prepared build job and its run lifecycle.

use crate::cancellation::CancellationToken;
use crate::errors::BuildError;
use crate::plugin::{Artifact, Builder, PostProcessor};
use crate::provision::{HookedProvisioner, ProvisionHook};
use crate::ui::Ui;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// A started and configured post-processor of one pipeline step.
pub struct CoreBuildPostProcessor {
    /// Plugin type.
    pub ptype: String,
    /// Optional display name.
    pub pname: Option<String>,
    /// The configured plugin.
    pub post_processor: Box<dyn PostProcessor>,
    /// Evaluated configuration.
    pub config: Value,
    /// User preference for keeping the step's input artifact.
    pub keep_input_artifact: Option<bool>,
}

impl CoreBuildPostProcessor {
    /// Name shown in output.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.pname.as_deref().unwrap_or(&self.ptype)
    }

    /// Combines the plugin's keep decision with the user preference.
    ///
    /// The user setting wins unless the plugin forces the input to be kept.
    fn resolve_keep(&self, plugin_keep: bool, force_override: bool) -> bool {
        match self.keep_input_artifact {
            None => plugin_keep,
            Some(false) if plugin_keep && force_override => {
                info!(
                    post_processor = self.display_name(),
                    "Post-processor forces the input artifact to be kept"
                );
                true
            }
            Some(keep) => keep,
        }
    }
}

impl fmt::Debug for CoreBuildPostProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreBuildPostProcessor")
            .field("ptype", &self.ptype)
            .field("pname", &self.pname)
            .field("keep_input_artifact", &self.keep_input_artifact)
            .finish_non_exhaustive()
    }
}

/// One unit of work: a source built by a builder, provisioned, then
/// post-processed.
pub struct BuildJob {
    name: String,
    source: String,
    builder_type: String,
    builder: Box<dyn Builder>,
    builder_config: Value,
    provisioners: Vec<HookedProvisioner>,
    cleanup_provisioner: Option<HookedProvisioner>,
    post_processors: Vec<Vec<CoreBuildPostProcessor>>,
    generated_vars: Vec<String>,
    prepared: bool,
}

impl BuildJob {
    /// Creates an unprepared job running `builder`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        builder_type: impl Into<String>,
        builder: Box<dyn Builder>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            builder_type: builder_type.into(),
            builder,
            builder_config: Value::Null,
            provisioners: Vec::new(),
            cleanup_provisioner: None,
            post_processors: Vec::new(),
            generated_vars: Vec::new(),
            prepared: false,
        }
    }

    /// Records the configuration the builder was prepared with.
    #[must_use]
    pub fn with_builder_config(mut self, config: Value) -> Self {
        self.builder_config = config;
        self
    }

    /// Sets the provisioner chain.
    #[must_use]
    pub fn with_provisioners(mut self, provisioners: Vec<HookedProvisioner>) -> Self {
        self.provisioners = provisioners;
        self
    }

    /// Sets the error-cleanup provisioner.
    #[must_use]
    pub fn with_cleanup_provisioner(mut self, cleanup: Option<HookedProvisioner>) -> Self {
        self.cleanup_provisioner = cleanup;
        self
    }

    /// Sets the post-processor pipelines.
    #[must_use]
    pub fn with_post_processors(mut self, pipelines: Vec<Vec<CoreBuildPostProcessor>>) -> Self {
        self.post_processors = pipelines;
        self
    }

    /// Records the variable names the builder will generate.
    #[must_use]
    pub fn with_generated_vars(mut self, vars: Vec<String>) -> Self {
        self.generated_vars = vars;
        self
    }

    /// Marks the job as ready to run. Every plugin of the job must have
    /// accepted its configuration.
    #[must_use]
    pub fn prepared(mut self) -> Self {
        self.prepared = true;
        self
    }

    /// Canonical job name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source usage this job builds, as `<type>.<name>`.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Builder plugin type.
    #[must_use]
    pub fn builder_type(&self) -> &str {
        &self.builder_type
    }

    /// Configuration the builder was prepared with.
    #[must_use]
    pub fn builder_config(&self) -> &Value {
        &self.builder_config
    }

    /// Provisioner chain in run order.
    #[must_use]
    pub fn provisioners(&self) -> &[HookedProvisioner] {
        &self.provisioners
    }

    /// Error-cleanup provisioner, if any.
    #[must_use]
    pub fn cleanup_provisioner(&self) -> Option<&HookedProvisioner> {
        self.cleanup_provisioner.as_ref()
    }

    /// Post-processor pipelines.
    #[must_use]
    pub fn post_processors(&self) -> &[Vec<CoreBuildPostProcessor>] {
        &self.post_processors
    }

    /// Variable names the builder generates.
    #[must_use]
    pub fn generated_vars(&self) -> &[String] {
        &self.generated_vars
    }

    /// Returns true once the plan builder prepared the job.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Runs the builder, its provisioners and every post-processor pipeline.
    ///
    /// Returns the artifacts to keep. Post-processor failures are collected
    /// per pipeline and reported together after all pipelines ran.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        ui: &dyn Ui,
    ) -> Result<Vec<Arc<dyn Artifact>>, BuildError> {
        if !self.prepared {
            return Err(BuildError::NotPrepared {
                job: self.name.clone(),
            });
        }

        let hook = ProvisionHook::new(&self.provisioners, self.cleanup_provisioner.as_ref());
        info!(job = %self.name, builder = %self.builder_type, "Running builder");
        let Some(builder_artifact) = self
            .builder
            .run(cancel, ui, &hook)
            .await
            .map_err(BuildError::Builder)?
        else {
            debug!(job = %self.name, "Builder produced no artifact");
            return Ok(Vec::new());
        };

        let mut artifacts: Vec<Arc<dyn Artifact>> = Vec::new();
        let mut errors = Vec::new();
        let mut keep_original = self.post_processors.is_empty();

        'pipelines: for pipeline in &self.post_processors {
            let mut prior = builder_artifact.clone();
            for (i, step) in pipeline.iter().enumerate() {
                if step.pname.is_some() {
                    ui.say(&format!(
                        "Running post-processor: {} (type {})",
                        step.display_name(),
                        step.ptype
                    ));
                } else {
                    ui.say(&format!("Running post-processor: {}", step.ptype));
                }

                let processed = match step
                    .post_processor
                    .post_process(cancel, ui, prior.clone())
                    .await
                {
                    Ok(processed) => processed,
                    Err(e) => {
                        errors.push(format!("Post-processor failed: {e}"));
                        continue 'pipelines;
                    }
                };

                let Some(artifact) = processed.artifact else {
                    debug!(job = %self.name, post_processor = step.display_name(), "No artifact, halting pipeline");
                    continue 'pipelines;
                };

                let keep = step.resolve_keep(processed.keep, processed.force_override);
                if i == 0 {
                    keep_original |= keep;
                } else if keep {
                    artifacts.push(prior.clone());
                } else {
                    debug!(job = %self.name, artifact = %prior.id(), "Deleting prior artifact");
                    if let Err(e) = prior.destroy() {
                        errors.push(format!(
                            "Failed cleaning up prior artifact: {e}; pp is {}",
                            step.ptype
                        ));
                    }
                }
                prior = artifact;
            }
            artifacts.push(prior);
        }

        if keep_original {
            artifacts.insert(0, builder_artifact);
        } else {
            debug!(job = %self.name, artifact = %builder_artifact.id(), "Deleting original artifact");
            if let Err(e) = builder_artifact.destroy() {
                errors.push(format!("Error destroying builder artifact: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(artifacts)
        } else {
            Err(BuildError::PostProcessing { errors })
        }
    }
}

impl fmt::Debug for BuildJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildJob")
            .field("name", &self.name)
            .field("builder_type", &self.builder_type)
            .field("provisioners", &self.provisioners)
            .field("post_processors", &self.post_processors)
            .field("prepared", &self.prepared)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CollectingUi, MockBuilder, MockPostProcessor, MockProvisioner};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn step(pp: MockPostProcessor, keep: Option<bool>) -> CoreBuildPostProcessor {
        CoreBuildPostProcessor {
            ptype: "compress".into(),
            pname: None,
            post_processor: Box::new(pp),
            config: json!({}),
            keep_input_artifact: keep,
        }
    }

    fn job(builder: MockBuilder) -> BuildJob {
        BuildJob::new("docker.a", "docker.a", "mock", Box::new(builder))
    }

    fn ids(artifacts: &[Arc<dyn Artifact>]) -> Vec<String> {
        artifacts.iter().map(|a| a.id()).collect()
    }

    #[tokio::test]
    async fn test_unprepared_job_refuses_to_run() {
        let err = job(MockBuilder::new("img"))
            .run(&CancellationToken::new(), &CollectingUi::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::NotPrepared { .. }));
    }

    #[tokio::test]
    async fn test_no_post_processors_keeps_builder_artifact() {
        let artifacts = job(MockBuilder::new("img"))
            .prepared()
            .run(&CancellationToken::new(), &CollectingUi::new())
            .await
            .unwrap();
        assert_eq!(ids(&artifacts), vec!["img".to_string()]);
    }

    #[tokio::test]
    async fn test_provisioners_run_through_hook() {
        let provisioner = MockProvisioner::new();
        let calls = provisioner.calls();
        let job = job(MockBuilder::new("img"))
            .with_provisioners(vec![HookedProvisioner {
                ptype: "shell".into(),
                pname: None,
                provisioner: Box::new(provisioner),
                config: json!({}),
            }])
            .prepared();

        job.run(&CancellationToken::new(), &CollectingUi::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_builder_failure_is_wrapped() {
        let err = job(MockBuilder::new("img").failing_run("boom"))
            .prepared()
            .run(&CancellationToken::new(), &CollectingUi::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_pipeline_destroys_original_by_default() {
        let builder = MockBuilder::new("img");
        let original_destroyed = builder.artifact_destroyed();
        let job = job(builder)
            .with_post_processors(vec![vec![step(MockPostProcessor::new("gz"), None)]])
            .prepared();

        let artifacts = job
            .run(&CancellationToken::new(), &CollectingUi::new())
            .await
            .unwrap();
        assert_eq!(ids(&artifacts), vec!["img-gz".to_string()]);
        assert!(original_destroyed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_keep_input_artifact_keeps_original() {
        let builder = MockBuilder::new("img");
        let original_destroyed = builder.artifact_destroyed();
        let job = job(builder)
            .with_post_processors(vec![vec![step(MockPostProcessor::new("gz"), Some(true))]])
            .prepared();

        let artifacts = job
            .run(&CancellationToken::new(), &CollectingUi::new())
            .await
            .unwrap();
        assert_eq!(ids(&artifacts), vec!["img".to_string(), "img-gz".to_string()]);
        assert!(!original_destroyed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_force_override_beats_user_false() {
        let job = job(MockBuilder::new("img"))
            .with_post_processors(vec![vec![step(
                MockPostProcessor::new("gz").forcing_keep(),
                Some(false),
            )]])
            .prepared();

        let artifacts = job
            .run(&CancellationToken::new(), &CollectingUi::new())
            .await
            .unwrap();
        assert_eq!(ids(&artifacts), vec!["img".to_string(), "img-gz".to_string()]);
    }

    #[tokio::test]
    async fn test_chain_destroys_intermediate_artifacts() {
        let first = MockPostProcessor::new("tar");
        let intermediate_destroyed = first.artifact_destroyed();
        let job = job(MockBuilder::new("img"))
            .with_post_processors(vec![vec![
                step(first, None),
                step(MockPostProcessor::new("gz"), None),
            ]])
            .prepared();

        let artifacts = job
            .run(&CancellationToken::new(), &CollectingUi::new())
            .await
            .unwrap();
        assert_eq!(ids(&artifacts), vec!["img-tar-gz".to_string()]);
        assert!(intermediate_destroyed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_pipeline_does_not_stop_others() {
        let job = job(MockBuilder::new("img"))
            .with_post_processors(vec![
                vec![step(MockPostProcessor::new("x").failing("disk full"), None)],
                vec![step(MockPostProcessor::new("gz"), None)],
            ])
            .prepared();

        let err = job
            .run(&CancellationToken::new(), &CollectingUi::new())
            .await
            .unwrap_err();
        match err {
            BuildError::PostProcessing { errors } => {
                assert_eq!(errors, vec!["Post-processor failed: disk full".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_halting_step_drops_pipeline_output() {
        let after = MockPostProcessor::new("never");
        let after_calls = after.calls();
        let job = job(MockBuilder::new("img"))
            .with_post_processors(vec![vec![
                step(MockPostProcessor::new("x").halting(), Some(true)),
                step(after, None),
            ]])
            .prepared();

        let artifacts = job
            .run(&CancellationToken::new(), &CollectingUi::new())
            .await
            .unwrap();
        assert!(artifacts.is_empty());
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    }
}
