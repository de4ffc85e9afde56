//! Turns evaluated build blocks into prepared [`BuildJob`]s.

use super::filter::JobFilter;
use super::job::{BuildJob, CoreBuildPostProcessor};
use crate::config::{
    BlockContext, Body, BuildBlock, ConfigGraph, EvalContext, PostProcessorBlock,
    ProvisionerBlock, SourceBlock, SourceUsage, BUILD_NAMESPACE, SOURCE_NAMESPACE,
};
use crate::datasource::UNKNOWN_VALUE;
use crate::diagnostics::{Diagnostic, Diagnostics, SourceRange};
use crate::errors::EvalError;
use crate::options::SchedulerOptions;
use crate::plugin::{PluginRegistry, PluginSet, Variables};
use crate::provision::{decorate, HookedProvisioner};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

/// Keys most builders generate while running. Provisioners are prepared
/// with a placeholder for each of them.
pub const BUILDER_DATA_KEYS: &[&str] = &[
    "ID",
    "Host",
    "Port",
    "User",
    "Password",
    "ConnType",
    "RunUUID",
    "HTTPPort",
    "HTTPIP",
    "HTTPAddr",
    "SSHPublicKey",
    "SSHPrivateKey",
    "WinRMPassword",
];

/// How job names are derived from build blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobNaming {
    /// `<build>.<type>.<name>`, or `<type>.<name>` for unnamed builds.
    #[default]
    Qualified,
    /// The source usage name alone, as legacy templates name builders.
    /// Per-block `only`/`except` lists then refer to these names too.
    SourceName,
}

/// Builds the job list for one run.
pub struct BuildPlanBuilder<'a> {
    graph: &'a ConfigGraph,
    plugins: &'a PluginSet,
    options: &'a SchedulerOptions,
    naming: JobNaming,
    run_id: Uuid,
}

fn eval_diagnostics(errors: Vec<EvalError>, subject: Option<&SourceRange>) -> Diagnostics {
    errors
        .into_iter()
        .map(|e| e.to_diagnostic(subject.cloned()))
        .collect()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut prev = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev + usize::from(ca != *cb);
            prev = row[j + 1];
            row[j + 1] = substitution.min(prev + 1).min(row[j] + 1);
        }
    }
    row[b.len()]
}

/// Closest candidate within an edit distance of 2, if any.
fn suggest<'c>(name: &str, candidates: impl IntoIterator<Item = &'c str>) -> Option<&'c str> {
    candidates
        .into_iter()
        .map(|c| (levenshtein(name, c), c))
        .filter(|(distance, _)| *distance < 3)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, c)| c)
}

fn unknown_type<P: ?Sized>(
    registry: &PluginRegistry<P>,
    ty: &str,
    subject: Option<&SourceRange>,
) -> Option<Diagnostic> {
    if registry.has(ty) {
        return None;
    }
    Some(
        Diagnostic::error(format!("Unknown {} type {ty}", registry.kind()))
            .with_detail(format!("known {}s: {:?}", registry.kind(), registry.list()))
            .with_subject(subject.cloned()),
    )
}

impl<'a> BuildPlanBuilder<'a> {
    /// Creates a plan builder over an evaluated graph.
    #[must_use]
    pub fn new(graph: &'a ConfigGraph, plugins: &'a PluginSet, options: &'a SchedulerOptions) -> Self {
        Self {
            graph,
            plugins,
            options,
            naming: JobNaming::default(),
            run_id: Uuid::new_v4(),
        }
    }

    /// Sets the job naming scheme.
    #[must_use]
    pub fn with_naming(mut self, naming: JobNaming) -> Self {
        self.naming = naming;
        self
    }

    /// Sets the run identifier passed to builders.
    #[must_use]
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Checks every build block against the graph and the plugin registries
    /// without starting any plugin.
    #[must_use]
    pub fn validate(&self) -> Diagnostics {
        let mut diags = Diagnostics::new();
        for build in self.graph.builds() {
            for usage in &build.sources {
                let subject = usage.range.as_ref().or(build.range.as_ref());
                if self.graph.sources().contains_key(&usage.source) {
                    diags.extend(unknown_type(&self.plugins.builders, &usage.source.ty, subject));
                    continue;
                }
                let known: Vec<String> = self.graph.sources().keys().map(ToString::to_string).collect();
                let wanted = usage.source.to_string();
                let mut diag = Diagnostic::error(format!("Unknown source {wanted}"))
                    .with_subject(subject.cloned());
                if let Some(candidate) = suggest(&wanted, known.iter().map(String::as_str)) {
                    diag = diag.with_detail(format!("Did you mean {candidate:?}?"));
                } else {
                    diag = diag.with_detail(format!("Known sources: {known:?}"));
                }
                diags.push(diag);
            }

            for block in build.provisioners.iter().chain(&build.error_cleanup_provisioner) {
                diags.extend(unknown_type(&self.plugins.provisioners, &block.ptype, block.range.as_ref()));
                if let Err(d) = block.only_except.validate(block.range.clone()) {
                    diags.push(d);
                }
            }

            for block in build.post_processors.iter().flatten() {
                diags.extend(unknown_type(&self.plugins.post_processors, &block.ptype, block.range.as_ref()));
                if let Err(d) = block.only_except.validate(block.range.clone()) {
                    diags.push(d);
                }
            }
        }
        diags
    }

    /// Starts and prepares every plugin of every admitted job.
    ///
    /// A job whose plugins fail to prepare is left out; its diagnostics are
    /// returned alongside the jobs that did prepare.
    #[must_use]
    pub fn build(&self) -> (Vec<BuildJob>, Diagnostics) {
        let mut diags = Diagnostics::new();
        if self.graph.builds().is_empty() {
            diags.push(
                Diagnostic::error("Missing build block").with_detail(
                    "A build block with one or more sources is required for executing a build.",
                ),
            );
            return (Vec::new(), diags);
        }

        let mut filter = match JobFilter::new(&self.options.only, &self.options.except) {
            Ok(filter) => filter,
            Err(errors) => return (Vec::new(), errors),
        };

        let mut jobs = Vec::new();
        let mut possible_names = Vec::new();
        let mut seen = BTreeSet::new();
        for build in self.graph.builds() {
            for usage in &build.sources {
                let name = self.job_name(build, usage);
                possible_names.push(name.clone());
                if !filter.admit(&name) {
                    debug!(job = %name, "Job filtered out by only/except");
                    continue;
                }
                if !seen.insert(name.clone()) {
                    diags.push(
                        Diagnostic::error("Duplicate build job")
                            .with_detail(format!("A build job named {name:?} is already defined."))
                            .with_subject(usage.range.clone()),
                    );
                    continue;
                }
                match self.prepare_job(build, usage, name, &mut filter) {
                    Ok((job, warnings)) => {
                        diags.extend(warnings);
                        jobs.push(job);
                    }
                    Err(errors) => diags.extend(errors),
                }
            }
        }

        diags.extend(filter.unmatched_warnings(&possible_names));
        (jobs, diags)
    }

    fn job_name(&self, build: &BuildBlock, usage: &SourceUsage) -> String {
        match self.naming {
            JobNaming::Qualified => build.job_name(usage),
            JobNaming::SourceName => usage.name().to_string(),
        }
    }

    /// Variables every plugin of a job is prepared with.
    fn builder_variables(&self, usage: &SourceUsage) -> Variables {
        let mut vars: Variables = usage
            .builder_variables()
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        vars.insert("kiln_core_version".into(), json!(self.graph.core_version()));
        vars.insert("kiln_debug".into(), json!(self.options.debug));
        vars.insert("kiln_force".into(), json!(self.options.force));
        vars.insert("kiln_on_error".into(), json!(self.options.on_error.to_string()));
        vars.insert("kiln_run_uuid".into(), json!(self.run_id.to_string()));
        vars
    }

    fn source_context(&self, usage: &SourceUsage) -> EvalContext {
        let mut ctx = self.graph.eval_context(BlockContext::Build);
        ctx.set_namespace(
            SOURCE_NAMESPACE,
            json!({ "type": usage.source.ty, "name": usage.name() }),
        );
        ctx
    }

    fn provisioner_context(
        &self,
        source_ctx: &EvalContext,
        build: &BuildBlock,
        generated_vars: &[String],
    ) -> EvalContext {
        let mut values: Map<String, Value> = BUILDER_DATA_KEYS
            .iter()
            .map(|k| ((*k).to_string(), json!(UNKNOWN_VALUE)))
            .collect();
        for var in generated_vars {
            values.insert(var.clone(), json!(UNKNOWN_VALUE));
        }
        values.insert("name".into(), json!(build.name.clone().unwrap_or_default()));

        let mut ctx = source_ctx.clone();
        ctx.set_namespace(BUILD_NAMESPACE, Value::Object(values));
        ctx
    }

    fn prepare_job(
        &self,
        build: &BuildBlock,
        usage: &SourceUsage,
        name: String,
        filter: &mut JobFilter,
    ) -> Result<(BuildJob, Diagnostics), Diagnostics> {
        let source: &SourceBlock = self.graph.sources().get(&usage.source).ok_or_else(|| {
            Diagnostics::from(
                Diagnostic::error(format!("Unknown source {}", usage.source))
                    .with_subject(usage.range.clone()),
            )
        })?;
        let subject = source.range.as_ref();

        let mut builder = self.plugins.builders.start(&usage.source.ty).map_err(|e| {
            Diagnostics::from(
                Diagnostic::error(format!("Failed loading builder for {name}"))
                    .with_detail(e.to_string())
                    .with_subject(subject.cloned()),
            )
        })?;

        let source_ctx = self.source_context(usage);
        let body = match &usage.overrides {
            Some(overrides) => source.body.merge(overrides),
            None => source.body.clone(),
        };
        let config = body
            .evaluate(&source_ctx)
            .map_err(|errors| eval_diagnostics(errors, subject))?;

        let vars = self.builder_variables(usage);
        let prepared = builder.prepare(&vars, &config).map_err(|e| {
            Diagnostics::from(
                Diagnostic::error(format!("Preparing build {name} failed"))
                    .with_detail(e.to_string())
                    .with_subject(subject.cloned()),
            )
        })?;

        let mut warnings: Diagnostics = prepared
            .warnings
            .iter()
            .map(|w| Diagnostic::warning(w.clone()).with_subject(subject.cloned()))
            .collect();

        let provision_ctx = self.provisioner_context(&source_ctx, build, &prepared.generated_vars);
        let target = usage.to_string();
        let filter_key = match self.naming {
            JobNaming::Qualified => target.clone(),
            JobNaming::SourceName => usage.name().to_string(),
        };
        let mut errors = Diagnostics::new();

        let mut provisioners = Vec::new();
        for block in &build.provisioners {
            if block.only_except.skip(&filter_key) {
                continue;
            }
            match self.start_provisioner(block, usage, &vars, &provision_ctx) {
                Ok(hooked) => provisioners.push(hooked),
                Err(d) => errors.extend(d),
            }
        }

        let cleanup = match &build.error_cleanup_provisioner {
            Some(block) if !block.only_except.skip(&filter_key) => {
                match self.start_provisioner(block, usage, &vars, &provision_ctx) {
                    Ok(hooked) => Some(hooked),
                    Err(d) => {
                        errors.extend(d);
                        None
                    }
                }
            }
            _ => None,
        };

        let mut pipelines = Vec::new();
        for pipeline in &build.post_processors {
            let mut steps = Vec::new();
            for block in pipeline {
                if block.only_except.skip(&filter_key) {
                    continue;
                }
                if filter.excludes_post_processor(block.display_name()) {
                    break;
                }
                match self.start_post_processor(block, &vars, &provision_ctx) {
                    Ok(step) => steps.push(step),
                    Err(d) => errors.extend(d),
                }
            }
            if !steps.is_empty() {
                pipelines.push(steps);
            }
        }

        if errors.has_errors() {
            warnings.extend(errors);
            return Err(warnings);
        }

        debug!(
            job = %name,
            provisioners = provisioners.len(),
            pipelines = pipelines.len(),
            "Prepared build job"
        );
        let job = BuildJob::new(name, target, usage.source.ty.clone(), builder)
            .with_builder_config(config)
            .with_provisioners(provisioners)
            .with_cleanup_provisioner(cleanup)
            .with_post_processors(pipelines)
            .with_generated_vars(prepared.generated_vars)
            .prepared();
        Ok((job, warnings))
    }

    fn start_provisioner(
        &self,
        block: &ProvisionerBlock,
        usage: &SourceUsage,
        vars: &Variables,
        ctx: &EvalContext,
    ) -> Result<HookedProvisioner, Diagnostics> {
        let subject = block.range.as_ref();
        let mut provisioner = self.plugins.provisioners.start(&block.ptype).map_err(|e| {
            Diagnostics::from(
                Diagnostic::error(format!("Failed loading provisioner {}", block.ptype))
                    .with_detail(e.to_string())
                    .with_subject(subject.cloned()),
            )
        })?;

        let body: Body = match block.overrides.get(usage.name()) {
            Some(overrides) => block.body.merge(overrides),
            None => block.body.clone(),
        };
        let config = body
            .evaluate(ctx)
            .map_err(|errors| eval_diagnostics(errors, subject))?;

        provisioner.prepare(vars, &config).map_err(|e| {
            Diagnostics::from(
                Diagnostic::error(format!(
                    "Failed preparing provisioner-block {:?} {:?}",
                    block.ptype,
                    block.display_name()
                ))
                .with_detail(e.to_string())
                .with_subject(subject.cloned()),
            )
        })?;

        Ok(HookedProvisioner {
            ptype: block.ptype.clone(),
            pname: block.pname.clone(),
            provisioner: decorate(provisioner, block),
            config,
        })
    }

    fn start_post_processor(
        &self,
        block: &PostProcessorBlock,
        vars: &Variables,
        ctx: &EvalContext,
    ) -> Result<CoreBuildPostProcessor, Diagnostics> {
        let subject = block.range.as_ref();
        let mut post_processor = self.plugins.post_processors.start(&block.ptype).map_err(|e| {
            Diagnostics::from(
                Diagnostic::error(format!("Failed loading post-processor {}", block.ptype))
                    .with_detail(e.to_string())
                    .with_subject(subject.cloned()),
            )
        })?;

        let config = block
            .body
            .evaluate(ctx)
            .map_err(|errors| eval_diagnostics(errors, subject))?;

        post_processor.configure(vars, &config).map_err(|e| {
            Diagnostics::from(
                Diagnostic::error(format!(
                    "Failed preparing post-processor-block {:?} {:?}",
                    block.ptype,
                    block.display_name()
                ))
                .with_detail(e.to_string())
                .with_subject(subject.cloned()),
            )
        })?;

        Ok(CoreBuildPostProcessor {
            ptype: block.ptype.clone(),
            pname: block.pname.clone(),
            post_processor,
            config,
            keep_input_artifact: block.keep_input_artifact,
        })
    }
}
