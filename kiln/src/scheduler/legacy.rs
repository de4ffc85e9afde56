//! Legacy JSON templates.
//!
//! A template lists `builders`, `provisioners` and `post-processors` as
//! plain JSON. Strings may interpolate ``{{user `name`}}`` and
//! ``{{env `NAME`}}``; both become expressions (a `var` reference and an
//! `env` call) so the template converts into a block graph with a single
//! unnamed build, scheduled like any other graph. Jobs and per-block
//! `only`/`except` lists use the builder names.

use super::hcl::HclScheduler;
use super::ConfigScheduler;
use crate::cancellation::CancellationToken;
use crate::config::{
    Body, BuildBlock, ConfigGraph, EvalContext, Expr, OnlyExcept, PostProcessorBlock,
    ProvisionerBlock, SourceBlock, SourceUsage, ValueOrigin, Variable,
};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::errors::KilnError;
use crate::options::SchedulerOptions;
use crate::plan::{BuildJob, JobNaming};
use crate::plugin::PluginSet;
use crate::redact::RedactionRegistry;
use crate::utils::parse_duration;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const ROOT_KEYS: &[&str] = &[
    "description",
    "variables",
    "sensitive-variables",
    "builders",
    "provisioners",
    "post-processors",
    "error-cleanup-provisioner",
];

const INTERPOLATION: &str = r"\{\{\s*(user|env)\s+`([^`]*)`\s*\}\}";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawTemplate {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    variables: BTreeMap<String, Value>,
    #[serde(default)]
    sensitive_variables: Vec<String>,
    #[serde(default)]
    builders: Vec<Map<String, Value>>,
    #[serde(default)]
    provisioners: Vec<Map<String, Value>>,
    #[serde(default)]
    post_processors: Vec<Value>,
    #[serde(default)]
    error_cleanup_provisioner: Option<Map<String, Value>>,
}

/// Rewrites template strings into expressions.
struct Interpolator {
    pattern: Regex,
}

impl Interpolator {
    fn new() -> Result<Self, KilnError> {
        let pattern = Regex::new(INTERPOLATION).map_err(|e| KilnError::Template(e.to_string()))?;
        Ok(Self { pattern })
    }

    /// A string with no interpolation stays a literal; a string that is a
    /// single interpolation becomes that expression, keeping its type.
    fn string(&self, text: &str) -> Expr {
        let mut parts = Vec::new();
        let mut last = 0;
        for caps in self.pattern.captures_iter(text) {
            let (Some(whole), Some(func), Some(arg)) = (caps.get(0), caps.get(1), caps.get(2)) else {
                continue;
            };
            if whole.start() > last {
                parts.push(Expr::lit(&text[last..whole.start()]));
            }
            parts.push(match func.as_str() {
                "user" => Expr::reference(&format!("var.{}", arg.as_str())),
                _ => Expr::call("env", vec![Expr::lit(arg.as_str())]),
            });
            last = whole.end();
        }
        if parts.is_empty() {
            return Expr::lit(text);
        }
        if last < text.len() {
            parts.push(Expr::lit(&text[last..]));
        }
        if parts.len() == 1 {
            return parts.remove(0);
        }
        Expr::template(parts)
    }

    fn value(&self, value: &Value) -> Expr {
        match value {
            Value::String(s) => self.string(s),
            Value::Array(items) => Expr::List(items.iter().map(|v| self.value(v)).collect()),
            Value::Object(map) => Expr::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.value(v)))
                    .collect(),
            ),
            other => Expr::Literal(other.clone()),
        }
    }

    fn body(&self, map: &Map<String, Value>) -> Body {
        map.iter()
            .fold(Body::new(), |body, (k, v)| body.with(k.clone(), self.value(v)))
    }
}

fn invalid(context: &str, message: impl std::fmt::Display) -> Diagnostic {
    Diagnostic::error(format!("{context}: {message}"))
}

fn take_string(
    map: &mut Map<String, Value>,
    key: &str,
    context: &str,
) -> Result<Option<String>, Diagnostic> {
    match map.remove(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(invalid(context, format_args!("'{key}' must be a string"))),
    }
}

fn take_type(map: &mut Map<String, Value>, context: &str) -> Result<String, Diagnostic> {
    match take_string(map, "type", context)? {
        Some(ty) if !ty.is_empty() => Ok(ty),
        _ => Err(invalid(context, "missing 'type'")),
    }
}

fn take_string_list(
    map: &mut Map<String, Value>,
    key: &str,
    context: &str,
) -> Result<Vec<String>, Diagnostic> {
    match map.remove(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(invalid(context, format_args!("'{key}' must list strings"))),
            })
            .collect(),
        Some(_) => Err(invalid(context, format_args!("'{key}' must be a list"))),
    }
}

fn take_duration(
    map: &mut Map<String, Value>,
    key: &str,
    context: &str,
) -> Result<Option<Duration>, Diagnostic> {
    take_string(map, key, context)?
        .map(|text| {
            parse_duration(&text)
                .map_err(|e| invalid(context, format_args!("invalid '{key}' {text:?}: {e}")))
        })
        .transpose()
}

fn take_retries(map: &mut Map<String, Value>, context: &str) -> Result<u32, Diagnostic> {
    let retries = match map.remove("max_retries") {
        None => return Ok(0),
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.parse::<u32>().ok(),
        Some(_) => None,
    };
    retries.ok_or_else(|| invalid(context, "'max_retries' must be a non-negative integer"))
}

fn take_only_except(map: &mut Map<String, Value>, context: &str) -> Result<OnlyExcept, Diagnostic> {
    Ok(OnlyExcept {
        only: take_string_list(map, "only", context)?,
        except: take_string_list(map, "except", context)?,
    })
}

/// A parsed legacy template.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyTemplate {
    /// Free-form description.
    pub description: Option<String>,
    variables: BTreeMap<String, Option<Expr>>,
    sensitive_variables: BTreeSet<String>,
    sources: Vec<SourceBlock>,
    provisioners: Vec<ProvisionerBlock>,
    error_cleanup_provisioner: Option<ProvisionerBlock>,
    post_processors: Vec<Vec<PostProcessorBlock>>,
    user_variables: BTreeMap<String, String>,
}

impl LegacyTemplate {
    /// Parses a template.
    ///
    /// Structural problems are collected and returned together as
    /// [`KilnError::Diagnostics`]. Keys starting with `_` are comments.
    pub fn from_json_str(json: &str) -> Result<Self, KilnError> {
        let root: Map<String, Value> = serde_json::from_str(json)?;
        let mut diags = Diagnostics::new();
        for key in root.keys() {
            if !key.starts_with('_') && !ROOT_KEYS.contains(&key.as_str()) {
                diags.push(Diagnostic::error(format!(
                    "Unknown root level key in template: '{key}'"
                )));
            }
        }
        let known: Map<String, Value> = root
            .into_iter()
            .filter(|(key, _)| ROOT_KEYS.contains(&key.as_str()))
            .collect();
        let raw: RawTemplate = serde_json::from_value(Value::Object(known))?;
        let interpolator = Interpolator::new()?;

        let variables: BTreeMap<String, Option<Expr>> = raw
            .variables
            .iter()
            .map(|(name, default)| {
                let default = (!default.is_null()).then(|| interpolator.value(default));
                (name.clone(), default)
            })
            .collect();
        for name in &raw.sensitive_variables {
            if !variables.contains_key(name) {
                diags.push(Diagnostic::error(format!(
                    "sensitive variable {name:?} is not declared in 'variables'"
                )));
            }
        }

        if raw.builders.is_empty() {
            diags.push(Diagnostic::error("at least one builder must be defined"));
        }
        let mut sources = Vec::new();
        let mut names = BTreeSet::new();
        for (i, mut builder) in raw.builders.into_iter().enumerate() {
            let context = format!("builder {}", i + 1);
            let parsed = take_type(&mut builder, &context).and_then(|ty| {
                let name = take_string(&mut builder, "name", &context)?.unwrap_or_else(|| ty.clone());
                Ok((ty, name))
            });
            match parsed {
                Ok((_, name)) if !names.insert(name.clone()) => {
                    diags.push(Diagnostic::error(format!(
                        "builder with name '{name}' already exists"
                    )));
                }
                Ok((ty, name)) => {
                    sources.push(SourceBlock::new(ty, name, interpolator.body(&builder)));
                }
                Err(d) => diags.push(d),
            }
        }

        let mut provisioners = Vec::new();
        for (i, raw) in raw.provisioners.into_iter().enumerate() {
            let context = format!("provisioner {}", i + 1);
            match provisioner(&interpolator, raw, &context, &names) {
                Ok(block) => provisioners.push(block),
                Err(errors) => diags.extend(errors),
            }
        }
        let error_cleanup_provisioner = match raw.error_cleanup_provisioner {
            Some(raw) => match provisioner(&interpolator, raw, "error-cleanup-provisioner", &names) {
                Ok(block) => Some(block),
                Err(errors) => {
                    diags.extend(errors);
                    None
                }
            },
            None => None,
        };

        let mut post_processors = Vec::new();
        for (i, raw) in raw.post_processors.into_iter().enumerate() {
            let context = format!("post-processor {}", i + 1);
            let steps = match raw {
                Value::Array(steps) => steps,
                single => vec![single],
            };
            let mut pipeline = Vec::new();
            for step in steps {
                match post_processor(&interpolator, step, &context, &names) {
                    Ok(block) => pipeline.push(block),
                    Err(errors) => diags.extend(errors),
                }
            }
            post_processors.push(pipeline);
        }

        if diags.has_errors() {
            return Err(diags.dedup_by_summary().into());
        }
        debug!(
            builders = sources.len(),
            provisioners = provisioners.len(),
            pipelines = post_processors.len(),
            "Parsed legacy template"
        );
        Ok(Self {
            description: raw.description,
            variables,
            sensitive_variables: raw.sensitive_variables.into_iter().collect(),
            sources,
            provisioners,
            error_cleanup_provisioner,
            post_processors,
            user_variables: BTreeMap::new(),
        })
    }

    /// Supplies a value for a template variable, as from the command line.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_variables.insert(name.into(), value.into());
        self
    }

    /// Builder names, in template order.
    #[must_use]
    pub fn builder_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.reference.name.as_str()).collect()
    }

    /// Converts the template into a block graph.
    ///
    /// Variable defaults are evaluated here and may only call `env`.
    /// Required variables without a value are reported.
    #[must_use]
    pub fn into_graph(self) -> (ConfigGraph, Diagnostics) {
        let mut graph = ConfigGraph::new();
        let mut diags = Diagnostics::new();
        let defaults_ctx = EvalContext::new();

        for (name, default) in &self.variables {
            let sensitive = self.sensitive_variables.contains(name);
            let variable = match (self.user_variables.get(name), default) {
                (Some(value), _) => Variable::new(name, Value::String(value.clone()))
                    .with_origin(ValueOrigin::CommandLine),
                (None, Some(expr)) => match expr.evaluate(&defaults_ctx) {
                    Ok(value) => Variable::new(name, value).with_expr(expr.clone()),
                    Err(e) => {
                        diags.push(
                            Diagnostic::error(format!("variable {name}: {}", e.summary()))
                                .with_detail(e.to_string()),
                        );
                        continue;
                    }
                },
                (None, None) => {
                    diags.push(Diagnostic::error(format!("required variable not set: {name}")));
                    continue;
                }
            };
            if let Err(d) = graph.add_variable(variable.with_sensitive(sensitive)) {
                diags.push(d);
            }
        }
        for name in self.user_variables.keys() {
            if !self.variables.contains_key(name) {
                diags.push(Diagnostic::error(format!(
                    "variable {name:?} is not declared in the template"
                )));
            }
        }

        let mut build = BuildBlock::new();
        build.description = self.description;
        for source in self.sources {
            build = build.with_source(SourceUsage::new(source.reference.clone()));
            if let Err(d) = graph.add_source(source) {
                diags.push(d);
            }
        }
        build.provisioners = self.provisioners;
        build.error_cleanup_provisioner = self.error_cleanup_provisioner;
        build.post_processors = self.post_processors;
        graph.add_build(build);

        (graph, diags)
    }
}

fn unknown_builders(
    only_except: &OnlyExcept,
    builders: &BTreeSet<String>,
    context: &str,
) -> Vec<Diagnostic> {
    let lists = [("only", &only_except.only), ("except", &only_except.except)];
    lists
        .into_iter()
        .flat_map(|(key, names)| names.iter().map(move |n| (key, n)))
        .filter(|(_, name)| !builders.contains(*name))
        .map(|(key, name)| invalid(context, format_args!("'{key}' specified builder '{name}' not found")))
        .collect()
}

fn provisioner(
    interpolator: &Interpolator,
    mut raw: Map<String, Value>,
    context: &str,
    builders: &BTreeSet<String>,
) -> Result<ProvisionerBlock, Vec<Diagnostic>> {
    let single = |d: Diagnostic| vec![d];
    let ty = take_type(&mut raw, context).map_err(single)?;
    let only_except = take_only_except(&mut raw, context).map_err(single)?;
    let pause_before = take_duration(&mut raw, "pause_before", context).map_err(single)?;
    let timeout = take_duration(&mut raw, "timeout", context).map_err(single)?;
    let max_retries = take_retries(&mut raw, context).map_err(single)?;

    let mut errors = unknown_builders(&only_except, builders, context);
    let overrides = match raw.remove("override") {
        None => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(single(invalid(context, "'override' must be an object"))),
    };
    let mut block = ProvisionerBlock::new(ty, interpolator.body(&raw))
        .with_only_except(only_except)
        .with_max_retries(max_retries);
    for (name, body) in overrides {
        match body {
            Value::Object(map) if builders.contains(&name) => {
                block = block.with_override(name, interpolator.body(&map));
            }
            Value::Object(_) => errors.push(invalid(
                context,
                format_args!("override: unknown builder name: {name}"),
            )),
            _ => errors.push(invalid(context, format_args!("override of {name} must be an object"))),
        }
    }
    if let Some(pause) = pause_before {
        block = block.with_pause_before(pause);
    }
    if let Some(timeout) = timeout {
        block = block.with_timeout(timeout);
    }

    if errors.is_empty() {
        Ok(block)
    } else {
        Err(errors)
    }
}

fn post_processor(
    interpolator: &Interpolator,
    raw: Value,
    context: &str,
    builders: &BTreeSet<String>,
) -> Result<PostProcessorBlock, Vec<Diagnostic>> {
    let single = |d: Diagnostic| vec![d];
    let mut raw = match raw {
        Value::String(ty) => return Ok(PostProcessorBlock::new(ty, Body::new())),
        Value::Object(map) => map,
        _ => return Err(single(invalid(context, "must be a string or an object"))),
    };
    let ty = take_type(&mut raw, context).map_err(single)?;
    let name = take_string(&mut raw, "name", context).map_err(single)?;
    let only_except = take_only_except(&mut raw, context).map_err(single)?;
    let keep = match raw.remove("keep_input_artifact") {
        None => None,
        Some(Value::Bool(keep)) => Some(keep),
        Some(_) => {
            return Err(single(invalid(context, "'keep_input_artifact' must be a boolean")));
        }
    };

    let errors = unknown_builders(&only_except, builders, context);
    if !errors.is_empty() {
        return Err(errors);
    }
    let mut block =
        PostProcessorBlock::new(ty, interpolator.body(&raw)).with_only_except(only_except);
    if let Some(name) = name {
        block = block.with_name(name);
    }
    if let Some(keep) = keep {
        block = block.with_keep_input_artifact(keep);
    }
    Ok(block)
}

/// Schedules a legacy template.
pub struct LegacyScheduler {
    inner: HclScheduler,
    pending: Diagnostics,
}

impl LegacyScheduler {
    /// Converts `template` and creates a scheduler for it.
    ///
    /// Variable problems found during conversion surface from
    /// [`evaluate_variables`](ConfigScheduler::evaluate_variables).
    #[must_use]
    pub fn new(
        template: LegacyTemplate,
        plugins: Arc<PluginSet>,
        options: SchedulerOptions,
        redactor: Arc<RedactionRegistry>,
    ) -> Self {
        let (graph, pending) = template.into_graph();
        Self {
            inner: HclScheduler::new(graph, plugins, options, redactor)
                .with_naming(JobNaming::SourceName),
            pending,
        }
    }

    /// The converted graph.
    #[must_use]
    pub fn graph(&self) -> &ConfigGraph {
        self.inner.graph()
    }
}

#[async_trait]
impl ConfigScheduler for LegacyScheduler {
    async fn evaluate_datasources(&mut self, _cancel: &CancellationToken) -> Diagnostics {
        Diagnostics::new()
    }

    fn evaluate_variables(&mut self) -> Diagnostics {
        let mut diags = std::mem::take(&mut self.pending);
        diags.extend(self.inner.evaluate_variables());
        diags
    }

    fn evaluate_builds(&mut self) -> Diagnostics {
        self.inner.evaluate_builds()
    }

    fn get_builds(&mut self) -> (Vec<BuildJob>, Diagnostics) {
        self.inner.get_builds()
    }

    fn options(&self) -> &SchedulerOptions {
        self.inner.options()
    }

    fn options_mut(&mut self) -> &mut SchedulerOptions {
        self.inner.options_mut()
    }
}
