//! Configuration blocks as produced by the parser.

use super::expr::{Body, Expr, ValueType};
use crate::diagnostics::{Diagnostic, SourceRange};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Kind of a top-level block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// `variable` block.
    Variable,
    /// Entry of a `locals` block or a `local` block.
    Local,
    /// `data` block.
    Datasource,
    /// `source` block.
    Source,
    /// `build` block.
    Build,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Variable => "variable",
            Self::Local => "local",
            Self::Datasource => "data",
            Self::Source => "source",
            Self::Build => "build",
        };
        f.write_str(name)
    }
}

/// Identity of a data source: `data.<type>.<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasourceRef {
    /// Plugin type.
    #[serde(rename = "type")]
    pub ty: String,
    /// Block label.
    pub name: String,
}

impl DatasourceRef {
    /// Creates a reference.
    #[must_use]
    pub fn new(ty: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DatasourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data.{}.{}", self.ty, self.name)
    }
}

/// A `data` block.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasourceBlock {
    /// Identity.
    pub reference: DatasourceRef,
    /// Configuration attributes.
    pub body: Body,
    /// Location in the configuration.
    pub range: Option<SourceRange>,
    value: Option<Value>,
}

impl DatasourceBlock {
    /// Creates an unresolved data source.
    #[must_use]
    pub fn new(ty: impl Into<String>, name: impl Into<String>, body: Body) -> Self {
        Self {
            reference: DatasourceRef::new(ty, name),
            body,
            range: None,
            value: None,
        }
    }

    /// Sets the source range.
    #[must_use]
    pub fn with_range(mut self, range: SourceRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Resolved output value, once executed.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Returns true once the data source has a value.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.value.is_some()
    }

    pub(crate) fn set_value(&mut self, value: Value) {
        self.value = Some(value);
    }

    /// Other data sources read by this block's body, in first-seen order.
    #[must_use]
    pub fn dependencies(&self) -> Vec<DatasourceRef> {
        let mut seen = BTreeSet::new();
        self.body
            .traversals()
            .into_iter()
            .filter_map(super::expr::Traversal::datasource)
            .filter(|r| seen.insert(r.clone()))
            .collect()
    }
}

/// A single `locals` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalBlock {
    /// Local name.
    pub name: String,
    /// Unevaluated value.
    pub expr: Expr,
    /// Whether the value must be redacted from output.
    pub sensitive: bool,
    /// Location in the configuration.
    pub range: Option<SourceRange>,
}

impl LocalBlock {
    /// Creates a non-sensitive local.
    #[must_use]
    pub fn new(name: impl Into<String>, expr: Expr) -> Self {
        Self {
            name: name.into(),
            expr,
            sensitive: false,
            range: None,
        }
    }

    /// Marks the local sensitive.
    #[must_use]
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Sets the source range.
    #[must_use]
    pub fn with_range(mut self, range: SourceRange) -> Self {
        self.range = Some(range);
        self
    }
}

/// Where a variable's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueOrigin {
    /// Declared default or local expression.
    #[default]
    Default,
    /// Environment variable.
    Environment,
    /// Variable definitions file.
    File,
    /// Command-line flag.
    CommandLine,
}

/// An evaluated variable or local.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Name.
    pub name: String,
    /// Evaluated value.
    pub value: Value,
    /// Type of `value`.
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// Whether the value must be redacted from output.
    pub sensitive: bool,
    /// Where the value came from.
    pub origin: ValueOrigin,
    /// Expression the value was computed from, for locals.
    #[serde(skip)]
    pub expr: Option<Expr>,
}

impl Variable {
    /// Creates a non-sensitive variable with a default origin.
    #[must_use]
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value_type: ValueType::of(&value),
            value,
            sensitive: false,
            origin: ValueOrigin::Default,
            expr: None,
        }
    }

    /// Sets sensitivity.
    #[must_use]
    pub fn with_sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = sensitive;
        self
    }

    /// Sets the value origin.
    #[must_use]
    pub fn with_origin(mut self, origin: ValueOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Records the source expression.
    #[must_use]
    pub fn with_expr(mut self, expr: Expr) -> Self {
        self.expr = Some(expr);
        self
    }

    /// Returns true when the value came from a constant expression.
    #[must_use]
    pub fn is_static_default(&self) -> bool {
        self.origin == ValueOrigin::Default && self.expr.as_ref().map_or(true, Expr::is_static)
    }
}

/// Identity of a source block: `<type>.<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef {
    /// Builder type.
    #[serde(rename = "type")]
    pub ty: String,
    /// Block label.
    pub name: String,
}

impl SourceRef {
    /// Creates a reference.
    #[must_use]
    pub fn new(ty: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.ty, self.name)
    }
}

/// A top-level `source` block.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBlock {
    /// Identity.
    pub reference: SourceRef,
    /// Builder configuration.
    pub body: Body,
    /// Location in the configuration.
    pub range: Option<SourceRange>,
}

impl SourceBlock {
    /// Creates a source block.
    #[must_use]
    pub fn new(ty: impl Into<String>, name: impl Into<String>, body: Body) -> Self {
        Self {
            reference: SourceRef::new(ty, name),
            body,
            range: None,
        }
    }

    /// Sets the source range.
    #[must_use]
    pub fn with_range(mut self, range: SourceRange) -> Self {
        self.range = Some(range);
        self
    }
}

/// Use of a source inside a build block, optionally renamed and overridden.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceUsage {
    /// Source being used.
    pub source: SourceRef,
    /// Name for this use, replacing the source's own name.
    pub local_name: Option<String>,
    /// Attributes layered over the source body.
    pub overrides: Option<Body>,
    /// Location in the configuration.
    pub range: Option<SourceRange>,
}

impl SourceUsage {
    /// Uses `source` as declared.
    #[must_use]
    pub fn new(source: SourceRef) -> Self {
        Self {
            source,
            local_name: None,
            overrides: None,
            range: None,
        }
    }

    /// Renames this use.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Overrides attributes of the source body.
    #[must_use]
    pub fn with_overrides(mut self, overrides: Body) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Name of this use: the local name if set, else the source name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.local_name.as_deref().unwrap_or(&self.source.name)
    }

    /// Builder variables exposed to the builder's `prepare`.
    #[must_use]
    pub fn builder_variables(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("kiln_build_name".to_string(), self.name().to_string()),
            ("kiln_builder_type".to_string(), self.source.ty.clone()),
        ])
    }
}

impl fmt::Display for SourceUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source.ty, self.name())
    }
}

/// `only`/`except` lists on provisioners and post-processors.
///
/// Entries are exact job source names, not globs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlyExcept {
    /// Run only for these sources.
    #[serde(default)]
    pub only: Vec<String>,
    /// Skip for these sources.
    #[serde(default)]
    pub except: Vec<String>,
}

impl OnlyExcept {
    /// Returns true if the block must not run for `name`.
    #[must_use]
    pub fn skip(&self, name: &str) -> bool {
        if !self.only.is_empty() {
            return !self.only.iter().any(|o| o == name);
        }
        self.except.iter().any(|e| e == name)
    }

    /// Rejects blocks that set both lists.
    pub fn validate(&self, subject: Option<SourceRange>) -> Result<(), Diagnostic> {
        if !self.only.is_empty() && !self.except.is_empty() {
            return Err(Diagnostic::error("only one of 'only' or 'except' may be specified")
                .with_subject(subject));
        }
        Ok(())
    }
}

/// A `provisioner` block, or the error-cleanup provisioner.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionerBlock {
    /// Plugin type.
    pub ptype: String,
    /// Optional display name.
    pub pname: Option<String>,
    /// Configuration attributes.
    pub body: Body,
    /// Source filter.
    pub only_except: OnlyExcept,
    /// Sleep before running.
    pub pause_before: Option<Duration>,
    /// Upper bound on one run.
    pub timeout: Option<Duration>,
    /// Extra attempts after a failure.
    pub max_retries: u32,
    /// Per-source attribute overrides, keyed by source usage name.
    pub overrides: BTreeMap<String, Body>,
    /// Location in the configuration.
    pub range: Option<SourceRange>,
}

impl ProvisionerBlock {
    /// Creates a provisioner block without decorators.
    #[must_use]
    pub fn new(ptype: impl Into<String>, body: Body) -> Self {
        Self {
            ptype: ptype.into(),
            pname: None,
            body,
            only_except: OnlyExcept::default(),
            pause_before: None,
            timeout: None,
            max_retries: 0,
            overrides: BTreeMap::new(),
            range: None,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.pname = Some(name.into());
        self
    }

    /// Sets the source filter.
    #[must_use]
    pub fn with_only_except(mut self, only_except: OnlyExcept) -> Self {
        self.only_except = only_except;
        self
    }

    /// Sets the pause before running.
    #[must_use]
    pub fn with_pause_before(mut self, pause: Duration) -> Self {
        self.pause_before = Some(pause);
        self
    }

    /// Sets the run timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Adds an override for one source usage.
    #[must_use]
    pub fn with_override(mut self, source_name: impl Into<String>, body: Body) -> Self {
        self.overrides.insert(source_name.into(), body);
        self
    }

    /// Name shown in output: the display name if set, else the type.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.pname.as_deref().unwrap_or(&self.ptype)
    }
}

/// A `post-processor` block.
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessorBlock {
    /// Plugin type.
    pub ptype: String,
    /// Optional display name.
    pub pname: Option<String>,
    /// Configuration attributes.
    pub body: Body,
    /// Source filter.
    pub only_except: OnlyExcept,
    /// User choice to keep the input artifact; unset defers to the plugin.
    pub keep_input_artifact: Option<bool>,
    /// Location in the configuration.
    pub range: Option<SourceRange>,
}

impl PostProcessorBlock {
    /// Creates a post-processor block.
    #[must_use]
    pub fn new(ptype: impl Into<String>, body: Body) -> Self {
        Self {
            ptype: ptype.into(),
            pname: None,
            body,
            only_except: OnlyExcept::default(),
            keep_input_artifact: None,
            range: None,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.pname = Some(name.into());
        self
    }

    /// Sets the source filter.
    #[must_use]
    pub fn with_only_except(mut self, only_except: OnlyExcept) -> Self {
        self.only_except = only_except;
        self
    }

    /// Sets `keep_input_artifact`.
    #[must_use]
    pub fn with_keep_input_artifact(mut self, keep: bool) -> Self {
        self.keep_input_artifact = Some(keep);
        self
    }

    /// Name used for filtering and output: the display name if set, else the type.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.pname.as_deref().unwrap_or(&self.ptype)
    }
}

/// A `build` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildBlock {
    /// Optional build name, prefixed to job names.
    pub name: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
    /// Sources built by this block.
    pub sources: Vec<SourceUsage>,
    /// Provisioners run in order on every job.
    pub provisioners: Vec<ProvisionerBlock>,
    /// Provisioner run when provisioning fails.
    pub error_cleanup_provisioner: Option<ProvisionerBlock>,
    /// Post-processor pipelines.
    pub post_processors: Vec<Vec<PostProcessorBlock>>,
    /// Location in the configuration.
    pub range: Option<SourceRange>,
}

impl BuildBlock {
    /// Creates an unnamed build block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the build name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds a source usage.
    #[must_use]
    pub fn with_source(mut self, usage: SourceUsage) -> Self {
        self.sources.push(usage);
        self
    }

    /// Adds a provisioner.
    #[must_use]
    pub fn with_provisioner(mut self, provisioner: ProvisionerBlock) -> Self {
        self.provisioners.push(provisioner);
        self
    }

    /// Sets the error-cleanup provisioner.
    #[must_use]
    pub fn with_error_cleanup_provisioner(mut self, provisioner: ProvisionerBlock) -> Self {
        self.error_cleanup_provisioner = Some(provisioner);
        self
    }

    /// Adds a post-processor pipeline.
    #[must_use]
    pub fn with_post_processors(mut self, pipeline: Vec<PostProcessorBlock>) -> Self {
        self.post_processors.push(pipeline);
        self
    }

    /// Job name for `usage`: `<build>.<usage>` when named, else `<usage>`.
    #[must_use]
    pub fn job_name(&self, usage: &SourceUsage) -> String {
        match &self.name {
            Some(build) if !build.is_empty() => format!("{build}.{usage}"),
            _ => usage.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_datasource_dependencies_dedup() {
        let block = DatasourceBlock::new(
            "http",
            "b",
            Body::new()
                .with("url", Expr::reference("data.http.a.body"))
                .with("alt", Expr::reference("data.http.a.status"))
                .with("region", Expr::reference("var.region")),
        );
        assert_eq!(block.dependencies(), vec![DatasourceRef::new("http", "a")]);
        assert!(!block.is_resolved());
    }

    #[test]
    fn test_source_usage_naming() {
        let usage = SourceUsage::new(SourceRef::new("docker", "base")).with_name("ubuntu");
        assert_eq!(usage.name(), "ubuntu");
        assert_eq!(usage.to_string(), "docker.ubuntu");
        assert_eq!(usage.builder_variables()["kiln_builder_type"], "docker");

        let named = BuildBlock::new().with_name("web");
        assert_eq!(named.job_name(&usage), "web.docker.ubuntu");
        assert_eq!(BuildBlock::new().job_name(&usage), "docker.ubuntu");
    }

    #[test]
    fn test_only_except_exact_match() {
        let only = OnlyExcept {
            only: vec!["docker.a".into()],
            except: vec![],
        };
        assert!(!only.skip("docker.a"));
        assert!(only.skip("docker.ab"));

        let except = OnlyExcept {
            only: vec![],
            except: vec!["docker.a".into()],
        };
        assert!(except.skip("docker.a"));
        assert!(!except.skip("docker.b"));
    }

    #[test]
    fn test_only_except_both_set_is_error() {
        let both = OnlyExcept {
            only: vec!["a".into()],
            except: vec!["b".into()],
        };
        assert!(both.validate(None).is_err());
        assert!(OnlyExcept::default().validate(None).is_ok());
    }

    #[test]
    fn test_variable_records_type() {
        let var = Variable::new("tags", json!(["a"])).with_expr(Expr::lit(json!(["a"])));
        assert_eq!(var.value_type, ValueType::List);
        assert!(var.is_static_default());
        assert!(!Variable::new("x", json!(1))
            .with_expr(Expr::reference("var.y"))
            .is_static_default());
    }
}
