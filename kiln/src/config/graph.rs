//! The configuration graph: every parsed block plus the values computed
//! for them during evaluation.

use super::blocks::{
    BlockKind, BuildBlock, DatasourceBlock, DatasourceRef, LocalBlock, SourceBlock, SourceRef,
    Variable,
};
use super::expr::{EvalContext, DATA_NAMESPACE, LOCAL_NAMESPACE, VAR_NAMESPACE};
use crate::diagnostics::{Diagnostic, SourceRange};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Which block family an expression is evaluated for.
///
/// Data sources cannot read locals; locals and builds see everything
/// resolved so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockContext {
    /// Body of a `data` block.
    Datasource,
    /// A local's expression.
    Local,
    /// Source, provisioner and post-processor bodies.
    Build,
}

/// Parsed configuration and evaluation results.
#[derive(Debug, Clone)]
pub struct ConfigGraph {
    core_version: String,
    variables: BTreeMap<String, Variable>,
    local_blocks: Vec<LocalBlock>,
    locals: BTreeMap<String, Variable>,
    datasources: BTreeMap<DatasourceRef, DatasourceBlock>,
    sources: BTreeMap<SourceRef, SourceBlock>,
    builds: Vec<BuildBlock>,
}

impl Default for ConfigGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn duplicate(kind: BlockKind, name: &str, subject: Option<SourceRange>) -> Diagnostic {
    Diagnostic::error(format!("Duplicate {kind} block"))
        .with_detail(format!("Duplicate {name} definition found."))
        .with_subject(subject)
}

impl ConfigGraph {
    /// Creates an empty graph tagged with this crate's version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core_version: env!("CARGO_PKG_VERSION").to_string(),
            variables: BTreeMap::new(),
            local_blocks: Vec::new(),
            locals: BTreeMap::new(),
            datasources: BTreeMap::new(),
            sources: BTreeMap::new(),
            builds: Vec::new(),
        }
    }

    /// Overrides the core version reported to builders.
    #[must_use]
    pub fn with_core_version(mut self, version: impl Into<String>) -> Self {
        self.core_version = version.into();
        self
    }

    /// Core version reported to builders.
    #[must_use]
    pub fn core_version(&self) -> &str {
        &self.core_version
    }

    /// Adds an input variable.
    pub fn add_variable(&mut self, variable: Variable) -> Result<(), Diagnostic> {
        if self.variables.contains_key(&variable.name) {
            return Err(duplicate(BlockKind::Variable, &variable.name, None));
        }
        self.variables.insert(variable.name.clone(), variable);
        Ok(())
    }

    /// Adds a local definition. Duplicates are reported by local evaluation.
    pub fn add_local(&mut self, local: LocalBlock) {
        self.local_blocks.push(local);
    }

    /// Adds a data source.
    pub fn add_datasource(&mut self, block: DatasourceBlock) -> Result<(), Diagnostic> {
        if self.datasources.contains_key(&block.reference) {
            return Err(duplicate(
                BlockKind::Datasource,
                &block.reference.to_string(),
                block.range.clone(),
            ));
        }
        self.datasources.insert(block.reference.clone(), block);
        Ok(())
    }

    /// Adds a source.
    pub fn add_source(&mut self, block: SourceBlock) -> Result<(), Diagnostic> {
        if self.sources.contains_key(&block.reference) {
            return Err(duplicate(
                BlockKind::Source,
                &block.reference.to_string(),
                block.range.clone(),
            ));
        }
        self.sources.insert(block.reference.clone(), block);
        Ok(())
    }

    /// Adds a build block.
    pub fn add_build(&mut self, build: BuildBlock) {
        self.builds.push(build);
    }

    /// Input variables by name.
    #[must_use]
    pub fn variables(&self) -> &BTreeMap<String, Variable> {
        &self.variables
    }

    /// Local definitions as parsed.
    #[must_use]
    pub fn local_blocks(&self) -> &[LocalBlock] {
        &self.local_blocks
    }

    /// Evaluated locals by name.
    #[must_use]
    pub fn locals(&self) -> &BTreeMap<String, Variable> {
        &self.locals
    }

    /// Data sources by identity.
    #[must_use]
    pub fn datasources(&self) -> &BTreeMap<DatasourceRef, DatasourceBlock> {
        &self.datasources
    }

    /// Sources by identity.
    #[must_use]
    pub fn sources(&self) -> &BTreeMap<SourceRef, SourceBlock> {
        &self.sources
    }

    /// Build blocks in declaration order.
    #[must_use]
    pub fn builds(&self) -> &[BuildBlock] {
        &self.builds
    }

    pub(crate) fn set_datasource_value(&mut self, reference: &DatasourceRef, value: Value) {
        if let Some(block) = self.datasources.get_mut(reference) {
            block.set_value(value);
        }
    }

    pub(crate) fn insert_local(&mut self, local: Variable) {
        self.locals.insert(local.name.clone(), local);
    }

    /// Builds the evaluation context for `context`.
    #[must_use]
    pub fn eval_context(&self, context: BlockContext) -> EvalContext {
        let vars: Map<String, Value> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect();

        let mut data = Map::new();
        for (reference, block) in &self.datasources {
            if let Some(value) = block.value() {
                let by_type = data
                    .entry(reference.ty.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(map) = by_type {
                    map.insert(reference.name.clone(), value.clone());
                }
            }
        }

        let mut ctx = EvalContext::new()
            .with_namespace(VAR_NAMESPACE, Value::Object(vars))
            .with_namespace(DATA_NAMESPACE, Value::Object(data));

        if context != BlockContext::Datasource {
            let locals: Map<String, Value> = self
                .locals
                .iter()
                .map(|(k, v)| (k.clone(), v.value.clone()))
                .collect();
            ctx.set_namespace(LOCAL_NAMESPACE, Value::Object(locals));
        }
        ctx
    }
}
