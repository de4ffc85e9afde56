//! Fixed-point evaluation of locals.
//!
//! Locals may reference each other in any order. Each pass evaluates every
//! local whose references are already available; passes repeat until one
//! makes no progress. Whatever is left is evaluated once more purely to
//! report its errors.

use crate::config::{BlockContext, ConfigGraph, LocalBlock, Variable};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::errors::EvalError;
use crate::redact::RedactionRegistry;
use std::collections::BTreeSet;
use tracing::debug;

/// Evaluates the locals of one graph.
pub struct LocalEvaluator<'a> {
    graph: &'a mut ConfigGraph,
    redactor: &'a RedactionRegistry,
}

impl<'a> LocalEvaluator<'a> {
    /// Creates an evaluator that registers sensitive values with `redactor`.
    #[must_use]
    pub fn new(graph: &'a mut ConfigGraph, redactor: &'a RedactionRegistry) -> Self {
        Self { graph, redactor }
    }

    /// Evaluates every local, returning problems as diagnostics.
    ///
    /// Sensitive input variables are registered for redaction first, so
    /// their values are scrubbed even if a local fails.
    pub fn evaluate(mut self) -> Diagnostics {
        let mut diags = self.check_duplicates();
        if diags.has_errors() {
            return diags;
        }

        for variable in self.graph.variables().values().filter(|v| v.sensitive) {
            self.redactor.register_value(&variable.value);
        }

        let mut pending: Vec<LocalBlock> = self
            .graph
            .local_blocks()
            .iter()
            .filter(|local| !self.graph.locals().contains_key(&local.name))
            .cloned()
            .collect();

        let mut pass = 0;
        loop {
            pass += 1;
            let before = pending.len();
            pending.retain(|local| self.evaluate_one(local).is_err());
            debug!(
                pass,
                resolved = before - pending.len(),
                remaining = pending.len(),
                "Local evaluation pass"
            );
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }

        for local in &pending {
            if let Err(e) = self.evaluate_one(local) {
                diags.push(e.to_diagnostic(local.range.clone()));
            }
        }
        diags
    }

    fn check_duplicates(&self) -> Diagnostics {
        let mut seen = BTreeSet::new();
        self.graph
            .local_blocks()
            .iter()
            .filter(|local| !seen.insert(local.name.as_str()))
            .map(|local| {
                Diagnostic::error("Duplicate local definition")
                    .with_detail(format!("Duplicate {} definition found.", local.name))
                    .with_subject(local.range.clone())
            })
            .collect()
    }

    fn evaluate_one(&mut self, local: &LocalBlock) -> Result<(), EvalError> {
        let ctx = self.graph.eval_context(BlockContext::Local);
        let value = local.expr.evaluate(&ctx)?;
        if local.sensitive {
            self.redactor.register_value(&value);
        }
        self.graph.insert_local(
            Variable::new(local.name.clone(), value)
                .with_sensitive(local.sensitive)
                .with_expr(local.expr.clone()),
        );
        Ok(())
    }
}
