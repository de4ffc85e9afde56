//! Error types for kiln.
//!
//! Configuration problems surface as [`Diagnostics`](crate::diagnostics::Diagnostics);
//! the types here cover failures of individual operations (evaluation,
//! plugin start, job execution, registry calls) and the crate-level
//! [`KilnError`] that wraps them.

use crate::diagnostics::{Diagnostic, Diagnostics, SourceRange};
use serde_json::json;
use thiserror::Error;

/// The main error type for kiln operations.
#[derive(Debug, Error)]
pub enum KilnError {
    /// Expression evaluation failed.
    #[error("{0}")]
    Eval(#[from] EvalError),

    /// A plugin could not be started.
    #[error("{0}")]
    Plugin(#[from] PluginError),

    /// A build job failed.
    #[error("{0}")]
    Build(#[from] BuildError),

    /// The build registry rejected a call.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// A glob filter pattern is malformed.
    #[error("{0}")]
    Glob(#[from] GlobError),

    /// A legacy JSON template is malformed.
    #[error("Invalid template: {0}")]
    Template(String),

    /// Scheduler options failed validation.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Configuration evaluation produced error diagnostics.
    #[error("{}", .0)]
    Diagnostics(Diagnostics),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Diagnostics> for KilnError {
    fn from(diagnostics: Diagnostics) -> Self {
        Self::Diagnostics(diagnostics)
    }
}

/// Failure to evaluate a configuration expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// A traversal names a variable, local or data source that does not exist
    /// (or has not been resolved yet).
    #[error("Reference to undeclared or unresolved value {reference:?}")]
    UnknownReference {
        /// Dotted form of the traversal.
        reference: String,
    },

    /// The referenced object exists but lacks the requested attribute.
    #[error("Value {reference:?} does not have an attribute named {attribute:?}")]
    UnknownAttribute {
        /// Dotted form of the object reached so far.
        reference: String,
        /// Missing attribute name.
        attribute: String,
    },

    /// A function call names an unknown builtin.
    #[error("There is no function named {name:?}")]
    UnknownFunction {
        /// Function name.
        name: String,
    },

    /// A value had the wrong type for where it was used.
    #[error("Invalid value for {context}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Where the value was used.
        context: String,
        /// Expected type.
        expected: &'static str,
        /// Actual type.
        found: String,
    },

    /// A builtin was called with the wrong arguments.
    #[error("Invalid arguments to {function}(): {message}")]
    InvalidArguments {
        /// Function name.
        function: String,
        /// What was wrong.
        message: String,
    },
}

impl EvalError {
    /// Short summary used when reporting this error as a diagnostic.
    #[must_use]
    pub fn summary(&self) -> &'static str {
        match self {
            Self::UnknownReference { .. } => "Unknown reference",
            Self::UnknownAttribute { .. } => "Unsupported attribute",
            Self::UnknownFunction { .. } => "Call to unknown function",
            Self::TypeMismatch { .. } => "Invalid value type",
            Self::InvalidArguments { .. } => "Invalid function argument",
        }
    }

    /// Converts to an error diagnostic located at `subject`.
    #[must_use]
    pub fn to_diagnostic(&self, subject: Option<SourceRange>) -> Diagnostic {
        Diagnostic::error(self.summary())
            .with_detail(self.to_string())
            .with_subject(subject)
    }

    /// Returns true if the error is caused by a value that does not exist yet.
    #[must_use]
    pub fn is_unresolved_reference(&self) -> bool {
        matches!(self, Self::UnknownReference { .. })
    }
}

/// Failure to start a plugin instance.
#[derive(Debug, Error)]
pub enum PluginError {
    /// No factory is registered for the type.
    #[error("Unknown {kind} type {ty:?}")]
    Unknown {
        /// Plugin kind (builder, provisioner, ...).
        kind: &'static str,
        /// Requested type name.
        ty: String,
    },

    /// The factory returned an error.
    #[error("Failed to start {kind} {ty:?}: {message}")]
    Start {
        /// Plugin kind.
        kind: &'static str,
        /// Requested type name.
        ty: String,
        /// Factory error.
        message: String,
    },
}

/// Failure of a single build job.
#[derive(Debug, Error)]
pub enum BuildError {
    /// `run` was called before the plan builder prepared the job.
    #[error("Build {job:?} was run before being prepared")]
    NotPrepared {
        /// Job name.
        job: String,
    },

    /// The builder plugin (or a provisioner it hooked) failed.
    #[error("{0}")]
    Builder(anyhow::Error),

    /// The job observed run cancellation.
    #[error("Build was cancelled")]
    Cancelled,

    /// One or more post-processing steps failed.
    #[error("{} error(s) occurred:\n\n* {}", .errors.len(), .errors.join("\n* "))]
    PostProcessing {
        /// Messages of each failed step, in order.
        errors: Vec<String>,
    },
}

impl BuildError {
    /// Converts to a JSON representation for machine-readable summaries.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        let kind = match self {
            Self::NotPrepared { .. } => "not_prepared",
            Self::Builder(_) => "builder",
            Self::Cancelled => "cancelled",
            Self::PostProcessing { .. } => "post_processing",
        };
        json!({ "kind": kind, "message": self.to_string() })
    }
}

/// Failure reported by a build registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The build already completed in an earlier run.
    #[error("build {build:?} is already done")]
    AlreadyDone {
        /// Job name.
        build: String,
    },

    /// The registry could not prepare its iteration.
    #[error("iteration setup failed: {0}")]
    Iteration(String),

    /// Any other registry failure.
    #[error("{0}")]
    Request(String),
}

/// Malformed `only`/`except` pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GlobError {
    /// A `[` or `{` group was never closed.
    #[error("unexpected end of pattern: unclosed {open:?}")]
    Unclosed {
        /// The opening character.
        open: char,
    },

    /// A trailing escape character.
    #[error("pattern ends with an unterminated escape")]
    TrailingEscape,

    /// The translated pattern was rejected by the regex engine.
    #[error("{0}")]
    Regex(String),
}
