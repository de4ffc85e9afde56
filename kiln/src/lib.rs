//! # Kiln
//!
//! Configuration evaluation and build execution for machine-image builds.
//!
//! Kiln takes a parsed configuration and drives it to finished artifacts:
//!
//! - **Data sources**: resolved in dependency order, each executed once
//! - **Locals**: evaluated to a fixed point, sensitive values redacted
//! - **Build plans**: build blocks become prepared jobs, filtered by
//!   `only`/`except` globs
//! - **Concurrent runs**: jobs run under a parallelism bound with isolated
//!   failures and run-wide cancellation
//! - **Retries**: provisioners and plugins retry with timeouts and backoff
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kiln::prelude::*;
//!
//! let report = SequentialScheduler::new(
//!     Configuration::Graph(graph),
//!     Arc::new(plugins),
//!     SchedulerOptions::new().with_parallel_builds(2),
//!     Arc::new(RedactionRegistry::new()),
//! )
//! .run()
//! .await;
//!
//! std::process::exit(report.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod datasource;
pub mod diagnostics;
pub mod errors;
pub mod locals;
pub mod observability;
pub mod options;
pub mod plan;
pub mod plugin;
pub mod provision;
pub mod redact;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod testing;
pub mod ui;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        Body, BuildBlock, ConfigGraph, DatasourceBlock, Expr, LocalBlock, OnlyExcept,
        PostProcessorBlock, ProvisionerBlock, SourceBlock, SourceRef, SourceUsage, Variable,
    };
    pub use crate::diagnostics::{Diagnostic, Diagnostics, Severity, SourceRange};
    pub use crate::errors::{BuildError, EvalError, KilnError, PluginError, RegistryError};
    pub use crate::observability::{init_logging, LogConfig};
    pub use crate::options::{OnError, SchedulerOptions};
    pub use crate::plan::{BuildJob, BuildPlanBuilder, JobFilter};
    pub use crate::plugin::{
        Artifact, Builder, Datasource, Hook, PluginRegistry, PluginSet, PostProcessor,
        Provisioner, Variables,
    };
    pub use crate::redact::RedactionRegistry;
    pub use crate::registry::{BuildRegistry, MemoryRegistry, NullRegistry};
    pub use crate::retry::{RetryError, RetryPolicy};
    pub use crate::runner::{ConcurrentRunner, JobState, RunReport};
    pub use crate::scheduler::{
        ConfigScheduler, Configuration, LegacyTemplate, SequentialScheduler,
    };
    pub use crate::ui::{BasicUi, MachineReadableUi, Ui};
}
