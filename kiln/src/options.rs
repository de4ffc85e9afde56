//! Run options shared by the schedulers and the runner.

use crate::errors::KilnError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a builder should do when a job fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnError {
    /// Tear down everything the build created.
    #[default]
    Cleanup,
    /// Leave resources in place and stop.
    Abort,
    /// Ask the user interactively.
    Ask,
    /// Run the error-cleanup provisioner, then clean up.
    RunCleanupProvisioner,
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cleanup => "cleanup",
            Self::Abort => "abort",
            Self::Ask => "ask",
            Self::RunCleanupProvisioner => "run-cleanup-provisioner",
        };
        f.write_str(s)
    }
}

/// Options controlling which jobs run and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerOptions {
    /// Glob patterns; when non-empty only matching jobs run.
    #[serde(default)]
    pub only: Vec<String>,
    /// Glob patterns of jobs (and post-processors) to skip.
    #[serde(default)]
    pub except: Vec<String>,
    /// Debug mode: jobs run one at a time.
    #[serde(default)]
    pub debug: bool,
    /// Overwrite existing artifacts.
    #[serde(default)]
    pub force: bool,
    /// Maximum simultaneously running jobs; zero or negative means unbounded.
    #[serde(default)]
    pub parallel_builds: i64,
    /// Failure policy handed to builders.
    #[serde(default)]
    pub on_error: OnError,
    /// Colour per-job output.
    #[serde(default = "default_color")]
    pub color: bool,
    /// Prefix output lines with timestamps.
    #[serde(default)]
    pub timestamp_ui: bool,
    /// Emit machine-readable records instead of text.
    #[serde(default)]
    pub machine_readable: bool,
    /// Attach placeholder values instead of executing data sources.
    #[serde(default)]
    pub skip_datasources_execution: bool,
}

fn default_color() -> bool {
    true
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            only: Vec::new(),
            except: Vec::new(),
            debug: false,
            force: false,
            parallel_builds: 0,
            on_error: OnError::default(),
            color: default_color(),
            timestamp_ui: false,
            machine_readable: false,
            skip_datasources_execution: false,
        }
    }
}

impl SchedulerOptions {
    /// Creates options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from JSON, applying defaults for missing fields.
    pub fn from_json_str(json: &str) -> Result<Self, KilnError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Sets the `only` patterns.
    #[must_use]
    pub fn with_only<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the `except` patterns.
    #[must_use]
    pub fn with_except<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.except = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets debug mode.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Sets force mode.
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Sets the parallelism limit.
    #[must_use]
    pub fn with_parallel_builds(mut self, limit: i64) -> Self {
        self.parallel_builds = limit;
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    /// Enables or disables colour.
    #[must_use]
    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    /// Enables timestamped output.
    #[must_use]
    pub fn with_timestamp_ui(mut self, timestamp: bool) -> Self {
        self.timestamp_ui = timestamp;
        self
    }

    /// Enables machine-readable output.
    #[must_use]
    pub fn with_machine_readable(mut self, machine: bool) -> Self {
        self.machine_readable = machine;
        self
    }

    /// Skips data source execution.
    #[must_use]
    pub fn with_skip_datasources_execution(mut self, skip: bool) -> Self {
        self.skip_datasources_execution = skip;
        self
    }

    /// Number of jobs allowed to run at once.
    #[must_use]
    pub fn effective_parallelism(&self) -> usize {
        if self.debug {
            return 1;
        }
        match usize::try_from(self.parallel_builds) {
            Ok(0) | Err(_) => tokio::sync::Semaphore::MAX_PERMITS,
            Ok(n) => n.min(tokio::sync::Semaphore::MAX_PERMITS),
        }
    }

    /// Returns true when jobs must be awaited one at a time.
    #[must_use]
    pub fn is_serial(&self) -> bool {
        self.debug || self.parallel_builds == 1
    }

    /// Checks option combinations.
    pub fn validate(&self) -> Result<(), KilnError> {
        if self.machine_readable && self.timestamp_ui {
            return Err(KilnError::InvalidOptions(
                "timestamped output cannot be combined with machine-readable output".to_string(),
            ));
        }
        if self.only.iter().chain(&self.except).any(String::is_empty) {
            return Err(KilnError::InvalidOptions(
                "empty 'only'/'except' pattern".to_string(),
            ));
        }
        Ok(())
    }
}
