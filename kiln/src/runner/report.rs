//! Per-job state and the outcome of a run.

use crate::diagnostics::Diagnostics;
use crate::errors::BuildError;
use crate::plugin::Artifact;
use crate::utils::format_duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle state of one job within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be dispatched.
    Pending,
    /// Holding a slot, about to run.
    Dispatched,
    /// Running.
    Running,
    /// Finished without error.
    Succeeded,
    /// Finished with an error, or never got to run.
    Failed,
    /// The registry reported the build as already done.
    Skipped,
}

impl JobState {
    /// Returns true for states a job cannot leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Job name.
    pub job: String,
    /// Error message.
    pub error: String,
    /// Failure category: `builder`, `post_processing`, `registry`, ...
    pub kind: String,
}

impl JobFailure {
    /// Creates a failure record.
    #[must_use]
    pub fn new(job: impl Into<String>, error: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            error: error.into(),
            kind: kind.into(),
        }
    }

    /// Creates a record from a job's own error.
    #[must_use]
    pub fn from_build_error(job: impl Into<String>, error: &BuildError) -> Self {
        let kind = error.to_dict()["kind"].as_str().unwrap_or("builder").to_string();
        Self::new(job, error.to_string(), kind)
    }
}

/// Everything a run produced.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Diagnostics raised while running, in order.
    pub diagnostics: Diagnostics,
    /// Artifacts of successful jobs.
    pub artifacts: BTreeMap<String, Vec<Arc<dyn Artifact>>>,
    /// Failures by job name.
    pub failures: BTreeMap<String, JobFailure>,
    /// Final state of every job.
    pub states: BTreeMap<String, JobState>,
    /// Whether the run was interrupted.
    pub cancelled: bool,
    /// Wall-clock time of the run.
    pub duration: Duration,
}

impl RunReport {
    /// A report carrying only `diagnostics`.
    #[must_use]
    pub fn from_diagnostics(diagnostics: Diagnostics) -> Self {
        Self {
            diagnostics,
            ..Self::default()
        }
    }

    /// Returns true if anything went wrong.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.cancelled || !self.failures.is_empty() || self.diagnostics.has_errors()
    }

    /// Process exit code for the run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(self.has_failures())
    }

    /// Jobs in `state`.
    #[must_use]
    pub fn jobs_in(&self, state: JobState) -> Vec<&str> {
        self.states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Converts to a JSON summary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        let mut state_counts: BTreeMap<String, usize> = BTreeMap::new();
        for state in self.states.values() {
            *state_counts.entry(state.to_string()).or_insert(0) += 1;
        }
        let artifacts: BTreeMap<&str, Vec<String>> = self
            .artifacts
            .iter()
            .map(|(name, list)| (name.as_str(), list.iter().map(|a| a.id()).collect()))
            .collect();

        json!({
            "status": if self.cancelled {
                "cancelled"
            } else if self.has_failures() {
                "failed"
            } else {
                "completed"
            },
            "duration": format_duration(self.duration),
            "duration_ms": self.duration.as_secs_f64() * 1000.0,
            "states": self.states,
            "state_counts": state_counts,
            "failures": self.failures.values().collect::<Vec<_>>(),
            "artifacts": artifacts,
            "diagnostics": self.diagnostics.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostic;
    use crate::testing::MockArtifact;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exit_code() {
        assert_eq!(RunReport::default().exit_code(), 0);
        let report = RunReport::from_diagnostics(Diagnostics::from(Diagnostic::error("x")));
        assert_eq!(report.exit_code(), 1);
        let warned = RunReport::from_diagnostics(Diagnostics::from(Diagnostic::warning("x")));
        assert_eq!(warned.exit_code(), 0);
    }

    #[test]
    fn test_failure_from_build_error() {
        let failure = JobFailure::from_build_error("docker.a", &BuildError::Cancelled);
        assert_eq!(failure.kind, "cancelled");
        assert_eq!(failure.error, "Build was cancelled");
    }

    #[test]
    fn test_to_dict() {
        let mut report = RunReport::default();
        report.states.insert("a".into(), JobState::Succeeded);
        report.states.insert("b".into(), JobState::Failed);
        report
            .artifacts
            .insert("a".into(), vec![Arc::new(MockArtifact::new("img"))]);
        report
            .failures
            .insert("b".into(), JobFailure::new("b", "boom", "builder"));

        let dict = report.to_dict();
        assert_eq!(dict["status"], "failed");
        assert_eq!(dict["states"]["b"], "failed");
        assert_eq!(dict["state_counts"]["succeeded"], 1);
        assert_eq!(dict["artifacts"]["a"][0], "img");
        assert_eq!(dict["failures"][0]["error"], "boom");
        assert_eq!(report.jobs_in(JobState::Failed), vec!["b"]);
    }
}
