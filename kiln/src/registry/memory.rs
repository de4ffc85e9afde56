//! In-process build registry.

use super::BuildRegistry;
use crate::cancellation::CancellationToken;
use crate::errors::{BuildError, RegistryError};
use crate::plugin::Artifact;
use crate::ui::Ui;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Registry-side state of one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    /// Known to the iteration, not started.
    Pending,
    /// Started and not yet completed.
    Running,
    /// Completed successfully.
    Done,
    /// Completed with an error.
    Failed,
}

/// Tracks build states in memory.
///
/// Builds completed by an earlier run can be seeded with
/// [`with_completed`](Self::with_completed); starting them again reports
/// [`RegistryError::AlreadyDone`].
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    builds: DashMap<String, BuildState>,
    artifacts: DashMap<String, Vec<String>>,
    fingerprint: RwLock<Option<String>>,
}

/// SHA-256 of the sorted build names, hex encoded.
#[must_use]
pub fn iteration_fingerprint(builds: &[String]) -> String {
    let mut names: Vec<&str> = builds.iter().map(String::as_str).collect();
    names.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(names.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

impl MemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `builds` as already completed.
    #[must_use]
    pub fn with_completed<I, S>(self, builds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for build in builds {
            self.builds.insert(build.into(), BuildState::Done);
        }
        self
    }

    /// State of `build`, if the registry knows it.
    #[must_use]
    pub fn state(&self, build: &str) -> Option<BuildState> {
        self.builds.get(build).map(|s| *s)
    }

    /// Artifact ids recorded for `build`.
    #[must_use]
    pub fn artifacts(&self, build: &str) -> Vec<String> {
        self.artifacts.get(build).map(|a| a.clone()).unwrap_or_default()
    }

    /// Fingerprint of the populated iteration.
    #[must_use]
    pub fn fingerprint(&self) -> Option<String> {
        self.fingerprint.read().clone()
    }

    fn count(&self, state: BuildState) -> usize {
        self.builds.iter().filter(|e| *e.value() == state).count()
    }
}

#[async_trait]
impl BuildRegistry for MemoryRegistry {
    async fn populate_iteration(
        &self,
        cancel: &CancellationToken,
        builds: &[String],
    ) -> Result<(), RegistryError> {
        if cancel.is_cancelled() {
            return Err(RegistryError::Iteration("run was cancelled".to_string()));
        }
        let fingerprint = iteration_fingerprint(builds);
        info!(fingerprint = %fingerprint, builds = builds.len(), "Populating iteration");
        for build in builds {
            self.builds.entry(build.clone()).or_insert(BuildState::Pending);
        }
        *self.fingerprint.write() = Some(fingerprint);
        Ok(())
    }

    async fn start_build(&self, _cancel: &CancellationToken, build: &str) -> Result<(), RegistryError> {
        let mut state = self.builds.entry(build.to_string()).or_insert(BuildState::Pending);
        match *state {
            BuildState::Done => Err(RegistryError::AlreadyDone {
                build: build.to_string(),
            }),
            BuildState::Running => Err(RegistryError::Request(format!(
                "build {build:?} is already running"
            ))),
            BuildState::Pending | BuildState::Failed => {
                *state = BuildState::Running;
                debug!(build, "Build started");
                Ok(())
            }
        }
    }

    async fn complete_build(
        &self,
        _cancel: &CancellationToken,
        build: &str,
        artifacts: Vec<Arc<dyn Artifact>>,
        error: Option<&BuildError>,
    ) -> Result<Vec<Arc<dyn Artifact>>, RegistryError> {
        let state = if error.is_some() {
            BuildState::Failed
        } else {
            BuildState::Done
        };
        self.builds.insert(build.to_string(), state);
        self.artifacts
            .insert(build.to_string(), artifacts.iter().map(|a| a.id()).collect());
        debug!(build, state = ?state, artifacts = artifacts.len(), "Build completed");
        Ok(artifacts)
    }

    fn iteration_status_summary(&self, ui: &dyn Ui) {
        let Some(fingerprint) = self.fingerprint() else {
            return;
        };
        ui.say(&format!(
            "Iteration {fingerprint}: {} done, {} failed, {} pending",
            self.count(BuildState::Done),
            self.count(BuildState::Failed),
            self.count(BuildState::Pending) + self.count(BuildState::Running),
        ));
    }
}
