//! Build registries.
//!
//! A registry is told about the iteration being built and about each job's
//! start and completion. It can veto a job that an earlier run already
//! completed.

mod memory;

pub use memory::{iteration_fingerprint, BuildState, MemoryRegistry};

use crate::cancellation::CancellationToken;
use crate::errors::{BuildError, RegistryError};
use crate::plugin::Artifact;
use crate::ui::Ui;
use async_trait::async_trait;
use std::sync::Arc;

/// Tracks builds of one iteration.
#[async_trait]
pub trait BuildRegistry: Send + Sync {
    /// Prepares the iteration for the jobs about to run.
    async fn populate_iteration(
        &self,
        cancel: &CancellationToken,
        builds: &[String],
    ) -> Result<(), RegistryError>;

    /// Called before a job runs. [`RegistryError::AlreadyDone`] skips it.
    async fn start_build(&self, cancel: &CancellationToken, build: &str) -> Result<(), RegistryError>;

    /// Called after a job ran, successfully or not. Returns the artifacts to
    /// report for the job.
    async fn complete_build(
        &self,
        cancel: &CancellationToken,
        build: &str,
        artifacts: Vec<Arc<dyn Artifact>>,
        error: Option<&BuildError>,
    ) -> Result<Vec<Arc<dyn Artifact>>, RegistryError>;

    /// Writes a summary of the iteration.
    fn iteration_status_summary(&self, ui: &dyn Ui);
}

/// A registry that tracks nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRegistry;

#[async_trait]
impl BuildRegistry for NullRegistry {
    async fn populate_iteration(
        &self,
        _cancel: &CancellationToken,
        _builds: &[String],
    ) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn start_build(&self, _cancel: &CancellationToken, _build: &str) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn complete_build(
        &self,
        _cancel: &CancellationToken,
        _build: &str,
        artifacts: Vec<Arc<dyn Artifact>>,
        _error: Option<&BuildError>,
    ) -> Result<Vec<Arc<dyn Artifact>>, RegistryError> {
        Ok(artifacts)
    }

    fn iteration_status_summary(&self, _ui: &dyn Ui) {}
}
