//! Schedulers drive a configuration through evaluation into build jobs.
//!
//! Two configuration formats are supported: an evaluated block graph
//! ([`HclScheduler`]) and legacy JSON templates ([`LegacyScheduler`]). Both
//! implement [`ConfigScheduler`]; [`SequentialScheduler`] runs the phases in
//! order and hands the jobs to the concurrent runner.

mod hcl;
mod legacy;
mod sequential;

pub use hcl::HclScheduler;
pub use legacy::{LegacyScheduler, LegacyTemplate};
pub use sequential::{Configuration, SequentialScheduler};

use crate::cancellation::CancellationToken;
use crate::diagnostics::Diagnostics;
use crate::options::SchedulerOptions;
use crate::plan::BuildJob;
use async_trait::async_trait;

/// Evaluation phases of one configuration, called in declaration order.
#[async_trait]
pub trait ConfigScheduler: Send {
    /// Resolves data sources.
    async fn evaluate_datasources(&mut self, cancel: &CancellationToken) -> Diagnostics;

    /// Evaluates input variables and locals.
    fn evaluate_variables(&mut self) -> Diagnostics;

    /// Validates build blocks against the graph and the plugins.
    fn evaluate_builds(&mut self) -> Diagnostics;

    /// Starts and prepares the selected jobs.
    fn get_builds(&mut self) -> (Vec<BuildJob>, Diagnostics);

    /// Options in effect.
    fn options(&self) -> &SchedulerOptions;

    /// Mutable options, for callers that adjust them between phases.
    fn options_mut(&mut self) -> &mut SchedulerOptions;
}
