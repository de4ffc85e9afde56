//! Build plan construction.
//!
//! The plan builder turns evaluated `build` blocks into prepared
//! [`BuildJob`]s: one per admitted source usage, with started plugins,
//! decorated provisioners and post-processor pipelines.

mod builder;
mod filter;
mod job;

pub use builder::{BuildPlanBuilder, JobNaming, BUILDER_DATA_KEYS};
pub use filter::{Glob, JobFilter};
pub use job::{BuildJob, CoreBuildPostProcessor};
