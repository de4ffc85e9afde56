//! Configuration model.
//!
//! A parser (outside this crate) produces a [`ConfigGraph`] of blocks whose
//! attributes are unevaluated [`Expr`]s. Evaluation phases fill in data
//! source values and locals, and the plan builder turns build blocks into
//! jobs.

mod blocks;
mod expr;
pub mod functions;
mod graph;

pub use blocks::{
    BlockKind, BuildBlock, DatasourceBlock, DatasourceRef, LocalBlock, OnlyExcept,
    PostProcessorBlock, ProvisionerBlock, SourceBlock, SourceRef, SourceUsage, ValueOrigin,
    Variable,
};
pub use expr::{
    Body, EvalContext, Expr, Traversal, ValueType, BUILD_NAMESPACE, DATA_NAMESPACE,
    LOCAL_NAMESPACE, SOURCE_NAMESPACE, VAR_NAMESPACE,
};
pub use graph::{BlockContext, ConfigGraph};
