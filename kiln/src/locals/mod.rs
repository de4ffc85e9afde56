//! Local value evaluation.

mod evaluator;

pub use evaluator::LocalEvaluator;
