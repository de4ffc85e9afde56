//! Data source resolution.

mod resolver;

pub use resolver::{DatasourceResolver, MAX_DATASOURCE_DEPTH, UNKNOWN_VALUE};
