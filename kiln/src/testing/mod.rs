//! Testing utilities for kiln.
//!
//! This module provides:
//! - Mock builders, provisioners, post-processors and data sources
//! - A UI that records every line it is given
//! - A ready-made [`PluginSet`](crate::plugin::PluginSet) of mocks

mod mocks;
mod ui;

pub use mocks::{
    mock_plugins, ConcurrencyProbe, MockArtifact, MockBuilder, MockDatasource, MockPostProcessor,
    MockProvisioner,
};
pub use ui::{CollectingUi, SharedBuffer, UiLine};
