//! Type-name keyed plugin factories.

use super::{Builder, Datasource, PostProcessor, Provisioner};
use crate::errors::PluginError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

type Factory<P> = Arc<dyn Fn() -> anyhow::Result<Box<P>> + Send + Sync>;

/// Starts fresh plugin instances by type name.
pub struct PluginRegistry<P: ?Sized> {
    kind: &'static str,
    factories: BTreeMap<String, Factory<P>>,
}

impl<P: ?Sized> PluginRegistry<P> {
    /// Creates an empty registry for plugins of `kind`.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: BTreeMap::new(),
        }
    }

    /// Registers a factory for `ty`, replacing any previous one.
    pub fn register<F>(&mut self, ty: impl Into<String>, factory: F)
    where
        F: Fn() -> anyhow::Result<Box<P>> + Send + Sync + 'static,
    {
        self.factories.insert(ty.into(), Arc::new(factory));
    }

    /// Chainable [`register`](Self::register).
    #[must_use]
    pub fn with<F>(mut self, ty: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Box<P>> + Send + Sync + 'static,
    {
        self.register(ty, factory);
        self
    }

    /// Returns true if `ty` is registered.
    #[must_use]
    pub fn has(&self, ty: &str) -> bool {
        self.factories.contains_key(ty)
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Plugin kind this registry holds.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Starts a new instance of `ty`.
    pub fn start(&self, ty: &str) -> Result<Box<P>, PluginError> {
        let factory = self.factories.get(ty).ok_or_else(|| PluginError::Unknown {
            kind: self.kind,
            ty: ty.to_string(),
        })?;
        debug!(kind = self.kind, plugin = ty, "Starting plugin");
        factory().map_err(|e| PluginError::Start {
            kind: self.kind,
            ty: ty.to_string(),
            message: e.to_string(),
        })
    }
}

impl<P: ?Sized> Clone for PluginRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            factories: self.factories.clone(),
        }
    }
}

impl<P: ?Sized> fmt::Debug for PluginRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("kind", &self.kind)
            .field("types", &self.list())
            .finish()
    }
}

/// All plugin registries available to a run.
#[derive(Debug, Clone)]
pub struct PluginSet {
    /// Builder factories.
    pub builders: PluginRegistry<dyn Builder>,
    /// Provisioner factories.
    pub provisioners: PluginRegistry<dyn Provisioner>,
    /// Post-processor factories.
    pub post_processors: PluginRegistry<dyn PostProcessor>,
    /// Data source factories.
    pub datasources: PluginRegistry<dyn Datasource>,
}

impl Default for PluginSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginSet {
    /// Creates a set with empty registries.
    #[must_use]
    pub fn new() -> Self {
        Self {
            builders: PluginRegistry::new("builder"),
            provisioners: PluginRegistry::new("provisioner"),
            post_processors: PluginRegistry::new("post-processor"),
            datasources: PluginRegistry::new("data source"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvisioner;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_start_unknown_type() {
        let registry: PluginRegistry<dyn Provisioner> = PluginRegistry::new("provisioner");
        let err = registry.start("shell").err().unwrap();
        assert_eq!(err.to_string(), "Unknown provisioner type \"shell\"");
    }

    #[test]
    fn test_register_and_list() {
        let registry: PluginRegistry<dyn Provisioner> = PluginRegistry::new("provisioner")
            .with("shell", || Ok(Box::new(MockProvisioner::new()) as Box<dyn Provisioner>))
            .with("file", || Ok(Box::new(MockProvisioner::new()) as Box<dyn Provisioner>));

        assert!(registry.has("shell"));
        assert_eq!(registry.list(), vec!["file", "shell"]);
        assert!(registry.start("file").is_ok());
    }

    #[test]
    fn test_factory_error_is_wrapped() {
        let registry: PluginRegistry<dyn Provisioner> = PluginRegistry::new("provisioner")
            .with("broken", || Err(anyhow::anyhow!("binary not found")));

        let err = registry.start("broken").err().unwrap();
        assert_eq!(
            err.to_string(),
            "Failed to start provisioner \"broken\": binary not found"
        );
    }
}
