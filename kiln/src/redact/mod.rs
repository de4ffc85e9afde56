//! Process-wide registry of sensitive strings.
//!
//! Values of variables and locals marked sensitive are registered here once
//! evaluated; every UI writer filters its output through the registry.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeSet;

/// Replacement text for redacted values.
pub const REDACTED: &str = "<sensitive>";

/// Append-only set of secrets scrubbed from output.
#[derive(Debug, Default)]
pub struct RedactionRegistry {
    secrets: RwLock<BTreeSet<String>>,
}

impl RedactionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one secret. Empty strings are ignored.
    pub fn register(&self, secret: impl Into<String>) {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.write().insert(secret);
        }
    }

    /// Registers every string leaf of `value`. Numeric and boolean leaves
    /// are skipped.
    pub fn register_value(&self, value: &Value) {
        match value {
            Value::String(s) => self.register(s.as_str()),
            Value::Array(items) => items.iter().for_each(|v| self.register_value(v)),
            Value::Object(map) => map.values().for_each(|v| self.register_value(v)),
            Value::Number(_) | Value::Bool(_) | Value::Null => {}
        }
    }

    /// Returns true if `secret` is registered.
    #[must_use]
    pub fn contains(&self, secret: &str) -> bool {
        self.secrets.read().contains(secret)
    }

    /// Number of registered secrets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.secrets.read().len()
    }

    /// Returns true when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }

    /// Returns `text` with every registered secret replaced by [`REDACTED`].
    ///
    /// Longer secrets are replaced first so a secret that contains another
    /// is never partially revealed.
    #[must_use]
    pub fn filter(&self, text: &str) -> String {
        let secrets = self.secrets.read();
        if secrets.is_empty() {
            return text.to_string();
        }
        let mut ordered: Vec<&String> = secrets.iter().collect();
        ordered.sort_by(|a, b| b.len().cmp(&a.len()));

        let mut out = text.to_string();
        for secret in ordered {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_filter_replaces_registered_values() {
        let registry = RedactionRegistry::new();
        registry.register("hunter2");

        assert_eq!(
            registry.filter("password is hunter2, again hunter2"),
            "password is <sensitive>, again <sensitive>"
        );
    }

    #[test]
    fn test_longer_secret_wins() {
        let registry = RedactionRegistry::new();
        registry.register("abc");
        registry.register("abcdef");

        assert_eq!(registry.filter("token=abcdef"), "token=<sensitive>");
    }

    #[test]
    fn test_register_value_walks_composites() {
        let registry = RedactionRegistry::new();
        registry.register_value(&json!({"user": "admin", "keys": ["k1", ""], "port": 2222}));

        assert!(registry.contains("admin"));
        assert!(registry.contains("k1"));
        assert!(!registry.contains("2222"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_scalar_leaves_do_not_mask_output() {
        let registry = RedactionRegistry::new();
        registry.register_value(&json!({"port": 1, "enabled": true, "token": "s3cr3t"}));

        assert_eq!(
            registry.filter("Build 1 of 10 finished: enabled=true token=s3cr3t"),
            "Build 1 of 10 finished: enabled=true token=<sensitive>"
        );
    }

    #[test]
    fn test_empty_registry_passthrough() {
        let registry = RedactionRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.filter("plain"), "plain");
    }
}
