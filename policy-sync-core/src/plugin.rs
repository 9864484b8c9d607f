//! Configuration-keyed plugin factories.
//!
//! Business types (observation decoding, action mapping, reward shaping, the
//! network itself) are selected by a string key from configuration. A
//! [`PluginRegistry`] maps keys to factories so the pipeline only ever sees
//! the trait object it asked for.

use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// Factory producing a plugin instance from its JSON parameters
pub type Factory<T> = Box<dyn Fn(&serde_json::Value) -> Result<Box<T>> + Send + Sync>;

/// Registry of factories for one plugin trait
pub struct PluginRegistry<T: ?Sized> {
    kind: &'static str,
    factories: BTreeMap<String, Factory<T>>,
}

impl<T: ?Sized> fmt::Debug for PluginRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("kind", &self.kind)
            .field("keys", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T: ?Sized> PluginRegistry<T> {
    /// Empty registry for plugins of `kind` (used in diagnostics)
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: BTreeMap::new(),
        }
    }

    /// Register `factory` under `key`, replacing any previous one
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&serde_json::Value) -> Result<Box<T>> + Send + Sync + 'static,
    {
        let key = key.into();
        if self.factories.insert(key.clone(), Box::new(factory)).is_some() {
            tracing::warn!(kind = self.kind, key = %key, "plugin factory replaced");
        }
        self
    }

    /// Whether `key` is registered
    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered keys in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate the plugin registered under `key`
    pub fn build(&self, key: &str, params: &serde_json::Value) -> Result<Box<T>> {
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| Error::UnknownPlugin(format!("{}:{key}", self.kind)))?;
        factory(params).map_err(|e| match e {
            e @ Error::PluginBuild { .. } => e,
            other => Error::PluginBuild {
                key: key.to_string(),
                reason: other.to_string(),
            },
        })
    }
}
