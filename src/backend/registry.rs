//! Plugin Registry
//!
//! Maps storage family names to plugin constructors. Built once at startup
//! through [`PluginRegistryBuilder`] and read-only afterwards.

use super::plugins::{DistributedSanPlugin, DtreePlugin, SanPlugin};
use crate::domain::{BackendPlugin, ClientFactory};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Builds an uninitialized plugin bound to a client factory
pub type PluginConstructor = fn(Arc<dyn ClientFactory>) -> Box<dyn BackendPlugin>;

/// Collects constructors before the registry is frozen
pub struct PluginRegistryBuilder {
    factory: Arc<dyn ClientFactory>,
    constructors: BTreeMap<String, PluginConstructor>,
}

impl PluginRegistryBuilder {
    /// Register a constructor; a name can be registered once
    pub fn register(mut self, name: &str, constructor: PluginConstructor) -> Result<Self> {
        if self.constructors.contains_key(name) {
            return Err(Error::PluginAlreadyRegistered {
                name: name.to_string(),
            });
        }
        debug!("Registered storage plugin {}", name);
        self.constructors.insert(name.to_string(), constructor);
        Ok(self)
    }

    pub fn build(self) -> Arc<PluginRegistry> {
        Arc::new(PluginRegistry {
            factory: self.factory,
            constructors: self.constructors,
        })
    }
}

/// Read-only family name → constructor table
pub struct PluginRegistry {
    factory: Arc<dyn ClientFactory>,
    constructors: BTreeMap<String, PluginConstructor>,
}

impl PluginRegistry {
    pub fn builder(factory: Arc<dyn ClientFactory>) -> PluginRegistryBuilder {
        PluginRegistryBuilder {
            factory,
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the SAN, distributed SAN and dtree families
    pub fn with_builtin_plugins(factory: Arc<dyn ClientFactory>) -> Result<Arc<Self>> {
        Ok(Self::builder(factory)
            .register(SanPlugin::STORAGE, SanPlugin::construct)?
            .register(DistributedSanPlugin::STORAGE, DistributedSanPlugin::construct)?
            .register(DtreePlugin::STORAGE, DtreePlugin::construct)?
            .build())
    }

    /// Fresh, uninitialized plugin of a family
    pub fn new_plugin(&self, name: &str) -> Result<Box<dyn BackendPlugin>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| Error::Configuration(format!("storage plugin {} is not registered", name)))?;
        Ok(constructor(Arc::clone(&self.factory)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}
