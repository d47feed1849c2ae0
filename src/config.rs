//! Plugin Layer Configuration
//!
//! YAML configuration listing the storage backends to register, their
//! client settings, untyped plugin parameters and replication topology.
//!
//! ```yaml
//! refreshIntervalSecs: 60
//! backends:
//!   - name: san-a
//!     storage: oceanstor-san
//!     urls: ["https://10.0.0.10:8088"]
//!     user: admin
//!     pools: [pool-a]
//!     metroBackend: san-b
//!     hyperMetroDomain: domain-1
//!     parameters:
//!       protocol: iscsi
//!       portals: ["10.0.1.1", "10.0.1.2"]
//! ```

use crate::domain::{ClientConfig, Parameters};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Defaults
// =============================================================================

const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

fn default_client_timeout() -> u64 {
    DEFAULT_CLIENT_TIMEOUT_SECS
}

fn default_refresh_interval() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECS
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

// =============================================================================
// Backend Configuration
// =============================================================================

/// Configuration of one storage backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Unique backend name
    pub name: String,
    /// Plugin family, e.g. `oceanstor-san`
    pub storage: String,
    /// Management URLs, tried in order
    pub urls: Vec<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub vstore_name: Option<String>,
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,
    /// Pools this backend provisions from
    #[serde(default)]
    pub pools: Vec<String>,
    /// Plugin-specific parameters (protocol, portals, ALUA, ...)
    #[serde(default)]
    pub parameters: Parameters,
    /// Backend bonded as the synchronous HyperMetro peer
    #[serde(default)]
    pub metro_backend: Option<String>,
    /// Backend bonded as the asynchronous replication peer
    #[serde(default)]
    pub replica_backend: Option<String>,
    /// HyperMetro domain new pairs are created in
    #[serde(default)]
    pub hyper_metro_domain: Option<String>,
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, storage: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: storage.into(),
            urls: vec![url.into()],
            user: String::new(),
            vstore_name: None,
            timeout_secs: DEFAULT_CLIENT_TIMEOUT_SECS,
            pools: Vec::new(),
            parameters: Parameters::new(),
            metro_backend: None,
            replica_backend: None,
            hyper_metro_domain: None,
        }
    }

    /// Set one plugin parameter
    pub fn with_parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn with_pools(mut self, pools: &[&str]) -> Self {
        self.pools = pools.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_metro_backend(mut self, remote: impl Into<String>, domain: impl Into<String>) -> Self {
        self.metro_backend = Some(remote.into());
        self.hyper_metro_domain = Some(domain.into());
        self
    }

    pub fn with_replica_backend(mut self, remote: impl Into<String>) -> Self {
        self.replica_backend = Some(remote.into());
        self
    }

    /// Client settings derived from this backend
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            urls: self.urls.clone(),
            user: self.user.clone(),
            vstore_name: self.vstore_name.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    /// Structural checks that don't depend on the plugin family
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("backend name must not be empty".into()));
        }
        if self.name.contains('.') {
            return Err(Error::Configuration(format!(
                "backend name {} must not contain '.'",
                self.name
            )));
        }
        if self.urls.is_empty() {
            return Err(Error::Configuration(format!(
                "backend {} has no urls",
                self.name
            )));
        }
        if self.metro_backend.as_deref() == Some(self.name.as_str()) {
            return Err(Error::Configuration(format!(
                "backend {} can't be its own metro backend",
                self.name
            )));
        }
        if self.replica_backend.as_deref() == Some(self.name.as_str()) {
            return Err(Error::Configuration(format!(
                "backend {} can't be its own replica backend",
                self.name
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Layer Configuration
// =============================================================================

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginLayerConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Interval between capability refreshes
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Per-call timeout for array requests
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for PluginLayerConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl PluginLayerConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: PluginLayerConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for backend in &self.backends {
            backend.validate()?;
            if !names.insert(backend.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate backend name {}",
                    backend.name
                )));
            }
        }

        for backend in &self.backends {
            for remote in [&backend.metro_backend, &backend.replica_backend]
                .into_iter()
                .flatten()
            {
                if !names.contains(remote.as_str()) {
                    return Err(Error::Configuration(format!(
                        "backend {} references unknown backend {}",
                        backend.name, remote
                    )));
                }
            }
        }

        if self.refresh_interval_secs == 0 {
            return Err(Error::Configuration(
                "refreshIntervalSecs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}
