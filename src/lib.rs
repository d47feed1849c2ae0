//! Storage Backend Plugins - Array Plugin Layer
//!
//! Presents heterogeneous storage arrays behind one backend-plugin contract
//! used by a container-storage orchestration driver. Centralized SAN,
//! distributed SAN and NAS dtree families are built in.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          Backend Table (facade)                             │
//! │     register / bond topology / refresh / "<backend>.<volume>" operations    │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  oceanstor-san  │  │fusionstorage-san│  │      oceanstor-dtree        │  │
//! │  │ (metro/replica) │  │  (scsi/iscsi)   │  │          (nfs)              │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                  │
//! │  ┌────────┴────────────────────┴───────┐                 │                  │
//! │  │        HyperMetro Dispatcher        │                 │                  │
//! │  │  local │ dual-array │ remote        │                 │                  │
//! │  ├─────────────────────────────────────┤                 │                  │
//! │  │  Host Attacher  │  Metro Attacher   │                 │                  │
//! │  └────────┬────────────────────────────┘                 │                  │
//! │           │                                              │                  │
//! │  ┌────────┴──────────────────────────────────────────────┴───────────────┐  │
//! │  │            Array Sessions (refcounted login/logout)                   │  │
//! │  └────────────────────────────────┬──────────────────────────────────────┘  │
//! ├───────────────────────────────────┴─────────────────────────────────────────┤
//! │                     Array Client (REST client port)                          │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`backend`]: sessions, plugin registry, plugin families, backend table
//! - [`metro`]: HyperMetro-aware dispatch
//! - [`attach`]: host and metro attachers, ALUA policy
//! - [`array`]: in-memory simulated array client
//! - [`domain`]: core domain types and traits
//! - [`config`]: YAML configuration
//! - [`error`]: error types and handling

pub mod array;
pub mod attach;
pub mod backend;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod metro;

// Re-export commonly used types
pub use backend::{
    volume_id, ArraySession, BackendEvent, BackendStatus, BackendTable, BondKind,
    PluginRegistry, SessionLease,
};

pub use config::{BackendConfig, PluginLayerConfig};

pub use domain::ports::{
    ArrayClient, Attacher, BackendLookup, BackendPlugin, ClientConfig, ClientFactory,
};

pub use domain::types::{
    Capabilities, CapabilityReport, DisconnectInfo, MappingInfo, OperationKind, Parameters,
    PoolCapacity, Protocol, RequestContext, SnapshotInfo, VolumeInfo,
};

pub use error::{Error, ErrorKind, Result};

pub use metro::{MetroDispatcher, Strategy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
