//! Backend Management
//!
//! Array sessions, the plugin registry, plugin families and the backend
//! table that ties configured backends together.

pub mod events;
pub mod naming;
pub mod plugins;
pub mod registry;
pub mod session;
pub mod table;
pub mod topology;

pub use events::{BackendEvent, BondKind};
pub use naming::object_name;
pub use plugins::{DistributedSanPlugin, DtreePlugin, SanPlugin};
pub use registry::{PluginConstructor, PluginRegistry, PluginRegistryBuilder};
pub use session::{ArraySession, SessionLease, SessionSnapshot};
pub use table::{volume_id, BackendStatus, BackendTable};
pub use topology::Topology;
