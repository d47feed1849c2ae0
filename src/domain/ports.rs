//! Domain Ports - Core trait definitions for the plugin layer
//!
//! These traits define the boundaries between the plugin layer and the
//! systems around it. The array client is consumed; backend plugins and
//! attachers are exposed to the orchestration side.

use crate::backend::session::ArraySession;
use crate::config::BackendConfig;
use crate::domain::types::*;
use crate::error::Result;
use crate::metro::BlockTarget;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

// =============================================================================
// Array Objects
// =============================================================================

/// Array product family, as reported by the system query
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArrayModel {
    V3,
    V5,
    DoradoV3,
    DoradoV6,
    Distributed,
    Other(String),
}

impl ArrayModel {
    pub fn from_product(product: &str) -> Self {
        match product {
            "V3" => ArrayModel::V3,
            "V5" => ArrayModel::V5,
            "DoradoV3" => ArrayModel::DoradoV3,
            "DoradoV6" => ArrayModel::DoradoV6,
            "FusionStorage" | "Distributed" => ArrayModel::Distributed,
            other => ArrayModel::Other(other.to_string()),
        }
    }

    /// NVMe-oF host attachment needs a DoradoV6-class controller
    pub fn supports_nvme(&self) -> bool {
        matches!(self, ArrayModel::DoradoV6)
    }
}

impl std::fmt::Display for ArrayModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArrayModel::V3 => write!(f, "V3"),
            ArrayModel::V5 => write!(f, "V5"),
            ArrayModel::DoradoV3 => write!(f, "DoradoV3"),
            ArrayModel::DoradoV6 => write!(f, "DoradoV6"),
            ArrayModel::Distributed => write!(f, "FusionStorage"),
            ArrayModel::Other(name) => write!(f, "{}", name),
        }
    }
}

/// System identity of an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub serial_number: String,
    pub model: ArrayModel,
    pub version: String,
}

/// Licensed features of an array
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayFeatures {
    pub thin: bool,
    pub thick: bool,
    pub qos: bool,
    pub metro: bool,
    pub replication: bool,
    pub clone: bool,
    pub application_type: bool,
}

/// A storage pool on the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: String,
    pub name: String,
    pub free_capacity_bytes: u64,
    pub total_capacity_bytes: u64,
}

/// Volume (LUN) as returned by the array; never cached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub id: String,
    pub name: String,
    pub wwn: String,
    pub capacity_sectors: u64,
    pub pool_id: String,
    /// Whether any host currently has the volume mapped
    pub exposed_to_host: bool,
    /// Raw relationship blob, e.g. `{"HyperMetro":"TRUE"}`
    pub relationships: Option<String>,
}

impl VolumeDescriptor {
    /// Whether the relationship blob marks an active HyperMetro pairing
    ///
    /// A descriptor without a blob is not paired; an unparsable blob is an error
    /// the caller decides how to treat.
    pub fn is_hypermetro(&self) -> std::result::Result<bool, serde_json::Error> {
        let Some(raw) = self.relationships.as_deref() else {
            return Ok(false);
        };
        let relations: BTreeMap<String, String> = serde_json::from_str(raw)?;
        Ok(relations
            .get("HyperMetro")
            .map_or(false, |state| state.eq_ignore_ascii_case("TRUE")))
    }
}

/// Live HyperMetro pair state; always re-fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HyperMetroPair {
    pub id: String,
    pub local_object_id: String,
    pub remote_object_id: String,
    pub domain: String,
    pub running_status: PairRunningStatus,
    pub health_status: PairHealthStatus,
}

/// Allocation type of a new volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocType {
    Thin,
    Thick,
}

/// Volume creation parameters passed to the array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub pool_id: String,
    pub capacity_sectors: u64,
    pub alloc_type: AllocType,
    pub description: Option<String>,
    pub qos: Option<Parameters>,
}

/// HyperMetro pair creation parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePairRequest {
    pub local_volume_id: String,
    pub remote_volume_id: String,
    pub domain: String,
}

/// Snapshot as returned by the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub id: String,
    pub name: String,
    pub parent_id: String,
    pub capacity_sectors: u64,
    pub created_at: DateTime<Utc>,
}

/// Host object to create or reuse before mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,
    pub protocol: Protocol,
    pub initiators: Vec<String>,
    pub alua: Option<crate::attach::AluaConfig>,
}

/// Array-side targets visible to a set of initiators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub iqns: Vec<String>,
    pub wwns: Vec<String>,
    pub nqn: Option<String>,
}

/// Directory-tree quota object on a NAS file system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtreeDescriptor {
    pub id: String,
    pub name: String,
    pub parent_name: String,
    pub quota_bytes: u64,
}

/// Enabled NFS versions on the array
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsServiceSetting {
    pub nfs3: bool,
    pub nfs4: bool,
    pub nfs41: bool,
}

// =============================================================================
// Array Client Port (consumed)
// =============================================================================

/// Connection settings for one array client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub urls: Vec<String>,
    pub user: String,
    pub vstore_name: Option<String>,
    pub timeout: Duration,
}

/// Request/response client for one storage controller
///
/// Lookups return `Ok(None)` when the object does not exist; transport and
/// authentication failures are errors.
#[async_trait]
pub trait ArrayClient: Send + Sync {
    async fn login(&self) -> Result<()>;
    async fn logout(&self) -> Result<()>;
    /// Probe credentials without touching any tracked session
    async fn validate_login(&self) -> Result<()>;

    async fn get_system(&self) -> Result<SystemInfo>;
    async fn get_features(&self) -> Result<ArrayFeatures>;

    async fn get_pool_by_name(&self, name: &str) -> Result<Option<StoragePool>>;
    async fn get_all_pools(&self) -> Result<Vec<StoragePool>>;

    async fn get_volume_by_name(&self, name: &str) -> Result<Option<VolumeDescriptor>>;
    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<VolumeDescriptor>;
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;
    async fn expand_volume(&self, volume_id: &str, capacity_sectors: u64) -> Result<()>;

    async fn get_hypermetro_pair_by_local_object_id(
        &self,
        object_id: &str,
    ) -> Result<Option<HyperMetroPair>>;
    async fn create_hypermetro_pair(&self, request: &CreatePairRequest) -> Result<HyperMetroPair>;
    async fn delete_hypermetro_pair(&self, pair_id: &str) -> Result<()>;

    async fn get_snapshot_by_name(&self, name: &str) -> Result<Option<SnapshotDescriptor>>;
    async fn create_snapshot(&self, volume_id: &str, name: &str) -> Result<SnapshotDescriptor>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;

    /// Create the host (or reuse it) with its initiators; returns the host id
    async fn ensure_host(&self, spec: &HostSpec) -> Result<String>;
    async fn get_host_by_name(&self, name: &str) -> Result<Option<String>>;
    /// Map a volume to a host; returns the host LUN id
    async fn map_volume(&self, host_id: &str, volume_id: &str) -> Result<u32>;
    async fn unmap_volume(&self, host_id: &str, volume_id: &str) -> Result<()>;
    async fn get_targets(&self, protocol: Protocol, initiators: &[String]) -> Result<TargetInfo>;

    async fn get_dtree(&self, parent: &str, name: &str) -> Result<Option<DtreeDescriptor>>;
    async fn create_dtree(&self, parent: &str, name: &str, quota_bytes: u64)
        -> Result<DtreeDescriptor>;
    async fn delete_dtree(&self, parent: &str, name: &str) -> Result<()>;
    async fn set_dtree_quota(&self, parent: &str, name: &str, quota_bytes: u64) -> Result<()>;
    async fn get_nfs_service_setting(&self) -> Result<NfsServiceSetting>;
}

/// Builds array clients for backends
pub trait ClientFactory: Send + Sync {
    fn new_client(&self, backend: &str, config: &ClientConfig) -> Result<Arc<dyn ArrayClient>>;
}

#[cfg(test)]
impl std::fmt::Debug for dyn ArrayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ArrayClient")
    }
}

// =============================================================================
// Attacher Port
// =============================================================================

/// Executes host-mapping operations against one array (or a pair of them)
#[async_trait]
pub trait Attacher: Send + Sync {
    fn protocol(&self) -> Protocol;

    async fn controller_attach(
        &self,
        ctx: &RequestContext,
        lun_name: &str,
        params: &Parameters,
    ) -> Result<MappingInfo>;

    /// Returns the WWN of the unmapped LUN when it exists
    async fn controller_detach(
        &self,
        ctx: &RequestContext,
        lun_name: &str,
        params: &Parameters,
    ) -> Result<Option<String>>;

    async fn node_unstage(
        &self,
        ctx: &RequestContext,
        lun_name: &str,
        params: &Parameters,
    ) -> Result<DisconnectInfo>;
}

// =============================================================================
// Backend Plugin Port (exposed)
// =============================================================================

/// Name-based lookup of registered backends, used to resolve bonded remotes
pub trait BackendLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Arc<dyn BackendPlugin>>;
}

/// One configured storage array
#[async_trait]
pub trait BackendPlugin: Send + Sync {
    /// Backend name from configuration
    fn name(&self) -> &str;

    /// Storage family this plugin implements
    fn storage(&self) -> &'static str;

    /// Validate parameters and open the first session
    ///
    /// With `keep_login` false the session is logged out again before return.
    async fn init(&mut self, config: &BackendConfig, keep_login: bool) -> Result<()>;

    /// Probe configuration with a throwaway client
    async fn validate(&self, config: &BackendConfig) -> Result<()>;

    async fn create_volume(
        &self,
        ctx: &RequestContext,
        name: &str,
        params: &Parameters,
    ) -> Result<VolumeInfo>;

    async fn delete_volume(&self, ctx: &RequestContext, name: &str) -> Result<()>;

    /// Returns whether the host side must also grow the device
    async fn expand_volume(&self, ctx: &RequestContext, name: &str, capacity_bytes: i64)
        -> Result<bool>;

    async fn create_snapshot(
        &self,
        ctx: &RequestContext,
        volume: &str,
        snapshot: &str,
    ) -> Result<SnapshotInfo>;

    async fn delete_snapshot(&self, ctx: &RequestContext, snapshot: &str) -> Result<()>;

    async fn attach_volume(
        &self,
        ctx: &RequestContext,
        name: &str,
        params: &Parameters,
    ) -> Result<MappingInfo>;

    async fn detach_volume(
        &self,
        ctx: &RequestContext,
        name: &str,
        params: &Parameters,
    ) -> Result<()>;

    async fn unstage_volume(
        &self,
        ctx: &RequestContext,
        name: &str,
        params: &Parameters,
    ) -> Result<DisconnectInfo>;

    async fn update_backend_capabilities(&self) -> Result<CapabilityReport>;

    async fn update_pool_capabilities(
        &self,
        pool_names: &[String],
    ) -> Result<BTreeMap<String, PoolCapacity>>;

    /// Tracked session, once initialized
    fn session(&self) -> Option<&Arc<ArraySession>>;

    fn is_online(&self) -> bool {
        self.session().map_or(false, |session| session.is_online())
    }

    /// Block attachment target for metro dispatch; `None` for file families
    fn block_target(&self) -> Option<BlockTarget> {
        None
    }

    /// Check that `remote` can be bonded as the metro remote; bonds nothing
    fn check_metro_remote(&self, _lookup: &Weak<dyn BackendLookup>, remote: &str) -> Result<()> {
        Err(crate::error::Error::NotSupported {
            backend: self.name().to_string(),
            operation: format!("metro bonding to {}", remote),
        })
    }

    fn check_replica_remote(&self, _lookup: &Weak<dyn BackendLookup>, remote: &str) -> Result<()> {
        Err(crate::error::Error::NotSupported {
            backend: self.name().to_string(),
            operation: format!("replica bonding to {}", remote),
        })
    }

    fn bond_metro_remote(&self, _lookup: Weak<dyn BackendLookup>, remote: &str) -> Result<()> {
        Err(crate::error::Error::NotSupported {
            backend: self.name().to_string(),
            operation: format!("metro bonding to {}", remote),
        })
    }

    fn bond_replica_remote(&self, _lookup: Weak<dyn BackendLookup>, remote: &str) -> Result<()> {
        Err(crate::error::Error::NotSupported {
            backend: self.name().to_string(),
            operation: format!("replica bonding to {}", remote),
        })
    }

    /// Force the session closed regardless of holders
    async fn shutdown(&self);
}

// =============================================================================
// Type Aliases
// =============================================================================

pub type ArrayClientRef = Arc<dyn ArrayClient>;
pub type ClientFactoryRef = Arc<dyn ClientFactory>;
pub type BackendPluginRef = Arc<dyn BackendPlugin>;
