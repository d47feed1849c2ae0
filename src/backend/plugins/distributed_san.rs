//! Distributed SAN plugin
//!
//! Block volumes on a distributed (scale-out) array. Attachment is either
//! iSCSI against IP portals or SCSI through the VBS agent of each node, in
//! which case the single portal entry maps node host names to agent IPs.
//! Capacities are allocated in whole MiB. There is no HyperMetro support.

use super::common::{self, ensure_volume, ArrayBase};
use crate::attach::AttacherSpec;
use crate::backend::naming::object_name;
use crate::backend::session::ArraySession;
use crate::config::BackendConfig;
use crate::domain::*;
use crate::error::{Error, Result};
use crate::metrics;
use crate::metro::{BlockTarget, MetroDispatcher};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Allocation unit of the distributed array
const CAPACITY_UNIT: u64 = 1024 * 1024;

const PROTOCOLS: [Protocol; 2] = [Protocol::Scsi, Protocol::Iscsi];

pub struct DistributedSanPlugin {
    base: ArrayBase,
    protocol: Protocol,
    portals: Vec<String>,
    host_addresses: BTreeMap<String, String>,
}

impl DistributedSanPlugin {
    pub const STORAGE: &'static str = "fusionstorage-san";

    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            base: ArrayBase::new(Self::STORAGE, factory),
            protocol: Protocol::Scsi,
            portals: Vec::new(),
            host_addresses: BTreeMap::new(),
        }
    }

    pub fn construct(factory: Arc<dyn ClientFactory>) -> Box<dyn BackendPlugin> {
        Box::new(Self::new(factory))
    }

    fn parse(
        params: &Parameters,
    ) -> Result<(Protocol, Vec<String>, BTreeMap<String, String>)> {
        let protocol = common::required_protocol(params, &PROTOCOLS)?;
        match protocol {
            Protocol::Scsi => Ok((protocol, Vec::new(), host_addresses(params)?)),
            _ => Ok((protocol, common::ip_portals(params)?, BTreeMap::new())),
        }
    }

    fn wrap<T>(&self, operation: &str, volume: &str, result: Result<T>) -> Result<T> {
        result.map_err(|e| {
            metrics::record_operation_failure(self.base.name(), operation);
            Error::operation(self.base.name(), operation, volume, e)
        })
    }

    async fn dispatch(
        &self,
        ctx: &RequestContext,
        name: &str,
        params: &Parameters,
        kind: OperationKind,
    ) -> Result<OperationOutcome> {
        let local = self.block_target().ok_or_else(|| {
            Error::Internal(format!("backend {} used before init", self.base.name()))
        });
        let request = OperationRequest::new(object_name(name), params.clone(), kind);
        let result = match local {
            Ok(local) => MetroDispatcher::new(local, None).dispatch(ctx, &request).await,
            Err(e) => Err(e),
        };
        self.wrap(kind.as_str(), name, result)
    }

    async fn create(&self, ctx: &RequestContext, name: &str, params: &Parameters) -> Result<VolumeInfo> {
        let size = params.get_i64("size").ok_or_else(|| Error::InvalidParameter {
            name: "size".to_string(),
            reason: "must be provided".to_string(),
        })?;
        let capacity = aligned_capacity(size, CAPACITY_UNIT)?;
        let pool = common::required_str(params, "storagepool")?;

        let template = CreateVolumeRequest {
            name: object_name(name),
            pool_id: String::new(),
            capacity_sectors: capacity / SECTOR_SIZE,
            alloc_type: AllocType::Thin,
            description: params.get_str("description").map(str::to_string),
            qos: common::qos(params)?,
        };
        let session = self.base.require_session()?;
        let (volume, _) = ensure_volume(ctx, session, self.base.name(), pool, &template).await?;

        Ok(VolumeInfo {
            name: volume.name,
            id: volume.id,
            wwn: Some(volume.wwn),
            capacity_bytes: capacity,
            hyper_metro: false,
        })
    }

    async fn delete(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        let lun_name = object_name(name);
        let backend = self.base.name();

        self.base
            .with_session(|client| async move {
                match ctx
                    .run("query volume", client.get_volume_by_name(&lun_name))
                    .await?
                {
                    Some(volume) => {
                        ctx.run("delete volume", client.delete_volume(&volume.id))
                            .await?;
                        info!("Deleted volume {} from backend {}", lun_name, backend);
                    }
                    None => info!("Volume {} already absent from backend {}", lun_name, backend),
                }
                Ok(())
            })
            .await
    }

    async fn expand(&self, ctx: &RequestContext, name: &str, capacity_bytes: i64) -> Result<bool> {
        let capacity = aligned_capacity(capacity_bytes, CAPACITY_UNIT)?;
        let sectors = capacity / SECTOR_SIZE;
        let lun_name = object_name(name);
        let backend = self.base.name();

        self.base
            .with_session(|client| async move {
                let volume = ctx
                    .run("query volume", client.get_volume_by_name(&lun_name))
                    .await?
                    .ok_or_else(|| Error::VolumeNotFound {
                        backend: backend.to_string(),
                        volume: lun_name.clone(),
                    })?;
                if sectors < volume.capacity_sectors {
                    return Err(Error::InvalidParameter {
                        name: "capacity".to_string(),
                        reason: format!("shrinking {} is not supported", lun_name),
                    });
                }
                if sectors > volume.capacity_sectors {
                    ctx.run("expand volume", client.expand_volume(&volume.id, sectors))
                        .await?;
                    info!(
                        "Expanded volume {} on backend {} to {} bytes",
                        lun_name, backend, capacity
                    );
                }
                Ok(volume.exposed_to_host)
            })
            .await
    }
}

/// Node host name → VBS agent IP, from the first `portals` entry
fn host_addresses(params: &Parameters) -> Result<BTreeMap<String, String>> {
    let invalid = |reason: &str| Error::InvalidParameter {
        name: "portals".to_string(),
        reason: reason.to_string(),
    };

    let entry = match params.get("portals") {
        Some(Value::Array(items)) if items.len() == 1 => &items[0],
        _ => return Err(invalid("scsi needs exactly one host-to-IP map")),
    };
    let map = entry
        .as_object()
        .ok_or_else(|| invalid("scsi portal entry must map host names to IPs"))?;

    let mut addresses = BTreeMap::new();
    for (host, ip) in map {
        let ip = ip
            .as_str()
            .ok_or_else(|| invalid("scsi portal addresses must be strings"))?;
        common::check_ip(ip)?;
        addresses.insert(host.clone(), ip.to_string());
    }
    Ok(addresses)
}

#[async_trait]
impl BackendPlugin for DistributedSanPlugin {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn storage(&self) -> &'static str {
        Self::STORAGE
    }

    async fn init(&mut self, config: &BackendConfig, keep_login: bool) -> Result<()> {
        let (protocol, portals, host_addresses) = Self::parse(&config.parameters)?;
        self.base.init(config, keep_login).await?;
        self.protocol = protocol;
        self.portals = portals;
        self.host_addresses = host_addresses;
        Ok(())
    }

    async fn validate(&self, config: &BackendConfig) -> Result<()> {
        Self::parse(&config.parameters)?;
        self.base.validate_login(config).await
    }

    async fn create_volume(
        &self,
        ctx: &RequestContext,
        name: &str,
        params: &Parameters,
    ) -> Result<VolumeInfo> {
        let result = self.create(ctx, name, params).await;
        self.wrap("create", name, result)
    }

    async fn delete_volume(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        let result = self.delete(ctx, name).await;
        self.wrap("delete", name, result)
    }

    async fn expand_volume(
        &self,
        ctx: &RequestContext,
        name: &str,
        capacity_bytes: i64,
    ) -> Result<bool> {
        let result = self.expand(ctx, name, capacity_bytes).await;
        self.wrap("expand", name, result)
    }

    async fn create_snapshot(
        &self,
        ctx: &RequestContext,
        volume: &str,
        snapshot: &str,
    ) -> Result<SnapshotInfo> {
        let result = self.base.snapshot_volume(ctx, volume, snapshot).await;
        self.wrap("create snapshot", volume, result)
    }

    async fn delete_snapshot(&self, ctx: &RequestContext, snapshot: &str) -> Result<()> {
        let result = self.base.remove_snapshot(ctx, snapshot).await;
        self.wrap("delete snapshot", snapshot, result)
    }

    async fn attach_volume(
        &self,
        ctx: &RequestContext,
        name: &str,
        params: &Parameters,
    ) -> Result<MappingInfo> {
        match self.dispatch(ctx, name, params, OperationKind::Attach).await? {
            OperationOutcome::Attached(mapping) => Ok(mapping),
            other => Err(Error::Internal(format!(
                "attach of {} returned a {} result",
                name,
                other.kind()
            ))),
        }
    }

    async fn detach_volume(
        &self,
        ctx: &RequestContext,
        name: &str,
        params: &Parameters,
    ) -> Result<()> {
        self.dispatch(ctx, name, params, OperationKind::Detach)
            .await
            .map(|_| ())
    }

    async fn unstage_volume(
        &self,
        ctx: &RequestContext,
        name: &str,
        params: &Parameters,
    ) -> Result<DisconnectInfo> {
        match self.dispatch(ctx, name, params, OperationKind::Unstage).await? {
            OperationOutcome::Unstaged(info) => Ok(info),
            other => Err(Error::Internal(format!(
                "unstage of {} returned a {} result",
                name,
                other.kind()
            ))),
        }
    }

    /// Fixed feature set; only reachability is probed
    async fn update_backend_capabilities(&self) -> Result<CapabilityReport> {
        let session = self.base.require_session()?;
        let system = self
            .base
            .with_session(|client| async move { client.get_system().await })
            .await;
        let system = match system {
            Ok(system) => system,
            Err(e) => {
                session.mark_offline().await;
                return Err(e);
            }
        };

        Ok(CapabilityReport {
            capabilities: Capabilities {
                support_thin: true,
                support_qos: true,
                support_clone: true,
                ..Default::default()
            },
            specifications: common::specifications(&system),
        })
    }

    async fn update_pool_capabilities(
        &self,
        pool_names: &[String],
    ) -> Result<BTreeMap<String, PoolCapacity>> {
        self.base.pool_capacities(pool_names).await
    }

    fn session(&self) -> Option<&Arc<ArraySession>> {
        self.base.session()
    }

    fn block_target(&self) -> Option<BlockTarget> {
        let session = self.base.session()?;
        Some(BlockTarget {
            spec: AttacherSpec {
                backend: self.base.name().to_string(),
                protocol: self.protocol,
                portals: self.portals.clone(),
                host_addresses: self.host_addresses.clone(),
                alua: None,
            },
            session: Arc::clone(session),
        })
    }

    async fn shutdown(&self) {
        self.base.shutdown().await;
    }
}
