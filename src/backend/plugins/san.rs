//! Centralized SAN plugin
//!
//! Block volumes on a centralized array over iSCSI, FC, RoCE or FC-NVMe.
//! Volumes requested with `hyperMetro` get a twin on the bonded metro remote
//! and a pair joining the two; host mapping goes through the metro
//! dispatcher.

use super::common::{self, discard_volume, ensure_volume, with_lease, ArrayBase};
use crate::attach::{AluaPolicy, AttacherSpec};
use crate::backend::naming::object_name;
use crate::backend::session::ArraySession;
use crate::backend::topology::Topology;
use crate::config::BackendConfig;
use crate::domain::*;
use crate::error::{Error, Result};
use crate::metrics;
use crate::metro::{BlockTarget, MetroDispatcher};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

const PROTOCOLS: [Protocol; 4] = [Protocol::Iscsi, Protocol::Fc, Protocol::Roce, Protocol::FcNvme];

/// Attachment settings read from the backend parameters
struct SanParameters {
    protocol: Protocol,
    portals: Vec<String>,
    alua: Option<AluaPolicy>,
}

impl SanParameters {
    fn parse(params: &Parameters) -> Result<Self> {
        let protocol = common::required_protocol(params, &PROTOCOLS)?;
        let portals = if protocol.requires_portals() {
            common::ip_portals(params)?
        } else {
            Vec::new()
        };
        let alua = params
            .get("ALUA")
            .map(AluaPolicy::from_value)
            .transpose()?
            .filter(|policy| !policy.is_empty());
        Ok(Self {
            protocol,
            portals,
            alua,
        })
    }
}

pub struct SanPlugin {
    base: ArrayBase,
    protocol: Protocol,
    portals: Vec<String>,
    alua: Option<AluaPolicy>,
    metro_domain: Option<String>,
    topology: Topology,
}

impl SanPlugin {
    pub const STORAGE: &'static str = "oceanstor-san";

    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            base: ArrayBase::new(Self::STORAGE, factory),
            protocol: Protocol::Iscsi,
            portals: Vec::new(),
            alua: None,
            metro_domain: None,
            topology: Topology::new(),
        }
    }

    pub fn construct(factory: Arc<dyn ClientFactory>) -> Box<dyn BackendPlugin> {
        Box::new(Self::new(factory))
    }

    fn attacher_spec(&self) -> AttacherSpec {
        AttacherSpec {
            backend: self.base.name().to_string(),
            protocol: self.protocol,
            portals: self.portals.clone(),
            host_addresses: BTreeMap::new(),
            alua: self.alua.clone(),
        }
    }

    /// Attachment target of the bonded metro remote
    fn metro_target(&self) -> Result<BlockTarget> {
        let remote = self.topology.metro_remote_name().ok_or_else(|| {
            Error::Configuration(format!("backend {} has no metro remote", self.base.name()))
        })?;
        self.topology
            .metro_remote()
            .and_then(|plugin| plugin.block_target())
            .ok_or_else(|| Error::BackendUnavailable {
                backend: remote.to_string(),
            })
    }

    fn dispatcher(&self) -> Result<MetroDispatcher> {
        let local = self.block_target().ok_or_else(|| {
            Error::Internal(format!("backend {} used before init", self.base.name()))
        })?;
        let remote = self
            .topology
            .metro_remote()
            .and_then(|plugin| plugin.block_target());
        Ok(MetroDispatcher::new(local, remote))
    }

    async fn dispatch(
        &self,
        ctx: &RequestContext,
        name: &str,
        params: &Parameters,
        kind: OperationKind,
    ) -> Result<OperationOutcome> {
        let request = OperationRequest::new(object_name(name), params.clone(), kind);
        let result = match self.dispatcher() {
            Ok(dispatcher) => dispatcher.dispatch(ctx, &request).await,
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            metrics::record_operation_failure(self.base.name(), kind.as_str());
            Error::operation(self.base.name(), kind.as_str(), name, e)
        })
    }

    fn wrap<T>(&self, operation: &str, volume: &str, result: Result<T>) -> Result<T> {
        result.map_err(|e| {
            metrics::record_operation_failure(self.base.name(), operation);
            Error::operation(self.base.name(), operation, volume, e)
        })
    }

    fn unexpected(&self, kind: OperationKind, volume: &str, outcome: &OperationOutcome) -> Error {
        Error::OperationFailed {
            backend: self.base.name().to_string(),
            operation: kind.to_string(),
            volume: volume.to_string(),
            reason: format!("dispatcher returned a {} result", outcome.kind()),
        }
    }

    // =========================================================================
    // Volume Lifecycle
    // =========================================================================

    async fn create(&self, ctx: &RequestContext, name: &str, params: &Parameters) -> Result<VolumeInfo> {
        let size = params.get_i64("size").ok_or_else(|| Error::InvalidParameter {
            name: "size".to_string(),
            reason: "must be provided".to_string(),
        })?;
        let capacity = aligned_capacity(size, SECTOR_SIZE)?;
        let pool = common::required_str(params, "storagepool")?;
        let hyper_metro = params.get_bool("hyperMetro").unwrap_or(false);

        let template = CreateVolumeRequest {
            name: object_name(name),
            pool_id: String::new(),
            capacity_sectors: capacity / SECTOR_SIZE,
            alloc_type: alloc_type(params)?,
            description: params.get_str("description").map(str::to_string),
            qos: common::qos(params)?,
        };

        // Fail before touching the local array when the pair can't be built
        let metro = if hyper_metro {
            let domain = self.metro_domain.clone().ok_or_else(|| {
                Error::Configuration(format!(
                    "backend {} has no hyperMetroDomain for HyperMetro volumes",
                    self.base.name()
                ))
            })?;
            Some((domain, self.metro_target()?))
        } else {
            None
        };

        let session = self.base.require_session()?;
        let (local, created) =
            ensure_volume(ctx, session, self.base.name(), pool, &template).await?;

        if let Some((domain, remote)) = metro {
            let remote_pool = params.get_str("remotestoragepool").unwrap_or(pool);
            let paired = self
                .create_metro_twin(ctx, &local, &template, &domain, &remote, remote_pool)
                .await;
            if let Err(e) = paired {
                error!(
                    "HyperMetro setup of volume {} on backend {} failed: {}",
                    template.name,
                    self.base.name(),
                    e
                );
                if created {
                    discard_volume(ctx, session, self.base.name(), &local).await;
                }
                return Err(e);
            }
        }

        Ok(VolumeInfo {
            name: template.name,
            id: local.id,
            wwn: Some(local.wwn),
            capacity_bytes: capacity,
            hyper_metro,
        })
    }

    async fn create_metro_twin(
        &self,
        ctx: &RequestContext,
        local: &VolumeDescriptor,
        template: &CreateVolumeRequest,
        domain: &str,
        remote: &BlockTarget,
        remote_pool: &str,
    ) -> Result<()> {
        let (remote_volume, remote_created) =
            ensure_volume(ctx, &remote.session, remote.backend(), remote_pool, template).await?;

        let session = self.base.require_session()?;
        let remote_id = &remote_volume.id;
        let pair = with_lease(session, |client| async move {
            let existing = ctx
                .run(
                    "query hypermetro pair",
                    client.get_hypermetro_pair_by_local_object_id(&local.id),
                )
                .await?;
            if let Some(pair) = existing {
                return Ok(pair);
            }
            let request = CreatePairRequest {
                local_volume_id: local.id.clone(),
                remote_volume_id: remote_id.clone(),
                domain: domain.to_string(),
            };
            ctx.run("create hypermetro pair", client.create_hypermetro_pair(&request))
                .await
        })
        .await;

        match pair {
            Ok(pair) => {
                info!(
                    "Created HyperMetro pair {} for volume {} between {} and {}",
                    pair.id,
                    template.name,
                    self.base.name(),
                    remote.backend()
                );
                Ok(())
            }
            Err(e) => {
                if remote_created {
                    discard_volume(ctx, &remote.session, remote.backend(), &remote_volume).await;
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        let lun_name = object_name(name);
        let backend = self.base.name();

        self.base
            .with_session(|client| async move {
                let volume = ctx
                    .run("query volume", client.get_volume_by_name(&lun_name))
                    .await?;
                let Some(volume) = volume else {
                    info!("Volume {} already absent from backend {}", lun_name, backend);
                    return Ok(());
                };

                if is_paired(&volume, backend) {
                    // The pair and the remote twin go first; both sides must be reachable
                    let remote = self.metro_target()?;
                    let pair = ctx
                        .run(
                            "query hypermetro pair",
                            client.get_hypermetro_pair_by_local_object_id(&volume.id),
                        )
                        .await?;
                    if let Some(pair) = pair {
                        ctx.run("delete hypermetro pair", client.delete_hypermetro_pair(&pair.id))
                            .await?;
                        info!("Deleted HyperMetro pair {} of volume {}", pair.id, lun_name);
                    }

                    let lun_name = &lun_name;
                    with_lease(&remote.session, |remote_client| async move {
                        let twin = ctx
                            .run("query volume", remote_client.get_volume_by_name(lun_name))
                            .await?;
                        if let Some(twin) = twin {
                            ctx.run("delete volume", remote_client.delete_volume(&twin.id))
                                .await?;
                        }
                        Ok(())
                    })
                    .await?;
                }

                ctx.run("delete volume", client.delete_volume(&volume.id))
                    .await?;
                info!("Deleted volume {} from backend {}", lun_name, backend);
                Ok(())
            })
            .await
    }

    async fn expand(&self, ctx: &RequestContext, name: &str, capacity_bytes: i64) -> Result<bool> {
        let capacity = aligned_capacity(capacity_bytes, SECTOR_SIZE)?;
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
                        reason: format!(
                            "shrinking {} from {} to {} bytes is not supported",
                            lun_name,
                            volume.capacity_sectors * SECTOR_SIZE,
                            capacity
                        ),
                    });
                }
                if sectors == volume.capacity_sectors {
                    return Ok(volume.exposed_to_host);
                }

                if is_paired(&volume, backend) {
                    let remote = self.metro_target()?;
                    let remote_backend = remote.backend();
                    let lun_name = &lun_name;
                    with_lease(&remote.session, |remote_client| async move {
                        let twin = ctx
                            .run("query volume", remote_client.get_volume_by_name(lun_name))
                            .await?
                            .ok_or_else(|| Error::VolumeNotFound {
                                backend: remote_backend.to_string(),
                                volume: lun_name.clone(),
                            })?;
                        ctx.run("expand volume", remote_client.expand_volume(&twin.id, sectors))
                            .await
                    })
                    .await?;
                }

                ctx.run("expand volume", client.expand_volume(&volume.id, sectors))
                    .await?;
                info!(
                    "Expanded volume {} on backend {} to {} bytes",
                    lun_name, backend, capacity
                );
                Ok(volume.exposed_to_host)
            })
            .await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn alloc_type(params: &Parameters) -> Result<AllocType> {
    match params.get_str("alloctype").map(str::to_ascii_lowercase).as_deref() {
        None | Some("thin") => Ok(AllocType::Thin),
        Some("thick") => Ok(AllocType::Thick),
        Some(other) => Err(Error::InvalidParameter {
            name: "alloctype".to_string(),
            reason: format!("{} is neither thin nor thick", other),
        }),
    }
}

fn is_paired(volume: &VolumeDescriptor, backend: &str) -> bool {
    volume.is_hypermetro().unwrap_or_else(|e| {
        warn!(
            "Unreadable relationship of volume {} on backend {}, treating as not paired: {}",
            volume.name, backend, e
        );
        false
    })
}

// =============================================================================
// BackendPlugin
// =============================================================================

#[async_trait]
impl BackendPlugin for SanPlugin {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn storage(&self) -> &'static str {
        Self::STORAGE
    }

    async fn init(&mut self, config: &BackendConfig, keep_login: bool) -> Result<()> {
        let parameters = SanParameters::parse(&config.parameters)?;
        self.base.init(config, keep_login).await?;

        if parameters.protocol.is_nvme() && !self.base.model().map_or(false, ArrayModel::supports_nvme) {
            self.base.shutdown().await;
            return Err(Error::Configuration(format!(
                "backend {} uses {} but array model {} has no NVMe-oF support",
                config.name,
                parameters.protocol,
                self.base
                    .model()
                    .map_or_else(|| "unknown".to_string(), ToString::to_string)
            )));
        }

        self.protocol = parameters.protocol;
        self.portals = parameters.portals;
        self.alua = parameters.alua;
        self.metro_domain = config.hyper_metro_domain.clone();
        Ok(())
    }

    async fn validate(&self, config: &BackendConfig) -> Result<()> {
        SanParameters::parse(&config.parameters)?;
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
            other => Err(self.unexpected(OperationKind::Attach, name, &other)),
        }
    }

    async fn detach_volume(
        &self,
        ctx: &RequestContext,
        name: &str,
        params: &Parameters,
    ) -> Result<()> {
        match self.dispatch(ctx, name, params, OperationKind::Detach).await? {
            OperationOutcome::Detached { .. } => Ok(()),
            other => Err(self.unexpected(OperationKind::Detach, name, &other)),
        }
    }

    async fn unstage_volume(
        &self,
        ctx: &RequestContext,
        name: &str,
        params: &Parameters,
    ) -> Result<DisconnectInfo> {
        match self.dispatch(ctx, name, params, OperationKind::Unstage).await? {
            OperationOutcome::Unstaged(info) => Ok(info),
            other => Err(self.unexpected(OperationKind::Unstage, name, &other)),
        }
    }

    async fn update_backend_capabilities(&self) -> Result<CapabilityReport> {
        let mut report = self.base.probe_capabilities().await?;

        let remote_online = self
            .topology
            .metro_remote()
            .map_or(false, |remote| remote.is_online());
        let caps = &mut report.capabilities;
        caps.support_metro = caps.support_metro && self.is_online() && remote_online;
        caps.support_replication =
            caps.support_replication && self.topology.replica_remote().is_some();

        if let Some(remote) = self.topology.metro_remote_name() {
            report
                .specifications
                .insert("MetroRemote".to_string(), remote.to_string());
        }
        Ok(report)
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
            spec: self.attacher_spec(),
            session: Arc::clone(session),
        })
    }

    fn check_metro_remote(&self, lookup: &Weak<dyn BackendLookup>, remote: &str) -> Result<()> {
        check_block_remote(lookup, self.base.name(), remote)?;
        self.topology.check_metro(self.base.name(), remote)
    }

    fn check_replica_remote(&self, lookup: &Weak<dyn BackendLookup>, remote: &str) -> Result<()> {
        check_block_remote(lookup, self.base.name(), remote)?;
        self.topology.check_replica(self.base.name(), remote)
    }

    fn bond_metro_remote(&self, lookup: Weak<dyn BackendLookup>, remote: &str) -> Result<()> {
        check_block_remote(&lookup, self.base.name(), remote)?;
        self.topology.bond_metro(self.base.name(), lookup, remote)
    }

    fn bond_replica_remote(&self, lookup: Weak<dyn BackendLookup>, remote: &str) -> Result<()> {
        check_block_remote(&lookup, self.base.name(), remote)?;
        self.topology.bond_replica(self.base.name(), lookup, remote)
    }

    async fn shutdown(&self) {
        self.base.shutdown().await;
    }
}

/// A remote must be a registered centralized SAN backend
fn check_block_remote(lookup: &Weak<dyn BackendLookup>, owner: &str, remote: &str) -> Result<()> {
    let plugin = lookup
        .upgrade()
        .and_then(|lookup| lookup.lookup(remote))
        .ok_or_else(|| Error::BackendNotFound {
            backend: remote.to_string(),
        })?;
    if plugin.storage() != SanPlugin::STORAGE {
        return Err(Error::Configuration(format!(
            "backend {} can't pair with {} backend {}",
            owner,
            plugin.storage(),
            remote
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{SimulatedArray, SimulatedClientFactory};
    use assert_matches::assert_matches;
    use serde_json::{json, Value};

    const URL: &str = "https://array-a:8088";

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap_or_default()
    }

    fn setup(model: ArrayModel) -> (Arc<SimulatedArray>, SanPlugin, BackendConfig) {
        let array = SimulatedArray::new("SN-A", model);
        array.add_pool("pool0", 1 << 40, 1 << 40);
        let factory = SimulatedClientFactory::new();
        factory.add_array(URL, Arc::clone(&array));

        let config = BackendConfig::new("san-a", SanPlugin::STORAGE, URL)
            .with_pools(&["pool0"])
            .with_parameter("protocol", json!("iscsi"))
            .with_parameter("portals", json!(["192.168.1.10"]));
        (array, SanPlugin::new(Arc::new(factory)), config)
    }

    #[tokio::test]
    async fn test_init_requires_portals_for_iscsi() {
        let (_array, mut plugin, config) = setup(ArrayModel::DoradoV6);
        let mut config = config;
        config.parameters.remove("portals");
        assert_matches!(
            plugin.init(&config, true).await,
            Err(Error::InvalidParameter { name, .. }) if name == "portals"
        );
    }

    #[tokio::test]
    async fn test_nvme_needs_capable_model() {
        let (array, mut plugin, config) = setup(ArrayModel::V5);
        let config = config.with_parameter("protocol", json!("roce"));
        assert_matches!(plugin.init(&config, true).await, Err(Error::Configuration(_)));
        assert_eq!(array.login_count(), array.logout_count());
        assert!(!plugin.is_online());
    }

    #[tokio::test]
    async fn test_volume_lifecycle() {
        let (array, mut plugin, config) = setup(ArrayModel::DoradoV6);
        plugin.init(&config, true).await.unwrap();
        let ctx = RequestContext::default();

        let info = plugin
            .create_volume(
                &ctx,
                "pvc-1",
                &params(json!({"size": 1 << 30, "storagepool": "pool0", "alloctype": "thick"})),
            )
            .await
            .unwrap();
        assert_eq!(info.capacity_bytes, 1 << 30);
        assert!(!info.hyper_metro);
        assert_eq!(array.volume("pvc-1").unwrap().capacity_sectors, (1 << 30) / 512);

        // Creating again reuses the volume
        let again = plugin
            .create_volume(&ctx, "pvc-1", &params(json!({"size": 1 << 30, "storagepool": "pool0"})))
            .await
            .unwrap();
        assert_eq!(again.id, info.id);

        assert!(!plugin.expand_volume(&ctx, "pvc-1", 2 << 30).await.unwrap());
        assert_matches!(
            plugin.expand_volume(&ctx, "pvc-1", 1 << 30).await,
            Err(Error::Operation { source, .. }) if matches!(*source, Error::InvalidParameter { .. })
        );

        plugin.delete_volume(&ctx, "pvc-1").await.unwrap();
        assert!(array.volume("pvc-1").is_none());
        plugin.delete_volume(&ctx, "pvc-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_rejects_bad_parameters() {
        let (_array, mut plugin, config) = setup(ArrayModel::DoradoV6);
        plugin.init(&config, true).await.unwrap();
        let ctx = RequestContext::default();

        let res = plugin
            .create_volume(&ctx, "pvc-1", &params(json!({"size": 1000, "storagepool": "pool0"})))
            .await;
        assert_matches!(res.map_err(|e| e.kind()), Err(crate::error::ErrorKind::Configuration));

        let res = plugin
            .create_volume(&ctx, "pvc-1", &params(json!({"size": 4096, "storagepool": "missing"})))
            .await;
        assert!(res.unwrap_err().is_not_found());

        let res = plugin
            .create_volume(
                &ctx,
                "pvc-1",
                &params(json!({"size": 4096, "storagepool": "pool0", "hyperMetro": true})),
            )
            .await;
        assert_matches!(res.map_err(|e| e.kind()), Err(crate::error::ErrorKind::Configuration));
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle() {
        let (array, mut plugin, config) = setup(ArrayModel::DoradoV6);
        plugin.init(&config, true).await.unwrap();
        array.add_volume("pvc-1", 2048);
        let ctx = RequestContext::default();

        let snap = plugin.create_snapshot(&ctx, "pvc-1", "snap-1").await.unwrap();
        assert_eq!(snap.size_bytes, 2048 * 512);
        let again = plugin.create_snapshot(&ctx, "pvc-1", "snap-1").await.unwrap();
        assert_eq!(again.id, snap.id);

        plugin.delete_snapshot(&ctx, "snap-1").await.unwrap();
        assert!(array.snapshot("snap-1").is_none());
        plugin.delete_snapshot(&ctx, "snap-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_and_detach_single_array() {
        let (array, mut plugin, config) = setup(ArrayModel::DoradoV6);
        plugin.init(&config, true).await.unwrap();
        array.add_volume("pvc-1", 2048);
        let ctx = RequestContext::default();
        let node = params(json!({"HostName": "node-1", "iSCSIInitiator": "iqn.1994-05.node-1"}));

        let mapping = plugin.attach_volume(&ctx, "pvc-1", &node).await.unwrap();
        assert_eq!(mapping.protocol, Protocol::Iscsi);
        assert_eq!(mapping.target_portals, vec!["192.168.1.10".to_string()]);
        assert!(array.is_mapped("pvc-1", "node-1"));

        plugin.detach_volume(&ctx, "pvc-1", &node).await.unwrap();
        assert!(!array.is_mapped("pvc-1", "node-1"));

        // Missing volume: detach succeeds, attach fails
        plugin.detach_volume(&ctx, "pvc-2", &node).await.unwrap();
        let res = plugin.attach_volume(&ctx, "pvc-2", &node).await;
        assert!(res.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_capabilities_without_remote() {
        let (_array, mut plugin, config) = setup(ArrayModel::DoradoV6);
        plugin.init(&config, true).await.unwrap();

        let report = plugin.update_backend_capabilities().await.unwrap();
        assert!(report.capabilities.support_thin);
        assert!(!report.capabilities.support_metro);
        assert!(!report.capabilities.support_replication);
        assert_eq!(report.specifications["LocalDeviceSN"], "SN-A");

        let pools = plugin
            .update_pool_capabilities(&["pool0".to_string(), "gone".to_string()])
            .await
            .unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools["pool0"].total_capacity, 1 << 40);
    }

    #[tokio::test]
    async fn test_failed_refresh_marks_offline() {
        let (array, mut plugin, config) = setup(ArrayModel::DoradoV6);
        plugin.init(&config, true).await.unwrap();
        assert!(plugin.is_online());

        array.set_fail_queries(true);
        assert!(plugin.update_backend_capabilities().await.is_err());
        assert!(!plugin.is_online());

        array.set_fail_queries(false);
        plugin.update_backend_capabilities().await.unwrap();
        assert!(plugin.is_online());
    }
}
