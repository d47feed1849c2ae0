//! NAS dtree plugin
//!
//! Each volume is a quota-limited directory tree under a parent file system,
//! exported over NFS through a single logical port. Host mapping happens on
//! the export itself, so detach and unstage have nothing to do on the array.

use super::common::{self, ArrayBase};
use crate::backend::naming::object_name;
use crate::backend::session::ArraySession;
use crate::config::BackendConfig;
use crate::domain::*;
use crate::error::{Error, Result};
use crate::metrics;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct DtreePlugin {
    base: ArrayBase,
    portal: String,
    parent_name: String,
}

impl DtreePlugin {
    pub const STORAGE: &'static str = "oceanstor-dtree";

    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            base: ArrayBase::new(Self::STORAGE, factory),
            portal: String::new(),
            parent_name: String::new(),
        }
    }

    pub fn construct(factory: Arc<dyn ClientFactory>) -> Box<dyn BackendPlugin> {
        Box::new(Self::new(factory))
    }

    fn parse(params: &Parameters) -> Result<(String, String)> {
        common::required_protocol(params, &[Protocol::Nfs])?;
        let portals = common::ip_portals(params)?;
        if portals.len() != 1 {
            return Err(Error::InvalidParameter {
                name: "portals".to_string(),
                reason: format!("nfs takes exactly one portal, got {}", portals.len()),
            });
        }
        let parent = common::required_str(params, "parentname")?;
        Ok((portals[0].clone(), parent.to_string()))
    }

    fn export_path(&self, dtree: &str) -> String {
        format!("/{}/{}", self.parent_name, dtree)
    }

    fn wrap<T>(&self, operation: &str, volume: &str, result: Result<T>) -> Result<T> {
        result.map_err(|e| {
            metrics::record_operation_failure(self.base.name(), operation);
            Error::operation(self.base.name(), operation, volume, e)
        })
    }

    async fn create(&self, ctx: &RequestContext, name: &str, params: &Parameters) -> Result<VolumeInfo> {
        let size = params.get_i64("size").ok_or_else(|| Error::InvalidParameter {
            name: "size".to_string(),
            reason: "must be provided".to_string(),
        })?;
        let quota = aligned_capacity(size, 1)?;
        let dtree_name = object_name(name);
        let parent = self.parent_name.as_str();
        let backend = self.base.name();

        let dtree = self
            .base
            .with_session(|client| async move {
                let existing = ctx
                    .run("query dtree", client.get_dtree(parent, &dtree_name))
                    .await?;
                if let Some(existing) = existing {
                    info!("Dtree {}/{} already exists on backend {}", parent, dtree_name, backend);
                    return Ok(existing);
                }
                let dtree = ctx
                    .run("create dtree", client.create_dtree(parent, &dtree_name, quota))
                    .await?;
                info!(
                    "Created dtree {}/{} with quota {} on backend {}",
                    parent, dtree_name, quota, backend
                );
                Ok(dtree)
            })
            .await?;

        Ok(VolumeInfo {
            name: dtree.name,
            id: dtree.id,
            wwn: None,
            capacity_bytes: dtree.quota_bytes,
            hyper_metro: false,
        })
    }

    async fn delete(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        let dtree_name = object_name(name);
        let parent = self.parent_name.as_str();
        let backend = self.base.name();

        self.base
            .with_session(|client| async move {
                let existing = ctx
                    .run("query dtree", client.get_dtree(parent, &dtree_name))
                    .await?;
                if existing.is_none() {
                    info!("Dtree {}/{} already absent from backend {}", parent, dtree_name, backend);
                    return Ok(());
                }
                ctx.run("delete dtree", client.delete_dtree(parent, &dtree_name))
                    .await?;
                info!("Deleted dtree {}/{} from backend {}", parent, dtree_name, backend);
                Ok(())
            })
            .await
    }

    async fn expand(&self, ctx: &RequestContext, name: &str, capacity_bytes: i64) -> Result<bool> {
        let quota = aligned_capacity(capacity_bytes, 1)?;
        let dtree_name = object_name(name);
        let parent = self.parent_name.as_str();
        let backend = self.base.name();

        self.base
            .with_session(|client| async move {
                let dtree = ctx
                    .run("query dtree", client.get_dtree(parent, &dtree_name))
                    .await?
                    .ok_or_else(|| Error::VolumeNotFound {
                        backend: backend.to_string(),
                        volume: dtree_name.clone(),
                    })?;
                if quota < dtree.quota_bytes {
                    return Err(Error::InvalidParameter {
                        name: "capacity".to_string(),
                        reason: format!(
                            "shrinking quota of {} from {} to {} bytes is not supported",
                            dtree_name, dtree.quota_bytes, quota
                        ),
                    });
                }
                if quota > dtree.quota_bytes {
                    ctx.run("set dtree quota", client.set_dtree_quota(parent, &dtree_name, quota))
                        .await?;
                    info!("Raised quota of dtree {}/{} to {}", parent, dtree_name, quota);
                }
                Ok(false)
            })
            .await
    }
}

#[async_trait]
impl BackendPlugin for DtreePlugin {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn storage(&self) -> &'static str {
        Self::STORAGE
    }

    async fn init(&mut self, config: &BackendConfig, keep_login: bool) -> Result<()> {
        let (portal, parent_name) = Self::parse(&config.parameters)?;
        self.base.init(config, keep_login).await?;
        self.portal = portal;
        self.parent_name = parent_name;
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
        _ctx: &RequestContext,
        volume: &str,
        _snapshot: &str,
    ) -> Result<SnapshotInfo> {
        Err(Error::NotSupported {
            backend: self.base.name().to_string(),
            operation: format!("snapshot of dtree {}", volume),
        })
    }

    async fn delete_snapshot(&self, _ctx: &RequestContext, snapshot: &str) -> Result<()> {
        Err(Error::NotSupported {
            backend: self.base.name().to_string(),
            operation: format!("delete of dtree snapshot {}", snapshot),
        })
    }

    async fn attach_volume(
        &self,
        ctx: &RequestContext,
        name: &str,
        _params: &Parameters,
    ) -> Result<MappingInfo> {
        let dtree_name = object_name(name);
        let parent = self.parent_name.as_str();
        let backend = self.base.name();

        let result = self
            .base
            .with_session(|client| async move {
                ctx.run("query dtree", client.get_dtree(parent, &dtree_name))
                    .await?
                    .ok_or_else(|| Error::VolumeNotFound {
                        backend: backend.to_string(),
                        volume: dtree_name.clone(),
                    })
            })
            .await;
        let dtree = self.wrap(OperationKind::Attach.as_str(), name, result)?;

        let mut mapping = MappingInfo::new(Protocol::Nfs);
        mapping.target_portals = vec![self.portal.clone()];
        mapping.export_path = Some(self.export_path(&dtree.name));
        Ok(mapping)
    }

    async fn detach_volume(
        &self,
        _ctx: &RequestContext,
        name: &str,
        _params: &Parameters,
    ) -> Result<()> {
        debug!("Detach of dtree {} needs no array work", name);
        Ok(())
    }

    async fn unstage_volume(
        &self,
        _ctx: &RequestContext,
        _name: &str,
        _params: &Parameters,
    ) -> Result<DisconnectInfo> {
        Ok(DisconnectInfo {
            protocol: Protocol::Nfs,
            lun_wwn: None,
        })
    }

    async fn update_backend_capabilities(&self) -> Result<CapabilityReport> {
        let mut report = self.base.probe_capabilities().await?;
        let nfs = self
            .base
            .with_session(|client| async move { client.get_nfs_service_setting().await })
            .await?;

        let caps = &mut report.capabilities;
        caps.support_label = false;
        caps.support_metro = false;
        caps.support_replication = false;
        caps.support_nfs3 = nfs.nfs3;
        caps.support_nfs4 = nfs.nfs4;
        caps.support_nfs41 = nfs.nfs41;
        Ok(report)
    }

    /// Dtrees draw on the parent file system, not a pool
    async fn update_pool_capabilities(
        &self,
        pool_names: &[String],
    ) -> Result<BTreeMap<String, PoolCapacity>> {
        Ok(pool_names
            .iter()
            .map(|name| (name.clone(), PoolCapacity::default()))
            .collect())
    }

    fn session(&self) -> Option<&Arc<ArraySession>> {
        self.base.session()
    }

    async fn shutdown(&self) {
        self.base.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{SimulatedArray, SimulatedClientFactory};
    use assert_matches::assert_matches;
    use serde_json::{json, Value};

    const URL: &str = "https://nas:8088";

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap_or_default()
    }

    fn setup() -> (Arc<SimulatedArray>, DtreePlugin, BackendConfig) {
        let array = SimulatedArray::new("SN-N", ArrayModel::DoradoV6);
        let factory = SimulatedClientFactory::new();
        factory.add_array(URL, Arc::clone(&array));
        let config = BackendConfig::new("nas-a", DtreePlugin::STORAGE, URL)
            .with_pools(&["fs0"])
            .with_parameter("protocol", json!("nfs"))
            .with_parameter("portals", json!(["10.1.0.5"]))
            .with_parameter("parentname", json!("fs0"));
        (array, DtreePlugin::new(Arc::new(factory)), config)
    }

    #[tokio::test]
    async fn test_init_checks_parameters() {
        let (_array, mut plugin, config) = setup();
        let two_portals = config
            .clone()
            .with_parameter("portals", json!(["10.1.0.5", "10.1.0.6"]));
        assert_matches!(
            plugin.init(&two_portals, true).await,
            Err(Error::InvalidParameter { name, .. }) if name == "portals"
        );

        let mut no_parent = config.clone();
        no_parent.parameters.remove("parentname");
        assert_matches!(
            plugin.init(&no_parent, true).await,
            Err(Error::InvalidParameter { name, .. }) if name == "parentname"
        );

        plugin.init(&config, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_dtree_lifecycle_and_export() {
        let (array, mut plugin, config) = setup();
        plugin.init(&config, true).await.unwrap();
        let ctx = RequestContext::default();

        let info = plugin
            .create_volume(&ctx, "pvc-9", &params(json!({"size": 10_i64 << 30})))
            .await
            .unwrap();
        assert_eq!(info.capacity_bytes, 10 << 30);
        assert!(info.wwn.is_none());

        let mapping = plugin
            .attach_volume(&ctx, "pvc-9", &params(json!({"HostName": "node-1"})))
            .await
            .unwrap();
        assert_eq!(mapping.export_path.as_deref(), Some("/fs0/pvc-9"));
        assert_eq!(mapping.target_portals, vec!["10.1.0.5".to_string()]);
        assert!(mapping.validate().is_ok());

        plugin.detach_volume(&ctx, "pvc-9", &Parameters::new()).await.unwrap();
        assert!(!plugin.expand_volume(&ctx, "pvc-9", 20 << 30).await.unwrap());
        assert_eq!(array.dtree("fs0", "pvc-9").unwrap().quota_bytes, 20 << 30);

        plugin.delete_volume(&ctx, "pvc-9").await.unwrap();
        assert!(array.dtree("fs0", "pvc-9").is_none());
        plugin.delete_volume(&ctx, "pvc-9").await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshots_unsupported() {
        let (_array, mut plugin, config) = setup();
        plugin.init(&config, true).await.unwrap();
        let ctx = RequestContext::default();
        assert_matches!(
            plugin.create_snapshot(&ctx, "pvc-9", "snap-1").await,
            Err(Error::NotSupported { .. })
        );
    }

    #[tokio::test]
    async fn test_capabilities_follow_nfs_service() {
        let (array, mut plugin, config) = setup();
        plugin.init(&config, true).await.unwrap();
        array.set_nfs_service(NfsServiceSetting {
            nfs3: false,
            nfs4: true,
            nfs41: true,
        });

        let report = plugin.update_backend_capabilities().await.unwrap();
        assert!(!report.capabilities.support_label);
        assert!(!report.capabilities.support_nfs3);
        assert!(report.capabilities.support_nfs41);

        let pools = plugin.update_pool_capabilities(&["fs0".to_string()]).await.unwrap();
        assert_eq!(pools["fs0"], PoolCapacity::default());
    }
}
