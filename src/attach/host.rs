//! Single-Array Host Attacher
//!
//! Maps and unmaps a LUN to the requesting node's host object on one array.
//! Built fresh for every call from the backend's [`AttacherSpec`] and the
//! client of the session the dispatcher holds.

use super::AttacherSpec;
use crate::domain::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Node Context
// =============================================================================

/// Requesting node identity carried in the operation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContext {
    pub host_name: String,
    pub iscsi_initiator: Option<String>,
    pub fc_initiators: Vec<String>,
    pub nvme_initiator: Option<String>,
}

impl NodeContext {
    pub fn from_params(params: &Parameters) -> Result<Self> {
        let host_name = params
            .get_str("HostName")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidParameter {
                name: "HostName".to_string(),
                reason: "attach parameters carry no node host name".to_string(),
            })?;

        Ok(Self {
            host_name: host_name.to_string(),
            iscsi_initiator: params.get_str("iSCSIInitiator").map(str::to_string),
            fc_initiators: params.get_str_list("FCInitiators").unwrap_or_default(),
            nvme_initiator: params.get_str("NVMeInitiator").map(str::to_string),
        })
    }

    /// Initiators to register on the host object for the attacher protocol
    pub fn initiators_for(&self, spec: &AttacherSpec) -> Result<Vec<String>> {
        let initiators: Vec<String> = match spec.protocol {
            Protocol::Iscsi => self.iscsi_initiator.iter().cloned().collect(),
            Protocol::Fc => self.fc_initiators.clone(),
            Protocol::Roce | Protocol::FcNvme => self.nvme_initiator.iter().cloned().collect(),
            Protocol::Scsi => spec
                .host_addresses
                .get(&self.host_name)
                .cloned()
                .into_iter()
                .collect(),
            Protocol::Nfs => return Ok(Vec::new()),
        };

        if initiators.is_empty() {
            return Err(Error::Configuration(format!(
                "node {} has no {} initiator for backend {}",
                self.host_name, spec.protocol, spec.backend
            )));
        }
        Ok(initiators)
    }
}

// =============================================================================
// Host Attacher
// =============================================================================

pub struct HostAttacher {
    spec: AttacherSpec,
    client: Arc<dyn ArrayClient>,
}

impl HostAttacher {
    pub fn new(spec: AttacherSpec, client: Arc<dyn ArrayClient>) -> Self {
        Self { spec, client }
    }

    async fn find_volume(
        &self,
        ctx: &RequestContext,
        lun_name: &str,
    ) -> Result<Option<VolumeDescriptor>> {
        ctx.run("query volume", self.client.get_volume_by_name(lun_name))
            .await
    }
}

#[async_trait]
impl Attacher for HostAttacher {
    fn protocol(&self) -> Protocol {
        self.spec.protocol
    }

    async fn controller_attach(
        &self,
        ctx: &RequestContext,
        lun_name: &str,
        params: &Parameters,
    ) -> Result<MappingInfo> {
        let node = NodeContext::from_params(params)?;
        let initiators = node.initiators_for(&self.spec)?;
        let protocol = self.spec.protocol;

        let volume = self
            .find_volume(ctx, lun_name)
            .await?
            .ok_or_else(|| Error::VolumeNotFound {
                backend: self.spec.backend.clone(),
                volume: lun_name.to_string(),
            })?;

        let host = HostSpec {
            name: node.host_name.clone(),
            protocol,
            initiators: initiators.clone(),
            alua: self
                .spec
                .alua
                .as_ref()
                .and_then(|policy| policy.resolve(&node.host_name))
                .cloned(),
        };
        let host_id = ctx.run("create host", self.client.ensure_host(&host)).await?;
        let host_lun_id = ctx
            .run("map volume", self.client.map_volume(&host_id, &volume.id))
            .await?;
        let targets = ctx
            .run("query targets", self.client.get_targets(protocol, &initiators))
            .await?;

        debug!(
            "Mapped {} on backend {} to host {} as LUN {}",
            lun_name, self.spec.backend, node.host_name, host_lun_id
        );

        let mut mapping = MappingInfo::new(protocol);
        mapping.lun_wwn = Some(volume.wwn);
        mapping.host_lun_ids = vec![host_lun_id];
        if protocol.requires_portals() {
            mapping.target_portals = self.spec.portals.clone();
        }
        mapping.target_iqns = targets.iqns;
        mapping.target_wwns = targets.wwns;
        mapping.target_nqn = targets.nqn;
        Ok(mapping)
    }

    async fn controller_detach(
        &self,
        ctx: &RequestContext,
        lun_name: &str,
        params: &Parameters,
    ) -> Result<Option<String>> {
        let node = NodeContext::from_params(params)?;

        let Some(volume) = self.find_volume(ctx, lun_name).await? else {
            debug!(
                "Volume {} not on backend {}, nothing to unmap",
                lun_name, self.spec.backend
            );
            return Ok(None);
        };

        let host_id = ctx
            .run("query host", self.client.get_host_by_name(&node.host_name))
            .await?;
        if let Some(host_id) = host_id {
            ctx.run("unmap volume", self.client.unmap_volume(&host_id, &volume.id))
                .await?;
            debug!(
                "Unmapped {} on backend {} from host {}",
                lun_name, self.spec.backend, node.host_name
            );
        }
        Ok(Some(volume.wwn))
    }

    async fn node_unstage(
        &self,
        ctx: &RequestContext,
        lun_name: &str,
        _params: &Parameters,
    ) -> Result<DisconnectInfo> {
        let volume = self.find_volume(ctx, lun_name).await?;
        Ok(DisconnectInfo {
            protocol: self.spec.protocol,
            lun_wwn: volume.map(|v| v.wwn),
        })
    }
}
