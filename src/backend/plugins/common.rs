//! Shared plugin plumbing
//!
//! Every plugin family owns an [`ArrayBase`]: the client factory it was
//! constructed with, the tracked session once initialized, and the system
//! identity read during init.

use crate::backend::naming::object_name;
use crate::backend::session::ArraySession;
use crate::config::BackendConfig;
use crate::domain::*;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use serde_json::Value;
use tracing::{error, info, warn};

pub(crate) struct ArrayBase {
    storage: &'static str,
    name: String,
    factory: Arc<dyn ClientFactory>,
    session: Option<Arc<ArraySession>>,
    system: Option<SystemInfo>,
}

impl ArrayBase {
    pub fn new(storage: &'static str, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            storage,
            name: String::new(),
            factory,
            session: None,
            system: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> Option<&Arc<ArraySession>> {
        self.session.as_ref()
    }

    fn tracked_session(&self) -> Result<&Arc<ArraySession>> {
        self.session.as_ref().ok_or_else(|| {
            Error::Internal(format!("backend {} used before init", self.name))
        })
    }

    pub fn model(&self) -> Option<&ArrayModel> {
        self.system.as_ref().map(|s| &s.model)
    }

    /// Open the tracked session and read the array identity
    pub async fn init(&mut self, config: &BackendConfig, keep_login: bool) -> Result<()> {
        config.validate()?;
        self.name = config.name.clone();

        let client = self.factory.new_client(&config.name, &config.client_config())?;
        let session = ArraySession::new(&config.name, client);

        let lease = session.acquire().await?;
        let system = lease.client().get_system().await;
        let system = match system {
            Ok(system) => system,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        if keep_login {
            lease.into_resident();
        } else {
            lease.release().await;
        }

        info!(
            "Initialized {} backend {} (model {}, SN {}, version {})",
            self.storage, config.name, system.model, system.serial_number, system.version
        );
        self.system = Some(system);
        self.session = Some(session);
        Ok(())
    }

    /// Probe login with a throwaway client, leaving the tracked session alone
    pub async fn validate_login(&self, config: &BackendConfig) -> Result<()> {
        config.validate()?;
        let client = self.factory.new_client(&config.name, &config.client_config())?;
        client.validate_login().await?;
        if let Err(e) = client.logout().await {
            warn!("Logout after validating backend {} failed: {}", config.name, e);
        }
        Ok(())
    }

    /// Run `f` with a client of the tracked session held for its duration
    pub async fn with_session<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn ArrayClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_lease(self.tracked_session()?, f).await
    }

    /// Tracked session, or an error before init
    pub fn require_session(&self) -> Result<&Arc<ArraySession>> {
        self.tracked_session()
    }

    /// Capabilities derived from the array's licensed features
    ///
    /// A failed probe marks the session offline.
    pub async fn probe_capabilities(&self) -> Result<CapabilityReport> {
        let session = self.tracked_session()?;
        let probe = self
            .with_session(|client| async move {
                let features = client.get_features().await?;
                let system = client.get_system().await?;
                Ok((features, system))
            })
            .await;

        let (features, system) = match probe {
            Ok(probe) => probe,
            Err(e) => {
                session.mark_offline().await;
                warn!("Capability refresh of backend {} failed: {}", self.name, e);
                return Err(e);
            }
        };

        let capabilities = Capabilities {
            support_thin: features.thin,
            support_thick: features.thick,
            support_qos: features.qos,
            support_metro: features.metro,
            support_replication: features.replication,
            support_clone: features.clone,
            support_application_type: features.application_type,
            ..Default::default()
        };
        Ok(CapabilityReport {
            capabilities,
            specifications: specifications(&system),
        })
    }

    /// Live capacity of the requested pools; unknown pools are skipped
    pub async fn pool_capacities(&self, pool_names: &[String]) -> Result<BTreeMap<String, PoolCapacity>> {
        let pools = self
            .with_session(|client| async move { client.get_all_pools().await })
            .await?;

        let mut capacities = BTreeMap::new();
        for name in pool_names {
            match pools.iter().find(|p| &p.name == name) {
                Some(pool) => {
                    capacities.insert(
                        name.clone(),
                        PoolCapacity {
                            free_capacity: pool.free_capacity_bytes,
                            total_capacity: pool.total_capacity_bytes,
                        },
                    );
                }
                None => warn!("Pool {} not found on backend {}", name, self.name),
            }
        }
        Ok(capacities)
    }

    /// Snapshot a volume; an existing snapshot of the same volume is reused
    pub async fn snapshot_volume(
        &self,
        ctx: &RequestContext,
        volume: &str,
        snapshot: &str,
    ) -> Result<SnapshotInfo> {
        let lun_name = object_name(volume);
        let snapshot_name = object_name(snapshot);
        let backend = self.name.as_str();

        self.with_session(|client| async move {
            let parent = ctx
                .run("query volume", client.get_volume_by_name(&lun_name))
                .await?
                .ok_or_else(|| Error::VolumeNotFound {
                    backend: backend.to_string(),
                    volume: lun_name.clone(),
                })?;

            let existing = ctx
                .run("query snapshot", client.get_snapshot_by_name(&snapshot_name))
                .await?;
            let snapshot = match existing {
                Some(existing) if existing.parent_id == parent.id => existing,
                Some(existing) => {
                    return Err(Error::InvalidParameter {
                        name: "snapshot".to_string(),
                        reason: format!(
                            "{} already exists on volume id {}",
                            snapshot_name, existing.parent_id
                        ),
                    })
                }
                None => {
                    ctx.run(
                        "create snapshot",
                        client.create_snapshot(&parent.id, &snapshot_name),
                    )
                    .await?
                }
            };

            Ok(SnapshotInfo {
                id: snapshot.id,
                name: snapshot.name,
                parent_id: snapshot.parent_id,
                size_bytes: snapshot.capacity_sectors * SECTOR_SIZE,
                creation_time: snapshot.created_at.timestamp(),
            })
        })
        .await
    }

    /// Delete a snapshot; an absent one counts as deleted
    pub async fn remove_snapshot(&self, ctx: &RequestContext, snapshot: &str) -> Result<()> {
        let snapshot_name = object_name(snapshot);
        let backend = self.name.as_str();

        self.with_session(|client| async move {
            let existing = ctx
                .run("query snapshot", client.get_snapshot_by_name(&snapshot_name))
                .await?;
            match existing {
                Some(existing) => {
                    ctx.run("delete snapshot", client.delete_snapshot(&existing.id))
                        .await?;
                    info!("Deleted snapshot {} from backend {}", snapshot_name, backend);
                }
                None => info!(
                    "Snapshot {} already absent from backend {}",
                    snapshot_name, backend
                ),
            }
            Ok(())
        })
        .await
    }

    pub async fn shutdown(&self) {
        if let Some(session) = &self.session {
            session.terminate().await;
        }
    }
}

/// Run `f` with a client of `session` held for its duration
pub(crate) async fn with_lease<T, F, Fut>(session: &Arc<ArraySession>, f: F) -> Result<T>
where
    F: FnOnce(Arc<dyn ArrayClient>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lease = session.acquire().await?;
    let result = f(Arc::clone(lease.client())).await;
    lease.release().await;
    result
}

/// Create the volume from `template` in `pool`, reusing one of the same name
///
/// Returns the volume and whether this call created it.
pub(crate) async fn ensure_volume(
    ctx: &RequestContext,
    session: &Arc<ArraySession>,
    backend: &str,
    pool: &str,
    template: &CreateVolumeRequest,
) -> Result<(VolumeDescriptor, bool)> {
    with_lease(session, |client| async move {
        let existing = ctx
            .run("query volume", client.get_volume_by_name(&template.name))
            .await?;
        if let Some(existing) = existing {
            info!("Volume {} already exists on backend {}", template.name, backend);
            return Ok((existing, false));
        }

        let pool = ctx
            .run("query pool", client.get_pool_by_name(pool))
            .await?
            .ok_or_else(|| Error::PoolNotFound {
                backend: backend.to_string(),
                pool: pool.to_string(),
            })?;
        let request = CreateVolumeRequest {
            pool_id: pool.id,
            ..template.clone()
        };
        let volume = ctx.run("create volume", client.create_volume(&request)).await?;
        info!(
            "Created volume {} ({} sectors) in pool {} on backend {}",
            volume.name, volume.capacity_sectors, pool.name, backend
        );
        Ok((volume, true))
    })
    .await
}

/// Best-effort removal of a volume created earlier in a failed request
pub(crate) async fn discard_volume(
    ctx: &RequestContext,
    session: &Arc<ArraySession>,
    backend: &str,
    volume: &VolumeDescriptor,
) {
    let removed = with_lease(session, |client| async move {
        ctx.run("delete volume", client.delete_volume(&volume.id)).await
    })
    .await;
    match removed {
        Ok(()) => info!("Rolled back volume {} on backend {}", volume.name, backend),
        Err(e) => error!(
            "Rollback of volume {} on backend {} failed, remove it manually: {}",
            volume.name, backend, e
        ),
    }
}

/// QoS policy, given either as an object or as its JSON text
pub(crate) fn qos(params: &Parameters) -> Result<Option<Parameters>> {
    let invalid = |reason: String| Error::InvalidParameter {
        name: "qos".to_string(),
        reason,
    };
    match params.get("qos") {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(Value::String(raw)) if raw.trim().is_empty() => Ok(None),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(_) => Err(invalid("must be a JSON object".to_string())),
            Err(e) => Err(invalid(e.to_string())),
        },
        Some(_) => Err(invalid("must be a JSON object".to_string())),
    }
}

pub(crate) fn specifications(system: &SystemInfo) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("LocalDeviceSN".to_string(), system.serial_number.clone()),
        ("ArrayModel".to_string(), system.model.to_string()),
        ("Version".to_string(), system.version.clone()),
    ])
}

// =============================================================================
// Parameter Parsing
// =============================================================================

pub(crate) fn required_protocol(params: &Parameters, allowed: &[Protocol]) -> Result<Protocol> {
    let raw = params.get_str("protocol").ok_or_else(|| Error::InvalidParameter {
        name: "protocol".to_string(),
        reason: "must be provided".to_string(),
    })?;
    let protocol: Protocol = raw.parse()?;
    if !allowed.contains(&protocol) {
        let allowed: Vec<&str> = allowed.iter().map(Protocol::as_str).collect();
        return Err(Error::InvalidParameter {
            name: "protocol".to_string(),
            reason: format!("{} is not one of {}", protocol, allowed.join(", ")),
        });
    }
    Ok(protocol)
}

/// Portal list of IP addresses
pub(crate) fn ip_portals(params: &Parameters) -> Result<Vec<String>> {
    let portals = params.get_str_list("portals").unwrap_or_default();
    if portals.is_empty() {
        return Err(Error::InvalidParameter {
            name: "portals".to_string(),
            reason: "must be provided".to_string(),
        });
    }
    for portal in &portals {
        check_ip(portal)?;
    }
    Ok(portals)
}

pub(crate) fn check_ip(addr: &str) -> Result<()> {
    addr.parse::<IpAddr>().map(|_| ()).map_err(|_| Error::InvalidParameter {
        name: "portals".to_string(),
        reason: format!("{} is not a valid IP address", addr),
    })
}

pub(crate) fn required_str<'a>(params: &'a Parameters, key: &str) -> Result<&'a str> {
    params
        .get_str(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::InvalidParameter {
            name: key.to_string(),
            reason: "must be provided".to_string(),
        })
}
