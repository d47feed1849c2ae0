//! HyperMetro-Aware Dispatch
//!
//! For every attach/detach/unstage the dispatcher:
//!
//! 1. acquires the local session and, when a metro remote is bonded, the
//!    remote session;
//! 2. fetches the volume from whichever side is reachable and reads its
//!    HyperMetro relationship;
//! 3. picks a strategy from the relationship and each side's reachability;
//! 4. for dual-array runs, re-fetches the pair and checks its running status;
//! 5. releases every lease it took, whatever the outcome.

use super::BlockTarget;
use crate::attach::{validate_outcome, HostAttacher, MetroAttacher};
use crate::backend::session::SessionLease;
use crate::domain::*;
use crate::error::{Error, Result};
use crate::metrics;
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Strategy Selection
// =============================================================================

/// Where an operation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Local array only; `degraded` when the volume is paired but the remote
    /// side is unusable
    Local { degraded: bool },
    /// Both arrays of the pair
    DualArray,
    /// Remote array only, local side unusable
    Remote,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Local { degraded: false } => "local",
            Strategy::Local { degraded: true } => "local-degraded",
            Strategy::DualArray => "dual-array",
            Strategy::Remote => "remote",
        }
    }
}

/// Live reachability of both sides at dispatch time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reachability {
    pub local: bool,
    /// `None` when no metro remote is bonded
    pub remote: Option<bool>,
}

/// Choose a strategy; `None` means neither side is usable
pub fn select_strategy(is_metro: bool, reach: Reachability) -> Option<Strategy> {
    if !is_metro {
        return Some(Strategy::Local { degraded: false });
    }

    let remote = reach.remote.unwrap_or(false);
    match (reach.local, remote) {
        (true, true) => Some(Strategy::DualArray),
        (true, false) => Some(Strategy::Local { degraded: true }),
        (false, true) => Some(Strategy::Remote),
        (false, false) => None,
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Leases taken for one dispatch
struct Leases {
    local: Option<SessionLease>,
    remote: Option<SessionLease>,
}

impl Leases {
    async fn release(self) {
        if let Some(lease) = self.local {
            lease.release().await;
        }
        if let Some(lease) = self.remote {
            lease.release().await;
        }
    }
}

/// Routes operations for one local backend and its optional metro remote
pub struct MetroDispatcher {
    local: BlockTarget,
    remote: Option<BlockTarget>,
}

impl MetroDispatcher {
    pub fn new(local: BlockTarget, remote: Option<BlockTarget>) -> Self {
        Self { local, remote }
    }

    fn local_name(&self) -> &str {
        &self.local.spec.backend
    }

    fn remote_name(&self) -> &str {
        self.remote
            .as_ref()
            .map_or("<none>", |remote| remote.spec.backend.as_str())
    }

    /// Run one operation end to end
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        request: &OperationRequest,
    ) -> Result<OperationOutcome> {
        let leases = self.acquire_sessions().await?;
        let result = self.dispatch_with(&leases, ctx, request).await;
        leases.release().await;

        let outcome = result?;
        validate_outcome(self.local_name(), request, outcome)
    }

    async fn acquire_sessions(&self) -> Result<Leases> {
        let local = self.local.session.acquire().await;
        let remote = match &self.remote {
            Some(target) => Some(target.session.acquire().await),
            None => None,
        };

        match (local, remote) {
            (Ok(local), None) => Ok(Leases {
                local: Some(local),
                remote: None,
            }),
            (Err(e), None) => Err(e),
            (Ok(local), Some(Ok(remote))) => Ok(Leases {
                local: Some(local),
                remote: Some(remote),
            }),
            (Ok(local), Some(Err(e))) => {
                warn!(
                    "Metro remote {} of backend {} unreachable: {}",
                    self.remote_name(),
                    self.local_name(),
                    e
                );
                Ok(Leases {
                    local: Some(local),
                    remote: None,
                })
            }
            (Err(e), Some(Ok(remote))) => {
                warn!("Local backend {} unreachable: {}", self.local_name(), e);
                Ok(Leases {
                    local: None,
                    remote: Some(remote),
                })
            }
            (Err(local_err), Some(Err(remote_err))) => {
                warn!(
                    "Backend {} ({}) and metro remote {} ({}) both unreachable",
                    self.local_name(),
                    local_err,
                    self.remote_name(),
                    remote_err
                );
                Err(self.both_unavailable())
            }
        }
    }

    fn both_unavailable(&self) -> Error {
        Error::BothArraysUnavailable {
            local: self.local_name().to_string(),
            remote: self.remote_name().to_string(),
        }
    }

    async fn dispatch_with(
        &self,
        leases: &Leases,
        ctx: &RequestContext,
        request: &OperationRequest,
    ) -> Result<OperationOutcome> {
        let reach = Reachability {
            local: leases.local.is_some(),
            remote: self.remote.as_ref().map(|_| leases.remote.is_some()),
        };

        let (lookup_backend, lookup_client) = match (&leases.local, &leases.remote) {
            (Some(lease), _) => (self.local_name(), lease.client()),
            (None, Some(lease)) => (self.remote_name(), lease.client()),
            (None, None) => return Err(self.both_unavailable()),
        };

        let volume = ctx
            .run("query volume", lookup_client.get_volume_by_name(&request.volume))
            .await?;
        let Some(volume) = volume else {
            // Only the owning array may report a volume absent
            if leases.local.is_none() {
                warn!(
                    "Volume {} not found on metro remote {} while backend {} is unreachable",
                    request.volume,
                    self.remote_name(),
                    self.local_name()
                );
                return Err(Error::BackendUnavailable {
                    backend: self.local_name().to_string(),
                });
            }
            return self.missing_volume(request, lookup_backend);
        };

        let is_metro = match volume.is_hypermetro() {
            Ok(is_metro) => is_metro,
            Err(e) => {
                warn!(
                    "Unreadable relationship of volume {} on backend {}, treating as not paired: {}",
                    request.volume, lookup_backend, e
                );
                false
            }
        };

        let strategy = select_strategy(is_metro, reach).ok_or_else(|| self.both_unavailable())?;
        metrics::record_strategy(request.kind.as_str(), strategy.as_str());
        debug!(
            "Dispatching {} of {} on backend {} with {} strategy",
            request.kind,
            request.volume,
            self.local_name(),
            strategy.as_str()
        );

        match strategy {
            Strategy::Local { degraded } => {
                let lease = leases.local.as_ref().ok_or_else(|| Error::BackendUnavailable {
                    backend: self.local_name().to_string(),
                })?;
                if degraded {
                    warn!(
                        "HyperMetro volume {} is degraded, remote {} unusable; running {} on local backend {} only",
                        request.volume,
                        self.remote_name(),
                        request.kind,
                        self.local_name()
                    );
                }
                let attacher = HostAttacher::new(self.local.spec.clone(), Arc::clone(lease.client()));
                request
                    .kind
                    .execute(&attacher, ctx, &request.volume, &request.parameters)
                    .await
            }
            Strategy::Remote => {
                let (Some(target), Some(lease)) = (&self.remote, &leases.remote) else {
                    return Err(self.both_unavailable());
                };
                warn!(
                    "HyperMetro volume {} is degraded, local backend {} unusable; running {} on remote {} only",
                    request.volume,
                    self.local_name(),
                    request.kind,
                    self.remote_name()
                );
                let attacher = HostAttacher::new(target.spec.clone(), Arc::clone(lease.client()));
                request
                    .kind
                    .execute(&attacher, ctx, &request.volume, &request.parameters)
                    .await
            }
            Strategy::DualArray => self.run_dual(leases, ctx, request, &volume).await,
        }
    }

    fn missing_volume(
        &self,
        request: &OperationRequest,
        backend: &str,
    ) -> Result<OperationOutcome> {
        match request.kind {
            OperationKind::Attach => Err(Error::VolumeNotFound {
                backend: backend.to_string(),
                volume: request.volume.clone(),
            }),
            OperationKind::Detach => {
                warn!(
                    "Volume {} not found on backend {}, treating detach as done",
                    request.volume, backend
                );
                Ok(OperationOutcome::Detached { lun_wwn: None })
            }
            OperationKind::Unstage => {
                warn!(
                    "Volume {} not found on backend {}, treating unstage as done",
                    request.volume, backend
                );
                Ok(OperationOutcome::Unstaged(DisconnectInfo {
                    protocol: self.local.spec.protocol,
                    lun_wwn: None,
                }))
            }
        }
    }

    async fn run_dual(
        &self,
        leases: &Leases,
        ctx: &RequestContext,
        request: &OperationRequest,
        volume: &VolumeDescriptor,
    ) -> Result<OperationOutcome> {
        let (Some(local_lease), Some(remote_lease), Some(remote_target)) =
            (&leases.local, &leases.remote, &self.remote)
        else {
            return Err(self.both_unavailable());
        };

        let pair = ctx
            .run(
                "query hypermetro pair",
                local_lease
                    .client()
                    .get_hypermetro_pair_by_local_object_id(&volume.id),
            )
            .await?
            .ok_or_else(|| Error::MetroPairMissing {
                backend: self.local_name().to_string(),
                volume: request.volume.clone(),
                volume_id: volume.id.clone(),
            })?;

        if !request.kind.accepts_pair_status(&pair.running_status) {
            warn!(
                "HyperMetro pair {} of volume {} is in running status {:?} (code {}), continuing {}",
                pair.id,
                request.volume,
                pair.running_status,
                pair.running_status.code(),
                request.kind
            );
        }
        if pair.health_status == PairHealthStatus::Faulty {
            warn!(
                "HyperMetro pair {} of volume {} reports faulty health",
                pair.id, request.volume
            );
        }

        let metro = MetroAttacher::new(
            Box::new(HostAttacher::new(
                self.local.spec.clone(),
                Arc::clone(local_lease.client()),
            )),
            Box::new(HostAttacher::new(
                remote_target.spec.clone(),
                Arc::clone(remote_lease.client()),
            )),
        );
        request
            .kind
            .execute(&metro, ctx, &request.volume, &request.parameters)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reach(local: bool, remote: Option<bool>) -> Reachability {
        Reachability { local, remote }
    }

    #[test]
    fn test_non_metro_always_local() {
        for r in [
            reach(true, None),
            reach(false, None),
            reach(true, Some(false)),
            reach(false, Some(true)),
        ] {
            assert_eq!(
                select_strategy(false, r),
                Some(Strategy::Local { degraded: false })
            );
        }
    }

    #[test]
    fn test_metro_dispatch_table() {
        assert_eq!(
            select_strategy(true, reach(true, Some(true))),
            Some(Strategy::DualArray)
        );
        assert_eq!(
            select_strategy(true, reach(true, Some(false))),
            Some(Strategy::Local { degraded: true })
        );
        assert_eq!(
            select_strategy(true, reach(true, None)),
            Some(Strategy::Local { degraded: true })
        );
        assert_eq!(
            select_strategy(true, reach(false, Some(true))),
            Some(Strategy::Remote)
        );
        assert_eq!(select_strategy(true, reach(false, Some(false))), None);
        assert_eq!(select_strategy(true, reach(false, None)), None);
    }

    #[test]
    fn test_strategy_labels() {
        assert_eq!(Strategy::Local { degraded: true }.as_str(), "local-degraded");
        assert_eq!(Strategy::DualArray.as_str(), "dual-array");
    }
}
