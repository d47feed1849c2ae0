//! Backend Table
//!
//! All configured backends by name. The table owns plugin instances, wires
//! metro and replica bonds between them, refreshes capabilities, and offers
//! the orchestration-facing operations keyed by `<backend>.<volume>` ids.
//!
//! Teardown operations (delete, detach, unstage, snapshot delete) on a
//! backend that is no longer registered succeed with a warning, so an
//! orchestrator retrying after a backend was removed can make progress.

use super::events::{BackendEvent, BondKind};
use super::registry::PluginRegistry;
use crate::config::BackendConfig;
use crate::domain::*;
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Orchestrator-facing id of a volume or snapshot on a backend
pub fn volume_id(backend: &str, name: &str) -> String {
    format!("{}.{}", backend, name)
}

struct BackendEntry {
    config: Arc<BackendConfig>,
    plugin: Arc<dyn BackendPlugin>,
}

/// Outcome of one backend's capability refresh
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub name: String,
    pub storage: String,
    pub online: bool,
    pub report: Option<CapabilityReport>,
    pub pools: BTreeMap<String, PoolCapacity>,
    pub error: Option<String>,
}

pub struct BackendTable {
    registry: Arc<PluginRegistry>,
    backends: DashMap<String, BackendEntry>,
    /// Reachability seen by the last refresh
    last_online: DashMap<String, bool>,
    event_tx: broadcast::Sender<BackendEvent>,
}

impl BackendTable {
    pub fn new(registry: Arc<PluginRegistry>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            registry,
            backends: DashMap::new(),
            last_online: DashMap::new(),
            event_tx,
        })
    }

    /// Subscribe to backend events
    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.event_tx.subscribe()
    }

    fn emit_event(&self, event: BackendEvent) {
        let _ = self.event_tx.send(event);
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Build, initialize (keeping the login) and register a backend
    pub async fn register(&self, config: BackendConfig) -> Result<()> {
        config.validate()?;
        if self.backends.contains_key(&config.name) {
            return Err(Error::BackendAlreadyRegistered {
                backend: config.name.clone(),
            });
        }

        let mut plugin = self.registry.new_plugin(&config.storage)?;
        plugin.init(&config, true).await?;
        let plugin: Arc<dyn BackendPlugin> = Arc::from(plugin);
        let name = config.name.clone();
        let storage = config.storage.clone();

        let inserted = match self.backends.entry(name.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(BackendEntry {
                    config: Arc::new(config),
                    plugin: Arc::clone(&plugin),
                });
                true
            }
        };
        if !inserted {
            plugin.shutdown().await;
            return Err(Error::BackendAlreadyRegistered { backend: name });
        }

        self.last_online.insert(name.clone(), plugin.is_online());
        info!("Registered {} backend {}", storage, name);
        self.emit_event(BackendEvent::BackendRegistered {
            backend: name,
            storage,
        });
        Ok(())
    }

    /// Check a configuration against its array without registering it
    pub async fn validate(&self, config: &BackendConfig) -> Result<()> {
        config.validate()?;
        let plugin = self.registry.new_plugin(&config.storage)?;
        plugin.validate(config).await
    }

    /// Bond every configured metro and replica remote, in both directions
    pub fn bond_topology(self: &Arc<Self>) -> Result<()> {
        let lookup: Weak<dyn BackendLookup> = Arc::downgrade(self) as Weak<dyn BackendLookup>;
        let configs: Vec<Arc<BackendConfig>> = self
            .backends
            .iter()
            .map(|entry| Arc::clone(&entry.value().config))
            .collect();

        let mut bonded = BTreeSet::new();
        for config in configs {
            let bonds = [
                (BondKind::Metro, config.metro_backend.as_deref()),
                (BondKind::Replica, config.replica_backend.as_deref()),
            ];
            for (kind, remote) in bonds {
                let Some(remote) = remote else {
                    continue;
                };
                let (a, b) = if config.name.as_str() < remote {
                    (config.name.clone(), remote.to_string())
                } else {
                    (remote.to_string(), config.name.clone())
                };
                if !bonded.insert((a, b, kind == BondKind::Metro)) {
                    continue;
                }
                self.bond_pair(&lookup, &config.name, remote, kind)?;
            }
        }
        Ok(())
    }

    fn bond_pair(
        &self,
        lookup: &Weak<dyn BackendLookup>,
        local: &str,
        remote: &str,
        kind: BondKind,
    ) -> Result<()> {
        let local_plugin = self.require(local)?;
        let remote_plugin = self.require(remote)?;

        // Both sides must accept before either slot is set
        match kind {
            BondKind::Metro => {
                local_plugin.check_metro_remote(lookup, remote)?;
                remote_plugin.check_metro_remote(lookup, local)?;
            }
            BondKind::Replica => {
                local_plugin.check_replica_remote(lookup, remote)?;
                remote_plugin.check_replica_remote(lookup, local)?;
            }
        }

        match kind {
            BondKind::Metro => {
                local_plugin.bond_metro_remote(lookup.clone(), remote)?;
                remote_plugin.bond_metro_remote(lookup.clone(), local)?;
            }
            BondKind::Replica => {
                local_plugin.bond_replica_remote(lookup.clone(), remote)?;
                remote_plugin.bond_replica_remote(lookup.clone(), local)?;
            }
        }

        info!("Bonded backends {} and {} as {} pair", local, remote, kind);
        self.emit_event(BackendEvent::TopologyBonded {
            backend: local.to_string(),
            remote: remote.to_string(),
            kind,
        });
        Ok(())
    }

    /// Remove a backend and force its session closed
    pub async fn deregister(&self, name: &str) -> Result<()> {
        let (_, entry) = self
            .backends
            .remove(name)
            .ok_or_else(|| Error::BackendNotFound {
                backend: name.to_string(),
            })?;
        self.last_online.remove(name);
        entry.plugin.shutdown().await;

        info!("Deregistered backend {}", name);
        self.emit_event(BackendEvent::BackendDeregistered {
            backend: name.to_string(),
        });
        Ok(())
    }

    /// Deregister every backend
    pub async fn shutdown_all(&self) {
        for name in self.names() {
            if let Err(e) = self.deregister(&name).await {
                debug!("Backend {} already gone at shutdown: {}", name, e);
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get(&self, name: &str) -> Option<Arc<dyn BackendPlugin>> {
        self.backends
            .get(name)
            .map(|entry| Arc::clone(&entry.value().plugin))
    }

    pub fn config(&self, name: &str) -> Option<Arc<BackendConfig>> {
        self.backends
            .get(name)
            .map(|entry| Arc::clone(&entry.value().config))
    }

    /// Registered backend names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.backends
            .iter()
            .filter(|entry| entry.value().plugin.is_online())
            .count()
    }

    fn require(&self, name: &str) -> Result<Arc<dyn BackendPlugin>> {
        self.get(name).ok_or_else(|| Error::BackendNotFound {
            backend: name.to_string(),
        })
    }

    // =========================================================================
    // Capability Refresh
    // =========================================================================

    /// Refresh capabilities and pool capacity of every backend
    ///
    /// Emits an event for every backend whose reachability changed since
    /// the previous refresh.
    pub async fn refresh_capabilities(&self) -> Vec<BackendStatus> {
        let entries: Vec<(Arc<BackendConfig>, Arc<dyn BackendPlugin>)> = self
            .backends
            .iter()
            .map(|e| (Arc::clone(&e.value().config), Arc::clone(&e.value().plugin)))
            .collect();

        let mut statuses = Vec::with_capacity(entries.len());
        for (config, plugin) in entries {
            let mut status = BackendStatus {
                name: config.name.clone(),
                storage: config.storage.clone(),
                online: false,
                report: None,
                pools: BTreeMap::new(),
                error: None,
            };

            let refreshed = match plugin.update_backend_capabilities().await {
                Ok(report) => match plugin.update_pool_capabilities(&config.pools).await {
                    Ok(pools) => Ok((report, pools)),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            match refreshed {
                Ok((report, pools)) => {
                    status.report = Some(report);
                    status.pools = pools;
                }
                Err(e) => {
                    warn!("Capability refresh of backend {} failed: {}", config.name, e);
                    status.error = Some(e.to_string());
                }
            }

            status.online = plugin.is_online();
            self.note_reachability(&config.name, status.online);
            statuses.push(status);
        }
        statuses
    }

    fn note_reachability(&self, backend: &str, online: bool) {
        let previous = self.last_online.insert(backend.to_string(), online);
        match (previous, online) {
            (Some(true), false) => {
                warn!("Backend {} went offline", backend);
                self.emit_event(BackendEvent::BackendWentOffline {
                    backend: backend.to_string(),
                });
            }
            (Some(false), true) => {
                info!("Backend {} is back online", backend);
                self.emit_event(BackendEvent::BackendCameOnline {
                    backend: backend.to_string(),
                });
            }
            _ => {}
        }
    }

    // =========================================================================
    // Volume Operations
    // =========================================================================

    /// Plugin for an id, or `None` when its backend is not registered
    fn resolve<'a>(&self, id: &'a str) -> Result<(Option<Arc<dyn BackendPlugin>>, &'a str, &'a str)> {
        let (backend, name) = split_volume_id(id)?;
        Ok((self.get(backend), backend, name))
    }

    fn absent_backend(operation: &str, backend: &str, id: &str) {
        warn!(
            "Backend {} of {} is not registered, treating {} as done",
            backend, id, operation
        );
    }

    pub async fn create_volume(
        &self,
        ctx: &RequestContext,
        backend: &str,
        name: &str,
        params: &Parameters,
    ) -> Result<VolumeInfo> {
        self.require(backend)?.create_volume(ctx, name, params).await
    }

    pub async fn delete_volume(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        match self.resolve(id)? {
            (Some(plugin), _, name) => plugin.delete_volume(ctx, name).await,
            (None, backend, _) => {
                Self::absent_backend("delete", backend, id);
                Ok(())
            }
        }
    }

    pub async fn expand_volume(&self, ctx: &RequestContext, id: &str, capacity_bytes: i64) -> Result<bool> {
        let (backend, name) = split_volume_id(id)?;
        self.require(backend)?
            .expand_volume(ctx, name, capacity_bytes)
            .await
    }

    pub async fn create_snapshot(
        &self,
        ctx: &RequestContext,
        id: &str,
        snapshot: &str,
    ) -> Result<SnapshotInfo> {
        let (backend, name) = split_volume_id(id)?;
        self.require(backend)?
            .create_snapshot(ctx, name, snapshot)
            .await
    }

    /// Delete a snapshot given as `<backend>.<snapshot>`
    pub async fn delete_snapshot(&self, ctx: &RequestContext, snapshot_id: &str) -> Result<()> {
        match self.resolve(snapshot_id)? {
            (Some(plugin), _, name) => plugin.delete_snapshot(ctx, name).await,
            (None, backend, _) => {
                Self::absent_backend("snapshot delete", backend, snapshot_id);
                Ok(())
            }
        }
    }

    pub async fn attach_volume(
        &self,
        ctx: &RequestContext,
        id: &str,
        params: &Parameters,
    ) -> Result<MappingInfo> {
        let (backend, name) = split_volume_id(id)?;
        self.require(backend)?.attach_volume(ctx, name, params).await
    }

    pub async fn detach_volume(&self, ctx: &RequestContext, id: &str, params: &Parameters) -> Result<()> {
        match self.resolve(id)? {
            (Some(plugin), _, name) => plugin.detach_volume(ctx, name, params).await,
            (None, backend, _) => {
                Self::absent_backend("detach", backend, id);
                Ok(())
            }
        }
    }

    /// `None` when the backend is gone and nothing is known about the device
    pub async fn unstage_volume(
        &self,
        ctx: &RequestContext,
        id: &str,
        params: &Parameters,
    ) -> Result<Option<DisconnectInfo>> {
        match self.resolve(id)? {
            (Some(plugin), _, name) => plugin.unstage_volume(ctx, name, params).await.map(Some),
            (None, backend, _) => {
                Self::absent_backend("unstage", backend, id);
                Ok(None)
            }
        }
    }
}

impl BackendLookup for BackendTable {
    fn lookup(&self, name: &str) -> Option<Arc<dyn BackendPlugin>> {
        self.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{SimulatedArray, SimulatedClientFactory};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn san_config(name: &str, url: &str) -> BackendConfig {
        BackendConfig::new(name, "oceanstor-san", url)
            .with_pools(&["pool0"])
            .with_parameter("protocol", json!("fc"))
    }

    fn setup() -> (Arc<SimulatedArray>, Arc<SimulatedArray>, Arc<BackendTable>) {
        let factory = SimulatedClientFactory::new();
        let a = SimulatedArray::new("SN-A", ArrayModel::DoradoV6);
        let b = SimulatedArray::new("SN-B", ArrayModel::DoradoV6);
        a.add_pool("pool0", 1 << 40, 1 << 39);
        b.add_pool("pool0", 1 << 40, 1 << 40);
        factory.add_array("https://a", Arc::clone(&a));
        factory.add_array("https://b", Arc::clone(&b));

        let factory: Arc<dyn ClientFactory> = Arc::new(factory);
        let registry = PluginRegistry::with_builtin_plugins(factory).unwrap();
        (a, b, BackendTable::new(registry))
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let (a, _b, table) = setup();
        let mut events = table.subscribe();

        table.register(san_config("san-a", "https://a")).await.unwrap();
        assert_matches!(
            table.register(san_config("san-a", "https://a")).await,
            Err(Error::BackendAlreadyRegistered { .. })
        );
        assert_eq!(table.names(), vec!["san-a".to_string()]);
        assert_eq!(table.online_count(), 1);
        assert_eq!(a.login_count(), 1);

        table.deregister("san-a").await.unwrap();
        assert_eq!(a.logout_count(), 1);
        assert!(table.get("san-a").is_none());
        assert_matches!(
            table.deregister("san-a").await,
            Err(Error::BackendNotFound { .. })
        );

        assert_matches!(events.recv().await, Ok(BackendEvent::BackendRegistered { .. }));
        assert_matches!(events.recv().await, Ok(BackendEvent::BackendDeregistered { .. }));
    }

    #[tokio::test]
    async fn test_register_unknown_storage_fails() {
        let (_a, _b, table) = setup();
        let config = BackendConfig::new("x", "netapp-nas", "https://a");
        assert_matches!(table.register(config).await, Err(Error::Configuration(_)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_bond_topology_is_symmetric() {
        let (_a, _b, table) = setup();
        let mut events = table.subscribe();
        table
            .register(san_config("san-a", "https://a").with_metro_backend("san-b", "domain-1"))
            .await
            .unwrap();
        table
            .register(san_config("san-b", "https://b").with_metro_backend("san-a", "domain-1"))
            .await
            .unwrap();
        table.bond_topology().unwrap();
        table.bond_topology().unwrap();

        let a = table.get("san-a").unwrap();
        let b = table.get("san-b").unwrap();
        let report = a.update_backend_capabilities().await.unwrap();
        assert!(report.capabilities.support_metro);
        assert!(b.update_backend_capabilities().await.unwrap().capabilities.support_metro);

        let mut bonds = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, BackendEvent::TopologyBonded { .. }) {
                bonds += 1;
            }
        }
        assert_eq!(bonds, 2);
    }

    #[tokio::test]
    async fn test_conflicting_bond_leaves_no_half_pair() {
        let factory = SimulatedClientFactory::new();
        for (serial, url) in [("SN-A", "https://a"), ("SN-B", "https://b"), ("SN-C", "https://c")] {
            let array = SimulatedArray::new(serial, ArrayModel::DoradoV6);
            array.add_pool("pool0", 1 << 40, 1 << 40);
            factory.add_array(url, array);
        }
        let factory: Arc<dyn ClientFactory> = Arc::new(factory);
        let table = BackendTable::new(PluginRegistry::with_builtin_plugins(factory).unwrap());

        // san-a and san-c both claim san-b; whichever bonds second must fail cleanly
        table
            .register(san_config("san-a", "https://a").with_metro_backend("san-b", "domain-1"))
            .await
            .unwrap();
        table.register(san_config("san-b", "https://b")).await.unwrap();
        table
            .register(san_config("san-c", "https://c").with_metro_backend("san-b", "domain-1"))
            .await
            .unwrap();
        assert_matches!(table.bond_topology(), Err(Error::AlreadyBonded { .. }));

        let mut remotes = BTreeMap::new();
        for name in ["san-a", "san-b", "san-c"] {
            let report = table
                .get(name)
                .unwrap()
                .update_backend_capabilities()
                .await
                .unwrap();
            remotes.insert(name, report.specifications.get("MetroRemote").cloned());
        }
        let partner = remotes["san-b"].clone().unwrap();
        assert_eq!(remotes[partner.as_str()].as_deref(), Some("san-b"));
        let loser = if partner == "san-a" { "san-c" } else { "san-a" };
        assert_eq!(remotes[loser], None);
    }

    #[tokio::test]
    async fn test_bond_to_missing_backend_fails() {
        let (_a, _b, table) = setup();
        table
            .register(san_config("san-a", "https://a").with_metro_backend("san-b", "domain-1"))
            .await
            .unwrap();
        assert_matches!(table.bond_topology(), Err(Error::BackendNotFound { .. }));
    }

    #[tokio::test]
    async fn test_refresh_emits_reachability_transitions() {
        let (a, _b, table) = setup();
        table.register(san_config("san-a", "https://a")).await.unwrap();
        let mut events = table.subscribe();

        let statuses = table.refresh_capabilities().await;
        assert!(statuses[0].online);
        assert_eq!(statuses[0].pools["pool0"].free_capacity, 1 << 39);

        a.set_fail_queries(true);
        let statuses = table.refresh_capabilities().await;
        assert!(!statuses[0].online);
        assert!(statuses[0].error.is_some());
        assert_eq!(table.online_count(), 0);

        a.set_fail_queries(false);
        table.refresh_capabilities().await;

        assert_matches!(events.recv().await, Ok(BackendEvent::BackendWentOffline { .. }));
        assert_matches!(events.recv().await, Ok(BackendEvent::BackendCameOnline { .. }));
    }

    #[tokio::test]
    async fn test_teardown_on_absent_backend_succeeds() {
        let (_a, _b, table) = setup();
        let ctx = RequestContext::default();
        let params = Parameters::new();

        table.delete_volume(&ctx, "gone.pvc-1").await.unwrap();
        table.detach_volume(&ctx, "gone.pvc-1", &params).await.unwrap();
        assert_eq!(table.unstage_volume(&ctx, "gone.pvc-1", &params).await.unwrap(), None);
        table.delete_snapshot(&ctx, "gone.snap-1").await.unwrap();

        assert_matches!(
            table.attach_volume(&ctx, "gone.pvc-1", &params).await,
            Err(Error::BackendNotFound { .. })
        );
        assert_matches!(
            table.delete_volume(&ctx, "no-dot").await,
            Err(Error::InvalidParameter { .. })
        );
    }

    #[tokio::test]
    async fn test_volume_ids_route_to_backend() {
        let (a, _b, table) = setup();
        table.register(san_config("san-a", "https://a")).await.unwrap();
        let ctx = RequestContext::default();

        let info = table
            .create_volume(
                &ctx,
                "san-a",
                "pvc-1",
                &json!({"size": 1 << 20, "storagepool": "pool0"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await
            .unwrap();
        let id = volume_id("san-a", &info.name);
        assert_eq!(id, "san-a.pvc-1");
        assert!(a.volume("pvc-1").is_some());

        table.delete_volume(&ctx, &id).await.unwrap();
        assert!(a.volume("pvc-1").is_none());
    }
}
