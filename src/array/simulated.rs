//! Simulated Storage Array
//!
//! In-memory array used by the standalone sidecar and by tests. It keeps
//! volumes, pairs, hosts, mappings and dtrees in plain maps, counts the calls
//! the plugin layer makes, and can inject login, mapping and query faults.
//!
//! Every client refuses object calls until it has logged in, so any code path
//! that talks to the array outside a session lease fails loudly.

use crate::attach::AluaConfig;
use crate::config::PluginLayerConfig;
use crate::domain::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Default pool size for arrays built from configuration (1 TiB)
const DEFAULT_POOL_BYTES: u64 = 1 << 40;

// =============================================================================
// Array State
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    fail_login: bool,
    fail_logout: bool,
    reject_credentials: bool,
    fail_map: bool,
    fail_unmap: bool,
    fail_queries: bool,
}

#[derive(Debug, Default)]
struct Counters {
    logins: AtomicU64,
    logouts: AtomicU64,
    map_calls: AtomicU64,
    unmap_calls: AtomicU64,
    pair_queries: AtomicU64,
}

#[derive(Debug, Clone)]
struct HostRecord {
    id: String,
    spec: HostSpec,
    next_lun: u32,
}

#[derive(Debug, Default)]
struct ArrayState {
    features: ArrayFeatures,
    nfs: NfsServiceSetting,
    pools: BTreeMap<String, StoragePool>,
    volumes: BTreeMap<String, VolumeDescriptor>,
    /// Keyed by local volume id
    pairs: BTreeMap<String, HyperMetroPair>,
    snapshots: BTreeMap<String, SnapshotDescriptor>,
    hosts: BTreeMap<String, HostRecord>,
    /// (host id, volume id) → host LUN id
    mappings: BTreeMap<(String, String), u32>,
    dtrees: BTreeMap<(String, String), DtreeDescriptor>,
}

impl ArrayState {
    fn volume_by_id(&self, volume_id: &str) -> Option<&VolumeDescriptor> {
        self.volumes.values().find(|v| v.id == volume_id)
    }

    fn is_exposed(&self, volume_id: &str) -> bool {
        self.mappings.keys().any(|(_, v)| v == volume_id)
    }
}

/// One simulated controller
pub struct SimulatedArray {
    serial: String,
    model: ArrayModel,
    state: Mutex<ArrayState>,
    faults: Mutex<Faults>,
    latency: Mutex<Duration>,
    counters: Counters,
    next_id: AtomicU64,
    /// Array holding the other half of this array's HyperMetro pairs
    metro_peer: Mutex<Weak<SimulatedArray>>,
}

impl std::fmt::Debug for SimulatedArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedArray")
            .field("serial", &self.serial)
            .field("model", &self.model)
            .finish()
    }
}

impl SimulatedArray {
    pub fn new(serial: impl Into<String>, model: ArrayModel) -> Arc<Self> {
        let state = ArrayState {
            features: ArrayFeatures {
                thin: true,
                thick: true,
                qos: true,
                metro: true,
                replication: true,
                clone: true,
                application_type: false,
            },
            nfs: NfsServiceSetting {
                nfs3: true,
                nfs4: true,
                nfs41: false,
            },
            ..Default::default()
        };
        Arc::new(Self {
            serial: serial.into(),
            model,
            state: Mutex::new(state),
            faults: Mutex::new(Faults::default()),
            latency: Mutex::new(Duration::ZERO),
            counters: Counters::default(),
            next_id: AtomicU64::new(1),
            metro_peer: Mutex::new(Weak::new()),
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// New client bound to this array
    pub fn client(self: &Arc<Self>, backend: impl Into<String>) -> Arc<dyn ArrayClient> {
        Arc::new(SimulatedClient {
            backend: backend.into(),
            array: Arc::clone(self),
            logged_in: AtomicBool::new(false),
        })
    }

    fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn wwn_for(&self, id: &str) -> String {
        let tag = self
            .serial
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        format!("6{:07x}{:0>24}", tag & 0x0fff_ffff, id)
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Add a pool; returns its id
    pub fn add_pool(&self, name: &str, total_bytes: u64, free_bytes: u64) -> String {
        let id = self.allocate_id();
        self.state.lock().pools.insert(
            name.to_string(),
            StoragePool {
                id: id.clone(),
                name: name.to_string(),
                free_capacity_bytes: free_bytes,
                total_capacity_bytes: total_bytes,
            },
        );
        id
    }

    /// Pair this array with `peer`: pairs created on either side show up on both
    pub fn link_metro_peer(self: &Arc<Self>, peer: &Arc<Self>) {
        *self.metro_peer.lock() = Arc::downgrade(peer);
        *peer.metro_peer.lock() = Arc::downgrade(self);
    }

    fn peer(&self) -> Option<Arc<SimulatedArray>> {
        self.metro_peer.lock().upgrade()
    }

    /// Record the peer's view of a pair created here
    fn mirror_pair(&self, pair: &HyperMetroPair) {
        let mut state = self.state.lock();
        if let Some(volume) = state
            .volumes
            .values_mut()
            .find(|v| v.id == pair.remote_object_id)
        {
            volume.relationships = Some(r#"{"HyperMetro":"TRUE"}"#.to_string());
        }
        state.pairs.insert(
            pair.remote_object_id.clone(),
            HyperMetroPair {
                local_object_id: pair.remote_object_id.clone(),
                remote_object_id: pair.local_object_id.clone(),
                ..pair.clone()
            },
        );
    }

    /// Drop the peer's view of a pair deleted here
    fn unmirror_pair(&self, pair: &HyperMetroPair) {
        let mut state = self.state.lock();
        let mirrored = state
            .pairs
            .get(&pair.remote_object_id)
            .map_or(false, |p| p.id == pair.id && p.remote_object_id == pair.local_object_id);
        if !mirrored {
            return;
        }
        state.pairs.remove(&pair.remote_object_id);
        if let Some(volume) = state
            .volumes
            .values_mut()
            .find(|v| v.id == pair.remote_object_id)
        {
            volume.relationships = Some(r#"{"HyperMetro":"FALSE"}"#.to_string());
        }
    }

    /// Add a volume directly, bypassing create
    pub fn add_volume(&self, name: &str, capacity_sectors: u64) -> VolumeDescriptor {
        let id = self.allocate_id();
        let volume = VolumeDescriptor {
            wwn: self.wwn_for(&id),
            id,
            name: name.to_string(),
            capacity_sectors,
            pool_id: String::new(),
            exposed_to_host: false,
            relationships: Some(r#"{"HyperMetro":"FALSE"}"#.to_string()),
        };
        self.state
            .lock()
            .volumes
            .insert(name.to_string(), volume.clone());
        volume
    }

    /// Overwrite a volume's raw relationship blob
    pub fn set_relationships(&self, volume: &str, raw: Option<&str>) {
        if let Some(v) = self.state.lock().volumes.get_mut(volume) {
            v.relationships = raw.map(str::to_string);
        }
    }

    /// Mark a volume as HyperMetro-paired and add its pair
    pub fn add_pair(&self, volume: &str, status: PairRunningStatus) -> Option<String> {
        let pair_id = self.allocate_id();
        let mut state = self.state.lock();
        let v = state.volumes.get_mut(volume)?;
        v.relationships = Some(r#"{"HyperMetro":"TRUE"}"#.to_string());
        let local_id = v.id.clone();
        state.pairs.insert(
            local_id.clone(),
            HyperMetroPair {
                id: pair_id.clone(),
                local_object_id: local_id,
                remote_object_id: String::new(),
                domain: "simulated".to_string(),
                running_status: status,
                health_status: PairHealthStatus::Normal,
            },
        );
        Some(pair_id)
    }

    pub fn set_pair_status(&self, volume: &str, status: PairRunningStatus) {
        let mut state = self.state.lock();
        let Some(id) = state.volumes.get(volume).map(|v| v.id.clone()) else {
            return;
        };
        if let Some(pair) = state.pairs.get_mut(&id) {
            pair.running_status = status;
        }
    }

    /// Drop the pair but leave the relationship blob claiming one
    pub fn remove_pair(&self, volume: &str) {
        let mut state = self.state.lock();
        if let Some(id) = state.volumes.get(volume).map(|v| v.id.clone()) {
            state.pairs.remove(&id);
        }
    }

    pub fn set_features(&self, features: ArrayFeatures) {
        self.state.lock().features = features;
    }

    pub fn set_nfs_service(&self, setting: NfsServiceSetting) {
        self.state.lock().nfs = setting;
    }

    /// Add a dtree directly, bypassing create
    pub fn add_dtree(&self, parent: &str, name: &str, quota_bytes: u64) {
        let id = self.allocate_id();
        self.state.lock().dtrees.insert(
            (parent.to_string(), name.to_string()),
            DtreeDescriptor {
                id,
                name: name.to_string(),
                parent_name: parent.to_string(),
                quota_bytes,
            },
        );
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    pub fn set_fail_login(&self, fail: bool) {
        self.faults.lock().fail_login = fail;
    }

    pub fn set_fail_logout(&self, fail: bool) {
        self.faults.lock().fail_logout = fail;
    }

    pub fn set_reject_credentials(&self, reject: bool) {
        self.faults.lock().reject_credentials = reject;
    }

    pub fn set_fail_map(&self, fail: bool) {
        self.faults.lock().fail_map = fail;
    }

    pub fn set_fail_unmap(&self, fail: bool) {
        self.faults.lock().fail_unmap = fail;
    }

    /// Make every object query fail with a transport error
    pub fn set_fail_queries(&self, fail: bool) {
        self.faults.lock().fail_queries = fail;
    }

    /// Delay applied to every client call
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn login_count(&self) -> u64 {
        self.counters.logins.load(Ordering::Relaxed)
    }

    pub fn logout_count(&self) -> u64 {
        self.counters.logouts.load(Ordering::Relaxed)
    }

    pub fn map_call_count(&self) -> u64 {
        self.counters.map_calls.load(Ordering::Relaxed)
    }

    pub fn unmap_call_count(&self) -> u64 {
        self.counters.unmap_calls.load(Ordering::Relaxed)
    }

    pub fn pair_query_count(&self) -> u64 {
        self.counters.pair_queries.load(Ordering::Relaxed)
    }

    pub fn volume(&self, name: &str) -> Option<VolumeDescriptor> {
        self.state.lock().volumes.get(name).cloned()
    }

    pub fn pair_for(&self, volume: &str) -> Option<HyperMetroPair> {
        let state = self.state.lock();
        let id = &state.volumes.get(volume)?.id;
        state.pairs.get(id).cloned()
    }

    pub fn snapshot(&self, name: &str) -> Option<SnapshotDescriptor> {
        self.state.lock().snapshots.get(name).cloned()
    }

    pub fn dtree(&self, parent: &str, name: &str) -> Option<DtreeDescriptor> {
        self.state
            .lock()
            .dtrees
            .get(&(parent.to_string(), name.to_string()))
            .cloned()
    }

    pub fn host_alua(&self, host: &str) -> Option<AluaConfig> {
        self.state
            .lock()
            .hosts
            .get(host)
            .and_then(|h| h.spec.alua.clone())
    }

    /// Whether `volume` is mapped to host `host`
    pub fn is_mapped(&self, volume: &str, host: &str) -> bool {
        let state = self.state.lock();
        let (Some(v), Some(h)) = (state.volumes.get(volume), state.hosts.get(host)) else {
            return false;
        };
        state.mappings.contains_key(&(h.id.clone(), v.id.clone()))
    }

    pub fn mapping_count(&self) -> usize {
        self.state.lock().mappings.len()
    }
}

// =============================================================================
// Simulated Client
// =============================================================================

struct SimulatedClient {
    backend: String,
    array: Arc<SimulatedArray>,
    logged_in: AtomicBool,
}

impl SimulatedClient {
    async fn delay(&self) {
        let latency = *self.array.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Gate for object calls: needs a login and no query fault
    async fn check(&self) -> Result<()> {
        self.delay().await;
        if !self.logged_in.load(Ordering::Acquire) {
            return Err(Error::Authentication {
                backend: self.backend.clone(),
                reason: "session is not logged in".to_string(),
            });
        }
        if self.array.faults.lock().fail_queries {
            return Err(self.transport("array is not responding"));
        }
        Ok(())
    }

    fn transport(&self, reason: &str) -> Error {
        Error::Transport {
            backend: self.backend.clone(),
            reason: reason.to_string(),
        }
    }

    fn rejected(&self, operation: &str, object: &str, reason: &str) -> Error {
        Error::OperationFailed {
            backend: self.backend.clone(),
            operation: operation.to_string(),
            volume: object.to_string(),
            reason: reason.to_string(),
        }
    }

    fn probe_credentials(&self) -> Result<()> {
        let faults = *self.array.faults.lock();
        if faults.fail_login {
            return Err(Error::Login {
                backend: self.backend.clone(),
                reason: format!("array {} is unreachable", self.array.serial),
            });
        }
        if faults.reject_credentials {
            return Err(Error::Authentication {
                backend: self.backend.clone(),
                reason: "username or password is incorrect".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ArrayClient for SimulatedClient {
    async fn login(&self) -> Result<()> {
        self.delay().await;
        self.probe_credentials()?;
        self.logged_in.store(true, Ordering::Release);
        self.array.counters.logins.fetch_add(1, Ordering::Relaxed);
        debug!("Simulated array {} accepted login", self.array.serial);
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.delay().await;
        self.logged_in.store(false, Ordering::Release);
        self.array.counters.logouts.fetch_add(1, Ordering::Relaxed);
        if self.array.faults.lock().fail_logout {
            return Err(self.transport("logout request failed"));
        }
        Ok(())
    }

    async fn validate_login(&self) -> Result<()> {
        self.delay().await;
        self.probe_credentials()
    }

    async fn get_system(&self) -> Result<SystemInfo> {
        self.check().await?;
        Ok(SystemInfo {
            serial_number: self.array.serial.clone(),
            model: self.array.model.clone(),
            version: "6.1.5".to_string(),
        })
    }

    async fn get_features(&self) -> Result<ArrayFeatures> {
        self.check().await?;
        Ok(self.array.state.lock().features)
    }

    async fn get_pool_by_name(&self, name: &str) -> Result<Option<StoragePool>> {
        self.check().await?;
        Ok(self.array.state.lock().pools.get(name).cloned())
    }

    async fn get_all_pools(&self) -> Result<Vec<StoragePool>> {
        self.check().await?;
        Ok(self.array.state.lock().pools.values().cloned().collect())
    }

    async fn get_volume_by_name(&self, name: &str) -> Result<Option<VolumeDescriptor>> {
        self.check().await?;
        let state = self.array.state.lock();
        Ok(state.volumes.get(name).map(|v| {
            let mut v = v.clone();
            v.exposed_to_host = state.is_exposed(&v.id);
            v
        }))
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<VolumeDescriptor> {
        self.check().await?;
        let id = self.array.allocate_id();
        let mut state = self.array.state.lock();
        if state.volumes.contains_key(&request.name) {
            return Err(self.rejected("create volume", &request.name, "volume already exists"));
        }
        if !state.pools.values().any(|p| p.id == request.pool_id) {
            return Err(Error::PoolNotFound {
                backend: self.backend.clone(),
                pool: request.pool_id.clone(),
            });
        }
        let volume = VolumeDescriptor {
            wwn: self.array.wwn_for(&id),
            id,
            name: request.name.clone(),
            capacity_sectors: request.capacity_sectors,
            pool_id: request.pool_id.clone(),
            exposed_to_host: false,
            relationships: Some(r#"{"HyperMetro":"FALSE"}"#.to_string()),
        };
        state.volumes.insert(request.name.clone(), volume.clone());
        Ok(volume)
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.check().await?;
        let mut state = self.array.state.lock();
        let Some(name) = state.volume_by_id(volume_id).map(|v| v.name.clone()) else {
            return Err(Error::VolumeNotFound {
                backend: self.backend.clone(),
                volume: volume_id.to_string(),
            });
        };
        if state.is_exposed(volume_id) {
            return Err(self.rejected("delete volume", &name, "volume is mapped to a host"));
        }
        if state.pairs.contains_key(volume_id) {
            return Err(self.rejected("delete volume", &name, "volume is in a HyperMetro pair"));
        }
        state.volumes.remove(&name);
        state.snapshots.retain(|_, s| s.parent_id != volume_id);
        Ok(())
    }

    async fn expand_volume(&self, volume_id: &str, capacity_sectors: u64) -> Result<()> {
        self.check().await?;
        let mut state = self.array.state.lock();
        let Some(volume) = state.volumes.values_mut().find(|v| v.id == volume_id) else {
            return Err(Error::VolumeNotFound {
                backend: self.backend.clone(),
                volume: volume_id.to_string(),
            });
        };
        if capacity_sectors < volume.capacity_sectors {
            return Err(self.rejected("expand volume", volume_id, "capacity can't shrink"));
        }
        volume.capacity_sectors = capacity_sectors;
        Ok(())
    }

    async fn get_hypermetro_pair_by_local_object_id(
        &self,
        object_id: &str,
    ) -> Result<Option<HyperMetroPair>> {
        self.check().await?;
        self.array
            .counters
            .pair_queries
            .fetch_add(1, Ordering::Relaxed);
        Ok(self.array.state.lock().pairs.get(object_id).cloned())
    }

    async fn create_hypermetro_pair(&self, request: &CreatePairRequest) -> Result<HyperMetroPair> {
        self.check().await?;
        let pair_id = self.array.allocate_id();
        let pair = {
            let mut state = self.array.state.lock();
            let Some(volume) = state
                .volumes
                .values_mut()
                .find(|v| v.id == request.local_volume_id)
            else {
                return Err(Error::VolumeNotFound {
                    backend: self.backend.clone(),
                    volume: request.local_volume_id.clone(),
                });
            };
            volume.relationships = Some(r#"{"HyperMetro":"TRUE"}"#.to_string());
            let pair = HyperMetroPair {
                id: pair_id,
                local_object_id: request.local_volume_id.clone(),
                remote_object_id: request.remote_volume_id.clone(),
                domain: request.domain.clone(),
                running_status: PairRunningStatus::Normal,
                health_status: PairHealthStatus::Normal,
            };
            state
                .pairs
                .insert(request.local_volume_id.clone(), pair.clone());
            pair
        };
        if let Some(peer) = self.array.peer() {
            peer.mirror_pair(&pair);
        }
        Ok(pair)
    }

    async fn delete_hypermetro_pair(&self, pair_id: &str) -> Result<()> {
        self.check().await?;
        let pair = {
            let mut state = self.array.state.lock();
            let Some(pair) = state.pairs.values().find(|p| p.id == pair_id).cloned() else {
                return Ok(());
            };
            state.pairs.remove(&pair.local_object_id);
            if let Some(volume) = state
                .volumes
                .values_mut()
                .find(|v| v.id == pair.local_object_id)
            {
                volume.relationships = Some(r#"{"HyperMetro":"FALSE"}"#.to_string());
            }
            pair
        };
        if let Some(peer) = self.array.peer() {
            peer.unmirror_pair(&pair);
        }
        Ok(())
    }

    async fn get_snapshot_by_name(&self, name: &str) -> Result<Option<SnapshotDescriptor>> {
        self.check().await?;
        Ok(self.array.state.lock().snapshots.get(name).cloned())
    }

    async fn create_snapshot(&self, volume_id: &str, name: &str) -> Result<SnapshotDescriptor> {
        self.check().await?;
        let id = self.array.allocate_id();
        let mut state = self.array.state.lock();
        let Some(capacity_sectors) = state.volume_by_id(volume_id).map(|v| v.capacity_sectors)
        else {
            return Err(Error::VolumeNotFound {
                backend: self.backend.clone(),
                volume: volume_id.to_string(),
            });
        };
        if state.snapshots.contains_key(name) {
            return Err(self.rejected("create snapshot", name, "snapshot already exists"));
        }
        let snapshot = SnapshotDescriptor {
            id,
            name: name.to_string(),
            parent_id: volume_id.to_string(),
            capacity_sectors,
            created_at: Utc::now(),
        };
        state.snapshots.insert(name.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.check().await?;
        self.array
            .state
            .lock()
            .snapshots
            .retain(|_, s| s.id != snapshot_id);
        Ok(())
    }

    async fn ensure_host(&self, spec: &HostSpec) -> Result<String> {
        self.check().await?;
        let new_id = self.array.allocate_id();
        let mut state = self.array.state.lock();
        let record = state
            .hosts
            .entry(spec.name.clone())
            .or_insert_with(|| HostRecord {
                id: new_id,
                spec: HostSpec {
                    initiators: Vec::new(),
                    ..spec.clone()
                },
                next_lun: 1,
            });
        for initiator in &spec.initiators {
            if !record.spec.initiators.contains(initiator) {
                record.spec.initiators.push(initiator.clone());
            }
        }
        record.spec.alua = spec.alua.clone();
        Ok(record.id.clone())
    }

    async fn get_host_by_name(&self, name: &str) -> Result<Option<String>> {
        self.check().await?;
        Ok(self.array.state.lock().hosts.get(name).map(|h| h.id.clone()))
    }

    async fn map_volume(&self, host_id: &str, volume_id: &str) -> Result<u32> {
        self.check().await?;
        self.array.counters.map_calls.fetch_add(1, Ordering::Relaxed);
        if self.array.faults.lock().fail_map {
            return Err(self.transport("mapping request rejected"));
        }

        let mut state = self.array.state.lock();
        if state.volume_by_id(volume_id).is_none() {
            return Err(Error::VolumeNotFound {
                backend: self.backend.clone(),
                volume: volume_id.to_string(),
            });
        }
        let key = (host_id.to_string(), volume_id.to_string());
        if let Some(lun) = state.mappings.get(&key) {
            return Ok(*lun);
        }
        let Some(host) = state.hosts.values_mut().find(|h| h.id == host_id) else {
            return Err(self.rejected("map volume", volume_id, "host does not exist"));
        };
        let lun = host.next_lun;
        host.next_lun += 1;
        state.mappings.insert(key, lun);
        Ok(lun)
    }

    async fn unmap_volume(&self, host_id: &str, volume_id: &str) -> Result<()> {
        self.check().await?;
        self.array
            .counters
            .unmap_calls
            .fetch_add(1, Ordering::Relaxed);
        if self.array.faults.lock().fail_unmap {
            return Err(self.transport("unmapping request rejected"));
        }
        self.array
            .state
            .lock()
            .mappings
            .remove(&(host_id.to_string(), volume_id.to_string()));
        Ok(())
    }

    async fn get_targets(&self, protocol: Protocol, _initiators: &[String]) -> Result<TargetInfo> {
        self.check().await?;
        let serial = self.array.serial.to_ascii_lowercase();
        let targets = match protocol {
            Protocol::Iscsi => TargetInfo {
                iqns: vec![format!("iqn.2006-08.sim.array:{}", serial)],
                ..Default::default()
            },
            Protocol::Fc | Protocol::FcNvme => TargetInfo {
                wwns: vec![format!("21{:0>14}", serial), format!("22{:0>14}", serial)],
                ..Default::default()
            },
            Protocol::Roce => TargetInfo {
                nqn: Some(format!("nqn.2020-02.sim.array:{}", serial)),
                ..Default::default()
            },
            Protocol::Scsi | Protocol::Nfs => TargetInfo::default(),
        };
        Ok(targets)
    }

    async fn get_dtree(&self, parent: &str, name: &str) -> Result<Option<DtreeDescriptor>> {
        self.check().await?;
        Ok(self
            .array
            .state
            .lock()
            .dtrees
            .get(&(parent.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_dtree(
        &self,
        parent: &str,
        name: &str,
        quota_bytes: u64,
    ) -> Result<DtreeDescriptor> {
        self.check().await?;
        let id = self.array.allocate_id();
        let mut state = self.array.state.lock();
        let key = (parent.to_string(), name.to_string());
        if state.dtrees.contains_key(&key) {
            return Err(self.rejected("create dtree", name, "dtree already exists"));
        }
        let dtree = DtreeDescriptor {
            id,
            name: name.to_string(),
            parent_name: parent.to_string(),
            quota_bytes,
        };
        state.dtrees.insert(key, dtree.clone());
        Ok(dtree)
    }

    async fn delete_dtree(&self, parent: &str, name: &str) -> Result<()> {
        self.check().await?;
        self.array
            .state
            .lock()
            .dtrees
            .remove(&(parent.to_string(), name.to_string()));
        Ok(())
    }

    async fn set_dtree_quota(&self, parent: &str, name: &str, quota_bytes: u64) -> Result<()> {
        self.check().await?;
        let mut state = self.array.state.lock();
        let Some(dtree) = state
            .dtrees
            .get_mut(&(parent.to_string(), name.to_string()))
        else {
            return Err(Error::VolumeNotFound {
                backend: self.backend.clone(),
                volume: name.to_string(),
            });
        };
        dtree.quota_bytes = quota_bytes;
        Ok(())
    }

    async fn get_nfs_service_setting(&self) -> Result<NfsServiceSetting> {
        self.check().await?;
        Ok(self.array.state.lock().nfs)
    }
}

// =============================================================================
// Client Factory
// =============================================================================

/// Hands out clients for simulated arrays registered under their URLs
#[derive(Default)]
pub struct SimulatedClientFactory {
    arrays: DashMap<String, Arc<SimulatedArray>>,
}

impl SimulatedClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `array` at `url`
    pub fn add_array(&self, url: impl Into<String>, array: Arc<SimulatedArray>) {
        self.arrays.insert(url.into(), array);
    }

    pub fn array(&self, url: &str) -> Option<Arc<SimulatedArray>> {
        self.arrays.get(url).map(|a| Arc::clone(a.value()))
    }

    /// One simulated array per configured backend, seeded with its pools
    pub fn from_config(config: &PluginLayerConfig) -> Self {
        let factory = Self::new();
        for backend in &config.backends {
            let Some(url) = backend.urls.first() else {
                continue;
            };
            if factory.arrays.contains_key(url) {
                continue;
            }
            let model = backend
                .parameters
                .get_str("product")
                .map(ArrayModel::from_product)
                .unwrap_or_else(|| match backend.storage.as_str() {
                    "fusionstorage-san" => ArrayModel::Distributed,
                    _ => ArrayModel::DoradoV6,
                });
            let array = SimulatedArray::new(format!("SIM-{}", backend.name), model);
            for pool in &backend.pools {
                array.add_pool(pool, DEFAULT_POOL_BYTES, DEFAULT_POOL_BYTES);
            }
            factory.add_array(url.clone(), array);
        }

        for backend in &config.backends {
            let peer = backend
                .metro_backend
                .as_deref()
                .and_then(|remote| config.backends.iter().find(|b| b.name == remote));
            let arrays = (
                backend.urls.first().and_then(|url| factory.array(url)),
                peer.and_then(|p| p.urls.first()).and_then(|url| factory.array(url)),
            );
            if let (Some(local), Some(remote)) = arrays {
                local.link_metro_peer(&remote);
            }
        }
        factory
    }
}

impl ClientFactory for SimulatedClientFactory {
    fn new_client(&self, backend: &str, config: &ClientConfig) -> Result<Arc<dyn ArrayClient>> {
        config
            .urls
            .iter()
            .find_map(|url| self.arrays.get(url).map(|a| a.value().client(backend)))
            .ok_or_else(|| Error::Transport {
                backend: backend.to_string(),
                reason: format!("no array answers at {:?}", config.urls),
            })
    }
}
