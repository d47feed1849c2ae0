//! Domain Types - Values exchanged between plugins, dispatcher and attachers
//!
//! Everything here is plain data: protocols, operation kinds and their
//! outcomes, capability reports and the per-request context.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default per-call timeout for array requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Sector size used by block arrays
pub const SECTOR_SIZE: u64 = 512;

// =============================================================================
// Protocols
// =============================================================================

/// Host attachment protocol of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Scsi,
    Iscsi,
    Fc,
    Roce,
    FcNvme,
    Nfs,
}

impl Protocol {
    /// Parse a protocol name as written in backend parameters
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "scsi" => Some(Protocol::Scsi),
            "iscsi" => Some(Protocol::Iscsi),
            "fc" => Some(Protocol::Fc),
            "roce" => Some(Protocol::Roce),
            "fc-nvme" => Some(Protocol::FcNvme),
            "nfs" => Some(Protocol::Nfs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Scsi => "scsi",
            Protocol::Iscsi => "iscsi",
            Protocol::Fc => "fc",
            Protocol::Roce => "roce",
            Protocol::FcNvme => "fc-nvme",
            Protocol::Nfs => "nfs",
        }
    }

    /// Protocols that reach the array through IP portals
    pub fn requires_portals(&self) -> bool {
        matches!(self, Protocol::Iscsi | Protocol::Roce)
    }

    /// NVMe-oF protocols
    pub fn is_nvme(&self) -> bool {
        matches!(self, Protocol::Roce | Protocol::FcNvme)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Protocol::parse(s).ok_or_else(|| Error::InvalidParameter {
            name: "protocol".to_string(),
            reason: format!("unsupported protocol {:?}", s),
        })
    }
}

/// Which array of a HyperMetro pair an action ran against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArraySide {
    Local,
    Remote,
}

impl std::fmt::Display for ArraySide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArraySide::Local => write!(f, "local"),
            ArraySide::Remote => write!(f, "remote"),
        }
    }
}

// =============================================================================
// Parameter Bag
// =============================================================================

/// Untyped parameters supplied by configuration or the orchestrator
pub type Parameters = serde_json::Map<String, Value>;

/// Typed accessors over a [`Parameters`] bag
pub trait ParamsExt {
    fn get_str(&self, key: &str) -> Option<&str>;
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn get_i64(&self, key: &str) -> Option<i64>;
    fn get_str_list(&self, key: &str) -> Option<Vec<String>>;
}

impl ParamsExt for Parameters {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Accepts JSON booleans and the strings "true"/"false"
    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse::<bool>().ok(),
            _ => None,
        }
    }

    /// Accepts JSON integers and numeric strings
    fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Accepts a JSON array of strings or a comma-separated string
    fn get_str_list(&self, key: &str) -> Option<Vec<String>> {
        match self.get(key)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            Value::String(s) => Some(
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Split an orchestrator volume id of the form `<backend>.<volume>`
pub fn split_volume_id(volume_id: &str) -> Result<(&str, &str)> {
    match volume_id.split_once('.') {
        Some((backend, volume)) if !backend.is_empty() && !volume.is_empty() => {
            Ok((backend, volume))
        }
        _ => Err(Error::InvalidParameter {
            name: "volumeId".to_string(),
            reason: format!("{:?} is not of the form <backend>.<volume>", volume_id),
        }),
    }
}

/// Validate a requested capacity against a unit and return it in bytes
pub fn aligned_capacity(capacity: i64, unit: u64) -> Result<u64> {
    if capacity <= 0 || (capacity as u64) % unit != 0 {
        return Err(Error::InvalidCapacity { capacity, unit });
    }
    Ok(capacity as u64)
}

// =============================================================================
// Operations
// =============================================================================

/// The three host-mapping operations the dispatcher routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Attach,
    Detach,
    Unstage,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Attach => "attach",
            OperationKind::Detach => "detach",
            OperationKind::Unstage => "unstage",
        }
    }

    /// Pair running states this operation treats as healthy
    pub fn accepts_pair_status(&self, status: &PairRunningStatus) -> bool {
        match self {
            OperationKind::Attach => matches!(status, PairRunningStatus::Normal),
            OperationKind::Detach | OperationKind::Unstage => {
                matches!(status, PairRunningStatus::Normal | PairRunningStatus::Paused)
            }
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One attach/detach/unstage call routed through the dispatcher
#[derive(Debug, Clone)]
pub struct OperationRequest {
    /// Array-side volume (LUN) name
    pub volume: String,
    /// Orchestrator parameters: node context, ALUA hints, mount flags
    pub parameters: Parameters,
    pub kind: OperationKind,
}

impl OperationRequest {
    pub fn new(volume: impl Into<String>, parameters: Parameters, kind: OperationKind) -> Self {
        Self {
            volume: volume.into(),
            parameters,
            kind,
        }
    }
}

/// Result of a strategy run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Attached(MappingInfo),
    /// WWN of the unmapped LUN when it was found
    Detached { lun_wwn: Option<String> },
    Unstaged(DisconnectInfo),
}

impl OperationOutcome {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationOutcome::Attached(_) => OperationKind::Attach,
            OperationOutcome::Detached { .. } => OperationKind::Detach,
            OperationOutcome::Unstaged(_) => OperationKind::Unstage,
        }
    }
}

/// Host-side connection details returned by attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingInfo {
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lun_wwn: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_lun_ids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_portals: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_iqns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_wwns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_nqn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_path: Option<String>,
}

impl MappingInfo {
    /// Empty mapping for a protocol, filled in by attachers
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            lun_wwn: None,
            host_lun_ids: Vec::new(),
            target_portals: Vec::new(),
            target_iqns: Vec::new(),
            target_wwns: Vec::new(),
            target_nqn: None,
            export_path: None,
        }
    }

    /// Check the fields the protocol needs for the host to connect
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.protocol == Protocol::Nfs {
            if self.export_path.as_deref().map_or(true, str::is_empty) {
                return Err("nfs mapping has no export path".to_string());
            }
            if self.target_portals.is_empty() {
                return Err("nfs mapping has no portal".to_string());
            }
            return Ok(());
        }

        if self.lun_wwn.as_deref().map_or(true, str::is_empty) {
            return Err(format!("{} mapping has no LUN WWN", self.protocol));
        }
        if self.host_lun_ids.is_empty() {
            return Err(format!("{} mapping has no host LUN id", self.protocol));
        }
        match self.protocol {
            Protocol::Iscsi if self.target_portals.is_empty() || self.target_iqns.is_empty() => {
                Err("iscsi mapping needs target portals and IQNs".to_string())
            }
            Protocol::Roce if self.target_portals.is_empty() => {
                Err("roce mapping needs target portals".to_string())
            }
            Protocol::Fc | Protocol::FcNvme if self.target_wwns.is_empty() => {
                Err(format!("{} mapping needs target WWNs", self.protocol))
            }
            _ => Ok(()),
        }
    }

    /// Fold the remote half of a HyperMetro mapping into this one
    pub fn merge_remote(mut self, remote: MappingInfo) -> MappingInfo {
        fn extend_unique(into: &mut Vec<String>, from: Vec<String>) {
            for item in from {
                if !into.contains(&item) {
                    into.push(item);
                }
            }
        }

        self.host_lun_ids.extend(remote.host_lun_ids);
        extend_unique(&mut self.target_portals, remote.target_portals);
        extend_unique(&mut self.target_iqns, remote.target_iqns);
        extend_unique(&mut self.target_wwns, remote.target_wwns);
        if self.lun_wwn.is_none() {
            self.lun_wwn = remote.lun_wwn;
        }
        if self.target_nqn.is_none() {
            self.target_nqn = remote.target_nqn;
        }
        self
    }
}

/// What the node needs to tear down the host-side device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectInfo {
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lun_wwn: Option<String>,
}

// =============================================================================
// HyperMetro Pair State
// =============================================================================

/// Running status of a HyperMetro pair, as reported by the array
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairRunningStatus {
    Normal,
    Synchronizing,
    Invalid,
    Paused,
    Error,
    ToBeSynchronized,
    Unknown,
    Other(String),
}

impl PairRunningStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "1" => PairRunningStatus::Normal,
            "23" => PairRunningStatus::Synchronizing,
            "35" => PairRunningStatus::Invalid,
            "41" => PairRunningStatus::Paused,
            "94" => PairRunningStatus::Error,
            "100" => PairRunningStatus::ToBeSynchronized,
            "0" => PairRunningStatus::Unknown,
            other => PairRunningStatus::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            PairRunningStatus::Normal => "1",
            PairRunningStatus::Synchronizing => "23",
            PairRunningStatus::Invalid => "35",
            PairRunningStatus::Paused => "41",
            PairRunningStatus::Error => "94",
            PairRunningStatus::ToBeSynchronized => "100",
            PairRunningStatus::Unknown => "0",
            PairRunningStatus::Other(code) => code.as_str(),
        }
    }
}

/// Health status of a HyperMetro pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairHealthStatus {
    Normal,
    Faulty,
    Other(String),
}

impl PairHealthStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "1" => PairHealthStatus::Normal,
            "2" => PairHealthStatus::Faulty,
            other => PairHealthStatus::Other(other.to_string()),
        }
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Live feature snapshot reported to the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Capabilities {
    pub support_thin: bool,
    pub support_thick: bool,
    #[serde(rename = "SupportQoS")]
    pub support_qos: bool,
    pub support_metro: bool,
    pub support_replication: bool,
    pub support_clone: bool,
    pub support_label: bool,
    pub support_application_type: bool,
    #[serde(rename = "SupportNFS3")]
    pub support_nfs3: bool,
    #[serde(rename = "SupportNFS4")]
    pub support_nfs4: bool,
    #[serde(rename = "SupportNFS41")]
    pub support_nfs41: bool,
}

impl Capabilities {
    /// Flatten into the name → flag map orchestrators consume
    pub fn to_map(&self) -> BTreeMap<String, bool> {
        let mut map = BTreeMap::new();
        if let Ok(Value::Object(fields)) = serde_json::to_value(self) {
            for (key, value) in fields {
                if let Value::Bool(flag) = value {
                    map.insert(key, flag);
                }
            }
        }
        map
    }
}

/// Capabilities plus descriptive array specifications
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityReport {
    pub capabilities: Capabilities,
    pub specifications: BTreeMap<String, String>,
}

/// Per-pool capacity snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PoolCapacity {
    pub free_capacity: u64,
    pub total_capacity: u64,
}

// =============================================================================
// Lifecycle Results
// =============================================================================

/// Result of creating a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    pub name: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wwn: Option<String>,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub hyper_metro: bool,
}

/// Result of creating a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub id: String,
    pub name: String,
    pub parent_id: String,
    pub size_bytes: u64,
    /// Unix seconds
    pub creation_time: i64,
}

// =============================================================================
// Request Context
// =============================================================================

/// Per-request identity, timeout and cancellation
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub timeout: Duration,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one array call under this request's timeout and cancellation
    pub async fn run<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled {
                operation: operation.to_string(),
            }),
            res = tokio::time::timeout(self.timeout, call) => match res {
                Ok(inner) => inner,
                Err(_) => Err(Error::Timeout {
                    operation: operation.to_string(),
                    after: self.timeout,
                }),
            },
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new("background")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            _ => Parameters::new(),
        }
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!(Protocol::parse("iSCSI"), Some(Protocol::Iscsi));
        assert_eq!(Protocol::parse("fc-nvme"), Some(Protocol::FcNvme));
        assert_eq!(Protocol::parse("smb"), None);
        assert!(Protocol::Roce.requires_portals());
        assert!(Protocol::Roce.is_nvme());
        assert!(!Protocol::Fc.requires_portals());
        assert_matches!("bogus".parse::<Protocol>(), Err(Error::InvalidParameter { .. }));
    }

    #[test]
    fn test_params_accessors() {
        let p = params(json!({
            "hyperMetro": "true",
            "size": "1048576",
            "portals": ["10.0.0.1", "10.0.0.2"],
            "FCInitiators": "wwn1, wwn2",
        }));
        assert_eq!(p.get_bool("hyperMetro"), Some(true));
        assert_eq!(p.get_i64("size"), Some(1048576));
        assert_eq!(p.get_str_list("portals").map(|v| v.len()), Some(2));
        assert_eq!(
            p.get_str_list("FCInitiators"),
            Some(vec!["wwn1".to_string(), "wwn2".to_string()])
        );
        assert_eq!(p.get_str("missing"), None);
    }

    #[test]
    fn test_split_volume_id() {
        assert_eq!(split_volume_id("san-a.pvc-1").ok(), Some(("san-a", "pvc-1")));
        assert_eq!(split_volume_id("san-a.pvc.x").ok(), Some(("san-a", "pvc.x")));
        assert!(split_volume_id("pvc-1").is_err());
        assert!(split_volume_id(".pvc-1").is_err());
    }

    #[test]
    fn test_aligned_capacity() {
        assert_eq!(aligned_capacity(1024, SECTOR_SIZE).ok(), Some(1024));
        assert_matches!(aligned_capacity(1000, SECTOR_SIZE), Err(Error::InvalidCapacity { .. }));
        assert_matches!(aligned_capacity(0, SECTOR_SIZE), Err(Error::InvalidCapacity { .. }));
    }

    #[test]
    fn test_pair_status_acceptance() {
        let paused = PairRunningStatus::from_code("41");
        assert_eq!(paused, PairRunningStatus::Paused);
        assert!(OperationKind::Detach.accepts_pair_status(&paused));
        assert!(OperationKind::Unstage.accepts_pair_status(&paused));
        assert!(!OperationKind::Attach.accepts_pair_status(&paused));
        assert!(OperationKind::Attach.accepts_pair_status(&PairRunningStatus::from_code("1")));
        assert_eq!(PairRunningStatus::from_code("7").code(), "7");
    }

    #[test]
    fn test_mapping_validation() {
        let mut mapping = MappingInfo::new(Protocol::Iscsi);
        assert!(mapping.validate().is_err());

        mapping.lun_wwn = Some("6001".into());
        mapping.host_lun_ids = vec![1];
        assert!(mapping.validate().is_err());

        mapping.target_portals = vec!["10.0.0.1".into()];
        mapping.target_iqns = vec!["iqn.a".into()];
        assert!(mapping.validate().is_ok());

        let mut nfs = MappingInfo::new(Protocol::Nfs);
        nfs.target_portals = vec!["10.0.0.9".into()];
        assert!(nfs.validate().is_err());
        nfs.export_path = Some("/parent/dtree".into());
        assert!(nfs.validate().is_ok());
    }

    #[test]
    fn test_metro_mapping_merge() {
        let mut local = MappingInfo::new(Protocol::Fc);
        local.lun_wwn = Some("6001".into());
        local.host_lun_ids = vec![3];
        local.target_wwns = vec!["a".into(), "b".into()];

        let mut remote = MappingInfo::new(Protocol::Fc);
        remote.lun_wwn = Some("6001".into());
        remote.host_lun_ids = vec![5];
        remote.target_wwns = vec!["b".into(), "c".into()];

        let merged = local.merge_remote(remote);
        assert_eq!(merged.host_lun_ids, vec![3, 5]);
        assert_eq!(merged.target_wwns, vec!["a", "b", "c"]);
        assert!(merged.validate().is_ok());
    }

    #[test]
    fn test_capability_map_names() {
        let caps = Capabilities {
            support_thin: true,
            support_qos: true,
            support_nfs41: true,
            ..Default::default()
        };
        let map = caps.to_map();
        assert_eq!(map.get("SupportThin"), Some(&true));
        assert_eq!(map.get("SupportQoS"), Some(&true));
        assert_eq!(map.get("SupportNFS41"), Some(&true));
        assert_eq!(map.get("SupportMetro"), Some(&false));
    }

    #[tokio::test]
    async fn test_request_context_timeout_and_cancel() {
        let ctx = RequestContext::new("req-1").with_timeout(Duration::from_millis(20));
        let res: Result<()> = ctx
            .run("slow call", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_matches!(res, Err(Error::Timeout { .. }));

        let ctx = RequestContext::new("req-2");
        ctx.cancellation_token().cancel();
        let res = ctx.run("any call", async { Ok(1) }).await;
        assert_matches!(res, Err(Error::Cancelled { .. }));

        let ctx = RequestContext::new("req-3");
        assert_eq!(ctx.run("fast call", async { Ok(7) }).await.ok(), Some(7));
    }
}
