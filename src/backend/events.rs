//! Backend Events
//!
//! Events emitted by the backend table for external consumers to react to
//! backend lifecycle and reachability changes.

use serde::{Deserialize, Serialize};

/// Kind of replication bond between two backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BondKind {
    Metro,
    Replica,
}

impl std::fmt::Display for BondKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BondKind::Metro => write!(f, "metro"),
            BondKind::Replica => write!(f, "replica"),
        }
    }
}

/// Events emitted by the backend table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendEvent {
    /// A backend was initialized and registered
    BackendRegistered { backend: String, storage: String },

    /// A backend was removed and its session terminated
    BackendDeregistered { backend: String },

    /// Two backends were bonded
    TopologyBonded {
        backend: String,
        remote: String,
        kind: BondKind,
    },

    /// A capability refresh found the array unreachable
    BackendWentOffline { backend: String },

    /// A capability refresh reached the array again
    BackendCameOnline { backend: String },
}

impl BackendEvent {
    /// Backend the event concerns
    pub fn backend(&self) -> &str {
        match self {
            BackendEvent::BackendRegistered { backend, .. }
            | BackendEvent::BackendDeregistered { backend }
            | BackendEvent::TopologyBonded { backend, .. }
            | BackendEvent::BackendWentOffline { backend }
            | BackendEvent::BackendCameOnline { backend } => backend,
        }
    }

    /// Check if this is a reachability transition
    pub fn is_reachability_event(&self) -> bool {
        matches!(
            self,
            BackendEvent::BackendWentOffline { .. } | BackendEvent::BackendCameOnline { .. }
        )
    }

    /// Check if this event changes the set of registered backends
    pub fn is_membership_event(&self) -> bool {
        matches!(
            self,
            BackendEvent::BackendRegistered { .. } | BackendEvent::BackendDeregistered { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_helpers() {
        let event = BackendEvent::BackendWentOffline {
            backend: "san-a".into(),
        };
        assert_eq!(event.backend(), "san-a");
        assert!(event.is_reachability_event());
        assert!(!event.is_membership_event());

        let event = BackendEvent::TopologyBonded {
            backend: "san-a".into(),
            remote: "san-b".into(),
            kind: BondKind::Metro,
        };
        assert_eq!(event.backend(), "san-a");
        assert!(!event.is_reachability_event());
    }

    #[test]
    fn test_event_serialization() {
        let event = BackendEvent::BackendRegistered {
            backend: "san-a".into(),
            storage: "oceanstor-san".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("BackendRegistered"));
        let back: BackendEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
