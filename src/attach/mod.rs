//! Attach / Detach Strategies
//!
//! Attachers perform the protocol-specific host-mapping work for one
//! operation kind. [`HostAttacher`] targets a single array; [`MetroAttacher`]
//! composes two of them for a HyperMetro pair.

pub mod alua;
pub mod host;
pub mod metro;

pub use alua::{AluaConfig, AluaPolicy};
pub use host::{HostAttacher, NodeContext};
pub use metro::MetroAttacher;

use crate::domain::*;
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Backend parameters an attacher is built from
#[derive(Debug, Clone)]
pub struct AttacherSpec {
    pub backend: String,
    pub protocol: Protocol,
    /// Target portal addresses (iscsi/roce)
    pub portals: Vec<String>,
    /// Host name → manage IP, for distributed scsi
    pub host_addresses: BTreeMap<String, String>,
    pub alua: Option<AluaPolicy>,
}

impl OperationKind {
    /// Run this operation through the attacher method for the kind
    pub async fn execute(
        self,
        attacher: &dyn Attacher,
        ctx: &RequestContext,
        lun_name: &str,
        params: &Parameters,
    ) -> Result<OperationOutcome> {
        match self {
            OperationKind::Attach => attacher
                .controller_attach(ctx, lun_name, params)
                .await
                .map(OperationOutcome::Attached),
            OperationKind::Detach => attacher
                .controller_detach(ctx, lun_name, params)
                .await
                .map(|lun_wwn| OperationOutcome::Detached { lun_wwn }),
            OperationKind::Unstage => attacher
                .node_unstage(ctx, lun_name, params)
                .await
                .map(OperationOutcome::Unstaged),
        }
    }
}

/// Check an outcome against the requested kind and its protocol's needs
pub fn validate_outcome(
    backend: &str,
    request: &OperationRequest,
    outcome: OperationOutcome,
) -> Result<OperationOutcome> {
    let failed = |reason: String| Error::OperationFailed {
        backend: backend.to_string(),
        operation: request.kind.to_string(),
        volume: request.volume.clone(),
        reason,
    };

    if outcome.kind() != request.kind {
        return Err(failed(format!(
            "strategy returned a {} result",
            outcome.kind()
        )));
    }
    if let OperationOutcome::Attached(mapping) = &outcome {
        mapping
            .validate()
            .map_err(|reason| failed(format!("incomplete mapping info: {}", reason)))?;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_validate_outcome_kind_mismatch() {
        let request = OperationRequest::new("lun-1", Parameters::new(), OperationKind::Attach);
        let res = validate_outcome(
            "san-a",
            &request,
            OperationOutcome::Detached { lun_wwn: None },
        );
        assert_matches!(res, Err(Error::OperationFailed { .. }));
    }

    #[test]
    fn test_validate_outcome_incomplete_mapping() {
        let request = OperationRequest::new("lun-1", Parameters::new(), OperationKind::Attach);
        let res = validate_outcome(
            "san-a",
            &request,
            OperationOutcome::Attached(MappingInfo::new(Protocol::Iscsi)),
        );
        assert_matches!(res, Err(Error::OperationFailed { reason, .. }) if reason.contains("mapping"));

        let request = OperationRequest::new("lun-1", Parameters::new(), OperationKind::Unstage);
        let outcome = OperationOutcome::Unstaged(DisconnectInfo {
            protocol: Protocol::Fc,
            lun_wwn: None,
        });
        assert!(validate_outcome("san-a", &request, outcome).is_ok());
    }
}
