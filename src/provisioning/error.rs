use thiserror::Error;

use crate::domain::{OrgId, Provenance, ProvenanceAction, RuleGroupKey};
use crate::storage::StoreError;

/// Errors returned by the provisioning service.
#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("alert rule {uid} not found in org {org_id}")]
    RuleNotFound { org_id: OrgId, uid: String },

    #[error("rule group {0} not found")]
    GroupNotFound(RuleGroupKey),

    #[error("can not provision a rule into a group with non-provisioned rules")]
    GroupNotProvisioned,

    #[error("cannot {action} rule with provenance '{requested}', it is provisioned as '{stored}'")]
    ProvenanceConflict {
        action: ProvenanceAction,
        stored: Provenance,
        requested: Provenance,
    },

    #[error("invalid rule group interval: {0}")]
    InvalidInterval(String),

    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error(transparent)]
    Storage(StoreError),
}

/// Coarse classification used by callers to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Internal,
}

impl ProvisioningError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisioningError::RuleNotFound { .. } | ProvisioningError::GroupNotFound(_) => {
                ErrorKind::NotFound
            }
            ProvisioningError::ProvenanceConflict { .. }
            | ProvisioningError::Storage(StoreError::DuplicateUid(_))
            | ProvisioningError::Storage(StoreError::SerializationFailure(_)) => {
                ErrorKind::Conflict
            }
            ProvisioningError::GroupNotProvisioned | ProvisioningError::InvalidInterval(_) => {
                ErrorKind::Validation
            }
            ProvisioningError::InternalInconsistency(_) | ProvisioningError::Storage(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ProvisioningError::RuleNotFound { .. } => "RULE_NOT_FOUND",
            ProvisioningError::GroupNotFound(_) => "GROUP_NOT_FOUND",
            ProvisioningError::GroupNotProvisioned => "GROUP_NOT_PROVISIONED",
            ProvisioningError::ProvenanceConflict { .. } => "PROVENANCE_CONFLICT",
            ProvisioningError::InvalidInterval(_) => "INVALID_INTERVAL",
            ProvisioningError::InternalInconsistency(_) => "INTERNAL_INCONSISTENCY",
            ProvisioningError::Storage(StoreError::DuplicateUid(_)) => "DUPLICATE_UID",
            ProvisioningError::Storage(StoreError::SerializationFailure(_)) => {
                "SERIALIZATION_FAILURE"
            }
            ProvisioningError::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<StoreError> for ProvisioningError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RuleNotFound { org_id, uid } => {
                ProvisioningError::RuleNotFound { org_id, uid }
            }
            StoreError::RuleGroupNotFound(key) => ProvisioningError::GroupNotFound(key),
            other => ProvisioningError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_classified() {
        let err: ProvisioningError = StoreError::RuleNotFound {
            org_id: 1,
            uid: "abc".to_string(),
        }
        .into();
        assert!(err.is_not_found());
        assert_eq!(err.code(), "RULE_NOT_FOUND");

        let err: ProvisioningError =
            StoreError::RuleGroupNotFound(RuleGroupKey::new(1, "ns", "g")).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: ProvisioningError = StoreError::DuplicateUid("abc".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err: ProvisioningError = StoreError::ReadOnlySession.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_serialization_failure_is_retryable_conflict() {
        let err: ProvisioningError =
            StoreError::SerializationFailure("could not serialize access".to_string()).into();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.code(), "SERIALIZATION_FAILURE");
    }

    #[test]
    fn test_conflict_message_names_both_values() {
        let err = ProvisioningError::ProvenanceConflict {
            action: ProvenanceAction::Delete,
            stored: Provenance::File,
            requested: Provenance::Api,
        };

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(
            err.to_string(),
            "cannot delete rule with provenance 'api', it is provisioned as 'file'"
        );
    }
}
