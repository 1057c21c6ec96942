// =============================================================================
// Error taxonomy
// =============================================================================
//
// Non-fatal outcomes (busy lock, no vault capacity) are ordinary values that
// callers match on and log. `InvariantViolation` is the only fatal class: it
// means a concurrency bug and halts the affected resource until cleared.
// =============================================================================

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::types::{LiquidityTier, RejectionReason};

/// Returned by `LockManager::try_acquire` when another holder owns the lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("resource {resource_id} is locked by {holder_id} (expires in {expires_in:?})")]
pub struct LockBusy {
    pub resource_id: String,
    pub holder_id: String,
    pub expires_in: Duration,
}

/// Non-fatal outcomes of a vault allocation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("no vault with free capacity in tier {tier} for {resource_id}")]
    NoCapacity {
        resource_id: String,
        tier: LiquidityTier,
    },
    #[error("{resource_id} already occupies vault {vault_id}")]
    AlreadyAllocated {
        resource_id: String,
        vault_id: String,
    },
    #[error("unknown vault {0}")]
    UnknownVault(String),
    #[error("{resource_id} was not approved ({reason})")]
    NotApproved {
        resource_id: String,
        reason: RejectionReason,
    },
}

impl AllocationError {
    pub fn rejection_reason(&self) -> RejectionReason {
        match self {
            Self::NoCapacity { .. } | Self::UnknownVault(_) => RejectionReason::NoCapacity,
            Self::AlreadyAllocated { .. } => RejectionReason::AlreadyAllocated,
            Self::NotApproved { reason, .. } => *reason,
        }
    }
}

/// Fatal: a core concurrency guarantee was broken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvariantViolation {
    #[error("lock on {resource_id} granted to {expected_holder} but held by {actual_holder:?}")]
    LockDoubleGranted {
        resource_id: String,
        expected_holder: String,
        actual_holder: Option<String>,
    },
    #[error("vault {vault_id} holds {occupants} occupants (capacity {capacity})")]
    VaultOverCapacity {
        vault_id: String,
        occupants: usize,
        capacity: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_errors_map_to_rejection_reasons() {
        let err = AllocationError::NoCapacity {
            resource_id: "BTCUSDT".into(),
            tier: LiquidityTier::High,
        };
        assert_eq!(err.rejection_reason(), RejectionReason::NoCapacity);
        assert_eq!(
            err.to_string(),
            "no vault with free capacity in tier high for BTCUSDT"
        );

        let err = AllocationError::AlreadyAllocated {
            resource_id: "BTCUSDT".into(),
            vault_id: "vault-a".into(),
        };
        assert_eq!(err.rejection_reason(), RejectionReason::AlreadyAllocated);
    }

    #[test]
    fn invariant_violation_serialises_with_kind_tag() {
        let v = InvariantViolation::VaultOverCapacity {
            vault_id: "vault-a".into(),
            occupants: 3,
            capacity: 2,
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["kind"], "vault_over_capacity");
        assert_eq!(json["occupants"], 3);
    }
}
