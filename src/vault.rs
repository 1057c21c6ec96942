// =============================================================================
// Vault Allocator — capacity-bounded placement of approved signals
// =============================================================================
//
// Each vault is guarded by its own mutex: the capacity check and the insert
// happen inside that one critical section, so |occupants| <= capacity holds
// at all times. Unrelated vaults never contend.
//
// A resource occupies at most one vault. The placement table reserves the
// resource before any vault is touched; a failed allocation removes the
// reservation again.
//
// Signals that find no free slot are dropped, never queued.
// =============================================================================

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::aggregator::AggregatedSignal;
use crate::config::{VaultConfig, VaultSpec};
use crate::errors::{AllocationError, InvariantViolation};
use crate::types::{LiquidityTier, RejectionReason};

/// Placement marker while an allocation is in flight.
const PENDING: &str = "";

#[derive(Debug, Clone, Serialize)]
pub struct Vault {
    pub vault_id: String,
    pub capacity: usize,
    pub occupants: BTreeSet<String>,
    pub liquidity_tier: LiquidityTier,
}

impl Vault {
    fn from_spec(spec: &VaultSpec) -> Self {
        Self {
            vault_id: spec.vault_id.clone(),
            capacity: spec.capacity,
            occupants: BTreeSet::new(),
            liquidity_tier: spec.liquidity_tier,
        }
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.occupants.len())
    }

    fn check_capacity(&self) -> Result<(), InvariantViolation> {
        if self.occupants.len() > self.capacity {
            return Err(InvariantViolation::VaultOverCapacity {
                vault_id: self.vault_id.clone(),
                occupants: self.occupants.len(),
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

/// Successful placement of a resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VaultAssignment {
    pub vault_id: String,
    pub resource_id: String,
    pub liquidity_tier: LiquidityTier,
    /// Occupancy right after this placement.
    pub occupancy: usize,
    pub capacity: usize,
    pub assigned_at: DateTime<Utc>,
}

pub struct VaultAllocator {
    vaults: Vec<Mutex<Vault>>,
    by_id: HashMap<String, usize>,
    placements: DashMap<String, String>,
    resource_tiers: HashMap<String, LiquidityTier>,
    default_tier: LiquidityTier,
}

impl VaultAllocator {
    pub fn new(config: &VaultConfig) -> Self {
        let mut vaults: Vec<Mutex<Vault>> = Vec::with_capacity(config.vaults.len());
        let mut by_id: HashMap<String, usize> = HashMap::with_capacity(config.vaults.len());
        for spec in &config.vaults {
            if by_id.contains_key(&spec.vault_id) {
                warn!(vault_id = %spec.vault_id, "duplicate vault_id ignored; first definition kept");
                continue;
            }
            by_id.insert(spec.vault_id.clone(), vaults.len());
            vaults.push(Mutex::new(Vault::from_spec(spec)));
        }

        info!(
            vaults = vaults.len(),
            total_capacity = vaults.iter().map(|v| v.lock().capacity).sum::<usize>(),
            "VaultAllocator initialised"
        );

        Self {
            vaults,
            by_id,
            placements: DashMap::new(),
            resource_tiers: config.resource_tiers.clone(),
            default_tier: config.default_tier,
        }
    }

    pub fn tier_for(&self, resource_id: &str) -> LiquidityTier {
        self.resource_tiers
            .get(resource_id)
            .copied()
            .unwrap_or(self.default_tier)
    }

    // -------------------------------------------------------------------------
    // Allocate / release
    // -------------------------------------------------------------------------

    /// Place an approved signal into the least-occupied vault of its tier.
    pub fn allocate(&self, signal: &AggregatedSignal) -> Result<VaultAssignment, AllocationError> {
        let resource_id = signal.resource_id.as_str();
        if !signal.is_approved() {
            return Err(AllocationError::NotApproved {
                resource_id: resource_id.to_string(),
                reason: signal
                    .rejection_reason
                    .unwrap_or(RejectionReason::BelowThreshold),
            });
        }
        let tier = self.tier_for(resource_id);

        match self.placements.entry(resource_id.to_string()) {
            Entry::Occupied(existing) => {
                return Err(AllocationError::AlreadyAllocated {
                    resource_id: resource_id.to_string(),
                    vault_id: existing.get().clone(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(PENDING.to_string());
            }
        }

        match self.place(resource_id, tier) {
            Some(assignment) => {
                self.placements
                    .insert(resource_id.to_string(), assignment.vault_id.clone());
                info!(
                    resource_id,
                    vault_id = %assignment.vault_id,
                    tier = %tier,
                    occupancy = assignment.occupancy,
                    capacity = assignment.capacity,
                    "resource allocated to vault"
                );
                Ok(assignment)
            }
            None => {
                self.placements
                    .remove_if(resource_id, |_, vault_id| vault_id == PENDING);
                info!(resource_id, tier = %tier, "no vault capacity — signal dropped");
                Err(AllocationError::NoCapacity {
                    resource_id: resource_id.to_string(),
                    tier,
                })
            }
        }
    }

    fn place(&self, resource_id: &str, tier: LiquidityTier) -> Option<VaultAssignment> {
        // Candidate order from an unlocked snapshot; each candidate is
        // re-checked under its own lock.
        let mut candidates: Vec<(usize, String, usize)> = self
            .vaults
            .iter()
            .enumerate()
            .filter_map(|(i, v)| {
                let v = v.lock();
                (v.liquidity_tier == tier && v.free_slots() > 0)
                    .then(|| (v.occupants.len(), v.vault_id.clone(), i))
            })
            .collect();
        candidates.sort();

        for (_, _, idx) in candidates {
            let mut vault = self.vaults[idx].lock();
            if vault.free_slots() == 0 {
                debug!(vault_id = %vault.vault_id, "vault filled concurrently — trying next");
                continue;
            }
            vault.occupants.insert(resource_id.to_string());
            return Some(VaultAssignment {
                vault_id: vault.vault_id.clone(),
                resource_id: resource_id.to_string(),
                liquidity_tier: vault.liquidity_tier,
                occupancy: vault.occupants.len(),
                capacity: vault.capacity,
                assigned_at: Utc::now(),
            });
        }
        None
    }

    /// Position-closed notification: free the resource's slot. Returns
    /// whether the resource was in the vault.
    pub fn release(&self, vault_id: &str, resource_id: &str) -> Result<bool, AllocationError> {
        let idx = *self
            .by_id
            .get(vault_id)
            .ok_or_else(|| AllocationError::UnknownVault(vault_id.to_string()))?;

        let removed = self.vaults[idx].lock().occupants.remove(resource_id);
        if removed {
            self.placements.remove_if(resource_id, |_, v| v == vault_id);
            info!(vault_id, resource_id, "vault slot released");
        } else {
            debug!(vault_id, resource_id, "release ignored — resource not in vault");
        }
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn placement_of(&self, resource_id: &str) -> Option<String> {
        self.placements
            .get(resource_id)
            .map(|v| v.value().clone())
            .filter(|v| v != PENDING)
    }

    /// Capacity check of a single vault.
    pub fn verify(&self, vault_id: &str) -> Result<(), InvariantViolation> {
        match self.by_id.get(vault_id) {
            Some(&idx) => self.vaults[idx].lock().check_capacity(),
            None => Ok(()),
        }
    }

    /// Capacity check of every vault.
    pub fn audit(&self) -> Vec<InvariantViolation> {
        let violations: Vec<InvariantViolation> = self
            .vaults
            .iter()
            .filter_map(|v| v.lock().check_capacity().err())
            .collect();
        for v in &violations {
            error!(violation = %v, "vault invariant violated");
        }
        violations
    }

    pub fn snapshot(&self) -> Vec<Vault> {
        self.vaults.iter().map(|v| v.lock().clone()).collect()
    }
}

impl std::fmt::Debug for VaultAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultAllocator")
            .field("vaults", &self.vaults.len())
            .field("placements", &self.placements.len())
            .field("default_tier", &self.default_tier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk_guard::BreakerLevel;
    use crate::types::{Decision, Direction};
    use std::sync::{Arc, Barrier};

    fn approved(resource_id: &str) -> AggregatedSignal {
        AggregatedSignal {
            resource_id: resource_id.to_string(),
            combined_win_rate: 0.88,
            raw_win_rate: 0.88,
            direction: Direction::Long,
            confluence_count: 3,
            rare_event: false,
            boost_applied: false,
            effective_threshold: 0.80,
            breaker_level: BreakerLevel::Closed,
            decided_at: Utc::now(),
            decision: Decision::Approved,
            rejection_reason: None,
            contributions: Vec::new(),
        }
    }

    fn allocator(specs: Vec<VaultSpec>) -> VaultAllocator {
        VaultAllocator::new(&VaultConfig {
            vaults: specs,
            resource_tiers: HashMap::from([("XRPUSDT".to_string(), LiquidityTier::Low)]),
            default_tier: LiquidityTier::High,
        })
    }

    #[test]
    fn picks_least_occupied_vault_of_tier() {
        let alloc = allocator(vec![
            VaultSpec::new("vault-a", LiquidityTier::High),
            VaultSpec::new("vault-b", LiquidityTier::High),
        ]);
        let first = alloc.allocate(&approved("BTCUSDT")).unwrap();
        assert_eq!(first.vault_id, "vault-a");
        let second = alloc.allocate(&approved("ETHUSDT")).unwrap();
        assert_eq!(second.vault_id, "vault-b");
        let third = alloc.allocate(&approved("SOLUSDT")).unwrap();
        assert_eq!(third.vault_id, "vault-a");
        assert_eq!(third.occupancy, 2);
    }

    #[test]
    fn tier_mismatch_is_no_capacity() {
        let alloc = allocator(vec![VaultSpec::new("vault-a", LiquidityTier::High)]);
        let err = alloc.allocate(&approved("XRPUSDT")).unwrap_err();
        assert_eq!(
            err,
            AllocationError::NoCapacity {
                resource_id: "XRPUSDT".into(),
                tier: LiquidityTier::Low
            }
        );
        assert!(alloc.placement_of("XRPUSDT").is_none());
    }

    #[test]
    fn rejected_signal_is_never_placed() {
        let alloc = allocator(vec![VaultSpec::new("vault-a", LiquidityTier::High)]);
        let mut signal = approved("BTCUSDT");
        signal.decision = Decision::Rejected;
        signal.rejection_reason = Some(RejectionReason::RiskSuspended);

        let err = alloc.allocate(&signal).unwrap_err();
        assert_eq!(err.rejection_reason(), RejectionReason::RiskSuspended);
        assert!(alloc.placement_of("BTCUSDT").is_none());
        assert!(alloc.snapshot()[0].occupants.is_empty());
    }

    #[test]
    fn duplicate_vault_id_keeps_first_definition() {
        let alloc = allocator(vec![
            VaultSpec::new("vault-a", LiquidityTier::High).with_capacity(1),
            VaultSpec::new("vault-a", LiquidityTier::Low).with_capacity(5),
        ]);
        let vaults = alloc.snapshot();
        assert_eq!(vaults.len(), 1);
        assert_eq!(vaults[0].liquidity_tier, LiquidityTier::High);

        alloc.allocate(&approved("BTCUSDT")).unwrap();
        assert!(alloc.allocate(&approved("ETHUSDT")).is_err());
        assert!(alloc.release("vault-a", "BTCUSDT").unwrap());
        assert!(alloc.audit().is_empty());
    }

    #[test]
    fn full_vaults_drop_the_signal() {
        let alloc = allocator(vec![VaultSpec::new("vault-a", LiquidityTier::High).with_capacity(1)]);
        alloc.allocate(&approved("BTCUSDT")).unwrap();
        let err = alloc.allocate(&approved("ETHUSDT")).unwrap_err();
        assert!(matches!(err, AllocationError::NoCapacity { .. }));

        // Dropped, not queued: freeing the slot does not place ETHUSDT.
        assert!(alloc.release("vault-a", "BTCUSDT").unwrap());
        assert!(alloc.placement_of("ETHUSDT").is_none());
        assert!(alloc.allocate(&approved("ETHUSDT")).is_ok());
    }

    #[test]
    fn resource_cannot_hold_two_slots() {
        let alloc = allocator(vec![
            VaultSpec::new("vault-a", LiquidityTier::High),
            VaultSpec::new("vault-b", LiquidityTier::High),
        ]);
        alloc.allocate(&approved("BTCUSDT")).unwrap();
        let err = alloc.allocate(&approved("BTCUSDT")).unwrap_err();
        assert_eq!(
            err,
            AllocationError::AlreadyAllocated {
                resource_id: "BTCUSDT".into(),
                vault_id: "vault-a".into()
            }
        );
    }

    #[test]
    fn release_is_idempotent_and_checks_vault() {
        let alloc = allocator(vec![VaultSpec::new("vault-a", LiquidityTier::High)]);
        alloc.allocate(&approved("BTCUSDT")).unwrap();
        assert_eq!(alloc.placement_of("BTCUSDT").as_deref(), Some("vault-a"));
        assert!(alloc.release("vault-a", "BTCUSDT").unwrap());
        assert!(!alloc.release("vault-a", "BTCUSDT").unwrap());
        assert!(alloc.placement_of("BTCUSDT").is_none());
        assert!(matches!(
            alloc.release("vault-z", "BTCUSDT"),
            Err(AllocationError::UnknownVault(_))
        ));
    }

    #[test]
    fn concurrent_allocation_never_exceeds_capacity() {
        let alloc = Arc::new(allocator(vec![
            VaultSpec::new("vault-a", LiquidityTier::High),
            VaultSpec::new("vault-b", LiquidityTier::High),
        ]));
        let workers = 24;
        let barrier = Arc::new(Barrier::new(workers));

        let results: Vec<Result<VaultAssignment, AllocationError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|i| {
                    let alloc = Arc::clone(&alloc);
                    let barrier = Arc::clone(&barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        alloc.allocate(&approved(&format!("SYM{i}")))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let placed = results.iter().filter(|r| r.is_ok()).count();
        let dropped = results
            .iter()
            .filter(|r| matches!(r, Err(AllocationError::NoCapacity { .. })))
            .count();
        assert_eq!(placed, 4);
        assert_eq!(dropped, workers - 4);
        assert!(alloc.audit().is_empty());
        for v in alloc.snapshot() {
            assert!(v.occupants.len() <= v.capacity);
        }
    }
}
