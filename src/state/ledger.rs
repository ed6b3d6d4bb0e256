//! In-memory swap ledger
//!
//! Single source of truth for swap records. Every mutation goes through
//! [`SwapLedger::transition`], which compares the current state against the
//! caller's expectation under the record's shard lock before applying the
//! update. Callers only ever receive clones.

use super::record::{AttemptChange, HashAlgorithm, LifecycleState, SwapId, SwapRecord, SwapUpdate};
use crate::clock::Clock;
use crate::error::{RelayerError, RelayerResult};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Capacity-bounded store of swap records keyed by id
pub struct SwapLedger {
    records: DashMap<SwapId, SwapRecord>,
    hash_algorithm: HashAlgorithm,
    clock: Arc<dyn Clock>,
}

/// Records removed by one [`SwapLedger::evict`] call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionReport {
    /// Processed records past retention
    pub expired: Vec<SwapId>,
    /// Terminal records removed for capacity
    pub trimmed: Vec<SwapId>,
    /// Active records removed for capacity
    pub displaced: Vec<(SwapId, LifecycleState)>,
}

impl EvictionReport {
    pub fn total(&self) -> usize {
        self.expired.len() + self.trimmed.len() + self.displaced.len()
    }
}

/// Record counts per lifecycle state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub detected: usize,
    pub destination_funding: usize,
    pub destination_funded: usize,
    pub claimed: usize,
    pub source_withdrawn: usize,
    pub processed: usize,
    pub abandoned: usize,
    pub total: usize,
}

impl SwapLedger {
    pub fn new(hash_algorithm: HashAlgorithm, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            hash_algorithm,
            clock,
        }
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    /// Insert a record unless one with the same id exists.
    ///
    /// Returns `false` and leaves the ledger untouched for a duplicate.
    pub fn insert_if_absent(&self, record: SwapRecord) -> bool {
        match self.records.entry(record.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!("Ledger insert {} ({})", record.id, record.state);
                slot.insert(record);
                crate::metrics::set_ledger_size(self.records.len());
                true
            }
        }
    }

    pub fn get(&self, id: &str) -> RelayerResult<SwapRecord> {
        self.records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| RelayerError::NotFound { id: id.to_string() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Compare-and-swap state change.
    ///
    /// Applies `update` and moves the record to `next` only if its current
    /// state equals `expected`. On any error the record is left unchanged.
    pub fn transition(
        &self,
        id: &str,
        expected: LifecycleState,
        next: LifecycleState,
        update: SwapUpdate,
    ) -> RelayerResult<SwapRecord> {
        let now = self.clock.now();

        let updated = {
            let mut entry = self
                .records
                .get_mut(id)
                .ok_or_else(|| RelayerError::NotFound { id: id.to_string() })?;
            let current = entry.value_mut();

            if current.state != expected {
                return Err(RelayerError::StateConflict {
                    id: id.to_string(),
                    expected,
                    actual: current.state,
                });
            }
            if !expected.can_transition_to(next) {
                return Err(RelayerError::InvalidStateTransition {
                    from: expected,
                    to: next,
                });
            }

            check_edge_fields(id, expected, next, &update)?;

            let mut candidate = current.clone();
            self.apply(&mut candidate, update)?;

            if next == LifecycleState::Claimed && candidate.preimage.is_none() {
                return Err(RelayerError::Integrity {
                    id: id.to_string(),
                    message: "claim requires a revealed preimage".to_string(),
                });
            }

            if next != expected {
                candidate.state = next;
                candidate.state_entered_at = now;
            }
            if next.is_terminal() {
                candidate.processed_at = Some(now);
            }
            if next == LifecycleState::Abandoned && candidate.abandon_reason.is_none() {
                candidate.abandon_reason = candidate
                    .last_error
                    .clone()
                    .or_else(|| Some("abandoned".to_string()));
            }

            *current = candidate.clone();
            candidate
        };

        if next != expected {
            debug!("Swap {} transitioned {} -> {}", id, expected, next);
            crate::metrics::record_transition(expected, next);
        }

        Ok(updated)
    }

    fn apply(&self, record: &mut SwapRecord, update: SwapUpdate) -> RelayerResult<()> {
        if let Some(preimage) = update.preimage {
            if !self.hash_algorithm.verify(&preimage, &record.hashlock) {
                return Err(RelayerError::Integrity {
                    id: record.id.clone(),
                    message: format!(
                        "preimage does not hash to hashlock {:?}",
                        record.hashlock
                    ),
                });
            }
            set_once(&record.id, "preimage", &mut record.preimage, preimage)?;
        }
        if let Some(recipient) = update.dest_recipient {
            set_once(&record.id, "dest_recipient", &mut record.dest_recipient, recipient)?;
        }
        if let Some(tx) = update.dest_tx_ref {
            set_once(&record.id, "dest_tx_ref", &mut record.dest_tx_ref, tx)?;
        }
        if let Some(tx) = update.claim_tx_ref {
            set_once(&record.id, "claim_tx_ref", &mut record.claim_tx_ref, tx)?;
        }
        if let Some(tx) = update.withdraw_tx_ref {
            set_once(&record.id, "withdraw_tx_ref", &mut record.withdraw_tx_ref, tx)?;
        }

        match update.attempts {
            AttemptChange::Keep => {}
            AttemptChange::Increment => record.attempts = record.attempts.saturating_add(1),
            AttemptChange::Reset => record.attempts = 0,
        }
        if let Some(last_error) = update.last_error {
            record.last_error = last_error;
        }
        if let Some(reason) = update.abandon_reason {
            record.abandon_reason = Some(reason);
        }

        Ok(())
    }

    /// Records waiting on the resolver, oldest first
    pub fn pending(&self) -> Vec<SwapRecord> {
        self.collect_sorted(|r| r.state.is_pending())
    }

    pub fn all(&self) -> Vec<SwapRecord> {
        self.collect_sorted(|_| true)
    }

    pub fn in_state(&self, state: LifecycleState) -> Vec<SwapRecord> {
        self.collect_sorted(|r| r.state == state)
    }

    /// Diagnostic listing: abandoned records, live records carrying an error,
    /// and live records that sat in one state for longer than `stale_after`.
    pub fn stuck(&self, now: DateTime<Utc>, stale_after: Duration) -> Vec<SwapRecord> {
        self.collect_sorted(|r| match r.state {
            LifecycleState::Abandoned => true,
            LifecycleState::Processed => false,
            _ => r.last_error.is_some() || now - r.state_entered_at > stale_after,
        })
    }

    pub fn stats(&self) -> LedgerStats {
        let mut stats = LedgerStats::default();
        for entry in self.records.iter() {
            match entry.value().state {
                LifecycleState::Detected => stats.detected += 1,
                LifecycleState::DestinationFunding => stats.destination_funding += 1,
                LifecycleState::DestinationFunded => stats.destination_funded += 1,
                LifecycleState::Claimed => stats.claimed += 1,
                LifecycleState::SourceWithdrawn => stats.source_withdrawn += 1,
                LifecycleState::Processed => stats.processed += 1,
                LifecycleState::Abandoned => stats.abandoned += 1,
            }
            stats.total += 1;
        }
        stats
    }

    fn collect_sorted(&self, keep: impl Fn(&SwapRecord) -> bool) -> Vec<SwapRecord> {
        let mut out: Vec<SwapRecord> = self
            .records
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Drop processed records past `retention`, then trim to `capacity`.
    ///
    /// Capacity trimming goes oldest-first by `detected_at`, taking processed
    /// records before abandoned ones and abandoned ones before live swaps.
    /// Abandoned records never age out on retention alone.
    pub fn evict(&self, now: DateTime<Utc>, retention: Duration, capacity: usize) -> EvictionReport {
        let mut report = EvictionReport::default();

        self.records.retain(|id, record| {
            let expired = record.state == LifecycleState::Processed
                && record
                    .processed_at
                    .map_or(false, |at| now - at > retention);
            if expired {
                report.expired.push(id.clone());
            }
            !expired
        });

        let len = self.records.len();
        if len > capacity {
            let mut candidates: Vec<(u8, DateTime<Utc>, SwapId, LifecycleState)> = self
                .records
                .iter()
                .map(|e| {
                    let r = e.value();
                    let class = match r.state {
                        LifecycleState::Processed => 0,
                        LifecycleState::Abandoned => 1,
                        _ => 2,
                    };
                    (class, r.detected_at, r.id.clone(), r.state)
                })
                .collect();
            candidates.sort();

            let mut excess = len - capacity;
            for (_, _, id, state) in candidates {
                if excess == 0 {
                    break;
                }
                if !state.is_terminal() {
                    let err = RelayerError::CapacityEvictionOfActiveRecord {
                        id: id.clone(),
                        state,
                    };
                    error!(swap_id = %id, "{}", err);
                    crate::metrics::record_active_eviction(state);
                } else if state == LifecycleState::Abandoned {
                    warn!(swap_id = %id, "Evicting abandoned swap under capacity pressure");
                }

                if self.records.remove_if(&id, |_, r| r.state == state).is_some() {
                    excess -= 1;
                    match state {
                        s if s.is_terminal() => report.trimmed.push(id),
                        s => report.displaced.push((id, s)),
                    }
                }
            }
        }

        if report.total() > 0 {
            info!(
                "Evicted {} swaps ({} expired, {} trimmed, {} displaced), {} remain",
                report.total(),
                report.expired.len(),
                report.trimmed.len(),
                report.displaced.len(),
                self.records.len()
            );
            crate::metrics::record_evictions(&report);
        }
        crate::metrics::set_ledger_size(self.records.len());

        report
    }
}

/// Each step-owned field may only be written by the edge that completes
/// that step. Same-state annotations carry attempts and `last_error` only.
fn check_edge_fields(
    id: &str,
    from: LifecycleState,
    to: LifecycleState,
    update: &SwapUpdate,
) -> RelayerResult<()> {
    use LifecycleState::*;

    let funded = (from, to) == (DestinationFunding, DestinationFunded);
    let claimed = (from, to) == (DestinationFunded, Claimed);
    let withdrawn = (from, to) == (Claimed, SourceWithdrawn);

    let fields = [
        ("dest_recipient", update.dest_recipient.is_some(), funded),
        ("dest_tx_ref", update.dest_tx_ref.is_some(), funded),
        ("preimage", update.preimage.is_some(), claimed),
        ("claim_tx_ref", update.claim_tx_ref.is_some(), claimed),
        ("withdraw_tx_ref", update.withdraw_tx_ref.is_some(), withdrawn),
        ("abandon_reason", update.abandon_reason.is_some(), to == Abandoned),
    ];
    match fields.iter().find(|(_, present, allowed)| *present && !*allowed) {
        Some((field, _, _)) => Err(RelayerError::Integrity {
            id: id.to_string(),
            message: format!("{} cannot be set on {} -> {}", field, from, to),
        }),
        None => Ok(()),
    }
}

fn set_once<T: PartialEq + std::fmt::Debug>(
    id: &str,
    field: &str,
    slot: &mut Option<T>,
    value: T,
) -> RelayerResult<()> {
    match slot {
        Some(existing) if *existing != value => Err(RelayerError::Integrity {
            id: id.to_string(),
            message: format!("{} already set to {:?}", field, existing),
        }),
        Some(_) => Ok(()),
        None => {
            *slot = Some(value);
            Ok(())
        }
    }
}
