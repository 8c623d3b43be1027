use std::sync::Arc;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::model::*;

use super::SchedulingError;

/// Outcome of a successful claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claimed {
    /// The slot was free and now belongs to the claimant.
    Fresh,
    /// The claimant already held the slot.
    AlreadyHeld,
}

/// Which scheduled appointment holds each `(resource, start)` slot.
///
/// The map entry is the unit of mutual exclusion: check and insert run under the
/// same shard lock, so two claimants of one slot can never both win. Unrelated
/// slots contend only when they hash to the same shard.
#[derive(Default)]
pub struct ConflictIndex {
    claims: DashMap<SlotKey, AppointmentId>,
}

impl ConflictIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `slot` for `claimant`.
    ///
    /// A claim already held by `claimant` is not a conflict with itself, which is what
    /// lets a reschedule onto its own current slot succeed.
    pub fn try_claim(&self, slot: &SlotKey, claimant: AppointmentId) -> Result<Claimed, SchedulingError> {
        let outcome = match self.claims.entry(slot.clone()) {
            Entry::Occupied(e) if *e.get() == claimant => Ok(Claimed::AlreadyHeld),
            Entry::Occupied(e) => Err(SchedulingError::SlotConflict {
                slot: slot.clone(),
                holder: *e.get(),
            }),
            Entry::Vacant(e) => {
                e.insert(claimant);
                Ok(Claimed::Fresh)
            }
        };
        // Entry guard is gone; safe to take the all-shard read for the gauge.
        if matches!(outcome, Ok(Claimed::Fresh)) {
            self.record_size();
        }
        outcome
    }

    /// Claim `slot` and wrap it in a guard that rolls the claim back unless committed.
    pub fn claim(self: &Arc<Self>, slot: SlotKey, claimant: AppointmentId) -> Result<ClaimGuard, SchedulingError> {
        let claimed = self.try_claim(&slot, claimant)?;
        Ok(ClaimGuard {
            index: Arc::clone(self),
            slot,
            holder: claimant,
            armed: claimed == Claimed::Fresh,
        })
    }

    /// Free a slot regardless of holder. Returns the previous holder.
    pub fn release(&self, resource: &ResourceKey, at: NaiveDateTime) -> Option<AppointmentId> {
        let removed = self
            .claims
            .remove(&SlotKey::new(resource.clone(), at))
            .map(|(_, holder)| holder);
        if removed.is_some() {
            self.record_size();
        }
        removed
    }

    /// Free `slot` only if `holder` still owns it.
    pub fn release_held_by(&self, slot: &SlotKey, holder: AppointmentId) -> bool {
        let removed = self.claims.remove_if(slot, |_, h| *h == holder).is_some();
        if removed {
            self.record_size();
        }
        removed
    }

    pub fn holder(&self, resource: &ResourceKey, at: NaiveDateTime) -> Option<AppointmentId> {
        self.claims
            .get(&SlotKey::new(resource.clone(), at))
            .map(|e| *e.value())
    }

    /// Claimed start times on `resource`, sorted.
    pub fn claimed_times(&self, resource: &ResourceKey) -> Vec<NaiveDateTime> {
        let mut times: Vec<NaiveDateTime> = self
            .claims
            .iter()
            .filter(|e| &e.key().resource == resource)
            .map(|e| e.key().at)
            .collect();
        times.sort();
        times
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    fn record_size(&self) {
        metrics::gauge!(crate::observability::ACTIVE_CLAIMS).set(self.claims.len() as f64);
    }
}

/// A claim taken during an in-flight operation.
///
/// Dropping the guard without [`ClaimGuard::commit`] releases a freshly taken claim.
/// A guard over a slot the holder already had never releases it.
#[must_use = "dropping a ClaimGuard releases the claim"]
pub struct ClaimGuard {
    index: Arc<ConflictIndex>,
    slot: SlotKey,
    holder: AppointmentId,
    armed: bool,
}

impl ClaimGuard {
    pub fn slot(&self) -> &SlotKey {
        &self.slot
    }

    /// True when this guard took the slot rather than finding it already held.
    pub fn is_fresh(&self) -> bool {
        self.armed
    }

    /// Keep the claim.
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.armed && self.index.release_held_by(&self.slot, self.holder) {
            metrics::counter!(crate::observability::CLAIM_ROLLBACKS_TOTAL).increment(1);
            debug!("rolled back claim on {} for {}", self.slot, self.holder);
        }
    }
}
