use chrono::{NaiveDate, NaiveDateTime};

use crate::model::*;

use super::{SchedulingError, SchedulingService};

impl SchedulingService {
    pub async fn get(&self, id: AppointmentId) -> Result<Appointment, SchedulingError> {
        self.load_existing(id).await
    }

    /// Which appointment currently claims the slot, if any.
    pub fn slot_holder(&self, resource: &ResourceKey, at: NaiveDateTime) -> Option<AppointmentId> {
        self.index.holder(resource, at)
    }

    /// Grid slots of `date` on `resource` that would pass validation now and are unclaimed.
    ///
    /// Advisory only: a slot listed here can still be lost to a concurrent create.
    pub fn free_slots(&self, resource: &ResourceKey, date: NaiveDate) -> Vec<NaiveDateTime> {
        let now = self.clock.now();
        self.policy
            .slots_for(date)
            .into_iter()
            .filter(|t| self.policy.validate(*t, now).is_ok())
            .filter(|t| self.index.holder(resource, *t).is_none())
            .collect()
    }

    /// Claimed start times on `resource`, sorted.
    pub fn claimed_times(&self, resource: &ResourceKey) -> Vec<NaiveDateTime> {
        self.index.claimed_times(resource)
    }

    pub fn active_claims(&self) -> usize {
        self.index.len()
    }
}
