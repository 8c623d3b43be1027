use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::grid::TimeGridPolicy;
use crate::model::*;

use super::conflict::{ClaimGuard, ConflictIndex};
use super::SchedulingError;

/// Mutations an appointment can undergo after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Finalize,
    Cancel,
    MarkNoShow,
    Reschedule,
}

impl Transition {
    /// Status after the transition.
    pub fn target(self) -> AppointmentStatus {
        match self {
            Transition::Finalize => AppointmentStatus::Completed,
            Transition::Cancel => AppointmentStatus::Cancelled,
            Transition::MarkNoShow => AppointmentStatus::NoShow,
            Transition::Reschedule => AppointmentStatus::Scheduled,
        }
    }

    /// Every transition starts from `Scheduled`; terminal states accept none.
    pub fn check(self, current: &Appointment) -> Result<(), SchedulingError> {
        if current.status.is_terminal() {
            return Err(SchedulingError::InvalidTransition {
                id: current.id,
                status: current.status,
                transition: self,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transition::Finalize => "finalize",
            Transition::Cancel => "cancel",
            Transition::MarkNoShow => "mark no-show",
            Transition::Reschedule => "reschedule",
        };
        f.write_str(s)
    }
}

/// A transition whose new state exists only in memory.
///
/// Holds any newly taken claim and the slot to give up. Dropping it without
/// [`StagedTransition::commit`] restores the conflict index to where it was.
pub struct StagedTransition {
    index: Arc<ConflictIndex>,
    next: Appointment,
    claim: Option<ClaimGuard>,
    release: Option<SlotKey>,
}

impl StagedTransition {
    /// The record to persist.
    pub fn next(&self) -> &Appointment {
        &self.next
    }

    /// Keep the new claim and release the old slot. Call only once `next` is durable.
    pub fn commit(self) -> Appointment {
        let StagedTransition { index, next, claim, release } = self;
        if let Some(claim) = claim {
            claim.commit();
        }
        if let Some(slot) = release {
            index.release_held_by(&slot, next.id);
        }
        next
    }
}

/// Status machine plus the grid and claim checks that gate entry into `Scheduled`.
pub struct AppointmentLifecycle<'a> {
    policy: &'a TimeGridPolicy,
    index: &'a Arc<ConflictIndex>,
}

impl<'a> AppointmentLifecycle<'a> {
    pub fn new(policy: &'a TimeGridPolicy, index: &'a Arc<ConflictIndex>) -> Self {
        Self { policy, index }
    }

    /// Validate the start time and claim its slot. Shared by create and reschedule.
    fn place(&self, appointment: &Appointment, now: NaiveDateTime) -> Result<ClaimGuard, SchedulingError> {
        self.policy.validate(appointment.scheduled_at, now)?;
        self.index.claim(appointment.slot(), appointment.id)
    }

    /// Stage a brand-new appointment. Nothing to release.
    pub fn schedule(&self, appointment: Appointment, now: NaiveDateTime) -> Result<StagedTransition, SchedulingError> {
        debug_assert_eq!(appointment.status, AppointmentStatus::Scheduled);
        let claim = self.place(&appointment, now)?;
        Ok(StagedTransition {
            index: Arc::clone(self.index),
            next: appointment,
            claim: Some(claim),
            release: None,
        })
    }

    /// Stage a move to `new_time`. On any rejection `current` is untouched and no claim is kept.
    pub fn reschedule(
        &self,
        current: &Appointment,
        new_time: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<StagedTransition, SchedulingError> {
        Transition::Reschedule.check(current)?;
        let mut next = current.clone();
        next.scheduled_at = new_time;
        next.updated_at = now;
        let claim = self.place(&next, now)?;
        let old = current.slot();
        let release = (old != next.slot()).then_some(old);
        Ok(StagedTransition {
            index: Arc::clone(self.index),
            next,
            claim: Some(claim),
            release,
        })
    }

    /// Stage a move into a terminal state. The slot is freed on commit.
    pub fn settle(
        &self,
        current: &Appointment,
        transition: Transition,
        now: NaiveDateTime,
    ) -> Result<StagedTransition, SchedulingError> {
        debug_assert!(transition.target().is_terminal());
        transition.check(current)?;
        let mut next = current.clone();
        next.status = transition.target();
        next.updated_at = now;
        Ok(StagedTransition {
            index: Arc::clone(self.index),
            next,
            claim: None,
            release: Some(current.slot()),
        })
    }

    pub fn finalize(&self, current: &Appointment, now: NaiveDateTime) -> Result<StagedTransition, SchedulingError> {
        self.settle(current, Transition::Finalize, now)
    }

    pub fn cancel(&self, current: &Appointment, now: NaiveDateTime) -> Result<StagedTransition, SchedulingError> {
        self.settle(current, Transition::Cancel, now)
    }

    pub fn mark_no_show(&self, current: &Appointment, now: NaiveDateTime) -> Result<StagedTransition, SchedulingError> {
        self.settle(current, Transition::MarkNoShow, now)
    }
}
