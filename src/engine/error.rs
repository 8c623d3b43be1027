use std::time::Duration;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::grid::GridRejection;
use crate::model::*;
use crate::store::StoreError;

use super::lifecycle::Transition;

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("{0} is before the start of the current day")]
    PastDate(NaiveDateTime),
    #[error("{0} is outside business hours")]
    OutsideBusinessHours(NaiveDateTime),
    #[error("{0} is not on the 30-minute grid")]
    OffGrid(NaiveDateTime),
    #[error("slot {slot} already held by appointment {holder}")]
    SlotConflict { slot: SlotKey, holder: AppointmentId },
    #[error("cannot {transition} appointment {id}: status is {status}")]
    InvalidTransition {
        id: AppointmentId,
        status: AppointmentStatus,
        transition: Transition,
    },
    #[error("appointment not found: {0}")]
    NotFound(AppointmentId),
    #[error("{kind} not found: {id}")]
    ReferenceNotFound { kind: CatalogKind, id: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("store did not respond within {0:?}")]
    StoreTimeout(Duration),
}

impl SchedulingError {
    /// Faults of the persistence layer, as opposed to business outcomes the caller must explain.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, SchedulingError::Store(_) | SchedulingError::StoreTimeout(_))
    }

    /// Short stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SchedulingError::PastDate(_) => "past_date",
            SchedulingError::OutsideBusinessHours(_) => "outside_business_hours",
            SchedulingError::OffGrid(_) => "off_grid",
            SchedulingError::SlotConflict { .. } => "slot_conflict",
            SchedulingError::InvalidTransition { .. } => "invalid_transition",
            SchedulingError::NotFound(_) => "not_found",
            SchedulingError::ReferenceNotFound { .. } => "reference_not_found",
            SchedulingError::InvalidPayload(_) => "invalid_payload",
            SchedulingError::Store(_) => "store_error",
            SchedulingError::StoreTimeout(_) => "store_timeout",
        }
    }
}

impl From<GridRejection> for SchedulingError {
    fn from(r: GridRejection) -> Self {
        match r {
            GridRejection::PastDate(t) => SchedulingError::PastDate(t),
            GridRejection::OutsideBusinessHours(t) => SchedulingError::OutsideBusinessHours(t),
            GridRejection::OffGrid(t) => SchedulingError::OffGrid(t),
        }
    }
}
