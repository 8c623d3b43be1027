use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Appointment identifier. Assigned at creation, never reused.
pub type AppointmentId = Ulid;

/// The bookable resource a slot is claimed against. In practice the service offered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A single bookable `(resource, start)` pair on the grid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub resource: ResourceKey,
    pub at: NaiveDateTime,
}

impl SlotKey {
    pub fn new(resource: ResourceKey, at: NaiveDateTime) -> Self {
        Self { resource, at }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resource, self.at.format("%Y-%m-%dT%H:%M"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        !matches!(self, AppointmentStatus::Scheduled)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        };
        f.write_str(s)
    }
}

/// Descriptive fields supplied by the admin layer at creation.
///
/// References are opaque ids resolved by the catalog; nothing here is interpreted
/// beyond existence checks and the non-negative cost rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentPayload {
    pub client_ref: String,
    pub service_ref: String,
    pub pet_ref: Option<String>,
    pub employee_ref: Option<String>,
    /// Minor currency units.
    pub cost_cents: Option<i64>,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub resource_key: ResourceKey,
    pub scheduled_at: NaiveDateTime,
    pub status: AppointmentStatus,
    pub payload: AppointmentPayload,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Appointment {
    pub fn slot(&self) -> SlotKey {
        SlotKey::new(self.resource_key.clone(), self.scheduled_at)
    }

    /// Only scheduled appointments occupy a claim.
    pub fn is_active(&self) -> bool {
        self.status == AppointmentStatus::Scheduled
    }
}

/// Kinds of catalog entities an appointment may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogKind {
    Client,
    Pet,
    Employee,
    Service,
}

impl fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CatalogKind::Client => "client",
            CatalogKind::Pet => "pet",
            CatalogKind::Employee => "employee",
            CatalogKind::Service => "service",
        };
        f.write_str(s)
    }
}
