use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::model::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(String),
    #[error("store writer shut down")]
    Closed,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Persistence boundary for appointment records.
///
/// `save` is an upsert keyed by `Appointment::id`.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn load(&self, id: AppointmentId) -> Result<Option<Appointment>, StoreError>;

    /// Every started save must eventually resolve. Claims staged for the record are
    /// held until it does, and are released if it returns an error.
    async fn save(&self, appointment: &Appointment) -> Result<(), StoreError>;

    /// Scheduled appointments claiming slots on `resource`. Used to warm the conflict index.
    async fn list_active_by_resource(
        &self,
        resource: &ResourceKey,
    ) -> Result<Vec<Appointment>, StoreError>;

    /// Every resource key that has at least one stored appointment.
    async fn resource_keys(&self) -> Result<Vec<ResourceKey>, StoreError>;
}

/// Snapshot map shared by the in-memory and WAL stores.
#[derive(Default)]
pub struct AppointmentTable {
    rows: DashMap<AppointmentId, Appointment>,
}

impl AppointmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: &AppointmentId) -> Option<Appointment> {
        self.rows.get(id).map(|e| e.value().clone())
    }

    pub fn upsert(&self, appointment: Appointment) {
        self.rows.insert(appointment.id, appointment);
    }

    pub fn active_by_resource(&self, resource: &ResourceKey) -> Vec<Appointment> {
        let mut out: Vec<Appointment> = self
            .rows
            .iter()
            .filter(|e| e.is_active() && &e.resource_key == resource)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|a| (a.scheduled_at, a.id));
        out
    }

    pub fn resource_keys(&self) -> Vec<ResourceKey> {
        let keys: BTreeSet<ResourceKey> =
            self.rows.iter().map(|e| e.resource_key.clone()).collect();
        keys.into_iter().collect()
    }

    pub fn snapshot(&self) -> Vec<Appointment> {
        let mut all: Vec<Appointment> = self.rows.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|a| a.id);
        all
    }
}

/// Non-durable store.
#[derive(Default)]
pub struct InMemoryStore {
    table: AppointmentTable,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[async_trait]
impl AppointmentStore for InMemoryStore {
    async fn load(&self, id: AppointmentId) -> Result<Option<Appointment>, StoreError> {
        Ok(self.table.get(&id))
    }

    async fn save(&self, appointment: &Appointment) -> Result<(), StoreError> {
        self.table.upsert(appointment.clone());
        Ok(())
    }

    async fn list_active_by_resource(
        &self,
        resource: &ResourceKey,
    ) -> Result<Vec<Appointment>, StoreError> {
        Ok(self.table.active_by_resource(resource))
    }

    async fn resource_keys(&self) -> Result<Vec<ResourceKey>, StoreError> {
        Ok(self.table.resource_keys())
    }
}
