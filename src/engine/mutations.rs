use std::time::Instant;

use chrono::NaiveDateTime;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::lifecycle::Transition;
use super::{observe, SchedulingError, SchedulingService};

fn validate_payload(resource: &ResourceKey, payload: &AppointmentPayload) -> Result<(), SchedulingError> {
    if resource.as_str().is_empty() {
        return Err(SchedulingError::InvalidPayload("resource key is empty"));
    }
    if resource.as_str().len() > MAX_RESOURCE_KEY_LEN {
        return Err(SchedulingError::InvalidPayload("resource key too long"));
    }
    if payload.cost_cents.is_some_and(|c| c < 0) {
        return Err(SchedulingError::InvalidPayload("cost must be non-negative"));
    }
    if payload.reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
        return Err(SchedulingError::InvalidPayload("reason too long"));
    }
    if payload.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(SchedulingError::InvalidPayload("notes too long"));
    }
    let refs = [
        Some(&payload.client_ref),
        Some(&payload.service_ref),
        payload.pet_ref.as_ref(),
        payload.employee_ref.as_ref(),
    ];
    if refs.into_iter().flatten().any(|r| r.len() > MAX_REF_LEN) {
        return Err(SchedulingError::InvalidPayload("reference too long"));
    }
    Ok(())
}

impl SchedulingService {
    async fn check_references(&self, payload: &AppointmentPayload) -> Result<(), SchedulingError> {
        let refs = [
            (CatalogKind::Client, Some(&payload.client_ref)),
            (CatalogKind::Service, Some(&payload.service_ref)),
            (CatalogKind::Pet, payload.pet_ref.as_ref()),
            (CatalogKind::Employee, payload.employee_ref.as_ref()),
        ];
        for (kind, id) in refs {
            let Some(id) = id else { continue };
            if !self.bounded(self.catalog.exists(kind, id)).await? {
                return Err(SchedulingError::ReferenceNotFound { kind, id: id.clone() });
            }
        }
        Ok(())
    }

    /// Book a new appointment on `resource` at `at`.
    ///
    /// Order: payload, catalog references, grid, claim, persist. A failed persist
    /// releases the claim before the error is returned. On `StoreTimeout` the claim
    /// stays until the store answers.
    pub async fn create(
        &self,
        resource: ResourceKey,
        at: NaiveDateTime,
        payload: AppointmentPayload,
    ) -> Result<Appointment, SchedulingError> {
        let started = Instant::now();
        let result = self.create_inner(resource, at, payload).await;
        observe("create", &result, started);
        result
    }

    async fn create_inner(
        &self,
        resource: ResourceKey,
        at: NaiveDateTime,
        payload: AppointmentPayload,
    ) -> Result<Appointment, SchedulingError> {
        validate_payload(&resource, &payload)?;
        self.check_references(&payload).await?;

        let now = self.clock.now();
        let appointment = Appointment {
            id: Ulid::new(),
            resource_key: resource,
            scheduled_at: at,
            status: AppointmentStatus::Scheduled,
            payload,
            created_at: now,
            updated_at: now,
        };
        let staged = self.lifecycle().schedule(appointment, now)?;
        let appointment = self.persist(staged, None).await?;
        info!("created appointment {} on {}", appointment.id, appointment.slot());
        Ok(appointment)
    }

    /// Move a scheduled appointment to `new_time`. On rejection the stored record and
    /// its claim are unchanged.
    pub async fn reschedule(
        &self,
        id: AppointmentId,
        new_time: NaiveDateTime,
    ) -> Result<Appointment, SchedulingError> {
        let started = Instant::now();
        let result = self.reschedule_inner(id, new_time).await;
        observe("reschedule", &result, started);
        result
    }

    async fn reschedule_inner(
        &self,
        id: AppointmentId,
        new_time: NaiveDateTime,
    ) -> Result<Appointment, SchedulingError> {
        let serial = self.serialize(id).await;
        let current = self.load_existing(id).await?;
        let staged = self.lifecycle().reschedule(&current, new_time, self.clock.now())?;
        let appointment = self.persist(staged, Some(serial)).await?;
        info!(
            "rescheduled appointment {id} on {} from {} to {}",
            appointment.resource_key, current.scheduled_at, appointment.scheduled_at
        );
        Ok(appointment)
    }

    /// Mark a scheduled appointment as completed. Frees its slot.
    pub async fn finalize(&self, id: AppointmentId) -> Result<Appointment, SchedulingError> {
        self.settle(id, Transition::Finalize, "finalize").await
    }

    /// Cancel a scheduled appointment. Frees its slot.
    pub async fn cancel(&self, id: AppointmentId) -> Result<Appointment, SchedulingError> {
        self.settle(id, Transition::Cancel, "cancel").await
    }

    /// Record that the client did not attend. Frees its slot.
    pub async fn mark_no_show(&self, id: AppointmentId) -> Result<Appointment, SchedulingError> {
        self.settle(id, Transition::MarkNoShow, "mark_no_show").await
    }

    async fn settle(
        &self,
        id: AppointmentId,
        transition: Transition,
        op: &'static str,
    ) -> Result<Appointment, SchedulingError> {
        let started = Instant::now();
        let result = self.settle_inner(id, transition).await;
        observe(op, &result, started);
        result
    }

    async fn settle_inner(
        &self,
        id: AppointmentId,
        transition: Transition,
    ) -> Result<Appointment, SchedulingError> {
        let serial = self.serialize(id).await;
        let current = self.load_existing(id).await?;
        let staged = self.lifecycle().settle(&current, transition, self.clock.now())?;
        let appointment = self.persist(staged, Some(serial)).await?;
        info!(
            "appointment {id} on {} is now {}",
            appointment.slot(),
            appointment.status
        );
        Ok(appointment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> AppointmentPayload {
        AppointmentPayload {
            client_ref: "client-1".into(),
            service_ref: "svc-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn negative_cost_rejected() {
        let mut p = payload();
        p.cost_cents = Some(-1);
        let err = validate_payload(&"svc-1".into(), &p).unwrap_err();
        assert!(matches!(err, SchedulingError::InvalidPayload(_)));
        p.cost_cents = Some(0);
        assert!(validate_payload(&"svc-1".into(), &p).is_ok());
    }

    #[test]
    fn oversized_text_rejected() {
        let mut p = payload();
        p.notes = Some("x".repeat(MAX_NOTES_LEN + 1));
        assert!(validate_payload(&"svc-1".into(), &p).is_err());

        let mut p = payload();
        p.reason = Some("x".repeat(MAX_REASON_LEN + 1));
        assert!(validate_payload(&"svc-1".into(), &p).is_err());

        let mut p = payload();
        p.employee_ref = Some("e".repeat(MAX_REF_LEN + 1));
        assert!(validate_payload(&"svc-1".into(), &p).is_err());
    }

    #[test]
    fn empty_resource_key_rejected() {
        let err = validate_payload(&"".into(), &payload()).unwrap_err();
        assert!(matches!(err, SchedulingError::InvalidPayload("resource key is empty")));
    }
}
