mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;

pub use conflict::{ClaimGuard, Claimed, ConflictIndex};
pub use error::SchedulingError;
pub use lifecycle::{AppointmentLifecycle, StagedTransition, Transition};

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, oneshot};
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogLookup;
use crate::grid::{Clock, SystemClock, TimeGridPolicy};
use crate::model::*;
use crate::store::{AppointmentStore, StoreError};

pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-appointment serialization point.
type AppointmentLock = Arc<Mutex<()>>;
type LockTable = DashMap<AppointmentId, AppointmentLock>;

/// Exclusive hold on one appointment's mutations.
///
/// Dropping it unlocks and removes the table entry once nobody else holds or awaits it,
/// whether the holder finished, failed, or was abandoned while waiting.
pub(super) struct Serial {
    locks: Arc<LockTable>,
    id: AppointmentId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Serial {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// What `warm` found in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmReport {
    pub resources: usize,
    pub claimed: usize,
    /// Scheduled records whose slot was already claimed by another record.
    pub duplicates: usize,
}

/// Façade used by the admin layer: create, reschedule, finalize, cancel, mark no-show.
///
/// Owns the conflict index. Nothing outside this type mutates claims.
pub struct SchedulingService {
    store: Arc<dyn AppointmentStore>,
    catalog: Arc<dyn CatalogLookup>,
    clock: Arc<dyn Clock>,
    policy: TimeGridPolicy,
    index: Arc<ConflictIndex>,
    locks: Arc<LockTable>,
    persist_timeout: Duration,
}

impl SchedulingService {
    pub fn new(store: Arc<dyn AppointmentStore>, catalog: Arc<dyn CatalogLookup>) -> Self {
        Self {
            store,
            catalog,
            clock: Arc::new(SystemClock),
            policy: TimeGridPolicy::new(),
            index: Arc::new(ConflictIndex::new()),
            locks: Arc::new(DashMap::new()),
            persist_timeout: DEFAULT_PERSIST_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &TimeGridPolicy {
        &self.policy
    }

    pub(super) fn lifecycle(&self) -> AppointmentLifecycle<'_> {
        AppointmentLifecycle::new(&self.policy, &self.index)
    }

    /// Run a store call under the persist timeout.
    pub(super) async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, SchedulingError> {
        match tokio::time::timeout(self.persist_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SchedulingError::StoreTimeout(self.persist_timeout)),
        }
    }

    /// Save the staged record, then commit or roll back on the store's own answer.
    ///
    /// The save runs on a separate task that is never cut short, so the index always
    /// ends up matching what the store holds. A caller that hits the persist timeout
    /// or goes away only stops waiting: claims and the serial hold stay in place until
    /// the save resolves.
    pub(super) async fn persist(
        &self,
        staged: StagedTransition,
        serial: Option<Serial>,
    ) -> Result<Appointment, SchedulingError> {
        let store = Arc::clone(&self.store);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let saved = store.save(staged.next()).await;
            let outcome = match saved {
                Ok(()) => Ok(staged.commit()),
                Err(e) => {
                    drop(staged);
                    Err(e)
                }
            };
            drop(serial);
            if let Err(outcome) = tx.send(outcome) {
                match outcome {
                    Ok(a) => info!("appointment {} on {} persisted after its caller stopped waiting", a.id, a.slot()),
                    Err(e) => warn!("abandoned save failed, claims rolled back: {e}"),
                }
            }
        });
        match tokio::time::timeout(self.persist_timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome?),
            Ok(Err(_)) => Err(SchedulingError::Store(StoreError::Closed)),
            Err(_) => Err(SchedulingError::StoreTimeout(self.persist_timeout)),
        }
    }

    pub(super) async fn load_existing(&self, id: AppointmentId) -> Result<Appointment, SchedulingError> {
        self.bounded(self.store.load(id))
            .await?
            .ok_or(SchedulingError::NotFound(id))
    }

    /// Wait for exclusive access to `id`'s mutations.
    pub(super) async fn serialize(&self, id: AppointmentId) -> Serial {
        let lock = self.locks.entry(id).or_default().value().clone();
        let mut serial = Serial {
            locks: Arc::clone(&self.locks),
            id,
            guard: None,
        };
        serial.guard = Some(lock.lock_owned().await);
        serial
    }

    /// Rebuild the conflict index from every scheduled appointment in the store.
    pub async fn warm(&self) -> Result<WarmReport, SchedulingError> {
        let keys = self.bounded(self.store.resource_keys()).await?;
        let lists = futures::future::try_join_all(
            keys.iter()
                .map(|k| self.bounded(self.store.list_active_by_resource(k))),
        )
        .await?;
        let mut report = WarmReport {
            resources: keys.len(),
            ..Default::default()
        };
        for list in lists {
            self.restore_claims(list, &mut report);
        }
        info!(
            "conflict index warmed: {} resources, {} claims, {} duplicates",
            report.resources,
            report.claimed,
            report.duplicates
        );
        Ok(report)
    }

    /// Rebuild claims for a single resource.
    pub async fn warm_resource(&self, resource: &ResourceKey) -> Result<WarmReport, SchedulingError> {
        let list = self
            .bounded(self.store.list_active_by_resource(resource))
            .await?;
        let mut report = WarmReport {
            resources: 1,
            ..Default::default()
        };
        self.restore_claims(list, &mut report);
        Ok(report)
    }

    /// Stored times are historical facts: claims are restored without grid validation.
    fn restore_claims(&self, appointments: Vec<Appointment>, report: &mut WarmReport) {
        for appt in appointments.into_iter().filter(Appointment::is_active) {
            match self.index.try_claim(&appt.slot(), appt.id) {
                Ok(Claimed::Fresh) => report.claimed += 1,
                Ok(Claimed::AlreadyHeld) => {}
                Err(SchedulingError::SlotConflict { slot, holder }) => {
                    warn!("duplicate scheduled claim on {slot}: {} loses to {holder}", appt.id);
                    report.duplicates += 1;
                }
                Err(e) => debug!("skipping {} while warming: {e}", appt.id),
            }
        }
    }
}

/// Record the outcome of one façade call.
pub(super) fn observe<T>(op: &'static str, result: &Result<T, SchedulingError>, started: Instant) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => {
            match e {
                SchedulingError::SlotConflict { .. } => warn!("{op} rejected: {e}"),
                e if e.is_infrastructure() => error!("{op} failed: {e}"),
                e => debug!("{op} rejected: {e}"),
            }
            e.label()
        }
    };
    metrics::counter!(crate::observability::OPERATIONS_TOTAL, "op" => op, "outcome" => outcome)
        .increment(1);
    metrics::histogram!(crate::observability::OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
