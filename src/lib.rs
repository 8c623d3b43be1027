//! Appointment scheduling core: grid validation, per-slot conflict claims, and the
//! appointment lifecycle, behind a façade for an external admin layer.

pub mod bootstrap;
pub mod catalog;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod grid;
pub mod limits;
pub mod model;
pub mod observability;
pub mod store;
pub mod wal;

pub use bootstrap::Scheduler;
pub use engine::{SchedulingError, SchedulingService};
