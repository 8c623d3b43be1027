use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use crate::catalog::CatalogLookup;
use crate::compactor;
use crate::config::SchedulerConfig;
use crate::engine::{SchedulingError, SchedulingService, WarmReport};
use crate::store::StoreError;
use crate::wal::WalStore;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("cannot create data dir: {0}")]
    DataDir(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("warming conflict index: {0}")]
    Warm(#[from] SchedulingError),
    #[error("metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}

/// A WAL-backed scheduling service with its compactor running.
pub struct Scheduler {
    pub service: Arc<SchedulingService>,
    pub store: Arc<WalStore>,
    pub warmed: WarmReport,
    compactor: JoinHandle<()>,
}

impl Scheduler {
    /// Install logging and metrics, open the WAL under `config.data_dir`, rebuild claims,
    /// and start background compaction.
    pub async fn open(
        config: &SchedulerConfig,
        catalog: Arc<dyn CatalogLookup>,
    ) -> Result<Self, BootstrapError> {
        crate::observability::init_logging();
        crate::observability::init(config.metrics_port)?;
        std::fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(WalStore::open(config.wal_path())?);
        let service = Arc::new(
            SchedulingService::new(store.clone(), catalog)
                .with_persist_timeout(config.persist_timeout),
        );
        let warmed = service.warm().await?;

        let compactor = tokio::spawn(compactor::run_compactor(
            store.clone(),
            config.compact_threshold,
            config.compact_interval,
        ));
        info!("scheduler ready");
        info!("  data_dir: {}", config.data_dir.display());
        info!("  persist_timeout: {:?}", config.persist_timeout);
        info!("  claims restored: {}", warmed.claimed);

        Ok(Self { service, store, warmed, compactor })
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.compactor.abort();
    }
}
