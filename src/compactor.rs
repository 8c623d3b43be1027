use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::wal::WalStore;

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&store, threshold).await;
    }
}

/// One compactor pass. Returns true if the log was rewritten.
pub async fn compact_if_needed(store: &WalStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(kept) => {
            info!("compacted {}: {appends} appends down to {kept} records", store.path().display());
            true
        }
        Err(e) => {
            // Next tick retries.
            warn!("compaction of {} failed: {e}", store.path().display());
            false
        }
    }
}
