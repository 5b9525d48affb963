use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::engine::{Ledger, today};

const REAP_INTERVAL: Duration = Duration::from_secs(60);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Drop queued requests for days that are over. Returns how many went.
pub async fn reap_once(ledger: &Ledger, today: NaiveDate) -> usize {
    match ledger.expire_waitlist(today).await {
        Ok(expired) => {
            for id in &expired {
                info!("expired waitlist entry {id}");
            }
            expired.len()
        }
        Err(e) => {
            warn!("waitlist expiry failed: {e}");
            0
        }
    }
}

/// Compact once the WAL has grown by `threshold` appends. Returns whether it
/// compacted.
pub async fn compact_if_needed(ledger: &Ledger, threshold: u64) -> bool {
    let appends = ledger.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match ledger.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that expires stale waitlist entries.
pub async fn run_reaper(ledger: Arc<Ledger>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        let n = reap_once(&ledger, today()).await;
        debug!("reaper pass removed {n} entries");
    }
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(ledger: Arc<Ledger>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&ledger, threshold).await;
    }
}
