use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{error, info};

use crate::cleanup::{Cleanup, CleanupReport};
use crate::engine::Engine;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Next `hour:00` UTC strictly after `now`: today if still ahead, otherwise tomorrow.
pub fn next_run_after(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(hour.min(23), 0, 0)
        .unwrap_or_else(|| now.date_naive().and_time(chrono::NaiveTime::MIN))
        .and_utc();
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

/// Background task that runs retention cleanup once a day at the configured hour.
pub async fn run_cleanup_scheduler(cleanup: Arc<Cleanup>) {
    let settings = cleanup.settings();
    info!(
        "cleanup scheduled daily at {:02}:00 UTC (retention {} days, auto cleanup {})",
        settings.cleanup_hour,
        settings.retention_days,
        if settings.auto_enabled { "on" } else { "off" }
    );
    loop {
        let now = Utc::now();
        let next = next_run_after(now, settings.cleanup_hour);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!("next cleanup at {next}");
        tokio::time::sleep(wait).await;
        run_scheduled_cleanup(&cleanup, Utc::now()).await;
    }
}

/// One timer tick. Failures are logged and left for the next tick.
pub(crate) async fn run_scheduled_cleanup(
    cleanup: &Cleanup,
    now: DateTime<Utc>,
) -> Option<CleanupReport> {
    let settings = cleanup.settings();
    if !settings.auto_enabled {
        info!("scheduled cleanup skipped: auto cleanup is off");
        return None;
    }
    info!("starting scheduled cleanup");
    match cleanup.run_at(settings.retention_days, now).await {
        Ok(report) => Some(report),
        Err(e) => {
            error!("scheduled cleanup failed: {e}");
            None
        }
    }
}

/// Background task that compacts the WAL once enough records have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}
