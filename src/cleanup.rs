use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::info;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_RETENTION_DAYS;
use crate::observability;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupSettings {
    /// Days a processed booking is kept, counted from its creation.
    pub retention_days: u32,
    /// UTC hour of the daily run.
    pub cleanup_hour: u32,
    /// Whether the daily timer runs cleanup at all.
    pub auto_enabled: bool,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            retention_days: 10,
            cleanup_hour: 2,
            auto_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStatus {
    pub enabled: bool,
    pub retention_days: u32,
    pub cleanup_hour: u32,
    pub auto_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Cleanup was disabled; nothing was looked at.
    pub skipped: bool,
    pub approved_deleted: u64,
    pub rejected_deleted: u64,
    pub cancelled_deleted: u64,
    pub total: u64,
    pub cutoff: DateTime<Utc>,
}

/// Retention purge of processed bookings, shared by the daily timer and
/// on-demand runs.
pub struct Cleanup {
    engine: Arc<Engine>,
    enabled: AtomicBool,
    /// Serializes overlapping runs (timer vs manual).
    run_guard: Mutex<()>,
    settings: CleanupSettings,
}

impl Cleanup {
    pub fn new(engine: Arc<Engine>, settings: CleanupSettings) -> Self {
        Self {
            engine,
            enabled: AtomicBool::new(true),
            run_guard: Mutex::new(()),
            settings,
        }
    }

    pub fn settings(&self) -> CleanupSettings {
        self.settings
    }

    pub fn status(&self) -> CleanupStatus {
        CleanupStatus {
            enabled: self.is_enabled(),
            retention_days: self.settings.retention_days,
            cleanup_hour: self.settings.cleanup_hour,
            auto_enabled: self.settings.auto_enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!("retention cleanup {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Run with the configured retention.
    pub async fn run_now(&self) -> Result<CleanupReport, EngineError> {
        info!("manual cleanup triggered");
        self.run(self.settings.retention_days).await
    }

    pub async fn run(&self, retention_days: u32) -> Result<CleanupReport, EngineError> {
        self.run_at(retention_days, Utc::now()).await
    }

    /// Purge processed bookings created before `now - retention_days`.
    pub async fn run_at(
        &self,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Result<CleanupReport, EngineError> {
        if !(1..=MAX_RETENTION_DAYS).contains(&retention_days) {
            return Err(EngineError::BadRequest(format!(
                "retention must be 1..={MAX_RETENTION_DAYS} days"
            )));
        }
        let _running = self.run_guard.lock().await;
        let cutoff = now - TimeDelta::days(i64::from(retention_days));

        if !self.is_enabled() {
            info!("cleanup skipped: disabled by admin");
            metrics::counter!(observability::CLEANUP_RUNS_TOTAL, "outcome" => "skipped").increment(1);
            return Ok(CleanupReport {
                skipped: true,
                approved_deleted: 0,
                rejected_deleted: 0,
                cancelled_deleted: 0,
                total: 0,
                cutoff,
            });
        }

        let counts = match self.engine.purge_processed(cutoff).await {
            Ok(counts) => counts,
            Err(e) => {
                metrics::counter!(observability::CLEANUP_RUNS_TOTAL, "outcome" => "failed")
                    .increment(1);
                return Err(e);
            }
        };

        metrics::counter!(observability::CLEANUP_RUNS_TOTAL, "outcome" => "completed").increment(1);
        for (status, n) in [
            ("approved", counts.approved),
            ("rejected", counts.rejected),
            ("cancelled", counts.cancelled),
        ] {
            metrics::counter!(observability::CLEANUP_DELETED_TOTAL, "status" => status).increment(n);
        }
        info!(
            "cleanup completed: deleted {} booking(s) created before {cutoff} \
             (approved: {}, rejected: {}, cancelled: {})",
            counts.total(),
            counts.approved,
            counts.rejected,
            counts.cancelled
        );

        Ok(CleanupReport {
            skipped: false,
            approved_deleted: counts.approved,
            rejected_deleted: counts.rejected,
            cancelled_deleted: counts.cancelled,
            total: counts.total(),
            cutoff,
        })
    }
}
