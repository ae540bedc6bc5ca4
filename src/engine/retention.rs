//! Data retention.
//!
//! Jobs (and their logs) older than the `data_retention_days` system setting
//! are deleted, then storage is compacted. A missing, unparsable or
//! non-positive setting disables the sweep.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

use crate::engine::storage::{PurgeStats, RemediationStore};
use crate::models::DATA_RETENTION_DAYS;
use crate::Result;

/// Parse the retention setting; `None` means retention is off.
pub fn retention_days(setting: Option<&str>) -> Option<i64> {
    setting?.trim().parse::<i64>().ok().filter(|days| *days > 0)
}

pub struct RetentionSweeper {
    store: Arc<dyn RemediationStore>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn RemediationStore>) -> Self {
        Self { store }
    }

    /// Purge expired jobs. Returns `None` when retention is disabled.
    pub async fn sweep(&self) -> Result<Option<PurgeStats>> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Option<PurgeStats>> {
        let setting = self.store.get_setting(DATA_RETENTION_DAYS).await?;
        let days = match retention_days(setting.as_deref()) {
            Some(days) => days,
            None => {
                debug!("Retention disabled (setting: {:?})", setting);
                return Ok(None);
            }
        };

        let cutoff = now - Duration::days(days);
        info!("Running retention cleanup for data older than {} days (cutoff {})", days, cutoff);

        let stats = self.store.purge_jobs_before(cutoff).await?;
        info!("Retention cleanup removed {} job(s) and {} log line(s)", stats.jobs, stats.logs);

        if let Err(e) = self.store.compact().await {
            error!("Storage compaction failed: {}", e);
        }
        Ok(Some(stats))
    }

    /// Scheduled entry point: failures are logged, never propagated.
    pub async fn run_logged(&self) {
        if let Err(e) = self.sweep().await {
            error!("Retention sweep failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_setting_parsing() {
        assert_eq!(retention_days(Some("30")), Some(30));
        assert_eq!(retention_days(Some(" 7 ")), Some(7));
        assert_eq!(retention_days(Some("0")), None);
        assert_eq!(retention_days(Some("-5")), None);
        assert_eq!(retention_days(Some("thirty")), None);
        assert_eq!(retention_days(None), None);
    }
}
