//! Scan-status reconciliation.
//!
//! The scanner can die mid-harvest, leaving a scan in `running` forever.
//! A stale running scan that produced catalog rows is promoted to
//! `completed` (the data is usable); one with no rows is marked `failed`.
//! The sweep is idempotent: the final state depends only on row presence.

use crate::domain::error::Result;
use crate::infrastructure::db::catalog_repo::CatalogRepository;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

pub const SCAN_INTERRUPTED_MESSAGE: &str = "Scan interrupted before any catalog rows were written";

pub struct ScanReconciler {
    repo: Arc<CatalogRepository>,
}

impl ScanReconciler {
    pub fn new(repo: Arc<CatalogRepository>) -> Self {
        Self { repo }
    }

    /// Sweeps running scans older than `stale_minutes` for the given
    /// connections.
    pub async fn reconcile(&self, connection_ids: &[i64], stale_minutes: i64) -> Result<()> {
        if connection_ids.is_empty() {
            return Ok(());
        }
        let cutoff = Utc::now() - Duration::minutes(stale_minutes);
        let stale = self
            .repo
            .load_stale_running_scans(connection_ids, cutoff)
            .await?;

        for scan in stale {
            let now = Utc::now();
            if self.repo.scan_has_catalog(scan.id).await? {
                warn!(
                    scan_id = scan.id,
                    connection_id = scan.connection_id,
                    "scan_promoted_to_completed"
                );
                self.repo.complete_scan(scan.id, now).await?;
            } else {
                info!(
                    scan_id = scan.id,
                    connection_id = scan.connection_id,
                    "scan_marked_failed"
                );
                self.repo
                    .fail_scan(scan.id, now, SCAN_INTERRUPTED_MESSAGE)
                    .await?;
            }
        }
        Ok(())
    }
}
