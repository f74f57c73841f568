//! Snapshot save/load for one region.
//!
//! A snapshot is the two logical files of `talon_storage::sst` plus the meta
//! records they carry. Saving is rate-limited by interval and triggered by
//! log/row drift; loading clears any stale state in the region's key range,
//! ingests whatever files exist, re-reads the durable meta records, and
//! re-installs prepared-but-uncommitted transactions.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use talon_common::error::TalonError;
use talon_storage::sst;
use tracing::{info, warn};

use crate::region::Region;

impl Region {
    /// Snapshot cadence check, run after every apply. Failures are logged,
    /// not fatal: the log still covers the state.
    pub(crate) fn maybe_save_snapshot(self: &Arc<Self>) {
        let interval = Duration::from_secs(self.config.snapshot_interval_s);
        if self.last_snapshot_at.lock().elapsed() < interval {
            return;
        }
        let log_gap = self
            .applied_index()
            .saturating_sub(self.last_snapshot_index.load(Ordering::SeqCst));
        let line_gap =
            (self.num_table_lines() - self.last_snapshot_lines.load(Ordering::SeqCst)).abs();
        if log_gap < self.config.snapshot_diff_logs
            && line_gap < self.config.snapshot_diff_lines
        {
            return;
        }
        if let Err(e) = self.save_snapshot() {
            warn!(region_id = self.region_id(), "snapshot save failed: {e}");
        }
    }

    /// Persist the region's data and meta files. The `doing_snapshot`
    /// sentinel brackets the write so a crash mid-save is detectable.
    pub fn save_snapshot(self: &Arc<Self>) -> Result<(), TalonError> {
        let region_id = self.region_id();
        self.meta.write_doing_snapshot(region_id)?;
        let snapshot = self.engine.snapshot();
        let (data_entries, meta_entries) =
            sst::write_region_snapshot(&snapshot, &self.meta, region_id, &self.snapshot_dir)?;
        self.meta.clear_doing_snapshot(region_id)?;
        self.last_snapshot_index.store(self.applied_index(), Ordering::SeqCst);
        self.last_snapshot_lines.store(self.num_table_lines(), Ordering::SeqCst);
        *self.last_snapshot_at.lock() = Instant::now();
        info!(
            region_id,
            data_entries, meta_entries, "snapshot saved to {}", self.snapshot_dir.display()
        );
        Ok(())
    }

    /// Install the snapshot files present in this region's snapshot
    /// directory: clear the key range, ingest, then rebuild volatile state
    /// from the durable records — including prepared-txn recovery.
    pub fn load_snapshot(self: &Arc<Self>) -> Result<(), TalonError> {
        let region_id = self.region_id();
        if self.meta.read_doing_snapshot(region_id) {
            warn!(region_id, "previous snapshot save did not finish; loading files anyway");
        }
        self.meta.write_doing_snapshot(region_id)?;
        let (data_entries, meta_entries) =
            sst::load_region_snapshot(&self.engine, region_id, &self.snapshot_dir)?;
        self.meta.clear_doing_snapshot(region_id)?;

        // Durable records are now authoritative.
        let (applied_index, applied_term) = self.meta.read_applied_index(region_id)?;
        let lines = self.meta.read_num_table_lines(region_id)?;
        self.set_applied(applied_index, applied_term);
        self.set_num_table_lines(lines);
        if let Some(stored) = self.meta.read_region_info(region_id)? {
            self.set_region_range(stored.start_key.clone(), stored.end_key.clone(), stored.version);
        }
        self.last_snapshot_index.store(applied_index, Ordering::SeqCst);
        self.last_snapshot_lines.store(lines, Ordering::SeqCst);
        self.recover_prepared_txns()?;
        info!(
            region_id,
            data_entries, meta_entries, applied_index, lines, "snapshot installed"
        );
        Ok(())
    }
}
