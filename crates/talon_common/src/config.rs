//! Region-core tunables.
//!
//! Defaults match the production flag values of the store; tests shrink the
//! thresholds to force snapshots, folds, and timeouts quickly.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Save a snapshot at most once per this interval.
    #[serde(default = "default_snapshot_interval_s")]
    pub snapshot_interval_s: u64,
    /// Save a snapshot when row count drifted this far from the last one.
    #[serde(default = "default_snapshot_diff_lines")]
    pub snapshot_diff_lines: i64,
    /// Save a snapshot when this many log entries applied since the last one.
    #[serde(default = "default_snapshot_diff_logs")]
    pub snapshot_diff_logs: u64,
    /// Total wall-clock budget for one split before it is declared failed.
    #[serde(default = "default_split_duration_ms")]
    pub split_duration_ms: u64,
    /// How long a writer may wait on the disable-write barrier.
    #[serde(default = "default_disable_write_wait_ms")]
    pub disable_write_wait_ms: u64,
    /// How long a structural op may wait for in-flight writes to drain.
    #[serde(default = "default_real_writing_wait_ms")]
    pub real_writing_wait_ms: u64,
    /// Posting-list length at which an L2 reverse list folds into L3.
    #[serde(default = "default_reverse_level2_len")]
    pub reverse_level2_len: usize,
    /// Minimum posting-list length worth keeping in the lookup cache.
    #[serde(default = "default_reverse_cached_list_len")]
    pub reverse_cached_list_len: usize,
    /// Capacity of the segmentation and big-list caches.
    #[serde(default = "default_reverse_cache_size")]
    pub reverse_cache_size: usize,
    /// Enqueue a compaction when this many deletes accumulated.
    #[serde(default = "default_compact_delete_lines")]
    pub compact_delete_lines: i64,
    /// Mid-split key may deviate from the median by this many percent.
    #[serde(default = "default_split_skew")]
    pub split_skew: u32,
    /// Log-gap below which split catch-up stops iterating and quiesces.
    #[serde(default = "default_split_catchup_log_gap")]
    pub split_catchup_log_gap: u64,
    /// RPC retries during split/merge before the coordinator aborts.
    #[serde(default = "default_split_rpc_retries")]
    pub split_rpc_retries: u32,
    /// Global cap on concurrent write applications.
    #[serde(default = "default_service_write_concurrency")]
    pub service_write_concurrency: usize,
    /// Global cap on concurrent row-lock acquisitions.
    #[serde(default = "default_service_lock_concurrency")]
    pub service_lock_concurrency: usize,
    /// Global cap on concurrent DDL backfills.
    #[serde(default = "default_ddl_work_concurrency")]
    pub ddl_work_concurrency: usize,
    /// Global cap on concurrent snapshot ingests.
    #[serde(default = "default_snapshot_load_concurrency")]
    pub snapshot_load_concurrency: usize,
    /// Check the cancellation flag every this many scanned rows.
    #[serde(default = "default_scan_cancel_check_rows")]
    pub scan_cancel_check_rows: u64,
    /// Finished-txn results kept for idempotent commit/rollback replies.
    #[serde(default = "default_finished_txn_capacity")]
    pub finished_txn_capacity: usize,
    /// A follower lagging more than this many log entries refuses
    /// follower reads so the client falls back to the leader.
    #[serde(default = "default_follower_read_max_lag")]
    pub follower_read_max_lag: u64,
}

fn default_snapshot_interval_s() -> u64 {
    600
}
fn default_snapshot_diff_lines() -> i64 {
    10_000
}
fn default_snapshot_diff_logs() -> u64 {
    2_000
}
fn default_split_duration_ms() -> u64 {
    3_600_000
}
fn default_disable_write_wait_ms() -> u64 {
    1_000
}
fn default_real_writing_wait_ms() -> u64 {
    1_000
}
fn default_reverse_level2_len() -> usize {
    5_000
}
fn default_reverse_cached_list_len() -> usize {
    3_000
}
fn default_reverse_cache_size() -> usize {
    300
}
fn default_compact_delete_lines() -> i64 {
    200_000
}
fn default_split_skew() -> u32 {
    5
}
fn default_split_catchup_log_gap() -> u64 {
    200
}
fn default_split_rpc_retries() -> u32 {
    3
}
fn default_service_write_concurrency() -> usize {
    40
}
fn default_service_lock_concurrency() -> usize {
    40
}
fn default_ddl_work_concurrency() -> usize {
    2
}
fn default_snapshot_load_concurrency() -> usize {
    4
}
fn default_scan_cancel_check_rows() -> u64 {
    1_024
}
fn default_finished_txn_capacity() -> usize {
    4_096
}
fn default_follower_read_max_lag() -> u64 {
    1_000
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_s: default_snapshot_interval_s(),
            snapshot_diff_lines: default_snapshot_diff_lines(),
            snapshot_diff_logs: default_snapshot_diff_logs(),
            split_duration_ms: default_split_duration_ms(),
            disable_write_wait_ms: default_disable_write_wait_ms(),
            real_writing_wait_ms: default_real_writing_wait_ms(),
            reverse_level2_len: default_reverse_level2_len(),
            reverse_cached_list_len: default_reverse_cached_list_len(),
            reverse_cache_size: default_reverse_cache_size(),
            compact_delete_lines: default_compact_delete_lines(),
            split_skew: default_split_skew(),
            split_catchup_log_gap: default_split_catchup_log_gap(),
            split_rpc_retries: default_split_rpc_retries(),
            service_write_concurrency: default_service_write_concurrency(),
            service_lock_concurrency: default_service_lock_concurrency(),
            ddl_work_concurrency: default_ddl_work_concurrency(),
            snapshot_load_concurrency: default_snapshot_load_concurrency(),
            scan_cancel_check_rows: default_scan_cancel_check_rows(),
            finished_txn_capacity: default_finished_txn_capacity(),
            follower_read_max_lag: default_follower_read_max_lag(),
        }
    }
}
