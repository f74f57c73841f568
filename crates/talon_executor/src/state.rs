//! Per-request execution state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use talon_common::error::ExecError;
use talon_common::schema::{IndexInfo, TableInfo};
use talon_common::value::Value;
use talon_proto::{RegionInfo, TupleDescriptor};
use talon_reverse::ReverseIndex;
use talon_storage::kv::KvSnapshot;
use talon_txn::pool::SharedTxn;

/// Immutable bundle published by the region and snapshotted at RPC entry.
/// Structural operations replace the whole bundle; in-flight requests keep
/// the old one alive until they finish.
pub struct RegionResource {
    pub region_info: RegionInfo,
    pub table: Arc<TableInfo>,
    /// All indexes of the table, primary first.
    pub indexes: Vec<Arc<IndexInfo>>,
    pub reverse_indexes: HashMap<u64, Arc<ReverseIndex>>,
}

impl RegionResource {
    pub fn pk_index(&self) -> Result<&Arc<IndexInfo>, ExecError> {
        self.indexes
            .first()
            .ok_or(ExecError::UnknownTable(self.region_info.table_id))
    }

    pub fn index(&self, index_id: u64) -> Option<&Arc<IndexInfo>> {
        self.indexes.iter().find(|i| i.id.0 == index_id)
    }
}

/// Execution state for one plan invocation.
pub struct RuntimeState {
    pub resource: Arc<RegionResource>,
    /// Present for DML and in-transaction reads.
    pub txn: Option<SharedTxn>,
    /// Read view for out-of-transaction scans.
    pub snapshot: KvSnapshot,
    pub tuples: Vec<TupleDescriptor>,
    pub cancelled: Arc<AtomicBool>,
    /// Cancellation is checked every this many scanned rows.
    pub cancel_check_rows: u64,
    pub affected_rows: i64,
    /// Net row-count delta produced by this command.
    pub num_increase_rows: i64,
    /// Indexes the scan actually used (reported back for diagnostics).
    pub scan_indexes: Vec<u64>,
    /// Split-time replay mode: rows outside the region range are skipped
    /// silently instead of failing the statement.
    pub skip_out_of_range: bool,
}

impl RuntimeState {
    pub fn new(
        resource: Arc<RegionResource>,
        snapshot: KvSnapshot,
        txn: Option<SharedTxn>,
        tuples: Vec<TupleDescriptor>,
        cancel_check_rows: u64,
    ) -> Self {
        Self {
            resource,
            txn,
            snapshot,
            tuples,
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_check_rows: cancel_check_rows.max(1),
            affected_rows: 0,
            num_increase_rows: 0,
            scan_indexes: Vec::new(),
            skip_out_of_range: false,
        }
    }

    pub fn tuple(&self, tuple_id: u32) -> Option<&TupleDescriptor> {
        self.tuples.iter().find(|t| t.tuple_id == tuple_id)
    }

    pub fn check_cancelled(&self) -> Result<(), ExecError> {
        if self.cancelled.load(Ordering::Relaxed) {
            Err(ExecError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What a plan run hands back to the region.
#[derive(Debug, Default)]
pub struct ExecResult {
    pub affected_rows: i64,
    pub rows: Vec<Vec<Value>>,
    pub scan_indexes: Vec<u64>,
}
