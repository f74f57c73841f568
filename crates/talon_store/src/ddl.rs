//! Per-region online DDL work.
//!
//! The meta service walks a table's target index state through the linear
//! ADD (None → DeleteOnly → WriteOnly → WriteLocal → Public) and DROP
//! (Public → WriteOnly → DeleteOnly → DeleteLocal → None) ladders, one step
//! per heartbeat round once every region converged. The region's share of
//! the work is local: persist the state it reached, backfill the index from
//! a consistent snapshot at WRITE_LOCAL, and delete the index's key range at
//! DELETE_LOCAL. Everything else is bookkeeping the write path reads from
//! the schema snapshot.

use std::sync::Arc;

use talon_common::error::{ErrCode, TxnError};
use talon_common::schema::IndexState;
use talon_common::types::IndexId;
use talon_proto::{DdlOp, DdlWorkDirective, StoreResponse};
use talon_storage::codec;
use talon_storage::kv::Cf;
use talon_storage::meta::DdlInfoRecord;
use talon_txn::Transaction;
use tracing::{info, warn};

use crate::region::Region;

impl Region {
    /// Advance this region's ddl work toward the directive's target state.
    /// The heavy phases hold the structural status gate.
    pub fn process_ddl_work(self: &Arc<Self>, directive: &DdlWorkDirective) -> StoreResponse {
        let record = DdlInfoRecord {
            table_id: directive.table_id,
            index_id: directive.index_id,
            state: directive.target_state,
        };
        match (directive.op, directive.target_state) {
            (DdlOp::AddIndex, IndexState::WriteLocal) => self.ddl_backfill(directive, record),
            (DdlOp::DropIndex, IndexState::DeleteLocal) => self.ddl_delete_local(directive, record),
            (DdlOp::AddIndex, IndexState::Public) | (DdlOp::DropIndex, IndexState::None) => {
                // Terminal states: the job is done, drop the work record.
                if let Err(e) = self.meta.clear_ddl_info(self.region_id()) {
                    return self.fatal_apply_error(talon_common::error::TalonError::Kv(e));
                }
                if directive.op == DdlOp::DropIndex {
                    self.reverse_indexes.write().remove(&directive.index_id);
                }
                self.build_reverse_indexes();
                self.publish_resource();
                info!(
                    region_id = self.region_id(),
                    index_id = directive.index_id,
                    state = ?directive.target_state,
                    "ddl work finished"
                );
                StoreResponse::success()
            }
            _ => {
                // Intermediate visibility states: persist and republish.
                if let Err(e) = self.meta.write_ddl_info(self.region_id(), &record) {
                    return self.fatal_apply_error(talon_common::error::TalonError::Kv(e));
                }
                self.build_reverse_indexes();
                self.publish_resource();
                StoreResponse::success()
            }
        }
    }

    /// WRITE_LOCAL: build the index from a consistent snapshot of the
    /// routing index. Each entry commits under a short transaction holding
    /// the row lock, so concurrent writers never interleave within a row.
    fn ddl_backfill(
        self: &Arc<Self>,
        directive: &DdlWorkDirective,
        record: DdlInfoRecord,
    ) -> StoreResponse {
        let guard = match self.gate.acquire() {
            Ok(g) => g,
            Err(e) => return self.region_error(e),
        };
        if let Err(e) = self.meta.write_ddl_info(self.region_id(), &record) {
            return self.fatal_apply_error(talon_common::error::TalonError::Kv(e));
        }
        self.build_reverse_indexes();
        self.publish_resource();

        let resource = self.resource();
        let Some(index) = resource.index(directive.index_id).cloned() else {
            drop(guard);
            return StoreResponse::error(ErrCode::InputParamError, "ddl for unknown index");
        };
        let pk_index = match resource.pk_index() {
            Ok(pk) => pk.clone(),
            Err(e) => {
                drop(guard);
                return StoreResponse::error(ErrCode::InternalError, e.to_string());
            }
        };
        let region_info = resource.region_info.clone();
        let mut state = self.runtime_state(None);
        let rows = match talon_executor::scan::scan_region_rows(&mut state) {
            Ok(rows) => rows,
            Err(e) => {
                drop(guard);
                return StoreResponse::error(ErrCode::ExecFail, e.to_string());
            }
        };
        let mut built = 0u64;
        for (pk_tuple, _) in rows {
            let mut txn =
                Transaction::begin(&self.engine, self.engine.internal_txn_id(), self.region_id());
            // Re-read under the row lock; the snapshot row may be stale.
            let row = match txn.get_update_primary(&region_info, &pk_index, &pk_tuple) {
                Ok(Some(row)) => row,
                Ok(None) => continue,
                Err(e) => {
                    drop(guard);
                    return StoreResponse::error(ErrCode::InternalError, e.to_string());
                }
            };
            let write_res = if index.is_fulltext() {
                match self.reverse_indexes.read().get(&directive.index_id) {
                    Some(reverse) => {
                        let word = index
                            .fields
                            .first()
                            .and_then(|f| row.get(f.0))
                            .map(|v| v.get_string())
                            .unwrap_or_default();
                        reverse.insert_reverse(&mut txn, &word, &pk_tuple)
                    }
                    None => Ok(()),
                }
            } else {
                txn.put_secondary(self.region_id(), &index, &row, &pk_tuple)
            };
            match write_res {
                Ok(()) => {}
                Err(TxnError::UniqueConflict { .. }) => {
                    // The backfill found two rows claiming one unique key:
                    // the whole DDL job must roll back at the meta service.
                    txn.rollback();
                    let reverted = DdlInfoRecord { state: IndexState::WriteOnly, ..record };
                    let _ = self.meta.write_ddl_info(self.region_id(), &reverted);
                    drop(guard);
                    warn!(
                        region_id = self.region_id(),
                        index_id = directive.index_id,
                        "ddl backfill unique conflict"
                    );
                    return StoreResponse::error(
                        ErrCode::DdlUniqueKeyFail,
                        "unique key conflict during index backfill",
                    );
                }
                Err(e) => {
                    txn.rollback();
                    drop(guard);
                    return StoreResponse::error(ErrCode::InternalError, e.to_string());
                }
            }
            if let Err(e) = txn.commit() {
                drop(guard);
                return self.fatal_apply_error(talon_common::error::TalonError::Txn(e));
            }
            built += 1;
        }
        drop(guard);
        info!(
            region_id = self.region_id(),
            index_id = directive.index_id,
            built,
            "ddl backfill complete"
        );
        StoreResponse::success()
    }

    /// DELETE_LOCAL: drop the whole key range of the index in this region.
    fn ddl_delete_local(
        self: &Arc<Self>,
        directive: &DdlWorkDirective,
        record: DdlInfoRecord,
    ) -> StoreResponse {
        let guard = match self.gate.acquire() {
            Ok(g) => g,
            Err(e) => return self.region_error(e),
        };
        let start = codec::key_prefix(self.region_id(), directive.index_id);
        let end = codec::key_prefix(self.region_id(), directive.index_id + 1);
        let removed = self.engine.delete_range(Cf::Data, &start, Some(&end));
        if let Err(e) = self.meta.write_ddl_info(self.region_id(), &record) {
            drop(guard);
            return self.fatal_apply_error(talon_common::error::TalonError::Kv(e));
        }
        drop(guard);
        info!(
            region_id = self.region_id(),
            index_id = directive.index_id,
            removed,
            "ddl delete-local complete"
        );
        StoreResponse::success()
    }

    /// The in-progress ddl state reported upward with every heartbeat.
    pub fn ddl_heartbeat_state(&self) -> Option<(u64, IndexState)> {
        self.meta
            .read_ddl_info(self.region_id())
            .ok()
            .flatten()
            .map(|r| (r.index_id, r.state))
    }

    pub fn schema_index_state(&self, index_id: u64) -> Option<IndexState> {
        self.schema.get_index(IndexId(index_id)).map(|i| i.state)
    }
}
