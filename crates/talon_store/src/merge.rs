//! Adjacent-range merge: the left region is absorbed into the right one.
//!
//! The left region quiesces (no live transactions, writes drained), then
//! asks the right region to extend its range down via
//! `ADJUSTKEY_AND_ADD_VERSION`. Once the right side applied, the left region
//! tombstones itself (`start_key == end_key`), remembers the absorber, and
//! every later client request bounces with VERSION_OLD carrying the
//! absorber's descriptor so clients retarget without a directory lookup.

use std::sync::Arc;
use std::time::Duration;

use talon_common::error::{ErrCode, RegionError};
use talon_proto::{OpType, RegionInfo, StoreRequest, StoreResponse};
use talon_raft::LogEntry;
use tracing::{info, warn};

use crate::region::Region;

impl Region {
    /// Run the merge protocol on the left region's leader.
    pub fn start_process_merge(self: &Arc<Self>, right: RegionInfo) -> StoreResponse {
        if !self.is_leader() {
            return self.region_error(RegionError::NotLeader {
                region_id: self.region_id_typed(),
                leader: Some(self.leader_hint()),
            });
        }
        let guard = match self.gate.acquire() {
            Ok(g) => g,
            Err(e) => return self.region_error(e),
        };
        let info = self.region_info();
        if info.end_key.is_empty() || info.end_key != right.start_key {
            drop(guard);
            return self.region_error(RegionError::RangeMismatch {
                region_id: self.region_id_typed(),
                detail: "regions not adjacent".into(),
            });
        }
        if !self.txn_pool.is_empty() {
            drop(guard);
            return self.region_error(RegionError::RegionBusy {
                region_id: self.region_id_typed(),
            });
        }
        // Only a drained region merges away; the scheduler empties it first.
        if self.num_table_lines() != 0 {
            drop(guard);
            return self.region_error(RegionError::RangeMismatch {
                region_id: self.region_id_typed(),
                detail: format!("merge source still holds {} rows", self.num_table_lines()),
            });
        }
        let barrier = match self
            .barrier
            .disable_and_drain(Duration::from_millis(self.config.real_writing_wait_ms))
        {
            Ok(b) => b,
            Err(e) => {
                drop(guard);
                return self.region_error(e);
            }
        };

        // Right region extends down and bumps its version.
        let adjust = StoreRequest {
            op_type: OpType::AdjustkeyAndAddVersion,
            region_id: right.region_id,
            region_version: right.version,
            start_key: info.start_key.clone(),
            end_key: right.end_key.clone(),
            version: right.version + 1,
            ..Default::default()
        };
        let resp = self.directory.send(right.region_id, adjust);
        if !resp.is_success() {
            warn!(
                region_id = self.region_id(),
                right = right.region_id,
                errmsg = %resp.errmsg,
                "merge aborted: right region rejected adjust"
            );
            drop(barrier);
            drop(guard);
            return resp;
        }
        let mut absorbed = right.clone();
        absorbed.start_key = info.start_key.clone();
        absorbed.version = right.version + 1;
        absorbed.leader = resp.leader.clone();

        // Left region tombstones itself through its own consensus entry.
        let tombstone = StoreRequest {
            op_type: OpType::AdjustkeyAndAddVersion,
            region_id: self.region_id(),
            region_version: info.version,
            start_key: info.end_key.clone(),
            end_key: info.end_key.clone(),
            version: info.version + 1,
            new_region_info: Some(absorbed.clone()),
            ..Default::default()
        };
        let resp = self.propose_and_wait(tombstone);
        drop(barrier);
        drop(guard);
        if !resp.is_success() {
            return resp;
        }
        info!(
            region_id = self.region_id(),
            right = right.region_id,
            "merged away into right region"
        );
        let mut out = StoreResponse::success();
        out.regions.push(absorbed);
        out
    }
}

/// Apply side of `ADJUSTKEY_AND_ADD_VERSION`, shared by both roles:
/// - absorber: extend `start_key` down, bump version
/// - absorbed: `start_key == end_key` tombstone, remember the absorber
pub(crate) fn apply_adjustkey_and_add_version(
    region: &Arc<Region>,
    request: &StoreRequest,
    entry: &LogEntry,
) -> StoreResponse {
    let info = region.region_info();
    let tombstone = request.start_key == request.end_key;
    if request.version <= info.version {
        let _ = region.persist_applied_direct(entry.index, entry.term);
        return StoreResponse::error(ErrCode::InternalError, "merge version not newer");
    }
    if !tombstone {
        // Extending down: the new start must sit at or below the current
        // one, and the end must be unchanged.
        if request.end_key != info.end_key || request.start_key > info.start_key {
            let _ = region.persist_applied_direct(entry.index, entry.term);
            return StoreResponse::error(ErrCode::InternalError, "merge ranges not adjacent");
        }
    } else if info.end_key.is_empty() || request.start_key != info.end_key {
        let _ = region.persist_applied_direct(entry.index, entry.term);
        return StoreResponse::error(ErrCode::InternalError, "bad merge tombstone");
    }
    region.set_region_range(request.start_key.clone(), request.end_key.clone(), request.version);
    if let Some(target) = &request.new_region_info {
        region.set_merge_target(target.clone());
    }
    if let Err(e) = region.persist_region_info() {
        return region.fatal_apply_error(e);
    }
    if let Err(e) = region.persist_applied_direct(entry.index, entry.term) {
        return region.fatal_apply_error(e);
    }
    let mut resp = StoreResponse::success();
    resp.leader = region.leader_hint();
    info!(
        region_id = region.region_id(),
        version = request.version,
        tombstone,
        "adjustkey-and-add-version applied"
    );
    resp
}
