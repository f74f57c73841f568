//! The multi-phase split protocol.
//!
//! Leader-side sequence (each phase its own consensus entry where replicas
//! must agree):
//!
//! 1. provision the child region (version 0, DOING) on the parent's peers
//! 2. `START_SPLIT` / `START_SPLIT_FOR_TAIL` — pin the split point, the
//!    backfill snapshot, and the prepared-txn set
//! 3. backfill the child's key range from the pinned snapshot (re-keyed,
//!    range-filtered, column mirror and reverse postings included)
//! 4. replay prepared transactions on the child
//! 5. ship log entries `[split_start_index+1 ..]` until the gap converges,
//!    then raise the disable-write barrier and drain (mid split only)
//! 6. `ADD_VERSION_FOR_SPLIT_REGION` on the child (version 0 → 1)
//! 7. `VALIDATE_AND_ADD_VERSION` on the parent (truncate range, bump
//!    version, hand over row counts)
//! 8. soft leader handover when a better-caught-up replica exists
//!
//! On failure past provisioning, the parent removes the child and resumes
//! serving its original range.

use std::sync::Arc;
use std::time::{Duration, Instant};

use talon_common::error::{ErrCode, RegionError};
use talon_proto::{KvOp, KvOpType, OpType, RegionInfo, RegionStatus, StoreRequest, StoreResponse};
use talon_raft::LogEntry;
use talon_reverse::ReverseList;
use talon_storage::codec;
use talon_storage::kv::Cf;
use tracing::{info, warn};

use crate::region::{Region, SplitContext};

const BACKFILL_BATCH: usize = 1024;

/// What kind of key sits under the parent's region prefix.
enum KeyClass {
    /// Routing-index entry: the tuple after the prefix decides the range.
    Routing,
    /// Secondary-index entry: the value carries the primary key.
    Secondary,
    /// Reverse-index L1 posting: `term \0 pk` after the level byte.
    ReverseL1 { pk: Vec<u8> },
    /// Reverse-index L2/L3 list: filtered node-by-node.
    ReverseList,
    /// Column-store entry: the pk is the key suffix.
    Column,
}

fn classify_key(region: &Region, key: &[u8]) -> Option<KeyClass> {
    if key.len() < 16 {
        return None;
    }
    let second = u64::from_be_bytes(key[8..16].try_into().ok()?);
    let info = region.region_info();
    if second == info.index_id {
        return Some(KeyClass::Routing);
    }
    let resource = region.resource();
    if let Some(index) = resource.indexes.iter().find(|i| i.id.0 == second) {
        if index.is_fulltext() {
            let level = *key.get(16)?;
            if level == 1 {
                let body = key.get(17..)?;
                let sep = body.iter().position(|b| *b == 0x00)?;
                return Some(KeyClass::ReverseL1 { pk: body[sep + 1..].to_vec() });
            }
            return Some(KeyClass::ReverseList);
        }
        return Some(KeyClass::Secondary);
    }
    // Unknown 8-byte discriminator: the column layout's (table_id, field_id).
    Some(KeyClass::Column)
}

impl Region {
    /// Run the whole split protocol on the leader. Returns the final
    /// response for the meta-service directive.
    pub fn start_process_split(self: &Arc<Self>, new_region_id: u64, tail: bool) -> StoreResponse {
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
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.split_duration_ms);

        // Mid splits pick their key before provisioning; tail splits pin it
        // inside the START_SPLIT_FOR_TAIL apply.
        let mid_split_key = if tail {
            Vec::new()
        } else {
            match self.choose_mid_split_key() {
                Ok(key) => key,
                Err(e) => return self.region_error(e),
            }
        };

        let parent_info = self.region_info();
        let child_info = RegionInfo {
            region_id: new_region_id,
            table_id: parent_info.table_id,
            main_table_id: parent_info.main_table_id,
            index_id: parent_info.index_id,
            partition_id: parent_info.partition_id,
            version: 0,
            start_key: mid_split_key.clone(),
            end_key: parent_info.end_key.clone(),
            peers: parent_info.peers.clone(),
            status: RegionStatus::Doing,
            ..Default::default()
        };
        if let Err(resp) = self.directory.create_region_group(&child_info) {
            return resp;
        }

        let resp = self.run_split_phases(&child_info, mid_split_key, tail, deadline);
        if !resp.is_success() {
            warn!(
                region_id = self.region_id(),
                child = new_region_id,
                errmsg = %resp.errmsg,
                "split aborted, removing child"
            );
            self.directory.remove_region_group(new_region_id);
            self.split_ctx.lock().take();
        }
        drop(guard);
        resp
    }

    fn run_split_phases(
        self: &Arc<Self>,
        child_info: &RegionInfo,
        mid_split_key: Vec<u8>,
        tail: bool,
        deadline: Instant,
    ) -> StoreResponse {
        let child_id = child_info.region_id;

        // Phase: START_SPLIT — pins split point, snapshot, prepared set.
        let start_req = StoreRequest {
            op_type: if tail { OpType::StartSplitForTail } else { OpType::StartSplit },
            region_id: self.region_id(),
            region_version: self.version(),
            split_key: mid_split_key,
            new_region_info: Some(child_info.clone()),
            ..Default::default()
        };
        let resp = self.propose_and_wait(start_req);
        if !resp.is_success() {
            return resp;
        }
        let (split_key, split_start_index, split_term, prepared) = {
            let ctx = self.split_ctx.lock();
            match ctx.as_ref() {
                Some(c) => {
                    (c.split_key.clone(), c.split_start_index, c.split_term, c.prepared.clone())
                }
                None => {
                    return StoreResponse::error(ErrCode::InternalError, "split context missing")
                }
            }
        };
        if split_key.is_empty() {
            return self.region_error(RegionError::NoSplitKey {
                region_id: self.region_id_typed(),
            });
        }
        info!(
            region_id = self.region_id(),
            child = child_id,
            split_start_index,
            tail,
            "split started"
        );

        // Phase: backfill from the pinned snapshot.
        if let Err(resp) = self.backfill_child(child_id, &split_key) {
            return resp;
        }
        if Instant::now() > deadline {
            return self.split_timeout();
        }

        // Phase: replay prepared transactions on the child.
        for txn_info in &prepared {
            let replay = StoreRequest {
                op_type: OpType::Prepare,
                region_id: child_id,
                region_version: 0,
                txn_infos: vec![txn_info.clone()],
                start_key: split_key.clone(),
                ..Default::default()
            };
            let resp = self.send_with_retry(child_id, replay);
            if !resp.is_success() {
                return resp;
            }
        }

        // Phase: log catch-up, then quiesce (mid split; a tail child's range
        // receives no historical traffic by construction).
        let barrier_guard = if tail {
            match self.barrier.disable_and_drain(Duration::from_millis(
                self.config.real_writing_wait_ms,
            )) {
                Ok(g) => g,
                Err(e) => return self.region_error(e),
            }
        } else {
            match self.catch_up_child(child_id, &split_key, split_start_index, deadline) {
                Ok(g) => g,
                Err(resp) => return resp,
            }
        };

        // Phase: child add-version.
        let add_version = StoreRequest {
            op_type: OpType::AddVersionForSplitRegion,
            region_id: child_id,
            region_version: 0,
            start_key: split_key.clone(),
            end_key: self.region_info().end_key.clone(),
            ..Default::default()
        };
        let child_resp = self.send_with_retry(child_id, add_version);
        if !child_resp.is_success() {
            drop(barrier_guard);
            return child_resp;
        }
        let child_lines = child_resp.affected_rows;
        // Hand prepared-txn row counters over to the child.
        for child_txn in &child_resp.txn_infos {
            if let Some(txn) = self.txn_pool.get_txn(talon_common::types::TxnId(child_txn.txn_id))
            {
                txn.lock().num_increase_rows -= child_txn.num_rows;
            }
        }

        // Phase: parent validate-and-add-version.
        let group = match self.raft.get(self.region_id()) {
            Ok(g) => g,
            Err(e) => return StoreResponse::error(ErrCode::InternalError, e.to_string()),
        };
        let mut final_child = child_info.clone();
        final_child.version = 1;
        final_child.start_key = split_key.clone();
        final_child.end_key = self.region_info().end_key.clone();
        final_child.num_table_lines = child_lines;
        final_child.status = RegionStatus::Idle;
        final_child.leader = child_resp.leader.clone();
        let validate = StoreRequest {
            op_type: OpType::ValidateAndAddVersion,
            region_id: self.region_id(),
            region_version: self.version(),
            split_key: split_key.clone(),
            split_term,
            split_end_index: group.last_index(),
            reduce_num_lines: child_lines,
            new_region_info: Some(final_child.clone()),
            ..Default::default()
        };
        let resp = self.propose_and_wait(validate);
        drop(barrier_guard);
        if !resp.is_success() {
            return resp;
        }

        self.transfer_leader_after_split();
        info!(
            region_id = self.region_id(),
            child = child_id,
            child_lines,
            "split complete"
        );
        let mut out = StoreResponse::success();
        out.regions.push(self.region_info());
        out.regions.push(final_child);
        out
    }

    /// Split key near the byte-size median of the region: the first routing
    /// key past `(50 - skew)%` of the accumulated data size. Everything from
    /// that key on moves to the child.
    fn choose_mid_split_key(&self) -> Result<Vec<u8>, RegionError> {
        let info = self.region_info();
        let prefix = codec::key_prefix(info.region_id, info.index_id);
        let mut lower = prefix.clone();
        lower.extend_from_slice(&info.start_key);
        let upper = if info.end_key.is_empty() {
            codec::region_prefix_end(info.region_id)
        } else {
            let mut u = prefix;
            u.extend_from_slice(&info.end_key);
            u
        };
        let snapshot = self.engine.snapshot();
        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut sizes: Vec<u64> = Vec::new();
        let mut iter = snapshot.iter(Cf::Data, lower, Some(upper));
        while iter.valid() {
            keys.push(codec::tuple_part(iter.key()).to_vec());
            sizes.push((iter.key().len() + iter.value().len()) as u64);
            iter.next();
        }
        if keys.len() < 2 {
            return Err(RegionError::NoSplitKey { region_id: self.region_id_typed() });
        }
        let total: u64 = sizes.iter().sum();
        let skew = self.config.split_skew.min(49) as u64;
        let threshold = total * (50 - skew) / 100;
        let mut acc = 0u64;
        let mut split_idx = keys.len() / 2;
        for (i, size) in sizes.iter().enumerate() {
            acc += size;
            if acc >= threshold {
                split_idx = i + 1;
                break;
            }
        }
        if split_idx == 0 || split_idx >= keys.len() {
            return Err(RegionError::NoSplitKey { region_id: self.region_id_typed() });
        }
        Ok(keys[split_idx].clone())
    }

    /// Copy the child's share of every key class from the pinned snapshot.
    fn backfill_child(
        self: &Arc<Self>,
        child_id: u64,
        split_key: &[u8],
    ) -> Result<(), StoreResponse> {
        let snapshot = {
            let ctx = self.split_ctx.lock();
            match ctx.as_ref() {
                Some(c) => c.snapshot.clone(),
                None => {
                    return Err(StoreResponse::error(
                        ErrCode::InternalError,
                        "split context missing",
                    ))
                }
            }
        };
        let info = self.region_info();
        let start = codec::region_prefix(info.region_id);
        let end = codec::region_prefix_end(info.region_id);
        let child_range_end = info.end_key.clone();

        let mut ops: Vec<KvOp> = Vec::new();
        let mut routing_rows = 0i64;
        let mut iter = snapshot.iter(Cf::Data, start, Some(end));
        while iter.valid() {
            let key = iter.key();
            let include = match classify_key(self, key) {
                Some(KeyClass::Routing) => {
                    let fits =
                        codec::fits_range(split_key, &child_range_end, codec::tuple_part(key));
                    if fits {
                        routing_rows += 1;
                    }
                    fits.then(|| iter.value().to_vec())
                }
                Some(KeyClass::Secondary) => {
                    codec::fits_range(split_key, &child_range_end, iter.value())
                        .then(|| iter.value().to_vec())
                }
                Some(KeyClass::ReverseL1 { pk }) => {
                    codec::fits_range(split_key, &child_range_end, &pk)
                        .then(|| iter.value().to_vec())
                }
                Some(KeyClass::ReverseList) => {
                    filter_reverse_list(iter.value(), split_key, &child_range_end)
                }
                Some(KeyClass::Column) => codec::fits_range(
                    split_key,
                    &child_range_end,
                    key.get(16..).unwrap_or(&[]),
                )
                .then(|| iter.value().to_vec()),
                None => None,
            };
            if let Some(value) = include {
                ops.push(KvOp {
                    op_type: KvOpType::Put,
                    key: codec::rekey_region(key, child_id),
                    value,
                });
            }
            if ops.len() >= BACKFILL_BATCH {
                let lines = std::mem::take(&mut routing_rows);
                self.ship_batch(child_id, std::mem::take(&mut ops), lines)?;
            }
            iter.next();
        }
        if !ops.is_empty() || routing_rows != 0 {
            self.ship_batch(child_id, ops, routing_rows)?;
        }
        Ok(())
    }

    fn ship_batch(
        self: &Arc<Self>,
        child_id: u64,
        ops: Vec<KvOp>,
        lines: i64,
    ) -> Result<(), StoreResponse> {
        let req = StoreRequest {
            op_type: OpType::KvBatchSplit,
            region_id: child_id,
            region_version: 0,
            kv_ops: ops,
            reduce_num_lines: lines,
            ..Default::default()
        };
        let resp = self.send_with_retry(child_id, req);
        if resp.is_success() {
            Ok(())
        } else {
            Err(resp)
        }
    }

    /// Ship raft entries `[split_start_index+1 ..]` in passes. When a pass
    /// leaves a small enough gap (or region traffic has quiesced), raise the
    /// barrier, drain, ship the remainder, and return holding the barrier.
    fn catch_up_child(
        self: &Arc<Self>,
        child_id: u64,
        split_key: &[u8],
        split_start_index: u64,
        deadline: Instant,
    ) -> Result<crate::control::BarrierGuard, StoreResponse> {
        let group = self
            .raft
            .get(self.region_id())
            .map_err(|e| StoreResponse::error(ErrCode::InternalError, e.to_string()))?;
        let mut from = split_start_index + 1;
        loop {
            if Instant::now() > deadline {
                return Err(self.split_timeout());
            }
            let to = group.last_index();
            if from <= to {
                let entries = group.entries(from, to);
                self.forward_entries(child_id, split_key, &entries)?;
                from = to + 1;
            }
            let gap = group.last_index().saturating_sub(from.saturating_sub(1));
            if gap <= self.config.split_catchup_log_gap || self.stats.qps() == 0 {
                break;
            }
        }
        // Quiesce, then drain whatever slipped in before the barrier rose.
        let guard = self
            .barrier
            .disable_and_drain(Duration::from_millis(self.config.real_writing_wait_ms))
            .map_err(|e| self.region_error(e))?;
        let to = group.last_index();
        if from <= to {
            let entries = group.entries(from, to);
            self.forward_entries(child_id, split_key, &entries)?;
        }
        Ok(guard)
    }

    fn forward_entries(
        self: &Arc<Self>,
        child_id: u64,
        split_key: &[u8],
        entries: &[LogEntry],
    ) -> Result<(), StoreResponse> {
        for entry in entries {
            let Ok(mut req) = talon_proto::decode::<StoreRequest>(&entry.data) else {
                continue;
            };
            match req.op_type {
                OpType::Insert
                | OpType::Delete
                | OpType::Update
                | OpType::Prepare
                | OpType::PrepareV2
                | OpType::Commit
                | OpType::Rollback
                | OpType::KvBatch
                | OpType::TruncateTable => {}
                _ => continue,
            }
            req.region_id = child_id;
            req.region_version = 0;
            req.start_key = split_key.to_vec();
            let resp = self.send_with_retry(child_id, req);
            if !resp.is_success() {
                // A logical failure (e.g. dup key from an autocommit retry)
                // matches what the original entry produced; only transport
                // and internal errors abort the split.
                if resp.errcode == ErrCode::InternalError
                    || resp.errcode == ErrCode::RegionNotExist
                {
                    return Err(resp);
                }
            }
        }
        Ok(())
    }

    fn send_with_retry(self: &Arc<Self>, region_id: u64, req: StoreRequest) -> StoreResponse {
        let mut last = StoreResponse::error(ErrCode::InternalError, "no attempt");
        for attempt in 0..=self.config.split_rpc_retries {
            last = self.directory.send(region_id, req.clone());
            match last.errcode {
                ErrCode::Success => return last,
                ErrCode::NotLeader | ErrCode::InternalError => {
                    warn!(
                        region_id = self.region_id(),
                        target = region_id,
                        attempt,
                        errmsg = %last.errmsg,
                        "split rpc retrying"
                    );
                }
                _ => return last,
            }
        }
        last
    }

    fn split_timeout(&self) -> StoreResponse {
        self.region_error(RegionError::SplitTimeout { region_id: self.region_id_typed() })
    }

    /// Post-split handover: prefer the replica with the largest applied
    /// index when it is ahead of the current leader. The in-process group
    /// applies synchronously, so this resolves to the current leader and the
    /// transfer is skipped.
    fn transfer_leader_after_split(self: &Arc<Self>) {
        let Ok(group) = self.raft.get(self.region_id()) else {
            return;
        };
        let leader = group.leader_address().unwrap_or_default();
        let mut best: Option<(String, u64)> = None;
        for peer in group.peers() {
            if let Some(region) = self.directory.get_region(&peer, self.region_id()) {
                let applied = region.applied_index();
                if best.as_ref().map(|(_, a)| applied > *a).unwrap_or(true) {
                    best = Some((peer, applied));
                }
            }
        }
        if let Some((peer, applied)) = best {
            if peer != leader
                && applied
                    > self
                        .directory
                        .get_region(&leader, self.region_id())
                        .map(|r| r.applied_index())
                        .unwrap_or(0)
            {
                let _ = group.transfer_leader(&peer);
            }
        }
    }
}

/// Decode an L2/L3 posting list, keep the nodes whose document fits the
/// child range, and re-encode. Empty results drop the key entirely.
fn filter_reverse_list(value: &[u8], start: &[u8], end: &[u8]) -> Option<Vec<u8>> {
    let list: ReverseList = bincode::deserialize(value).ok()?;
    let nodes: Vec<_> =
        list.nodes.into_iter().filter(|n| codec::fits_range(start, end, &n.key)).collect();
    if nodes.is_empty() {
        return None;
    }
    bincode::serialize(&ReverseList { nodes }).ok()
}

// ── Apply-side handlers ───────────────────────────────────────────────────

/// `START_SPLIT` apply: pin the split context. The tail variant seeks the
/// last routing key and splits just past it.
pub(crate) fn apply_start_split(
    region: &Arc<Region>,
    request: &StoreRequest,
    entry: &LogEntry,
    tail: bool,
) -> StoreResponse {
    let info = region.region_info();
    let snapshot = region.engine.snapshot();
    let split_key = if tail {
        let prefix = codec::key_prefix(info.region_id, info.index_id);
        let mut lower = prefix.clone();
        lower.extend_from_slice(&info.start_key);
        let upper = if info.end_key.is_empty() {
            codec::region_prefix_end(info.region_id)
        } else {
            let mut u = prefix;
            u.extend_from_slice(&info.end_key);
            u
        };
        let iter = snapshot.iter_reverse(Cf::Data, lower, Some(upper));
        if iter.valid() {
            let mut key = codec::tuple_part(iter.key()).to_vec();
            key.push(0x00);
            key
        } else {
            Vec::new()
        }
    } else {
        request.split_key.clone()
    };
    let new_region_id =
        request.new_region_info.as_ref().map(|i| i.region_id).unwrap_or_default();
    let prepared = region.txn_pool.prepared_txn_infos();
    *region.split_ctx.lock() = Some(SplitContext {
        split_key,
        new_region_id,
        split_start_index: entry.index,
        split_term: entry.term,
        snapshot,
        prepared,
        tail,
    });
    if let Err(e) = region.persist_applied_direct(entry.index, entry.term) {
        return region.fatal_apply_error(e);
    }
    StoreResponse::success()
}

/// Child-side `ADD_VERSION_FOR_SPLIT_REGION` apply: the child becomes a
/// real region (version 1, IDLE) and reports its prepared transactions and
/// row count back to the parent.
pub(crate) fn apply_add_version_for_split_region(
    region: &Arc<Region>,
    request: &StoreRequest,
    entry: &LogEntry,
) -> StoreResponse {
    region.set_region_range(request.start_key.clone(), request.end_key.clone(), 1);
    region.gate.reset();
    if let Err(e) = region.persist_region_info() {
        return region.fatal_apply_error(e);
    }
    if let Err(e) = region.persist_applied_direct(entry.index, entry.term) {
        return region.fatal_apply_error(e);
    }
    let mut resp = StoreResponse::success();
    resp.affected_rows = region.num_table_lines();
    resp.txn_infos = region.txn_pool.prepared_txn_infos();
    resp.leader = region.leader_hint();
    info!(
        region_id = region.region_id(),
        lines = resp.affected_rows,
        "split child add-version applied"
    );
    resp
}

/// Parent-side `VALIDATE_AND_ADD_VERSION` apply: shrink to `[start,
/// split_key)`, bump the version, and give the child its rows.
pub(crate) fn apply_validate_and_add_version(
    region: &Arc<Region>,
    request: &StoreRequest,
    entry: &LogEntry,
) -> StoreResponse {
    // The split context was pinned by the START_SPLIT entry on every
    // replica; its presence is the raft-ordered equivalent of "still DOING".
    if region.split_ctx.lock().is_none() {
        let _ = region.persist_applied_direct(entry.index, entry.term);
        return StoreResponse::error(ErrCode::InternalError, "split validate without context");
    }
    if entry.term != request.split_term || entry.index != request.split_end_index + 1 {
        let _ = region.persist_applied_direct(entry.index, entry.term);
        warn!(
            region_id = region.region_id(),
            entry_term = entry.term,
            entry_index = entry.index,
            split_term = request.split_term,
            split_end_index = request.split_end_index,
            "split validate mismatch"
        );
        return StoreResponse::error(ErrCode::InternalError, "split term/index mismatch");
    }
    let info = region.region_info();
    let new_version = info.version + 1;
    region.set_region_range(info.start_key.clone(), request.split_key.clone(), new_version);
    let lines = region.num_table_lines() - request.reduce_num_lines;
    region.set_num_table_lines(lines);

    let mut txn = region.engine.begin(region.engine.internal_txn_id());
    region.meta.stage_applied_index(&mut txn, region.region_id(), entry.index, entry.term);
    region.meta.stage_num_table_lines(&mut txn, region.region_id(), lines);
    let updated = region.region_info();
    region.meta.stage_region_info(&mut txn, &updated);
    if let Err(e) = txn.commit() {
        return region.fatal_apply_error(talon_common::error::TalonError::Kv(e));
    }
    if let Some(child) = &request.new_region_info {
        region.set_new_region_infos(vec![child.clone()]);
    }
    region.split_ctx.lock().take();
    info!(
        region_id = region.region_id(),
        version = new_version,
        lines,
        "split parent validated"
    );
    StoreResponse::success()
}
