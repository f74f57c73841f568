//! The per-region state machine.
//!
//! A `Region` sits between the consensus group and the KV engine. Reads are
//! served on the leader from a consistent snapshot after a version check;
//! writes are proposed as consensus entries and executed by the apply path
//! on every replica, with `(applied_index, num_table_lines, region_info)`
//! persisted atomically with each data mutation.
//!
//! Leader-side multi-statement DML executes into the pooled transaction
//! without consensus; replication happens at PREPARE, whose entry carries
//! the full command cache for replica replay.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use talon_common::config::RegionConfig;
use talon_common::error::{ErrCode, RegionError, TalonError, TxnError};
use talon_common::schema::SchemaFactory;
use talon_common::types::{RegionId, TxnId};
use talon_executor::{execute_plan, ExecResult, RegionResource, RuntimeState};
use talon_proto::{
    CachePlan, KvOp, KvOpType, OpType, RegionInfo, StoreRequest, StoreResponse, TransactionInfo,
};
use talon_raft::{ApplyClosure, ConsensusError, LogEntry, RaftRouter, RegionStateMachine};
use talon_reverse::ReverseIndex;
use talon_storage::codec;
use talon_storage::kv::{Cf, KvEngine, KvSnapshot};
use talon_storage::meta::{MetaWriter, PreCommitRecord, PreparedTxnRecord};
use talon_txn::pool::SharedTxn;
use talon_txn::TxnPool;
use tracing::{debug, error, info, warn};

use crate::control::{StatWindow, StatusGate, WriteBarrier};
use crate::store::StoreDirectory;

/// Leader-side split bookkeeping, established by the START_SPLIT apply.
pub(crate) struct SplitContext {
    pub split_key: Vec<u8>,
    pub new_region_id: u64,
    pub split_start_index: u64,
    pub split_term: u64,
    pub snapshot: KvSnapshot,
    pub prepared: Vec<TransactionInfo>,
    pub tail: bool,
}

pub struct Region {
    region_id: u64,
    address: String,
    pub(crate) engine: Arc<KvEngine>,
    pub(crate) meta: MetaWriter,
    pub(crate) schema: Arc<SchemaFactory>,
    pub(crate) config: Arc<RegionConfig>,
    info: RwLock<RegionInfo>,
    resource: RwLock<Arc<RegionResource>>,
    applied_index: AtomicU64,
    applied_term: AtomicU64,
    num_table_lines: AtomicI64,
    num_delete_lines: AtomicI64,
    pub(crate) txn_pool: TxnPool,
    pub(crate) reverse_indexes: RwLock<HashMap<u64, Arc<ReverseIndex>>>,
    pub(crate) gate: StatusGate,
    pub(crate) barrier: Arc<WriteBarrier>,
    is_leader: AtomicBool,
    leader_addr: RwLock<String>,
    /// Children from a recent split, attached to VERSION_OLD replies.
    new_region_infos: RwLock<Vec<RegionInfo>>,
    /// The absorbing sibling after this region merged away.
    merge_target: RwLock<Option<RegionInfo>>,
    pub(crate) split_ctx: Mutex<Option<SplitContext>>,
    pub(crate) raft: Arc<RaftRouter>,
    pub(crate) directory: Arc<StoreDirectory>,
    removed: AtomicBool,
    illegal: AtomicBool,
    created_at: Instant,
    pub(crate) snapshot_dir: PathBuf,
    pub(crate) last_snapshot_index: AtomicU64,
    pub(crate) last_snapshot_lines: AtomicI64,
    pub(crate) last_snapshot_at: Mutex<Instant>,
    pub(crate) stats: StatWindow,
    /// Live cancellation flags of in-flight executions, flipped by KILL.
    cancel_flags: Mutex<Vec<std::sync::Weak<AtomicBool>>>,
    pending_compact: AtomicBool,
}

impl Region {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info: RegionInfo,
        address: String,
        engine: Arc<KvEngine>,
        schema: Arc<SchemaFactory>,
        config: Arc<RegionConfig>,
        raft: Arc<RaftRouter>,
        directory: Arc<StoreDirectory>,
        snapshot_dir: PathBuf,
        new_region: bool,
    ) -> Result<Arc<Self>, TalonError> {
        let meta = MetaWriter::new(engine.clone());
        let region_id = info.region_id;
        let (applied_index, applied_term, num_table_lines, num_delete_lines, info) = if new_region {
            meta.init_region_info(&info)?;
            (0, 0, info.num_table_lines, 0, info)
        } else {
            // Restart: durable records win over whatever the caller passed.
            let stored = meta.read_region_info(region_id)?.unwrap_or(info);
            let (idx, term) = meta.read_applied_index(region_id)?;
            let lines = meta.read_num_table_lines(region_id)?;
            let deletes = meta.read_num_delete_lines(region_id)?;
            (idx, term, lines, deletes, stored)
        };

        let region = Arc::new(Self {
            region_id,
            address: address.clone(),
            engine: engine.clone(),
            meta,
            schema,
            config: config.clone(),
            gate: StatusGate::new(region_id),
            barrier: WriteBarrier::new(region_id),
            resource: RwLock::new(Arc::new(RegionResource {
                region_info: info.clone(),
                table: Arc::new(Default::default()),
                indexes: Vec::new(),
                reverse_indexes: HashMap::new(),
            })),
            info: RwLock::new(info),
            applied_index: AtomicU64::new(applied_index),
            applied_term: AtomicU64::new(applied_term),
            num_table_lines: AtomicI64::new(num_table_lines),
            num_delete_lines: AtomicI64::new(num_delete_lines),
            txn_pool: TxnPool::new(region_id, engine, config.finished_txn_capacity),
            reverse_indexes: RwLock::new(HashMap::new()),
            is_leader: AtomicBool::new(false),
            leader_addr: RwLock::new(String::new()),
            new_region_infos: RwLock::new(Vec::new()),
            merge_target: RwLock::new(None),
            split_ctx: Mutex::new(None),
            raft,
            directory: directory.clone(),
            removed: AtomicBool::new(false),
            illegal: AtomicBool::new(false),
            created_at: Instant::now(),
            snapshot_dir,
            last_snapshot_index: AtomicU64::new(applied_index),
            last_snapshot_lines: AtomicI64::new(num_table_lines),
            last_snapshot_at: Mutex::new(Instant::now()),
            stats: StatWindow::new(256),
            cancel_flags: Mutex::new(Vec::new()),
            pending_compact: AtomicBool::new(false),
        });
        if region.info.read().version == 0 {
            // Split child under construction: hold the gate until the
            // add-version entry arrives.
            region.gate.force_doing();
        }
        region.build_reverse_indexes();
        region.publish_resource();
        if !new_region {
            region.recover_prepared_txns()?;
        }
        directory.register_region(&address, region.clone());
        info!(
            region_id,
            address = %address,
            new_region,
            info = %serde_json::to_string(&region.region_info()).unwrap_or_default(),
            "region initialized"
        );
        Ok(region)
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn region_info(&self) -> RegionInfo {
        let mut info = self.info.read().clone();
        info.status = self.gate.status();
        info.leader = self.leader_addr.read().clone();
        info.num_table_lines = self.num_table_lines.load(Ordering::SeqCst);
        info
    }

    pub fn version(&self) -> u64 {
        self.info.read().version
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    pub fn applied_term(&self) -> u64 {
        self.applied_term.load(Ordering::SeqCst)
    }

    pub fn num_table_lines(&self) -> i64 {
        self.num_table_lines.load(Ordering::SeqCst)
    }

    pub fn num_delete_lines(&self) -> i64 {
        self.num_delete_lines.load(Ordering::SeqCst)
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn is_illegal(&self) -> bool {
        self.illegal.load(Ordering::SeqCst)
    }

    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    pub fn pending_compact(&self) -> bool {
        self.pending_compact.load(Ordering::SeqCst)
    }

    pub fn take_pending_compact(&self) -> bool {
        self.pending_compact.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn set_num_table_lines(&self, lines: i64) {
        self.num_table_lines.store(lines, Ordering::SeqCst);
    }

    pub(crate) fn set_applied(&self, index: u64, term: u64) {
        self.applied_index.store(index, Ordering::SeqCst);
        self.applied_term.store(term, Ordering::SeqCst);
    }

    pub fn resource(&self) -> Arc<RegionResource> {
        self.resource.read().clone()
    }

    /// Claim the structural-status gate from outside (admin paths, tests).
    pub fn acquire_structural_gate(
        &self,
    ) -> Result<crate::control::StatusGuard<'_>, RegionError> {
        self.gate.acquire()
    }

    /// Number of live transactions in the pool.
    pub fn live_txn_count(&self) -> usize {
        self.txn_pool.len()
    }

    pub fn snapshot_path(&self) -> &std::path::Path {
        &self.snapshot_dir
    }

    /// A just-created split child that never got its add-version within the
    /// split window destroys itself.
    pub fn check_legal_complete(&self) -> bool {
        if self.removed.load(Ordering::SeqCst) {
            return true;
        }
        if self.version() > 0 {
            return true;
        }
        if self.created_at.elapsed() > Duration::from_millis(self.config.split_duration_ms) {
            self.illegal.store(true, Ordering::SeqCst);
            warn!(region_id = self.region_id, "split child timed out, marked illegal");
            return false;
        }
        true
    }

    // ── Resource publishing ───────────────────────────────────────────────

    pub(crate) fn build_reverse_indexes(&self) {
        let info = self.info.read().clone();
        let Some(table) = self.schema.get_table(talon_common::types::TableId(info.table_id))
        else {
            return;
        };
        let mut map = self.reverse_indexes.write();
        for index in self.schema.table_indexes(&table) {
            if index.is_fulltext()
                && index.state != talon_common::schema::IndexState::None
                && !map.contains_key(&index.id.0)
            {
                map.insert(
                    index.id.0,
                    ReverseIndex::new(
                        self.region_id,
                        index.id.0,
                        self.engine.clone(),
                        index.segment_type,
                        self.config.reverse_level2_len,
                        self.config.reverse_cache_size,
                        self.config.reverse_cached_list_len,
                    ),
                );
            }
        }
        for reverse in map.values() {
            reverse.set_key_range(info.start_key.clone(), info.end_key.clone());
        }
    }

    /// Publish a fresh immutable resource bundle. Structural changes call
    /// this; in-flight requests keep the previous bundle alive.
    pub(crate) fn publish_resource(&self) {
        let info = self.region_info();
        let table = self
            .schema
            .get_table(talon_common::types::TableId(info.table_id))
            .unwrap_or_else(|| Arc::new(Default::default()));
        let indexes = self.schema.table_indexes(&table);
        let reverse = self.reverse_indexes.read().clone();
        let bundle = Arc::new(RegionResource {
            region_info: info,
            table,
            indexes,
            reverse_indexes: reverse,
        });
        *self.resource.write() = bundle;
    }

    pub(crate) fn set_region_range(&self, start: Vec<u8>, end: Vec<u8>, version: u64) {
        {
            let mut info = self.info.write();
            info.start_key = start.clone();
            info.end_key = end.clone();
            info.version = version;
        }
        for reverse in self.reverse_indexes.read().values() {
            reverse.set_key_range(start.clone(), end.clone());
        }
        self.publish_resource();
    }

    pub(crate) fn set_new_region_infos(&self, infos: Vec<RegionInfo>) {
        *self.new_region_infos.write() = infos;
    }

    pub(crate) fn set_merge_target(&self, target: RegionInfo) {
        *self.merge_target.write() = Some(target);
    }

    pub(crate) fn persist_region_info(&self) -> Result<(), TalonError> {
        let info = self.region_info();
        self.meta.update_region_info(&info)?;
        Ok(())
    }

    // ── Version / leadership validation ───────────────────────────────────

    fn version_old_response(&self) -> StoreResponse {
        let mut resp = StoreResponse::error(ErrCode::VersionOld, "region version too old");
        resp.leader = self.leader_addr.read().clone();
        let own = self.region_info();
        let merged = own.is_merged();
        resp.regions.push(own);
        if merged {
            resp.is_merge = true;
            if let Some(target) = self.merge_target.read().clone() {
                resp.regions.push(target);
            }
        } else {
            for child in self.new_region_infos.read().iter() {
                if child.region_id != 0 && child.version != 0 {
                    resp.regions.push(child.clone());
                }
            }
        }
        resp
    }

    /// The version gate every client request passes. Returns the error
    /// response when the caller's view is stale.
    pub(crate) fn validate_version(&self, request: &StoreRequest) -> Option<StoreResponse> {
        if request.region_version >= self.info.read().version {
            return None;
        }
        let mut resp = self.version_old_response();
        if matches!(request.op_type, OpType::Prepare | OpType::PrepareV2) {
            if let Some(txn_info) = request.txn_infos.first() {
                self.txn_pool.rollback_txn(TxnId(txn_info.txn_id));
                resp.last_seq_id = Some(0);
                warn!(
                    region_id = self.region_id,
                    txn_id = txn_info.txn_id,
                    "stale-version prepare rolled back"
                );
            }
        }
        Some(resp)
    }

    fn not_leader_response(&self) -> StoreResponse {
        let mut resp = StoreResponse::error(ErrCode::NotLeader, "not leader");
        resp.leader = self.leader_addr.read().clone();
        resp
    }

    fn err_response(&self, err: &TalonError) -> StoreResponse {
        let mut resp = StoreResponse::error(err.err_code(), err.to_string());
        resp.mysql_errcode = err.mysql_errcode();
        resp.leader = self.leader_addr.read().clone();
        resp
    }

    // ── RPC entry point ───────────────────────────────────────────────────

    pub fn execute_query(self: &Arc<Self>, request: StoreRequest) -> StoreResponse {
        let started = Instant::now();
        let resp = self.dispatch_query(request);
        self.stats.record(started.elapsed().as_micros() as u64);
        resp
    }

    fn dispatch_query(self: &Arc<Self>, request: StoreRequest) -> StoreResponse {
        if self.removed.load(Ordering::SeqCst) {
            return StoreResponse::error(ErrCode::RegionNotExist, "region removed");
        }
        match request.op_type {
            OpType::Select => self.query_select(&request),
            OpType::Begin => self.query_begin(&request),
            OpType::Insert | OpType::Delete | OpType::Update => self.query_dml(&request),
            OpType::Prepare | OpType::PrepareV2 => self.query_prepare(request),
            OpType::Commit | OpType::Rollback => self.query_commit_rollback(request),
            OpType::TruncateTable
            | OpType::KvBatch
            | OpType::KvBatchSplit
            | OpType::AddVersionForSplitRegion
            | OpType::AdjustkeyAndAddVersion
            | OpType::AddPeer
            | OpType::None => self.query_replicated(request),
            OpType::StartSplit | OpType::StartSplitForTail | OpType::ValidateAndAddVersion => {
                // Only the split coordinator proposes these, on its own
                // region; they never arrive as external queries.
                StoreResponse::error(ErrCode::UnsupportReqType, "coordinator-internal op")
            }
            OpType::Kill => {
                let cancelled = self.cancel_running();
                debug!(region_id = self.region_id, cancelled, "kill requested");
                StoreResponse::success()
            }
        }
    }

    fn query_select(self: &Arc<Self>, request: &StoreRequest) -> StoreResponse {
        if !self.is_leader() {
            let initialized = self.version() > 0;
            if !request.select_without_leader || !initialized {
                return self.not_leader_response();
            }
            // A follower that is far behind bounces the read so the client
            // falls back to the leader.
            let behind = self
                .raft
                .get(self.region_id)
                .ok()
                .and_then(|g| g.leader_address())
                .and_then(|leader| self.directory.get_region(&leader, self.region_id))
                .map(|leader| {
                    leader.applied_index().saturating_sub(self.applied_index())
                        > self.config.follower_read_max_lag
                })
                .unwrap_or(true);
            if behind {
                return self.not_leader_response();
            }
        }
        if let Some(resp) = self.validate_version(request) {
            return resp;
        }
        let Some(plan) = &request.plan else {
            return StoreResponse::error(ErrCode::InputParamError, "select without plan");
        };
        let txn = request
            .txn_infos
            .first()
            .and_then(|t| self.txn_pool.get_txn(TxnId(t.txn_id)));
        let mut state = self.runtime_state(txn);
        state.tuples = request.tuples.clone();
        match execute_plan(&mut state, plan) {
            Ok(result) => self.success_with_result(result),
            Err(e) => self.err_response(&TalonError::Exec(e)),
        }
    }

    fn query_begin(self: &Arc<Self>, request: &StoreRequest) -> StoreResponse {
        if !self.is_leader() {
            return self.not_leader_response();
        }
        if let Some(resp) = self.validate_version(request) {
            return resp;
        }
        let Some(txn_info) = request.txn_infos.first() else {
            return StoreResponse::error(ErrCode::InputParamError, "begin without txn info");
        };
        match self.txn_pool.create_txn(TxnId(txn_info.txn_id)) {
            Ok(txn) => {
                let mut guard = txn.lock();
                guard.push_cmd_to_cache(CachePlan {
                    op_type: OpType::Begin,
                    seq_id: txn_info.seq_id.max(1),
                    plan: Default::default(),
                    tuples: Vec::new(),
                });
                let mut resp = StoreResponse::success();
                resp.last_seq_id = Some(guard.seq_id());
                resp
            }
            Err(TxnError::AlreadyExists(_)) => {
                // Idempotent BEGIN retry.
                let mut resp = StoreResponse::success();
                resp.last_seq_id = self
                    .txn_pool
                    .get_txn(TxnId(txn_info.txn_id))
                    .map(|t| t.lock().seq_id());
                resp
            }
            Err(e) => self.err_response(&TalonError::Txn(e)),
        }
    }

    /// Multi-statement DML executes on the leader only; the effects ride in
    /// the pooled transaction until PREPARE replicates them. Autocommit DML
    /// goes straight through consensus as a 1PC entry.
    fn query_dml(self: &Arc<Self>, request: &StoreRequest) -> StoreResponse {
        if !self.is_leader() {
            return self.not_leader_response();
        }
        if let Some(resp) = self.validate_version(request) {
            return resp;
        }
        let in_txn = request
            .txn_infos
            .first()
            .map(|t| !t.autocommit)
            .unwrap_or(false);
        if !in_txn {
            // Autocommit: one consensus entry executes and commits.
            let ticket = match self
                .barrier
                .enter_write(Duration::from_millis(self.config.disable_write_wait_ms))
            {
                Ok(t) => t,
                Err(e) => return self.err_response(&TalonError::Region(e)),
            };
            let resp = self.propose_and_wait(request.clone());
            drop(ticket);
            return resp;
        }
        let ticket = match self
            .barrier
            .enter_write(Duration::from_millis(self.config.disable_write_wait_ms))
        {
            Ok(t) => t,
            Err(e) => return self.err_response(&TalonError::Region(e)),
        };
        let resp = self.exec_txn_dml(request);
        drop(ticket);
        resp
    }

    fn exec_txn_dml(self: &Arc<Self>, request: &StoreRequest) -> StoreResponse {
        let Some(txn_info) = request.txn_infos.first() else {
            return StoreResponse::error(ErrCode::InputParamError, "dml without txn info");
        };
        let Some(txn) = self.txn_pool.get_txn(TxnId(txn_info.txn_id)) else {
            // The txn is not here (leader change): the client must resend
            // its cached plans from the beginning.
            let mut resp = StoreResponse::error(ErrCode::TxnFollowUp, "txn not found");
            resp.last_seq_id = Some(0);
            return resp;
        };
        let last_seq = txn.lock().seq_id();
        if txn_info.seq_id <= last_seq {
            // Replayed command: answered from the cache without re-running.
            let mut resp = StoreResponse::success();
            resp.last_seq_id = Some(last_seq);
            resp.affected_rows = txn.lock().dml_num_affected_rows;
            return resp;
        }
        if txn_info.seq_id > last_seq + 1 {
            let mut resp = StoreResponse::error(ErrCode::TxnFollowUp, "missing earlier commands");
            resp.last_seq_id = Some(last_seq);
            return resp;
        }
        let Some(plan) = &request.plan else {
            return StoreResponse::error(ErrCode::InputParamError, "dml without plan");
        };
        // Savepoint rollbacks arrive with the command that follows them.
        {
            let mut guard = txn.lock();
            let mut rollback_seqs = txn_info.need_rollback_seq.clone();
            rollback_seqs.sort_unstable_by(|a, b| b.cmp(a));
            for seq in rollback_seqs {
                if let Err(e) = guard.rollback_to_seq(seq) {
                    return self.err_response(&TalonError::Txn(e));
                }
            }
            if let Err(e) = guard.set_save_point(txn_info.seq_id) {
                return self.err_response(&TalonError::Txn(e));
            }
            guard.set_seq_id(txn_info.seq_id);
        }
        let mut state = self.runtime_state(Some(txn.clone()));
        state.tuples = request.tuples.clone();
        match execute_plan(&mut state, plan) {
            Ok(result) => {
                let mut guard = txn.lock();
                guard.push_cmd_to_cache(CachePlan {
                    op_type: request.op_type,
                    seq_id: txn_info.seq_id,
                    plan: plan.clone(),
                    tuples: request.tuples.clone(),
                });
                let mut resp = self.success_with_result(result);
                resp.last_seq_id = Some(guard.seq_id());
                resp
            }
            Err(e) => {
                // The statement failed; its savepoint undoes partial work so
                // the transaction can continue or roll back cleanly.
                let mut guard = txn.lock();
                let _ = guard.rollback_to_seq(txn_info.seq_id);
                drop(guard);
                self.err_response(&TalonError::Exec(e))
            }
        }
    }

    fn query_prepare(self: &Arc<Self>, mut request: StoreRequest) -> StoreResponse {
        if !self.is_leader() {
            return self.not_leader_response();
        }
        if let Some(resp) = self.validate_version(&request) {
            return resp;
        }
        let Some(txn_info) = request.txn_infos.first().cloned() else {
            return StoreResponse::error(ErrCode::InputParamError, "prepare without txn info");
        };
        let txn = match self.txn_pool.get_txn(TxnId(txn_info.txn_id)) {
            Some(txn) => Some(txn),
            None => {
                if let Some(rows) = self.txn_pool.finished_rows(TxnId(txn_info.txn_id)) {
                    let mut resp = StoreResponse::success();
                    resp.affected_rows = rows;
                    return resp;
                }
                // Follow-up resend carries the whole cache from seq 1; the
                // apply path will rebuild the transaction from it.
                if txn_info.start_seq_id > 1 || txn_info.cache_plans.is_empty() {
                    let mut resp =
                        StoreResponse::error(ErrCode::TxnFollowUp, "txn unknown, resend cache");
                    resp.last_seq_id = Some(0);
                    return resp;
                }
                None
            }
        };
        if let Some(txn) = &txn {
            let mut guard = txn.lock();
            if txn_info.start_seq_id > guard.seq_id() + 1 {
                let last_seq = guard.seq_id();
                drop(guard);
                let mut resp =
                    StoreResponse::error(ErrCode::TxnFollowUp, "missing earlier commands");
                resp.last_seq_id = Some(last_seq);
                return resp;
            }
            // Savepoint rollbacks apply on the leader before the cache is
            // snapshotted, so replicas replay only the surviving commands.
            let mut rollbacks = txn_info.need_rollback_seq.clone();
            rollbacks.sort_unstable_by(|a, b| b.cmp(a));
            for seq in rollbacks {
                if let Err(e) = guard.rollback_to_seq(seq) {
                    drop(guard);
                    return self.err_response(&TalonError::Txn(e));
                }
            }
            // Ship the full replayable cache with the PREPARE entry.
            let full = guard.cache_plans();
            drop(guard);
            if let Some(info) = request.txn_infos.first_mut() {
                info.cache_plans = full;
                info.start_seq_id = 1;
                info.need_rollback_seq.clear();
            }
        }
        if txn_info.optimize_1pc {
            // Single-entry path: the leader-local execution is discarded and
            // the whole transaction re-executes at apply on every replica.
            if txn.is_some() {
                self.txn_pool.rollback_txn(TxnId(txn_info.txn_id));
            }
            return self.propose_and_wait(request);
        }
        // Pre-commit sentinel first, then the PREPARE entry.
        let post_lines = self.num_table_lines.load(Ordering::SeqCst)
            + txn.as_ref().map(|t| t.lock().num_increase_rows).unwrap_or(0);
        if let Err(e) = self.meta.write_pre_commit(
            self.region_id,
            txn_info.txn_id,
            PreCommitRecord {
                num_table_lines: post_lines,
                applied_index: self.applied_index(),
            },
        ) {
            return self.err_response(&TalonError::Kv(e));
        }
        let ticket = match self
            .barrier
            .enter_write(Duration::from_millis(self.config.disable_write_wait_ms))
        {
            Ok(t) => t,
            Err(e) => return self.err_response(&TalonError::Region(e)),
        };
        let resp = self.propose_and_wait(request);
        drop(ticket);
        resp
    }

    fn query_commit_rollback(self: &Arc<Self>, request: StoreRequest) -> StoreResponse {
        if !self.is_leader() {
            return self.not_leader_response();
        }
        if let Some(resp) = self.validate_version(&request) {
            return resp;
        }
        let Some(txn_info) = request.txn_infos.first() else {
            return StoreResponse::error(ErrCode::InputParamError, "commit without txn info");
        };
        if self.txn_pool.get_txn(TxnId(txn_info.txn_id)).is_none() {
            // Idempotent replay of a finished txn answers with the original
            // affected-row count.
            if let Some(rows) = self.txn_pool.finished_rows(TxnId(txn_info.txn_id)) {
                let mut resp = StoreResponse::success();
                resp.affected_rows = rows;
                return resp;
            }
            warn!(
                region_id = self.region_id,
                txn_id = txn_info.txn_id,
                op = ?request.op_type,
                "commit/rollback for unknown txn"
            );
            return StoreResponse::success();
        }
        self.propose_and_wait(request)
    }

    /// Ops that simply ride consensus: truncate, kv batches, the split/merge
    /// entries addressed to this region, noops.
    fn query_replicated(self: &Arc<Self>, request: StoreRequest) -> StoreResponse {
        if !self.is_leader() {
            return self.not_leader_response();
        }
        self.propose_and_wait(request)
    }

    pub(crate) fn propose_and_wait(self: &Arc<Self>, request: StoreRequest) -> StoreResponse {
        let data = match talon_proto::encode(&request) {
            Ok(d) => d,
            Err(e) => return StoreResponse::error(ErrCode::ParseToPbFail, e.to_string()),
        };
        let group = match self.raft.get(self.region_id) {
            Ok(g) => g,
            Err(e) => return StoreResponse::error(ErrCode::InternalError, e.to_string()),
        };
        let slot: Arc<Mutex<Option<StoreResponse>>> = Arc::new(Mutex::new(None));
        let slot2 = slot.clone();
        let closure: ApplyClosure = Box::new(move |resp| {
            *slot2.lock() = Some(resp);
        });
        match group.propose(&self.address, data, Some(closure)) {
            Ok(_) => {}
            Err(ConsensusError::NotLeader { leader, .. }) => {
                let mut resp = StoreResponse::error(ErrCode::NotLeader, "not leader");
                resp.leader = leader.unwrap_or_default();
                return resp;
            }
            Err(e) => return StoreResponse::error(ErrCode::InternalError, e.to_string()),
        }
        let taken = slot.lock().take();
        taken.unwrap_or_else(|| {
            StoreResponse::error(ErrCode::InternalError, "apply produced no response")
        })
    }

    pub(crate) fn runtime_state(&self, txn: Option<SharedTxn>) -> RuntimeState {
        let snapshot = match &txn {
            Some(t) => t.lock().kv_txn_mut().map(|kv| kv.snapshot().clone()).ok(),
            None => None,
        }
        .unwrap_or_else(|| self.engine.snapshot());
        let state = RuntimeState::new(
            self.resource(),
            snapshot,
            txn,
            Vec::new(),
            self.config.scan_cancel_check_rows,
        );
        let mut flags = self.cancel_flags.lock();
        flags.retain(|w| w.strong_count() > 0);
        flags.push(Arc::downgrade(&state.cancelled));
        state
    }

    /// KILL: flip the cancellation flag of every in-flight execution.
    pub fn cancel_running(&self) -> usize {
        let flags = self.cancel_flags.lock();
        let mut cancelled = 0;
        for weak in flags.iter() {
            if let Some(flag) = weak.upgrade() {
                flag.store(true, Ordering::Relaxed);
                cancelled += 1;
            }
        }
        cancelled
    }

    fn success_with_result(&self, result: ExecResult) -> StoreResponse {
        let mut resp = StoreResponse::success();
        resp.affected_rows = result.affected_rows;
        resp.rows = result.rows;
        resp.scan_indexes = result.scan_indexes;
        resp.applied_index = self.applied_index();
        resp
    }

    // ── Apply path ────────────────────────────────────────────────────────

    fn do_apply(self: &Arc<Self>, entry: &LogEntry, done: Option<ApplyClosure>) {
        let resp = self.apply_entry(entry);
        if let Some(done) = done {
            done(resp);
        }
    }

    fn apply_entry(self: &Arc<Self>, entry: &LogEntry) -> StoreResponse {
        if entry.index <= self.applied_index() {
            // Replay of an already-applied entry is a no-op.
            debug!(region_id = self.region_id, index = entry.index, "duplicate entry discarded");
            let mut resp = StoreResponse::success();
            resp.applied_index = self.applied_index();
            return resp;
        }
        let request: StoreRequest = match talon_proto::decode(&entry.data) {
            Ok(r) => r,
            Err(e) => {
                error!(region_id = self.region_id, index = entry.index, "undecodable entry: {e}");
                let _ = self.persist_applied_direct(entry.index, entry.term);
                self.set_applied(entry.index, entry.term);
                return StoreResponse::error(ErrCode::ParseFromPbFail, e.to_string());
            }
        };
        let resp = match request.op_type {
            OpType::Insert | OpType::Delete | OpType::Update | OpType::Select => {
                self.apply_dml_1pc(&request, entry)
            }
            OpType::Prepare | OpType::PrepareV2 => {
                if request.txn_infos.first().map(|t| t.optimize_1pc).unwrap_or(false) {
                    self.apply_dml_1pc(&request, entry)
                } else {
                    self.apply_prepare(&request, entry)
                }
            }
            OpType::Commit => self.apply_commit(&request, entry),
            OpType::Rollback => self.apply_rollback(&request, entry),
            OpType::TruncateTable => self.apply_truncate(entry),
            OpType::KvBatch | OpType::KvBatchSplit => self.apply_kv_batch(&request, entry),
            OpType::StartSplit => self.apply_start_split(&request, entry, false),
            OpType::StartSplitForTail => self.apply_start_split(&request, entry, true),
            OpType::ValidateAndAddVersion => self.apply_validate_and_add_version(&request, entry),
            OpType::AddVersionForSplitRegion => {
                self.apply_add_version_for_split_region(&request, entry)
            }
            OpType::AdjustkeyAndAddVersion => self.apply_adjustkey_and_add_version(&request, entry),
            OpType::AddPeer => self.apply_add_peer(entry),
            OpType::None | OpType::Begin | OpType::Kill => {
                let _ = self.persist_applied_direct(entry.index, entry.term);
                StoreResponse::success()
            }
        };
        self.set_applied(entry.index, entry.term);
        self.maybe_save_snapshot();
        resp
    }

    pub(crate) fn persist_applied_direct(&self, index: u64, term: u64) -> Result<(), TalonError> {
        self.meta.update_applied_index(self.region_id, index, term)?;
        Ok(())
    }

    /// Single-entry DML: execute the plan (or a 1PC-optimized command cache)
    /// inside a fresh transaction and commit it together with the meta
    /// records.
    fn apply_dml_1pc(self: &Arc<Self>, request: &StoreRequest, entry: &LogEntry) -> StoreResponse {
        let txn_info = request.txn_infos.first();
        let txn_id = txn_info
            .map(|t| TxnId(t.txn_id))
            .filter(|t| t.0 != 0)
            .unwrap_or_else(|| self.engine.internal_txn_id());
        let txn: SharedTxn = Arc::new(Mutex::new(talon_txn::Transaction::begin(
            &self.engine,
            txn_id,
            self.region_id,
        )));
        let mut state = self.runtime_state(Some(txn.clone()));
        state.tuples = request.tuples.clone();
        if !request.start_key.is_empty() {
            state.skip_out_of_range = true;
        }

        let mut exec_result = ExecResult::default();
        let mut failure: Option<TalonError> = None;
        let mut plans: Vec<(OpType, talon_proto::Plan, Vec<talon_proto::TupleDescriptor>)> =
            Vec::new();
        if let Some(info) = txn_info {
            for cached in &info.cache_plans {
                if cached.op_type.is_dml() {
                    plans.push((cached.op_type, cached.plan.clone(), cached.tuples.clone()));
                }
            }
        }
        if plans.is_empty() {
            if let Some(plan) = &request.plan {
                plans.push((request.op_type, plan.clone(), request.tuples.clone()));
            }
        }
        let mut deleted_rows = 0i64;
        for (op, plan, tuples) in plans {
            state.tuples = tuples;
            let affected_before = state.affected_rows;
            match execute_plan(&mut state, &plan) {
                Ok(r) => {
                    if op == OpType::Delete {
                        deleted_rows += state.affected_rows - affected_before;
                    }
                    exec_result.affected_rows = state.affected_rows;
                    exec_result.rows.extend(r.rows);
                }
                Err(e) => {
                    failure = Some(TalonError::Exec(e));
                    break;
                }
            }
        }

        match failure {
            None => {
                let delta = state.num_increase_rows;
                let lines = self.num_table_lines.load(Ordering::SeqCst) + delta;
                let deletes = self.num_delete_lines.load(Ordering::SeqCst) + deleted_rows;
                let commit_res = {
                    let mut guard = txn.lock();
                    let stage = guard.kv_txn_mut().map(|kv| {
                        self.meta.stage_applied_index(kv, self.region_id, entry.index, entry.term);
                        self.meta.stage_num_table_lines(kv, self.region_id, lines);
                        self.meta.stage_num_delete_lines(kv, self.region_id, deletes);
                    });
                    stage.and_then(|_| guard.commit())
                };
                match commit_res {
                    Ok(()) => {
                        self.num_table_lines.store(lines, Ordering::SeqCst);
                        self.num_delete_lines.store(deletes, Ordering::SeqCst);
                        if deletes >= self.config.compact_delete_lines {
                            self.pending_compact.store(true, Ordering::SeqCst);
                        }
                        self.success_with_result(exec_result)
                    }
                    Err(e) => self.fatal_apply_error(TalonError::Txn(e)),
                }
            }
            Some(err) => {
                // Logical failure: nothing of this entry persists except the
                // applied index.
                txn.lock().rollback();
                if let Err(pe) = self.persist_applied_direct(entry.index, entry.term) {
                    return self.fatal_apply_error(pe);
                }
                self.err_response(&err)
            }
        }
    }

    /// PREPARE apply: replay cached commands this replica has not executed,
    /// then pin the transaction as prepared and persist its replayable
    /// record.
    fn apply_prepare(self: &Arc<Self>, request: &StoreRequest, entry: &LogEntry) -> StoreResponse {
        let Some(txn_info) = request.txn_infos.first() else {
            let _ = self.persist_applied_direct(entry.index, entry.term);
            return StoreResponse::error(ErrCode::InputParamError, "prepare without txn info");
        };
        if self.txn_pool.finished_rows(TxnId(txn_info.txn_id)).is_some() {
            let _ = self.persist_applied_direct(entry.index, entry.term);
            return StoreResponse::success();
        }
        match self.execute_cached_cmds(request, txn_info) {
            Ok(Some(txn)) => {
                let (affected, last_seq, rows_delta) = {
                    let mut guard = txn.lock();
                    guard.is_prepared = true;
                    guard.prepared_index = entry.index;
                    (guard.dml_num_affected_rows, guard.seq_id(), guard.num_increase_rows)
                };
                let record = PreparedTxnRecord {
                    txn_id: txn_info.txn_id,
                    log_index: entry.index,
                    num_increase_rows: rows_delta,
                    request: request.clone(),
                };
                if let Err(e) = self.meta.write_prepared_txn(self.region_id, &record) {
                    return self.fatal_apply_error(TalonError::Kv(e));
                }
                if let Err(e) = self.persist_applied_direct(entry.index, entry.term) {
                    return self.fatal_apply_error(e);
                }
                let mut resp = StoreResponse::success();
                resp.affected_rows = affected;
                resp.last_seq_id = Some(last_seq);
                resp
            }
            Ok(None) => {
                let _ = self.persist_applied_direct(entry.index, entry.term);
                StoreResponse::error(ErrCode::ExecFail, "prepare without transaction")
            }
            Err(resp) => {
                let _ = self.persist_applied_direct(entry.index, entry.term);
                resp
            }
        }
    }

    /// Replay cached commands with seq greater than this replica's
    /// high-water mark. Returns the (possibly just-created) transaction.
    fn execute_cached_cmds(
        self: &Arc<Self>,
        request: &StoreRequest,
        txn_info: &TransactionInfo,
    ) -> Result<Option<SharedTxn>, StoreResponse> {
        let mut txn = self.txn_pool.get_txn(TxnId(txn_info.txn_id));
        let last_seq = txn.as_ref().map(|t| t.lock().seq_id()).unwrap_or(0);
        for cached in &txn_info.cache_plans {
            if cached.seq_id <= last_seq {
                continue;
            }
            match cached.op_type {
                OpType::Begin => {
                    let created = self
                        .txn_pool
                        .create_txn(TxnId(txn_info.txn_id))
                        .map_err(|e| self.err_response(&TalonError::Txn(e)))?;
                    created.lock().push_cmd_to_cache(cached.clone());
                    txn = Some(created);
                }
                op if op.is_dml() => {
                    let Some(txn) = txn.clone() else {
                        return Err(StoreResponse::error(
                            ErrCode::ExecFail,
                            "cached dml before begin",
                        ));
                    };
                    {
                        let mut guard = txn.lock();
                        guard
                            .set_save_point(cached.seq_id)
                            .map_err(|e| self.err_response(&TalonError::Txn(e)))?;
                        guard.set_seq_id(cached.seq_id);
                    }
                    let mut state = self.runtime_state(Some(txn.clone()));
                    state.tuples = cached.tuples.clone();
                    if !request.start_key.is_empty() {
                        state.skip_out_of_range = true;
                    }
                    match execute_plan(&mut state, &cached.plan) {
                        Ok(_) => txn.lock().push_cmd_to_cache(cached.clone()),
                        Err(e) => {
                            // Cached commands succeeded elsewhere; a replay
                            // failure abandons the transaction here.
                            error!(
                                region_id = self.region_id,
                                txn_id = txn_info.txn_id,
                                seq = cached.seq_id,
                                "cached command replay failed: {e}"
                            );
                            txn.lock().rollback();
                            self.txn_pool.rollback_txn(TxnId(txn_info.txn_id));
                            return Err(self.err_response(&TalonError::Exec(e)));
                        }
                    }
                }
                other => {
                    return Err(StoreResponse::error(
                        ErrCode::UnsupportReqType,
                        format!("unexpected cached op {other:?}"),
                    ));
                }
            }
        }
        // Savepoint rollbacks listed on this command apply after replay,
        // highest seq first. Seqs already rolled back locally are no-ops.
        if let Some(txn) = &txn {
            let mut guard = txn.lock();
            let mut rollbacks = txn_info.need_rollback_seq.clone();
            rollbacks.sort_unstable_by(|a, b| b.cmp(a));
            for seq in rollbacks {
                guard
                    .rollback_to_seq(seq)
                    .map_err(|e| self.err_response(&TalonError::Txn(e)))?;
            }
        }
        Ok(txn)
    }

    fn apply_commit(self: &Arc<Self>, request: &StoreRequest, entry: &LogEntry) -> StoreResponse {
        let Some(txn_info) = request.txn_infos.first() else {
            let _ = self.persist_applied_direct(entry.index, entry.term);
            return StoreResponse::error(ErrCode::InputParamError, "commit without txn info");
        };
        let txn_id = TxnId(txn_info.txn_id);
        let Some(txn) = self.txn_pool.get_txn(txn_id) else {
            let rows = self.txn_pool.finished_rows(txn_id).unwrap_or(0);
            let _ = self.persist_applied_direct(entry.index, entry.term);
            let mut resp = StoreResponse::success();
            resp.affected_rows = rows;
            return resp;
        };
        let (commit_res, affected, delta) = {
            let mut guard = txn.lock();
            let delta = guard.num_increase_rows;
            let lines = self.num_table_lines.load(Ordering::SeqCst) + delta;
            let affected = guard.dml_num_affected_rows;
            let region_id = self.region_id;
            let stage = guard.kv_txn_mut().map(|kv| {
                self.meta.stage_applied_index(kv, region_id, entry.index, entry.term);
                self.meta.stage_num_table_lines(kv, region_id, lines);
                self.meta.stage_clear_pre_commit(kv, region_id, txn_info.txn_id);
                self.meta.stage_clear_prepared_txn(kv, region_id, txn_info.txn_id);
            });
            (stage.and_then(|_| guard.commit()), affected, delta)
        };
        match commit_res {
            Ok(()) => {
                self.num_table_lines.fetch_add(delta, Ordering::SeqCst);
                self.txn_pool.remove_txn(txn_id, affected);
                let mut resp = StoreResponse::success();
                resp.affected_rows = affected;
                debug!(region_id = self.region_id, txn_id = txn_id.0, affected, "txn committed");
                resp
            }
            Err(e) => self.fatal_apply_error(TalonError::Txn(e)),
        }
    }

    fn apply_rollback(self: &Arc<Self>, request: &StoreRequest, entry: &LogEntry) -> StoreResponse {
        let Some(txn_info) = request.txn_infos.first() else {
            let _ = self.persist_applied_direct(entry.index, entry.term);
            return StoreResponse::error(ErrCode::InputParamError, "rollback without txn info");
        };
        let txn_id = TxnId(txn_info.txn_id);
        if let Some(txn) = self.txn_pool.get_txn(txn_id) {
            txn.lock().rollback();
            self.txn_pool.remove_txn(txn_id, 0);
        }
        if let Err(e) = self.meta.clear_pre_commit(self.region_id, txn_info.txn_id) {
            return self.fatal_apply_error(TalonError::Kv(e));
        }
        if let Err(e) = self.meta.clear_prepared_txn(self.region_id, txn_info.txn_id) {
            return self.fatal_apply_error(TalonError::Kv(e));
        }
        if let Err(e) = self.persist_applied_direct(entry.index, entry.term) {
            return self.fatal_apply_error(e);
        }
        StoreResponse::success()
    }

    fn apply_truncate(self: &Arc<Self>, entry: &LogEntry) -> StoreResponse {
        let start = codec::region_prefix(self.region_id);
        let end = codec::region_prefix_end(self.region_id);
        let removed = self.engine.delete_range(Cf::Data, &start, Some(&end));
        let mut txn = self.engine.begin(self.engine.internal_txn_id());
        self.meta.stage_applied_index(&mut txn, self.region_id, entry.index, entry.term);
        self.meta.stage_num_table_lines(&mut txn, self.region_id, 0);
        self.meta.stage_num_delete_lines(&mut txn, self.region_id, 0);
        if let Err(e) = txn.commit() {
            return self.fatal_apply_error(TalonError::Kv(e));
        }
        self.num_table_lines.store(0, Ordering::SeqCst);
        self.num_delete_lines.store(0, Ordering::SeqCst);
        // Compaction runs later on the structural queue, serialized with
        // split/merge/DDL by the status gate.
        self.pending_compact.store(true, Ordering::SeqCst);
        info!(region_id = self.region_id, removed, "table truncated");
        StoreResponse::success()
    }

    /// Raw KV batch. The split variant filters every op against the child's
    /// range before writing and carries the row-count contribution.
    fn apply_kv_batch(self: &Arc<Self>, request: &StoreRequest, entry: &LogEntry) -> StoreResponse {
        let mut txn = self.engine.begin(self.engine.internal_txn_id());
        let mut applied_ops = 0usize;
        for op in &request.kv_ops {
            if request.op_type == OpType::KvBatchSplit && !self.kv_op_in_range(op) {
                continue;
            }
            match op.op_type {
                KvOpType::Put => txn.put(Cf::Data, op.key.clone(), op.value.clone()),
                KvOpType::Delete => txn.delete(Cf::Data, op.key.clone()),
            }
            applied_ops += 1;
        }
        let lines = self.num_table_lines.load(Ordering::SeqCst) + request.reduce_num_lines;
        self.meta.stage_applied_index(&mut txn, self.region_id, entry.index, entry.term);
        self.meta.stage_num_table_lines(&mut txn, self.region_id, lines);
        if let Err(e) = txn.commit() {
            return self.fatal_apply_error(TalonError::Kv(e));
        }
        self.num_table_lines.store(lines, Ordering::SeqCst);
        let mut resp = StoreResponse::success();
        resp.affected_rows = applied_ops as i64;
        resp
    }

    /// Best-effort range classification of a raw kv op during split
    /// ingestion: keys of the routing index check their own tuple, others
    /// are already filtered by the parent.
    fn kv_op_in_range(&self, op: &KvOp) -> bool {
        let info = self.info.read();
        if op.key.len() < 16 {
            return false;
        }
        let index_id = u64::from_be_bytes(op.key[8..16].try_into().unwrap_or([0; 8]));
        if index_id == info.index_id {
            codec::fits_range(&info.start_key, &info.end_key, &op.key[16..])
        } else {
            true
        }
    }

    fn apply_add_peer(self: &Arc<Self>, entry: &LogEntry) -> StoreResponse {
        {
            let mut info = self.info.write();
            info.can_add_peer = true;
        }
        if let Err(e) = self.persist_region_info() {
            return self.fatal_apply_error(e);
        }
        if let Err(e) = self.persist_applied_direct(entry.index, entry.term) {
            return self.fatal_apply_error(e);
        }
        StoreResponse::success()
    }

    // Split/merge apply handlers live in split.rs / merge.rs; they are
    // declared here to keep the dispatch table in one place.

    fn apply_start_split(
        self: &Arc<Self>,
        request: &StoreRequest,
        entry: &LogEntry,
        tail: bool,
    ) -> StoreResponse {
        crate::split::apply_start_split(self, request, entry, tail)
    }

    fn apply_validate_and_add_version(
        self: &Arc<Self>,
        request: &StoreRequest,
        entry: &LogEntry,
    ) -> StoreResponse {
        crate::split::apply_validate_and_add_version(self, request, entry)
    }

    fn apply_add_version_for_split_region(
        self: &Arc<Self>,
        request: &StoreRequest,
        entry: &LogEntry,
    ) -> StoreResponse {
        crate::split::apply_add_version_for_split_region(self, request, entry)
    }

    fn apply_adjustkey_and_add_version(
        self: &Arc<Self>,
        request: &StoreRequest,
        entry: &LogEntry,
    ) -> StoreResponse {
        crate::merge::apply_adjustkey_and_add_version(self, request, entry)
    }

    /// A KV-commit failure is fatal for this replica: the apply loop stops
    /// making progress and the region must reload from log or snapshot.
    pub(crate) fn fatal_apply_error(&self, err: TalonError) -> StoreResponse {
        error!(region_id = self.region_id, "fatal apply error: {err}");
        self.illegal.store(true, Ordering::SeqCst);
        StoreResponse::error(ErrCode::InternalError, err.to_string())
    }

    // ── Recovery ──────────────────────────────────────────────────────────

    /// Reinstall prepared-but-uncommitted transactions after restart or
    /// snapshot install. A surviving pre-commit sentinel means COMMIT was in
    /// flight: finalize it. Otherwise the prepared plan replays into a fresh
    /// transaction that waits for the client's COMMIT/ROLLBACK.
    pub(crate) fn recover_prepared_txns(self: &Arc<Self>) -> Result<(), TalonError> {
        let records = self.meta.scan_prepared_txns(self.region_id)?;
        for record in records {
            let txn_id = TxnId(record.txn_id);
            let pre_commit = self.meta.read_pre_commit(self.region_id, record.txn_id)?;
            let Some(txn_info) = record.request.txn_infos.first() else {
                warn!(region_id = self.region_id, txn_id = record.txn_id, "empty prepared record");
                continue;
            };
            match self.execute_cached_cmds(&record.request, txn_info) {
                Ok(Some(txn)) => {
                    if let Some(sentinel) = pre_commit {
                        // Commit metadata present: finalize now.
                        let commit_res = {
                            let mut guard = txn.lock();
                            let affected = guard.dml_num_affected_rows;
                            let region_id = self.region_id;
                            let stage = guard.kv_txn_mut().map(|kv| {
                                self.meta.stage_num_table_lines(
                                    kv,
                                    region_id,
                                    sentinel.num_table_lines,
                                );
                                self.meta.stage_clear_pre_commit(kv, region_id, record.txn_id);
                                self.meta.stage_clear_prepared_txn(kv, region_id, record.txn_id);
                            });
                            stage.and_then(|_| guard.commit()).map(|_| affected)
                        };
                        match commit_res {
                            Ok(affected) => {
                                self.num_table_lines
                                    .store(sentinel.num_table_lines, Ordering::SeqCst);
                                self.txn_pool.remove_txn(txn_id, affected);
                                info!(
                                    region_id = self.region_id,
                                    txn_id = record.txn_id,
                                    "prepared txn finalized from pre-commit sentinel"
                                );
                            }
                            Err(e) => return Err(TalonError::Txn(e)),
                        }
                    } else {
                        let mut guard = txn.lock();
                        guard.is_prepared = true;
                        guard.prepared_index = record.log_index;
                        guard.num_increase_rows = record.num_increase_rows;
                        info!(
                            region_id = self.region_id,
                            txn_id = record.txn_id,
                            "prepared txn re-installed after restart"
                        );
                    }
                }
                Ok(None) => {
                    warn!(
                        region_id = self.region_id,
                        txn_id = record.txn_id,
                        "prepared record produced no txn"
                    );
                }
                Err(resp) => {
                    warn!(
                        region_id = self.region_id,
                        txn_id = record.txn_id,
                        errmsg = %resp.errmsg,
                        "prepared txn replay failed"
                    );
                }
            }
        }
        Ok(())
    }
}

// ── Consensus hooks ───────────────────────────────────────────────────────

impl RegionStateMachine for Region {
    fn on_apply(&self, entry: &LogEntry, done: Option<ApplyClosure>) {
        // Safety of the self-Arc: regions only live inside the directory.
        let Some(me) = self.directory.get_region(&self.address, self.region_id) else {
            if let Some(done) = done {
                done(StoreResponse::error(ErrCode::RegionNotExist, "region unregistered"));
            }
            return;
        };
        me.do_apply(entry, done);
    }

    fn on_leader_start(&self, term: u64) {
        self.is_leader.store(true, Ordering::SeqCst);
        *self.leader_addr.write() = self.address.clone();
        info!(region_id = self.region_id, term, "leader started");
    }

    fn on_leader_stop(&self) {
        self.is_leader.store(false, Ordering::SeqCst);
        // Unreplicated transactions die with the leadership; the new leader
        // rebuilds them from client-resent caches.
        self.txn_pool.on_leader_stop_rollback();
        info!(region_id = self.region_id, "leader stopped");
    }

    fn on_configuration_committed(&self, peers: &[String], index: u64) {
        {
            let mut info = self.info.write();
            info.peers = peers.to_vec();
            info.conf_version += 1;
        }
        if let Some(leader) = self
            .raft
            .get(self.region_id)
            .ok()
            .and_then(|g| g.leader_address())
        {
            *self.leader_addr.write() = leader;
        }
        debug!(region_id = self.region_id, index, ?peers, "configuration committed");
    }

    fn on_snapshot_save(&self) -> Result<(), ConsensusError> {
        let Some(me) = self.directory.get_region(&self.address, self.region_id) else {
            return Err(ConsensusError::RegionNotFound(self.region_id));
        };
        me.save_snapshot().map_err(|e| ConsensusError::ProposalFailed(e.to_string()))
    }

    fn on_snapshot_load(&self) -> Result<(), ConsensusError> {
        let Some(me) = self.directory.get_region(&self.address, self.region_id) else {
            return Err(ConsensusError::RegionNotFound(self.region_id));
        };
        me.load_snapshot().map_err(|e| ConsensusError::ProposalFailed(e.to_string()))
    }

    fn on_error(&self, message: &str) {
        error!(region_id = self.region_id, message, "consensus error");
        self.illegal.store(true, Ordering::SeqCst);
    }
}

impl Region {
    pub(crate) fn leader_hint(&self) -> String {
        self.leader_addr.read().clone()
    }

    pub(crate) fn region_error(&self, err: RegionError) -> StoreResponse {
        self.err_response(&TalonError::Region(err))
    }

    pub(crate) fn region_id_typed(&self) -> RegionId {
        RegionId(self.region_id)
    }
}
