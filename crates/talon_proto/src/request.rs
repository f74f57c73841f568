//! The store RPC surface: one request type, one response type.

use serde::{Deserialize, Serialize};

use crate::plan::{Plan, TupleDescriptor};
use crate::region::RegionInfo;
use talon_common::error::ErrCode;
use talon_common::value::Value;

/// Operation kinds (closed set). Structural operations each advance by their
/// own consensus entry so replicas agree on every phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OpType {
    Select,
    Insert,
    Delete,
    Update,
    Kill,
    Begin,
    Prepare,
    PrepareV2,
    Commit,
    Rollback,
    TruncateTable,
    #[default]
    None,
    KvBatch,
    KvBatchSplit,
    StartSplit,
    StartSplitForTail,
    ValidateAndAddVersion,
    AddVersionForSplitRegion,
    AdjustkeyAndAddVersion,
    AddPeer,
}

impl OpType {
    /// DML verbs that may appear inside a cached transaction plan.
    pub fn is_dml(self) -> bool {
        matches!(self, OpType::Insert | OpType::Delete | OpType::Update)
    }

    /// Operations that mutate state and therefore go through consensus.
    pub fn is_write(self) -> bool {
        !matches!(self, OpType::Select | OpType::Kill | OpType::None)
    }
}

/// Raw KV mutation kinds for `KvBatch` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvOpType {
    Put,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvOp {
    pub op_type: KvOpType,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A replayable record of one transaction command, cached per seq id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePlan {
    pub op_type: OpType,
    pub seq_id: u32,
    pub plan: Plan,
    pub tuples: Vec<TupleDescriptor>,
}

/// Transaction control block attached to txn-scoped requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub txn_id: u64,
    /// Seq id of the current command.
    pub seq_id: u32,
    /// First seq id carried in `cache_plans` (for follow-up resends).
    pub start_seq_id: u32,
    pub autocommit: bool,
    /// Collapse PREPARE+COMMIT into a single 1PC entry when possible.
    pub optimize_1pc: bool,
    /// Savepoint rollbacks to apply, descending, before the current command.
    pub need_rollback_seq: Vec<u32>,
    pub cache_plans: Vec<CachePlan>,
    /// Row-count delta of the txn; filled on split handover and recovery.
    pub num_rows: i64,
    /// Prepare-time applied index; filled when reporting prepared txns.
    pub prepared_index: u64,
}

/// The one request type of the region service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreRequest {
    pub op_type: OpType,
    pub region_id: u64,
    /// The region version the client believes in.
    pub region_version: u64,
    pub plan: Option<Plan>,
    pub tuples: Vec<TupleDescriptor>,
    pub txn_infos: Vec<TransactionInfo>,
    pub kv_ops: Vec<KvOp>,
    /// Follower-read opt-in for SELECT.
    pub select_without_leader: bool,
    /// Split/merge payloads.
    pub split_key: Vec<u8>,
    pub split_term: u64,
    pub split_end_index: u64,
    pub reduce_num_lines: i64,
    pub new_region_info: Option<RegionInfo>,
    /// Tail-split child start key for forwarded PREPAREs.
    pub start_key: Vec<u8>,
    /// `AdjustkeyAndAddVersion` payload.
    pub end_key: Vec<u8>,
    pub version: u64,
}

/// One row of SELECT output, already projected to the requested tuple layout.
pub type RowValues = Vec<Value>;

/// The one response type of the region service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreResponse {
    pub errcode: ErrCode,
    pub errmsg: String,
    /// SQL error surfaced to the client (e.g. 1062 duplicate key).
    pub mysql_errcode: Option<u16>,
    pub leader: String,
    pub affected_rows: i64,
    pub rows: Vec<RowValues>,
    /// Up-to-date descriptors attached to VERSION_OLD replies.
    pub regions: Vec<RegionInfo>,
    pub is_merge: bool,
    pub txn_infos: Vec<TransactionInfo>,
    /// High-water seq for TXN_FOLLOW_UP replies.
    pub last_seq_id: Option<u32>,
    /// Indexes actually used by the scan (diagnostics).
    pub scan_indexes: Vec<u64>,
    pub applied_index: u64,
}

impl StoreResponse {
    pub fn success() -> Self {
        StoreResponse { errcode: ErrCode::Success, ..Default::default() }
    }

    pub fn error(errcode: ErrCode, errmsg: impl Into<String>) -> Self {
        StoreResponse { errcode, errmsg: errmsg.into(), ..Default::default() }
    }

    pub fn is_success(&self) -> bool {
        self.errcode == ErrCode::Success
    }
}
