//! Layered error types plus the closed wire error-code set.
//!
//! Internal layers use `thiserror` enums that convert into the top-level
//! `TalonError`; the RPC surface reports a stable `ErrCode` (with an optional
//! MySQL errno passthrough) derived from the internal error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{IndexId, RegionId, TxnId};

/// Convenience alias used throughout the region core.
pub type TalonResult<T> = Result<T, TalonError>;

/// Stable wire error codes (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ErrCode {
    #[default]
    Success,
    NotLeader,
    VersionOld,
    TxnFollowUp,
    DisableWriteTimeout,
    SplitTimeout,
    ExecFail,
    ParseFromPbFail,
    ParseToPbFail,
    InputParamError,
    InternalError,
    UnsupportReqType,
    DdlUniqueKeyFail,
    RegionNotExist,
}

/// MySQL errno surfaced to clients alongside `ErrCode::ExecFail`.
pub const ER_DUP_ENTRY: u16 = 1062;

/// KV engine layer errors.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("key locked by {holder} (wanted by {wanter})")]
    LockConflict { holder: TxnId, wanter: TxnId },

    #[error("transaction already finished")]
    TxnFinished,

    #[error("engine shut down")]
    EngineClosed,

    #[error("snapshot file error: {0}")]
    SnapshotFile(String),

    #[error("corrupt record: {0}")]
    Corruption(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transaction layer errors.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("{0} not found in pool")]
    NotFound(TxnId),

    #[error("{0} already exists in pool")]
    AlreadyExists(TxnId),

    #[error("{txn_id} primary key already exists")]
    DupPrimaryKey { txn_id: TxnId },

    #[error("{txn_id} unique key conflict on {index_id}")]
    UniqueConflict { txn_id: TxnId, index_id: IndexId },

    #[error("{txn_id} out-of-order seq: got {got}, last {last}")]
    SeqOutOfOrder { txn_id: TxnId, got: u32, last: u32 },

    #[error("key outside region range")]
    OutOfRegionRange,

    #[error("kv: {0}")]
    Kv(#[from] KvError),
}

/// Plan execution errors.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("unsupported plan node: {0}")]
    UnsupportedNode(&'static str),

    #[error("missing field {field_id} in record")]
    MissingField { field_id: u32 },

    #[error("unknown index {0}")]
    UnknownIndex(IndexId),

    #[error("unknown table {0}")]
    UnknownTable(u64),

    #[error("execution cancelled")]
    Cancelled,

    #[error("type error: {0}")]
    TypeError(String),

    #[error("txn: {0}")]
    Txn(#[from] TxnError),

    #[error("kv: {0}")]
    Kv(#[from] KvError),
}

/// Region state-machine errors.
#[derive(Error, Debug)]
pub enum RegionError {
    #[error("{region_id} not leader, hint {leader:?}")]
    NotLeader { region_id: RegionId, leader: Option<String> },

    #[error("{region_id} version too old: request {request}, current {current}")]
    VersionOld { region_id: RegionId, request: u64, current: u64 },

    #[error("{region_id} busy: another structural operation in progress")]
    RegionBusy { region_id: RegionId },

    #[error("{region_id} disable-write wait timed out")]
    DisableWriteTimeout { region_id: RegionId },

    #[error("{region_id} split timed out")]
    SplitTimeout { region_id: RegionId },

    #[error("{region_id} has no split key")]
    NoSplitKey { region_id: RegionId },

    #[error("{region_id} range mismatch: {detail}")]
    RangeMismatch { region_id: RegionId, detail: String },

    #[error("decode request failed: {0}")]
    DecodeFail(String),

    #[error("encode response failed: {0}")]
    EncodeFail(String),

    #[error("unsupported request type")]
    UnsupportedRequest,
}

/// Top-level error every layer converts into.
#[derive(Error, Debug)]
pub enum TalonError {
    #[error("kv: {0}")]
    Kv(#[from] KvError),

    #[error("txn: {0}")]
    Txn(#[from] TxnError),

    #[error("exec: {0}")]
    Exec(#[from] ExecError),

    #[error("region: {0}")]
    Region(#[from] RegionError),

    #[error("internal: {0}")]
    Internal(String),
}

impl TalonError {
    /// Map to the wire code reported in `StoreResponse`.
    pub fn err_code(&self) -> ErrCode {
        match self {
            TalonError::Region(RegionError::NotLeader { .. }) => ErrCode::NotLeader,
            TalonError::Region(RegionError::VersionOld { .. }) => ErrCode::VersionOld,
            TalonError::Region(RegionError::DisableWriteTimeout { .. }) => {
                ErrCode::DisableWriteTimeout
            }
            TalonError::Region(RegionError::SplitTimeout { .. }) => ErrCode::SplitTimeout,
            TalonError::Region(RegionError::DecodeFail(_)) => ErrCode::ParseFromPbFail,
            TalonError::Region(RegionError::EncodeFail(_)) => ErrCode::ParseToPbFail,
            TalonError::Region(RegionError::UnsupportedRequest) => ErrCode::UnsupportReqType,
            TalonError::Region(_) => ErrCode::InternalError,
            TalonError::Txn(TxnError::DupPrimaryKey { .. })
            | TalonError::Txn(TxnError::UniqueConflict { .. }) => ErrCode::ExecFail,
            TalonError::Exec(ExecError::Txn(TxnError::DupPrimaryKey { .. }))
            | TalonError::Exec(ExecError::Txn(TxnError::UniqueConflict { .. })) => ErrCode::ExecFail,
            TalonError::Exec(_) => ErrCode::ExecFail,
            TalonError::Txn(_) => ErrCode::ExecFail,
            TalonError::Kv(_) => ErrCode::InternalError,
            TalonError::Internal(_) => ErrCode::InternalError,
        }
    }

    /// MySQL errno passthrough, when the error maps to one.
    pub fn mysql_errcode(&self) -> Option<u16> {
        let dup = matches!(
            self,
            TalonError::Txn(TxnError::DupPrimaryKey { .. })
                | TalonError::Txn(TxnError::UniqueConflict { .. })
                | TalonError::Exec(ExecError::Txn(TxnError::DupPrimaryKey { .. }))
                | TalonError::Exec(ExecError::Txn(TxnError::UniqueConflict { .. }))
        );
        dup.then_some(ER_DUP_ENTRY)
    }

    /// True when the failure must halt the apply loop (spec: KV-commit
    /// failures are fatal for the replica, never swallowed).
    pub fn is_fatal_for_apply(&self) -> bool {
        matches!(
            self,
            TalonError::Kv(KvError::Io(_))
                | TalonError::Kv(KvError::Corruption(_))
                | TalonError::Kv(KvError::EngineClosed)
        )
    }
}
