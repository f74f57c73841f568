//! Wire and consensus-log payload types.
//!
//! Every consensus entry carries a bincode-encoded [`StoreRequest`]; replies
//! travel back as [`StoreResponse`]. The op-type and error-code sets are
//! closed: new structural operations get new variants, never overloaded
//! payload fields.

pub mod heartbeat;
pub mod plan;
pub mod record;
pub mod region;
pub mod request;

pub use heartbeat::{DdlOp, DdlWorkDirective, RegionHeartbeat, StoreHeartbeat};
pub use plan::{
    Expr, ExprOp, FulltextCombine, IndexRange, Plan, PlanNode, SlotDescriptor, SortField,
    TupleDescriptor,
};
pub use record::Record;
pub use region::{RegionInfo, RegionStatus};
pub use request::{CachePlan, KvOp, KvOpType, OpType, StoreRequest, StoreResponse, TransactionInfo};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
}

/// Encode a log/RPC payload.
pub fn encode<T: serde::Serialize>(msg: &T) -> Result<Vec<u8>, ProtoError> {
    bincode::serialize(msg).map_err(|e| ProtoError::Encode(e.to_string()))
}

/// Decode a log/RPC payload.
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtoError> {
    bincode::deserialize(bytes).map_err(|e| ProtoError::Decode(e.to_string()))
}
