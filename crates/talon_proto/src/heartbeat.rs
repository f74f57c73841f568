//! Heartbeat payloads exchanged with the meta service.
//!
//! Upward: per-region state plus per-store capacity. Downward: schema deltas
//! and ddl-work directives. The meta service itself is an external
//! collaborator; the region core only assembles and consumes these.

use serde::{Deserialize, Serialize};

use crate::region::RegionStatus;
use talon_common::schema::IndexState;

/// Per-region slice of a store heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionHeartbeat {
    pub region_id: u64,
    pub table_id: u64,
    pub version: u64,
    pub applied_index: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub peers: Vec<String>,
    pub leader: String,
    pub used_size: u64,
    pub num_table_lines: i64,
    pub status: RegionStatus,
    /// Present while an online DDL is in progress on this region.
    pub ddl_state: Option<(u64, IndexState)>,
}

/// Whole-store heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreHeartbeat {
    pub address: String,
    pub resource_tag: String,
    pub capacity: u64,
    pub used_size: u64,
    pub regions: Vec<RegionHeartbeat>,
}

/// Online DDL job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlOp {
    AddIndex,
    DropIndex,
}

/// Downward directive: the table-global index state the meta service wants
/// every region to converge to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlWorkDirective {
    pub table_id: u64,
    pub index_id: u64,
    pub op: DdlOp,
    pub target_state: IndexState,
}
