//! The region core: a per-region replicated state machine over the ordered
//! KV engine.
//!
//! `Region` implements the consensus hooks (`talon_raft::RegionStateMachine`)
//! and the RPC entry point (`execute_query`). Structural protocols — split,
//! merge, online DDL — live in their own modules and drive the region
//! through explicit consensus entries so every replica agrees on every
//! phase. `Store` owns the regions of one process and implements the
//! store-to-store RPC surface the coordinators use.

pub mod control;
pub mod ddl;
pub mod heartbeat;
pub mod merge;
pub mod region;
pub mod snapshot;
pub mod split;
pub mod store;

pub use region::Region;
pub use store::{Store, StoreDirectory};
