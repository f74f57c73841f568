//! Plan execution against a region's resource snapshot.
//!
//! The region hands every request a [`state::RuntimeState`]: an immutable
//! resource bundle (region descriptor, schema, reverse indexes), a read view,
//! and — for writes — the transaction handle. Executors walk the plan tree,
//! push range predicates into bounded KV iterators, and maintain secondary
//! indexes according to each index's online-DDL state.

pub mod dml;
pub mod eval;
pub mod index_select;
pub mod scan;
pub mod state;

pub use dml::execute_plan;
pub use state::{ExecResult, RegionResource, RuntimeState};
