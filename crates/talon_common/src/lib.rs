//! Shared foundations of the TalonDB region core.
//!
//! - `types`: id newtypes used across every crate
//! - `value`: the tagged scalar (`Value`) with cast/compare/hash semantics
//! - `datetime`: packed DATE/TIME/DATETIME/TIMESTAMP codecs
//! - `schema`: immutable table/index snapshots published by the schema factory
//! - `error`: layered error enums and the wire error-code set
//! - `config`: region-core tunables

pub mod config;
pub mod datetime;
pub mod error;
pub mod schema;
pub mod types;
pub mod value;
