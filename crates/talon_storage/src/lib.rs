//! Storage layer of the region core.
//!
//! - `kv`: the ordered, transactional KV engine boundary. The production
//!   engine is an external RocksDB-class store; this crate ships an
//!   in-process reference implementation with the same surface
//!   (column families, pessimistic row locks, snapshots, bounded iterators,
//!   ingest) so the region core is engine-agnostic.
//! - `codec`: the region/index key layout and the order-preserving tuple
//!   encoding.
//! - `meta`: the per-region durable records kept in the meta column family.
//! - `sst`: snapshot data/meta file writer and loader.

pub mod codec;
pub mod kv;
pub mod meta;
pub mod sst;
