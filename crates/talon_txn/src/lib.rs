//! The transaction layer: per-region 2PC transactions with replayable
//! command caches, savepoints, and an idempotent pool.

pub mod pool;
pub mod transaction;

pub use pool::TxnPool;
pub use transaction::Transaction;
