//! Per-region transaction pool.
//!
//! Indexes live transactions by txn id and remembers recently finished ones
//! with their affected-row counts, so retried COMMIT/ROLLBACK requests are
//! answered idempotently without re-executing anything.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use talon_common::error::TxnError;
use talon_common::types::TxnId;
use talon_proto::TransactionInfo;
use talon_storage::kv::KvEngine;
use tracing::warn;

use crate::transaction::Transaction;

pub type SharedTxn = Arc<Mutex<Transaction>>;

struct FinishedRing {
    rows: HashMap<u64, i64>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl FinishedRing {
    fn new(capacity: usize) -> Self {
        Self { rows: HashMap::new(), order: VecDeque::new(), capacity: capacity.max(1) }
    }

    fn record(&mut self, txn_id: u64, affected_rows: i64) {
        if self.rows.insert(txn_id, affected_rows).is_none() {
            self.order.push_back(txn_id);
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.rows.remove(&evicted);
                }
            }
        }
    }

    fn get(&self, txn_id: u64) -> Option<i64> {
        self.rows.get(&txn_id).copied()
    }
}

pub struct TxnPool {
    region_id: u64,
    engine: Arc<KvEngine>,
    txns: DashMap<u64, SharedTxn>,
    finished: Mutex<FinishedRing>,
}

impl TxnPool {
    pub fn new(region_id: u64, engine: Arc<KvEngine>, finished_capacity: usize) -> Self {
        Self {
            region_id,
            engine,
            txns: DashMap::new(),
            finished: Mutex::new(FinishedRing::new(finished_capacity)),
        }
    }

    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }

    /// Begin a transaction and register it. A live duplicate is an error; a
    /// retried BEGIN after completion surfaces through `finished_rows`.
    pub fn create_txn(&self, txn_id: TxnId) -> Result<SharedTxn, TxnError> {
        if self.txns.contains_key(&txn_id.0) {
            return Err(TxnError::AlreadyExists(txn_id));
        }
        let txn = Arc::new(Mutex::new(Transaction::begin(&self.engine, txn_id, self.region_id)));
        self.txns.insert(txn_id.0, txn.clone());
        Ok(txn)
    }

    /// Re-install a recovered transaction (snapshot load, restart replay).
    pub fn install_txn(&self, txn: Transaction) {
        self.txns.insert(txn.txn_id().0, Arc::new(Mutex::new(txn)));
    }

    pub fn get_txn(&self, txn_id: TxnId) -> Option<SharedTxn> {
        self.txns.get(&txn_id.0).map(|e| e.value().clone())
    }

    /// Drop a transaction from the pool, recording its result for
    /// idempotent replays of COMMIT/ROLLBACK.
    pub fn remove_txn(&self, txn_id: TxnId, affected_rows: i64) {
        self.txns.remove(&txn_id.0);
        self.finished.lock().record(txn_id.0, affected_rows);
    }

    /// Affected-row count of a finished txn, if still remembered.
    pub fn finished_rows(&self, txn_id: TxnId) -> Option<i64> {
        self.finished.lock().get(txn_id.0)
    }

    /// Rollback of one txn on a stale-version PREPARE.
    pub fn rollback_txn(&self, txn_id: TxnId) {
        if let Some((_, txn)) = self.txns.remove(&txn_id.0) {
            txn.lock().rollback();
            warn!(region_id = self.region_id, txn_id = txn_id.0, "txn rolled back");
        }
    }

    /// When leadership is lost, every transaction whose PREPARE has not been
    /// replicated is dropped; the new leader redoes them from client-resent
    /// cache plans. Prepared transactions stay.
    pub fn on_leader_stop_rollback(&self) {
        let doomed: Vec<u64> = self
            .txns
            .iter()
            .filter(|e| !e.value().lock().is_prepared)
            .map(|e| *e.key())
            .collect();
        for txn_id in doomed {
            if let Some((_, txn)) = self.txns.remove(&txn_id) {
                txn.lock().rollback();
                warn!(
                    region_id = self.region_id,
                    txn_id, "rolled back unprepared txn on leader stop"
                );
            }
        }
    }

    /// Snapshot of all prepared transactions, for split handover and
    /// snapshot save.
    pub fn prepared_txn_infos(&self) -> Vec<TransactionInfo> {
        let mut infos: Vec<TransactionInfo> = self
            .txns
            .iter()
            .filter(|e| e.value().lock().is_prepared)
            .map(|e| {
                let txn = e.value().lock();
                TransactionInfo {
                    txn_id: txn.txn_id().0,
                    seq_id: txn.seq_id(),
                    start_seq_id: 1,
                    cache_plans: txn.cache_plans(),
                    num_rows: txn.num_increase_rows,
                    prepared_index: txn.prepared_index,
                    ..Default::default()
                }
            })
            .collect();
        infos.sort_by_key(|i| i.txn_id);
        infos
    }

    /// Ids of all live transactions (diagnostics, tests).
    pub fn txn_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.txns.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> TxnPool {
        TxnPool::new(7, KvEngine::new(), 16)
    }

    #[test]
    fn test_create_get_remove() {
        let pool = pool();
        let txn = pool.create_txn(TxnId(1)).unwrap();
        assert_eq!(txn.lock().txn_id(), TxnId(1));
        assert!(pool.get_txn(TxnId(1)).is_some());
        assert!(matches!(pool.create_txn(TxnId(1)), Err(TxnError::AlreadyExists(_))));
        pool.remove_txn(TxnId(1), 3);
        assert!(pool.get_txn(TxnId(1)).is_none());
        assert_eq!(pool.finished_rows(TxnId(1)), Some(3));
    }

    #[test]
    fn test_finished_ring_eviction() {
        let pool = TxnPool::new(7, KvEngine::new(), 2);
        pool.remove_txn(TxnId(1), 1);
        pool.remove_txn(TxnId(2), 2);
        pool.remove_txn(TxnId(3), 3);
        assert_eq!(pool.finished_rows(TxnId(1)), None);
        assert_eq!(pool.finished_rows(TxnId(2)), Some(2));
        assert_eq!(pool.finished_rows(TxnId(3)), Some(3));
    }

    #[test]
    fn test_leader_stop_keeps_prepared() {
        let pool = pool();
        let unprepared = pool.create_txn(TxnId(1)).unwrap();
        let prepared = pool.create_txn(TxnId(2)).unwrap();
        prepared.lock().is_prepared = true;
        drop((unprepared, prepared));
        pool.on_leader_stop_rollback();
        assert_eq!(pool.txn_ids(), vec![2]);
    }

    #[test]
    fn test_prepared_txn_infos_sorted() {
        let pool = pool();
        for id in [5u64, 3, 9] {
            let txn = pool.create_txn(TxnId(id)).unwrap();
            let mut guard = txn.lock();
            guard.is_prepared = true;
            guard.num_increase_rows = id as i64;
        }
        let infos = pool.prepared_txn_infos();
        assert_eq!(infos.iter().map(|i| i.txn_id).collect::<Vec<_>>(), vec![3, 5, 9]);
        assert_eq!(infos[0].num_rows, 3);
    }
}
