//! The consensus boundary of the region core.
//!
//! The consensus *library* — election, log replication, snapshot transport —
//! is an external collaborator. The region core implements only the
//! replicated-state-machine hooks defined here, and `RaftGroup` provides a
//! deterministic in-process group that drives those hooks in log order:
//! every committed entry reaches every replica's `on_apply`, monotonically
//! by index, with the proposer's completion closure resolved on the leader.
//!
//! - `RegionStateMachine`: the hook surface a region implements
//! - `RaftGroup`: one region's replica set; assigns `(term, index)` and
//!   fans entries out
//! - `RaftRouter`: region-id → group registry, used for inter-region RPCs
//!   during split/merge

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use talon_proto::StoreResponse;

/// A committed consensus log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

/// Completion callback resolved on the leader when its entry applies.
pub type ApplyClosure = Box<dyn FnOnce(StoreResponse) + Send>;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("not leader for region {region_id}, leader {leader:?}")]
    NotLeader { region_id: u64, leader: Option<String> },

    #[error("no replicas registered for region {0}")]
    NoReplicas(u64),

    #[error("region {0} not found")]
    RegionNotFound(u64),

    #[error("proposal failed: {0}")]
    ProposalFailed(String),
}

/// The replicated-state-machine hooks a region implements.
pub trait RegionStateMachine: Send + Sync {
    /// Called for every committed entry, monotonically by index. The closure
    /// is present only on the proposing leader.
    fn on_apply(&self, entry: &LogEntry, done: Option<ApplyClosure>);

    fn on_leader_start(&self, term: u64);

    fn on_leader_stop(&self);

    fn on_configuration_committed(&self, peers: &[String], index: u64);

    /// Consensus asks the region to persist a snapshot.
    fn on_snapshot_save(&self) -> Result<(), ConsensusError>;

    /// Consensus installed a snapshot; rebuild state from durable records.
    fn on_snapshot_load(&self) -> Result<(), ConsensusError>;

    fn on_error(&self, message: &str);
}

struct Replica {
    address: String,
    sm: Arc<dyn RegionStateMachine>,
}

struct GroupInner {
    term: u64,
    next_index: u64,
    replicas: Vec<Replica>,
    leader: usize,
}

/// One region's consensus group. Propose on the leader; entries apply on
/// every replica in index order before the call returns. The committed log
/// is retained so a split parent can ship catch-up entries to its child.
pub struct RaftGroup {
    region_id: u64,
    inner: Mutex<GroupInner>,
    log: Mutex<Vec<LogEntry>>,
    /// Serializes propose+apply: one apply thread per region, entries reach
    /// the state machines in index order.
    apply_lock: Mutex<()>,
}

impl RaftGroup {
    pub fn new(region_id: u64) -> Arc<Self> {
        Arc::new(Self {
            region_id,
            inner: Mutex::new(GroupInner { term: 1, next_index: 1, replicas: Vec::new(), leader: 0 }),
            log: Mutex::new(Vec::new()),
            apply_lock: Mutex::new(()),
        })
    }

    /// Resume log numbering after a restart: the next entry must land past
    /// everything the replicas already applied, under a fresh term.
    pub fn reset_log_start(&self, next_index: u64, term: u64) {
        let mut inner = self.inner.lock();
        inner.next_index = inner.next_index.max(next_index);
        inner.term = inner.term.max(term);
    }

    /// Committed entries with `from ≤ index ≤ to`.
    pub fn entries(&self, from: u64, to: u64) -> Vec<LogEntry> {
        self.log
            .lock()
            .iter()
            .filter(|e| e.index >= from && e.index <= to)
            .cloned()
            .collect()
    }

    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    /// Register a replica. The first replica becomes leader and gets the
    /// `on_leader_start` hook. Hooks run outside the group lock so they may
    /// query the group.
    pub fn add_replica(&self, address: impl Into<String>, sm: Arc<dyn RegionStateMachine>) {
        let address = address.into();
        let (peers, index, term, is_first, sms) = {
            let mut inner = self.inner.lock();
            inner.replicas.push(Replica { address: address.clone(), sm: sm.clone() });
            let peers: Vec<String> = inner.replicas.iter().map(|r| r.address.clone()).collect();
            let sms: Vec<Arc<dyn RegionStateMachine>> =
                inner.replicas.iter().map(|r| r.sm.clone()).collect();
            (peers, inner.next_index, inner.term, inner.replicas.len() == 1, sms)
        };
        for sm in &sms {
            sm.on_configuration_committed(&peers, index);
        }
        if is_first {
            sms[0].on_leader_start(term);
        }
        info!(region_id = self.region_id, address = %address, "replica added");
    }

    pub fn leader_address(&self) -> Option<String> {
        let inner = self.inner.lock();
        inner.replicas.get(inner.leader).map(|r| r.address.clone())
    }

    pub fn peers(&self) -> Vec<String> {
        self.inner.lock().replicas.iter().map(|r| r.address.clone()).collect()
    }

    pub fn term(&self) -> u64 {
        self.inner.lock().term
    }

    pub fn last_index(&self) -> u64 {
        self.inner.lock().next_index - 1
    }

    fn is_leader_addr(&self, address: &str) -> bool {
        let inner = self.inner.lock();
        inner.replicas.get(inner.leader).map(|r| r.address == address).unwrap_or(false)
    }

    /// Propose from `address`. Fails with a leader hint when `address` is
    /// not the leader. On success the entry has applied everywhere.
    pub fn propose(
        &self,
        address: &str,
        data: Vec<u8>,
        done: Option<ApplyClosure>,
    ) -> Result<(u64, u64), ConsensusError> {
        if !self.is_leader_addr(address) {
            return Err(ConsensusError::NotLeader {
                region_id: self.region_id,
                leader: self.leader_address(),
            });
        }
        self.propose_on_leader(data, done)
    }

    /// Propose on whatever replica currently leads.
    pub fn propose_on_leader(
        &self,
        data: Vec<u8>,
        mut done: Option<ApplyClosure>,
    ) -> Result<(u64, u64), ConsensusError> {
        let _apply_guard = self.apply_lock.lock();
        let (entry, targets, leader_idx) = {
            let mut inner = self.inner.lock();
            if inner.replicas.is_empty() {
                return Err(ConsensusError::NoReplicas(self.region_id));
            }
            let entry = LogEntry { index: inner.next_index, term: inner.term, data };
            inner.next_index += 1;
            let targets: Vec<(usize, Arc<dyn RegionStateMachine>)> =
                inner.replicas.iter().enumerate().map(|(i, r)| (i, r.sm.clone())).collect();
            (entry, targets, inner.leader)
        };
        self.log.lock().push(entry.clone());
        // Apply outside the group lock: apply handlers may propose to other
        // regions (split/merge).
        for (idx, sm) in targets {
            let closure = if idx == leader_idx { done.take() } else { None };
            sm.on_apply(&entry, closure);
        }
        Ok((entry.term, entry.index))
    }

    /// Transfer leadership to another registered replica.
    pub fn transfer_leader(&self, address: &str) -> Result<(), ConsensusError> {
        let (old_sm, new_sm, term) = {
            let mut inner = self.inner.lock();
            let Some(new_idx) = inner.replicas.iter().position(|r| r.address == address) else {
                return Err(ConsensusError::ProposalFailed(format!(
                    "no replica at {address} in region {}",
                    self.region_id
                )));
            };
            if new_idx == inner.leader {
                return Ok(());
            }
            let old_idx = inner.leader;
            inner.leader = new_idx;
            inner.term += 1;
            (
                inner.replicas[old_idx].sm.clone(),
                inner.replicas[new_idx].sm.clone(),
                inner.term,
            )
        };
        old_sm.on_leader_stop();
        new_sm.on_leader_start(term);
        info!(region_id = self.region_id, leader = address, "leader transferred");
        Ok(())
    }

    /// Drop a replica (remove-region path).
    pub fn remove_replica(&self, address: &str) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.replicas.iter().position(|r| r.address == address) {
            inner.replicas.remove(idx);
            if inner.leader >= inner.replicas.len() {
                inner.leader = 0;
            }
        } else {
            warn!(region_id = self.region_id, address, "remove of unknown replica");
        }
    }

    /// Ask every replica to save a snapshot (test harness convenience).
    pub fn trigger_snapshot(&self) -> Result<(), ConsensusError> {
        let sms: Vec<Arc<dyn RegionStateMachine>> =
            self.inner.lock().replicas.iter().map(|r| r.sm.clone()).collect();
        for sm in sms {
            sm.on_snapshot_save()?;
        }
        Ok(())
    }
}

/// region-id → group registry; stands in for the RPC mesh between stores.
#[derive(Default)]
pub struct RaftRouter {
    groups: DashMap<u64, Arc<RaftGroup>>,
}

impl RaftRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, group: Arc<RaftGroup>) {
        self.groups.insert(group.region_id(), group);
    }

    pub fn get(&self, region_id: u64) -> Result<Arc<RaftGroup>, ConsensusError> {
        self.groups
            .get(&region_id)
            .map(|g| g.value().clone())
            .ok_or(ConsensusError::RegionNotFound(region_id))
    }

    pub fn remove(&self, region_id: u64) {
        self.groups.remove(&region_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct RecordingSm {
        applied: PlMutex<Vec<(u64, u64, Vec<u8>)>>,
        leader_terms: PlMutex<Vec<u64>>,
        stopped: PlMutex<u32>,
    }

    impl RegionStateMachine for RecordingSm {
        fn on_apply(&self, entry: &LogEntry, done: Option<ApplyClosure>) {
            self.applied.lock().push((entry.index, entry.term, entry.data.clone()));
            if let Some(done) = done {
                done(StoreResponse::success());
            }
        }
        fn on_leader_start(&self, term: u64) {
            self.leader_terms.lock().push(term);
        }
        fn on_leader_stop(&self) {
            *self.stopped.lock() += 1;
        }
        fn on_configuration_committed(&self, _peers: &[String], _index: u64) {}
        fn on_snapshot_save(&self) -> Result<(), ConsensusError> {
            Ok(())
        }
        fn on_snapshot_load(&self) -> Result<(), ConsensusError> {
            Ok(())
        }
        fn on_error(&self, _message: &str) {}
    }

    #[test]
    fn test_entries_apply_in_order_on_all_replicas() {
        let group = RaftGroup::new(1);
        let sms: Vec<Arc<RecordingSm>> = (0..3).map(|_| Arc::new(RecordingSm::default())).collect();
        for (i, sm) in sms.iter().enumerate() {
            group.add_replica(format!("store-{i}"), sm.clone());
        }
        for payload in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
            group.propose("store-0", payload, None).unwrap();
        }
        for sm in &sms {
            let applied = sm.applied.lock();
            let indexes: Vec<u64> = applied.iter().map(|(i, _, _)| *i).collect();
            assert_eq!(indexes, vec![1, 2, 3]);
        }
    }

    #[test]
    fn test_follower_propose_rejected_with_hint() {
        let group = RaftGroup::new(1);
        group.add_replica("store-0", Arc::new(RecordingSm::default()));
        group.add_replica("store-1", Arc::new(RecordingSm::default()));
        let err = group.propose("store-1", b"x".to_vec(), None).unwrap_err();
        match err {
            ConsensusError::NotLeader { leader, .. } => {
                assert_eq!(leader.as_deref(), Some("store-0"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_closure_resolved_only_on_leader() {
        let group = RaftGroup::new(1);
        let leader = Arc::new(RecordingSm::default());
        let follower = Arc::new(RecordingSm::default());
        group.add_replica("store-0", leader);
        group.add_replica("store-1", follower);
        let resolved = Arc::new(PlMutex::new(0u32));
        let r2 = resolved.clone();
        group
            .propose("store-0", b"x".to_vec(), Some(Box::new(move |_resp| *r2.lock() += 1)))
            .unwrap();
        assert_eq!(*resolved.lock(), 1);
    }

    #[test]
    fn test_leader_transfer_bumps_term_and_hooks() {
        let group = RaftGroup::new(1);
        let a = Arc::new(RecordingSm::default());
        let b = Arc::new(RecordingSm::default());
        group.add_replica("store-0", a.clone());
        group.add_replica("store-1", b.clone());
        let before = group.term();
        group.transfer_leader("store-1").unwrap();
        assert_eq!(group.term(), before + 1);
        assert_eq!(*a.stopped.lock(), 1);
        assert_eq!(b.leader_terms.lock().len(), 1);
        assert_eq!(group.leader_address().as_deref(), Some("store-1"));
        // Proposing through the old leader now fails.
        assert!(group.propose("store-0", b"x".to_vec(), None).is_err());
    }

    #[test]
    fn test_router_lookup() {
        let router = RaftRouter::new();
        let group = RaftGroup::new(9);
        router.register(group);
        assert!(router.get(9).is_ok());
        assert!(matches!(router.get(8), Err(ConsensusError::RegionNotFound(8))));
        router.remove(9);
        assert!(router.get(9).is_err());
    }
}
