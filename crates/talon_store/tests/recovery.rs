//! Crash-recovery paths: prepared transactions across restart, snapshot
//! save/load, durable applied-index invariants.

mod common;

use common::Cluster;
use talon_raft::RaftGroup;

const REGION: u64 = 10;

/// Tear the region's in-memory state down and rebuild it from durable
/// records on the same engine, the way a process restart would.
fn restart_region(cluster: &Cluster) {
    cluster.directory.remove_region_soft(REGION);
    let group = RaftGroup::new(REGION);
    cluster.directory.raft().register(group.clone());
    for store in &cluster.stores {
        store.reopen_region(REGION, &group).expect("reopen");
    }
}

// ── S6: prepared txn survives restart ─────────────────────────────────────

#[test]
fn test_prepared_txn_survives_restart_then_commits() {
    let cluster = Cluster::new(1);
    cluster.create_region(REGION, Vec::new(), Vec::new());
    let txn_id = 42;
    cluster.begin(REGION, 1, txn_id);
    cluster.txn_insert(REGION, 1, txn_id, 2, vec![Cluster::record(5, "pending", 0)]);
    assert!(cluster.prepare(REGION, 1, txn_id, Vec::new()).is_success());

    restart_region(&cluster);

    // The transaction is back in the pool, still invisible.
    let region = cluster.leader_region(REGION);
    assert_eq!(region.live_txn_count(), 1);
    assert!(cluster.select_ids(REGION, 1).is_empty());

    let resp = cluster.commit(REGION, 1, txn_id);
    assert!(resp.is_success(), "{}", resp.errmsg);
    assert_eq!(cluster.select_ids(REGION, 1), vec![5]);
    assert_eq!(region.num_table_lines(), 1);
}

#[test]
fn test_prepared_txn_survives_restart_then_rolls_back() {
    let cluster = Cluster::new(1);
    cluster.create_region(REGION, Vec::new(), Vec::new());
    let txn_id = 43;
    cluster.begin(REGION, 1, txn_id);
    cluster.txn_insert(REGION, 1, txn_id, 2, vec![Cluster::record(5, "doomed", 0)]);
    assert!(cluster.prepare(REGION, 1, txn_id, Vec::new()).is_success());

    restart_region(&cluster);

    let resp = cluster.rollback(REGION, 1, txn_id);
    assert!(resp.is_success(), "{}", resp.errmsg);
    assert!(cluster.select_ids(REGION, 1).is_empty());
    assert_eq!(cluster.leader_region(REGION).num_table_lines(), 0);
}

#[test]
fn test_committed_state_survives_restart() {
    let cluster = Cluster::new(1);
    cluster.create_region(REGION, Vec::new(), Vec::new());
    for id in 1..=3 {
        cluster.autocommit_insert(REGION, 1, id as u64, vec![Cluster::record(id, "r", 0)]);
    }
    let applied_before = cluster.leader_region(REGION).applied_index();

    restart_region(&cluster);

    let region = cluster.leader_region(REGION);
    assert_eq!(region.applied_index(), applied_before);
    assert_eq!(region.num_table_lines(), 3);
    assert_eq!(cluster.select_ids(REGION, 1), vec![1, 2, 3]);
}

// ── Snapshot save/load ────────────────────────────────────────────────────

#[test]
fn test_snapshot_save_then_install() {
    let cluster = Cluster::new(1);
    cluster.create_region(REGION, Vec::new(), Vec::new());
    for id in 1..=4 {
        cluster.autocommit_insert(REGION, 1, id as u64, vec![Cluster::record(id, "s", 0)]);
    }
    let region = cluster.leader_region(REGION);
    region.save_snapshot().expect("save");
    let applied = region.applied_index();

    // Wreck the engine state in-range, then reinstall from the files.
    let store = &cluster.stores[0];
    store.engine().delete_range(
        talon_storage::kv::Cf::Data,
        &talon_storage::codec::region_prefix(REGION),
        Some(&talon_storage::codec::region_prefix_end(REGION)),
    );
    assert!(cluster.select_ids(REGION, 1).is_empty());

    region.load_snapshot().expect("load");
    assert_eq!(region.applied_index(), applied);
    assert_eq!(region.num_table_lines(), 4);
    assert_eq!(cluster.select_ids(REGION, 1), vec![1, 2, 3, 4]);
}

#[test]
fn test_snapshot_includes_prepared_txn() {
    let cluster = Cluster::new(1);
    cluster.create_region(REGION, Vec::new(), Vec::new());
    cluster.autocommit_insert(REGION, 1, 1, vec![Cluster::record(1, "base", 0)]);
    let txn_id = 50;
    cluster.begin(REGION, 1, txn_id);
    cluster.txn_insert(REGION, 1, txn_id, 2, vec![Cluster::record(2, "pending", 0)]);
    assert!(cluster.prepare(REGION, 1, txn_id, Vec::new()).is_success());

    let region = cluster.leader_region(REGION);
    region.save_snapshot().expect("save");
    region.load_snapshot().expect("load");

    // The prepared txn came back with the snapshot and can still commit.
    assert!(cluster.commit(REGION, 1, txn_id).is_success());
    assert_eq!(cluster.select_ids(REGION, 1), vec![1, 2]);
}

#[test]
fn test_snapshot_cadence_triggers_on_log_gap() {
    let mut config = common::test_config();
    config.snapshot_interval_s = 0;
    config.snapshot_diff_logs = 3;
    config.snapshot_diff_lines = 1_000_000;
    let cluster = Cluster::with_config(1, config);
    cluster.create_region(REGION, Vec::new(), Vec::new());
    for id in 1..=4 {
        cluster.autocommit_insert(REGION, 1, id as u64, vec![Cluster::record(id, "r", 0)]);
    }
    // Enough entries applied since the last snapshot: one was taken.
    let region = cluster.leader_region(REGION);
    let files = std::fs::read_dir(region.snapshot_path()).map(|d| d.count()).unwrap_or(0);
    assert!(files >= 2, "expected snapshot files, found {files}");
}
