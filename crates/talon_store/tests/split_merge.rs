//! Split and merge protocols end to end.

mod common;

use common::{rows_to_ids, Cluster};
use talon_common::error::ErrCode;
use talon_proto::RegionStatus;

const PARENT: u64 = 10;
const CHILD: u64 = 11;

fn seeded_cluster(stores: usize, lo: i32, hi: i32, ids: &[i32]) -> Cluster {
    let cluster = Cluster::new(stores);
    cluster.create_region(PARENT, Cluster::enc_pk(lo), Cluster::enc_pk(hi));
    for (i, id) in ids.iter().enumerate() {
        let resp = cluster.autocommit_insert(
            PARENT,
            1,
            1_000 + i as u64,
            vec![Cluster::record(*id, "row", 0)],
        );
        assert!(resp.is_success(), "insert {id}: {}", resp.errmsg);
    }
    cluster
}

// ── S3: mid split preserves reads ─────────────────────────────────────────

#[test]
fn test_mid_split_preserves_reads() {
    let cluster = seeded_cluster(3, 10, 50, &[15, 20, 30, 40]);
    let parent = cluster.leader_region(PARENT);
    let resp = parent.start_process_split(CHILD, false);
    assert!(resp.is_success(), "split failed: {}", resp.errmsg);

    // Ranges partition at the median key (30) and versions advanced.
    let parent_info = parent.region_info();
    let child = cluster.leader_region(CHILD);
    let child_info = child.region_info();
    assert_eq!(parent_info.end_key, child_info.start_key);
    assert_eq!(parent_info.end_key, Cluster::enc_pk(30));
    assert_eq!(child_info.end_key, Cluster::enc_pk(50));
    assert_eq!(parent_info.version, 2);
    assert_eq!(child_info.version, 1);
    assert_eq!(parent_info.status, RegionStatus::Idle);
    assert_eq!(child_info.status, RegionStatus::Idle);
    assert_eq!(parent.num_table_lines(), 2);
    assert_eq!(child.num_table_lines(), 2);

    // A reader holding the pre-split version is redirected to both regions.
    let stale = cluster.select(PARENT, 1, vec![Cluster::pk_bounds(15, 45, true)], Vec::new());
    assert_eq!(stale.errcode, ErrCode::VersionOld);
    assert!(stale.rows.is_empty());
    let mut covered: Vec<u64> = stale.regions.iter().map(|r| r.region_id).collect();
    covered.sort_unstable();
    assert_eq!(covered, vec![PARENT, CHILD]);

    // Retrying across both regions reads exactly the original rows.
    let mut seen = Vec::new();
    let p = cluster.select(PARENT, 2, vec![Cluster::pk_bounds(15, 45, true)], Vec::new());
    assert!(p.is_success());
    seen.extend(rows_to_ids(&p));
    let c = cluster.select(CHILD, 1, vec![Cluster::pk_bounds(15, 45, true)], Vec::new());
    assert!(c.is_success());
    seen.extend(rows_to_ids(&c));
    seen.sort_unstable();
    assert_eq!(seen, vec![15, 20, 30, 40]);
}

#[test]
fn test_mid_split_moves_secondary_entries() {
    let cluster = seeded_cluster(3, 0, 100, &[1, 2, 60, 70]);
    let parent = cluster.leader_region(PARENT);
    assert!(parent.start_process_split(CHILD, false).is_success());
    // Secondary scans stay correct on both sides.
    let by_name = |region_id: u64, version: u64| {
        let range = talon_proto::IndexRange {
            index_id: common::NAME_INDEX,
            left: vec![talon_common::value::Value::String("row".into())],
            right: vec![talon_common::value::Value::String("row".into())],
            left_field_cnt: 1,
            right_field_cnt: 1,
            ..Default::default()
        };
        let resp = cluster.select(region_id, version, vec![range], Vec::new());
        assert!(resp.is_success(), "{}", resp.errmsg);
        rows_to_ids(&resp)
    };
    assert_eq!(by_name(PARENT, 2), vec![1, 2]);
    assert_eq!(by_name(CHILD, 1), vec![60, 70]);
}

#[test]
fn test_split_writes_after_split_route_by_range() {
    let cluster = seeded_cluster(3, 0, 1000, &[100, 200, 300, 400]);
    let parent = cluster.leader_region(PARENT);
    assert!(parent.start_process_split(CHILD, false).is_success());
    // Writes in the child's range bounce off the parent with its new range.
    let resp = cluster.autocommit_insert(PARENT, 2, 2_000, vec![Cluster::record(800, "new", 0)]);
    assert_eq!(resp.errcode, ErrCode::ExecFail);
    let resp = cluster.autocommit_insert(CHILD, 1, 2_001, vec![Cluster::record(800, "new", 0)]);
    assert!(resp.is_success(), "{}", resp.errmsg);
    assert_eq!(cluster.leader_region(CHILD).num_table_lines(), 3);
}

// ── Tail split ────────────────────────────────────────────────────────────

#[test]
fn test_tail_split_starts_past_max_key() {
    let cluster = seeded_cluster(3, 0, 1000, &[1, 2, 3]);
    let parent = cluster.leader_region(PARENT);
    let resp = parent.start_process_split(CHILD, true);
    assert!(resp.is_success(), "{}", resp.errmsg);
    let parent_info = parent.region_info();
    let child_info = cluster.leader_region(CHILD).region_info();
    // All existing rows stay in the parent; the child starts just past the
    // max key and owns the append tail.
    assert_eq!(cluster.leader_region(PARENT).num_table_lines(), 3);
    assert_eq!(cluster.leader_region(CHILD).num_table_lines(), 0);
    assert_eq!(parent_info.end_key, child_info.start_key);
    assert!(parent_info.end_key > Cluster::enc_pk(3));
    assert!(parent_info.end_key < Cluster::enc_pk(4));
    let resp = cluster.autocommit_insert(CHILD, 1, 2_000, vec![Cluster::record(50, "t", 0)]);
    assert!(resp.is_success(), "{}", resp.errmsg);
    assert_eq!(cluster.select_ids(CHILD, 1), vec![50]);
}

#[test]
fn test_tail_split_empty_region_has_no_split_key() {
    let cluster = Cluster::new(1);
    cluster.create_region(PARENT, Vec::new(), Vec::new());
    let parent = cluster.leader_region(PARENT);
    let resp = parent.start_process_split(CHILD, true);
    assert!(!resp.is_success());
    assert!(resp.errmsg.contains("no split key"), "{}", resp.errmsg);
    // The parent resumed serving: gate reopened, range unchanged.
    assert_eq!(parent.region_info().status, RegionStatus::Idle);
    assert_eq!(parent.version(), 1);
    assert!(cluster
        .autocommit_insert(PARENT, 1, 1, vec![Cluster::record(1, "a", 0)])
        .is_success());
}

#[test]
fn test_split_requires_enough_keys() {
    let cluster = seeded_cluster(1, 0, 100, &[5]);
    let parent = cluster.leader_region(PARENT);
    let resp = parent.start_process_split(CHILD, false);
    assert!(!resp.is_success());
    assert_eq!(parent.region_info().status, RegionStatus::Idle);
}

#[test]
fn test_split_rejected_while_structural_op_running() {
    let cluster = seeded_cluster(1, 0, 100, &[1, 2, 3, 4]);
    let parent = cluster.leader_region(PARENT);
    let _guard = parent.acquire_structural_gate().unwrap();
    let resp = parent.start_process_split(CHILD, false);
    assert!(!resp.is_success());
    assert!(resp.errmsg.contains("busy"), "{}", resp.errmsg);
}

#[test]
fn test_split_carries_prepared_txn_to_child() {
    let cluster = seeded_cluster(3, 0, 1000, &[100, 200, 600, 700]);
    // Prepare (but do not commit) a txn writing into the future child range.
    let txn_id = 77;
    cluster.begin(PARENT, 1, txn_id);
    cluster.txn_insert(PARENT, 1, txn_id, 2, vec![Cluster::record(650, "pending", 0)]);
    assert!(cluster.prepare(PARENT, 1, txn_id, Vec::new()).is_success());

    let parent = cluster.leader_region(PARENT);
    assert!(parent.start_process_split(CHILD, false).is_success());

    // The prepared txn followed the split to the child; committing there
    // lands the row.
    let resp = cluster.commit(CHILD, 1, txn_id);
    assert!(resp.is_success(), "{}", resp.errmsg);
    let ids = cluster.select_ids(CHILD, 1);
    assert!(ids.contains(&650), "child rows: {ids:?}");
}

// ── Merge ─────────────────────────────────────────────────────────────────

#[test]
fn test_merge_left_into_right() {
    let cluster = Cluster::new(3);
    cluster.create_region(PARENT, Cluster::enc_pk(0), Cluster::enc_pk(50));
    cluster.create_region(CHILD, Cluster::enc_pk(50), Cluster::enc_pk(100));
    // The scheduler only merges an emptied left region.
    cluster.autocommit_insert(CHILD, 1, 2, vec![Cluster::record(60, "r", 0)]);

    let left = cluster.leader_region(PARENT);
    let right_info = cluster.leader_region(CHILD).region_info();
    let resp = left.start_process_merge(right_info);
    assert!(resp.is_success(), "{}", resp.errmsg);

    // The surviving region's range is the union; the absorbed one is a
    // tombstone.
    let right = cluster.leader_region(CHILD).region_info();
    assert_eq!(right.start_key, Cluster::enc_pk(0));
    assert_eq!(right.end_key, Cluster::enc_pk(100));
    assert_eq!(right.version, 2);
    let left_info = left.region_info();
    assert!(left_info.is_merged());
    assert_eq!(left_info.version, 2);

    // Requests still hitting the left region learn about the absorber.
    let resp = cluster.select(PARENT, 1, vec![Cluster::pk_scan_range()], Vec::new());
    assert_eq!(resp.errcode, ErrCode::VersionOld);
    assert!(resp.is_merge);
    assert!(resp.regions.iter().any(|r| r.region_id == CHILD && r.version == 2));
}

#[test]
fn test_merge_rejects_non_adjacent_regions() {
    let cluster = Cluster::new(1);
    cluster.create_region(PARENT, Cluster::enc_pk(0), Cluster::enc_pk(40));
    cluster.create_region(CHILD, Cluster::enc_pk(50), Cluster::enc_pk(100));
    let left = cluster.leader_region(PARENT);
    let right_info = cluster.leader_region(CHILD).region_info();
    let resp = left.start_process_merge(right_info);
    assert!(!resp.is_success());
    assert_eq!(left.region_info().status, RegionStatus::Idle);
    assert!(!left.region_info().is_merged());
}

#[test]
fn test_merge_rejected_with_live_txn() {
    let cluster = Cluster::new(1);
    cluster.create_region(PARENT, Cluster::enc_pk(0), Cluster::enc_pk(50));
    cluster.create_region(CHILD, Cluster::enc_pk(50), Cluster::enc_pk(100));
    cluster.begin(PARENT, 1, 5);
    let left = cluster.leader_region(PARENT);
    let right_info = cluster.leader_region(CHILD).region_info();
    let resp = left.start_process_merge(right_info);
    assert!(!resp.is_success());
    assert!(resp.errmsg.contains("busy"), "{}", resp.errmsg);
}
