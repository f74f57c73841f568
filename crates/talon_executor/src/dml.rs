//! DML execution: plan dispatch plus insert/delete/update against the
//! transaction, maintaining secondary and fulltext indexes per their
//! online-DDL state.

use std::sync::Arc;

use talon_common::error::ExecError;
use talon_common::schema::IndexInfo;
use talon_proto::plan::{DeleteNode, InsertNode, UpdateNode};
use talon_proto::{Plan, PlanNode, Record};
use talon_txn::pool::SharedTxn;
use tracing::debug;

use crate::eval;
use crate::scan::{self, ScannedRow};
use crate::state::{ExecResult, RuntimeState};

/// Execute a plan root. The single entry point the region apply path uses.
pub fn execute_plan(state: &mut RuntimeState, plan: &Plan) -> Result<ExecResult, ExecError> {
    match &plan.root {
        PlanNode::Scan(scan_node) => {
            let rows = scan::read_rows(state, scan_node)?;
            let projected = scan::project_rows(state, scan_node.tuple_id, &rows);
            Ok(ExecResult {
                affected_rows: 0,
                rows: projected,
                scan_indexes: state.scan_indexes.clone(),
            })
        }
        PlanNode::Insert(node) => execute_insert(state, node),
        PlanNode::Delete(node) => execute_delete(state, node),
        PlanNode::Update(node) => execute_update(state, node),
    }
}

fn dml_txn(state: &RuntimeState) -> Result<SharedTxn, ExecError> {
    state
        .txn
        .clone()
        .ok_or(ExecError::UnsupportedNode("dml outside a transaction"))
}

/// The secondary indexes a write must touch, per their DDL state.
fn maintained_indexes(state: &RuntimeState) -> Vec<Arc<IndexInfo>> {
    state
        .resource
        .indexes
        .iter()
        .skip(1)
        .filter(|i| i.state.deletes_visible())
        .cloned()
        .collect()
}

/// The fulltext word for an index, taken from its single indexed column.
fn fulltext_word(index: &IndexInfo, record: &Record) -> Option<String> {
    let field = index.fields.first()?;
    let value = record.get(field.0)?;
    if value.is_null() {
        return None;
    }
    Some(value.get_string())
}

fn index_entries_put(
    state: &mut RuntimeState,
    txn: &SharedTxn,
    record: &Record,
    pk_tuple: &[u8],
) -> Result<(), ExecError> {
    let region_id = state.resource.region_info.region_id;
    for index in maintained_indexes(state) {
        // DELETE_ONLY indexes see removals but not inserts.
        if !index.state.writes_visible() {
            continue;
        }
        if index.is_fulltext() {
            if let Some(reverse) = state.resource.reverse_indexes.get(&index.id.0) {
                if let Some(word) = fulltext_word(&index, record) {
                    reverse.insert_reverse(&mut txn.lock(), &word, pk_tuple)?;
                }
            }
            continue;
        }
        txn.lock().put_secondary(region_id, &index, record, pk_tuple)?;
    }
    Ok(())
}

fn index_entries_delete(
    state: &mut RuntimeState,
    txn: &SharedTxn,
    record: &Record,
    pk_tuple: &[u8],
) -> Result<(), ExecError> {
    let region_id = state.resource.region_info.region_id;
    for index in maintained_indexes(state) {
        if index.is_fulltext() {
            if let Some(reverse) = state.resource.reverse_indexes.get(&index.id.0) {
                if let Some(word) = fulltext_word(&index, record) {
                    reverse.delete_reverse(&mut txn.lock(), &word, pk_tuple)?;
                }
            }
            continue;
        }
        txn.lock().delete_secondary(region_id, &index, record, pk_tuple)?;
    }
    Ok(())
}

fn execute_insert(state: &mut RuntimeState, node: &InsertNode) -> Result<ExecResult, ExecError> {
    let txn = dml_txn(state)?;
    let resource = state.resource.clone();
    let region = resource.region_info.clone();
    let table = resource.table.clone();
    let pk_index = resource.pk_index()?.clone();

    for record in &node.records {
        let put = {
            let mut guard = txn.lock();
            match guard.put_primary(&region, &table, &pk_index, record, node.need_presence_check) {
                Ok(pk) => {
                    guard.num_increase_rows += 1;
                    guard.dml_num_affected_rows += 1;
                    Some(pk)
                }
                // Split-time replay: rows that moved out of this region's
                // range are someone else's now.
                Err(talon_common::error::TxnError::OutOfRegionRange) if state.skip_out_of_range => {
                    None
                }
                Err(e) => return Err(e.into()),
            }
        };
        let Some(pk_tuple) = put else {
            continue;
        };
        index_entries_put(state, &txn, record, &pk_tuple)?;
        state.affected_rows += 1;
        state.num_increase_rows += 1;
    }
    debug!(
        region_id = region.region_id,
        rows = node.records.len(),
        "insert executed"
    );
    Ok(ExecResult { affected_rows: state.affected_rows, ..Default::default() })
}

fn select_for_dml(state: &mut RuntimeState, scan: &talon_proto::plan::ScanNode) -> Result<Vec<ScannedRow>, ExecError> {
    // The scan reads through the txn overlay so earlier statements of the
    // same transaction are visible.
    scan::read_rows(state, scan)
}

fn execute_delete(state: &mut RuntimeState, node: &DeleteNode) -> Result<ExecResult, ExecError> {
    let txn = dml_txn(state)?;
    let resource = state.resource.clone();
    let region = resource.region_info.clone();
    let table = resource.table.clone();
    let pk_index = resource.pk_index()?.clone();

    let victims = select_for_dml(state, &node.scan)?;
    for (pk_tuple, record) in &victims {
        {
            let mut guard = txn.lock();
            // Lock the row before removing it.
            if guard.get_update_primary(&region, &pk_index, pk_tuple)?.is_none() {
                continue;
            }
            guard.remove_primary(&region, &table, &pk_index, pk_tuple)?;
            guard.num_increase_rows -= 1;
            guard.dml_num_affected_rows += 1;
        }
        index_entries_delete(state, &txn, record, pk_tuple)?;
        state.affected_rows += 1;
        state.num_increase_rows -= 1;
    }
    Ok(ExecResult { affected_rows: state.affected_rows, ..Default::default() })
}

fn execute_update(state: &mut RuntimeState, node: &UpdateNode) -> Result<ExecResult, ExecError> {
    let txn = dml_txn(state)?;
    let resource = state.resource.clone();
    let region = resource.region_info.clone();
    let table = resource.table.clone();
    let pk_index = resource.pk_index()?.clone();

    let victims = select_for_dml(state, &node.scan)?;
    for (pk_tuple, old_record) in &victims {
        let mut new_record = old_record.clone();
        for (field_id, expr) in &node.assignments {
            new_record.set(*field_id, eval::eval(expr, old_record)?);
        }
        let new_pk = talon_txn::Transaction::encode_tuple(&pk_index, &new_record);
        let pk_changed = new_pk != *pk_tuple;

        // Old index entries go away; primary moves when the pk changed.
        index_entries_delete(state, &txn, old_record, pk_tuple)?;
        {
            let mut guard = txn.lock();
            if guard.get_update_primary(&region, &pk_index, pk_tuple)?.is_none() {
                continue;
            }
            if pk_changed {
                guard.remove_primary(&region, &table, &pk_index, pk_tuple)?;
                guard.put_primary(&region, &table, &pk_index, &new_record, true)?;
            } else {
                guard.put_primary(&region, &table, &pk_index, &new_record, false)?;
            }
            guard.dml_num_affected_rows += 1;
        }
        index_entries_put(state, &txn, &new_record, &new_pk)?;
        state.affected_rows += 1;
    }
    Ok(ExecResult { affected_rows: state.affected_rows, ..Default::default() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use parking_lot::Mutex;
    use talon_common::schema::{FieldInfo, IndexState, IndexType, SegmentType, TableInfo};
    use talon_common::types::{FieldId, IndexId, TableId, TxnId};
    use talon_common::value::{Value, ValueType};
    use talon_proto::plan::ScanNode;
    use talon_proto::{Expr, ExprOp, IndexRange, RegionInfo, SlotDescriptor, TupleDescriptor};
    use talon_storage::kv::KvEngine;
    use talon_txn::Transaction;

    use crate::state::RegionResource;

    fn table() -> TableInfo {
        TableInfo {
            id: TableId(1),
            name: "t".into(),
            fields: vec![
                FieldInfo { id: FieldId(1), name: "id".into(), field_type: ValueType::Int32, can_null: false },
                FieldInfo { id: FieldId(2), name: "name".into(), field_type: ValueType::String, can_null: true },
                FieldInfo { id: FieldId(3), name: "score".into(), field_type: ValueType::Int64, can_null: true },
            ],
            indexes: vec![IndexId(1), IndexId(20)],
            columnar: false,
            partition_num: 1,
        }
    }

    fn indexes(sec_state: IndexState) -> Vec<Arc<IndexInfo>> {
        vec![
            Arc::new(IndexInfo {
                id: IndexId(1),
                table_id: TableId(1),
                index_type: IndexType::Primary,
                state: IndexState::Public,
                fields: vec![FieldId(1)],
                segment_type: SegmentType::NoSegment,
            }),
            Arc::new(IndexInfo {
                id: IndexId(20),
                table_id: TableId(1),
                index_type: IndexType::Key,
                state: sec_state,
                fields: vec![FieldId(2)],
                segment_type: SegmentType::NoSegment,
            }),
        ]
    }

    fn resource(engine: &Arc<KvEngine>, sec_state: IndexState) -> Arc<RegionResource> {
        let _ = engine;
        Arc::new(RegionResource {
            region_info: RegionInfo {
                region_id: 7,
                table_id: 1,
                index_id: 1,
                version: 1,
                ..Default::default()
            },
            table: Arc::new(table()),
            indexes: indexes(sec_state),
            reverse_indexes: HashMap::new(),
        })
    }

    fn state_with_txn(
        engine: &Arc<KvEngine>,
        sec_state: IndexState,
        txn_id: u64,
    ) -> (RuntimeState, SharedTxn) {
        let txn: SharedTxn = Arc::new(Mutex::new(Transaction::begin(engine, TxnId(txn_id), 7)));
        let tuples = vec![TupleDescriptor {
            tuple_id: 0,
            slots: vec![
                SlotDescriptor { slot_id: 1, field_id: 1, value_type: ValueType::Int32 },
                SlotDescriptor { slot_id: 2, field_id: 2, value_type: ValueType::String },
            ],
        }];
        let state = RuntimeState::new(
            resource(engine, sec_state),
            engine.snapshot(),
            Some(txn.clone()),
            tuples,
            1024,
        );
        (state, txn)
    }

    fn record(id: i32, name: &str, score: i64) -> Record {
        let mut r = Record::new();
        r.set(1, Value::Int32(id));
        r.set(2, Value::String(name.into()));
        r.set(3, Value::Int64(score));
        r
    }

    fn insert_rows(engine: &Arc<KvEngine>, rows: &[(i32, &str, i64)]) {
        let (mut state, txn) = state_with_txn(engine, IndexState::Public, 1);
        let node = InsertNode {
            table_id: 1,
            records: rows.iter().map(|(i, n, s)| record(*i, n, *s)).collect(),
            need_presence_check: true,
        };
        execute_insert(&mut state, &node).unwrap();
        txn.lock().commit().unwrap();
    }

    fn pk_range(id: i32) -> IndexRange {
        IndexRange {
            index_id: 1,
            left: vec![Value::Int32(id)],
            right: vec![Value::Int32(id)],
            left_field_cnt: 1,
            right_field_cnt: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_then_point_select() {
        let engine = KvEngine::new();
        insert_rows(&engine, &[(1, "a", 10), (2, "b", 20)]);
        let (mut state, _txn) = state_with_txn(&engine, IndexState::Public, 2);
        let scan = ScanNode { table_id: 1, tuple_id: 0, ranges: vec![pk_range(2)], ..Default::default() };
        let result = execute_plan(&mut state, &Plan { root: PlanNode::Scan(scan) }).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][0], Value::Int32(2));
        assert_eq!(result.rows[0][1], Value::String("b".into()));
    }

    #[test]
    fn test_insert_duplicate_fails() {
        let engine = KvEngine::new();
        insert_rows(&engine, &[(1, "a", 10)]);
        let (mut state, _txn) = state_with_txn(&engine, IndexState::Public, 2);
        let node = InsertNode {
            table_id: 1,
            records: vec![record(1, "b", 0)],
            need_presence_check: true,
        };
        let err = execute_insert(&mut state, &node).unwrap_err();
        assert!(matches!(err, ExecError::Txn(_)));
    }

    #[test]
    fn test_range_scan_with_conjunct() {
        let engine = KvEngine::new();
        insert_rows(&engine, &[(1, "a", 10), (2, "b", 20), (3, "c", 30), (4, "d", 40)]);
        let (mut state, _txn) = state_with_txn(&engine, IndexState::Public, 2);
        let scan = ScanNode {
            table_id: 1,
            tuple_id: 0,
            ranges: vec![IndexRange {
                index_id: 1,
                left: vec![Value::Int32(2)],
                right: vec![Value::Int32(4)],
                left_field_cnt: 1,
                right_field_cnt: 1,
                right_open: true,
                ..Default::default()
            }],
            conjuncts: vec![Expr::Binary {
                op: ExprOp::Gt,
                left: Box::new(Expr::FieldRef { field_id: 3 }),
                right: Box::new(Expr::Literal(Value::Int64(20))),
            }],
            ..Default::default()
        };
        let rows = scan::read_rows(&mut state, &scan).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.get(1), Some(&Value::Int32(3)));
    }

    #[test]
    fn test_secondary_index_scan() {
        let engine = KvEngine::new();
        insert_rows(&engine, &[(1, "x", 10), (2, "y", 20), (3, "x", 30)]);
        let (mut state, _txn) = state_with_txn(&engine, IndexState::Public, 2);
        let scan = ScanNode {
            table_id: 1,
            tuple_id: 0,
            ranges: vec![IndexRange {
                index_id: 20,
                left: vec![Value::String("x".into())],
                right: vec![Value::String("x".into())],
                left_field_cnt: 1,
                right_field_cnt: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        let rows = scan::read_rows(&mut state, &scan).unwrap();
        let ids: Vec<_> = rows.iter().map(|(_, r)| r.get_or_null(1)).collect();
        assert_eq!(ids, vec![Value::Int32(1), Value::Int32(3)]);
        assert_eq!(state.scan_indexes, vec![20]);
    }

    #[test]
    fn test_delete_maintains_secondary() {
        let engine = KvEngine::new();
        insert_rows(&engine, &[(1, "x", 10), (2, "x", 20)]);
        let (mut state, txn) = state_with_txn(&engine, IndexState::Public, 2);
        let node = DeleteNode {
            table_id: 1,
            scan: ScanNode { table_id: 1, tuple_id: 0, ranges: vec![pk_range(1)], ..Default::default() },
        };
        let result = execute_delete(&mut state, &node).unwrap();
        assert_eq!(result.affected_rows, 1);
        assert_eq!(state.num_increase_rows, -1);
        txn.lock().commit().unwrap();

        // The secondary no longer returns the deleted row.
        let (mut state, _txn) = state_with_txn(&engine, IndexState::Public, 3);
        let scan = ScanNode {
            table_id: 1,
            tuple_id: 0,
            ranges: vec![IndexRange {
                index_id: 20,
                left: vec![Value::String("x".into())],
                right: vec![Value::String("x".into())],
                left_field_cnt: 1,
                right_field_cnt: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        let rows = scan::read_rows(&mut state, &scan).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.get(1), Some(&Value::Int32(2)));
    }

    #[test]
    fn test_update_rewrites_secondary() {
        let engine = KvEngine::new();
        insert_rows(&engine, &[(1, "old", 10)]);
        let (mut state, txn) = state_with_txn(&engine, IndexState::Public, 2);
        let node = UpdateNode {
            table_id: 1,
            scan: ScanNode { table_id: 1, tuple_id: 0, ranges: vec![pk_range(1)], ..Default::default() },
            assignments: vec![(2, Expr::Literal(Value::String("new".into())))],
        };
        let result = execute_update(&mut state, &node).unwrap();
        assert_eq!(result.affected_rows, 1);
        txn.lock().commit().unwrap();

        let (mut state, _txn) = state_with_txn(&engine, IndexState::Public, 3);
        let by_name = |name: &str| ScanNode {
            table_id: 1,
            tuple_id: 0,
            ranges: vec![IndexRange {
                index_id: 20,
                left: vec![Value::String(name.into())],
                right: vec![Value::String(name.into())],
                left_field_cnt: 1,
                right_field_cnt: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(scan::read_rows(&mut state, &by_name("old")).unwrap().is_empty());
        assert_eq!(scan::read_rows(&mut state, &by_name("new")).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_only_index_skips_inserts() {
        let engine = KvEngine::new();
        // Index in DELETE_ONLY: inserts do not create entries.
        let (mut state, txn) = state_with_txn(&engine, IndexState::DeleteOnly, 1);
        let node = InsertNode {
            table_id: 1,
            records: vec![record(1, "a", 10)],
            need_presence_check: true,
        };
        execute_insert(&mut state, &node).unwrap();
        txn.lock().commit().unwrap();

        // Once PUBLIC, the scan finds no entry for the old row.
        let (mut state, _txn) = state_with_txn(&engine, IndexState::Public, 2);
        let scan = ScanNode {
            table_id: 1,
            tuple_id: 0,
            ranges: vec![IndexRange {
                index_id: 20,
                left: vec![Value::String("a".into())],
                right: vec![Value::String("a".into())],
                left_field_cnt: 1,
                right_field_cnt: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(scan::read_rows(&mut state, &scan).unwrap().is_empty());
    }

    #[test]
    fn test_limit_and_reverse_scan() {
        let engine = KvEngine::new();
        insert_rows(&engine, &[(1, "a", 1), (2, "b", 2), (3, "c", 3)]);
        let (mut state, _txn) = state_with_txn(&engine, IndexState::Public, 2);
        let scan = ScanNode {
            table_id: 1,
            tuple_id: 0,
            ranges: vec![full_region_range_for_test()],
            limit: Some(2),
            reverse: true,
            ..Default::default()
        };
        let rows = scan::read_rows(&mut state, &scan).unwrap();
        let ids: Vec<_> = rows.iter().map(|(_, r)| r.get_or_null(1)).collect();
        assert_eq!(ids, vec![Value::Int32(3), Value::Int32(2)]);
    }

    fn full_region_range_for_test() -> IndexRange {
        scan::full_region_range(1)
    }

    #[test]
    fn test_scan_respects_region_bounds() {
        let engine = KvEngine::new();
        insert_rows(&engine, &[(10, "a", 1), (20, "b", 2), (30, "c", 3)]);
        // Shrink the region to [enc(15), enc(25)): only id=20 remains visible.
        let (mut state, _txn) = state_with_txn(&engine, IndexState::Public, 2);
        let mut resource = (*state.resource).region_info.clone();
        resource.start_key = talon_storage::codec::encode_index_tuple(&[Value::Int32(15)]);
        resource.end_key = talon_storage::codec::encode_index_tuple(&[Value::Int32(25)]);
        let new_res = Arc::new(RegionResource {
            region_info: resource,
            table: state.resource.table.clone(),
            indexes: state.resource.indexes.clone(),
            reverse_indexes: HashMap::new(),
        });
        state.resource = new_res;
        let scan = ScanNode {
            table_id: 1,
            tuple_id: 0,
            ranges: vec![full_region_range_for_test()],
            ..Default::default()
        };
        let rows = scan::read_rows(&mut state, &scan).unwrap();
        let ids: Vec<_> = rows.iter().map(|(_, r)| r.get_or_null(1)).collect();
        assert_eq!(ids, vec![Value::Int32(20)]);
    }
}
