//! One multi-statement transaction bound to a region.
//!
//! Wraps a KV transaction and adds the 2PC bookkeeping: the per-seq command
//! cache used for replica replay and split handover, savepoints for
//! rollback-to-seq, and the row-count delta that feeds `num_table_lines`
//! at commit.
//!
//! Index maintenance helpers (`put_primary`, `put_secondary`, `remove`)
//! enforce the region-range invariant: a key only lands in this region when
//! its routing tuple fits `[start_key, end_key)`.

use std::collections::BTreeMap;
use std::sync::Arc;

use talon_common::error::{KvError, TxnError};
use talon_common::schema::{IndexInfo, IndexType, TableInfo};
use talon_common::types::TxnId;
use talon_common::value::Value;
use talon_proto::{CachePlan, Record, RegionInfo};
use talon_storage::codec;
use talon_storage::kv::{Cf, KvEngine, KvTransaction, TxnIter};

pub type TxnResult<T> = Result<T, TxnError>;

struct SavePoint {
    seq_id: u32,
    kv_mark: usize,
    num_increase_rows: i64,
    dml_num_affected_rows: i64,
}

pub struct Transaction {
    txn_id: TxnId,
    region_id: u64,
    seq_id: u32,
    kv: Option<KvTransaction>,
    cache_plans: BTreeMap<u32, CachePlan>,
    save_points: Vec<SavePoint>,
    /// Row-count delta of this txn, folded into `num_table_lines` at commit.
    pub num_increase_rows: i64,
    pub dml_num_affected_rows: i64,
    /// Set once the PREPARE entry applied; cleared at commit/rollback.
    pub is_prepared: bool,
    /// Log index of the applied PREPARE entry.
    pub prepared_index: u64,
    finished: bool,
}

impl Transaction {
    pub fn begin(engine: &Arc<KvEngine>, txn_id: TxnId, region_id: u64) -> Self {
        Self {
            txn_id,
            region_id,
            seq_id: 0,
            kv: Some(engine.begin(txn_id)),
            cache_plans: BTreeMap::new(),
            save_points: Vec::new(),
            num_increase_rows: 0,
            dml_num_affected_rows: 0,
            is_prepared: false,
            prepared_index: 0,
            finished: false,
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    pub fn seq_id(&self) -> u32 {
        self.seq_id
    }

    pub fn set_seq_id(&mut self, seq_id: u32) {
        self.seq_id = seq_id;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn kv(&self) -> TxnResult<&KvTransaction> {
        self.kv.as_ref().ok_or(TxnError::Kv(KvError::TxnFinished))
    }

    fn kv_mut(&mut self) -> TxnResult<&mut KvTransaction> {
        self.kv.as_mut().ok_or(TxnError::Kv(KvError::TxnFinished))
    }

    // ── Command cache & savepoints ────────────────────────────────────────

    /// Cache the command for `seq_id` so replicas (and split children) can
    /// replay it.
    pub fn push_cmd_to_cache(&mut self, plan: CachePlan) {
        self.seq_id = self.seq_id.max(plan.seq_id);
        self.cache_plans.insert(plan.seq_id, plan);
    }

    pub fn cache_plans(&self) -> Vec<CachePlan> {
        self.cache_plans.values().cloned().collect()
    }

    pub fn has_cached_seq(&self, seq_id: u32) -> bool {
        self.cache_plans.contains_key(&seq_id)
    }

    /// Record a savepoint at the start of command `seq_id`.
    pub fn set_save_point(&mut self, seq_id: u32) -> TxnResult<()> {
        let kv_mark = self.kv()?.mark();
        self.save_points.push(SavePoint {
            seq_id,
            kv_mark,
            num_increase_rows: self.num_increase_rows,
            dml_num_affected_rows: self.dml_num_affected_rows,
        });
        Ok(())
    }

    /// Undo every effect of commands with seq ≥ `seq_id` and drop them from
    /// the command cache, so replicas replaying the cache never see them.
    /// A seq this transaction never executed is a no-op.
    pub fn rollback_to_seq(&mut self, seq_id: u32) -> TxnResult<()> {
        let Some(idx) = self.save_points.iter().position(|sp| sp.seq_id == seq_id) else {
            return Ok(());
        };
        let sp = &self.save_points[idx];
        let (mark, rows, affected) =
            (sp.kv_mark, sp.num_increase_rows, sp.dml_num_affected_rows);
        self.kv_mut()?.rollback_to_mark(mark);
        self.num_increase_rows = rows;
        self.dml_num_affected_rows = affected;
        self.save_points.truncate(idx);
        self.cache_plans.retain(|seq, _| *seq < seq_id);
        self.seq_id = seq_id.saturating_sub(1).max(1);
        Ok(())
    }

    // ── Raw KV access (inverted index, kv-batch apply) ────────────────────

    pub fn put_kv(&mut self, key: Vec<u8>, value: Vec<u8>) -> TxnResult<()> {
        self.kv_mut()?.put(Cf::Data, key, value);
        Ok(())
    }

    pub fn delete_kv(&mut self, key: Vec<u8>) -> TxnResult<()> {
        self.kv_mut()?.delete(Cf::Data, key);
        Ok(())
    }

    pub fn get_kv(&self, key: &[u8]) -> TxnResult<Option<Vec<u8>>> {
        Ok(self.kv()?.get(Cf::Data, key))
    }

    pub fn put_meta(&mut self, key: Vec<u8>, value: Vec<u8>) -> TxnResult<()> {
        self.kv_mut()?.put(Cf::Meta, key, value);
        Ok(())
    }

    pub fn delete_meta(&mut self, key: Vec<u8>) -> TxnResult<()> {
        self.kv_mut()?.delete(Cf::Meta, key);
        Ok(())
    }

    pub fn iter(&self, lower: Vec<u8>, upper: Option<Vec<u8>>) -> TxnResult<TxnIter> {
        Ok(self.kv()?.iter(lower, upper))
    }

    pub fn iter_reverse(&self, lower: Vec<u8>, upper: Option<Vec<u8>>) -> TxnResult<TxnIter> {
        Ok(self.kv()?.iter_reverse(lower, upper))
    }

    /// Expose the KV transaction for meta staging at commit time.
    pub fn kv_txn_mut(&mut self) -> TxnResult<&mut KvTransaction> {
        self.kv_mut()
    }

    // ── Row/index maintenance ─────────────────────────────────────────────

    /// Encode the routing tuple of `record` under `index`.
    pub fn encode_tuple(index: &IndexInfo, record: &Record) -> Vec<u8> {
        let values: Vec<Value> =
            index.fields.iter().map(|f| record.get_or_null(f.0)).collect();
        codec::encode_index_tuple(&values)
    }

    fn check_fit(&self, region: &RegionInfo, tuple: &[u8]) -> TxnResult<()> {
        if codec::fits_range(&region.start_key, &region.end_key, tuple) {
            Ok(())
        } else {
            Err(TxnError::OutOfRegionRange)
        }
    }

    /// Insert or overwrite the primary row. With `check_exist`, an existing
    /// row under the same key is a duplicate-key error (taking the row lock
    /// either way).
    pub fn put_primary(
        &mut self,
        region: &RegionInfo,
        table: &TableInfo,
        pk_index: &IndexInfo,
        record: &Record,
        check_exist: bool,
    ) -> TxnResult<Vec<u8>> {
        let pk_tuple = Self::encode_tuple(pk_index, record);
        self.check_fit(region, &pk_tuple)?;
        let key = codec::data_key(region.region_id, pk_index.id.0, &pk_tuple);
        let existing = self.kv_mut()?.get_for_update(&key).map_err(TxnError::Kv)?;
        if check_exist && existing.is_some() {
            return Err(TxnError::DupPrimaryKey { txn_id: self.txn_id });
        }
        let value = bincode::serialize(record)
            .map_err(|e| TxnError::Kv(KvError::Corruption(format!("encode record: {e}"))))?;
        self.kv_mut()?.put(Cf::Data, key, value);
        if table.columnar {
            self.put_primary_columns(region, table, pk_index, record, &pk_tuple)?;
        }
        Ok(pk_tuple)
    }

    /// Column-store mirror: one KV per non-PK field.
    fn put_primary_columns(
        &mut self,
        region: &RegionInfo,
        table: &TableInfo,
        pk_index: &IndexInfo,
        record: &Record,
        pk_tuple: &[u8],
    ) -> TxnResult<()> {
        for field in &table.fields {
            if pk_index.fields.contains(&field.id) {
                continue;
            }
            let Some(value) = record.get(field.id.0) else {
                continue;
            };
            let key =
                codec::column_key(region.region_id, table.id.0 as u32, field.id.0, pk_tuple);
            let bytes = bincode::serialize(value)
                .map_err(|e| TxnError::Kv(KvError::Corruption(format!("encode column: {e}"))))?;
            self.kv_mut()?.put(Cf::Data, key, bytes);
        }
        Ok(())
    }

    /// Write one secondary-index entry for an already-fitted row.
    /// UNIQUE indexes reject a conflicting entry that points at another row.
    pub fn put_secondary(
        &mut self,
        region_id: u64,
        index: &IndexInfo,
        record: &Record,
        pk_tuple: &[u8],
    ) -> TxnResult<()> {
        let sec_tuple = Self::encode_tuple(index, record);
        match index.index_type {
            IndexType::Unique => {
                let key = codec::data_key(region_id, index.id.0, &sec_tuple);
                if let Some(existing) = self.kv_mut()?.get_for_update(&key).map_err(TxnError::Kv)? {
                    if existing != pk_tuple {
                        return Err(TxnError::UniqueConflict {
                            txn_id: self.txn_id,
                            index_id: index.id,
                        });
                    }
                }
                self.kv_mut()?.put(Cf::Data, key, pk_tuple.to_vec());
            }
            _ => {
                // Non-unique: the pk participates in the key to keep entries
                // distinct; the value repeats it for decode-free lookups.
                let mut tuple = sec_tuple;
                tuple.extend_from_slice(pk_tuple);
                let key = codec::data_key(region_id, index.id.0, &tuple);
                self.kv_mut()?.put(Cf::Data, key, pk_tuple.to_vec());
            }
        }
        Ok(())
    }

    pub fn delete_secondary(
        &mut self,
        region_id: u64,
        index: &IndexInfo,
        record: &Record,
        pk_tuple: &[u8],
    ) -> TxnResult<()> {
        let sec_tuple = Self::encode_tuple(index, record);
        let key = match index.index_type {
            IndexType::Unique => codec::data_key(region_id, index.id.0, &sec_tuple),
            _ => {
                let mut tuple = sec_tuple;
                tuple.extend_from_slice(pk_tuple);
                codec::data_key(region_id, index.id.0, &tuple)
            }
        };
        self.kv_mut()?.delete(Cf::Data, key);
        Ok(())
    }

    /// Lock and read the primary row for an update/delete.
    pub fn get_update_primary(
        &mut self,
        region: &RegionInfo,
        pk_index: &IndexInfo,
        pk_tuple: &[u8],
    ) -> TxnResult<Option<Record>> {
        self.check_fit(region, pk_tuple)?;
        let key = codec::data_key(region.region_id, pk_index.id.0, pk_tuple);
        let Some(bytes) = self.kv_mut()?.get_for_update(&key).map_err(TxnError::Kv)? else {
            return Ok(None);
        };
        let record = bincode::deserialize(&bytes)
            .map_err(|e| TxnError::Kv(KvError::Corruption(format!("decode record: {e}"))))?;
        Ok(Some(record))
    }

    /// Remove the primary row and its column mirror.
    pub fn remove_primary(
        &mut self,
        region: &RegionInfo,
        table: &TableInfo,
        pk_index: &IndexInfo,
        pk_tuple: &[u8],
    ) -> TxnResult<()> {
        let key = codec::data_key(region.region_id, pk_index.id.0, pk_tuple);
        self.kv_mut()?.delete(Cf::Data, key);
        if table.columnar {
            for field in &table.fields {
                if pk_index.fields.contains(&field.id) {
                    continue;
                }
                let ckey =
                    codec::column_key(region.region_id, table.id.0 as u32, field.id.0, pk_tuple);
                self.kv_mut()?.delete(Cf::Data, ckey);
            }
        }
        Ok(())
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    pub fn commit(&mut self) -> TxnResult<()> {
        let kv = self.kv.take().ok_or(TxnError::Kv(KvError::TxnFinished))?;
        kv.commit().map_err(TxnError::Kv)?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(&mut self) {
        if let Some(kv) = self.kv.take() {
            kv.rollback();
        }
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talon_common::schema::{FieldInfo, IndexState, SegmentType};
    use talon_common::types::{FieldId, IndexId, TableId};
    use talon_common::value::ValueType;

    fn table() -> TableInfo {
        TableInfo {
            id: TableId(1),
            name: "t".into(),
            fields: vec![
                FieldInfo { id: FieldId(1), name: "id".into(), field_type: ValueType::Int32, can_null: false },
                FieldInfo { id: FieldId(2), name: "name".into(), field_type: ValueType::String, can_null: true },
            ],
            indexes: vec![IndexId(1), IndexId(20)],
            columnar: false,
            partition_num: 1,
        }
    }

    fn pk_index() -> IndexInfo {
        IndexInfo {
            id: IndexId(1),
            table_id: TableId(1),
            index_type: IndexType::Primary,
            state: IndexState::Public,
            fields: vec![FieldId(1)],
            segment_type: SegmentType::NoSegment,
        }
    }

    fn uniq_index() -> IndexInfo {
        IndexInfo {
            id: IndexId(20),
            table_id: TableId(1),
            index_type: IndexType::Unique,
            state: IndexState::Public,
            fields: vec![FieldId(2)],
            segment_type: SegmentType::NoSegment,
        }
    }

    fn region() -> RegionInfo {
        RegionInfo { region_id: 7, table_id: 1, index_id: 1, version: 1, ..Default::default() }
    }

    fn record(id: i32, name: &str) -> Record {
        let mut r = Record::new();
        r.set(1, Value::Int32(id));
        r.set(2, Value::String(name.into()));
        r
    }

    #[test]
    fn test_put_primary_duplicate_detection() {
        let engine = KvEngine::new();
        let mut txn = Transaction::begin(&engine, TxnId(1), 7);
        txn.put_primary(&region(), &table(), &pk_index(), &record(1, "a"), true).unwrap();
        let err = txn
            .put_primary(&region(), &table(), &pk_index(), &record(1, "b"), true)
            .unwrap_err();
        assert!(matches!(err, TxnError::DupPrimaryKey { .. }));
        // Overwrite without presence check succeeds.
        txn.put_primary(&region(), &table(), &pk_index(), &record(1, "b"), false).unwrap();
    }

    #[test]
    fn test_region_fit_enforced() {
        let engine = KvEngine::new();
        let mut txn = Transaction::begin(&engine, TxnId(1), 7);
        let mut narrow = region();
        narrow.start_key = codec::encode_index_tuple(&[Value::Int32(100)]);
        let err = txn
            .put_primary(&narrow, &table(), &pk_index(), &record(1, "a"), true)
            .unwrap_err();
        assert!(matches!(err, TxnError::OutOfRegionRange));
        assert!(txn
            .put_primary(&narrow, &table(), &pk_index(), &record(150, "a"), true)
            .is_ok());
    }

    #[test]
    fn test_unique_secondary_conflict() {
        let engine = KvEngine::new();
        let mut txn = Transaction::begin(&engine, TxnId(1), 7);
        let pk1 = txn.put_primary(&region(), &table(), &pk_index(), &record(1, "a"), true).unwrap();
        txn.put_secondary(7, &uniq_index(), &record(1, "a"), &pk1).unwrap();
        let pk2 = txn.put_primary(&region(), &table(), &pk_index(), &record(2, "a"), true).unwrap();
        let err = txn.put_secondary(7, &uniq_index(), &record(2, "a"), &pk2).unwrap_err();
        assert!(matches!(err, TxnError::UniqueConflict { .. }));
    }

    #[test]
    fn test_savepoint_rollback_undoes_seq() {
        let engine = KvEngine::new();
        let mut txn = Transaction::begin(&engine, TxnId(1), 7);
        txn.set_save_point(2).unwrap();
        let pk = txn.put_primary(&region(), &table(), &pk_index(), &record(5, "x"), true).unwrap();
        txn.num_increase_rows += 1;
        txn.set_save_point(3).unwrap();
        txn.put_primary(&region(), &table(), &pk_index(), &record(6, "y"), true).unwrap();
        txn.num_increase_rows += 1;
        txn.rollback_to_seq(3).unwrap();
        assert_eq!(txn.num_increase_rows, 1);
        txn.commit().unwrap();
        let key5 = codec::data_key(7, 1, &pk);
        assert!(engine.get(Cf::Data, &key5).is_some());
        let pk6 = codec::encode_index_tuple(&[Value::Int32(6)]);
        let key6 = codec::data_key(7, 1, &pk6);
        assert!(engine.get(Cf::Data, &key6).is_none());
    }

    #[test]
    fn test_get_update_primary_round_trip() {
        let engine = KvEngine::new();
        let mut txn = Transaction::begin(&engine, TxnId(1), 7);
        let pk = txn.put_primary(&region(), &table(), &pk_index(), &record(9, "z"), true).unwrap();
        let row = txn.get_update_primary(&region(), &pk_index(), &pk).unwrap().unwrap();
        assert_eq!(row.get(2), Some(&Value::String("z".into())));
        txn.remove_primary(&region(), &table(), &pk_index(), &pk).unwrap();
        assert!(txn.get_update_primary(&region(), &pk_index(), &pk).unwrap().is_none());
    }

    #[test]
    fn test_columnar_mirror_written_and_removed() {
        let engine = KvEngine::new();
        let mut columnar = table();
        columnar.columnar = true;
        let mut txn = Transaction::begin(&engine, TxnId(1), 7);
        let pk = txn.put_primary(&region(), &columnar, &pk_index(), &record(1, "a"), true).unwrap();
        txn.commit().unwrap();
        let ckey = codec::column_key(7, 1, 2, &pk);
        assert!(engine.get(Cf::Data, &ckey).is_some());

        let mut txn = Transaction::begin(&engine, TxnId(2), 7);
        txn.remove_primary(&region(), &columnar, &pk_index(), &pk).unwrap();
        txn.commit().unwrap();
        assert!(engine.get(Cf::Data, &ckey).is_none());
    }

    #[test]
    fn test_cache_plan_tracking() {
        let engine = KvEngine::new();
        let mut txn = Transaction::begin(&engine, TxnId(1), 7);
        txn.push_cmd_to_cache(CachePlan {
            op_type: talon_proto::OpType::Begin,
            seq_id: 1,
            plan: Default::default(),
            tuples: vec![],
        });
        txn.push_cmd_to_cache(CachePlan {
            op_type: talon_proto::OpType::Insert,
            seq_id: 2,
            plan: Default::default(),
            tuples: vec![],
        });
        assert_eq!(txn.seq_id(), 2);
        assert!(txn.has_cached_seq(1));
        assert_eq!(txn.cache_plans().len(), 2);
    }
}
