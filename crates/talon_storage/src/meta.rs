//! Durable per-region records in the meta column family.
//!
//! One record set per region, all under the region's 8-byte prefix so a
//! single range scan collects everything for snapshots and removal:
//!
//! - `region_info`           — the serialized descriptor
//! - `applied`               — `(applied_index, term)`
//! - `num_table_lines`       — authoritative row count
//! - `num_delete_lines`      — delete pressure since the last compaction
//! - `pre_commit(txn_id)`    — `(post_num_table_lines, applied_index)`
//!   between PREPARE apply and COMMIT apply
//! - `prepared(txn_id)`      — the replayable PREPARE request and its log
//!   index, for crash recovery
//! - `doing_snapshot`        — guards crash windows during snapshot ingest
//! - `ddl_info`              — in-progress online DDL state
//!
//! Every record that must be atomic with a data mutation is staged into the
//! same `KvTransaction` (or `WriteBatch`) as the mutation itself.

use serde::{Deserialize, Serialize};

use crate::kv::{Cf, KvEngine, KvSnapshot, KvTransaction, WriteBatch};
use talon_common::error::KvError;
use talon_common::schema::IndexState;
use talon_proto::{RegionInfo, StoreRequest};

const TAG_REGION_INFO: u8 = 0x01;
const TAG_APPLIED: u8 = 0x02;
const TAG_NUM_TABLE_LINES: u8 = 0x03;
const TAG_NUM_DELETE_LINES: u8 = 0x04;
const TAG_PRE_COMMIT: u8 = 0x05;
const TAG_PREPARED_TXN: u8 = 0x06;
const TAG_DOING_SNAPSHOT: u8 = 0x07;
const TAG_DDL_INFO: u8 = 0x08;

/// Commit-time metadata persisted between PREPARE apply and COMMIT apply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreCommitRecord {
    pub num_table_lines: i64,
    pub applied_index: u64,
}

/// A prepared-but-uncommitted transaction, replayable after restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedTxnRecord {
    pub txn_id: u64,
    pub log_index: u64,
    pub num_increase_rows: i64,
    /// The full PREPARE request (BEGIN + cached DMLs + prepare itself).
    pub request: StoreRequest,
}

/// Durable online-DDL progress for one region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlInfoRecord {
    pub table_id: u64,
    pub index_id: u64,
    pub state: IndexState,
}

fn meta_key(region_id: u64, tag: u8) -> Vec<u8> {
    let mut key = region_id.to_be_bytes().to_vec();
    key.push(tag);
    key
}

fn meta_key_txn(region_id: u64, tag: u8, txn_id: u64) -> Vec<u8> {
    let mut key = meta_key(region_id, tag);
    key.extend_from_slice(&txn_id.to_be_bytes());
    key
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, KvError> {
    bincode::deserialize(bytes).map_err(|e| KvError::Corruption(format!("meta record: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    // Meta records are plain-old-data; serialization cannot fail.
    bincode::serialize(value).unwrap_or_default()
}

/// Reader/writer over the meta column family. Cheap to clone.
#[derive(Clone)]
pub struct MetaWriter {
    engine: std::sync::Arc<KvEngine>,
}

impl MetaWriter {
    pub fn new(engine: std::sync::Arc<KvEngine>) -> Self {
        Self { engine }
    }

    // ── Direct (own-batch) writes ─────────────────────────────────────────

    pub fn init_region_info(&self, info: &RegionInfo) -> Result<(), KvError> {
        let mut batch = WriteBatch::new();
        batch.put(Cf::Meta, meta_key(info.region_id, TAG_REGION_INFO), encode(info));
        batch.put(Cf::Meta, meta_key(info.region_id, TAG_APPLIED), encode(&(0u64, 0u64)));
        batch.put(
            Cf::Meta,
            meta_key(info.region_id, TAG_NUM_TABLE_LINES),
            encode(&info.num_table_lines),
        );
        self.engine.write_batch(batch)
    }

    pub fn update_region_info(&self, info: &RegionInfo) -> Result<(), KvError> {
        let mut batch = WriteBatch::new();
        batch.put(Cf::Meta, meta_key(info.region_id, TAG_REGION_INFO), encode(info));
        self.engine.write_batch(batch)
    }

    /// Persist the pre-commit sentinel (leader side, before proposing COMMIT).
    pub fn write_pre_commit(
        &self,
        region_id: u64,
        txn_id: u64,
        record: PreCommitRecord,
    ) -> Result<(), KvError> {
        let mut batch = WriteBatch::new();
        batch.put(Cf::Meta, meta_key_txn(region_id, TAG_PRE_COMMIT, txn_id), encode(&record));
        self.engine.write_batch(batch)
    }

    /// Persist the replayable PREPARE request (applied on every replica).
    pub fn write_prepared_txn(
        &self,
        region_id: u64,
        record: &PreparedTxnRecord,
    ) -> Result<(), KvError> {
        let mut batch = WriteBatch::new();
        batch.put(
            Cf::Meta,
            meta_key_txn(region_id, TAG_PREPARED_TXN, record.txn_id),
            encode(record),
        );
        self.engine.write_batch(batch)
    }

    pub fn write_doing_snapshot(&self, region_id: u64) -> Result<(), KvError> {
        let mut batch = WriteBatch::new();
        batch.put(Cf::Meta, meta_key(region_id, TAG_DOING_SNAPSHOT), encode(&1u8));
        self.engine.write_batch(batch)
    }

    pub fn clear_doing_snapshot(&self, region_id: u64) -> Result<(), KvError> {
        let mut batch = WriteBatch::new();
        batch.delete(Cf::Meta, meta_key(region_id, TAG_DOING_SNAPSHOT));
        self.engine.write_batch(batch)
    }

    pub fn write_ddl_info(&self, region_id: u64, record: &DdlInfoRecord) -> Result<(), KvError> {
        let mut batch = WriteBatch::new();
        batch.put(Cf::Meta, meta_key(region_id, TAG_DDL_INFO), encode(record));
        self.engine.write_batch(batch)
    }

    pub fn clear_ddl_info(&self, region_id: u64) -> Result<(), KvError> {
        let mut batch = WriteBatch::new();
        batch.delete(Cf::Meta, meta_key(region_id, TAG_DDL_INFO));
        self.engine.write_batch(batch)
    }

    /// Remove the pre-commit sentinel outside any transaction.
    pub fn clear_pre_commit(&self, region_id: u64, txn_id: u64) -> Result<(), KvError> {
        let mut batch = WriteBatch::new();
        batch.delete(Cf::Meta, meta_key_txn(region_id, TAG_PRE_COMMIT, txn_id));
        self.engine.write_batch(batch)
    }

    /// Remove the prepared-txn record outside any transaction.
    pub fn clear_prepared_txn(&self, region_id: u64, txn_id: u64) -> Result<(), KvError> {
        let mut batch = WriteBatch::new();
        batch.delete(Cf::Meta, meta_key_txn(region_id, TAG_PREPARED_TXN, txn_id));
        self.engine.write_batch(batch)
    }

    /// Direct applied-index update for entries that carry no data mutation.
    pub fn update_applied_index(
        &self,
        region_id: u64,
        applied_index: u64,
        term: u64,
    ) -> Result<(), KvError> {
        let mut batch = WriteBatch::new();
        batch.put(Cf::Meta, meta_key(region_id, TAG_APPLIED), encode(&(applied_index, term)));
        self.engine.write_batch(batch)
    }

    /// Remove every meta record of a region (region removal).
    pub fn clear_region(&self, region_id: u64) {
        let start = region_id.to_be_bytes().to_vec();
        let end = (region_id + 1).to_be_bytes().to_vec();
        self.engine.delete_range(Cf::Meta, &start, Some(&end));
    }

    // ── Transaction-staged writes (atomic with data mutations) ────────────

    pub fn stage_applied_index(
        &self,
        txn: &mut KvTransaction,
        region_id: u64,
        applied_index: u64,
        term: u64,
    ) {
        txn.put(Cf::Meta, meta_key(region_id, TAG_APPLIED), encode(&(applied_index, term)));
    }

    pub fn stage_num_table_lines(&self, txn: &mut KvTransaction, region_id: u64, lines: i64) {
        txn.put(Cf::Meta, meta_key(region_id, TAG_NUM_TABLE_LINES), encode(&lines));
    }

    pub fn stage_num_delete_lines(&self, txn: &mut KvTransaction, region_id: u64, lines: i64) {
        txn.put(Cf::Meta, meta_key(region_id, TAG_NUM_DELETE_LINES), encode(&lines));
    }

    pub fn stage_region_info(&self, txn: &mut KvTransaction, info: &RegionInfo) {
        txn.put(Cf::Meta, meta_key(info.region_id, TAG_REGION_INFO), encode(info));
    }

    pub fn stage_clear_pre_commit(&self, txn: &mut KvTransaction, region_id: u64, txn_id: u64) {
        txn.delete(Cf::Meta, meta_key_txn(region_id, TAG_PRE_COMMIT, txn_id));
    }

    pub fn stage_clear_prepared_txn(&self, txn: &mut KvTransaction, region_id: u64, txn_id: u64) {
        txn.delete(Cf::Meta, meta_key_txn(region_id, TAG_PREPARED_TXN, txn_id));
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    pub fn read_region_info(&self, region_id: u64) -> Result<Option<RegionInfo>, KvError> {
        self.engine
            .get(Cf::Meta, &meta_key(region_id, TAG_REGION_INFO))
            .map(|b| decode(&b))
            .transpose()
    }

    pub fn read_applied_index(&self, region_id: u64) -> Result<(u64, u64), KvError> {
        match self.engine.get(Cf::Meta, &meta_key(region_id, TAG_APPLIED)) {
            Some(bytes) => decode(&bytes),
            None => Ok((0, 0)),
        }
    }

    pub fn read_num_table_lines(&self, region_id: u64) -> Result<i64, KvError> {
        match self.engine.get(Cf::Meta, &meta_key(region_id, TAG_NUM_TABLE_LINES)) {
            Some(bytes) => decode(&bytes),
            None => Ok(0),
        }
    }

    pub fn read_num_delete_lines(&self, region_id: u64) -> Result<i64, KvError> {
        match self.engine.get(Cf::Meta, &meta_key(region_id, TAG_NUM_DELETE_LINES)) {
            Some(bytes) => decode(&bytes),
            None => Ok(0),
        }
    }

    pub fn read_pre_commit(
        &self,
        region_id: u64,
        txn_id: u64,
    ) -> Result<Option<PreCommitRecord>, KvError> {
        self.engine
            .get(Cf::Meta, &meta_key_txn(region_id, TAG_PRE_COMMIT, txn_id))
            .map(|b| decode(&b))
            .transpose()
    }

    pub fn read_doing_snapshot(&self, region_id: u64) -> bool {
        self.engine.get(Cf::Meta, &meta_key(region_id, TAG_DOING_SNAPSHOT)).is_some()
    }

    pub fn read_ddl_info(&self, region_id: u64) -> Result<Option<DdlInfoRecord>, KvError> {
        self.engine
            .get(Cf::Meta, &meta_key(region_id, TAG_DDL_INFO))
            .map(|b| decode(&b))
            .transpose()
    }

    /// All prepared-txn records of a region, ordered by txn id.
    pub fn scan_prepared_txns(&self, region_id: u64) -> Result<Vec<PreparedTxnRecord>, KvError> {
        let start = meta_key(region_id, TAG_PREPARED_TXN);
        let mut end = meta_key(region_id, TAG_PREPARED_TXN);
        if let Some(last) = end.last_mut() {
            *last += 1;
        }
        let snap = self.engine.snapshot();
        snap.scan(Cf::Meta, &start, Some(&end))
            .into_iter()
            .map(|(_, v)| decode(&v))
            .collect()
    }

    /// Every meta record of a region, for the meta snapshot file.
    pub fn region_meta_entries(
        &self,
        snapshot: &KvSnapshot,
        region_id: u64,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let start = region_id.to_be_bytes().to_vec();
        let end = (region_id + 1).to_be_bytes().to_vec();
        snapshot.scan(Cf::Meta, &start, Some(&end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talon_proto::OpType;

    fn writer() -> MetaWriter {
        MetaWriter::new(KvEngine::new())
    }

    #[test]
    fn test_region_info_round_trip() {
        let meta = writer();
        let info = RegionInfo {
            region_id: 5,
            table_id: 2,
            version: 3,
            start_key: vec![1],
            end_key: vec![9],
            num_table_lines: 44,
            ..Default::default()
        };
        meta.init_region_info(&info).unwrap();
        let back = meta.read_region_info(5).unwrap().unwrap();
        assert_eq!(back.version, 3);
        assert_eq!(back.start_key, vec![1]);
        assert_eq!(meta.read_num_table_lines(5).unwrap(), 44);
        assert!(meta.read_region_info(6).unwrap().is_none());
    }

    #[test]
    fn test_pre_commit_sentinel_lifecycle() {
        let meta = writer();
        let rec = PreCommitRecord { num_table_lines: 10, applied_index: 7 };
        meta.write_pre_commit(1, 99, rec).unwrap();
        assert_eq!(meta.read_pre_commit(1, 99).unwrap(), Some(rec));
        // Cleared atomically with a staged transaction.
        let engine = meta.engine.clone();
        let mut txn = engine.begin(engine.internal_txn_id());
        meta.stage_clear_pre_commit(&mut txn, 1, 99);
        txn.commit().unwrap();
        assert_eq!(meta.read_pre_commit(1, 99).unwrap(), None);
    }

    #[test]
    fn test_prepared_txn_scan_is_region_scoped() {
        let meta = writer();
        for (region, txn) in [(1u64, 10u64), (1, 11), (2, 12)] {
            meta.write_prepared_txn(
                region,
                &PreparedTxnRecord {
                    txn_id: txn,
                    log_index: 5,
                    num_increase_rows: 1,
                    request: StoreRequest { op_type: OpType::Prepare, ..Default::default() },
                },
            )
            .unwrap();
        }
        let recs = meta.scan_prepared_txns(1).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].txn_id, 10);
        assert_eq!(recs[1].txn_id, 11);
    }

    #[test]
    fn test_staged_meta_commits_with_data() {
        let meta = writer();
        let engine = meta.engine.clone();
        let mut txn = engine.begin(engine.internal_txn_id());
        txn.put(Cf::Data, b"row".to_vec(), b"v".to_vec());
        meta.stage_applied_index(&mut txn, 3, 17, 2);
        meta.stage_num_table_lines(&mut txn, 3, 1);
        // Nothing visible before commit.
        assert_eq!(meta.read_applied_index(3).unwrap(), (0, 0));
        txn.commit().unwrap();
        assert_eq!(meta.read_applied_index(3).unwrap(), (17, 2));
        assert_eq!(meta.read_num_table_lines(3).unwrap(), 1);
        assert_eq!(engine.get(Cf::Data, b"row"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_clear_region_removes_all_records() {
        let meta = writer();
        let info = RegionInfo { region_id: 8, ..Default::default() };
        meta.init_region_info(&info).unwrap();
        meta.write_doing_snapshot(8).unwrap();
        meta.clear_region(8);
        assert!(meta.read_region_info(8).unwrap().is_none());
        assert!(!meta.read_doing_snapshot(8));
    }

    #[test]
    fn test_ddl_info_round_trip() {
        let meta = writer();
        let rec = DdlInfoRecord { table_id: 1, index_id: 20, state: IndexState::WriteLocal };
        meta.write_ddl_info(4, &rec).unwrap();
        let back = meta.read_ddl_info(4).unwrap().unwrap();
        assert_eq!(back.state, IndexState::WriteLocal);
        meta.clear_ddl_info(4).unwrap();
        assert!(meta.read_ddl_info(4).unwrap().is_none());
    }
}
