//! Shared cluster fixture: N in-process stores joined through one directory,
//! a test table with primary, secondary, and fulltext indexes, and request
//! builders for the store RPC surface.
#![allow(dead_code)]

use std::sync::Arc;

use talon_common::config::RegionConfig;
use talon_common::schema::{
    FieldInfo, IndexInfo, IndexState, IndexType, SchemaFactory, SegmentType, TableInfo,
};
use talon_common::types::{FieldId, IndexId, TableId};
use talon_common::value::{Value, ValueType};
use talon_proto::plan::{InsertNode, ScanNode};
use talon_proto::{
    Expr, IndexRange, OpType, Plan, PlanNode, Record, RegionInfo, SlotDescriptor, StoreRequest,
    StoreResponse, TransactionInfo, TupleDescriptor,
};
use talon_raft::RaftGroup;
use talon_store::{Store, StoreDirectory};
use talon_storage::codec;

pub const TABLE_ID: u64 = 1;
pub const PK_INDEX: u64 = 1;
pub const NAME_INDEX: u64 = 20;
pub const FT_INDEX: u64 = 30;

pub const ID_FIELD: u32 = 1;
pub const NAME_FIELD: u32 = 2;
pub const SCORE_FIELD: u32 = 3;

pub fn test_config() -> RegionConfig {
    RegionConfig {
        // Snapshots and splits are driven explicitly by the tests.
        snapshot_interval_s: 3_600,
        split_duration_ms: 60_000,
        reverse_level2_len: 100,
        reverse_cached_list_len: 8,
        disable_write_wait_ms: 200,
        real_writing_wait_ms: 200,
        ..Default::default()
    }
}

pub fn install_schema(schema: &SchemaFactory) {
    schema.update_table(TableInfo {
        id: TableId(TABLE_ID),
        name: "t_user".into(),
        fields: vec![
            FieldInfo {
                id: FieldId(ID_FIELD),
                name: "id".into(),
                field_type: ValueType::Int32,
                can_null: false,
            },
            FieldInfo {
                id: FieldId(NAME_FIELD),
                name: "name".into(),
                field_type: ValueType::String,
                can_null: true,
            },
            FieldInfo {
                id: FieldId(SCORE_FIELD),
                name: "score".into(),
                field_type: ValueType::Int64,
                can_null: true,
            },
        ],
        indexes: vec![IndexId(PK_INDEX), IndexId(NAME_INDEX), IndexId(FT_INDEX)],
        columnar: false,
        partition_num: 1,
    });
    schema.update_index(IndexInfo {
        id: IndexId(PK_INDEX),
        table_id: TableId(TABLE_ID),
        index_type: IndexType::Primary,
        state: IndexState::Public,
        fields: vec![FieldId(ID_FIELD)],
        segment_type: SegmentType::NoSegment,
    });
    schema.update_index(IndexInfo {
        id: IndexId(NAME_INDEX),
        table_id: TableId(TABLE_ID),
        index_type: IndexType::Key,
        state: IndexState::Public,
        fields: vec![FieldId(NAME_FIELD)],
        segment_type: SegmentType::NoSegment,
    });
    schema.update_index(IndexInfo {
        id: IndexId(FT_INDEX),
        table_id: TableId(TABLE_ID),
        index_type: IndexType::Fulltext,
        state: IndexState::Public,
        fields: vec![FieldId(NAME_FIELD)],
        segment_type: SegmentType::Words,
    });
}

pub struct Cluster {
    pub directory: Arc<StoreDirectory>,
    pub stores: Vec<Arc<Store>>,
    pub schema: Arc<SchemaFactory>,
    pub config: Arc<RegionConfig>,
    _tmp: tempfile::TempDir,
}

impl Cluster {
    pub fn new(store_count: usize) -> Self {
        Self::with_config(store_count, test_config())
    }

    pub fn with_config(store_count: usize, config: RegionConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let schema = SchemaFactory::new();
        install_schema(&schema);
        let config = Arc::new(config);
        let directory = StoreDirectory::new();
        let tmp = tempfile::tempdir().expect("tempdir");
        let stores: Vec<Arc<Store>> = (0..store_count)
            .map(|i| {
                Store::new(
                    format!("store-{i}"),
                    schema.clone(),
                    config.clone(),
                    directory.clone(),
                    tmp.path().join(format!("s{i}")),
                )
            })
            .collect();
        Cluster { directory, stores, schema, config, _tmp: tmp }
    }

    pub fn peer_addrs(&self) -> Vec<String> {
        self.stores.iter().map(|s| s.address().to_string()).collect()
    }

    /// Create a region replicated on every store; the first store leads.
    pub fn create_region(&self, region_id: u64, start_key: Vec<u8>, end_key: Vec<u8>) {
        let group = RaftGroup::new(region_id);
        self.directory.raft().register(group.clone());
        let info = RegionInfo {
            region_id,
            table_id: TABLE_ID,
            index_id: PK_INDEX,
            version: 1,
            start_key,
            end_key,
            peers: self.peer_addrs(),
            ..Default::default()
        };
        for store in &self.stores {
            store.create_region(info.clone(), &group, true).expect("create region");
        }
    }

    pub fn send(&self, request: StoreRequest) -> StoreResponse {
        self.directory.send(request.region_id, request)
    }

    pub fn leader_region(&self, region_id: u64) -> Arc<talon_store::Region> {
        let group = self.directory.raft().get(region_id).expect("group");
        let leader = group.leader_address().expect("leader");
        let store =
            self.stores.iter().find(|s| s.address() == leader).expect("leader store");
        store.region(region_id).expect("leader region")
    }

    pub fn region_version(&self, region_id: u64) -> u64 {
        self.leader_region(region_id).version()
    }

    // ── Request builders ──────────────────────────────────────────────────

    pub fn record(id: i32, name: &str, score: i64) -> Record {
        let mut r = Record::new();
        r.set(ID_FIELD, Value::Int32(id));
        r.set(NAME_FIELD, Value::String(name.into()));
        r.set(SCORE_FIELD, Value::Int64(score));
        r
    }

    pub fn output_tuple() -> TupleDescriptor {
        TupleDescriptor {
            tuple_id: 0,
            slots: vec![
                SlotDescriptor { slot_id: 1, field_id: ID_FIELD, value_type: ValueType::Int32 },
                SlotDescriptor {
                    slot_id: 2,
                    field_id: NAME_FIELD,
                    value_type: ValueType::String,
                },
            ],
        }
    }

    fn insert_plan(rows: Vec<Record>) -> Plan {
        Plan {
            root: PlanNode::Insert(InsertNode {
                table_id: TABLE_ID,
                records: rows,
                need_presence_check: true,
            }),
        }
    }

    pub fn autocommit_insert(
        &self,
        region_id: u64,
        version: u64,
        txn_id: u64,
        rows: Vec<Record>,
    ) -> StoreResponse {
        self.send(StoreRequest {
            op_type: OpType::Insert,
            region_id,
            region_version: version,
            plan: Some(Self::insert_plan(rows)),
            txn_infos: vec![TransactionInfo {
                txn_id,
                seq_id: 1,
                autocommit: true,
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    pub fn begin(&self, region_id: u64, version: u64, txn_id: u64) -> StoreResponse {
        self.send(StoreRequest {
            op_type: OpType::Begin,
            region_id,
            region_version: version,
            txn_infos: vec![TransactionInfo { txn_id, seq_id: 1, ..Default::default() }],
            ..Default::default()
        })
    }

    pub fn txn_insert(
        &self,
        region_id: u64,
        version: u64,
        txn_id: u64,
        seq_id: u32,
        rows: Vec<Record>,
    ) -> StoreResponse {
        self.send(StoreRequest {
            op_type: OpType::Insert,
            region_id,
            region_version: version,
            plan: Some(Self::insert_plan(rows)),
            txn_infos: vec![TransactionInfo { txn_id, seq_id, ..Default::default() }],
            ..Default::default()
        })
    }

    pub fn prepare(
        &self,
        region_id: u64,
        version: u64,
        txn_id: u64,
        need_rollback_seq: Vec<u32>,
    ) -> StoreResponse {
        self.send(StoreRequest {
            op_type: OpType::Prepare,
            region_id,
            region_version: version,
            txn_infos: vec![TransactionInfo {
                txn_id,
                start_seq_id: 1,
                need_rollback_seq,
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    pub fn commit(&self, region_id: u64, version: u64, txn_id: u64) -> StoreResponse {
        self.send(StoreRequest {
            op_type: OpType::Commit,
            region_id,
            region_version: version,
            txn_infos: vec![TransactionInfo { txn_id, ..Default::default() }],
            ..Default::default()
        })
    }

    pub fn rollback(&self, region_id: u64, version: u64, txn_id: u64) -> StoreResponse {
        self.send(StoreRequest {
            op_type: OpType::Rollback,
            region_id,
            region_version: version,
            txn_infos: vec![TransactionInfo { txn_id, ..Default::default() }],
            ..Default::default()
        })
    }

    pub fn pk_scan_range() -> IndexRange {
        IndexRange { index_id: PK_INDEX, ..Default::default() }
    }

    pub fn pk_bounds(left: i32, right: i32, right_open: bool) -> IndexRange {
        IndexRange {
            index_id: PK_INDEX,
            left: vec![Value::Int32(left)],
            right: vec![Value::Int32(right)],
            left_field_cnt: 1,
            right_field_cnt: 1,
            right_open,
            ..Default::default()
        }
    }

    pub fn select(
        &self,
        region_id: u64,
        version: u64,
        ranges: Vec<IndexRange>,
        conjuncts: Vec<Expr>,
    ) -> StoreResponse {
        self.send(StoreRequest {
            op_type: OpType::Select,
            region_id,
            region_version: version,
            plan: Some(Plan {
                root: PlanNode::Scan(ScanNode {
                    table_id: TABLE_ID,
                    tuple_id: 0,
                    ranges,
                    conjuncts,
                    ..Default::default()
                }),
            }),
            tuples: vec![Self::output_tuple()],
            ..Default::default()
        })
    }

    /// All row ids visible in the region, in key order.
    pub fn select_ids(&self, region_id: u64, version: u64) -> Vec<i32> {
        let resp = self.select(region_id, version, vec![Self::pk_scan_range()], Vec::new());
        assert!(resp.is_success(), "select failed: {}", resp.errmsg);
        rows_to_ids(&resp)
    }

    pub fn enc_pk(id: i32) -> Vec<u8> {
        codec::encode_index_tuple(&[Value::Int32(id)])
    }
}

pub fn rows_to_ids(resp: &StoreResponse) -> Vec<i32> {
    resp.rows
        .iter()
        .map(|row| match row.first() {
            Some(Value::Int32(v)) => *v,
            other => panic!("unexpected id slot: {other:?}"),
        })
        .collect()
}
