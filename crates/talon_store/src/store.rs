//! One store process: its regions, its engine, and the store-to-store RPC
//! surface the structural coordinators use.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;

use talon_common::config::RegionConfig;
use talon_common::error::{ErrCode, TalonError};
use talon_common::schema::SchemaFactory;
use talon_proto::{DdlWorkDirective, RegionInfo, StoreRequest, StoreResponse};
use talon_raft::{RaftGroup, RaftRouter};
use talon_storage::codec;
use talon_storage::kv::{Cf, KvEngine};
use talon_storage::meta::MetaWriter;
use tracing::{info, warn};

use crate::control::ConcurrencyLimiter;
use crate::region::Region;

/// Cluster-wide registry standing in for the RPC mesh: address → store,
/// (address, region) → region, plus the consensus groups. Lives as long as
/// the process.
pub struct StoreDirectory {
    raft: Arc<RaftRouter>,
    stores: DashMap<String, Arc<Store>>,
    regions: DashMap<(String, u64), Arc<Region>>,
}

impl StoreDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            raft: RaftRouter::new(),
            stores: DashMap::new(),
            regions: DashMap::new(),
        })
    }

    pub fn raft(&self) -> &Arc<RaftRouter> {
        &self.raft
    }

    pub fn register_store(&self, store: Arc<Store>) {
        self.stores.insert(store.address().to_string(), store);
    }

    pub(crate) fn register_region(&self, address: &str, region: Arc<Region>) {
        self.regions.insert((address.to_string(), region.region_id()), region);
    }

    pub(crate) fn get_region(&self, address: &str, region_id: u64) -> Option<Arc<Region>> {
        self.regions.get(&(address.to_string(), region_id)).map(|e| e.value().clone())
    }

    /// Route a request to the region's current leader, through its store so
    /// the store-wide concurrency limits apply.
    pub fn send(&self, region_id: u64, request: StoreRequest) -> StoreResponse {
        let Ok(group) = self.raft.get(region_id) else {
            return StoreResponse::error(ErrCode::RegionNotExist, "no such region");
        };
        let Some(leader) = group.leader_address() else {
            return StoreResponse::error(ErrCode::NotLeader, "no leader elected");
        };
        let Some(store) = self.stores.get(&leader).map(|s| s.value().clone()) else {
            return StoreResponse::error(ErrCode::RegionNotExist, "leader store missing");
        };
        store.handle_request(region_id, request)
    }

    /// Provision a new region (split child) on every peer in its descriptor
    /// and register its consensus group.
    pub(crate) fn create_region_group(&self, info: &RegionInfo) -> Result<(), StoreResponse> {
        let group = RaftGroup::new(info.region_id);
        self.raft.register(group.clone());
        for peer in &info.peers {
            let Some(store) = self.stores.get(peer).map(|s| s.value().clone()) else {
                self.raft.remove(info.region_id);
                return Err(StoreResponse::error(
                    ErrCode::InternalError,
                    format!("no store at {peer}"),
                ));
            };
            if let Err(e) = store.create_region(info.clone(), &group, true) {
                self.raft.remove(info.region_id);
                return Err(StoreResponse::error(ErrCode::InternalError, e.to_string()));
            }
        }
        Ok(())
    }

    /// Unregister a region's in-memory objects without touching durable
    /// state (restart simulation; the stores reopen it afterwards).
    pub fn remove_region_soft(&self, region_id: u64) {
        let peers = self.raft.get(region_id).map(|g| g.peers()).unwrap_or_default();
        for peer in peers {
            self.regions.remove(&(peer.clone(), region_id));
            if let Some(store) = self.stores.get(&peer) {
                store.regions.remove(&region_id);
            }
        }
        self.raft.remove(region_id);
    }

    /// Tear a region down everywhere: data, meta, registry, group.
    pub fn remove_region_group(&self, region_id: u64) {
        let peers = self.raft.get(region_id).map(|g| g.peers()).unwrap_or_default();
        for peer in peers {
            if let Some(region) = self.get_region(&peer, region_id) {
                region.mark_removed();
                let start = codec::region_prefix(region_id);
                let end = codec::region_prefix_end(region_id);
                region.engine.delete_range(Cf::Data, &start, Some(&end));
                MetaWriter::new(region.engine.clone()).clear_region(region_id);
            }
            self.regions.remove(&(peer.clone(), region_id));
            if let Some(store) = self.stores.get(&peer) {
                store.regions.remove(&region_id);
            }
        }
        self.raft.remove(region_id);
        info!(region_id, "region group removed");
    }
}

/// Global concurrency caps shared by all regions of a store.
pub struct StoreLimiters {
    pub write: Arc<ConcurrencyLimiter>,
    pub lock: Arc<ConcurrencyLimiter>,
    pub ddl_work: Arc<ConcurrencyLimiter>,
    pub snapshot_load: Arc<ConcurrencyLimiter>,
}

pub struct Store {
    address: String,
    engine: Arc<KvEngine>,
    schema: Arc<SchemaFactory>,
    config: Arc<RegionConfig>,
    directory: Arc<StoreDirectory>,
    pub(crate) regions: DashMap<u64, Arc<Region>>,
    snapshot_base: PathBuf,
    pub limiters: StoreLimiters,
}

impl Store {
    pub fn new(
        address: impl Into<String>,
        schema: Arc<SchemaFactory>,
        config: Arc<RegionConfig>,
        directory: Arc<StoreDirectory>,
        snapshot_base: PathBuf,
    ) -> Arc<Self> {
        let config_ref = config.clone();
        let store = Arc::new(Self {
            address: address.into(),
            engine: KvEngine::new(),
            schema,
            config,
            directory: directory.clone(),
            regions: DashMap::new(),
            snapshot_base,
            limiters: StoreLimiters {
                write: ConcurrencyLimiter::new(
                    "service_write",
                    config_ref.service_write_concurrency,
                ),
                lock: ConcurrencyLimiter::new("service_lock", config_ref.service_lock_concurrency),
                ddl_work: ConcurrencyLimiter::new("ddl_work", config_ref.ddl_work_concurrency),
                snapshot_load: ConcurrencyLimiter::new(
                    "snapshot_load",
                    config_ref.snapshot_load_concurrency,
                ),
            },
        });
        directory.register_store(store.clone());
        store
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn engine(&self) -> &Arc<KvEngine> {
        &self.engine
    }

    /// Instantiate this store's replica of a region and join its group.
    pub fn create_region(
        self: &Arc<Self>,
        info: RegionInfo,
        group: &Arc<RaftGroup>,
        new_region: bool,
    ) -> Result<Arc<Region>, TalonError> {
        let region_id = info.region_id;
        let region = Region::new(
            info,
            self.address.clone(),
            self.engine.clone(),
            self.schema.clone(),
            self.config.clone(),
            self.directory.raft().clone(),
            self.directory.clone(),
            self.snapshot_base.join(format!("region_{region_id}")),
            new_region,
        )?;
        self.regions.insert(region_id, region.clone());
        group.add_replica(self.address.clone(), region.clone());
        Ok(region)
    }

    /// Reopen a region from durable state after a restart, rejoining the
    /// given group. Log numbering resumes past the durable applied index.
    pub fn reopen_region(
        self: &Arc<Self>,
        region_id: u64,
        group: &Arc<RaftGroup>,
    ) -> Result<Arc<Region>, TalonError> {
        let info = RegionInfo { region_id, ..Default::default() };
        let region = self.create_region(info, group, false)?;
        group.reset_log_start(region.applied_index() + 1, region.applied_term() + 1);
        Ok(region)
    }

    pub fn region(&self, region_id: u64) -> Option<Arc<Region>> {
        self.regions.get(&region_id).map(|e| e.value().clone())
    }

    pub fn regions(&self) -> Vec<Arc<Region>> {
        self.regions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn handle_request(&self, region_id: u64, request: StoreRequest) -> StoreResponse {
        let Some(region) = self.region(region_id) else {
            return StoreResponse::error(ErrCode::RegionNotExist, "no such region on this store");
        };
        // Store-wide caps on simultaneous heavy operations: writes hold a
        // write slot, DML additionally holds a row-lock slot.
        let _write_ticket = if request.op_type.is_write() {
            Some(self.acquire_blocking(&self.limiters.write))
        } else {
            None
        };
        let _lock_ticket = if request.op_type.is_dml() {
            Some(self.acquire_blocking(&self.limiters.lock))
        } else {
            None
        };
        region.execute_query(request)
    }

    fn acquire_blocking(&self, limiter: &Arc<ConcurrencyLimiter>) -> crate::control::LimiterTicket {
        loop {
            if let Some(ticket) = limiter.try_acquire() {
                return ticket;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// Install a region's snapshot files under the store-wide ingest cap.
    pub fn load_region_snapshot(&self, region_id: u64) -> Result<(), TalonError> {
        let Some(region) = self.region(region_id) else {
            return Err(TalonError::Internal(format!("region {region_id} not on this store")));
        };
        let _ticket = self.acquire_blocking(&self.limiters.snapshot_load);
        region.load_snapshot()
    }

    /// Downward ddl directive: publish the new index state to the schema
    /// snapshot, then run each affected region's local work. Backfills are
    /// bounded by the ddl-work limiter.
    pub fn apply_ddl_directive(self: &Arc<Self>, directive: &DdlWorkDirective) -> Vec<StoreResponse> {
        self.schema.set_index_state(
            talon_common::types::IndexId(directive.index_id),
            directive.target_state,
        );
        let mut responses = Vec::new();
        for region in self.regions() {
            if region.region_info().table_id != directive.table_id || region.is_removed() {
                continue;
            }
            let _ticket = loop {
                match self.limiters.ddl_work.try_acquire() {
                    Some(t) => break t,
                    None => std::thread::sleep(std::time::Duration::from_millis(1)),
                }
            };
            responses.push(region.process_ddl_work(directive));
        }
        responses
    }

    /// Background inverted-index maintenance pass over every region.
    pub fn reverse_merge_tick(&self) {
        for region in self.regions() {
            if region.is_removed() {
                continue;
            }
            let info = region.region_info();
            let reverse_map = region.reverse_indexes.read().clone();
            for reverse in reverse_map.values() {
                if let Err(e) = reverse.reverse_merge(&info) {
                    warn!(
                        region_id = info.region_id,
                        index_id = reverse.index_id(),
                        "reverse merge failed: {e}"
                    );
                }
            }
        }
    }

    /// Process queued compaction requests behind the structural gate, so
    /// they serialize with split/merge/DDL.
    pub fn compact_tick(&self) {
        for region in self.regions() {
            if !region.pending_compact() {
                continue;
            }
            let Ok(guard) = region.gate.acquire() else {
                continue;
            };
            if region.take_pending_compact() {
                // The reference engine reclaims space eagerly; the hook is
                // where a real engine would issue a range compaction.
                info!(region_id = region.region_id(), "compaction executed");
            }
            drop(guard);
        }
    }

    /// Watchdog for provisioned-but-never-acknowledged split children.
    pub fn legal_complete_tick(self: &Arc<Self>) {
        for region in self.regions() {
            if !region.check_legal_complete() && region.is_illegal() {
                warn!(region_id = region.region_id(), "removing illegal split child");
                self.directory.remove_region_group(region.region_id());
            }
        }
    }
}
