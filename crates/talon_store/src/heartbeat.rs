//! Heartbeat assembly: per-region state reported upward to the meta
//! service, and the downward directives the store fans out.

use std::sync::Arc;

use talon_proto::{RegionHeartbeat, StoreHeartbeat};
use talon_storage::codec;
use talon_storage::kv::Cf;

use crate::region::Region;
use crate::store::Store;

impl Region {
    pub fn heartbeat_info(&self) -> RegionHeartbeat {
        let info = self.region_info();
        let used_size = self.engine.approximate_size(
            Cf::Data,
            &codec::region_prefix(self.region_id()),
            Some(&codec::region_prefix_end(self.region_id())),
        );
        RegionHeartbeat {
            region_id: info.region_id,
            table_id: info.table_id,
            version: info.version,
            applied_index: self.applied_index(),
            start_key: info.start_key,
            end_key: info.end_key,
            peers: info.peers,
            leader: info.leader,
            used_size,
            num_table_lines: self.num_table_lines(),
            status: info.status,
            ddl_state: self.ddl_heartbeat_state(),
        }
    }
}

impl Store {
    /// The upward heartbeat: one entry per region this store replicates,
    /// leaders first (the meta service only trusts leader rows for routing).
    pub fn heartbeat(self: &Arc<Self>) -> StoreHeartbeat {
        let mut regions: Vec<RegionHeartbeat> = self
            .regions()
            .into_iter()
            .filter(|r| !r.is_removed())
            .map(|r| r.heartbeat_info())
            .collect();
        regions.sort_by_key(|r| r.region_id);
        let used_size = regions.iter().map(|r| r.used_size).sum();
        StoreHeartbeat {
            address: self.address().to_string(),
            resource_tag: String::new(),
            capacity: u64::MAX,
            used_size,
            regions,
        }
    }
}
