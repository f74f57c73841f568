//! Region descriptors exchanged with clients and the meta service.

use serde::{Deserialize, Serialize};

/// Structural-operation gate. Only one split/merge/DDL/add-peer/snapshot may
/// hold `Doing` at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RegionStatus {
    #[default]
    Idle,
    Doing,
}

/// The region descriptor. `end_key` empty means +infinity;
/// `start_key == end_key != empty` marks a region merged away.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionInfo {
    pub region_id: u64,
    pub table_id: u64,
    /// Set when this region stores a global secondary index of `main_table_id`.
    pub main_table_id: u64,
    /// The routing index whose tuples define the key range.
    pub index_id: u64,
    pub partition_id: u32,
    /// Bumped on every range change; 0 = just-created split child.
    pub version: u64,
    pub conf_version: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub peers: Vec<String>,
    pub leader: String,
    pub status: RegionStatus,
    pub num_table_lines: i64,
    pub used_size: u64,
    pub can_add_peer: bool,
}

impl RegionInfo {
    /// True when the region has been merged away (tombstone range).
    pub fn is_merged(&self) -> bool {
        !self.start_key.is_empty() && self.start_key == self.end_key
    }

    /// Closed-open range containment with the empty-end = +inf convention.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        if self.is_merged() {
            return false;
        }
        if key < self.start_key.as_slice() {
            return false;
        }
        self.end_key.is_empty() || key < self.end_key.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_end_key_means_infinity() {
        let info = RegionInfo { start_key: vec![5], end_key: vec![], ..Default::default() };
        assert!(info.contains_key(&[5]));
        assert!(info.contains_key(&[0xFF, 0xFF]));
        assert!(!info.contains_key(&[4]));
    }

    #[test]
    fn test_closed_open_bounds() {
        let info = RegionInfo { start_key: vec![10], end_key: vec![50], ..Default::default() };
        assert!(info.contains_key(&[10]));
        assert!(info.contains_key(&[49, 0xFF]));
        assert!(!info.contains_key(&[50]));
    }

    #[test]
    fn test_merged_tombstone() {
        let info = RegionInfo { start_key: vec![10], end_key: vec![10], ..Default::default() };
        assert!(info.is_merged());
        assert!(!info.contains_key(&[10]));
        let fresh = RegionInfo::default();
        assert!(!fresh.is_merged());
    }
}
