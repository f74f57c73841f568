//! Posting nodes and serialized lists.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether a posting asserts or retracts the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeFlag {
    #[default]
    Normal,
    Delete,
}

/// One posting: the document's primary-key bytes plus its flag and an
/// optional ranking payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReverseNode {
    /// Encoded primary-key tuple of the document.
    pub key: Vec<u8>,
    pub flag: NodeFlag,
    pub weight: f32,
}

impl ReverseNode {
    pub fn normal(key: Vec<u8>) -> Self {
        Self { key, flag: NodeFlag::Normal, weight: 0.0 }
    }

    pub fn delete(key: Vec<u8>) -> Self {
        Self { key, flag: NodeFlag::Delete, weight: 0.0 }
    }
}

/// A term's posting list, sorted by key. L2 and L3 store one of these per
/// term; reads merge in L1 singletons on the fly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReverseList {
    pub nodes: Vec<ReverseNode>,
}

impl ReverseList {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Merge `newer` over `older`, both sorted by key. The newer occurrence of a
/// key wins. With `drop_deletes` (the final L2→L3 fold), suppressed postings
/// disappear instead of being carried forward.
pub fn level_merge(newer: &ReverseList, older: &ReverseList, drop_deletes: bool) -> ReverseList {
    let mut merged: BTreeMap<Vec<u8>, ReverseNode> = BTreeMap::new();
    for node in &older.nodes {
        merged.insert(node.key.clone(), node.clone());
    }
    for node in &newer.nodes {
        merged.insert(node.key.clone(), node.clone());
    }
    let nodes = merged
        .into_values()
        .filter(|n| !(drop_deletes && n.flag == NodeFlag::Delete))
        .collect();
    ReverseList { nodes }
}
