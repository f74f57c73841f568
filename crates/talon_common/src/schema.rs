//! Immutable schema snapshots.
//!
//! Table and index descriptors are published as `Arc` values; a schema change
//! installs a new snapshot instead of mutating in place, so in-flight
//! operations keep a consistent view for their whole lifetime.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{FieldId, IndexId, TableId};
use crate::value::ValueType;

/// Index kind. `Recommend` is the personalized-retrieval variant of a
/// fulltext index and short-circuits index selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    Primary,
    Unique,
    Key,
    Fulltext,
    Recommend,
}

/// Visibility state of a secondary index during online DDL.
///
/// ADD:  None → DeleteOnly → WriteOnly → WriteLocal → Public
/// DROP: Public → WriteOnly → DeleteOnly → DeleteLocal → None
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum IndexState {
    #[default]
    None,
    DeleteOnly,
    WriteOnly,
    WriteLocal,
    DeleteLocal,
    Public,
}

impl IndexState {
    /// Writes must maintain entries for this index.
    pub fn writes_visible(self) -> bool {
        matches!(self, IndexState::WriteOnly | IndexState::WriteLocal | IndexState::Public)
    }

    /// Writes must remove entries for rows they touch.
    pub fn deletes_visible(self) -> bool {
        !matches!(self, IndexState::None)
    }

    /// Scans may use the index.
    pub fn readable(self) -> bool {
        matches!(self, IndexState::Public)
    }
}

/// Term segmentation mode for fulltext indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SegmentType {
    /// The whole value is one term.
    NoSegment,
    /// One term per character.
    #[default]
    Unigrams,
    /// Whitespace-delimited, lowercased words.
    Words,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInfo {
    pub id: FieldId,
    pub name: String,
    pub field_type: ValueType,
    pub can_null: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub id: IndexId,
    pub table_id: TableId,
    pub index_type: IndexType,
    pub state: IndexState,
    /// Indexed fields in key order.
    pub fields: Vec<FieldId>,
    pub segment_type: SegmentType,
}

impl IndexInfo {
    pub fn is_fulltext(&self) -> bool {
        matches!(self.index_type, IndexType::Fulltext | IndexType::Recommend)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    pub fields: Vec<FieldInfo>,
    /// All index ids of the table; the primary index comes first.
    pub indexes: Vec<IndexId>,
    /// When set, non-PK fields are mirrored into the column-store layout.
    pub columnar: bool,
    pub partition_num: u32,
}

impl TableInfo {
    pub fn field(&self, id: FieldId) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Process-wide registry of schema snapshots, refreshed from meta-service
/// heartbeats. Readers get `Arc` clones; writers publish whole descriptors.
#[derive(Default)]
pub struct SchemaFactory {
    tables: RwLock<HashMap<TableId, Arc<TableInfo>>>,
    indexes: RwLock<HashMap<IndexId, Arc<IndexInfo>>>,
}

impl SchemaFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn update_table(&self, table: TableInfo) {
        self.tables.write().insert(table.id, Arc::new(table));
    }

    pub fn update_index(&self, index: IndexInfo) {
        self.indexes.write().insert(index.id, Arc::new(index));
    }

    /// Publish a new state for one index, leaving the rest of the descriptor
    /// untouched. Returns false when the index is unknown.
    pub fn set_index_state(&self, index_id: IndexId, state: IndexState) -> bool {
        let mut guard = self.indexes.write();
        match guard.get(&index_id) {
            Some(info) => {
                let mut next = (**info).clone();
                next.state = state;
                guard.insert(index_id, Arc::new(next));
                true
            }
            None => false,
        }
    }

    pub fn get_table(&self, id: TableId) -> Option<Arc<TableInfo>> {
        self.tables.read().get(&id).cloned()
    }

    pub fn get_index(&self, id: IndexId) -> Option<Arc<IndexInfo>> {
        self.indexes.read().get(&id).cloned()
    }

    /// All indexes of a table, primary first, in declaration order.
    pub fn table_indexes(&self, table: &TableInfo) -> Vec<Arc<IndexInfo>> {
        let guard = self.indexes.read();
        table.indexes.iter().filter_map(|id| guard.get(id).cloned()).collect()
    }

    pub fn drop_index(&self, id: IndexId) {
        self.indexes.write().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> IndexInfo {
        IndexInfo {
            id: IndexId(20),
            table_id: TableId(1),
            index_type: IndexType::Key,
            state: IndexState::None,
            fields: vec![FieldId(2)],
            segment_type: SegmentType::NoSegment,
        }
    }

    #[test]
    fn test_snapshot_isolation_on_state_change() {
        let factory = SchemaFactory::new();
        factory.update_index(sample_index());
        let before = factory.get_index(IndexId(20)).unwrap();
        assert!(factory.set_index_state(IndexId(20), IndexState::Public));
        let after = factory.get_index(IndexId(20)).unwrap();
        // The old snapshot is untouched; the new one sees the change.
        assert_eq!(before.state, IndexState::None);
        assert_eq!(after.state, IndexState::Public);
    }

    #[test]
    fn test_set_state_on_unknown_index() {
        let factory = SchemaFactory::new();
        assert!(!factory.set_index_state(IndexId(99), IndexState::Public));
    }

    #[test]
    fn test_index_state_visibility() {
        assert!(!IndexState::DeleteOnly.writes_visible());
        assert!(IndexState::DeleteOnly.deletes_visible());
        assert!(IndexState::WriteOnly.writes_visible());
        assert!(!IndexState::WriteOnly.readable());
        assert!(IndexState::Public.readable());
        assert!(!IndexState::None.deletes_visible());
    }
}
