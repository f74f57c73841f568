//! Index choice without a cost model.
//!
//! Each candidate index scores
//! `((prefix_used * 10 / total_fields) << 16) | priority` with
//! `priority(PRIMARY) = 300`, `priority(UNIQUE) = 200`,
//! `priority(KEY) = 100 + prefix_used`. A composite KEY index whose fields
//! are all covered by the primary key is discarded; fulltext indexes are set
//! aside for boolean composition; a RECOMMEND index short-circuits
//! everything. Ties prefer an index matching the requested sort order.

use std::sync::Arc;

use talon_common::schema::{IndexInfo, IndexType};
use talon_proto::{IndexRange, SortField};

use crate::state::RegionResource;

/// Outcome of index selection for one scan.
#[derive(Debug, Default)]
pub struct IndexChoice {
    /// Ranges of the winning regular index, if any.
    pub ranges: Vec<IndexRange>,
    pub index_id: Option<u64>,
    /// Fulltext indexes referenced by the scan, kept for boolean composition.
    pub fulltext_index_ids: Vec<u64>,
    /// A RECOMMEND index preempted regular selection.
    pub short_circuit: bool,
}

fn score(index: &IndexInfo, prefix_used: u32) -> u64 {
    let total = index.fields.len().max(1) as u64;
    let coverage = (prefix_used as u64 * 10) / total;
    let priority: u64 = match index.index_type {
        IndexType::Primary => 300,
        IndexType::Unique => 200,
        IndexType::Key => 100 + prefix_used as u64,
        IndexType::Fulltext | IndexType::Recommend => 0,
    };
    (coverage << 16) | priority
}

fn prefix_used(ranges: &[IndexRange]) -> u32 {
    ranges.iter().map(|r| r.left_field_cnt.max(r.right_field_cnt)).max().unwrap_or(0)
}

/// Pick the scan index from the planner-supplied candidate ranges.
pub fn choose_index(
    resource: &RegionResource,
    ranges: &[IndexRange],
    sort: Option<&SortField>,
) -> IndexChoice {
    let mut choice = IndexChoice::default();
    let pk_fields: Vec<_> = resource
        .indexes
        .first()
        .map(|pk| pk.fields.clone())
        .unwrap_or_default();

    let mut best: Option<(u64, u64, Vec<IndexRange>)> = None; // (score, index_id, ranges)
    let mut candidate_ids: Vec<u64> = ranges.iter().map(|r| r.index_id).collect();
    candidate_ids.sort_unstable();
    candidate_ids.dedup();

    for index_id in candidate_ids {
        let Some(index) = resource.index(index_id) else {
            continue;
        };
        match index.index_type {
            IndexType::Recommend => {
                if index.state.readable() {
                    choice.fulltext_index_ids.push(index_id);
                    choice.short_circuit = true;
                    return choice;
                }
                continue;
            }
            IndexType::Fulltext => {
                if index.state.readable() {
                    choice.fulltext_index_ids.push(index_id);
                }
                continue;
            }
            IndexType::Primary => {}
            _ => {
                if !index.state.readable() {
                    continue;
                }
            }
        }
        // A composite KEY index fully shadowed by the primary key adds
        // nothing over a pk scan.
        if index.index_type == IndexType::Key
            && !index.fields.is_empty()
            && index.fields.iter().all(|f| pk_fields.contains(f))
        {
            continue;
        }
        let index_ranges: Vec<IndexRange> =
            ranges.iter().filter(|r| r.index_id == index_id).cloned().collect();
        let used = prefix_used(&index_ranges);
        let mut s = score(index, used);
        if let Some(sort) = sort {
            if index.fields.first().map(|f| f.0) == Some(sort.field_id) {
                s += 1;
            }
        }
        match &best {
            Some((best_score, _, _)) if *best_score >= s => {}
            _ => best = Some((s, index_id, index_ranges)),
        }
    }

    if let Some((_, index_id, index_ranges)) = best {
        choice.index_id = Some(index_id);
        choice.ranges = index_ranges;
    }
    choice
}

/// Can the scan be served from the index alone (plus the pk it carries)?
pub fn is_covering(index: &Arc<IndexInfo>, pk: &Arc<IndexInfo>, required_fields: &[u32]) -> bool {
    required_fields.iter().all(|f| {
        index.fields.iter().any(|idx_f| idx_f.0 == *f)
            || pk.fields.iter().any(|pk_f| pk_f.0 == *f)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use talon_common::schema::{IndexState, SegmentType, TableInfo};
    use talon_common::types::{FieldId, IndexId, TableId};
    use talon_proto::RegionInfo;

    fn index(id: u64, ty: IndexType, fields: &[u32], state: IndexState) -> Arc<IndexInfo> {
        Arc::new(IndexInfo {
            id: IndexId(id),
            table_id: TableId(1),
            index_type: ty,
            state,
            fields: fields.iter().map(|f| FieldId(*f)).collect(),
            segment_type: SegmentType::NoSegment,
        })
    }

    fn resource(indexes: Vec<Arc<IndexInfo>>) -> RegionResource {
        RegionResource {
            region_info: RegionInfo { region_id: 1, table_id: 1, index_id: 1, ..Default::default() },
            table: Arc::new(TableInfo {
                id: TableId(1),
                name: "t".into(),
                fields: vec![],
                indexes: indexes.iter().map(|i| i.id).collect(),
                columnar: false,
                partition_num: 1,
            }),
            indexes,
            reverse_indexes: HashMap::new(),
        }
    }

    fn range(index_id: u64, cnt: u32) -> IndexRange {
        IndexRange { index_id, left_field_cnt: cnt, right_field_cnt: cnt, ..Default::default() }
    }

    #[test]
    fn test_primary_beats_unique_beats_key() {
        let res = resource(vec![
            index(1, IndexType::Primary, &[1], IndexState::Public),
            index(2, IndexType::Unique, &[2], IndexState::Public),
            index(3, IndexType::Key, &[3], IndexState::Public),
        ]);
        let ranges = vec![range(1, 1), range(2, 1), range(3, 1)];
        let choice = choose_index(&res, &ranges, None);
        assert_eq!(choice.index_id, Some(1));
    }

    #[test]
    fn test_longer_prefix_wins_between_keys() {
        let res = resource(vec![
            index(1, IndexType::Primary, &[1], IndexState::Public),
            index(2, IndexType::Key, &[2, 3], IndexState::Public),
            index(3, IndexType::Key, &[4, 5], IndexState::Public),
        ]);
        let ranges = vec![range(2, 1), range(3, 2)];
        let choice = choose_index(&res, &ranges, None);
        assert_eq!(choice.index_id, Some(3));
    }

    #[test]
    fn test_unreadable_index_skipped() {
        let res = resource(vec![
            index(1, IndexType::Primary, &[1], IndexState::Public),
            index(2, IndexType::Key, &[2], IndexState::WriteOnly),
        ]);
        let ranges = vec![range(2, 1)];
        let choice = choose_index(&res, &ranges, None);
        assert_eq!(choice.index_id, None);
    }

    #[test]
    fn test_key_shadowed_by_pk_discarded() {
        let res = resource(vec![
            index(1, IndexType::Primary, &[1, 2], IndexState::Public),
            index(2, IndexType::Key, &[2, 1], IndexState::Public),
        ]);
        let ranges = vec![range(2, 2)];
        let choice = choose_index(&res, &ranges, None);
        assert_eq!(choice.index_id, None);
    }

    #[test]
    fn test_fulltext_kept_aside() {
        let res = resource(vec![
            index(1, IndexType::Primary, &[1], IndexState::Public),
            index(9, IndexType::Fulltext, &[2], IndexState::Public),
        ]);
        let ranges = vec![range(1, 1), range(9, 1)];
        let choice = choose_index(&res, &ranges, None);
        assert_eq!(choice.index_id, Some(1));
        assert_eq!(choice.fulltext_index_ids, vec![9]);
        assert!(!choice.short_circuit);
    }

    #[test]
    fn test_recommend_short_circuits() {
        let res = resource(vec![
            index(1, IndexType::Primary, &[1], IndexState::Public),
            index(8, IndexType::Recommend, &[2], IndexState::Public),
        ]);
        let ranges = vec![range(1, 1), range(8, 1)];
        let choice = choose_index(&res, &ranges, None);
        assert!(choice.short_circuit);
        assert_eq!(choice.fulltext_index_ids, vec![8]);
    }

    #[test]
    fn test_sort_match_breaks_tie() {
        let res = resource(vec![
            index(1, IndexType::Primary, &[1], IndexState::Public),
            index(2, IndexType::Key, &[2], IndexState::Public),
            index(3, IndexType::Key, &[3], IndexState::Public),
        ]);
        let ranges = vec![range(2, 1), range(3, 1)];
        let sort = SortField { field_id: 3, descending: false };
        let choice = choose_index(&res, &ranges, Some(&sort));
        assert_eq!(choice.index_id, Some(3));
    }

    #[test]
    fn test_covering_check_includes_pk() {
        let pk = index(1, IndexType::Primary, &[1], IndexState::Public);
        let sec = index(2, IndexType::Key, &[2], IndexState::Public);
        assert!(is_covering(&sec, &pk, &[1, 2]));
        assert!(!is_covering(&sec, &pk, &[1, 2, 3]));
    }
}
