//! The scan path: bounded iterators, the range filter, covering decisions,
//! and fulltext composition.

use talon_common::error::{ExecError, KvError};
use talon_common::schema::{IndexInfo, IndexType, TableInfo};
use talon_common::value::Value;
use talon_proto::plan::ScanNode;
use talon_proto::{Expr, FulltextCombine, IndexRange, Record};
use talon_reverse::{AndExecutor, NodeStream, OrExecutor};
use talon_storage::codec;
use talon_storage::kv::{Cf, KvIter, TxnIter};
use tracing::debug;

use crate::eval;
use crate::index_select::{self, IndexChoice};
use crate::state::RuntimeState;

/// One scanned row: the encoded primary-key tuple plus the materialized
/// record.
pub type ScannedRow = (Vec<u8>, Record);

enum ScanIter {
    Snap(KvIter),
    Txn(TxnIter),
}

impl ScanIter {
    fn valid(&self) -> bool {
        match self {
            ScanIter::Snap(i) => i.valid(),
            ScanIter::Txn(i) => i.valid(),
        }
    }

    fn key(&self) -> &[u8] {
        match self {
            ScanIter::Snap(i) => i.key(),
            ScanIter::Txn(i) => i.key(),
        }
    }

    fn value(&self) -> &[u8] {
        match self {
            ScanIter::Snap(i) => i.value(),
            ScanIter::Txn(i) => i.value(),
        }
    }

    fn next(&mut self) {
        match self {
            ScanIter::Snap(i) => i.next(),
            ScanIter::Txn(i) => i.next(),
        }
    }
}

/// Smallest byte string strictly greater than every string with this prefix.
/// `None` when the prefix is all-0xFF (unbounded above).
fn prefix_successor(mut bytes: Vec<u8>) -> Option<Vec<u8>> {
    while let Some(last) = bytes.last() {
        if *last == 0xFF {
            bytes.pop();
        } else {
            let idx = bytes.len() - 1;
            bytes[idx] += 1;
            return Some(bytes);
        }
    }
    None
}

/// Encode a planner range into data-key bounds for `index`, intersected with
/// the region's own range when the index is the routing index.
fn encode_bounds(
    state: &RuntimeState,
    index: &IndexInfo,
    range: &IndexRange,
) -> (Vec<u8>, Option<Vec<u8>>) {
    let region = &state.resource.region_info;
    let prefix = codec::key_prefix(region.region_id, index.id.0);

    let left_tuple =
        codec::encode_index_tuple(&range.left[..(range.left_field_cnt as usize).min(range.left.len())]);
    let right_tuple = codec::encode_index_tuple(
        &range.right[..(range.right_field_cnt as usize).min(range.right.len())],
    );

    let (mut lower_tuple, mut upper_tuple): (Vec<u8>, Option<Vec<u8>>);
    if let Some(like) = &range.like_prefix {
        lower_tuple = like.clone();
        upper_tuple = prefix_successor(like.clone());
    } else {
        lower_tuple = left_tuple;
        if range.left_open {
            // Exclusive lower bound: skip every key under the bound's prefix.
            if let Some(succ) = prefix_successor(lower_tuple.clone()) {
                lower_tuple = succ;
            }
        }
        upper_tuple = if range.right_field_cnt == 0 && range.right.is_empty() {
            None
        } else if range.right_open {
            Some(right_tuple)
        } else {
            prefix_successor(right_tuple)
        };
    }

    // Routing-index scans clamp against the region range; other indexes are
    // filtered per row by the decoded primary key.
    if index.id.0 == region.index_id {
        if lower_tuple.as_slice() < region.start_key.as_slice() {
            lower_tuple = region.start_key.clone();
        }
        if !region.end_key.is_empty() {
            upper_tuple = Some(match upper_tuple {
                Some(u) if u.as_slice() < region.end_key.as_slice() => u,
                _ => region.end_key.clone(),
            });
        }
    }

    let mut lower = prefix.clone();
    lower.extend_from_slice(&lower_tuple);
    let upper = match upper_tuple {
        Some(u) => {
            let mut key = prefix;
            key.extend_from_slice(&u);
            Some(key)
        }
        // No tuple bound: stop at the end of this index's key space.
        None => prefix_successor(prefix),
    };
    (lower, upper)
}

fn make_iter(
    state: &RuntimeState,
    lower: Vec<u8>,
    upper: Option<Vec<u8>>,
    reverse: bool,
) -> Result<ScanIter, ExecError> {
    if let Some(txn) = &state.txn {
        let guard = txn.lock();
        let iter = if reverse {
            guard.iter_reverse(lower, upper)?
        } else {
            guard.iter(lower, upper)?
        };
        Ok(ScanIter::Txn(iter))
    } else {
        let iter = if reverse {
            state.snapshot.iter_reverse(Cf::Data, lower, upper)
        } else {
            state.snapshot.iter(Cf::Data, lower, upper)
        };
        Ok(ScanIter::Snap(iter))
    }
}

fn pk_types(table: &TableInfo, pk: &IndexInfo) -> Vec<talon_common::value::ValueType> {
    pk.fields
        .iter()
        .map(|f| table.field(*f).map(|fi| fi.field_type).unwrap_or_default())
        .collect()
}

fn decode_record(bytes: &[u8]) -> Result<Record, ExecError> {
    bincode::deserialize(bytes)
        .map_err(|e| ExecError::Kv(KvError::Corruption(format!("decode row: {e}"))))
}

/// Fetch the primary row for an encoded pk tuple (through the txn when
/// present).
fn primary_lookup(state: &RuntimeState, pk_tuple: &[u8]) -> Result<Option<Record>, ExecError> {
    let region = &state.resource.region_info;
    let pk_index = state.resource.pk_index()?;
    let key = codec::data_key(region.region_id, pk_index.id.0, pk_tuple);
    let bytes = match &state.txn {
        Some(txn) => txn.lock().get_kv(&key)?,
        None => state.snapshot.get(Cf::Data, &key),
    };
    bytes.map(|b| decode_record(&b)).transpose()
}

/// Reconstruct a record from a covering-index entry without touching the
/// primary table.
fn decode_covering(
    table: &TableInfo,
    index: &IndexInfo,
    pk: &IndexInfo,
    key: &[u8],
    pk_tuple: &[u8],
) -> Result<Record, ExecError> {
    let mut record = Record::new();
    let idx_types: Vec<_> = index
        .fields
        .iter()
        .map(|f| table.field(*f).map(|fi| fi.field_type).unwrap_or_default())
        .collect();
    let tuple = codec::tuple_part(key);
    let values = codec::decode_index_tuple(tuple, &idx_types)?;
    for (field, value) in index.fields.iter().zip(values) {
        record.set(field.0, value);
    }
    let pk_values = codec::decode_index_tuple(pk_tuple, &pk_types(table, pk))?;
    for (field, value) in pk.fields.iter().zip(pk_values) {
        record.set(field.0, value);
    }
    Ok(record)
}

/// All field ids a scan must materialize: output slots plus conjunct refs.
fn required_fields(state: &RuntimeState, scan: &ScanNode) -> Vec<u32> {
    let mut fields: Vec<u32> = state
        .tuple(scan.tuple_id)
        .map(|t| t.slots.iter().map(|s| s.field_id).collect())
        .unwrap_or_default();
    for c in &scan.conjuncts {
        c.referenced_fields(&mut fields);
    }
    fields.sort_unstable();
    fields.dedup();
    fields
}

/// Whole-region range over the routing index, for scans with no planner
/// ranges (full scan, DDL backfill).
pub fn full_region_range(index_id: u64) -> IndexRange {
    IndexRange { index_id, ..Default::default() }
}

/// Run the fulltext part of a scan: one boolean executor per MATCH conjunct,
/// composed with AND/OR, then primary lookups.
fn fulltext_rows(
    state: &mut RuntimeState,
    scan: &ScanNode,
    choice: &IndexChoice,
) -> Result<Option<Vec<ScannedRow>>, ExecError> {
    let mut executors: Vec<Box<dyn NodeStream>> = Vec::new();
    for conjunct in &scan.conjuncts {
        let Expr::MatchAgainst { index_id, query } = conjunct else {
            continue;
        };
        if !choice.fulltext_index_ids.contains(index_id) {
            continue;
        }
        let Some(reverse) = state.resource.reverse_indexes.get(index_id) else {
            return Err(ExecError::UnknownIndex(talon_common::types::IndexId(*index_id)));
        };
        let and_terms = scan.fulltext_combine == FulltextCombine::And;
        executors.push(reverse.create_executor(&state.snapshot, query, and_terms, false)?);
        state.scan_indexes.push(*index_id);
    }
    if executors.is_empty() {
        return Ok(None);
    }
    let mut exe: Box<dyn NodeStream> = if executors.len() == 1 {
        executors.remove(0)
    } else if scan.fulltext_combine == FulltextCombine::And {
        Box::new(AndExecutor::new(executors))
    } else {
        Box::new(OrExecutor::new(executors))
    };
    let mut rows = Vec::new();
    let mut scanned: u64 = 0;
    while let Some(node) = exe.next_node() {
        scanned += 1;
        if scanned % state.cancel_check_rows == 0 {
            state.check_cancelled()?;
        }
        if node.flag != talon_reverse::NodeFlag::Normal {
            continue;
        }
        let Some(record) = primary_lookup(state, &node.key)? else {
            continue;
        };
        if !eval::passes_conjuncts(&scan.conjuncts, &record)? {
            continue;
        }
        rows.push((node.key, record));
        if let Some(limit) = scan.limit {
            if rows.len() as u64 >= limit {
                break;
            }
        }
    }
    Ok(Some(rows))
}

/// Read the rows a scan selects, in key order of the chosen index.
pub fn read_rows(state: &mut RuntimeState, scan: &ScanNode) -> Result<Vec<ScannedRow>, ExecError> {
    let resource = state.resource.clone();
    let region = &resource.region_info;
    let table = resource.table.clone();
    let pk_index = resource.pk_index()?.clone();

    let choice = index_select::choose_index(&resource, &scan.ranges, scan.sort.as_ref());
    if let Some(rows) = fulltext_rows(state, scan, &choice)? {
        return Ok(rows);
    }

    let (index, ranges) = match choice.index_id {
        Some(id) => {
            let index = resource
                .index(id)
                .ok_or(ExecError::UnknownIndex(talon_common::types::IndexId(id)))?
                .clone();
            (index, choice.ranges)
        }
        None => (pk_index.clone(), vec![full_region_range(pk_index.id.0)]),
    };
    state.scan_indexes.push(index.id.0);
    let routing = index.id.0 == region.index_id;
    let required = required_fields(state, scan);
    let covering = index.id.0 != pk_index.id.0
        && index_select::is_covering(&index, &pk_index, &required);
    let reverse_scan = scan.reverse
        || scan
            .sort
            .as_ref()
            .map(|s| s.descending && index.fields.first().map(|f| f.0) == Some(s.field_id))
            .unwrap_or(false);

    let mut rows: Vec<ScannedRow> = Vec::new();
    let mut scanned: u64 = 0;
    for range in &ranges {
        // Point-get fast path: a fully pinned, closed, single-key range on a
        // unique index.
        let full_cnt = index.fields.len() as u32;
        let unique_like =
            matches!(index.index_type, IndexType::Primary | IndexType::Unique);
        if unique_like
            && !range.left_open
            && !range.right_open
            && range.like_prefix.is_none()
            && range.left_field_cnt == full_cnt
            && range.right_field_cnt == full_cnt
            && !range.left.is_empty()
            && range.left == range.right
        {
            let tuple = codec::encode_index_tuple(&range.left);
            if routing && !codec::fits_range(&region.start_key, &region.end_key, &tuple) {
                continue;
            }
            let pk_tuple = if index.id.0 == pk_index.id.0 {
                tuple.clone()
            } else {
                let key = codec::data_key(region.region_id, index.id.0, &tuple);
                let found = match &state.txn {
                    Some(txn) => txn.lock().get_kv(&key)?,
                    None => state.snapshot.get(Cf::Data, &key),
                };
                match found {
                    Some(pk) => pk,
                    None => continue,
                }
            };
            if !routing && !codec::fits_range(&region.start_key, &region.end_key, &pk_tuple) {
                continue;
            }
            if let Some(record) = primary_lookup(state, &pk_tuple)? {
                if eval::passes_conjuncts(&scan.conjuncts, &record)? {
                    rows.push((pk_tuple, record));
                }
            }
            continue;
        }

        let (lower, upper) = encode_bounds(state, &index, range);
        debug!(
            region_id = region.region_id,
            index_id = index.id.0,
            covering,
            "scan range [{}..{})",
            lower.len(),
            upper.as_ref().map(|u| u.len()).unwrap_or(0)
        );
        let mut iter = make_iter(state, lower, upper, reverse_scan)?;
        while iter.valid() {
            scanned += 1;
            if scanned % state.cancel_check_rows == 0 {
                state.check_cancelled()?;
            }
            let pk_tuple: Vec<u8> = if index.id.0 == pk_index.id.0 {
                codec::tuple_part(iter.key()).to_vec()
            } else {
                iter.value().to_vec()
            };
            // The range filter: a key must route to this region. Secondary
            // entries whose pk escaped the region (mid-split window) are
            // skipped.
            let fit_tuple =
                if routing { codec::tuple_part(iter.key()) } else { pk_tuple.as_slice() };
            if !codec::fits_range(&region.start_key, &region.end_key, fit_tuple) {
                iter.next();
                continue;
            }
            let record = if index.id.0 == pk_index.id.0 {
                decode_record(iter.value())?
            } else if covering {
                decode_covering(&table, &index, &pk_index, iter.key(), &pk_tuple)?
            } else {
                match primary_lookup(state, &pk_tuple)? {
                    Some(r) => r,
                    None => {
                        iter.next();
                        continue;
                    }
                }
            };
            if eval::passes_conjuncts(&scan.conjuncts, &record)? {
                rows.push((pk_tuple, record));
                if let Some(limit) = scan.limit {
                    if rows.len() as u64 >= limit {
                        return Ok(rows);
                    }
                }
            }
            iter.next();
        }
    }
    Ok(rows)
}

/// Project scanned rows to the client's tuple layout.
pub fn project_rows(
    state: &RuntimeState,
    tuple_id: u32,
    rows: &[ScannedRow],
) -> Vec<Vec<Value>> {
    let Some(tuple) = state.tuple(tuple_id) else {
        return rows.iter().map(|(_, r)| r.fields.values().cloned().collect()).collect();
    };
    rows.iter()
        .map(|(_, record)| tuple.slots.iter().map(|s| record.get_or_null(s.field_id)).collect())
        .collect()
}

/// Scan every row of the region via the routing index (DDL backfill, split
/// key discovery helpers). Reads the provided snapshot only.
pub fn scan_region_rows(
    state: &mut RuntimeState,
) -> Result<Vec<ScannedRow>, ExecError> {
    let pk_id = state.resource.pk_index()?.id.0;
    let scan = ScanNode {
        table_id: state.resource.table.id.0,
        ranges: vec![full_region_range(pk_id)],
        ..Default::default()
    };
    read_rows(state, &scan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(vec![1, 2, 3]), Some(vec![1, 2, 4]));
        assert_eq!(prefix_successor(vec![1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_successor(vec![0xFF, 0xFF]), None);
        assert_eq!(prefix_successor(vec![]), None);
    }
}
