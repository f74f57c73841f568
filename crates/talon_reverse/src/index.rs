//! The per-index reverse engine: L1 writes, level merge, and search.
//!
//! Key layout under the data column family:
//! `region_id(8B) || index_id(8B) || level(1B) || term [|| 0x00 || pk]`
//! where the pk suffix exists only on L1 (one KV per posting). L2 and L3
//! store one serialized [`ReverseList`] per term.
//!
//! Writes go through the caller's transaction so they commit atomically with
//! the row they index. The background merge uses short engine-internal
//! transactions and never touches the region's consensus log.

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use talon_common::error::{KvError, TxnError};
use talon_common::schema::SegmentType;
use talon_proto::RegionInfo;
use talon_storage::codec;
use talon_storage::kv::{Cf, KvEngine, KvSnapshot};
use talon_txn::Transaction;
use tracing::{debug, warn};

use crate::boolean::{AndExecutor, NodeStream, OrExecutor, VecStream};
use crate::node::{level_merge, NodeFlag, ReverseList, ReverseNode};
use crate::segment::{segment_text, word_sign};

const LEVEL_1: u8 = 1;
const LEVEL_2: u8 = 2;
const LEVEL_3: u8 = 3;

fn level_prefix(region_id: u64, index_id: u64, level: u8) -> Vec<u8> {
    let mut key = codec::key_prefix(region_id, index_id);
    key.push(level);
    key
}

fn term_key(region_id: u64, index_id: u64, level: u8, term: &str) -> Vec<u8> {
    let mut key = level_prefix(region_id, index_id, level);
    key.extend_from_slice(term.as_bytes());
    key
}

fn l1_key(region_id: u64, index_id: u64, term: &str, pk: &[u8]) -> Vec<u8> {
    let mut key = term_key(region_id, index_id, LEVEL_1, term);
    key.push(0x00);
    key.extend_from_slice(pk);
    key
}

/// Split an L1 key into `(term, pk)`. Terms never contain NUL.
fn parse_l1_key(key: &[u8]) -> Option<(String, Vec<u8>)> {
    let body = key.get(17..)?;
    let sep = body.iter().position(|b| *b == 0x00)?;
    let term = String::from_utf8_lossy(&body[..sep]).into_owned();
    Some((term, body[sep + 1..].to_vec()))
}

pub struct ReverseIndex {
    region_id: u64,
    index_id: u64,
    engine: Arc<KvEngine>,
    segment_type: SegmentType,
    /// L2 lists at or past this length fold into L3 during merge.
    second_level_length: usize,
    /// Region routing range; L1 postings outside it are skipped on reads and
    /// merges (they belong to a split sibling).
    key_range: RwLock<(Vec<u8>, Vec<u8>)>,
    /// sign(word) → segmented terms. The cached skeleton is re-stamped with
    /// the caller's pk/flag on every use.
    seg_cache: Mutex<LruCache<u64, Arc<Vec<String>>>>,
    /// L3 lists big enough to be worth caching, keyed by their term key.
    list_cache: Mutex<LruCache<Vec<u8>, Arc<ReverseList>>>,
    cached_list_length: usize,
    inserted_nodes: AtomicU64,
    merge_passes: AtomicU64,
}

impl ReverseIndex {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        region_id: u64,
        index_id: u64,
        engine: Arc<KvEngine>,
        segment_type: SegmentType,
        second_level_length: usize,
        cache_size: usize,
        cached_list_length: usize,
    ) -> Arc<Self> {
        let cap = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Arc::new(Self {
            region_id,
            index_id,
            engine,
            segment_type,
            second_level_length,
            key_range: RwLock::new((Vec::new(), Vec::new())),
            seg_cache: Mutex::new(LruCache::new(cap)),
            list_cache: Mutex::new(LruCache::new(cap)),
            cached_list_length,
            inserted_nodes: AtomicU64::new(0),
            merge_passes: AtomicU64::new(0),
        })
    }

    pub fn index_id(&self) -> u64 {
        self.index_id
    }

    pub fn set_key_range(&self, start: Vec<u8>, end: Vec<u8>) {
        *self.key_range.write() = (start, end);
    }

    fn pk_in_range(&self, pk: &[u8]) -> bool {
        let range = self.key_range.read();
        codec::fits_range(&range.0, &range.1, pk)
    }

    // ── Write path ────────────────────────────────────────────────────────

    pub fn insert_reverse(
        &self,
        txn: &mut Transaction,
        word: &str,
        pk: &[u8],
    ) -> Result<(), TxnError> {
        self.handle_reverse(txn, NodeFlag::Normal, word, pk)
    }

    pub fn delete_reverse(
        &self,
        txn: &mut Transaction,
        word: &str,
        pk: &[u8],
    ) -> Result<(), TxnError> {
        self.handle_reverse(txn, NodeFlag::Delete, word, pk)
    }

    fn handle_reverse(
        &self,
        txn: &mut Transaction,
        flag: NodeFlag,
        word: &str,
        pk: &[u8],
    ) -> Result<(), TxnError> {
        if word.is_empty() {
            return Ok(());
        }
        let terms = {
            let sign = word_sign(word);
            let mut cache = self.seg_cache.lock();
            match cache.get(&sign) {
                Some(terms) => terms.clone(),
                None => {
                    let terms = Arc::new(segment_text(word, self.segment_type));
                    cache.put(sign, terms.clone());
                    terms
                }
            }
        };
        for term in terms.iter() {
            let node = ReverseNode { key: pk.to_vec(), flag, weight: 0.0 };
            let bytes = bincode::serialize(&node)
                .map_err(|e| TxnError::Kv(KvError::Corruption(format!("encode node: {e}"))))?;
            txn.put_kv(l1_key(self.region_id, self.index_id, term, pk), bytes)?;
            self.inserted_nodes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    // ── Level merge ───────────────────────────────────────────────────────

    /// One background merge pass: fold every region-local L1 posting into
    /// its term's L2 list, then fold oversized L2 lists into L3.
    pub fn reverse_merge(&self, region: &RegionInfo) -> Result<(), KvError> {
        self.set_key_range(region.start_key.clone(), region.end_key.clone());
        let snapshot = self.engine.snapshot();
        let lower = level_prefix(self.region_id, self.index_id, LEVEL_1);
        let upper = level_prefix(self.region_id, self.index_id, LEVEL_1 + 1);

        // Group L1 postings by term; remember their keys for deletion.
        let mut current_term: Option<String> = None;
        let mut batch: Vec<(Vec<u8>, ReverseNode)> = Vec::new();
        let mut iter = snapshot.iter(Cf::Data, lower, Some(upper));
        while iter.valid() {
            let Some((term, _pk)) = parse_l1_key(iter.key()) else {
                warn!(region_id = self.region_id, "malformed L1 reverse key skipped");
                iter.next();
                continue;
            };
            let node: ReverseNode = bincode::deserialize(iter.value())
                .map_err(|e| KvError::Corruption(format!("decode L1 node: {e}")))?;
            if current_term.as_deref() != Some(term.as_str()) {
                if let Some(done) = current_term.take() {
                    self.merge_term(&done, std::mem::take(&mut batch))?;
                }
                current_term = Some(term);
            }
            batch.push((iter.key().to_vec(), node));
            iter.next();
        }
        if let Some(done) = current_term.take() {
            self.merge_term(&done, batch)?;
        }
        self.merge_passes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Merge one term's L1 postings into L2 (short engine txn), folding into
    /// L3 when the merged list crosses the threshold (second txn).
    fn merge_term(&self, term: &str, l1_entries: Vec<(Vec<u8>, ReverseNode)>) -> Result<(), KvError> {
        if l1_entries.is_empty() {
            return Ok(());
        }
        let l2_key = term_key(self.region_id, self.index_id, LEVEL_2, term);

        let mut txn = self.engine.begin(self.engine.internal_txn_id());
        let l1_list = ReverseList {
            nodes: l1_entries
                .iter()
                .filter(|(_, n)| self.pk_in_range(&n.key))
                .map(|(_, n)| n.clone())
                .collect(),
        };
        let l2_list: ReverseList = match txn.get(Cf::Data, &l2_key) {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| KvError::Corruption(format!("decode L2 list: {e}")))?,
            None => ReverseList::default(),
        };
        let merged = level_merge(&l1_list, &l2_list, false);
        let bytes = bincode::serialize(&merged)
            .map_err(|e| KvError::Corruption(format!("encode L2 list: {e}")))?;
        txn.put(Cf::Data, l2_key.clone(), bytes);
        for (key, _) in &l1_entries {
            txn.delete(Cf::Data, key.clone());
        }
        txn.commit()?;
        debug!(
            region_id = self.region_id,
            index_id = self.index_id,
            term,
            merged_len = merged.len(),
            "reverse L1→L2 merge"
        );

        if merged.len() >= self.second_level_length {
            let l3_key = term_key(self.region_id, self.index_id, LEVEL_3, term);
            let mut txn = self.engine.begin(self.engine.internal_txn_id());
            let l3_list: ReverseList = match txn.get(Cf::Data, &l3_key) {
                Some(bytes) => bincode::deserialize(&bytes)
                    .map_err(|e| KvError::Corruption(format!("decode L3 list: {e}")))?,
                None => ReverseList::default(),
            };
            let folded = level_merge(&merged, &l3_list, true);
            let bytes = bincode::serialize(&folded)
                .map_err(|e| KvError::Corruption(format!("encode L3 list: {e}")))?;
            txn.put(Cf::Data, l3_key.clone(), bytes);
            txn.delete(Cf::Data, l2_key);
            txn.commit()?;
            let mut cache = self.list_cache.lock();
            if folded.len() >= self.cached_list_length {
                cache.put(l3_key, Arc::new(folded));
            } else {
                cache.pop(&l3_key);
            }
        }
        Ok(())
    }

    // ── Read path ─────────────────────────────────────────────────────────

    fn read_level_list(
        &self,
        snapshot: &KvSnapshot,
        level: u8,
        term: &str,
        use_cache: bool,
    ) -> Result<Arc<ReverseList>, KvError> {
        let key = term_key(self.region_id, self.index_id, level, term);
        if use_cache {
            if let Some(hit) = self.list_cache.lock().get(&key) {
                return Ok(hit.clone());
            }
        }
        let list = match snapshot.get(Cf::Data, &key) {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| KvError::Corruption(format!("decode L{level} list: {e}")))?,
            None => ReverseList::default(),
        };
        let list = Arc::new(list);
        if use_cache && list.len() >= self.cached_list_length {
            self.list_cache.lock().put(key, list.clone());
        }
        Ok(list)
    }

    /// The two lists a reader needs: fresh (L1 merged over L2, or L2 alone
    /// on the fast path) and old (L3). L1 postings outside the region range
    /// are skipped.
    pub fn get_reverse_list_two(
        &self,
        snapshot: &KvSnapshot,
        term: &str,
        fast: bool,
    ) -> Result<(Arc<ReverseList>, Arc<ReverseList>), KvError> {
        let fresh = if fast {
            self.read_level_list(snapshot, LEVEL_2, term, false)?
        } else {
            let mut l1_nodes = Vec::new();
            let lower = l1_key(self.region_id, self.index_id, term, &[]);
            let mut upper = term_key(self.region_id, self.index_id, LEVEL_1, term);
            upper.push(0x01);
            let mut iter = snapshot.iter(Cf::Data, lower, Some(upper));
            while iter.valid() {
                let node: ReverseNode = bincode::deserialize(iter.value())
                    .map_err(|e| KvError::Corruption(format!("decode L1 node: {e}")))?;
                if self.pk_in_range(&node.key) {
                    l1_nodes.push(node);
                }
                iter.next();
            }
            let l2 = self.read_level_list(snapshot, LEVEL_2, term, false)?;
            Arc::new(level_merge(&ReverseList { nodes: l1_nodes }, &l2, false))
        };
        let old = self.read_level_list(snapshot, LEVEL_3, term, true)?;
        Ok((fresh, old))
    }

    /// A sorted posting stream for one term across all three levels.
    pub fn term_stream(
        &self,
        snapshot: &KvSnapshot,
        term: &str,
        fast: bool,
    ) -> Result<Box<dyn NodeStream>, KvError> {
        let (fresh, old) = self.get_reverse_list_two(snapshot, term, fast)?;
        let combined = level_merge(&fresh, &old, false);
        Ok(Box::new(VecStream::new(combined.nodes)))
    }

    /// Build a boolean executor for a query string: terms are segmented the
    /// same way the write path did and combined with AND or OR.
    pub fn create_executor(
        &self,
        snapshot: &KvSnapshot,
        query: &str,
        and_combine: bool,
        fast: bool,
    ) -> Result<Box<dyn NodeStream>, KvError> {
        let terms = segment_text(query, self.segment_type);
        let mut children: Vec<Box<dyn NodeStream>> = Vec::with_capacity(terms.len());
        for term in &terms {
            children.push(self.term_stream(snapshot, term, fast)?);
        }
        Ok(match children.len() {
            0 => Box::new(VecStream::new(Vec::new())),
            1 => children.remove(0),
            _ if and_combine => Box::new(AndExecutor::new(children)),
            _ => Box::new(OrExecutor::new(children)),
        })
    }

    /// Convenience wrapper returning only surviving documents.
    pub fn search(
        &self,
        snapshot: &KvSnapshot,
        query: &str,
        and_combine: bool,
        fast: bool,
    ) -> Result<ReverseSearcher, KvError> {
        Ok(ReverseSearcher { exe: self.create_executor(snapshot, query, and_combine, fast)? })
    }

    pub fn inserted_nodes(&self) -> u64 {
        self.inserted_nodes.load(Ordering::Relaxed)
    }

    pub fn merge_passes(&self) -> u64 {
        self.merge_passes.load(Ordering::Relaxed)
    }
}

/// Cursor over a boolean executor that filters suppressed postings.
pub struct ReverseSearcher {
    exe: Box<dyn NodeStream>,
}

impl ReverseSearcher {
    /// Next surviving document's primary-key bytes, in ascending order.
    pub fn next_pk(&mut self) -> Option<Vec<u8>> {
        while let Some(node) = self.exe.next_node() {
            if node.flag == NodeFlag::Normal {
                return Some(node.key);
            }
        }
        None
    }

    pub fn collect_pks(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(pk) = self.next_pk() {
            out.push(pk);
        }
        out
    }
}
