//! The ordered KV engine boundary.
//!
//! Two column families: `Data` holds row/index/posting keys under the
//! region-id prefix scheme, `Meta` holds the per-region durable records.
//! Transactions buffer writes, take pessimistic row locks on
//! `get_for_update`, and commit atomically together with whatever meta
//! records were staged into the same transaction.
//!
//! Snapshots copy the trees; that is acceptable for a reference engine —
//! the production deployment swaps in an external LSM store behind the same
//! surface, where snapshots are O(1).

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use talon_common::error::KvError;
use talon_common::types::TxnId;

/// Column family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Cf {
    Data,
    Meta,
}

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Default)]
struct EngineInner {
    data: Tree,
    meta: Tree,
}

impl EngineInner {
    fn tree(&self, cf: Cf) -> &Tree {
        match cf {
            Cf::Data => &self.data,
            Cf::Meta => &self.meta,
        }
    }

    fn tree_mut(&mut self, cf: Cf) -> &mut Tree {
        match cf {
            Cf::Data => &mut self.data,
            Cf::Meta => &mut self.meta,
        }
    }
}

/// Atomic multi-key mutation. `None` value = delete.
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<(Cf, Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, cf: Cf, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((cf, key, Some(value)));
    }

    pub fn delete(&mut self, cf: Cf, key: Vec<u8>) {
        self.ops.push((cf, key, None));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Process-wide ordered KV engine.
pub struct KvEngine {
    inner: RwLock<EngineInner>,
    /// Pessimistic row locks over data-cf keys.
    locks: Mutex<HashMap<Vec<u8>, TxnId>>,
    /// Allocator for engine-internal transactions (level merges, backfills).
    internal_txn_seq: AtomicU64,
    closed: AtomicBool,
    puts: AtomicU64,
    deletes: AtomicU64,
}

impl KvEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(EngineInner::default()),
            locks: Mutex::new(HashMap::new()),
            // High bit set so internal ids never collide with client txn ids.
            internal_txn_seq: AtomicU64::new(1 << 63),
            closed: AtomicBool::new(false),
            puts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> Result<(), KvError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KvError::EngineClosed);
        }
        Ok(())
    }

    /// Allocate an id for an engine-internal transaction.
    pub fn internal_txn_id(&self) -> TxnId {
        TxnId(self.internal_txn_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Begin a transaction owned by `owner`. The transaction reads from a
    /// snapshot taken here; `get_for_update` reads latest committed state.
    pub fn begin(self: &Arc<Self>, owner: TxnId) -> KvTransaction {
        KvTransaction {
            engine: self.clone(),
            owner,
            snapshot: self.snapshot(),
            writes: BTreeMap::new(),
            undo: Vec::new(),
            locked: Vec::new(),
            finished: false,
        }
    }

    /// Consistent point-in-time view of both column families.
    pub fn snapshot(&self) -> KvSnapshot {
        let inner = self.inner.read();
        KvSnapshot {
            data: Arc::new(inner.data.clone()),
            meta: Arc::new(inner.meta.clone()),
        }
    }

    pub fn get(&self, cf: Cf, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().tree(cf).get(key).cloned()
    }

    /// Apply a batch atomically.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<(), KvError> {
        self.check_open()?;
        let mut inner = self.inner.write();
        for (cf, key, value) in batch.ops {
            match value {
                Some(v) => {
                    inner.tree_mut(cf).insert(key, v);
                    self.puts.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    inner.tree_mut(cf).remove(&key);
                    self.deletes.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Remove every key in `[start, end)`; `end = None` means unbounded.
    pub fn delete_range(&self, cf: Cf, start: &[u8], end: Option<&[u8]>) -> u64 {
        let mut inner = self.inner.write();
        let tree = inner.tree_mut(cf);
        let keys: Vec<Vec<u8>> = match end {
            Some(end) => tree
                .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
                .map(|(k, _)| k.clone())
                .collect(),
            None => tree
                .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
                .map(|(k, _)| k.clone())
                .collect(),
        };
        let removed = keys.len() as u64;
        for k in keys {
            tree.remove(&k);
        }
        self.deletes.fetch_add(removed, Ordering::Relaxed);
        removed
    }

    /// Bulk-load pre-sorted entries (snapshot ingest path).
    pub fn ingest(&self, cf: Cf, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), KvError> {
        self.check_open()?;
        let mut inner = self.inner.write();
        let tree = inner.tree_mut(cf);
        for (k, v) in entries {
            tree.insert(k, v);
        }
        Ok(())
    }

    pub fn approximate_size(&self, cf: Cf, start: &[u8], end: Option<&[u8]>) -> u64 {
        let inner = self.inner.read();
        let tree = inner.tree(cf);
        let iter: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<u8>)>> = match end {
            Some(end) => {
                Box::new(tree.range::<[u8], _>((Bound::Included(start), Bound::Excluded(end))))
            }
            None => Box::new(tree.range::<[u8], _>((Bound::Included(start), Bound::Unbounded))),
        };
        iter.map(|(k, v)| (k.len() + v.len()) as u64).sum()
    }

    fn lock_key(&self, key: &[u8], owner: TxnId) -> Result<(), KvError> {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(holder) if *holder != owner => {
                Err(KvError::LockConflict { holder: *holder, wanter: owner })
            }
            Some(_) => Ok(()),
            None => {
                locks.insert(key.to_vec(), owner);
                Ok(())
            }
        }
    }

    fn unlock_keys(&self, keys: &[Vec<u8>], owner: TxnId) {
        let mut locks = self.locks.lock();
        for key in keys {
            if locks.get(key) == Some(&owner) {
                locks.remove(key);
            }
        }
    }
}

/// Immutable point-in-time view.
#[derive(Clone)]
pub struct KvSnapshot {
    data: Arc<Tree>,
    meta: Arc<Tree>,
}

impl KvSnapshot {
    fn tree(&self, cf: Cf) -> &Arc<Tree> {
        match cf {
            Cf::Data => &self.data,
            Cf::Meta => &self.meta,
        }
    }

    pub fn get(&self, cf: Cf, key: &[u8]) -> Option<Vec<u8>> {
        self.tree(cf).get(key).cloned()
    }

    /// Bounded forward iterator over `[lower, upper)`.
    pub fn iter(&self, cf: Cf, lower: Vec<u8>, upper: Option<Vec<u8>>) -> KvIter {
        KvIter::new(self.tree(cf).clone(), lower, upper, false)
    }

    /// Bounded backward iterator over `[lower, upper)`.
    pub fn iter_reverse(&self, cf: Cf, lower: Vec<u8>, upper: Option<Vec<u8>>) -> KvIter {
        KvIter::new(self.tree(cf).clone(), lower, upper, true)
    }

    /// Materialize a bounded range (snapshot backfill, meta scans).
    pub fn scan(&self, cf: Cf, lower: &[u8], upper: Option<&[u8]>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let tree = self.tree(cf);
        match upper {
            Some(upper) => tree
                .range::<[u8], _>((Bound::Included(lower), Bound::Excluded(upper)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => tree
                .range::<[u8], _>((Bound::Included(lower), Bound::Unbounded))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Cursor over a snapshot tree. Each step re-seeks from the current key, so
/// the iterator stays valid for the snapshot's whole lifetime.
pub struct KvIter {
    tree: Arc<Tree>,
    lower: Vec<u8>,
    upper: Option<Vec<u8>>,
    current: Option<(Vec<u8>, Vec<u8>)>,
    reverse: bool,
}

impl KvIter {
    fn new(tree: Arc<Tree>, lower: Vec<u8>, upper: Option<Vec<u8>>, reverse: bool) -> Self {
        let mut iter = KvIter { tree, lower, upper, current: None, reverse };
        iter.seek_to_start();
        iter
    }

    fn bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        let lower = Bound::Included(self.lower.as_slice());
        let upper = match &self.upper {
            Some(u) => Bound::Excluded(u.as_slice()),
            None => Bound::Unbounded,
        };
        (lower, upper)
    }

    fn seek_to_start(&mut self) {
        let (lo, hi) = self.bounds();
        let mut range = self.tree.range::<[u8], _>((lo, hi));
        self.current = if self.reverse {
            range.next_back().map(|(k, v)| (k.clone(), v.clone()))
        } else {
            range.next().map(|(k, v)| (k.clone(), v.clone()))
        };
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(k, _)| k.as_slice()).unwrap_or(&[])
    }

    pub fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }

    pub fn next(&mut self) {
        let Some((cur, _)) = self.current.take() else {
            return;
        };
        if self.reverse {
            let lo = Bound::Included(self.lower.as_slice());
            let hi = Bound::Excluded(cur.as_slice());
            self.current = self
                .tree
                .range::<[u8], _>((lo, hi))
                .next_back()
                .map(|(k, v)| (k.clone(), v.clone()));
        } else {
            let lo = Bound::Excluded(cur.as_slice());
            let hi = match &self.upper {
                Some(u) => Bound::Excluded(u.as_slice()),
                None => Bound::Unbounded,
            };
            self.current =
                self.tree.range::<[u8], _>((lo, hi)).next().map(|(k, v)| (k.clone(), v.clone()));
        }
    }
}

/// A buffered transaction over the engine.
pub struct KvTransaction {
    engine: Arc<KvEngine>,
    owner: TxnId,
    snapshot: KvSnapshot,
    /// Buffered writes; `None` = delete. Ordered so scans can merge.
    writes: BTreeMap<(Cf, Vec<u8>), Option<Vec<u8>>>,
    /// Undo log for savepoints: previous buffered state per touched key.
    /// Outer `None` = key was not buffered before this write.
    undo: Vec<((Cf, Vec<u8>), Option<Option<Vec<u8>>>)>,
    locked: Vec<Vec<u8>>,
    finished: bool,
}

impl KvTransaction {
    pub fn owner(&self) -> TxnId {
        self.owner
    }

    pub fn snapshot(&self) -> &KvSnapshot {
        &self.snapshot
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Read through the write buffer, falling back to the begin snapshot.
    pub fn get(&self, cf: Cf, key: &[u8]) -> Option<Vec<u8>> {
        match self.writes.get(&(cf, key.to_vec())) {
            Some(Some(v)) => Some(v.clone()),
            Some(None) => None,
            None => self.snapshot.get(cf, key),
        }
    }

    /// Lock the row and read the latest committed value (plus own writes).
    pub fn get_for_update(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        self.engine.check_open()?;
        self.engine.lock_key(key, self.owner)?;
        self.locked.push(key.to_vec());
        match self.writes.get(&(Cf::Data, key.to_vec())) {
            Some(Some(v)) => Ok(Some(v.clone())),
            Some(None) => Ok(None),
            None => Ok(self.engine.get(Cf::Data, key)),
        }
    }

    pub fn put(&mut self, cf: Cf, key: Vec<u8>, value: Vec<u8>) {
        let entry_key = (cf, key);
        let prev = self.writes.get(&entry_key).cloned();
        self.writes.insert(entry_key.clone(), Some(value));
        self.undo.push((entry_key, prev));
    }

    pub fn delete(&mut self, cf: Cf, key: Vec<u8>) {
        let entry_key = (cf, key);
        let prev = self.writes.get(&entry_key).cloned();
        self.writes.insert(entry_key.clone(), None);
        self.undo.push((entry_key, prev));
    }

    /// Savepoint: current undo-log position.
    pub fn mark(&self) -> usize {
        self.undo.len()
    }

    /// Roll the write buffer back to a savepoint. Locks stay held; they are
    /// released at commit/rollback like the underlying engine does.
    pub fn rollback_to_mark(&mut self, mark: usize) {
        while self.undo.len() > mark {
            let Some((entry_key, prev)) = self.undo.pop() else {
                break;
            };
            match prev {
                Some(v) => {
                    self.writes.insert(entry_key, v);
                }
                None => {
                    self.writes.remove(&entry_key);
                }
            }
        }
    }

    /// Merged forward iterator over the data cf: buffered writes overlay the
    /// begin snapshot.
    pub fn iter(&self, lower: Vec<u8>, upper: Option<Vec<u8>>) -> TxnIter {
        TxnIter::new(self, lower, upper, false)
    }

    pub fn iter_reverse(&self, lower: Vec<u8>, upper: Option<Vec<u8>>) -> TxnIter {
        TxnIter::new(self, lower, upper, true)
    }

    /// Apply all buffered writes atomically and release locks.
    pub fn commit(mut self) -> Result<(), KvError> {
        if self.finished {
            return Err(KvError::TxnFinished);
        }
        self.engine.check_open()?;
        let mut batch = WriteBatch::new();
        for ((cf, key), value) in std::mem::take(&mut self.writes) {
            match value {
                Some(v) => batch.put(cf, key, v),
                None => batch.delete(cf, key),
            }
        }
        self.engine.write_batch(batch)?;
        self.engine.unlock_keys(&self.locked, self.owner);
        self.locked.clear();
        self.finished = true;
        Ok(())
    }

    /// Discard all buffered writes and release locks.
    pub fn rollback(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.finished {
            self.engine.unlock_keys(&self.locked, self.owner);
            self.locked.clear();
            self.writes.clear();
            self.finished = true;
        }
    }
}

impl Drop for KvTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

/// Two-way merge of the txn write buffer and the begin snapshot.
pub struct TxnIter {
    snap: KvIter,
    /// Buffered (key, op) pairs inside the bounds, in scan order.
    writes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    write_pos: usize,
    current: Option<(Vec<u8>, Vec<u8>)>,
    reverse: bool,
}

impl TxnIter {
    fn new(txn: &KvTransaction, lower: Vec<u8>, upper: Option<Vec<u8>>, reverse: bool) -> Self {
        let snap = if reverse {
            txn.snapshot.iter_reverse(Cf::Data, lower.clone(), upper.clone())
        } else {
            txn.snapshot.iter(Cf::Data, lower.clone(), upper.clone())
        };
        let lo = (Cf::Data, lower);
        let mut writes: Vec<(Vec<u8>, Option<Vec<u8>>)> = match upper {
            Some(upper) => txn
                .writes
                .range(lo..(Cf::Data, upper))
                .map(|((_, k), v)| (k.clone(), v.clone()))
                .collect(),
            None => txn
                .writes
                .range(lo..)
                .take_while(|((cf, _), _)| *cf == Cf::Data)
                .map(|((_, k), v)| (k.clone(), v.clone()))
                .collect(),
        };
        if reverse {
            writes.reverse();
        }
        let mut iter = TxnIter { snap, writes, write_pos: 0, current: None, reverse };
        iter.advance();
        iter
    }

    fn advance(&mut self) {
        loop {
            let snap_key = self.snap.valid().then(|| self.snap.key().to_vec());
            let write = self.writes.get(self.write_pos).cloned();
            match (snap_key, write) {
                (None, None) => {
                    self.current = None;
                    return;
                }
                (Some(_), None) => {
                    self.current = Some((self.snap.key().to_vec(), self.snap.value().to_vec()));
                    self.snap.next();
                    return;
                }
                (None, Some((wk, wv))) => {
                    self.write_pos += 1;
                    if let Some(v) = wv {
                        self.current = Some((wk, v));
                        return;
                    }
                    // buffered delete of a key the snapshot no longer has
                }
                (Some(sk), Some((wk, wv))) => {
                    let write_first =
                        if self.reverse { wk.as_slice() > sk.as_slice() } else { wk.as_slice() < sk.as_slice() };
                    if wk == sk {
                        // Overlay wins; skip the snapshot version.
                        self.snap.next();
                        self.write_pos += 1;
                        if let Some(v) = wv {
                            self.current = Some((wk, v));
                            return;
                        }
                    } else if write_first {
                        self.write_pos += 1;
                        if let Some(v) = wv {
                            self.current = Some((wk, v));
                            return;
                        }
                    } else {
                        self.current = Some((self.snap.key().to_vec(), self.snap.value().to_vec()));
                        self.snap.next();
                        return;
                    }
                }
            }
        }
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(k, _)| k.as_slice()).unwrap_or(&[])
    }

    pub fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }

    pub fn next(&mut self) {
        self.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_direct(engine: &Arc<KvEngine>, key: &[u8], value: &[u8]) {
        let mut batch = WriteBatch::new();
        batch.put(Cf::Data, key.to_vec(), value.to_vec());
        engine.write_batch(batch).unwrap();
    }

    // ── Engine basics ─────────────────────────────────────────────────────

    #[test]
    fn test_write_batch_atomic_visibility() {
        let engine = KvEngine::new();
        let mut batch = WriteBatch::new();
        batch.put(Cf::Data, b"a".to_vec(), b"1".to_vec());
        batch.put(Cf::Meta, b"m".to_vec(), b"2".to_vec());
        engine.write_batch(batch).unwrap();
        assert_eq!(engine.get(Cf::Data, b"a"), Some(b"1".to_vec()));
        assert_eq!(engine.get(Cf::Meta, b"m"), Some(b"2".to_vec()));
        assert_eq!(engine.get(Cf::Data, b"m"), None);
    }

    #[test]
    fn test_delete_range_half_open() {
        let engine = KvEngine::new();
        for k in [b"a", b"b", b"c", b"d"] {
            put_direct(&engine, k, b"v");
        }
        let removed = engine.delete_range(Cf::Data, b"b", Some(b"d"));
        assert_eq!(removed, 2);
        assert!(engine.get(Cf::Data, b"a").is_some());
        assert!(engine.get(Cf::Data, b"b").is_none());
        assert!(engine.get(Cf::Data, b"c").is_none());
        assert!(engine.get(Cf::Data, b"d").is_some());
    }

    #[test]
    fn test_snapshot_isolation() {
        let engine = KvEngine::new();
        put_direct(&engine, b"k", b"old");
        let snap = engine.snapshot();
        put_direct(&engine, b"k", b"new");
        assert_eq!(snap.get(Cf::Data, b"k"), Some(b"old".to_vec()));
        assert_eq!(engine.get(Cf::Data, b"k"), Some(b"new".to_vec()));
    }

    // ── Iterators ─────────────────────────────────────────────────────────

    #[test]
    fn test_iter_bounds_forward_and_backward() {
        let engine = KvEngine::new();
        for k in [b"a", b"b", b"c", b"d"] {
            put_direct(&engine, k, b"v");
        }
        let snap = engine.snapshot();
        let mut it = snap.iter(Cf::Data, b"b".to_vec(), Some(b"d".to_vec()));
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(it.key().to_vec());
            it.next();
        }
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

        let mut it = snap.iter_reverse(Cf::Data, b"a".to_vec(), Some(b"c".to_vec()));
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(it.key().to_vec());
            it.next();
        }
        assert_eq!(keys, vec![b"b".to_vec(), b"a".to_vec()]);
    }

    // ── Transactions ──────────────────────────────────────────────────────

    #[test]
    fn test_txn_buffered_until_commit() {
        let engine = KvEngine::new();
        let mut txn = engine.begin(TxnId(1));
        txn.put(Cf::Data, b"x".to_vec(), b"1".to_vec());
        assert_eq!(engine.get(Cf::Data, b"x"), None);
        assert_eq!(txn.get(Cf::Data, b"x"), Some(b"1".to_vec()));
        txn.commit().unwrap();
        assert_eq!(engine.get(Cf::Data, b"x"), Some(b"1".to_vec()));
    }

    #[test]
    fn test_txn_rollback_discards() {
        let engine = KvEngine::new();
        let mut txn = engine.begin(TxnId(1));
        txn.put(Cf::Data, b"x".to_vec(), b"1".to_vec());
        txn.rollback();
        assert_eq!(engine.get(Cf::Data, b"x"), None);
    }

    #[test]
    fn test_get_for_update_conflict() {
        let engine = KvEngine::new();
        let mut t1 = engine.begin(TxnId(1));
        let mut t2 = engine.begin(TxnId(2));
        t1.get_for_update(b"row").unwrap();
        let err = t2.get_for_update(b"row").unwrap_err();
        assert!(matches!(err, KvError::LockConflict { .. }));
        t1.rollback();
        // Lock released; t2 can proceed now.
        assert!(t2.get_for_update(b"row").is_ok());
    }

    #[test]
    fn test_locks_released_on_drop() {
        let engine = KvEngine::new();
        {
            let mut t1 = engine.begin(TxnId(1));
            t1.get_for_update(b"row").unwrap();
        }
        let mut t2 = engine.begin(TxnId(2));
        assert!(t2.get_for_update(b"row").is_ok());
    }

    #[test]
    fn test_savepoint_rollback_restores_buffer() {
        let engine = KvEngine::new();
        put_direct(&engine, b"a", b"base");
        let mut txn = engine.begin(TxnId(1));
        txn.put(Cf::Data, b"a".to_vec(), b"first".to_vec());
        let mark = txn.mark();
        txn.put(Cf::Data, b"a".to_vec(), b"second".to_vec());
        txn.put(Cf::Data, b"b".to_vec(), b"new".to_vec());
        txn.rollback_to_mark(mark);
        assert_eq!(txn.get(Cf::Data, b"a"), Some(b"first".to_vec()));
        assert_eq!(txn.get(Cf::Data, b"b"), None);
        txn.commit().unwrap();
        assert_eq!(engine.get(Cf::Data, b"a"), Some(b"first".to_vec()));
        assert_eq!(engine.get(Cf::Data, b"b"), None);
    }

    #[test]
    fn test_txn_iter_overlays_writes() {
        let engine = KvEngine::new();
        put_direct(&engine, b"a", b"1");
        put_direct(&engine, b"b", b"2");
        put_direct(&engine, b"c", b"3");
        let mut txn = engine.begin(TxnId(1));
        txn.delete(Cf::Data, b"b".to_vec());
        txn.put(Cf::Data, b"bb".to_vec(), b"22".to_vec());
        txn.put(Cf::Data, b"a".to_vec(), b"10".to_vec());
        let mut it = txn.iter(b"a".to_vec(), None);
        let mut seen = Vec::new();
        while it.valid() {
            seen.push((it.key().to_vec(), it.value().to_vec()));
            it.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"10".to_vec()),
                (b"bb".to_vec(), b"22".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_txn_iter_reverse() {
        let engine = KvEngine::new();
        put_direct(&engine, b"a", b"1");
        put_direct(&engine, b"c", b"3");
        let mut txn = engine.begin(TxnId(1));
        txn.put(Cf::Data, b"b".to_vec(), b"2".to_vec());
        let mut it = txn.iter_reverse(b"a".to_vec(), None);
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(it.key().to_vec());
            it.next();
        }
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_ingest_bulk_load() {
        let engine = KvEngine::new();
        engine
            .ingest(Cf::Data, vec![(b"k1".to_vec(), b"v1".to_vec()), (b"k2".to_vec(), b"v2".to_vec())])
            .unwrap();
        assert_eq!(engine.get(Cf::Data, b"k1"), Some(b"v1".to_vec()));
        assert_eq!(engine.get(Cf::Data, b"k2"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_closed_engine_rejects_writes() {
        let engine = KvEngine::new();
        engine.close();
        let mut batch = WriteBatch::new();
        batch.put(Cf::Data, b"k".to_vec(), b"v".to_vec());
        assert!(matches!(engine.write_batch(batch), Err(KvError::EngineClosed)));
    }
}
