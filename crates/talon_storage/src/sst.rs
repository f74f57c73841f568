//! Snapshot file format.
//!
//! A region snapshot is two logical files: `data.sst` (the data-cf subset
//! under the region prefix) and `meta.sst` (the region's meta records).
//! An absent data file loads as an empty region.
//!
//! Layout:
//! ```text
//!   [magic "TSST"] [version: u32 LE] [crc32: u32 LE] [payload_len: u64 LE]
//!   [payload]  — bincode Vec<(key, value)>, sorted by key
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::kv::{Cf, KvEngine, KvSnapshot};
use crate::meta::MetaWriter;
use talon_common::error::KvError;
use tracing::{debug, warn};

const SST_MAGIC: &[u8; 4] = b"TSST";
const SST_FORMAT_VERSION: u32 = 1;

pub const DATA_SST_NAME: &str = "data.sst";
pub const META_SST_NAME: &str = "meta.sst";

/// Write one sorted-entry file.
pub struct SstWriter {
    path: PathBuf,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl SstWriter {
    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), entries: Vec::new() }
    }

    /// Entries must arrive in ascending key order.
    pub fn add(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), KvError> {
        if let Some((last, _)) = self.entries.last() {
            if *last >= key {
                return Err(KvError::SnapshotFile(format!(
                    "out-of-order key at entry {}",
                    self.entries.len()
                )));
            }
        }
        self.entries.push((key, value));
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Serialize and write the file. Returns the number of entries written.
    pub fn finish(self) -> Result<usize, KvError> {
        let payload = bincode::serialize(&self.entries)
            .map_err(|e| KvError::SnapshotFile(format!("serialize: {e}")))?;
        let crc = crc32fast::hash(&payload);
        let mut file = File::create(&self.path)?;
        file.write_all(SST_MAGIC)?;
        file.write_all(&SST_FORMAT_VERSION.to_le_bytes())?;
        file.write_all(&crc.to_le_bytes())?;
        file.write_all(&(payload.len() as u64).to_le_bytes())?;
        file.write_all(&payload)?;
        file.sync_all()?;
        Ok(self.entries.len())
    }
}

/// Read a whole sorted-entry file, validating magic, version, and checksum.
pub fn read_sst(path: &Path) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 20];
    file.read_exact(&mut header)
        .map_err(|_| KvError::SnapshotFile(format!("{}: truncated header", path.display())))?;
    if &header[..4] != SST_MAGIC {
        return Err(KvError::SnapshotFile(format!("{}: bad magic", path.display())));
    }
    let version = u32::from_le_bytes(header[4..8].try_into().unwrap_or([0; 4]));
    if version != SST_FORMAT_VERSION {
        return Err(KvError::SnapshotFile(format!(
            "{}: unsupported version {version}",
            path.display()
        )));
    }
    let expected_crc = u32::from_le_bytes(header[8..12].try_into().unwrap_or([0; 4]));
    let payload_len = u64::from_le_bytes(header[12..20].try_into().unwrap_or([0; 8])) as usize;
    let mut payload = vec![0u8; payload_len];
    file.read_exact(&mut payload)
        .map_err(|_| KvError::SnapshotFile(format!("{}: truncated payload", path.display())))?;
    let actual_crc = crc32fast::hash(&payload);
    if actual_crc != expected_crc {
        return Err(KvError::SnapshotFile(format!(
            "{}: checksum mismatch, expected {expected_crc:#010x} got {actual_crc:#010x}",
            path.display()
        )));
    }
    bincode::deserialize(&payload)
        .map_err(|e| KvError::SnapshotFile(format!("{}: payload: {e}", path.display())))
}

/// Write a region's `data.sst` + `meta.sst` into `dir` from a consistent
/// engine snapshot. Returns `(data_entries, meta_entries)`.
pub fn write_region_snapshot(
    snapshot: &KvSnapshot,
    meta: &MetaWriter,
    region_id: u64,
    dir: &Path,
) -> Result<(usize, usize), KvError> {
    fs::create_dir_all(dir)?;
    let start = region_id.to_be_bytes().to_vec();
    let end = (region_id + 1).to_be_bytes().to_vec();

    let mut data_writer = SstWriter::create(dir.join(DATA_SST_NAME));
    for (k, v) in snapshot.scan(Cf::Data, &start, Some(&end)) {
        data_writer.add(k, v)?;
    }
    let data_count = data_writer.finish()?;

    let mut meta_writer = SstWriter::create(dir.join(META_SST_NAME));
    for (k, v) in meta.region_meta_entries(snapshot, region_id) {
        meta_writer.add(k, v)?;
    }
    let meta_count = meta_writer.finish()?;
    debug!(region_id, data_count, meta_count, "snapshot files written");
    Ok((data_count, meta_count))
}

/// Ingest snapshot files from `dir`, clearing any stale state in the
/// region's key range first. An absent data file means an empty region.
pub fn load_region_snapshot(
    engine: &KvEngine,
    region_id: u64,
    dir: &Path,
) -> Result<(usize, usize), KvError> {
    let start = region_id.to_be_bytes().to_vec();
    let end = (region_id + 1).to_be_bytes().to_vec();
    engine.delete_range(Cf::Data, &start, Some(&end));
    engine.delete_range(Cf::Meta, &start, Some(&end));

    let data_path = dir.join(DATA_SST_NAME);
    let data_count = if data_path.exists() {
        let entries = read_sst(&data_path)?;
        let n = entries.len();
        engine.ingest(Cf::Data, entries)?;
        n
    } else {
        warn!(region_id, "no data file in snapshot, loading as empty region");
        0
    };

    let meta_path = dir.join(META_SST_NAME);
    let meta_count = if meta_path.exists() {
        let entries = read_sst(&meta_path)?;
        let n = entries.len();
        engine.ingest(Cf::Meta, entries)?;
        n
    } else {
        0
    };
    Ok((data_count, meta_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::WriteBatch;
    use talon_proto::RegionInfo;

    #[test]
    fn test_sst_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sst");
        let mut w = SstWriter::create(&path);
        w.add(b"a".to_vec(), b"1".to_vec()).unwrap();
        w.add(b"b".to_vec(), b"2".to_vec()).unwrap();
        assert_eq!(w.finish().unwrap(), 2);
        let entries = read_sst(&path).unwrap();
        assert_eq!(entries, vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SstWriter::create(dir.path().join("t.sst"));
        w.add(b"b".to_vec(), b"2".to_vec()).unwrap();
        assert!(w.add(b"a".to_vec(), b"1".to_vec()).is_err());
        assert!(w.add(b"b".to_vec(), b"dup".to_vec()).is_err());
    }

    #[test]
    fn test_corrupt_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sst");
        let mut w = SstWriter::create(&path);
        w.add(b"a".to_vec(), b"1".to_vec()).unwrap();
        w.finish().unwrap();
        // Flip one payload byte.
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();
        let err = read_sst(&path).unwrap_err();
        assert!(matches!(err, KvError::SnapshotFile(_)));
    }

    #[test]
    fn test_region_snapshot_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let engine = KvEngine::new();
        let meta = MetaWriter::new(engine.clone());
        // Region 3 data plus a neighbor that must not leak into the snapshot.
        let mut batch = WriteBatch::new();
        let mut key3 = 3u64.to_be_bytes().to_vec();
        key3.extend_from_slice(b"row1");
        batch.put(Cf::Data, key3.clone(), b"v1".to_vec());
        let mut key4 = 4u64.to_be_bytes().to_vec();
        key4.extend_from_slice(b"other");
        batch.put(Cf::Data, key4, b"x".to_vec());
        engine.write_batch(batch).unwrap();
        meta.init_region_info(&RegionInfo { region_id: 3, num_table_lines: 1, ..Default::default() })
            .unwrap();

        let snap = engine.snapshot();
        let (d, m) = write_region_snapshot(&snap, &meta, 3, dir.path()).unwrap();
        assert_eq!(d, 1);
        assert!(m >= 2);

        // Load into a fresh engine with stale garbage in range.
        let engine2 = KvEngine::new();
        let mut stale = 3u64.to_be_bytes().to_vec();
        stale.extend_from_slice(b"stale");
        let mut batch = WriteBatch::new();
        batch.put(Cf::Data, stale.clone(), b"junk".to_vec());
        engine2.write_batch(batch).unwrap();

        let (d2, m2) = load_region_snapshot(&engine2, 3, dir.path()).unwrap();
        assert_eq!(d2, 1);
        assert_eq!(m2, m);
        assert_eq!(engine2.get(Cf::Data, &key3), Some(b"v1".to_vec()));
        assert_eq!(engine2.get(Cf::Data, &stale), None);
        let meta2 = MetaWriter::new(engine2.clone());
        assert_eq!(meta2.read_num_table_lines(3).unwrap(), 1);
    }

    #[test]
    fn test_absent_data_file_is_empty_region() {
        let dir = tempfile::tempdir().unwrap();
        let engine = KvEngine::new();
        let (d, m) = load_region_snapshot(&engine, 9, dir.path()).unwrap();
        assert_eq!((d, m), (0, 0));
    }
}
