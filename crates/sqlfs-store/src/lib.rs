//! # sqlfs-store
//!
//! Content-addressable storage engine for SQLFS.
//!
//! Every stored byte sequence becomes a refcounted [`UniqueFile`] record
//! keyed by its BLAKE3 digest. Identical content is stored once; filesystem
//! nodes share it through reference counts. Two tiers keep the backing
//! store's row count in check:
//!
//! - content of 2 MiB and above is streamed to an independently addressable
//!   blob, one `file_storage` row per record;
//! - smaller content is packed into shared `file_storage_sparse` rows
//!   (up to 256 slots and 16 MiB per row), with freed slots recycled before
//!   rows grow, so churn does not inflate the table.
//!
//! Reaching refcount zero physically deletes the record and its bytes; there
//! is no background garbage collection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use sqlfs_backend::{BackendError, BlobRef, SqlBackend, Value};

/// Content strictly below this size is packed into sparse rows.
pub const SPARSE_THRESHOLD: usize = 2 * 1024 * 1024;

/// Aggregate byte cap of one sparse row.
pub const SPARSE_ROW_BYTE_LIMIT: u64 = 16 * 1024 * 1024;

/// Slot cap of one sparse row.
pub const SPARSE_ROW_SLOT_LIMIT: usize = 256;

/// Blob write chunk; caps peak memory while streaming, nothing more.
const WRITE_CHUNK: usize = 512 * 1024;

/// Blob read chunk.
const READ_CHUNK: usize = 2 * 1024 * 1024;

/// Errors from content store operations.
///
/// Unknown content ids are deliberately *not* an error: `retrieve` returns
/// empty bytes and `release`/`add_reference` return `false`, so callers
/// check results instead of catching failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Stable handle of one deduplicated byte sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub Uuid);

impl ContentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle of one sparse container row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RowId(Uuid);

impl RowId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Where a record's bytes physically live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    /// Independently streamed blob.
    Large { blob: BlobRef },
    /// One slot of a shared sparse row.
    Sparse { row: RowId, slot: usize },
}

/// In-memory index entry for one content record.
#[derive(Debug, Clone)]
struct UniqueFile {
    id: ContentId,
    size: u64,
    refcount: u64,
    hash: String,
    location: Location,
}

/// Bookkeeping for one sparse row. Contents stay in the backing store.
#[derive(Debug, Clone)]
struct SparseRow {
    /// Sum of live slot sizes.
    size: u64,
    /// Live slot count.
    count: usize,
    /// Total allocated slots, live or freed; the next append index.
    slots: usize,
    /// Indices vacated by deletion, reused before appending.
    free: Vec<usize>,
}

#[derive(Default)]
struct StoreState {
    files: HashMap<ContentId, UniqueFile>,
    by_hash: HashMap<String, ContentId>,
    rows: HashMap<RowId, SparseRow>,
}

/// Aggregate counters over the live index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub large_records: u64,
    pub sparse_records: u64,
    pub sparse_rows: u64,
    /// Logical bytes across live records (deduplicated).
    pub total_bytes: u64,
}

/// The content store service. All slot and index mutation happens under one
/// internal lock; callers never need to serialize around it.
pub struct ContentStore {
    backend: Arc<dyn SqlBackend>,
    state: Mutex<StoreState>,
}

fn content_digest(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

fn nil_id() -> String {
    Uuid::nil().to_string()
}

impl ContentStore {
    /// Load the index of all stored records from the backing store.
    pub fn load(backend: Arc<dyn SqlBackend>) -> Result<Self> {
        let mut state = StoreState::default();

        let rows = backend.execute(
            "SELECT id, size, refcount, hash, blob_ref FROM file_storage",
            &[],
        )?;
        for row in rows {
            let parsed = (|| {
                let id = ContentId::parse(row.first()?.as_str()?)?;
                let size = u64::try_from(row.get(1)?.as_i64()?).ok()?;
                let refcount = u64::try_from(row.get(2)?.as_i64()?).ok()?;
                let hash = row.get(3)?.as_str()?.to_string();
                let blob = BlobRef(Uuid::parse_str(row.get(4)?.as_str()?).ok()?);
                Some((id, size, refcount, hash, blob))
            })();
            let Some((id, size, refcount, hash, blob)) = parsed else {
                warn!("skipping malformed file_storage row");
                continue;
            };
            state.by_hash.insert(hash.clone(), id);
            state.files.insert(
                id,
                UniqueFile {
                    id,
                    size,
                    refcount,
                    hash,
                    location: Location::Large { blob },
                },
            );
        }

        let rows = backend.execute(
            "SELECT row_id, aggregate_size, aggregate_count, sub_ids, sub_sizes, \
             sub_refcounts, sub_hashes, free_slots FROM file_storage_sparse",
            &[],
        )?;
        for row in rows {
            let parsed = (|| {
                let row_id = RowId(Uuid::parse_str(row.first()?.as_str()?).ok()?);
                let size = u64::try_from(row.get(1)?.as_i64()?).ok()?;
                let count = usize::try_from(row.get(2)?.as_i64()?).ok()?;
                let ids = row.get(3)?.as_text_array()?.to_vec();
                let sizes = row.get(4)?.as_int_array()?.to_vec();
                let refcounts = row.get(5)?.as_int_array()?.to_vec();
                let hashes = row.get(6)?.as_text_array()?.to_vec();
                let free = row.get(7)?.as_int_array()?.to_vec();
                Some((row_id, size, count, ids, sizes, refcounts, hashes, free))
            })();
            let Some((row_id, size, count, ids, sizes, refcounts, hashes, free)) = parsed else {
                warn!("skipping malformed file_storage_sparse row");
                continue;
            };
            // A corrupt row may carry arrays of unequal length; truncate to
            // the shortest rather than abort the load.
            let slots = ids
                .len()
                .min(sizes.len())
                .min(refcounts.len())
                .min(hashes.len());
            if slots < ids.len() {
                warn!(row = %row_id.0, "sparse row arrays disagree, truncating to {slots} slots");
            }
            let nil = nil_id();
            for slot in 0..slots {
                if ids[slot] == nil {
                    continue; // freed slot
                }
                let Some(id) = ContentId::parse(&ids[slot]) else {
                    continue;
                };
                let (Ok(sub_size), Ok(sub_refcount)) =
                    (u64::try_from(sizes[slot]), u64::try_from(refcounts[slot]))
                else {
                    continue;
                };
                state.by_hash.insert(hashes[slot].clone(), id);
                state.files.insert(
                    id,
                    UniqueFile {
                        id,
                        size: sub_size,
                        refcount: sub_refcount,
                        hash: hashes[slot].clone(),
                        location: Location::Sparse { row: row_id, slot },
                    },
                );
            }
            let free = free
                .into_iter()
                .filter_map(|i| usize::try_from(i).ok())
                .filter(|&i| i < slots)
                .collect();
            state.rows.insert(
                row_id,
                SparseRow {
                    size,
                    count,
                    slots,
                    free,
                },
            );
        }

        debug!(
            records = state.files.len(),
            sparse_rows = state.rows.len(),
            "content store loaded"
        );
        Ok(Self {
            backend,
            state: Mutex::new(state),
        })
    }

    /// Store `data`, returning the id of the (possibly pre-existing) record.
    ///
    /// Identical bytes are suppressed by digest: a second store of the same
    /// content bumps the existing record's refcount instead of writing bytes.
    #[instrument(skip(self, data), fields(len = data.len()), level = "debug")]
    pub fn store(&self, data: &[u8]) -> Result<ContentId> {
        let hash = content_digest(data);
        let mut state = self.state.lock();

        if let Some(&id) = state.by_hash.get(&hash) {
            debug!(%id, "dedup hit");
            self.bump(&mut state, id)?;
            return Ok(id);
        }

        if data.len() < SPARSE_THRESHOLD {
            self.store_sparse(&mut state, data, hash)
        } else {
            self.store_large(&mut state, data, hash)
        }
    }

    /// Fetch a record's bytes. Unknown ids read as empty, not as an error.
    #[instrument(skip(self), level = "debug")]
    pub fn retrieve(&self, id: ContentId) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let Some(file) = state.files.get(&id) else {
            return Ok(Vec::new());
        };
        match file.location {
            Location::Sparse { row, slot } => {
                let rows = self.backend.execute(
                    "SELECT sub_contents[$1] FROM file_storage_sparse WHERE row_id = $2",
                    &[
                        Value::Int(slot as i64),
                        Value::Text(row.0.to_string()),
                    ],
                )?;
                Ok(rows
                    .first()
                    .and_then(|r| r.first())
                    .and_then(|v| v.as_bytes())
                    .map(|b| b.to_vec())
                    .unwrap_or_default())
            }
            Location::Large { blob } => {
                let mut reader = match self.backend.open_blob_read(blob) {
                    Ok(r) => r,
                    // Blob vanished underneath a live record; tolerate as empty.
                    Err(BackendError::BlobNotFound(_)) => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                };
                let mut data = Vec::with_capacity(file.size as usize);
                loop {
                    let chunk = reader.read_chunk(READ_CHUNK)?;
                    if chunk.is_empty() {
                        break;
                    }
                    data.extend_from_slice(&chunk);
                }
                Ok(data)
            }
        }
    }

    /// Add one reference to an existing record without storing bytes.
    pub fn add_reference(&self, id: ContentId) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.files.contains_key(&id) {
            return Ok(false);
        }
        self.bump(&mut state, id)?;
        Ok(true)
    }

    /// Drop one reference; at zero the record and its bytes are deleted.
    #[instrument(skip(self), level = "debug")]
    pub fn release(&self, id: ContentId) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(file) = state.files.get_mut(&id) else {
            return Ok(false);
        };
        file.refcount = file.refcount.saturating_sub(1);
        if file.refcount > 0 {
            let file = file.clone();
            self.persist_refcount(&file)?;
            return Ok(true);
        }

        // Refcount reached zero: physically delete.
        let file = state.files.remove(&id).expect("checked above");
        state.by_hash.remove(&file.hash);
        match file.location {
            Location::Large { blob } => {
                match self.backend.unlink_blob(blob) {
                    Ok(()) | Err(BackendError::BlobNotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                self.backend.execute(
                    "DELETE FROM file_storage WHERE id = $1",
                    &[Value::Text(id.to_string())],
                )?;
                debug!(%id, "large record deleted");
            }
            Location::Sparse { row, slot } => {
                let Some(row_state) = state.rows.get_mut(&row) else {
                    warn!(%id, "sparse record points at unknown row");
                    return Ok(true);
                };
                row_state.size = row_state.size.saturating_sub(file.size);
                row_state.count = row_state.count.saturating_sub(1);
                if row_state.count == 0 {
                    state.rows.remove(&row);
                    self.backend.execute(
                        "DELETE FROM file_storage_sparse WHERE row_id = $1",
                        &[Value::Text(row.0.to_string())],
                    )?;
                    debug!(row = %row.0, "empty sparse row deleted");
                } else {
                    row_state.free.push(slot);
                    let free: Vec<i64> = row_state.free.iter().map(|&i| i as i64).collect();
                    let (size, count) = (row_state.size, row_state.count);
                    self.backend.execute(
                        "UPDATE file_storage_sparse SET aggregate_size = $1, aggregate_count = $2, \
                         sub_ids[$3] = $4, sub_sizes[$3] = $5, sub_refcounts[$3] = $6, \
                         sub_hashes[$3] = $7, sub_contents[$3] = $8, free_slots = $9 \
                         WHERE row_id = $10",
                        &[
                            Value::Int(size as i64),
                            Value::Int(count as i64),
                            Value::Int(slot as i64),
                            Value::Text(nil_id()),
                            Value::Int(0),
                            Value::Int(0),
                            Value::Text(String::new()),
                            Value::Bytes(Vec::new()),
                            Value::IntArray(free),
                            Value::Text(row.0.to_string()),
                        ],
                    )?;
                    debug!(%id, row = %row.0, slot, "sparse slot freed");
                }
            }
        }
        Ok(true)
    }

    /// Logical size of a record, if it is live.
    pub fn size_of(&self, id: ContentId) -> Option<u64> {
        self.state.lock().files.get(&id).map(|f| f.size)
    }

    /// Current refcount of a record, if it is live.
    pub fn refcount(&self, id: ContentId) -> Option<u64> {
        self.state.lock().files.get(&id).map(|f| f.refcount)
    }

    pub fn contains(&self, id: ContentId) -> bool {
        self.state.lock().files.contains_key(&id)
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        let mut stats = StoreStats {
            sparse_rows: state.rows.len() as u64,
            ..StoreStats::default()
        };
        for file in state.files.values() {
            stats.total_bytes += file.size;
            match file.location {
                Location::Large { .. } => stats.large_records += 1,
                Location::Sparse { .. } => stats.sparse_records += 1,
            }
        }
        stats
    }

    fn bump(&self, state: &mut StoreState, id: ContentId) -> Result<()> {
        let file = state.files.get_mut(&id).expect("caller checked liveness");
        file.refcount += 1;
        let file = file.clone();
        self.persist_refcount(&file)
    }

    fn persist_refcount(&self, file: &UniqueFile) -> Result<()> {
        match file.location {
            Location::Large { .. } => {
                self.backend.execute(
                    "UPDATE file_storage SET refcount = $1 WHERE id = $2",
                    &[
                        Value::Int(file.refcount as i64),
                        Value::Text(file.id.to_string()),
                    ],
                )?;
            }
            Location::Sparse { row, slot } => {
                self.backend.execute(
                    "UPDATE file_storage_sparse SET sub_refcounts[$1] = $2 WHERE row_id = $3",
                    &[
                        Value::Int(slot as i64),
                        Value::Int(file.refcount as i64),
                        Value::Text(row.0.to_string()),
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn store_large(&self, state: &mut StoreState, data: &[u8], hash: String) -> Result<ContentId> {
        let id = ContentId::generate();
        let blob = BlobRef::generate();
        self.backend.execute(
            "INSERT INTO file_storage (id, size, refcount, hash, blob_ref) \
             VALUES ($1, $2, $3, $4, $5)",
            &[
                Value::Text(id.to_string()),
                Value::Int(data.len() as i64),
                Value::Int(1),
                Value::Text(hash.clone()),
                Value::Text(blob.0.to_string()),
            ],
        )?;
        let mut writer = self.backend.open_blob_write(blob)?;
        for chunk in data.chunks(WRITE_CHUNK) {
            writer.write_chunk(chunk)?;
        }
        writer.finish()?;
        debug!(%id, size = data.len(), "large record stored");

        state.by_hash.insert(hash.clone(), id);
        state.files.insert(
            id,
            UniqueFile {
                id,
                size: data.len() as u64,
                refcount: 1,
                hash,
                location: Location::Large { blob },
            },
        );
        Ok(id)
    }

    fn store_sparse(&self, state: &mut StoreState, data: &[u8], hash: String) -> Result<ContentId> {
        let id = ContentId::generate();
        let size = data.len() as u64;

        // Prefer a row with a recorded free slot so delete/insert churn
        // recycles space instead of growing rows.
        let reusable = |r: &SparseRow| r.size + size <= SPARSE_ROW_BYTE_LIMIT;
        let target = state
            .rows
            .iter()
            .filter(|(_, r)| !r.free.is_empty() && reusable(r) && r.count < SPARSE_ROW_SLOT_LIMIT)
            .map(|(&row_id, _)| row_id)
            .next()
            .or_else(|| {
                state
                    .rows
                    .iter()
                    .filter(|(_, r)| r.slots < SPARSE_ROW_SLOT_LIMIT && reusable(r))
                    .map(|(&row_id, _)| row_id)
                    .next()
            });

        let (row_id, slot) = match target {
            Some(row_id) => {
                let row = state.rows.get_mut(&row_id).expect("selected above");
                let slot = match row.free.pop() {
                    Some(slot) => slot,
                    None => {
                        let slot = row.slots;
                        row.slots += 1;
                        slot
                    }
                };
                row.size += size;
                row.count += 1;
                let free: Vec<i64> = row.free.iter().map(|&i| i as i64).collect();
                let (row_size, row_count) = (row.size, row.count);
                self.backend.execute(
                    "UPDATE file_storage_sparse SET aggregate_size = $1, aggregate_count = $2, \
                     sub_ids[$3] = $4, sub_sizes[$3] = $5, sub_refcounts[$3] = $6, \
                     sub_hashes[$3] = $7, sub_contents[$3] = $8, free_slots = $9 \
                     WHERE row_id = $10",
                    &[
                        Value::Int(row_size as i64),
                        Value::Int(row_count as i64),
                        Value::Int(slot as i64),
                        Value::Text(id.to_string()),
                        Value::Int(size as i64),
                        Value::Int(1),
                        Value::Text(hash.clone()),
                        Value::Bytes(data.to_vec()),
                        Value::IntArray(free),
                        Value::Text(row_id.0.to_string()),
                    ],
                )?;
                debug!(%id, row = %row_id.0, slot, "sparse record packed");
                (row_id, slot)
            }
            None => {
                let row_id = RowId::generate();
                self.backend.execute(
                    "INSERT INTO file_storage_sparse (row_id, aggregate_size, aggregate_count, \
                     sub_ids, sub_sizes, sub_refcounts, sub_hashes, sub_contents, free_slots) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                    &[
                        Value::Text(row_id.0.to_string()),
                        Value::Int(size as i64),
                        Value::Int(1),
                        Value::TextArray(vec![id.to_string()]),
                        Value::IntArray(vec![size as i64]),
                        Value::IntArray(vec![1]),
                        Value::TextArray(vec![hash.clone()]),
                        Value::BytesArray(vec![data.to_vec()]),
                        Value::IntArray(Vec::new()),
                    ],
                )?;
                state.rows.insert(
                    row_id,
                    SparseRow {
                        size,
                        count: 1,
                        slots: 1,
                        free: Vec::new(),
                    },
                );
                debug!(%id, row = %row_id.0, "new sparse row");
                (row_id, 0)
            }
        };

        state.by_hash.insert(hash.clone(), id);
        state.files.insert(
            id,
            UniqueFile {
                id,
                size,
                refcount: 1,
                hash,
                location: Location::Sparse { row: row_id, slot },
            },
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlfs_backend::MemoryBackend;

    fn fresh_store() -> (Arc<MemoryBackend>, ContentStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = ContentStore::load(backend.clone()).unwrap();
        (backend, store)
    }

    /// Distinct small payloads for capacity tests.
    fn payload(i: usize, len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len.max(8)];
        v[..8].copy_from_slice(&(i as u64).to_le_bytes());
        v
    }

    #[test]
    fn test_dedup_idempotence() {
        let (_backend, store) = fresh_store();
        let a = store.store(b"same bytes").unwrap();
        let b = store.store(b"same bytes").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.refcount(a), Some(2));
        assert_eq!(store.retrieve(a).unwrap(), b"same bytes");
        assert_eq!(store.stats().sparse_records, 1);
    }

    #[test]
    fn test_dedup_large() {
        let (backend, store) = fresh_store();
        let data = payload(1, SPARSE_THRESHOLD + 1);
        let a = store.store(&data).unwrap();
        let b = store.store(&data).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.refcount(a), Some(2));
        assert_eq!(backend.blob_count(), 1);
        assert_eq!(store.retrieve(a).unwrap(), data);
    }

    #[test]
    fn test_refcount_to_zero_deletes() {
        let (backend, store) = fresh_store();
        let id = store.store(b"short lived").unwrap();
        assert!(store.add_reference(id).unwrap());
        assert!(store.release(id).unwrap());
        assert!(store.contains(id));
        assert!(store.release(id).unwrap());
        assert!(!store.contains(id));
        assert!(store.retrieve(id).unwrap().is_empty());
        assert_eq!(backend.table_len("file_storage_sparse"), 0);
        // Content can be stored again afterwards.
        let again = store.store(b"short lived").unwrap();
        assert_ne!(again, id);
        assert_eq!(store.refcount(again), Some(1));
    }

    #[test]
    fn test_large_release_unlinks_blob() {
        let (backend, store) = fresh_store();
        let data = payload(7, SPARSE_THRESHOLD);
        let id = store.store(&data).unwrap();
        assert_eq!(backend.blob_count(), 1);
        assert!(store.release(id).unwrap());
        assert_eq!(backend.blob_count(), 0);
        assert_eq!(backend.table_len("file_storage"), 0);
        assert!(store.retrieve(id).unwrap().is_empty());
    }

    #[test]
    fn test_release_unknown_is_false() {
        let (_backend, store) = fresh_store();
        assert!(!store.release(ContentId::generate()).unwrap());
        assert!(!store.add_reference(ContentId::generate()).unwrap());
    }

    #[test]
    fn test_retrieve_unknown_is_empty() {
        let (_backend, store) = fresh_store();
        assert!(store.retrieve(ContentId::generate()).unwrap().is_empty());
    }

    #[test]
    fn test_slot_reuse_bounds_row_growth() {
        let (backend, store) = fresh_store();
        let a = store.store(&payload(1, 64)).unwrap();
        let _b = store.store(&payload(2, 64)).unwrap();
        assert_eq!(store.stats().sparse_rows, 1);

        assert!(store.release(a).unwrap());
        // The freed slot is recycled; no second row appears.
        let c = store.store(&payload(3, 64)).unwrap();
        assert_eq!(store.stats().sparse_rows, 1);
        assert_eq!(backend.table_len("file_storage_sparse"), 1);
        assert_eq!(store.retrieve(c).unwrap(), payload(3, 64));
    }

    #[test]
    fn test_slot_limit_forces_new_row() {
        let (_backend, store) = fresh_store();
        for i in 0..SPARSE_ROW_SLOT_LIMIT {
            store.store(&payload(i, 16)).unwrap();
        }
        assert_eq!(store.stats().sparse_rows, 1);
        store.store(&payload(SPARSE_ROW_SLOT_LIMIT, 16)).unwrap();
        assert_eq!(store.stats().sparse_rows, 2);
    }

    #[test]
    fn test_byte_limit_forces_new_row() {
        let (_backend, store) = fresh_store();
        let chunk = 1536 * 1024; // 1.5 MiB, under the sparse threshold
        let fits = (SPARSE_ROW_BYTE_LIMIT / chunk as u64) as usize;
        for i in 0..fits {
            store.store(&payload(i, chunk)).unwrap();
        }
        assert_eq!(store.stats().sparse_rows, 1);
        store.store(&payload(fits, chunk)).unwrap();
        assert_eq!(store.stats().sparse_rows, 2);
    }

    #[test]
    fn test_empty_content() {
        let (_backend, store) = fresh_store();
        let id = store.store(b"").unwrap();
        assert_eq!(store.size_of(id), Some(0));
        assert!(store.retrieve(id).unwrap().is_empty());
        assert!(store.release(id).unwrap());
        assert!(!store.contains(id));
    }

    #[test]
    fn test_reload_preserves_records() {
        let backend = Arc::new(MemoryBackend::new());
        let small_id;
        let large_id;
        let large_data = payload(42, SPARSE_THRESHOLD + 123);
        {
            let store = ContentStore::load(backend.clone()).unwrap();
            small_id = store.store(b"persist me").unwrap();
            store.add_reference(small_id).unwrap();
            large_id = store.store(&large_data).unwrap();
        }
        let store = ContentStore::load(backend.clone()).unwrap();
        assert_eq!(store.refcount(small_id), Some(2));
        assert_eq!(store.retrieve(small_id).unwrap(), b"persist me");
        assert_eq!(store.retrieve(large_id).unwrap(), large_data);
        // Dedup survives the reload.
        assert_eq!(store.store(b"persist me").unwrap(), small_id);
        assert_eq!(store.refcount(small_id), Some(3));
    }

    #[test]
    fn test_reload_preserves_free_slots() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let store = ContentStore::load(backend.clone()).unwrap();
            let a = store.store(&payload(1, 64)).unwrap();
            store.store(&payload(2, 64)).unwrap();
            store.release(a).unwrap();
        }
        let store = ContentStore::load(backend.clone()).unwrap();
        store.store(&payload(3, 64)).unwrap();
        assert_eq!(store.stats().sparse_rows, 1);
    }

    #[test]
    fn test_load_truncates_mismatched_sparse_arrays() {
        let backend = Arc::new(MemoryBackend::new());
        let kept = ContentId::generate();
        let cut = ContentId::generate();
        // A row whose arrays disagree: two ids but only one size. The loader
        // must truncate to the shortest array and discard the out-of-range
        // free-slot index instead of aborting.
        backend
            .execute(
                "INSERT INTO file_storage_sparse (row_id, aggregate_size, aggregate_count, \
                 sub_ids, sub_sizes, sub_refcounts, sub_hashes, sub_contents, free_slots) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    Value::Text(Uuid::new_v4().to_string()),
                    Value::Int(4),
                    Value::Int(1),
                    Value::TextArray(vec![kept.to_string(), cut.to_string()]),
                    Value::IntArray(vec![4]),
                    Value::IntArray(vec![1, 1]),
                    Value::TextArray(vec![content_digest(b"abcd"), content_digest(b"efgh")]),
                    Value::BytesArray(vec![b"abcd".to_vec(), b"efgh".to_vec()]),
                    Value::IntArray(vec![5]),
                ],
            )
            .unwrap();

        let store = ContentStore::load(backend).unwrap();
        assert!(store.contains(kept));
        assert!(!store.contains(cut));
        assert_eq!(store.size_of(kept), Some(4));
        assert_eq!(store.retrieve(kept).unwrap(), b"abcd");
        let stats = store.stats();
        assert_eq!(stats.sparse_records, 1);
        assert_eq!(stats.sparse_rows, 1);
    }

    #[test]
    fn test_stats() {
        let (_backend, store) = fresh_store();
        store.store(b"tiny").unwrap();
        store.store(&payload(1, SPARSE_THRESHOLD)).unwrap();
        let stats = store.stats();
        assert_eq!(stats.sparse_records, 1);
        assert_eq!(stats.large_records, 1);
        assert_eq!(stats.total_bytes, 4 + SPARSE_THRESHOLD as u64);
    }
}
