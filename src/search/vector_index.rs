//! In-memory listing vector index with LVIX snapshot persistence.
//!
//! Snapshot format (little-endian):
//!
//! Header (variable size):
//!   Magic: "LVIX" (4 bytes)
//!   Version: u16
//!   EmbedderID length: u16
//!   EmbedderID: bytes
//!   Dimension: u32
//!   Count: u32
//!   HeaderCRC32: u32 (CRC32 of header bytes before this field)
//!
//! Rows:
//!   ListingID: i64, one per entry
//!
//! Vector slab:
//!   Count × Dimension × f32, contiguous, 32-byte aligned.
//!
//! Trailer:
//!   BodyCRC32: u32 (CRC32 of rows + slab, padding excluded)
//!
//! Concurrency: readers take a shared lock on the live state and always see a
//! batch either fully applied or not at all. Every mutation, and `persist`,
//! goes through an [`IndexWriter`], which owns the index's mutation lock.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use fxhash::FxHashMap;
use memmap2::Mmap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{ListingError, ListingResult};

pub const LVIX_MAGIC: [u8; 4] = *b"LVIX";
pub const LVIX_VERSION: u16 = 1;
pub const VECTOR_ALIGN_BYTES: usize = 32;
pub const ROW_SIZE_BYTES: usize = 8;
pub const VECTOR_INDEX_DIR: &str = "vector_index";

/// Below this many vectors, rayon overhead outweighs the parallel scan.
const PARALLEL_THRESHOLD: usize = 10_000;
const PARALLEL_CHUNK_SIZE: usize = 1024;

/// Set LISTINGS_PARALLEL_SEARCH=0 to force sequential scans.
static PARALLEL_SEARCH_ENABLED: once_cell::sync::Lazy<bool> = once_cell::sync::Lazy::new(|| {
    dotenvy::var("LISTINGS_PARALLEL_SEARCH")
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true)
});

pub fn snapshot_path(data_dir: &Path) -> PathBuf {
    data_dir.join(VECTOR_INDEX_DIR).join("listings.lvix")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvixHeader {
    pub version: u16,
    pub embedder_id: String,
    pub dimension: u32,
    pub count: u32,
}

impl LvixHeader {
    pub fn new(embedder_id: impl Into<String>, dimension: u32, count: u32) -> Result<Self> {
        let header = Self {
            version: LVIX_VERSION,
            embedder_id: embedder_id.into(),
            dimension,
            count,
        };
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<()> {
        let id_len = self.embedder_id.len();
        if id_len > u16::MAX as usize {
            bail!("embedder_id is too long: {id_len}");
        }
        if self.dimension == 0 {
            bail!("dimension must be non-zero");
        }
        Ok(())
    }

    pub fn header_len_bytes(&self) -> Result<usize> {
        self.validate()?;
        Ok(4 + 2 + 2 + self.embedder_id.len() + 4 + 4 + 4)
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        self.validate()?;
        let mut buf = Vec::new();

        buf.extend_from_slice(&LVIX_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());

        let id_bytes = self.embedder_id.as_bytes();
        let id_len = u16::try_from(id_bytes.len())
            .map_err(|_| anyhow!("embedder_id length out of range"))?;
        buf.extend_from_slice(&id_len.to_le_bytes());
        buf.extend_from_slice(id_bytes);

        buf.extend_from_slice(&self.dimension.to_le_bytes());
        buf.extend_from_slice(&self.count.to_le_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();

        writer.write_all(&buf)?;
        writer.write_all(&crc.to_le_bytes())?;
        Ok(buf.len() + 4)
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut header_bytes = Vec::new();

        let magic =
            read_exact_array::<4, _>(&mut reader, &mut header_bytes).context("read LVIX magic")?;
        if magic != LVIX_MAGIC {
            bail!("invalid LVIX magic: {:?}", magic);
        }

        let version = read_u16_le(&mut reader, &mut header_bytes).context("read LVIX version")?;
        if version != LVIX_VERSION {
            bail!("unsupported LVIX version: {version}");
        }

        let id_len = read_u16_le(&mut reader, &mut header_bytes)
            .context("read embedder id length")? as usize;
        let id_bytes =
            read_exact_vec(&mut reader, id_len, &mut header_bytes).context("read embedder id")?;
        let embedder_id = String::from_utf8(id_bytes).context("embedder id is not valid UTF-8")?;

        let dimension = read_u32_le(&mut reader, &mut header_bytes).context("read dimension")?;
        let count = read_u32_le(&mut reader, &mut header_bytes).context("read count")?;

        let crc_expected = read_u32_le_no_accum(&mut reader).context("read header crc")?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes);
        let crc_actual = hasher.finalize();
        if crc_actual != crc_expected {
            bail!("header CRC mismatch (expected {crc_expected:#010x}, got {crc_actual:#010x})");
        }

        let header = Self {
            version,
            embedder_id,
            dimension,
            count,
        };
        header.validate()?;
        Ok(header)
    }
}

/// Raw snapshot contents, exactly as stored (duplicate ids are not rejected here).
#[derive(Debug, Clone)]
pub struct SnapshotContents {
    pub header: LvixHeader,
    pub ids: Vec<i64>,
    pub slab: Vec<f32>,
}

impl SnapshotContents {
    pub fn vector(&self, slot: usize) -> Option<&[f32]> {
        let d = self.header.dimension as usize;
        self.slab.get(slot * d..(slot + 1) * d)
    }
}

/// Read and verify a snapshot file without interpreting its ids.
pub fn read_snapshot(path: &Path) -> Result<SnapshotContents> {
    if cfg!(target_endian = "big") {
        bail!("LVIX load is only supported on little-endian targets");
    }

    let file = File::open(path).with_context(|| format!("open LVIX file {path:?}"))?;
    let file_len = file.metadata().context("read LVIX metadata")?.len();
    if file_len == 0 {
        bail!("LVIX file is empty");
    }

    // SAFETY: the snapshot is only replaced by atomic rename, never written in place.
    let mmap = unsafe { Mmap::map(&file).context("mmap LVIX file")? };
    let mut cursor = Cursor::new(&mmap[..]);
    let header = LvixHeader::read_from(&mut cursor).context("read LVIX header")?;
    let header_len = header.header_len_bytes()?;
    let rows_len = rows_size_bytes(header.count)?;
    let slab_offset = vector_slab_offset_bytes(header_len, header.count)?;
    let slab_size = vector_slab_size_bytes(header.count, header.dimension)?;

    let expected_len = slab_offset
        .checked_add(slab_size)
        .and_then(|n| n.checked_add(4))
        .ok_or_else(|| anyhow!("LVIX file size overflow"))?;
    if file_len != expected_len as u64 {
        bail!("LVIX file size mismatch (expected {expected_len}, got {file_len})");
    }

    let rows_bytes = mmap
        .get(header_len..header_len + rows_len)
        .ok_or_else(|| anyhow!("rows out of bounds"))?;
    let slab_bytes = mmap
        .get(slab_offset..slab_offset + slab_size)
        .ok_or_else(|| anyhow!("slab out of bounds"))?;
    let trailer = mmap
        .get(slab_offset + slab_size..expected_len)
        .ok_or_else(|| anyhow!("trailer out of bounds"))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(rows_bytes);
    hasher.update(slab_bytes);
    let crc_actual = hasher.finalize();
    let crc_expected = u32::from_le_bytes(trailer.try_into()?);
    if crc_actual != crc_expected {
        bail!("body CRC mismatch (expected {crc_expected:#010x}, got {crc_actual:#010x})");
    }

    let ids = rows_bytes
        .chunks_exact(ROW_SIZE_BYTES)
        .map(|c| c.try_into().map(i64::from_le_bytes))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let slab = slab_bytes
        .chunks_exact(4)
        .map(|c| c.try_into().map(f32::from_le_bytes))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(SnapshotContents { header, ids, slab })
}

/// Atomically replace `path` with a snapshot of `ids`/`slab`.
fn write_snapshot(path: &Path, header: &LvixHeader, ids: &[i64], slab: &[f32]) -> Result<()> {
    if cfg!(target_endian = "big") {
        bail!("LVIX write is only supported on little-endian targets");
    }
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create snapshot directory {parent:?}"))?;

    let temp_path = path.with_extension("lvix.tmp");
    let mut file = File::create(&temp_path)
        .with_context(|| format!("create temp LVIX file {temp_path:?}"))?;

    let header_len = header.header_len_bytes()?;
    let written = header.write_to(&mut file)?;
    if written != header_len {
        bail!("header length mismatch: expected {header_len}, wrote {written}");
    }

    let mut hasher = crc32fast::Hasher::new();
    let mut rows = Vec::with_capacity(ids.len() * ROW_SIZE_BYTES);
    for id in ids {
        rows.extend_from_slice(&id.to_le_bytes());
    }
    hasher.update(&rows);
    file.write_all(&rows)?;

    let slab_offset = vector_slab_offset_bytes(header_len, header.count)?;
    let padding_len = slab_offset
        .checked_sub(header_len + rows.len())
        .ok_or_else(|| anyhow!("padding length underflow"))?;
    if padding_len > 0 {
        file.write_all(&vec![0u8; padding_len])?;
    }

    let mut slab_bytes = Vec::with_capacity(slab.len() * 4);
    for v in slab {
        slab_bytes.extend_from_slice(&v.to_le_bytes());
    }
    hasher.update(&slab_bytes);
    file.write_all(&slab_bytes)?;
    file.write_all(&hasher.finalize().to_le_bytes())?;

    file.sync_all().context("fsync LVIX temp file")?;
    std::fs::rename(&temp_path, path)
        .with_context(|| format!("rename LVIX temp file {temp_path:?}"))?;
    // Past the rename the new snapshot is live; only its directory entry may lag.
    if let Err(err) = sync_dir(parent) {
        warn!(path = %path.display(), error = %err, "fsync of snapshot directory failed after rename");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: i64,
    /// Squared L2 distance.
    pub distance: f32,
}

/// Embeddings validated against the index but not yet visible to readers.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    ids: Vec<i64>,
    vectors: Vec<Vec<f32>>,
}

impl PendingBatch {
    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Default)]
struct IndexState {
    ids: Vec<i64>,
    slab: Vec<f32>,
    slots: FxHashMap<i64, usize>,
}

impl IndexState {
    fn from_parts(ids: Vec<i64>, slab: Vec<f32>) -> ListingResult<Self> {
        let mut slots = FxHashMap::default();
        slots.reserve(ids.len());
        for (slot, id) in ids.iter().enumerate() {
            if slots.insert(*id, slot).is_some() {
                return Err(ListingError::Persistence(format!(
                    "snapshot contains duplicate id {id}"
                )));
            }
        }
        Ok(Self { ids, slab, slots })
    }

    fn vector(&self, slot: usize, dimension: usize) -> &[f32] {
        &self.slab[slot * dimension..(slot + 1) * dimension]
    }
}

#[derive(Debug)]
pub struct VectorIndex {
    dimension: usize,
    embedder_id: String,
    snapshot_path: Option<PathBuf>,
    state: RwLock<IndexState>,
    mutation: Mutex<()>,
}

impl VectorIndex {
    /// Empty index with no durable snapshot; `persist` is a no-op.
    pub fn new(dimension: usize, embedder_id: impl Into<String>) -> ListingResult<Self> {
        if dimension == 0 {
            return Err(ListingError::Validation("dimension must be non-zero".into()));
        }
        u32::try_from(dimension)
            .map_err(|_| ListingError::Validation("dimension out of range".into()))?;
        Ok(Self {
            dimension,
            embedder_id: embedder_id.into(),
            snapshot_path: None,
            state: RwLock::new(IndexState::default()),
            mutation: Mutex::new(()),
        })
    }

    /// Empty index bound to `path`; nothing is read from disk.
    pub fn with_snapshot(
        path: impl Into<PathBuf>,
        dimension: usize,
        embedder_id: impl Into<String>,
    ) -> ListingResult<Self> {
        let mut index = Self::new(dimension, embedder_id)?;
        index.snapshot_path = Some(path.into());
        Ok(index)
    }

    /// Load `path` if it exists, otherwise start empty bound to it.
    ///
    /// A snapshot whose dimension or embedder differs is refused: its vectors
    /// live in a different space.
    pub fn open(path: &Path, dimension: usize, embedder_id: &str) -> ListingResult<Self> {
        if !path.exists() {
            info!(path = %path.display(), dimension, "no vector snapshot yet; starting empty");
            return Self::with_snapshot(path, dimension, embedder_id);
        }
        let index = Self::load(path)?;
        if index.dimension != dimension {
            return Err(ListingError::Persistence(format!(
                "snapshot {} has dimension {}, expected {dimension}",
                path.display(),
                index.dimension
            )));
        }
        if index.embedder_id != embedder_id {
            return Err(ListingError::Persistence(format!(
                "snapshot {} was built with embedder '{}', configured embedder is '{embedder_id}'",
                path.display(),
                index.embedder_id
            )));
        }
        Ok(index)
    }

    /// Restore an index from a snapshot, reproducing its id -> vector mapping.
    pub fn load(path: &Path) -> ListingResult<Self> {
        let contents = read_snapshot(path).map_err(ListingError::persistence)?;
        let dimension = contents.header.dimension as usize;
        let state = IndexState::from_parts(contents.ids, contents.slab)?;
        info!(
            path = %path.display(),
            count = state.ids.len(),
            dimension,
            "loaded vector snapshot"
        );
        Ok(Self {
            dimension,
            embedder_id: contents.header.embedder_id,
            snapshot_path: Some(path.to_path_buf()),
            state: RwLock::new(state),
            mutation: Mutex::new(()),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embedder_id(&self) -> &str {
        &self.embedder_id
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    pub fn size(&self) -> usize {
        self.state.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn contains(&self, id: i64) -> bool {
        self.state.read().slots.contains_key(&id)
    }

    /// All ids in storage order.
    pub fn ids(&self) -> Vec<i64> {
        self.state.read().ids.clone()
    }

    pub fn reconstruct(&self, id: i64) -> ListingResult<Vec<f32>> {
        let state = self.state.read();
        let slot = state
            .slots
            .get(&id)
            .copied()
            .ok_or_else(|| ListingError::NotFound(format!("id {id} is not in the vector index")))?;
        Ok(state.vector(slot, self.dimension).to_vec())
    }

    /// Reconstruct several vectors under one consistent read.
    pub fn reconstruct_many(&self, ids: &[i64]) -> Vec<Option<Vec<f32>>> {
        let state = self.state.read();
        ids.iter()
            .map(|id| {
                state
                    .slots
                    .get(id)
                    .map(|slot| state.vector(*slot, self.dimension).to_vec())
            })
            .collect()
    }

    /// Up to `k` nearest neighbours, ascending by distance, ties by ascending id.
    pub fn search(&self, query: &[f32], k: usize) -> ListingResult<Vec<Neighbor>> {
        if query.len() != self.dimension {
            return Err(ListingError::Validation(format!(
                "query dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }
        let state = self.state.read();
        let k = k.min(state.ids.len());
        if k == 0 {
            return Ok(Vec::new());
        }
        let entries = if *PARALLEL_SEARCH_ENABLED && state.ids.len() >= PARALLEL_THRESHOLD {
            self.scan_parallel(&state, query, k)
        } else {
            scan_slots(&state, self.dimension, query, k, 0, state.ids.len())
        };
        Ok(into_sorted_neighbors(entries))
    }

    fn scan_parallel(&self, state: &IndexState, query: &[f32], k: usize) -> Vec<ScoredEntry> {
        let partial: Vec<Vec<ScoredEntry>> = (0..state.ids.len())
            .step_by(PARALLEL_CHUNK_SIZE)
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|start| {
                let end = (start + PARALLEL_CHUNK_SIZE).min(state.ids.len());
                scan_slots(state, self.dimension, query, k, start, end)
            })
            .collect();

        let mut heap = BinaryHeap::with_capacity(k.saturating_add(1));
        for entry in partial.into_iter().flatten() {
            heap.push(entry);
            if heap.len() > k {
                heap.pop();
            }
        }
        heap.into_vec()
    }

    /// Validate a batch against the live index without mutating it.
    pub fn stage(&self, ids: Vec<i64>, vectors: Vec<Vec<f32>>) -> ListingResult<PendingBatch> {
        {
            let state = self.state.read();
            validate_batch(&state, self.dimension, &vectors, &ids)?;
        }
        Ok(PendingBatch { ids, vectors })
    }

    /// Acquire the mutation lock. Held for the lifetime of the writer.
    pub fn writer(&self) -> IndexWriter<'_> {
        IndexWriter {
            index: self,
            _guard: self.mutation.lock(),
        }
    }

    /// `vectors[i]` is the embedding of `ids[i]`. All-or-nothing.
    pub fn add_with_ids(&self, vectors: &[Vec<f32>], ids: &[i64]) -> ListingResult<()> {
        self.writer().add_with_ids(vectors, ids)
    }

    pub fn persist(&self) -> ListingResult<()> {
        self.writer().persist()
    }
}

/// Exclusive mutation handle. Readers keep running while it is held.
pub struct IndexWriter<'a> {
    index: &'a VectorIndex,
    _guard: MutexGuard<'a, ()>,
}

impl IndexWriter<'_> {
    pub fn add_with_ids(&mut self, vectors: &[Vec<f32>], ids: &[i64]) -> ListingResult<()> {
        let dimension = self.index.dimension;
        {
            let state = self.index.state.read();
            validate_batch(&state, dimension, vectors, ids)?;
        }
        let mut state = self.index.state.write();
        state.ids.reserve(ids.len());
        state.slab.reserve(ids.len() * dimension);
        for (id, vector) in ids.iter().zip(vectors) {
            let slot = state.ids.len();
            state.ids.push(*id);
            state.slab.extend_from_slice(vector);
            state.slots.insert(*id, slot);
        }
        debug!(added = ids.len(), total = state.ids.len(), "vector batch applied");
        Ok(())
    }

    /// Make a staged batch visible to readers.
    pub fn merge(&mut self, pending: PendingBatch) -> ListingResult<()> {
        self.add_with_ids(&pending.vectors, &pending.ids)
    }

    /// Remove `ids`, returning how many were present.
    pub fn remove_ids(&mut self, ids: &[i64]) -> usize {
        let dimension = self.index.dimension;
        let mut state = self.index.state.write();
        let mut removed = 0;
        for id in ids {
            let Some(slot) = state.slots.remove(id) else {
                continue;
            };
            let last = state.ids.len() - 1;
            if slot != last {
                let moved_id = state.ids[last];
                state.ids[slot] = moved_id;
                state
                    .slab
                    .copy_within(last * dimension..(last + 1) * dimension, slot * dimension);
                state.slots.insert(moved_id, slot);
            }
            state.ids.pop();
            state.slab.truncate(last * dimension);
            removed += 1;
        }
        removed
    }

    /// Write the current state as the durable snapshot.
    pub fn persist(&mut self) -> ListingResult<()> {
        let Some(path) = self.index.snapshot_path.as_deref() else {
            debug!("vector index has no snapshot path; persist skipped");
            return Ok(());
        };
        let state = self.index.state.read();
        let count = u32::try_from(state.ids.len())
            .map_err(|_| ListingError::Persistence("entry count out of range".into()))?;
        let header = LvixHeader::new(
            self.index.embedder_id.clone(),
            self.index.dimension as u32,
            count,
        )
        .map_err(ListingError::persistence)?;
        write_snapshot(path, &header, &state.ids, &state.slab)
            .map_err(ListingError::persistence)?;
        debug!(path = %path.display(), count, "vector snapshot persisted");
        Ok(())
    }

    /// Replace the live state with the last durable snapshot.
    pub fn reload_from_snapshot(&mut self) -> ListingResult<()> {
        let path = self.index.snapshot_path.as_deref().ok_or_else(|| {
            ListingError::Persistence("vector index has no snapshot to reload".into())
        })?;
        let state = if path.exists() {
            let contents = read_snapshot(path).map_err(ListingError::persistence)?;
            if contents.header.dimension as usize != self.index.dimension {
                return Err(ListingError::Persistence(format!(
                    "snapshot dimension {} does not match index dimension {}",
                    contents.header.dimension, self.index.dimension
                )));
            }
            IndexState::from_parts(contents.ids, contents.slab)?
        } else {
            warn!(path = %path.display(), "snapshot missing during reload; resetting to empty");
            IndexState::default()
        };
        let count = state.ids.len();
        *self.index.state.write() = state;
        info!(path = %path.display(), count, "vector index reloaded from snapshot");
        Ok(())
    }
}

fn validate_batch(
    state: &IndexState,
    dimension: usize,
    vectors: &[Vec<f32>],
    ids: &[i64],
) -> ListingResult<()> {
    if vectors.len() != ids.len() {
        return Err(ListingError::IndexMutation(format!(
            "vector/id count mismatch: {} vectors, {} ids",
            vectors.len(),
            ids.len()
        )));
    }
    let mut seen = HashSet::with_capacity(ids.len());
    for (pos, (id, vector)) in ids.iter().zip(vectors).enumerate() {
        if vector.len() != dimension {
            return Err(ListingError::IndexMutation(format!(
                "vector {pos} (id {id}) has dimension {}, expected {dimension}",
                vector.len()
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(ListingError::IndexMutation(format!(
                "vector {pos} (id {id}) has a non-finite component"
            )));
        }
        if !seen.insert(*id) {
            return Err(ListingError::IndexMutation(format!(
                "id {id} appears twice in the batch"
            )));
        }
        if state.slots.contains_key(id) {
            return Err(ListingError::IndexMutation(format!(
                "id {id} is already in the index"
            )));
        }
    }
    Ok(())
}

fn scan_slots(
    state: &IndexState,
    dimension: usize,
    query: &[f32],
    k: usize,
    start: usize,
    end: usize,
) -> Vec<ScoredEntry> {
    let mut heap = BinaryHeap::with_capacity(k.min(end - start).saturating_add(1));
    for slot in start..end {
        heap.push(ScoredEntry {
            distance: l2_distance_squared(state.vector(slot, dimension), query),
            id: state.ids[slot],
        });
        if heap.len() > k {
            heap.pop();
        }
    }
    heap.into_vec()
}

fn into_sorted_neighbors(mut entries: Vec<ScoredEntry>) -> Vec<Neighbor> {
    entries.sort();
    entries
        .into_iter()
        .map(|e| Neighbor {
            id: e.id,
            distance: e.distance,
        })
        .collect()
}

/// Keep the `k` closest of `(id, distance)` pairs, ascending, ties by id.
pub fn top_k_closest<I>(candidates: I, k: usize) -> Vec<Neighbor>
where
    I: IntoIterator<Item = Neighbor>,
{
    if k == 0 {
        return Vec::new();
    }
    let candidates = candidates.into_iter();
    let mut heap = BinaryHeap::with_capacity(candidates.size_hint().0.min(k).saturating_add(1));
    for n in candidates {
        heap.push(ScoredEntry {
            distance: n.distance,
            id: n.id,
        });
        if heap.len() > k {
            heap.pop();
        }
    }
    into_sorted_neighbors(heap.into_vec())
}

/// Max-heap ordering on (distance, id): popping evicts the worst candidate.
#[derive(Debug, Clone)]
struct ScoredEntry {
    distance: f32,
    id: i64,
}

impl PartialEq for ScoredEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredEntry {}

impl PartialOrd for ScoredEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

pub fn rows_size_bytes(count: u32) -> Result<usize> {
    (count as usize)
        .checked_mul(ROW_SIZE_BYTES)
        .ok_or_else(|| anyhow!("row size overflow for count {count}"))
}

pub fn vector_slab_offset_bytes(header_len: usize, count: u32) -> Result<usize> {
    let rows_len = rows_size_bytes(count)?;
    let end = header_len
        .checked_add(rows_len)
        .ok_or_else(|| anyhow!("offset overflow"))?;
    Ok(align_up(end, VECTOR_ALIGN_BYTES))
}

pub fn vector_slab_size_bytes(count: u32, dimension: u32) -> Result<usize> {
    (count as usize)
        .checked_mul(dimension as usize)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| anyhow!("vector slab size overflow"))
}

fn align_up(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    let rem = value % align;
    if rem == 0 {
        value
    } else {
        value + (align - rem)
    }
}

#[inline]
fn l2_distance_squared_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// 8-wide SIMD squared L2. Reorders FP additions, so results differ from the
/// scalar kernel by ~1e-6 relative error.
#[inline]
fn l2_distance_squared_simd(a: &[f32], b: &[f32]) -> f32 {
    use wide::f32x8;

    let chunks_a = a.chunks_exact(8);
    let chunks_b = b.chunks_exact(8);
    let remainder_a = chunks_a.remainder();
    let remainder_b = chunks_b.remainder();

    let mut sum = f32x8::ZERO;
    for (ca, cb) in chunks_a.zip(chunks_b) {
        // SAFETY: chunks_exact guarantees exactly 8 elements.
        let arr_a: [f32; 8] = ca.try_into().unwrap();
        let arr_b: [f32; 8] = cb.try_into().unwrap();
        let diff = f32x8::from(arr_a) - f32x8::from(arr_b);
        sum += diff * diff;
    }

    let mut scalar_sum: f32 = sum.reduce_add();
    for (x, y) in remainder_a.iter().zip(remainder_b) {
        let d = x - y;
        scalar_sum += d * d;
    }
    scalar_sum
}

/// Set LISTINGS_SIMD_DISTANCE=0 to use the scalar kernel.
static SIMD_DISTANCE_ENABLED: once_cell::sync::Lazy<bool> = once_cell::sync::Lazy::new(|| {
    dotenvy::var("LISTINGS_SIMD_DISTANCE")
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true)
});

/// Squared Euclidean distance between equal-length vectors.
#[inline]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    if *SIMD_DISTANCE_ENABLED {
        l2_distance_squared_simd(a, b)
    } else {
        l2_distance_squared_scalar(a, b)
    }
}

fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

fn read_u16_le<R: Read>(reader: &mut R, header_bytes: &mut Vec<u8>) -> Result<u16> {
    let buf = read_exact_array::<2, _>(reader, header_bytes)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32_le<R: Read>(reader: &mut R, header_bytes: &mut Vec<u8>) -> Result<u32> {
    let buf = read_exact_array::<4, _>(reader, header_bytes)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u32_le_no_accum<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_exact_vec<R: Read>(
    reader: &mut R,
    len: usize,
    header_bytes: &mut Vec<u8>,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    header_bytes.extend_from_slice(&buf);
    Ok(buf)
}

fn read_exact_array<const N: usize, R: Read>(
    reader: &mut R,
    header_bytes: &mut Vec<u8>,
) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    header_bytes.extend_from_slice(&buf);
    Ok(buf)
}
