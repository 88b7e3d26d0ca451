// The engine's lock boundary and public surface.
//
// A memtable owns the mempool (with its payload arena), the heap file and
// the spatial index, funneling every path through one reader/writer lock.
// The cache's per-shard locks and the index's own lock are only ever held
// briefly inside a call, never across user code.
//
// Searches take the write lock even though the index itself only needs a
// read lock: resolving payload bytes reads through the mempool, which may
// fault a record in from disk and cache it.

use crate::common::{BlockAddress, RecordId};
use crate::error::Result;
use crate::mempool::MemPool;
use crate::spatial::index::{IndexOptions, SearchHit, SpatialIndex};
use crate::spatial::{BoundingBox, BoxManager};
use crate::storage::HeapFile;
use crate::Options;
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tracing::{debug, warn};

/// One record emitted by a search.
pub struct CallbackValue<'a> {
    pub bbox: &'a BoundingBox,
    pub data: &'a [u8],
    pub addr: BlockAddress,
    pub record: RecordId,
}

/// Search callback seam; return `false` to stop the traversal. Callbacks
/// run under the memtable lock and must not call back into the memtable.
pub trait RecordCallback {
    fn process(&mut self, value: &CallbackValue<'_>) -> bool;
}

impl<F: FnMut(&CallbackValue<'_>) -> bool> RecordCallback for F {
    fn process(&mut self, value: &CallbackValue<'_>) -> bool {
        self(value)
    }
}

enum SearchKind {
    Overlap,
    ContainsRange,
    Cover,
}

struct Inner {
    pool: MemPool,
    heap: HeapFile,
    index: SpatialIndex,
}

pub struct MemTable {
    opts: Options,
    bm: BoxManager,
    inner: RwLock<Inner>,
}

// SAFETY: the raw-pointer views inside the mempool only reference the
// arena owned by the same `Inner`; arena chunks are heap-allocated, never
// move, and are only dereferenced while the RwLock is held.
unsafe impl Send for MemTable {}
unsafe impl Sync for MemTable {}

impl MemTable {
    /// Opens (or creates) the engine in `opts.data_dir`, reloading the
    /// spatial index file when one exists.
    pub fn open(opts: Options) -> Result<Self> {
        opts.validate()?;
        std::fs::create_dir_all(&opts.data_dir)?;
        let bm = BoxManager::new(opts.dimension)?;
        let heap = HeapFile::open(
            opts.heap_path(),
            opts.page_bytes,
            opts.cache_total_charge,
            opts.cache_shard_bits,
        )?;

        let index_opts = IndexOptions {
            dimension: opts.dimension,
            max_children: opts.max_children,
            min_children: opts.min_children,
            page_bytes: opts.page_bytes,
        };
        let mut pool = MemPool::new();
        let index_path = opts.index_path();
        let index = if index_path.exists() {
            SpatialIndex::load(&index_path, index_opts, |addr| pool.register(addr))?
        } else {
            SpatialIndex::new(index_opts)?
        };
        debug!(
            data_dir = %opts.data_dir.display(),
            entries = index.len(),
            "opened memtable"
        );
        Ok(Self {
            opts,
            bm,
            inner: RwLock::new(Inner { pool, heap, index }),
        })
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Number of indexed records.
    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffers `bytes` in the mempool and indexes it under the box given
    /// by `edges`. The record stays unsigned until the next flush.
    pub fn insert(&self, edges: &[(f64, f64)], bytes: &[u8]) -> Result<RecordId> {
        let bbox = self.bm.from_edges(edges)?;
        let mut inner = self.inner.write();
        let Inner { pool, index, .. } = &mut *inner;
        let id = pool.insert(bytes);
        index.insert(&bbox, id)?;
        Ok(id)
    }

    /// Unindexes the record and schedules its storage for release on the
    /// next flush (unsigned records are simply discarded). Returns whether
    /// the record was present.
    pub fn remove(&self, edges: &[(f64, f64)], id: RecordId) -> Result<bool> {
        let bbox = self.bm.from_edges(edges)?;
        let mut inner = self.inner.write();
        let Inner { pool, index, .. } = &mut *inner;
        let found = index.remove(&bbox, id)?;
        if found {
            let addr = pool.addr(id)?;
            if addr.is_signed() {
                pool.delete(addr);
            } else {
                pool.discard_unsigned(id)?;
            }
        }
        Ok(found)
    }

    /// Reads a record's bytes by heap address through the mempool cache.
    pub fn get(&self, addr: BlockAddress) -> Result<Vec<u8>> {
        let mut inner = self.inner.write();
        let Inner { pool, heap, .. } = &mut *inner;
        let id = pool.get(addr, heap)?;
        pool.fetch(id, heap).map(|b| b.to_vec())
    }

    /// Emits every record whose box overlaps the query box.
    pub fn search_overlap<C: RecordCallback>(
        &self,
        edges: &[(f64, f64)],
        cb: &mut C,
    ) -> Result<()> {
        self.search_with(edges, cb, SearchKind::Overlap)
    }

    /// Emits every record whose box covers the query box.
    pub fn search_contains_range<C: RecordCallback>(
        &self,
        edges: &[(f64, f64)],
        cb: &mut C,
    ) -> Result<()> {
        self.search_with(edges, cb, SearchKind::ContainsRange)
    }

    /// Emits every record whose box lies inside the query box.
    pub fn search_cover<C: RecordCallback>(
        &self,
        edges: &[(f64, f64)],
        cb: &mut C,
    ) -> Result<()> {
        self.search_with(edges, cb, SearchKind::Cover)
    }

    fn search_with<C: RecordCallback>(
        &self,
        edges: &[(f64, f64)],
        cb: &mut C,
        kind: SearchKind,
    ) -> Result<()> {
        let query = self.bm.from_edges(edges)?;
        let mut inner = self.inner.write();
        let Inner { pool, heap, index } = &mut *inner;
        let mut visit = |hit: SearchHit<'_>| -> bool {
            let addr = match pool.addr(hit.record) {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(error = %e, "skipping entry with unknown record");
                    return true;
                }
            };
            match pool.fetch(hit.record, heap) {
                Ok(data) => cb.process(&CallbackValue {
                    bbox: hit.bbox,
                    data,
                    addr,
                    record: hit.record,
                }),
                Err(e) => {
                    // An unreadable payload skips the entry; the traversal
                    // itself keeps going.
                    warn!(error = %e, "skipping unreadable record");
                    true
                }
            }
        };
        match kind {
            SearchKind::Overlap => index.search_overlap(&query, &mut visit),
            SearchKind::ContainsRange => index.search_contains_range(&query, &mut visit),
            SearchKind::Cover => index.search_cover(&query, &mut visit),
        }
    }

    /// Persists everything: deferred frees are applied (compacting under
    /// pressure), unsigned records receive their addresses, and the index
    /// and heap files are written. Returns whether compaction moved any
    /// records.
    pub fn flush(&self) -> Result<bool> {
        let mut inner = self.inner.write();
        let Inner { pool, heap, index } = &mut *inner;
        let compacted = pool.flush(heap)?;
        index.save(self.opts.index_path(), |id| {
            pool.addr(id).unwrap_or(BlockAddress::UNSIGNED)
        })?;
        heap.save()?;
        debug!(
            memory_usage = pool.memory_usage(),
            compacted, "flushed memtable"
        );
        Ok(compacted)
    }

    /// Flushes and drops the engine.
    pub fn close(self) -> Result<()> {
        self.flush().map(|_| ())
    }

    /// Bytes held by the payload arena.
    pub fn memory_usage(&self) -> usize {
        self.inner.read().pool.memory_usage()
    }

    pub fn spatial_index(&self) -> MappedRwLockReadGuard<'_, SpatialIndex> {
        RwLockReadGuard::map(self.inner.read(), |inner| &inner.index)
    }

    pub fn mempool(&self) -> MappedRwLockReadGuard<'_, MemPool> {
        RwLockReadGuard::map(self.inner.read(), |inner| &inner.pool)
    }

    pub fn mempool_mut(&self) -> MappedRwLockWriteGuard<'_, MemPool> {
        RwLockWriteGuard::map(self.inner.write(), |inner| &mut inner.pool)
    }
}
