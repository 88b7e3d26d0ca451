// Record store bridging the spatial index and the paged heap.
//
// Records live in a slab addressed by `RecordId`; the index's leaf
// branches hold these ids, which stay valid across heap compaction
// because a moved record's address is rewritten in place. Three lazy
// sequences drive persistence: the unsigned FIFO (inserted records with
// no disk address yet), the signed map (address -> record, doubling as a
// read-through cache), and the freed list (deferred block releases).
//
// Payload bytes are copied into the arena on entry; views into the arena
// stay valid for the mempool's lifetime, which is what lets `data` return
// plain slices.

use crate::common::{AdjustEntry, BlockAddress, DataView, RecordId};
use crate::error::{Result, StoreError};
use crate::memory::Arena;
use crate::storage::HeapFile;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

pub struct SignableRecord {
    data: Option<DataView>,
    addr: BlockAddress,
}

pub struct MemPool {
    arena: Arena,
    records: Vec<SignableRecord>,
    unsigned: VecDeque<RecordId>,
    signed: BTreeMap<BlockAddress, RecordId>,
    freed: Vec<BlockAddress>,
}

impl MemPool {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            records: Vec::new(),
            unsigned: VecDeque::new(),
            signed: BTreeMap::new(),
            freed: Vec::new(),
        }
    }

    /// Copies `bytes` into the arena and queues the record for signing on
    /// the next flush. The returned id is what the spatial index stores.
    pub fn insert(&mut self, bytes: &[u8]) -> RecordId {
        let view = self.arena.allocate_bytes(bytes);
        let id = RecordId(self.records.len());
        self.records.push(SignableRecord {
            data: Some(view),
            addr: BlockAddress::UNSIGNED,
        });
        self.unsigned.push_back(id);
        id
    }

    /// The record's current address; unsigned records report page 0.
    pub fn addr(&self, id: RecordId) -> Result<BlockAddress> {
        self.record(id).map(|r| r.addr)
    }

    /// Cached payload bytes, if resident.
    pub fn data(&self, id: RecordId) -> Result<Option<&[u8]>> {
        // SAFETY: the view points into self.arena, alive for &self.
        Ok(self.record(id)?.data.as_ref().map(|v| unsafe { v.as_slice() }))
    }

    /// Payload bytes, reading through the heap file and caching in the
    /// arena on a miss.
    pub fn fetch(&mut self, id: RecordId, heap: &mut HeapFile) -> Result<&[u8]> {
        if self.record(id)?.data.is_none() {
            let addr = self.record(id)?.addr;
            if !addr.is_signed() {
                return Err(StoreError::Corruption(
                    "unsigned record holds no payload".into(),
                ));
            }
            let bytes = heap.get_data(addr)?;
            let view = self.arena.allocate_bytes(&bytes);
            self.records[id.0].data = Some(view);
        }
        match &self.record(id)?.data {
            // SAFETY: the view points into self.arena, alive for &self.
            Some(view) => Ok(unsafe { view.as_slice() }),
            None => Err(StoreError::Corruption("record lost its payload".into())),
        }
    }

    /// Looks an address up in the signed map, registering (and reading)
    /// the record on a miss.
    pub fn get(&mut self, addr: BlockAddress, heap: &mut HeapFile) -> Result<RecordId> {
        let id = self.register(addr)?;
        self.fetch(id, heap)?;
        Ok(id)
    }

    /// Registers a signed address without reading its payload; used when
    /// reloading the index, which only knows addresses.
    pub fn register(&mut self, addr: BlockAddress) -> Result<RecordId> {
        if !addr.is_signed() {
            return Err(StoreError::Corruption(
                "cannot register an unsigned block address".into(),
            ));
        }
        if let Some(&id) = self.signed.get(&addr) {
            return Ok(id);
        }
        let id = RecordId(self.records.len());
        self.records.push(SignableRecord { data: None, addr });
        self.signed.insert(addr, id);
        Ok(id)
    }

    /// Defers the release of `addr` to the next flush and returns it.
    pub fn delete(&mut self, addr: BlockAddress) -> BlockAddress {
        self.freed.push(addr);
        addr
    }

    /// Drops a not-yet-signed record from the signing queue so it is
    /// never written.
    pub fn discard_unsigned(&mut self, id: RecordId) -> Result<()> {
        if self.record(id)?.addr.is_signed() {
            return Err(StoreError::InvalidArgument(
                "record is already signed; delete its address instead".into(),
            ));
        }
        self.unsigned.retain(|&u| u != id);
        self.records[id.0].data = None;
        Ok(())
    }

    /// Applies deferred frees (with stress compaction), signs every
    /// queued record, and rewrites addresses moved by compaction.
    /// Returns whether compaction relocated anything.
    pub fn flush(&mut self, heap: &mut HeapFile) -> Result<bool> {
        let mut compacted = false;
        let mut adjusted = 0;

        let mut pending = std::mem::take(&mut self.freed);
        let mut i = 0;
        while i < pending.len() {
            let addr = pending[i];
            self.signed.remove(&addr);
            let mut adjusts: Vec<AdjustEntry> = Vec::new();
            compacted |= heap.free_block(addr, true, &mut adjusts)?;
            // Compaction may have moved blocks that later frees target.
            for adjust in &adjusts {
                for later in pending[i + 1..].iter_mut() {
                    if *later == adjust.old_addr {
                        *later = adjust.new_addr;
                    }
                }
            }
            adjusted += adjusts.len();
            self.apply_adjusts(&adjusts);
            i += 1;
        }

        let queued = std::mem::take(&mut self.unsigned);
        let signed_now = queued.len();
        for id in queued {
            let bytes = match &self.records[id.0].data {
                // SAFETY: the view points into self.arena; the copy is
                // made before any further arena allocation.
                Some(view) => unsafe { view.as_slice() }.to_vec(),
                None => {
                    return Err(StoreError::Corruption(
                        "unsigned record holds no payload".into(),
                    ))
                }
            };
            let addr = heap.add_record(&bytes)?;
            self.records[id.0].addr = addr;
            self.signed.insert(addr, id);
        }

        debug!(signed = signed_now, adjusted, compacted, "mempool flush");
        Ok(compacted)
    }

    /// Applies moves in report order so chained relocations (A -> B, then
    /// B -> C) land on the final address.
    fn apply_adjusts(&mut self, adjusts: &[AdjustEntry]) {
        for adjust in adjusts {
            if let Some(id) = self.signed.remove(&adjust.old_addr) {
                self.records[id.0].addr = adjust.new_addr;
                self.signed.insert(adjust.new_addr, id);
            }
        }
    }

    /// Bytes held by the payload arena.
    pub fn memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn unsigned_len(&self) -> usize {
        self.unsigned.len()
    }

    pub fn signed_len(&self) -> usize {
        self.signed.len()
    }

    pub fn pending_free_len(&self) -> usize {
        self.freed.len()
    }

    fn record(&self, id: RecordId) -> Result<&SignableRecord> {
        self.records.get(id.0).ok_or_else(|| {
            StoreError::OutOfRange(format!("record id {} out of range", id.0))
        })
    }
}

impl Default for MemPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_heap(dir: &TempDir) -> HeapFile {
        HeapFile::open(dir.path().join("heap.dat"), 4096, 4096 * 100, 2).unwrap()
    }

    #[test]
    fn test_insert_is_unsigned_until_flush() {
        let dir = TempDir::new().unwrap();
        let mut heap = open_heap(&dir);
        let mut pool = MemPool::new();

        let id = pool.insert(b"payload");
        assert_eq!(pool.addr(id).unwrap(), BlockAddress::UNSIGNED);
        assert_eq!(pool.unsigned_len(), 1);
        assert_eq!(pool.data(id).unwrap().unwrap(), b"payload");

        assert!(!pool.flush(&mut heap).unwrap());
        let addr = pool.addr(id).unwrap();
        assert!(addr.is_signed());
        assert_eq!(pool.unsigned_len(), 0);
        assert_eq!(pool.signed_len(), 1);
        assert_eq!(heap.get_data(addr).unwrap(), b"payload");
    }

    #[test]
    fn test_get_reads_through_heap() {
        let dir = TempDir::new().unwrap();
        let mut heap = open_heap(&dir);
        let addr = heap.add_record(b"on disk").unwrap();

        let mut pool = MemPool::new();
        let id = pool.get(addr, &mut heap).unwrap();
        assert_eq!(pool.fetch(id, &mut heap).unwrap(), b"on disk");
        // Second get resolves to the same cached record.
        assert_eq!(pool.get(addr, &mut heap).unwrap(), id);
        assert_eq!(pool.signed_len(), 1);
    }

    #[test]
    fn test_register_is_lazy() {
        let dir = TempDir::new().unwrap();
        let mut heap = open_heap(&dir);
        let addr = heap.add_record(b"lazy bytes").unwrap();

        let mut pool = MemPool::new();
        let id = pool.register(addr).unwrap();
        assert!(pool.data(id).unwrap().is_none());
        assert_eq!(pool.fetch(id, &mut heap).unwrap(), b"lazy bytes");
        assert!(pool.data(id).unwrap().is_some());
        assert!(pool.register(BlockAddress::UNSIGNED).is_err());
    }

    #[test]
    fn test_delete_defers_until_flush() {
        let dir = TempDir::new().unwrap();
        let mut heap = open_heap(&dir);
        let mut pool = MemPool::new();

        let id = pool.insert(b"doomed");
        pool.flush(&mut heap).unwrap();
        let addr = pool.addr(id).unwrap();

        pool.delete(addr);
        assert_eq!(pool.pending_free_len(), 1);
        // Still readable until the flush applies the free.
        assert_eq!(heap.get_data(addr).unwrap(), b"doomed");

        pool.flush(&mut heap).unwrap();
        assert_eq!(pool.pending_free_len(), 0);
        assert!(heap.get_data(addr).is_err());
    }

    #[test]
    fn test_discard_unsigned() {
        let dir = TempDir::new().unwrap();
        let mut heap = open_heap(&dir);
        let mut pool = MemPool::new();

        let keep = pool.insert(b"keep");
        let drop_ = pool.insert(b"drop");
        pool.discard_unsigned(drop_).unwrap();
        pool.flush(&mut heap).unwrap();

        assert!(pool.addr(keep).unwrap().is_signed());
        assert!(!pool.addr(drop_).unwrap().is_signed());
        assert_eq!(heap.total_records().unwrap(), 1);
        // Discarding a signed record is rejected.
        assert!(pool.discard_unsigned(keep).is_err());
    }

    #[test]
    fn test_flush_rewrites_compacted_addresses() {
        let dir = TempDir::new().unwrap();
        let mut heap = open_heap(&dir);
        let mut pool = MemPool::new();

        // Enough records that freeing every other one forces the page's
        // free list past the compaction threshold.
        let ids: Vec<RecordId> = (0..24).map(|i| pool.insert(&[i as u8; 16])).collect();
        pool.flush(&mut heap).unwrap();

        for id in ids.iter().step_by(2) {
            let addr = pool.addr(*id).unwrap();
            pool.delete(addr);
        }
        let compacted = pool.flush(&mut heap).unwrap();
        assert!(compacted);

        // Survivors are still readable at their rewritten addresses.
        for (i, id) in ids.iter().enumerate().skip(1).step_by(2) {
            let addr = pool.addr(*id).unwrap();
            assert!(addr.is_signed());
            assert_eq!(heap.get_data(addr).unwrap(), vec![i as u8; 16]);
            assert_eq!(pool.signed.get(&addr), Some(id));
        }
    }

    #[test]
    fn test_memory_usage_grows_with_payloads() {
        let mut pool = MemPool::new();
        let before = pool.memory_usage();
        pool.insert(&[0u8; 8192]);
        assert!(pool.memory_usage() > before);
    }

    #[test]
    fn test_unknown_record_id() {
        let pool = MemPool::new();
        assert!(matches!(
            pool.addr(RecordId(3)),
            Err(StoreError::OutOfRange(_))
        ));
    }
}
