// Paged heap manager.
//
// Owns the materialized working set of heap pages, a sharded read cache
// for pages that are only touched by reads, and the backing file. Records
// larger than a page's remaining tail space span consecutive pages: a
// segment with `is_append` set continues at offset 0 of the next page.
//
// File format: `last_page_id: u64` at offset 0, then each page image at
// `8 + (page_id - 1) * page_bytes`. Little-endian throughout.

use crate::cache::ShardedLruCache;
use crate::common::{AdjustEntry, BlockAddress, PageId, PageOffset};
use crate::error::{Result, StoreError};
use crate::storage::heap_page::{HeapPage, BLOCK_HEADER_BYTES, FREE_LIST_CAP};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const FILE_HEADER_BYTES: u64 = 8;

pub struct HeapFile {
    path: PathBuf,
    page_bytes: usize,
    last_page_id: PageId,
    pages: BTreeMap<PageId, HeapPage>,
    cache: ShardedLruCache<HeapPage>,
}

impl HeapFile {
    /// Opens the heap file, creating an empty one when missing.
    pub fn open<P: AsRef<Path>>(
        path: P,
        page_bytes: usize,
        cache_total_charge: usize,
        cache_shard_bits: u32,
    ) -> Result<Self> {
        HeapPage::data_capacity(page_bytes)?;
        let path = path.as_ref().to_path_buf();

        let last_page_id = match File::open(&path) {
            Ok(mut file) => {
                let mut header = [0u8; FILE_HEADER_BYTES as usize];
                file.read_exact(&mut header)?;
                u64::from_le_bytes(header)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut file = File::create(&path)?;
                file.write_all(&0u64.to_le_bytes())?;
                0
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            page_bytes,
            last_page_id,
            pages: BTreeMap::new(),
            cache: ShardedLruCache::new(cache_total_charge, cache_shard_bits),
        })
    }

    pub fn page_bytes(&self) -> usize {
        self.page_bytes
    }

    pub fn last_page_id(&self) -> PageId {
        self.last_page_id
    }

    fn cache_key(page_id: PageId) -> [u8; 8] {
        page_id.to_le_bytes()
    }

    fn create_page(&mut self) -> Result<PageId> {
        self.last_page_id += 1;
        let id = self.last_page_id;
        self.pages.insert(id, HeapPage::new(id, self.page_bytes)?);
        debug!(page_id = id, "created heap page");
        Ok(id)
    }

    /// Brings a page into the materialized set, pulling it out of the read
    /// cache (or off disk) if needed. Materialized pages are the mutable
    /// truth, so any cached copy is dropped.
    fn materialize(&mut self, page_id: PageId) -> Result<&mut HeapPage> {
        if page_id == 0 || page_id > self.last_page_id {
            return Err(StoreError::OutOfRange(format!(
                "page {page_id} beyond last page {}",
                self.last_page_id
            )));
        }
        if !self.pages.contains_key(&page_id) {
            let key = Self::cache_key(page_id);
            let page = match self.cache.lookup(&key) {
                Some(handle) => {
                    let page = handle.value().clone();
                    self.cache.release(handle);
                    self.cache.erase(&key);
                    page
                }
                None => self.load_page(page_id)?,
            };
            self.pages.insert(page_id, page);
        }
        Ok(self.pages.get_mut(&page_id).expect("page just materialized"))
    }

    /// Test/audit access to a materialized page.
    pub fn page(&mut self, page_id: PageId) -> Result<&HeapPage> {
        self.materialize(page_id).map(|p| &*p)
    }

    /// Stores `bytes` and returns the address of the chain's head block.
    ///
    /// First-fit scan from page 1: a hole large enough takes the whole
    /// record; otherwise, if only the tail hole is available, the record
    /// spans into the following pages. New pages are created once the scan
    /// passes the last existing one. Empty records are rejected.
    pub fn add_record(&mut self, bytes: &[u8]) -> Result<BlockAddress> {
        if bytes.is_empty() {
            return Err(StoreError::InvalidArgument("empty record".into()));
        }
        let need = (BLOCK_HEADER_BYTES + bytes.len()) as i32;

        if self.last_page_id == 0 {
            self.create_page()?;
        }
        let mut page_id: PageId = 1;
        loop {
            if page_id > self.last_page_id {
                self.create_page()?;
            }
            let (idx, hole_size, is_tail) = {
                let page = self.materialize(page_id)?;
                let idx = page.find_free_hole(need);
                (idx, page.hole(idx).size, page.is_tail_hole(idx))
            };
            if hole_size >= need {
                let page = self.materialize(page_id)?;
                let offset = page.place(idx, false, bytes);
                return Ok(BlockAddress::new(page_id, offset));
            }
            if is_tail && hole_size > BLOCK_HEADER_BYTES as i32 {
                let head_payload = (hole_size as usize) - BLOCK_HEADER_BYTES;
                if self.span_fits(page_id, bytes.len() - head_payload)? {
                    return self.write_span(page_id, idx, bytes);
                }
            }
            page_id += 1;
        }
    }

    /// Whether a chain starting at the tail of `first_page` can place its
    /// remaining `remaining` payload bytes on the following pages.
    fn span_fits(&mut self, first_page: PageId, remaining: usize) -> Result<bool> {
        let mut left = remaining;
        let mut page_id = first_page + 1;
        loop {
            if page_id > self.last_page_id {
                // Fresh pages absorb whatever is left.
                return Ok(true);
            }
            let (offset, size, only_hole) = {
                let page = self.materialize(page_id)?;
                let hole = page.hole(0);
                (hole.offset, hole.size, page.free_len() == 1)
            };
            if offset != 0 || size <= BLOCK_HEADER_BYTES as i32 {
                return Ok(false);
            }
            if size as usize >= BLOCK_HEADER_BYTES + left {
                return Ok(true);
            }
            // Spanning onward is only possible through the trailing hole.
            if !only_hole {
                return Ok(false);
            }
            left -= size as usize - BLOCK_HEADER_BYTES;
            page_id += 1;
        }
    }

    fn write_span(
        &mut self,
        first_page: PageId,
        tail_idx: usize,
        bytes: &[u8],
    ) -> Result<BlockAddress> {
        let (head_offset, mut written) = {
            let page = self.materialize(first_page)?;
            let seg = page.hole(tail_idx).size as usize - BLOCK_HEADER_BYTES;
            let offset = page.place(tail_idx, true, &bytes[..seg]);
            (offset, seg)
        };

        let mut page_id = first_page + 1;
        loop {
            if page_id > self.last_page_id {
                self.create_page()?;
            }
            let remaining = bytes.len() - written;
            let page = self.materialize(page_id)?;
            debug_assert_eq!(page.hole(0).offset, 0);
            let avail = page.hole(0).size as usize;
            if avail >= BLOCK_HEADER_BYTES + remaining {
                page.place(0, false, &bytes[written..]);
                break;
            }
            let seg = avail - BLOCK_HEADER_BYTES;
            page.place(0, true, &bytes[written..written + seg]);
            written += seg;
            page_id += 1;
        }
        debug!(
            page_id = first_page,
            offset = head_offset,
            pages = page_id - first_page + 1,
            "wrote spanning record"
        );
        Ok(BlockAddress::new(first_page, head_offset))
    }

    /// Reads a record's bytes, following its spanning chain. Pages outside
    /// the materialized set are read through the cache.
    pub fn get_data(&mut self, addr: BlockAddress) -> Result<Vec<u8>> {
        if !addr.is_signed() || addr.page_id > self.last_page_id {
            return Err(StoreError::OutOfRange(format!(
                "no page {} in heap",
                addr.page_id
            )));
        }
        let mut out = Vec::new();
        let mut page_id = addr.page_id;
        let mut offset = addr.offset;
        loop {
            let is_append = self.read_block_into(page_id, offset, &mut out)?;
            if !is_append {
                break;
            }
            page_id += 1;
            offset = 0;
            if page_id > self.last_page_id {
                return Err(StoreError::Corruption(
                    "spanning chain runs past the last page".into(),
                ));
            }
        }
        Ok(out)
    }

    /// Appends one block's payload to `out`; returns its `is_append` flag.
    fn read_block_into(
        &mut self,
        page_id: PageId,
        offset: PageOffset,
        out: &mut Vec<u8>,
    ) -> Result<bool> {
        if let Some(page) = self.pages.get(&page_id) {
            let info = page.block(offset)?;
            out.extend_from_slice(page.payload(&info));
            return Ok(info.is_append);
        }

        let key = Self::cache_key(page_id);
        if let Some(handle) = self.cache.lookup(&key) {
            let page = handle.value();
            let info = page.block(offset)?;
            out.extend_from_slice(page.payload(&info));
            let is_append = info.is_append;
            self.cache.release(handle);
            return Ok(is_append);
        }

        let page = self.load_page(page_id)?;
        let info = page.block(offset)?;
        out.extend_from_slice(page.payload(&info));
        let is_append = info.is_append;
        if let Some(handle) = self.cache.insert(&key, page, self.page_bytes) {
            self.cache.release(handle);
        }
        Ok(is_append)
    }

    /// Frees a record's whole chain. With `stress` set, any touched page
    /// whose free list reaches the serialization cap is compacted; moved
    /// records are reported through `adjusts`. Returns whether compaction
    /// ran.
    pub fn free_block(
        &mut self,
        addr: BlockAddress,
        stress: bool,
        adjusts: &mut Vec<AdjustEntry>,
    ) -> Result<bool> {
        let mut chain = Vec::new();
        let mut page_id = addr.page_id;
        let mut offset = addr.offset;
        loop {
            let info = self.materialize(page_id)?.block(offset)?;
            chain.push((page_id, offset, info.total_len()));
            if !info.is_append {
                break;
            }
            page_id += 1;
            offset = 0;
            if page_id > self.last_page_id {
                return Err(StoreError::Corruption(
                    "spanning chain runs past the last page".into(),
                ));
            }
        }

        for &(p, off, total) in &chain {
            self.materialize(p)?.free_block_at(off, total);
        }

        let mut compacted = false;
        if stress {
            for &(p, _, _) in &chain {
                if self.materialize(p)?.free_len() >= FREE_LIST_CAP {
                    compacted |= self.compact(p, adjusts)?;
                }
            }
        }
        Ok(compacted)
    }

    /// Packs live blocks leftward from `start_page` onward, pulling
    /// spanning continuations backward where they fit, and reports every
    /// moved chain head as an `AdjustEntry`. Processing follows the
    /// spanning chain and stops at the first page whose final block does
    /// not continue onward.
    pub fn compact(&mut self, start_page: PageId, adjusts: &mut Vec<AdjustEntry>) -> Result<bool> {
        if start_page == 0 || start_page > self.last_page_id {
            return Err(StoreError::OutOfRange(format!(
                "compact start page {start_page} out of range"
            )));
        }
        let first_new_adjust = adjusts.len();
        let mut moved = false;
        let mut page_id = start_page;

        loop {
            let (moves, tail) = self.materialize(page_id)?.compact_in_place()?;
            for (old, new) in moves {
                // Continuation segments sit at offset 0 and never move, so
                // every move here is a chain head.
                adjusts.push(AdjustEntry {
                    data: Vec::new(),
                    old_addr: BlockAddress::new(page_id, old),
                    new_addr: BlockAddress::new(page_id, new),
                });
                moved = true;
            }

            let tail = match tail {
                Some(info) if info.is_append => info,
                _ => break,
            };
            if page_id == self.last_page_id {
                return Err(StoreError::Corruption(
                    "spanning chain runs past the last page".into(),
                ));
            }

            let slack = self.materialize(page_id)?.tail_slack();
            let next = self.materialize(page_id + 1)?.block(0)?;
            if !next.is_append && slack >= next.payload_len {
                // The continuation ends the chain and fits entirely.
                let payload = self.materialize(page_id + 1)?.remove_head_block()?;
                self.materialize(page_id)?
                    .extend_tail_block(tail.offset, &payload, false)?;
                moved = true;
                break;
            }

            // Pull what fits; the remainder stays at offset 0 to keep the
            // chain intact, so at least one byte must be left behind.
            let pull = slack.min(next.payload_len - 1);
            if pull > 0 {
                let pulled = self.materialize(page_id + 1)?.shrink_head_block(pull)?;
                self.materialize(page_id)?
                    .extend_tail_block(tail.offset, &pulled, true)?;
                moved = true;
            }
            page_id += 1;
        }

        for i in first_new_adjust..adjusts.len() {
            let new_addr = adjusts[i].new_addr;
            adjusts[i].data = self.get_data(new_addr)?;
        }
        if moved {
            debug!(
                start_page,
                adjusted = adjusts.len() - first_new_adjust,
                "compacted heap pages"
            );
        }
        Ok(moved)
    }

    /// Writes the header and every materialized page image to disk.
    pub fn save(&mut self) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.last_page_id.to_le_bytes())?;
        for (&page_id, page) in &self.pages {
            let image = page.serialize()?;
            file.seek(SeekFrom::Start(
                FILE_HEADER_BYTES + (page_id - 1) * self.page_bytes as u64,
            ))?;
            file.write_all(&image)?;
        }
        file.sync_all()?;
        debug!(
            last_page_id = self.last_page_id,
            saved_pages = self.pages.len(),
            "saved heap file"
        );
        Ok(())
    }

    fn load_page(&self, page_id: PageId) -> Result<HeapPage> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(
            FILE_HEADER_BYTES + (page_id - 1) * self.page_bytes as u64,
        ))?;
        let mut image = vec![0u8; self.page_bytes];
        file.read_exact(&mut image)?;
        let page = HeapPage::deserialize(self.page_bytes, &image)?;
        if page.page_id() != page_id {
            return Err(StoreError::Corruption(format!(
                "page image at slot {page_id} claims id {}",
                page.page_id()
            )));
        }
        Ok(page)
    }

    /// Addresses of every record head, in address order. Continuation
    /// segments (offset 0 of a page whose predecessor ends mid-chain) are
    /// skipped.
    pub fn record_addresses(&mut self) -> Result<Vec<BlockAddress>> {
        let mut heads = Vec::new();
        let mut chain_open = false;
        for page_id in 1..=self.last_page_id {
            let page = self.materialize(page_id)?;
            let blocks = page.live_blocks()?;
            for info in &blocks {
                if info.offset == 0 && chain_open {
                    continue;
                }
                heads.push(BlockAddress::new(page_id, info.offset));
            }
            // At most one block per page continues onward, and it is not
            // always the last one once compaction has pulled data back.
            chain_open = blocks.iter().any(|b| b.is_append);
        }
        Ok(heads)
    }

    /// Number of stored records (spanning chains count once).
    pub fn total_records(&mut self) -> Result<usize> {
        Ok(self.record_addresses()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::heap_page::PAGE_META_BYTES;
    use tempfile::TempDir;

    fn open_heap(dir: &TempDir, page_bytes: usize) -> HeapFile {
        HeapFile::open(dir.path().join("heap.dat"), page_bytes, page_bytes * 100, 2).unwrap()
    }

    #[test]
    fn test_round_trip_small_records() {
        let dir = TempDir::new().unwrap();
        let mut heap = open_heap(&dir, 4096);
        let mut addrs = Vec::new();
        for i in 0..50u32 {
            let payload = format!("record-{i}").into_bytes();
            addrs.push((heap.add_record(&payload).unwrap(), payload));
        }
        for (addr, payload) in &addrs {
            assert_eq!(&heap.get_data(*addr).unwrap(), payload);
        }
        assert_eq!(heap.total_records().unwrap(), 50);
    }

    #[test]
    fn test_empty_record_rejected() {
        let dir = TempDir::new().unwrap();
        let mut heap = open_heap(&dir, 4096);
        assert!(matches!(
            heap.add_record(&[]),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_spanning_record_across_three_pages() {
        // Data region sized to hold one block with 10 payload bytes.
        let dir = TempDir::new().unwrap();
        let page_bytes = PAGE_META_BYTES + BLOCK_HEADER_BYTES + 10;
        let mut heap = open_heap(&dir, page_bytes);

        let payload: Vec<u8> = (0u8..25).collect();
        let addr = heap.add_record(&payload).unwrap();
        assert_eq!(addr, BlockAddress::new(1, 0));
        assert_eq!(heap.last_page_id(), 3);
        assert_eq!(heap.get_data(addr).unwrap(), payload);

        // Freeing reclaims every segment; the later pages are empty again.
        let mut adjusts = Vec::new();
        heap.free_block(addr, true, &mut adjusts).unwrap();
        for p in 1..=3 {
            let page = heap.page(p).unwrap();
            assert_eq!(page.used_space(), 0);
            assert_eq!(page.last_offset(), 0);
            page.check_invariants();
        }
        assert_eq!(heap.total_records().unwrap(), 0);
    }

    #[test]
    fn test_compaction_reports_single_adjust() {
        let dir = TempDir::new().unwrap();
        let mut heap = open_heap(&dir, 4096);
        let a = heap.add_record(&[b'a'; 10]).unwrap();
        let b = heap.add_record(&[b'b'; 10]).unwrap();
        let c = heap.add_record(&[b'c'; 10]).unwrap();
        let d = heap.add_record(&[b'd'; 10]).unwrap();

        let mut adjusts = Vec::new();
        heap.free_block(b, false, &mut adjusts).unwrap();
        heap.free_block(c, false, &mut adjusts).unwrap();
        assert!(adjusts.is_empty());

        assert!(heap.compact(1, &mut adjusts).unwrap());
        assert_eq!(adjusts.len(), 1);
        assert_eq!(adjusts[0].old_addr, d);
        assert_eq!(adjusts[0].new_addr, b);
        assert_eq!(adjusts[0].data, vec![b'd'; 10]);

        assert_eq!(heap.get_data(a).unwrap(), vec![b'a'; 10]);
        assert_eq!(heap.get_data(adjusts[0].new_addr).unwrap(), vec![b'd'; 10]);
        heap.page(1).unwrap().check_invariants();
    }

    #[test]
    fn test_stress_free_triggers_compaction() {
        let dir = TempDir::new().unwrap();
        let mut heap = open_heap(&dir, 4096);
        let addrs: Vec<BlockAddress> = (0..40)
            .map(|i| heap.add_record(&[i as u8; 8]).unwrap())
            .collect();

        // Free alternating records so holes cannot merge.
        let mut adjusts = Vec::new();
        let mut compacted = false;
        for addr in addrs.iter().step_by(2) {
            compacted |= heap.free_block(*addr, true, &mut adjusts).unwrap();
        }
        assert!(compacted);
        assert!(!adjusts.is_empty());
        assert!(heap.page(1).unwrap().free_len() < FREE_LIST_CAP);

        // Survivors stay readable at their adjusted addresses.
        let mut current: std::collections::HashMap<BlockAddress, BlockAddress> =
            addrs.iter().skip(1).step_by(2).map(|a| (*a, *a)).collect();
        for adj in &adjusts {
            if let Some(entry) = current
                .iter()
                .find(|(_, cur)| **cur == adj.old_addr)
                .map(|(orig, _)| *orig)
            {
                current.insert(entry, adj.new_addr);
            }
        }
        for (i, addr) in addrs.iter().enumerate().skip(1).step_by(2) {
            let cur = current[addr];
            assert_eq!(heap.get_data(cur).unwrap(), vec![i as u8; 8]);
        }
    }

    #[test]
    fn test_compaction_pulls_back_spanning_tail() {
        let dir = TempDir::new().unwrap();
        let page_bytes = PAGE_META_BYTES + 64;
        let mut heap = open_heap(&dir, page_bytes);

        // A first record, then one that spans into page 2.
        let a = heap.add_record(&[b'x'; 20]).unwrap();
        let span = heap.add_record(&[b's'; 60]).unwrap();
        assert!(heap.last_page_id() >= 2);

        // Freeing the first record leaves a hole before the spanning head;
        // compaction slides the head left and pulls the chain backward.
        let mut adjusts = Vec::new();
        heap.free_block(a, false, &mut adjusts).unwrap();
        assert!(heap.compact(1, &mut adjusts).unwrap());

        let moved = adjusts
            .iter()
            .find(|adj| adj.old_addr == span)
            .expect("spanning head must be adjusted");
        assert_eq!(heap.get_data(moved.new_addr).unwrap(), vec![b's'; 60]);
        for p in 1..=heap.last_page_id() {
            heap.page(p).unwrap().check_invariants();
        }
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heap.dat");
        let mut stored = Vec::new();
        {
            let mut heap = HeapFile::open(&path, 512, 512 * 100, 2).unwrap();
            for i in 0..30u32 {
                let payload = vec![i as u8; (i % 40 + 1) as usize];
                stored.push((heap.add_record(&payload).unwrap(), payload));
            }
            heap.save().unwrap();
        }
        let mut heap = HeapFile::open(&path, 512, 512 * 100, 2).unwrap();
        for (addr, payload) in &stored {
            assert_eq!(&heap.get_data(*addr).unwrap(), payload);
        }
        assert_eq!(heap.total_records().unwrap(), 30);
    }

    #[test]
    fn test_save_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heap.dat");
        let mut heap = HeapFile::open(&path, 512, 512 * 100, 2).unwrap();
        for i in 0..10u32 {
            heap.add_record(&vec![i as u8; 17]).unwrap();
        }
        heap.save().unwrap();
        let first = std::fs::read(&path).unwrap();
        heap.save().unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_get_data_reads_through_cache_after_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heap.dat");
        let addr;
        {
            let mut heap = HeapFile::open(&path, 512, 512 * 100, 2).unwrap();
            addr = heap.add_record(b"cached payload").unwrap();
            heap.save().unwrap();
        }
        let mut heap = HeapFile::open(&path, 512, 512 * 100, 2).unwrap();
        // Two reads: the second is served by the page cache.
        assert_eq!(heap.get_data(addr).unwrap(), b"cached payload");
        assert_eq!(heap.get_data(addr).unwrap(), b"cached payload");
    }

    #[test]
    fn test_out_of_range_address() {
        let dir = TempDir::new().unwrap();
        let mut heap = open_heap(&dir, 4096);
        heap.add_record(b"x").unwrap();
        assert!(matches!(
            heap.get_data(BlockAddress::new(9, 0)),
            Err(StoreError::OutOfRange(_))
        ));
        assert!(matches!(
            heap.get_data(BlockAddress::UNSIGNED),
            Err(StoreError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_randomized_workload_round_trips() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let dir = TempDir::new().unwrap();
        let page_bytes = PAGE_META_BYTES + 96;
        let mut heap = open_heap(&dir, page_bytes);
        let mut rng = StdRng::seed_from_u64(0xfeed);
        let mut live: Vec<(BlockAddress, Vec<u8>)> = Vec::new();
        let mut adjusts = Vec::new();

        for _ in 0..300 {
            if !live.is_empty() && rng.random_bool(0.4) {
                let (addr, _) = live.swap_remove(rng.random_range(0..live.len()));
                let before = adjusts.len();
                heap.free_block(addr, true, &mut adjusts).unwrap();
                for adj in &adjusts[before..] {
                    for entry in live.iter_mut() {
                        if entry.0 == adj.old_addr {
                            entry.0 = adj.new_addr;
                        }
                    }
                }
            } else {
                let len = rng.random_range(1..=200usize);
                let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                let addr = heap.add_record(&payload).unwrap();
                live.push((addr, payload));
            }
        }
        for (addr, payload) in &live {
            assert_eq!(&heap.get_data(*addr).unwrap(), payload);
        }
        for p in 1..=heap.last_page_id() {
            heap.page(p).unwrap().check_invariants();
        }
    }
}
