// Fixed-slot page: uniformly-sized blocks tracked by an occupancy bitset,
// with a crc32 checksum over the slot region. Used for the spatial index's
// persisted node pages.

use crate::common::PageId;
use crate::error::{Result, StoreError};
use crate::util::bitset::BitSet;

/// page_id + checksum + slot_bytes.
const FIXED_META_BYTES: usize = 8 + 4 + 4;

#[derive(Clone)]
pub struct FixedPage {
    page_id: PageId,
    slot_bytes: usize,
    max_slots: usize,
    bitset: BitSet,
    data: Box<[u8]>,
}

impl FixedPage {
    pub fn new(page_id: PageId, page_bytes: usize, slot_bytes: usize) -> Result<Self> {
        let max_slots = Self::max_slots(page_bytes, slot_bytes)?;
        Ok(Self {
            page_id,
            slot_bytes,
            max_slots,
            bitset: BitSet::new(max_slots),
            data: vec![0u8; max_slots * slot_bytes].into_boxed_slice(),
        })
    }

    /// Largest slot count whose metadata, bitset and slot bytes fit the
    /// page.
    pub fn max_slots(page_bytes: usize, slot_bytes: usize) -> Result<usize> {
        if slot_bytes == 0 {
            return Err(StoreError::InvalidArgument("zero slot size".into()));
        }
        if page_bytes <= FIXED_META_BYTES {
            return Err(StoreError::InvalidArgument(format!(
                "page_bytes {page_bytes} leaves no slot region"
            )));
        }
        let mut m = (page_bytes - FIXED_META_BYTES) / slot_bytes;
        while m > 0 && FIXED_META_BYTES + m.div_ceil(8) + m * slot_bytes > page_bytes {
            m -= 1;
        }
        if m == 0 {
            return Err(StoreError::InvalidArgument(format!(
                "slot of {slot_bytes} bytes does not fit a {page_bytes}-byte page"
            )));
        }
        Ok(m)
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub fn slot_count(&self) -> usize {
        self.max_slots
    }

    pub fn used_slots(&self) -> usize {
        self.bitset.count()
    }

    pub fn find_free_slot(&self) -> Option<usize> {
        (0..self.max_slots).find(|&i| !self.bitset.get(i))
    }

    pub fn is_slot_used(&self, slot: usize) -> Result<bool> {
        self.check_slot(slot)?;
        Ok(self.bitset.get(slot))
    }

    pub fn allocate_slot(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.bitset.set(slot);
        Ok(())
    }

    pub fn free_slot(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.bitset.clear(slot);
        let start = slot * self.slot_bytes;
        self.data[start..start + self.slot_bytes].fill(0);
        Ok(())
    }

    pub fn write_slot(&mut self, slot: usize, bytes: &[u8]) -> Result<()> {
        self.check_slot(slot)?;
        if bytes.len() != self.slot_bytes {
            return Err(StoreError::InvalidArgument(format!(
                "slot write of {} bytes into {}-byte slots",
                bytes.len(),
                self.slot_bytes
            )));
        }
        let start = slot * self.slot_bytes;
        self.data[start..start + self.slot_bytes].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_slot(&self, slot: usize) -> Result<&[u8]> {
        self.check_slot(slot)?;
        let start = slot * self.slot_bytes;
        Ok(&self.data[start..start + self.slot_bytes])
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.max_slots {
            return Err(StoreError::OutOfRange(format!(
                "slot {slot} beyond page capacity {}",
                self.max_slots
            )));
        }
        Ok(())
    }

    /// Serializes to exactly `page_bytes`, zero-padding the slack.
    pub fn serialize(&self, page_bytes: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(page_bytes);
        out.extend_from_slice(&self.page_id.to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&self.data).to_le_bytes());
        out.extend_from_slice(&(self.slot_bytes as u32).to_le_bytes());
        out.extend_from_slice(self.bitset.as_bytes());
        out.extend_from_slice(&self.data);
        if out.len() > page_bytes {
            return Err(StoreError::Corruption(format!(
                "fixed page {} overflows its {page_bytes}-byte image",
                self.page_id
            )));
        }
        out.resize(page_bytes, 0);
        Ok(out)
    }

    /// Rebuilds a page, verifying its checksum.
    pub fn deserialize(page_bytes: usize, slot_bytes: usize, image: &[u8]) -> Result<Self> {
        if image.len() != page_bytes {
            return Err(StoreError::Corruption(format!(
                "fixed page image is {} bytes, expected {page_bytes}",
                image.len()
            )));
        }
        let max_slots = Self::max_slots(page_bytes, slot_bytes)?;
        let page_id = u64::from_le_bytes(image[0..8].try_into().expect("8-byte slice"));
        let checksum = u32::from_le_bytes(image[8..12].try_into().expect("4-byte slice"));
        let stored_slot = u32::from_le_bytes(image[12..16].try_into().expect("4-byte slice"));
        if stored_slot as usize != slot_bytes {
            return Err(StoreError::Corruption(format!(
                "fixed page {page_id} stores {stored_slot}-byte slots, expected {slot_bytes}"
            )));
        }
        let bitset_len = max_slots.div_ceil(8);
        let bitset = BitSet::from_bytes(max_slots, &image[FIXED_META_BYTES..FIXED_META_BYTES + bitset_len])
            .ok_or_else(|| StoreError::Corruption(format!("fixed page {page_id} bitset truncated")))?;
        let data_start = FIXED_META_BYTES + bitset_len;
        let data = image[data_start..data_start + max_slots * slot_bytes]
            .to_vec()
            .into_boxed_slice();
        if crc32fast::hash(&data) != checksum {
            return Err(StoreError::Corruption(format!(
                "fixed page {page_id} checksum mismatch"
            )));
        }
        Ok(Self {
            page_id,
            slot_bytes,
            max_slots,
            bitset,
            data,
        })
    }
}

/// Assigns `(page, offset)` slots across a growing set of fixed pages.
pub struct FixedPageManager {
    pages: Vec<FixedPage>,
    page_bytes: usize,
    slot_bytes: usize,
}

impl FixedPageManager {
    pub fn new(page_bytes: usize, slot_bytes: usize) -> Result<Self> {
        FixedPage::max_slots(page_bytes, slot_bytes)?;
        Ok(Self {
            pages: vec![FixedPage::new(1, page_bytes, slot_bytes)?],
            page_bytes,
            slot_bytes,
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page(&self, page_id: PageId) -> Option<&FixedPage> {
        if page_id == 0 {
            return None;
        }
        self.pages.get(page_id as usize - 1)
    }

    pub fn page_mut(&mut self, page_id: PageId) -> Option<&mut FixedPage> {
        if page_id == 0 {
            return None;
        }
        self.pages.get_mut(page_id as usize - 1)
    }

    /// Allocates the next free slot, scanning from `hint_page` and growing
    /// the page set as needed. Returns the slot's `(page_id, byte offset)`.
    pub fn assign(&mut self, hint_page: PageId) -> Result<(PageId, i32)> {
        let hint = hint_page.max(1);
        while (self.pages.len() as u64) < hint {
            let id = self.pages.len() as u64 + 1;
            self.pages.push(FixedPage::new(id, self.page_bytes, self.slot_bytes)?);
        }
        let mut idx = hint as usize - 1;
        loop {
            if idx == self.pages.len() {
                let id = idx as u64 + 1;
                self.pages.push(FixedPage::new(id, self.page_bytes, self.slot_bytes)?);
            }
            if let Some(slot) = self.pages[idx].find_free_slot() {
                self.pages[idx].allocate_slot(slot)?;
                return Ok((idx as u64 + 1, (slot * self.slot_bytes) as i32));
            }
            idx += 1;
        }
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }
}
