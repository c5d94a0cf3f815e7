//! Swap space: a bitmap of page-sized slots over the swap block device.
//!
//! A slot's life cycle is free, then written by an eviction, then read back
//! and freed by the next fault on its page. The bitmap mutex covers only
//! slot bookkeeping; sector I/O runs without it so several evictions can be
//! in flight at once.

use crate::block::block_core::{BlockManager, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::mem::error::MemError;
use crate::sync::Mutex;
use alloc::vec;
use alloc::vec::Vec;
use marrowos_shared::mem::PAGE_FRAME_SIZE;

/// Number of sectors in one page-sized swap slot.
pub const PAGE_SECTORS: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// Index of a swap slot.
pub type SwapSlot = u32;

/// Fixed-size bitmap with first-free allocation.
///
/// Slots are packed 64 to a group; a scan walks groups and picks the lowest
/// free bit, so slot numbers are reused densely from the front of the
/// device.
pub struct SwapBitmap {
    groups: Vec<u64>,
    slots: usize,
    used: usize,
}

impl SwapBitmap {
    pub fn new(slots: usize) -> Self {
        Self {
            groups: vec![0; slots.div_ceil(64)],
            slots,
            used: 0,
        }
    }

    /// Finds the lowest clear bit, sets it, and returns its index.
    pub fn scan_and_flip(&mut self) -> Option<u32> {
        for (group_index, group) in self.groups.iter_mut().enumerate() {
            if *group == u64::MAX {
                continue;
            }
            let bit = group.trailing_ones();
            let slot = group_index as u32 * 64 + bit;
            if slot as usize >= self.slots {
                return None;
            }
            *group |= 1 << bit;
            self.used += 1;
            return Some(slot);
        }
        None
    }

    /// Clears a previously set bit.
    pub fn release(&mut self, slot: u32) {
        let mask = 1u64 << (slot % 64);
        let group = &mut self.groups[slot as usize / 64];
        debug_assert!(*group & mask != 0, "releasing a free swap slot");
        *group &= !mask;
        self.used -= 1;
    }

    pub fn is_used(&self, slot: u32) -> bool {
        self.groups[slot as usize / 64] & (1 << (slot % 64)) != 0
    }

    pub fn used_count(&self) -> usize {
        self.used
    }

    pub fn slot_count(&self) -> usize {
        self.slots
    }
}

/// The swap device and its slot bitmap.
pub struct SwapSpace {
    device: Option<usize>,
    bitmap: Mutex<SwapBitmap>,
}

impl SwapSpace {
    /// Sizes the bitmap to the registered swap device.
    ///
    /// A missing device just disables swapping: every slot allocation fails
    /// with [`MemError::NoSwapSlot`], which eviction reports like any other
    /// exhaustion.
    pub fn new(blocks: &BlockManager) -> Self {
        match blocks.by_type(BlockType::Swap) {
            Some(device) => {
                let slots = device.get_size() as usize / PAGE_SECTORS;
                log::info!(
                    "swap space on \"{}\": {} slots",
                    device.get_name(),
                    slots
                );
                Self {
                    device: Some(device.get_index()),
                    bitmap: Mutex::new(SwapBitmap::new(slots)),
                }
            }
            None => {
                log::info!("no swap device, swapping disabled");
                Self {
                    device: None,
                    bitmap: Mutex::new(SwapBitmap::new(0)),
                }
            }
        }
    }

    pub fn slot_count(&self) -> usize {
        self.bitmap.lock().slot_count()
    }

    pub fn used_slots(&self) -> usize {
        self.bitmap.lock().used_count()
    }

    pub fn is_slot_used(&self, slot: SwapSlot) -> bool {
        self.bitmap.lock().is_used(slot)
    }

    /// Claims a free slot.
    pub fn allocate_slot(&self) -> Result<SwapSlot, MemError> {
        self.bitmap
            .lock()
            .scan_and_flip()
            .ok_or(MemError::NoSwapSlot)
    }

    /// Returns a slot whose contents will never be read back.
    ///
    /// Used when a swapped-out page is destroyed without faulting back in.
    pub fn release_slot(&self, slot: SwapSlot) {
        self.bitmap.lock().release(slot);
    }

    fn first_sector(slot: SwapSlot) -> BlockSector {
        slot * PAGE_SECTORS as BlockSector
    }

    /// Writes one page of memory at `frame_base` into `slot`.
    ///
    /// # Safety
    ///
    /// `frame_base` must point at `PAGE_FRAME_SIZE` readable bytes, and the
    /// caller must hold the frame's lock.
    pub unsafe fn write_slot(
        &self,
        blocks: &BlockManager,
        slot: SwapSlot,
        frame_base: *const u8,
    ) -> Result<(), MemError> {
        let device = self.device.and_then(|id| blocks.by_id(id));
        let Some(device) = device else {
            return Err(MemError::NoSwapSlot);
        };
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        for i in 0..PAGE_SECTORS {
            let src = frame_base.add(i * BLOCK_SECTOR_SIZE);
            core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), BLOCK_SECTOR_SIZE);
            device.write(Self::first_sector(slot) + i as BlockSector, &buf)?;
        }
        Ok(())
    }

    /// Reads `slot` back into the page of memory at `frame_base` and frees
    /// the slot.
    ///
    /// # Safety
    ///
    /// `frame_base` must point at `PAGE_FRAME_SIZE` writable bytes, and the
    /// caller must hold the frame's lock.
    pub unsafe fn read_slot(
        &self,
        blocks: &BlockManager,
        slot: SwapSlot,
        frame_base: *mut u8,
    ) -> Result<(), MemError> {
        let device = self.device.and_then(|id| blocks.by_id(id));
        let Some(device) = device else {
            return Err(MemError::NoSwapSlot);
        };
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        for i in 0..PAGE_SECTORS {
            device.read(Self::first_sector(slot) + i as BlockSector, &mut buf)?;
            let dst = frame_base.add(i * BLOCK_SECTOR_SIZE);
            core::ptr::copy_nonoverlapping(buf.as_ptr(), dst, BLOCK_SECTOR_SIZE);
        }
        self.release_slot(slot);
        Ok(())
    }
}
