//! Supplemental page-table entries and the fault/eviction protocol.
//!
//! A page is in exactly one of three conditions: resident in a frame,
//! swapped out to a slot, or reconstructible from its backing source
//! (zero-fill or a file range). The `Backing` enum keeps those conditions
//! from overlapping.

use crate::fs::File;
use crate::mem::error::MemError;
use crate::mem::pagedir::PageDirectory;
use crate::swapping::SwapSlot;
use crate::sync::Mutex;
use crate::system::SystemState;
use alloc::sync::Arc;
use marrowos_shared::mem::{page_aligned, PAGE_FRAME_SIZE};

/// Where a page's contents come from when it is not resident.
#[derive(Clone)]
pub enum Backing {
    /// Fresh zero bytes.
    Zero,
    /// `bytes` bytes of `file` starting at `offset`; the rest of the page
    /// is zero. With `writeback`, dirty evictions go to the file (memory
    /// mapping); without it they go to swap (private executable data).
    File {
        file: File,
        offset: usize,
        bytes: usize,
        writeback: bool,
    },
    /// One page previously written to the given swap slot.
    Swap { slot: SwapSlot },
}

struct PageState {
    frame: Option<usize>,
    backing: Backing,
}

/// A virtual page belonging to one process.
///
/// The residency and backing fields are only changed while the page's frame
/// lock is held (or before the descriptor is shared), matching the frame
/// table's pairing invariant.
pub struct Page {
    /// Page-aligned user virtual address; the lookup key.
    addr: usize,
    read_only: bool,
    /// The owning process's page directory. Eviction reaches the hardware
    /// mapping through this without involving the owning process.
    pagedir: Arc<PageDirectory>,
    state: Mutex<PageState>,
}

impl Page {
    /// Creates a descriptor for the page at `addr` (which must be
    /// page-aligned) with no frame.
    pub fn new(
        addr: usize,
        read_only: bool,
        pagedir: Arc<PageDirectory>,
        backing: Backing,
    ) -> Arc<Self> {
        assert!(page_aligned(addr));
        Arc::new(Self {
            addr,
            read_only,
            pagedir,
            state: Mutex::new(PageState {
                frame: None,
                backing,
            }),
        })
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn pagedir(&self) -> &Arc<PageDirectory> {
        &self.pagedir
    }

    /// Index of the frame holding this page, if resident.
    pub fn frame_index(&self) -> Option<usize> {
        self.state.lock().frame
    }

    pub fn is_resident(&self) -> bool {
        self.frame_index().is_some()
    }

    pub(crate) fn set_frame_index(&self, frame: Option<usize>) {
        self.state.lock().frame = frame;
    }

    fn backing_snapshot(&self) -> Backing {
        self.state.lock().backing.clone()
    }

    fn set_backing(&self, backing: Backing) {
        self.state.lock().backing = backing;
    }

    /// The swap slot holding this page's contents, if any.
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        let state = self.state.lock();
        if let Backing::Swap { slot } = state.backing {
            Some(slot)
        } else {
            None
        }
    }

    /// Detaches and returns the page's swap slot, for teardown paths that
    /// free the slot without reading it.
    pub(crate) fn take_swap_slot(&self) -> Option<SwapSlot> {
        let mut state = self.state.lock();
        if let Backing::Swap { slot } = state.backing {
            state.backing = Backing::Zero;
            Some(slot)
        } else {
            None
        }
    }

    /// Whether dirty evictions of this page go back to its file.
    pub(crate) fn is_writeback_file(&self) -> bool {
        matches!(
            self.state.lock().backing,
            Backing::File { writeback: true, .. }
        )
    }

    /// Reads and clears the hardware accessed bit; the clock sweep's
    /// second-chance test.
    pub(crate) fn accessed_recently(&self) -> bool {
        if self.pagedir.is_accessed(self.addr) {
            self.pagedir.set_accessed(self.addr, false);
            true
        } else {
            false
        }
    }
}

/// Locks the page's frame, faulting contents in and installing the mapping
/// if needed. On success the frame stays locked for the caller.
pub(crate) fn lock_and_install(
    page: &Arc<Page>,
    system: &SystemState,
) -> Result<usize, MemError> {
    if let Some(index) = system.frames.lock(page) {
        // Resident. A failed eviction may have torn down the mapping, in
        // which case the dirty bit it preserved must survive the reinstall.
        if !page.pagedir.is_mapped(page.addr) {
            let was_dirty = page.pagedir.is_dirty(page.addr);
            page.pagedir.set_page(page.addr, index, !page.read_only);
            if was_dirty {
                page.pagedir.set_dirty(page.addr, true);
            }
        }
        return Ok(index);
    }

    let index = system.frames.allocate(page, system)?;
    let from_swap = match populate(page, system, index) {
        Ok(from_swap) => from_swap,
        Err(e) => {
            page.set_frame_index(None);
            system.frames.free(index);
            return Err(e);
        }
    };
    page.pagedir.set_page(page.addr, index, !page.read_only);
    if from_swap {
        // The frame is now the only copy of the data. Marking the fresh
        // mapping dirty keeps "clean means reconstructible" true, so a
        // later eviction writes the page out instead of discarding it.
        page.pagedir.set_dirty(page.addr, true);
    }
    Ok(index)
}

/// Faults in the page containing `fault_addr`'s contents and installs the
/// hardware mapping. The page-fault handler's entry into the VM core.
pub fn page_in(page: &Arc<Page>, system: &SystemState) -> Result<(), MemError> {
    let index = lock_and_install(page, system)?;
    system.frames.unlock(index);
    Ok(())
}

/// Fills the freshly allocated frame `index` from the page's backing
/// source. Returns whether the contents came from swap.
fn populate(page: &Page, system: &SystemState, index: usize) -> Result<bool, MemError> {
    let frame = system.frames.frame(index);
    // SAFETY: we hold the frame lock, so nothing else touches its memory.
    let frame_bytes =
        unsafe { core::slice::from_raw_parts_mut(frame.base_ptr(), PAGE_FRAME_SIZE) };
    match page.backing_snapshot() {
        Backing::Zero => {
            frame_bytes.fill(0);
            Ok(false)
        }
        Backing::File {
            file,
            offset,
            bytes,
            ..
        } => {
            let read = file.read_at(&mut frame_bytes[..bytes], offset);
            frame_bytes[read..].fill(0);
            Ok(false)
        }
        Backing::Swap { slot } => {
            // SAFETY: frame lock held; the slot was written by the eviction
            // that made this page non-resident.
            unsafe {
                system
                    .swap
                    .read_slot(&system.blocks, slot, frame.base_ptr())?;
            }
            page.set_backing(Backing::Zero);
            Ok(true)
        }
    }
}

/// Evicts `page` from its frame: cuts off the hardware mapping, then moves
/// dirty contents to swap or back to the backing file.
///
/// The caller must hold the page's frame lock and stays responsible for the
/// frame itself: on success the page no longer references it; on failure
/// the page keeps the frame and the caller aborts the eviction.
pub(crate) fn page_out(page: &Page, system: &SystemState) -> Result<(), MemError> {
    let Some(index) = page.frame_index() else {
        return Err(MemError::NotMapped);
    };
    let frame = system.frames.frame(index);

    // Unmap first so no thread can keep writing through a stale translation
    // while the contents move.
    page.pagedir.clear_page(page.addr);
    let dirty = page.pagedir.is_dirty(page.addr);

    let new_slot = match page.backing_snapshot() {
        Backing::File {
            file,
            offset,
            bytes,
            writeback: true,
        } if dirty => {
            // SAFETY: frame lock held.
            let frame_bytes =
                unsafe { core::slice::from_raw_parts(frame.base_ptr().cast_const(), PAGE_FRAME_SIZE) };
            if file.write_at(&frame_bytes[..bytes], offset) != bytes {
                return Err(MemError::Io(
                    crate::block::block_error::BlockError::WriteError,
                ));
            }
            None
        }
        // Private file copies and anonymous pages both go to swap when
        // dirty.
        Backing::File { .. } | Backing::Zero if dirty => Some(swap_out(page, system, index)?),
        Backing::Swap { .. } => {
            // A resident page's slot was freed when it was read back in.
            debug_assert!(false, "resident page still claims a swap slot");
            None
        }
        // Clean pages need no data motion: their contents are still
        // reconstructible from the backing source (or are zero).
        _ => None,
    };

    let mut state = page.state.lock();
    if let Some(slot) = new_slot {
        state.backing = Backing::Swap { slot };
    }
    state.frame = None;
    Ok(())
}

fn swap_out(page: &Page, system: &SystemState, index: usize) -> Result<SwapSlot, MemError> {
    let slot = system.swap.allocate_slot()?;
    let frame = system.frames.frame(index);
    // SAFETY: frame lock held.
    match unsafe {
        system
            .swap
            .write_slot(&system.blocks, slot, frame.base_ptr().cast_const())
    } {
        Ok(()) => {
            log::trace!("page {:#x} swapped out to slot {}", page.addr(), slot);
            Ok(slot)
        }
        Err(e) => {
            system.swap.release_slot(slot);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::test_support::{frame_bytes, make_system};
    use alloc::vec;
    use alloc::vec::Vec;

    fn new_pagedir() -> Arc<PageDirectory> {
        Arc::new(PageDirectory::new())
    }

    #[test]
    fn test_zero_fill_population() {
        let system = make_system(1, 0);
        let dir = new_pagedir();
        let page = Page::new(0x1000, false, Arc::clone(&dir), Backing::Zero);

        // Dirty the frame pool first so a zero read means a real zero fill.
        unsafe {
            frame_bytes(system, 0).fill(0xaa);
        }
        page_in(&page, system).expect("frame available");
        let index = page.frame_index().expect("page resident");
        assert!(unsafe { frame_bytes(system, index) }.iter().all(|&b| b == 0));
        assert_eq!(dir.translate(0x1000), Some((index, true)));
    }

    #[test]
    fn test_file_backed_partial_population() {
        let system = make_system(1, 0);
        let dir = new_pagedir();
        let file = File::new((0u32..200).map(|i| (i % 251) as u8).collect::<Vec<_>>());
        let page = Page::new(
            0x1000,
            true,
            Arc::clone(&dir),
            Backing::File {
                file: file.reopen(),
                offset: 100,
                bytes: 100,
                writeback: false,
            },
        );

        unsafe {
            frame_bytes(system, 0).fill(0xaa);
        }
        page_in(&page, system).expect("frame available");
        let index = page.frame_index().expect("page resident");
        let bytes = unsafe { frame_bytes(system, index) };
        for (i, &b) in bytes.iter().enumerate().take(100) {
            assert_eq!(b, ((i + 100) % 251) as u8);
        }
        assert!(bytes[100..].iter().all(|&b| b == 0), "remainder zero-filled");
        // Read-only mapping installed.
        assert_eq!(dir.translate(0x1000), Some((index, false)));
    }

    #[test]
    fn test_eviction_to_swap_and_back() {
        let system = make_system(1, 4);
        let dir = new_pagedir();
        let a = Page::new(0x1000, false, Arc::clone(&dir), Backing::Zero);
        let b = Page::new(0x2000, false, Arc::clone(&dir), Backing::Zero);

        page_in(&a, system).expect("frame available");
        let index = a.frame_index().expect("a resident");
        // A user store through the mapping: write the frame, set dirty.
        unsafe {
            frame_bytes(system, index)[..4].copy_from_slice(b"abcd");
        }
        dir.set_dirty(0x1000, true);

        // Faulting in B steals the only frame and pushes A out to swap.
        page_in(&b, system).expect("eviction frees the frame");
        assert!(!a.is_resident());
        assert!(b.is_resident());
        assert_eq!(system.swap.used_slots(), 1);
        let slot = a.swap_slot().expect("a swapped out");
        assert!(system.swap.is_slot_used(slot));
        assert!(!dir.is_mapped(0x1000));

        // Faulting A back in evicts B (clean, discarded) and restores the
        // exact bytes; the slot is freed by the read.
        page_in(&a, system).expect("eviction frees the frame");
        let index = a.frame_index().expect("a resident again");
        assert_eq!(&unsafe { frame_bytes(system, index) }[..4], b"abcd");
        assert_eq!(system.swap.used_slots(), 0);
        assert_eq!(a.swap_slot(), None);
        // Swapped-in contents only live in the frame, so the fresh mapping
        // must already count as dirty.
        assert!(dir.is_dirty(0x1000));
    }

    #[test]
    fn test_clean_file_page_discarded_and_reread() {
        let system = make_system(1, 4);
        let dir = new_pagedir();
        let file = File::new(vec![7u8; 64]);
        let a = Page::new(
            0x1000,
            true,
            Arc::clone(&dir),
            Backing::File {
                file: file.reopen(),
                offset: 0,
                bytes: 64,
                writeback: false,
            },
        );
        let b = Page::new(0x2000, false, Arc::clone(&dir), Backing::Zero);

        page_in(&a, system).expect("frame available");
        page_in(&b, system).expect("clean page evicted without I/O");
        // The clean file page went nowhere near the swap device.
        assert_eq!(system.swap.used_slots(), 0);
        assert!(matches!(
            a.backing_snapshot(),
            Backing::File { writeback: false, .. }
        ));

        page_in(&a, system).expect("refetch from file");
        let index = a.frame_index().expect("a resident");
        assert_eq!(&unsafe { frame_bytes(system, index) }[..64], &[7u8; 64][..]);
    }

    #[test]
    fn test_dirty_mapped_file_page_written_back() {
        let system = make_system(1, 4);
        let dir = new_pagedir();
        let file = File::new(vec![0u8; 128]);
        let a = Page::new(
            0x1000,
            false,
            Arc::clone(&dir),
            Backing::File {
                file: file.reopen(),
                offset: 0,
                bytes: 128,
                writeback: true,
            },
        );
        let b = Page::new(0x2000, false, Arc::clone(&dir), Backing::Zero);

        page_in(&a, system).expect("frame available");
        let index = a.frame_index().expect("a resident");
        unsafe {
            frame_bytes(system, index)[..128].fill(9);
        }
        dir.set_dirty(0x1000, true);

        page_in(&b, system).expect("eviction writes the mapping back");
        // Changes went to the file, not to swap, and the backing stays
        // file-based for the next fault.
        assert_eq!(system.swap.used_slots(), 0);
        let mut contents = [0u8; 128];
        assert_eq!(file.read_at(&mut contents, 0), 128);
        assert_eq!(contents, [9u8; 128]);
        assert!(matches!(
            a.backing_snapshot(),
            Backing::File { writeback: true, .. }
        ));
    }

    #[test]
    fn test_private_dirty_file_page_goes_to_swap() {
        let system = make_system(1, 4);
        let dir = new_pagedir();
        let file = File::new(vec![3u8; 64]);
        let a = Page::new(
            0x1000,
            false,
            Arc::clone(&dir),
            Backing::File {
                file: file.reopen(),
                offset: 0,
                bytes: 64,
                writeback: false,
            },
        );
        let b = Page::new(0x2000, false, Arc::clone(&dir), Backing::Zero);

        page_in(&a, system).expect("frame available");
        dir.set_dirty(0x1000, true);
        page_in(&b, system).expect("eviction goes to swap");

        // The file is untouched; the private copy lives in swap now.
        let mut contents = [0u8; 64];
        assert_eq!(file.read_at(&mut contents, 0), 64);
        assert_eq!(contents, [3u8; 64]);
        assert_eq!(system.swap.used_slots(), 1);
        assert!(a.swap_slot().is_some());
    }

    #[test]
    fn test_swap_exhaustion_fails_the_fault() {
        let system = make_system(1, 0);
        let dir = new_pagedir();
        let a = Page::new(0x1000, false, Arc::clone(&dir), Backing::Zero);
        let b = Page::new(0x2000, false, Arc::clone(&dir), Backing::Zero);

        page_in(&a, system).expect("frame available");
        dir.set_dirty(0x1000, true);
        // No swap device: the dirty page cannot be written out, so the
        // fault on B fails and A stays resident.
        assert_eq!(page_in(&b, system), Err(MemError::NoSwapSlot));
        assert!(a.is_resident());
        assert!(!b.is_resident());

        // The mapping was torn down by the aborted eviction; refaulting A
        // reinstalls it with the dirty bit intact.
        page_in(&a, system).expect("a still resident");
        assert!(dir.is_mapped(0x1000));
        assert!(dir.is_dirty(0x1000));
    }

    #[test]
    fn test_clock_gives_second_chances() {
        let system = make_system(2, 4);
        let dir = new_pagedir();
        let a = Page::new(0x1000, false, Arc::clone(&dir), Backing::Zero);
        let b = Page::new(0x2000, false, Arc::clone(&dir), Backing::Zero);
        page_in(&a, system).expect("frame available");
        page_in(&b, system).expect("frame available");

        // Both pages recently accessed: the sweep must clear both bits
        // before it can evict anything.
        dir.set_accessed(0x1000, true);
        dir.set_accessed(0x2000, true);

        let c = Page::new(0x3000, false, Arc::clone(&dir), Backing::Zero);
        page_in(&c, system).expect("second pass evicts");
        assert!(c.is_resident());
        let survivor = if a.is_resident() { &a } else { &b };
        assert!(!dir.is_accessed(survivor.addr()), "second chance consumed");
    }
}
