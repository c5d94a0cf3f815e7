//! Per-process address spaces: the supplemental page table, the fault
//! entry points, and the operations the loader and system-call layer build
//! on (lazy segments, the initial stack, memory-mapped files).

use crate::fs::File;
use crate::mem::error::MemError;
use crate::mem::page::{self, Backing, Page};
use crate::mem::pagedir::PageDirectory;
use crate::mem::user;
use crate::sync::Mutex;
use crate::system::SystemState;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};
use marrowos_shared::mem::{
    page_aligned, page_round_down, OFFSET, PAGE_FRAME_SIZE, STACK_HEURISTIC, STACK_MAX,
};

pub type Pid = u16;
pub type AtomicPid = AtomicU16;

/// Handle of one memory-mapped file region.
pub type MapId = u32;

struct Mapping {
    id: MapId,
    base: usize,
    page_count: usize,
}

/// One user process's view of memory.
///
/// All operations here run on behalf of the process's own thread; only
/// eviction reaches into the address space from outside, and it does so
/// through the page descriptors, never through this table.
pub struct Process<'s> {
    pid: Pid,
    system: &'s SystemState,
    pagedir: Arc<PageDirectory>,
    /// The supplemental page table, keyed by page-aligned address.
    pages: Mutex<BTreeMap<usize, Arc<Page>>>,
    mappings: Mutex<Vec<Mapping>>,
    next_map_id: AtomicU32,
    /// Stack pointer saved on entry to the kernel; the stack-growth
    /// heuristic measures against it.
    stack_pointer: AtomicUsize,
}

impl<'s> Process<'s> {
    pub fn new(system: &'s SystemState) -> Self {
        let pid = system.allocate_pid();
        log::debug!("process {}: address space created", pid);
        Self {
            pid,
            system,
            pagedir: Arc::new(PageDirectory::new()),
            pages: Mutex::new(BTreeMap::new()),
            mappings: Mutex::new(Vec::new()),
            next_map_id: AtomicU32::new(1),
            stack_pointer: AtomicUsize::new(OFFSET),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn system(&self) -> &'s SystemState {
        self.system
    }

    pub fn pagedir(&self) -> &Arc<PageDirectory> {
        &self.pagedir
    }

    /// Records the user stack pointer saved by the trap machinery.
    pub fn set_stack_pointer(&self, sp: usize) {
        self.stack_pointer.store(sp, Ordering::Relaxed);
    }

    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer.load(Ordering::Relaxed)
    }

    /// Adds an anonymous zero-fill page at `addr`.
    ///
    /// Nothing is faulted in; the page gets a frame on first access.
    pub fn page_allocate(&self, addr: usize, read_only: bool) -> Result<Arc<Page>, MemError> {
        self.install_page(addr, read_only, Backing::Zero)
    }

    fn install_page(
        &self,
        addr: usize,
        read_only: bool,
        backing: Backing,
    ) -> Result<Arc<Page>, MemError> {
        if addr >= OFFSET {
            return Err(MemError::BadAddress);
        }
        let key = page_round_down(addr);
        let mut pages = self.pages.lock();
        if pages.contains_key(&key) {
            return Err(MemError::AlreadyMapped);
        }
        let page = Page::new(key, read_only, Arc::clone(&self.pagedir), backing);
        pages.insert(key, Arc::clone(&page));
        Ok(page)
    }

    /// The page exactly covering `addr`, if one exists. No stack growth.
    pub fn lookup(&self, addr: usize) -> Option<Arc<Page>> {
        self.pages.lock().get(&page_round_down(addr)).cloned()
    }

    /// The page covering `addr`, allocating a stack page when the address
    /// falls just below the saved stack pointer within the stack region.
    fn page_for_addr(&self, addr: usize) -> Option<Arc<Page>> {
        if addr >= OFFSET {
            return None;
        }
        if let Some(page) = self.lookup(addr) {
            return Some(page);
        }
        let sp = self.stack_pointer();
        if addr >= OFFSET - STACK_MAX && addr + STACK_HEURISTIC >= sp {
            log::trace!(
                "process {}: stack growth to {:#x} (sp {:#x})",
                self.pid,
                addr,
                sp
            );
            return self.page_allocate(addr, false).ok();
        }
        None
    }

    /// Faults in the page containing `fault_addr`.
    ///
    /// The page-fault handler calls this; a `NotMapped` result is a genuine
    /// segmentation violation and terminates the process.
    pub fn page_in(&self, fault_addr: usize) -> Result<(), MemError> {
        let page = self.page_for_addr(fault_addr).ok_or(MemError::NotMapped)?;
        log::trace!("process {}: fault at {:#x}", self.pid, fault_addr);
        page::page_in(&page, self.system)
    }

    /// Pins the page containing `addr` into memory, faulting it in if
    /// needed. The page stays locked until [`Process::page_unlock`].
    pub fn page_lock(&self, addr: usize, will_write: bool) -> Result<(), MemError> {
        let page = self.page_for_addr(addr).ok_or(MemError::NotMapped)?;
        if page.read_only() && will_write {
            return Err(MemError::ReadOnly);
        }
        page::lock_and_install(&page, self.system).map(|_| ())
    }

    /// Unpins a page locked with [`Process::page_lock`].
    pub fn page_unlock(&self, addr: usize) {
        let Some(page) = self.lookup(addr) else {
            debug_assert!(false, "unlocking an address with no page");
            return;
        };
        // The caller holds the frame lock, so the index cannot change
        // between this read and the unlock.
        let Some(index) = page.frame_index() else {
            debug_assert!(false, "unlocking a non-resident page");
            return;
        };
        self.system.frames.unlock(index);
    }

    /// Removes the page at `addr`, writing memory-mapped contents back to
    /// their file and dropping everything else, then freeing the frame and
    /// any swap slot.
    pub fn page_deallocate(&self, addr: usize) -> Result<(), MemError> {
        let key = page_round_down(addr);
        let page = self.lookup(key).ok_or(MemError::NotMapped)?;

        if let Some(index) = self.system.frames.lock(&page) {
            if page.is_writeback_file() && self.pagedir.is_dirty(key) {
                if let Err(e) = page::page_out(&page, self.system) {
                    self.system.frames.unlock(index);
                    return Err(e);
                }
            } else {
                // Private data dies with its descriptor; just unmap.
                self.pagedir.clear_page(key);
                page.set_frame_index(None);
            }
            self.system.frames.free(index);
        }
        if let Some(slot) = page.take_swap_slot() {
            self.system.swap.release_slot(slot);
        }
        self.pages.lock().remove(&key);
        Ok(())
    }

    /// Registers an executable segment for demand loading: `read_bytes`
    /// bytes of `file` starting at `offset`, then `zero_bytes` of zeros,
    /// spread over pages starting at `base`.
    ///
    /// # Panics
    ///
    /// `base` and `offset` must be page-aligned and `read_bytes +
    /// zero_bytes` a multiple of the page size, as produced by any sane
    /// executable layout.
    pub fn load_segment(
        &self,
        file: &File,
        offset: usize,
        base: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), MemError> {
        assert!(page_aligned(base));
        assert!(page_aligned(offset));
        assert!((read_bytes + zero_bytes) % PAGE_FRAME_SIZE == 0);

        let mut addr = base;
        let mut offset = offset;
        let mut read_left = read_bytes;
        let mut zero_left = zero_bytes;
        while read_left > 0 || zero_left > 0 {
            let page_read = usize::min(read_left, PAGE_FRAME_SIZE);
            let backing = if page_read > 0 {
                Backing::File {
                    file: file.reopen(),
                    offset,
                    bytes: page_read,
                    writeback: false,
                }
            } else {
                Backing::Zero
            };
            self.install_page(addr, !writable, backing)?;
            read_left -= page_read;
            zero_left -= PAGE_FRAME_SIZE - page_read;
            offset += page_read;
            addr += PAGE_FRAME_SIZE;
        }
        Ok(())
    }

    /// Creates the initial stack page just below the top of user space,
    /// copies `init` (the marshalled command line) to its top, and returns
    /// the initial stack pointer.
    pub fn setup_stack(&self, init: &[u8]) -> Result<usize, MemError> {
        assert!(init.len() <= PAGE_FRAME_SIZE);
        self.page_allocate(OFFSET - PAGE_FRAME_SIZE, false)?;
        // Word-align the stack pointer below the pushed bytes.
        let sp = OFFSET - init.len().next_multiple_of(core::mem::size_of::<u32>());
        self.set_stack_pointer(sp);
        user::copy_to_user(self, sp, init)?;
        Ok(sp)
    }

    /// Maps the whole of `file` at `addr` from a reopened handle, one
    /// write-back page per file page.
    pub fn mmap(&self, file: &File, addr: usize) -> Result<MapId, MemError> {
        if addr == 0 || !page_aligned(addr) {
            return Err(MemError::BadAddress);
        }
        let length = file.length();
        if length == 0 {
            return Err(MemError::BadAddress);
        }

        let file = file.reopen();
        let mut installed = 0usize;
        let mut offset = 0usize;
        while offset < length {
            let bytes = usize::min(PAGE_FRAME_SIZE, length - offset);
            let backing = Backing::File {
                file: file.reopen(),
                offset,
                bytes,
                writeback: true,
            };
            if let Err(e) = self.install_page(addr + offset, false, backing) {
                // Back out the partial mapping.
                for i in 0..installed {
                    let _ = self.page_deallocate(addr + i * PAGE_FRAME_SIZE);
                }
                return Err(e);
            }
            installed += 1;
            offset += PAGE_FRAME_SIZE;
        }

        let id = self.next_map_id.fetch_add(1, Ordering::Relaxed);
        self.mappings.lock().push(Mapping {
            id,
            base: addr,
            page_count: installed,
        });
        Ok(id)
    }

    /// Removes mapping `id`, writing changed pages back to the file.
    pub fn munmap(&self, id: MapId) -> Result<(), MemError> {
        let mapping = {
            let mut mappings = self.mappings.lock();
            let position = mappings
                .iter()
                .position(|m| m.id == id)
                .ok_or(MemError::NotMapped)?;
            mappings.swap_remove(position)
        };
        self.unmap(&mapping)
    }

    fn unmap(&self, mapping: &Mapping) -> Result<(), MemError> {
        let mut result = Ok(());
        for i in 0..mapping.page_count {
            let outcome = self.page_deallocate(mapping.base + i * PAGE_FRAME_SIZE);
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    }

    /// Destroys the address space at process exit: mappings are flushed,
    /// then every remaining page's frame and swap slot are released.
    pub fn page_exit(&self) {
        let mappings = core::mem::take(&mut *self.mappings.lock());
        for mapping in &mappings {
            if let Err(e) = self.unmap(mapping) {
                log::warn!(
                    "process {}: flushing mapping {} at exit failed: {}",
                    self.pid,
                    mapping.id,
                    e
                );
            }
        }

        let pages = core::mem::take(&mut *self.pages.lock());
        for (addr, page) in pages {
            if let Some(index) = self.system.frames.lock(&page) {
                self.pagedir.clear_page(addr);
                page.set_frame_index(None);
                self.system.frames.free(index);
            }
            if let Some(slot) = page.take_swap_slot() {
                self.system.swap.release_slot(slot);
            }
        }
        log::debug!("process {}: address space destroyed", self.pid);
    }
}

impl Drop for Process<'_> {
    fn drop(&mut self) {
        self.page_exit();
    }
}
