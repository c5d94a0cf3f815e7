//! The physical frame table: a fixed pool of page frames with second-chance
//! eviction.
//!
//! The scan lock serializes only victim *selection*. It is dropped before
//! the victim's write-back I/O, so one slow eviction does not stall every
//! other faulting thread. Each frame's own lock is a binary semaphore held
//! from the moment the frame is picked until its new page is installed, and
//! is the only thing that may guard changes to the frame/page pairing:
//! `frames[i].owner == Some(p)` exactly when `p.frame_index() == Some(i)`.

use crate::mem::error::MemError;
use crate::mem::page::{self, Page};
use crate::sync::{Mutex, Semaphore};
use crate::system::SystemState;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use marrowos_shared::mem::PAGE_FRAME_SIZE;

/// How many times a failed allocation attempt is repeated before giving up.
/// Transient failures (every frame locked by concurrent faulters) resolve
/// themselves once those faulters finish, so a couple of retries with a
/// pause in between is usually enough.
const ALLOCATE_ATTEMPTS: usize = 3;

/// A physical page frame.
pub struct Frame {
    /// Kernel virtual address of the frame's memory. Immutable after boot.
    base: NonNull<u8>,
    /// Held from frame selection until the owning page is installed or torn
    /// down. Not a guard-based mutex: eviction and pinning acquire and
    /// release across function boundaries.
    lock: Semaphore,
    /// The page whose contents currently occupy this frame.
    owner: UnsafeCell<Option<Arc<Page>>>,
}

// SAFETY: `owner` is only touched while holding `lock`, and `base` points
// into the frame pool, whose contents are likewise only read or written by
// the lock holder.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    fn new(base: NonNull<u8>) -> Self {
        Self {
            base,
            lock: Semaphore::new(1),
            owner: UnsafeCell::new(None),
        }
    }

    /// Kernel virtual address of this frame's memory.
    pub fn base_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub(crate) fn try_lock(&self) -> bool {
        self.lock.try_down()
    }

    pub(crate) fn lock(&self) {
        self.lock.down();
    }

    pub(crate) fn unlock(&self) {
        self.lock.up();
    }

    /// # Safety
    ///
    /// The caller must hold this frame's lock.
    pub(crate) unsafe fn owner(&self) -> Option<&Arc<Page>> {
        (*self.owner.get()).as_ref()
    }

    /// # Safety
    ///
    /// The caller must hold this frame's lock.
    pub(crate) unsafe fn set_owner(&self, owner: Option<Arc<Page>>) {
        *self.owner.get() = owner;
    }
}

/// All physical frames, discovered once at boot.
pub struct FrameTable {
    frames: Box<[Frame]>,
    /// Serializes the search phase of allocation and persists the clock
    /// hand between sweeps.
    scan: Mutex<usize>,
}

impl FrameTable {
    /// Builds one frame descriptor per page of the pool at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point at `count * PAGE_FRAME_SIZE` bytes that stay valid
    /// and are used for nothing else for the life of the table.
    pub unsafe fn new(base: NonNull<u8>, count: usize) -> Self {
        let frames: Vec<Frame> = (0..count)
            .map(|i| {
                // SAFETY: the pool is contiguous and non-empty, so every
                // page base stays in bounds and non-null.
                let frame_base = unsafe { base.as_ptr().add(i * PAGE_FRAME_SIZE) };
                Frame::new(unsafe { NonNull::new_unchecked(frame_base) })
            })
            .collect();
        log::info!("frame table: {} frames", count);
        Self {
            frames: frames.into_boxed_slice(),
            scan: Mutex::new(0),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&self, index: usize) -> &Frame {
        &self.frames[index]
    }

    /// One allocation attempt: claim a free frame, or evict.
    ///
    /// On success the returned frame is locked by the caller, owned by
    /// `page`, and `page` already records the frame index.
    fn try_allocate(&self, page: &Arc<Page>, system: &SystemState) -> Result<usize, MemError> {
        let mut hand = self.scan.lock();

        // Find a free frame.
        for (index, frame) in self.frames.iter().enumerate() {
            if !frame.try_lock() {
                continue;
            }
            // SAFETY: we hold the frame lock.
            unsafe {
                if frame.owner().is_none() {
                    frame.set_owner(Some(Arc::clone(page)));
                    page.set_frame_index(Some(index));
                    drop(hand);
                    return Ok(index);
                }
            }
            frame.unlock();
        }

        // No free frame. Run the clock over the table, giving each
        // recently-accessed page one second chance before evicting.
        for _ in 0..self.frames.len() * 2 {
            let index = *hand;
            *hand = (index + 1) % self.frames.len();

            let frame = &self.frames[index];
            if !frame.try_lock() {
                continue;
            }

            // SAFETY: we hold the frame lock.
            let victim = match unsafe { frame.owner() } {
                None => {
                    unsafe {
                        frame.set_owner(Some(Arc::clone(page)));
                    }
                    page.set_frame_index(Some(index));
                    drop(hand);
                    return Ok(index);
                }
                Some(victim) => {
                    if victim.accessed_recently() {
                        frame.unlock();
                        continue;
                    }
                    Arc::clone(victim)
                }
            };

            // Drop the scan lock before the write-back so other threads can
            // keep searching while this eviction waits on the disk.
            drop(hand);
            log::trace!(
                "evicting page {:#x} from frame {}",
                victim.addr(),
                index
            );
            return match page::page_out(&victim, system) {
                Ok(()) => {
                    // SAFETY: still holding the frame lock.
                    unsafe {
                        frame.set_owner(Some(Arc::clone(page)));
                    }
                    page.set_frame_index(Some(index));
                    Ok(index)
                }
                Err(e) => {
                    // The victim keeps the frame; the attempt fails.
                    frame.unlock();
                    Err(e)
                }
            };
        }

        drop(hand);
        Err(MemError::NoEvictableFrame)
    }

    /// Allocates and locks a frame for `page`, retrying a bounded number of
    /// times before reporting failure to the faulting caller.
    pub fn allocate(&self, page: &Arc<Page>, system: &SystemState) -> Result<usize, MemError> {
        let mut result = Err(MemError::NoEvictableFrame);
        for attempt in 0..ALLOCATE_ATTEMPTS {
            result = self.try_allocate(page, system);
            if result.is_ok() {
                return result;
            }
            if attempt + 1 < ALLOCATE_ATTEMPTS {
                retry_pause();
            }
        }
        if let Err(e) = &result {
            log::warn!(
                "frame allocation for page {:#x} failed after {} attempts: {}",
                page.addr(),
                ALLOCATE_ATTEMPTS,
                e
            );
        }
        result
    }

    /// Pins `page`'s frame against eviction, if it has one.
    ///
    /// Between reading `page.frame_index()` and acquiring the frame's lock
    /// the frame may be stolen by an eviction, so the index is re-checked
    /// under the lock and the acquisition retried. A page is only ever made
    /// resident by its own process, so once `None` is observed it stays
    /// `None` until the caller itself faults the page back in.
    pub fn lock(&self, page: &Page) -> Option<usize> {
        loop {
            let index = page.frame_index()?;
            let frame = &self.frames[index];
            frame.lock();
            if page.frame_index() == Some(index) {
                return Some(index);
            }
            frame.unlock();
        }
    }

    /// Releases frame `index` for use by another page. The caller must hold
    /// the frame's lock; any data in the frame is lost.
    pub fn free(&self, index: usize) {
        let frame = &self.frames[index];
        // SAFETY: the caller holds the frame lock.
        unsafe {
            frame.set_owner(None);
        }
        frame.unlock();
    }

    /// Unlocks frame `index`, allowing it to be evicted again. The caller
    /// must hold the frame's lock.
    pub fn unlock(&self, index: usize) {
        self.frames[index].unlock();
    }
}

#[cfg(not(target_os = "none"))]
fn retry_pause() {
    std::thread::sleep(core::time::Duration::from_millis(2));
}

#[cfg(target_os = "none")]
fn retry_pause() {
    for _ in 0..100_000 {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::page::Backing;
    use crate::mem::pagedir::PageDirectory;
    use crate::mem::test_support::make_system;

    fn anonymous_page(addr: usize) -> Arc<Page> {
        Page::new(addr, false, Arc::new(PageDirectory::new()), Backing::Zero)
    }

    /// Counts owned frames and checks the owner/frame pairing, locking each
    /// frame to look.
    fn check_accounting(table: &FrameTable) -> usize {
        let mut owned = 0;
        for index in 0..table.frame_count() {
            let frame = table.frame(index);
            frame.lock();
            // SAFETY: locked above.
            if let Some(owner) = unsafe { frame.owner() } {
                assert_eq!(owner.frame_index(), Some(index));
                owned += 1;
            }
            frame.unlock();
        }
        owned
    }

    #[test]
    fn test_allocate_free_frames() {
        let system = make_system(4, 0);
        let pages: Vec<_> = (0..4).map(|i| anonymous_page(i * 0x1000)).collect();

        let mut indices = Vec::new();
        for page in &pages {
            let index = system
                .frames
                .allocate(page, system)
                .expect("free frames available");
            system.frames.unlock(index);
            indices.push(index);
        }
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 4, "each page got its own frame");
        assert_eq!(check_accounting(&system.frames), 4);
    }

    #[test]
    fn test_allocation_fails_with_all_frames_pinned() {
        let system = make_system(2, 0);
        let a = anonymous_page(0x1000);
        let b = anonymous_page(0x2000);
        let ia = system.frames.allocate(&a, system).expect("frame for a");
        let ib = system.frames.allocate(&b, system).expect("frame for b");

        // Both frames stay locked, so there is nothing to scan or evict.
        let c = anonymous_page(0x3000);
        assert_eq!(
            system.frames.allocate(&c, system),
            Err(MemError::NoEvictableFrame)
        );

        system.frames.unlock(ia);
        system.frames.unlock(ib);
    }

    #[test]
    fn test_free_makes_frame_reusable() {
        let system = make_system(1, 0);
        let a = anonymous_page(0x1000);
        let index = system.frames.allocate(&a, system).expect("frame for a");
        a.set_frame_index(None);
        system.frames.free(index);
        assert_eq!(check_accounting(&system.frames), 0);

        let b = anonymous_page(0x2000);
        let index = system.frames.allocate(&b, system).expect("frame reused");
        system.frames.unlock(index);
        assert_eq!(check_accounting(&system.frames), 1);
    }

    #[test]
    fn test_lock_pins_resident_page() {
        let system = make_system(1, 0);
        let a = anonymous_page(0x1000);
        let index = system.frames.allocate(&a, system).expect("frame for a");
        system.frames.unlock(index);

        let pinned = system.frames.lock(&a).expect("page is resident");
        assert_eq!(pinned, index);
        assert!(!system.frames.frame(index).try_lock());
        system.frames.unlock(pinned);

        a.set_frame_index(None);
        assert_eq!(system.frames.lock(&a), None);
    }
}
