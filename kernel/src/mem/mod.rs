pub mod error;
pub mod frame_table;
pub mod page;
pub mod pagedir;
pub mod user;

pub use error::MemError;
pub use frame_table::{Frame, FrameTable};
pub use page::{Backing, Page};
pub use pagedir::PageDirectory;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::block::block_core::{BlockDriver, BlockManager, BlockSector, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use crate::swapping::PAGE_SECTORS;
    use crate::system::SystemState;
    use alloc::boxed::Box;
    use alloc::vec;
    use core::ptr::NonNull;
    use marrowos_shared::mem::PAGE_FRAME_SIZE;

    /// Builds a system over a leaked frame pool, with an optional RAM-backed
    /// swap device. Tests leak a few pages each; the process exits anyway.
    pub(crate) fn make_system(frames: usize, swap_slots: usize) -> &'static SystemState {
        let pool = Box::leak(vec![0u8; frames * PAGE_FRAME_SIZE].into_boxed_slice());
        let base = NonNull::new(pool.as_mut_ptr()).expect("pool allocation is non-null");

        let mut blocks = BlockManager::new();
        if swap_slots > 0 {
            let sectors = (swap_slots * PAGE_SECTORS) as BlockSector;
            blocks.register_block(
                BlockType::Swap,
                "swap0",
                sectors,
                BlockDriver::Ram(RamDisk::new(sectors)),
            );
        }

        // SAFETY: the pool is leaked, so it outlives the (also leaked) table
        // and nothing else uses it.
        Box::leak(Box::new(unsafe { SystemState::new(base, frames, blocks) }))
    }

    /// The page of memory behind frame `index`.
    ///
    /// # Safety
    ///
    /// Races with concurrent users of the frame unless the caller holds the
    /// frame's lock or is otherwise alone with the system.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn frame_bytes(system: &SystemState, index: usize) -> &mut [u8] {
        core::slice::from_raw_parts_mut(system.frames.frame(index).base_ptr(), PAGE_FRAME_SIZE)
    }
}
