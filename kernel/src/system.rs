//! Long-lived kernel state for the VM core.
//!
//! One `SystemState` is built at boot over the discovered frame pool and
//! registered block devices, and everything else takes it by reference, so
//! tests can build private instances instead of fighting over globals.

use crate::block::block_core::BlockManager;
use crate::mem::frame_table::FrameTable;
use crate::swapping::SwapSpace;
use crate::user_program::process::{AtomicPid, Pid};
use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use once_cell::race::OnceBox;

pub struct SystemState {
    pub frames: FrameTable,
    pub swap: SwapSpace,
    pub blocks: BlockManager,
    next_pid: AtomicPid,
}

impl SystemState {
    /// Builds the VM core over a frame pool and the registered devices.
    ///
    /// The swap space sizes itself to whatever swap device `blocks` holds.
    ///
    /// # Safety
    ///
    /// `frame_base` must point at `frame_count * PAGE_FRAME_SIZE` bytes that
    /// stay valid and unused by anything else for the life of the state.
    pub unsafe fn new(frame_base: NonNull<u8>, frame_count: usize, blocks: BlockManager) -> Self {
        let swap = SwapSpace::new(&blocks);
        Self {
            frames: FrameTable::new(frame_base, frame_count),
            swap,
            blocks,
            next_pid: AtomicPid::new(1),
        }
    }

    pub fn allocate_pid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if pid == 0 {
            panic!("PID overflow");
        }
        pid
    }
}

static SYSTEM: OnceBox<SystemState> = OnceBox::new();

/// Installs the boot-time system state. Panics if called twice; the kernel
/// cannot run with two frame tables.
///
/// # Safety
///
/// Same contract as [`SystemState::new`].
pub unsafe fn init(
    frame_base: NonNull<u8>,
    frame_count: usize,
    blocks: BlockManager,
) -> &'static SystemState {
    let state = Box::new(SystemState::new(frame_base, frame_count, blocks));
    if SYSTEM.set(state).is_err() {
        panic!("VM system already initialized");
    }
    system()
}

/// The boot-time system state. Panics before [`init`].
pub fn system() -> &'static SystemState {
    SYSTEM.get().expect("VM system not initialized")
}
