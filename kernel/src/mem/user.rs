//! Kernel access to user memory on behalf of the system-call layer.
//!
//! Each covered page is pinned with `page_lock` for the duration of the
//! copy, so an eviction cannot pull the frame out from under the transfer,
//! and the accessed/dirty bits are set the way the MMU would set them for
//! the same loads and stores.

use crate::mem::error::MemError;
use crate::user_program::process::Process;
use marrowos_shared::mem::{page_offset, OFFSET, PAGE_FRAME_SIZE};

/// Copies `data` into the user address space at `uaddr`.
pub fn copy_to_user(process: &Process, uaddr: usize, data: &[u8]) -> Result<(), MemError> {
    check_user_range(uaddr, data.len())?;
    let mut done = 0;
    while done < data.len() {
        let addr = uaddr + done;
        let chunk = chunk_len(addr, data.len() - done);
        process.page_lock(addr, true)?;
        let result = with_frame_ptr(process, addr, |frame_ptr| {
            // SAFETY: the frame is pinned and we stay within one page.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data[done..done + chunk].as_ptr(),
                    frame_ptr,
                    chunk,
                );
            }
            process.pagedir().set_accessed(addr, true);
            process.pagedir().set_dirty(addr, true);
        });
        process.page_unlock(addr);
        result?;
        done += chunk;
    }
    Ok(())
}

/// Copies `buf.len()` bytes out of the user address space at `uaddr`.
pub fn copy_from_user(process: &Process, uaddr: usize, buf: &mut [u8]) -> Result<(), MemError> {
    check_user_range(uaddr, buf.len())?;
    let mut done = 0;
    while done < buf.len() {
        let addr = uaddr + done;
        let chunk = chunk_len(addr, buf.len() - done);
        process.page_lock(addr, false)?;
        let result = with_frame_ptr(process, addr, |frame_ptr| {
            // SAFETY: the frame is pinned and we stay within one page.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    frame_ptr,
                    buf[done..done + chunk].as_mut_ptr(),
                    chunk,
                );
            }
            process.pagedir().set_accessed(addr, true);
        });
        process.page_unlock(addr);
        result?;
        done += chunk;
    }
    Ok(())
}

fn check_user_range(uaddr: usize, len: usize) -> Result<(), MemError> {
    let end = uaddr.checked_add(len).ok_or(MemError::BadAddress)?;
    if end > OFFSET {
        return Err(MemError::BadAddress);
    }
    Ok(())
}

fn chunk_len(addr: usize, remaining: usize) -> usize {
    usize::min(remaining, PAGE_FRAME_SIZE - page_offset(addr))
}

/// Runs `f` with a pointer to `addr`'s byte within its pinned frame.
fn with_frame_ptr(
    process: &Process,
    addr: usize,
    f: impl FnOnce(*mut u8),
) -> Result<(), MemError> {
    let (frame_index, _) = process
        .pagedir()
        .translate(addr)
        .ok_or(MemError::NotMapped)?;
    let frame = process.system().frames.frame(frame_index);
    // SAFETY: addr's page offset keeps the pointer within the frame.
    let frame_ptr = unsafe { frame.base_ptr().add(page_offset(addr)) };
    f(frame_ptr);
    Ok(())
}
