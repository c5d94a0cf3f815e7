// https://wiki.osdev.org/Paging
//
// One entry per mapped user page. The page_frame field names a slot in the
// frame table rather than a raw physical address, so the same entry layout
// works regardless of where the frame pool lives in kernel memory.

#![allow(clippy::cast_possible_truncation)]

use arbitrary_int::u20;
use bitbybit::bitfield;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame: u20,
}

impl PageTableEntry {
    /// Builds a present user-mode entry pointing at frame-table slot `frame`.
    ///
    /// Accessed and dirty start out clear, as after a hardware TLB fill of a
    /// never-touched mapping.
    pub fn mapping(frame: usize, writable: bool) -> Self {
        Self::default()
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame(u20::new(frame as u32))
    }

    /// The frame-table slot this entry maps.
    pub fn frame_index(&self) -> usize {
        self.page_frame().value() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_entry() {
        let pte = PageTableEntry::mapping(42, true);
        assert!(pte.present());
        assert!(pte.read_write());
        assert!(pte.user_supervisor());
        assert!(!pte.accessed());
        assert!(!pte.dirty());
        assert_eq!(pte.frame_index(), 42);

        let ro = PageTableEntry::mapping(7, false);
        assert!(!ro.read_write());
        assert_eq!(ro.frame_index(), 7);
    }

    #[test]
    fn test_flag_round_trip() {
        let pte = PageTableEntry::mapping(3, true)
            .with_accessed(true)
            .with_dirty(true);
        assert!(pte.accessed());
        assert!(pte.dirty());
        let cleared = pte.with_accessed(false);
        assert!(!cleared.accessed());
        assert!(cleared.dirty());
        assert_eq!(cleared.frame_index(), 3);
    }
}
