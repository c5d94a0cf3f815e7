use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use crate::sync::Mutex;
use alloc::boxed::Box;
use alloc::vec;

/// A block device backed by kernel memory.
///
/// Stands in for a real disk wherever one is registered: the swap partition,
/// the scratch device, and every device the VM core is tested against. The
/// sector store is locked per device, which is also what serializes
/// concurrent I/O the way a one-request-at-a-time disk would.
pub struct RamDisk {
    sectors: Mutex<Box<[u8]>>,
}

impl RamDisk {
    /// Creates a zero-filled RAM disk of `size` sectors.
    pub fn new(size: BlockSector) -> Self {
        Self {
            sectors: Mutex::new(vec![0u8; size as usize * BLOCK_SECTOR_SIZE].into_boxed_slice()),
        }
    }

    fn range(sector: BlockSector) -> core::ops::Range<usize> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        start..start + BLOCK_SECTOR_SIZE
    }
}

impl BlockOp for RamDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let sectors = self.sectors.lock();
        let range = Self::range(sector);
        if range.end > sectors.len() {
            return Err(BlockError::SectorOutOfBounds);
        }
        buf.copy_from_slice(&sectors[range]);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let mut sectors = self.sectors.lock();
        let range = Self::range(sector);
        if range.end > sectors.len() {
            return Err(BlockError::SectorOutOfBounds);
        }
        sectors[range].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_disk_reads_zero() {
        let disk = RamDisk::new(2);
        let mut buf = [0xffu8; BLOCK_SECTOR_SIZE];
        disk.read(1, &mut buf).expect("sector in bounds");
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sectors_are_independent() {
        let disk = RamDisk::new(2);
        disk.write(0, &[1u8; BLOCK_SECTOR_SIZE]).expect("in bounds");
        let mut buf = [0xffu8; BLOCK_SECTOR_SIZE];
        disk.read(1, &mut buf).expect("in bounds");
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_out_of_bounds() {
        let disk = RamDisk::new(1);
        let mut buf = [0u8; BLOCK_SECTOR_SIZE];
        assert_eq!(disk.read(1, &mut buf), Err(BlockError::SectorOutOfBounds));
    }
}
