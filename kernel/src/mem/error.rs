use crate::block::block_error::BlockError;
use core::error::Error;
use core::fmt::{Debug, Display, Formatter};

/// Error type for virtual-memory operations.
///
/// Everything here is recoverable at the allocation boundary: the fault
/// handler and the system-call layer decide whether a failure kills the
/// process or just fails the call.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// A full clock sweep found neither a free frame nor an evictable page
    NoEvictableFrame,
    /// The swap device has no free slots
    NoSwapSlot,
    /// A page already exists at the given virtual address
    AlreadyMapped,
    /// No page covers the given virtual address
    NotMapped,
    /// Write access requested to a read-only page
    ReadOnly,
    /// The address is not a usable user virtual address
    BadAddress,
    /// The backing device failed during population or write-back
    Io(BlockError),
}

impl Debug for MemError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            MemError::NoEvictableFrame => write!(f, "NoEvictableFrame"),
            MemError::NoSwapSlot => write!(f, "NoSwapSlot"),
            MemError::AlreadyMapped => write!(f, "AlreadyMapped"),
            MemError::NotMapped => write!(f, "NotMapped"),
            MemError::ReadOnly => write!(f, "ReadOnly"),
            MemError::BadAddress => write!(f, "BadAddress"),
            MemError::Io(e) => write!(f, "Io({:?})", e),
        }
    }
}

impl Display for MemError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            MemError::NoEvictableFrame => write!(f, "no free or evictable frame"),
            MemError::NoSwapSlot => write!(f, "swap space exhausted"),
            MemError::AlreadyMapped => write!(f, "page already mapped at this address"),
            MemError::NotMapped => write!(f, "no page at this address"),
            MemError::ReadOnly => write!(f, "write access to a read-only page"),
            MemError::BadAddress => write!(f, "not a usable user address"),
            MemError::Io(e) => write!(f, "backing device error: {}", e),
        }
    }
}

impl Error for MemError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MemError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BlockError> for MemError {
    fn from(e: BlockError) -> Self {
        MemError::Io(e)
    }
}
