//! Anonymous RAM blocks allocated during initialization.

use crate::core::memory::pointer::MemoryPtr;
use crate::core::memory::{Offset, SpaceId};

/// Backing storage for one address range of one space.
#[derive(Debug, Clone)]
pub struct MemoryBlock {
    space: SpaceId,
    addrstart: Offset,
    addrend: Offset,
    data: MemoryPtr,
}

impl MemoryBlock {
    /// Wraps `memory`, or allocates `bytes` zeroed bytes when none is given.
    pub fn new(space: SpaceId, addrstart: Offset, addrend: Offset, bytes: usize, memory: Option<MemoryPtr>) -> Self {
        Self {
            space,
            addrstart,
            addrend,
            data: memory.unwrap_or_else(|| MemoryPtr::alloc(bytes)),
        }
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn addrstart(&self) -> Offset {
        self.addrstart
    }

    pub fn addrend(&self) -> Offset {
        self.addrend
    }

    pub fn data(&self) -> &MemoryPtr {
        &self.data
    }

    /// True when `addrstart..=addrend` of `space` lies inside the block.
    pub fn contains(&self, space: SpaceId, addrstart: Offset, addrend: Offset) -> bool {
        space == self.space && addrstart >= self.addrstart && addrend <= self.addrend
    }
}
