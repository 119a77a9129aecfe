//! Named memory images and cross-entry shares.

use crate::core::memory::pointer::MemoryPtr;
use crate::core::memory::Endianness;

/// Named fixed image, typically a ROM loaded by the machine.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    name: String,
    data: MemoryPtr,
    bytes: usize,
    width: u8,
    endianness: Endianness,
}

impl MemoryRegion {
    /// Zero-filled region of `bytes` bytes with `width`-byte elements.
    pub fn new(name: &str, bytes: usize, width: u8, endianness: Endianness) -> Self {
        Self::from_vec(name, vec![0; bytes], width, endianness)
    }

    /// Region over existing contents.
    pub fn from_vec(name: &str, data: Vec<u8>, width: u8, endianness: Endianness) -> Self {
        let bytes = data.len();
        Self {
            name: name.to_string(),
            data: MemoryPtr::from_vec(data),
            bytes,
            width,
            endianness,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> &MemoryPtr {
        &self.data
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Element width in bytes (1, 2, 4 or 8)
    pub fn bytewidth(&self) -> u8 {
        self.width
    }

    pub fn bitwidth(&self) -> u32 {
        self.width as u32 * 8
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// True when `[ptr, ptr + bytes)` lies inside the region.
    pub fn contains(&self, ptr: &MemoryPtr, bytes: usize) -> bool {
        self.data.contains(self.bytes, ptr, bytes)
    }
}

/// Named buffer shared by map entries across spaces.
///
/// The pointer is resolved once, by whichever block reaches it first.
#[derive(Debug, Clone)]
pub struct MemoryShare {
    name: String,
    ptr: Option<MemoryPtr>,
    bytes: usize,
    width: u32,
    endianness: Endianness,
}

impl MemoryShare {
    pub fn new(name: &str, bytes: usize, width: u32, endianness: Endianness) -> Self {
        Self {
            name: name.to_string(),
            ptr: None,
            bytes,
            width,
            endianness,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ptr(&self) -> Option<&MemoryPtr> {
        self.ptr.as_ref()
    }

    pub fn set_ptr(&mut self, ptr: MemoryPtr) {
        self.ptr = Some(ptr);
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Bus width in bits of the space the share was created in.
    pub fn bitwidth(&self) -> u32 {
        self.width
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }
}
