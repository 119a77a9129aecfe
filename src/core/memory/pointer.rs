//! Shared byte buffers and offsets into them.
//!
//! Banks, regions, shares, blocks and memory handlers all point into the same
//! storage, so backing memory is a reference-counted byte vector and a
//! "pointer" is that vector plus a byte offset. Words are stored in host
//! byte order.

use crate::core::memory::word::NativeWord;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Backing storage shared between every owner of a memory range.
pub type MemoryBuffer = Rc<RefCell<Vec<u8>>>;

/// Position inside a shared byte buffer.
#[derive(Clone)]
pub struct MemoryPtr {
    buffer: MemoryBuffer,
    offset: usize,
}

impl MemoryPtr {
    /// Points at the start of `buffer`.
    pub fn new(buffer: MemoryBuffer) -> Self {
        Self { buffer, offset: 0 }
    }

    /// Allocates a zero-filled buffer of `bytes` bytes.
    pub fn alloc(bytes: usize) -> Self {
        Self::new(Rc::new(RefCell::new(vec![0; bytes])))
    }

    /// Wraps existing data.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::new(Rc::new(RefCell::new(data)))
    }

    pub fn buffer(&self) -> &MemoryBuffer {
        &self.buffer
    }

    /// Byte offset inside the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Pointer `bytes` further into the same buffer.
    pub fn add(&self, bytes: usize) -> Self {
        Self {
            buffer: Rc::clone(&self.buffer),
            offset: self.offset + bytes,
        }
    }

    /// Bytes available from this position to the end of the buffer.
    pub fn len(&self) -> usize {
        self.buffer.borrow().len().saturating_sub(self.offset)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same buffer and same offset.
    pub fn ptr_eq(&self, other: &MemoryPtr) -> bool {
        Rc::ptr_eq(&self.buffer, &other.buffer) && self.offset == other.offset
    }

    /// True when `[other, other + bytes)` lies inside `[self, self + len)`.
    pub fn contains(&self, len: usize, other: &MemoryPtr, bytes: usize) -> bool {
        Rc::ptr_eq(&self.buffer, &other.buffer)
            && other.offset >= self.offset
            && other.offset + bytes <= self.offset + len
    }

    /// Reads the `index`-th word of type `W`, or `None` past the end.
    #[inline]
    pub fn read<W: NativeWord>(&self, index: usize) -> Option<W> {
        let start = self.offset + index * W::BYTES;
        let buffer = self.buffer.borrow();
        buffer
            .get(start..start + W::BYTES)
            .map(bytemuck::pod_read_unaligned::<W>)
    }

    /// Writes the `index`-th word of type `W`; out-of-range writes are dropped.
    #[inline]
    pub fn write<W: NativeWord>(&self, index: usize, value: W) -> bool {
        let start = self.offset + index * W::BYTES;
        let mut buffer = self.buffer.borrow_mut();
        match buffer.get_mut(start..start + W::BYTES) {
            Some(slot) => {
                slot.copy_from_slice(bytemuck::bytes_of(&value));
                true
            }
            None => false,
        }
    }

    /// Copies `data` in at byte position `pos`, clipped to the buffer.
    pub fn copy_from(&self, pos: usize, data: &[u8]) {
        let mut buffer = self.buffer.borrow_mut();
        let start = (self.offset + pos).min(buffer.len());
        let end = (start + data.len()).min(buffer.len());
        buffer[start..end].copy_from_slice(&data[..end - start]);
    }

    /// Copies `bytes` bytes out from byte position `pos`, clipped to the buffer.
    pub fn to_vec(&self, pos: usize, bytes: usize) -> Vec<u8> {
        let buffer = self.buffer.borrow();
        let start = (self.offset + pos).min(buffer.len());
        let end = (start + bytes).min(buffer.len());
        buffer[start..end].to_vec()
    }
}

impl fmt::Debug for MemoryPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryPtr({:p}+{:#x})", Rc::as_ptr(&self.buffer), self.offset)
    }
}
