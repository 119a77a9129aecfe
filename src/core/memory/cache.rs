// emumem-rs/src/core/memory/cache.rs

//! Single-entry access cache.
//!
//! Remembers the last handler resolved per direction together with the range
//! it covers, so accesses that stay inside that range skip the tree walk.
//! The owning space invalidates every cache it handed out on each mutation.

use crate::core::memory::access::{BusGeometry, NativeAccess};
use crate::core::memory::dispatch::{DispatchNode, DispatchRoots};
use crate::core::memory::handler::{HandlerEntry, ReadHandler, WriteHandler};
use crate::core::memory::pointer::MemoryPtr;
use crate::core::memory::word::NativeWord;
use crate::core::memory::{Offset, ReadOrWrite};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Last resolution of one direction.
struct CacheEntry<H> {
    start: Cell<Offset>,
    end: Cell<Offset>,
    handler: RefCell<Option<Rc<H>>>,
}

impl<H: HandlerEntry> CacheEntry<H> {
    fn new() -> Self {
        Self {
            start: Cell::new(1),
            end: Cell::new(0),
            handler: RefCell::new(None),
        }
    }

    fn invalidate(&self) {
        self.start.set(1);
        self.end.set(0);
        *self.handler.borrow_mut() = None;
    }

    fn is_valid(&self) -> bool {
        self.start.get() <= self.end.get()
    }

    /// Handler for `address`, walking `root` on a miss.
    fn resolve(&self, root: &RefCell<DispatchNode<H>>, address: Offset) -> Rc<H> {
        if self.is_valid() && self.start.get() <= address && address <= self.end.get() {
            if let Some(handler) = self.handler.borrow().as_ref() {
                return Rc::clone(handler);
            }
        }
        let (range, handler) = root.borrow().lookup(address);
        self.start.set(range.start);
        self.end.set(range.end);
        *self.handler.borrow_mut() = Some(Rc::clone(&handler));
        handler
    }
}

/// Cached accessor over one space.
pub struct MemoryAccessCache<W: NativeWord, const SHIFT: i8, const BIG: bool> {
    addrmask: Offset,
    roots: Rc<DispatchRoots<W>>,
    read: CacheEntry<ReadHandler<W>>,
    write: CacheEntry<WriteHandler<W>>,
}

impl<W: NativeWord, const SHIFT: i8, const BIG: bool> MemoryAccessCache<W, SHIFT, BIG> {
    pub(crate) fn new(addrmask: Offset, roots: Rc<DispatchRoots<W>>) -> Self {
        Self {
            addrmask,
            roots,
            read: CacheEntry::new(),
            write: CacheEntry::new(),
        }
    }

    /// Forgets the cached handler of the given directions.
    pub fn invalidate(&self, mode: ReadOrWrite) {
        if mode.contains(ReadOrWrite::READ) {
            self.read.invalidate();
        }
        if mode.contains(ReadOrWrite::WRITE) {
            self.write.invalidate();
        }
    }

    /// Range covered by the cached read handler, if any.
    pub fn read_range(&self) -> Option<(Offset, Offset)> {
        self.read.is_valid().then(|| (self.read.start.get(), self.read.end.get()))
    }

    pub fn write_range(&self) -> Option<(Offset, Offset)> {
        self.write.is_valid().then(|| (self.write.start.get(), self.write.end.get()))
    }

    /// Direct pointer to the word read at `address`, when it is plain memory.
    pub fn read_ptr(&self, address: Offset) -> Option<MemoryPtr> {
        let address = address & self.addrmask;
        self.read.resolve(&self.roots.read, address).get_ptr(address)
    }

    pub fn write_ptr(&self, address: Offset) -> Option<MemoryPtr> {
        let address = address & self.addrmask;
        self.write.resolve(&self.roots.write, address).get_ptr(address)
    }
}

impl<W: NativeWord, const SHIFT: i8, const BIG: bool> NativeAccess for MemoryAccessCache<W, SHIFT, BIG> {
    fn geometry(&self) -> BusGeometry {
        BusGeometry::new(W::WIDTH, SHIFT, BIG)
    }

    fn addrmask(&self) -> Offset {
        self.addrmask
    }

    #[inline]
    fn read_native(&self, address: Offset, mask: u64) -> u64 {
        let address = address & self.addrmask;
        let handler = self.read.resolve(&self.roots.read, address);
        handler.read(address, W::from_u64(mask)).to_u64()
    }

    #[inline]
    fn write_native(&self, address: Offset, data: u64, mask: u64) {
        let address = address & self.addrmask;
        let handler = self.write.resolve(&self.roots.write, address);
        handler.write(address, W::from_u64(data), W::from_u64(mask));
    }
}
