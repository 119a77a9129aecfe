// emumem-rs/src/core/memory/handler.rs

//! Terminal handlers.
//!
//! A handler services one access once the dispatch tree has resolved an
//! address. The set of kinds is closed, so each direction is a plain enum;
//! dispatch slots share handlers through `Rc`.

use crate::core::memory::bank::MemoryBank;
use crate::core::memory::delegate::{IoPort, ReadDelegate, WriteDelegate};
use crate::core::memory::pointer::MemoryPtr;
use crate::core::memory::units::{SubUnitName, SubUnitRead, SubUnitWrite, Units};
use crate::core::memory::word::NativeWord;
use crate::core::memory::Offset;
use log::warn;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Per-space values every handler of that space can observe.
#[derive(Debug)]
pub struct SpaceState {
    pub name: String,
    /// Hex digits needed to print an address
    pub addrchars: usize,
    /// Hex digits needed to print a native word
    pub datachars: usize,
    pub unmap: Cell<u64>,
    pub log_unmap: Cell<bool>,
}

impl SpaceState {
    pub fn new(name: &str, addrchars: usize, datachars: usize) -> Self {
        Self {
            name: name.to_string(),
            addrchars,
            datachars,
            unmap: Cell::new(0),
            log_unmap: Cell::new(true),
        }
    }
}

/// Maps a bus offset to a word index: `((offset - base) & mask) >> shift`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressInfo {
    pub base: Offset,
    pub mask: Offset,
    pub shift: u32,
}

impl AddressInfo {
    pub fn new(base: Offset, mask: Offset, shift: u32) -> Self {
        Self { base, mask, shift }
    }

    #[inline]
    pub fn index(&self, offset: Offset) -> Offset {
        (offset.wrapping_sub(self.base) & self.mask) >> self.shift
    }
}

/// Operations the dispatch tree needs from a terminal handler.
pub trait HandlerEntry: Sized {
    /// Lane sub-handler type used by the units variant
    type Sub: Clone;

    fn name(&self) -> String;

    fn as_units(&self) -> Option<&Units<Self::Sub>>;

    fn from_units(units: Units<Self::Sub>) -> Self;

    /// Direct pointer to the word backing `offset`, for memory-like handlers.
    fn get_ptr(&self, offset: Offset) -> Option<MemoryPtr>;
}

/// Read-side handler of a `W`-wide bus.
pub enum ReadHandler<W: NativeWord> {
    /// Logs (when enabled) and returns the unmapped value
    Unmapped(Rc<SpaceState>),
    /// Returns the unmapped value silently
    Nop(Rc<SpaceState>),
    /// Fixed memory, base possibly supplied later by a bank notifier
    Memory {
        info: AddressInfo,
        base: RefCell<Option<MemoryPtr>>,
    },
    /// Memory seen through a bank's current entry
    Bank { info: AddressInfo, bank: Rc<MemoryBank> },
    Delegate { info: AddressInfo, delegate: ReadDelegate<W> },
    IoPort(Rc<dyn IoPort>),
    Units(Units<SubReadHandler>),
}

impl<W: NativeWord> ReadHandler<W> {
    /// Memory handler over `base`, or pending a base when `None`.
    pub fn memory(info: AddressInfo, base: Option<MemoryPtr>) -> Self {
        ReadHandler::Memory {
            info,
            base: RefCell::new(base),
        }
    }

    #[inline]
    pub fn read(&self, offset: Offset, mask: W) -> W {
        match self {
            ReadHandler::Unmapped(space) => {
                if space.log_unmap.get() {
                    warn!(
                        "unmapped {} memory read from {:0ac$X} & {:0dc$X}",
                        space.name,
                        offset,
                        mask,
                        ac = space.addrchars,
                        dc = space.datachars
                    );
                }
                W::from_u64(space.unmap.get())
            }
            ReadHandler::Nop(space) => W::from_u64(space.unmap.get()),
            ReadHandler::Memory { info, base } => base
                .borrow()
                .as_ref()
                .and_then(|ptr| ptr.read::<W>(info.index(offset) as usize))
                .unwrap_or_default(),
            ReadHandler::Bank { info, bank } => bank.read::<W>(info.index(offset) as usize),
            ReadHandler::Delegate { info, delegate } => delegate.call(info.index(offset), mask),
            ReadHandler::IoPort(port) => W::from_u64(port.read() as u64),
            ReadHandler::Units(units) => W::from_u64(units.read(offset, mask.to_u64())),
        }
    }

    /// Supplies the base of a memory handler created before its storage.
    pub fn set_base(&self, ptr: &MemoryPtr) {
        if let ReadHandler::Memory { base, .. } = self {
            *base.borrow_mut() = Some(ptr.clone());
        }
    }
}

impl<W: NativeWord> HandlerEntry for ReadHandler<W> {
    type Sub = SubReadHandler;

    fn name(&self) -> String {
        match self {
            ReadHandler::Unmapped(_) => "unmapped".to_string(),
            ReadHandler::Nop(_) => "nop".to_string(),
            ReadHandler::Memory { info, .. } => format!("memory@{:x}", info.base),
            ReadHandler::Bank { bank, .. } => bank.name().to_string(),
            ReadHandler::Delegate { delegate, .. } => delegate.name().to_string(),
            ReadHandler::IoPort(port) => port.tag().to_string(),
            ReadHandler::Units(units) => units.name(),
        }
    }

    fn as_units(&self) -> Option<&Units<SubReadHandler>> {
        match self {
            ReadHandler::Units(units) => Some(units),
            _ => None,
        }
    }

    fn from_units(units: Units<SubReadHandler>) -> Self {
        ReadHandler::Units(units)
    }

    fn get_ptr(&self, offset: Offset) -> Option<MemoryPtr> {
        match self {
            ReadHandler::Memory { info, base } => base
                .borrow()
                .as_ref()
                .map(|ptr| ptr.add(info.index(offset) as usize * W::BYTES)),
            ReadHandler::Bank { info, bank } => bank
                .base()
                .map(|ptr| ptr.add(info.index(offset) as usize * W::BYTES)),
            _ => None,
        }
    }
}

/// Write-side handler of a `W`-wide bus.
pub enum WriteHandler<W: NativeWord> {
    Unmapped(Rc<SpaceState>),
    Nop(Rc<SpaceState>),
    Memory {
        info: AddressInfo,
        base: RefCell<Option<MemoryPtr>>,
    },
    Bank { info: AddressInfo, bank: Rc<MemoryBank> },
    Delegate { info: AddressInfo, delegate: WriteDelegate<W> },
    IoPort(Rc<dyn IoPort>),
    Units(Units<SubWriteHandler>),
}

impl<W: NativeWord> WriteHandler<W> {
    pub fn memory(info: AddressInfo, base: Option<MemoryPtr>) -> Self {
        WriteHandler::Memory {
            info,
            base: RefCell::new(base),
        }
    }

    #[inline]
    pub fn write(&self, offset: Offset, data: W, mask: W) {
        match self {
            WriteHandler::Unmapped(space) => {
                if space.log_unmap.get() {
                    warn!(
                        "unmapped {} memory write to {:0ac$X} = {:0dc$X} & {:0dc$X}",
                        space.name,
                        offset,
                        data,
                        mask,
                        ac = space.addrchars,
                        dc = space.datachars
                    );
                }
            }
            WriteHandler::Nop(_) => {}
            WriteHandler::Memory { info, base } => {
                if let Some(ptr) = base.borrow().as_ref() {
                    merge_word(ptr, info.index(offset) as usize, data, mask);
                }
            }
            WriteHandler::Bank { info, bank } => bank.write::<W>(info.index(offset) as usize, data, mask),
            WriteHandler::Delegate { info, delegate } => delegate.call(info.index(offset), data, mask),
            WriteHandler::IoPort(port) => port.write(data.to_u64() as u32, mask.to_u64() as u32),
            WriteHandler::Units(units) => units.write(offset, data.to_u64(), mask.to_u64()),
        }
    }

    pub fn set_base(&self, ptr: &MemoryPtr) {
        if let WriteHandler::Memory { base, .. } = self {
            *base.borrow_mut() = Some(ptr.clone());
        }
    }
}

impl<W: NativeWord> HandlerEntry for WriteHandler<W> {
    type Sub = SubWriteHandler;

    fn name(&self) -> String {
        match self {
            WriteHandler::Unmapped(_) => "unmapped".to_string(),
            WriteHandler::Nop(_) => "nop".to_string(),
            WriteHandler::Memory { info, .. } => format!("memory@{:x}", info.base),
            WriteHandler::Bank { bank, .. } => bank.name().to_string(),
            WriteHandler::Delegate { delegate, .. } => delegate.name().to_string(),
            WriteHandler::IoPort(port) => port.tag().to_string(),
            WriteHandler::Units(units) => units.name(),
        }
    }

    fn as_units(&self) -> Option<&Units<SubWriteHandler>> {
        match self {
            WriteHandler::Units(units) => Some(units),
            _ => None,
        }
    }

    fn from_units(units: Units<SubWriteHandler>) -> Self {
        WriteHandler::Units(units)
    }

    fn get_ptr(&self, offset: Offset) -> Option<MemoryPtr> {
        match self {
            WriteHandler::Memory { info, base } => base
                .borrow()
                .as_ref()
                .map(|ptr| ptr.add(info.index(offset) as usize * W::BYTES)),
            WriteHandler::Bank { info, bank } => bank
                .base()
                .map(|ptr| ptr.add(info.index(offset) as usize * W::BYTES)),
            _ => None,
        }
    }
}

/// Read-modify-write of one word under `mask`.
#[inline]
pub(crate) fn merge_word<W: NativeWord>(ptr: &MemoryPtr, index: usize, data: W, mask: W) {
    if let Some(old) = ptr.read::<W>(index) {
        ptr.write::<W>(index, (old & !mask) | (data & mask));
    }
}

/// Narrow handler wrapped by a units handler lane.
#[derive(Clone)]
pub enum SubReadHandler {
    W8(Rc<ReadHandler<u8>>),
    W16(Rc<ReadHandler<u16>>),
    W32(Rc<ReadHandler<u32>>),
}

impl SubUnitRead for SubReadHandler {
    #[inline]
    fn read(&self, offset: Offset, mask: u64) -> u64 {
        match self {
            SubReadHandler::W8(h) => h.read(offset, u8::from_u64(mask)).to_u64(),
            SubReadHandler::W16(h) => h.read(offset, u16::from_u64(mask)).to_u64(),
            SubReadHandler::W32(h) => h.read(offset, u32::from_u64(mask)).to_u64(),
        }
    }
}

impl SubUnitName for SubReadHandler {
    fn name(&self) -> String {
        match self {
            SubReadHandler::W8(h) => h.name(),
            SubReadHandler::W16(h) => h.name(),
            SubReadHandler::W32(h) => h.name(),
        }
    }
}

#[derive(Clone)]
pub enum SubWriteHandler {
    W8(Rc<WriteHandler<u8>>),
    W16(Rc<WriteHandler<u16>>),
    W32(Rc<WriteHandler<u32>>),
}

impl SubUnitWrite for SubWriteHandler {
    #[inline]
    fn write(&self, offset: Offset, data: u64, mask: u64) {
        match self {
            SubWriteHandler::W8(h) => h.write(offset, u8::from_u64(data), u8::from_u64(mask)),
            SubWriteHandler::W16(h) => h.write(offset, u16::from_u64(data), u16::from_u64(mask)),
            SubWriteHandler::W32(h) => h.write(offset, u32::from_u64(data), u32::from_u64(mask)),
        }
    }
}

impl SubUnitName for SubWriteHandler {
    fn name(&self) -> String {
        match self {
            SubWriteHandler::W8(h) => h.name(),
            SubWriteHandler::W16(h) => h.name(),
            SubWriteHandler::W32(h) => h.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::units::UnitsDescriptor;

    fn state() -> Rc<SpaceState> {
        let state = SpaceState::new("program", 4, 4);
        state.unmap.set(0xffff);
        Rc::new(state)
    }

    #[test]
    fn test_address_info_index() {
        let info = AddressInfo::new(0x4000, 0x3fff, 1);
        assert_eq!(info.index(0x4002), 1);
        assert_eq!(info.index(0x8002), 1);
    }

    #[test]
    fn test_memory_read_write() {
        let ptr = MemoryPtr::alloc(8);
        let info = AddressInfo::new(0x100, 0x7, 1);
        let r = ReadHandler::<u16>::memory(info, Some(ptr.clone()));
        let w = WriteHandler::<u16>::memory(info, Some(ptr.clone()));
        w.write(0x102, 0x1234, 0xffff);
        w.write(0x102, 0xabcd, 0xff00);
        assert_eq!(r.read(0x102, 0xffff), 0xab34);
        assert_eq!(ptr.read::<u16>(1), Some(0xab34));
        assert_eq!(r.name(), "memory@100");
        assert!(r.get_ptr(0x104).map(|p| p.ptr_eq(&ptr.add(4))).unwrap_or(false));
    }

    #[test]
    fn test_memory_late_base() {
        let info = AddressInfo::new(0, 0xff, 0);
        let r = ReadHandler::<u8>::memory(info, None);
        assert_eq!(r.read(3, 0xff), 0);
        let ptr = MemoryPtr::alloc(256);
        ptr.write::<u8>(3, 0x77);
        r.set_base(&ptr);
        assert_eq!(r.read(3, 0xff), 0x77);
    }

    #[test]
    fn test_unmapped_and_nop() {
        let s = state();
        let r = ReadHandler::<u16>::Unmapped(Rc::clone(&s));
        let n = ReadHandler::<u16>::Nop(Rc::clone(&s));
        assert_eq!(r.read(0x10, 0xffff), 0xffff);
        s.unmap.set(0);
        assert_eq!(n.read(0x10, 0xffff), 0);
        assert_eq!(r.name(), "unmapped");
        assert_eq!(n.name(), "nop");
        assert!(r.get_ptr(0).is_none());
        WriteHandler::<u16>::Unmapped(s).write(0x10, 1, 0xffff);
    }

    #[test]
    fn test_delegate_offset() {
        let info = AddressInfo::new(0x8000, 0x0fff, 0);
        let r = ReadHandler::Delegate {
            info,
            delegate: ReadDelegate::<u8>::new("status", |offset, _| offset as u8),
        };
        assert_eq!(r.read(0x8012, 0xff), 0x12);
        assert_eq!(r.name(), "status");
    }

    #[test]
    fn test_units_over_sub_delegates() {
        let desc = UnitsDescriptor::new(1, 0, false, 0, 0, 0xff, 0xff, 0xffff, 0).unwrap();
        let sub = Rc::new(ReadHandler::Delegate {
            info: AddressInfo::new(desc.handler_start(), desc.handler_mask(), 0),
            delegate: ReadDelegate::<u8>::new("byte", |offset, _| 0x10 + offset as u8),
        });
        let units = Units::new(&desc, 0b11, &SubReadHandler::W8(sub), 0);
        let r = ReadHandler::<u16>::Units(units);
        assert_eq!(r.read(4, 0xffff), 0x1514);
        assert_eq!(r.read(4, 0xff00), 0x1500);
        assert_eq!(r.name(), "7-0:7-0:0:0:0:byte 15-8:15-8:0:1:8:byte");
    }
}
