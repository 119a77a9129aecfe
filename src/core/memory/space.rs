// emumem-rs/src/core/memory/space.rs

//! Address spaces.
//!
//! A space owns the read and write dispatch roots of one bus and exposes the
//! install surface over them. Each supported (width, shift, endianness)
//! triple is its own monomorphized [`AddressSpaceSpecific`]; the rest of the
//! machine talks to it through the object-safe [`AddressSpace`] trait.

use crate::core::memory::access::{BusGeometry, NativeAccess};
use crate::core::memory::bank::MemoryBank;
use crate::core::memory::block::MemoryBlock;
use crate::core::memory::cache::MemoryAccessCache;
use crate::core::memory::delegate::{AnyReadDelegate, AnyWriteDelegate};
use crate::core::memory::dispatch::{DispatchNode, DispatchRoots, HandlerRange, MismatchedPatch};
use crate::core::memory::handler::{
    AddressInfo, HandlerEntry, ReadHandler, SpaceState, SubReadHandler, SubWriteHandler, WriteHandler,
};
use crate::core::memory::manager::{MachinePhase, MemoryContext};
use crate::core::memory::map::{AddressMap, AddressMapEntry, InstallRange, MapHandler};
use crate::core::memory::pointer::MemoryPtr;
use crate::core::memory::region::MemoryShare;
use crate::core::memory::units::UnitsDescriptor;
use crate::core::memory::validate::AddressCheck;
use crate::core::memory::word::NativeWord;
use crate::core::memory::{
    Endianness, MemoryError, MemoryResult, Offset, ReadOrWrite, SpaceId, MEMORY_BLOCK_CHUNK,
};
use log::debug;
use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Static description of a bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpaceConfig {
    pub name: String,
    pub endianness: Endianness,
    /// Bus width in bits (8, 16, 32 or 64)
    pub data_width: u32,
    /// Address width in bits (1 to 32)
    pub addr_width: u32,
    /// Address granularity: positive when one byte spans several addresses,
    /// negative when one address spans several bytes
    pub addr_shift: i8,
    /// Logical address width, for spaces translated by an MMU
    pub logaddr_width: u32,
}

impl AddressSpaceConfig {
    pub fn new(name: &str, endianness: Endianness, data_width: u32, addr_width: u32, addr_shift: i8) -> Self {
        Self {
            name: name.to_string(),
            endianness,
            data_width,
            addr_width,
            addr_shift,
            logaddr_width: addr_width,
        }
    }

    pub fn with_logaddr_width(mut self, logaddr_width: u32) -> Self {
        self.logaddr_width = logaddr_width;
        self
    }

    pub fn addr2byte(&self, address: Offset) -> Offset {
        if self.addr_shift < 0 {
            address << -self.addr_shift
        } else {
            address >> self.addr_shift
        }
    }

    pub fn addr2byte_end(&self, address: Offset) -> Offset {
        if self.addr_shift < 0 {
            (address << -self.addr_shift) | ((1 << -self.addr_shift) - 1)
        } else {
            address >> self.addr_shift
        }
    }

    pub fn byte2addr(&self, address: Offset) -> Offset {
        if self.addr_shift > 0 {
            address << self.addr_shift
        } else {
            address >> -self.addr_shift
        }
    }

    pub fn byte2addr_end(&self, address: Offset) -> Offset {
        if self.addr_shift > 0 {
            (address << self.addr_shift) | ((1 << self.addr_shift) - 1)
        } else {
            address >> -self.addr_shift
        }
    }

    /// Bytes spanned by `start..=end`.
    pub fn range_bytes(&self, start: Offset, end: Offset) -> usize {
        let len = (end as u64).wrapping_sub(start as u64) + 1;
        let bytes = if self.addr_shift < 0 {
            len << -self.addr_shift
        } else {
            len >> self.addr_shift
        };
        bytes as usize
    }
}

/// Object-safe view of an address space.
pub trait AddressSpace: NativeAccess {
    fn id(&self) -> SpaceId;
    fn name(&self) -> &str;
    /// Tag of the device owning the space
    fn device(&self) -> &str;
    /// Index of the space inside its device (0 is the program space)
    fn spacenum(&self) -> usize;
    fn config(&self) -> &AddressSpaceConfig;

    fn data_width(&self) -> u32 {
        self.config().data_width
    }

    fn addr_width(&self) -> u32 {
        self.config().addr_width
    }

    fn addr_shift(&self) -> i8 {
        self.config().addr_shift
    }

    fn endianness(&self) -> Endianness {
        self.config().endianness
    }

    fn logaddrmask(&self) -> Offset;
    fn addrchars(&self) -> usize;
    fn logaddrchars(&self) -> usize;

    fn unmap_value(&self) -> u64;
    fn set_unmap_value(&self, value: u64);
    fn log_unmap(&self) -> bool;
    fn set_log_unmap(&self, log: bool);

    /// Installs the nop (`quiet`) or logging unmapped handler over a range.
    fn unmap_generic(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        rw: ReadOrWrite,
        quiet: bool,
    ) -> MemoryResult<()>;

    fn unmap_read(&mut self, start: Offset, end: Offset, mirror: Offset) -> MemoryResult<()> {
        self.unmap_generic(start, end, mirror, ReadOrWrite::READ, false)
    }

    fn unmap_write(&mut self, start: Offset, end: Offset, mirror: Offset) -> MemoryResult<()> {
        self.unmap_generic(start, end, mirror, ReadOrWrite::WRITE, false)
    }

    fn unmap_readwrite(&mut self, start: Offset, end: Offset, mirror: Offset) -> MemoryResult<()> {
        self.unmap_generic(start, end, mirror, ReadOrWrite::READWRITE, false)
    }

    fn nop_read(&mut self, start: Offset, end: Offset, mirror: Offset) -> MemoryResult<()> {
        self.unmap_generic(start, end, mirror, ReadOrWrite::READ, true)
    }

    fn nop_write(&mut self, start: Offset, end: Offset, mirror: Offset) -> MemoryResult<()> {
        self.unmap_generic(start, end, mirror, ReadOrWrite::WRITE, true)
    }

    fn nop_readwrite(&mut self, start: Offset, end: Offset, mirror: Offset) -> MemoryResult<()> {
        self.unmap_generic(start, end, mirror, ReadOrWrite::READWRITE, true)
    }

    /// Installs memory over a range, backed by `base`, by memory the map or
    /// earlier blocks already provide, or by a fresh block.
    fn install_ram_generic(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        rw: ReadOrWrite,
        base: Option<MemoryPtr>,
    ) -> MemoryResult<()>;

    fn install_ram(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        base: Option<MemoryPtr>,
    ) -> MemoryResult<()> {
        self.install_ram_generic(ctx, start, end, mirror, ReadOrWrite::READWRITE, base)
    }

    fn install_rom(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        base: Option<MemoryPtr>,
    ) -> MemoryResult<()> {
        self.install_ram_generic(ctx, start, end, mirror, ReadOrWrite::READ, base)
    }

    fn install_writeonly(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        base: Option<MemoryPtr>,
    ) -> MemoryResult<()> {
        self.install_ram_generic(ctx, start, end, mirror, ReadOrWrite::WRITE, base)
    }

    /// Installs banks looked up by tag, created on first use.
    fn install_bank_generic(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        rtag: Option<&str>,
        wtag: Option<&str>,
    ) -> MemoryResult<()>;

    fn install_read_bank(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        tag: &str,
    ) -> MemoryResult<()> {
        self.install_bank_generic(ctx, start, end, mirror, Some(tag), None)
    }

    fn install_write_bank(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        tag: &str,
    ) -> MemoryResult<()> {
        self.install_bank_generic(ctx, start, end, mirror, None, Some(tag))
    }

    fn install_readwrite_bank(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        tag: &str,
    ) -> MemoryResult<()> {
        self.install_bank_generic(ctx, start, end, mirror, Some(tag), Some(tag))
    }

    /// Installs existing bank objects.
    fn install_bank(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        rbank: Option<&Rc<MemoryBank>>,
        wbank: Option<&Rc<MemoryBank>>,
    ) -> MemoryResult<()>;

    fn install_readwrite_port(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        rtag: Option<&str>,
        wtag: Option<&str>,
    ) -> MemoryResult<()>;

    fn install_read_port(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        tag: &str,
    ) -> MemoryResult<()> {
        self.install_readwrite_port(ctx, start, end, mirror, Some(tag), None)
    }

    fn install_write_port(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        tag: &str,
    ) -> MemoryResult<()> {
        self.install_readwrite_port(ctx, start, end, mirror, None, Some(tag))
    }

    /// Installs the registered map `tag` rebased onto `start..=end`.
    fn install_device_map(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        tag: &str,
        unitmask: u64,
        cswidth: u32,
    ) -> MemoryResult<()>;

    fn install_read_handler(&mut self, range: InstallRange, delegate: AnyReadDelegate) -> MemoryResult<()>;

    fn install_write_handler(&mut self, range: InstallRange, delegate: AnyWriteDelegate) -> MemoryResult<()>;

    fn install_readwrite_handler(
        &mut self,
        range: InstallRange,
        read: AnyReadDelegate,
        write: AnyWriteDelegate,
    ) -> MemoryResult<()> {
        if read.width() != write.width() {
            return Err(MemoryError::DelegateWidthMismatch {
                read_bits: read.bits(),
                write_bits: write.bits(),
            });
        }
        self.install_read_handler(range, read)?;
        self.install_write_handler(range, write)
    }

    /// Pointer to the memory read at `address`, for memory and bank handlers.
    fn get_read_ptr(&self, address: Offset) -> Option<MemoryPtr>;

    fn get_write_ptr(&self, address: Offset) -> Option<MemoryPtr>;

    /// Name of the terminal handler serving `address`.
    fn get_handler_string(&self, rw: ReadOrWrite, address: Offset) -> String;

    /// Range the terminal handler serving `address` was installed for.
    fn handler_range(&self, rw: ReadOrWrite, address: Offset) -> HandlerRange;

    fn invalidate_caches(&self, mode: ReadOrWrite);

    /// Map handed over at creation, resolved as initialization proceeds.
    fn map(&self) -> Option<&AddressMap>;

    fn prepare_map(&mut self, ctx: &mut MemoryContext) -> MemoryResult<()>;
    fn populate_from_map(&mut self, ctx: &mut MemoryContext) -> MemoryResult<()>;
    fn allocate_memory(&mut self, ctx: &mut MemoryContext) -> MemoryResult<()>;
    fn locate_memory(&mut self, ctx: &mut MemoryContext) -> MemoryResult<()>;

    /// Memory already backing `start..=end`: map entries first (last match
    /// wins), then blocks of this space.
    fn find_backing_memory(&self, ctx: &MemoryContext, start: Offset, end: Offset) -> Option<MemoryPtr>;

    fn needs_backing_store(&self, ctx: &MemoryContext, entry: &AddressMapEntry) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Address space specialized on native word `W`, address shift `SHIFT` and
/// byte order `BIG`.
pub struct AddressSpaceSpecific<W: NativeWord, const SHIFT: i8, const BIG: bool> {
    id: SpaceId,
    device: String,
    spacenum: usize,
    config: AddressSpaceConfig,
    addrmask: Offset,
    logaddrmask: Offset,
    addrchars: usize,
    logaddrchars: usize,
    state: Rc<SpaceState>,
    roots: Rc<DispatchRoots<W>>,
    unmap_r: Rc<ReadHandler<W>>,
    unmap_w: Rc<WriteHandler<W>>,
    nop_r: Rc<ReadHandler<W>>,
    nop_w: Rc<WriteHandler<W>>,
    caches: RefCell<Vec<Weak<MemoryAccessCache<W, SHIFT, BIG>>>>,
    map: Option<AddressMap>,
}

fn width_mask(bits: u32) -> Offset {
    0xffff_ffffu32 >> (32 - bits)
}

fn too_wide(function: &'static str, handler_bits: u32, bus_bits: u32) -> MemoryError {
    MemoryError::HandlerTooWide {
        function,
        handler_bits,
        bus_bits,
    }
}

fn sub_read_handler(delegate: AnyReadDelegate, info: AddressInfo) -> Option<SubReadHandler> {
    match delegate {
        AnyReadDelegate::W8(delegate) => Some(SubReadHandler::W8(Rc::new(ReadHandler::Delegate { info, delegate }))),
        AnyReadDelegate::W16(delegate) => Some(SubReadHandler::W16(Rc::new(ReadHandler::Delegate { info, delegate }))),
        AnyReadDelegate::W32(delegate) => Some(SubReadHandler::W32(Rc::new(ReadHandler::Delegate { info, delegate }))),
        AnyReadDelegate::W64(_) => None,
    }
}

fn sub_write_handler(delegate: AnyWriteDelegate, info: AddressInfo) -> Option<SubWriteHandler> {
    match delegate {
        AnyWriteDelegate::W8(delegate) => Some(SubWriteHandler::W8(Rc::new(WriteHandler::Delegate { info, delegate }))),
        AnyWriteDelegate::W16(delegate) => {
            Some(SubWriteHandler::W16(Rc::new(WriteHandler::Delegate { info, delegate })))
        }
        AnyWriteDelegate::W32(delegate) => {
            Some(SubWriteHandler::W32(Rc::new(WriteHandler::Delegate { info, delegate })))
        }
        AnyWriteDelegate::W64(_) => None,
    }
}

impl<W: NativeWord, const SHIFT: i8, const BIG: bool> AddressSpaceSpecific<W, SHIFT, BIG> {
    /// Creates the space with both roots on the unmapped handler. `map` is
    /// kept until the manager prepares and populates it.
    pub fn new(
        id: SpaceId,
        device: &str,
        spacenum: usize,
        config: AddressSpaceConfig,
        map: AddressMap,
    ) -> MemoryResult<Self> {
        if config.data_width != W::BITS
            || config.addr_shift != SHIFT
            || (config.endianness == Endianness::Big) != BIG
        {
            return Err(MemoryError::UnsupportedSpace {
                data_width: config.data_width,
                addr_shift: config.addr_shift,
            });
        }
        if !(1..=32).contains(&config.addr_width) {
            return Err(MemoryError::InvalidAddressWidth(config.addr_width));
        }
        if !(1..=32).contains(&config.logaddr_width) {
            return Err(MemoryError::InvalidAddressWidth(config.logaddr_width));
        }

        let addrmask = width_mask(config.addr_width);
        let logaddrmask = width_mask(config.logaddr_width);
        let addrchars = config.addr_width.div_ceil(4) as usize;
        let logaddrchars = config.logaddr_width.div_ceil(4) as usize;

        let state = Rc::new(SpaceState::new(&config.name, addrchars, (W::BITS / 4) as usize));
        let unmap_r = Rc::new(ReadHandler::Unmapped(Rc::clone(&state)));
        let unmap_w = Rc::new(WriteHandler::Unmapped(Rc::clone(&state)));
        let nop_r = Rc::new(ReadHandler::Nop(Rc::clone(&state)));
        let nop_w = Rc::new(WriteHandler::Nop(Rc::clone(&state)));

        let native = Self::native_shift();
        let high = config.addr_width.max(native);
        let init = HandlerRange::new(0, addrmask);
        let roots = Rc::new(DispatchRoots::new(
            DispatchNode::new(high, native, init, &unmap_r),
            DispatchNode::new(high, native, init, &unmap_w),
        ));

        Ok(Self {
            id,
            device: device.to_string(),
            spacenum,
            config,
            addrmask,
            logaddrmask,
            addrchars,
            logaddrchars,
            state,
            roots,
            unmap_r,
            unmap_w,
            nop_r,
            nop_w,
            caches: RefCell::new(Vec::new()),
            map: Some(map),
        })
    }

    /// Address bits spanned by one native word.
    fn native_shift() -> u32 {
        (W::WIDTH as i32 + SHIFT as i32).max(0) as u32
    }

    fn native_info(start: Offset, mask: Offset) -> AddressInfo {
        AddressInfo::new(start, mask, Self::native_shift())
    }

    fn check(&self) -> AddressCheck {
        AddressCheck::new(self.addrmask, W::BITS, SHIFT, self.config.endianness)
    }

    /// Hands out a cache; it is invalidated along with the space.
    pub fn create_cache(&self) -> Rc<MemoryAccessCache<W, SHIFT, BIG>> {
        let cache = Rc::new(MemoryAccessCache::new(self.addrmask, Rc::clone(&self.roots)));
        let mut caches = self.caches.borrow_mut();
        caches.retain(|c| c.strong_count() > 0);
        caches.push(Rc::downgrade(&cache));
        cache
    }

    /// Depth of the read tree, for diagnostics.
    pub fn read_depth(&self) -> usize {
        self.roots.read.borrow().depth()
    }

    fn bank_find_or_allocate(
        &self,
        ctx: &mut MemoryContext,
        tag: Option<&str>,
        start: Offset,
        end: Offset,
        mirror: Offset,
        rw: ReadOrWrite,
    ) -> Rc<MemoryBank> {
        let start = start & !mirror & self.addrmask;
        let end = end & !mirror & self.addrmask;
        let found = match tag {
            Some(tag) => ctx.find_bank(tag),
            None => ctx.find_anonymous_bank(self.id, start, end),
        };
        let bank = found.unwrap_or_else(|| ctx.allocate_bank(start, end, tag));
        bank.add_reference(self.id, rw);
        bank
    }

    /// Gives an anonymous RAM bank a base if one can be found or allocated.
    fn resolve_ram_base(
        &self,
        ctx: &mut MemoryContext,
        bank: &MemoryBank,
        start: Offset,
        end: Offset,
        base: Option<&MemoryPtr>,
    ) -> MemoryResult<()> {
        if let Some(base) = base {
            bank.set_base(Some(base))?;
        }
        if bank.base().is_none() {
            if let Some(found) = self.find_backing_memory(ctx, start, end) {
                vprintf!("found matching backing memory for {}", bank.name());
                bank.set_base(Some(&found))?;
            }
        }
        if bank.base().is_none() && ctx.initialized {
            if ctx.phase >= MachinePhase::Reset {
                return Err(MemoryError::LateRamAllocation);
            }
            let block = MemoryBlock::new(self.id, start, end, self.config.range_bytes(start, end), None);
            debug!(
                "{}: allocated {:x} bytes for {:0w$x}-{:0w$x}",
                self.config.name,
                block.data().len(),
                start,
                end,
                w = self.addrchars
            );
            bank.set_base(Some(block.data()))?;
            ctx.blocks.push(block);
        }
        Ok(())
    }

    fn populate_map_entry(
        &mut self,
        ctx: &mut MemoryContext,
        entry: &AddressMapEntry,
        rw: ReadOrWrite,
    ) -> MemoryResult<()> {
        if rw == ReadOrWrite::READ {
            if let MapHandler::Delegate(delegate) = &entry.read {
                return self.install_read_handler(entry.install_range(), delegate.clone());
            }
            self.populate_plain(ctx, entry, &entry.read, rw)
        } else {
            if let MapHandler::Delegate(delegate) = &entry.write {
                return self.install_write_handler(entry.install_range(), delegate.clone());
            }
            self.populate_plain(ctx, entry, &entry.write, rw)
        }
    }

    fn populate_plain<D>(
        &mut self,
        ctx: &mut MemoryContext,
        entry: &AddressMapEntry,
        handler: &MapHandler<D>,
        rw: ReadOrWrite,
    ) -> MemoryResult<()> {
        let (start, end, mirror) = (entry.addrstart, entry.addrend, entry.addrmirror);
        if !handler.is_none() {
            debug!(
                "{}: ({:0w$x}-{:0w$x} mirror={:0w$x}, {}) {}",
                self.config.name,
                start,
                end,
                mirror,
                rw,
                handler,
                w = self.addrchars
            );
        }
        match handler {
            MapHandler::None | MapHandler::Delegate(_) => Ok(()),
            MapHandler::Rom if rw == ReadOrWrite::WRITE => Ok(()),
            MapHandler::Rom | MapHandler::Ram => self.install_ram_generic(ctx, start, end, mirror, rw, None),
            MapHandler::Nop => self.unmap_generic(start, end, mirror, rw, true),
            MapHandler::Unmap => self.unmap_generic(start, end, mirror, rw, false),
            MapHandler::Port(tag) => {
                if rw == ReadOrWrite::READ {
                    self.install_readwrite_port(ctx, start, end, mirror, Some(tag), None)
                } else {
                    self.install_readwrite_port(ctx, start, end, mirror, None, Some(tag))
                }
            }
            MapHandler::Bank(tag) => {
                if rw == ReadOrWrite::READ {
                    self.install_bank_generic(ctx, start, end, mirror, Some(tag), None)
                } else {
                    self.install_bank_generic(ctx, start, end, mirror, None, Some(tag))
                }
            }
            MapHandler::Submap(tag) => Err(MemoryError::LeftoverMapping(tag.clone())),
        }
    }

    /// Resolves memory for unassigned entries inside `start..=end` and
    /// returns the first entry still needing storage.
    fn block_assign_intersecting(
        &self,
        ctx: &mut MemoryContext,
        map: &mut AddressMap,
        start: Offset,
        end: Offset,
        base: Option<&MemoryPtr>,
    ) -> Option<usize> {
        let mut unassigned = None;
        for (index, entry) in map.entries.iter_mut().enumerate() {
            if entry.memory.is_none() {
                if let Some(share) = &entry.share {
                    if let Some(ptr) = ctx.shares.get(share).and_then(MemoryShare::ptr) {
                        vprintf!("memory range {:x}-{:x} -> shared_ptr '{}'", entry.addrstart, entry.addrend, share);
                        entry.memory = Some(ptr.clone());
                    }
                }
            }

            if entry.memory.is_none() && entry.addrstart >= start && entry.addrend <= end {
                if let Some(base) = base {
                    let offset = self.config.addr2byte(entry.addrstart - start) as usize;
                    entry.memory = Some(base.add(offset));
                    vprintf!("memory range {:x}-{:x} -> found in block", entry.addrstart, entry.addrend);
                }
            }

            if let (Some(memory), Some(share)) = (&entry.memory, &entry.share) {
                if let Some(share) = ctx.shares.get_mut(share) {
                    if share.ptr().is_none() {
                        share.set_ptr(memory.clone());
                    }
                }
            }

            if entry.memory.is_none() && unassigned.is_none() && self.needs_backing_store(ctx, entry) {
                unassigned = Some(index);
            }
        }
        unassigned
    }
}

impl<W: NativeWord, const SHIFT: i8, const BIG: bool> NativeAccess for AddressSpaceSpecific<W, SHIFT, BIG> {
    fn geometry(&self) -> BusGeometry {
        BusGeometry::new(W::WIDTH, SHIFT, BIG)
    }

    fn addrmask(&self) -> Offset {
        self.addrmask
    }

    #[inline]
    fn read_native(&self, address: Offset, mask: u64) -> u64 {
        self.roots.read.borrow().read(address, W::from_u64(mask)).to_u64()
    }

    #[inline]
    fn write_native(&self, address: Offset, data: u64, mask: u64) {
        self.roots
            .write
            .borrow()
            .write(address, W::from_u64(data), W::from_u64(mask));
    }
}

impl<W: NativeWord, const SHIFT: i8, const BIG: bool> AddressSpace for AddressSpaceSpecific<W, SHIFT, BIG> {
    fn id(&self) -> SpaceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn device(&self) -> &str {
        &self.device
    }

    fn spacenum(&self) -> usize {
        self.spacenum
    }

    fn config(&self) -> &AddressSpaceConfig {
        &self.config
    }

    fn logaddrmask(&self) -> Offset {
        self.logaddrmask
    }

    fn addrchars(&self) -> usize {
        self.addrchars
    }

    fn logaddrchars(&self) -> usize {
        self.logaddrchars
    }

    fn unmap_value(&self) -> u64 {
        self.state.unmap.get()
    }

    fn set_unmap_value(&self, value: u64) {
        self.state.unmap.set(value);
    }

    fn log_unmap(&self) -> bool {
        self.state.log_unmap.get()
    }

    fn set_log_unmap(&self, log: bool) {
        self.state.log_unmap.set(log);
    }

    fn unmap_generic(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        rw: ReadOrWrite,
        quiet: bool,
    ) -> MemoryResult<()> {
        vprintf!(
            "address_space::unmap({:0w$x}-{:0w$x} mirror={:0w$x}, {}, {})",
            start,
            end,
            mirror,
            rw,
            if quiet { "quiet" } else { "normal" },
            w = self.addrchars
        );
        let n = self.check().check_optimize_mirror("unmap_generic", start, end, mirror)?;
        if rw.contains(ReadOrWrite::READ) {
            let handler = if quiet { &self.nop_r } else { &self.unmap_r };
            self.roots.read.borrow_mut().populate(n.start, n.end, n.mirror, handler);
        }
        if rw.contains(ReadOrWrite::WRITE) {
            let handler = if quiet { &self.nop_w } else { &self.unmap_w };
            self.roots.write.borrow_mut().populate(n.start, n.end, n.mirror, handler);
        }
        self.invalidate_caches(rw);
        Ok(())
    }

    fn install_ram_generic(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        rw: ReadOrWrite,
        base: Option<MemoryPtr>,
    ) -> MemoryResult<()> {
        vprintf!(
            "address_space::install_ram_generic({:0w$x}-{:0w$x} mirror={:0w$x}, {}, {:?})",
            start,
            end,
            mirror,
            rw,
            base,
            w = self.addrchars
        );
        let n = self.check().check_optimize_mirror("install_ram_generic", start, end, mirror)?;
        let info = Self::native_info(n.start, n.mask);

        if rw.contains(ReadOrWrite::READ) {
            let bank = self.bank_find_or_allocate(ctx, None, start, end, mirror, ReadOrWrite::READ);
            self.resolve_ram_base(ctx, &bank, start, end, base.as_ref())?;
            let handler = Rc::new(ReadHandler::memory(info, bank.base()));
            if bank.base().is_none() {
                let pending = Rc::clone(&handler);
                bank.add_notifier(Box::new(move |base| pending.set_base(base)));
            }
            self.roots.read.borrow_mut().populate(n.start, n.end, n.mirror, &handler);
        }

        if rw.contains(ReadOrWrite::WRITE) {
            let bank = self.bank_find_or_allocate(ctx, None, start, end, mirror, ReadOrWrite::WRITE);
            self.resolve_ram_base(ctx, &bank, start, end, base.as_ref())?;
            let handler = Rc::new(WriteHandler::memory(info, bank.base()));
            if bank.base().is_none() {
                let pending = Rc::clone(&handler);
                bank.add_notifier(Box::new(move |base| pending.set_base(base)));
            }
            self.roots.write.borrow_mut().populate(n.start, n.end, n.mirror, &handler);
        }

        self.invalidate_caches(rw);
        Ok(())
    }

    fn install_bank_generic(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        rtag: Option<&str>,
        wtag: Option<&str>,
    ) -> MemoryResult<()> {
        vprintf!(
            "address_space::install_readwrite_bank({:0w$x}-{:0w$x} mirror={:0w$x}, read=\"{}\" / write=\"{}\")",
            start,
            end,
            mirror,
            rtag.unwrap_or("(none)"),
            wtag.unwrap_or("(none)"),
            w = self.addrchars
        );
        self.check().check_optimize_mirror("install_bank_generic", start, end, mirror)?;
        let rbank = rtag.map(|tag| self.bank_find_or_allocate(ctx, Some(tag), start, end, mirror, ReadOrWrite::READ));
        let wbank =
            wtag.map(|tag| self.bank_find_or_allocate(ctx, Some(tag), start, end, mirror, ReadOrWrite::WRITE));
        self.install_bank(start, end, mirror, rbank.as_ref(), wbank.as_ref())
    }

    fn install_bank(
        &mut self,
        start: Offset,
        end: Offset,
        mirror: Offset,
        rbank: Option<&Rc<MemoryBank>>,
        wbank: Option<&Rc<MemoryBank>>,
    ) -> MemoryResult<()> {
        let n = self.check().check_optimize_mirror("install_bank", start, end, mirror)?;
        let info = Self::native_info(n.start, n.mask);
        let mut rw = ReadOrWrite::empty();

        if let Some(bank) = rbank {
            bank.add_reference(self.id, ReadOrWrite::READ);
            let handler = Rc::new(ReadHandler::Bank {
                info,
                bank: Rc::clone(bank),
            });
            self.roots.read.borrow_mut().populate(n.start, n.end, n.mirror, &handler);
            rw |= ReadOrWrite::READ;
        }
        if let Some(bank) = wbank {
            bank.add_reference(self.id, ReadOrWrite::WRITE);
            let handler = Rc::new(WriteHandler::Bank {
                info,
                bank: Rc::clone(bank),
            });
            self.roots.write.borrow_mut().populate(n.start, n.end, n.mirror, &handler);
            rw |= ReadOrWrite::WRITE;
        }

        self.invalidate_caches(rw);
        Ok(())
    }

    fn install_readwrite_port(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        mirror: Offset,
        rtag: Option<&str>,
        wtag: Option<&str>,
    ) -> MemoryResult<()> {
        vprintf!(
            "address_space::install_readwrite_port({:0w$x}-{:0w$x} mirror={:0w$x}, read=\"{}\" / write=\"{}\")",
            start,
            end,
            mirror,
            rtag.unwrap_or("(none)"),
            wtag.unwrap_or("(none)"),
            w = self.addrchars
        );
        let n = self.check().check_optimize_mirror("install_readwrite_port", start, end, mirror)?;
        let missing = |tag: &str| MemoryError::MissingPort {
            tag: tag.to_string(),
            space: self.config.name.clone(),
            device: self.device.clone(),
        };
        let mut rw = ReadOrWrite::empty();

        if let Some(tag) = rtag {
            let port = ctx.ioport(tag).ok_or_else(|| missing(tag))?;
            let handler = Rc::new(ReadHandler::IoPort(port));
            self.roots.read.borrow_mut().populate(n.start, n.end, n.mirror, &handler);
            rw |= ReadOrWrite::READ;
        }
        if let Some(tag) = wtag {
            let port = ctx.ioport(tag).ok_or_else(|| missing(tag))?;
            let handler = Rc::new(WriteHandler::IoPort(port));
            self.roots.write.borrow_mut().populate(n.start, n.end, n.mirror, &handler);
            rw |= ReadOrWrite::WRITE;
        }

        self.invalidate_caches(rw);
        Ok(())
    }

    fn install_device_map(
        &mut self,
        ctx: &mut MemoryContext,
        start: Offset,
        end: Offset,
        tag: &str,
        unitmask: u64,
        cswidth: u32,
    ) -> MemoryResult<()> {
        vprintf!(
            "address_space::install_device_map({:0w$x}-{:0w$x}, '{}', {:x}, {})",
            start,
            end,
            tag,
            unitmask,
            cswidth,
            w = self.addrchars
        );
        self.check().check_address("install_device_map", start, end)?;
        let submap = ctx
            .submap(tag)
            .ok_or_else(|| MemoryError::MissingSubmap(tag.to_string()))?;
        let mut map = AddressMap {
            entries: AddressMap::rebased(submap, start, end, unitmask, cswidth),
            ..AddressMap::default()
        };
        map.import_submaps(&ctx.submaps, W::BITS)?;
        for entry in &map.entries {
            self.populate_map_entry(ctx, entry, ReadOrWrite::READ)?;
            self.populate_map_entry(ctx, entry, ReadOrWrite::WRITE)?;
        }
        self.invalidate_caches(ReadOrWrite::READWRITE);
        Ok(())
    }

    fn install_read_handler(&mut self, range: InstallRange, delegate: AnyReadDelegate) -> MemoryResult<()> {
        const FUNCTION: &str = "install_read_handler";
        vprintf!(
            "address_space::{}({:0w$x}-{:0w$x} mask={:0w$x} mirror={:0w$x}, {})",
            FUNCTION,
            range.start,
            range.end,
            range.mask,
            range.mirror,
            delegate.name(),
            w = self.addrchars
        );
        let bits = delegate.bits();
        let n = self.check().check_optimize_all(
            FUNCTION,
            bits,
            range.start,
            range.end,
            range.mask,
            range.mirror,
            range.select,
            range.unitmask,
            range.cswidth,
        )?;

        let width = delegate.width();
        if width == W::WIDTH {
            let delegate = W::read_delegate(delegate).ok_or_else(|| too_wide(FUNCTION, bits, W::BITS))?;
            let handler = Rc::new(ReadHandler::Delegate {
                info: Self::native_info(n.start, n.mask),
                delegate,
            });
            self.roots.read.borrow_mut().populate(n.start, n.end, n.mirror, &handler);
        } else if width < W::WIDTH {
            let descriptor =
                UnitsDescriptor::new(W::WIDTH, SHIFT, BIG, width, n.start, n.end, n.mask, n.unitmask, n.cswidth)?;
            let info = AddressInfo::new(descriptor.handler_start(), descriptor.handler_mask(), 0);
            let sub = sub_read_handler(delegate, info).ok_or_else(|| too_wide(FUNCTION, bits, W::BITS))?;
            let mut patch = MismatchedPatch::new(&descriptor, &sub, self.state.unmap.get());
            self.roots
                .read
                .borrow_mut()
                .populate_mismatched(n.start, n.end, n.mirror, &mut patch);
        } else {
            return Err(too_wide(FUNCTION, bits, W::BITS));
        }

        self.invalidate_caches(ReadOrWrite::READ);
        Ok(())
    }

    fn install_write_handler(&mut self, range: InstallRange, delegate: AnyWriteDelegate) -> MemoryResult<()> {
        const FUNCTION: &str = "install_write_handler";
        vprintf!(
            "address_space::{}({:0w$x}-{:0w$x} mask={:0w$x} mirror={:0w$x}, {})",
            FUNCTION,
            range.start,
            range.end,
            range.mask,
            range.mirror,
            delegate.name(),
            w = self.addrchars
        );
        let bits = delegate.bits();
        let n = self.check().check_optimize_all(
            FUNCTION,
            bits,
            range.start,
            range.end,
            range.mask,
            range.mirror,
            range.select,
            range.unitmask,
            range.cswidth,
        )?;

        let width = delegate.width();
        if width == W::WIDTH {
            let delegate = W::write_delegate(delegate).ok_or_else(|| too_wide(FUNCTION, bits, W::BITS))?;
            let handler = Rc::new(WriteHandler::Delegate {
                info: Self::native_info(n.start, n.mask),
                delegate,
            });
            self.roots.write.borrow_mut().populate(n.start, n.end, n.mirror, &handler);
        } else if width < W::WIDTH {
            let descriptor =
                UnitsDescriptor::new(W::WIDTH, SHIFT, BIG, width, n.start, n.end, n.mask, n.unitmask, n.cswidth)?;
            let info = AddressInfo::new(descriptor.handler_start(), descriptor.handler_mask(), 0);
            let sub = sub_write_handler(delegate, info).ok_or_else(|| too_wide(FUNCTION, bits, W::BITS))?;
            let mut patch = MismatchedPatch::new(&descriptor, &sub, self.state.unmap.get());
            self.roots
                .write
                .borrow_mut()
                .populate_mismatched(n.start, n.end, n.mirror, &mut patch);
        } else {
            return Err(too_wide(FUNCTION, bits, W::BITS));
        }

        self.invalidate_caches(ReadOrWrite::WRITE);
        Ok(())
    }

    fn get_read_ptr(&self, address: Offset) -> Option<MemoryPtr> {
        self.roots.read.borrow().get_ptr(address & self.addrmask)
    }

    fn get_write_ptr(&self, address: Offset) -> Option<MemoryPtr> {
        self.roots.write.borrow().get_ptr(address & self.addrmask)
    }

    fn get_handler_string(&self, rw: ReadOrWrite, address: Offset) -> String {
        if rw.contains(ReadOrWrite::READ) {
            self.roots.read.borrow().lookup(address).1.name()
        } else {
            self.roots.write.borrow().lookup(address).1.name()
        }
    }

    fn handler_range(&self, rw: ReadOrWrite, address: Offset) -> HandlerRange {
        if rw.contains(ReadOrWrite::READ) {
            self.roots.read.borrow().lookup(address).0
        } else {
            self.roots.write.borrow().lookup(address).0
        }
    }

    fn invalidate_caches(&self, mode: ReadOrWrite) {
        if mode.is_empty() {
            return;
        }
        let mut caches = self.caches.borrow_mut();
        caches.retain(|cache| match cache.upgrade() {
            Some(cache) => {
                cache.invalidate(mode);
                true
            }
            None => false,
        });
    }

    fn map(&self) -> Option<&AddressMap> {
        self.map.as_ref()
    }

    fn prepare_map(&mut self, ctx: &mut MemoryContext) -> MemoryResult<()> {
        let Some(mut map) = self.map.take() else {
            return Ok(());
        };
        map.import_submaps(&ctx.submaps, W::BITS)?;

        self.state.unmap.set(if map.unmap_value == 0 { 0 } else { !0 });
        if map.global_mask != 0 {
            self.addrmask = map.global_mask;
        }

        let devregion_bytes = if self.spacenum == 0 {
            ctx.region(&self.device).map(|region| region.bytes())
        } else {
            None
        };

        for entry in map.entries.iter_mut() {
            entry.addrmask &= self.addrmask;
            entry.addrstart &= !entry.addrmirror & self.addrmask;
            entry.addrend &= !entry.addrmirror & self.addrmask;

            if let Some(share) = &entry.share {
                if !ctx.shares.contains_key(share) {
                    let bytes = self.config.range_bytes(entry.addrstart, entry.addrend);
                    vprintf!("creating share '{}' of length 0x{:X}", share, bytes);
                    ctx.shares.insert(
                        share.clone(),
                        MemoryShare::new(share, bytes, W::BITS, self.config.endianness),
                    );
                }
            }

            if entry.read.is_rom() && entry.region.is_none() {
                if let Some(bytes) = devregion_bytes {
                    if (entry.addrend as usize) < bytes {
                        entry.region = Some(self.device.clone());
                        entry.rgnoffs = self.config.addr2byte(entry.addrstart) as usize;
                    }
                }
            }

            if let Some(name) = &entry.region {
                let region = ctx.region(name).ok_or_else(|| MemoryError::MissingRegion {
                    space: self.config.name.clone(),
                    start: entry.addrstart,
                    end: entry.addrend,
                    region: name.clone(),
                })?;
                if entry.share.is_none()
                    && entry.rgnoffs + self.config.range_bytes(entry.addrstart, entry.addrend) > region.bytes()
                {
                    return Err(MemoryError::RegionOverflow {
                        space: self.config.name.clone(),
                        start: entry.addrstart,
                        end: entry.addrend,
                        region: name.clone(),
                        bytes: region.bytes(),
                    });
                }
                entry.memory = Some(region.base().add(entry.rgnoffs));
            }
        }

        self.map = Some(map);
        Ok(())
    }

    fn populate_from_map(&mut self, ctx: &mut MemoryContext) -> MemoryResult<()> {
        let entries = match &self.map {
            Some(map) if !map.is_empty() => map.entries.clone(),
            _ => return Ok(()),
        };
        debug!("{}: populating {} map entries", self.config.name, entries.len());
        for entry in &entries {
            self.populate_map_entry(ctx, entry, ReadOrWrite::READ)?;
            self.populate_map_entry(ctx, entry, ReadOrWrite::WRITE)?;
        }
        Ok(())
    }

    fn allocate_memory(&mut self, ctx: &mut MemoryContext) -> MemoryResult<()> {
        let Some(mut map) = self.map.take() else {
            return Ok(());
        };

        // entradas com memória fixa viram blocos, de trás para frente para que a
        // entrada mais recente vença a busca de blocos
        let tail = ctx.blocks.len();
        for entry in &map.entries {
            if let Some(memory) = &entry.memory {
                ctx.blocks.insert(
                    tail,
                    MemoryBlock::new(self.id, entry.addrstart, entry.addrend, 0, Some(memory.clone())),
                );
            }
        }

        let mut unassigned = None;
        for index in tail..ctx.blocks.len() {
            let block = &ctx.blocks[index];
            let (start, end, data) = (block.addrstart(), block.addrend(), block.data().clone());
            unassigned = self.block_assign_intersecting(ctx, &mut map, start, end, Some(&data));
        }
        if unassigned.is_none() {
            unassigned = self.block_assign_intersecting(ctx, &mut map, !0, 0, None);
        }

        while let Some(index) = unassigned {
            let mut curblockstart = map.entries[index].addrstart / MEMORY_BLOCK_CHUNK;
            let mut curblockend = map.entries[index].addrend / MEMORY_BLOCK_CHUNK;

            // aumenta o bloco até nenhuma entrada sem memória tocá-lo
            loop {
                let mut changed = false;
                for (other, entry) in map.entries.iter().enumerate() {
                    if other == index || entry.memory.is_some() || !self.needs_backing_store(ctx, entry) {
                        continue;
                    }
                    let blockstart = entry.addrstart / MEMORY_BLOCK_CHUNK;
                    let blockend = entry.addrend / MEMORY_BLOCK_CHUNK;
                    if blockstart <= curblockend + 1 && blockend >= curblockstart.saturating_sub(1) {
                        if blockstart < curblockstart {
                            curblockstart = blockstart;
                            changed = true;
                        }
                        if blockend > curblockend {
                            curblockend = blockend;
                            changed = true;
                        }
                    }
                }
                if !changed {
                    break;
                }
            }

            let start = curblockstart * MEMORY_BLOCK_CHUNK;
            let end = curblockend * MEMORY_BLOCK_CHUNK + (MEMORY_BLOCK_CHUNK - 1);
            let block = MemoryBlock::new(self.id, start, end, self.config.range_bytes(start, end), None);
            debug!(
                "{}: allocating block {:0w$x}-{:0w$x} ({:x} bytes)",
                self.config.name,
                start,
                end,
                block.data().len(),
                w = self.addrchars
            );
            let data = block.data().clone();
            ctx.blocks.push(block);
            unassigned = self.block_assign_intersecting(ctx, &mut map, start, end, Some(&data));
        }

        self.map = Some(map);
        Ok(())
    }

    fn locate_memory(&mut self, ctx: &mut MemoryContext) -> MemoryResult<()> {
        let Some(map) = &self.map else {
            return Ok(());
        };
        for bank in &ctx.banks {
            if bank.base().is_some() || !bank.references_space(self.id, ReadOrWrite::READWRITE) {
                continue;
            }
            let found = map
                .entries
                .iter()
                .find(|entry| entry.addrstart == bank.addrstart() && entry.memory.is_some());
            if let Some(memory) = found.and_then(|entry| entry.memory.as_ref()) {
                bank.set_base(Some(memory))?;
                vprintf!("assigned bank '{}' pointer to memory from range {:x}", bank.tag(), bank.addrstart());
            }
        }
        Ok(())
    }

    fn find_backing_memory(&self, ctx: &MemoryContext, start: Offset, end: Offset) -> Option<MemoryPtr> {
        vprintf!("address_space::find_backing_memory('{}',{:x}-{:x}) -> ", self.config.name, start, end);
        if let Some(map) = &self.map {
            let found = map
                .entries
                .iter()
                .filter(|entry| entry.addrstart <= start && entry.addrend >= end)
                .filter_map(|entry| {
                    entry
                        .memory
                        .as_ref()
                        .map(|memory| memory.add(self.config.addr2byte(start - entry.addrstart) as usize))
                })
                .last();
            if found.is_some() {
                return found;
            }
        }
        ctx.blocks
            .iter()
            .find(|block| block.contains(self.id, start, end))
            .map(|block| block.data().add(self.config.addr2byte(start - block.addrstart()) as usize))
    }

    fn needs_backing_store(&self, ctx: &MemoryContext, entry: &AddressMapEntry) -> bool {
        if let Some(share) = &entry.share {
            if ctx.shares.get(share).is_some_and(|share| share.ptr().is_none()) {
                return true;
            }
        }
        if matches!(entry.write, MapHandler::Bank(_) | MapHandler::Ram) {
            return true;
        }
        if entry.read.is_ram() {
            return true;
        }
        entry.read.is_rom()
            && (self.spacenum != 0
                || ctx
                    .region(&self.device)
                    .map_or(true, |region| entry.addrstart as usize >= region.bytes()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::delegate::{ReadDelegate, WriteDelegate};
    use std::cell::Cell;

    type Space8 = AddressSpaceSpecific<u8, 0, false>;
    type Space32 = AddressSpaceSpecific<u32, 0, false>;

    fn space8(map: AddressMap) -> Space8 {
        let config = AddressSpaceConfig::new("program", Endianness::Little, 8, 16, 0);
        let space = Space8::new(SpaceId(0), "maincpu", 0, config, map).unwrap();
        space.set_log_unmap(false);
        space
    }

    fn space32() -> Space32 {
        let config = AddressSpaceConfig::new("program", Endianness::Little, 32, 24, 0);
        let space = Space32::new(SpaceId(0), "maincpu", 0, config, AddressMap::new()).unwrap();
        space.set_log_unmap(false);
        space
    }

    #[test]
    fn test_config_byte_conversion() {
        let config = AddressSpaceConfig::new("program", Endianness::Big, 32, 32, -2);
        assert_eq!(config.addr2byte(0x10), 0x40);
        assert_eq!(config.addr2byte_end(0x10), 0x43);
        assert_eq!(config.byte2addr(0x43), 0x10);
        assert_eq!(config.range_bytes(0, 0xff), 0x400);
        let bits = AddressSpaceConfig::new("io", Endianness::Little, 16, 16, 3);
        assert_eq!(bits.addr2byte(0x80), 0x10);
        assert_eq!(bits.byte2addr_end(0x10), 0x87);
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let config = AddressSpaceConfig::new("program", Endianness::Little, 8, 0, 0);
        assert_eq!(
            Space8::new(SpaceId(0), "cpu", 0, config, AddressMap::new()).err(),
            Some(MemoryError::InvalidAddressWidth(0))
        );
        let config = AddressSpaceConfig::new("program", Endianness::Little, 16, 16, 0);
        assert!(matches!(
            Space8::new(SpaceId(0), "cpu", 0, config, AddressMap::new()),
            Err(MemoryError::UnsupportedSpace { .. })
        ));
    }

    #[test]
    fn test_masks_and_chars() {
        let config = AddressSpaceConfig::new("program", Endianness::Little, 8, 20, 0).with_logaddr_width(24);
        let space = Space8::new(SpaceId(0), "cpu", 0, config, AddressMap::new()).unwrap();
        assert_eq!(space.addrmask(), 0xfffff);
        assert_eq!(space.logaddrmask(), 0xffffff);
        assert_eq!(space.addrchars(), 5);
        assert_eq!(space.logaddrchars(), 6);
        assert!(space.log_unmap());
        assert_eq!(space.unmap_value(), 0);
    }

    #[test]
    fn test_unmapped_reads() {
        let space = space8(AddressMap::new());
        space.set_unmap_value(0xff);
        assert_eq!(space.read_byte(0x1234), 0xff);
        assert_eq!(space.get_handler_string(ReadOrWrite::READ, 0x1234), "unmapped");
    }

    #[test]
    fn test_ram_with_base() {
        let mut ctx = MemoryContext::new();
        let mut space = space8(AddressMap::new());
        let ram = MemoryPtr::alloc(0x4000);
        space.install_ram(&mut ctx, 0x0000, 0x3fff, 0, Some(ram.clone())).unwrap();
        space.write_byte(0x1234, 0x55);
        assert_eq!(space.read_byte(0x1234), 0x55);
        assert_eq!(ram.read::<u8>(0x1234), Some(0x55));
        assert!(space.get_read_ptr(0x10).is_some_and(|p| p.ptr_eq(&ram.add(0x10))));
        assert_eq!(space.handler_range(ReadOrWrite::READ, 0x2000), HandlerRange::new(0, 0x3fff));
    }

    #[test]
    fn test_ram_mirror() {
        let mut ctx = MemoryContext::new();
        let mut space = space8(AddressMap::new());
        let ram = MemoryPtr::alloc(0x800);
        space.install_ram(&mut ctx, 0xc000, 0xc7ff, 0x1800, Some(ram)).unwrap();
        space.write_byte(0xc010, 0x42);
        assert_eq!(space.read_byte(0xc810), 0x42);
        assert_eq!(space.read_byte(0xd810), 0x42);
        assert_eq!(space.read_byte(0xb810), 0);
    }

    #[test]
    fn test_late_ram_allocation() {
        let mut ctx = MemoryContext::new();
        ctx.initialized = true;
        let mut space = space8(AddressMap::new());
        space.install_ram(&mut ctx, 0x8000, 0x80ff, 0, None).unwrap();
        assert_eq!(ctx.blocks().len(), 1);
        space.write_byte(0x8001, 9);
        assert_eq!(space.read_byte(0x8001), 9);

        ctx.set_phase(MachinePhase::Reset);
        assert_eq!(
            space.install_ram(&mut ctx, 0x9000, 0x90ff, 0, None),
            Err(MemoryError::LateRamAllocation)
        );
    }

    #[test]
    fn test_ram_pending_base_via_notifier() {
        let mut ctx = MemoryContext::new();
        let mut space = space8(AddressMap::new());
        space.install_ram(&mut ctx, 0x2000, 0x20ff, 0, None).unwrap();
        assert!(space.get_read_ptr(0x2000).is_none());
        let bank = ctx.find_anonymous_bank(SpaceId(0), 0x2000, 0x20ff).unwrap();
        let ram = MemoryPtr::alloc(0x100);
        bank.set_base(Some(&ram)).unwrap();
        space.write_byte(0x2003, 0x33);
        assert_eq!(space.read_byte(0x2003), 0x33);
        assert_eq!(ram.read::<u8>(3), Some(0x33));
    }

    #[test]
    fn test_delegate_mirror() {
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        let mut space = space8(AddressMap::new());
        let range = InstallRange::new(0x8000, 0x8000).mirror(0x0fff);
        let delegate = ReadDelegate::<u8>::new("status_r", move |_, _| {
            seen.set(seen.get() + 1);
            0xa5
        });
        space.install_read_handler(range, delegate.into()).unwrap();
        assert_eq!(space.read_byte(0x8000), 0xa5);
        assert_eq!(space.read_byte(0x8fff), 0xa5);
        assert_eq!(space.read_byte(0x9000), 0);
        assert_eq!(calls.get(), 2);
        assert_eq!(space.get_handler_string(ReadOrWrite::READ, 0x8123), "status_r");
    }

    #[test]
    fn test_narrow_handler_on_wide_bus() {
        let mut space = space32();
        let lane = ReadDelegate::<u8>::new("lane_r", |offset, _| offset as u8 + 1);
        let range = InstallRange::new(0x1000, 0x1fff).unitmask(0x0000_00ff);
        space.install_read_handler(range, lane.into()).unwrap();
        assert_eq!(space.read_dword(0x1000) & 0xff, 1);
        assert_eq!(space.read_dword(0x1004) & 0xff, 2);
        assert_eq!(space.read_byte(0x1001), 0);
    }

    #[test]
    fn test_readwrite_width_mismatch() {
        let mut space = space32();
        let err = space.install_readwrite_handler(
            InstallRange::new(0, 3),
            ReadDelegate::<u8>::new("r", |_, _| 0).into(),
            WriteDelegate::<u16>::new("w", |_, _, _| {}).into(),
        );
        assert_eq!(
            err,
            Err(MemoryError::DelegateWidthMismatch {
                read_bits: 8,
                write_bits: 16
            })
        );
    }

    #[test]
    fn test_handler_too_wide() {
        let mut space = space8(AddressMap::new());
        let wide = ReadDelegate::<u16>::new("wide", |_, _| 0);
        assert!(matches!(
            space.install_read_handler(InstallRange::new(0, 1), wide.into()),
            Err(MemoryError::HandlerTooWide { .. })
        ));
    }

    #[test]
    fn test_unmap_quiet_and_logging() {
        let mut ctx = MemoryContext::new();
        let mut space = space8(AddressMap::new());
        space.install_ram(&mut ctx, 0, 0xff, 0, Some(MemoryPtr::alloc(0x100))).unwrap();
        space.nop_read(0x10, 0x1f, 0).unwrap();
        space.unmap_write(0x20, 0x2f, 0).unwrap();
        assert_eq!(space.get_handler_string(ReadOrWrite::READ, 0x10), "nop");
        assert_eq!(space.get_handler_string(ReadOrWrite::WRITE, 0x20), "unmapped");
        assert!(space.get_handler_string(ReadOrWrite::WRITE, 0x10).starts_with("memory@"));
    }

    #[test]
    fn test_missing_port() {
        let mut ctx = MemoryContext::new();
        let mut space = space8(AddressMap::new());
        assert_eq!(
            space.install_read_port(&mut ctx, 0x10, 0x10, 0, "IN9"),
            Err(MemoryError::MissingPort {
                tag: "IN9".to_string(),
                space: "program".to_string(),
                device: "maincpu".to_string()
            })
        );
    }

    #[test]
    fn test_bank_by_tag() {
        let mut ctx = MemoryContext::new();
        let mut space = space8(AddressMap::new());
        space.install_read_bank(&mut ctx, 0x4000, 0x7fff, 0, "rombank").unwrap();
        let bank = ctx.find_bank("rombank").unwrap();
        let rom = MemoryPtr::from_vec((0..0x10000u32).map(|i| (i >> 14) as u8).collect());
        bank.configure_entries(0, 4, &rom, 0x4000);
        bank.set_entry(2).unwrap();
        assert_eq!(space.read_byte(0x4000), 2);
        bank.set_entry(3).unwrap();
        assert_eq!(space.read_byte(0x7fff), 3);
        assert_eq!(space.get_handler_string(ReadOrWrite::READ, 0x5000), "Bank 'rombank'");
    }

    #[test]
    fn test_cache_invalidated_on_install() {
        let mut ctx = MemoryContext::new();
        let mut space = space8(AddressMap::new());
        let cache = space.create_cache();
        assert_eq!(cache.read_byte(0x100), 0);
        space.set_unmap_value(0xff);
        let ram = MemoryPtr::from_vec(vec![0x11; 0x100]);
        space.install_ram(&mut ctx, 0x100, 0x1ff, 0, Some(ram)).unwrap();
        assert_eq!(cache.read_range(), None);
        assert_eq!(cache.read_byte(0x100), 0x11);
    }

    #[test]
    fn test_find_backing_memory_prefers_map() {
        let mut ctx = MemoryContext::new();
        let mut map = AddressMap::new();
        map.range(0x0, 0xff).ram();
        let mut space = space8(map);
        let mem = MemoryPtr::alloc(0x100);
        if let Some(map) = space.map.as_mut() {
            map.entries[0].memory = Some(mem.clone());
        }
        ctx.blocks.push(MemoryBlock::new(SpaceId(0), 0, 0xffff, 0x10000, None));
        let found = space.find_backing_memory(&ctx, 0x10, 0x1f).unwrap();
        assert!(found.ptr_eq(&mem.add(0x10)));
        let from_block = space.find_backing_memory(&ctx, 0x1000, 0x10ff).unwrap();
        assert!(from_block.ptr_eq(&ctx.blocks()[0].data().add(0x1000)));
    }

    #[test]
    fn test_needs_backing_store() {
        let ctx = MemoryContext::new();
        let space = space8(AddressMap::new());
        let mut entry = AddressMapEntry::new(0, 0xff);
        assert!(!space.needs_backing_store(&ctx, &entry));
        entry.rom();
        assert!(space.needs_backing_store(&ctx, &entry));
        let mut entry = AddressMapEntry::new(0, 0xff);
        entry.bankw("bank");
        assert!(space.needs_backing_store(&ctx, &entry));
    }
}
