// emumem-rs/src/core/memory/manager.rs

//! Machine-wide memory state and the initialization sequence.
//!
//! [`MemoryContext`] holds everything shared between spaces (banks, regions,
//! shares, blocks, ports and registered sub-maps). [`MemoryManager`] owns the
//! spaces plus that context and drives the phases that turn address maps into
//! populated dispatch trees with backing memory.

use crate::core::memory::bank::MemoryBank;
use crate::core::memory::block::MemoryBlock;
use crate::core::memory::delegate::IoPort;
use crate::core::memory::map::AddressMap;
use crate::core::memory::pointer::MemoryPtr;
use crate::core::memory::region::{MemoryRegion, MemoryShare};
use crate::core::memory::space::{AddressSpace, AddressSpaceConfig, AddressSpaceSpecific};
use crate::core::memory::word::NativeWord;
use crate::core::memory::{Endianness, MemoryError, MemoryResult, Offset, ReadOrWrite, SpaceId};
use log::{info, log_enabled, Level};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Lifetime stage of the machine owning the memory system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MachinePhase {
    Preinit,
    Init,
    Reset,
    Running,
    Exit,
}

impl fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachinePhase::Preinit => write!(f, "preinit"),
            MachinePhase::Init => write!(f, "init"),
            MachinePhase::Reset => write!(f, "reset"),
            MachinePhase::Running => write!(f, "running"),
            MachinePhase::Exit => write!(f, "exit"),
        }
    }
}

/// State shared by every space of one machine.
pub struct MemoryContext {
    pub(crate) banks: Vec<Rc<MemoryBank>>,
    pub(crate) shares: HashMap<String, MemoryShare>,
    pub(crate) regions: HashMap<String, MemoryRegion>,
    pub(crate) blocks: Vec<MemoryBlock>,
    pub(crate) ioports: HashMap<String, Rc<dyn IoPort>>,
    pub(crate) submaps: HashMap<String, AddressMap>,
    pub(crate) initialized: bool,
    pub(crate) phase: MachinePhase,
}

impl Default for MemoryContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryContext {
    pub fn new() -> Self {
        Self {
            banks: Vec::new(),
            shares: HashMap::new(),
            regions: HashMap::new(),
            blocks: Vec::new(),
            ioports: HashMap::new(),
            submaps: HashMap::new(),
            initialized: false,
            phase: MachinePhase::Preinit,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn phase(&self) -> MachinePhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: MachinePhase) {
        if phase != self.phase {
            info!("Memory: machine phase {} -> {}", self.phase, phase);
            self.phase = phase;
        }
    }

    // ========== Bancos ==========

    pub fn banks(&self) -> &[Rc<MemoryBank>] {
        &self.banks
    }

    pub fn find_bank(&self, tag: &str) -> Option<Rc<MemoryBank>> {
        self.banks.iter().find(|bank| bank.tag() == tag).cloned()
    }

    /// Anonymous bank created for exactly `start..=end` of `space`.
    pub fn find_anonymous_bank(&self, space: SpaceId, start: Offset, end: Offset) -> Option<Rc<MemoryBank>> {
        self.banks
            .iter()
            .find(|bank| {
                bank.anonymous()
                    && bank.references_space(space, ReadOrWrite::READWRITE)
                    && bank.matches_exactly(start, end)
            })
            .cloned()
    }

    /// Creates a bank; anonymous when `tag` is `None`.
    pub fn allocate_bank(&mut self, start: Offset, end: Offset, tag: Option<&str>) -> Rc<MemoryBank> {
        let bank = Rc::new(MemoryBank::new(self.banks.len(), start, end, tag));
        info!("Memory: {} created for {:x}-{:x}", bank.name(), start, end);
        self.banks.push(Rc::clone(&bank));
        bank
    }

    // ========== Regiões ==========

    /// Allocates a zero-filled region.
    pub fn region_alloc(
        &mut self,
        name: &str,
        bytes: usize,
        width: u8,
        endianness: Endianness,
    ) -> MemoryResult<&MemoryRegion> {
        self.region_insert(MemoryRegion::new(name, bytes, width, endianness))
    }

    /// Registers a region over existing contents.
    pub fn region_insert(&mut self, region: MemoryRegion) -> MemoryResult<&MemoryRegion> {
        if self.regions.contains_key(region.name()) {
            return Err(MemoryError::DuplicateRegion(region.name().to_string()));
        }
        info!(
            "Memory: region '{}' allocated, {} bytes, {}-bit {} endian",
            region.name(),
            region.bytes(),
            region.bitwidth(),
            region.endianness()
        );
        let name = region.name().to_string();
        Ok(self.regions.entry(name).or_insert(region))
    }

    pub fn region_free(&mut self, name: &str) -> Option<MemoryRegion> {
        self.regions.remove(name)
    }

    pub fn region(&self, name: &str) -> Option<&MemoryRegion> {
        self.regions.get(name)
    }

    /// Region holding `[ptr, ptr + bytes)`, if any.
    pub fn region_containing(&self, ptr: &MemoryPtr, bytes: usize) -> Option<&MemoryRegion> {
        self.regions.values().find(|region| region.contains(ptr, bytes))
    }

    // ========== Shares, blocos, portas, sub-mapas ==========

    pub fn share(&self, name: &str) -> Option<&MemoryShare> {
        self.shares.get(name)
    }

    pub fn blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }

    pub fn register_ioport(&mut self, port: Rc<dyn IoPort>) {
        self.ioports.insert(port.tag().to_string(), port);
    }

    pub fn ioport(&self, tag: &str) -> Option<Rc<dyn IoPort>> {
        self.ioports.get(tag).cloned()
    }

    /// Makes `map` available to submap entries and device map installs.
    pub fn register_submap(&mut self, tag: &str, map: AddressMap) {
        self.submaps.insert(tag.to_string(), map);
    }

    pub fn submap(&self, tag: &str) -> Option<&AddressMap> {
        self.submaps.get(tag)
    }
}

impl fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryContext")
            .field("banks", &self.banks.len())
            .field("shares", &self.shares.len())
            .field("regions", &self.regions.len())
            .field("blocks", &self.blocks.len())
            .field("initialized", &self.initialized)
            .field("phase", &self.phase)
            .finish()
    }
}

/// Instantiates the specialization matching a configuration.
macro_rules! allocate_space {
    ($id:expr, $device:expr, $spacenum:expr, $config:expr, $map:expr;
     $( ($bits:literal, $shift:literal, $word:ty) ),* $(,)?) => {
        match ($config.data_width, $config.addr_shift, $config.endianness) {
            $(
                ($bits, $shift, Endianness::Little) => Box::new(
                    AddressSpaceSpecific::<$word, { $shift }, false>::new($id, $device, $spacenum, $config, $map)?,
                ) as Box<dyn AddressSpace>,
                ($bits, $shift, Endianness::Big) => Box::new(
                    AddressSpaceSpecific::<$word, { $shift }, true>::new($id, $device, $spacenum, $config, $map)?,
                ) as Box<dyn AddressSpace>,
            )*
            (data_width, addr_shift, _) => {
                return Err(MemoryError::UnsupportedSpace { data_width, addr_shift })
            }
        }
    };
}

/// Spaces of one machine plus their shared context.
pub struct MemoryManager {
    spaces: Vec<Box<dyn AddressSpace>>,
    context: MemoryContext,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            spaces: Vec::new(),
            context: MemoryContext::new(),
        }
    }

    /// Creates the space described by `config` for `device`. The map is
    /// applied by [`MemoryManager::initialize`].
    pub fn add_space(
        &mut self,
        device: &str,
        spacenum: usize,
        config: AddressSpaceConfig,
        map: AddressMap,
    ) -> MemoryResult<SpaceId> {
        let id = SpaceId(self.spaces.len());
        let name = config.name.clone();
        let (data_width, addr_width, addr_shift, endianness) =
            (config.data_width, config.addr_width, config.addr_shift, config.endianness);
        let space = allocate_space!(id, device, spacenum, config, map;
            (8, 0, u8),
            (16, 3, u16),
            (16, 0, u16),
            (16, -1, u16),
            (32, 0, u32),
            (32, -1, u32),
            (32, -2, u32),
            (64, 0, u64),
            (64, -1, u64),
            (64, -2, u64),
            (64, -3, u64),
        );
        info!(
            "Memory: {} '{}' of '{}': {}-bit data, {}-bit address, shift {}, {} endian",
            id, name, device, data_width, addr_width, addr_shift, endianness
        );
        self.spaces.push(space);
        Ok(id)
    }

    /// Runs every phase over every space: prepare maps, populate, allocate
    /// memory, locate bank bases.
    pub fn initialize(&mut self) -> MemoryResult<()> {
        if self.context.initialized {
            return Ok(());
        }
        info!("Memory: preparing {} address map(s)", self.spaces.len());
        for space in self.spaces.iter_mut() {
            space.prepare_map(&mut self.context)?;
        }
        info!("Memory: populating dispatch trees");
        for space in self.spaces.iter_mut() {
            space.populate_from_map(&mut self.context)?;
        }
        info!("Memory: allocating backing memory");
        for space in self.spaces.iter_mut() {
            space.allocate_memory(&mut self.context)?;
        }
        for space in self.spaces.iter_mut() {
            space.locate_memory(&mut self.context)?;
        }

        if !log_enabled!(Level::Warn) {
            for space in &self.spaces {
                space.set_log_unmap(false);
            }
        }

        self.context.initialized = true;
        info!(
            "Memory: initialized, {} bank(s), {} block(s), {} share(s)",
            self.context.banks.len(),
            self.context.blocks.len(),
            self.context.shares.len()
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.context.initialized
    }

    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    pub fn space(&self, id: SpaceId) -> MemoryResult<&dyn AddressSpace> {
        self.spaces
            .get(id.0)
            .map(|space| space.as_ref())
            .ok_or(MemoryError::MissingSpace(id))
    }

    pub fn space_mut(&mut self, id: SpaceId) -> MemoryResult<&mut dyn AddressSpace> {
        let space: &mut dyn AddressSpace = self.spaces.get_mut(id.0).ok_or(MemoryError::MissingSpace(id))?.as_mut();
        Ok(space)
    }

    /// Space plus the context its install calls need.
    pub fn space_with_context(&mut self, id: SpaceId) -> MemoryResult<(&mut dyn AddressSpace, &mut MemoryContext)> {
        let space: &mut dyn AddressSpace = self.spaces.get_mut(id.0).ok_or(MemoryError::MissingSpace(id))?.as_mut();
        Ok((space, &mut self.context))
    }

    /// Concrete space, for callers that know its specialization.
    pub fn specific<W: NativeWord, const SHIFT: i8, const BIG: bool>(
        &self,
        id: SpaceId,
    ) -> Option<&AddressSpaceSpecific<W, SHIFT, BIG>> {
        self.spaces
            .get(id.0)
            .and_then(|space| space.as_any().downcast_ref::<AddressSpaceSpecific<W, SHIFT, BIG>>())
    }

    /// First space of `device` with index `spacenum`.
    pub fn find_space(&self, device: &str, spacenum: usize) -> Option<SpaceId> {
        self.spaces
            .iter()
            .find(|space| space.device() == device && space.spacenum() == spacenum)
            .map(|space| space.id())
    }

    pub fn context(&self) -> &MemoryContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut MemoryContext {
        &mut self.context
    }

    pub fn set_phase(&mut self, phase: MachinePhase) {
        self.context.set_phase(phase);
    }

    pub fn region_alloc(
        &mut self,
        name: &str,
        bytes: usize,
        width: u8,
        endianness: Endianness,
    ) -> MemoryResult<&MemoryRegion> {
        self.context.region_alloc(name, bytes, width, endianness)
    }

    pub fn region_free(&mut self, name: &str) -> Option<MemoryRegion> {
        self.context.region_free(name)
    }

    pub fn region_containing(&self, ptr: &MemoryPtr, bytes: usize) -> Option<&MemoryRegion> {
        self.context.region_containing(ptr, bytes)
    }

    pub fn register_ioport(&mut self, port: Rc<dyn IoPort>) {
        self.context.register_ioport(port);
    }

    pub fn register_submap(&mut self, tag: &str, map: AddressMap) {
        self.context.register_submap(tag, map);
    }

    pub fn bank(&self, tag: &str) -> Option<Rc<MemoryBank>> {
        self.context.find_bank(tag)
    }

    pub fn share(&self, name: &str) -> Option<&MemoryShare> {
        self.context.share(name)
    }
}
