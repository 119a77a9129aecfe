//! Sistema de memória por espaço de endereçamento.
//! Resolve cada acesso ao barramento para o handler que o atende através das
//! árvores de despacho de cada espaço, e mantém os bancos, regiões, shares e
//! blocos que dão suporte à memória mapeada.

pub mod access;
pub mod bank;
pub mod block;
pub mod cache;
pub mod delegate;
pub mod dispatch;
pub mod handler;
pub mod manager;
pub mod map;
pub mod pointer;
pub mod region;
pub mod space;
pub mod units;
pub mod validate;
pub mod word;

// Re-exportações para facilitar o uso
pub use access::{BusGeometry, NativeAccess};
pub use bank::MemoryBank;
pub use block::MemoryBlock;
pub use cache::MemoryAccessCache;
pub use delegate::{AnyReadDelegate, AnyWriteDelegate, IoPort, ReadDelegate, WriteDelegate};
pub use dispatch::{DispatchNode, HandlerRange};
pub use handler::{ReadHandler, WriteHandler};
pub use manager::{MachinePhase, MemoryContext, MemoryManager};
pub use map::{AddressMap, AddressMapEntry, InstallRange, MapHandler};
pub use pointer::MemoryPtr;
pub use region::{MemoryRegion, MemoryShare};
pub use space::{AddressSpace, AddressSpaceConfig, AddressSpaceSpecific};
pub use word::NativeWord;

use bitflags::bitflags;

/// Bus address, always expressed in the space's own address units.
pub type Offset = u32;

/// Granularity used when coalescing unassigned map entries into blocks.
pub const MEMORY_BLOCK_CHUNK: Offset = 65536;

/// Bank entry index meaning "no entry selected".
pub const BANK_ENTRY_UNSPECIFIED: i32 = -1;

bitflags! {
    /// Access direction(s) affected by an operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReadOrWrite: u8 {
        const READ = 1;
        const WRITE = 2;
        const READWRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl std::fmt::Display for ReadOrWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == ReadOrWrite::READWRITE {
            write!(f, "read/write")
        } else if *self == ReadOrWrite::READ {
            write!(f, "read")
        } else if *self == ReadOrWrite::WRITE {
            write!(f, "write")
        } else {
            write!(f, "??")
        }
    }
}

/// Byte order of a bus or of a memory image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little,
    Big,
}

impl std::fmt::Display for Endianness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endianness::Little => write!(f, "little"),
            Endianness::Big => write!(f, "big"),
        }
    }
}

/// Index of an address space inside its [`MemoryManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceId(pub usize);

impl std::fmt::Display for SpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "space #{}", self.0)
    }
}

/// Memory system errors.
///
/// All of these are configuration mistakes: run-time strays never error, they
/// land on the unmapped or nop handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Malformed range, mask, mirror or select bits given to an install call
    InvalidRange { function: &'static str, message: String },
    /// Handler wider than the bus it is installed in
    HandlerTooWide { function: &'static str, handler_bits: u32, bus_bits: u32 },
    /// No dispatch specialization exists for this width/shift pair
    UnsupportedSpace { data_width: u32, addr_shift: i8 },
    /// Address width outside 1..=32
    InvalidAddressWidth(u32),
    /// Unit mask selects a lane count the width reconciliation cannot express
    InvalidUnitMask { unitmask: u64, lanes: u32 },
    /// Read and write delegates of a readwrite install differ in width
    DelegateWidthMismatch { read_bits: u32, write_bits: u32 },
    /// A region with this name already exists
    DuplicateRegion(String),
    /// Map entry references an unknown region
    MissingRegion { space: String, start: Offset, end: Offset, region: String },
    /// Map entry extends beyond the end of its region
    RegionOverflow { space: String, start: Offset, end: Offset, region: String, bytes: usize },
    /// Map entry references an unknown I/O port
    MissingPort { tag: String, space: String, device: String },
    /// Unknown space identifier
    MissingSpace(SpaceId),
    /// `set_base` called without a pointer
    BankNullBase(String),
    /// `set_entry` called on an anonymous bank
    AnonymousBank(String),
    /// Bank entry index out of range
    BankEntryOutOfRange { tag: String, entry: i32 },
    /// Bank entry selected before it was configured
    InvalidBankEntry { tag: String, entry: i32 },
    /// RAM installed without backing once the machine is past reset
    LateRamAllocation,
    /// Submap entry left unresolved at population time
    LeftoverMapping(String),
    /// Submap entry references a map that was never registered
    MissingSubmap(String),
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::InvalidRange { function, message } => write!(f, "{}: {}", function, message),
            MemoryError::HandlerTooWide { function, handler_bits, bus_bits } => write!(
                f,
                "{}: cannot install a {}-wide handler in a {}-wide bus",
                function, handler_bits, bus_bits
            ),
            MemoryError::UnsupportedSpace { data_width, addr_shift } => write!(
                f,
                "Invalid width {}/shift {} specified for address space",
                data_width, addr_shift
            ),
            MemoryError::InvalidAddressWidth(width) => {
                write!(f, "Invalid address width {} (must be 1 to 32)", width)
            }
            MemoryError::InvalidUnitMask { unitmask, lanes } => write!(
                f,
                "Unit mask {:016x} selects {} lanes, only 1, 2, 4 or 8 are supported",
                unitmask, lanes
            ),
            MemoryError::DelegateWidthMismatch { read_bits, write_bits } => write!(
                f,
                "Read handler is {} bits wide but write handler is {} bits wide",
                read_bits, write_bits
            ),
            MemoryError::DuplicateRegion(name) => {
                write!(f, "region_alloc called with duplicate region name \"{}\"", name)
            }
            MemoryError::MissingRegion { space, start, end, region } => write!(
                f,
                "{} space memory map entry {:X}-{:X} references non-existent region \"{}\"",
                space, start, end, region
            ),
            MemoryError::RegionOverflow { space, start, end, region, bytes } => write!(
                f,
                "{} space memory map entry {:X}-{:X} extends beyond region \"{}\" size ({:X})",
                space, start, end, region, bytes
            ),
            MemoryError::MissingPort { tag, space, device } => write!(
                f,
                "Attempted to map non-existent port '{}' in space {} of device '{}'",
                tag, space, device
            ),
            MemoryError::MissingSpace(id) => write!(f, "No address space registered as {}", id),
            MemoryError::BankNullBase(tag) => write!(f, "memory_bank::set_base called without a base for bank '{}'", tag),
            MemoryError::AnonymousBank(tag) => {
                write!(f, "memory_bank::set_entry called for anonymous bank '{}'", tag)
            }
            MemoryError::BankEntryOutOfRange { tag, entry } => write!(
                f,
                "memory_bank::set_entry called for bank '{}' with out-of-range entry {}",
                tag, entry
            ),
            MemoryError::InvalidBankEntry { tag, entry } => write!(
                f,
                "memory_bank::set_entry called for bank '{}' with invalid bank entry {}",
                tag, entry
            ),
            MemoryError::LateRamAllocation => write!(
                f,
                "Attempted to call install_ram_generic() after initialization time without a baseptr!"
            ),
            MemoryError::LeftoverMapping(tag) => {
                write!(f, "Internal mapping error: leftover mapping of '{}'", tag)
            }
            MemoryError::MissingSubmap(tag) => {
                write!(f, "Attempted to submap a non-existent map '{}'", tag)
            }
        }
    }
}

impl std::error::Error for MemoryError {}

/// Result type for memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Mask with the low `bits` bits set, saturating at 32 bits.
#[inline]
pub const fn offset_mask(bits: u32) -> Offset {
    if bits >= 32 {
        Offset::MAX
    } else {
        (1 << bits) - 1
    }
}

/// Mask with the low `bits` bits set, saturating at 64 bits.
#[inline]
pub const fn data_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Shift left that yields zero once the shift reaches the word size.
#[inline]
pub(crate) const fn shl64(value: u64, shift: u32) -> u64 {
    if shift >= 64 {
        0
    } else {
        value << shift
    }
}

/// Shift right that yields zero once the shift reaches the word size.
#[inline]
pub(crate) const fn shr64(value: u64, shift: u32) -> u64 {
    if shift >= 64 {
        0
    } else {
        value >> shift
    }
}

/// Applies a signed address shift: positive shifts right, negative shifts left.
#[inline]
pub(crate) const fn shift_offset(offset: Offset, shift: i32) -> Offset {
    if shift >= 0 {
        if shift >= 32 {
            0
        } else {
            offset >> shift
        }
    } else if -shift >= 32 {
        0
    } else {
        offset << -shift
    }
}
