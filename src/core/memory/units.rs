// emumem-rs/src/core/memory/units.rs

//! Width reconciliation between a bus and narrower handlers.
//!
//! A handler narrower than its bus occupies one or more byte lanes of each bus
//! word. The [`UnitsDescriptor`] computes, once per install, which lanes are
//! active, how a bus offset maps to a handler offset for each lane, and how the
//! lane set shrinks at unaligned range edges. [`Units`] is the resulting
//! handler: reads OR the lanes together, writes are split per lane.

use crate::core::memory::{data_mask, offset_mask, shift_offset, shl64, shr64, MemoryError, MemoryResult, Offset};
use bitflags::bitflags;
use std::collections::BTreeMap;

bitflags! {
    /// Which edges of the installed range still constrain a dispatch slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RangeKey: u8 {
        const START = 1;
        const END = 2;
    }
}

/// One lane of a units handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitEntry {
    /// Bus bits that select this lane
    pub amask: u64,
    /// Bus bits carrying this lane's data
    pub dmask: u64,
    /// Bus offset to handler offset shift (negative shifts left)
    pub ashift: i8,
    /// Handler offset added after shifting
    pub offset: u8,
    /// Bit position of the lane in the bus word
    pub dshift: u8,
}

/// Selection key: one bit per byte lane of `mask` holding a set bit.
pub fn mask_to_ukey(mask: u64, bus_bits: u32) -> u8 {
    let mut ukey = 0u8;
    for lane in 0..bus_bits / 8 {
        if mask & (0xff << (8 * lane)) != 0 {
            ukey |= 1 << lane;
        }
    }
    ukey
}

/// Bit range `"high-low"` covered by a lane mask, `"???"` when empty.
pub fn m2r(mask: u64, bus_bits: u32) -> String {
    let start = (0..bus_bits).step_by(8).find(|&bit| mask & (1u64 << bit) != 0);
    let end = (0..bus_bits / 8)
        .map(|lane| bus_bits - 1 - 8 * lane)
        .find(|&bit| mask & (1u64 << bit) != 0);
    match (start, end) {
        (Some(start), Some(end)) => format!("{}-{}", end, start),
        _ => "???".to_string(),
    }
}

/// Lane layout for one mismatched install.
#[derive(Debug, Clone)]
pub struct UnitsDescriptor {
    bus_bits: u32,
    handler_width: u32,
    handler_start: Offset,
    handler_mask: Offset,
    keymap: [u8; 4],
    entries: BTreeMap<u8, Vec<UnitEntry>>,
}

impl UnitsDescriptor {
    /// Builds the lane layout of a `8 << access_width`-bit handler installed
    /// over `addrstart..=addrend` of a `8 << bus_width`-bit bus.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus_width: u32,
        addr_shift: i8,
        big_endian: bool,
        access_width: u32,
        addrstart: Offset,
        addrend: Offset,
        mask: Offset,
        unitmask: u64,
        cswidth: u32,
    ) -> MemoryResult<Self> {
        let bus_bits = 8 << bus_width;
        let bus_mask = data_mask(bus_bits);
        let native_mask = offset_mask((bus_width as i32 + addr_shift as i32).max(0) as u32);
        let bits_per_access = 8 << access_width;
        let byte_shift = (3 - addr_shift as i32) as u32;

        let astart = addrstart & !native_mask;
        let aend = addrend & !native_mask;

        let smask = !data_mask((addrstart - astart) << byte_shift) & bus_mask;
        let emask = data_mask((addrend - aend + 1) << byte_shift) & bus_mask;

        let mut umasks = [unitmask; 4];
        umasks[RangeKey::START.bits() as usize] &= smask;
        umasks[RangeKey::END.bits() as usize] &= emask;
        umasks[RangeKey::all().bits() as usize] &= smask | emask;

        let mut keymap = [0u8; 4];
        for (key, umask) in keymap.iter_mut().zip(umasks.iter()) {
            *key = mask_to_ukey(*umask, bus_bits);
        }

        let lane_mask = data_mask(bits_per_access);
        let active = (0..bus_bits)
            .step_by(bits_per_access as usize)
            .filter(|&i| unitmask & shl64(lane_mask, i) != 0)
            .count() as u32;
        let active_log = match active {
            1 => 0,
            2 => 1,
            4 => 2,
            8 => 3,
            lanes => return Err(MemoryError::InvalidUnitMask { unitmask, lanes }),
        };
        if access_width + active_log > bus_width {
            return Err(MemoryError::InvalidUnitMask { unitmask, lanes: active });
        }

        let base_shift = bus_width - access_width - active_log;
        let shift = base_shift as i32 + access_width as i32 + addr_shift as i32;

        let handler_start = shift_offset(addrstart, shift);
        let handler_mask = if shift < 0 {
            shift_offset(mask, shift) | offset_mask((-shift) as u32)
        } else {
            shift_offset(mask, shift)
        };

        let mut descriptor = Self {
            bus_bits,
            handler_width: access_width,
            handler_start,
            handler_mask,
            keymap,
            entries: BTreeMap::new(),
        };

        for (ukey, umask) in keymap.iter().zip(umasks.iter()) {
            if !descriptor.entries.contains_key(ukey) {
                let entries = descriptor.generate(*umask, cswidth, bits_per_access, base_shift, shift, big_endian);
                descriptor.entries.insert(*ukey, entries);
            }
        }

        vprintf!(
            "units descriptor {}-bit on {}-bit bus: start {:x} mask {:x} shift {} keys {:?}",
            bits_per_access,
            bus_bits,
            handler_start,
            handler_mask,
            shift,
            keymap
        );

        Ok(descriptor)
    }

    fn generate(
        &self,
        umask: u64,
        cswidth: u32,
        bits_per_access: u32,
        base_shift: u32,
        shift: i32,
        big_endian: bool,
    ) -> Vec<UnitEntry> {
        let cswidth = if cswidth == 0 { bits_per_access } else { cswidth };
        let csmask = data_mask(cswidth);
        let dmask = data_mask(bits_per_access);
        let bus_mask = data_mask(self.bus_bits);
        let oxor = if big_endian { self.bus_bits / bits_per_access - 1 } else { 0 };

        let mut entries = Vec::new();
        for (lane, i) in (0..self.bus_bits).step_by(bits_per_access as usize).enumerate() {
            let numask = shl64(dmask, i);
            if umask & numask != 0 {
                entries.push(UnitEntry {
                    amask: shl64(csmask, i & !(cswidth - 1)) & bus_mask,
                    dmask: numask,
                    ashift: shift as i8,
                    offset: ((lane as u32 ^ oxor) >> base_shift) as u8,
                    dshift: i as u8,
                });
            }
        }
        entries
    }

    /// First handler-side offset of the install.
    pub fn handler_start(&self) -> Offset {
        self.handler_start
    }

    /// Handler-side address mask of the install.
    pub fn handler_mask(&self) -> Offset {
        self.handler_mask
    }

    /// log2 of the sub-handler width in bytes.
    pub fn handler_width(&self) -> u32 {
        self.handler_width
    }

    pub fn bus_bits(&self) -> u32 {
        self.bus_bits
    }

    /// Selection key of a reconciliation key.
    pub fn rkey_to_ukey(&self, rkey: RangeKey) -> u8 {
        self.keymap[rkey.bits() as usize]
    }

    pub fn entries_for_key(&self, ukey: u8) -> &[UnitEntry] {
        self.entries.get(&ukey).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Reads one lane's sub-handler.
pub trait SubUnitRead {
    fn read(&self, offset: Offset, mask: u64) -> u64;
}

/// Writes one lane's sub-handler.
pub trait SubUnitWrite {
    fn write(&self, offset: Offset, data: u64, mask: u64);
}

/// Names a lane's sub-handler for diagnostics.
pub trait SubUnitName {
    fn name(&self) -> String;
}

#[derive(Clone)]
struct SubUnit<S> {
    entry: UnitEntry,
    handler: S,
}

/// Handler dispatching a bus access over the lanes of narrower sub-handlers.
#[derive(Clone)]
pub struct Units<S> {
    subunits: Vec<SubUnit<S>>,
    unmap: u64,
    bus_bits: u32,
}

impl<S: Clone> Units<S> {
    /// Fresh units handler for selection key `ukey`.
    pub fn new(descriptor: &UnitsDescriptor, ukey: u8, handler: &S, space_unmap: u64) -> Self {
        let mut units = Self {
            subunits: Vec::new(),
            unmap: 0,
            bus_bits: descriptor.bus_bits(),
        };
        units.fill(descriptor, ukey, handler, space_unmap);
        units
    }

    /// Units handler keeping the lanes of `src` the new entries do not cover.
    pub fn patched(descriptor: &UnitsDescriptor, ukey: u8, handler: &S, src: &Units<S>, space_unmap: u64) -> Self {
        let fullmask = descriptor
            .entries_for_key(ukey)
            .iter()
            .fold(0, |acc, e| acc | e.dmask);
        let mut units = Self {
            subunits: src
                .subunits
                .iter()
                .filter(|sub| sub.entry.dmask & fullmask == 0)
                .cloned()
                .collect(),
            unmap: 0,
            bus_bits: descriptor.bus_bits(),
        };
        units.fill(descriptor, ukey, handler, space_unmap);
        units
    }

    fn fill(&mut self, descriptor: &UnitsDescriptor, ukey: u8, handler: &S, space_unmap: u64) {
        for entry in descriptor.entries_for_key(ukey) {
            self.subunits.push(SubUnit {
                entry: *entry,
                handler: handler.clone(),
            });
        }
        let covered = self.subunits.iter().fold(0, |acc, s| acc | s.entry.dmask);
        self.unmap = space_unmap & !covered & data_mask(self.bus_bits);
    }
}

impl<S> Units<S> {
    pub fn len(&self) -> usize {
        self.subunits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subunits.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &UnitEntry> {
        self.subunits.iter().map(|s| &s.entry)
    }

    /// Value seen on the lanes no sub-unit drives.
    pub fn unmap(&self) -> u64 {
        self.unmap
    }
}

impl<S: SubUnitRead> Units<S> {
    #[inline]
    pub fn read(&self, offset: Offset, mask: u64) -> u64 {
        let mut result = self.unmap;
        for sub in &self.subunits {
            let e = &sub.entry;
            if mask & e.amask != 0 {
                let aoffset = shift_offset(offset, e.ashift as i32).wrapping_add(e.offset as Offset);
                let data = sub.handler.read(aoffset, shr64(mask, e.dshift as u32));
                result |= shl64(data, e.dshift as u32);
            }
        }
        result
    }
}

impl<S: SubUnitWrite> Units<S> {
    #[inline]
    pub fn write(&self, offset: Offset, data: u64, mask: u64) {
        for sub in &self.subunits {
            let e = &sub.entry;
            if mask & e.amask != 0 {
                let aoffset = shift_offset(offset, e.ashift as i32).wrapping_add(e.offset as Offset);
                sub.handler
                    .write(aoffset, shr64(data, e.dshift as u32), shr64(mask, e.dshift as u32));
            }
        }
    }
}

impl<S: SubUnitName> Units<S> {
    /// `amask:dmask:ashift:offset:dshift:name` per lane, space separated.
    pub fn name(&self) -> String {
        self.subunits
            .iter()
            .map(|sub| {
                let e = &sub.entry;
                format!(
                    "{}:{}:{}:{}:{}:{}",
                    m2r(e.amask, self.bus_bits),
                    m2r(e.dmask, self.bus_bits),
                    e.ashift,
                    e.offset,
                    e.dshift,
                    sub.handler.name()
                )
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
