//! Declarative address maps.
//!
//! A map is an ordered list of entries, each naming a range and what serves
//! reads and writes there. Later entries override earlier ones when the
//! space populates its dispatch trees from the map.

use crate::core::memory::delegate::{AnyReadDelegate, AnyWriteDelegate};
use crate::core::memory::pointer::MemoryPtr;
use crate::core::memory::{data_mask, MemoryError, MemoryResult, Offset};
use std::collections::HashMap;
use std::fmt;

/// What serves one direction of a map entry.
#[derive(Debug, Clone)]
pub enum MapHandler<D> {
    /// Nothing, the direction is left as it was
    None,
    /// Read-only memory, ignored on the write side
    Rom,
    Ram,
    /// Silent unmapped access
    Nop,
    /// Unmapped access, logged when unmap logging is on
    Unmap,
    /// I/O port looked up by tag
    Port(String),
    /// Bank looked up (or created) by tag
    Bank(String),
    Delegate(D),
    /// Registered sub-map, expanded in place before population
    Submap(String),
}

impl<D> Default for MapHandler<D> {
    fn default() -> Self {
        MapHandler::None
    }
}

impl<D> MapHandler<D> {
    pub fn is_none(&self) -> bool {
        matches!(self, MapHandler::None)
    }

    pub fn is_rom(&self) -> bool {
        matches!(self, MapHandler::Rom)
    }

    pub fn is_ram(&self) -> bool {
        matches!(self, MapHandler::Ram)
    }
}

impl<D> fmt::Display for MapHandler<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapHandler::None => write!(f, "none"),
            MapHandler::Rom => write!(f, "rom"),
            MapHandler::Ram => write!(f, "ram"),
            MapHandler::Nop => write!(f, "nop"),
            MapHandler::Unmap => write!(f, "unmap"),
            MapHandler::Port(tag) => write!(f, "port '{}'", tag),
            MapHandler::Bank(tag) => write!(f, "bank '{}'", tag),
            MapHandler::Delegate(_) => write!(f, "delegate"),
            MapHandler::Submap(tag) => write!(f, "submap '{}'", tag),
        }
    }
}

/// Range plus the mask/mirror/select and lane bits of an install call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallRange {
    pub start: Offset,
    pub end: Offset,
    pub mask: Offset,
    pub mirror: Offset,
    pub select: Offset,
    /// Lanes of the bus the handler answers on, 0 for all of them
    pub unitmask: u64,
    /// Chip-select width in bits, 0 for the handler's own width
    pub cswidth: u32,
}

impl InstallRange {
    pub fn new(start: Offset, end: Offset) -> Self {
        Self {
            start,
            end,
            mask: 0,
            mirror: 0,
            select: 0,
            unitmask: 0,
            cswidth: 0,
        }
    }

    pub fn mask(mut self, mask: Offset) -> Self {
        self.mask = mask;
        self
    }

    pub fn mirror(mut self, mirror: Offset) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn select(mut self, select: Offset) -> Self {
        self.select = select;
        self
    }

    pub fn unitmask(mut self, unitmask: u64) -> Self {
        self.unitmask = unitmask;
        self
    }

    pub fn cswidth(mut self, cswidth: u32) -> Self {
        self.cswidth = cswidth;
        self
    }
}

impl From<(Offset, Offset)> for InstallRange {
    fn from((start, end): (Offset, Offset)) -> Self {
        InstallRange::new(start, end)
    }
}

/// One line of an address map.
#[derive(Debug, Clone, Default)]
pub struct AddressMapEntry {
    pub addrstart: Offset,
    pub addrend: Offset,
    pub addrmask: Offset,
    pub addrmirror: Offset,
    pub addrselect: Offset,
    pub unitmask: u64,
    pub cswidth: u32,
    pub read: MapHandler<AnyReadDelegate>,
    pub write: MapHandler<AnyWriteDelegate>,
    pub share: Option<String>,
    pub region: Option<String>,
    /// Byte offset into `region`
    pub rgnoffs: usize,
    /// Backing memory, resolved while the manager initializes
    pub memory: Option<MemoryPtr>,
}

impl AddressMapEntry {
    pub fn new(addrstart: Offset, addrend: Offset) -> Self {
        Self {
            addrstart,
            addrend,
            ..Default::default()
        }
    }

    pub fn mask(&mut self, mask: Offset) -> &mut Self {
        self.addrmask = mask;
        self
    }

    pub fn mirror(&mut self, mirror: Offset) -> &mut Self {
        self.addrmirror = mirror;
        self
    }

    pub fn select(&mut self, select: Offset) -> &mut Self {
        self.addrselect = select;
        self
    }

    pub fn umask(&mut self, unitmask: u64) -> &mut Self {
        self.unitmask = unitmask;
        self
    }

    pub fn cswidth(&mut self, cswidth: u32) -> &mut Self {
        self.cswidth = cswidth;
        self
    }

    pub fn rom(&mut self) -> &mut Self {
        self.read = MapHandler::Rom;
        self
    }

    pub fn ram(&mut self) -> &mut Self {
        self.read = MapHandler::Ram;
        self.write = MapHandler::Ram;
        self
    }

    pub fn readonly(&mut self) -> &mut Self {
        self.read = MapHandler::Ram;
        self
    }

    pub fn writeonly(&mut self) -> &mut Self {
        self.write = MapHandler::Ram;
        self
    }

    pub fn nopr(&mut self) -> &mut Self {
        self.read = MapHandler::Nop;
        self
    }

    pub fn nopw(&mut self) -> &mut Self {
        self.write = MapHandler::Nop;
        self
    }

    pub fn noprw(&mut self) -> &mut Self {
        self.nopr().nopw()
    }

    pub fn unmapr(&mut self) -> &mut Self {
        self.read = MapHandler::Unmap;
        self
    }

    pub fn unmapw(&mut self) -> &mut Self {
        self.write = MapHandler::Unmap;
        self
    }

    pub fn unmaprw(&mut self) -> &mut Self {
        self.unmapr().unmapw()
    }

    pub fn portr(&mut self, tag: &str) -> &mut Self {
        self.read = MapHandler::Port(tag.to_string());
        self
    }

    pub fn portw(&mut self, tag: &str) -> &mut Self {
        self.write = MapHandler::Port(tag.to_string());
        self
    }

    pub fn portrw(&mut self, tag: &str) -> &mut Self {
        self.portr(tag).portw(tag)
    }

    pub fn bankr(&mut self, tag: &str) -> &mut Self {
        self.read = MapHandler::Bank(tag.to_string());
        self
    }

    pub fn bankw(&mut self, tag: &str) -> &mut Self {
        self.write = MapHandler::Bank(tag.to_string());
        self
    }

    pub fn bankrw(&mut self, tag: &str) -> &mut Self {
        self.bankr(tag).bankw(tag)
    }

    pub fn r(&mut self, delegate: impl Into<AnyReadDelegate>) -> &mut Self {
        self.read = MapHandler::Delegate(delegate.into());
        self
    }

    pub fn w(&mut self, delegate: impl Into<AnyWriteDelegate>) -> &mut Self {
        self.write = MapHandler::Delegate(delegate.into());
        self
    }

    pub fn rw(&mut self, read: impl Into<AnyReadDelegate>, write: impl Into<AnyWriteDelegate>) -> &mut Self {
        self.r(read).w(write)
    }

    /// Expands the registered map `tag` into this range.
    pub fn m(&mut self, tag: &str) -> &mut Self {
        self.read = MapHandler::Submap(tag.to_string());
        self.write = MapHandler::Submap(tag.to_string());
        self
    }

    pub fn share(&mut self, tag: &str) -> &mut Self {
        self.share = Some(tag.to_string());
        self
    }

    /// Backs the entry with `tag`, starting `offset` bytes in.
    pub fn region(&mut self, tag: &str, offset: usize) -> &mut Self {
        self.region = Some(tag.to_string());
        self.rgnoffs = offset;
        self
    }

    /// Range and lane bits to install this entry with.
    pub fn install_range(&self) -> InstallRange {
        InstallRange {
            start: self.addrstart,
            end: self.addrend,
            mask: self.addrmask,
            mirror: self.addrmirror,
            select: self.addrselect,
            unitmask: self.unitmask,
            cswidth: self.cswidth,
        }
    }

    /// Submap tag when either direction is a submap.
    pub fn submap_tag(&self) -> Option<&str> {
        match (&self.read, &self.write) {
            (MapHandler::Submap(tag), _) | (_, MapHandler::Submap(tag)) => Some(tag),
            _ => None,
        }
    }
}

/// Ordered list of map entries plus map-wide settings.
#[derive(Debug, Clone, Default)]
pub struct AddressMap {
    pub entries: Vec<AddressMapEntry>,
    /// Replaces the space address mask when nonzero
    pub global_mask: Offset,
    /// Value read from unmapped addresses (0 or all ones)
    pub unmap_value: u64,
}

impl AddressMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global_mask(&mut self, mask: Offset) -> &mut Self {
        self.global_mask = mask;
        self
    }

    pub fn unmap_value_high(&mut self) -> &mut Self {
        self.unmap_value = !0;
        self
    }

    pub fn unmap_value_low(&mut self) -> &mut Self {
        self.unmap_value = 0;
        self
    }

    /// Appends an entry for `start..=end` and returns it for configuration.
    pub fn range(&mut self, start: Offset, end: Offset) -> &mut AddressMapEntry {
        self.entries.push(AddressMapEntry::new(start, end));
        let last = self.entries.len() - 1;
        &mut self.entries[last]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replaces every submap entry with the entries of the map it names,
    /// rebased onto the entry's range. Nested submaps are expanded too.
    pub fn import_submaps(&mut self, submaps: &HashMap<String, AddressMap>, data_width: u32) -> MemoryResult<()> {
        let mut visiting = Vec::new();
        self.import_submaps_inner(submaps, data_width, &mut visiting)
    }

    fn import_submaps_inner(
        &mut self,
        submaps: &HashMap<String, AddressMap>,
        data_width: u32,
        visiting: &mut Vec<String>,
    ) -> MemoryResult<()> {
        if !self.entries.iter().any(|e| e.submap_tag().is_some()) {
            return Ok(());
        }
        let full_unitmask = data_mask(data_width);
        let mut result = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            let Some(tag) = entry.submap_tag().map(str::to_string) else {
                result.push(entry);
                continue;
            };
            if visiting.contains(&tag) {
                return Err(MemoryError::LeftoverMapping(tag));
            }
            let mut submap = submaps
                .get(&tag)
                .cloned()
                .ok_or_else(|| MemoryError::MissingSubmap(tag.clone()))?;
            visiting.push(tag);
            submap.import_submaps_inner(submaps, data_width, visiting)?;
            visiting.pop();

            let inherit = entry.unitmask != 0 && entry.unitmask != full_unitmask;
            result.extend(rebase_entries(submap.entries, &entry, inherit));
        }
        self.entries = result;
        Ok(())
    }

    /// Entries of `map` rebased onto `start..=end`, inheriting the given lane
    /// bits where an entry has none. Used when a map is installed at run time.
    pub fn rebased(map: &AddressMap, start: Offset, end: Offset, unitmask: u64, cswidth: u32) -> Vec<AddressMapEntry> {
        let mut parent = AddressMapEntry::new(start, end);
        parent.unitmask = unitmask;
        parent.cswidth = cswidth;
        rebase_entries(map.entries.clone(), &parent, unitmask != 0)
    }
}

/// Moves `entries` from offset 0 onto `parent`'s range, clipping to it.
fn rebase_entries(entries: Vec<AddressMapEntry>, parent: &AddressMapEntry, inherit_lanes: bool) -> Vec<AddressMapEntry> {
    let max_end = parent.addrend.wrapping_sub(parent.addrstart);
    entries
        .into_iter()
        .filter_map(|mut sub| {
            if sub.addrstart > max_end {
                return None;
            }
            sub.addrend = sub.addrend.min(max_end);
            sub.addrstart = sub.addrstart.wrapping_add(parent.addrstart);
            sub.addrend = sub.addrend.wrapping_add(parent.addrstart);
            sub.addrmirror |= parent.addrmirror;
            sub.addrmask |= parent.addrmask;
            sub.addrselect |= parent.addrselect;
            if inherit_lanes {
                if sub.unitmask == 0 {
                    sub.unitmask = parent.unitmask;
                }
                if sub.cswidth == 0 {
                    sub.cswidth = parent.cswidth;
                }
            }
            Some(sub)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::delegate::{ReadDelegate, WriteDelegate};

    #[test]
    fn test_builder_chain() {
        let mut map = AddressMap::new();
        map.range(0x0000, 0x7fff).rom().region("maincpu", 0);
        map.range(0x8000, 0x9fff).ram().mirror(0x2000).share("work");
        map.range(0xc000, 0xc000).portr("IN0").nopw();
        map.range(0xd000, 0xdfff).bankrw("rombank");
        assert_eq!(map.len(), 4);
        assert!(map.entries[0].read.is_rom());
        assert!(map.entries[0].write.is_none());
        assert_eq!(map.entries[1].addrmirror, 0x2000);
        assert_eq!(map.entries[1].share.as_deref(), Some("work"));
        assert!(matches!(map.entries[2].read, MapHandler::Port(ref t) if t == "IN0"));
        assert!(matches!(map.entries[2].write, MapHandler::Nop));
        assert_eq!(map.entries[3].read.to_string(), "bank 'rombank'");
    }

    #[test]
    fn test_delegates() {
        let mut map = AddressMap::new();
        map.range(0x10, 0x1f).rw(
            ReadDelegate::<u8>::new("latch_r", |_, _| 0x42),
            WriteDelegate::<u8>::new("latch_w", |_, _, _| {}),
        );
        match &map.entries[0].read {
            MapHandler::Delegate(d) => assert_eq!(d.name(), "latch_r"),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_import_submap_rebases() {
        let mut io = AddressMap::new();
        io.range(0x0, 0x3).ram();
        io.range(0x4, 0x4).portr("DSW");
        io.range(0x100, 0x1ff).ram();
        let mut submaps = HashMap::new();
        submaps.insert("io".to_string(), io);

        let mut map = AddressMap::new();
        map.range(0x0, 0xfff).ram();
        map.range(0x2000, 0x20ff).m("io").mirror(0x100);
        map.import_submaps(&submaps, 8).unwrap();

        assert_eq!(map.len(), 3);
        assert_eq!((map.entries[1].addrstart, map.entries[1].addrend), (0x2000, 0x2003));
        assert_eq!(map.entries[1].addrmirror, 0x100);
        assert_eq!((map.entries[2].addrstart, map.entries[2].addrend), (0x2004, 0x2004));
    }

    #[test]
    fn test_import_clips_to_range() {
        let mut sub = AddressMap::new();
        sub.range(0x0, 0xff).ram();
        let mut submaps = HashMap::new();
        submaps.insert("sub".to_string(), sub);
        let mut map = AddressMap::new();
        map.range(0x400, 0x40f).m("sub");
        map.import_submaps(&submaps, 16).unwrap();
        assert_eq!((map.entries[0].addrstart, map.entries[0].addrend), (0x400, 0x40f));
    }

    #[test]
    fn test_import_inherits_unitmask() {
        let mut sub = AddressMap::new();
        sub.range(0x0, 0x1).ram();
        sub.range(0x2, 0x3).ram().umask(0x00ff);
        let mut submaps = HashMap::new();
        submaps.insert("sub".to_string(), sub);
        let mut map = AddressMap::new();
        map.range(0x100, 0x1ff).m("sub").umask(0xff00).cswidth(16);
        map.import_submaps(&submaps, 16).unwrap();
        assert_eq!(map.entries[0].unitmask, 0xff00);
        assert_eq!(map.entries[0].cswidth, 16);
        assert_eq!(map.entries[1].unitmask, 0x00ff);
    }

    #[test]
    fn test_import_nested_and_missing() {
        let mut inner = AddressMap::new();
        inner.range(0x0, 0x0).nopr();
        let mut outer = AddressMap::new();
        outer.range(0x10, 0x1f).m("inner");
        let mut submaps = HashMap::new();
        submaps.insert("inner".to_string(), inner);
        submaps.insert("outer".to_string(), outer);

        let mut map = AddressMap::new();
        map.range(0x1000, 0x10ff).m("outer");
        map.import_submaps(&submaps, 8).unwrap();
        assert_eq!(map.entries[0].addrstart, 0x1010);

        let mut bad = AddressMap::new();
        bad.range(0, 0xf).m("nothere");
        assert_eq!(
            bad.import_submaps(&submaps, 8).unwrap_err(),
            MemoryError::MissingSubmap("nothere".to_string())
        );
    }

    #[test]
    fn test_import_cycle_rejected() {
        let mut a = AddressMap::new();
        a.range(0, 0xf).m("a");
        let mut submaps = HashMap::new();
        submaps.insert("a".to_string(), a.clone());
        assert!(a.import_submaps(&submaps, 8).is_err());
    }

    #[test]
    fn test_rebased_for_runtime_install() {
        let mut sub = AddressMap::new();
        sub.range(0x0, 0x7).ram();
        let entries = AddressMap::rebased(&sub, 0x8000, 0x80ff, 0xff, 8);
        assert_eq!(entries[0].addrstart, 0x8000);
        assert_eq!(entries[0].addrend, 0x8007);
        assert_eq!(entries[0].unitmask, 0xff);
    }
}
