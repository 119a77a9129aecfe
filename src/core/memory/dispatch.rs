// emumem-rs/src/core/memory/dispatch.rs

//! Radix dispatch tree.
//!
//! Each level covers the address bits `low_bits..high_bits` with
//! `1 << (high - low)` slots. A slot holds either a terminal handler or the
//! next, narrower level; levels are only created when an install needs to
//! split a slot. Every slot also remembers the exact range its handler was
//! installed for, which is what [`DispatchNode::lookup`] reports.
//!
//! Bit budget per level: above 14 bits the level stops at bit 14, below that
//! it goes straight down to the native granularity of the bus.

use crate::core::memory::handler::{HandlerEntry, ReadHandler, WriteHandler};
use crate::core::memory::pointer::MemoryPtr;
use crate::core::memory::units::{RangeKey, Units, UnitsDescriptor};
use crate::core::memory::word::NativeWord;
use crate::core::memory::{offset_mask, Offset};
use std::cell::RefCell;
use std::rc::Rc;

/// Address range validated for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRange {
    pub start: Offset,
    pub end: Offset,
}

impl HandlerRange {
    pub fn new(start: Offset, end: Offset) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, address: Offset) -> bool {
        self.start <= address && address <= self.end
    }
}

enum DispatchSlot<H> {
    Handler(Rc<H>),
    Dispatch(Box<DispatchNode<H>>),
}

/// Low bit of the level whose high bit is `high`.
fn level_low_bits(high: u32, native: u32) -> u32 {
    if high > 14 {
        14
    } else {
        native
    }
}

/// Cached (original handler, selection key) to patched units handler.
struct Mapping<H> {
    original: Option<Rc<H>>,
    ukey: u8,
    patched: Rc<H>,
}

/// State of one mismatched population pass.
///
/// The mapping list lives exactly as long as the pass, so slots needing the
/// same reconciliation against the same original share one units handler.
pub struct MismatchedPatch<'a, H: HandlerEntry> {
    descriptor: &'a UnitsDescriptor,
    sub: &'a H::Sub,
    space_unmap: u64,
    mappings: Vec<Mapping<H>>,
}

impl<'a, H: HandlerEntry> MismatchedPatch<'a, H> {
    pub fn new(descriptor: &'a UnitsDescriptor, sub: &'a H::Sub, space_unmap: u64) -> Self {
        Self {
            descriptor,
            sub,
            space_unmap,
            mappings: Vec::new(),
        }
    }

    /// Number of distinct units handlers built so far.
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    fn patch(&mut self, rkey: RangeKey, target: &DispatchSlot<H>) -> Rc<H> {
        let ukey = self.descriptor.rkey_to_ukey(rkey);
        let original = match target {
            DispatchSlot::Handler(h) if h.as_units().is_some() => Some(Rc::clone(h)),
            _ => None,
        };

        let found = self.mappings.iter().find(|m| {
            m.ukey == ukey
                && match (&m.original, &original) {
                    (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                    (None, None) => true,
                    _ => false,
                }
        });
        if let Some(m) = found {
            return Rc::clone(&m.patched);
        }

        let units = match original.as_ref().and_then(|h| h.as_units()) {
            Some(src) => Units::patched(self.descriptor, ukey, self.sub, src, self.space_unmap),
            None => Units::new(self.descriptor, ukey, self.sub, self.space_unmap),
        };
        let patched = Rc::new(H::from_units(units));
        self.mappings.push(Mapping {
            original,
            ukey,
            patched: Rc::clone(&patched),
        });
        patched
    }
}

/// One level of the dispatch tree.
pub struct DispatchNode<H> {
    high_bits: u32,
    low_bits: u32,
    native_bits: u32,
    slots: Vec<DispatchSlot<H>>,
    ranges: Vec<HandlerRange>,
}

impl<H: HandlerEntry> DispatchNode<H> {
    /// Level covering bits `..high_bits` with every slot on `handler`.
    pub fn new(high_bits: u32, native_bits: u32, init: HandlerRange, handler: &Rc<H>) -> Self {
        let low_bits = level_low_bits(high_bits, native_bits);
        let count = 1usize << (high_bits - low_bits);
        Self {
            high_bits,
            low_bits,
            native_bits,
            slots: (0..count).map(|_| DispatchSlot::Handler(Rc::clone(handler))).collect(),
            ranges: vec![init; count],
        }
    }

    pub fn high_bits(&self) -> u32 {
        self.high_bits
    }

    pub fn low_bits(&self) -> u32 {
        self.low_bits
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    fn is_leaf(&self) -> bool {
        self.low_bits <= self.native_bits
    }

    fn lowmask(&self) -> Offset {
        offset_mask(self.low_bits)
    }

    fn highmask(&self) -> Offset {
        offset_mask(self.high_bits) & !self.lowmask()
    }

    #[inline]
    fn slot_index(&self, address: Offset) -> usize {
        ((address >> self.low_bits) as usize) & (self.slots.len() - 1)
    }

    /// Range and terminal handler resolving `address`.
    pub fn lookup(&self, address: Offset) -> (HandlerRange, Rc<H>) {
        let slot = self.slot_index(address);
        match &self.slots[slot] {
            DispatchSlot::Handler(h) => (self.ranges[slot], Rc::clone(h)),
            DispatchSlot::Dispatch(node) => node.lookup(address),
        }
    }

    pub fn get_ptr(&self, address: Offset) -> Option<MemoryPtr> {
        match &self.slots[self.slot_index(address)] {
            DispatchSlot::Handler(h) => h.get_ptr(address),
            DispatchSlot::Dispatch(node) => node.get_ptr(address),
        }
    }

    /// Number of levels below and including this one.
    pub fn depth(&self) -> usize {
        1 + self
            .slots
            .iter()
            .map(|slot| match slot {
                DispatchSlot::Dispatch(node) => node.depth(),
                DispatchSlot::Handler(_) => 0,
            })
            .max()
            .unwrap_or(0)
    }

    /// Installs `handler` over `start..=end`, widened to native granules.
    pub fn populate(&mut self, start: Offset, end: Offset, mirror: Offset, handler: &Rc<H>) {
        let native_mask = offset_mask(self.native_bits);
        let start = start & !native_mask;
        let end = end | native_mask;
        if mirror != 0 {
            self.populate_mirror(start, end, start, end, mirror, handler);
        } else {
            self.populate_nomirror(start, end, start, end, handler);
        }
    }

    /// Installs units handlers reconciling a narrower handler over `start..=end`.
    pub fn populate_mismatched(&mut self, start: Offset, end: Offset, mirror: Offset, patch: &mut MismatchedPatch<'_, H>) {
        let native_mask = offset_mask(self.native_bits);
        let start = start & !native_mask;
        let end = end | native_mask;
        if mirror != 0 {
            self.populate_mismatched_mirror(start, end, start, end, mirror, patch);
        } else {
            self.populate_mismatched_nomirror(start, end, start, end, RangeKey::START | RangeKey::END, patch);
        }
    }

    /// Truncates the ranges of slots below `below` so they end at `address`.
    fn range_cut_before(&mut self, address: Offset, below: usize) {
        let mut slot = below;
        while slot > 0 {
            slot -= 1;
            if let DispatchSlot::Dispatch(node) = &mut self.slots[slot] {
                let count = node.count();
                node.range_cut_before(address, count);
                break;
            }
            if self.ranges[slot].end <= address {
                break;
            }
            self.ranges[slot].end = address;
        }
    }

    /// Truncates the ranges of slots from `above` up so they start at `address`.
    fn range_cut_after(&mut self, address: Offset, above: usize) {
        for slot in above..self.slots.len() {
            if let DispatchSlot::Dispatch(node) = &mut self.slots[slot] {
                node.range_cut_after(address, 0);
                break;
            }
            if self.ranges[slot].start >= address {
                break;
            }
            self.ranges[slot].start = address;
        }
    }

    fn cut_neighbours(&mut self, start_entry: usize, end_entry: usize, ostart: Offset, oend: Offset) {
        self.range_cut_before(ostart.wrapping_sub(1), start_entry);
        self.range_cut_after(oend.wrapping_add(1), end_entry + 1);
    }

    fn set_slot(&mut self, entry: usize, handler: Rc<H>, ostart: Offset, oend: Offset) {
        self.slots[entry] = DispatchSlot::Handler(handler);
        self.ranges[entry] = HandlerRange::new(ostart, oend);
    }

    /// Runs `f` on the child level of `entry`, splitting the slot first if it
    /// still holds a terminal handler.
    fn with_subdispatch(&mut self, entry: usize, f: impl FnOnce(&mut DispatchNode<H>)) {
        let low_bits = self.low_bits;
        let native_bits = self.native_bits;
        let range = self.ranges[entry];
        let slot = &mut self.slots[entry];
        if let DispatchSlot::Handler(handler) = &*slot {
            let node = DispatchNode::new(low_bits, native_bits, range, handler);
            *slot = DispatchSlot::Dispatch(Box::new(node));
        }
        if let DispatchSlot::Dispatch(node) = slot {
            f(node.as_mut());
        }
    }

    pub fn populate_nomirror(&mut self, start: Offset, end: Offset, ostart: Offset, oend: Offset, handler: &Rc<H>) {
        let mut start_entry = self.slot_index(start);
        let mut end_entry = self.slot_index(end);
        self.cut_neighbours(start_entry, end_entry, ostart, oend);

        if self.is_leaf() {
            for ent in start_entry..=end_entry {
                self.set_slot(ent, Rc::clone(handler), ostart, oend);
            }
            return;
        }

        let lowmask = self.lowmask();
        if start_entry == end_entry {
            if start & lowmask == 0 && end & lowmask == lowmask {
                self.set_slot(start_entry, Rc::clone(handler), ostart, oend);
            } else {
                self.with_subdispatch(start_entry, |node| {
                    node.populate_nomirror(start & lowmask, end & lowmask, ostart, oend, handler)
                });
            }
            return;
        }

        if start & lowmask != 0 {
            self.with_subdispatch(start_entry, |node| {
                node.populate_nomirror(start & lowmask, lowmask, ostart, oend, handler)
            });
            start_entry += 1;
        }
        if end & lowmask != lowmask {
            self.with_subdispatch(end_entry, |node| node.populate_nomirror(0, end & lowmask, ostart, oend, handler));
            end_entry -= 1;
        }
        for ent in start_entry..=end_entry {
            self.set_slot(ent, Rc::clone(handler), ostart, oend);
        }
    }

    pub fn populate_mirror(
        &mut self,
        start: Offset,
        end: Offset,
        ostart: Offset,
        oend: Offset,
        mirror: Offset,
        handler: &Rc<H>,
    ) {
        let hmirror = mirror & self.highmask();
        // bits nativos nunca selecionam um slot distinto
        let lmirror = if self.is_leaf() { 0 } else { mirror & self.lowmask() };
        let add = 1u32.wrapping_add(!hmirror);
        let mut offset: Offset = 0;

        if lmirror != 0 {
            // todas as réplicas caem em um único slot
            let lowmask = self.lowmask();
            let base_entry = start >> self.low_bits;
            let (start, end) = (start & lowmask, end & lowmask);
            loop {
                let entry = (base_entry | (offset >> self.low_bits)) as usize & (self.slots.len() - 1);
                let (rstart, rend) = (ostart | offset, oend | offset);
                self.cut_neighbours(entry, entry, rstart, rend | lmirror);
                self.with_subdispatch(entry, |node| node.populate_mirror(start, end, rstart, rend, lmirror, handler));
                offset = offset.wrapping_add(add) & hmirror;
                if offset == 0 {
                    break;
                }
            }
        } else {
            loop {
                self.populate_nomirror(start | offset, end | offset, ostart | offset, oend | offset, handler);
                offset = offset.wrapping_add(add) & hmirror;
                if offset == 0 {
                    break;
                }
            }
        }
    }

    pub fn populate_mismatched_nomirror(
        &mut self,
        start: Offset,
        end: Offset,
        ostart: Offset,
        oend: Offset,
        mut rkey: RangeKey,
        patch: &mut MismatchedPatch<'_, H>,
    ) {
        let mut start_entry = self.slot_index(start);
        let mut end_entry = self.slot_index(end);
        self.cut_neighbours(start_entry, end_entry, ostart, oend);

        if self.is_leaf() {
            self.patch_run(start_entry, end_entry, ostart, oend, rkey, patch);
            return;
        }

        let lowmask = self.lowmask();
        if start_entry == end_entry {
            if start & lowmask == 0 && end & lowmask == lowmask {
                let replacement = patch.patch(rkey, &self.slots[start_entry]);
                self.set_slot(start_entry, replacement, ostart, oend);
            } else {
                self.with_subdispatch(start_entry, |node| {
                    node.populate_mismatched_nomirror(start & lowmask, end & lowmask, ostart, oend, rkey, patch)
                });
            }
            return;
        }

        if start & lowmask != 0 {
            let key = rkey - RangeKey::END;
            self.with_subdispatch(start_entry, |node| {
                node.populate_mismatched_nomirror(start & lowmask, lowmask, ostart, oend, key, patch)
            });
            start_entry += 1;
            rkey.remove(RangeKey::START);
        }
        if end & lowmask != lowmask {
            let key = rkey - RangeKey::START;
            self.with_subdispatch(end_entry, |node| {
                node.populate_mismatched_nomirror(0, end & lowmask, ostart, oend, key, patch)
            });
            end_entry -= 1;
            rkey.remove(RangeKey::END);
        }
        if start_entry <= end_entry {
            self.patch_run(start_entry, end_entry, ostart, oend, rkey, patch);
        }
    }

    /// Patches every slot of `start_entry..=end_entry`; only the first keeps
    /// the START constraint and only the last keeps END.
    fn patch_run(
        &mut self,
        start_entry: usize,
        end_entry: usize,
        ostart: Offset,
        oend: Offset,
        rkey: RangeKey,
        patch: &mut MismatchedPatch<'_, H>,
    ) {
        for ent in start_entry..=end_entry {
            let mut key = rkey;
            if ent != start_entry {
                key.remove(RangeKey::START);
            }
            if ent != end_entry {
                key.remove(RangeKey::END);
            }
            let replacement = patch.patch(key, &self.slots[ent]);
            self.set_slot(ent, replacement, ostart, oend);
        }
    }

    pub fn populate_mismatched_mirror(
        &mut self,
        start: Offset,
        end: Offset,
        ostart: Offset,
        oend: Offset,
        mirror: Offset,
        patch: &mut MismatchedPatch<'_, H>,
    ) {
        let hmirror = mirror & self.highmask();
        // bits nativos nunca selecionam um slot distinto
        let lmirror = if self.is_leaf() { 0 } else { mirror & self.lowmask() };
        let add = 1u32.wrapping_add(!hmirror);
        let mut offset: Offset = 0;

        if lmirror != 0 {
            let lowmask = self.lowmask();
            let base_entry = start >> self.low_bits;
            let (start, end) = (start & lowmask, end & lowmask);
            loop {
                let entry = (base_entry | (offset >> self.low_bits)) as usize & (self.slots.len() - 1);
                let (rstart, rend) = (ostart | offset, oend | offset);
                self.cut_neighbours(entry, entry, rstart, rend | lmirror);
                self.with_subdispatch(entry, |node| {
                    node.populate_mismatched_mirror(start, end, rstart, rend, lmirror, patch)
                });
                offset = offset.wrapping_add(add) & hmirror;
                if offset == 0 {
                    break;
                }
            }
        } else {
            loop {
                self.populate_mismatched_nomirror(
                    start | offset,
                    end | offset,
                    ostart | offset,
                    oend | offset,
                    RangeKey::START | RangeKey::END,
                    patch,
                );
                offset = offset.wrapping_add(add) & hmirror;
                if offset == 0 {
                    break;
                }
            }
        }
    }
}

impl<W: NativeWord> DispatchNode<ReadHandler<W>> {
    #[inline]
    pub fn read(&self, offset: Offset, mask: W) -> W {
        match &self.slots[self.slot_index(offset)] {
            DispatchSlot::Handler(h) => h.read(offset, mask),
            DispatchSlot::Dispatch(node) => node.read(offset, mask),
        }
    }
}

impl<W: NativeWord> DispatchNode<WriteHandler<W>> {
    #[inline]
    pub fn write(&self, offset: Offset, data: W, mask: W) {
        match &self.slots[self.slot_index(offset)] {
            DispatchSlot::Handler(h) => h.write(offset, data, mask),
            DispatchSlot::Dispatch(node) => node.write(offset, data, mask),
        }
    }
}

/// Read and write roots of one space, shared with its access caches.
///
/// Installing from inside a handler callback while an access is in flight
/// panics on the borrow.
pub struct DispatchRoots<W: NativeWord> {
    pub read: RefCell<DispatchNode<ReadHandler<W>>>,
    pub write: RefCell<DispatchNode<WriteHandler<W>>>,
}

impl<W: NativeWord> DispatchRoots<W> {
    pub fn new(read: DispatchNode<ReadHandler<W>>, write: DispatchNode<WriteHandler<W>>) -> Self {
        Self {
            read: RefCell::new(read),
            write: RefCell::new(write),
        }
    }
}
