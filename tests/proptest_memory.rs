//! Property-based tests for address space dispatch.
//!
//! These tests use proptest to check the access laws of a space over random
//! addresses, values and handler layouts:
//! - Mirrored ranges behave as one range
//! - Masked writes to RAM only touch the selected bits
//! - Unmapped addresses always read the unmapped value
//! - Unaligned accesses split and merge in bus byte order
//! - Byte-wide handlers only see the lanes selected by the access mask
//! - Narrow handlers behind a mirror answer identically through every replica
//! - The last install over an address wins, and caches agree with direct reads

use emumem_rs::{
    AddressMap, AddressSpace, AddressSpaceConfig, Endianness, InstallRange, MemoryManager, NativeAccess,
    ReadDelegate, ReadOrWrite, SpaceId, WriteDelegate,
};
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;

/// Initialized manager holding one space built from `map`.
fn setup(data_width: u32, endianness: Endianness, map: AddressMap) -> (MemoryManager, SpaceId) {
    let mut manager = MemoryManager::new();
    let config = AddressSpaceConfig::new("program", endianness, data_width, 16, 0);
    let id = manager.add_space("maincpu", 0, config, map).unwrap();
    manager.initialize().unwrap();
    (manager, id)
}

/// Strategy for a subset of the given mirror bits.
fn replica(mirror: u32) -> impl Strategy<Value = u32> {
    any::<u32>().prop_map(move |bits| bits & mirror)
}

// ========== Espelhos ==========

proptest! {
    /// Writing through any replica of a mirrored range is visible through every other replica
    #[test]
    fn prop_mirror_replicas_alias(
        mirror in prop::sample::select(vec![0x2000u32, 0x4000, 0x8000, 0x6000, 0xa000, 0xe000]),
        offset in 0u32..0x100,
        value in any::<u8>(),
        seed_a in any::<u32>(),
        seed_b in any::<u32>(),
    ) {
        let mut map = AddressMap::new();
        map.range(0x1000, 0x10ff).mirror(mirror).ram();
        let (manager, id) = setup(8, Endianness::Little, map);
        let space = manager.space(id).unwrap();

        let write_at = (0x1000 + offset) | (seed_a & mirror);
        let read_at = (0x1000 + offset) | (seed_b & mirror);
        space.write_byte(write_at, value);
        prop_assert_eq!(space.read_byte(read_at), value);
    }

    /// Every replica reports the same handler
    #[test]
    fn prop_mirror_same_handler(offset in 0u32..0x100, bits in replica(0xc000)) {
        let mut map = AddressMap::new();
        map.range(0x2000, 0x20ff).mirror(0xc000).r(ReadDelegate::<u8>::new("latch_r", |_, _| 0x3c));
        let (manager, id) = setup(8, Endianness::Little, map);
        let space = manager.space(id).unwrap();

        let address = (0x2000 + offset) | bits;
        prop_assert_eq!(space.get_handler_string(ReadOrWrite::READ, address), "latch_r");
        prop_assert_eq!(space.read_byte(address), 0x3c);
    }
}

// ========== RAM ==========

proptest! {
    /// A masked write keeps unselected bits and replaces selected ones
    #[test]
    fn prop_masked_write_merges(
        word in 0u32..0x1000,
        old in any::<u32>(),
        new in any::<u32>(),
        mask in any::<u32>(),
    ) {
        let mut map = AddressMap::new();
        map.range(0x0000, 0x3fff).ram();
        let (manager, id) = setup(32, Endianness::Little, map);
        let space = manager.space(id).unwrap();

        let address = word * 4;
        space.write_dword(address, old);
        space.write_dword_masked(address, new, mask);
        prop_assert_eq!(space.read_dword(address), (old & !mask) | (new & mask));
    }

    /// Unmapped addresses ignore writes and read the unmapped value
    #[test]
    fn prop_unmapped_reads_constant(address in 0x4000u32..=0xffff, value in any::<u8>()) {
        let mut map = AddressMap::new();
        map.unmap_value_high();
        map.range(0x0000, 0x3fff).ram();
        let (manager, id) = setup(8, Endianness::Little, map);
        let space = manager.space(id).unwrap();

        space.write_byte(address, value);
        prop_assert_eq!(space.read_byte(address), 0xff);
    }
}

// ========== Ordem dos Bytes ==========

proptest! {
    /// Unaligned words land on the bus in little-endian byte order
    #[test]
    fn prop_unaligned_word_little_endian(address in 0u32..0x3ffe, value in any::<u16>()) {
        let mut map = AddressMap::new();
        map.range(0x0000, 0x3fff).ram();
        let (manager, id) = setup(16, Endianness::Little, map);
        let space = manager.space(id).unwrap();

        space.write_word_unaligned(address, value);
        prop_assert_eq!(space.read_byte(address), value as u8);
        prop_assert_eq!(space.read_byte(address + 1), (value >> 8) as u8);
        prop_assert_eq!(space.read_word_unaligned(address), value);
    }

    /// Unaligned dwords land on the bus in big-endian byte order
    #[test]
    fn prop_unaligned_dword_big_endian(address in 0u32..0x3ffc, value in any::<u32>()) {
        let mut map = AddressMap::new();
        map.range(0x0000, 0x3fff).ram();
        let (manager, id) = setup(16, Endianness::Big, map);
        let space = manager.space(id).unwrap();

        space.write_dword_unaligned(address, value);
        for (i, byte) in value.to_be_bytes().iter().enumerate() {
            prop_assert_eq!(space.read_byte(address + i as u32), *byte);
        }
        prop_assert_eq!(space.read_dword_unaligned(address), value);
    }
}

// ========== Lanes de Byte ==========

/// Lane values returned by the byte handlers of `lanes_space`.
const LANE_VALUES: [u8; 4] = [0x11, 0x22, 0x44, 0x88];

/// 32-bit little-endian space with one byte handler per lane over 0x1000-0x1fff,
/// logging every write as (lane, data, mask).
fn lanes_space() -> (MemoryManager, SpaceId, Rc<RefCell<Vec<(usize, u8, u8)>>>) {
    let (mut manager, id) = setup(32, Endianness::Little, AddressMap::new());
    let writes = Rc::new(RefCell::new(Vec::new()));
    let space = manager.space_mut(id).unwrap();
    for (lane, &value) in LANE_VALUES.iter().enumerate() {
        let log = Rc::clone(&writes);
        space
            .install_readwrite_handler(
                InstallRange::new(0x1000, 0x1fff).unitmask(0xffu64 << (8 * lane)),
                ReadDelegate::<u8>::new(format!("r{}", lane), move |_, _| value).into(),
                WriteDelegate::<u8>::new(format!("w{}", lane), move |_, data: u8, mask: u8| {
                    log.borrow_mut().push((lane, data, mask))
                })
                .into(),
            )
            .unwrap();
    }
    (manager, id, writes)
}

proptest! {
    /// A masked read merges exactly the lanes the mask touches
    #[test]
    fn prop_lane_read_merges_selected(word in 0x400u32..0x800, mask in any::<u32>()) {
        let (manager, id, _) = lanes_space();
        let space = manager.space(id).unwrap();

        let expected = LANE_VALUES
            .iter()
            .enumerate()
            .filter(|(lane, _)| (mask >> (8 * lane)) & 0xff != 0)
            .fold(0u32, |acc, (lane, &value)| acc | (value as u32) << (8 * lane));
        prop_assert_eq!(space.read_dword_masked(word * 4, mask), expected);
    }

    /// A masked write hands each selected lane its own byte and mask
    #[test]
    fn prop_lane_write_splits_selected(word in 0x400u32..0x800, data in any::<u32>(), mask in any::<u32>()) {
        let (manager, id, writes) = lanes_space();
        let space = manager.space(id).unwrap();

        space.write_dword_masked(word * 4, data, mask);
        let expected: Vec<(usize, u8, u8)> = (0..4)
            .filter(|lane| (mask >> (8 * lane)) & 0xff != 0)
            .map(|lane| (lane, (data >> (8 * lane)) as u8, (mask >> (8 * lane)) as u8))
            .collect();
        prop_assert_eq!(writes.borrow().clone(), expected);
    }
}

// ========== Lanes Espelhadas ==========

/// Lane a byte handler and a word handler share; the word takes the half the byte leaves free.
fn word_half(byte_lane: u32) -> u32 {
    if byte_lane < 2 { 1 } else { 0 }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Narrow handlers merged onto a mirrored range read the same merged value from every replica
    #[test]
    fn prop_mirrored_lanes_every_replica(
        first_word in 0u32..0x20,
        words in 1u32..0x20,
        low_mirror in prop::sample::select(vec![0x0100u32, 0x0400, 0x1000, 0x1500]),
        high_mirror in replica(0xc000),
        byte_lane in 0u32..4,
    ) {
        let (start, end) = (first_word * 4, (first_word + words) * 4 - 1);
        let mirror = low_mirror | high_mirror;
        let half = word_half(byte_lane);

        let (mut manager, id) = setup(32, Endianness::Little, AddressMap::new());
        let space = manager.space_mut(id).unwrap();
        space
            .install_read_handler(
                InstallRange::new(start, end).mirror(mirror).unitmask(0xffu64 << (8 * byte_lane)),
                ReadDelegate::<u8>::new("status_r", |_, _| 0x5a).into(),
            )
            .unwrap();
        space
            .install_read_handler(
                InstallRange::new(start, end).mirror(mirror).unitmask(0xffffu64 << (16 * half)),
                ReadDelegate::<u16>::new("counter_r", |_, _| 0xbeef).into(),
            )
            .unwrap();

        let merged = (0x5au32 << (8 * byte_lane)) | (0xbeefu32 << (16 * half));
        let cache = manager.specific::<u32, 0, false>(id).unwrap().create_cache();
        let space = manager.space(id).unwrap();
        for address in (0u32..0x10000).step_by(4) {
            let base = address & !mirror;
            let expected = if start <= base && base <= end { merged } else { 0 };
            prop_assert_eq!(space.read_dword(address), expected, "direct read at {:x}", address);
            prop_assert_eq!(cache.read_dword(address), expected, "cached read at {:x}", address);
        }
    }
}

// ========== Ordem de Instalação ==========

/// Address bits that differ somewhere between `start` and `end`.
fn changing_bits(start: u32, end: u32) -> u32 {
    match start ^ end {
        0 => 0,
        diff => u32::MAX >> diff.leading_zeros(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The most recent install covering an address owns it, through every replica and through a cache
    #[test]
    fn prop_last_install_wins(
        ranges in prop::collection::vec((0u32..0x1000, 0u32..0x800, any::<u32>()), 1..6),
        probes in prop::collection::vec(0u32..=0xffff, 1..32),
    ) {
        let (mut manager, id) = setup(8, Endianness::Little, AddressMap::new());
        let space = manager.space_mut(id).unwrap();

        let mut installed = Vec::new();
        for (i, &(start, len, bits)) in ranges.iter().enumerate() {
            let end = start + len;
            let mirror = bits & 0xf000 & !(start | end) & !changing_bits(start, end);
            let value = i as u8 + 1;
            space
                .install_read_handler(
                    InstallRange::new(start, end).mirror(mirror),
                    ReadDelegate::<u8>::new(format!("h{}", i), move |_, _| value).into(),
                )
                .unwrap();
            installed.push((start, end, mirror));
        }

        let cache = manager.specific::<u8, 0, false>(id).unwrap().create_cache();
        let space = manager.space(id).unwrap();

        for &probe in &probes {
            let owner = installed
                .iter()
                .rposition(|&(start, end, mirror)| (start..=end).contains(&(probe & !mirror)));
            let name = space.get_handler_string(ReadOrWrite::READ, probe);
            match owner {
                Some(i) => {
                    prop_assert_eq!(&name, &format!("h{}", i));
                    prop_assert_eq!(space.read_byte(probe), i as u8 + 1);
                }
                None => {
                    prop_assert_eq!(&name, "unmapped");
                    prop_assert_eq!(space.read_byte(probe), 0);
                }
            }

            let range = space.handler_range(ReadOrWrite::READ, probe);
            prop_assert!(range.start <= probe && probe <= range.end);
            prop_assert_eq!(&space.get_handler_string(ReadOrWrite::READ, range.start), &name);
            prop_assert_eq!(&space.get_handler_string(ReadOrWrite::READ, range.end), &name);
        }

        for address in 0u32..=0xffff {
            prop_assert_eq!(cache.read_byte(address), space.read_byte(address), "forward at {:x}", address);
        }
        for address in (0u32..=0xffff).rev() {
            prop_assert_eq!(cache.read_byte(address), space.read_byte(address), "backward at {:x}", address);
        }
        for &probe in &probes {
            prop_assert_eq!(cache.read_byte(probe), space.read_byte(probe), "probe order at {:x}", probe);
        }
    }
}
