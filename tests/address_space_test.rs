//! End-to-end tests of address spaces built through the memory manager.
//!
//! Tests cover:
//! - RAM, mirrored delegates and unmapped reads on an 8-bit bus
//! - Reinstalling handlers without leaking the replaced ones
//! - Narrow handlers merged onto a 32-bit bus, lane by lane
//! - Bank switching without touching the dispatch tree
//! - Device map installs and access caches

use emumem_rs::{
    AddressMap, AddressSpace, AddressSpaceConfig, Endianness, InstallRange, MachinePhase, MemoryError,
    MemoryManager, MemoryPtr, NativeAccess, ReadDelegate, ReadOrWrite, SpaceId, WriteDelegate,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn config(data_width: u32, addr_width: u32, endianness: Endianness) -> AddressSpaceConfig {
    AddressSpaceConfig::new("program", endianness, data_width, addr_width, 0)
}

/// Manager with one initialized space built from `map`.
fn setup(data_width: u32, addr_width: u32, endianness: Endianness, map: AddressMap) -> (MemoryManager, SpaceId) {
    let mut manager = MemoryManager::new();
    let id = manager
        .add_space("maincpu", 0, config(data_width, addr_width, endianness), map)
        .unwrap();
    manager.initialize().unwrap();
    (manager, id)
}

// ========== Cenário de Barramento de 8 bits ==========

#[test]
fn test_ram_delegate_and_unmapped() {
    let calls = Rc::new(Cell::new(0u32));
    let seen = Rc::clone(&calls);

    let mut map = AddressMap::new();
    map.unmap_value_high();
    map.range(0x0000, 0x3fff).ram();
    map.range(0x8000, 0x8000).mirror(0x0fff).r(ReadDelegate::<u8>::new("status_r", move |offset, _| {
        seen.set(seen.get() + 1);
        0x40 | offset as u8
    }));
    let (manager, id) = setup(8, 16, Endianness::Little, map);
    let space = manager.space(id).unwrap();

    space.write_byte(0x1234, 0x55);
    assert_eq!(space.read_byte(0x1234), 0x55);

    assert_eq!(space.read_byte(0x8000), 0x40);
    assert_eq!(space.read_byte(0x9000), 0xff);
    assert_eq!(space.read_byte(0x8abc), 0x40);
    assert_eq!(calls.get(), 2);

    assert_eq!(space.read_byte(0x4000), 0xff);
    space.write_byte(0x4000, 0x12);
    assert_eq!(space.read_byte(0x4000), 0xff);
    assert_eq!(space.get_handler_string(ReadOrWrite::READ, 0x4000), "unmapped");
}

#[test]
fn test_lookup_reports_installed_range() {
    let mut map = AddressMap::new();
    map.range(0x0000, 0x3fff).ram();
    map.range(0x6000, 0x60ff).ram();
    let (manager, id) = setup(8, 16, Endianness::Little, map);
    let space = manager.space(id).unwrap();

    let range = space.handler_range(ReadOrWrite::READ, 0x2345);
    assert_eq!((range.start, range.end), (0x0000, 0x3fff));
    let range = space.handler_range(ReadOrWrite::WRITE, 0x6080);
    assert_eq!((range.start, range.end), (0x6000, 0x60ff));
}

#[test]
fn test_reinstall_releases_previous_handler() {
    let (mut manager, id) = setup(8, 16, Endianness::Little, AddressMap::new());
    let marker = Rc::new(());

    let first = Rc::clone(&marker);
    let space = manager.space_mut(id).unwrap();
    space
        .install_read_handler(
            InstallRange::new(0x2000, 0x20ff),
            ReadDelegate::<u8>::new("first", move |_, _| {
                let _held = &first;
                1
            })
            .into(),
        )
        .unwrap();
    assert_eq!(Rc::strong_count(&marker), 2);

    let second = Rc::clone(&marker);
    space
        .install_read_handler(
            InstallRange::new(0x2000, 0x20ff),
            ReadDelegate::<u8>::new("second", move |_, _| {
                let _held = &second;
                2
            })
            .into(),
        )
        .unwrap();
    assert_eq!(Rc::strong_count(&marker), 2);
    assert_eq!(space.read_byte(0x2010), 2);
    let range = space.handler_range(ReadOrWrite::READ, 0x2010);
    assert_eq!((range.start, range.end), (0x2000, 0x20ff));
}

#[test]
fn test_rom_region_ignores_writes() {
    let mut manager = MemoryManager::new();
    {
        let region = manager.region_alloc("maincpu", 0x4000, 1, Endianness::Little).unwrap();
        region.base().copy_from(0, &[0x31, 0xfe, 0xff]);
    }
    let mut map = AddressMap::new();
    map.range(0x0000, 0x3fff).rom();
    let id = manager.add_space("maincpu", 0, config(8, 16, Endianness::Little), map).unwrap();
    manager.initialize().unwrap();

    let space = manager.space(id).unwrap();
    assert_eq!(space.read_byte(0x0000), 0x31);
    space.write_byte(0x0000, 0x00);
    assert_eq!(space.read_byte(0x0000), 0x31);
    assert!(space.get_read_ptr(0x0001).is_some());
    assert!(space.get_write_ptr(0x0001).is_none());
}

// ========== Reconciliação de Largura ==========

#[test]
fn test_byte_lanes_on_32bit_bus() {
    let (mut manager, id) = setup(32, 24, Endianness::Little, AddressMap::new());
    let writes: Rc<RefCell<Vec<(usize, u8, u8)>>> = Rc::new(RefCell::new(Vec::new()));
    let space = manager.space_mut(id).unwrap();

    for lane in 0..4usize {
        let log = Rc::clone(&writes);
        let value = 0x10 * (lane as u8 + 1);
        space
            .install_readwrite_handler(
                InstallRange::new(0x1000, 0x1fff).unitmask(0xffu64 << (8 * lane)),
                ReadDelegate::<u8>::new(format!("lane{}_r", lane), move |_, _| value).into(),
                WriteDelegate::<u8>::new(format!("lane{}_w", lane), move |_, data, mask| {
                    log.borrow_mut().push((lane, data, mask))
                })
                .into(),
            )
            .unwrap();
    }

    assert_eq!(space.read_dword(0x1000), 0x4030_2010);
    assert_eq!(space.read_dword_masked(0x1000, 0x00ff_00ff), 0x0030_0010);
    assert_eq!(space.read_byte(0x1002), 0x30);

    space.write_dword_masked(0x1004, 0xaabb_ccdd, 0xff00_ff00);
    assert_eq!(*writes.borrow(), vec![(1, 0xcc, 0xff), (3, 0xaa, 0xff)]);
}

#[test]
fn test_lane_install_over_split_slot_replaces_it() {
    let (mut manager, id) = setup(32, 16, Endianness::Little, AddressMap::new());
    let space = manager.space_mut(id).unwrap();
    space
        .install_read_handler(
            InstallRange::new(0xdbf8, 0xffff).unitmask(0xff00),
            ReadDelegate::<u8>::new("lane1_r", |_, _| 0x55).into(),
        )
        .unwrap();
    assert_eq!(space.read_dword(0xdbf8), 0x0000_5500);

    space
        .install_read_handler(
            InstallRange::new(0x33c4, 0xffff).unitmask(0x00ff),
            ReadDelegate::<u8>::new("lane0_r", |_, _| 0x22).into(),
        )
        .unwrap();
    // 0xc000-0xffff já estava dividido, então recebe um handler de unidades novo sem a lane 1
    assert_eq!(space.read_dword(0xdbf8), 0x0000_0022);
    assert_eq!(space.read_dword(0xc000), 0x0000_0022);
    // 0x33c4 cobre o slot só em parte, que é mesclado lane por lane
    assert_eq!(space.read_dword(0x33c0), 0);
    assert_eq!(space.read_dword(0x33c4), 0x0000_0022);
}

#[test]
fn test_mirrored_lanes_reach_every_replica() {
    let (mut manager, id) = setup(32, 16, Endianness::Little, AddressMap::new());
    let space = manager.space_mut(id).unwrap();
    for (lane, value) in [(0u32, 0x11u8), (2, 0x44)] {
        space
            .install_read_handler(
                InstallRange::new(0x0040, 0x007f).mirror(0x8100).unitmask(0xffu64 << (8 * lane)),
                ReadDelegate::<u8>::new(format!("lane{}_r", lane), move |_, _| value).into(),
            )
            .unwrap();
    }

    for base in [0x0040u32, 0x0140, 0x8040, 0x8140] {
        assert_eq!(space.read_dword(base), 0x0044_0011);
        assert_eq!(space.read_dword(base + 0x3c), 0x0044_0011);
    }
    assert_eq!(space.read_dword(0x0240), 0);
    assert_eq!(space.read_dword(0x4040), 0);
}

#[test]
fn test_big_endian_16bit_words() {
    let mut map = AddressMap::new();
    map.range(0x0000, 0xffff).ram();
    let (manager, id) = setup(16, 24, Endianness::Big, map);
    let space = manager.space(id).unwrap();

    space.write_word(0x0100, 0x1234);
    assert_eq!(space.read_byte(0x0100), 0x12);
    assert_eq!(space.read_byte(0x0101), 0x34);

    space.write_dword(0x0200, 0xdead_beef);
    assert_eq!(space.read_word(0x0200), 0xdead);
    assert_eq!(space.read_word(0x0202), 0xbeef);

    space.write_word_unaligned(0x0301, 0xabcd);
    assert_eq!(space.read_byte(0x0301), 0xab);
    assert_eq!(space.read_byte(0x0302), 0xcd);
    assert_eq!(space.read_word_unaligned(0x0301), 0xabcd);
}

// ========== Bancos ==========

#[test]
fn test_bank_switching() {
    let mut map = AddressMap::new();
    map.range(0x8000, 0xbfff).bankrw("rombank");
    let (manager, id) = setup(8, 16, Endianness::Little, map);
    let space = manager.space(id).unwrap();
    let bank = manager.bank("rombank").unwrap();

    let pages = MemoryPtr::from_vec((0..4u8).flat_map(|page| vec![page; 0x4000]).collect());
    bank.configure_entries(0, 4, &pages, 0x4000);
    for entry in 0..4 {
        bank.set_entry(entry).unwrap();
        assert_eq!(bank.entry(), entry);
        assert_eq!(space.read_byte(0x8123), entry as u8);
    }

    bank.set_entry(1).unwrap();
    space.write_byte(0x8000, 0xee);
    assert_eq!(pages.read::<u8>(0x4000), Some(0xee));
    assert!(matches!(bank.set_entry(7), Err(MemoryError::BankEntryOutOfRange { .. })));
}

// ========== Mapas de Dispositivo e Caches ==========

#[test]
fn test_install_device_map() {
    let (mut manager, id) = setup(8, 16, Endianness::Little, AddressMap::new());
    let mut io = AddressMap::new();
    io.range(0x00, 0x0f).ram();
    io.range(0x10, 0x10).r(ReadDelegate::<u8>::new("id_r", |_, _| 0x5a));
    manager.register_submap("io", io);
    manager.set_phase(MachinePhase::Init);

    let (space, ctx) = manager.space_with_context(id).unwrap();
    space.install_device_map(ctx, 0xe000, 0xe0ff, "io", 0, 0).unwrap();
    space.write_byte(0xe003, 0x77);
    assert_eq!(space.read_byte(0xe003), 0x77);
    assert_eq!(space.read_byte(0xe010), 0x5a);
    assert_eq!(space.get_handler_string(ReadOrWrite::READ, 0xe010), "id_r");
}

#[test]
fn test_cache_follows_installs() {
    let (mut manager, id) = setup(8, 16, Endianness::Little, AddressMap::new());
    let cache = manager.specific::<u8, 0, false>(id).unwrap().create_cache();
    assert_eq!(cache.read_byte(0x3000), 0);

    let ram = MemoryPtr::from_vec(vec![0x99; 0x100]);
    let (space, ctx) = manager.space_with_context(id).unwrap();
    space.install_ram(ctx, 0x3000, 0x30ff, 0, Some(ram)).unwrap();
    assert_eq!(cache.read_byte(0x3000), 0x99);

    space.nop_read(0x3000, 0x30ff, 0).unwrap();
    assert_eq!(cache.read_byte(0x3000), 0);
}
