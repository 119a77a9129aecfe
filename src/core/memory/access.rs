//! Sized accesses over a native bus.
//!
//! Converts a byte/word/dword/qword access into one or more native-width
//! accesses, honoring bus endianness. All values travel as `u64`; the native
//! operation receives native-width values and masks, zero-extended.

use crate::core::memory::{data_mask, shl64, shr64, Offset};

macro_rules! sized_read {
    ($name:ident, $masked:ident, $ty:ty, $width:expr, $aligned:expr) => {
        fn $name(&self, address: Offset) -> $ty {
            self.$masked(address, <$ty>::MAX)
        }

        fn $masked(&self, address: Offset, mask: $ty) -> $ty {
            let address = address & self.addrmask();
            read_generic(
                self.geometry(),
                $width,
                $aligned,
                |offset, mask| self.read_native(offset, mask),
                address,
                mask as u64,
            ) as $ty
        }
    };
}

macro_rules! sized_write {
    ($name:ident, $masked:ident, $ty:ty, $width:expr, $aligned:expr) => {
        fn $name(&self, address: Offset, data: $ty) {
            self.$masked(address, data, <$ty>::MAX)
        }

        fn $masked(&self, address: Offset, data: $ty, mask: $ty) {
            let address = address & self.addrmask();
            write_generic(
                self.geometry(),
                $width,
                $aligned,
                |offset, data, mask| self.write_native(offset, data, mask),
                address,
                data as u64,
                mask as u64,
            )
        }
    };
}

/// Width, address shift and byte order of a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusGeometry {
    /// log2 of the native width in bytes
    pub width: u32,
    pub addr_shift: i8,
    pub big_endian: bool,
}

impl BusGeometry {
    pub const fn new(width: u32, addr_shift: i8, big_endian: bool) -> Self {
        Self {
            width,
            addr_shift,
            big_endian,
        }
    }

    pub const fn native_bytes(&self) -> u32 {
        1 << self.width
    }

    pub const fn native_bits(&self) -> u32 {
        8 << self.width
    }

    /// Address distance between two consecutive native words.
    pub const fn native_step(&self) -> Offset {
        if self.addr_shift >= 0 {
            self.native_bytes() << self.addr_shift
        } else {
            self.native_bytes() >> -self.addr_shift
        }
    }

    /// Address bits inside one native word.
    pub const fn native_mask(&self) -> Offset {
        self.native_step() - 1
    }

    /// Byte position of an address.
    pub const fn offset_to_byte(&self, offset: Offset) -> Offset {
        if self.addr_shift < 0 {
            offset << -self.addr_shift
        } else {
            offset >> self.addr_shift
        }
    }
}

/// Reads `8 << target_width` bits at `address` through the native reader `rop`.
pub fn read_generic(
    geom: BusGeometry,
    target_width: u32,
    aligned: bool,
    mut rop: impl FnMut(Offset, u64) -> u64,
    address: Offset,
    mask: u64,
) -> u64 {
    let target_bytes = 1u32 << target_width;
    let target_bits = 8 * target_bytes;
    let native_bytes = geom.native_bytes();
    let native_bits = geom.native_bits();
    let native_step = geom.native_step();
    let native_mask = geom.native_mask();
    let nmask = data_mask(native_bits);
    let tmask = data_mask(target_bits);
    let mask = mask & tmask;

    // mesmo tamanho, alinhado: acesso direto
    if native_bytes == target_bytes && (aligned || address & native_mask == 0) {
        return rop(address & !native_mask, mask) & tmask;
    }

    // barramento mais largo: um acesso mascarado quando o alvo cabe em uma palavra
    if native_bytes > target_bytes {
        let lane = if aligned { target_bytes } else { 1 };
        let mut offsbits = 8 * (geom.offset_to_byte(address) & (native_bytes - lane));
        if aligned || offsbits + target_bits <= native_bits {
            if geom.big_endian {
                offsbits = native_bits - target_bits - offsbits;
            }
            let value = rop(address & !native_mask, shl64(mask, offsbits) & nmask);
            return shr64(value, offsbits) & tmask;
        }
    }

    let mut offsbits = 8 * (geom.offset_to_byte(address) & (native_bytes - 1));
    let mut address = address & !native_mask;

    // atravessa duas palavras nativas
    if native_bytes >= target_bytes {
        if !geom.big_endian {
            let mut result = 0;
            let curmask = shl64(mask, offsbits) & nmask;
            if curmask != 0 {
                result = shr64(rop(address, curmask), offsbits);
            }
            offsbits = native_bits - offsbits;
            let curmask = shr64(mask, offsbits);
            if curmask != 0 {
                result |= shl64(rop(address.wrapping_add(native_step), curmask), offsbits);
            }
            return result & tmask;
        }

        let justify = native_bits - target_bits;
        let ljmask = shl64(mask, justify) & nmask;
        let mut result = 0;
        let curmask = shr64(ljmask, offsbits);
        if curmask != 0 {
            result = shl64(rop(address, curmask), offsbits) & nmask;
        }
        offsbits = native_bits - offsbits;
        let curmask = shl64(ljmask, offsbits) & nmask;
        if curmask != 0 {
            result |= shr64(rop(address.wrapping_add(native_step), curmask), offsbits);
        }
        return shr64(result, justify) & tmask;
    }

    // alvo mais largo que o barramento: percorre as palavras nativas
    let splits = target_bytes / native_bytes - 1;
    let mut result = 0u64;
    if !geom.big_endian {
        let curmask = shl64(mask, offsbits) & nmask;
        if curmask != 0 {
            result = shr64(rop(address, curmask), offsbits);
        }
        offsbits = native_bits - offsbits;
        for _ in 0..splits {
            address = address.wrapping_add(native_step);
            let curmask = shr64(mask, offsbits) & nmask;
            if curmask != 0 {
                result |= shl64(rop(address, curmask), offsbits);
            }
            offsbits += native_bits;
        }
        if !aligned && offsbits < target_bits {
            let curmask = shr64(mask, offsbits) & nmask;
            if curmask != 0 {
                result |= shl64(rop(address.wrapping_add(native_step), curmask), offsbits);
            }
        }
    } else {
        offsbits = target_bits - (native_bits - offsbits);
        let curmask = shr64(mask, offsbits) & nmask;
        if curmask != 0 {
            result = shl64(rop(address, curmask), offsbits);
        }
        for _ in 0..splits {
            offsbits -= native_bits;
            address = address.wrapping_add(native_step);
            let curmask = shr64(mask, offsbits) & nmask;
            if curmask != 0 {
                result |= shl64(rop(address, curmask), offsbits);
            }
        }
        if !aligned && offsbits != 0 {
            offsbits = native_bits - offsbits;
            let curmask = shl64(mask, offsbits) & nmask;
            if curmask != 0 {
                result |= shr64(rop(address.wrapping_add(native_step), curmask), offsbits);
            }
        }
    }
    result & tmask
}

/// Writes `8 << target_width` bits at `address` through the native writer `wop`.
pub fn write_generic(
    geom: BusGeometry,
    target_width: u32,
    aligned: bool,
    mut wop: impl FnMut(Offset, u64, u64),
    address: Offset,
    data: u64,
    mask: u64,
) {
    let target_bytes = 1u32 << target_width;
    let target_bits = 8 * target_bytes;
    let native_bytes = geom.native_bytes();
    let native_bits = geom.native_bits();
    let native_step = geom.native_step();
    let native_mask = geom.native_mask();
    let nmask = data_mask(native_bits);
    let tmask = data_mask(target_bits);
    let data = data & tmask;
    let mask = mask & tmask;

    if native_bytes == target_bytes && (aligned || address & native_mask == 0) {
        wop(address & !native_mask, data, mask);
        return;
    }

    if native_bytes > target_bytes {
        let lane = if aligned { target_bytes } else { 1 };
        let mut offsbits = 8 * (geom.offset_to_byte(address) & (native_bytes - lane));
        if aligned || offsbits + target_bits <= native_bits {
            if geom.big_endian {
                offsbits = native_bits - target_bits - offsbits;
            }
            wop(
                address & !native_mask,
                shl64(data, offsbits) & nmask,
                shl64(mask, offsbits) & nmask,
            );
            return;
        }
    }

    let mut offsbits = 8 * (geom.offset_to_byte(address) & (native_bytes - 1));
    let mut address = address & !native_mask;

    if native_bytes >= target_bytes {
        if !geom.big_endian {
            let curmask = shl64(mask, offsbits) & nmask;
            if curmask != 0 {
                wop(address, shl64(data, offsbits) & nmask, curmask);
            }
            offsbits = native_bits - offsbits;
            let curmask = shr64(mask, offsbits);
            if curmask != 0 {
                wop(address.wrapping_add(native_step), shr64(data, offsbits), curmask);
            }
            return;
        }

        let justify = native_bits - target_bits;
        let ljdata = shl64(data, justify) & nmask;
        let ljmask = shl64(mask, justify) & nmask;
        let curmask = shr64(ljmask, offsbits);
        if curmask != 0 {
            wop(address, shr64(ljdata, offsbits), curmask);
        }
        offsbits = native_bits - offsbits;
        let curmask = shl64(ljmask, offsbits) & nmask;
        if curmask != 0 {
            wop(address.wrapping_add(native_step), shl64(ljdata, offsbits) & nmask, curmask);
        }
        return;
    }

    let splits = target_bytes / native_bytes - 1;
    if !geom.big_endian {
        let curmask = shl64(mask, offsbits) & nmask;
        if curmask != 0 {
            wop(address, shl64(data, offsbits) & nmask, curmask);
        }
        offsbits = native_bits - offsbits;
        for _ in 0..splits {
            address = address.wrapping_add(native_step);
            let curmask = shr64(mask, offsbits) & nmask;
            if curmask != 0 {
                wop(address, shr64(data, offsbits) & nmask, curmask);
            }
            offsbits += native_bits;
        }
        if !aligned && offsbits < target_bits {
            let curmask = shr64(mask, offsbits) & nmask;
            if curmask != 0 {
                wop(address.wrapping_add(native_step), shr64(data, offsbits) & nmask, curmask);
            }
        }
    } else {
        offsbits = target_bits - (native_bits - offsbits);
        let curmask = shr64(mask, offsbits) & nmask;
        if curmask != 0 {
            wop(address, shr64(data, offsbits) & nmask, curmask);
        }
        for _ in 0..splits {
            offsbits -= native_bits;
            address = address.wrapping_add(native_step);
            let curmask = shr64(mask, offsbits) & nmask;
            if curmask != 0 {
                wop(address, shr64(data, offsbits) & nmask, curmask);
            }
        }
        if !aligned && offsbits != 0 {
            offsbits = native_bits - offsbits;
            let curmask = shl64(mask, offsbits) & nmask;
            if curmask != 0 {
                wop(address.wrapping_add(native_step), shl64(data, offsbits) & nmask, curmask);
            }
        }
    }
}

/// Native-width entry points plus the sized accessors built on them.
///
/// Every sized access masks the address with the space mask first.
pub trait NativeAccess {
    fn geometry(&self) -> BusGeometry;

    fn addrmask(&self) -> Offset;

    /// Native read; `mask` and the result are native-width values.
    fn read_native(&self, address: Offset, mask: u64) -> u64;

    /// Native write; `data` and `mask` are native-width values.
    fn write_native(&self, address: Offset, data: u64, mask: u64);

    sized_read!(read_byte, read_byte_masked, u8, 0, true);
    sized_read!(read_word, read_word_masked, u16, 1, true);
    sized_read!(read_word_unaligned, read_word_unaligned_masked, u16, 1, false);
    sized_read!(read_dword, read_dword_masked, u32, 2, true);
    sized_read!(read_dword_unaligned, read_dword_unaligned_masked, u32, 2, false);
    sized_read!(read_qword, read_qword_masked, u64, 3, true);
    sized_read!(read_qword_unaligned, read_qword_unaligned_masked, u64, 3, false);

    sized_write!(write_byte, write_byte_masked, u8, 0, true);
    sized_write!(write_word, write_word_masked, u16, 1, true);
    sized_write!(write_word_unaligned, write_word_unaligned_masked, u16, 1, false);
    sized_write!(write_dword, write_dword_masked, u32, 2, true);
    sized_write!(write_dword_unaligned, write_dword_unaligned_masked, u32, 2, false);
    sized_write!(write_qword, write_qword_masked, u64, 3, true);
    sized_write!(write_qword_unaligned, write_qword_unaligned_masked, u64, 3, false);
}
