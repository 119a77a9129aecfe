//! Native bus words.
//!
//! Every address space is specialized on the unsigned integer type matching
//! its data width; this trait carries the per-width constants and the few
//! conversions the dispatch code needs.

use crate::core::memory::delegate::{AnyReadDelegate, AnyWriteDelegate, ReadDelegate, WriteDelegate};
use bytemuck::Pod;
use num_traits::PrimInt;
use std::fmt;

/// Unsigned integer usable as the native word of a bus.
pub trait NativeWord: PrimInt + Pod + Default + fmt::Debug + fmt::UpperHex + 'static {
    /// log2 of the width in bytes (0 for 8 bits, 3 for 64 bits)
    const WIDTH: u32;
    /// Width in bits
    const BITS: u32 = 8 << Self::WIDTH;
    /// Width in bytes
    const BYTES: usize = 1 << Self::WIDTH;

    /// Truncating conversion from a 64-bit value.
    fn from_u64(value: u64) -> Self;

    /// Zero-extending conversion to a 64-bit value.
    fn to_u64(self) -> u64;

    /// Unwraps a read delegate of exactly this width.
    fn read_delegate(delegate: AnyReadDelegate) -> Option<ReadDelegate<Self>>;

    /// Unwraps a write delegate of exactly this width.
    fn write_delegate(delegate: AnyWriteDelegate) -> Option<WriteDelegate<Self>>;
}

macro_rules! native_word {
    ($ty:ty, $width:expr, $variant:ident) => {
        impl NativeWord for $ty {
            const WIDTH: u32 = $width;

            #[inline]
            fn from_u64(value: u64) -> Self {
                value as $ty
            }

            #[inline]
            fn to_u64(self) -> u64 {
                self as u64
            }

            fn read_delegate(delegate: AnyReadDelegate) -> Option<ReadDelegate<Self>> {
                match delegate {
                    AnyReadDelegate::$variant(d) => Some(d),
                    _ => None,
                }
            }

            fn write_delegate(delegate: AnyWriteDelegate) -> Option<WriteDelegate<Self>> {
                match delegate {
                    AnyWriteDelegate::$variant(d) => Some(d),
                    _ => None,
                }
            }
        }
    };
}

native_word!(u8, 0, W8);
native_word!(u16, 1, W16);
native_word!(u32, 2, W32);
native_word!(u64, 3, W64);
