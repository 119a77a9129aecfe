//! Device callbacks installed as handlers.

use crate::core::memory::Offset;
use std::fmt;
use std::rc::Rc;

/// Read callback of a given width: `(offset, mem_mask) -> data`.
pub struct ReadDelegate<W> {
    name: String,
    func: Rc<dyn Fn(Offset, W) -> W>,
}

impl<W> ReadDelegate<W> {
    pub fn new(name: impl Into<String>, func: impl Fn(Offset, W) -> W + 'static) -> Self {
        Self {
            name: name.into(),
            func: Rc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn call(&self, offset: Offset, mask: W) -> W {
        (self.func)(offset, mask)
    }
}

impl<W> Clone for ReadDelegate<W> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            func: Rc::clone(&self.func),
        }
    }
}

impl<W> fmt::Debug for ReadDelegate<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReadDelegate({})", self.name)
    }
}

/// Write callback of a given width: `(offset, data, mem_mask)`.
pub struct WriteDelegate<W> {
    name: String,
    func: Rc<dyn Fn(Offset, W, W)>,
}

impl<W> WriteDelegate<W> {
    pub fn new(name: impl Into<String>, func: impl Fn(Offset, W, W) + 'static) -> Self {
        Self {
            name: name.into(),
            func: Rc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn call(&self, offset: Offset, data: W, mask: W) {
        (self.func)(offset, data, mask)
    }
}

impl<W> Clone for WriteDelegate<W> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            func: Rc::clone(&self.func),
        }
    }
}

impl<W> fmt::Debug for WriteDelegate<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriteDelegate({})", self.name)
    }
}

/// Read delegate of any supported width.
#[derive(Debug, Clone)]
pub enum AnyReadDelegate {
    W8(ReadDelegate<u8>),
    W16(ReadDelegate<u16>),
    W32(ReadDelegate<u32>),
    W64(ReadDelegate<u64>),
}

/// Write delegate of any supported width.
#[derive(Debug, Clone)]
pub enum AnyWriteDelegate {
    W8(WriteDelegate<u8>),
    W16(WriteDelegate<u16>),
    W32(WriteDelegate<u32>),
    W64(WriteDelegate<u64>),
}

macro_rules! any_delegate {
    ($any:ident, $delegate:ident) => {
        impl $any {
            /// log2 of the delegate width in bytes
            pub fn width(&self) -> u32 {
                match self {
                    $any::W8(_) => 0,
                    $any::W16(_) => 1,
                    $any::W32(_) => 2,
                    $any::W64(_) => 3,
                }
            }

            pub fn bits(&self) -> u32 {
                8 << self.width()
            }

            pub fn name(&self) -> &str {
                match self {
                    $any::W8(d) => d.name(),
                    $any::W16(d) => d.name(),
                    $any::W32(d) => d.name(),
                    $any::W64(d) => d.name(),
                }
            }
        }

        impl From<$delegate<u8>> for $any {
            fn from(d: $delegate<u8>) -> Self {
                $any::W8(d)
            }
        }

        impl From<$delegate<u16>> for $any {
            fn from(d: $delegate<u16>) -> Self {
                $any::W16(d)
            }
        }

        impl From<$delegate<u32>> for $any {
            fn from(d: $delegate<u32>) -> Self {
                $any::W32(d)
            }
        }

        impl From<$delegate<u64>> for $any {
            fn from(d: $delegate<u64>) -> Self {
                $any::W64(d)
            }
        }
    };
}

any_delegate!(AnyReadDelegate, ReadDelegate);
any_delegate!(AnyWriteDelegate, WriteDelegate);

/// Input/output port that can be mapped into a space by tag.
pub trait IoPort {
    fn tag(&self) -> &str;
    fn read(&self) -> u32;
    fn write(&self, data: u32, mask: u32);
}
