//! Address validation and normalization for install calls.
//!
//! Every install checks the authored range against the space before touching
//! the dispatch trees. A bad range is an author mistake: it comes back as
//! [`MemoryError::InvalidRange`] with a suggested fix where one exists.

use crate::core::memory::{data_mask, shl64, shr64, Endianness, MemoryError, MemoryResult, Offset};

/// Validated and normalized install range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedRange {
    pub start: Offset,
    pub end: Offset,
    pub mask: Offset,
    pub mirror: Offset,
    pub unitmask: u64,
    pub cswidth: u32,
}

/// Space parameters the checks depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressCheck {
    pub addrmask: Offset,
    /// Bus width in bits
    pub data_width: u32,
    pub addr_shift: i8,
    pub endianness: Endianness,
}

/// Rounds the differing bits up to the next power of two minus one.
fn changing_bits(start: Offset, end: Offset) -> Offset {
    let mut bits = start ^ end;
    bits |= bits >> 1;
    bits |= bits >> 2;
    bits |= bits >> 4;
    bits |= bits >> 8;
    bits |= bits >> 16;
    bits
}

/// Folds mirror bits just above a fully covered power-of-two zone into the end
/// address, shrinking the number of replicas.
fn fold_mirror(start: Offset, end: &mut Offset, mirror: &mut Offset, mut changing: Offset) {
    if *mirror == 0 || start & changing != 0 || !*end & changing != 0 {
        return;
    }
    loop {
        let bit = *mirror & changing.wrapping_add(1);
        if bit == 0 {
            break;
        }
        *mirror &= !bit;
        *end |= bit;
        changing |= bit;
    }
}

impl AddressCheck {
    pub fn new(addrmask: Offset, data_width: u32, addr_shift: i8, endianness: Endianness) -> Self {
        Self {
            addrmask,
            data_width,
            addr_shift,
            endianness,
        }
    }

    /// Address bits inside one native bus word.
    pub fn native_lowbits(&self) -> Offset {
        (self.data_width >> (3 - self.addr_shift as i32)).saturating_sub(1)
    }

    fn addr2byte(&self, address: Offset) -> Offset {
        if self.addr_shift < 0 {
            address << -self.addr_shift
        } else {
            address >> self.addr_shift
        }
    }

    fn check_bounds(&self, function: &'static str, start: Offset, end: Offset, context: &str) -> MemoryResult<()> {
        if start > end {
            return Err(invalid(function, format!("{}, start address is after the end address.", context)));
        }
        if start & !self.addrmask != 0 {
            return Err(invalid(
                function,
                format!(
                    "{}, start address is outside of the global address mask {:x}, did you mean {:x} ?",
                    context,
                    self.addrmask,
                    start & self.addrmask
                ),
            ));
        }
        if end & !self.addrmask != 0 {
            return Err(invalid(
                function,
                format!(
                    "{}, end address is outside of the global address mask {:x}, did you mean {:x} ?",
                    context,
                    self.addrmask,
                    end & self.addrmask
                ),
            ));
        }
        Ok(())
    }

    fn check_alignment(
        &self,
        function: &'static str,
        start: Offset,
        end: Offset,
        lowbits: Offset,
        context: &str,
    ) -> MemoryResult<()> {
        if start & lowbits != 0 {
            return Err(invalid(
                function,
                format!("{}, start address has low bits set, did you mean {:x} ?", context, start & !lowbits),
            ));
        }
        if !end & lowbits != 0 {
            return Err(invalid(
                function,
                format!("{}, end address has low bits unset, did you mean {:x} ?", context, end | lowbits),
            ));
        }
        Ok(())
    }

    /// Full check of a handler install. `width` is the handler width in bits.
    #[allow(clippy::too_many_arguments)]
    pub fn check_optimize_all(
        &self,
        function: &'static str,
        width: u32,
        addrstart: Offset,
        addrend: Offset,
        addrmask: Offset,
        addrmirror: Offset,
        addrselect: Offset,
        unitmask: u64,
        cswidth: u32,
    ) -> MemoryResult<NormalizedRange> {
        let context = format!(
            "In range {:x}-{:x} mask {:x} mirror {:x} select {:x}",
            addrstart, addrend, addrmask, addrmirror, addrselect
        );
        self.check_bounds(function, addrstart, addrend, &context)?;

        if width > self.data_width {
            return Err(MemoryError::HandlerTooWide {
                function,
                handler_bits: width,
                bus_bits: self.data_width,
            });
        }

        let default_lowbits = self.native_lowbits();
        let lowbits = if width != 0 && self.addr_shift == 0 {
            (width >> 3) - 1
        } else {
            default_lowbits
        };
        self.check_alignment(function, addrstart, addrend, lowbits, &context)?;

        let set_bits = addrstart | addrend;
        let mut changing = changing_bits(addrstart, addrend);

        let suggest = |what: &str, fix: Offset| invalid(function, format!("{}, {}, did you mean {:x} ?", context, what, fix));
        if addrmask & !self.addrmask != 0 {
            return Err(suggest(
                &format!("mask is outside of the global address mask {:x}", self.addrmask),
                addrmask & self.addrmask,
            ));
        }
        if addrselect & !self.addrmask != 0 {
            return Err(suggest(
                &format!("select is outside of the global address mask {:x}", self.addrmask),
                addrselect & self.addrmask,
            ));
        }
        if addrmask & !changing != 0 {
            return Err(suggest("mask is trying to unmask an unchanging address bit", addrmask & changing));
        }
        if addrmirror & changing != 0 {
            return Err(suggest("mirror touches a changing address bit", addrmirror & !changing));
        }
        if addrselect & changing != 0 {
            return Err(suggest("select touches a changing address bit", addrselect & !changing));
        }
        if addrmirror & set_bits != 0 {
            return Err(suggest("mirror touches a set address bit", addrmirror & !set_bits));
        }
        if addrselect & set_bits != 0 {
            return Err(suggest("select touches a set address bit", addrselect & !set_bits));
        }
        if addrmirror & addrselect != 0 {
            return Err(suggest("mirror touches a select bit", addrmirror & !addrselect));
        }

        if cswidth > self.data_width {
            return Err(invalid(
                function,
                format!(
                    "{}, the cswidth of {} is too large for a {}-bit space.",
                    context, cswidth, self.data_width
                ),
            ));
        }
        if width != 0 && cswidth % width != 0 {
            return Err(invalid(
                function,
                format!("{}, the cswidth of {} is not a multiple of handler size {}.", context, cswidth, width),
            ));
        }
        let ncswidth = if cswidth != 0 { cswidth } else { width };

        // cada grânulo de chip-select deve conter blocos inteiros da largura do handler
        if width != 0 {
            let block_mask = data_mask(width);
            let cs_mask = data_mask(ncswidth);
            for pos in (0..64).step_by(ncswidth as usize) {
                let mut cmask = shr64(unitmask, pos) & cs_mask;
                while cmask != 0 && cmask & block_mask == 0 {
                    cmask = shr64(cmask, width);
                }
                if cmask != 0 && cmask != block_mask {
                    return Err(invalid(
                        function,
                        format!(
                            "{}, the unitmask of {:016x} has incorrect granularity for {}-bit chip selection.",
                            context, unitmask, cswidth
                        ),
                    ));
                }
            }
        }

        let mut start = addrstart;
        let mut end = addrend;
        let mut nunitmask = data_mask(self.data_width);
        if unitmask != 0 {
            nunitmask &= unitmask;
        }
        if start & default_lowbits != 0 || !end & default_lowbits != 0 {
            if (start ^ end) & !default_lowbits != 0 {
                return Err(invalid(
                    function,
                    format!(
                        "{}, start or end is unaligned while the range spans more than one slot (granularity = {}).",
                        context,
                        default_lowbits + 1
                    ),
                ));
            }
            let lowbyte = self.addr2byte(start & default_lowbits);
            let highbyte = self.addr2byte((end & default_lowbits) + 1);
            nunitmask = match self.endianness {
                Endianness::Little => {
                    let hmask = shr64(u64::MAX, 64 - 8 * highbyte);
                    shl64(nunitmask, 8 * lowbyte) & hmask
                }
                Endianness::Big => {
                    let hmask = shr64(u64::MAX, (64 - self.data_width) + 8 * lowbyte);
                    shl64(nunitmask, self.data_width - 8 * highbyte) & hmask
                }
            };
            start &= !default_lowbits;
            end |= default_lowbits;
            if changing < default_lowbits {
                changing = default_lowbits;
            }
        }

        let mask = (if addrmask != 0 { addrmask } else { changing }) | addrselect;
        let mut mirror = (addrmirror & self.addrmask) | addrselect;
        fold_mirror(start, &mut end, &mut mirror, changing);

        Ok(NormalizedRange {
            start,
            end,
            mask,
            mirror,
            unitmask: nunitmask,
            cswidth: ncswidth,
        })
    }

    /// Check of a memory-like install that only carries a mirror.
    pub fn check_optimize_mirror(
        &self,
        function: &'static str,
        addrstart: Offset,
        addrend: Offset,
        addrmirror: Offset,
    ) -> MemoryResult<NormalizedRange> {
        let context = format!("In range {:x}-{:x} mirror {:x}", addrstart, addrend, addrmirror);
        self.check_bounds(function, addrstart, addrend, &context)?;
        self.check_alignment(function, addrstart, addrend, self.native_lowbits(), &context)?;

        let set_bits = addrstart | addrend;
        let changing = changing_bits(addrstart, addrend);

        if addrmirror & !self.addrmask != 0 {
            return Err(invalid(
                function,
                format!(
                    "{}, mirror is outside of the global address mask {:x}, did you mean {:x} ?",
                    context,
                    self.addrmask,
                    addrmirror & self.addrmask
                ),
            ));
        }
        if addrmirror & changing != 0 {
            return Err(invalid(
                function,
                format!(
                    "{}, mirror touches a changing address bit, did you mean {:x} ?",
                    context,
                    addrmirror & !changing
                ),
            ));
        }
        if addrmirror & set_bits != 0 {
            return Err(invalid(
                function,
                format!("{}, mirror touches a set address bit, did you mean {:x} ?", context, addrmirror & !set_bits),
            ));
        }

        let mut end = addrend;
        let mut mirror = addrmirror;
        fold_mirror(addrstart, &mut end, &mut mirror, changing);

        Ok(NormalizedRange {
            start: addrstart,
            end,
            mask: changing,
            mirror,
            unitmask: data_mask(self.data_width),
            cswidth: 0,
        })
    }

    /// Bounds and alignment only.
    pub fn check_address(&self, function: &'static str, addrstart: Offset, addrend: Offset) -> MemoryResult<()> {
        let context = format!("In range {:x}-{:x}", addrstart, addrend);
        self.check_bounds(function, addrstart, addrend, &context)?;
        self.check_alignment(function, addrstart, addrend, self.native_lowbits(), &context)
    }
}

fn invalid(function: &'static str, message: String) -> MemoryError {
    MemoryError::InvalidRange { function, message }
}
