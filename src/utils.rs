#![allow(clippy::cast_possible_truncation)]

/// Low dword of a 64-bit value, as programmed into `*_LO` registers.
#[must_use]
pub const fn lower_32_bits(value: u64) -> u32 {
    value as u32
}

/// High dword of a 64-bit value, as programmed into `*_HI` registers.
#[must_use]
pub const fn upper_32_bits(value: u64) -> u32 {
    (value >> 32) as u32
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// [`align_up`] that returns `None` instead of overflowing.
#[must_use]
pub const fn checked_align_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[must_use]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

/// `ceil(log2(value))`, with `order_base_2(0) == 0` and `order_base_2(1) == 0`.
#[must_use]
pub const fn order_base_2(value: u64) -> u32 {
    if value <= 1 {
        0
    } else {
        64 - (value - 1).leading_zeros()
    }
}
