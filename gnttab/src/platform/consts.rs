//! Platform constants

/// Number of bits in a page offset
pub const PAGE_SHIFT: usize = 12;

/// Size of a page in bytes
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask selecting the frame bits of an address
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);
