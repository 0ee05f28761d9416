//! Memory frame and address types
//!
//! ```text
//! ┌──────────────────┐           ┌──────────────┐
//! │MachineFrameNumber│◀─────────▶│MachineAddress│
//! └──────────────────┘           └──────────────┘
//!
//! ┌───────────────┐              ┌──────────────┐
//! │PageFrameNumber│              │VirtualAddress│
//! └───────────────┘              └──────────────┘
//! ```

use crate::platform::consts::{PAGE_MASK, PAGE_SHIFT};

/// Number of a page in the machine's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineFrameNumber(pub usize);

// mach_to_mfn
impl From<MachineAddress> for MachineFrameNumber {
    fn from(mach: MachineAddress) -> Self {
        Self(mach.0 >> PAGE_SHIFT)
    }
}

/// Number of a page in a domain's pseudo-physical address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageFrameNumber(pub usize);

/// Machine address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineAddress(pub usize);

// mfn_to_mach
impl From<MachineFrameNumber> for MachineAddress {
    fn from(mfn: MachineFrameNumber) -> Self {
        Self(mfn.0 << PAGE_SHIFT)
    }
}

/// Virtual address in the address space of the mapping domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(pub usize);

impl VirtualAddress {
    /// Whether the address lies on a page boundary
    pub fn is_page_aligned(&self) -> bool {
        self.0 & !PAGE_MASK == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_address_conversion() {
        let mfn = MachineFrameNumber(0x1000);
        let mach = MachineAddress::from(mfn);
        assert_eq!(mach, MachineAddress(0x100_0000));
        assert_eq!(MachineFrameNumber::from(MachineAddress(mach.0 + 0x123)), mfn);
    }

    #[test]
    fn page_alignment() {
        assert!(VirtualAddress(0x7000).is_page_aligned());
        assert!(!VirtualAddress(0x7008).is_page_aligned());
    }
}
