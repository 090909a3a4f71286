//! Physical and virtual address newtypes
//!
//! The SoC is 32-bit; both address spaces fit in a `u32`. Arithmetic that
//! can run past 4 GiB (region ends) is done in `u64` by the callers.

use core::fmt;

use crate::mmu::{PAGE_SIZE, SECTION_SHIFT};

/// Physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    pub const fn add(self, offset: u32) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 as usize % PAGE_SIZE == 0
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn add(self, offset: u32) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    pub const fn sub(self, offset: u32) -> Self {
        Self(self.0.wrapping_sub(offset))
    }

    /// Base of the 4 KiB page containing this address
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u32 - 1))
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE as u32 - 1)
    }

    /// Index into the first-level table (1 MiB sections)
    pub const fn l1_index(self) -> u32 {
        self.0 >> SECTION_SHIFT
    }

    /// Index into the second-level table (4 KiB pages)
    pub const fn l2_index(self) -> usize {
        ((self.0 >> 12) & 0xFF) as usize
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_indices() {
        let va = VirtAddr::new(0xFFFF_0024);
        assert_eq!(va.l1_index(), 0xFFF);
        assert_eq!(va.l2_index(), 0xF0);
        assert_eq!(va.page_base(), VirtAddr::new(0xFFFF_0000));
        assert_eq!(va.page_offset(), 0x24);
    }
}
