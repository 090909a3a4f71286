//! MMU model for the ARMv7 short-descriptor format
//!
//! Two-level page table: 4096 first-level slots of 1 MiB, each optionally
//! pointing at a 256-entry second-level table of 4 KiB small pages.
//! Only small-page leaves are modelled; that is all the vector page needs.
//!
//! The page permission controller lives here too: it transiently clears the
//! `APX` bit of one leaf so the read-only vector page can be patched.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::CriticalSection;
use spinning_top::Spinlock;

use crate::addr::{PhysAddr, VirtAddr};
use crate::platform::Platform;
use crate::ram::PhysMemory;

/// Page size: 4KB
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// First-level entries map 1MB each
pub const SECTION_SHIFT: u32 = 20;

/// Entries per second-level table
pub const L2_ENTRIES: usize = 256;

/// Small page descriptor bits
pub mod pte {
    /// Entry is a valid small page
    pub const SMALL_PAGE: u32 = 1 << 1;
    pub const BUFFERABLE: u32 = 1 << 2;
    pub const CACHEABLE: u32 = 1 << 3;
    /// AP[1:0]
    pub const AP0: u32 = 1 << 4;
    pub const AP1: u32 = 1 << 5;
    /// Access permission extension: makes the page read-only
    pub const APX: u32 = 1 << 9;
    /// Non-global
    pub const NG: u32 = 1 << 11;

    pub const PROT_MASK: u32 = AP0 | AP1 | APX;
    pub const ADDR_MASK: u32 = 0xFFFF_F000;

    /// Privileged read/write, no user access
    pub const KERNEL_RW: u32 = AP0;
    /// Privileged read-only, no user access
    pub const KERNEL_RO: u32 = AP0 | APX;
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// No valid leaf entry covers the address
    Unmapped(VirtAddr),
    /// Write to a read-only page
    PermissionFault(VirtAddr),
    /// Another permission flip is outstanding
    FlipInProgress,
}

impl core::fmt::Display for MmuError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MmuError::Unmapped(va) => write!(f, "No mapping for {}", va),
            MmuError::PermissionFault(va) => write!(f, "Permission fault writing {}", va),
            MmuError::FlipInProgress => write!(f, "Page permission flip already in progress"),
        }
    }
}

// ============================================================================
// Page table
// ============================================================================

struct L2Table {
    entries: [u32; L2_ENTRIES],
}

impl L2Table {
    fn new() -> Self {
        Self {
            entries: [0; L2_ENTRIES],
        }
    }
}

/// Active page table hierarchy
pub struct PageTable {
    l1: BTreeMap<u32, Box<L2Table>>,
}

impl PageTable {
    pub const fn new() -> Self {
        Self { l1: BTreeMap::new() }
    }

    /// Map one 4KB page. Creates the second-level table if needed.
    pub fn map_page(&mut self, va: VirtAddr, pa: PhysAddr, prot: u32) -> Result<(), &'static str> {
        if va.page_offset() != 0 || !pa.is_page_aligned() {
            return Err("Addresses must be page-aligned");
        }
        let l2 = self
            .l1
            .entry(va.l1_index())
            .or_insert_with(|| Box::new(L2Table::new()));
        l2.entries[va.l2_index()] = (pa.as_u32() & pte::ADDR_MASK)
            | pte::SMALL_PAGE
            | pte::BUFFERABLE
            | pte::CACHEABLE
            | (prot & pte::PROT_MASK);
        Ok(())
    }

    pub fn unmap_page(&mut self, va: VirtAddr) {
        if let Some(l2) = self.l1.get_mut(&va.l1_index()) {
            l2.entries[va.l2_index()] = 0;
        }
    }

    /// Drop the whole second-level table covering `va`
    pub fn remove_table(&mut self, va: VirtAddr) {
        self.l1.remove(&va.l1_index());
    }

    /// Leaf entry for `va`, if every level is present and valid
    pub fn leaf(&self, va: VirtAddr) -> Option<u32> {
        let l2 = self.l1.get(&va.l1_index())?;
        let entry = l2.entries[va.l2_index()];
        (entry & pte::SMALL_PAGE != 0).then_some(entry)
    }

    fn leaf_mut(&mut self, va: VirtAddr) -> Option<&mut u32> {
        let l2 = self.l1.get_mut(&va.l1_index())?;
        let entry = &mut l2.entries[va.l2_index()];
        if *entry & pte::SMALL_PAGE == 0 {
            return None;
        }
        Some(entry)
    }

    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.leaf(va)
            .map(|entry| PhysAddr::new((entry & pte::ADDR_MASK) | va.page_offset()))
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// MMU
// ============================================================================

/// Protection bits saved by [`Mmu::make_writable`]
#[must_use = "the page stays writable until the permission is restored"]
#[derive(Debug, PartialEq, Eq)]
pub struct SavedPermission {
    page: VirtAddr,
    bits: u32,
}

impl SavedPermission {
    pub fn page(&self) -> VirtAddr {
        self.page
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }
}

/// Page table plus the memory it maps
pub struct Mmu {
    table: Spinlock<PageTable>,
    ram: Spinlock<PhysMemory>,
    /// Set while a permission flip is outstanding. Only one may exist.
    flip_active: AtomicBool,
}

impl Mmu {
    pub fn new(table: PageTable, ram: PhysMemory) -> Self {
        Self {
            table: Spinlock::new(table),
            ram: Spinlock::new(ram),
            flip_active: AtomicBool::new(false),
        }
    }

    pub fn with_table<T>(&self, f: impl FnOnce(&mut PageTable) -> T) -> T {
        f(&mut self.table.lock())
    }

    /// Physical memory access, bypassing translation
    pub fn with_ram<T>(&self, f: impl FnOnce(&mut PhysMemory) -> T) -> T {
        f(&mut self.ram.lock())
    }

    pub fn leaf_entry(&self, va: VirtAddr) -> Option<u32> {
        self.table.lock().leaf(va)
    }

    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.table.lock().translate(va)
    }

    pub fn read_u32(&self, va: VirtAddr) -> Result<u32, MmuError> {
        let pa = self.translate(va).ok_or(MmuError::Unmapped(va))?;
        Ok(self.ram.lock().read_u32(pa))
    }

    /// Write through the page table, honouring `APX`
    pub fn write_u32(&self, va: VirtAddr, value: u32) -> Result<(), MmuError> {
        let pa = {
            let table = self.table.lock();
            let entry = table.leaf(va).ok_or(MmuError::Unmapped(va))?;
            if entry & pte::APX != 0 {
                return Err(MmuError::PermissionFault(va));
            }
            PhysAddr::new((entry & pte::ADDR_MASK) | va.page_offset())
        };
        self.ram.lock().write_u32(pa, value);
        Ok(())
    }

    pub fn flip_active(&self) -> bool {
        self.flip_active.load(Ordering::Acquire)
    }

    /// Clear the read-only bit of the page containing `va`.
    ///
    /// The critical-section token is the caller's proof that interrupts are
    /// off: a fault between the flip and the patch would leave the page in an
    /// unknown protection state.
    ///
    /// # Panics
    /// If the table walk hits an unmapped level. The caller has committed to
    /// writing this page; there is no safe way back.
    pub fn make_writable<P: Platform + ?Sized>(
        &self,
        _cs: CriticalSection<'_>,
        va: VirtAddr,
        platform: &P,
    ) -> Result<SavedPermission, MmuError> {
        if self
            .flip_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MmuError::FlipInProgress);
        }

        let page = va.page_base();
        let bits = {
            let mut table = self.table.lock();
            let Some(entry) = table.leaf_mut(page) else {
                panic!("Fatal: no page table entry for {} while making it writable", page);
            };
            let bits = *entry & pte::PROT_MASK;
            *entry &= !pte::APX;
            bits
        };

        platform.flush_icache_all();
        platform.flush_tlb_page(page);
        Ok(SavedPermission { page, bits })
    }

    /// Put back the protection bits saved by [`Mmu::make_writable`]
    pub fn restore<P: Platform + ?Sized>(&self, va: VirtAddr, saved: SavedPermission, platform: &P) {
        let page = va.page_base();
        if page != saved.page {
            panic!(
                "Fatal: restoring permissions of {} with state saved for {}",
                page, saved.page
            );
        }
        {
            let mut table = self.table.lock();
            let Some(entry) = table.leaf_mut(page) else {
                panic!("Fatal: no page table entry for {} while restoring it", page);
            };
            *entry = (*entry & !pte::PROT_MASK) | saved.bits;
        }

        platform.flush_icache_all();
        platform.flush_tlb_page(page);
        self.flip_active.store(false, Ordering::Release);
    }

    /// Run `f` with the page containing `va` writable, restoring afterwards
    /// whatever `f` returns.
    pub fn with_writable<P, T, F>(
        &self,
        cs: CriticalSection<'_>,
        va: VirtAddr,
        platform: &P,
        f: F,
    ) -> Result<T, MmuError>
    where
        P: Platform + ?Sized,
        F: FnOnce(&Self) -> Result<T, MmuError>,
    {
        let saved = self.make_writable(cs, va, platform)?;
        let result = f(self);
        self.restore(va, saved, platform);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPlatform;

    const VA: VirtAddr = VirtAddr::new(0xFFFF_0000);
    const PA: PhysAddr = PhysAddr::new(0x8000_0000);

    fn mmu_with_ro_page() -> Mmu {
        let mut table = PageTable::new();
        table.map_page(VA, PA, pte::KERNEL_RO).unwrap();
        Mmu::new(table, PhysMemory::new())
    }

    #[test]
    fn test_translate() {
        let mmu = mmu_with_ro_page();
        assert_eq!(mmu.translate(VA.add(0x24)), Some(PA.add(0x24)));
        assert_eq!(mmu.translate(VirtAddr::new(0xFFFE_0000)), None);
    }

    #[test]
    fn test_read_only_page_rejects_writes() {
        let mmu = mmu_with_ro_page();
        assert_eq!(
            mmu.write_u32(VA.add(4), 1),
            Err(MmuError::PermissionFault(VA.add(4)))
        );
    }

    #[test]
    fn test_flip_then_restore() {
        let mmu = mmu_with_ro_page();
        let platform = TestPlatform::new();
        let before = mmu.leaf_entry(VA).unwrap();

        critical_section::with(|cs| {
            let saved = mmu.make_writable(cs, VA.add(0x10), &platform).unwrap();
            assert_eq!(saved.bits(), pte::KERNEL_RO);
            assert!(mmu.flip_active());
            mmu.write_u32(VA.add(0x10), 0x1234).unwrap();
            mmu.restore(VA.add(0x10), saved, &platform);
        });

        assert_eq!(mmu.leaf_entry(VA), Some(before));
        assert!(!mmu.flip_active());
        assert_eq!(mmu.read_u32(VA.add(0x10)), Ok(0x1234));
        assert!(mmu.write_u32(VA.add(0x10), 0).is_err());
        assert_eq!(platform.icache_flushes(), 2);
        assert_eq!(platform.tlb_flushes(), 2);
    }

    #[test]
    fn test_overlapping_flip_rejected() {
        let mmu = mmu_with_ro_page();
        let platform = TestPlatform::new();
        critical_section::with(|cs| {
            let saved = mmu.make_writable(cs, VA, &platform).unwrap();
            assert_eq!(
                mmu.make_writable(cs, VA, &platform),
                Err(MmuError::FlipInProgress)
            );
            mmu.restore(VA, saved, &platform);
        });
    }

    #[test]
    fn test_with_writable_restores_on_error() {
        let mmu = mmu_with_ro_page();
        let platform = TestPlatform::new();
        let result: Result<(), MmuError> = critical_section::with(|cs| {
            mmu.with_writable(cs, VA, &platform, |_| Err(MmuError::Unmapped(VA)))
        });
        assert!(result.is_err());
        assert!(!mmu.flip_active());
        assert_eq!(mmu.leaf_entry(VA).unwrap() & pte::APX, pte::APX);
    }

    #[test]
    #[should_panic(expected = "Fatal")]
    fn test_flip_on_unmapped_level_is_fatal() {
        let mmu = mmu_with_ro_page();
        let platform = TestPlatform::new();
        mmu.with_table(|t| t.remove_table(VA));
        critical_section::with(|cs| {
            let _ = mmu.make_writable(cs, VA, &platform);
        });
    }
}
