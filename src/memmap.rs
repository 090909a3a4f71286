//! Boot-time memory arbitration for the BIOS regions
//!
//! The storage BIOS and main BIOS blobs must sit back to back in ordinary
//! RAM that nobody else has claimed. They are validated and reserved once,
//! before the page allocator takes over; a region that slipped through here
//! would be handed out to the kernel and silently corrupted.

use alloc::vec::Vec;

use crate::addr::PhysAddr;
use crate::mmu::PAGE_SIZE;

// ============================================================================
// Regions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    StorageBios,
    MainBios,
    WorkMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: PhysAddr,
    pub size: u32,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn new(base: u32, size: u32, kind: RegionKind) -> Self {
        Self {
            base: PhysAddr::new(base),
            size,
            kind,
        }
    }

    /// One past the last byte. May be 4GB exactly.
    pub const fn end(&self) -> u64 {
        self.base.as_u64() + self.size as u64
    }

    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() < self.end()
    }
}

/// Half-open physical range `[base, base + size)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub base: u64,
    pub size: u64,
}

impl Range {
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    pub const fn overlaps(&self, base: u64, size: u64) -> bool {
        base < self.end() && self.base < base + size
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The regions do not form one page-granular block: the storage BIOS
    /// does not end where the main BIOS begins, or a bound is off a page
    LayoutError { expected: u64, found: u64 },
    /// Combined region is not entirely RAM
    NotMemory,
    /// Combined region overlaps an existing reservation
    AlreadyReserved,
}

impl core::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemoryError::LayoutError { expected, found } => write!(
                f,
                "BIOS regions not contiguous (found 0x{:08x}, expected 0x{:08x})",
                found, expected
            ),
            MemoryError::NotMemory => write!(f, "BIOS region is not system memory"),
            MemoryError::AlreadyReserved => write!(f, "BIOS region already reserved"),
        }
    }
}

// ============================================================================
// Boot memory collaborator
// ============================================================================

/// Early boot memory map (memblock-like)
pub trait BootMemory {
    /// True if `[base, base + size)` is entirely ordinary memory
    fn is_region_memory(&self, base: u64, size: u64) -> bool;

    /// True if any part of `[base, base + size)` is already reserved
    fn is_region_reserved(&self, base: u64, size: u64) -> bool;

    fn reserve(&mut self, base: u64, size: u64);

    /// Allocate and reserve `size` bytes aligned to `align`
    fn alloc(&mut self, size: u64, align: u64) -> Option<u64>;

    /// RAM banks known to the kernel
    fn memory_banks(&self) -> Vec<Range>;
}

/// Coalesced memory ranges plus a reservation list
#[derive(Debug, Default)]
pub struct MemoryMap {
    memory: Vec<Range>,
    reserved: Vec<Range>,
}

impl MemoryMap {
    pub const fn new() -> Self {
        Self {
            memory: Vec::new(),
            reserved: Vec::new(),
        }
    }

    /// Add a RAM bank, merging with neighbours
    pub fn add_memory(&mut self, base: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.memory.push(Range::new(base, size));
        Self::coalesce(&mut self.memory);
    }

    pub fn banks(&self) -> &[Range] {
        &self.memory
    }

    pub fn reserved(&self) -> &[Range] {
        &self.reserved
    }

    fn coalesce(ranges: &mut Vec<Range>) {
        ranges.sort_by_key(|r| r.base);
        let mut merged: Vec<Range> = Vec::with_capacity(ranges.len());
        for r in ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.base <= last.end() => {
                    let end = last.end().max(r.end());
                    last.size = end - last.base;
                }
                _ => merged.push(r),
            }
        }
        *ranges = merged;
    }
}

impl BootMemory for MemoryMap {
    fn is_region_memory(&self, base: u64, size: u64) -> bool {
        let end = base + size;
        self.memory.iter().any(|r| r.base <= base && end <= r.end())
    }

    fn is_region_reserved(&self, base: u64, size: u64) -> bool {
        self.reserved.iter().any(|r| r.overlaps(base, size))
    }

    fn reserve(&mut self, base: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.reserved.push(Range::new(base, size));
        Self::coalesce(&mut self.reserved);
    }

    fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }
        // Top-down, stepping below any reservation in the way
        let banks = self.memory.clone();
        for bank in banks.iter().rev() {
            let mut top = bank.end();
            while top >= bank.base + size {
                let candidate = (top - size) & !(align - 1);
                if candidate < bank.base {
                    break;
                }
                let blocker = self
                    .reserved
                    .iter()
                    .find(|r| r.overlaps(candidate, size))
                    .map(|r| r.base);
                match blocker {
                    Some(base) => top = base,
                    None => {
                        self.reserve(candidate, size);
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }

    fn memory_banks(&self) -> Vec<Range> {
        self.memory.clone()
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Validate the two BIOS regions and reserve them as one block.
///
/// Returns the combined region (kind `StorageBios`, since it starts there).
pub fn validate_and_reserve<M: BootMemory + ?Sized>(
    storage_bios: &MemoryRegion,
    main_bios: &MemoryRegion,
    map: &mut M,
) -> Result<MemoryRegion, MemoryError> {
    if storage_bios.kind != RegionKind::StorageBios || main_bios.kind != RegionKind::MainBios {
        return Err(MemoryError::LayoutError {
            expected: storage_bios.end(),
            found: main_bios.base.as_u64(),
        });
    }
    for region in [storage_bios, main_bios] {
        check_page_granular(region)?;
    }
    if storage_bios.end() != main_bios.base.as_u64() {
        return Err(MemoryError::LayoutError {
            expected: storage_bios.end(),
            found: main_bios.base.as_u64(),
        });
    }

    let base = storage_bios.base.as_u64();
    let size = main_bios.end() - base;
    let combined_size = u32::try_from(size).map_err(|_| MemoryError::LayoutError {
        expected: base + u64::from(u32::MAX),
        found: main_bios.end(),
    })?;

    if !map.is_region_memory(base, size) {
        return Err(MemoryError::NotMemory);
    }
    if map.is_region_reserved(base, size) {
        return Err(MemoryError::AlreadyReserved);
    }

    map.reserve(base, size);
    log::info!(
        "[Falcon] reserved BIOS region {}-0x{:08x}",
        storage_bios.base,
        main_bios.end()
    );

    Ok(MemoryRegion {
        base: storage_bios.base,
        size: combined_size,
        kind: RegionKind::StorageBios,
    })
}

fn check_page_granular(region: &MemoryRegion) -> Result<(), MemoryError> {
    let page = PAGE_SIZE as u64;
    for bound in [region.base.as_u64(), region.end()] {
        if bound % page != 0 {
            return Err(MemoryError::LayoutError {
                expected: bound.next_multiple_of(page),
                found: bound,
            });
        }
    }
    Ok(())
}

/// Carve out the BIOS scratch area. A size of zero disables it.
///
/// Failure is not fatal: the hook path works without work memory.
pub fn reserve_work_memory<M: BootMemory + ?Sized>(
    size: u32,
    align: u32,
    map: &mut M,
) -> Option<MemoryRegion> {
    if size == 0 {
        return None;
    }
    match map.alloc(size as u64, align as u64) {
        Some(base) if base + size as u64 <= u32::MAX as u64 + 1 => {
            log::info!("[Falcon] work memory at 0x{:08x} ({} bytes)", base, size);
            Some(MemoryRegion::new(base as u32, size, RegionKind::WorkMemory))
        }
        _ => {
            log::warn!("[Falcon] failed to allocate {} bytes of work memory", size);
            None
        }
    }
}
