//! Falcon configuration
//!
//! Board layout and tunable timeouts. Everything board-specific is resolved
//! once into a [`FalconConfig`] and handed to [`crate::Falcon`]; nothing
//! else consults build-time flags.

use falcon_abi::MAX_USABLE_AREA;

use crate::addr::VirtAddr;
use crate::memmap::{MemoryRegion, RegionKind};

/// Storage BIOS blob (S-BIOS), immediately followed by the main BIOS
pub const SBIOS_BASE: u32 = 0x8FE0_0000;
pub const SBIOS_SIZE: u32 = 0x0020_0000;

/// Main BIOS resident blob
pub const BIOS_BASE: u32 = 0x9000_0000;
pub const BIOS_SIZE: u32 = 0x0001_0000;

/// BIOS scratch memory (1MB, 1MB aligned). Zero disables it.
pub const WORK_MEMORY_SIZE: u32 = 0x0010_0000;
pub const WORK_MEMORY_ALIGN: u32 = 0x0010_0000;

/// High exception vector page
pub const VECTOR_PAGE: u32 = 0xFFFF_0000;

/// Offset of the vector table inside the vector page.
///
/// The hand-off work area occupies the words in front of it.
pub const VECTOR_TABLE_OFFSET: u32 = (MAX_USABLE_AREA * 4) as u32;

/// Vector redirected into the BIOS (undefined instruction)
pub const HOOK_VECTOR_OFFSET: u32 = 0x04;

/// Bound on waiting for a device's `falcon_sem` (1s)
pub const FALCON_SEM_TIMEOUT_US: u64 = 1_000_000;

/// Per-iteration bound on an IRQ-driven completion wait (500ms)
pub const IRQ_WAIT_TIMEOUT_US: u64 = 500_000;

/// Timed-out IRQ waits tolerated before the request is failed
pub const IRQ_WAIT_RETRIES: u32 = 8;

/// Bound on a polling completion wait (10s)
pub const POLL_WAIT_TIMEOUT_US: u64 = 10_000_000;

/// Chunks in the S-BIOS debug ring
pub const DEBUG_CHUNK_COUNT: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FalconConfig {
    /// Master switch. When false Falcon never leaves `Absent`.
    pub enabled: bool,
    pub storage_bios: MemoryRegion,
    pub main_bios: MemoryRegion,
    pub work_memory_size: u32,
    pub work_memory_align: u32,
    pub vector_page: VirtAddr,
    pub vector_table_offset: u32,
    pub hook_vector_offset: u32,
    /// Work-area slots that must be free after preparation
    pub min_free_slots: usize,
    pub sem_timeout_us: u64,
    pub irq_wait_timeout_us: u64,
    pub irq_wait_retries: u32,
    pub poll_wait_timeout_us: u64,
    pub debug_chunk_count: u32,
}

impl FalconConfig {
    pub const fn new() -> Self {
        Self {
            enabled: true,
            storage_bios: MemoryRegion::new(SBIOS_BASE, SBIOS_SIZE, RegionKind::StorageBios),
            main_bios: MemoryRegion::new(BIOS_BASE, BIOS_SIZE, RegionKind::MainBios),
            work_memory_size: WORK_MEMORY_SIZE,
            work_memory_align: WORK_MEMORY_ALIGN,
            vector_page: VirtAddr::new(VECTOR_PAGE),
            vector_table_offset: VECTOR_TABLE_OFFSET,
            hook_vector_offset: HOOK_VECTOR_OFFSET,
            min_free_slots: MAX_USABLE_AREA,
            sem_timeout_us: FALCON_SEM_TIMEOUT_US,
            irq_wait_timeout_us: IRQ_WAIT_TIMEOUT_US,
            irq_wait_retries: IRQ_WAIT_RETRIES,
            poll_wait_timeout_us: POLL_WAIT_TIMEOUT_US,
            debug_chunk_count: DEBUG_CHUNK_COUNT,
        }
    }

    /// Address of the exception vector table
    pub const fn vector_table(&self) -> VirtAddr {
        self.vector_page.add(self.vector_table_offset)
    }
}

impl Default for FalconConfig {
    fn default() -> Self {
        Self::new()
    }
}
