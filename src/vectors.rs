//! Exception vector hooking
//!
//! Redirects one exception vector into the resident BIOS. The vector word is
//! replaced by a trampoline (`ldr pc, [pc, #-imm]`) that loads its target
//! from one of the hand-off slots in the work area right in front of the
//! vector table. Both live in the read-only vector page, so every patch
//! happens inside a permission flip with interrupts off.
//!
//! Ordering matters: the slot is filled before the vector points at it, and
//! on rollback the vector is restored before the slot is freed. A fault at
//! any instant sees either the original vector or a fully populated slot.

use falcon_abi::{MAX_USABLE_AREA, WORD_SIZE, WORK_AREA_MARK, svc};
use critical_section::CriticalSection;

use crate::addr::VirtAddr;
use crate::bios::{BiosChannel, BiosPresence, ResidentBios};
use crate::config::FalconConfig;
use crate::mmu::{Mmu, MmuError, PAGE_SIZE};
use crate::platform::Platform;

/// Number of entries in the ARM exception vector table
pub const VECTOR_COUNT: u32 = 8;

const WORK_AREA_BYTES: u32 = MAX_USABLE_AREA as u32 * WORD_SIZE;

// ============================================================================
// Layout
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorLayout {
    /// The vector page
    pub page: VirtAddr,
    /// Offset of the vector table within the page
    pub table_offset: u32,
}

impl VectorLayout {
    pub const fn from_config(config: &FalconConfig) -> Self {
        Self {
            page: config.vector_page,
            table_offset: config.vector_table_offset,
        }
    }

    pub const fn table(&self) -> VirtAddr {
        self.page.add(self.table_offset)
    }

    pub const fn work_area(&self) -> VirtAddr {
        self.table().sub(WORK_AREA_BYTES)
    }

    pub const fn slot_addr(&self, slot: usize) -> VirtAddr {
        self.work_area().add(slot as u32 * WORD_SIZE)
    }

    pub const fn vector_addr(&self, vector_offset: u32) -> VirtAddr {
        self.table().add(vector_offset)
    }

    /// Work area and vector table must share the vector page
    fn validate(&self) -> Result<(), HookError> {
        if self.page.page_offset() != 0
            || self.table_offset < WORK_AREA_BYTES
            || self.table_offset + VECTOR_COUNT * WORD_SIZE > PAGE_SIZE as u32
        {
            return Err(HookError::BadLayout);
        }
        Ok(())
    }
}

// ============================================================================
// State and errors
// ============================================================================

/// What a successful hook changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookRecord {
    pub vector_offset: u32,
    pub slot: usize,
    /// Vector word before the trampoline went in
    pub original: u32,
    /// BIOS entry point stored in the slot
    pub target: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Unprepared,
    Prepared,
    Hooked(HookRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookError {
    /// Work area does not fit in front of the vector table
    BadLayout,
    NotPrepared,
    AlreadyHooked,
    /// Fewer marked slots than required
    InsufficientWorkArea { found: usize, required: usize },
    /// Every slot is taken
    WorkAreaExhausted,
    /// Not a vector, or the trampoline cannot reach the work area
    BadVectorOffset(u32),
    /// BIOS refused the registration; everything was rolled back
    HookRejectedByBios(i32),
    BiosNotReady,
    Mmu(MmuError),
}

impl From<MmuError> for HookError {
    fn from(e: MmuError) -> Self {
        HookError::Mmu(e)
    }
}

impl core::fmt::Display for HookError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HookError::BadLayout => write!(f, "Work area does not fit in the vector page"),
            HookError::NotPrepared => write!(f, "Work area not prepared"),
            HookError::AlreadyHooked => write!(f, "Vector already hooked"),
            HookError::InsufficientWorkArea { found, required } => {
                write!(f, "Work area has {} usable slots, need {}", found, required)
            }
            HookError::WorkAreaExhausted => write!(f, "No free work area slot"),
            HookError::BadVectorOffset(off) => write!(f, "Bad vector offset 0x{:x}", off),
            HookError::HookRejectedByBios(rc) => write!(f, "Hook rejected by BIOS ({})", rc),
            HookError::BiosNotReady => write!(f, "BIOS not present"),
            HookError::Mmu(e) => write!(f, "{}", e),
        }
    }
}

// ============================================================================
// Hook manager
// ============================================================================

pub struct VectorHookManager {
    layout: VectorLayout,
    state: HookState,
}

impl VectorHookManager {
    pub const fn new(layout: VectorLayout) -> Self {
        Self {
            layout,
            state: HookState::Unprepared,
        }
    }

    pub fn layout(&self) -> &VectorLayout {
        &self.layout
    }

    pub fn state(&self) -> HookState {
        self.state
    }

    pub fn is_hooked(&self) -> bool {
        matches!(self.state, HookState::Hooked(_))
    }

    /// Release the slots the boot stage marked as available.
    ///
    /// Slots holding the marker are cleared to free; anything else is left
    /// alone. Returns the number of slots released.
    pub fn prepare_work_area<P: Platform + ?Sized>(
        &mut self,
        cs: CriticalSection<'_>,
        mmu: &Mmu,
        platform: &P,
        min_free: usize,
    ) -> Result<usize, HookError> {
        if self.is_hooked() {
            return Err(HookError::AlreadyHooked);
        }
        self.layout.validate()?;
        let page = self.layout.page;
        if mmu.leaf_entry(page).is_none() {
            return Err(HookError::Mmu(MmuError::Unmapped(page)));
        }

        let layout = self.layout;
        let found = mmu.with_writable(cs, page, platform, |mmu| {
            let mut found = 0;
            for slot in 0..MAX_USABLE_AREA {
                let addr = layout.slot_addr(slot);
                if mmu.read_u32(addr)? == WORK_AREA_MARK {
                    mmu.write_u32(addr, 0)?;
                    found += 1;
                }
            }
            Ok(found)
        })?;

        if found < min_free {
            log::error!(
                "[Falcon] work area at {}: {} usable slots, need {}",
                layout.work_area(),
                found,
                min_free
            );
            return Err(HookError::InsufficientWorkArea {
                found,
                required: min_free,
            });
        }

        self.state = HookState::Prepared;
        Ok(found)
    }

    /// Highest free slot. The resident blob expects last-free-first-used.
    fn find_free_slot(&self, mmu: &Mmu) -> Result<Option<usize>, HookError> {
        for slot in (0..MAX_USABLE_AREA).rev() {
            if mmu.read_u32(self.layout.slot_addr(slot))? == 0 {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Point the vector at `vector_offset` to `target` and register the hook
    /// with the BIOS. Rolls back completely if the BIOS refuses.
    pub fn install_hook<B, P>(
        &mut self,
        cs: CriticalSection<'_>,
        mmu: &Mmu,
        platform: &P,
        channel: &BiosChannel<B>,
        vector_offset: u32,
        target: u32,
    ) -> Result<HookRecord, HookError>
    where
        B: ResidentBios,
        P: Platform + ?Sized,
    {
        match self.state {
            HookState::Unprepared => return Err(HookError::NotPrepared),
            HookState::Hooked(_) => return Err(HookError::AlreadyHooked),
            HookState::Prepared => {}
        }
        if vector_offset % WORD_SIZE != 0 || vector_offset >= VECTOR_COUNT * WORD_SIZE {
            return Err(HookError::BadVectorOffset(vector_offset));
        }

        let vector = self.layout.vector_addr(vector_offset);
        let slot = self
            .find_free_slot(mmu)?
            .ok_or(HookError::WorkAreaExhausted)?;
        let slot_addr = self.layout.slot_addr(slot);
        let insn = falcon_abi::trampoline(vector.as_u32(), slot_addr.as_u32())
            .ok_or(HookError::BadVectorOffset(vector_offset))?;

        let original = mmu.with_writable(cs, vector, platform, |mmu| {
            let original = mmu.read_u32(vector)?;
            mmu.write_u32(slot_addr, target)?;
            mmu.write_u32(vector, insn)?;
            Ok(original)
        })?;
        platform.flush_icache_all();

        let rejected = match channel.call_at_least(
            BiosPresence::Present,
            svc::HOOK_VECTOR,
            [vector_offset, original, slot as u32, target, insn],
        ) {
            Ok(rc) if rc >= 0 => None,
            Ok(rc) => Some(HookError::HookRejectedByBios(rc)),
            Err(_) => Some(HookError::BiosNotReady),
        };

        if let Some(err) = rejected {
            mmu.with_writable(cs, vector, platform, |mmu| {
                mmu.write_u32(vector, original)?;
                mmu.write_u32(slot_addr, 0)
            })?;
            platform.flush_icache_all();
            log::error!("[Falcon] hook of vector +0x{:x} failed: {}", vector_offset, err);
            return Err(err);
        }

        let record = HookRecord {
            vector_offset,
            slot,
            original,
            target,
        };
        self.state = HookState::Hooked(record);
        log::info!(
            "[Falcon] vector +0x{:x} hooked via slot {} -> 0x{:08x}",
            vector_offset,
            slot,
            target
        );
        Ok(record)
    }

    /// Follow the trampoline at `vector_offset` to the target it jumps to.
    /// This is what the CPU does when the exception is taken.
    pub fn resolve(&self, mmu: &Mmu, vector_offset: u32) -> Option<u32> {
        let vector = self.layout.vector_addr(vector_offset);
        let insn = mmu.read_u32(vector).ok()?;
        let slot = falcon_abi::trampoline_slot(vector.as_u32(), insn)?;
        let target = mmu.read_u32(VirtAddr::new(slot)).ok()?;
        (target != 0).then_some(target)
    }
}
