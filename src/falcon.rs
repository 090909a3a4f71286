//! Falcon bring-up and the suspend/resume cycle
//!
//! [`Falcon`] is the one process-wide state object. Bring-up runs once at
//! boot:
//!
//! 1. validate and reserve the BIOS regions
//! 2. carve out the BIOS work memory (optional)
//! 3. check both blob headers; the BIOS becomes `Present`
//! 4. register the fault callback with the kernel dispatcher
//! 5. with interrupts off, prepare the work area and hook the vector
//! 6. the BIOS becomes `Initialized`; memory banks are registered
//!
//! Any failure disables Falcon for the rest of the boot.

use alloc::string::String;
use alloc::vec::Vec;

use falcon_abi::{suspend_mode, svc};

use crate::addr::PhysAddr;
use crate::bios::{self, BiosChannel, BiosError, ResidentBios};
use crate::block::{DeviceId, StorageDevice, StorageError};
use crate::config::FalconConfig;
use crate::debug_ring::{DebugRing, RingError};
use crate::fault::{CallbackSlot, FalconCallback, FaultClass, FaultDispatcher, FaultInfo, FaultOutcome, Signal};
use crate::irq;
use crate::memmap::{self, BootMemory, MemoryError, MemoryRegion, Range};
use crate::mmu::Mmu;
use crate::platform::Platform;
use crate::process::{self, RevertReport, TaskTable};
use crate::suspend::{FalconMode, SuspendCoordinator, SuspendError, SuspendOps};
use crate::vectors::{HookError, VectorHookManager, VectorLayout};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FalconError {
    /// Switched off in the configuration
    Disabled,
    /// Blob magic missing
    BiosNotFound,
    Memory(MemoryError),
    Hook(HookError),
    /// Fault dispatcher refused the callback
    FaultRegistration(i32),
    Bios(BiosError),
    /// A BIOS call returned a negative result
    Rejected { function_id: u32, rc: i32 },
    Suspend(SuspendError),
    Storage(StorageError),
    Ring(RingError),
}

impl core::fmt::Display for FalconError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FalconError::Disabled => write!(f, "Falcon disabled"),
            FalconError::BiosNotFound => write!(f, "BIOS not found"),
            FalconError::Memory(e) => write!(f, "{}", e),
            FalconError::Hook(e) => write!(f, "{}", e),
            FalconError::FaultRegistration(rc) => {
                write!(f, "Fault handler registration failed ({})", rc)
            }
            FalconError::Bios(e) => write!(f, "{}", e),
            FalconError::Rejected { function_id, rc } => {
                write!(f, "BIOS call 0x{:02x} failed ({})", function_id, rc)
            }
            FalconError::Suspend(e) => write!(f, "{}", e),
            FalconError::Storage(e) => write!(f, "{}", e),
            FalconError::Ring(e) => write!(f, "{}", e),
        }
    }
}

impl From<MemoryError> for FalconError {
    fn from(e: MemoryError) -> Self {
        FalconError::Memory(e)
    }
}

impl From<HookError> for FalconError {
    fn from(e: HookError) -> Self {
        FalconError::Hook(e)
    }
}

impl From<BiosError> for FalconError {
    fn from(e: BiosError) -> Self {
        FalconError::Bios(e)
    }
}

impl From<SuspendError> for FalconError {
    fn from(e: SuspendError) -> Self {
        FalconError::Suspend(e)
    }
}

impl From<StorageError> for FalconError {
    fn from(e: StorageError) -> Self {
        FalconError::Storage(e)
    }
}

impl From<RingError> for FalconError {
    fn from(e: RingError) -> Self {
        FalconError::Ring(e)
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// The platform's low-power entry
pub trait PowerControl {
    /// Enter `mode` and return once the system is awake again
    fn enter_low_power(&mut self, mode: FalconMode) -> Result<(), i32>;
}

/// One static I/O mapping the BIOS must know about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRemap {
    pub phys: PhysAddr,
    pub virt: u32,
    pub size: u32,
}

// ============================================================================
// Falcon
// ============================================================================

pub struct Falcon<B: ResidentBios, P: Platform> {
    config: FalconConfig,
    platform: P,
    channel: BiosChannel<B>,
    mmu: Mmu,
    vectors: VectorHookManager,
    suspend: SuspendCoordinator,
    callbacks: CallbackSlot,
    bios_region: Option<MemoryRegion>,
    work_memory: Option<MemoryRegion>,
}

impl<B: ResidentBios, P: Platform> Falcon<B, P> {
    pub fn new(config: FalconConfig, platform: P, bios: B, mmu: Mmu) -> Self {
        Self {
            vectors: VectorHookManager::new(VectorLayout::from_config(&config)),
            config,
            platform,
            channel: BiosChannel::new(bios),
            mmu,
            suspend: SuspendCoordinator::new(),
            callbacks: CallbackSlot::new(),
            bios_region: None,
            work_memory: None,
        }
    }

    pub fn config(&self) -> &FalconConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn channel(&self) -> &BiosChannel<B> {
        &self.channel
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn vectors(&self) -> &VectorHookManager {
        &self.vectors
    }

    pub fn suspend_coordinator(&self) -> &SuspendCoordinator {
        &self.suspend
    }

    /// Combined S-BIOS + BIOS reservation
    pub fn bios_region(&self) -> Option<MemoryRegion> {
        self.bios_region
    }

    pub fn work_memory(&self) -> Option<MemoryRegion> {
        self.work_memory
    }

    /// True while a Falcon suspend cycle is in progress
    pub fn in_falcon(&self) -> bool {
        self.suspend.is_in_falcon()
    }

    /// True once the hook is installed and the fuse is intact
    pub fn can_use_falcon(&self) -> bool {
        self.channel.is_initialized()
    }

    // ------------------------------------------------------------------------
    // Bring-up
    // ------------------------------------------------------------------------

    pub fn init<M, D>(&mut self, map: &mut M, dispatcher: &mut D) -> Result<(), FalconError>
    where
        M: BootMemory + ?Sized,
        D: FaultDispatcher + ?Sized,
    {
        if !self.config.enabled {
            log::info!("[Falcon] disabled by configuration");
            return Err(FalconError::Disabled);
        }

        let result = self.bring_up(map, dispatcher);
        match &result {
            Ok(()) => log::info!("[Falcon] ready"),
            Err(e) => {
                log::error!("[Falcon] initialization failed: {}", e);
                self.channel.disable();
            }
        }
        result
    }

    fn bring_up<M, D>(&mut self, map: &mut M, dispatcher: &mut D) -> Result<(), FalconError>
    where
        M: BootMemory + ?Sized,
        D: FaultDispatcher + ?Sized,
    {
        let storage = self.config.storage_bios;
        let main = self.config.main_bios;

        self.bios_region = Some(memmap::validate_and_reserve(&storage, &main, map)?);
        self.work_memory = memmap::reserve_work_memory(
            self.config.work_memory_size,
            self.config.work_memory_align,
            map,
        );

        let header = self
            .mmu
            .with_ram(|ram| bios::detect(ram, storage.base, main.base))
            .ok_or(FalconError::BiosNotFound)?;
        if !self.channel.mark_present() {
            return Err(FalconError::Disabled);
        }
        log::info!(
            "[Falcon] BIOS version {} found at {}",
            header.version,
            main.base
        );

        let vector_offset = self.config.hook_vector_offset;
        let class = FaultClass::from_vector_offset(vector_offset)
            .ok_or(HookError::BadVectorOffset(vector_offset))?;
        dispatcher
            .register_fault_handler(class, Signal::Ill, "falcon callback")
            .map_err(FalconError::FaultRegistration)?;

        let target = main.base.add(header.entry_offset).as_u32();
        let min_free = self.config.min_free_slots;
        let (vectors, mmu, platform, channel) =
            (&mut self.vectors, &self.mmu, &self.platform, &self.channel);
        irq::with_irqs_disabled(|cs| {
            vectors.prepare_work_area(cs, mmu, platform, min_free)?;
            vectors.install_hook(cs, mmu, platform, channel, vector_offset, target)
        })?;

        if !self.channel.mark_initialized() {
            return Err(FalconError::Disabled);
        }

        self.register_memory_banks(&map.memory_banks())
    }

    /// Fail a registration: a BIOS that rejected part of its view of the
    /// machine cannot be trusted for suspend.
    fn check_registration(&self, function_id: u32, rc: i32) -> Result<(), FalconError> {
        if rc < 0 {
            log::error!("[Falcon] BIOS rejected registration 0x{:02x} ({})", function_id, rc);
            self.channel.disable();
            return Err(FalconError::Rejected { function_id, rc });
        }
        Ok(())
    }

    /// Tell the BIOS about every RAM bank
    pub fn register_memory_banks(&self, banks: &[Range]) -> Result<(), FalconError> {
        for (index, bank) in banks.iter().enumerate() {
            let (Ok(base), Ok(size)) = (u32::try_from(bank.base), u32::try_from(bank.size)) else {
                log::warn!("[Falcon] memory bank at 0x{:x} not addressable, skipped", bank.base);
                continue;
            };
            let rc = self
                .channel
                .call(svc::REGISTER_MEMORY_BANK, [index as u32, base, size, 0, 0])?;
            self.check_registration(svc::REGISTER_MEMORY_BANK, rc)?;
        }
        Ok(())
    }

    /// Tell the BIOS about static I/O mappings
    pub fn register_io_remap(&self, entries: &[IoRemap]) -> Result<(), FalconError> {
        for (index, entry) in entries.iter().enumerate() {
            let rc = self.channel.call(
                svc::REGISTER_IOREMAP,
                [index as u32, entry.phys.as_u32(), entry.virt, entry.size, 0],
            )?;
            self.check_registration(svc::REGISTER_IOREMAP, rc)?;
        }
        Ok(())
    }

    /// Tell the BIOS where the page database (`mem_map`) lives
    pub fn register_page_database(
        &self,
        base: PhysAddr,
        entries: u32,
        entry_size: u32,
    ) -> Result<(), FalconError> {
        let rc = self.channel.call(
            svc::REGISTER_PAGE_DATABASE,
            [base.as_u32(), entries, entry_size, 0, 0],
        )?;
        self.check_registration(svc::REGISTER_PAGE_DATABASE, rc)
    }

    // ------------------------------------------------------------------------
    // Runtime
    // ------------------------------------------------------------------------

    /// A storage device driven through the BIOS
    pub fn storage_device(&self, id: DeviceId) -> StorageDevice<'_, B, P> {
        StorageDevice::new(id, &self.channel, &self.platform, &self.config)
    }

    /// Arm the callback the next Falcon fault runs
    pub fn arm_callback(&self, callback: FalconCallback) -> Result<(), FalconCallback> {
        self.callbacks.arm(callback)
    }

    /// Entry from the kernel fault dispatcher
    pub fn handle_fault(&self, info: &FaultInfo) -> FaultOutcome {
        if !self.can_use_falcon()
            || FaultClass::from_vector_offset(self.config.hook_vector_offset) != Some(info.class)
        {
            return FaultOutcome::NotOurs;
        }
        self.callbacks.dispatch(&self.platform)
    }

    /// One full Falcon suspend/resume cycle.
    ///
    /// The suspend operations are substituted, the BIOS saves state and the
    /// platform enters low power. After wakeup the BIOS resumes and every
    /// page-table owner is reported back before the substitution is undone.
    pub fn suspend_cycle<W: PowerControl + ?Sized>(
        &self,
        mode: FalconMode,
        power: &mut W,
        tasks: &TaskTable,
    ) -> Result<RevertReport, FalconError> {
        if !self.can_use_falcon() {
            return Err(SuspendError::NotReady.into());
        }
        let mode_word = match mode {
            FalconMode::Standby => suspend_mode::STANDBY,
            FalconMode::Mem => suspend_mode::MEM,
        };
        let (work_base, work_size) = self
            .work_memory
            .map_or((0, 0), |r| (r.base.as_u32(), r.size));

        let guard = self.suspend.enter(SuspendOps::Falcon(mode), |_| {
            let rc = self
                .channel
                .call(svc::SUSPEND, [mode_word, work_base, work_size, 0, 0])
                .map_err(|_| SuspendError::NotReady)?;
            if rc < 0 {
                return Err(SuspendError::Trigger(rc));
            }
            power.enter_low_power(mode).map_err(SuspendError::Trigger)
        })?;

        let rc = self.channel.call(svc::RESUME, [mode_word, 0, 0, 0, 0])?;
        if rc < 0 {
            log::error!("[Falcon] resume failed ({})", rc);
            self.channel.disable();
            drop(guard);
            return Err(FalconError::Rejected {
                function_id: svc::RESUME,
                rc,
            });
        }

        let report = process::revert_all(&self.channel, tasks);
        if !report.is_clean() {
            log::warn!(
                "[Falcon] {} of {} page-table owners not reverted",
                report.failed.len(),
                report.attempted
            );
        }
        drop(guard);
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Debug ring
    // ------------------------------------------------------------------------

    pub fn debug_ring(&self) -> Result<DebugRing, FalconError> {
        Ok(DebugRing::new(
            self.config.storage_bios.end(),
            self.config.debug_chunk_count,
        )?)
    }

    /// False as well when the configured ring does not fit
    pub fn debug_enabled(&self) -> bool {
        self.debug_ring()
            .map(|ring| self.mmu.with_ram(|ram| ring.is_enabled(ram)))
            .unwrap_or(false)
    }

    /// Switch S-BIOS debug logging on or off
    pub fn set_debug_enabled(&self, enabled: bool) -> Result<(), FalconError> {
        let ring = self.debug_ring()?;
        let rc = self.channel.call(svc::DEBUG_CONTROL, [enabled as u32, 0, 0, 0, 0])?;
        if rc < 0 {
            return Err(FalconError::Rejected {
                function_id: svc::DEBUG_CONTROL,
                rc,
            });
        }
        self.mmu.with_ram(|ram| ring.set_enabled(ram, enabled));
        Ok(())
    }

    /// Take every pending debug line
    pub fn drain_debug(&self) -> Result<Vec<String>, FalconError> {
        if self.bios_region.is_none() {
            return Err(BiosError::NotReady.into());
        }
        let ring = self.debug_ring()?;
        Ok(self.mmu.with_ram(|ram| ring.drain(ram))?)
    }
}
