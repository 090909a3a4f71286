//! `bios_svc`: the synchronous call gate into the resident BIOS
//!
//! Every other component talks to the S-BIOS through [`BiosChannel`]. A call
//! is one trap carrying a function id and five argument words and returning
//! one `i32`. The channel never retries, times out or queues; that policy
//! belongs to the callers.
//!
//! The channel also owns [`BiosPresence`], the process-wide answer to "may we
//! trap into the BIOS at all". It only moves forward, except for the fuse:
//! [`BiosChannel::disable`] drops it back to `Absent` for the rest of the boot.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use falcon_abi::{BIOS_MAGIC, SBIOS_MAGIC, WORD_SIZE, header};
use spinning_top::Spinlock;

use crate::addr::PhysAddr;
use crate::irq;
use crate::ram::PhysMemory;

// ============================================================================
// Presence
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BiosPresence {
    /// No valid BIOS, or the fuse has been blown
    Absent = 0,
    /// Both blobs carry valid magic markers
    Present = 1,
    /// The vector hook is installed; `bios_svc` may be used
    Initialized = 2,
}

impl BiosPresence {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BiosPresence::Present,
            2 => BiosPresence::Initialized,
            _ => BiosPresence::Absent,
        }
    }
}

// ============================================================================
// Calls
// ============================================================================

/// One `bios_svc` invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiosCall {
    pub function_id: u32,
    pub args: [u32; 5],
}

impl BiosCall {
    pub const fn new(function_id: u32, args: [u32; 5]) -> Self {
        Self { function_id, args }
    }
}

/// The trap into the resident BIOS.
///
/// Implementations block until the BIOS handler for the function id returns.
pub trait ResidentBios: Sync {
    fn svc(&self, call: &BiosCall) -> i32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiosError {
    /// The BIOS is absent or not hooked yet
    NotReady,
}

impl core::fmt::Display for BiosError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BiosError::NotReady => write!(f, "BIOS not ready"),
        }
    }
}

// ============================================================================
// Blob headers
// ============================================================================

/// Header at the base of each BIOS blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiosHeader {
    pub magic: u32,
    pub entry_offset: u32,
    pub version: u32,
}

impl BiosHeader {
    pub fn read(ram: &PhysMemory, base: PhysAddr) -> Self {
        let word = |idx: u32| ram.read_u32(base.add(idx * WORD_SIZE));
        Self {
            magic: word(header::MAGIC),
            entry_offset: word(header::ENTRY_OFFSET),
            version: word(header::VERSION),
        }
    }

    pub fn write(&self, ram: &mut PhysMemory, base: PhysAddr) {
        ram.write_u32(base.add(header::MAGIC * WORD_SIZE), self.magic);
        ram.write_u32(base.add(header::ENTRY_OFFSET * WORD_SIZE), self.entry_offset);
        ram.write_u32(base.add(header::VERSION * WORD_SIZE), self.version);
    }
}

/// Check both magic markers. Returns the main BIOS header if both match.
pub fn detect(ram: &PhysMemory, storage_base: PhysAddr, main_base: PhysAddr) -> Option<BiosHeader> {
    let sbios = BiosHeader::read(ram, storage_base);
    if sbios.magic != SBIOS_MAGIC {
        log::warn!("[Falcon] S-BIOS not found at {} (magic 0x{:08x})", storage_base, sbios.magic);
        return None;
    }
    let bios = BiosHeader::read(ram, main_base);
    if bios.magic != BIOS_MAGIC {
        log::warn!("[Falcon] BIOS not found at {} (magic 0x{:08x})", main_base, bios.magic);
        return None;
    }
    Some(bios)
}

// ============================================================================
// Channel
// ============================================================================

pub struct BiosChannel<B: ResidentBios> {
    bios: B,
    presence: AtomicU8,
    /// Blown by `disable`; presence can never rise again afterwards
    fused: AtomicBool,
    /// The BIOS handles one trap at a time. Only taken with IRQs off, so
    /// the storage interrupt handler cannot spin on its own CPU's trap.
    trap_lock: Spinlock<()>,
}

impl<B: ResidentBios> BiosChannel<B> {
    pub const fn new(bios: B) -> Self {
        Self {
            bios,
            presence: AtomicU8::new(BiosPresence::Absent as u8),
            fused: AtomicBool::new(false),
            trap_lock: Spinlock::new(()),
        }
    }

    pub fn bios(&self) -> &B {
        &self.bios
    }

    pub fn presence(&self) -> BiosPresence {
        BiosPresence::from_u8(self.presence.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.presence() == BiosPresence::Initialized
    }

    pub fn is_fused(&self) -> bool {
        self.fused.load(Ordering::Acquire)
    }

    /// `Absent -> Present` once the blobs validated
    pub fn mark_present(&self) -> bool {
        if self.is_fused() {
            return false;
        }
        self.advance(BiosPresence::Absent, BiosPresence::Present)
    }

    /// `Present -> Initialized` once the hook is in place
    pub fn mark_initialized(&self) -> bool {
        if self.is_fused() {
            return false;
        }
        self.advance(BiosPresence::Present, BiosPresence::Initialized)
    }

    fn advance(&self, from: BiosPresence, to: BiosPresence) -> bool {
        self.presence
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Blow the fuse: Falcon stays unusable until reboot
    pub fn disable(&self) {
        if !self.fused.swap(true, Ordering::AcqRel) {
            log::error!("[Falcon] BIOS disabled for this boot");
        }
        self.presence
            .store(BiosPresence::Absent as u8, Ordering::Release);
    }

    /// Trap into the BIOS. Requires `Initialized`.
    pub fn call(&self, function_id: u32, args: [u32; 5]) -> Result<i32, BiosError> {
        self.call_at_least(BiosPresence::Initialized, function_id, args)
    }

    /// Trap with a weaker readiness requirement. The hook registration itself
    /// runs while the BIOS is only `Present`.
    pub(crate) fn call_at_least(
        &self,
        required: BiosPresence,
        function_id: u32,
        args: [u32; 5],
    ) -> Result<i32, BiosError> {
        if self.presence() < required {
            return Err(BiosError::NotReady);
        }
        let call = BiosCall::new(function_id, args);
        Ok(irq::with_irqs_disabled(|_cs| {
            let _trap = self.trap_lock.lock();
            self.bios.svc(&call)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBios;
    use falcon_abi::svc;

    #[test]
    fn test_call_requires_initialized() {
        let channel = BiosChannel::new(ScriptedBios::new());
        assert_eq!(channel.call(svc::RESUME, [0; 5]), Err(BiosError::NotReady));
        assert!(channel.mark_present());
        assert_eq!(channel.call(svc::RESUME, [0; 5]), Err(BiosError::NotReady));
        assert!(channel.mark_initialized());
        assert_eq!(channel.call(svc::RESUME, [0; 5]), Ok(0));
        assert_eq!(channel.bios().calls().len(), 1);
    }

    #[test]
    fn test_negative_results_pass_through() {
        let bios = ScriptedBios::new();
        bios.push(svc::SUSPEND, -1);
        let channel = BiosChannel::new(bios);
        channel.mark_present();
        channel.mark_initialized();
        assert_eq!(channel.call(svc::SUSPEND, [1, 2, 3, 4, 5]), Ok(-1));
        let calls = channel.bios().calls();
        assert_eq!(calls[0], BiosCall::new(svc::SUSPEND, [1, 2, 3, 4, 5]));
    }

    #[test]
    fn test_trap_masks_interrupts() {
        use alloc::sync::Arc;
        use std::sync::Mutex;
        use std::thread::JoinHandle;
        use std::time::Duration;

        let irq_ran = Arc::new(AtomicBool::new(false));
        let irq_ran_during_trap = Arc::new(AtomicBool::new(true));
        let irq: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::default();

        let (ran, during, slot) = (irq_ran.clone(), irq_ran_during_trap.clone(), irq.clone());
        let bios = ScriptedBios::with_handler(move |_| {
            let flag = ran.clone();
            let handle = std::thread::spawn(move || {
                critical_section::with(|_| flag.store(true, Ordering::SeqCst));
            });
            std::thread::sleep(Duration::from_millis(50));
            during.store(ran.load(Ordering::SeqCst), Ordering::SeqCst);
            *slot.lock().unwrap() = Some(handle);
            None
        });
        let channel = BiosChannel::new(bios);
        channel.mark_present();
        channel.mark_initialized();

        assert_eq!(channel.call(svc::STORAGE_INTR_STATUS, [0; 5]), Ok(0));
        irq.lock().unwrap().take().unwrap().join().unwrap();
        assert!(!irq_ran_during_trap.load(Ordering::SeqCst));
        assert!(irq_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_fuse_is_permanent() {
        let channel = BiosChannel::new(ScriptedBios::new());
        channel.mark_present();
        channel.mark_initialized();
        channel.disable();
        assert_eq!(channel.presence(), BiosPresence::Absent);
        assert!(!channel.mark_present());
        assert_eq!(channel.call(svc::RESUME, [0; 5]), Err(BiosError::NotReady));
        assert!(channel.bios().calls().is_empty());
    }

    #[test]
    fn test_presence_only_moves_forward() {
        let channel = BiosChannel::new(ScriptedBios::new());
        assert!(!channel.mark_initialized());
        assert!(channel.mark_present());
        assert!(!channel.mark_present());
    }

    #[test]
    fn test_detect_requires_both_markers() {
        let mut ram = PhysMemory::new();
        let sb = PhysAddr::new(0x8FE0_0000);
        let main = PhysAddr::new(0x9000_0000);
        assert!(detect(&ram, sb, main).is_none());

        BiosHeader { magic: SBIOS_MAGIC, entry_offset: 0, version: 1 }.write(&mut ram, sb);
        assert!(detect(&ram, sb, main).is_none());

        BiosHeader { magic: BIOS_MAGIC, entry_offset: 0x40, version: 3 }.write(&mut ram, main);
        let header = detect(&ram, sb, main).unwrap();
        assert_eq!(header.entry_offset, 0x40);
        assert_eq!(header.version, 3);
    }
}
