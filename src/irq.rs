//! Interrupt masking
//!
//! The vector page is shared hardware state: patching it must happen with
//! interrupts off on the only running CPU. The critical section token handed
//! to the closure is what `Mmu::make_writable` demands as proof.
//!
//! Every BIOS trap also runs masked, since the storage interrupt handler
//! traps too.

use critical_section::CriticalSection;

/// Run a closure with IRQs disabled.
#[inline]
pub fn with_irqs_disabled<T, F: FnOnce(CriticalSection<'_>) -> T>(f: F) -> T {
    critical_section::with(f)
}
