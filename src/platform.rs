//! Platform primitives the Falcon core relies on
//!
//! Timekeeping, scheduling, cache maintenance and fault acknowledgement are
//! owned by the surrounding kernel. The core only sees them through this
//! trait so the whole subsystem can run against a simulated machine.

use crate::addr::VirtAddr;

pub trait Platform: Sync {
    /// Monotonic time since boot in microseconds
    fn uptime_us(&self) -> u64;

    /// Voluntarily give up the CPU. Must not spin.
    fn yield_now(&self);

    /// Invalidate the whole instruction cache
    fn flush_icache_all(&self);

    /// Invalidate the TLB entry for one page
    fn flush_tlb_page(&self, va: VirtAddr);

    /// Acknowledge and clear the pending fault status (cp15 on real hardware)
    fn ack_fault(&self);
}

/// Absolute deadline on the platform clock
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at_us: u64,
}

impl Deadline {
    pub fn after<P: Platform + ?Sized>(platform: &P, timeout_us: u64) -> Self {
        Self {
            at_us: platform.uptime_us().saturating_add(timeout_us),
        }
    }

    pub fn expired<P: Platform + ?Sized>(&self, platform: &P) -> bool {
        platform.uptime_us() >= self.at_us
    }
}
