//! Blocking primitives built on the platform scheduler
//!
//! Both primitives block by yielding until a condition holds or a deadline
//! passes; nothing here busy-spins without giving up the CPU.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::platform::{Deadline, Platform};

// ============================================================================
// Binary semaphore
// ============================================================================

/// Binary semaphore guarding one outstanding request per device
pub struct BinarySemaphore {
    held: AtomicBool,
}

impl BinarySemaphore {
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire, yielding between attempts. Returns false on timeout.
    pub fn acquire_timeout<P: Platform + ?Sized>(&self, platform: &P, timeout_us: u64) -> bool {
        let deadline = Deadline::after(platform, timeout_us);
        loop {
            if self.try_acquire() {
                return true;
            }
            if deadline.expired(platform) {
                return false;
            }
            platform.yield_now();
        }
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl Default for BinarySemaphore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Wait queue
// ============================================================================

/// Single-waiter wait queue woken from interrupt context
pub struct WaitQueue {
    pending: AtomicBool,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// Wake the waiter. Safe to call from an interrupt handler.
    pub fn wake(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Drop a wakeup that arrived before anyone waited
    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// Sleep until woken or until `timeout_us` elapses.
    /// Returns true if woken; the wakeup is consumed.
    pub fn wait_timeout<P: Platform + ?Sized>(&self, platform: &P, timeout_us: u64) -> bool {
        let deadline = Deadline::after(platform, timeout_us);
        loop {
            if self.pending.swap(false, Ordering::AcqRel) {
                return true;
            }
            if deadline.expired(platform) {
                return false;
            }
            platform.yield_now();
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
