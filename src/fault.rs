//! Falcon fault callback
//!
//! The BIOS provokes a fault on the hooked vector when it needs the kernel
//! to do something on its behalf. The kernel's fault dispatcher routes that
//! fault class to [`crate::Falcon::handle_fault`], which runs whatever
//! callback is armed and acknowledges the fault.

use alloc::sync::Arc;

use spinning_top::Spinlock;

use crate::platform::Platform;
use crate::sync::WaitQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    Undefined,
    PrefetchAbort,
    DataAbort,
}

impl FaultClass {
    /// Fault class taken through the vector at `vector_offset`
    pub const fn from_vector_offset(vector_offset: u32) -> Option<Self> {
        match vector_offset {
            0x04 => Some(FaultClass::Undefined),
            0x0C => Some(FaultClass::PrefetchAbort),
            0x10 => Some(FaultClass::DataAbort),
            _ => None,
        }
    }
}

/// Signal the dispatcher delivers when no handler claims the fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ill,
    Segv,
    Bus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    pub class: FaultClass,
    pub pc: u32,
    /// Fault status register value
    pub status: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Handled,
    /// Not a Falcon fault; the dispatcher applies its default action
    NotOurs,
}

/// The kernel's generic fault dispatch
pub trait FaultDispatcher {
    /// Route faults of `class` to Falcon. Returns the kernel's error code
    /// on refusal.
    fn register_fault_handler(
        &mut self,
        class: FaultClass,
        signal_on_failure: Signal,
        description: &'static str,
    ) -> Result<(), i32>;
}

// ============================================================================
// Callbacks
// ============================================================================

/// Work the BIOS can ask for through a fault
#[derive(Clone)]
pub enum FalconCallback {
    /// Resynchronize instruction and data caches
    SyncCaches,
    /// Wake a sleeping storage waiter
    Wake(Arc<WaitQueue>),
}

impl FalconCallback {
    pub fn run<P: Platform + ?Sized>(&self, platform: &P) {
        match self {
            FalconCallback::SyncCaches => platform.flush_icache_all(),
            FalconCallback::Wake(queue) => queue.wake(),
        }
    }
}

impl core::fmt::Debug for FalconCallback {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FalconCallback::SyncCaches => write!(f, "SyncCaches"),
            FalconCallback::Wake(_) => write!(f, "Wake"),
        }
    }
}

/// At most one armed callback
pub struct CallbackSlot {
    armed: Spinlock<Option<FalconCallback>>,
}

impl CallbackSlot {
    pub const fn new() -> Self {
        Self {
            armed: Spinlock::new(None),
        }
    }

    /// Arm `callback`. Hands it back if another one is already armed.
    pub fn arm(&self, callback: FalconCallback) -> Result<(), FalconCallback> {
        let mut armed = self.armed.lock();
        if armed.is_some() {
            return Err(callback);
        }
        *armed = Some(callback);
        Ok(())
    }

    pub fn disarm(&self) -> Option<FalconCallback> {
        self.armed.lock().take()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }

    /// Run and clear the armed callback, then acknowledge the fault
    pub fn dispatch<P: Platform + ?Sized>(&self, platform: &P) -> FaultOutcome {
        let Some(callback) = self.disarm() else {
            return FaultOutcome::NotOurs;
        };
        callback.run(platform);
        platform.ack_fault();
        FaultOutcome::Handled
    }
}

impl Default for CallbackSlot {
    fn default() -> Self {
        Self::new()
    }
}
