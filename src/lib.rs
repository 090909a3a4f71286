//! Falcon fast-hibernate/resume support
//!
//! Kernel side of the Falcon subsystem: validates and reserves the resident
//! BIOS blobs, hooks an exception vector into them, and drives storage I/O
//! and the suspend/resume cycle through the BIOS call gate.
//!
//! The hardware (memory, page tables, vector page, the BIOS trap) and the
//! kernel collaborators are modelled as types and traits, so the whole
//! subsystem can run against a simulated machine.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod addr;
pub mod bios;
pub mod block;
pub mod config;
pub mod control;
pub mod debug_ring;
pub mod falcon;
pub mod fault;
pub mod irq;
pub mod memmap;
pub mod mmu;
pub mod platform;
pub mod process;
pub mod ram;
pub mod suspend;
pub mod sync;
pub mod vectors;

#[cfg(test)]
mod testing;

pub use addr::{PhysAddr, VirtAddr};
pub use bios::{BiosCall, BiosChannel, BiosError, BiosPresence, ResidentBios};
pub use block::{DeviceId, StorageDevice, StorageError, StorageRequest, WaitMode};
pub use config::FalconConfig;
pub use falcon::{Falcon, FalconError, PowerControl};
pub use fault::{FalconCallback, FaultDispatcher, FaultOutcome};
pub use memmap::{BootMemory, MemoryMap, MemoryRegion};
pub use mmu::Mmu;
pub use platform::Platform;
pub use process::{RevertReport, TaskTable};
pub use suspend::{FalconMode, SuspendCoordinator};
