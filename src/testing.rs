//! Test doubles: a host platform, a scriptable BIOS and machine fixtures

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use falcon_abi::{BIOS_MAGIC, MAX_USABLE_AREA, SBIOS_MAGIC, WORK_AREA_MARK, rc};

use crate::addr::{PhysAddr, VirtAddr};
use crate::bios::{BiosCall, BiosChannel, BiosHeader, ResidentBios};
use crate::config::FalconConfig;
use crate::fault::{FaultClass, FaultDispatcher, Signal};
use crate::memmap::MemoryMap;
use crate::mmu::{Mmu, PageTable, pte};
use crate::platform::Platform;
use crate::ram::PhysMemory;
use crate::vectors::{VECTOR_COUNT, VectorLayout};

// ============================================================================
// Platform
// ============================================================================

pub struct TestPlatform {
    start: Instant,
    yields: AtomicUsize,
    icache_flushes: AtomicUsize,
    tlb_flushes: AtomicUsize,
    fault_acks: AtomicUsize,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            yields: AtomicUsize::new(0),
            icache_flushes: AtomicUsize::new(0),
            tlb_flushes: AtomicUsize::new(0),
            fault_acks: AtomicUsize::new(0),
        }
    }

    pub fn yields(&self) -> usize {
        self.yields.load(Ordering::SeqCst)
    }

    pub fn icache_flushes(&self) -> usize {
        self.icache_flushes.load(Ordering::SeqCst)
    }

    pub fn tlb_flushes(&self) -> usize {
        self.tlb_flushes.load(Ordering::SeqCst)
    }

    pub fn fault_acks(&self) -> usize {
        self.fault_acks.load(Ordering::SeqCst)
    }
}

impl Platform for TestPlatform {
    fn uptime_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::SeqCst);
        std::thread::yield_now();
    }

    fn flush_icache_all(&self) {
        self.icache_flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn flush_tlb_page(&self, _va: VirtAddr) {
        self.tlb_flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn ack_fault(&self) {
        self.fault_acks.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Scripted BIOS
// ============================================================================

type Handler = Box<dyn Fn(&BiosCall) -> Option<i32> + Send + Sync>;

/// A BIOS whose answers are queued per function id.
///
/// Each call pops the next scripted result for its id; once the queue is
/// empty the per-id default (or `RC_OK`) is returned. A handler, when set,
/// is consulted first.
pub struct ScriptedBios {
    log: Mutex<Vec<BiosCall>>,
    scripts: Mutex<BTreeMap<u32, VecDeque<i32>>>,
    defaults: Mutex<BTreeMap<u32, i32>>,
    handler: Option<Handler>,
}

impl ScriptedBios {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            scripts: Mutex::new(BTreeMap::new()),
            defaults: Mutex::new(BTreeMap::new()),
            handler: None,
        }
    }

    pub fn with_handler(handler: impl Fn(&BiosCall) -> Option<i32> + Send + Sync + 'static) -> Self {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::new()
        }
    }

    pub fn push(&self, function_id: u32, result: i32) {
        self.push_n(function_id, result, 1);
    }

    pub fn push_n(&self, function_id: u32, result: i32, count: usize) {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.entry(function_id).or_default();
        queue.extend(core::iter::repeat_n(result, count));
    }

    pub fn set_default(&self, function_id: u32, result: i32) {
        self.defaults.lock().unwrap().insert(function_id, result);
    }

    pub fn calls(&self) -> Vec<BiosCall> {
        self.log.lock().unwrap().clone()
    }

    pub fn calls_for(&self, function_id: u32) -> Vec<BiosCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.function_id == function_id)
            .collect()
    }

    pub fn count(&self, function_id: u32) -> usize {
        self.calls_for(function_id).len()
    }
}

impl ResidentBios for ScriptedBios {
    fn svc(&self, call: &BiosCall) -> i32 {
        self.log.lock().unwrap().push(*call);
        if let Some(rc) = self.handler.as_ref().and_then(|h| h(call)) {
            return rc;
        }
        if let Some(rc) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&call.function_id)
            .and_then(|q| q.pop_front())
        {
            return rc;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(&call.function_id)
            .copied()
            .unwrap_or(rc::RC_OK)
    }
}

/// Channel with the BIOS validated but not hooked yet
pub fn present_channel(bios: ScriptedBios) -> BiosChannel<ScriptedBios> {
    let channel = BiosChannel::new(bios);
    assert!(channel.mark_present());
    channel
}

/// Channel ready for `bios_svc`
pub fn ready_channel(bios: ScriptedBios) -> BiosChannel<ScriptedBios> {
    let channel = present_channel(bios);
    assert!(channel.mark_initialized());
    channel
}

// ============================================================================
// Machine fixture
// ============================================================================

/// Physical page backing the vector page
pub const VECTOR_PHYS: u32 = 0x8000_0000;

/// Entry point offset written into the main BIOS header
pub const BIOS_ENTRY_OFFSET: u32 = 0x40;

/// Original vector table contents: `ldr pc, [pc, #0x18]` style branches
pub fn original_vector(index: u32) -> u32 {
    0xE59F_F018 + index
}

/// Slot contents the boot stage left in non-marked slots
pub fn occupied_slot(slot: usize) -> u32 {
    0xC0DE_0000 | slot as u32
}

/// Memory and page table of a booted machine: both BIOS headers in place,
/// the vector page mapped read-only, and the work-area slots in `marked`
/// carrying the availability marker.
pub fn machine_mmu(config: &FalconConfig, marked: &[usize]) -> Mmu {
    let layout = VectorLayout::from_config(config);
    let phys = |va: VirtAddr| PhysAddr::new(VECTOR_PHYS + (va.as_u32() - layout.page.as_u32()));

    let mut table = PageTable::new();
    table
        .map_page(layout.page, PhysAddr::new(VECTOR_PHYS), pte::KERNEL_RO)
        .unwrap();

    let mut ram = PhysMemory::new();
    BiosHeader {
        magic: SBIOS_MAGIC,
        entry_offset: 0,
        version: 1,
    }
    .write(&mut ram, config.storage_bios.base);
    BiosHeader {
        magic: BIOS_MAGIC,
        entry_offset: BIOS_ENTRY_OFFSET,
        version: 1,
    }
    .write(&mut ram, config.main_bios.base);

    for slot in 0..MAX_USABLE_AREA {
        let value = if marked.contains(&slot) {
            WORK_AREA_MARK
        } else {
            occupied_slot(slot)
        };
        ram.write_u32(phys(layout.slot_addr(slot)), value);
    }
    for index in 0..VECTOR_COUNT {
        ram.write_u32(phys(layout.vector_addr(index * 4)), original_vector(index));
    }

    Mmu::new(table, ram)
}

// ============================================================================
// Collaborators
// ============================================================================

/// Fault dispatcher that records registrations
#[derive(Default)]
pub struct RecordingDispatcher {
    pub registered: Vec<(FaultClass, Signal, &'static str)>,
    /// Refuse registrations with this code
    pub refuse: Option<i32>,
}

impl FaultDispatcher for RecordingDispatcher {
    fn register_fault_handler(
        &mut self,
        class: FaultClass,
        signal_on_failure: Signal,
        description: &'static str,
    ) -> Result<(), i32> {
        if let Some(code) = self.refuse {
            return Err(code);
        }
        self.registered.push((class, signal_on_failure, description));
        Ok(())
    }
}

/// RAM from 0x8000_0000 to 0xA000_0000
pub fn boot_memory() -> MemoryMap {
    let mut map = MemoryMap::new();
    map.add_memory(0x8000_0000, 0x2000_0000);
    map
}
