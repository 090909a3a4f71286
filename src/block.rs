//! Storage requests through the resident BIOS
//!
//! Block and NAND devices are driven by the S-BIOS, not by a kernel driver.
//! A request is one `STORAGE_REQUEST` trap that returns as soon as the BIOS
//! has accepted it; completion is observed separately, either by polling or
//! by sleeping until the device interrupt fires.
//!
//! Each [`StorageDevice`] allows at most one outstanding request. The
//! `falcon_sem` semaphore is taken on submit and released only once the
//! completion (or failure) has been observed, and the request's buffer stays
//! borrowed by the [`InFlight`] guard for exactly that long.

use alloc::sync::Arc;

use falcon_abi::{rc, storage, svc};
use spinning_top::Spinlock;

use crate::addr::PhysAddr;
use crate::bios::{BiosChannel, BiosError, ResidentBios};
use crate::config::FalconConfig;
use crate::platform::{Deadline, Platform};
use crate::sync::{BinarySemaphore, WaitQueue};

// ============================================================================
// Storage Error
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// The BIOS is busy; try again later
    Busy,
    /// Semaphore or completion wait timed out
    Timeout,
    /// Negative result code from the BIOS
    Io(i32),
    /// Falcon is not initialized
    NotReady,
    /// Request cannot be expressed in the call arguments
    InvalidRequest,
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StorageError::Busy => write!(f, "Device busy"),
            StorageError::Timeout => write!(f, "Timed out"),
            StorageError::Io(rc) => write!(f, "I/O error ({})", rc),
            StorageError::NotReady => write!(f, "BIOS not ready"),
            StorageError::InvalidRequest => write!(f, "Invalid request"),
        }
    }
}

impl From<BiosError> for StorageError {
    fn from(_: BiosError) -> Self {
        StorageError::NotReady
    }
}

/// Map a negative result code. `RC_BUSY` stays distinguishable.
fn rc_error(rc: i32) -> StorageError {
    if rc == rc::RC_BUSY {
        StorageError::Busy
    } else {
        StorageError::Io(rc)
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Block,
    Nand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub kind: DeviceKind,
    pub unit: u8,
}

impl DeviceId {
    pub const fn block(unit: u8) -> Self {
        Self { kind: DeviceKind::Block, unit }
    }

    pub const fn nand(unit: u8) -> Self {
        Self { kind: DeviceKind::Nand, unit }
    }

    /// Device descriptor as passed to the BIOS
    pub const fn word(&self) -> u32 {
        let kind = match self.kind {
            DeviceKind::Block => storage::DEVICE_BLOCK,
            DeviceKind::Nand => storage::DEVICE_NAND,
        };
        storage::device_word(kind, self.unit)
    }
}

impl core::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.kind {
            DeviceKind::Block => write!(f, "blk{}", self.unit),
            DeviceKind::Nand => write!(f, "nand{}", self.unit),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Read,
    Write,
    Erase,
    /// Pass-through call into the storage BIOS
    SbiosCall,
}

impl StorageOp {
    pub const fn code(self) -> u32 {
        match self {
            StorageOp::Read => storage::OP_READ,
            StorageOp::Write => storage::OP_WRITE,
            StorageOp::Erase => storage::OP_ERASE,
            StorageOp::SbiosCall => storage::OP_SBIOS_CALL,
        }
    }
}

/// Transfer buffer: what the BIOS sees (bus address) and what the kernel
/// owns (the slice). The slice is untouchable until completion.
#[derive(Debug)]
pub struct StorageBuffer<'buf> {
    bus_addr: PhysAddr,
    data: &'buf mut [u8],
}

impl<'buf> StorageBuffer<'buf> {
    pub fn new(bus_addr: PhysAddr, data: &'buf mut [u8]) -> Self {
        Self { bus_addr, data }
    }

    pub fn bus_addr(&self) -> PhysAddr {
        self.bus_addr
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug)]
pub struct StorageRequest<'buf> {
    pub op: StorageOp,
    /// Sector for block devices, byte address for NAND
    pub sector_or_addr: u64,
    pub buffer: Option<StorageBuffer<'buf>>,
    /// Bytes to transfer, or units to erase
    pub length: u32,
    /// Negative for the whole device
    pub part_num: i32,
}

impl<'buf> StorageRequest<'buf> {
    pub fn read(part_num: i32, sector_or_addr: u64, buffer: StorageBuffer<'buf>) -> Self {
        Self::transfer(StorageOp::Read, part_num, sector_or_addr, buffer)
    }

    pub fn write(part_num: i32, sector_or_addr: u64, buffer: StorageBuffer<'buf>) -> Self {
        Self::transfer(StorageOp::Write, part_num, sector_or_addr, buffer)
    }

    fn transfer(op: StorageOp, part_num: i32, sector_or_addr: u64, buffer: StorageBuffer<'buf>) -> Self {
        let length = u32::try_from(buffer.len()).unwrap_or(u32::MAX);
        Self {
            op,
            sector_or_addr,
            buffer: Some(buffer),
            length,
            part_num,
        }
    }

    /// Erase the half-open range `from..to`
    pub fn erase(part_num: i32, from: u64, to: u64) -> Result<Self, StorageError> {
        let length = to
            .checked_sub(from)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(StorageError::InvalidRequest)?;
        Ok(Self {
            op: StorageOp::Erase,
            sector_or_addr: from,
            buffer: None,
            length,
            part_num,
        })
    }

    /// Negative selects the whole device; partitions past
    /// [`storage::MAX_PARTITION`] cannot be encoded.
    fn part_byte(&self) -> Result<u8, StorageError> {
        if self.part_num < 0 {
            return Ok(storage::PART_WHOLE_DEVICE as u8);
        }
        u8::try_from(self.part_num)
            .ok()
            .filter(|&part| u32::from(part) <= storage::MAX_PARTITION)
            .ok_or(StorageError::InvalidRequest)
    }

    /// The five `STORAGE_REQUEST` arguments:
    /// `[device/part/op, addr_lo, addr_hi, bus_addr, length]`
    pub fn args(&self, device: DeviceId) -> Result<[u32; 5], StorageError> {
        let bus_addr = match (self.op, &self.buffer) {
            (StorageOp::Read | StorageOp::Write, Some(buf)) => {
                if buf.is_empty() || buf.len() != self.length as usize {
                    return Err(StorageError::InvalidRequest);
                }
                buf.bus_addr().as_u32()
            }
            (StorageOp::Read | StorageOp::Write, None) => return Err(StorageError::InvalidRequest),
            (_, Some(buf)) => buf.bus_addr().as_u32(),
            (_, None) => 0,
        };
        Ok([
            storage::request_word(device.word(), self.part_byte()?, self.op.code()),
            self.sector_or_addr as u32,
            (self.sector_or_addr >> 32) as u32,
            bus_addr,
            self.length,
        ])
    }
}

// ============================================================================
// Device
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageState {
    Idle,
    Submitted,
    /// Last request finished; the next submit starts over
    Completed,
    /// Last request failed or timed out
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Polling,
    Irq,
}

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    sem_us: u64,
    poll_us: u64,
    irq_us: u64,
    irq_retries: u32,
}

/// One storage device instance as seen through the BIOS
pub struct StorageDevice<'f, B: ResidentBios, P: Platform + ?Sized> {
    id: DeviceId,
    channel: &'f BiosChannel<B>,
    platform: &'f P,
    falcon_sem: BinarySemaphore,
    wait_queue: Arc<WaitQueue>,
    state: Spinlock<StorageState>,
    timeouts: Timeouts,
}

impl<'f, B: ResidentBios, P: Platform + ?Sized> StorageDevice<'f, B, P> {
    pub fn new(id: DeviceId, channel: &'f BiosChannel<B>, platform: &'f P, config: &FalconConfig) -> Self {
        Self {
            id,
            channel,
            platform,
            falcon_sem: BinarySemaphore::new(),
            wait_queue: Arc::new(WaitQueue::new()),
            state: Spinlock::new(StorageState::Idle),
            timeouts: Timeouts {
                sem_us: config.sem_timeout_us,
                poll_us: config.poll_wait_timeout_us,
                irq_us: config.irq_wait_timeout_us,
                irq_retries: config.irq_wait_retries,
            },
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn state(&self) -> StorageState {
        *self.state.lock()
    }

    /// Queue the completion interrupt wakes
    pub fn wait_queue(&self) -> Arc<WaitQueue> {
        self.wait_queue.clone()
    }

    fn call(&self, function_id: u32, args: [u32; 5]) -> Result<i32, StorageError> {
        Ok(self.channel.call(function_id, args)?)
    }

    fn device_args(&self) -> [u32; 5] {
        [self.id.word(), 0, 0, 0, 0]
    }

    /// Initialize the device inside the BIOS
    pub fn init(&self) -> Result<(), StorageError> {
        let rc = self.call(svc::STORAGE_INIT, self.device_args())?;
        if rc < 0 {
            log::error!("[Falcon] {}: storage init failed ({})", self.id, rc);
            return Err(rc_error(rc));
        }
        log::info!("[Falcon] {}: storage initialized", self.id);
        Ok(())
    }

    /// Hand a request to the BIOS.
    ///
    /// Blocks (yielding) until the device is free, bounded by the semaphore
    /// timeout. On success the returned guard owns the buffer until the
    /// completion has been observed.
    pub fn submit<'buf>(
        &'f self,
        request: StorageRequest<'buf>,
    ) -> Result<InFlight<'f, 'buf, B, P>, StorageError> {
        let args = request.args(self.id)?;

        if !self.falcon_sem.acquire_timeout(self.platform, self.timeouts.sem_us) {
            log::warn!("[Falcon] {}: device stayed busy for {}us", self.id, self.timeouts.sem_us);
            return Err(StorageError::Timeout);
        }
        *self.state.lock() = StorageState::Submitted;
        self.wait_queue.clear();

        let result = match self.call(svc::STORAGE_REQUEST, args) {
            Ok(rc) if rc >= 0 => Ok(()),
            Ok(rc) => Err(rc_error(rc)),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.finish(&Err(e));
            return Err(e);
        }

        Ok(InFlight {
            device: self,
            _buffer: request.buffer,
            observed: false,
        })
    }

    /// Submit and wait
    pub fn transfer(&'f self, request: StorageRequest<'_>, mode: WaitMode) -> Result<(), StorageError> {
        self.submit(request)?.wait_completion(mode)
    }

    /// Erase `from..to` on a partition (negative for the whole device)
    pub fn erase(&'f self, part_num: i32, from: u64, to: u64, mode: WaitMode) -> Result<(), StorageError> {
        self.transfer(StorageRequest::erase(part_num, from, to)?, mode)
    }

    /// Device interrupt handler.
    ///
    /// Reads the BIOS interrupt status and wakes the waiter on completion or
    /// error. Returns whether the waiter was woken.
    pub fn handle_irq(&self) -> bool {
        let Ok(status) = self.call(svc::STORAGE_INTR_STATUS, self.device_args()) else {
            return false;
        };
        if status == rc::RC_DONE || status < 0 {
            self.wait_queue.wake();
            return true;
        }
        false
    }

    fn wait_polling(&self) -> Result<(), StorageError> {
        let deadline = Deadline::after(self.platform, self.timeouts.poll_us);
        loop {
            match self.call(svc::STORAGE_WAIT_POLLING, self.device_args())? {
                rc::RC_DONE => return Ok(()),
                rc::RC_OK => {
                    if deadline.expired(self.platform) {
                        return Err(StorageError::Timeout);
                    }
                    self.platform.yield_now();
                }
                rc => return Err(rc_error(rc)),
            }
        }
    }

    fn wait_irq(&self) -> Result<(), StorageError> {
        let mut timeouts = 0;
        loop {
            match self.call(svc::STORAGE_WAIT_IRQ, self.device_args())? {
                rc::RC_DONE => return Ok(()),
                rc::RC_OK => {
                    if self.wait_queue.wait_timeout(self.platform, self.timeouts.irq_us) {
                        continue;
                    }
                    timeouts += 1;
                    log::warn!(
                        "[Falcon] {}: no completion interrupt within {}us ({}/{})",
                        self.id,
                        self.timeouts.irq_us,
                        timeouts,
                        self.timeouts.irq_retries
                    );
                    if timeouts > self.timeouts.irq_retries {
                        return Err(StorageError::Timeout);
                    }
                }
                rc => return Err(rc_error(rc)),
            }
        }
    }

    /// Record the outcome and free the device
    fn finish(&self, result: &Result<(), StorageError>) {
        *self.state.lock() = match result {
            Ok(()) => StorageState::Completed,
            Err(e) => {
                log::error!("[Falcon] {}: request failed: {}", self.id, e);
                StorageState::Failed
            }
        };
        self.falcon_sem.release();
    }
}

// ============================================================================
// In-flight request
// ============================================================================

/// An accepted request whose completion has not been observed yet.
///
/// Dropping it without waiting falls back to a polling wait: the buffer
/// borrow must not end while the BIOS may still write into it.
#[must_use = "the request completes only when waited on"]
pub struct InFlight<'f, 'buf, B: ResidentBios, P: Platform + ?Sized> {
    device: &'f StorageDevice<'f, B, P>,
    _buffer: Option<StorageBuffer<'buf>>,
    observed: bool,
}

impl<B: ResidentBios, P: Platform + ?Sized> InFlight<'_, '_, B, P> {
    pub fn wait_completion(mut self, mode: WaitMode) -> Result<(), StorageError> {
        let result = match mode {
            WaitMode::Polling => self.device.wait_polling(),
            WaitMode::Irq => self.device.wait_irq(),
        };
        self.device.finish(&result);
        self.observed = true;
        result
    }
}

impl<B: ResidentBios, P: Platform + ?Sized> Drop for InFlight<'_, '_, B, P> {
    fn drop(&mut self) {
        if !self.observed {
            let result = self.device.wait_polling();
            self.device.finish(&result);
        }
    }
}
