//! Text control attributes
//!
//! `falcon_ctrl_erase`, `sbios_debug_enable` and `sbios_debug_dump` take and
//! produce ASCII. This module only parses and formats; the work is done by
//! [`StorageDevice::erase`] and the debug ring operations on [`Falcon`].

use alloc::string::String;

use falcon_abi::rc;

use crate::bios::ResidentBios;
use crate::block::{StorageDevice, StorageError, WaitMode};
use crate::falcon::{Falcon, FalconError};
use crate::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    /// Wrong number of fields
    Usage,
    /// Field is not a number
    BadNumber,
    Falcon(FalconError),
}

impl From<FalconError> for ControlError {
    fn from(e: FalconError) -> Self {
        ControlError::Falcon(e)
    }
}

impl core::fmt::Display for ControlError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ControlError::Usage => write!(f, "usage: <path> <from> <to>"),
            ControlError::BadNumber => write!(f, "invalid number"),
            ControlError::Falcon(e) => write!(f, "{}", e),
        }
    }
}

// ============================================================================
// Erase
// ============================================================================

/// Parsed `falcon_ctrl_erase` input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseArgs<'a> {
    pub path: &'a str,
    /// From the trailing digits of the path; -1 for the whole device
    pub part_num: i32,
    pub from: u64,
    pub to: u64,
}

impl<'a> EraseArgs<'a> {
    /// Parse `"<path> <from> <to>"`
    pub fn parse(input: &'a str) -> Result<Self, ControlError> {
        let mut fields = input.split_whitespace();
        let (Some(path), Some(from), Some(to), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(ControlError::Usage);
        };
        Ok(Self {
            path,
            part_num: partition_of(path)?,
            from: parse_number(from)?,
            to: parse_number(to)?,
        })
    }
}

/// `/dev/nand0p3` -> 3, `/dev/nand` -> -1
fn partition_of(path: &str) -> Result<i32, ControlError> {
    let digits = &path[path.trim_end_matches(|c: char| c.is_ascii_digit()).len()..];
    if digits.is_empty() {
        return Ok(-1);
    }
    digits.parse().map_err(|_| ControlError::BadNumber)
}

/// Decimal or `0x` hex
fn parse_number(s: &str) -> Result<u64, ControlError> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| ControlError::BadNumber)
}

/// Handle a write to `falcon_ctrl_erase`. Returns the status to echo back:
/// `0` on success, `-2` if the device is busy, `-1` otherwise.
pub fn ctrl_erase<'f, B, P>(device: &'f StorageDevice<'f, B, P>, input: &str, mode: WaitMode) -> i32
where
    B: ResidentBios,
    P: Platform + ?Sized,
{
    let args = match EraseArgs::parse(input) {
        Ok(args) => args,
        Err(e) => {
            log::warn!("[Falcon] falcon_ctrl_erase: {}", e);
            return rc::RC_ERR;
        }
    };
    match device.erase(args.part_num, args.from, args.to, mode) {
        Ok(()) => rc::RC_OK,
        Err(StorageError::Busy) => rc::RC_BUSY,
        Err(e) => {
            log::warn!(
                "[Falcon] erase {} 0x{:x}..0x{:x} failed: {}",
                args.path,
                args.from,
                args.to,
                e
            );
            rc::RC_ERR
        }
    }
}

// ============================================================================
// Debug ring
// ============================================================================

/// Handle a write to `sbios_debug_enable`: a decimal integer, non-zero enables
pub fn debug_enable<B, P>(falcon: &Falcon<B, P>, input: &str) -> Result<(), ControlError>
where
    B: ResidentBios,
    P: Platform,
{
    let value: i64 = input.trim().parse().map_err(|_| ControlError::BadNumber)?;
    Ok(falcon.set_debug_enabled(value != 0)?)
}

/// Contents of `sbios_debug_enable` when read
pub fn debug_enable_show<B: ResidentBios, P: Platform>(falcon: &Falcon<B, P>) -> String {
    alloc::format!("{}\n", falcon.debug_enabled() as u32)
}

/// Contents of `sbios_debug_dump`: every pending chunk, one per line
pub fn debug_dump<B, P>(falcon: &Falcon<B, P>) -> Result<String, FalconError>
where
    B: ResidentBios,
    P: Platform,
{
    let mut out = String::new();
    for line in falcon.drain_debug()? {
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}
