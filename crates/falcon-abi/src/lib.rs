//! Resident S-BIOS calling convention
//!
//! Function ids, result codes and binary layouts shared between the kernel
//! side of Falcon and the resident BIOS blob. Everything here is part of the
//! blob's ABI: values and offsets must not change.

#![no_std]

/// Size of one machine word on the SoC (ARMv7, 32-bit)
pub const WORD_SIZE: u32 = 4;

// ============================================================================
// Function ids
// ============================================================================

/// `bios_svc` function ids
pub mod svc {
    pub const SUSPEND: u32 = 0x01;
    pub const RESUME: u32 = 0x02;
    pub const REGISTER_MEMORY_BANK: u32 = 0x03;
    pub const REGISTER_PAGE_DATABASE: u32 = 0x04;
    pub const REVERT_PROCESS: u32 = 0x05;
    pub const REGISTER_IOREMAP: u32 = 0x06;
    pub const HOOK_VECTOR: u32 = 0x07;
    pub const DEBUG_CONTROL: u32 = 0x08;

    pub const STORAGE_INIT: u32 = 0x12;
    /// Submit a storage request. `RC_OK` means accepted, poll for completion.
    pub const STORAGE_REQUEST: u32 = 0x13;
    /// `RC_OK` while busy, `RC_DONE` when finished
    pub const STORAGE_WAIT_POLLING: u32 = 0x14;
    /// Same result codes as polling, but arms the completion interrupt
    pub const STORAGE_WAIT_IRQ: u32 = 0x15;
    /// Read and clear the device interrupt status
    pub const STORAGE_INTR_STATUS: u32 = 0x16;
}

// ============================================================================
// Result codes
// ============================================================================

/// Result codes. Meaning is scoped to the function id that produced them.
pub mod rc {
    pub const RC_OK: i32 = 0;
    pub const RC_DONE: i32 = 1;
    pub const RC_ERR: i32 = -1;
    pub const RC_BUSY: i32 = -2;
}

// ============================================================================
// Blob headers
// ============================================================================

/// Magic word at offset 0 of the storage BIOS blob ("SBIO")
pub const SBIOS_MAGIC: u32 = u32::from_le_bytes(*b"SBIO");
/// Magic word at offset 0 of the main BIOS blob ("FBIO")
pub const BIOS_MAGIC: u32 = u32::from_le_bytes(*b"FBIO");

/// Header word offsets (in words from the blob base)
pub mod header {
    pub const MAGIC: u32 = 0;
    /// Entry point, relative to the blob base
    pub const ENTRY_OFFSET: u32 = 1;
    pub const VERSION: u32 = 2;
}

// ============================================================================
// Vector work area
// ============================================================================

/// Number of hand-off slots preceding the exception vector table
pub const MAX_USABLE_AREA: usize = 8;

/// Value the boot stage leaves in slots that are available for hooking
pub const WORK_AREA_MARK: u32 = 0xFA1C_0FFE;

/// `ldr pc, [pc, #-imm12]`
pub const LDR_PC_NEG: u32 = 0xE51F_F000;
const LDR_IMM_MASK: u32 = 0x0000_0FFF;

/// Encode the trampoline placed at `vector` that loads pc from `slot`.
///
/// The ARM pipeline makes pc read as `vector + 8`, so the slot must lie at
/// most 4095 bytes below that.
pub const fn trampoline(vector: u32, slot: u32) -> Option<u32> {
    let pc = vector.wrapping_add(8);
    if slot > pc {
        return None;
    }
    let imm = pc - slot;
    if imm > LDR_IMM_MASK {
        return None;
    }
    Some(LDR_PC_NEG | imm)
}

/// Decode a trampoline at `vector` back to the slot address it loads from
pub const fn trampoline_slot(vector: u32, insn: u32) -> Option<u32> {
    if insn & !LDR_IMM_MASK != LDR_PC_NEG {
        return None;
    }
    Some(vector.wrapping_add(8).wrapping_sub(insn & LDR_IMM_MASK))
}

// ============================================================================
// Storage requests
// ============================================================================

pub mod storage {
    pub const OP_READ: u32 = 0;
    pub const OP_WRITE: u32 = 1;
    pub const OP_ERASE: u32 = 2;
    pub const OP_SBIOS_CALL: u32 = 3;

    pub const DEVICE_BLOCK: u32 = 0;
    pub const DEVICE_NAND: u32 = 1;

    /// Partition number used for whole-device requests
    pub const PART_WHOLE_DEVICE: u32 = 0xFF;

    /// Highest addressable partition; anything above collides with
    /// [`PART_WHOLE_DEVICE`]
    pub const MAX_PARTITION: u32 = 0xFE;

    /// Device descriptor word: `kind << 8 | unit`
    pub const fn device_word(kind: u32, unit: u8) -> u32 {
        (kind & 0xFF) << 8 | unit as u32
    }

    /// First request word: `device << 16 | part << 8 | op`
    pub const fn request_word(device: u32, part: u8, op: u32) -> u32 {
        (device & 0xFFFF) << 16 | (part as u32) << 8 | (op & 0xFF)
    }
}

// ============================================================================
// Suspend
// ============================================================================

/// First argument of `SUSPEND` and `RESUME`
pub mod suspend_mode {
    pub const STANDBY: u32 = 0;
    pub const MEM: u32 = 1;
}

// ============================================================================
// Ownership revert
// ============================================================================

/// Second argument of `REVERT_PROCESS`: what kind of owner is reported
pub mod owner {
    pub const INIT: u32 = 0;
    pub const IDENTITY_MAP: u32 = 1;
    pub const IDLE: u32 = 2;
    pub const TASK: u32 = 3;
}

// ============================================================================
// Debug ring buffer
// ============================================================================

/// Debug ring header, located at fixed negative word offsets from the end of
/// the storage BIOS region.
pub mod debug_ring {
    use super::WORD_SIZE;

    pub const TAIL_WORDS_FROM_END: u32 = 7;
    pub const HEAD_WORDS_FROM_END: u32 = 6;
    pub const ENABLE_WORDS_FROM_END: u32 = 5;
    pub const BUFFER_WORDS_FROM_END: u32 = 4;

    /// Bytes per text chunk
    pub const CHUNK_SIZE: u32 = 128;

    /// Address of a header field given the region end
    pub const fn field(region_end: u32, words_from_end: u32) -> u32 {
        region_end - words_from_end * WORD_SIZE
    }

    /// Lowest address occupied by the header
    pub const fn header_start(region_end: u32) -> u32 {
        field(region_end, TAIL_WORDS_FROM_END)
    }
}
