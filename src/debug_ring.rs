//! S-BIOS debug ring buffer
//!
//! The storage BIOS logs into a ring of fixed-size text chunks kept in its
//! own reserved region. The header sits in the last words of the region:
//!
//! ```text
//! [... chunks ...][tail][head][enable][buffer][3 words reserved] <- region end
//! ```
//!
//! The BIOS writes at `head`, the kernel drains from `tail`. One chunk is
//! always left empty so `head == tail` means "nothing to read".

use alloc::string::String;
use alloc::vec::Vec;

use falcon_abi::debug_ring::{
    BUFFER_WORDS_FROM_END, CHUNK_SIZE, ENABLE_WORDS_FROM_END, HEAD_WORDS_FROM_END,
    TAIL_WORDS_FROM_END, field,
};
use falcon_abi::WORD_SIZE;

use crate::addr::PhysAddr;
use crate::ram::PhysMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Buffer pointer is zero
    NotFormatted,
    /// Head or tail out of range
    Corrupt { head: u32, tail: u32 },
    /// Header and chunks do not fit below the region end
    BadGeometry { region_end: u64, chunk_count: u32 },
}

impl core::fmt::Display for RingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RingError::NotFormatted => write!(f, "Debug ring not set up"),
            RingError::Corrupt { head, tail } => {
                write!(f, "Debug ring corrupt (head {}, tail {})", head, tail)
            }
            RingError::BadGeometry {
                region_end,
                chunk_count,
            } => write!(
                f,
                "Debug ring of {} chunks does not fit below 0x{:08x}",
                chunk_count, region_end
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingHeader {
    pub tail: u32,
    pub head: u32,
    pub enabled: bool,
    pub buffer: PhysAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugRing {
    region_end: u32,
    chunk_count: u32,
    buffer_base: PhysAddr,
}

impl DebugRing {
    /// Ring at the end of the region ending at `region_end` (exclusive)
    pub fn new(region_end: u64, chunk_count: u32) -> Result<Self, RingError> {
        let bad = RingError::BadGeometry {
            region_end,
            chunk_count,
        };
        let end = u32::try_from(region_end).map_err(|_| bad)?;
        if chunk_count == 0 {
            return Err(bad);
        }
        let base = end
            .checked_sub(TAIL_WORDS_FROM_END * WORD_SIZE)
            .zip(chunk_count.checked_mul(CHUNK_SIZE))
            .and_then(|(header, chunks)| header.checked_sub(chunks))
            .ok_or(bad)?;
        Ok(Self {
            region_end: end,
            chunk_count,
            buffer_base: PhysAddr::new(base),
        })
    }

    pub const fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    fn field(&self, words_from_end: u32) -> PhysAddr {
        PhysAddr::new(field(self.region_end, words_from_end))
    }

    /// Where `format` places the chunks: directly below the header
    pub const fn buffer_base(&self) -> PhysAddr {
        self.buffer_base
    }

    /// Lay out an empty, disabled ring
    pub fn format(&self, ram: &mut PhysMemory) {
        let base = self.buffer_base();
        for chunk in 0..self.chunk_count {
            ram.write_bytes(base.add(chunk * CHUNK_SIZE), &[0; CHUNK_SIZE as usize]);
        }
        ram.write_u32(self.field(TAIL_WORDS_FROM_END), 0);
        ram.write_u32(self.field(HEAD_WORDS_FROM_END), 0);
        ram.write_u32(self.field(ENABLE_WORDS_FROM_END), 0);
        ram.write_u32(self.field(BUFFER_WORDS_FROM_END), base.as_u32());
    }

    pub fn header(&self, ram: &PhysMemory) -> RingHeader {
        RingHeader {
            tail: ram.read_u32(self.field(TAIL_WORDS_FROM_END)),
            head: ram.read_u32(self.field(HEAD_WORDS_FROM_END)),
            enabled: ram.read_u32(self.field(ENABLE_WORDS_FROM_END)) != 0,
            buffer: PhysAddr::new(ram.read_u32(self.field(BUFFER_WORDS_FROM_END))),
        }
    }

    fn checked_header(&self, ram: &PhysMemory) -> Result<RingHeader, RingError> {
        let header = self.header(ram);
        if header.buffer.as_u32() == 0 {
            return Err(RingError::NotFormatted);
        }
        if header.head >= self.chunk_count || header.tail >= self.chunk_count {
            return Err(RingError::Corrupt {
                head: header.head,
                tail: header.tail,
            });
        }
        Ok(header)
    }

    pub fn set_enabled(&self, ram: &mut PhysMemory, enabled: bool) {
        ram.write_u32(self.field(ENABLE_WORDS_FROM_END), enabled as u32);
    }

    pub fn is_enabled(&self, ram: &PhysMemory) -> bool {
        self.header(ram).enabled
    }

    /// Writer side, as the BIOS does it. Drops the message when logging is
    /// disabled and overwrites the oldest chunk when the ring is full.
    /// Messages longer than a chunk are truncated.
    pub fn push(&self, ram: &mut PhysMemory, message: &[u8]) -> Result<bool, RingError> {
        let header = self.checked_header(ram)?;
        if !header.enabled {
            return Ok(false);
        }

        let mut chunk = [0u8; CHUNK_SIZE as usize];
        let len = message.len().min(chunk.len() - 1);
        chunk[..len].copy_from_slice(&message[..len]);
        ram.write_bytes(header.buffer.add(header.head * CHUNK_SIZE), &chunk);

        let head = (header.head + 1) % self.chunk_count;
        if head == header.tail {
            let tail = (header.tail + 1) % self.chunk_count;
            ram.write_u32(self.field(TAIL_WORDS_FROM_END), tail);
        }
        ram.write_u32(self.field(HEAD_WORDS_FROM_END), head);
        Ok(true)
    }

    /// Reader side: take every pending chunk, oldest first
    pub fn drain(&self, ram: &mut PhysMemory) -> Result<Vec<String>, RingError> {
        let header = self.checked_header(ram)?;
        let mut lines = Vec::new();
        let mut tail = header.tail;
        let mut chunk = [0u8; CHUNK_SIZE as usize];
        while tail != header.head {
            ram.read_bytes(header.buffer.add(tail * CHUNK_SIZE), &mut chunk);
            let len = chunk.iter().position(|&b| b == 0).unwrap_or(chunk.len());
            lines.push(String::from_utf8_lossy(&chunk[..len]).into_owned());
            tail = (tail + 1) % self.chunk_count;
        }
        ram.write_u32(self.field(TAIL_WORDS_FROM_END), tail);
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    const END: u32 = 0x9000_0000;

    fn ring() -> (DebugRing, PhysMemory) {
        let ring = DebugRing::new(END as u64, 4).unwrap();
        let mut ram = PhysMemory::new();
        ring.format(&mut ram);
        (ring, ram)
    }

    #[test]
    fn test_header_layout() {
        let (ring, mut ram) = ring();
        ring.set_enabled(&mut ram, true);
        assert_eq!(ram.read_u32(PhysAddr::new(END - 5 * 4)), 1);
        assert_eq!(ram.read_u32(PhysAddr::new(END - 4 * 4)), ring.buffer_base().as_u32());
        assert_eq!(ring.buffer_base(), PhysAddr::new(END - 7 * 4 - 4 * 128));

        ram.write_u32(PhysAddr::new(END - 7 * 4), 2);
        ram.write_u32(PhysAddr::new(END - 6 * 4), 3);
        let header = ring.header(&ram);
        assert_eq!((header.tail, header.head), (2, 3));
    }

    #[test]
    fn test_disabled_ring_drops_messages() {
        let (ring, mut ram) = ring();
        assert_eq!(ring.push(&mut ram, b"hello"), Ok(false));
        assert_eq!(ring.drain(&mut ram), Ok(Vec::new()));
    }

    #[test]
    fn test_push_and_drain() {
        let (ring, mut ram) = ring();
        ring.set_enabled(&mut ram, true);
        ring.push(&mut ram, b"nand0: init").unwrap();
        ring.push(&mut ram, b"nand0: ready").unwrap();
        assert_eq!(ring.drain(&mut ram).unwrap(), ["nand0: init", "nand0: ready"]);
        assert!(ring.drain(&mut ram).unwrap().is_empty());
    }

    #[test]
    fn test_full_ring_keeps_newest() {
        let (ring, mut ram) = ring();
        ring.set_enabled(&mut ram, true);
        for i in 0..6 {
            ring.push(&mut ram, format!("msg {}", i).as_bytes()).unwrap();
        }
        assert_eq!(ring.drain(&mut ram).unwrap(), ["msg 3", "msg 4", "msg 5"]);
    }

    #[test]
    fn test_long_message_truncated() {
        let (ring, mut ram) = ring();
        ring.set_enabled(&mut ram, true);
        ring.push(&mut ram, &[b'x'; 300]).unwrap();
        let lines = ring.drain(&mut ram).unwrap();
        assert_eq!(lines[0].len(), CHUNK_SIZE as usize - 1);
    }

    #[test]
    fn test_geometry_that_does_not_fit() {
        for (end, chunks) in [
            (END as u64, 0),
            (END as u64, u32::MAX),
            (0x1000, 64),
            (16, 1),
            (1 << 32, 4),
        ] {
            assert_eq!(
                DebugRing::new(end, chunks),
                Err(RingError::BadGeometry {
                    region_end: end,
                    chunk_count: chunks
                })
            );
        }
        let tight = DebugRing::new(28 + 128, 1).unwrap();
        assert_eq!(tight.buffer_base(), PhysAddr::new(0));
    }

    #[test]
    fn test_unformatted_and_corrupt() {
        let ring = DebugRing::new(END as u64, 4).unwrap();
        let mut ram = PhysMemory::new();
        assert_eq!(ring.drain(&mut ram), Err(RingError::NotFormatted));

        ring.format(&mut ram);
        ram.write_u32(PhysAddr::new(END - 6 * 4), 9);
        assert_eq!(ring.drain(&mut ram), Err(RingError::Corrupt { head: 9, tail: 0 }));
    }
}
