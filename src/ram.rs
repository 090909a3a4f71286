//! Simulated physical memory
//!
//! Sparse, page-granular backing store for the physical address space the
//! Falcon core touches: the BIOS blobs, the debug ring and the page behind
//! the exception vectors. Pages are materialised on first write; reads of
//! untouched memory return zero.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::addr::PhysAddr;
use crate::mmu::{PAGE_SHIFT, PAGE_SIZE};

pub struct PhysMemory {
    pages: BTreeMap<u32, Box<[u8; PAGE_SIZE]>>,
}

impl PhysMemory {
    pub const fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Number of pages that have been written at least once
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }

    fn read_byte(&self, addr: u32) -> u8 {
        let page = addr >> PAGE_SHIFT;
        let offset = addr as usize & (PAGE_SIZE - 1);
        self.pages.get(&page).map_or(0, |p| p[offset])
    }

    fn write_byte(&mut self, addr: u32, value: u8) {
        let page = addr >> PAGE_SHIFT;
        let offset = addr as usize & (PAGE_SIZE - 1);
        self.pages
            .entry(page)
            .or_insert_with(|| Box::new([0u8; PAGE_SIZE]))[offset] = value;
    }

    pub fn read_bytes(&self, addr: PhysAddr, buf: &mut [u8]) {
        let base = addr.as_u32();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_byte(base.wrapping_add(i as u32));
        }
    }

    pub fn write_bytes(&mut self, addr: PhysAddr, data: &[u8]) {
        let base = addr.as_u32();
        for (i, b) in data.iter().enumerate() {
            self.write_byte(base.wrapping_add(i as u32), *b);
        }
    }

    /// Little-endian word read
    pub fn read_u32(&self, addr: PhysAddr) -> u32 {
        let mut word = [0u8; 4];
        self.read_bytes(addr, &mut word);
        u32::from_le_bytes(word)
    }

    /// Little-endian word write
    pub fn write_u32(&mut self, addr: PhysAddr, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }
}

impl Default for PhysMemory {
    fn default() -> Self {
        Self::new()
    }
}
