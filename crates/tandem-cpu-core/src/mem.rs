//! Guest physical memory backing.

use std::ops::Range;

pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AccessType {
    Read = 0,
    Write = 1,
    Execute = 2,
    ReadWrite = 3,
}

impl AccessType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(AccessType::Read),
            1 => Some(AccessType::Write),
            2 => Some(AccessType::Execute),
            3 => Some(AccessType::ReadWrite),
            _ => None,
        }
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessType::Write | AccessType::ReadWrite)
    }
}

/// Resolves guest physical addresses to host-accessible memory.
pub trait MemoryBacking {
    /// Size of guest physical memory in bytes.
    fn memory_len(&self) -> u64;

    /// Host view of the page containing `paddr`, starting at `paddr` and
    /// ending at the page boundary. `None` when the backing refuses direct
    /// access (MMIO, ROM on write, out of range).
    fn host_page(&mut self, paddr: u64, access: AccessType) -> Option<&mut [u8]>;
}

/// Flat RAM with optional ranges that refuse direct access.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    mem: Vec<u8>,
    vetoed: Vec<Range<u64>>,
    read_only: Vec<Range<u64>>,
}

impl FlatMemory {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            vetoed: Vec::new(),
            read_only: Vec::new(),
        }
    }

    pub fn load(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        self.mem[start..end].copy_from_slice(data);
    }

    pub fn slice(&self, addr: u64, len: usize) -> &[u8] {
        let start = addr as usize;
        let end = start + len;
        &self.mem[start..end]
    }

    /// Marks a range as having no direct host mapping (e.g. device memory).
    pub fn veto(&mut self, range: Range<u64>) {
        self.vetoed.push(range);
    }

    pub fn set_read_only(&mut self, range: Range<u64>) {
        self.read_only.push(range);
    }
}

impl MemoryBacking for FlatMemory {
    fn memory_len(&self) -> u64 {
        self.mem.len() as u64
    }

    fn host_page(&mut self, paddr: u64, access: AccessType) -> Option<&mut [u8]> {
        if paddr >= self.memory_len() || self.vetoed.iter().any(|r| r.contains(&paddr)) {
            return None;
        }
        if access.writes() && self.read_only.iter().any(|r| r.contains(&paddr)) {
            return None;
        }
        let start = paddr as usize;
        let end = ((paddr & PAGE_MASK) + PAGE_SIZE).min(self.memory_len()) as usize;
        Some(&mut self.mem[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_page_stops_at_page_boundary() {
        let mut mem = FlatMemory::new(0x3000);
        let page = mem.host_page(0x1ff0, AccessType::Read).unwrap();
        assert_eq!(page.len(), 0x10);
    }

    #[test]
    fn vetoed_and_read_only_ranges() {
        let mut mem = FlatMemory::new(0x3000);
        mem.veto(0x2000..0x3000);
        mem.set_read_only(0x1000..0x2000);
        assert!(mem.host_page(0x2010, AccessType::Read).is_none());
        assert!(mem.host_page(0x1010, AccessType::Write).is_none());
        assert!(mem.host_page(0x1010, AccessType::Execute).is_some());
        assert!(mem.host_page(0x4000, AccessType::Read).is_none());
    }
}
