//! Direct-mapped translation cache shared by instruction fetch and data access.

use bitflags::bitflags;
use tracing::trace;

use crate::exception::CpuError;
use crate::mem::{AccessType, PAGE_MASK};
use crate::platform::{PagingContext, Platform};

pub const TLB_SIZE: usize = 1024;

/// Never matches a page-aligned linear address.
const INVALID_LPF: u64 = u64::MAX;

bitflags! {
    /// Access rights per privilege level. User bits sit one position above the
    /// matching supervisor bit so `SYS_x << user_pl` selects the right one.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct TlbAccess: u8 {
        const SYS_READ = 0x01;
        const USER_READ = 0x02;
        const SYS_WRITE = 0x04;
        const USER_WRITE = 0x08;
        const SYS_EXEC = 0x10;
        const USER_EXEC = 0x20;
    }
}

impl TlbAccess {
    /// The rights a given access needs at the given privilege level.
    pub fn required(access: AccessType, user_pl: u32) -> TlbAccess {
        let sys = match access {
            AccessType::Read => TlbAccess::SYS_READ,
            AccessType::Write => TlbAccess::SYS_WRITE,
            AccessType::Execute => TlbAccess::SYS_EXEC,
            AccessType::ReadWrite => TlbAccess::SYS_READ | TlbAccess::SYS_WRITE,
        };
        TlbAccess::from_bits_truncate(sys.bits() << user_pl)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub lpf: u64,
    pub ppf: u64,
    pub access: TlbAccess,
    /// The page was verified to have a direct host mapping for execution.
    pub host_exec: bool,
}

impl Default for TlbEntry {
    fn default() -> Self {
        Self {
            lpf: INVALID_LPF,
            ppf: 0,
            access: TlbAccess::empty(),
            host_exec: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tlb {
    entries: Box<[TlbEntry]>,
    flushes: u64,
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            entries: vec![TlbEntry::default(); TLB_SIZE].into_boxed_slice(),
            flushes: 0,
        }
    }

    #[inline]
    fn index_of(laddr: u64) -> usize {
        ((laddr >> 12) as usize) & (TLB_SIZE - 1)
    }

    pub fn entry(&self, laddr: u64) -> &TlbEntry {
        &self.entries[Self::index_of(laddr)]
    }

    pub fn entry_mut(&mut self, laddr: u64) -> &mut TlbEntry {
        &mut self.entries[Self::index_of(laddr)]
    }

    /// Hit when the line holds this page and grants `access` at `user_pl`.
    pub fn lookup(&self, laddr: u64, access: AccessType, user_pl: u32) -> Option<&TlbEntry> {
        let entry = self.entry(laddr);
        let need = TlbAccess::required(access, user_pl);
        (entry.lpf == laddr & PAGE_MASK && entry.access.contains(need)).then_some(entry)
    }

    pub fn fill(&mut self, laddr: u64, ppf: u64, access: TlbAccess) -> &mut TlbEntry {
        let entry = self.entry_mut(laddr);
        *entry = TlbEntry {
            lpf: laddr & PAGE_MASK,
            ppf: ppf & PAGE_MASK,
            access,
            host_exec: false,
        };
        entry
    }

    pub fn invlpg(&mut self, laddr: u64) {
        let entry = self.entry_mut(laddr);
        if entry.lpf == laddr & PAGE_MASK {
            *entry = TlbEntry::default();
        }
    }

    pub fn flush(&mut self) {
        self.entries.fill(TlbEntry::default());
        self.flushes += 1;
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    /// Translates through the cache, walking the page tables on a miss.
    pub fn translate<P: Platform + ?Sized>(
        &mut self,
        platform: &mut P,
        paging: &PagingContext,
        laddr: u64,
        access: AccessType,
    ) -> Result<u64, CpuError> {
        let user_pl = u32::from(paging.cpl == 3);
        if let Some(entry) = self.lookup(laddr, access, user_pl) {
            return Ok(entry.ppf | (laddr & !PAGE_MASK));
        }
        let translation = platform.translate_linear(paging, laddr, access)?;
        trace!(laddr, paddr = translation.paddr, ?access, "tlb miss");
        self.fill(laddr, translation.paddr, translation.access);
        Ok(translation.paddr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_bits_shift_from_supervisor_bits() {
        assert_eq!(
            TlbAccess::required(AccessType::Execute, 0),
            TlbAccess::SYS_EXEC
        );
        assert_eq!(
            TlbAccess::required(AccessType::Execute, 1),
            TlbAccess::USER_EXEC
        );
        assert_eq!(
            TlbAccess::required(AccessType::ReadWrite, 1),
            TlbAccess::USER_READ | TlbAccess::USER_WRITE
        );
    }

    #[test]
    fn lookup_checks_tag_and_rights() {
        let mut tlb = Tlb::new();
        tlb.fill(0x1234_5000, 0x9000, TlbAccess::SYS_EXEC | TlbAccess::SYS_READ);

        assert_eq!(
            tlb.lookup(0x1234_5678, AccessType::Execute, 0).map(|e| e.ppf),
            Some(0x9000)
        );
        assert!(tlb.lookup(0x1234_5678, AccessType::Execute, 1).is_none());
        assert!(tlb.lookup(0x1234_5678, AccessType::Write, 0).is_none());
        // Same line, different page.
        assert!(tlb
            .lookup(0x1234_5678 + (TLB_SIZE as u64) * 4096, AccessType::Execute, 0)
            .is_none());
    }

    #[test]
    fn flush_and_invlpg_invalidate() {
        let mut tlb = Tlb::new();
        tlb.fill(0x5000, 0x5000, TlbAccess::all());
        tlb.fill(0x6000, 0x6000, TlbAccess::all());
        tlb.invlpg(0x5abc);
        assert!(tlb.lookup(0x5000, AccessType::Read, 0).is_none());
        assert!(tlb.lookup(0x6000, AccessType::Read, 0).is_some());
        tlb.flush();
        assert!(tlb.lookup(0x6000, AccessType::Read, 0).is_none());
        assert_eq!(tlb.flush_count(), 1);
    }
}
