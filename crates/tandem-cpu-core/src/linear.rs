//! Data-side access to guest linear memory for execute handlers.

use crate::exception::{CpuError, FatalError};
use crate::mem::{AccessType, PAGE_MASK, PAGE_SIZE};
use crate::platform::{PagingContext, Platform};
use crate::tlb::Tlb;

pub trait LinearMemory {
    fn read(&mut self, laddr: u64, buf: &mut [u8]) -> Result<(), CpuError>;
    fn write(&mut self, laddr: u64, data: &[u8]) -> Result<(), CpuError>;

    fn read_u8(&mut self, laddr: u64) -> Result<u8, CpuError> {
        let mut buf = [0u8; 1];
        self.read(laddr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self, laddr: u64) -> Result<u16, CpuError> {
        let mut buf = [0u8; 2];
        self.read(laddr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&mut self, laddr: u64) -> Result<u32, CpuError> {
        let mut buf = [0u8; 4];
        self.read(laddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self, laddr: u64) -> Result<u64, CpuError> {
        let mut buf = [0u8; 8];
        self.read(laddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8(&mut self, laddr: u64, value: u8) -> Result<(), CpuError> {
        self.write(laddr, &[value])
    }
}

/// Linear memory through the CPU's TLB and the platform's page walker.
pub struct LinearBus<'a, P: ?Sized> {
    tlb: &'a mut Tlb,
    platform: &'a mut P,
    paging: PagingContext,
    addr_mask: u64,
}

impl<'a, P: Platform + ?Sized> LinearBus<'a, P> {
    pub fn new(tlb: &'a mut Tlb, platform: &'a mut P, paging: PagingContext, bitness: u32) -> Self {
        let addr_mask = if bitness == 64 { u64::MAX } else { 0xffff_ffff };
        Self {
            tlb,
            platform,
            paging,
            addr_mask,
        }
    }

    /// Runs `f` on each page-bounded chunk of `[laddr, laddr + len)`.
    fn for_each_chunk(
        &mut self,
        laddr: u64,
        len: usize,
        access: AccessType,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<(), CpuError> {
        let mut done = 0usize;
        while done < len {
            let addr = laddr.wrapping_add(done as u64) & self.addr_mask;
            let in_page = (PAGE_SIZE - (addr & !PAGE_MASK)) as usize;
            let chunk = in_page.min(len - done);
            let paddr = self
                .tlb
                .translate(&mut *self.platform, &self.paging, addr, access)?;
            let memory_len = self.platform.memory_len();
            let Some(host) = self.platform.host_page(paddr, access) else {
                return Err(if paddr >= memory_len {
                    FatalError::BogusMemory { paddr, memory_len }
                } else {
                    FatalError::BackingVetoed { paddr }
                }
                .into());
            };
            if host.len() < chunk {
                let paddr = paddr + host.len() as u64;
                return Err(FatalError::BogusMemory { paddr, memory_len }.into());
            }
            f(&mut host[..chunk], done);
            done += chunk;
        }
        Ok(())
    }
}

impl<P: Platform + ?Sized> LinearMemory for LinearBus<'_, P> {
    fn read(&mut self, laddr: u64, buf: &mut [u8]) -> Result<(), CpuError> {
        let len = buf.len();
        self.for_each_chunk(laddr, len, AccessType::Read, |host, at| {
            buf[at..at + host.len()].copy_from_slice(host);
        })
    }

    fn write(&mut self, laddr: u64, data: &[u8]) -> Result<(), CpuError> {
        self.for_each_chunk(laddr, data.len(), AccessType::Write, |host, at| {
            host.copy_from_slice(&data[at..at + host.len()]);
        })
    }
}
