//! Instruction fetch window: linear address checks, translation, and the
//! host-backing guarantee for the page being executed.

use tracing::{debug, error};

use crate::cpu::CpuCore;
use crate::debug::DebugHooks;
use crate::exception::{CpuError, Exception, FatalError};
use crate::mem::{AccessType, PAGE_MASK, PAGE_SIZE};
use crate::platform::{PagingContext, Platform};
use crate::state::{
    is_canonical, ArchState, CpuMode, CR4_PVI, CR4_VME, RFLAGS_RF, RFLAGS_VIF, RFLAGS_VIP,
};
use crate::tlb::Tlb;

/// Longest legal x86 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// `rip + eip_page_bias` is the offset of RIP within the fetch page; valid
/// while it is below `eip_page_window_size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchWindow {
    pub eip_page_bias: u64,
    pub eip_page_window_size: u64,
    pub paddr_fetch_page: u64,
}

impl FetchWindow {
    /// Forces the next fetch through [`prefetch`].
    pub fn invalidate(&mut self) {
        self.eip_page_window_size = 0;
    }

    pub fn eip_biased(&self, rip: u64) -> u64 {
        rip.wrapping_add(self.eip_page_bias)
    }

    pub fn contains(&self, rip: u64) -> bool {
        self.eip_biased(rip) < self.eip_page_window_size
    }

    pub fn paddr_of(&self, rip: u64) -> u64 {
        self.paddr_fetch_page.wrapping_add(self.eip_biased(rip))
    }

    pub fn remaining(&self, rip: u64) -> usize {
        self.eip_page_window_size.saturating_sub(self.eip_biased(rip)) as usize
    }

    /// The window ends at the page end, not at the CS limit.
    pub fn reaches_page_end(&self) -> bool {
        self.eip_page_window_size == PAGE_SIZE
    }
}

/// Linear address of RIP in the current mode.
pub fn linear_ip(state: &ArchState, mode: CpuMode) -> u64 {
    if mode.is_long64() {
        state.rip
    } else {
        state.segments.cs.base.wrapping_add(state.rip & 0xffff_ffff) & 0xffff_ffff
    }
}

/// DR0-DR3 execute breakpoints enabled in DR7 that lie on `laddr`'s page.
fn hw_code_breakpoint_on_page(state: &ArchState, laddr: u64) -> bool {
    (0..4).any(|i| {
        let enabled = (state.debug.dr7 >> (i * 2)) & 3 != 0;
        let rw = (state.debug.dr7 >> (16 + i * 4)) & 3;
        enabled && rw == 0 && state.debug.dr[i] & PAGE_MASK == laddr & PAGE_MASK
    })
}

/// DR6 bits for execute breakpoints matching `laddr` exactly. RF suppresses them.
fn code_breakpoint_match(state: &ArchState, laddr: u64) -> u32 {
    if state.rflags & RFLAGS_RF != 0 {
        return 0;
    }
    (0..4)
        .filter(|&i| {
            let enabled = (state.debug.dr7 >> (i * 2)) & 3 != 0;
            let rw = (state.debug.dr7 >> (16 + i * 4)) & 3;
            enabled && rw == 0 && state.debug.dr[i] == laddr
        })
        .fold(0, |bits, i| bits | (1 << i))
}

/// Recomputes the fetch window for the current RIP.
pub fn prefetch<P: Platform + ?Sized>(
    core: &mut CpuCore,
    tlb: &mut Tlb,
    platform: &mut P,
    debug: &mut dyn DebugHooks,
    window: &mut FetchWindow,
) -> Result<(), CpuError> {
    let state = &mut core.state;
    let laddr;
    let page_offset;

    if core.mode.mode.is_long64() {
        if !is_canonical(state.rip) {
            error!(rip = state.rip, "prefetch: #GP(0): RIP crossed canonical boundary");
            return Err(Exception::gp0().into());
        }
        laddr = state.rip;
        page_offset = laddr & !PAGE_MASK;
        window.eip_page_bias = page_offset.wrapping_sub(state.rip);
        window.eip_page_window_size = PAGE_SIZE;
    } else {
        if core.mode.cpl == 3
            && state.rflags & RFLAGS_VIP != 0
            && state.rflags & RFLAGS_VIF != 0
            && (state.control.cr4 & CR4_PVI != 0
                || (core.mode.mode == CpuMode::Virtual8086 && state.control.cr4 & CR4_VME != 0))
        {
            error!("prefetch: inconsistent VME state");
            return Err(Exception::gp0().into());
        }

        state.rip &= 0xffff_ffff;
        let eip = state.rip;
        laddr = linear_ip(state, core.mode.mode);
        page_offset = laddr & !PAGE_MASK;
        window.eip_page_bias = page_offset.wrapping_sub(eip);

        let limit = u64::from(state.segments.cs.limit);
        if eip > limit {
            error!(eip, limit, "prefetch: EIP > CS.limit");
            return Err(Exception::gp0().into());
        }
        window.eip_page_window_size = PAGE_SIZE;
        let to_limit = limit.wrapping_add(window.eip_page_bias);
        if to_limit < PAGE_SIZE {
            window.eip_page_window_size = to_limit + 1;
        }
    }

    let debugger_bits = debug.code_breakpoint(laddr);
    if debugger_bits.is_some() || hw_code_breakpoint_on_page(state, laddr) {
        core.events.code_breakpoint_assist = true;
        // Only when this fetch is for the instruction about to run, not a
        // refetch in the middle of a page-crossing instruction.
        if !core.events.debug_inhibited() && state.rip as u32 == core.prev_rip as u32 {
            let dr6 = code_breakpoint_match(state, laddr) | debugger_bits.unwrap_or(0);
            if dr6 != 0 {
                debug!(laddr, dr6, "#DB: code breakpoint");
                return Err(Exception::Debug { dr6, trap: false }.into());
            }
        }
    } else {
        core.events.code_breakpoint_assist = false;
    }

    state.rflags &= !RFLAGS_RF;

    let user_pl = core.mode.user_pl();
    let (ppf, host_exec) = match tlb.lookup(laddr, AccessType::Execute, user_pl) {
        Some(entry) => (entry.ppf, entry.host_exec),
        None => {
            let paging = PagingContext::from_state(state);
            let translation = platform.translate_linear(&paging, laddr, AccessType::Execute)?;
            let entry = tlb.fill(laddr, translation.paddr, translation.access);
            (entry.ppf, false)
        }
    };
    window.paddr_fetch_page = ppf;

    if !host_exec {
        let paddr = ppf | page_offset;
        ensure_host_backed(platform, paddr)?;
        let entry = tlb.entry_mut(laddr);
        if entry.lpf == laddr & PAGE_MASK {
            entry.host_exec = true;
        }
    }
    Ok(())
}

fn ensure_host_backed<P: Platform + ?Sized>(platform: &mut P, paddr: u64) -> Result<(), FatalError> {
    let memory_len = platform.memory_len();
    if platform.host_page(paddr, AccessType::Execute).is_some() {
        return Ok(());
    }
    if paddr >= memory_len {
        error!(paddr, memory_len, "running in bogus memory");
        Err(FatalError::BogusMemory { paddr, memory_len })
    } else {
        error!(paddr, "host backing vetoed direct read");
        Err(FatalError::BackingVetoed { paddr })
    }
}

/// Instruction bytes from `rip` to the end of the fetch window.
pub fn window_bytes<P: Platform + ?Sized>(
    platform: &mut P,
    window: &FetchWindow,
    rip: u64,
    out: &mut Vec<u8>,
) -> Result<(), FatalError> {
    let paddr = window.paddr_of(rip);
    let memory_len = platform.memory_len();
    let want = window.remaining(rip);
    let Some(host) = platform.host_page(paddr, AccessType::Execute) else {
        return Err(if paddr >= memory_len {
            FatalError::BogusMemory { paddr, memory_len }
        } else {
            FatalError::BackingVetoed { paddr }
        });
    };
    out.clear();
    out.extend_from_slice(&host[..want.min(host.len())]);
    Ok(())
}

/// Bytes of an instruction that straddles the fetch page: the tail of this
/// page followed by the head of the next linear page.
pub fn boundary_fetch<P: Platform + ?Sized>(
    core: &CpuCore,
    tlb: &mut Tlb,
    platform: &mut P,
    window: &FetchWindow,
    rip: u64,
) -> Result<Vec<u8>, CpuError> {
    let mut bytes = Vec::with_capacity(MAX_INSTRUCTION_LEN);
    window_bytes(platform, window, rip, &mut bytes)?;
    if !window.reaches_page_end() {
        // The instruction runs past the CS limit.
        return Err(Exception::gp0().into());
    }

    let next_laddr = linear_ip(&core.state, core.mode.mode).wrapping_add(bytes.len() as u64);
    let next_laddr = if core.mode.mode.is_long64() {
        if !is_canonical(next_laddr) {
            return Err(Exception::gp0().into());
        }
        next_laddr
    } else {
        next_laddr & 0xffff_ffff
    };
    let paging = PagingContext::from_state(&core.state);
    let paddr = tlb.translate(platform, &paging, next_laddr, AccessType::Execute)?;
    ensure_host_backed(platform, paddr)?;
    if let Some(host) = platform.host_page(paddr, AccessType::Execute) {
        let take = (MAX_INSTRUCTION_LEN - bytes.len().min(MAX_INSTRUCTION_LEN)).min(host.len());
        bytes.extend_from_slice(&host[..take]);
    }
    debug!(rip, len = bytes.len(), "boundary fetch");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_arithmetic() {
        let window = FetchWindow {
            eip_page_bias: 0x234u64.wrapping_sub(0x1234),
            eip_page_window_size: PAGE_SIZE,
            paddr_fetch_page: 0x8000,
        };
        assert!(window.contains(0x1234));
        assert_eq!(window.paddr_of(0x1234), 0x8234);
        assert_eq!(window.remaining(0x1234), 0x1000 - 0x234);
        assert!(!window.contains(0x2000));
        assert!(!window.contains(0x1000 - 1));
    }

    #[test]
    fn breakpoint_match_respects_rf_and_type() {
        let mut state = ArchState::new();
        state.debug.dr[1] = 0x4010;
        state.debug.dr7 = 1 << 2;
        assert!(hw_code_breakpoint_on_page(&state, 0x4000));
        assert_eq!(code_breakpoint_match(&state, 0x4010), 1 << 1);
        assert_eq!(code_breakpoint_match(&state, 0x4011), 0);
        state.rflags |= RFLAGS_RF;
        assert_eq!(code_breakpoint_match(&state, 0x4010), 0);
        // Data breakpoint type never matches fetches.
        state.rflags &= !RFLAGS_RF;
        state.debug.dr7 = (1 << 2) | (0b01 << 20);
        assert_eq!(code_breakpoint_match(&state, 0x4010), 0);
    }
}
