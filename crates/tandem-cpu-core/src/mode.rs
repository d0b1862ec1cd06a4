//! Mode-derived fast-path state and the handlers that recompute it.
//!
//! Anything cached here must be refreshed after CR0/CR4/EFER/XCR0/RFLAGS or
//! CS change out of band, most importantly after a context import.

use bitflags::bitflags;

use crate::state::{
    ArchState, CpuMode, CR0_AM, CR0_EM, CR4_OSFXSR, CR4_OSXSAVE, RFLAGS_AC, XCR0_AVX, XCR0_SSE,
};

bitflags! {
    /// Part of the instruction cache key: decoding depends on these bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct FetchMode: u32 {
        const IS_32 = 1 << 0;
        const IS_64 = 1 << 1;
        const SSE_OK = 1 << 2;
        const AVX_OK = 1 << 3;
    }
}

impl FetchMode {
    pub fn bitness(self) -> u32 {
        if self.contains(FetchMode::IS_64) {
            64
        } else if self.contains(FetchMode::IS_32) {
            32
        } else {
            16
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeCache {
    pub mode: CpuMode,
    pub cpl: u8,
    pub fetch_mode: FetchMode,
    pub alignment_check: bool,
    avx_configured: bool,
}

impl ModeCache {
    pub fn new(state: &ArchState, avx_configured: bool) -> Self {
        let mut cache = Self {
            mode: CpuMode::Real,
            cpl: 0,
            fetch_mode: FetchMode::empty(),
            alignment_check: false,
            avx_configured,
        };
        cache.refresh(state);
        cache
    }

    /// Runs every mode-change handler in dependency order.
    pub fn refresh(&mut self, state: &ArchState) {
        self.handle_alignment_check(state);
        self.handle_cpu_mode_change(state);
        self.handle_sse_mode_change(state);
        if self.avx_configured {
            self.handle_avx_mode_change(state);
        }
    }

    pub fn handle_alignment_check(&mut self, state: &ArchState) {
        self.alignment_check =
            state.control.cr0 & CR0_AM != 0 && state.rflags & RFLAGS_AC != 0 && state.cpl() == 3;
    }

    pub fn handle_cpu_mode_change(&mut self, state: &ArchState) {
        self.mode = state.cpu_mode();
        self.cpl = state.cpl();
        self.fetch_mode -= FetchMode::IS_32 | FetchMode::IS_64;
        match state.bitness() {
            64 => self.fetch_mode |= FetchMode::IS_64 | FetchMode::IS_32,
            32 => self.fetch_mode |= FetchMode::IS_32,
            _ => {}
        }
    }

    pub fn handle_sse_mode_change(&mut self, state: &ArchState) {
        let ok = state.control.cr0 & CR0_EM == 0 && state.control.cr4 & CR4_OSFXSR != 0;
        self.fetch_mode.set(FetchMode::SSE_OK, ok);
    }

    pub fn handle_avx_mode_change(&mut self, state: &ArchState) {
        let xcr0_ok = state.xcr0 & (XCR0_SSE | XCR0_AVX) == XCR0_SSE | XCR0_AVX;
        let ok = !matches!(self.mode, CpuMode::Real | CpuMode::Virtual8086)
            && state.control.cr4 & CR4_OSXSAVE != 0
            && xcr0_ok;
        self.fetch_mode.set(FetchMode::AVX_OK, ok);
    }

    /// `USER_PL`: 1 when running at CPL 3.
    pub fn user_pl(&self) -> u32 {
        u32::from(self.cpl == 3)
    }
}
