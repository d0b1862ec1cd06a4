#![allow(dead_code)]

use tandem_cpu_core::interp::Tier0Isa;
use tandem_cpu_core::mem::FlatMemory;
use tandem_cpu_core::platform::SimplePlatform;
use tandem_cpu_core::state::{
    ArchState, Segment, CR0_PE, CR0_PG, CR4_PAE, EFER_LMA, EFER_LME, SEG_ATTR_L, SEG_ATTR_PRESENT,
    SEG_ATTR_S,
};
use tandem_cpu_core::{CoreConfig, Emulator};

pub const MEMORY_SIZE: usize = 0x10000;
pub const CODE_BASE: u64 = 0x1000;
pub const HANDLER_BASE: u64 = 0x3000;

pub type TestEmulator = Emulator<Tier0Isa, SimplePlatform>;

/// Real-mode CPU with `code` at [`CODE_BASE`] and nothing else in memory.
pub fn real_mode(code: &[u8], config: CoreConfig) -> TestEmulator {
    real_mode_with(code, config, SimplePlatform::new)
}

pub fn real_mode_with(
    code: &[u8],
    config: CoreConfig,
    platform: impl FnOnce(FlatMemory) -> SimplePlatform,
) -> TestEmulator {
    let mut memory = FlatMemory::new(MEMORY_SIZE);
    memory.load(CODE_BASE, code);
    let mut state = ArchState::new();
    state.rip = CODE_BASE;
    Emulator::new(config, state, Tier0Isa, platform(memory)).unwrap()
}

/// 64-bit code segment, paging on, identity-mapped by [`SimplePlatform`].
pub fn long_mode_state() -> ArchState {
    let mut state = ArchState::new();
    state.control.cr0 |= CR0_PE | CR0_PG;
    state.control.cr4 |= CR4_PAE;
    state.msr.efer |= EFER_LME | EFER_LMA;
    state.segments.cs = Segment {
        selector: 0x08,
        base: 0,
        limit: 0xffff_ffff,
        attributes: SEG_ATTR_PRESENT | SEG_ATTR_S | SEG_ATTR_L | 0xb,
    };
    state
}

pub fn install_handler(emu: &mut TestEmulator, vector: u8, code: &[u8]) {
    let platform = emu.platform_mut();
    platform.memory.load(HANDLER_BASE, code);
    platform.set_handler(vector, HANDLER_BASE);
}
