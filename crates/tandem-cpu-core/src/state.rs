//! Architectural register state owned by the execution core.
//!
//! [`ArchState`] contains only architecturally visible state. Bookkeeping that
//! the dispatch loop needs on top of it (pending events, instruction counters,
//! cached mode-derived values) lives next to it in [`crate::cpu::CpuCore`].

use iced_x86::Register;

pub const RFLAGS_CF: u64 = 1 << 0;
pub const RFLAGS_RESERVED1: u64 = 1 << 1;
pub const RFLAGS_PF: u64 = 1 << 2;
pub const RFLAGS_AF: u64 = 1 << 4;
pub const RFLAGS_ZF: u64 = 1 << 6;
pub const RFLAGS_SF: u64 = 1 << 7;
pub const RFLAGS_TF: u64 = 1 << 8;
pub const RFLAGS_IF: u64 = 1 << 9;
pub const RFLAGS_DF: u64 = 1 << 10;
pub const RFLAGS_OF: u64 = 1 << 11;
pub const RFLAGS_RF: u64 = 1 << 16;
pub const RFLAGS_VM: u64 = 1 << 17;
pub const RFLAGS_AC: u64 = 1 << 18;
pub const RFLAGS_VIF: u64 = 1 << 19;
pub const RFLAGS_VIP: u64 = 1 << 20;

pub const CR0_PE: u64 = 1 << 0;
pub const CR0_MP: u64 = 1 << 1;
pub const CR0_EM: u64 = 1 << 2;
pub const CR0_TS: u64 = 1 << 3;
pub const CR0_AM: u64 = 1 << 18;
pub const CR0_PG: u64 = 1 << 31;

pub const CR4_VME: u64 = 1 << 0;
pub const CR4_PVI: u64 = 1 << 1;
pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_OSFXSR: u64 = 1 << 9;
pub const CR4_OSXSAVE: u64 = 1 << 18;

pub const EFER_SCE: u64 = 1 << 0;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;

pub const XCR0_X87: u64 = 1 << 0;
pub const XCR0_SSE: u64 = 1 << 1;
pub const XCR0_AVX: u64 = 1 << 2;

/// Segment attribute bits, laid out like bits 8..24 of a descriptor's high dword.
pub const SEG_ATTR_TYPE_MASK: u16 = 0x000f;
pub const SEG_ATTR_S: u16 = 1 << 4;
pub const SEG_ATTR_DPL_SHIFT: u16 = 5;
pub const SEG_ATTR_PRESENT: u16 = 1 << 7;
pub const SEG_ATTR_AVL: u16 = 1 << 12;
pub const SEG_ATTR_L: u16 = 1 << 13;
pub const SEG_ATTR_DB: u16 = 1 << 14;
pub const SEG_ATTR_G: u16 = 1 << 15;

/// Indices into [`ArchState::gpr`].
pub mod gpr {
    pub const RAX: usize = 0;
    pub const RCX: usize = 1;
    pub const RDX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSP: usize = 4;
    pub const RBP: usize = 5;
    pub const RSI: usize = 6;
    pub const RDI: usize = 7;
    pub const R8: usize = 8;
    pub const R15: usize = 15;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Virtual8086,
    Protected,
    /// 32/16-bit code segment while EFER.LMA is set.
    Compatibility,
    Long64,
}

impl CpuMode {
    pub fn is_long64(self) -> bool {
        matches!(self, CpuMode::Long64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    /// Byte-granular (already scaled) limit.
    pub limit: u32,
    pub attributes: u16,
}

impl Segment {
    /// A present, writable data/code-agnostic segment as left by real-mode loads.
    pub fn real_mode(selector: u16) -> Self {
        Self {
            selector,
            base: u64::from(selector) << 4,
            limit: 0xffff,
            attributes: SEG_ATTR_PRESENT | SEG_ATTR_S | 0x3,
        }
    }

    pub fn present(&self) -> bool {
        self.attributes & SEG_ATTR_PRESENT != 0
    }

    pub fn dpl(&self) -> u8 {
        ((self.attributes >> SEG_ATTR_DPL_SHIFT) & 3) as u8
    }

    pub fn long(&self) -> bool {
        self.attributes & SEG_ATTR_L != 0
    }

    pub fn default_big(&self) -> bool {
        self.attributes & SEG_ATTR_DB != 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegReg {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segments {
    pub es: Segment,
    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub fs: Segment,
    pub gs: Segment,
}

impl Segments {
    pub fn get(&self, seg: SegReg) -> &Segment {
        match seg {
            SegReg::Es => &self.es,
            SegReg::Cs => &self.cs,
            SegReg::Ss => &self.ss,
            SegReg::Ds => &self.ds,
            SegReg::Fs => &self.fs,
            SegReg::Gs => &self.gs,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tables {
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub ldtr: Segment,
    pub tr: Segment,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlRegs {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    /// Task priority, 4 bits. Aliases APIC TPR[7:4].
    pub cr8: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugRegs {
    pub dr: [u64; 4],
    pub dr6: u64,
    pub dr7: u64,
}

/// 80-bit extended-precision register. Bit 15 of `exponent` is the sign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FpReg {
    pub mantissa: u64,
    pub exponent: u16,
}

impl FpReg {
    pub fn biased_exponent(&self) -> u16 {
        self.exponent & 0x7fff
    }

    pub fn sign(&self) -> bool {
        self.exponent & 0x8000 != 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FpuState {
    pub st: [FpReg; 8],
    pub fcw: u16,
    pub fsw: u16,
    /// Abridged (one bit per register) tag word.
    pub ftw: u8,
    pub fop: u16,
    pub fip: u64,
    pub fcs: u16,
    pub fdp: u64,
    pub fds: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SseState {
    pub xmm: [u128; 16],
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsrState {
    pub efer: u64,
    pub kernel_gs_base: u64,
    pub apic_base: u64,
    pub pat: u64,
    pub sysenter_cs: u64,
    pub sysenter_eip: u64,
    pub sysenter_esp: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub fmask: u64,
    pub tsc_aux: u64,
    pub tsc: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchState {
    pub gpr: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    pub segments: Segments,
    pub tables: Tables,
    pub control: ControlRegs,
    pub debug: DebugRegs,
    pub xcr0: u64,
    pub fpu: FpuState,
    pub sse: SseState,
    pub msr: MsrState,
}

impl Default for ArchState {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchState {
    /// Power-on state: real mode, CS:IP at 0:0, flat 64 KiB segments.
    pub fn new() -> Self {
        let segments = Segments {
            es: Segment::real_mode(0),
            cs: Segment::real_mode(0),
            ss: Segment::real_mode(0),
            ds: Segment::real_mode(0),
            fs: Segment::real_mode(0),
            gs: Segment::real_mode(0),
        };
        Self {
            gpr: [0; 16],
            rip: 0,
            rflags: RFLAGS_RESERVED1,
            segments,
            tables: Tables {
                gdtr: DescriptorTable { base: 0, limit: 0xffff },
                idtr: DescriptorTable { base: 0, limit: 0x3ff },
                ..Tables::default()
            },
            control: ControlRegs::default(),
            debug: DebugRegs {
                dr6: 0xffff_0ff0,
                dr7: 0x400,
                ..DebugRegs::default()
            },
            xcr0: XCR0_X87,
            fpu: FpuState {
                fcw: 0x037f,
                ..FpuState::default()
            },
            sse: SseState {
                mxcsr: 0x1f80,
                mxcsr_mask: 0xffff,
                ..SseState::default()
            },
            msr: MsrState {
                apic_base: 0xfee0_0900,
                pat: 0x0007_0406_0007_0406,
                ..MsrState::default()
            },
        }
    }

    pub fn cpu_mode(&self) -> CpuMode {
        if self.control.cr0 & CR0_PE == 0 {
            return CpuMode::Real;
        }
        if self.msr.efer & EFER_LMA != 0 {
            if self.segments.cs.long() {
                CpuMode::Long64
            } else {
                CpuMode::Compatibility
            }
        } else if self.rflags & RFLAGS_VM != 0 {
            CpuMode::Virtual8086
        } else {
            CpuMode::Protected
        }
    }

    pub fn long_mode_active(&self) -> bool {
        self.msr.efer & EFER_LMA != 0
    }

    /// Current privilege level.
    pub fn cpl(&self) -> u8 {
        match self.cpu_mode() {
            CpuMode::Real => 0,
            CpuMode::Virtual8086 => 3,
            _ => (self.segments.cs.selector & 3) as u8,
        }
    }

    /// Code segment operand/address width in bits.
    pub fn bitness(&self) -> u32 {
        match self.cpu_mode() {
            CpuMode::Long64 => 64,
            CpuMode::Real | CpuMode::Virtual8086 => 16,
            _ if self.segments.cs.default_big() => 32,
            _ => 16,
        }
    }

    pub fn ip_mask(&self) -> u64 {
        match self.bitness() {
            64 => u64::MAX,
            32 => 0xffff_ffff,
            _ => 0xffff,
        }
    }

    pub fn rip(&self) -> u64 {
        self.rip
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.rip = rip;
    }

    pub fn flag(&self, mask: u64) -> bool {
        self.rflags & mask != 0
    }

    pub fn set_flag(&mut self, mask: u64, value: bool) {
        if value {
            self.rflags |= mask;
        } else {
            self.rflags &= !mask;
        }
    }

    pub fn zf(&self) -> bool {
        self.flag(RFLAGS_ZF)
    }

    pub fn read_reg(&self, reg: Register) -> u64 {
        let Some((idx, bits, high8)) = gpr_info(reg) else {
            return 0;
        };
        let full = self.gpr[idx];
        match (bits, high8) {
            (8, true) => (full >> 8) & 0xff,
            (8, false) => full & 0xff,
            (16, _) => full & 0xffff,
            (32, _) => full & 0xffff_ffff,
            _ => full,
        }
    }

    /// Writes a GPR view. 32-bit writes zero-extend, 8/16-bit writes merge.
    pub fn write_reg(&mut self, reg: Register, value: u64) {
        let Some((idx, bits, high8)) = gpr_info(reg) else {
            return;
        };
        let slot = &mut self.gpr[idx];
        match (bits, high8) {
            (8, true) => *slot = (*slot & !0xff00) | ((value & 0xff) << 8),
            (8, false) => *slot = (*slot & !0xff) | (value & 0xff),
            (16, _) => *slot = (*slot & !0xffff) | (value & 0xffff),
            (32, _) => *slot = value & 0xffff_ffff,
            _ => *slot = value,
        }
    }
}

fn gpr_info(reg: Register) -> Option<(usize, u32, bool)> {
    use Register::*;
    let (idx, bits, high8) = match reg {
        AL => (0, 8, false),
        CL => (1, 8, false),
        DL => (2, 8, false),
        BL => (3, 8, false),
        AH => (0, 8, true),
        CH => (1, 8, true),
        DH => (2, 8, true),
        BH => (3, 8, true),
        SPL => (4, 8, false),
        BPL => (5, 8, false),
        SIL => (6, 8, false),
        DIL => (7, 8, false),
        R8L => (8, 8, false),
        R9L => (9, 8, false),
        R10L => (10, 8, false),
        R11L => (11, 8, false),
        R12L => (12, 8, false),
        R13L => (13, 8, false),
        R14L => (14, 8, false),
        R15L => (15, 8, false),

        AX => (0, 16, false),
        CX => (1, 16, false),
        DX => (2, 16, false),
        BX => (3, 16, false),
        SP => (4, 16, false),
        BP => (5, 16, false),
        SI => (6, 16, false),
        DI => (7, 16, false),
        R8W => (8, 16, false),
        R9W => (9, 16, false),
        R10W => (10, 16, false),
        R11W => (11, 16, false),
        R12W => (12, 16, false),
        R13W => (13, 16, false),
        R14W => (14, 16, false),
        R15W => (15, 16, false),

        EAX => (0, 32, false),
        ECX => (1, 32, false),
        EDX => (2, 32, false),
        EBX => (3, 32, false),
        ESP => (4, 32, false),
        EBP => (5, 32, false),
        ESI => (6, 32, false),
        EDI => (7, 32, false),
        R8D => (8, 32, false),
        R9D => (9, 32, false),
        R10D => (10, 32, false),
        R11D => (11, 32, false),
        R12D => (12, 32, false),
        R13D => (13, 32, false),
        R14D => (14, 32, false),
        R15D => (15, 32, false),

        RAX => (0, 64, false),
        RCX => (1, 64, false),
        RDX => (2, 64, false),
        RBX => (3, 64, false),
        RSP => (4, 64, false),
        RBP => (5, 64, false),
        RSI => (6, 64, false),
        RDI => (7, 64, false),
        R8 => (8, 64, false),
        R9 => (9, 64, false),
        R10 => (10, 64, false),
        R11 => (11, 64, false),
        R12 => (12, 64, false),
        R13 => (13, 64, false),
        R14 => (14, 64, false),
        R15 => (15, 64, false),
        _ => return Option::None,
    };
    Some((idx, bits, high8))
}

/// Canonical in 48-bit linear address space.
pub fn is_canonical(addr: u64) -> bool {
    ((addr as i64) << 16 >> 16) as u64 == addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecx_write_zero_extends_into_rcx() {
        let mut state = ArchState::new();
        state.gpr[gpr::RCX] = u64::MAX;
        state.write_reg(Register::ECX, 5);
        assert_eq!(state.gpr[gpr::RCX], 5);

        state.gpr[gpr::RCX] = 0xdead_beef_0000_0000;
        state.write_reg(Register::CX, 7);
        assert_eq!(state.gpr[gpr::RCX], 0xdead_beef_0000_0007);
    }

    #[test]
    fn canonical_addresses() {
        assert!(is_canonical(0x0000_7fff_ffff_ffff));
        assert!(is_canonical(0xffff_8000_0000_0000));
        assert!(!is_canonical(0x0000_8000_0000_0000));
        assert!(!is_canonical(0x1234_0000_0000_0000));
    }

    #[test]
    fn mode_follows_cr0_efer_and_cs() {
        let mut state = ArchState::new();
        assert_eq!(state.cpu_mode(), CpuMode::Real);
        state.control.cr0 |= CR0_PE;
        assert_eq!(state.cpu_mode(), CpuMode::Protected);
        state.msr.efer |= EFER_LMA;
        assert_eq!(state.cpu_mode(), CpuMode::Compatibility);
        state.segments.cs.attributes |= SEG_ATTR_L;
        assert_eq!(state.cpu_mode(), CpuMode::Long64);
        assert_eq!(state.bitness(), 64);
    }
}
