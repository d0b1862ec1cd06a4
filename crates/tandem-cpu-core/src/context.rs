//! External context record and the marshaller between it and [`ArchState`].
//!
//! The record is the hand-off format shared with an accelerated engine: 79
//! sixteen-byte register slots in a fixed order, 64-byte aligned. Every slot
//! maps to exactly one group of architectural fields through
//! [`read_field`]/[`write_field`], and [`ContextField`] enumerates the slots
//! in wire order.
//!
//! Two slots change shape with the operating mode. In long mode the FPU
//! last-instruction and last-operand pointers are 64-bit linear addresses;
//! otherwise they are 32-bit offsets plus a selector. Import picks the form
//! from the EFER slot of the incoming record, so the result never depends on
//! the order in which slots are applied.

use bytemuck::{Pod, Zeroable};

use crate::state::{ArchState, DescriptorTable, FpReg, SegReg, Segment, EFER_LMA};

/// One register slot. Scalars live in `low`; 128-bit values span both halves.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RegisterValue {
    pub low: u64,
    pub high: u64,
}

impl RegisterValue {
    pub const fn from_u64(value: u64) -> Self {
        Self {
            low: value,
            high: 0,
        }
    }

    pub fn from_u128(value: u128) -> Self {
        Self {
            low: value as u64,
            high: (value >> 64) as u64,
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.low
    }

    pub fn as_u32(&self) -> u64 {
        self.low & 0xffff_ffff
    }

    pub fn as_u128(&self) -> u128 {
        u128::from(self.low) | (u128::from(self.high) << 64)
    }

    /// `{ base: u64, limit: u32, selector: u16, attributes: u16 }`
    pub fn from_segment(seg: &Segment) -> Self {
        Self {
            low: seg.base,
            high: u64::from(seg.limit)
                | (u64::from(seg.selector) << 32)
                | (u64::from(seg.attributes) << 48),
        }
    }

    pub fn segment(&self) -> Segment {
        Segment {
            base: self.low,
            limit: self.high as u32,
            selector: (self.high >> 32) as u16,
            attributes: (self.high >> 48) as u16,
        }
    }

    /// `{ pad: [u16; 3], limit: u16, base: u64 }`
    pub fn from_table(table: &DescriptorTable) -> Self {
        Self {
            low: u64::from(table.limit) << 48,
            high: table.base,
        }
    }

    pub fn table(&self) -> DescriptorTable {
        DescriptorTable {
            base: self.high,
            limit: (self.low >> 48) as u16,
        }
    }

    /// `{ mantissa: u64, biased_exponent: 15 bits, sign: 1 bit }`
    pub fn from_fp(reg: &FpReg) -> Self {
        Self {
            low: reg.mantissa,
            high: u64::from(reg.biased_exponent()) | (u64::from(reg.sign()) << 15),
        }
    }

    pub fn fp(&self) -> FpReg {
        FpReg {
            mantissa: self.low,
            exponent: (self.high & 0xffff) as u16,
        }
    }
}

/// Wire-order slots of [`ContextRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextField {
    Gpr(usize),
    Rip,
    Rflags,
    Seg(SegReg),
    Ldtr,
    Tr,
    Idtr,
    Gdtr,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
    Cr8,
    Dr(usize),
    Dr6,
    Dr7,
    Xcr0,
    Xmm(usize),
    St(usize),
    /// FCW, FSW, abridged FTW, FOP and the last instruction pointer.
    FpControl,
    /// Last operand pointer, MXCSR and MXCSR_MASK.
    XmmControl,
    Tsc,
    Efer,
    KernelGsBase,
    ApicBase,
    Pat,
    SysenterCs,
    SysenterEip,
    SysenterEsp,
    Star,
    Lstar,
    Cstar,
    Sfmask,
    TscAux,
}

const SEGMENT_ORDER: [SegReg; 6] = [
    SegReg::Es,
    SegReg::Cs,
    SegReg::Ss,
    SegReg::Ds,
    SegReg::Fs,
    SegReg::Gs,
];

impl ContextField {
    pub const COUNT: usize = 79;

    /// Slot index within the record.
    pub fn index(self) -> usize {
        use ContextField::*;
        match self {
            Gpr(i) => i,
            Rip => 16,
            Rflags => 17,
            Seg(seg) => 18 + seg as usize,
            Ldtr => 24,
            Tr => 25,
            Idtr => 26,
            Gdtr => 27,
            Cr0 => 28,
            Cr2 => 29,
            Cr3 => 30,
            Cr4 => 31,
            Cr8 => 32,
            Dr(i) => 33 + i,
            Dr6 => 37,
            Dr7 => 38,
            Xcr0 => 39,
            Xmm(i) => 40 + i,
            St(i) => 56 + i,
            FpControl => 64,
            XmmControl => 65,
            Tsc => 66,
            Efer => 67,
            KernelGsBase => 68,
            ApicBase => 69,
            Pat => 70,
            SysenterCs => 71,
            SysenterEip => 72,
            SysenterEsp => 73,
            Star => 74,
            Lstar => 75,
            Cstar => 76,
            Sfmask => 77,
            TscAux => 78,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        use ContextField::*;
        let field = match index {
            0..=15 => Gpr(index),
            16 => Rip,
            17 => Rflags,
            18..=23 => Seg(SEGMENT_ORDER[index - 18]),
            24 => Ldtr,
            25 => Tr,
            26 => Idtr,
            27 => Gdtr,
            28 => Cr0,
            29 => Cr2,
            30 => Cr3,
            31 => Cr4,
            32 => Cr8,
            33..=36 => Dr(index - 33),
            37 => Dr6,
            38 => Dr7,
            39 => Xcr0,
            40..=55 => Xmm(index - 40),
            56..=63 => St(index - 56),
            64 => FpControl,
            65 => XmmControl,
            66 => Tsc,
            67 => Efer,
            68 => KernelGsBase,
            69 => ApicBase,
            70 => Pat,
            71 => SysenterCs,
            72 => SysenterEip,
            73 => SysenterEsp,
            74 => Star,
            75 => Lstar,
            76 => Cstar,
            77 => Sfmask,
            78 => TscAux,
            _ => return None,
        };
        Some(field)
    }

    /// Byte offset of the slot within the record.
    pub fn offset(self) -> usize {
        self.index() * std::mem::size_of::<RegisterValue>()
    }

    pub fn all() -> impl Iterator<Item = ContextField> {
        (0..Self::COUNT).filter_map(Self::from_index)
    }
}

/// The hand-off record. Field order is part of the engine ABI.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ContextRecord {
    pub rax: RegisterValue,
    pub rcx: RegisterValue,
    pub rdx: RegisterValue,
    pub rbx: RegisterValue,
    pub rsp: RegisterValue,
    pub rbp: RegisterValue,
    pub rsi: RegisterValue,
    pub rdi: RegisterValue,
    pub r8: RegisterValue,
    pub r9: RegisterValue,
    pub r10: RegisterValue,
    pub r11: RegisterValue,
    pub r12: RegisterValue,
    pub r13: RegisterValue,
    pub r14: RegisterValue,
    pub r15: RegisterValue,
    pub rip: RegisterValue,

    pub rflags: RegisterValue,

    pub es: RegisterValue,
    pub cs: RegisterValue,
    pub ss: RegisterValue,
    pub ds: RegisterValue,
    pub fs: RegisterValue,
    pub gs: RegisterValue,

    pub ldtr: RegisterValue,
    pub tr: RegisterValue,
    pub idtr: RegisterValue,
    pub gdtr: RegisterValue,

    pub cr0: RegisterValue,
    pub cr2: RegisterValue,
    pub cr3: RegisterValue,
    pub cr4: RegisterValue,
    pub cr8: RegisterValue,

    pub dr0: RegisterValue,
    pub dr1: RegisterValue,
    pub dr2: RegisterValue,
    pub dr3: RegisterValue,
    pub dr6: RegisterValue,
    pub dr7: RegisterValue,

    pub xcr0: RegisterValue,

    pub xmm: [RegisterValue; 16],
    pub st: [RegisterValue; 8],

    pub fp_control: RegisterValue,
    pub xmm_control: RegisterValue,

    pub tsc: RegisterValue,
    pub efer: RegisterValue,
    pub kernel_gs_base: RegisterValue,
    pub apic_base: RegisterValue,
    pub pat: RegisterValue,
    pub sysenter_cs: RegisterValue,
    pub sysenter_eip: RegisterValue,
    pub sysenter_esp: RegisterValue,
    pub star: RegisterValue,
    pub lstar: RegisterValue,
    pub cstar: RegisterValue,
    pub sfmask: RegisterValue,

    pub tsc_aux: RegisterValue,

    _pad: RegisterValue,
}

type Slots = [RegisterValue; ContextField::COUNT + 1];

impl Default for ContextRecord {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl ContextRecord {
    pub fn slot(&self, field: ContextField) -> RegisterValue {
        bytemuck::cast_ref::<Self, Slots>(self)[field.index()]
    }

    pub fn set_slot(&mut self, field: ContextField, value: RegisterValue) {
        bytemuck::cast_mut::<Self, Slots>(self)[field.index()] = value;
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Linear address of RIP as the record describes it.
    pub fn linear_rip(&self) -> u64 {
        self.cs.segment().base.wrapping_add(self.rip.as_u64())
    }
}

/// Value of one slot for `state`. `long_mode` selects the FPU pointer form.
pub fn read_field(state: &ArchState, field: ContextField, long_mode: bool) -> RegisterValue {
    use ContextField::*;
    let msr = &state.msr;
    let fpu = &state.fpu;
    match field {
        Gpr(i) => RegisterValue::from_u64(state.gpr[i]),
        Rip => RegisterValue::from_u64(state.rip),
        Rflags => RegisterValue::from_u64(state.rflags & 0xffff_ffff),
        Seg(seg) => RegisterValue::from_segment(state.segments.get(seg)),
        Ldtr => RegisterValue::from_segment(&state.tables.ldtr),
        Tr => RegisterValue::from_segment(&state.tables.tr),
        Idtr => RegisterValue::from_table(&state.tables.idtr),
        Gdtr => RegisterValue::from_table(&state.tables.gdtr),
        Cr0 => RegisterValue::from_u64(state.control.cr0 & 0xffff_ffff),
        Cr2 => RegisterValue::from_u64(state.control.cr2),
        Cr3 => RegisterValue::from_u64(state.control.cr3),
        Cr4 => RegisterValue::from_u64(state.control.cr4 & 0xffff_ffff),
        Cr8 => RegisterValue::from_u64(state.control.cr8 & 0xf),
        Dr(i) => RegisterValue::from_u64(state.debug.dr[i]),
        Dr6 => RegisterValue::from_u64(state.debug.dr6 & 0xffff_ffff),
        Dr7 => RegisterValue::from_u64(state.debug.dr7 & 0xffff_ffff),
        Xcr0 => RegisterValue::from_u64(state.xcr0 & 0xffff_ffff),
        Xmm(i) => RegisterValue::from_u128(state.sse.xmm[i]),
        St(i) => RegisterValue::from_fp(&fpu.st[i]),
        FpControl => {
            let low = u64::from(fpu.fcw)
                | (u64::from(fpu.fsw) << 16)
                | (u64::from(fpu.ftw) << 32)
                | (u64::from(fpu.fop) << 48);
            let high = if long_mode {
                fpu.fip
            } else {
                (fpu.fip & 0xffff_ffff) | (u64::from(fpu.fcs) << 32)
            };
            RegisterValue { low, high }
        }
        XmmControl => {
            let low = if long_mode {
                fpu.fdp
            } else {
                (fpu.fdp & 0xffff_ffff) | (u64::from(fpu.fds) << 32)
            };
            let high = u64::from(state.sse.mxcsr) | (u64::from(state.sse.mxcsr_mask) << 32);
            RegisterValue { low, high }
        }
        Tsc => RegisterValue::from_u64(msr.tsc),
        Efer => RegisterValue::from_u64(msr.efer & 0xffff_ffff),
        KernelGsBase => RegisterValue::from_u64(msr.kernel_gs_base),
        ApicBase => RegisterValue::from_u64(msr.apic_base),
        Pat => RegisterValue::from_u64(msr.pat),
        SysenterCs => RegisterValue::from_u64(msr.sysenter_cs & 0xffff_ffff),
        SysenterEip => RegisterValue::from_u64(msr.sysenter_eip),
        SysenterEsp => RegisterValue::from_u64(msr.sysenter_esp),
        Star => RegisterValue::from_u64(msr.star),
        Lstar => RegisterValue::from_u64(msr.lstar),
        Cstar => RegisterValue::from_u64(msr.cstar),
        Sfmask => RegisterValue::from_u64(msr.fmask & 0xffff_ffff),
        TscAux => RegisterValue::from_u64(msr.tsc_aux & 0xffff_ffff),
    }
}

/// Applies one slot to `state`. The inverse of [`read_field`] for every
/// state whose 32-bit registers fit in 32 bits and whose CR8 fits in 4.
pub fn write_field(state: &mut ArchState, field: ContextField, value: RegisterValue, long_mode: bool) {
    use ContextField::*;
    match field {
        Gpr(i) => state.gpr[i] = value.as_u64(),
        Rip => state.rip = value.as_u64(),
        Rflags => state.rflags = value.as_u32(),
        Seg(seg) => {
            let segments = &mut state.segments;
            let slot = match seg {
                SegReg::Es => &mut segments.es,
                SegReg::Cs => &mut segments.cs,
                SegReg::Ss => &mut segments.ss,
                SegReg::Ds => &mut segments.ds,
                SegReg::Fs => &mut segments.fs,
                SegReg::Gs => &mut segments.gs,
            };
            *slot = value.segment();
        }
        Ldtr => state.tables.ldtr = value.segment(),
        Tr => state.tables.tr = value.segment(),
        Idtr => state.tables.idtr = value.table(),
        Gdtr => state.tables.gdtr = value.table(),
        Cr0 => state.control.cr0 = value.as_u32(),
        Cr2 => state.control.cr2 = value.as_u64(),
        Cr3 => state.control.cr3 = value.as_u64(),
        Cr4 => state.control.cr4 = value.as_u32(),
        Cr8 => state.control.cr8 = value.as_u64() & 0xf,
        Dr(i) => state.debug.dr[i] = value.as_u64(),
        Dr6 => state.debug.dr6 = value.as_u32(),
        Dr7 => state.debug.dr7 = value.as_u32(),
        Xcr0 => state.xcr0 = value.as_u32(),
        Xmm(i) => state.sse.xmm[i] = value.as_u128(),
        St(i) => state.fpu.st[i] = value.fp(),
        FpControl => {
            let fpu = &mut state.fpu;
            fpu.fcw = value.low as u16;
            fpu.fsw = (value.low >> 16) as u16;
            fpu.ftw = (value.low >> 32) as u8;
            fpu.fop = (value.low >> 48) as u16;
            if long_mode {
                fpu.fip = value.high;
                fpu.fcs = 0;
            } else {
                fpu.fip = value.high & 0xffff_ffff;
                fpu.fcs = (value.high >> 32) as u16;
            }
        }
        XmmControl => {
            let fpu = &mut state.fpu;
            if long_mode {
                fpu.fdp = value.low;
                fpu.fds = 0;
            } else {
                fpu.fdp = value.low & 0xffff_ffff;
                fpu.fds = (value.low >> 32) as u16;
            }
            state.sse.mxcsr = value.high as u32;
            state.sse.mxcsr_mask = (value.high >> 32) as u32;
        }
        Tsc => state.msr.tsc = value.as_u64(),
        Efer => state.msr.efer = value.as_u32(),
        KernelGsBase => state.msr.kernel_gs_base = value.as_u64(),
        ApicBase => state.msr.apic_base = value.as_u64(),
        Pat => state.msr.pat = value.as_u64(),
        SysenterCs => state.msr.sysenter_cs = value.as_u32(),
        SysenterEip => state.msr.sysenter_eip = value.as_u64(),
        SysenterEsp => state.msr.sysenter_esp = value.as_u64(),
        Star => state.msr.star = value.as_u64(),
        Lstar => state.msr.lstar = value.as_u64(),
        Cstar => state.msr.cstar = value.as_u64(),
        Sfmask => state.msr.fmask = value.as_u32(),
        TscAux => state.msr.tsc_aux = value.as_u32(),
    }
}

pub fn export_context(state: &ArchState) -> ContextRecord {
    let long_mode = state.msr.efer & EFER_LMA != 0;
    let mut record = ContextRecord::zeroed();
    for field in ContextField::all() {
        record.set_slot(field, read_field(state, field, long_mode));
    }
    record
}

/// Replaces every architectural field carried by `record`. Callers owning
/// derived mode state must refresh it afterwards.
pub fn import_context(record: &ContextRecord, state: &mut ArchState) {
    let long_mode = record.slot(ContextField::Efer).as_u64() & EFER_LMA != 0;
    for field in ContextField::all() {
        write_field(state, field, record.slot(field), long_mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_mapping_is_a_bijection() {
        for index in 0..ContextField::COUNT {
            let field = ContextField::from_index(index).unwrap();
            assert_eq!(field.index(), index);
        }
        assert_eq!(ContextField::from_index(ContextField::COUNT), None);
        assert_eq!(ContextField::all().count(), ContextField::COUNT);
    }

    #[test]
    fn segment_packing_matches_wire_layout() {
        let seg = Segment {
            selector: 0x10,
            base: 0x1234_5678_9abc,
            limit: 0xffff_ffff,
            attributes: 0xa09b,
        };
        let value = RegisterValue::from_segment(&seg);
        let bytes = bytemuck::bytes_of(&value);
        assert_eq!(&bytes[0..8], &0x1234_5678_9abcu64.to_le_bytes());
        assert_eq!(&bytes[8..12], &0xffff_ffffu32.to_le_bytes());
        assert_eq!(&bytes[12..14], &0x10u16.to_le_bytes());
        assert_eq!(&bytes[14..16], &0xa09bu16.to_le_bytes());
        assert_eq!(value.segment(), seg);
    }

    #[test]
    fn table_limit_sits_after_padding() {
        let table = DescriptorTable {
            base: 0xffff_8000_0000_1000,
            limit: 0x7f,
        };
        let value = RegisterValue::from_table(&table);
        let bytes = bytemuck::bytes_of(&value);
        assert_eq!(&bytes[0..6], &[0u8; 6]);
        assert_eq!(&bytes[6..8], &0x7fu16.to_le_bytes());
        assert_eq!(value.table(), table);
    }

    #[test]
    fn legacy_fpu_pointers_carry_selectors() {
        let mut state = ArchState::new();
        state.fpu.fip = 0x1234;
        state.fpu.fcs = 0x08;
        state.fpu.fdp = 0x5678;
        state.fpu.fds = 0x10;
        let record = export_context(&state);
        assert_eq!(record.fp_control.high, 0x0008_0000_1234);
        assert_eq!(record.xmm_control.low, 0x0010_0000_5678);
    }
}
