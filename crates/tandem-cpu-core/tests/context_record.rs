use memoffset::offset_of;
use proptest::prelude::*;

use tandem_cpu_core::context::{export_context, import_context, read_field};
use tandem_cpu_core::state::{ArchState, DescriptorTable, FpReg, Segment, EFER_LMA};
use tandem_cpu_core::{ContextField, ContextRecord, RegisterValue};

fn segment(next: &mut dyn FnMut() -> u64) -> Segment {
    let packed = next();
    Segment {
        selector: packed as u16,
        base: next(),
        limit: (packed >> 16) as u32,
        attributes: (packed >> 48) as u16,
    }
}

/// Builds a state from raw words. Fields the record carries as 32-bit are
/// truncated, and the FPU selectors follow the mode's pointer form.
fn state_from_words(words: &[u64], long_mode: bool) -> ArchState {
    let mut words = words.iter().copied().cycle();
    let mut next = move || words.next().unwrap_or(0);
    let mut state = ArchState::new();
    for gpr in &mut state.gpr {
        *gpr = next();
    }
    state.rip = next();
    state.rflags = next() & 0xffff_ffff;
    state.segments.es = segment(&mut next);
    state.segments.cs = segment(&mut next);
    state.segments.ss = segment(&mut next);
    state.segments.ds = segment(&mut next);
    state.segments.fs = segment(&mut next);
    state.segments.gs = segment(&mut next);
    state.tables.ldtr = segment(&mut next);
    state.tables.tr = segment(&mut next);
    state.tables.idtr = DescriptorTable {
        base: next(),
        limit: next() as u16,
    };
    state.tables.gdtr = DescriptorTable {
        base: next(),
        limit: next() as u16,
    };
    state.control.cr0 = next() & 0xffff_ffff;
    state.control.cr2 = next();
    state.control.cr3 = next();
    state.control.cr4 = next() & 0xffff_ffff;
    state.control.cr8 = next() & 0xf;
    for dr in &mut state.debug.dr {
        *dr = next();
    }
    state.debug.dr6 = next() & 0xffff_ffff;
    state.debug.dr7 = next() & 0xffff_ffff;
    state.xcr0 = next() & 0xffff_ffff;
    for xmm in &mut state.sse.xmm {
        *xmm = u128::from(next()) | (u128::from(next()) << 64);
    }
    for st in &mut state.fpu.st {
        *st = FpReg {
            mantissa: next(),
            exponent: next() as u16,
        };
    }
    let packed = next();
    state.fpu.fcw = packed as u16;
    state.fpu.fsw = (packed >> 16) as u16;
    state.fpu.ftw = (packed >> 32) as u8;
    state.fpu.fop = (packed >> 48) as u16;
    if long_mode {
        state.fpu.fip = next();
        state.fpu.fdp = next();
    } else {
        state.fpu.fip = next() & 0xffff_ffff;
        state.fpu.fdp = next() & 0xffff_ffff;
        state.fpu.fcs = next() as u16;
        state.fpu.fds = next() as u16;
    }
    state.sse.mxcsr = next() as u32;
    state.sse.mxcsr_mask = next() as u32;

    let msr = &mut state.msr;
    msr.tsc = next();
    msr.efer = next() & 0xffff_ffff & !EFER_LMA;
    if long_mode {
        msr.efer |= EFER_LMA;
    }
    msr.kernel_gs_base = next();
    msr.apic_base = next();
    msr.pat = next();
    msr.sysenter_cs = next() & 0xffff_ffff;
    msr.sysenter_eip = next();
    msr.sysenter_esp = next();
    msr.star = next();
    msr.lstar = next();
    msr.cstar = next();
    msr.fmask = next() & 0xffff_ffff;
    msr.tsc_aux = next() & 0xffff_ffff;
    state
}

proptest! {
    #[test]
    fn export_then_import_preserves_state(
        words in prop::collection::vec(any::<u64>(), 128),
        long_mode in any::<bool>(),
    ) {
        let original = state_from_words(&words, long_mode);
        let record = export_context(&original);
        let mut restored = ArchState::new();
        import_context(&record, &mut restored);
        prop_assert_eq!(&restored, &original);
        prop_assert_eq!(export_context(&restored), record);
    }

    #[test]
    fn import_then_export_preserves_record(
        words in prop::collection::vec(any::<u64>(), 128),
        long_mode in any::<bool>(),
    ) {
        let record = export_context(&state_from_words(&words, long_mode));
        let mut state = ArchState::new();
        import_context(&record, &mut state);
        let exported = export_context(&state);
        prop_assert_eq!(exported.as_bytes(), record.as_bytes());
    }
}

#[test]
fn record_layout_is_fixed() {
    assert_eq!(std::mem::size_of::<ContextRecord>(), 1280);
    assert_eq!(std::mem::align_of::<ContextRecord>(), 64);
    assert_eq!(std::mem::size_of::<RegisterValue>(), 16);
    assert_eq!(ContextField::COUNT, 79);

    let named = [
        (ContextField::Gpr(0), offset_of!(ContextRecord, rax)),
        (ContextField::Gpr(15), offset_of!(ContextRecord, r15)),
        (ContextField::Rip, offset_of!(ContextRecord, rip)),
        (ContextField::Rflags, offset_of!(ContextRecord, rflags)),
        (
            ContextField::Seg(tandem_cpu_core::state::SegReg::Cs),
            offset_of!(ContextRecord, cs),
        ),
        (ContextField::Ldtr, offset_of!(ContextRecord, ldtr)),
        (ContextField::Gdtr, offset_of!(ContextRecord, gdtr)),
        (ContextField::Cr0, offset_of!(ContextRecord, cr0)),
        (ContextField::Cr8, offset_of!(ContextRecord, cr8)),
        (ContextField::Dr(0), offset_of!(ContextRecord, dr0)),
        (ContextField::Dr7, offset_of!(ContextRecord, dr7)),
        (ContextField::Xcr0, offset_of!(ContextRecord, xcr0)),
        (ContextField::Xmm(0), offset_of!(ContextRecord, xmm)),
        (ContextField::St(0), offset_of!(ContextRecord, st)),
        (ContextField::FpControl, offset_of!(ContextRecord, fp_control)),
        (ContextField::XmmControl, offset_of!(ContextRecord, xmm_control)),
        (ContextField::Tsc, offset_of!(ContextRecord, tsc)),
        (ContextField::Efer, offset_of!(ContextRecord, efer)),
        (ContextField::ApicBase, offset_of!(ContextRecord, apic_base)),
        (ContextField::SysenterCs, offset_of!(ContextRecord, sysenter_cs)),
        (ContextField::Sfmask, offset_of!(ContextRecord, sfmask)),
        (ContextField::TscAux, offset_of!(ContextRecord, tsc_aux)),
    ];
    for (field, offset) in named {
        assert_eq!(field.offset(), offset, "{field:?}");
    }
    assert_eq!(ContextField::Xmm(15).offset(), offset_of!(ContextRecord, xmm) + 15 * 16);
    assert_eq!(ContextField::St(7).offset(), offset_of!(ContextRecord, st) + 7 * 16);
    assert_eq!(ContextField::TscAux.offset(), 78 * 16);
}

#[test]
fn every_slot_reaches_distinct_state() {
    // Setting one slot at a time must change exactly that slot on re-export.
    let base = ArchState::new();
    let long_mode = false;
    for field in ContextField::all() {
        let mut record = export_context(&base);
        let before = read_field(&base, field, long_mode);
        // Descriptor-table slots keep padding in the low bits.
        let poked = match field {
            ContextField::Idtr | ContextField::Gdtr => RegisterValue {
                low: before.low,
                high: before.high ^ 0x1,
            },
            _ => RegisterValue {
                low: before.low ^ 0x1,
                high: before.high,
            },
        };
        record.set_slot(field, poked);

        let mut state = base.clone();
        import_context(&record, &mut state);
        let after = export_context(&state);
        for other in ContextField::all() {
            let expected = if other == field { poked } else { record.slot(other) };
            assert_eq!(after.slot(other), expected, "poking {field:?} disturbed {other:?}");
        }
    }
}

#[test]
fn apic_base_is_imported() {
    let mut record = export_context(&ArchState::new());
    record.apic_base = RegisterValue::from_u64(0xfec0_0900);
    let mut state = ArchState::new();
    import_context(&record, &mut state);
    assert_eq!(state.msr.apic_base, 0xfec0_0900);
}

#[test]
fn long_mode_import_drops_fpu_selectors() {
    let mut state = ArchState::new();
    state.fpu.fcs = 0x33;
    state.fpu.fds = 0x2b;
    let mut record = export_context(&state);
    record.efer = RegisterValue::from_u64(EFER_LMA);
    record.fp_control.high = 0xffff_8000_0000_1000;
    record.xmm_control.low = 0xffff_8000_0000_2000;

    import_context(&record, &mut state);
    assert_eq!(state.fpu.fip, 0xffff_8000_0000_1000);
    assert_eq!(state.fpu.fdp, 0xffff_8000_0000_2000);
    assert_eq!((state.fpu.fcs, state.fpu.fds), (0, 0));
}
