use iced_x86::ConditionCode;

use crate::state::{
    ArchState, RFLAGS_AF, RFLAGS_CF, RFLAGS_OF, RFLAGS_PF, RFLAGS_SF, RFLAGS_ZF,
};

pub(super) fn mask_bits(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn sign_bit(bits: u32) -> u64 {
    1u64 << (bits - 1)
}

fn parity(value: u64) -> bool {
    (value as u8).count_ones() % 2 == 0
}

fn set_result_flags(state: &mut ArchState, result: u64, bits: u32) {
    state.set_flag(RFLAGS_ZF, result == 0);
    state.set_flag(RFLAGS_SF, result & sign_bit(bits) != 0);
    state.set_flag(RFLAGS_PF, parity(result));
}

/// INC leaves CF alone.
pub(super) fn inc(state: &mut ArchState, value: u64, bits: u32) -> u64 {
    let mask = mask_bits(bits);
    let value = value & mask;
    let result = value.wrapping_add(1) & mask;
    set_result_flags(state, result, bits);
    state.set_flag(RFLAGS_OF, result == sign_bit(bits));
    state.set_flag(RFLAGS_AF, (value ^ result) & 0x10 != 0);
    result
}

/// DEC leaves CF alone.
pub(super) fn dec(state: &mut ArchState, value: u64, bits: u32) -> u64 {
    let mask = mask_bits(bits);
    let value = value & mask;
    let result = value.wrapping_sub(1) & mask;
    set_result_flags(state, result, bits);
    state.set_flag(RFLAGS_OF, value == sign_bit(bits));
    state.set_flag(RFLAGS_AF, (value ^ result) & 0x10 != 0);
    result
}

/// Flags of `lhs - rhs`, as CMP sets them.
pub(super) fn compare(state: &mut ArchState, lhs: u64, rhs: u64, bits: u32) {
    let mask = mask_bits(bits);
    let (lhs, rhs) = (lhs & mask, rhs & mask);
    let result = lhs.wrapping_sub(rhs) & mask;
    set_result_flags(state, result, bits);
    state.set_flag(RFLAGS_CF, lhs < rhs);
    state.set_flag(RFLAGS_AF, (lhs ^ rhs ^ result) & 0x10 != 0);
    let sign = sign_bit(bits);
    state.set_flag(RFLAGS_OF, (lhs ^ rhs) & (lhs ^ result) & sign != 0);
}

pub(super) fn condition_holds(state: &ArchState, cc: ConditionCode) -> bool {
    let cf = state.flag(RFLAGS_CF);
    let zf = state.flag(RFLAGS_ZF);
    let sf = state.flag(RFLAGS_SF);
    let of = state.flag(RFLAGS_OF);
    let pf = state.flag(RFLAGS_PF);
    match cc {
        ConditionCode::None => true,
        ConditionCode::o => of,
        ConditionCode::no => !of,
        ConditionCode::b => cf,
        ConditionCode::ae => !cf,
        ConditionCode::e => zf,
        ConditionCode::ne => !zf,
        ConditionCode::be => cf || zf,
        ConditionCode::a => !cf && !zf,
        ConditionCode::s => sf,
        ConditionCode::ns => !sf,
        ConditionCode::p => pf,
        ConditionCode::np => !pf,
        ConditionCode::l => sf != of,
        ConditionCode::ge => sf == of,
        ConditionCode::le => zf || sf != of,
        ConditionCode::g => !zf && sf == of,
    }
}
