//! One iteration of MOVS/STOS/LODS/CMPS/SCAS. The count register belongs to
//! the REP iterator; this module only moves data and steps SI/DI.

use iced_x86::{Instruction, Register};

use super::alu;
use crate::exception::CpuError;
use crate::isa::ExecContext;
use crate::linear::LinearMemory;
use crate::rep::AddrSize;
use crate::state::{gpr, ArchState, RFLAGS_DF};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Stos,
    Lods,
    Cmps,
    Scas,
}

fn read_index(state: &ArchState, idx: usize, addr_size: AddrSize) -> u64 {
    let value = state.gpr[idx];
    match addr_size {
        AddrSize::A16 => value & 0xffff,
        AddrSize::A32 => value & 0xffff_ffff,
        AddrSize::A64 => value,
    }
}

fn write_index(state: &mut ArchState, idx: usize, addr_size: AddrSize, value: u64) {
    let slot = &mut state.gpr[idx];
    match addr_size {
        AddrSize::A16 => *slot = (*slot & !0xffff) | (value & 0xffff),
        AddrSize::A32 => *slot = value & 0xffff_ffff,
        AddrSize::A64 => *slot = value,
    }
}

fn step_index(state: &mut ArchState, idx: usize, addr_size: AddrSize, elem_size: usize) {
    let value = read_index(state, idx, addr_size);
    let next = if state.flag(RFLAGS_DF) {
        value.wrapping_sub(elem_size as u64)
    } else {
        value.wrapping_add(elem_size as u64)
    };
    write_index(state, idx, addr_size, next);
}

fn segment_base(state: &ArchState, seg: Register) -> u64 {
    let segments = &state.segments;
    let long = state.cpu_mode().is_long64();
    match seg {
        Register::FS => segments.fs.base,
        Register::GS => segments.gs.base,
        _ if long => 0,
        Register::ES => segments.es.base,
        Register::CS => segments.cs.base,
        Register::SS => segments.ss.base,
        _ => segments.ds.base,
    }
}

fn accumulator(elem_size: usize) -> Register {
    match elem_size {
        1 => Register::AL,
        2 => Register::AX,
        4 => Register::EAX,
        _ => Register::RAX,
    }
}

fn read_elem(mem: &mut dyn LinearMemory, laddr: u64, elem_size: usize) -> Result<u64, CpuError> {
    let mut buf = [0u8; 8];
    mem.read(laddr, &mut buf[..elem_size])?;
    Ok(u64::from_le_bytes(buf))
}

fn write_elem(
    mem: &mut dyn LinearMemory,
    laddr: u64,
    elem_size: usize,
    value: u64,
) -> Result<(), CpuError> {
    mem.write(laddr, &value.to_le_bytes()[..elem_size])
}

pub(super) fn iterate(
    cx: &mut ExecContext<'_>,
    instr: &Instruction,
    op: StringOp,
    elem_size: usize,
    addr_size: AddrSize,
) -> Result<(), CpuError> {
    // Only the source operand honours a segment override.
    let src_seg = match instr.segment_prefix() {
        Register::None => Register::DS,
        seg => seg,
    };
    let state = &mut *cx.state;
    let src = segment_base(state, src_seg).wrapping_add(read_index(state, gpr::RSI, addr_size));
    let dst = segment_base(state, Register::ES).wrapping_add(read_index(state, gpr::RDI, addr_size));
    let bits = elem_size as u32 * 8;
    let acc = accumulator(elem_size);

    match op {
        StringOp::Movs => {
            let value = read_elem(cx.mem, src, elem_size)?;
            write_elem(cx.mem, dst, elem_size, value)?;
            step_index(state, gpr::RSI, addr_size, elem_size);
            step_index(state, gpr::RDI, addr_size, elem_size);
        }
        StringOp::Stos => {
            write_elem(cx.mem, dst, elem_size, state.read_reg(acc))?;
            step_index(state, gpr::RDI, addr_size, elem_size);
        }
        StringOp::Lods => {
            let value = read_elem(cx.mem, src, elem_size)?;
            state.write_reg(acc, value);
            step_index(state, gpr::RSI, addr_size, elem_size);
        }
        StringOp::Cmps => {
            let lhs = read_elem(cx.mem, src, elem_size)?;
            let rhs = read_elem(cx.mem, dst, elem_size)?;
            alu::compare(state, lhs, rhs, bits);
            step_index(state, gpr::RSI, addr_size, elem_size);
            step_index(state, gpr::RDI, addr_size, elem_size);
        }
        StringOp::Scas => {
            let lhs = state.read_reg(acc);
            let rhs = read_elem(cx.mem, dst, elem_size)?;
            alu::compare(state, lhs, rhs, bits);
            step_index(state, gpr::RDI, addr_size, elem_size);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PendingEvents;
    use std::collections::HashMap;

    /// Flat linear memory keyed by byte address.
    #[derive(Default)]
    struct SparseMemory(HashMap<u64, u8>);

    impl LinearMemory for SparseMemory {
        fn read(&mut self, laddr: u64, buf: &mut [u8]) -> Result<(), CpuError> {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = self.0.get(&(laddr + i as u64)).copied().unwrap_or(0);
            }
            Ok(())
        }

        fn write(&mut self, laddr: u64, data: &[u8]) -> Result<(), CpuError> {
            for (i, b) in data.iter().enumerate() {
                self.0.insert(laddr + i as u64, *b);
            }
            Ok(())
        }
    }

    #[test]
    fn movs_honours_direction_flag() {
        let mut state = ArchState::new();
        let mut events = PendingEvents::default();
        let mut mem = SparseMemory::default();
        mem.write(0x100, &[0xaa, 0xbb]).unwrap();
        state.gpr[gpr::RSI] = 0x101;
        state.gpr[gpr::RDI] = 0x201;
        state.rflags |= RFLAGS_DF;

        let instr = Instruction::default();
        let mut cx = ExecContext {
            state: &mut state,
            events: &mut events,
            mem: &mut mem,
        };
        iterate(&mut cx, &instr, StringOp::Movs, 1, AddrSize::A16).unwrap();
        iterate(&mut cx, &instr, StringOp::Movs, 1, AddrSize::A16).unwrap();
        assert_eq!(mem.0.get(&0x200), Some(&0xaa));
        assert_eq!(mem.0.get(&0x201), Some(&0xbb));
        assert_eq!(state.gpr[gpr::RSI], 0xff);
        assert_eq!(state.gpr[gpr::RDI], 0x1ff);
    }

    #[test]
    fn index_registers_wrap_at_address_size() {
        let mut state = ArchState::new();
        state.gpr[gpr::RDI] = 0x1234_ffff;
        step_index(&mut state, gpr::RDI, AddrSize::A16, 1);
        assert_eq!(state.gpr[gpr::RDI], 0x1234_0000);

        state.gpr[gpr::RDI] = 0xdead_beef_ffff_fffe;
        step_index(&mut state, gpr::RDI, AddrSize::A32, 4);
        assert_eq!(state.gpr[gpr::RDI], 0x2);
    }
}
