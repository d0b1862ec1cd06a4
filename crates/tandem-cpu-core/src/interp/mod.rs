//! Reference instruction set built on `iced-x86`.
//!
//! Covers what the dispatch loop needs to be exercised end to end: moves,
//! counters, branches, HLT/CLI/STI, INT3/UD2 and the string instructions
//! with every REP form. Anything else decodes fine but raises #UD when
//! executed.

mod alu;
mod string;

use iced_x86::{Code, ConditionCode, Decoder, DecoderError, DecoderOptions, Instruction, Mnemonic, OpKind};

use crate::exception::{CpuError, Exception};
use crate::isa::{DecodeError, DecodedInstruction, ExecContext, Flow, InstructionSet};
use crate::mode::FetchMode;
use crate::rep::{AddrSize, RepForm, RepMode};
use crate::state::{ArchState, RFLAGS_IF};

pub use string::StringOp;

#[derive(Debug, Clone)]
pub struct Tier0Inst {
    instr: Instruction,
    addr_size: AddrSize,
    string: Option<(StringOp, usize)>,
    rep: Option<RepForm>,
}

impl Tier0Inst {
    pub fn mnemonic(&self) -> Mnemonic {
        self.instr.mnemonic()
    }

    pub fn instruction(&self) -> &Instruction {
        &self.instr
    }

    pub fn addr_size(&self) -> AddrSize {
        self.addr_size
    }
}

impl DecodedInstruction for Tier0Inst {
    fn len(&self) -> u8 {
        self.instr.len() as u8
    }

    fn ends_trace(&self) -> bool {
        self.rep.is_some()
            || matches!(
                self.instr.mnemonic(),
                Mnemonic::Hlt | Mnemonic::Int3 | Mnemonic::Ud2 | Mnemonic::Sti | Mnemonic::Cli
            )
            || self.instr.op0_kind() == OpKind::NearBranch16
            || self.instr.op0_kind() == OpKind::NearBranch32
            || self.instr.op0_kind() == OpKind::NearBranch64
    }

    fn rep(&self) -> Option<RepForm> {
        self.rep
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tier0Isa;

impl InstructionSet for Tier0Isa {
    type Inst = Tier0Inst;

    fn decode(&mut self, bytes: &[u8], rip: u64, mode: FetchMode) -> Result<Tier0Inst, DecodeError> {
        let bitness = mode.bitness();
        let mut decoder = Decoder::with_ip(bitness, bytes, rip, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(match decoder.last_error() {
                DecoderError::NoMoreBytes => DecodeError::Truncated,
                _ => DecodeError::Invalid,
            });
        }

        let addr_size = effective_addr_size(bitness, has_addr_size_override(bytes, bitness));
        let string = string_op(instr.code());
        let rep = string.and_then(|(op, _)| rep_form(&instr, op, addr_size));
        Ok(Tier0Inst {
            instr,
            addr_size,
            string,
            rep,
        })
    }

    fn execute(&mut self, cx: &mut ExecContext<'_>, inst: &Tier0Inst) -> Result<Flow, CpuError> {
        let instr = &inst.instr;
        if let Some((op, size)) = inst.string {
            string::iterate(cx, instr, op, size, inst.addr_size)?;
            return Ok(Flow::Next);
        }

        match instr.mnemonic() {
            Mnemonic::Nop => Ok(Flow::Next),
            Mnemonic::Mov => {
                let value = match instr.op1_kind() {
                    OpKind::Register => cx.state.read_reg(instr.op1_register()),
                    OpKind::Immediate8
                    | OpKind::Immediate16
                    | OpKind::Immediate32
                    | OpKind::Immediate64
                    | OpKind::Immediate32to64 => instr.immediate(1),
                    _ => return Err(Exception::InvalidOpcode.into()),
                };
                if instr.op0_kind() != OpKind::Register {
                    return Err(Exception::InvalidOpcode.into());
                }
                cx.state.write_reg(instr.op0_register(), value);
                Ok(Flow::Next)
            }
            Mnemonic::Inc | Mnemonic::Dec => {
                if instr.op0_kind() != OpKind::Register {
                    return Err(Exception::InvalidOpcode.into());
                }
                let reg = instr.op0_register();
                let bits = reg.size() as u32 * 8;
                let value = cx.state.read_reg(reg);
                let result = if instr.mnemonic() == Mnemonic::Inc {
                    alu::inc(cx.state, value, bits)
                } else {
                    alu::dec(cx.state, value, bits)
                };
                cx.state.write_reg(reg, result);
                Ok(Flow::Next)
            }
            Mnemonic::Jmp => match instr.op0_kind() {
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                    branch(cx.state, instr);
                    Ok(Flow::Branch)
                }
                _ => Err(Exception::InvalidOpcode.into()),
            },
            _ if instr.condition_code() != ConditionCode::None
                && matches!(
                    instr.op0_kind(),
                    OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
                ) =>
            {
                if alu::condition_holds(cx.state, instr.condition_code()) {
                    branch(cx.state, instr);
                    Ok(Flow::Branch)
                } else {
                    Ok(Flow::Next)
                }
            }
            Mnemonic::Hlt => {
                if cx.state.cpl() != 0 {
                    return Err(Exception::gp0().into());
                }
                Ok(Flow::Halt)
            }
            Mnemonic::Cli => {
                check_iopl(cx.state)?;
                cx.state.set_flag(RFLAGS_IF, false);
                Ok(Flow::Next)
            }
            Mnemonic::Sti => {
                check_iopl(cx.state)?;
                if !cx.state.flag(RFLAGS_IF) {
                    cx.events.inhibit_interrupts_for_one_instruction();
                }
                cx.state.set_flag(RFLAGS_IF, true);
                Ok(Flow::Next)
            }
            Mnemonic::Int3 => Err(Exception::Breakpoint.into()),
            _ => Err(Exception::InvalidOpcode.into()),
        }
    }

    fn execute_iteration(
        &mut self,
        cx: &mut ExecContext<'_>,
        inst: &Tier0Inst,
    ) -> Result<(), CpuError> {
        let Some((op, size)) = inst.string else {
            return Err(Exception::InvalidOpcode.into());
        };
        string::iterate(cx, &inst.instr, op, size, inst.addr_size)
    }

    fn disassemble(&self, inst: &Tier0Inst) -> String {
        format!("{:?} @ {:#x}", inst.instr.code(), inst.instr.ip())
    }
}

/// Resolves a relative branch against the advanced RIP rather than the IP the
/// trace was decoded at.
fn branch(state: &mut ArchState, instr: &Instruction) {
    let displacement = instr.near_branch_target().wrapping_sub(instr.next_ip());
    let mut target = state.rip.wrapping_add(displacement);
    if instr.op0_kind() == OpKind::NearBranch16 {
        target &= 0xffff;
    }
    state.rip = target & state.ip_mask();
}

fn check_iopl(state: &ArchState) -> Result<(), Exception> {
    let iopl = ((state.rflags >> 12) & 3) as u8;
    if state.cpl() > iopl {
        return Err(Exception::gp0());
    }
    Ok(())
}

fn has_addr_size_override(bytes: &[u8], bitness: u32) -> bool {
    let mut seen = false;
    for &b in bytes.iter().take(crate::prefetch::MAX_INSTRUCTION_LEN) {
        let is_legacy_prefix = matches!(
            b,
            0xF0 | 0xF2 | 0xF3 // lock/rep
                | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 // segment overrides
                | 0x66 // operand-size override
                | 0x67 // address-size override
        );
        let is_rex = bitness == 64 && (0x40..=0x4F).contains(&b);
        if !(is_legacy_prefix || is_rex) {
            break;
        }
        if b == 0x67 {
            seen = true;
        }
    }
    seen
}

fn effective_addr_size(bitness: u32, address_size_override: bool) -> AddrSize {
    match (bitness, address_size_override) {
        (64, false) => AddrSize::A64,
        (64, true) | (32, false) | (16, true) => AddrSize::A32,
        _ => AddrSize::A16,
    }
}

fn string_op(code: Code) -> Option<(StringOp, usize)> {
    let op = match code {
        Code::Movsb_m8_m8 => (StringOp::Movs, 1),
        Code::Movsw_m16_m16 => (StringOp::Movs, 2),
        Code::Movsd_m32_m32 => (StringOp::Movs, 4),
        Code::Movsq_m64_m64 => (StringOp::Movs, 8),
        Code::Stosb_m8_AL => (StringOp::Stos, 1),
        Code::Stosw_m16_AX => (StringOp::Stos, 2),
        Code::Stosd_m32_EAX => (StringOp::Stos, 4),
        Code::Stosq_m64_RAX => (StringOp::Stos, 8),
        Code::Lodsb_AL_m8 => (StringOp::Lods, 1),
        Code::Lodsw_AX_m16 => (StringOp::Lods, 2),
        Code::Lodsd_EAX_m32 => (StringOp::Lods, 4),
        Code::Lodsq_RAX_m64 => (StringOp::Lods, 8),
        Code::Cmpsb_m8_m8 => (StringOp::Cmps, 1),
        Code::Cmpsw_m16_m16 => (StringOp::Cmps, 2),
        Code::Cmpsd_m32_m32 => (StringOp::Cmps, 4),
        Code::Cmpsq_m64_m64 => (StringOp::Cmps, 8),
        Code::Scasb_AL_m8 => (StringOp::Scas, 1),
        Code::Scasw_AX_m16 => (StringOp::Scas, 2),
        Code::Scasd_EAX_m32 => (StringOp::Scas, 4),
        Code::Scasq_RAX_m64 => (StringOp::Scas, 8),
        _ => return None,
    };
    Some(op)
}

fn rep_form(instr: &Instruction, op: StringOp, addr_size: AddrSize) -> Option<RepForm> {
    let compares = matches!(op, StringOp::Cmps | StringOp::Scas);
    let mode = if instr.has_repne_prefix() {
        if compares {
            RepMode::Repne
        } else {
            RepMode::Rep
        }
    } else if instr.has_rep_prefix() {
        if compares {
            RepMode::Repe
        } else {
            RepMode::Rep
        }
    } else {
        return None;
    };
    Some(RepForm { mode, addr_size })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8], mode: FetchMode) -> Result<Tier0Inst, DecodeError> {
        Tier0Isa.decode(bytes, 0x1000, mode)
    }

    const LONG: FetchMode = FetchMode::IS_64.union(FetchMode::IS_32);

    #[test]
    fn truncated_and_invalid_are_distinguished() {
        // mov eax, imm32 with only two immediate bytes
        assert_eq!(
            decode(&[0xB8, 0x01, 0x02], FetchMode::IS_32).unwrap_err(),
            DecodeError::Truncated
        );
        // 0x06 (push es) is invalid in 64-bit mode
        assert_eq!(decode(&[0x06], LONG).unwrap_err(), DecodeError::Invalid);
    }

    #[test]
    fn rep_forms_follow_prefix_and_operation() {
        let movs = decode(&[0xF3, 0xA4], LONG).unwrap();
        assert_eq!(
            movs.rep(),
            Some(RepForm {
                mode: RepMode::Rep,
                addr_size: AddrSize::A64
            })
        );
        assert!(movs.ends_trace());

        let scas = decode(&[0xF2, 0xAE], FetchMode::IS_32).unwrap();
        assert_eq!(scas.rep().map(|f| f.mode), Some(RepMode::Repne));

        let cmps = decode(&[0x67, 0xF3, 0xA6], FetchMode::IS_32).unwrap();
        assert_eq!(
            cmps.rep(),
            Some(RepForm {
                mode: RepMode::Repe,
                addr_size: AddrSize::A16
            })
        );

        let plain = decode(&[0xAA], FetchMode::empty()).unwrap();
        assert_eq!(plain.rep(), None);
        assert!(!plain.ends_trace());
    }

    #[test]
    fn branches_end_traces() {
        assert!(decode(&[0xEB, 0xFE], LONG).unwrap().ends_trace());
        assert!(decode(&[0x75, 0x02], LONG).unwrap().ends_trace());
        assert!(decode(&[0xF4], LONG).unwrap().ends_trace());
        assert!(!decode(&[0x90], LONG).unwrap().ends_trace());
    }

    #[test]
    fn address_size_override_scan_stops_at_opcode() {
        assert!(has_addr_size_override(&[0x67, 0xA4], 32));
        assert!(has_addr_size_override(&[0xF3, 0x48, 0x67, 0xA5], 64));
        assert!(!has_addr_size_override(&[0xA4, 0x67], 32));
        // REX bytes are opcodes outside 64-bit mode.
        assert!(!has_addr_size_override(&[0x48, 0x67], 32));
    }
}
