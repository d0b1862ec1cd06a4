//! The seam between the dispatch loop and opcode semantics.

use std::fmt::Debug;

use thiserror::Error;

use crate::events::PendingEvents;
use crate::exception::CpuError;
use crate::linear::LinearMemory;
use crate::mode::FetchMode;
use crate::rep::RepForm;
use crate::state::ArchState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The instruction continues past the supplied bytes.
    #[error("instruction truncated at fetch window boundary")]
    Truncated,
    #[error("invalid instruction encoding")]
    Invalid,
}

/// How control leaves an executed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Next,
    /// RIP was redirected; the trace ends here.
    Branch,
    /// HLT: the CPU waits for an event.
    Halt,
}

pub trait DecodedInstruction: Clone + Debug {
    fn len(&self) -> u8;

    /// Control transfers and serializing instructions close a trace.
    fn ends_trace(&self) -> bool;

    /// Present for REP-prefixed string instructions.
    fn rep(&self) -> Option<RepForm>;
}

/// Everything an execute handler may touch.
pub struct ExecContext<'a> {
    pub state: &'a mut ArchState,
    pub events: &'a mut PendingEvents,
    pub mem: &'a mut dyn LinearMemory,
}

pub trait InstructionSet {
    type Inst: DecodedInstruction;

    fn decode(&mut self, bytes: &[u8], rip: u64, mode: FetchMode) -> Result<Self::Inst, DecodeError>;

    /// Executes a whole instruction. RIP already points past it.
    fn execute(&mut self, cx: &mut ExecContext<'_>, inst: &Self::Inst) -> Result<Flow, CpuError>;

    /// Executes one iteration of a string instruction's body without touching
    /// the count register. Only called for instructions whose
    /// [`DecodedInstruction::rep`] is `Some`.
    fn execute_iteration(
        &mut self,
        cx: &mut ExecContext<'_>,
        inst: &Self::Inst,
    ) -> Result<(), CpuError>;

    fn disassemble(&self, inst: &Self::Inst) -> String {
        format!("{inst:?}")
    }
}
