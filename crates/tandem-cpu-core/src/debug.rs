//! Debugger and tracing hook points.
//!
//! Breakpoint storage and the interactive UI live outside the core; the loop
//! only calls into this trait at fixed points.

use crate::state::ArchState;

pub trait DebugHooks {
    /// An attached debugger makes REP loops pause after every iteration.
    fn attached(&self) -> bool {
        false
    }

    fn before_execution(&mut self, _state: &ArchState) {}

    fn after_execution(&mut self, _state: &ArchState) {}

    /// Post-instruction check. Returning `true` stops the loop.
    fn instruction_epilog(&mut self, _state: &ArchState, _icount: u64) -> bool {
        false
    }

    /// Debugger-owned code breakpoint at `laddr`, as DR6 status bits.
    fn code_breakpoint(&mut self, _laddr: u64) -> Option<u32> {
        None
    }

    /// Log each instruction's disassembly at `trace` level.
    fn trace_enabled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoDebugger;

impl DebugHooks for NoDebugger {}
