//! Guest-visible exceptions, fatal host errors, and the per-instruction outcome.

use thiserror::Error;

/// Architectural exception raised while fetching or executing an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    DivideError,
    /// #DB. `dr6` carries the status bits to merge into DR6 on delivery.
    Debug { dr6: u32, trap: bool },
    Breakpoint,
    InvalidOpcode,
    DeviceNotAvailable,
    StackFault(u16),
    GeneralProtection(u16),
    PageFault { addr: u64, error_code: u32 },
    AlignmentCheck,
}

impl Exception {
    pub const fn gp0() -> Self {
        Exception::GeneralProtection(0)
    }

    pub const fn vector(self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug { .. } => 1,
            Exception::Breakpoint => 3,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
            Exception::AlignmentCheck => 17,
        }
    }

    pub const fn error_code(self) -> Option<u32> {
        match self {
            Exception::StackFault(code) | Exception::GeneralProtection(code) => Some(code as u32),
            Exception::PageFault { error_code, .. } => Some(error_code),
            Exception::AlignmentCheck => Some(0),
            _ => None,
        }
    }

    /// Traps report the address of the *next* instruction; faults report the
    /// faulting one.
    pub const fn is_trap(self) -> bool {
        matches!(
            self,
            Exception::Breakpoint | Exception::Debug { trap: true, .. }
        )
    }
}

/// Host-side failures the guest cannot observe or recover from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("running in bogus memory, paddr={paddr:#x} (memory size {memory_len:#x})")]
    BogusMemory { paddr: u64, memory_len: u64 },
    #[error("host backing vetoed direct read of paddr={paddr:#x}")]
    BackingVetoed { paddr: u64 },
    #[error("no handler for vector {vector:#04x} at rip={rip:#x}")]
    UndeliverableEvent { vector: u8, rip: u64 },
    #[error("triple fault delivering vector {vector:#04x}")]
    TripleFault { vector: u8 },
}

/// Error type of the fetch/execute paths: either the guest sees an exception,
/// or the host cannot continue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("guest exception {0:?}")]
    Exception(Exception),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl From<Exception> for CpuError {
    fn from(e: Exception) -> Self {
        CpuError::Exception(e)
    }
}

/// Result of dispatching a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstOutcome {
    Continue,
    /// The instruction faulted and the exception was handed to the guest.
    FaultRaised(Exception),
    /// The debugger epilog asked the loop to return to its caller.
    StopRequested,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gp_carries_error_code() {
        let e = Exception::gp0();
        assert_eq!(e.vector(), 13);
        assert_eq!(e.error_code(), Some(0));
        assert!(!e.is_trap());
    }

    #[test]
    fn breakpoint_is_trap() {
        assert!(Exception::Breakpoint.is_trap());
        assert!(Exception::Debug { dr6: 0, trap: true }.is_trap());
        assert!(!Exception::Debug { dr6: 1, trap: false }.is_trap());
    }
}
