//! Async event flag set and the controller that services it at instruction
//! boundaries.
//!
//! Devices and the debugger only ever *raise* events. Servicing (delivering an
//! interrupt, a debug trap, waking from HLT) happens in
//! [`handle_async_event`], which the dispatch loop calls whenever the flag set
//! needs attention.

use std::collections::VecDeque;

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::exception::{Exception, FatalError};
use crate::platform::Platform;
use crate::state::{ArchState, RFLAGS_IF};

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct AsyncEvent: u32 {
        /// An external interrupt vector is queued.
        const INTR = 1 << 0;
        const NMI = 1 << 1;
        /// Accumulated #DB trap bits wait for the next boundary.
        const DEBUG_TRAP = 1 << 2;
        /// The CPU executed HLT and waits for an interrupt.
        const HALT = 1 << 3;
        /// The host or debugger asked the loop to return.
        const RETURN_REQUESTED = 1 << 4;
        /// Single-shot marker: leave the current trace and resume later.
        const STOP_TRACE = 1 << 31;
    }
}

/// Maximum queued external interrupts before the oldest is dropped.
pub const MAX_EXTERNAL_INTERRUPTS: usize = 256;

/// Event delivered to the guest through [`Platform::deliver_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveredEvent {
    Exception { exception: Exception, rip: u64 },
    Interrupt { vector: u8, rip: u64 },
    Nmi { rip: u64 },
}

impl DeliveredEvent {
    pub fn vector(&self) -> u8 {
        match *self {
            DeliveredEvent::Exception { exception, .. } => exception.vector(),
            DeliveredEvent::Interrupt { vector, .. } => vector,
            DeliveredEvent::Nmi { .. } => 2,
        }
    }

    pub fn rip(&self) -> u64 {
        match *self {
            DeliveredEvent::Exception { rip, .. }
            | DeliveredEvent::Interrupt { rip, .. }
            | DeliveredEvent::Nmi { rip } => rip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnReason {
    Halted,
    Requested,
    DebuggerStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDecision {
    Continue,
    ReturnToCaller(ReturnReason),
}

/// Which step primitive is servicing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceContext {
    Cpu,
    /// The device clock keeps ticking while the CPU is halted.
    Device,
}

#[derive(Debug, Clone, Default)]
pub struct PendingEvents {
    flags: AsyncEvent,
    external_interrupts: VecDeque<u8>,
    debug_trap: u32,
    interrupt_inhibit: u8,
    /// A code breakpoint lies on the current fetch page.
    pub code_breakpoint_assist: bool,
    inhibit_debug: bool,
}

impl PendingEvents {
    pub fn flags(&self) -> AsyncEvent {
        self.flags
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn contains(&self, event: AsyncEvent) -> bool {
        self.flags.contains(event)
    }

    pub fn raise(&mut self, event: AsyncEvent) {
        self.flags |= event;
    }

    pub fn clear(&mut self, event: AsyncEvent) {
        self.flags &= !event;
    }

    pub fn inject_external_interrupt(&mut self, vector: u8) {
        if self.external_interrupts.len() >= MAX_EXTERNAL_INTERRUPTS {
            self.external_interrupts.pop_front();
        }
        self.external_interrupts.push_back(vector);
        self.flags |= AsyncEvent::INTR;
    }

    pub fn external_interrupts(&self) -> impl Iterator<Item = &u8> {
        self.external_interrupts.iter()
    }

    pub fn raise_debug_trap(&mut self, dr6: u32) {
        self.debug_trap |= dr6;
        self.flags |= AsyncEvent::DEBUG_TRAP;
    }

    pub fn halt(&mut self) {
        self.flags |= AsyncEvent::HALT;
    }

    pub fn halted(&self) -> bool {
        self.flags.contains(AsyncEvent::HALT)
    }

    pub fn request_return(&mut self) {
        self.flags |= AsyncEvent::RETURN_REQUESTED;
    }

    /// MOV SS / STI shadow: block maskable interrupts for one instruction.
    /// Called while the shadowing instruction executes, so it survives that
    /// instruction's own retirement.
    pub fn inhibit_interrupts_for_one_instruction(&mut self) {
        self.interrupt_inhibit = 2;
    }

    pub fn interrupts_inhibited(&self) -> bool {
        self.interrupt_inhibit != 0
    }

    pub fn set_inhibit_debug(&mut self, inhibit: bool) {
        self.inhibit_debug = inhibit;
    }

    pub fn debug_inhibited(&self) -> bool {
        self.inhibit_debug || self.interrupt_inhibit != 0
    }

    /// Ages the interrupt shadow. Called once per retired instruction.
    pub fn retire_instruction(&mut self) {
        self.interrupt_inhibit = self.interrupt_inhibit.saturating_sub(1);
        self.inhibit_debug = false;
    }

    /// True when something pending ends a HLT: a deliverable interrupt, an
    /// NMI or a debug trap.
    pub fn wakes_from_halt(&self, rflags: u64) -> bool {
        self.flags.intersects(AsyncEvent::NMI | AsyncEvent::DEBUG_TRAP)
            || self.intr_deliverable(rflags)
    }

    fn intr_deliverable(&self, rflags: u64) -> bool {
        self.contains(AsyncEvent::INTR) && rflags & RFLAGS_IF != 0 && !self.interrupts_inhibited()
    }

    /// True when a pending event can make progress right now. A queued
    /// interrupt behind IF=0 or an interrupt shadow does not count, and
    /// neither does the stop-trace marker.
    pub fn needs_service(&self, rflags: u64) -> bool {
        let mut active = self.flags - AsyncEvent::STOP_TRACE;
        if rflags & RFLAGS_IF == 0 || self.interrupts_inhibited() {
            active -= AsyncEvent::INTR;
        }
        !active.is_empty()
    }
}

/// Services pending events. Delivery itself is delegated to the platform.
pub fn handle_async_event<P: Platform + ?Sized>(
    state: &mut ArchState,
    events: &mut PendingEvents,
    platform: &mut P,
    context: ServiceContext,
) -> Result<EventDecision, FatalError> {
    if events.contains(AsyncEvent::RETURN_REQUESTED) {
        events.clear(AsyncEvent::RETURN_REQUESTED);
        return Ok(EventDecision::ReturnToCaller(ReturnReason::Requested));
    }

    let intr_deliverable = events.intr_deliverable(state.rflags);

    if events.halted() {
        if !events.wakes_from_halt(state.rflags) {
            return Ok(match context {
                ServiceContext::Cpu => EventDecision::ReturnToCaller(ReturnReason::Halted),
                ServiceContext::Device => EventDecision::Continue,
            });
        }
        debug!(rip = state.rip, "leaving halt state");
        events.clear(AsyncEvent::HALT);
    }

    let rip = state.rip;
    if events.contains(AsyncEvent::DEBUG_TRAP) {
        let dr6 = std::mem::take(&mut events.debug_trap);
        events.clear(AsyncEvent::DEBUG_TRAP);
        state.debug.dr6 |= u64::from(dr6);
        let exception = Exception::Debug { dr6, trap: true };
        platform.deliver_event(state, DeliveredEvent::Exception { exception, rip })?;
    } else if events.contains(AsyncEvent::NMI) {
        events.clear(AsyncEvent::NMI);
        platform.deliver_event(state, DeliveredEvent::Nmi { rip })?;
    } else if intr_deliverable {
        match events.external_interrupts.pop_front() {
            Some(vector) => {
                trace!(vector, rip, "delivering external interrupt");
                platform.deliver_event(state, DeliveredEvent::Interrupt { vector, rip })?;
            }
            None => debug!("spurious INTR with empty queue"),
        }
        if events.external_interrupts.is_empty() {
            events.clear(AsyncEvent::INTR);
        }
    }

    Ok(EventDecision::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_trace_alone_needs_no_service() {
        let mut events = PendingEvents::default();
        events.raise(AsyncEvent::STOP_TRACE);
        assert!(!events.is_empty());
        assert!(!events.needs_service(RFLAGS_IF));
    }

    #[test]
    fn masked_interrupt_needs_no_service() {
        let mut events = PendingEvents::default();
        events.inject_external_interrupt(0x20);
        assert!(!events.needs_service(0));
        assert!(events.needs_service(RFLAGS_IF));

        // STI retires, then the shadowed instruction retires.
        events.inhibit_interrupts_for_one_instruction();
        assert!(!events.needs_service(RFLAGS_IF));
        events.retire_instruction();
        assert!(!events.needs_service(RFLAGS_IF));
        events.retire_instruction();
        assert!(events.needs_service(RFLAGS_IF));
    }

    #[test]
    fn halt_wakes_only_on_deliverable_events() {
        let mut events = PendingEvents::default();
        events.halt();
        assert!(!events.wakes_from_halt(RFLAGS_IF));
        events.inject_external_interrupt(0x20);
        assert!(!events.wakes_from_halt(0));
        assert!(events.wakes_from_halt(RFLAGS_IF));
        events.raise(AsyncEvent::NMI);
        assert!(events.wakes_from_halt(0));
    }

    #[test]
    fn external_queue_is_bounded() {
        let mut events = PendingEvents::default();
        for i in 0..(MAX_EXTERNAL_INTERRUPTS + 4) {
            events.inject_external_interrupt(i as u8);
        }
        assert_eq!(events.external_interrupts().count(), MAX_EXTERNAL_INTERRUPTS);
        assert_eq!(events.external_interrupts().next(), Some(&4));
    }
}
