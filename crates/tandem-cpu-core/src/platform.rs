//! The machine around the CPU: memory, page walks, devices, event delivery.
//!
//! The execution core never implements these itself. [`SimplePlatform`] is a
//! minimal machine (identity paging with per-page overrides, a periodic timer
//! and a flat vector table)
//! used by the standalone runner and the tests.

use std::collections::HashMap;

use tracing::{trace, warn};

use crate::events::{DeliveredEvent, PendingEvents};
use crate::exception::{Exception, FatalError};
use crate::mem::{AccessType, FlatMemory, MemoryBacking, PAGE_MASK};
use crate::state::{ArchState, RFLAGS_IF};
use crate::tlb::TlbAccess;

/// Snapshot of the registers a page walk depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagingContext {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub cpl: u8,
}

impl PagingContext {
    pub fn from_state(state: &ArchState) -> Self {
        Self {
            cr0: state.control.cr0,
            cr3: state.control.cr3,
            cr4: state.control.cr4,
            efer: state.msr.efer,
            cpl: state.cpl(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub paddr: u64,
    pub access: TlbAccess,
}

pub trait Platform: MemoryBacking {
    /// Full linear-to-physical walk. The default is identity mapping with all
    /// rights granted, i.e. paging disabled.
    fn translate_linear(
        &mut self,
        _paging: &PagingContext,
        laddr: u64,
        _access: AccessType,
    ) -> Result<Translation, Exception> {
        Ok(Translation {
            paddr: laddr,
            access: TlbAccess::all(),
        })
    }

    /// Advances device models by `ticks` minimal units. Devices raise
    /// interrupts through `events`.
    fn tick_devices(&mut self, ticks: u64, events: &mut PendingEvents);

    /// Ticks until the next scheduled device event.
    fn ticks_to_next_event(&self) -> u64 {
        u64::MAX
    }

    /// Hands an exception or interrupt to the guest. On success the handler
    /// entry is loaded into `state`.
    fn deliver_event(
        &mut self,
        state: &mut ArchState,
        event: DeliveredEvent,
    ) -> Result<(), FatalError>;
}

#[derive(Debug, Clone, Copy)]
struct PeriodicTimer {
    period: u64,
    vector: u8,
    countdown: u64,
}

#[derive(Debug, Clone)]
pub struct SimplePlatform {
    pub memory: FlatMemory,
    timer: Option<PeriodicTimer>,
    /// Linear page to physical page, consulted before the identity mapping.
    pages: HashMap<u64, u64>,
    handlers: HashMap<u8, u64>,
    delivered: Vec<DeliveredEvent>,
    ticks: u64,
}

impl SimplePlatform {
    pub fn new(memory: FlatMemory) -> Self {
        Self {
            memory,
            timer: None,
            pages: HashMap::new(),
            handlers: HashMap::new(),
            delivered: Vec::new(),
            ticks: 0,
        }
    }

    /// Raises `vector` every `period` ticks.
    pub fn with_timer(mut self, period: u64, vector: u8) -> Self {
        let period = period.max(1);
        self.timer = Some(PeriodicTimer {
            period,
            vector,
            countdown: period,
        });
        self
    }

    /// Maps the linear page holding `laddr` onto the physical page holding
    /// `paddr`. Cached translations are the caller's to invalidate.
    pub fn map_page(&mut self, laddr: u64, paddr: u64) {
        self.pages.insert(laddr & PAGE_MASK, paddr & PAGE_MASK);
    }

    /// Handler entry point (an RIP value) for a vector.
    pub fn set_handler(&mut self, vector: u8, rip: u64) {
        self.handlers.insert(vector, rip);
    }

    pub fn delivered(&self) -> &[DeliveredEvent] {
        &self.delivered
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

impl MemoryBacking for SimplePlatform {
    fn memory_len(&self) -> u64 {
        self.memory.memory_len()
    }

    fn host_page(&mut self, paddr: u64, access: AccessType) -> Option<&mut [u8]> {
        self.memory.host_page(paddr, access)
    }
}

impl Platform for SimplePlatform {
    fn translate_linear(
        &mut self,
        _paging: &PagingContext,
        laddr: u64,
        _access: AccessType,
    ) -> Result<Translation, Exception> {
        let page = self.pages.get(&(laddr & PAGE_MASK)).copied();
        Ok(Translation {
            paddr: page.map_or(laddr, |base| base | (laddr & !PAGE_MASK)),
            access: TlbAccess::all(),
        })
    }

    fn tick_devices(&mut self, ticks: u64, events: &mut PendingEvents) {
        self.ticks = self.ticks.wrapping_add(ticks);
        let Some(timer) = self.timer.as_mut() else {
            return;
        };
        let mut remaining = ticks;
        while remaining > 0 {
            let step = remaining.min(timer.countdown);
            timer.countdown -= step;
            remaining -= step;
            if timer.countdown == 0 {
                trace!(vector = timer.vector, "timer fired");
                events.inject_external_interrupt(timer.vector);
                timer.countdown = timer.period;
            }
        }
    }

    fn ticks_to_next_event(&self) -> u64 {
        self.timer.map_or(u64::MAX, |t| t.countdown)
    }

    fn deliver_event(
        &mut self,
        state: &mut ArchState,
        event: DeliveredEvent,
    ) -> Result<(), FatalError> {
        self.delivered.push(event);
        let vector = event.vector();
        let Some(&handler) = self.handlers.get(&vector) else {
            warn!(vector, rip = event.rip(), "no handler installed");
            return Err(FatalError::UndeliverableEvent {
                vector,
                rip: event.rip(),
            });
        };
        if matches!(event, DeliveredEvent::Interrupt { .. }) {
            state.rflags &= !RFLAGS_IF;
        }
        state.rip = handler;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AsyncEvent;

    #[test]
    fn timer_fires_every_period() {
        let mut platform = SimplePlatform::new(FlatMemory::new(0x1000)).with_timer(3, 0x20);
        let mut events = PendingEvents::default();
        platform.tick_devices(2, &mut events);
        assert!(!events.contains(AsyncEvent::INTR));
        assert_eq!(platform.ticks_to_next_event(), 1);
        platform.tick_devices(7, &mut events);
        assert_eq!(events.external_interrupts().count(), 3);
        assert_eq!(platform.ticks(), 9);
    }

    #[test]
    fn mapped_pages_override_identity() {
        let mut platform = SimplePlatform::new(FlatMemory::new(0x8000));
        platform.map_page(0x2abc, 0x4000);
        let paging = PagingContext::default();
        let moved = platform
            .translate_linear(&paging, 0x2123, AccessType::Execute)
            .unwrap();
        assert_eq!(moved.paddr, 0x4123);
        let identity = platform
            .translate_linear(&paging, 0x3123, AccessType::Read)
            .unwrap();
        assert_eq!(identity.paddr, 0x3123);
    }

    #[test]
    fn missing_handler_is_fatal() {
        let mut platform = SimplePlatform::new(FlatMemory::new(0x1000));
        let mut state = ArchState::new();
        let err = platform
            .deliver_event(&mut state, DeliveredEvent::Nmi { rip: 0x10 })
            .unwrap_err();
        assert_eq!(err, FatalError::UndeliverableEvent { vector: 2, rip: 0x10 });
    }
}
