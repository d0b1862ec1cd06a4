//! CPU bookkeeping that wraps the architectural state.

use crate::config::CoreConfig;
use crate::events::PendingEvents;
use crate::mode::ModeCache;
use crate::platform::Platform;
use crate::state::ArchState;
use crate::time::TimeBase;

#[derive(Debug, Clone)]
pub struct CpuCore {
    pub state: ArchState,
    pub events: PendingEvents,
    pub time: TimeBase,
    pub mode: ModeCache,
    /// Instructions retired, REP iterations included.
    pub icount: u64,
    /// RIP of the instruction currently executing; after it commits, RIP of
    /// the next one.
    pub prev_rip: u64,
    pub(crate) single_processor: bool,
    avx_configured: bool,
}

impl CpuCore {
    pub fn new(state: ArchState, config: &CoreConfig) -> Self {
        let mode = ModeCache::new(&state, config.avx);
        let prev_rip = state.rip;
        Self {
            state,
            events: PendingEvents::default(),
            time: TimeBase::default(),
            mode,
            icount: 0,
            prev_rip,
            single_processor: config.single_processor(),
            avx_configured: config.avx,
        }
    }

    pub fn avx_configured(&self) -> bool {
        self.avx_configured
    }

    pub fn needs_service(&self) -> bool {
        self.events.needs_service(self.state.rflags)
    }

    /// Charges retired instructions to the device clock once more than
    /// `allowed_delta` accumulated since the last sync.
    pub fn sync_time<P: Platform + ?Sized>(&mut self, platform: &mut P, allowed_delta: u64) {
        if !self.single_processor {
            return;
        }
        if let Some(delta) = self.time.take_sync_delta(self.icount, allowed_delta) {
            self.advance_clock(platform, delta);
        }
    }

    /// One minimal device tick.
    pub fn tick_device<P: Platform + ?Sized>(&mut self, platform: &mut P) {
        self.advance_clock(platform, 1);
    }

    fn advance_clock<P: Platform + ?Sized>(&mut self, platform: &mut P, ticks: u64) {
        self.time.advance(ticks);
        self.state.msr.tsc = self.state.msr.tsc.wrapping_add(ticks);
        platform.tick_devices(ticks, &mut self.events);
    }
}
