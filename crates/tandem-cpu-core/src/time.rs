//! Shared time base between instruction execution and the device clock.

/// Counts minimal device-clock ticks and remembers how far the instruction
/// counter had advanced at the last synchronisation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeBase {
    ticks: u64,
    icount_last_sync: u64,
}

impl TimeBase {
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn icount_last_sync(&self) -> u64 {
        self.icount_last_sync
    }

    pub(crate) fn advance(&mut self, ticks: u64) {
        self.ticks = self.ticks.wrapping_add(ticks);
    }

    /// Returns the instruction delta to charge when it exceeds `allowed_delta`.
    pub(crate) fn take_sync_delta(&mut self, icount: u64, allowed_delta: u64) -> Option<u64> {
        let delta = icount.wrapping_sub(self.icount_last_sync);
        if delta > allowed_delta {
            self.icount_last_sync = icount;
            Some(delta)
        } else {
            None
        }
    }
}
