//! REP/REPE/REPNE iteration.
//!
//! A repeated string instruction retires one body iteration at a time. When an
//! event needs service mid-loop, the iterator rewinds RIP to the start of the
//! instruction and raises `STOP_TRACE`; the count register already reflects the
//! iterations done, so re-executing the instruction later resumes the loop.

use crate::cpu::CpuCore;
use crate::events::AsyncEvent;
use crate::exception::CpuError;
use crate::icache::MAX_TRACE_LENGTH;
use crate::platform::Platform;
use crate::state::{gpr, ArchState};

/// REP loops charge the device clock at most once per this many iterations.
pub const REPEAT_TIME_UPDATE_INTERVAL: u64 = MAX_TRACE_LENGTH as u64 - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrSize {
    A16,
    A32,
    A64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepMode {
    Rep,
    /// F3 on CMPS/SCAS: continue while ZF=1.
    Repe,
    /// F2 on CMPS/SCAS: continue while ZF=0.
    Repne,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RepForm {
    pub mode: RepMode,
    pub addr_size: AddrSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepExit {
    Completed,
    /// Stopped early for an event. RIP was rewound to the instruction.
    Paused,
}

pub fn read_count(state: &ArchState, addr_size: AddrSize) -> u64 {
    let rcx = state.gpr[gpr::RCX];
    match addr_size {
        AddrSize::A16 => rcx & 0xffff,
        AddrSize::A32 => rcx & 0xffff_ffff,
        AddrSize::A64 => rcx,
    }
}

pub fn write_count(state: &mut ArchState, addr_size: AddrSize, value: u64) {
    let rcx = &mut state.gpr[gpr::RCX];
    match addr_size {
        AddrSize::A16 => *rcx = (*rcx & !0xffff) | (value & 0xffff),
        AddrSize::A32 => *rcx = value & 0xffff_ffff,
        AddrSize::A64 => *rcx = value,
    }
}

/// Runs `body` until the count register reaches zero, the REPE/REPNE condition
/// fails, or an event needs service.
///
/// The final iteration is not charged to `icount`; the dispatch loop retires
/// the instruction itself.
pub fn repeat<P, F>(
    core: &mut CpuCore,
    platform: &mut P,
    form: RepForm,
    debugger_attached: bool,
    mut body: F,
) -> Result<RepExit, CpuError>
where
    P: Platform + ?Sized,
    F: FnMut(&mut CpuCore, &mut P) -> Result<(), CpuError>,
{
    loop {
        let count = read_count(&core.state, form.addr_size);
        if count == 0 {
            return Ok(RepExit::Completed);
        }
        body(core, platform)?;
        let count = count - 1;
        write_count(&mut core.state, form.addr_size, count);
        if count == 0 {
            return Ok(RepExit::Completed);
        }
        match form.mode {
            RepMode::Repe if !core.state.zf() => return Ok(RepExit::Completed),
            RepMode::Repne if core.state.zf() => return Ok(RepExit::Completed),
            _ => {}
        }

        if debugger_attached || core.needs_service() {
            break;
        }

        core.icount += 1;
        core.sync_time(platform, REPEAT_TIME_UPDATE_INTERVAL);
    }

    core.state.rip = core.prev_rip;
    core.events.raise(AsyncEvent::STOP_TRACE);
    Ok(RepExit::Paused)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::mem::FlatMemory;
    use crate::platform::SimplePlatform;
    use crate::state::{RFLAGS_IF, RFLAGS_ZF};

    fn core_with_count(count: u64) -> CpuCore {
        let mut state = ArchState::new();
        state.gpr[gpr::RCX] = count;
        state.rip = 0x1002;
        let mut core = CpuCore::new(state, &CoreConfig::default());
        core.prev_rip = 0x1000;
        core
    }

    fn platform() -> SimplePlatform {
        SimplePlatform::new(FlatMemory::new(0x1000))
    }

    const REP64: RepForm = RepForm {
        mode: RepMode::Rep,
        addr_size: AddrSize::A64,
    };

    #[test]
    fn runs_exactly_count_iterations() {
        let mut core = core_with_count(100);
        let mut p = platform();
        let mut iterations = 0u64;
        let exit = repeat(&mut core, &mut p, REP64, false, |_, _| {
            iterations += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(exit, RepExit::Completed);
        assert_eq!(iterations, 100);
        assert_eq!(core.state.gpr[gpr::RCX], 0);
        assert_eq!(core.icount, 99);
        assert_eq!(core.state.rip, 0x1002);
    }

    #[test]
    fn zero_count_skips_body() {
        let mut core = core_with_count(0);
        let mut p = platform();
        let exit = repeat(&mut core, &mut p, REP64, false, |_, _| {
            panic!("body must not run")
        })
        .unwrap();
        assert_eq!(exit, RepExit::Completed);
    }

    #[test]
    fn pending_event_rewinds_rip_and_keeps_progress() {
        let mut core = core_with_count(50);
        core.state.rflags |= RFLAGS_IF;
        let mut p = platform();
        let mut iterations = 0u64;
        let exit = repeat(&mut core, &mut p, REP64, false, |core, _| {
            iterations += 1;
            if iterations == 7 {
                core.events.inject_external_interrupt(0x20);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(exit, RepExit::Paused);
        assert_eq!(iterations, 7);
        assert_eq!(core.state.gpr[gpr::RCX], 43);
        assert_eq!(core.state.rip, 0x1000);
        assert!(core.events.contains(AsyncEvent::STOP_TRACE));
    }

    #[test]
    fn masked_interrupt_does_not_pause() {
        let mut core = core_with_count(10);
        let mut p = platform();
        core.events.inject_external_interrupt(0x20);
        let exit = repeat(&mut core, &mut p, REP64, false, |_, _| Ok(())).unwrap();
        assert_eq!(exit, RepExit::Completed);
        assert_eq!(core.state.gpr[gpr::RCX], 0);
    }

    #[test]
    fn debugger_pauses_every_iteration() {
        let mut core = core_with_count(3);
        let mut p = platform();
        let exit = repeat(&mut core, &mut p, REP64, true, |_, _| Ok(())).unwrap();
        assert_eq!(exit, RepExit::Paused);
        assert_eq!(core.state.gpr[gpr::RCX], 2);
    }

    #[test]
    fn repe_stops_when_zf_clears() {
        let mut core = core_with_count(10);
        core.state.rflags |= RFLAGS_ZF;
        let mut p = platform();
        let form = RepForm {
            mode: RepMode::Repe,
            addr_size: AddrSize::A64,
        };
        let mut iterations = 0;
        repeat(&mut core, &mut p, form, false, |core, _| {
            iterations += 1;
            core.state.set_flag(RFLAGS_ZF, iterations != 4);
            Ok(())
        })
        .unwrap();
        assert_eq!(iterations, 4);
        assert_eq!(core.state.gpr[gpr::RCX], 6);
    }

    #[test]
    fn repne_stops_when_zf_sets() {
        let mut core = core_with_count(10);
        let mut p = platform();
        let form = RepForm {
            mode: RepMode::Repne,
            addr_size: AddrSize::A64,
        };
        let mut iterations = 0;
        repeat(&mut core, &mut p, form, false, |core, _| {
            iterations += 1;
            core.state.set_flag(RFLAGS_ZF, iterations == 2);
            Ok(())
        })
        .unwrap();
        assert_eq!(iterations, 2);
        assert_eq!(core.state.gpr[gpr::RCX], 8);
    }

    #[test]
    fn counter_width_follows_address_size() {
        let mut core = core_with_count(0xdead_0000_0001_0002);
        let mut p = platform();
        let form = RepForm {
            mode: RepMode::Rep,
            addr_size: AddrSize::A16,
        };
        let mut iterations = 0;
        repeat(&mut core, &mut p, form, false, |_, _| {
            iterations += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(iterations, 2);
        assert_eq!(core.state.gpr[gpr::RCX], 0xdead_0000_0001_0000);

        let mut core = core_with_count(0xffff_ffff_0000_0003);
        let form = RepForm {
            mode: RepMode::Rep,
            addr_size: AddrSize::A32,
        };
        repeat(&mut core, &mut p, form, false, |_, _| Ok(())).unwrap();
        assert_eq!(core.state.gpr[gpr::RCX], 0);
    }

    #[test]
    fn time_syncs_on_repeat_cadence() {
        let mut core = core_with_count(64);
        let mut p = platform();
        repeat(&mut core, &mut p, REP64, false, |_, _| Ok(())).unwrap();
        assert_eq!(core.icount, 63);
        // Synced at icount 32, the remaining 31 are below the cadence.
        assert_eq!(core.time.ticks(), 32);
        assert_eq!(p.ticks(), 32);
    }
}
