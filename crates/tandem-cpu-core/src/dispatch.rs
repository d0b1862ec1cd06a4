//! The dispatch loop and its two step primitives.
//!
//! [`Emulator::step_cpu`] executes guest instructions out of the trace cache;
//! [`Emulator::step_device`] advances only the device clock. Both check the
//! async event set before every unit of work and may return early without
//! consuming the rest of the budget.
//!
//! Faults never unwind: instruction execution returns [`CpuError`], the loop
//! hands guest exceptions to the platform and reports
//! [`InstOutcome::FaultRaised`], and fatal errors propagate to the caller.

use tracing::{debug, error, trace};

use crate::config::{ConfigError, CoreConfig};
use crate::context::{self, ContextRecord};
use crate::cpu::CpuCore;
use crate::debug::{DebugHooks, NoDebugger};
use crate::events::{
    handle_async_event, AsyncEvent, DeliveredEvent, EventDecision, ReturnReason, ServiceContext,
};
use crate::exception::{CpuError, Exception, FatalError, InstOutcome};
use crate::icache::{ICache, ICacheStats, LinkDepth, TraceId, TraceKey, MAX_TRACE_LENGTH};
use crate::isa::{DecodeError, DecodedInstruction, ExecContext, Flow, InstructionSet};
use crate::linear::LinearBus;
use crate::mem::AccessType;
use crate::platform::{PagingContext, Platform};
use crate::prefetch::{boundary_fetch, prefetch, window_bytes, FetchWindow};
use crate::rep::{self, RepExit};
use crate::state::{ArchState, RFLAGS_IF};
use crate::tlb::Tlb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchExit {
    /// The whole budget was used.
    Completed,
    Returned(ReturnReason),
}

/// `executed` counts instructions for [`Emulator::step_cpu`] and device ticks
/// for [`Emulator::step_device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    pub executed: u64,
    pub exit: BatchExit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    InstructionLimit,
    /// Halted with nothing left that could wake the CPU.
    Idle,
    Requested,
    DebuggerStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub instructions: u64,
    pub ticks: u64,
    pub exit: RunExit,
}

/// Position of the next instruction inside a cached trace.
#[derive(Debug, Clone, Copy)]
struct TraceCursor {
    trace: TraceId,
    index: usize,
    generation: u32,
    rip: u64,
}

pub struct Emulator<I: InstructionSet, P: Platform> {
    core: CpuCore,
    tlb: Tlb,
    window: FetchWindow,
    icache: ICache<I::Inst>,
    cursor: Option<TraceCursor>,
    link_depth: LinkDepth,
    isa: I,
    platform: P,
    debug: Box<dyn DebugHooks>,
    config: CoreConfig,
    fetch_buf: Vec<u8>,
}

impl<I: InstructionSet, P: Platform> Emulator<I, P> {
    /// Validates the startup configuration and builds a CPU around `state`.
    pub fn new(
        config: CoreConfig,
        state: ArchState,
        isa: I,
        platform: P,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            core: CpuCore::new(state, &config),
            tlb: Tlb::new(),
            window: FetchWindow::default(),
            icache: ICache::default(),
            cursor: None,
            link_depth: LinkDepth::default(),
            isa,
            platform,
            debug: Box::new(NoDebugger),
            config,
            fetch_buf: Vec::new(),
        })
    }

    pub fn set_debugger(&mut self, hooks: Box<dyn DebugHooks>) {
        self.debug = hooks;
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn core(&self) -> &CpuCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut CpuCore {
        &mut self.core
    }

    pub fn state(&self) -> &ArchState {
        &self.core.state
    }

    /// Direct state access. Call [`Self::state_changed`] after touching
    /// control registers, EFER, XCR0, RFLAGS or CS.
    pub fn state_mut(&mut self) -> &mut ArchState {
        &mut self.core.state
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn icache_stats(&self) -> &ICacheStats {
        self.icache.stats()
    }

    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    /// Re-runs the mode-change handlers and drops every fetch shortcut.
    pub fn state_changed(&mut self) {
        self.core.mode.refresh(&self.core.state);
        self.core.prev_rip = self.core.state.rip;
        self.window.invalidate();
        self.icache.invalidate_links();
        self.cursor = None;
    }

    /// Paging state changed outside the core.
    pub fn invalidate_translations(&mut self) {
        self.tlb.flush();
        self.window.invalidate();
        self.icache.invalidate_links();
        self.cursor = None;
    }

    /// Guest code was modified outside the core.
    pub fn invalidate_code(&mut self) {
        self.icache.flush();
        self.cursor = None;
    }

    pub fn export_context(&self) -> ContextRecord {
        context::export_context(&self.core.state)
    }

    /// Replaces the architectural state and re-derives every cached mode.
    pub fn import_context(&mut self, record: &ContextRecord) {
        context::import_context(record, &mut self.core.state);
        self.state_changed();
    }

    pub fn memory_backing(&mut self, paddr: u64, access: AccessType) -> Option<&mut [u8]> {
        self.platform.host_page(paddr, access)
    }

    /// Executes up to `steps` dispatches. Without trace chaining one dispatch
    /// is one instruction; with it, one trace plus any linked successors.
    pub fn step_cpu(&mut self, steps: u64) -> Result<BatchResult, FatalError> {
        // Nothing cached about translations survives an external engine's run.
        self.invalidate_translations();
        let start = self.core.icount;
        let exit = self.cpu_loop(steps);
        self.invalidate_translations();
        Ok(BatchResult {
            executed: self.core.icount - start,
            exit: exit?,
        })
    }

    /// Advances the device clock by `steps` minimal ticks, one at a time.
    pub fn step_device(&mut self, steps: u64) -> Result<BatchResult, FatalError> {
        let start = self.core.time.ticks();
        let mut steps = steps;
        while steps > 0 {
            if !self.core.events.is_empty() {
                if let EventDecision::ReturnToCaller(reason) =
                    self.service_events(ServiceContext::Device)?
                {
                    return Ok(BatchResult {
                        executed: self.core.time.ticks() - start,
                        exit: BatchExit::Returned(reason),
                    });
                }
            }
            self.core.tick_device(&mut self.platform);
            steps -= 1;
        }
        Ok(BatchResult {
            executed: self.core.time.ticks() - start,
            exit: BatchExit::Completed,
        })
    }

    /// Standalone driver: alternates CPU slices with device ticks while the
    /// CPU is halted, the way an accelerated engine would.
    pub fn run(&mut self, max_instructions: u64, slice: u64) -> Result<RunSummary, FatalError> {
        let slice = slice.max(1);
        let start_icount = self.core.icount;
        let start_ticks = self.core.time.ticks();
        let summary = |emu: &Self, exit| RunSummary {
            instructions: emu.core.icount - start_icount,
            ticks: emu.core.time.ticks() - start_ticks,
            exit,
        };

        let mut idle_ticks = 0u64;
        loop {
            let retired = self.core.icount - start_icount;
            if retired >= max_instructions {
                return Ok(summary(self, RunExit::InstructionLimit));
            }
            let result = self.step_cpu(slice.min(max_instructions - retired))?;
            match result.exit {
                BatchExit::Completed => {}
                BatchExit::Returned(ReturnReason::Halted) => {
                    let next_event = self.platform.ticks_to_next_event();
                    let interrupts_on = self.core.state.flag(RFLAGS_IF);
                    let can_wake = self.core.events.wakes_from_halt(self.core.state.rflags)
                        || (next_event != u64::MAX && interrupts_on);
                    if !can_wake || idle_ticks >= max_instructions {
                        debug!(rip = self.core.state.rip, "halted with no wake source");
                        return Ok(summary(self, RunExit::Idle));
                    }
                    let ticks = next_event.clamp(1, slice);
                    idle_ticks += self.step_device(ticks)?.executed;
                }
                BatchExit::Returned(ReturnReason::Requested) => {
                    return Ok(summary(self, RunExit::Requested));
                }
                BatchExit::Returned(ReturnReason::DebuggerStop) => {
                    return Ok(summary(self, RunExit::DebuggerStop));
                }
            }
        }
    }

    fn cpu_loop(&mut self, mut steps: u64) -> Result<BatchExit, FatalError> {
        while steps > 0 {
            steps -= 1;

            if !self.core.events.is_empty() {
                if let EventDecision::ReturnToCaller(reason) =
                    self.service_events(ServiceContext::Cpu)?
                {
                    return Ok(BatchExit::Returned(reason));
                }
            }

            let outcome = if self.config.trace_chaining {
                self.dispatch_trace()?
            } else {
                self.dispatch_one()?
            };

            // Single-shot: set by REP pauses, meaningful for one boundary only.
            self.core.events.clear(AsyncEvent::STOP_TRACE);

            if outcome == InstOutcome::StopRequested {
                return Ok(BatchExit::Returned(ReturnReason::DebuggerStop));
            }
        }
        Ok(BatchExit::Completed)
    }

    fn service_events(&mut self, context: ServiceContext) -> Result<EventDecision, FatalError> {
        let rip = self.core.state.rip;
        let cs = self.core.state.segments.cs;
        let decision = handle_async_event(
            &mut self.core.state,
            &mut self.core.events,
            &mut self.platform,
            context,
        )?;
        if self.core.state.rip != rip || self.core.state.segments.cs != cs {
            // An event was delivered; fetch restarts at the handler.
            self.core.mode.handle_cpu_mode_change(&self.core.state);
            self.core.prev_rip = self.core.state.rip;
            self.window.invalidate();
            self.cursor = None;
        }
        Ok(decision)
    }

    /// Executes one instruction, continuing inside the current trace when
    /// possible.
    fn dispatch_one(&mut self) -> Result<InstOutcome, FatalError> {
        let generation = self.icache.generation();
        let rip = self.core.state.rip;
        let resume = self
            .cursor
            .take()
            .filter(|c| c.generation == generation && c.rip == rip);

        let (trace, index) = match resume {
            Some(cursor) => (cursor.trace, cursor.index),
            None => match self.get_icache_entry() {
                Ok(id) => (id, 0),
                Err(CpuError::Exception(e)) => return self.fault(e),
                Err(CpuError::Fatal(f)) => return Err(f),
            },
        };

        let entry = self.icache.trace(trace);
        let len = entry.len();
        let inst = entry.insts()[index].clone();

        let (outcome, sequential) = self.execute_instruction(&inst)?;
        if sequential && index + 1 < len && self.core.events.is_empty() {
            self.cursor = Some(TraceCursor {
                trace,
                index: index + 1,
                generation,
                rip: self.core.state.rip,
            });
        }
        Ok(outcome)
    }

    /// Executes a whole trace, then follows links while nothing is pending.
    fn dispatch_trace(&mut self) -> Result<InstOutcome, FatalError> {
        let mut trace = match self.get_icache_entry() {
            Ok(id) => id,
            Err(CpuError::Exception(e)) => return self.fault(e),
            Err(CpuError::Fatal(f)) => return Err(f),
        };
        self.link_depth.reset();

        loop {
            let len = self.icache.trace(trace).len();
            for index in 0..len {
                let inst = self.icache.trace(trace).insts()[index].clone();
                let (outcome, sequential) = self.execute_instruction(&inst)?;
                if outcome != InstOutcome::Continue || !self.core.events.is_empty() {
                    return Ok(outcome);
                }
                if !sequential {
                    break;
                }
            }

            match self.link_trace(trace)? {
                Some(next) => trace = next,
                None => return Ok(InstOutcome::Continue),
            }
        }
    }

    /// Resolves the trace at RIP as a direct successor of `from`. Only cache
    /// hits are linked.
    fn link_trace(&mut self, from: TraceId) -> Result<Option<TraceId>, FatalError> {
        if !self.config.trace_linking || !self.core.single_processor {
            return Ok(None);
        }
        if !self.core.events.is_empty() || !self.link_depth.enter() {
            self.link_depth.reset();
            return Ok(None);
        }
        let since_sync = self.core.icount - self.core.time.icount_last_sync();
        if since_sync >= self.platform.ticks_to_next_event() {
            return Ok(None);
        }

        let rip = self.core.state.rip;
        if let Some(next) = self.icache.linked_successor(from, rip) {
            self.note_link_followed();
            return Ok(Some(next));
        }

        if !self.window.contains(rip) {
            self.icache.stats_mut().prefetches += 1;
            match prefetch(
                &mut self.core,
                &mut self.tlb,
                &mut self.platform,
                self.debug.as_mut(),
                &mut self.window,
            ) {
                Ok(()) => {}
                // Raised again by the next regular fetch.
                Err(CpuError::Exception(_)) => {
                    self.window.invalidate();
                    return Ok(None);
                }
                Err(CpuError::Fatal(f)) => return Err(f),
            }
        }
        let rip = self.core.state.rip;
        let key = TraceKey {
            paddr: self.window.paddr_of(rip),
            mode: self.core.mode.fetch_mode,
        };
        let Some(next) = self.icache.lookup(key) else {
            return Ok(None);
        };
        self.icache.link(from, next, rip);
        self.note_link_followed();
        Ok(Some(next))
    }

    fn note_link_followed(&mut self) {
        let depth = self.link_depth.get();
        let stats = self.icache.stats_mut();
        stats.links_followed += 1;
        stats.max_link_depth = stats.max_link_depth.max(depth);
    }

    fn get_icache_entry(&mut self) -> Result<TraceId, CpuError> {
        if !self.window.contains(self.core.state.rip) {
            self.icache.stats_mut().prefetches += 1;
            prefetch(
                &mut self.core,
                &mut self.tlb,
                &mut self.platform,
                self.debug.as_mut(),
                &mut self.window,
            )?;
        }
        let rip = self.core.state.rip;
        let key = TraceKey {
            paddr: self.window.paddr_of(rip),
            mode: self.core.mode.fetch_mode,
        };
        match self.icache.lookup(key) {
            Some(id) => Ok(id),
            None => self.serve_icache_miss(key, rip),
        }
    }

    fn serve_icache_miss(&mut self, key: TraceKey, rip: u64) -> Result<TraceId, CpuError> {
        let mut bytes = std::mem::take(&mut self.fetch_buf);
        let decoded = self.decode_trace(key, rip, &mut bytes);
        self.fetch_buf = bytes;
        let insts = decoded?;
        trace!(rip, paddr = key.paddr, len = insts.len(), "decoded trace");
        Ok(self.icache.insert(key, insts))
    }

    fn decode_trace(
        &mut self,
        key: TraceKey,
        rip: u64,
        bytes: &mut Vec<u8>,
    ) -> Result<Vec<I::Inst>, CpuError> {
        window_bytes(&mut self.platform, &self.window, rip, bytes)?;

        let mut insts = Vec::new();
        let mut offset = 0usize;
        let mut ip = rip;
        while insts.len() < MAX_TRACE_LENGTH && offset < bytes.len() {
            match self.isa.decode(&bytes[offset..], ip, key.mode) {
                Ok(inst) => {
                    let len = usize::from(inst.len());
                    let ends = inst.ends_trace();
                    insts.push(inst);
                    offset += len;
                    ip = ip.wrapping_add(len as u64);
                    if ends {
                        break;
                    }
                }
                Err(DecodeError::Truncated) if insts.is_empty() => {
                    let spanning = boundary_fetch(
                        &self.core,
                        &mut self.tlb,
                        &mut self.platform,
                        &self.window,
                        rip,
                    )?;
                    let inst = self
                        .isa
                        .decode(&spanning, rip, key.mode)
                        .map_err(|_| Exception::InvalidOpcode)?;
                    insts.push(inst);
                    break;
                }
                Err(DecodeError::Invalid) if insts.is_empty() => {
                    return Err(Exception::InvalidOpcode.into());
                }
                // The rest starts a new trace.
                Err(_) => break,
            }
        }
        if insts.is_empty() {
            return Err(Exception::InvalidOpcode.into());
        }
        Ok(insts)
    }

    /// Runs one instruction. The boolean is true when execution continues at
    /// the next sequential instruction of the same trace.
    fn execute_instruction(
        &mut self,
        inst: &I::Inst,
    ) -> Result<(InstOutcome, bool), FatalError> {
        let Self {
            core,
            tlb,
            isa,
            platform,
            debug,
            ..
        } = self;

        debug.before_execution(&core.state);
        if debug.trace_enabled() {
            trace!(rip = core.state.rip, inst = %isa.disassemble(inst), "exec");
        }

        core.state.rip = core.state.rip.wrapping_add(u64::from(inst.len())) & core.state.ip_mask();

        let paging = PagingContext::from_state(&core.state);
        let bitness = core.state.bitness();
        let result = match inst.rep() {
            Some(form) => {
                let attached = debug.attached();
                rep::repeat(core, platform, form, attached, |core, platform| {
                    let mut bus = LinearBus::new(&mut *tlb, platform, paging, bitness);
                    let mut cx = ExecContext {
                        state: &mut core.state,
                        events: &mut core.events,
                        mem: &mut bus,
                    };
                    isa.execute_iteration(&mut cx, inst)
                })
                .map(|exit| match exit {
                    RepExit::Completed => Flow::Next,
                    RepExit::Paused => Flow::Branch,
                })
            }
            None => {
                let mut bus = LinearBus::new(&mut *tlb, &mut *platform, paging, bitness);
                let mut cx = ExecContext {
                    state: &mut core.state,
                    events: &mut core.events,
                    mem: &mut bus,
                };
                isa.execute(&mut cx, inst)
            }
        };

        let flow = match result {
            Ok(flow) => flow,
            Err(CpuError::Exception(e)) => return self.fault(e).map(|o| (o, false)),
            Err(CpuError::Fatal(f)) => {
                error!(rip = core.prev_rip, error = %f, "fatal error during execution");
                return Err(f);
            }
        };

        core.prev_rip = core.state.rip;
        debug.after_execution(&core.state);
        core.icount += 1;
        core.events.retire_instruction();
        if flow == Flow::Halt {
            core.events.halt();
        }
        core.sync_time(platform, 0);

        if debug.instruction_epilog(&core.state, core.icount) {
            return Ok((InstOutcome::StopRequested, false));
        }
        Ok((InstOutcome::Continue, flow == Flow::Next))
    }

    /// Delivers a guest exception raised by fetch or execute.
    fn fault(&mut self, e: Exception) -> Result<InstOutcome, FatalError> {
        let core = &mut self.core;
        let rip = if e.is_trap() {
            core.state.rip
        } else {
            core.prev_rip
        };
        core.state.rip = rip;
        match e {
            Exception::Debug { dr6, .. } => core.state.debug.dr6 |= u64::from(dr6),
            Exception::PageFault { addr, .. } => core.state.control.cr2 = addr,
            _ => {}
        }
        debug!(?e, rip, "delivering exception");
        self.platform
            .deliver_event(&mut core.state, DeliveredEvent::Exception { exception: e, rip })?;

        core.mode.handle_cpu_mode_change(&core.state);
        core.prev_rip = core.state.rip;
        core.icount += 1;
        core.sync_time(&mut self.platform, 0);
        self.window.invalidate();
        self.cursor = None;

        if self.debug.instruction_epilog(&core.state, core.icount) {
            return Ok(InstOutcome::StopRequested);
        }
        Ok(InstOutcome::FaultRaised(e))
    }
}
