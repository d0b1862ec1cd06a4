//! Hand-off between the software loop and an accelerated engine.
//!
//! The engine sees the CPU only through [`EngineHost`]: it imports and exports
//! the context record, steps the software CPU or the device clock, and looks
//! up host backing for guest-physical pages. [`Session`] owns the binding and
//! drives the engine the way a run loop would.

use std::collections::HashMap;
use std::fmt;

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ConfigError, CoreConfig};
use crate::context::ContextRecord;
use crate::dispatch::{BatchResult, Emulator};
use crate::exception::FatalError;
use crate::isa::InstructionSet;
use crate::mem::{AccessType, PAGE_SIZE};
use crate::platform::Platform;
use crate::state::RFLAGS_IF;

/// Instructions handed back to the software CPU after an exit the engine
/// cannot handle itself.
pub const EMULATION_SLICE: u64 = 1000;

/// The routines handed to an engine.
pub trait EngineHost {
    fn set_context(&mut self, record: &ContextRecord);
    fn get_context(&mut self, record: &mut ContextRecord);
    fn step_device(&mut self, ticks: u64) -> Result<BatchResult, FatalError>;
    fn step_cpu(&mut self, steps: u64) -> Result<BatchResult, FatalError>;
    fn get_memory_backing(&mut self, paddr: u64, access: AccessType) -> Option<&mut [u8]>;
}

impl<I: InstructionSet, P: Platform> EngineHost for Emulator<I, P> {
    fn set_context(&mut self, record: &ContextRecord) {
        self.import_context(record);
    }

    fn get_context(&mut self, record: &mut ContextRecord) {
        *record = self.export_context();
    }

    fn step_device(&mut self, ticks: u64) -> Result<BatchResult, FatalError> {
        Emulator::step_device(self, ticks)
    }

    fn step_cpu(&mut self, steps: u64) -> Result<BatchResult, FatalError> {
        Emulator::step_cpu(self, steps)
    }

    fn get_memory_backing(&mut self, paddr: u64, access: AccessType) -> Option<&mut [u8]> {
        self.memory_backing(paddr, access)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct RegionPerms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// A run of guest-physical pages backed by contiguous host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub paddr: u64,
    /// Host address of the first byte, for identity comparison only.
    pub host_addr: usize,
    pub size: u64,
    pub perms: RegionPerms,
}

/// Probes every page below `limit` and merges pages that are contiguous both
/// in guest-physical space and in host memory and share permissions.
///
/// A page's permissions are the accesses whose backing agrees with the first
/// backing found (read, then write, then execute).
pub fn scan_memory_regions(host: &mut dyn EngineHost, limit: u64) -> Vec<MemoryRegion> {
    let mut regions: Vec<MemoryRegion> = Vec::new();
    let probes = [
        (AccessType::Read, RegionPerms::READ),
        (AccessType::Write, RegionPerms::WRITE),
        (AccessType::Execute, RegionPerms::EXECUTE),
    ];

    let mut paddr = 0u64;
    while paddr < limit {
        let mut backing: Option<usize> = None;
        let mut perms = RegionPerms::empty();
        for (access, perm) in probes {
            let Some(addr) = host
                .get_memory_backing(paddr, access)
                .map(|page| page.as_ptr() as usize)
            else {
                continue;
            };
            match backing {
                None => {
                    backing = Some(addr);
                    perms |= perm;
                }
                Some(first) if first == addr => perms |= perm,
                Some(_) => {}
            }
        }

        if let Some(host_addr) = backing {
            let extends = regions.iter_mut().find(|r| {
                r.perms == perms
                    && r.paddr + r.size == paddr
                    && r.host_addr as u64 + r.size == host_addr as u64
            });
            match extends {
                Some(region) => region.size += PAGE_SIZE,
                None => regions.push(MemoryRegion {
                    paddr,
                    host_addr,
                    size: PAGE_SIZE,
                    perms,
                }),
            }
        }
        paddr += PAGE_SIZE;
    }
    regions
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    MemoryAccess,
    IoPortAccess,
    Halt,
    /// The engine's run was cancelled from outside (time slice expiry).
    Canceled,
    InterruptWindow,
    Unsupported(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineExit {
    pub reason: ExitReason,
    /// Device ticks that elapsed while the engine ran.
    pub elapsed_ticks: u64,
}

pub trait AcceleratedEngine {
    fn map_memory(&mut self, regions: &[MemoryRegion]) -> Result<(), BridgeError>;

    /// Runs the guest from `context` until the next exit, leaving the final
    /// state in `context`.
    fn run(&mut self, context: &mut ContextRecord) -> Result<EngineExit, BridgeError>;

    /// Asks for an exit as soon as the guest can take an interrupt.
    fn request_interrupt_window(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    /// Memory is mapped into the engine; no run has happened yet.
    Bound,
    Active,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Bound => "bound",
            Lifecycle::Active => "active",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
    #[error("session is {found}, expected {expected}")]
    Lifecycle { expected: Lifecycle, found: Lifecycle },
    #[error("engine failed: {0}")]
    Engine(String),
    #[error("unhandled engine exit {0:?}")]
    UnhandledExit(ExitReason),
}

/// One engine bound to one CPU.
pub struct Session<E> {
    engine: E,
    lifecycle: Lifecycle,
    context: ContextRecord,
    emulating: u64,
    exits: HashMap<ExitReason, u64>,
    memory_limit: u64,
}

impl<E: AcceleratedEngine> Session<E> {
    /// Fails unless `config` describes the single-processor setup the
    /// hand-off relies on.
    pub fn new(engine: E, config: &CoreConfig, memory_limit: u64) -> Result<Self, BridgeError> {
        config.validate()?;
        Ok(Self {
            engine,
            lifecycle: Lifecycle::Uninitialized,
            context: ContextRecord::default(),
            emulating: 0,
            exits: HashMap::new(),
            memory_limit,
        })
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn exit_stats(&self) -> &HashMap<ExitReason, u64> {
        &self.exits
    }

    /// Instructions owed to the software CPU before the engine runs again.
    pub fn pending_emulation(&self) -> u64 {
        self.emulating
    }

    /// Maps guest memory into the engine.
    pub fn bind(&mut self, host: &mut dyn EngineHost) -> Result<(), BridgeError> {
        self.require(Lifecycle::Uninitialized)?;
        let regions = scan_memory_regions(host, self.memory_limit);
        for region in &regions {
            info!(
                start = region.paddr,
                end = region.paddr + region.size - 1,
                perms = ?region.perms,
                "memory region"
            );
        }
        self.engine.map_memory(&regions)?;
        self.lifecycle = Lifecycle::Bound;
        info!(regions = regions.len(), "engine bound");
        Ok(())
    }

    /// One scheduling round: either pays back owed software emulation or runs
    /// the engine once.
    pub fn run_once(&mut self, host: &mut dyn EngineHost) -> Result<(), BridgeError> {
        if self.lifecycle == Lifecycle::Uninitialized {
            return Err(BridgeError::Lifecycle {
                expected: Lifecycle::Bound,
                found: self.lifecycle,
            });
        }
        self.lifecycle = Lifecycle::Active;

        if self.emulating > 0 {
            host.step_cpu(std::mem::take(&mut self.emulating))?;
            return Ok(());
        }

        host.get_context(&mut self.context);
        let pre_rip = self.context.linear_rip();
        let exit = self.engine.run(&mut self.context)?;
        host.set_context(&self.context);

        if self.context.linear_rip() != pre_rip {
            host.step_device(exit.elapsed_ticks)?;
        }
        *self.exits.entry(exit.reason).or_insert(0) += 1;

        match exit.reason {
            ExitReason::MemoryAccess | ExitReason::IoPortAccess | ExitReason::Halt => {
                self.emulating += EMULATION_SLICE;
            }
            ExitReason::Canceled => {
                if self.context.rflags.as_u64() & RFLAGS_IF == 0 {
                    self.engine.request_interrupt_window();
                }
            }
            ExitReason::InterruptWindow => {}
            ExitReason::Unsupported(_) => return Err(BridgeError::UnhandledExit(exit.reason)),
        }
        debug!(reason = ?exit.reason, "engine exit");
        Ok(())
    }

    pub fn run(&mut self, host: &mut dyn EngineHost, rounds: u64) -> Result<(), BridgeError> {
        for _ in 0..rounds {
            self.run_once(host)?;
        }
        Ok(())
    }

    /// Logs exit statistics and returns the engine.
    pub fn shutdown(self) -> E {
        let total: u64 = self.exits.values().sum();
        info!(total, exits = ?self.exits, "session finished");
        self.engine
    }

    fn require(&self, expected: Lifecycle) -> Result<(), BridgeError> {
        if self.lifecycle != expected {
            return Err(BridgeError::Lifecycle {
                expected,
                found: self.lifecycle,
            });
        }
        Ok(())
    }
}
