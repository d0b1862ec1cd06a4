#![forbid(unsafe_code)]

//! Instruction-execution core of a software x86 CPU that can trade control
//! with an accelerated engine.
//!
//! The crate is centered around [`dispatch::Emulator`], which owns:
//! - the architectural state ([`state::ArchState`]) and its derived mode cache
//! - the decoded-trace cache and trace linker ([`icache`])
//! - the translation cache and instruction prefetcher ([`tlb`], [`prefetch`])
//! - pending-event bookkeeping ([`events`]) and the REP iterator ([`rep`])
//!
//! Opcode semantics, paging and devices are collaborators behind the
//! [`isa::InstructionSet`] and [`platform::Platform`] traits. [`interp`] and
//! [`platform::SimplePlatform`] are small implementations that let the loop
//! run on its own. [`bridge`] exposes the step primitives and context
//! marshalling ([`context`]) to an external engine.

pub mod bridge;
pub mod config;
pub mod context;
pub mod cpu;
pub mod debug;
pub mod dispatch;
pub mod events;
pub mod exception;
pub mod icache;
pub mod interp;
pub mod isa;
pub mod linear;
pub mod mem;
pub mod mode;
pub mod platform;
pub mod prefetch;
pub mod rep;
pub mod state;
pub mod time;
pub mod tlb;

pub use config::{ClockSync, ConfigError, CoreConfig};
pub use context::{ContextField, ContextRecord, RegisterValue};
pub use dispatch::{BatchExit, BatchResult, Emulator, RunExit, RunSummary};
pub use exception::{CpuError, Exception, FatalError, InstOutcome};
pub use state::ArchState;
