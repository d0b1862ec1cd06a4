#![forbid(unsafe_code)]

//! Runs a flat binary image on the software CPU and reports where it stopped.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use tandem_cpu_core::interp::Tier0Isa;
use tandem_cpu_core::mem::FlatMemory;
use tandem_cpu_core::platform::SimplePlatform;
use tandem_cpu_core::state::{
    ArchState, Segment, CR0_PE, CR0_PG, CR4_PAE, EFER_LMA, EFER_LME, SEG_ATTR_DB, SEG_ATTR_G,
    SEG_ATTR_L, SEG_ATTR_PRESENT, SEG_ATTR_S,
};
use tandem_cpu_core::{CoreConfig, Emulator};
use tracing_subscriber::EnvFilter;

const DEFAULT_MEMORY_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StartMode {
    Real,
    Protected32,
    Long64,
}

#[derive(Parser, Debug)]
#[command(name = "tandem", about = "Run a flat x86 image on the software CPU.")]
struct Args {
    /// Raw image loaded at --load-addr; execution starts at its first byte
    image: PathBuf,

    #[arg(long, value_name = "ADDR", value_parser = parse_u64, default_value = "0x7c00")]
    load_addr: u64,

    #[arg(long, value_enum, default_value_t = StartMode::Real)]
    mode: StartMode,

    #[arg(long, value_name = "BYTES", value_parser = parse_u64, default_value_t = DEFAULT_MEMORY_BYTES)]
    memory_size: u64,

    /// Stop after this many retired instructions
    #[arg(long, default_value_t = 1_000_000)]
    max_insts: u64,

    /// Instructions per CPU slice before the device clock gets a turn
    #[arg(long, default_value_t = 1000)]
    slice: u64,

    /// Core configuration as JSON; flags below override it
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Execute whole traces per dispatch
    #[arg(long, action = clap::ArgAction::SetTrue)]
    chaining: bool,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_linking: bool,

    /// Raise the timer vector every N device ticks
    #[arg(long, value_name = "TICKS")]
    timer_period: Option<u64>,

    #[arg(long, value_parser = parse_u64, default_value = "0x20")]
    timer_vector: u64,

    /// Event handler entry, as VECTOR=ADDR (repeatable)
    #[arg(long = "handler", value_name = "VECTOR=ADDR", value_parser = parse_handler)]
    handlers: Vec<(u8, u64)>,

    /// Log every executed instruction at trace level
    #[arg(long, action = clap::ArgAction::SetTrue)]
    trace: bool,
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn parse_handler(s: &str) -> Result<(u8, u64), String> {
    let (vector, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected VECTOR=ADDR, got {s:?}"))?;
    let vector = u8::try_from(parse_u64(vector)?).map_err(|e| format!("vector: {e}"))?;
    Ok((vector, parse_u64(addr)?))
}

fn initial_state(mode: StartMode, entry: u64) -> ArchState {
    let mut state = ArchState::new();
    let flat = |attributes: u16| Segment {
        selector: 0x08,
        base: 0,
        limit: 0xffff_ffff,
        attributes: attributes | SEG_ATTR_PRESENT | SEG_ATTR_S | SEG_ATTR_G,
    };
    match mode {
        StartMode::Real => {
            let selector = ((entry & 0xf_0000) >> 4) as u16;
            state.segments.cs = Segment::real_mode(selector);
            state.rip = entry & 0xffff;
        }
        StartMode::Protected32 => {
            state.control.cr0 |= CR0_PE;
            state.segments.cs = flat(SEG_ATTR_DB | 0xb);
            let data = Segment {
                selector: 0x10,
                ..flat(SEG_ATTR_DB | 0x3)
            };
            state.segments.ds = data;
            state.segments.es = data;
            state.segments.ss = data;
            state.rip = entry;
        }
        StartMode::Long64 => {
            state.control.cr0 |= CR0_PE | CR0_PG;
            state.control.cr4 |= CR4_PAE;
            state.msr.efer |= EFER_LME | EFER_LMA;
            state.segments.cs = flat(SEG_ATTR_L | 0xb);
            state.rip = entry;
        }
    }
    state
}

fn load_config(args: &Args) -> anyhow::Result<CoreConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parse config {}", path.display()))?
        }
        None => CoreConfig::default(),
    };
    if args.chaining {
        config.trace_chaining = true;
    }
    if args.no_linking {
        config.trace_linking = false;
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    run(Args::parse())
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let image = fs::read(&args.image).with_context(|| format!("read image {}", args.image.display()))?;

    let memory_size = usize::try_from(args.memory_size).context("memory size")?;
    let end = args
        .load_addr
        .checked_add(image.len() as u64)
        .filter(|&end| end <= args.memory_size);
    if end.is_none() {
        bail!(
            "image of {} bytes at {:#x} does not fit in {:#x} bytes of memory",
            image.len(),
            args.load_addr,
            args.memory_size
        );
    }

    let mut memory = FlatMemory::new(memory_size);
    memory.load(args.load_addr, &image);
    let mut platform = SimplePlatform::new(memory);
    if let Some(period) = args.timer_period {
        let vector = u8::try_from(args.timer_vector).context("timer vector")?;
        platform = platform.with_timer(period, vector);
    }
    for &(vector, addr) in &args.handlers {
        platform.set_handler(vector, addr);
    }

    let state = initial_state(args.mode, args.load_addr);
    let mut emu = Emulator::new(config, state, Tier0Isa, platform).context("core configuration")?;
    if args.trace {
        emu.set_debugger(Box::new(TraceAll));
    }

    tracing::info!(
        image = %args.image.display(),
        load_addr = args.load_addr,
        mode = ?args.mode,
        "starting"
    );
    let summary = emu.run(args.max_insts, args.slice)?;

    let state = emu.state();
    let stats = emu.icache_stats();
    let report = serde_json::json!({
        "exit": format!("{:?}", summary.exit),
        "instructions": summary.instructions,
        "ticks": summary.ticks,
        "rip": format!("{:#x}", state.rip),
        "rflags": format!("{:#x}", state.rflags),
        "gpr": state.gpr.iter().map(|v| format!("{v:#x}")).collect::<Vec<_>>(),
        "icache": {
            "lookups": stats.lookups,
            "misses": stats.misses,
            "links_followed": stats.links_followed,
            "max_link_depth": stats.max_link_depth,
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

struct TraceAll;

impl tandem_cpu_core::debug::DebugHooks for TraceAll {
    fn trace_enabled(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let args = Args::try_parse_from([
            "tandem",
            "boot.bin",
            "--load-addr",
            "0x1000",
            "--mode",
            "long64",
            "--chaining",
            "--timer-period",
            "500",
            "--handler",
            "0x20=0x3000",
            "--handler",
            "13=0x4000",
        ])
        .unwrap();
        assert_eq!(args.load_addr, 0x1000);
        assert_eq!(args.mode, StartMode::Long64);
        assert!(args.chaining);
        assert_eq!(args.timer_period, Some(500));
        assert_eq!(args.handlers, vec![(0x20, 0x3000), (13, 0x4000)]);

        let config = load_config(&args).unwrap();
        assert!(config.trace_chaining);
        assert!(config.trace_linking);
    }

    #[test]
    fn rejects_malformed_handler() {
        assert!(Args::try_parse_from(["tandem", "x.bin", "--handler", "0x20"]).is_err());
        assert!(Args::try_parse_from(["tandem", "x.bin", "--handler", "300=0"]).is_err());
    }

    #[test]
    fn protected_mode_starts_flat_32_bit() {
        let state = initial_state(StartMode::Protected32, 0x10_0000);
        assert_eq!(state.bitness(), 32);
        assert_eq!(state.rip, 0x10_0000);
        assert_eq!(initial_state(StartMode::Long64, 0).bitness(), 64);

        let real = initial_state(StartMode::Real, 0x1_7c00);
        assert_eq!(real.bitness(), 16);
        assert_eq!(real.segments.cs.base + real.rip, 0x1_7c00);
    }
}
