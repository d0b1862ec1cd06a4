//! Startup configuration and its one-time validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only instruction rate the hand-off timing model supports.
pub const REQUIRED_IPS: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSync {
    #[default]
    None,
    Realtime,
    Slowdown,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub ips: u64,
    pub processors: u32,
    pub cores: u32,
    pub threads: u32,
    pub clock_sync: ClockSync,
    /// Execute a whole trace per dispatch instead of one instruction.
    pub trace_chaining: bool,
    /// Record direct links between consecutive traces.
    pub trace_linking: bool,
    /// Run the AVX mode-change handler after context import.
    pub avx: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ips: REQUIRED_IPS,
            processors: 1,
            cores: 1,
            threads: 1,
            clock_sync: ClockSync::None,
            trace_chaining: false,
            trace_linking: true,
            avx: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("requires ips={required} (configured {ips})")]
    UnsupportedIps { ips: u64, required: u64 },
    #[error("requires procs=cores=threads=1 (configured {processors}/{cores}/{threads})")]
    MultipleProcessors {
        processors: u32,
        cores: u32,
        threads: u32,
    },
    #[error("requires clock: sync=none (configured {0:?})")]
    ClockSyncEnabled(ClockSync),
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ips != REQUIRED_IPS {
            return Err(ConfigError::UnsupportedIps {
                ips: self.ips,
                required: REQUIRED_IPS,
            });
        }
        if self.processors != 1 || self.cores != 1 || self.threads != 1 {
            return Err(ConfigError::MultipleProcessors {
                processors: self.processors,
                cores: self.cores,
                threads: self.threads,
            });
        }
        if self.clock_sync != ClockSync::None {
            return Err(ConfigError::ClockSyncEnabled(self.clock_sync));
        }
        Ok(())
    }

    pub fn single_processor(&self) -> bool {
        self.processors == 1 && self.cores == 1 && self.threads == 1
    }
}
