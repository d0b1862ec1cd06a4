mod common;

use tandem_cpu_core::interp::Tier0Isa;
use tandem_cpu_core::mem::FlatMemory;
use tandem_cpu_core::platform::SimplePlatform;
use tandem_cpu_core::{ArchState, ClockSync, ConfigError, CoreConfig, Emulator};

fn build(config: CoreConfig) -> Result<common::TestEmulator, ConfigError> {
    let platform = SimplePlatform::new(FlatMemory::new(0x1000));
    Emulator::new(config, ArchState::new(), Tier0Isa, platform)
}

#[test]
fn default_config_is_accepted() {
    assert!(build(CoreConfig::default()).is_ok());
}

#[test]
fn multiple_processors_are_rejected() {
    let config = CoreConfig {
        processors: 2,
        ..CoreConfig::default()
    };
    let err = build(config).err().unwrap();
    assert_eq!(
        err,
        ConfigError::MultipleProcessors {
            processors: 2,
            cores: 1,
            threads: 1,
        }
    );
    assert_eq!(
        err.to_string(),
        "requires procs=cores=threads=1 (configured 2/1/1)"
    );
}

#[test]
fn other_instruction_rates_are_rejected() {
    let config = CoreConfig {
        ips: 4_000_000,
        ..CoreConfig::default()
    };
    assert!(matches!(
        build(config),
        Err(ConfigError::UnsupportedIps { ips: 4_000_000, .. })
    ));
}

#[test]
fn clock_sync_is_rejected() {
    let config = CoreConfig {
        clock_sync: ClockSync::Realtime,
        ..CoreConfig::default()
    };
    assert!(matches!(
        build(config),
        Err(ConfigError::ClockSyncEnabled(ClockSync::Realtime))
    ));
}

#[test]
fn partial_json_fills_defaults() {
    let config: CoreConfig =
        serde_json::from_str(r#"{ "trace_chaining": true, "clock_sync": "none" }"#).unwrap();
    assert!(config.trace_chaining);
    assert!(config.trace_linking);
    assert_eq!(config.ips, 1_000_000);
    assert!(config.validate().is_ok());

    let config: CoreConfig = serde_json::from_str(r#"{ "threads": 2 }"#).unwrap();
    assert!(config.validate().is_err());
}
