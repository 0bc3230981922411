//! Shared test utilities for core module tests
//!
//! Provides common fixtures to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::controller::MutationController;
use crate::core::engine::Protocol;
use crate::core::memory::MemoryEngine;
use crate::core::policy::{FilterChain, FilterRule, RuleAction};
use crate::core::zones::{Zone, ZoneRegistry};
use std::path::Path;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("ZONEWALL_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("ZONEWALL_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// WAN on eth0, LAN on eth1, DMZ on eth2.
pub fn test_registry() -> ZoneRegistry {
    ZoneRegistry::new("eth0", "eth1", "eth2").unwrap()
}

/// Controller over a fresh in-memory engine, keeping its state in `dir`.
pub fn test_controller(dir: &Path) -> MutationController<MemoryEngine> {
    MutationController::new(MemoryEngine::new(), test_registry(), dir)
}

/// `LAN_INTERFACE` accept rule for tcp from the LAN subnet to `port`.
pub fn lan_rule(position: u32, port: u16) -> FilterRule {
    FilterRule {
        chain: FilterChain::Zone(Zone::Lan),
        position,
        protocol: Protocol::Tcp,
        source: "192.168.1.0/24".parse().unwrap(),
        destination: "0.0.0.0/0".parse().unwrap(),
        dst_port: Some(port),
        action: RuleAction::Accept,
    }
}

/// Engine with the base topology already applied.
pub fn engine_with_defaults() -> MemoryEngine {
    let zones = test_registry();
    let mut engine = MemoryEngine::new();
    let report = crate::core::topology::TopologyBuilder::new(&zones).apply(&mut engine);
    assert!(report.is_clean(), "{:?}", report.failures);
    engine
}
