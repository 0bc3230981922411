//! Firewall control plane
//!
//! - [`zones`]: zones, classification marks, the zone registry
//! - [`engine`]: the packet-filter primitive set and rule model
//! - [`iptables`]: engine backed by the iptables tool family
//! - [`memory`]: in-memory engine for dry runs and tests
//! - [`policy`]: declarative filter and NAT rules
//! - [`translate`]: declarative rules to primitive calls
//! - [`topology`]: the base ruleset every packet traverses
//! - [`backup`]: the committed ruleset artifact
//! - [`controller`]: locked, checkpointed mutation
//! - [`blocklist`]: block-list channel and DNS-over-HTTPS list
//! - [`error`]: error types and iptables error hints

pub mod backup;
pub mod blocklist;
pub mod controller;
pub mod engine;
pub mod error;
pub mod iptables;
pub mod memory;
pub mod policy;
pub mod topology;
pub mod translate;
pub mod zones;

#[cfg(test)]
pub mod test_helpers;
