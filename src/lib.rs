//! zonewall - zone-based iptables firewall control plane
//!
//! Translates a small declarative policy model (zones, filter rules, NAT
//! mappings, block-lists) into an ordered iptables rule topology, and
//! serializes policy changes across processes with a lock plus a checksummed
//! ruleset backup.
//!
//! # Architecture
//!
//! - [`core`] - Zones, engine primitives, topology, translation, mutation control
//! - [`audit`] - Audit logging for all privileged operations
//! - [`validators`] - Input validation for names and addresses
//! - [`config`] - Configuration file loading
//! - [`elevation`] - Running the iptables tool family with root privileges
//! - [`utils`] - XDG directories and host introspection
//!
//! # Example
//!
//! ```
//! use zonewall::core::controller::MutationController;
//! use zonewall::core::memory::MemoryEngine;
//! use zonewall::core::zones::ZoneRegistry;
//!
//! let state = tempfile::TempDir::new().unwrap();
//! let zones = ZoneRegistry::new("eth0", "eth1", "eth2").unwrap();
//! let mut controller = MutationController::new(MemoryEngine::new(), zones, state.path());
//!
//! controller
//!     .transaction(|session| {
//!         let report = session.apply_defaults();
//!         assert!(report.is_clean());
//!         Ok(())
//!     })
//!     .unwrap();
//! assert!(controller.backup().exists());
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::controller::{ControllerState, MutationController, Outcome, Session};
pub use core::engine::{PacketFilter, PrimitiveOp};
pub use core::error::{Error, ErrorKind, Result};
pub use core::zones::{Mark, Zone, ZoneRegistry};
