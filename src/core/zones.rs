//! Logical zones, classification marks and the zone registry
//!
//! Every forwarded packet receives exactly one zone-origin mark in the mangle
//! table, based on its ingress interface. Later stages overwrite that mark with
//! one of the verdict marks ([`Mark::SEND_TO_FIREWALL`], [`Mark::SEND_TO_IPS`],
//! [`Mark::IP_PROXY_DROP`]); marks are never combined.

use crate::config::InterfacesConfig;
use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::IntoEnumIterator;
use tracing::warn;

/// Packet mark set by the mangle table and consumed by filter rules and the
/// inspection queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mark(pub u32);

impl Mark {
    pub const WAN_IN: Mark = Mark(10);
    pub const LAN_IN: Mark = Mark(11);
    pub const DMZ_IN: Mark = Mark(12);

    /// Inspection passed the packet; evaluate zone firewall policy.
    pub const SEND_TO_FIREWALL: Mark = Mark(20);
    /// Traffic for the intrusion-prevention queue.
    pub const SEND_TO_IPS: Mark = Mark(21);
    /// Proxy verdict drop, still handed to the IPS for flood accounting.
    pub const IP_PROXY_DROP: Mark = Mark(25);

    /// Verdict marks, disjoint from every zone-origin mark.
    pub const VERDICTS: [Mark; 3] = [
        Mark::SEND_TO_FIREWALL,
        Mark::SEND_TO_IPS,
        Mark::IP_PROXY_DROP,
    ];
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// NFQUEUE number served by the IP proxy.
pub const PROXY_QUEUE: u16 = 1;

/// NFQUEUE number served by the IPS. Evaluated after the proxy queue.
pub const IPS_QUEUE: u16 = 2;

/// Logical network segment bound to one physical interface
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
pub enum Zone {
    #[strum(serialize = "WAN")]
    Wan,
    #[strum(serialize = "LAN")]
    Lan,
    #[strum(serialize = "DMZ")]
    Dmz,
}

impl Zone {
    /// Zone-origin mark applied to packets entering on this zone's interface.
    pub const fn mark(self) -> Mark {
        match self {
            Zone::Wan => Mark::WAN_IN,
            Zone::Lan => Mark::LAN_IN,
            Zone::Dmz => Mark::DMZ_IN,
        }
    }

    /// Filter-table chain holding this zone's user policy.
    pub const fn chain(self) -> &'static str {
        match self {
            Zone::Wan => "WAN_INTERFACE",
            Zone::Lan => "LAN_INTERFACE",
            Zone::Dmz => "DMZ_INTERFACE",
        }
    }

    /// Parses a zone name, failing fast on anything but WAN/LAN/DMZ.
    pub fn parse(name: &str) -> Result<Self> {
        name.trim()
            .parse()
            .map_err(|_| Error::Config(format!("unknown zone '{name}' (expected WAN, LAN or DMZ)")))
    }
}

/// Resolves zones to interfaces and marks.
///
/// Built once from configuration and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRegistry {
    wan: String,
    lan: String,
    dmz: String,
}

impl ZoneRegistry {
    /// Builds the registry, requiring every zone to be bound to a valid interface.
    pub fn new(wan: &str, lan: &str, dmz: &str) -> Result<Self> {
        let registry = Self {
            wan: Self::checked(Zone::Wan, wan)?,
            lan: Self::checked(Zone::Lan, lan)?,
            dmz: Self::checked(Zone::Dmz, dmz)?,
        };

        let present = crate::utils::list_interfaces();
        if !present.is_empty() {
            for zone in Zone::iter() {
                let ident = registry.resolve(zone);
                if !present.iter().any(|p| p == ident) {
                    warn!("{zone} interface '{ident}' is not present on this host");
                }
            }
        }

        Ok(registry)
    }

    pub fn from_config(config: &InterfacesConfig) -> Result<Self> {
        let ident = |zone: Zone| {
            config
                .binding(zone)
                .map(|b| b.ident.as_str())
                .ok_or_else(|| Error::Config(format!("no interface bound to zone {zone}")))
        };
        Self::new(ident(Zone::Wan)?, ident(Zone::Lan)?, ident(Zone::Dmz)?)
    }

    fn checked(zone: Zone, ident: &str) -> Result<String> {
        if ident.is_empty() {
            return Err(Error::Config(format!("no interface bound to zone {zone}")));
        }
        crate::validators::validate_interface(ident)
            .map_err(|e| Error::Config(format!("zone {zone}: {e}")))
    }

    /// Physical interface bound to `zone`.
    pub fn resolve(&self, zone: Zone) -> &str {
        match zone {
            Zone::Wan => &self.wan,
            Zone::Lan => &self.lan,
            Zone::Dmz => &self.dmz,
        }
    }

    pub fn mark_for(&self, zone: Zone) -> Mark {
        zone.mark()
    }

    pub fn chain_for(&self, zone: Zone) -> &'static str {
        zone.chain()
    }

    pub fn wan(&self) -> &str {
        &self.wan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_marks_are_unique_and_disjoint_from_verdicts() {
        let marks: Vec<Mark> = Zone::iter().map(Zone::mark).collect();
        for (i, a) in marks.iter().enumerate() {
            for b in &marks[i + 1..] {
                assert_ne!(a, b);
            }
            assert!(!Mark::VERDICTS.contains(a));
        }
    }

    #[test]
    fn test_resolve() {
        let registry = ZoneRegistry::new("eth0", "eth1", "eth2").unwrap();
        assert_eq!(registry.resolve(Zone::Wan), "eth0");
        assert_eq!(registry.resolve(Zone::Lan), "eth1");
        assert_eq!(registry.resolve(Zone::Dmz), "eth2");
        assert_eq!(registry.mark_for(Zone::Lan), Mark::LAN_IN);
        assert_eq!(registry.chain_for(Zone::Dmz), "DMZ_INTERFACE");
    }

    #[test]
    fn test_unbound_zone_is_config_error() {
        let err = ZoneRegistry::new("eth0", "", "eth2").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("LAN"));
    }

    #[test]
    fn test_invalid_interface_is_config_error() {
        let err = ZoneRegistry::new("eth0;rm", "eth1", "eth2").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zone_parse() {
        assert_eq!(Zone::parse("wan").unwrap(), Zone::Wan);
        assert_eq!(Zone::parse(" DMZ ").unwrap(), Zone::Dmz);
        assert!(matches!(Zone::parse("guest"), Err(Error::Config(_))));
    }
}
