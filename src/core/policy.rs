//! Declarative policy model
//!
//! A [`FilterRule`] targets one of the filter chains reached from the zone
//! dispatch (`GLOBAL_INTERFACE` or a zone chain) at an explicit 1-based
//! position. A [`NatRule`] is either a destination mapping (port forward into
//! a host) or a source mapping (outbound address rewrite).
//!
//! Free-form names coming from callers go through the `parse` constructors,
//! which reject unknown kinds with [`Error::UnsupportedRuleKind`] before any
//! engine call is made.
//!
//! # Example
//!
//! ```
//! use zonewall::core::policy::{FilterChain, FilterRule, RuleAction};
//! use zonewall::core::engine::Protocol;
//!
//! let rule = FilterRule {
//!     chain: FilterChain::parse("LAN").unwrap(),
//!     position: 1,
//!     protocol: Protocol::parse("tcp").unwrap(),
//!     source: "192.168.1.0/24".parse().unwrap(),
//!     destination: "0.0.0.0/0".parse().unwrap(),
//!     dst_port: Some(443),
//!     action: RuleAction::Accept,
//! };
//! assert_eq!(rule.chain.name(), "LAN_INTERFACE");
//! ```

use crate::core::engine::{Protocol, Target};
use crate::core::error::{Error, Result};
use crate::core::zones::Zone;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Filter chain holding user policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterChain {
    /// Evaluated for every packet marked for the firewall, before zone chains
    Global,
    Zone(Zone),
}

impl FilterChain {
    pub const fn name(self) -> &'static str {
        match self {
            FilterChain::Global => "GLOBAL_INTERFACE",
            FilterChain::Zone(zone) => zone.chain(),
        }
    }

    /// Accepts `GLOBAL`, a zone name, or the chain name itself.
    pub fn parse(name: &str) -> Result<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let short = upper.strip_suffix("_INTERFACE").unwrap_or(&upper);
        if short == "GLOBAL" {
            return Ok(FilterChain::Global);
        }
        Zone::parse(short).map(FilterChain::Zone)
    }
}

impl fmt::Display for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Verdict of a user filter rule
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
pub enum RuleAction {
    #[default]
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
    #[strum(serialize = "REJECT")]
    Reject,
}

impl RuleAction {
    pub fn parse(name: &str) -> Result<Self> {
        name.trim()
            .parse()
            .map_err(|_| Error::UnsupportedRuleKind(format!("action '{name}'")))
    }

    pub(crate) fn target(self) -> Target {
        match self {
            RuleAction::Accept => Target::Accept,
            RuleAction::Drop => Target::Drop,
            RuleAction::Reject => Target::Reject(None),
        }
    }
}

/// User filter rule, inserted at an explicit position of its chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub chain: FilterChain,
    /// 1-based
    pub position: u32,
    pub protocol: Protocol,
    pub source: IpNetwork,
    pub destination: IpNetwork,
    /// Required for tcp/udp, ignored otherwise
    pub dst_port: Option<u16>,
    pub action: RuleAction,
}

/// Which NAT chain a mapping lives in
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum NatType {
    /// Destination rewrite, reached from PREROUTING
    #[strum(serialize = "DSTNAT")]
    #[serde(rename = "DSTNAT")]
    DstNat,
    /// Source rewrite, reached from POSTROUTING ahead of the masquerade rule
    #[strum(serialize = "SRCNAT")]
    #[serde(rename = "SRCNAT")]
    SrcNat,
}

impl NatType {
    pub fn parse(name: &str) -> Result<Self> {
        name.trim()
            .parse()
            .map_err(|_| Error::UnsupportedRuleKind(format!("nat type '{name}'")))
    }

    /// Custom chain in the nat table
    pub const fn chain(self) -> &'static str {
        match self {
            NatType::DstNat => "DSTNAT",
            NatType::SrcNat => "SRCNAT",
        }
    }
}

/// Port forward from a zone into an internal host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DstNat {
    pub src_zone: Zone,
    pub protocol: Protocol,
    /// Original destination port; required for tcp/udp
    pub dst_port: Option<u16>,
    pub host_ip: IpAddr,
    /// Translated port; `None` keeps the original port
    pub host_port: Option<u16>,
}

/// Outbound source address rewrite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrcNat {
    pub src_zone: Zone,
    pub orig_src: IpNetwork,
    pub new_src: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "nat_type")]
pub enum NatRule {
    #[serde(rename = "DSTNAT")]
    Destination(DstNat),
    #[serde(rename = "SRCNAT")]
    Source(SrcNat),
}

impl NatRule {
    pub const fn nat_type(&self) -> NatType {
        match self {
            NatRule::Destination(_) => NatType::DstNat,
            NatRule::Source(_) => NatType::SrcNat,
        }
    }

    pub const fn src_zone(&self) -> Zone {
        match self {
            NatRule::Destination(rule) => rule.src_zone,
            NatRule::Source(rule) => rule.src_zone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_chain_parse() {
        assert_eq!(FilterChain::parse("global").unwrap(), FilterChain::Global);
        assert_eq!(
            FilterChain::parse("GLOBAL_INTERFACE").unwrap(),
            FilterChain::Global
        );
        assert_eq!(
            FilterChain::parse("dmz_interface").unwrap(),
            FilterChain::Zone(Zone::Dmz)
        );
        assert!(matches!(FilterChain::parse("guest"), Err(Error::Config(_))));
    }

    #[test]
    fn test_nat_type_parse() {
        assert_eq!(NatType::parse("dstnat").unwrap(), NatType::DstNat);
        assert_eq!(NatType::parse("SRCNAT").unwrap().chain(), "SRCNAT");
        assert!(matches!(
            NatType::parse("MASQ"),
            Err(Error::UnsupportedRuleKind(_))
        ));
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(RuleAction::parse("reject").unwrap(), RuleAction::Reject);
        assert!(matches!(
            RuleAction::parse("LOG"),
            Err(Error::UnsupportedRuleKind(_))
        ));
    }

    #[test]
    fn test_nat_rule_json_tag() {
        let rule = NatRule::Source(SrcNat {
            src_zone: Zone::Lan,
            orig_src: "192.168.1.0/24".parse().unwrap(),
            new_src: "203.0.113.7".parse().unwrap(),
        });
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["nat_type"], "SRCNAT");
        assert_eq!(json["src_zone"], "LAN");
        assert_eq!(rule.nat_type(), NatType::SrcNat);
    }
}
