//! Declarative rule → primitive call translation
//!
//! Translation validates everything up front: a returned op list is only
//! produced when every field is acceptable, so a rejected rule never causes a
//! partial engine change.

use crate::core::engine::{Match, PrimitiveOp, Protocol, RuleSpec, Table, Target};
use crate::core::error::{Error, Result};
use crate::core::policy::{DstNat, FilterChain, FilterRule, NatRule, NatType, SrcNat};
use crate::core::zones::ZoneRegistry;
use crate::validators;
use std::net::IpAddr;
use tracing::debug;

/// NAT mappings are always inserted at the head of their chain.
const NAT_INSERT_POSITION: u32 = 1;

pub struct RuleTranslator<'a> {
    zones: &'a ZoneRegistry,
}

impl<'a> RuleTranslator<'a> {
    pub fn new(zones: &'a ZoneRegistry) -> Self {
        Self { zones }
    }

    /// Ops inserting a user filter rule at its requested position.
    pub fn to_insert_ops(&self, rule: &FilterRule) -> Result<Vec<PrimitiveOp>> {
        check_position(rule.position)?;
        ipv4("source", rule.source.ip())?;
        ipv4("destination", rule.destination.ip())?;

        let matches = port_match(
            Match::any().src(rule.source).dst(rule.destination),
            rule.protocol,
            rule.dst_port,
        )?;
        let op = PrimitiveOp::insert(
            Table::Filter,
            rule.chain.name(),
            rule.position,
            RuleSpec::new(matches, rule.action.target()),
        );
        debug!("translated filter rule: {op}");
        Ok(vec![op])
    }

    /// Ops inserting a NAT mapping at the head of its chain.
    pub fn nat_insert_ops(&self, rule: &NatRule) -> Result<Vec<PrimitiveOp>> {
        let (chain, spec) = match rule {
            NatRule::Destination(dnat) => (NatType::DstNat.chain(), self.dnat_spec(dnat)?),
            NatRule::Source(snat) => (NatType::SrcNat.chain(), self.snat_spec(snat)?),
        };
        let op = PrimitiveOp::insert(Table::Nat, chain, NAT_INSERT_POSITION, spec);
        debug!("translated {} mapping: {op}", rule.nat_type());
        Ok(vec![op])
    }

    /// Deletion by position. Later rules in the chain shift down by one.
    pub fn to_delete_ops(&self, table: Table, chain: &str, position: u32) -> Result<PrimitiveOp> {
        check_position(position)?;
        Ok(PrimitiveOp::delete(table, chain, position))
    }

    pub fn filter_delete_op(&self, chain: FilterChain, position: u32) -> Result<PrimitiveOp> {
        self.to_delete_ops(Table::Filter, chain.name(), position)
    }

    pub fn nat_delete_op(&self, nat_type: NatType, position: u32) -> Result<PrimitiveOp> {
        self.to_delete_ops(Table::Nat, nat_type.chain(), position)
    }

    fn dnat_spec(&self, rule: &DstNat) -> Result<RuleSpec> {
        ipv4("host_ip", rule.host_ip)?;
        let ingress = self.zones.resolve(rule.src_zone);
        let matches = port_match(Match::any().in_iface(ingress), rule.protocol, rule.dst_port)?;

        // The suffix is only meaningful when a destination port is matched
        let port = match (rule.dst_port, rule.host_port) {
            (Some(orig), Some(host)) if rule.protocol.supports_ports() && orig != host => {
                Some(host)
            }
            _ => None,
        };

        Ok(RuleSpec::new(
            matches,
            Target::Dnat {
                to: rule.host_ip,
                port,
            },
        ))
    }

    fn snat_spec(&self, rule: &SrcNat) -> Result<RuleSpec> {
        ipv4("orig_src", rule.orig_src.ip())?;
        ipv4("new_src", rule.new_src)?;

        // POSTROUTING cannot match an ingress interface; src_zone is not emitted
        debug!(
            "SRCNAT for {} ({}) egresses {}",
            rule.src_zone,
            self.zones.resolve(rule.src_zone),
            self.zones.wan()
        );
        Ok(RuleSpec::new(
            Match::any().out_iface(self.zones.wan()).src(rule.orig_src),
            Target::Snat { to: rule.new_src },
        ))
    }
}

fn check_position(position: u32) -> Result<()> {
    if position == 0 {
        return Err(Error::validation("position", "positions are 1-based"));
    }
    Ok(())
}

fn ipv4(field: &str, ip: IpAddr) -> Result<()> {
    validators::require_ipv4(ip).map_err(|message| Error::validation(field, message))
}

/// Adds protocol and destination port, requiring a port for tcp/udp.
fn port_match(matches: Match, protocol: Protocol, port: Option<u16>) -> Result<Match> {
    let matches = matches.proto(protocol);
    if !protocol.supports_ports() {
        return Ok(matches);
    }
    match port {
        Some(0) => Err(Error::validation("dst_port", "port 0 is not a valid destination")),
        Some(port) => Ok(matches.dport(port)),
        None => Err(Error::validation(
            "dst_port",
            format!("{protocol} rules need a destination port"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::RuleAction;
    use crate::core::test_helpers::test_registry;
    use crate::core::zones::Zone;

    fn rule(protocol: Protocol, dst_port: Option<u16>) -> FilterRule {
        FilterRule {
            chain: FilterChain::Zone(Zone::Lan),
            position: 3,
            protocol,
            source: "192.168.1.0/24".parse().unwrap(),
            destination: "0.0.0.0/0".parse().unwrap(),
            dst_port,
            action: RuleAction::Drop,
        }
    }

    fn dnat(protocol: Protocol, dst_port: Option<u16>, host_port: Option<u16>) -> NatRule {
        NatRule::Destination(DstNat {
            src_zone: Zone::Wan,
            protocol,
            dst_port,
            host_ip: "192.168.1.10".parse().unwrap(),
            host_port,
        })
    }

    #[test]
    fn test_tcp_rule() {
        let zones = test_registry();
        let ops = RuleTranslator::new(&zones)
            .to_insert_ops(&rule(Protocol::Tcp, Some(22)))
            .unwrap();
        assert_eq!(
            ops[0].to_string(),
            "iptables -t filter -I LAN_INTERFACE 3 -s 192.168.1.0/24 -d 0.0.0.0/0 -p tcp --dport 22 -j DROP"
        );
    }

    #[test]
    fn test_any_and_icmp_omit_port() {
        let zones = test_registry();
        let translator = RuleTranslator::new(&zones);

        let any = translator.to_insert_ops(&rule(Protocol::Any, Some(22))).unwrap();
        assert!(!any[0].to_string().contains("--dport"));
        assert!(!any[0].to_string().contains("-p "));

        let icmp = translator.to_insert_ops(&rule(Protocol::Icmp, None)).unwrap();
        assert!(icmp[0].to_string().contains("-p icmp -j DROP"));
    }

    #[test]
    fn test_port_required_for_udp() {
        let zones = test_registry();
        let err = RuleTranslator::new(&zones)
            .to_insert_ops(&rule(Protocol::Udp, None))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "dst_port"));
    }

    #[test]
    fn test_position_zero_rejected() {
        let zones = test_registry();
        let translator = RuleTranslator::new(&zones);
        let mut zero = rule(Protocol::Any, None);
        zero.position = 0;
        assert!(translator.to_insert_ops(&zero).is_err());
        assert!(translator.nat_delete_op(NatType::DstNat, 0).is_err());
        assert_eq!(
            translator
                .filter_delete_op(FilterChain::Global, 2)
                .unwrap()
                .to_string(),
            "iptables -t filter -D GLOBAL_INTERFACE 2"
        );
    }

    #[test]
    fn test_dnat_port_suffix_only_when_ports_differ() {
        let zones = test_registry();
        let translator = RuleTranslator::new(&zones);

        let remapped = translator
            .nat_insert_ops(&dnat(Protocol::Tcp, Some(8080), Some(80)))
            .unwrap();
        assert_eq!(
            remapped[0].to_string(),
            "iptables -t nat -I DSTNAT 1 -i eth0 -p tcp --dport 8080 -j DNAT --to-destination 192.168.1.10:80"
        );

        let same = translator
            .nat_insert_ops(&dnat(Protocol::Tcp, Some(443), Some(443)))
            .unwrap();
        assert!(same[0].to_string().ends_with("--to-destination 192.168.1.10"));

        let kept = translator
            .nat_insert_ops(&dnat(Protocol::Udp, Some(53), None))
            .unwrap();
        assert!(kept[0].to_string().ends_with("--to-destination 192.168.1.10"));
    }

    #[test]
    fn test_dnat_icmp_has_no_port() {
        let zones = test_registry();
        let ops = RuleTranslator::new(&zones)
            .nat_insert_ops(&dnat(Protocol::Icmp, Some(80), Some(81)))
            .unwrap();
        assert_eq!(
            ops[0].to_string(),
            "iptables -t nat -I DSTNAT 1 -i eth0 -p icmp -j DNAT --to-destination 192.168.1.10"
        );
    }

    #[test]
    fn test_snat_egresses_wan() {
        let zones = test_registry();
        let rule = NatRule::Source(SrcNat {
            src_zone: Zone::Dmz,
            orig_src: "10.0.0.0/24".parse().unwrap(),
            new_src: "203.0.113.9".parse().unwrap(),
        });
        let ops = RuleTranslator::new(&zones).nat_insert_ops(&rule).unwrap();
        assert_eq!(
            ops[0].to_string(),
            "iptables -t nat -I SRCNAT 1 -o eth0 -s 10.0.0.0/24 -j SNAT --to-source 203.0.113.9"
        );
    }

    #[test]
    fn test_ipv6_rejected_before_any_op() {
        let zones = test_registry();
        let translator = RuleTranslator::new(&zones);

        let mut v6 = rule(Protocol::Any, None);
        v6.source = "2001:db8::/32".parse().unwrap();
        let err = translator.to_insert_ops(&v6).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "source"));

        let NatRule::Destination(mut forward) = dnat(Protocol::Tcp, Some(80), None) else {
            unreachable!()
        };
        forward.host_ip = "2001:db8::10".parse().unwrap();
        let err = translator
            .nat_insert_ops(&NatRule::Destination(forward))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "host_ip"));

        let masquerade = NatRule::Source(SrcNat {
            src_zone: Zone::Lan,
            orig_src: "192.168.1.0/24".parse().unwrap(),
            new_src: "2001:db8::5".parse().unwrap(),
        });
        assert!(translator.nat_insert_ops(&masquerade).is_err());
    }
}
