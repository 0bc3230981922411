//! Base rule topology
//!
//! The base topology is every chain, mark and default rule a packet traverses
//! before user policy is consulted. It is built as an explicit ordered list of
//! named steps ([`BUILD_STEPS`]); the order is load-bearing:
//!
//! 1. custom chains exist before any rule jumps to them
//! 2. mangle marks are assigned before filter rules read them
//! 3. connection tracking is the first rule of FORWARD and INPUT
//! 4. the proxy queue (1) precedes the IPS queue (2)
//! 5. SRCNAT is reached before the trailing masquerade rule
//!
//! # Bring-up semantics
//!
//! [`TopologyBuilder::apply`] attempts every op even when earlier ones fail,
//! so one rejected rule does not leave the host without the rest of its
//! protection. Failures are logged and collected in a [`BuildReport`].
//!
//! The build is meant to run once per firewall lifetime. Running it again
//! appends a second copy of every rule (and fails the chain creations); it
//! is not guarded.

use crate::core::blocklist::{DohList, doh_reject_rule};
use crate::core::engine::{
    ICMP_ECHO_REQUEST, Match, PacketFilter, Policy, PrimitiveOp, Protocol, RejectWith, RuleSpec,
    Table, Target,
};
use crate::core::zones::{IPS_QUEUE, Mark, PROXY_QUEUE, Zone, ZoneRegistry};
use ipnetwork::{IpNetwork, Ipv4Network};
use std::net::{IpAddr, Ipv4Addr};
use strum::IntoEnumIterator;
use tracing::{info, warn};

/// Custom chains, in creation order.
pub const CUSTOM_CHAINS: &[(Table, &str)] = &[
    (Table::Filter, "GLOBAL_INTERFACE"),
    (Table::Filter, "WAN_INTERFACE"),
    (Table::Filter, "LAN_INTERFACE"),
    (Table::Filter, "DMZ_INTERFACE"),
    (Table::Filter, "NAT"),
    (Table::Filter, "DOH"),
    (Table::Nat, "DSTNAT"),
    (Table::Nat, "SRCNAT"),
    (Table::Mangle, "IPS"),
];

/// Default port of the local DNS proxy that internal DNS is redirected to.
pub const DEFAULT_RESOLVER_PORT: u16 = 53;

const LOCAL_STUB_RESOLVER: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 53);
const CTSTATE_RETURN: &str = "RELATED,ESTABLISHED";

/// One named stage of the base topology
pub struct BuildStep {
    pub name: &'static str,
    plan: fn(&TopologyBuilder<'_>) -> Vec<PrimitiveOp>,
}

/// The base topology, in execution order.
pub const BUILD_STEPS: &[BuildStep] = &[
    BuildStep {
        name: "create_chains",
        plan: create_chains,
    },
    BuildStep {
        name: "mark_assignment",
        plan: mark_assignment,
    },
    BuildStep {
        name: "default_policies",
        plan: default_policies,
    },
    BuildStep {
        name: "connection_tracking",
        plan: connection_tracking,
    },
    BuildStep {
        name: "bypass_prevention",
        plan: bypass_prevention,
    },
    BuildStep {
        name: "inspection_queues",
        plan: inspection_queues,
    },
    BuildStep {
        name: "zone_dispatch",
        plan: zone_dispatch,
    },
    BuildStep {
        name: "firewall_services",
        plan: firewall_services,
    },
    BuildStep {
        name: "nat",
        plan: nat,
    },
    BuildStep {
        name: "kernel_settings",
        plan: kernel_settings,
    },
];

/// A primitive op tagged with the step that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOp {
    pub step: &'static str,
    pub op: PrimitiveOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: &'static str,
    pub call: String,
    pub error: String,
}

/// Outcome of a best-effort build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub attempted: usize,
    pub failures: Vec<StepFailure>,
}

impl BuildReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.attempted - self.failures.len()
    }
}

pub struct TopologyBuilder<'a> {
    zones: &'a ZoneRegistry,
    doh_resolvers: Vec<IpAddr>,
    resolver_port: u16,
}

impl<'a> TopologyBuilder<'a> {
    pub fn new(zones: &'a ZoneRegistry) -> Self {
        Self {
            zones,
            doh_resolvers: Vec::new(),
            resolver_port: DEFAULT_RESOLVER_PORT,
        }
    }

    /// DNS-over-HTTPS resolvers rejected from the `DOH` chain.
    #[must_use]
    pub fn with_doh_list(mut self, list: &DohList) -> Self {
        self.doh_resolvers = list.resolvers().to_vec();
        self
    }

    #[must_use]
    pub fn with_resolver_port(mut self, port: u16) -> Self {
        self.resolver_port = port;
        self
    }

    /// Every op of the base topology, in order, without touching an engine.
    pub fn plan(&self) -> Vec<PlannedOp> {
        BUILD_STEPS
            .iter()
            .flat_map(|step| {
                (step.plan)(self)
                    .into_iter()
                    .map(move |op| PlannedOp { step: step.name, op })
            })
            .collect()
    }

    /// Applies the base topology. Never aborts on a failed op.
    pub fn apply(&self, engine: &mut dyn PacketFilter) -> BuildReport {
        let mut report = BuildReport::default();

        for step in BUILD_STEPS {
            let ops = (step.plan)(self);
            info!("Topology step {} ({} ops)", step.name, ops.len());

            for op in ops {
                report.attempted += 1;
                if let Err(e) = op.apply(engine) {
                    warn!("Topology step {} failed `{op}`: {e}", step.name);
                    report.failures.push(StepFailure {
                        step: step.name,
                        call: op.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.is_clean() {
            info!("Base topology applied ({} ops)", report.attempted);
        } else {
            warn!(
                "Base topology applied with {} of {} ops failing",
                report.failures.len(),
                report.attempted
            );
        }
        report
    }

    fn wan(&self) -> &str {
        self.zones.wan()
    }
}

fn append(table: Table, chain: &str, matches: Match, target: Target) -> PrimitiveOp {
    PrimitiveOp::append(table, chain, RuleSpec::new(matches, target))
}

fn filter(chain: &str, matches: Match, target: Target) -> PrimitiveOp {
    append(Table::Filter, chain, matches, target)
}

fn loopback_network() -> Option<IpNetwork> {
    Ipv4Network::new(Ipv4Addr::new(127, 0, 0, 0), 24)
        .ok()
        .map(IpNetwork::V4)
}

fn create_chains(_: &TopologyBuilder<'_>) -> Vec<PrimitiveOp> {
    CUSTOM_CHAINS
        .iter()
        .map(|(table, chain)| PrimitiveOp::create_chain(*table, chain))
        .collect()
}

fn mark_assignment(b: &TopologyBuilder<'_>) -> Vec<PrimitiveOp> {
    let mut ops = vec![
        append(
            Table::Mangle,
            "PREROUTING",
            Match::any(),
            Target::Jump("IPS".into()),
        ),
        // Traffic addressed to the firewall itself from WAN goes to the IPS
        append(
            Table::Mangle,
            "INPUT",
            Match::any().in_iface(b.wan()),
            Target::SetMark(Mark::SEND_TO_IPS),
        ),
    ];
    ops.extend(Zone::iter().map(|zone| {
        append(
            Table::Mangle,
            "FORWARD",
            Match::any().in_iface(b.zones.resolve(zone)),
            Target::SetMark(zone.mark()),
        )
    }));
    ops
}

fn default_policies(_: &TopologyBuilder<'_>) -> Vec<PrimitiveOp> {
    vec![
        PrimitiveOp::set_policy(Table::Filter, "FORWARD", Policy::Drop),
        PrimitiveOp::set_policy(Table::Filter, "INPUT", Policy::Drop),
        PrimitiveOp::set_policy(Table::Filter, "OUTPUT", Policy::Accept),
    ]
}

fn connection_tracking(_: &TopologyBuilder<'_>) -> Vec<PrimitiveOp> {
    ["FORWARD", "INPUT"]
        .into_iter()
        .map(|chain| filter(chain, Match::any().ctstate(CTSTATE_RETURN), Target::Accept))
        .collect()
}

fn bypass_prevention(b: &TopologyBuilder<'_>) -> Vec<PrimitiveOp> {
    let internal = || Match::any().not_in_iface(b.wan());
    let mut ops = vec![
        // DNS over TLS
        filter(
            "FORWARD",
            internal().proto(Protocol::Udp).dport(853),
            Target::Reject(Some(RejectWith::IcmpPortUnreachable)),
        ),
        filter(
            "FORWARD",
            internal().proto(Protocol::Tcp).dport(853),
            Target::Reject(Some(RejectWith::TcpReset)),
        ),
        // Plain DNS over TCP to public resolvers
        filter(
            "FORWARD",
            internal().proto(Protocol::Tcp).dport(53),
            Target::Reject(Some(RejectWith::TcpReset)),
        ),
        filter("FORWARD", internal(), Target::Jump("DOH".into())),
    ];
    ops.extend(
        b.doh_resolvers
            .iter()
            .map(|ip| PrimitiveOp::append(Table::Filter, "DOH", doh_reject_rule(*ip))),
    );
    ops
}

fn inspection_queues(_: &TopologyBuilder<'_>) -> Vec<PrimitiveOp> {
    let mut ops: Vec<PrimitiveOp> = Zone::iter()
        .flat_map(|zone| {
            [Protocol::Tcp, Protocol::Udp].map(|proto| {
                filter(
                    "FORWARD",
                    Match::any().proto(proto).mark(zone.mark()),
                    Target::Queue(PROXY_QUEUE),
                )
            })
        })
        .collect();

    ops.extend([
        // Proxy drops still reach the IPS for flood accounting
        filter(
            "FORWARD",
            Match::any().mark(Mark::IP_PROXY_DROP),
            Target::Queue(IPS_QUEUE),
        ),
        filter(
            "FORWARD",
            Match::any()
                .proto(Protocol::Icmp)
                .icmp_type(ICMP_ECHO_REQUEST)
                .mark(Mark::WAN_IN),
            Target::Queue(IPS_QUEUE),
        ),
        filter(
            "FORWARD",
            Match::any().mark(Mark::SEND_TO_IPS),
            Target::Queue(IPS_QUEUE),
        ),
    ]);
    ops
}

fn zone_dispatch(b: &TopologyBuilder<'_>) -> Vec<PrimitiveOp> {
    let for_firewall = || Match::any().mark(Mark::SEND_TO_FIREWALL);
    let mut ops = vec![
        // No forwarding from WAN straight into LAN, even with a DSTNAT mapping
        filter(
            "FORWARD",
            for_firewall()
                .in_iface(b.wan())
                .out_iface(b.zones.resolve(Zone::Lan)),
            Target::Drop,
        ),
        filter(
            "FORWARD",
            for_firewall(),
            Target::Jump("GLOBAL_INTERFACE".into()),
        ),
    ];
    ops.extend(Zone::iter().map(|zone| {
        filter(
            "FORWARD",
            for_firewall().in_iface(b.zones.resolve(zone)),
            Target::Jump(zone.chain().into()),
        )
    }));
    ops
}

fn firewall_services(b: &TopologyBuilder<'_>) -> Vec<PrimitiveOp> {
    let from_wan = || Match::any().in_iface(b.wan()).mark(Mark::SEND_TO_IPS);
    let internal = || Match::any().not_in_iface(b.wan());

    let mut ops = vec![
        filter(
            "INPUT",
            Match::any()
                .dst(IpNetwork::from(IpAddr::V4(LOCAL_STUB_RESOLVER)))
                .proto(Protocol::Udp)
                .dport(53),
            Target::Accept,
        ),
        // Port scan and flood detection for traffic to the firewall itself
        filter(
            "INPUT",
            from_wan().proto(Protocol::Tcp),
            Target::Queue(IPS_QUEUE),
        ),
        filter(
            "INPUT",
            from_wan().proto(Protocol::Udp),
            Target::Queue(IPS_QUEUE),
        ),
        filter(
            "INPUT",
            from_wan()
                .proto(Protocol::Icmp)
                .icmp_type(ICMP_ECHO_REQUEST),
            Target::Queue(IPS_QUEUE),
        ),
        filter("INPUT", internal().proto(Protocol::Icmp), Target::Accept),
    ];

    if let Some(loopback) = loopback_network() {
        ops.push(filter(
            "INPUT",
            internal().src(loopback).dst(loopback),
            Target::Accept,
        ));
    }

    // DHCP, DNS relay, web UI
    for (proto, port) in [
        (Protocol::Udp, 67),
        (Protocol::Udp, 53),
        (Protocol::Tcp, 443),
        (Protocol::Tcp, 80),
    ] {
        ops.push(filter(
            "INPUT",
            internal().proto(proto).dport(port),
            Target::Accept,
        ));
    }
    ops
}

fn nat(b: &TopologyBuilder<'_>) -> Vec<PrimitiveOp> {
    let rule = RuleSpec::new;
    vec![
        PrimitiveOp::insert(
            Table::Nat,
            "POSTROUTING",
            1,
            rule(Match::any(), Target::Jump("SRCNAT".into())),
        ),
        PrimitiveOp::insert(
            Table::Nat,
            "PREROUTING",
            1,
            rule(Match::any(), Target::Jump("DSTNAT".into())),
        ),
        PrimitiveOp::append(
            Table::Nat,
            "POSTROUTING",
            rule(Match::any().out_iface(b.wan()), Target::Masquerade),
        ),
        // Internal DNS goes to the local proxy regardless of the resolver asked
        PrimitiveOp::insert(
            Table::Nat,
            "PREROUTING",
            1,
            rule(
                Match::any()
                    .not_in_iface(b.wan())
                    .proto(Protocol::Udp)
                    .dport(53),
                Target::Redirect(b.resolver_port),
            ),
        ),
    ]
}

fn kernel_settings(_: &TopologyBuilder<'_>) -> Vec<PrimitiveOp> {
    let mut ops = vec![PrimitiveOp::SetForwarding(true)];
    ops.extend(
        ["INPUT", "FORWARD", "OUTPUT"].map(|chain| PrimitiveOp::SetIpv6Policy {
            chain: chain.to_string(),
            policy: Policy::Drop,
        }),
    );
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::MemoryEngine;
    use crate::core::test_helpers::test_registry;

    fn planned(step: &str) -> Vec<String> {
        let zones = test_registry();
        TopologyBuilder::new(&zones)
            .plan()
            .into_iter()
            .filter(|p| p.step == step)
            .map(|p| p.op.to_string())
            .collect()
    }

    #[test]
    fn test_step_names_in_order() {
        let names: Vec<&str> = BUILD_STEPS.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            [
                "create_chains",
                "mark_assignment",
                "default_policies",
                "connection_tracking",
                "bypass_prevention",
                "inspection_queues",
                "zone_dispatch",
                "firewall_services",
                "nat",
                "kernel_settings",
            ]
        );
    }

    #[test]
    fn test_zone_chains_are_created() {
        for zone in Zone::iter() {
            assert!(CUSTOM_CHAINS.contains(&(Table::Filter, zone.chain())));
        }
    }

    #[test]
    fn test_mark_assignment() {
        assert_eq!(
            planned("mark_assignment"),
            [
                "iptables -t mangle -A PREROUTING -j IPS",
                "iptables -t mangle -A INPUT -i eth0 -j MARK --set-mark 21",
                "iptables -t mangle -A FORWARD -i eth0 -j MARK --set-mark 10",
                "iptables -t mangle -A FORWARD -i eth1 -j MARK --set-mark 11",
                "iptables -t mangle -A FORWARD -i eth2 -j MARK --set-mark 12",
            ]
        );
    }

    #[test]
    fn test_proxy_queue_precedes_ips_queue() {
        let ops = planned("inspection_queues");
        let last_proxy = ops
            .iter()
            .rposition(|op| op.ends_with("--queue-num 1"))
            .unwrap();
        let first_ips = ops
            .iter()
            .position(|op| op.ends_with("--queue-num 2"))
            .unwrap();
        assert!(last_proxy < first_ips);
        assert_eq!(ops.len(), 9);
    }

    #[test]
    fn test_wan_to_lan_drop_precedes_zone_jumps() {
        let ops = planned("zone_dispatch");
        assert_eq!(
            ops[0],
            "iptables -t filter -A FORWARD -i eth0 -o eth1 -m mark --mark 20 -j DROP"
        );
        assert_eq!(
            ops[1],
            "iptables -t filter -A FORWARD -m mark --mark 20 -j GLOBAL_INTERFACE"
        );
        assert!(ops[4].ends_with("-i eth2 -m mark --mark 20 -j DMZ_INTERFACE"));
    }

    #[test]
    fn test_resolver_redirect_port() {
        let zones = test_registry();
        let ops: Vec<String> = TopologyBuilder::new(&zones)
            .with_resolver_port(5353)
            .plan()
            .into_iter()
            .filter(|p| p.step == "nat")
            .map(|p| p.op.to_string())
            .collect();
        assert_eq!(
            ops[3],
            "iptables -t nat -I PREROUTING 1 ! -i eth0 -p udp --dport 53 -j REDIRECT --to-ports 5353"
        );
    }

    #[test]
    fn test_doh_list_becomes_reject_rules() {
        let zones = test_registry();
        let list = DohList::from_text("1.1.1.1\n# comment\n\n8.8.8.8 dns.google\n");
        let ops: Vec<String> = TopologyBuilder::new(&zones)
            .with_doh_list(&list)
            .plan()
            .into_iter()
            .filter(|p| p.step == "bypass_prevention")
            .map(|p| p.op.to_string())
            .collect();
        assert_eq!(ops.len(), 6);
        assert_eq!(
            ops[5],
            "iptables -t filter -A DOH -d 8.8.8.8/32 -p tcp --dport 443 -j REJECT --reject-with tcp-reset"
        );
    }

    #[test]
    fn test_apply_on_fresh_engine_is_clean() {
        let zones = test_registry();
        let mut engine = MemoryEngine::new();
        let report = TopologyBuilder::new(&zones).apply(&mut engine);

        assert!(report.is_clean(), "{:?}", report.failures);
        assert_eq!(report.attempted, TopologyBuilder::new(&zones).plan().len());
        assert_eq!(engine.policy(Table::Filter, "FORWARD"), Some(Policy::Drop));
        assert_eq!(engine.policy(Table::Filter, "OUTPUT"), Some(Policy::Accept));
        assert_eq!(engine.ipv6_policy("OUTPUT"), Some(Policy::Drop));
        assert!(engine.forwarding());

        let forward = engine.rules(Table::Filter, "FORWARD").unwrap();
        assert_eq!(forward[0], "-m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT");

        // SRCNAT jump is evaluated before the masquerade rule
        assert_eq!(
            engine.rules(Table::Nat, "POSTROUTING").unwrap(),
            ["-j SRCNAT", "-o eth0 -j MASQUERADE"]
        );
    }

    #[test]
    fn test_failures_are_collected_not_fatal() {
        let zones = test_registry();
        let mut engine = MemoryEngine::new();
        engine.fail_calls_matching("-N DOH");

        let report = TopologyBuilder::new(&zones).apply(&mut engine);

        // The chain creation and the FORWARD jump to it both fail
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].step, "create_chains");
        assert_eq!(report.failures[1].step, "bypass_prevention");
        assert_eq!(report.succeeded(), report.attempted - 2);
        assert!(engine.forwarding());
    }
}
