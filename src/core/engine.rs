//! Packet-filter engine primitives
//!
//! The control plane never talks to iptables directly. Every change goes
//! through [`PacketFilter`], whose methods map one-to-one onto the engine
//! primitives (create chain, set policy, insert/delete at a position, dump,
//! load, forwarding toggle). [`PrimitiveOp`] is the recorded form of one such
//! call; translators and the topology builder produce `PrimitiveOp`s and the
//! controller applies them.
//!
//! Rules are modelled as a [`Match`] predicate plus a [`Target`] and rendered
//! to iptables argument vectors by [`RuleSpec::to_args`].

use crate::core::error::{Error, Result};
use crate::core::zones::Mark;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Netfilter table
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
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Table {
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
    #[strum(serialize = "mangle")]
    Mangle,
}

impl Table {
    /// Built-in chains of the table, in `iptables-save` order.
    pub const fn builtin_chains(self) -> &'static [&'static str] {
        match self {
            Table::Filter => &["INPUT", "FORWARD", "OUTPUT"],
            Table::Nat => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
            Table::Mangle => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
        }
    }
}

/// Default policy of a built-in chain
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum Policy {
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
}

/// Where an inserted rule lands. Positions are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    At(u32),
    Append,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::At(n) => write!(f, "{n}"),
            Position::Append => write!(f, "APPEND"),
        }
    }
}

/// Layer-4 protocol match
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
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    /// No protocol match; port matching is never emitted
    #[default]
    #[strum(serialize = "any")]
    Any,
    #[strum(serialize = "icmp")]
    Icmp,
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    pub const fn supports_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }

    /// Parses a policy protocol name. Anything outside any/icmp/tcp/udp is
    /// rejected before a rule reaches the engine.
    pub fn parse(name: &str) -> Result<Self> {
        name.trim()
            .parse()
            .map_err(|_| Error::UnsupportedRuleKind(format!("protocol '{name}'")))
    }
}

/// Interface match, optionally negated (`! -i eth0`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iface {
    pub name: String,
    pub negated: bool,
}

/// ICMP message type used for echo requests
pub const ICMP_ECHO_REQUEST: u8 = 8;

/// Rule match predicate. Unset fields do not constrain the packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Match {
    pub in_interface: Option<Iface>,
    pub out_interface: Option<Iface>,
    pub protocol: Protocol,
    pub source: Option<IpNetwork>,
    pub destination: Option<IpNetwork>,
    pub icmp_type: Option<u8>,
    pub dport: Option<u16>,
    pub mark: Option<Mark>,
    pub ctstate: Option<&'static str>,
}

impl Match {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn in_iface(mut self, name: &str) -> Self {
        self.in_interface = Some(Iface {
            name: name.to_string(),
            negated: false,
        });
        self
    }

    pub fn not_in_iface(mut self, name: &str) -> Self {
        self.in_interface = Some(Iface {
            name: name.to_string(),
            negated: true,
        });
        self
    }

    pub fn out_iface(mut self, name: &str) -> Self {
        self.out_interface = Some(Iface {
            name: name.to_string(),
            negated: false,
        });
        self
    }

    pub fn proto(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn src(mut self, network: IpNetwork) -> Self {
        self.source = Some(network);
        self
    }

    pub fn dst(mut self, network: IpNetwork) -> Self {
        self.destination = Some(network);
        self
    }

    pub fn icmp_type(mut self, icmp_type: u8) -> Self {
        self.icmp_type = Some(icmp_type);
        self
    }

    pub fn dport(mut self, port: u16) -> Self {
        self.dport = Some(port);
        self
    }

    pub fn mark(mut self, mark: Mark) -> Self {
        self.mark = Some(mark);
        self
    }

    pub fn ctstate(mut self, states: &'static str) -> Self {
        self.ctstate = Some(states);
        self
    }
}

/// Reject response
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RejectWith {
    #[strum(serialize = "tcp-reset")]
    TcpReset,
    #[strum(serialize = "icmp-port-unreachable")]
    IcmpPortUnreachable,
}

/// Rule target (`-j ...`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Accept,
    Drop,
    Reject(Option<RejectWith>),
    Jump(String),
    Queue(u16),
    SetMark(Mark),
    Masquerade,
    Redirect(u16),
    Dnat { to: IpAddr, port: Option<u16> },
    Snat { to: IpAddr },
}

/// A single engine-level rule: predicate plus target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub matches: Match,
    pub target: Target,
}

impl RuleSpec {
    pub fn new(matches: Match, target: Target) -> Self {
        Self { matches, target }
    }

    /// Whether any address in the rule is IPv6, which `iptables` refuses.
    pub fn mentions_ipv6(&self) -> bool {
        let m = &self.matches;
        let target_ip = match self.target {
            Target::Dnat { to, .. } | Target::Snat { to } => Some(to),
            _ => None,
        };
        m.source.is_some_and(|n| n.is_ipv6())
            || m.destination.is_some_and(|n| n.is_ipv6())
            || target_ip.is_some_and(|ip| ip.is_ipv6())
    }

    /// Renders the rule as iptables arguments (everything after the chain name).
    pub fn to_args(&self) -> Vec<String> {
        let m = &self.matches;
        let mut args: Vec<String> = Vec::with_capacity(16);

        if let Some(ref iface) = m.in_interface {
            if iface.negated {
                args.push("!".into());
            }
            args.extend(["-i".into(), iface.name.clone()]);
        }
        if let Some(ref iface) = m.out_interface {
            if iface.negated {
                args.push("!".into());
            }
            args.extend(["-o".into(), iface.name.clone()]);
        }
        if let Some(src) = m.source {
            args.extend(["-s".into(), src.to_string()]);
        }
        if let Some(dst) = m.destination {
            args.extend(["-d".into(), dst.to_string()]);
        }
        if m.protocol != Protocol::Any {
            args.extend(["-p".into(), m.protocol.as_ref().to_string()]);
        }
        if let Some(icmp_type) = m.icmp_type
            && m.protocol == Protocol::Icmp
        {
            args.extend(["--icmp-type".into(), icmp_type.to_string()]);
        }
        if let Some(port) = m.dport
            && m.protocol.supports_ports()
        {
            args.extend(["--dport".into(), port.to_string()]);
        }
        if let Some(mark) = m.mark {
            args.extend(["-m".into(), "mark".into(), "--mark".into(), mark.to_string()]);
        }
        if let Some(states) = m.ctstate {
            args.extend([
                "-m".into(),
                "conntrack".into(),
                "--ctstate".into(),
                states.to_string(),
            ]);
        }

        args.push("-j".into());
        match &self.target {
            Target::Accept => args.push("ACCEPT".into()),
            Target::Drop => args.push("DROP".into()),
            Target::Reject(with) => {
                args.push("REJECT".into());
                if let Some(with) = with {
                    args.extend(["--reject-with".into(), with.to_string()]);
                }
            }
            Target::Jump(chain) => args.push(chain.clone()),
            Target::Queue(num) => {
                args.extend(["NFQUEUE".into(), "--queue-num".into(), num.to_string()]);
            }
            Target::SetMark(mark) => {
                args.extend(["MARK".into(), "--set-mark".into(), mark.to_string()]);
            }
            Target::Masquerade => args.push("MASQUERADE".into()),
            Target::Redirect(port) => {
                args.extend(["REDIRECT".into(), "--to-ports".into(), port.to_string()]);
            }
            Target::Dnat { to, port } => {
                let dest = match port {
                    Some(port) => format!("{to}:{port}"),
                    None => to.to_string(),
                };
                args.extend(["DNAT".into(), "--to-destination".into(), dest]);
            }
            Target::Snat { to } => {
                args.extend(["SNAT".into(), "--to-source".into(), to.to_string()]);
            }
        }
        args
    }

    /// Custom chain this rule jumps to, if any.
    pub fn jump_target(&self) -> Option<&str> {
        match &self.target {
            Target::Jump(chain) => Some(chain),
            _ => None,
        }
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_args().join(" "))
    }
}

/// One recorded call against the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveOp {
    CreateChain {
        table: Table,
        chain: String,
    },
    SetPolicy {
        table: Table,
        chain: String,
        policy: Policy,
    },
    Insert {
        table: Table,
        chain: String,
        position: Position,
        rule: RuleSpec,
    },
    Delete {
        table: Table,
        chain: String,
        position: u32,
    },
    DeleteMatching {
        table: Table,
        chain: String,
        rule: RuleSpec,
    },
    Flush {
        table: Table,
        chain: String,
    },
    SetForwarding(bool),
    SetIpv6Policy {
        chain: String,
        policy: Policy,
    },
}

impl PrimitiveOp {
    pub fn create_chain(table: Table, chain: &str) -> Self {
        PrimitiveOp::CreateChain {
            table,
            chain: chain.to_string(),
        }
    }

    pub fn set_policy(table: Table, chain: &str, policy: Policy) -> Self {
        PrimitiveOp::SetPolicy {
            table,
            chain: chain.to_string(),
            policy,
        }
    }

    pub fn append(table: Table, chain: &str, rule: RuleSpec) -> Self {
        PrimitiveOp::Insert {
            table,
            chain: chain.to_string(),
            position: Position::Append,
            rule,
        }
    }

    pub fn insert(table: Table, chain: &str, position: u32, rule: RuleSpec) -> Self {
        PrimitiveOp::Insert {
            table,
            chain: chain.to_string(),
            position: Position::At(position),
            rule,
        }
    }

    pub fn delete(table: Table, chain: &str, position: u32) -> Self {
        PrimitiveOp::Delete {
            table,
            chain: chain.to_string(),
            position,
        }
    }

    /// Program and argument vector implementing this call.
    pub fn command_line(&self) -> (&'static str, Vec<String>) {
        let table_args = |table: &Table| vec!["-t".to_string(), table.to_string()];
        match self {
            PrimitiveOp::CreateChain { table, chain } => {
                let mut args = table_args(table);
                args.extend(["-N".into(), chain.clone()]);
                ("iptables", args)
            }
            PrimitiveOp::SetPolicy {
                table,
                chain,
                policy,
            } => {
                let mut args = table_args(table);
                args.extend(["-P".into(), chain.clone(), policy.to_string()]);
                ("iptables", args)
            }
            PrimitiveOp::Insert {
                table,
                chain,
                position,
                rule,
            } => {
                let mut args = table_args(table);
                match position {
                    Position::At(n) => args.extend(["-I".into(), chain.clone(), n.to_string()]),
                    Position::Append => args.extend(["-A".into(), chain.clone()]),
                }
                args.extend(rule.to_args());
                ("iptables", args)
            }
            PrimitiveOp::Delete {
                table,
                chain,
                position,
            } => {
                let mut args = table_args(table);
                args.extend(["-D".into(), chain.clone(), position.to_string()]);
                ("iptables", args)
            }
            PrimitiveOp::DeleteMatching { table, chain, rule } => {
                let mut args = table_args(table);
                args.extend(["-D".into(), chain.clone()]);
                args.extend(rule.to_args());
                ("iptables", args)
            }
            PrimitiveOp::Flush { table, chain } => {
                let mut args = table_args(table);
                args.extend(["-F".into(), chain.clone()]);
                ("iptables", args)
            }
            PrimitiveOp::SetForwarding(enabled) => (
                "sysctl",
                vec![
                    "-w".into(),
                    format!("net.ipv4.ip_forward={}", u8::from(*enabled)),
                ],
            ),
            PrimitiveOp::SetIpv6Policy { chain, policy } => (
                "ip6tables",
                vec!["-P".into(), chain.clone(), policy.to_string()],
            ),
        }
    }

    /// Table and chain this call touches, for chain-scoped calls.
    pub fn chain(&self) -> Option<(Table, &str)> {
        match self {
            PrimitiveOp::CreateChain { table, chain }
            | PrimitiveOp::SetPolicy { table, chain, .. }
            | PrimitiveOp::Insert { table, chain, .. }
            | PrimitiveOp::Delete { table, chain, .. }
            | PrimitiveOp::DeleteMatching { table, chain, .. }
            | PrimitiveOp::Flush { table, chain } => Some((*table, chain.as_str())),
            PrimitiveOp::SetForwarding(_) | PrimitiveOp::SetIpv6Policy { .. } => None,
        }
    }

    /// Executes this call against `engine`.
    pub fn apply(&self, engine: &mut dyn PacketFilter) -> Result<()> {
        match self {
            PrimitiveOp::CreateChain { table, chain } => engine.create_chain(*table, chain),
            PrimitiveOp::SetPolicy {
                table,
                chain,
                policy,
            } => engine.set_default_policy(*table, chain, *policy),
            PrimitiveOp::Insert {
                table,
                chain,
                position,
                rule,
            } => engine.insert_rule(*table, chain, *position, rule),
            PrimitiveOp::Delete {
                table,
                chain,
                position,
            } => engine.delete_rule(*table, chain, *position),
            PrimitiveOp::DeleteMatching { table, chain, rule } => {
                engine.delete_matching(*table, chain, rule)
            }
            PrimitiveOp::Flush { table, chain } => engine.flush_chain(*table, chain),
            PrimitiveOp::SetForwarding(enabled) => engine.set_kernel_forwarding(*enabled),
            PrimitiveOp::SetIpv6Policy { chain, policy } => {
                engine.set_ipv6_default_policy(chain, *policy)
            }
        }
    }
}

impl fmt::Display for PrimitiveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (program, args) = self.command_line();
        write!(f, "{program} {}", args.join(" "))
    }
}

/// The primitive set exposed by the packet-filter engine.
///
/// Each call is atomic at the single-rule level and applied to live state
/// immediately; there is no staging or transaction primitive. A rejected call
/// returns [`crate::Error::PrimitiveCallFailed`].
pub trait PacketFilter {
    fn create_chain(&mut self, table: Table, chain: &str) -> Result<()>;

    fn set_default_policy(&mut self, table: Table, chain: &str, policy: Policy) -> Result<()>;

    fn insert_rule(
        &mut self,
        table: Table,
        chain: &str,
        position: Position,
        rule: &RuleSpec,
    ) -> Result<()>;

    /// Deletes the rule at a 1-based position. Later rules shift down by one.
    fn delete_rule(&mut self, table: Table, chain: &str, position: u32) -> Result<()>;

    /// Deletes the first rule whose predicate and target equal `rule`.
    fn delete_matching(&mut self, table: Table, chain: &str, rule: &RuleSpec) -> Result<()>;

    fn flush_chain(&mut self, table: Table, chain: &str) -> Result<()>;

    /// Serializes one table, or every table when `table` is `None`.
    fn dump_ruleset(&self, table: Option<Table>) -> Result<String>;

    /// Replaces the live ruleset with a previously dumped one.
    fn load_ruleset(&mut self, blob: &str) -> Result<()>;

    fn set_kernel_forwarding(&mut self, enabled: bool) -> Result<()>;

    fn set_ipv6_default_policy(&mut self, chain: &str, policy: Policy) -> Result<()>;
}
