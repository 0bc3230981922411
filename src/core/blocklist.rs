//! Bulk block-list maintenance
//!
//! [`BlocklistChannel`] keeps drop rules for bad actors on one dedicated chain.
//! Rules are appended and removed by exact predicate, never by position, so
//! the channel needs no position tracking and runs outside the policy lock.
//!
//! [`purge`](BlocklistChannel::purge) flushes the whole chain and is only
//! meant for proxy (re)initialization. Running it concurrently with
//! block/unblock on the same chain races deletions against insertions.
//!
//! The `DOH` chain holds reject rules for known DNS-over-HTTPS resolvers,
//! loaded from a list file by [`DohList`].

use crate::core::engine::{Match, PacketFilter, Position, Protocol, RejectWith, RuleSpec, Table, Target};
use crate::core::error::{Error, Result};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info, warn};

pub const DOH_CHAIN: &str = "DOH";
const HTTPS_PORT: u16 = 443;

/// Default chain for proxy block rules, the first chain consulted for
/// traffic cleared by inspection.
pub const DEFAULT_BLOCKLIST_CHAIN: &str = "GLOBAL_INTERFACE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocklistChannel {
    table: Table,
    chain: String,
}

impl BlocklistChannel {
    pub fn new(table: Table, chain: &str) -> Result<Self> {
        let chain = crate::validators::validate_chain_name(chain)
            .map_err(|message| Error::validation("chain", message))?;
        Ok(Self { table, chain })
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// The source and destination drop rules for `addr`.
    pub fn rules_for(addr: IpAddr) -> [RuleSpec; 2] {
        let host = IpNetwork::from(addr);
        [
            RuleSpec::new(Match::any().src(host), Target::Drop),
            RuleSpec::new(Match::any().dst(host), Target::Drop),
        ]
    }

    /// Drops all traffic from and to `addr`. The destination rule is only
    /// added once the source rule is in place.
    pub fn block(&self, engine: &mut dyn PacketFilter, addr: IpAddr) -> Result<()> {
        require_ipv4(addr)?;
        let [from, to] = Self::rules_for(addr);
        engine.insert_rule(self.table, &self.chain, Position::Append, &from)?;
        engine.insert_rule(self.table, &self.chain, Position::Append, &to)?;
        info!("Blocked {addr} on {}/{}", self.table, self.chain);
        Ok(())
    }

    /// Removes the pair added by [`Self::block`].
    pub fn unblock(&self, engine: &mut dyn PacketFilter, addr: IpAddr) -> Result<()> {
        require_ipv4(addr)?;
        let [from, to] = Self::rules_for(addr);
        engine.delete_matching(self.table, &self.chain, &from)?;
        engine.delete_matching(self.table, &self.chain, &to)?;
        info!("Unblocked {addr} on {}/{}", self.table, self.chain);
        Ok(())
    }

    /// Flushes every rule from the channel's chain.
    pub fn purge(&self, engine: &mut dyn PacketFilter) -> Result<()> {
        engine.flush_chain(self.table, &self.chain)?;
        info!("Purged {}/{}", self.table, self.chain);
        Ok(())
    }
}

fn require_ipv4(addr: IpAddr) -> Result<()> {
    crate::validators::require_ipv4(addr).map_err(|message| Error::validation("address", message))
}

/// DNS-over-HTTPS resolver addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DohList {
    resolvers: Vec<IpAddr>,
}

impl DohList {
    /// Parses list text: the first whitespace-delimited token of each line is
    /// the address; blank lines and `#` comments are skipped, and so are
    /// tokens that are not IPv4 addresses.
    pub fn from_text(text: &str) -> Self {
        let mut resolvers = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(token) = line.split_whitespace().next() else {
                continue;
            };
            match token.parse::<IpAddr>() {
                Ok(ip) if ip.is_ipv4() => resolvers.push(ip),
                Ok(_) => warn!("DoH list line {}: skipping IPv6 resolver {token}", index + 1),
                Err(_) => warn!("DoH list line {}: '{token}' is not an address", index + 1),
            }
        }
        Self { resolvers }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let list = Self::from_text(&text);
        debug!("Loaded {} DoH resolvers from {}", list.len(), path.display());
        Ok(list)
    }

    /// Loads the list, logging and returning an empty list on failure.
    pub fn load_or_skip(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!("Skipping DoH list {}: {e}", path.display());
            Self::default()
        })
    }

    pub fn resolvers(&self) -> &[IpAddr] {
        &self.resolvers
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

/// `DOH` chain rule resetting HTTPS connections to one resolver.
pub fn doh_reject_rule(ip: IpAddr) -> RuleSpec {
    RuleSpec::new(
        Match::any()
            .dst(IpNetwork::from(ip))
            .proto(Protocol::Tcp)
            .dport(HTTPS_PORT),
        Target::Reject(Some(RejectWith::TcpReset)),
    )
}

/// Appends a reject rule per resolver to the `DOH` chain. Stops at the first
/// rejected call; returns the number of rules added.
pub fn update_dns_over_https(engine: &mut dyn PacketFilter, list: &DohList) -> Result<usize> {
    for ip in list.resolvers() {
        engine.insert_rule(Table::Filter, DOH_CHAIN, Position::Append, &doh_reject_rule(*ip))?;
    }
    info!("Added {} DoH resolver rules", list.len());
    Ok(list.len())
}

/// Removes every DoH resolver rule.
pub fn clear_dns_over_https(engine: &mut dyn PacketFilter) -> Result<()> {
    engine.flush_chain(Table::Filter, DOH_CHAIN)?;
    info!("Cleared DoH resolver rules");
    Ok(())
}
