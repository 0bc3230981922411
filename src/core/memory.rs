//! In-memory [`PacketFilter`]
//!
//! Mirrors the observable behaviour of iptables closely enough to exercise the
//! control plane without privileges: built-in chains exist up front, custom
//! chains must be created before use (including as jump targets), positions
//! are 1-based and shift on delete, and dumps use the `iptables-save` layout so
//! a dump can be loaded back.
//!
//! Used by `zonewall --dry-run` and by the test suites.

use crate::core::engine::{PacketFilter, Policy, Position, PrimitiveOp, RuleSpec, Table};
use crate::core::error::{Error, Result};
use std::collections::BTreeMap;
use strum::IntoEnumIterator;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChainState {
    name: String,
    /// `None` for custom chains
    policy: Option<Policy>,
    rules: Vec<String>,
}

type Tables = BTreeMap<Table, Vec<ChainState>>;

/// Engine state held in memory, with a log of every attempted call
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    tables: Tables,
    ipv6_policies: BTreeMap<String, Policy>,
    forwarding: bool,
    calls: Vec<PrimitiveOp>,
    fail_patterns: Vec<String>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Fresh engine with only built-in chains, all policies ACCEPT.
    pub fn new() -> Self {
        Self {
            tables: pristine_tables(),
            ipv6_policies: BTreeMap::new(),
            forwarding: false,
            calls: Vec::new(),
            fail_patterns: Vec::new(),
        }
    }

    /// Makes every later call whose rendered form contains `pattern` fail.
    pub fn fail_calls_matching(&mut self, pattern: &str) {
        self.fail_patterns.push(pattern.to_string());
    }

    /// Every call attempted so far, in order, including rejected ones.
    pub fn calls(&self) -> &[PrimitiveOp] {
        &self.calls
    }

    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.chain(table, chain).is_some()
    }

    /// Rendered rules of a chain, in evaluation order.
    pub fn rules(&self, table: Table, chain: &str) -> Option<&[String]> {
        self.chain(table, chain).map(|c| c.rules.as_slice())
    }

    pub fn rule_count(&self, table: Table, chain: &str) -> usize {
        self.rules(table, chain).map_or(0, <[String]>::len)
    }

    pub fn policy(&self, table: Table, chain: &str) -> Option<Policy> {
        self.chain(table, chain).and_then(|c| c.policy)
    }

    pub fn ipv6_policy(&self, chain: &str) -> Option<Policy> {
        self.ipv6_policies.get(chain).copied()
    }

    pub fn forwarding(&self) -> bool {
        self.forwarding
    }

    fn chain(&self, table: Table, chain: &str) -> Option<&ChainState> {
        self.tables.get(&table)?.iter().find(|c| c.name == chain)
    }

    fn chain_mut(&mut self, table: Table, chain: &str) -> Result<&mut ChainState> {
        let call = format!("iptables -t {table} ... {chain}");
        self.tables
            .get_mut(&table)
            .and_then(|chains| chains.iter_mut().find(|c| c.name == chain))
            .ok_or_else(|| rejected(&call, "No chain/target/match by that name."))
    }

    /// Records the call and applies failure injection.
    fn begin(&mut self, op: PrimitiveOp) -> Result<String> {
        let call = op.to_string();
        self.calls.push(op);
        if self.fail_patterns.iter().any(|p| call.contains(p.as_str())) {
            return Err(rejected(&call, "injected failure"));
        }
        Ok(call)
    }
}

fn pristine_tables() -> Tables {
    Table::iter()
        .map(|table| {
            let chains = table
                .builtin_chains()
                .iter()
                .map(|name| ChainState {
                    name: (*name).to_string(),
                    policy: Some(Policy::Accept),
                    rules: Vec::new(),
                })
                .collect();
            (table, chains)
        })
        .collect()
}

fn rejected(call: &str, message: &str) -> Error {
    Error::PrimitiveCallFailed {
        call: call.to_string(),
        message: format!("iptables: {message}"),
        stderr: Some(format!("iptables: {message}")),
        exit_code: Some(1),
    }
}

impl PacketFilter for MemoryEngine {
    fn create_chain(&mut self, table: Table, chain: &str) -> Result<()> {
        let call = self.begin(PrimitiveOp::create_chain(table, chain))?;
        if self.has_chain(table, chain) {
            return Err(rejected(&call, "Chain already exists."));
        }
        self.tables.entry(table).or_default().push(ChainState {
            name: chain.to_string(),
            policy: None,
            rules: Vec::new(),
        });
        Ok(())
    }

    fn set_default_policy(&mut self, table: Table, chain: &str, policy: Policy) -> Result<()> {
        let call = self.begin(PrimitiveOp::set_policy(table, chain, policy))?;
        let state = self.chain_mut(table, chain).map_err(|_| {
            rejected(&call, "No chain/target/match by that name.")
        })?;
        if state.policy.is_none() {
            return Err(rejected(&call, "Bad built-in chain name."));
        }
        state.policy = Some(policy);
        Ok(())
    }

    fn insert_rule(
        &mut self,
        table: Table,
        chain: &str,
        position: Position,
        rule: &RuleSpec,
    ) -> Result<()> {
        let call = self.begin(PrimitiveOp::Insert {
            table,
            chain: chain.to_string(),
            position,
            rule: rule.clone(),
        })?;
        if rule.mentions_ipv6() {
            return Err(rejected(&call, "host/network not found"));
        }
        if let Some(target) = rule.jump_target()
            && !self.has_chain(table, target)
        {
            return Err(rejected(&call, "No chain/target/match by that name."));
        }
        let state = self
            .chain_mut(table, chain)
            .map_err(|_| rejected(&call, "No chain/target/match by that name."))?;
        let rendered = rule.to_string();
        match position {
            Position::Append => state.rules.push(rendered),
            Position::At(n) => {
                let n = n as usize;
                if n == 0 || n > state.rules.len() + 1 {
                    return Err(rejected(&call, "Index of insertion too big."));
                }
                state.rules.insert(n - 1, rendered);
            }
        }
        Ok(())
    }

    fn delete_rule(&mut self, table: Table, chain: &str, position: u32) -> Result<()> {
        let call = self.begin(PrimitiveOp::delete(table, chain, position))?;
        let state = self
            .chain_mut(table, chain)
            .map_err(|_| rejected(&call, "No chain/target/match by that name."))?;
        let n = position as usize;
        if n == 0 || n > state.rules.len() {
            return Err(rejected(&call, "Index of deletion too big."));
        }
        state.rules.remove(n - 1);
        Ok(())
    }

    fn delete_matching(&mut self, table: Table, chain: &str, rule: &RuleSpec) -> Result<()> {
        let call = self.begin(PrimitiveOp::DeleteMatching {
            table,
            chain: chain.to_string(),
            rule: rule.clone(),
        })?;
        let state = self
            .chain_mut(table, chain)
            .map_err(|_| rejected(&call, "No chain/target/match by that name."))?;
        let rendered = rule.to_string();
        match state.rules.iter().position(|r| *r == rendered) {
            Some(index) => {
                state.rules.remove(index);
                Ok(())
            }
            None => Err(rejected(
                &call,
                "Bad rule (does a matching rule exist in that chain?).",
            )),
        }
    }

    fn flush_chain(&mut self, table: Table, chain: &str) -> Result<()> {
        let call = self.begin(PrimitiveOp::Flush {
            table,
            chain: chain.to_string(),
        })?;
        self.chain_mut(table, chain)
            .map_err(|_| rejected(&call, "No chain/target/match by that name."))?
            .rules
            .clear();
        Ok(())
    }

    fn dump_ruleset(&self, table: Option<Table>) -> Result<String> {
        let mut out = String::new();
        for (name, chains) in &self.tables {
            if table.is_some_and(|t| t != *name) {
                continue;
            }
            out.push_str(&format!("*{name}\n"));
            for chain in chains {
                let policy = chain.policy.map_or_else(|| "-".to_string(), |p| p.to_string());
                out.push_str(&format!(":{} {policy} [0:0]\n", chain.name));
            }
            for chain in chains {
                for rule in &chain.rules {
                    out.push_str(&format!("-A {} {rule}\n", chain.name));
                }
            }
            out.push_str("COMMIT\n");
        }
        Ok(out)
    }

    fn load_ruleset(&mut self, blob: &str) -> Result<()> {
        let parsed = parse_save_format(blob)?;
        // Tables absent from the dump are left untouched, as iptables-restore does
        for (table, chains) in parsed {
            self.tables.insert(table, chains);
        }
        Ok(())
    }

    fn set_kernel_forwarding(&mut self, enabled: bool) -> Result<()> {
        self.begin(PrimitiveOp::SetForwarding(enabled))?;
        self.forwarding = enabled;
        Ok(())
    }

    fn set_ipv6_default_policy(&mut self, chain: &str, policy: Policy) -> Result<()> {
        self.begin(PrimitiveOp::SetIpv6Policy {
            chain: chain.to_string(),
            policy,
        })?;
        self.ipv6_policies.insert(chain.to_string(), policy);
        Ok(())
    }
}

fn parse_save_format(blob: &str) -> Result<Tables> {
    let fail = |line_no: usize, why: &str| {
        rejected(
            "iptables-restore",
            &format!("line {line_no} failed: {why}"),
        )
    };

    let mut tables = Tables::new();
    let mut current: Option<(Table, Vec<ChainState>)> = None;

    for (index, raw) in blob.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('*') {
            let table: Table = name.parse().map_err(|_| fail(line_no, "unknown table"))?;
            current = Some((table, Vec::new()));
        } else if line == "COMMIT" {
            let (table, chains) = current.take().ok_or_else(|| fail(line_no, "COMMIT outside table"))?;
            tables.insert(table, chains);
        } else if let Some(decl) = line.strip_prefix(':') {
            let (_, chains) = current.as_mut().ok_or_else(|| fail(line_no, "chain outside table"))?;
            let mut parts = decl.split_whitespace();
            let name = parts.next().ok_or_else(|| fail(line_no, "missing chain name"))?;
            let policy = match parts.next() {
                Some("-") | None => None,
                Some(p) => Some(p.parse::<Policy>().map_err(|_| fail(line_no, "bad policy"))?),
            };
            chains.push(ChainState {
                name: name.to_string(),
                policy,
                rules: Vec::new(),
            });
        } else if let Some(rest) = line.strip_prefix("-A ") {
            let (_, chains) = current.as_mut().ok_or_else(|| fail(line_no, "rule outside table"))?;
            let (chain, rule) = rest
                .split_once(' ')
                .ok_or_else(|| fail(line_no, "rule without body"))?;
            let state = chains
                .iter_mut()
                .find(|c| c.name == chain)
                .ok_or_else(|| fail(line_no, "rule for undeclared chain"))?;
            state.rules.push(rule.to_string());
        } else {
            return Err(fail(line_no, "unrecognised line"));
        }
    }

    if current.is_some() {
        return Err(fail(blob.lines().count(), "missing COMMIT"));
    }
    Ok(tables)
}
