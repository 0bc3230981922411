//! iptables-backed [`PacketFilter`]
//!
//! Each primitive runs one elevated process. Non-zero exits become
//! [`Error::PrimitiveCallFailed`] carrying the rendered call and stderr.

use crate::core::engine::{PacketFilter, Policy, Position, PrimitiveOp, RuleSpec, Table};
use crate::core::error::{Error, Result};
use crate::elevation::{Program, create_elevated_command};
use std::io::Write;
use std::process::{Output, Stdio};
use tracing::{debug, error, info};

/// Engine that shells out to the iptables tool family.
#[derive(Debug, Clone, Default)]
pub struct IptablesEngine {
    /// Pass `-w` so iptables waits for the xtables lock instead of failing
    wait_for_xtables_lock: bool,
}

impl IptablesEngine {
    pub fn new() -> Self {
        Self {
            wait_for_xtables_lock: true,
        }
    }

    fn run(&self, op: &PrimitiveOp) -> Result<()> {
        let (name, mut args) = op.command_line();
        let program = Program::from_name(name)
            .ok_or_else(|| Error::validation("program", format!("{name} cannot be elevated")))?;

        if self.wait_for_xtables_lock && matches!(program, Program::Iptables | Program::Ip6tables)
        {
            args.insert(0, "-w".to_string());
        }

        debug!("exec: {op}");
        let output = create_elevated_command(program, &args)?
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_failure(&op.to_string(), &e))?;

        check(&op.to_string(), &output)
    }
}

fn spawn_failure(call: &str, e: &std::io::Error) -> Error {
    io_failure(call, "spawn", e)
}

fn io_failure(call: &str, action: &str, e: &std::io::Error) -> Error {
    error!("Failed to {action} `{call}`: {e}");
    Error::PrimitiveCallFailed {
        call: call.to_string(),
        message: format!("failed to {action}: {e}"),
        stderr: None,
        exit_code: None,
    }
}

fn check(call: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    error!("`{call}` failed: {stderr}");
    Err(Error::PrimitiveCallFailed {
        call: call.to_string(),
        message: stderr.lines().next().unwrap_or("engine rejected the call").to_string(),
        stderr: Some(stderr),
        exit_code: output.status.code(),
    })
}

impl PacketFilter for IptablesEngine {
    fn create_chain(&mut self, table: Table, chain: &str) -> Result<()> {
        self.run(&PrimitiveOp::create_chain(table, chain))
    }

    fn set_default_policy(&mut self, table: Table, chain: &str, policy: Policy) -> Result<()> {
        self.run(&PrimitiveOp::set_policy(table, chain, policy))
    }

    fn insert_rule(
        &mut self,
        table: Table,
        chain: &str,
        position: Position,
        rule: &RuleSpec,
    ) -> Result<()> {
        self.run(&PrimitiveOp::Insert {
            table,
            chain: chain.to_string(),
            position,
            rule: rule.clone(),
        })
    }

    fn delete_rule(&mut self, table: Table, chain: &str, position: u32) -> Result<()> {
        self.run(&PrimitiveOp::delete(table, chain, position))
    }

    fn delete_matching(&mut self, table: Table, chain: &str, rule: &RuleSpec) -> Result<()> {
        self.run(&PrimitiveOp::DeleteMatching {
            table,
            chain: chain.to_string(),
            rule: rule.clone(),
        })
    }

    fn flush_chain(&mut self, table: Table, chain: &str) -> Result<()> {
        self.run(&PrimitiveOp::Flush {
            table,
            chain: chain.to_string(),
        })
    }

    fn dump_ruleset(&self, table: Option<Table>) -> Result<String> {
        let args: Vec<String> = match table {
            Some(table) => vec!["-t".into(), table.to_string()],
            None => Vec::new(),
        };
        let call = format!("iptables-save {}", args.join(" "));

        let output = create_elevated_command(Program::IptablesSave, &args)?
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_failure(&call, &e))?;
        check(&call, &output)?;

        String::from_utf8(output.stdout).map_err(|e| Error::PrimitiveCallFailed {
            call,
            message: format!("non UTF-8 ruleset dump: {e}"),
            stderr: None,
            exit_code: None,
        })
    }

    fn load_ruleset(&mut self, blob: &str) -> Result<()> {
        let call = "iptables-restore".to_string();
        info!("Loading ruleset via iptables-restore ({} bytes)", blob.len());

        let mut child = create_elevated_command(Program::IptablesRestore, &[])?
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_failure(&call, &e))?;

        // stdin is dropped after the write so the child sees EOF
        let written = child
            .stdin
            .take()
            .map_or(Ok(()), |mut stdin| stdin.write_all(blob.as_bytes()));

        let output = child
            .wait_with_output()
            .map_err(|e| io_failure(&call, "wait for", &e))?;
        check(&call, &output)?;

        written.map_err(|e| Error::PrimitiveCallFailed {
            message: format!("failed to write ruleset: {e}"),
            call,
            stderr: None,
            exit_code: output.status.code(),
        })
    }

    fn set_kernel_forwarding(&mut self, enabled: bool) -> Result<()> {
        self.run(&PrimitiveOp::SetForwarding(enabled))
    }

    fn set_ipv6_default_policy(&mut self, chain: &str, policy: Policy) -> Result<()> {
        self.run(&PrimitiveOp::SetIpv6Policy {
            chain: chain.to_string(),
            policy,
        })
    }
}
