//! zonewall - zone-based iptables firewall control plane
//!
//! # Usage
//!
//! ```bash
//! zonewall apply-defaults                         # Build the base topology and commit it
//! zonewall add-rule --chain LAN --position 1 --protocol tcp \
//!     --source 192.168.1.0/24 --port 22 --action ACCEPT
//! zonewall delete-rule --chain LAN --position 1
//! zonewall add-nat --type DSTNAT --zone WAN --protocol tcp --port 8080 \
//!     --host 192.168.1.10 --host-port 80
//! zonewall add-nat --type SRCNAT --zone LAN --orig-src 192.168.1.0/24 --new-src 203.0.113.5
//! zonewall block 198.51.100.7                     # Proxy block-list, not committed
//! zonewall restore                                # Reload the last committed ruleset
//! zonewall --dry-run add-rule ...                 # Print the calls instead of running them
//! ```
//!
//! Every failure exits with a stable code per error kind (see
//! [`ErrorKind::exit_code`]).

use clap::{Args, Parser, Subcommand};
use ipnetwork::IpNetwork;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zonewall::audit::{self, EventType};
use zonewall::config::{self, AppConfig};
use zonewall::core::backup::BackupStore;
use zonewall::core::blocklist::{self, BlocklistChannel, DohList};
use zonewall::core::controller::{LockMode, MutationController};
use zonewall::core::engine::{PacketFilter, Protocol, Table};
use zonewall::core::error::{Error, ErrorKind, IptablesErrorPattern, Result, SnapshotError};
use zonewall::core::iptables::IptablesEngine;
use zonewall::core::memory::MemoryEngine;
use zonewall::core::policy::{DstNat, FilterChain, FilterRule, NatRule, NatType, RuleAction, SrcNat};
use zonewall::core::zones::{Zone, ZoneRegistry};
use zonewall::validators;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "zonewall")]
#[command(about = "Zone-based iptables firewall control plane", long_about = None)]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Configuration file (default: $ZONEWALL_CONFIG, then the XDG config dir)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Simulate against the last committed ruleset and print the calls
    #[arg(long, global = true)]
    dry_run: bool,

    /// Fail instead of waiting when another process holds the policy lock
    #[arg(long, global = true)]
    no_wait: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the base zone topology and commit it
    ApplyDefaults,
    /// Persist the live ruleset as the new backup
    Commit,
    /// Replace the live ruleset with the last committed backup
    Restore,
    /// Insert a filter rule and commit
    AddRule(RuleArgs),
    /// Delete the filter rule at a position and commit
    DeleteRule {
        /// GLOBAL, WAN, LAN or DMZ
        #[arg(long)]
        chain: String,
        /// 1-based position, as currently listed
        #[arg(long)]
        position: u32,
    },
    /// Insert a NAT mapping and commit
    AddNat(NatArgs),
    /// Delete the NAT mapping at a position and commit
    DeleteNat {
        /// DSTNAT or SRCNAT
        #[arg(long = "type")]
        nat_type: String,
        #[arg(long)]
        position: u32,
    },
    /// Drop all traffic from and to an address
    Block(BlockArgs),
    /// Remove the drop rules added by `block`
    Unblock(BlockArgs),
    /// Flush the block-list chain
    Purge {
        #[arg(long)]
        table: Option<Table>,
        #[arg(long)]
        chain: Option<String>,
    },
    /// Append reject rules for the DNS-over-HTTPS resolver list
    DohUpdate {
        /// Resolver list (default: `doh_list` from the config)
        #[arg(long, value_name = "PATH")]
        list: Option<PathBuf>,
    },
    /// Remove all DNS-over-HTTPS reject rules
    DohClear,
}

#[derive(Args)]
struct RuleArgs {
    /// GLOBAL, WAN, LAN or DMZ
    #[arg(long)]
    chain: String,
    /// 1-based insertion position
    #[arg(long)]
    position: u32,
    /// any, icmp, tcp or udp
    #[arg(long, default_value = "any")]
    protocol: String,
    #[arg(long, default_value = "0.0.0.0/0")]
    source: String,
    #[arg(long, default_value = "0.0.0.0/0")]
    destination: String,
    /// Destination port (required for tcp and udp)
    #[arg(long)]
    port: Option<u16>,
    /// ACCEPT, DROP or REJECT
    #[arg(long, default_value = "ACCEPT")]
    action: String,
}

impl RuleArgs {
    fn to_rule(&self) -> Result<FilterRule> {
        Ok(FilterRule {
            chain: FilterChain::parse(&self.chain)?,
            position: self.position,
            protocol: Protocol::parse(&self.protocol)?,
            source: network_arg("source", &self.source)?,
            destination: network_arg("destination", &self.destination)?,
            dst_port: self.port,
            action: RuleAction::parse(&self.action)?,
        })
    }
}

#[derive(Args)]
struct NatArgs {
    /// DSTNAT or SRCNAT
    #[arg(long = "type")]
    nat_type: String,
    /// Zone the mapped traffic enters from
    #[arg(long)]
    zone: String,
    /// DSTNAT: any, icmp, tcp or udp
    #[arg(long, default_value = "any")]
    protocol: String,
    /// DSTNAT: original destination port
    #[arg(long)]
    port: Option<u16>,
    /// DSTNAT: internal host address
    #[arg(long)]
    host: Option<String>,
    /// DSTNAT: internal host port
    #[arg(long)]
    host_port: Option<u16>,
    /// SRCNAT: original source network
    #[arg(long)]
    orig_src: Option<String>,
    /// SRCNAT: rewritten source address
    #[arg(long)]
    new_src: Option<String>,
}

impl NatArgs {
    fn to_rule(&self) -> Result<NatRule> {
        let nat_type = NatType::parse(&self.nat_type)?;
        let src_zone = Zone::parse(&self.zone)?;

        match nat_type {
            NatType::DstNat => Ok(NatRule::Destination(DstNat {
                src_zone,
                protocol: Protocol::parse(&self.protocol)?,
                dst_port: self.port,
                host_ip: address_arg("host", required("host", self.host.as_deref())?)?,
                host_port: self.host_port,
            })),
            NatType::SrcNat => Ok(NatRule::Source(SrcNat {
                src_zone,
                orig_src: network_arg("orig-src", required("orig-src", self.orig_src.as_deref())?)?,
                new_src: address_arg("new-src", required("new-src", self.new_src.as_deref())?)?,
            })),
        }
    }
}

#[derive(Args)]
struct BlockArgs {
    address: String,
    /// Table of the block-list chain (default: from config)
    #[arg(long)]
    table: Option<Table>,
    /// Block-list chain (default: from config)
    #[arg(long)]
    chain: Option<String>,
}

fn required<'a>(field: &str, value: Option<&'a str>) -> Result<&'a str> {
    value.ok_or_else(|| Error::validation(field, "required for this NAT type"))
}

fn network_arg(field: &str, value: &str) -> Result<IpNetwork> {
    validators::parse_network(value).map_err(|message| Error::validation(field, message))
}

fn address_arg(field: &str, value: &str) -> Result<std::net::IpAddr> {
    validators::parse_address(value).map_err(|message| Error::validation(field, message))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = config::resolve_config_path(cli.config.as_deref())
        .and_then(|path| config::load_config(&path));
    init_tracing(config.as_ref().map_or("info", |c| c.log_level.as_str()));

    match config.and_then(|config| run(&cli, &config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::from(e.kind().exit_code())
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn report_error(e: &Error) {
    eprintln!("Error [{}]: {e}", e.kind());

    if let Error::PrimitiveCallFailed {
        call,
        message,
        stderr,
        ..
    } = e
    {
        eprintln!("  Failed call: {call}");
        let translation = IptablesErrorPattern::match_error(stderr.as_deref().unwrap_or(message));
        eprintln!("  {}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  • {suggestion}");
        }
    } else if e.kind() == ErrorKind::LockUnavailable {
        eprintln!("  • Retry without --no-wait to queue behind the current holder");
    }
}

fn run(cli: &Cli, config: &AppConfig) -> Result<()> {
    let zones = ZoneRegistry::from_config(&config.interfaces)?;
    let state_dir = config.state_dir()?;

    let lock_mode = if cli.no_wait {
        LockMode::NonBlocking
    } else {
        LockMode::Blocking
    };

    if cli.dry_run {
        return dry_run(cli, config, zones, &state_dir, lock_mode);
    }

    zonewall::utils::ensure_dir(&state_dir)?;
    if !nix::unistd::getuid().is_root() {
        info!("Not running as root; iptables calls will be elevated");
    }

    let mut controller = MutationController::new(IptablesEngine::new(), zones, &state_dir)
        .with_doh_list(config.doh_list.clone())
        .with_resolver_port(config.resolver_port)
        .with_lock_mode(lock_mode);

    let result = execute(&mut controller, &cli.command, config);
    let (event_type, details) = audit_entry(&cli.command);
    audit::record(&state_dir, event_type, details, result.as_ref().map(|_| ()));
    result
}

/// Replays the command against an in-memory copy of the committed ruleset,
/// with a scratch state directory, then prints the calls it issued.
fn dry_run(
    cli: &Cli,
    config: &AppConfig,
    zones: ZoneRegistry,
    state_dir: &std::path::Path,
    lock_mode: LockMode,
) -> Result<()> {
    let scratch = tempfile::TempDir::new()?;
    let mut controller = MutationController::new(MemoryEngine::new(), zones, scratch.path())
        .with_doh_list(config.doh_list.clone())
        .with_resolver_port(config.resolver_port)
        .with_lock_mode(lock_mode);

    match BackupStore::in_dir(state_dir).read() {
        Ok(dump) => {
            controller.engine_mut().load_ruleset(&dump)?;
            controller.backup().write(&dump)?;
        }
        Err(Error::Snapshot(SnapshotError::NotFound(_))) => {
            if !matches!(cli.command, Commands::ApplyDefaults | Commands::Restore) {
                info!("No committed ruleset; simulating against the base topology");
                controller.build_topology();
            }
        }
        Err(e) => return Err(e),
    }
    let seeded = controller.engine().calls().len();

    let result = execute(&mut controller, &cli.command, config);

    for op in &controller.engine().calls()[seeded..] {
        println!("{op}");
    }
    result
}

fn execute<E: PacketFilter>(
    controller: &mut MutationController<E>,
    command: &Commands,
    config: &AppConfig,
) -> Result<()> {
    match command {
        Commands::ApplyDefaults => {
            let report = controller.transaction(|session| Ok(session.apply_defaults()))?;
            for failure in &report.failures {
                eprintln!("  ✗ [{}] {}: {}", failure.step, failure.call, failure.error);
            }
            println!(
                "Base topology applied: {} of {} calls succeeded",
                report.succeeded(),
                report.attempted
            );
        }
        Commands::Commit => {
            controller.commit()?;
            println!("Ruleset committed to {}", controller.backup().path().display());
        }
        Commands::Restore => {
            controller.restore()?;
            println!("Ruleset restored from {}", controller.backup().path().display());
        }
        Commands::AddRule(args) => {
            let rule = args.to_rule()?;
            controller.transaction(|session| session.add_rule(&rule))?;
            println!("Rule added to {} at position {}", rule.chain, rule.position);
        }
        Commands::DeleteRule { chain, position } => {
            let chain = FilterChain::parse(chain)?;
            controller.transaction(|session| session.delete_rule(chain, *position))?;
            println!("Rule {position} deleted from {chain}");
        }
        Commands::AddNat(args) => {
            let rule = args.to_rule()?;
            controller.transaction(|session| session.add_nat(&rule))?;
            println!("{} mapping added", rule.nat_type());
        }
        Commands::DeleteNat { nat_type, position } => {
            let nat_type = NatType::parse(nat_type)?;
            controller.transaction(|session| session.delete_nat(nat_type, *position))?;
            println!("{nat_type} mapping {position} deleted");
        }
        Commands::Block(args) | Commands::Unblock(args) => {
            let addr = address_arg("address", &args.address)?;
            if let Some(warning) = validators::check_reserved_ip(IpNetwork::from(addr)) {
                warn!("{warning}");
            }
            let channel = blocklist_channel(config, args.table, args.chain.as_deref())?;
            if matches!(command, Commands::Block(_)) {
                channel.block(controller.engine_mut(), addr)?;
                println!("Blocked {addr}");
            } else {
                channel.unblock(controller.engine_mut(), addr)?;
                println!("Unblocked {addr}");
            }
        }
        Commands::Purge { table, chain } => {
            let channel = blocklist_channel(config, *table, chain.as_deref())?;
            channel.purge(controller.engine_mut())?;
            println!("Purged {}/{}", channel.table(), channel.chain());
        }
        Commands::DohUpdate { list } => {
            let path = list
                .clone()
                .or_else(|| config.doh_list.clone())
                .ok_or_else(|| Error::Config("no DoH list given and none configured".into()))?;
            let added = blocklist::update_dns_over_https(controller.engine_mut(), &DohList::load(&path)?)?;
            println!("Added {added} DoH resolver rules");
        }
        Commands::DohClear => {
            blocklist::clear_dns_over_https(controller.engine_mut())?;
            println!("DoH resolver rules cleared");
        }
    }
    Ok(())
}

fn blocklist_channel(
    config: &AppConfig,
    table: Option<Table>,
    chain: Option<&str>,
) -> Result<BlocklistChannel> {
    BlocklistChannel::new(
        table.unwrap_or(config.blocklist.table),
        chain.unwrap_or(&config.blocklist.chain),
    )
}

fn audit_entry(command: &Commands) -> (EventType, serde_json::Value) {
    use serde_json::json;

    match command {
        Commands::ApplyDefaults => (EventType::ApplyDefaults, json!({})),
        Commands::Commit => (EventType::Commit, json!({})),
        Commands::Restore => (EventType::Restore, json!({})),
        Commands::AddRule(args) => (
            EventType::AddRule,
            json!({
                "chain": args.chain,
                "position": args.position,
                "protocol": args.protocol,
                "source": args.source,
                "destination": args.destination,
                "port": args.port,
                "action": args.action,
            }),
        ),
        Commands::DeleteRule { chain, position } => (
            EventType::DeleteRule,
            json!({ "chain": chain, "position": position }),
        ),
        Commands::AddNat(args) => (
            EventType::AddNat,
            json!({
                "nat_type": args.nat_type,
                "zone": args.zone,
                "protocol": args.protocol,
                "port": args.port,
                "host": args.host,
                "host_port": args.host_port,
                "orig_src": args.orig_src,
                "new_src": args.new_src,
            }),
        ),
        Commands::DeleteNat { nat_type, position } => (
            EventType::DeleteNat,
            json!({ "nat_type": nat_type, "position": position }),
        ),
        Commands::Block(args) => (EventType::Block, json!({ "address": args.address })),
        Commands::Unblock(args) => (EventType::Unblock, json!({ "address": args.address })),
        Commands::Purge { table, chain } => (
            EventType::Purge,
            json!({ "table": table.map(|t| t.to_string()), "chain": chain }),
        ),
        Commands::DohUpdate { list } => (EventType::DohUpdate, json!({ "list": list })),
        Commands::DohClear => (EventType::DohClear, json!({})),
    }
}
