//! Privilege elevation for packet-filter commands
//!
//! zonewall may be invoked by an unprivileged policy editor. Only the
//! iptables tool family and `sysctl` can be elevated:
//!
//! - **iptables / ip6tables**: chain and rule primitives
//! - **iptables-save / iptables-restore**: commit and restore
//! - **sysctl**: IPv4 forwarding toggle
//!
//! # Elevation Strategy
//!
//! - **Already root**: run the program directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `ZONEWALL_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful for service units with sudoers NOPASSWD rules.
//! - `ZONEWALL_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Only the programs in [`Program`] can be elevated
//! - Arguments are passed directly without shell interpolation

use std::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `ZONEWALL_ELEVATION_METHOD`
    #[error("Invalid ZONEWALL_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// No elevation helper is installed
    #[error("No elevation helper found (tried run0, sudo, pkexec)")]
    NoHelper,
}

/// Programs that may be run with elevated privileges
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum Program {
    #[strum(serialize = "iptables")]
    Iptables,
    #[strum(serialize = "ip6tables")]
    Ip6tables,
    #[strum(serialize = "iptables-save")]
    IptablesSave,
    #[strum(serialize = "iptables-restore")]
    IptablesRestore,
    #[strum(serialize = "sysctl")]
    Sysctl,
}

impl Program {
    /// Maps a program name as rendered by `PrimitiveOp::command_line`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "iptables" => Some(Program::Iptables),
            "ip6tables" => Some(Program::Ip6tables),
            "iptables-save" => Some(Program::IptablesSave),
            "iptables-restore" => Some(Program::IptablesRestore),
            "sysctl" => Some(Program::Sysctl),
            _ => None,
        }
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn via(helper: &str, program: Program, args: &[String]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.arg(program.as_ref()).args(args);
    cmd
}

/// Builds a command running `program` with root privileges.
///
/// Arguments are passed directly to the program without shell interpretation.
pub fn create_elevated_command(program: Program, args: &[String]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("ZONEWALL_TEST_NO_ELEVATION").is_ok() || nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program.as_ref());
        cmd.args(args);
        return Ok(cmd);
    }

    // 2. Explicit elevation method override
    if let Ok(method) = std::env::var("ZONEWALL_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(via(&method, program, args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 3. Automatic detection - prefer run0 (no SUID), then sudo on a terminal, then pkexec
    if binary_exists("run0") {
        return Ok(via("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty && binary_exists("sudo") {
        return Ok(via("sudo", program, args));
    }

    if binary_exists("pkexec") {
        return Ok(via("pkexec", program, args));
    }

    Err(ElevationError::NoHelper)
}
