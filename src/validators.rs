//! Input validation for names and addresses that end up on an iptables
//! command line.
//!
//! Values are passed to iptables as separate arguments, never through a shell,
//! but they are still restricted to what the kernel and iptables accept so a
//! bad value fails before any primitive call is issued.

use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Longest chain name iptables accepts (`XT_EXTENSION_MAXNAMELEN - 1`).
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if the name is empty or violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name is empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a chain name for the block-list channel.
///
/// # Errors
///
/// Returns `Err` for empty or overlong names, a leading `-` or `!` (which
/// iptables would parse as an option or negation), and characters outside
/// ASCII alphanumerics, `_` and `-`.
pub fn validate_chain_name(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Chain name is empty".to_string());
    }
    if name.len() > MAX_CHAIN_NAME_LEN {
        return Err(format!(
            "Chain name too long (max {MAX_CHAIN_NAME_LEN} characters)"
        ));
    }
    if name.starts_with(['-', '!']) {
        return Err("Chain name cannot start with '-' or '!'".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err("Chain name contains invalid characters".to_string());
    }
    Ok(name.to_string())
}

/// Parses an address or CIDR network. A bare address is a host network
/// (`/32` or `/128`).
///
/// # Errors
///
/// Returns `Err` when the input is neither.
pub fn parse_network(input: &str) -> Result<IpNetwork, String> {
    let input = input.trim();
    if let Ok(addr) = input.parse::<IpAddr>() {
        return Ok(IpNetwork::from(addr));
    }
    input
        .parse::<IpNetwork>()
        .map_err(|e| format!("'{input}' is not an address or network: {e}"))
}

/// Parses a single host address.
///
/// # Errors
///
/// Returns `Err` when the input is not an IPv4 or IPv6 address.
pub fn parse_address(input: &str) -> Result<IpAddr, String> {
    let input = input.trim();
    input
        .parse::<IpAddr>()
        .map_err(|_| format!("'{input}' is not an IP address"))
}

/// Rejects IPv6 addresses; every engine call goes through the IPv4 tables.
///
/// # Errors
///
/// Returns `Err` for an IPv6 address.
pub fn require_ipv4(ip: IpAddr) -> Result<(), String> {
    match ip {
        IpAddr::V4(_) => Ok(()),
        IpAddr::V6(_) => Err(format!("'{ip}' is IPv6; only IPv4 is supported")),
    }
}

/// Checks if an address is in a reserved range and returns an informational
/// warning. Never blocks the operation.
pub fn check_reserved_ip(ip: IpNetwork) -> Option<String> {
    match ip.ip() {
        IpAddr::V4(ipv4) => {
            let octets = ipv4.octets();

            // RFC 1918 private ranges
            if octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
            {
                return Some("Private IP range (RFC 1918), likely an internal host".to_string());
            }

            if octets[0] == 127 {
                return Some("Loopback range (127.x), local sockets are always accepted".to_string());
            }

            if octets[0] == 169 && octets[1] == 254 {
                return Some("Link-local range (169.254.x.x)".to_string());
            }

            None
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() {
                return Some("IPv6 loopback (::1)".to_string());
            }

            if ipv6.segments()[0] & 0xffc0 == 0xfe80 {
                return Some("IPv6 link-local (fe80::/10)".to_string());
            }

            None
        }
    }
}
