//! Configuration file
//!
//! zonewall reads one JSON document:
//!
//! ```json
//! {
//!   "interfaces": {
//!     "wan": { "ident": "eth0" },
//!     "lan": { "ident": "eth1" },
//!     "dmz": { "ident": "eth2" }
//!   },
//!   "state_dir": "/var/lib/zonewall",
//!   "doh_list": "/etc/zonewall/dns-over-https.ips",
//!   "resolver_port": 53,
//!   "log_level": "info",
//!   "blocklist": { "table": "filter", "chain": "GLOBAL_INTERFACE" }
//! }
//! ```
//!
//! Only `interfaces` is required. The file is located through `--config`,
//! then `ZONEWALL_CONFIG`, then `config.json` in the XDG config directory.

use crate::core::blocklist::DEFAULT_BLOCKLIST_CHAIN;
use crate::core::engine::Table;
use crate::core::error::{Error, Result};
use crate::core::topology::DEFAULT_RESOLVER_PORT;
use crate::core::zones::Zone;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_ENV_VAR: &str = "ZONEWALL_CONFIG";
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Complete zonewall configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub interfaces: InterfacesConfig,
    /// Backup, lock and audit log location; XDG state dir when unset
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// DNS-over-HTTPS resolver list rejected by the `DOH` chain
    #[serde(default)]
    pub doh_list: Option<PathBuf>,
    /// Port of the local DNS proxy internal DNS is redirected to
    #[serde(default = "default_resolver_port")]
    pub resolver_port: u16,
    /// Default `tracing` filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub blocklist: BlocklistConfig,
}

/// Zone to interface bindings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfacesConfig {
    #[serde(default)]
    pub wan: Option<InterfaceBinding>,
    #[serde(default)]
    pub lan: Option<InterfaceBinding>,
    #[serde(default)]
    pub dmz: Option<InterfaceBinding>,
}

impl InterfacesConfig {
    pub fn binding(&self, zone: Zone) -> Option<&InterfaceBinding> {
        match zone {
            Zone::Wan => self.wan.as_ref(),
            Zone::Lan => self.lan.as_ref(),
            Zone::Dmz => self.dmz.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceBinding {
    pub ident: String,
}

/// Where `block`/`unblock`/`purge` operate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocklistConfig {
    #[serde(default = "default_blocklist_table")]
    pub table: Table,
    #[serde(default = "default_blocklist_chain")]
    pub chain: String,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            table: default_blocklist_table(),
            chain: default_blocklist_chain(),
        }
    }
}

fn default_resolver_port() -> u16 {
    DEFAULT_RESOLVER_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_blocklist_table() -> Table {
    Table::Filter
}

fn default_blocklist_chain() -> String {
    DEFAULT_BLOCKLIST_CHAIN.to_string()
}

impl AppConfig {
    /// Parses and validates a configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: AppConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        crate::validators::validate_port(self.resolver_port)
            .map_err(|e| Error::Config(format!("resolver_port: {e}")))?;
        crate::validators::validate_chain_name(&self.blocklist.chain)
            .map_err(|e| Error::Config(format!("blocklist.chain: {e}")))?;
        Ok(())
    }

    /// Configured state directory, falling back to the XDG state directory.
    pub fn state_dir(&self) -> Result<PathBuf> {
        self.state_dir
            .clone()
            .or_else(crate::utils::get_state_dir)
            .ok_or_else(|| Error::Config("no state directory configured or discoverable".into()))
    }
}

/// Locates the config file: explicit path, then `ZONEWALL_CONFIG`, then XDG.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    crate::utils::get_config_dir()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .ok_or_else(|| Error::Config("no config path given and no config directory found".into()))
}

/// Loads the configuration from `path`.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let json = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::Config(format!("config file {} not found", path.display()))
        } else {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        }
    })?;
    debug!("Loaded config from {}", path.display());
    AppConfig::from_json(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    const MINIMAL: &str = r#"{
        "interfaces": {
            "wan": { "ident": "eth0" },
            "lan": { "ident": "eth1" },
            "dmz": { "ident": "eth2" }
        }
    }"#;

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.resolver_port, 53);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.blocklist.table, Table::Filter);
        assert_eq!(config.blocklist.chain, "GLOBAL_INTERFACE");
        assert_eq!(
            config.interfaces.binding(Zone::Dmz).unwrap().ident,
            "eth2"
        );
    }

    #[test]
    fn test_missing_binding_is_none() {
        let config =
            AppConfig::from_json(r#"{ "interfaces": { "wan": { "ident": "eth0" } } }"#).unwrap();
        assert!(config.interfaces.binding(Zone::Lan).is_none());
    }

    #[test]
    fn test_invalid_documents_are_config_errors() {
        assert!(matches!(AppConfig::from_json("{}"), Err(Error::Config(_))));
        assert!(matches!(AppConfig::from_json("not json"), Err(Error::Config(_))));

        let zero_port = MINIMAL.replacen('{', r#"{ "resolver_port": 0,"#, 1);
        assert!(matches!(AppConfig::from_json(&zero_port), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config(Path::new("/nonexistent/zonewall.json")).unwrap_err();
        assert_eq!(err.kind().exit_code(), 10);
    }

    #[test]
    fn test_resolve_config_path_precedence() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var(CONFIG_ENV_VAR, "/etc/zonewall/from-env.json");
        }

        assert_eq!(
            resolve_config_path(Some(Path::new("/tmp/explicit.json"))).unwrap(),
            PathBuf::from("/tmp/explicit.json")
        );
        assert_eq!(
            resolve_config_path(None).unwrap(),
            PathBuf::from("/etc/zonewall/from-env.json")
        );

        unsafe {
            std::env::remove_var(CONFIG_ENV_VAR);
        }
    }
}
