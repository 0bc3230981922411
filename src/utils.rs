//! Directory management and host introspection
//!
//! Directories follow the XDG Base Directory specification:
//!
//! - Config: `~/.config/zonewall/` - `config.json`
//! - State: `~/.local/state/zonewall/` - ruleset backup, policy lock, audit log
//!
//! Packagers installing zonewall as a system service can bake in a fixed state
//! directory (for example `/var/lib/zonewall`) by setting
//! `ZONEWALL_DEFAULT_STATE_DIR` at build time.
//!
//! # Example
//!
//! ```no_run
//! use zonewall::utils::{ensure_dir, get_state_dir};
//!
//! if let Some(state) = get_state_dir() {
//!     let _ = ensure_dir(&state);
//! }
//! ```

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "zonewall", "zonewall")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    if let Some(dir) = option_env!("ZONEWALL_DEFAULT_STATE_DIR") {
        return Some(PathBuf::from(dir));
    }
    project_dirs().and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

/// Creates `dir` (and parents) if missing, user-only on Unix.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

/// Network interfaces present on this host, excluding loopback.
pub fn list_interfaces() -> Vec<String> {
    let mut interfaces = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
        for entry in entries.flatten() {
            if let Ok(name) = entry.file_name().into_string()
                && name != "lo"
            {
                interfaces.push(name);
            }
        }
    }
    interfaces.sort();
    interfaces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_dir_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        ensure_dir(&nested).unwrap();
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_list_interfaces_excludes_loopback() {
        assert!(!list_interfaces().iter().any(|name| name == "lo"));
    }
}
