//! Ruleset backup artifact
//!
//! The backup is the `iptables-save` dump taken at commit time. It is written
//! with a temp file in the same directory followed by a rename, so readers
//! see either the previous backup or the new one, never a partial file. A
//! `<backup>.sha256` sidecar holds the hex SHA-256 of the backup contents.

use crate::core::error::{Error, Result, SnapshotError};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const BACKUP_FILE_NAME: &str = "iptables_backup.cnf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupStore {
    path: PathBuf,
}

impl BackupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backup at the conventional name inside `state_dir`.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(BACKUP_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checksum_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".sha256");
        PathBuf::from(name)
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Atomically replaces the backup and its checksum sidecar.
    ///
    /// Both files are fully written to temp files before either is renamed.
    /// The sidecar goes first; if the backup rename then fails, the previous
    /// sidecar is put back so the old backup still verifies.
    pub fn write(&self, dump: &str) -> Result<()> {
        let checksum = compute_checksum(dump);
        let sidecar = self.checksum_path();
        let persist_failed =
            |path: &Path, e: std::io::Error| Error::PersistFailed(format!("{}: {e}", path.display()));

        let staged_backup = stage(&self.path, dump.as_bytes()).map_err(|e| persist_failed(&self.path, e))?;
        let staged_sidecar = stage(&sidecar, checksum.as_bytes()).map_err(|e| persist_failed(&sidecar, e))?;

        let previous_sidecar = match std::fs::read(&sidecar) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(persist_failed(&sidecar, e)),
        };

        persist(staged_sidecar, &sidecar).map_err(|e| persist_failed(&sidecar, e))?;

        if let Err(e) = persist(staged_backup, &self.path) {
            let undo = match previous_sidecar {
                Some(bytes) => stage(&sidecar, &bytes).and_then(|temp| persist(temp, &sidecar)),
                None => std::fs::remove_file(&sidecar),
            };
            if let Err(undo_err) = undo {
                warn!("Could not restore previous checksum sidecar: {undo_err}");
            }
            return Err(persist_failed(&self.path, e));
        }

        info!(
            "Ruleset backup written to {} ({} bytes, sha256 {checksum})",
            self.path.display(),
            dump.len()
        );
        Ok(())
    }

    /// Reads the backup, verifying the sidecar checksum when one exists.
    pub fn read(&self) -> Result<String> {
        let dump = match std::fs::read_to_string(&self.path) {
            Ok(dump) => dump,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(self.path.display().to_string()).into());
            }
            Err(e) => return Err(e.into()),
        };

        if dump.trim().is_empty() {
            return Err(SnapshotError::Empty.into());
        }

        match std::fs::read_to_string(self.checksum_path()) {
            Ok(expected) => {
                let expected = expected.trim().to_string();
                let actual = compute_checksum(&dump);
                if expected != actual {
                    return Err(SnapshotError::ChecksumMismatch { expected, actual }.into());
                }
                debug!("Backup checksum verified");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "No checksum sidecar for {}, restoring unverified",
                    self.path.display()
                );
            }
            Err(e) => return Err(e.into()),
        }

        Ok(dump)
    }
}

/// Hex SHA-256 of a ruleset dump.
pub fn compute_checksum(dump: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dump.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Writes `contents` to a synced temp file next to `path`.
fn stage(path: &Path, contents: &[u8]) -> std::io::Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    // NamedTempFile is created 0o600 and lives on the same filesystem as the target
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    Ok(temp)
}

fn persist(temp: NamedTempFile, path: &Path) -> std::io::Result<()> {
    temp.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save ruleset backup",
            )
        } else {
            e.error
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::in_dir(dir.path());
        store.write("*filter\nCOMMIT\n").unwrap();

        assert!(store.checksum_path().ends_with("iptables_backup.cnf.sha256"));
        assert_eq!(store.read().unwrap(), "*filter\nCOMMIT\n");
        assert_eq!(
            std::fs::read_to_string(store.checksum_path()).unwrap(),
            compute_checksum("*filter\nCOMMIT\n")
        );
    }

    #[test]
    fn test_missing_backup() {
        let dir = TempDir::new().unwrap();
        let err = BackupStore::in_dir(dir.path()).read().unwrap_err();
        assert!(matches!(err, Error::Snapshot(SnapshotError::NotFound(_))));
    }

    #[test]
    fn test_empty_backup_rejected() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::in_dir(dir.path());
        std::fs::write(store.path(), "  \n").unwrap();
        assert!(matches!(
            store.read(),
            Err(Error::Snapshot(SnapshotError::Empty))
        ));
    }

    #[test]
    fn test_tampered_backup_rejected() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::in_dir(dir.path());
        store.write("*filter\nCOMMIT\n").unwrap();
        std::fs::write(store.path(), "*filter\n-A INPUT -j ACCEPT\nCOMMIT\n").unwrap();

        assert!(matches!(
            store.read(),
            Err(Error::Snapshot(SnapshotError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_unverified_backup_still_reads() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::in_dir(dir.path());
        std::fs::write(store.path(), "*nat\nCOMMIT\n").unwrap();
        assert_eq!(store.read().unwrap(), "*nat\nCOMMIT\n");
    }

    #[test]
    fn test_failed_sidecar_write_keeps_previous_backup() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::in_dir(dir.path());
        store.write("*filter\nCOMMIT\n").unwrap();
        let before = std::fs::read(store.path()).unwrap();

        // A non-empty directory at the sidecar path makes its rename fail
        std::fs::remove_file(store.checksum_path()).unwrap();
        std::fs::create_dir(store.checksum_path()).unwrap();
        std::fs::write(store.checksum_path().join("occupied"), "x").unwrap();

        let err = store.write("*filter\n-A INPUT -j DROP\nCOMMIT\n").unwrap_err();
        assert!(matches!(err, Error::PersistFailed(_)));
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn test_failed_backup_rename_restores_previous_sidecar() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::in_dir(dir.path());
        store.write("*filter\nCOMMIT\n").unwrap();

        // Swap the backup for a non-empty directory so only its rename fails
        let saved = std::fs::read(store.path()).unwrap();
        std::fs::remove_file(store.path()).unwrap();
        std::fs::create_dir(store.path()).unwrap();
        std::fs::write(store.path().join("occupied"), "x").unwrap();

        let err = store.write("*nat\nCOMMIT\n").unwrap_err();
        assert!(matches!(err, Error::PersistFailed(_)));
        assert_eq!(
            std::fs::read_to_string(store.checksum_path()).unwrap(),
            compute_checksum("*filter\nCOMMIT\n")
        );

        std::fs::remove_dir_all(store.path()).unwrap();
        std::fs::write(store.path(), saved).unwrap();
        assert_eq!(store.read().unwrap(), "*filter\nCOMMIT\n");
    }

    #[test]
    fn test_write_into_missing_dir_is_persist_failure() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::in_dir(&dir.path().join("missing"));
        assert!(matches!(
            store.write("*filter\nCOMMIT\n"),
            Err(Error::PersistFailed(_))
        ));
    }
}
