/// Audit logging for privileged operations
///
/// Every policy mutation, commit, restore and block-list change run through
/// the CLI is recorded as one JSON line in `audit.log` in the state directory.
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const AUDIT_FILE_NAME: &str = "audit.log";

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ApplyDefaults,
    Commit,
    Restore,
    AddRule,
    DeleteRule,
    AddNat,
    DeleteNat,
    Block,
    Unblock,
    Purge,
    DohUpdate,
    DohClear,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    pub success: bool,

    /// Operation parameters
    pub details: serde_json::Value,

    /// Error kind and message if the operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    pub fn in_dir(state_dir: &Path) -> Self {
        Self {
            log_path: state_dir.join(AUDIT_FILE_NAME),
        }
    }

    /// Appends an event as one JSON line.
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        let mut options = std::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.log_path)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        Ok(())
    }

    /// Reads up to `count` of the most recent events, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = std::fs::read_to_string(&self.log_path)?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

/// Records the outcome of an operation, warning instead of failing when the
/// log cannot be written.
pub fn record(
    state_dir: &Path,
    event_type: EventType,
    details: serde_json::Value,
    outcome: Result<(), &crate::core::error::Error>,
) {
    let (success, error) = match outcome {
        Ok(()) => (true, None),
        Err(e) => (false, Some(format!("{}: {e}", e.kind()))),
    };
    let event = AuditEvent::new(event_type, success, details, error);

    if let Err(e) = AuditLog::in_dir(state_dir).log(&event) {
        tracing::warn!("Failed to write audit log: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;

    #[test]
    fn test_record_appends_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();

        record(
            dir.path(),
            EventType::Block,
            serde_json::json!({ "address": "198.51.100.7" }),
            Ok(()),
        );
        let failure = Error::LockUnavailable("held".into());
        record(
            dir.path(),
            EventType::Commit,
            serde_json::json!({}),
            Err(&failure),
        );

        let log = AuditLog::in_dir(dir.path());
        let events = log.read_recent(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Commit);
        assert!(!events[0].success);
        assert!(events[0].error.as_deref().unwrap().starts_with("LockUnavailable"));
        assert_eq!(events[1].details["address"], "198.51.100.7");

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert!(raw.contains("\"event_type\":\"block\""));
    }

    #[test]
    fn test_unwritable_log_does_not_fail() {
        record(
            Path::new("/nonexistent/zonewall"),
            EventType::Purge,
            serde_json::json!({}),
            Ok(()),
        );
    }
}
