use thiserror::Error;

/// Core error types for zonewall
#[derive(Debug, Error)]
pub enum Error {
    /// Zone/interface binding missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown protocol or NAT type, rejected before any engine call
    #[error("Unsupported rule kind: {0}")]
    UnsupportedRuleKind(String),

    /// The packet-filter engine rejected or failed a primitive call
    #[error("Primitive call failed: `{call}`: {message}")]
    PrimitiveCallFailed {
        call: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// The policy lock is held by another process (non-blocking acquisition only)
    #[error("Policy lock unavailable: {0}")]
    LockUnavailable(String),

    /// Writing the ruleset backup failed during commit
    #[error("Commit failed, ruleset not persisted: {0}")]
    PersistFailed(String),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Backup snapshot could not be restored
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Snapshot-specific errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Snapshot is empty")]
    Empty,
}

/// Stable error classification, used for process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorKind {
    #[strum(serialize = "ConfigError")]
    Config,
    #[strum(serialize = "UnsupportedRuleKind")]
    UnsupportedRuleKind,
    #[strum(serialize = "PrimitiveCallFailed")]
    PrimitiveCallFailed,
    #[strum(serialize = "LockUnavailable")]
    LockUnavailable,
    #[strum(serialize = "PersistFailed")]
    PersistFailed,
    #[strum(serialize = "ValidationError")]
    Validation,
    #[strum(serialize = "SnapshotError")]
    Snapshot,
    #[strum(serialize = "InternalError")]
    Other,
}

impl ErrorKind {
    /// Exit code reported by the CLI. Values are part of the command-line contract.
    pub const fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Config => 10,
            ErrorKind::UnsupportedRuleKind => 11,
            ErrorKind::PrimitiveCallFailed => 12,
            ErrorKind::LockUnavailable => 13,
            ErrorKind::PersistFailed => 14,
            ErrorKind::Validation => 15,
            ErrorKind::Snapshot => 16,
            ErrorKind::Other => 1,
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::UnsupportedRuleKind(_) => ErrorKind::UnsupportedRuleKind,
            Error::PrimitiveCallFailed { .. } => ErrorKind::PrimitiveCallFailed,
            Error::LockUnavailable(_) => ErrorKind::LockUnavailable,
            Error::PersistFailed(_) => ErrorKind::PersistFailed,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Snapshot(_) => ErrorKind::Snapshot,
            Error::Elevation(_) | Error::Io(_) | Error::Serialization(_) => ErrorKind::Other,
        }
    }

    /// Shorthand for building a [`Error::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// The rendered primitive call that failed, if this error came from the engine.
    pub fn failed_call(&self) -> Option<&str> {
        match self {
            Error::PrimitiveCallFailed { call, .. } => Some(call),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches iptables stderr against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("you must be root") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run as root or configure sudo/run0 for iptables")
                .with_suggestion("Set ZONEWALL_ELEVATION_METHOD to force an elevation method");
        }

        if lower.contains("chain already exists") {
            return ErrorTranslation::new("Custom chain already exists")
                .with_suggestion("The base topology has probably been applied already")
                .with_suggestion("Re-running apply-defaults duplicates rules; restore a backup instead");
        }

        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Chain, target or match module not found")
                .with_suggestion("Apply the base topology first (zonewall apply-defaults)")
                .with_suggestion("Check kernel modules: lsmod | grep -E 'xt_|nf_'");
        }

        if lower.contains("index of insertion too big") || lower.contains("index of deletion too big")
        {
            return ErrorTranslation::new("Rule position is out of range for this chain")
                .with_suggestion("Positions shift after every delete; re-read the chain before the next edit")
                .with_suggestion("List the chain: iptables -L <chain> --line-numbers");
        }

        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("No rule matches the given predicate")
                .with_suggestion("The rule may already have been removed");
        }

        if lower.contains("resource temporarily unavailable") || lower.contains("xtables lock") {
            return ErrorTranslation::new("The xtables lock is held by another process")
                .with_suggestion("Wait for the other firewall operation to finish and retry");
        }

        if lower.contains("command not found") || lower.contains("no such file") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Inspect the live ruleset: iptables-save")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
