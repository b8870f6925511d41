use std::path::{Path, PathBuf};
use std::time::Duration;

/// Result type for protection operations
pub type Result<T> = std::result::Result<T, ProtectionError>;

/// Errors raised by the protection framework.
///
/// Every variant maps onto a distinct process exit code through
/// [`ProtectionError::exit_code`] so scripted callers can branch on the kind.
#[derive(Debug, thiserror::Error)]
pub enum ProtectionError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database file not found: {}", .0.display())]
    DatabaseMissing(PathBuf),

    #[error("backup {} failed verification and was discarded: {reason}", .path.display())]
    BackupIntegrity { path: PathBuf, reason: String },

    #[error("backup {} is not trustworthy: {reason}", .path.display())]
    UntrustworthyBackup { path: PathBuf, reason: String },

    #[error("restore overwrites the database and requires explicit confirmation")]
    ConfirmationRequired,

    #[error("another guarded operation is in progress ({holder}); lock {}", .lock.display())]
    OperationBusy { lock: PathBuf, holder: String },

    #[error("timed out after {waited:?} waiting for lock {}", .lock.display())]
    LockTimeout { lock: PathBuf, waited: Duration },

    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("invalid backup name '{0}': use letters, digits, '_' or '-'")]
    InvalidBackupName(String),

    #[error("no backup matches '{0}'")]
    BackupNotFound(String),

    #[error("'{query}' matches several backups: {}", .matches.join(", "))]
    AmbiguousBackup { query: String, matches: Vec<String> },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProtectionError {
    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Io { .. } | Self::DatabaseMissing(_) | Self::Serialization(_) => 1,
            Self::OperationBusy { .. } | Self::LockTimeout { .. } => 3,
            Self::ConfirmationRequired => 4,
            Self::BackupIntegrity { .. } | Self::UntrustworthyBackup { .. } => 5,
            Self::ConfigValidation(_) => 6,
            Self::InvalidBackupName(_) | Self::BackupNotFound(_) | Self::AmbiguousBackup { .. } => 7,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::OperationBusy { .. } | Self::LockTimeout { .. })
    }
}

/// Attach the offending path to an `io::Error`.
pub(crate) fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> ProtectionError + '_ {
    move |source| ProtectionError::Io {
        path: path.to_path_buf(),
        source,
    }
}
