//! Protection for a single-file embedded database: timestamped verified
//! backups with retention, read-only enforcement, a cross-process operation
//! lock, guarded operation scopes and confirmed restore.
//!
//! Hosts interact through [`Orchestrator`] only.

pub mod backup_store;
pub mod checksum;
pub mod config;
pub mod error;
pub mod guard;
pub mod integrity;
pub mod orchestrator;
pub mod state;

pub use backup_store::{BackupRecord, RestoreReport, RetentionPolicy};
pub use checksum::{Checksum, ChecksumVerifier, DigestAlgorithm, Verification};
pub use config::ProtectionConfig;
pub use error::{ProtectionError, Result};
pub use guard::LockInfo;
pub use integrity::{IntegrityCheck, IntegrityReport, SqliteIntegrityChecker};
pub use orchestrator::{
    BackupHealth, GuardedOperation, Orchestrator, ProtectionPaths, RestoreOptions,
};
pub use state::ProtectionState;
