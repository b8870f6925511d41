//! Live status projection.
//!
//! Nothing here is cached: the database file, its permissions, the lock
//! marker and the backup directory can all change behind our back, so every
//! field is read from disk when the snapshot is taken.

use crate::backup_store::{is_future_dated, BackupRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct ProtectionState {
    pub database_path: PathBuf,
    pub database_exists: bool,
    pub database_size: Option<u64>,
    pub is_read_only: bool,
    pub is_locked: bool,
    /// Human readable description of the current lock holder.
    pub lock_holder: Option<String>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_auto_backup_at: Option<DateTime<Utc>>,
    pub backup_count: usize,
    pub backup_dir: PathBuf,
    pub protection_enabled: bool,
    pub auto_backup_enabled: bool,
    /// Whether an automatic backup would be taken right now.
    pub backup_due: bool,
    pub latest_backup: Option<BackupRecord>,
}

/// Most recent backup with the given purpose. `backups` is newest first.
/// Backups dated in the future relative to `now` are skipped.
pub(crate) fn latest_with_purpose<'a>(
    backups: &'a [BackupRecord],
    purpose: &str,
    now: DateTime<Utc>,
) -> Option<&'a BackupRecord> {
    backups
        .iter()
        .find(|b| b.purpose == purpose && !is_future_dated(&b.created_at, &now))
}

/// An automatic backup is due when none exists or the newest is at least
/// `interval` old.
pub(crate) fn backup_due(
    last_auto: Option<DateTime<Utc>>,
    interval: chrono::Duration,
    now: DateTime<Utc>,
) -> bool {
    match last_auto {
        None => true,
        Some(at) => now - at >= interval,
    }
}
