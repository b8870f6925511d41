//! Protection policy over the backup store and the guard.
//!
//! The [`Orchestrator`] is the only entry point for hosts and the CLI. It is
//! an explicit value owned by the host; nothing here is global.
//!
//! Automatic paths (`auto_backup_if_needed`, `on_startup`, `on_shutdown`)
//! log and absorb failures. Everything the user asks for explicitly returns
//! its error.

use crate::backup_store::{
    validate_purpose, BackupRecord, BackupStore, RestoreReport, RetentionPolicy, BACKUP_EXTENSION,
};
use crate::checksum::{ChecksumVerifier, Verification};
use crate::config::ProtectionConfig;
use crate::error::{ProtectionError, Result};
use crate::guard::{LockHandle, ProtectionGuard};
use crate::integrity::{IntegrityCheck, IntegrityReport, SqliteIntegrityChecker};
use crate::state::{backup_due, latest_with_purpose, ProtectionState};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const AUTO_PURPOSE: &str = "auto";
pub const CONFIG_FILE_NAME: &str = "database_protection.json";
pub const BACKUP_DIR_NAME: &str = "backups";

// ── Paths & options ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionPaths {
    pub database: PathBuf,
    pub backup_dir: PathBuf,
    pub config_file: PathBuf,
}

impl ProtectionPaths {
    /// Default layout: config file and backup directory next to the database.
    pub fn for_database(database: impl AsRef<Path>) -> Self {
        let database = database.as_ref().to_path_buf();
        let parent = match database.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self {
            backup_dir: parent.join(BACKUP_DIR_NAME),
            config_file: parent.join(CONFIG_FILE_NAME),
            database,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// The caller obtained explicit confirmation to overwrite the database.
    pub confirmed: bool,
    /// Accept a backup whose checksum cannot be verified.
    pub allow_unverified: bool,
}

/// Checksum and integrity outcome for one backup.
#[derive(Debug, Clone, Serialize)]
pub struct BackupHealth {
    pub backup: BackupRecord,
    pub checksum: Verification,
    pub integrity: IntegrityReport,
}

impl BackupHealth {
    pub fn trustworthy(&self) -> bool {
        self.checksum.is_verified() && self.integrity.ok
    }
}

// ── Orchestrator ────────────────────────────────────────────────────────────

pub struct Orchestrator {
    paths: ProtectionPaths,
    config: ProtectionConfig,
    store: BackupStore,
    guard: ProtectionGuard,
}

impl Orchestrator {
    pub fn open(paths: ProtectionPaths) -> Result<Self> {
        Self::open_with_checker(paths, Box::new(SqliteIntegrityChecker))
    }

    pub fn open_with_checker(
        paths: ProtectionPaths,
        integrity: Box<dyn IntegrityCheck>,
    ) -> Result<Self> {
        let config = ProtectionConfig::load(&paths.config_file)?;
        let store = BackupStore::open(
            &paths.backup_dir,
            &paths.database,
            ChecksumVerifier::new(config.checksum_algorithm),
            integrity,
            retention_of(&config),
        )?;
        let guard = ProtectionGuard::new(&paths.database, config.stale_lock_after());

        debug!(
            database = %paths.database.display(),
            backups = %paths.backup_dir.display(),
            config = %paths.config_file.display(),
            "protection orchestrator opened"
        );

        Ok(Self {
            paths,
            config,
            store,
            guard,
        })
    }

    pub fn paths(&self) -> &ProtectionPaths {
        &self.paths
    }

    pub fn config(&self) -> &ProtectionConfig {
        &self.config
    }

    // ── Backups ─────────────────────────────────────────────────────────────

    /// Manual backup. `None` uses `<db stem>_backup` as the purpose.
    pub fn create_backup(&self, name: Option<&str>) -> Result<BackupRecord> {
        let purpose = match name {
            Some(name) => name.trim().to_string(),
            None => self.default_purpose(),
        };
        validate_purpose(&purpose)?;
        self.with_lock("backup", |this| this.store.create(&purpose))
    }

    /// Take an `auto` backup if one is due. Failures are logged and retried
    /// at the next check.
    pub fn auto_backup_if_needed(&self) -> Option<BackupRecord> {
        if !self.config.auto_backup_enabled {
            debug!("automatic backups disabled");
            return None;
        }
        match self.try_auto_backup() {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "automatic backup failed; will retry at next check");
                None
            }
        }
    }

    fn try_auto_backup(&self) -> Result<Option<BackupRecord>> {
        if !self.auto_backup_due()? {
            debug!("automatic backup not due");
            return Ok(None);
        }
        if !self.paths.database.is_file() {
            debug!(path = %self.paths.database.display(), "no database to back up yet");
            return Ok(None);
        }
        self.with_lock("auto_backup", |this| {
            // Another process may have taken it while we waited.
            if !this.auto_backup_due()? {
                return Ok(None);
            }
            this.store.create(AUTO_PURPOSE).map(Some)
        })
    }

    fn auto_backup_due(&self) -> Result<bool> {
        let backups = self.store.list()?;
        let now = Utc::now();
        let last_auto = latest_with_purpose(&backups, AUTO_PURPOSE, now).map(|b| b.created_at);
        Ok(backup_due(last_auto, self.config.backup_interval(), now))
    }

    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        self.store.list()
    }

    /// Find a backup by exact file name (with or without `.db`), by path, or
    /// by a substring matching exactly one file name.
    pub fn resolve_backup(&self, query: &str) -> Result<BackupRecord> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ProtectionError::BackupNotFound(String::new()));
        }

        let backups = self.store.list()?;
        if let Some(exact) = backups.iter().find(|b| {
            b.file_name == query || b.file_name.strip_suffix(BACKUP_EXTENSION) == Some(query)
        }) {
            return Ok(exact.clone());
        }

        let path = Path::new(query);
        if path.is_file() {
            return self.store.record_for(path);
        }

        let matches: Vec<&BackupRecord> = backups
            .iter()
            .filter(|b| b.file_name.contains(query))
            .collect();
        match matches.as_slice() {
            [] => Err(ProtectionError::BackupNotFound(query.to_string())),
            [only] => Ok((*only).clone()),
            many => Err(ProtectionError::AmbiguousBackup {
                query: query.to_string(),
                matches: many.iter().map(|b| b.file_name.clone()).collect(),
            }),
        }
    }

    /// Checksum and integrity outcome of every backup, newest first.
    pub fn verify_backups(&self) -> Result<Vec<BackupHealth>> {
        let backups = self.store.list()?;
        Ok(backups
            .into_iter()
            .map(|backup| BackupHealth {
                checksum: self.store.verify_checksum(&backup),
                integrity: self.store.check_integrity(&backup.path),
                backup,
            })
            .collect())
    }

    // ── Guarded operations ──────────────────────────────────────────────────

    /// Open a guarded scope: lock, remember protection, unprotect, and take a
    /// `pre_<name>` backup. Finish with [`GuardedOperation::commit`]; dropping
    /// the scope instead runs the failure-path cleanup.
    pub fn begin_operation(&self, name: &str) -> Result<GuardedOperation<'_>> {
        validate_purpose(name)?;
        let lock = self.lock(name)?;

        let mut op = GuardedOperation {
            orchestrator: self,
            name: name.to_string(),
            pre_backup: None,
            was_protected: self.guard.is_protected(),
            lock: Some(lock),
        };
        info!(
            operation = name,
            was_protected = op.was_protected,
            "guarded operation started"
        );

        if self.paths.database.is_file() {
            self.guard.unprotect()?;
            op.pre_backup = Some(self.store.create(&format!("pre_{name}"))?);
        } else {
            warn!(
                operation = name,
                path = %self.paths.database.display(),
                "database does not exist yet; no pre-operation backup"
            );
        }
        Ok(op)
    }

    /// Run `body` inside a guarded scope. Cleanup runs on both paths; the
    /// body's error is returned after it.
    pub fn guarded<T, E, F>(&self, name: &str, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&GuardedOperation<'_>) -> std::result::Result<T, E>,
        E: From<ProtectionError>,
    {
        let op = self.begin_operation(name)?;
        match body(&op) {
            Ok(value) => {
                op.commit()?;
                Ok(value)
            }
            Err(e) => {
                drop(op);
                Err(e)
            }
        }
    }

    // ── Restore ─────────────────────────────────────────────────────────────

    pub fn restore(&self, record: &BackupRecord, confirmed: bool) -> Result<RestoreReport> {
        self.restore_with(
            record,
            RestoreOptions {
                confirmed,
                allow_unverified: false,
            },
        )
    }

    /// Overwrite the database with `record` after confirmation and trust
    /// checks. The current database is preserved as `pre_restore_safety`.
    pub fn restore_with(
        &self,
        record: &BackupRecord,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        if !options.confirmed {
            return Err(ProtectionError::ConfirmationRequired);
        }

        self.with_lock("restore", |this| {
            this.ensure_trustworthy(record, options.allow_unverified)?;

            let was_protected = this.guard.is_protected();
            if this.paths.database.is_file() {
                this.guard.unprotect()?;
            }

            let outcome = this.store.restore_from(record);

            if (this.config.protection_enabled || was_protected) && this.paths.database.is_file() {
                if let Err(e) = this.guard.protect() {
                    if outcome.is_ok() {
                        return Err(e);
                    }
                    warn!(error = %e, "could not re-apply protection after failed restore");
                }
            }
            outcome
        })
    }

    fn ensure_trustworthy(&self, record: &BackupRecord, allow_unverified: bool) -> Result<()> {
        if !record.path.is_file() {
            return Err(ProtectionError::BackupNotFound(
                record.path.display().to_string(),
            ));
        }
        let untrustworthy = |reason: String| ProtectionError::UntrustworthyBackup {
            path: record.path.clone(),
            reason,
        };

        if self.config.checksum_verification {
            match self.store.verify_checksum(record) {
                Verification::Verified => {}
                Verification::Mismatch { expected, actual } => {
                    return Err(untrustworthy(format!(
                        "checksum mismatch: recorded {expected}, found {actual}"
                    )));
                }
                Verification::Unverifiable { reason } if allow_unverified => {
                    warn!(
                        path = %record.path.display(),
                        %reason,
                        "restoring from a backup whose checksum cannot be verified"
                    );
                }
                Verification::Unverifiable { reason } => {
                    return Err(untrustworthy(format!(
                        "checksum cannot be verified ({reason}); an explicit override is required"
                    )));
                }
            }
        }

        let report = self.store.check_integrity(&record.path);
        if !report.ok {
            return Err(untrustworthy(report.summary()));
        }
        Ok(())
    }

    // ── Protection ──────────────────────────────────────────────────────────

    pub fn protect(&self) -> Result<bool> {
        if !self.config.protection_enabled {
            info!("protection is disabled in configuration; applying on explicit request");
        }
        self.with_lock("protect", |this| this.guard.protect())
    }

    pub fn unprotect(&self) -> Result<bool> {
        self.with_lock("unprotect", |this| this.guard.unprotect())
    }

    /// Live snapshot of protection state.
    pub fn status(&self) -> Result<ProtectionState> {
        let backups = self.store.list()?;
        let meta = fs::metadata(&self.paths.database)
            .ok()
            .filter(|m| m.is_file());
        let now = Utc::now();
        let last_auto = latest_with_purpose(&backups, AUTO_PURPOSE, now).map(|b| b.created_at);

        Ok(ProtectionState {
            database_path: self.paths.database.clone(),
            database_exists: meta.is_some(),
            database_size: meta.as_ref().map(|m| m.len()),
            is_read_only: self.guard.is_protected(),
            is_locked: self.guard.is_locked(),
            lock_holder: self.guard.lock_holder().map(|h| h.describe()),
            last_backup_at: backups.first().map(|b| b.created_at),
            last_auto_backup_at: last_auto,
            backup_count: backups.len(),
            backup_dir: self.paths.backup_dir.clone(),
            protection_enabled: self.config.protection_enabled,
            auto_backup_enabled: self.config.auto_backup_enabled,
            backup_due: self.config.auto_backup_enabled
                && backup_due(last_auto, self.config.backup_interval(), now),
            latest_backup: backups.into_iter().next(),
        })
    }

    // ── Configuration ───────────────────────────────────────────────────────

    /// Validate, persist and apply one option.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        self.set_options(&[(key, value)])
    }

    /// Validate every assignment, then persist and apply them in one save.
    /// If any is rejected nothing is written.
    pub fn set_options(&mut self, assignments: &[(&str, &str)]) -> Result<()> {
        let mut next = self.config.clone();
        for &(key, value) in assignments {
            next.set_option(key, value)?;
        }
        next.save(&self.paths.config_file)?;
        self.apply_config(next);
        for &(key, value) in assignments {
            info!(key, value, "configuration updated");
        }
        Ok(())
    }

    /// Pick up out-of-band edits to the config file.
    pub fn reload_config(&mut self) -> Result<()> {
        let config = ProtectionConfig::load(&self.paths.config_file)?;
        self.apply_config(config);
        Ok(())
    }

    fn apply_config(&mut self, config: ProtectionConfig) {
        self.store.set_retention(retention_of(&config));
        self.store
            .set_verifier(ChecksumVerifier::new(config.checksum_algorithm));
        self.guard.set_stale_after(config.stale_lock_after());
        self.config = config;
    }

    // ── Host lifecycle ──────────────────────────────────────────────────────

    pub fn on_startup(&self) {
        info!(database = %self.paths.database.display(), "protection startup check");
        self.auto_backup_if_needed();
        self.reapply_protection();
    }

    pub fn on_shutdown(&self) {
        info!(database = %self.paths.database.display(), "protection shutdown check");
        self.auto_backup_if_needed();
        self.reapply_protection();
    }

    fn reapply_protection(&self) {
        if !self.config.protection_enabled || !self.paths.database.is_file() {
            return;
        }
        if self.guard.is_locked() {
            debug!("operation in progress; leaving protection to its owner");
            return;
        }
        if let Err(e) = self.guard.protect() {
            warn!(error = %e, "could not re-apply protection");
        }
    }

    // ── Private helpers ─────────────────────────────────────────────────────

    fn lock(&self, operation: &str) -> Result<LockHandle> {
        self.guard.acquire_lock(operation, self.config.lock_wait())
    }

    fn with_lock<T>(&self, operation: &str, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let lock = self.lock(operation)?;
        let result = f(self);
        let released = lock.release();
        let value = result?;
        released?;
        Ok(value)
    }

    fn default_purpose(&self) -> String {
        let stem: String = self
            .paths
            .database
            .file_stem()
            .map(|s| {
                s.to_string_lossy()
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                            c
                        } else {
                            '_'
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        if stem.is_empty() {
            "database_backup".to_string()
        } else {
            format!("{stem}_backup")
        }
    }
}

fn retention_of(config: &ProtectionConfig) -> RetentionPolicy {
    RetentionPolicy {
        max_backups: config.max_backups as usize,
        retention_days: config.backup_retention_days,
    }
}

// ── Guarded operation scope ─────────────────────────────────────────────────

/// A running guarded operation. Holds the lock until committed or dropped.
pub struct GuardedOperation<'a> {
    orchestrator: &'a Orchestrator,
    name: String,
    pre_backup: Option<BackupRecord>,
    was_protected: bool,
    lock: Option<LockHandle>,
}

impl GuardedOperation<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pre_backup(&self) -> Option<&BackupRecord> {
        self.pre_backup.as_ref()
    }

    pub fn protection_was_enabled(&self) -> bool {
        self.was_protected
    }

    /// Success path: take the `post_<name>` backup, then clean up. A failed
    /// post backup is reported after protection and the lock are restored.
    pub fn commit(mut self) -> Result<Option<BackupRecord>> {
        let orchestrator = self.orchestrator;
        let post = if orchestrator.paths.database.is_file() {
            orchestrator
                .store
                .create(&format!("post_{}", self.name))
                .map(Some)
        } else {
            warn!(operation = %self.name, "database missing after operation; no post-operation backup");
            Ok(None)
        };

        let cleanup = self.cleanup();
        let post = post?;
        cleanup?;

        info!(operation = %self.name, "guarded operation completed");
        Ok(post)
    }

    fn cleanup(&mut self) -> Result<()> {
        let mut result = Ok(());
        if self.was_protected {
            if let Err(e) = self.orchestrator.guard.protect() {
                warn!(operation = %self.name, error = %e, "could not re-apply protection");
                result = Err(e);
            }
        }
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.release() {
                warn!(operation = %self.name, error = %e, "could not release lock");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl Drop for GuardedOperation<'_> {
    fn drop(&mut self) {
        if self.lock.is_none() {
            return;
        }
        warn!(
            operation = %self.name,
            pre_backup = ?self.pre_backup.as_ref().map(|b| b.path.display().to_string()),
            "guarded operation did not complete; pre-operation backup kept for recovery"
        );
        let _ = self.cleanup();
    }
}
