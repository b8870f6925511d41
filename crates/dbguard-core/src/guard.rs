//! Read-only protection of the primary database and the cross-process
//! operation lock.
//!
//! Protection clears the write bits of the database file. It discourages
//! accidental writes and is not a security boundary.
//!
//! The lock is a marker file created with `create_new`, holding a JSON
//! [`LockInfo`]. A marker older than the stale threshold is assumed to belong
//! to a crashed process and is reclaimed. A handle only removes the marker if
//! the token inside still matches its own.

use crate::error::{io_at, ProtectionError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const LOCK_SUFFIX: &str = ".lock";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Contents of the lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
    pub token: String,
}

impl LockInfo {
    pub fn describe(&self) -> String {
        format!(
            "'{}' by pid {} since {}",
            self.operation,
            self.pid,
            self.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

pub struct ProtectionGuard {
    db_path: PathBuf,
    lock_path: PathBuf,
    stale_after: Duration,
}

impl ProtectionGuard {
    pub fn new(db_path: impl AsRef<Path>, stale_after: Duration) -> Self {
        let db_path = db_path.as_ref().to_path_buf();
        let mut lock_name: OsString = db_path.as_os_str().to_owned();
        lock_name.push(LOCK_SUFFIX);
        Self {
            db_path,
            lock_path: PathBuf::from(lock_name),
            stale_after,
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn set_stale_after(&mut self, stale_after: Duration) {
        self.stale_after = stale_after;
    }

    // ── Read-only protection ────────────────────────────────────────────────

    /// Clear every write bit. Returns whether anything changed.
    pub fn protect(&self) -> Result<bool> {
        let mut perms = self.metadata()?.permissions();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = perms.mode();
            let target = mode & !0o222;
            if target == mode {
                return Ok(false);
            }
            perms.set_mode(target);
        }
        #[cfg(not(unix))]
        {
            if perms.readonly() {
                return Ok(false);
            }
            perms.set_readonly(true);
        }

        fs::set_permissions(&self.db_path, perms).map_err(io_at(&self.db_path))?;
        info!(path = %self.db_path.display(), "database set read-only");
        Ok(true)
    }

    /// Restore the owner write bit. Returns whether anything changed.
    pub fn unprotect(&self) -> Result<bool> {
        let mut perms = self.metadata()?.permissions();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = perms.mode();
            let target = mode | 0o200;
            if target == mode {
                return Ok(false);
            }
            perms.set_mode(target);
        }
        #[cfg(not(unix))]
        {
            if !perms.readonly() {
                return Ok(false);
            }
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
        }

        fs::set_permissions(&self.db_path, perms).map_err(io_at(&self.db_path))?;
        info!(path = %self.db_path.display(), "database writable");
        Ok(true)
    }

    /// True if the database exists and carries no write bit.
    pub fn is_protected(&self) -> bool {
        let Ok(meta) = fs::metadata(&self.db_path) else {
            return false;
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o222 == 0
        }
        #[cfg(not(unix))]
        {
            meta.permissions().readonly()
        }
    }

    fn metadata(&self) -> Result<fs::Metadata> {
        fs::metadata(&self.db_path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ProtectionError::DatabaseMissing(self.db_path.clone())
            } else {
                io_at(&self.db_path)(e)
            }
        })
    }

    // ── Operation lock ──────────────────────────────────────────────────────

    pub fn is_locked(&self) -> bool {
        self.lock_path.exists()
    }

    /// Who holds the lock, if the marker exists and is readable.
    pub fn lock_holder(&self) -> Option<LockInfo> {
        let json = fs::read_to_string(&self.lock_path).ok()?;
        serde_json::from_str(&json).ok()
    }

    /// Take the operation lock for `operation`.
    ///
    /// With a zero `wait` a held lock fails at once with `OperationBusy`;
    /// otherwise the marker is polled until `wait` elapses (`LockTimeout`).
    pub fn acquire_lock(&self, operation: &str, wait: Duration) -> Result<LockHandle> {
        let started = Instant::now();
        loop {
            match self.try_create(operation) {
                Ok(handle) => {
                    debug!(lock = %self.lock_path.display(), operation, "lock acquired");
                    return Ok(handle);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_at(&self.lock_path)(e)),
            }

            if !self.lock_path.exists() || self.reclaim_if_stale() {
                continue;
            }

            let waited = started.elapsed();
            if wait.is_zero() {
                return Err(ProtectionError::OperationBusy {
                    lock: self.lock_path.clone(),
                    holder: self.describe_holder(),
                });
            }
            if waited >= wait {
                return Err(ProtectionError::LockTimeout {
                    lock: self.lock_path.clone(),
                    waited,
                });
            }
            thread::sleep(POLL_INTERVAL.min(wait - waited));
        }
    }

    fn try_create(&self, operation: &str) -> io::Result<LockHandle> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)?;

        let info = LockInfo {
            pid: std::process::id(),
            operation: operation.to_string(),
            acquired_at: Utc::now(),
            token: Uuid::new_v4().to_string(),
        };
        let written = serde_json::to_vec(&info)
            .map_err(io::Error::from)
            .and_then(|json| file.write_all(&json))
            .and_then(|()| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&self.lock_path);
            return Err(e);
        }

        Ok(LockHandle {
            path: self.lock_path.clone(),
            token: info.token,
            released: false,
        })
    }

    /// Remove a marker past the stale threshold. Returns true if removed.
    fn reclaim_if_stale(&self) -> bool {
        let holder = self.lock_holder();
        let age = match &holder {
            Some(info) => (Utc::now() - info.acquired_at)
                .to_std()
                .unwrap_or(Duration::ZERO),
            None => match fs::metadata(&self.lock_path).and_then(|m| m.modified()) {
                Ok(modified) => modified.elapsed().unwrap_or(Duration::ZERO),
                Err(_) => return false,
            },
        };
        if age < self.stale_after {
            return false;
        }

        // Someone may have reclaimed and re-taken it since we looked.
        if let Some(info) = &holder {
            if self.lock_holder().map(|now| now.token) != Some(info.token.clone()) {
                return false;
            }
        }

        warn!(
            lock = %self.lock_path.display(),
            holder = %self.describe_holder(),
            age_secs = age.as_secs(),
            "reclaiming stale operation lock"
        );
        match fs::remove_file(&self.lock_path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(lock = %self.lock_path.display(), error = %e, "could not remove stale lock");
                false
            }
        }
    }

    fn describe_holder(&self) -> String {
        self.lock_holder()
            .map(|info| info.describe())
            .unwrap_or_else(|| "unknown holder".to_string())
    }
}

/// Held operation lock. Released on drop.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    token: String,
    released: bool,
}

impl LockHandle {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let current = fs::read_to_string(&self.path)
            .ok()
            .and_then(|json| serde_json::from_str::<LockInfo>(&json).ok());
        match current {
            Some(info) if info.token == self.token => {}
            Some(info) => {
                warn!(
                    lock = %self.path.display(),
                    holder = %info.describe(),
                    "lock was reclaimed by another process; leaving it in place"
                );
                return Ok(());
            }
            None if !self.path.exists() => return Ok(()),
            None => {}
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(lock = %self.path.display(), "lock released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_at(&self.path)(e)),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(error = %e, "failed to release operation lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::{tempdir, TempDir};

    fn guard(dir: &TempDir) -> ProtectionGuard {
        let db = dir.path().join("finance.db");
        fs::write(&db, b"data").unwrap();
        ProtectionGuard::new(db, Duration::from_secs(3600))
    }

    #[test]
    fn protect_and_unprotect_are_idempotent() {
        let dir = tempdir().unwrap();
        let guard = guard(&dir);

        assert!(!guard.is_protected());
        assert!(guard.protect().unwrap());
        assert!(!guard.protect().unwrap());
        assert!(guard.is_protected());

        assert!(guard.unprotect().unwrap());
        assert!(!guard.unprotect().unwrap());
        assert!(!guard.is_protected());
    }

    #[test]
    fn protect_without_database_reports_missing() {
        let dir = tempdir().unwrap();
        let guard = ProtectionGuard::new(dir.path().join("absent.db"), Duration::from_secs(60));
        assert!(matches!(
            guard.protect(),
            Err(ProtectionError::DatabaseMissing(_))
        ));
        assert!(!guard.is_protected());
    }

    #[test]
    fn lock_path_sits_next_to_database() {
        let dir = tempdir().unwrap();
        let guard = guard(&dir);
        assert_eq!(guard.lock_path(), dir.path().join("finance.db.lock"));
    }

    #[test]
    fn second_acquire_is_busy_until_release() {
        let dir = tempdir().unwrap();
        let guard = guard(&dir);

        let handle = guard.acquire_lock("restore", Duration::ZERO).unwrap();
        assert!(guard.is_locked());
        assert_eq!(guard.lock_holder().unwrap().operation, "restore");

        let err = guard.acquire_lock("backup", Duration::ZERO).unwrap_err();
        match err {
            ProtectionError::OperationBusy { holder, .. } => assert!(holder.contains("restore")),
            other => panic!("unexpected error: {other}"),
        }

        handle.release().unwrap();
        assert!(!guard.is_locked());
        guard.acquire_lock("backup", Duration::ZERO).unwrap();
    }

    #[test]
    fn bounded_wait_times_out() {
        let dir = tempdir().unwrap();
        let guard = guard(&dir);
        let _held = guard.acquire_lock("restore", Duration::ZERO).unwrap();

        let err = guard
            .acquire_lock("backup", Duration::from_millis(250))
            .unwrap_err();
        assert!(matches!(err, ProtectionError::LockTimeout { .. }));
        assert!(err.is_busy());
    }

    #[test]
    fn dropping_handle_releases_lock() {
        let dir = tempdir().unwrap();
        let guard = guard(&dir);
        {
            let _handle = guard.acquire_lock("backup", Duration::ZERO).unwrap();
            assert!(guard.is_locked());
        }
        assert!(!guard.is_locked());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempdir().unwrap();
        let guard = guard(&dir);
        let stale = LockInfo {
            pid: 999_999,
            operation: "crashed".into(),
            acquired_at: Utc::now() - ChronoDuration::hours(2),
            token: "old".into(),
        };
        fs::write(guard.lock_path(), serde_json::to_vec(&stale).unwrap()).unwrap();

        let handle = guard.acquire_lock("backup", Duration::ZERO).unwrap();
        let holder = guard.lock_holder().unwrap();
        assert_eq!(holder.operation, "backup");
        assert_eq!(holder.token, handle.token());
    }

    #[test]
    fn release_leaves_a_foreign_lock_alone() {
        let dir = tempdir().unwrap();
        let guard = guard(&dir);
        let handle = guard.acquire_lock("backup", Duration::ZERO).unwrap();

        let foreign = LockInfo {
            pid: 1,
            operation: "other".into(),
            acquired_at: Utc::now(),
            token: "someone-else".into(),
        };
        fs::write(guard.lock_path(), serde_json::to_vec(&foreign).unwrap()).unwrap();

        handle.release().unwrap();
        assert_eq!(guard.lock_holder().unwrap(), foreign);
    }
}
