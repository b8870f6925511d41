//! Timestamped backup files for the primary database.
//!
//! Layout: a flat directory of `{purpose}_{YYYYMMDD_HHMMSS}.db` files, each
//! next to a `.db.sum` sidecar carrying its digest. The file name is the
//! source of truth for purpose and timestamp. Copies are staged as
//! `.db.partial` and only renamed into place once their digest matches the
//! source and, unless told otherwise, the copy passes the integrity check.
//!
//! Timestamps are UTC with one-second resolution. A new backup always gets a
//! timestamp strictly later than the newest one already in the directory, so
//! names never collide and ordering by name equals ordering by creation.
//! Backups dated more than a few minutes ahead of the clock are the exception:
//! they are left alone but never pull new timestamps into the future.

use crate::checksum::{Checksum, ChecksumVerifier, Verification};
use crate::error::{io_at, ProtectionError, Result};
use crate::integrity::{IntegrityCheck, IntegrityReport};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const BACKUP_EXTENSION: &str = ".db";
pub const SIDECAR_SUFFIX: &str = ".sum";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
pub const SAFETY_PURPOSE: &str = "pre_restore_safety";

const PARTIAL_SUFFIX: &str = ".partial";
const TIMESTAMP_LEN: usize = 15;
const MAX_PURPOSE_LEN: usize = 100;
/// Prefix for restore staging files written next to the primary database.
const RESTORE_STAGING_PREFIX: &str = ".dbguard_restore_";
/// How far ahead of the clock a backup may be dated and still count as recent.
const FUTURE_TOLERANCE_SECS: i64 = 300;

// ── Data Models ─────────────────────────────────────────────────────────────

/// One backup artifact. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub file_name: String,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Tagged digest recorded at creation, absent when the sidecar is missing.
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DigestSidecar {
    checksum: String,
    source_checksum: String,
    size_bytes: u64,
    created_at: DateTime<Utc>,
    purpose: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_backups: usize,
    pub retention_days: u32,
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub restored_from: BackupRecord,
    pub safety_backup: Option<BackupRecord>,
}

/// Whether a failed integrity check discards the copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntegrityGate {
    Required,
    Advisory,
}

// ── Store ───────────────────────────────────────────────────────────────────

pub struct BackupStore {
    dir: PathBuf,
    db_path: PathBuf,
    verifier: ChecksumVerifier,
    integrity: Box<dyn IntegrityCheck>,
    retention: RetentionPolicy,
}

impl BackupStore {
    /// Open the backup directory for `db_path`, creating it if needed and
    /// removing staging files left behind by an interrupted copy.
    pub fn open(
        dir: impl AsRef<Path>,
        db_path: impl AsRef<Path>,
        verifier: ChecksumVerifier,
        integrity: Box<dyn IntegrityCheck>,
        retention: RetentionPolicy,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let db_path = db_path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_at(&dir))?;

        Self::cleanup_staging(&dir, |name| name.ends_with(PARTIAL_SUFFIX));
        Self::cleanup_staging(db_parent(&db_path), |name| {
            name.starts_with(RESTORE_STAGING_PREFIX)
        });

        Ok(Self {
            dir,
            db_path,
            verifier,
            integrity,
            retention,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    pub fn set_retention(&mut self, retention: RetentionPolicy) {
        self.retention = retention;
    }

    pub fn set_verifier(&mut self, verifier: ChecksumVerifier) {
        self.verifier = verifier;
    }

    // ── Creation ────────────────────────────────────────────────────────────

    /// Copy the primary database into a new trusted backup, then run the
    /// retention sweep. A copy that fails verification is deleted.
    pub fn create(&self, purpose: &str) -> Result<BackupRecord> {
        let record = self.write_backup(purpose, IntegrityGate::Required)?;
        if let Err(e) = self.prune(None) {
            warn!(error = %e, "retention sweep after backup failed");
        }
        Ok(record)
    }

    /// Preserve the current primary before a restore overwrites it. Kept even
    /// if the primary fails its integrity check. `keep` is the restore source
    /// and is exempt from the sweep that follows.
    fn create_safety_backup(&self, keep: &Path) -> Result<Option<BackupRecord>> {
        if !self.db_path.is_file() {
            warn!(
                path = %self.db_path.display(),
                "no database to preserve before restore"
            );
            return Ok(None);
        }
        let record = self.write_backup(SAFETY_PURPOSE, IntegrityGate::Advisory)?;
        if let Err(e) = self.prune(Some(keep)) {
            warn!(error = %e, "retention sweep after safety backup failed");
        }
        Ok(Some(record))
    }

    fn write_backup(&self, purpose: &str, gate: IntegrityGate) -> Result<BackupRecord> {
        validate_purpose(purpose)?;
        if !self.db_path.is_file() {
            return Err(ProtectionError::DatabaseMissing(self.db_path.clone()));
        }

        let (created_at, file_name) = self.next_slot(purpose)?;
        let final_path = self.dir.join(&file_name);
        let partial = with_suffix(&final_path, PARTIAL_SUFFIX);

        let source = self.verifier.digest(&self.db_path)?;
        let (size_bytes, checksum) = match self.stage_copy(&partial, &final_path, &source, gate) {
            Ok(staged) => staged,
            Err(e) => {
                warn!(path = %final_path.display(), error = %e, "discarding backup copy");
                discard(&partial);
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&partial, &final_path) {
            discard(&partial);
            return Err(io_at(&final_path)(e));
        }

        let sidecar = DigestSidecar {
            checksum: checksum.to_string(),
            source_checksum: source.to_string(),
            size_bytes,
            created_at,
            purpose: purpose.to_string(),
        };
        if let Err(e) = write_sidecar(&final_path, &sidecar) {
            discard(&final_path);
            return Err(e);
        }
        fsync_dir(&self.dir);

        info!(
            path = %final_path.display(),
            purpose,
            size = size_bytes,
            checksum = %checksum,
            "backup created"
        );

        Ok(BackupRecord {
            path: final_path,
            file_name,
            purpose: purpose.to_string(),
            created_at,
            size_bytes,
            checksum: Some(sidecar.checksum),
        })
    }

    fn stage_copy(
        &self,
        partial: &Path,
        final_path: &Path,
        source: &Checksum,
        gate: IntegrityGate,
    ) -> Result<(u64, Checksum)> {
        let size = copy_synced(&self.db_path, partial)?;
        let copied = self.verifier.digest(partial)?;
        if &copied != source {
            return Err(ProtectionError::BackupIntegrity {
                path: final_path.to_path_buf(),
                reason: format!("copy digest {copied} does not match source digest {source}"),
            });
        }

        let report = self.integrity.check_integrity(partial);
        if !report.ok {
            match gate {
                IntegrityGate::Required => {
                    return Err(ProtectionError::BackupIntegrity {
                        path: final_path.to_path_buf(),
                        reason: report.summary(),
                    });
                }
                IntegrityGate::Advisory => warn!(
                    path = %final_path.display(),
                    issues = %report.summary(),
                    "keeping copy of a database that fails its integrity check"
                ),
            }
        }
        Ok((size, copied))
    }

    /// Pick a timestamp strictly after the newest existing backup and a file
    /// name that is not taken. Future-dated backups are skipped when looking
    /// for the newest.
    fn next_slot(&self, purpose: &str) -> Result<(DateTime<Utc>, String)> {
        let now = Utc::now().trunc_subsecs(0);
        let mut ts = now;
        for backup in self.list()? {
            if is_future_dated(&backup.created_at, &now) {
                warn!(
                    path = %backup.path.display(),
                    created_at = %backup.created_at,
                    "ignoring backup dated in the future"
                );
                continue;
            }
            if ts <= backup.created_at {
                ts = backup.created_at + ChronoDuration::seconds(1);
            }
            break;
        }
        loop {
            let name = backup_file_name(purpose, &ts);
            let path = self.dir.join(&name);
            if !path.exists() && !with_suffix(&path, PARTIAL_SUFFIX).exists() {
                return Ok((ts, name));
            }
            ts += ChronoDuration::seconds(1);
        }
    }

    // ── Enumeration ─────────────────────────────────────────────────────────

    /// All well-formed backups, most recent first.
    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_at(&self.dir)(e)),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some((purpose, created_at)) = parse_backup_file_name(&name) else {
                if name.ends_with(BACKUP_EXTENSION) {
                    debug!(file = %name, "skipping backup with malformed name");
                }
                continue;
            };
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            let path = entry.path();
            let checksum = read_sidecar(&path).map(|s| s.checksum);
            records.push(BackupRecord {
                path,
                file_name: name,
                purpose,
                created_at,
                size_bytes: meta.len(),
                checksum,
            });
        }

        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.file_name.cmp(&a.file_name))
        });
        Ok(records)
    }

    /// Describe an arbitrary backup file, inside the backup directory or not.
    /// A file that is one of our backups, however its path is spelled, comes
    /// back as the same record [`list`](Self::list) reports.
    pub fn record_for(&self, path: &Path) -> Result<BackupRecord> {
        let meta = fs::metadata(path).map_err(io_at(path))?;
        if let Some(listed) = self
            .list()?
            .into_iter()
            .find(|record| same_file(&record.path, path))
        {
            return Ok(listed);
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (purpose, created_at) = parse_backup_file_name(&file_name).unwrap_or_else(|| {
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            ("external".to_string(), modified.trunc_subsecs(0))
        });
        Ok(BackupRecord {
            path: path.to_path_buf(),
            file_name,
            purpose,
            created_at,
            size_bytes: meta.len(),
            checksum: read_sidecar(path).map(|s| s.checksum),
        })
    }

    // ── Retention ───────────────────────────────────────────────────────────

    /// Delete backups beyond `max_backups` and those older than the retention
    /// window. The most recent backup and `keep` always survive. `keep` is
    /// matched by file identity, not by how its path is spelled.
    pub fn prune(&self, keep: Option<&Path>) -> Result<Vec<BackupRecord>> {
        let records = self.list()?;
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(self.retention.retention_days));

        let mut removed = Vec::new();
        for (index, record) in records.into_iter().enumerate() {
            if index == 0 || keep.is_some_and(|k| same_file(k, &record.path)) {
                continue;
            }
            let over_count = index >= self.retention.max_backups;
            let expired = record.created_at < cutoff;
            if !over_count && !expired {
                continue;
            }
            match remove_backup_files(&record.path) {
                Ok(()) => {
                    info!(
                        path = %record.path.display(),
                        reason = if over_count { "count" } else { "age" },
                        "pruned backup"
                    );
                    removed.push(record);
                }
                Err(e) => warn!(path = %record.path.display(), error = %e, "could not prune backup"),
            }
        }

        self.remove_orphan_sidecars();
        Ok(removed)
    }

    fn remove_orphan_sidecars(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let orphan_suffix = format!("{BACKUP_EXTENSION}{SIDECAR_SUFFIX}");
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(backup_name) = name.strip_suffix(SIDECAR_SUFFIX) else {
                continue;
            };
            if name.ends_with(&orphan_suffix) && !self.dir.join(backup_name).exists() {
                debug!(path = %path.display(), "removing orphaned digest sidecar");
                let _ = fs::remove_file(&path);
            }
        }
    }

    // ── Verification ────────────────────────────────────────────────────────

    pub fn check_integrity(&self, path: &Path) -> IntegrityReport {
        self.integrity.check_integrity(path)
    }

    /// Re-derive the digest of `record` and compare it with the one recorded
    /// at creation.
    pub fn verify_checksum(&self, record: &BackupRecord) -> Verification {
        self.verifier
            .check_recorded(&record.path, record.checksum.as_deref())
    }

    // ── Restore ─────────────────────────────────────────────────────────────

    /// Overwrite the primary database with `record`.
    ///
    /// The caller is responsible for confirmation and for deciding the source
    /// is trustworthy. A `pre_restore_safety` backup of the current primary is
    /// taken first, unconditionally. The copy is staged next to the primary,
    /// checked against the source digest, and renamed over it.
    pub fn restore_from(&self, record: &BackupRecord) -> Result<RestoreReport> {
        if !record.path.is_file() {
            return Err(ProtectionError::BackupNotFound(
                record.path.display().to_string(),
            ));
        }

        let safety_backup = self.create_safety_backup(&record.path)?;

        let expected = self.verifier.digest(&record.path)?;
        let parent = db_parent(&self.db_path);
        let staging = parent.join(format!(
            "{RESTORE_STAGING_PREFIX}{}",
            Uuid::new_v4().simple()
        ));

        let staged = copy_synced(&record.path, &staging).and_then(|_| self.verifier.digest(&staging));
        match staged {
            Ok(actual) if actual == expected => {}
            Ok(actual) => {
                discard(&staging);
                return Err(ProtectionError::BackupIntegrity {
                    path: record.path.clone(),
                    reason: format!("staged copy digest {actual} differs from backup digest {expected}"),
                });
            }
            Err(e) => {
                discard(&staging);
                return Err(e);
            }
        }

        if let Err(e) = fs::rename(&staging, &self.db_path) {
            discard(&staging);
            return Err(io_at(&self.db_path)(e));
        }
        fsync_dir(parent);

        info!(
            from = %record.path.display(),
            to = %self.db_path.display(),
            safety = ?safety_backup.as_ref().map(|b| b.path.display().to_string()),
            "database restored"
        );

        Ok(RestoreReport {
            restored_from: record.clone(),
            safety_backup,
        })
    }

    // ── Private helpers ─────────────────────────────────────────────────────

    fn cleanup_staging(dir: &Path, is_staging: impl Fn(&str) -> bool) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_staging(&*name) {
                warn!(path = %entry.path().display(), "removing orphaned staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

// ── Naming ─────────────────────────────────────────────────────────────────

/// Purposes are embedded in file names: letters, digits, `_` and `-` only.
pub fn validate_purpose(purpose: &str) -> Result<()> {
    let valid = !purpose.is_empty()
        && purpose.len() <= MAX_PURPOSE_LEN
        && purpose
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(ProtectionError::InvalidBackupName(purpose.to_string()))
    }
}

pub fn backup_file_name(purpose: &str, created_at: &DateTime<Utc>) -> String {
    format!(
        "{purpose}_{}{BACKUP_EXTENSION}",
        created_at.format(TIMESTAMP_FORMAT)
    )
}

/// Split `{purpose}_{YYYYMMDD_HHMMSS}.db` into its parts.
pub fn parse_backup_file_name(name: &str) -> Option<(String, DateTime<Utc>)> {
    let stem = name.strip_suffix(BACKUP_EXTENSION)?;
    if !stem.is_ascii() || stem.len() < TIMESTAMP_LEN + 2 {
        return None;
    }
    let (head, ts) = stem.split_at(stem.len() - TIMESTAMP_LEN);
    let purpose = head.strip_suffix('_')?;
    validate_purpose(purpose).ok()?;
    let naive = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok()?;
    Some((purpose.to_string(), Utc.from_utc_datetime(&naive)))
}

/// A backup dated beyond the clock-skew tolerance.
pub(crate) fn is_future_dated(created_at: &DateTime<Utc>, now: &DateTime<Utc>) -> bool {
    *created_at > *now + ChronoDuration::seconds(FUTURE_TOLERANCE_SECS)
}

// ── File helpers ───────────────────────────────────────────────────────────

/// Whether two paths name the same file. Falls back to comparing the paths
/// when either cannot be resolved.
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn db_parent(db_path: &Path) -> &Path {
    match db_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Byte-for-byte copy into a fresh file, fsynced before returning.
fn copy_synced(src: &Path, dst: &Path) -> Result<u64> {
    let mut input = File::open(src).map_err(io_at(src))?;
    let mut output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)
        .map_err(io_at(dst))?;
    let bytes = io::copy(&mut input, &mut output).map_err(io_at(dst))?;
    output.sync_all().map_err(io_at(dst))?;
    Ok(bytes)
}

fn write_sidecar(backup: &Path, sidecar: &DigestSidecar) -> Result<()> {
    let path = with_suffix(backup, SIDECAR_SUFFIX);
    let json = serde_json::to_vec_pretty(sidecar)?;
    fs::write(&path, json).map_err(io_at(&path))
}

fn read_sidecar(backup: &Path) -> Option<DigestSidecar> {
    let json = fs::read_to_string(with_suffix(backup, SIDECAR_SUFFIX)).ok()?;
    serde_json::from_str(&json).ok()
}

fn remove_backup_files(backup: &Path) -> io::Result<()> {
    match fs::remove_file(backup) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let _ = fs::remove_file(with_suffix(backup, SIDECAR_SUFFIX));
    Ok(())
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove discarded copy");
        }
    }
}

fn fsync_dir(path: &Path) {
    #[cfg(unix)]
    {
        if let Ok(dir) = OpenOptions::new().read(true).open(path) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::IntegrityReport;
    use tempfile::{tempdir, TempDir};

    struct Accept;
    impl IntegrityCheck for Accept {
        fn check_integrity(&self, _: &Path) -> IntegrityReport {
            IntegrityReport::passed()
        }
    }

    struct Reject;
    impl IntegrityCheck for Reject {
        fn check_integrity(&self, _: &Path) -> IntegrityReport {
            IntegrityReport::failed("database disk image is malformed")
        }
    }

    fn store_with(
        dir: &TempDir,
        check: Box<dyn IntegrityCheck>,
        max_backups: usize,
    ) -> BackupStore {
        let db = dir.path().join("finance.db");
        if !db.exists() {
            fs::write(&db, b"primary-v1").unwrap();
        }
        BackupStore::open(
            dir.path().join("backups"),
            db,
            ChecksumVerifier::default(),
            check,
            RetentionPolicy {
                max_backups,
                retention_days: 30,
            },
        )
        .unwrap()
    }

    /// Rename a backup (and its sidecar) so it looks `age` older.
    fn backdate(record: &BackupRecord, age: ChronoDuration) -> PathBuf {
        let name = backup_file_name(&record.purpose, &(record.created_at - age));
        let target = record.path.with_file_name(name);
        fs::rename(&record.path, &target).unwrap();
        fs::rename(
            with_suffix(&record.path, SIDECAR_SUFFIX),
            with_suffix(&target, SIDECAR_SUFFIX),
        )
        .unwrap();
        target
    }

    #[test]
    fn create_writes_named_copy_with_verifiable_digest() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Box::new(Accept), 10);

        let record = store.create("manual").unwrap();
        assert!(record.file_name.starts_with("manual_"));
        assert!(record.file_name.ends_with(".db"));
        assert_eq!(fs::read(&record.path).unwrap(), b"primary-v1");
        assert_eq!(record.size_bytes, 10);
        assert!(store.verify_checksum(&record).is_verified());

        let listed = store.list().unwrap();
        assert_eq!(listed, vec![record]);
    }

    #[test]
    fn failed_integrity_discards_the_copy() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Box::new(Reject), 10);

        let err = store.create("auto").unwrap_err();
        assert!(matches!(err, ProtectionError::BackupIntegrity { .. }));
        assert_eq!(fs::read_dir(store.dir()).unwrap().count(), 0);
    }

    #[test]
    fn missing_primary_is_reported() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Box::new(Accept), 10);
        fs::remove_file(store.database_path()).unwrap();
        assert!(matches!(
            store.create("auto"),
            Err(ProtectionError::DatabaseMissing(_))
        ));
    }

    #[test]
    fn rapid_backups_get_distinct_increasing_timestamps() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Box::new(Accept), 10);

        let a = store.create("t").unwrap();
        let b = store.create("t").unwrap();
        let c = store.create("t").unwrap();
        assert!(a.created_at < b.created_at && b.created_at < c.created_at);

        let names: Vec<_> = store.list().unwrap().into_iter().map(|r| r.file_name).collect();
        assert_eq!(names, vec![c.file_name, b.file_name, a.file_name]);
    }

    #[test]
    fn parses_purposes_with_underscores_and_skips_malformed_names() {
        let (purpose, ts) = parse_backup_file_name("pre_restore_safety_20240131_235959.db").unwrap();
        assert_eq!(purpose, "pre_restore_safety");
        assert_eq!(ts.format(TIMESTAMP_FORMAT).to_string(), "20240131_235959");

        for bad in [
            "notes.txt",
            "auto_2024.db",
            "_20240101_120000.db",
            "auto_20241301_120000.db",
            "bad name_20240101_120000.db",
        ] {
            assert!(parse_backup_file_name(bad).is_none(), "{bad}");
        }

        let dir = tempdir().unwrap();
        let store = store_with(&dir, Box::new(Accept), 10);
        fs::write(store.dir().join("README.db"), b"x").unwrap();
        fs::write(store.dir().join("auto_20240101_120000.db.sum"), b"{}").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn prune_enforces_count_keeping_newest() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Box::new(Accept), 2);

        store.create("one").unwrap();
        let two = store.create("two").unwrap();
        let three = store.create("three").unwrap();

        let kept: Vec<_> = store.list().unwrap();
        assert_eq!(kept, vec![three, two]);
    }

    #[test]
    fn prune_enforces_age_but_never_removes_the_newest() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Box::new(Accept), 10);

        let old = store.create("old").unwrap();
        let old_path = backdate(&old, ChronoDuration::days(45));
        let removed = store.prune(None).unwrap();
        // Only backup left: kept even though it is past retention.
        assert!(removed.is_empty());
        assert!(old_path.exists());

        let fresh = store.create("fresh").unwrap();
        assert!(!old_path.exists());
        assert!(!with_suffix(&old_path, SIDECAR_SUFFIX).exists());
        assert_eq!(store.list().unwrap(), vec![fresh]);
    }

    #[test]
    fn prune_spares_the_active_restore_source() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Box::new(Accept), 1);

        let source = store.create("source").unwrap();
        // Bypass the sweep in `create` by writing directly.
        let newer = store.write_backup("newer", IntegrityGate::Required).unwrap();

        let removed = store.prune(Some(&source.path)).unwrap();
        assert!(removed.is_empty());
        assert!(source.path.exists() && newer.path.exists());

        let removed = store.prune(None).unwrap();
        assert_eq!(removed, vec![source]);
    }

    #[test]
    fn prune_spares_the_restore_source_under_another_spelling() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Box::new(Accept), 1);
        fs::create_dir_all(dir.path().join("sub")).unwrap();

        let source = store.create("source").unwrap();
        store.write_backup("newer", IntegrityGate::Required).unwrap();

        let respelled = dir
            .path()
            .join("sub")
            .join("..")
            .join("backups")
            .join(&source.file_name);
        assert_ne!(respelled, source.path);

        let removed = store.prune(Some(&respelled)).unwrap();
        assert!(removed.is_empty());
        assert!(source.path.exists());
    }

    #[test]
    fn record_for_maps_paths_inside_the_directory_to_listed_records() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Box::new(Accept), 10);
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        let source = store.create("source").unwrap();

        let respelled = dir
            .path()
            .join("sub")
            .join("..")
            .join("backups")
            .join(&source.file_name);
        assert_eq!(store.record_for(&respelled).unwrap(), source);

        let outside = dir.path().join("copy_20240101_000000.db");
        fs::write(&outside, b"primary-v1").unwrap();
        let external = store.record_for(&outside).unwrap();
        assert_eq!(external.path, outside);
        assert!(external.checksum.is_none());
    }

    #[test]
    fn future_dated_backup_does_not_pull_new_names_forward() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Box::new(Accept), 10);
        let ahead = Utc::now().trunc_subsecs(0) + ChronoDuration::days(2);
        let future = store.dir().join(backup_file_name("auto", &ahead));
        fs::write(&future, b"primary-v1").unwrap();

        let before = store.create("manual").unwrap();
        let after = store.create("manual").unwrap();
        assert!(before.created_at < Utc::now() + ChronoDuration::minutes(1));
        assert!(before.created_at < after.created_at);
        assert!(future.exists());
    }

    #[test]
    fn open_removes_interrupted_copies() {
        let dir = tempdir().unwrap();
        let backups = dir.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        let partial = backups.join("auto_20240101_000000.db.partial");
        fs::write(&partial, b"half").unwrap();
        let staging = dir.path().join(format!("{RESTORE_STAGING_PREFIX}abc"));
        fs::write(&staging, b"half").unwrap();

        let _store = store_with(&dir, Box::new(Accept), 10);
        assert!(!partial.exists());
        assert!(!staging.exists());
    }

    #[test]
    fn restore_preserves_current_primary_first() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, Box::new(Reject), 10);
        fs::write(store.database_path(), b"good").unwrap();

        // Trusted backups need a passing check; write the source by hand.
        let source_path = store.dir().join("t1_20240101_000000.db");
        fs::write(&source_path, b"good").unwrap();
        let source = store.record_for(&source_path).unwrap();

        fs::write(store.database_path(), b"broken").unwrap();
        let report = store.restore_from(&source).unwrap();

        assert_eq!(fs::read(store.database_path()).unwrap(), b"good");
        let safety = report.safety_backup.expect("safety backup");
        assert_eq!(safety.purpose, SAFETY_PURPOSE);
        assert_eq!(fs::read(&safety.path).unwrap(), b"broken");
        assert!(safety.created_at > source.created_at);
    }
}
