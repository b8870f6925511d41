//! Structural self-check of database files.
//!
//! The check fails closed: a file that cannot be opened, is not a database,
//! or makes the engine error out yields a failed report, never an `Err`.

use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// Maximum number of problems `PRAGMA integrity_check` reports.
const MAX_REPORTED_ISSUES: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub ok: bool,
    pub issues: Vec<String>,
}

impl IntegrityReport {
    pub fn passed() -> Self {
        Self {
            ok: true,
            issues: Vec::new(),
        }
    }

    pub fn failed(issue: impl Into<String>) -> Self {
        Self {
            ok: false,
            issues: vec![issue.into()],
        }
    }

    pub fn summary(&self) -> String {
        if self.ok {
            "ok".to_string()
        } else {
            self.issues.join("; ")
        }
    }
}

/// Decides whether a file is structurally sound enough to trust.
pub trait IntegrityCheck: Send + Sync {
    fn check_integrity(&self, path: &Path) -> IntegrityReport;
}

/// Runs SQLite's `PRAGMA integrity_check` on a read-only connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteIntegrityChecker;

impl SqliteIntegrityChecker {
    fn run(path: &Path) -> rusqlite::Result<Vec<String>> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let mut stmt = conn.prepare(&format!("PRAGMA integrity_check({MAX_REPORTED_ISSUES})"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl IntegrityCheck for SqliteIntegrityChecker {
    fn check_integrity(&self, path: &Path) -> IntegrityReport {
        if !path.is_file() {
            return IntegrityReport::failed(format!("{} does not exist", path.display()));
        }
        match Self::run(path) {
            Ok(rows) if rows.len() == 1 && rows[0].eq_ignore_ascii_case("ok") => {
                debug!(path = %path.display(), "integrity check passed");
                IntegrityReport::passed()
            }
            Ok(rows) if rows.is_empty() => {
                IntegrityReport::failed("integrity_check returned no result")
            }
            Ok(rows) => IntegrityReport {
                ok: false,
                issues: rows,
            },
            Err(e) => IntegrityReport::failed(format!("integrity_check could not run: {e}")),
        }
    }
}
