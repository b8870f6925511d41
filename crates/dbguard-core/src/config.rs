//! Persisted protection configuration.
//!
//! Missing fields fall back to defaults and unknown fields are ignored.
//! Out-of-range numbers found on disk are clamped with a warning; the same
//! values supplied through [`ProtectionConfig::set_option`] are rejected.

use crate::checksum::DigestAlgorithm;
use crate::error::{io_at, ProtectionError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub const MAX_BACKUPS_RANGE: RangeInclusive<u32> = 1..=1000;
pub const BACKUP_INTERVAL_HOURS_RANGE: RangeInclusive<u32> = 1..=8760;
pub const RETENTION_DAYS_RANGE: RangeInclusive<u32> = 1..=36500;
pub const STALE_LOCK_MINUTES_RANGE: RangeInclusive<u32> = 1..=10080;
pub const LOCK_WAIT_SECONDS_RANGE: RangeInclusive<u32> = 0..=3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    pub protection_enabled: bool,
    pub auto_backup_enabled: bool,
    #[serde(deserialize_with = "clamped_u32")]
    pub backup_interval_hours: u32,
    #[serde(deserialize_with = "clamped_u32")]
    pub max_backups: u32,
    #[serde(deserialize_with = "clamped_u32")]
    pub backup_retention_days: u32,
    pub checksum_verification: bool,
    pub checksum_algorithm: DigestAlgorithm,
    #[serde(deserialize_with = "clamped_u32")]
    pub lock_wait_seconds: u32,
    #[serde(deserialize_with = "clamped_u32")]
    pub stale_lock_minutes: u32,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            protection_enabled: true,
            auto_backup_enabled: true,
            backup_interval_hours: 6,
            max_backups: 10,
            backup_retention_days: 30,
            checksum_verification: true,
            checksum_algorithm: DigestAlgorithm::Sha256,
            lock_wait_seconds: 0,
            stale_lock_minutes: 60,
        }
    }
}

/// Accept any integer and saturate it into `u32`; range checks happen later.
fn clamped_u32<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    let raw = i64::deserialize(deserializer)?;
    Ok(raw.clamp(0, i64::from(u32::MAX)) as u32)
}

impl ProtectionConfig {
    /// Keys accepted by [`set_option`](Self::set_option), in display order.
    pub const KEYS: [&'static str; 9] = [
        "protection_enabled",
        "auto_backup_enabled",
        "backup_interval_hours",
        "max_backups",
        "backup_retention_days",
        "checksum_verification",
        "checksum_algorithm",
        "lock_wait_seconds",
        "stale_lock_minutes",
    ];

    /// Load from `path`, writing defaults when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(path)?;
                info!(path = %path.display(), "wrote default protection config");
                return Ok(config);
            }
            Err(e) => return Err(io_at(path)(e)),
        };
        let config: Self = serde_json::from_str(&json).map_err(|e| {
            ProtectionError::ConfigValidation(format!("{}: {e}", path.display()))
        })?;
        Ok(config.clamped())
    }

    /// Persist the whole struct with write-temp-then-rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(io_at(dir))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_at(dir))?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n").map_err(io_at(tmp.path()))?;
        tmp.as_file().sync_all().map_err(io_at(path))?;
        tmp.persist(path).map_err(|e| io_at(path)(e.error))?;
        Ok(())
    }

    /// Parse `value` for `key`, validate, and apply. The struct is left
    /// untouched on error.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        let value = value.trim();
        match key {
            "protection_enabled" => next.protection_enabled = parse_bool(key, value)?,
            "auto_backup_enabled" => next.auto_backup_enabled = parse_bool(key, value)?,
            "checksum_verification" => next.checksum_verification = parse_bool(key, value)?,
            "backup_interval_hours" => next.backup_interval_hours = parse_u32(key, value)?,
            "max_backups" => next.max_backups = parse_u32(key, value)?,
            "backup_retention_days" => next.backup_retention_days = parse_u32(key, value)?,
            "lock_wait_seconds" => next.lock_wait_seconds = parse_u32(key, value)?,
            "stale_lock_minutes" => next.stale_lock_minutes = parse_u32(key, value)?,
            "checksum_algorithm" => {
                next.checksum_algorithm = value
                    .parse()
                    .map_err(|e: String| ProtectionError::ConfigValidation(format!("{key}: {e}")))?
            }
            other => {
                return Err(ProtectionError::ConfigValidation(format!(
                    "unknown option '{other}' (expected one of: {})",
                    Self::KEYS.join(", ")
                )))
            }
        }
        let violations = next.violations();
        if !violations.is_empty() {
            return Err(ProtectionError::ConfigValidation(violations.join("; ")));
        }
        *self = next;
        Ok(())
    }

    /// `(key, value)` pairs for display.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("protection_enabled", self.protection_enabled.to_string()),
            ("auto_backup_enabled", self.auto_backup_enabled.to_string()),
            ("backup_interval_hours", self.backup_interval_hours.to_string()),
            ("max_backups", self.max_backups.to_string()),
            ("backup_retention_days", self.backup_retention_days.to_string()),
            ("checksum_verification", self.checksum_verification.to_string()),
            ("checksum_algorithm", self.checksum_algorithm.to_string()),
            ("lock_wait_seconds", self.lock_wait_seconds.to_string()),
            ("stale_lock_minutes", self.stale_lock_minutes.to_string()),
        ]
    }

    pub fn backup_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.backup_interval_hours))
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(u64::from(self.lock_wait_seconds))
    }

    pub fn stale_lock_after(&self) -> Duration {
        Duration::from_secs(u64::from(self.stale_lock_minutes) * 60)
    }

    fn numeric_fields(&mut self) -> [(&'static str, &mut u32, RangeInclusive<u32>); 5] {
        [
            ("backup_interval_hours", &mut self.backup_interval_hours, BACKUP_INTERVAL_HOURS_RANGE),
            ("max_backups", &mut self.max_backups, MAX_BACKUPS_RANGE),
            ("backup_retention_days", &mut self.backup_retention_days, RETENTION_DAYS_RANGE),
            ("lock_wait_seconds", &mut self.lock_wait_seconds, LOCK_WAIT_SECONDS_RANGE),
            ("stale_lock_minutes", &mut self.stale_lock_minutes, STALE_LOCK_MINUTES_RANGE),
        ]
    }

    fn violations(&self) -> Vec<String> {
        let mut copy = self.clone();
        let violations = copy
            .numeric_fields()
            .into_iter()
            .filter(|(_, value, range)| !range.contains(&**value))
            .map(|(key, value, range)| {
                format!("{key}={value} is outside {}..={}", range.start(), range.end())
            })
            .collect();
        violations
    }

    fn clamped(mut self) -> Self {
        for (key, value, range) in self.numeric_fields() {
            if !range.contains(&*value) {
                let fixed = (*value).clamp(*range.start(), *range.end());
                warn!(key, value = *value, clamped = fixed, "config value out of range");
                *value = fixed;
            }
        }
        self
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ProtectionError::ConfigValidation(format!(
            "{key} expects true or false, got '{value}'"
        ))),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value.parse::<u32>().map_err(|_| {
        ProtectionError::ConfigValidation(format!(
            "{key} expects a non-negative integer, got '{value}'"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("database_protection.json");
        let config = ProtectionConfig::load(&path).unwrap();
        assert_eq!(config, ProtectionConfig::default());
        assert!(path.exists());
        assert_eq!(ProtectionConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_fills_defaults_and_ignores_unknown_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(
            &path,
            r#"{"max_backups": 3, "last_backup": "2024-01-01T00:00:00", "theme": "dark"}"#,
        )
        .unwrap();
        let config = ProtectionConfig::load(&path).unwrap();
        assert_eq!(config.max_backups, 3);
        assert_eq!(config.backup_interval_hours, 6);
        assert!(config.protection_enabled);
    }

    #[test]
    fn out_of_range_values_on_disk_are_clamped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(
            &path,
            r#"{"max_backups": 0, "backup_interval_hours": -4, "backup_retention_days": 99999999}"#,
        )
        .unwrap();
        let config = ProtectionConfig::load(&path).unwrap();
        assert_eq!(config.max_backups, 1);
        assert_eq!(config.backup_interval_hours, 1);
        assert_eq!(config.backup_retention_days, *RETENTION_DAYS_RANGE.end());
    }

    #[test]
    fn malformed_file_is_a_validation_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ProtectionConfig::load(&path),
            Err(ProtectionError::ConfigValidation(_))
        ));

        fs::write(&path, r#"{"max_backups": "ten"}"#).unwrap();
        assert!(matches!(
            ProtectionConfig::load(&path),
            Err(ProtectionError::ConfigValidation(_))
        ));
    }

    #[test]
    fn set_option_validates_and_leaves_config_untouched_on_error() {
        let mut config = ProtectionConfig::default();
        config.set_option("max_backups", "4").unwrap();
        config.set_option("checksum_algorithm", "blake3").unwrap();
        config.set_option("auto_backup_enabled", "false").unwrap();
        assert_eq!(config.max_backups, 4);
        assert_eq!(config.checksum_algorithm, DigestAlgorithm::Blake3);
        assert!(!config.auto_backup_enabled);

        let before = config.clone();
        assert!(config.set_option("max_backups", "0").is_err());
        assert!(config.set_option("max_backups", "-1").is_err());
        assert!(config.set_option("protection_enabled", "maybe").is_err());
        assert!(config.set_option("colour", "blue").is_err());
        assert_eq!(config, before);
    }

    #[test]
    fn save_replaces_file_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        let mut config = ProtectionConfig::default();
        config.save(&path).unwrap();
        config.set_option("backup_retention_days", "7").unwrap();
        config.save(&path).unwrap();

        assert_eq!(ProtectionConfig::load(&path).unwrap().backup_retention_days, 7);
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
