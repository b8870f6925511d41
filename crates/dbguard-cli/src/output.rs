//! Human readable rendering for CLI output.

use chrono::{DateTime, Utc};
use dbguard_core::{BackupHealth, BackupRecord, ProtectionConfig, ProtectionState, Verification};
use std::fmt::Write;

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

pub fn format_time(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

pub fn render_status(state: &ProtectionState) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Database:        {}", state.database_path.display());
    match state.database_size {
        Some(size) if state.database_exists => {
            let _ = writeln!(out, "Size:            {}", format_size(size));
        }
        _ => {
            let _ = writeln!(out, "Size:            (missing)");
        }
    }
    let _ = writeln!(out, "Read-only:       {}", yes_no(state.is_read_only));
    let lock = match &state.lock_holder {
        Some(holder) => format!("held {holder}"),
        None if state.is_locked => "held (unreadable marker)".to_string(),
        None => "free".to_string(),
    };
    let _ = writeln!(out, "Operation lock:  {lock}");
    let _ = writeln!(out, "Backup dir:      {}", state.backup_dir.display());
    let _ = writeln!(out, "Backups:         {}", state.backup_count);
    if let Some(latest) = &state.latest_backup {
        let _ = writeln!(
            out,
            "Latest backup:   {} ({})",
            latest.file_name,
            format_time(&latest.created_at)
        );
    }
    let last_auto = state
        .last_auto_backup_at
        .as_ref()
        .map(format_time)
        .unwrap_or_else(|| "never".to_string());
    let _ = writeln!(out, "Last auto:       {last_auto}");
    let _ = writeln!(
        out,
        "Protection:      {}",
        if state.protection_enabled { "enabled" } else { "disabled" }
    );
    let auto = match (state.auto_backup_enabled, state.backup_due) {
        (false, _) => "disabled",
        (true, true) => "enabled (due)",
        (true, false) => "enabled",
    };
    let _ = writeln!(out, "Auto backup:     {auto}");
    out
}

pub fn render_backups(backups: &[BackupRecord]) -> String {
    if backups.is_empty() {
        return "No backups found\n".to_string();
    }
    let width = backups
        .iter()
        .map(|b| b.file_name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());
    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}  {:<23}  {:>10}", "NAME", "CREATED", "SIZE");
    for backup in backups {
        let _ = writeln!(
            out,
            "{:<width$}  {:<23}  {:>10}",
            backup.file_name,
            format_time(&backup.created_at),
            format_size(backup.size_bytes)
        );
    }
    let _ = writeln!(out, "{} backup(s)", backups.len());
    out
}

pub fn render_health(health: &[BackupHealth]) -> String {
    if health.is_empty() {
        return "No backups found\n".to_string();
    }
    let mut out = String::new();
    for entry in health {
        let checksum = match &entry.checksum {
            Verification::Verified => "checksum ok".to_string(),
            Verification::Mismatch { .. } => "CHECKSUM MISMATCH".to_string(),
            Verification::Unverifiable { reason } => format!("unverifiable ({reason})"),
        };
        let integrity = if entry.integrity.ok {
            "integrity ok".to_string()
        } else {
            format!("INTEGRITY FAILED ({})", entry.integrity.summary())
        };
        let _ = writeln!(
            out,
            "{} {}: {checksum}, {integrity}",
            if entry.trustworthy() { "✓" } else { "✗" },
            entry.backup.file_name
        );
    }
    let trusted = health.iter().filter(|h| h.trustworthy()).count();
    let _ = writeln!(out, "{trusted} of {} backup(s) trustworthy", health.len());
    out
}

pub fn render_config(config: &ProtectionConfig) -> String {
    let mut out = String::new();
    for (key, value) in config.entries() {
        let _ = writeln!(out, "{key:<24} {value}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn record(name: &str, size: u64) -> BackupRecord {
        BackupRecord {
            path: PathBuf::from("/backups").join(name),
            file_name: name.to_string(),
            purpose: "auto".to_string(),
            created_at: DateTime::parse_from_rfc3339("2024-03-01T08:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
            size_bytes: size,
            checksum: None,
        }
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn backup_table_lists_every_entry() {
        let table = render_backups(&[
            record("auto_20240301_083000.db", 2048),
            record("manual_20240229_120000.db", 100),
        ]);
        assert!(table.starts_with("NAME"));
        assert!(table.contains("auto_20240301_083000.db"));
        assert!(table.contains("2024-03-01 08:30:00 UTC"));
        assert!(table.contains("2.0 KB"));
        assert!(table.ends_with("2 backup(s)\n"));
        assert_eq!(render_backups(&[]), "No backups found\n");
    }

    #[test]
    fn config_lists_all_keys() {
        let rendered = render_config(&ProtectionConfig::default());
        for key in ProtectionConfig::KEYS {
            assert!(rendered.contains(key), "{key}");
        }
    }
}
