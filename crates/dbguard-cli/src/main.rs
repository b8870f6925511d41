mod output;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use dbguard_core::{
    BackupRecord, Orchestrator, ProtectionError, ProtectionPaths, RestoreOptions,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "dbguard_core=info,dbguard=info";

#[derive(Parser, Debug)]
#[command(name = "dbguard")]
#[command(author, version, about = "Backup, integrity and read-only protection for the finance database", long_about = None)]
struct Cli {
    /// Primary database file
    #[arg(short, long, global = true, default_value = "finance.db")]
    database: PathBuf,

    /// Backup directory [default: backups/ next to the database]
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    /// Protection config file [default: database_protection.json next to the database]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show protection state
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Create a manual backup
    Backup {
        /// Backup name (letters, digits, '_' or '-')
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Make the database read-only
    Protect,

    /// Make the database writable
    Unprotect,

    /// List backups, newest first
    ListBackups {
        #[arg(long)]
        json: bool,
    },

    /// Restore the database from a backup
    Restore {
        /// Backup file name, path, or unique part of a name
        backup: String,

        /// Required: acknowledge that the database will be overwritten
        #[arg(long)]
        confirm: bool,

        /// Skip the interactive prompt
        #[arg(long)]
        force: bool,

        /// Accept a backup whose checksum cannot be verified
        #[arg(long)]
        allow_unverified: bool,
    },

    /// Take an automatic backup if one is due
    AutoBackup,

    /// Check checksum and integrity of every backup
    Verify {
        #[arg(long)]
        json: bool,
    },

    /// Show or change protection settings
    Config {
        /// Set an option, e.g. --set max_backups=20 (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn exit_code_for(error: &anyhow::Error) -> u8 {
    error
        .downcast_ref::<ProtectionError>()
        .map(ProtectionError::exit_code)
        .unwrap_or(1)
}

fn run(cli: Cli) -> Result<()> {
    debug!(command = ?cli.command, database = %cli.database.display(), "dbguard invoked");

    // Refuse before anything touches disk.
    if let Commands::Restore { confirm: false, .. } = &cli.command {
        return Err(ProtectionError::ConfirmationRequired.into());
    }

    let mut paths = ProtectionPaths::for_database(&cli.database);
    if let Some(dir) = cli.backup_dir {
        paths.backup_dir = dir;
    }
    if let Some(config) = cli.config {
        paths.config_file = config;
    }
    let mut orch = Orchestrator::open(paths)?;

    match cli.command {
        Commands::Status { json } => {
            let state = orch.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                print!("{}", output::render_status(&state));
            }
        }

        Commands::Backup { name } => {
            let record = orch.create_backup(name.as_deref())?;
            println!("Backup created: {}", record.path.display());
            println!(
                "  size {}, checksum {}",
                output::format_size(record.size_bytes),
                record.checksum.as_deref().unwrap_or("-")
            );
        }

        Commands::Protect => {
            if orch.protect()? {
                println!("Database is now read-only");
            } else {
                println!("Database was already read-only");
            }
        }

        Commands::Unprotect => {
            if orch.unprotect()? {
                println!("Database is now writable");
            } else {
                println!("Database was already writable");
            }
        }

        Commands::ListBackups { json } => {
            let backups = orch.list_backups()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&backups)?);
            } else {
                print!("{}", output::render_backups(&backups));
            }
        }

        Commands::Restore {
            backup,
            confirm,
            force,
            allow_unverified,
        } => {
            let record = orch.resolve_backup(&backup)?;
            if !force && !confirm_interactively(&record, &orch.paths().database)? {
                println!("Restore cancelled");
                return Ok(());
            }
            let report = orch.restore_with(
                &record,
                RestoreOptions {
                    confirmed: confirm,
                    allow_unverified,
                },
            )?;
            println!(
                "Restored {} from {}",
                orch.paths().database.display(),
                report.restored_from.file_name
            );
            if let Some(safety) = report.safety_backup {
                println!("Previous database preserved as {}", safety.path.display());
            }
        }

        Commands::AutoBackup => match orch.auto_backup_if_needed() {
            Some(record) => println!("Automatic backup created: {}", record.path.display()),
            None => println!("No automatic backup needed"),
        },

        Commands::Verify { json } => {
            let health = orch.verify_backups()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&health)?);
            } else {
                print!("{}", output::render_health(&health));
            }
        }

        Commands::Config { set } => {
            if set.is_empty() {
                println!("# {}", orch.paths().config_file.display());
                print!("{}", output::render_config(orch.config()));
            }
            let assignments = set
                .iter()
                .map(|assignment| {
                    assignment
                        .split_once('=')
                        .map(|(key, value)| (key.trim(), value))
                        .ok_or_else(|| {
                            ProtectionError::ConfigValidation(format!(
                                "expected KEY=VALUE, got '{assignment}'"
                            ))
                        })
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if !assignments.is_empty() {
                orch.set_options(&assignments)?;
            }
            for (key, value) in &assignments {
                println!("{key} = {}", value.trim());
            }
        }
    }

    Ok(())
}

fn confirm_interactively(record: &BackupRecord, database: &Path) -> Result<bool> {
    let mut stderr = io::stderr();
    writeln!(
        stderr,
        "This will overwrite {} with {} ({}).",
        database.display(),
        record.file_name,
        output::format_time(&record.created_at)
    )?;
    write!(stderr, "Type 'yes' to continue: ")?;
    stderr.flush()?;

    let mut answer = String::new();
    io::stdin()
        .read_line(&mut answer)
        .map_err(|e| anyhow!("could not read confirmation: {e}"))?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}
