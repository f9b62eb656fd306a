//! sync-manager - Main entry point
//!
//! Backs up, restores or lists the backups of one service in one environment.

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use sync_manager::config::{default_config_path, Config, Environment};
use sync_manager::executor::{self, Mode, RestoreRequest, SyncContext, Verdict};
use sync_manager::resolver::RestoreSelector;
use sync_manager::shutdown;
use sync_manager::utils::{self, ConfigError, SyncError};

const EXIT_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 3;
const EXIT_RESOLVE: u8 = 4;
const EXIT_PARTIAL: u8 = 5;
const EXIT_LOCK_BUSY: u8 = 6;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("mode").required(true).args(["backup", "restore", "show"])))]
struct Args {
    /// Back up every configured path and database
    #[arg(long)]
    backup: bool,

    /// Restore a backup over the configured paths and databases
    #[arg(long)]
    restore: bool,

    /// List available backups
    #[arg(long)]
    show: bool,

    /// Target environment
    #[arg(long, value_enum)]
    env: Environment,

    /// Backup to restore or mark: YYYYMMDD-HHMMSS or "latest"
    #[arg(long, value_name = "TIMESTAMP", default_value = "latest", conflicts_with = "backup")]
    date: RestoreSelector,

    /// Script run after a restore with <timestamp> <env>
    #[arg(long, value_name = "SCRIPT", requires = "restore")]
    extra: Option<PathBuf>,

    /// Restore a backup that is present in one region only
    #[arg(long, requires = "restore")]
    force: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", env = "SYNC_MANAGER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

impl Args {
    fn mode(&self) -> Mode {
        if self.backup {
            Mode::Backup
        } else if self.restore {
            Mode::Restore(RestoreRequest {
                selector: self.date,
                extra: self.extra.clone(),
                force: self.force,
            })
        } else {
            Mode::Show {
                selector: self.date,
            }
        }
    }
}

/// Outcome of racing a run against the shutdown signals.
enum Raced<T> {
    Finished(T),
    Interrupted(shutdown::Signal),
}

/// Drive `run` until it completes or `signal` fires. The losing future is
/// dropped before this returns, so an interrupted run has already killed its
/// child processes and released its lock.
async fn race<T, R, S>(run: R, signal: S) -> Raced<T>
where
    R: Future<Output = T>,
    S: Future<Output = shutdown::Signal>,
{
    tokio::select! {
        outcome = run => Raced::Finished(outcome),
        received = signal => Raced::Interrupted(received),
    }
}

/// Parse the command line after loading `.env` (or `env_file`), so the file
/// can provide `SYNC_MANAGER_CONFIG`.
fn load_args<I, T>(env_file: Option<&Path>, argv: I) -> Result<Args, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let _ = match env_file {
        Some(path) => dotenvy::from_path(path),
        None => dotenvy::dotenv().map(|_| ()),
    };
    Args::try_parse_from(argv)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match load_args(None, std::env::args_os()) {
        Ok(args) => args,
        Err(e) => e.exit(),
    };

    match execute(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Run failed");
            eprintln!("sync-manager: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn execute(args: Args) -> Result<ExitCode> {
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Cannot load {}", config_path.display()))?;
    config
        .validate(args.env)
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting sync-manager v{} (service: {}, env: {})",
        env!("CARGO_PKG_VERSION"),
        config.service.name,
        args.env
    );

    let ctx = SyncContext::connect(Arc::new(config), args.env).await;

    let interrupted = async {
        match shutdown::wait_for_signal().await {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, "Signal handlers unavailable");
                std::future::pending::<shutdown::Signal>().await
            }
        }
    };

    let report = match race(executor::run(&ctx, args.mode()), interrupted).await {
        Raced::Finished(outcome) => outcome?,
        Raced::Interrupted(signal) => {
            tracing::error!(
                signal = signal.as_str(),
                scratch = %ctx.scratch_env_dir().display(),
                "Run interrupted, scratch files may remain"
            );
            // Blocking archive tasks would hold up runtime shutdown
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
    };

    print!("{}", report);

    Ok(match report.verdict() {
        Verdict::Success => ExitCode::SUCCESS,
        Verdict::Partial => ExitCode::from(EXIT_PARTIAL),
        Verdict::Failed => ExitCode::from(EXIT_FAILED),
    })
}

fn exit_code_for(error: &anyhow::Error) -> u8 {
    if error.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    match error.downcast_ref::<SyncError>() {
        Some(SyncError::Config(_)) => EXIT_CONFIG,
        Some(SyncError::Resolve(_)) => EXIT_RESOLVE,
        Some(SyncError::LockBusy { .. }) => EXIT_LOCK_BUSY,
        _ => EXIT_FAILED,
    }
}
