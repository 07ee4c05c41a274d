//! PkgVault - command line entry point

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::fs;
use std::sync::Arc;

use pkgvault::cli::{Cli, Commands};
use pkgvault::command_runner::{CommandRunner, RecordingRunner, ShellRunner};
use pkgvault::config::EngineConfig;
use pkgvault::engine::Engine;
use pkgvault::error_sink::ErrorSink;
use pkgvault::process_guard::{self, ProcessGuard};
use pkgvault::types::BackupLocation;

/// Initialize the logger with appropriate settings
fn init_logger() {
    use env_logger::Builder;
    use std::io::Write;

    Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}:{}] {}",
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env() // Allows RUST_LOG env var to override
        .init();
}

fn main() {
    init_logger();
    info!("PkgVault starting up");

    // Shell sessions are terminated if we receive SIGINT/SIGTERM/SIGHUP
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    match run(cli) {
        Ok(0) => {}
        Ok(failures) => {
            error!("{} step(s) failed", failures);
            std::process::exit(i32::try_from(failures.min(255)).unwrap_or(255));
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            std::process::exit(1);
        }
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {:?}", path);
            EngineConfig::load_from_file(path)?
        }
        None => EngineConfig::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Dispatch one command. Returns the number of failed steps.
fn run(cli: Cli) -> Result<u32> {
    let config = load_config(&cli)?;

    let sink = match &config.log_file {
        Some(path) => ErrorSink::with_log_file(path),
        None => ErrorSink::new(),
    };

    // Reading the error log needs no shell
    if let Commands::Errors = &cli.command {
        return show_errors(&sink);
    }

    let runner: Arc<dyn CommandRunner> = if cli.dry_run {
        info!("Dry-run: command batches are printed, not executed");
        Arc::new(RecordingRunner::echoing())
    } else {
        Arc::new(ShellRunner::new(
            &config.elevated_shell,
            &config.unprivileged_shell,
        ))
    };
    let engine = Engine::builder(config, runner).build(&sink);

    let logged = cli.command.logs_own_result();
    let failures = match cli.command {
        Commands::Backup {
            app,
            location,
            mode,
        } => engine.backup(&sink, &app.to_entity()?, &BackupLocation::new(location), mode),
        Commands::Restore {
            app,
            location,
            apk_file,
        } => {
            let app = app.to_entity()?;
            let location = BackupLocation::new(location);
            let mut failures = 0;
            if let Some(apk) = apk_file {
                failures += engine.restore_apk(&sink, &app, &location, &apk);
            }
            failures + engine.restore(&sink, &app, &location)
        }
        Commands::BackupSpecial {
            label,
            location,
            files,
        } => engine.backup_special(&sink, &BackupLocation::new(location), &label, &files),
        Commands::RestoreSpecial {
            label,
            location,
            files,
        } => engine.restore_special(&sink, &BackupLocation::new(location), &label, &files),
        Commands::InstallApk {
            app,
            location,
            apk_file,
        } => engine.restore_apk(
            &sink,
            &app.to_entity()?,
            &BackupLocation::new(location),
            &apk_file,
        ),
        Commands::Uninstall { app } => engine.uninstall(&sink, &app.to_entity()?),
        Commands::Kill { package } => {
            engine.lifecycle().kill(&sink, &package);
            0
        }
        Commands::Enable { package, users } => {
            set_enabled(&engine, &sink, &package, users, true);
            0
        }
        Commands::Disable { package, users } => {
            set_enabled(&engine, &sink, &package, users, false);
            0
        }
        Commands::DisabledPackages => {
            for package in engine.lifecycle().disabled_packages().unwrap_or_default() {
                println!("{}", package);
            }
            0
        }
        Commands::Users => {
            for user in engine.users() {
                println!("{}", user);
            }
            0
        }
        Commands::SoftReboot => engine.lifecycle().soft_reboot(&sink),
        Commands::Owner { path } => {
            let owner = engine.resolve_ownership(&sink, &path)?;
            println!("{}", owner);
            0
        }
        Commands::Errors => 0,
    };

    if !logged {
        engine.log_return(failures);
    }
    if !sink.is_empty() {
        eprintln!("{}", sink.errors());
    }
    Ok(failures)
}

fn set_enabled(engine: &Engine, sink: &ErrorSink, package: &str, users: Vec<String>, enable: bool) {
    let users = if users.is_empty() {
        engine.users().to_vec()
    } else {
        users
    };
    engine.lifecycle().set_enabled(sink, package, &users, enable);
}

/// The log file is append-only; it is printed, never truncated
fn show_errors(sink: &ErrorSink) -> Result<u32> {
    let Some(path) = sink.log_file() else {
        println!("No error log configured");
        return Ok(0);
    };
    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read error log {:?}", path))?;
        print!("{}", content);
    }
    Ok(0)
}
