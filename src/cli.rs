use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

use crate::types::{AppEntity, BackupMode};

/// PkgVault - back up and restore installed app packages and their data
#[derive(Parser)]
#[command(name = "pkgvault")]
#[command(about = "Back up and restore app packages, private data and device-protected data")]
#[command(version)]
pub struct Cli {
    /// Engine configuration file (JSON). Defaults are used when absent.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Dry-run mode: print every command batch instead of executing it.
    ///
    /// Archives and local files are still read, so the printed batches match
    /// what a real run would submit.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// The app a command operates on, given inline or as a JSON file
#[derive(Args, Debug, Clone, Default)]
pub struct AppArgs {
    /// JSON file holding the full app description
    #[arg(long, conflicts_with_all = ["label", "package", "apk", "data_dir", "dp_data_dir", "system"])]
    pub app_json: Option<PathBuf>,

    /// Display label (defaults to the package name)
    #[arg(long)]
    pub label: Option<String>,

    /// Package identifier
    #[arg(short, long)]
    pub package: Option<String>,

    /// Path of the installed binary
    #[arg(long)]
    pub apk: Option<String>,

    /// Private data directory
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Device-protected data directory
    #[arg(long)]
    pub dp_data_dir: Option<String>,

    /// The package lives on the system partition
    #[arg(long)]
    pub system: bool,
}

impl AppArgs {
    pub fn to_entity(&self) -> Result<AppEntity> {
        if let Some(path) = &self.app_json {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read app description from {:?}", path))?;
            return serde_json::from_str(&content).context("Failed to parse app description JSON");
        }
        let package = self
            .package
            .clone()
            .context("Either --app-json or --package must be given")?;
        Ok(AppEntity {
            label: self.label.clone().unwrap_or_else(|| package.clone()),
            apk_path: self.apk.clone().unwrap_or_default(),
            data_dir: self.data_dir.clone(),
            device_protected_data_dir: self.dp_data_dir.clone(),
            is_system: self.system,
            package_name: package,
        })
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Back up an app into a backup location
    Backup {
        #[command(flatten)]
        app: AppArgs,
        /// Backup location directory
        #[arg(short, long)]
        location: PathBuf,
        /// What to back up: apk, data or both
        #[arg(short, long, default_value = "both")]
        mode: BackupMode,
    },
    /// Restore an app's data from a backup location
    Restore {
        #[command(flatten)]
        app: AppArgs,
        #[arg(short, long)]
        location: PathBuf,
        /// Also reinstall this binary (file name inside the location) first
        #[arg(long)]
        apk_file: Option<String>,
    },
    /// Back up loose files and directories
    BackupSpecial {
        #[arg(long)]
        label: String,
        #[arg(short, long)]
        location: PathBuf,
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Restore loose files and directories to their original paths
    RestoreSpecial {
        #[arg(long)]
        label: String,
        #[arg(short, long)]
        location: PathBuf,
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Reinstall a package binary from a backup location
    InstallApk {
        #[command(flatten)]
        app: AppArgs,
        #[arg(short, long)]
        location: PathBuf,
        /// Binary file name inside the location
        apk_file: String,
    },
    /// Uninstall a package
    Uninstall {
        #[command(flatten)]
        app: AppArgs,
    },
    /// Terminate the running processes of a package
    Kill { package: String },
    /// Enable a package for the given users
    Enable {
        package: String,
        /// User ids (defaults to every known user)
        #[arg(short, long)]
        users: Vec<String>,
    },
    /// Disable a package for the given users
    Disable {
        package: String,
        #[arg(short, long)]
        users: Vec<String>,
    },
    /// List disabled packages
    DisabledPackages,
    /// List users on the device
    Users,
    /// Restart the framework without rebooting the kernel
    SoftReboot,
    /// Print the owner of a path
    Owner { path: String },
    /// Print the persistent error log
    Errors,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

impl Commands {
    /// Pipeline commands log their own result line
    pub fn logs_own_result(&self) -> bool {
        matches!(self, Commands::Backup { .. } | Commands::Restore { .. })
    }
}
