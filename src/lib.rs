//! PkgVault library
//!
//! Backup and restore of installed app packages and their private,
//! device-protected and external data, driven through privileged shell sessions.

pub mod archive;
pub mod backup;
pub mod cli;
pub mod command_runner;
pub mod config;
pub mod engine;
pub mod error;
pub mod error_sink;
pub mod fs_util;
pub mod installer;
pub mod lifecycle;
pub mod ownership;
pub mod permissions;
pub mod platform;
pub mod process_guard;
pub mod restore;
pub mod types;

// Re-export main types for convenience
pub use archive::{ArchiveStatus, Archiver, ZipArchiver, compress_and_clean};
pub use backup::{BackupPipeline, BackupPlan};
pub use command_runner::{CommandRunner, RecordingRunner, ScriptedResponse, ShellRunner};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{OwnershipError, PkgVaultError, Result};
pub use error_sink::ErrorSink;
pub use installer::{ApkInstaller, StagingStrategy};
pub use lifecycle::PackageLifecycle;
pub use ownership::{HelperResolver, OwnershipMode, OwnershipResolver, StatResolver};
pub use permissions::PermissionApplier;
pub use platform::{AndroidPlatform, Platform, RunningProcess};
pub use process_guard::{CommandProcessGroup, ProcessGuard, SessionRegistry};
pub use restore::RestorePipeline;
pub use types::{
    AppEntity, BackupLocation, BackupMode, CommandBatch, ExecutionResult, Ownership, Privilege,
};
