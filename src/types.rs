//! Core data types shared by every pipeline.
//!
//! Paths that end up interpolated into shell commands are kept as `String`;
//! paths the engine touches directly through `std::fs` are `PathBuf`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use strum::{Display, EnumIter, EnumString};

use crate::error::OwnershipError;

/// Name of the sub-location holding external/shared-storage data.
pub const EXTERNAL_FILES: &str = "external_files";
/// Name of the sub-location holding device-protected data.
pub const DEVICE_PROTECTED_FILES: &str = "device_protected_files";
/// Extension of per-subtree archives.
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Privilege context a command batch runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum Privilege {
    /// Root-equivalent shell (`su`)
    #[strum(serialize = "su")]
    Elevated,
    /// Plain shell (`sh`)
    #[strum(serialize = "sh")]
    Unprivileged,
}

impl Privilege {
    /// Shell binary used for this context
    pub fn shell(&self) -> &'static str {
        match self {
            Self::Elevated => "su",
            Self::Unprivileged => "sh",
        }
    }
}

/// Which parts of an app a backup run touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum BackupMode {
    #[strum(serialize = "apk")]
    ApkOnly,
    #[strum(serialize = "data")]
    DataOnly,
    #[default]
    #[strum(serialize = "both")]
    Both,
}

impl BackupMode {
    /// Whether the installed binary is copied
    pub fn includes_apk(&self) -> bool {
        matches!(self, Self::ApkOnly | Self::Both)
    }

    /// Whether private data (and its sibling subtrees) is copied
    pub fn includes_data(&self) -> bool {
        matches!(self, Self::DataOnly | Self::Both)
    }
}

/// Snapshot of an installed application, supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEntity {
    /// Human readable label, also used as the error subject
    pub label: String,
    /// Package identifier (e.g. `org.example.app`)
    pub package_name: String,
    /// Path of the installed binary
    pub apk_path: String,
    /// Private data directory
    pub data_dir: Option<String>,
    /// Device-protected data directory
    #[serde(default)]
    pub device_protected_data_dir: Option<String>,
    /// Installed on the system partition
    #[serde(default)]
    pub is_system: bool,
}

impl AppEntity {
    /// Last component of the data directory (`/data/data/org.foo` -> `org.foo`)
    pub fn data_dir_name(&self) -> Option<&str> {
        self.data_dir.as_deref().and_then(last_component)
    }

    /// File name of the installed binary (`/data/app/x/base.apk` -> `base.apk`)
    pub fn apk_file_name(&self) -> Option<&str> {
        last_component(&self.apk_path)
    }
}

/// Last non-empty `/`-separated component of a path string
pub fn last_component(path: &str) -> Option<&str> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
}

/// Directory holding one backup instance of one app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLocation {
    root: PathBuf,
}

impl BackupLocation {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path as used inside shell commands
    pub fn shell_path(&self) -> String {
        self.root.display().to_string()
    }

    /// `<root>/external_files`
    pub fn external_files_dir(&self) -> PathBuf {
        self.root.join(EXTERNAL_FILES)
    }

    /// `<root>/device_protected_files`
    pub fn device_protected_dir(&self) -> PathBuf {
        self.root.join(DEVICE_PROTECTED_FILES)
    }

    /// `<root>/<name>.zip`
    pub fn main_archive(&self, data_dir_name: &str) -> PathBuf {
        archive_path(&self.root.join(data_dir_name))
    }

    /// `<root>/external_files/<name>.zip`
    pub fn external_archive(&self, data_dir_name: &str) -> PathBuf {
        archive_path(&self.external_files_dir().join(data_dir_name))
    }

    /// `<root>/device_protected_files/<name>.zip`
    pub fn device_protected_archive(&self, data_dir_name: &str) -> PathBuf {
        archive_path(&self.device_protected_dir().join(data_dir_name))
    }

    /// Whether this location sits under `dir`, compared by whole path components
    pub fn is_under(&self, dir: &str) -> bool {
        !dir.is_empty() && self.root.starts_with(dir)
    }
}

/// Archive file that belongs to `dir` (`dir` + `.zip`)
pub fn archive_path(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_owned();
    name.push(".");
    name.push(ARCHIVE_EXTENSION);
    PathBuf::from(name)
}

/// Owner and group of a path.
///
/// The representation is fixed by the resolver that produced it: the helper
/// yields integers, `stat` parsing yields the raw digit tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Numeric { uid: u32, gid: u32 },
    Textual { uid: String, gid: String },
}

impl Ownership {
    pub fn numeric(uid: u32, gid: u32) -> Self {
        Self::Numeric { uid, gid }
    }

    pub fn textual(
        uid: impl Into<String>,
        gid: impl Into<String>,
    ) -> std::result::Result<Self, OwnershipError> {
        let (uid, gid) = (uid.into(), gid.into());
        if uid.is_empty() || gid.is_empty() {
            return Err(OwnershipError::EmptyId);
        }
        Ok(Self::Textual { uid, gid })
    }
}

impl fmt::Display for Ownership {
    /// `uid:gid`, the form `chown` expects
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric { uid, gid } => write!(f, "{}:{}", uid, gid),
            Self::Textual { uid, gid } => write!(f, "{}:{}", uid, gid),
        }
    }
}

/// Ordered commands submitted to one shell session.
///
/// Every command runs even if an earlier one failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBatch {
    pub privilege: Privilege,
    pub commands: Vec<String>,
}

impl CommandBatch {
    pub fn new(privilege: Privilege) -> Self {
        Self {
            privilege,
            commands: Vec::new(),
        }
    }

    pub fn elevated() -> Self {
        Self::new(Privilege::Elevated)
    }

    pub fn unprivileged() -> Self {
        Self::new(Privilege::Unprivileged)
    }

    /// Append a command
    pub fn push(&mut self, command: impl Into<String>) -> &mut Self {
        self.commands.push(command.into());
        self
    }

    /// Builder-style append
    pub fn with(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

/// One line emitted by a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Exit status plus every line the batch produced, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// 0 = success
    pub status: i32,
    pub lines: Vec<OutputLine>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            OutputLine::Stdout(s) => Some(s.as_str()),
            OutputLine::Stderr(_) => None,
        })
    }

    pub fn stderr(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            OutputLine::Stderr(s) => Some(s.as_str()),
            OutputLine::Stdout(_) => None,
        })
    }
}
