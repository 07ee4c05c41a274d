//! Engine configuration, saved and loaded as JSON.
//!
//! Every field has a default, so a config file only needs the values that
//! differ from a stock device.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PkgVaultError, Result};

/// Default toolbox binary prefixed to file commands
pub const DEFAULT_TOOLBOX: &str = "toybox";
/// Toolboxes tried in order when none is configured
pub const TOOLBOX_CANDIDATES: [&str; 3] = ["toybox", "busybox", "/system/xbin/busybox"];
/// Used when no candidate answers
pub const FALLBACK_TOOLBOX: &str = "busybox";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Toolbox prefix (`toybox`, `busybox`, ...). Empty means probe for one.
    pub toolbox: String,
    /// Ownership helper binary
    pub helper_path: String,
    /// Package name of the engine itself
    pub own_package: String,
    /// Label of the engine itself; an app with this label is the engine
    pub own_label: String,
    /// Private data directory of the engine
    pub own_data_dir: String,
    /// Root of shared storage
    pub shared_storage: PathBuf,
    /// Directory holding per-package external data; defaults to `<shared_storage>/Android/data`
    pub external_files_base: Option<PathBuf>,
    /// Directory the installer may always read from
    pub package_staging_dir: PathBuf,
    /// Also back up and restore external/shared-storage data
    pub backup_external_files: bool,
    /// When backing up the engine itself, put its binary next to the backups
    pub copy_self_apk: bool,
    /// Persistent error log
    pub log_file: Option<PathBuf>,
    /// Package install command
    pub install_command: String,
    /// Users on the device; queried from the package manager when absent
    pub users: Option<Vec<String>>,
    pub elevated_shell: String,
    pub unprivileged_shell: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            toolbox: DEFAULT_TOOLBOX.to_string(),
            helper_path: "/data/data/org.pkgvault/files/pkgvault-utils".to_string(),
            own_package: "org.pkgvault".to_string(),
            own_label: "PkgVault".to_string(),
            own_data_dir: "/data/data/org.pkgvault".to_string(),
            shared_storage: PathBuf::from("/sdcard"),
            external_files_base: None,
            package_staging_dir: PathBuf::from("/data/local/tmp"),
            backup_external_files: false,
            copy_self_apk: false,
            log_file: None,
            install_command: "cmd package install".to_string(),
            users: None,
            elevated_shell: "su".to_string(),
            unprivileged_shell: "sh".to_string(),
        }
    }
}

impl EngineConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|e| {
            PkgVaultError::config(format!(
                "Failed to write configuration to {:?}: {}",
                path.as_ref(),
                e
            ))
        })
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            PkgVaultError::config(format!(
                "Failed to read configuration from {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.helper_path.trim().is_empty() {
            return Err(PkgVaultError::config("Helper path must be specified"));
        }
        if self.own_data_dir.trim().is_empty() {
            return Err(PkgVaultError::config("Own data directory must be specified"));
        }
        if self.install_command.trim().is_empty() {
            return Err(PkgVaultError::config("Install command must be specified"));
        }
        if self.elevated_shell.trim().is_empty() || self.unprivileged_shell.trim().is_empty() {
            return Err(PkgVaultError::config("Shell binaries must be specified"));
        }
        if let Some(users) = &self.users {
            if let Some(bad) = users.iter().find(|u| u.parse::<u32>().is_err()) {
                return Err(PkgVaultError::config(format!("User id {:?} is not numeric", bad)));
            }
        }
        Ok(())
    }

    pub fn external_files_base(&self) -> PathBuf {
        self.external_files_base
            .clone()
            .unwrap_or_else(|| self.shared_storage.join("Android").join("data"))
    }
}
