//! Backup pipeline.
//!
//! One run copies an app into its backup location with a single elevated
//! batch, fixes ownership when the location is private to the engine, strips
//! native libraries and archives every data subtree it produced:
//!
//! ```text
//! <location>/
//!   base.apk
//!   <name>.zip                          private data
//!   external_files/<name>.zip           shared-storage data (optional)
//!   device_protected_files/<name>.zip   device-protected data
//! ```

use log::{debug, error, info};
use std::fs;
use std::path::PathBuf;

use crate::archive::compress_and_clean;
use crate::command_runner::run_reporting;
use crate::engine::Engine;
use crate::error_sink::ErrorSink;
use crate::types::{
    AppEntity, BackupLocation, BackupMode, CommandBatch, DEVICE_PROTECTED_FILES, EXTERNAL_FILES,
    last_component,
};

/// What a run will produce, decided before anything executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPlan {
    /// Directories the engine creates itself before the batch runs
    pub directories: Vec<PathBuf>,
    pub batch: CommandBatch,
    /// Name of the copied data directory (`org.foo`)
    pub data_dir_name: String,
    /// Device-protected data is copied
    pub device_protected: bool,
    /// External data is copied
    pub external: bool,
    /// Stale external archive to remove because external files are disabled
    pub stale_external_archive: Option<PathBuf>,
}

pub struct BackupPipeline<'a> {
    engine: &'a Engine,
}

fn trimmed(path: &str) -> &str {
    path.trim_end_matches('/')
}

/// Create each directory in-process; false (and reported) on the first failure
fn create_directories(sink: &ErrorSink, subject: &str, directories: &[PathBuf]) -> bool {
    for dir in directories {
        if let Err(e) = fs::create_dir_all(dir) {
            error!("couldn't create {:?}: {}", dir, e);
            sink.report(subject, &format!("couldn't create {}: {}", dir.display(), e));
            return false;
        }
    }
    true
}

impl<'a> BackupPipeline<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Build the copy batch for `app`. `None` when the app has no data directory.
    pub fn plan(
        &self,
        app: &AppEntity,
        location: &BackupLocation,
        mode: BackupMode,
    ) -> Option<BackupPlan> {
        let data_dir = trimmed(app.data_dir.as_deref()?);
        let data_dir_name = last_component(data_dir)?.to_string();
        let dest = location.shell_path();
        let config = self.engine.config();

        let mut directories = vec![location.path().to_path_buf()];
        let mut batch = CommandBatch::elevated();

        let mut device_protected = false;
        let mut external = false;
        let mut stale_external_archive = None;

        if mode.includes_data() {
            if app.device_protected_data_dir.is_some() {
                directories.push(location.device_protected_dir());
                device_protected = true;
            }
            if config.backup_external_files {
                let ext_dir = self
                    .engine
                    .platform()
                    .external_storage_base()
                    .map(|base| base.join(&data_dir_name))
                    .filter(|dir| dir.exists());
                if ext_dir.is_some() {
                    directories.push(location.external_files_dir());
                    external = true;
                }
            } else {
                stale_external_archive = Some(location.external_archive(&data_dir_name));
            }
        }

        if mode.includes_data() {
            batch.push(format!("rsync -r --exclude cache {} {}", data_dir, dest));
        }
        if mode.includes_apk() {
            batch.push(format!("rsync {} {}", app.apk_path, dest));
        }
        if device_protected {
            if let Some(dp_dir) = app.device_protected_data_dir.as_deref() {
                batch.push(format!(
                    "rsync -r {} {}/{}",
                    trimmed(dp_dir),
                    dest,
                    DEVICE_PROTECTED_FILES
                ));
            }
        }
        if external {
            if let Some(base) = self.engine.platform().external_storage_base() {
                batch.push(format!(
                    "rsync -r {} {}/{}",
                    base.join(&data_dir_name).display(),
                    dest,
                    EXTERNAL_FILES
                ));
            }
        }

        Some(BackupPlan {
            directories,
            batch,
            data_dir_name,
            device_protected,
            external,
            stale_external_archive,
        })
    }

    /// Back up `app` into `location`. Returns the number of failed steps.
    pub fn run(
        &self,
        sink: &ErrorSink,
        app: &AppEntity,
        location: &BackupLocation,
        mode: BackupMode,
    ) -> u32 {
        info!("backup: {} ({})", app.label, mode);
        let Some(plan) = self.plan(app, location, mode) else {
            error!("{} has no data directory", app.package_name);
            sink.report(&app.label, "data directory is missing, cannot back up");
            return 1;
        };

        if let Some(stale) = &plan.stale_external_archive {
            self.engine.delete_path(sink, &app.label, stale);
        }

        // Created here so the tree belongs to the engine, not to the elevated shell
        if !create_directories(sink, &app.label, &plan.directories) {
            self.engine.log_return(1);
            return 1;
        }

        let mut failures = u32::from(run_reporting(self.engine.runner(), &plan.batch, sink, &app.label) != 0);

        // Copies made as root into private storage stay root-owned; shared storage needs no fix.
        if self.engine.is_private(location) {
            failures += self
                .engine
                .permissions()
                .set_permissions(sink, &location.shell_path());
        }

        let copied = location.path().join(&plan.data_dir_name);
        let libs = copied.join("lib");
        if libs.symlink_metadata().is_ok() {
            debug!("stripping native libraries from {:?}", libs);
            self.engine.delete_path(sink, &app.label, &libs);
        }

        if app.package_name == self.engine.config().own_package {
            failures += self.copy_self_apk(sink, location, app);
        }

        if mode.includes_data() {
            let archiver = self.engine.archiver();
            failures += compress_and_clean(archiver, &copied, sink, &app.label);
            if plan.external {
                let dir = location.external_files_dir().join(&plan.data_dir_name);
                failures += compress_and_clean(archiver, &dir, sink, &app.label);
            }
            if plan.device_protected {
                let dir = location.device_protected_dir().join(&plan.data_dir_name);
                failures += compress_and_clean(archiver, &dir, sink, &app.label);
            }
        }

        self.engine.log_return(failures);
        failures
    }

    /// Put the engine's own binary one level above its backup so it is easy to find
    fn copy_self_apk(&self, sink: &ErrorSink, location: &BackupLocation, app: &AppEntity) -> u32 {
        let config = self.engine.config();
        if !config.copy_self_apk {
            return 0;
        }
        let (Some(parent), Some(apk_name)) = (location.path().parent(), app.apk_file_name()) else {
            return 0;
        };
        let batch = CommandBatch::unprivileged().with(format!(
            "{} cp {}/{} {}/{}.apk",
            self.engine.toolbox(),
            location.shell_path(),
            apk_name,
            parent.display(),
            config.own_label
        ));
        u32::from(run_reporting(self.engine.runner(), &batch, sink, "") != 0)
    }

    /// Back up loose files and directories (not belonging to one package).
    /// Directories are archived afterwards.
    pub fn run_special(
        &self,
        sink: &ErrorSink,
        location: &BackupLocation,
        label: &str,
        files: &[String],
    ) -> u32 {
        info!("backup: {}", label);
        if !create_directories(sink, label, &[location.path().to_path_buf()]) {
            return 1;
        }
        let dest = location.shell_path();
        let mut batch = CommandBatch::elevated();
        for file in files {
            batch.push(format!("rsync -r {} {}", trimmed(file), dest));
        }
        let mut failures = u32::from(run_reporting(self.engine.runner(), &batch, sink, label) != 0);

        for file in files {
            let Some(name) = last_component(file) else {
                continue;
            };
            let copied = location.path().join(name);
            if copied.is_dir() {
                failures += compress_and_clean(self.engine.archiver(), &copied, sink, label);
            }
        }
        failures
    }
}
