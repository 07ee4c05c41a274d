//! Restore pipeline.
//!
//! Archives are unpacked next to themselves, copied back into the app's data
//! directories by one elevated batch, and the unpacked staging trees removed
//! afterwards. A backup without data is a valid backup: nothing is copied and
//! the run succeeds.

use log::{debug, info, warn};
use std::path::Path;

use crate::command_runner::run_reporting;
use crate::engine::Engine;
use crate::error_sink::ErrorSink;
use crate::fs_util::has_entries;
use crate::ownership::DEFAULT_DIR_MODE;
use crate::types::{AppEntity, BackupLocation, CommandBatch, Ownership, last_component};

/// Mode applied to restored device-protected data when its owner is only a guess
const DEVICE_PROTECTED_MODE: &str = "777";

pub struct RestorePipeline<'a> {
    engine: &'a Engine,
}

impl<'a> RestorePipeline<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Copy-back batch for an unpacked backup.
    ///
    /// `data_owner` is applied to the data directory after the copy,
    /// `device_protected` is set when the device-protected tree was unpacked.
    pub fn copy_back_commands(
        &self,
        app: &AppEntity,
        location: &BackupLocation,
        data_owner: Option<&Ownership>,
        device_protected: bool,
    ) -> Option<CommandBatch> {
        let data_dir = app.data_dir.as_deref()?.trim_end_matches('/');
        let name = last_component(data_dir)?;
        let tb = self.engine.toolbox();

        let mut batch = CommandBatch::elevated();
        batch
            .push(format!("mkdir -p {}", data_dir))
            .push(format!("{} cp -r {}/{}/* {}", tb, location.shell_path(), name, data_dir));
        if let Some(owner) = data_owner {
            batch.push(self.engine.resolver().owner_command(owner, data_dir));
        }

        let dp_dir = app
            .device_protected_data_dir
            .as_deref()
            .map(|d| d.trim_end_matches('/'))
            .filter(|_| device_protected);
        if let Some(dp_dir) = dp_dir {
            batch
                .push(format!("mkdir -p {}", dp_dir))
                .push(format!(
                    "{} cp -r {}/{}/* {}",
                    tb,
                    location.device_protected_dir().display(),
                    name,
                    dp_dir
                ));
            match self.engine.platform().package_uid(&app.package_name) {
                Some(uid) => {
                    batch.push(format!("{} chown -R {}:{} {}", tb, uid, uid, dp_dir));
                }
                None => debug!("no uid known for {}, leaving owner of {}", app.package_name, dp_dir),
            }
            batch.push(format!("{} chmod -R {} {}", tb, DEVICE_PROTECTED_MODE, dp_dir));
        }

        batch.push(format!("restorecon -R {} || true", data_dir));
        if let Some(dp_dir) = dp_dir {
            batch.push(format!("restorecon -R {} || true", dp_dir));
        }
        Some(batch)
    }

    /// Restore the data of `app` from `location`. Returns the number of failed steps.
    pub fn run(&self, sink: &ErrorSink, app: &AppEntity, location: &BackupLocation) -> u32 {
        info!("restoring: {}", app.label);
        let Some(name) = app.data_dir_name().map(str::to_string) else {
            sink.report(&app.label, "data directory is missing, cannot restore");
            return 1;
        };

        self.engine.lifecycle().kill(sink, &app.package_name);

        let mut failures = 0;
        let mut unpacked = false;
        let archiver = self.engine.archiver();

        let main_archive = location.main_archive(&name);
        if main_archive.exists() {
            match archiver.decompress(&main_archive, location.path(), None) {
                Ok(()) => unpacked = true,
                Err(e) => {
                    sink.report(&app.label, &format!("error unzipping {:?}: {}", main_archive, e));
                    failures += 1;
                }
            }
        }

        if self.engine.config().backup_external_files {
            failures += self.unpack_external(sink, app, location, &name);
        }

        let staged = location.path().join(&name);
        failures += if has_entries(&staged) {
            self.copy_back(sink, app, location, &name)
        } else {
            info!("{} has empty or non-existent subdirectory: {:?}", app.package_name, staged);
            0
        };

        if unpacked {
            self.engine.delete_path(sink, &app.label, &staged);
        }
        self.engine
            .delete_path(sink, &app.label, &location.device_protected_dir().join(&name));

        self.engine.log_return(failures);
        failures
    }

    fn unpack_external(
        &self,
        sink: &ErrorSink,
        app: &AppEntity,
        location: &BackupLocation,
        name: &str,
    ) -> u32 {
        let archive = location.external_archive(name);
        if !archive.exists() {
            return 0;
        }
        let Some(base) = self.engine.platform().external_storage_base() else {
            warn!("no external storage to restore {:?} into", archive);
            return 0;
        };
        match self.engine.archiver().decompress(&archive, &base, None) {
            Ok(()) => 0,
            Err(e) => {
                sink.report(&app.label, &format!("error unzipping {:?}: {}", archive, e));
                1
            }
        }
    }

    fn copy_back(
        &self,
        sink: &ErrorSink,
        app: &AppEntity,
        location: &BackupLocation,
        name: &str,
    ) -> u32 {
        let mut failures = 0;

        let data_owner = match app.data_dir.as_deref() {
            Some(dir) if Path::new(dir).exists() => match self.engine.resolve_ownership(sink, dir) {
                Ok(owner) => Some(owner),
                Err(e) => {
                    warn!("could not resolve owner of {}: {}", dir, e);
                    sink.report(&app.label, &format!("could not find owner of {}: {}", dir, e));
                    failures += 1;
                    None
                }
            },
            _ => None,
        };

        let device_protected = app.device_protected_data_dir.is_some()
            && location.device_protected_dir().exists()
            && self.unpack_device_protected(sink, app, location, name, &mut failures);

        let Some(batch) = self.copy_back_commands(app, location, data_owner.as_ref(), device_protected)
        else {
            return failures + 1;
        };
        if run_reporting(self.engine.runner(), &batch, sink, &app.label) != 0 {
            failures += 1;
        }

        if self.engine.multiuser() {
            self.engine
                .lifecycle()
                .disable_for_other_users(sink, &app.package_name, self.engine.users());
        }
        failures
    }

    /// Unpack the device-protected archive; true when there is something to copy back
    fn unpack_device_protected(
        &self,
        sink: &ErrorSink,
        app: &AppEntity,
        location: &BackupLocation,
        name: &str,
        failures: &mut u32,
    ) -> bool {
        let archive = location.device_protected_archive(name);
        if !archive.exists() {
            return false;
        }
        match self
            .engine
            .archiver()
            .decompress(&archive, &location.device_protected_dir(), None)
        {
            Ok(()) => true,
            Err(e) => {
                sink.report(&app.label, &format!("error unzipping {:?}: {}", archive, e));
                *failures += 1;
                false
            }
        }
    }

    /// Restore loose files and directories to their original paths, keeping
    /// the owner each path currently has.
    pub fn run_special(
        &self,
        sink: &ErrorSink,
        location: &BackupLocation,
        label: &str,
        files: &[String],
    ) -> u32 {
        info!("restoring: {}", label);
        let resolver = self.engine.resolver();
        let mut failures = 0;
        let mut extracted = Vec::new();
        let mut batch = CommandBatch::elevated();

        for file in files {
            let file = file.trim_end_matches('/');
            let Some(name) = last_component(file) else {
                continue;
            };
            let owner = match self.engine.resolve_ownership(sink, file) {
                Ok(owner) => owner,
                Err(e) => {
                    warn!("could not resolve owner of {}: {}", file, e);
                    sink.report(label, &format!("could not find owner of {}: {}", file, e));
                    self.delete_extracted(sink, label, location, &extracted);
                    return 1;
                }
            };

            let mut dest = file;
            if Path::new(file).is_dir() {
                dest = file.rsplit_once('/').map_or("/", |(parent, _)| {
                    if parent.is_empty() { "/" } else { parent }
                });
                let archive = location.main_archive(name);
                if archive.exists() {
                    match self.engine.archiver().decompress(&archive, location.path(), None) {
                        Ok(()) => extracted.push(name.to_string()),
                        Err(e) => {
                            debug!("unzip of {:?} failed: {}", archive, e);
                            sink.report(label, &format!("error unzipping {}", file));
                            failures += 1;
                            continue;
                        }
                    }
                }
            }

            batch.push(format!("rsync -r {}/{} {}", location.shell_path(), name, dest));
            for command in resolver.permission_commands(&owner, file, DEFAULT_DIR_MODE) {
                batch.push(command);
            }
        }

        if !batch.is_empty() && run_reporting(self.engine.runner(), &batch, sink, label) != 0 {
            failures += 1;
        }
        self.delete_extracted(sink, label, location, &extracted);
        failures
    }

    fn delete_extracted(
        &self,
        sink: &ErrorSink,
        label: &str,
        location: &BackupLocation,
        extracted: &[String],
    ) {
        for name in extracted {
            self.engine.delete_path(sink, label, &location.path().join(name));
        }
    }
}
