//! Reinstalling package binaries from a backup location.
//!
//! The install tool runs inside the system server, which may not be allowed to
//! read the backup location. The binary is therefore staged first when needed:
//!
//! 1. package staging directory present: copy under a timestamped name, install, remove
//! 2. backup under the engine's private storage: copy into a fresh temp dir on
//!    shared storage, install, remove the temp dir
//! 3. otherwise install straight from the backup location
//!
//! System packages restored onto the system partition also get their native
//! libraries copied into `/system/lib`.

use chrono::Utc;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

use crate::archive::Archiver;
use crate::command_runner::{CommandRunner, run_reporting};
use crate::error_sink::ErrorSink;
use crate::fs_util::delete_tree;
use crate::types::{BackupLocation, CommandBatch, last_component};

/// More stderr lines than this from an install batch means the install failed.
///
/// The install tool exits 0 even on failure and prints part of its normal
/// output to stderr, so this is an approximation of the real result. Replace
/// it once the tool reports a structured result.
pub const INSTALL_STDERR_LIMIT: usize = 1;

/// Library directory of the system partition
pub const SYSTEM_LIB_DIR: &str = "/system/lib";

/// Where the binary is read from during install
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingStrategy {
    /// Copy to `<dir>/<stamp>.apk`
    PackageStaging(PathBuf),
    /// Copy into a temp dir on shared storage
    SharedTemp(PathBuf),
    Direct,
}

pub struct ApkInstaller<'a> {
    runner: &'a dyn CommandRunner,
    toolbox: &'a str,
    install_command: &'a str,
    staging_dir: &'a Path,
    own_data_dir: &'a str,
    shared_storage: &'a Path,
}

impl<'a> ApkInstaller<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        toolbox: &'a str,
        install_command: &'a str,
        staging_dir: &'a Path,
        own_data_dir: &'a str,
        shared_storage: &'a Path,
    ) -> Self {
        Self {
            runner,
            toolbox,
            install_command,
            staging_dir,
            own_data_dir,
            shared_storage,
        }
    }

    /// Pick a strategy; `stamp` makes staged names unique
    pub fn strategy(&self, location: &BackupLocation, stamp: i64) -> StagingStrategy {
        if self.staging_dir.exists() {
            StagingStrategy::PackageStaging(self.staging_dir.join(format!("{}.apk", stamp)))
        } else if location.is_under(self.own_data_dir) {
            StagingStrategy::SharedTemp(self.shared_storage.join(format!("apkTmp{}", stamp)))
        } else {
            StagingStrategy::Direct
        }
    }

    /// Install batch for `apk` (a file name inside `location`)
    pub fn install_commands(
        &self,
        location: &BackupLocation,
        apk: &str,
        strategy: &StagingStrategy,
    ) -> CommandBatch {
        let tb = self.toolbox;
        let source = location.path().join(apk);
        let mut batch = CommandBatch::elevated();
        match strategy {
            StagingStrategy::PackageStaging(staged) => {
                batch
                    .push(format!("{} cp {} {}", tb, source.display(), staged.display()))
                    .push(format!("{} -r {}", self.install_command, staged.display()))
                    .push(format!("{} rm -r {}", tb, staged.display()));
            }
            StagingStrategy::SharedTemp(tmp) => {
                batch
                    .push(format!("{} mkdir {}", tb, tmp.display()))
                    .push(format!("{} cp {} {}", tb, source.display(), tmp.display()))
                    .push(format!("{} -r {}", self.install_command, tmp.join(apk).display()))
                    .push(format!("{} rm -r {}", tb, tmp.display()));
            }
            StagingStrategy::Direct => {
                batch.push(format!("{} -r {}", self.install_command, source.display()));
            }
        }
        batch
    }

    /// Install `apk` from `location`. Returns 0 or 1 failures.
    pub fn restore_user_apk(
        &self,
        sink: &ErrorSink,
        location: &BackupLocation,
        label: &str,
        apk: &str,
    ) -> u32 {
        let strategy = self.strategy(location, Utc::now().timestamp_millis());
        info!("installing {} via {:?}", apk, strategy);
        let batch = self.install_commands(location, apk, &strategy);

        let mut diagnostics = Vec::new();
        let status = match self.runner.run(&batch, &mut |_| {}, &mut |l| {
            diagnostics.push(l.to_string())
        }) {
            Ok(status) => status,
            Err(e) => {
                warn!("restore of {} failed: {}", apk, e);
                sink.report("", &e.to_string());
                1
            }
        };

        if diagnostics.len() > INSTALL_STDERR_LIMIT {
            sink.report_all(label, diagnostics.iter().map(String::as_str));
            return 1;
        }
        u32::from(status != 0)
    }

    /// Put `apk` back on the system partition under `/system/app/<stem>/`
    pub fn system_apk_commands(&self, location: &BackupLocation, apk: &str) -> CommandBatch {
        let tb = self.toolbox;
        let stem = apk.rsplit_once('.').map_or(apk, |(stem, _)| stem);
        let base = format!("/system/app/{}/", stem);
        CommandBatch::elevated()
            .with("mount -o remount,rw /system")
            .with(format!("mkdir -p {}", base))
            .with(format!("{} chmod 755 {}", tb, base))
            // the target must exist before the copy or the package manager cannot open it
            .with(format!("{} touch {}{}", tb, base, apk))
            .with(format!("{} cp {}/{} {}", tb, location.shell_path(), apk, base))
            .with(format!("{} chmod 644 {}{}", tb, base, apk))
            .with("mount -o remount,ro /system")
    }

    pub fn restore_system_apk(
        &self,
        sink: &ErrorSink,
        location: &BackupLocation,
        label: &str,
        apk: &str,
    ) -> u32 {
        let batch = self.system_apk_commands(location, apk);
        u32::from(run_reporting(self.runner, &batch, sink, label) != 0)
    }

    /// Copy `lib/<abi>/*` entries of `staged` (the unpacked apk tree) into the system partition
    pub fn native_library_commands(&self, staged: &Path, libs: &[String]) -> CommandBatch {
        let mut batch = CommandBatch::elevated();
        batch.push("mount -o remount,rw /system");
        for lib in libs {
            let Some(name) = last_component(lib) else {
                continue;
            };
            batch
                .push(format!("rsync {}/{} {}", staged.display(), lib, SYSTEM_LIB_DIR))
                .push(format!("chmod 644 {}/{}", SYSTEM_LIB_DIR, name));
        }
        batch.push("mount -o remount,ro /system");
        batch
    }

    /// Extract the native libraries of `apk` into `output_dir` and install them
    /// under `/system/lib`. The first ABI in `abis` with any libraries wins.
    /// Returns 0 or 1 failures; an apk without libraries is a success.
    pub fn copy_native_libraries(
        &self,
        sink: &ErrorSink,
        archiver: &dyn Archiver,
        apk: &Path,
        output_dir: &Path,
        subject: &str,
        abis: &[String],
    ) -> u32 {
        let libs = native_libraries(archiver, apk, abis);
        if libs.is_empty() {
            debug!("no native libraries in {:?} for {:?}", apk, abis);
            return 0;
        }

        let failures = match archiver.decompress(apk, output_dir, Some(&libs)) {
            Ok(()) => {
                let batch = self.native_library_commands(output_dir, &libs);
                u32::from(run_reporting(self.runner, &batch, sink, subject) != 0)
            }
            Err(e) => {
                warn!("extracting native libraries of {:?} failed: {}", apk, e);
                sink.report(subject, &format!("error unzipping {:?}: {}", apk, e));
                1
            }
        };
        for f in delete_tree(&output_dir.join("lib")) {
            sink.report(subject, &format!("could not delete {:?}: {}", f.path, f.error));
        }
        failures
    }
}

/// Library entries of `apk` for the first ABI in `abis` that has any
pub fn native_libraries(archiver: &dyn Archiver, apk: &Path, abis: &[String]) -> Vec<String> {
    for abi in abis {
        match archiver.list(apk, &format!("lib/{}/", abi)) {
            Ok(entries) => {
                let mut libs: Vec<String> =
                    entries.into_iter().filter(|e| !e.ends_with('/')).collect();
                if !libs.is_empty() {
                    libs.sort();
                    return libs;
                }
            }
            Err(e) => {
                debug!("cannot list {:?}: {}", apk, e);
                return Vec::new();
            }
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ZipArchiver;
    use crate::command_runner::{RecordingRunner, ScriptedResponse};
    use std::fs::File;
    use std::io::Write;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    /// Write an apk-shaped zip holding `entries`
    fn fake_apk(path: &Path, entries: &[&str]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for entry in entries {
            zip.start_file(*entry, SimpleFileOptions::default()).unwrap();
            zip.write_all(b"\x7fELF").unwrap();
        }
        zip.finish().unwrap();
    }

    fn installer<'a>(runner: &'a RecordingRunner, staging: &'a Path) -> ApkInstaller<'a> {
        ApkInstaller::new(
            runner,
            "toybox",
            "cmd package install",
            staging,
            "/data/data/org.vault",
            Path::new("/sdcard"),
        )
    }

    #[test]
    fn test_strategy_priority() {
        let runner = RecordingRunner::new();
        let staging = tempfile::tempdir().unwrap();
        let private = BackupLocation::new("/data/data/org.vault/backups/org.foo");
        let shared = BackupLocation::new("/sdcard/backups/org.foo");

        assert_eq!(
            installer(&runner, staging.path()).strategy(&private, 7),
            StagingStrategy::PackageStaging(staging.path().join("7.apk"))
        );

        let missing = Path::new("/nonexistent/staging");
        assert_eq!(
            installer(&runner, missing).strategy(&private, 7),
            StagingStrategy::SharedTemp(PathBuf::from("/sdcard/apkTmp7"))
        );
        assert_eq!(installer(&runner, missing).strategy(&shared, 7), StagingStrategy::Direct);
    }

    #[test]
    fn test_shared_temp_commands() {
        let runner = RecordingRunner::new();
        let loc = BackupLocation::new("/data/data/org.vault/backups/org.foo");
        let batch = installer(&runner, Path::new("/nonexistent")).install_commands(
            &loc,
            "base.apk",
            &StagingStrategy::SharedTemp(PathBuf::from("/sdcard/apkTmp5")),
        );
        assert_eq!(
            batch.commands,
            vec![
                "toybox mkdir /sdcard/apkTmp5",
                "toybox cp /data/data/org.vault/backups/org.foo/base.apk /sdcard/apkTmp5",
                "cmd package install -r /sdcard/apkTmp5/base.apk",
                "toybox rm -r /sdcard/apkTmp5",
            ]
        );
    }

    #[test]
    fn test_staged_install_removes_copy() {
        let runner = RecordingRunner::new();
        let staging = tempfile::tempdir().unwrap();
        let loc = BackupLocation::new("/sdcard/backups/org.foo");
        let sink = ErrorSink::new();
        assert_eq!(
            installer(&runner, staging.path()).restore_user_apk(&sink, &loc, "Foo", "base.apk"),
            0
        );
        let commands = runner.commands();
        assert_eq!(commands.len(), 3);
        assert!(commands[1].starts_with("cmd package install -r "));
        assert!(commands[2].starts_with("toybox rm -r "));
    }

    #[test]
    fn test_false_success_is_failure() {
        let runner = RecordingRunner::new().respond(
            ScriptedResponse::new("install")
                .stderr("Failure [INSTALL_FAILED_UPDATE_INCOMPATIBLE]")
                .stderr("Error: package signatures do not match"),
        );
        let sink = ErrorSink::new();
        let loc = BackupLocation::new("/sdcard/backups/org.foo");
        let result = installer(&runner, Path::new("/nonexistent"))
            .restore_user_apk(&sink, &loc, "Foo", "base.apk");
        assert_eq!(result, 1);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_single_stderr_line_is_success() {
        let runner = RecordingRunner::new()
            .respond(ScriptedResponse::new("install").stderr("Success"));
        let sink = ErrorSink::new();
        let loc = BackupLocation::new("/sdcard/backups/org.foo");
        assert_eq!(
            installer(&runner, Path::new("/nonexistent")).restore_user_apk(&sink, &loc, "Foo", "base.apk"),
            0
        );
        assert!(sink.is_empty());
    }

    #[test]
    fn test_system_apk_commands() {
        let runner = RecordingRunner::new();
        let loc = BackupLocation::new("/sdcard/backups/org.term");
        let batch = installer(&runner, Path::new("/x")).system_apk_commands(&loc, "Term.apk");
        assert_eq!(
            batch.commands,
            vec![
                "mount -o remount,rw /system",
                "mkdir -p /system/app/Term/",
                "toybox chmod 755 /system/app/Term/",
                "toybox touch /system/app/Term/Term.apk",
                "toybox cp /sdcard/backups/org.term/Term.apk /system/app/Term/",
                "toybox chmod 644 /system/app/Term/Term.apk",
                "mount -o remount,ro /system",
            ]
        );
    }

    #[test]
    fn test_native_libraries_prefer_first_abi_with_entries() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("base.apk");
        fake_apk(
            &apk,
            &["classes.dex", "lib/armeabi-v7a/libfoo.so", "lib/armeabi-v7a/libbar.so", "lib/x86/libfoo.so"],
        );
        let abis = vec!["arm64-v8a".to_string(), "armeabi-v7a".to_string()];
        assert_eq!(
            native_libraries(&ZipArchiver, &apk, &abis),
            vec!["lib/armeabi-v7a/libbar.so", "lib/armeabi-v7a/libfoo.so"]
        );
        assert!(native_libraries(&ZipArchiver, &dir.path().join("missing.apk"), &abis).is_empty());
    }

    #[test]
    fn test_copy_native_libraries() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("Term.apk");
        fake_apk(&apk, &["classes.dex", "lib/arm64-v8a/libterm.so"]);
        let out = dir.path().join("backup");

        let runner = RecordingRunner::new();
        let sink = ErrorSink::new();
        let failures = installer(&runner, Path::new("/x")).copy_native_libraries(
            &sink,
            &ZipArchiver,
            &apk,
            &out,
            "org.term",
            &["arm64-v8a".to_string()],
        );
        assert_eq!(failures, 0, "{:?}", sink.entries());
        assert_eq!(
            runner.commands(),
            vec![
                "mount -o remount,rw /system".to_string(),
                format!("rsync {}/lib/arm64-v8a/libterm.so /system/lib", out.display()),
                "chmod 644 /system/lib/libterm.so".to_string(),
                "mount -o remount,ro /system".to_string(),
            ]
        );
        assert!(!out.join("lib").exists());
        assert!(!out.join("classes.dex").exists());
    }

    #[test]
    fn test_apk_without_native_libraries_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("base.apk");
        fake_apk(&apk, &["classes.dex"]);
        let runner = RecordingRunner::new();
        let sink = ErrorSink::new();
        assert_eq!(
            installer(&runner, Path::new("/x")).copy_native_libraries(
                &sink,
                &ZipArchiver,
                &apk,
                dir.path(),
                "org.foo",
                &["arm64-v8a".to_string()],
            ),
            0
        );
        assert!(runner.commands().is_empty());
    }
}
