//! The engine facade: owns the collaborators, runs the one-time probes and
//! exposes every pipeline operation.
//!
//! Construction probes the host once (toolbox, ownership helper, user list).
//! Nothing chosen here is re-evaluated later, so an `Engine` can be shared by
//! concurrent pipeline runs; the only mutable state they share is the
//! `ErrorSink` the caller passes in.

use log::info;
use std::path::Path;
use std::sync::Arc;

use crate::archive::{Archiver, ZipArchiver};
use crate::backup::BackupPipeline;
use crate::command_runner::{CommandRunner, run_reporting};
use crate::config::{EngineConfig, FALLBACK_TOOLBOX, TOOLBOX_CANDIDATES};
use crate::error::OwnershipError;
use crate::error_sink::ErrorSink;
use crate::installer::ApkInstaller;
use crate::lifecycle::PackageLifecycle;
use crate::ownership::{self, OwnershipMode, OwnershipResolver};
use crate::permissions::PermissionApplier;
use crate::platform::{AndroidPlatform, Platform};
use crate::restore::RestorePipeline;
use crate::types::{AppEntity, BackupLocation, BackupMode, CommandBatch, Ownership, Privilege};

pub struct Engine {
    config: EngineConfig,
    runner: Arc<dyn CommandRunner>,
    resolver: Box<dyn OwnershipResolver>,
    archiver: Box<dyn Archiver>,
    platform: Box<dyn Platform>,
    toolbox: String,
    users: Vec<String>,
}

/// Builder for [`Engine`]; any collaborator not supplied is probed or defaulted in `build`.
pub struct EngineBuilder {
    config: EngineConfig,
    runner: Arc<dyn CommandRunner>,
    resolver: Option<Box<dyn OwnershipResolver>>,
    archiver: Option<Box<dyn Archiver>>,
    platform: Option<Box<dyn Platform>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            resolver: None,
            archiver: None,
            platform: None,
        }
    }

    pub fn resolver(mut self, resolver: Box<dyn OwnershipResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn archiver(mut self, archiver: Box<dyn Archiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn platform(mut self, platform: Box<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Probe the host and assemble the engine. Probe diagnostics go to `sink`.
    pub fn build(self, sink: &ErrorSink) -> Engine {
        let runner = self.runner;
        let config = self.config;

        let toolbox = if config.toolbox.trim().is_empty() {
            probe_toolbox(runner.as_ref(), sink)
        } else {
            config.toolbox.trim().to_string()
        };

        let resolver = self.resolver.unwrap_or_else(|| {
            ownership::probe(runner.as_ref(), sink, &config.helper_path, &toolbox)
        });
        let archiver = self.archiver.unwrap_or_else(|| Box::new(ZipArchiver));
        let platform = self.platform.unwrap_or_else(|| {
            Box::new(AndroidPlatform::new(
                Arc::clone(&runner),
                Some(config.external_files_base()),
            ))
        });

        let users = match &config.users {
            Some(users) if !users.is_empty() => users.clone(),
            _ => PackageLifecycle::new(runner.as_ref(), platform.as_ref(), &toolbox)
                .list_users(sink)
                .unwrap_or_default(),
        };

        info!(
            "engine ready: toolbox={} ownership={:?} users={:?}",
            toolbox,
            resolver.mode(),
            users
        );
        Engine {
            config,
            runner,
            resolver,
            archiver,
            platform,
            toolbox,
            users,
        }
    }
}

/// First toolbox candidate that runs, else the fallback
fn probe_toolbox(runner: &dyn CommandRunner, sink: &ErrorSink) -> String {
    for candidate in TOOLBOX_CANDIDATES {
        let batch = CommandBatch::unprivileged().with(candidate);
        if run_reporting(runner, &batch, sink, "toolbox") == 0 {
            return candidate.to_string();
        }
    }
    FALLBACK_TOOLBOX.to_string()
}

impl Engine {
    pub fn builder(config: EngineConfig, runner: Arc<dyn CommandRunner>) -> EngineBuilder {
        EngineBuilder::new(config, runner)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn resolver(&self) -> &dyn OwnershipResolver {
        self.resolver.as_ref()
    }

    pub fn archiver(&self) -> &dyn Archiver {
        self.archiver.as_ref()
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    pub fn toolbox(&self) -> &str {
        &self.toolbox
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    pub fn ownership_mode(&self) -> OwnershipMode {
        self.resolver.mode()
    }

    /// More than one user on the device
    pub fn multiuser(&self) -> bool {
        self.users.len() > 1
    }

    pub fn lifecycle(&self) -> PackageLifecycle<'_> {
        PackageLifecycle::new(self.runner(), self.platform(), &self.toolbox)
    }

    pub fn permissions(&self) -> PermissionApplier<'_> {
        PermissionApplier::new(self.resolver(), self.runner())
    }

    pub fn installer(&self) -> ApkInstaller<'_> {
        ApkInstaller::new(
            self.runner(),
            &self.toolbox,
            &self.config.install_command,
            &self.config.package_staging_dir,
            &self.config.own_data_dir,
            &self.config.shared_storage,
        )
    }

    pub fn backup(
        &self,
        sink: &ErrorSink,
        app: &AppEntity,
        location: &BackupLocation,
        mode: BackupMode,
    ) -> u32 {
        BackupPipeline::new(self).run(sink, app, location, mode)
    }

    pub fn backup_special(
        &self,
        sink: &ErrorSink,
        location: &BackupLocation,
        label: &str,
        files: &[String],
    ) -> u32 {
        BackupPipeline::new(self).run_special(sink, location, label, files)
    }

    pub fn restore(&self, sink: &ErrorSink, app: &AppEntity, location: &BackupLocation) -> u32 {
        RestorePipeline::new(self).run(sink, app, location)
    }

    pub fn restore_special(
        &self,
        sink: &ErrorSink,
        location: &BackupLocation,
        label: &str,
        files: &[String],
    ) -> u32 {
        RestorePipeline::new(self).run_special(sink, location, label, files)
    }

    /// Reinstall `apk` (a file name inside `location`) for `app`
    pub fn restore_apk(
        &self,
        sink: &ErrorSink,
        app: &AppEntity,
        location: &BackupLocation,
        apk: &str,
    ) -> u32 {
        let installer = self.installer();
        if app.is_system {
            installer.restore_system_apk(sink, location, &app.label, apk)
                + installer.copy_native_libraries(
                    sink,
                    self.archiver(),
                    &location.path().join(apk),
                    location.path(),
                    &app.package_name,
                    &self.platform.supported_abis(),
                )
        } else {
            installer.restore_user_apk(sink, location, &app.label, apk)
        }
    }

    pub fn uninstall(&self, sink: &ErrorSink, app: &AppEntity) -> u32 {
        self.lifecycle().uninstall(
            sink,
            &app.package_name,
            &app.apk_path,
            app.data_dir.as_deref().unwrap_or_default(),
            app.is_system,
        )
    }

    /// Owner of `path` as seen by the active strategy
    pub fn resolve_ownership(
        &self,
        sink: &ErrorSink,
        path: &str,
    ) -> Result<Ownership, OwnershipError> {
        self.resolver
            .resolve(self.runner(), sink, path, Privilege::Elevated)
    }

    /// Whether `location` lives in the engine's private storage
    pub fn is_private(&self, location: &BackupLocation) -> bool {
        location.is_under(&self.config.own_data_dir)
    }

    /// Log a pipeline result
    pub fn log_return(&self, code: u32) {
        let message = if code == 0 { "success" } else { "error" };
        info!("return: {} / {}", code, message);
    }

    pub(crate) fn delete_path(&self, sink: &ErrorSink, subject: &str, path: &Path) {
        for f in crate::fs_util::delete_tree(path) {
            sink.report(subject, &format!("could not delete {:?}: {}", f.path, f.error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::{RecordingRunner, ScriptedResponse};

    #[test]
    fn test_build_probes_once() {
        let runner = Arc::new(
            RecordingRunner::new()
                .respond(ScriptedResponse::new(" -h").status(1))
                .respond(
                    ScriptedResponse::new("pm list users")
                        .stdout("UserInfo{0:Owner:13}")
                        .stdout("UserInfo{10:Work:30}"),
                ),
        );
        let sink = ErrorSink::new();
        let engine = Engine::builder(EngineConfig::default(), runner.clone()).build(&sink);

        assert_eq!(engine.ownership_mode(), OwnershipMode::Legacy);
        assert_eq!(engine.users(), &["0".to_string(), "10".to_string()]);
        assert!(engine.multiuser());
        assert_eq!(engine.toolbox(), "toybox");
        let probes = runner.commands().iter().filter(|c| c.ends_with(" -h")).count();
        assert_eq!(probes, 1);
    }

    #[test]
    fn test_toolbox_probe_order() {
        let runner = Arc::new(
            RecordingRunner::new()
                .respond(ScriptedResponse::new("toybox").status(127))
                .respond(ScriptedResponse::new("/system/xbin/busybox").status(127)),
        );
        let sink = ErrorSink::new();
        let config = EngineConfig {
            toolbox: String::new(),
            users: Some(vec!["0".to_string()]),
            ..Default::default()
        };
        let engine = Engine::builder(config, runner).build(&sink);
        assert_eq!(engine.toolbox(), "busybox");
        assert!(!engine.multiuser());
    }

    #[test]
    fn test_private_location() {
        let runner = Arc::new(RecordingRunner::new());
        let sink = ErrorSink::new();
        let engine = Engine::builder(EngineConfig::default(), runner).build(&sink);
        assert!(engine.is_private(&BackupLocation::new("/data/data/org.pkgvault/files/b")));
        assert!(!engine.is_private(&BackupLocation::new("/sdcard/b")));
    }
}
