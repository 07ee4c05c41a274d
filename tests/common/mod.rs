// Shared fixtures for the pipeline tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pkgvault::command_runner::CommandRunner;
use pkgvault::config::EngineConfig;
use pkgvault::engine::Engine;
use pkgvault::error_sink::ErrorSink;
use pkgvault::ownership::HelperResolver;
use pkgvault::platform::{Platform, RunningProcess};
use pkgvault::types::AppEntity;

pub const HELPER: &str = "helper";
pub const OWNER_RECORD: &str = r#"{"uid":10100,"gid":10100}"#;

#[derive(Debug, Clone, Default)]
pub struct FakePlatform {
    pub user: u32,
    pub own_pid: u32,
    pub processes: Vec<RunningProcess>,
    pub uid: Option<u32>,
    pub external: Option<PathBuf>,
    pub abis: Vec<String>,
}

impl Platform for FakePlatform {
    fn current_user(&self) -> u32 {
        self.user
    }
    fn own_pid(&self) -> u32 {
        self.own_pid
    }
    fn running_processes(&self) -> Vec<RunningProcess> {
        self.processes.clone()
    }
    fn package_uid(&self, _: &str) -> Option<u32> {
        self.uid
    }
    fn external_storage_base(&self) -> Option<PathBuf> {
        self.external.clone()
    }
    fn supported_abis(&self) -> Vec<String> {
        self.abis.clone()
    }
}

/// Single-user config whose private storage is `own_data_dir`
pub fn config(own_data_dir: &Path) -> EngineConfig {
    EngineConfig {
        own_data_dir: own_data_dir.display().to_string(),
        users: Some(vec!["0".to_string()]),
        package_staging_dir: PathBuf::from("/nonexistent/staging"),
        ..Default::default()
    }
}

pub fn engine(config: EngineConfig, runner: Arc<dyn CommandRunner>, platform: FakePlatform) -> Engine {
    Engine::builder(config, runner)
        .resolver(Box::new(HelperResolver::new(HELPER)))
        .platform(Box::new(platform))
        .build(&ErrorSink::new())
}

pub fn app(data_dir: &str) -> AppEntity {
    AppEntity {
        label: "Foo".to_string(),
        package_name: "org.foo".to_string(),
        apk_path: "/data/app/org.foo-1/base.apk".to_string(),
        data_dir: Some(data_dir.to_string()),
        device_protected_data_dir: None,
        is_system: false,
    }
}

/// Create `dir` holding a couple of files, as a copy step would leave it
pub fn populate(dir: &Path) {
    std::fs::create_dir_all(dir.join("shared_prefs")).unwrap();
    std::fs::create_dir_all(dir.join("files")).unwrap();
    std::fs::write(dir.join("shared_prefs/prefs.xml"), "<map><int name=\"n\" value=\"3\" /></map>").unwrap();
    std::fs::write(dir.join("files/state.bin"), [7u8, 0, 1, 255]).unwrap();
}

/// Index of the first command containing `needle`
pub fn position(commands: &[String], needle: &str) -> usize {
    commands
        .iter()
        .position(|c| c.contains(needle))
        .unwrap_or_else(|| panic!("no command contains {:?} in {:#?}", needle, commands))
}
