//! Host facts the pipelines need but do not own: who we are, what is running,
//! which uid a package was assigned and where shared storage keeps app dirs.

use log::debug;
use std::path::PathBuf;
use std::sync::Arc;

use crate::command_runner::CommandRunner;
use crate::types::CommandBatch;

/// Uids per Android user
pub const PER_USER_RANGE: u32 = 100_000;

/// A process visible on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
}

pub trait Platform: Send + Sync {
    /// Id of the user the engine runs as
    fn current_user(&self) -> u32;

    /// Pid of the engine itself
    fn own_pid(&self) -> u32 {
        std::process::id()
    }

    fn running_processes(&self) -> Vec<RunningProcess>;

    /// Uid assigned to `package`, if it can be looked up
    fn package_uid(&self, package: &str) -> Option<u32>;

    /// Directory on shared storage that holds one sub-directory per package
    fn external_storage_base(&self) -> Option<PathBuf>;

    /// ABIs the device runs, preferred first
    fn supported_abis(&self) -> Vec<String>;
}

/// Process listing run with elevated privileges; `/proc` of other apps is hidden from us
pub const PROCESS_LIST_COMMAND: &str = "ps -A -o PID,NAME";

/// Platform backed by `ps`, the process uid and the package manager
pub struct AndroidPlatform {
    runner: Arc<dyn CommandRunner>,
    external_storage_base: Option<PathBuf>,
}

impl AndroidPlatform {
    pub fn new(runner: Arc<dyn CommandRunner>, external_storage_base: Option<PathBuf>) -> Self {
        Self {
            runner,
            external_storage_base,
        }
    }
}

impl Platform for AndroidPlatform {
    fn current_user(&self) -> u32 {
        nix::unistd::getuid().as_raw() / PER_USER_RANGE
    }

    fn running_processes(&self) -> Vec<RunningProcess> {
        let batch = CommandBatch::elevated().with(PROCESS_LIST_COMMAND);
        match self.runner.execute(&batch) {
            Ok(result) => parse_process_list(result.stdout()),
            Err(e) => {
                debug!("process listing failed: {}", e);
                Vec::new()
            }
        }
    }

    fn package_uid(&self, package: &str) -> Option<u32> {
        let batch = CommandBatch::unprivileged().with(format!("pm list packages -U {}", package));
        match self.runner.execute(&batch) {
            Ok(result) => parse_package_uid(result.stdout(), package),
            Err(e) => {
                debug!("uid lookup for {} failed: {}", package, e);
                None
            }
        }
    }

    fn external_storage_base(&self) -> Option<PathBuf> {
        self.external_storage_base.clone()
    }

    fn supported_abis(&self) -> Vec<String> {
        let batch = CommandBatch::unprivileged().with("getprop ro.product.cpu.abilist");
        match self.runner.execute(&batch) {
            Ok(result) => result.stdout().flat_map(parse_abi_list).collect(),
            Err(e) => {
                debug!("abi lookup failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Split a comma-separated `ro.product.cpu.abilist` value
pub fn parse_abi_list(line: &str) -> Vec<String> {
    line.split(',')
        .map(str::trim)
        .filter(|abi| !abi.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `PID NAME` rows; the header and anything without a numeric pid is skipped
pub fn parse_process_list<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<RunningProcess> {
    lines
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse().ok()?;
            let name = parts.next()?.to_string();
            Some(RunningProcess { pid, name })
        })
        .collect()
}

/// Find `uid:<n>` on the `package:<name> uid:<n>` line for exactly `package`
pub fn parse_package_uid<'a>(lines: impl Iterator<Item = &'a str>, package: &str) -> Option<u32> {
    lines
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?.strip_prefix("package:")?;
            if name != package {
                return None;
            }
            parts.find_map(|p| p.strip_prefix("uid:")).and_then(|uid| uid.parse().ok())
        })
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::{RecordingRunner, ScriptedResponse};

    #[test]
    fn test_parse_process_list() {
        let out = "  PID NAME\n    1 init\n 4120 org.foo\n 4133 org.foo:remote\n\n";
        assert_eq!(
            parse_process_list(out.lines()),
            vec![
                RunningProcess { pid: 1, name: "init".to_string() },
                RunningProcess { pid: 4120, name: "org.foo".to_string() },
                RunningProcess { pid: 4133, name: "org.foo:remote".to_string() },
            ]
        );
    }

    #[test]
    fn test_parse_package_uid_exact_match() {
        let out = "package:org.foo.extra uid:10099\npackage:org.foo uid:10061\n";
        assert_eq!(parse_package_uid(out.lines(), "org.foo"), Some(10061));
        assert_eq!(parse_package_uid(out.lines(), "org.bar"), None);
    }

    #[test]
    fn test_package_uid_through_runner() {
        let runner = Arc::new(
            RecordingRunner::new()
                .respond(ScriptedResponse::new("pm list packages -U").stdout("package:org.foo uid:10061")),
        );
        let platform = AndroidPlatform::new(runner.clone(), None);
        assert_eq!(platform.package_uid("org.foo"), Some(10061));
        assert_eq!(runner.commands(), vec!["pm list packages -U org.foo"]);
    }

    #[test]
    fn test_running_processes_listed_with_elevated_shell() {
        let runner = Arc::new(
            RecordingRunner::new()
                .respond(ScriptedResponse::new("ps -A").stdout("  PID NAME").stdout(" 4120 org.foo")),
        );
        let platform = AndroidPlatform::new(runner.clone(), None);
        assert_eq!(
            platform.running_processes(),
            vec![RunningProcess { pid: 4120, name: "org.foo".to_string() }]
        );
        let batches = runner.batches();
        assert_eq!(batches[0].privilege, crate::types::Privilege::Elevated);
        assert_eq!(batches[0].commands, vec![PROCESS_LIST_COMMAND]);
    }

    #[test]
    fn test_current_user_from_process_uid() {
        let platform = AndroidPlatform::new(Arc::new(RecordingRunner::new()), None);
        assert_eq!(platform.current_user(), nix::unistd::getuid().as_raw() / PER_USER_RANGE);
    }

    #[test]
    fn test_supported_abis() {
        assert_eq!(parse_abi_list("arm64-v8a,armeabi-v7a, armeabi"), vec!["arm64-v8a", "armeabi-v7a", "armeabi"]);
        assert!(parse_abi_list("").is_empty());

        let runner = Arc::new(
            RecordingRunner::new()
                .respond(ScriptedResponse::new("getprop").stdout("x86_64,x86")),
        );
        let platform = AndroidPlatform::new(runner, None);
        assert_eq!(platform.supported_abis(), vec!["x86_64", "x86"]);
    }

    #[test]
    fn test_running_processes_empty_on_fault() {
        let runner = Arc::new(RecordingRunner::new().respond(ScriptedResponse::new("ps").fault()));
        let platform = AndroidPlatform::new(runner, None);
        assert!(platform.running_processes().is_empty());
    }
}
