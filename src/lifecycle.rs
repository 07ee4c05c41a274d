//! Package lifecycle: uninstall, kill, per-user enable/disable and the
//! package-manager queries the pipelines depend on.

use log::{debug, info};
use regex::Regex;
use std::sync::OnceLock;

use crate::command_runner::{CommandRunner, run_reporting, run_with_stdout};
use crate::error_sink::ErrorSink;
use crate::platform::Platform;
use crate::types::{CommandBatch, last_component};

/// Diagnostic that makes a failed removal harmless
const NOT_FOUND: &str = "No such file or directory";

/// Path of a user's package restriction record
pub fn restrictions_file(user: &str) -> String {
    format!("/data/system/users/{}/package-restrictions.xml", user)
}

pub struct PackageLifecycle<'a> {
    runner: &'a dyn CommandRunner,
    platform: &'a dyn Platform,
    toolbox: &'a str,
}

impl<'a> PackageLifecycle<'a> {
    pub fn new(runner: &'a dyn CommandRunner, platform: &'a dyn Platform, toolbox: &'a str) -> Self {
        Self {
            runner,
            platform,
            toolbox,
        }
    }

    /// Commands that remove a package. System packages are deleted from the
    /// system partition by hand, everything else goes through `pm`.
    pub fn uninstall_commands(
        &self,
        package: &str,
        apk_path: &str,
        data_dir: &str,
        is_system: bool,
    ) -> CommandBatch {
        let tb = self.toolbox;
        let mut batch = CommandBatch::elevated();
        if !is_system {
            batch
                .push(format!("pm uninstall {}", package))
                .push(format!("{} rm -r /data/lib/{}/*", tb, package));
        } else {
            let apk_dir = last_component(apk_path)
                .map(|name| name.rsplit_once('.').map_or(name, |(stem, _)| stem))
                .unwrap_or(package);
            batch
                .push("mount -o remount,rw /system")
                .push(format!("{} rm {}", tb, apk_path))
                .push(format!("rm -r /system/app/{}", apk_dir))
                .push("mount -o remount,ro /system")
                .push(format!("{} rm -r {}", tb, data_dir))
                .push(format!("{} rm -r /data/app-lib/{}*", tb, package));
        }
        batch
    }

    /// Remove a package. Returns 0 on success or when the only complaint was
    /// that something to delete was already gone.
    pub fn uninstall(
        &self,
        sink: &ErrorSink,
        package: &str,
        apk_path: &str,
        data_dir: &str,
        is_system: bool,
    ) -> u32 {
        let batch = self.uninstall_commands(package, apk_path, data_dir, is_system);
        let mut diagnostics = Vec::new();
        let status = match self.runner.run(&batch, &mut |_| {}, &mut |l| {
            diagnostics.push(l.to_string())
        }) {
            Ok(status) => status,
            Err(e) => {
                sink.report("", &e.to_string());
                1
            }
        };

        let mut failed = status != 0;
        if failed {
            if let [only] = diagnostics.as_slice() {
                if only.contains(NOT_FOUND) {
                    failed = false;
                }
            }
            if failed {
                sink.report_all(package, diagnostics.iter().map(String::as_str));
            }
        }
        info!("uninstall {} failed: {}", package, failed);
        u32::from(failed)
    }

    /// Terminate every process named `package`, never the engine itself.
    pub fn kill(&self, sink: &ErrorSink, package: &str) {
        let own = self.platform.own_pid();
        for process in self.platform.running_processes() {
            if process.name == package && process.pid != own {
                debug!("killing {} ({})", package, process.pid);
                let batch = CommandBatch::elevated().with(format!("kill {}", process.pid));
                run_reporting(self.runner, &batch, sink, package);
            }
        }
    }

    /// `pm enable|disable --user <u> <package>` for each user
    pub fn set_enabled(&self, sink: &ErrorSink, package: &str, users: &[String], enable: bool) {
        let option = if enable { "enable" } else { "disable" };
        for user in users {
            let batch =
                CommandBatch::elevated().with(format!("pm {} --user {} {}", option, user, package));
            run_reporting(self.runner, &batch, sink, package);
        }
    }

    /// Disable `package` for every other user whose restriction record lists it as enabled.
    ///
    /// Disabling through `pm` means the package can only be re-enabled through `pm`.
    pub fn disable_for_other_users(&self, sink: &ErrorSink, package: &str, users: &[String]) {
        let current = self.platform.current_user().to_string();
        for user in users.iter().filter(|u| **u != current) {
            if self.enabled_for(sink, package, user) {
                info!("disabling {} for user {}", package, user);
                self.set_enabled(sink, package, std::slice::from_ref(user), false);
            }
        }
    }

    /// Whether `user`'s restriction record mentions `package` with `enabled="1"`
    fn enabled_for(&self, sink: &ErrorSink, package: &str, user: &str) -> bool {
        let batch = CommandBatch::elevated().with(format!(
            "{} grep {} {}",
            self.toolbox,
            package,
            restrictions_file(user)
        ));
        let mut enabled = false;
        run_with_stdout(self.runner, &batch, sink, package, &mut |line| {
            if line.contains("enabled=\"1\"") {
                enabled = true;
            }
        });
        enabled
    }

    /// Ids of all users on the device, `None` if the query failed
    pub fn list_users(&self, sink: &ErrorSink) -> Option<Vec<String>> {
        let batch = CommandBatch::elevated().with("pm list users");
        let mut users = Vec::new();
        let status = run_with_stdout(self.runner, &batch, sink, "", &mut |line| {
            if let Some(id) = parse_user_id(line) {
                users.push(id);
            }
        });
        (status == 0).then_some(users)
    }

    /// Packages currently disabled, `None` if the query failed or found none
    pub fn disabled_packages(&self) -> Option<Vec<String>> {
        let batch = CommandBatch::unprivileged().with("pm list packages -d");
        let result = self.runner.execute(&batch).ok()?;
        let packages: Vec<String> = result
            .stdout()
            .filter_map(|line| line.split_once(':').map(|(_, p)| p.trim().to_string()))
            .collect();
        (result.success() && !packages.is_empty()).then_some(packages)
    }

    /// Restart the framework without a full reboot
    pub fn soft_reboot(&self, sink: &ErrorSink) -> u32 {
        let batch = CommandBatch::elevated().with(format!("{} pkill system_server", self.toolbox));
        u32::from(run_reporting(self.runner, &batch, sink, "") != 0)
    }
}

/// `UserInfo{10:Work profile:30} running` -> `10`
pub fn parse_user_id(line: &str) -> Option<String> {
    static USER_ID: OnceLock<Regex> = OnceLock::new();
    let re = USER_ID.get_or_init(|| Regex::new(r"\{(\d+):").expect("static user id pattern"));
    re.captures(line).map(|c| c[1].to_string())
}
