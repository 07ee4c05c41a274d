//! Owner lookup for filesystem paths.
//!
//! Two incompatible strategies exist and exactly one is chosen per engine by
//! [`probe`]:
//! - `HelperResolver` asks the bundled helper for a JSON `{uid, gid}` record
//! - `StatResolver` scrapes `stat` output for `Uid: (` / `Gid: (` fields
//!
//! The chosen resolver also knows how to apply an ownership, so permission
//! fixes always use the primitives that match the lookup.

use log::{debug, info};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use crate::command_runner::{CommandRunner, run_reporting, run_with_stdout};
use crate::error::OwnershipError;
use crate::error_sink::ErrorSink;
use crate::types::{CommandBatch, Ownership, Privilege};

/// Mode applied recursively after an ownership fix
pub const DEFAULT_DIR_MODE: &str = "771";

/// Error subject used for helper diagnostics
pub const HELPER_SUBJECT: &str = "helper";

/// Which strategy an engine runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipMode {
    Helper,
    Legacy,
}

/// Capability interface over the two strategies
pub trait OwnershipResolver: Send + Sync + std::fmt::Debug {
    fn mode(&self) -> OwnershipMode;

    /// Current owner of `path`, looked up under `privilege`
    fn resolve(
        &self,
        runner: &dyn CommandRunner,
        sink: &ErrorSink,
        path: &str,
        privilege: Privilege,
    ) -> Result<Ownership, OwnershipError>;

    /// Command that recursively applies `ownership` to `path`, leaving modes alone
    fn owner_command(&self, ownership: &Ownership, path: &str) -> String;

    /// Commands that recursively apply `ownership` and `mode` to `path`
    fn permission_commands(&self, ownership: &Ownership, path: &str, mode: &str) -> Vec<String>;
}

/// Lookup through the helper utility
#[derive(Debug, Clone)]
pub struct HelperResolver {
    helper: String,
}

impl HelperResolver {
    pub fn new(helper: impl Into<String>) -> Self {
        Self {
            helper: helper.into(),
        }
    }
}

#[derive(Deserialize)]
struct OwnerRecord {
    uid: u32,
    gid: u32,
}

/// Parse helper output: exactly one line holding `{"uid": <int>, "gid": <int>}`.
pub fn parse_helper_output(lines: &[String]) -> Result<Ownership, OwnershipError> {
    match lines {
        [] => Err(OwnershipError::EmptyOutput),
        [line] => serde_json::from_str::<OwnerRecord>(line)
            .map(|r| Ownership::numeric(r.uid, r.gid))
            .map_err(|e| OwnershipError::MalformedRecord {
                line: line.clone(),
                reason: e.to_string(),
            }),
        _ => Err(OwnershipError::UnexpectedOutput {
            lines: lines.to_vec(),
        }),
    }
}

impl OwnershipResolver for HelperResolver {
    fn mode(&self) -> OwnershipMode {
        OwnershipMode::Helper
    }

    fn resolve(
        &self,
        runner: &dyn CommandRunner,
        sink: &ErrorSink,
        path: &str,
        privilege: Privilege,
    ) -> Result<Ownership, OwnershipError> {
        let batch = CommandBatch::new(privilege).with(format!("{} owner {}", self.helper, path));
        let mut lines = Vec::new();
        run_with_stdout(runner, &batch, sink, HELPER_SUBJECT, &mut |l| {
            lines.push(l.to_string())
        });
        parse_helper_output(&lines)
    }

    fn owner_command(&self, ownership: &Ownership, path: &str) -> String {
        format!("{} change-owner -r {} {}", self.helper, ownership, path)
    }

    fn permission_commands(&self, ownership: &Ownership, path: &str, mode: &str) -> Vec<String> {
        vec![
            self.owner_command(ownership, path),
            format!("{} set-permissions -r {} {}", self.helper, mode, path),
        ]
    }
}

/// Lookup by parsing `stat` output
#[derive(Debug, Clone)]
pub struct StatResolver {
    toolbox: String,
}

impl StatResolver {
    pub fn new(toolbox: impl Into<String>) -> Self {
        Self {
            toolbox: toolbox.into(),
        }
    }
}

fn id_patterns() -> &'static (Regex, Regex) {
    static PATTERNS: OnceLock<(Regex, Regex)> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        (
            Regex::new(r"Uid:\s*\(\s*(\d+)").expect("static uid pattern"),
            Regex::new(r"Gid:\s*\(\s*(\d+)").expect("static gid pattern"),
        )
    })
}

/// Parse `stat` output for the first `Uid: ( <digits>` and `Gid: ( <digits>`.
pub fn parse_stat_output(output: &str) -> Result<Ownership, OwnershipError> {
    let (uid_re, gid_re) = id_patterns();
    let capture = |re: &Regex| {
        re.captures(output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };
    match (capture(uid_re), capture(gid_re)) {
        (Some(uid), Some(gid)) => Ownership::textual(uid, gid),
        _ => Err(OwnershipError::MissingIds {
            output: output.to_string(),
        }),
    }
}

impl OwnershipResolver for StatResolver {
    fn mode(&self) -> OwnershipMode {
        OwnershipMode::Legacy
    }

    fn resolve(
        &self,
        runner: &dyn CommandRunner,
        sink: &ErrorSink,
        path: &str,
        privilege: Privilege,
    ) -> Result<Ownership, OwnershipError> {
        // Freshly created paths can report 0:0 for a moment before the OS settles them.
        let batch = CommandBatch::new(privilege)
            .with("sleep 1")
            .with(format!("{} stat {}", self.toolbox, path));
        let mut output = String::new();
        let status = run_with_stdout(runner, &batch, sink, "", &mut |l| {
            output.push_str(l);
            output.push('\n');
        });
        debug!("stat lookup for {} returned {}", path, status);
        parse_stat_output(&output)
    }

    fn owner_command(&self, ownership: &Ownership, path: &str) -> String {
        format!("{} chown -R {} {}", self.toolbox, ownership, path)
    }

    fn permission_commands(&self, ownership: &Ownership, path: &str, mode: &str) -> Vec<String> {
        vec![
            self.owner_command(ownership, path),
            format!("{} chmod -R {} {}", self.toolbox, mode, path),
        ]
    }
}

/// One-time capability probe: `<helper> -h` exiting 0 selects the helper,
/// anything else selects `stat` parsing.
pub fn probe(
    runner: &dyn CommandRunner,
    sink: &ErrorSink,
    helper: &str,
    toolbox: &str,
) -> Box<dyn OwnershipResolver> {
    let check = CommandBatch::elevated().with(format!("{} -h", helper));
    let status = run_reporting(runner, &check, sink, HELPER_SUBJECT);
    info!("Ownership helper probe returned {}", status == 0);
    if status == 0 {
        return Box::new(HelperResolver::new(helper));
    }

    // Record what the helper looks like so a broken install can be diagnosed.
    let diag = CommandBatch::elevated()
        .with(format!("ls -l {}", helper))
        .with(format!("file {}", helper));
    run_with_stdout(runner, &diag, sink, HELPER_SUBJECT, &mut |line| {
        sink.report(HELPER_SUBJECT, line)
    });
    Box::new(StatResolver::new(toolbox))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::{RecordingRunner, ScriptedResponse};

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_helper_single_record() {
        assert_eq!(
            parse_helper_output(&lines(&[r#"{"uid":1000,"gid":1000}"#])),
            Ok(Ownership::numeric(1000, 1000))
        );
    }

    #[test]
    fn test_helper_rejects_bad_output() {
        assert_eq!(parse_helper_output(&[]), Err(OwnershipError::EmptyOutput));
        assert!(matches!(
            parse_helper_output(&lines(&[r#"{"uid":1,"gid":1}"#, "extra"])),
            Err(OwnershipError::UnexpectedOutput { .. })
        ));
        assert!(matches!(
            parse_helper_output(&lines(&["uid=1000"])),
            Err(OwnershipError::MalformedRecord { .. })
        ));
        assert!(matches!(
            parse_helper_output(&lines(&[r#"{"uid":1000}"#])),
            Err(OwnershipError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_stat_parsing() {
        let out = "  File: /data/data/org.foo\nAccess: (0751/drwxr-x--x)  Uid: ( 1000/app)   Gid: ( 1000/app)\n";
        assert_eq!(
            parse_stat_output(out),
            Ok(Ownership::textual("1000", "1000").unwrap())
        );
        assert!(matches!(
            parse_stat_output("Uid: ( 1000/app)"),
            Err(OwnershipError::MissingIds { .. })
        ));
        assert!(matches!(
            parse_stat_output(""),
            Err(OwnershipError::MissingIds { .. })
        ));
    }

    #[test]
    fn test_probe_selects_helper() {
        let runner = RecordingRunner::new();
        let sink = ErrorSink::new();
        let resolver = probe(&runner, &sink, "/data/helper", "toybox");
        assert_eq!(resolver.mode(), OwnershipMode::Helper);
        assert_eq!(runner.commands(), vec!["/data/helper -h"]);
    }

    #[test]
    fn test_probe_falls_back_to_legacy_with_diagnostics() {
        let runner = RecordingRunner::new()
            .respond(ScriptedResponse::new("-h").stderr("not found").status(127))
            .respond(ScriptedResponse::new("ls -l").stderr("No such file or directory").status(1));
        let sink = ErrorSink::new();
        let resolver = probe(&runner, &sink, "/data/helper", "toybox");
        assert_eq!(resolver.mode(), OwnershipMode::Legacy);
        assert_eq!(runner.batches().len(), 2);
        assert!(sink.entries().iter().all(|e| e.starts_with("helper: ")));
    }

    #[test]
    fn test_helper_resolve_through_runner() {
        let runner = RecordingRunner::new()
            .respond(ScriptedResponse::new("owner").stdout(r#"{"uid":10061,"gid":10061}"#));
        let sink = ErrorSink::new();
        let resolver = HelperResolver::new("/h");
        let own = resolver
            .resolve(&runner, &sink, "/data/data/org.foo", Privilege::Elevated)
            .unwrap();
        assert_eq!(own.to_string(), "10061:10061");
        assert_eq!(runner.commands(), vec!["/h owner /data/data/org.foo"]);
    }

    #[test]
    fn test_legacy_resolve_sleeps_first() {
        let runner = RecordingRunner::new()
            .respond(ScriptedResponse::new("stat").stdout("Uid: ( 10061/u0_a61)").stdout("Gid: ( 10061/u0_a61)"));
        let sink = ErrorSink::new();
        let own = StatResolver::new("toybox")
            .resolve(&runner, &sink, "/x", Privilege::Elevated)
            .unwrap();
        assert_eq!(own, Ownership::textual("10061", "10061").unwrap());
        assert_eq!(runner.commands(), vec!["sleep 1", "toybox stat /x"]);
    }

    #[test]
    fn test_permission_commands_match_mode() {
        let own = Ownership::numeric(1, 2);
        assert_eq!(
            HelperResolver::new("/h").permission_commands(&own, "/p", "771"),
            vec!["/h change-owner -r 1:2 /p", "/h set-permissions -r 771 /p"]
        );
        assert_eq!(
            StatResolver::new("busybox").permission_commands(&own, "/p", "771"),
            vec!["busybox chown -R 1:2 /p", "busybox chmod -R 771 /p"]
        );
        assert_eq!(
            StatResolver::new("busybox").owner_command(&own, "/p"),
            "busybox chown -R 1:2 /p"
        );
    }
}
