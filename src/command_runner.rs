//! Execution of command batches in a single shell session.
//!
//! `CommandRunner` is the seam every pipeline goes through. `ShellRunner` is the
//! real implementation: one `su`/`sh` process per batch, commands fed on stdin,
//! stdout/stderr read on two threads and funnelled through a channel so the
//! callbacks run on the calling thread, in arrival order, before `run` returns.
//!
//! `RecordingRunner` executes nothing. It records batches and answers with
//! scripted output; the binary uses it for `--dry-run`.

use log::{debug, info, warn};
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use crate::error::{PkgVaultError, Result};
use crate::error_sink::ErrorSink;
use crate::process_guard::{CommandProcessGroup, SessionTicket};
use crate::types::{CommandBatch, ExecutionResult, OutputLine, Privilege};

/// Shell variable that accumulates command failures inside a session
const RC_VAR: &str = "__pkgvault_rc";

/// Runs an ordered batch of shell commands under one privilege context.
pub trait CommandRunner: Send + Sync {
    /// Execute `batch` in one session.
    ///
    /// Every command runs even when an earlier one fails. Returns the session's
    /// exit status (0 only if every command succeeded). `Err` means the session
    /// itself could not be launched or talked to.
    fn run(
        &self,
        batch: &CommandBatch,
        on_stdout: &mut dyn FnMut(&str),
        on_stderr: &mut dyn FnMut(&str),
    ) -> Result<i32>;

    /// Execute `batch` and collect every line
    fn execute(&self, batch: &CommandBatch) -> Result<ExecutionResult> {
        let lines = Mutex::new(Vec::new());
        let status = self.run(
            batch,
            &mut |l| push_line(&lines, OutputLine::Stdout(l.to_string())),
            &mut |l| push_line(&lines, OutputLine::Stderr(l.to_string())),
        )?;
        Ok(ExecutionResult {
            status,
            lines: lines.into_inner().unwrap_or_else(|p| p.into_inner()),
        })
    }
}

fn push_line(lines: &Mutex<Vec<OutputLine>>, line: OutputLine) {
    lines.lock().unwrap_or_else(|p| p.into_inner()).push(line);
}

/// Run `batch`, sending stderr lines to `sink` under `subject`.
///
/// An execution fault is logged, recorded under the empty subject and reported
/// as status 1 so the caller counts it like any other failed step.
pub fn run_reporting(
    runner: &dyn CommandRunner,
    batch: &CommandBatch,
    sink: &ErrorSink,
    subject: &str,
) -> i32 {
    run_with_stdout(runner, batch, sink, subject, &mut |_| {})
}

/// Like [`run_reporting`] but hands stdout lines to `on_stdout`
pub fn run_with_stdout(
    runner: &dyn CommandRunner,
    batch: &CommandBatch,
    sink: &ErrorSink,
    subject: &str,
    on_stdout: &mut dyn FnMut(&str),
) -> i32 {
    match runner.run(batch, on_stdout, &mut |line| sink.report(subject, line)) {
        Ok(status) => status,
        Err(e) => {
            warn!(
                "Exception caught running: {}: {}",
                batch.commands.join(", "),
                e
            );
            sink.report("", &e.to_string());
            1
        }
    }
}

/// Real shell sessions
#[derive(Debug, Clone)]
pub struct ShellRunner {
    elevated_shell: String,
    unprivileged_shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            elevated_shell: Privilege::Elevated.shell().to_string(),
            unprivileged_shell: Privilege::Unprivileged.shell().to_string(),
        }
    }
}

impl ShellRunner {
    pub fn new(elevated_shell: impl Into<String>, unprivileged_shell: impl Into<String>) -> Self {
        Self {
            elevated_shell: elevated_shell.into(),
            unprivileged_shell: unprivileged_shell.into(),
        }
    }

    fn shell_for(&self, privilege: Privilege) -> &str {
        match privilege {
            Privilege::Elevated => &self.elevated_shell,
            Privilege::Unprivileged => &self.unprivileged_shell,
        }
    }
}

/// Wrap each command so a failure is remembered but does not stop the session.
pub fn session_script(commands: &[String]) -> String {
    let mut script = format!("{}=0\n", RC_VAR);
    for command in commands {
        script.push_str(&format!("{{ {}\n}} || {}=1\n", command, RC_VAR));
    }
    script.push_str(&format!("exit ${}\n", RC_VAR));
    script
}

impl CommandRunner for ShellRunner {
    fn run(
        &self,
        batch: &CommandBatch,
        on_stdout: &mut dyn FnMut(&str),
        on_stderr: &mut dyn FnMut(&str),
    ) -> Result<i32> {
        let shell = self.shell_for(batch.privilege);
        debug!("[{}] running {} command(s): {:?}", shell, batch.len(), batch.commands);

        let mut child = Command::new(shell)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()
            .map_err(|e| PkgVaultError::execution(format!("failed to launch {}: {}", shell, e)))?;
        let _ticket = SessionTicket::new(child.id());

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(i), Some(o), Some(e)) => (i, o, e),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PkgVaultError::execution(format!("{} session has no pipes", shell)));
            }
        };

        let script = session_script(&batch.commands);
        let writer = std::thread::spawn(move || {
            let mut stdin = stdin;
            stdin.write_all(script.as_bytes())
            // stdin dropped here, the shell sees EOF
        });

        let (tx, rx) = mpsc::channel();
        let out_reader = spawn_reader(stdout, tx.clone(), OutputLine::Stdout);
        let err_reader = spawn_reader(stderr, tx, OutputLine::Stderr);

        for line in rx {
            match line {
                OutputLine::Stdout(l) => on_stdout(&l),
                OutputLine::Stderr(l) => on_stderr(&l),
            }
        }

        let mut faults = Vec::new();
        for (name, handle) in [("stdout", out_reader), ("stderr", err_reader)] {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => faults.push(format!("reading {}: {}", name, e)),
                Err(_) => faults.push(format!("{} reader panicked", name)),
            }
        }
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => faults.push(format!("writing commands: {}", e)),
            Err(_) => faults.push("stdin writer panicked".to_string()),
        }

        let status = child.wait()?;
        if !faults.is_empty() {
            return Err(PkgVaultError::execution(faults.join("; ")));
        }
        match status.code() {
            Some(code) => {
                debug!("[{}] session exited with {}", shell, code);
                Ok(code)
            }
            None => Err(PkgVaultError::execution(format!(
                "{} session terminated by signal",
                shell
            ))),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    tx: Sender<OutputLine>,
    wrap: fn(String) -> OutputLine,
) -> JoinHandle<std::io::Result<()>> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                return Ok(());
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            if tx.send(wrap(line)).is_err() {
                return Ok(());
            }
        }
    })
}

/// Scripted answer for commands containing `pattern`
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pattern: String,
    stdout: Vec<String>,
    stderr: Vec<String>,
    status: i32,
    fault: bool,
}

impl ScriptedResponse {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            status: 0,
            fault: false,
        }
    }

    pub fn stdout(mut self, line: impl Into<String>) -> Self {
        self.stdout.push(line.into());
        self
    }

    pub fn stderr(mut self, line: impl Into<String>) -> Self {
        self.stderr.push(line.into());
        self
    }

    pub fn status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    /// Make the whole session fail to launch
    pub fn fault(mut self) -> Self {
        self.fault = true;
        self
    }
}

/// Records batches instead of running them
#[derive(Debug, Default)]
pub struct RecordingRunner {
    batches: Mutex<Vec<CommandBatch>>,
    responses: Vec<ScriptedResponse>,
    echo: bool,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Print each batch at info level as it is recorded
    pub fn echoing() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    /// Add a scripted answer. The first response whose pattern occurs in a command wins.
    pub fn respond(mut self, response: ScriptedResponse) -> Self {
        self.responses.push(response);
        self
    }

    /// Every batch run so far
    pub fn batches(&self) -> Vec<CommandBatch> {
        self.batches.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Every command run so far, flattened in submission order
    pub fn commands(&self) -> Vec<String> {
        self.batches()
            .into_iter()
            .flat_map(|b| b.commands)
            .collect()
    }

    fn response_for(&self, command: &str) -> Option<&ScriptedResponse> {
        self.responses.iter().find(|r| command.contains(&r.pattern))
    }
}

impl CommandRunner for RecordingRunner {
    fn run(
        &self,
        batch: &CommandBatch,
        on_stdout: &mut dyn FnMut(&str),
        on_stderr: &mut dyn FnMut(&str),
    ) -> Result<i32> {
        self.batches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(batch.clone());
        if self.echo {
            for command in &batch.commands {
                info!("[dry-run {}] {}", batch.privilege, command);
            }
        }

        let mut status = 0;
        for command in &batch.commands {
            let Some(response) = self.response_for(command) else {
                continue;
            };
            if response.fault {
                return Err(PkgVaultError::execution(format!(
                    "scripted fault for {:?}",
                    command
                )));
            }
            response.stdout.iter().for_each(|l| on_stdout(l));
            response.stderr.iter().for_each(|l| on_stderr(l));
            if response.status != 0 {
                status = response.status;
            }
        }
        Ok(status)
    }
}
