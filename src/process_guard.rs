//! Lifecycle management for spawned shell sessions
//!
//! A privileged shell left running after the engine dies keeps copying or
//! deleting files on its own. Every session is therefore:
//! - spawned in its own process group with a parent-death signal
//! - tracked in a global registry while it runs
//! - signalled (SIGTERM, then SIGKILL after a grace period) when the binary
//!   receives SIGINT/SIGTERM/SIGHUP or the `ProcessGuard` is dropped

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

static SESSION_REGISTRY: OnceLock<Arc<Mutex<SessionRegistry>>> = OnceLock::new();

/// Registry of shell session PIDs that are still running
#[derive(Debug, Default)]
pub struct SessionRegistry {
    pids: HashSet<u32>,
    cleanup_initiated: bool,
}

impl SessionRegistry {
    /// Get or create the global registry
    pub fn global() -> Arc<Mutex<SessionRegistry>> {
        SESSION_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(SessionRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        log::debug!("Registered shell session PID {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        log::debug!("Unregistered shell session PID {}", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Signal every tracked session group: SIGTERM, wait up to `grace_period`, then SIGKILL.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            log::debug!("Session cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            return;
        }
        log::info!("Terminating {} shell session(s)...", self.pids.len());

        let pids: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids {
            signal_session(pid, Signal::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                log::info!("All shell sessions terminated gracefully");
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in pids.iter().filter(|&&pid| is_process_alive(pid)) {
            log::warn!("Shell session {} did not terminate, sending SIGKILL", pid);
            signal_session(pid, Signal::SIGKILL);
        }
        self.pids.clear();
    }
}

/// Signal the whole group first (catches `rsync`, `cp`, ... started by the shell),
/// then the leader alone if the group is gone.
fn signal_session(pid: u32, sig: Signal) {
    if let Err(e) = signal::kill(Pid::from_raw(-(pid as i32)), sig) {
        log::debug!("Group signal {:?} to {} failed: {}", sig, pid, e);
        if let Err(e) = send_signal(pid, sig) {
            log::warn!("Failed to send {:?} to PID {}: {}", sig, pid, e);
        }
    }
}

fn send_signal(pid: u32, sig: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), sig)
}

/// Whether `pid` exists and is not a zombie
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // state is the field after the parenthesised command name
        if let Some(state) = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
        {
            return !matches!(state, "Z" | "X");
        }
    }
    true
}

/// Registers a session PID for as long as it is alive
pub struct SessionTicket {
    pid: u32,
}

impl SessionTicket {
    pub fn new(pid: u32) -> Self {
        if let Ok(mut registry) = SessionRegistry::global().lock() {
            registry.register(pid);
        }
        Self { pid }
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        if let Ok(mut registry) = SessionRegistry::global().lock() {
            registry.unregister(self.pid);
        }
    }
}

/// RAII guard held by the binary; terminates remaining sessions on drop
pub struct ProcessGuard {
    registry: Arc<Mutex<SessionRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: SessionRegistry::global(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        log::debug!("ProcessGuard dropped, initiating session cleanup");
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(Duration::from_secs(5));
        }
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handlers that tear down running sessions.
/// Call once at program start.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            log::info!("Received signal {}, terminating shell sessions", sig);
            if let Ok(mut registry) = SessionRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for `std::process::Command` to isolate the child in its own group
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls (setpgid, prctl) run between fork and exec
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}
