//! Accumulating diagnostic buffer plus persistent error log.
//!
//! One `ErrorSink` is created by the caller and passed by reference into every
//! pipeline call. It is `Sync`: concurrent pipeline runs may report into the same
//! sink, each entry is appended whole under a lock so lines never interleave.

use chrono::Local;
use log::{error, warn};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Timestamp layout of the persistent log
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y/%m/%d - %H:%M:%S";

/// Process-lifetime collection of reported diagnostics
#[derive(Debug, Default)]
pub struct ErrorSink {
    entries: Mutex<Vec<String>>,
    log_file: Option<PathBuf>,
    // Serializes appends to the log file
    file_lock: Mutex<()>,
}

impl ErrorSink {
    /// Sink that only buffers in memory
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that also appends every entry to `log_file`
    pub fn with_log_file(log_file: impl Into<PathBuf>) -> Self {
        Self {
            log_file: Some(log_file.into()),
            ..Self::default()
        }
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// Record one diagnostic line about `subject` (a package name, label or tool).
    pub fn report(&self, subject: &str, message: &str) {
        error!("[{}] {}", subject, message);
        lock(&self.entries).push(format!("{}: {}", subject, message));

        if let Some(path) = &self.log_file {
            let timestamp = Local::now().format(LOG_TIMESTAMP_FORMAT).to_string();
            let line = format_log_line(&timestamp, message, subject);
            let _guard = lock(&self.file_lock);
            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut f| f.write_all(line.as_bytes()));
            if let Err(e) = written {
                warn!("Failed to append to error log {:?}: {}", path, e);
            }
        }
    }

    /// Record every line of an iterator under the same subject
    pub fn report_all<'a>(&self, subject: &str, lines: impl IntoIterator<Item = &'a str>) {
        for line in lines {
            self.report(subject, line);
        }
    }

    /// Snapshot of every entry, oldest first
    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// All entries joined as `subject: message\n` lines
    pub fn errors(&self) -> String {
        lock(&self.entries)
            .iter()
            .map(|e| format!("{}\n", e))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Drop buffered entries. The persistent log is untouched.
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

/// `<timestamp>: <message> [<subject>]\n`
pub fn format_log_line(timestamp: &str, message: &str, subject: &str) -> String {
    format!("{}: {} [{}]\n", timestamp, message, subject)
}

// A panic while holding the lock leaves the Vec intact, keep using it.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_report_and_clear() {
        let sink = ErrorSink::new();
        sink.report("org.foo", "rsync: permission denied");
        sink.report("helper", "not found");
        assert_eq!(sink.len(), 2);
        assert_eq!(
            sink.errors(),
            "org.foo: rsync: permission denied\nhelper: not found\n"
        );
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_log_line_format() {
        assert_eq!(
            format_log_line("2024/01/02 - 03:04:05", "boom", "org.foo"),
            "2024/01/02 - 03:04:05: boom [org.foo]\n"
        );
    }

    #[test]
    fn test_persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.log");
        let sink = ErrorSink::with_log_file(&path);
        sink.report("org.foo", "first");
        sink.report("org.bar", "second");
        sink.clear();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(": first [org.foo]"));
        assert!(lines[1].ends_with(": second [org.bar]"));
    }

    #[test]
    fn test_concurrent_reports_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.log");
        let sink = Arc::new(ErrorSink::with_log_file(&path));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        sink.report(&format!("pkg{}", t), &format!("line {}", i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(sink.len(), 400);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 400);
        assert!(contents.lines().all(|l| l.contains(": line ") && l.ends_with(']')));
    }
}
