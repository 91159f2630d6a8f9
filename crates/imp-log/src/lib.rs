//! Structured JSONL event logging.
//!
//! Every privileged decision the IMP makes — accepting or rejecting a
//! user, a shell, a mechanism, a signal forwarded, a child reaped — is
//! worth a durable record. [`LogEntry`] is the canonical record shape;
//! [`Logger`] is the sink trait; [`JsonlLogger`] writes one JSON object
//! per line to a file or stderr.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Canonical structured log record.
///
/// Required: `event`. Everything else is context that a given event may
/// or may not carry — a passwd lookup failure has no `pid`, a signal
/// forward has no `shell`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            level,
            event: event.into(),
            detail: None,
            userid: None,
            pid: None,
            signal: None,
            exit_code: None,
            mechanism: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_userid(mut self, userid: i64) -> Self {
        self.userid = Some(userid);
        self
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_signal(mut self, signal: i32) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_mechanism(mut self, mechanism: impl Into<String>) -> Self {
        self.mechanism = Some(mechanism.into());
        self
    }

    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub trait Logger {
    fn log(&mut self, entry: LogEntry) -> io::Result<()>;

    fn warn(&mut self, event: impl Into<String>) -> io::Result<()> {
        self.log(LogEntry::new(LogLevel::Warn, event))
    }

    fn error(&mut self, event: impl Into<String>) -> io::Result<()> {
        self.log(LogEntry::new(LogLevel::Error, event))
    }

    fn info(&mut self, event: impl Into<String>) -> io::Result<()> {
        self.log(LogEntry::new(LogLevel::Info, event))
    }
}

enum Sink {
    File(File),
    Stderr,
}

/// Writes one JSON object per line to a file, or to stderr.
pub struct JsonlLogger {
    sink: Sink,
}

impl JsonlLogger {
    pub fn to_file(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            sink: Sink::File(file),
        })
    }

    pub fn to_stderr() -> Self {
        Self { sink: Sink::Stderr }
    }
}

impl Logger for JsonlLogger {
    fn log(&mut self, entry: LogEntry) -> io::Result<()> {
        let line = entry
            .to_jsonl()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        match &mut self.sink {
            Sink::File(f) => {
                writeln!(f, "{line}")?;
                f.flush()
            }
            Sink::Stderr => {
                eprintln!("{line}");
                Ok(())
            }
        }
    }
}

/// Parse and validate one JSONL line as a [`LogEntry`]. Used by tests and
/// anything that replays a log file rather than just appending to it.
pub fn validate_log_line(line: &str) -> Result<LogEntry, serde_json::Error> {
    serde_json::from_str(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_serializes_required_fields_only() {
        let entry = LogEntry::new(LogLevel::Info, "exec.start");
        let json = entry.to_jsonl().unwrap();
        assert!(json.contains("\"event\":\"exec.start\""));
        assert!(!json.contains("\"detail\""));
    }

    #[test]
    fn entry_round_trips_through_jsonl() {
        let entry = LogEntry::new(LogLevel::Warn, "cgroup.kill.partial")
            .with_detail("2 of 3 signals delivered")
            .with_pid(4242)
            .with_signal(15);
        let line = entry.to_jsonl().unwrap();
        let parsed = validate_log_line(&line).unwrap();
        assert_eq!(parsed.event, "cgroup.kill.partial");
        assert_eq!(parsed.pid, Some(4242));
        assert_eq!(parsed.signal, Some(15));
    }

    #[test]
    fn file_logger_appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imp.jsonl");
        let mut logger = JsonlLogger::to_file(&path).unwrap();
        logger.info("exec.start").unwrap();
        logger.warn("exec.unprivileged-fallback").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        for line in contents.lines() {
            assert!(validate_log_line(line).is_ok());
        }
    }

    #[test]
    fn malformed_line_fails_validation() {
        assert!(validate_log_line("not json").is_err());
    }
}
