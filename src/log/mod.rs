//! Structured execution log: JSON lines per session event.
//!
//! Each line is a self-contained JSON object with an RFC 3339 timestamp, so
//! logs can be grepped, tailed and post-processed without a parser for the
//! whole file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use crate::events::{BackgroundReason, SessionEvent};
use crate::monitor::ExecutionResult;

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A structured event in the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    /// The event type and its data.
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the execution log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    /// The safety gate refused a command.
    CommandBlocked { command: String, reason: String },
    /// The user declined a risky command.
    CommandCancelled { command: String },
    /// A process was spawned in a PTY.
    ProcessSpawned {
        pid: u32,
        command: String,
        cwd: String,
    },
    /// Output chunk from a process.
    Output { pid: u32, text: String },
    /// The prompt heuristic fired.
    PromptDetected { pid: u32, tail: String },
    /// A process was moved to the job table.
    Backgrounded { pid: u32, reason: BackgroundReason },
    /// Input was written to a job.
    InputSent { pid: u32, length: usize },
    /// A job was killed.
    Killed { pid: u32 },
    /// A process exited.
    Finished { pid: u32, exit_code: i32 },
    /// A CLI invocation started.
    SessionStarted { command: String },
    /// A CLI invocation returned a result.
    SessionEnded { result: String },
}

/// Writer for JSON lines execution logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
    log_output: bool,
}

impl ExecutionLog {
    /// Create a new execution log, writing to the given path.
    ///
    /// Creates the file (and parent directories) if they don't exist.
    /// Appends to an existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
            log_output: true,
        })
    }

    /// Skip `Output` events; everything else is still recorded.
    pub fn without_output(mut self) -> Self {
        self.log_output = false;
        self
    }

    /// Log an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        if !self.log_output && matches!(event, LogEvent::Output { .. }) {
            return Ok(());
        }

        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    /// Get the path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<&SessionEvent> for LogEvent {
    fn from(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::Blocked { command, reason } => LogEvent::CommandBlocked {
                command: command.clone(),
                reason: reason.clone(),
            },
            SessionEvent::Cancelled { command } => LogEvent::CommandCancelled {
                command: command.clone(),
            },
            SessionEvent::Spawned { pid, command, cwd } => LogEvent::ProcessSpawned {
                pid: *pid,
                command: command.clone(),
                cwd: cwd.clone(),
            },
            SessionEvent::Output { pid, text } => LogEvent::Output {
                pid: *pid,
                text: text.clone(),
            },
            SessionEvent::PromptDetected { pid, tail } => LogEvent::PromptDetected {
                pid: *pid,
                tail: tail.clone(),
            },
            SessionEvent::Backgrounded { pid, reason } => LogEvent::Backgrounded {
                pid: *pid,
                reason: *reason,
            },
            SessionEvent::InputSent { pid, length } => LogEvent::InputSent {
                pid: *pid,
                length: *length,
            },
            SessionEvent::Killed { pid } => LogEvent::Killed { pid: *pid },
            SessionEvent::Finished { pid, exit_code } => LogEvent::Finished {
                pid: *pid,
                exit_code: *exit_code,
            },
        }
    }
}

impl From<&ExecutionResult> for LogEvent {
    fn from(result: &ExecutionResult) -> Self {
        LogEvent::SessionEnded {
            result: result.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_to_json() {
        let entry = LogEntry {
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
            event: LogEvent::ProcessSpawned {
                pid: 42,
                command: "make".to_string(),
                cwd: "/src".to_string(),
            },
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"process_spawned\""));
        assert!(json.contains("\"pid\":42"));
        assert!(json.contains("\"timestamp\":\"2026-01-01T00:00:00.000Z\""));
    }

    #[test]
    fn write_and_read_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("test.jsonl");

        let log = ExecutionLog::new(&log_path).unwrap();

        log.log(LogEvent::SessionStarted {
            command: "printf hi".to_string(),
        })
        .unwrap();
        log.log(LogEvent::Finished {
            pid: 7,
            exit_code: 0,
        })
        .unwrap();
        log.log(LogEvent::SessionEnded {
            result: "finished with exit code 0".to_string(),
        })
        .unwrap();

        let content = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        for line in &lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("event").is_some());
            let ts = parsed["timestamp"].as_str().unwrap();
            assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok(), "bad timestamp {ts}");
        }

        assert!(lines[0].contains("\"event\":\"session_started\""));
        assert!(lines[1].contains("\"event\":\"finished\""));
        assert!(lines[2].contains("\"event\":\"session_ended\""));
    }

    #[test]
    fn creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("deep").join("nested").join("run.jsonl");

        let log = ExecutionLog::new(&log_path).unwrap();
        log.log(LogEvent::Killed { pid: 1 }).unwrap();

        assert!(log_path.exists());
        assert_eq!(log.path(), log_path);
    }

    #[test]
    fn appends_to_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("append.jsonl");

        {
            let log = ExecutionLog::new(&log_path).unwrap();
            log.log(LogEvent::Killed { pid: 1 }).unwrap();
        }
        {
            let log = ExecutionLog::new(&log_path).unwrap();
            log.log(LogEvent::Killed { pid: 2 }).unwrap();
        }

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn output_can_be_left_out() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("quiet.jsonl");
        let log = ExecutionLog::new(&log_path).unwrap().without_output();

        log.log(LogEvent::Output {
            pid: 1,
            text: "noise".to_string(),
        })
        .unwrap();
        log.log(LogEvent::Killed { pid: 1 }).unwrap();

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(!content.contains("noise"));
    }

    #[test]
    fn session_event_conversion() {
        let events = vec![
            SessionEvent::Blocked {
                command: "rm -rf /".to_string(),
                reason: "policy".to_string(),
            },
            SessionEvent::Cancelled {
                command: "rm x".to_string(),
            },
            SessionEvent::Spawned {
                pid: 3,
                command: "ls".to_string(),
                cwd: "/".to_string(),
            },
            SessionEvent::Output {
                pid: 3,
                text: "a".to_string(),
            },
            SessionEvent::PromptDetected {
                pid: 3,
                tail: "Continue?".to_string(),
            },
            SessionEvent::Backgrounded {
                pid: 3,
                reason: BackgroundReason::Timeout,
            },
            SessionEvent::InputSent { pid: 3, length: 2 },
            SessionEvent::Killed { pid: 3 },
            SessionEvent::Finished {
                pid: 3,
                exit_code: 1,
            },
        ];

        for event in &events {
            let log_event: LogEvent = event.into();
            let json = serde_json::to_string(&LogEntry {
                timestamp: "0".to_string(),
                event: log_event,
            })
            .unwrap();
            assert!(json.contains("\"event\":"), "missing event tag in: {json}");
        }

        let json = serde_json::to_string(&LogEvent::from(&events[5])).unwrap();
        assert!(json.contains("\"reason\":\"timeout\""));
    }

    #[test]
    fn result_conversion_uses_display() {
        let result = ExecutionResult::BackgroundTimeout {
            pid: 9,
            output: String::new(),
        };
        match LogEvent::from(&result) {
            LogEvent::SessionEnded { result } => assert!(result.contains("pid 9")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
