//! Session events published while commands run.
//!
//! The session manager sends these over an optional `mpsc` channel so a
//! caller can stream output live and keep an audit trail. Delivery is best
//! effort: a dropped receiver never affects the session.

use std::sync::mpsc::Sender;

use serde::Serialize;

/// Why a foreground call handed its process to the job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundReason {
    /// No output for longer than the silence threshold.
    Silence,
    /// The caller's timeout elapsed.
    Timeout,
    /// A prompt was detected and the terminal takeover ended with the
    /// process still running.
    Paused,
    /// A prompt was detected after programmatic input.
    AwaitingInput,
}

/// Structured events emitted by the session engine.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The safety gate refused the command.
    Blocked { command: String, reason: String },
    /// The user declined a command that needed confirmation.
    Cancelled { command: String },
    /// A process was started.
    Spawned {
        pid: u32,
        command: String,
        cwd: String,
    },
    /// A chunk of decoded output.
    Output { pid: u32, text: String },
    /// The prompt heuristic fired.
    PromptDetected { pid: u32, tail: String },
    /// The process was registered as a background job.
    Backgrounded { pid: u32, reason: BackgroundReason },
    /// Input was written to a job.
    InputSent { pid: u32, length: usize },
    /// A job was killed.
    Killed { pid: u32 },
    /// The process exited and its output was drained.
    Finished { pid: u32, exit_code: i32 },
}

/// Send an event if anyone is listening.
pub(crate) fn emit(tx: Option<&Sender<SessionEvent>>, event: SessionEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = SessionEvent::Backgrounded {
            pid: 7,
            reason: BackgroundReason::Silence,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"backgrounded\""));
        assert!(json.contains("\"reason\":\"silence\""));
    }

    #[test]
    fn emit_without_listener_is_noop() {
        emit(None, SessionEvent::Killed { pid: 1 });
    }

    #[test]
    fn emit_ignores_dropped_receiver() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        emit(Some(&tx), SessionEvent::Killed { pid: 1 });
    }

    #[test]
    fn emit_delivers_to_listener() {
        let (tx, rx) = mpsc::channel();
        emit(Some(&tx), SessionEvent::InputSent { pid: 3, length: 2 });
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::InputSent { pid: 3, length: 2 }
        );
    }
}
