//! The monitor loop: polls one process until it finishes or is handed off.
//!
//! ## States
//!
//! ```text
//! RUNNING → process exited                 → FINISHED
//!         → prompt seen, initial call      → PROMPT_TAKEOVER → Finished | Paused
//!         → prompt seen, after SendInput   → PROMPT_CONTINUATION (ContinuationPaused)
//!         → no output for silence_timeout  → BACKGROUND_SILENT
//!         → call ran longer than timeout   → BACKGROUND_TIMEOUT
//! ```
//!
//! Every state but RUNNING ends the call. Detached processes keep running
//! and are registered in the job table for later calls.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{BackgroundReason, SessionEvent, emit};
use crate::jobs::{JobTable, NewJob, SharedProcess, lock_io};
use crate::prompt::PromptHeuristic;
use crate::pty::{ExitInfo, INTERRUPTED_EXIT_CODE, ProcessIo, ReadOutcome};
use crate::takeover::{Takeover, TakeoverOutcome};

/// ETX, what the terminal sends for Ctrl-C.
const INTERRUPT_BYTE: u8 = 0x03;

/// Outcome of an `execute` or `send_input` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// The process exited; `output` is everything it printed.
    Finished { exit_code: i32, output: String },
    /// Still running, but quiet for longer than the silence threshold.
    BackgroundSilent { pid: u32, output: String },
    /// Still running when the caller's timeout elapsed.
    BackgroundTimeout { pid: u32, output: String },
    /// A prompt was handed to the terminal and the user detached from it.
    Paused { pid: u32, output: String },
    /// Another prompt appeared after programmatic input.
    ContinuationPaused { pid: u32, output: String },
    /// Refused by the safety gate; nothing was spawned.
    Blocked { reason: String },
    /// The user declined confirmation; nothing was spawned.
    Cancelled,
}

impl ExecutionResult {
    /// Pid of the job to address next, when the process is still running.
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::BackgroundSilent { pid, .. }
            | Self::BackgroundTimeout { pid, .. }
            | Self::Paused { pid, .. }
            | Self::ContinuationPaused { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    /// Output collected so far, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Finished { output, .. }
            | Self::BackgroundSilent { output, .. }
            | Self::BackgroundTimeout { output, .. }
            | Self::Paused { output, .. }
            | Self::ContinuationPaused { output, .. } => Some(output),
            Self::Blocked { .. } | Self::Cancelled => None,
        }
    }

    /// `true` when the process exited because of a user interrupt.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Finished { exit_code, .. } if *exit_code == INTERRUPTED_EXIT_CODE)
    }

    /// `true` when the process is still alive in the job table.
    pub fn is_detached(&self) -> bool {
        self.pid().is_some()
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished { exit_code, .. } if *exit_code == INTERRUPTED_EXIT_CODE => {
                write!(f, "interrupted (exit code {exit_code})")
            }
            Self::Finished { exit_code, .. } => write!(f, "finished with exit code {exit_code}"),
            Self::BackgroundSilent { pid, .. } => {
                write!(f, "no output for a while; running in background as pid {pid}")
            }
            Self::BackgroundTimeout { pid, .. } => {
                write!(f, "timed out; running in background as pid {pid}")
            }
            Self::Paused { pid, .. } => write!(f, "paused at a prompt; pid {pid} is waiting"),
            Self::ContinuationPaused { pid, .. } => {
                write!(f, "waiting for more input; send it to pid {pid}")
            }
            Self::Blocked { reason } => write!(f, "blocked: {reason}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Tuning for the monitor loop.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How long each read waits for output.
    pub poll_interval: Duration,
    /// Quiet time after which a live process is moved to the background.
    pub silence_timeout: Duration,
    /// Idle window used when collecting the last output of an exited process.
    pub drain_idle: Duration,
    /// How long a killed process gets to exit after a hangup before SIGKILL.
    pub kill_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            silence_timeout: Duration::from_secs(5),
            drain_idle: Duration::from_millis(200),
            kill_grace: Duration::from_millis(1000),
        }
    }
}

/// How the loop was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Fresh `execute`: prompts go to the takeover collaborator.
    Initial,
    /// Resumed by `send_input`: prompts are reported back to the caller.
    Continuation,
}

/// One process to watch.
pub struct Watch<'a> {
    pub process: &'a SharedProcess,
    pub command: &'a str,
    pub cwd: &'a Path,
    pub mode: Mode,
    pub timeout: Duration,
    /// Output already accumulated (the stored buffer on continuation).
    pub output: String,
}

/// Collaborators the loop consults on every pass.
pub struct Monitor<'a> {
    pub config: &'a MonitorConfig,
    pub table: &'a JobTable,
    pub heuristic: &'a PromptHeuristic,
    pub takeover: &'a dyn Takeover,
    pub events: Option<&'a Sender<SessionEvent>>,
    pub interrupt: &'a AtomicBool,
}

impl Monitor<'_> {
    /// Poll until a terminal outcome. Holds the process I/O for the duration.
    pub fn run(&self, mut watch: Watch<'_>) -> Result<ExecutionResult> {
        let mut io = lock_io(watch.process);
        let pid = io.pid();
        let started = Instant::now();
        let mut last_output = started;
        let mut output = std::mem::take(&mut watch.output);
        // Prompts are only looked for in text received by this call.
        let fresh_from = output.len();
        let mut killed = false;

        debug!(pid, mode = ?watch.mode, timeout_ms = watch.timeout.as_millis() as u64, "monitoring");

        loop {
            if self.interrupt.swap(false, Ordering::SeqCst) {
                info!(pid, "forwarding interrupt");
                if let Err(e) = io.write_all(&[INTERRUPT_BYTE]) {
                    warn!(pid, error = %e, "failed to forward interrupt");
                }
            }

            match io.try_exit() {
                Ok(Some(exit)) => return Ok(self.finish(&mut io, &watch, &mut output, exit)),
                Ok(None) => {}
                Err(e) => debug!(pid, error = %e, "liveness check failed"),
            }

            if watch.mode == Mode::Continuation && !killed && !self.table.holds(pid, watch.process)
            {
                // Killed while we held the I/O lock; the next pass reports the exit.
                killed = true;
                self.finish_kill(&mut io);
                continue;
            }

            match io.read(self.config.poll_interval) {
                ReadOutcome::Data(bytes) => {
                    last_output = Instant::now();
                    let text = io.decode(&bytes);
                    self.append(pid, &watch, &mut output, &text);

                    if let Some(prompt) = self.heuristic.detect(&output[fresh_from..]) {
                        debug!(pid, signal = ?prompt.signal, "prompt detected");
                        emit(
                            self.events,
                            SessionEvent::PromptDetected {
                                pid,
                                tail: prompt.tail,
                            },
                        );
                        return self.on_prompt(&mut io, &watch, output);
                    }
                }
                quiet @ (ReadOutcome::Timeout | ReadOutcome::Eof) => {
                    if matches!(quiet, ReadOutcome::Eof) {
                        // Terminal closed but the process lives on; pace the loop.
                        thread::sleep(self.config.poll_interval);
                    }
                    if last_output.elapsed() > self.config.silence_timeout {
                        info!(pid, "no output, moving to background");
                        return Ok(self.detach(&io, &watch, output, BackgroundReason::Silence));
                    }
                }
                ReadOutcome::Error(e) => {
                    warn!(pid, error = %e, "read failed, retrying");
                }
            }

            if started.elapsed() > watch.timeout {
                info!(pid, "timeout reached, moving to background");
                return Ok(self.detach(&io, &watch, output, BackgroundReason::Timeout));
            }
        }
    }

    fn finish_kill(&self, io: &mut ProcessIo) {
        let pid = io.pid();
        if io.reap(self.config.kill_grace).is_some() {
            return;
        }
        info!(pid, "killed job survived hangup, forcing");
        if let Err(e) = io.force_kill() {
            warn!(pid, error = %e, "forced kill failed");
        }
        io.reap(self.config.kill_grace);
    }

    fn append(&self, pid: u32, watch: &Watch<'_>, output: &mut String, text: &str) {
        if text.is_empty() {
            return;
        }
        output.push_str(text);
        if watch.mode == Mode::Continuation {
            self.table.append_output(pid, watch.process, text);
        }
        emit(
            self.events,
            SessionEvent::Output {
                pid,
                text: text.to_string(),
            },
        );
    }

    fn finish(
        &self,
        io: &mut ProcessIo,
        watch: &Watch<'_>,
        output: &mut String,
        exit: ExitInfo,
    ) -> ExecutionResult {
        let pid = io.pid();
        let tail = io.drain_text(self.config.drain_idle);
        self.append(pid, watch, output, &tail);
        self.table.remove_if_same(pid, watch.process);

        info!(pid, exit_code = exit.code, "process finished");
        emit(
            self.events,
            SessionEvent::Finished {
                pid,
                exit_code: exit.code,
            },
        );
        ExecutionResult::Finished {
            exit_code: exit.code,
            output: std::mem::take(output),
        }
    }

    fn on_prompt(
        &self,
        io: &mut ProcessIo,
        watch: &Watch<'_>,
        mut output: String,
    ) -> Result<ExecutionResult> {
        if watch.mode == Mode::Continuation {
            return Ok(self.detach(io, watch, output, BackgroundReason::AwaitingInput));
        }

        match self.takeover.take_over(io, &mut output)? {
            TakeoverOutcome::Exited(exit) => Ok(self.finish(io, watch, &mut output, exit)),
            TakeoverOutcome::StillAlive => {
                Ok(self.detach(io, watch, output, BackgroundReason::Paused))
            }
        }
    }

    /// Hand the process to the job table and build the matching result.
    fn detach(
        &self,
        io: &ProcessIo,
        watch: &Watch<'_>,
        output: String,
        reason: BackgroundReason,
    ) -> ExecutionResult {
        let pid = io.pid();
        match watch.mode {
            Mode::Initial => {
                let job = new_job_locked(io, watch, &output);
                self.table.register(pid, job);
            }
            // The entry already holds this buffer. If it is gone, the job was
            // killed while we polled and must not come back.
            Mode::Continuation => {}
        }
        emit(self.events, SessionEvent::Backgrounded { pid, reason });

        match reason {
            BackgroundReason::Silence => ExecutionResult::BackgroundSilent { pid, output },
            BackgroundReason::Timeout => ExecutionResult::BackgroundTimeout { pid, output },
            BackgroundReason::Paused => ExecutionResult::Paused { pid, output },
            BackgroundReason::AwaitingInput => ExecutionResult::ContinuationPaused { pid, output },
        }
    }
}

/// Like [`crate::jobs::new_job`], for callers already holding the I/O lock.
fn new_job_locked(io: &ProcessIo, watch: &Watch<'_>, output: &str) -> NewJob {
    NewJob {
        process: Arc::clone(watch.process),
        killer: io.killer(),
        output: output.to_string(),
        command: watch.command.to_string(),
        cwd: watch.cwd.to_path_buf(),
        last_output_at: Instant::now(),
    }
}
