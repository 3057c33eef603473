//! Scripted in-memory processes for driving the monitor loop and job table
//! without a real terminal.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use portable_pty::ChildKiller;

use super::{ChildProcess, ExitInfo, ReadOutcome};

// High enough that a fake pid never looks like a real one in logs.
static NEXT_PID: AtomicU32 = AtomicU32::new(900_000);

/// One scripted reaction to a read.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return these bytes.
    Output(Vec<u8>),
    /// Return `Timeout` after waiting out the read timeout.
    Quiet,
    /// Return a transient read error.
    Fail,
    /// Mark the process exited with this code. Steps after it are output
    /// still in flight and are returned by later reads.
    Exit(i32),
}

pub fn out(text: &str) -> Step {
    Step::Output(text.as_bytes().to_vec())
}

#[derive(Debug, Default)]
struct FakeState {
    script: VecDeque<Step>,
    replies: VecDeque<Vec<Step>>,
    written: Vec<u8>,
    exit: Option<ExitInfo>,
    hangups: u32,
    force_kills: u32,
    ignore_hangup: bool,
}

/// Inspection handle shared with the fake process it was created with.
#[derive(Debug, Clone, Default)]
pub struct FakeControl(Arc<Mutex<FakeState>>);

impl FakeControl {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Everything written to the process so far.
    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    pub fn hangups(&self) -> u32 {
        self.state().hangups
    }

    pub fn force_kills(&self) -> u32 {
        self.state().force_kills
    }

    pub fn exited(&self) -> bool {
        self.state().exit.is_some()
    }

    /// Queue output for the next read.
    pub fn push_output(&self, text: &str) {
        self.state().script.push_back(out(text));
    }

    /// Make the process exit right now.
    pub fn exit_now(&self, code: i32) {
        self.state().exit = Some(ExitInfo::from_code(code));
    }
}

/// A process that replays a script of read outcomes.
#[derive(Debug)]
pub struct FakeProcess {
    pid: u32,
    control: FakeControl,
}

impl FakeProcess {
    pub fn new(script: Vec<Step>) -> (Self, FakeControl) {
        let control = FakeControl::default();
        control.state().script = script.into();
        let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
        (
            Self {
                pid,
                control: control.clone(),
            },
            control,
        )
    }

    /// Each write appends the next reply to the script.
    pub fn with_replies(self, replies: Vec<Vec<Step>>) -> Self {
        self.control.state().replies = replies.into();
        self
    }

    /// Survive hangups; only `force_kill` ends the process.
    pub fn ignoring_hangup(self) -> Self {
        self.control.state().ignore_hangup = true;
        self
    }
}

impl ChildProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn read_chunk(&mut self, timeout: Duration) -> ReadOutcome {
        let step = {
            let mut state = self.control.state();
            match state.script.pop_front() {
                Some(step) => step,
                None if state.exit.is_some() => return ReadOutcome::Eof,
                None => Step::Quiet,
            }
        };
        match step {
            Step::Output(bytes) => ReadOutcome::Data(bytes),
            Step::Quiet => {
                thread::sleep(timeout);
                ReadOutcome::Timeout
            }
            Step::Fail => ReadOutcome::Error(io::Error::other("scripted read failure")),
            Step::Exit(code) => {
                self.control.exit_now(code);
                ReadOutcome::Timeout
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.control.state();
        if state.exit.is_some() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        state.written.extend_from_slice(data);
        if let Some(reply) = state.replies.pop_front() {
            state.script.extend(reply);
        }
        Ok(())
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitInfo>> {
        Ok(self.control.state().exit.clone())
    }

    fn killer(&self) -> Box<dyn ChildKiller + Send + Sync> {
        Box::new(FakeKiller(self.control.clone()))
    }

    fn force_kill(&mut self) -> io::Result<()> {
        let mut state = self.control.state();
        state.force_kills += 1;
        if state.exit.is_none() {
            state.exit = Some(ExitInfo {
                code: 137,
                signal: Some("Killed".to_string()),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct FakeKiller(FakeControl);

impl ChildKiller for FakeKiller {
    fn kill(&mut self) -> io::Result<()> {
        let mut state = self.0.state();
        state.hangups += 1;
        if !state.ignore_hangup && state.exit.is_none() {
            state.exit = Some(ExitInfo {
                code: 129,
                signal: Some("Hangup".to_string()),
            });
        }
        Ok(())
    }

    fn clone_killer(&self) -> Box<dyn ChildKiller + Send + Sync> {
        Box::new(FakeKiller(self.0.clone()))
    }
}
