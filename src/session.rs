//! The session manager: the public face of the engine.
//!
//! `execute` runs a command through the safety gate and the monitor loop;
//! the pid-addressed calls operate on the job table that detached processes
//! land in. One manager owns one table; nothing here is global.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, SessionError};
use crate::events::{SessionEvent, emit};
use crate::jobs::{JobSummary, JobTable, SharedProcess, lock_io};
use crate::monitor::{ExecutionResult, Mode, Monitor, MonitorConfig, Watch};
use crate::prompt::PromptHeuristic;
use crate::pty::{NativeSpawner, ProcessIo, SpawnConfig, Spawner};
use crate::safety::{Confirmer, DenyAll, PatternGate, SafetyGate, Verdict};
use crate::takeover::{NoopTakeover, Takeover};

/// Everything tunable about a session manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub monitor: MonitorConfig,
    /// Used by callers that have no timeout of their own.
    pub default_timeout: Duration,
    /// Monitor timeout after `send_input`.
    pub input_timeout: Duration,
    pub normalize_newlines: bool,
    pub shell: String,
    pub term: String,
    /// Extra environment for every spawned command.
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
    pub heuristic: PromptHeuristic,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            default_timeout: Duration::from_secs(10),
            input_timeout: Duration::from_secs(10),
            normalize_newlines: true,
            shell: "/bin/sh".to_string(),
            term: "xterm-256color".to_string(),
            env: Vec::new(),
            rows: 24,
            cols: 80,
            heuristic: PromptHeuristic::default(),
        }
    }
}

/// Runs commands in PTYs and tracks the ones left running.
pub struct SessionManager {
    config: SessionConfig,
    table: JobTable,
    spawner: Box<dyn Spawner>,
    gate: Box<dyn SafetyGate>,
    confirmer: Box<dyn Confirmer>,
    takeover: Box<dyn Takeover>,
    events: Option<Sender<SessionEvent>>,
    interrupt: Arc<AtomicBool>,
}

impl SessionManager {
    /// A manager with native PTYs, the built-in safety patterns, a confirmer
    /// that declines, and no terminal takeover.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            table: JobTable::new(),
            spawner: Box::new(NativeSpawner),
            gate: Box::new(PatternGate::default()),
            confirmer: Box::new(DenyAll),
            takeover: Box::new(NoopTakeover),
            events: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_spawner(mut self, spawner: impl Spawner + 'static) -> Self {
        self.spawner = Box::new(spawner);
        self
    }

    pub fn with_gate(mut self, gate: impl SafetyGate + 'static) -> Self {
        self.gate = Box::new(gate);
        self
    }

    pub fn with_confirmer(mut self, confirmer: impl Confirmer + 'static) -> Self {
        self.confirmer = Box::new(confirmer);
        self
    }

    pub fn with_takeover(mut self, takeover: impl Takeover + 'static) -> Self {
        self.takeover = Box::new(takeover);
        self
    }

    pub fn with_events(mut self, events: Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Flag that makes the active monitor loop send Ctrl-C to its process.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    fn monitor(&self) -> Monitor<'_> {
        Monitor {
            config: &self.config.monitor,
            table: &self.table,
            heuristic: &self.config.heuristic,
            takeover: self.takeover.as_ref(),
            events: self.events.as_ref(),
            interrupt: &self.interrupt,
        }
    }

    /// Run `command` in a fresh PTY under `cwd`.
    ///
    /// Blocks until the process exits, prompts, goes quiet, or `timeout`
    /// passes. Only a spawn failure is an error; refusals are results.
    pub fn execute(&self, command: &str, timeout: Duration, cwd: &Path) -> Result<ExecutionResult> {
        match self.gate.evaluate(command) {
            Verdict::Blocked { reason } => {
                info!(command, %reason, "command blocked");
                emit(
                    self.events.as_ref(),
                    SessionEvent::Blocked {
                        command: command.to_string(),
                        reason: reason.clone(),
                    },
                );
                return Ok(ExecutionResult::Blocked { reason });
            }
            Verdict::NeedsConfirmation { reason } => {
                if !self.confirmer.confirm(command, &reason) {
                    info!(command, "command cancelled by user");
                    emit(
                        self.events.as_ref(),
                        SessionEvent::Cancelled {
                            command: command.to_string(),
                        },
                    );
                    return Ok(ExecutionResult::Cancelled);
                }
                debug!(command, "risky command confirmed");
            }
            Verdict::Allowed => {}
        }

        let spawn = SpawnConfig {
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            shell: self.config.shell.clone(),
            term: self.config.term.clone(),
            env: self.config.env.clone(),
            rows: self.config.rows,
            cols: self.config.cols,
        };
        let child = self.spawner.spawn(&spawn)?;
        let pid = child.pid();
        emit(
            self.events.as_ref(),
            SessionEvent::Spawned {
                pid,
                command: command.to_string(),
                cwd: cwd.display().to_string(),
            },
        );

        let process = Arc::new(Mutex::new(ProcessIo::new(
            child,
            self.config.normalize_newlines,
        )));
        self.monitor().run(Watch {
            process: &process,
            command,
            cwd,
            mode: Mode::Initial,
            timeout,
            output: String::new(),
        })
    }

    /// Type `text` into a job (adding a newline if missing) and watch it
    /// again, without terminal takeover.
    ///
    /// A job whose process has already exited is drained, removed and
    /// reported as `Finished` instead of being written to.
    pub fn send_input(&self, pid: u32, text: &str) -> Result<ExecutionResult> {
        let (process, command, cwd) = self.table.handle(pid)?;

        {
            let mut io = lock_io(&process);
            if let Ok(Some(exit)) = io.try_exit() {
                let tail = io.drain_text(self.config.monitor.drain_idle);
                drop(io);
                return self.resolve_stale(pid, &process, exit.code, &tail);
            }

            let mut line = text.to_string();
            if !line.ends_with('\n') {
                line.push('\n');
            }
            io.write_all(line.as_bytes())
                .map_err(|source| SessionError::WriteFailed { pid, source })?;
            debug!(pid, bytes = line.len(), "input sent");
            emit(
                self.events.as_ref(),
                SessionEvent::InputSent {
                    pid,
                    length: line.len(),
                },
            );
        }

        // Killed between the write and now.
        let output = self.table.output(pid)?;
        self.monitor().run(Watch {
            process: &process,
            command: &command,
            cwd: &cwd,
            mode: Mode::Continuation,
            timeout: self.config.input_timeout,
            output,
        })
    }

    fn resolve_stale(
        &self,
        pid: u32,
        process: &SharedProcess,
        exit_code: i32,
        tail: &str,
    ) -> Result<ExecutionResult> {
        let mut output = self.table.output(pid)?;
        output.push_str(tail);
        self.table.remove_if_same(pid, process);
        info!(pid, exit_code, "job had already exited");
        emit(
            self.events.as_ref(),
            SessionEvent::Finished { pid, exit_code },
        );
        Ok(ExecutionResult::Finished { exit_code, output })
    }

    /// Terminate a job. A second kill of the same pid is `NotFound`.
    pub fn kill(&self, pid: u32) -> Result<()> {
        self.table.kill(pid, self.config.monitor.kill_grace)?;
        emit(self.events.as_ref(), SessionEvent::Killed { pid });
        Ok(())
    }

    /// Output a job produced since the last `read_output` for it.
    pub fn read_output(&self, pid: u32) -> Result<String> {
        self.table.read_output(pid, self.config.monitor.drain_idle)
    }

    /// Snapshot of all jobs, ordered by pid.
    pub fn list_jobs(&self) -> Vec<JobSummary> {
        self.table.list()
    }

    /// Kill every job still registered.
    pub fn shutdown(&self) {
        if !self.table.is_empty() {
            info!(jobs = self.table.len(), "terminating background jobs");
        }
        for pid in self.table.kill_all(self.config.monitor.kill_grace) {
            debug!(pid, "job terminated on shutdown");
            emit(self.events.as_ref(), SessionEvent::Killed { pid });
        }
    }

    /// Directory a job was started in.
    pub fn job_cwd(&self, pid: u32) -> Result<PathBuf> {
        Ok(self.table.handle(pid)?.2)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
