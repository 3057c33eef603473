//! Registry of detached processes, keyed by pid.
//!
//! A process lands here when a foreground call stops watching it while it is
//! still alive. The table lock guards membership and output buffers only;
//! the process I/O has its own lock so a slow read never stalls `list` or
//! `kill`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::ChildKiller;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::pty::ProcessIo;

/// Process I/O shared between the table and whichever loop is polling it.
pub type SharedProcess = Arc<Mutex<ProcessIo>>;

/// Lock process I/O, recovering from a poisoned lock.
pub fn lock_io(process: &SharedProcess) -> MutexGuard<'_, ProcessIo> {
    process.lock().unwrap_or_else(|e| e.into_inner())
}

/// A job ready to be registered.
pub struct NewJob {
    pub process: SharedProcess,
    pub killer: Box<dyn ChildKiller + Send + Sync>,
    pub output: String,
    pub command: String,
    pub cwd: PathBuf,
    pub last_output_at: Instant,
}

struct JobRecord {
    process: SharedProcess,
    killer: Box<dyn ChildKiller + Send + Sync>,
    output: String,
    /// Byte offset up to which `read_output` has already returned output.
    read_cursor: usize,
    command: String,
    cwd: PathBuf,
    last_output_at: Instant,
}

/// Snapshot row returned by [`JobTable::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub pid: u32,
    pub alive: bool,
    pub command: String,
    pub cwd: PathBuf,
    pub output_len: usize,
    /// Time since the job last produced output.
    pub idle_millis: u64,
}

/// Mutex-guarded map of background jobs.
#[derive(Default)]
pub struct JobTable {
    jobs: Mutex<BTreeMap<u32, JobRecord>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, JobRecord>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or overwrite the entry for `pid`.
    ///
    /// A new entry starts with everything it was registered with marked as
    /// read; the caller already returned that output. Re-registering the same
    /// process keeps the existing cursor.
    pub fn register(&self, pid: u32, job: NewJob) {
        let mut jobs = self.lock();
        let read_cursor = match jobs.get(&pid) {
            Some(existing) if Arc::ptr_eq(&existing.process, &job.process) => {
                existing.read_cursor.min(job.output.len())
            }
            _ => job.output.len(),
        };
        let replaced = jobs
            .insert(
                pid,
                JobRecord {
                    process: job.process,
                    killer: job.killer,
                    output: job.output,
                    read_cursor,
                    command: job.command,
                    cwd: job.cwd,
                    last_output_at: job.last_output_at,
                },
            )
            .is_some();
        debug!(pid, replaced, "job registered");
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.lock().contains_key(&pid)
    }

    pub fn pids(&self) -> Vec<u32> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Process handle plus the originating command and directory.
    pub fn handle(&self, pid: u32) -> Result<(SharedProcess, String, PathBuf)> {
        let jobs = self.lock();
        let record = jobs.get(&pid).ok_or(SessionError::NotFound { pid })?;
        Ok((
            Arc::clone(&record.process),
            record.command.clone(),
            record.cwd.clone(),
        ))
    }

    /// `true` while the entry for `pid` still refers to `process`.
    pub fn holds(&self, pid: u32, process: &SharedProcess) -> bool {
        self.lock()
            .get(&pid)
            .is_some_and(|record| Arc::ptr_eq(&record.process, process))
    }

    /// Full accumulated output for `pid`.
    pub fn output(&self, pid: u32) -> Result<String> {
        self.lock()
            .get(&pid)
            .map(|r| r.output.clone())
            .ok_or(SessionError::NotFound { pid })
    }

    /// Append to the stored buffer if the entry still refers to `process`.
    /// Returns `false` when the job is gone or was replaced.
    pub fn append_output(&self, pid: u32, process: &SharedProcess, text: &str) -> bool {
        let mut jobs = self.lock();
        match jobs.get_mut(&pid) {
            Some(record) if Arc::ptr_eq(&record.process, process) => {
                record.output.push_str(text);
                record.last_output_at = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Remove `pid` only if its entry still refers to `process`, so a loop
    /// finishing late never evicts a newer registration.
    pub fn remove_if_same(&self, pid: u32, process: &SharedProcess) -> bool {
        let mut jobs = self.lock();
        let same = jobs
            .get(&pid)
            .is_some_and(|record| Arc::ptr_eq(&record.process, process));
        if same {
            jobs.remove(&pid);
            debug!(pid, "job removed");
        }
        same
    }

    /// Terminate a job and drop it from the table.
    ///
    /// The entry is removed first, so a concurrent second `kill` gets
    /// `NotFound` instead of signalling a process that may already be gone.
    /// The process gets a hangup, then SIGKILL if it is still alive after
    /// `grace`.
    pub fn kill(&self, pid: u32, grace: Duration) -> Result<()> {
        let mut record = self
            .lock()
            .remove(&pid)
            .ok_or(SessionError::NotFound { pid })?;

        if let Err(e) = record.killer.kill() {
            debug!(pid, error = %e, "hangup failed");
        }

        // A continuation loop may be holding the I/O lock. It notices the
        // missing entry on its next pass and escalates itself.
        let deadline = Instant::now() + grace;
        let mut io = loop {
            match record.process.try_lock() {
                Ok(io) => break io,
                Err(TryLockError::Poisoned(e)) => break e.into_inner(),
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(TryLockError::WouldBlock) => {
                    warn!(pid, "process busy, leaving escalation to its monitor loop");
                    info!(pid, "job killed");
                    return Ok(());
                }
            }
        };

        if io.reap(grace).is_none() {
            debug!(pid, "process survived hangup");
            if let Err(e) = io.force_kill() {
                warn!(pid, error = %e, "forced kill failed");
            }
            io.reap(grace);
        }
        info!(pid, "job killed");
        Ok(())
    }

    /// Output produced since the previous call for this pid.
    ///
    /// Reads whatever the process has ready without waiting. If a monitor
    /// loop currently owns the process I/O, the delta comes from the buffer
    /// that loop is appending to. A process found to have exited is drained
    /// and removed in the same call.
    pub fn read_output(&self, pid: u32, drain_idle: Duration) -> Result<String> {
        let process = self.handle(pid)?.0;

        let (fresh, exited) = match process.try_lock() {
            Ok(mut io) => read_fresh(&mut io, drain_idle),
            Err(TryLockError::Poisoned(e)) => read_fresh(&mut e.into_inner(), drain_idle),
            Err(TryLockError::WouldBlock) => (String::new(), false),
        };

        let mut jobs = self.lock();
        let record = match jobs.get_mut(&pid) {
            Some(record) if Arc::ptr_eq(&record.process, &process) => record,
            // Killed or replaced while we were reading.
            _ => return Err(SessionError::NotFound { pid }),
        };
        if !fresh.is_empty() {
            record.output.push_str(&fresh);
            record.last_output_at = Instant::now();
        }
        let delta = record
            .output
            .get(record.read_cursor..)
            .unwrap_or_default()
            .to_string();
        record.read_cursor = record.output.len();

        if exited {
            jobs.remove(&pid);
            info!(pid, "job finished, removed from table");
        }
        Ok(delta)
    }

    /// Snapshot of every job, ordered by pid.
    ///
    /// A job found to have exited is reported once with `alive: false` and
    /// removed in the same call.
    pub fn list(&self) -> Vec<JobSummary> {
        let mut jobs = self.lock();
        let rows: Vec<JobSummary> = jobs
            .iter()
            .map(|(pid, record)| JobSummary {
                pid: *pid,
                alive: is_alive(&record.process),
                command: record.command.clone(),
                cwd: record.cwd.clone(),
                output_len: record.output.len(),
                idle_millis: u64::try_from(record.last_output_at.elapsed().as_millis())
                    .unwrap_or(u64::MAX),
            })
            .collect();

        for row in rows.iter().filter(|row| !row.alive) {
            jobs.remove(&row.pid);
            info!(pid = row.pid, "job exited, removed from table");
        }
        rows
    }

    /// Kill every job and return the pids that were killed. Used when the
    /// owning session shuts down.
    pub fn kill_all(&self, grace: Duration) -> Vec<u32> {
        self.pids()
            .into_iter()
            // Another caller may have removed it already.
            .filter(|pid| self.kill(*pid, grace).is_ok())
            .collect()
    }
}

fn read_fresh(io: &mut ProcessIo, drain_idle: Duration) -> (String, bool) {
    match io.try_exit() {
        Ok(Some(_)) => (io.drain_text(drain_idle), true),
        Ok(None) => (io.read_available(), false),
        Err(e) => {
            debug!(pid = io.pid(), error = %e, "liveness check failed");
            (io.read_available(), false)
        }
    }
}

/// A process whose I/O is held by a running loop counts as alive.
fn is_alive(process: &SharedProcess) -> bool {
    match process.try_lock() {
        Ok(mut io) => !matches!(io.try_exit(), Ok(Some(_))),
        Err(TryLockError::Poisoned(e)) => !matches!(e.into_inner().try_exit(), Ok(Some(_))),
        Err(TryLockError::WouldBlock) => true,
    }
}

/// Build a [`NewJob`] for `process` with the given accumulated output.
pub fn new_job(process: &SharedProcess, output: &str, command: &str, cwd: &Path) -> NewJob {
    let killer = lock_io(process).killer();
    NewJob {
        process: Arc::clone(process),
        killer,
        output: output.to_string(),
        command: command.to_string(),
        cwd: cwd.to_path_buf(),
        last_output_at: Instant::now(),
    }
}
