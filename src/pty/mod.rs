//! PTY process adapter.
//!
//! Spawns a command in a pseudo-terminal and exposes the small surface the
//! monitor loop needs: read-with-timeout, write, liveness, exit status and a
//! detachable killer. A dedicated reader thread pumps the PTY master into a
//! channel so reads can time out without non-blocking file descriptors.

pub mod decode;
#[cfg(test)]
pub(crate) mod fake;

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info, trace};

use crate::error::{Result, SessionError};
use decode::OutputDecoder;

/// Size of each read from the PTY master.
const READ_CHUNK_SIZE: usize = 4096;

/// Result of a single timed read.
///
/// The four outcomes are kept distinct so the monitor loop never confuses a
/// quiet process with a dead one.
#[derive(Debug)]
pub enum ReadOutcome {
    /// New bytes arrived.
    Data(Vec<u8>),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The PTY is closed; no more output will ever arrive.
    Eof,
    /// The read failed; treated as transient by the caller.
    Error(io::Error),
}

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// POSIX-style status: the exit code, or `128 + signo` for signal deaths.
    pub code: i32,
    /// Signal description when the child was killed by a signal.
    pub signal: Option<String>,
}

/// Conventional status for a process stopped by SIGINT.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

impl ExitInfo {
    pub fn from_code(code: i32) -> Self {
        Self { code, signal: None }
    }

    /// `true` if the process was interrupted by the user (SIGINT / 130).
    pub fn interrupted(&self) -> bool {
        self.code == INTERRUPTED_EXIT_CODE
    }
}

impl From<portable_pty::ExitStatus> for ExitInfo {
    fn from(status: portable_pty::ExitStatus) -> Self {
        // portable-pty only exposes the signal through its Display text.
        match signal_name(&status) {
            Some(name) => Self {
                code: 128 + signal_number(&name).unwrap_or(1),
                signal: Some(name),
            },
            None => Self {
                code: i32::try_from(status.exit_code()).unwrap_or(i32::MAX),
                signal: None,
            },
        }
    }
}

fn signal_name(status: &portable_pty::ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    status
        .to_string()
        .strip_prefix("Terminated by ")
        .map(str::to_string)
}

/// Map a signal description (as produced by `strsignal`) to its number.
fn signal_number(name: &str) -> Option<i32> {
    let lower = name.to_ascii_lowercase();
    if let Some(n) = lower.strip_prefix("signal ") {
        return n.trim().parse().ok();
    }
    let table = [
        ("hangup", 1),
        ("interrupt", 2),
        ("quit", 3),
        ("aborted", 6),
        ("killed", 9),
        ("segmentation fault", 11),
        ("broken pipe", 13),
        ("alarm clock", 14),
        ("terminated", 15),
    ];
    table
        .iter()
        .find(|(prefix, _)| lower.starts_with(prefix))
        .map(|(_, n)| *n)
}

/// A running child process attached to a terminal.
///
/// Implemented by [`PtyProcess`] in production and by scripted fakes in
/// tests.
pub trait ChildProcess: Send {
    /// OS process id; the job table key.
    fn pid(&self) -> u32;

    /// Wait up to `timeout` for output.
    fn read_chunk(&mut self, timeout: Duration) -> ReadOutcome;

    /// Write raw bytes to the terminal input.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Non-blocking liveness check; `Some` once the process has exited.
    fn try_exit(&mut self) -> io::Result<Option<ExitInfo>>;

    /// A handle that can hang up the process without holding `self`.
    fn killer(&self) -> Box<dyn ChildKiller + Send + Sync>;

    /// Uncatchable termination, for processes that survived a hangup.
    fn force_kill(&mut self) -> io::Result<()>;

    /// Collect whatever output is still in flight after exit.
    ///
    /// Stops at EOF, on error, or after `idle` passes with no new bytes.
    fn drain(&mut self, idle: Duration) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match self.read_chunk(idle) {
                ReadOutcome::Data(bytes) => out.extend_from_slice(&bytes),
                ReadOutcome::Timeout | ReadOutcome::Eof => break,
                ReadOutcome::Error(e) => {
                    debug!(error = %e, "read error while draining");
                    break;
                }
            }
        }
        out
    }

    /// Best-effort reap after a kill, bounded by `grace`.
    fn reap(&mut self, grace: Duration) -> Option<ExitInfo> {
        let deadline = Instant::now() + grace;
        loop {
            if let Ok(Some(exit)) = self.try_exit() {
                return Some(exit);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// A child process paired with the decoder for its output stream.
///
/// Whoever holds this owns the process I/O: the monitor loop while polling,
/// the job table while reading incrementally.
pub struct ProcessIo {
    process: Box<dyn ChildProcess>,
    decoder: OutputDecoder,
}

impl ProcessIo {
    pub fn new(process: Box<dyn ChildProcess>, normalize_newlines: bool) -> Self {
        Self {
            process,
            decoder: OutputDecoder::new(normalize_newlines),
        }
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn read(&mut self, timeout: Duration) -> ReadOutcome {
        self.process.read_chunk(timeout)
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.decoder.push(bytes)
    }

    /// Everything readable right now, without waiting.
    pub fn read_available(&mut self) -> String {
        let mut text = String::new();
        loop {
            match self.process.read_chunk(Duration::ZERO) {
                ReadOutcome::Data(bytes) => text.push_str(&self.decoder.push(&bytes)),
                ReadOutcome::Timeout | ReadOutcome::Eof => break,
                ReadOutcome::Error(e) => {
                    debug!(pid = self.pid(), error = %e, "read error, returning partial output");
                    break;
                }
            }
        }
        text
    }

    /// Final output of an exited process, including held-back bytes.
    pub fn drain_text(&mut self, idle: Duration) -> String {
        let bytes = self.process.drain(idle);
        let mut text = self.decoder.push(&bytes);
        text.push_str(&self.decoder.finish());
        text
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.process.write_all(data)
    }

    pub fn try_exit(&mut self) -> io::Result<Option<ExitInfo>> {
        self.process.try_exit()
    }

    pub fn killer(&self) -> Box<dyn ChildKiller + Send + Sync> {
        self.process.killer()
    }

    pub fn force_kill(&mut self) -> io::Result<()> {
        self.process.force_kill()
    }

    pub fn reap(&mut self, grace: Duration) -> Option<ExitInfo> {
        self.process.reap(grace)
    }
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIo").field("pid", &self.pid()).finish()
    }
}

/// Everything needed to start one command.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// The command line, handed to `shell -c` verbatim.
    pub command: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Shell used to interpret `command`.
    pub shell: String,
    /// Value for `TERM`.
    pub term: String,
    /// Extra environment variables (key, value pairs).
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl SpawnConfig {
    pub fn new(command: impl Into<String>, cwd: impl AsRef<Path>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.as_ref().to_path_buf(),
            shell: "/bin/sh".to_string(),
            term: "xterm-256color".to_string(),
            env: vec![],
            rows: 24,
            cols: 80,
        }
    }
}

/// Process creation seam.
pub trait Spawner: Send + Sync {
    fn spawn(&self, config: &SpawnConfig) -> Result<Box<dyn ChildProcess>>;
}

/// Spawns real processes in native PTYs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeSpawner;

impl Spawner for NativeSpawner {
    fn spawn(&self, config: &SpawnConfig) -> Result<Box<dyn ChildProcess>> {
        Ok(Box::new(PtyProcess::spawn(config)?))
    }
}

/// A child process running in a native pseudo-terminal.
pub struct PtyProcess {
    pid: u32,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    output_rx: Receiver<io::Result<Vec<u8>>>,
    eof: bool,
    exit: Option<ExitInfo>,
    // Dropping the master closes the terminal; keep it for the process lifetime.
    _master: Box<dyn MasterPty + Send>,
}

impl PtyProcess {
    /// Open a PTY and start `config.shell -c config.command` inside it.
    pub fn spawn(config: &SpawnConfig) -> Result<Self> {
        let spawn_err = |source: anyhow::Error| SessionError::SpawnFailure {
            command: config.command.clone(),
            source: source.into(),
        };

        // portable-pty silently falls back to $HOME for a bad cwd.
        if !config.cwd.is_dir() {
            return Err(spawn_err(anyhow::anyhow!(
                "working directory does not exist: {}",
                config.cwd.display()
            )));
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_err(e.context("failed to open PTY")))?;

        let mut cmd = CommandBuilder::new(&config.shell);
        cmd.arg("-c");
        cmd.arg(&config.command);
        cmd.cwd(&config.cwd);
        cmd.env("TERM", &config.term);
        for (key, val) in &config.env {
            cmd.env(key, val);
        }

        info!(
            command = %config.command,
            cwd = %config.cwd.display(),
            "spawning command in PTY"
        );

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_err(e.context("failed to spawn process")))?;

        // Drop the slave side so the reader sees EOF once the child exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| spawn_err(e.context("failed to clone PTY reader")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| spawn_err(e.context("failed to take PTY writer")))?;

        let pid = child.process_id().unwrap_or(0);
        let output_rx = spawn_reader_thread(pid, reader)
            .map_err(|e| spawn_err(anyhow::Error::new(e).context("failed to start reader thread")))?;

        info!(pid, "PTY process started");

        Ok(Self {
            pid,
            child,
            writer,
            output_rx,
            eof: false,
            exit: None,
            _master: pair.master,
        })
    }
}

fn spawn_reader_thread(
    pid: u32,
    mut reader: Box<dyn Read + Send>,
) -> io::Result<Receiver<io::Result<Vec<u8>>>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("pty-reader-{pid}"))
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if is_closed_pty(&e) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
            trace!(pid, "PTY reader finished");
        })?;
    Ok(rx)
}

/// Linux reports a hung-up PTY master as EIO rather than a zero-length read.
fn is_closed_pty(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::EIO)
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}

impl ChildProcess for PtyProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn read_chunk(&mut self, timeout: Duration) -> ReadOutcome {
        if self.eof {
            return ReadOutcome::Eof;
        }
        match self.output_rx.recv_timeout(timeout) {
            Ok(Ok(bytes)) => ReadOutcome::Data(bytes),
            Ok(Err(e)) => ReadOutcome::Error(e),
            Err(RecvTimeoutError::Timeout) => ReadOutcome::Timeout,
            Err(RecvTimeoutError::Disconnected) => {
                self.eof = true;
                ReadOutcome::Eof
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitInfo>> {
        if let Some(exit) = &self.exit {
            return Ok(Some(exit.clone()));
        }
        let status = self.child.try_wait()?;
        if let Some(status) = status {
            let exit = ExitInfo::from(status);
            debug!(pid = self.pid, code = exit.code, "process exited");
            self.exit = Some(exit.clone());
            return Ok(Some(exit));
        }
        Ok(None)
    }

    fn killer(&self) -> Box<dyn ChildKiller + Send + Sync> {
        self.child.clone_killer()
    }

    fn force_kill(&mut self) -> io::Result<()> {
        // Never signal a pid we already reaped; it may have been reused.
        if self.try_exit()?.is_some() {
            return Ok(());
        }
        debug!(pid = self.pid, "sending SIGKILL");
        #[cfg(unix)]
        {
            let pid = i32::try_from(self.pid).map_err(io::Error::other)?;
            // SAFETY: kill(2) has no memory-safety preconditions.
            if unsafe { libc::kill(pid, libc::SIGKILL) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            self.child.kill()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_to_exit(process: &mut PtyProcess) -> (ExitInfo, String) {
        let mut decoder = decode::OutputDecoder::new(true);
        let mut output = String::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(exit) = process.try_exit().unwrap() {
                output.push_str(&decoder.push(&process.drain(Duration::from_millis(200))));
                output.push_str(&decoder.finish());
                return (exit, output);
            }
            if let ReadOutcome::Data(bytes) = process.read_chunk(Duration::from_millis(100)) {
                output.push_str(&decoder.push(&bytes));
            }
            assert!(Instant::now() < deadline, "process did not exit");
        }
    }

    #[test]
    fn spawn_echo_collects_output() {
        let config = SpawnConfig::new("echo hello from pty", "/tmp");
        let mut process = PtyProcess::spawn(&config).unwrap();
        assert!(process.pid() > 0);

        let (exit, output) = run_to_exit(&mut process);
        assert_eq!(exit.code, 0);
        assert_eq!(output, "hello from pty\n");
    }

    #[test]
    fn exit_code_is_reported() {
        let config = SpawnConfig::new("exit 3", "/tmp");
        let mut process = PtyProcess::spawn(&config).unwrap();
        let (exit, _) = run_to_exit(&mut process);
        assert_eq!(exit.code, 3);
        assert!(exit.signal.is_none());
    }

    #[test]
    fn write_reaches_the_child() {
        let config = SpawnConfig::new("read line; echo \"got:$line\"", "/tmp");
        let mut process = PtyProcess::spawn(&config).unwrap();
        process.write_all(b"ping\n").unwrap();

        let (exit, output) = run_to_exit(&mut process);
        assert_eq!(exit.code, 0);
        assert!(output.contains("got:ping"), "output was {output:?}");
    }

    #[test]
    fn killer_terminates_process() {
        let config = SpawnConfig::new("sleep 30", "/tmp");
        let mut process = PtyProcess::spawn(&config).unwrap();
        assert!(process.try_exit().unwrap().is_none());

        process.killer().kill().unwrap();
        let exit = process.reap(Duration::from_secs(5));
        assert!(exit.is_some(), "killed process should be reaped");
    }

    #[test]
    fn force_kill_stops_a_process_ignoring_hangup() {
        let config = SpawnConfig::new("trap '' HUP; sleep 30", "/tmp");
        let mut process = PtyProcess::spawn(&config).unwrap();
        thread::sleep(Duration::from_millis(200));

        process.force_kill().unwrap();
        let exit = process.reap(Duration::from_secs(5)).expect("reaped");
        assert_eq!(exit.code, 137);
    }

    #[test]
    fn spawn_in_missing_directory_fails() {
        let config = SpawnConfig::new("true", "/definitely/not/here");
        let err = PtyProcess::spawn(&config).err().expect("spawn should fail");
        assert!(matches!(err, SessionError::SpawnFailure { .. }));
    }

    #[test]
    fn signal_names_map_to_posix_codes() {
        assert_eq!(signal_number("Interrupt"), Some(2));
        assert_eq!(signal_number("Killed"), Some(9));
        assert_eq!(signal_number("Terminated"), Some(15));
        assert_eq!(signal_number("Signal 10"), Some(10));
        assert_eq!(signal_number("Something else"), None);
    }

    #[test]
    fn portable_exit_status_conversion() {
        let info = ExitInfo::from(portable_pty::ExitStatus::with_exit_code(0));
        assert_eq!(info, ExitInfo::from_code(0));

        let info = ExitInfo::from(portable_pty::ExitStatus::with_exit_code(3));
        assert_eq!(info, ExitInfo::from_code(3));

        let info = ExitInfo::from(portable_pty::ExitStatus::with_signal("Interrupt"));
        assert_eq!(info.code, 130);
        assert_eq!(info.signal.as_deref(), Some("Interrupt"));
        assert!(info.interrupted());
    }

    #[test]
    fn waited_signal_status_keeps_its_number() {
        use std::os::unix::process::ExitStatusExt;

        // Raw wait status 9: terminated by SIGKILL.
        let status = portable_pty::ExitStatus::from(std::process::ExitStatus::from_raw(9));
        assert_eq!(ExitInfo::from(status).code, 137);
    }

    #[test]
    fn self_interrupted_shell_reports_130() {
        let config = SpawnConfig::new("kill -INT $$", "/tmp");
        let mut process = PtyProcess::spawn(&config).unwrap();
        let (exit, _) = run_to_exit(&mut process);
        assert_eq!(exit.code, 130);
        assert!(exit.interrupted());
    }
}
