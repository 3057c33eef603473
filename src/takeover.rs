//! Handing a prompting process to the human at the terminal.
//!
//! When a fresh command stops at a prompt, the monitor loop calls a
//! [`Takeover`]. The production one puts the local terminal in raw mode and
//! relays keystrokes and output until the process exits or the user presses
//! the detach key (Ctrl-]), which leaves the process running as a job.

use std::io::{self, Write};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::pty::{ExitInfo, ProcessIo, ReadOutcome};

/// Ctrl-], the conventional telnet escape.
pub const DETACH_KEY: u8 = 0x1d;

/// How the takeover ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TakeoverOutcome {
    /// The user detached; the process keeps running.
    StillAlive,
    /// The process exited while the user was attached.
    Exited(ExitInfo),
}

/// Interactive handoff collaborator.
pub trait Takeover: Send + Sync {
    /// Interact with `io` until it exits or the user lets go. Output seen
    /// along the way is appended to `output`.
    fn take_over(&self, io: &mut ProcessIo, output: &mut String) -> Result<TakeoverOutcome>;
}

/// Does nothing; the process is reported as paused straight away.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTakeover;

impl Takeover for NoopTakeover {
    fn take_over(&self, _io: &mut ProcessIo, _output: &mut String) -> Result<TakeoverOutcome> {
        Ok(TakeoverOutcome::StillAlive)
    }
}

/// Relays the controlling terminal to the process.
#[derive(Debug, Clone)]
pub struct TerminalTakeover {
    /// Read wait on the process side of each relay pass.
    pub poll: Duration,
}

impl Default for TerminalTakeover {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(20),
        }
    }
}

impl Takeover for TerminalTakeover {
    fn take_over(&self, io: &mut ProcessIo, output: &mut String) -> Result<TakeoverOutcome> {
        #[cfg(unix)]
        {
            if !raw::stdin_is_tty() {
                debug!(pid = io.pid(), "stdin is not a terminal, skipping takeover");
                return Ok(TakeoverOutcome::StillAlive);
            }
            self.relay(io, output).map_err(SessionError::Takeover)
        }
        #[cfg(not(unix))]
        {
            let _ = output;
            warn!(pid = io.pid(), "terminal takeover is only supported on unix");
            Ok(TakeoverOutcome::StillAlive)
        }
    }
}

#[cfg(unix)]
impl TerminalTakeover {
    fn relay(&self, io: &mut ProcessIo, output: &mut String) -> io::Result<TakeoverOutcome> {
        let pid = io.pid();
        let mut stdout = io::stdout();
        writeln!(stdout, "\r\n[ttyjobs] attached to pid {pid}; press Ctrl-] to detach\r")?;
        stdout.flush()?;

        let _guard = raw::RawMode::enable()?;
        info!(pid, "terminal takeover started");

        let mut input = [0u8; 1024];
        loop {
            if let Some(exit) = io.try_exit()? {
                let tail = io.drain_text(Duration::from_millis(100));
                stdout.write_all(tail.as_bytes())?;
                stdout.flush()?;
                output.push_str(&tail);
                info!(pid, code = exit.code, "process exited during takeover");
                return Ok(TakeoverOutcome::Exited(exit));
            }

            if raw::stdin_ready(self.poll)? {
                let n = raw::read_stdin(&mut input)?;
                if n == 0 {
                    debug!(pid, "stdin closed, detaching");
                    return Ok(TakeoverOutcome::StillAlive);
                }
                let typed = &input[..n];
                if let Some(pos) = typed.iter().position(|b| *b == DETACH_KEY) {
                    io.write_all(&typed[..pos])?;
                    info!(pid, "detached from process");
                    return Ok(TakeoverOutcome::StillAlive);
                }
                io.write_all(typed)?;
            }

            match io.read(self.poll) {
                ReadOutcome::Data(bytes) => {
                    let text = io.decode(&bytes);
                    stdout.write_all(text.as_bytes())?;
                    stdout.flush()?;
                    output.push_str(&text);
                }
                ReadOutcome::Timeout | ReadOutcome::Eof => {}
                ReadOutcome::Error(e) => warn!(pid, error = %e, "read failed during takeover"),
            }
        }
    }
}

#[cfg(unix)]
mod raw {
    use std::io;
    use std::time::Duration;

    pub fn stdin_is_tty() -> bool {
        // SAFETY: isatty only inspects the descriptor.
        unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
    }

    /// Restores the saved terminal attributes on drop.
    pub struct RawMode {
        saved: libc::termios,
    }

    impl RawMode {
        pub fn enable() -> io::Result<Self> {
            // SAFETY: termios is plain data; tcgetattr fills it in.
            let mut saved: libc::termios = unsafe { std::mem::zeroed() };
            if unsafe { libc::tcgetattr(libc::STDIN_FILENO, &mut saved) } != 0 {
                return Err(io::Error::last_os_error());
            }
            let mut raw = saved;
            // SAFETY: raw is a valid termios copied from the terminal.
            unsafe { libc::cfmakeraw(&mut raw) };
            if unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { saved })
        }
    }

    impl Drop for RawMode {
        fn drop(&mut self) {
            // SAFETY: restoring attributes captured in `enable`.
            unsafe {
                libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.saved);
            }
        }
    }

    pub fn stdin_ready(timeout: Duration) -> io::Result<bool> {
        let mut fds = libc::pollfd {
            fd: libc::STDIN_FILENO,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        // SAFETY: one valid pollfd.
        let rc = unsafe { libc::poll(&mut fds, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(rc > 0 && fds.revents & libc::POLLIN != 0)
    }

    pub fn read_stdin(buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for buf.len() bytes.
        let n = unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}
