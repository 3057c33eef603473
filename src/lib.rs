//! Run shell commands inside pseudo-terminals, notice when they stop to ask
//! a question, and keep the ones that outlive a call in a job table keyed by
//! pid.
//!
//! [`SessionManager`] is the entry point: `execute`, `send_input`, `kill`,
//! `read_output` and `list_jobs`.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod log;
pub mod monitor;
pub mod paths;
pub mod prompt;
pub mod pty;
pub mod repl;
pub mod safety;
pub mod session;
pub mod shell_completion;
pub mod takeover;

pub use error::{Result, SessionError};
pub use events::{BackgroundReason, SessionEvent};
pub use jobs::JobSummary;
pub use monitor::{ExecutionResult, MonitorConfig};
pub use prompt::PromptHeuristic;
pub use pty::{ChildProcess, ExitInfo, ReadOutcome, SpawnConfig, Spawner};
pub use safety::{Confirmer, PatternGate, SafetyGate, Verdict};
pub use session::{SessionConfig, SessionManager};
pub use takeover::{NoopTakeover, Takeover, TerminalTakeover};
