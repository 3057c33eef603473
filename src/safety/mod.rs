//! Safety gate consulted before any command is spawned.

use dialoguer::Confirm;
use regex::Regex;
use tracing::debug;

use crate::error::{Result, SessionError};

/// Patterns refused outright.
pub const DEFAULT_BLOCK_PATTERNS: &[&str] = &[
    r"rm\s+-rf\s+/",
    r"curl.*\|\s*sh",
    r"wget.*\|\s*sh",
    r"chmod\s+.*777",
    r"\.git/",
];

/// Patterns that need a human to say yes.
pub const DEFAULT_CONFIRM_PATTERNS: &[&str] = &[
    r"\brm\b",
    r"\bmv\b",
    r"\bsudo\b",
    r"\bdd\b",
    r"\bkill\b",
    r"\bchmod\b",
    r"\bchown\b",
    r"\breboot\b",
    r"\bshutdown\b",
    r"\binit\b",
    r"\bmkfs\b",
    r"\bformat\b",
];

/// What the gate decides about a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Never run it.
    Blocked { reason: String },
    /// Run it only if the confirmer agrees.
    NeedsConfirmation { reason: String },
    /// Run it.
    Allowed,
}

/// Decides whether a command may run.
pub trait SafetyGate: Send + Sync {
    fn evaluate(&self, command: &str) -> Verdict;
}

/// Asks a human whether a risky command should run.
pub trait Confirmer: Send + Sync {
    /// `true` to proceed.
    fn confirm(&self, command: &str, reason: &str) -> bool;
}

impl<F> Confirmer for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn confirm(&self, command: &str, reason: &str) -> bool {
        self(command, reason)
    }
}

/// Regex-based gate: block list first, then confirm list.
#[derive(Debug, Clone)]
pub struct PatternGate {
    block: Vec<Regex>,
    confirm: Vec<Regex>,
}

impl PatternGate {
    pub fn new<S: AsRef<str>>(block: &[S], confirm: &[S]) -> Result<Self> {
        Ok(Self {
            block: compile(block)?,
            confirm: compile(confirm)?,
        })
    }

    /// Gate that allows everything.
    pub fn permissive() -> Self {
        Self {
            block: Vec::new(),
            confirm: Vec::new(),
        }
    }
}

impl Default for PatternGate {
    fn default() -> Self {
        Self {
            block: DEFAULT_BLOCK_PATTERNS
                .iter()
                .map(|p| Regex::new(p).expect("built-in block pattern is valid"))
                .collect(),
            confirm: DEFAULT_CONFIRM_PATTERNS
                .iter()
                .map(|p| Regex::new(p).expect("built-in confirm pattern is valid"))
                .collect(),
        }
    }
}

fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p.as_ref()).map_err(|source| SessionError::InvalidPattern {
                pattern: p.as_ref().to_string(),
                source,
            })
        })
        .collect()
}

impl SafetyGate for PatternGate {
    fn evaluate(&self, command: &str) -> Verdict {
        if let Some(re) = self.block.iter().find(|re| re.is_match(command)) {
            debug!(command, pattern = re.as_str(), "command blocked");
            return Verdict::Blocked {
                reason: format!("command '{command}' is blocked by safety policy ({})", re.as_str()),
            };
        }
        if let Some(re) = self.confirm.iter().find(|re| re.is_match(command)) {
            return Verdict::NeedsConfirmation {
                reason: format!("command '{command}' matches '{}'", re.as_str()),
            };
        }
        Verdict::Allowed
    }
}

/// Prompts on the controlling terminal. Declines when no terminal is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirmer;

impl Confirmer for TerminalConfirmer {
    fn confirm(&self, command: &str, reason: &str) -> bool {
        debug!(command, reason, "asking for confirmation");
        Confirm::new()
            .with_prompt(format!("Run potentially dangerous command `{command}`?"))
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

/// Declines everything; for non-interactive use.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl Confirmer for DenyAll {
    fn confirm(&self, _command: &str, _reason: &str) -> bool {
        false
    }
}
