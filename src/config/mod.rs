use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::monitor::MonitorConfig;
use crate::prompt::{DEFAULT_PROMPT_KEYWORDS, DEFAULT_TAIL_LINES, PromptHeuristic};
use crate::safety::{DEFAULT_BLOCK_PATTERNS, DEFAULT_CONFIRM_PATTERNS, PatternGate};
use crate::session::SessionConfig;

const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".ttyjobs";

fn default_poll_interval_millis() -> u64 {
    500
}

fn default_silence_timeout_secs() -> u64 {
    5
}

fn default_prompt_tail_lines() -> usize {
    DEFAULT_TAIL_LINES
}

fn default_drain_idle_millis() -> u64 {
    200
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_input_timeout_secs() -> u64 {
    10
}

fn default_kill_grace_millis() -> u64 {
    1000
}

fn default_normalize_newlines() -> bool {
    true
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_block_patterns() -> Vec<String> {
    DEFAULT_BLOCK_PATTERNS.iter().map(|s| s.to_string()).collect()
}

fn default_confirm_patterns() -> Vec<String> {
    DEFAULT_CONFIRM_PATTERNS.iter().map(|s| s.to_string()).collect()
}

fn default_keywords() -> Vec<String> {
    DEFAULT_PROMPT_KEYWORDS.iter().map(|s| s.to_string()).collect()
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_include_output() -> bool {
    true
}

fn default_log_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("logs").join("sessions.jsonl")
}

/// Monitor loop timing.
///
/// ```toml
/// [monitor]
/// poll_interval_millis = 500
/// silence_timeout_secs = 5
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorSettings {
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    #[serde(default = "default_silence_timeout_secs")]
    pub silence_timeout_secs: u64,
    #[serde(default = "default_prompt_tail_lines")]
    pub prompt_tail_lines: usize,
    #[serde(default = "default_drain_idle_millis")]
    pub drain_idle_millis: u64,
    /// Timeout for `exec` when none is given.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Timeout for the monitor pass after sending input.
    #[serde(default = "default_input_timeout_secs")]
    pub input_timeout_secs: u64,
    #[serde(default = "default_kill_grace_millis")]
    pub kill_grace_millis: u64,
    #[serde(default = "default_normalize_newlines")]
    pub normalize_newlines: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_millis: default_poll_interval_millis(),
            silence_timeout_secs: default_silence_timeout_secs(),
            prompt_tail_lines: default_prompt_tail_lines(),
            drain_idle_millis: default_drain_idle_millis(),
            default_timeout_secs: default_timeout_secs(),
            input_timeout_secs: default_input_timeout_secs(),
            kill_grace_millis: default_kill_grace_millis(),
            normalize_newlines: default_normalize_newlines(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PtySettings {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_term")]
    pub term: String,
    /// Extra environment variables, as a `[pty.env]` table.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for PtySettings {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            rows: default_rows(),
            cols: default_cols(),
            term: default_term(),
            env: BTreeMap::new(),
        }
    }
}

/// Regex lists for the safety gate. Setting either list replaces the
/// built-in one.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SafetySettings {
    #[serde(default = "default_block_patterns")]
    pub block: Vec<String>,
    #[serde(default = "default_confirm_patterns")]
    pub confirm: Vec<String>,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            block: default_block_patterns(),
            confirm: default_confirm_patterns(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromptSettings {
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            keywords: default_keywords(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSettings {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Relative paths resolve against the project root.
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    /// Record streamed output events; results are always recorded.
    #[serde(default = "default_log_include_output")]
    pub include_output: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            path: default_log_path(),
            include_output: default_log_include_output(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub pty: PtySettings,
    #[serde(default)]
    pub safety: SafetySettings,
    #[serde(default)]
    pub prompt: PromptSettings,
    #[serde(default)]
    pub log: LogSettings,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.ttyjobs/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Session tuning derived from the `[monitor]`, `[pty]` and `[prompt]`
    /// sections.
    pub fn session_config(&self) -> SessionConfig {
        let m = &self.monitor;
        SessionConfig {
            monitor: MonitorConfig {
                poll_interval: Duration::from_millis(m.poll_interval_millis),
                silence_timeout: Duration::from_secs(m.silence_timeout_secs),
                drain_idle: Duration::from_millis(m.drain_idle_millis),
                kill_grace: Duration::from_millis(m.kill_grace_millis),
            },
            default_timeout: Duration::from_secs(m.default_timeout_secs),
            input_timeout: Duration::from_secs(m.input_timeout_secs),
            normalize_newlines: m.normalize_newlines,
            shell: self.pty.shell.clone(),
            term: self.pty.term.clone(),
            env: self
                .pty
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            rows: self.pty.rows,
            cols: self.pty.cols,
            heuristic: PromptHeuristic::new(self.prompt.keywords.clone(), m.prompt_tail_lines),
        }
    }

    /// Safety gate built from the `[safety]` section.
    pub fn safety_gate(&self) -> Result<PatternGate> {
        PatternGate::new(&self.safety.block, &self.safety.confirm)
            .context("invalid [safety] configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::{SafetyGate, Verdict};
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.monitor.poll_interval_millis, 500);
        assert_eq!(config.monitor.silence_timeout_secs, 5);
        assert_eq!(config.monitor.prompt_tail_lines, 5);
        assert_eq!(config.monitor.drain_idle_millis, 200);
        assert_eq!(config.monitor.default_timeout_secs, 10);
        assert_eq!(config.monitor.input_timeout_secs, 10);
        assert!(config.monitor.normalize_newlines);
        assert_eq!(config.pty.shell, "/bin/sh");
        assert_eq!((config.pty.rows, config.pty.cols), (24, 80));
        assert_eq!(config.pty.term, "xterm-256color");
        assert_eq!(config.safety.block.len(), DEFAULT_BLOCK_PATTERNS.len());
        assert_eq!(config.prompt.keywords, default_keywords());
        assert!(config.pty.env.is_empty());
        assert!(config.log.enabled);
        assert!(config.log.include_output);
        assert_eq!(
            config.log.path,
            PathBuf::from(".ttyjobs/logs/sessions.jsonl")
        );
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[monitor]
poll_interval_millis = 100
silence_timeout_secs = 2
prompt_tail_lines = 3
drain_idle_millis = 50
default_timeout_secs = 30
input_timeout_secs = 4
kill_grace_millis = 250
normalize_newlines = false

[pty]
shell = "/bin/bash"
rows = 40
cols = 120
term = "dumb"

[pty.env]
LANG = "C.UTF-8"
APP_MODE = "test"

[safety]
block = ['^shutdown']
confirm = []

[prompt]
keywords = ["passphrase"]

[log]
enabled = false
path = "/var/tmp/ttyjobs.jsonl"
include_output = false
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        let session = config.session_config();
        assert_eq!(session.monitor.poll_interval, Duration::from_millis(100));
        assert_eq!(session.monitor.silence_timeout, Duration::from_secs(2));
        assert_eq!(session.monitor.drain_idle, Duration::from_millis(50));
        assert_eq!(session.default_timeout, Duration::from_secs(30));
        assert_eq!(session.input_timeout, Duration::from_secs(4));
        assert_eq!(session.monitor.kill_grace, Duration::from_millis(250));
        assert!(!session.normalize_newlines);
        assert_eq!(session.shell, "/bin/bash");
        assert_eq!((session.rows, session.cols), (40, 120));
        assert_eq!(session.term, "dumb");
        assert_eq!(
            session.env,
            vec![
                ("APP_MODE".to_string(), "test".to_string()),
                ("LANG".to_string(), "C.UTF-8".to_string()),
            ]
        );
        assert_eq!(session.heuristic.tail_lines(), 3);
        assert!(session.heuristic.is_interactive("Enter passphrase for key now"));
        assert!(!config.log.enabled);
        assert!(!config.log.include_output);

        let gate = config.safety_gate().unwrap();
        assert!(matches!(gate.evaluate("shutdown -h now"), Verdict::Blocked { .. }));
        assert_eq!(gate.evaluate("rm file"), Verdict::Allowed);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[monitor]
silence_timeout_secs = 9
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.monitor.silence_timeout_secs, 9);
        assert_eq!(config.monitor.poll_interval_millis, 500);
        assert_eq!(config.pty.shell, "/bin/sh");
        assert_eq!(config.safety.confirm.len(), DEFAULT_CONFIRM_PATTERNS.len());
    }

    #[test]
    fn invalid_safety_pattern_is_an_error() {
        let config: ProjectConfig = toml::from_str("[safety]\nblock = ['(']\n").unwrap();
        let err = config.safety_gate().unwrap_err();
        assert!(format!("{err:#}").contains("invalid safety pattern"));
    }

    #[test]
    fn load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".ttyjobs");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[pty]
rows = 50
"#,
        )
        .unwrap();

        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert_eq!(path, Some(dir.join("config.toml")));
        assert_eq!(config.pty.rows, 50);
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.monitor.silence_timeout_secs, 5);
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".ttyjobs");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.toml"), "[monitor\n").unwrap();

        let err = ProjectConfig::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".ttyjobs");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[monitor]
default_timeout_secs = 42
"#,
        )
        .unwrap();

        let nested = tmp.path().join("src").join("deep").join("nested");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.monitor.default_timeout_secs, 42);
    }

    #[test]
    fn config_round_trips_through_json() {
        let json = serde_json::to_value(ProjectConfig::default()).unwrap();
        assert_eq!(json["monitor"]["silence_timeout_secs"], 5);
        assert_eq!(json["pty"]["term"], "xterm-256color");
    }
}
