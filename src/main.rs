use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use ttyjobs::cli::{Cli, Command};
use ttyjobs::config::{CONFIG_DIR, ProjectConfig};
use ttyjobs::log::{ExecutionLog, LogEvent};
use ttyjobs::monitor::ExecutionResult;
use ttyjobs::safety::TerminalConfirmer;
use ttyjobs::{SessionEvent, SessionManager, TerminalTakeover, paths, repl, shell_completion};

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| format!("(defaults, no {CONFIG_DIR}/config.toml found)"))
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn push_list(output: &mut String, key: &str, values: &[String]) {
    if values.is_empty() {
        push_kv(output, key, "(none)");
        return;
    }
    push_kv(output, key, "");
    for value in values {
        output.push_str(&format!("    - {value}\n"));
    }
}

fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    let m = &config.monitor;
    output.push_str("Monitor\n");
    push_kv(&mut output, "poll_interval", format!("{}ms", m.poll_interval_millis));
    push_kv(&mut output, "silence_timeout", format!("{}s", m.silence_timeout_secs));
    push_kv(&mut output, "prompt_tail_lines", m.prompt_tail_lines);
    push_kv(&mut output, "drain_idle", format!("{}ms", m.drain_idle_millis));
    push_kv(&mut output, "default_timeout", format!("{}s", m.default_timeout_secs));
    push_kv(&mut output, "input_timeout", format!("{}s", m.input_timeout_secs));
    push_kv(&mut output, "kill_grace", format!("{}ms", m.kill_grace_millis));
    push_kv(&mut output, "normalize_newlines", m.normalize_newlines);
    output.push('\n');

    output.push_str("PTY\n");
    push_kv(&mut output, "shell", &config.pty.shell);
    push_kv(&mut output, "size", format!("{}x{}", config.pty.rows, config.pty.cols));
    push_kv(&mut output, "term", &config.pty.term);
    let env: Vec<String> = config
        .pty
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    push_list(&mut output, "env", &env);
    output.push('\n');

    output.push_str("Safety\n");
    push_list(&mut output, "block", &config.safety.block);
    push_list(&mut output, "confirm", &config.safety.confirm);
    output.push('\n');

    output.push_str("Prompt\n");
    push_list(&mut output, "keywords", &config.prompt.keywords);
    output.push('\n');

    output.push_str("Log\n");
    push_kv(&mut output, "enabled", config.log.enabled);
    push_kv(&mut output, "path", config.log.path.display());
    push_kv(&mut output, "include_output", config.log.include_output);
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    payload["source_path"] = serde_json::Value::String(config_source_label(config_path));
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

/// Process exit status for a finished `exec`.
fn exit_code(result: &ExecutionResult) -> i32 {
    match result {
        ExecutionResult::Finished { exit_code, .. } => (*exit_code).clamp(0, 255),
        ExecutionResult::Blocked { .. } | ExecutionResult::Cancelled => 1,
        _ => 0,
    }
}

/// Forwards session events to stdout and the execution log until every
/// sender is dropped.
fn spawn_event_sink(
    events: mpsc::Receiver<SessionEvent>,
    stream_output: bool,
    log: Option<Arc<ExecutionLog>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut stdout = std::io::stdout();
        for event in events {
            if stream_output {
                if let SessionEvent::Output { text, .. } = &event {
                    let _ = stdout.write_all(text.as_bytes());
                    let _ = stdout.flush();
                }
            }
            if let Some(log) = &log {
                if let Err(e) = log.log(LogEvent::from(&event)) {
                    warn!("execution log write failed: {e:#}");
                }
            }
        }
    })
}

fn open_log(config: &ProjectConfig, config_path: Option<&Path>, cwd: &Path) -> Option<Arc<ExecutionLog>> {
    if !config.log.enabled {
        return None;
    }
    let root = paths::project_root(config_path, cwd);
    let path = paths::resolve(&root, &config.log.path);
    match ExecutionLog::new(&path) {
        Ok(log) => {
            info!("execution log: {}", log.path().display());
            let log = if config.log.include_output {
                log
            } else {
                log.without_output()
            };
            Some(Arc::new(log))
        }
        Err(e) => {
            warn!("execution log disabled: {e:#}");
            None
        }
    }
}

fn install_interrupt_handler(sessions: &SessionManager) -> Result<()> {
    let interrupt = sessions.interrupt_handle();
    ctrlc::set_handler(move || interrupt.store(true, Ordering::SeqCst))
        .context("failed to install Ctrl-C handler")
}

fn log_event(log: Option<&Arc<ExecutionLog>>, event: LogEvent) {
    if let Some(log) = log {
        if let Err(e) = log.log(event) {
            warn!("execution log write failed: {e:#}");
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 => "ttyjobs=warn",
        1 => "ttyjobs=info",
        2 => "ttyjobs=debug",
        _ => "ttyjobs=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no {CONFIG_DIR}/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Exec {
            command,
            timeout,
            cwd: exec_cwd,
            json,
            yes,
        } => {
            let command = command.join(" ");
            let run_cwd = exec_cwd.unwrap_or_else(|| cwd.clone());
            let session_config = config.session_config();
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or(session_config.default_timeout);

            let log = open_log(&config, config_path.as_deref(), &cwd);
            let (tx, rx) = mpsc::channel();
            let sink = spawn_event_sink(rx, !json, log.clone());

            let mut sessions = SessionManager::new(session_config)
                .with_gate(config.safety_gate()?)
                .with_events(tx);
            sessions = if yes {
                sessions.with_confirmer(|_: &str, _: &str| true)
            } else {
                sessions.with_confirmer(TerminalConfirmer)
            };
            if !json {
                sessions = sessions.with_takeover(TerminalTakeover::default());
            }
            install_interrupt_handler(&sessions)?;

            log_event(
                log.as_ref(),
                LogEvent::SessionStarted {
                    command: command.clone(),
                },
            );
            let result = sessions.execute(&command, timeout, &run_cwd)?;
            log_event(log.as_ref(), LogEvent::from(&result));

            if let Some(pid) = result.pid().filter(|_| result.is_detached()) {
                eprintln!("ttyjobs: terminating job {pid} on exit");
            }
            sessions.shutdown();
            drop(sessions);
            if sink.join().is_err() {
                warn!("event sink thread panicked");
            }

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result).context("failed to serialize result")?
                );
            } else {
                if let Some(output) = result.output() {
                    if !output.is_empty() && !output.ends_with('\n') {
                        println!();
                    }
                }
                eprintln!("ttyjobs: {result}");
            }

            std::process::exit(exit_code(&result));
        }
        Command::Repl { no_takeover } => {
            let session_config = config.session_config();
            let timeout = session_config.default_timeout;
            let log = open_log(&config, config_path.as_deref(), &cwd);
            let (tx, rx) = mpsc::channel();
            let sink = spawn_event_sink(rx, true, log);

            let mut sessions = SessionManager::new(session_config)
                .with_gate(config.safety_gate()?)
                .with_confirmer(TerminalConfirmer)
                .with_events(tx);
            if !no_takeover {
                sessions = sessions.with_takeover(TerminalTakeover::default());
            }
            install_interrupt_handler(&sessions)?;

            repl::run(&sessions, &cwd, timeout)?;
            drop(sessions);
            if sink.join().is_err() {
                warn!("event sink thread panicked");
            }
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
        Command::Completions { shell } => {
            shell_completion::print(shell)?;
        }
    }

    Ok(())
}
