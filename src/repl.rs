//! Line-oriented shell over one session manager, so background jobs can be
//! revisited by pid between commands.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::jobs::JobSummary;
use crate::monitor::ExecutionResult;
use crate::session::SessionManager;

const HELP: &str = "\
commands:
  exec <command>       run a command (alias: !<command>)
  send <pid> <text>    type a line into a job
  read <pid>           show output since the last read
  kill <pid>           terminate a job
  jobs                 list background jobs
  help                 show this help
  quit                 kill remaining jobs and leave";

#[derive(Debug, PartialEq, Eq)]
pub enum ReplCommand {
    Exec(String),
    Send { pid: u32, text: String },
    Read(u32),
    Kill(u32),
    Jobs,
    Help,
    Quit,
    Empty,
}

fn parse_pid(word: Option<&str>, usage: &str) -> Result<u32> {
    let word = word.with_context(|| format!("usage: {usage}"))?;
    word.parse()
        .with_context(|| format!("'{word}' is not a pid (usage: {usage})"))
}

/// Parse one input line.
pub fn parse_line(line: &str) -> Result<ReplCommand> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ReplCommand::Empty);
    }
    if let Some(command) = line.strip_prefix('!') {
        return Ok(ReplCommand::Exec(command.trim().to_string()));
    }

    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim_start();
    match verb {
        "exec" | "run" => {
            if rest.is_empty() {
                bail!("usage: exec <command>");
            }
            Ok(ReplCommand::Exec(rest.to_string()))
        }
        "send" => {
            let (pid, text) = rest.split_once(' ').unwrap_or((rest, ""));
            Ok(ReplCommand::Send {
                pid: parse_pid(Some(pid).filter(|p| !p.is_empty()), "send <pid> <text>")?,
                text: text.to_string(),
            })
        }
        "read" => Ok(ReplCommand::Read(parse_pid(
            rest.split_whitespace().next(),
            "read <pid>",
        )?)),
        "kill" => Ok(ReplCommand::Kill(parse_pid(
            rest.split_whitespace().next(),
            "kill <pid>",
        )?)),
        "jobs" | "ls" => Ok(ReplCommand::Jobs),
        "help" | "?" => Ok(ReplCommand::Help),
        "quit" | "exit" => Ok(ReplCommand::Quit),
        other => bail!("unknown command '{other}' (try 'help')"),
    }
}

pub fn render_jobs(jobs: &[JobSummary]) -> String {
    if jobs.is_empty() {
        return "no background jobs".to_string();
    }
    let mut out = String::new();
    for job in jobs {
        let state = if job.alive { "running" } else { "exited" };
        out.push_str(&format!(
            "{:>7}  {:<8} {:>8}B {:>6}s idle  {}  ({})\n",
            job.pid,
            state,
            job.output_len,
            job.idle_millis / 1000,
            job.command,
            job.cwd.display()
        ));
    }
    out.pop();
    out
}

/// Report a result after its output has already been streamed.
fn report(out: &mut impl Write, result: &ExecutionResult) -> io::Result<()> {
    if let Some(output) = result.output() {
        if !output.is_empty() && !output.ends_with('\n') {
            writeln!(out)?;
        }
    }
    writeln!(out, "[{result}]")
}

/// Run the loop until `quit` or end of input.
pub fn run(sessions: &SessionManager, cwd: &Path, timeout: Duration) -> Result<()> {
    let stdin = io::stdin();
    let mut out = io::stdout();
    writeln!(out, "ttyjobs repl; type 'help' for commands")?;

    loop {
        write!(out, "ttyjobs> ")?;
        out.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            writeln!(out)?;
            break;
        }

        let command = match parse_line(&line) {
            Ok(command) => command,
            Err(e) => {
                writeln!(out, "{e}")?;
                continue;
            }
        };

        let outcome: Result<()> = match command {
            ReplCommand::Empty => Ok(()),
            ReplCommand::Help => writeln!(out, "{HELP}").map_err(Into::into),
            ReplCommand::Quit => break,
            ReplCommand::Jobs => {
                writeln!(out, "{}", render_jobs(&sessions.list_jobs())).map_err(Into::into)
            }
            ReplCommand::Exec(command) => sessions
                .execute(&command, timeout, cwd)
                .map_err(anyhow::Error::from)
                .and_then(|r| report(&mut out, &r).map_err(Into::into)),
            ReplCommand::Send { pid, text } => sessions
                .send_input(pid, &text)
                .map_err(anyhow::Error::from)
                .and_then(|r| report(&mut out, &r).map_err(Into::into)),
            ReplCommand::Read(pid) => sessions
                .read_output(pid)
                .map_err(anyhow::Error::from)
                .and_then(|text| write!(out, "{text}").map_err(Into::into)),
            ReplCommand::Kill(pid) => sessions
                .kill(pid)
                .map_err(anyhow::Error::from)
                .and_then(|()| writeln!(out, "killed {pid}").map_err(Into::into)),
        };
        if let Err(e) = outcome {
            writeln!(out, "error: {e:#}")?;
        }
    }

    sessions.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parses_exec_forms() {
        assert_eq!(
            parse_line("exec ls -la").unwrap(),
            ReplCommand::Exec("ls -la".to_string())
        );
        assert_eq!(
            parse_line("  !make test ").unwrap(),
            ReplCommand::Exec("make test".to_string())
        );
        assert!(parse_line("exec").is_err());
    }

    #[test]
    fn parses_send_with_spaces_in_text() {
        assert_eq!(
            parse_line("send 42 yes please").unwrap(),
            ReplCommand::Send {
                pid: 42,
                text: "yes please".to_string()
            }
        );
        assert_eq!(
            parse_line("send 42").unwrap(),
            ReplCommand::Send {
                pid: 42,
                text: String::new()
            }
        );
        assert!(parse_line("send").is_err());
        assert!(parse_line("send abc y").is_err());
    }

    #[test]
    fn parses_pid_commands() {
        assert_eq!(parse_line("read 7").unwrap(), ReplCommand::Read(7));
        assert_eq!(parse_line("kill 7").unwrap(), ReplCommand::Kill(7));
        assert!(parse_line("kill").is_err());
        assert!(parse_line("kill -9").is_err());
    }

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_line("jobs").unwrap(), ReplCommand::Jobs);
        assert_eq!(parse_line("help").unwrap(), ReplCommand::Help);
        assert_eq!(parse_line("exit").unwrap(), ReplCommand::Quit);
        assert_eq!(parse_line("   ").unwrap(), ReplCommand::Empty);
        assert!(parse_line("frobnicate").is_err());
    }

    #[test]
    fn renders_job_rows() {
        assert_eq!(render_jobs(&[]), "no background jobs");

        let rows = render_jobs(&[JobSummary {
            pid: 1234,
            alive: true,
            command: "sleep 20".to_string(),
            cwd: PathBuf::from("/tmp"),
            output_len: 0,
            idle_millis: 12_500,
        }]);
        assert!(rows.contains("1234"));
        assert!(rows.contains("running"));
        assert!(rows.contains("sleep 20"));
        assert!(rows.contains("12s idle"));
        assert!(!rows.ends_with('\n'));
    }

    #[test]
    fn report_ends_partial_line() {
        let mut buf = Vec::new();
        report(
            &mut buf,
            &ExecutionResult::Paused {
                pid: 3,
                output: "Continue?".to_string(),
            },
        )
        .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "\n[paused at a prompt; pid 3 is waiting]\n");
    }
}
