use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "ttyjobs",
    about = "Run shell commands in a PTY, answer their prompts, and manage the ones left running",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one command and report how it ended
    Exec {
        /// Command line, passed to the shell verbatim
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,

        /// Seconds before the command is moved to the background
        #[arg(long)]
        timeout: Option<u64>,

        /// Working directory (defaults to the current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Print the result as JSON instead of streaming output
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Skip confirmation for risky commands
        #[arg(long, short = 'y', default_value_t = false)]
        yes: bool,
    },

    /// Interactive shell for running commands and managing background jobs
    Repl {
        /// Do not hand prompts to the terminal; report them instead
        #[arg(long, default_value_t = false)]
        no_takeover: bool,
    },

    /// Show project configuration
    Config {
        /// Emit machine-readable JSON output
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_collects_trailing_words() {
        let cli = Cli::parse_from(["ttyjobs", "exec", "--timeout", "3", "ls", "-la", "/tmp"]);
        match cli.command {
            Command::Exec {
                command, timeout, ..
            } => {
                assert_eq!(command, vec!["ls", "-la", "/tmp"]);
                assert_eq!(timeout, Some(3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn verbose_is_global_and_counted() {
        let cli = Cli::parse_from(["ttyjobs", "config", "-vv"]);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::Config { json: false }));
    }

    #[test]
    fn exec_requires_a_command() {
        assert!(Cli::try_parse_from(["ttyjobs", "exec"]).is_err());
    }

    #[test]
    fn completions_parse_shell() {
        let cli = Cli::parse_from(["ttyjobs", "completions", "zsh"]);
        assert!(matches!(
            cli.command,
            Command::Completions {
                shell: CompletionShell::Zsh
            }
        ));
    }
}
