//! Shell completion generation for the ttyjobs CLI.

use std::io::{self, Write};

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::{Shell, generate};

use crate::cli::{Cli, CompletionShell};

fn to_shell(shell: CompletionShell) -> Shell {
    match shell {
        CompletionShell::Bash => Shell::Bash,
        CompletionShell::Zsh => Shell::Zsh,
        CompletionShell::Fish => Shell::Fish,
    }
}

pub fn write(shell: CompletionShell, out: &mut dyn Write) -> Result<()> {
    let mut cmd = Cli::command();
    generate(to_shell(shell), &mut cmd, "ttyjobs", out);
    Ok(())
}

pub fn print(shell: CompletionShell) -> Result<()> {
    write(shell, &mut io::stdout())
}
