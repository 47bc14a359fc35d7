use clap::CommandFactory;
use clap_complete::{generate, Shell};

use crate::args::Cli;

pub(crate) fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "devrun", &mut std::io::stdout());
}
