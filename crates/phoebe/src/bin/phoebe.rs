//! CLI entrypoint for the Phoebe wiki server.

#[path = "phoebe/cli.rs"]
mod cli;
#[path = "phoebe/run.rs"]
mod run;

use clap::{CommandFactory, Parser};

use cli::{Cli, Command};

fn main() {
    let cli = Cli::parse();
    if let Some(Command::Completions { shell }) = &cli.command {
        clap_complete::generate(
            *shell,
            &mut Cli::command(),
            "phoebe",
            &mut std::io::stdout(),
        );
        return;
    }
    let log = match run::init_logging(&cli) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("Error: {err:#}");
            std::process::exit(1);
        }
    };
    if let Err(err) = run::run(&cli, &log) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
