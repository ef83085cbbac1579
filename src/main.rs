mod backend;
mod cli;
mod commands;
mod config;
mod state;
mod topology;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub quiet: bool,
    pub config: PathBuf,
    pub state_dir: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        quiet: cli.quiet,
        config: cli.config,
        state_dir: cli.state_dir,
    };

    match cli.command {
        Command::Plan => commands::plan::run(&ctx),
        Command::Apply(args) => commands::apply::run(&ctx, &args),
        Command::Outputs { json } => commands::outputs::run(&ctx, json),
        Command::State => commands::state::run(&ctx),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "vmstack", &mut io::stdout());
            Ok(())
        }
    }
}
