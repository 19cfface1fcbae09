//! Reflex Agent Binary
//!
//! Command-line entry point for the endpoint agent.

use anyhow::Context;
use clap::Parser;
use reflex_agent::logging::init_logging;
use reflex_agent::tooling::cli::{Cli, CliContext};
use std::process;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = match cli.logging_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };
    if let Err(e) = init_logging(&logging) {
        eprintln!("Warning: {}", e);
    }

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let context = CliContext::new(&cli.load_options()).context("failed to initialize agent")?;
    let commands = cli.commands(context.env_file())?;

    for command in &commands {
        let output = context.execute(command).await?;
        if !output.is_empty() {
            println!("{}", output);
        }
    }
    Ok(())
}
