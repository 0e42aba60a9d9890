use std::sync::OnceLock;

use clap::Parser;

/// Continuous deployment agent for docker compose stacks.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Validate configuration and repository access, then exit.
    #[arg(long)]
    pub test: bool,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
