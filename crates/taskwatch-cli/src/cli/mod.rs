//! CLI argument parsing and command dispatch.

pub mod args;
pub mod commands;

use anyhow::Result;
use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Run the CLI application.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);
    if cli.no_color {
        colored::control::set_override(false);
    }

    // Load configuration
    let config = Config::load()?;

    // Flag, then config file, then the default
    let output_format = cli.output.or(config.output_format).unwrap_or_default();

    // `--api-key` and VT_API_KEY both arrive through clap
    let api_key = cli.api_key.or_else(|| config.api_key.clone());

    let ctx = commands::Context {
        config,
        api_key,
        output_format,
        verbose: cli.verbose,
        no_color: cli.no_color,
    };

    match cli.command {
        Commands::Scan(args) => commands::scan::execute(ctx, args).await,
        Commands::Config(args) => commands::config::execute(&ctx, args),
    }
}

/// Log to stderr; `RUST_LOG` wins over `-v`.
fn init_logging(verbose: bool) {
    let default = if verbose {
        "taskwatch=debug,taskwatch_scan=debug,taskwatch_client=debug,taskwatch_cli=debug"
    } else {
        "taskwatch=info,taskwatch_scan=info,taskwatch_client=info,taskwatch_cli=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A second call (tests) leaves the first subscriber in place.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
