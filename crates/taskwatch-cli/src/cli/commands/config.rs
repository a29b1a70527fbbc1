//! `taskwatch config` - CLI configuration management.

use anyhow::Result;
use colored::Colorize;

use super::Context;
use crate::cli::args::{ConfigArgs, ConfigCommands};
use crate::config::Config;
use crate::output::OutputFormat;

pub fn execute(ctx: &Context, args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Show => show_config(ctx),
        ConfigCommands::Path => show_path(),
        ConfigCommands::Init { force } => init_config(force),
    }
}

fn mask(key: &str) -> String {
    if key.len() > 8 {
        format!("{}...{}", &key[..4], &key[key.len() - 4..])
    } else {
        "****".to_string()
    }
}

fn show_config(ctx: &Context) -> Result<()> {
    let config = &ctx.config;

    if ctx.output_format == OutputFormat::Json {
        let mut masked = config.clone();
        masked.api_key = masked.api_key.as_deref().map(mask);
        println!("{}", serde_json::to_string_pretty(&masked)?);
        return Ok(());
    }

    println!("{}", "Current Configuration:".bold());
    println!();

    let api_display = config
        .api_key
        .as_deref()
        .map_or_else(|| "(not set)".dimmed().to_string(), mask);
    println!("  {} {}", "api_key:".bold(), api_display);
    println!(
        "  {} {}",
        "output_format:".bold(),
        config.output_format.unwrap_or_default()
    );

    let scan = &config.scan;
    println!();
    println!("{}", "[scan]".bold());
    println!("  {} {}", "reputation_enabled:".bold(), scan.reputation_enabled);
    println!("  {} {}", "vt_worker_budget:".bold(), scan.vt_worker_budget);
    println!(
        "  {} {}",
        "vt_requests_per_minute:".bold(),
        scan.vt_requests_per_minute
            .map_or_else(|| "(unlimited)".dimmed().to_string(), |n| n.to_string())
    );
    println!("  {} {}s", "cache_ttl_secs:".bold(), scan.cache_ttl_secs);
    println!("  {} {}", "cache_max_entries:".bold(), scan.cache_max_entries);
    println!(
        "  {} {}",
        "include_apple_signed_in_reputation:".bold(),
        scan.include_apple_signed_in_reputation
    );
    println!("  {} {}", "hash_workers:".bold(), scan.hash_workers);
    println!("  {} {}s", "request_timeout_secs:".bold(), scan.request_timeout_secs);
    println!(
        "  {} {}",
        "cache_path:".bold(),
        config.cache_path()?.display()
    );

    Ok(())
}

fn show_path() -> Result<()> {
    let path = Config::path()?;
    println!("{}", path.display());
    Ok(())
}

fn init_config(force: bool) -> Result<()> {
    let path = Config::path()?;
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}\n\
             Use --force to overwrite it.",
            path.display()
        );
    }

    Config::default().save_to(&path)?;
    println!(
        "{} Wrote default configuration to {}",
        "Success:".green().bold(),
        path.display().to_string().cyan()
    );
    Ok(())
}
