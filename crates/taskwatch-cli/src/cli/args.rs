//! Command-line argument definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use taskwatch_core::ItemCategory;
use taskwatch_scan::TrustFilter;

use crate::output::OutputFormat;

/// Inspect running processes and the code they load
///
/// Every executable and shared library is hashed, checked against the
/// package database and, with an API key, looked up on VirusTotal.
///
/// Get an API key at: https://www.virustotal.com/gui/my-apikey
#[derive(Parser, Debug)]
#[command(name = "taskwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// VirusTotal API key (or set VT_API_KEY env var)
    #[arg(short = 'k', long, env = "VT_API_KEY", global = true, hide_env_values = true)]
    pub api_key: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum)]
    pub output: Option<OutputFormat>,

    /// Increase verbosity (debug logging)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan running processes
    Scan(ScanArgs),

    /// Manage CLI configuration
    Config(ConfigArgs),
}

// ============================================================================
// Scan command
// ============================================================================

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Only show tasks whose name or executable path contains TEXT
    #[arg(short, long, value_name = "TEXT", default_value = "")]
    pub filter: String,

    /// Trust levels to show (comma-separated, or "all")
    #[arg(short, long, value_name = "LEVEL,...", default_value = "all")]
    pub trust: TrustFilter,

    /// Show tasks as a process tree
    #[arg(long)]
    pub tree: bool,

    /// Skip VirusTotal lookups even if an API key is configured
    #[arg(long)]
    pub no_reputation: bool,

    /// Also submit package-owned binaries to VirusTotal
    #[arg(long)]
    pub include_platform_signed: bool,

    /// List items of one category instead of tasks
    #[arg(long, value_enum, value_name = "CATEGORY")]
    pub items: Option<CategoryArg>,

    /// Restrict item listing to one process
    #[arg(long)]
    pub pid: Option<i32>,
}

/// Item category as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CategoryArg {
    Libraries,
    Files,
    Connections,
}

impl From<CategoryArg> for ItemCategory {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::Libraries => Self::Libraries,
            CategoryArg::Files => Self::Files,
            CategoryArg::Connections => Self::Connections,
        }
    }
}

// ============================================================================
// Config command
// ============================================================================

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Show config file path
    Path,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use taskwatch_core::TrustLevel;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn scan_flags_parse() {
        let cli = Cli::try_parse_from([
            "taskwatch",
            "scan",
            "--filter",
            "ssh",
            "--trust",
            "flagged,untrusted",
            "--items",
            "libraries",
            "--pid",
            "42",
            "-o",
            "json",
        ])
        .unwrap();

        let Commands::Scan(args) = cli.command else {
            panic!("expected scan");
        };
        assert_eq!(args.filter, "ssh");
        assert!(args.trust.contains(TrustLevel::Flagged));
        assert!(!args.trust.contains(TrustLevel::TrustedPlatform));
        assert_eq!(args.items, Some(CategoryArg::Libraries));
        assert_eq!(args.pid, Some(42));
        assert_eq!(cli.output, Some(OutputFormat::Json));
    }

    #[test]
    fn unknown_trust_level_is_rejected() {
        assert!(Cli::try_parse_from(["taskwatch", "scan", "--trust", "shady"]).is_err());
    }
}
