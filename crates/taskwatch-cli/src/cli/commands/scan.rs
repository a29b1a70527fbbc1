//! `taskwatch scan` - Enumerate processes and classify their code.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use taskwatch_client::{ReputationCache, ReputationClient, VirusTotalProvider};
use taskwatch_core::{ItemCategory, ScanConfig};
use taskwatch_scan::{CancelToken, ScanEvent, Scanner, Snapshot, SortKey, ViewQuery};
use tracing::{debug, warn};

use super::Context;
use crate::cli::args::ScanArgs;
use crate::output::{self, ItemRecord, OutputFormat, TaskRecord};

/// Reputation client plus where its cache is persisted.
struct Reputation {
    client: ReputationClient,
    cache_path: PathBuf,
}

pub async fn execute(ctx: Context, args: ScanArgs) -> Result<()> {
    let mut config = ctx.config.scan.clone();
    if args.no_reputation {
        config.reputation_enabled = false;
    }
    if args.include_platform_signed {
        config.include_apple_signed_in_reputation = true;
    }
    config.validate()?;

    let reputation = reputation(&ctx, &config)?;
    let mut scanner = Scanner::new(config);
    if let Some(r) = &reputation {
        scanner = scanner.with_reputation(r.client.clone());
    }

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let snapshot = run_scan(&ctx, &scanner, cancel).await;

    if let Some(r) = &reputation {
        let stats = r.client.stats();
        debug!(
            requests = stats.requests,
            cache_hits = stats.cache_hits,
            throttled = stats.throttled,
            failures = stats.failures,
            "reputation client stats"
        );
        if ctx.verbose {
            eprintln!(
                "{} {} requests, {} cache hits, {} throttled, {} failed",
                "VirusTotal:".bold(),
                stats.requests,
                stats.cache_hits,
                stats.throttled,
                stats.failures
            );
        }
        if let Err(e) = r.client.cache().save(&r.cache_path) {
            warn!(path = %r.cache_path.display(), error = %e, "could not save reputation cache");
        }
    }

    print_results(&ctx, &args, &snapshot)
}

/// Build the VirusTotal client, or `None` when reputation is off or no key
/// is configured.
fn reputation(ctx: &Context, config: &ScanConfig) -> Result<Option<Reputation>> {
    if !config.reputation_enabled {
        return Ok(None);
    }
    let Some(key) = ctx.api_key.as_deref() else {
        eprintln!(
            "{} no VirusTotal API key; reputation checks are off.\n  \
             Set --api-key, VT_API_KEY or api_key in {}",
            "Note:".yellow().bold(),
            crate::config::Config::path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "the config file".into())
        );
        return Ok(None);
    };

    let cache_path = ctx.config.cache_path()?;
    let cache = match ReputationCache::load(&cache_path, config.cache_max_entries, config.cache_ttl())
    {
        Ok(cache) => cache,
        Err(e) => {
            warn!(path = %cache_path.display(), error = %e, "ignoring unreadable reputation cache");
            ReputationCache::new(config.cache_max_entries, config.cache_ttl())
        }
    };

    let provider = VirusTotalProvider::builder(key)
        .timeout(config.request_timeout())
        .build()
        .context("creating VirusTotal client")?;
    let client = ReputationClient::builder(Arc::new(provider))
        .cache(Arc::new(cache))
        .config(config)
        .build();

    Ok(Some(Reputation { client, cache_path }))
}

async fn run_scan(ctx: &Context, scanner: &Scanner, cancel: CancelToken) -> Arc<Snapshot> {
    let interactive = ctx.output_format == OutputFormat::Pretty && std::io::stderr().is_terminal();
    let spinner = if interactive {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb.set_message("Enumerating processes...");
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut handle = scanner.start_with(cancel);
    let mut tasks = 0usize;
    while let Some(event) = handle.next_event().await {
        match event {
            ScanEvent::TaskDiscovered { .. } => {
                tasks += 1;
                spinner.set_message(format!("Enumerating processes... {tasks}"));
            }
            ScanEvent::EnumerationFinished { error: Some(e), .. } => {
                spinner.println(format!("{} {e}", "Error:".red().bold()));
            }
            ScanEvent::ReputationDisabled { provider } => {
                spinner.println(format!(
                    "{} {provider} rejected the API key; continuing without reputation.",
                    "Warning:".yellow().bold()
                ));
            }
            ScanEvent::ItemUpdated { .. } | ScanEvent::EnumerationFinished { .. } => {
                let snapshot = handle.snapshot();
                if snapshot.is_enumeration_done() {
                    spinner.set_message(format!(
                        "Classifying {} tasks... {} binaries left",
                        snapshot.len(),
                        snapshot.pending_jobs()
                    ));
                }
            }
            ScanEvent::ScanFinished { cancelled } => {
                if cancelled {
                    spinner.println(format!("{} scan cancelled", "Note:".yellow().bold()));
                }
            }
            ScanEvent::ItemsDiscovered { .. } | ScanEvent::TaskStale { .. } => {}
        }
    }
    spinner.finish_and_clear();

    handle.wait().await
}

fn query(args: &ScanArgs) -> ViewQuery {
    ViewQuery::default()
        .text(args.filter.clone())
        .trust(args.trust)
        .sort(if args.tree { SortKey::Tree } else { SortKey::Name })
}

fn print_results(ctx: &Context, args: &ScanArgs, snapshot: &Snapshot) -> Result<()> {
    let mut rows = snapshot.view(&query(args));
    if let Some(pid) = args.pid {
        rows.retain(|r| r.task.pid == pid);
        if rows.is_empty() {
            anyhow::bail!("No task with pid {pid} matches the current filter");
        }
    }

    // --pid alone lists that task's libraries.
    let category = args
        .items
        .map(ItemCategory::from)
        .or_else(|| args.pid.map(|_| ItemCategory::Libraries));

    match category {
        Some(category) => {
            let records: Vec<ItemRecord> = rows
                .iter()
                .flat_map(|row| {
                    snapshot
                        .view_items(row.task.handle, category, "", args.trust)
                        .into_iter()
                        .map(|item| ItemRecord::new(&row.task, category, item))
                        .collect::<Vec<_>>()
                })
                .collect();
            emit(ctx, &records, || output::items_table(&records), snapshot)
        }
        None => {
            let records: Vec<TaskRecord> = rows.iter().map(TaskRecord::from_row).collect();
            emit(
                ctx,
                &records,
                || output::tasks_table(&records, args.tree),
                snapshot,
            )
        }
    }
}

fn emit<T: serde::Serialize>(
    ctx: &Context,
    records: &[T],
    table: impl FnOnce() -> String,
    snapshot: &Snapshot,
) -> Result<()> {
    match ctx.output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(records)?);
        }
        OutputFormat::Csv => {
            output::write_csv(std::io::stdout().lock(), records)?;
        }
        OutputFormat::Pretty => {
            if records.is_empty() {
                println!("{}", "Nothing matches the current filter.".dimmed());
            } else {
                println!("{}", table());
            }
            println!();
            let mut summary = format!(
                "{} {} shown of {} tasks",
                "Total:".bold(),
                records.len().to_string().cyan(),
                snapshot.len()
            );
            if snapshot.was_cancelled() {
                summary.push_str(&format!(" {}", "(cancelled)".yellow()));
            }
            if snapshot.reputation_disabled() {
                summary.push_str(&format!(" {}", "(reputation disabled)".yellow()));
            }
            println!("{summary}");
        }
    }
    Ok(())
}
