//! Output formatting for different formats.

use clap::ValueEnum;
use colored::{ColoredString, Colorize};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::str::FromStr;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use taskwatch_core::{Item, ItemCategory, ItemKind, SignatureStatus, Task, TrustLevel, Verdict};
use taskwatch_scan::TaskRow;

/// Available output formats.
#[derive(Debug, Clone, Copy, Default, ValueEnum, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Pretty-printed tables with colors
    #[default]
    Pretty,
    /// JSON output
    Json,
    /// CSV output
    Csv,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "table" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            _ => anyhow::bail!(
                "Unknown output format: {}\n\
                 Valid formats: pretty, json, csv",
                s
            ),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
            Self::Csv => write!(f, "csv"),
        }
    }
}

/// One task as printed or exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub pid: i32,
    pub ppid: i32,
    pub name: String,
    pub path: String,
    pub trust: TrustLevel,
    pub libraries: usize,
    pub files: usize,
    pub connections: usize,
    pub pending: usize,
    pub partial: bool,
    pub stale: bool,
    pub depth: usize,
}

impl TaskRecord {
    pub fn from_row(row: &TaskRow) -> Self {
        let task = &row.task;
        Self {
            pid: task.pid,
            ppid: task.ppid,
            name: task.name.clone(),
            path: task
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            trust: task.aggregate_trust(),
            libraries: task.items(ItemCategory::Libraries).len(),
            files: task.items(ItemCategory::Files).len(),
            connections: task.items(ItemCategory::Connections).len(),
            pending: task.pending_items(),
            partial: task.partial().any(),
            stale: task.is_stale(),
            depth: row.depth,
        }
    }
}

/// One item as printed or exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemRecord {
    pub pid: i32,
    pub task: String,
    pub category: ItemCategory,
    pub name: String,
    pub identity: String,
    pub trust: TrustLevel,
    pub signature: String,
    pub hash: String,
    pub reputation: String,
    pub permalink: String,
}

impl ItemRecord {
    pub fn new(task: &Task, category: ItemCategory, item: &Item) -> Self {
        let signature = match item.kind() {
            ItemKind::Binary(binary) if !binary.exists => "missing".to_string(),
            ItemKind::Binary(binary) => binary
                .signature
                .as_ref()
                .map(describe_signature)
                .unwrap_or_default(),
            ItemKind::File(_) | ItemKind::Connection(_) => String::new(),
        };
        let (reputation, permalink) = item.reputation().map_or_else(Default::default, |r| {
            let summary = match (r.verdict, r.detections) {
                (Verdict::Unknown, _) => "unknown".to_string(),
                (v, Some(d)) => format!("{} ({}/{})", verdict_str(v), d.positives, d.total),
                (v, None) => verdict_str(v).to_string(),
            };
            (summary, r.permalink.clone().unwrap_or_default())
        });

        Self {
            pid: task.pid,
            task: task.name.clone(),
            category,
            name: item.display_name().into_owned(),
            identity: item.identity().into_owned(),
            trust: item.trust(),
            signature,
            hash: item.hash().unwrap_or_default().to_string(),
            reputation,
            permalink,
        }
    }
}

const fn verdict_str(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Unknown => "unknown",
        Verdict::Clean => "clean",
        Verdict::Flagged => "flagged",
    }
}

fn describe_signature(status: &SignatureStatus) -> String {
    match status {
        SignatureStatus::PlatformSigned { package } => format!("package {package}"),
        SignatureStatus::ThirdPartySigned { signer } => signer.clone(),
        SignatureStatus::Unsigned => "unsigned".to_string(),
        SignatureStatus::Invalid { reason } => format!("invalid: {reason}"),
    }
}

/// Trust level, colored by severity.
pub fn trust_colored(trust: TrustLevel) -> ColoredString {
    let label = trust.as_str();
    match trust {
        TrustLevel::Unknown => label.dimmed(),
        TrustLevel::TrustedPlatform => label.green(),
        TrustLevel::TrustedThirdParty => label.cyan(),
        TrustLevel::Untrusted => label.yellow(),
        TrustLevel::Flagged => label.red().bold(),
    }
}

#[derive(Tabled)]
struct TaskTableRow {
    #[tabled(rename = "PID")]
    pid: i32,
    #[tabled(rename = "PPID")]
    ppid: i32,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Trust")]
    trust: String,
    #[tabled(rename = "Libs")]
    libraries: usize,
    #[tabled(rename = "Files")]
    files: usize,
    #[tabled(rename = "Conns")]
    connections: usize,
    #[tabled(rename = "Path")]
    path: String,
}

#[derive(Tabled)]
struct ItemTableRow {
    #[tabled(rename = "PID")]
    pid: i32,
    #[tabled(rename = "Item")]
    name: String,
    #[tabled(rename = "Trust")]
    trust: String,
    #[tabled(rename = "Signature")]
    signature: String,
    #[tabled(rename = "Reputation")]
    reputation: String,
    #[tabled(rename = "Detail")]
    identity: String,
}

pub fn tasks_table(records: &[TaskRecord], tree: bool) -> String {
    let rows = records.iter().map(|r| {
        let mut name = if tree {
            format!("{}{}", "  ".repeat(r.depth), r.name)
        } else {
            r.name.clone()
        };
        if r.stale {
            name.push_str(" (exited)");
        }
        let mut trust = trust_colored(r.trust).to_string();
        if r.pending > 0 {
            trust.push_str(&format!(" ({} pending)", r.pending).dimmed().to_string());
        }
        TaskTableRow {
            pid: r.pid,
            ppid: r.ppid,
            name,
            trust,
            libraries: r.libraries,
            files: r.files,
            connections: r.connections,
            path: r.path.clone(),
        }
    });
    Table::new(rows).with(Style::rounded()).to_string()
}

pub fn items_table(records: &[ItemRecord]) -> String {
    let rows = records.iter().map(|r| ItemTableRow {
        pid: r.pid,
        name: r.name.clone(),
        trust: trust_colored(r.trust).to_string(),
        signature: r.signature.clone(),
        reputation: r.reputation.clone(),
        identity: r.identity.clone(),
    });
    Table::new(rows).with(Style::rounded()).to_string()
}

/// Write records as CSV with a header row.
pub fn write_csv<T: Serialize>(out: impl Write, records: &[T]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use taskwatch_core::{ItemRef, ItemSlot, ItemUpdate, ReputationVerdict, TaskHandle};

    fn sample() -> Task {
        let h = TaskHandle(0);
        let mut task = Task::new(h, 42, 1, "sshd", Some("/usr/sbin/sshd".into()));
        task.append_items(
            ItemCategory::Libraries,
            [Item::binary(h, "/opt/x/libevil.so")],
            false,
        );
        task.apply_update(&ItemUpdate {
            hash: Some("ab".repeat(32)),
            signature: Some(SignatureStatus::Unsigned),
            reputation: Some(ReputationVerdict::from_detections(3, 70)),
            ..ItemUpdate::trust(
                ItemRef {
                    task: h,
                    slot: ItemSlot::Library(0),
                },
                TrustLevel::Flagged,
            )
        });
        task
    }

    #[test]
    fn output_format_parses_aliases() {
        assert_eq!("table".parse::<OutputFormat>().unwrap(), OutputFormat::Pretty);
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn task_record_summarises_the_task() {
        let row = TaskRow {
            task: Arc::new(sample()),
            depth: 2,
        };
        let record = TaskRecord::from_row(&row);
        assert_eq!(record.pid, 42);
        assert_eq!(record.trust, TrustLevel::Flagged);
        assert_eq!(record.libraries, 1);
        assert_eq!(record.depth, 2);
        assert_eq!(record.path, "/usr/sbin/sshd");
    }

    #[test]
    fn item_record_describes_reputation() {
        let task = sample();
        let item = &task.items(ItemCategory::Libraries)[0];
        let record = ItemRecord::new(&task, ItemCategory::Libraries, item);
        assert_eq!(record.signature, "unsigned");
        assert_eq!(record.reputation, "flagged (3/70)");
        assert_eq!(record.hash.len(), 64);
    }

    #[test]
    fn csv_has_header_and_rows() {
        let row = TaskRow {
            task: Arc::new(sample()),
            depth: 0,
        };
        let mut buf = Vec::new();
        write_csv(&mut buf, &[TaskRecord::from_row(&row)]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("pid,ppid,name,path,trust"));
        assert!(lines.next().unwrap().starts_with("42,1,sshd,/usr/sbin/sshd,flagged"));
    }

    #[test]
    fn tree_table_indents_children() {
        colored::control::set_override(false);
        let row = TaskRow {
            task: Arc::new(sample()),
            depth: 1,
        };
        let table = tasks_table(&[TaskRecord::from_row(&row)], true);
        assert!(table.contains("  sshd"));
        assert!(table.contains("flagged"));
    }
}
