//! Text and trust filtering plus ordering over a task snapshot.
//!
//! Everything here is synchronous and pure: it reads an immutable slice of
//! tasks and returns rows that share the tasks by `Arc`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use taskwatch_core::{Item, ItemCategory, Task, TaskHandle, TaskwatchError, TrustLevel};

/// Set of admitted trust levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustFilter {
    bits: u8,
}

const fn bit(level: TrustLevel) -> u8 {
    1 << (level as u8)
}

impl Default for TrustFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl TrustFilter {
    /// Admits every level, `Unknown` included.
    #[must_use]
    pub const fn all() -> Self {
        Self { bits: 0b1_1111 }
    }

    #[must_use]
    pub const fn none() -> Self {
        Self { bits: 0 }
    }

    /// Every level except `Unknown`.
    #[must_use]
    pub const fn classified() -> Self {
        Self::all().without(TrustLevel::Unknown)
    }

    #[must_use]
    pub const fn only(level: TrustLevel) -> Self {
        Self { bits: bit(level) }
    }

    #[must_use]
    pub const fn with(self, level: TrustLevel) -> Self {
        Self {
            bits: self.bits | bit(level),
        }
    }

    #[must_use]
    pub const fn without(self, level: TrustLevel) -> Self {
        Self {
            bits: self.bits & !bit(level),
        }
    }

    #[must_use]
    pub const fn contains(self, level: TrustLevel) -> bool {
        self.bits & bit(level) != 0
    }

    #[must_use]
    pub const fn is_all(self) -> bool {
        self.bits == Self::all().bits
    }

    pub fn levels(self) -> impl Iterator<Item = TrustLevel> {
        TrustLevel::ALL.into_iter().filter(move |l| self.contains(*l))
    }
}

impl FromIterator<TrustLevel> for TrustFilter {
    fn from_iter<I: IntoIterator<Item = TrustLevel>>(iter: I) -> Self {
        iter.into_iter().fold(Self::none(), Self::with)
    }
}

/// Comma-separated levels, e.g. `untrusted,flagged`, or `all`.
impl FromStr for TrustFilter {
    type Err = TaskwatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::all());
        }
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(TrustLevel::from_str)
            .collect()
    }
}

impl fmt::Display for TrustFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            return f.write_str("all");
        }
        let names: Vec<&str> = self.levels().map(TrustLevel::as_str).collect();
        f.write_str(&names.join(","))
    }
}

/// Row ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    /// Flat, by lowercase name, then pid
    #[default]
    Name,
    /// Parent/child tree, depth-first
    Tree,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewQuery {
    /// Case-insensitive substring of task name or executable path
    pub text: String,
    pub trust: TrustFilter,
    pub sort: SortKey,
}

impl ViewQuery {
    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    #[must_use]
    pub const fn trust(mut self, trust: TrustFilter) -> Self {
        self.trust = trust;
        self
    }

    #[must_use]
    pub const fn sort(mut self, sort: SortKey) -> Self {
        self.sort = sort;
        self
    }
}

/// One visible task and its depth in the tree (0 for flat views).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRow {
    pub task: Arc<Task>,
    pub depth: usize,
}

fn matches_text(needle: &str, task: &Task) -> bool {
    if needle.is_empty() {
        return true;
    }
    task.name.to_lowercase().contains(needle)
        || task
            .path
            .as_ref()
            .is_some_and(|p| p.to_string_lossy().to_lowercase().contains(needle))
}

/// Tests the task's aggregate trust. Platform and third-party trust rank
/// equally, so a task holding both matches a filter naming either.
fn matches_trust(filter: TrustFilter, task: &Task) -> bool {
    let aggregate = task.aggregate_trust();
    filter.contains(aggregate)
        || task.all_items().any(|item| {
            let level = item.trust();
            level.specificity() == aggregate.specificity() && filter.contains(level)
        })
}

fn name_key(task: &Task) -> (String, i32) {
    (task.name.to_lowercase(), task.pid)
}

/// Filter and order `tasks`.
pub fn view(tasks: &[Arc<Task>], query: &ViewQuery) -> Vec<TaskRow> {
    let needle = query.text.trim().to_lowercase();
    let mut visible: Vec<&Arc<Task>> = tasks
        .iter()
        .filter(|t| matches_text(&needle, t) && matches_trust(query.trust, t))
        .collect();
    visible.sort_by_cached_key(|t| name_key(t));

    match query.sort {
        SortKey::Name => visible
            .into_iter()
            .map(|t| TaskRow {
                task: Arc::clone(t),
                depth: 0,
            })
            .collect(),
        SortKey::Tree => tree(&visible),
    }
}

/// Depth-first layout of `visible`, which is already in sibling order.
fn tree(visible: &[&Arc<Task>]) -> Vec<TaskRow> {
    let by_pid: HashMap<i32, TaskHandle> = visible.iter().map(|t| (t.pid, t.handle)).collect();
    let mut children: HashMap<TaskHandle, Vec<&Arc<Task>>> = HashMap::new();
    let mut roots = Vec::new();

    for task in visible {
        match by_pid.get(&task.ppid) {
            Some(parent) if task.ppid != task.pid => {
                children.entry(*parent).or_default().push(*task);
            }
            _ => roots.push(*task),
        }
    }

    let mut rows = Vec::with_capacity(visible.len());
    let mut seen = HashSet::new();
    for root in roots {
        walk(root, &children, &mut seen, &mut rows);
    }
    // Parent cycles (pid reuse) leave tasks unreached; show them as roots.
    for task in visible {
        walk(*task, &children, &mut seen, &mut rows);
    }
    rows
}

fn walk<'a>(
    start: &'a Arc<Task>,
    children: &HashMap<TaskHandle, Vec<&'a Arc<Task>>>,
    seen: &mut HashSet<TaskHandle>,
    rows: &mut Vec<TaskRow>,
) {
    let mut stack = vec![(start, 0usize)];
    while let Some((task, depth)) = stack.pop() {
        if !seen.insert(task.handle) {
            continue;
        }
        rows.push(TaskRow {
            task: Arc::clone(task),
            depth,
        });
        if let Some(kids) = children.get(&task.handle) {
            stack.extend(kids.iter().rev().map(|k| (*k, depth + 1)));
        }
    }
}

/// Items of one category of `task`, filtered like tasks and sorted by
/// display name.
pub fn view_items<'a>(
    task: &'a Task,
    category: ItemCategory,
    text: &str,
    trust: TrustFilter,
) -> Vec<&'a Item> {
    let needle = text.trim().to_lowercase();
    let mut items: Vec<&Item> = task
        .items(category)
        .iter()
        .filter(|item| trust.contains(item.trust()))
        .filter(|item| {
            needle.is_empty()
                || item.display_name().to_lowercase().contains(&needle)
                || item.identity().to_lowercase().contains(&needle)
        })
        .collect();
    items.sort_by_cached_key(|item| {
        (
            item.display_name().to_lowercase(),
            item.identity().into_owned(),
        )
    });
    items
}
