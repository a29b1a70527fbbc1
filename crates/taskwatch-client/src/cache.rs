//! Shared reputation cache with in-flight de-duplication.
//!
//! One mutex guards every entry. It is never held across an `.await`: callers
//! receive a oneshot receiver and wait on it after the lock is released.
//!
//! Entries are either settled (a verdict with a timestamp) or in flight (a
//! list of waiters for a lookup that has been dispatched). Refreshing a stale
//! verdict drops it, so an entry is never both. Eviction is
//! least-recently-used and skips anything in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use taskwatch_core::{ReputationVerdict, Result, TaskwatchError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

const CACHE_FORMAT_VERSION: u32 = 1;

/// Result delivered to every caller waiting on a lookup.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Verdict(ReputationVerdict),
    Unauthorized,
}

/// How a lookup should proceed after consulting the cache.
pub(crate) enum Begin {
    /// Fresh verdict on hand
    Hit(ReputationVerdict),
    /// Another caller's request is in flight; wait for it
    Joined(oneshot::Receiver<Outcome>),
    /// Caller must dispatch the request
    Leader(oneshot::Receiver<Outcome>),
}

/// What a finished request contributes.
pub(crate) enum Settlement {
    /// Definitive answer; cache it
    Store(ReputationVerdict),
    /// Answer for the waiters only (failed lookups)
    Discard(ReputationVerdict),
    /// Credentials rejected
    Unauthorized,
}

/// A cached verdict as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationRecord {
    pub hash: String,
    pub verdict: ReputationVerdict,
    /// When the verdict was fetched
    pub checked_at: DateTime<Utc>,
    /// A refresh for this hash is outstanding
    pub in_flight: bool,
}

struct Settled {
    verdict: ReputationVerdict,
    stored_at: Instant,
    checked_at: DateTime<Utc>,
}

struct Entry {
    settled: Option<Settled>,
    waiters: Option<Vec<oneshot::Sender<Outcome>>>,
    /// Position in the LRU order; `None` until first touched
    tick: Option<u64>,
}

impl Entry {
    const fn in_flight(&self) -> bool {
        self.waiters.is_some()
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    /// tick -> hash, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
}

impl CacheState {
    fn touch(&mut self, hash: &str) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(hash) {
            if let Some(previous) = entry.tick.replace(tick) {
                self.order.remove(&previous);
            }
            self.order.insert(tick, hash.to_string());
        }
    }

    fn remove(&mut self, hash: &str) {
        if let Some(tick) = self.entries.remove(hash).and_then(|e| e.tick) {
            self.order.remove(&tick);
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedCache {
    version: u32,
    records: Vec<PersistedRecord>,
}

#[derive(Serialize, Deserialize)]
struct PersistedRecord {
    hash: String,
    verdict: ReputationVerdict,
    checked_at: DateTime<Utc>,
}

/// Process-wide reputation cache, shared by reference between sessions.
pub struct ReputationCache {
    state: Mutex<CacheState>,
    max_entries: usize,
    ttl: Duration,
}

impl std::fmt::Debug for ReputationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationCache")
            .field("entries", &self.len())
            .field("max_entries", &self.max_entries)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ReputationCache {
    #[must_use]
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh(&self, settled: &Settled) -> bool {
        settled.stored_at.elapsed() < self.ttl
    }

    /// Fresh verdict for `hash`, if cached.
    pub fn get(&self, hash: &str) -> Option<ReputationVerdict> {
        let mut state = self.lock();
        let entry = state.entries.get(hash)?;
        match &entry.settled {
            Some(settled) if self.is_fresh(settled) => {
                let verdict = settled.verdict.clone();
                state.touch(hash);
                Some(verdict)
            }
            _ => {
                if !entry.in_flight() {
                    state.remove(hash);
                }
                None
            }
        }
    }

    /// Store a verdict directly.
    pub fn insert(&self, hash: impl Into<String>, verdict: ReputationVerdict) {
        let hash = hash.into();
        let mut state = self.lock();
        Self::store(&mut state, &hash, verdict, Instant::now(), Utc::now());
        self.evict(&mut state);
    }

    fn store(
        state: &mut CacheState,
        hash: &str,
        verdict: ReputationVerdict,
        stored_at: Instant,
        checked_at: DateTime<Utc>,
    ) {
        let settled = Settled {
            verdict,
            stored_at,
            checked_at,
        };
        if let Some(entry) = state.entries.get_mut(hash) {
            entry.settled = Some(settled);
        } else {
            state.entries.insert(
                hash.to_string(),
                Entry {
                    settled: Some(settled),
                    waiters: None,
                    tick: None,
                },
            );
        }
        state.touch(hash);
    }

    /// Consult the cache and register the caller.
    pub(crate) fn begin(&self, hash: &str) -> Begin {
        let mut state = self.lock();
        let (tx, rx) = oneshot::channel();

        if let Some(entry) = state.entries.get_mut(hash) {
            if let Some(waiters) = entry.waiters.as_mut() {
                waiters.push(tx);
                return Begin::Joined(rx);
            }
            if let Some(settled) = &entry.settled {
                if settled.stored_at.elapsed() < self.ttl {
                    let verdict = settled.verdict.clone();
                    state.touch(hash);
                    return Begin::Hit(verdict);
                }
            }
            entry.settled = None;
            entry.waiters = Some(vec![tx]);
        } else {
            state.entries.insert(
                hash.to_string(),
                Entry {
                    settled: None,
                    waiters: Some(vec![tx]),
                    tick: None,
                },
            );
        }
        state.touch(hash);
        Begin::Leader(rx)
    }

    /// Finish an in-flight lookup and wake every waiter.
    pub(crate) fn complete(&self, hash: &str, settlement: Settlement) {
        let (waiters, outcome) = {
            let mut state = self.lock();
            let waiters = state
                .entries
                .get_mut(hash)
                .and_then(|e| e.waiters.take())
                .unwrap_or_default();

            let outcome = match settlement {
                Settlement::Store(verdict) => {
                    Self::store(&mut state, hash, verdict.clone(), Instant::now(), Utc::now());
                    Outcome::Verdict(verdict)
                }
                Settlement::Discard(verdict) => {
                    Self::drop_unsettled(&mut state, hash);
                    Outcome::Verdict(verdict)
                }
                Settlement::Unauthorized => {
                    Self::drop_unsettled(&mut state, hash);
                    Outcome::Unauthorized
                }
            };
            self.evict(&mut state);
            (waiters, outcome)
        };

        for waiter in waiters {
            // Waiters that gave up have dropped their receiver.
            let _ = waiter.send(outcome.clone());
        }
    }

    fn drop_unsettled(state: &mut CacheState, hash: &str) {
        if state.entries.get(hash).is_some_and(|e| e.settled.is_none()) {
            state.remove(hash);
        }
    }

    /// Drop least-recently-used settled entries until within bounds.
    fn evict(&self, state: &mut CacheState) {
        if state.entries.len() <= self.max_entries {
            return;
        }

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| {
                !e.in_flight() && e.settled.as_ref().map_or(true, |s| !self.is_fresh(s))
            })
            .map(|(h, _)| h.clone())
            .collect();
        for hash in &expired {
            state.remove(hash);
        }

        let excess = state.entries.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return;
        }
        let victims: Vec<String> = state
            .order
            .values()
            .filter(|h| state.entries.get(*h).is_some_and(|e| !e.in_flight()))
            .take(excess)
            .cloned()
            .collect();
        for hash in &victims {
            state.remove(hash);
        }
        debug!(
            expired = expired.len(),
            evicted = victims.len(),
            "reputation cache eviction"
        );
    }

    /// Remove every expired, idle entry.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| {
                !e.in_flight() && e.settled.as_ref().map_or(true, |s| !self.is_fresh(s))
            })
            .map(|(h, _)| h.clone())
            .collect();
        for hash in &expired {
            state.remove(hash);
        }
        expired.len()
    }

    /// Entry for `hash`, settled or not.
    pub fn record(&self, hash: &str) -> Option<ReputationRecord> {
        let state = self.lock();
        let entry = state.entries.get(hash)?;
        let settled = entry.settled.as_ref();
        Some(ReputationRecord {
            hash: hash.to_string(),
            verdict: settled.map(|s| s.verdict.clone()).unwrap_or_default(),
            checked_at: settled.map_or_else(Utc::now, |s| s.checked_at),
            in_flight: entry.in_flight(),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of hashes with an outstanding request.
    pub fn in_flight(&self) -> usize {
        self.lock().entries.values().filter(|e| e.in_flight()).count()
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub const fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Load a cache file written by [`save`](Self::save), skipping expired
    /// records. A missing file yields an empty cache.
    pub fn load(path: &Path, max_entries: usize, ttl: Duration) -> Result<Self> {
        let cache = Self::new(max_entries, ttl);
        if !path.exists() {
            return Ok(cache);
        }

        let content = std::fs::read(path).map_err(|e| TaskwatchError::read(path, e))?;
        let mut persisted: PersistedCache = serde_json::from_slice(&content)?;
        if persisted.version != CACHE_FORMAT_VERSION {
            return Err(TaskwatchError::Config(format!(
                "unsupported cache format version {} in {}",
                persisted.version,
                path.display()
            )));
        }

        persisted.records.sort_by_key(|r| r.checked_at);
        let now = Utc::now();
        let mut loaded = 0usize;
        {
            let mut state = cache.lock();
            for record in persisted.records {
                let age = (now - record.checked_at).to_std().unwrap_or_default();
                if age >= ttl {
                    continue;
                }
                // Older than the monotonic clock can express; its remaining
                // lifetime cannot be represented.
                let Some(stored_at) = Instant::now().checked_sub(age) else {
                    continue;
                };
                Self::store(&mut state, &record.hash, record.verdict, stored_at, record.checked_at);
                loaded += 1;
            }
            cache.evict(&mut state);
        }
        debug!(path = %path.display(), loaded, "loaded reputation cache");
        Ok(cache)
    }

    /// Write every fresh settled verdict to `path` as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let records: Vec<PersistedRecord> = {
            let state = self.lock();
            state
                .order
                .values()
                .filter_map(|hash| {
                    let settled = state.entries.get(hash)?.settled.as_ref()?;
                    self.is_fresh(settled).then(|| PersistedRecord {
                        hash: hash.clone(),
                        verdict: settled.verdict.clone(),
                        checked_at: settled.checked_at,
                    })
                })
                .collect()
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(&PersistedCache {
            version: CACHE_FORMAT_VERSION,
            records,
        })?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskwatch_core::Verdict;

    fn clean() -> ReputationVerdict {
        ReputationVerdict::from_verdict(Verdict::Clean)
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = ReputationCache::new(10, Duration::from_secs(60));
        cache.insert("aa", clean());
        assert_eq!(cache.get("aa"), Some(clean()));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("aa"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn second_caller_joins_in_flight_lookup() {
        let cache = ReputationCache::new(10, Duration::from_secs(60));
        let Begin::Leader(leader) = cache.begin("aa") else {
            panic!("first caller must lead");
        };
        let Begin::Joined(follower) = cache.begin("aa") else {
            panic!("second caller must join");
        };
        assert_eq!(cache.in_flight(), 1);
        assert!(cache.record("aa").unwrap().in_flight);

        cache.complete("aa", Settlement::Store(clean()));
        for rx in [leader, follower] {
            match rx.await.unwrap() {
                Outcome::Verdict(v) => assert_eq!(v, clean()),
                Outcome::Unauthorized => panic!("unexpected auth failure"),
            }
        }
        assert!(matches!(cache.begin("aa"), Begin::Hit(_)));
    }

    #[tokio::test]
    async fn discarded_result_is_not_cached() {
        let cache = ReputationCache::new(10, Duration::from_secs(60));
        let Begin::Leader(rx) = cache.begin("aa") else {
            panic!("first caller must lead");
        };
        cache.complete("aa", Settlement::Discard(ReputationVerdict::unknown()));
        assert!(matches!(rx.await.unwrap(), Outcome::Verdict(_)));
        assert!(cache.record("aa").is_none());
    }

    #[tokio::test]
    async fn eviction_is_lru_and_spares_in_flight() {
        let cache = ReputationCache::new(2, Duration::from_secs(600));
        let Begin::Leader(_pending) = cache.begin("inflight") else {
            panic!("must lead");
        };
        cache.insert("old", clean());
        cache.insert("new", clean());

        // "inflight" is the least recently used but must survive.
        assert_eq!(cache.len(), 2);
        assert!(cache.record("inflight").is_some());
        assert!(cache.record("old").is_none());
        assert!(cache.record("new").is_some());

        cache.insert("newer", clean());
        assert!(cache.get("new").is_none());
        assert!(cache.record("inflight").unwrap().in_flight);
    }

    #[test]
    fn recently_read_entries_survive_eviction() {
        let cache = ReputationCache::new(2, Duration::from_secs(600));
        cache.insert("a", clean());
        cache.insert("b", clean());
        assert!(cache.get("a").is_some());
        cache.insert("c", clean());
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn least_recently_used_entry_is_evicted_first() {
        let cache = ReputationCache::new(2, Duration::from_secs(600));
        cache.insert("a", clean());
        cache.insert("b", clean());
        cache.insert("c", clean());

        assert!(cache.record("a").is_none());
        assert!(cache.record("b").is_some());
        assert!(cache.record("c").is_some());
    }

    #[test]
    fn every_entry_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = ReputationCache::new(10, Duration::from_secs(3600));
        for hash in ["a", "b", "c"] {
            cache.insert(hash, clean());
        }
        cache.save(&path).unwrap();

        let loaded = ReputationCache::load(&path, 10, Duration::from_secs(3600)).unwrap();
        for hash in ["a", "b", "c"] {
            assert!(loaded.get(hash).is_some(), "{hash} lost on save");
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        let cache = ReputationCache::new(10, Duration::from_secs(3600));
        cache.insert("aa", ReputationVerdict::from_detections(3, 70));
        cache.insert("bb", clean());
        cache.save(&path).unwrap();

        let loaded = ReputationCache::load(&path, 10, Duration::from_secs(3600)).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.get("aa").unwrap().verdict,
            taskwatch_core::Verdict::Flagged
        );
    }

    #[test]
    fn load_skips_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let stale = PersistedCache {
            version: CACHE_FORMAT_VERSION,
            records: vec![
                PersistedRecord {
                    hash: "old".into(),
                    verdict: clean(),
                    checked_at: Utc::now() - chrono::Duration::hours(48),
                },
                PersistedRecord {
                    hash: "recent".into(),
                    verdict: clean(),
                    checked_at: Utc::now() - chrono::Duration::minutes(5),
                },
            ],
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let loaded = ReputationCache::load(&path, 10, Duration::from_secs(86_400)).unwrap();
        assert!(loaded.get("old").is_none());
        assert!(loaded.get("recent").is_some());
    }

    #[test]
    fn load_skips_records_older_than_the_clock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let ancient = PersistedCache {
            version: CACHE_FORMAT_VERSION,
            records: vec![PersistedRecord {
                hash: "ancient".into(),
                verdict: clean(),
                checked_at: Utc::now() - chrono::Duration::days(150 * 365),
            }],
        };
        std::fs::write(&path, serde_json::to_vec(&ancient).unwrap()).unwrap();

        let ttl = Duration::from_secs(200 * 365 * 86_400);
        let loaded = ReputationCache::load(&path, 10, ttl).unwrap();
        assert!(loaded.get("ancient").is_none());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded =
            ReputationCache::load(&dir.path().join("absent.json"), 10, Duration::from_secs(1))
                .unwrap();
        assert!(loaded.is_empty());
    }
}
