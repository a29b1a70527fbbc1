//! Reputation lookup client.
//!
//! Lookups go cache-first. A miss registers the caller as the leader for that
//! hash and appends the hash to a FIFO queue; further callers for the same
//! hash attach to the leader's result. A single dispatcher task drains the
//! queue, waiting out any backoff window and taking a worker permit before
//! each request, and coalesces queued hashes into one call when the provider
//! accepts batches.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use taskwatch_core::{ReputationVerdict, Result, ScanConfig, TaskwatchError};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::backoff::ThrottleGate;
use crate::cache::{Begin, Outcome, ReputationCache, Settlement};
use crate::config::RetryConfig;
use crate::provider::{HashReport, ReputationProvider};

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default concurrent request budget
const DEFAULT_WORKER_BUDGET: usize = 4;

/// How long the dispatcher waits for more hashes to fill a batch
const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(50);

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Counters describing client activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Requests sent to the provider (retries included)
    pub requests: u64,
    /// Lookups answered from the cache
    pub cache_hits: u64,
    /// Throttling responses received
    pub throttled: u64,
    /// Hashes that ended without a verdict
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    throttled: AtomicU64,
    failures: AtomicU64,
}

/// Cached, de-duplicating, rate-limited reputation client
#[derive(Clone)]
pub struct ReputationClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    queue: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
}

/// State shared by the client handle, the dispatcher and its workers.
struct Shared {
    provider: Arc<dyn ReputationProvider>,
    cache: Arc<ReputationCache>,
    gate: ThrottleGate,
    retry: RetryConfig,
    timeout: Duration,
    workers: Arc<Semaphore>,
    limiter: Option<DirectLimiter>,
    batch_window: Duration,
    disabled: AtomicBool,
    stats: Counters,
}

impl ReputationClient {
    /// Create a builder around `provider`
    #[must_use]
    pub fn builder(provider: Arc<dyn ReputationProvider>) -> ReputationClientBuilder {
        ReputationClientBuilder::new(provider)
    }

    /// Reputation of `hash`.
    ///
    /// Network failures, throttling beyond the retry budget and malformed
    /// responses all resolve to an unknown verdict. Only rejected credentials
    /// surface as an error, and once they do the client stays disabled.
    pub async fn lookup(&self, hash: &str) -> Result<ReputationVerdict> {
        let shared = &self.inner.shared;
        if shared.disabled.load(Ordering::Acquire) {
            return Err(TaskwatchError::Unauthorized);
        }

        let hash = hash.trim().to_ascii_lowercase();
        let rx = match shared.cache.begin(&hash) {
            Begin::Hit(verdict) => {
                shared.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(verdict);
            }
            Begin::Joined(rx) => rx,
            Begin::Leader(rx) => {
                if self.inner.queue.send(hash.clone()).is_err() {
                    shared
                        .cache
                        .complete(&hash, Settlement::Discard(ReputationVerdict::unknown()));
                }
                rx
            }
        };

        match rx.await {
            Ok(Outcome::Verdict(verdict)) => Ok(verdict),
            Ok(Outcome::Unauthorized) => Err(TaskwatchError::Unauthorized),
            Err(_) => Ok(ReputationVerdict::unknown()),
        }
    }

    /// True once the provider has rejected our credentials
    pub fn is_disabled(&self) -> bool {
        self.inner.shared.disabled.load(Ordering::Acquire)
    }

    /// The cache this client reads and fills
    pub fn cache(&self) -> &Arc<ReputationCache> {
        &self.inner.shared.cache
    }

    /// Provider identifier
    pub fn provider_name(&self) -> &'static str {
        self.inner.shared.provider.name()
    }

    /// Time left in the current throttling backoff window
    pub fn backoff_remaining(&self) -> Option<Duration> {
        self.inner.shared.gate.remaining()
    }

    /// Snapshot of activity counters
    pub fn stats(&self) -> ClientStats {
        let stats = &self.inner.shared.stats;
        ClientStats {
            requests: stats.requests.load(Ordering::Relaxed),
            cache_hits: stats.cache_hits.load(Ordering::Relaxed),
            throttled: stats.throttled.load(Ordering::Relaxed),
            failures: stats.failures.load(Ordering::Relaxed),
        }
    }
}

impl Shared {
    /// Drain the FIFO queue, one batch per worker permit.
    async fn dispatch(self: Arc<Self>, mut queue: mpsc::UnboundedReceiver<String>) {
        let max_batch = self.provider.max_batch_size().max(1);

        while let Some(first) = queue.recv().await {
            self.gate.wait().await;
            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                break;
            };

            let mut batch = vec![first];
            if max_batch > 1 {
                let deadline = Instant::now() + self.batch_window;
                while batch.len() < max_batch {
                    match tokio::time::timeout_at(deadline, queue.recv()).await {
                        Ok(Some(hash)) => batch.push(hash),
                        Ok(None) | Err(_) => break,
                    }
                }
            }

            debug!(size = batch.len(), "dispatching reputation batch");
            tokio::spawn(Arc::clone(&self).run_batch(batch, permit));
        }
        debug!("reputation dispatcher stopped");
    }

    async fn run_batch(self: Arc<Self>, batch: Vec<String>, permit: OwnedSemaphorePermit) {
        let settlements = self.resolve(&batch, permit).await;
        for (hash, settlement) in batch.iter().zip(settlements) {
            self.cache.complete(hash, settlement);
        }
    }

    async fn resolve(&self, batch: &[String], permit: OwnedSemaphorePermit) -> Vec<Settlement> {
        let mut permit = Some(permit);
        let mut network_attempts = 0u32;
        let mut throttle_attempts = 0u32;

        loop {
            if self.disabled.load(Ordering::Acquire) {
                return unauthorized(batch);
            }

            self.gate.wait().await;
            let held = match permit.take() {
                Some(p) => p,
                None => match Arc::clone(&self.workers).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return self.give_up(batch),
                },
            };
            // The window may have opened while we queued for a permit.
            self.gate.wait().await;
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            self.stats.requests.fetch_add(1, Ordering::Relaxed);
            let result = match tokio::time::timeout(self.timeout, self.provider.query(batch)).await
            {
                Ok(result) => result,
                Err(_) => Err(TaskwatchError::Timeout(self.timeout)),
            };

            match result {
                Ok(reports) => {
                    self.gate.reset();
                    return self.settle(batch, reports);
                }
                Err(TaskwatchError::Unauthorized) => {
                    if !self.disabled.swap(true, Ordering::AcqRel) {
                        error!(
                            provider = self.provider.name(),
                            "reputation service rejected credentials, lookups disabled"
                        );
                    }
                    return unauthorized(batch);
                }
                Err(TaskwatchError::Throttled { retry_after }) => {
                    self.stats.throttled.fetch_add(1, Ordering::Relaxed);
                    throttle_attempts += 1;
                    let window = self.gate.trip(retry_after);
                    if throttle_attempts > self.retry.max_throttle_retries {
                        warn!(
                            provider = self.provider.name(),
                            attempts = throttle_attempts,
                            "still throttled, giving up on batch"
                        );
                        return self.give_up(batch);
                    }
                    warn!(
                        provider = self.provider.name(),
                        window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
                        "throttled by reputation service, backing off"
                    );
                    permit = Some(held);
                }
                Err(TaskwatchError::MalformedResponse(reason)) => {
                    warn!(provider = self.provider.name(), %reason, "malformed reputation response");
                    return self.give_up(batch);
                }
                Err(e) if e.is_retryable() => {
                    network_attempts += 1;
                    if network_attempts > self.retry.max_retries {
                        warn!(
                            provider = self.provider.name(),
                            error = %e,
                            "reputation lookup failed after retries"
                        );
                        return self.give_up(batch);
                    }
                    let delay = self.retry.backoff_for(network_attempts - 1);
                    debug!(error = %e, attempt = network_attempts, "retrying reputation lookup");
                    // Free the slot while backing off.
                    drop(held);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(provider = self.provider.name(), error = %e, "reputation lookup failed");
                    return self.give_up(batch);
                }
            }
        }
    }

    fn settle(&self, batch: &[String], reports: Vec<HashReport>) -> Vec<Settlement> {
        let mut by_hash: HashMap<String, ReputationVerdict> = reports
            .into_iter()
            .map(|r| (r.hash.to_ascii_lowercase(), r.verdict))
            .collect();

        batch
            .iter()
            .map(|hash| {
                by_hash.remove(hash).map_or_else(
                    || {
                        warn!(%hash, "provider response omitted hash");
                        self.stats.failures.fetch_add(1, Ordering::Relaxed);
                        Settlement::Discard(ReputationVerdict::unknown())
                    },
                    Settlement::Store,
                )
            })
            .collect()
    }

    fn give_up(&self, batch: &[String]) -> Vec<Settlement> {
        self.stats
            .failures
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
            .iter()
            .map(|_| Settlement::Discard(ReputationVerdict::unknown()))
            .collect()
    }
}

fn unauthorized(batch: &[String]) -> Vec<Settlement> {
    batch.iter().map(|_| Settlement::Unauthorized).collect()
}

/// Builder for configuring a [`ReputationClient`]
pub struct ReputationClientBuilder {
    provider: Arc<dyn ReputationProvider>,
    cache: Option<Arc<ReputationCache>>,
    worker_budget: usize,
    requests_per_minute: Option<u32>,
    timeout: Duration,
    retry: RetryConfig,
    batch_window: Duration,
}

impl ReputationClientBuilder {
    /// Create a new builder around `provider`
    #[must_use]
    pub fn new(provider: Arc<dyn ReputationProvider>) -> Self {
        Self {
            provider,
            cache: None,
            worker_budget: DEFAULT_WORKER_BUDGET,
            requests_per_minute: None,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryConfig::default(),
            batch_window: DEFAULT_BATCH_WINDOW,
        }
    }

    /// Apply the reputation options of a scan configuration. A cache is only
    /// created from the config if none was set.
    #[must_use]
    pub fn config(mut self, config: &ScanConfig) -> Self {
        self.worker_budget = config.vt_worker_budget;
        self.requests_per_minute = config.vt_requests_per_minute;
        self.timeout = config.request_timeout();
        if self.cache.is_none() {
            self.cache = Some(Arc::new(ReputationCache::new(
                config.cache_max_entries,
                config.cache_ttl(),
            )));
        }
        self
    }

    /// Share an existing cache
    #[must_use]
    pub fn cache(mut self, cache: Arc<ReputationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Maximum concurrent provider requests
    #[must_use]
    pub fn worker_budget(mut self, budget: usize) -> Self {
        self.worker_budget = budget;
        self
    }

    /// Quota on requests per minute
    #[must_use]
    pub const fn requests_per_minute(mut self, rpm: Option<u32>) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    /// Per-request timeout
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set retry configuration
    #[must_use]
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// How long to wait for more hashes when filling a batch
    #[must_use]
    pub const fn batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    /// Build the client and start its dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn build(self) -> ReputationClient {
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(ReputationCache::new(10_000, Duration::from_secs(24 * 60 * 60)))
        });
        let limiter = self
            .requests_per_minute
            .and_then(NonZeroU32::new)
            .map(|rpm| RateLimiter::direct(Quota::per_minute(rpm)));

        let shared = Arc::new(Shared {
            provider: self.provider,
            cache,
            gate: ThrottleGate::new(self.retry.clone()),
            retry: self.retry,
            timeout: self.timeout,
            workers: Arc::new(Semaphore::new(self.worker_budget.max(1))),
            limiter,
            batch_window: self.batch_window,
            disabled: AtomicBool::new(false),
            stats: Counters::default(),
        });

        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(Arc::clone(&shared).dispatch(rx));

        ReputationClient {
            inner: Arc::new(ClientInner { queue, shared }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::future::join_all;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use taskwatch_core::Verdict;

    /// Scripted failure for the next call.
    enum Fault {
        Throttle,
        Unauthorized,
        Network,
        Malformed,
    }

    #[derive(Default)]
    struct FakeProvider {
        batch: usize,
        delay: Duration,
        flagged: Vec<String>,
        omit: Vec<String>,
        faults: Mutex<VecDeque<Fault>>,
        calls: Mutex<Vec<(Instant, Vec<String>)>>,
        outstanding: Mutex<HashMap<String, usize>>,
        max_per_hash: Mutex<usize>,
        concurrent: Mutex<(usize, usize)>,
    }

    impl FakeProvider {
        fn with_faults(faults: impl IntoIterator<Item = Fault>) -> Self {
            Self {
                faults: Mutex::new(faults.into_iter().collect()),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(Instant, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ReputationProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn max_batch_size(&self) -> usize {
            self.batch.max(1)
        }

        async fn query(&self, hashes: &[String]) -> Result<Vec<HashReport>> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), hashes.to_vec()));
            {
                let mut outstanding = self.outstanding.lock().unwrap();
                let mut max = self.max_per_hash.lock().unwrap();
                for h in hashes {
                    let n = outstanding.entry(h.clone()).or_default();
                    *n += 1;
                    *max = (*max).max(*n);
                }
                let mut c = self.concurrent.lock().unwrap();
                c.0 += 1;
                c.1 = c.1.max(c.0);
            }

            tokio::time::sleep(self.delay).await;

            {
                let mut outstanding = self.outstanding.lock().unwrap();
                for h in hashes {
                    if let Some(n) = outstanding.get_mut(h) {
                        *n -= 1;
                    }
                }
                self.concurrent.lock().unwrap().0 -= 1;
            }

            let fault = self.faults.lock().unwrap().pop_front();
            match fault {
                Some(Fault::Throttle) => Err(TaskwatchError::Throttled { retry_after: None }),
                Some(Fault::Unauthorized) => Err(TaskwatchError::Unauthorized),
                Some(Fault::Network) => Err(TaskwatchError::Network("connection reset".into())),
                Some(Fault::Malformed) => {
                    Err(TaskwatchError::MalformedResponse("expected object".into()))
                }
                None => Ok(hashes
                    .iter()
                    .filter(|h| !self.omit.contains(h))
                    .map(|h| {
                        let verdict = if self.flagged.contains(h) {
                            ReputationVerdict::from_detections(12, 70)
                        } else {
                            ReputationVerdict::from_detections(0, 70)
                        };
                        HashReport::new(h.clone(), verdict)
                    })
                    .collect()),
            }
        }
    }

    fn client(provider: &Arc<FakeProvider>, budget: usize) -> ReputationClient {
        let dyn_provider: Arc<dyn ReputationProvider> = Arc::clone(provider) as _;
        ReputationClient::builder(dyn_provider)
            .worker_budget(budget)
            .cache(Arc::new(ReputationCache::new(100, Duration::from_secs(3600))))
            .retry(
                RetryConfig::new()
                    .max_retries(2)
                    .max_throttle_retries(5)
                    .initial_backoff(Duration::from_secs(1))
                    .max_backoff(Duration::from_secs(60)),
            )
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_lookups_for_one_hash_issue_one_request() {
        let provider = Arc::new(FakeProvider {
            delay: Duration::from_millis(200),
            ..FakeProvider::default()
        });
        let client = client(&provider, 4);

        let results = join_all((0..50).map(|_| client.lookup("ABC123"))).await;

        assert_eq!(provider.call_count(), 1);
        assert_eq!(*provider.max_per_hash.lock().unwrap(), 1);
        for r in results {
            assert_eq!(r.unwrap().verdict, Verdict::Clean);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cached_verdict_is_served_until_ttl_expires() {
        let provider = Arc::new(FakeProvider::default());
        let dyn_provider: Arc<dyn ReputationProvider> = Arc::clone(&provider) as _;
        let client = ReputationClient::builder(dyn_provider)
            .cache(Arc::new(ReputationCache::new(100, Duration::from_secs(60))))
            .build();

        client.lookup("abc").await.unwrap();
        client.lookup("abc").await.unwrap();
        assert_eq!(provider.call_count(), 1);
        assert_eq!(client.stats().cache_hits, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        client.lookup("abc").await.unwrap();
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_budget_bounds_concurrency_and_serves_everyone() {
        let provider = Arc::new(FakeProvider {
            delay: Duration::from_millis(100),
            ..FakeProvider::default()
        });
        let client = client(&provider, 2);

        let hashes: Vec<String> = (0..10).map(|i| format!("h{i}")).collect();
        let results = join_all(hashes.iter().map(|h| client.lookup(h))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(provider.concurrent.lock().unwrap().1, 2);
        let mut called: Vec<String> = provider.calls().into_iter().flat_map(|(_, h)| h).collect();
        called.sort();
        let mut expected = hashes.clone();
        expected.sort();
        assert_eq!(called, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn throttling_delays_queued_request_without_dropping_it() {
        let provider = Arc::new(FakeProvider::with_faults([
            Fault::Throttle,
            Fault::Throttle,
            Fault::Throttle,
        ]));
        let client = client(&provider, 3);
        let start = Instant::now();

        let results = join_all(["h1", "h2", "h3", "h4"].map(|h| client.lookup(h))).await;

        for r in &results {
            assert_eq!(r.as_ref().unwrap().verdict, Verdict::Clean);
        }
        assert_eq!(client.stats().throttled, 3);

        let calls = provider.calls();
        // Three throttled attempts, three retries, one first attempt for h4.
        assert_eq!(calls.len(), 7);
        let first_h4 = calls
            .iter()
            .find(|(_, hashes)| hashes.contains(&"h4".to_string()))
            .map(|(at, _)| *at)
            .unwrap();
        // Three strikes: windows of 1s, 2s and 4s, all opened at start.
        assert!(first_h4 - start >= Duration::from_secs(4));
        for (at, _) in &calls[3..] {
            assert!(*at - start >= Duration::from_secs(4));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_are_retried_then_reported_unknown() {
        let provider = Arc::new(FakeProvider::with_faults([
            Fault::Network,
            Fault::Network,
            Fault::Network,
        ]));
        let client = client(&provider, 1);

        let verdict = client.lookup("dead").await.unwrap();
        assert_eq!(verdict.verdict, Verdict::Unknown);
        assert_eq!(provider.call_count(), 3);
        assert!(client.cache().record("dead").is_none());

        // Nothing cached, so a later lookup asks again and now succeeds.
        let verdict = client.lookup("dead").await.unwrap();
        assert_eq!(verdict.verdict, Verdict::Clean);
        assert_eq!(provider.call_count(), 4);
    }

    #[tokio::test]
    async fn auth_failure_disables_the_client() {
        let provider = Arc::new(FakeProvider::with_faults([Fault::Unauthorized]));
        let client = client(&provider, 2);

        let err = client.lookup("aa").await.unwrap_err();
        assert!(err.is_auth_error());
        assert!(client.is_disabled());

        tokio_test::assert_err!(client.lookup("bb").await);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn malformed_response_is_unknown_and_not_cached() {
        let provider = Arc::new(FakeProvider::with_faults([Fault::Malformed]));
        let client = client(&provider, 1);

        let verdict = tokio_test::assert_ok!(client.lookup("aa").await);
        assert_eq!(verdict.verdict, Verdict::Unknown);
        assert!(client.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_lookups_are_batched_without_changing_results() {
        let provider = Arc::new(FakeProvider {
            batch: 4,
            flagged: vec!["h2".into()],
            ..FakeProvider::default()
        });
        let client = client(&provider, 1);

        let results = join_all(["h0", "h1", "h2", "h3"].map(|h| client.lookup(h))).await;

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, vec!["h0", "h1", "h2", "h3"]);
        let verdicts: Vec<Verdict> = results.into_iter().map(|r| r.unwrap().verdict).collect();
        assert_eq!(
            verdicts,
            vec![Verdict::Clean, Verdict::Clean, Verdict::Flagged, Verdict::Clean]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hash_missing_from_batch_response_is_unknown() {
        let provider = Arc::new(FakeProvider {
            batch: 2,
            omit: vec!["gone".into()],
            ..FakeProvider::default()
        });
        let client = client(&provider, 1);

        let (kept, gone) = tokio::join!(client.lookup("kept"), client.lookup("gone"));
        assert_eq!(kept.unwrap().verdict, Verdict::Clean);
        assert_eq!(gone.unwrap().verdict, Verdict::Unknown);
        assert!(client.cache().get("kept").is_some());
        assert!(client.cache().record("gone").is_none());
    }
}
