//! A scan session: enumerator thread, classification pipeline and the
//! single writer that owns the task table.
//!
//! ```text
//! spawn_blocking(TaskEnumerator) --Discovery--> writer --ClassifyJob--> Pipeline
//!                                                 ^                        |
//!                                                 +-----PipelineEvent------+
//! writer --Arc<Snapshot>--> watch      writer --ScanEvent--> consumer
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use taskwatch_client::ReputationClient;
use taskwatch_core::{
    Item, ItemCategory, ItemRef, ItemSlot, ScanConfig, Task, TaskHandle, TrustLevel,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::discovery::{Discovery, ProcessSource, ProcfsSource, TaskEnumerator};
use crate::filter::{self, TaskRow, TrustFilter, ViewQuery};
use crate::inspect::{CodeInspector, FileInspector};
use crate::pipeline::{ClassifyJob, Pipeline, PipelineEvent, PipelineOptions};

/// Incremental progress of a scan, in the order the writer applied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    TaskDiscovered {
        task: TaskHandle,
        pid: i32,
    },
    ItemsDiscovered {
        task: TaskHandle,
        category: ItemCategory,
        count: usize,
        partial: bool,
    },
    TaskStale {
        task: TaskHandle,
    },
    ItemUpdated {
        item: ItemRef,
        trust: TrustLevel,
    },
    /// The reputation service rejected our credentials; the rest of the scan
    /// runs without reputation.
    ReputationDisabled {
        provider: String,
    },
    EnumerationFinished {
        tasks: usize,
        cancelled: bool,
        error: Option<String>,
    },
    ScanFinished {
        cancelled: bool,
    },
}

/// Immutable view of the task table at one instant.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    tasks: Vec<Arc<Task>>,
    enumeration_done: bool,
    finished: bool,
    cancelled: bool,
    reputation_disabled: bool,
    pending: usize,
}

impl Snapshot {
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    pub fn task(&self, handle: TaskHandle) -> Option<&Arc<Task>> {
        self.tasks.get(handle.index())
    }

    pub fn find_pid(&self, pid: i32) -> Option<&Arc<Task>> {
        self.tasks.iter().find(|t| t.pid == pid)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub const fn is_enumeration_done(&self) -> bool {
        self.enumeration_done
    }

    /// Enumeration and every classification job have completed.
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    pub const fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub const fn reputation_disabled(&self) -> bool {
        self.reputation_disabled
    }

    /// Classification jobs not yet completed.
    pub const fn pending_jobs(&self) -> usize {
        self.pending
    }

    pub fn view(&self, query: &ViewQuery) -> Vec<TaskRow> {
        filter::view(&self.tasks, query)
    }

    pub fn view_items(
        &self,
        task: TaskHandle,
        category: ItemCategory,
        text: &str,
        trust: TrustFilter,
    ) -> Vec<&Item> {
        self.task(task)
            .map(|t| filter::view_items(t, category, text, trust))
            .unwrap_or_default()
    }
}

/// Starts scans. Holds the OS source, inspector and optional reputation
/// client shared by every session it starts.
pub struct Scanner {
    config: ScanConfig,
    source: Arc<dyn ProcessSource>,
    inspector: Arc<dyn CodeInspector>,
    client: Option<ReputationClient>,
}

impl Scanner {
    /// Scanner over the live system without reputation lookups.
    #[must_use]
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            source: Arc::new(ProcfsSource::new()),
            inspector: Arc::new(FileInspector::default()),
            client: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn ProcessSource>) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_inspector(mut self, inspector: Arc<dyn CodeInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    #[must_use]
    pub fn with_reputation(mut self, client: ReputationClient) -> Self {
        self.client = Some(client);
        self
    }

    pub const fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Start a scan. Must be called from within a Tokio runtime.
    pub fn start(&self) -> ScanHandle {
        self.start_with(CancelToken::new())
    }

    /// Start a scan that stops when `cancel` fires.
    pub fn start_with(&self, cancel: CancelToken) -> ScanHandle {
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Snapshot::default()));

        let client = self
            .client
            .clone()
            .filter(|_| self.config.reputation_enabled);
        info!(
            reputation = client.as_ref().map(ReputationClient::provider_name),
            hash_workers = self.config.hash_workers,
            "scan started"
        );

        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&self.inspector),
            client,
            &PipelineOptions {
                hash_workers: self.config.hash_workers,
                include_platform_signed: self.config.include_apple_signed_in_reputation,
            },
            cancel.clone(),
            pipeline_tx,
        ));

        let source = Arc::clone(&self.source);
        let token = cancel.clone();
        tokio::task::spawn_blocking(move || enumerate(source, token, &discovery_tx));

        let writer = Writer {
            snapshot: Snapshot::default(),
            publish: snapshot_tx,
            events: event_tx,
            pipeline,
            cancel: cancel.clone(),
            outstanding: 0,
        };
        let writer = tokio::spawn(writer.run(discovery_rx, pipeline_rx));

        ScanHandle {
            events: Some(event_rx),
            snapshot: snapshot_rx,
            cancel,
            writer,
        }
    }
}

enum EnumerationMsg {
    Step(Discovery),
    Finished {
        cancelled: bool,
        error: Option<String>,
    },
}

/// Body of the blocking enumeration thread.
fn enumerate(
    source: Arc<dyn ProcessSource>,
    cancel: CancelToken,
    tx: &mpsc::UnboundedSender<EnumerationMsg>,
) {
    let finished = match TaskEnumerator::new(source, cancel).enumerate() {
        Ok(mut tasks) => {
            while tasks
                .advance(|step| {
                    let _ = tx.send(EnumerationMsg::Step(step));
                })
                .is_some()
            {}
            EnumerationMsg::Finished {
                cancelled: tasks.was_cancelled(),
                error: None,
            }
        }
        Err(e) => {
            warn!(error = %e, "process enumeration failed");
            EnumerationMsg::Finished {
                cancelled: false,
                error: Some(e.to_string()),
            }
        }
    };
    let _ = tx.send(finished);
}

/// Owns the mutable task table for one session.
struct Writer {
    snapshot: Snapshot,
    publish: watch::Sender<Arc<Snapshot>>,
    events: mpsc::UnboundedSender<ScanEvent>,
    pipeline: Arc<Pipeline>,
    cancel: CancelToken,
    outstanding: usize,
}

impl Writer {
    async fn run(
        mut self,
        mut discovery: mpsc::UnboundedReceiver<EnumerationMsg>,
        mut results: mpsc::UnboundedReceiver<PipelineEvent>,
    ) {
        while !(self.snapshot.enumeration_done && self.outstanding == 0) {
            tokio::select! {
                msg = discovery.recv(), if !self.snapshot.enumeration_done => match msg {
                    Some(EnumerationMsg::Step(step)) => self.on_discovery(step),
                    Some(EnumerationMsg::Finished { cancelled, error }) => {
                        self.on_enumeration_finished(cancelled, error);
                    }
                    None => self.on_enumeration_finished(
                        false,
                        Some("enumeration thread stopped unexpectedly".into()),
                    ),
                },
                Some(event) = results.recv() => self.on_result(event),
                else => break,
            }
        }

        let cancelled = self.cancel.is_cancelled();
        self.snapshot.finished = true;
        self.snapshot.cancelled = cancelled;
        info!(tasks = self.snapshot.len(), cancelled, "scan finished");
        self.commit(Some(ScanEvent::ScanFinished { cancelled }));
    }

    /// Publish the current table and forward `event` to the consumer.
    fn commit(&mut self, event: Option<ScanEvent>) {
        self.snapshot.pending = self.outstanding;
        self.publish.send_replace(Arc::new(self.snapshot.clone()));
        if let Some(event) = event {
            // The consumer may have dropped its receiver; the scan carries on.
            let _ = self.events.send(event);
        }
    }

    fn schedule(&mut self, item: ItemRef, path: &Path) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.outstanding += 1;
        let job = ClassifyJob {
            item,
            path: path.to_path_buf(),
        };
        tokio::spawn(Arc::clone(&self.pipeline).classify(job));
    }

    fn on_discovery(&mut self, step: Discovery) {
        match step {
            Discovery::Task(task) => {
                let handle = TaskHandle(self.snapshot.tasks.len());
                debug_assert_eq!(handle, task.handle);
                let pid = task.pid;
                if let Some(path) = task.executable().and_then(Item::path) {
                    let path = path.to_path_buf();
                    self.schedule(
                        ItemRef {
                            task: handle,
                            slot: ItemSlot::Executable,
                        },
                        &path,
                    );
                }
                self.snapshot.tasks.push(Arc::new(task));
                self.commit(Some(ScanEvent::TaskDiscovered { task: handle, pid }));
            }
            Discovery::Items {
                task: handle,
                category,
                items,
                partial,
            } => {
                let Some(task) = self.snapshot.tasks.get_mut(handle.index()) else {
                    debug!(task = %handle, "items for unknown task");
                    return;
                };
                let count = items.len();
                let task = Arc::make_mut(task);
                let start = task.append_items(category, items, partial);

                if category == ItemCategory::Libraries {
                    let jobs: Vec<(ItemRef, std::path::PathBuf)> = task
                        .items(category)
                        .iter()
                        .enumerate()
                        .skip(start)
                        .filter_map(|(i, item)| {
                            item.path().map(|p| {
                                (
                                    ItemRef {
                                        task: handle,
                                        slot: ItemSlot::Library(i),
                                    },
                                    p.to_path_buf(),
                                )
                            })
                        })
                        .collect();
                    for (item, path) in jobs {
                        self.schedule(item, &path);
                    }
                }

                self.commit(Some(ScanEvent::ItemsDiscovered {
                    task: handle,
                    category,
                    count,
                    partial,
                }));
            }
            Discovery::Stale(handle) => {
                if let Some(task) = self.snapshot.tasks.get_mut(handle.index()) {
                    Arc::make_mut(task).mark_stale();
                    self.commit(Some(ScanEvent::TaskStale { task: handle }));
                }
            }
        }
    }

    fn on_enumeration_finished(&mut self, cancelled: bool, error: Option<String>) {
        self.snapshot.enumeration_done = true;
        info!(
            tasks = self.snapshot.len(),
            pending = self.outstanding,
            "enumeration finished"
        );
        self.commit(Some(ScanEvent::EnumerationFinished {
            tasks: self.snapshot.len(),
            cancelled: cancelled || self.cancel.is_cancelled(),
            error,
        }));
    }

    fn on_result(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Update(update) => {
                if self.cancel.is_cancelled() {
                    return;
                }
                let Some(task) = self.snapshot.tasks.get_mut(update.item.task.index()) else {
                    return;
                };
                let task = Arc::make_mut(task);
                if task.apply_update(&update) {
                    let trust = task
                        .item(update.item.slot)
                        .map_or(TrustLevel::Unknown, Item::trust);
                    self.commit(Some(ScanEvent::ItemUpdated {
                        item: update.item,
                        trust,
                    }));
                }
            }
            PipelineEvent::ReputationDisabled { provider } => {
                self.snapshot.reputation_disabled = true;
                self.commit(Some(ScanEvent::ReputationDisabled {
                    provider: provider.to_string(),
                }));
            }
            PipelineEvent::Done => {
                self.outstanding = self.outstanding.saturating_sub(1);
                self.commit(None);
            }
        }
    }
}

/// Handle to a running scan.
pub struct ScanHandle {
    events: Option<mpsc::UnboundedReceiver<ScanEvent>>,
    snapshot: watch::Receiver<Arc<Snapshot>>,
    cancel: CancelToken,
    writer: JoinHandle<()>,
}

impl ScanHandle {
    /// Next event, or `None` once the scan has finished and every event was
    /// delivered (or the stream was taken with [`events`](Self::events)).
    pub async fn next_event(&mut self) -> Option<ScanEvent> {
        match &mut self.events {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Take the event stream. Returns `None` if already taken.
    pub fn events(&mut self) -> Option<UnboundedReceiverStream<ScanEvent>> {
        self.events.take().map(UnboundedReceiverStream::new)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Receiver notified whenever a new snapshot is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot.clone()
    }

    pub fn view(&self, query: &ViewQuery) -> Vec<TaskRow> {
        self.snapshot().view(query)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.writer.is_finished()
    }

    /// Wait for the scan to finish and return the final snapshot.
    pub async fn wait(self) -> Arc<Snapshot> {
        if let Err(e) = self.writer.await {
            warn!(error = %e, "scan writer stopped abnormally");
        }
        Arc::clone(&self.snapshot.borrow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::SortKey;
    use crate::testing::{FakeInspector, FakeProcess, FakeProvider, FakeSource};
    use std::time::Duration;
    use taskwatch_client::{ReputationCache, ReputationProvider};
    use taskwatch_core::SignatureStatus;
    use tokio_stream::StreamExt;

    fn client(provider: &Arc<FakeProvider>) -> ReputationClient {
        let provider: Arc<dyn ReputationProvider> = Arc::clone(provider) as _;
        ReputationClient::builder(provider)
            .cache(Arc::new(ReputationCache::new(1000, Duration::from_secs(3600))))
            .build()
    }

    fn scanner(source: FakeSource, inspector: FakeInspector) -> Scanner {
        Scanner::new(ScanConfig::default())
            .with_source(Arc::new(source))
            .with_inspector(Arc::new(inspector))
    }

    #[tokio::test]
    async fn flagged_library_surfaces_its_task() {
        let provider = Arc::new(FakeProvider::flagging(&["abc123"]));
        let source = FakeSource::new(vec![
            FakeProcess::new(1, 0, "init"),
            FakeProcess::new(100, 1, "app").library("/opt/app/libhelper.so"),
        ]);
        let inspector = FakeInspector::default()
            .with(
                "/usr/bin/init",
                "1111",
                SignatureStatus::PlatformSigned {
                    package: "systemd".into(),
                },
            )
            .with("/opt/app/libhelper.so", "abc123", SignatureStatus::Unsigned);

        let snapshot = scanner(source, inspector)
            .with_reputation(client(&provider))
            .start()
            .wait()
            .await;

        assert!(snapshot.is_finished());
        let app = snapshot.find_pid(100).unwrap();
        let lib = &app.items(ItemCategory::Libraries)[0];
        assert_eq!(lib.trust(), TrustLevel::Flagged);
        assert_eq!(lib.hash(), Some("abc123"));

        let rows = snapshot.view(
            &ViewQuery::default().trust(TrustFilter::only(TrustLevel::Flagged)),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task.pid, 100);

        // Platform-signed init never reached the provider.
        assert!(!provider.queried().contains(&"1111".to_string()));
        assert_eq!(
            snapshot.find_pid(1).unwrap().aggregate_trust(),
            TrustLevel::TrustedPlatform
        );
    }

    #[tokio::test]
    async fn cancel_after_two_processes_publishes_two_tasks() {
        let cancel = CancelToken::new();
        let processes = (1..=5)
            .map(|pid| FakeProcess::new(pid, 0, &format!("p{pid}")).library(&format!("/lib/l{pid}.so")))
            .collect();
        let source = FakeSource::new(processes).cancel_after(2, cancel.clone());
        let provider = Arc::new(FakeProvider::default());

        let mut handle = scanner(source, FakeInspector::default())
            .with_reputation(client(&provider))
            .start_with(cancel);
        let mut discovered = 0;
        while let Some(event) = handle.next_event().await {
            if matches!(event, ScanEvent::TaskDiscovered { .. }) {
                discovered += 1;
            }
        }
        let snapshot = handle.wait().await;

        assert_eq!(discovered, 2);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.was_cancelled());
        let queried = provider.queried();
        for pid in 3..=5 {
            assert!(!queried.contains(&FakeInspector::hash_of(&format!("/lib/l{pid}.so"))));
            assert!(!queried.contains(&FakeInspector::hash_of(&format!("/usr/bin/p{pid}"))));
        }
    }

    #[tokio::test]
    async fn events_arrive_in_application_order() {
        let source = FakeSource::new(vec![
            FakeProcess::new(1, 0, "init").library("/lib/libc.so.6"),
            FakeProcess::new(2, 1, "worker").gone(),
        ]);
        let mut handle = scanner(source, FakeInspector::default()).start();
        let events: Vec<ScanEvent> = handle.events().unwrap().collect().await;

        assert!(matches!(
            events.first(),
            Some(ScanEvent::TaskDiscovered { pid: 1, .. })
        ));
        assert!(matches!(
            events.last(),
            Some(ScanEvent::ScanFinished { cancelled: false })
        ));
        let enumeration_done = events
            .iter()
            .position(|e| matches!(e, ScanEvent::EnumerationFinished { tasks: 2, .. }))
            .unwrap();
        let stale = events
            .iter()
            .position(|e| matches!(e, ScanEvent::TaskStale { .. }))
            .unwrap();
        assert!(stale < enumeration_done);
        assert!(events
            .iter()
            .any(|e| matches!(e, ScanEvent::ItemUpdated { trust: TrustLevel::Untrusted, .. })));
    }

    #[tokio::test]
    async fn rejected_key_disables_reputation_once() {
        let provider = Arc::new(FakeProvider::rejecting_key());
        let source = FakeSource::new(vec![
            FakeProcess::new(1, 0, "init").library("/lib/a.so"),
            FakeProcess::new(2, 1, "cron").library("/lib/b.so"),
        ]);
        let mut handle = scanner(source, FakeInspector::default())
            .with_reputation(client(&provider))
            .start();

        let mut disabled = 0;
        while let Some(event) = handle.next_event().await {
            if matches!(event, ScanEvent::ReputationDisabled { .. }) {
                disabled += 1;
            }
        }
        let snapshot = handle.wait().await;

        assert_eq!(disabled, 1);
        assert!(snapshot.reputation_disabled());
        assert!(snapshot.is_finished());
        // Signature trust still applies without reputation.
        assert!(snapshot
            .tasks()
            .iter()
            .all(|t| t.aggregate_trust() == TrustLevel::Untrusted));
    }

    #[tokio::test]
    async fn reputation_can_be_switched_off() {
        let provider = Arc::new(FakeProvider::default());
        let source = FakeSource::new(vec![FakeProcess::new(1, 0, "init")]);
        let config = ScanConfig {
            reputation_enabled: false,
            ..ScanConfig::default()
        };

        let snapshot = Scanner::new(config)
            .with_source(Arc::new(source))
            .with_inspector(Arc::new(FakeInspector::default()))
            .with_reputation(client(&provider))
            .start()
            .wait()
            .await;

        assert!(provider.queried().is_empty());
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn kernel_threads_and_denied_processes_are_listed() {
        let source = FakeSource::new(vec![
            FakeProcess::new(1, 0, "init"),
            FakeProcess::kernel(2, "kthreadd"),
            FakeProcess::new(3, 1, "secret").denied(),
        ]);
        let handle = scanner(source, FakeInspector::default()).start();
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.len(), 3);
        let kthread = snapshot.find_pid(2).unwrap();
        assert!(kthread.executable().is_none());
        assert!(snapshot.find_pid(3).unwrap().partial().any());

        let tree = snapshot.view(&ViewQuery::default().sort(SortKey::Tree));
        assert_eq!(tree.len(), 3);
    }

    #[tokio::test]
    async fn vanished_library_is_marked_missing() {
        let source = FakeSource::new(vec![FakeProcess::new(1, 0, "init").library("/lib/gone.so")]);
        let inspector = FakeInspector::default().missing("/lib/gone.so");
        let snapshot = scanner(source, inspector).start().wait().await;

        let lib = &snapshot.tasks()[0].items(ItemCategory::Libraries)[0];
        assert!(!lib.as_binary().unwrap().exists);
        assert_eq!(lib.trust(), TrustLevel::Unknown);
    }

    #[tokio::test]
    async fn cancel_while_lookups_are_queued_finishes_promptly() {
        let cancel = CancelToken::new();
        let processes = (1..=4)
            .map(|pid| FakeProcess::new(pid, 0, &format!("p{pid}")).library(&format!("/lib/q{pid}.so")))
            .collect();
        let provider = Arc::new(FakeProvider::slow(Duration::from_secs(3600)));
        let provider_dyn: Arc<dyn ReputationProvider> = Arc::clone(&provider) as _;
        let client = ReputationClient::builder(provider_dyn)
            .cache(Arc::new(ReputationCache::new(1000, Duration::from_secs(3600))))
            .worker_budget(1)
            .build();

        let mut handle = scanner(FakeSource::new(processes), FakeInspector::default())
            .with_reputation(client)
            .start_with(cancel.clone());
        while let Some(event) = handle.next_event().await {
            if matches!(event, ScanEvent::EnumerationFinished { .. }) {
                break;
            }
        }
        while provider.queried().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("scan kept waiting on queued lookups");
        assert!(snapshot.is_finished());
        assert!(snapshot.was_cancelled());
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot.pending_jobs(), 0);
    }
}

