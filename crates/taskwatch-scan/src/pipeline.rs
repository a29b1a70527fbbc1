//! Classification of binary items: inspect, then ask the reputation service.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use taskwatch_client::ReputationClient;
use taskwatch_core::{ItemRef, ItemUpdate, TaskwatchError, TrustLevel};
use tokio::sync::{mpsc, OnceCell, Semaphore};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::inspect::{CodeInspector, Inspection};

/// A binary waiting to be classified.
#[derive(Debug, Clone)]
pub(crate) struct ClassifyJob {
    pub item: ItemRef,
    pub path: PathBuf,
}

/// What the pipeline reports back to the session writer.
#[derive(Debug)]
pub(crate) enum PipelineEvent {
    Update(ItemUpdate),
    ReputationDisabled { provider: &'static str },
    /// One job finished, whether or not it produced updates.
    Done,
}

#[derive(Debug, Clone)]
enum Inspected {
    Done(Inspection),
    Vanished,
    Failed,
}

pub(crate) struct PipelineOptions {
    pub hash_workers: usize,
    pub include_platform_signed: bool,
}

pub(crate) struct Pipeline {
    inspector: Arc<dyn CodeInspector>,
    client: Option<ReputationClient>,
    hash_slots: Semaphore,
    /// Inspections already run (or running) this session, by path
    memo: Mutex<HashMap<PathBuf, Arc<OnceCell<Inspected>>>>,
    include_platform_signed: bool,
    cancel: CancelToken,
    out: mpsc::UnboundedSender<PipelineEvent>,
    disabled_reported: AtomicBool,
}

impl Pipeline {
    pub(crate) fn new(
        inspector: Arc<dyn CodeInspector>,
        client: Option<ReputationClient>,
        options: &PipelineOptions,
        cancel: CancelToken,
        out: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        Self {
            inspector,
            client,
            hash_slots: Semaphore::new(options.hash_workers.max(1)),
            memo: Mutex::new(HashMap::new()),
            include_platform_signed: options.include_platform_signed,
            cancel,
            out,
            disabled_reported: AtomicBool::new(false),
        }
    }

    /// Classify one binary and report `Done` afterwards.
    pub(crate) async fn classify(self: Arc<Self>, job: ClassifyJob) {
        self.run(&job).await;
        let _ = self.out.send(PipelineEvent::Done);
    }

    fn emit(&self, update: ItemUpdate) {
        let _ = self.out.send(PipelineEvent::Update(update));
    }

    async fn run(&self, job: &ClassifyJob) {
        if self.cancel.is_cancelled() {
            return;
        }

        let inspection = match self.inspect(&job.path).await {
            Inspected::Done(inspection) => inspection,
            Inspected::Vanished => {
                self.emit(ItemUpdate {
                    vanished: true,
                    ..ItemUpdate::trust(job.item, TrustLevel::Unknown)
                });
                return;
            }
            Inspected::Failed => return,
        };
        if self.cancel.is_cancelled() {
            return;
        }

        let Inspection { hash, signature } = inspection;
        let skip_lookup = signature.is_platform() && !self.include_platform_signed;
        self.emit(ItemUpdate {
            hash: Some(hash.clone()),
            signature: Some(signature.clone()),
            ..ItemUpdate::trust(job.item, signature.trust())
        });

        if skip_lookup {
            return;
        }
        let Some(client) = &self.client else {
            return;
        };
        if client.is_disabled() {
            self.report_disabled(client);
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }

        let result = tokio::select! {
            r = client.lookup(&hash) => r,
            () = self.cancel.cancelled() => {
                debug!(%hash, "abandoning lookup for cancelled scan");
                return;
            }
        };
        match result {
            Ok(verdict) => {
                if self.cancel.is_cancelled() {
                    debug!(%hash, "discarding verdict for cancelled scan");
                    return;
                }
                self.emit(ItemUpdate {
                    reputation: Some(verdict.clone()),
                    ..ItemUpdate::trust(job.item, verdict.trust())
                });
            }
            Err(e) if e.is_auth_error() => self.report_disabled(client),
            Err(e) => debug!(%hash, error = %e, "reputation lookup failed"),
        }
    }

    fn report_disabled(&self, client: &ReputationClient) {
        if !self.disabled_reported.swap(true, Ordering::AcqRel) {
            warn!(
                provider = client.provider_name(),
                "reputation lookups disabled for this scan"
            );
            let _ = self.out.send(PipelineEvent::ReputationDisabled {
                provider: client.provider_name(),
            });
        }
    }

    /// Inspect `path`, at most once per session.
    async fn inspect(&self, path: &Path) -> Inspected {
        let cell = {
            let mut memo = self.memo.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(memo.entry(path.to_path_buf()).or_default())
        };
        cell.get_or_init(|| self.run_inspection(path.to_path_buf()))
            .await
            .clone()
    }

    async fn run_inspection(&self, path: PathBuf) -> Inspected {
        let Ok(_permit) = self.hash_slots.acquire().await else {
            return Inspected::Failed;
        };

        let inspector = Arc::clone(&self.inspector);
        let target = path.clone();
        match tokio::task::spawn_blocking(move || inspector.inspect(&target)).await {
            Ok(Ok(inspection)) => Inspected::Done(inspection),
            Ok(Err(TaskwatchError::NotFound { .. })) => {
                debug!(path = %path.display(), "binary vanished before inspection");
                Inspected::Vanished
            }
            Ok(Err(e)) => {
                debug!(path = %path.display(), error = %e, "skipping binary");
                Inspected::Failed
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "inspection worker failed");
                Inspected::Failed
            }
        }
    }
}
