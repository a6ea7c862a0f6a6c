// SPDX-License-Identifier: GPL-3.0-or-later

//! One-shot queue requests.
//!
//! A submission is stored as a hash `queue_request_handler_task:{queue}:{set}`
//! in the shared cache and its key is announced on
//! `queue_request_handler_tasks`. The processor picks announcements up,
//! runs the archive workflow once per accepted submission and stamps the
//! record `completed_at` or `failed_at`.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use futures_util::{FutureExt, StreamExt};
use graveboards_domain::{DedupeKey, Request, ValidationError, WorkItem, WorkStatus};
use graveboards_infrastructure::cache::{CacheError, SharedCache};
use graveboards_infrastructure::clock::Clock;
use graveboards_infrastructure::lock::DistributedLock;
use graveboards_infrastructure::repositories::RequestRepository;
use graveboards_realtime::{BusError, MessageStream, PubSub};
use thiserror::Error;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::archive::Archiver;

pub const WORK_CHANNEL: &str = "queue_request_handler_tasks";
const RECORD_PREFIX: &str = "queue_request_handler_task:";

pub fn record_key(key: &DedupeKey) -> String {
    format!("{RECORD_PREFIX}{key}")
}

#[derive(Debug, Error)]
pub enum WorkQueueError {
    #[error("request {key} is already pending")]
    Conflict { key: DedupeKey },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("invalid work record: {0}")]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WorkQueueError>;

/// The workflow run for each dequeued item.
#[async_trait::async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, item: &WorkItem) -> anyhow::Result<()>;
}

/// Archives the requested beatmapset and records the request.
pub struct RequestHandler {
    archiver: Arc<Archiver>,
    requests: Arc<dyn RequestRepository>,
}

impl RequestHandler {
    pub fn new(archiver: Arc<Archiver>, requests: Arc<dyn RequestRepository>) -> Self {
        Self { archiver, requests }
    }
}

#[async_trait::async_trait]
impl WorkHandler for RequestHandler {
    async fn handle(&self, item: &WorkItem) -> anyhow::Result<()> {
        self.archiver
            .archive(item.beatmapset_id)
            .await
            .with_context(|| format!("archiving beatmapset {}", item.beatmapset_id))?;
        self.requests
            .add_request(&Request::from(item))
            .await
            .context("storing request")?;
        Ok(())
    }
}

/// Items waiting for a permit, plus every key that is queued or running.
///
/// A claimed key whose announcement arrives again is flagged for a recheck
/// once the current run is stamped, so a resubmission racing the stamp is
/// not lost and a duplicate delivery finds the record resolved.
#[derive(Default)]
struct Backlog {
    items: VecDeque<WorkItem>,
    claimed: HashMap<DedupeKey, bool>,
}

pub struct WorkQueueProcessor {
    cache: Arc<dyn SharedCache>,
    bus: Arc<dyn PubSub>,
    handler: Arc<dyn WorkHandler>,
    lock: DistributedLock,
    clock: Arc<dyn Clock>,
    backlog: Mutex<Backlog>,
    wake: Notify,
    max_concurrent: usize,
}

impl WorkQueueProcessor {
    pub fn new(
        cache: Arc<dyn SharedCache>,
        bus: Arc<dyn PubSub>,
        handler: Arc<dyn WorkHandler>,
        lock: DistributedLock,
        clock: Arc<dyn Clock>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            cache,
            bus,
            handler,
            lock,
            clock,
            backlog: Mutex::new(Backlog::default()),
            wake: Notify::new(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    fn backlog(&self) -> MutexGuard<'_, Backlog> {
        self.backlog.lock().unwrap_or_else(|poisoned| {
            warn!(target: "work_queue", "backlog mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Accept a request unless an identical one is still pending.
    ///
    /// A failed or completed earlier record is replaced. If the announcement
    /// cannot be published the record is removed again.
    pub async fn submit(&self, mut item: WorkItem) -> Result<DedupeKey> {
        let key = item.dedupe_key();
        let Some(guard) = self
            .lock
            .acquire(&format!("work_submit:{key}"), self.lock.ttl())
            .await?
        else {
            return Err(WorkQueueError::Conflict { key });
        };

        item.completed_at = None;
        item.failed_at = None;
        let stored = self.store_new(&key, &item).await;
        let outcome = match stored {
            Ok(()) => self.announce(&key).await,
            Err(err) => Err(err),
        };
        guard.release().await;
        outcome?;

        info!(target: "work_queue", %key, requester_id = %item.requester_id, "request accepted");
        Ok(key)
    }

    async fn announce(&self, key: &DedupeKey) -> Result<()> {
        let Err(err) = self.bus.publish(WORK_CHANNEL, &key.to_string()).await else {
            return Ok(());
        };
        warn!(target: "work_queue", %key, error = %err, "announcement failed, withdrawing request");
        if let Err(cleanup) = self.cache.delete(&record_key(key)).await {
            error!(target: "work_queue", %key, error = %cleanup, "failed to withdraw unannounced request");
        }
        Err(err.into())
    }

    async fn store_new(&self, key: &DedupeKey, item: &WorkItem) -> Result<()> {
        let record = record_key(key);
        if let Some(existing) = self.get(key).await? {
            match existing.status() {
                WorkStatus::Pending => return Err(WorkQueueError::Conflict { key: *key }),
                status => {
                    debug!(target: "work_queue", %key, %status, "replacing resolved request");
                    self.cache.delete(&record).await?;
                }
            }
        }
        self.cache.hset_all(&record, &item.to_fields()).await?;
        Ok(())
    }

    pub async fn get(&self, key: &DedupeKey) -> Result<Option<WorkItem>> {
        let fields = self.cache.hget_all(&record_key(key)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(WorkItem::from_fields(&fields)?))
    }

    /// Every stored request, skipping records that no longer decode.
    pub async fn list(&self) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        for record in self.cache.keys(RECORD_PREFIX).await? {
            let fields = self.cache.hget_all(&record).await?;
            match WorkItem::from_fields(&fields) {
                Ok(item) => items.push(item),
                Err(err) => warn!(target: "work_queue", %record, error = %err, "skipping undecodable record"),
            }
        }
        Ok(items)
    }

    pub fn pending_len(&self) -> usize {
        self.backlog().items.len()
    }

    /// Claim `key` for this process. A key already claimed is flagged for
    /// a recheck when its current run finishes.
    fn claim(&self, key: DedupeKey) -> bool {
        let mut backlog = self.backlog();
        match backlog.claimed.get_mut(&key) {
            Some(recheck) => {
                *recheck = true;
                false
            }
            None => {
                backlog.claimed.insert(key, false);
                true
            }
        }
    }

    /// Drop the claim on `key`, returning whether a recheck was requested.
    fn release(&self, key: &DedupeKey) -> bool {
        self.backlog().claimed.remove(key).unwrap_or(false)
    }

    fn enqueue(&self, item: WorkItem) {
        self.backlog().items.push_back(item);
        self.wake.notify_one();
    }

    async fn next_item(&self) -> WorkItem {
        loop {
            let next = self.backlog().items.pop_front();
            if let Some(item) = next {
                return item;
            }
            self.wake.notified().await;
        }
    }

    /// Subscribe and check the cache, then spawn the subscriber and the
    /// consumer. Errors before the spawn mean the processor never ran.
    pub async fn start(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        let messages = self
            .bus
            .subscribe(WORK_CHANNEL)
            .await
            .with_context(|| format!("subscribing to {WORK_CHANNEL}"))?;
        let stored = self.list().await.context("listing stored requests")?;
        let unresolved = stored.iter().filter(|item| item.is_unresolved()).count();
        if unresolved > 0 {
            warn!(target: "work_queue", unresolved, "requests left pending by an earlier run");
        }
        info!(target: "work_queue", channel = WORK_CHANNEL, max_concurrent = self.max_concurrent, "work queue started");

        Ok(tokio::spawn(async move {
            tokio::join!(self.listen(messages, shutdown.clone()), self.consume(shutdown));
            info!(target: "work_queue", "work queue stopped");
            Ok(())
        }))
    }

    async fn listen(&self, mut messages: MessageStream, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                message = messages.next() => match message {
                    Some(message) => self.accept_announcement(&message).await,
                    None => {
                        warn!(target: "work_queue", "bus subscription closed");
                        break;
                    }
                },
            }
        }
    }

    async fn accept_announcement(&self, message: &str) {
        match message.trim().parse() {
            Ok(key) => self.accept(key).await,
            Err(err) => {
                warn!(target: "work_queue", %message, error = %err, "ignoring malformed request key")
            }
        }
    }

    async fn accept(&self, key: DedupeKey) {
        loop {
            if !self.claim(key) {
                debug!(target: "work_queue", %key, "request already in flight, rechecking after it finishes");
                return;
            }

            match self.get(&key).await {
                Ok(Some(item)) if item.is_unresolved() => {
                    debug!(target: "work_queue", %key, "request queued");
                    self.enqueue(item);
                    return;
                }
                Ok(Some(item)) => {
                    debug!(target: "work_queue", %key, status = %item.status(), "request already resolved, ignoring");
                }
                Ok(None) => warn!(target: "work_queue", %key, "announced request has no record, dropping"),
                Err(err) => warn!(target: "work_queue", %key, error = %err, "failed to load announced request, dropping"),
            }

            if !self.release(&key) {
                return;
            }
        }
    }

    async fn consume(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => log_join(joined),
                item = self.next_item() => {
                    let permit = tokio::select! {
                        _ = shutdown.changed() => {
                            self.backlog().items.push_front(item);
                            break;
                        }
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let processor = Arc::clone(self);
                    let stop = shutdown.clone();
                    handlers.spawn(async move {
                        let _permit = permit;
                        processor.process(item, stop).await;
                    });
                }
            }
        }

        let unstarted: Vec<WorkItem> = self.backlog().items.drain(..).collect();
        for item in unstarted {
            self.finish(item, Err(anyhow::anyhow!("daemon stopped before the request started")))
                .await;
        }
        // Running handlers stamp themselves as interrupted.
        while let Some(joined) = handlers.join_next().await {
            log_join(joined);
        }
    }

    /// Run one item until it finishes or shutdown interrupts it, then stamp
    /// its record with the outcome.
    async fn process(&self, item: WorkItem, mut shutdown: watch::Receiver<bool>) {
        let key = item.dedupe_key();
        debug!(target: "work_queue", %key, "processing request");

        let run = AssertUnwindSafe(self.handler.handle(&item)).catch_unwind();
        let outcome = tokio::select! {
            outcome = run => outcome.unwrap_or_else(|_| Err(anyhow::anyhow!("work handler panicked"))),
            stopped = shutdown.wait_for(|stop| *stop) => match stopped {
                Ok(_) => Err(anyhow::anyhow!("interrupted by daemon shutdown")),
                Err(_) => Err(anyhow::anyhow!("shutdown signal lost")),
            },
        };

        let stopping = *shutdown.borrow();
        if self.finish(item, outcome).await && !stopping {
            self.accept(key).await;
        }
    }

    /// Stamp the record, log the outcome and drop the claim. Returns whether
    /// the key was announced again while it was held.
    async fn finish(&self, mut item: WorkItem, outcome: anyhow::Result<()>) -> bool {
        let key = item.dedupe_key();
        let now = self.clock.now();
        match &outcome {
            Ok(()) => item.completed_at = Some(now),
            Err(_) => item.failed_at = Some(now),
        }
        if let Err(err) = self.cache.hset_all(&record_key(&key), &item.to_fields()).await {
            error!(target: "work_queue", %key, error = %err, "failed to stamp request outcome");
        }

        self.on_complete(&item, outcome);
        self.release(&key)
    }

    fn on_complete(&self, item: &WorkItem, outcome: anyhow::Result<()>) {
        match outcome {
            Ok(()) => info!(
                target: "work_queue",
                requester_id = %item.requester_id,
                queue_id = %item.queue_id,
                beatmapset_id = %item.beatmapset_id,
                "request completed"
            ),
            Err(err) => error!(
                target: "work_queue",
                requester_id = %item.requester_id,
                queue_id = %item.queue_id,
                beatmapset_id = %item.beatmapset_id,
                error = %format!("{err:#}"),
                "request failed"
            ),
        }
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(err) = joined {
        if !err.is_cancelled() {
            error!(target: "work_queue", error = %err, "work handler task failed");
        }
    }
}
