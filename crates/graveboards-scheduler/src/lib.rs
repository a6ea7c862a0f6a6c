// SPDX-License-Identifier: GPL-3.0-or-later
pub mod archive;
pub mod job;
pub mod jobs;
pub mod queue;
pub mod service;
pub mod subscriber;
#[cfg(test)]
mod testing;
pub mod work_queue;

use anyhow::Result;
use graveboards_config::AppConfig;
use graveboards_domain::TaskKind;
use graveboards_infrastructure::cache::SharedCache;
use graveboards_infrastructure::clock::Clock;
use graveboards_infrastructure::lock::DistributedLock;
use graveboards_infrastructure::Persistence;
use graveboards_osu::OsuApi;
use graveboards_realtime::PubSub;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use archive::Archiver;
use jobs::{MapperRefreshJob, ProfileRefreshJob, ScoreRefreshJob};
use service::{RecurringService, ServiceSettings};
use work_queue::{RequestHandler, WorkQueueProcessor};

/// Client handles the daemon runs on. Opened by the caller before
/// construction and closed by the caller after [`Daemon::shutdown`].
#[derive(Clone)]
pub struct DaemonContext {
    pub config: AppConfig,
    pub persistence: Persistence,
    pub cache: Arc<dyn SharedCache>,
    pub bus: Arc<dyn PubSub>,
    pub osu: Arc<dyn OsuApi>,
    pub clock: Arc<dyn Clock>,
}

/// Owns the three recurring services and the work queue processor.
pub struct Daemon {
    services: Vec<Arc<RecurringService>>,
    work_queue: Arc<WorkQueueProcessor>,
    shutdown: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<Result<()>>)>,
}

impl Daemon {
    pub fn new(ctx: DaemonContext) -> Self {
        let DaemonContext {
            config,
            persistence,
            cache,
            bus,
            osu,
            clock,
        } = ctx;

        let lock = DistributedLock::new(cache.clone(), config.lock.ttl(), config.lock.poll_interval());

        let jobs: [Arc<dyn RecurringJob>; 3] = [
            Arc::new(ProfileRefreshJob::new(
                osu.clone(),
                persistence.profiles.clone(),
                lock.clone(),
                clock.clone(),
            )),
            Arc::new(ScoreRefreshJob::new(
                osu.clone(),
                persistence.scores.clone(),
                persistence.leaderboards.clone(),
            )),
            Arc::new(MapperRefreshJob::new(
                osu.clone(),
                persistence.mappers.clone(),
                clock.clone(),
            )),
        ];

        let services = jobs
            .into_iter()
            .map(|job| {
                let kind = job.kind();
                Arc::new(RecurringService::new(
                    job,
                    persistence.tasks(kind),
                    bus.clone(),
                    clock.clone(),
                    ServiceSettings::from_config(&config.scheduler, kind),
                ))
            })
            .collect();

        let archiver = Arc::new(Archiver::new(
            osu,
            persistence.beatmaps.clone(),
            persistence.mappers.clone(),
            lock.clone(),
            clock.clone(),
        ));
        let work_queue = Arc::new(WorkQueueProcessor::new(
            cache,
            bus,
            Arc::new(RequestHandler::new(archiver, persistence.requests.clone())),
            lock,
            clock,
            config.scheduler.max_concurrent_jobs,
        ));

        let (shutdown, _) = watch::channel(false);
        Self {
            services,
            work_queue,
            shutdown,
            handles: Vec::new(),
        }
    }

    pub fn service(&self, kind: TaskKind) -> Option<&Arc<RecurringService>> {
        self.services.iter().find(|s| s.kind() == kind)
    }

    pub fn work_queue(&self) -> &Arc<WorkQueueProcessor> {
        &self.work_queue
    }

    /// Start every component. Each one loads its state and subscribes before
    /// its loops are spawned, so an unreachable store or bus fails here and
    /// stops whatever already started. Calling it twice is a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if !self.handles.is_empty() {
            return Ok(());
        }

        for service in self.services.clone() {
            let name = service.kind().to_string();
            match service.start(self.shutdown.subscribe()).await {
                Ok(handle) => self.handles.push((name, handle)),
                Err(err) => return Err(self.abort_start(err.context(format!("starting {name}"))).await),
            }
        }
        match self.work_queue.clone().start(self.shutdown.subscribe()).await {
            Ok(handle) => self.handles.push(("work_queue".to_string(), handle)),
            Err(err) => return Err(self.abort_start(err.context("starting work_queue")).await),
        }

        info!(target: "daemon", components = self.handles.len(), "daemon started");
        Ok(())
    }

    async fn abort_start(&mut self, err: anyhow::Error) -> anyhow::Error {
        error!(target: "daemon", error = %format!("{err:#}"), "startup failed, stopping started components");
        self.shutdown.send_replace(true);
        for (_, handle) in self.handles.drain(..) {
            let _ = handle.await;
        }
        err
    }

    /// Signal every loop to stop and wait for them, in-flight handlers included.
    pub async fn shutdown(self) -> Result<()> {
        info!(target: "daemon", "shutting down");
        self.shutdown.send_replace(true);

        let mut failed = 0usize;
        for (name, handle) in self.handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failed += 1;
                    error!(target: "daemon", component = %name, error = %format!("{err:#}"), "component exited with error");
                }
                Err(err) => {
                    failed += 1;
                    error!(target: "daemon", component = %name, error = %err, "component task failed");
                }
            }
        }

        if failed > 0 {
            anyhow::bail!("{failed} component(s) failed");
        }
        info!(target: "daemon", "daemon stopped");
        Ok(())
    }

    /// Start, wait for `signal`, then shut down.
    pub async fn run_until<F>(mut self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.shutdown().await
    }
}

// Re-export key types for convenience
pub use job::{JobContext, JobResult, RecurringJob};
pub use queue::TaskQueue;
pub use work_queue::{WorkQueueError, WORK_CHANNEL};
