// SPDX-License-Identifier: GPL-3.0-or-later

//! One recurring job family: its queue, its scheduler loop and its bus
//! subscriber.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use graveboards_config::{FailurePolicy, SchedulerConfig};
use graveboards_domain::{RecurringTask, TaskId, TaskKind, TaskUpdate};
use graveboards_infrastructure::clock::Clock;
use graveboards_infrastructure::repositories::TaskRepository;
use graveboards_realtime::PubSub;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::job::{JobContext, JobResult, RecurringJob};
use crate::queue::TaskQueue;
use crate::subscriber::TaskSubscriber;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub interval: chrono::Duration,
    pub max_concurrent_jobs: usize,
    pub failure_policy: FailurePolicy,
    pub retry_delay: Duration,
    pub visibility_attempts: u32,
    pub visibility_delay: Duration,
}

impl ServiceSettings {
    pub fn from_config(config: &SchedulerConfig, kind: TaskKind) -> Self {
        let hours = match kind {
            TaskKind::ProfileFetcher => config.profile_interval_hours,
            TaskKind::ScoreFetcher => config.score_interval_hours,
            TaskKind::MapperInfoFetcher => config.mapper_interval_hours,
        };
        Self {
            interval: chrono::Duration::hours(hours as i64),
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            failure_policy: config.failure_policy,
            retry_delay: config.retry_delay(),
            visibility_attempts: config.visibility_attempts,
            visibility_delay: config.visibility_delay(),
        }
    }
}

pub struct RecurringService {
    kind: TaskKind,
    job: Arc<dyn RecurringJob>,
    tasks: Arc<dyn TaskRepository>,
    bus: Arc<dyn PubSub>,
    clock: Arc<dyn Clock>,
    queue: Arc<TaskQueue>,
    settings: ServiceSettings,
}

impl RecurringService {
    pub fn new(
        job: Arc<dyn RecurringJob>,
        tasks: Arc<dyn TaskRepository>,
        bus: Arc<dyn PubSub>,
        clock: Arc<dyn Clock>,
        settings: ServiceSettings,
    ) -> Self {
        let kind = job.kind();
        Self {
            kind,
            job,
            tasks,
            bus,
            queue: Arc::new(TaskQueue::new(clock.clone())),
            clock,
            settings,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Queue every enabled task from persistence.
    pub async fn load_all(&self) -> Result<usize> {
        let tasks = self.tasks.list_tasks(Some(true)).await?;
        let loaded = tasks
            .iter()
            .filter(|task| self.queue.load(task, self.settings.interval))
            .count();
        info!(target: "scheduler", kind = %self.kind, loaded, "loaded recurring tasks");
        Ok(loaded)
    }

    /// Load persisted tasks and subscribe, then spawn the subscriber and the
    /// scheduler loop. Errors before the spawn mean the service never ran.
    pub async fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<Result<()>>> {
        self.load_all()
            .await
            .with_context(|| format!("loading {} tasks", self.kind))?;

        let subscriber = TaskSubscriber::new(
            self.kind,
            self.bus.clone(),
            self.tasks.clone(),
            self.queue.clone(),
            self.settings.interval,
        )
        .visibility(self.settings.visibility_attempts, self.settings.visibility_delay);
        let messages = subscriber
            .subscribe()
            .await
            .with_context(|| format!("subscribing to {}", self.kind.channel()))?;

        Ok(tokio::spawn(async move {
            let ((), scheduled) = tokio::join!(
                subscriber.listen(messages, shutdown.clone()),
                self.schedule(shutdown)
            );
            scheduled
        }))
    }

    async fn schedule(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_jobs));
        let mut handlers = JoinSet::new();
        info!(target: "scheduler", kind = %self.kind, max_concurrent = self.settings.max_concurrent_jobs, "scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(err) = joined {
                        if !err.is_cancelled() {
                            error!(target: "scheduler", kind = %self.kind, error = %err, "handler task failed");
                        }
                    }
                }
                id = self.queue.pop_when_due() => {
                    let permit = tokio::select! {
                        _ = shutdown.changed() => {
                            self.queue.forget(id);
                            break;
                        }
                        permit = semaphore.clone().acquire_owned() => permit?,
                    };
                    let service = Arc::clone(self);
                    handlers.spawn(async move {
                        let _permit = permit;
                        service.execute_contained(id).await;
                    });
                }
            }
        }

        let in_flight = handlers.len();
        handlers.shutdown().await;
        info!(target: "scheduler", kind = %self.kind, in_flight, "scheduler stopped");
        Ok(())
    }

    /// [`execute`](Self::execute), with a panic anywhere in it treated as a
    /// failed run so the id is released or rescheduled.
    async fn execute_contained(&self, id: TaskId) {
        if AssertUnwindSafe(self.execute(id)).catch_unwind().await.is_err() {
            self.on_failure(id, None, anyhow::anyhow!("task handler panicked"));
        }
    }

    /// Run one due task and decide when, if ever, it runs next.
    pub async fn execute(&self, id: TaskId) {
        let task = match self.tasks.get_task(id).await {
            Ok(Some(task)) if task.enabled => task,
            Ok(Some(_)) => {
                debug!(target: "scheduler", kind = %self.kind, task_id = %id, "task disabled, dropping");
                self.queue.forget(id);
                return;
            }
            Ok(None) => {
                warn!(target: "scheduler", kind = %self.kind, task_id = %id, "task no longer exists, dropping");
                self.queue.forget(id);
                return;
            }
            Err(err) => {
                self.on_failure(id, None, err);
                return;
            }
        };

        let ctx = JobContext {
            task_id: task.id,
            owner_id: task.owner_id,
            execution_time: self.clock.now(),
        };

        let outcome = AssertUnwindSafe(self.job.execute(ctx)).catch_unwind().await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow::anyhow!("job panicked")),
        };

        match outcome {
            Ok(JobResult::Success) => self.complete(&task).await,
            Ok(JobResult::Disable { reason }) => self.disable(&task, &reason).await,
            Err(err) => self.on_failure(id, Some(&task), err),
        }
    }

    async fn complete(&self, task: &RecurringTask) {
        let done = self.clock.now();
        match self.tasks.update_task(task.id, &TaskUpdate::fetched_at(done)).await {
            Ok(Some(_)) => {
                let next = done + self.settings.interval;
                self.queue.reschedule(task.id, next);
                debug!(target: "scheduler", kind = %self.kind, task_id = %task.id, %next, "task rescheduled");
            }
            Ok(None) => {
                warn!(target: "scheduler", kind = %self.kind, task_id = %task.id, "task vanished before it could be stamped");
                self.queue.forget(task.id);
            }
            Err(err) => self.on_failure(task.id, Some(task), err),
        }
    }

    async fn disable(&self, task: &RecurringTask, reason: &str) {
        info!(target: "scheduler", kind = %self.kind, task_id = %task.id, owner_id = %task.owner_id, %reason, "disabling task");
        if let Err(err) = self.tasks.update_task(task.id, &TaskUpdate::disable()).await {
            error!(target: "scheduler", kind = %self.kind, task_id = %task.id, error = %format!("{err:#}"), "failed to disable task");
        }
        self.queue.forget(task.id);
    }

    fn on_failure(&self, id: TaskId, task: Option<&RecurringTask>, err: anyhow::Error) {
        let owner_id = task.map(|t| t.owner_id.to_string()).unwrap_or_default();
        error!(
            target: "scheduler",
            kind = %self.kind,
            task_id = %id,
            %owner_id,
            policy = ?self.settings.failure_policy,
            error = %format!("{err:#}"),
            "task execution failed"
        );

        match self.settings.failure_policy {
            FailurePolicy::DropOnFailure => self.queue.forget(id),
            FailurePolicy::RetryAndReschedule => {
                let retry_delay = chrono::Duration::from_std(self.settings.retry_delay)
                    .unwrap_or_else(|_| chrono::Duration::minutes(15));
                self.queue.reschedule(id, self.clock.now() + retry_delay);
            }
        }
    }
}
