// SPDX-License-Identifier: GPL-3.0-or-later
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use graveboards_domain::{RecurringTask, TaskId, TaskKind};
use graveboards_infrastructure::repositories::TaskRepository;
use graveboards_realtime::{MessageStream, PubSub};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::queue::TaskQueue;

/// Feeds task ids announced on the family's bus channel into its queue.
///
/// Announcements can race the transaction that created the task, so a
/// missing task is polled for a bounded number of times before giving up.
pub struct TaskSubscriber {
    kind: TaskKind,
    bus: Arc<dyn PubSub>,
    tasks: Arc<dyn TaskRepository>,
    queue: Arc<TaskQueue>,
    interval: chrono::Duration,
    visibility_attempts: u32,
    visibility_delay: Duration,
}

impl TaskSubscriber {
    pub fn new(
        kind: TaskKind,
        bus: Arc<dyn PubSub>,
        tasks: Arc<dyn TaskRepository>,
        queue: Arc<TaskQueue>,
        interval: chrono::Duration,
    ) -> Self {
        Self {
            kind,
            bus,
            tasks,
            queue,
            interval,
            visibility_attempts: 5,
            visibility_delay: Duration::from_secs(1),
        }
    }

    pub fn visibility(mut self, attempts: u32, delay: Duration) -> Self {
        self.visibility_attempts = attempts.max(1);
        self.visibility_delay = delay;
        self
    }

    /// Open the family channel. Failing here is a startup failure.
    pub async fn subscribe(&self) -> Result<MessageStream> {
        let channel = self.kind.channel();
        let messages = self.bus.subscribe(channel).await?;
        info!(target: "subscriber", %channel, "listening for task announcements");
        Ok(messages)
    }

    pub async fn listen(&self, mut messages: MessageStream, mut shutdown: watch::Receiver<bool>) {
        let channel = self.kind.channel();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                message = messages.next() => match message {
                    Some(message) => self.handle(&message).await,
                    None => {
                        warn!(target: "subscriber", %channel, "bus subscription closed");
                        break;
                    }
                },
            }
        }

        debug!(target: "subscriber", %channel, "subscriber stopped");
    }

    async fn handle(&self, message: &str) {
        let id: TaskId = match message.trim().parse() {
            Ok(id) => id,
            Err(err) => {
                warn!(target: "subscriber", kind = %self.kind, %message, error = %err, "ignoring malformed task id");
                return;
            }
        };

        match self.wait_for_task(id).await {
            Some(task) => {
                if self.queue.load(&task, self.interval) {
                    debug!(target: "subscriber", kind = %self.kind, task_id = %id, "task queued");
                }
            }
            None => warn!(
                target: "subscriber",
                kind = %self.kind,
                task_id = %id,
                attempts = self.visibility_attempts,
                "announced task never became visible, dropping"
            ),
        }
    }

    async fn wait_for_task(&self, id: TaskId) -> Option<RecurringTask> {
        for attempt in 1..=self.visibility_attempts {
            match self.tasks.get_task(id).await {
                Ok(Some(task)) => return Some(task),
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "subscriber", kind = %self.kind, task_id = %id, attempt, error = %err, "task lookup failed");
                }
            }
            if attempt < self.visibility_attempts {
                tokio::time::sleep(self.visibility_delay).await;
            }
        }
        None
    }
}
