// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::Result;
use chrono::{DateTime, Utc};
use graveboards_domain::{TaskId, TaskKind, UserId};
use std::fmt;

/// Represents the execution context for one run of a recurring task
#[derive(Debug, Clone)]
pub struct JobContext {
    pub task_id: TaskId,
    /// The user or mapper the task refreshes
    pub owner_id: UserId,
    pub execution_time: DateTime<Utc>,
}

/// What the scheduler should do with the task after a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Stamp `last_fetch` and run again one interval later
    Success,
    /// Stop scheduling the task for good
    Disable { reason: String },
}

/// The routine a recurring service runs for each due task
#[async_trait::async_trait]
pub trait RecurringJob: Send + Sync {
    /// Family this job belongs to
    fn kind(&self) -> TaskKind;

    /// Execute the job with given context
    async fn execute(&self, ctx: JobContext) -> Result<JobResult>;
}

impl fmt::Debug for dyn RecurringJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurringJob")
            .field("kind", &self.kind())
            .finish()
    }
}
