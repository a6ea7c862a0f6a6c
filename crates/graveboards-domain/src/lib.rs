// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Value Objects & IDs
// ============================================================================

macro_rules! int_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<i64>().map(Self).map_err(|e| ValidationError {
                    field: stringify!($name),
                    message: format!("invalid id {:?}: {}", s, e),
                })
            }
        }
    };
}

int_id!(
    /// Row id of a recurring fetcher task.
    TaskId
);
int_id!(
    /// osu! user id; mappers share the same id space.
    UserId
);
int_id!(BeatmapId);
int_id!(BeatmapsetId);
int_id!(QueueId);
int_id!(ScoreId);

// ============================================================================
// Recurring tasks
// ============================================================================

/// The recurring job families the daemon runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ProfileFetcher,
    ScoreFetcher,
    MapperInfoFetcher,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [
        TaskKind::ProfileFetcher,
        TaskKind::ScoreFetcher,
        TaskKind::MapperInfoFetcher,
    ];

    /// Bus channel on which new or changed task ids are announced.
    pub fn channel(self) -> &'static str {
        match self {
            Self::ProfileFetcher => "profile_fetcher_tasks",
            Self::ScoreFetcher => "score_fetcher_tasks",
            Self::MapperInfoFetcher => "mapper_info_fetcher_tasks",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::ProfileFetcher => "profile_fetcher_tasks",
            Self::ScoreFetcher => "score_fetcher_tasks",
            Self::MapperInfoFetcher => "mapper_info_fetcher_tasks",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProfileFetcher => write!(f, "profile_fetcher"),
            Self::ScoreFetcher => write!(f, "score_fetcher"),
            Self::MapperInfoFetcher => write!(f, "mapper_info_fetcher"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringTask {
    pub id: TaskId,
    /// The user (or mapper) whose data this task refreshes.
    pub owner_id: UserId,
    pub enabled: bool,
    pub last_fetch: Option<DateTime<Utc>>,
}

impl RecurringTask {
    pub fn new(id: TaskId, owner_id: UserId) -> Self {
        Self {
            id,
            owner_id,
            enabled: true,
            last_fetch: None,
        }
    }

    /// When the task is next due: one interval after the last fetch, or
    /// immediately if it has never run.
    pub fn next_execution(&self, interval: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_fetch {
            Some(last) => last + interval,
            None => now,
        }
    }

    pub fn apply(&mut self, update: &TaskUpdate) {
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(last_fetch) = update.last_fetch {
            self.last_fetch = Some(last_fetch);
        }
    }
}

/// Partial update of a [`RecurringTask`]; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub enabled: Option<bool>,
    pub last_fetch: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn fetched_at(at: DateTime<Utc>) -> Self {
        Self {
            enabled: None,
            last_fetch: Some(at),
        }
    }

    pub fn disable() -> Self {
        Self {
            enabled: Some(false),
            last_fetch: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_none() && self.last_fetch.is_none()
    }
}

// ============================================================================
// Work items
// ============================================================================

/// Identity of a queue request: one beatmapset per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupeKey {
    pub queue_id: QueueId,
    pub beatmapset_id: BeatmapsetId,
}

impl DedupeKey {
    pub fn new(queue_id: QueueId, beatmapset_id: BeatmapsetId) -> Self {
        Self {
            queue_id,
            beatmapset_id,
        }
    }
}

impl std::fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.queue_id, self.beatmapset_id)
    }
}

impl FromStr for DedupeKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (queue, beatmapset) = s.split_once(':').ok_or_else(|| ValidationError {
            field: "dedupe_key",
            message: format!("expected <queue_id>:<beatmapset_id>, got {:?}", s),
        })?;
        Ok(Self {
            queue_id: queue.parse()?,
            beatmapset_id: beatmapset.parse()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A one-shot request to archive a beatmapset into a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub requester_id: UserId,
    pub beatmapset_id: BeatmapsetId,
    pub queue_id: QueueId,
    pub comment: String,
    pub mv_checked: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn new(
        requester_id: UserId,
        beatmapset_id: BeatmapsetId,
        queue_id: QueueId,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            requester_id,
            beatmapset_id,
            queue_id,
            comment: comment.into(),
            mv_checked: false,
            completed_at: None,
            failed_at: None,
        }
    }

    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey::new(self.queue_id, self.beatmapset_id)
    }

    pub fn status(&self) -> WorkStatus {
        if self.failed_at.is_some() {
            WorkStatus::Failed
        } else if self.completed_at.is_some() {
            WorkStatus::Completed
        } else {
            WorkStatus::Pending
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.status() == WorkStatus::Pending
    }

    /// Flat string fields as stored in a cache hash.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let stamp = |t: &Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_default();
        vec![
            ("user_id".into(), self.requester_id.to_string()),
            ("beatmapset_id".into(), self.beatmapset_id.to_string()),
            ("queue_id".into(), self.queue_id.to_string()),
            ("comment".into(), self.comment.clone()),
            ("mv_checked".into(), self.mv_checked.to_string()),
            ("completed_at".into(), stamp(&self.completed_at)),
            ("failed_at".into(), stamp(&self.failed_at)),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, ValidationError> {
        fn required<'a>(
            fields: &'a HashMap<String, String>,
            field: &'static str,
        ) -> Result<&'a str, ValidationError> {
            fields.get(field).map(String::as_str).ok_or(ValidationError {
                field,
                message: "missing field".into(),
            })
        }

        fn timestamp(
            fields: &HashMap<String, String>,
            field: &'static str,
        ) -> Result<Option<DateTime<Utc>>, ValidationError> {
            match fields.get(field).map(String::as_str) {
                None | Some("") => Ok(None),
                Some(raw) => DateTime::parse_from_rfc3339(raw)
                    .map(|t| Some(t.with_timezone(&Utc)))
                    .map_err(|e| ValidationError {
                        field,
                        message: e.to_string(),
                    }),
            }
        }

        let mv_checked = match fields.get("mv_checked").map(String::as_str) {
            None | Some("") => false,
            Some(raw) => raw.eq_ignore_ascii_case("true"),
        };

        Ok(Self {
            requester_id: required(fields, "user_id")?.parse()?,
            beatmapset_id: required(fields, "beatmapset_id")?.parse()?,
            queue_id: required(fields, "queue_id")?.parse()?,
            comment: fields.get("comment").cloned().unwrap_or_default(),
            mv_checked,
            completed_at: timestamp(fields, "completed_at")?,
            failed_at: timestamp(fields, "failed_at")?,
        })
    }
}

// ============================================================================
// Entities written by the background handlers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub country_code: Option<String>,
    pub is_restricted: bool,
    pub updated_at: DateTime<Utc>,
}

/// Partial update of a [`Profile`] built from an upstream user record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub country_code: Option<String>,
    pub is_restricted: Option<bool>,
}

impl Profile {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            username: None,
            avatar_url: None,
            country_code: None,
            is_restricted: false,
            updated_at: Utc::now(),
        }
    }

    pub fn apply(&mut self, update: ProfileUpdate, at: DateTime<Utc>) {
        if let Some(username) = update.username {
            self.username = Some(username);
        }
        if let Some(avatar_url) = update.avatar_url {
            self.avatar_url = Some(avatar_url);
        }
        if let Some(country_code) = update.country_code {
            self.country_code = Some(country_code);
        }
        if let Some(is_restricted) = update.is_restricted {
            self.is_restricted = is_restricted;
        }
        self.updated_at = at;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapper {
    pub id: UserId,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub country_code: Option<String>,
    pub ranked_beatmapset_count: Option<i64>,
    pub graveyard_beatmapset_count: Option<i64>,
    pub is_restricted: bool,
    pub updated_at: DateTime<Utc>,
}

impl Mapper {
    /// Placeholder for a mapper the upstream API no longer serves.
    pub fn restricted(id: UserId, username: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            id,
            username,
            avatar_url: None,
            country_code: None,
            ranked_beatmapset_count: None,
            graveyard_beatmapset_count: None,
            is_restricted: true,
            updated_at: at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub id: ScoreId,
    pub user_id: UserId,
    pub beatmap_id: BeatmapId,
    pub beatmapset_id: BeatmapsetId,
    pub accuracy: f64,
    pub max_combo: i64,
    pub total_score: i64,
    pub pp: Option<f64>,
    pub rank: String,
    pub mods: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beatmapset {
    pub id: BeatmapsetId,
    pub mapper_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beatmap {
    pub id: BeatmapId,
    pub beatmapset_id: BeatmapsetId,
    pub mapper_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatmapSnapshot {
    pub beatmap_id: BeatmapId,
    pub snapshot_number: i64,
    pub checksum: String,
    pub version: String,
    pub difficulty_rating: f64,
    pub snapshot_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatmapsetSnapshot {
    pub beatmapset_id: BeatmapsetId,
    pub snapshot_number: i64,
    pub checksum: String,
    pub artist: String,
    pub title: String,
    pub beatmap_checksums: Vec<String>,
    pub snapshot_date: DateTime<Utc>,
}

/// A queue request persisted once its beatmapset has been archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub user_id: UserId,
    pub beatmapset_id: BeatmapsetId,
    pub queue_id: QueueId,
    pub comment: String,
    pub mv_checked: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&WorkItem> for Request {
    fn from(item: &WorkItem) -> Self {
        Self {
            user_id: item.requester_id,
            beatmapset_id: item.beatmapset_id,
            queue_id: item.queue_id,
            comment: item.comment.clone(),
            mv_checked: item.mv_checked,
            created_at: Utc::now(),
        }
    }
}

/// Combine per-difficulty checksums into an order-independent set checksum.
pub fn combine_checksums<S: AsRef<str>>(checksums: &[S]) -> String {
    let mut parts: Vec<&str> = checksums.iter().map(AsRef::as_ref).collect();
    parts.sort_unstable();
    parts.dedup();
    parts.join("-")
}

// ============================================================================
// Domain Validation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}
