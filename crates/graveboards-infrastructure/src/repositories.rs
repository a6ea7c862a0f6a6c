// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::Result;
use graveboards_domain::{
    Beatmap, BeatmapId, BeatmapSnapshot, Beatmapset, BeatmapsetId, BeatmapsetSnapshot, Mapper,
    Profile, RecurringTask, Request, Score, TaskId, TaskUpdate, UserId,
};

// ============================================================================
// Repository Traits
// ============================================================================

/// Storage for one recurring job family.
///
/// Tasks are never deleted. The scheduler flips `enabled` and stamps
/// `last_fetch` through [`TaskUpdate`]; nothing else mutates them.
#[async_trait::async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_task(&self, owner_id: UserId) -> Result<RecurringTask>;
    async fn get_task(&self, id: TaskId) -> Result<Option<RecurringTask>>;
    /// `None` lists every task regardless of state.
    async fn list_tasks(&self, enabled: Option<bool>) -> Result<Vec<RecurringTask>>;
    /// Returns the updated task, or `None` if it does not exist.
    async fn update_task(&self, id: TaskId, update: &TaskUpdate) -> Result<Option<RecurringTask>>;
}

#[async_trait::async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn get_profile(&self, user_id: UserId) -> Result<Option<Profile>>;
    async fn upsert_profile(&self, profile: &Profile) -> Result<()>;
}

#[async_trait::async_trait]
pub trait MapperRepository: Send + Sync {
    async fn get_mapper(&self, id: UserId) -> Result<Option<Mapper>>;
    async fn upsert_mapper(&self, mapper: &Mapper) -> Result<()>;
}

#[async_trait::async_trait]
pub trait ScoreRepository: Send + Sync {
    /// Returns false when the score was already stored.
    async fn add_score(&self, score: &Score) -> Result<bool>;
    async fn list_scores(&self, user_id: UserId) -> Result<Vec<Score>>;
}

#[async_trait::async_trait]
pub trait LeaderboardRepository: Send + Sync {
    async fn has_leaderboard(&self, beatmap_id: BeatmapId) -> Result<bool>;
    async fn add_leaderboard(&self, beatmap_id: BeatmapId) -> Result<()>;
}

/// Archived beatmapsets, their difficulties and checksum-addressed snapshots.
#[async_trait::async_trait]
pub trait BeatmapRepository: Send + Sync {
    async fn get_beatmapset(&self, id: BeatmapsetId) -> Result<Option<Beatmapset>>;
    async fn add_beatmapset(&self, beatmapset: &Beatmapset) -> Result<()>;
    async fn get_beatmap(&self, id: BeatmapId) -> Result<Option<Beatmap>>;
    async fn add_beatmap(&self, beatmap: &Beatmap) -> Result<()>;

    async fn get_beatmap_snapshot(
        &self,
        beatmap_id: BeatmapId,
        checksum: &str,
    ) -> Result<Option<BeatmapSnapshot>>;
    /// Stores a snapshot, assigning the next snapshot number for the beatmap.
    async fn add_beatmap_snapshot(&self, snapshot: &BeatmapSnapshot) -> Result<BeatmapSnapshot>;

    async fn get_beatmapset_snapshot(
        &self,
        beatmapset_id: BeatmapsetId,
        checksum: &str,
    ) -> Result<Option<BeatmapsetSnapshot>>;
    /// Stores a snapshot, assigning the next snapshot number for the set.
    async fn add_beatmapset_snapshot(
        &self,
        snapshot: &BeatmapsetSnapshot,
    ) -> Result<BeatmapsetSnapshot>;
}

#[async_trait::async_trait]
pub trait RequestRepository: Send + Sync {
    async fn add_request(&self, request: &Request) -> Result<()>;
    async fn list_requests(&self) -> Result<Vec<Request>>;
}
