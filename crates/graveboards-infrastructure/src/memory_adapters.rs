// SPDX-License-Identifier: GPL-3.0-or-later

//! Process-local repositories for tests and single-node runs without a
//! database file.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use graveboards_domain::{
    Beatmap, BeatmapId, BeatmapSnapshot, Beatmapset, BeatmapsetId, BeatmapsetSnapshot, Mapper,
    Profile, RecurringTask, Request, Score, ScoreId, TaskId, TaskUpdate, UserId,
};

use crate::repositories::{
    BeatmapRepository, LeaderboardRepository, MapperRepository, ProfileRepository,
    RequestRepository, ScoreRepository, TaskRepository,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct TaskTable {
    next_id: i64,
    rows: BTreeMap<TaskId, RecurringTask>,
}

#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    table: Mutex<TaskTable>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a task with a caller-chosen id.
    pub fn insert(&self, task: RecurringTask) {
        let mut table = lock(&self.table);
        table.next_id = table.next_id.max(task.id.get());
        table.rows.insert(task.id, task);
    }
}

#[async_trait::async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create_task(&self, owner_id: UserId) -> Result<RecurringTask> {
        let mut table = lock(&self.table);
        table.next_id += 1;
        let task = RecurringTask::new(TaskId(table.next_id), owner_id);
        table.rows.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<RecurringTask>> {
        Ok(lock(&self.table).rows.get(&id).cloned())
    }

    async fn list_tasks(&self, enabled: Option<bool>) -> Result<Vec<RecurringTask>> {
        Ok(lock(&self.table)
            .rows
            .values()
            .filter(|t| enabled.map_or(true, |e| t.enabled == e))
            .cloned()
            .collect())
    }

    async fn update_task(&self, id: TaskId, update: &TaskUpdate) -> Result<Option<RecurringTask>> {
        let mut table = lock(&self.table);
        Ok(table.rows.get_mut(&id).map(|task| {
            task.apply(update);
            task.clone()
        }))
    }
}

#[derive(Debug, Default)]
struct Tables {
    profiles: HashMap<UserId, Profile>,
    mappers: HashMap<UserId, Mapper>,
    scores: BTreeMap<ScoreId, Score>,
    leaderboards: HashSet<BeatmapId>,
    beatmapsets: HashMap<BeatmapsetId, Beatmapset>,
    beatmaps: HashMap<BeatmapId, Beatmap>,
    beatmap_snapshots: Vec<BeatmapSnapshot>,
    beatmapset_snapshots: Vec<BeatmapsetSnapshot>,
    requests: Vec<Request>,
}

/// Every non-task repository over one set of in-memory tables.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beatmap_snapshots(&self) -> Vec<BeatmapSnapshot> {
        lock(&self.tables).beatmap_snapshots.clone()
    }

    pub fn beatmapset_snapshots(&self) -> Vec<BeatmapsetSnapshot> {
        lock(&self.tables).beatmapset_snapshots.clone()
    }
}

#[async_trait::async_trait]
impl ProfileRepository for InMemoryStore {
    async fn get_profile(&self, user_id: UserId) -> Result<Option<Profile>> {
        Ok(lock(&self.tables).profiles.get(&user_id).cloned())
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        lock(&self.tables)
            .profiles
            .insert(profile.user_id, profile.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl MapperRepository for InMemoryStore {
    async fn get_mapper(&self, id: UserId) -> Result<Option<Mapper>> {
        Ok(lock(&self.tables).mappers.get(&id).cloned())
    }

    async fn upsert_mapper(&self, mapper: &Mapper) -> Result<()> {
        lock(&self.tables).mappers.insert(mapper.id, mapper.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl ScoreRepository for InMemoryStore {
    async fn add_score(&self, score: &Score) -> Result<bool> {
        let mut tables = lock(&self.tables);
        if tables.scores.contains_key(&score.id) {
            return Ok(false);
        }
        tables.scores.insert(score.id, score.clone());
        Ok(true)
    }

    async fn list_scores(&self, user_id: UserId) -> Result<Vec<Score>> {
        Ok(lock(&self.tables)
            .scores
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl LeaderboardRepository for InMemoryStore {
    async fn has_leaderboard(&self, beatmap_id: BeatmapId) -> Result<bool> {
        Ok(lock(&self.tables).leaderboards.contains(&beatmap_id))
    }

    async fn add_leaderboard(&self, beatmap_id: BeatmapId) -> Result<()> {
        lock(&self.tables).leaderboards.insert(beatmap_id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl BeatmapRepository for InMemoryStore {
    async fn get_beatmapset(&self, id: BeatmapsetId) -> Result<Option<Beatmapset>> {
        Ok(lock(&self.tables).beatmapsets.get(&id).cloned())
    }

    async fn add_beatmapset(&self, beatmapset: &Beatmapset) -> Result<()> {
        lock(&self.tables)
            .beatmapsets
            .entry(beatmapset.id)
            .or_insert_with(|| beatmapset.clone());
        Ok(())
    }

    async fn get_beatmap(&self, id: BeatmapId) -> Result<Option<Beatmap>> {
        Ok(lock(&self.tables).beatmaps.get(&id).cloned())
    }

    async fn add_beatmap(&self, beatmap: &Beatmap) -> Result<()> {
        lock(&self.tables)
            .beatmaps
            .entry(beatmap.id)
            .or_insert_with(|| beatmap.clone());
        Ok(())
    }

    async fn get_beatmap_snapshot(
        &self,
        beatmap_id: BeatmapId,
        checksum: &str,
    ) -> Result<Option<BeatmapSnapshot>> {
        Ok(lock(&self.tables)
            .beatmap_snapshots
            .iter()
            .find(|s| s.beatmap_id == beatmap_id && s.checksum == checksum)
            .cloned())
    }

    async fn add_beatmap_snapshot(&self, snapshot: &BeatmapSnapshot) -> Result<BeatmapSnapshot> {
        let mut tables = lock(&self.tables);
        let number = tables
            .beatmap_snapshots
            .iter()
            .filter(|s| s.beatmap_id == snapshot.beatmap_id)
            .map(|s| s.snapshot_number)
            .max()
            .unwrap_or(0)
            + 1;
        let stored = BeatmapSnapshot {
            snapshot_number: number,
            ..snapshot.clone()
        };
        tables.beatmap_snapshots.push(stored.clone());
        Ok(stored)
    }

    async fn get_beatmapset_snapshot(
        &self,
        beatmapset_id: BeatmapsetId,
        checksum: &str,
    ) -> Result<Option<BeatmapsetSnapshot>> {
        Ok(lock(&self.tables)
            .beatmapset_snapshots
            .iter()
            .find(|s| s.beatmapset_id == beatmapset_id && s.checksum == checksum)
            .cloned())
    }

    async fn add_beatmapset_snapshot(
        &self,
        snapshot: &BeatmapsetSnapshot,
    ) -> Result<BeatmapsetSnapshot> {
        let mut tables = lock(&self.tables);
        let number = tables
            .beatmapset_snapshots
            .iter()
            .filter(|s| s.beatmapset_id == snapshot.beatmapset_id)
            .map(|s| s.snapshot_number)
            .max()
            .unwrap_or(0)
            + 1;
        let stored = BeatmapsetSnapshot {
            snapshot_number: number,
            ..snapshot.clone()
        };
        tables.beatmapset_snapshots.push(stored.clone());
        Ok(stored)
    }
}

#[async_trait::async_trait]
impl RequestRepository for InMemoryStore {
    async fn add_request(&self, request: &Request) -> Result<()> {
        lock(&self.tables).requests.push(request.clone());
        Ok(())
    }

    async fn list_requests(&self) -> Result<Vec<Request>> {
        Ok(lock(&self.tables).requests.clone())
    }
}
