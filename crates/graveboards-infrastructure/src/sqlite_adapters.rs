// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use graveboards_domain::{
    Beatmap, BeatmapId, BeatmapSnapshot, Beatmapset, BeatmapsetId, BeatmapsetSnapshot, Mapper,
    Profile, RecurringTask, Request, Score, TaskId, TaskKind, TaskUpdate, UserId,
};
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::debug;

use crate::repositories::{
    BeatmapRepository, LeaderboardRepository, MapperRepository, ProfileRepository,
    RequestRepository, ScoreRepository, TaskRepository,
};

/// SQLx-backed task table for one job family.
pub struct SqliteTaskRepository {
    pool: SqlitePool,
    kind: TaskKind,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool, kind: TaskKind) -> Self {
        Self { pool, kind }
    }
}

#[async_trait::async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create_task(&self, owner_id: UserId) -> Result<RecurringTask> {
        debug!(target: "repository", kind = %self.kind, %owner_id, "creating task");
        let q = format!(
            "INSERT INTO {} (owner_id, enabled, last_fetch) VALUES (?, 1, NULL) RETURNING id",
            self.kind.table()
        );
        let row = sqlx::query(&q)
            .bind(owner_id.get())
            .fetch_one(&self.pool)
            .await?;
        let id: i64 = row.try_get("id")?;
        Ok(RecurringTask::new(TaskId(id), owner_id))
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<RecurringTask>> {
        debug!(target: "repository", kind = %self.kind, %id, "fetching task");
        let q = format!("SELECT * FROM {} WHERE id = ? LIMIT 1", self.kind.table());
        let row = sqlx::query(&q)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn list_tasks(&self, enabled: Option<bool>) -> Result<Vec<RecurringTask>> {
        debug!(target: "repository", kind = %self.kind, ?enabled, "listing tasks");
        let rows = match enabled {
            Some(enabled) => {
                let q = format!("SELECT * FROM {} WHERE enabled = ? ORDER BY id", self.kind.table());
                sqlx::query(&q).bind(enabled).fetch_all(&self.pool).await?
            }
            None => {
                let q = format!("SELECT * FROM {} ORDER BY id", self.kind.table());
                sqlx::query(&q).fetch_all(&self.pool).await?
            }
        };
        rows.iter().map(row_to_task).collect()
    }

    async fn update_task(&self, id: TaskId, update: &TaskUpdate) -> Result<Option<RecurringTask>> {
        debug!(target: "repository", kind = %self.kind, %id, ?update, "updating task");
        let q = format!(
            r#"
            UPDATE {} SET
                enabled = COALESCE(?, enabled),
                last_fetch = COALESCE(?, last_fetch)
            WHERE id = ?
            "#,
            self.kind.table()
        );
        let result = sqlx::query(&q)
            .bind(update.enabled)
            .bind(update.last_fetch.map(|at| at.to_rfc3339()))
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_task(id).await
    }
}

/// SQLx-backed store for everything the handlers write.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ProfileRepository for SqliteStore {
    async fn get_profile(&self, user_id: UserId) -> Result<Option<Profile>> {
        debug!(target: "repository", %user_id, "fetching profile");
        let row = sqlx::query("SELECT * FROM profiles WHERE user_id = ? LIMIT 1")
            .bind(user_id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_profile).transpose()
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        debug!(target: "repository", user_id = %profile.user_id, "upserting profile");
        let q = r#"
            INSERT INTO profiles (
                user_id, username, avatar_url, country_code, is_restricted, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                avatar_url = excluded.avatar_url,
                country_code = excluded.country_code,
                is_restricted = excluded.is_restricted,
                updated_at = excluded.updated_at
        "#;
        sqlx::query(q)
            .bind(profile.user_id.get())
            .bind(profile.username.clone())
            .bind(profile.avatar_url.clone())
            .bind(profile.country_code.clone())
            .bind(profile.is_restricted)
            .bind(profile.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MapperRepository for SqliteStore {
    async fn get_mapper(&self, id: UserId) -> Result<Option<Mapper>> {
        debug!(target: "repository", %id, "fetching mapper");
        let row = sqlx::query("SELECT * FROM mappers WHERE id = ? LIMIT 1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_mapper).transpose()
    }

    async fn upsert_mapper(&self, mapper: &Mapper) -> Result<()> {
        debug!(target: "repository", id = %mapper.id, restricted = mapper.is_restricted, "upserting mapper");
        let q = r#"
            INSERT INTO mappers (
                id, username, avatar_url, country_code, ranked_beatmapset_count,
                graveyard_beatmapset_count, is_restricted, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                avatar_url = excluded.avatar_url,
                country_code = excluded.country_code,
                ranked_beatmapset_count = excluded.ranked_beatmapset_count,
                graveyard_beatmapset_count = excluded.graveyard_beatmapset_count,
                is_restricted = excluded.is_restricted,
                updated_at = excluded.updated_at
        "#;
        sqlx::query(q)
            .bind(mapper.id.get())
            .bind(mapper.username.clone())
            .bind(mapper.avatar_url.clone())
            .bind(mapper.country_code.clone())
            .bind(mapper.ranked_beatmapset_count)
            .bind(mapper.graveyard_beatmapset_count)
            .bind(mapper.is_restricted)
            .bind(mapper.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ScoreRepository for SqliteStore {
    async fn add_score(&self, score: &Score) -> Result<bool> {
        debug!(target: "repository", score_id = %score.id, user_id = %score.user_id, "adding score");
        let q = r#"
            INSERT OR IGNORE INTO scores (
                id, user_id, beatmap_id, beatmapset_id, accuracy, max_combo,
                total_score, pp, rank, mods, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#;
        let result = sqlx::query(q)
            .bind(score.id.get())
            .bind(score.user_id.get())
            .bind(score.beatmap_id.get())
            .bind(score.beatmapset_id.get())
            .bind(score.accuracy)
            .bind(score.max_combo)
            .bind(score.total_score)
            .bind(score.pp)
            .bind(score.rank.clone())
            .bind(serde_json::to_string(&score.mods)?)
            .bind(score.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_scores(&self, user_id: UserId) -> Result<Vec<Score>> {
        debug!(target: "repository", %user_id, "listing scores");
        let rows = sqlx::query("SELECT * FROM scores WHERE user_id = ? ORDER BY id")
            .bind(user_id.get())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_score).collect()
    }
}

#[async_trait::async_trait]
impl LeaderboardRepository for SqliteStore {
    async fn has_leaderboard(&self, beatmap_id: BeatmapId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM leaderboards WHERE beatmap_id = ? LIMIT 1")
            .bind(beatmap_id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn add_leaderboard(&self, beatmap_id: BeatmapId) -> Result<()> {
        debug!(target: "repository", %beatmap_id, "adding leaderboard");
        sqlx::query("INSERT OR IGNORE INTO leaderboards (beatmap_id, created_at) VALUES (?, ?)")
            .bind(beatmap_id.get())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BeatmapRepository for SqliteStore {
    async fn get_beatmapset(&self, id: BeatmapsetId) -> Result<Option<Beatmapset>> {
        let row = sqlx::query("SELECT * FROM beatmapsets WHERE id = ? LIMIT 1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<Beatmapset> {
            Ok(Beatmapset {
                id: BeatmapsetId(r.try_get("id")?),
                mapper_id: UserId(r.try_get("mapper_id")?),
            })
        })
        .transpose()
    }

    async fn add_beatmapset(&self, beatmapset: &Beatmapset) -> Result<()> {
        debug!(target: "repository", id = %beatmapset.id, "adding beatmapset");
        sqlx::query("INSERT OR IGNORE INTO beatmapsets (id, mapper_id) VALUES (?, ?)")
            .bind(beatmapset.id.get())
            .bind(beatmapset.mapper_id.get())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_beatmap(&self, id: BeatmapId) -> Result<Option<Beatmap>> {
        let row = sqlx::query("SELECT * FROM beatmaps WHERE id = ? LIMIT 1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<Beatmap> {
            Ok(Beatmap {
                id: BeatmapId(r.try_get("id")?),
                beatmapset_id: BeatmapsetId(r.try_get("beatmapset_id")?),
                mapper_id: UserId(r.try_get("mapper_id")?),
            })
        })
        .transpose()
    }

    async fn add_beatmap(&self, beatmap: &Beatmap) -> Result<()> {
        debug!(target: "repository", id = %beatmap.id, "adding beatmap");
        sqlx::query("INSERT OR IGNORE INTO beatmaps (id, beatmapset_id, mapper_id) VALUES (?, ?, ?)")
            .bind(beatmap.id.get())
            .bind(beatmap.beatmapset_id.get())
            .bind(beatmap.mapper_id.get())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_beatmap_snapshot(
        &self,
        beatmap_id: BeatmapId,
        checksum: &str,
    ) -> Result<Option<BeatmapSnapshot>> {
        let row = sqlx::query(
            "SELECT * FROM beatmap_snapshots WHERE beatmap_id = ? AND checksum = ? LIMIT 1",
        )
        .bind(beatmap_id.get())
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_beatmap_snapshot).transpose()
    }

    async fn add_beatmap_snapshot(&self, snapshot: &BeatmapSnapshot) -> Result<BeatmapSnapshot> {
        // Numbering and insert happen in one statement so concurrent writers
        // collide on the unique constraint instead of sharing a number.
        let q = r#"
            INSERT INTO beatmap_snapshots (
                beatmap_id, snapshot_number, checksum, version, difficulty_rating, snapshot_date
            )
            SELECT ?, COALESCE(MAX(snapshot_number), 0) + 1, ?, ?, ?, ?
            FROM beatmap_snapshots WHERE beatmap_id = ?
            RETURNING snapshot_number
        "#;
        let row = sqlx::query(q)
            .bind(snapshot.beatmap_id.get())
            .bind(snapshot.checksum.clone())
            .bind(snapshot.version.clone())
            .bind(snapshot.difficulty_rating)
            .bind(snapshot.snapshot_date.to_rfc3339())
            .bind(snapshot.beatmap_id.get())
            .fetch_one(&self.pool)
            .await?;
        let snapshot_number: i64 = row.try_get("snapshot_number")?;
        debug!(target: "repository", beatmap_id = %snapshot.beatmap_id, snapshot_number, "added beatmap snapshot");
        Ok(BeatmapSnapshot {
            snapshot_number,
            ..snapshot.clone()
        })
    }

    async fn get_beatmapset_snapshot(
        &self,
        beatmapset_id: BeatmapsetId,
        checksum: &str,
    ) -> Result<Option<BeatmapsetSnapshot>> {
        let row = sqlx::query(
            "SELECT * FROM beatmapset_snapshots WHERE beatmapset_id = ? AND checksum = ? LIMIT 1",
        )
        .bind(beatmapset_id.get())
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_beatmapset_snapshot).transpose()
    }

    async fn add_beatmapset_snapshot(
        &self,
        snapshot: &BeatmapsetSnapshot,
    ) -> Result<BeatmapsetSnapshot> {
        let q = r#"
            INSERT INTO beatmapset_snapshots (
                beatmapset_id, snapshot_number, checksum, artist, title,
                beatmap_checksums, snapshot_date
            )
            SELECT ?, COALESCE(MAX(snapshot_number), 0) + 1, ?, ?, ?, ?, ?
            FROM beatmapset_snapshots WHERE beatmapset_id = ?
            RETURNING snapshot_number
        "#;
        let row = sqlx::query(q)
            .bind(snapshot.beatmapset_id.get())
            .bind(snapshot.checksum.clone())
            .bind(snapshot.artist.clone())
            .bind(snapshot.title.clone())
            .bind(serde_json::to_string(&snapshot.beatmap_checksums)?)
            .bind(snapshot.snapshot_date.to_rfc3339())
            .bind(snapshot.beatmapset_id.get())
            .fetch_one(&self.pool)
            .await?;
        let snapshot_number: i64 = row.try_get("snapshot_number")?;
        debug!(target: "repository", beatmapset_id = %snapshot.beatmapset_id, snapshot_number, "added beatmapset snapshot");
        Ok(BeatmapsetSnapshot {
            snapshot_number,
            ..snapshot.clone()
        })
    }
}

#[async_trait::async_trait]
impl RequestRepository for SqliteStore {
    async fn add_request(&self, request: &Request) -> Result<()> {
        debug!(
            target: "repository",
            user_id = %request.user_id,
            beatmapset_id = %request.beatmapset_id,
            queue_id = %request.queue_id,
            "adding request"
        );
        let q = r#"
            INSERT INTO requests (
                user_id, beatmapset_id, queue_id, comment, mv_checked, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
        "#;
        sqlx::query(q)
            .bind(request.user_id.get())
            .bind(request.beatmapset_id.get())
            .bind(request.queue_id.get())
            .bind(request.comment.clone())
            .bind(request.mv_checked)
            .bind(request.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_requests(&self) -> Result<Vec<Request>> {
        let rows = sqlx::query("SELECT * FROM requests ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| -> Result<Request> {
                Ok(Request {
                    user_id: UserId(r.try_get("user_id")?),
                    beatmapset_id: BeatmapsetId(r.try_get("beatmapset_id")?),
                    queue_id: graveboards_domain::QueueId(r.try_get("queue_id")?),
                    comment: r.try_get("comment")?,
                    mv_checked: r.try_get("mv_checked")?,
                    created_at: parse_dt(r.try_get("created_at")?)?,
                })
            })
            .collect()
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_dt(s: String) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // SQLite CURRENT_TIMESTAMP format
    let ndt = NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
}

fn parse_dt_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(parse_dt).transpose()
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<RecurringTask> {
    Ok(RecurringTask {
        id: TaskId(row.try_get("id")?),
        owner_id: UserId(row.try_get("owner_id")?),
        enabled: row.try_get("enabled")?,
        last_fetch: parse_dt_opt(row.try_get("last_fetch")?)?,
    })
}

fn row_to_profile(row: &sqlx::sqlite::SqliteRow) -> Result<Profile> {
    Ok(Profile {
        user_id: UserId(row.try_get("user_id")?),
        username: row.try_get("username")?,
        avatar_url: row.try_get("avatar_url")?,
        country_code: row.try_get("country_code")?,
        is_restricted: row.try_get("is_restricted")?,
        updated_at: parse_dt(row.try_get("updated_at")?)?,
    })
}

fn row_to_mapper(row: &sqlx::sqlite::SqliteRow) -> Result<Mapper> {
    Ok(Mapper {
        id: UserId(row.try_get("id")?),
        username: row.try_get("username")?,
        avatar_url: row.try_get("avatar_url")?,
        country_code: row.try_get("country_code")?,
        ranked_beatmapset_count: row.try_get("ranked_beatmapset_count")?,
        graveyard_beatmapset_count: row.try_get("graveyard_beatmapset_count")?,
        is_restricted: row.try_get("is_restricted")?,
        updated_at: parse_dt(row.try_get("updated_at")?)?,
    })
}

fn row_to_score(row: &sqlx::sqlite::SqliteRow) -> Result<Score> {
    let mods: String = row.try_get("mods")?;
    Ok(Score {
        id: graveboards_domain::ScoreId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        beatmap_id: BeatmapId(row.try_get("beatmap_id")?),
        beatmapset_id: BeatmapsetId(row.try_get("beatmapset_id")?),
        accuracy: row.try_get("accuracy")?,
        max_combo: row.try_get("max_combo")?,
        total_score: row.try_get("total_score")?,
        pp: row.try_get("pp")?,
        rank: row.try_get("rank")?,
        mods: serde_json::from_str(&mods)?,
        created_at: parse_dt(row.try_get("created_at")?)?,
    })
}

fn row_to_beatmap_snapshot(row: &sqlx::sqlite::SqliteRow) -> Result<BeatmapSnapshot> {
    Ok(BeatmapSnapshot {
        beatmap_id: BeatmapId(row.try_get("beatmap_id")?),
        snapshot_number: row.try_get("snapshot_number")?,
        checksum: row.try_get("checksum")?,
        version: row.try_get("version")?,
        difficulty_rating: row.try_get("difficulty_rating")?,
        snapshot_date: parse_dt(row.try_get("snapshot_date")?)?,
    })
}

fn row_to_beatmapset_snapshot(row: &sqlx::sqlite::SqliteRow) -> Result<BeatmapsetSnapshot> {
    let checksums: String = row.try_get("beatmap_checksums")?;
    Ok(BeatmapsetSnapshot {
        beatmapset_id: BeatmapsetId(row.try_get("beatmapset_id")?),
        snapshot_number: row.try_get("snapshot_number")?,
        checksum: row.try_get("checksum")?,
        artist: row.try_get("artist")?,
        title: row.try_get("title")?,
        beatmap_checksums: serde_json::from_str(&checksums)?,
        snapshot_date: parse_dt(row.try_get("snapshot_date")?)?,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect in-memory sqlite");

        sqlx::migrate!("../../migrations").run(&pool).await.expect("migrate");
        pool
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn task_create_update_and_list() {
        let pool = setup_pool().await;
        let repo = SqliteTaskRepository::new(pool.clone(), TaskKind::ScoreFetcher);

        let task = repo.create_task(UserId(42)).await.expect("create task");
        assert!(task.enabled);
        assert_eq!(task.last_fetch, None);

        let fetched = repo.get_task(task.id).await.expect("get").expect("exists");
        assert_eq!(fetched, task);

        let updated = repo
            .update_task(task.id, &TaskUpdate::fetched_at(at(12)))
            .await
            .expect("update")
            .expect("exists");
        assert_eq!(updated.last_fetch, Some(at(12)));
        assert!(updated.enabled);

        repo.update_task(task.id, &TaskUpdate::disable()).await.expect("disable");
        let disabled = repo.get_task(task.id).await.unwrap().unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.last_fetch, Some(at(12)));

        assert!(repo.list_tasks(Some(true)).await.unwrap().is_empty());
        assert_eq!(repo.list_tasks(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn task_tables_are_separate_per_family() {
        let pool = setup_pool().await;
        let profiles = SqliteTaskRepository::new(pool.clone(), TaskKind::ProfileFetcher);
        let mappers = SqliteTaskRepository::new(pool.clone(), TaskKind::MapperInfoFetcher);

        let task = profiles.create_task(UserId(1)).await.unwrap();
        assert!(mappers.get_task(task.id).await.unwrap().is_none());
        assert!(mappers
            .update_task(task.id, &TaskUpdate::disable())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_scores_are_ignored() {
        let pool = setup_pool().await;
        let store = SqliteStore::new(pool);

        let score = Score {
            id: graveboards_domain::ScoreId(900),
            user_id: UserId(7),
            beatmap_id: BeatmapId(11),
            beatmapset_id: BeatmapsetId(10),
            accuracy: 0.98,
            max_combo: 512,
            total_score: 1_000_000,
            pp: Some(250.5),
            rank: "S".to_string(),
            mods: vec!["HD".to_string(), "DT".to_string()],
            created_at: at(9),
        };

        assert!(store.add_score(&score).await.unwrap());
        assert!(!store.add_score(&score).await.unwrap());

        let stored = store.list_scores(UserId(7)).await.unwrap();
        assert_eq!(stored, vec![score]);
    }

    #[tokio::test]
    async fn snapshots_are_numbered_per_beatmap() {
        let pool = setup_pool().await;
        let store = SqliteStore::new(pool);

        store
            .add_beatmapset(&Beatmapset { id: BeatmapsetId(10), mapper_id: UserId(3) })
            .await
            .unwrap();
        store
            .add_beatmap(&Beatmap {
                id: BeatmapId(11),
                beatmapset_id: BeatmapsetId(10),
                mapper_id: UserId(3),
            })
            .await
            .unwrap();

        let first = BeatmapSnapshot {
            beatmap_id: BeatmapId(11),
            snapshot_number: 0,
            checksum: "aaa".to_string(),
            version: "Insane".to_string(),
            difficulty_rating: 5.2,
            snapshot_date: at(1),
        };
        let second = BeatmapSnapshot {
            checksum: "bbb".to_string(),
            snapshot_date: at(2),
            ..first.clone()
        };

        assert_eq!(store.add_beatmap_snapshot(&first).await.unwrap().snapshot_number, 1);
        assert_eq!(store.add_beatmap_snapshot(&second).await.unwrap().snapshot_number, 2);

        let found = store
            .get_beatmap_snapshot(BeatmapId(11), "bbb")
            .await
            .unwrap()
            .expect("snapshot exists");
        assert_eq!(found.snapshot_number, 2);
        assert!(store.get_beatmap_snapshot(BeatmapId(11), "ccc").await.unwrap().is_none());

        let set_snapshot = store
            .add_beatmapset_snapshot(&BeatmapsetSnapshot {
                beatmapset_id: BeatmapsetId(10),
                snapshot_number: 0,
                checksum: "aaa-bbb".to_string(),
                artist: "Artist".to_string(),
                title: "Title".to_string(),
                beatmap_checksums: vec!["aaa".to_string(), "bbb".to_string()],
                snapshot_date: at(3),
            })
            .await
            .unwrap();
        assert_eq!(set_snapshot.snapshot_number, 1);
        let found = store
            .get_beatmapset_snapshot(BeatmapsetId(10), "aaa-bbb")
            .await
            .unwrap()
            .expect("set snapshot exists");
        assert_eq!(found.beatmap_checksums, vec!["aaa", "bbb"]);
    }

    #[tokio::test]
    async fn profile_and_mapper_upserts_overwrite() {
        let pool = setup_pool().await;
        let store = SqliteStore::new(pool);

        let mut profile = Profile::new(UserId(5));
        profile.updated_at = at(1);
        store.upsert_profile(&profile).await.unwrap();
        profile.username = Some("someone".to_string());
        profile.updated_at = at(2);
        store.upsert_profile(&profile).await.unwrap();
        assert_eq!(store.get_profile(UserId(5)).await.unwrap(), Some(profile));

        let mapper = Mapper::restricted(UserId(6), None, at(4));
        store.upsert_mapper(&mapper).await.unwrap();
        let stored = store.get_mapper(UserId(6)).await.unwrap().expect("mapper");
        assert!(stored.is_restricted);
        assert_eq!(stored.updated_at, at(4));
    }

    #[tokio::test]
    async fn leaderboards_and_requests() {
        let pool = setup_pool().await;
        let store = SqliteStore::new(pool);

        assert!(!store.has_leaderboard(BeatmapId(1)).await.unwrap());
        store.add_leaderboard(BeatmapId(1)).await.unwrap();
        store.add_leaderboard(BeatmapId(1)).await.unwrap();
        assert!(store.has_leaderboard(BeatmapId(1)).await.unwrap());

        let request = Request {
            user_id: UserId(2),
            beatmapset_id: BeatmapsetId(3),
            queue_id: graveboards_domain::QueueId(1),
            comment: "please".to_string(),
            mv_checked: true,
            created_at: at(5),
        };
        store.add_request(&request).await.unwrap();
        assert_eq!(store.list_requests().await.unwrap(), vec![request]);
    }
}
