// SPDX-License-Identifier: GPL-3.0-or-later
use crate::job::{JobContext, JobResult, RecurringJob};
use anyhow::{Context, Result};
use graveboards_domain::{Mapper, Profile, TaskKind, UserId};
use graveboards_infrastructure::clock::Clock;
use graveboards_infrastructure::lock::DistributedLock;
use graveboards_infrastructure::repositories::{
    LeaderboardRepository, MapperRepository, ProfileRepository, ScoreRepository,
};
use graveboards_osu::{FetchOutcome, OsuApi, OsuError, ScoreType};
use std::sync::Arc;
use tracing::{debug, info, warn};

fn upstream_error(err: OsuError, what: &str, owner_id: UserId) -> anyhow::Error {
    anyhow::Error::new(err).context(format!("fetching {what} for user {owner_id}"))
}

/// Keeps a user's profile in line with the osu! API
pub struct ProfileRefreshJob {
    osu: Arc<dyn OsuApi>,
    profiles: Arc<dyn ProfileRepository>,
    lock: DistributedLock,
    clock: Arc<dyn Clock>,
}

impl ProfileRefreshJob {
    pub fn new(
        osu: Arc<dyn OsuApi>,
        profiles: Arc<dyn ProfileRepository>,
        lock: DistributedLock,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            osu,
            profiles,
            lock,
            clock,
        }
    }

    async fn refresh(&self, user_id: UserId) -> Result<JobResult> {
        let user = match self.osu.get_user(user_id).await {
            FetchOutcome::Ok(user) => user,
            FetchOutcome::NotFound => {
                return Ok(JobResult::Disable {
                    reason: format!("user {user_id} not found upstream"),
                })
            }
            FetchOutcome::Transient(err) | FetchOutcome::Fatal(err) => {
                return Err(upstream_error(err, "profile", user_id))
            }
        };

        let mut profile = self
            .profiles
            .get_profile(user_id)
            .await?
            .unwrap_or_else(|| Profile::new(user_id));
        profile.apply(user.profile_update(), self.clock.now());
        self.profiles
            .upsert_profile(&profile)
            .await
            .with_context(|| format!("storing profile for user {user_id}"))?;

        debug!(target: "jobs", %user_id, username = %user.username, "profile refreshed");
        Ok(JobResult::Success)
    }
}

#[async_trait::async_trait]
impl RecurringJob for ProfileRefreshJob {
    fn kind(&self) -> TaskKind {
        TaskKind::ProfileFetcher
    }

    async fn execute(&self, ctx: JobContext) -> Result<JobResult> {
        let user_id = ctx.owner_id;
        let name = format!("profile_fetch:{user_id}");

        match self
            .lock
            .try_run_exclusive(&name, || self.refresh(user_id))
            .await?
        {
            Some(result) => Ok(result),
            None => {
                // Someone else is fetching this profile right now.
                debug!(target: "jobs", %user_id, "profile fetch already in progress, skipping");
                Ok(JobResult::Success)
            }
        }
    }
}

/// Pulls a user's recent scores onto tracked leaderboards
pub struct ScoreRefreshJob {
    osu: Arc<dyn OsuApi>,
    scores: Arc<dyn ScoreRepository>,
    leaderboards: Arc<dyn LeaderboardRepository>,
}

impl ScoreRefreshJob {
    pub fn new(
        osu: Arc<dyn OsuApi>,
        scores: Arc<dyn ScoreRepository>,
        leaderboards: Arc<dyn LeaderboardRepository>,
    ) -> Self {
        Self {
            osu,
            scores,
            leaderboards,
        }
    }
}

#[async_trait::async_trait]
impl RecurringJob for ScoreRefreshJob {
    fn kind(&self) -> TaskKind {
        TaskKind::ScoreFetcher
    }

    async fn execute(&self, ctx: JobContext) -> Result<JobResult> {
        let user_id = ctx.owner_id;
        let scores = match self.osu.get_user_scores(user_id, ScoreType::Recent).await {
            FetchOutcome::Ok(scores) => scores,
            FetchOutcome::NotFound => {
                return Ok(JobResult::Disable {
                    reason: format!("user {user_id} not found upstream"),
                })
            }
            FetchOutcome::Transient(err) | FetchOutcome::Fatal(err) => {
                return Err(upstream_error(err, "recent scores", user_id))
            }
        };

        let fetched = scores.len();
        let mut added = 0usize;
        for score in scores.iter().map(|s| s.to_domain()) {
            if !self.leaderboards.has_leaderboard(score.beatmap_id).await? {
                continue;
            }
            if self.scores.add_score(&score).await? {
                added += 1;
            }
        }

        info!(target: "jobs", %user_id, fetched, added, "scores refreshed");
        Ok(JobResult::Success)
    }
}

/// Refreshes the stored record of a mapper
pub struct MapperRefreshJob {
    osu: Arc<dyn OsuApi>,
    mappers: Arc<dyn MapperRepository>,
    clock: Arc<dyn Clock>,
}

impl MapperRefreshJob {
    pub fn new(osu: Arc<dyn OsuApi>, mappers: Arc<dyn MapperRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            osu,
            mappers,
            clock,
        }
    }
}

#[async_trait::async_trait]
impl RecurringJob for MapperRefreshJob {
    fn kind(&self) -> TaskKind {
        TaskKind::MapperInfoFetcher
    }

    async fn execute(&self, ctx: JobContext) -> Result<JobResult> {
        let mapper_id = ctx.owner_id;
        match self.osu.get_user(mapper_id).await {
            FetchOutcome::Ok(user) => {
                self.mappers.upsert_mapper(&user.to_mapper(self.clock.now())).await?;
                debug!(target: "jobs", %mapper_id, "mapper refreshed");
                Ok(JobResult::Success)
            }
            FetchOutcome::NotFound => {
                let known_as = self
                    .mappers
                    .get_mapper(mapper_id)
                    .await?
                    .and_then(|m| m.username);
                warn!(target: "jobs", %mapper_id, "mapper no longer served upstream, marking restricted");
                self.mappers
                    .upsert_mapper(&Mapper::restricted(mapper_id, known_as, self.clock.now()))
                    .await?;
                Ok(JobResult::Disable {
                    reason: format!("mapper {mapper_id} not found upstream"),
                })
            }
            FetchOutcome::Transient(err) | FetchOutcome::Fatal(err) => {
                Err(upstream_error(err, "mapper info", mapper_id))
            }
        }
    }
}
