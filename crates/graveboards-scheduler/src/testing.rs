// SPDX-License-Identifier: GPL-3.0-or-later

//! Scripted osu! API stand-in shared by the scheduler tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use graveboards_domain::{BeatmapsetId, UserId};
use graveboards_osu::models::ScoreBeatmap;
use graveboards_osu::{
    FetchOutcome, OsuApi, OsuBeatmap, OsuBeatmapset, OsuError, OsuScore, OsuUser, ScoreType,
};

#[derive(Default)]
pub struct FakeOsu {
    users: Mutex<HashMap<UserId, OsuUser>>,
    scores: Mutex<HashMap<UserId, Vec<OsuScore>>>,
    beatmapsets: Mutex<HashMap<BeatmapsetId, OsuBeatmapset>>,
    unavailable: AtomicBool,
    user_delay: Mutex<Duration>,
    pub user_calls: AtomicUsize,
    pub beatmapset_calls: AtomicUsize,
}

impl FakeOsu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, id: i64, username: &str) -> Self {
        self.users.lock().unwrap().insert(UserId(id), user(id, username));
        self
    }

    pub fn with_scores(self, user_id: i64, scores: Vec<OsuScore>) -> Self {
        self.scores.lock().unwrap().insert(UserId(user_id), scores);
        self
    }

    pub fn with_beatmapset(self, set: OsuBeatmapset) -> Self {
        self.set_beatmapset(set);
        self
    }

    pub fn set_beatmapset(&self, set: OsuBeatmapset) {
        self.beatmapsets.lock().unwrap().insert(BeatmapsetId(set.id), set);
    }

    /// Every call fails transiently while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_user_delay(&self, delay: Duration) {
        *self.user_delay.lock().unwrap() = delay;
    }

    fn outage<T>(&self) -> Option<FetchOutcome<T>> {
        self.unavailable
            .load(Ordering::SeqCst)
            .then(|| FetchOutcome::Transient(OsuError::Transient("503 Service Unavailable".into())))
    }
}

#[async_trait::async_trait]
impl OsuApi for FakeOsu {
    async fn get_user(&self, user_id: UserId) -> FetchOutcome<OsuUser> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.user_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(outage) = self.outage() {
            return outage;
        }
        match self.users.lock().unwrap().get(&user_id) {
            Some(user) => FetchOutcome::Ok(user.clone()),
            None => FetchOutcome::NotFound,
        }
    }

    async fn get_user_scores(&self, user_id: UserId, _kind: ScoreType) -> FetchOutcome<Vec<OsuScore>> {
        if let Some(outage) = self.outage() {
            return outage;
        }
        if !self.users.lock().unwrap().contains_key(&user_id) {
            return FetchOutcome::NotFound;
        }
        FetchOutcome::Ok(self.scores.lock().unwrap().get(&user_id).cloned().unwrap_or_default())
    }

    async fn get_beatmapset(&self, beatmapset_id: BeatmapsetId) -> FetchOutcome<OsuBeatmapset> {
        self.beatmapset_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(outage) = self.outage() {
            return outage;
        }
        match self.beatmapsets.lock().unwrap().get(&beatmapset_id) {
            Some(set) => FetchOutcome::Ok(set.clone()),
            None => FetchOutcome::NotFound,
        }
    }
}

pub fn user(id: i64, username: &str) -> OsuUser {
    OsuUser {
        id,
        username: username.to_string(),
        avatar_url: Some(format!("https://a.ppy.sh/{id}")),
        country_code: Some("JP".to_string()),
        is_restricted: Some(false),
        ranked_beatmapset_count: Some(1),
        graveyard_beatmapset_count: Some(12),
    }
}

pub fn score(id: i64, user_id: i64, beatmap_id: i64, beatmapset_id: i64) -> OsuScore {
    OsuScore {
        id,
        user_id,
        accuracy: 0.97,
        max_combo: 700,
        score: 4_000_000,
        pp: Some(150.0),
        rank: "S".to_string(),
        mods: vec!["HD".to_string()],
        created_at: Utc.with_ymd_and_hms(2024, 5, 30, 20, 0, 0).unwrap(),
        beatmap: ScoreBeatmap {
            id: beatmap_id,
            beatmapset_id,
        },
    }
}

/// Beatmapset owned by `owner` with one difficulty per `(id, mapper, checksum)`.
pub fn beatmapset(id: i64, owner: i64, difficulties: &[(i64, i64, &str)]) -> OsuBeatmapset {
    OsuBeatmapset {
        id,
        user_id: owner,
        artist: "xi".to_string(),
        title: "Blue Zenith".to_string(),
        creator: Some(format!("mapper{owner}")),
        beatmaps: difficulties
            .iter()
            .map(|&(beatmap_id, mapper, checksum)| OsuBeatmap {
                id: beatmap_id,
                beatmapset_id: id,
                user_id: mapper,
                checksum: Some(checksum.to_string()),
                version: format!("Diff {beatmap_id}"),
                difficulty_rating: 5.5,
            })
            .collect(),
    }
}
