// SPDX-License-Identifier: GPL-3.0-or-later

use chrono::{DateTime, Utc};
use graveboards_domain::{
    BeatmapId, BeatmapsetId, Mapper, ProfileUpdate, Score, ScoreId, UserId,
};
use serde::{Deserialize, Serialize};

/// User record from `GET /users/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OsuUser {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// ISO 3166-1 alpha-2 country code.
    #[serde(default)]
    pub country_code: Option<String>,
    /// Only reported for some lookups; absent means unknown.
    #[serde(default)]
    pub is_restricted: Option<bool>,
    #[serde(default)]
    pub ranked_beatmapset_count: Option<i64>,
    #[serde(default)]
    pub graveyard_beatmapset_count: Option<i64>,
}

impl OsuUser {
    pub fn profile_update(&self) -> ProfileUpdate {
        ProfileUpdate {
            username: Some(self.username.clone()),
            avatar_url: self.avatar_url.clone(),
            country_code: self.country_code.clone(),
            is_restricted: self.is_restricted,
        }
    }

    pub fn to_mapper(&self, at: DateTime<Utc>) -> Mapper {
        Mapper {
            id: UserId(self.id),
            username: Some(self.username.clone()),
            avatar_url: self.avatar_url.clone(),
            country_code: self.country_code.clone(),
            ranked_beatmapset_count: self.ranked_beatmapset_count,
            graveyard_beatmapset_count: self.graveyard_beatmapset_count,
            is_restricted: self.is_restricted.unwrap_or(false),
            updated_at: at,
        }
    }
}

/// Which of a user's score lists to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreType {
    Best,
    Firsts,
    Recent,
}

impl ScoreType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::Firsts => "firsts",
            Self::Recent => "recent",
        }
    }
}

/// Beatmap reference embedded in a score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreBeatmap {
    pub id: i64,
    pub beatmapset_id: i64,
}

/// Score from `GET /users/{id}/scores/{type}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OsuScore {
    pub id: i64,
    pub user_id: i64,
    pub accuracy: f64,
    pub max_combo: i64,
    #[serde(alias = "total_score")]
    pub score: i64,
    #[serde(default)]
    pub pp: Option<f64>,
    pub rank: String,
    #[serde(default)]
    pub mods: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub beatmap: ScoreBeatmap,
}

impl OsuScore {
    pub fn to_domain(&self) -> Score {
        Score {
            id: ScoreId(self.id),
            user_id: UserId(self.user_id),
            beatmap_id: BeatmapId(self.beatmap.id),
            beatmapset_id: BeatmapsetId(self.beatmap.beatmapset_id),
            accuracy: self.accuracy,
            max_combo: self.max_combo,
            total_score: self.score,
            pp: self.pp,
            rank: self.rank.clone(),
            mods: self.mods.clone(),
            created_at: self.created_at,
        }
    }
}

/// One difficulty of a beatmapset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OsuBeatmap {
    pub id: i64,
    pub beatmapset_id: i64,
    /// Owner of this difficulty; differs from the set owner for guest difficulties.
    pub user_id: i64,
    /// MD5 of the .osu file.
    #[serde(default)]
    pub checksum: Option<String>,
    pub version: String,
    pub difficulty_rating: f64,
}

/// Beatmapset from `GET /beatmapsets/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OsuBeatmapset {
    pub id: i64,
    pub user_id: i64,
    pub artist: String,
    pub title: String,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub beatmaps: Vec<OsuBeatmap>,
}

impl OsuBeatmapset {
    /// Every distinct mapper involved: the set owner first, then guest mappers.
    pub fn mapper_ids(&self) -> Vec<UserId> {
        let mut ids = vec![UserId(self.user_id)];
        for beatmap in &self.beatmaps {
            let id = UserId(beatmap.user_id);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}
