// SPDX-License-Identifier: GPL-3.0-or-later

//! Archiving a beatmapset: mappers, rows and checksum-addressed snapshots.

use std::sync::Arc;

use anyhow::{Context, Result};
use graveboards_domain::{
    combine_checksums, Beatmap, BeatmapId, BeatmapSnapshot, Beatmapset, BeatmapsetId,
    BeatmapsetSnapshot, Mapper, UserId,
};
use graveboards_infrastructure::clock::Clock;
use graveboards_infrastructure::lock::DistributedLock;
use graveboards_infrastructure::repositories::{BeatmapRepository, MapperRepository};
use graveboards_osu::{FetchOutcome, OsuApi};
use tracing::{debug, info, warn};

pub struct Archiver {
    osu: Arc<dyn OsuApi>,
    beatmaps: Arc<dyn BeatmapRepository>,
    mappers: Arc<dyn MapperRepository>,
    lock: DistributedLock,
    clock: Arc<dyn Clock>,
}

impl Archiver {
    pub fn new(
        osu: Arc<dyn OsuApi>,
        beatmaps: Arc<dyn BeatmapRepository>,
        mappers: Arc<dyn MapperRepository>,
        lock: DistributedLock,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            osu,
            beatmaps,
            mappers,
            lock,
            clock,
        }
    }

    /// Archive the current state of a beatmapset.
    ///
    /// Returns the beatmaps that got a new snapshot. An unchanged set
    /// returns an empty list.
    pub async fn archive(&self, beatmapset_id: BeatmapsetId) -> Result<Vec<BeatmapId>> {
        let set = match self.osu.get_beatmapset(beatmapset_id).await {
            FetchOutcome::Ok(set) => set,
            FetchOutcome::NotFound => anyhow::bail!("beatmapset {beatmapset_id} not found upstream"),
            FetchOutcome::Transient(err) | FetchOutcome::Fatal(err) => {
                return Err(anyhow::Error::new(err))
                    .with_context(|| format!("fetching beatmapset {beatmapset_id}"));
            }
        };
        let owner = UserId(set.user_id);

        for mapper_id in set.mapper_ids() {
            let hint = (mapper_id == owner).then(|| set.creator.clone()).flatten();
            self.ensure_mapper(mapper_id, hint).await?;
        }

        if self.beatmaps.get_beatmapset(beatmapset_id).await?.is_none() {
            self.beatmaps
                .add_beatmapset(&Beatmapset {
                    id: beatmapset_id,
                    mapper_id: owner,
                })
                .await?;
        }
        for beatmap in &set.beatmaps {
            let id = BeatmapId(beatmap.id);
            if self.beatmaps.get_beatmap(id).await?.is_none() {
                self.beatmaps
                    .add_beatmap(&Beatmap {
                        id,
                        beatmapset_id,
                        mapper_id: UserId(beatmap.user_id),
                    })
                    .await?;
            }
        }

        let checksums: Vec<String> = set
            .beatmaps
            .iter()
            .map(|b| b.checksum.clone().unwrap_or_default())
            .collect();
        let combined = combine_checksums(&checksums);
        if self
            .beatmaps
            .get_beatmapset_snapshot(beatmapset_id, &combined)
            .await?
            .is_some()
        {
            debug!(target: "archive", %beatmapset_id, "beatmapset unchanged since last snapshot");
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut snapshotted = Vec::new();
        for (beatmap, checksum) in set.beatmaps.iter().zip(&checksums) {
            let id = BeatmapId(beatmap.id);
            if self.beatmaps.get_beatmap_snapshot(id, checksum).await?.is_some() {
                continue;
            }
            let stored = self
                .beatmaps
                .add_beatmap_snapshot(&BeatmapSnapshot {
                    beatmap_id: id,
                    snapshot_number: 0,
                    checksum: checksum.clone(),
                    version: beatmap.version.clone(),
                    difficulty_rating: beatmap.difficulty_rating,
                    snapshot_date: now,
                })
                .await?;
            debug!(target: "archive", beatmap_id = %id, number = stored.snapshot_number, "beatmap snapshot stored");
            snapshotted.push(id);
        }

        let stored = self
            .beatmaps
            .add_beatmapset_snapshot(&BeatmapsetSnapshot {
                beatmapset_id,
                snapshot_number: 0,
                checksum: combined,
                artist: set.artist.clone(),
                title: set.title.clone(),
                beatmap_checksums: checksums,
                snapshot_date: now,
            })
            .await?;

        info!(
            target: "archive",
            %beatmapset_id,
            number = stored.snapshot_number,
            new_beatmaps = snapshotted.len(),
            "beatmapset archived"
        );
        Ok(snapshotted)
    }

    /// Make sure a mapper row exists, fetching it at most once across callers.
    pub async fn ensure_mapper(&self, id: UserId, username_hint: Option<String>) -> Result<Mapper> {
        if let Some(mapper) = self.mappers.get_mapper(id).await? {
            return Ok(mapper);
        }

        self.lock
            .run_or_wait(
                &format!("mapper:{id}"),
                || self.mappers.get_mapper(id),
                || self.fetch_mapper(id, username_hint),
            )
            .await
    }

    async fn fetch_mapper(&self, id: UserId, username_hint: Option<String>) -> Result<Mapper> {
        // The previous holder may have finished between our check and the lock.
        if let Some(mapper) = self.mappers.get_mapper(id).await? {
            return Ok(mapper);
        }

        let now = self.clock.now();
        let mapper = match self.osu.get_user(id).await {
            FetchOutcome::Ok(user) => user.to_mapper(now),
            FetchOutcome::NotFound => {
                warn!(target: "archive", mapper_id = %id, "mapper not found upstream, storing restricted placeholder");
                Mapper::restricted(id, username_hint, now)
            }
            FetchOutcome::Fatal(err) => {
                warn!(target: "archive", mapper_id = %id, error = %err, "mapper fetch failed, storing restricted placeholder");
                Mapper::restricted(id, username_hint, now)
            }
            FetchOutcome::Transient(err) => {
                return Err(anyhow::Error::new(err)).with_context(|| format!("fetching mapper {id}"));
            }
        };

        self.mappers.upsert_mapper(&mapper).await?;
        Ok(mapper)
    }
}
