// SPDX-License-Identifier: GPL-3.0-or-later

use graveboards_domain::{BeatmapsetId, UserId};

use crate::error::OsuError;
use crate::models::{OsuBeatmapset, OsuScore, OsuUser, ScoreType};

/// Result of an outbound fetch, classified for the caller.
///
/// Handlers branch on this instead of inspecting error details: `NotFound`
/// is permanent and usually disables whatever asked for it, `Transient` is
/// worth another attempt later, `Fatal` is a bug or a contract change.
#[derive(Debug)]
pub enum FetchOutcome<T> {
    Ok(T),
    Transient(OsuError),
    NotFound,
    Fatal(OsuError),
}

impl<T> FetchOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

impl<T> From<Result<T, OsuError>> for FetchOutcome<T> {
    fn from(result: Result<T, OsuError>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(OsuError::NotFound(_)) => Self::NotFound,
            Err(err) if err.is_transient() => Self::Transient(err),
            Err(err) => Self::Fatal(err),
        }
    }
}

/// The subset of the osu! API the background jobs call.
#[async_trait::async_trait]
pub trait OsuApi: Send + Sync + 'static {
    async fn get_user(&self, user_id: UserId) -> FetchOutcome<OsuUser>;

    async fn get_user_scores(&self, user_id: UserId, kind: ScoreType) -> FetchOutcome<Vec<OsuScore>>;

    async fn get_beatmapset(&self, beatmapset_id: BeatmapsetId) -> FetchOutcome<OsuBeatmapset>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_are_classified() {
        let ok: FetchOutcome<u8> = Ok(1).into();
        assert!(ok.is_ok());

        let missing: FetchOutcome<u8> = Err(OsuError::NotFound("/users/1".into())).into();
        assert!(matches!(missing, FetchOutcome::NotFound));

        let busy: FetchOutcome<u8> = Err(OsuError::Transient("503".into())).into();
        assert!(matches!(busy, FetchOutcome::Transient(_)));

        let broken: FetchOutcome<u8> = Err(OsuError::InvalidResponse("eof".into())).into();
        assert!(matches!(broken, FetchOutcome::Fatal(_)));
    }
}
