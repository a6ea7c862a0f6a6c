// SPDX-License-Identifier: GPL-3.0-or-later

#[cfg(test)]
mod tests {
    use crate::{Backoff, FetchOutcome, OsuApi, OsuClient, OsuError, RateLimiter, RetryPolicy, ScoreType};
    use graveboards_domain::{BeatmapsetId, UserId};
    use graveboards_infrastructure::cache::InMemoryCache;
    use chrono::{TimeZone, Utc};
    use graveboards_infrastructure::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn user_response() -> serde_json::Value {
        serde_json::json!({
            "id": 7,
            "username": "peppy",
            "avatar_url": "https://a.ppy.sh/7",
            "country_code": "AU",
            "ranked_beatmapset_count": 2,
            "graveyard_beatmapset_count": 11
        })
    }

    fn scores_response() -> serde_json::Value {
        serde_json::json!([
            {
                "id": 1001,
                "user_id": 7,
                "accuracy": 0.9812,
                "max_combo": 812,
                "score": 5123456,
                "pp": 187.4,
                "rank": "S",
                "mods": ["HD"],
                "created_at": "2024-04-02T18:30:00Z",
                "beatmap": { "id": 501, "beatmapset_id": 500 }
            },
            {
                "id": 1002,
                "user_id": 7,
                "accuracy": 0.91,
                "max_combo": 120,
                "score": 250000,
                "pp": null,
                "rank": "B",
                "mods": [],
                "created_at": "2024-04-02T18:35:00Z",
                "beatmap": { "id": 601, "beatmapset_id": 600 }
            }
        ])
    }

    fn beatmapset_response() -> serde_json::Value {
        serde_json::json!({
            "id": 500,
            "user_id": 7,
            "artist": "Camellia",
            "title": "Exit This Earth's Atomosphere",
            "creator": "peppy",
            "beatmaps": [
                {
                    "id": 501,
                    "beatmapset_id": 500,
                    "user_id": 7,
                    "checksum": "aaa111",
                    "version": "Hard",
                    "difficulty_rating": 4.2
                },
                {
                    "id": 502,
                    "beatmapset_id": 500,
                    "user_id": 9,
                    "checksum": "bbb222",
                    "version": "Guest Insane",
                    "difficulty_rating": 5.6
                }
            ]
        })
    }

    fn fast_retries(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
        }
    }

    fn client(server: &MockServer) -> OsuClient {
        OsuClient::builder()
            .base_url(server.uri())
            .access_token("secret")
            .retry_policy(fast_retries(3))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_user_sends_bearer_token() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/users/7"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(user_response()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let outcome = client(&mock_server).get_user(UserId(7)).await;

        let FetchOutcome::Ok(user) = outcome else {
            panic!("expected user, got {outcome:?}");
        };
        assert_eq!(user.username, "peppy");
        assert_eq!(user.country_code.as_deref(), Some("AU"));
        assert_eq!(user.graveyard_beatmapset_count, Some(11));
    }

    #[tokio::test]
    async fn test_get_user_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/users/404"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let outcome = client(&mock_server).get_user(UserId(404)).await;
        assert!(matches!(outcome, FetchOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/beatmapsets/500"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .expect(2)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/beatmapsets/500"))
            .respond_with(ResponseTemplate::new(200).set_body_json(beatmapset_response()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let outcome = client(&mock_server).get_beatmapset(BeatmapsetId(500)).await;

        let FetchOutcome::Ok(set) = outcome else {
            panic!("expected beatmapset, got {outcome:?}");
        };
        assert_eq!(set.beatmaps.len(), 2);
        assert_eq!(set.mapper_ids(), vec![UserId(7), UserId(9)]);
    }

    #[tokio::test]
    async fn test_persistent_throttling_is_transient() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/users/7"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&mock_server)
            .await;

        let outcome = client(&mock_server).get_user(UserId(7)).await;
        assert!(matches!(outcome, FetchOutcome::Transient(OsuError::Transient(_))));
    }

    #[tokio::test]
    async fn test_client_errors_are_fatal_and_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/users/7"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let outcome = client(&mock_server).get_user(UserId(7)).await;
        match outcome {
            FetchOutcome::Fatal(OsuError::ApiError { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "unauthorized");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_undecodable_body_is_fatal() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/users/7"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&mock_server)
            .await;

        let outcome = client(&mock_server).get_user(UserId(7)).await;
        assert!(matches!(outcome, FetchOutcome::Fatal(OsuError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_get_recent_scores() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/users/7/scores/recent"))
            .and(query_param("limit", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(scores_response()))
            .mount(&mock_server)
            .await;

        let outcome = client(&mock_server)
            .get_user_scores(UserId(7), ScoreType::Recent)
            .await;

        let FetchOutcome::Ok(scores) = outcome else {
            panic!("expected scores, got {outcome:?}");
        };
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].beatmap.id, 501);
        assert_eq!(scores[1].pp, None);
        assert_eq!(scores[0].to_domain().mods, vec!["HD".to_string()]);
    }

    #[tokio::test]
    async fn test_exhausted_rate_limit_without_auto_retry_skips_request() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/users/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(user_response()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let limiter = RateLimiter::new(
            Arc::new(InMemoryCache::new()),
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())),
            "osu",
            1,
            Duration::from_secs(3600),
        )
        .auto_retry(false);

        let client = OsuClient::builder()
            .base_url(mock_server.uri())
            .rate_limiter(limiter)
            .retry_policy(RetryPolicy::none())
            .build()
            .unwrap();

        assert!(client.get_user(UserId(7)).await.is_ok());
        let second = client.get_user(UserId(7)).await;
        assert!(matches!(
            second,
            FetchOutcome::Transient(OsuError::RateLimitExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_exhausted_rate_limit_is_not_retried_in_place() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/users/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(user_response()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let limiter = RateLimiter::new(
            Arc::new(InMemoryCache::new()),
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())),
            "osu",
            1,
            Duration::from_secs(3600),
        )
        .auto_retry(false);

        let client = OsuClient::builder()
            .base_url(mock_server.uri())
            .rate_limiter(limiter)
            .retry_policy(RetryPolicy {
                max_attempts: 5,
                backoff: Backoff::Fixed(Duration::from_millis(500)),
            })
            .build()
            .unwrap();

        assert!(client.get_user(UserId(7)).await.is_ok());

        let started = std::time::Instant::now();
        let second = client.get_user(UserId(7)).await;
        assert!(started.elapsed() < Duration::from_millis(400));
        let FetchOutcome::Transient(OsuError::RateLimitExceeded { retry_at }) = second else {
            panic!("expected rate limit error, got {second:?}");
        };
        assert_eq!(retry_at, Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap());
    }
}
