// SPDX-License-Identifier: GPL-3.0-or-later

//! osu! API v2 client used by the background jobs.
//!
//! Calls go through a fixed-window rate limiter kept in the shared cache and
//! a bounded retry for transient failures. Results come back as
//! [`FetchOutcome`] so callers can tell "gone for good" from "try later".

pub mod api;
pub mod client;
#[cfg(test)]
mod client_tests;
pub mod error;
pub mod models;
pub mod rate_limiter;
pub mod retry;

pub use api::{FetchOutcome, OsuApi};
pub use client::OsuClient;
pub use error::{OsuError, Result};
pub use models::{OsuBeatmap, OsuBeatmapset, OsuScore, OsuUser, ScoreType};
pub use rate_limiter::RateLimiter;
pub use retry::{retry, Backoff, RetryPolicy};
