//! Sports data feed capability.
//!
//! Only the finished-score shape is consumed here; fixture discovery and odds
//! ingestion live with the external fetcher that populates `oracle.fixtures`.

use crate::error::{KeeperError, Result};
use crate::results::FinalScore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Fixture ids per multi-fixture request.
const MAX_IDS_PER_REQUEST: usize = 50;

/// A result as reported by the external feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalResult {
    pub fixture_id: i64,
    /// Feed status short code, e.g. `FT`, `AET`, `NS`, `LIVE`.
    pub status: String,
    pub home_score: Option<u32>,
    pub away_score: Option<u32>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExternalResult {
    pub fn is_finished(&self) -> bool {
        matches!(self.status.as_str(), "FT" | "AET" | "FT_PEN")
    }

    /// The final score, only when the match is finished and both sides are known.
    pub fn final_score(&self) -> Option<FinalScore> {
        if !self.is_finished() {
            return None;
        }
        Some(FinalScore {
            home: self.home_score?,
            away: self.away_score?,
        })
    }
}

#[async_trait]
pub trait FixtureFeed: Send + Sync {
    async fn finished_results(&self, fixture_ids: &[i64]) -> Result<Vec<ExternalResult>>;
}

// ─── HTTP client ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    data: Vec<FeedFixture>,
}

#[derive(Debug, Deserialize)]
struct FeedFixture {
    id: i64,
    #[serde(default)]
    state: Option<FeedState>,
    #[serde(default)]
    scores: Vec<FeedScore>,
    #[serde(default)]
    starting_at_timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FeedState {
    #[serde(default)]
    short_name: String,
}

#[derive(Debug, Deserialize)]
struct FeedScore {
    #[serde(default)]
    description: String,
    score: FeedGoals,
}

#[derive(Debug, Deserialize)]
struct FeedGoals {
    goals: u32,
    participant: String,
}

impl FeedFixture {
    fn into_result(self) -> ExternalResult {
        // "CURRENT" carries the regular-time-plus-extra-time score.
        let mut home = None;
        let mut away = None;
        for s in self.scores.iter().filter(|s| s.description == "CURRENT") {
            match s.score.participant.as_str() {
                "home" => home = Some(s.score.goals),
                "away" => away = Some(s.score.goals),
                _ => {}
            }
        }
        ExternalResult {
            fixture_id: self.id,
            status: self.state.map(|s| s.short_name).unwrap_or_default(),
            home_score: home,
            away_score: away,
            finished_at: self
                .starting_at_timestamp
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
        }
    }
}

/// Minimal HTTP client for the sports data API with a per-endpoint minimum
/// interval between requests.
pub struct HttpFixtureFeed {
    http: Client,
    base_url: String,
    api_token: String,
    min_interval: Duration,
    last_call: Mutex<HashMap<&'static str, Instant>>,
}

impl HttpFixtureFeed {
    pub fn new(base_url: String, api_token: String, min_interval: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| KeeperError::Config(format!("failed to build feed client: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            api_token,
            min_interval,
            last_call: Mutex::new(HashMap::new()),
        })
    }

    async fn throttle(&self, endpoint: &'static str) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = last.get(endpoint) {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        last.insert(endpoint, Instant::now());
    }
}

#[async_trait]
impl FixtureFeed for HttpFixtureFeed {
    async fn finished_results(&self, fixture_ids: &[i64]) -> Result<Vec<ExternalResult>> {
        let mut out = Vec::with_capacity(fixture_ids.len());
        for chunk in fixture_ids.chunks(MAX_IDS_PER_REQUEST) {
            self.throttle("fixtures/multi").await;
            let ids = chunk
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let url = format!("{}/fixtures/multi/{}", self.base_url, ids);
            let resp = self
                .http
                .get(&url)
                .query(&[("api_token", self.api_token.as_str()), ("include", "scores;state")])
                .send()
                .await
                .map_err(|e| KeeperError::TransientRpc(format!("sports feed request failed: {}", e)))?;

            if !resp.status().is_success() {
                warn!(status = %resp.status(), "sports feed returned error status");
                return Err(KeeperError::TransientRpc(format!(
                    "sports feed returned status {}",
                    resp.status()
                )));
            }

            let body: FeedResponse = resp
                .json()
                .await
                .map_err(|e| KeeperError::Validation(format!("unparseable sports feed body: {}", e)))?;
            debug!(fixtures = body.data.len(), "sports feed batch received");
            out.extend(body.data.into_iter().map(FeedFixture::into_result));
        }
        Ok(out)
    }
}
