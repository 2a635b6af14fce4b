//! Result ingestion: external scores → canonical fixture results.
//!
//! Also owns the fixture eligibility rules used when a new Oddyssey cycle is
//! opened, since both depend on what the sports feed reports.

pub mod feed;

use crate::error::{KeeperError, Result};
use crate::outcome::{Btts, Moneyline, OverUnder};
use crate::store::models::{Fixture, FixtureResultRecord};
use crate::store::ResultStore;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use feed::{ExternalResult, FixtureFeed, HttpFixtureFeed};

/// Number of matches in every Oddyssey cycle.
pub const MATCHES_PER_CYCLE: usize = 10;

/// A final full-time score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalScore {
    pub home: u32,
    pub away: u32,
}

/// The three canonical markets derived from one final score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalResult {
    pub moneyline: Moneyline,
    pub over_under: OverUnder,
    pub btts: Btts,
    pub score: FinalScore,
}

impl CanonicalResult {
    pub fn from_score(score: FinalScore) -> Self {
        let moneyline = if score.home > score.away {
            Moneyline::Home
        } else if score.away > score.home {
            Moneyline::Away
        } else {
            Moneyline::Draw
        };

        // 2.5 line: three or more goals is Over.
        let over_under = if score.home + score.away >= 3 {
            OverUnder::Over
        } else {
            OverUnder::Under
        };

        let btts = if score.home > 0 && score.away > 0 {
            Btts::Yes
        } else {
            Btts::No
        };

        Self {
            moneyline,
            over_under,
            btts,
            score,
        }
    }

    /// Build the row written to `oracle.fixture_results`.
    pub fn to_record(&self, fixture_id: i64, finished_at: DateTime<Utc>) -> FixtureResultRecord {
        FixtureResultRecord {
            fixture_id,
            home_score: Some(self.score.home as i32),
            away_score: Some(self.score.away as i32),
            outcome_1x2: Some(self.moneyline.as_str().to_string()),
            outcome_ou25: Some(self.over_under.as_str().to_string()),
            outcome_btts: Some(self.btts.as_str().to_string()),
            finished_at: Some(finished_at),
        }
    }
}

/// Summary of one ingestion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub requested: usize,
    pub written: usize,
    pub not_finished: usize,
}

/// Pulls finished scores from the feed and writes canonical rows.
pub struct ResultIngestor {
    store: Arc<dyn ResultStore>,
    feed: Arc<dyn FixtureFeed>,
}

impl ResultIngestor {
    pub fn new(store: Arc<dyn ResultStore>, feed: Arc<dyn FixtureFeed>) -> Self {
        Self { store, feed }
    }

    /// Fetch and persist results for every fixture whose match should be over
    /// but which has no result row yet.
    pub async fn ingest_pending(&self, now: DateTime<Utc>) -> Result<IngestSummary> {
        let pending = self.store.fixtures_awaiting_results(now).await?;
        if pending.is_empty() {
            debug!("no fixtures awaiting results");
            return Ok(IngestSummary::default());
        }
        let external = self.feed.finished_results(&pending).await?;
        let summary = self.ingest(pending.len(), &external).await?;
        info!(
            requested = summary.requested,
            written = summary.written,
            not_finished = summary.not_finished,
            "result ingestion pass complete"
        );
        Ok(summary)
    }

    /// Write canonical results for the finished entries of a feed batch.
    pub async fn ingest(&self, requested: usize, batch: &[ExternalResult]) -> Result<IngestSummary> {
        let mut summary = IngestSummary {
            requested,
            ..Default::default()
        };

        for ext in batch {
            let Some(score) = ext.final_score() else {
                summary.not_finished += 1;
                continue;
            };
            let result = CanonicalResult::from_score(score);
            let record = result.to_record(ext.fixture_id, ext.finished_at.unwrap_or_else(Utc::now));
            match self.store.upsert_fixture_result(&record).await {
                Ok(()) => {
                    summary.written += 1;
                    debug!(
                        fixture_id = ext.fixture_id,
                        outcome_1x2 = %result.moneyline,
                        outcome_ou25 = %result.over_under,
                        "fixture result stored"
                    );
                }
                Err(e) => {
                    warn!(fixture_id = ext.fixture_id, error = %e, "failed to store fixture result");
                    return Err(e);
                }
            }
        }

        Ok(summary)
    }

    /// Operator override of one fixture's outcomes. Legacy spellings (`1`,
    /// `X`, `o`, `n`, lowercase words) are normalized to the canonical words
    /// before the write. Scores and unspecified markets are left as stored.
    pub async fn record_manual_result(
        &self,
        fixture_id: i64,
        moneyline: &str,
        over_under: &str,
        btts: Option<&str>,
    ) -> Result<FixtureResultRecord> {
        let moneyline = Moneyline::normalize_legacy(moneyline)
            .ok_or_else(|| KeeperError::Validation(format!("unrecognised 1X2 outcome {:?}", moneyline)))?;
        let over_under = OverUnder::normalize_legacy(over_under)
            .ok_or_else(|| KeeperError::Validation(format!("unrecognised O/U outcome {:?}", over_under)))?;
        let btts = btts
            .map(|raw| {
                Btts::normalize_legacy(raw)
                    .ok_or_else(|| KeeperError::Validation(format!("unrecognised BTTS outcome {:?}", raw)))
            })
            .transpose()?;

        let record = FixtureResultRecord {
            fixture_id,
            home_score: None,
            away_score: None,
            outcome_1x2: Some(moneyline.as_str().to_string()),
            outcome_ou25: Some(over_under.as_str().to_string()),
            outcome_btts: btts.map(|b| b.as_str().to_string()),
            finished_at: None,
        };
        self.store.upsert_fixture_result(&record).await?;
        warn!(
            fixture_id = fixture_id,
            outcome_1x2 = %moneyline,
            outcome_ou25 = %over_under,
            "fixture result set manually"
        );
        Ok(record)
    }
}

// ─── Cycle fixture selection ─────────────────────────────────────────────────

/// Rules applied when picking the 10 fixtures of a new cycle.
#[derive(Debug, Clone)]
pub struct SelectionRules {
    /// Fixtures must kick off at least this long after the cycle opens.
    pub min_lead: Duration,
    /// And no later than this after the cycle opens.
    pub window: Duration,
    /// Every offered price must be strictly above this.
    pub min_odds: Decimal,
}

impl Default for SelectionRules {
    fn default() -> Self {
        Self {
            min_lead: Duration::minutes(60),
            window: Duration::hours(24),
            min_odds: Decimal::ONE,
        }
    }
}

impl SelectionRules {
    pub fn is_eligible(&self, fixture: &Fixture, now: DateTime<Utc>) -> bool {
        if fixture.kickoff < now + self.min_lead || fixture.kickoff > now + self.window {
            return false;
        }
        let odds = &fixture.odds;
        [odds.home, odds.draw, odds.away, odds.over_25, odds.under_25]
            .iter()
            .all(|o| matches!(o, Some(v) if *v > self.min_odds))
    }

    /// Pick exactly [`MATCHES_PER_CYCLE`] fixtures ordered by kickoff then id,
    /// or `None` when not enough are eligible.
    pub fn select(&self, candidates: &[Fixture], now: DateTime<Utc>) -> Option<Vec<Fixture>> {
        let mut eligible: Vec<Fixture> = candidates
            .iter()
            .filter(|f| self.is_eligible(f, now))
            .cloned()
            .collect();
        if eligible.len() < MATCHES_PER_CYCLE {
            return None;
        }
        eligible.sort_by(|a, b| a.kickoff.cmp(&b.kickoff).then(a.id.cmp(&b.id)));
        eligible.truncate(MATCHES_PER_CYCLE);
        Some(eligible)
    }
}
