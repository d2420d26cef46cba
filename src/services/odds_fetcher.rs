//! Ingests NFL lines from The Odds API into `games` and `odds_snapshots`.
//!
//! ## Request budget (500 free req / month)
//! Every call to the provider is charged against a `UsageBudget` row before
//! it is made. The counter lives in the store, so it survives restarts and is
//! shared by every process pointed at the same database. It resets on the
//! first ingest of each calendar month (UTC).
//!
//! One `ingest` spends at most **2 requests**: one for odds, one for scores.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::SourceConfig;
use crate::db::Store;
use crate::error::ConfigError;
use crate::models::{Game, GameStatus, MarketType, OddsSnapshot, Outcome, SourceType, UsageBudget};
use crate::services::weather_fetcher::stadium_for_team;
use crate::services::{HttpClient, StageOutcome};
use crate::utils::{nfl_season, nfl_week};

const SPORT_KEY: &str = "americanfootball_nfl";
const BUDGET_KEY: &str = "odds_api_monthly";
/// Kickoff moves larger than this flag the game as rescheduled.
const SCHEDULE_TOLERANCE_MINUTES: i64 = 5;

// ── Odds API response types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OddsEvent {
    pub id: String,
    pub commence_time: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub bookmakers: Vec<Bookmaker>,
}

#[derive(Debug, Deserialize)]
pub struct Bookmaker {
    pub key: String,
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub markets: Vec<Market>,
}

#[derive(Debug, Deserialize)]
pub struct Market {
    pub key: String,
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcomes: Vec<ApiOutcome>,
}

#[derive(Debug, Deserialize)]
pub struct ApiOutcome {
    pub name: String,
    pub price: f64,
    pub point: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ScoreEvent {
    pub id: String,
    pub commence_time: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub completed: bool,
    pub scores: Option<Vec<TeamScore>>,
}

#[derive(Debug, Deserialize)]
pub struct TeamScore {
    pub name: String,
    pub score: String,
}

// ── Budget ────────────────────────────────────────────────────────────────────

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Charge one request against the monthly budget. Returns false, without
/// charging, when the budget is exhausted.
pub async fn try_consume(store: &dyn Store, limit: i64, now: DateTime<Utc>) -> Result<bool> {
    let period_start = month_start(now);
    let mut budget = match store.read_budget(BUDGET_KEY).await? {
        Some(b) if b.period_start >= period_start => b,
        _ => UsageBudget {
            key: BUDGET_KEY.to_string(),
            used: 0,
            limit,
            period_start,
        },
    };
    budget.limit = limit;

    if budget.used >= budget.limit {
        tracing::warn!("Odds API budget exhausted: {}/{} this month", budget.used, budget.limit);
        return Ok(false);
    }
    budget.used += 1;
    store.write_budget(&budget).await?;
    tracing::debug!("Odds API budget: {}/{} used", budget.used, budget.limit);
    Ok(true)
}

// ── Mapping ───────────────────────────────────────────────────────────────────

/// Lifecycle before a final score arrives: kicked off means in progress, a
/// kickoff pushed back into the future returns to scheduled. Completed is terminal.
pub fn status_at(current: Option<GameStatus>, kickoff: DateTime<Utc>, now: DateTime<Utc>) -> GameStatus {
    match current {
        Some(GameStatus::Completed) => GameStatus::Completed,
        _ if kickoff <= now => GameStatus::InProgress,
        _ => GameStatus::Scheduled,
    }
}

/// New or refreshed game row for an event. Kickoff is always the provider's
/// latest; scores and status carry over from what is already stored.
pub fn game_from_event(event: &OddsEvent, existing: Option<&Game>, now: DateTime<Utc>) -> Game {
    let kickoff = event.commence_time;
    let moved = existing
        .map(|g| (g.kickoff_time - kickoff).num_minutes().abs() > SCHEDULE_TOLERANCE_MINUTES)
        .unwrap_or(false);
    if moved {
        tracing::info!(
            "Schedule change for {} @ {}: kickoff now {}",
            event.away_team,
            event.home_team,
            kickoff
        );
    }

    Game {
        id: event.id.clone(),
        season: nfl_season(kickoff),
        week: nfl_week(kickoff),
        home_team: event.home_team.clone(),
        away_team: event.away_team.clone(),
        kickoff_time: kickoff,
        venue: existing
            .and_then(|g| g.venue.clone())
            .or_else(|| stadium_for_team(&event.home_team).map(|s| s.name.to_string())),
        status: status_at(existing.map(|g| g.status), kickoff, now),
        home_score: existing.and_then(|g| g.home_score),
        away_score: existing.and_then(|g| g.away_score),
        schedule_change: moved || existing.map(|g| g.schedule_change).unwrap_or(false),
        created_at: existing.map(|g| g.created_at).unwrap_or(now),
        updated_at: now,
    }
}

/// One snapshot per bookmaker × tracked market. Unknown market keys are
/// dropped here so nothing downstream sees them.
pub fn snapshots_from_event(event: &OddsEvent, now: DateTime<Utc>) -> Vec<OddsSnapshot> {
    let mut snapshots = Vec::new();
    for bookmaker in &event.bookmakers {
        for market in &bookmaker.markets {
            let Some(market_type) = MarketType::from_key(&market.key) else {
                tracing::debug!("Skipping unknown market '{}' from {}", market.key, bookmaker.key);
                continue;
            };
            if market.outcomes.is_empty() {
                continue;
            }
            snapshots.push(OddsSnapshot {
                id: Uuid::new_v4().to_string(),
                game_id: event.id.clone(),
                bookmaker: bookmaker.key.clone(),
                market: market_type,
                outcomes: market
                    .outcomes
                    .iter()
                    .map(|o| Outcome { name: o.name.clone(), price: o.price, point: o.point })
                    .collect(),
                last_update: market.last_update.or(bookmaker.last_update),
                snapshot_time: now,
            });
        }
    }
    snapshots
}

/// Final (home, away) score for a completed event.
pub fn final_score(event: &ScoreEvent) -> Option<(i32, i32)> {
    if !event.completed {
        return None;
    }
    let scores = event.scores.as_ref()?;
    let find = |team: &str| {
        scores
            .iter()
            .find(|s| s.name == team)
            .and_then(|s| s.score.trim().parse::<i32>().ok())
    };
    Some((find(&event.home_team)?, find(&event.away_team)?))
}

// ── Fetcher ───────────────────────────────────────────────────────────────────

pub struct OddsFetcher {
    http: HttpClient,
    config: SourceConfig,
}

impl OddsFetcher {
    pub fn new(http: HttpClient, config: SourceConfig) -> Self {
        Self { http, config }
    }

    fn api_key(&self) -> Result<&str> {
        self.config
            .odds_api_key
            .as_deref()
            .ok_or_else(|| ConfigError::Missing { key: "ODDS_API_KEY" }.into())
    }

    async fn fetch_events(&self, api_key: &str) -> Result<Vec<OddsEvent>> {
        let url = format!("{}/sports/{}/odds", self.config.odds_api_base.trim_end_matches('/'), SPORT_KEY);
        let query = [
            ("apiKey", api_key.to_string()),
            ("regions", self.config.odds_region.clone()),
            ("markets", "h2h,spreads,totals".to_string()),
            ("oddsFormat", "decimal".to_string()),
            ("dateFormat", "iso".to_string()),
        ];
        Ok(self.http.get_json(SourceType::Odds.default_name(), &url, &query).await?)
    }

    async fn fetch_scores(&self, api_key: &str) -> Result<Vec<ScoreEvent>> {
        let url = format!("{}/sports/{}/scores", self.config.odds_api_base.trim_end_matches('/'), SPORT_KEY);
        let query = [
            ("apiKey", api_key.to_string()),
            ("daysFrom", "3".to_string()),
            ("dateFormat", "iso".to_string()),
        ];
        Ok(self.http.get_json(SourceType::Odds.default_name(), &url, &query).await?)
    }

    async fn ingest_event(&self, store: &dyn Store, event: &OddsEvent, now: DateTime<Utc>) -> Result<usize> {
        let existing = store.get_game(&event.id).await?;
        let game = game_from_event(event, existing.as_ref(), now);
        store.upsert_game(&game).await?;

        let snapshots = snapshots_from_event(event, now);
        for snapshot in &snapshots {
            store.insert_odds_snapshot(snapshot).await?;
        }
        Ok(snapshots.len())
    }

    async fn apply_score(&self, store: &dyn Store, event: &ScoreEvent, now: DateTime<Utc>) -> Result<bool> {
        let Some((home, away)) = final_score(event) else {
            // Live scores only move the game along its lifecycle.
            if event.scores.is_some() {
                if let Some(mut game) = store.get_game(&event.id).await? {
                    let status = status_at(Some(game.status), event.commence_time, now);
                    if status != game.status {
                        game.status = status;
                        game.updated_at = now;
                        store.upsert_game(&game).await?;
                    }
                }
            }
            return Ok(false);
        };
        let Some(mut game) = store.get_game(&event.id).await? else {
            tracing::debug!("Score for unknown game {} ({} @ {})", event.id, event.away_team, event.home_team);
            return Ok(false);
        };
        if game.final_scores() == Some((home, away)) {
            return Ok(false);
        }
        game.status = GameStatus::Completed;
        game.home_score = Some(home);
        game.away_score = Some(away);
        game.kickoff_time = event.commence_time;
        game.updated_at = now;
        store.upsert_game(&game).await?;
        Ok(true)
    }

    /// Refresh lines for every listed game, then mark finished games with
    /// their final scores.
    pub async fn ingest(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<StageOutcome> {
        let api_key = self.api_key()?;

        if let Some(source) = store.get_source(SourceType::Odds).await? {
            if !source.is_active {
                tracing::info!("Odds source is inactive, skipping");
                return Ok(StageOutcome::default());
            }
        }

        if !try_consume(store, self.config.odds_monthly_budget, now).await? {
            return Err(anyhow!("monthly odds request budget exhausted"));
        }

        let events = match self.fetch_events(api_key).await {
            Ok(events) => events,
            Err(e) => {
                store.record_source_failure(SourceType::Odds, now).await?;
                return Err(e);
            }
        };
        store.record_source_success(SourceType::Odds, now).await?;

        let mut outcome = StageOutcome::default();
        let mut snapshot_count = 0usize;
        for event in &events {
            match self.ingest_event(store, event, now).await {
                Ok(n) => {
                    snapshot_count += n;
                    outcome.record_success();
                }
                Err(e) => outcome.record_failure(&event.id, e),
            }
        }
        tracing::info!("Odds: {} NFL events stored ({} snapshots)", outcome.processed, snapshot_count);

        // Scores are best-effort; a miss here never fails the odds stage.
        if !try_consume(store, self.config.odds_monthly_budget, now).await? {
            return Ok(outcome);
        }
        match self.fetch_scores(api_key).await {
            Ok(scores) => {
                let mut finished = 0usize;
                for event in &scores {
                    match self.apply_score(store, event, now).await {
                        Ok(true) => finished += 1,
                        Ok(false) => {}
                        Err(e) => outcome.record_failure(format!("score/{}", event.id), e),
                    }
                }
                tracing::info!("Odds: {} games marked final", finished);
            }
            Err(e) => outcome.record_failure("scores", e),
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn event(commence: DateTime<Utc>) -> OddsEvent {
        serde_json::from_value(serde_json::json!({
            "id": "evt1",
            "sport_key": "americanfootball_nfl",
            "commence_time": commence.to_rfc3339(),
            "home_team": "Chicago Bears",
            "away_team": "Green Bay Packers",
            "bookmakers": [
                {
                    "key": "draftkings",
                    "title": "DraftKings",
                    "last_update": "2025-10-01T12:00:00Z",
                    "markets": [
                        { "key": "h2h", "outcomes": [
                            { "name": "Chicago Bears", "price": 2.3 },
                            { "name": "Green Bay Packers", "price": 1.65 }
                        ]},
                        { "key": "spreads", "outcomes": [
                            { "name": "Chicago Bears", "price": 1.91, "point": 3.5 },
                            { "name": "Green Bay Packers", "price": 1.91, "point": -3.5 }
                        ]},
                        { "key": "player_props", "outcomes": [
                            { "name": "Over", "price": 1.9, "point": 250.5 }
                        ]}
                    ]
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn unknown_markets_are_dropped() {
        let snapshots = snapshots_from_event(&event(Utc::now()), Utc::now());
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().all(|s| s.market != MarketType::Totals));
        assert!(snapshots[0].last_update.is_some());
    }

    #[test]
    fn kickoff_moves_flag_schedule_change() {
        let now = Utc::now();
        let kickoff = Utc.with_ymd_and_hms(2025, 10, 5, 17, 0, 0).unwrap();
        let first = game_from_event(&event(kickoff), None, now);
        assert!(!first.schedule_change);
        assert_eq!(first.week, 5);
        assert_eq!(first.venue.as_deref(), Some("Soldier Field"));

        let nudged = game_from_event(&event(kickoff + Duration::minutes(3)), Some(&first), now);
        assert!(!nudged.schedule_change);

        let moved = game_from_event(&event(kickoff + Duration::hours(3)), Some(&first), now);
        assert!(moved.schedule_change);
        assert_eq!(moved.kickoff_time, kickoff + Duration::hours(3));
        assert_eq!(moved.created_at, first.created_at);
    }

    #[test]
    fn final_score_requires_completion() {
        let mut score: ScoreEvent = serde_json::from_value(serde_json::json!({
            "id": "evt1",
            "commence_time": "2025-10-05T17:00:00Z",
            "completed": true,
            "home_team": "Chicago Bears",
            "away_team": "Green Bay Packers",
            "scores": [
                { "name": "Green Bay Packers", "score": "20" },
                { "name": "Chicago Bears", "score": "24" }
            ]
        }))
        .unwrap();
        assert_eq!(final_score(&score), Some((24, 20)));
        score.completed = false;
        assert_eq!(final_score(&score), None);
    }

    #[tokio::test]
    async fn budget_is_persisted_and_enforced() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2025, 10, 15, 12, 0, 0).unwrap();
        assert!(try_consume(&store, 2, now).await.unwrap());
        assert!(try_consume(&store, 2, now).await.unwrap());
        assert!(!try_consume(&store, 2, now).await.unwrap());

        let stored = store.read_budget(BUDGET_KEY).await.unwrap().unwrap();
        assert_eq!(stored.used, 2);

        // New month, fresh budget.
        let next_month = Utc.with_ymd_and_hms(2025, 11, 1, 0, 5, 0).unwrap();
        assert!(try_consume(&store, 2, next_month).await.unwrap());
        assert_eq!(store.read_budget(BUDGET_KEY).await.unwrap().unwrap().used, 1);
    }

    #[tokio::test]
    async fn missing_key_fails_the_stage() {
        let runtime = crate::config::RuntimeConfig::default();
        let fetcher = OddsFetcher::new(HttpClient::new(&runtime).unwrap(), SourceConfig::default());
        let store = MemoryStore::new();
        assert!(fetcher.ingest(&store, Utc::now()).await.is_err());
        assert!(store.read_budget(BUDGET_KEY).await.unwrap().is_none());
    }

    #[test]
    fn kickoff_starts_the_game_and_completion_is_terminal() {
        let kickoff = Utc.with_ymd_and_hms(2025, 10, 5, 17, 0, 0).unwrap();
        let before = kickoff - Duration::hours(2);
        let during = kickoff + Duration::hours(1);

        let fresh = game_from_event(&event(kickoff), None, before);
        assert_eq!(fresh.status, GameStatus::Scheduled);

        let live = game_from_event(&event(kickoff), Some(&fresh), during);
        assert_eq!(live.status, GameStatus::InProgress);

        // Postponed after kickoff was reached.
        let postponed = game_from_event(&event(kickoff + Duration::days(1)), Some(&live), during);
        assert_eq!(postponed.status, GameStatus::Scheduled);

        assert_eq!(status_at(Some(GameStatus::Completed), kickoff, before), GameStatus::Completed);
    }

    #[tokio::test]
    async fn live_scores_mark_the_game_in_progress() {
        let store = MemoryStore::new();
        let kickoff = Utc.with_ymd_and_hms(2025, 10, 5, 17, 0, 0).unwrap();
        store
            .upsert_game(&game_from_event(&event(kickoff), None, kickoff - Duration::hours(2)))
            .await
            .unwrap();

        let runtime = crate::config::RuntimeConfig::default();
        let fetcher = OddsFetcher::new(HttpClient::new(&runtime).unwrap(), SourceConfig::default());
        let live: ScoreEvent = serde_json::from_value(serde_json::json!({
            "id": "evt1",
            "commence_time": kickoff.to_rfc3339(),
            "completed": false,
            "home_team": "Chicago Bears",
            "away_team": "Green Bay Packers",
            "scores": [
                { "name": "Green Bay Packers", "score": "7" },
                { "name": "Chicago Bears", "score": "3" }
            ]
        }))
        .unwrap();

        let now = kickoff + Duration::minutes(40);
        assert!(!fetcher.apply_score(&store, &live, now).await.unwrap());
        let game = store.get_game("evt1").await.unwrap().unwrap();
        assert_eq!(game.status, GameStatus::InProgress);
        assert_eq!(game.final_scores(), None);
    }
}
