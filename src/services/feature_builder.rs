use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::FeatureConfig;
use crate::db::Store;
use crate::error::StoreError;
use crate::models::{FeatureSet, Features, Game, OddsSnapshot, Signal, SignalType};
use crate::services::consensus;
use crate::services::signals::{injury_impacts, latest_weather_severity};
use crate::services::StageOutcome;
use crate::utils::rest_days;

pub struct FeatureBuilder {
    config: FeatureConfig,
}

impl FeatureBuilder {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    /// Pure feature computation for one game from already-loaded inputs.
    pub fn compute(
        &self,
        game: &Game,
        snapshots: &[OddsSnapshot],
        injuries: &[Signal],
        weather: &[Signal],
    ) -> Features {
        let c = consensus::aggregate(&game.home_team, &game.away_team, snapshots, &self.config);
        let (injury_impact_home, injury_impact_away) = injury_impacts(game, injuries);
        let rest = rest_days(game.kickoff_time);

        Features {
            consensus_ml_home: c.moneyline_home,
            consensus_ml_away: c.moneyline_away,
            consensus_spread: c.spread,
            consensus_total: c.total,
            implied_prob_home: c.implied_home,
            implied_prob_away: c.implied_away,
            injury_impact_home,
            injury_impact_away,
            weather_severity: latest_weather_severity(weather),
            rest_days_home: rest,
            rest_days_away: rest,
            odds_volatility: c.volatility,
            coverage_quality: c.coverage_quality,
            bookmaker_count: c.bookmaker_count,
        }
    }

    /// Load one game's inputs, compute its features and append a FeatureSet.
    pub async fn build_for_game(
        &self,
        store: &dyn Store,
        game: &Game,
        now: DateTime<Utc>,
    ) -> Result<FeatureSet, StoreError> {
        let snapshots = store.list_odds_snapshots(&game.id, self.config.odds_window).await?;
        let injuries = store
            .list_signals(&game.id, SignalType::Injury, self.config.injury_window)
            .await?;
        let weather = store.list_signals(&game.id, SignalType::Weather, 1).await?;

        let feature_set = FeatureSet {
            id: Uuid::new_v4().to_string(),
            game_id: game.id.clone(),
            features: self.compute(game, &snapshots, &injuries, &weather),
            computed_at: now,
        };
        store.write_feature_set(&feature_set).await?;
        Ok(feature_set)
    }

    /// Build features for every game kicking off at or after `now`.
    pub async fn build_all(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<StageOutcome> {
        let games = store.list_upcoming_games(now).await?;
        let mut outcome = StageOutcome::default();

        for game in &games {
            match self.build_for_game(store, game, now).await {
                Ok(fs) => {
                    tracing::debug!(
                        "Features for {} @ {}: implied home {:.3}, spread {:+.1}, coverage {:.2}",
                        game.away_team,
                        game.home_team,
                        fs.features.implied_prob_home,
                        fs.features.consensus_spread,
                        fs.features.coverage_quality
                    );
                    outcome.record_success();
                }
                Err(e) => outcome.record_failure(&game.id, e),
            }
        }

        tracing::info!(
            "Built features for {}/{} upcoming games",
            outcome.processed,
            games.len()
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{GameStatus, MarketType, Outcome, SignalPayload, WeatherReport};
    use chrono::{Duration, TimeZone};

    fn game(id: &str, kickoff: DateTime<Utc>) -> Game {
        Game {
            id: id.to_string(),
            season: 2025,
            week: 12,
            home_team: "Green Bay Packers".to_string(),
            away_team: "Detroit Lions".to_string(),
            kickoff_time: kickoff,
            venue: Some("Lambeau Field".to_string()),
            status: GameStatus::Scheduled,
            home_score: None,
            away_score: None,
            schedule_change: false,
            created_at: kickoff,
            updated_at: kickoff,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 20, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn zero_odds_game_gets_neutral_features() {
        let store = MemoryStore::new();
        // Sunday 18:00 UTC
        let kickoff = Utc.with_ymd_and_hms(2025, 11, 23, 18, 0, 0).unwrap();
        store.upsert_game(&game("g1", kickoff)).await.unwrap();

        let builder = FeatureBuilder::new(FeatureConfig::default());
        let outcome = builder.build_all(&store, now()).await.unwrap();
        assert_eq!(outcome.processed, 1);

        let fs = store.read_latest_feature_set("g1").await.unwrap().unwrap();
        let f = fs.features;
        assert_eq!(f.implied_prob_home, 0.5);
        assert_eq!(f.consensus_spread, 0.0);
        assert_eq!(f.consensus_total, 47.0);
        assert_eq!(f.odds_volatility, 0.0);
        assert_eq!(f.coverage_quality, 0.0);
        assert_eq!(f.rest_days_home, 7);
    }

    #[tokio::test]
    async fn features_reflect_odds_and_weather() {
        let store = MemoryStore::new();
        let kickoff = now() + Duration::days(3);
        store.upsert_game(&game("g1", kickoff)).await.unwrap();
        store
            .insert_odds_snapshot(&OddsSnapshot {
                id: "o1".to_string(),
                game_id: "g1".to_string(),
                bookmaker: "draftkings".to_string(),
                market: MarketType::H2h,
                outcomes: vec![
                    Outcome { name: "Green Bay Packers".to_string(), price: 1.8, point: None },
                    Outcome { name: "Detroit Lions".to_string(), price: 2.1, point: None },
                ],
                last_update: None,
                snapshot_time: now(),
            })
            .await
            .unwrap();
        store
            .insert_signal(&Signal {
                id: "w1".to_string(),
                game_id: "g1".to_string(),
                source: "Open-Meteo".to_string(),
                payload: SignalPayload::Weather(WeatherReport {
                    venue: "Lambeau Field".to_string(),
                    temperature_f: 12.0,
                    wind_mph: 24.0,
                    precipitation_mm: 0.0,
                }),
                confidence: Some(0.95),
                content_hash: "w".to_string(),
                timestamp: now(),
            })
            .await
            .unwrap();

        let builder = FeatureBuilder::new(FeatureConfig::default());
        builder.build_all(&store, now()).await.unwrap();
        let f = store.read_latest_feature_set("g1").await.unwrap().unwrap().features;

        assert!((f.implied_prob_home + f.implied_prob_away - 1.0).abs() < 1e-12);
        assert!(f.implied_prob_home > 0.5);
        assert!((f.weather_severity - 0.6).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&f.coverage_quality));
        assert!((0.0..=1.0).contains(&f.weather_severity));
    }

    #[tokio::test]
    async fn one_failing_game_does_not_stop_the_rest() {
        let store = MemoryStore::new();
        for id in ["a", "b", "c"] {
            store.upsert_game(&game(id, now() + Duration::days(2))).await.unwrap();
        }
        store.fail_writes_for("b").await;

        let builder = FeatureBuilder::new(FeatureConfig::default());
        let outcome = builder.build_all(&store, now()).await.unwrap();

        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].unit, "b");
        assert!(store.read_latest_feature_set("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn past_games_are_not_rebuilt() {
        let store = MemoryStore::new();
        store.upsert_game(&game("old", now() - Duration::days(1))).await.unwrap();
        let builder = FeatureBuilder::new(FeatureConfig::default());
        let outcome = builder.build_all(&store, now()).await.unwrap();
        assert_eq!(outcome.processed, 0);
        assert!(store.read_latest_feature_set("old").await.unwrap().is_none());
    }
}
