use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::ModelConfig;
use crate::db::Store;
use crate::models::{Features, Prediction, PredictionMarket, UncertaintyBand};
use crate::services::StageOutcome;
use crate::utils::content_hash;

pub struct PredictionEngine {
    config: ModelConfig,
}

impl PredictionEngine {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    /// Rule-based home-win estimate before blending with the market.
    pub fn heuristic_probability(&self, f: &Features) -> f64 {
        let c = &self.config;
        c.home_advantage - f.consensus_spread / c.spread_scale
            + (f.injury_impact_away - f.injury_impact_home) * c.injury_weight
            - f.weather_severity * c.weather_weight
    }

    /// Blended home-win probability. The market's share shrinks with coverage
    /// quality, so an unquoted game is priced by the heuristic alone.
    pub fn home_win_probability(&self, f: &Features) -> f64 {
        let c = &self.config;
        let heuristic = self.heuristic_probability(f);
        let market_w = c.market_weight * f.coverage_quality.clamp(0.0, 1.0);
        let total_w = c.heuristic_weight + market_w;
        let blended = if total_w > 0.0 {
            (heuristic * c.heuristic_weight + f.implied_prob_home * market_w) / total_w
        } else {
            heuristic
        };
        blended.clamp(c.min_probability, c.max_probability)
    }

    pub fn confidence(&self, f: &Features) -> f64 {
        let c = &self.config;
        let mut confidence = f.coverage_quality;
        if f.odds_volatility > c.volatility_threshold {
            confidence *= c.volatility_discount;
        }
        confidence.clamp(c.min_confidence, 1.0)
    }

    /// Hex SHA-256 of the serialized features and the model version.
    pub fn provenance_hash(&self, f: &Features) -> Result<String, serde_json::Error> {
        content_hash(f, &self.config.version)
    }

    /// Moneyline, spread and total predictions for one game.
    pub fn predict_game(
        &self,
        game_id: &str,
        features: &Features,
        now: DateTime<Utc>,
    ) -> Result<Vec<Prediction>, serde_json::Error> {
        let c = &self.config;
        let p = self.home_win_probability(features);
        let confidence = self.confidence(features);
        let hash = self.provenance_hash(features)?;
        let implied = features.implied_prob_home;
        let edge = (p - implied) * 100.0;

        let row = |market: PredictionMarket, value: f64, band: UncertaintyBand, with_edge: bool| Prediction {
            id: Uuid::new_v4().to_string(),
            game_id: game_id.to_string(),
            market_type: market,
            predicted_value: value,
            confidence,
            uncertainty_band: band,
            model_version: c.version.clone(),
            provenance_hash: hash.clone(),
            model_probability: with_edge.then_some(p),
            implied_probability: with_edge.then_some(implied),
            edge_vs_implied: with_edge.then_some(edge),
            predicted_at: now,
        };

        let ml_half_width = 0.1 * (1.0 - confidence);
        let moneyline_band = UncertaintyBand {
            lower: (p - ml_half_width).clamp(0.0, 1.0),
            upper: (p + ml_half_width).clamp(0.0, 1.0),
        };

        let margin = (p - 0.5) * c.spread_scale;
        let spread_band = UncertaintyBand {
            lower: margin - c.spread_band,
            upper: margin + c.spread_band,
        };

        let total = features.consensus_total - c.weather_total_penalty * features.weather_severity;
        let total_band = UncertaintyBand {
            lower: total - c.total_band,
            upper: total + c.total_band,
        };

        Ok(vec![
            row(PredictionMarket::Moneyline, p, moneyline_band, true),
            row(PredictionMarket::Spread, margin, spread_band, true),
            row(PredictionMarket::Total, total, total_band, false),
        ])
    }

    /// Predict every upcoming game that has a feature set.
    pub async fn generate_predictions(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<StageOutcome> {
        let games = store.list_upcoming_games(now).await?;
        let mut outcome = StageOutcome::default();

        for game in &games {
            let feature_set = match store.read_latest_feature_set(&game.id).await {
                Ok(Some(fs)) => fs,
                Ok(None) => {
                    tracing::debug!("No features yet for {}, skipping", game.id);
                    continue;
                }
                Err(e) => {
                    outcome.record_failure(&game.id, e);
                    continue;
                }
            };

            let predictions = match self.predict_game(&game.id, &feature_set.features, now) {
                Ok(p) => p,
                Err(e) => {
                    outcome.record_failure(&game.id, e);
                    continue;
                }
            };

            match store.upsert_predictions(&game.id, &predictions).await {
                Ok(()) => {
                    tracing::info!(
                        "Generated prediction for {} @ {}: home {:.1}%, margin {:+.1}, total {:.1}",
                        game.away_team,
                        game.home_team,
                        predictions[0].predicted_value * 100.0,
                        predictions[1].predicted_value,
                        predictions[2].predicted_value
                    );
                    outcome.record_success();
                }
                Err(e) => outcome.record_failure(&game.id, e),
            }
        }

        Ok(outcome)
    }
}
