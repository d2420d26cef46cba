//! Scores stored predictions against final results and summarises calibration.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::config::EvaluatorConfig;
use crate::db::Store;
use crate::models::{CalibrationReport, Evaluation, Game, Prediction, PredictionMarket, ReliabilityBin};
use crate::services::StageOutcome;
use crate::utils::mean;

const LOG_LOSS_EPSILON: f64 = 1e-15;

pub fn brier_score(p: f64, y: f64) -> f64 {
    (p - y).powi(2)
}

pub fn log_loss(p: f64, y: f64) -> f64 {
    let p = p.clamp(LOG_LOSS_EPSILON, 1.0 - LOG_LOSS_EPSILON);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

/// Fixed-width bins over [0, 1]. The last bin is closed so p = 1.0 lands in it.
pub fn reliability_curve(pairs: &[(f64, f64)], bin_width: f64) -> Vec<ReliabilityBin> {
    let n = (1.0 / bin_width).round().max(1.0) as usize;
    let mut sums = vec![(0usize, 0.0f64, 0.0f64); n];
    for &(p, y) in pairs {
        if !p.is_finite() {
            continue;
        }
        let idx = ((p.clamp(0.0, 1.0) / bin_width + 1e-9).floor() as usize).min(n - 1);
        let (count, sum_p, sum_y) = &mut sums[idx];
        *count += 1;
        *sum_p += p;
        *sum_y += y;
    }

    sums.into_iter()
        .enumerate()
        .map(|(i, (count, sum_p, sum_y))| ReliabilityBin {
            lower: i as f64 * bin_width,
            upper: if i + 1 == n { 1.0 } else { (i + 1) as f64 * bin_width },
            count,
            mean_predicted: (count > 0).then(|| sum_p / count as f64),
            empirical_rate: (count > 0).then(|| sum_y / count as f64),
        })
        .collect()
}

/// Count-weighted mean gap between predicted and observed rates.
pub fn expected_calibration_error(curve: &[ReliabilityBin]) -> Option<f64> {
    let total: usize = curve.iter().map(|b| b.count).sum();
    if total == 0 {
        return None;
    }
    let weighted: f64 = curve
        .iter()
        .filter_map(|b| match (b.mean_predicted, b.empirical_rate) {
            (Some(p), Some(r)) => Some(b.count as f64 * (r - p).abs()),
            _ => None,
        })
        .sum();
    Some(weighted / total as f64)
}

/// Pure scoring of one game's predictions; `None` when it has no moneyline.
pub fn score_game(game: &Game, predictions: &[Prediction], now: DateTime<Utc>) -> Option<Vec<Evaluation>> {
    let (home, away) = game.final_scores()?;
    let moneyline = predictions
        .iter()
        .find(|p| p.market_type == PredictionMarket::Moneyline)?;

    let y = if home > away { 1.0 } else { 0.0 };
    let margin = (home - away) as f64;
    let total = (home + away) as f64;

    let evaluation = |prediction: &Prediction, actual: f64, probabilistic: bool| {
        let error = prediction.predicted_value - actual;
        Evaluation {
            id: Uuid::new_v4().to_string(),
            prediction_id: prediction.id.clone(),
            game_id: game.id.clone(),
            market_type: prediction.market_type,
            predicted_value: prediction.predicted_value,
            actual_value: actual,
            absolute_error: error.abs(),
            squared_error: error * error,
            brier_score: probabilistic.then(|| brier_score(prediction.predicted_value, actual)),
            log_loss: probabilistic.then(|| log_loss(prediction.predicted_value, actual)),
            evaluated_at: now,
        }
    };

    let mut evaluations = vec![evaluation(moneyline, y, true)];
    for prediction in predictions {
        match prediction.market_type {
            PredictionMarket::Spread => evaluations.push(evaluation(prediction, margin, false)),
            PredictionMarket::Total => evaluations.push(evaluation(prediction, total, false)),
            PredictionMarket::Moneyline => {}
        }
    }
    Some(evaluations)
}

/// Aggregate metrics over a set of evaluations.
pub fn summarize(
    evaluations: &[Evaluation],
    evaluations_written: usize,
    bin_width: f64,
    now: DateTime<Utc>,
) -> CalibrationReport {
    let of_market = |market: PredictionMarket| evaluations.iter().filter(move |e| e.market_type == market);

    let briers: Vec<f64> = of_market(PredictionMarket::Moneyline).filter_map(|e| e.brier_score).collect();
    let losses: Vec<f64> = of_market(PredictionMarket::Moneyline).filter_map(|e| e.log_loss).collect();
    let spread_errors: Vec<f64> = of_market(PredictionMarket::Spread).map(|e| e.absolute_error).collect();
    let total_errors: Vec<f64> = of_market(PredictionMarket::Total).map(|e| e.absolute_error).collect();
    let pairs: Vec<(f64, f64)> = of_market(PredictionMarket::Moneyline)
        .map(|e| (e.predicted_value, e.actual_value))
        .collect();

    let reliability_curve = reliability_curve(&pairs, bin_width);
    CalibrationReport {
        games_evaluated: pairs.len(),
        evaluations_written,
        mean_brier_score: mean(&briers),
        mean_log_loss: mean(&losses),
        mean_spread_error: mean(&spread_errors),
        mean_total_error: mean(&total_errors),
        expected_calibration_error: expected_calibration_error(&reliability_curve),
        reliability_curve,
        generated_at: now,
    }
}

/// Re-running the evaluator appends new rows; keep the newest per prediction.
/// Expects `evaluations` newest first, as the store returns them.
pub fn latest_per_prediction(evaluations: Vec<Evaluation>) -> Vec<Evaluation> {
    let mut seen = HashSet::new();
    evaluations
        .into_iter()
        .filter(|e| seen.insert(e.prediction_id.clone()))
        .collect()
}

pub struct Evaluator {
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    /// Score recent completed games, persist one evaluation per prediction and
    /// report aggregates over everything that was scored.
    pub async fn evaluate(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<(StageOutcome, CalibrationReport)> {
        let games = store.list_completed_games_with_scores(self.config.game_limit).await?;
        let mut outcome = StageOutcome::default();
        let mut scored = Vec::new();
        let mut written = 0usize;

        for game in &games {
            let predictions = match store.read_predictions_for_game(&game.id).await {
                Ok(p) => p,
                Err(e) => {
                    outcome.record_failure(&game.id, e);
                    continue;
                }
            };
            let Some(evaluations) = score_game(game, &predictions, now) else {
                tracing::debug!("No moneyline prediction for completed game {}, skipping", game.id);
                continue;
            };

            let mut game_ok = true;
            for evaluation in &evaluations {
                match store.write_evaluation(evaluation).await {
                    Ok(()) => written += 1,
                    Err(e) => {
                        outcome.record_failure(format!("{}/{}", game.id, evaluation.market_type.as_str()), e);
                        game_ok = false;
                    }
                }
            }
            if game_ok {
                outcome.record_success();
            }
            scored.extend(evaluations);
        }

        let report = summarize(&scored, written, self.config.bin_width, now);
        tracing::info!(
            "Evaluated {} games ({} rows): brier {}, log loss {}",
            report.games_evaluated,
            written,
            report.mean_brier_score.map_or("n/a".to_string(), |b| format!("{:.4}", b)),
            report.mean_log_loss.map_or("n/a".to_string(), |l| format!("{:.4}", l)),
        );
        Ok((outcome, report))
    }

    /// Rebuild the report from already-stored evaluations without re-scoring.
    pub async fn report_from_store(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<CalibrationReport> {
        // Each game contributes up to three rows per run.
        let recent = store.list_recent_evaluations(self.config.game_limit * 3).await?;
        let evaluations = latest_per_prediction(recent);
        let count = evaluations.len();
        Ok(summarize(&evaluations, count, self.config.bin_width, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{GameStatus, UncertaintyBand};
    use chrono::Duration;

    fn completed(id: &str, home: i32, away: i32, days_ago: i64) -> Game {
        let kickoff = Utc::now() - Duration::days(days_ago);
        Game {
            id: id.to_string(),
            season: 2025,
            week: 6,
            home_team: "Baltimore Ravens".to_string(),
            away_team: "Cincinnati Bengals".to_string(),
            kickoff_time: kickoff,
            venue: None,
            status: GameStatus::Completed,
            home_score: Some(home),
            away_score: Some(away),
            schedule_change: false,
            created_at: kickoff,
            updated_at: kickoff,
        }
    }

    fn prediction(game_id: &str, market: PredictionMarket, value: f64) -> Prediction {
        Prediction {
            id: format!("{}-{}", game_id, market.as_str()),
            game_id: game_id.to_string(),
            market_type: market,
            predicted_value: value,
            confidence: 0.5,
            uncertainty_band: UncertaintyBand { lower: value, upper: value },
            model_version: "test".to_string(),
            provenance_hash: "h".to_string(),
            model_probability: None,
            implied_probability: None,
            edge_vs_implied: None,
            predicted_at: Utc::now(),
        }
    }

    #[test]
    fn brier_and_log_loss_reference_values() {
        assert!((brier_score(0.7, 1.0) - 0.09).abs() < 1e-9);
        assert!((log_loss(0.5, 0.0) - std::f64::consts::LN_2).abs() < 1e-9);
        assert!(log_loss(1.0, 0.0).is_finite());
        assert!(log_loss(0.0, 1.0).is_finite());
    }

    #[test]
    fn reliability_bucket_reports_empirical_rate() {
        let pairs: Vec<(f64, f64)> = (0..100).map(|i| (0.8, if i < 80 { 1.0 } else { 0.0 })).collect();
        let curve = reliability_curve(&pairs, 0.1);
        assert_eq!(curve.len(), 10);

        let bucket = &curve[8];
        assert_eq!(bucket.count, 100);
        assert!((bucket.empirical_rate.unwrap() - 0.8).abs() < 1e-12);
        assert!(curve.iter().enumerate().all(|(i, b)| i == 8 || b.empirical_rate.is_none()));
        assert!(expected_calibration_error(&curve).unwrap() < 1e-9);
    }

    #[test]
    fn edges_land_in_the_right_bucket() {
        let curve = reliability_curve(&[(0.0, 0.0), (0.3, 1.0), (1.0, 1.0)], 0.1);
        assert_eq!(curve[0].count, 1);
        assert_eq!(curve[3].count, 1);
        assert_eq!(curve[9].count, 1);
    }

    #[test]
    fn tie_counts_as_home_loss() {
        let game = completed("tie", 17, 17, 1);
        let rows = score_game(&game, &[prediction("tie", PredictionMarket::Moneyline, 0.6)], Utc::now()).unwrap();
        assert_eq!(rows[0].actual_value, 0.0);
    }

    #[tokio::test]
    async fn scores_a_completed_game() {
        let store = MemoryStore::new();
        store.upsert_game(&completed("g1", 24, 20, 2)).await.unwrap();
        store
            .upsert_predictions(
                "g1",
                &[
                    prediction("g1", PredictionMarket::Moneyline, 0.65),
                    prediction("g1", PredictionMarket::Spread, 4.2),
                    prediction("g1", PredictionMarket::Total, 47.5),
                ],
            )
            .await
            .unwrap();

        let evaluator = Evaluator::new(EvaluatorConfig::default());
        let (outcome, report) = evaluator.evaluate(&store, Utc::now()).await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(report.evaluations_written, 3);

        let stored = store.list_recent_evaluations(10).await.unwrap();
        let ml = stored.iter().find(|e| e.market_type == PredictionMarket::Moneyline).unwrap();
        assert_eq!(ml.actual_value, 1.0);
        assert!((ml.brier_score.unwrap() - 0.1225).abs() < 1e-9);

        let spread = stored.iter().find(|e| e.market_type == PredictionMarket::Spread).unwrap();
        assert_eq!(spread.actual_value, 4.0);
        assert!((spread.absolute_error - 0.2).abs() < 1e-9);
        assert!(spread.brier_score.is_none());

        let total = stored.iter().find(|e| e.market_type == PredictionMarket::Total).unwrap();
        assert!((total.absolute_error - 3.5).abs() < 1e-9);

        assert!((report.mean_spread_error.unwrap() - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn game_without_prediction_is_skipped() {
        let store = MemoryStore::new();
        store.upsert_game(&completed("bare", 10, 3, 1)).await.unwrap();
        let evaluator = Evaluator::new(EvaluatorConfig::default());
        let (outcome, report) = evaluator.evaluate(&store, Utc::now()).await.unwrap();
        assert_eq!(outcome.processed, 0);
        assert!(outcome.failures.is_empty());
        assert_eq!(report.games_evaluated, 0);
        assert_eq!(report.mean_brier_score, None);
    }

    #[tokio::test]
    async fn write_failures_still_count_in_aggregates() {
        let store = MemoryStore::new();
        for (id, home, away) in [("a", 21, 14), ("b", 10, 13)] {
            store.upsert_game(&completed(id, home, away, 1)).await.unwrap();
            store
                .upsert_predictions(id, &[prediction(id, PredictionMarket::Moneyline, 0.7)])
                .await
                .unwrap();
        }
        store.fail_writes_for("b").await;

        let evaluator = Evaluator::new(EvaluatorConfig::default());
        let (outcome, report) = evaluator.evaluate(&store, Utc::now()).await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(report.evaluations_written, 1);
        assert_eq!(report.games_evaluated, 2);
        // (0.09 + 0.49) / 2
        assert!((report.mean_brier_score.unwrap() - 0.29).abs() < 1e-9);

        let rebuilt = evaluator.report_from_store(&store, Utc::now()).await.unwrap();
        assert_eq!(rebuilt.games_evaluated, 1);
    }

    #[tokio::test]
    async fn report_counts_each_prediction_once_across_reruns() {
        let store = MemoryStore::new();
        let now = Utc::now();
        crate::db::seed_data(&store, now).await.unwrap();

        let evaluator = Evaluator::new(EvaluatorConfig::default());
        let (_, first) = evaluator.evaluate(&store, now).await.unwrap();
        evaluator.evaluate(&store, now + Duration::minutes(5)).await.unwrap();

        let report = evaluator.report_from_store(&store, now + Duration::minutes(10)).await.unwrap();
        assert_eq!(first.games_evaluated, 24);
        assert_eq!(report.games_evaluated, first.games_evaluated);
        let binned: usize = report.reliability_curve.iter().map(|b| b.count).sum();
        assert_eq!(binned, 24);
        assert!((report.mean_brier_score.unwrap() - first.mean_brier_score.unwrap()).abs() < 1e-12);
    }
}
