use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use super::Store;
use crate::error::StoreError;
use crate::models::*;

#[derive(Default)]
struct Tables {
    games: HashMap<String, Game>,
    odds: Vec<OddsSnapshot>,
    signals: Vec<Signal>,
    features: Vec<FeatureSet>,
    predictions: Vec<Prediction>,
    evaluations: Vec<Evaluation>,
    sources: HashMap<SourceType, SourceRegistryEntry>,
    budgets: HashMap<String, UsageBudget>,
    stage_runs: Vec<StageRun>,
    failing_games: HashSet<String>,
}

/// Process-local store with the same semantics as [`super::SqliteStore`].
/// Backs the `demo` command and the service tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every feature, prediction and evaluation write for `game_id` fail.
    pub async fn fail_writes_for(&self, game_id: &str) {
        self.tables.write().await.failing_games.insert(game_id.to_string());
    }

    pub async fn stage_runs(&self) -> Vec<StageRun> {
        self.tables.read().await.stage_runs.clone()
    }
}

fn check_injected(t: &Tables, game_id: &str) -> Result<(), StoreError> {
    if t.failing_games.contains(game_id) {
        return Err(StoreError::Injected(game_id.to_string()));
    }
    Ok(())
}

fn blank_source(source_type: SourceType) -> SourceRegistryEntry {
    SourceRegistryEntry {
        source_type,
        source_name: source_type.default_name().to_string(),
        is_active: true,
        consecutive_failures: 0,
        last_success: None,
        last_failure: None,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_game(&self, game: &Game) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        match t.games.get_mut(&game.id) {
            Some(existing) => {
                let created_at = existing.created_at;
                let venue = game.venue.clone().or_else(|| existing.venue.take());
                let home_score = game.home_score.or(existing.home_score);
                let away_score = game.away_score.or(existing.away_score);
                *existing = Game {
                    created_at,
                    venue,
                    home_score,
                    away_score,
                    ..game.clone()
                };
            }
            None => {
                t.games.insert(game.id.clone(), game.clone());
            }
        }
        Ok(())
    }

    async fn get_game(&self, game_id: &str) -> Result<Option<Game>, StoreError> {
        Ok(self.tables.read().await.games.get(game_id).cloned())
    }

    async fn list_upcoming_games(&self, not_before: DateTime<Utc>) -> Result<Vec<Game>, StoreError> {
        let t = self.tables.read().await;
        let mut games: Vec<Game> = t
            .games
            .values()
            .filter(|g| g.kickoff_time >= not_before)
            .cloned()
            .collect();
        games.sort_by_key(|g| g.kickoff_time);
        Ok(games)
    }

    async fn list_completed_games_with_scores(&self, limit: usize) -> Result<Vec<Game>, StoreError> {
        let t = self.tables.read().await;
        let mut games: Vec<Game> = t
            .games
            .values()
            .filter(|g| g.final_scores().is_some())
            .cloned()
            .collect();
        games.sort_by(|a, b| b.kickoff_time.cmp(&a.kickoff_time));
        games.truncate(limit);
        Ok(games)
    }

    async fn insert_odds_snapshot(&self, snapshot: &OddsSnapshot) -> Result<(), StoreError> {
        self.tables.write().await.odds.push(snapshot.clone());
        Ok(())
    }

    async fn list_odds_snapshots(&self, game_id: &str, limit: usize) -> Result<Vec<OddsSnapshot>, StoreError> {
        let t = self.tables.read().await;
        let mut snapshots: Vec<OddsSnapshot> =
            t.odds.iter().filter(|s| s.game_id == game_id).cloned().collect();
        snapshots.sort_by(|a, b| b.snapshot_time.cmp(&a.snapshot_time));
        snapshots.truncate(limit);
        Ok(snapshots)
    }

    async fn latest_snapshot_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.tables.read().await.odds.iter().map(|s| s.snapshot_time).max())
    }

    async fn insert_signal(&self, signal: &Signal) -> Result<bool, StoreError> {
        let mut t = self.tables.write().await;
        let duplicate = t
            .signals
            .iter()
            .any(|s| s.game_id == signal.game_id && s.content_hash == signal.content_hash);
        if duplicate {
            return Ok(false);
        }
        t.signals.push(signal.clone());
        Ok(true)
    }

    async fn list_signals(
        &self,
        game_id: &str,
        signal_type: SignalType,
        limit: usize,
    ) -> Result<Vec<Signal>, StoreError> {
        let t = self.tables.read().await;
        let mut signals: Vec<Signal> = t
            .signals
            .iter()
            .filter(|s| s.game_id == game_id && s.payload.signal_type() == signal_type)
            .cloned()
            .collect();
        signals.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        signals.truncate(limit);
        Ok(signals)
    }

    async fn write_feature_set(&self, feature_set: &FeatureSet) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        check_injected(&t, &feature_set.game_id)?;
        if !t.games.contains_key(&feature_set.game_id) {
            return Err(StoreError::MissingGame(feature_set.game_id.clone()));
        }
        t.features.push(feature_set.clone());
        Ok(())
    }

    async fn read_latest_feature_set(&self, game_id: &str) -> Result<Option<FeatureSet>, StoreError> {
        let t = self.tables.read().await;
        Ok(t
            .features
            .iter()
            .filter(|f| f.game_id == game_id)
            .max_by_key(|f| f.computed_at)
            .cloned())
    }

    async fn upsert_predictions(&self, game_id: &str, predictions: &[Prediction]) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        check_injected(&t, game_id)?;
        for p in predictions {
            let existing = t
                .predictions
                .iter_mut()
                .find(|e| e.game_id == game_id && e.market_type == p.market_type);
            match existing {
                Some(e) => {
                    let id = std::mem::take(&mut e.id);
                    *e = Prediction { id, game_id: game_id.to_string(), ..p.clone() };
                }
                None => t.predictions.push(Prediction { game_id: game_id.to_string(), ..p.clone() }),
            }
        }
        Ok(())
    }

    async fn read_predictions_for_game(&self, game_id: &str) -> Result<Vec<Prediction>, StoreError> {
        let t = self.tables.read().await;
        let mut predictions: Vec<Prediction> =
            t.predictions.iter().filter(|p| p.game_id == game_id).cloned().collect();
        predictions.sort_by_key(|p| p.market_type);
        Ok(predictions)
    }

    async fn count_predictions_since(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        let t = self.tables.read().await;
        Ok(t.predictions.iter().filter(|p| p.predicted_at >= since).count() as i64)
    }

    async fn write_evaluation(&self, evaluation: &Evaluation) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        check_injected(&t, &evaluation.game_id)?;
        let scored = t
            .games
            .get(&evaluation.game_id)
            .and_then(|g| g.final_scores())
            .is_some();
        if !scored {
            return Err(StoreError::Unscored(evaluation.game_id.clone()));
        }
        t.evaluations.push(evaluation.clone());
        Ok(())
    }

    async fn list_recent_evaluations(&self, limit: usize) -> Result<Vec<Evaluation>, StoreError> {
        let t = self.tables.read().await;
        let mut evaluations = t.evaluations.clone();
        evaluations.sort_by(|a, b| b.evaluated_at.cmp(&a.evaluated_at));
        evaluations.truncate(limit);
        Ok(evaluations)
    }

    async fn get_source(&self, source_type: SourceType) -> Result<Option<SourceRegistryEntry>, StoreError> {
        Ok(self.tables.read().await.sources.get(&source_type).cloned())
    }

    async fn list_sources(&self) -> Result<Vec<SourceRegistryEntry>, StoreError> {
        let t = self.tables.read().await;
        let mut sources: Vec<SourceRegistryEntry> = t.sources.values().cloned().collect();
        sources.sort_by_key(|s| s.source_type.as_str());
        Ok(sources)
    }

    async fn record_source_success(&self, source_type: SourceType, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        let entry = t.sources.entry(source_type).or_insert_with(|| blank_source(source_type));
        entry.consecutive_failures = 0;
        entry.last_success = Some(at);
        Ok(())
    }

    async fn record_source_failure(&self, source_type: SourceType, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut t = self.tables.write().await;
        let entry = t.sources.entry(source_type).or_insert_with(|| blank_source(source_type));
        entry.consecutive_failures += 1;
        entry.last_failure = Some(at);
        Ok(())
    }

    async fn read_budget(&self, key: &str) -> Result<Option<UsageBudget>, StoreError> {
        Ok(self.tables.read().await.budgets.get(key).cloned())
    }

    async fn write_budget(&self, budget: &UsageBudget) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .budgets
            .insert(budget.key.clone(), budget.clone());
        Ok(())
    }

    async fn record_stage_run(&self, run: &StageRun) -> Result<(), StoreError> {
        self.tables.write().await.stage_runs.push(run.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
