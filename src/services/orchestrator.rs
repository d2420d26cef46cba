use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::Store;
use crate::models::{PipelineReport, Stage, StageResult, StageRun};
use crate::services::{
    Evaluator, FeatureBuilder, HttpClient, InjuryFetcher, OddsFetcher, PredictionEngine, StageOutcome, WeatherFetcher,
};

/// One independently runnable unit of the pipeline.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn stage(&self) -> Stage;
    async fn run(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<StageOutcome>;
}

#[async_trait]
impl PipelineStage for OddsFetcher {
    fn stage(&self) -> Stage {
        Stage::Odds
    }
    async fn run(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<StageOutcome> {
        self.ingest(store, now).await
    }
}

#[async_trait]
impl PipelineStage for InjuryFetcher {
    fn stage(&self) -> Stage {
        Stage::Injuries
    }
    async fn run(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<StageOutcome> {
        self.ingest(store, now).await
    }
}

#[async_trait]
impl PipelineStage for WeatherFetcher {
    fn stage(&self) -> Stage {
        Stage::Weather
    }
    async fn run(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<StageOutcome> {
        self.ingest(store, now).await
    }
}

#[async_trait]
impl PipelineStage for FeatureBuilder {
    fn stage(&self) -> Stage {
        Stage::Features
    }
    async fn run(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<StageOutcome> {
        self.build_all(store, now).await
    }
}

#[async_trait]
impl PipelineStage for PredictionEngine {
    fn stage(&self) -> Stage {
        Stage::Predictions
    }
    async fn run(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<StageOutcome> {
        self.generate_predictions(store, now).await
    }
}

#[async_trait]
impl PipelineStage for Evaluator {
    fn stage(&self) -> Stage {
        Stage::Calibration
    }
    async fn run(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<StageOutcome> {
        let (outcome, _report) = self.evaluate(store, now).await?;
        Ok(outcome)
    }
}

/// Runs stages as ordered phases. A stage that errors or times out is
/// recorded as failed and the next stage still runs.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    stages: Vec<Box<dyn PipelineStage>>,
    stage_timeout: Duration,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, stages: Vec<Box<dyn PipelineStage>>, stage_timeout: Duration) -> Self {
        Self { store, stages, stage_timeout }
    }

    /// The full pipeline: ingestion, features, predictions, calibration.
    pub fn from_config(store: Arc<dyn Store>, config: &AppConfig) -> Result<Self> {
        let http = HttpClient::new(&config.runtime)?;
        let stages: Vec<Box<dyn PipelineStage>> = vec![
            Box::new(OddsFetcher::new(http.clone(), config.sources.clone())),
            Box::new(InjuryFetcher::new(http.clone(), config.sources.clone())),
            Box::new(WeatherFetcher::new(http, config.sources.clone())),
            Box::new(FeatureBuilder::new(config.features.clone())),
            Box::new(PredictionEngine::new(config.model.clone())),
            Box::new(Evaluator::new(config.evaluator.clone())),
        ];
        Ok(Self::new(store, stages, config.runtime.stage_timeout))
    }

    /// Keep only the listed stages, in pipeline order.
    pub fn only(mut self, keep: &[Stage]) -> Self {
        self.stages.retain(|s| keep.contains(&s.stage()));
        self
    }

    async fn run_stage(&self, stage: &dyn PipelineStage, run_id: &str, now: DateTime<Utc>) -> StageResult {
        let name = stage.stage();
        let started_at = Utc::now();
        let clock = Instant::now();
        tracing::info!("Stage {} starting", name);

        let (success, processed, error, failures) =
            match tokio::time::timeout(self.stage_timeout, stage.run(self.store.as_ref(), now)).await {
                Ok(Ok(outcome)) => (
                    true,
                    outcome.processed,
                    None,
                    outcome.failures.iter().map(|f| f.to_string()).collect(),
                ),
                Ok(Err(e)) => (false, 0, Some(format!("{:#}", e)), Vec::new()),
                Err(_) => (
                    false,
                    0,
                    Some(format!("timed out after {}s", self.stage_timeout.as_secs_f64())),
                    Vec::new(),
                ),
            };

        let result = StageResult {
            success,
            processed,
            error,
            failures,
            duration_ms: clock.elapsed().as_millis() as u64,
        };

        match &result.error {
            None => tracing::info!(
                "Stage {} finished: {} processed, {} skipped ({}ms)",
                name,
                result.processed,
                result.failures.len(),
                result.duration_ms
            ),
            Some(e) => tracing::error!("Stage {} failed: {}", name, e),
        }

        let audit = StageRun {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            stage: name,
            result: result.clone(),
            started_at,
        };
        if let Err(e) = self.store.record_stage_run(&audit).await {
            tracing::warn!("Could not record audit row for stage {}: {}", name, e);
        }

        result
    }

    pub async fn run(&self, now: DateTime<Utc>) -> PipelineReport {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        tracing::info!("Pipeline run {} with {} stages", run_id, self.stages.len());

        let mut results = BTreeMap::new();
        for stage in &self.stages {
            let result = self.run_stage(stage.as_ref(), &run_id, now).await;
            results.insert(stage.stage(), result);
        }

        let success = results.values().any(|r| r.success);
        let partial = results.values().any(|r| !r.success);
        tracing::info!("Pipeline run {} complete (success: {}, partial: {})", run_id, success, partial);

        PipelineReport {
            run_id,
            success,
            partial,
            results,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use anyhow::anyhow;

    struct Fixed {
        stage: Stage,
        result: std::result::Result<usize, &'static str>,
    }

    #[async_trait]
    impl PipelineStage for Fixed {
        fn stage(&self) -> Stage {
            self.stage
        }
        async fn run(&self, _store: &dyn Store, _now: DateTime<Utc>) -> Result<StageOutcome> {
            match self.result {
                Ok(n) => Ok(StageOutcome::processed(n)),
                Err(msg) => Err(anyhow!(msg)),
            }
        }
    }

    struct Hangs;

    #[async_trait]
    impl PipelineStage for Hangs {
        fn stage(&self) -> Stage {
            Stage::Weather
        }
        async fn run(&self, _store: &dyn Store, _now: DateTime<Utc>) -> Result<StageOutcome> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(StageOutcome::default())
        }
    }

    fn fixed(stage: Stage, result: std::result::Result<usize, &'static str>) -> Box<dyn PipelineStage> {
        Box::new(Fixed { stage, result })
    }

    #[tokio::test]
    async fn failed_stage_marks_run_partial() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(
            store.clone(),
            vec![
                fixed(Stage::Odds, Err("odds provider unreachable")),
                fixed(Stage::Injuries, Ok(12)),
            ],
            Duration::from_secs(5),
        );

        let report = orchestrator.run(Utc::now()).await;
        assert!(report.success);
        assert!(report.partial);
        assert!(!report.results[&Stage::Odds].success);
        assert_eq!(report.results[&Stage::Odds].error.as_deref(), Some("odds provider unreachable"));
        assert!(report.results[&Stage::Injuries].success);
        assert_eq!(report.results[&Stage::Injuries].processed, 12);

        let audit = store.stage_runs().await;
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().all(|r| r.run_id == report.run_id));
    }

    #[tokio::test]
    async fn all_failed_is_not_success() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(
            store,
            vec![fixed(Stage::Features, Err("boom")), fixed(Stage::Predictions, Err("boom"))],
            Duration::from_secs(5),
        );
        let report = orchestrator.run(Utc::now()).await;
        assert!(!report.success);
        assert!(report.partial);
    }

    #[tokio::test]
    async fn slow_stage_times_out_and_pipeline_continues() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(
            store,
            vec![Box::new(Hangs), fixed(Stage::Features, Ok(1))],
            Duration::from_millis(50),
        );
        let report = orchestrator.run(Utc::now()).await;
        let weather = &report.results[&Stage::Weather];
        assert!(!weather.success);
        assert!(weather.error.as_deref().unwrap_or_default().contains("timed out"));
        assert!(report.results[&Stage::Features].success);
    }

    #[tokio::test]
    async fn offline_pipeline_predicts_from_stored_data() {
        let store = Arc::new(MemoryStore::new());
        crate::db::seed_data(store.as_ref(), Utc::now()).await.unwrap();

        let config = AppConfig::default();
        let orchestrator = Orchestrator::from_config(store.clone(), &config)
            .unwrap()
            .only(&[Stage::Features, Stage::Predictions, Stage::Calibration]);
        let report = orchestrator.run(Utc::now()).await;

        assert!(!report.partial, "{:?}", report.results);
        assert_eq!(report.results.len(), 3);
        assert!(report.results[&Stage::Predictions].processed > 0);
        assert!(report.results[&Stage::Calibration].processed > 0);
    }
}
