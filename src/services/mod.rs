pub mod consensus;
pub mod evaluator;
pub mod feature_builder;
pub mod http;
pub mod injury_fetcher;
pub mod odds_fetcher;
pub mod orchestrator;
pub mod predictor;
pub mod signals;
pub mod weather_fetcher;

pub use evaluator::Evaluator;
pub use feature_builder::FeatureBuilder;
pub use http::HttpClient;
pub use injury_fetcher::InjuryFetcher;
pub use odds_fetcher::OddsFetcher;
pub use orchestrator::{Orchestrator, PipelineStage};
pub use predictor::PredictionEngine;
pub use weather_fetcher::WeatherFetcher;

use std::fmt;

/// What a stage did: units processed plus the per-unit failures it stepped over.
#[derive(Debug, Default, Clone)]
pub struct StageOutcome {
    pub processed: usize,
    pub failures: Vec<UnitFailure>,
}

#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub unit: String,
    pub error: String,
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.unit, self.error)
    }
}

impl StageOutcome {
    pub fn processed(processed: usize) -> Self {
        Self { processed, failures: Vec::new() }
    }

    pub fn record_success(&mut self) {
        self.processed += 1;
    }

    pub fn record_failure(&mut self, unit: impl Into<String>, error: impl fmt::Display) {
        let failure = UnitFailure { unit: unit.into(), error: error.to_string() };
        tracing::warn!("Skipping {}", failure);
        self.failures.push(failure);
    }
}
