use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    InProgress,
    Completed,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Scheduled => "scheduled",
            GameStatus::InProgress => "in_progress",
            GameStatus::Completed => "completed",
        }
    }
}

impl FromStr for GameStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(GameStatus::Scheduled),
            "in_progress" => Ok(GameStatus::InProgress),
            "completed" => Ok(GameStatus::Completed),
            other => Err(format!("unknown game status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub season: i32,
    pub week: i32,
    pub home_team: String,
    pub away_team: String,
    /// Canonical kickoff in UTC.
    pub kickoff_time: DateTime<Utc>,
    pub venue: Option<String>,
    pub status: GameStatus,
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
    /// Set by ingestion when a re-fetch moved the kickoff by more than a few minutes.
    pub schedule_change: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Game {
    /// Both final scores, only once the game is completed.
    pub fn final_scores(&self) -> Option<(i32, i32)> {
        if self.status != GameStatus::Completed {
            return None;
        }
        match (self.home_score, self.away_score) {
            (Some(h), Some(a)) => Some((h, a)),
            _ => None,
        }
    }
}

// ── Odds ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    H2h,
    Spreads,
    Totals,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::H2h => "h2h",
            MarketType::Spreads => "spreads",
            MarketType::Totals => "totals",
        }
    }

    /// Parse a bookmaker market key; anything outside the three tracked markets is `None`.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "h2h" => Some(MarketType::H2h),
            "spreads" => Some(MarketType::Spreads),
            "totals" => Some(MarketType::Totals),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Team name, or "Over" / "Under" for totals.
    pub name: String,
    /// Decimal price.
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub id: String,
    pub game_id: String,
    pub bookmaker: String,
    pub market: MarketType,
    pub outcomes: Vec<Outcome>,
    pub last_update: Option<DateTime<Utc>>,
    pub snapshot_time: DateTime<Utc>,
}

// ── Signals ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Injury,
    Weather,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Injury => "injury",
            SignalType::Weather => "weather",
        }
    }
}

impl FromStr for SignalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "injury" => Ok(SignalType::Injury),
            "weather" => Ok(SignalType::Weather),
            other => Err(format!("unknown signal type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjuryReport {
    pub team: String,
    pub player: String,
    pub position: String,
    pub status: String,
    #[serde(default)]
    pub injury_type: Option<String>,
    /// 0–1, absent when the source gave nothing usable.
    #[serde(default)]
    pub severity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub venue: String,
    pub temperature_f: f64,
    pub wind_mph: f64,
    pub precipitation_mm: f64,
}

/// Structured signal content, tagged by kind so consumers never see a raw blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SignalPayload {
    Injury(InjuryReport),
    Weather(WeatherReport),
}

impl SignalPayload {
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalPayload::Injury(_) => SignalType::Injury,
            SignalPayload::Weather(_) => SignalType::Weather,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub game_id: String,
    pub source: String,
    pub payload: SignalPayload,
    pub confidence: Option<f64>,
    pub content_hash: String,
    pub timestamp: DateTime<Utc>,
}

// ── Features ─────────────────────────────────────────────────────────────────

/// Derived numeric inputs for one game. Field order is part of the provenance
/// hash, so new fields go at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub consensus_ml_home: Option<f64>,
    pub consensus_ml_away: Option<f64>,
    pub consensus_spread: f64,
    pub consensus_total: f64,
    pub implied_prob_home: f64,
    pub implied_prob_away: f64,
    pub injury_impact_home: f64,
    pub injury_impact_away: f64,
    pub weather_severity: f64,
    pub rest_days_home: i32,
    pub rest_days_away: i32,
    pub odds_volatility: f64,
    pub coverage_quality: f64,
    pub bookmaker_count: usize,
}

#[cfg(test)]
impl Features {
    /// A game with no market data, no injuries and calm weather.
    pub fn neutral() -> Self {
        Features {
            consensus_ml_home: None,
            consensus_ml_away: None,
            consensus_spread: 0.0,
            consensus_total: 47.0,
            implied_prob_home: 0.5,
            implied_prob_away: 0.5,
            injury_impact_home: 0.0,
            injury_impact_away: 0.0,
            weather_severity: 0.0,
            rest_days_home: 7,
            rest_days_away: 7,
            odds_volatility: 0.0,
            coverage_quality: 0.0,
            bookmaker_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSet {
    pub id: String,
    pub game_id: String,
    pub features: Features,
    pub computed_at: DateTime<Utc>,
}

// ── Predictions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionMarket {
    Moneyline,
    Spread,
    Total,
}

impl PredictionMarket {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionMarket::Moneyline => "moneyline",
            PredictionMarket::Spread => "spread",
            PredictionMarket::Total => "total",
        }
    }
}

impl FromStr for PredictionMarket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "moneyline" => Ok(PredictionMarket::Moneyline),
            "spread" => Ok(PredictionMarket::Spread),
            "total" => Ok(PredictionMarket::Total),
            other => Err(format!("unknown market type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyBand {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub game_id: String,
    pub market_type: PredictionMarket,
    /// Home win probability (moneyline), home margin (spread) or combined points (total).
    pub predicted_value: f64,
    pub confidence: f64,
    pub uncertainty_band: UncertaintyBand,
    pub model_version: String,
    pub provenance_hash: String,
    pub model_probability: Option<f64>,
    pub implied_probability: Option<f64>,
    /// (model − implied) × 100.
    pub edge_vs_implied: Option<f64>,
    pub predicted_at: DateTime<Utc>,
}

// ── Evaluations ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub prediction_id: String,
    pub game_id: String,
    pub market_type: PredictionMarket,
    pub predicted_value: f64,
    pub actual_value: f64,
    pub absolute_error: f64,
    pub squared_error: f64,
    pub brier_score: Option<f64>,
    pub log_loss: Option<f64>,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    pub mean_predicted: Option<f64>,
    /// Empirical home-win rate; `None` for an empty bin.
    pub empirical_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub games_evaluated: usize,
    pub evaluations_written: usize,
    pub mean_brier_score: Option<f64>,
    pub mean_log_loss: Option<f64>,
    pub mean_spread_error: Option<f64>,
    pub mean_total_error: Option<f64>,
    pub expected_calibration_error: Option<f64>,
    pub reliability_curve: Vec<ReliabilityBin>,
    pub generated_at: DateTime<Utc>,
}

// ── Source registry & budgets ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Odds,
    Injury,
    Weather,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Odds => "odds",
            SourceType::Injury => "injury",
            SourceType::Weather => "weather",
        }
    }

    pub fn default_name(&self) -> &'static str {
        match self {
            SourceType::Odds => "The Odds API",
            SourceType::Injury => "ESPN Injuries",
            SourceType::Weather => "Open-Meteo",
        }
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "odds" => Ok(SourceType::Odds),
            "injury" => Ok(SourceType::Injury),
            "weather" => Ok(SourceType::Weather),
            other => Err(format!("unknown source type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistryEntry {
    pub source_type: SourceType,
    pub source_name: String,
    pub is_active: bool,
    pub consecutive_failures: i32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Cumulative usage against a quota, persisted so it survives process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageBudget {
    pub key: String,
    pub used: i64,
    pub limit: i64,
    pub period_start: DateTime<Utc>,
}

// ── Pipeline results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Odds,
    Injuries,
    Weather,
    Features,
    Predictions,
    Calibration,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Odds => "odds",
            Stage::Injuries => "injuries",
            Stage::Weather => "weather",
            Stage::Features => "features",
            Stage::Predictions => "predictions",
            Stage::Calibration => "calibration",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one stage as reported to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub success: bool,
    pub processed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Units that failed inside an otherwise successful stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
    pub duration_ms: u64,
}

/// Audit row for a single stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRun {
    pub id: String,
    pub run_id: String,
    pub stage: Stage,
    pub result: StageResult,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub success: bool,
    pub partial: bool,
    pub results: BTreeMap<Stage, StageResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ── API views ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct UpcomingGameWithPredictions {
    pub game: Game,
    pub predictions: Vec<Prediction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub database_ok: bool,
    pub hours_since_odds: Option<f64>,
    pub failing_sources: usize,
    pub predictions_24h: i64,
    pub timestamp: DateTime<Utc>,
}

// API Response types
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: Utc::now(),
        }
    }
}
