//! Runtime configuration, read from the process environment (a `.env` file is
//! loaded first by `main`). Every knob has a default so a bare checkout can run
//! the offline stages against the seeded database.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub sources: SourceConfig,
    pub features: FeatureConfig,
    pub model: ModelConfig,
    pub evaluator: EvaluatorConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub odds_api_key: Option<String>,
    pub odds_api_base: String,
    pub odds_region: String,
    /// Requests allowed per calendar month against the odds provider.
    pub odds_monthly_budget: i64,
    pub injuries_url: String,
    pub weather_api_base: String,
    /// Only games kicking off within this many days get a forecast.
    pub weather_horizon_days: i64,
}

#[derive(Debug, Clone)]
pub struct FeatureConfig {
    pub odds_window: usize,
    pub injury_window: usize,
    /// Distinct bookmakers needed for full coverage quality.
    pub full_coverage_quotes: usize,
    pub fallback_total: f64,
}

/// Blend weights and adjustment coefficients for the predictor.
///
/// The home-win estimate is a weighted average of a heuristic score and the
/// market-implied probability. The market weight is multiplied by coverage
/// quality, so a game with no quotes falls back to the heuristic alone.
/// Setting `heuristic_weight = 0.6, market_weight = 0.4` gives the
/// heuristic-led policy; `heuristic_weight = 0.0` gives a pure market read.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub version: String,
    pub heuristic_weight: f64,
    pub market_weight: f64,
    pub home_advantage: f64,
    /// Points of spread per unit of probability (also used to turn probability into margin).
    pub spread_scale: f64,
    pub injury_weight: f64,
    pub weather_weight: f64,
    pub min_probability: f64,
    pub max_probability: f64,
    pub volatility_threshold: f64,
    pub volatility_discount: f64,
    pub min_confidence: f64,
    /// Points removed from the consensus total at full weather severity.
    pub weather_total_penalty: f64,
    pub spread_band: f64,
    pub total_band: f64,
}

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub game_limit: usize,
    pub bin_width: f64,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub stage_timeout: Duration,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            odds_window: 50,
            injury_window: 20,
            full_coverage_quotes: 4,
            fallback_total: 47.0,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            version: "2.1.0".to_string(),
            heuristic_weight: 0.6,
            market_weight: 0.4,
            home_advantage: 0.55,
            spread_scale: 28.0,
            injury_weight: 0.1,
            weather_weight: 0.05,
            min_probability: 0.02,
            max_probability: 0.98,
            volatility_threshold: 1.5,
            volatility_discount: 0.8,
            min_confidence: 0.1,
            weather_total_penalty: 3.0,
            spread_band: 7.0,
            total_band: 6.0,
        }
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            game_limit: 100,
            bin_width: 0.1,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(20),
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            odds_api_key: None,
            odds_api_base: "https://api.the-odds-api.com/v4".to_string(),
            odds_region: "us".to_string(),
            odds_monthly_budget: 500,
            injuries_url: "https://site.api.espn.com/apis/site/v2/sports/football/nfl/injuries"
                .to_string(),
            weather_api_base: "https://api.open-meteo.com/v1".to_string(),
            weather_horizon_days: 7,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:../data/gridiron.db".to_string(),
            sources: SourceConfig::default(),
            features: FeatureConfig::default(),
            model: ModelConfig::default(),
            evaluator: EvaluatorConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = AppConfig::default();

        let config = AppConfig {
            database_url: env::var("DATABASE_URL").unwrap_or(d.database_url),
            sources: SourceConfig {
                odds_api_key: env::var("ODDS_API_KEY").ok().filter(|k| !k.trim().is_empty()),
                odds_api_base: env::var("ODDS_API_BASE").unwrap_or(d.sources.odds_api_base),
                odds_region: env::var("ODDS_REGION").unwrap_or(d.sources.odds_region),
                odds_monthly_budget: parse_or("ODDS_MONTHLY_BUDGET", d.sources.odds_monthly_budget)?,
                injuries_url: env::var("INJURIES_URL").unwrap_or(d.sources.injuries_url),
                weather_api_base: env::var("WEATHER_API_BASE").unwrap_or(d.sources.weather_api_base),
                weather_horizon_days: parse_or("WEATHER_HORIZON_DAYS", d.sources.weather_horizon_days)?,
            },
            features: FeatureConfig {
                odds_window: parse_or("FEATURE_ODDS_WINDOW", d.features.odds_window)?,
                injury_window: parse_or("FEATURE_INJURY_WINDOW", d.features.injury_window)?,
                full_coverage_quotes: parse_or("FEATURE_FULL_COVERAGE_QUOTES", d.features.full_coverage_quotes)?,
                fallback_total: parse_or("FEATURE_FALLBACK_TOTAL", d.features.fallback_total)?,
            },
            model: ModelConfig {
                version: env::var("MODEL_VERSION").unwrap_or(d.model.version),
                heuristic_weight: parse_or("MODEL_HEURISTIC_WEIGHT", d.model.heuristic_weight)?,
                market_weight: parse_or("MODEL_MARKET_WEIGHT", d.model.market_weight)?,
                home_advantage: parse_or("MODEL_HOME_ADVANTAGE", d.model.home_advantage)?,
                spread_scale: parse_or("MODEL_SPREAD_SCALE", d.model.spread_scale)?,
                injury_weight: parse_or("MODEL_INJURY_WEIGHT", d.model.injury_weight)?,
                weather_weight: parse_or("MODEL_WEATHER_WEIGHT", d.model.weather_weight)?,
                volatility_threshold: parse_or("MODEL_VOLATILITY_THRESHOLD", d.model.volatility_threshold)?,
                volatility_discount: parse_or("MODEL_VOLATILITY_DISCOUNT", d.model.volatility_discount)?,
                ..d.model
            },
            evaluator: EvaluatorConfig {
                game_limit: parse_or("EVALUATOR_GAME_LIMIT", d.evaluator.game_limit)?,
                bin_width: parse_or("EVALUATOR_BIN_WIDTH", d.evaluator.bin_width)?,
            },
            runtime: RuntimeConfig {
                stage_timeout: Duration::from_secs(parse_or("STAGE_TIMEOUT_SECS", 300u64)?),
                request_timeout: Duration::from_secs(parse_or("REQUEST_TIMEOUT_SECS", 20u64)?),
                max_attempts: parse_or("REQUEST_MAX_ATTEMPTS", d.runtime.max_attempts)?,
                backoff_base: d.runtime.backoff_base,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.model;
        if m.heuristic_weight < 0.0 || m.market_weight < 0.0 || m.heuristic_weight + m.market_weight <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "MODEL_HEURISTIC_WEIGHT",
                value: format!("{}/{}", m.heuristic_weight, m.market_weight),
                reason: "blend weights must be non-negative and not both zero".to_string(),
            });
        }
        if m.spread_scale <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "MODEL_SPREAD_SCALE",
                value: m.spread_scale.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let w = self.evaluator.bin_width;
        if !(w > 0.0 && w <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "EVALUATOR_BIN_WIDTH",
                value: w.to_string(),
                reason: "must be in (0, 1]".to_string(),
            });
        }
        if self.runtime.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "REQUEST_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }
        Ok(())
    }

    /// The odds API key, for stages that cannot run without it.
    pub fn require_odds_api_key(&self) -> Result<&str, ConfigError> {
        self.sources
            .odds_api_key
            .as_deref()
            .ok_or(ConfigError::Missing { key: "ODDS_API_KEY" })
    }
}

fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        _ => Ok(default),
    }
}
