use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::SourceConfig;
use crate::db::Store;
use crate::models::{Game, Signal, SignalPayload, SourceType, WeatherReport};
use crate::services::{HttpClient, StageOutcome};
use crate::utils::{content_hash, names_match};

const WEATHER_CONFIDENCE: f64 = 0.95;

// ── Stadiums ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stadium {
    pub team: &'static str,
    pub name: &'static str,
    pub latitude: f64,
    pub longitude: f64,
}

// (home team, stadium, lat, lon)
const STADIUMS: &[(&str, &str, f64, f64)] = &[
    ("Arizona Cardinals",     "State Farm Stadium",          33.5276, -112.2626),
    ("Atlanta Falcons",       "Mercedes-Benz Stadium",       33.7553,  -84.4006),
    ("Baltimore Ravens",      "M&T Bank Stadium",            39.2780,  -76.6227),
    ("Buffalo Bills",         "Highmark Stadium",            42.7738,  -78.7870),
    ("Carolina Panthers",     "Bank of America Stadium",     35.2258,  -80.8530),
    ("Chicago Bears",         "Soldier Field",               41.8623,  -87.6167),
    ("Cincinnati Bengals",    "Paul Brown Stadium",          39.0954,  -84.5160),
    ("Cleveland Browns",      "FirstEnergy Stadium",         41.5061,  -81.6995),
    ("Dallas Cowboys",        "AT&T Stadium",                32.7473,  -97.0945),
    ("Denver Broncos",        "Empower Field at Mile High",  39.7439, -104.9942),
    ("Detroit Lions",         "Ford Field",                  42.3400,  -83.0456),
    ("Green Bay Packers",     "Lambeau Field",               44.5013,  -88.0622),
    ("Houston Texans",        "NRG Stadium",                 29.6847,  -95.4107),
    ("Indianapolis Colts",    "Lucas Oil Stadium",           39.7601,  -86.1639),
    ("Jacksonville Jaguars",  "TIAA Bank Field",             30.3239,  -81.6373),
    ("Kansas City Chiefs",    "Arrowhead Stadium",           39.0489,  -94.4839),
    ("Las Vegas Raiders",     "Allegiant Stadium",           36.0909, -115.1833),
    ("Los Angeles Chargers",  "SoFi Stadium",                33.9535, -118.3387),
    ("Los Angeles Rams",      "SoFi Stadium",                33.9535, -118.3387),
    ("Miami Dolphins",        "Hard Rock Stadium",           25.9580,  -80.2389),
    ("Minnesota Vikings",     "U.S. Bank Stadium",           44.9738,  -93.2575),
    ("New England Patriots",  "Gillette Stadium",            42.0909,  -71.2643),
    ("New Orleans Saints",    "Caesars Superdome",           29.9511,  -90.0812),
    ("New York Giants",       "MetLife Stadium",             40.8128,  -74.0742),
    ("New York Jets",         "MetLife Stadium",             40.8128,  -74.0742),
    ("Philadelphia Eagles",   "Lincoln Financial Field",     39.9008,  -75.1675),
    ("Pittsburgh Steelers",   "Acrisure Stadium",            40.4468,  -80.0158),
    ("San Francisco 49ers",   "Levi's Stadium",              37.4032, -121.9698),
    ("Seattle Seahawks",      "Lumen Field",                 47.5952, -122.3316),
    ("Tampa Bay Buccaneers",  "Raymond James Stadium",       27.9759,  -82.5033),
    ("Tennessee Titans",      "Nissan Stadium",              36.1665,  -86.7713),
    ("Washington Commanders", "FedExField",                  38.9076,  -76.8645),
];

fn stadium(row: &(&'static str, &'static str, f64, f64)) -> Stadium {
    Stadium { team: row.0, name: row.1, latitude: row.2, longitude: row.3 }
}

pub fn stadium_for_team(team: &str) -> Option<Stadium> {
    STADIUMS
        .iter()
        .find(|(t, ..)| *t == team)
        .or_else(|| STADIUMS.iter().find(|(t, ..)| names_match(t, team)))
        .map(stadium)
}

pub fn stadium_by_name(venue: &str) -> Option<Stadium> {
    STADIUMS.iter().find(|(_, name, ..)| *name == venue).map(stadium)
}

/// Venue first, home team as a fallback (neutral-site games keep their venue).
pub fn stadium_for_game(game: &Game) -> Option<Stadium> {
    match &game.venue {
        Some(venue) => stadium_by_name(venue).or_else(|| stadium_for_team(&game.home_team)),
        None => stadium_for_team(&game.home_team),
    }
}

// ── Open-Meteo response types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct Forecast {
    pub hourly: HourlyForecast,
}

#[derive(Debug, Deserialize)]
pub struct HourlyForecast {
    /// Local to the requested timezone (UTC), e.g. "2025-11-23T18:00".
    pub time: Vec<String>,
    pub temperature_2m: Vec<Option<f64>>,
    pub precipitation: Vec<Option<f64>>,
    pub wind_speed_10m: Vec<Option<f64>>,
}

/// Conditions at the kickoff hour, `None` when the forecast does not cover it.
pub fn report_at_kickoff(forecast: &Forecast, kickoff: DateTime<Utc>, venue: &str) -> Option<WeatherReport> {
    let hour = kickoff.with_minute(0)?.with_second(0)?;
    let key = hour.format("%Y-%m-%dT%H:%M").to_string();
    let h = &forecast.hourly;
    let idx = h.time.iter().position(|t| *t == key)?;

    Some(WeatherReport {
        venue: venue.to_string(),
        temperature_f: (*h.temperature_2m.get(idx)?)?,
        wind_mph: (*h.wind_speed_10m.get(idx)?)?,
        precipitation_mm: h.precipitation.get(idx).copied().flatten().unwrap_or(0.0),
    })
}

/// A forecast can revert to an earlier value, so the fetch time is part of
/// the hash; only a repeat of the same fetch is treated as a duplicate.
pub fn weather_signal(game_id: &str, report: WeatherReport, fetched_at: DateTime<Utc>) -> Result<Signal> {
    let payload = SignalPayload::Weather(report);
    let salt = format!("{}@{}", game_id, fetched_at.to_rfc3339());
    Ok(Signal {
        id: Uuid::new_v4().to_string(),
        game_id: game_id.to_string(),
        source: SourceType::Weather.default_name().to_string(),
        content_hash: content_hash(&payload, &salt)?,
        payload,
        confidence: Some(WEATHER_CONFIDENCE),
        timestamp: fetched_at,
    })
}

pub struct WeatherFetcher {
    http: HttpClient,
    config: SourceConfig,
}

impl WeatherFetcher {
    pub fn new(http: HttpClient, config: SourceConfig) -> Self {
        Self { http, config }
    }

    async fn fetch_forecast(&self, stadium: &Stadium, kickoff: DateTime<Utc>) -> Result<Forecast> {
        let url = format!("{}/forecast", self.config.weather_api_base.trim_end_matches('/'));
        let day = kickoff.format("%Y-%m-%d").to_string();
        let query = [
            ("latitude", stadium.latitude.to_string()),
            ("longitude", stadium.longitude.to_string()),
            ("hourly", "temperature_2m,precipitation,wind_speed_10m".to_string()),
            ("temperature_unit", "fahrenheit".to_string()),
            ("wind_speed_unit", "mph".to_string()),
            ("precipitation_unit", "mm".to_string()),
            ("timezone", "UTC".to_string()),
            ("start_date", day.clone()),
            ("end_date", day),
        ];
        Ok(self.http.get_json(SourceType::Weather.default_name(), &url, &query).await?)
    }

    async fn ingest_game(&self, store: &dyn Store, game: &Game, stadium: &Stadium, now: DateTime<Utc>) -> Result<bool> {
        let forecast = self.fetch_forecast(stadium, game.kickoff_time).await?;
        let report = report_at_kickoff(&forecast, game.kickoff_time, stadium.name)
            .ok_or_else(|| anyhow!("forecast does not cover kickoff {}", game.kickoff_time))?;
        let signal = weather_signal(&game.id, report, now)?;
        Ok(store.insert_signal(&signal).await?)
    }

    /// Fetch kickoff-hour forecasts for games within the horizon.
    pub async fn ingest(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<StageOutcome> {
        if let Some(source) = store.get_source(SourceType::Weather).await? {
            if !source.is_active {
                tracing::info!("Weather source is inactive, skipping");
                return Ok(StageOutcome::default());
            }
        }

        let horizon = now + Duration::days(self.config.weather_horizon_days);
        let games: Vec<Game> = store
            .list_upcoming_games(now)
            .await?
            .into_iter()
            .filter(|g| g.kickoff_time <= horizon)
            .collect();
        tracing::info!("Processing weather for {} games", games.len());

        let mut outcome = StageOutcome::default();
        let mut attempted = 0usize;
        for game in &games {
            let Some(stadium) = stadium_for_game(game) else {
                tracing::debug!("No coordinates for {} ({:?})", game.home_team, game.venue);
                continue;
            };
            attempted += 1;
            match self.ingest_game(store, game, &stadium, now).await {
                Ok(inserted) => {
                    if !inserted {
                        tracing::debug!("Weather for {} unchanged", game.id);
                    }
                    outcome.record_success();
                }
                Err(e) => outcome.record_failure(&game.id, e),
            }
        }

        if attempted > 0 && outcome.processed == 0 {
            store.record_source_failure(SourceType::Weather, now).await?;
            return Err(anyhow!("all {} forecast requests failed", attempted));
        }
        store.record_source_success(SourceType::Weather, now).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GameStatus;
    use chrono::TimeZone;

    fn forecast() -> Forecast {
        serde_json::from_str(
            r#"{
                "latitude": 44.5,
                "longitude": -88.06,
                "hourly": {
                    "time": ["2025-12-21T17:00", "2025-12-21T18:00", "2025-12-21T19:00"],
                    "temperature_2m": [14.2, 12.9, null],
                    "precipitation": [0.0, 0.8, 0.1],
                    "wind_speed_10m": [18.0, 22.5, 21.0]
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn picks_the_kickoff_hour() {
        let kickoff = Utc.with_ymd_and_hms(2025, 12, 21, 18, 25, 0).unwrap();
        let report = report_at_kickoff(&forecast(), kickoff, "Lambeau Field").unwrap();
        assert_eq!(report.temperature_f, 12.9);
        assert_eq!(report.wind_mph, 22.5);
        assert_eq!(report.precipitation_mm, 0.8);
    }

    #[test]
    fn missing_hour_or_value_yields_none() {
        let outside = Utc.with_ymd_and_hms(2025, 12, 22, 18, 0, 0).unwrap();
        assert!(report_at_kickoff(&forecast(), outside, "x").is_none());
        let null_temp = Utc.with_ymd_and_hms(2025, 12, 21, 19, 0, 0).unwrap();
        assert!(report_at_kickoff(&forecast(), null_temp, "x").is_none());
    }

    #[test]
    fn stadium_lookup() {
        assert_eq!(stadium_for_team("Green Bay Packers").unwrap().name, "Lambeau Field");
        assert_eq!(stadium_for_team("Jets").unwrap().name, "MetLife Stadium");
        assert!(stadium_for_team("London Monarchs").is_none());

        let now = Utc::now();
        let game = Game {
            id: "g".to_string(),
            season: 2025,
            week: 1,
            home_team: "Los Angeles Rams".to_string(),
            away_team: "Houston Texans".to_string(),
            kickoff_time: now,
            venue: Some("Lambeau Field".to_string()),
            status: GameStatus::Scheduled,
            home_score: None,
            away_score: None,
            schedule_change: false,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(stadium_for_game(&game).unwrap().name, "Lambeau Field");
    }

    #[tokio::test]
    async fn reverted_forecast_is_the_latest_signal() {
        use crate::db::{MemoryStore, Store};
        use crate::models::SignalType;
        use crate::services::signals::latest_weather_severity;

        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 12, 18, 12, 0, 0).unwrap();
        let report = |temperature_f: f64, wind_mph: f64, precipitation_mm: f64| WeatherReport {
            venue: "Lambeau Field".to_string(),
            temperature_f,
            wind_mph,
            precipitation_mm,
        };
        let calm = || report(45.0, 5.0, 0.0);

        let mut inserted = Vec::new();
        for (i, r) in [calm(), report(10.0, 30.0, 4.0), calm()].into_iter().enumerate() {
            let signal = weather_signal("g1", r, t0 + Duration::hours(6 * i as i64)).unwrap();
            inserted.push(store.insert_signal(&signal).await.unwrap());
        }
        assert_eq!(inserted, vec![true, true, true]);

        // Same fetch stored twice is still a duplicate.
        let again = weather_signal("g1", calm(), t0 + Duration::hours(12)).unwrap();
        assert!(!store.insert_signal(&again).await.unwrap());

        let latest = store.list_signals("g1", SignalType::Weather, 1).await.unwrap();
        assert_eq!(latest_weather_severity(&latest), 0.0);
    }
}
