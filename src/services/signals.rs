use crate::models::{Game, InjuryReport, Signal, SignalPayload, WeatherReport};
use crate::utils::names_match;

/// Fallback for a missing severity or confidence.
const UNKNOWN_FACTOR: f64 = 0.5;

pub fn position_weight(position: &str) -> f64 {
    match position.trim().to_uppercase().as_str() {
        "QB" => 3.0,
        "WR" | "RB" | "TE" => 2.0,
        _ => 1.0,
    }
}

/// Severity for an ESPN injury status. Unrecognised statuses yield `None`
/// and are scored with the neutral fallback.
pub fn severity_for_status(status: &str) -> Option<f64> {
    let s = status.trim().to_lowercase();
    match s.as_str() {
        "out" | "injured reserve" | "ir" | "physically unable to perform" | "pup" | "suspension" => Some(1.0),
        "doubtful" => Some(0.75),
        "questionable" => Some(0.5),
        "day-to-day" | "day to day" | "probable" => Some(0.25),
        _ if s.starts_with("injured reserve") => Some(1.0),
        _ => None,
    }
}

fn report_impact(report: &InjuryReport, confidence: Option<f64>) -> f64 {
    report.severity.unwrap_or(UNKNOWN_FACTOR) * confidence.unwrap_or(UNKNOWN_FACTOR) * position_weight(&report.position)
        / 10.0
}

/// Injury impact for (home, away). Reports whose team matches neither side,
/// or matches both, are ignored.
pub fn injury_impacts(game: &Game, signals: &[Signal]) -> (f64, f64) {
    let mut home = 0.0;
    let mut away = 0.0;
    for signal in signals {
        let SignalPayload::Injury(report) = &signal.payload else {
            continue;
        };
        let is_home = names_match(&report.team, &game.home_team);
        let is_away = names_match(&report.team, &game.away_team);
        match (is_home, is_away) {
            (true, false) => home += report_impact(report, signal.confidence),
            (false, true) => away += report_impact(report, signal.confidence),
            _ => tracing::debug!(
                "Injury report for '{}' does not map to {} @ {}",
                report.team,
                game.away_team,
                game.home_team
            ),
        }
    }
    (home, away)
}

pub fn weather_severity(report: &WeatherReport) -> f64 {
    let mut severity = 0.0;
    if report.temperature_f < 20.0 {
        severity += 0.3;
    }
    if report.wind_mph > 20.0 {
        severity += 0.3;
    }
    if report.precipitation_mm > 0.5 {
        severity += 0.4;
    }
    f64::min(severity, 1.0)
}

/// Severity of the newest weather signal, 0 when there is none.
pub fn latest_weather_severity(signals: &[Signal]) -> f64 {
    signals
        .iter()
        .filter_map(|s| match &s.payload {
            SignalPayload::Weather(w) => Some((s.timestamp, w)),
            _ => None,
        })
        .max_by_key(|(ts, _)| *ts)
        .map(|(_, w)| weather_severity(w))
        .unwrap_or(0.0)
}
