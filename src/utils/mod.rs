use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc, Weekday};
use serde::Serialize;
use sha2::{Digest, Sha256};
use statrs::statistics::{Data, Median, Statistics};

/// Median of the finite values, `None` when there are none.
pub fn median(values: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    Some(Data::new(finite).median())
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().mean())
}

/// Population standard deviation; 0 for fewer than two values.
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().population_std_dev()
}

/// Convert decimal odds to raw implied probability (bookmaker margin included).
pub fn odds_to_probability(odds: f64) -> Option<f64> {
    if odds <= 1.0 || !odds.is_finite() {
        return None;
    }
    Some(1.0 / odds)
}

/// Normalize probabilities to sum to 1.0
pub fn normalize_probabilities(probs: Vec<f64>) -> Vec<f64> {
    let sum: f64 = probs.iter().sum();
    if sum == 0.0 {
        return probs;
    }
    probs.iter().map(|p| p / sum).collect()
}

/// Fuzzy team-name match: normalises case and punctuation, then checks
/// containment both ways and falls back to Jaro-Winkler similarity.
pub fn names_match(a: &str, b: &str) -> bool {
    let norm = |s: &str| -> String {
        s.to_lowercase()
            .replace('.', "")
            .replace('-', " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    };
    let a = norm(a);
    let b = norm(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.contains(&b) || b.contains(&a) || strsim::jaro_winkler(&a, &b) > 0.93
}

/// Season a kickoff belongs to; January and February games close out the
/// previous year's season.
pub fn nfl_season(kickoff: DateTime<Utc>) -> i32 {
    if kickoff.month() <= 2 {
        kickoff.year() - 1
    } else {
        kickoff.year()
    }
}

/// NFL week for a kickoff: week 1 begins the Thursday after Labor Day,
/// clamped to 1..=18; anything earlier is preseason (0).
pub fn nfl_week(kickoff: DateTime<Utc>) -> i32 {
    let year = nfl_season(kickoff);
    let Some(sept_first) = NaiveDate::from_ymd_opt(year, 9, 1) else {
        return 0;
    };
    let offset = (7 - sept_first.weekday().num_days_from_monday() as i64) % 7;
    let labor_day = sept_first + Duration::days(offset);
    let season_start = labor_day + Duration::days(3);
    let Some(start) = season_start.and_hms_opt(0, 0, 0) else {
        return 0;
    };
    let start = Utc.from_utc_datetime(&start);
    if kickoff < start {
        return 0;
    }
    let weeks = (kickoff - start).num_days() / 7;
    (weeks as i32 + 1).clamp(1, 18)
}

/// Rest-days heuristic from the kickoff's day of week in US Eastern time:
/// Sunday games follow a full week, Thursday games a short one.
pub fn rest_days(kickoff: DateTime<Utc>) -> i32 {
    let weekday = FixedOffset::west_opt(5 * 3600)
        .map(|eastern| kickoff.with_timezone(&eastern).weekday())
        .unwrap_or_else(|| kickoff.weekday());
    match weekday {
        Weekday::Sun => 7,
        Weekday::Thu => 4,
        _ => 6,
    }
}

/// Hex SHA-256 of a value's JSON form plus an optional salt.
pub fn content_hash<T: Serialize>(value: &T, salt: &str) -> Result<String, serde_json::Error> {
    let payload = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&payload);
    hasher.update(salt.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[f64::NAN]), None);
        assert!((median(&[-3.0]).unwrap() + 3.0).abs() < 1e-9);
        assert!((median(&[1.0, 9.0, 2.0]).unwrap() - 2.0).abs() < 1e-9);
        assert!((median(&[1.0, 2.0, 3.0, 100.0]).unwrap() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_population_std_dev() {
        assert_eq!(population_std_dev(&[4.0]), 0.0);
        let sd = population_std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((sd - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_odds_to_probability() {
        assert!((odds_to_probability(2.0).unwrap() - 0.5).abs() < 0.001);
        assert!((odds_to_probability(4.0).unwrap() - 0.25).abs() < 0.001);
        assert_eq!(odds_to_probability(1.0), None);
    }

    #[test]
    fn test_normalize_probabilities() {
        let probs = vec![0.4, 0.3, 0.2];
        let normalized = normalize_probabilities(probs);
        let sum: f64 = normalized.iter().sum();
        assert!((sum - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_names_match() {
        assert!(names_match("Kansas City Chiefs", "kansas city chiefs"));
        assert!(names_match("Chiefs", "Kansas City Chiefs"));
        assert!(names_match("St. Louis", "St Louis"));
        assert!(!names_match("New York Jets", "New York Giants"));
        assert!(!names_match("", "Bears"));
    }

    #[test]
    fn test_nfl_week() {
        // Labor Day 2025 is Sep 1, so week 1 opens Thursday Sep 4.
        let opener = Utc.with_ymd_and_hms(2025, 9, 5, 0, 20, 0).unwrap();
        assert_eq!(nfl_week(opener), 1);
        let week_three = Utc.with_ymd_and_hms(2025, 9, 21, 17, 0, 0).unwrap();
        assert_eq!(nfl_week(week_three), 3);
        let preseason = Utc.with_ymd_and_hms(2025, 8, 20, 0, 0, 0).unwrap();
        assert_eq!(nfl_week(preseason), 0);
        let playoffs = Utc.with_ymd_and_hms(2026, 1, 18, 20, 0, 0).unwrap();
        assert_eq!(nfl_season(playoffs), 2025);
        assert_eq!(nfl_week(playoffs), 18);
    }

    #[test]
    fn test_rest_days() {
        // 17:00 UTC Sunday is 12:00 Eastern Sunday.
        let sunday = Utc.with_ymd_and_hms(2025, 9, 21, 17, 0, 0).unwrap();
        assert_eq!(rest_days(sunday), 7);
        // 00:15 UTC Friday is Thursday night Eastern.
        let thursday_night = Utc.with_ymd_and_hms(2025, 9, 26, 0, 15, 0).unwrap();
        assert_eq!(rest_days(thursday_night), 4);
        let monday = Utc.with_ymd_and_hms(2025, 9, 23, 0, 15, 0).unwrap();
        assert_eq!(rest_days(monday), 6);
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = content_hash(&vec![1.5, 2.5], "v1").unwrap();
        let b = content_hash(&vec![1.5, 2.5], "v1").unwrap();
        let c = content_hash(&vec![1.5, 2.5], "v2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
