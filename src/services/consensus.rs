//! Collapses many bookmakers' quotes for one game into a single consensus line.

use std::collections::{HashMap, HashSet};

use crate::config::FeatureConfig;
use crate::models::{MarketType, OddsSnapshot, Outcome};
use crate::utils::{median, names_match, normalize_probabilities, odds_to_probability, population_std_dev};

#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    /// Median decimal prices, present when at least one book quoted both sides.
    pub moneyline_home: Option<f64>,
    pub moneyline_away: Option<f64>,
    pub implied_home: f64,
    pub implied_away: f64,
    /// Home-team handicap points (negative when home is favoured).
    pub spread: f64,
    pub total: f64,
    pub volatility: f64,
    pub coverage_quality: f64,
    pub bookmaker_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Home,
    Away,
}

/// Which team an outcome refers to. Exact names win; otherwise a fuzzy match
/// is accepted only when it points at exactly one of the two teams.
fn side_of(name: &str, home_team: &str, away_team: &str) -> Option<Side> {
    if name == home_team {
        return Some(Side::Home);
    }
    if name == away_team {
        return Some(Side::Away);
    }
    match (names_match(name, home_team), names_match(name, away_team)) {
        (true, false) => Some(Side::Home),
        (false, true) => Some(Side::Away),
        _ => None,
    }
}

fn find_side<'a>(outcomes: &'a [Outcome], side: Side, home_team: &str, away_team: &str) -> Option<&'a Outcome> {
    outcomes
        .iter()
        .find(|o| side_of(&o.name, home_team, away_team) == Some(side))
}

/// Each bookmaker's most recent snapshot for every market it quoted.
fn latest_per_bookmaker(snapshots: &[OddsSnapshot]) -> HashMap<(&str, MarketType), &OddsSnapshot> {
    let mut latest: HashMap<(&str, MarketType), &OddsSnapshot> = HashMap::new();
    for snapshot in snapshots {
        latest
            .entry((snapshot.bookmaker.as_str(), snapshot.market))
            .and_modify(|current| {
                if snapshot.snapshot_time > current.snapshot_time {
                    *current = snapshot;
                }
            })
            .or_insert(snapshot);
    }
    latest
}

pub fn aggregate(
    home_team: &str,
    away_team: &str,
    snapshots: &[OddsSnapshot],
    config: &FeatureConfig,
) -> Consensus {
    let latest = latest_per_bookmaker(snapshots);

    // ── Moneyline ──
    let mut home_prices = Vec::new();
    let mut away_prices = Vec::new();
    for snapshot in latest.values().filter(|s| s.market == MarketType::H2h) {
        let home = find_side(&snapshot.outcomes, Side::Home, home_team, away_team);
        let away = find_side(&snapshot.outcomes, Side::Away, home_team, away_team);
        if let (Some(h), Some(a)) = (home, away) {
            if h.price > 1.0 && a.price > 1.0 {
                home_prices.push(h.price);
                away_prices.push(a.price);
            }
        }
    }

    let moneyline_home = median(&home_prices);
    let moneyline_away = median(&away_prices);
    let (implied_home, implied_away) = match (
        moneyline_home.and_then(odds_to_probability),
        moneyline_away.and_then(odds_to_probability),
    ) {
        (Some(h), Some(a)) => {
            let normalized = normalize_probabilities(vec![h, a]);
            (normalized[0], normalized[1])
        }
        _ => (0.5, 0.5),
    };

    // ── Spread ──
    let home_point = |snapshot: &OddsSnapshot| {
        find_side(&snapshot.outcomes, Side::Home, home_team, away_team).and_then(|o| o.point)
    };
    let latest_spreads: Vec<f64> = latest
        .values()
        .filter(|s| s.market == MarketType::Spreads)
        .filter_map(|s| home_point(s))
        .collect();
    let spread = median(&latest_spreads).unwrap_or(0.0);

    let window_spreads: Vec<f64> = snapshots
        .iter()
        .filter(|s| s.market == MarketType::Spreads)
        .filter_map(|s| home_point(s))
        .collect();
    let volatility = population_std_dev(&window_spreads);

    // ── Total ──
    let totals: Vec<f64> = latest
        .values()
        .filter(|s| s.market == MarketType::Totals)
        .filter_map(|s| {
            s.outcomes
                .iter()
                .find(|o| o.name.eq_ignore_ascii_case("over"))
                .and_then(|o| o.point)
        })
        .collect();
    let total = median(&totals).unwrap_or(config.fallback_total);

    // ── Coverage ──
    let bookmakers: HashSet<&str> = latest.keys().map(|(book, _)| *book).collect();
    let bookmaker_count = bookmakers.len();
    let coverage_quality = if config.full_coverage_quotes == 0 {
        if bookmaker_count > 0 { 1.0 } else { 0.0 }
    } else {
        (bookmaker_count as f64 / config.full_coverage_quotes as f64).min(1.0)
    };

    Consensus {
        moneyline_home,
        moneyline_away,
        implied_home,
        implied_away,
        spread,
        total,
        volatility,
        coverage_quality,
        bookmaker_count,
    }
}
