use anyhow::Result;
use chrono::{DateTime, Duration, Timelike, Utc};
use uuid::Uuid;

use super::Store;
use crate::config::{FeatureConfig, ModelConfig};
use crate::models::*;
use crate::services::weather_fetcher::stadium_for_team;
use crate::services::{FeatureBuilder, PredictionEngine};
use crate::utils::{content_hash, nfl_season, nfl_week};

const BOOKMAKERS: [&str; 5] = ["draftkings", "fanduel", "betmgm", "caesars", "pointsbetus"];
const MARGIN: f64 = 1.045;
const HOME_FIELD_POINTS: f64 = 1.5;

// (team, power rating in points vs. an average team)
const TEAMS: &[(&str, f64)] = &[
    ("Kansas City Chiefs",     6.0),
    ("Buffalo Bills",          5.5),
    ("Baltimore Ravens",       5.0),
    ("Detroit Lions",          5.0),
    ("Philadelphia Eagles",    4.5),
    ("San Francisco 49ers",    3.5),
    ("Green Bay Packers",      3.0),
    ("Cincinnati Bengals",     2.0),
    ("Houston Texans",         1.5),
    ("Minnesota Vikings",      1.5),
    ("Los Angeles Chargers",   1.0),
    ("Pittsburgh Steelers",    1.0),
    ("Los Angeles Rams",       0.5),
    ("Tampa Bay Buccaneers",   0.5),
    ("Seattle Seahawks",       0.0),
    ("Dallas Cowboys",         0.0),
    ("Miami Dolphins",        -0.5),
    ("Washington Commanders", -0.5),
    ("Atlanta Falcons",       -1.0),
    ("Arizona Cardinals",     -1.0),
    ("Chicago Bears",         -1.5),
    ("Indianapolis Colts",    -1.5),
    ("Denver Broncos",        -2.0),
    ("New York Jets",         -2.5),
    ("Jacksonville Jaguars",  -3.0),
    ("New Orleans Saints",    -3.0),
    ("Las Vegas Raiders",     -3.5),
    ("Cleveland Browns",      -4.0),
    ("Tennessee Titans",      -4.5),
    ("New England Patriots",  -4.5),
    ("New York Giants",       -5.0),
    ("Carolina Panthers",     -5.5),
];

fn rating(team: &str) -> f64 {
    TEAMS.iter().find(|(t, _)| *t == team).map(|(_, r)| *r).unwrap_or(0.0)
}

fn round_half(x: f64) -> f64 {
    (x * 2.0).round() / 2.0
}

/// Deterministic wobble in [-1, 1] so seeded lines differ between books.
fn wobble(a: usize, b: usize) -> f64 {
    (((a * 7919 + b * 104_729 + 13) % 21) as f64 - 10.0) / 10.0
}

fn game(id: String, home: &str, away: &str, kickoff: DateTime<Utc>, now: DateTime<Utc>) -> Game {
    Game {
        id,
        season: nfl_season(kickoff),
        week: nfl_week(kickoff),
        home_team: home.to_string(),
        away_team: away.to_string(),
        kickoff_time: kickoff,
        venue: stadium_for_team(home).map(|s| s.name.to_string()),
        status: GameStatus::Scheduled,
        home_score: None,
        away_score: None,
        schedule_change: false,
        created_at: now,
        updated_at: now,
    }
}

/// h2h, spreads and totals from one book for a game with the given fair margin.
fn book_snapshots(g: &Game, book_idx: usize, margin: f64, total: f64, at: DateTime<Utc>) -> Vec<OddsSnapshot> {
    let book = BOOKMAKERS[book_idx % BOOKMAKERS.len()];
    let shade = wobble(book_idx, g.week as usize) * 0.5;
    let p_home = (0.5 + (margin + shade) / 28.0).clamp(0.08, 0.92);
    let price = |p: f64| ((100.0 / (p * MARGIN)).round() / 100.0).max(1.01);
    let spread = round_half(-(margin + shade));
    let total = round_half(total + shade);

    let snapshot = |market: MarketType, outcomes: Vec<Outcome>| OddsSnapshot {
        id: Uuid::new_v4().to_string(),
        game_id: g.id.clone(),
        bookmaker: book.to_string(),
        market,
        outcomes,
        last_update: Some(at),
        snapshot_time: at,
    };
    let outcome = |name: &str, price: f64, point: Option<f64>| Outcome { name: name.to_string(), price, point };

    vec![
        snapshot(
            MarketType::H2h,
            vec![
                outcome(&g.home_team, price(p_home), None),
                outcome(&g.away_team, price(1.0 - p_home), None),
            ],
        ),
        snapshot(
            MarketType::Spreads,
            vec![
                outcome(&g.home_team, 1.91, Some(spread)),
                outcome(&g.away_team, 1.91, Some(-spread)),
            ],
        ),
        snapshot(
            MarketType::Totals,
            vec![outcome("Over", 1.91, Some(total)), outcome("Under", 1.91, Some(total))],
        ),
    ]
}

async fn insert_lines(store: &dyn Store, g: &Game, books: usize, at: DateTime<Utc>, line_move: f64) -> Result<()> {
    let margin = rating(&g.home_team) - rating(&g.away_team) + HOME_FIELD_POINTS;
    let total = 41.0 + (g.home_team.len() + g.away_team.len()) as f64 % 10.0;
    for book_idx in 0..books {
        if line_move != 0.0 {
            // Opening line a day earlier, before the market moved.
            for s in book_snapshots(g, book_idx, margin - line_move, total, at - Duration::days(1)) {
                store.insert_odds_snapshot(&s).await?;
            }
        }
        for s in book_snapshots(g, book_idx, margin, total, at) {
            store.insert_odds_snapshot(&s).await?;
        }
    }
    Ok(())
}

async fn insert_signal(store: &dyn Store, game_id: &str, payload: SignalPayload, confidence: f64, at: DateTime<Utc>) -> Result<()> {
    let source = match payload.signal_type() {
        SignalType::Injury => SourceType::Injury.default_name(),
        SignalType::Weather => SourceType::Weather.default_name(),
    };
    let signal = Signal {
        id: Uuid::new_v4().to_string(),
        game_id: game_id.to_string(),
        source: source.to_string(),
        content_hash: content_hash(&payload, game_id)?,
        payload,
        confidence: Some(confidence),
        timestamp: at,
    };
    store.insert_signal(&signal).await?;
    Ok(())
}

fn injury(team: &str, player: &str, position: &str, status: &str, severity: f64) -> SignalPayload {
    SignalPayload::Injury(InjuryReport {
        team: team.to_string(),
        player: player.to_string(),
        position: position.to_string(),
        status: status.to_string(),
        injury_type: None,
        severity: Some(severity),
    })
}

/// Pairs teams off for one slate, rotating opponents by `round`.
fn slate(round: usize, games: usize) -> Vec<(&'static str, &'static str)> {
    let n = TEAMS.len();
    (0..games)
        .map(|i| {
            let home = TEAMS[(i * 2 + round) % n].0;
            let away = TEAMS[(i * 2 + 1 + round * 3) % n].0;
            (home, away)
        })
        .filter(|(h, a)| h != a)
        .collect()
}

pub async fn seed_data(store: &dyn Store, now: DateTime<Utc>) -> Result<()> {
    if store.get_game("seed-final-1-0").await?.is_some() {
        tracing::info!("Database already seeded, skipping.");
        return Ok(());
    }

    tracing::info!("Seeding database with NFL demo data...");
    let anchor = now.with_minute(0).and_then(|t| t.with_second(0)).unwrap_or(now);

    seed_completed(store, anchor, now).await?;
    seed_upcoming(store, anchor, now).await?;

    for source in [SourceType::Odds, SourceType::Injury, SourceType::Weather] {
        store.record_source_success(source, now).await?;
    }

    tracing::info!("Database seeded successfully.");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
//  Completed weeks: lines, features and predictions frozen before kickoff,
//  then final scores, so the evaluator has history to score.
// ─────────────────────────────────────────────────────────────────────────────

async fn seed_completed(store: &dyn Store, anchor: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    let builder = FeatureBuilder::new(FeatureConfig::default());
    let engine = PredictionEngine::new(ModelConfig::default());
    let mut count = 0;

    for week in 1..=3usize {
        let kickoff = anchor - Duration::days(7 * week as i64);
        for (i, (home, away)) in slate(week, 8).into_iter().enumerate() {
            let mut g = game(format!("seed-final-{}-{}", week, i), home, away, kickoff, now);
            store.upsert_game(&g).await?;

            let priced_at = kickoff - Duration::hours(20);
            insert_lines(store, &g, 3 + i % 3, priced_at, 0.0).await?;

            let snapshots = store.list_odds_snapshots(&g.id, 50).await?;
            let features = builder.compute(&g, &snapshots, &[], &[]);
            store
                .write_feature_set(&FeatureSet {
                    id: Uuid::new_v4().to_string(),
                    game_id: g.id.clone(),
                    features: features.clone(),
                    computed_at: priced_at,
                })
                .await?;
            let predictions = engine.predict_game(&g.id, &features, priced_at)?;
            store.upsert_predictions(&g.id, &predictions).await?;

            let expected = rating(home) - rating(away) + HOME_FIELD_POINTS;
            let swing = wobble(i, week) * 10.0;
            let base = 20 + (i % 4) as i32 * 3;
            let home_score = (base as f64 + (expected + swing) / 2.0).round().max(0.0) as i32;
            let away_score = (base as f64 - (expected + swing) / 2.0).round().max(0.0) as i32;

            g.status = GameStatus::Completed;
            g.home_score = Some(home_score);
            g.away_score = Some(away_score);
            g.updated_at = now;
            store.upsert_game(&g).await?;
            count += 1;
        }
    }

    tracing::info!("Seeded {} completed games with predictions", count);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
//  Upcoming week
// ─────────────────────────────────────────────────────────────────────────────

async fn seed_upcoming(store: &dyn Store, anchor: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    let matchups = slate(4, 8);
    for (i, (home, away)) in matchups.iter().enumerate() {
        let kickoff = anchor + Duration::days(1 + (i as i64 % 6)) + Duration::hours(2);
        let g = game(format!("seed-next-{}", i), home, away, kickoff, now);
        store.upsert_game(&g).await?;

        match i {
            // No book has posted a line yet.
            0 => {}
            // Thin market that moved overnight.
            1 => insert_lines(store, &g, 1, now, 2.5).await?,
            2 => insert_lines(store, &g, 5, now, 3.5).await?,
            _ => insert_lines(store, &g, 2 + i % 3, now, 0.0).await?,
        }

        if i == 3 {
            insert_signal(store, &g.id, injury(home, "Starting QB", "QB", "Out", 1.0), 0.8, now).await?;
            insert_signal(store, &g.id, injury(away, "WR1", "WR", "Questionable", 0.5), 0.8, now).await?;
        }
        if i == 4 {
            let venue = g.venue.clone().unwrap_or_else(|| "Unknown".to_string());
            let weather = SignalPayload::Weather(WeatherReport {
                venue,
                temperature_f: 14.0,
                wind_mph: 23.0,
                precipitation_mm: 1.2,
            });
            insert_signal(store, &g.id, weather, 0.95, now).await?;
        }
    }

    tracing::info!("Seeded {} upcoming games", matchups.len());
    Ok(())
}
