pub mod memory;
pub mod seed;

pub use memory::MemoryStore;
pub use seed::seed_data;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::error::StoreError;
use crate::models::*;

/// Storage interface the pipeline stages read from and write to. Every stage
/// re-reads what it needs on each run; nothing is cached between invocations.
#[async_trait]
pub trait Store: Send + Sync {
    // Games
    async fn upsert_game(&self, game: &Game) -> Result<(), StoreError>;
    async fn get_game(&self, game_id: &str) -> Result<Option<Game>, StoreError>;
    async fn list_upcoming_games(&self, not_before: DateTime<Utc>) -> Result<Vec<Game>, StoreError>;
    /// Completed games with both scores, most recent kickoff first.
    async fn list_completed_games_with_scores(&self, limit: usize) -> Result<Vec<Game>, StoreError>;

    // Odds
    async fn insert_odds_snapshot(&self, snapshot: &OddsSnapshot) -> Result<(), StoreError>;
    /// Newest first.
    async fn list_odds_snapshots(&self, game_id: &str, limit: usize) -> Result<Vec<OddsSnapshot>, StoreError>;
    async fn latest_snapshot_time(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    // Signals
    /// Returns false when an identical payload is already stored for the game.
    async fn insert_signal(&self, signal: &Signal) -> Result<bool, StoreError>;
    /// Newest first.
    async fn list_signals(
        &self,
        game_id: &str,
        signal_type: SignalType,
        limit: usize,
    ) -> Result<Vec<Signal>, StoreError>;

    // Features
    async fn write_feature_set(&self, feature_set: &FeatureSet) -> Result<(), StoreError>;
    async fn read_latest_feature_set(&self, game_id: &str) -> Result<Option<FeatureSet>, StoreError>;

    // Predictions
    /// Last-write-wins on `(game_id, market_type)`.
    async fn upsert_predictions(&self, game_id: &str, predictions: &[Prediction]) -> Result<(), StoreError>;
    async fn read_predictions_for_game(&self, game_id: &str) -> Result<Vec<Prediction>, StoreError>;
    async fn count_predictions_since(&self, since: DateTime<Utc>) -> Result<i64, StoreError>;

    // Evaluations
    async fn write_evaluation(&self, evaluation: &Evaluation) -> Result<(), StoreError>;
    async fn list_recent_evaluations(&self, limit: usize) -> Result<Vec<Evaluation>, StoreError>;

    // Source registry
    async fn get_source(&self, source_type: SourceType) -> Result<Option<SourceRegistryEntry>, StoreError>;
    async fn list_sources(&self) -> Result<Vec<SourceRegistryEntry>, StoreError>;
    async fn record_source_success(&self, source_type: SourceType, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn record_source_failure(&self, source_type: SourceType, at: DateTime<Utc>) -> Result<(), StoreError>;

    // Usage budgets
    async fn read_budget(&self, key: &str) -> Result<Option<UsageBudget>, StoreError>;
    async fn write_budget(&self, budget: &UsageBudget) -> Result<(), StoreError>;

    // Audit
    async fn record_stage_run(&self, run: &StageRun) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Fixed-width UTC timestamps so text ordering in SQLite matches time ordering.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(table: &'static str, id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            id: id.to_string(),
            reason: format!("bad timestamp '{}': {}", raw, e),
        })
}

fn parse_opt_ts(table: &'static str, id: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|r| parse_ts(table, id, &r)).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(table: &'static str, id: &str, raw: &str) -> Result<T, StoreError> {
    raw.parse::<T>().map_err(|reason| StoreError::Corrupt {
        table,
        id: id.to_string(),
        reason,
    })
}

pub async fn create_pool(database_url: &str) -> anyhow::Result<SqlitePool> {
    // Strip the "sqlite:" prefix to get the file path, create parent dir if needed
    let file_path = database_url
        .strip_prefix("sqlite:///")
        .or_else(|| database_url.strip_prefix("sqlite://"))
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);

    if !file_path.starts_with(":memory:") {
        if let Some(parent) = std::path::Path::new(file_path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    tracing::warn!("Could not create database directory {}: {}", parent.display(), e);
                }
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(if file_path.starts_with(":memory:") { 1 } else { 5 })
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn init_database_with_pool(pool: &SqlitePool) -> anyhow::Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS games (
            id TEXT PRIMARY KEY,
            season INTEGER NOT NULL,
            week INTEGER NOT NULL,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            kickoff_time TEXT NOT NULL,
            venue TEXT,
            status TEXT NOT NULL DEFAULT 'scheduled',
            home_score INTEGER,
            away_score INTEGER,
            schedule_change INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS odds_snapshots (
            id TEXT PRIMARY KEY,
            game_id TEXT NOT NULL,
            bookmaker TEXT NOT NULL,
            market_type TEXT NOT NULL,
            odds_data TEXT NOT NULL,
            last_update TEXT,
            snapshot_time TEXT NOT NULL,
            FOREIGN KEY (game_id) REFERENCES games (id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS signals (
            id TEXT PRIMARY KEY,
            game_id TEXT NOT NULL,
            signal_type TEXT NOT NULL,
            source TEXT NOT NULL,
            content TEXT NOT NULL,
            confidence REAL,
            content_hash TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            UNIQUE (game_id, content_hash),
            FOREIGN KEY (game_id) REFERENCES games (id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS features (
            id TEXT PRIMARY KEY,
            game_id TEXT NOT NULL,
            feature_set TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            FOREIGN KEY (game_id) REFERENCES games (id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS predictions (
            id TEXT PRIMARY KEY,
            game_id TEXT NOT NULL,
            market_type TEXT NOT NULL,
            predicted_value REAL NOT NULL,
            confidence REAL NOT NULL,
            band_lower REAL NOT NULL,
            band_upper REAL NOT NULL,
            model_version TEXT NOT NULL,
            provenance_hash TEXT NOT NULL,
            model_probability REAL,
            implied_probability REAL,
            edge_vs_implied REAL,
            predicted_at TEXT NOT NULL,
            UNIQUE (game_id, market_type),
            FOREIGN KEY (game_id) REFERENCES games (id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS evaluations (
            id TEXT PRIMARY KEY,
            prediction_id TEXT NOT NULL,
            game_id TEXT NOT NULL,
            market_type TEXT NOT NULL,
            predicted_value REAL NOT NULL,
            actual_value REAL NOT NULL,
            absolute_error REAL NOT NULL,
            squared_error REAL NOT NULL,
            brier_score REAL,
            log_loss REAL,
            evaluated_at TEXT NOT NULL,
            FOREIGN KEY (prediction_id) REFERENCES predictions (id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS source_registry (
            source_type TEXT PRIMARY KEY,
            source_name TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            last_success TEXT,
            last_failure TEXT
        )
        "#,
        // usage_budgets: quota counters that must outlive any single process
        r#"
        CREATE TABLE IF NOT EXISTS usage_budgets (
            key TEXT PRIMARY KEY,
            used INTEGER NOT NULL,
            quota INTEGER NOT NULL,
            period_start TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS stage_runs (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            success INTEGER NOT NULL,
            processed INTEGER NOT NULL,
            error TEXT,
            failures TEXT NOT NULL DEFAULT '[]',
            duration_ms INTEGER NOT NULL,
            started_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_games_kickoff ON games(kickoff_time)",
        "CREATE INDEX IF NOT EXISTS idx_games_status ON games(status)",
        "CREATE INDEX IF NOT EXISTS idx_odds_game_time ON odds_snapshots(game_id, snapshot_time)",
        "CREATE INDEX IF NOT EXISTS idx_signals_game_type ON signals(game_id, signal_type, timestamp)",
        "CREATE INDEX IF NOT EXISTS idx_features_game_time ON features(game_id, computed_at)",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::info!("Database initialized successfully");
    Ok(())
}

// ── SQLite store ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = create_pool(database_url).await?;
        init_database_with_pool(&pool).await?;
        Ok(Self { pool })
    }
}

fn game_from_row(row: &SqliteRow) -> Result<Game, StoreError> {
    let id: String = row.try_get("id")?;
    Ok(Game {
        season: row.try_get("season")?,
        week: row.try_get("week")?,
        home_team: row.try_get("home_team")?,
        away_team: row.try_get("away_team")?,
        kickoff_time: parse_ts("games", &id, &row.try_get::<String, _>("kickoff_time")?)?,
        venue: row.try_get("venue")?,
        status: parse_enum("games", &id, &row.try_get::<String, _>("status")?)?,
        home_score: row.try_get("home_score")?,
        away_score: row.try_get("away_score")?,
        schedule_change: row.try_get("schedule_change")?,
        created_at: parse_ts("games", &id, &row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts("games", &id, &row.try_get::<String, _>("updated_at")?)?,
        id,
    })
}

/// Rows with a market key outside the tracked set are skipped, not fatal.
fn snapshot_from_row(row: &SqliteRow) -> Result<Option<OddsSnapshot>, StoreError> {
    let id: String = row.try_get("id")?;
    let market_key: String = row.try_get("market_type")?;
    let Some(market) = MarketType::from_key(&market_key) else {
        tracing::warn!("Skipping odds snapshot {} with unknown market '{}'", id, market_key);
        return Ok(None);
    };
    let outcomes: Vec<Outcome> = serde_json::from_str(&row.try_get::<String, _>("odds_data")?)?;
    Ok(Some(OddsSnapshot {
        game_id: row.try_get("game_id")?,
        bookmaker: row.try_get("bookmaker")?,
        market,
        outcomes,
        last_update: parse_opt_ts("odds_snapshots", &id, row.try_get("last_update")?)?,
        snapshot_time: parse_ts("odds_snapshots", &id, &row.try_get::<String, _>("snapshot_time")?)?,
        id,
    }))
}

fn signal_from_row(row: &SqliteRow) -> Result<Option<Signal>, StoreError> {
    let id: String = row.try_get("id")?;
    let payload: SignalPayload = match serde_json::from_str(&row.try_get::<String, _>("content")?) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("Skipping signal {} with unreadable content: {}", id, e);
            return Ok(None);
        }
    };
    Ok(Some(Signal {
        game_id: row.try_get("game_id")?,
        source: row.try_get("source")?,
        payload,
        confidence: row.try_get("confidence")?,
        content_hash: row.try_get("content_hash")?,
        timestamp: parse_ts("signals", &id, &row.try_get::<String, _>("timestamp")?)?,
        id,
    }))
}

fn prediction_from_row(row: &SqliteRow) -> Result<Prediction, StoreError> {
    let id: String = row.try_get("id")?;
    Ok(Prediction {
        game_id: row.try_get("game_id")?,
        market_type: parse_enum("predictions", &id, &row.try_get::<String, _>("market_type")?)?,
        predicted_value: row.try_get("predicted_value")?,
        confidence: row.try_get("confidence")?,
        uncertainty_band: UncertaintyBand {
            lower: row.try_get("band_lower")?,
            upper: row.try_get("band_upper")?,
        },
        model_version: row.try_get("model_version")?,
        provenance_hash: row.try_get("provenance_hash")?,
        model_probability: row.try_get("model_probability")?,
        implied_probability: row.try_get("implied_probability")?,
        edge_vs_implied: row.try_get("edge_vs_implied")?,
        predicted_at: parse_ts("predictions", &id, &row.try_get::<String, _>("predicted_at")?)?,
        id,
    })
}

fn evaluation_from_row(row: &SqliteRow) -> Result<Evaluation, StoreError> {
    let id: String = row.try_get("id")?;
    Ok(Evaluation {
        prediction_id: row.try_get("prediction_id")?,
        game_id: row.try_get("game_id")?,
        market_type: parse_enum("evaluations", &id, &row.try_get::<String, _>("market_type")?)?,
        predicted_value: row.try_get("predicted_value")?,
        actual_value: row.try_get("actual_value")?,
        absolute_error: row.try_get("absolute_error")?,
        squared_error: row.try_get("squared_error")?,
        brier_score: row.try_get("brier_score")?,
        log_loss: row.try_get("log_loss")?,
        evaluated_at: parse_ts("evaluations", &id, &row.try_get::<String, _>("evaluated_at")?)?,
        id,
    })
}

fn source_from_row(row: &SqliteRow) -> Result<SourceRegistryEntry, StoreError> {
    let key: String = row.try_get("source_type")?;
    Ok(SourceRegistryEntry {
        source_type: parse_enum("source_registry", &key, &key)?,
        source_name: row.try_get("source_name")?,
        is_active: row.try_get("is_active")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        last_success: parse_opt_ts("source_registry", &key, row.try_get("last_success")?)?,
        last_failure: parse_opt_ts("source_registry", &key, row.try_get("last_failure")?)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_game(&self, game: &Game) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO games
            (id, season, week, home_team, away_team, kickoff_time, venue, status,
             home_score, away_score, schedule_change, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                season          = excluded.season,
                week            = excluded.week,
                kickoff_time    = excluded.kickoff_time,
                venue           = COALESCE(excluded.venue, games.venue),
                status          = excluded.status,
                home_score      = COALESCE(excluded.home_score, games.home_score),
                away_score      = COALESCE(excluded.away_score, games.away_score),
                schedule_change = excluded.schedule_change,
                updated_at      = excluded.updated_at
            "#,
        )
        .bind(&game.id)
        .bind(game.season)
        .bind(game.week)
        .bind(&game.home_team)
        .bind(&game.away_team)
        .bind(ts(game.kickoff_time))
        .bind(&game.venue)
        .bind(game.status.as_str())
        .bind(game.home_score)
        .bind(game.away_score)
        .bind(game.schedule_change)
        .bind(ts(game.created_at))
        .bind(ts(game.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_game(&self, game_id: &str) -> Result<Option<Game>, StoreError> {
        let row = sqlx::query("SELECT * FROM games WHERE id = ?")
            .bind(game_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(game_from_row).transpose()
    }

    async fn list_upcoming_games(&self, not_before: DateTime<Utc>) -> Result<Vec<Game>, StoreError> {
        let rows = sqlx::query("SELECT * FROM games WHERE kickoff_time >= ? ORDER BY kickoff_time")
            .bind(ts(not_before))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(game_from_row).collect()
    }

    async fn list_completed_games_with_scores(&self, limit: usize) -> Result<Vec<Game>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM games
               WHERE status = 'completed' AND home_score IS NOT NULL AND away_score IS NOT NULL
               ORDER BY kickoff_time DESC LIMIT ?"#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(game_from_row).collect()
    }

    async fn insert_odds_snapshot(&self, snapshot: &OddsSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO odds_snapshots
               (id, game_id, bookmaker, market_type, odds_data, last_update, snapshot_time)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.game_id)
        .bind(&snapshot.bookmaker)
        .bind(snapshot.market.as_str())
        .bind(serde_json::to_string(&snapshot.outcomes)?)
        .bind(snapshot.last_update.map(ts))
        .bind(ts(snapshot.snapshot_time))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_odds_snapshots(&self, game_id: &str, limit: usize) -> Result<Vec<OddsSnapshot>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM odds_snapshots WHERE game_id = ? ORDER BY snapshot_time DESC LIMIT ?",
        )
        .bind(game_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut snapshots = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(snapshot) = snapshot_from_row(row)? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    async fn latest_snapshot_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<String> = sqlx::query_scalar("SELECT MAX(snapshot_time) FROM odds_snapshots")
            .fetch_one(&self.pool)
            .await?;
        parse_opt_ts("odds_snapshots", "max", latest)
    }

    async fn insert_signal(&self, signal: &Signal) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO signals
               (id, game_id, signal_type, source, content, confidence, content_hash, timestamp)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&signal.id)
        .bind(&signal.game_id)
        .bind(signal.payload.signal_type().as_str())
        .bind(&signal.source)
        .bind(serde_json::to_string(&signal.payload)?)
        .bind(signal.confidence)
        .bind(&signal.content_hash)
        .bind(ts(signal.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_signals(
        &self,
        game_id: &str,
        signal_type: SignalType,
        limit: usize,
    ) -> Result<Vec<Signal>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM signals WHERE game_id = ? AND signal_type = ?
               ORDER BY timestamp DESC LIMIT ?"#,
        )
        .bind(game_id)
        .bind(signal_type.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut signals = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(signal) = signal_from_row(row)? {
                signals.push(signal);
            }
        }
        Ok(signals)
    }

    async fn write_feature_set(&self, feature_set: &FeatureSet) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO features (id, game_id, feature_set, computed_at)
               SELECT ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM games WHERE id = ?)"#,
        )
        .bind(&feature_set.id)
        .bind(&feature_set.game_id)
        .bind(serde_json::to_string(&feature_set.features)?)
        .bind(ts(feature_set.computed_at))
        .bind(&feature_set.game_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingGame(feature_set.game_id.clone()));
        }
        Ok(())
    }

    async fn read_latest_feature_set(&self, game_id: &str) -> Result<Option<FeatureSet>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM features WHERE game_id = ? ORDER BY computed_at DESC LIMIT 1",
        )
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let id: String = row.try_get("id")?;
        Ok(Some(FeatureSet {
            game_id: row.try_get("game_id")?,
            features: serde_json::from_str(&row.try_get::<String, _>("feature_set")?)?,
            computed_at: parse_ts("features", &id, &row.try_get::<String, _>("computed_at")?)?,
            id,
        }))
    }

    async fn upsert_predictions(&self, game_id: &str, predictions: &[Prediction]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for p in predictions {
            sqlx::query(
                r#"
                INSERT INTO predictions
                (id, game_id, market_type, predicted_value, confidence, band_lower, band_upper,
                 model_version, provenance_hash, model_probability, implied_probability,
                 edge_vs_implied, predicted_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(game_id, market_type) DO UPDATE SET
                    predicted_value     = excluded.predicted_value,
                    confidence          = excluded.confidence,
                    band_lower          = excluded.band_lower,
                    band_upper          = excluded.band_upper,
                    model_version       = excluded.model_version,
                    provenance_hash     = excluded.provenance_hash,
                    model_probability   = excluded.model_probability,
                    implied_probability = excluded.implied_probability,
                    edge_vs_implied     = excluded.edge_vs_implied,
                    predicted_at        = excluded.predicted_at
                "#,
            )
            .bind(&p.id)
            .bind(game_id)
            .bind(p.market_type.as_str())
            .bind(p.predicted_value)
            .bind(p.confidence)
            .bind(p.uncertainty_band.lower)
            .bind(p.uncertainty_band.upper)
            .bind(&p.model_version)
            .bind(&p.provenance_hash)
            .bind(p.model_probability)
            .bind(p.implied_probability)
            .bind(p.edge_vs_implied)
            .bind(ts(p.predicted_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn read_predictions_for_game(&self, game_id: &str) -> Result<Vec<Prediction>, StoreError> {
        let rows = sqlx::query("SELECT * FROM predictions WHERE game_id = ? ORDER BY market_type")
            .bind(game_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(prediction_from_row).collect()
    }

    async fn count_predictions_since(&self, since: DateTime<Utc>) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM predictions WHERE predicted_at >= ?")
            .bind(ts(since))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn write_evaluation(&self, evaluation: &Evaluation) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO evaluations
            (id, prediction_id, game_id, market_type, predicted_value, actual_value,
             absolute_error, squared_error, brier_score, log_loss, evaluated_at)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (
                SELECT 1 FROM games WHERE id = ? AND status = 'completed'
                AND home_score IS NOT NULL AND away_score IS NOT NULL
            )
            "#,
        )
        .bind(&evaluation.id)
        .bind(&evaluation.prediction_id)
        .bind(&evaluation.game_id)
        .bind(evaluation.market_type.as_str())
        .bind(evaluation.predicted_value)
        .bind(evaluation.actual_value)
        .bind(evaluation.absolute_error)
        .bind(evaluation.squared_error)
        .bind(evaluation.brier_score)
        .bind(evaluation.log_loss)
        .bind(ts(evaluation.evaluated_at))
        .bind(&evaluation.game_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Unscored(evaluation.game_id.clone()));
        }
        Ok(())
    }

    async fn list_recent_evaluations(&self, limit: usize) -> Result<Vec<Evaluation>, StoreError> {
        let rows = sqlx::query("SELECT * FROM evaluations ORDER BY evaluated_at DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(evaluation_from_row).collect()
    }

    async fn get_source(&self, source_type: SourceType) -> Result<Option<SourceRegistryEntry>, StoreError> {
        let row = sqlx::query("SELECT * FROM source_registry WHERE source_type = ?")
            .bind(source_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_sources(&self) -> Result<Vec<SourceRegistryEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM source_registry ORDER BY source_type")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn record_source_success(&self, source_type: SourceType, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO source_registry (source_type, source_name, consecutive_failures, last_success)
               VALUES (?, ?, 0, ?)
               ON CONFLICT(source_type) DO UPDATE SET
                   consecutive_failures = 0,
                   last_success         = excluded.last_success"#,
        )
        .bind(source_type.as_str())
        .bind(source_type.default_name())
        .bind(ts(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_source_failure(&self, source_type: SourceType, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO source_registry (source_type, source_name, consecutive_failures, last_failure)
               VALUES (?, ?, 1, ?)
               ON CONFLICT(source_type) DO UPDATE SET
                   consecutive_failures = source_registry.consecutive_failures + 1,
                   last_failure         = excluded.last_failure"#,
        )
        .bind(source_type.as_str())
        .bind(source_type.default_name())
        .bind(ts(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_budget(&self, key: &str) -> Result<Option<UsageBudget>, StoreError> {
        let row = sqlx::query("SELECT * FROM usage_budgets WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(UsageBudget {
            key: row.try_get("key")?,
            used: row.try_get("used")?,
            limit: row.try_get("quota")?,
            period_start: parse_ts("usage_budgets", key, &row.try_get::<String, _>("period_start")?)?,
        }))
    }

    async fn write_budget(&self, budget: &UsageBudget) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO usage_budgets (key, used, quota, period_start) VALUES (?, ?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET
                   used         = excluded.used,
                   quota        = excluded.quota,
                   period_start = excluded.period_start"#,
        )
        .bind(&budget.key)
        .bind(budget.used)
        .bind(budget.limit)
        .bind(ts(budget.period_start))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_stage_run(&self, run: &StageRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO stage_runs
               (id, run_id, stage, success, processed, error, failures, duration_ms, started_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&run.id)
        .bind(&run.run_id)
        .bind(run.stage.as_str())
        .bind(run.result.success)
        .bind(run.result.processed as i64)
        .bind(&run.result.error)
        .bind(serde_json::to_string(&run.result.failures)?)
        .bind(run.result.duration_ms as i64)
        .bind(ts(run.started_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn unusable_database_directory_is_an_error() {
        let blocker = std::env::temp_dir().join(format!("gridiron-{}", uuid::Uuid::new_v4()));
        std::fs::write(&blocker, b"not a directory").unwrap();
        let url = format!("sqlite:{}/data/gridiron.db", blocker.display());

        let result = create_pool(&url).await;
        std::fs::remove_file(&blocker).ok();
        assert!(result.is_err());
    }

    fn game(id: &str, kickoff: DateTime<Utc>) -> Game {
        Game {
            id: id.to_string(),
            season: 2025,
            week: 3,
            home_team: "Green Bay Packers".to_string(),
            away_team: "Chicago Bears".to_string(),
            kickoff_time: kickoff,
            venue: Some("Lambeau Field".to_string()),
            status: GameStatus::Scheduled,
            home_score: None,
            away_score: None,
            schedule_change: false,
            created_at: kickoff,
            updated_at: kickoff,
        }
    }

    fn prediction(game_id: &str, market: PredictionMarket, value: f64) -> Prediction {
        Prediction {
            id: uuid::Uuid::new_v4().to_string(),
            game_id: game_id.to_string(),
            market_type: market,
            predicted_value: value,
            confidence: 0.9,
            uncertainty_band: UncertaintyBand { lower: value - 0.01, upper: value + 0.01 },
            model_version: "test".to_string(),
            provenance_hash: "abc".to_string(),
            model_probability: Some(value),
            implied_probability: Some(0.5),
            edge_vs_implied: Some((value - 0.5) * 100.0),
            predicted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upcoming_games_are_filtered_and_ordered() {
        let store = store().await;
        let now = Utc.with_ymd_and_hms(2025, 9, 20, 12, 0, 0).unwrap();
        store.upsert_game(&game("late", now + Duration::days(2))).await.unwrap();
        store.upsert_game(&game("past", now - Duration::days(1))).await.unwrap();
        store.upsert_game(&game("soon", now + Duration::hours(3))).await.unwrap();

        let upcoming = store.list_upcoming_games(now).await.unwrap();
        let ids: Vec<&str> = upcoming.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["soon", "late"]);
    }

    #[tokio::test]
    async fn predictions_upsert_on_natural_key() {
        let store = store().await;
        let now = Utc::now();
        store.upsert_game(&game("g1", now)).await.unwrap();

        store
            .upsert_predictions("g1", &[prediction("g1", PredictionMarket::Moneyline, 0.6)])
            .await
            .unwrap();
        store
            .upsert_predictions("g1", &[prediction("g1", PredictionMarket::Moneyline, 0.7)])
            .await
            .unwrap();

        let stored = store.read_predictions_for_game("g1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!((stored[0].predicted_value - 0.7).abs() < 1e-12);
    }

    #[tokio::test]
    async fn feature_set_requires_existing_game() {
        let store = store().await;
        let features = Features::neutral();
        let result = store
            .write_feature_set(&FeatureSet {
                id: "f1".to_string(),
                game_id: "missing".to_string(),
                features,
                computed_at: Utc::now(),
            })
            .await;
        assert!(matches!(result, Err(StoreError::MissingGame(_))));
    }

    #[tokio::test]
    async fn latest_feature_set_wins() {
        let store = store().await;
        let now = Utc::now();
        store.upsert_game(&game("g1", now)).await.unwrap();
        let mut features = Features::neutral();
        for (i, total) in [44.0, 51.5].into_iter().enumerate() {
            features.consensus_total = total;
            store
                .write_feature_set(&FeatureSet {
                    id: format!("f{}", i),
                    game_id: "g1".to_string(),
                    features: features.clone(),
                    computed_at: now + Duration::minutes(i as i64),
                })
                .await
                .unwrap();
        }
        let latest = store.read_latest_feature_set("g1").await.unwrap().unwrap();
        assert_eq!(latest.features.consensus_total, 51.5);
    }

    #[tokio::test]
    async fn evaluation_rejected_for_unscored_game() {
        let store = store().await;
        store.upsert_game(&game("g1", Utc::now())).await.unwrap();
        let result = store
            .write_evaluation(&Evaluation {
                id: "e1".to_string(),
                prediction_id: "p1".to_string(),
                game_id: "g1".to_string(),
                market_type: PredictionMarket::Moneyline,
                predicted_value: 0.6,
                actual_value: 1.0,
                absolute_error: 0.4,
                squared_error: 0.16,
                brier_score: Some(0.16),
                log_loss: Some(0.51),
                evaluated_at: Utc::now(),
            })
            .await;
        assert!(matches!(result, Err(StoreError::Unscored(_))));
    }

    #[tokio::test]
    async fn duplicate_signals_are_ignored() {
        let store = store().await;
        store.upsert_game(&game("g1", Utc::now())).await.unwrap();
        let signal = Signal {
            id: "s1".to_string(),
            game_id: "g1".to_string(),
            source: "Open-Meteo".to_string(),
            payload: SignalPayload::Weather(WeatherReport {
                venue: "Lambeau Field".to_string(),
                temperature_f: 15.0,
                wind_mph: 25.0,
                precipitation_mm: 0.0,
            }),
            confidence: Some(0.95),
            content_hash: "h".to_string(),
            timestamp: Utc::now(),
        };
        assert!(store.insert_signal(&signal).await.unwrap());
        let again = Signal { id: "s2".to_string(), ..signal };
        assert!(!store.insert_signal(&again).await.unwrap());

        let stored = store.list_signals("g1", SignalType::Weather, 5).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(matches!(stored[0].payload, SignalPayload::Weather(_)));
    }

    #[tokio::test]
    async fn source_failures_accumulate_and_reset() {
        let store = store().await;
        let now = Utc::now();
        store.record_source_failure(SourceType::Odds, now).await.unwrap();
        store.record_source_failure(SourceType::Odds, now).await.unwrap();
        let entry = store.get_source(SourceType::Odds).await.unwrap().unwrap();
        assert_eq!(entry.consecutive_failures, 2);
        assert!(entry.last_failure.is_some());

        store.record_source_success(SourceType::Odds, now).await.unwrap();
        let entry = store.get_source(SourceType::Odds).await.unwrap().unwrap();
        assert_eq!(entry.consecutive_failures, 0);
        assert!(entry.last_success.is_some());
    }
}
