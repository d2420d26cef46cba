use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::{seed_data, MemoryStore, SqliteStore, Store};
use crate::models::{CalibrationReport, PipelineReport, PredictionMarket, Stage};
use crate::services::{Evaluator, Orchestrator};

async fn open_store(config: &AppConfig) -> Result<Arc<dyn Store>> {
    Ok(Arc::new(SqliteStore::connect(&config.database_url).await?))
}

/// Run the given stages (all of them when `stages` is empty) against the configured database.
pub async fn run_stages(config: &AppConfig, stages: &[Stage]) -> Result<PipelineReport> {
    let store = open_store(config).await?;
    let mut orchestrator = Orchestrator::from_config(store, config)?;
    if !stages.is_empty() {
        orchestrator = orchestrator.only(stages);
    }

    let report = orchestrator.run(Utc::now()).await;
    print_pipeline_report(&report);
    Ok(report)
}

pub async fn ingest_odds(config: &AppConfig) -> Result<()> {
    if let Err(e) = config.require_odds_api_key() {
        println!("❌ {}", e);
        println!("💡 Get a key at https://the-odds-api.com and put ODDS_API_KEY in your .env");
        return Ok(());
    }
    println!("📥 Fetching NFL odds and scores...");
    run_stages(config, &[Stage::Odds]).await?;
    Ok(())
}

pub async fn ingest_injuries(config: &AppConfig) -> Result<()> {
    println!("📥 Fetching NFL injury report...");
    run_stages(config, &[Stage::Injuries]).await?;
    Ok(())
}

pub async fn ingest_weather(config: &AppConfig) -> Result<()> {
    println!("📥 Fetching kickoff forecasts...");
    run_stages(config, &[Stage::Weather]).await?;
    Ok(())
}

pub async fn build_features(config: &AppConfig) -> Result<()> {
    println!("🧮 Building feature sets for upcoming games...");
    run_stages(config, &[Stage::Features]).await?;
    Ok(())
}

pub async fn generate_predictions(config: &AppConfig) -> Result<()> {
    println!("🔮 Generating predictions for upcoming games...");
    let report = run_stages(config, &[Stage::Predictions]).await?;

    let processed = report.results.get(&Stage::Predictions).map_or(0, |r| r.processed);
    if processed == 0 {
        println!("📭 Nothing to predict. Try building features first with: gridiron build-features");
        return Ok(());
    }

    let store = open_store(config).await?;
    print_sample_predictions(store.as_ref()).await?;
    Ok(())
}

pub async fn evaluate(config: &AppConfig) -> Result<()> {
    println!("📏 Scoring predictions against final scores...");
    run_stages(config, &[Stage::Calibration]).await?;

    let store = open_store(config).await?;
    let report = Evaluator::new(config.evaluator.clone())
        .report_from_store(store.as_ref(), Utc::now())
        .await?;
    print_calibration(&report);
    Ok(())
}

/// Print the calibration report from stored evaluations, optionally exporting the curve.
pub async fn report(config: &AppConfig, csv_path: Option<&Path>) -> Result<()> {
    let store = open_store(config).await?;
    let report = Evaluator::new(config.evaluator.clone())
        .report_from_store(store.as_ref(), Utc::now())
        .await?;

    if report.games_evaluated == 0 {
        println!("📭 No evaluations stored yet. Run: gridiron evaluate");
        return Ok(());
    }
    print_calibration(&report);

    if let Some(path) = csv_path {
        write_reliability_csv(path, &report)?;
        println!("\n💾 Reliability curve written to {}", path.display());
    }
    Ok(())
}

pub async fn init_db(config: &AppConfig) -> Result<()> {
    SqliteStore::connect(&config.database_url).await?;
    println!("✅ Database ready at {}", config.database_url);
    Ok(())
}

pub async fn seed(config: &AppConfig) -> Result<()> {
    let store = open_store(config).await?;
    seed_data(store.as_ref(), Utc::now()).await?;
    println!("🌱 Seeded demo season into {}", config.database_url);
    Ok(())
}

/// Seed an in-memory store and run the offline stages, no network or database file needed.
pub async fn demo(config: &AppConfig) -> Result<()> {
    println!("🏈 Running the offline pipeline on demo data...");
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let now = Utc::now();
    seed_data(store.as_ref(), now).await?;

    let report = Orchestrator::from_config(store.clone(), config)?
        .only(&[Stage::Features, Stage::Predictions, Stage::Calibration])
        .run(now)
        .await;
    print_pipeline_report(&report);

    print_sample_predictions(store.as_ref()).await?;
    let calibration = Evaluator::new(config.evaluator.clone())
        .report_from_store(store.as_ref(), now)
        .await?;
    print_calibration(&calibration);
    Ok(())
}

fn print_pipeline_report(report: &PipelineReport) {
    let status = match (report.success, report.partial) {
        (true, false) => "✅ complete",
        (true, true) => "⚠️  partial",
        _ => "❌ failed",
    };
    println!("\n🏁 Run {} {}", report.run_id, status);
    for (stage, result) in &report.results {
        match &result.error {
            None => println!(
                "   {:<12} {:>5} processed {:>3} skipped  {}ms",
                stage.as_str(),
                result.processed,
                result.failures.len(),
                result.duration_ms
            ),
            Some(e) => println!("   {:<12} ❌ {}", stage.as_str(), e),
        }
        for failure in result.failures.iter().take(3) {
            println!("      ↳ {}", failure);
        }
    }
}

async fn print_sample_predictions(store: &dyn Store) -> Result<()> {
    let games = store.list_upcoming_games(Utc::now()).await?;

    println!("\n🎯 Sample predictions:");
    let mut shown = 0;
    for game in &games {
        let predictions = store.read_predictions_for_game(&game.id).await?;
        if predictions.is_empty() {
            continue;
        }
        shown += 1;
        println!(
            "{}. {} @ {} ({}, week {}):",
            shown,
            game.away_team,
            game.home_team,
            game.kickoff_time.format("%Y-%m-%d %H:%M"),
            game.week
        );
        for p in &predictions {
            let line = match p.market_type {
                PredictionMarket::Moneyline => format!("Home win: {:.1}%", p.predicted_value * 100.0),
                PredictionMarket::Spread => format!("Home margin: {:+.1}", p.predicted_value),
                PredictionMarket::Total => format!("Total points: {:.1}", p.predicted_value),
            };
            let edge = p.edge_vs_implied.map_or(String::new(), |e| format!(" | Edge: {:+.1}%", e));
            println!("   {} (confidence {:.0}%){}", line, p.confidence * 100.0, edge);
        }
        if shown == 5 {
            break;
        }
    }
    if shown == 0 {
        println!("   (none)");
    }
    Ok(())
}

fn fmt_opt(value: Option<f64>, digits: usize) -> String {
    value.map_or("n/a".to_string(), |v| format!("{:.*}", digits, v))
}

fn print_calibration(report: &CalibrationReport) {
    println!("\n📊 Calibration ({} games):", report.games_evaluated);
    println!("   Brier score:        {}", fmt_opt(report.mean_brier_score, 4));
    println!("   Log loss:           {}", fmt_opt(report.mean_log_loss, 4));
    println!("   Spread error (pts): {}", fmt_opt(report.mean_spread_error, 2));
    println!("   Total error (pts):  {}", fmt_opt(report.mean_total_error, 2));
    println!("   ECE:                {}", fmt_opt(report.expected_calibration_error, 4));

    println!("\n   Bucket        n   predicted  actual");
    for bin in report.reliability_curve.iter().filter(|b| b.count > 0) {
        println!(
            "   {:.1}-{:.1}  {:>5}   {:>8}  {:>6}",
            bin.lower,
            bin.upper,
            bin.count,
            fmt_opt(bin.mean_predicted, 3),
            fmt_opt(bin.empirical_rate, 3)
        );
    }
}

pub fn write_reliability_csv(path: &Path, report: &CalibrationReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["lower", "upper", "count", "mean_predicted", "empirical_rate"])?;
    for bin in &report.reliability_curve {
        writer.write_record([
            format!("{:.2}", bin.lower),
            format!("{:.2}", bin.upper),
            bin.count.to_string(),
            bin.mean_predicted.map_or(String::new(), |v| format!("{:.6}", v)),
            bin.empirical_rate.map_or(String::new(), |v| format!("{:.6}", v)),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::evaluator::reliability_curve;

    #[test]
    fn reliability_csv_has_one_row_per_bin() {
        let pairs = [(0.82, 1.0), (0.85, 0.0), (0.31, 0.0)];
        let report = CalibrationReport {
            games_evaluated: 3,
            evaluations_written: 3,
            mean_brier_score: None,
            mean_log_loss: None,
            mean_spread_error: None,
            mean_total_error: None,
            expected_calibration_error: None,
            reliability_curve: reliability_curve(&pairs, 0.1),
            generated_at: Utc::now(),
        };

        let path = std::env::temp_dir().join(format!("reliability-{}.csv", uuid::Uuid::new_v4()));
        write_reliability_csv(&path, &report).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        std::fs::remove_file(&path).ok();

        assert_eq!(rows.len(), 10);
        assert_eq!(&rows[8][2], "2");
        assert_eq!(&rows[8][4], "0.500000");
        assert_eq!(&rows[0][3], "");
    }

    #[tokio::test]
    async fn demo_runs_offline() {
        demo(&AppConfig::default()).await.unwrap();
    }
}
