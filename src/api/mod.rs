use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::AppConfig;
use crate::db::{SqliteStore, Store};
use crate::models::{ApiResponse, CalibrationReport, HealthCheck, PipelineReport, UpcomingGameWithPredictions};
use crate::services::{Evaluator, Orchestrator};

/// Odds older than this mark the service degraded.
const ODDS_FRESHNESS_HOURS: f64 = 24.0;
/// Sources with at least this many consecutive failures count as failing.
const FAILING_SOURCE_THRESHOLD: i32 = 3;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Arc<AppConfig>,
}

pub async fn serve(config: AppConfig, port: u16) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(&config.database_url).await?);
    let state = AppState { store, config: Arc::new(config) };

    let app = create_router().with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("Gridiron API server listening on port {}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/pipeline/run", post(run_pipeline_handler))
        .route("/games/upcoming", get(get_upcoming_games_handler))
        .route("/calibration", get(get_calibration_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

pub async fn health_report(store: &dyn Store) -> HealthCheck {
    let now = Utc::now();
    let database_ok = store.ping().await.is_ok();

    let hours_since_odds = match store.latest_snapshot_time().await {
        Ok(Some(at)) => Some((now - at).num_seconds() as f64 / 3600.0),
        Ok(None) => None,
        Err(e) => {
            tracing::warn!("Health: could not read odds freshness: {}", e);
            None
        }
    };

    let failing_sources = match store.list_sources().await {
        Ok(sources) => sources
            .iter()
            .filter(|s| s.consecutive_failures >= FAILING_SOURCE_THRESHOLD)
            .count(),
        Err(e) => {
            tracing::warn!("Health: could not read source registry: {}", e);
            0
        }
    };

    let predictions_24h = store
        .count_predictions_since(now - Duration::hours(24))
        .await
        .unwrap_or(0);

    let odds_fresh = hours_since_odds.is_some_and(|h| h < ODDS_FRESHNESS_HOURS);
    let status = if !database_ok {
        "unhealthy"
    } else if !odds_fresh || failing_sources > 0 {
        "degraded"
    } else {
        "healthy"
    };

    HealthCheck {
        status: status.to_string(),
        database_ok,
        hours_since_odds,
        failing_sources,
        predictions_24h,
        timestamp: now,
    }
}

// GET /health
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<HealthCheck>>) {
    let health = health_report(state.store.as_ref()).await;
    let code = if health.database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(ApiResponse::success(health)))
}

// POST /pipeline/run
async fn run_pipeline_handler(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<PipelineReport>>) {
    match Orchestrator::from_config(state.store.clone(), &state.config) {
        Ok(orchestrator) => {
            let report = orchestrator.run(Utc::now()).await;
            (StatusCode::OK, Json(ApiResponse::success(report)))
        }
        Err(e) => {
            tracing::error!("Failed to build pipeline: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("could not build pipeline: {}", e))),
            )
        }
    }
}

#[derive(Deserialize)]
struct UpcomingGamesQuery {
    limit: Option<usize>,
}

// GET /games/upcoming
async fn get_upcoming_games_handler(
    State(state): State<AppState>,
    Query(params): Query<UpcomingGamesQuery>,
) -> Result<Json<ApiResponse<Vec<UpcomingGameWithPredictions>>>, StatusCode> {
    let games = state.store.list_upcoming_games(Utc::now()).await.map_err(|e| {
        tracing::error!("Failed to list upcoming games: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let limit = params.limit.unwrap_or(50).min(100);
    let mut out = Vec::new();
    for game in games.into_iter().take(limit) {
        let predictions = match state.store.read_predictions_for_game(&game.id).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Predictions for {} unavailable: {}", game.id, e);
                Vec::new()
            }
        };
        out.push(UpcomingGameWithPredictions { game, predictions });
    }

    Ok(Json(ApiResponse::success(out)))
}

// GET /calibration
async fn get_calibration_handler(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<CalibrationReport>>, StatusCode> {
    match Evaluator::new(state.config.evaluator.clone())
        .report_from_store(state.store.as_ref(), Utc::now())
        .await
    {
        Ok(report) => Ok(Json(ApiResponse::success(report))),
        Err(e) => {
            tracing::error!("Failed to build calibration report: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{seed_data, MemoryStore};
    use crate::models::SourceType;

    #[tokio::test]
    async fn empty_store_is_degraded() {
        let store = MemoryStore::new();
        let health = health_report(&store).await;
        assert!(health.database_ok);
        assert_eq!(health.status, "degraded");
        assert!(health.hours_since_odds.is_none());
        assert_eq!(health.predictions_24h, 0);
    }

    #[tokio::test]
    async fn seeded_store_is_healthy_until_a_source_keeps_failing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        seed_data(&store, now).await.unwrap();

        let health = health_report(&store).await;
        assert_eq!(health.status, "healthy", "{:?}", health);
        assert!(health.hours_since_odds.is_some_and(|h| h < 1.0));

        for _ in 0..FAILING_SOURCE_THRESHOLD {
            store.record_source_failure(SourceType::Weather, now).await.unwrap();
        }
        let health = health_report(&store).await;
        assert_eq!(health.failing_sources, 1);
        assert_eq!(health.status, "degraded");
    }
}
