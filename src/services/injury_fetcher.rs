use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::SourceConfig;
use crate::db::Store;
use crate::models::{Game, InjuryReport, Signal, SignalPayload, SourceType};
use crate::services::signals::severity_for_status;
use crate::services::{HttpClient, StageOutcome};
use crate::utils::{content_hash, names_match};

const INJURY_CONFIDENCE: f64 = 0.8;

// ── ESPN response types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct InjuryFeed {
    #[serde(default)]
    pub injuries: Vec<TeamInjuries>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamInjuries {
    pub team: Option<EspnTeam>,
    pub display_name: Option<String>,
    #[serde(default)]
    pub injuries: Vec<EspnInjury>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnTeam {
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EspnInjury {
    pub athlete: Option<EspnAthlete>,
    pub status: Option<String>,
    pub details: Option<EspnDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnAthlete {
    pub display_name: Option<String>,
    pub position: Option<EspnPosition>,
}

#[derive(Debug, Deserialize)]
pub struct EspnPosition {
    pub abbreviation: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnDetails {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// Flatten the feed into typed reports, scoring each status as it is parsed.
pub fn parse_reports(feed: InjuryFeed) -> Vec<InjuryReport> {
    let mut reports = Vec::new();
    for team_entry in feed.injuries {
        let Some(team) = team_entry
            .team
            .and_then(|t| t.display_name)
            .or(team_entry.display_name)
        else {
            continue;
        };
        for injury in team_entry.injuries {
            let status = injury.status.unwrap_or_else(|| "Unknown".to_string());
            let (player, position) = match injury.athlete {
                Some(a) => (
                    a.display_name.unwrap_or_else(|| "Unknown".to_string()),
                    a.position.and_then(|p| p.abbreviation).unwrap_or_else(|| "N/A".to_string()),
                ),
                None => ("Unknown".to_string(), "N/A".to_string()),
            };
            reports.push(InjuryReport {
                team: team.clone(),
                player,
                position,
                severity: severity_for_status(&status),
                status,
                injury_type: injury.details.and_then(|d| d.kind),
            });
        }
    }
    reports
}

/// The team's next game among `upcoming` (sorted by kickoff).
pub fn next_game_for<'a>(team: &str, upcoming: &'a [Game]) -> Option<&'a Game> {
    upcoming
        .iter()
        .find(|g| names_match(team, &g.home_team) || names_match(team, &g.away_team))
}

pub struct InjuryFetcher {
    http: HttpClient,
    config: SourceConfig,
}

impl InjuryFetcher {
    pub fn new(http: HttpClient, config: SourceConfig) -> Self {
        Self { http, config }
    }

    /// Pull the league injury report and attach each entry to the team's next game.
    pub async fn ingest(&self, store: &dyn Store, now: DateTime<Utc>) -> Result<StageOutcome> {
        if let Some(source) = store.get_source(SourceType::Injury).await? {
            if !source.is_active {
                tracing::info!("Injury source is inactive, skipping");
                return Ok(StageOutcome::default());
            }
        }

        tracing::info!("Fetching injury data from ESPN...");
        let feed: InjuryFeed = match self
            .http
            .get_json(SourceType::Injury.default_name(), &self.config.injuries_url, &[])
            .await
        {
            Ok(feed) => feed,
            Err(e) => {
                store.record_source_failure(SourceType::Injury, now).await?;
                return Err(e.into());
            }
        };
        store.record_source_success(SourceType::Injury, now).await?;

        let reports = parse_reports(feed);
        let upcoming = store.list_upcoming_games(now).await?;
        tracing::info!("Processing {} injuries against {} upcoming games", reports.len(), upcoming.len());

        let mut outcome = StageOutcome::default();
        let mut unmatched = 0usize;
        for report in reports {
            let Some(game) = next_game_for(&report.team, &upcoming) else {
                unmatched += 1;
                continue;
            };
            let unit = format!("{}/{}", game.id, report.player);
            let payload = SignalPayload::Injury(report);
            let hash = match content_hash(&payload, &game.id) {
                Ok(h) => h,
                Err(e) => {
                    outcome.record_failure(unit, e);
                    continue;
                }
            };
            let signal = Signal {
                id: Uuid::new_v4().to_string(),
                game_id: game.id.clone(),
                source: SourceType::Injury.default_name().to_string(),
                payload,
                confidence: Some(INJURY_CONFIDENCE),
                content_hash: hash,
                timestamp: now,
            };
            match store.insert_signal(&signal).await {
                Ok(true) => outcome.record_success(),
                Ok(false) => {}
                Err(e) => outcome.record_failure(unit, e),
            }
        }

        if unmatched > 0 {
            tracing::debug!("{} injuries had no upcoming game", unmatched);
        }
        tracing::info!("Stored {} new injury signals", outcome.processed);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GameStatus;
    use chrono::Duration;

    const FEED: &str = r#"{
        "injuries": [
            {
                "displayName": "Kansas City Chiefs",
                "injuries": [
                    {
                        "status": "Out",
                        "athlete": { "displayName": "Patrick Mahomes", "position": { "abbreviation": "QB" } },
                        "details": { "type": "Ankle" }
                    },
                    { "status": "Questionable", "athlete": { "displayName": "Travis Kelce" } }
                ]
            },
            {
                "team": { "displayName": "Denver Broncos" },
                "injuries": [ { "status": "Active" } ]
            },
            { "injuries": [ { "status": "Out" } ] }
        ]
    }"#;

    #[test]
    fn parses_and_scores_the_feed() {
        let feed: InjuryFeed = serde_json::from_str(FEED).unwrap();
        let reports = parse_reports(feed);
        assert_eq!(reports.len(), 3);

        assert_eq!(reports[0].team, "Kansas City Chiefs");
        assert_eq!(reports[0].position, "QB");
        assert_eq!(reports[0].severity, Some(1.0));
        assert_eq!(reports[0].injury_type.as_deref(), Some("Ankle"));

        assert_eq!(reports[1].position, "N/A");
        assert_eq!(reports[1].severity, Some(0.5));

        assert_eq!(reports[2].team, "Denver Broncos");
        assert_eq!(reports[2].player, "Unknown");
        assert_eq!(reports[2].severity, None);
    }

    #[test]
    fn attaches_to_the_next_game() {
        let now = Utc::now();
        let game = |id: &str, home: &str, away: &str, days: i64| Game {
            id: id.to_string(),
            season: 2025,
            week: 1,
            home_team: home.to_string(),
            away_team: away.to_string(),
            kickoff_time: now + Duration::days(days),
            venue: None,
            status: GameStatus::Scheduled,
            home_score: None,
            away_score: None,
            schedule_change: false,
            created_at: now,
            updated_at: now,
        };
        let upcoming = vec![
            game("wk1", "Buffalo Bills", "Kansas City Chiefs", 2),
            game("wk2", "Kansas City Chiefs", "Denver Broncos", 9),
        ];
        assert_eq!(next_game_for("Kansas City Chiefs", &upcoming).unwrap().id, "wk1");
        assert_eq!(next_game_for("Denver Broncos", &upcoming).unwrap().id, "wk2");
        assert!(next_game_for("Seattle Seahawks", &upcoming).is_none());
    }
}
