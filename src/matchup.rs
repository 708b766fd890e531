use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Policy;
use crate::entity_stats::{self, EntityKind, PooledStat};
use crate::percentiles::{self, PercentileCurve};
use crate::store::{self, VenueScope};

#[derive(Debug, Clone)]
pub struct MatchupRequest {
    pub venue_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    pub seasons: Vec<u32>,
    pub home_roster: Option<Vec<String>>,
    pub away_roster: Option<Vec<String>>,
}

/// How a team-level figure was derived. The lineup is never known in advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBasis {
    HeuristicRoster,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerMachineEstimate {
    pub player_id: String,
    pub team_id: String,
    pub machine_id: String,
    pub games_played: u32,
    pub expected_score: f64,
    pub confidence_low: f64,
    pub confidence_high: f64,
    pub expected_percentile: Option<f64>,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamMachineEstimate {
    pub machine_id: String,
    pub player_ids: Vec<String>,
    pub expected_score: f64,
    pub confidence_low: f64,
    pub confidence_high: f64,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamConfidence {
    pub team_id: String,
    pub confidence_basis: ConfidenceBasis,
    pub machines: Vec<TeamMachineEstimate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchupPrediction {
    pub venue_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    pub seasons_analyzed: Vec<u32>,
    pub per_player: Vec<PlayerMachineEstimate>,
    pub team_confidence: Vec<TeamConfidence>,
}

pub fn predict_matchup(
    conn: &Connection,
    request: &MatchupRequest,
    policy: &Policy,
) -> Result<MatchupPrediction> {
    if request.seasons.is_empty() {
        return Err(anyhow!("matchup needs at least one season"));
    }
    let mut seasons = request.seasons.clone();
    seasons.sort_unstable();
    seasons.dedup();

    let machines = store::current_venue_machines(conn, &request.venue_id)?;
    if machines.is_empty() {
        debug!(venue = %request.venue_id, "venue has no equipment list");
    }
    let curves = percentiles::newest_curves(conn, &VenueScope::All, &seasons)?;

    let mut per_player = Vec::new();
    let mut team_confidence = Vec::new();
    for (team_id, roster) in [
        (&request.home_team_id, &request.home_roster),
        (&request.away_team_id, &request.away_roster),
    ] {
        let roster = match roster {
            Some(explicit) => explicit.clone(),
            None => store::team_roster(conn, team_id, &seasons)?,
        };
        let mut team_estimates = Vec::new();
        for player_id in &roster {
            let rows = entity_stats::load_entity_stats(
                conn,
                EntityKind::Player,
                player_id,
                &seasons,
                Some(&VenueScope::All),
            )?;
            for (machine_id, pooled) in entity_stats::pool_by_machine(&rows, &curves) {
                if !machines.contains(&machine_id) {
                    continue;
                }
                let spread = curves.get(&machine_id).and_then(PercentileCurve::spread_sigma);
                team_estimates.push(player_estimate(player_id, team_id, &pooled, spread, policy));
            }
        }
        team_confidence.push(team_rollup(team_id, &team_estimates, policy));
        per_player.extend(team_estimates);
    }

    info!(
        venue = %request.venue_id,
        home = %request.home_team_id,
        away = %request.away_team_id,
        estimates = per_player.len(),
        "matchup prediction built"
    );

    Ok(MatchupPrediction {
        venue_id: request.venue_id.clone(),
        home_team_id: request.home_team_id.clone(),
        away_team_id: request.away_team_id.clone(),
        seasons_analyzed: seasons,
        per_player,
        team_confidence,
    })
}

pub fn player_estimate(
    player_id: &str,
    team_id: &str,
    pooled: &PooledStat,
    machine_spread: Option<f64>,
    policy: &Policy,
) -> PlayerMachineEstimate {
    let n = pooled.games_played.max(1);
    let expected = pooled.median_score;
    let sigma = pooled
        .score_stddev
        .filter(|s| *s > 0.0)
        .or(machine_spread)
        .unwrap_or(expected.abs());
    let mut half_width = policy.z_critical * sigma / f64::from(n).sqrt();
    let low_confidence = n < policy.small_sample_games;
    if low_confidence {
        half_width *= policy.small_sample_widening;
    }
    PlayerMachineEstimate {
        player_id: player_id.to_string(),
        team_id: team_id.to_string(),
        machine_id: pooled.machine_id.clone(),
        games_played: pooled.games_played,
        expected_score: expected,
        confidence_low: (expected - half_width).max(0.0),
        confidence_high: expected + half_width,
        expected_percentile: pooled.median_percentile,
        low_confidence,
    }
}

pub fn team_rollup(
    team_id: &str,
    estimates: &[PlayerMachineEstimate],
    policy: &Policy,
) -> TeamConfidence {
    let mut by_machine: BTreeMap<&str, Vec<&PlayerMachineEstimate>> = BTreeMap::new();
    for e in estimates.iter().filter(|e| e.team_id == team_id) {
        by_machine.entry(e.machine_id.as_str()).or_default().push(e);
    }

    let k = policy.fielded_players_per_machine.max(1);
    let machines = by_machine
        .into_iter()
        .map(|(machine_id, mut group)| {
            group.sort_by(|a, b| {
                b.games_played
                    .cmp(&a.games_played)
                    .then(a.player_id.cmp(&b.player_id))
            });
            group.truncate(k);
            let count = group.len() as f64;
            let expected = group.iter().map(|e| e.expected_score).sum::<f64>() / count;
            let half_sq = group
                .iter()
                .map(|e| (e.confidence_high - e.expected_score).powi(2))
                .sum::<f64>();
            let half_width = half_sq.sqrt() / count;
            TeamMachineEstimate {
                machine_id: machine_id.to_string(),
                player_ids: group.iter().map(|e| e.player_id.clone()).collect(),
                expected_score: expected,
                confidence_low: (expected - half_width).max(0.0),
                confidence_high: expected + half_width,
                low_confidence: group.iter().any(|e| e.low_confidence),
            }
        })
        .collect();

    TeamConfidence {
        team_id: team_id.to_string(),
        confidence_basis: ConfidenceBasis::HeuristicRoster,
        machines,
    }
}
