use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::{Context, Result, anyhow};
use rayon::prelude::*;
use rusqlite::{Connection, Transaction, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::percentiles::{self, PercentileCurve, interpolated_percentile};
use crate::store::{self, Observation, VenueScope, placeholders};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Player,
    Team,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Player => "player",
            EntityKind::Team => "team",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "player" => Some(EntityKind::Player),
            "team" => Some(EntityKind::Team),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityMachineStat {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub machine_id: String,
    pub venue: VenueScope,
    pub season: u32,
    pub games_played: u32,
    pub median_score: f64,
    pub avg_score: f64,
    pub best_score: i64,
    pub worst_score: i64,
    pub score_stddev: Option<f64>,
    /// `None` means no thresholds existed for this scope when the row was built.
    pub median_percentile: Option<f64>,
    pub avg_percentile: Option<f64>,
    /// Either rank fell outside the stored thresholds and was extrapolated.
    pub percentile_extrapolated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreSummary {
    pub games: u32,
    pub median: f64,
    pub mean: f64,
    pub best: i64,
    pub worst: i64,
    pub stddev: Option<f64>,
}

pub fn summarize_scores(scores: &[i64]) -> Option<ScoreSummary> {
    let best = *scores.iter().max()?;
    let worst = *scores.iter().min()?;
    let mut sorted = scores.iter().map(|s| *s as f64).collect::<Vec<_>>();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len() as f64;
    let mean = sorted.iter().sum::<f64>() / n;
    let median = interpolated_percentile(&sorted, 50.0)?;
    let stddev = (sorted.len() >= 2).then(|| {
        let ss = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
        (ss / (n - 1.0)).sqrt()
    });
    Some(ScoreSummary {
        games: sorted.len() as u32,
        median,
        mean,
        best,
        worst,
        stddev,
    })
}

type GroupKey = (EntityKind, String, String, VenueScope);

pub fn compute_entity_stats(
    observations: &[Observation],
    season: u32,
    curves: &HashMap<(String, VenueScope), PercentileCurve>,
) -> Vec<EntityMachineStat> {
    let mut groups: HashMap<GroupKey, Vec<i64>> = HashMap::new();
    for obs in observations.iter().filter(|o| o.season == season) {
        for (kind, entity_id) in [
            (EntityKind::Player, &obs.player_id),
            (EntityKind::Team, &obs.team_id),
        ] {
            for venue in [VenueScope::Venue(obs.venue_id.clone()), VenueScope::All] {
                groups
                    .entry((kind, entity_id.clone(), obs.machine_id.clone(), venue))
                    .or_default()
                    .push(obs.score);
            }
        }
    }

    let mut rows = groups
        .into_par_iter()
        .filter_map(|((kind, entity_id, machine_id, venue), scores)| {
            let summary = summarize_scores(&scores)?;
            let curve = curves.get(&(machine_id.clone(), venue.clone()));
            let (median_percentile, avg_percentile, percentile_extrapolated) =
                match curve {
                    Some(curve) => {
                        let median_pos = curve.rank_of(summary.median);
                        let avg_pos = curve.rank_of(summary.mean);
                        let extrapolated =
                            median_pos.is_extrapolated() || avg_pos.is_extrapolated();
                        if extrapolated {
                            debug!(
                                entity = %entity_id,
                                machine = %machine_id,
                                venue = %venue,
                                bound = ?median_pos.bound,
                                "percentile extrapolated"
                            );
                        }
                        (Some(median_pos.rank), Some(avg_pos.rank), extrapolated)
                    }
                    None => (None, None, false),
                };
            Some(EntityMachineStat {
                entity_kind: kind,
                entity_id,
                machine_id,
                venue,
                season,
                games_played: summary.games,
                median_score: summary.median,
                avg_score: summary.mean,
                best_score: summary.best,
                worst_score: summary.worst,
                score_stddev: summary.stddev,
                median_percentile,
                avg_percentile,
                percentile_extrapolated,
            })
        })
        .collect::<Vec<_>>();

    rows.sort_by(|a, b| {
        (a.entity_kind, &a.entity_id, &a.machine_id, &a.venue).cmp(&(
            b.entity_kind,
            &b.entity_id,
            &b.machine_id,
            &b.venue,
        ))
    });
    rows
}

#[derive(Debug, Clone, Default)]
pub struct EntityRunSummary {
    pub season: u32,
    pub observations: usize,
    pub rows_written: usize,
    pub rows_with_percentiles: usize,
    pub rows_missing_percentiles: usize,
}

pub fn replace_season(tx: &Transaction<'_>, season: u32, rows: &[EntityMachineStat]) -> Result<usize> {
    tx.execute(
        "DELETE FROM entity_machine_stats WHERE season = ?1",
        params![season as i64],
    )
    .context("delete season entity stats")?;

    let mut stmt = tx
        .prepare(
            "INSERT INTO entity_machine_stats (
                entity_kind, entity_id, machine_id, venue_key, season, games_played,
                median_score, avg_score, best_score, worst_score, score_stddev,
                median_percentile, avg_percentile, percentile_extrapolated
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .context("prepare insert entity stat")?;
    for row in rows {
        if row.season != season {
            return Err(anyhow!(
                "entity stat for season {} passed to season {season} replace",
                row.season
            ));
        }
        stmt.execute(params![
            row.entity_kind.as_str(),
            row.entity_id,
            row.machine_id,
            row.venue.key(),
            row.season as i64,
            row.games_played as i64,
            row.median_score,
            row.avg_score,
            row.best_score,
            row.worst_score,
            row.score_stddev,
            row.median_percentile,
            row.avg_percentile,
            store::bool_to_i64(row.percentile_extrapolated),
        ])
        .with_context(|| {
            format!(
                "insert entity stat {}:{} {}/{}",
                row.entity_kind, row.entity_id, row.machine_id, row.venue
            )
        })?;
    }
    Ok(rows.len())
}

pub fn recompute_in(tx: &Transaction<'_>, season: u32) -> Result<EntityRunSummary> {
    let observations = store::load_season_observations(tx, season)?;
    let curves = percentiles::load_curves(tx, season)?;
    if curves.is_empty() && !observations.is_empty() {
        warn!(
            season,
            "no percentile thresholds for season; percentile fields will be null"
        );
    }
    let rows = compute_entity_stats(&observations, season, &curves);
    let with_pct = rows.iter().filter(|r| r.median_percentile.is_some()).count();
    let written = replace_season(tx, season, &rows)?;
    Ok(EntityRunSummary {
        season,
        observations: observations.len(),
        rows_written: written,
        rows_with_percentiles: with_pct,
        rows_missing_percentiles: written - with_pct,
    })
}

pub fn recompute_season(conn: &mut Connection, season: u32) -> Result<EntityRunSummary> {
    let tx = conn.transaction().context("begin entity stats transaction")?;
    let summary = recompute_in(&tx, season)?;
    tx.commit().context("commit entity stats transaction")?;
    info!(
        season,
        rows = summary.rows_written,
        with_percentiles = summary.rows_with_percentiles,
        missing_percentiles = summary.rows_missing_percentiles,
        "entity stats recomputed"
    );
    Ok(summary)
}

pub fn load_entity_stats(
    conn: &Connection,
    kind: EntityKind,
    entity_id: &str,
    seasons: &[u32],
    venue: Option<&VenueScope>,
) -> Result<Vec<EntityMachineStat>> {
    if seasons.is_empty() {
        return Ok(Vec::new());
    }
    let mut sql = format!(
        r#"
        SELECT entity_kind, entity_id, machine_id, venue_key, season, games_played,
               median_score, avg_score, best_score, worst_score, score_stddev,
               median_percentile, avg_percentile, percentile_extrapolated
        FROM entity_machine_stats
        WHERE entity_kind = ? AND entity_id = ? AND season IN ({})
        "#,
        placeholders(seasons.len())
    );
    let mut values: Vec<rusqlite::types::Value> = vec![
        kind.as_str().to_string().into(),
        entity_id.to_string().into(),
    ];
    values.extend(seasons.iter().map(|s| rusqlite::types::Value::from(*s as i64)));
    if let Some(venue) = venue {
        sql.push_str(" AND venue_key = ?");
        values.push(venue.key().to_string().into());
    }
    sql.push_str(" ORDER BY machine_id ASC, venue_key ASC, season ASC");

    let mut stmt = conn.prepare(&sql).context("prepare load entity stats query")?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| {
            let kind_raw: String = row.get(0)?;
            Ok(EntityMachineStat {
                entity_kind: EntityKind::parse(&kind_raw).unwrap_or(kind),
                entity_id: row.get(1)?,
                machine_id: row.get(2)?,
                venue: VenueScope::from_key(&row.get::<_, String>(3)?),
                season: row.get::<_, u32>(4)?,
                games_played: row.get::<_, u32>(5)?,
                median_score: row.get(6)?,
                avg_score: row.get(7)?,
                best_score: row.get(8)?,
                worst_score: row.get(9)?,
                score_stddev: row.get(10)?,
                median_percentile: row.get(11)?,
                avg_percentile: row.get(12)?,
                percentile_extrapolated: row.get::<_, i64>(13)? != 0,
            })
        })
        .context("query load entity stats")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode entity stat row")?);
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PooledStat {
    pub machine_id: String,
    pub games_played: u32,
    pub seasons: Vec<u32>,
    pub median_score: f64,
    pub avg_score: f64,
    pub best_score: i64,
    pub worst_score: i64,
    pub score_stddev: Option<f64>,
    pub median_percentile: Option<f64>,
    pub avg_percentile: Option<f64>,
    pub percentile_extrapolated: bool,
}

/// Pools rows that share a machine. Scores are combined first, then ranked on
/// `curve` (stored per-season ranks are never averaged).
pub fn pool_stats(
    rows: &[&EntityMachineStat],
    curve: Option<&PercentileCurve>,
) -> Option<PooledStat> {
    let first = rows.first()?;
    let total: u32 = rows.iter().map(|r| r.games_played).sum();
    if total == 0 {
        return None;
    }
    let n = f64::from(total);
    let mean = rows
        .iter()
        .map(|r| r.avg_score * f64::from(r.games_played))
        .sum::<f64>()
        / n;
    let median = rows
        .iter()
        .map(|r| r.median_score * f64::from(r.games_played))
        .sum::<f64>()
        / n;

    // Parallel-axis combination of per-season sample variances.
    let stddev = (total >= 2).then(|| {
        let ss = rows
            .iter()
            .map(|r| {
                let games = f64::from(r.games_played);
                let within = r.score_stddev.map_or(0.0, |s| s * s * (games - 1.0).max(0.0));
                within + games * (r.avg_score - mean).powi(2)
            })
            .sum::<f64>();
        (ss / (n - 1.0)).sqrt()
    });

    let mut seasons = rows.iter().map(|r| r.season).collect::<Vec<_>>();
    seasons.sort_unstable();
    seasons.dedup();

    let median_pos = curve.map(|c| c.rank_of(median));
    let avg_pos = curve.map(|c| c.rank_of(mean));

    Some(PooledStat {
        machine_id: first.machine_id.clone(),
        games_played: total,
        seasons,
        median_score: median,
        avg_score: mean,
        best_score: rows.iter().map(|r| r.best_score).max().unwrap_or(first.best_score),
        worst_score: rows.iter().map(|r| r.worst_score).min().unwrap_or(first.worst_score),
        score_stddev: stddev,
        median_percentile: median_pos.map(|p| p.rank),
        avg_percentile: avg_pos.map(|p| p.rank),
        percentile_extrapolated: median_pos.is_some_and(|p| p.is_extrapolated())
            || avg_pos.is_some_and(|p| p.is_extrapolated()),
    })
}

pub fn pool_by_machine(
    rows: &[EntityMachineStat],
    curves: &BTreeMap<String, PercentileCurve>,
) -> BTreeMap<String, PooledStat> {
    let mut by_machine: BTreeMap<&str, Vec<&EntityMachineStat>> = BTreeMap::new();
    for row in rows {
        by_machine.entry(row.machine_id.as_str()).or_default().push(row);
    }
    by_machine
        .into_iter()
        .filter_map(|(machine, group)| {
            pool_stats(&group, curves.get(machine)).map(|p| (machine.to_string(), p))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct BestMachinesQuery {
    pub kind: EntityKind,
    pub entity_id: String,
    pub seasons: Vec<u32>,
    pub venue: VenueScope,
    pub min_games: u32,
    pub limit: usize,
}

pub fn best_machines(conn: &Connection, query: &BestMachinesQuery) -> Result<Vec<PooledStat>> {
    let rows = load_entity_stats(
        conn,
        query.kind,
        &query.entity_id,
        &query.seasons,
        Some(&query.venue),
    )?;
    let curves = percentiles::newest_curves(conn, &query.venue, &query.seasons)?;
    let mut ranked = pool_by_machine(&rows, &curves)
        .into_values()
        .filter(|p| p.games_played >= query.min_games)
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| {
        let pa = a.median_percentile.unwrap_or(f64::NEG_INFINITY);
        let pb = b.median_percentile.unwrap_or(f64::NEG_INFINITY);
        pb.total_cmp(&pa)
            .then(b.games_played.cmp(&a.games_played))
            .then(a.machine_id.cmp(&b.machine_id))
    });
    if query.limit > 0 {
        ranked.truncate(query.limit);
    }
    Ok(ranked)
}
