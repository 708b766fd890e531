use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, params};
use tracing::{debug, info};

use crate::config::Policy;
use crate::error::EngineError;
use crate::store::{self, Observation, VenueScope};

#[derive(Debug, Clone, PartialEq)]
pub struct PercentileThreshold {
    pub machine_id: String,
    pub venue: VenueScope,
    pub season: u32,
    pub percentile_rank: u8,
    pub score_value: f64,
    pub sample_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PercentileRunSummary {
    pub season: u32,
    pub observations: usize,
    pub groups_written: usize,
    pub groups_skipped: usize,
    pub rows_written: usize,
}

/// Linear interpolation between the two order statistics around
/// `rank/100 * (n-1)`. `None` for an empty slice.
pub fn interpolated_percentile(sorted: &[f64], rank: f64) -> Option<f64> {
    let first = *sorted.first()?;
    if sorted.len() == 1 {
        return Some(first);
    }
    let last_idx = sorted.len() - 1;
    let pos = (rank.clamp(0.0, 100.0) / 100.0) * last_idx as f64;
    let lower = (pos.floor() as usize).min(last_idx);
    let upper = (lower + 1).min(last_idx);
    let frac = pos - lower as f64;
    let lo = sorted[lower];
    let hi = sorted[upper];
    // lo + (hi - lo) * frac stays inside [lo, hi] up to rounding; clamp the rest.
    Some((lo + (hi - lo) * frac).clamp(lo, hi))
}

pub fn compute_group_thresholds(
    machine_id: &str,
    venue: &VenueScope,
    season: u32,
    scores: &[f64],
    policy: &Policy,
) -> Vec<PercentileThreshold> {
    if scores.is_empty() || scores.len() < policy.min_percentile_sample {
        return Vec::new();
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(f64::total_cmp);

    policy
        .percentile_ranks
        .iter()
        .filter_map(|&rank| {
            let score_value = interpolated_percentile(&sorted, f64::from(rank))?;
            Some(PercentileThreshold {
                machine_id: machine_id.to_string(),
                venue: venue.clone(),
                season,
                percentile_rank: rank,
                score_value,
                sample_size: sorted.len(),
            })
        })
        .collect()
}

pub fn compute_season_thresholds(
    observations: &[Observation],
    season: u32,
    policy: &Policy,
    machine: Option<&str>,
) -> (Vec<PercentileThreshold>, usize) {
    let mut groups: BTreeMap<(String, VenueScope), Vec<f64>> = BTreeMap::new();
    for obs in observations {
        if obs.season != season {
            continue;
        }
        if machine.is_some_and(|m| m != obs.machine_id) {
            continue;
        }
        let score = obs.score as f64;
        groups
            .entry((
                obs.machine_id.clone(),
                VenueScope::Venue(obs.venue_id.clone()),
            ))
            .or_default()
            .push(score);
        groups
            .entry((obs.machine_id.clone(), VenueScope::All))
            .or_default()
            .push(score);
    }

    let mut out = Vec::new();
    let mut skipped = 0usize;
    for ((machine_id, venue), scores) in &groups {
        let rows = compute_group_thresholds(machine_id, venue, season, scores, policy);
        if rows.is_empty() {
            debug!(
                machine = %machine_id,
                venue = %venue,
                season,
                sample = scores.len(),
                "percentile group below minimum sample, skipped"
            );
            skipped += 1;
            continue;
        }
        out.extend(rows);
    }
    (out, skipped)
}

pub fn validate_thresholds(rows: &[PercentileThreshold]) -> Result<()> {
    let mut groups: BTreeMap<(&str, &VenueScope, u32), Vec<(u8, f64)>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.machine_id.as_str(), &row.venue, row.season))
            .or_default()
            .push((row.percentile_rank, row.score_value));
    }
    for ((machine_id, venue, season), points) in groups {
        let points = points
            .into_iter()
            .map(|(rank, value)| (f64::from(rank), value))
            .collect::<Vec<_>>();
        PercentileCurve::new(points, 0).map_err(|detail| {
            EngineError::integrity(format!("thresholds {machine_id}/{venue}/{season}"), detail)
        })?;
    }
    Ok(())
}

pub fn replace_thresholds(
    tx: &Transaction<'_>,
    season: u32,
    machine: Option<&str>,
    rows: &[PercentileThreshold],
) -> Result<usize> {
    validate_thresholds(rows)?;
    match machine {
        Some(machine_id) => tx
            .execute(
                "DELETE FROM percentile_thresholds WHERE season = ?1 AND machine_id = ?2",
                params![season as i64, machine_id],
            )
            .context("delete machine thresholds")?,
        None => tx
            .execute(
                "DELETE FROM percentile_thresholds WHERE season = ?1",
                params![season as i64],
            )
            .context("delete season thresholds")?,
    };

    let mut stmt = tx
        .prepare(
            "INSERT INTO percentile_thresholds (
                machine_id, venue_key, season, percentile_rank, score_value, sample_size
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .context("prepare insert threshold")?;
    for row in rows {
        stmt.execute(params![
            row.machine_id,
            row.venue.key(),
            row.season as i64,
            row.percentile_rank as i64,
            row.score_value,
            row.sample_size as i64,
        ])
        .with_context(|| {
            format!(
                "insert threshold {}/{}/{} p{}",
                row.machine_id, row.venue, row.season, row.percentile_rank
            )
        })?;
    }
    Ok(rows.len())
}

pub fn recompute_in(
    tx: &Transaction<'_>,
    season: u32,
    machine: Option<&str>,
    policy: &Policy,
) -> Result<PercentileRunSummary> {
    let observations = store::load_season_observations(tx, season)?;
    let (rows, skipped) = compute_season_thresholds(&observations, season, policy, machine);
    let groups_written = rows.len() / policy.percentile_ranks.len().max(1);
    let written = replace_thresholds(tx, season, machine, &rows)?;
    Ok(PercentileRunSummary {
        season,
        observations: observations.len(),
        groups_written,
        groups_skipped: skipped,
        rows_written: written,
    })
}

pub fn recompute_season(
    conn: &mut Connection,
    season: u32,
    policy: &Policy,
) -> Result<PercentileRunSummary> {
    let tx = conn.transaction().context("begin percentile transaction")?;
    let summary = recompute_in(&tx, season, None, policy)?;
    tx.commit().context("commit percentile transaction")?;
    info!(
        season,
        groups = summary.groups_written,
        skipped = summary.groups_skipped,
        rows = summary.rows_written,
        "percentile thresholds recomputed"
    );
    Ok(summary)
}

pub fn recompute_machine(
    conn: &mut Connection,
    season: u32,
    machine_id: &str,
    policy: &Policy,
) -> Result<PercentileRunSummary> {
    let tx = conn.transaction().context("begin percentile transaction")?;
    let summary = recompute_in(&tx, season, Some(machine_id), policy)?;
    tx.commit().context("commit percentile transaction")?;
    info!(
        season,
        machine = machine_id,
        groups = summary.groups_written,
        rows = summary.rows_written,
        "machine percentile thresholds recomputed"
    );
    Ok(summary)
}

pub fn load_thresholds(conn: &Connection, season: u32) -> Result<Vec<PercentileThreshold>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT machine_id, venue_key, season, percentile_rank, score_value, sample_size
            FROM percentile_thresholds
            WHERE season = ?1
            ORDER BY machine_id ASC, venue_key ASC, percentile_rank ASC
            "#,
        )
        .context("prepare load thresholds query")?;
    let rows = stmt
        .query_map(params![season as i64], |row| {
            Ok(PercentileThreshold {
                machine_id: row.get(0)?,
                venue: VenueScope::from_key(&row.get::<_, String>(1)?),
                season: row.get::<_, u32>(2)?,
                percentile_rank: row.get::<_, u8>(3)?,
                score_value: row.get(4)?,
                sample_size: row.get::<_, i64>(5)? as usize,
            })
        })
        .context("query load thresholds")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode threshold row")?);
    }
    Ok(out)
}

pub fn load_curves(
    conn: &Connection,
    season: u32,
) -> Result<HashMap<(String, VenueScope), PercentileCurve>> {
    let rows = load_thresholds(conn, season)?;
    curves_from_rows(&rows)
}

pub fn load_curve(
    conn: &Connection,
    machine_id: &str,
    venue: &VenueScope,
    season: u32,
) -> Result<Option<PercentileCurve>> {
    let mut curves = load_curves(conn, season)?;
    Ok(curves.remove(&(machine_id.to_string(), venue.clone())))
}

pub fn newest_curves(
    conn: &Connection,
    venue: &VenueScope,
    seasons: &[u32],
) -> Result<BTreeMap<String, PercentileCurve>> {
    let mut ordered = seasons.to_vec();
    ordered.sort_unstable_by(|a, b| b.cmp(a));
    ordered.dedup();

    let mut out = BTreeMap::new();
    for season in ordered {
        for ((machine_id, scope), curve) in load_curves(conn, season)? {
            if &scope == venue && !out.contains_key(&machine_id) {
                out.insert(machine_id, curve);
            }
        }
    }
    Ok(out)
}

pub fn curves_from_rows(
    rows: &[PercentileThreshold],
) -> Result<HashMap<(String, VenueScope), PercentileCurve>> {
    let mut grouped: BTreeMap<(String, VenueScope), Vec<&PercentileThreshold>> = BTreeMap::new();
    for row in rows {
        grouped
            .entry((row.machine_id.clone(), row.venue.clone()))
            .or_default()
            .push(row);
    }
    let mut out = HashMap::new();
    for (key, group) in grouped {
        let sample_size = group.iter().map(|r| r.sample_size).max().unwrap_or(0);
        let mut points = group
            .iter()
            .map(|r| (f64::from(r.percentile_rank), r.score_value))
            .collect::<Vec<_>>();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let curve = PercentileCurve::new(points, sample_size).map_err(|detail| {
            EngineError::integrity(format!("stored thresholds {}/{}", key.0, key.1), detail)
        })?;
        out.insert(key, curve);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveBound {
    Interior,
    BelowFloor,
    AboveCeiling,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PercentilePosition {
    pub rank: f64,
    pub bound: CurveBound,
}

impl PercentilePosition {
    pub fn is_extrapolated(&self) -> bool {
        self.bound != CurveBound::Interior
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PercentileCurve {
    points: Vec<(f64, f64)>,
    sample_size: usize,
}

impl PercentileCurve {
    /// Points must be sorted by strictly increasing rank with non-decreasing,
    /// finite scores. The error string names the first offending point.
    pub fn new(points: Vec<(f64, f64)>, sample_size: usize) -> Result<Self, String> {
        if points.is_empty() {
            return Err("curve has no points".to_string());
        }
        if let Some((rank, value)) = points.iter().find(|(r, v)| !r.is_finite() || !v.is_finite()) {
            return Err(format!("non-finite point p{rank}={value}"));
        }
        for pair in points.windows(2) {
            let (r0, v0) = pair[0];
            let (r1, v1) = pair[1];
            if r1 <= r0 {
                return Err(format!("ranks not increasing at p{r0} -> p{r1}"));
            }
            if v1 < v0 {
                return Err(format!("non-monotonic thresholds p{r0}={v0} > p{r1}={v1}"));
            }
        }
        Ok(Self {
            points,
            sample_size,
        })
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn value_at(&self, rank: f64) -> Option<f64> {
        self.points
            .iter()
            .find(|(r, _)| (*r - rank).abs() < 1e-9)
            .map(|(_, v)| *v)
    }

    pub fn spread_sigma(&self) -> Option<f64> {
        let p25 = self.value_at(25.0)?;
        let p75 = self.value_at(75.0)?;
        let sigma = (p75 - p25) / 1.349;
        (sigma > 0.0).then_some(sigma)
    }

    pub fn rank_of(&self, score: f64) -> PercentilePosition {
        let (first_rank, first_value) = self.points[0];
        let (last_rank, last_value) = self.points[self.points.len() - 1];

        if score < first_value {
            let rank = if first_value > 0.0 {
                first_rank * (score.max(0.0) / first_value)
            } else {
                0.0
            };
            return PercentilePosition {
                rank: rank.clamp(0.0, first_rank),
                bound: CurveBound::BelowFloor,
            };
        }

        if score > last_value {
            let rank = match self.points.len() {
                1 => 100.0,
                n => {
                    let (prev_rank, prev_value) = self.points[n - 2];
                    let width = last_value - prev_value;
                    if width > 0.0 {
                        last_rank + (score - last_value) / width * (last_rank - prev_rank)
                    } else {
                        100.0
                    }
                }
            };
            return PercentilePosition {
                rank: rank.clamp(last_rank, 100.0),
                bound: CurveBound::AboveCeiling,
            };
        }

        // Exact hits on a run of equal thresholds take the middle of the run.
        let plateau = self
            .points
            .iter()
            .filter(|(_, v)| *v == score)
            .map(|(r, _)| *r)
            .collect::<Vec<_>>();
        if !plateau.is_empty() {
            let rank = plateau.iter().sum::<f64>() / plateau.len() as f64;
            return PercentilePosition {
                rank,
                bound: CurveBound::Interior,
            };
        }

        for pair in self.points.windows(2) {
            let (r0, v0) = pair[0];
            let (r1, v1) = pair[1];
            if score > v0 && score < v1 {
                let rank = r0 + (score - v0) / (v1 - v0) * (r1 - r0);
                return PercentilePosition {
                    rank: rank.clamp(r0, r1),
                    bound: CurveBound::Interior,
                };
            }
        }

        // Unreachable for a validated curve; report the ceiling rather than panic.
        PercentilePosition {
            rank: last_rank,
            bound: CurveBound::Interior,
        }
    }
}
