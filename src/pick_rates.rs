use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Policy;
use crate::error::EngineError;
use crate::store::{self, MatchRecord, Observation, bool_to_i64, placeholders};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundContext {
    Round1Doubles,
    Round2Singles,
    Round3Singles,
    Round4Doubles,
}

impl RoundContext {
    pub const ALL: [RoundContext; 4] = [
        RoundContext::Round1Doubles,
        RoundContext::Round2Singles,
        RoundContext::Round3Singles,
        RoundContext::Round4Doubles,
    ];

    pub fn from_round(round_number: u8) -> Result<Self, EngineError> {
        match round_number {
            1 => Ok(RoundContext::Round1Doubles),
            2 => Ok(RoundContext::Round2Singles),
            3 => Ok(RoundContext::Round3Singles),
            4 => Ok(RoundContext::Round4Doubles),
            other => Err(EngineError::InvalidRound(other)),
        }
    }

    pub fn round_number(self) -> u8 {
        match self {
            RoundContext::Round1Doubles => 1,
            RoundContext::Round2Singles => 2,
            RoundContext::Round3Singles => 3,
            RoundContext::Round4Doubles => 4,
        }
    }

    /// League rule: away picks rounds 1 and 3, home picks rounds 2 and 4.
    pub fn home_selects(self) -> bool {
        matches!(
            self,
            RoundContext::Round2Singles | RoundContext::Round4Doubles
        )
    }

    pub fn is_doubles(self) -> bool {
        matches!(
            self,
            RoundContext::Round1Doubles | RoundContext::Round4Doubles
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoundContext::Round1Doubles => "round1_doubles",
            RoundContext::Round2Singles => "round2_singles",
            RoundContext::Round3Singles => "round3_singles",
            RoundContext::Round4Doubles => "round4_doubles",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ctx| ctx.as_str() == raw)
    }

    pub fn selector<'a>(self, m: &'a MatchRecord) -> &'a str {
        if self.home_selects() {
            &m.home_team_id
        } else {
            &m.away_team_id
        }
    }
}

impl fmt::Display for RoundContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PickRecord {
    pub season: u32,
    pub team_id: String,
    pub machine_id: String,
    pub round_context: RoundContext,
    pub is_home: bool,
    pub opportunities: u32,
    pub times_picked: u32,
}

pub fn compute_season_picks(
    matches: &[MatchRecord],
    observations: &[Observation],
    equipment: &HashMap<String, BTreeSet<String>>,
    season: u32,
) -> Result<Vec<PickRecord>> {
    let mut played: HashMap<&str, BTreeMap<u8, BTreeSet<&str>>> = HashMap::new();
    for obs in observations.iter().filter(|o| o.season == season) {
        played
            .entry(obs.match_id.as_str())
            .or_default()
            .entry(obs.round_number)
            .or_default()
            .insert(obs.machine_id.as_str());
    }

    let empty = BTreeSet::new();
    let mut counts: BTreeMap<(String, String, RoundContext), (u32, u32)> = BTreeMap::new();
    for m in matches.iter().filter(|m| m.season == season && m.completed) {
        let Some(rounds) = played.get(m.match_id.as_str()) else {
            debug!(match_id = %m.match_id, "completed match has no observations");
            continue;
        };
        let mut available: BTreeSet<&str> = equipment
            .get(&m.venue_id)
            .unwrap_or(&empty)
            .iter()
            .map(String::as_str)
            .collect();
        for machines in rounds.values() {
            available.extend(machines.iter().copied());
        }

        for (&round_number, picked) in rounds {
            let ctx = RoundContext::from_round(round_number)?;
            let selector = ctx.selector(m);
            for machine in &available {
                let entry = counts
                    .entry((selector.to_string(), machine.to_string(), ctx))
                    .or_insert((0, 0));
                entry.0 += 1;
                if picked.contains(machine) {
                    entry.1 += 1;
                }
            }
        }
    }

    let rows = counts
        .into_iter()
        .map(
            |((team_id, machine_id, round_context), (opportunities, times_picked))| PickRecord {
                season,
                team_id,
                machine_id,
                round_context,
                is_home: round_context.home_selects(),
                opportunities,
                times_picked,
            },
        )
        .collect::<Vec<_>>();
    validate_records(&rows)?;
    Ok(rows)
}

pub fn validate_records(rows: &[PickRecord]) -> Result<()> {
    for row in rows {
        if row.times_picked > row.opportunities {
            return Err(EngineError::integrity(
                format!(
                    "pick record {}/{}/{}/{}",
                    row.season, row.team_id, row.machine_id, row.round_context
                ),
                format!(
                    "times_picked {} exceeds opportunities {}",
                    row.times_picked, row.opportunities
                ),
            )
            .into());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct PickRunSummary {
    pub season: u32,
    pub matches: usize,
    pub rows_written: usize,
}

pub fn replace_season(tx: &Transaction<'_>, season: u32, rows: &[PickRecord]) -> Result<usize> {
    validate_records(rows)?;
    tx.execute(
        "DELETE FROM pick_records WHERE season = ?1",
        params![season as i64],
    )
    .context("delete season pick records")?;

    let mut stmt = tx
        .prepare(
            "INSERT INTO pick_records (
                season, team_id, machine_id, round_context, is_home, opportunities, times_picked
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .context("prepare insert pick record")?;
    for row in rows {
        stmt.execute(params![
            row.season as i64,
            row.team_id,
            row.machine_id,
            row.round_context.as_str(),
            bool_to_i64(row.is_home),
            row.opportunities as i64,
            row.times_picked as i64,
        ])
        .with_context(|| {
            format!(
                "insert pick record {}/{}/{}",
                row.team_id, row.machine_id, row.round_context
            )
        })?;
    }
    Ok(rows.len())
}

pub fn recompute_in(tx: &Transaction<'_>, season: u32) -> Result<PickRunSummary> {
    let matches = store::load_season_matches(tx, season)?;
    let observations = store::load_season_observations(tx, season)?;
    let equipment = store::load_season_equipment(tx, season)?;
    let rows = compute_season_picks(&matches, &observations, &equipment, season)?;
    let written = replace_season(tx, season, &rows)?;
    Ok(PickRunSummary {
        season,
        matches: matches.len(),
        rows_written: written,
    })
}

pub fn recompute_season(conn: &mut Connection, season: u32) -> Result<PickRunSummary> {
    let tx = conn.transaction().context("begin pick records transaction")?;
    let summary = recompute_in(&tx, season)?;
    tx.commit().context("commit pick records transaction")?;
    info!(
        season,
        matches = summary.matches,
        rows = summary.rows_written,
        "pick records recomputed"
    );
    Ok(summary)
}

pub fn load_pick_records(
    conn: &Connection,
    team_id: &str,
    round_context: RoundContext,
    seasons: &[u32],
) -> Result<Vec<PickRecord>> {
    if seasons.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        r#"
        SELECT season, team_id, machine_id, round_context, is_home, opportunities, times_picked
        FROM pick_records
        WHERE team_id = ? AND round_context = ? AND season IN ({})
        ORDER BY machine_id ASC, season ASC
        "#,
        placeholders(seasons.len())
    );
    let mut values: Vec<rusqlite::types::Value> = vec![
        team_id.to_string().into(),
        round_context.as_str().to_string().into(),
    ];
    values.extend(seasons.iter().map(|s| rusqlite::types::Value::from(*s as i64)));

    let mut stmt = conn.prepare(&sql).context("prepare load pick records query")?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| {
            let ctx_raw: String = row.get(3)?;
            Ok(PickRecord {
                season: row.get::<_, u32>(0)?,
                team_id: row.get(1)?,
                machine_id: row.get(2)?,
                round_context: RoundContext::parse(&ctx_raw).unwrap_or(round_context),
                is_home: row.get::<_, i64>(4)? != 0,
                opportunities: row.get::<_, u32>(5)?,
                times_picked: row.get::<_, u32>(6)?,
            })
        })
        .context("query load pick records")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode pick record row")?);
    }
    Ok(out)
}

pub fn pool_pick_records(records: &[PickRecord]) -> BTreeMap<String, (u32, u32)> {
    let mut pooled: BTreeMap<String, (u32, u32)> = BTreeMap::new();
    for r in records {
        let entry = pooled.entry(r.machine_id.clone()).or_insert((0, 0));
        entry.0 += r.opportunities;
        entry.1 += r.times_picked;
    }
    pooled
}

/// `round(100 * picked / opportunities)`, half up, in integers.
pub fn confidence_pct(times_picked: u32, opportunities: u32) -> u32 {
    if opportunities == 0 {
        return 0;
    }
    let picked = u64::from(times_picked);
    let opps = u64::from(opportunities);
    ((200 * picked + opps) / (2 * opps)) as u32
}

#[derive(Debug, Clone)]
pub struct PickQuery {
    pub team_id: String,
    pub round_context: RoundContext,
    pub venue_id: String,
    pub seasons: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PickPrediction {
    pub machine_id: String,
    pub opportunities: u32,
    pub times_picked: u32,
    pub confidence_pct: u32,
}

pub fn predict_picks(
    conn: &Connection,
    query: &PickQuery,
    policy: &Policy,
) -> Result<Vec<PickPrediction>> {
    let records = load_pick_records(conn, &query.team_id, query.round_context, &query.seasons)?;
    let available = store::current_venue_machines(conn, &query.venue_id)?;
    Ok(rank_picks(&records, &available, policy))
}

pub fn rank_picks(
    records: &[PickRecord],
    available: &BTreeSet<String>,
    policy: &Policy,
) -> Vec<PickPrediction> {
    let mut out = pool_pick_records(records)
        .into_iter()
        .filter(|(machine, _)| available.contains(machine))
        .filter(|(_, (opps, _))| *opps >= policy.min_pick_opportunities)
        .map(|(machine_id, (opportunities, times_picked))| PickPrediction {
            machine_id,
            opportunities,
            times_picked,
            confidence_pct: confidence_pct(times_picked, opportunities),
        })
        .collect::<Vec<_>>();
    out.sort_by(|a, b| {
        b.confidence_pct
            .cmp(&a.confidence_pct)
            .then(b.times_picked.cmp(&a.times_picked))
            .then(a.machine_id.cmp(&b.machine_id))
    });
    out
}
