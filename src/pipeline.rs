use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::Policy;
use crate::entity_stats;
use crate::error::EngineError;
use crate::percentiles;
use crate::pick_rates;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    Percentiles,
    EntityStats,
    PickRates,
}

impl Job {
    pub const ALL: [Job; 3] = [Job::Percentiles, Job::EntityStats, Job::PickRates];

    pub fn upstream(self) -> &'static [Job] {
        match self {
            Job::Percentiles => &[],
            Job::EntityStats => &[Job::Percentiles],
            Job::PickRates => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Job::Percentiles => "percentiles",
            Job::EntityStats => "entity_stats",
            Job::PickRates => "pick_rates",
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Job {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Job::ALL
            .into_iter()
            .find(|job| job.as_str() == normalized)
            .ok_or_else(|| EngineError::UnknownJob(raw.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSnapshot {
    pub season: u32,
    pub fingerprint: String,
    pub observation_count: usize,
}

pub fn input_snapshot(conn: &Connection, season: u32) -> Result<InputSnapshot> {
    let mut hasher = Sha256::new();
    let mut observation_count = 0usize;

    let mut stmt = conn
        .prepare(
            "SELECT match_id, week, venue_id, home_team_id, away_team_id
             FROM matches WHERE season = ?1 AND completed = 1
             ORDER BY match_id ASC",
        )
        .context("prepare snapshot matches query")?;
    let mut rows = stmt
        .query(params![season as i64])
        .context("query snapshot matches")?;
    while let Some(row) = rows.next().context("read snapshot match row")? {
        let line = format!(
            "m|{}|{}|{}|{}|{}\n",
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        );
        hasher.update(line.as_bytes());
    }

    let mut stmt = conn
        .prepare(
            "SELECT o.match_id, o.round_number, o.game_number, o.player_id, o.team_id,
                    o.machine_id, o.venue_id, o.is_home, o.score
             FROM observations o
             JOIN matches m ON m.match_id = o.match_id
             WHERE o.season = ?1 AND m.completed = 1
             ORDER BY o.match_id ASC, o.round_number ASC, o.game_number ASC, o.player_id ASC",
        )
        .context("prepare snapshot observations query")?;
    let mut rows = stmt
        .query(params![season as i64])
        .context("query snapshot observations")?;
    while let Some(row) = rows.next().context("read snapshot observation row")? {
        let line = format!(
            "o|{}|{}|{}|{}|{}|{}|{}|{}|{}\n",
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, i64>(7)?,
            row.get::<_, i64>(8)?,
        );
        hasher.update(line.as_bytes());
        observation_count += 1;
    }

    let mut stmt = conn
        .prepare(
            "SELECT venue_id, machine_id FROM venue_machines WHERE season = ?1
             ORDER BY venue_id ASC, machine_id ASC",
        )
        .context("prepare snapshot equipment query")?;
    let mut rows = stmt
        .query(params![season as i64])
        .context("query snapshot equipment")?;
    while let Some(row) = rows.next().context("read snapshot equipment row")? {
        let line = format!(
            "v|{}|{}\n",
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?
        );
        hasher.update(line.as_bytes());
    }

    Ok(InputSnapshot {
        season,
        fingerprint: BASE64.encode(hasher.finalize()),
        observation_count,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    pub job: String,
    pub season: u32,
    pub input_fingerprint: String,
    pub observation_count: usize,
    pub computed_at: String,
}

pub fn last_run(conn: &Connection, job: Job, season: u32) -> Result<Option<JobRun>> {
    conn.query_row(
        "SELECT job, season, input_fingerprint, observation_count, computed_at
         FROM job_runs WHERE job = ?1 AND season = ?2",
        params![job.as_str(), season as i64],
        |row| {
            Ok(JobRun {
                job: row.get(0)?,
                season: row.get::<_, u32>(1)?,
                input_fingerprint: row.get(2)?,
                observation_count: row.get::<_, i64>(3)? as usize,
                computed_at: row.get(4)?,
            })
        },
    )
    .optional()
    .context("query last job run")
}

fn record_run(tx: &Transaction<'_>, job: Job, snapshot: &InputSnapshot) -> Result<()> {
    tx.execute(
        "INSERT INTO job_runs (job, season, input_fingerprint, observation_count, computed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(job, season) DO UPDATE SET
            input_fingerprint = excluded.input_fingerprint,
            observation_count = excluded.observation_count,
            computed_at = excluded.computed_at",
        params![
            job.as_str(),
            snapshot.season as i64,
            snapshot.fingerprint,
            snapshot.observation_count as i64,
            Utc::now().to_rfc3339(),
        ],
    )
    .context("record job run")?;
    Ok(())
}

/// Errors with `StaleUpstream` unless every upstream of `job` ran on `snapshot`.
pub fn check_upstream(conn: &Connection, job: Job, snapshot: &InputSnapshot) -> Result<()> {
    for &upstream in job.upstream() {
        let reason = match last_run(conn, upstream, snapshot.season)? {
            None => "has never run for this season".to_string(),
            Some(run) if run.input_fingerprint != snapshot.fingerprint => format!(
                "last ran at {} on {} observations; inputs have changed since",
                run.computed_at, run.observation_count
            ),
            Some(_) => continue,
        };
        return Err(EngineError::StaleUpstream {
            job: job.as_str(),
            upstream: upstream.as_str(),
            season: snapshot.season,
            reason,
        }
        .into());
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: Job,
    pub season: u32,
    pub rows_written: usize,
    pub detail: String,
}

pub fn run_job(conn: &mut Connection, job: Job, season: u32, policy: &Policy) -> Result<JobReport> {
    let tx = conn
        .transaction()
        .with_context(|| format!("begin {job} transaction"))?;
    let snapshot = input_snapshot(&tx, season)?;
    check_upstream(&tx, job, &snapshot)?;

    let (rows_written, detail) = match job {
        Job::Percentiles => {
            let s = percentiles::recompute_in(&tx, season, None, policy)?;
            (
                s.rows_written,
                format!("{} groups, {} skipped", s.groups_written, s.groups_skipped),
            )
        }
        Job::EntityStats => {
            let s = entity_stats::recompute_in(&tx, season)?;
            (
                s.rows_written,
                format!("{} without percentiles", s.rows_missing_percentiles),
            )
        }
        Job::PickRates => {
            let s = pick_rates::recompute_in(&tx, season)?;
            (s.rows_written, format!("{} matches", s.matches))
        }
    };
    record_run(&tx, job, &snapshot)?;
    tx.commit()
        .with_context(|| format!("commit {job} transaction"))?;

    info!(
        job = %job,
        season,
        rows = rows_written,
        observations = snapshot.observation_count,
        "job complete"
    );
    Ok(JobReport {
        job,
        season,
        rows_written,
        detail,
    })
}

pub fn refresh_season(conn: &mut Connection, season: u32, policy: &Policy) -> Result<Vec<JobReport>> {
    let mut reports = Vec::new();
    for job in Job::ALL {
        match run_job(conn, job, season, policy) {
            Ok(report) => reports.push(report),
            Err(err) => {
                warn!(job = %job, season, error = %err, "season refresh stopped");
                return Err(err);
            }
        }
    }
    Ok(reports)
}

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job: Job,
    pub last_run: Option<JobRun>,
    pub fresh: bool,
}

pub fn job_status(conn: &Connection, season: u32) -> Result<Vec<JobStatus>> {
    let snapshot = input_snapshot(conn, season)?;
    let mut out = Vec::new();
    for job in Job::ALL {
        let last = last_run(conn, job, season)?;
        let fresh = last
            .as_ref()
            .is_some_and(|run| run.input_fingerprint == snapshot.fingerprint);
        out.push(JobStatus {
            job,
            last_run: last,
            fresh,
        });
    }
    Ok(out)
}
