use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, params, params_from_iter};
use serde::{Deserialize, Serialize};

const ALL_VENUES_KEY: &str = "ALL";

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub match_id: String,
    pub season: u32,
    pub venue_id: String,
    pub round_number: u8,
    pub game_number: u8,
    pub machine_id: String,
    pub team_id: String,
    pub player_id: String,
    /// The player's team was the home side of the match.
    pub is_home: bool,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchRecord {
    pub match_id: String,
    pub season: u32,
    pub week: u32,
    pub venue_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum VenueScope {
    All,
    Venue(String),
}

impl VenueScope {
    pub fn key(&self) -> &str {
        match self {
            VenueScope::All => ALL_VENUES_KEY,
            VenueScope::Venue(id) => id.as_str(),
        }
    }

    pub fn from_key(key: &str) -> Self {
        if key == ALL_VENUES_KEY {
            VenueScope::All
        } else {
            VenueScope::Venue(key.to_string())
        }
    }
}

impl fmt::Display for VenueScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl From<VenueScope> for String {
    fn from(scope: VenueScope) -> Self {
        scope.key().to_string()
    }
}

impl From<String> for VenueScope {
    fn from(key: String) -> Self {
        VenueScope::from_key(&key)
    }
}

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")
        .context("enable wal journal")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS matches (
            match_id TEXT PRIMARY KEY,
            season INTEGER NOT NULL,
            week INTEGER NOT NULL,
            venue_id TEXT NOT NULL,
            home_team_id TEXT NOT NULL,
            away_team_id TEXT NOT NULL,
            completed INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_matches_season ON matches(season);

        CREATE TABLE IF NOT EXISTS observations (
            match_id TEXT NOT NULL,
            season INTEGER NOT NULL,
            venue_id TEXT NOT NULL,
            round_number INTEGER NOT NULL,
            game_number INTEGER NOT NULL,
            machine_id TEXT NOT NULL,
            team_id TEXT NOT NULL,
            player_id TEXT NOT NULL,
            is_home INTEGER NOT NULL,
            score INTEGER NOT NULL,
            PRIMARY KEY (match_id, round_number, game_number, player_id)
        );
        CREATE INDEX IF NOT EXISTS idx_observations_season ON observations(season);
        CREATE INDEX IF NOT EXISTS idx_observations_team ON observations(team_id, season);

        CREATE TABLE IF NOT EXISTS venue_machines (
            venue_id TEXT NOT NULL,
            season INTEGER NOT NULL,
            machine_id TEXT NOT NULL,
            PRIMARY KEY (venue_id, season, machine_id)
        );

        CREATE TABLE IF NOT EXISTS percentile_thresholds (
            machine_id TEXT NOT NULL,
            venue_key TEXT NOT NULL,
            season INTEGER NOT NULL,
            percentile_rank INTEGER NOT NULL,
            score_value REAL NOT NULL,
            sample_size INTEGER NOT NULL,
            PRIMARY KEY (machine_id, venue_key, season, percentile_rank)
        );
        CREATE INDEX IF NOT EXISTS idx_thresholds_season ON percentile_thresholds(season);

        CREATE TABLE IF NOT EXISTS entity_machine_stats (
            entity_kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            machine_id TEXT NOT NULL,
            venue_key TEXT NOT NULL,
            season INTEGER NOT NULL,
            games_played INTEGER NOT NULL,
            median_score REAL NOT NULL,
            avg_score REAL NOT NULL,
            best_score INTEGER NOT NULL,
            worst_score INTEGER NOT NULL,
            score_stddev REAL NULL,
            median_percentile REAL NULL,
            avg_percentile REAL NULL,
            percentile_extrapolated INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (entity_kind, entity_id, machine_id, venue_key, season)
        );
        CREATE INDEX IF NOT EXISTS idx_entity_stats_season ON entity_machine_stats(season);

        CREATE TABLE IF NOT EXISTS pick_records (
            season INTEGER NOT NULL,
            team_id TEXT NOT NULL,
            machine_id TEXT NOT NULL,
            round_context TEXT NOT NULL,
            is_home INTEGER NOT NULL,
            opportunities INTEGER NOT NULL,
            times_picked INTEGER NOT NULL,
            PRIMARY KEY (season, team_id, machine_id, round_context),
            CHECK (times_picked >= 0 AND times_picked <= opportunities)
        );

        CREATE TABLE IF NOT EXISTS job_runs (
            job TEXT NOT NULL,
            season INTEGER NOT NULL,
            input_fingerprint TEXT NOT NULL,
            observation_count INTEGER NOT NULL,
            computed_at TEXT NOT NULL,
            PRIMARY KEY (job, season)
        );
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

pub fn insert_match(conn: &Connection, m: &MatchRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO matches (match_id, season, week, venue_id, home_team_id, away_team_id, completed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            m.match_id,
            m.season as i64,
            m.week as i64,
            m.venue_id,
            m.home_team_id,
            m.away_team_id,
            bool_to_i64(m.completed),
        ],
    )
    .with_context(|| format!("insert match {}", m.match_id))?;
    Ok(())
}

pub fn insert_observation(conn: &Connection, o: &Observation) -> Result<()> {
    conn.execute(
        "INSERT INTO observations (
            match_id, season, venue_id, round_number, game_number,
            machine_id, team_id, player_id, is_home, score
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            o.match_id,
            o.season as i64,
            o.venue_id,
            o.round_number as i64,
            o.game_number as i64,
            o.machine_id,
            o.team_id,
            o.player_id,
            bool_to_i64(o.is_home),
            o.score,
        ],
    )
    .with_context(|| {
        format!(
            "insert observation {} r{} g{} {}",
            o.match_id, o.round_number, o.game_number, o.player_id
        )
    })?;
    Ok(())
}

pub fn insert_venue_machine(
    conn: &Connection,
    venue_id: &str,
    season: u32,
    machine_id: &str,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO venue_machines (venue_id, season, machine_id) VALUES (?1, ?2, ?3)",
        params![venue_id, season as i64, machine_id],
    )
    .with_context(|| format!("insert venue machine {venue_id}/{machine_id}"))?;
    Ok(())
}

pub fn load_season_observations(conn: &Connection, season: u32) -> Result<Vec<Observation>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT
                o.match_id, o.season, o.venue_id, o.round_number, o.game_number,
                o.machine_id, o.team_id, o.player_id, o.is_home, o.score
            FROM observations o
            JOIN matches m ON m.match_id = o.match_id
            WHERE o.season = ?1
              AND m.completed = 1
            ORDER BY o.match_id ASC, o.round_number ASC, o.game_number ASC, o.player_id ASC
            "#,
        )
        .context("prepare load observations query")?;

    let rows = stmt
        .query_map(params![season as i64], |row| {
            Ok(Observation {
                match_id: row.get(0)?,
                season: row.get::<_, u32>(1)?,
                venue_id: row.get(2)?,
                round_number: row.get::<_, u8>(3)?,
                game_number: row.get::<_, u8>(4)?,
                machine_id: row.get(5)?,
                team_id: row.get(6)?,
                player_id: row.get(7)?,
                is_home: row.get::<_, i64>(8)? != 0,
                score: row.get(9)?,
            })
        })
        .context("query load observations")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode observation row")?);
    }
    Ok(out)
}

pub fn load_season_matches(conn: &Connection, season: u32) -> Result<Vec<MatchRecord>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT match_id, season, week, venue_id, home_team_id, away_team_id, completed
            FROM matches
            WHERE season = ?1 AND completed = 1
            ORDER BY week ASC, match_id ASC
            "#,
        )
        .context("prepare load matches query")?;
    let rows = stmt
        .query_map(params![season as i64], |row| {
            Ok(MatchRecord {
                match_id: row.get(0)?,
                season: row.get::<_, u32>(1)?,
                week: row.get::<_, u32>(2)?,
                venue_id: row.get(3)?,
                home_team_id: row.get(4)?,
                away_team_id: row.get(5)?,
                completed: row.get::<_, i64>(6)? != 0,
            })
        })
        .context("query load matches")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode match row")?);
    }
    Ok(out)
}

pub fn load_season_equipment(
    conn: &Connection,
    season: u32,
) -> Result<HashMap<String, BTreeSet<String>>> {
    let mut stmt = conn
        .prepare("SELECT venue_id, machine_id FROM venue_machines WHERE season = ?1")
        .context("prepare load equipment query")?;
    let rows = stmt
        .query_map(params![season as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .context("query load equipment")?;

    let mut out: HashMap<String, BTreeSet<String>> = HashMap::new();
    for row in rows {
        let (venue_id, machine_id) = row.context("decode equipment row")?;
        out.entry(venue_id).or_default().insert(machine_id);
    }
    Ok(out)
}

pub fn current_venue_machines(conn: &Connection, venue_id: &str) -> Result<BTreeSet<String>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT machine_id FROM venue_machines
            WHERE venue_id = ?1
              AND season = (SELECT MAX(season) FROM venue_machines WHERE venue_id = ?1)
            "#,
        )
        .context("prepare current venue machines query")?;
    let rows = stmt
        .query_map(params![venue_id], |row| row.get::<_, String>(0))
        .context("query current venue machines")?;

    let mut out = BTreeSet::new();
    for row in rows {
        out.insert(row.context("decode venue machine row")?);
    }
    Ok(out)
}

pub fn team_roster(conn: &Connection, team_id: &str, seasons: &[u32]) -> Result<Vec<String>> {
    if seasons.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT DISTINCT player_id FROM observations
         WHERE team_id = ? AND season IN ({})
         ORDER BY player_id ASC",
        placeholders(seasons.len())
    );
    let mut stmt = conn.prepare(&sql).context("prepare team roster query")?;
    let mut values: Vec<rusqlite::types::Value> = vec![team_id.to_string().into()];
    values.extend(seasons.iter().map(|s| rusqlite::types::Value::from(*s as i64)));
    let rows = stmt
        .query_map(params_from_iter(values), |row| row.get::<_, String>(0))
        .context("query team roster")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode roster row")?);
    }
    Ok(out)
}

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub(crate) fn bool_to_i64(v: bool) -> i64 {
    if v { 1 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_scope_key_round_trips_all_sentinel() {
        assert_eq!(VenueScope::from_key("ALL"), VenueScope::All);
        assert_eq!(
            VenueScope::from_key("AFM"),
            VenueScope::Venue("AFM".to_string())
        );
        assert_eq!(VenueScope::All.to_string(), "ALL");
    }

    #[test]
    fn incomplete_matches_are_not_read() {
        let conn = open_in_memory().unwrap();
        let mut m = MatchRecord {
            match_id: "m1".to_string(),
            season: 21,
            week: 1,
            venue_id: "V".to_string(),
            home_team_id: "H".to_string(),
            away_team_id: "A".to_string(),
            completed: false,
        };
        insert_match(&conn, &m).unwrap();
        m.match_id = "m2".to_string();
        m.completed = true;
        insert_match(&conn, &m).unwrap();
        for match_id in ["m1", "m2"] {
            insert_observation(
                &conn,
                &Observation {
                    match_id: match_id.to_string(),
                    season: 21,
                    venue_id: "V".to_string(),
                    round_number: 2,
                    game_number: 1,
                    machine_id: "TZ".to_string(),
                    team_id: "H".to_string(),
                    player_id: "p1".to_string(),
                    is_home: true,
                    score: 1_000,
                },
            )
            .unwrap();
        }

        let obs = load_season_observations(&conn, 21).unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].match_id, "m2");
        assert_eq!(load_season_matches(&conn, 21).unwrap().len(), 1);
    }

    #[test]
    fn current_equipment_uses_latest_season() {
        let conn = open_in_memory().unwrap();
        insert_venue_machine(&conn, "V", 20, "OLD").unwrap();
        insert_venue_machine(&conn, "V", 21, "TZ").unwrap();
        insert_venue_machine(&conn, "V", 21, "MM").unwrap();
        let current = current_venue_machines(&conn, "V").unwrap();
        assert_eq!(
            current.into_iter().collect::<Vec<_>>(),
            vec!["MM".to_string(), "TZ".to_string()]
        );
        assert!(current_venue_machines(&conn, "nowhere").unwrap().is_empty());
    }
}
