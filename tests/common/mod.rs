#![allow(dead_code)]

use rusqlite::Connection;

use league_stats::store::{self, MatchRecord, Observation};

pub fn fresh_db() -> Connection {
    store::open_in_memory().expect("in-memory db should open")
}

pub fn add_match(
    conn: &Connection,
    match_id: &str,
    season: u32,
    venue_id: &str,
    home: &str,
    away: &str,
) -> MatchRecord {
    let m = MatchRecord {
        match_id: match_id.to_string(),
        season,
        week: 1,
        venue_id: venue_id.to_string(),
        home_team_id: home.to_string(),
        away_team_id: away.to_string(),
        completed: true,
    };
    store::insert_match(conn, &m).expect("match insert should succeed");
    m
}

/// Records one score in `m`. The player's team follows from `is_home`.
pub fn add_score(
    conn: &Connection,
    m: &MatchRecord,
    round_number: u8,
    game_number: u8,
    machine_id: &str,
    player_id: &str,
    is_home: bool,
    score: i64,
) {
    let team_id = if is_home {
        &m.home_team_id
    } else {
        &m.away_team_id
    };
    let obs = Observation {
        match_id: m.match_id.clone(),
        season: m.season,
        venue_id: m.venue_id.clone(),
        round_number,
        game_number,
        machine_id: machine_id.to_string(),
        team_id: team_id.clone(),
        player_id: player_id.to_string(),
        is_home,
        score,
    };
    store::insert_observation(conn, &obs).expect("observation insert should succeed");
}

/// `scores.len()` distinct players each post one score on `machine_id` in one game.
pub fn add_machine_scores(
    conn: &Connection,
    m: &MatchRecord,
    round_number: u8,
    game_number: u8,
    machine_id: &str,
    scores: &[i64],
) {
    for (idx, score) in scores.iter().enumerate() {
        let player = format!("{}-{machine_id}-{round_number}-{game_number}-{idx}", m.match_id);
        add_score(conn, m, round_number, game_number, machine_id, &player, idx % 2 == 0, *score);
    }
}

pub fn equip(conn: &Connection, venue_id: &str, season: u32, machines: &[&str]) {
    for machine in machines {
        store::insert_venue_machine(conn, venue_id, season, machine)
            .expect("equipment insert should succeed");
    }
}
