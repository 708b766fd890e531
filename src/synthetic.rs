use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result, anyhow};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rusqlite::Connection;
use tracing::info;

use crate::pick_rates::RoundContext;
use crate::store::{self, MatchRecord, Observation};

const GAMES_PER_ROUND: usize = 4;

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub seasons: Vec<u32>,
    pub teams: usize,
    pub players_per_team: usize,
    pub venues: usize,
    pub machine_pool: usize,
    pub machines_per_venue: usize,
    pub weeks: u32,
    /// Trailing weeks of the newest season left scheduled but unplayed.
    pub unplayed_weeks: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            seasons: vec![20, 21],
            teams: 8,
            players_per_team: 10,
            venues: 4,
            machine_pool: 24,
            machines_per_venue: 10,
            weeks: 10,
            unplayed_weeks: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyntheticLeague {
    pub matches: Vec<MatchRecord>,
    pub observations: Vec<Observation>,
    pub equipment: BTreeMap<(String, u32), BTreeSet<String>>,
}

struct Team {
    id: String,
    home_venue: String,
    players: Vec<(String, f64)>,
    favourites: Vec<String>,
}

pub fn generate_league(config: &SyntheticConfig, seed: u64) -> Result<SyntheticLeague> {
    if config.teams < 2 || config.venues == 0 || config.seasons.is_empty() {
        return Err(anyhow!("synthetic league needs two teams, a venue and a season"));
    }
    if config.players_per_team < 2 * GAMES_PER_ROUND {
        return Err(anyhow!(
            "doubles rounds need {} players per team",
            2 * GAMES_PER_ROUND
        ));
    }
    if config.machines_per_venue < GAMES_PER_ROUND || config.machine_pool < config.machines_per_venue
    {
        return Err(anyhow!(
            "each venue needs at least {GAMES_PER_ROUND} machines from the pool"
        ));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let machines: Vec<(String, f64)> = (1..=config.machine_pool)
        .map(|i| (format!("M{i:02}"), rng.gen_range(2.0e6..9.0e7_f64)))
        .collect();
    let machine_ids: Vec<String> = machines.iter().map(|(id, _)| id.clone()).collect();
    let typical: BTreeMap<&str, f64> = machines.iter().map(|(id, v)| (id.as_str(), *v)).collect();

    let teams: Vec<Team> = (0..config.teams)
        .map(|t| {
            let id = format!("T{:02}", t + 1);
            let players = (1..=config.players_per_team)
                .map(|p| (format!("{id}-P{p:02}"), rng.gen_range(0.5..1.8)))
                .collect();
            let mut favourites = machine_ids.clone();
            favourites.shuffle(&mut rng);
            Team {
                home_venue: format!("V{}", t % config.venues + 1),
                id,
                players,
                favourites,
            }
        })
        .collect();

    let mut league = SyntheticLeague::default();
    let newest = config.seasons.iter().copied().max().unwrap_or_default();
    for &season in &config.seasons {
        for v in 1..=config.venues {
            let mut pool = machine_ids.clone();
            pool.shuffle(&mut rng);
            pool.truncate(config.machines_per_venue);
            league
                .equipment
                .insert((format!("V{v}"), season), pool.into_iter().collect());
        }

        for week in 1..=config.weeks {
            let played = season != newest || week + config.unplayed_weeks <= config.weeks;
            for (slot, (a, b)) in pairings(config.teams, week).into_iter().enumerate() {
                let (home, away) = if week % 2 == 0 {
                    (&teams[a], &teams[b])
                } else {
                    (&teams[b], &teams[a])
                };
                let m = MatchRecord {
                    match_id: format!("s{season}-w{week:02}-{slot}"),
                    season,
                    week,
                    venue_id: home.home_venue.clone(),
                    home_team_id: home.id.clone(),
                    away_team_id: away.id.clone(),
                    completed: played,
                };
                if played {
                    let on_site = league
                        .equipment
                        .get(&(m.venue_id.clone(), season))
                        .cloned()
                        .unwrap_or_default();
                    play_match(&m, home, away, &on_site, &typical, &mut rng, &mut league.observations);
                }
                league.matches.push(m);
            }
        }
    }
    Ok(league)
}

/// Circle-method round robin; an odd team count gives one team a bye.
fn pairings(teams: usize, week: u32) -> Vec<(usize, usize)> {
    let n = teams + teams % 2;
    let rotation = (week as usize - 1) % (n - 1);
    let mut ring: Vec<usize> = (1..n).collect();
    ring.rotate_left(rotation);
    let mut order = vec![0];
    order.extend(ring);
    (0..n / 2)
        .map(|i| (order[i], order[n - 1 - i]))
        .filter(|(a, b)| *a < teams && *b < teams)
        .collect()
}

fn play_match(
    m: &MatchRecord,
    home: &Team,
    away: &Team,
    on_site: &BTreeSet<String>,
    typical: &BTreeMap<&str, f64>,
    rng: &mut StdRng,
    out: &mut Vec<Observation>,
) {
    for ctx in RoundContext::ALL {
        let selector = if ctx.home_selects() { home } else { away };
        let chosen = choose_machines(selector, on_site, rng);
        let per_side = if ctx.is_doubles() { 2 } else { 1 };
        for (team, is_home) in [(home, true), (away, false)] {
            let mut lineup: Vec<&(String, f64)> = team.players.iter().collect();
            lineup.shuffle(rng);
            for (game_idx, machine) in chosen.iter().enumerate() {
                let base = typical.get(machine.as_str()).copied().unwrap_or(1.0e7);
                for (player_id, skill) in lineup.iter().skip(game_idx * per_side).take(per_side) {
                    let noise: f64 = rng.gen_range(0.25..2.5);
                    out.push(Observation {
                        match_id: m.match_id.clone(),
                        season: m.season,
                        venue_id: m.venue_id.clone(),
                        round_number: ctx.round_number(),
                        game_number: game_idx as u8 + 1,
                        machine_id: machine.clone(),
                        team_id: team.id.clone(),
                        player_id: player_id.clone(),
                        is_home,
                        score: (base * skill * noise).round() as i64,
                    });
                }
            }
        }
    }
}

fn choose_machines(team: &Team, on_site: &BTreeSet<String>, rng: &mut StdRng) -> Vec<String> {
    let mut ranked: Vec<&String> = team
        .favourites
        .iter()
        .filter(|id| on_site.contains(*id))
        .collect();
    for i in 0..ranked.len().saturating_sub(1) {
        if rng.gen_bool(0.3) {
            ranked.swap(i, i + 1);
        }
    }
    ranked.into_iter().take(GAMES_PER_ROUND).cloned().collect()
}

pub fn write_league(conn: &mut Connection, league: &SyntheticLeague) -> Result<()> {
    let tx = conn.transaction().context("begin synthetic league transaction")?;
    for ((venue_id, season), machines) in &league.equipment {
        for machine_id in machines {
            store::insert_venue_machine(&tx, venue_id, *season, machine_id)?;
        }
    }
    for m in &league.matches {
        store::insert_match(&tx, m)?;
    }
    for o in &league.observations {
        store::insert_observation(&tx, o)?;
    }
    tx.commit().context("commit synthetic league")?;
    info!(
        matches = league.matches.len(),
        observations = league.observations.len(),
        "synthetic league written"
    );
    Ok(())
}
