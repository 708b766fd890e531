use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const CACHE_DIR: &str = "league_stats";
const DB_FILE: &str = "league_stats.sqlite";

pub const DEFAULT_PERCENTILE_RANKS: [u8; 7] = [10, 25, 50, 75, 90, 95, 99];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Scores a (machine, venue, season) group needs before thresholds are written.
    pub min_percentile_sample: usize,
    pub percentile_ranks: Vec<u8>,
    pub min_pick_opportunities: u32,
    pub small_sample_games: u32,
    pub small_sample_widening: f64,
    pub z_critical: f64,
    pub fielded_players_per_machine: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            min_percentile_sample: 10,
            percentile_ranks: DEFAULT_PERCENTILE_RANKS.to_vec(),
            min_pick_opportunities: 3,
            small_sample_games: 5,
            small_sample_widening: 2.0,
            z_critical: 1.96,
            fielded_players_per_machine: 2,
        }
    }
}

impl Policy {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut out = Self::default();
        if let Some(v) = parse_var(&lookup, "LEAGUE_STATS_MIN_PERCENTILE_SAMPLE") {
            out.min_percentile_sample = v;
        }
        if let Some(raw) = lookup("LEAGUE_STATS_PERCENTILE_RANKS") {
            let ranks = parse_ranks(&raw);
            if !ranks.is_empty() {
                out.percentile_ranks = ranks;
            }
        }
        if let Some(v) = parse_var(&lookup, "LEAGUE_STATS_MIN_PICK_OPPORTUNITIES") {
            out.min_pick_opportunities = v;
        }
        if let Some(v) = parse_var(&lookup, "LEAGUE_STATS_SMALL_SAMPLE_GAMES") {
            out.small_sample_games = v;
        }
        if let Some(v) = parse_var::<f64>(&lookup, "LEAGUE_STATS_SMALL_SAMPLE_WIDENING") {
            out.small_sample_widening = v.max(1.0);
        }
        if let Some(v) = parse_var::<f64>(&lookup, "LEAGUE_STATS_Z_CRITICAL") {
            if v > 0.0 {
                out.z_critical = v;
            }
        }
        if let Some(v) = parse_var::<usize>(&lookup, "LEAGUE_STATS_FIELDED_PLAYERS") {
            out.fielded_players_per_machine = v.max(1);
        }
        out
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    lookup(key).and_then(|raw| raw.trim().parse::<T>().ok())
}

fn parse_ranks(raw: &str) -> Vec<u8> {
    let mut ranks = raw
        .split([',', ';', ' '])
        .filter_map(|part| part.trim().parse::<u8>().ok())
        .filter(|r| (1..=99).contains(r))
        .collect::<Vec<_>>();
    ranks.sort_unstable();
    ranks.dedup();
    ranks
}

pub fn load_env_files() {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
}

pub fn app_cache_dir() -> Option<PathBuf> {
    if let Ok(base) = std::env::var("XDG_CACHE_HOME") {
        if !base.trim().is_empty() {
            return Some(PathBuf::from(base).join(CACHE_DIR));
        }
    }
    let home = std::env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(CACHE_DIR))
}

pub fn default_db_path() -> Option<PathBuf> {
    if let Ok(raw) = std::env::var("LEAGUE_STATS_DB") {
        if !raw.trim().is_empty() {
            return Some(PathBuf::from(raw.trim()));
        }
    }
    app_cache_dir().map(|dir| dir.join(DB_FILE))
}
