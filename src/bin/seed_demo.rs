use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use league_stats::config::{self, Policy};
use league_stats::pipeline;
use league_stats::store;
use league_stats::synthetic::{self, SyntheticConfig};

fn main() -> Result<()> {
    config::load_env_files();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("league_stats=info"))
        .with_writer(std::io::stderr)
        .init();

    let db_path = parse_path_arg("--db")
        .or_else(config::default_db_path)
        .context("unable to resolve sqlite path")?;
    let seed = parse_arg("--seed")
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(2024);

    let league_config = SyntheticConfig::default();
    let league = synthetic::generate_league(&league_config, seed)?;
    let mut conn = store::open_db(&db_path)?;
    synthetic::write_league(&mut conn, &league)?;

    println!("Demo league written");
    println!("DB: {}", db_path.display());
    println!("Matches: {}", league.matches.len());
    println!("Observations: {}", league.observations.len());

    let policy = Policy::from_env();
    for &season in &league_config.seasons {
        for report in pipeline::refresh_season(&mut conn, season, &policy)? {
            println!(
                "season {season} {}: {} rows ({})",
                report.job, report.rows_written, report.detail
            );
        }
    }
    Ok(())
}

fn parse_path_arg(flag: &str) -> Option<PathBuf> {
    parse_arg(flag).map(PathBuf::from)
}

fn parse_arg(flag: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if arg == flag {
            return args.get(idx + 1).cloned();
        }
        if let Some(value) = arg.strip_prefix(&format!("{flag}=")) {
            return Some(value.to_string());
        }
    }
    None
}
