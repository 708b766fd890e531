use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use league_stats::config::{self, Policy};
use league_stats::entity_stats::{self, BestMachinesQuery, EntityKind};
use league_stats::export;
use league_stats::matchup::{self, MatchupRequest};
use league_stats::percentiles;
use league_stats::pick_rates::{self, PickQuery, RoundContext};
use league_stats::pipeline::{self, Job};
use league_stats::store::{self, VenueScope};

#[derive(Debug, Parser)]
#[command(name = "league-stats", version, about = "League statistics batch jobs and predictions")]
struct Cli {
    /// SQLite database (defaults to LEAGUE_STATS_DB or the cache directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one job for a season
    Recompute(RecomputeArg),
    /// Run every job for a season in dependency order
    Refresh(SeasonArg),
    /// Show when each job last ran and whether it is current
    Status(SeasonArg),
    /// Machines a team is likely to pick
    PredictPicks(PredictPicksArg),
    /// Expected-score intervals for an upcoming match
    Matchup(MatchupArg),
    /// An entity's strongest machines by median percentile
    BestMachines(BestMachinesArg),
    /// Write a season's derived tables to xlsx
    Export(ExportArg),
}

#[derive(Debug, Args)]
struct SeasonArg {
    #[arg(long)]
    season: u32,
}

#[derive(Debug, Args)]
struct RecomputeArg {
    job: String,
    #[arg(long)]
    season: u32,
    /// Percentiles only: recompute a single machine
    #[arg(long)]
    machine: Option<String>,
}

#[derive(Debug, Args)]
struct PredictPicksArg {
    #[arg(long)]
    team: String,
    #[arg(long)]
    round: u8,
    #[arg(long)]
    venue: String,
    #[arg(long, value_delimiter = ',', required = true)]
    seasons: Vec<u32>,
}

#[derive(Debug, Args)]
struct MatchupArg {
    #[arg(long)]
    venue: String,
    #[arg(long)]
    home: String,
    #[arg(long)]
    away: String,
    #[arg(long, value_delimiter = ',', required = true)]
    seasons: Vec<u32>,
}

#[derive(Debug, Args)]
struct BestMachinesArg {
    /// player or team
    #[arg(long)]
    entity: String,
    #[arg(long)]
    id: String,
    #[arg(long, value_delimiter = ',', required = true)]
    seasons: Vec<u32>,
    /// Limit to one venue instead of the cross-venue rows
    #[arg(long)]
    venue: Option<String>,
    #[arg(long, default_value_t = 0)]
    min_games: u32,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Args)]
struct ExportArg {
    #[arg(long)]
    season: u32,
    #[arg(long)]
    out: PathBuf,
}

fn main() -> Result<()> {
    config::load_env_files();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("league_stats=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let policy = Policy::from_env();
    let db_path = cli
        .db
        .or_else(config::default_db_path)
        .context("unable to resolve sqlite path")?;
    let mut conn = store::open_db(&db_path)?;

    match cli.command {
        Command::Recompute(arg) => {
            let job: Job = arg.job.parse()?;
            match (job, arg.machine.as_deref()) {
                (Job::Percentiles, Some(machine)) => {
                    let summary =
                        percentiles::recompute_machine(&mut conn, arg.season, machine, &policy)?;
                    warn!(
                        machine,
                        season = arg.season,
                        "single-machine recompute does not mark the season current"
                    );
                    println!(
                        "percentiles {machine}: {} rows ({} groups)",
                        summary.rows_written, summary.groups_written
                    );
                }
                (_, Some(_)) => return Err(anyhow!("--machine only applies to percentiles")),
                (job, None) => {
                    let report = pipeline::run_job(&mut conn, job, arg.season, &policy)?;
                    println!("{}: {} rows ({})", report.job, report.rows_written, report.detail);
                }
            }
        }
        Command::Refresh(arg) => {
            for report in pipeline::refresh_season(&mut conn, arg.season, &policy)? {
                println!("{}: {} rows ({})", report.job, report.rows_written, report.detail);
            }
        }
        Command::Status(arg) => {
            for status in pipeline::job_status(&conn, arg.season)? {
                match status.last_run {
                    Some(run) => println!(
                        "{:<13} {} computed_at={} observations={}",
                        status.job.as_str(),
                        if status.fresh { "current" } else { "stale  " },
                        run.computed_at,
                        run.observation_count
                    ),
                    None => println!("{:<13} never run", status.job.as_str()),
                }
            }
        }
        Command::PredictPicks(arg) => {
            let query = PickQuery {
                team_id: arg.team,
                round_context: RoundContext::from_round(arg.round)?,
                venue_id: arg.venue,
                seasons: arg.seasons,
            };
            let picks = pick_rates::predict_picks(&conn, &query, &policy)?;
            println!("{}", serde_json::to_string_pretty(&picks)?);
        }
        Command::Matchup(arg) => {
            let request = MatchupRequest {
                venue_id: arg.venue,
                home_team_id: arg.home,
                away_team_id: arg.away,
                seasons: arg.seasons,
                home_roster: None,
                away_roster: None,
            };
            let prediction = matchup::predict_matchup(&conn, &request, &policy)?;
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }
        Command::BestMachines(arg) => {
            let kind = EntityKind::parse(&arg.entity)
                .ok_or_else(|| anyhow!("entity must be 'player' or 'team', got '{}'", arg.entity))?;
            let query = BestMachinesQuery {
                kind,
                entity_id: arg.id,
                seasons: arg.seasons,
                venue: arg.venue.map(VenueScope::Venue).unwrap_or(VenueScope::All),
                min_games: arg.min_games,
                limit: arg.limit,
            };
            let ranked = entity_stats::best_machines(&conn, &query)?;
            println!("{}", serde_json::to_string_pretty(&ranked)?);
        }
        Command::Export(arg) => {
            let report = export::export_season_workbook(&conn, arg.season, &arg.out)?;
            println!("Export complete: {}", arg.out.display());
            println!(
                "percentiles={} players={} teams={} picks={}",
                report.percentile_rows, report.player_rows, report.team_rows, report.pick_rows
            );
        }
    }
    Ok(())
}
