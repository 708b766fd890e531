use std::collections::BTreeSet;

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use league_stats::config::Policy;
use league_stats::entity_stats::compute_entity_stats;
use league_stats::percentiles::{compute_season_thresholds, curves_from_rows};
use league_stats::pick_rates::{RoundContext, compute_season_picks, rank_picks};
use league_stats::store;
use league_stats::synthetic::{self, SyntheticConfig, SyntheticLeague};

const SEASON: u32 = 20;

fn bench_league() -> SyntheticLeague {
    let config = SyntheticConfig {
        seasons: vec![SEASON],
        teams: 16,
        weeks: 15,
        unplayed_weeks: 0,
        ..SyntheticConfig::default()
    };
    synthetic::generate_league(&config, 42).expect("bench league should generate")
}

fn bench_percentile_thresholds(c: &mut Criterion) {
    let league = bench_league();
    let policy = Policy::default();
    c.bench_function("percentile_thresholds", |b| {
        b.iter(|| {
            let (rows, skipped) =
                compute_season_thresholds(black_box(&league.observations), SEASON, &policy, None);
            black_box((rows.len(), skipped));
        })
    });
}

fn bench_entity_stats(c: &mut Criterion) {
    let league = bench_league();
    let (rows, _) = compute_season_thresholds(&league.observations, SEASON, &Policy::default(), None);
    let curves = curves_from_rows(&rows).expect("computed thresholds should form curves");
    c.bench_function("entity_stats", |b| {
        b.iter(|| {
            let stats = compute_entity_stats(black_box(&league.observations), SEASON, &curves);
            black_box(stats.len());
        })
    });
}

fn bench_pick_rates(c: &mut Criterion) {
    let league = bench_league();
    let mut equipment = std::collections::HashMap::new();
    for ((venue, _), machines) in &league.equipment {
        equipment.insert(venue.clone(), machines.clone());
    }
    let policy = Policy::default();
    c.bench_function("pick_rates", |b| {
        b.iter(|| {
            let records = compute_season_picks(
                black_box(&league.matches),
                black_box(&league.observations),
                &equipment,
                SEASON,
            )
            .unwrap();
            let t01 = records
                .iter()
                .filter(|r| r.team_id == "T01" && r.round_context == RoundContext::Round1Doubles)
                .cloned()
                .collect::<Vec<_>>();
            let available: BTreeSet<String> = equipment.get("V1").cloned().unwrap_or_default();
            black_box(rank_picks(&t01, &available, &policy).len());
        })
    });
}

fn bench_sqlite_refresh(c: &mut Criterion) {
    let league = bench_league();
    let policy = Policy::default();
    c.bench_function("sqlite_refresh", |b| {
        b.iter(|| {
            let mut conn = store::open_in_memory().unwrap();
            synthetic::write_league(&mut conn, &league).unwrap();
            let reports =
                league_stats::pipeline::refresh_season(&mut conn, SEASON, &policy).unwrap();
            black_box(reports.len());
        })
    });
}

criterion_group!(
    perf,
    bench_percentile_thresholds,
    bench_entity_stats,
    bench_pick_rates,
    bench_sqlite_refresh
);
criterion_main!(perf);
