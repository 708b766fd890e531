mod common;

use std::collections::BTreeMap;

use league_stats::config::Policy;
use league_stats::entity_stats::{self, BestMachinesQuery, EntityKind};
use league_stats::percentiles;
use league_stats::pipeline;
use league_stats::store::VenueScope;
use league_stats::synthetic::{self, SyntheticConfig};

use common::{add_machine_scores, add_match, add_score, fresh_db};

const SKEWED: [i64; 11] = [10, 12, 14, 15, 16, 18, 20, 22, 25, 30, 950];

/// Season sample is `SKEWED`, with P posting `p_score` and others the rest.
fn skewed_season(conn: &mut rusqlite::Connection, season: u32, p_score: i64) {
    let m = add_match(conn, &format!("m{season}"), season, "V", "H", "A");
    let mut others = SKEWED.to_vec();
    let idx = others.iter().position(|s| *s == p_score).unwrap();
    others.remove(idx);
    add_machine_scores(conn, &m, 2, 1, "M", &others);
    add_score(conn, &m, 3, 1, "M", "P", true, p_score);
    percentiles::recompute_season(conn, season, &Policy::default()).unwrap();
    entity_stats::recompute_season(conn, season).unwrap();
}

#[test]
fn best_machines_min_games_hides_row_but_keeps_it_stored() {
    let mut conn = fresh_db();
    let m = add_match(&conn, "m1", 20, "V", "H", "A");
    add_score(&conn, &m, 2, 1, "M", "P", true, 100);
    add_score(&conn, &m, 3, 1, "M", "P", true, 300);
    add_score(&conn, &m, 2, 2, "N", "P", true, 50);
    add_score(&conn, &m, 3, 2, "N", "P", true, 60);
    add_score(&conn, &m, 4, 2, "N", "P", true, 70);
    entity_stats::recompute_season(&mut conn, 20).unwrap();

    let ranked = entity_stats::best_machines(
        &conn,
        &BestMachinesQuery {
            kind: EntityKind::Player,
            entity_id: "P".to_string(),
            seasons: vec![20],
            venue: VenueScope::All,
            min_games: 3,
            limit: 0,
        },
    )
    .unwrap();
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0].machine_id, "N");

    let stored =
        entity_stats::load_entity_stats(&conn, EntityKind::Player, "P", &[20], Some(&VenueScope::All))
            .unwrap();
    let m_row = stored
        .iter()
        .find(|r| r.machine_id == "M")
        .expect("row under min_games is still stored");
    assert_eq!(m_row.games_played, 2);
    assert_eq!(m_row.median_score, 200.0);
}

#[test]
fn without_percentiles_rows_carry_null_percentiles() {
    let mut conn = fresh_db();
    let m = add_match(&conn, "m1", 23, "V", "H", "A");
    add_score(&conn, &m, 1, 1, "M", "P", true, 10);
    add_score(&conn, &m, 1, 2, "M", "P", true, 30);
    add_score(&conn, &m, 1, 1, "M", "Q", false, 20);

    let summary = entity_stats::recompute_season(&mut conn, 23).unwrap();
    assert_eq!(summary.rows_with_percentiles, 0);
    assert_eq!(summary.rows_missing_percentiles, summary.rows_written);

    let rows =
        entity_stats::load_entity_stats(&conn, EntityKind::Player, "P", &[23], None).unwrap();
    assert_eq!(rows.len(), 2);
    for row in rows {
        assert_eq!(row.median_percentile, None);
        assert_eq!(row.avg_percentile, None);
        assert_eq!(row.games_played, 2);
        assert_eq!(row.median_score, 20.0);
        assert_eq!(row.best_score, 30);
        assert_eq!(row.worst_score, 10);
    }
}

#[test]
fn team_rows_cover_every_member_score() {
    let mut conn = fresh_db();
    let m = add_match(&conn, "m1", 20, "V", "H", "A");
    add_score(&conn, &m, 1, 1, "M", "P1", true, 10);
    add_score(&conn, &m, 1, 1, "M", "P2", true, 20);
    add_score(&conn, &m, 2, 1, "M", "P1", true, 30);
    add_score(&conn, &m, 2, 1, "M", "X", false, 999);
    entity_stats::recompute_season(&mut conn, 20).unwrap();

    let rows = entity_stats::load_entity_stats(
        &conn,
        EntityKind::Team,
        "H",
        &[20],
        Some(&VenueScope::Venue("V".to_string())),
    )
    .unwrap();
    assert_eq!(rows.len(), 1);
    let team = &rows[0];
    assert_eq!(team.games_played, 3);
    assert_eq!(team.median_score, 20.0);
    assert_eq!(team.avg_score, 20.0);
    assert_eq!(team.best_score, 30);
    assert_eq!(team.worst_score, 10);
    assert_eq!(team.score_stddev, Some(10.0));
}

#[test]
fn seasons_pool_by_summed_games() {
    let mut conn = fresh_db();
    let s1 = add_match(&conn, "m1", 20, "V", "H", "A");
    add_score(&conn, &s1, 1, 1, "M", "P", true, 10);
    add_score(&conn, &s1, 2, 1, "M", "P", true, 10);
    let s2 = add_match(&conn, "m2", 21, "V", "H", "A");
    add_score(&conn, &s2, 1, 1, "M", "P", true, 20);
    add_score(&conn, &s2, 2, 1, "M", "P", true, 20);
    add_score(&conn, &s2, 3, 1, "M", "P", true, 20);
    entity_stats::recompute_season(&mut conn, 20).unwrap();
    entity_stats::recompute_season(&mut conn, 21).unwrap();

    let rows = entity_stats::load_entity_stats(
        &conn,
        EntityKind::Player,
        "P",
        &[20, 21],
        Some(&VenueScope::All),
    )
    .unwrap();
    let pooled = entity_stats::pool_by_machine(&rows, &BTreeMap::new());
    let m = &pooled["M"];
    assert_eq!(m.games_played, 5);
    assert_eq!(m.seasons, vec![20, 21]);
    assert!((m.avg_score - 16.0).abs() < 1e-9);
    let expected_sd = (120.0_f64 / 4.0).sqrt();
    assert!((m.score_stddev.unwrap() - expected_sd).abs() < 1e-9);
}

#[test]
fn percentiles_stay_in_range_after_refresh() {
    let mut conn = fresh_db();
    let league = synthetic::generate_league(&SyntheticConfig::default(), 5).unwrap();
    synthetic::write_league(&mut conn, &league).unwrap();
    pipeline::refresh_season(&mut conn, 21, &Policy::default()).unwrap();

    let (with_pct, out_of_range): (i64, i64) = conn
        .query_row(
            "SELECT
                SUM(CASE WHEN median_percentile IS NOT NULL THEN 1 ELSE 0 END),
                SUM(CASE WHEN median_percentile < 0 OR median_percentile > 100
                          OR avg_percentile < 0 OR avg_percentile > 100 THEN 1 ELSE 0 END)
             FROM entity_machine_stats WHERE season = 21",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert!(with_pct > 0);
    assert_eq!(out_of_range, 0);
}

#[test]
fn pooled_percentile_ranks_the_pooled_median_on_the_newest_curve() {
    let mut conn = fresh_db();
    skewed_season(&mut conn, 20, 15);
    skewed_season(&mut conn, 21, 950);

    let ranked = entity_stats::best_machines(
        &conn,
        &BestMachinesQuery {
            kind: EntityKind::Player,
            entity_id: "P".to_string(),
            seasons: vec![20, 21],
            venue: VenueScope::All,
            min_games: 0,
            limit: 0,
        },
    )
    .unwrap();
    assert_eq!(ranked.len(), 1);
    let pooled = &ranked[0];
    assert_eq!(pooled.games_played, 2);
    assert_eq!(pooled.median_score, 482.5);

    let curve = percentiles::load_curve(&conn, "M", &VenueScope::All, 21)
        .unwrap()
        .expect("season 21 has an ALL curve");
    let expected = curve.rank_of(482.5).rank;
    let got = pooled.median_percentile.unwrap();
    assert!((got - expected).abs() < 1e-9, "{got} vs {expected}");

    let stored =
        entity_stats::load_entity_stats(&conn, EntityKind::Player, "P", &[20, 21], Some(&VenueScope::All))
            .unwrap();
    let weighted = stored
        .iter()
        .map(|r| r.median_percentile.unwrap() * f64::from(r.games_played))
        .sum::<f64>()
        / 2.0;
    assert!((got - weighted).abs() > 10.0, "{got} should not average {weighted}");
}

#[test]
fn scores_beyond_the_thresholds_are_flagged_extrapolated() {
    let mut conn = fresh_db();
    skewed_season(&mut conn, 20, 15);
    skewed_season(&mut conn, 21, 950);

    let rows =
        entity_stats::load_entity_stats(&conn, EntityKind::Player, "P", &[20, 21], Some(&VenueScope::All))
            .unwrap();
    let flags = rows
        .iter()
        .map(|r| (r.season, r.percentile_extrapolated))
        .collect::<Vec<_>>();
    assert_eq!(flags, vec![(20, false), (21, true)]);
    let high = &rows[1];
    assert!(high.median_percentile.unwrap() > 99.0);
    assert!(high.median_percentile.unwrap() <= 100.0);

    let stored: i64 = conn
        .query_row(
            "SELECT percentile_extrapolated FROM entity_machine_stats
             WHERE entity_id = 'P' AND season = 21 AND venue_key = 'ALL'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(stored, 1);
}

#[test]
fn stored_percentiles_match_a_lookup_on_the_season_curve() {
    let mut conn = fresh_db();
    let league = synthetic::generate_league(&SyntheticConfig::default(), 11).unwrap();
    synthetic::write_league(&mut conn, &league).unwrap();
    pipeline::refresh_season(&mut conn, 20, &Policy::default()).unwrap();

    let curves = percentiles::load_curves(&conn, 20).unwrap();
    let mut stmt = conn
        .prepare(
            "SELECT machine_id, venue_key, median_score, avg_score,
                    median_percentile, avg_percentile, percentile_extrapolated
             FROM entity_machine_stats
             WHERE season = 20 AND median_percentile IS NOT NULL",
        )
        .unwrap();
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, i64>(6)? != 0,
            ))
        })
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert!(!rows.is_empty());

    for (machine, venue, median, avg, median_pct, avg_pct, extrapolated) in rows {
        let curve = &curves[&(machine.clone(), VenueScope::from_key(&venue))];
        let median_pos = curve.rank_of(median);
        let avg_pos = curve.rank_of(avg);
        assert!((median_pct - median_pos.rank).abs() < 1e-9, "{machine}/{venue} median");
        assert!((avg_pct - avg_pos.rank).abs() < 1e-9, "{machine}/{venue} avg");
        assert_eq!(extrapolated, median_pos.is_extrapolated() || avg_pos.is_extrapolated());
    }
}
