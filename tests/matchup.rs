mod common;

use league_stats::config::Policy;
use league_stats::matchup::{self, ConfidenceBasis, MatchupRequest};
use league_stats::pipeline;
use league_stats::synthetic::{self, SyntheticConfig};

use common::{add_match, add_score, equip, fresh_db};

fn request(venue: &str, home: &str, away: &str, seasons: Vec<u32>) -> MatchupRequest {
    MatchupRequest {
        venue_id: venue.to_string(),
        home_team_id: home.to_string(),
        away_team_id: away.to_string(),
        seasons,
        home_roster: None,
        away_roster: None,
    }
}

#[test]
fn estimates_cover_only_machines_at_the_venue() {
    let mut conn = fresh_db();
    equip(&conn, "V", 20, &["M", "N"]);
    equip(&conn, "NEXT", 20, &["M"]);
    let m = add_match(&conn, "m1", 20, "V", "H", "A");
    for (round, score) in [(1, 100), (2, 120), (3, 140), (4, 160)] {
        add_score(&conn, &m, round, 1, "M", "hp", true, score);
        add_score(&conn, &m, round, 1, "M", "ap", false, score / 2);
    }
    add_score(&conn, &m, 1, 2, "N", "hp", true, 500);
    pipeline::refresh_season(&mut conn, 20, &Policy::default()).unwrap();

    let prediction =
        matchup::predict_matchup(&conn, &request("NEXT", "H", "A", vec![20]), &Policy::default())
            .unwrap();
    assert_eq!(prediction.seasons_analyzed, vec![20]);
    assert!(prediction.per_player.iter().all(|e| e.machine_id == "M"));

    let hp = prediction
        .per_player
        .iter()
        .find(|e| e.player_id == "hp")
        .unwrap();
    assert_eq!(hp.team_id, "H");
    assert_eq!(hp.games_played, 4);
    assert_eq!(hp.expected_score, 130.0);
    assert!(hp.low_confidence);
    assert!(hp.confidence_low <= hp.expected_score && hp.expected_score <= hp.confidence_high);
    assert!(hp.confidence_low >= 0.0);

    assert_eq!(prediction.team_confidence.len(), 2);
    for team in &prediction.team_confidence {
        assert_eq!(team.confidence_basis, ConfidenceBasis::HeuristicRoster);
    }
}

#[test]
fn explicit_roster_limits_players() {
    let mut conn = fresh_db();
    equip(&conn, "V", 20, &["M"]);
    let m = add_match(&conn, "m1", 20, "V", "H", "A");
    add_score(&conn, &m, 1, 1, "M", "h1", true, 100);
    add_score(&conn, &m, 1, 1, "M", "h2", true, 200);
    pipeline::refresh_season(&mut conn, 20, &Policy::default()).unwrap();

    let mut req = request("V", "H", "A", vec![20]);
    req.home_roster = Some(vec!["h2".to_string()]);
    let prediction = matchup::predict_matchup(&conn, &req, &Policy::default()).unwrap();
    let players = prediction
        .per_player
        .iter()
        .map(|e| e.player_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(players, vec!["h2"]);
}

#[test]
fn generated_league_matchup_serializes_with_heuristic_tag() {
    let mut conn = fresh_db();
    let league = synthetic::generate_league(&SyntheticConfig::default(), 9).unwrap();
    synthetic::write_league(&mut conn, &league).unwrap();
    let policy = Policy::default();
    for season in [20, 21] {
        pipeline::refresh_season(&mut conn, season, &policy).unwrap();
    }

    let prediction =
        matchup::predict_matchup(&conn, &request("V1", "T01", "T02", vec![20, 21]), &policy)
            .unwrap();
    assert!(!prediction.per_player.is_empty());
    for e in &prediction.per_player {
        assert!(e.confidence_low <= e.expected_score);
        assert!(e.expected_score <= e.confidence_high);
        assert_eq!(e.low_confidence, e.games_played < policy.small_sample_games);
    }
    for team in &prediction.team_confidence {
        for machine in &team.machines {
            assert!(machine.player_ids.len() <= policy.fielded_players_per_machine);
        }
    }
    let json = serde_json::to_value(&prediction).unwrap();
    assert_eq!(json["team_confidence"][0]["confidence_basis"], "heuristic_roster");
}

#[test]
fn empty_season_window_is_rejected() {
    let conn = fresh_db();
    assert!(matchup::predict_matchup(&conn, &request("V", "H", "A", vec![]), &Policy::default()).is_err());
}
