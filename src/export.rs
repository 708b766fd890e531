use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use rusqlite::types::Value;
use rust_xlsxwriter::{Workbook, Worksheet};
use tracing::info;

pub struct ExportReport {
    pub season: u32,
    pub percentile_rows: usize,
    pub player_rows: usize,
    pub team_rows: usize,
    pub pick_rows: usize,
}

const PERCENTILE_SQL: &str = r#"
    SELECT machine_id, venue_key, season, percentile_rank, score_value, sample_size
    FROM percentile_thresholds WHERE season = ?1
    ORDER BY machine_id ASC, venue_key ASC, percentile_rank ASC
"#;

const ENTITY_SQL: &str = r#"
    SELECT entity_id, machine_id, venue_key, season, games_played, median_score, avg_score,
           best_score, worst_score, score_stddev, median_percentile, avg_percentile,
           percentile_extrapolated
    FROM entity_machine_stats WHERE season = ?1 AND entity_kind = ?2
    ORDER BY entity_id ASC, machine_id ASC, venue_key ASC
"#;

const PICK_SQL: &str = r#"
    SELECT team_id, machine_id, round_context, is_home, opportunities, times_picked
    FROM pick_records WHERE season = ?1
    ORDER BY team_id ASC, round_context ASC, machine_id ASC
"#;

pub fn export_season_workbook(conn: &Connection, season: u32, path: &Path) -> Result<ExportReport> {
    let mut percentile_rows = vec![header(&[
        "machine", "venue", "season", "rank", "score", "sample",
    ])];
    percentile_rows.extend(query_rows(conn, PERCENTILE_SQL, &[Value::from(season as i64)])?);

    let entity_header = header(&[
        "entity", "machine", "venue", "season", "games", "median", "mean", "best", "worst",
        "stddev", "median_pct", "avg_pct", "extrapolated",
    ]);
    let mut player_rows = vec![entity_header.clone()];
    player_rows.extend(query_rows(
        conn,
        ENTITY_SQL,
        &[Value::from(season as i64), Value::from("player".to_string())],
    )?);
    let mut team_rows = vec![entity_header];
    team_rows.extend(query_rows(
        conn,
        ENTITY_SQL,
        &[Value::from(season as i64), Value::from("team".to_string())],
    )?);

    let mut pick_rows = vec![header(&[
        "team", "machine", "round", "is_home", "opportunities", "picked",
    ])];
    pick_rows.extend(query_rows(conn, PICK_SQL, &[Value::from(season as i64)])?);

    let mut workbook = Workbook::new();
    for (name, rows) in [
        ("Percentiles", &percentile_rows),
        ("PlayerStats", &player_rows),
        ("TeamStats", &team_rows),
        ("PickRecords", &pick_rows),
    ] {
        let sheet = workbook.add_worksheet();
        sheet.set_name(name)?;
        write_rows(sheet, rows)?;
    }
    workbook
        .save(path)
        .with_context(|| format!("failed writing workbook to {}", path.display()))?;

    let report = ExportReport {
        season,
        percentile_rows: percentile_rows.len().saturating_sub(1),
        player_rows: player_rows.len().saturating_sub(1),
        team_rows: team_rows.len().saturating_sub(1),
        pick_rows: pick_rows.len().saturating_sub(1),
    };
    info!(
        season,
        path = %path.display(),
        percentiles = report.percentile_rows,
        players = report.player_rows,
        teams = report.team_rows,
        picks = report.pick_rows,
        "season workbook written"
    );
    Ok(report)
}

fn header(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn query_rows(conn: &Connection, sql: &str, args: &[Value]) -> Result<Vec<Vec<String>>> {
    let mut stmt = conn.prepare(sql).context("prepare export query")?;
    let columns = stmt.column_count();
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |row| {
            (0..columns)
                .map(|idx| row.get::<_, Value>(idx).map(cell_text))
                .collect::<rusqlite::Result<Vec<String>>>()
        })
        .context("query export rows")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode export row")?);
    }
    Ok(out)
}

fn cell_text(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(v) => v.to_string(),
        Value::Real(v) => format!("{v:.2}"),
        Value::Text(v) => v,
        Value::Blob(_) => String::new(),
    }
}

fn write_rows(worksheet: &mut Worksheet, rows: &[Vec<String>]) -> Result<()> {
    for (row_idx, row) in rows.iter().enumerate() {
        for (col_idx, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            worksheet
                .write_string(row_idx as u32, col_idx as u16, value)
                .with_context(|| format!("write cell ({row_idx},{col_idx})"))?;
        }
    }
    Ok(())
}
