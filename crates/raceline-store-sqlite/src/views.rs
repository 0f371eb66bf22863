//! Read-only analytical projections over the base facts.

use anyhow::{Context, Result};
use raceline_core::{impute_column, parse_event_date, FinishStatus, ScopeFilter};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::{bool_to_sql, collect_rows, parse_status, timestamp_now, SqliteRaceStore};

/// One row of the joined outcome projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinedRow {
    pub event_id: String,
    pub event_date: Option<String>,
    pub race_no: u32,
    pub race_name: Option<String>,
    pub course_id: Option<String>,
    pub course_name: Option<String>,
    pub venue_id: Option<String>,
    pub distance_m: Option<u32>,
    pub surface: Option<String>,
    pub weather: Option<String>,
    pub going: Option<String>,
    pub race_class: Option<String>,
    pub age_condition: Option<String>,
    pub sex_condition: Option<String>,
    pub num_runners: Option<u32>,
    pub winning_time_sec: Option<f64>,
    pub course_surface: Option<String>,
    pub track_type: Option<String>,
    pub straight_len_m: Option<i64>,
    pub slope_max: Option<f64>,
    pub participant_id: String,
    pub participant_name: String,
    pub participant_sex: Option<String>,
    pub participant_birth_year: Option<i32>,
    pub handler_id: Option<String>,
    pub handler_name: Option<String>,
    pub operator_id: Option<String>,
    pub operator_name: Option<String>,
    pub post_position: Option<u32>,
    pub entry_number: Option<u32>,
    pub rank: Option<u32>,
    pub status: FinishStatus,
    pub elapsed_sec: Option<f64>,
    pub margin_sec: Option<f64>,
    pub split_sec: Option<f64>,
    pub corner_positions: Option<String>,
    pub carried_weight: Option<f64>,
    pub body_weight: Option<i64>,
    pub body_weight_diff: Option<i64>,
    pub odds: Option<f64>,
    pub popularity: Option<u32>,
    pub prize: Option<i64>,
    pub prev_event_id: Option<String>,
    pub prev_rank: Option<u32>,
    pub prev_margin_sec: Option<f64>,
    pub prev_elapsed_sec: Option<f64>,
    pub prev_split_sec: Option<f64>,
    pub days_since_last: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImputedRow {
    pub event_id: String,
    pub participant_id: String,
    pub split_sec: Option<f64>,
    pub split_missing: bool,
    pub margin_sec: Option<f64>,
    pub margin_missing: bool,
    pub split_median: Option<f64>,
    pub margin_median: Option<f64>,
}

struct ObservedRow {
    event_id: String,
    event_date: Option<String>,
    participant_id: String,
    split_sec: Option<f64>,
    margin_sec: Option<f64>,
}

impl SqliteRaceStore {
    pub fn joined_projection(&self, scope: &ScopeFilter, limit: Option<usize>) -> Result<Vec<JoinedRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT event_id, event_date, race_no, race_name, course_id, course_name, venue_id,
                        distance_m, surface, weather, going, race_class, age_condition,
                        sex_condition, num_runners, winning_time_sec, course_surface, track_type,
                        straight_len_m, slope_max, participant_id, participant_name,
                        participant_sex, participant_birth_year, handler_id, handler_name,
                        operator_id, operator_name, post_position, entry_number, rank, status,
                        elapsed_sec, margin_sec, split_sec, corner_positions, carried_weight,
                        body_weight, body_weight_diff, odds, popularity, prize, prev_event_id,
                        prev_rank, prev_margin_sec, prev_elapsed_sec, prev_split_sec,
                        days_since_last
                 FROM v_outcome_features
                 ORDER BY event_date ASC, race_no ASC, event_id ASC,
                          COALESCE(rank, 999999) ASC, participant_id ASC",
            )
            .context("failed to prepare joined projection query")?;
        let rows = stmt
            .query_map([], parse_joined_row)
            .context("failed to query joined projection")?;

        let mut projected = Vec::new();
        for row in collect_rows(rows)? {
            if !admits(scope, &row.event_id, row.event_date.as_deref(), &row.participant_id) {
                continue;
            }
            projected.push(row);
            if limit.is_some_and(|max| projected.len() >= max) {
                break;
            }
        }
        Ok(projected)
    }

    /// Per-event median imputation of `split_sec` and `margin_sec`.
    ///
    /// Medians always use every outcome of an event; a participant filter in
    /// `scope` only narrows which rows are returned.
    pub fn imputed_projection(&self, scope: &ScopeFilter) -> Result<Vec<ImputedRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT o.event_id, e.event_date, o.participant_id, o.split_sec, o.margin_sec
                 FROM outcomes o
                 JOIN events e ON e.event_id = o.event_id
                 ORDER BY o.event_id ASC, o.participant_id ASC",
            )
            .context("failed to prepare imputation source query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ObservedRow {
                    event_id: row.get(0)?,
                    event_date: row.get(1)?,
                    participant_id: row.get(2)?,
                    split_sec: row.get(3)?,
                    margin_sec: row.get(4)?,
                })
            })
            .context("failed to query imputation source rows")?;
        let observed = collect_rows(rows)?;

        let mut imputed = Vec::new();
        for group in observed.chunk_by(|lhs, rhs| lhs.event_id == rhs.event_id) {
            let head = &group[0];
            let date = head.event_date.as_deref().and_then(|raw| parse_event_date(raw).ok());
            if !scope.admits_event(&head.event_id, date) {
                continue;
            }

            let splits: Vec<Option<f64>> = group.iter().map(|row| row.split_sec).collect();
            let margins: Vec<Option<f64>> = group.iter().map(|row| row.margin_sec).collect();
            let split_column = impute_column(&splits);
            let margin_column = impute_column(&margins);

            for ((row, split), margin) in group
                .iter()
                .zip(&split_column.values)
                .zip(&margin_column.values)
            {
                if !scope.participant_ids.is_empty() && !scope.participant_ids.contains(&row.participant_id) {
                    continue;
                }
                imputed.push(ImputedRow {
                    event_id: row.event_id.clone(),
                    participant_id: row.participant_id.clone(),
                    split_sec: split.value,
                    split_missing: split.missing,
                    margin_sec: margin.value,
                    margin_missing: margin.missing,
                    split_median: split_column.median,
                    margin_median: margin_column.median,
                });
            }
        }
        Ok(imputed)
    }

    /// Replaces the materialized `outcome_imputed` table with a fresh build.
    pub fn rebuild_imputed_table(&mut self) -> Result<usize> {
        let rows = self.imputed_projection(&ScopeFilter::default())?;
        let now = timestamp_now()?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start imputation rebuild transaction")?;
        tx.execute("DELETE FROM outcome_imputed", [])
            .context("failed to clear outcome_imputed")?;
        for row in &rows {
            tx.execute(
                "INSERT INTO outcome_imputed(
                    event_id, participant_id, split_sec, split_missing, margin_sec,
                    margin_missing, split_median, margin_median, built_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    row.event_id,
                    row.participant_id,
                    row.split_sec,
                    bool_to_sql(row.split_missing),
                    row.margin_sec,
                    bool_to_sql(row.margin_missing),
                    row.split_median,
                    row.margin_median,
                    now,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to materialize imputed row {}/{}",
                    row.event_id, row.participant_id
                )
            })?;
        }
        tx.commit()
            .context("failed to commit imputation rebuild transaction")?;

        tracing::info!(rows = rows.len(), "outcome_imputed rebuilt");
        Ok(rows.len())
    }
}

fn admits(scope: &ScopeFilter, event_id: &str, event_date: Option<&str>, participant_id: &str) -> bool {
    if !scope.participant_ids.is_empty() && !scope.participant_ids.iter().any(|item| item == participant_id) {
        return false;
    }
    let date = event_date.and_then(|raw| parse_event_date(raw).ok());
    scope.admits_event(event_id, date)
}

fn parse_joined_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JoinedRow> {
    let status_index = row.as_ref().column_index("status")?;
    let status_raw: String = row.get(status_index)?;
    Ok(JoinedRow {
        event_id: row.get("event_id")?,
        event_date: row.get("event_date")?,
        race_no: row.get("race_no")?,
        race_name: row.get("race_name")?,
        course_id: row.get("course_id")?,
        course_name: row.get("course_name")?,
        venue_id: row.get("venue_id")?,
        distance_m: row.get("distance_m")?,
        surface: row.get("surface")?,
        weather: row.get("weather")?,
        going: row.get("going")?,
        race_class: row.get("race_class")?,
        age_condition: row.get("age_condition")?,
        sex_condition: row.get("sex_condition")?,
        num_runners: row.get("num_runners")?,
        winning_time_sec: row.get("winning_time_sec")?,
        course_surface: row.get("course_surface")?,
        track_type: row.get("track_type")?,
        straight_len_m: row.get("straight_len_m")?,
        slope_max: row.get("slope_max")?,
        participant_id: row.get("participant_id")?,
        participant_name: row.get("participant_name")?,
        participant_sex: row.get("participant_sex")?,
        participant_birth_year: row.get("participant_birth_year")?,
        handler_id: row.get("handler_id")?,
        handler_name: row.get("handler_name")?,
        operator_id: row.get("operator_id")?,
        operator_name: row.get("operator_name")?,
        post_position: row.get("post_position")?,
        entry_number: row.get("entry_number")?,
        rank: row.get("rank")?,
        status: parse_status(&status_raw, status_index)?,
        elapsed_sec: row.get("elapsed_sec")?,
        margin_sec: row.get("margin_sec")?,
        split_sec: row.get("split_sec")?,
        corner_positions: row.get("corner_positions")?,
        carried_weight: row.get("carried_weight")?,
        body_weight: row.get("body_weight")?,
        body_weight_diff: row.get("body_weight_diff")?,
        odds: row.get("odds")?,
        popularity: row.get("popularity")?,
        prize: row.get("prize")?,
        prev_event_id: row.get("prev_event_id")?,
        prev_rank: row.get("prev_rank")?,
        prev_margin_sec: row.get("prev_margin_sec")?,
        prev_elapsed_sec: row.get("prev_elapsed_sec")?,
        prev_split_sec: row.get("prev_split_sec")?,
        days_since_last: row.get("days_since_last")?,
    })
}
