use std::collections::BTreeMap;

use anyhow::{Context, Result};
use raceline_core::DimensionKind;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::{collect_rows, count_rows, SqliteRaceStore};

const SUMMARY_CONTRACT_VERSION: &str = "store_summary.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreSummary {
    pub contract_version: String,
    pub events: usize,
    pub undated_events: usize,
    pub first_event_date: Option<String>,
    pub last_event_date: Option<String>,
    pub outcomes: usize,
    pub linked_outcomes: usize,
    pub never_linked_outcomes: usize,
    pub participants: usize,
    pub handlers: usize,
    pub operators: usize,
    pub courses: usize,
    pub failures_by_phase: BTreeMap<String, usize>,
    pub fetch_states: BTreeMap<String, usize>,
}

/// Null counts of one event's outcome columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventQuality {
    pub event_id: String,
    pub event_date: Option<String>,
    pub outcome_rows: usize,
    pub rank_nulls: usize,
    pub elapsed_nulls: usize,
    pub margin_nulls: usize,
    pub split_nulls: usize,
    pub corner_nulls: usize,
    pub handler_nulls: usize,
    pub operator_nulls: usize,
}

/// A dimension entity still carrying a parser placeholder name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnresolvedName {
    pub kind: DimensionKind,
    pub entity_id: String,
    pub name: String,
    pub outcome_rows: usize,
}

impl SqliteRaceStore {
    pub fn summary(&self) -> Result<StoreSummary> {
        let (first_event_date, last_event_date) = self
            .conn
            .query_row(
                "SELECT MIN(event_date), MAX(event_date) FROM events WHERE event_date IS NOT NULL",
                [],
                |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .context("failed to query event date range")?;

        Ok(StoreSummary {
            contract_version: SUMMARY_CONTRACT_VERSION.to_string(),
            events: count_rows(&self.conn, "SELECT COUNT(*) FROM events")?,
            undated_events: count_rows(&self.conn, "SELECT COUNT(*) FROM events WHERE event_date IS NULL")?,
            first_event_date,
            last_event_date,
            outcomes: count_rows(&self.conn, "SELECT COUNT(*) FROM outcomes")?,
            linked_outcomes: count_rows(
                &self.conn,
                "SELECT COUNT(*) FROM outcomes WHERE prev_event_id IS NOT NULL",
            )?,
            never_linked_outcomes: count_rows(
                &self.conn,
                "SELECT COUNT(*) FROM outcomes WHERE linked_at IS NULL",
            )?,
            participants: count_rows(&self.conn, "SELECT COUNT(*) FROM participants")?,
            handlers: count_rows(&self.conn, "SELECT COUNT(*) FROM handlers")?,
            operators: count_rows(&self.conn, "SELECT COUNT(*) FROM operators")?,
            courses: count_rows(&self.conn, "SELECT COUNT(*) FROM courses")?,
            failures_by_phase: self.grouped_counts(
                "SELECT phase, COUNT(*) FROM failure_ledger GROUP BY phase ORDER BY phase",
            )?,
            fetch_states: self.grouped_counts(
                "SELECT state, COUNT(*) FROM fetch_state GROUP BY state ORDER BY state",
            )?,
        })
    }

    /// Per-event null counts, optionally for a single event.
    pub fn quality_report(&self, event_id: Option<&str>) -> Result<Vec<EventQuality>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT
                    e.event_id,
                    e.event_date,
                    COUNT(o.participant_id),
                    COALESCE(SUM(CASE WHEN o.participant_id IS NOT NULL AND o.rank IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN o.participant_id IS NOT NULL AND o.elapsed_sec IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN o.participant_id IS NOT NULL AND o.margin_sec IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN o.participant_id IS NOT NULL AND o.split_sec IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN o.participant_id IS NOT NULL AND o.corner_positions IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN o.participant_id IS NOT NULL AND o.handler_id IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN o.participant_id IS NOT NULL AND o.operator_id IS NULL THEN 1 ELSE 0 END), 0)
                 FROM events e
                 LEFT JOIN outcomes o ON o.event_id = e.event_id
                 WHERE (?1 IS NULL OR e.event_id = ?1)
                 GROUP BY e.event_id, e.event_date
                 ORDER BY e.event_date ASC, e.event_id ASC",
            )
            .context("failed to prepare quality report query")?;

        let rows = stmt
            .query_map(params![event_id], |row| {
                Ok(EventQuality {
                    event_id: row.get(0)?,
                    event_date: row.get(1)?,
                    outcome_rows: count_column(row, 2)?,
                    rank_nulls: count_column(row, 3)?,
                    elapsed_nulls: count_column(row, 4)?,
                    margin_nulls: count_column(row, 5)?,
                    split_nulls: count_column(row, 6)?,
                    corner_nulls: count_column(row, 7)?,
                    handler_nulls: count_column(row, 8)?,
                    operator_nulls: count_column(row, 9)?,
                })
            })
            .context("failed to query quality report")?;
        collect_rows(rows)
    }

    /// Dimension entities whose name starts with `prefix`, with the number of
    /// outcome rows that reference each of them.
    pub fn unresolved_names(&self, prefix: &str) -> Result<Vec<UnresolvedName>> {
        let mut unresolved = Vec::new();
        for (kind, table, id_column, outcome_column) in [
            (DimensionKind::Participant, "participants", "participant_id", "participant_id"),
            (DimensionKind::Handler, "handlers", "handler_id", "handler_id"),
            (DimensionKind::Operator, "operators", "operator_id", "operator_id"),
        ] {
            let sql = format!(
                "SELECT d.{id_column}, d.name, COUNT(o.event_id)
                 FROM {table} d
                 LEFT JOIN outcomes o ON o.{outcome_column} = d.{id_column}
                 WHERE substr(d.name, 1, length(?1)) = ?1
                 GROUP BY d.{id_column}, d.name
                 ORDER BY d.{id_column} ASC"
            );
            let mut stmt = self
                .conn
                .prepare(&sql)
                .with_context(|| format!("failed to prepare unresolved {kind} query"))?;
            let rows = stmt
                .query_map(params![prefix], |row| {
                    Ok(UnresolvedName {
                        kind,
                        entity_id: row.get(0)?,
                        name: row.get(1)?,
                        outcome_rows: count_column(row, 2)?,
                    })
                })
                .with_context(|| format!("failed to query unresolved {kind} names"))?;
            unresolved.extend(collect_rows(rows)?);
        }
        Ok(unresolved)
    }

    fn grouped_counts(&self, sql: &str) -> Result<BTreeMap<String, usize>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("failed to prepare grouped count: {sql}"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, count_column(row, 1)?)))
            .with_context(|| format!("failed to run grouped count: {sql}"))?;
        Ok(collect_rows(rows)?.into_iter().collect())
    }
}

fn count_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<usize> {
    let raw: i64 = row.get(idx)?;
    usize::try_from(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(err))
    })
}
