#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! `SQLite` persistence for raceline: base facts, dimension entities, the
//! failure ledger, fetch state, linkage application and derived projections.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use raceline_core::{format_rfc3339, now_utc, FinishStatus};
use rusqlite::{params, Connection, OptionalExtension};

mod ledger;
mod linkage;
mod load;
mod report;
mod resolver;
mod views;

pub use ledger::{FailureFilter, FailureLedgerEntry, FetchStateRecord};
pub use linkage::{LinkageCheck, LinkageDrift, LinkageIssue, LinkageIssueSeverity, LinkageReport};
pub use load::{LoadOutcome, LoadReport};
pub use report::{EventQuality, StoreSummary, UnresolvedName};
pub use resolver::{resolve_agent, resolve_participant, Resolution};
pub use views::{ImputedRow, JoinedRow};

const SCHEMA_MIGRATION_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS courses (
  course_id TEXT PRIMARY KEY,
  venue_id TEXT,
  course_name TEXT NOT NULL,
  surface TEXT,
  track_type TEXT,
  straight_len_m INTEGER,
  slope_max REAL
);

CREATE TABLE IF NOT EXISTS participants (
  participant_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  sex TEXT,
  birth_year INTEGER,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS handlers (
  handler_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS operators (
  operator_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_participants_immutable
BEFORE UPDATE ON participants
BEGIN
  SELECT RAISE(FAIL, 'participants are immutable once created');
END;

CREATE TRIGGER IF NOT EXISTS trg_participants_no_delete
BEFORE DELETE ON participants
BEGIN
  SELECT RAISE(FAIL, 'participants are immutable once created');
END;

CREATE TRIGGER IF NOT EXISTS trg_handlers_immutable
BEFORE UPDATE ON handlers
BEGIN
  SELECT RAISE(FAIL, 'handlers are immutable once created');
END;

CREATE TRIGGER IF NOT EXISTS trg_handlers_no_delete
BEFORE DELETE ON handlers
BEGIN
  SELECT RAISE(FAIL, 'handlers are immutable once created');
END;

CREATE TRIGGER IF NOT EXISTS trg_operators_immutable
BEFORE UPDATE ON operators
BEGIN
  SELECT RAISE(FAIL, 'operators are immutable once created');
END;

CREATE TRIGGER IF NOT EXISTS trg_operators_no_delete
BEFORE DELETE ON operators
BEGIN
  SELECT RAISE(FAIL, 'operators are immutable once created');
END;

CREATE TABLE IF NOT EXISTS events (
  event_id TEXT PRIMARY KEY,
  event_date TEXT,
  course_id TEXT,
  venue_id TEXT,
  race_no INTEGER NOT NULL CHECK (race_no >= 1),
  race_name TEXT,
  distance_m INTEGER CHECK (distance_m > 0 OR distance_m IS NULL),
  surface TEXT,
  weather TEXT,
  going TEXT,
  race_class TEXT,
  age_condition TEXT,
  sex_condition TEXT,
  num_runners INTEGER,
  winning_time_sec REAL,
  loaded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_events_no_delete
BEFORE DELETE ON events
BEGIN
  SELECT RAISE(FAIL, 'events are overwrite-only');
END;

CREATE TABLE IF NOT EXISTS outcomes (
  event_id TEXT NOT NULL,
  participant_id TEXT NOT NULL,
  post_position INTEGER,
  entry_number INTEGER,
  rank INTEGER CHECK (rank >= 1 OR rank IS NULL),
  status TEXT NOT NULL CHECK (
    status IN ('finished', 'did_not_finish', 'disqualified', 'scratched')
  ),
  elapsed_sec REAL,
  margin_sec REAL,
  split_sec REAL,
  corner_positions TEXT,
  carried_weight REAL,
  body_weight INTEGER,
  body_weight_diff INTEGER,
  odds REAL,
  popularity INTEGER,
  prize INTEGER,
  handler_id TEXT,
  operator_id TEXT,
  prev_event_id TEXT,
  prev_rank INTEGER,
  prev_margin_sec REAL,
  prev_elapsed_sec REAL,
  prev_split_sec REAL,
  days_since_last INTEGER CHECK (days_since_last >= 1 OR days_since_last IS NULL),
  linked_at TEXT,
  loaded_at TEXT NOT NULL,
  PRIMARY KEY (event_id, participant_id),
  CHECK (status <> 'finished' OR rank IS NOT NULL),
  FOREIGN KEY (event_id) REFERENCES events(event_id),
  FOREIGN KEY (participant_id) REFERENCES participants(participant_id),
  FOREIGN KEY (handler_id) REFERENCES handlers(handler_id),
  FOREIGN KEY (operator_id) REFERENCES operators(operator_id)
);

CREATE TRIGGER IF NOT EXISTS trg_outcomes_no_delete
BEFORE DELETE ON outcomes
BEGIN
  SELECT RAISE(FAIL, 'outcomes are overwrite-only');
END;

CREATE INDEX IF NOT EXISTS idx_events_date ON events(event_date, race_no);
CREATE INDEX IF NOT EXISTS idx_outcomes_participant ON outcomes(participant_id);
CREATE INDEX IF NOT EXISTS idx_outcomes_handler ON outcomes(handler_id);
CREATE INDEX IF NOT EXISTS idx_outcomes_operator ON outcomes(operator_id);
CREATE INDEX IF NOT EXISTS idx_outcomes_prev_event ON outcomes(prev_event_id);

CREATE TABLE IF NOT EXISTS failure_ledger (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  source_id TEXT NOT NULL,
  phase TEXT NOT NULL CHECK (phase IN ('fetch', 'parse', 'load', 'linkage')),
  error_kind TEXT NOT NULL,
  error_message TEXT NOT NULL,
  run_id TEXT,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_failure_ledger_no_update
BEFORE UPDATE ON failure_ledger
BEGIN
  SELECT RAISE(FAIL, 'failure_ledger is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_failure_ledger_no_delete
BEFORE DELETE ON failure_ledger
BEGIN
  SELECT RAISE(FAIL, 'failure_ledger is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_failure_ledger_source_seq
  ON failure_ledger(source_id, entry_seq);
CREATE INDEX IF NOT EXISTS idx_failure_ledger_phase_seq
  ON failure_ledger(phase, entry_seq);

CREATE TABLE IF NOT EXISTS fetch_state (
  source_id TEXT PRIMARY KEY,
  state TEXT NOT NULL CHECK (state IN ('fetched', 'failed', 'skipped')),
  detail TEXT,
  attempts INTEGER NOT NULL DEFAULT 1 CHECK (attempts >= 1),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS outcome_imputed (
  event_id TEXT NOT NULL,
  participant_id TEXT NOT NULL,
  split_sec REAL,
  split_missing INTEGER NOT NULL CHECK (split_missing IN (0, 1)),
  margin_sec REAL,
  margin_missing INTEGER NOT NULL CHECK (margin_missing IN (0, 1)),
  split_median REAL,
  margin_median REAL,
  built_at TEXT NOT NULL,
  PRIMARY KEY (event_id, participant_id)
);

CREATE VIEW IF NOT EXISTS v_outcome_features AS
SELECT
  o.event_id,
  e.event_date,
  e.race_no,
  e.race_name,
  e.course_id,
  c.course_name,
  COALESCE(e.venue_id, c.venue_id) AS venue_id,
  e.distance_m,
  e.surface,
  e.weather,
  e.going,
  e.race_class,
  e.age_condition,
  e.sex_condition,
  e.num_runners,
  e.winning_time_sec,
  c.surface AS course_surface,
  c.track_type,
  c.straight_len_m,
  c.slope_max,
  o.participant_id,
  p.name AS participant_name,
  p.sex AS participant_sex,
  p.birth_year AS participant_birth_year,
  o.handler_id,
  h.name AS handler_name,
  o.operator_id,
  op.name AS operator_name,
  o.post_position,
  o.entry_number,
  o.rank,
  o.status,
  o.elapsed_sec,
  o.margin_sec,
  o.split_sec,
  o.corner_positions,
  o.carried_weight,
  o.body_weight,
  o.body_weight_diff,
  o.odds,
  o.popularity,
  o.prize,
  o.prev_event_id,
  o.prev_rank,
  o.prev_margin_sec,
  o.prev_elapsed_sec,
  o.prev_split_sec,
  o.days_since_last
FROM outcomes o
JOIN events e ON e.event_id = o.event_id
JOIN participants p ON p.participant_id = o.participant_id
LEFT JOIN courses c ON c.course_id = e.course_id
LEFT JOIN handlers h ON h.handler_id = o.handler_id
LEFT JOIN operators op ON op.operator_id = o.operator_id;
";

pub struct SqliteRaceStore {
    conn: Connection,
}

impl SqliteRaceStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply raceline schema")?;

        let now = timestamp_now()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_MIGRATION_VERSION, now],
            )
            .context("failed to register raceline schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        let version = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()
            .context("failed to query schema version")?
            .flatten();
        Ok(version)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn timestamp_now() -> Result<String> {
    format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn parse_status(raw: &str, column: usize) -> rusqlite::Result<FinishStatus> {
    FinishStatus::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid status: {raw}"),
            )),
        )
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn count_rows(conn: &Connection, sql: &str) -> Result<usize> {
    let count = conn
        .query_row(sql, [], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to run count query: {sql}"))?;
    usize::try_from(count).with_context(|| format!("invalid row count: {count}"))
}
