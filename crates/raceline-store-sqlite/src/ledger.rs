//! Append-only failure ledger and per-source fetch state.

use anyhow::{anyhow, Context, Result};
use raceline_core::{FailurePhase, FetchState};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::{collect_rows, timestamp_now, SqliteRaceStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureLedgerEntry {
    pub entry_seq: i64,
    pub source_id: String,
    pub phase: FailurePhase,
    pub error_kind: String,
    pub error_message: String,
    pub run_id: Option<String>,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureFilter {
    pub phase: Option<FailurePhase>,
    pub source_id: Option<String>,
    pub run_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchStateRecord {
    pub source_id: String,
    pub state: FetchState,
    pub detail: Option<String>,
    pub attempts: u32,
    pub updated_at: String,
}

impl SqliteRaceStore {
    pub fn record_failure(
        &self,
        source_id: &str,
        phase: FailurePhase,
        error_kind: &str,
        error_message: &str,
        run_id: Option<&str>,
    ) -> Result<FailureLedgerEntry> {
        append_failure(&self.conn, source_id, phase, error_kind, error_message, run_id)
    }

    /// Entries in append order, oldest first.
    pub fn list_failures(&self, filter: &FailureFilter) -> Result<Vec<FailureLedgerEntry>> {
        let limit = filter
            .limit
            .map(i64::try_from)
            .transpose()
            .context("failure limit does not fit in i64")?
            .unwrap_or(-1);

        let mut stmt = self
            .conn
            .prepare(
                "SELECT entry_seq, source_id, phase, error_kind, error_message, run_id, recorded_at
                 FROM failure_ledger
                 WHERE (?1 IS NULL OR phase = ?1)
                   AND (?2 IS NULL OR source_id = ?2)
                   AND (?3 IS NULL OR run_id = ?3)
                 ORDER BY entry_seq ASC
                 LIMIT ?4",
            )
            .context("failed to prepare failure ledger query")?;

        let rows = stmt
            .query_map(
                params![
                    filter.phase.map(FailurePhase::as_str),
                    filter.source_id,
                    filter.run_id,
                    limit
                ],
                parse_failure_row,
            )
            .context("failed to query failure ledger")?;
        collect_rows(rows)
    }

    /// Upserts the fetch state of one source. A `failed` state also appends a
    /// `fetch` entry to the failure ledger in the same transaction.
    pub fn record_fetch_state(
        &mut self,
        source_id: &str,
        state: FetchState,
        detail: Option<&str>,
        run_id: Option<&str>,
    ) -> Result<FetchStateRecord> {
        let source_id = source_id.trim();
        if source_id.is_empty() {
            return Err(anyhow!("source_id MUST be provided"));
        }

        let now = timestamp_now()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start fetch-state transaction")?;

        tx.execute(
            "INSERT INTO fetch_state(source_id, state, detail, attempts, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(source_id) DO UPDATE SET
                state = excluded.state,
                detail = excluded.detail,
                attempts = fetch_state.attempts + 1,
                updated_at = excluded.updated_at",
            params![source_id, state.as_str(), detail, now],
        )
        .with_context(|| format!("failed to record fetch state for {source_id}"))?;

        if state == FetchState::Failed {
            append_failure(
                &tx,
                source_id,
                FailurePhase::Fetch,
                "fetch",
                detail.unwrap_or("fetch failed"),
                run_id,
            )?;
        }

        let record = read_fetch_state(&tx, source_id)?
            .ok_or_else(|| anyhow!("fetch state for {source_id} vanished after upsert"))?;
        tx.commit()
            .context("failed to commit fetch-state transaction")?;

        tracing::debug!(source_id, state = state.as_str(), attempts = record.attempts, "fetch state recorded");
        Ok(record)
    }

    pub fn fetch_state(&self, source_id: &str) -> Result<Option<FetchStateRecord>> {
        read_fetch_state(&self.conn, source_id.trim())
    }

    pub fn list_fetch_states(&self, state: Option<FetchState>) -> Result<Vec<FetchStateRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT source_id, state, detail, attempts, updated_at
                 FROM fetch_state
                 WHERE (?1 IS NULL OR state = ?1)
                 ORDER BY source_id ASC",
            )
            .context("failed to prepare fetch state query")?;
        let rows = stmt
            .query_map(params![state.map(FetchState::as_str)], parse_fetch_state_row)
            .context("failed to query fetch state")?;
        collect_rows(rows)
    }

    /// Filters `candidates` down to the sources that still need fetching:
    /// unknown sources and sources whose last attempt failed.
    pub fn sources_needing_fetch(&self, candidates: &[String]) -> Result<Vec<String>> {
        let mut pending = Vec::new();
        for candidate in candidates {
            let source_id = candidate.trim();
            if source_id.is_empty() {
                continue;
            }
            let settled = read_fetch_state(&self.conn, source_id)?
                .is_some_and(|record| record.state.is_settled());
            if !settled {
                pending.push(source_id.to_string());
            }
        }
        Ok(pending)
    }
}

pub(crate) fn append_failure(
    conn: &Connection,
    source_id: &str,
    phase: FailurePhase,
    error_kind: &str,
    error_message: &str,
    run_id: Option<&str>,
) -> Result<FailureLedgerEntry> {
    let now = timestamp_now()?;
    conn.execute(
        "INSERT INTO failure_ledger(source_id, phase, error_kind, error_message, run_id, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![source_id, phase.as_str(), error_kind, error_message, run_id, now],
    )
    .with_context(|| format!("failed to append {} failure for {source_id}", phase.as_str()))?;

    Ok(FailureLedgerEntry {
        entry_seq: conn.last_insert_rowid(),
        source_id: source_id.to_string(),
        phase,
        error_kind: error_kind.to_string(),
        error_message: error_message.to_string(),
        run_id: run_id.map(ToString::to_string),
        recorded_at: now,
    })
}

fn read_fetch_state(conn: &Connection, source_id: &str) -> Result<Option<FetchStateRecord>> {
    conn.query_row(
        "SELECT source_id, state, detail, attempts, updated_at
         FROM fetch_state WHERE source_id = ?1",
        params![source_id],
        parse_fetch_state_row,
    )
    .optional()
    .with_context(|| format!("failed to read fetch state for {source_id}"))
}

fn parse_failure_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailureLedgerEntry> {
    let phase_raw: String = row.get(2)?;
    let phase = FailurePhase::parse(&phase_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid failure phase: {phase_raw}"),
            )),
        )
    })?;

    Ok(FailureLedgerEntry {
        entry_seq: row.get(0)?,
        source_id: row.get(1)?,
        phase,
        error_kind: row.get(3)?,
        error_message: row.get(4)?,
        run_id: row.get(5)?,
        recorded_at: row.get(6)?,
    })
}

fn parse_fetch_state_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FetchStateRecord> {
    let state_raw: String = row.get(1)?;
    let state = FetchState::parse(&state_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid fetch state: {state_raw}"),
            )),
        )
    })?;

    Ok(FetchStateRecord {
        source_id: row.get(0)?,
        state,
        detail: row.get(2)?,
        attempts: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture_store, must, RUN_ID};

    #[test]
    fn failures_are_listed_in_append_order_with_filters() {
        let store = fixture_store();
        must(store.record_failure("S1", FailurePhase::Fetch, "http", "timeout", Some(RUN_ID)));
        must(store.record_failure("S2", FailurePhase::Parse, "html", "missing table", None));
        must(store.record_failure("S1", FailurePhase::Load, "validation", "bad rank", Some(RUN_ID)));

        let all = must(store.list_failures(&FailureFilter::default()));
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|pair| pair[0].entry_seq < pair[1].entry_seq));

        let by_source = must(store.list_failures(&FailureFilter {
            source_id: Some("S1".to_string()),
            ..FailureFilter::default()
        }));
        assert_eq!(by_source.len(), 2);

        let by_phase = must(store.list_failures(&FailureFilter {
            phase: Some(FailurePhase::Parse),
            ..FailureFilter::default()
        }));
        assert_eq!(by_phase.len(), 1);
        assert_eq!(by_phase[0].run_id, None);

        let limited = must(store.list_failures(&FailureFilter {
            limit: Some(1),
            ..FailureFilter::default()
        }));
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].source_id, "S1");
    }

    #[test]
    fn failure_ledger_is_append_only() {
        let store = fixture_store();
        must(store.record_failure("S1", FailurePhase::Fetch, "http", "timeout", None));

        let update = store
            .connection()
            .execute("UPDATE failure_ledger SET error_message = 'edited'", []);
        assert!(update.is_err());

        let delete = store.connection().execute("DELETE FROM failure_ledger", []);
        assert!(delete.is_err());
    }

    #[test]
    fn fetch_state_tracks_attempts_and_pending_sources() {
        let mut store = fixture_store();
        must(store.record_fetch_state("R1", FetchState::Failed, Some("HTTP 503"), Some(RUN_ID)));
        let retried = must(store.record_fetch_state("R1", FetchState::Fetched, None, Some(RUN_ID)));
        must(store.record_fetch_state("R2", FetchState::Skipped, Some("no results page"), None));
        must(store.record_fetch_state("R3", FetchState::Failed, None, None));

        assert_eq!(retried.attempts, 2);
        assert_eq!(retried.state, FetchState::Fetched);

        let candidates: Vec<String> = ["R1", "R2", "R3", "R4"].iter().map(ToString::to_string).collect();
        let pending = must(store.sources_needing_fetch(&candidates));
        assert_eq!(pending, vec!["R3".to_string(), "R4".to_string()]);

        let failed = must(store.list_fetch_states(Some(FetchState::Failed)));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].source_id, "R3");

        let fetch_failures = must(store.list_failures(&FailureFilter {
            phase: Some(FailurePhase::Fetch),
            ..FailureFilter::default()
        }));
        assert_eq!(fetch_failures.len(), 2);
        assert_eq!(fetch_failures[0].error_message, "HTTP 503");
        assert_eq!(must(store.fetch_state("R4")), None);
    }
}
