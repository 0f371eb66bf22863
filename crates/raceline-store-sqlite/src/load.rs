use anyhow::{anyhow, Context, Result};
use raceline_core::{
    format_event_date, DimensionKind, EventInput, ExtractedEvent, FailurePhase, OutcomeInput,
    RacelineError, ScopeFilter,
};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::resolver::{resolve_agent, resolve_participant, Resolution};
use crate::{timestamp_now, SqliteRaceStore};

const UNKNOWN_SOURCE_ID: &str = "<missing-event-id>";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoadOutcome {
    Committed {
        event_id: String,
        outcome_rows: usize,
        created_entities: usize,
    },
    Rejected {
        source_id: String,
        error_kind: String,
        message: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadReport {
    pub run_id: String,
    pub processed: usize,
    pub committed: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub outcome_rows: usize,
    pub created_entities: usize,
    pub rejected_sources: Vec<String>,
}

impl LoadReport {
    #[must_use]
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            ..Self::default()
        }
    }

    pub fn absorb(&mut self, outcome: &LoadOutcome) {
        self.processed += 1;
        match outcome {
            LoadOutcome::Committed {
                outcome_rows,
                created_entities,
                ..
            } => {
                self.committed += 1;
                self.outcome_rows += outcome_rows;
                self.created_entities += created_entities;
            }
            LoadOutcome::Rejected { source_id, .. } => {
                self.rejected += 1;
                self.rejected_sources.push(source_id.clone());
            }
        }
    }

    /// Folds the counts of another batch of the same run into this report.
    pub fn merge(&mut self, other: LoadReport) {
        self.processed += other.processed;
        self.committed += other.committed;
        self.rejected += other.rejected;
        self.skipped += other.skipped;
        self.outcome_rows += other.outcome_rows;
        self.created_entities += other.created_entities;
        self.rejected_sources.extend(other.rejected_sources);
    }

    /// Counts a source that never became a bundle, e.g. undecodable JSON.
    pub fn note_unparsed(&mut self, source_id: &str) {
        self.processed += 1;
        self.rejected += 1;
        self.rejected_sources.push(source_id.to_string());
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.rejected > 0
    }
}

impl SqliteRaceStore {
    /// Loads one extracted event as a single atomic unit.
    ///
    /// Validation and reference failures are recorded in the failure ledger
    /// and returned as [`LoadOutcome::Rejected`]; nothing of the bundle is
    /// kept. Storage failures are returned as errors.
    pub fn load_extraction(&mut self, bundle: &ExtractedEvent, run_id: &str) -> Result<LoadOutcome> {
        let source_id = source_id_for(&bundle.event);

        if let Err(err) = bundle.validate() {
            return self.reject(&source_id, &err, run_id);
        }

        match self.commit_extraction(bundle) {
            Ok((outcome_rows, created_entities)) => {
                tracing::info!(
                    event_id = %source_id,
                    outcome_rows,
                    created_entities,
                    "event loaded"
                );
                Ok(LoadOutcome::Committed {
                    event_id: source_id,
                    outcome_rows,
                    created_entities,
                })
            }
            Err(err) => {
                let unit_error = err.downcast_ref::<RacelineError>().cloned();
                match unit_error {
                    Some(unit_error) => self.reject(&source_id, &unit_error, run_id),
                    None => Err(err.context(format!("failed to load event {source_id}"))),
                }
            }
        }
    }

    /// Loads every in-scope bundle, isolating failures per bundle.
    pub fn load_batch(
        &mut self,
        bundles: &[ExtractedEvent],
        scope: &ScopeFilter,
        run_id: &str,
    ) -> Result<LoadReport> {
        scope.validate().map_err(|err| anyhow!(err.to_string()))?;

        let mut report = LoadReport::new(run_id);
        for bundle in bundles {
            if !scope.admits_event(bundle.event.event_id.trim(), bundle.event.event_date) {
                report.skipped += 1;
                continue;
            }
            let outcome = self.load_extraction(bundle, run_id)?;
            report.absorb(&outcome);
        }

        tracing::info!(
            run_id,
            processed = report.processed,
            committed = report.committed,
            rejected = report.rejected,
            skipped = report.skipped,
            "load batch finished"
        );
        Ok(report)
    }

    fn reject(&mut self, source_id: &str, err: &RacelineError, run_id: &str) -> Result<LoadOutcome> {
        let message = err.to_string();
        self.record_failure(
            source_id,
            FailurePhase::Load,
            err.kind(),
            &message,
            Some(run_id),
        )?;
        tracing::warn!(
            source_id,
            error_kind = err.kind(),
            error = %message,
            "event rejected"
        );
        Ok(LoadOutcome::Rejected {
            source_id: source_id.to_string(),
            error_kind: err.kind().to_string(),
            message,
        })
    }

    fn commit_extraction(&mut self, bundle: &ExtractedEvent) -> Result<(usize, usize)> {
        let now = timestamp_now()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start load transaction")?;

        let event_id = bundle.event.event_id.trim();
        upsert_event(&tx, event_id, &bundle.event, &now)?;

        let mut created_entities = 0;
        for outcome in &bundle.outcomes {
            let participant = resolve_participant(&tx, &outcome.participant, &now)?;
            let handler = outcome
                .handler
                .as_ref()
                .map(|agent| resolve_agent(&tx, DimensionKind::Handler, agent, &now))
                .transpose()?;
            let operator = outcome
                .operator
                .as_ref()
                .map(|agent| resolve_agent(&tx, DimensionKind::Operator, agent, &now))
                .transpose()?;

            created_entities += [Some(&participant), handler.as_ref(), operator.as_ref()]
                .into_iter()
                .flatten()
                .filter(|resolution| resolution.created)
                .count();

            upsert_outcome(
                &tx,
                event_id,
                outcome,
                &ResolvedRefs {
                    participant: &participant,
                    handler: handler.as_ref(),
                    operator: operator.as_ref(),
                },
                &now,
            )?;
        }

        tx.commit().context("failed to commit load transaction")?;
        Ok((bundle.outcomes.len(), created_entities))
    }
}

struct ResolvedRefs<'a> {
    participant: &'a Resolution,
    handler: Option<&'a Resolution>,
    operator: Option<&'a Resolution>,
}

fn source_id_for(event: &EventInput) -> String {
    let trimmed = event.event_id.trim();
    if trimmed.is_empty() {
        UNKNOWN_SOURCE_ID.to_string()
    } else {
        trimmed.to_string()
    }
}

fn upsert_event(conn: &Connection, event_id: &str, event: &EventInput, loaded_at: &str) -> Result<()> {
    let event_date = event.event_date.map(format_event_date).transpose()?;

    conn.execute(
        "INSERT INTO events(
            event_id, event_date, course_id, venue_id, race_no, race_name, distance_m,
            surface, weather, going, race_class, age_condition, sex_condition,
            num_runners, winning_time_sec, loaded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT(event_id) DO UPDATE SET
            event_date = excluded.event_date,
            course_id = excluded.course_id,
            venue_id = excluded.venue_id,
            race_no = excluded.race_no,
            race_name = excluded.race_name,
            distance_m = excluded.distance_m,
            surface = excluded.surface,
            weather = excluded.weather,
            going = excluded.going,
            race_class = excluded.race_class,
            age_condition = excluded.age_condition,
            sex_condition = excluded.sex_condition,
            num_runners = excluded.num_runners,
            winning_time_sec = excluded.winning_time_sec,
            loaded_at = excluded.loaded_at
         WHERE (
            events.event_date, events.course_id, events.venue_id, events.race_no,
            events.race_name, events.distance_m, events.surface, events.weather,
            events.going, events.race_class, events.age_condition, events.sex_condition,
            events.num_runners, events.winning_time_sec
         ) IS NOT (
            excluded.event_date, excluded.course_id, excluded.venue_id, excluded.race_no,
            excluded.race_name, excluded.distance_m, excluded.surface, excluded.weather,
            excluded.going, excluded.race_class, excluded.age_condition, excluded.sex_condition,
            excluded.num_runners, excluded.winning_time_sec
         )",
        params![
            event_id,
            event_date,
            event.course_id,
            event.venue_id,
            event.race_no,
            event.race_name,
            event.distance_m,
            event.surface,
            event.weather,
            event.going,
            event.race_class,
            event.age_condition,
            event.sex_condition,
            event.num_runners,
            event.winning_time_sec,
            loaded_at,
        ],
    )
    .with_context(|| format!("failed to upsert event {event_id}"))?;

    Ok(())
}

/// Writes the extracted columns of one outcome row. Linkage columns are left
/// untouched on conflict; only the linkage batch writes them. An identical
/// reload leaves the row, including `loaded_at`, as it was.
fn upsert_outcome(
    conn: &Connection,
    event_id: &str,
    outcome: &OutcomeInput,
    refs: &ResolvedRefs<'_>,
    loaded_at: &str,
) -> Result<()> {
    let status = outcome.resolved_status().ok_or_else(|| {
        RacelineError::Validation(format!(
            "outcome for {} has neither rank nor status",
            refs.participant.entity_id
        ))
    })?;

    conn.execute(
        "INSERT INTO outcomes(
            event_id, participant_id, post_position, entry_number, rank, status,
            elapsed_sec, margin_sec, split_sec, corner_positions, carried_weight,
            body_weight, body_weight_diff, odds, popularity, prize,
            handler_id, operator_id, loaded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
         ON CONFLICT(event_id, participant_id) DO UPDATE SET
            post_position = excluded.post_position,
            entry_number = excluded.entry_number,
            rank = excluded.rank,
            status = excluded.status,
            elapsed_sec = excluded.elapsed_sec,
            margin_sec = excluded.margin_sec,
            split_sec = excluded.split_sec,
            corner_positions = excluded.corner_positions,
            carried_weight = excluded.carried_weight,
            body_weight = excluded.body_weight,
            body_weight_diff = excluded.body_weight_diff,
            odds = excluded.odds,
            popularity = excluded.popularity,
            prize = excluded.prize,
            handler_id = excluded.handler_id,
            operator_id = excluded.operator_id,
            loaded_at = excluded.loaded_at
         WHERE (
            outcomes.post_position, outcomes.entry_number, outcomes.rank, outcomes.status,
            outcomes.elapsed_sec, outcomes.margin_sec, outcomes.split_sec,
            outcomes.corner_positions, outcomes.carried_weight, outcomes.body_weight,
            outcomes.body_weight_diff, outcomes.odds, outcomes.popularity, outcomes.prize,
            outcomes.handler_id, outcomes.operator_id
         ) IS NOT (
            excluded.post_position, excluded.entry_number, excluded.rank, excluded.status,
            excluded.elapsed_sec, excluded.margin_sec, excluded.split_sec,
            excluded.corner_positions, excluded.carried_weight, excluded.body_weight,
            excluded.body_weight_diff, excluded.odds, excluded.popularity, excluded.prize,
            excluded.handler_id, excluded.operator_id
         )",
        params![
            event_id,
            refs.participant.entity_id,
            outcome.post_position,
            outcome.entry_number,
            outcome.rank,
            status.as_str(),
            outcome.elapsed_sec,
            outcome.margin_sec,
            outcome.split_sec,
            outcome.corner_positions,
            outcome.carried_weight,
            outcome.body_weight,
            outcome.body_weight_diff,
            outcome.odds,
            outcome.popularity,
            outcome.prize,
            refs.handler.map(|item| item.entity_id.as_str()),
            refs.operator.map(|item| item.entity_id.as_str()),
            loaded_at,
        ],
    )
    .with_context(|| {
        format!(
            "failed to upsert outcome {event_id}/{}",
            refs.participant.entity_id
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use proptest::prelude::*;
    use raceline_core::{EntityRef, FinishStatus, LinkagePolicy, ScopeFilter};
    use rusqlite::params;

    use super::*;
    use crate::test_support::{event, fixture_store, must, runner, RUN_ID};
    use crate::FailureFilter;

    fn table_count(store: &SqliteRaceStore, table: &str) -> i64 {
        must(
            store
                .connection()
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .map_err(Into::into),
        )
    }

    type OutcomeSnapshot = (
        String,
        String,
        Option<u32>,
        String,
        Option<f64>,
        Option<String>,
        Option<i64>,
    );

    fn outcome_snapshot(store: &SqliteRaceStore) -> Vec<OutcomeSnapshot> {
        let conn = store.connection();
        let mut stmt = must(
            conn.prepare(
                "SELECT event_id, participant_id, rank, status, split_sec, prev_event_id,
                        days_since_last
                 FROM outcomes ORDER BY event_id, participant_id",
            )
            .map_err(Into::into),
        );
        let rows = must(
            stmt.query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })
            .map_err(Into::into),
        );
        must(crate::collect_rows(rows))
    }

    fn loaded_at_stamps(store: &SqliteRaceStore) -> Vec<(String, String)> {
        let conn = store.connection();
        let mut stmt = must(
            conn.prepare(
                "SELECT event_id, loaded_at FROM events
                 UNION ALL
                 SELECT participant_id, loaded_at FROM outcomes
                 ORDER BY 1",
            )
            .map_err(Into::into),
        );
        let rows = must(
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(Into::into),
        );
        must(crate::collect_rows(rows))
    }

    #[test]
    fn reloading_the_same_bundle_is_idempotent() {
        let mut store = fixture_store();
        let bundle = event("E1", "2024-01-01", 1, vec![runner("P1", 1), runner("P2", 2)]);

        let first = must(store.load_extraction(&bundle, RUN_ID));
        let snapshot = outcome_snapshot(&store);
        let second = must(store.load_extraction(&bundle, RUN_ID));

        assert!(matches!(
            first,
            LoadOutcome::Committed {
                outcome_rows: 2,
                created_entities: 5,
                ..
            }
        ));
        assert!(matches!(
            second,
            LoadOutcome::Committed {
                created_entities: 0,
                ..
            }
        ));
        assert_eq!(snapshot, outcome_snapshot(&store));
        assert_eq!(table_count(&store, "events"), 1);
        assert_eq!(table_count(&store, "participants"), 2);
        assert_eq!(table_count(&store, "handlers"), 1);
        assert_eq!(table_count(&store, "operators"), 2);
    }

    #[test]
    fn identical_reload_keeps_loaded_at_and_changed_reload_refreshes_it() {
        let mut store = fixture_store();
        let bundle = event("E1", "2024-01-01", 1, vec![runner("P1", 1), runner("P2", 2)]);
        must(store.load_extraction(&bundle, RUN_ID));

        let pinned = "2000-01-01T00:00:00Z";
        for table in ["events", "outcomes"] {
            must(
                store
                    .connection()
                    .execute(&format!("UPDATE {table} SET loaded_at = ?1"), params![pinned])
                    .map_err(Into::into),
            );
        }

        must(store.load_extraction(&bundle, RUN_ID));
        assert!(loaded_at_stamps(&store)
            .iter()
            .all(|(_, stamp)| stamp == pinned));

        let mut changed = bundle.clone();
        changed.outcomes[1].split_sec = Some(35.9);
        must(store.load_extraction(&changed, RUN_ID));
        let stamps = loaded_at_stamps(&store);
        let refreshed: Vec<&str> = stamps
            .iter()
            .filter(|(_, stamp)| stamp != pinned)
            .map(|(key, _)| key.as_str())
            .collect();
        assert_eq!(refreshed, vec!["P2"]);
    }

    #[test]
    fn invalid_row_rejects_whole_bundle_and_records_failure() {
        let mut store = fixture_store();
        let mut bad = runner("P3", 3);
        bad.rank = None;
        bad.status = Some(FinishStatus::Finished);
        let bundle = event("E1", "2024-01-01", 1, vec![runner("P1", 1), runner("P2", 2), bad]);

        let outcome = must(store.load_extraction(&bundle, RUN_ID));
        let LoadOutcome::Rejected {
            source_id,
            error_kind,
            message,
        } = outcome
        else {
            panic!("expected rejection");
        };
        assert_eq!(source_id, "E1");
        assert_eq!(error_kind, "validation");
        assert!(message.contains("outcome[2]"), "{message}");

        assert_eq!(table_count(&store, "events"), 0);
        assert_eq!(table_count(&store, "outcomes"), 0);
        assert_eq!(table_count(&store, "participants"), 0);

        let failures = must(store.list_failures(&FailureFilter::default()));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].phase, FailurePhase::Load);
        assert_eq!(failures[0].source_id, "E1");
        assert_eq!(failures[0].run_id.as_deref(), Some(RUN_ID));
    }

    #[test]
    fn reference_failure_mid_bundle_rolls_back_created_entities() {
        let mut store = fixture_store();
        let mut nameless = runner("P-new", 3);
        nameless.participant.name = None;
        let bundle = event(
            "E1",
            "2024-01-01",
            1,
            vec![runner("P1", 1), runner("P2", 2), nameless],
        );

        let outcome = must(store.load_extraction(&bundle, RUN_ID));
        assert!(matches!(
            outcome,
            LoadOutcome::Rejected { ref error_kind, .. } if error_kind == "reference"
        ));
        assert_eq!(table_count(&store, "events"), 0);
        assert_eq!(table_count(&store, "outcomes"), 0);
        assert_eq!(table_count(&store, "participants"), 0);
        assert_eq!(table_count(&store, "operators"), 0);
        assert_eq!(table_count(&store, "failure_ledger"), 1);
    }

    #[test]
    fn known_entity_may_be_referenced_without_name() {
        let mut store = fixture_store();
        must(store.load_extraction(&event("E1", "2024-01-01", 1, vec![runner("P1", 1)]), RUN_ID));

        let mut again = runner("P1", 2);
        again.participant.name = None;
        again.operator = Some(EntityRef {
            id: "J-P1".to_string(),
            name: None,
        });
        let outcome = must(store.load_extraction(&event("E2", "2024-02-01", 1, vec![again]), RUN_ID));
        assert!(matches!(outcome, LoadOutcome::Committed { .. }));
    }

    #[test]
    fn re_ingesting_an_event_replaces_header_and_outcome_fields() {
        let mut store = fixture_store();
        let mut bundle = event("E1", "2024-01-01", 1, vec![runner("P1", 1), runner("P2", 2)]);
        must(store.load_extraction(&bundle, RUN_ID));

        bundle.event.going = Some("heavy".to_string());
        bundle.outcomes[0].split_sec = Some(36.5);
        must(store.load_extraction(&bundle, RUN_ID));

        let (going, split): (String, f64) = must(
            store
                .connection()
                .query_row(
                    "SELECT e.going, o.split_sec FROM events e
                     JOIN outcomes o ON o.event_id = e.event_id
                     WHERE o.participant_id = 'P1'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(Into::into),
        );
        assert_eq!(going, "heavy");
        assert_eq!(split, 36.5);
        assert_eq!(table_count(&store, "outcomes"), 2);
    }

    #[test]
    fn reload_keeps_linkage_fields_written_by_the_linkage_batch() {
        let mut store = fixture_store();
        let first = event("E1", "2024-01-01", 1, vec![runner("P1", 1)]);
        let second = event("E2", "2024-02-15", 1, vec![runner("P1", 2)]);
        must(store.load_extraction(&first, RUN_ID));
        must(store.load_extraction(&second, RUN_ID));
        must(store.run_linkage(&ScopeFilter::default(), &LinkagePolicy::default(), RUN_ID));

        must(store.load_extraction(&second, RUN_ID));

        let (prev_event_id, days): (Option<String>, Option<i64>) = must(
            store
                .connection()
                .query_row(
                    "SELECT prev_event_id, days_since_last FROM outcomes
                     WHERE event_id = 'E2' AND participant_id = 'P1'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(Into::into),
        );
        assert_eq!(prev_event_id.as_deref(), Some("E1"));
        assert_eq!(days, Some(45));
    }

    #[test]
    fn batch_isolates_failures_and_honours_scope() {
        let mut store = fixture_store();
        let mut broken = event("E2", "2024-01-08", 1, vec![runner("P1", 1)]);
        broken.event.race_no = None;
        let bundles = vec![
            event("E1", "2024-01-01", 1, vec![runner("P1", 1)]),
            broken,
            event("E3", "2024-01-15", 1, vec![runner("P1", 1)]),
            event("E4", "2024-03-01", 1, vec![runner("P1", 1)]),
        ];
        let scope = ScopeFilter {
            to_date: raceline_core::parse_event_date("2024-01-31").ok(),
            ..ScopeFilter::default()
        };

        let report = must(store.load_batch(&bundles, &scope, RUN_ID));
        assert_eq!(report.processed, 3);
        assert_eq!(report.committed, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.rejected_sources, vec!["E2".to_string()]);
        assert!(report.has_failures());
        assert_eq!(table_count(&store, "events"), 2);
    }

    #[test]
    fn blank_event_id_is_ledgered_under_placeholder_source() {
        let mut store = fixture_store();
        let bundle = event("  ", "2024-01-01", 1, vec![runner("P1", 1)]);
        let outcome = must(store.load_extraction(&bundle, RUN_ID));
        assert!(matches!(
            outcome,
            LoadOutcome::Rejected { ref source_id, .. } if source_id == UNKNOWN_SOURCE_ID
        ));
    }

    #[test]
    fn outcomes_cannot_be_deleted() {
        let mut store = fixture_store();
        must(store.load_extraction(&event("E1", "2024-01-01", 1, vec![runner("P1", 1)]), RUN_ID));
        let result = store
            .connection()
            .execute("DELETE FROM outcomes WHERE event_id = ?1", params!["E1"]);
        assert!(result.is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_load_order_does_not_change_stored_facts_or_linkage(rotate_by in 0usize..4, reverse in any::<bool>()) {
            let bundles = vec![
                event("E1", "2024-01-01", 1, vec![runner("P1", 1), runner("P2", 2)]),
                event("E2", "2024-01-08", 2, vec![runner("P2", 1), runner("P3", 2)]),
                event("E3", "2024-01-15", 3, vec![runner("P1", 2), runner("P3", 1)]),
                event("E4", "2024-01-22", 4, vec![runner("P4", 1)]),
            ];

            let mut baseline = fixture_store();
            must(baseline.load_batch(&bundles, &ScopeFilter::default(), RUN_ID));

            let mut permuted = bundles.clone();
            permuted.rotate_left(rotate_by);
            if reverse {
                permuted.reverse();
            }
            let mut other = fixture_store();
            must(other.load_batch(&permuted, &ScopeFilter::default(), RUN_ID));

            for store in [&mut baseline, &mut other] {
                must(store.run_linkage(&ScopeFilter::default(), &LinkagePolicy::default(), RUN_ID));
            }

            prop_assert_eq!(outcome_snapshot(&baseline), outcome_snapshot(&other));
            prop_assert_eq!(table_count(&baseline, "participants"), table_count(&other, "participants"));
        }
    }
}
