//! Applies participant linkage plans to stored outcomes and checks stored
//! linkage against a fresh recomputation.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use raceline_core::{
    parse_event_date, plan_participant_linkage, FailurePhase, HistoryRow, LinkageAmbiguity,
    LinkagePlan, LinkagePolicy, NonFinishPolicy, PriorLink, RacelineError, ScopeFilter,
};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::{collect_rows, parse_status, timestamp_now, SqliteRaceStore};

const LINKAGE_CHECK_CONTRACT_VERSION: &str = "linkage_check.v1";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LinkageReport {
    pub run_id: String,
    pub non_finish_policy: NonFinishPolicy,
    pub participants_processed: usize,
    pub participants_failed: usize,
    pub rows_processed: usize,
    pub rows_linked: usize,
    pub rows_unlinked: usize,
    pub undated_rows: usize,
    pub ambiguities: Vec<LinkageAmbiguity>,
    pub failed_participants: Vec<String>,
}

impl LinkageReport {
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.participants_failed > 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkageIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkageIssue {
    pub code: String,
    pub severity: LinkageIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkageDrift {
    pub participant_id: String,
    pub event_id: String,
    pub stored: PriorLink,
    pub expected: PriorLink,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkageCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub non_finish_policy: NonFinishPolicy,
    pub participants_checked: usize,
    pub rows_checked: usize,
    pub never_linked_rows: usize,
    pub drifted_rows: usize,
    pub ambiguous_dates: usize,
    pub undated_rows: usize,
    pub unreadable_participants: Vec<String>,
    pub drift_sample: Vec<LinkageDrift>,
    pub issues: Vec<LinkageIssue>,
}

/// A stored outcome as linkage sees it, with the link currently persisted.
struct StoredOutcome {
    history: HistoryRow,
    link: PriorLink,
    linked: bool,
}

impl SqliteRaceStore {
    /// Recomputes linkage for every participant in scope, one transaction per
    /// participant. A participant that fails is ledgered and skipped; the
    /// others still commit.
    pub fn run_linkage(
        &mut self,
        scope: &ScopeFilter,
        policy: &LinkagePolicy,
        run_id: &str,
    ) -> Result<LinkageReport> {
        scope.validate().map_err(|err| anyhow!(err.to_string()))?;
        let now = timestamp_now()?;
        let participants = self.participants_in_scope(scope)?;

        let mut report = LinkageReport {
            run_id: run_id.to_string(),
            non_finish_policy: policy.non_finish,
            ..LinkageReport::default()
        };

        for participant_id in participants {
            match self.link_participant(&participant_id, policy, &now) {
                Ok(plan) => {
                    for ambiguity in &plan.ambiguities {
                        tracing::warn!(
                            participant_id = %ambiguity.participant_id,
                            event_date = %ambiguity.event_date,
                            event_ids = ?ambiguity.event_ids,
                            "participant has several outcomes on one date"
                        );
                    }
                    if !plan.undated_event_ids.is_empty() {
                        tracing::warn!(
                            participant_id = %plan.participant_id,
                            event_ids = ?plan.undated_event_ids,
                            "undated outcomes left unlinked"
                        );
                    }
                    report.participants_processed += 1;
                    report.rows_processed += plan.assignments.len();
                    report.rows_linked += plan.linked_rows();
                    report.rows_unlinked += plan.assignments.len() - plan.linked_rows();
                    report.undated_rows += plan.undated_event_ids.len();
                    report.ambiguities.extend(plan.ambiguities);
                }
                Err(err) => {
                    let Some(unit_error) = err.downcast_ref::<RacelineError>().cloned() else {
                        return Err(err.context(format!("failed to link participant {participant_id}")));
                    };
                    self.record_failure(
                        &participant_id,
                        FailurePhase::Linkage,
                        unit_error.kind(),
                        &unit_error.to_string(),
                        Some(run_id),
                    )?;
                    tracing::error!(
                        participant_id = %participant_id,
                        error = %unit_error,
                        "participant linkage failed"
                    );
                    report.participants_failed += 1;
                    report.failed_participants.push(participant_id);
                }
            }
        }

        tracing::info!(
            run_id,
            policy = policy.non_finish.as_str(),
            participants = report.participants_processed,
            failed = report.participants_failed,
            rows_linked = report.rows_linked,
            "linkage run finished"
        );
        Ok(report)
    }

    /// Compares stored linkage with what a fresh run under `policy` would
    /// write, without modifying anything.
    pub fn linkage_check(&self, policy: &LinkagePolicy, sample_limit: usize) -> Result<LinkageCheck> {
        let participants = self.participants_in_scope(&ScopeFilter::default())?;

        let mut check = LinkageCheck {
            contract_version: LINKAGE_CHECK_CONTRACT_VERSION.to_string(),
            healthy: true,
            non_finish_policy: policy.non_finish,
            participants_checked: 0,
            rows_checked: 0,
            never_linked_rows: 0,
            drifted_rows: 0,
            ambiguous_dates: 0,
            undated_rows: 0,
            unreadable_participants: Vec::new(),
            drift_sample: Vec::new(),
            issues: Vec::new(),
        };

        for participant_id in participants {
            let stored = match read_participant_outcomes(&self.conn, &participant_id) {
                Ok(rows) => rows,
                Err(err) if err.downcast_ref::<RacelineError>().is_some() => {
                    check.unreadable_participants.push(participant_id);
                    continue;
                }
                Err(err) => return Err(err),
            };
            let history: Vec<HistoryRow> = stored.iter().map(|row| row.history.clone()).collect();
            let plan = match plan_participant_linkage(&participant_id, &history, policy) {
                Ok(plan) => plan,
                Err(_) => {
                    check.unreadable_participants.push(participant_id);
                    continue;
                }
            };

            check.participants_checked += 1;
            check.rows_checked += stored.len();
            check.ambiguous_dates += plan.ambiguities.len();
            check.undated_rows += plan.undated_event_ids.len();

            for row in &stored {
                if !row.linked {
                    check.never_linked_rows += 1;
                }
                let expected = plan
                    .link_for(&row.history.event_id)
                    .cloned()
                    .unwrap_or_default();
                if row.link != expected {
                    check.drifted_rows += 1;
                    if check.drift_sample.len() < sample_limit {
                        check.drift_sample.push(LinkageDrift {
                            participant_id: participant_id.clone(),
                            event_id: row.history.event_id.clone(),
                            stored: row.link.clone(),
                            expected,
                        });
                    }
                }
            }
        }

        check.issues = linkage_issues(&check);
        check.healthy = !check
            .issues
            .iter()
            .any(|issue| issue.severity == LinkageIssueSeverity::Error);
        Ok(check)
    }

    /// Participants with at least one outcome admitted by `scope`, sorted.
    pub fn participants_in_scope(&self, scope: &ScopeFilter) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT o.participant_id, o.event_id, e.event_date
                 FROM outcomes o
                 JOIN events e ON e.event_id = o.event_id",
            )
            .context("failed to prepare participant scope query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .context("failed to query participant scope")?;

        let mut participants = BTreeSet::new();
        for (participant_id, event_id, event_date) in collect_rows(rows)? {
            if !scope.participant_ids.is_empty() && !scope.participant_ids.contains(&participant_id) {
                continue;
            }
            let date = event_date.as_deref().and_then(|raw| parse_event_date(raw).ok());
            if scope.admits_event(&event_id, date) {
                participants.insert(participant_id);
            }
        }
        Ok(participants.into_iter().collect())
    }

    fn link_participant(&mut self, participant_id: &str, policy: &LinkagePolicy, now: &str) -> Result<LinkagePlan> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start linkage transaction")?;

        let history: Vec<HistoryRow> = read_participant_outcomes(&tx, participant_id)?
            .into_iter()
            .map(|row| row.history)
            .collect();
        let plan = plan_participant_linkage(participant_id, &history, policy)?;

        for assignment in &plan.assignments {
            let link = &assignment.link;
            tx.execute(
                "UPDATE outcomes SET
                    prev_event_id = ?1,
                    prev_rank = ?2,
                    prev_margin_sec = ?3,
                    prev_elapsed_sec = ?4,
                    prev_split_sec = ?5,
                    days_since_last = ?6,
                    linked_at = ?7
                 WHERE event_id = ?8 AND participant_id = ?9",
                params![
                    link.prev_event_id,
                    link.prev_rank,
                    link.prev_margin_sec,
                    link.prev_elapsed_sec,
                    link.prev_split_sec,
                    link.days_since_last,
                    now,
                    assignment.event_id,
                    participant_id,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to write linkage for {}/{participant_id}",
                    assignment.event_id
                )
            })?;
        }

        tx.commit().context("failed to commit linkage transaction")?;
        Ok(plan)
    }
}

/// Reads every stored outcome of one participant. Stored values that cannot
/// be interpreted surface as [`RacelineError::Validation`] so the caller can
/// isolate the participant.
fn read_participant_outcomes(conn: &Connection, participant_id: &str) -> Result<Vec<StoredOutcome>> {
    let mut stmt = conn
        .prepare(
            "SELECT o.event_id, e.event_date, e.race_no, o.status, o.rank,
                    o.margin_sec, o.elapsed_sec, o.split_sec,
                    o.prev_event_id, o.prev_rank, o.prev_margin_sec, o.prev_elapsed_sec,
                    o.prev_split_sec, o.days_since_last, o.linked_at
             FROM outcomes o
             JOIN events e ON e.event_id = o.event_id
             WHERE o.participant_id = ?1
             ORDER BY o.event_id ASC",
        )
        .context("failed to prepare participant history query")?;
    let rows = stmt
        .query_map(params![participant_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<i64>>(4)?,
                (
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                    row.get::<_, Option<f64>>(7)?,
                ),
                PriorLinkColumns {
                    prev_event_id: row.get(8)?,
                    prev_rank: row.get(9)?,
                    prev_margin_sec: row.get(10)?,
                    prev_elapsed_sec: row.get(11)?,
                    prev_split_sec: row.get(12)?,
                    days_since_last: row.get(13)?,
                },
                row.get::<_, Option<String>>(14)?,
            ))
        })
        .with_context(|| format!("failed to query history of {participant_id}"))?;

    let mut outcomes = Vec::new();
    for (event_id, event_date, race_no, status, rank, (margin_sec, elapsed_sec, split_sec), link, linked_at) in
        collect_rows(rows)?
    {
        let unreadable = |what: &str| {
            RacelineError::Validation(format!(
                "participant {participant_id} event {event_id} has unreadable {what}"
            ))
        };

        let event_date = event_date
            .as_deref()
            .map(parse_event_date)
            .transpose()
            .map_err(|_| unreadable("event_date"))?;
        let race_no = u32::try_from(race_no).map_err(|_| unreadable("race_no"))?;
        let status = parse_status(&status, 3).map_err(|_| unreadable("status"))?;
        let rank = rank
            .map(u32::try_from)
            .transpose()
            .map_err(|_| unreadable("rank"))?;
        let link = link.into_prior_link().map_err(|_| unreadable("prev_rank"))?;

        outcomes.push(StoredOutcome {
            history: HistoryRow {
                event_id,
                event_date,
                race_no,
                status,
                rank,
                margin_sec,
                elapsed_sec,
                split_sec,
            },
            link,
            linked: linked_at.is_some(),
        });
    }
    Ok(outcomes)
}

struct PriorLinkColumns {
    prev_event_id: Option<String>,
    prev_rank: Option<i64>,
    prev_margin_sec: Option<f64>,
    prev_elapsed_sec: Option<f64>,
    prev_split_sec: Option<f64>,
    days_since_last: Option<i64>,
}

impl PriorLinkColumns {
    fn into_prior_link(self) -> Result<PriorLink, std::num::TryFromIntError> {
        Ok(PriorLink {
            prev_event_id: self.prev_event_id,
            prev_rank: self.prev_rank.map(u32::try_from).transpose()?,
            prev_margin_sec: self.prev_margin_sec,
            prev_elapsed_sec: self.prev_elapsed_sec,
            prev_split_sec: self.prev_split_sec,
            days_since_last: self.days_since_last,
        })
    }
}

fn linkage_issues(check: &LinkageCheck) -> Vec<LinkageIssue> {
    let mut issues = Vec::new();
    if check.never_linked_rows > 0 {
        issues.push(LinkageIssue {
            code: "linkage_pending".to_string(),
            severity: LinkageIssueSeverity::Error,
            message: format!(
                "{} outcome rows have never been through a linkage run",
                check.never_linked_rows
            ),
        });
    }
    if check.drifted_rows > 0 {
        issues.push(LinkageIssue {
            code: "linkage_drift".to_string(),
            severity: LinkageIssueSeverity::Error,
            message: format!(
                "{} outcome rows differ from a fresh linkage under {}",
                check.drifted_rows,
                check.non_finish_policy.as_str()
            ),
        });
    }
    if !check.unreadable_participants.is_empty() {
        issues.push(LinkageIssue {
            code: "unreadable_history".to_string(),
            severity: LinkageIssueSeverity::Error,
            message: format!(
                "{} participants have stored outcomes that cannot be linked",
                check.unreadable_participants.len()
            ),
        });
    }
    if check.ambiguous_dates > 0 {
        issues.push(LinkageIssue {
            code: "same_day_outcomes".to_string(),
            severity: LinkageIssueSeverity::Warning,
            message: format!(
                "{} participant dates carry more than one outcome",
                check.ambiguous_dates
            ),
        });
    }
    if check.undated_rows > 0 {
        issues.push(LinkageIssue {
            code: "undated_outcomes".to_string(),
            severity: LinkageIssueSeverity::Warning,
            message: format!(
                "{} outcome rows have no event date and stay unlinked",
                check.undated_rows
            ),
        });
    }
    issues
}
