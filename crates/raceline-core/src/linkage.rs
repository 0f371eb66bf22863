//! Prior-outcome linkage for a single participant.
//!
//! [`plan_participant_linkage`] maps a participant's full outcome history to
//! the full set of linkage blocks for that history. It keeps no state between
//! calls, so re-running it after a backfill corrects every affected link.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::Date;

use crate::{FinishStatus, RacelineError};

/// What to carry forward when the preceding outcome did not finish.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NonFinishPolicy {
    /// Copy prior rank/margin/time/split exactly as stored.
    #[default]
    Propagate,
    /// Keep the link and day gap but null the prior numeric signals.
    NullMetrics,
}

impl NonFinishPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Propagate => "propagate",
            Self::NullMetrics => "null_metrics",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LinkagePolicy {
    #[serde(default)]
    pub non_finish: NonFinishPolicy,
}

impl LinkagePolicy {
    /// Decodes a policy document.
    ///
    /// # Errors
    /// Returns [`RacelineError::Configuration`] when the JSON does not match
    /// the policy shape.
    pub fn from_json(value: &Value) -> Result<Self, RacelineError> {
        serde_json::from_value(value.clone()).map_err(|err| {
            RacelineError::Configuration(format!("invalid linkage policy JSON payload: {err}"))
        })
    }
}

/// One stored outcome of a participant, reduced to what linkage reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRow {
    pub event_id: String,
    pub event_date: Option<Date>,
    pub race_no: u32,
    pub status: FinishStatus,
    pub rank: Option<u32>,
    pub margin_sec: Option<f64>,
    pub elapsed_sec: Option<f64>,
    pub split_sec: Option<f64>,
}

/// The linkage block of an outcome row. All `None` means "no predecessor".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PriorLink {
    pub prev_event_id: Option<String>,
    pub prev_rank: Option<u32>,
    pub prev_margin_sec: Option<f64>,
    pub prev_elapsed_sec: Option<f64>,
    pub prev_split_sec: Option<f64>,
    pub days_since_last: Option<i64>,
}

impl PriorLink {
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.prev_event_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkAssignment {
    pub event_id: String,
    pub link: PriorLink,
}

/// Two or more outcomes of one participant share a date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkageAmbiguity {
    pub participant_id: String,
    pub event_date: Date,
    /// In tie-break order.
    pub event_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkagePlan {
    pub participant_id: String,
    /// Dated rows in chronological order, then undated rows.
    pub assignments: Vec<LinkAssignment>,
    pub ambiguities: Vec<LinkageAmbiguity>,
    pub undated_event_ids: Vec<String>,
}

impl LinkagePlan {
    #[must_use]
    pub fn linked_rows(&self) -> usize {
        self.assignments
            .iter()
            .filter(|item| item.link.is_linked())
            .count()
    }

    #[must_use]
    pub fn link_for(&self, event_id: &str) -> Option<&PriorLink> {
        self.assignments
            .iter()
            .find(|item| item.event_id == event_id)
            .map(|item| &item.link)
    }
}

/// Computes the linkage block of every outcome in `rows`.
///
/// Dated rows are ordered by `(event_date, race_no, event_id)`; each row
/// links to the row before it. A row sharing its date with the row before it
/// links instead to the last row of the nearest earlier date, so a linked row
/// always has `days_since_last >= 1`. Undated rows stay unlinked.
///
/// # Errors
/// Returns [`RacelineError::Validation`] when the same event appears twice in
/// the history.
pub fn plan_participant_linkage(
    participant_id: &str,
    rows: &[HistoryRow],
    policy: &LinkagePolicy,
) -> Result<LinkagePlan, RacelineError> {
    let mut seen = BTreeSet::new();
    for row in rows {
        if !seen.insert(row.event_id.as_str()) {
            return Err(RacelineError::Validation(format!(
                "participant {participant_id} has event {} more than once",
                row.event_id
            )));
        }
    }

    let mut dated: Vec<(Date, &HistoryRow)> = rows
        .iter()
        .filter_map(|row| row.event_date.map(|date| (date, row)))
        .collect();
    dated.sort_by(|(lhs_date, lhs), (rhs_date, rhs)| {
        lhs_date
            .cmp(rhs_date)
            .then(lhs.race_no.cmp(&rhs.race_no))
            .then_with(|| lhs.event_id.cmp(&rhs.event_id))
    });

    let ambiguities = dated
        .chunk_by(|(lhs, _), (rhs, _)| lhs == rhs)
        .filter(|group| group.len() > 1)
        .map(|group| LinkageAmbiguity {
            participant_id: participant_id.to_string(),
            event_date: group[0].0,
            event_ids: group.iter().map(|(_, row)| row.event_id.clone()).collect(),
        })
        .collect();

    let mut assignments = Vec::with_capacity(rows.len());
    let mut previous: Option<(Date, &HistoryRow)> = None;
    let mut earlier_day_last: Option<(Date, &HistoryRow)> = None;

    for &(date, row) in &dated {
        let predecessor = match previous {
            Some((prev_date, _)) if prev_date == date => earlier_day_last,
            Some(prev) => {
                earlier_day_last = Some(prev);
                Some(prev)
            }
            None => None,
        };

        let link = predecessor.map_or_else(PriorLink::default, |(prev_date, prev)| {
            carry_forward(prev, prev_date, date, policy)
        });
        assignments.push(LinkAssignment {
            event_id: row.event_id.clone(),
            link,
        });
        previous = Some((date, row));
    }

    let mut undated_event_ids = Vec::new();
    for row in rows.iter().filter(|row| row.event_date.is_none()) {
        undated_event_ids.push(row.event_id.clone());
        assignments.push(LinkAssignment {
            event_id: row.event_id.clone(),
            link: PriorLink::default(),
        });
    }

    Ok(LinkagePlan {
        participant_id: participant_id.to_string(),
        assignments,
        ambiguities,
        undated_event_ids,
    })
}

fn carry_forward(prev: &HistoryRow, prev_date: Date, date: Date, policy: &LinkagePolicy) -> PriorLink {
    let carry_metrics = policy.non_finish == NonFinishPolicy::Propagate
        || prev.status == FinishStatus::Finished;

    PriorLink {
        prev_event_id: Some(prev.event_id.clone()),
        prev_rank: prev.rank.filter(|_| carry_metrics),
        prev_margin_sec: prev.margin_sec.filter(|_| carry_metrics),
        prev_elapsed_sec: prev.elapsed_sec.filter(|_| carry_metrics),
        prev_split_sec: prev.split_sec.filter(|_| carry_metrics),
        days_since_last: Some((date - prev_date).whole_days()),
    }
}
