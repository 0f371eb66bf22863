//! Typed records, validation and pure planners shared by the raceline store
//! and CLI.
//!
//! Nothing in this crate touches storage. The store crate feeds rows in and
//! persists what comes back, which keeps linkage and imputation replayable
//! from the current facts alone.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

pub mod impute;
pub mod linkage;

pub use impute::{impute_column, median, ImputedColumn, ImputedValue};
pub use linkage::{
    plan_participant_linkage, HistoryRow, LinkAssignment, LinkageAmbiguity, LinkagePlan,
    LinkagePolicy, NonFinishPolicy, PriorLink,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RacelineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("reference error: {0}")]
    Reference(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RacelineError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Reference(_) => "reference",
            Self::Configuration(_) => "configuration",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FinishStatus {
    Finished,
    DidNotFinish,
    Disqualified,
    Scratched,
}

impl FinishStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::DidNotFinish => "did_not_finish",
            Self::Disqualified => "disqualified",
            Self::Scratched => "scratched",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "finished" => Some(Self::Finished),
            "did_not_finish" => Some(Self::DidNotFinish),
            "disqualified" => Some(Self::Disqualified),
            "scratched" => Some(Self::Scratched),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Participant,
    Handler,
    Operator,
}

impl DimensionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Participant => "participant",
            Self::Handler => "handler",
            Self::Operator => "operator",
        }
    }
}

impl Display for DimensionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Fetch,
    Parse,
    Load,
    Linkage,
}

impl FailurePhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Parse => "parse",
            Self::Load => "load",
            Self::Linkage => "linkage",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fetch" => Some(Self::Fetch),
            "parse" => Some(Self::Parse),
            "load" => Some(Self::Load),
            "linkage" => Some(Self::Linkage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FetchState {
    Fetched,
    Failed,
    Skipped,
}

impl FetchState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fetched" => Some(Self::Fetched),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// A source in this state must not be fetched again.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Fetched | Self::Skipped)
    }
}

/// Reference to a handler or operator as extracted from a raw document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub birth_year: Option<i32>,
}

/// Event header as handed over by the parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventInput {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub event_date: Option<Date>,
    #[serde(default)]
    pub course_id: Option<String>,
    #[serde(default)]
    pub venue_id: Option<String>,
    #[serde(default)]
    pub race_no: Option<u32>,
    #[serde(default)]
    pub race_name: Option<String>,
    #[serde(default)]
    pub distance_m: Option<u32>,
    #[serde(default)]
    pub surface: Option<String>,
    #[serde(default)]
    pub weather: Option<String>,
    #[serde(default)]
    pub going: Option<String>,
    #[serde(default)]
    pub race_class: Option<String>,
    #[serde(default)]
    pub age_condition: Option<String>,
    #[serde(default)]
    pub sex_condition: Option<String>,
    #[serde(default)]
    pub num_runners: Option<u32>,
    #[serde(default)]
    pub winning_time_sec: Option<f64>,
}

/// One participant's extracted result. Linkage fields are deliberately absent:
/// they are owned by the linkage batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutcomeInput {
    #[serde(default)]
    pub participant: ParticipantRef,
    #[serde(default)]
    pub handler: Option<EntityRef>,
    #[serde(default)]
    pub operator: Option<EntityRef>,
    #[serde(default)]
    pub post_position: Option<u32>,
    #[serde(default)]
    pub entry_number: Option<u32>,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub status: Option<FinishStatus>,
    #[serde(default)]
    pub elapsed_sec: Option<f64>,
    #[serde(default)]
    pub margin_sec: Option<f64>,
    #[serde(default)]
    pub split_sec: Option<f64>,
    #[serde(default)]
    pub corner_positions: Option<String>,
    #[serde(default)]
    pub carried_weight: Option<f64>,
    #[serde(default)]
    pub body_weight: Option<i64>,
    #[serde(default)]
    pub body_weight_diff: Option<i64>,
    #[serde(default)]
    pub odds: Option<f64>,
    #[serde(default)]
    pub popularity: Option<u32>,
    #[serde(default)]
    pub prize: Option<i64>,
}

impl OutcomeInput {
    /// Status with the parser's shorthand applied: a ranked row without an
    /// explicit status counts as finished.
    #[must_use]
    pub fn resolved_status(&self) -> Option<FinishStatus> {
        match (self.status, self.rank) {
            (Some(status), _) => Some(status),
            (None, Some(_)) => Some(FinishStatus::Finished),
            (None, None) => None,
        }
    }
}

/// One parsed event: header plus every outcome row extracted for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractedEvent {
    pub event: EventInput,
    #[serde(default)]
    pub outcomes: Vec<OutcomeInput>,
}

impl ExtractedEvent {
    /// Validates the bundle before it is allowed into a load transaction.
    ///
    /// # Errors
    /// Returns [`RacelineError::Validation`] naming the first offending field.
    /// Outcome problems carry their zero-based row index.
    pub fn validate(&self) -> Result<(), RacelineError> {
        let event = &self.event;
        if event.event_id.trim().is_empty() {
            return Err(RacelineError::Validation(
                "event_id MUST be provided".to_string(),
            ));
        }

        match event.race_no {
            None => {
                return Err(RacelineError::Validation(
                    "race_no MUST be provided".to_string(),
                ))
            }
            Some(0) => {
                return Err(RacelineError::Validation("race_no MUST be >= 1".to_string()));
            }
            Some(_) => {}
        }

        if event.distance_m == Some(0) {
            return Err(RacelineError::Validation(
                "distance_m MUST be > 0 when present".to_string(),
            ));
        }

        check_non_negative("winning_time_sec", event.winning_time_sec)?;

        let mut seen = BTreeSet::new();
        for (index, outcome) in self.outcomes.iter().enumerate() {
            validate_outcome(outcome).map_err(|err| match err {
                RacelineError::Validation(message) => {
                    RacelineError::Validation(format!("outcome[{index}]: {message}"))
                }
                other => other,
            })?;

            if !seen.insert(outcome.participant.id.trim()) {
                return Err(RacelineError::Validation(format!(
                    "outcome[{index}]: participant {} appears twice in event {}",
                    outcome.participant.id, event.event_id
                )));
            }
        }

        Ok(())
    }
}

fn validate_outcome(outcome: &OutcomeInput) -> Result<(), RacelineError> {
    if outcome.participant.id.trim().is_empty() {
        return Err(RacelineError::Validation(
            "participant.id MUST be provided".to_string(),
        ));
    }

    let Some(status) = outcome.resolved_status() else {
        return Err(RacelineError::Validation(
            "status is required when rank is absent".to_string(),
        ));
    };

    match (status, outcome.rank) {
        (FinishStatus::Finished, None) => {
            return Err(RacelineError::Validation(
                "finished outcome requires rank".to_string(),
            ));
        }
        (_, Some(0)) => {
            return Err(RacelineError::Validation("rank MUST be >= 1".to_string()));
        }
        _ => {}
    }

    for (name, value) in [
        ("elapsed_sec", outcome.elapsed_sec),
        ("margin_sec", outcome.margin_sec),
        ("split_sec", outcome.split_sec),
        ("carried_weight", outcome.carried_weight),
        ("odds", outcome.odds),
    ] {
        check_non_negative(name, value)?;
    }

    Ok(())
}

fn check_non_negative(name: &str, value: Option<f64>) -> Result<(), RacelineError> {
    match value {
        Some(raw) if !raw.is_finite() => Err(RacelineError::Validation(format!(
            "{name} MUST be a finite number"
        ))),
        Some(raw) if raw < 0.0 => Err(RacelineError::Validation(format!(
            "{name} MUST be >= 0"
        ))),
        _ => Ok(()),
    }
}

/// Restricts a run to a date window and/or explicit identifiers.
///
/// Empty identifier lists mean "no restriction" on that axis.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeFilter {
    pub from_date: Option<Date>,
    pub to_date: Option<Date>,
    pub event_ids: Vec<String>,
    pub participant_ids: Vec<String>,
}

impl ScopeFilter {
    /// # Errors
    /// Returns [`RacelineError::Configuration`] for an inverted date window.
    pub fn validate(&self) -> Result<(), RacelineError> {
        if let (Some(from), Some(to)) = (self.from_date, self.to_date) {
            if from > to {
                return Err(RacelineError::Configuration(format!(
                    "from_date {from} is after to_date {to}"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn has_date_window(&self) -> bool {
        self.from_date.is_some() || self.to_date.is_some()
    }

    /// Undated events never fall inside a date window.
    #[must_use]
    pub fn admits_date(&self, date: Option<Date>) -> bool {
        if !self.has_date_window() {
            return true;
        }
        let Some(date) = date else {
            return false;
        };
        self.from_date.map_or(true, |from| date >= from) && self.to_date.map_or(true, |to| date <= to)
    }

    #[must_use]
    pub fn admits_event(&self, event_id: &str, date: Option<Date>) -> bool {
        let id_ok = self.event_ids.is_empty() || self.event_ids.iter().any(|item| item == event_id);
        id_ok && self.admits_date(date)
    }
}

/// Parses a `YYYY-MM-DD` event date.
///
/// # Errors
/// Returns [`RacelineError::Validation`] when the text is not a calendar date.
pub fn parse_event_date(value: &str) -> Result<Date, RacelineError> {
    Date::parse(value.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|err| RacelineError::Validation(format!("invalid event date {value:?}: {err}")))
}

/// # Errors
/// Returns [`RacelineError::Validation`] when formatting fails.
pub fn format_event_date(value: Date) -> Result<String, RacelineError> {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| RacelineError::Validation(format!("failed to format event date: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`RacelineError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, RacelineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| RacelineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(RacelineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// # Errors
/// Returns [`RacelineError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, RacelineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            RacelineError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_err<T, E>(result: Result<T, E>) -> E {
        match result {
            Ok(_) => panic!("expected Err(..), got Ok"),
            Err(err) => err,
        }
    }

    fn fixture_outcome(participant_id: &str, rank: Option<u32>) -> OutcomeInput {
        OutcomeInput {
            participant: ParticipantRef {
                id: participant_id.to_string(),
                name: Some(format!("name-{participant_id}")),
                ..ParticipantRef::default()
            },
            rank,
            ..OutcomeInput::default()
        }
    }

    fn fixture_event() -> ExtractedEvent {
        ExtractedEvent {
            event: EventInput {
                event_id: "202401010101".to_string(),
                event_date: Some(must_ok(parse_event_date("2024-01-01"))),
                race_no: Some(1),
                distance_m: Some(1600),
                ..EventInput::default()
            },
            outcomes: vec![fixture_outcome("h-1", Some(1)), fixture_outcome("h-2", Some(2))],
        }
    }

    #[test]
    fn valid_bundle_passes() {
        must_ok(fixture_event().validate());
    }

    #[test]
    fn blank_event_id_is_rejected() {
        let mut bundle = fixture_event();
        bundle.event.event_id = "  ".to_string();
        let err = must_err(bundle.validate());
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn missing_race_no_is_rejected() {
        let mut bundle = fixture_event();
        bundle.event.race_no = None;
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn finished_without_rank_is_rejected_with_row_index() {
        let mut bundle = fixture_event();
        bundle.outcomes[1].rank = None;
        bundle.outcomes[1].status = Some(FinishStatus::Finished);
        let err = must_err(bundle.validate());
        assert!(err.to_string().contains("outcome[1]"), "{err}");
    }

    #[test]
    fn unranked_scratch_is_accepted() {
        let mut bundle = fixture_event();
        bundle.outcomes[1].rank = None;
        bundle.outcomes[1].status = Some(FinishStatus::Scratched);
        must_ok(bundle.validate());
    }

    #[test]
    fn unranked_row_without_status_is_rejected() {
        let mut bundle = fixture_event();
        bundle.outcomes[0].rank = None;
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn duplicate_participant_in_one_event_is_rejected() {
        let mut bundle = fixture_event();
        bundle.outcomes[1].participant.id = "h-1".to_string();
        let err = must_err(bundle.validate());
        assert!(err.to_string().contains("appears twice"), "{err}");
    }

    #[test]
    fn negative_and_nan_metrics_are_rejected() {
        let mut bundle = fixture_event();
        bundle.outcomes[0].margin_sec = Some(-0.1);
        assert!(bundle.validate().is_err());

        let mut bundle = fixture_event();
        bundle.outcomes[0].split_sec = Some(f64::NAN);
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn bundle_decodes_from_parser_json() {
        let raw = r#"{
            "event": {"event_id": "E1", "event_date": "2024-02-15", "race_no": 3},
            "outcomes": [
                {"participant": {"id": "P1", "name": "Alpha"}, "rank": 1, "split_sec": 34.1,
                 "operator": {"id": "J1", "name": "Rider"}},
                {"participant": {"id": "P2"}, "status": "scratched"}
            ]
        }"#;
        let bundle: ExtractedEvent = must_ok(serde_json::from_str(raw));
        must_ok(bundle.validate());
        assert_eq!(
            bundle.event.event_date,
            Some(must_ok(parse_event_date("2024-02-15")))
        );
        assert_eq!(
            bundle.outcomes[0].resolved_status(),
            Some(FinishStatus::Finished)
        );
        assert_eq!(
            bundle.outcomes[1].resolved_status(),
            Some(FinishStatus::Scratched)
        );
    }

    #[test]
    fn scope_filter_windows_dates_and_ids() {
        let scope = ScopeFilter {
            from_date: Some(must_ok(parse_event_date("2024-01-01"))),
            to_date: Some(must_ok(parse_event_date("2024-01-31"))),
            event_ids: vec!["E1".to_string()],
            participant_ids: Vec::new(),
        };
        must_ok(scope.validate());
        assert!(scope.admits_event("E1", Some(must_ok(parse_event_date("2024-01-15")))));
        assert!(!scope.admits_event("E2", Some(must_ok(parse_event_date("2024-01-15")))));
        assert!(!scope.admits_event("E1", Some(must_ok(parse_event_date("2024-02-01")))));
        assert!(!scope.admits_event("E1", None));
        assert!(ScopeFilter::default().admits_event("anything", None));
    }

    #[test]
    fn inverted_scope_window_is_a_configuration_error() {
        let scope = ScopeFilter {
            from_date: Some(must_ok(parse_event_date("2024-02-01"))),
            to_date: Some(must_ok(parse_event_date("2024-01-01"))),
            ..ScopeFilter::default()
        };
        assert_eq!(must_err(scope.validate()).kind(), "configuration");
    }

    #[test]
    fn event_date_round_trips_through_text() {
        let date = must_ok(parse_event_date("2024-03-01"));
        assert_eq!(must_ok(format_event_date(date)), "2024-03-01");
        assert!(parse_event_date("2024-13-01").is_err());
    }

    #[test]
    fn fetch_state_settlement() {
        assert!(FetchState::Fetched.is_settled());
        assert!(FetchState::Skipped.is_settled());
        assert!(!FetchState::Failed.is_settled());
        assert_eq!(FetchState::parse("skipped"), Some(FetchState::Skipped));
    }
}
