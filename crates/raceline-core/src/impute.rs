//! Per-event median imputation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ImputedValue {
    pub value: Option<f64>,
    /// `true` when the observation was absent in storage, whether or not a
    /// substitute could be computed.
    pub missing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImputedColumn {
    pub median: Option<f64>,
    pub values: Vec<ImputedValue>,
}

/// Median of the given values; the mean of the two middle values for an even
/// count.
#[must_use]
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Fills the gaps of one event's column with the median of its observed
/// values. Observed values pass through untouched.
#[must_use]
pub fn impute_column(observed: &[Option<f64>]) -> ImputedColumn {
    let present: Vec<f64> = observed.iter().flatten().copied().collect();
    let median = median(&present);

    let values = observed
        .iter()
        .map(|value| match value {
            Some(raw) => ImputedValue {
                value: Some(*raw),
                missing: false,
            },
            None => ImputedValue {
                value: median,
                missing: true,
            },
        })
        .collect();

    ImputedColumn { median, values }
}
