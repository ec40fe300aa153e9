//! Eligibility history reconstruction
//!
//! A node is eligible for delivery while it is part of an exported
//! allocation. Each historical allocation snapshot contributes one period per
//! node; the periods of a node are kept mutually exclusive so that every hour
//! is counted at most once by the aggregation pass.

pub mod period;

pub use period::{EligibilityPeriod, NodeEligibilityHistory};

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{BudgetAllocation, HistoryElement, MeasureSet};

#[derive(Debug, Error)]
pub enum EligibilityError {
    #[error("look-back duration must be positive, got {hours}h")]
    InvalidLookBack { hours: i64 },
    #[error("allocation {outputs_id} has unparseable start time `{value}`")]
    InvalidStartTime { outputs_id: String, value: String },
}

/// Per-node eligibility periods rebuilt from allocation snapshots
#[derive(Debug, Clone, Default)]
pub struct EligibilityHistoryBuilder {
    histories: HashMap<MeasureSet, NodeEligibilityHistory>,
}

impl EligibilityHistoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshots<'a, I>(snapshots: I) -> Self
    where
        I: IntoIterator<Item = &'a BudgetAllocation>,
    {
        let mut builder = Self::new();
        for snapshot in snapshots {
            builder.add_eligibility_history(snapshot);
        }
        builder
    }

    /// Add the eligibility every node had in one snapshot.
    /// Nodes with a zero export budget were never eligible and are skipped.
    pub fn add_eligibility_history(&mut self, snapshot: &BudgetAllocation) {
        for (node, result) in &snapshot.per_node_results {
            if result.export_budget.is_zero() {
                continue;
            }

            let Some(duration) = result.period_delta() else {
                warn!(
                    "Skipping node {} in allocation starting {}: period duration out of range",
                    node, snapshot.allocation_start_time
                );
                continue;
            };

            self.add_node_period(node.clone(), EligibilityPeriod::new(result.period_start, duration));
        }
    }

    pub fn add_node_period(&mut self, node: MeasureSet, period: EligibilityPeriod) {
        self.histories.entry(node).or_default().add_period(period);
    }

    pub fn history(&self, node: &MeasureSet) -> Option<&NodeEligibilityHistory> {
        self.histories.get(node)
    }

    pub fn last_eligible_hour(&self, node: &MeasureSet) -> Option<DateTime<Utc>> {
        self.history(node).and_then(NodeEligibilityHistory::last_eligible_hour)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &MeasureSet> {
        self.histories.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}

/// Map every allocation id in the snapshots to the node it was exported for
pub fn allocation_node_map<'a, I>(snapshots: I) -> HashMap<String, MeasureSet>
where
    I: IntoIterator<Item = &'a BudgetAllocation>,
{
    let mut map = HashMap::new();
    for snapshot in snapshots {
        for (node, result) in &snapshot.per_node_results {
            if result.allocation_id.is_empty() {
                continue;
            }
            map.entry(result.allocation_id.clone())
                .or_insert_with(|| node.clone());
        }
    }
    map
}

/// Select the snapshots whose eligibility falls inside the look-back window.
///
/// The window is anchored at the later of the newest allocation start and the
/// latest delivery data hour; snapshots starting at or before
/// `anchor - look_back` are dropped.
pub fn filter_index(
    index: &[HistoryElement],
    look_back: TimeDelta,
    latest_delivery_data_date: Option<DateTime<Utc>>,
) -> Result<Vec<HistoryElement>, EligibilityError> {
    if look_back <= TimeDelta::zero() {
        return Err(EligibilityError::InvalidLookBack {
            hours: look_back.num_hours(),
        });
    }

    let starts = index
        .iter()
        .map(|element| {
            element
                .start_time()
                .map_err(|_| EligibilityError::InvalidStartTime {
                    outputs_id: element.allocation_outputs_id.clone(),
                    value: element.allocation_start_time.clone(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let Some(newest_start) = starts.iter().max().copied() else {
        return Ok(Vec::new());
    };

    let anchor = latest_delivery_data_date
        .map_or(newest_start, |latest| latest.max(newest_start));
    let window_start = anchor
        .checked_sub_signed(look_back)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let retained: Vec<HistoryElement> = index
        .iter()
        .zip(&starts)
        .filter(|(_, start)| **start > window_start)
        .map(|(element, _)| element.clone())
        .collect();

    debug!(
        "Kept {} of {} allocation snapshots after {}",
        retained.len(),
        index.len(),
        window_start
    );

    Ok(retained)
}

/// Periods overlapping the half-open range `(last_processed, last_eligible]`
pub fn get_unprocessed_eligibility_history(
    periods: &[EligibilityPeriod],
    last_processed_eligibility_hour: DateTime<Utc>,
    last_eligible_hour: DateTime<Utc>,
) -> Vec<EligibilityPeriod> {
    periods
        .iter()
        .filter(|period| !period.is_empty())
        .filter(|period| {
            period.eligibility_end() > last_processed_eligibility_hour
                && period.eligibility_start() <= last_eligible_hour
        })
        .copied()
        .collect()
}

/// Individual eligible hours in `(last_processed, last_eligible]`, ascending
/// and without duplicates even when periods overlap or touch
pub fn get_unprocessed_eligible_hours(
    last_eligible_hour: DateTime<Utc>,
    last_processed_eligibility_hour: DateTime<Utc>,
    periods: &[EligibilityPeriod],
) -> Vec<DateTime<Utc>> {
    let mut hours = BTreeSet::new();
    for period in get_unprocessed_eligibility_history(
        periods,
        last_processed_eligibility_hour,
        last_eligible_hour,
    ) {
        hours.extend(
            period
                .hours()
                .skip_while(|hour| *hour <= last_processed_eligibility_hour)
                .take_while(|hour| *hour <= last_eligible_hour),
        );
    }
    hours.into_iter().collect()
}
