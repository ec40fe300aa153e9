use chrono::{DateTime, TimeDelta, Utc};
use std::iter;

use crate::metrics::profile::utc_hour_bucket;

fn one_hour() -> TimeDelta {
    TimeDelta::hours(1)
}

/// A contiguous span of whole hours during which a node was eligible.
///
/// The start is floored to the hour and the duration truncated to whole
/// hours; negative durations are treated as empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EligibilityPeriod {
    eligibility_start: DateTime<Utc>,
    eligibility_duration: TimeDelta,
}

impl EligibilityPeriod {
    pub fn new(eligibility_start: DateTime<Utc>, eligibility_duration: TimeDelta) -> Self {
        let whole_hours = eligibility_duration.num_hours().max(0);
        Self {
            eligibility_start: utc_hour_bucket(eligibility_start),
            eligibility_duration: TimeDelta::hours(whole_hours),
        }
    }

    pub fn eligibility_start(&self) -> DateTime<Utc> {
        self.eligibility_start
    }

    pub fn eligibility_duration(&self) -> TimeDelta {
        self.eligibility_duration
    }

    /// Last eligible hour (inclusive): start + duration - 1h
    pub fn eligibility_end(&self) -> DateTime<Utc> {
        self.exclusive_end()
            .checked_sub_signed(one_hour())
            .unwrap_or(self.eligibility_start)
    }

    pub(crate) fn exclusive_end(&self) -> DateTime<Utc> {
        self.eligibility_start
            .checked_add_signed(self.eligibility_duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_empty(&self) -> bool {
        self.eligibility_duration < one_hour()
    }

    pub fn covered_hours(&self) -> i64 {
        self.eligibility_duration.num_hours()
    }

    /// Every eligible hour of the period, ascending
    pub fn hours(&self) -> impl Iterator<Item = DateTime<Utc>> {
        let end = self.exclusive_end();
        let first = (!self.is_empty()).then_some(self.eligibility_start);
        iter::successors(first, |hour| hour.checked_add_signed(one_hour()))
            .take_while(move |hour| *hour < end)
    }

    pub fn overlaps(&self, other: &EligibilityPeriod) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.eligibility_start < other.exclusive_end()
            && other.eligibility_start < self.exclusive_end()
    }
}

/// Eligibility periods of one node, ascending and pairwise exclusive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeEligibilityHistory {
    periods: Vec<EligibilityPeriod>,
}

impl NodeEligibilityHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn periods(&self) -> &[EligibilityPeriod] {
        &self.periods
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    /// Insert a period and re-derive the exclusive set.
    ///
    /// Overlaps are resolved in favour of the period that starts first (the
    /// longer one on equal starts): the later period is trimmed to begin where
    /// the earlier one ends, or dropped when fully covered. Touching periods
    /// are kept as consecutive entries with their boundaries unchanged.
    pub fn add_period(&mut self, period: EligibilityPeriod) {
        if period.is_empty() {
            return;
        }
        self.periods.push(period);
        self.periods = make_exclusive(std::mem::take(&mut self.periods));
    }

    pub fn last_eligible_hour(&self) -> Option<DateTime<Utc>> {
        self.periods.iter().map(EligibilityPeriod::eligibility_end).max()
    }

    pub fn covered_hours(&self) -> i64 {
        self.periods.iter().map(EligibilityPeriod::covered_hours).sum()
    }

    pub fn is_exclusive(&self) -> bool {
        self.periods
            .iter()
            .enumerate()
            .all(|(idx, period)| self.periods[idx + 1..].iter().all(|other| !period.overlaps(other)))
    }
}

fn make_exclusive(mut periods: Vec<EligibilityPeriod>) -> Vec<EligibilityPeriod> {
    periods.retain(|period| !period.is_empty());
    periods.sort_by(|a, b| {
        a.eligibility_start
            .cmp(&b.eligibility_start)
            .then_with(|| b.exclusive_end().cmp(&a.exclusive_end()))
    });

    let mut exclusive: Vec<EligibilityPeriod> = Vec::with_capacity(periods.len());
    for period in periods {
        let end = period.exclusive_end();
        let mut start = period.eligibility_start;

        // The last kept period always has the furthest end so far
        if let Some(previous) = exclusive.last() {
            let previous_end = previous.exclusive_end();
            if end <= previous_end {
                continue;
            }
            start = start.max(previous_end);
        }

        exclusive.push(EligibilityPeriod::new(start, end - start));
    }
    exclusive
}
