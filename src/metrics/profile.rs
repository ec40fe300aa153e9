//! Hour-of-week profile buckets and their bounded sample windows

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of buckets in a delivery profile (7 days x 24 hours)
pub const HOURS_PER_WEEK: i64 = 168;

/// Default number of recent samples each bucket keeps
pub const DEFAULT_SAMPLE_WINDOW: usize = 4;

/// Floor a timestamp to the top of its UTC hour
pub fn utc_hour_bucket(date_time: DateTime<Utc>) -> DateTime<Utc> {
    date_time
        .with_nanosecond(0)
        .and_then(|dt| dt.with_second(0))
        .and_then(|dt| dt.with_minute(0))
        .unwrap_or(date_time)
}

/// Hour-of-week bucket of a timestamp, counted from the Unix epoch
pub fn profile_hour_index(date_time: DateTime<Utc>) -> usize {
    date_time
        .timestamp()
        .div_euclid(3600)
        .rem_euclid(HOURS_PER_WEEK) as usize
}

/// One observation tagged with the hour it was taken for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourSample<T> {
    pub hour: DateTime<Utc>,
    pub value: T,
}

/// Fixed-capacity ring of the most recent samples; the oldest is evicted
/// once the capacity is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleWindow<T> {
    capacity: usize,
    samples: VecDeque<HourSample<T>>,
}

impl<T> SampleWindow<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append a sample, returning the ones evicted to make room
    pub fn push(&mut self, hour: DateTime<Utc>, value: T) -> Vec<HourSample<T>> {
        let mut evicted = Vec::new();
        while self.samples.len() >= self.capacity {
            match self.samples.pop_front() {
                Some(oldest) => evicted.push(oldest),
                None => break,
            }
        }
        self.samples.push_back(HourSample { hour, value });
        evicted
    }

    /// Replace the value recorded for `hour`, if the window still holds it
    pub fn replace(&mut self, hour: DateTime<Utc>, value: T) -> bool {
        match self.samples.iter_mut().find(|sample| sample.hour == hour) {
            Some(sample) => {
                sample.value = value;
                true
            }
            None => false,
        }
    }

    pub fn contains_hour(&self, hour: DateTime<Utc>) -> bool {
        self.samples.iter().any(|sample| sample.hour == hour)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HourSample<T>> {
        self.samples.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.samples.iter().map(|sample| &sample.value)
    }
}

/// Aggregated state of one hour-of-week bucket of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHourMetrics {
    pub average_impressions: Decimal,
    pub average_media_spend: Decimal,
    pub eligibility_count: u64,
    pub last_n_impressions: SampleWindow<u64>,
    pub last_n_media_spend: SampleWindow<Decimal>,
}

impl NodeHourMetrics {
    pub fn new(sample_window: usize) -> Self {
        Self {
            average_impressions: Decimal::ZERO,
            average_media_spend: Decimal::ZERO,
            eligibility_count: 0,
            last_n_impressions: SampleWindow::with_capacity(sample_window),
            last_n_media_spend: SampleWindow::with_capacity(sample_window),
        }
    }

    /// Fold in a newly processed eligible hour
    pub fn record_eligible_hour(
        &mut self,
        hour: DateTime<Utc>,
        impressions: u64,
        media_spend: Decimal,
    ) {
        self.last_n_impressions.push(hour, impressions);
        self.last_n_media_spend.push(hour, media_spend);
        self.eligibility_count += 1;
        self.recompute_averages();
    }

    /// Apply re-delivered values for an hour already in the window.
    /// Returns false when the window no longer holds that hour.
    pub fn revise_hour(&mut self, hour: DateTime<Utc>, impressions: u64, media_spend: Decimal) -> bool {
        let revised = self.last_n_impressions.replace(hour, impressions);
        let revised = self.last_n_media_spend.replace(hour, media_spend) && revised;
        if revised {
            self.recompute_averages();
        }
        revised
    }

    fn recompute_averages(&mut self) {
        self.average_impressions = mean(self.last_n_impressions.values().map(|v| Decimal::from(*v)));
        self.average_media_spend = mean(self.last_n_media_spend.values().copied());
    }
}

fn mean(values: impl Iterator<Item = Decimal>) -> Decimal {
    let (sum, count) = values.fold((Decimal::ZERO, 0u64), |(sum, count), v| {
        (sum.saturating_add(v), count + 1)
    });
    if count == 0 {
        Decimal::ZERO
    } else {
        sum / Decimal::from(count)
    }
}
