use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::metrics::profile::{profile_hour_index, NodeHourMetrics, DEFAULT_SAMPLE_WINDOW};

/// Delivery observed for one node in one hour, summed over allocation ids
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HourDelivery {
    pub impressions: u64,
    pub media_spend: Decimal,
    pub ecpm: Decimal,
}

impl HourDelivery {
    pub fn new(impressions: u64, media_spend: Decimal, ecpm: Decimal) -> Self {
        Self {
            impressions,
            media_spend,
            ecpm,
        }
    }

    /// Combine two deliveries for the same hour; eCPM is re-derived from the
    /// combined spend when there are impressions to spread it over.
    ///
    /// Sums saturate instead of overflowing.
    pub fn combine(self, other: HourDelivery) -> HourDelivery {
        let impressions = self.impressions.saturating_add(other.impressions);
        let media_spend = self.media_spend.saturating_add(other.media_spend);
        let fallback = self.ecpm.max(other.ecpm);
        let ecpm = if impressions > 0 {
            media_spend
                .checked_mul(Decimal::from(1000))
                .and_then(|spend| spend.checked_div(Decimal::from(impressions)))
                .unwrap_or(fallback)
        } else {
            fallback
        };
        HourDelivery {
            impressions,
            media_spend,
            ecpm,
        }
    }
}

/// Lifetime and rolling delivery state of one node.
///
/// This is the only state that outlives a pass: it is loaded before and
/// persisted after every aggregation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDeliveryMetrics {
    /// Hour-of-week bucket index to bucket state
    #[serde(default)]
    pub delivery_profile: BTreeMap<usize, NodeHourMetrics>,

    #[serde(default)]
    pub total_eligible_hours: u64,

    #[serde(default)]
    pub total_impressions: u64,

    #[serde(default)]
    pub total_media_spend: Decimal,

    /// Media spend plus data cost
    #[serde(default)]
    pub total_spend: Decimal,

    /// Watermark: last eligible hour folded into the totals
    #[serde(default)]
    pub last_processed_eligibility_hour: Option<DateTime<Utc>>,

    /// Last hour an actual delivery record was observed for
    #[serde(default)]
    pub last_processed_delivery_hour: Option<DateTime<Utc>>,

    #[serde(default = "NodeDeliveryMetrics::default_sample_window")]
    pub sample_window: usize,
}

impl Default for NodeDeliveryMetrics {
    fn default() -> Self {
        Self::with_sample_window(DEFAULT_SAMPLE_WINDOW)
    }
}

impl NodeDeliveryMetrics {
    const fn default_sample_window() -> usize {
        DEFAULT_SAMPLE_WINDOW
    }

    pub fn with_sample_window(sample_window: usize) -> Self {
        Self {
            delivery_profile: BTreeMap::new(),
            total_eligible_hours: 0,
            total_impressions: 0,
            total_media_spend: Decimal::ZERO,
            total_spend: Decimal::ZERO,
            last_processed_eligibility_hour: None,
            last_processed_delivery_hour: None,
            sample_window: sample_window.max(1),
        }
    }

    /// Bucket state for the hour-of-week of `hour`
    pub fn hour_metrics(&self, hour: DateTime<Utc>) -> Option<&NodeHourMetrics> {
        self.delivery_profile.get(&profile_hour_index(hour))
    }

    /// Fold a newly processed eligible hour into its bucket and the totals
    pub fn record_eligible_hour(
        &mut self,
        hour: DateTime<Utc>,
        delivery: HourDelivery,
        data_cost: Decimal,
    ) {
        let sample_window = self.sample_window;
        self.delivery_profile
            .entry(profile_hour_index(hour))
            .or_insert_with(|| NodeHourMetrics::new(sample_window))
            .record_eligible_hour(hour, delivery.impressions, delivery.media_spend);

        self.total_eligible_hours = self.total_eligible_hours.saturating_add(1);
        self.total_impressions = self.total_impressions.saturating_add(delivery.impressions);
        self.total_media_spend = self.total_media_spend.saturating_add(delivery.media_spend);
        self.total_spend = self
            .total_spend
            .saturating_add(delivery.media_spend.saturating_add(data_cost));
    }

    /// Apply a re-delivery of an hour already counted in the totals.
    ///
    /// Only the bucket's rolling values change; returns false when the bucket
    /// no longer holds a sample for that hour.
    pub fn revise_counted_hour(&mut self, hour: DateTime<Utc>, delivery: HourDelivery) -> bool {
        self.delivery_profile
            .get_mut(&profile_hour_index(hour))
            .map(|bucket| bucket.revise_hour(hour, delivery.impressions, delivery.media_spend))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    #[test]
    fn test_combine_rederives_ecpm() {
        let a = HourDelivery::new(1000, Decimal::from(2), Decimal::from(2));
        let b = HourDelivery::new(3000, Decimal::from(10), Decimal::from(3));
        let combined = a.combine(b);

        assert_eq!(combined.impressions, 4000);
        assert_eq!(combined.media_spend, Decimal::from(12));
        assert_eq!(combined.ecpm, Decimal::from(3));
    }

    #[test]
    fn test_combine_saturates_instead_of_overflowing() {
        let half = u64::MAX / 2 + 1;
        let a = HourDelivery::new(half, Decimal::MAX, Decimal::from(4));
        let b = HourDelivery::new(half, Decimal::ONE, Decimal::from(5));
        let combined = a.combine(b);

        assert_eq!(combined.impressions, u64::MAX);
        assert_eq!(combined.media_spend, Decimal::MAX);
        // Spend * 1000 does not fit, so the larger reported eCPM is kept
        assert_eq!(combined.ecpm, Decimal::from(5));
    }

    #[test]
    fn test_totals_saturate() {
        let t = Utc.with_ymd_and_hms(2012, 3, 16, 15, 0, 0).unwrap();
        let mut metrics = NodeDeliveryMetrics::default();

        metrics.record_eligible_hour(t, HourDelivery::new(u64::MAX, Decimal::MAX, Decimal::ZERO), Decimal::ONE);
        metrics.record_eligible_hour(
            t + TimeDelta::hours(1),
            HourDelivery::new(10, Decimal::ONE, Decimal::ZERO),
            Decimal::ZERO,
        );

        assert_eq!(metrics.total_impressions, u64::MAX);
        assert_eq!(metrics.total_media_spend, Decimal::MAX);
        assert_eq!(metrics.total_spend, Decimal::MAX);
        assert_eq!(metrics.total_eligible_hours, 2);
    }

    #[test]
    fn test_record_and_revise() {
        let t = Utc.with_ymd_and_hms(2012, 3, 16, 15, 0, 0).unwrap();
        let mut metrics = NodeDeliveryMetrics::with_sample_window(2);

        metrics.record_eligible_hour(t, HourDelivery::new(10, Decimal::ONE, Decimal::ZERO), Decimal::new(5, 1));
        assert_eq!(metrics.total_eligible_hours, 1);
        assert_eq!(metrics.total_impressions, 10);
        assert_eq!(metrics.total_spend, Decimal::new(15, 1));

        assert!(metrics.revise_counted_hour(t, HourDelivery::new(50, Decimal::from(2), Decimal::ZERO)));
        assert_eq!(metrics.total_impressions, 10);
        assert_eq!(metrics.hour_metrics(t).unwrap().average_impressions, Decimal::from(50));

        assert!(!metrics.revise_counted_hour(t + TimeDelta::hours(1), HourDelivery::default()));
    }

    #[test]
    fn test_serde_round_trip_keeps_windows() {
        let t = Utc.with_ymd_and_hms(2012, 3, 16, 15, 0, 0).unwrap();
        let mut metrics = NodeDeliveryMetrics::default();
        metrics.record_eligible_hour(t, HourDelivery::new(7, Decimal::new(123, 2), Decimal::ZERO), Decimal::ZERO);
        metrics.last_processed_eligibility_hour = Some(t);

        let json = serde_json::to_string(&metrics).unwrap();
        let back: NodeDeliveryMetrics = serde_json::from_str(&json).unwrap();

        assert_eq!(back, metrics);
        assert_eq!(back.hour_metrics(t).unwrap().last_n_impressions.len(), 1);
    }
}
