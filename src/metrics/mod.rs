//! Rolling per-node delivery metrics
//!
//! [`DeliveryMetrics`] merges canonical delivery data against eligibility
//! history into an hour-of-week profile per node, lifetime totals and the
//! campaign's remaining budget.

pub mod aggregator;
pub mod cost;
pub mod node;
pub mod profile;

pub use aggregator::{
    effective_ceiling, node_deliveries, BudgetSummary, DeliveryMetrics, DeliveryMetricsConfig,
    NodeDeliveryRecords, DEFAULT_LOOK_BACK_HOURS, DEFAULT_REPORT_DEAD_ZONE_HOURS,
};
pub use cost::{DeliveryDataCost, MeasureCpmDataCost, NoDataCost, PercentOfMediaDataCost};
pub use node::{HourDelivery, NodeDeliveryMetrics};
pub use profile::{
    profile_hour_index, utc_hour_bucket, HourSample, NodeHourMetrics, SampleWindow,
    DEFAULT_SAMPLE_WINDOW, HOURS_PER_WEEK,
};
