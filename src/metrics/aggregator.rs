//! Incremental merge of canonical delivery data into per-node metrics
//!
//! Each pass walks the eligible hours of every node that lie between the
//! node's watermark and an effective ceiling hour, folding the delivery
//! observed in those hours (or a zero observation when a network reported
//! nothing) into the node's hour-of-week profile and lifetime totals.
//!
//! The merge is idempotent: hours at or before the watermark are never added
//! to the totals again, so re-running a pass over overlapping reports only
//! revises the rolling bucket values.

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::delivery::CanonicalDeliveryData;
use crate::eligibility::{
    get_unprocessed_eligibility_history, get_unprocessed_eligible_hours,
    EligibilityHistoryBuilder,
};
use crate::metrics::cost::{DeliveryDataCost, NoDataCost};
use crate::metrics::node::{HourDelivery, NodeDeliveryMetrics};
use crate::metrics::profile::{utc_hour_bucket, DEFAULT_SAMPLE_WINDOW};
use crate::models::MeasureSet;

/// Default trailing span of reported hours that is treated as provisional
pub const DEFAULT_REPORT_DEAD_ZONE_HOURS: i64 = 3;

/// Default span of eligibility history a pass looks at
pub const DEFAULT_LOOK_BACK_HOURS: i64 = 14 * 24;

/// Delivery of one node, keyed by hour
pub type NodeDeliveryRecords = BTreeMap<DateTime<Utc>, HourDelivery>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMetricsConfig {
    pub report_dead_zone: TimeDelta,
    pub look_back: TimeDelta,
    pub sample_window: usize,
}

impl Default for DeliveryMetricsConfig {
    fn default() -> Self {
        Self {
            report_dead_zone: TimeDelta::hours(DEFAULT_REPORT_DEAD_ZONE_HOURS),
            look_back: TimeDelta::hours(DEFAULT_LOOK_BACK_HOURS),
            sample_window: DEFAULT_SAMPLE_WINDOW,
        }
    }
}

/// Budget figures derived from the node metrics after a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub total_budget: Decimal,
    /// Total budget less media spend and data cost
    pub remaining_budget: Decimal,
    /// Media spend so far plus the remaining budget; data cost excluded
    pub lifetime_media_budget_cap: Decimal,
    pub total_media_spend: Decimal,
    pub total_spend: Decimal,
    pub nodes: usize,
}

/// Per-campaign aggregation state: node metrics plus the derived budget figures
pub struct DeliveryMetrics {
    config: DeliveryMetricsConfig,
    data_cost: Arc<dyn DeliveryDataCost>,
    node_metrics: HashMap<MeasureSet, NodeDeliveryMetrics>,
    remaining_budget: Decimal,
    lifetime_media_budget_cap: Decimal,
}

impl DeliveryMetrics {
    pub fn new(config: DeliveryMetricsConfig, data_cost: Arc<dyn DeliveryDataCost>) -> Self {
        Self {
            config,
            data_cost,
            node_metrics: HashMap::new(),
            remaining_budget: Decimal::ZERO,
            lifetime_media_budget_cap: Decimal::ZERO,
        }
    }

    /// Resume from previously persisted node metrics
    pub fn with_node_metrics(mut self, node_metrics: HashMap<MeasureSet, NodeDeliveryMetrics>) -> Self {
        self.node_metrics = node_metrics;
        self
    }

    pub fn config(&self) -> &DeliveryMetricsConfig {
        &self.config
    }

    pub fn node(&self, node: &MeasureSet) -> Option<&NodeDeliveryMetrics> {
        self.node_metrics.get(node)
    }

    pub fn node_metrics(&self) -> &HashMap<MeasureSet, NodeDeliveryMetrics> {
        &self.node_metrics
    }

    pub fn into_node_metrics(self) -> HashMap<MeasureSet, NodeDeliveryMetrics> {
        self.node_metrics
    }

    pub fn remaining_budget(&self) -> Decimal {
        self.remaining_budget
    }

    pub fn lifetime_media_budget_cap(&self) -> Decimal {
        self.lifetime_media_budget_cap
    }

    /// Latest report hour that is trusted as final: the newest report pull,
    /// floored to the hour, less the report dead zone
    pub fn last_valid_report_hour(&self, canonical: &CanonicalDeliveryData) -> Option<DateTime<Utc>> {
        canonical
            .latest_delivery_report_date()
            .map(utc_hour_bucket)
            .and_then(|hour| hour.checked_sub_signed(self.config.report_dead_zone))
    }

    /// Update every node of the campaign and derive the budget figures.
    ///
    /// `node_map` maps allocation ids, as reported by the network, to nodes.
    /// Nodes that already have metrics are updated even when no longer mapped
    /// so that their trailing eligibility is still closed out.
    pub fn calculate_node_metrics(
        &mut self,
        canonical: &CanonicalDeliveryData,
        history: &EligibilityHistoryBuilder,
        node_map: &HashMap<String, MeasureSet>,
        total_budget: Decimal,
    ) -> BudgetSummary {
        let last_valid_report_hour = self.last_valid_report_hour(canonical);
        let last_campaign_delivery_hour = canonical.latest_delivery_data_date().map(utc_hour_bucket);
        let deliveries = node_deliveries(canonical, node_map);

        let mut nodes: BTreeSet<MeasureSet> = node_map.values().cloned().collect();
        nodes.extend(self.node_metrics.keys().cloned());

        info!(
            "Calculating delivery metrics for {} nodes ({} records, valid through {:?})",
            nodes.len(),
            canonical.len(),
            last_valid_report_hour
        );

        let empty = NodeDeliveryRecords::new();
        for node in &nodes {
            let current = self
                .node_metrics
                .remove(node)
                .unwrap_or_else(|| NodeDeliveryMetrics::with_sample_window(self.config.sample_window));

            let updated = self.update_node_metrics(
                current,
                node,
                deliveries.get(node).unwrap_or(&empty),
                last_valid_report_hour,
                last_campaign_delivery_hour,
                self.config.look_back,
                history,
            );
            self.node_metrics.insert(node.clone(), updated);
        }

        let total_spend = self
            .node_metrics
            .values()
            .fold(Decimal::ZERO, |sum, m| sum.saturating_add(m.total_spend));
        let total_media_spend = self
            .node_metrics
            .values()
            .fold(Decimal::ZERO, |sum, m| sum.saturating_add(m.total_media_spend));

        self.remaining_budget = total_budget.saturating_sub(total_spend);
        self.lifetime_media_budget_cap = total_media_spend.saturating_add(self.remaining_budget);

        if self.remaining_budget.is_sign_negative() && !self.remaining_budget.is_zero() {
            warn!(
                "Campaign spend {} exceeds total budget {}",
                total_spend, total_budget
            );
        }

        BudgetSummary {
            total_budget,
            remaining_budget: self.remaining_budget,
            lifetime_media_budget_cap: self.lifetime_media_budget_cap,
            total_media_spend,
            total_spend,
            nodes: self.node_metrics.len(),
        }
    }

    /// Merge one node's unprocessed delivery against its eligibility history.
    ///
    /// Takes the node's metrics by value and returns the updated metrics.
    #[allow(clippy::too_many_arguments)]
    pub fn update_node_metrics(
        &self,
        mut node_metrics: NodeDeliveryMetrics,
        node: &MeasureSet,
        unprocessed_delivery: &NodeDeliveryRecords,
        last_valid_report_hour: Option<DateTime<Utc>>,
        last_campaign_delivery_hour: Option<DateTime<Utc>>,
        look_back: TimeDelta,
        history: &EligibilityHistoryBuilder,
    ) -> NodeDeliveryMetrics {
        let Some(node_history) = history.history(node).filter(|h| !h.is_empty()) else {
            debug!("Node {} has no eligibility history", node);
            return node_metrics;
        };
        let Some(last_eligible_hour) = node_history.last_eligible_hour() else {
            return node_metrics;
        };
        let Some(ceiling) = effective_ceiling(
            last_eligible_hour,
            last_valid_report_hour,
            last_campaign_delivery_hour,
        ) else {
            debug!("Node {}: no trusted report hour yet", node);
            return node_metrics;
        };

        let watermark = node_metrics.last_processed_eligibility_hour;
        let mut latest_delivery: Option<DateTime<Utc>> = None;

        // Re-delivered hours that are already part of the totals
        if let Some(watermark) = watermark {
            let mut revised = 0usize;
            for (hour, delivery) in unprocessed_delivery.range(..=watermark) {
                if node_metrics.revise_counted_hour(*hour, *delivery) {
                    revised += 1;
                }
                latest_delivery = latest_delivery.max(Some(*hour));
            }
            if revised > 0 {
                debug!("Node {}: revised {} previously counted hours", node, revised);
            }
        }

        if watermark.is_none() && last_campaign_delivery_hour.is_none() {
            // No delivery anywhere in the campaign yet: nothing to count
            node_metrics.last_processed_eligibility_hour = Some(ceiling);
            return node_metrics;
        }

        if watermark.map_or(true, |watermark| ceiling > watermark) {
            let look_back_floor = ceiling
                .checked_sub_signed(look_back)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let floor = watermark.map_or(look_back_floor, |watermark| watermark.max(look_back_floor));

            let periods = get_unprocessed_eligibility_history(node_history.periods(), floor, ceiling);
            let hours = get_unprocessed_eligible_hours(ceiling, floor, &periods);

            let mut delivered_hours = 0usize;
            for hour in &hours {
                let (delivery, data_cost) = match unprocessed_delivery.get(hour) {
                    Some(delivery) => {
                        delivered_hours += 1;
                        latest_delivery = latest_delivery.max(Some(*hour));
                        let cost = self.data_cost.calculate_hour_cost(
                            delivery.impressions,
                            delivery.ecpm,
                            node,
                        );
                        (*delivery, cost)
                    }
                    None => (HourDelivery::default(), Decimal::ZERO),
                };
                node_metrics.record_eligible_hour(*hour, delivery, data_cost);
            }

            debug!(
                "Node {}: processed {} eligible hours ({} with delivery) through {}",
                node,
                hours.len(),
                delivered_hours,
                ceiling
            );

            node_metrics.last_processed_eligibility_hour = Some(ceiling);
        }

        if latest_delivery.is_some() {
            node_metrics.last_processed_delivery_hour =
                node_metrics.last_processed_delivery_hour.max(latest_delivery);
        }

        node_metrics
    }
}

impl Default for DeliveryMetrics {
    fn default() -> Self {
        Self::new(DeliveryMetricsConfig::default(), Arc::new(NoDataCost))
    }
}

/// Ceiling hour for one node's pass.
///
/// A node whose eligibility ended before the campaign's last delivered hour
/// is processed through the end of its eligibility: the campaign delivering
/// past that point means the node's own trailing hours are final. Otherwise
/// the ceiling is the earlier of the trusted report hour and the node's last
/// eligible hour.
pub fn effective_ceiling(
    last_eligible_hour: DateTime<Utc>,
    last_valid_report_hour: Option<DateTime<Utc>>,
    last_campaign_delivery_hour: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    if let Some(last_delivery) = last_campaign_delivery_hour {
        if last_eligible_hour < last_delivery {
            return Some(last_eligible_hour);
        }
    }
    last_valid_report_hour.map(|valid| valid.min(last_eligible_hour))
}

/// Group canonical records by node, summing allocation ids of the same node
/// that report the same hour
pub fn node_deliveries(
    canonical: &CanonicalDeliveryData,
    node_map: &HashMap<String, MeasureSet>,
) -> HashMap<MeasureSet, NodeDeliveryRecords> {
    let mut deliveries: HashMap<MeasureSet, NodeDeliveryRecords> = HashMap::new();
    let mut unmapped = 0usize;

    for record in canonical.records() {
        let Some(node) = node_map.get(&record.allocation_id) else {
            unmapped += 1;
            continue;
        };

        let delivery = HourDelivery::new(record.impressions, record.spend, record.ecpm);
        deliveries
            .entry(node.clone())
            .or_default()
            .entry(record.hour)
            .and_modify(|existing| {
                let combined = existing.combine(delivery);
                if combined.impressions == u64::MAX || combined.media_spend == Decimal::MAX {
                    warn!(
                        "Delivery of node {} at {} saturated while summing allocation ids",
                        node, record.hour
                    );
                }
                *existing = combined;
            })
            .or_insert(delivery);
    }

    if unmapped > 0 {
        warn!(
            "Ignored {} delivery records whose allocation id maps to no node",
            unmapped
        );
    }

    deliveries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2012, 3, 16, 0, 0, 0).unwrap()
    }

    fn h(n: i64) -> DateTime<Utc> {
        t0() + TimeDelta::hours(n)
    }

    #[test]
    fn test_effective_ceiling() {
        // Normal case: bounded by the trusted report hour
        assert_eq!(effective_ceiling(h(47), Some(h(20)), Some(h(22))), Some(h(20)));
        // Eligibility ending before the trusted report hour
        assert_eq!(effective_ceiling(h(10), Some(h(20)), Some(h(22))), Some(h(10)));
        // Eligibility ended inside the dead zone but the campaign kept delivering
        assert_eq!(effective_ceiling(h(21), Some(h(19)), Some(h(22))), Some(h(21)));
        // No report yet
        assert_eq!(effective_ceiling(h(21), None, None), None);
    }

    #[test]
    fn test_update_without_history_is_unchanged() {
        let metrics = DeliveryMetrics::default();
        let node = MeasureSet::new([1]);
        let before = NodeDeliveryMetrics::default();

        let after = metrics.update_node_metrics(
            before.clone(),
            &node,
            &NodeDeliveryRecords::new(),
            Some(h(10)),
            Some(h(10)),
            TimeDelta::hours(48),
            &EligibilityHistoryBuilder::new(),
        );
        assert_eq!(after, before);
    }
}
