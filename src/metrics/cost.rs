//! Data cost charged on top of media spend for delivered hours

use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::models::MeasureSet;

/// Cost of the audience data used to deliver one hour of a node
pub trait DeliveryDataCost: Send + Sync {
    fn calculate_hour_cost(&self, impressions: u64, ecpm: Decimal, node: &MeasureSet) -> Decimal;
}

fn per_mille(impressions: u64) -> Decimal {
    Decimal::from(impressions) / Decimal::from(1000)
}

/// No data cost; every hour costs its media spend only
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDataCost;

impl DeliveryDataCost for NoDataCost {
    fn calculate_hour_cost(&self, _impressions: u64, _ecpm: Decimal, _node: &MeasureSet) -> Decimal {
        Decimal::ZERO
    }
}

/// Fixed CPM per measure; a node pays the sum of its measures' CPMs.
/// Measures without a configured rate are free.
#[derive(Debug, Clone, Default)]
pub struct MeasureCpmDataCost {
    cpm_by_measure: HashMap<i64, Decimal>,
}

impl MeasureCpmDataCost {
    pub fn new(cpm_by_measure: HashMap<i64, Decimal>) -> Self {
        Self { cpm_by_measure }
    }

    pub fn node_cpm(&self, node: &MeasureSet) -> Decimal {
        node.measures()
            .iter()
            .filter_map(|measure| self.cpm_by_measure.get(measure))
            .fold(Decimal::ZERO, |total, cpm| total.saturating_add(*cpm))
    }
}

impl DeliveryDataCost for MeasureCpmDataCost {
    fn calculate_hour_cost(&self, impressions: u64, _ecpm: Decimal, node: &MeasureSet) -> Decimal {
        if impressions == 0 {
            return Decimal::ZERO;
        }
        self.node_cpm(node).saturating_mul(per_mille(impressions))
    }
}

/// Data cost as a fraction of the media eCPM, optionally capped per mille
#[derive(Debug, Clone, Copy)]
pub struct PercentOfMediaDataCost {
    fraction: Decimal,
    max_cpm: Option<Decimal>,
}

impl PercentOfMediaDataCost {
    /// `fraction` is the share of media eCPM, e.g. `0.15` for 15%
    pub fn new(fraction: Decimal, max_cpm: Option<Decimal>) -> Self {
        Self {
            fraction: fraction.max(Decimal::ZERO),
            max_cpm,
        }
    }
}

impl DeliveryDataCost for PercentOfMediaDataCost {
    fn calculate_hour_cost(&self, impressions: u64, ecpm: Decimal, _node: &MeasureSet) -> Decimal {
        if impressions == 0 {
            return Decimal::ZERO;
        }
        let mut cpm = ecpm.saturating_mul(self.fraction);
        if let Some(max_cpm) = self.max_cpm {
            cpm = cpm.min(max_cpm);
        }
        cpm.saturating_mul(per_mille(impressions))
    }
}
