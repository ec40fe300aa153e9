//! Allocation snapshots and the history index that references them

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::models::MeasureSet;

/// One entry of the allocation-history index (newest first)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryElement {
    /// ISO-8601 start time of the allocation
    pub allocation_start_time: String,

    /// Opaque reference to the full allocation snapshot
    pub allocation_outputs_id: String,
}

impl HistoryElement {
    pub fn new(allocation_start_time: impl Into<String>, allocation_outputs_id: impl Into<String>) -> Self {
        Self {
            allocation_start_time: allocation_start_time.into(),
            allocation_outputs_id: allocation_outputs_id.into(),
        }
    }

    /// Parse the start time. Offsets are honoured; timestamps without an
    /// offset are taken as UTC.
    pub fn start_time(&self) -> Result<DateTime<Utc>, chrono::ParseError> {
        let raw = self.allocation_start_time.trim();
        match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => Ok(parsed.with_timezone(&Utc)),
            Err(rfc_err) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
                .map(|naive| naive.and_utc())
                .map_err(|_| rfc_err),
        }
    }
}

/// One historical allocation snapshot of a campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAllocation {
    pub campaign_id: String,

    pub allocation_start_time: DateTime<Utc>,

    /// Per-node allocation results keyed by node
    #[serde(default)]
    pub per_node_results: BTreeMap<MeasureSet, PerNodeBudgetAllocationResult>,
}

/// Allocation result for a single node within a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerNodeBudgetAllocationResult {
    /// Opaque key the delivery networks report this node under
    pub allocation_id: String,

    /// Budget exported to the delivery network; zero means never eligible
    pub export_budget: Decimal,

    pub period_start: DateTime<Utc>,

    #[serde(with = "humantime_serde")]
    pub period_duration: Duration,
}

impl PerNodeBudgetAllocationResult {
    /// Period duration as a signed chrono delta, `None` if it does not fit
    pub fn period_delta(&self) -> Option<TimeDelta> {
        TimeDelta::from_std(self.period_duration).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_history_element_start_time_formats() {
        let expected = Utc.with_ymd_and_hms(2012, 3, 16, 15, 0, 0).unwrap();

        for raw in [
            "2012-03-16T15:00:00Z",
            "2012-03-16T15:00:00.0000000Z",
            "2012-03-16T17:00:00+02:00",
            "2012-03-16T15:00:00",
            "2012-03-16 15:00:00",
        ] {
            let element = HistoryElement::new(raw, "outputs");
            assert_eq!(element.start_time().unwrap(), expected, "format {raw}");
        }

        assert!(HistoryElement::new("yesterday", "outputs").start_time().is_err());
    }

    #[test]
    fn test_snapshot_json_shape() {
        let json = r#"{
            "campaign_id": "c1",
            "allocation_start_time": "2012-03-16T00:00:00Z",
            "per_node_results": {
                "2:1": {
                    "allocation_id": "alloc-1",
                    "export_budget": "12.50",
                    "period_start": "2012-03-16T00:00:00Z",
                    "period_duration": "24h"
                }
            }
        }"#;

        let snapshot: BudgetAllocation = serde_json::from_str(json).unwrap();
        let node = snapshot.per_node_results.get(&MeasureSet::new([1, 2])).unwrap();

        assert_eq!(node.export_budget, Decimal::new(1250, 2));
        assert_eq!(node.period_delta(), Some(TimeDelta::hours(24)));
    }
}
