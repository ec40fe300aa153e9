//! Deduplicating accumulator of delivery records for one network
//!
//! Reports are pulled repeatedly and overlap heavily. Records are keyed by
//! (allocation id, hour) so a later report for the same hour replaces the
//! earlier one instead of adding to it.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

use crate::delivery::parser::{ParseResult, RawDeliveryDataParser};
use crate::models::{DeliveryNetwork, RawDeliveryRecord};

/// Key of one canonical record: (allocation id, hour)
pub type DeliveryKey = (String, DateTime<Utc>);

#[derive(Debug, Clone)]
pub struct CanonicalDeliveryData {
    network: DeliveryNetwork,
    records: BTreeMap<DeliveryKey, RawDeliveryRecord>,
    latest_delivery_report_date: DateTime<Utc>,
    latest_delivery_data_date: DateTime<Utc>,
    earliest_delivery_report_date: DateTime<Utc>,
    earliest_delivery_data_date: DateTime<Utc>,
}

fn unset(date: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if date == DateTime::<Utc>::MIN_UTC || date == DateTime::<Utc>::MAX_UTC {
        None
    } else {
        Some(date)
    }
}

impl CanonicalDeliveryData {
    pub fn new(network: DeliveryNetwork) -> Self {
        Self {
            network,
            records: BTreeMap::new(),
            latest_delivery_report_date: DateTime::<Utc>::MIN_UTC,
            latest_delivery_data_date: DateTime::<Utc>::MIN_UTC,
            earliest_delivery_report_date: DateTime::<Utc>::MAX_UTC,
            earliest_delivery_data_date: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn network(&self) -> DeliveryNetwork {
        self.network
    }

    /// Parse one raw report and merge it in.
    ///
    /// Returns the number of records the report contained. On a parse failure
    /// the accumulator is left untouched.
    pub fn add_raw_data(
        &mut self,
        raw: &str,
        report_pull_date: DateTime<Utc>,
        parser: &dyn RawDeliveryDataParser,
    ) -> ParseResult<usize> {
        let records = parser.parse_raw_records(raw)?;
        let count = records.len();

        self.latest_delivery_report_date = self.latest_delivery_report_date.max(report_pull_date);

        if count > 0 {
            self.earliest_delivery_report_date =
                self.earliest_delivery_report_date.min(report_pull_date);
        }

        let mut replaced = 0usize;
        for record in records {
            self.latest_delivery_data_date = self.latest_delivery_data_date.max(record.hour);
            self.earliest_delivery_data_date = self.earliest_delivery_data_date.min(record.hour);

            let key = (record.allocation_id.clone(), record.hour);
            if self.records.insert(key, record).is_some() {
                replaced += 1;
            }
        }

        debug!(
            "Merged {} {} delivery records ({} replaced existing hours)",
            count, self.network, replaced
        );

        Ok(count)
    }

    pub fn get(&self, allocation_id: &str, hour: DateTime<Utc>) -> Option<&RawDeliveryRecord> {
        self.records.get(&(allocation_id.to_string(), hour))
    }

    /// All records, ascending by (allocation id, hour)
    pub fn records(&self) -> impl Iterator<Item = &RawDeliveryRecord> {
        self.records.values()
    }

    /// Records of one allocation id, ascending by hour
    pub fn records_for<'a>(
        &'a self,
        allocation_id: &'a str,
    ) -> impl Iterator<Item = &'a RawDeliveryRecord> + 'a {
        let start = (allocation_id.to_string(), DateTime::<Utc>::MIN_UTC);
        self.records
            .range(start..)
            .take_while(move |((id, _), _)| id == allocation_id)
            .map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest_delivery_report_date(&self) -> Option<DateTime<Utc>> {
        unset(self.latest_delivery_report_date)
    }

    pub fn latest_delivery_data_date(&self) -> Option<DateTime<Utc>> {
        unset(self.latest_delivery_data_date)
    }

    pub fn earliest_delivery_report_date(&self) -> Option<DateTime<Utc>> {
        unset(self.earliest_delivery_report_date)
    }

    pub fn earliest_delivery_data_date(&self) -> Option<DateTime<Utc>> {
        unset(self.earliest_delivery_data_date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::network_a::NetworkAParser;
    use chrono::{TimeDelta, TimeZone};
    use std::collections::HashSet;

    const HEADER: &str = "campaign_id,hour,campaign_code,imps,ecpm,spend,clicks";

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2012, 3, 16, h, 0, 0).unwrap()
    }

    fn report(nodes: &[&str], hours: std::ops::RangeInclusive<u32>, imps: u64) -> String {
        let mut raw = String::from(HEADER);
        for node in nodes {
            for h in hours.clone() {
                raw.push_str(&format!("\n1,2012-03-16 {h:02}:00,{node},{imps},1.00,1.00,0"));
            }
        }
        raw
    }

    #[test]
    fn test_overlapping_reports_are_deduplicated() {
        let mut data = CanonicalDeliveryData::new(DeliveryNetwork::NetworkA);
        let nodes = ["a", "b"];

        let first = report(&nodes, 2..=10, 5);
        let second = report(&nodes, 8..=14, 9);

        assert_eq!(data.add_raw_data(&first, hour(11), &NetworkAParser).unwrap(), 18);
        assert_eq!(data.add_raw_data(&second, hour(15), &NetworkAParser).unwrap(), 14);

        let union: HashSet<(String, u32)> = nodes
            .iter()
            .flat_map(|n| (2..=14).map(move |h| (n.to_string(), h)))
            .collect();
        assert_eq!(data.len(), union.len());

        // Last write wins on the overlapping hours
        assert_eq!(data.get("a", hour(9)).unwrap().impressions, 9);
        assert_eq!(data.get("a", hour(7)).unwrap().impressions, 5);
        assert_eq!(data.records_for("b").count(), 13);
    }

    #[test]
    fn test_date_bookkeeping() {
        let mut data = CanonicalDeliveryData::new(DeliveryNetwork::NetworkA);
        assert_eq!(data.latest_delivery_report_date(), None);
        assert_eq!(data.earliest_delivery_data_date(), None);

        data.add_raw_data(&report(&["a"], 4..=6, 1), hour(8), &NetworkAParser)
            .unwrap();
        data.add_raw_data(&report(&["a"], 1..=2, 1), hour(12), &NetworkAParser)
            .unwrap();

        assert_eq!(data.latest_delivery_report_date(), Some(hour(12)));
        assert_eq!(data.earliest_delivery_report_date(), Some(hour(8)));
        assert_eq!(data.latest_delivery_data_date(), Some(hour(6)));
        assert_eq!(data.earliest_delivery_data_date(), Some(hour(1)));
    }

    #[test]
    fn test_empty_report_only_advances_report_date() {
        let mut data = CanonicalDeliveryData::new(DeliveryNetwork::NetworkA);

        assert_eq!(data.add_raw_data(HEADER, hour(9), &NetworkAParser).unwrap(), 0);
        assert_eq!(data.latest_delivery_report_date(), Some(hour(9)));
        assert_eq!(data.earliest_delivery_report_date(), None);
        assert_eq!(data.latest_delivery_data_date(), None);
        assert_eq!(data.earliest_delivery_data_date(), None);
    }

    #[test]
    fn test_failed_parse_leaves_state_untouched() {
        let mut data = CanonicalDeliveryData::new(DeliveryNetwork::NetworkA);
        data.add_raw_data(&report(&["a"], 1..=3, 1), hour(5), &NetworkAParser)
            .unwrap();

        let bad = format!("{HEADER}\n1,2012-03-16 04:00,a,1,0,0,0\n1,2012-03-16 05:00,,1,0,0,0");
        let later = hour(5) + TimeDelta::hours(10);
        assert!(data.add_raw_data(&bad, later, &NetworkAParser).is_err());

        assert_eq!(data.len(), 3);
        assert_eq!(data.latest_delivery_report_date(), Some(hour(5)));
        assert_eq!(data.latest_delivery_data_date(), Some(hour(3)));
    }
}
