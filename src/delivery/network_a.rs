use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::delivery::parser::{
    parse_report, ColumnTable, Field, ParseResult, RawDeliveryDataParser, Row,
};
use crate::metrics::profile::utc_hour_bucket;
use crate::models::{DeliveryNetwork, RawDeliveryRecord};

const COLUMNS: ColumnTable = &[
    ("campaign_id", Field::CampaignId),
    ("hour", Field::Hour),
    ("campaign_code", Field::AllocationId),
    ("imps", Field::Impressions),
    ("ecpm", Field::Ecpm),
    ("spend", Field::Spend),
    ("clicks", Field::Clicks),
];

const REQUIRED: &[Field] = &[Field::CampaignId, Field::Hour, Field::AllocationId];

const HOUR_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Parser for network A reports, which carry one combined `hour` timestamp
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkAParser;

impl NetworkAParser {
    pub fn new() -> Self {
        Self
    }
}

impl RawDeliveryDataParser for NetworkAParser {
    fn network(&self) -> DeliveryNetwork {
        DeliveryNetwork::NetworkA
    }

    fn parse_raw_records(&self, raw: &str) -> ParseResult<Vec<RawDeliveryRecord>> {
        parse_report(raw, COLUMNS, REQUIRED, parse_hour)
    }
}

fn parse_hour(row: &Row<'_>) -> ParseResult<DateTime<Utc>> {
    let value = row.required(Field::Hour)?;

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(utc_hour_bucket(parsed.with_timezone(&Utc)));
    }

    HOUR_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| utc_hour_bucket(naive.and_utc()))
        .ok_or_else(|| row.invalid(Field::Hour, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::parser::ParseError;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    const HEADER: &str = "campaign_id,hour,campaign_code,imps,ecpm,spend,clicks";

    #[test]
    fn test_parse_single_record() {
        let raw = format!("{HEADER}\n1,2012-03-16 15:00,00000000000000000000000000000001,123,1.30,304.32,27");
        let records = NetworkAParser.parse_raw_records(&raw).unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.campaign_id, "1");
        assert_eq!(record.hour, Utc.with_ymd_and_hms(2012, 3, 16, 15, 0, 0).unwrap());
        assert_eq!(record.allocation_id, "00000000000000000000000000000001");
        assert_eq!(record.impressions, 123);
        assert_eq!(record.ecpm, Decimal::new(130, 2));
        assert_eq!(record.spend, Decimal::new(30432, 2));
        assert_eq!(record.clicks, Decimal::from(27));
    }

    #[test]
    fn test_parse_strips_deletion_suffix() {
        let raw = format!(
            "{HEADER}\n1,2012-03-16 15:00,127660c476c44f4a9ad94ad177079e5b_DLTD_1332465452,1,0,0,0"
        );
        let records = NetworkAParser.parse_raw_records(&raw).unwrap();
        assert_eq!(records[0].allocation_id, "127660c476c44f4a9ad94ad177079e5b");
    }

    #[test]
    fn test_parse_blank_numeric_fields_default_to_zero() {
        let raw = format!("{HEADER}\n1,2012-03-16 15:00,node,,,,");
        let records = NetworkAParser.parse_raw_records(&raw).unwrap();

        assert_eq!(records[0].impressions, 0);
        assert_eq!(records[0].ecpm, Decimal::ZERO);
        assert_eq!(records[0].spend, Decimal::ZERO);
        assert_eq!(records[0].clicks, Decimal::ZERO);
    }

    #[test]
    fn test_parse_blank_required_field_fails_batch() {
        for row in [
            "1,2012-03-16 15:00,,1,1,1,1",
            ",2012-03-16 15:00,node,1,1,1,1",
            "1,,node,1,1,1,1",
        ] {
            let raw = format!("{HEADER}\n1,2012-03-16 14:00,good,1,1,1,1\n{row}");
            let result = NetworkAParser.parse_raw_records(&raw);
            assert!(
                matches!(result, Err(ParseError::MissingField { .. })),
                "row `{row}` should fail the batch"
            );
        }
    }

    #[test]
    fn test_parse_non_coercible_value_fails_batch() {
        let raw = format!("{HEADER}\n1,2012-03-16 15:00,node,lots,1,1,1");
        assert!(matches!(
            NetworkAParser.parse_raw_records(&raw),
            Err(ParseError::InvalidValue { field: "impressions", .. })
        ));

        let raw = format!("{HEADER}\n1,2012-03-16 15:00,node,1,1,-4.00,1");
        assert!(NetworkAParser.parse_raw_records(&raw).is_err());

        let raw = format!("{HEADER}\n1,noon,node,1,1,1,1");
        assert!(matches!(
            NetworkAParser.parse_raw_records(&raw),
            Err(ParseError::InvalidValue { field: "hour", .. })
        ));
    }

    #[test]
    fn test_parse_header_is_case_insensitive_and_trimmed() {
        let raw = " Campaign_ID , HOUR ,campaign_code, Imps ,eCPM,spend,clicks,extra\n\
                   7,2012-03-16 15:42:10,node,5,1,2,0,ignored";
        let records = NetworkAParser.parse_raw_records(raw).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].campaign_id, "7");
        assert_eq!(records[0].impressions, 5);
        assert_eq!(records[0].hour, Utc.with_ymd_and_hms(2012, 3, 16, 15, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_skips_blank_lines_and_repeated_headers() {
        let raw = format!(
            "\n\n{HEADER}\n1,2012-03-16 15:00,node,1,0,0,0\n\n{HEADER}\n1,2012-03-16 16:00,node,2,0,0,0\n"
        );
        let records = NetworkAParser.parse_raw_records(&raw).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].impressions, 2);
    }

    #[test]
    fn test_parse_empty_input_is_empty_success() {
        assert!(NetworkAParser.parse_raw_records("").unwrap().is_empty());
        assert!(NetworkAParser.parse_raw_records("\n  \n").unwrap().is_empty());
        assert!(NetworkAParser.parse_raw_records(HEADER).unwrap().is_empty());
    }

    #[test]
    fn test_parse_header_without_required_column_fails() {
        let raw = "campaign_id,imps\n1,5";
        assert!(matches!(
            NetworkAParser.parse_raw_records(raw),
            Err(ParseError::MissingColumn { column: "hour" })
        ));
    }

    #[test]
    fn test_parse_rfc3339_hour_is_normalized_to_utc() {
        let raw = format!("{HEADER}\n1,2012-03-16T17:30:00+02:00,node,1,0,0,0");
        let records = NetworkAParser.parse_raw_records(&raw).unwrap();
        assert_eq!(records[0].hour, Utc.with_ymd_and_hms(2012, 3, 16, 15, 0, 0).unwrap());
    }
}
