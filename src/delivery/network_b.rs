use chrono::{DateTime, NaiveDate, Utc};

use crate::delivery::parser::{
    parse_report, ColumnTable, Field, ParseResult, RawDeliveryDataParser, Row,
};
use crate::models::{DeliveryNetwork, RawDeliveryRecord};

const COLUMNS: ColumnTable = &[
    ("dimension.line_item_id", Field::CampaignId),
    ("dimension.date", Field::Date),
    ("dimension.hour", Field::HourOfDay),
    ("dimensionattribute.line_item_external_id", Field::AllocationId),
    ("column.ad_server_impressions", Field::Impressions),
    ("column.ad_server_average_ecpm", Field::Ecpm),
    ("column.ad_server_cpm_and_cpc_revenue", Field::Spend),
    ("column.ad_server_clicks", Field::Clicks),
];

const REQUIRED: &[Field] = &[
    Field::CampaignId,
    Field::Date,
    Field::HourOfDay,
    Field::AllocationId,
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d"];

/// Parser for network B reports, which split the hour into a date column and
/// an hour-of-day column
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkBParser;

impl NetworkBParser {
    pub fn new() -> Self {
        Self
    }
}

impl RawDeliveryDataParser for NetworkBParser {
    fn network(&self) -> DeliveryNetwork {
        DeliveryNetwork::NetworkB
    }

    fn parse_raw_records(&self, raw: &str) -> ParseResult<Vec<RawDeliveryRecord>> {
        parse_report(raw, COLUMNS, REQUIRED, parse_hour)
    }
}

fn parse_hour(row: &Row<'_>) -> ParseResult<DateTime<Utc>> {
    let date_value = row.required(Field::Date)?;
    let hour_value = row.required(Field::HourOfDay)?;

    let date = DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(date_value, format).ok())
        .ok_or_else(|| row.invalid(Field::Date, date_value))?;

    let hour = hour_value
        .parse::<u32>()
        .map_err(|_| row.invalid(Field::HourOfDay, hour_value))?;

    date.and_hms_opt(hour, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| row.invalid(Field::HourOfDay, hour_value))
}
