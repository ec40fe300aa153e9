//! Shared machinery for the network report parsers
//!
//! Every network dialect is a flat CSV with a header row. The parsers differ
//! only in their column table and in how the hour is represented, so the row
//! handling lives here and each dialect supplies those two pieces.

use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::models::{DeliveryNetwork, RawDeliveryRecord};

/// Marker networks append to the node key of deleted line items,
/// followed by the deletion time (e.g. `<key>_DLTD_1332465452`).
pub const DELETION_MARKER: &str = "_DLTD_";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("report header is missing required column `{column}`")]
    MissingColumn { column: &'static str },
    #[error("line {line}: required field `{field}` is blank")]
    MissingField { line: u64, field: &'static str },
    #[error("line {line}: `{value}` is not a valid {field}")]
    InvalidValue {
        line: u64,
        field: &'static str,
        value: String,
    },
    #[error("malformed report: {0}")]
    Csv(#[from] csv::Error),
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Converts the raw text of one delivery report into canonical records.
///
/// Parsing is all-or-nothing: a single bad row fails the whole batch.
pub trait RawDeliveryDataParser: Send + Sync {
    fn network(&self) -> DeliveryNetwork;

    fn parse_raw_records(&self, raw: &str) -> ParseResult<Vec<RawDeliveryRecord>>;
}

/// Canonical fields a report column can map to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Field {
    CampaignId,
    Hour,
    Date,
    HourOfDay,
    AllocationId,
    Impressions,
    Ecpm,
    Spend,
    Clicks,
}

impl Field {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Field::CampaignId => "campaign id",
            Field::Hour => "hour",
            Field::Date => "date",
            Field::HourOfDay => "hour of day",
            Field::AllocationId => "node id",
            Field::Impressions => "impressions",
            Field::Ecpm => "ecpm",
            Field::Spend => "spend",
            Field::Clicks => "clicks",
        }
    }
}

/// Column name (lowercase) to canonical field
pub(crate) type ColumnTable = &'static [(&'static str, Field)];

/// One data row with its header mapping
pub(crate) struct Row<'a> {
    line: u64,
    record: &'a StringRecord,
    columns: &'a HashMap<Field, usize>,
}

impl<'a> Row<'a> {
    pub(crate) fn line(&self) -> u64 {
        self.line
    }

    /// Trimmed value of a column, `None` when the column is absent or blank
    pub(crate) fn optional(&self, field: Field) -> Option<&'a str> {
        self.columns
            .get(&field)
            .and_then(|&idx| self.record.get(idx))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub(crate) fn required(&self, field: Field) -> ParseResult<&'a str> {
        self.optional(field).ok_or(ParseError::MissingField {
            line: self.line,
            field: field.name(),
        })
    }

    pub(crate) fn invalid(&self, field: Field, value: &str) -> ParseError {
        ParseError::InvalidValue {
            line: self.line,
            field: field.name(),
            value: value.to_string(),
        }
    }

    fn count(&self, field: Field) -> ParseResult<u64> {
        match self.optional(field) {
            None => Ok(0),
            Some(value) => value.parse::<u64>().map_err(|_| self.invalid(field, value)),
        }
    }

    fn amount(&self, field: Field) -> ParseResult<Decimal> {
        let Some(value) = self.optional(field) else {
            return Ok(Decimal::ZERO);
        };

        let parsed = Decimal::from_str(value)
            .or_else(|_| Decimal::from_scientific(value))
            .map_err(|_| self.invalid(field, value))?;

        if parsed.is_sign_negative() && !parsed.is_zero() {
            return Err(self.invalid(field, value));
        }
        Ok(parsed)
    }
}

/// Strip a deletion suffix from a node key
pub fn strip_node_suffix(raw: &str) -> &str {
    match raw.find(DELETION_MARKER) {
        Some(idx) => &raw[..idx],
        None => raw,
    }
}

fn normalized_cells(record: &StringRecord) -> Vec<String> {
    record.iter().map(|cell| cell.trim().to_lowercase()).collect()
}

fn is_blank(record: &StringRecord) -> bool {
    record.iter().all(|cell| cell.trim().is_empty())
}

/// Parse a report using a dialect's column table, required fields and hour rule
pub(crate) fn parse_report<F>(
    raw: &str,
    table: ColumnTable,
    required: &[Field],
    hour: F,
) -> ParseResult<Vec<RawDeliveryRecord>>
where
    F: Fn(&Row<'_>) -> ParseResult<DateTime<Utc>>,
{
    let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(raw.as_bytes());

    let mut header: Option<(Vec<String>, HashMap<Field, usize>)> = None;
    let mut records = Vec::new();
    let mut repeated_headers = 0usize;

    for (idx, result) in reader.records().enumerate() {
        let record = result?;
        if is_blank(&record) {
            continue;
        }

        let Some((header_cells, columns)) = header.as_ref() else {
            let cells = normalized_cells(&record);
            let columns = map_columns(&cells, table);
            for field in required {
                if !columns.contains_key(field) {
                    return Err(ParseError::MissingColumn {
                        column: column_name(table, *field),
                    });
                }
            }
            header = Some((cells, columns));
            continue;
        };

        if &normalized_cells(&record) == header_cells {
            repeated_headers += 1;
            continue;
        }

        let line = record
            .position()
            .map(|pos| pos.line())
            .unwrap_or(idx as u64 + 1);
        let row = Row {
            line,
            record: &record,
            columns,
        };
        records.push(build_record(&row, &hour)?);
    }

    if repeated_headers > 0 {
        debug!("Skipped {} repeated header rows", repeated_headers);
    }

    Ok(records)
}

fn build_record<F>(row: &Row<'_>, hour: &F) -> ParseResult<RawDeliveryRecord>
where
    F: Fn(&Row<'_>) -> ParseResult<DateTime<Utc>>,
{
    let allocation_id = strip_node_suffix(row.required(Field::AllocationId)?);
    if allocation_id.is_empty() {
        return Err(ParseError::MissingField {
            line: row.line(),
            field: Field::AllocationId.name(),
        });
    }

    Ok(RawDeliveryRecord {
        campaign_id: row.required(Field::CampaignId)?.to_string(),
        hour: hour(row)?,
        allocation_id: allocation_id.to_string(),
        impressions: row.count(Field::Impressions)?,
        ecpm: row.amount(Field::Ecpm)?,
        spend: row.amount(Field::Spend)?,
        clicks: row.amount(Field::Clicks)?,
    })
}

fn map_columns(cells: &[String], table: ColumnTable) -> HashMap<Field, usize> {
    let mut columns = HashMap::new();
    for (idx, cell) in cells.iter().enumerate() {
        if let Some((_, field)) = table.iter().find(|(name, _)| name == cell) {
            columns.entry(*field).or_insert(idx);
        }
    }
    columns
}

fn column_name(table: ColumnTable, field: Field) -> &'static str {
    table
        .iter()
        .find(|(_, candidate)| *candidate == field)
        .map(|(name, _)| *name)
        .unwrap_or_else(|| field.name())
}
